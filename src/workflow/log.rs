/// Per-execution log files
///
/// Each flow execution gets `log/flow-history-<id>.log`. The flow engine opens
/// the handle with its first line and releases it on every exit path; lines
/// written through the execution context only go to a handle that is open.
use crate::workflow::context;
use chrono::Utc;
use std::{
    collections::HashMap,
    io,
    path::{Path, PathBuf},
    sync::Arc,
    time::SystemTime,
};
use tokio::{fs, io::AsyncWriteExt, sync::Mutex};

/// Registry of open execution-log handles
#[derive(Debug, Clone)]
pub struct ExecutionLogs {
    inner: Arc<LogsInner>,
}

#[derive(Debug)]
struct LogsInner {
    dir: PathBuf,
    // Outer lock guards the map only; each file has its own lock for writes
    open: Mutex<HashMap<i64, Arc<Mutex<fs::File>>>>,
}

/// Outcome of one log purge
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LogPurgeReport {
    pub deleted: usize,
    pub failed: usize,
}

impl ExecutionLogs {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            inner: Arc::new(LogsInner {
                dir: dir.into(),
                open: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.inner.dir
    }

    pub fn path_for(&self, flow_history_id: i64) -> PathBuf {
        self.inner.dir.join(file_name(flow_history_id))
    }

    /// Append one timestamped line to an execution's log, opening it if needed
    pub async fn append(&self, flow_history_id: i64, level: &str, message: &str) -> io::Result<()> {
        let file = self.handle(flow_history_id).await?;
        write_line(&file, level, message).await
    }

    /// Append only while the execution's handle is open
    ///
    /// Lines from work that outlives its flow invocation are dropped rather
    /// than reopening a handle nothing would release. Returns whether the
    /// line was written.
    pub async fn append_if_open(&self, flow_history_id: i64, level: &str, message: &str) -> io::Result<bool> {
        let file = self.inner.open.lock().await.get(&flow_history_id).cloned();
        let Some(file) = file else {
            return Ok(false);
        };
        write_line(&file, level, message).await?;
        Ok(true)
    }

    /// Close the handle for an execution; returns whether one was open
    pub async fn release(&self, flow_history_id: i64) -> bool {
        let handle = self.inner.open.lock().await.remove(&flow_history_id);
        match handle {
            Some(file) => {
                let mut file = file.lock().await;
                if let Err(err) = file.flush().await {
                    tracing::warn!("⚠️ Failed to flush log of flow history {}: {}", flow_history_id, err);
                }
                true
            }
            None => false,
        }
    }

    /// Number of handles currently held open
    pub async fn open_count(&self) -> usize {
        self.inner.open.lock().await.len()
    }

    /// Full log text of an execution, or None if nothing was logged
    pub async fn read(&self, flow_history_id: i64) -> io::Result<Option<String>> {
        match fs::read_to_string(self.path_for(flow_history_id)).await {
            Ok(text) => Ok(Some(text)),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err),
        }
    }

    /// Delete execution logs last modified before `cutoff`
    ///
    /// Files with an open handle are skipped; individual delete failures are
    /// logged and counted, never fatal.
    pub async fn purge_older_than(&self, cutoff: SystemTime) -> io::Result<LogPurgeReport> {
        let mut report = LogPurgeReport::default();
        let mut entries = match fs::read_dir(&self.inner.dir).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(report),
            Err(err) => return Err(err),
        };

        let open: Vec<i64> = self.inner.open.lock().await.keys().copied().collect();
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            let Some(id) = name.to_str().and_then(parse_file_name) else {
                continue;
            };
            if open.contains(&id) {
                continue;
            }

            let modified = match entry.metadata().await.and_then(|m| m.modified()) {
                Ok(modified) => modified,
                Err(err) => {
                    tracing::warn!("⚠️ Cannot stat {}: {}", entry.path().display(), err);
                    report.failed += 1;
                    continue;
                }
            };
            if modified >= cutoff {
                continue;
            }

            match fs::remove_file(entry.path()).await {
                Ok(()) => report.deleted += 1,
                Err(err) => {
                    tracing::warn!("⚠️ Failed to delete {}: {}", entry.path().display(), err);
                    report.failed += 1;
                }
            }
        }
        Ok(report)
    }

    async fn handle(&self, flow_history_id: i64) -> io::Result<Arc<Mutex<fs::File>>> {
        let mut open = self.inner.open.lock().await;
        if let Some(file) = open.get(&flow_history_id) {
            return Ok(file.clone());
        }

        fs::create_dir_all(&self.inner.dir).await?;
        let file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.path_for(flow_history_id))
            .await?;
        let file = Arc::new(Mutex::new(file));
        open.insert(flow_history_id, file.clone());
        Ok(file)
    }
}

async fn write_line(file: &Mutex<fs::File>, level: &str, message: &str) -> io::Result<()> {
    let line = format!(
        "{} [{}] {}\n",
        Utc::now().format("%Y-%m-%d %H:%M:%S%.3f"),
        level,
        message
    );
    let mut file = file.lock().await;
    file.write_all(line.as_bytes()).await?;
    file.flush().await
}

fn file_name(flow_history_id: i64) -> String {
    format!("flow-history-{}.log", flow_history_id)
}

fn parse_file_name(name: &str) -> Option<i64> {
    name.strip_prefix("flow-history-")?
        .strip_suffix(".log")?
        .parse()
        .ok()
}

async fn write(level: &str, message: &str) {
    let Some(ctx) = context::current() else {
        return;
    };
    match ctx.logs.append_if_open(ctx.flow_history_id, level, message).await {
        Ok(true) => {}
        Ok(false) => tracing::debug!("📝 Execution log {} already closed, line dropped", ctx.flow_history_id),
        Err(err) => tracing::warn!("⚠️ Failed to write execution log {}: {}", ctx.flow_history_id, err),
    }
}

/// Log an info line to the current execution's log and to tracing
pub async fn info(message: impl AsRef<str>) {
    let message = message.as_ref();
    tracing::info!(flow_history_id = context::current_flow_history_id(), "{}", message);
    write("INFO", message).await;
}

pub async fn warn(message: impl AsRef<str>) {
    let message = message.as_ref();
    tracing::warn!(flow_history_id = context::current_flow_history_id(), "{}", message);
    write("WARNING", message).await;
}

pub async fn error(message: impl AsRef<str>) {
    let message = message.as_ref();
    tracing::error!(flow_history_id = context::current_flow_history_id(), "{}", message);
    write("ERROR", message).await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_names_round_trip() {
        assert_eq!(file_name(42), "flow-history-42.log");
        assert_eq!(parse_file_name("flow-history-42.log"), Some(42));
        assert_eq!(parse_file_name("flow-history-x.log"), None);
        assert_eq!(parse_file_name("other.log"), None);
    }

    #[tokio::test]
    async fn append_then_release() {
        let dir = tempfile::tempdir().unwrap();
        let logs = ExecutionLogs::new(dir.path().join("log"));

        logs.append(7, "INFO", "hello").await.unwrap();
        logs.append(7, "ERROR", "boom").await.unwrap();
        assert_eq!(logs.open_count().await, 1);

        assert!(logs.release(7).await);
        assert!(!logs.release(7).await);
        assert_eq!(logs.open_count().await, 0);

        let text = logs.read(7).await.unwrap().unwrap();
        assert!(text.contains("[INFO] hello"));
        assert!(text.contains("[ERROR] boom"));
        assert_eq!(logs.read(8).await.unwrap(), None);
    }

    #[tokio::test]
    async fn append_if_open_never_reopens() {
        let dir = tempfile::tempdir().unwrap();
        let logs = ExecutionLogs::new(dir.path());

        assert!(!logs.append_if_open(3, "INFO", "too early").await.unwrap());
        assert_eq!(logs.read(3).await.unwrap(), None);

        logs.append(3, "INFO", "start").await.unwrap();
        assert!(logs.append_if_open(3, "INFO", "during").await.unwrap());
        logs.release(3).await;

        assert!(!logs.append_if_open(3, "INFO", "too late").await.unwrap());
        assert_eq!(logs.open_count().await, 0);
        let text = logs.read(3).await.unwrap().unwrap();
        assert!(text.contains("during"));
        assert!(!text.contains("too late"));
    }

    #[tokio::test]
    async fn purge_skips_open_handles() {
        let dir = tempfile::tempdir().unwrap();
        let logs = ExecutionLogs::new(dir.path());
        logs.append(1, "INFO", "old").await.unwrap();
        logs.release(1).await;
        logs.append(2, "INFO", "still open").await.unwrap();

        let cutoff = SystemTime::now() + std::time::Duration::from_secs(60);
        let report = logs.purge_older_than(cutoff).await.unwrap();
        assert_eq!(report, LogPurgeReport { deleted: 1, failed: 0 });
        assert!(logs.read(1).await.unwrap().is_none());
        assert!(logs.read(2).await.unwrap().is_some());
    }
}
