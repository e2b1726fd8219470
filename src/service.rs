/// Engine composition root
///
/// Wires together the stores, the flow registry, the flow engine, the
/// scheduler and the trigger service, and exposes the read/mutate surface a
/// web layer consumes.
use crate::{
    config::Config,
    error::{FlowyError, Result},
    runtime::{AdhocHandle, JobStatus, SchedulerService, TriggerService},
    store::{
        DatabaseManager, DefinitionStore, Flow, FlowHistory, FlowStatistics, FlowStatus, HistoryStore,
        MigrationManager, MigrationRecord, MigrationReport, Page, Remark, RemarkLevel, TaskHistory,
    },
    workflow::{ExecutionLogs, FlowDefinition, FlowEngine, FlowMetadata, FlowOutcome, FlowRegistry},
};
use chrono::Utc;
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;

/// One execution with everything a detail view shows
#[derive(Debug, Clone, Serialize)]
pub struct HistoryDetail {
    pub history: FlowHistory,
    pub tasks: Vec<TaskHistory>,
    pub flow: Option<Flow>,
}

/// A running engine instance
///
/// Several instances may coexist in one process as long as they point at
/// different data directories.
#[derive(Clone)]
pub struct Flowy {
    config: Config,
    databases: Arc<DatabaseManager>,
    definitions: DefinitionStore,
    history: HistoryStore,
    engine: FlowEngine,
    scheduler: SchedulerService,
    triggers: TriggerService,
    migration_report: Arc<MigrationReport>,
}

impl Flowy {
    /// Open (and migrate) the stores and build every component
    ///
    /// The scheduler is not started; call [`Flowy::start`] for cron triggers
    /// to fire. Ad-hoc runs start it on demand.
    pub async fn open(config: Config) -> Result<Self> {
        tracing::info!("🏗️ Opening flowy engine under {}", config.storage.data_dir);
        let (databases, migration_report) = DatabaseManager::open(&config.storage).await?;
        if !migration_report.applied.is_empty() {
            tracing::info!("📦 Applied migrations: {}", migration_report.applied.join(", "));
        }

        let definitions = DefinitionStore::new(databases.definitions_pool().clone());
        let history = HistoryStore::new(databases.history_pool().clone());

        tracing::info!("📊 Initializing flow registry");
        let registry = Arc::new(FlowRegistry::new());
        let logs = ExecutionLogs::new(config.storage.log_dir());
        let engine = FlowEngine::new(registry, definitions.clone(), history.clone(), logs);

        tracing::info!("⏰ Initializing scheduler service");
        let scheduler = SchedulerService::new(config.scheduler.clone(), engine.clone(), definitions.clone());
        let triggers = TriggerService::new(definitions.clone(), scheduler.clone());

        Ok(Self {
            config,
            databases: Arc::new(databases),
            definitions,
            history,
            engine,
            scheduler,
            triggers,
            migration_report: Arc::new(migration_report),
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn engine(&self) -> &FlowEngine {
        &self.engine
    }

    pub fn scheduler(&self) -> &SchedulerService {
        &self.scheduler
    }

    pub fn triggers(&self) -> &TriggerService {
        &self.triggers
    }

    pub fn definition_store(&self) -> &DefinitionStore {
        &self.definitions
    }

    pub fn history_store(&self) -> &HistoryStore {
        &self.history
    }

    pub fn logs(&self) -> &ExecutionLogs {
        self.engine.logs()
    }

    /// Report of the migration batch run while opening
    pub fn migration_report(&self) -> &MigrationReport {
        &self.migration_report
    }

    /// Register (or redefine) a flow
    pub async fn define(&self, definition: FlowDefinition) -> Result<Flow> {
        let flow = self.engine.define(definition).await?;
        tracing::info!("📋 Flow defined: {} ({})", flow.id, flow.name);
        Ok(flow)
    }

    /// Run a flow in the caller's task, recorded as a manual execution
    pub async fn run(&self, flow_id: &str, args: Value) -> Result<FlowOutcome> {
        self.engine.invoke(flow_id, args, FlowMetadata::manual()).await
    }

    /// Queue a one-off run through the scheduler
    pub async fn schedule_now(&self, flow_id: &str, input: Value, delay: Option<Duration>) -> Result<AdhocHandle> {
        self.scheduler.schedule_now(flow_id, input, delay).await
    }

    pub async fn start(&self) -> Result<()> {
        self.scheduler.start().await
    }

    /// Stop the scheduler and close both stores
    pub async fn shutdown(&self) -> Result<()> {
        self.scheduler.stop().await?;
        self.databases.close().await;
        tracing::info!("👋 Flowy engine shut down");
        Ok(())
    }

    // ---- flows --------------------------------------------------------------

    pub async fn list_flows(&self, page: u32, per_page: u32, search: Option<&str>) -> Result<Page<Flow>> {
        self.definitions.list_flows(page, per_page, search).await
    }

    pub async fn get_flow(&self, flow_id: &str) -> Result<Option<Flow>> {
        self.definitions.get_flow(flow_id).await
    }

    pub async fn flow_statistics(&self, flow_id: &str) -> Result<FlowStatistics> {
        self.history.flow_statistics(flow_id).await
    }

    // ---- history ------------------------------------------------------------

    /// Executions newest first, per flow or global, optionally by status
    pub async fn flow_history(
        &self,
        flow_id: Option<&str>,
        status: Option<FlowStatus>,
        page: u32,
        per_page: u32,
    ) -> Result<Page<FlowHistory>> {
        self.history.list_flow_history(flow_id, status, page, per_page).await
    }

    pub async fn task_histories(&self, flow_history_id: i64) -> Result<Vec<TaskHistory>> {
        self.history.list_task_histories(flow_history_id).await
    }

    pub async fn history_detail(&self, flow_history_id: i64) -> Result<Option<HistoryDetail>> {
        let Some(history) = self.history.get_flow_history(flow_history_id).await? else {
            return Ok(None);
        };
        let tasks = self.history.list_task_histories(flow_history_id).await?;
        let flow = self.definitions.get_flow(&history.flow_id).await?;
        Ok(Some(HistoryDetail { history, tasks, flow }))
    }

    /// Delete one execution, its tasks and its log file
    pub async fn delete_history(&self, flow_history_id: i64) -> Result<()> {
        if !self.history.delete_flow_history(flow_history_id).await? {
            return Err(FlowyError::not_found("flow history", flow_history_id));
        }
        self.remove_log(flow_history_id).await;
        Ok(())
    }

    /// Delete several executions in one transaction; returns rows removed
    pub async fn delete_histories(&self, ids: &[i64]) -> Result<u64> {
        let deleted = self.history.delete_flow_histories(ids).await?;
        for id in ids {
            self.remove_log(*id).await;
        }
        tracing::info!("🗑️ Deleted {} flow history row(s)", deleted);
        Ok(deleted)
    }

    async fn remove_log(&self, flow_history_id: i64) {
        let logs = self.engine.logs();
        logs.release(flow_history_id).await;
        let path = logs.path_for(flow_history_id);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => {}
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => tracing::warn!("⚠️ Could not remove log {}: {}", path.display(), err),
        }
    }

    pub async fn running_count(&self) -> Result<i64> {
        self.history.running_count().await
    }

    // ---- remarks and logs ---------------------------------------------------

    /// Append a remark to an execution from outside the flow
    pub async fn add_remark(&self, flow_history_id: i64, level: RemarkLevel, message: impl Into<String>) -> Result<()> {
        let message = message.into();
        if message.trim().is_empty() {
            return Err(FlowyError::validation("remark message must not be empty"));
        }
        let remark = Remark {
            level,
            message,
            created_at: Utc::now(),
        };
        if !self.history.append_remark(flow_history_id, &remark).await? {
            return Err(FlowyError::not_found("flow history", flow_history_id));
        }
        Ok(())
    }

    pub async fn remarks(&self, flow_history_id: i64) -> Result<Vec<Remark>> {
        self.history.list_remarks(flow_history_id).await
    }

    /// Full text of an execution's log file, if it has one
    pub async fn read_execution_log(&self, flow_history_id: i64) -> Result<Option<String>> {
        Ok(self.engine.logs().read(flow_history_id).await?)
    }

    // ---- scheduler and migrations -------------------------------------------

    pub async fn job_status(&self, job_id: &str) -> Option<JobStatus> {
        self.scheduler.job_status(job_id).await
    }

    /// Ledger of applied history-store migrations
    pub async fn migration_history(&self) -> Result<Vec<MigrationRecord>> {
        MigrationManager::new(self.config.storage.history_db_path(), self.config.storage.backup_dir())
            .history()
            .await
    }
}
