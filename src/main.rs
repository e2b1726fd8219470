/// Flowy demo binary
///
/// Defines two small flows, attaches a cron trigger to one of them, queues an
/// ad-hoc run of the other and keeps the scheduler running until Ctrl-C.
use flowy::{config::Config, log, remark, set_progress, task, FlowDefinition, Flowy, NewTrigger};
use serde::{Deserialize, Serialize};
use serde_json::json;

#[derive(Debug, Deserialize)]
struct ReportArgs {
    #[serde(default = "default_rows")]
    rows: u32,
}

fn default_rows() -> u32 {
    100
}

#[derive(Debug, Serialize)]
struct Report {
    rows: u32,
    total: u64,
}

async fn build_report(args: ReportArgs) -> anyhow::Result<Report> {
    log::info(format!("building report over {} rows", args.rows)).await;

    let values = task("load", args.rows, |rows| async move {
        let mut values = Vec::with_capacity(rows as usize);
        for i in 0..rows {
            values.push(u64::from(i));
            if i % 25 == 0 {
                set_progress(i64::from(i * 100 / rows.max(1)), Some("loading")).await;
            }
        }
        set_progress(100, Some("loaded")).await;
        Ok(values)
    })
    .await?;

    let total = task("sum", values, |values| async move { Ok(values.iter().sum::<u64>()) }).await?;
    if total == 0 {
        remark::add_warning("report is empty").await;
    }
    Ok(Report { rows: args.rows, total })
}

async fn heartbeat(_: serde_json::Value) -> anyhow::Result<String> {
    log::info("heartbeat").await;
    Ok(chrono::Utc::now().to_rfc3339())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_target(false)
        .with_thread_ids(true)
        .with_level(true)
        .init();

    tracing::info!("Starting flowy demo...");
    let config = Config::default();
    let flowy = Flowy::open(config).await?;

    flowy
        .define(FlowDefinition::new("report", "Build report", build_report).with_description("Sums a range of rows"))
        .await?;
    flowy
        .define(FlowDefinition::new("heartbeat", "Heartbeat", heartbeat))
        .await?;

    if flowy.triggers().list_triggers_for_flow("heartbeat").await?.is_empty() {
        flowy
            .triggers()
            .create_trigger(NewTrigger::new("heartbeat", "every minute", "* * * * *"))
            .await?;
    }

    flowy.start().await?;
    let handle = flowy.schedule_now("report", json!({ "rows": 250 }), None).await?;
    tracing::info!("Queued {} (history {})", handle.job_id, handle.flow_history_id);

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutting down...");
    flowy.shutdown().await?;
    Ok(())
}
