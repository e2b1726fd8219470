/// Task engine
///
/// `task` runs a unit of work inside a flow and records it as a TaskHistory
/// row of the ambient flow execution. Outside a flow it just runs the body.
use crate::store::TaskStatus;
use crate::workflow::{
    context,
    flow::{error_payload, panic_message},
};
use chrono::Utc;
use futures::FutureExt;
use serde::Serialize;
use serde_json::json;
use std::{future::Future, panic::AssertUnwindSafe};

/// Run `body(input)` as a tracked task named `name`
///
/// The row is created before the body starts and finalized after it ends.
/// Inside the body, `set_progress` addresses this task. A body error is
/// recorded and returned; a panic is recorded and returned as an error.
///
/// ```ignore
/// let rows = task("load", path, |path| async move { load(&path).await }).await?;
/// ```
pub async fn task<I, O, F, Fut>(name: &str, input: I, body: F) -> anyhow::Result<O>
where
    I: Serialize,
    O: Serialize,
    F: FnOnce(I) -> Fut,
    Fut: Future<Output = anyhow::Result<O>>,
{
    let Some(ctx) = context::current() else {
        return body(input).await;
    };

    let input_json = serde_json::to_value(&input).unwrap_or_else(|err| {
        tracing::warn!("⚠️ Input of task {} could not be serialized: {}", name, err);
        json!({ "error": "input could not be serialized", "type": std::any::type_name::<I>() })
    });

    let task_id = match ctx
        .history
        .create_task_history(ctx.flow_history_id, name, Some(&input_json), Utc::now())
        .await
    {
        Ok(id) => id,
        Err(err) => {
            // Still run the body; only the record is lost
            tracing::error!("❌ Failed to create task history for {}: {}", name, err);
            return body(input).await;
        }
    };

    tracing::debug!("🔧 Task {} started (task {}, flow history {})", name, task_id, ctx.flow_history_id);
    log_line(&ctx, "INFO", &format!("task {} start", name)).await;

    let task_ctx = ctx.for_task(task_id);
    let result = context::scope(task_ctx, AssertUnwindSafe(body(input)).catch_unwind()).await;

    let result = match result {
        Ok(result) => result,
        Err(panic) => Err(anyhow::anyhow!("task {} panicked: {}", name, panic_message(panic.as_ref()))),
    };

    let (status, output) = match &result {
        Ok(value) => match serde_json::to_value(value) {
            Ok(value) => (TaskStatus::Completed, json!({ "result": value })),
            Err(err) => {
                tracing::warn!("⚠️ Output of task {} could not be serialized: {}", name, err);
                (
                    TaskStatus::CompletedWithSerializationError,
                    json!({
                        "error": "output could not be serialized",
                        "serialize_error": err.to_string(),
                        "result_type": std::any::type_name::<O>(),
                    }),
                )
            }
        },
        Err(err) => {
            log_line(&ctx, "ERROR", &format!("{:?}", err)).await;
            (TaskStatus::Failed, error_payload("Error", err))
        }
    };

    if let Err(err) = ctx
        .history
        .finalize_task_history(task_id, status, &output, Utc::now())
        .await
    {
        tracing::error!("❌ Failed to finalize task history {}: {}", task_id, err);
    }
    log_line(&ctx, "INFO", &format!("task {} end", name)).await;

    result
}

async fn log_line(ctx: &context::ExecutionContext, level: &str, message: &str) {
    if let Err(err) = ctx.logs.append_if_open(ctx.flow_history_id, level, message).await {
        tracing::warn!("⚠️ Failed to write execution log {}: {}", ctx.flow_history_id, err);
    }
}
