/// Task progress reporting
use crate::workflow::context;
use chrono::Utc;

/// Record progress (0-100) on the task currently running
///
/// Returns false, without touching the store, when the value is out of range
/// or no task is bound. Also false if the task row is no longer running.
pub async fn set_progress(progress: i64, message: Option<&str>) -> bool {
    let Ok(progress) = u8::try_from(progress) else {
        tracing::warn!("⚠️ Progress {} rejected: must be between 0 and 100", progress);
        return false;
    };
    if progress > 100 {
        tracing::warn!("⚠️ Progress {} rejected: must be between 0 and 100", progress);
        return false;
    }

    let Some(ctx) = context::current() else {
        tracing::debug!("set_progress called outside a flow");
        return false;
    };
    let Some(task_id) = ctx.task_history_id else {
        tracing::debug!("set_progress called outside a task (flow history {})", ctx.flow_history_id);
        return false;
    };

    match ctx
        .history
        .update_task_progress(task_id, progress, message, Utc::now())
        .await
    {
        Ok(updated) => updated,
        Err(err) => {
            tracing::error!("❌ Failed to record progress for task {}: {}", task_id, err);
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn rejected_without_context_or_in_range() {
        assert!(!set_progress(150, Some("x")).await);
        assert!(!set_progress(-1, None).await);
        assert!(!set_progress(50, Some("x")).await);
    }
}
