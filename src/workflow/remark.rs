/// Remarks on the running flow execution
///
/// Remarks are short notes stored in the execution's `flow_metadata.remarks`
/// list, shown alongside the history row.
use crate::store::{Remark, RemarkLevel};
use crate::workflow::context;
use chrono::Utc;

/// Append a remark to the current flow execution
///
/// Returns false outside a flow or if the store update failed.
pub async fn add(level: RemarkLevel, message: impl Into<String>) -> bool {
    let Some(ctx) = context::current() else {
        tracing::debug!("remark added outside a flow, ignored");
        return false;
    };
    let remark = Remark {
        level,
        message: message.into(),
        created_at: Utc::now(),
    };
    match ctx.history.append_remark(ctx.flow_history_id, &remark).await {
        Ok(added) => added,
        Err(err) => {
            tracing::error!("❌ Failed to add remark to flow history {}: {}", ctx.flow_history_id, err);
            false
        }
    }
}

pub async fn add_info(message: impl Into<String>) -> bool {
    add(RemarkLevel::Info, message).await
}

pub async fn add_warning(message: impl Into<String>) -> bool {
    add(RemarkLevel::Warning, message).await
}

pub async fn add_error(message: impl Into<String>) -> bool {
    add(RemarkLevel::Error, message).await
}
