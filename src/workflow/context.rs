/// Execution context propagation
///
/// The current flow-execution id (and task id, inside a task) is held in a
/// tokio task-local bound around the flow's future. Anything awaited inside
/// that future, however deeply nested, sees it; concurrent executions each
/// have their own binding, and the binding ends when the scoped future
/// completes, fails, panics or is dropped.
///
/// A `tokio::spawn` inside a flow body starts a new task without the binding.
/// Wrap the spawned future in [`propagate`] to carry it over.
use crate::store::HistoryStore;
use crate::workflow::log::ExecutionLogs;
use futures::future::Either;
use std::future::Future;

tokio::task_local! {
    static CURRENT: ExecutionContext;
}

/// Ambient state of one flow execution
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    pub flow_history_id: i64,
    pub flow_id: String,
    /// Set while a tracked task body runs
    pub task_history_id: Option<i64>,
    pub(crate) history: HistoryStore,
    pub(crate) logs: ExecutionLogs,
}

impl ExecutionContext {
    pub(crate) fn new(
        flow_history_id: i64,
        flow_id: impl Into<String>,
        history: HistoryStore,
        logs: ExecutionLogs,
    ) -> Self {
        Self {
            flow_history_id,
            flow_id: flow_id.into(),
            task_history_id: None,
            history,
            logs,
        }
    }

    /// Same execution, narrowed to one task
    pub(crate) fn for_task(&self, task_history_id: i64) -> Self {
        Self {
            task_history_id: Some(task_history_id),
            ..self.clone()
        }
    }
}

/// Snapshot of the binding visible to the current future, if any
pub fn current() -> Option<ExecutionContext> {
    CURRENT.try_with(|ctx| ctx.clone()).ok()
}

pub fn current_flow_history_id() -> Option<i64> {
    CURRENT.try_with(|ctx| ctx.flow_history_id).ok()
}

pub fn current_task_history_id() -> Option<i64> {
    CURRENT.try_with(|ctx| ctx.task_history_id).ok().flatten()
}

/// Run `fut` with `ctx` bound
pub async fn scope<F: Future>(ctx: ExecutionContext, fut: F) -> F::Output {
    CURRENT.scope(ctx, fut).await
}

/// Capture the current binding (if any) into `fut`
///
/// For futures handed to `tokio::spawn` from inside a flow or task.
pub fn propagate<F: Future>(fut: F) -> impl Future<Output = F::Output> {
    match current() {
        Some(ctx) => Either::Left(CURRENT.scope(ctx, fut)),
        None => Either::Right(fut),
    }
}
