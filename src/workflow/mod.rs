//! Flow and task execution layer
//!
//! - Hot-reload flow registry (ArcSwap)
//! - Flow engine: history rows, context binding, finalization
//! - Task engine, progress, remarks and execution logs, all resolved through
//!   the task-local execution context

// Hot-reload registry of executable flows
pub mod registry;

// Task-local execution context
pub mod context;

// Flow invocation and history recording
pub mod flow;

// Tracked tasks inside a flow
pub mod task;

pub mod progress;
pub mod remark;

// Per-execution log files
pub mod log;

pub use context::ExecutionContext;
pub use flow::{FlowEngine, FlowMetadata, FlowOutcome, FlowRun, TriggerType};
pub use log::ExecutionLogs;
pub use progress::set_progress;
pub use registry::{FlowDefinition, FlowOutput, FlowRegistry};
pub use task::task;
