/// Flowy: embeddable workflow orchestration engine
///
/// Flows are async functions composed of tracked tasks. Every execution is
/// recorded in a SQLite history store, and a background scheduler fires flows
/// on cron triggers or on demand.

// Core configuration and setup
pub mod config;

// Crate-wide error type
pub mod error;

// Persistence layer - definitions, execution history and migrations
pub mod store;

// Flow and task execution - registry, context propagation, history recording
pub mod workflow;

// Scheduling runtime - cron/ad-hoc jobs, reconciliation, orphans, retention
pub mod runtime;

// Composition root
pub mod service;

// Re-export commonly used types for external consumers
pub use config::Config;
pub use error::{FlowyError, Result};
pub use runtime::{AdhocHandle, FireOutcome, JobStatus, SchedulerService, TriggerService};
pub use service::{Flowy, HistoryDetail};
pub use store::{FlowStatus, NewTrigger, RemarkLevel, TaskStatus, Trigger, TriggerUpdate};
pub use workflow::{log, progress::set_progress, remark, task, FlowDefinition, FlowMetadata, FlowOutcome, FlowRun};
