/// Scheduling runtime
///
/// Cron and ad-hoc job scheduling on tokio-cron-scheduler, plus the
/// background maintenance passes that keep live state and stored history
/// consistent:
/// - Reconciliation of live jobs against stored triggers
/// - Orphan detection for executions lost to crashes or restarts
/// - Retention cleanup of old executions and log files

// Cron expression parsing and normalization
pub mod cron;

// Background scheduler service: cron jobs, ad-hoc jobs, maintenance loops
pub mod scheduler;

// Orphan detection over the history store
pub mod orphans;

// Retention cleanup
pub mod retention;

// Trigger administration (store + scheduler transitions)
pub mod triggers;

pub use orphans::{OrphanDetector, OrphanReport};
pub use retention::{RetentionCleaner, RetentionReport};
pub use scheduler::{
    trigger_job_id, AdhocHandle, FireOutcome, JobKind, JobStatus, ReconcileReport, SchedulerService, SkipReason,
};
pub use triggers::TriggerService;
