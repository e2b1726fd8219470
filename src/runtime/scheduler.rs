/// Background scheduler service
///
/// Owns one tokio-cron-scheduler instance and keeps exactly one live job per
/// enabled trigger, keyed by trigger id. Also runs ad-hoc one-shot jobs and
/// the reconciliation, orphan-detection and retention loops.
///
/// Job state per trigger: absent -> scheduled (enabled) <-> paused -> absent.
/// Pausing only flips a flag the job checks when it fires, so the live job
/// (and its in-flight counter) survives disable/enable.
use crate::config::SchedulerConfig;
use crate::error::{FlowyError, Result};
use crate::runtime::{
    cron,
    orphans::{OrphanDetector, OrphanReport},
    retention::{RetentionCleaner, RetentionReport},
};
use crate::store::{DefinitionStore, FlowStatus, Trigger};
use crate::workflow::{FlowEngine, FlowMetadata, FlowOutcome, TriggerType};
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use std::{
    collections::{HashMap, HashSet},
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc, Weak,
    },
    time::Duration,
};
use tokio::{
    sync::{Mutex, Semaphore},
    task::JoinHandle,
    time::{interval_at, Instant, MissedTickBehavior},
};
use tokio_cron_scheduler::{Job, JobScheduler};
use uuid::Uuid;

/// Cloneable handle to the scheduler
#[derive(Clone)]
pub struct SchedulerService {
    inner: Arc<SchedulerInner>,
}

struct SchedulerInner {
    config: SchedulerConfig,
    engine: FlowEngine,
    definitions: DefinitionStore,
    /// Bounds concurrently executing scheduled/ad-hoc runs
    workers: Arc<Semaphore>,
    /// Serializes start/stop
    lifecycle: Mutex<Lifecycle>,
    /// Present while started; JobScheduler is a cheap clonable handle
    scheduler: std::sync::Mutex<Option<JobScheduler>>,
    jobs: Mutex<JobTable>,
}

#[derive(Default)]
struct Lifecycle {
    running: bool,
    loops: Vec<JoinHandle<()>>,
}

#[derive(Default)]
struct JobTable {
    cron: HashMap<i64, CronJob>,
    adhoc: HashMap<String, AdhocJob>,
    /// Executions in flight per trigger; kept across stop/start so runs that
    /// outlive a restart still count against `max_instances`
    in_flight: HashMap<i64, Arc<AtomicUsize>>,
}

/// Live job of one trigger
struct CronJob {
    uuid: Uuid,
    /// Stored expression as entered, compared verbatim during reconciliation
    cron_expression: String,
    schedule: ::cron::Schedule,
    max_instances: u32,
    paused: Arc<AtomicBool>,
    in_flight: Arc<AtomicUsize>,
}

/// Pending or executing ad-hoc run
struct AdhocJob {
    flow_history_id: i64,
    run_at: DateTime<Utc>,
    started: Arc<AtomicBool>,
}

/// Why a firing did not start an execution
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// No live job for the trigger (scheduler stopped or trigger unknown)
    NoLiveJob,
    Paused,
    TriggerMissing,
    Disabled,
    /// `max_instances` executions already in flight
    MaxInstances,
}

/// Result of a trigger firing
#[derive(Debug)]
pub enum FireOutcome {
    /// Execution spawned; the handle resolves when it finishes
    Started(JoinHandle<()>),
    Skipped(SkipReason),
}

/// Returned by [`SchedulerService::schedule_now`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AdhocHandle {
    pub job_id: String,
    pub flow_history_id: i64,
}

/// Mutations performed by one reconciliation pass
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileReport {
    pub created: usize,
    pub replaced: usize,
    pub paused: usize,
    pub resumed: usize,
    pub removed: usize,
    pub errors: Vec<String>,
}

impl ReconcileReport {
    /// Number of job mutations (errors excluded)
    pub fn actions(&self) -> usize {
        self.created + self.replaced + self.paused + self.resumed + self.removed
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum JobKind {
    Cron,
    Adhoc,
}

/// Live state of one scheduled job
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct JobStatus {
    pub job_id: String,
    pub kind: JobKind,
    pub next_run: Option<DateTime<Utc>>,
    pub paused: bool,
    pub in_flight: usize,
}

/// Decrements a trigger's in-flight counter when the execution ends
struct InFlightGuard(Arc<AtomicUsize>);

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Job id of a trigger's cron job
pub fn trigger_job_id(trigger_id: i64) -> String {
    format!("trigger_{}", trigger_id)
}

fn adhoc_job_id(flow_history_id: i64) -> String {
    format!("adhoc_{}", flow_history_id)
}

impl SchedulerService {
    pub fn new(config: SchedulerConfig, engine: FlowEngine, definitions: DefinitionStore) -> Self {
        let workers = Arc::new(Semaphore::new(config.worker_pool_size.max(1)));
        Self {
            inner: Arc::new(SchedulerInner {
                config,
                engine,
                definitions,
                workers,
                lifecycle: Mutex::new(Lifecycle::default()),
                scheduler: std::sync::Mutex::new(None),
                jobs: Mutex::new(JobTable::default()),
            }),
        }
    }

    fn from_inner(inner: Arc<SchedulerInner>) -> Self {
        Self { inner }
    }

    fn weak(&self) -> Weak<SchedulerInner> {
        Arc::downgrade(&self.inner)
    }

    pub async fn is_running(&self) -> bool {
        self.inner.lifecycle.lock().await.running
    }

    fn job_scheduler(&self) -> Option<JobScheduler> {
        match self.inner.scheduler.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    fn set_job_scheduler(&self, scheduler: Option<JobScheduler>) -> Option<JobScheduler> {
        let mut guard = match self.inner.scheduler.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        std::mem::replace(&mut *guard, scheduler)
    }

    /// Start the scheduling engine (no-op if already started)
    ///
    /// Registers jobs for all enabled triggers, runs one orphan pass to
    /// recover from a previous process, then starts the periodic loops.
    pub async fn start(&self) -> Result<()> {
        let mut lifecycle = self.inner.lifecycle.lock().await;
        if lifecycle.running {
            return Ok(());
        }

        tracing::info!("⏰ Starting scheduler service");
        let scheduler = JobScheduler::new().await?;
        scheduler.start().await?;
        self.set_job_scheduler(Some(scheduler));
        lifecycle.running = true;

        match self.reconcile().await {
            Ok(report) => tracing::info!("📊 Initial reconciliation: {} job(s) created", report.created),
            Err(err) => tracing::error!("❌ Initial reconciliation failed: {}", err),
        }
        if let Err(err) = self.detect_orphans().await {
            tracing::error!("❌ Startup orphan detection failed: {}", err);
        }

        lifecycle.loops = self.spawn_loops();
        tracing::info!("✅ Scheduler service started");
        Ok(())
    }

    /// Stop the scheduling engine (no-op if not started)
    ///
    /// Executions already running are left to finish on their own and keep
    /// counting against their trigger's `max_instances` after a restart.
    pub async fn stop(&self) -> Result<()> {
        let mut lifecycle = self.inner.lifecycle.lock().await;
        if !lifecycle.running {
            return Ok(());
        }

        tracing::info!("⏹️ Stopping scheduler service");
        for handle in lifecycle.loops.drain(..) {
            handle.abort();
        }
        {
            let mut jobs = self.inner.jobs.lock().await;
            jobs.cron.clear();
            jobs.adhoc.clear();
            tracing::debug!("🧹 Cleared job tables during shutdown");
        }
        lifecycle.running = false;

        if let Some(mut scheduler) = self.set_job_scheduler(None) {
            scheduler.shutdown().await?;
        }
        tracing::info!("✅ Scheduler service stopped");
        Ok(())
    }

    fn spawn_loops(&self) -> Vec<JoinHandle<()>> {
        let config = &self.inner.config;
        let mut loops = vec![
            spawn_loop(self.weak(), config.reconcile_interval(), |service| async move {
                match service.reconcile().await {
                    Ok(report) if report.actions() > 0 => {
                        tracing::info!("🔄 Reconciliation applied {} change(s)", report.actions())
                    }
                    Ok(_) => tracing::debug!("🔄 Reconciliation: no drift"),
                    Err(err) => tracing::error!("❌ Reconciliation failed: {}", err),
                }
            }),
            spawn_loop(self.weak(), config.orphan_check_interval(), |service| async move {
                if let Err(err) = service.detect_orphans().await {
                    tracing::error!("❌ Orphan detection failed: {}", err);
                }
            }),
        ];

        if config.retention().is_some() {
            loops.push(spawn_loop(self.weak(), config.retention_interval(), |service| async move {
                if let Err(err) = service.run_retention().await {
                    tracing::error!("❌ Retention cleanup failed: {}", err);
                }
            }));
        }
        loops
    }

    // ---- cron jobs ----------------------------------------------------------

    /// Create or replace the live job of a trigger
    ///
    /// The in-flight counter belongs to the trigger, not the job, so
    /// `max_instances` still counts executions started by a replaced job or
    /// before a restart. No-op while stopped.
    pub async fn add_or_replace_job(&self, trigger: &Trigger, paused: bool) -> Result<()> {
        let Some(scheduler) = self.job_scheduler() else {
            tracing::debug!("📋 Scheduler stopped, job for trigger {} deferred", trigger.id);
            return Ok(());
        };

        let schedule = cron::parse(&trigger.cron_expression)?;
        let normalized = cron::normalize(&trigger.cron_expression)?;
        let job = self.build_cron_job(trigger.id, &normalized, schedule.clone())?;
        let uuid = job.guid();

        let mut jobs = self.inner.jobs.lock().await;
        if let Some(old) = jobs.cron.remove(&trigger.id) {
            if let Err(err) = scheduler.remove(&old.uuid).await {
                tracing::warn!("⚠️ Failed to remove old job for trigger {}: {}", trigger.id, err);
            }
        }
        let in_flight = jobs.in_flight.entry(trigger.id).or_default().clone();

        scheduler.add(job).await?;
        jobs.cron.insert(
            trigger.id,
            CronJob {
                uuid,
                cron_expression: trigger.cron_expression.clone(),
                schedule,
                max_instances: trigger.max_instances.max(1),
                paused: Arc::new(AtomicBool::new(paused)),
                in_flight,
            },
        );

        tracing::info!(
            "🔥 Scheduled trigger {} ({}) [{}]{}",
            trigger.id,
            trigger.name,
            trigger.cron_expression,
            if paused { " paused" } else { "" }
        );
        Ok(())
    }

    fn build_cron_job(&self, trigger_id: i64, expression: &str, schedule: ::cron::Schedule) -> Result<Job> {
        let weak = self.weak();
        let grace = self.inner.config.misfire_grace();

        let job = Job::new_async(expression, move |_uuid, _l| {
            let weak = weak.clone();
            let schedule = schedule.clone();
            Box::pin(async move {
                let Some(inner) = weak.upgrade() else {
                    return;
                };
                let now = Utc::now();
                if !cron::is_on_time(&schedule, now, grace) {
                    tracing::warn!("⏭️ Trigger {} fired past its misfire grace, skipped", trigger_id);
                    return;
                }
                let service = SchedulerService::from_inner(inner);
                match service.fire_trigger(trigger_id).await {
                    Ok(FireOutcome::Started(_)) => {}
                    Ok(FireOutcome::Skipped(reason)) => {
                        tracing::warn!("⏭️ Trigger {} firing skipped: {:?}", trigger_id, reason)
                    }
                    Err(err) => tracing::error!("❌ Trigger {} firing failed: {}", trigger_id, err),
                }
            })
        })?;
        Ok(job)
    }

    /// Pause a trigger's live job; returns false if it has none
    pub async fn pause_job(&self, trigger_id: i64) -> bool {
        let jobs = self.inner.jobs.lock().await;
        match jobs.cron.get(&trigger_id) {
            Some(job) => {
                job.paused.store(true, Ordering::Release);
                tracing::info!("⏸️ Paused trigger {}", trigger_id);
                true
            }
            None => false,
        }
    }

    /// Resume a trigger's live job; returns false if it has none
    pub async fn resume_job(&self, trigger_id: i64) -> bool {
        let jobs = self.inner.jobs.lock().await;
        match jobs.cron.get(&trigger_id) {
            Some(job) => {
                job.paused.store(false, Ordering::Release);
                tracing::info!("▶️ Resumed trigger {}", trigger_id);
                true
            }
            None => false,
        }
    }

    /// Remove a trigger's live job; returns false if it had none
    pub async fn remove_job(&self, trigger_id: i64) -> Result<bool> {
        let mut jobs = self.inner.jobs.lock().await;
        let Some(job) = jobs.cron.remove(&trigger_id) else {
            return Ok(false);
        };
        jobs.in_flight.remove(&trigger_id);
        if let Some(scheduler) = self.job_scheduler() {
            scheduler.remove(&job.uuid).await?;
        }
        tracing::info!("🛑 Removed job for trigger {}", trigger_id);
        Ok(true)
    }

    /// Bring the live job of one trigger in line with its stored row
    pub async fn apply_trigger(&self, trigger: &Trigger) -> Result<()> {
        let live = {
            let jobs = self.inner.jobs.lock().await;
            jobs.cron
                .get(&trigger.id)
                .map(|job| (job.cron_expression.clone(), job.max_instances))
        };

        match live {
            None if trigger.enabled => self.add_or_replace_job(trigger, false).await,
            None => Ok(()),
            Some((cron_expression, max_instances))
                if cron_expression != trigger.cron_expression || max_instances != trigger.max_instances =>
            {
                self.add_or_replace_job(trigger, !trigger.enabled).await
            }
            Some(_) => {
                if trigger.enabled {
                    self.resume_job(trigger.id).await;
                } else {
                    self.pause_job(trigger.id).await;
                }
                Ok(())
            }
        }
    }

    /// Fire a trigger now, honouring pause state and `max_instances`
    ///
    /// Used by the cron job callbacks. The trigger row is re-read so the run
    /// uses the current params and name.
    pub async fn fire_trigger(&self, trigger_id: i64) -> Result<FireOutcome> {
        let live = {
            let jobs = self.inner.jobs.lock().await;
            jobs.cron
                .get(&trigger_id)
                .map(|job| (job.paused.clone(), job.in_flight.clone(), job.max_instances))
        };
        let Some((paused, in_flight, max_instances)) = live else {
            return Ok(FireOutcome::Skipped(SkipReason::NoLiveJob));
        };
        if paused.load(Ordering::Acquire) {
            return Ok(FireOutcome::Skipped(SkipReason::Paused));
        }

        let Some(trigger) = self.inner.definitions.get_trigger(trigger_id).await? else {
            return Ok(FireOutcome::Skipped(SkipReason::TriggerMissing));
        };
        if !trigger.enabled {
            return Ok(FireOutcome::Skipped(SkipReason::Disabled));
        }

        let limit = max_instances as usize;
        let mut current = in_flight.load(Ordering::Acquire);
        loop {
            if current >= limit {
                tracing::warn!(
                    "⏭️ Trigger {} at max_instances ({}/{}), firing skipped",
                    trigger_id,
                    current,
                    limit
                );
                return Ok(FireOutcome::Skipped(SkipReason::MaxInstances));
            }
            match in_flight.compare_exchange(current, current + 1, Ordering::AcqRel, Ordering::Acquire) {
                Ok(_) => break,
                Err(actual) => current = actual,
            }
        }
        let guard = InFlightGuard(in_flight);

        let engine = self.inner.engine.clone();
        let workers = self.inner.workers.clone();
        let fired_at = Utc::now();
        tracing::debug!("🔔 Trigger {} fired for flow {}", trigger_id, trigger.flow_id);

        let handle = tokio::spawn(async move {
            let _guard = guard;
            let Ok(_permit) = workers.acquire_owned().await else {
                return;
            };
            let metadata = FlowMetadata::scheduled(trigger.id, trigger.name.clone(), fired_at);
            match engine.invoke(&trigger.flow_id, trigger.trigger_params.clone(), metadata).await {
                Ok(FlowOutcome::Completed(run)) => {
                    tracing::info!("✅ Scheduled run of {} completed (history {})", trigger.flow_id, run.flow_history_id)
                }
                Ok(FlowOutcome::NotFound { flow_id }) => {
                    tracing::warn!("⚠️ Trigger {} points at unregistered flow {}", trigger.id, flow_id)
                }
                Ok(FlowOutcome::Stale { flow_history_id }) => {
                    tracing::warn!("⚠️ Scheduled run found stale history {}", flow_history_id)
                }
                Ok(FlowOutcome::Untracked { .. }) => {
                    tracing::warn!("⚠️ Scheduled run of {} completed without a history record", trigger.flow_id)
                }
                Err(err) => tracing::error!("❌ Scheduled run of {} failed: {}", trigger.flow_id, err),
            }
        });
        Ok(FireOutcome::Started(handle))
    }

    /// Compare live jobs with stored triggers and repair the difference
    ///
    /// Drift is judged on the stored cron string kept with each live job and
    /// on `max_instances`. A pass over an unchanged store mutates nothing.
    pub async fn reconcile(&self) -> Result<ReconcileReport> {
        let mut report = ReconcileReport::default();
        if self.job_scheduler().is_none() {
            return Ok(report);
        }

        let triggers = self.inner.definitions.list_triggers().await?;
        let live: HashMap<i64, (String, u32, bool)> = {
            let jobs = self.inner.jobs.lock().await;
            jobs.cron
                .iter()
                .map(|(id, job)| {
                    (
                        *id,
                        (job.cron_expression.clone(), job.max_instances, job.paused.load(Ordering::Acquire)),
                    )
                })
                .collect()
        };

        let stored: HashSet<i64> = triggers.iter().map(|t| t.id).collect();
        for trigger in &triggers {
            let result = match (trigger.enabled, live.get(&trigger.id)) {
                (true, None) => self.add_or_replace_job(trigger, false).await.map(|_| report.created += 1),
                (enabled, Some((cron_expression, max_instances, _)))
                    if *cron_expression != trigger.cron_expression || *max_instances != trigger.max_instances =>
                {
                    self.add_or_replace_job(trigger, !enabled).await.map(|_| report.replaced += 1)
                }
                (true, Some((_, _, true))) => {
                    self.resume_job(trigger.id).await;
                    report.resumed += 1;
                    Ok(())
                }
                (false, Some((_, _, false))) => {
                    self.pause_job(trigger.id).await;
                    report.paused += 1;
                    Ok(())
                }
                _ => Ok(()),
            };
            if let Err(err) = result {
                tracing::error!("❌ Reconciling trigger {} failed: {}", trigger.id, err);
                report.errors.push(format!("trigger {}: {}", trigger.id, err));
            }
        }

        for trigger_id in live.keys().filter(|id| !stored.contains(id)) {
            match self.remove_job(*trigger_id).await {
                Ok(true) => report.removed += 1,
                Ok(false) => {}
                Err(err) => report.errors.push(format!("trigger {}: {}", trigger_id, err)),
            }
        }

        Ok(report)
    }

    // ---- ad-hoc jobs --------------------------------------------------------

    /// Run a flow once after a short delay
    ///
    /// The pending FlowHistory row exists when this returns; the one-shot
    /// job later promotes it to running. Starts the scheduler if needed.
    pub async fn schedule_now(
        &self,
        flow_id: &str,
        input: Value,
        delay: Option<Duration>,
    ) -> Result<AdhocHandle> {
        if !self.inner.engine.registry().contains(flow_id) {
            return Err(FlowyError::not_found("flow", flow_id));
        }
        self.start().await?;
        let Some(scheduler) = self.job_scheduler() else {
            return Err(FlowyError::validation("scheduler is not running"));
        };

        let delay = delay.unwrap_or_else(|| Duration::from_secs(self.inner.config.adhoc_default_delay_secs));
        let metadata = FlowMetadata {
            trigger_type: TriggerType::Immediate,
            trigger_time: Some(Utc::now()),
            ..FlowMetadata::default()
        };
        let flow_history_id = self
            .inner
            .engine
            .history()
            .create_flow_history(flow_id, FlowStatus::Pending, &metadata.to_document(), Some(&input), None)
            .await?;
        let job_id = adhoc_job_id(flow_history_id);

        let started = Arc::new(AtomicBool::new(false));
        let job = self.build_adhoc_job(flow_id.to_string(), flow_history_id, input, delay, started.clone())?;
        let run_at = Utc::now() + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero());

        let mut jobs = self.inner.jobs.lock().await;
        jobs.adhoc.insert(
            job_id.clone(),
            AdhocJob {
                flow_history_id,
                run_at,
                started,
            },
        );
        if let Err(err) = scheduler.add(job).await {
            jobs.adhoc.remove(&job_id);
            drop(jobs);
            let _ = self
                .inner
                .engine
                .fail_pending(flow_history_id, "ad-hoc job could not be scheduled")
                .await;
            return Err(err.into());
        }

        tracing::info!("📅 Ad-hoc run of {} scheduled as {} (history {})", flow_id, job_id, flow_history_id);
        Ok(AdhocHandle { job_id, flow_history_id })
    }

    fn build_adhoc_job(
        &self,
        flow_id: String,
        flow_history_id: i64,
        input: Value,
        delay: Duration,
        started: Arc<AtomicBool>,
    ) -> Result<Job> {
        let weak = self.weak();
        let job = Job::new_one_shot_async(delay, move |_uuid, _l| {
            let weak = weak.clone();
            let flow_id = flow_id.clone();
            let input = input.clone();
            let started = started.clone();
            Box::pin(async move {
                let Some(inner) = weak.upgrade() else {
                    return;
                };
                started.store(true, Ordering::Release);
                SchedulerService::from_inner(inner)
                    .run_adhoc(flow_id, flow_history_id, input)
                    .await;
            })
        })?;
        Ok(job)
    }

    async fn run_adhoc(&self, flow_id: String, flow_history_id: i64, input: Value) {
        let job_id = adhoc_job_id(flow_history_id);
        let engine = self.inner.engine.clone();

        if let Ok(_permit) = self.inner.workers.clone().acquire_owned().await {
            match engine.invoke(&flow_id, input, FlowMetadata::immediate(flow_history_id)).await {
                Ok(FlowOutcome::Completed(_)) => {
                    tracing::info!("✅ Ad-hoc run {} completed", job_id)
                }
                Ok(FlowOutcome::NotFound { .. }) => {
                    tracing::warn!("⚠️ Flow {} disappeared before ad-hoc run {}", flow_id, job_id);
                    if let Err(err) = engine.fail_pending(flow_history_id, &format!("flow '{}' not found", flow_id)).await {
                        tracing::error!("❌ Failed to mark history {} failed: {}", flow_history_id, err);
                    }
                }
                Ok(FlowOutcome::Stale { .. }) => {
                    tracing::warn!("⚠️ Ad-hoc run {} skipped, history no longer pending", job_id)
                }
                Ok(FlowOutcome::Untracked { .. }) => {
                    tracing::warn!("⚠️ Ad-hoc run {} completed but history {} was not updated", job_id, flow_history_id)
                }
                Err(err) => tracing::error!("❌ Ad-hoc run {} failed: {}", job_id, err),
            }
        }

        self.inner.jobs.lock().await.adhoc.remove(&job_id);
    }

    // ---- inspection and maintenance -----------------------------------------

    /// Live state of a `trigger_<id>` or `adhoc_<id>` job
    pub async fn job_status(&self, job_id: &str) -> Option<JobStatus> {
        let jobs = self.inner.jobs.lock().await;

        if let Some(trigger_id) = job_id.strip_prefix("trigger_").and_then(|s| s.parse::<i64>().ok()) {
            let job = jobs.cron.get(&trigger_id)?;
            return Some(JobStatus {
                job_id: job_id.to_string(),
                kind: JobKind::Cron,
                next_run: cron::next_after(&job.schedule, Utc::now()),
                paused: job.paused.load(Ordering::Acquire),
                in_flight: job.in_flight.load(Ordering::Acquire),
            });
        }

        let job = jobs.adhoc.get(job_id)?;
        let started = job.started.load(Ordering::Acquire);
        Some(JobStatus {
            job_id: job_id.to_string(),
            kind: JobKind::Adhoc,
            next_run: (!started).then_some(job.run_at),
            paused: false,
            in_flight: usize::from(started),
        })
    }

    /// Ids of every live job
    pub async fn job_ids(&self) -> Vec<String> {
        let jobs = self.inner.jobs.lock().await;
        jobs.cron
            .keys()
            .map(|id| trigger_job_id(*id))
            .chain(jobs.adhoc.keys().cloned())
            .collect()
    }

    /// One orphan-detection pass
    pub async fn detect_orphans(&self) -> Result<OrphanReport> {
        let live: HashSet<i64> = {
            let jobs = self.inner.jobs.lock().await;
            jobs.adhoc.values().map(|job| job.flow_history_id).collect()
        };
        let detector = OrphanDetector::new(self.inner.engine.history().clone(), &self.inner.config);
        let report = detector.run_once(&live).await?;
        if report.total() > 0 {
            tracing::warn!("🧟 Orphan detection repaired {} row(s): {:?}", report.total(), report);
        }
        Ok(report)
    }

    /// One retention pass (no-op when retention is disabled)
    pub async fn run_retention(&self) -> Result<RetentionReport> {
        let Some(window) = self.inner.config.retention() else {
            return Ok(RetentionReport::default());
        };
        let cleaner = RetentionCleaner::new(
            self.inner.engine.history().clone(),
            self.inner.engine.logs().clone(),
            window,
            self.inner.config.scan_batch_size,
        );
        cleaner.run_once().await
    }

    /// Permits currently free in the worker pool
    pub fn available_workers(&self) -> usize {
        self.inner.workers.available_permits()
    }
}

fn spawn_loop<F, Fut>(weak: Weak<SchedulerInner>, period: Duration, body: F) -> JoinHandle<()>
where
    F: Fn(SchedulerService) -> Fut + Send + 'static,
    Fut: std::future::Future<Output = ()> + Send,
{
    tokio::spawn(async move {
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            ticker.tick().await;
            let Some(inner) = weak.upgrade() else {
                break;
            };
            body(SchedulerService::from_inner(inner)).await;
        }
    })
}
