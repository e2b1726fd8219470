/// Administrative trigger management
///
/// Every mutation writes the definitions store first and then drives the
/// matching scheduler transition. A scheduler failure is logged and left for
/// the reconciliation loop to repair; the stored row is authoritative.
use crate::error::{FlowyError, Result};
use crate::runtime::{cron, scheduler::SchedulerService};
use crate::store::{DefinitionStore, NewTrigger, Trigger, TriggerUpdate};

#[derive(Clone)]
pub struct TriggerService {
    definitions: DefinitionStore,
    scheduler: SchedulerService,
}

impl TriggerService {
    pub fn new(definitions: DefinitionStore, scheduler: SchedulerService) -> Self {
        Self {
            definitions,
            scheduler,
        }
    }

    /// Validate and store a new (enabled) trigger, then schedule it
    pub async fn create_trigger(&self, new: NewTrigger) -> Result<Trigger> {
        validate_name(&new.name)?;
        validate_max_instances(new.max_instances)?;
        cron::parse(&new.cron_expression)?;
        if self.definitions.get_flow(&new.flow_id).await?.is_none() {
            return Err(FlowyError::validation(format!(
                "flow '{}' is not registered",
                new.flow_id
            )));
        }

        let trigger = self.definitions.insert_trigger(&new).await?;
        tracing::info!("➕ Created trigger {} ({}) for flow {}", trigger.id, trigger.name, trigger.flow_id);
        self.sync(&trigger).await;
        Ok(trigger)
    }

    /// Apply a partial update; a changed schedule replaces the live job in place
    pub async fn update_trigger(&self, id: i64, update: TriggerUpdate) -> Result<Trigger> {
        if let Some(name) = &update.name {
            validate_name(name)?;
        }
        if let Some(max_instances) = update.max_instances {
            validate_max_instances(max_instances)?;
        }
        if let Some(expr) = &update.cron_expression {
            cron::parse(expr)?;
        }

        let trigger = self
            .definitions
            .update_trigger(id, &update)
            .await?
            .ok_or_else(|| FlowyError::not_found("trigger", id))?;
        tracing::info!("✏️ Updated trigger {} ({})", trigger.id, trigger.name);
        self.sync(&trigger).await;
        Ok(trigger)
    }

    /// Delete a trigger and its live job; history is untouched
    pub async fn delete_trigger(&self, id: i64) -> Result<()> {
        if !self.definitions.delete_trigger(id).await? {
            return Err(FlowyError::not_found("trigger", id));
        }
        tracing::info!("🗑️ Deleted trigger {}", id);
        if let Err(err) = self.scheduler.remove_job(id).await {
            tracing::error!("❌ Failed to remove job of deleted trigger {}: {}", id, err);
        }
        Ok(())
    }

    /// Enable or disable a trigger (pauses/resumes its live job)
    pub async fn set_enabled(&self, id: i64, enabled: bool) -> Result<Trigger> {
        if !self.definitions.set_trigger_enabled(id, enabled).await? {
            return Err(FlowyError::not_found("trigger", id));
        }
        let trigger = self
            .definitions
            .get_trigger(id)
            .await?
            .ok_or_else(|| FlowyError::not_found("trigger", id))?;
        tracing::info!("🔁 Trigger {} {}", id, if enabled { "enabled" } else { "disabled" });
        self.sync(&trigger).await;
        Ok(trigger)
    }

    pub async fn get_trigger(&self, id: i64) -> Result<Option<Trigger>> {
        self.definitions.get_trigger(id).await
    }

    pub async fn list_triggers_for_flow(&self, flow_id: &str) -> Result<Vec<Trigger>> {
        self.definitions.list_triggers_for_flow(flow_id).await
    }

    async fn sync(&self, trigger: &Trigger) {
        if let Err(err) = self.scheduler.apply_trigger(trigger).await {
            tracing::error!(
                "❌ Scheduler update for trigger {} failed, reconciliation will retry: {}",
                trigger.id,
                err
            );
        }
    }
}

fn validate_name(name: &str) -> Result<()> {
    if name.trim().is_empty() {
        return Err(FlowyError::validation("trigger name must not be empty"));
    }
    Ok(())
}

fn validate_max_instances(max_instances: u32) -> Result<()> {
    if max_instances < 1 {
        return Err(FlowyError::validation("max_instances must be at least 1"));
    }
    Ok(())
}
