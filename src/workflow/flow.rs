/// Flow engine
///
/// Wraps every flow invocation with its FlowHistory row: create (or promote a
/// pre-created pending row), bind the execution context, run the body, then
/// finalize status/output and release the execution-log handle.
use crate::error::{FlowyError, Result};
use crate::store::{DefinitionStore, Flow, FlowStatus, HistoryStore};
use crate::workflow::{
    context::{self, ExecutionContext},
    log::ExecutionLogs,
    registry::{FlowDefinition, FlowOutput, FlowRegistry},
};
use chrono::{DateTime, Utc};
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::{panic::AssertUnwindSafe, sync::Arc};

/// What caused an invocation
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TriggerType {
    /// Direct call from application code
    #[default]
    Manual,
    /// Cron trigger firing
    Scheduled,
    /// Ad-hoc "run now" request
    Immediate,
}

/// Provenance recorded in `flow_metadata`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FlowMetadata {
    pub trigger_type: TriggerType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trigger_id: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trigger_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trigger_time: Option<DateTime<Utc>>,
    /// Pre-created pending row to promote instead of inserting a new one
    #[serde(skip_serializing_if = "Option::is_none")]
    pub flow_history_id: Option<i64>,
}

impl FlowMetadata {
    pub fn manual() -> Self {
        Self::default()
    }

    pub fn scheduled(trigger_id: i64, trigger_name: impl Into<String>, trigger_time: DateTime<Utc>) -> Self {
        Self {
            trigger_type: TriggerType::Scheduled,
            trigger_id: Some(trigger_id),
            trigger_name: Some(trigger_name.into()),
            trigger_time: Some(trigger_time),
            flow_history_id: None,
        }
    }

    pub fn immediate(flow_history_id: i64) -> Self {
        Self {
            trigger_type: TriggerType::Immediate,
            trigger_time: Some(Utc::now()),
            flow_history_id: Some(flow_history_id),
            ..Self::default()
        }
    }

    /// Metadata document stored on the row, with an empty remarks list
    pub fn to_document(&self) -> Value {
        let mut doc = serde_json::to_value(self).unwrap_or_else(|_| json!({}));
        if let Value::Object(map) = &mut doc {
            map.insert("remarks".to_string(), json!([]));
        }
        doc
    }
}

/// A finished execution
#[derive(Debug, Clone, PartialEq)]
pub struct FlowRun {
    pub flow_history_id: i64,
    /// The body's return value (or the substitute payload if it was unserializable)
    pub output: Value,
}

/// Outcome of [`FlowEngine::invoke`]
#[derive(Debug, Clone, PartialEq)]
pub enum FlowOutcome {
    Completed(FlowRun),
    /// No flow is registered under this id; nothing was recorded
    NotFound { flow_id: String },
    /// The pre-created row was no longer pending (already run or failed as
    /// an orphan); the body did not run
    Stale { flow_history_id: i64 },
    /// The history store could not record the run; the body ran anyway
    Untracked { output: Value },
}

/// Runs flows and records their history
#[derive(Debug, Clone)]
pub struct FlowEngine {
    registry: Arc<FlowRegistry>,
    definitions: DefinitionStore,
    history: HistoryStore,
    logs: ExecutionLogs,
}

impl FlowEngine {
    pub fn new(
        registry: Arc<FlowRegistry>,
        definitions: DefinitionStore,
        history: HistoryStore,
        logs: ExecutionLogs,
    ) -> Self {
        Self {
            registry,
            definitions,
            history,
            logs,
        }
    }

    pub fn registry(&self) -> &Arc<FlowRegistry> {
        &self.registry
    }

    pub fn history(&self) -> &HistoryStore {
        &self.history
    }

    pub fn logs(&self) -> &ExecutionLogs {
        &self.logs
    }

    /// Register a flow (or replace it) and upsert its Flow row
    pub async fn define(&self, definition: FlowDefinition) -> Result<Flow> {
        let flow = self
            .definitions
            .upsert_flow(&definition.id, &definition.name, definition.description.as_deref())
            .await?;
        self.registry.register(definition);
        Ok(flow)
    }

    /// Run a flow and record its execution
    ///
    /// A body error is recorded as `failed` and returned as
    /// `FlowyError::Execution`. Failing to write the final state is logged
    /// and does not change what the caller sees.
    pub async fn invoke(&self, flow_id: &str, args: Value, metadata: FlowMetadata) -> Result<FlowOutcome> {
        let Some(definition) = self.registry.get(flow_id) else {
            tracing::warn!("⚠️ Flow not found: {}", flow_id);
            return Ok(FlowOutcome::NotFound {
                flow_id: flow_id.to_string(),
            });
        };

        let input = definition.bind_args(args);
        let document = metadata.to_document();
        let start = Utc::now();

        let recorded = match metadata.flow_history_id {
            Some(id) => match self.history.promote_flow_history(id, &input, &document, start).await {
                Ok(true) => Ok(id),
                Ok(false) => {
                    tracing::warn!("⏭️ Flow history {} is no longer pending, skipping run of {}", id, flow_id);
                    return Ok(FlowOutcome::Stale { flow_history_id: id });
                }
                Err(err) => Err(err),
            },
            None => {
                self.history
                    .create_flow_history(flow_id, FlowStatus::Running, &document, Some(&input), Some(start))
                    .await
            }
        };
        let flow_history_id = match recorded {
            Ok(id) => id,
            Err(err) => {
                tracing::error!("❌ Failed to record flow history for {}, running untracked: {}", flow_id, err);
                return run_untracked(flow_id, &definition, input).await;
            }
        };

        tracing::info!("🚀 Flow {} started (history {})", flow_id, flow_history_id);
        self.log_line(flow_history_id, "INFO", &format!("flow {} start", definition.name)).await;

        let ctx = ExecutionContext::new(flow_history_id, flow_id, self.history.clone(), self.logs.clone());
        let result = context::scope(ctx, AssertUnwindSafe(definition.call(input)).catch_unwind()).await;
        let (status, output, outcome) = settle(flow_id, result);

        match self
            .history
            .finalize_flow_history(flow_history_id, status, &output, Utc::now())
            .await
        {
            Ok(true) => {}
            Ok(false) => tracing::warn!("⚠️ Flow history {} was already terminal at finalize", flow_history_id),
            Err(err) => tracing::error!("❌ Failed to finalize flow history {}: {}", flow_history_id, err),
        }

        match &outcome {
            Ok(_) => {
                tracing::info!("✅ Flow {} completed (history {})", flow_id, flow_history_id);
                self.log_line(flow_history_id, "INFO", &format!("flow {} end", definition.name)).await;
            }
            Err(err) => {
                tracing::error!("❌ Flow {} failed (history {}): {:#}", flow_id, flow_history_id, err);
                self.log_line(flow_history_id, "ERROR", &format!("{:?}", err)).await;
                self.log_line(flow_history_id, "INFO", &format!("flow {} end", definition.name)).await;
            }
        }
        self.logs.release(flow_history_id).await;

        match outcome {
            Ok(output) => Ok(FlowOutcome::Completed(FlowRun { flow_history_id, output })),
            Err(error) => Err(FlowyError::Execution {
                flow_history_id: Some(flow_history_id),
                error,
            }),
        }
    }

    /// Mark a pre-created pending row failed without running anything
    pub(crate) async fn fail_pending(&self, flow_history_id: i64, message: &str) -> Result<bool> {
        let payload = json!({ "error": message, "kind": "NotFound" });
        self.history
            .finalize_flow_history(flow_history_id, FlowStatus::Failed, &payload, Utc::now())
            .await
    }

    async fn log_line(&self, flow_history_id: i64, level: &str, message: &str) {
        if let Err(err) = self.logs.append(flow_history_id, level, message).await {
            tracing::warn!("⚠️ Failed to write execution log {}: {}", flow_history_id, err);
        }
    }
}

type BodyResult = std::result::Result<anyhow::Result<FlowOutput>, Box<dyn std::any::Any + Send>>;

/// Map a body result to the stored status/output and the caller's value
fn settle(flow_id: &str, result: BodyResult) -> (FlowStatus, Value, anyhow::Result<Value>) {
    match result {
        Ok(Ok(FlowOutput::Value(value))) => (
            FlowStatus::Completed,
            json!({ "result": value.clone() }),
            Ok(value),
        ),
        Ok(Ok(FlowOutput::Unserializable { type_name, error })) => {
            tracing::warn!("⚠️ Output of flow {} could not be serialized: {}", flow_id, error);
            let payload = json!({
                "error": "output could not be serialized",
                "serialize_error": error,
                "result_type": type_name,
            });
            (FlowStatus::Completed, payload.clone(), Ok(payload))
        }
        Ok(Err(err)) => (FlowStatus::Failed, error_payload("Error", &err), Err(err)),
        Err(panic) => {
            let err = anyhow::anyhow!("flow panicked: {}", panic_message(panic.as_ref()));
            (FlowStatus::Failed, error_payload("Panic", &err), Err(err))
        }
    }
}

/// Run the body with no history row and no bound context
async fn run_untracked(flow_id: &str, definition: &FlowDefinition, input: Value) -> Result<FlowOutcome> {
    let result = AssertUnwindSafe(definition.call(input)).catch_unwind().await;
    match settle(flow_id, result).2 {
        Ok(output) => Ok(FlowOutcome::Untracked { output }),
        Err(error) => Err(FlowyError::Execution {
            flow_history_id: None,
            error,
        }),
    }
}

/// Error payload stored as `output_data` of a failed execution
pub(crate) fn error_payload(kind: &str, err: &anyhow::Error) -> Value {
    json!({
        "error": format!("{:#}", err),
        "kind": kind,
        "traceback": format!("{:?}", err),
    })
}

pub(crate) fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn metadata_document_has_remarks() {
        let doc = FlowMetadata::scheduled(3, "nightly", Utc::now()).to_document();
        assert_eq!(doc["trigger_type"], "scheduled");
        assert_eq!(doc["trigger_id"], 3);
        assert_eq!(doc["remarks"], json!([]));
        assert!(doc.get("flow_history_id").is_none());
    }

    #[test]
    fn panic_messages_are_extracted() {
        let boxed: Box<dyn std::any::Any + Send> = Box::new("static");
        assert_eq!(panic_message(boxed.as_ref()), "static");
        let boxed: Box<dyn std::any::Any + Send> = Box::new(String::from("owned"));
        assert_eq!(panic_message(boxed.as_ref()), "owned");
    }
}
