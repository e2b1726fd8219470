/// Persisted record types
///
/// Plain data structs for the definitions store (Flow, Trigger) and the history
/// store (FlowHistory, TaskHistory, migration ledger). Payload columns are
/// already decompressed and parsed into `serde_json::Value` here.
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;

/// A registered flow (display metadata only, the executable lives in the registry)
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Flow {
    /// Unique flow identifier (e.g., "user_data_pipeline")
    pub id: String,
    pub name: String,
    pub description: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A persisted cron schedule bound to a flow
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Trigger {
    pub id: i64,
    pub flow_id: String,
    pub name: String,
    pub description: Option<String>,
    /// Cron expression exactly as the administrator entered it
    pub cron_expression: String,
    /// Fixed input handed to the flow on every firing
    pub trigger_params: Value,
    /// Concurrency cap for in-flight executions of this trigger (>= 1)
    pub max_instances: u32,
    pub enabled: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Fields required to create a trigger
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewTrigger {
    pub flow_id: String,
    pub name: String,
    pub description: Option<String>,
    pub cron_expression: String,
    pub trigger_params: Value,
    pub max_instances: u32,
}

impl NewTrigger {
    pub fn new(
        flow_id: impl Into<String>,
        name: impl Into<String>,
        cron_expression: impl Into<String>,
    ) -> Self {
        Self {
            flow_id: flow_id.into(),
            name: name.into(),
            description: None,
            cron_expression: cron_expression.into(),
            trigger_params: Value::Object(Default::default()),
            max_instances: 1,
        }
    }

    pub fn with_params(mut self, params: Value) -> Self {
        self.trigger_params = params;
        self
    }

    pub fn with_max_instances(mut self, max_instances: u32) -> Self {
        self.max_instances = max_instances;
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }
}

/// Partial trigger update; `None` leaves the column untouched
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TriggerUpdate {
    pub name: Option<String>,
    pub description: Option<String>,
    pub cron_expression: Option<String>,
    pub trigger_params: Option<Value>,
    pub max_instances: Option<u32>,
}

/// Lifecycle of one flow execution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlowStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl FlowStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            FlowStatus::Pending => "pending",
            FlowStatus::Running => "running",
            FlowStatus::Completed => "completed",
            FlowStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, FlowStatus::Completed | FlowStatus::Failed)
    }
}

impl fmt::Display for FlowStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FlowStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(FlowStatus::Pending),
            "running" => Ok(FlowStatus::Running),
            "completed" => Ok(FlowStatus::Completed),
            "failed" => Ok(FlowStatus::Failed),
            other => Err(format!("unknown flow status '{}'", other)),
        }
    }
}

/// Lifecycle of one task execution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Running,
    Completed,
    Failed,
    /// The task body succeeded but its result could not be serialized
    CompletedWithSerializationError,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Running => "running",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::CompletedWithSerializationError => "completed_with_serialization_error",
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "running" => Ok(TaskStatus::Running),
            "completed" => Ok(TaskStatus::Completed),
            "failed" => Ok(TaskStatus::Failed),
            "completed_with_serialization_error" => Ok(TaskStatus::CompletedWithSerializationError),
            other => Err(format!("unknown task status '{}'", other)),
        }
    }
}

/// One execution of a flow
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlowHistory {
    pub id: i64,
    pub flow_id: String,
    /// Trigger provenance plus the `remarks` list
    pub flow_metadata: Value,
    pub created_at: DateTime<Utc>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub input_data: Option<Value>,
    pub output_data: Option<Value>,
    pub status: FlowStatus,
}

impl FlowHistory {
    /// Remarks recorded on this execution, oldest first
    pub fn remarks(&self) -> Vec<Remark> {
        self.flow_metadata
            .get("remarks")
            .and_then(|r| serde_json::from_value(r.clone()).ok())
            .unwrap_or_default()
    }
}

/// One execution of a task inside a flow execution
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskHistory {
    pub id: i64,
    pub flow_history_id: i64,
    pub name: String,
    pub created_at: DateTime<Utc>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub input_data: Option<Value>,
    pub output_data: Option<Value>,
    pub status: TaskStatus,
    pub progress: Option<u8>,
    pub progress_message: Option<String>,
    pub progress_updated_at: Option<DateTime<Utc>>,
}

/// Severity of a remark attached to a flow execution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RemarkLevel {
    Info,
    Warning,
    Error,
}

/// A note appended to a flow execution while it runs
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Remark {
    pub level: RemarkLevel,
    pub message: String,
    pub created_at: DateTime<Utc>,
}

/// Aggregated execution counters for one flow
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FlowStatistics {
    pub total_count: i64,
    pub success_count: i64,
    pub failed_count: i64,
    pub running_count: i64,
    pub pending_count: i64,
    /// Percentage of completed executions, rounded to two decimals
    pub success_rate: f64,
    /// Mean wall-clock duration of completed executions, in seconds
    pub avg_duration_secs: f64,
    pub latest_status: Option<FlowStatus>,
    pub latest_execution: Option<DateTime<Utc>>,
}

/// One entry of the schema migration ledger
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MigrationRecord {
    pub version: String,
    pub name: String,
    pub description: Option<String>,
    pub applied_at: String,
}

/// A page of results plus the totals needed to render pagination
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub page: u32,
    pub per_page: u32,
    pub total: i64,
    pub total_pages: i64,
}

/// Row offset of a 1-based page, saturating instead of overflowing
pub(crate) fn page_offset(page: u32, per_page: u32) -> i64 {
    i64::from(page.saturating_sub(1)).saturating_mul(i64::from(per_page))
}

impl<T> Page<T> {
    pub(crate) fn new(items: Vec<T>, page: u32, per_page: u32, total: i64) -> Self {
        let per_page_i = i64::from(per_page.max(1));
        Self {
            items,
            page,
            per_page,
            total,
            total_pages: (total + per_page_i - 1) / per_page_i,
        }
    }
}
