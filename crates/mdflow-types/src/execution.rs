//! Execution tracking types: step and workflow results, checkpoints and
//! persisted execution records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::rollback::RollbackReport;

// ---------------------------------------------------------------------------
// Status enums
// ---------------------------------------------------------------------------

/// Overall status of a workflow run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl WorkflowStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            WorkflowStatus::Completed | WorkflowStatus::Failed | WorkflowStatus::Cancelled
        )
    }
}

/// Status of a single step within a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Skipped,
}

impl StepStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            StepStatus::Completed | StepStatus::Failed | StepStatus::Skipped
        )
    }
}

// ---------------------------------------------------------------------------
// Results
// ---------------------------------------------------------------------------

/// Outcome of one top-level step in one run.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepResult {
    pub step_id: String,
    pub status: StepStatus,
    #[serde(default)]
    pub output: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    pub duration_ms: u64,
    /// Retries made beyond the first attempt.
    pub retry_count: u32,
}

impl StepResult {
    /// A step whose conditions were falsy.
    pub fn skipped(step_id: &str) -> Self {
        let now = Utc::now();
        Self {
            step_id: step_id.to_string(),
            status: StepStatus::Skipped,
            output: Value::Null,
            error: None,
            started_at: now,
            completed_at: Some(now),
            duration_ms: 0,
            retry_count: 0,
        }
    }
}

/// Outcome of a whole run.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowResult {
    pub run_id: Uuid,
    pub workflow_id: String,
    pub status: WorkflowStatus,
    pub step_results: Vec<StepResult>,
    /// `outputVariable` -> output for every executed step.
    pub output: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    pub duration_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rollback: Option<RollbackReport>,
}

impl WorkflowResult {
    pub fn is_success(&self) -> bool {
        self.status == WorkflowStatus::Completed
    }

    pub fn step(&self, step_id: &str) -> Option<&StepResult> {
        self.step_results.iter().find(|r| r.step_id == step_id)
    }
}

// ---------------------------------------------------------------------------
// Persisted records
// ---------------------------------------------------------------------------

/// Durable record of one top-level step transition. Unique per
/// `(run_id, step_index)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepCheckpoint {
    pub run_id: Uuid,
    pub step_index: usize,
    pub step_name: String,
    pub status: StepStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub inputs: Value,
    #[serde(default)]
    pub outputs: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub retry_count: u32,
}

/// One row per run.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionRecord {
    pub run_id: Uuid,
    pub workflow_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workflow_path: Option<String>,
    pub status: WorkflowStatus,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    pub current_step: usize,
    pub total_steps: usize,
    #[serde(default)]
    pub inputs: Value,
    #[serde(default)]
    pub outputs: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Variable snapshot used when the run is resumed.
    #[serde(default)]
    pub metadata: Value,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_status_serialization() {
        assert_eq!(serde_json::to_value(StepStatus::Skipped).unwrap(), json!("skipped"));
        assert_eq!(
            serde_json::to_value(WorkflowStatus::Cancelled).unwrap(),
            json!("cancelled")
        );
    }

    #[test]
    fn test_terminal_states() {
        assert!(StepStatus::Completed.is_terminal());
        assert!(StepStatus::Skipped.is_terminal());
        assert!(!StepStatus::Running.is_terminal());
        assert!(WorkflowStatus::Failed.is_terminal());
        assert!(!WorkflowStatus::Pending.is_terminal());
    }

    #[test]
    fn test_step_result_camel_case() {
        let result = StepResult::skipped("check");
        let value = serde_json::to_value(&result).unwrap();
        assert_eq!(value["stepId"], json!("check"));
        assert_eq!(value["retryCount"], json!(0));
        assert!(value.get("error").is_none());
    }
}
