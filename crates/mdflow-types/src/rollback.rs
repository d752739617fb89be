//! Rollback records kept by the compensation registry.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub use crate::workflow::RollbackStrategy;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RollbackStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
    Skipped,
}

/// How to undo one completed step.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RollbackAction {
    pub step_name: String,
    /// Index of the top-level step that recorded the action.
    pub step_index: usize,
    pub strategy: RollbackStrategy,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compensate_action: Option<String>,
    #[serde(default)]
    pub compensate_inputs: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state_snapshot: Option<Value>,
    pub status: RollbackStatus,
    pub recorded_at: DateTime<Utc>,
}

impl RollbackAction {
    pub fn new(step_name: impl Into<String>, step_index: usize, strategy: RollbackStrategy) -> Self {
        Self {
            step_name: step_name.into(),
            step_index,
            strategy,
            compensate_action: None,
            compensate_inputs: Value::Null,
            state_snapshot: None,
            status: RollbackStatus::Pending,
            recorded_at: Utc::now(),
        }
    }

    pub fn with_compensation(mut self, action: impl Into<String>, inputs: Value) -> Self {
        self.compensate_action = Some(action.into());
        self.compensate_inputs = inputs;
        self
    }

    pub fn with_snapshot(mut self, snapshot: Value) -> Self {
        self.state_snapshot = Some(snapshot);
        self
    }
}

/// Counts produced by a rollback walk.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RollbackReport {
    pub rolled_back: usize,
    pub failed: usize,
    pub skipped: usize,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<String>,
    /// Step names in the order they were visited.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub visited: Vec<String>,
}

impl RollbackReport {
    pub fn is_success(&self) -> bool {
        self.failed == 0
    }
}
