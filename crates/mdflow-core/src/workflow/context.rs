//! Execution context with variable tracking and template scope.
//!
//! `ExecutionContext` is the mutable state that flows through one workflow
//! run: declared inputs, variables written by steps, the workflow output
//! map, and per-step bookkeeping. Loop and parallel bodies run against a
//! fork that is merged back when the body finishes.

use std::collections::BTreeMap;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use mdflow_types::execution::{StepStatus, WorkflowStatus};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use uuid::Uuid;

use crate::template::ScopeSource;

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// Maximum serialized size of a single step output (1 MB).
pub const MAX_STEP_OUTPUT_SIZE: usize = 1_048_576;

/// Root names that always resolve to context sections.
const ROOT_INPUTS: &str = "inputs";
const ROOT_VARIABLES: &str = "variables";
const ROOT_OUTPUTS: &str = "outputs";
const ROOT_WORKFLOW: &str = "workflow";

// ---------------------------------------------------------------------------
// ExecutionContext
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepMetadata {
    pub status: StepStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default)]
    pub retry_count: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionContext {
    pub workflow_id: String,
    pub run_id: Uuid,
    /// Declared inputs after defaults were applied. Read-only during a run.
    pub inputs: Map<String, Value>,
    pub variables: Map<String, Value>,
    /// `outputVariable` writes made through this context.
    pub outputs: Map<String, Value>,
    pub current_step_index: usize,
    pub status: WorkflowStatus,
    #[serde(default)]
    pub step_metadata: BTreeMap<String, StepMetadata>,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workflow_dir: Option<PathBuf>,
    #[serde(default)]
    pub depth: u32,
}

impl ExecutionContext {
    pub fn new(workflow_id: impl Into<String>, run_id: Uuid, inputs: Map<String, Value>) -> Self {
        Self {
            workflow_id: workflow_id.into(),
            run_id,
            inputs,
            variables: Map::new(),
            outputs: Map::new(),
            current_step_index: 0,
            status: WorkflowStatus::Pending,
            step_metadata: BTreeMap::new(),
            started_at: Utc::now(),
            workflow_dir: None,
            depth: 0,
        }
    }

    pub fn with_workflow_dir(mut self, dir: Option<PathBuf>) -> Self {
        self.workflow_dir = dir;
        self
    }

    pub fn with_depth(mut self, depth: u32) -> Self {
        self.depth = depth;
        self
    }

    /// Store a step result under `name` in both variables and outputs.
    ///
    /// Outputs larger than `MAX_STEP_OUTPUT_SIZE` are replaced by a marker
    /// object describing the overflow.
    pub fn set_output(&mut self, name: &str, value: Value) {
        let size = serde_json::to_string(&value).map(|s| s.len()).unwrap_or(0);
        let value = if size > MAX_STEP_OUTPUT_SIZE {
            tracing::warn!(
                variable = name,
                size,
                max = MAX_STEP_OUTPUT_SIZE,
                "step output exceeds size limit, truncating"
            );
            json!({
                "_truncated": true,
                "_original_size": size,
                "_message": format!("output exceeded {MAX_STEP_OUTPUT_SIZE} byte limit and was truncated"),
            })
        } else {
            value
        };
        self.variables.insert(name.to_string(), value.clone());
        self.outputs.insert(name.to_string(), value);
    }

    pub fn set_variable(&mut self, name: impl Into<String>, value: Value) {
        self.variables.insert(name.into(), value);
    }

    pub fn get_variable(&self, name: &str) -> Option<&Value> {
        self.variables.get(name)
    }

    pub fn record_step(&mut self, step_id: &str, metadata: StepMetadata) {
        self.step_metadata.insert(step_id.to_string(), metadata);
    }

    /// Independent copy for a loop iteration or parallel branch.
    pub fn fork(&self) -> Self {
        self.clone()
    }

    /// Variables and outputs `self` changed relative to `base`.
    pub fn changed_variables(&self, base: &ExecutionContext) -> Map<String, Value> {
        self.variables
            .iter()
            .filter(|(k, v)| base.variables.get(*k) != Some(*v))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    /// Fold a finished fork back in. Names in `exclude` (loop bindings) are
    /// dropped so they never leak past the loop.
    pub fn merge_from(&mut self, child: &ExecutionContext, exclude: &[&str]) {
        for (k, v) in &child.variables {
            if exclude.contains(&k.as_str()) {
                continue;
            }
            if self.variables.get(k) != Some(v) {
                self.variables.insert(k.clone(), v.clone());
            }
        }
        for (k, v) in &child.outputs {
            if !exclude.contains(&k.as_str()) {
                self.outputs.insert(k.clone(), v.clone());
            }
        }
        for (id, meta) in &child.step_metadata {
            self.step_metadata.insert(id.clone(), meta.clone());
        }
    }

    /// Serialize the context for checkpointing.
    pub fn to_json(&self) -> Value {
        serde_json::to_value(self).unwrap_or(json!({}))
    }

    /// Restore a context from a checkpoint snapshot.
    pub fn from_json(value: Value) -> Result<Self, serde_json::Error> {
        serde_json::from_value(value)
    }

    fn workflow_root(&self) -> Value {
        json!({ "id": self.workflow_id, "runId": self.run_id.to_string() })
    }
}

impl ScopeSource for ExecutionContext {
    fn lookup(&self, name: &str) -> Option<Value> {
        if let Some(v) = self.variables.get(name) {
            return Some(v.clone());
        }
        if let Some(v) = self.inputs.get(name) {
            return Some(v.clone());
        }
        match name {
            ROOT_INPUTS => Some(Value::Object(self.inputs.clone())),
            ROOT_VARIABLES => Some(Value::Object(self.variables.clone())),
            ROOT_OUTPUTS => Some(Value::Object(self.outputs.clone())),
            ROOT_WORKFLOW => Some(self.workflow_root()),
            _ => None,
        }
    }

    fn snapshot(&self) -> Value {
        let mut root = Map::new();
        root.insert(ROOT_INPUTS.into(), Value::Object(self.inputs.clone()));
        root.insert(ROOT_VARIABLES.into(), Value::Object(self.variables.clone()));
        root.insert(ROOT_OUTPUTS.into(), Value::Object(self.outputs.clone()));
        root.insert(ROOT_WORKFLOW.into(), self.workflow_root());
        for (k, v) in self.inputs.iter().chain(self.variables.iter()) {
            root.insert(k.clone(), v.clone());
        }
        Value::Object(root)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
