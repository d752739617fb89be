//! Workflow document model for mdflow.
//!
//! A workflow is authored as YAML front-matter inside a markdown file. After
//! parsing it becomes an immutable `Workflow`: metadata, declared inputs, tool
//! configuration and an ordered list of `Step`s. Every step carries a set of
//! common fields plus one `StepKind` variant selected by the `type` key.

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

// ---------------------------------------------------------------------------
// Workflow
// ---------------------------------------------------------------------------

/// A parsed workflow document.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Workflow {
    pub metadata: WorkflowMetadata,
    /// Declared inputs keyed by name.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub inputs: BTreeMap<String, InputDefinition>,
    /// Tool configuration consumed by the SDK registry.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub tools: BTreeMap<String, ToolConfig>,
    /// Ordered top-level steps.
    pub steps: Vec<Step>,
    /// Trigger documents. The engine never interprets these.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub triggers: Vec<Value>,
    /// File the workflow was loaded from, if any.
    #[serde(skip)]
    pub source_path: Option<PathBuf>,
}

impl Workflow {
    /// Directory sub-workflow paths are resolved against.
    pub fn base_dir(&self) -> Option<PathBuf> {
        self.source_path
            .as_ref()
            .and_then(|p| p.parent())
            .map(|p| p.to_path_buf())
    }

    /// Display name, falling back to the id.
    pub fn display_name(&self) -> &str {
        self.metadata.name.as_deref().unwrap_or(&self.metadata.id)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowMetadata {
    #[serde(default)]
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// A declared workflow input.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InputDefinition {
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub input_type: Option<InputType>,
    #[serde(default)]
    pub required: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// JSON type a declared input must have.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InputType {
    String,
    Number,
    Integer,
    #[serde(alias = "bool")]
    Boolean,
    Array,
    Object,
    Any,
}

impl InputType {
    /// Whether `value` satisfies this declared type.
    pub fn accepts(&self, value: &Value) -> bool {
        match self {
            InputType::String => value.is_string(),
            InputType::Number => value.is_number(),
            InputType::Integer => value.is_i64() || value.is_u64(),
            InputType::Boolean => value.is_boolean(),
            InputType::Array => value.is_array(),
            InputType::Object => value.is_object(),
            InputType::Any => true,
        }
    }
}

/// Per-tool SDK configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ToolConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdk: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth: Option<Value>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub options: Map<String, Value>,
}

// ---------------------------------------------------------------------------
// Step
// ---------------------------------------------------------------------------

/// One step of a workflow.
///
/// Common fields live here; the variant payload is flattened from `kind`
/// and selected by the `type` key:
/// ```yaml
/// - id: notify
///   type: action
///   action: slack.chat.postMessage
///   inputs:
///     text: "{{ summary }}"
///   outputVariable: message
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Step {
    /// Unique within the containing list.
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Every condition must resolve truthy for the step to run.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Value>,
    /// Per-attempt timeout in seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_variable: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_handling: Option<ErrorHandling>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rollback: Option<RollbackConfig>,
    #[serde(flatten)]
    pub kind: StepKind,
}

impl Step {
    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.id)
    }

    /// The error action, `stop` when no `errorHandling` block is present.
    pub fn error_action(&self) -> ErrorAction {
        self.error_handling
            .as_ref()
            .map(|eh| eh.action)
            .unwrap_or_default()
    }
}

/// Variant payload of a step, tagged by `type`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StepKind {
    Action(ActionStep),
    #[serde(rename = "workflow")]
    SubWorkflow(SubWorkflowStep),
    If(IfStep),
    Switch(SwitchStep),
    #[serde(alias = "foreach", alias = "for-each")]
    ForEach(ForEachStep),
    While(WhileStep),
    Map(MapStep),
    Filter(FilterStep),
    Reduce(ReduceStep),
    Parallel(ParallelStep),
    Try(TryStep),
}

impl StepKind {
    /// The `type` tag as written in workflow files.
    pub fn type_name(&self) -> &'static str {
        match self {
            StepKind::Action(_) => "action",
            StepKind::SubWorkflow(_) => "workflow",
            StepKind::If(_) => "if",
            StepKind::Switch(_) => "switch",
            StepKind::ForEach(_) => "for_each",
            StepKind::While(_) => "while",
            StepKind::Map(_) => "map",
            StepKind::Filter(_) => "filter",
            StepKind::Reduce(_) => "reduce",
            StepKind::Parallel(_) => "parallel",
            StepKind::Try(_) => "try",
        }
    }

    /// Nested step lists, for validation walks.
    pub fn child_lists(&self) -> Vec<&[Step]> {
        match self {
            StepKind::If(s) => vec![s.then.as_slice(), s.else_steps.as_slice()],
            StepKind::Switch(s) => {
                let mut lists: Vec<&[Step]> = s.cases.values().map(|v| v.as_slice()).collect();
                lists.push(s.default.as_slice());
                lists
            }
            StepKind::ForEach(s) => vec![s.body.as_slice()],
            StepKind::While(s) => vec![s.body.as_slice()],
            StepKind::Parallel(s) => s.branches.iter().map(|b| b.steps.as_slice()).collect(),
            StepKind::Try(s) => {
                let mut lists: Vec<&[Step]> = vec![s.try_steps.as_slice()];
                if let Some(catch) = &s.catch {
                    lists.push(catch.as_slice());
                }
                if let Some(finally) = &s.finally {
                    lists.push(finally.as_slice());
                }
                lists
            }
            _ => Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionStep {
    pub action: String,
    #[serde(default)]
    pub inputs: Map<String, Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubWorkflowStep {
    /// Path of the child workflow, relative to the parent's directory.
    #[serde(alias = "workflow")]
    pub workflow_path: String,
    #[serde(default)]
    pub inputs: Map<String, Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IfStep {
    pub condition: Value,
    #[serde(default)]
    pub then: Vec<Step>,
    #[serde(rename = "else", default)]
    pub else_steps: Vec<Step>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SwitchStep {
    pub expression: Value,
    #[serde(default)]
    pub cases: BTreeMap<String, Vec<Step>>,
    #[serde(default)]
    pub default: Vec<Step>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ForEachStep {
    pub items: Value,
    #[serde(default = "default_item_var")]
    pub item_var: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub index_var: Option<String>,
    #[serde(default, alias = "steps")]
    pub body: Vec<Step>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WhileStep {
    pub condition: Value,
    /// Hard cap on iterations. Reaching it ends the loop without failing.
    #[serde(default = "default_max_iterations")]
    pub max_iterations: u32,
    #[serde(default, alias = "steps")]
    pub body: Vec<Step>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MapStep {
    pub items: Value,
    #[serde(default = "default_item_var")]
    pub item_var: String,
    pub expression: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FilterStep {
    pub items: Value,
    #[serde(default = "default_item_var")]
    pub item_var: String,
    pub condition: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReduceStep {
    pub items: Value,
    #[serde(default = "default_item_var")]
    pub item_var: String,
    #[serde(default = "default_acc_var")]
    pub acc_var: String,
    #[serde(default)]
    pub initial_value: Value,
    pub expression: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParallelStep {
    pub branches: Vec<ParallelBranch>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_concurrent: Option<usize>,
    #[serde(default)]
    pub on_error: ParallelErrorMode,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParallelBranch {
    pub id: String,
    pub steps: Vec<Step>,
}

/// How a parallel step reacts to a failing branch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParallelErrorMode {
    /// First failure cancels outstanding branches and fails the step.
    #[default]
    Stop,
    /// All branches run; failures are reported in the step output.
    Continue,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TryStep {
    #[serde(rename = "try")]
    pub try_steps: Vec<Step>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub catch: Option<Vec<Step>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finally: Option<Vec<Step>>,
    #[serde(default = "default_error_var")]
    pub error_var: String,
}

fn default_item_var() -> String {
    "item".to_string()
}

fn default_acc_var() -> String {
    "acc".to_string()
}

fn default_error_var() -> String {
    "error".to_string()
}

fn default_max_iterations() -> u32 {
    100
}

// ---------------------------------------------------------------------------
// Error handling
// ---------------------------------------------------------------------------

/// Per-step error handling policy.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorHandling {
    #[serde(default)]
    pub action: ErrorAction,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_retries: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_delay_seconds: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backoff: Option<BackoffStrategy>,
    /// Action invoked with the same inputs once retries are exhausted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fallback_action: Option<String>,
}

/// What happens after a step fails terminally.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorAction {
    /// Record the failure and move on to the next step.
    Continue,
    /// Fail the workflow.
    #[default]
    Stop,
    /// Retry the step, then fail the workflow.
    Retry,
}

/// Delay growth between retry attempts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    #[default]
    Fixed,
    Linear,
    Exponential,
}

// ---------------------------------------------------------------------------
// Rollback configuration
// ---------------------------------------------------------------------------

/// How a completed step is undone when the workflow rolls back.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RollbackConfig {
    /// Defaults to `compensate` when `action` is set, `none` otherwise.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub strategy: Option<RollbackStrategy>,
    /// Compensation handler id.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action: Option<String>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub inputs: Map<String, Value>,
    /// Variables to restore. Defaults to the pre-step variable snapshot.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snapshot: Option<Value>,
}

impl RollbackConfig {
    pub fn effective_strategy(&self) -> RollbackStrategy {
        match (self.strategy, &self.action) {
            (Some(strategy), _) => strategy,
            (None, Some(_)) => RollbackStrategy::Compensate,
            (None, None) => RollbackStrategy::None,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RollbackStrategy {
    #[default]
    None,
    Compensate,
    Restore,
    Idempotent,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_action_step_deserializes_with_common_fields() {
        let step: Step = serde_json::from_value(json!({
            "id": "send",
            "type": "action",
            "action": "slack.chat.postMessage",
            "inputs": { "text": "hi" },
            "outputVariable": "message",
            "timeout": 30,
            "errorHandling": { "action": "continue", "maxRetries": 2 }
        }))
        .unwrap();

        assert_eq!(step.id, "send");
        assert_eq!(step.output_variable.as_deref(), Some("message"));
        assert_eq!(step.timeout, Some(30));
        assert_eq!(step.error_action(), ErrorAction::Continue);
        match step.kind {
            StepKind::Action(a) => {
                assert_eq!(a.action, "slack.chat.postMessage");
                assert_eq!(a.inputs["text"], json!("hi"));
            }
            other => panic!("expected action, got {}", other.type_name()),
        }
    }

    #[test]
    fn test_for_each_aliases() {
        for tag in ["for_each", "foreach", "for-each"] {
            let step: Step = serde_json::from_value(json!({
                "id": "loop",
                "type": tag,
                "items": "{{ list }}",
                "steps": []
            }))
            .unwrap();
            match step.kind {
                StepKind::ForEach(f) => assert_eq!(f.item_var, "item"),
                other => panic!("expected for_each, got {}", other.type_name()),
            }
        }
    }

    #[test]
    fn test_sub_workflow_accepts_workflow_key() {
        let step: Step = serde_json::from_value(json!({
            "id": "child",
            "type": "workflow",
            "workflow": "./child.md",
            "inputs": { "a": 10 }
        }))
        .unwrap();
        match step.kind {
            StepKind::SubWorkflow(s) => assert_eq!(s.workflow_path, "./child.md"),
            other => panic!("expected workflow, got {}", other.type_name()),
        }
    }

    #[test]
    fn test_try_step_and_defaults() {
        let step: Step = serde_json::from_value(json!({
            "id": "guarded",
            "type": "try",
            "try": [{ "id": "a", "type": "action", "action": "x" }],
            "finally": [{ "id": "b", "type": "action", "action": "y" }]
        }))
        .unwrap();
        match &step.kind {
            StepKind::Try(t) => {
                assert_eq!(t.try_steps.len(), 1);
                assert!(t.catch.is_none());
                assert_eq!(t.error_var, "error");
            }
            other => panic!("expected try, got {}", other.type_name()),
        }
        assert_eq!(step.kind.child_lists().len(), 2);
        assert_eq!(step.error_action(), ErrorAction::Stop);
    }

    #[test]
    fn test_while_default_cap() {
        let step: Step = serde_json::from_value(json!({
            "id": "poll",
            "type": "while",
            "condition": "{{ pending }}",
            "body": []
        }))
        .unwrap();
        match step.kind {
            StepKind::While(w) => assert_eq!(w.max_iterations, 100),
            other => panic!("expected while, got {}", other.type_name()),
        }
    }

    #[test]
    fn test_rollback_strategy_inference() {
        let with_action = RollbackConfig {
            action: Some("refund".to_string()),
            ..Default::default()
        };
        assert_eq!(with_action.effective_strategy(), RollbackStrategy::Compensate);
        assert_eq!(RollbackConfig::default().effective_strategy(), RollbackStrategy::None);

        let explicit = RollbackConfig {
            strategy: Some(RollbackStrategy::Restore),
            action: Some("ignored".to_string()),
            ..Default::default()
        };
        assert_eq!(explicit.effective_strategy(), RollbackStrategy::Restore);
    }

    #[test]
    fn test_input_type_accepts() {
        assert!(InputType::String.accepts(&json!("a")));
        assert!(!InputType::String.accepts(&json!(1)));
        assert!(InputType::Integer.accepts(&json!(3)));
        assert!(!InputType::Integer.accepts(&json!(3.5)));
        assert!(InputType::Number.accepts(&json!(3.5)));
        assert!(InputType::Any.accepts(&json!(null)));
    }

    #[test]
    fn test_unknown_step_type_rejected() {
        let result: Result<Step, _> = serde_json::from_value(json!({
            "id": "x",
            "type": "teleport"
        }));
        assert!(result.is_err());
    }
}
