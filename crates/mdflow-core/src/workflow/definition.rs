//! Workflow definition parsing and validation.
//!
//! Workflows are markdown files whose leading `---` block holds YAML
//! front-matter. The front-matter is normalized (legacy step types inferred,
//! `workflow:` wrapper flattened), deserialized into `Workflow`, and checked
//! for structural problems before the engine ever sees it.

use std::collections::HashSet;
use std::path::Path;

use mdflow_types::workflow::{Step, StepKind, Workflow};
use serde_json::{Map, Value};
use thiserror::Error;

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum WorkflowError {
    /// YAML or document-shape failure.
    #[error("parse error: {0}")]
    ParseError(String),

    /// Structural validation failure.
    #[error("validation error: {0}")]
    ValidationError(String),

    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

// ---------------------------------------------------------------------------
// Parser trait
// ---------------------------------------------------------------------------

/// Turns workflow documents into validated `Workflow` values.
pub trait WorkflowParser: Send + Sync {
    /// Parse a document held in memory.
    fn parse_content(&self, content: &str) -> Result<Workflow, WorkflowError>;

    /// Parse a document from disk. The file stem becomes the workflow id when
    /// the document does not declare one.
    fn parse_file(&self, path: &Path) -> Result<Workflow, WorkflowError>;
}

/// Default parser for markdown files with YAML front-matter.
#[derive(Debug, Clone, Copy, Default)]
pub struct MarkdownParser;

impl MarkdownParser {
    pub fn new() -> Self {
        Self
    }

    fn parse_document(&self, content: &str, fallback_id: Option<&str>) -> Result<Workflow, WorkflowError> {
        let (front_matter, body) = split_front_matter(content);
        let raw: Value =
            serde_yaml_ng::from_str(front_matter).map_err(|e| WorkflowError::ParseError(e.to_string()))?;
        let Value::Object(raw) = raw else {
            return Err(WorkflowError::ParseError(
                "front-matter must be a mapping".to_string(),
            ));
        };

        let mut doc = normalize_document(raw);
        if let Some(Value::Array(steps)) = doc.get_mut("steps") {
            infer_step_types(steps);
        }

        let mut workflow: Workflow = serde_json::from_value(Value::Object(doc))
            .map_err(|e| WorkflowError::ParseError(e.to_string()))?;

        if workflow.metadata.id.is_empty() {
            workflow.metadata.id = fallback_id
                .map(str::to_string)
                .or_else(|| workflow.metadata.name.clone())
                .unwrap_or_default();
        }
        if workflow.metadata.description.is_none() {
            let body = body.trim();
            if !body.is_empty() {
                workflow.metadata.description = Some(body.to_string());
            }
        }

        validate_workflow(&workflow)?;
        Ok(workflow)
    }
}

impl WorkflowParser for MarkdownParser {
    fn parse_content(&self, content: &str) -> Result<Workflow, WorkflowError> {
        self.parse_document(content, None)
    }

    fn parse_file(&self, path: &Path) -> Result<Workflow, WorkflowError> {
        let content = std::fs::read_to_string(path)?;
        let stem = path.file_stem().and_then(|s| s.to_str());
        let mut workflow = self.parse_document(&content, stem)?;
        workflow.source_path = Some(path.to_path_buf());
        tracing::debug!(path = %path.display(), workflow = %workflow.metadata.id, "parsed workflow file");
        Ok(workflow)
    }
}

// ---------------------------------------------------------------------------
// Document normalization
// ---------------------------------------------------------------------------

/// Split `---` front-matter from the markdown body. A document without a
/// leading delimiter is treated as bare YAML.
fn split_front_matter(content: &str) -> (&str, &str) {
    let trimmed = content.trim_start_matches('\u{feff}');
    let Some(rest) = trimmed
        .strip_prefix("---\n")
        .or_else(|| trimmed.strip_prefix("---\r\n"))
    else {
        return (trimmed, "");
    };

    let mut offset = 0;
    for line in rest.split_inclusive('\n') {
        let marker = line.trim_end();
        if marker == "---" || marker == "..." {
            return (&rest[..offset], &rest[offset + line.len()..]);
        }
        offset += line.len();
    }
    (rest, "")
}

/// Flatten a `workflow:` wrapper and lift top-level identity keys into
/// `metadata` when no metadata block is present.
fn normalize_document(mut raw: Map<String, Value>) -> Map<String, Value> {
    if let Some(Value::Object(wrapped)) = raw.remove("workflow") {
        for (k, v) in wrapped {
            raw.entry(k).or_insert(v);
        }
    }

    if !raw.contains_key("metadata") {
        let mut metadata = Map::new();
        for key in ["id", "name", "version", "description"] {
            if let Some(v) = raw.remove(key) {
                metadata.insert(key.to_string(), v);
            }
        }
        raw.insert("metadata".to_string(), Value::Object(metadata));
    }

    raw
}

const NESTED_STEP_KEYS: [&str; 8] = ["then", "else", "default", "body", "steps", "try", "catch", "finally"];

/// Fill in a missing `type`: `action` wins over `workflow`/`workflowPath`.
fn infer_step_types(steps: &mut [Value]) {
    for step in steps.iter_mut() {
        let Value::Object(obj) = step else { continue };

        if !obj.contains_key("type") {
            let inferred = if obj.contains_key("action") {
                Some("action")
            } else if obj.contains_key("workflow") || obj.contains_key("workflowPath") {
                Some("workflow")
            } else {
                None
            };
            if let Some(t) = inferred {
                obj.insert("type".to_string(), Value::String(t.to_string()));
            }
        }

        for key in NESTED_STEP_KEYS {
            if let Some(Value::Array(children)) = obj.get_mut(key) {
                infer_step_types(children);
            }
        }
        if let Some(Value::Object(cases)) = obj.get_mut("cases") {
            for list in cases.values_mut() {
                if let Value::Array(children) = list {
                    infer_step_types(children);
                }
            }
        }
        if let Some(Value::Array(branches)) = obj.get_mut("branches") {
            for branch in branches.iter_mut() {
                if let Some(Value::Array(children)) = branch.get_mut("steps") {
                    infer_step_types(children);
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

/// Validate structural constraints on a parsed `Workflow`.
///
/// Checks:
/// - The workflow has an id and at least one step
/// - Step ids are non-empty and unique within each list
/// - Parallel branch ids are non-empty and unique
/// - `maxIterations` and `maxConcurrent` are >= 1
pub fn validate_workflow(workflow: &Workflow) -> Result<(), WorkflowError> {
    if workflow.metadata.id.trim().is_empty() {
        return Err(WorkflowError::ValidationError(
            "workflow id must not be empty".to_string(),
        ));
    }
    if workflow.steps.is_empty() {
        return Err(WorkflowError::ValidationError(
            "workflow must have at least one step".to_string(),
        ));
    }
    validate_steps(&workflow.steps)
}

fn validate_steps(steps: &[Step]) -> Result<(), WorkflowError> {
    let mut seen = HashSet::new();
    for step in steps {
        if step.id.trim().is_empty() {
            return Err(WorkflowError::ValidationError(
                "step id must not be empty".to_string(),
            ));
        }
        if !seen.insert(step.id.as_str()) {
            return Err(WorkflowError::ValidationError(format!(
                "duplicate step ID: '{}'",
                step.id
            )));
        }

        match &step.kind {
            StepKind::While(w) if w.max_iterations < 1 => {
                return Err(WorkflowError::ValidationError(format!(
                    "while step '{}' must have maxIterations >= 1",
                    step.id
                )));
            }
            StepKind::Parallel(p) => {
                if p.max_concurrent == Some(0) {
                    return Err(WorkflowError::ValidationError(format!(
                        "parallel step '{}' must have maxConcurrent >= 1",
                        step.id
                    )));
                }
                let mut branch_ids = HashSet::new();
                for branch in &p.branches {
                    if branch.id.trim().is_empty() || !branch_ids.insert(branch.id.as_str()) {
                        return Err(WorkflowError::ValidationError(format!(
                            "parallel step '{}' has an empty or duplicate branch id '{}'",
                            step.id, branch.id
                        )));
                    }
                }
            }
            _ => {}
        }

        for list in step.kind.child_lists() {
            validate_steps(list)?;
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
