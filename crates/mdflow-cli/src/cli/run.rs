//! `mdflow run` and `mdflow resume`.
//!
//! Actions outside the `core.*` namespace are handled by [`EchoExecutor`],
//! which returns the resolved inputs instead of calling a service. This makes
//! `run` a dry-run for templating, control flow and persistence.

use std::path::Path;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use comfy_table::{presets, Cell, Color, ContentArrangement, Table};
use console::style;
use futures_util::future::{BoxFuture, FutureExt};
use indicatif::{ProgressBar, ProgressStyle};
use serde_json::{json, Map, Value};
use uuid::Uuid;

use mdflow_core::workflow::{ActionExecutor, ActionInvocation};
use mdflow_types::execution::{StepStatus, WorkflowResult, WorkflowStatus};

use crate::state::AppState;

// ---------------------------------------------------------------------------
// Dry-run executor
// ---------------------------------------------------------------------------

/// Echoes each external action call back as its output.
pub struct EchoExecutor;

impl ActionExecutor for EchoExecutor {
    fn execute<'a>(&'a self, invocation: ActionInvocation<'a>) -> BoxFuture<'a, Result<Value, String>> {
        tracing::info!(
            step_id = invocation.step_id,
            action = invocation.action,
            "dry-run action"
        );
        let output = json!({
            "action": invocation.action,
            "inputs": invocation.inputs,
            "dryRun": true,
        });
        async move { Ok(output) }.boxed()
    }
}

// ---------------------------------------------------------------------------
// Inputs
// ---------------------------------------------------------------------------

/// Merge `--inputs-json` with `--input key=value` pairs.
///
/// Pair values are parsed as JSON when they parse (`count=3`, `flag=true`,
/// `tags=["a"]`) and kept as strings otherwise.
pub fn parse_inputs(pairs: &[String], inputs_json: Option<&str>) -> Result<Map<String, Value>> {
    let mut inputs = match inputs_json {
        Some(raw) => match serde_json::from_str::<Value>(raw).context("Invalid --inputs-json")? {
            Value::Object(map) => map,
            _ => bail!("--inputs-json must be a JSON object"),
        },
        None => Map::new(),
    };

    for pair in pairs {
        let Some((key, raw)) = pair.split_once('=') else {
            bail!("Invalid --input '{pair}': expected KEY=VALUE");
        };
        let key = key.trim();
        if key.is_empty() {
            bail!("Invalid --input '{pair}': empty key");
        }
        let value = serde_json::from_str::<Value>(raw).unwrap_or_else(|_| Value::String(raw.to_string()));
        inputs.insert(key.to_string(), value);
    }

    Ok(inputs)
}

// ---------------------------------------------------------------------------
// Run
// ---------------------------------------------------------------------------

pub async fn run(state: &AppState, file: &Path, inputs: Map<String, Value>, json: bool, quiet: bool) -> Result<()> {
    let workflow = state
        .engine
        .parser()
        .parse_file(file)
        .with_context(|| format!("Failed to load workflow {}", file.display()))?;

    let spinner = spinner(json || quiet, format!("Running '{}'...", workflow.metadata.id));
    let result = state.engine.execute(&workflow, inputs, &EchoExecutor).await;
    spinner.finish_and_clear();

    let result = result.with_context(|| format!("Workflow '{}' could not start", workflow.metadata.id))?;
    report(&result, json, quiet)
}

pub async fn resume(state: &AppState, run_id: &str, file: &Path, json: bool, quiet: bool) -> Result<()> {
    let run_id: Uuid = run_id
        .parse()
        .with_context(|| format!("Invalid run ID '{run_id}'"))?;
    let workflow = state
        .engine
        .parser()
        .parse_file(file)
        .with_context(|| format!("Failed to load workflow {}", file.display()))?;

    let spinner = spinner(json || quiet, format!("Resuming run {run_id}..."));
    let result = state.engine.resume(run_id, &workflow, &EchoExecutor).await;
    spinner.finish_and_clear();

    let result = result.with_context(|| format!("Failed to resume run {run_id}"))?;
    report(&result, json, quiet)
}

fn spinner(hidden: bool, message: String) -> ProgressBar {
    if hidden {
        return ProgressBar::hidden();
    }
    let spinner = ProgressBar::new_spinner();
    spinner.set_style(
        ProgressStyle::default_spinner()
            .template("{spinner:.cyan} {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner()),
    );
    spinner.set_message(message);
    spinner.enable_steady_tick(Duration::from_millis(80));
    spinner
}

// ---------------------------------------------------------------------------
// Output
// ---------------------------------------------------------------------------

fn report(result: &WorkflowResult, json: bool, quiet: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(result)?);
    } else if !quiet {
        print_result(result)?;
    }

    match result.status {
        WorkflowStatus::Completed => Ok(()),
        status => bail!(
            "Run {} {}: {}",
            result.run_id,
            status_label(status),
            result.error.as_deref().unwrap_or("no error recorded")
        ),
    }
}

fn print_result(result: &WorkflowResult) -> Result<()> {
    let marker = if result.is_success() {
        style("✓").green().bold()
    } else {
        style("✗").red().bold()
    };

    println!();
    println!(
        "  {marker} Workflow '{}' {} in {}ms",
        style(&result.workflow_id).cyan(),
        status_label(result.status),
        result.duration_ms
    );
    println!("  Run ID: {}", result.run_id);
    println!();

    let mut table = Table::new();
    table
        .load_preset(presets::UTF8_FULL_CONDENSED)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec![
            Cell::new("Step").fg(Color::Cyan),
            Cell::new("Status"),
            Cell::new("Duration"),
            Cell::new("Retries"),
            Cell::new("Error"),
        ]);

    for step in &result.step_results {
        table.add_row(vec![
            Cell::new(&step.step_id),
            Cell::new(format!("{:?}", step.status).to_lowercase()).fg(step_color(step.status)),
            Cell::new(format!("{}ms", step.duration_ms)),
            Cell::new(step.retry_count),
            Cell::new(step.error.as_deref().unwrap_or("")),
        ]);
    }
    println!("{table}");

    if !result.output.is_empty() {
        println!();
        println!("  {}", style("── Output ──").dim());
        println!("{}", serde_json::to_string_pretty(&result.output)?);
    }

    if let Some(rollback) = &result.rollback {
        println!();
        println!("  {}", style("── Rollback ──").dim());
        println!(
            "  Rolled back: {}  Failed: {}  Skipped: {}",
            rollback.rolled_back, rollback.failed, rollback.skipped
        );
        for err in &rollback.errors {
            println!("  {} {err}", style("!").yellow());
        }
    }
    println!();

    Ok(())
}

pub(crate) fn status_label(status: WorkflowStatus) -> &'static str {
    match status {
        WorkflowStatus::Pending => "pending",
        WorkflowStatus::Running => "running",
        WorkflowStatus::Completed => "completed",
        WorkflowStatus::Failed => "failed",
        WorkflowStatus::Cancelled => "cancelled",
    }
}

pub(crate) fn step_color(status: StepStatus) -> Color {
    match status {
        StepStatus::Completed => Color::Green,
        StepStatus::Failed => Color::Red,
        StepStatus::Skipped => Color::DarkGrey,
        StepStatus::Pending | StepStatus::Running => Color::Yellow,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mdflow_core::repository::InMemoryExecutionRepository;
    use mdflow_core::workflow::definition::{MarkdownParser, WorkflowParser};
    use mdflow_core::workflow::WorkflowEngine;
    use std::sync::Arc;

    #[test]
    fn parse_inputs_merges_json_and_pairs() {
        let inputs = parse_inputs(
            &[
                "channel=#ops".to_string(),
                "count=3".to_string(),
                "tags=[\"a\",\"b\"]".to_string(),
                "expr=a=b".to_string(),
            ],
            Some(r#"{"count": 1, "user": "ada"}"#),
        )
        .unwrap();

        assert_eq!(inputs["channel"], json!("#ops"));
        assert_eq!(inputs["count"], json!(3));
        assert_eq!(inputs["tags"], json!(["a", "b"]));
        assert_eq!(inputs["expr"], json!("a=b"));
        assert_eq!(inputs["user"], json!("ada"));
    }

    #[test]
    fn parse_inputs_rejects_bad_values() {
        assert!(parse_inputs(&["novalue".to_string()], None).is_err());
        assert!(parse_inputs(&["=x".to_string()], None).is_err());
        assert!(parse_inputs(&[], Some("[1, 2]")).is_err());
        assert!(parse_inputs(&[], Some("{oops")).is_err());
    }

    #[tokio::test]
    async fn echo_executor_returns_resolved_inputs() {
        let workflow = MarkdownParser::new()
            .parse_content(
                r#"---
id: notify
inputs:
  channel:
    type: string
    required: true
steps:
  - id: post
    action: slack.post_message
    inputs:
      channel: "{{ inputs.channel }}"
      text: "deploy done"
    outputVariable: message
---
"#,
            )
            .unwrap();

        let engine = WorkflowEngine::new(Arc::new(InMemoryExecutionRepository::new()));
        let mut inputs = Map::new();
        inputs.insert("channel".to_string(), json!("#ops"));
        let result = engine.execute(&workflow, inputs, &EchoExecutor).await.unwrap();

        assert!(result.is_success());
        assert_eq!(result.output["message"]["action"], json!("slack.post_message"));
        assert_eq!(result.output["message"]["inputs"]["channel"], json!("#ops"));
        assert_eq!(result.output["message"]["dryRun"], json!(true));
    }
}
