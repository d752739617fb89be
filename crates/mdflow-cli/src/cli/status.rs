//! `mdflow status` and `mdflow cleanup`.

use anyhow::{Context, Result};
use comfy_table::{presets, Cell, Color, ContentArrangement, Table};
use console::style;
use uuid::Uuid;

use mdflow_types::execution::{ExecutionRecord, WorkflowStatus};

use super::run::{status_label, step_color};
use crate::state::AppState;

// ---------------------------------------------------------------------------
// List
// ---------------------------------------------------------------------------

pub async fn list_runs(state: &AppState, limit: u32, json: bool) -> Result<()> {
    let records = state
        .engine
        .checkpoints()
        .list_executions(None, limit)
        .await
        .context("Failed to list runs")?;

    if json {
        let out: Vec<_> = records.iter().map(record_json).collect();
        println!("{}", serde_json::to_string_pretty(&out)?);
        return Ok(());
    }

    if records.is_empty() {
        println!();
        println!("  No runs recorded in {}.", state.db_path.display());
        println!("  Start one with: {}", style("mdflow run <file.md>").dim());
        println!();
        return Ok(());
    }

    let mut table = Table::new();
    table
        .load_preset(presets::UTF8_FULL_CONDENSED)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec![
            Cell::new("Run ID").fg(Color::Cyan),
            Cell::new("Workflow"),
            Cell::new("Status"),
            Cell::new("Progress"),
            Cell::new("Started"),
        ]);

    for r in &records {
        table.add_row(vec![
            Cell::new(r.run_id),
            Cell::new(&r.workflow_id),
            Cell::new(status_label(r.status)).fg(run_color(r.status)),
            Cell::new(format!("{}/{}", r.current_step, r.total_steps)),
            Cell::new(r.started_at.format("%Y-%m-%d %H:%M:%S")),
        ]);
    }

    println!();
    println!("{table}");
    println!();

    Ok(())
}

// ---------------------------------------------------------------------------
// Single run
// ---------------------------------------------------------------------------

pub async fn show_run(state: &AppState, run_id: &str, json: bool) -> Result<()> {
    let run_id: Uuid = run_id
        .parse()
        .with_context(|| format!("Invalid run ID '{run_id}'"))?;
    let checkpoints = state.engine.checkpoints();
    let record = checkpoints
        .get_execution(run_id)
        .await
        .with_context(|| format!("Run {run_id} not found"))?;
    let steps = checkpoints
        .list_checkpoints(run_id)
        .await
        .context("Failed to load checkpoints")?;
    let resume_point = checkpoints
        .get_resume_point(run_id)
        .await
        .context("Failed to compute resume point")?;

    if json {
        let mut out = record_json(&record);
        out["resume_point"] = serde_json::json!(resume_point);
        out["outputs"] = record.outputs.clone();
        out["checkpoints"] = serde_json::to_value(&steps)?;
        println!("{}", serde_json::to_string_pretty(&out)?);
        return Ok(());
    }

    println!();
    println!(
        "  Run {} of '{}'",
        style(record.run_id).bold(),
        style(&record.workflow_id).cyan()
    );
    println!(
        "  Status:   {}",
        style(status_label(record.status)).fg(console_color(record.status))
    );
    if let Some(path) = &record.workflow_path {
        println!("  File:     {path}");
    }
    println!("  Started:  {}", record.started_at.to_rfc3339());
    if let Some(done) = record.completed_at {
        println!("  Finished: {}", done.to_rfc3339());
    }
    if let Some(err) = &record.error {
        println!("  Error:    {}", style(err).red());
    }
    if !record.status.is_terminal() || record.status == WorkflowStatus::Failed {
        println!(
            "  Resume:   step {} ({})",
            resume_point,
            style(format!("mdflow resume {} <file.md>", record.run_id)).dim()
        );
    }
    println!();

    if steps.is_empty() {
        println!("  No step checkpoints.");
        println!();
        return Ok(());
    }

    let mut table = Table::new();
    table
        .load_preset(presets::UTF8_FULL_CONDENSED)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec![
            Cell::new("#").fg(Color::Cyan),
            Cell::new("Step"),
            Cell::new("Status"),
            Cell::new("Retries"),
            Cell::new("Error"),
        ]);

    for c in &steps {
        table.add_row(vec![
            Cell::new(c.step_index),
            Cell::new(&c.step_name),
            Cell::new(format!("{:?}", c.status).to_lowercase()).fg(step_color(c.status)),
            Cell::new(c.retry_count),
            Cell::new(c.error.as_deref().unwrap_or("")),
        ]);
    }
    println!("{table}");
    println!();

    Ok(())
}

// ---------------------------------------------------------------------------
// Cleanup
// ---------------------------------------------------------------------------

pub async fn cleanup(state: &AppState, days: Option<u32>, json: bool) -> Result<()> {
    let days = days.unwrap_or(state.config.checkpoint_retention_days);
    let removed = state
        .engine
        .checkpoints()
        .cleanup(days)
        .await
        .context("Failed to clean up old runs")?;

    if json {
        let out = serde_json::json!({ "removed": removed, "retention_days": days });
        println!("{}", serde_json::to_string_pretty(&out)?);
    } else {
        println!();
        println!(
            "  {} Removed {} run(s) older than {} day(s)",
            style("*").green().bold(),
            removed,
            days
        );
        println!("  Data directory: {}", state.data_dir.display());
        println!();
    }

    Ok(())
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn record_json(r: &ExecutionRecord) -> serde_json::Value {
    serde_json::json!({
        "run_id": r.run_id.to_string(),
        "workflow_id": r.workflow_id,
        "workflow_path": r.workflow_path,
        "status": status_label(r.status),
        "current_step": r.current_step,
        "total_steps": r.total_steps,
        "started_at": r.started_at.to_rfc3339(),
        "completed_at": r.completed_at.map(|t| t.to_rfc3339()),
        "error": r.error,
    })
}

fn run_color(status: WorkflowStatus) -> Color {
    match status {
        WorkflowStatus::Completed => Color::Green,
        WorkflowStatus::Failed => Color::Red,
        WorkflowStatus::Cancelled => Color::DarkGrey,
        WorkflowStatus::Pending | WorkflowStatus::Running => Color::Yellow,
    }
}

fn console_color(status: WorkflowStatus) -> console::Color {
    match status {
        WorkflowStatus::Completed => console::Color::Green,
        WorkflowStatus::Failed => console::Color::Red,
        WorkflowStatus::Cancelled => console::Color::White,
        WorkflowStatus::Pending | WorkflowStatus::Running => console::Color::Yellow,
    }
}
