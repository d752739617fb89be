//! `mdflow validate`: parse a workflow file and report its shape.

use std::path::Path;

use anyhow::{Context, Result};
use console::style;

use mdflow_core::workflow::definition::{MarkdownParser, WorkflowParser};
use mdflow_types::workflow::Step;

pub fn validate(file: &Path, json: bool) -> Result<()> {
    let workflow = MarkdownParser::new()
        .parse_file(file)
        .with_context(|| format!("Invalid workflow {}", file.display()))?;

    let total = count_steps(&workflow.steps);

    if json {
        let out = serde_json::json!({
            "valid": true,
            "id": workflow.metadata.id,
            "name": workflow.metadata.name,
            "inputs": workflow.inputs.keys().collect::<Vec<_>>(),
            "steps": workflow.steps.len(),
            "total_steps": total,
            "triggers": workflow.triggers.len(),
        });
        println!("{}", serde_json::to_string_pretty(&out)?);
        return Ok(());
    }

    println!();
    println!(
        "  {} Workflow '{}' is valid",
        style("✓").green().bold(),
        style(&workflow.metadata.id).cyan()
    );
    if let Some(name) = &workflow.metadata.name {
        println!("  Name:   {name}");
    }
    println!("  Steps:  {} top-level, {} total", workflow.steps.len(), total);
    if !workflow.inputs.is_empty() {
        let names: Vec<&str> = workflow.inputs.keys().map(String::as_str).collect();
        println!("  Inputs: {}", names.join(", "));
    }
    println!();
    for (i, step) in workflow.steps.iter().enumerate() {
        print_step(step, i, 1);
    }
    println!();

    Ok(())
}

/// Every step, nested ones included.
fn count_steps(steps: &[Step]) -> usize {
    steps
        .iter()
        .map(|s| 1 + s.kind.child_lists().into_iter().map(count_steps).sum::<usize>())
        .sum()
}

fn print_step(step: &Step, index: usize, depth: usize) {
    let indent = "  ".repeat(depth);
    println!(
        "{indent}{} {} {}",
        style(format!("{}.", index + 1)).dim(),
        step.id,
        style(format!("({})", step.kind.type_name())).dim()
    );
    for list in step.kind.child_lists() {
        for (i, child) in list.iter().enumerate() {
            print_step(child, i, depth + 1);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validate_accepts_nested_workflow() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested.md");
        std::fs::write(
            &path,
            r#"---
name: Nested
steps:
  - id: each
    type: for_each
    items: "{{ inputs.users }}"
    steps:
      - id: greet
        action: core.format
        inputs:
          template: "hi {{ item }}"
---
Greets everyone.
"#,
        )
        .unwrap();

        let workflow = MarkdownParser::new().parse_file(&path).unwrap();
        assert_eq!(count_steps(&workflow.steps), 2);
        validate(&path, true).unwrap();
    }

    #[test]
    fn validate_rejects_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        assert!(validate(&dir.path().join("absent.md"), true).is_err());
    }
}
