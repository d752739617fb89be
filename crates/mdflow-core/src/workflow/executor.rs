//! Workflow engine: sequential top-level execution with durable checkpoints.
//!
//! `WorkflowEngine` owns the shared services (resolver, hooks, circuit
//! breaker, parser, compensation handlers) and a `CheckpointManager`. Each
//! run walks the top-level steps in order through a `StepRunner`,
//! checkpointing every step transition so an interrupted run can resume.
//!
//! # Execution flow
//!
//! 1. Apply input defaults and type checks, create the `ExecutionRecord`.
//! 2. For each top-level step: check cancellation, checkpoint `running`,
//!    execute, checkpoint the terminal status together with the context.
//! 3. On failure, optionally roll back every recorded action.
//! 4. Update the run record with the final status and outputs.

use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use dashmap::DashMap;
use futures_util::future::BoxFuture;
use mdflow_types::config::EngineConfig;
use mdflow_types::execution::{ExecutionRecord, StepCheckpoint, StepResult, StepStatus, WorkflowResult, WorkflowStatus};
use mdflow_types::workflow::{Step, Workflow};
use serde_json::{json, Map, Value};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::repository::ExecutionRepository;
use crate::template::TemplateResolver;

use super::checkpoint::{CheckpointError, CheckpointManager};
use super::circuit::CircuitBreaker;
use super::context::ExecutionContext;
use super::definition::{validate_workflow, MarkdownParser, WorkflowError, WorkflowParser};
use super::hooks::{HookDispatcher, HookEvent};
use super::rollback::{CompensationHandler, CompensationHandlers, CompensationRequest, RollbackRegistry};
use super::step_runner::{build_result, prepare_inputs, ActionExecutor, EngineServices, SdkRegistry, StepRunner};

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Errors that escape `execute()`. Step failures never do; they are recorded
/// on the returned `WorkflowResult`.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error(transparent)]
    Workflow(#[from] WorkflowError),

    #[error("input validation failed: {0}")]
    Validation(String),

    #[error("workflow run not found: {0}")]
    RunNotFound(Uuid),

    #[error("workflow run {0} already finished")]
    AlreadyFinished(Uuid),

    #[error(transparent)]
    Checkpoint(CheckpointError),
}

impl From<CheckpointError> for EngineError {
    fn from(e: CheckpointError) -> Self {
        match e {
            CheckpointError::RunNotFound(run_id) => EngineError::RunNotFound(run_id),
            other => EngineError::Checkpoint(other),
        }
    }
}

// ---------------------------------------------------------------------------
// WorkflowEngine
// ---------------------------------------------------------------------------

/// Markdown workflow engine.
///
/// Generic over `R: ExecutionRepository` for storage flexibility.
pub struct WorkflowEngine<R: ExecutionRepository> {
    services: EngineServices,
    checkpoint: CheckpointManager<R>,
    compensations: CompensationHandlers,
    /// Cancellation tokens keyed by run_id.
    cancellation_tokens: DashMap<Uuid, CancellationToken>,
}

impl<R: ExecutionRepository> WorkflowEngine<R> {
    pub fn new(repo: Arc<R>) -> Self {
        Self {
            services: EngineServices {
                config: EngineConfig::default(),
                resolver: TemplateResolver::new(),
                hooks: HookDispatcher::new(),
                circuit: None,
                parser: Arc::new(MarkdownParser::new()),
                sdk: None,
            },
            checkpoint: CheckpointManager::new(repo),
            compensations: CompensationHandlers::new(),
            cancellation_tokens: DashMap::new(),
        }
    }

    /// Replace the engine configuration. A configured circuit breaker
    /// replaces any breaker set earlier.
    pub fn with_config(mut self, config: EngineConfig) -> Self {
        if let Some(cb) = &config.circuit_breaker {
            self.services.circuit = Some(CircuitBreaker::from_config(cb));
        }
        self.services.config = config;
        self
    }

    pub fn with_hooks(mut self, hooks: HookDispatcher) -> Self {
        self.services.hooks = hooks;
        self
    }

    pub fn with_circuit_breaker(mut self, breaker: CircuitBreaker) -> Self {
        self.services.circuit = Some(breaker);
        self
    }

    pub fn with_parser(mut self, parser: Arc<dyn WorkflowParser>) -> Self {
        self.services.parser = parser;
        self
    }

    pub fn with_sdk_registry(mut self, sdk: Arc<dyn SdkRegistry>) -> Self {
        self.services.sdk = Some(sdk);
        self
    }

    pub fn with_resolver(mut self, resolver: TemplateResolver) -> Self {
        self.services.resolver = resolver;
        self
    }

    /// Register the handler invoked for `rollback.action: <action>`.
    pub fn register_compensation<F, Fut>(mut self, action: impl Into<String>, handler: F) -> Self
    where
        F: Fn(CompensationRequest) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<(), String>> + Send + 'static,
    {
        let handler: CompensationHandler = Arc::new(move |request| Box::pin(handler(request)));
        self.compensations.register(action, handler);
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.services.config
    }

    pub fn checkpoints(&self) -> &CheckpointManager<R> {
        &self.checkpoint
    }

    pub fn circuit_breaker(&self) -> Option<&CircuitBreaker> {
        self.services.circuit.as_ref()
    }

    pub fn parser(&self) -> &dyn WorkflowParser {
        self.services.parser.as_ref()
    }

    // -----------------------------------------------------------------------
    // Entry points
    // -----------------------------------------------------------------------

    /// Execute a workflow from its first step.
    pub async fn execute(
        &self,
        workflow: &Workflow,
        inputs: Map<String, Value>,
        executor: &dyn ActionExecutor,
    ) -> Result<WorkflowResult, EngineError> {
        validate_workflow(workflow)?;
        let inputs = prepare_inputs(workflow, inputs).map_err(EngineError::Validation)?;

        let run_id = Uuid::now_v7();
        let ctx = ExecutionContext::new(workflow.metadata.id.clone(), run_id, inputs.clone())
            .with_workflow_dir(workflow.base_dir());

        let record = ExecutionRecord {
            run_id,
            workflow_id: workflow.metadata.id.clone(),
            workflow_path: workflow
                .source_path
                .as_ref()
                .map(|p| p.display().to_string()),
            status: WorkflowStatus::Running,
            started_at: ctx.started_at,
            completed_at: None,
            current_step: 0,
            total_steps: workflow.steps.len(),
            inputs: Value::Object(inputs),
            outputs: json!({}),
            error: None,
            metadata: ctx.to_json(),
        };
        if let Err(e) = self.checkpoint.create_execution(&record).await {
            tracing::warn!(run_id = %run_id, error = %e, "failed to persist execution record");
        }

        tracing::info!(
            run_id = %run_id,
            workflow = %workflow.metadata.id,
            steps = workflow.steps.len(),
            "starting workflow execution"
        );

        Ok(self.run(workflow, ctx, 0, record, executor).await)
    }

    /// Parse a workflow file and execute it.
    pub async fn execute_file(
        &self,
        path: &Path,
        inputs: Map<String, Value>,
        executor: &dyn ActionExecutor,
    ) -> Result<WorkflowResult, EngineError> {
        let workflow = self.services.parser.parse_file(path)?;
        self.execute(&workflow, inputs, executor).await
    }

    /// Continue a persisted run from its resume point.
    ///
    /// The context is restored from the last persisted snapshot. The step at
    /// the resume point runs again even if it was in flight when the run
    /// stopped.
    pub async fn resume(
        &self,
        run_id: Uuid,
        workflow: &Workflow,
        executor: &dyn ActionExecutor,
    ) -> Result<WorkflowResult, EngineError> {
        let mut record = self.checkpoint.get_execution(run_id).await?;
        if record.status == WorkflowStatus::Completed {
            return Err(EngineError::AlreadyFinished(run_id));
        }

        let ctx = match ExecutionContext::from_json(record.metadata.clone()) {
            Ok(ctx) => ctx,
            Err(e) => {
                tracing::warn!(run_id = %run_id, error = %e, "context snapshot unreadable, restarting from inputs");
                let inputs = match &record.inputs {
                    Value::Object(map) => map.clone(),
                    _ => Map::new(),
                };
                ExecutionContext::new(workflow.metadata.id.clone(), run_id, inputs)
            }
        }
        .with_workflow_dir(workflow.base_dir());

        let start = self.checkpoint.get_resume_point(run_id).await?;
        tracing::info!(
            run_id = %run_id,
            workflow = %workflow.metadata.id,
            resume_from = start,
            "resuming workflow execution"
        );

        record.status = WorkflowStatus::Running;
        record.completed_at = None;
        record.error = None;
        record.total_steps = workflow.steps.len();

        Ok(self.run(workflow, ctx, start, record, executor).await)
    }

    /// Request cancellation of an in-flight run. Observed before the next
    /// top-level step. Returns false when the run is not active.
    pub fn cancel(&self, run_id: Uuid) -> bool {
        match self.cancellation_tokens.get(&run_id) {
            Some(token) => {
                token.cancel();
                tracing::info!(run_id = %run_id, "workflow cancellation requested");
                true
            }
            None => false,
        }
    }

    /// Run ids currently executing.
    pub fn active_runs(&self) -> Vec<Uuid> {
        self.cancellation_tokens.iter().map(|r| *r.key()).collect()
    }

    // -----------------------------------------------------------------------
    // Run loop
    // -----------------------------------------------------------------------

    async fn run(
        &self,
        workflow: &Workflow,
        mut ctx: ExecutionContext,
        start: usize,
        mut record: ExecutionRecord,
        executor: &dyn ActionExecutor,
    ) -> WorkflowResult {
        let clock = Instant::now();
        let run_id = ctx.run_id;
        let token = CancellationToken::new();
        self.cancellation_tokens.insert(run_id, token.clone());

        let rollback = Mutex::new(
            RollbackRegistry::new(
                self.services.config.rollback_max_history,
                Arc::new(self.compensations.clone()),
            )
            .for_run(run_id),
        );
        let runner = StepRunner::new(&self.services, executor, &rollback);

        self.workflow_hook(HookEvent::WorkflowBeforeStart, workflow, &ctx, json!({}))
            .await;
        ctx.status = WorkflowStatus::Running;
        self.workflow_hook(HookEvent::WorkflowAfterStart, workflow, &ctx, json!({ "resumeFrom": start }))
            .await;

        let mut step_results: Vec<StepResult> = Vec::with_capacity(workflow.steps.len().saturating_sub(start));
        let mut failure: Option<String> = None;
        let mut cancelled = false;

        for (index, step) in workflow.steps.iter().enumerate().skip(start) {
            if token.is_cancelled() {
                tracing::info!(run_id = %run_id, step_index = index, "workflow cancelled");
                cancelled = true;
                break;
            }

            ctx.current_step_index = index;
            self.save_checkpoint(&ctx, index, step, StepStatus::Running, None).await;

            let outcome = runner.at(index).execute_step(step, &mut ctx).await;

            self.save_checkpoint(&ctx, index, step, outcome.result.status, Some(&outcome.result))
                .await;
            record.current_step = index + 1;
            record.outputs = Value::Object(ctx.outputs.clone());
            record.metadata = ctx.to_json();
            self.persist_record(&record).await;

            step_results.push(outcome.result);
            if let Some(e) = outcome.halt {
                failure = Some(e.to_string());
                break;
            }
        }

        self.cancellation_tokens.remove(&run_id);

        let status = if cancelled {
            WorkflowStatus::Cancelled
        } else if failure.is_some() {
            WorkflowStatus::Failed
        } else {
            WorkflowStatus::Completed
        };

        let mut report = None;
        if let Some(error) = &failure {
            tracing::warn!(run_id = %run_id, workflow = %workflow.metadata.id, error = %error, "workflow failed");
            self.workflow_hook(HookEvent::WorkflowOnError, workflow, &ctx, json!({ "error": error }))
                .await;
            if self.services.config.rollback_on_failure {
                let mut registry = rollback.lock().await;
                report = Some(registry.rollback_all(&mut ctx.variables, false).await);
            }
        }

        self.workflow_hook(HookEvent::WorkflowBeforeEnd, workflow, &ctx, json!({ "status": status }))
            .await;
        ctx.status = status;

        record.status = status;
        record.completed_at = Some(Utc::now());
        record.outputs = Value::Object(ctx.outputs.clone());
        record.error = failure.clone();
        record.metadata = ctx.to_json();
        self.persist_record(&record).await;

        let mut result = build_result(&ctx, status, step_results, failure, clock);
        result.rollback = report;

        tracing::info!(
            run_id = %run_id,
            workflow = %workflow.metadata.id,
            status = ?status,
            duration_ms = result.duration_ms,
            "workflow finished"
        );
        self.workflow_hook(
            HookEvent::WorkflowAfterEnd,
            workflow,
            &ctx,
            json!({ "status": status, "durationMs": result.duration_ms }),
        )
        .await;

        result
    }

    async fn save_checkpoint(
        &self,
        ctx: &ExecutionContext,
        index: usize,
        step: &Step,
        status: StepStatus,
        result: Option<&StepResult>,
    ) {
        let checkpoint = StepCheckpoint {
            run_id: ctx.run_id,
            step_index: index,
            step_name: step.id.clone(),
            status,
            started_at: Some(result.map_or_else(Utc::now, |r| r.started_at)),
            completed_at: result.and_then(|r| r.completed_at),
            inputs: Value::Object(ctx.inputs.clone()),
            outputs: result.map_or(Value::Null, |r| r.output.clone()),
            error: result.and_then(|r| r.error.clone()),
            retry_count: result.map_or(0, |r| r.retry_count),
        };
        if let Err(e) = self.checkpoint.save_checkpoint(&checkpoint).await {
            tracing::warn!(run_id = %ctx.run_id, step_index = index, error = %e, "failed to persist checkpoint");
        }
    }

    async fn persist_record(&self, record: &ExecutionRecord) {
        if let Err(e) = self.checkpoint.update_execution(record).await {
            tracing::warn!(run_id = %record.run_id, error = %e, "failed to persist execution record");
        }
    }

    async fn workflow_hook(&self, event: HookEvent, workflow: &Workflow, ctx: &ExecutionContext, extra: Value) {
        let mut payload = json!({
            "workflowId": workflow.metadata.id,
            "runId": ctx.run_id.to_string(),
            "depth": ctx.depth,
        });
        if let (Value::Object(payload), Value::Object(extra)) = (&mut payload, extra) {
            payload.extend(extra);
        }
        self.services.hooks.dispatch(event, payload).await;
    }
}

impl<R: ExecutionRepository> std::fmt::Debug for WorkflowEngine<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkflowEngine")
            .field("config", &self.services.config)
            .field("hooks", &self.services.hooks)
            .field("compensations", &self.compensations)
            .field("active_runs", &self.cancellation_tokens.len())
            .finish_non_exhaustive()
    }
}

/// Adapts a plain async closure into an `ActionExecutor`.
pub struct FnExecutor<F> {
    f: F,
}

impl<F> FnExecutor<F>
where
    F: Fn(String, Value) -> BoxFuture<'static, Result<Value, String>> + Send + Sync,
{
    pub fn new(f: F) -> Self {
        Self { f }
    }
}

impl<F> ActionExecutor for FnExecutor<F>
where
    F: Fn(String, Value) -> BoxFuture<'static, Result<Value, String>> + Send + Sync,
{
    fn execute<'a>(
        &'a self,
        invocation: super::step_runner::ActionInvocation<'a>,
    ) -> BoxFuture<'a, Result<Value, String>> {
        (self.f)(invocation.action.to_string(), invocation.inputs)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::InMemoryExecutionRepository;
    use crate::workflow::step_runner::ActionInvocation;
    use futures_util::future::FutureExt;
    use mdflow_types::config::CircuitBreakerConfig;
    use std::collections::HashMap;
    use std::sync::Mutex as StdMutex;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::time::Duration;

    /// Scripted executor: counts calls, fails configured actions a fixed
    /// number of times, and answers a few well-known actions.
    #[derive(Default)]
    struct ScriptedExecutor {
        calls: StdMutex<Vec<(String, Value)>>,
        failures: StdMutex<HashMap<String, u32>>,
        broken: StdMutex<Vec<String>>,
    }

    impl ScriptedExecutor {
        fn failing(self, action: &str, times: u32) -> Self {
            self.failures.lock().unwrap().insert(action.to_string(), times);
            self
        }

        fn broken(self, action: &str) -> Self {
            self.broken.lock().unwrap().push(action.to_string());
            self
        }

        fn repair(&self, action: &str) {
            self.broken.lock().unwrap().retain(|a| a != action);
        }

        fn calls_to(&self, action: &str) -> usize {
            self.calls.lock().unwrap().iter().filter(|(a, _)| a == action).count()
        }

        fn total_calls(&self) -> usize {
            self.calls.lock().unwrap().len()
        }
    }

    impl ActionExecutor for ScriptedExecutor {
        fn execute<'a>(&'a self, invocation: ActionInvocation<'a>) -> BoxFuture<'a, Result<Value, String>> {
            let action = invocation.action.to_string();
            let inputs = invocation.inputs;
            let result = {
                let mut calls = self.calls.lock().unwrap();
                calls.push((action.clone(), inputs.clone()));
                let n = calls.len();
                drop(calls);

                let mut failures = self.failures.lock().unwrap();
                if self.broken.lock().unwrap().contains(&action) {
                    Err(format!("{action} is unavailable"))
                } else if let Some(left) = failures.get_mut(&action).filter(|left| **left > 0) {
                    *left -= 1;
                    Err(format!("{action} transient failure"))
                } else if action == "slack.chat.postMessage" {
                    Ok(json!({
                        "ts": format!("1700000000.{n:06}"),
                        "channel": inputs["channel"],
                        "text": inputs["text"],
                    }))
                } else {
                    Ok(inputs)
                }
            };
            async move { result }.boxed()
        }
    }

    fn fast_config() -> EngineConfig {
        EngineConfig {
            retry_base_delay_ms: 0,
            retry_max_delay_ms: 0,
            ..EngineConfig::default()
        }
    }

    fn engine() -> WorkflowEngine<InMemoryExecutionRepository> {
        WorkflowEngine::new(Arc::new(InMemoryExecutionRepository::new())).with_config(fast_config())
    }

    fn parse(yaml: &str) -> Workflow {
        MarkdownParser::new().parse_content(yaml).unwrap()
    }

    fn inputs(v: Value) -> Map<String, Value> {
        match v {
            Value::Object(m) => m,
            _ => Map::new(),
        }
    }

    #[tokio::test]
    async fn test_sequential_actions_complete() {
        let wf = parse(
            r#"
metadata: { id: three }
steps:
  - { id: a, action: svc.one, inputs: { n: 1 }, outputVariable: first }
  - { id: b, action: svc.two, inputs: { n: "{{ first.n + 1 }}" }, outputVariable: second }
  - { id: c, action: svc.three, inputs: { n: 3 } }
"#,
        );
        let exec = ScriptedExecutor::default();
        let result = engine().execute(&wf, Map::new(), &exec).await.unwrap();

        assert_eq!(result.status, WorkflowStatus::Completed);
        assert_eq!(result.step_results.len(), 3);
        let mut keys: Vec<&String> = result.output.keys().collect();
        keys.sort();
        assert_eq!(keys, vec!["first", "second"]);
        assert_eq!(result.output["second"]["n"], json!(2));
    }

    #[tokio::test]
    async fn test_slack_messages_chain() {
        let wf = parse(
            r##"---
workflow:
  metadata:
    id: slack-thread
  inputs:
    channel: { type: string, default: "#general" }
  steps:
    - id: post
      action: slack.chat.postMessage
      inputs:
        channel: "{{ inputs.channel }}"
        text: "Deploy started"
      outputVariable: message1
    - id: reply
      action: slack.chat.postMessage
      inputs:
        channel: "{{ message1.channel }}"
        text: "Replying to {{ message1.ts }}"
      outputVariable: message2
---
Posts a message and replies to it.
"##,
        );
        let exec = ScriptedExecutor::default();
        let result = engine().execute(&wf, Map::new(), &exec).await.unwrap();

        assert_eq!(result.status, WorkflowStatus::Completed);
        assert_eq!(result.output.len(), 2);
        let ts = result.output["message1"]["ts"].as_str().unwrap().to_string();
        assert_eq!(result.output["message2"]["channel"], json!("#general"));
        assert_eq!(result.output["message2"]["text"], json!(format!("Replying to {ts}")));
    }

    #[tokio::test]
    async fn test_retry_until_success() {
        let wf = parse(
            r#"
metadata: { id: retrying }
steps:
  - id: flaky
    action: svc.flaky
    errorHandling: { action: retry, maxRetries: 3, retryDelaySeconds: 0 }
"#,
        );
        let exec = ScriptedExecutor::default().failing("svc.flaky", 2);
        let result = engine().execute(&wf, Map::new(), &exec).await.unwrap();

        assert_eq!(result.status, WorkflowStatus::Completed);
        assert_eq!(result.step_results[0].retry_count, 2);
        assert_eq!(exec.calls_to("svc.flaky"), 3);
    }

    #[tokio::test]
    async fn test_retry_exhausted_fails_workflow() {
        let wf = parse(
            r#"
metadata: { id: exhausted }
steps:
  - { id: down, action: svc.down, errorHandling: { maxRetries: 2, retryDelaySeconds: 0 } }
"#,
        );
        let exec = ScriptedExecutor::default().broken("svc.down");
        let result = engine().execute(&wf, Map::new(), &exec).await.unwrap();

        assert_eq!(result.status, WorkflowStatus::Failed);
        assert_eq!(exec.calls_to("svc.down"), 3);
        assert!(result.error.unwrap().contains("after 3 attempts"));
    }

    #[tokio::test]
    async fn test_continue_on_error() {
        let wf = parse(
            r#"
metadata: { id: tolerant }
steps:
  - { id: a, action: svc.down, errorHandling: { action: continue } }
  - { id: b, action: svc.up, outputVariable: after }
"#,
        );
        let exec = ScriptedExecutor::default().broken("svc.down");
        let result = engine().execute(&wf, Map::new(), &exec).await.unwrap();

        assert_eq!(result.status, WorkflowStatus::Completed);
        assert_eq!(result.step("a").unwrap().status, StepStatus::Failed);
        assert_eq!(result.step("b").unwrap().status, StepStatus::Completed);
    }

    #[tokio::test]
    async fn test_stop_on_error_halts() {
        let wf = parse(
            r#"
metadata: { id: strict }
steps:
  - { id: a, action: svc.up }
  - { id: b, action: svc.down }
  - { id: c, action: svc.never }
"#,
        );
        let exec = ScriptedExecutor::default().broken("svc.down");
        let result = engine().execute(&wf, Map::new(), &exec).await.unwrap();

        assert_eq!(result.status, WorkflowStatus::Failed);
        assert_eq!(result.step_results.len(), 2);
        assert_eq!(exec.calls_to("svc.never"), 0);
        assert_eq!(
            result.error.as_deref(),
            result.step("b").unwrap().error.as_deref()
        );
    }

    #[tokio::test]
    async fn test_falsy_condition_skips() {
        let wf = parse(
            r#"
metadata: { id: conditional }
inputs:
  enabled: { type: boolean, default: false }
steps:
  - { id: gated, action: svc.gated, conditions: ["{{ enabled }}"] }
"#,
        );
        let exec = ScriptedExecutor::default();
        let result = engine().execute(&wf, Map::new(), &exec).await.unwrap();

        assert_eq!(result.status, WorkflowStatus::Completed);
        assert_eq!(result.step_results[0].status, StepStatus::Skipped);
        assert_eq!(exec.total_calls(), 0);
    }

    #[tokio::test]
    async fn test_fallback_action_recovers() {
        let wf = parse(
            r#"
metadata: { id: fallback }
steps:
  - id: primary
    action: svc.primary
    inputs: { q: 1 }
    errorHandling: { fallbackAction: svc.backup }
    outputVariable: answer
"#,
        );
        let exec = ScriptedExecutor::default().broken("svc.primary");
        let result = engine().execute(&wf, Map::new(), &exec).await.unwrap();

        assert_eq!(result.status, WorkflowStatus::Completed);
        assert_eq!(exec.calls_to("svc.backup"), 1);
        assert_eq!(result.output["answer"], json!({ "q": 1 }));
    }

    #[tokio::test]
    async fn test_missing_required_input_is_validation_error() {
        let wf = parse(
            r#"
metadata: { id: needs-input }
inputs:
  channel: { type: string, required: true }
steps:
  - { id: a, action: svc.up }
"#,
        );
        let exec = ScriptedExecutor::default();
        let err = engine().execute(&wf, Map::new(), &exec).await.unwrap_err();
        assert!(matches!(err, EngineError::Validation(_)));

        let err = engine()
            .execute(&wf, inputs(json!({ "channel": 42 })), &exec)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Validation(_)));
    }

    #[tokio::test]
    async fn test_sub_workflow_relative_to_parent() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("child.md"),
            r#"---
workflow:
  metadata: { id: child }
  inputs:
    a: { type: number, required: true }
    b: { type: number, required: true }
  steps:
    - id: add
      action: core.transform
      inputs: { value: "{{ a + b }}" }
      outputVariable: sum
---
"#,
        )
        .unwrap();
        let parent_path = dir.path().join("parent.md");
        std::fs::write(
            &parent_path,
            r#"---
workflow:
  metadata: { id: parent }
  steps:
    - id: call
      workflow: ./child.md
      inputs: { a: 10, b: 20 }
      outputVariable: total
---
"#,
        )
        .unwrap();

        let exec = ScriptedExecutor::default();
        let result = engine()
            .execute_file(&parent_path, Map::new(), &exec)
            .await
            .unwrap();

        assert_eq!(result.status, WorkflowStatus::Completed);
        assert_eq!(result.output["total"], json!({ "sum": 30 }));
        assert_eq!(result.step_results[0].output, json!({ "sum": 30 }));
    }

    #[tokio::test]
    async fn test_sub_workflow_depth_limit() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("recurse.md");
        std::fs::write(
            &path,
            "---\nworkflow:\n  metadata: { id: recurse }\n  steps:\n    - { id: again, workflow: ./recurse.md }\n---\n",
        )
        .unwrap();

        let exec = ScriptedExecutor::default();
        let engine = WorkflowEngine::new(Arc::new(InMemoryExecutionRepository::new())).with_config(EngineConfig {
            max_sub_workflow_depth: 2,
            ..fast_config()
        });
        let result = engine.execute_file(&path, Map::new(), &exec).await.unwrap();

        assert_eq!(result.status, WorkflowStatus::Failed);
        assert!(result.error.unwrap().contains("exceeds maximum 2"));
    }

    #[tokio::test]
    async fn test_resume_continues_after_last_completed_step() {
        let wf = parse(
            r#"
metadata: { id: resumable }
steps:
  - { id: first, action: svc.first, inputs: { v: 1 }, outputVariable: one }
  - { id: second, action: svc.second, inputs: { prev: "{{ one.v }}" }, outputVariable: two }
  - { id: third, action: svc.third }
"#,
        );
        let engine = engine();
        let exec = ScriptedExecutor::default().broken("svc.second");

        let failed = engine.execute(&wf, Map::new(), &exec).await.unwrap();
        assert_eq!(failed.status, WorkflowStatus::Failed);
        assert_eq!(engine.checkpoints().get_resume_point(failed.run_id).await.unwrap(), 1);

        exec.repair("svc.second");
        let resumed = engine.resume(failed.run_id, &wf, &exec).await.unwrap();

        assert_eq!(resumed.status, WorkflowStatus::Completed);
        assert_eq!(resumed.run_id, failed.run_id);
        assert_eq!(exec.calls_to("svc.first"), 1);
        assert_eq!(resumed.step_results.len(), 2);
        assert_eq!(resumed.output["two"], json!({ "prev": 1 }));

        let record = engine.checkpoints().get_execution(failed.run_id).await.unwrap();
        assert_eq!(record.status, WorkflowStatus::Completed);
        assert!(matches!(
            engine.resume(failed.run_id, &wf, &exec).await,
            Err(EngineError::AlreadyFinished(_))
        ));
    }

    #[tokio::test]
    async fn test_resume_unknown_run() {
        let wf = parse("metadata: { id: x }\nsteps:\n  - { id: a, action: svc.up }\n");
        let err = engine()
            .resume(Uuid::now_v7(), &wf, &ScriptedExecutor::default())
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::RunNotFound(_)));
    }

    #[tokio::test]
    async fn test_rollback_on_failure_runs_newest_first() {
        let wf = parse(
            r#"
metadata: { id: saga }
steps:
  - { id: reserve, action: svc.up, rollback: { action: undo, inputs: { what: reserve } } }
  - { id: charge, action: svc.up, rollback: { action: undo, inputs: { what: charge } } }
  - { id: ship, action: svc.up, rollback: { action: undo, inputs: { what: ship } } }
  - { id: notify, action: svc.down }
"#,
        );
        let log = Arc::new(StdMutex::new(Vec::new()));
        let sink = log.clone();
        let engine = WorkflowEngine::new(Arc::new(InMemoryExecutionRepository::new()))
            .with_config(EngineConfig {
                rollback_on_failure: true,
                ..fast_config()
            })
            .register_compensation("undo", move |req: CompensationRequest| {
                let sink = sink.clone();
                async move {
                    sink.lock()
                        .unwrap()
                        .push((req.step_index, req.inputs["what"].as_str().unwrap_or("").to_string()));
                    Ok(())
                }
            });
        let exec = ScriptedExecutor::default().broken("svc.down");
        let result = engine.execute(&wf, Map::new(), &exec).await.unwrap();

        assert_eq!(result.status, WorkflowStatus::Failed);
        let report = result.rollback.unwrap();
        assert_eq!(report.rolled_back, 3);
        assert_eq!(
            *log.lock().unwrap(),
            vec![(2, "ship".to_string()), (1, "charge".to_string()), (0, "reserve".to_string())]
        );
    }

    #[tokio::test]
    async fn test_circuit_opens_and_fails_fast() {
        let wf = parse(
            r#"
metadata: { id: breaker }
steps:
  - { id: call, action: svc.down, errorHandling: { maxRetries: 5, retryDelaySeconds: 0 } }
"#,
        );
        let engine = WorkflowEngine::new(Arc::new(InMemoryExecutionRepository::new())).with_config(EngineConfig {
            circuit_breaker: Some(CircuitBreakerConfig {
                failure_threshold: 2,
                cooldown_secs: 60,
            }),
            ..fast_config()
        });
        let exec = ScriptedExecutor::default().broken("svc.down");
        let result = engine.execute(&wf, Map::new(), &exec).await.unwrap();

        assert_eq!(result.status, WorkflowStatus::Failed);
        assert_eq!(exec.calls_to("svc.down"), 2);
        assert_eq!(result.step("call").unwrap().retry_count, 1);
        assert!(result.error.unwrap().contains("unavailable"));

        let again = engine.execute(&wf, Map::new(), &exec).await.unwrap();
        assert_eq!(again.status, WorkflowStatus::Failed);
        assert_eq!(exec.calls_to("svc.down"), 2);
        assert_eq!(again.step("call").unwrap().retry_count, 0);
        assert!(again.error.unwrap().contains("circuit open"));
    }

    #[tokio::test]
    async fn test_open_circuit_skips_retry_backoff() {
        let wf = parse(
            r#"
metadata: { id: breaker-backoff }
steps:
  - { id: call, action: svc.down, errorHandling: { maxRetries: 3, retryDelaySeconds: 2 } }
"#,
        );
        let engine = engine().with_circuit_breaker(CircuitBreaker::new(1, Duration::from_secs(60)));
        let exec = ScriptedExecutor::default().broken("svc.down");

        let started = Instant::now();
        let result = engine.execute(&wf, Map::new(), &exec).await.unwrap();

        assert!(started.elapsed() < Duration::from_secs(1));
        assert_eq!(result.status, WorkflowStatus::Failed);
        assert_eq!(exec.calls_to("svc.down"), 1);
        let step = result.step("call").unwrap();
        assert_eq!(step.retry_count, 0);
        assert!(!step.error.as_deref().unwrap_or("").contains("attempts"));
    }

    #[tokio::test]
    async fn test_timed_out_trial_does_not_wedge_circuit() {
        let wf = parse(
            r#"
metadata: { id: breaker-trial }
steps:
  - { id: call, action: svc.flaky, timeout: 1 }
"#,
        );
        let engine = engine().with_circuit_breaker(CircuitBreaker::new(1, Duration::ZERO));
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let exec = FnExecutor::new(move |_action: String, _inputs: Value| {
            let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
            async move {
                match n {
                    1 => Err("svc.flaky refused".to_string()),
                    2 => {
                        tokio::time::sleep(Duration::from_secs(2)).await;
                        Ok(json!({ "late": true }))
                    }
                    _ => Ok(json!({ "ok": true })),
                }
            }
            .boxed()
        });

        let first = engine.execute(&wf, Map::new(), &exec).await.unwrap();
        assert_eq!(first.status, WorkflowStatus::Failed);

        let second = engine.execute(&wf, Map::new(), &exec).await.unwrap();
        assert_eq!(second.status, WorkflowStatus::Failed);
        let trial = second.step("call").unwrap();
        assert!(trial.error.as_deref().unwrap_or("").contains("timed out"));

        let third = engine.execute(&wf, Map::new(), &exec).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(third.status, WorkflowStatus::Completed);
    }

    #[tokio::test]
    async fn test_step_timeout_fails_step() {
        let wf = parse("metadata: { id: slow }\nsteps:\n  - { id: wait, action: svc.slow, timeout: 1 }\n");
        let exec = FnExecutor::new(|_action: String, _inputs: Value| {
            async {
                tokio::time::sleep(Duration::from_secs(2)).await;
                Ok(json!({}))
            }
            .boxed()
        });

        let started = Instant::now();
        let result = engine().execute(&wf, Map::new(), &exec).await.unwrap();

        assert!(started.elapsed() < Duration::from_secs(2));
        assert_eq!(result.status, WorkflowStatus::Failed);
        let step = result.step("wait").unwrap();
        assert_eq!(step.status, StepStatus::Failed);
        assert!(step.error.as_deref().unwrap_or("").contains("timed out"));
    }

    #[tokio::test]
    async fn test_control_flow_if_switch_for_each() {
        let wf = parse(
            r#"
metadata: { id: flow }
inputs:
  env: { default: prod }
  users: { default: [ada, grace, linus] }
steps:
  - id: check
    type: if
    condition: "{{ users | length > 2 }}"
    then:
      - { id: many, action: core.set, inputs: { size: big } }
    else:
      - { id: few, action: core.set, inputs: { size: small } }
  - id: route
    type: switch
    expression: env
    cases:
      prod:
        - { id: prod_cfg, action: core.set, inputs: { target: cluster-a } }
    default:
      - { id: dev_cfg, action: core.set, inputs: { target: local } }
  - id: greet
    type: for_each
    items: "{{ users }}"
    itemVar: user
    body:
      - { id: hello, action: svc.greet, inputs: { name: "{{ user }}", pos: "{{ loop.index1 }}" }, outputVariable: greeting }
    outputVariable: greetings
  - id: summary
    action: core.format
    inputs:
      template: "{{ size }}/{{ target }}/{{ greetings | length }}"
    outputVariable: summary
"#,
        );
        let exec = ScriptedExecutor::default();
        let result = engine().execute(&wf, Map::new(), &exec).await.unwrap();

        assert_eq!(result.status, WorkflowStatus::Completed);
        assert_eq!(result.step("check").unwrap().output["branch"], json!("then"));
        assert_eq!(result.step("route").unwrap().output["case"], json!("prod"));
        assert_eq!(exec.calls_to("svc.greet"), 3);
        assert_eq!(result.output["greetings"][2]["greeting"]["name"], json!("linus"));
        assert_eq!(result.output["greetings"][2]["greeting"]["pos"], json!(3));
        assert_eq!(result.output["summary"], json!("big/cluster-a/3"));
    }

    #[tokio::test]
    async fn test_while_hits_iteration_cap() {
        let wf = parse(
            r#"
metadata: { id: spin }
steps:
  - { id: init, action: core.set, inputs: { counter: 0 } }
  - id: spin
    type: while
    condition: "true"
    maxIterations: 3
    body:
      - { id: bump, action: core.set, inputs: { counter: "{{ counter + 1 }}" } }
    outputVariable: loop_result
  - { id: done, action: core.transform, inputs: { value: "{{ counter }}" }, outputVariable: final }
"#,
        );
        let result = engine().execute(&wf, Map::new(), &ScriptedExecutor::default()).await.unwrap();

        assert_eq!(result.status, WorkflowStatus::Completed);
        assert_eq!(result.output["loop_result"], json!({ "iterations": 3, "completed": false }));
        assert_eq!(result.output["final"], json!(3));
    }

    #[tokio::test]
    async fn test_map_filter_reduce() {
        let wf = parse(
            r#"
metadata: { id: collections }
inputs:
  prices: { default: [5, 12, 30] }
steps:
  - { id: taxed, type: map, items: "{{ prices }}", itemVar: p, expression: "p * 2", outputVariable: doubled }
  - { id: big, type: filter, items: "{{ doubled }}", itemVar: p, condition: "p > 20", outputVariable: large }
  - { id: total, type: reduce, items: "{{ large }}", itemVar: p, initialValue: 0, expression: "acc + p", outputVariable: sum }
"#,
        );
        let result = engine().execute(&wf, Map::new(), &ScriptedExecutor::default()).await.unwrap();

        assert_eq!(result.status, WorkflowStatus::Completed);
        assert_eq!(result.output["doubled"], json!([10, 24, 60]));
        assert_eq!(result.output["large"], json!([24, 60]));
        assert_eq!(result.output["sum"], json!(84));
    }

    #[tokio::test]
    async fn test_non_array_items_fail() {
        let wf = parse(
            r#"
metadata: { id: bad-items }
steps:
  - { id: each, type: for_each, items: "{{ 5 }}", body: [ { id: x, action: svc.up } ] }
"#,
        );
        let result = engine().execute(&wf, Map::new(), &ScriptedExecutor::default()).await.unwrap();
        assert_eq!(result.status, WorkflowStatus::Failed);
        assert!(result.error.unwrap().contains("must resolve to an array"));
    }

    const PARALLEL: &str = r#"
metadata: { id: fan-out }
steps:
  - id: fan
    type: parallel
    onError: MODE
    branches:
      - id: left
        steps:
          - { id: l1, action: core.set, inputs: { side: left } }
      - id: right
        steps:
          - { id: r1, action: svc.down }
    outputVariable: fan_result
"#;

    #[tokio::test]
    async fn test_parallel_stop_fails_step() {
        let wf = parse(&PARALLEL.replace("MODE", "stop"));
        let exec = ScriptedExecutor::default().broken("svc.down");
        let result = engine().execute(&wf, Map::new(), &exec).await.unwrap();

        assert_eq!(result.status, WorkflowStatus::Failed);
        assert!(result.error.unwrap().contains("right"));
    }

    #[tokio::test]
    async fn test_parallel_respects_max_concurrent() {
        let wf = parse(
            r#"
metadata: { id: one-at-a-time }
steps:
  - id: fan
    type: parallel
    maxConcurrent: 1
    branches:
      - { id: a, steps: [{ id: a1, action: svc.work }] }
      - { id: b, steps: [{ id: b1, action: svc.work }] }
      - { id: c, steps: [{ id: c1, action: svc.work }] }
"#,
        );
        let in_flight = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let calls = Arc::new(AtomicUsize::new(0));
        let (f, p, c) = (in_flight.clone(), peak.clone(), calls.clone());
        let exec = FnExecutor::new(move |_action: String, _inputs: Value| {
            let (f, p, c) = (f.clone(), p.clone(), c.clone());
            async move {
                c.fetch_add(1, Ordering::SeqCst);
                let now = f.fetch_add(1, Ordering::SeqCst) + 1;
                p.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(50)).await;
                f.fetch_sub(1, Ordering::SeqCst);
                Ok(json!({}))
            }
            .boxed()
        });

        let result = engine().execute(&wf, Map::new(), &exec).await.unwrap();

        assert_eq!(result.status, WorkflowStatus::Completed);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(peak.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_parallel_continue_collects_errors() {
        let wf = parse(&PARALLEL.replace("MODE", "continue"));
        let exec = ScriptedExecutor::default().broken("svc.down");
        let result = engine().execute(&wf, Map::new(), &exec).await.unwrap();

        assert_eq!(result.status, WorkflowStatus::Completed);
        let out = &result.output["fan_result"];
        assert_eq!(out["branches"]["left"]["side"], json!("left"));
        assert!(out["errors"]["right"].as_str().unwrap().contains("unavailable"));
        assert!(out["errors"].get("left").is_none());
    }

    #[tokio::test]
    async fn test_try_catch_finally() {
        let wf = parse(
            r#"
metadata: { id: guarded }
steps:
  - id: guard
    type: try
    try:
      - { id: boom, action: svc.down }
      - { id: unreachable, action: svc.never }
    catch:
      - { id: handle, action: core.set, inputs: { handled: "{{ error.stepId }}: {{ error.message }}" } }
    finally:
      - { id: cleanup, action: core.set, inputs: { cleaned: true } }
  - { id: report, action: core.transform, inputs: { value: "{{ cleaned }}|{{ handled }}" }, outputVariable: report }
"#,
        );
        let exec = ScriptedExecutor::default().broken("svc.down");
        let result = engine().execute(&wf, Map::new(), &exec).await.unwrap();

        assert_eq!(result.status, WorkflowStatus::Completed);
        assert_eq!(exec.calls_to("svc.never"), 0);
        let report = result.output["report"].as_str().unwrap();
        assert!(report.starts_with("true|boom: "));
        assert!(report.contains("svc.down is unavailable"));
    }

    #[tokio::test]
    async fn test_try_without_catch_propagates_after_finally() {
        let wf = parse(
            r#"
metadata: { id: unguarded }
steps:
  - id: guard
    type: try
    try:
      - { id: boom, action: svc.down }
    finally:
      - { id: cleanup, action: svc.cleanup }
"#,
        );
        let exec = ScriptedExecutor::default().broken("svc.down");
        let result = engine().execute(&wf, Map::new(), &exec).await.unwrap();

        assert_eq!(result.status, WorkflowStatus::Failed);
        assert_eq!(exec.calls_to("svc.cleanup"), 1);
    }

    #[tokio::test]
    async fn test_hooks_fire_in_lifecycle_order() {
        let seen = Arc::new(StdMutex::new(Vec::new()));
        let mut hooks = HookDispatcher::new();
        for event in [
            HookEvent::WorkflowBeforeStart,
            HookEvent::StepBeforeExecute,
            HookEvent::StepAfterExecute,
            HookEvent::StepOnSkip,
            HookEvent::WorkflowAfterEnd,
        ] {
            let seen = seen.clone();
            hooks.on(event, move |event, payload| {
                let seen = seen.clone();
                async move {
                    let step = payload["stepId"].as_str().unwrap_or("-").to_string();
                    seen.lock().unwrap().push(format!("{event}:{step}"));
                    Ok(Default::default())
                }
            });
        }

        let wf = parse(
            r#"
metadata: { id: hooked }
steps:
  - { id: a, action: svc.up }
  - { id: b, action: svc.up, conditions: [false] }
"#,
        );
        let engine = engine().with_hooks(hooks);
        engine.execute(&wf, Map::new(), &ScriptedExecutor::default()).await.unwrap();

        assert_eq!(
            *seen.lock().unwrap(),
            vec![
                "workflow.before_start:-",
                "step.before_execute:a",
                "step.after_execute:a",
                "step.on_skip:b",
                "workflow.after_end:-",
            ]
        );
    }

    /// Requests cancellation of its own run from inside the first action.
    struct CancellingExecutor {
        engine: Arc<WorkflowEngine<InMemoryExecutionRepository>>,
        cancelled: AtomicBool,
    }

    impl ActionExecutor for CancellingExecutor {
        fn execute<'a>(&'a self, invocation: ActionInvocation<'a>) -> BoxFuture<'a, Result<Value, String>> {
            let hit = self.engine.cancel(invocation.context.run_id);
            self.cancelled.store(hit, Ordering::SeqCst);
            async { Ok(json!({})) }.boxed()
        }
    }

    #[tokio::test]
    async fn test_cancel_between_steps() {
        let engine = Arc::new(engine());
        let exec = CancellingExecutor {
            engine: engine.clone(),
            cancelled: AtomicBool::new(false),
        };
        let wf = parse("metadata: { id: cancellable }\nsteps:\n  - { id: a, action: svc.a }\n  - { id: b, action: svc.b }\n");

        let result = engine.execute(&wf, Map::new(), &exec).await.unwrap();

        assert!(exec.cancelled.load(Ordering::SeqCst));
        assert_eq!(result.status, WorkflowStatus::Cancelled);
        assert_eq!(result.step_results.len(), 1);
        assert!(engine.active_runs().is_empty());
        assert!(!engine.cancel(result.run_id));
    }

    #[tokio::test]
    async fn test_checkpoints_written_per_step() {
        let wf = parse(
            "metadata: { id: tracked }\nsteps:\n  - { id: a, action: svc.up }\n  - { id: b, action: svc.up, conditions: [false] }\n",
        );
        let engine = engine();
        let result = engine.execute(&wf, Map::new(), &ScriptedExecutor::default()).await.unwrap();

        let checkpoints = engine.checkpoints().list_checkpoints(result.run_id).await.unwrap();
        assert_eq!(checkpoints.len(), 2);
        assert_eq!(checkpoints[0].status, StepStatus::Completed);
        assert_eq!(checkpoints[1].status, StepStatus::Skipped);

        let record = engine.checkpoints().get_execution(result.run_id).await.unwrap();
        assert_eq!(record.status, WorkflowStatus::Completed);
        assert_eq!(record.current_step, 2);
        assert!(record.completed_at.is_some());
    }

    #[tokio::test]
    async fn test_fn_executor_adapter() {
        let exec = FnExecutor::new(|action: String, inputs: Value| {
            async move { Ok(json!({ "action": action, "inputs": inputs })) }.boxed()
        });
        let wf = parse("metadata: { id: closure }\nsteps:\n  - { id: a, action: svc.echo, inputs: { x: 1 }, outputVariable: out }\n");
        let result = engine().execute(&wf, Map::new(), &exec).await.unwrap();
        assert_eq!(result.output["out"], json!({ "action": "svc.echo", "inputs": { "x": 1 } }));
    }
}
