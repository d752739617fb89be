//! Step interpreter for every workflow step type.
//!
//! `StepRunner` evaluates a step's conditions, dispatches on its `StepKind`,
//! drives retries, the circuit breaker and fallbacks, and records outputs,
//! step metadata and rollback actions in the execution context.
//!
//! Step types: action, workflow, if, switch, for_each, while, map, filter,
//! reduce, parallel, try.

use std::any::Any;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use futures_util::future::{BoxFuture, FutureExt};
use futures_util::stream::{self, StreamExt};
use mdflow_types::config::EngineConfig;
use mdflow_types::execution::{StepResult, StepStatus, WorkflowResult, WorkflowStatus};
use mdflow_types::rollback::RollbackAction;
use mdflow_types::workflow::{
    ErrorAction, FilterStep, ForEachStep, IfStep, MapStep, ParallelErrorMode, ParallelStep, ReduceStep,
    RollbackStrategy, Step, StepKind, SubWorkflowStep, SwitchStep, TryStep, WhileStep, Workflow,
};
use serde_json::{json, Map, Value};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::template::filters::to_text;
use crate::template::{Bindings, TemplateError, TemplateResolver};

use super::builtins;
use super::circuit::CircuitBreaker;
use super::context::{ExecutionContext, StepMetadata};
use super::definition::WorkflowParser;
use super::hooks::{HookDispatcher, HookEvent};
use super::retry::RetryPolicy;
use super::rollback::RollbackRegistry;

/// Binding exposed inside loop bodies and item expressions.
const LOOP_VAR: &str = "loop";

// ---------------------------------------------------------------------------
// External interfaces
// ---------------------------------------------------------------------------

/// Loads SDK clients for tools declared in a workflow. Handed to the
/// executor; the engine never calls it.
pub trait SdkRegistry: Send + Sync {
    fn has(&self, name: &str) -> bool;

    fn load(&self, name: &str) -> Result<Arc<dyn Any + Send + Sync>, String>;
}

/// One call to an external action.
pub struct ActionInvocation<'a> {
    pub step_id: &'a str,
    pub action: &'a str,
    /// Inputs with every template resolved.
    pub inputs: Value,
    pub context: &'a ExecutionContext,
    pub sdk: Option<&'a dyn SdkRegistry>,
}

/// Performs non-`core.*` actions. Errors are plain strings; the engine wraps
/// them with step and action details.
pub trait ActionExecutor: Send + Sync {
    fn execute<'a>(&'a self, invocation: ActionInvocation<'a>) -> BoxFuture<'a, Result<Value, String>>;
}

// ---------------------------------------------------------------------------
// StepError
// ---------------------------------------------------------------------------

/// Errors that can occur during step execution.
#[derive(Debug, thiserror::Error)]
pub enum StepError {
    #[error("action '{action}' failed in step '{step_id}': {message}")]
    ActionExecution {
        step_id: String,
        action: String,
        message: String,
    },

    #[error("step '{step_id}' failed after {attempts} attempts: {last}")]
    RetryExhausted {
        step_id: String,
        attempts: u32,
        last: Box<StepError>,
    },

    #[error("sub-workflow '{path}' failed: {message}")]
    SubWorkflow {
        path: String,
        run_id: Option<Uuid>,
        message: String,
    },

    #[error("step '{step_id}' timed out after {secs}s")]
    Timeout { step_id: String, secs: u64 },

    #[error("circuit open for '{target}'")]
    CircuitOpen { target: String },

    #[error("template error in step '{step_id}': {source}")]
    Template {
        step_id: String,
        #[source]
        source: TemplateError,
    },

    #[error("built-in '{action}' failed: {message}")]
    Builtin { action: String, message: String },

    #[error("sub-workflow depth {depth} exceeds maximum {max}")]
    DepthExceeded { depth: u32, max: u32 },

    #[error("step '{step_id}' is invalid: {message}")]
    Invalid { step_id: String, message: String },

    /// A step inside a nested list failed and stopped the list.
    #[error("step '{step_id}' failed: {source}")]
    Nested {
        step_id: String,
        #[source]
        source: Box<StepError>,
    },

    #[error("{message}")]
    Failed { step_id: String, message: String },
}

impl StepError {
    /// Whether another attempt could succeed. Open circuits, depth limits and
    /// malformed templates fail the same way every time.
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            StepError::CircuitOpen { .. }
                | StepError::DepthExceeded { .. }
                | StepError::Template { .. }
                | StepError::Invalid { .. }
        )
    }

    /// Innermost failing step id and message, for `try` error bindings.
    fn origin(&self) -> (String, String) {
        match self {
            StepError::Nested { step_id, source } => match source.as_ref() {
                inner @ StepError::Nested { .. } => inner.origin(),
                inner => (step_id.clone(), inner.to_string()),
            },
            other => (String::new(), other.to_string()),
        }
    }
}

fn template_error(step_id: &str, source: TemplateError) -> StepError {
    StepError::Template {
        step_id: step_id.to_string(),
        source,
    }
}

fn invalid(step_id: &str, message: impl Into<String>) -> StepError {
    StepError::Invalid {
        step_id: step_id.to_string(),
        message: message.into(),
    }
}

// ---------------------------------------------------------------------------
// Shared engine services
// ---------------------------------------------------------------------------

/// Everything a step needs from the engine, shared across a run.
pub(crate) struct EngineServices {
    pub config: EngineConfig,
    pub resolver: TemplateResolver,
    pub hooks: HookDispatcher,
    pub circuit: Option<CircuitBreaker>,
    pub parser: Arc<dyn WorkflowParser>,
    pub sdk: Option<Arc<dyn SdkRegistry>>,
}

/// Result of one step plus whether its failure stops the containing list.
pub(crate) struct StepOutcome {
    pub result: StepResult,
    pub halt: Option<StepError>,
}

/// Apply declared defaults and check required inputs and declared types.
pub fn prepare_inputs(workflow: &Workflow, provided: Map<String, Value>) -> Result<Map<String, Value>, String> {
    let mut inputs = provided;
    for (name, def) in &workflow.inputs {
        let missing = inputs.get(name).is_none_or(Value::is_null);
        if missing {
            match &def.default {
                Some(default) => {
                    inputs.insert(name.clone(), default.clone());
                }
                None if def.required => return Err(format!("missing required input '{name}'")),
                None => {}
            }
        }
        if let (Some(expected), Some(value)) = (def.input_type, inputs.get(name)) {
            if !value.is_null() && !expected.accepts(value) {
                return Err(format!(
                    "input '{name}' must be of type {}",
                    format!("{expected:?}").to_lowercase()
                ));
            }
        }
    }
    Ok(inputs)
}

/// Resolve a sub-workflow path against the parent workflow's directory.
fn resolve_workflow_path(path: &str, base: Option<&Path>) -> PathBuf {
    let candidate = PathBuf::from(path);
    match base {
        Some(dir) if candidate.is_relative() => dir.join(candidate),
        _ => candidate,
    }
}

fn loop_info(index: usize, length: Option<usize>) -> Value {
    let mut info = json!({
        "index": index,
        "index1": index + 1,
        "first": index == 0,
    });
    if let (Some(length), Value::Object(map)) = (length, &mut info) {
        map.insert("last".to_string(), json!(index + 1 == length));
        map.insert("length".to_string(), json!(length));
    }
    info
}

/// Assemble the final result of a run from its context.
pub(crate) fn build_result(
    ctx: &ExecutionContext,
    status: WorkflowStatus,
    step_results: Vec<StepResult>,
    error: Option<String>,
    clock: Instant,
) -> WorkflowResult {
    WorkflowResult {
        run_id: ctx.run_id,
        workflow_id: ctx.workflow_id.clone(),
        status,
        step_results,
        output: ctx.outputs.clone(),
        error,
        started_at: ctx.started_at,
        completed_at: Utc::now(),
        duration_ms: clock.elapsed().as_millis() as u64,
        rollback: None,
    }
}

// ---------------------------------------------------------------------------
// StepRunner
// ---------------------------------------------------------------------------

/// Executes steps against an execution context.
///
/// Holds only borrows, so it is cheap to copy into parallel branches.
/// `top_index` is the index of the top-level step being executed; rollback
/// actions recorded by nested steps are filed under it.
#[derive(Clone, Copy)]
pub(crate) struct StepRunner<'a> {
    services: &'a EngineServices,
    executor: &'a dyn ActionExecutor,
    rollback: &'a Mutex<RollbackRegistry>,
    top_index: usize,
}

impl<'a> StepRunner<'a> {
    pub fn new(
        services: &'a EngineServices,
        executor: &'a dyn ActionExecutor,
        rollback: &'a Mutex<RollbackRegistry>,
    ) -> Self {
        Self {
            services,
            executor,
            rollback,
            top_index: 0,
        }
    }

    pub fn at(self, top_index: usize) -> Self {
        Self { top_index, ..self }
    }

    /// Run one step to a terminal state.
    pub fn execute_step<'s>(&'s self, step: &'s Step, ctx: &'s mut ExecutionContext) -> BoxFuture<'s, StepOutcome> {
        async move {
            let started_at = Utc::now();
            let clock = Instant::now();

            match self.conditions_met(step, ctx) {
                Ok(true) => {}
                Ok(false) => {
                    tracing::debug!(step_id = %step.id, "conditions not met, skipping step");
                    ctx.record_step(
                        &step.id,
                        StepMetadata {
                            status: StepStatus::Skipped,
                            error: None,
                            retry_count: 0,
                        },
                    );
                    self.dispatch_hook(HookEvent::StepOnSkip, self.step_payload(step, ctx))
                        .await;
                    return StepOutcome {
                        result: StepResult::skipped(&step.id),
                        halt: None,
                    };
                }
                Err(e) => return self.finish_failed(step, ctx, e, 0, started_at, clock).await,
            }

            self.dispatch_hook(HookEvent::StepBeforeExecute, self.step_payload(step, ctx))
                .await;

            let restore_base = step
                .rollback
                .as_ref()
                .filter(|r| r.effective_strategy() == RollbackStrategy::Restore && r.snapshot.is_none())
                .map(|_| ctx.variables.clone());

            let policy = match step.kind {
                StepKind::Action(_) | StepKind::SubWorkflow(_) => {
                    RetryPolicy::for_step(step.error_handling.as_ref(), &self.services.config)
                }
                _ => RetryPolicy::none(),
            };

            let mut retries = 0u32;
            let outcome = loop {
                match self.attempt(step, ctx).await {
                    Ok(output) => break Ok(output),
                    Err(e) if e.is_retryable() && policy.should_retry(retries) && !self.circuit_blocks(step) => {
                        retries += 1;
                        let delay = policy.delay_for(retries);
                        tracing::warn!(
                            run_id = %ctx.run_id,
                            step_id = %step.id,
                            attempt = retries + 1,
                            delay_ms = delay.as_millis() as u64,
                            error = %e,
                            "step attempt failed, retrying"
                        );
                        let mut payload = self.step_payload(step, ctx);
                        payload["attempt"] = json!(retries + 1);
                        payload["error"] = json!(e.to_string());
                        self.dispatch_hook(HookEvent::StepOnRetry, payload).await;
                        tokio::time::sleep(delay).await;
                    }
                    Err(e) => {
                        // A fast-failed attempt never reached the executor.
                        if matches!(e, StepError::CircuitOpen { .. }) {
                            retries = retries.saturating_sub(1);
                        }
                        if retries > 0 {
                            break Err(StepError::RetryExhausted {
                                step_id: step.id.clone(),
                                attempts: retries + 1,
                                last: Box::new(e),
                            });
                        }
                        break Err(e);
                    }
                }
            };

            let outcome = match outcome {
                Err(e) => self.try_fallback(step, ctx, e).await,
                ok => ok,
            };

            match outcome {
                Ok(output) => {
                    if let Some(var) = &step.output_variable {
                        ctx.set_output(var, output.clone());
                    }
                    self.record_rollback(step, ctx, restore_base).await;
                    ctx.record_step(
                        &step.id,
                        StepMetadata {
                            status: StepStatus::Completed,
                            error: None,
                            retry_count: retries,
                        },
                    );

                    let duration_ms = clock.elapsed().as_millis() as u64;
                    let mut payload = self.step_payload(step, ctx);
                    payload["status"] = json!("completed");
                    payload["durationMs"] = json!(duration_ms);
                    self.dispatch_hook(HookEvent::StepAfterExecute, payload).await;

                    tracing::debug!(step_id = %step.id, duration_ms, retries, "step completed");
                    StepOutcome {
                        result: StepResult {
                            step_id: step.id.clone(),
                            status: StepStatus::Completed,
                            output,
                            error: None,
                            started_at,
                            completed_at: Some(Utc::now()),
                            duration_ms,
                            retry_count: retries,
                        },
                        halt: None,
                    }
                }
                Err(e) => self.finish_failed(step, ctx, e, retries, started_at, clock).await,
            }
        }
        .boxed()
    }

    async fn finish_failed(
        &self,
        step: &Step,
        ctx: &mut ExecutionContext,
        error: StepError,
        retries: u32,
        started_at: chrono::DateTime<Utc>,
        clock: Instant,
    ) -> StepOutcome {
        let message = error.to_string();
        tracing::warn!(run_id = %ctx.run_id, step_id = %step.id, error = %message, "step failed");

        ctx.record_step(
            &step.id,
            StepMetadata {
                status: StepStatus::Failed,
                error: Some(message.clone()),
                retry_count: retries,
            },
        );
        let mut payload = self.step_payload(step, ctx);
        payload["error"] = json!(message);
        self.dispatch_hook(HookEvent::StepOnError, payload).await;

        let halt = match step.error_action() {
            ErrorAction::Continue => None,
            ErrorAction::Stop | ErrorAction::Retry => Some(error),
        };

        StepOutcome {
            result: StepResult {
                step_id: step.id.clone(),
                status: StepStatus::Failed,
                output: Value::Null,
                error: Some(message),
                started_at,
                completed_at: Some(Utc::now()),
                duration_ms: clock.elapsed().as_millis() as u64,
                retry_count: retries,
            },
            halt,
        }
    }

    /// Run a nested step list in order. A step whose failure halts stops the
    /// list with a `Nested` error naming it.
    pub fn run_list<'s>(&'s self, steps: &'s [Step], ctx: &'s mut ExecutionContext) -> BoxFuture<'s, Result<(), StepError>> {
        async move {
            for step in steps {
                let outcome = self.execute_step(step, ctx).await;
                if let Some(e) = outcome.halt {
                    return Err(StepError::Nested {
                        step_id: step.id.clone(),
                        source: Box::new(e),
                    });
                }
            }
            Ok(())
        }
        .boxed()
    }

    /// Run a whole workflow in `ctx` without persistence. Used for
    /// sub-workflows.
    pub fn run_workflow<'s>(&'s self, workflow: &'s Workflow, mut ctx: ExecutionContext) -> BoxFuture<'s, WorkflowResult> {
        async move {
            let clock = Instant::now();
            ctx.status = WorkflowStatus::Running;
            let mut results = Vec::with_capacity(workflow.steps.len());
            let mut error = None;

            for (index, step) in workflow.steps.iter().enumerate() {
                ctx.current_step_index = index;
                let outcome = self.execute_step(step, &mut ctx).await;
                results.push(outcome.result);
                if let Some(e) = outcome.halt {
                    error = Some(e.to_string());
                    break;
                }
            }

            let status = if error.is_some() {
                WorkflowStatus::Failed
            } else {
                WorkflowStatus::Completed
            };
            ctx.status = status;
            build_result(&ctx, status, results, error, clock)
        }
        .boxed()
    }

    // -----------------------------------------------------------------------
    // Attempts
    // -----------------------------------------------------------------------

    /// An action step whose circuit is open gets no further retries.
    fn circuit_blocks(&self, step: &Step) -> bool {
        match (&step.kind, self.services.circuit.as_ref()) {
            (StepKind::Action(a), Some(breaker)) => !builtins::is_builtin(&a.action) && breaker.is_open(&a.action),
            _ => false,
        }
    }

    /// One attempt, bounded by the step or engine timeout.
    async fn attempt(&self, step: &Step, ctx: &mut ExecutionContext) -> Result<Value, StepError> {
        let timeout = step.timeout.or(self.services.config.default_step_timeout_secs);
        let run = self.dispatch(step, ctx);
        match timeout {
            Some(secs) => tokio::time::timeout(Duration::from_secs(secs), run)
                .await
                .map_err(|_| StepError::Timeout {
                    step_id: step.id.clone(),
                    secs,
                })?,
            None => run.await,
        }
    }

    async fn dispatch(&self, step: &Step, ctx: &mut ExecutionContext) -> Result<Value, StepError> {
        match &step.kind {
            StepKind::Action(a) => self.invoke_action(&step.id, &a.action, &a.inputs, ctx).await,
            StepKind::SubWorkflow(s) => self.run_sub_workflow(step, s, ctx).await,
            StepKind::If(s) => self.run_if(step, s, ctx).await,
            StepKind::Switch(s) => self.run_switch(step, s, ctx).await,
            StepKind::ForEach(s) => self.run_for_each(step, s, ctx).await,
            StepKind::While(s) => self.run_while(step, s, ctx).await,
            StepKind::Map(s) => self.run_map(step, s, ctx),
            StepKind::Filter(s) => self.run_filter(step, s, ctx),
            StepKind::Reduce(s) => self.run_reduce(step, s, ctx),
            StepKind::Parallel(s) => self.run_parallel(step, s, ctx).await,
            StepKind::Try(s) => self.run_try(s, ctx).await,
        }
    }

    async fn invoke_action(
        &self,
        step_id: &str,
        action: &str,
        inputs: &Map<String, Value>,
        ctx: &mut ExecutionContext,
    ) -> Result<Value, StepError> {
        if builtins::is_builtin(action) {
            return builtins::run(action, step_id, inputs, ctx, &self.services.resolver);
        }

        let resolved = self
            .services
            .resolver
            .resolve_deep(&Value::Object(inputs.clone()), ctx)
            .map_err(|e| template_error(step_id, e))?;

        // Held across the call so a timeout or cancellation still counts.
        let permit = match self.services.circuit.as_ref() {
            Some(breaker) => match breaker.admit(action) {
                Some(permit) => Some(permit),
                None => {
                    return Err(StepError::CircuitOpen {
                        target: action.to_string(),
                    });
                }
            },
            None => None,
        };

        let invocation = ActionInvocation {
            step_id,
            action,
            inputs: resolved,
            context: ctx,
            sdk: self.services.sdk.as_deref(),
        };

        match self.executor.execute(invocation).await {
            Ok(output) => {
                if let Some(permit) = permit {
                    permit.succeeded();
                }
                Ok(output)
            }
            Err(message) => {
                if let Some(permit) = permit {
                    permit.failed();
                }
                Err(StepError::ActionExecution {
                    step_id: step_id.to_string(),
                    action: action.to_string(),
                    message,
                })
            }
        }
    }

    async fn try_fallback(&self, step: &Step, ctx: &mut ExecutionContext, error: StepError) -> Result<Value, StepError> {
        let Some(fallback) = step
            .error_handling
            .as_ref()
            .and_then(|eh| eh.fallback_action.as_deref())
        else {
            return Err(error);
        };

        let inputs = match &step.kind {
            StepKind::Action(a) => a.inputs.clone(),
            _ => Map::new(),
        };
        match self.invoke_action(&step.id, fallback, &inputs, ctx).await {
            Ok(output) => {
                tracing::info!(step_id = %step.id, fallback, "fallback action succeeded");
                Ok(output)
            }
            Err(fallback_error) => {
                tracing::warn!(step_id = %step.id, fallback, error = %fallback_error, "fallback action failed");
                Err(error)
            }
        }
    }

    // -----------------------------------------------------------------------
    // Control flow
    // -----------------------------------------------------------------------

    async fn run_if(&self, step: &Step, s: &IfStep, ctx: &mut ExecutionContext) -> Result<Value, StepError> {
        let met = self.condition(&step.id, &s.condition, ctx)?;
        let (branch, steps) = if met { ("then", &s.then) } else { ("else", &s.else_steps) };
        self.run_list(steps, ctx).await?;
        Ok(json!({ "conditionMet": met, "branch": branch }))
    }

    async fn run_switch(&self, step: &Step, s: &SwitchStep, ctx: &mut ExecutionContext) -> Result<Value, StepError> {
        let value = self
            .services
            .resolver
            .evaluate_expression(&s.expression, ctx)
            .map_err(|e| template_error(&step.id, e))?;
        let key = to_text(&value);

        match s.cases.get(&key) {
            Some(steps) => {
                self.run_list(steps, ctx).await?;
                Ok(json!({ "value": key, "case": key, "matched": true }))
            }
            None => {
                self.run_list(&s.default, ctx).await?;
                Ok(json!({ "value": key, "case": "default", "matched": false }))
            }
        }
    }

    async fn run_for_each(&self, step: &Step, s: &ForEachStep, ctx: &mut ExecutionContext) -> Result<Value, StepError> {
        let items = self.resolve_items(&step.id, &s.items, ctx)?;
        let total = items.len();
        let mut bindings = vec![s.item_var.as_str(), LOOP_VAR];
        if let Some(index_var) = &s.index_var {
            bindings.push(index_var.as_str());
        }

        let mut iterations = Vec::with_capacity(total);
        for (index, item) in items.into_iter().enumerate() {
            let mut fork = ctx.fork();
            fork.outputs.clear();
            fork.set_variable(s.item_var.clone(), item);
            if let Some(index_var) = &s.index_var {
                fork.set_variable(index_var.clone(), json!(index));
            }
            fork.set_variable(LOOP_VAR, loop_info(index, Some(total)));

            self.run_list(&s.body, &mut fork).await?;

            iterations.push(Value::Object(fork.outputs.clone()));
            ctx.merge_from(&fork, &bindings);
        }
        Ok(Value::Array(iterations))
    }

    async fn run_while(&self, step: &Step, s: &WhileStep, ctx: &mut ExecutionContext) -> Result<Value, StepError> {
        let mut iterations: u32 = 0;
        let completed = loop {
            if !self.condition(&step.id, &s.condition, ctx)? {
                break true;
            }
            if iterations >= s.max_iterations {
                tracing::warn!(
                    run_id = %ctx.run_id,
                    step_id = %step.id,
                    max_iterations = s.max_iterations,
                    "while loop hit its iteration cap, stopping"
                );
                break false;
            }

            let mut fork = ctx.fork();
            fork.outputs.clear();
            fork.set_variable(LOOP_VAR, loop_info(iterations as usize, None));
            self.run_list(&s.body, &mut fork).await?;
            ctx.merge_from(&fork, &[LOOP_VAR]);
            iterations += 1;
        };
        Ok(json!({ "iterations": iterations, "completed": completed }))
    }

    fn run_map(&self, step: &Step, s: &MapStep, ctx: &ExecutionContext) -> Result<Value, StepError> {
        let items = self.resolve_items(&step.id, &s.items, ctx)?;
        let total = items.len();
        let mut mapped = Vec::with_capacity(total);
        for (index, item) in items.into_iter().enumerate() {
            let scope = Bindings::new(ctx)
                .with(s.item_var.clone(), item)
                .with(LOOP_VAR, loop_info(index, Some(total)));
            let value = self
                .services
                .resolver
                .evaluate_expression(&s.expression, &scope)
                .map_err(|e| template_error(&step.id, e))?;
            mapped.push(value);
        }
        Ok(Value::Array(mapped))
    }

    fn run_filter(&self, step: &Step, s: &FilterStep, ctx: &ExecutionContext) -> Result<Value, StepError> {
        let items = self.resolve_items(&step.id, &s.items, ctx)?;
        let total = items.len();
        let mut kept = Vec::new();
        for (index, item) in items.into_iter().enumerate() {
            let scope = Bindings::new(ctx)
                .with(s.item_var.clone(), item.clone())
                .with(LOOP_VAR, loop_info(index, Some(total)));
            let keep = self
                .services
                .resolver
                .evaluate_condition(&s.condition, &scope)
                .map_err(|e| template_error(&step.id, e))?;
            if keep {
                kept.push(item);
            }
        }
        Ok(Value::Array(kept))
    }

    fn run_reduce(&self, step: &Step, s: &ReduceStep, ctx: &ExecutionContext) -> Result<Value, StepError> {
        let items = self.resolve_items(&step.id, &s.items, ctx)?;
        let total = items.len();
        let mut acc = self
            .services
            .resolver
            .resolve_deep(&s.initial_value, ctx)
            .map_err(|e| template_error(&step.id, e))?;
        for (index, item) in items.into_iter().enumerate() {
            let scope = Bindings::new(ctx)
                .with(s.acc_var.clone(), acc)
                .with(s.item_var.clone(), item)
                .with(LOOP_VAR, loop_info(index, Some(total)));
            acc = self
                .services
                .resolver
                .evaluate_expression(&s.expression, &scope)
                .map_err(|e| template_error(&step.id, e))?;
        }
        Ok(acc)
    }

    async fn run_parallel(&self, step: &Step, s: &ParallelStep, ctx: &mut ExecutionContext) -> Result<Value, StepError> {
        let limit = s
            .max_concurrent
            .unwrap_or(self.services.config.max_parallel_branches)
            .max(1);
        let base = ctx.fork();

        let mut branch_runs: Vec<BoxFuture<'_, (&str, ExecutionContext, Result<(), StepError>)>> =
            Vec::with_capacity(s.branches.len());
        for branch in &s.branches {
            let mut fork = base.fork();
            fork.outputs.clear();
            branch_runs.push(
                async move {
                    let result = self.run_list(&branch.steps, &mut fork).await;
                    (branch.id.as_str(), fork, result)
                }
                .boxed(),
            );
        }
        let mut pending = stream::iter(branch_runs).buffer_unordered(limit);

        let mut finished: Vec<(&str, ExecutionContext)> = Vec::with_capacity(s.branches.len());
        let mut errors = Map::new();
        while let Some((id, fork, result)) = pending.next().await {
            match result {
                Ok(()) => finished.push((id, fork)),
                Err(e) if s.on_error == ParallelErrorMode::Stop => {
                    tracing::warn!(step_id = %step.id, branch = id, error = %e, "parallel branch failed, cancelling the rest");
                    return Err(StepError::Failed {
                        step_id: step.id.clone(),
                        message: format!("parallel branch '{id}' failed: {e}"),
                    });
                }
                Err(e) => {
                    tracing::warn!(step_id = %step.id, branch = id, error = %e, "parallel branch failed");
                    errors.insert(id.to_string(), json!(e.to_string()));
                    finished.push((id, fork));
                }
            }
        }
        drop(pending);

        finished.sort_by_key(|(id, _)| s.branches.iter().position(|b| b.id == *id));

        let mut branches = Map::new();
        for (id, fork) in finished {
            let written = fork.changed_variables(&base);
            for (step_id, meta) in &fork.step_metadata {
                ctx.step_metadata.insert(step_id.clone(), meta.clone());
            }
            if !fork.outputs.is_empty() {
                ctx.outputs.insert(id.to_string(), Value::Object(fork.outputs.clone()));
            }
            ctx.set_variable(id, Value::Object(written.clone()));
            branches.insert(id.to_string(), Value::Object(written));
        }

        Ok(json!({ "branches": branches, "errors": errors }))
    }

    async fn run_try(&self, s: &TryStep, ctx: &mut ExecutionContext) -> Result<Value, StepError> {
        let mut outcome = match self.run_list(&s.try_steps, ctx).await {
            Ok(()) => Ok(json!({ "caught": false })),
            Err(e) => match &s.catch {
                Some(catch) => {
                    let (step_id, message) = e.origin();
                    tracing::debug!(failed_step = %step_id, error = %message, "try block failed, running catch");
                    ctx.set_variable(
                        s.error_var.clone(),
                        json!({ "message": message, "stepId": step_id }),
                    );
                    self.run_list(catch, ctx)
                        .await
                        .map(|_| json!({ "caught": true, "error": message }))
                }
                None => Err(e),
            },
        };

        if let Some(finally) = &s.finally {
            if let Err(e) = self.run_list(finally, ctx).await {
                outcome = Err(e);
            }
        }
        outcome
    }

    async fn run_sub_workflow(
        &self,
        step: &Step,
        s: &SubWorkflowStep,
        ctx: &ExecutionContext,
    ) -> Result<Value, StepError> {
        let depth = ctx.depth + 1;
        let max = self.services.config.max_sub_workflow_depth;
        if depth > max {
            return Err(StepError::DepthExceeded { depth, max });
        }

        let raw_path = self
            .services
            .resolver
            .resolve(&s.workflow_path, ctx)
            .map_err(|e| template_error(&step.id, e))?;
        let path = resolve_workflow_path(&to_text(&raw_path), ctx.workflow_dir.as_deref());
        let label = path.display().to_string();
        let sub_error = |run_id: Option<Uuid>, message: String| StepError::SubWorkflow {
            path: label.clone(),
            run_id,
            message,
        };

        let workflow = self
            .services
            .parser
            .parse_file(&path)
            .map_err(|e| sub_error(None, e.to_string()))?;

        let inputs = match self
            .services
            .resolver
            .resolve_deep(&Value::Object(s.inputs.clone()), ctx)
            .map_err(|e| template_error(&step.id, e))?
        {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        let inputs = prepare_inputs(&workflow, inputs).map_err(|message| sub_error(None, message))?;

        let child_run = Uuid::now_v7();
        let child = ExecutionContext::new(workflow.metadata.id.clone(), child_run, inputs)
            .with_workflow_dir(workflow.base_dir())
            .with_depth(depth);

        tracing::info!(
            parent_run_id = %ctx.run_id,
            run_id = %child_run,
            workflow = %workflow.metadata.id,
            depth,
            "starting sub-workflow"
        );

        let result = self.run_workflow(&workflow, child).await;
        if result.is_success() {
            Ok(Value::Object(result.output))
        } else {
            Err(sub_error(
                Some(child_run),
                result.error.unwrap_or_else(|| "sub-workflow failed".to_string()),
            ))
        }
    }

    // -----------------------------------------------------------------------
    // Helpers
    // -----------------------------------------------------------------------

    fn conditions_met(&self, step: &Step, ctx: &ExecutionContext) -> Result<bool, StepError> {
        for condition in &step.conditions {
            if !self.condition(&step.id, condition, ctx)? {
                return Ok(false);
            }
        }
        Ok(true)
    }

    fn condition(&self, step_id: &str, condition: &Value, ctx: &ExecutionContext) -> Result<bool, StepError> {
        self.services
            .resolver
            .evaluate_condition(condition, ctx)
            .map_err(|e| template_error(step_id, e))
    }

    /// Resolve a collection: null is empty, anything else must be an array.
    fn resolve_items(&self, step_id: &str, items: &Value, ctx: &ExecutionContext) -> Result<Vec<Value>, StepError> {
        match self
            .services
            .resolver
            .resolve_deep(items, ctx)
            .map_err(|e| template_error(step_id, e))?
        {
            Value::Array(items) => Ok(items),
            Value::Null => Ok(Vec::new()),
            other => Err(invalid(
                step_id,
                format!("items must resolve to an array, got {}", type_label(&other)),
            )),
        }
    }

    async fn record_rollback(&self, step: &Step, ctx: &ExecutionContext, restore_base: Option<Map<String, Value>>) {
        let Some(config) = &step.rollback else { return };
        let resolver = &self.services.resolver;
        let strategy = config.effective_strategy();
        let mut action = RollbackAction::new(step.id.clone(), self.top_index, strategy);

        if let Some(handler) = &config.action {
            let raw = Value::Object(config.inputs.clone());
            let inputs = resolver.resolve_deep(&raw, ctx).unwrap_or_else(|e| {
                tracing::warn!(step_id = %step.id, error = %e, "could not resolve rollback inputs");
                raw
            });
            action = action.with_compensation(handler.clone(), inputs);
        }

        if strategy == RollbackStrategy::Restore {
            let snapshot = match (&config.snapshot, restore_base) {
                (Some(snapshot), _) => resolver.resolve_deep(snapshot, ctx).unwrap_or_else(|_| snapshot.clone()),
                (None, Some(base)) => Value::Object(base),
                (None, None) => Value::Null,
            };
            action = action.with_snapshot(snapshot);
        }

        self.rollback.lock().await.record(action);
    }

    fn step_payload(&self, step: &Step, ctx: &ExecutionContext) -> Value {
        json!({
            "workflowId": ctx.workflow_id,
            "runId": ctx.run_id.to_string(),
            "stepId": step.id,
            "stepType": step.kind.type_name(),
            "depth": ctx.depth,
        })
    }

    async fn dispatch_hook(&self, event: HookEvent, payload: Value) {
        self.services.hooks.dispatch(event, payload).await;
    }
}

fn type_label(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
