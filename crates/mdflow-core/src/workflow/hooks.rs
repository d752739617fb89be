//! Lifecycle hooks fired by the engine around workflows and steps.
//!
//! Handlers are async callbacks keyed by event. They run in registration
//! order; a handler may stop later handlers for the same event by returning
//! `HookResponse { stop_propagation: true }`. Handler errors are logged and
//! never fail the workflow.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use futures_util::future::BoxFuture;
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HookEvent {
    WorkflowBeforeStart,
    WorkflowAfterStart,
    WorkflowBeforeEnd,
    WorkflowAfterEnd,
    WorkflowOnError,
    StepBeforeExecute,
    StepAfterExecute,
    StepOnRetry,
    StepOnSkip,
    StepOnError,
}

impl HookEvent {
    pub fn as_str(&self) -> &'static str {
        match self {
            HookEvent::WorkflowBeforeStart => "workflow.before_start",
            HookEvent::WorkflowAfterStart => "workflow.after_start",
            HookEvent::WorkflowBeforeEnd => "workflow.before_end",
            HookEvent::WorkflowAfterEnd => "workflow.after_end",
            HookEvent::WorkflowOnError => "workflow.on_error",
            HookEvent::StepBeforeExecute => "step.before_execute",
            HookEvent::StepAfterExecute => "step.after_execute",
            HookEvent::StepOnRetry => "step.on_retry",
            HookEvent::StepOnSkip => "step.on_skip",
            HookEvent::StepOnError => "step.on_error",
        }
    }
}

impl std::fmt::Display for HookEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HookResponse {
    pub stop_propagation: bool,
}

impl HookResponse {
    pub fn stop() -> Self {
        Self {
            stop_propagation: true,
        }
    }
}

pub type HookHandler = Arc<dyn Fn(HookEvent, Value) -> BoxFuture<'static, Result<HookResponse, String>> + Send + Sync>;

#[derive(Clone, Default)]
pub struct HookDispatcher {
    handlers: HashMap<HookEvent, Vec<HookHandler>>,
}

impl HookDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an async handler for `event`.
    pub fn on<F, Fut>(&mut self, event: HookEvent, handler: F)
    where
        F: Fn(HookEvent, Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<HookResponse, String>> + Send + 'static,
    {
        let handler: HookHandler = Arc::new(move |event, payload| Box::pin(handler(event, payload)));
        self.handlers.entry(event).or_default().push(handler);
    }

    /// Run every handler for `event` in registration order.
    pub async fn dispatch(&self, event: HookEvent, payload: Value) {
        let Some(handlers) = self.handlers.get(&event) else {
            return;
        };

        for (index, handler) in handlers.iter().enumerate() {
            match handler(event, payload.clone()).await {
                Ok(response) if response.stop_propagation => {
                    tracing::debug!(event = %event, handler = index, "hook stopped propagation");
                    break;
                }
                Ok(_) => {}
                Err(e) => {
                    tracing::warn!(event = %event, handler = index, error = %e, "hook handler failed");
                }
            }
        }
    }

    pub fn handler_count(&self, event: HookEvent) -> usize {
        self.handlers.get(&event).map_or(0, Vec::len)
    }
}

impl std::fmt::Debug for HookDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let total: usize = self.handlers.values().map(Vec::len).sum();
        f.debug_struct("HookDispatcher")
            .field("handler_count", &total)
            .finish()
    }
}
