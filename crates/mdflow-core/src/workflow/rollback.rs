//! Compensation registry for undoing completed steps.
//!
//! Every successful step that declares a `rollback` block records a
//! `RollbackAction`. On rollback the registry walks its history newest
//! first and undoes each action according to its strategy. History is a
//! bounded ring buffer: past `max_history` entries the oldest are dropped.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use futures_util::future::BoxFuture;
use mdflow_types::rollback::{RollbackAction, RollbackReport, RollbackStatus, RollbackStrategy};
use serde_json::{Map, Value};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum RollbackError {
    #[error("no compensation handler registered for '{0}'")]
    MissingHandler(String),

    #[error("compensation '{action}' for step '{step}' failed: {message}")]
    Compensation {
        action: String,
        step: String,
        message: String,
    },

    #[error("restore for step '{0}' has no state snapshot")]
    MissingSnapshot(String),

    #[error("unknown savepoint '{0}'")]
    UnknownSavepoint(String),
}

// ---------------------------------------------------------------------------
// Compensation handlers
// ---------------------------------------------------------------------------

/// What a compensation handler is asked to undo.
#[derive(Debug, Clone)]
pub struct CompensationRequest {
    pub run_id: Option<Uuid>,
    pub action: String,
    pub step_name: String,
    pub step_index: usize,
    pub inputs: Value,
}

pub type CompensationHandler =
    Arc<dyn Fn(CompensationRequest) -> BoxFuture<'static, Result<(), String>> + Send + Sync>;

/// Handlers keyed by the `rollback.action` id steps refer to.
#[derive(Clone, Default)]
pub struct CompensationHandlers {
    handlers: HashMap<String, CompensationHandler>,
}

impl CompensationHandlers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, action: impl Into<String>, handler: CompensationHandler) {
        self.handlers.insert(action.into(), handler);
    }

    pub fn get(&self, action: &str) -> Option<&CompensationHandler> {
        self.handlers.get(action)
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

impl std::fmt::Debug for CompensationHandlers {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut names: Vec<&String> = self.handlers.keys().collect();
        names.sort();
        f.debug_struct("CompensationHandlers")
            .field("actions", &names)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// RollbackRegistry
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub struct RollbackRegistry {
    run_id: Option<Uuid>,
    /// `(sequence, action)`; sequence numbers never repeat, so savepoints
    /// stay valid after the ring buffer drops old entries.
    history: VecDeque<(u64, RollbackAction)>,
    next_seq: u64,
    max_history: usize,
    handlers: Arc<CompensationHandlers>,
}

impl RollbackRegistry {
    pub fn new(max_history: usize, handlers: Arc<CompensationHandlers>) -> Self {
        Self {
            run_id: None,
            history: VecDeque::new(),
            next_seq: 0,
            max_history: max_history.max(1),
            handlers,
        }
    }

    pub fn for_run(mut self, run_id: Uuid) -> Self {
        self.run_id = Some(run_id);
        self
    }

    /// Append an action, dropping the oldest entry past `max_history`.
    pub fn record(&mut self, action: RollbackAction) {
        self.history.push_back((self.next_seq, action));
        self.next_seq += 1;
        while self.history.len() > self.max_history {
            if let Some((_, dropped)) = self.history.pop_front() {
                tracing::debug!(step = %dropped.step_name, "rollback history full, dropping oldest action");
            }
        }
    }

    pub fn len(&self) -> usize {
        self.history.len()
    }

    pub fn is_empty(&self) -> bool {
        self.history.is_empty()
    }

    /// Recorded actions, oldest first.
    pub fn history(&self) -> impl Iterator<Item = &RollbackAction> {
        self.history.iter().map(|(_, a)| a)
    }

    pub fn clear(&mut self) {
        self.history.clear();
    }

    pub(crate) fn next_seq(&self) -> u64 {
        self.next_seq
    }

    /// Undo every recorded action, newest first.
    pub async fn rollback_all(&mut self, variables: &mut Map<String, Value>, stop_on_error: bool) -> RollbackReport {
        self.unwind(|_, _| true, variables, stop_on_error).await
    }

    /// Undo only the actions recorded by steps after `step_index`.
    pub async fn rollback_to(
        &mut self,
        step_index: usize,
        variables: &mut Map<String, Value>,
        stop_on_error: bool,
    ) -> RollbackReport {
        self.unwind(|_, a| a.step_index > step_index, variables, stop_on_error)
            .await
    }

    pub(crate) async fn rollback_from_seq(
        &mut self,
        seq: u64,
        variables: &mut Map<String, Value>,
        stop_on_error: bool,
    ) -> RollbackReport {
        self.unwind(|s, _| s >= seq, variables, stop_on_error).await
    }

    async fn unwind<P>(&mut self, include: P, variables: &mut Map<String, Value>, stop_on_error: bool) -> RollbackReport
    where
        P: Fn(u64, &RollbackAction) -> bool,
    {
        let mut report = RollbackReport::default();

        while let Some((seq, action)) = self.history.back() {
            if !include(*seq, action) {
                break;
            }
            let Some((_, mut action)) = self.history.pop_back() else {
                break;
            };

            action.status = RollbackStatus::InProgress;
            report.visited.push(action.step_name.clone());

            match self.undo(&action, variables).await {
                Ok(RollbackStatus::Skipped) => {
                    action.status = RollbackStatus::Skipped;
                    report.skipped += 1;
                }
                Ok(_) => {
                    action.status = RollbackStatus::Completed;
                    report.rolled_back += 1;
                }
                Err(e) => {
                    action.status = RollbackStatus::Failed;
                    tracing::warn!(step = %action.step_name, error = %e, "rollback action failed");
                    report.failed += 1;
                    report.errors.push(e.to_string());
                    if stop_on_error {
                        break;
                    }
                }
            }
        }

        tracing::info!(
            rolled_back = report.rolled_back,
            failed = report.failed,
            skipped = report.skipped,
            "rollback finished"
        );
        report
    }

    async fn undo(&self, action: &RollbackAction, variables: &mut Map<String, Value>) -> Result<RollbackStatus, RollbackError> {
        match action.strategy {
            RollbackStrategy::None => Ok(RollbackStatus::Skipped),
            RollbackStrategy::Idempotent => Ok(RollbackStatus::Completed),
            RollbackStrategy::Restore => match &action.state_snapshot {
                Some(Value::Object(snapshot)) => {
                    for (k, v) in snapshot {
                        variables.insert(k.clone(), v.clone());
                    }
                    Ok(RollbackStatus::Completed)
                }
                _ => Err(RollbackError::MissingSnapshot(action.step_name.clone())),
            },
            RollbackStrategy::Compensate => {
                let name = action
                    .compensate_action
                    .clone()
                    .ok_or_else(|| RollbackError::MissingHandler(String::new()))?;
                let handler = self
                    .handlers
                    .get(&name)
                    .ok_or_else(|| RollbackError::MissingHandler(name.clone()))?;

                let request = CompensationRequest {
                    run_id: self.run_id,
                    action: name.clone(),
                    step_name: action.step_name.clone(),
                    step_index: action.step_index,
                    inputs: action.compensate_inputs.clone(),
                };
                handler(request)
                    .await
                    .map(|_| RollbackStatus::Completed)
                    .map_err(|message| RollbackError::Compensation {
                        action: name,
                        step: action.step_name.clone(),
                        message,
                    })
            }
        }
    }
}

// ---------------------------------------------------------------------------
// TransactionContext
// ---------------------------------------------------------------------------

/// Groups recorded actions into a unit that is either committed (history
/// discarded) or rolled back, with named savepoints in between.
#[derive(Debug)]
pub struct TransactionContext {
    registry: RollbackRegistry,
    savepoints: Vec<(String, u64)>,
}

impl TransactionContext {
    pub fn new(registry: RollbackRegistry) -> Self {
        Self {
            registry,
            savepoints: Vec::new(),
        }
    }

    pub fn record(&mut self, action: RollbackAction) {
        self.registry.record(action);
    }

    pub fn registry(&self) -> &RollbackRegistry {
        &self.registry
    }

    /// Mark the current position. Re-using a name moves the savepoint.
    pub fn savepoint(&mut self, name: impl Into<String>) {
        let name = name.into();
        self.savepoints.retain(|(n, _)| *n != name);
        self.savepoints.push((name, self.registry.next_seq()));
    }

    /// Undo everything recorded after `name`. Later savepoints are released;
    /// `name` itself stays usable.
    pub async fn rollback_to_savepoint(
        &mut self,
        name: &str,
        variables: &mut Map<String, Value>,
    ) -> Result<RollbackReport, RollbackError> {
        let position = self
            .savepoints
            .iter()
            .rposition(|(n, _)| n == name)
            .ok_or_else(|| RollbackError::UnknownSavepoint(name.to_string()))?;
        let seq = self.savepoints[position].1;
        self.savepoints.truncate(position + 1);
        Ok(self.registry.rollback_from_seq(seq, variables, false).await)
    }

    /// Keep all effects and forget the history.
    pub fn commit(&mut self) {
        self.registry.clear();
        self.savepoints.clear();
    }

    /// Undo everything recorded in this transaction.
    pub async fn rollback(&mut self, variables: &mut Map<String, Value>) -> RollbackReport {
        self.savepoints.clear();
        self.registry.rollback_all(variables, false).await
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
