//! Workflow engine core: definition parsing, step interpretation, rollback
//! and durable checkpointing.
//!
//! - `definition` -- markdown/YAML parsing, legacy type inference, validation
//! - `context` -- execution context with variable tracking and template scope
//! - `step_runner` -- interpreter for every step type
//! - `builtins` -- `core.*` actions handled without an executor
//! - `retry` / `circuit` -- retry policy and per-target circuit breaker
//! - `rollback` -- saga-style compensation registry and transactions
//! - `checkpoint` -- checkpoint manager and resume-point calculation
//! - `hooks` -- lifecycle hook dispatcher
//! - `executor` -- the `WorkflowEngine` entry points

pub mod builtins;
pub mod checkpoint;
pub mod circuit;
pub mod context;
pub mod definition;
pub mod executor;
pub mod hooks;
pub mod retry;
pub mod rollback;
pub mod step_runner;

pub use self::executor::{EngineError, FnExecutor, WorkflowEngine};
pub use self::step_runner::{ActionExecutor, ActionInvocation, SdkRegistry, StepError};
