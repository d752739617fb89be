//! Shared domain types for mdflow.
//!
//! This crate contains the types exchanged between the engine, the storage
//! layer and the CLI: the workflow document model, run results, checkpoint
//! and execution records, rollback records and engine configuration.
//!
//! Zero infrastructure dependencies -- only serde, uuid, chrono, thiserror.

pub mod config;
pub mod error;
pub mod execution;
pub mod rollback;
pub mod workflow;
