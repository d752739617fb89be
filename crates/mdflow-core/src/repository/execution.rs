//! Execution repository trait definition.
//!
//! Defines the storage interface for execution records (one per run) and
//! step checkpoints (one per run and top-level step index).

use mdflow_types::error::RepositoryError;
use mdflow_types::execution::{ExecutionRecord, StepCheckpoint, WorkflowStatus};
use uuid::Uuid;

/// Repository trait for run persistence.
///
/// Uses native async fn in traits (Rust 2024 edition, no async_trait macro).
pub trait ExecutionRepository: Send + Sync {
    // -----------------------------------------------------------------------
    // Executions
    // -----------------------------------------------------------------------

    /// Insert a new execution record. Fails with `Conflict` if the run exists.
    fn create_execution(
        &self,
        record: &ExecutionRecord,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// Replace the mutable fields of an existing execution record.
    fn update_execution(
        &self,
        record: &ExecutionRecord,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    fn get_execution(
        &self,
        run_id: &Uuid,
    ) -> impl std::future::Future<Output = Result<Option<ExecutionRecord>, RepositoryError>> + Send;

    /// List executions, newest first, optionally filtered by status.
    fn list_executions(
        &self,
        status: Option<WorkflowStatus>,
        limit: u32,
    ) -> impl std::future::Future<Output = Result<Vec<ExecutionRecord>, RepositoryError>> + Send;

    /// Runs still marked `running`, typically left behind by a crash.
    fn find_interrupted(
        &self,
    ) -> impl std::future::Future<Output = Result<Vec<ExecutionRecord>, RepositoryError>> + Send;

    // -----------------------------------------------------------------------
    // Checkpoints
    // -----------------------------------------------------------------------

    /// Insert or replace the checkpoint for `(run_id, step_index)`.
    fn save_checkpoint(
        &self,
        checkpoint: &StepCheckpoint,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// Checkpoints for a run, ordered by step index.
    fn list_checkpoints(
        &self,
        run_id: &Uuid,
    ) -> impl std::future::Future<Output = Result<Vec<StepCheckpoint>, RepositoryError>> + Send;

    // -----------------------------------------------------------------------
    // Retention
    // -----------------------------------------------------------------------

    /// Delete executions (and their checkpoints) started more than
    /// `retention_days` ago. Returns the number of executions removed.
    fn cleanup(
        &self,
        retention_days: u32,
    ) -> impl std::future::Future<Output = Result<u64, RepositoryError>> + Send;
}
