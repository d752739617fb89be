//! Durable checkpoint manager for workflow runs.
//!
//! Wraps `ExecutionRepository` with the operations the engine needs: one
//! execution record per run, one checkpoint per top-level step transition,
//! and the resume-point calculation used to continue an interrupted run.
//! Writes are serialized behind an async mutex.

use std::sync::Arc;

use mdflow_types::execution::{ExecutionRecord, StepCheckpoint, StepStatus, WorkflowStatus};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::repository::ExecutionRepository;

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum CheckpointError {
    /// Underlying repository operation failed.
    #[error("persistence error: {0}")]
    Persistence(String),

    #[error("workflow run not found: {0}")]
    RunNotFound(Uuid),
}

fn persistence(e: impl std::fmt::Display) -> CheckpointError {
    CheckpointError::Persistence(e.to_string())
}

// ---------------------------------------------------------------------------
// CheckpointManager
// ---------------------------------------------------------------------------

/// Generic over `R: ExecutionRepository` so it works with SQLite or the
/// in-memory repository.
pub struct CheckpointManager<R: ExecutionRepository> {
    repo: Arc<R>,
    write_lock: Mutex<()>,
}

impl<R: ExecutionRepository> CheckpointManager<R> {
    pub fn new(repo: Arc<R>) -> Self {
        Self {
            repo,
            write_lock: Mutex::new(()),
        }
    }

    pub fn repo(&self) -> &Arc<R> {
        &self.repo
    }

    // -----------------------------------------------------------------------
    // Run-level records
    // -----------------------------------------------------------------------

    pub async fn create_execution(&self, record: &ExecutionRecord) -> Result<(), CheckpointError> {
        let _guard = self.write_lock.lock().await;
        self.repo.create_execution(record).await.map_err(persistence)?;
        tracing::debug!(run_id = %record.run_id, workflow = %record.workflow_id, "created execution record");
        Ok(())
    }

    pub async fn update_execution(&self, record: &ExecutionRecord) -> Result<(), CheckpointError> {
        let _guard = self.write_lock.lock().await;
        self.repo.update_execution(record).await.map_err(persistence)?;
        tracing::debug!(
            run_id = %record.run_id,
            status = ?record.status,
            current_step = record.current_step,
            "checkpointed run status"
        );
        Ok(())
    }

    pub async fn get_execution(&self, run_id: Uuid) -> Result<ExecutionRecord, CheckpointError> {
        self.repo
            .get_execution(&run_id)
            .await
            .map_err(persistence)?
            .ok_or(CheckpointError::RunNotFound(run_id))
    }

    pub async fn list_executions(
        &self,
        status: Option<WorkflowStatus>,
        limit: u32,
    ) -> Result<Vec<ExecutionRecord>, CheckpointError> {
        self.repo.list_executions(status, limit).await.map_err(persistence)
    }

    pub async fn find_interrupted(&self) -> Result<Vec<ExecutionRecord>, CheckpointError> {
        self.repo.find_interrupted().await.map_err(persistence)
    }

    // -----------------------------------------------------------------------
    // Step-level checkpoints
    // -----------------------------------------------------------------------

    pub async fn save_checkpoint(&self, checkpoint: &StepCheckpoint) -> Result<(), CheckpointError> {
        let _guard = self.write_lock.lock().await;
        self.repo.save_checkpoint(checkpoint).await.map_err(persistence)?;
        tracing::debug!(
            run_id = %checkpoint.run_id,
            step_index = checkpoint.step_index,
            step = %checkpoint.step_name,
            status = ?checkpoint.status,
            "checkpointed step"
        );
        Ok(())
    }

    pub async fn list_checkpoints(&self, run_id: Uuid) -> Result<Vec<StepCheckpoint>, CheckpointError> {
        self.repo.list_checkpoints(&run_id).await.map_err(persistence)
    }

    /// Index of the first top-level step a resumed run should execute.
    ///
    /// No checkpoint resumes at 0. A completed last checkpoint resumes after
    /// it; anything else, including a skipped step, re-runs that step.
    pub async fn get_resume_point(&self, run_id: Uuid) -> Result<usize, CheckpointError> {
        let checkpoints = self.list_checkpoints(run_id).await?;
        Ok(resume_point(&checkpoints))
    }

    // -----------------------------------------------------------------------
    // Retention
    // -----------------------------------------------------------------------

    pub async fn cleanup(&self, retention_days: u32) -> Result<u64, CheckpointError> {
        let _guard = self.write_lock.lock().await;
        let removed = self.repo.cleanup(retention_days).await.map_err(persistence)?;
        tracing::info!(removed, retention_days, "cleaned up old executions");
        Ok(removed)
    }
}

impl<R: ExecutionRepository> std::fmt::Debug for CheckpointManager<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CheckpointManager").finish_non_exhaustive()
    }
}

fn resume_point(checkpoints: &[StepCheckpoint]) -> usize {
    match checkpoints.iter().max_by_key(|c| c.step_index) {
        None => 0,
        Some(last) if last.status == StepStatus::Completed => last.step_index + 1,
        Some(last) => last.step_index,
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::InMemoryExecutionRepository;
    use chrono::Utc;
    use serde_json::json;

    fn manager() -> CheckpointManager<InMemoryExecutionRepository> {
        CheckpointManager::new(Arc::new(InMemoryExecutionRepository::new()))
    }

    fn record() -> ExecutionRecord {
        ExecutionRecord {
            run_id: Uuid::now_v7(),
            workflow_id: "resumable".to_string(),
            workflow_path: None,
            status: WorkflowStatus::Running,
            started_at: Utc::now(),
            completed_at: None,
            current_step: 0,
            total_steps: 5,
            inputs: json!({}),
            outputs: json!({}),
            error: None,
            metadata: json!({}),
        }
    }

    fn checkpoint(run_id: Uuid, index: usize, status: StepStatus) -> StepCheckpoint {
        StepCheckpoint {
            run_id,
            step_index: index,
            step_name: format!("step{index}"),
            status,
            started_at: Some(Utc::now()),
            completed_at: None,
            inputs: json!({}),
            outputs: json!(null),
            error: None,
            retry_count: 0,
        }
    }

    #[tokio::test]
    async fn test_resume_point_without_checkpoints_is_zero() {
        let mgr = manager();
        let rec = record();
        mgr.create_execution(&rec).await.unwrap();
        assert_eq!(mgr.get_resume_point(rec.run_id).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_resume_point_after_completed_step() {
        let mgr = manager();
        let rec = record();
        mgr.create_execution(&rec).await.unwrap();
        for i in 0..3 {
            mgr.save_checkpoint(&checkpoint(rec.run_id, i, StepStatus::Completed))
                .await
                .unwrap();
        }
        assert_eq!(mgr.get_resume_point(rec.run_id).await.unwrap(), 3);

    }

    #[tokio::test]
    async fn test_resume_point_reevaluates_skipped_step() {
        let mgr = manager();
        let rec = record();
        mgr.create_execution(&rec).await.unwrap();
        mgr.save_checkpoint(&checkpoint(rec.run_id, 0, StepStatus::Completed))
            .await
            .unwrap();
        mgr.save_checkpoint(&checkpoint(rec.run_id, 1, StepStatus::Skipped))
            .await
            .unwrap();
        assert_eq!(mgr.get_resume_point(rec.run_id).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_resume_point_reruns_unfinished_step() {
        let mgr = manager();
        let rec = record();
        mgr.create_execution(&rec).await.unwrap();
        mgr.save_checkpoint(&checkpoint(rec.run_id, 0, StepStatus::Completed))
            .await
            .unwrap();
        mgr.save_checkpoint(&checkpoint(rec.run_id, 1, StepStatus::Running))
            .await
            .unwrap();
        assert_eq!(mgr.get_resume_point(rec.run_id).await.unwrap(), 1);

        mgr.save_checkpoint(&checkpoint(rec.run_id, 1, StepStatus::Failed))
            .await
            .unwrap();
        assert_eq!(mgr.get_resume_point(rec.run_id).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_missing_run_is_not_found() {
        let mgr = manager();
        assert!(matches!(
            mgr.get_execution(Uuid::now_v7()).await,
            Err(CheckpointError::RunNotFound(_))
        ));
    }

    #[test]
    fn checkpoint_error_display() {
        let err = CheckpointError::Persistence("disk full".to_string());
        assert!(err.to_string().contains("disk full"));
    }
}
