//! In-memory execution repository for tests and ephemeral runs.

use std::collections::BTreeMap;

use chrono::{Duration, Utc};
use dashmap::DashMap;
use mdflow_types::error::RepositoryError;
use mdflow_types::execution::{ExecutionRecord, StepCheckpoint, WorkflowStatus};
use uuid::Uuid;

use super::ExecutionRepository;

#[derive(Debug, Default)]
pub struct InMemoryExecutionRepository {
    executions: DashMap<Uuid, ExecutionRecord>,
    checkpoints: DashMap<Uuid, BTreeMap<usize, StepCheckpoint>>,
}

impl InMemoryExecutionRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ExecutionRepository for InMemoryExecutionRepository {
    async fn create_execution(&self, record: &ExecutionRecord) -> Result<(), RepositoryError> {
        if self.executions.contains_key(&record.run_id) {
            return Err(RepositoryError::Conflict(format!(
                "execution {} already exists",
                record.run_id
            )));
        }
        self.executions.insert(record.run_id, record.clone());
        Ok(())
    }

    async fn update_execution(&self, record: &ExecutionRecord) -> Result<(), RepositoryError> {
        match self.executions.get_mut(&record.run_id) {
            Some(mut existing) => {
                *existing = record.clone();
                Ok(())
            }
            None => Err(RepositoryError::NotFound),
        }
    }

    async fn get_execution(&self, run_id: &Uuid) -> Result<Option<ExecutionRecord>, RepositoryError> {
        Ok(self.executions.get(run_id).map(|r| r.value().clone()))
    }

    async fn list_executions(
        &self,
        status: Option<WorkflowStatus>,
        limit: u32,
    ) -> Result<Vec<ExecutionRecord>, RepositoryError> {
        let mut records: Vec<ExecutionRecord> = self
            .executions
            .iter()
            .filter(|r| status.is_none_or(|s| r.status == s))
            .map(|r| r.value().clone())
            .collect();
        records.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        records.truncate(limit as usize);
        Ok(records)
    }

    async fn find_interrupted(&self) -> Result<Vec<ExecutionRecord>, RepositoryError> {
        self.list_executions(Some(WorkflowStatus::Running), u32::MAX).await
    }

    async fn save_checkpoint(&self, checkpoint: &StepCheckpoint) -> Result<(), RepositoryError> {
        if !self.executions.contains_key(&checkpoint.run_id) {
            return Err(RepositoryError::NotFound);
        }
        self.checkpoints
            .entry(checkpoint.run_id)
            .or_default()
            .insert(checkpoint.step_index, checkpoint.clone());
        Ok(())
    }

    async fn list_checkpoints(&self, run_id: &Uuid) -> Result<Vec<StepCheckpoint>, RepositoryError> {
        Ok(self
            .checkpoints
            .get(run_id)
            .map(|c| c.values().cloned().collect())
            .unwrap_or_default())
    }

    async fn cleanup(&self, retention_days: u32) -> Result<u64, RepositoryError> {
        let cutoff = Utc::now() - Duration::days(i64::from(retention_days));
        let expired: Vec<Uuid> = self
            .executions
            .iter()
            .filter(|r| r.started_at < cutoff)
            .map(|r| r.run_id)
            .collect();
        for run_id in &expired {
            self.executions.remove(run_id);
            self.checkpoints.remove(run_id);
        }
        Ok(expired.len() as u64)
    }
}
