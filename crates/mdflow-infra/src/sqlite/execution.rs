//! SQLite execution repository implementation.
//!
//! Implements `ExecutionRepository` from `mdflow-core` using sqlx with split
//! read/write pools. Inputs, outputs and the context snapshot are stored as
//! JSON text. Checkpoints are upserted on `(run_id, step_index)` and deleted
//! with their execution through `ON DELETE CASCADE`.

use chrono::{DateTime, Duration, SecondsFormat, Utc};
use mdflow_core::repository::ExecutionRepository;
use mdflow_types::error::RepositoryError;
use mdflow_types::execution::{ExecutionRecord, StepCheckpoint, StepStatus, WorkflowStatus};
use serde_json::Value;
use sqlx::Row;
use uuid::Uuid;

use super::pool::DatabasePool;

/// SQLite-backed implementation of `ExecutionRepository`.
pub struct SqliteExecutionRepository {
    pool: DatabasePool,
}

impl SqliteExecutionRepository {
    /// Create a new repository backed by the given database pool.
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }
}

// ---------------------------------------------------------------------------
// Internal row types
// ---------------------------------------------------------------------------

struct ExecutionRow {
    run_id: String,
    workflow_id: String,
    workflow_path: Option<String>,
    status: String,
    started_at: String,
    completed_at: Option<String>,
    current_step: i64,
    total_steps: i64,
    inputs: String,
    outputs: String,
    error: Option<String>,
    metadata: String,
}

impl ExecutionRow {
    fn from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            run_id: row.try_get("run_id")?,
            workflow_id: row.try_get("workflow_id")?,
            workflow_path: row.try_get("workflow_path")?,
            status: row.try_get("status")?,
            started_at: row.try_get("started_at")?,
            completed_at: row.try_get("completed_at")?,
            current_step: row.try_get("current_step")?,
            total_steps: row.try_get("total_steps")?,
            inputs: row.try_get("inputs")?,
            outputs: row.try_get("outputs")?,
            error: row.try_get("error")?,
            metadata: row.try_get("metadata")?,
        })
    }

    fn into_record(self) -> Result<ExecutionRecord, RepositoryError> {
        Ok(ExecutionRecord {
            run_id: parse_uuid(&self.run_id)?,
            workflow_id: self.workflow_id,
            workflow_path: self.workflow_path,
            status: parse_status(&self.status, "run")?,
            started_at: parse_datetime(&self.started_at)?,
            completed_at: self.completed_at.as_deref().map(parse_datetime).transpose()?,
            current_step: self.current_step.max(0) as usize,
            total_steps: self.total_steps.max(0) as usize,
            inputs: parse_json(&self.inputs, "inputs")?,
            outputs: parse_json(&self.outputs, "outputs")?,
            error: self.error,
            metadata: parse_json(&self.metadata, "metadata")?,
        })
    }
}

struct CheckpointRow {
    run_id: String,
    step_index: i64,
    step_name: String,
    status: String,
    started_at: Option<String>,
    completed_at: Option<String>,
    inputs: String,
    outputs: String,
    error: Option<String>,
    retry_count: i64,
}

impl CheckpointRow {
    fn from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            run_id: row.try_get("run_id")?,
            step_index: row.try_get("step_index")?,
            step_name: row.try_get("step_name")?,
            status: row.try_get("status")?,
            started_at: row.try_get("started_at")?,
            completed_at: row.try_get("completed_at")?,
            inputs: row.try_get("inputs")?,
            outputs: row.try_get("outputs")?,
            error: row.try_get("error")?,
            retry_count: row.try_get("retry_count")?,
        })
    }

    fn into_checkpoint(self) -> Result<StepCheckpoint, RepositoryError> {
        let status: StepStatus = serde_json::from_value(Value::String(self.status.clone()))
            .map_err(|_| RepositoryError::Query(format!("invalid step status: {}", self.status)))?;

        Ok(StepCheckpoint {
            run_id: parse_uuid(&self.run_id)?,
            step_index: self.step_index.max(0) as usize,
            step_name: self.step_name,
            status,
            started_at: self.started_at.as_deref().map(parse_datetime).transpose()?,
            completed_at: self.completed_at.as_deref().map(parse_datetime).transpose()?,
            inputs: parse_json(&self.inputs, "checkpoint inputs")?,
            outputs: parse_json(&self.outputs, "checkpoint outputs")?,
            error: self.error,
            retry_count: self.retry_count.max(0) as u32,
        })
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn parse_uuid(s: &str) -> Result<Uuid, RepositoryError> {
    s.parse::<Uuid>()
        .map_err(|e| RepositoryError::Query(format!("invalid UUID: {e}")))
}

fn parse_datetime(s: &str) -> Result<DateTime<Utc>, RepositoryError> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| RepositoryError::Query(format!("invalid datetime: {e}")))
}

/// Fixed-width UTC timestamps so string comparison matches time order.
fn format_datetime(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_json(s: &str, what: &str) -> Result<Value, RepositoryError> {
    serde_json::from_str(s).map_err(|e| RepositoryError::Query(format!("invalid {what} JSON: {e}")))
}

fn to_json(value: &Value) -> Result<String, RepositoryError> {
    serde_json::to_string(value).map_err(|e| RepositoryError::Query(e.to_string()))
}

fn parse_status(s: &str, what: &str) -> Result<WorkflowStatus, RepositoryError> {
    serde_json::from_value(Value::String(s.to_string()))
        .map_err(|_| RepositoryError::Query(format!("invalid {what} status: {s}")))
}

fn status_str<T: serde::Serialize>(status: &T) -> Result<String, RepositoryError> {
    serde_json::to_value(status)
        .map_err(|e| RepositoryError::Query(e.to_string()))?
        .as_str()
        .map(str::to_string)
        .ok_or_else(|| RepositoryError::Query("status must serialize to a string".to_string()))
}

fn query_error(e: sqlx::Error) -> RepositoryError {
    match e {
        sqlx::Error::Database(db) if db.is_unique_violation() => RepositoryError::Conflict(db.message().to_string()),
        sqlx::Error::Database(db) if db.is_foreign_key_violation() => RepositoryError::NotFound,
        sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed => RepositoryError::Connection,
        other => RepositoryError::Query(other.to_string()),
    }
}

// ---------------------------------------------------------------------------
// ExecutionRepository impl
// ---------------------------------------------------------------------------

impl ExecutionRepository for SqliteExecutionRepository {
    async fn create_execution(&self, record: &ExecutionRecord) -> Result<(), RepositoryError> {
        sqlx::query(
            r#"INSERT INTO executions
               (run_id, workflow_id, workflow_path, status, started_at, completed_at,
                current_step, total_steps, inputs, outputs, error, metadata)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"#,
        )
        .bind(record.run_id.to_string())
        .bind(&record.workflow_id)
        .bind(&record.workflow_path)
        .bind(status_str(&record.status)?)
        .bind(format_datetime(&record.started_at))
        .bind(record.completed_at.as_ref().map(format_datetime))
        .bind(record.current_step as i64)
        .bind(record.total_steps as i64)
        .bind(to_json(&record.inputs)?)
        .bind(to_json(&record.outputs)?)
        .bind(&record.error)
        .bind(to_json(&record.metadata)?)
        .execute(&self.pool.writer)
        .await
        .map_err(query_error)?;

        Ok(())
    }

    async fn update_execution(&self, record: &ExecutionRecord) -> Result<(), RepositoryError> {
        let result = sqlx::query(
            r#"UPDATE executions SET
                 status = ?, completed_at = ?, current_step = ?, total_steps = ?,
                 outputs = ?, error = ?, metadata = ?
               WHERE run_id = ?"#,
        )
        .bind(status_str(&record.status)?)
        .bind(record.completed_at.as_ref().map(format_datetime))
        .bind(record.current_step as i64)
        .bind(record.total_steps as i64)
        .bind(to_json(&record.outputs)?)
        .bind(&record.error)
        .bind(to_json(&record.metadata)?)
        .bind(record.run_id.to_string())
        .execute(&self.pool.writer)
        .await
        .map_err(query_error)?;

        if result.rows_affected() == 0 {
            return Err(RepositoryError::NotFound);
        }
        Ok(())
    }

    async fn get_execution(&self, run_id: &Uuid) -> Result<Option<ExecutionRecord>, RepositoryError> {
        let row = sqlx::query("SELECT * FROM executions WHERE run_id = ?")
            .bind(run_id.to_string())
            .fetch_optional(&self.pool.reader)
            .await
            .map_err(query_error)?;

        match row {
            Some(row) => {
                let r = ExecutionRow::from_row(&row).map_err(|e| RepositoryError::Query(e.to_string()))?;
                Ok(Some(r.into_record()?))
            }
            None => Ok(None),
        }
    }

    async fn list_executions(
        &self,
        status: Option<WorkflowStatus>,
        limit: u32,
    ) -> Result<Vec<ExecutionRecord>, RepositoryError> {
        let rows = match status {
            Some(status) => {
                sqlx::query("SELECT * FROM executions WHERE status = ? ORDER BY started_at DESC LIMIT ?")
                    .bind(status_str(&status)?)
                    .bind(i64::from(limit))
                    .fetch_all(&self.pool.reader)
                    .await
            }
            None => {
                sqlx::query("SELECT * FROM executions ORDER BY started_at DESC LIMIT ?")
                    .bind(i64::from(limit))
                    .fetch_all(&self.pool.reader)
                    .await
            }
        }
        .map_err(query_error)?;

        let mut records = Vec::with_capacity(rows.len());
        for row in &rows {
            let r = ExecutionRow::from_row(row).map_err(|e| RepositoryError::Query(e.to_string()))?;
            records.push(r.into_record()?);
        }
        Ok(records)
    }

    async fn find_interrupted(&self) -> Result<Vec<ExecutionRecord>, RepositoryError> {
        let rows = sqlx::query("SELECT * FROM executions WHERE status = 'running' ORDER BY started_at ASC")
            .fetch_all(&self.pool.reader)
            .await
            .map_err(query_error)?;

        let mut records = Vec::with_capacity(rows.len());
        for row in &rows {
            let r = ExecutionRow::from_row(row).map_err(|e| RepositoryError::Query(e.to_string()))?;
            records.push(r.into_record()?);
        }
        Ok(records)
    }

    async fn save_checkpoint(&self, checkpoint: &StepCheckpoint) -> Result<(), RepositoryError> {
        sqlx::query(
            r#"INSERT INTO checkpoints
               (run_id, step_index, step_name, status, started_at, completed_at,
                inputs, outputs, error, retry_count)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
               ON CONFLICT(run_id, step_index) DO UPDATE SET
                 step_name = excluded.step_name,
                 status = excluded.status,
                 started_at = excluded.started_at,
                 completed_at = excluded.completed_at,
                 inputs = excluded.inputs,
                 outputs = excluded.outputs,
                 error = excluded.error,
                 retry_count = excluded.retry_count"#,
        )
        .bind(checkpoint.run_id.to_string())
        .bind(checkpoint.step_index as i64)
        .bind(&checkpoint.step_name)
        .bind(status_str(&checkpoint.status)?)
        .bind(checkpoint.started_at.as_ref().map(format_datetime))
        .bind(checkpoint.completed_at.as_ref().map(format_datetime))
        .bind(to_json(&checkpoint.inputs)?)
        .bind(to_json(&checkpoint.outputs)?)
        .bind(&checkpoint.error)
        .bind(i64::from(checkpoint.retry_count))
        .execute(&self.pool.writer)
        .await
        .map_err(query_error)?;

        Ok(())
    }

    async fn list_checkpoints(&self, run_id: &Uuid) -> Result<Vec<StepCheckpoint>, RepositoryError> {
        let rows = sqlx::query("SELECT * FROM checkpoints WHERE run_id = ? ORDER BY step_index ASC")
            .bind(run_id.to_string())
            .fetch_all(&self.pool.reader)
            .await
            .map_err(query_error)?;

        let mut checkpoints = Vec::with_capacity(rows.len());
        for row in &rows {
            let r = CheckpointRow::from_row(row).map_err(|e| RepositoryError::Query(e.to_string()))?;
            checkpoints.push(r.into_checkpoint()?);
        }
        Ok(checkpoints)
    }

    async fn cleanup(&self, retention_days: u32) -> Result<u64, RepositoryError> {
        let cutoff = Utc::now() - Duration::days(i64::from(retention_days));

        let result = sqlx::query("DELETE FROM executions WHERE started_at < ?")
            .bind(format_datetime(&cutoff))
            .execute(&self.pool.writer)
            .await
            .map_err(query_error)?;

        Ok(result.rows_affected())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
