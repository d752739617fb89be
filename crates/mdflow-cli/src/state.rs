//! Application state wiring the engine to its SQLite store.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use mdflow_core::workflow::WorkflowEngine;
use mdflow_infra::config::{data_dir, load_engine_config};
use mdflow_infra::sqlite::execution::SqliteExecutionRepository;
use mdflow_infra::sqlite::pool::{DatabasePool, DATABASE_FILE};
use mdflow_types::config::EngineConfig;

/// Engine pinned to the SQLite repository.
pub type ConcreteEngine = WorkflowEngine<SqliteExecutionRepository>;

pub struct AppState {
    pub engine: ConcreteEngine,
    pub config: EngineConfig,
    pub data_dir: PathBuf,
    pub db_path: PathBuf,
}

impl AppState {
    /// Load `config.toml`, open (and migrate) the run database and build
    /// the engine. `db_override` replaces `{data_dir}/mdflow.db`.
    pub async fn init(db_override: Option<&Path>) -> anyhow::Result<Self> {
        let data_dir = data_dir();
        tokio::fs::create_dir_all(&data_dir)
            .await
            .with_context(|| format!("Failed to create data directory {}", data_dir.display()))?;

        let config = load_engine_config(&data_dir).await;

        let db_path = db_override
            .map(Path::to_path_buf)
            .unwrap_or_else(|| data_dir.join(DATABASE_FILE));
        let pool = DatabasePool::open(&db_path)
            .await
            .with_context(|| format!("Failed to open run database {}", db_path.display()))?;

        let repo = Arc::new(SqliteExecutionRepository::new(pool));
        let engine = WorkflowEngine::new(repo).with_config(config.clone());

        tracing::debug!(data_dir = %data_dir.display(), db = %db_path.display(), "initialized app state");

        Ok(Self {
            engine,
            config,
            data_dir,
            db_path,
        })
    }
}
