//! Infrastructure layer for mdflow.
//!
//! Contains implementations of the repository traits defined in `mdflow-core`
//! (SQLite storage with WAL mode and split read/write pools) and the engine
//! configuration loader.

pub mod config;
pub mod sqlite;
