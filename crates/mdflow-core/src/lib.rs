//! Workflow engine and repository trait definitions for mdflow.
//!
//! This crate defines the "ports" (repository traits) that the
//! infrastructure layer implements, the template resolver, and the engine
//! that interprets workflow steps. It depends only on `mdflow-types` --
//! never on `mdflow-infra` or any database crate.

pub mod repository;
pub mod template;
pub mod workflow;
