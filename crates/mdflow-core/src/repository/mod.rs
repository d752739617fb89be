//! Repository trait definitions (ports).
//!
//! These traits define the storage interface that the infrastructure layer
//! (mdflow-infra) implements. The core crate never depends on any specific
//! storage technology.

pub mod execution;
pub mod memory;

pub use execution::ExecutionRepository;
pub use memory::InMemoryExecutionRepository;
