//! Migration Module
//!
//! Everything about the applied migration log:
//! - Records and their identifiers
//! - Schema operations and their forward effect
//! - Log sources (migration directory, database table)
//! - Dependency graph and replay

pub mod graph;
pub mod log;
pub mod operations;
pub mod record;
pub mod state;

pub use graph::{GraphError, MigrationGraph};
pub use log::{LogBackend, MigrationLog};
pub use operations::*;
pub use record::{MigrationKey, MigrationRecord};
pub use state::ProjectState;
