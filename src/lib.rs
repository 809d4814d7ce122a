// Docpipe - persistence pipeline worker for collaborative document snapshots

pub mod config;
pub mod db;
pub mod engine;
pub mod models;
pub mod notify;
pub mod queue;
pub mod routes;
pub mod shutdown;
pub mod snapshot;
pub mod types;
pub mod worker;

// Re-exports for convenience
pub use config::Config;
pub use engine::PersistenceEngine;
pub use types::{AppError, AppResult, SaveStatus};
