//! Error types for director and worker operations.
//!
//! - `DirectorError`: tick-level failures (store, prepare hook, pool growth)
//! - `WorkerError`: failures of a worker's `work()` call as a whole
//! - `ExtensionError`: lookups and calls on an extension set
//!
//! Store and configuration errors live next to their modules
//! (`store::StoreError`, `scheduler::ConfigError`).

use thiserror::Error;

use crate::scheduler::ConfigError;
use crate::store::StoreError;

/// Errors that abort a director tick or lifecycle call.
#[derive(Debug, Error)]
pub enum DirectorError {
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Prepare queue hook failed: {0}")]
    Prepare(String),

    #[error("Trying to reassign existing worker with id {0}")]
    WorkerIdConflict(u32),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Director is already running")]
    AlreadyRunning,
}

/// Errors returned by `Worker::work`.
#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("Worker {0} is already busy")]
    Busy(u32),
}

/// Errors that can occur when using an extension set.
#[derive(Debug, Error)]
pub enum ExtensionError {
    #[error("Unknown extension method '{0}'")]
    UnknownMethod(String),

    #[error("Extension method '{name}' failed: {message}")]
    MethodFailed { name: String, message: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_director_error_display() {
        let err = DirectorError::from(StoreError::NotConnected);
        assert!(err.to_string().contains("not connected"));

        let err = DirectorError::WorkerIdConflict(3);
        assert!(err.to_string().contains("id 3"));

        let err = DirectorError::Prepare("boom".to_string());
        assert!(err.to_string().contains("boom"));
    }

    #[test]
    fn test_worker_error_display() {
        assert!(WorkerError::Busy(7).to_string().contains("Worker 7"));
    }

    #[test]
    fn test_extension_error_display() {
        let err = ExtensionError::UnknownMethod("count_good".to_string());
        assert!(err.to_string().contains("count_good"));
    }
}
