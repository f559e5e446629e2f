//! Core error types for Tickwork node operations.
//!
//! All errors are explicit, typed, and recoverable - no panics allowed.

use std::path::PathBuf;

use thiserror::Error;

/// Core error type for node-level operations.
#[derive(Debug, Error)]
pub enum Error {
    // Configuration errors
    #[error("failed to read config '{path}': {reason}")]
    ConfigReadFailed { path: PathBuf, reason: String },

    #[error("invalid configuration: {reason}")]
    ConfigInvalid { reason: String },

    // Subsystem errors
    #[error("job store unavailable: {reason}")]
    StoreUnavailable { reason: String },

    #[error("dispatcher failed: {reason}")]
    DispatcherFailed { reason: String },

    #[error("shutdown failed: {reason}")]
    ShutdownFailed { reason: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Create a config read error.
    pub fn config_read_failed(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Self::ConfigReadFailed {
            path: path.into(),
            reason: reason.into(),
        }
    }

    /// Create an invalid configuration error.
    pub fn config_invalid(reason: impl Into<String>) -> Self {
        Self::ConfigInvalid {
            reason: reason.into(),
        }
    }

    /// Create a store unavailable error.
    pub fn store_unavailable(reason: impl Into<String>) -> Self {
        Self::StoreUnavailable {
            reason: reason.into(),
        }
    }

    /// Create a dispatcher failure.
    pub fn dispatcher_failed(reason: impl Into<String>) -> Self {
        Self::DispatcherFailed {
            reason: reason.into(),
        }
    }

    /// Create a shutdown failure.
    pub fn shutdown_failed(reason: impl Into<String>) -> Self {
        Self::ShutdownFailed {
            reason: reason.into(),
        }
    }
}
