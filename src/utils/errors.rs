//! Error types for the trace recorder

use crate::recording::value::ValueKind;
use std::collections::TryReserveError;
use thiserror::Error;

/// Result alias used throughout the crate
pub type Result<T> = std::result::Result<T, TraceError>;

/// Errors raised inside the recorder
///
/// None of these ever cross the recording API: `EventRecorder::record_*`
/// reports them to the diagnostics sink instead.
#[derive(Debug, Error)]
pub enum TraceError {
    /// Growing or creating a buffer failed to reserve memory
    #[error("allocation failed while reserving {requested} slots: {source}")]
    AllocationFailed {
        requested: usize,
        #[source]
        source: TryReserveError,
    },

    /// A site received a value of a different kind than it was created with
    #[error("site buffer holds {expected:?} values, got {actual:?}")]
    KindMismatch { expected: ValueKind, actual: ValueKind },

    #[error("trace I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization failed: {0}")]
    SerializationFailed(String),

    #[error("trace storage failed: {0}")]
    StorageFailed(String),

    #[error("compression failed: {0}")]
    CompressionFailed(String),

    #[error("invalid configuration: {0}")]
    Config(String),

    /// The recorder was closed or degraded
    #[error("recorder is closed")]
    Closed,
}

impl From<serde_json::Error> for TraceError {
    fn from(e: serde_json::Error) -> Self {
        TraceError::SerializationFailed(e.to_string())
    }
}

impl From<config::ConfigError> for TraceError {
    fn from(e: config::ConfigError) -> Self {
        TraceError::Config(e.to_string())
    }
}

impl TraceError {
    /// True for the out-of-memory condition that degrades the registry
    pub fn is_allocation_failure(&self) -> bool {
        matches!(self, TraceError::AllocationFailed { .. })
    }
}
