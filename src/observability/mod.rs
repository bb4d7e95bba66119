//! Logging, diagnostics and metrics
//!
//! - **init_tracing**: installs a `tracing-subscriber` with `RUST_LOG` filtering
//! - **DiagnosticsSink**: the side channel that receives allocation-failure
//!   notices, I/O errors and per-save timing
//! - **metrics**: counters emitted through the `metrics` facade

use crate::utils::errors::{Result, TraceError};
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

pub mod metrics;

/// Install the global tracing subscriber
///
/// Honors `RUST_LOG`; defaults to `info`. Set `json` for one JSON object per
/// line.
pub fn init_tracing(json: bool) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(filter);

    let installed = if json {
        registry
            .with(tracing_subscriber::fmt::layer().json())
            .try_init()
    } else {
        registry.with(tracing_subscriber::fmt::layer()).try_init()
    };

    installed.map_err(|e| TraceError::Config(format!("Failed to install subscriber: {}", e)))
}

/// Receiver of recorder diagnostics
pub trait DiagnosticsSink: Send + Sync {
    /// Informational notice (save timing, final statistics)
    fn log(&self, message: &str);

    /// A failure the recorder recovered from
    fn error(&self, err: &TraceError);
}

/// Forwards diagnostics to `tracing`
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl DiagnosticsSink for TracingSink {
    fn log(&self, message: &str) {
        info!(target: "latest_trace::diagnostics", "{}", message);
    }

    fn error(&self, err: &TraceError) {
        error!(target: "latest_trace::diagnostics", "{}", err);
    }
}

/// Collects diagnostics in memory
#[derive(Debug, Default, Clone)]
pub struct MemorySink {
    messages: Arc<Mutex<Vec<String>>>,
    errors: Arc<Mutex<Vec<String>>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn messages(&self) -> Vec<String> {
        self.messages.lock().clone()
    }

    pub fn errors(&self) -> Vec<String> {
        self.errors.lock().clone()
    }
}

impl DiagnosticsSink for MemorySink {
    fn log(&self, message: &str) {
        self.messages.lock().push(message.to_string());
    }

    fn error(&self, err: &TraceError) {
        self.errors.lock().push(err.to_string());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_sink_collects() {
        let sink = MemorySink::new();
        let shared: Arc<dyn DiagnosticsSink> = Arc::new(sink.clone());

        shared.log("12ms used to save a trace");
        shared.error(&TraceError::Closed);

        assert_eq!(sink.messages(), vec!["12ms used to save a trace"]);
        assert_eq!(sink.errors(), vec!["recorder is closed"]);
    }
}
