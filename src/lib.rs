//! Latest-event trace recorder
//!
//! An in-process recorder for execution tracers: instrumented code reports
//! every event (field write, array access, method entry, ...) to a per-site
//! buffer that keeps only the most recent occurrences, while an adaptive
//! controller holds the total number of retained events under a global
//! budget by trimming the heaviest sites first.
//!
//! # Architecture
//!
//! The crate is structured into a few modules:
//!
//! - **recording**: buffers, registry, budget controller, serialization
//! - **observability**: tracing setup, diagnostics sink, metrics
//! - **utils**: errors and configuration
//!
//! # Example
//!
//! ```no_run
//! use latest_trace::{EventRecorder, TracerConfig};
//!
//! let recorder = EventRecorder::new(TracerConfig::from_agent_args("size=64,trim=8")?)?;
//! recorder.record_int(0, 42);
//! recorder.close()?;
//! # Ok::<(), latest_trace::TraceError>(())
//! ```

// Public module exports
pub mod observability;
pub mod recording;
pub mod utils;

// Re-export commonly used types
pub use observability::{init_tracing, DiagnosticsSink, MemorySink, TracingSink};
pub use recording::recorder::{global, install_global};
pub use recording::{
    EventRecorder, PeriodicSaver, RecorderStats, RetentionPolicy, SiteInfo, Value, ValueKind,
};
pub use utils::config::TracerConfig;
pub use utils::errors::{Result, TraceError};

// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
