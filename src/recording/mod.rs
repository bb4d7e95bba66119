//! Latest-event recording
//!
//! This module keeps the most recent occurrences of every instrumented event
//! site under one process-wide event budget:
//!
//! - **SequenceClock**: total order across threads
//! - **SiteBuffer**: growable-then-ring buffer per site
//! - **BufferRegistry**: site-indexed arena, lazy creation, degraded mode
//! - **BudgetController**: shaves the heaviest buffers when over budget
//! - **Exporter / TraceStorage**: CSV or JSON artifacts, optionally zstd
//! - **EventRecorder**: the facade instrumented code calls
//!
//! # Architecture
//!
//! ```text
//! record_*(site) → BufferRegistry → SiteBuffer ──(over budget)──→ BudgetController
//!                                        ↓
//!                     save()/close() → Exporter → TraceStorage → trace00001.json
//!                                        ↑
//!                          PeriodicSaver (tokio interval)
//! ```

pub mod budget;
pub mod catalog;
pub mod clock;
pub mod compressor;
pub mod exporter;
pub mod recorder;
pub mod registry;
pub mod retention;
pub mod saver;
pub mod site_buffer;
pub mod storage;
pub mod value;

// Re-export commonly used types
pub use budget::{BudgetController, BudgetStats, TieBreak};
pub use catalog::{SiteCatalog, SiteInfo};
pub use clock::SequenceClock;
pub use compressor::{CompressionLevel, Compressor};
pub use exporter::{ExportFormat, Exporter};
pub use recorder::{EventRecorder, EventRecorderBuilder, RecorderStats};
pub use registry::{BufferRegistry, DetachedBuffers, RegistryConfig, SharedBuffer};
pub use retention::{ObjectInterner, RetentionPolicy, SequentialInterner};
pub use saver::PeriodicSaver;
pub use site_buffer::SiteBuffer;
pub use storage::{FileNameGenerator, TraceStorage};
pub use value::{ObjectId, ObjectRef, TracedObject, Value, ValueKind};
