//! Event recorder facade
//!
//! The entry point instrumented code calls into. One `record_*` method per
//! scalar kind, the array conventions built on top of them, and the
//! save/close lifecycle that turns the registry into trace artifacts.
//!
//! ```text
//! record_int(site, v) ─→ BufferRegistry::record ─→ SiteBuffer (latest events)
//!                                                        │
//! save(reset) / close() ─→ collect_rows ─→ Exporter ─→ TraceStorage
//! ```
//!
//! The `record_*` methods return nothing and never panic in release builds;
//! every failure is routed to the [`DiagnosticsSink`].

use crate::observability::{metrics, DiagnosticsSink, TracingSink};
use crate::recording::budget::BudgetStats;
use crate::recording::catalog::{SiteCatalog, SiteInfo};
use crate::recording::clock::{thread_id, SequenceClock};
use crate::recording::exporter::{collect_rows, Exporter};
use crate::recording::registry::{BufferRegistry, SharedBuffer};
use crate::recording::retention::{ObjectInterner, RetentionPolicy, SequentialInterner};
use crate::recording::storage::{StorageConfig, StorageStats, TraceStorage};
use crate::recording::value::{ObjectRef, Value};
use crate::utils::config::TracerConfig;
use crate::utils::errors::{Result, TraceError};
use once_cell::sync::OnceCell;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info};

static GLOBAL: OnceCell<Arc<EventRecorder>> = OnceCell::new();

/// Install the process-wide recorder; fails if one is already installed
pub fn install_global(recorder: Arc<EventRecorder>) -> Result<()> {
    GLOBAL
        .set(recorder)
        .map_err(|_| TraceError::Config("a global recorder is already installed".to_string()))
}

/// The process-wide recorder, if installed
pub fn global() -> Option<&'static Arc<EventRecorder>> {
    GLOBAL.get()
}

/// Builder for [`EventRecorder`]
pub struct EventRecorderBuilder {
    config: TracerConfig,
    clock: Option<Arc<SequenceClock>>,
    diagnostics: Option<Arc<dyn DiagnosticsSink>>,
    interner: Option<Arc<dyn ObjectInterner>>,
}

impl EventRecorderBuilder {
    /// Sequence clock to stamp events with; defaults to the process clock
    pub fn clock(mut self, clock: Arc<SequenceClock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Diagnostics receiver; defaults to [`TracingSink`]
    pub fn diagnostics(mut self, sink: Arc<dyn DiagnosticsSink>) -> Self {
        self.diagnostics = Some(sink);
        self
    }

    /// Interner used in `Id` retention mode; defaults to [`SequentialInterner`]
    pub fn interner(mut self, interner: Arc<dyn ObjectInterner>) -> Self {
        self.interner = Some(interner);
        self
    }

    pub fn build(self) -> Result<EventRecorder> {
        self.config.validate()?;

        let config = self.config;
        let clock = self.clock.unwrap_or_else(SequenceClock::global);
        let diagnostics = self
            .diagnostics
            .unwrap_or_else(|| Arc::new(TracingSink) as Arc<dyn DiagnosticsSink>);
        let interner = match config.retention {
            RetentionPolicy::Id => Some(
                self.interner
                    .unwrap_or_else(|| Arc::new(SequentialInterner::new()) as Arc<dyn ObjectInterner>),
            ),
            RetentionPolicy::Strong | RetentionPolicy::Weak => None,
        };

        let storage = TraceStorage::new(StorageConfig {
            trace_file: config.trace_file_path(),
            compression: config.compression(),
        });

        info!(
            format = ?config.format,
            trace_file = ?storage.final_artifact(),
            "Initializing event recorder"
        );

        Ok(EventRecorder {
            registry: BufferRegistry::new(
                config.registry_config(),
                clock,
                Arc::clone(&diagnostics),
            ),
            catalog: SiteCatalog::new(),
            exporter: Exporter::new(config.format, config.buffer_size),
            storage,
            interner,
            diagnostics,
            save_lock: Mutex::new(()),
            counters: Counters::default(),
            config,
        })
    }
}

#[derive(Default)]
struct Counters {
    events_recorded: AtomicU64,
    saves: AtomicU64,
    save_failures: AtomicU64,
    total_save_time_ms: AtomicU64,
}

/// Latest-event trace recorder
pub struct EventRecorder {
    config: TracerConfig,
    registry: BufferRegistry,
    catalog: SiteCatalog,
    exporter: Exporter,
    storage: TraceStorage,
    interner: Option<Arc<dyn ObjectInterner>>,
    diagnostics: Arc<dyn DiagnosticsSink>,
    /// Serializes saves and close
    save_lock: Mutex<()>,
    counters: Counters,
}

impl EventRecorder {
    /// Create a recorder with the default clock, sink and interner
    pub fn new(config: TracerConfig) -> Result<Self> {
        Self::builder(config).build()
    }

    pub fn builder(config: TracerConfig) -> EventRecorderBuilder {
        EventRecorderBuilder {
            config,
            clock: None,
            diagnostics: None,
            interner: None,
        }
    }

    pub fn config(&self) -> &TracerConfig {
        &self.config
    }

    pub fn registry(&self) -> &BufferRegistry {
        &self.registry
    }

    pub fn catalog(&self) -> &SiteCatalog {
        &self.catalog
    }

    /// Register site metadata produced by the instrumentation layer
    pub fn on_created(&self, sites: impl IntoIterator<Item = SiteInfo>) {
        self.catalog.on_created(sites);
    }

    /// Record one event with an explicit thread id
    pub fn record_value(&self, site: usize, value: Value, thread: u32) {
        if self.registry.is_closed() || self.registry.is_degraded() {
            return;
        }
        self.counters.events_recorded.fetch_add(1, Ordering::Relaxed);
        self.registry.record(site, value, thread);
    }

    #[inline]
    fn record(&self, site: usize, value: Value) {
        self.record_value(site, value, thread_id::current());
    }

    pub fn record_bool(&self, site: usize, value: bool) {
        self.record(site, Value::Boolean(value));
    }

    pub fn record_byte(&self, site: usize, value: i8) {
        self.record(site, Value::Byte(value));
    }

    /// `value` is a UTF-16 code unit
    pub fn record_char(&self, site: usize, value: u16) {
        self.record(site, Value::Char(value));
    }

    pub fn record_short(&self, site: usize, value: i16) {
        self.record(site, Value::Short(value));
    }

    pub fn record_int(&self, site: usize, value: i32) {
        self.record(site, Value::Int(value));
    }

    pub fn record_long(&self, site: usize, value: i64) {
        self.record(site, Value::Long(value));
    }

    pub fn record_float(&self, site: usize, value: f32) {
        self.record(site, Value::Float(value));
    }

    pub fn record_double(&self, site: usize, value: f64) {
        self.record(site, Value::Double(value));
    }

    /// Record an object according to the retention policy
    pub fn record_object(&self, site: usize, value: Option<&ObjectRef>) {
        let value = match &self.interner {
            Some(interner) => Value::ObjectId(interner.intern(value)),
            None => Value::Object(value.cloned()),
        };
        self.record(site, value);
    }

    /// Record an event that carries no value
    pub fn record_void(&self, site: usize) {
        self.record(site, Value::Int(0));
    }

    /// Array read: the array at `site`, the index at `site + 1`
    pub fn record_array_load(&self, array: Option<&ObjectRef>, index: i32, site: usize) {
        self.record_object(site, array);
        self.record_int(site + 1, index);
    }

    /// Array write: the array at `site`, the index at `site + 1`, the stored
    /// value at `site + 2`
    pub fn record_array_store(&self, array: Option<&ObjectRef>, index: i32, value: Value, site: usize) {
        self.record_object(site, array);
        self.record_int(site + 1, index);
        match value {
            Value::Object(obj) => self.record_object(site + 2, obj.as_ref()),
            other => self.record(site + 2, other),
        }
    }

    /// Multi-dimensional array creation
    ///
    /// The outer array is recorded at `site`. The nested arrays are then
    /// walked breadth first: every array scanned is recorded at `site + 1`
    /// and every non-null array element found in it at `site + 2`. An element
    /// is scanned in turn when its element type is an array, even if it is
    /// empty or holds only nulls.
    pub fn record_multi_new_array(&self, array: &ObjectRef, site: usize) {
        self.record_object(site, Some(array));

        let mut pending = VecDeque::from([Arc::clone(array)]);
        while let Some(current) = pending.pop_front() {
            self.record_object(site + 1, Some(&current));
            let Some(elements) = current.array_elements() else {
                continue;
            };

            for element in elements.into_iter().flatten() {
                if element.array_elements().is_none() {
                    continue;
                }
                self.record_object(site + 2, Some(&element));
                if element.element_is_array() {
                    pending.push_back(element);
                }
            }
        }
    }

    /// Write the current buffers to the next numbered artifact
    ///
    /// With `reset` the buffers are swapped out before the write, so later
    /// events go to the next artifact. Failures are also reported to the
    /// diagnostics sink; on failure the swapped-out buffers are restored with
    /// anything recorded meanwhile merged in.
    pub fn save(&self, reset: bool) -> Result<PathBuf> {
        let _guard = self.save_lock.lock();
        if self.registry.is_closed() {
            return Err(TraceError::Closed);
        }

        let path = self.storage.next_artifact();
        if !reset {
            self.write_snapshot(&path, self.registry.snapshot())?;
            return Ok(path);
        }

        // Detach first so events recorded during the write reach the next save
        let detached = self.registry.reset_all();
        match self.write_snapshot(&path, detached.snapshot()) {
            Ok(()) => Ok(path),
            Err(e) => {
                self.registry.restore(detached);
                Err(e)
            }
        }
    }

    /// Write the final trace and stop recording
    ///
    /// Later `record_*` calls are no-ops. Closing twice is harmless.
    pub fn close(&self) -> Result<PathBuf> {
        let _guard = self.save_lock.lock();
        let path = self.storage.final_artifact().to_path_buf();
        if self.registry.is_closed() {
            return Ok(path);
        }
        self.registry.close();

        let written = self.write_snapshot(&path, self.registry.snapshot());

        let stats = self.stats();
        if self.config.show_buffer_size {
            self.diagnostics.log(&stats.summary());
        }
        info!(
            events = stats.events_recorded,
            saves = stats.saves,
            ceiling = stats.max_buffer_size,
            "Event recorder closed"
        );

        written.map(|_| path)
    }

    pub fn is_closed(&self) -> bool {
        self.registry.is_closed()
    }

    fn write_snapshot(&self, path: &Path, snapshot: Vec<(usize, SharedBuffer)>) -> Result<()> {
        let start = Instant::now();

        let written = self.render_to(path, snapshot);
        if let Some(interner) = &self.interner {
            interner.purge();
        }
        let elapsed = start.elapsed();
        match written {
            Ok(bytes) => {
                self.counters.saves.fetch_add(1, Ordering::Relaxed);
                self.counters
                    .total_save_time_ms
                    .fetch_add(elapsed.as_millis() as u64, Ordering::Relaxed);
                metrics::record_save(elapsed);
                metrics::record_events_total(self.counters.events_recorded.load(Ordering::Relaxed));
                debug!(?path, bytes, "Saved trace");
                self.diagnostics
                    .log(&format!("{}ms used to save a trace", elapsed.as_millis()));
                Ok(())
            }
            Err(e) => {
                self.counters.save_failures.fetch_add(1, Ordering::Relaxed);
                error!(?path, error = %e, "Failed to save trace");
                self.diagnostics.error(&e);
                Err(e)
            }
        }
    }

    fn render_to(&self, path: &Path, snapshot: Vec<(usize, SharedBuffer)>) -> Result<u64> {
        let rows = collect_rows(&self.catalog, snapshot);
        let rendered = self.exporter.export_to_vec(&rows)?;
        self.storage.write(path, rendered)
    }

    /// Get recorder statistics
    pub fn stats(&self) -> RecorderStats {
        RecorderStats {
            events_recorded: self.counters.events_recorded.load(Ordering::Relaxed),
            events_retained: self.registry.total_retained(),
            max_buffer_size: self.registry.ceiling(),
            saves: self.counters.saves.load(Ordering::Relaxed),
            save_failures: self.counters.save_failures.load(Ordering::Relaxed),
            total_save_time_ms: self.counters.total_save_time_ms.load(Ordering::Relaxed),
            degraded: self.registry.is_degraded(),
            budget: self.registry.budget_stats(),
            storage: self.storage.stats(),
        }
    }
}

impl std::fmt::Debug for EventRecorder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventRecorder")
            .field("config", &self.config)
            .field("registry", &self.registry)
            .finish()
    }
}

/// Recorder statistics
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RecorderStats {
    pub events_recorded: u64,
    pub events_retained: usize,
    /// Current shared per-site ceiling
    pub max_buffer_size: usize,
    pub saves: u64,
    pub save_failures: u64,
    pub total_save_time_ms: u64,
    pub degraded: bool,
    pub budget: BudgetStats,
    pub storage: StorageStats,
}

impl RecorderStats {
    pub fn avg_save_time_ms(&self) -> u64 {
        if self.saves == 0 {
            0
        } else {
            self.total_save_time_ms / self.saves
        }
    }

    /// One-line summary logged on close with `show_buffer_size`
    pub fn summary(&self) -> String {
        format!(
            "Final maxBufferSize: {}, eventCount: {}, decre_buffer: {}, trim_count: {}, add_data_count: {}",
            self.max_buffer_size,
            self.events_retained,
            self.budget.ceiling_decrements,
            self.budget.trims,
            self.events_recorded
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::observability::MemorySink;
    use crate::recording::exporter::ExportFormat;
    use crate::recording::value::{TracedObject, ValueKind};
    use tempfile::tempdir;

    fn recorder_in(dir: &Path, config: TracerConfig) -> (EventRecorder, MemorySink) {
        let sink = MemorySink::new();
        let recorder = EventRecorder::builder(TracerConfig {
            output_dir: Some(dir.to_path_buf()),
            ..config
        })
        .clock(Arc::new(SequenceClock::new()))
        .diagnostics(Arc::new(sink.clone()))
        .build()
        .unwrap();
        (recorder, sink)
    }

    fn sizes(recorder: &EventRecorder) -> Vec<(usize, usize)> {
        recorder
            .registry()
            .snapshot()
            .into_iter()
            .map(|(site, b)| (site, b.lock().size()))
            .collect()
    }

    struct Array {
        elements: Vec<Option<ObjectRef>>,
        nested: bool,
    }

    impl TracedObject for Array {
        fn type_name(&self) -> &str {
            "Object[]"
        }

        fn array_elements(&self) -> Option<Vec<Option<ObjectRef>>> {
            Some(self.elements.clone())
        }

        fn element_is_array(&self) -> bool {
            self.nested
        }
    }

    /// Array whose elements are not arrays
    fn flat(elements: Vec<Option<ObjectRef>>) -> ObjectRef {
        Arc::new(Array {
            elements,
            nested: false,
        })
    }

    /// Array whose element type is an array type
    fn nested(elements: Vec<Option<ObjectRef>>) -> ObjectRef {
        Arc::new(Array {
            elements,
            nested: true,
        })
    }

    #[test]
    fn test_builder_rejects_invalid_config() {
        let result = EventRecorder::builder(TracerConfig {
            buffer_size: 1,
            ..Default::default()
        })
        .build();
        assert!(matches!(result, Err(TraceError::Config(_))));
    }

    #[test]
    fn test_record_each_kind() {
        let dir = tempdir().unwrap();
        let (recorder, _) = recorder_in(dir.path(), TracerConfig::default());

        recorder.record_bool(0, true);
        recorder.record_byte(1, -3);
        recorder.record_char(2, 'x' as u16);
        recorder.record_short(3, 300);
        recorder.record_int(4, 7);
        recorder.record_long(5, 1 << 40);
        recorder.record_float(6, 1.5);
        recorder.record_double(7, 2.25);
        recorder.record_object(8, Some(&(Arc::new("s".to_string()) as ObjectRef)));
        recorder.record_void(9);

        let kinds: Vec<_> = recorder
            .registry()
            .snapshot()
            .into_iter()
            .map(|(_, b)| b.lock().kind())
            .collect();
        assert_eq!(
            kinds,
            vec![
                ValueKind::Boolean,
                ValueKind::Byte,
                ValueKind::Char,
                ValueKind::Short,
                ValueKind::Int,
                ValueKind::Long,
                ValueKind::Float,
                ValueKind::Double,
                ValueKind::Object,
                ValueKind::Int,
            ]
        );
        assert_eq!(recorder.stats().events_recorded, 10);
    }

    #[test]
    fn test_array_conventions_use_consecutive_sites() {
        let dir = tempdir().unwrap();
        let (recorder, _) = recorder_in(dir.path(), TracerConfig::default());
        let array = flat(vec![None, None]);

        recorder.record_array_load(Some(&array), 1, 10);
        recorder.record_array_store(Some(&array), 0, Value::Long(9), 20);

        assert_eq!(sizes(&recorder), vec![(10, 1), (11, 1), (20, 1), (21, 1), (22, 1)]);
        let stored = recorder.registry().get_or_create(22, ValueKind::Long).unwrap();
        assert_eq!(stored.lock().get(0), Some(Value::Long(9)));
    }

    #[test]
    fn test_multi_new_array_walks_nested_arrays() {
        let dir = tempdir().unwrap();
        let (recorder, _) = recorder_in(dir.path(), TracerConfig::default());

        // new int[2][3][4]: the outer array holds 2 arrays of 3 leaf arrays
        let leaf = || Some(flat(vec![None; 4]));
        let middle = || Some(nested(vec![leaf(), leaf(), leaf()]));
        let outer = nested(vec![middle(), middle()]);

        recorder.record_multi_new_array(&outer, 0);

        // site 1: outer + both middles scanned; site 2: 2 middles + 6 leaves
        assert_eq!(sizes(&recorder), vec![(0, 1), (1, 3), (2, 8)]);
    }

    #[test]
    fn test_multi_new_array_scans_empty_intermediate_dimension() {
        let dir = tempdir().unwrap();
        let (recorder, _) = recorder_in(dir.path(), TracerConfig::default());

        // new int[2][0][5]: the middle arrays have no elements
        let outer = nested(vec![Some(nested(Vec::new())), Some(nested(Vec::new()))]);
        recorder.record_multi_new_array(&outer, 0);

        assert_eq!(sizes(&recorder), vec![(0, 1), (1, 3), (2, 2)]);
    }

    #[test]
    fn test_multi_new_array_scans_null_filled_intermediate_dimension() {
        let dir = tempdir().unwrap();
        let (recorder, _) = recorder_in(dir.path(), TracerConfig::default());

        // new Object[2][3][]: the last dimension is left null
        let middle = || Some(nested(vec![None, None, None]));
        let outer = nested(vec![middle(), None, middle()]);
        recorder.record_multi_new_array(&outer, 0);

        assert_eq!(sizes(&recorder), vec![(0, 1), (1, 3), (2, 2)]);
    }

    #[test]
    fn test_id_retention_stores_object_ids() {
        let dir = tempdir().unwrap();
        let (recorder, _) = recorder_in(
            dir.path(),
            TracerConfig {
                retention: RetentionPolicy::Id,
                ..Default::default()
            },
        );
        let text: ObjectRef = Arc::new("hello".to_string());

        recorder.record_object(0, Some(&text));
        recorder.record_object(0, Some(&text));
        recorder.record_object(0, None);

        let buffer = recorder.registry().get_or_create(0, ValueKind::ObjectId).unwrap();
        let buffer = buffer.lock();
        assert_eq!(buffer.kind(), ValueKind::ObjectId);
        match (buffer.get(0), buffer.get(1), buffer.get(2)) {
            (Some(Value::ObjectId(a)), Some(Value::ObjectId(b)), Some(Value::ObjectId(n))) => {
                assert_eq!(a.id, b.id);
                assert_eq!(a.content.as_deref(), Some("hello"));
                assert_eq!(n.id, 0);
            }
            other => panic!("unexpected values {:?}", other),
        }
    }

    #[test]
    fn test_id_retention_forgets_dropped_objects() {
        let dir = tempdir().unwrap();
        let interner = Arc::new(SequentialInterner::new());
        let recorder = EventRecorder::builder(TracerConfig {
            output_dir: Some(dir.path().to_path_buf()),
            retention: RetentionPolicy::Id,
            buffer_size: 4,
            ..Default::default()
        })
        .clock(Arc::new(SequenceClock::new()))
        .diagnostics(Arc::new(MemorySink::new()))
        .interner(Arc::clone(&interner) as Arc<dyn ObjectInterner>)
        .build()
        .unwrap();

        for i in 0..100_000 {
            let temp: ObjectRef = Arc::new(format!("temp-{}", i));
            recorder.record_object(0, Some(&temp));
        }

        assert_eq!(recorder.registry().total_retained(), 4);
        assert!(interner.len() <= 2048, "interner entries: {}", interner.len());

        recorder.save(false).unwrap();
        assert!(interner.is_empty());
    }

    #[test]
    fn test_save_writes_numbered_artifacts_and_resets() {
        let dir = tempdir().unwrap();
        let (recorder, sink) = recorder_in(dir.path(), TracerConfig::default());
        recorder.on_created(vec![SiteInfo::new(0, "Foo", "run", "LOCAL_STORE", ValueKind::Int)]);

        recorder.record_int(0, 1);
        let first = recorder.save(false).unwrap();
        assert_eq!(first, dir.path().join("trace00001.json"));
        assert!(recorder.registry().is_recorded(0));

        recorder.record_int(0, 2);
        let second = recorder.save(true).unwrap();
        assert_eq!(second, dir.path().join("trace00002.json"));
        assert!(!recorder.registry().is_recorded(0));

        let doc: serde_json::Value =
            serde_json::from_slice(&std::fs::read(&second).unwrap()).unwrap();
        assert_eq!(doc["events"][0]["value"], serde_json::json!([1, 2]));

        assert_eq!(recorder.stats().saves, 2);
        assert!(sink.messages().iter().all(|m| m.ends_with("ms used to save a trace")));
    }

    #[test]
    fn test_close_writes_final_trace_and_stops_recording() {
        let dir = tempdir().unwrap();
        let (recorder, sink) = recorder_in(
            dir.path(),
            TracerConfig {
                format: ExportFormat::Text,
                show_buffer_size: true,
                ..Default::default()
            },
        );
        recorder.record_int(3, 42);

        let path = recorder.close().unwrap();
        assert_eq!(path, dir.path().join("trace.txt"));
        assert!(recorder.is_closed());

        recorder.record_int(3, 43);
        assert_eq!(recorder.stats().events_recorded, 1);
        assert!(matches!(recorder.save(false), Err(TraceError::Closed)));
        assert_eq!(recorder.close().unwrap(), path);

        let text = std::fs::read_to_string(&path).unwrap();
        assert_eq!(text.lines().count(), 2);
        assert!(sink.messages().iter().any(|m| m.starts_with("Final maxBufferSize: 32")));
    }

    #[test]
    fn test_failed_save_keeps_buffers() {
        let dir = tempdir().unwrap();
        let blocker = dir.path().join("blocker");
        std::fs::write(&blocker, b"").unwrap();
        let (recorder, sink) = recorder_in(
            dir.path(),
            TracerConfig {
                trace_file: Some(blocker.join("trace.json")),
                ..Default::default()
            },
        );

        recorder.record_int(0, 1);
        assert!(recorder.save(true).is_err());
        assert!(recorder.registry().is_recorded(0));
        assert_eq!(sink.errors().len(), 1);
        assert_eq!(recorder.stats().save_failures, 1);

        recorder.record_int(0, 2);
        assert_eq!(recorder.registry().total_retained(), 2);
    }
}
