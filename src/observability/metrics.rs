//! Metric names and emit helpers
//!
//! Nothing is exported unless the host installs a `metrics` recorder.

use metrics::{counter, gauge, histogram};
use std::time::Duration;

pub const EVENTS_RECORDED: &str = "latest_trace_events_recorded_total";
pub const EVENTS_EVICTED: &str = "latest_trace_events_evicted_total";
pub const EVENTS_RETAINED: &str = "latest_trace_events_retained";
pub const MAX_BUFFER_SIZE: &str = "latest_trace_max_buffer_size";
pub const SAVES: &str = "latest_trace_saves_total";
pub const SAVE_DURATION: &str = "latest_trace_save_duration_seconds";
pub const DEGRADED: &str = "latest_trace_degraded_total";

pub(crate) fn record_evicted(events: usize, retained: usize, ceiling: usize) {
    counter!(EVENTS_EVICTED).increment(events as u64);
    gauge!(EVENTS_RETAINED).set(retained as f64);
    gauge!(MAX_BUFFER_SIZE).set(ceiling as f64);
}

pub(crate) fn record_save(elapsed: Duration) {
    counter!(SAVES).increment(1);
    histogram!(SAVE_DURATION).record(elapsed.as_secs_f64());
}

pub(crate) fn record_events_total(total: u64) {
    counter!(EVENTS_RECORDED).absolute(total);
}

pub(crate) fn record_degraded() {
    counter!(DEGRADED).increment(1);
}
