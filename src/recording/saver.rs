//! Scheduled partial saves
//!
//! Runs on the tokio runtime and hands each save to the blocking pool, so
//! producer threads never pay for trace I/O.

use crate::recording::recorder::EventRecorder;
use crate::utils::config::PartialSaveStrategy;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, error, info};

/// Background task writing a partial trace every interval
pub struct PeriodicSaver {
    shutdown: Arc<Notify>,
    handle: Option<JoinHandle<()>>,
}

impl PeriodicSaver {
    /// Start saving `recorder` every `period`
    ///
    /// Returns `None` for [`PartialSaveStrategy::No`]. Must be called from
    /// within a tokio runtime.
    pub fn start(
        recorder: Arc<EventRecorder>,
        period: Duration,
        strategy: PartialSaveStrategy,
    ) -> Option<Self> {
        if strategy == PartialSaveStrategy::No {
            return None;
        }
        let reset = strategy.resets();

        info!(?period, ?strategy, "Starting periodic trace saver");

        let shutdown = Arc::new(Notify::new());
        let stop = Arc::clone(&shutdown);

        let handle = tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if recorder.is_closed() {
                            debug!("Recorder closed, stopping periodic saver");
                            break;
                        }

                        let target = Arc::clone(&recorder);
                        match tokio::task::spawn_blocking(move || target.save(reset)).await {
                            Ok(Ok(path)) => debug!(?path, "Periodic save complete"),
                            // Already reported to the diagnostics sink
                            Ok(Err(_)) => {}
                            Err(e) => error!("Periodic save task failed: {}", e),
                        }
                    }

                    _ = stop.notified() => break,
                }
            }
        });

        Some(Self {
            shutdown,
            handle: Some(handle),
        })
    }

    /// Start with the recorder's own `partial_save` and `save_interval_ms`
    pub fn from_config(recorder: &Arc<EventRecorder>) -> Option<Self> {
        let config = recorder.config();
        Self::start(
            Arc::clone(recorder),
            Duration::from_millis(config.save_interval_ms),
            config.partial_save,
        )
    }

    /// Stop the task, waiting for an in-flight save to finish
    pub async fn stop(mut self) {
        self.shutdown.notify_one();
        if let Some(handle) = self.handle.take() {
            if let Err(e) = handle.await {
                error!("Periodic saver ended abnormally: {}", e);
            }
        }
    }
}

impl Drop for PeriodicSaver {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recording::clock::SequenceClock;
    use crate::utils::config::TracerConfig;
    use tempfile::tempdir;

    fn recorder(dir: &std::path::Path) -> Arc<EventRecorder> {
        Arc::new(
            EventRecorder::builder(TracerConfig {
                output_dir: Some(dir.to_path_buf()),
                ..Default::default()
            })
            .clock(Arc::new(SequenceClock::new()))
            .build()
            .unwrap(),
        )
    }

    #[tokio::test]
    async fn test_no_strategy_starts_nothing() {
        let dir = tempdir().unwrap();
        let saver = PeriodicSaver::start(
            recorder(dir.path()),
            Duration::from_millis(10),
            PartialSaveStrategy::No,
        );
        assert!(saver.is_none());
    }

    #[tokio::test]
    async fn test_periodic_reset_saves() {
        let dir = tempdir().unwrap();
        let recorder = recorder(dir.path());
        recorder.record_int(0, 1);

        let saver = PeriodicSaver::start(
            Arc::clone(&recorder),
            Duration::from_millis(20),
            PartialSaveStrategy::WriteAndReset,
        )
        .unwrap();

        tokio::time::sleep(Duration::from_millis(150)).await;
        saver.stop().await;

        assert!(dir.path().join("trace00001.json").exists());
        assert!(recorder.stats().saves >= 1);
        assert!(!recorder.registry().is_recorded(0));
    }

    #[tokio::test]
    async fn test_stop_after_close() {
        let dir = tempdir().unwrap();
        let recorder = recorder(dir.path());
        let saver = PeriodicSaver::start(
            Arc::clone(&recorder),
            Duration::from_millis(10),
            PartialSaveStrategy::WriteSnapshot,
        )
        .unwrap();

        recorder.close().unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        saver.stop().await;

        assert!(dir.path().join("trace.json").exists());
        assert_eq!(recorder.stats().save_failures, 0);
    }
}
