//! Process-wide event ordering
//!
//! Every recorded event is stamped with a number from a [`SequenceClock`],
//! giving a total order across threads independent of which site buffer the
//! event lands in.

use crossbeam::utils::CachePadded;
use once_cell::sync::Lazy;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

static GLOBAL_CLOCK: Lazy<Arc<SequenceClock>> = Lazy::new(|| Arc::new(SequenceClock::new()));

/// Monotonic sequence number source
#[derive(Debug, Default)]
pub struct SequenceClock {
    next: CachePadded<AtomicU64>,
}

impl SequenceClock {
    pub fn new() -> Self {
        Self::starting_at(0)
    }

    pub fn starting_at(first: u64) -> Self {
        Self {
            next: CachePadded::new(AtomicU64::new(first)),
        }
    }

    /// The clock shared by every recorder in this process
    pub fn global() -> Arc<SequenceClock> {
        Arc::clone(&GLOBAL_CLOCK)
    }

    /// Take the next sequence number
    #[inline]
    pub fn tick(&self) -> u64 {
        self.next.fetch_add(1, Ordering::Relaxed)
    }

    /// Number that the next `tick` will return
    pub fn peek(&self) -> u64 {
        self.next.load(Ordering::Relaxed)
    }
}

/// Small per-thread ids for producers without an external thread id
pub mod thread_id {
    use super::*;

    static NEXT_THREAD_ID: AtomicU32 = AtomicU32::new(0);

    thread_local! {
        static CURRENT: u32 = NEXT_THREAD_ID.fetch_add(1, Ordering::Relaxed);
    }

    /// Id of the calling thread, assigned on first use
    pub fn current() -> u32 {
        CURRENT.with(|id| *id)
    }
}
