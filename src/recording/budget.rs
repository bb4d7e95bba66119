//! Adaptive trimming under a global event budget
//!
//! When the retained-event total exceeds the budget, the controller lowers the
//! shared per-site ceiling and shaves the largest buffers first, so no single
//! hot site can hold most of the budget while cold sites keep their history.
//!
//! Each pass:
//!
//! 1. `ceiling = max(1, ceiling - eviction_unit)`
//! 2. find every buffer whose size equals the current maximum
//! 3. trim `min(eviction_unit, size)` from each of them, stopping once under budget
//! 4. trim every buffer still above the new ceiling down to it, stopping once under budget
//!
//! Passes repeat until under budget or the ceiling reaches 1.

use crate::recording::registry::SharedBuffer;
use crate::recording::site_buffer::SiteBuffer;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicUsize, Ordering};
use tracing::debug;

/// Order in which equally-heavy buffers are trimmed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TieBreak {
    /// Lowest site id first
    #[default]
    SiteOrder,
    /// Highest site id first
    Reverse,
}

/// Running counters of the controller's work
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BudgetStats {
    /// Times the controller was entered over budget
    pub enforcements: u64,
    /// Times the shared ceiling was lowered
    pub ceiling_decrements: u64,
    /// Individual buffer trims performed
    pub trims: u64,
    /// Events removed by trims
    pub evicted: u64,
}

/// Shared counters the controller works against
pub struct BudgetState<'a> {
    pub retained: &'a AtomicUsize,
    pub ceiling: &'a AtomicUsize,
    pub global_capacity: usize,
}

impl BudgetState<'_> {
    fn over_budget(&self) -> bool {
        self.retained.load(Ordering::Acquire) > self.global_capacity
    }
}

/// The trimming algorithm plus its diagnostics
#[derive(Debug)]
pub struct BudgetController {
    eviction_unit: usize,
    tie_break: TieBreak,
    stats: BudgetStats,
}

impl BudgetController {
    pub fn new(eviction_unit: usize, tie_break: TieBreak) -> Self {
        Self {
            eviction_unit: eviction_unit.max(1),
            tie_break,
            stats: BudgetStats::default(),
        }
    }

    pub fn eviction_unit(&self) -> usize {
        self.eviction_unit
    }

    pub fn stats(&self) -> BudgetStats {
        self.stats
    }

    /// Trim `buffers` until the retained total fits the budget
    ///
    /// `buffers` must be in site order. Buffer locks are taken one at a time;
    /// the retained counter is decremented while the trimmed buffer is still
    /// locked. Returns the number of events evicted.
    pub fn enforce(&mut self, buffers: &[SharedBuffer], state: &BudgetState<'_>) -> usize {
        if !state.over_budget() {
            return 0;
        }

        self.stats.enforcements += 1;
        debug!(
            retained = state.retained.load(Ordering::Relaxed),
            capacity = state.global_capacity,
            "Start trim"
        );

        let mut evicted = 0;
        loop {
            let previous = state.ceiling.load(Ordering::Acquire);
            let ceiling = previous.saturating_sub(self.eviction_unit).max(1);
            if ceiling < previous {
                state.ceiling.store(ceiling, Ordering::Release);
                self.stats.ceiling_decrements += 1;
                debug!(ceiling, "Lowered max buffer size");
            }

            for buffer in self.heaviest(buffers) {
                let mut b = buffer.lock();
                let amount = self.eviction_unit.min(b.size());
                evicted += self.trim(&mut b, amount, state);
                drop(b);

                if !state.over_budget() {
                    debug!(evicted, "End trim");
                    return evicted;
                }
            }

            for buffer in buffers {
                let mut b = buffer.lock();
                if b.size() > ceiling {
                    let amount = b.size() - ceiling;
                    evicted += self.trim(&mut b, amount, state);
                    drop(b);

                    if !state.over_budget() {
                        debug!(evicted, "End trim");
                        return evicted;
                    }
                }
            }

            if ceiling == 1 {
                debug!(
                    retained = state.retained.load(Ordering::Relaxed),
                    "Ceiling at 1, giving up"
                );
                return evicted;
            }
        }
    }

    fn trim(&mut self, buffer: &mut SiteBuffer, amount: usize, state: &BudgetState<'_>) -> usize {
        let removed = buffer.trim_oldest(amount);
        if removed > 0 {
            state.retained.fetch_sub(removed, Ordering::AcqRel);
            self.stats.trims += 1;
            self.stats.evicted += removed as u64;
        }
        removed
    }

    /// Buffers whose size equals the largest non-empty size, in tie-break order
    fn heaviest<'b>(&self, buffers: &'b [SharedBuffer]) -> Vec<&'b SharedBuffer> {
        let mut max_size = 0;
        let mut heaviest = Vec::new();
        for buffer in buffers {
            let size = buffer.lock().size();
            if size == 0 {
                continue;
            }
            if size > max_size {
                max_size = size;
                heaviest.clear();
                heaviest.push(buffer);
            } else if size == max_size {
                heaviest.push(buffer);
            }
        }

        if self.tie_break == TieBreak::Reverse {
            heaviest.reverse();
        }
        heaviest
    }
}
