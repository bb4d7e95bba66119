//! Object retention strategies
//!
//! Chosen once per session and applied to every object-typed site:
//!
//! - **Strong**: the buffer owns an `Arc` to the object (keeps it alive)
//! - **Weak**: the buffer holds a `Weak`; collected objects render as `<GC>`
//! - **Id**: only an interned [`ObjectId`] is stored, no reference at all

use crate::recording::value::{identity_of, ObjectId, ObjectRef, ObjectSlot, TracedObject};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use tracing::debug;

/// Rendering of a weak slot whose referent was dropped
pub const COLLECTED_SENTINEL: &str = "<GC>";

/// How object-typed values are held by site buffers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RetentionPolicy {
    #[default]
    Strong,
    Weak,
    Id,
}

impl RetentionPolicy {
    /// Parse the `keepobj=` agent option
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "true" | "strong" => Some(RetentionPolicy::Strong),
            "false" | "weak" => Some(RetentionPolicy::Weak),
            "id" => Some(RetentionPolicy::Id),
            _ => None,
        }
    }

    /// Wrap an object reference for storage in a buffer slot
    pub fn hold(&self, value: Option<ObjectRef>) -> ObjectSlot {
        match (self, value) {
            (_, None) => ObjectSlot::Null,
            (RetentionPolicy::Weak, Some(o)) => ObjectSlot::Weak(Arc::downgrade(&o)),
            // Id-mode sites never see raw objects; hold strongly if one slips through
            (_, Some(o)) => ObjectSlot::Strong(o),
        }
    }
}

/// Converts object references into stable integer identities
pub trait ObjectInterner: Send + Sync {
    fn intern(&self, obj: Option<&ObjectRef>) -> ObjectId;

    /// Forget identities of objects that no longer exist
    fn purge(&self) {}
}

/// New entries tolerated between automatic purges, at minimum
const PURGE_FLOOR: usize = 1024;

struct InternEntry {
    referent: Weak<dyn TracedObject>,
    id: u64,
}

/// Default interner handing out ids 1, 2, 3, ... per live object
///
/// Entries are keyed by allocation address and validated through a weak
/// handle, so an address reused after the original object was dropped gets a
/// fresh id. Dead entries are swept once the number of entries added since
/// the last sweep exceeds the live count left by that sweep (at least 1024),
/// which keeps the map within about twice the live objects.
pub struct SequentialInterner {
    ids: DashMap<usize, InternEntry>,
    next_id: AtomicU64,
    added_since_purge: AtomicUsize,
    purge_threshold: AtomicUsize,
}

impl SequentialInterner {
    pub fn new() -> Self {
        Self {
            ids: DashMap::new(),
            next_id: AtomicU64::new(1),
            added_since_purge: AtomicUsize::new(0),
            purge_threshold: AtomicUsize::new(PURGE_FLOOR),
        }
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    fn sweep(&self) {
        let before = self.ids.len();
        self.ids.retain(|_, e| e.referent.strong_count() > 0);
        let live = self.ids.len();
        self.added_since_purge.store(0, Ordering::Relaxed);
        self.purge_threshold.store(live.max(PURGE_FLOOR), Ordering::Relaxed);
        debug!(removed = before.saturating_sub(live), live, "Purged object interner");
    }
}

impl Default for SequentialInterner {
    fn default() -> Self {
        Self::new()
    }
}

impl ObjectInterner for SequentialInterner {
    fn intern(&self, obj: Option<&ObjectRef>) -> ObjectId {
        let Some(obj) = obj else {
            return ObjectId::null();
        };

        let key = identity_of(obj);
        let mut added = false;
        let id = {
            let mut entry = self.ids.entry(key).or_insert_with(|| {
                added = true;
                InternEntry {
                    referent: Arc::downgrade(obj),
                    id: self.next_id.fetch_add(1, Ordering::Relaxed),
                }
            });
            if entry.referent.strong_count() == 0 {
                entry.referent = Arc::downgrade(obj);
                entry.id = self.next_id.fetch_add(1, Ordering::Relaxed);
            }
            entry.id
        };

        // The shard guard is released above; sweeping needs every shard
        if added {
            let pending = self.added_since_purge.fetch_add(1, Ordering::Relaxed) + 1;
            if pending > self.purge_threshold.load(Ordering::Relaxed) {
                self.sweep();
            }
        }

        ObjectId::new(id, obj.type_name(), obj.text_content().map(Arc::from))
    }

    fn purge(&self) {
        self.sweep();
    }
}
