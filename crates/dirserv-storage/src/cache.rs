//! The in-memory entry cache.
//!
//! One slot per entry, keyed by normalized DN. Each slot carries its own
//! reader/writer lock; a modify holds the writer side for the whole attempt,
//! releases it across retry backoff, and swaps the new image in at commit
//! time. Slots cache the last committed image so repeated operations on the
//! same entry skip the store read.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};

use dirserv_core::entry::Entry;

use crate::error::{Result, StorageError};

/// A cache slot: the last committed image of one entry, or `None` when the
/// entry has not been loaded yet.
pub type CacheSlot = RwLock<Option<Entry>>;

/// Per-entry cache with single-writer-many-reader locking.
#[derive(Default)]
pub struct EntryCache {
    slots: Mutex<HashMap<String, Arc<CacheSlot>>>,
}

impl EntryCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the slot for `ndn`, creating an empty one if needed.
    ///
    /// The caller takes the slot's write lock to pin the entry for a modify;
    /// dropping the guard releases it.
    pub fn slot(&self, ndn: &str) -> Result<Arc<CacheSlot>> {
        let mut slots = self
            .slots
            .lock()
            .map_err(|e| StorageError::Internal(format!("cache mutex poisoned: {e}")))?;
        Ok(Arc::clone(
            slots.entry(ndn.to_owned()).or_insert_with(Default::default),
        ))
    }

    /// Drops the cached image for `ndn`, if any.
    pub fn evict(&self, ndn: &str) -> Result<()> {
        let mut slots = self
            .slots
            .lock()
            .map_err(|e| StorageError::Internal(format!("cache mutex poisoned: {e}")))?;
        slots.remove(ndn);
        Ok(())
    }
}
