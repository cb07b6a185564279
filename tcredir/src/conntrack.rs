use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use tcredir_common::{CapacityExceeded, ConnTrack, TwoTuple, CONN_TRACK_CAPACITY};

/// Bounded, concurrently accessed client-tuple -> original-server-tuple map.
///
/// Existing keys are overwritten. New keys are admitted only while the
/// occupancy is below `capacity`; past that point inserts are rejected (no
/// eviction) and counted in [`ConnTrackTable::rejected`].
pub struct ConnTrackTable {
    entries: DashMap<TwoTuple, TwoTuple>,
    capacity: usize,
    occupied: AtomicUsize,
    rejected: AtomicU64,
}

impl ConnTrackTable {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: DashMap::with_capacity(capacity),
            capacity,
            occupied: AtomicUsize::new(0),
            rejected: AtomicU64::new(0),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.occupied.load(Ordering::Acquire)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of inserts refused because the table was full.
    pub fn rejected(&self) -> u64 {
        self.rejected.load(Ordering::Relaxed)
    }

    /// Copy of every entry, in no particular order.
    pub fn snapshot(&self) -> Vec<(TwoTuple, TwoTuple)> {
        self.entries
            .iter()
            .map(|entry| (*entry.key(), *entry.value()))
            .collect()
    }

    /// Drops every entry.
    pub fn clear(&self) {
        self.entries.retain(|_, _| {
            self.occupied.fetch_sub(1, Ordering::AcqRel);
            false
        });
    }

    /// Reserves a slot for a new key, failing when the table is full.
    fn admit(&self) -> bool {
        self.occupied
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n < self.capacity).then_some(n + 1)
            })
            .is_ok()
    }
}

impl Default for ConnTrackTable {
    fn default() -> Self {
        Self::new(CONN_TRACK_CAPACITY as usize)
    }
}

impl ConnTrack for ConnTrackTable {
    fn lookup(&self, key: &TwoTuple) -> Option<TwoTuple> {
        self.entries.get(key).map(|entry| *entry.value())
    }

    fn insert(&self, key: TwoTuple, value: TwoTuple) -> Result<(), CapacityExceeded> {
        // The entry guard holds the shard lock, so admission and the write
        // are atomic with respect to other writers of the same key.
        match self.entries.entry(key) {
            Entry::Occupied(mut slot) => {
                slot.insert(value);
                Ok(())
            }
            Entry::Vacant(slot) => {
                if !self.admit() {
                    let rejected = self.rejected.fetch_add(1, Ordering::Relaxed) + 1;
                    tracing::debug!(
                        capacity = self.capacity,
                        rejected,
                        "conn-track table full, insert rejected"
                    );
                    return Err(CapacityExceeded);
                }
                slot.insert(value);
                Ok(())
            }
        }
    }
}
