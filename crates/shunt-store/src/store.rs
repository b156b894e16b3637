//! MockStore — partitioned in-memory index over loaded mocks.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use tracing::debug;

use shunt_core::mock::Mock;

use crate::error::{StoreError, StoreResult};

/// A snapshot handle to one stored mock.
///
/// The `(id, version)` pair is the identity a compare-and-swap checks
/// against: any successful mutation bumps `version`, so a stale handle
/// can never win a second race.
#[derive(Debug, Clone)]
pub struct MockEntry {
    pub id: u64,
    pub version: u64,
    pub mock: Arc<Mock>,
}

#[derive(Debug)]
struct Slot {
    id: u64,
    version: u64,
    mock: Arc<Mock>,
}

impl Slot {
    fn entry(&self) -> MockEntry {
        MockEntry {
            id: self.id,
            version: self.version,
            mock: Arc::clone(&self.mock),
        }
    }
}

#[derive(Debug, Default)]
struct Partitions {
    filtered: Vec<Slot>,
    unfiltered: Vec<Slot>,
}

/// Process-wide mock store shared by every parser during replay.
#[derive(Debug, Default)]
pub struct MockStore {
    inner: RwLock<Partitions>,
    used: Mutex<HashSet<String>>,
    next_id: AtomicU64,
}

impl MockStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Populate the store from persisted mocks, partitioning on
    /// `test_mode_info.is_filtered` and ordering the filtered partition
    /// by `sort_order`.
    pub fn load(&self, mocks: Vec<Mock>) -> StoreResult<()> {
        let mut inner = self.inner.write().map_err(|_| StoreError::Poisoned)?;
        for mock in mocks {
            let slot = Slot {
                id: self.next_id.fetch_add(1, Ordering::Relaxed),
                version: 0,
                mock: Arc::new(mock),
            };
            if slot.mock.test_mode_info.is_filtered {
                inner.filtered.push(slot);
            } else {
                inner.unfiltered.push(slot);
            }
        }
        inner
            .filtered
            .sort_by_key(|s| s.mock.test_mode_info.sort_order);
        debug!(
            filtered = inner.filtered.len(),
            unfiltered = inner.unfiltered.len(),
            "mock store loaded"
        );
        Ok(())
    }

    /// Snapshot of the filtered partition, ordered by `sort_order`.
    pub fn get_filtered(&self) -> Vec<MockEntry> {
        let inner = self.inner.read().expect("store lock");
        inner.filtered.iter().map(Slot::entry).collect()
    }

    /// Snapshot of the unfiltered partition.
    pub fn get_unfiltered(&self) -> Vec<MockEntry> {
        let inner = self.inner.read().expect("store lock");
        inner.unfiltered.iter().map(Slot::entry).collect()
    }

    /// Consume a filtered mock: remove it from the filtered partition
    /// and move it to unfiltered with `sort_order = i64::MAX`.
    ///
    /// Returns `false` when the entry is no longer present at the seen
    /// version — a concurrent consumer won, and the caller must re-read
    /// and re-match.
    pub fn delete_filtered(&self, entry: &MockEntry) -> bool {
        let mut inner = self.inner.write().expect("store lock");
        let Some(pos) = inner
            .filtered
            .iter()
            .position(|s| s.id == entry.id && s.version == entry.version)
        else {
            return false;
        };
        let slot = inner.filtered.remove(pos);
        let mut consumed = (*slot.mock).clone();
        consumed.test_mode_info.is_filtered = false;
        consumed.test_mode_info.sort_order = i64::MAX;
        inner.unfiltered.push(Slot {
            id: slot.id,
            version: slot.version + 1,
            mock: Arc::new(consumed),
        });
        debug!(id = entry.id, "filtered mock consumed");
        true
    }

    /// Compare-and-swap an entry with a replacement that lands in the
    /// unfiltered partition. The entry may currently live in either
    /// partition; this is the atomic "move across partitions" primitive.
    ///
    /// Returns `false` on version mismatch (concurrent winner).
    pub fn update_unfiltered(&self, prev: &MockEntry, next: Mock) -> bool {
        let mut inner = self.inner.write().expect("store lock");
        let from_filtered = inner
            .filtered
            .iter()
            .position(|s| s.id == prev.id && s.version == prev.version);
        let slot = match from_filtered {
            Some(pos) => inner.filtered.remove(pos),
            None => {
                let Some(pos) = inner
                    .unfiltered
                    .iter()
                    .position(|s| s.id == prev.id && s.version == prev.version)
                else {
                    return false;
                };
                inner.unfiltered.remove(pos)
            }
        };
        inner.unfiltered.push(Slot {
            id: slot.id,
            version: slot.version + 1,
            mock: Arc::new(next),
        });
        debug!(id = prev.id, "mock moved to unfiltered");
        true
    }

    /// Record that a mock has served at least one request.
    pub fn flag_as_used(&self, entry: &MockEntry) -> StoreResult<()> {
        let mut used = self.used.lock().map_err(|_| StoreError::Poisoned)?;
        used.insert(entry.mock.name.clone());
        Ok(())
    }

    /// Names of every mock that served at least one request.
    pub fn used_names(&self) -> Vec<String> {
        let used = self.used.lock().expect("used lock");
        let mut names: Vec<String> = used.iter().cloned().collect();
        names.sort();
        names
    }

    pub fn filtered_len(&self) -> usize {
        self.inner.read().expect("store lock").filtered.len()
    }

    pub fn unfiltered_len(&self) -> usize {
        self.inner.read().expect("store lock").unfiltered.len()
    }
}
