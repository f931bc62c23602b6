//! Fragment-based object cache shared by every transfer.
//!
//! Each [`CacheEntry`] holds an ordered, non-overlapping set of byte-range
//! [`Fragment`]s. Entries live in an MRU ordered index; eviction walks it from
//! the LRU end and never touches an entry that is pinned or being written.

use std::ops::Range;
use std::sync::Arc;

use bytes::Bytes;
use lru::LruCache;
use parking_lot::{Mutex, MutexGuard};
use thiserror::Error;
use tracing::{error, trace};

mod entry;
mod evict;
mod fragment;
mod freshness;
mod key;
mod lease;

use entry::Sequence;

pub use entry::{CacheEntry, Redirect};
pub use evict::{EvictMode, EvictOutcome};
pub use fragment::Fragment;
pub use freshness::{Expiry, Validators};
pub use key::{CacheKey, normalize_url};
pub use lease::{PinGuard, WriterGuard};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("out of memory while growing cache entry")]
    OutOfMemory,
    #[error("no cache entry for '{0}'")]
    UnknownEntry(String),
    #[error("byte range exceeds addressable size")]
    RangeOverflow,
    #[error("cache entry '{0}' is already being written")]
    WriterBusy(String),
}

/// Result of a successful [`ObjectStore::write_range`]. Allocation failure is
/// reported as [`StoreError::OutOfMemory`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    Merged,
    NewFragment,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatsQuery {
    Bytes,
    Entries,
    Pinned,
    Loading,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StoreStats {
    pub bytes: u64,
    pub entries: u64,
    pub pinned: u64,
    pub loading: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntrySummary {
    pub key: String,
    pub length: u64,
    pub bytes: u64,
    pub fragments: usize,
    pub pins: usize,
    pub loading: bool,
    pub incomplete: bool,
}

#[derive(Debug)]
pub struct ObjectStore {
    entries: LruCache<String, CacheEntry>,
    total_size: u64,
    quota: u64,
    gc_percent: u8,
    seq: Sequence,
}

impl ObjectStore {
    pub fn new(quota: u64, gc_percent: u8) -> Self {
        Self {
            entries: LruCache::unbounded(),
            total_size: 0,
            quota,
            gc_percent: gc_percent.clamp(1, 100),
            seq: Sequence::default(),
        }
    }

    pub fn quota(&self) -> u64 {
        self.quota
    }

    /// Size eviction aims for once the quota is exceeded.
    pub fn gc_target(&self) -> u64 {
        self.quota / 100 * u64::from(self.gc_percent)
            + self.quota % 100 * u64::from(self.gc_percent) / 100
    }

    pub fn total_size(&self) -> u64 {
        self.total_size
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Looks an entry up and moves it to the MRU position.
    pub fn find(&mut self, key: &str) -> Option<&mut CacheEntry> {
        self.entries.get_mut(key)
    }

    /// Reads an entry without touching recency.
    pub fn entry(&self, key: &str) -> Option<&CacheEntry> {
        self.entries.peek(key)
    }

    pub fn entry_mut(&mut self, key: &str) -> Option<&mut CacheEntry> {
        self.entries.peek_mut(key)
    }

    pub fn lookup_or_create(&mut self, key: &str) -> Result<&mut CacheEntry, StoreError> {
        if self.entries.contains(key) {
            self.entries.promote(key);
        } else {
            self.evict(EvictMode::QuotaCheck);
            let mut owned = String::new();
            owned
                .try_reserve_exact(key.len())
                .map_err(|_| StoreError::OutOfMemory)?;
            owned.push_str(key);
            trace!(key, "creating cache entry");
            let entry = CacheEntry::new(owned.clone(), &mut self.seq);
            self.entries.push(owned, entry);
        }
        self.entries
            .peek_mut(key)
            .ok_or_else(|| StoreError::UnknownEntry(key.to_string()))
    }

    pub fn write_range(
        &mut self,
        key: &str,
        offset: u64,
        data: &[u8],
    ) -> Result<WriteOutcome, StoreError> {
        self.with_entry(key, |entry, seq| entry.write_range(offset, data, seq))?
    }

    pub fn defragment(&mut self, key: &str) -> Result<(), StoreError> {
        self.with_entry(key, |entry, _| entry.defragment())
    }

    pub fn truncate(&mut self, key: &str, offset: u64, final_size: bool) -> Result<(), StoreError> {
        self.with_entry(key, |entry, seq| entry.truncate(offset, final_size, seq))
    }

    pub fn trim_front(&mut self, key: &str, offset: u64) -> Result<(), StoreError> {
        self.with_entry(key, |entry, seq| entry.trim_front(offset, seq))
    }

    /// Drops content and validators while keeping the entry and its holds.
    pub fn invalidate(&mut self, key: &str) -> Result<(), StoreError> {
        self.with_entry(key, |entry, seq| entry.clear_content(seq))
    }

    /// Deletes an entry. Refuses, loudly, to delete one that is still held.
    pub fn remove(&mut self, key: &str) -> bool {
        let Some(entry) = self.entries.peek(key) else {
            return false;
        };
        if entry.is_held() {
            error!(
                key,
                pins = entry.pin_count(),
                loading = entry.is_loading(),
                "refusing to remove a cache entry that is still in use"
            );
            return false;
        }
        self.delete(key);
        true
    }

    pub fn pin(&mut self, key: &str) -> Option<PinGuard> {
        self.entries.peek(key).map(|entry| entry.holds.pin(key))
    }

    pub fn claim_writer(&mut self, key: &str) -> Result<WriterGuard, StoreError> {
        let entry = self
            .entries
            .peek(key)
            .ok_or_else(|| StoreError::UnknownEntry(key.to_string()))?;
        entry
            .holds
            .claim_writer(key)
            .ok_or_else(|| StoreError::WriterBusy(key.to_string()))
    }

    /// Returns the contiguous bytes available from offset 0.
    pub fn read_available(&mut self, key: &str) -> Option<(Bytes, Range<u64>)> {
        self.with_entry(key, |entry, _| entry.defragment()).ok()?;
        let entry = self.entries.peek(key)?;
        match entry.fragments().first() {
            Some(first) if first.offset() == 0 => {
                Some((Bytes::copy_from_slice(first.data()), first.range()))
            }
            _ => Some((Bytes::new(), 0..0)),
        }
    }

    pub fn stat(&self, query: StatsQuery) -> u64 {
        let stats = self.stats();
        match query {
            StatsQuery::Bytes => stats.bytes,
            StatsQuery::Entries => stats.entries,
            StatsQuery::Pinned => stats.pinned,
            StatsQuery::Loading => stats.loading,
        }
    }

    pub fn stats(&self) -> StoreStats {
        let mut stats = StoreStats {
            bytes: self.total_size,
            entries: self.entries.len() as u64,
            ..StoreStats::default()
        };
        for (_, entry) in self.entries.iter() {
            if entry.pin_count() > 0 {
                stats.pinned += 1;
            }
            if entry.is_loading() {
                stats.loading += 1;
            }
        }
        stats
    }

    /// Per-entry summaries, most recently used first.
    pub fn list(&self) -> Vec<EntrySummary> {
        self.entries
            .iter()
            .map(|(key, entry)| EntrySummary {
                key: key.clone(),
                length: entry.length(),
                bytes: entry.data_size(),
                fragments: entry.fragments().len(),
                pins: entry.pin_count(),
                loading: entry.is_loading(),
                incomplete: entry.is_incomplete(),
            })
            .collect()
    }

    fn with_entry<R>(
        &mut self,
        key: &str,
        op: impl FnOnce(&mut CacheEntry, &mut Sequence) -> R,
    ) -> Result<R, StoreError> {
        let Self {
            entries,
            total_size,
            seq,
            ..
        } = self;
        let entry = entries
            .peek_mut(key)
            .ok_or_else(|| StoreError::UnknownEntry(key.to_string()))?;
        let before = entry.data_size();
        let result = op(entry, seq);
        let after = entry.data_size();
        *total_size = total_size.saturating_add(after).saturating_sub(before);
        Ok(result)
    }

    fn delete(&mut self, key: &str) {
        if let Some(entry) = self.entries.pop(key) {
            let size = entry.data_size();
            if size > self.total_size {
                error!(
                    key,
                    size,
                    total = self.total_size,
                    "store size accounting underflow; clamping"
                );
            }
            self.total_size = self.total_size.saturating_sub(size);
            trace!(key, size, "deleted cache entry");
        }
    }

    /// Recomputes the tracked total from every entry, repairing drift.
    fn verify_accounting(&mut self) {
        let actual: u64 = self
            .entries
            .iter_mut()
            .map(|(_, entry)| entry.verify_accounting())
            .sum();
        if actual != self.total_size {
            error!(
                recorded = self.total_size,
                actual, "store size accounting drifted; repairing"
            );
            self.total_size = actual;
        }
    }
}

/// Handle to the store shared by all in-flight transfers.
#[derive(Debug, Clone)]
pub struct SharedStore {
    inner: Arc<Mutex<ObjectStore>>,
}

impl SharedStore {
    pub fn new(store: ObjectStore) -> Self {
        Self {
            inner: Arc::new(Mutex::new(store)),
        }
    }

    pub fn lock(&self) -> MutexGuard<'_, ObjectStore> {
        self.inner.lock()
    }
}
