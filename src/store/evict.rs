use tracing::{debug, warn};

use super::ObjectStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvictMode {
    /// Shrink towards the GC target, but only once the quota is exceeded.
    QuotaCheck,
    /// Drop the least recently used entry that is not held.
    FreeOne,
    /// Drop every entry that is not held.
    FreeAll,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EvictOutcome {
    pub freed: bool,
    pub empty: bool,
}

impl ObjectStore {
    pub fn evict(&mut self, mode: EvictMode) -> EvictOutcome {
        let freed = match mode {
            EvictMode::QuotaCheck => self.evict_to_target(),
            EvictMode::FreeOne => self.evict_one(),
            EvictMode::FreeAll => self.evict_all(),
        };
        if freed > 0 {
            crate::metrics::record_evictions(freed);
        }
        EvictOutcome {
            freed: freed > 0,
            empty: self.entries.is_empty(),
        }
    }

    fn evict_to_target(&mut self) -> u64 {
        if self.total_size <= self.quota {
            return 0;
        }
        self.verify_accounting();
        let target = self.gc_target();

        // Mark from the LRU end until what stays fits the target.
        let mut remaining = self.total_size;
        let mut marked: Vec<(String, u64)> = Vec::new();
        for (key, entry) in self.entries.iter().rev() {
            if remaining <= target {
                break;
            }
            if entry.is_held() {
                continue;
            }
            remaining -= entry.data_size();
            marked.push((key.clone(), entry.data_size()));
        }

        // Give back marked entries, most recent first, that still fit.
        let mut victims = Vec::with_capacity(marked.len());
        for (key, size) in marked.into_iter().rev() {
            if size > 0 && remaining + size <= target {
                remaining += size;
            } else {
                victims.push(key);
            }
        }

        for key in &victims {
            self.delete(key);
        }
        if self.total_size > target {
            warn!(
                total = self.total_size,
                target, "cache still above GC target; remaining entries are in use"
            );
        }
        debug!(
            evicted = victims.len(),
            total = self.total_size,
            quota = self.quota,
            target,
            "cache garbage collection finished"
        );
        victims.len() as u64
    }

    fn evict_one(&mut self) -> u64 {
        let victim = self
            .entries
            .iter()
            .rev()
            .find(|(_, entry)| !entry.is_held())
            .map(|(key, _)| key.clone());
        match victim {
            Some(key) => {
                self.delete(&key);
                1
            }
            None => 0,
        }
    }

    fn evict_all(&mut self) -> u64 {
        let victims: Vec<String> = self
            .entries
            .iter()
            .filter(|(_, entry)| !entry.is_held())
            .map(|(key, _)| key.clone())
            .collect();
        for key in &victims {
            self.delete(key);
        }
        victims.len() as u64
    }
}
