use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

/// Shared hold counters of one entry. The store reads them during eviction;
/// guards update them without going through the store.
#[derive(Debug, Default, Clone)]
pub(super) struct Holds {
    pins: Arc<AtomicUsize>,
    writing: Arc<AtomicBool>,
}

impl Holds {
    pub(super) fn pins(&self) -> usize {
        self.pins.load(Ordering::Acquire)
    }

    pub(super) fn is_writing(&self) -> bool {
        self.writing.load(Ordering::Acquire)
    }

    pub(super) fn is_held(&self) -> bool {
        self.pins() > 0 || self.is_writing()
    }

    pub(super) fn pin(&self, key: &str) -> PinGuard {
        self.pins.fetch_add(1, Ordering::AcqRel);
        PinGuard {
            key: key.to_string(),
            pins: self.pins.clone(),
        }
    }

    pub(super) fn claim_writer(&self, key: &str) -> Option<WriterGuard> {
        self.writing
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()?;
        Some(WriterGuard {
            key: key.to_string(),
            writing: self.writing.clone(),
        })
    }
}

/// Keeps an entry out of eviction while alive.
#[derive(Debug)]
#[must_use = "the entry is unpinned as soon as the guard is dropped"]
pub struct PinGuard {
    key: String,
    pins: Arc<AtomicUsize>,
}

impl PinGuard {
    pub fn key(&self) -> &str {
        &self.key
    }
}

impl Clone for PinGuard {
    fn clone(&self) -> Self {
        self.pins.fetch_add(1, Ordering::AcqRel);
        Self {
            key: self.key.clone(),
            pins: self.pins.clone(),
        }
    }
}

impl Drop for PinGuard {
    fn drop(&mut self) {
        self.pins.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Marks an entry as being written by an in-flight transfer.
#[derive(Debug)]
#[must_use = "the writer claim is released as soon as the guard is dropped"]
pub struct WriterGuard {
    key: String,
    writing: Arc<AtomicBool>,
}

impl WriterGuard {
    pub fn key(&self) -> &str {
        &self.key
    }
}

impl Drop for WriterGuard {
    fn drop(&mut self) {
        self.writing.store(false, Ordering::Release);
    }
}
