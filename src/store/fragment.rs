use std::ops::Range;

use super::StoreError;

/// Fragment buffers grow in multiples of this many bytes.
pub(crate) const FRAGMENT_GRANULARITY: usize = 4096;

/// A contiguous run of cached bytes starting at `offset`.
///
/// The backing buffer is over-allocated to the next granularity boundary so
/// that streaming appends do not reallocate on every read.
#[derive(Debug, Clone)]
pub struct Fragment {
    offset: u64,
    data: Vec<u8>,
}

impl Fragment {
    pub(super) fn with_data(offset: u64, bytes: &[u8]) -> Result<Self, StoreError> {
        let mut data = Vec::new();
        data.try_reserve_exact(granular(bytes.len()))
            .map_err(|_| StoreError::OutOfMemory)?;
        data.extend_from_slice(bytes);
        Ok(Self { offset, data })
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn len(&self) -> u64 {
        self.data.len() as u64
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn end(&self) -> u64 {
        self.offset + self.len()
    }

    pub fn range(&self) -> Range<u64> {
        self.offset..self.end()
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Bytes reserved by the backing buffer, including slack.
    pub fn capacity(&self) -> usize {
        self.data.capacity()
    }

    pub(super) fn contains_or_touches(&self, offset: u64) -> bool {
        self.offset <= offset && offset <= self.end()
    }

    /// Position of `offset` inside the buffer. Caller guarantees containment.
    fn index_of(&self, offset: u64) -> usize {
        (offset - self.offset) as usize
    }

    /// Overwrites bytes starting at `offset` and appends whatever extends past
    /// the current end. Returns true when an overwritten byte differed.
    pub(super) fn splice(&mut self, offset: u64, bytes: &[u8]) -> Result<bool, StoreError> {
        let start = self.index_of(offset);
        let overlap = bytes.len().min(self.data.len() - start);
        let diverged = self.data[start..start + overlap] != bytes[..overlap];
        if diverged {
            self.data[start..start + overlap].copy_from_slice(&bytes[..overlap]);
        }
        self.append(&bytes[overlap..])?;
        Ok(diverged)
    }

    /// Absorbs a following fragment that starts inside or right at our end.
    /// Our bytes win over the overlapped part; returns true if they differed.
    pub(super) fn absorb(&mut self, next: &Fragment) -> Result<bool, StoreError> {
        let start = self.index_of(next.offset);
        let overlap = next.data.len().min(self.data.len() - start);
        let diverged = self.data[start..start + overlap] != next.data[..overlap];
        self.append(&next.data[overlap..])?;
        Ok(diverged)
    }

    fn append(&mut self, bytes: &[u8]) -> Result<(), StoreError> {
        if bytes.is_empty() {
            return Ok(());
        }
        let wanted = self.data.len() + bytes.len();
        if wanted > self.data.capacity() {
            self.data
                .try_reserve_exact(granular(wanted) - self.data.len())
                .map_err(|_| StoreError::OutOfMemory)?;
        }
        self.data.extend_from_slice(bytes);
        Ok(())
    }

    /// Drops every byte at or after `offset`; `exact` releases the slack.
    pub(super) fn cut_tail(&mut self, offset: u64, exact: bool) {
        let keep = self.index_of(offset.max(self.offset)).min(self.data.len());
        self.data.truncate(keep);
        if exact {
            self.data.shrink_to_fit();
        }
    }

    /// Drops every byte before `offset`, moving the fragment start forward.
    pub(super) fn cut_head(&mut self, offset: u64) {
        let cut = self.index_of(offset).min(self.data.len());
        self.data.drain(..cut);
        self.offset += cut as u64;
    }

    pub(super) fn from_parts(offset: u64, data: Vec<u8>) -> Self {
        Self { offset, data }
    }
}

/// Rounds an allocation request up to the fragment granularity.
pub(crate) fn granular(len: usize) -> usize {
    len.div_ceil(FRAGMENT_GRANULARITY).max(1) * FRAGMENT_GRANULARITY
}
