use bytes::Bytes;
use tracing::{debug, error, warn};

use crate::decode::ContentEncoding;

use super::fragment::Fragment;
use super::freshness::Validators;
use super::lease::Holds;
use super::{StoreError, WriteOutcome};

/// Store-wide monotonic counter handed out to entries on every change.
#[derive(Debug, Default)]
pub(super) struct Sequence {
    next: u64,
}

impl Sequence {
    pub(super) fn next(&mut self) -> u64 {
        self.next += 1;
        self.next
    }
}

/// Where a redirect response pointed and how to follow it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Redirect {
    pub location: String,
    /// 303 turns the follow-up into a GET; 301/302 keep the method.
    pub force_get: bool,
}

/// The cached representation of one URL.
#[derive(Debug)]
pub struct CacheEntry {
    key: String,
    fragments: Vec<Fragment>,
    length: u64,
    data_size: u64,
    incomplete: bool,
    /// Bumped on every change.
    write_seq: u64,
    /// Bumped when content is not a plain continuation of the last write.
    layout_seq: u64,
    head: Option<Bytes>,
    validators: Validators,
    redirect: Option<Redirect>,
    encoding: Option<ContentEncoding>,
    decoded: bool,
    pub(super) holds: Holds,
}

impl CacheEntry {
    pub(super) fn new(key: String, seq: &mut Sequence) -> Self {
        let write_seq = seq.next();
        Self {
            key,
            fragments: Vec::new(),
            length: 0,
            data_size: 0,
            incomplete: true,
            write_seq,
            layout_seq: write_seq,
            head: None,
            validators: Validators::default(),
            redirect: None,
            encoding: None,
            decoded: false,
            holds: Holds::default(),
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn fragments(&self) -> &[Fragment] {
        &self.fragments
    }

    /// Best known logical size of the object.
    pub fn length(&self) -> u64 {
        self.length
    }

    /// Bytes actually held in fragments.
    pub fn data_size(&self) -> u64 {
        self.data_size
    }

    pub fn is_incomplete(&self) -> bool {
        self.incomplete
    }

    pub fn write_seq(&self) -> u64 {
        self.write_seq
    }

    pub fn layout_seq(&self) -> u64 {
        self.layout_seq
    }

    pub fn head(&self) -> Option<&Bytes> {
        self.head.as_ref()
    }

    pub fn validators(&self) -> &Validators {
        &self.validators
    }

    pub fn redirect(&self) -> Option<&Redirect> {
        self.redirect.as_ref()
    }

    /// Encoding the stored bytes are still wrapped in, when left undecoded.
    pub fn encoding(&self) -> Option<ContentEncoding> {
        self.encoding
    }

    /// True when stored bytes came out of a decompressor and therefore do not
    /// line up with wire offsets.
    pub fn is_decoded(&self) -> bool {
        self.decoded
    }

    pub fn pin_count(&self) -> usize {
        self.holds.pins()
    }

    pub fn is_loading(&self) -> bool {
        self.holds.is_writing()
    }

    pub fn is_held(&self) -> bool {
        self.holds.is_held()
    }

    pub fn set_head(&mut self, head: Bytes) {
        self.head = Some(head);
    }

    pub fn set_validators(&mut self, validators: Validators) {
        self.validators = validators;
    }

    pub fn set_redirect(&mut self, redirect: Option<Redirect>) {
        self.redirect = redirect;
    }

    pub fn set_encoding(&mut self, encoding: Option<ContentEncoding>, decoded: bool) {
        self.encoding = encoding;
        self.decoded = decoded;
    }

    pub fn mark_complete(&mut self) {
        self.incomplete = false;
    }

    /// Length of the leading run of bytes starting at offset 0.
    pub fn contiguous_prefix(&self) -> u64 {
        let mut end = 0;
        for fragment in &self.fragments {
            if fragment.offset() > end {
                break;
            }
            end = end.max(fragment.end());
        }
        end
    }

    /// Copies out `[offset, offset + len)` if every byte of it is cached.
    pub fn read_range(&self, offset: u64, len: u64) -> Option<Vec<u8>> {
        let end = offset.checked_add(len)?;
        let fragment = self
            .fragments
            .iter()
            .find(|fragment| fragment.offset() <= offset && end <= fragment.end())?;
        let start = (offset - fragment.offset()) as usize;
        Some(fragment.data()[start..start + len as usize].to_vec())
    }

    pub(super) fn write_range(
        &mut self,
        offset: u64,
        data: &[u8],
        seq: &mut Sequence,
    ) -> Result<WriteOutcome, StoreError> {
        if data.is_empty() {
            return Ok(WriteOutcome::Merged);
        }
        let end = offset
            .checked_add(data.len() as u64)
            .ok_or(StoreError::RangeOverflow)?;
        self.incomplete = true;
        self.length = self.length.max(end);
        self.write_seq = seq.next();
        let continues = self
            .fragments
            .last()
            .is_some_and(|last| last.end() == offset);
        if !continues {
            self.layout_seq = seq.next();
        }

        let next_idx = self
            .fragments
            .partition_point(|fragment| fragment.offset() <= offset);
        let target = next_idx
            .checked_sub(1)
            .filter(|&idx| self.fragments[idx].contains_or_touches(offset));

        let (idx, outcome, mut diverged) = match target {
            Some(idx) => {
                let before = self.fragments[idx].len();
                let diverged = self.fragments[idx].splice(offset, data)?;
                self.data_size += self.fragments[idx].len() - before;
                (idx, WriteOutcome::Merged, diverged)
            }
            None => {
                let fragment = Fragment::with_data(offset, data)?;
                self.data_size += fragment.len();
                self.fragments.insert(next_idx, fragment);
                (next_idx, WriteOutcome::NewFragment, false)
            }
        };

        diverged |= self.coalesce_from(idx)?;
        if diverged {
            warn!(
                key = %self.key,
                offset,
                end,
                "cached bytes diverge from received data; truncating entry"
            );
            crate::metrics::record_divergence();
            self.truncate(end, false, seq);
        }
        Ok(outcome)
    }

    /// Folds following fragments into `idx` while they touch or overlap it.
    fn coalesce_from(&mut self, idx: usize) -> Result<bool, StoreError> {
        let mut diverged = false;
        while idx + 1 < self.fragments.len()
            && self.fragments[idx].end() >= self.fragments[idx + 1].offset()
        {
            let next = self.fragments.remove(idx + 1);
            let before = self.fragments[idx].len();
            match self.fragments[idx].absorb(&next) {
                Ok(differs) => diverged |= differs,
                Err(err) => {
                    // Put the unmerged fragment back so accounting stays exact.
                    self.fragments.insert(idx + 1, next);
                    return Err(err);
                }
            }
            let grown = self.fragments[idx].len() - before;
            self.data_size = self.data_size + grown - next.len();
        }
        Ok(diverged)
    }

    /// Joins the contiguous run starting at offset 0 into one exactly sized
    /// fragment.
    pub(super) fn defragment(&mut self) {
        let Some(first) = self.fragments.first() else {
            return;
        };
        if first.offset() != 0 {
            return;
        }
        let mut run = 1;
        let mut total = first.len();
        while run < self.fragments.len() {
            let prev_end = self.fragments[run - 1].end();
            let next = &self.fragments[run];
            if next.offset() > prev_end {
                break;
            }
            if next.offset() < prev_end {
                error!(key = %self.key, offset = next.offset(), "fragments overlap");
                return;
            }
            total += next.len();
            run += 1;
        }
        if run == 1 && first.capacity() as u64 == first.len() {
            return;
        }

        let mut data = Vec::new();
        if data.try_reserve_exact(total as usize).is_err() {
            debug!(key = %self.key, total, "not enough memory to defragment entry");
            return;
        }
        for fragment in self.fragments.drain(..run) {
            data.extend_from_slice(fragment.data());
        }
        self.fragments.insert(0, Fragment::from_parts(0, data));
    }

    pub(super) fn truncate(&mut self, offset: u64, final_size: bool, seq: &mut Sequence) {
        if self.length > offset {
            self.length = offset;
            self.incomplete = true;
        }
        if final_size {
            self.length = offset;
        }

        let mut modified = false;
        let keep = self
            .fragments
            .partition_point(|fragment| fragment.offset() < offset);
        for dropped in self.fragments.drain(keep..) {
            self.data_size -= dropped.len();
            modified = true;
        }
        if let Some(last) = self.fragments.last_mut()
            && (last.end() > offset || (final_size && last.capacity() as u64 > last.len()))
        {
            let before = last.len();
            last.cut_tail(offset, final_size);
            self.data_size -= before - last.len();
            modified |= before != last.len();
        }
        if modified {
            self.write_seq = seq.next();
            self.layout_seq = seq.next();
        }
    }

    pub(super) fn trim_front(&mut self, offset: u64, seq: &mut Sequence) {
        self.incomplete = true;
        let drop_count = self
            .fragments
            .partition_point(|fragment| fragment.end() <= offset);
        let mut modified = drop_count > 0;
        for dropped in self.fragments.drain(..drop_count) {
            self.data_size -= dropped.len();
        }
        if let Some(first) = self.fragments.first_mut()
            && first.offset() < offset
        {
            let before = first.len();
            first.cut_head(offset);
            self.data_size -= before - first.len();
            modified = true;
        }
        if modified {
            self.write_seq = seq.next();
            self.layout_seq = seq.next();
        }
    }

    /// Drops content and validators but keeps the slot and its holds.
    pub(super) fn clear_content(&mut self, seq: &mut Sequence) {
        self.fragments.clear();
        self.data_size = 0;
        self.length = 0;
        self.incomplete = true;
        self.validators = Validators::default();
        self.encoding = None;
        self.decoded = false;
        self.write_seq = seq.next();
        self.layout_seq = seq.next();
    }

    /// Recomputes `data_size` from the fragments, logging any drift.
    pub(super) fn verify_accounting(&mut self) -> u64 {
        let actual: u64 = self.fragments.iter().map(Fragment::len).sum();
        if actual != self.data_size {
            error!(
                key = %self.key,
                recorded = self.data_size,
                actual,
                "entry size accounting drifted; repairing"
            );
            self.data_size = actual;
        }
        actual
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry() -> (CacheEntry, Sequence) {
        let mut seq = Sequence::default();
        (CacheEntry::new("http://t/".into(), &mut seq), seq)
    }

    fn ranges(entry: &CacheEntry) -> Vec<std::ops::Range<u64>> {
        entry.fragments().iter().map(Fragment::range).collect()
    }

    #[test]
    fn disjoint_writes_keep_separate_fragments() -> anyhow::Result<()> {
        let (mut e, mut seq) = entry();
        assert_eq!(e.write_range(10, b"bbbb", &mut seq)?, WriteOutcome::NewFragment);
        assert_eq!(e.write_range(0, b"aa", &mut seq)?, WriteOutcome::NewFragment);
        assert_eq!(ranges(&e), vec![0..2, 10..14]);
        assert_eq!(e.data_size(), 6);
        assert_eq!(e.length(), 14);
        Ok(())
    }

    #[test]
    fn bridging_write_coalesces_neighbours() -> anyhow::Result<()> {
        let (mut e, mut seq) = entry();
        e.write_range(0, b"abc", &mut seq)?;
        e.write_range(6, b"ghi", &mut seq)?;
        assert_eq!(e.write_range(3, b"def", &mut seq)?, WriteOutcome::Merged);
        assert_eq!(ranges(&e), vec![0..9]);
        assert_eq!(e.fragments()[0].data(), b"abcdefghi");
        assert_eq!(e.data_size(), 9);
        Ok(())
    }

    #[test]
    fn new_fragment_swallows_overlapped_successor() -> anyhow::Result<()> {
        let (mut e, mut seq) = entry();
        e.write_range(4, b"ef", &mut seq)?;
        e.write_range(2, b"cdefgh", &mut seq)?;
        assert_eq!(ranges(&e), vec![2..8]);
        assert_eq!(e.fragments()[0].data(), b"cdefgh");
        assert_eq!(e.data_size(), 6);
        Ok(())
    }

    #[test]
    fn divergent_successor_truncates_after_write() -> anyhow::Result<()> {
        let (mut e, mut seq) = entry();
        e.write_range(4, b"XXXXXXXX", &mut seq)?;
        e.write_range(0, b"abcdef", &mut seq)?;
        assert_eq!(e.length(), 6);
        assert_eq!(ranges(&e), vec![0..6]);
        assert_eq!(e.fragments()[0].data(), b"abcdef");
        assert_eq!(e.data_size(), 6);
        Ok(())
    }

    #[test]
    fn truncate_final_releases_slack() -> anyhow::Result<()> {
        let (mut e, mut seq) = entry();
        e.write_range(0, &[7u8; 100], &mut seq)?;
        e.truncate(60, true, &mut seq);
        assert_eq!(e.length(), 60);
        assert_eq!(e.data_size(), 60);
        assert_eq!(e.fragments()[0].capacity(), 60);
        Ok(())
    }

    #[test]
    fn truncate_to_zero_empties_entry() -> anyhow::Result<()> {
        let (mut e, mut seq) = entry();
        e.write_range(0, b"abc", &mut seq)?;
        e.truncate(3, true, &mut seq);
        assert_eq!(e.length(), 3);
        e.truncate(0, true, &mut seq);
        assert_eq!(e.length(), 0);
        assert!(e.fragments().is_empty());
        assert_eq!(e.data_size(), 0);
        Ok(())
    }

    #[test]
    fn trim_front_drops_and_shifts() -> anyhow::Result<()> {
        let (mut e, mut seq) = entry();
        e.write_range(0, b"0123", &mut seq)?;
        e.write_range(10, b"abcdef", &mut seq)?;
        let (write, layout) = (e.write_seq(), e.layout_seq());
        e.trim_front(12, &mut seq);
        assert_eq!(ranges(&e), vec![12..16]);
        assert_eq!(e.fragments()[0].data(), b"cdef");
        assert_eq!(e.data_size(), 4);
        assert!(e.write_seq() > write);
        assert!(e.layout_seq() > layout);
        Ok(())
    }

    #[test]
    fn trim_front_before_first_fragment_keeps_sequences() -> anyhow::Result<()> {
        let (mut e, mut seq) = entry();
        e.write_range(10, b"abc", &mut seq)?;
        let (write, layout) = (e.write_seq(), e.layout_seq());
        e.trim_front(5, &mut seq);
        assert_eq!(ranges(&e), vec![10..13]);
        assert_eq!((e.write_seq(), e.layout_seq()), (write, layout));
        Ok(())
    }

    #[test]
    fn sequence_counters_track_contiguity() -> anyhow::Result<()> {
        let (mut e, mut seq) = entry();
        e.write_range(0, b"ab", &mut seq)?;
        let layout = e.layout_seq();
        e.write_range(2, b"cd", &mut seq)?;
        assert_eq!(e.layout_seq(), layout);
        e.write_range(10, b"zz", &mut seq)?;
        assert!(e.layout_seq() > layout);
        Ok(())
    }

    #[test]
    fn read_range_requires_full_coverage() -> anyhow::Result<()> {
        let (mut e, mut seq) = entry();
        e.write_range(0, b"hello", &mut seq)?;
        assert_eq!(e.read_range(1, 3).as_deref(), Some(&b"ell"[..]));
        assert!(e.read_range(3, 5).is_none());
        Ok(())
    }
}
