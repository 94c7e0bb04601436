//! The append-only key/value heap.
//!
//! Every record is a back reference to its owning slot, the payload length, then the payload
//! padded with zeros to whole words. Offsets handed out point at the payload, so they are never
//! zero and a zero key offset can mark a vacant slot.
use core::sync::atomic::Ordering;

use crate::segment::Section;
use crate::{Error, Result};

/// Bytes in front of each payload.
pub(crate) const RECORD_HEAD: u64 = 16;

/// Heap files grow by doubling, starting from this.
const MIN_HEAP: u64 = 1 << 16;

/// Storage allocated for a payload of `len` bytes.
///
/// The next multiple of eight, where an empty payload still takes one word.
pub fn padded_len(len: usize) -> usize {
    if len == 0 {
        8
    } else {
        len.div_ceil(8) * 8
    }
}

/// Bytes of a whole record holding `len` payload bytes.
pub(crate) fn record_len(len: usize) -> u64 {
    RECORD_HEAD + padded_len(len) as u64
}

pub(crate) struct Heap {
    section: Section,
}

impl Heap {
    pub(crate) fn new(section: Section) -> Self {
        Heap { section }
    }

    pub(crate) fn section(&self) -> &Section {
        &self.section
    }

    /// Map everything the file holds, after another process appended.
    pub(crate) fn sync(&mut self, var_end: u64) -> Result<()> {
        if self.section.mapped() >= var_end {
            return Ok(());
        }

        self.section.map_file()?;
        if self.section.mapped() < var_end {
            return Err(Error::corrupt(format!(
                "heap file ends before its high-water mark {var_end}"
            )));
        }

        Ok(())
    }

    /// Make sure bytes up to `end` are backed and mapped. Needs the structural lock.
    ///
    /// On failure the heap is as before.
    pub(crate) fn reserve(&mut self, end: u64) -> Result<()> {
        if self.section.mapped() >= end {
            return Ok(());
        }

        // Another process may have extended the file already.
        let file_len = self.section.file_len()?;
        if file_len >= end {
            return self.section.map(file_len);
        }

        let len = end.checked_next_power_of_two().unwrap_or(end).max(MIN_HEAP);
        tracing::info!(from = file_len, to = len, "growing key/value heap");
        self.section.grow(len)
    }

    /// Write a record at `at`, returning the payload offset.
    ///
    /// The range must be reserved and not yet reachable by any reader.
    pub(crate) fn append(&self, at: u64, back_ref: u64, bytes: &[u8]) -> Result<u64> {
        let words = self.section.words();
        let head = (at / 8) as usize;

        let (Some(slot_word), Some(size_word)) = (words.get(head), words.get(head + 1)) else {
            return Err(Error::corrupt(format!("heap record at {at} not reserved")));
        };

        slot_word.store(back_ref, Ordering::Relaxed);
        size_word.store(bytes.len() as u64, Ordering::Relaxed);

        let payload = at + RECORD_HEAD;
        self.section.write_bytes(payload, bytes)?;

        let padding = [0u8; 8];
        let tail = padded_len(bytes.len()) - bytes.len();
        self.section
            .write_bytes(payload + bytes.len() as u64, &padding[..tail])?;

        Ok(payload)
    }

    /// The back reference and length stored in front of a payload.
    pub(crate) fn record_head(&self, payload: u64) -> Option<(u64, u64)> {
        let at = payload.checked_sub(RECORD_HEAD).filter(|at| at % 8 == 0)?;
        let words = self.section.words();
        let head = (at / 8) as usize;

        let back_ref = words.get(head)?.load(Ordering::Relaxed);
        let size = words.get(head + 1)?.load(Ordering::Relaxed);
        Some((back_ref, size))
    }

    /// Whether a record fits the slot and length an entry claims for it.
    pub(crate) fn matches(&self, payload: u64, slot: u64, len: u64) -> bool {
        let in_bounds = payload
            .checked_add(len)
            .is_some_and(|end| end <= self.section.mapped());
        in_bounds && self.record_head(payload) == Some((slot, len))
    }

    /// Copy out a payload, checking it against its record head.
    pub(crate) fn read(&mut self, payload: u64, len: u64, slot: u64) -> Result<Vec<u8>> {
        let end = payload
            .checked_add(len)
            .ok_or_else(|| Error::corrupt(format!("heap range {payload}+{len} overflows")))?;

        if end > self.section.mapped() {
            self.section.map_file()?;
        }

        match self.record_head(payload) {
            Some((_, size)) if size == len => {}
            found => {
                return Err(Error::corrupt(format!(
                    "heap record at {payload} for slot {slot} has head {found:?}, expected length {len}"
                )))
            }
        }

        self.section.read_bytes(payload, len as usize)
    }
}

#[test]
fn padding_rounds_to_words() {
    assert_eq!(padded_len(0), 8);
    assert_eq!(padded_len(1), 8);
    assert_eq!(padded_len(7), 8);
    assert_eq!(padded_len(8), 8);
    assert_eq!(padded_len(9), 16);
    assert_eq!(padded_len(24), 24);
    assert_eq!(record_len(5), 24);
}

#[test]
fn append_and_read_back() {
    use crate::segment::SectionKind;

    let mut heap = Heap::new(Section::anonymous(SectionKind::KeyVal).unwrap());
    heap.reserve(1).unwrap();
    assert_eq!(heap.section().mapped(), MIN_HEAP);

    let key = heap.append(0, 3, b"alice").unwrap();
    assert_eq!(key, RECORD_HEAD);
    let value = heap.append(record_len(5), 3, b"").unwrap();
    assert_eq!(value, 24 + RECORD_HEAD);

    assert_eq!(heap.read(key, 5, 3).unwrap(), b"alice");
    assert_eq!(heap.read(value, 0, 3).unwrap(), b"");
    assert!(heap.matches(key, 3, 5));
    assert!(!heap.matches(key, 4, 5));
    assert!(matches!(heap.read(key, 6, 3), Err(Error::Corrupt(_))));

    heap.reserve(MIN_HEAP + 1).unwrap();
    assert_eq!(heap.section().mapped(), 2 * MIN_HEAP);
    assert_eq!(heap.read(key, 5, 3).unwrap(), b"alice");
}
