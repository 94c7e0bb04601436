//! The update-counter protocol of a single entry slot.
//!
//! Every slot carries a `before` and an `after` counter around its payload words. A writer moves
//! both counters to the same odd value before it touches any payload word, and moves both to the
//! next even value once all payload words are stored (first `after`, then `before`). A reader
//! loads `before`, the payload, then `after`, and only accepts the payload when both loads agree
//! on an even value.
//!
//! Since a starting writer always changes `after`, a reader that overlapped any part of a write
//! observes a mismatch. Writers are expected to be serialized externally, the protocol only
//! protects readers from writers.
use core::sync::atomic::{fence, AtomicU64, Ordering};

/// Size of one slot in bytes, in the shared region.
pub const ENTRY_SIZE: usize = core::mem::size_of::<EntrySlot>();

/// Number of attempts a reader makes before reporting a conflict.
pub const READ_RETRIES: u32 = 64;

/// One fixed-size record of the entry table.
///
/// Do not change without checking `EntrySlot::table`, the layout is persisted.
#[repr(C)]
pub struct EntrySlot {
    before: AtomicU64,
    key_size: AtomicU64,
    key_offset: AtomicU64,
    val_size: AtomicU64,
    val_offset: AtomicU64,
    after: AtomicU64,
    /// Last read, microseconds since the epoch. Not covered by the counters.
    reference_time: AtomicU64,
    update_time: AtomicU64,
}

/// A consistent copy of the payload of a slot.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Entry {
    pub key_size: u64,
    /// Heap offset of the key bytes. Zero marks a vacant slot.
    pub key_offset: u64,
    pub val_size: u64,
    /// Heap offset of the value bytes. For a vacant slot, the next free slot (`u64::MAX` ends the
    /// list).
    pub val_offset: u64,
    pub update_time: u64,
    /// The even counter value at which this copy was taken.
    pub counter: u64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SnapshotError {
    /// A writer kept the slot busy for the whole retry budget.
    Conflict,
}

impl Entry {
    /// Terminates the free list.
    pub const NIL: u64 = u64::MAX;

    /// A vacant slot that links to `next_free`.
    pub fn vacant(next_free: u64) -> Self {
        Entry {
            val_offset: next_free,
            ..Entry::default()
        }
    }

    pub fn is_vacant(&self) -> bool {
        self.key_offset == 0
    }

    /// The next slot of the free list, only meaningful for vacant slots.
    pub fn next_free(&self) -> Option<u64> {
        Some(self.val_offset).filter(|&next| next != Entry::NIL)
    }
}

impl EntrySlot {
    /// View a region of words as entry slots.
    ///
    /// Trailing words that do not fill a whole slot are not part of the table.
    pub fn table(words: &[AtomicU64]) -> &[EntrySlot] {
        let len = words.len() / (ENTRY_SIZE / 8);
        // Safety: `EntrySlot` is `repr(C)` over eight `AtomicU64`, with the same alignment as a
        // single `AtomicU64`. The length is rounded down to full slots.
        unsafe { &*core::ptr::slice_from_raw_parts(words.as_ptr() as *const EntrySlot, len) }
    }

    /// Store a new payload, returning the new even counter.
    ///
    /// Callers must exclude other writers of this slot.
    pub fn write(&self, entry: &Entry) -> u64 {
        let before = self.before.load(Ordering::Relaxed);
        let after = self.after.load(Ordering::Relaxed);
        // If a prior writer died with odd counters we stay odd, but surely move past both marks.
        let open = before.max(after) | 1;

        self.before.store(open, Ordering::Relaxed);
        self.after.store(open, Ordering::Relaxed);
        // Ensure the sequencing with regards to payload modification.
        fence(Ordering::Release);

        self.key_size.store(entry.key_size, Ordering::Relaxed);
        self.key_offset.store(entry.key_offset, Ordering::Relaxed);
        self.val_size.store(entry.val_size, Ordering::Relaxed);
        self.val_offset.store(entry.val_offset, Ordering::Relaxed);
        self.update_time.store(entry.update_time, Ordering::Relaxed);

        let closed = open.wrapping_add(1);
        self.after.store(closed, Ordering::Release);
        self.before.store(closed, Ordering::Release);
        closed
    }

    /// A single attempt at a consistent copy.
    pub fn try_read(&self) -> Option<Entry> {
        let before = self.before.load(Ordering::Acquire);
        if before & 1 == 1 {
            return None;
        }

        let entry = Entry {
            key_size: self.key_size.load(Ordering::Relaxed),
            key_offset: self.key_offset.load(Ordering::Relaxed),
            val_size: self.val_size.load(Ordering::Relaxed),
            val_offset: self.val_offset.load(Ordering::Relaxed),
            update_time: self.update_time.load(Ordering::Relaxed),
            counter: before,
        };

        fence(Ordering::Acquire);
        let after = self.after.load(Ordering::Relaxed);

        if after != before {
            return None;
        }

        Some(entry)
    }

    /// Read a consistent copy, retrying up to [`READ_RETRIES`] times.
    pub fn read(&self) -> Result<Entry, SnapshotError> {
        for _ in 0..READ_RETRIES {
            if let Some(entry) = self.try_read() {
                return Ok(entry);
            }

            core::hint::spin_loop();
        }

        Err(SnapshotError::Conflict)
    }

    /// The payload words as they are, ignoring the counters.
    ///
    /// For salvaging a torn slot while all writers are excluded. The result carries the `after`
    /// counter, which may be odd.
    pub fn peek(&self) -> Entry {
        Entry {
            key_size: self.key_size.load(Ordering::Acquire),
            key_offset: self.key_offset.load(Ordering::Acquire),
            val_size: self.val_size.load(Ordering::Acquire),
            val_offset: self.val_offset.load(Ordering::Acquire),
            update_time: self.update_time.load(Ordering::Acquire),
            counter: self.after.load(Ordering::Acquire),
        }
    }

    /// Whether a writer stopped between its two counter updates.
    ///
    /// Only meaningful while all writers are excluded, otherwise a live writer looks the same.
    pub fn is_torn(&self) -> bool {
        let before = self.before.load(Ordering::Acquire);
        let after = self.after.load(Ordering::Acquire);
        before & 1 == 1 || after & 1 == 1 || before != after
    }

    /// Record a read access, never moving the time backwards.
    pub fn touch(&self, now: u64) {
        self.reference_time.fetch_max(now, Ordering::Relaxed);
    }

    pub fn reference_time(&self) -> u64 {
        self.reference_time.load(Ordering::Relaxed)
    }

    /// The raw counter pair, for diagnostics.
    pub fn counters(&self) -> (u64, u64) {
        (
            self.before.load(Ordering::Acquire),
            self.after.load(Ordering::Acquire),
        )
    }
}

#[test]
fn write_then_read() {
    let slots = EntrySlot::table(crate::region::<16>());
    assert_eq!(slots.len(), 2);
    assert_eq!(ENTRY_SIZE, 64);

    let fresh = slots[1].read().unwrap();
    assert!(fresh.is_vacant());
    assert_eq!(fresh.counter, 0);

    let entry = Entry {
        key_size: 5,
        key_offset: 16,
        val_size: 2,
        val_offset: 40,
        update_time: 1_700_000_000_000_000,
        counter: 0,
    };

    let counter = slots[1].write(&entry);
    assert_eq!(counter, 2);

    let read = slots[1].read().unwrap();
    assert_eq!(read, Entry { counter, ..entry });
    assert!(!slots[1].is_torn());
    assert!(slots[0].read().unwrap().is_vacant());

    assert_eq!(slots[1].write(&entry), 4);
}

#[test]
fn torn_counters_are_rejected() {
    let slots = EntrySlot::table(crate::region::<8>());
    let slot = &slots[0];

    // A writer that died after opening the slot.
    slot.before.store(3, Ordering::Relaxed);
    slot.after.store(3, Ordering::Relaxed);
    assert!(slot.try_read().is_none());
    assert_eq!(slot.read(), Err(SnapshotError::Conflict));
    assert!(slot.is_torn());
    assert_eq!(slot.peek().counter, 3);

    // Even but mismatched.
    slot.before.store(4, Ordering::Relaxed);
    slot.after.store(2, Ordering::Relaxed);
    assert!(slot.try_read().is_none());

    // A repairing write moves past both marks and closes the slot again.
    let counter = slot.write(&Entry::vacant(Entry::NIL));
    assert_eq!(counter, 6);
    assert!(!slot.is_torn());
    assert_eq!(slot.read().unwrap().next_free(), None);
}

#[test]
fn reference_time_is_monotonic() {
    let slots = EntrySlot::table(crate::region::<8>());
    slots[0].touch(20);
    slots[0].touch(10);
    assert_eq!(slots[0].reference_time(), 20);
    // Does not disturb the counters.
    assert_eq!(slots[0].counters(), (0, 0));
}

#[test]
fn concurrent_reader_sees_whole_payloads() {
    extern crate std;
    use core::sync::atomic::AtomicBool;
    use std::sync::Arc;

    let slots = EntrySlot::table(crate::region::<8>());
    let done = Arc::new(AtomicBool::new(false));

    let readers: std::vec::Vec<_> = (0..2)
        .map(|_| {
            let done = done.clone();
            std::thread::spawn(move || {
                let mut accepted = 0u64;
                while !done.load(Ordering::Relaxed) {
                    if let Some(entry) = slots[0].try_read() {
                        assert_eq!(entry.counter & 1, 0);
                        assert_eq!(entry.key_size, entry.key_offset);
                        assert_eq!(entry.key_size, entry.val_size);
                        assert_eq!(entry.key_size, entry.val_offset);
                        assert_eq!(entry.key_size, entry.update_time);
                        accepted += 1;
                    }
                }
                accepted
            })
        })
        .collect();

    for i in 1..=20_000u64 {
        slots[0].write(&Entry {
            key_size: i,
            key_offset: i,
            val_size: i,
            val_offset: i,
            update_time: i,
            counter: 0,
        });
    }

    done.store(true, Ordering::Relaxed);
    for reader in readers {
        reader.join().unwrap();
    }

    assert_eq!(slots[0].read().unwrap().key_size, 20_000);
}
