use core::sync::atomic::{fence, AtomicU64, Ordering};

/// A best-effort ring of change notifications, the memory lane.
///
/// Similar in design to the descriptor rings of io-uring/XDP, but there is a single kind of
/// producer and the consumers never hand anything back. The producer writes one record per
/// mutation at a monotonically increasing position, the record index is the position modulo the
/// number of records in the ring. Wrapping overwrites the oldest record.
///
/// Each record comes with a mark, denoting its state. While the producer writes position `p`, the
/// mark is `2p + 1`; once sealed it is `2p + 2`. The cursor is advanced only after the seal. A
/// consumer reading position `p`:
/// 1. loads the mark and expects the sealed value for `p`.
/// 2. copies the payload.
/// 3. loads the mark again. Any other value means the record was reused for a later position
///    while copying.
///
/// Producers must be serialized externally.
pub struct Lane<'lt> {
    records: &'lt [LaneRecord],
    cursor: &'lt AtomicU64,
}

/// Do not change without checking `Lane::new`.
#[repr(C)]
struct LaneRecord {
    mark: AtomicU64,
    /// The slot index, with the `ChangeKind` in the top byte.
    slot: AtomicU64,
    /// The `after` counter of the slot as written.
    counter: AtomicU64,
    /// Microseconds since the epoch.
    time: AtomicU64,
}

/// Size of one record in bytes, in the shared region.
pub const LANE_RECORD_SIZE: usize = core::mem::size_of::<LaneRecord>();

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ChangeKind {
    Insert,
    Update,
    Remove,
}

/// User-facing record of one mutation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Change {
    /// The position in the stream of all changes.
    pub position: u64,
    pub kind: ChangeKind,
    pub slot: u64,
    pub counter: u64,
    pub time: u64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LaneError {
    /// The region does not fit a single record.
    UnfittingLayout,
    /// The position has not been published yet.
    Pending,
    /// The consumer fell behind, `missed` positions were overwritten before they were read.
    Gap { missed: u64 },
}

const SLOT_MASK: u64 = (1 << 56) - 1;

impl ChangeKind {
    fn tag(self) -> u64 {
        match self {
            ChangeKind::Insert => 1,
            ChangeKind::Update => 2,
            ChangeKind::Remove => 3,
        }
    }

    fn from_tag(tag: u64) -> Option<Self> {
        Some(match tag {
            1 => ChangeKind::Insert,
            2 => ChangeKind::Update,
            3 => ChangeKind::Remove,
            _ => return None,
        })
    }
}

impl<'lt> Lane<'lt> {
    /// Wrap a region of words and the shared cursor.
    ///
    /// The region is divided into as many records as fit, trailing words are unused.
    pub fn new(words: &'lt [AtomicU64], cursor: &'lt AtomicU64) -> Result<Self, LaneError> {
        let len = words.len() / (LANE_RECORD_SIZE / 8);

        if len == 0 {
            return Err(LaneError::UnfittingLayout);
        }

        // Safety: the layout of `LaneRecord` is just an array of 4 AtomicU64.
        let records = unsafe {
            &*core::ptr::slice_from_raw_parts(words.as_ptr() as *const LaneRecord, len)
        };

        Ok(Lane { records, cursor })
    }

    /// The number of records held before wrapping.
    pub fn capacity(&self) -> u64 {
        self.records.len() as u64
    }

    /// The next position to be written.
    pub fn cursor(&self) -> u64 {
        self.cursor.load(Ordering::Acquire)
    }

    /// Publish one change, returning its position.
    pub fn push(&self, kind: ChangeKind, slot: u64, counter: u64, time: u64) -> u64 {
        let position = self.cursor.load(Ordering::Relaxed);
        let target = self.record(position);

        // This marks the record as owned by the producer.
        target.mark.store(Self::open_mark(position), Ordering::Relaxed);
        // Ensure the sequencing with regards to record modification.
        fence(Ordering::Release);

        target
            .slot
            .store(kind.tag() << 56 | (slot & SLOT_MASK), Ordering::Relaxed);
        target.counter.store(counter, Ordering::Relaxed);
        target.time.store(time, Ordering::Relaxed);

        target
            .mark
            .store(Self::sealed_mark(position), Ordering::Release);
        self.cursor
            .store(position.wrapping_add(1), Ordering::Release);

        position
    }

    /// Read the change at one position.
    pub fn read(&self, position: u64) -> Result<Change, LaneError> {
        let cursor = self.cursor();

        if position >= cursor {
            return Err(LaneError::Pending);
        }

        let oldest = cursor.saturating_sub(self.capacity());
        if position < oldest {
            return Err(LaneError::Gap {
                missed: oldest - position,
            });
        }

        let target = self.record(position);
        let expected = Self::sealed_mark(position);

        let mark = target.mark.load(Ordering::Acquire);
        let slot = target.slot.load(Ordering::Relaxed);
        let counter = target.counter.load(Ordering::Relaxed);
        let time = target.time.load(Ordering::Relaxed);
        fence(Ordering::Acquire);
        let recheck = target.mark.load(Ordering::Relaxed);

        let oldest = self.cursor().saturating_sub(self.capacity());
        let overtaken = LaneError::Gap {
            missed: oldest.saturating_sub(position).max(1),
        };

        if mark != expected || recheck != expected {
            return Err(overtaken);
        }

        let kind = ChangeKind::from_tag(slot >> 56).ok_or(overtaken)?;

        Ok(Change {
            position,
            kind,
            slot: slot & SLOT_MASK,
            counter,
            time,
        })
    }

    /// Collect all changes from `position` up to the current cursor.
    ///
    /// Returns the position to continue from. On a gap nothing is guaranteed about the contents
    /// that were already extended into `into`, the consumer should resynchronize by other means.
    pub fn collect_since(
        &self,
        position: u64,
        into: &mut impl Extend<Change>,
    ) -> Result<u64, LaneError> {
        let end = self.cursor();
        let mut next = position;

        while next < end {
            let change = self.read(next)?;
            into.extend(core::iter::once(change));
            next += 1;
        }

        Ok(next)
    }

    fn record(&self, position: u64) -> &LaneRecord {
        &self.records[(position % self.capacity()) as usize]
    }

    fn open_mark(position: u64) -> u64 {
        position.wrapping_mul(2).wrapping_add(1)
    }

    fn sealed_mark(position: u64) -> u64 {
        position.wrapping_mul(2).wrapping_add(2)
    }
}

#[test]
fn primitive_lane_ops() {
    let cursor = AtomicU64::new(0);
    let lane = Lane::new(crate::region::<16>(), &cursor).unwrap();
    assert_eq!(lane.capacity(), 4);
    assert_eq!(LANE_RECORD_SIZE, 32);

    assert_eq!(lane.read(0), Err(LaneError::Pending));

    let position = lane.push(ChangeKind::Insert, 7, 2, 0xdead_beef);
    assert_eq!(position, 0);
    assert_eq!(lane.cursor(), 1);

    let found = lane.read(0).unwrap();
    assert_eq!(
        found,
        Change {
            position: 0,
            kind: ChangeKind::Insert,
            slot: 7,
            counter: 2,
            time: 0xdead_beef,
        }
    );
}

#[test]
fn wraps_after_capacity() {
    extern crate std;
    use std::vec::Vec;

    let cursor = AtomicU64::new(0);
    let words = crate::region::<16>();
    let lane = Lane::new(words, &cursor).unwrap();

    for slot in 0..4 {
        lane.push(ChangeKind::Update, slot, 2, 0);
    }

    // Exactly one full turn, everything readable and the next write reuses record zero.
    let mut all = Vec::new();
    assert_eq!(lane.collect_since(0, &mut all), Ok(4));
    assert_eq!(all.iter().map(|c| c.slot).collect::<Vec<_>>(), [0, 1, 2, 3]);

    lane.push(ChangeKind::Remove, 4, 4, 0);
    assert_eq!(lane.read(0), Err(LaneError::Gap { missed: 1 }));

    let newest = lane.read(4).unwrap();
    assert_eq!(newest.kind, ChangeKind::Remove);
    assert_eq!(newest.slot, 4);
    // The overwritten record is replaced as a whole.
    assert_eq!(words[0].load(Ordering::Relaxed), 10);

    let mut tail = Vec::new();
    assert_eq!(lane.collect_since(1, &mut tail), Ok(5));
    assert_eq!(tail.len(), 4);
}

#[test]
fn reattach_sees_published_records() {
    let cursor = AtomicU64::new(0);
    let words = crate::region::<64>();

    {
        let lane = Lane::new(words, &cursor).unwrap();
        lane.push(ChangeKind::Insert, 1, 2, 10);
        lane.push(ChangeKind::Update, 1, 4, 11);
    }

    let lane = Lane::new(words, &cursor).unwrap();
    assert_eq!(lane.cursor(), 2);
    assert_eq!(lane.read(1).unwrap().counter, 4);
    assert_eq!(Lane::new(&words[..3], &cursor).err(), Some(LaneError::UnfittingLayout));
}
