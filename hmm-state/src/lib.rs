//! Lock-free primitives over words of a shared memory region.
//!
//! Nothing in here maps memory, allocates or locks. The engine hands in `&[AtomicU64]` views of
//! its mapped sections and these types impose the persisted layout on them:
//!
//! - [`EntrySlot`] is one record of the entry table, read and written with the update-counter
//!   protocol. Readers never block, they retry on a concurrent write.
//! - [`Lane`] is the memory lane, a ring of change notifications fed by every mutation.
//!
//! ## Writers are serialized elsewhere
//!
//! Both protocols only make readers safe against a writer. Two writers of the same slot or of the
//! lane must be excluded by the caller, the engine does this with its structural lock. A writer
//! that stops half-way (a crashed process) leaves odd counters or an open mark behind, which
//! readers treat as a busy writer or an overwritten record respectively.
#![no_std]
mod ring;
mod seq;

pub use ring::{Change, ChangeKind, Lane, LaneError, LANE_RECORD_SIZE};
pub use seq::{Entry, EntrySlot, SnapshotError, ENTRY_SIZE, READ_RETRIES};

#[cfg(test)]
fn region<const N: usize>() -> &'static [core::sync::atomic::AtomicU64] {
    extern crate std;
    use core::sync::atomic::AtomicU64;
    use std::{boxed::Box, vec::Vec};

    let words: Vec<AtomicU64> = (0..N).map(|_| AtomicU64::new(0)).collect();
    Box::leak(words.into_boxed_slice())
}
