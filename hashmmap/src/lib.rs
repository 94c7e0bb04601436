//! A hash table of byte keys and values in memory-mapped files, shared between processes.
//!
//! A store is a directory of four sections: a header, the memory lane of change notifications, a
//! table of fixed-size entries, and an append-only heap of key and value bytes. Every handle keeps
//! its own index of the table and follows changes of other handles through the memory lane.
//!
//! ```no_run
//! use hashmmap::{Store, StoreOptions};
//! use std::path::Path;
//!
//! let dir = Path::new("/dev/shm/example");
//! let mut store = Store::create(Some(dir), &StoreOptions::default())?;
//! store.add(b"alice", b"30")?;
//! let record = store.find(b"alice")?.expect("just added");
//! assert_eq!(record.value, b"30");
//! # Ok::<_, hashmmap::Error>(())
//! ```
//!
//! Lookups never block. Inserts, updates and removals take an exclusive file lock on the header
//! for the duration of the change.
mod error;
mod header;
mod heap;
mod index;
mod lock;
mod metrics;
mod segment;
mod store;
mod table;
#[cfg(test)]
mod tests;

pub use error::{Error, Result};
pub use header::{HeaderView, LAYOUT_VERSION, MAGIC};
pub use heap::padded_len;
pub use metrics::{Metrics, NoMetrics};
pub use segment::{filesystem_type, round_section, NETWORK_FILESYSTEMS, SECTION_ALIGN};
pub use store::{
    default_compare, default_hash, CompareFn, HashFn, KeyFns, LanePoll, Record, RecordHandle,
    Store, StoreOptions,
};
pub use table::CAPACITY_INCREMENT;

pub use hmm_state::{Change, ChangeKind};
