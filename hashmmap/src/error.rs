use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Result type for store operations.
pub type Result<T> = core::result::Result<T, Error>;

/// Errors of setting up or operating a store.
///
/// Absent keys are not errors, lookups report them as `None`.
#[derive(Debug, Error)]
pub enum Error {
    /// The store directory did not exist and could not be created.
    #[error("could not create directory {path}: {source}")]
    CreateDirectory {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// The store directory exists but we may not work inside it.
    #[error("could not access directory {path}: {source}")]
    InaccessibleDirectory {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// The directory or a section lives on a filesystem type we do not map, such as NFS.
    #[error("{path} is on a rejected filesystem (type {fs_type:#x})")]
    RemoteFilesystem { path: PathBuf, fs_type: i64 },

    /// The header belongs to another format, or is garbage.
    #[error("foreign or corrupt header, magic {found:#x}")]
    BadMagic { found: u64 },

    /// The store was created with different section sizes.
    #[error("{section} size mismatch: store has {stored}, requested {requested}")]
    SizeMismatch {
        section: &'static str,
        stored: u64,
        requested: u64,
    },

    #[error("invalid options: {0}")]
    InvalidOptions(&'static str),

    /// Mapping a section failed, usually address space or memory exhaustion.
    #[error("could not map {section}: {source}")]
    Map {
        section: &'static str,
        #[source]
        source: io::Error,
    },

    /// Extending a section failed. Nothing of the store changed.
    #[error("could not grow {section} to {len} bytes: {source}")]
    Grow {
        section: &'static str,
        len: u64,
        #[source]
        source: io::Error,
    },

    /// A writer kept an entry busy for the whole retry budget of a reader.
    ///
    /// Entries left torn by a writer that died are mended by the next operation that gets hold of
    /// the structural lock.
    #[error("entry {slot} stayed busy, retry the operation")]
    ReadConflict { slot: u64 },

    /// An internal invariant does not hold, the store must be considered corrupt.
    #[error("store corrupted: {0}")]
    Corrupt(String),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl Error {
    /// Whether repeating the whole operation may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::ReadConflict { .. })
    }

    pub(crate) fn corrupt(what: impl Into<String>) -> Self {
        Error::Corrupt(what.into())
    }
}
