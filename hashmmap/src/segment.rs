//! Files and mappings of the four sections of a store.
//!
//! A file-backed store is one directory with a file per section. An anonymous store backs each
//! section with a memfd instead, which behaves the same on growth but is private to the handle and
//! gone once it is dropped.
use core::sync::atomic::AtomicU64;
use std::ffi::CString;
use std::fs::{self, File, OpenOptions};
use std::io;
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};

use memfile::MemFile;
use memmap2::{MmapOptions, MmapRaw};

use crate::{Error, Result};

/// Granularity of the fixed-size sections.
pub const SECTION_ALIGN: usize = 4096;

/// Filesystem magic numbers we refuse to map, from `<linux/magic.h>`.
///
/// Shared mappings on these do not observe writes of other hosts, and often not even those of
/// other processes on the same host in any useful order.
pub const NETWORK_FILESYSTEMS: &[i64] = &[
    0x6969,      // NFS_SUPER_MAGIC
    0x517B,      // SMB_SUPER_MAGIC
    0xFE53_4D42, // SMB2_MAGIC_NUMBER
    0xFF53_4D42, // CIFS_MAGIC_NUMBER
    0x7372_7974, // CODA_SUPER_MAGIC
    0x5346_4141, // AFS_SUPER_MAGIC
    0x0102_1997, // V9FS_MAGIC
    0x6573_5546, // FUSE_SUPER_MAGIC
];

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum SectionKind {
    Header,
    Lane,
    Entries,
    KeyVal,
}

impl SectionKind {
    pub(crate) const ALL: [SectionKind; 4] = [
        SectionKind::Header,
        SectionKind::Lane,
        SectionKind::Entries,
        SectionKind::KeyVal,
    ];

    pub(crate) fn name(self) -> &'static str {
        match self {
            SectionKind::Header => "header",
            SectionKind::Lane => "memory lane",
            SectionKind::Entries => "entries",
            SectionKind::KeyVal => "keyval",
        }
    }

    pub(crate) fn file_name(self) -> &'static str {
        match self {
            SectionKind::Header => ".header",
            SectionKind::Lane => ".memlane",
            SectionKind::Entries => ".entries",
            SectionKind::KeyVal => ".keyval",
        }
    }
}

/// Round up to whole pages, with a minimum of one page.
pub fn round_section(size: usize) -> usize {
    size.max(1).div_ceil(SECTION_ALIGN) * SECTION_ALIGN
}

/// The `statfs` filesystem type of a path.
pub fn filesystem_type(path: &Path) -> io::Result<i64> {
    let c_path = CString::new(path.as_os_str().as_bytes())
        .map_err(|err| io::Error::new(io::ErrorKind::InvalidInput, err))?;

    let mut stat = core::mem::MaybeUninit::<libc::statfs>::zeroed();
    // Safety: passing a valid C string and the correct pointer to a struct of libc::statfs.
    if -1 == unsafe { libc::statfs(c_path.as_ptr(), stat.as_mut_ptr()) } {
        return Err(io::Error::last_os_error());
    }

    // Safety: always initialized on return with success.
    let stat = unsafe { stat.assume_init() };
    #[allow(clippy::unnecessary_cast)]
    Ok(stat.f_type as i64)
}

/// Reject paths on one of the `rejected` filesystem types.
///
/// A path whose filesystem can not be determined is rejected as well.
pub(crate) fn check_local(path: &Path, rejected: &[i64]) -> Result<()> {
    let fs_type = filesystem_type(path).map_err(|source| Error::InaccessibleDirectory {
        path: path.to_owned(),
        source,
    })?;

    if rejected.contains(&fs_type) {
        return Err(Error::RemoteFilesystem {
            path: path.to_owned(),
            fs_type,
        });
    }

    Ok(())
}

/// Make sure the store directory exists, is usable, and is local.
pub(crate) fn prepare_directory(dir: &Path, rejected: &[i64]) -> Result<()> {
    if !dir.exists() {
        fs::create_dir_all(dir).map_err(|source| Error::CreateDirectory {
            path: dir.to_owned(),
            source,
        })?;
    }

    let c_path = CString::new(dir.as_os_str().as_bytes()).map_err(|err| {
        Error::InaccessibleDirectory {
            path: dir.to_owned(),
            source: io::Error::new(io::ErrorKind::InvalidInput, err),
        }
    })?;

    // We must be able to traverse the directory and create the section files within.
    // Safety: passing a valid C string.
    if -1 == unsafe { libc::access(c_path.as_ptr(), libc::X_OK | libc::W_OK) } {
        return Err(Error::InaccessibleDirectory {
            path: dir.to_owned(),
            source: io::Error::last_os_error(),
        });
    }

    check_local(dir, rejected)
}

/// One section, its backing file and the current mapping of it.
pub(crate) struct Section {
    kind: SectionKind,
    file: File,
    /// `None` while nothing is mapped, a zero-length mapping is not possible.
    map: Option<MmapRaw>,
}

impl Section {
    /// Open or create the file of a section in a prepared directory.
    ///
    /// New files are left empty, sizing happens once the structural lock is held.
    pub(crate) fn open(dir: &Path, kind: SectionKind, rejected: &[i64]) -> Result<Self> {
        let path: PathBuf = dir.join(kind.file_name());

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;

        // The file may be a symlink or mount point to somewhere else entirely.
        check_local(&path, rejected)?;

        Ok(Section {
            kind,
            file,
            map: None,
        })
    }

    /// A section backed by anonymous, process-private memory.
    pub(crate) fn anonymous(kind: SectionKind) -> Result<Self> {
        let name = format!("hashmmap{}", kind.file_name());
        let file = MemFile::create_default(&name)?.into_file();

        Ok(Section {
            kind,
            file,
            map: None,
        })
    }

    pub(crate) fn file(&self) -> &File {
        &self.file
    }

    pub(crate) fn file_len(&self) -> Result<u64> {
        Ok(self.file.metadata()?.len())
    }

    /// The number of bytes currently mapped.
    pub(crate) fn mapped(&self) -> u64 {
        self.map.as_ref().map_or(0, |map| map.len() as u64)
    }

    /// Size the file of a store that is being initialized, dropping any previous contents past
    /// `len`. Nothing may be mapped.
    pub(crate) fn reset_len(&mut self, len: u64) -> Result<()> {
        debug_assert!(self.map.is_none());
        self.set_file_len(len)
    }

    /// Replace the mapping with one of `len` bytes.
    ///
    /// The file must already be at least that long. On failure the previous mapping stays.
    pub(crate) fn map(&mut self, len: u64) -> Result<()> {
        if len == 0 {
            self.map = None;
            return Ok(());
        }

        let map_err = |source| Error::Map {
            section: self.kind.name(),
            source,
        };

        let len = usize::try_from(len)
            .map_err(|_| map_err(io::Error::from(io::ErrorKind::OutOfMemory)))?;
        let map = MmapOptions::new()
            .len(len)
            .map_raw(&self.file)
            .map_err(map_err)?;

        self.map = Some(map);
        Ok(())
    }

    /// Map the whole file as it is now, it may have been grown by another process.
    pub(crate) fn map_file(&mut self) -> Result<()> {
        let len = self.file_len()?;
        self.map(len)
    }

    /// Extend the file to at least `len` bytes and map all of it.
    ///
    /// Existing bytes never move. On failure the previous mapping stays valid.
    pub(crate) fn grow(&mut self, len: u64) -> Result<()> {
        if self.file_len()? < len {
            self.set_file_len(len)?;
        }

        self.map(len)
    }

    pub(crate) fn flush(&self) -> Result<()> {
        if let Some(map) = &self.map {
            map.flush()?;
        }

        Ok(())
    }

    /// View the mapping as shared words.
    pub(crate) fn words(&self) -> &[AtomicU64] {
        let Some(map) = &self.map else {
            return &[];
        };

        // Safety: mappings are page aligned and we only hand out whole words. The types are full
        // atomics, meaning we do not have any uniqueness requirements on the pointer. The pages of
        // a mapped file are initialized memory, zero-filled on first access. The borrow of `self`
        // keeps the mapping alive.
        unsafe {
            &*core::ptr::slice_from_raw_parts(map.as_ptr() as *const AtomicU64, map.len() / 8)
        }
    }

    /// Copy bytes into the mapping.
    ///
    /// Callers guarantee no reader can reach the range yet, nothing else writes there.
    pub(crate) fn write_bytes(&self, offset: u64, bytes: &[u8]) -> Result<()> {
        let ptr = self.range_ptr(offset, bytes.len())?;
        // Safety: `range_ptr` checked the range is in-bounds of the live mapping.
        unsafe { core::ptr::copy_nonoverlapping(bytes.as_ptr(), ptr, bytes.len()) };
        Ok(())
    }

    /// Copy bytes out of the mapping.
    pub(crate) fn read_bytes(&self, offset: u64, len: usize) -> Result<Vec<u8>> {
        let ptr = self.range_ptr(offset, len)?;
        // Safety: `range_ptr` checked the range is in-bounds of the live mapping.
        let bytes = unsafe { core::slice::from_raw_parts(ptr as *const u8, len) };
        Ok(bytes.to_vec())
    }

    fn range_ptr(&self, offset: u64, len: usize) -> Result<*mut u8> {
        let end = offset.checked_add(len as u64);
        match (&self.map, end) {
            (Some(map), Some(end)) if end <= map.len() as u64 => {
                // Safety: in-bounds, checked just now.
                Ok(unsafe { map.as_mut_ptr().add(offset as usize) })
            }
            _ => Err(Error::corrupt(format!(
                "{} range {offset}+{len} outside of {} mapped bytes",
                self.kind.name(),
                self.mapped(),
            ))),
        }
    }

    fn set_file_len(&mut self, len: u64) -> Result<()> {
        self.file.set_len(len).map_err(|source| Error::Grow {
            section: self.kind.name(),
            len,
            source,
        })
    }
}
