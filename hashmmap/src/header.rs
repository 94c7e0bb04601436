use core::sync::atomic::{AtomicU64, Ordering};

use hmm_state::Entry;

use crate::{Error, Result};

/// Identifies the layout of all four sections.
pub const MAGIC: u64 = 0x02_5205_1959;

/// Bumped on any incompatible change of the persisted layout.
pub const LAYOUT_VERSION: u64 = 1;

/// The persisted metadata record at the start of the header section.
///
/// All fields are written under the structural lock, except for `magic` which is also read without
/// it to detect an uninitialized store. Do not reorder, the layout is persisted.
#[repr(C)]
pub(crate) struct HeaderPage {
    magic: AtomicU64,
    version: AtomicU64,
    header_size: AtomicU64,
    lane_size: AtomicU64,
    num_entries: AtomicU64,
    max_entries: AtomicU64,
    var_end: AtomicU64,
    slot_end: AtomicU64,
    free_head: AtomicU64,
    lane_cursor: AtomicU64,
    _reserved: [AtomicU64; 22],
}

/// A copy of the header, for statistics and diagnostics.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct HeaderView {
    pub magic: u64,
    pub layout_version: u64,
    pub header_size: u64,
    pub lane_size: u64,
    /// Live entries in the table.
    pub num_entries: u64,
    /// Capacity of the entry table, in slots.
    pub max_entries: u64,
    /// The high-water mark of the key/value heap.
    pub var_end: u64,
    /// Slots at or past this index were never used.
    pub slot_end: u64,
    /// The first slot of the free list.
    pub free_head: Option<u64>,
    /// The next position of the memory lane.
    pub lane_cursor: u64,
}

impl HeaderPage {
    /// Bytes of the fixed record. The rest of the header section is free for users.
    pub(crate) const FIXED_SIZE: usize = 256;

    pub(crate) fn from_words(words: &[AtomicU64]) -> Result<&HeaderPage> {
        if words.len() * 8 < Self::FIXED_SIZE {
            return Err(Error::corrupt("header section smaller than the header record"));
        }

        // Safety: `HeaderPage` is `repr(C)` over only `AtomicU64` and we checked the length.
        Ok(unsafe { &*(words.as_ptr() as *const HeaderPage) })
    }

    /// The words following the fixed record.
    pub(crate) fn extension(words: &[AtomicU64]) -> &[AtomicU64] {
        words.get(Self::FIXED_SIZE / 8..).unwrap_or(&[])
    }

    pub(crate) fn is_initialized(&self) -> bool {
        self.magic.load(Ordering::Acquire) != 0
    }

    /// Write a fresh header. The magic goes last, a crash before leaves the store uninitialized.
    pub(crate) fn initialize(&self, header_size: u64, lane_size: u64, max_entries: u64) {
        self.version.store(LAYOUT_VERSION, Ordering::Relaxed);
        self.header_size.store(header_size, Ordering::Relaxed);
        self.lane_size.store(lane_size, Ordering::Relaxed);
        self.num_entries.store(0, Ordering::Relaxed);
        self.max_entries.store(max_entries, Ordering::Relaxed);
        self.var_end.store(0, Ordering::Relaxed);
        self.slot_end.store(0, Ordering::Relaxed);
        self.free_head.store(Entry::NIL, Ordering::Relaxed);
        self.lane_cursor.store(0, Ordering::Relaxed);
        self.magic.store(MAGIC, Ordering::Release);
    }

    /// Check an initialized header against the sizes a caller asks for.
    pub(crate) fn validate(&self, header_size: u64, lane_size: u64) -> Result<()> {
        let found = self.magic.load(Ordering::Acquire);
        if found != MAGIC {
            return Err(Error::BadMagic { found });
        }

        let version = self.version.load(Ordering::Relaxed);
        if version != LAYOUT_VERSION {
            return Err(Error::corrupt(format!("unsupported layout version {version}")));
        }

        let stored = self.header_size.load(Ordering::Relaxed);
        if stored != header_size {
            return Err(Error::SizeMismatch {
                section: "header",
                stored,
                requested: header_size,
            });
        }

        let stored = self.lane_size.load(Ordering::Relaxed);
        if stored != lane_size {
            return Err(Error::SizeMismatch {
                section: "memory lane",
                stored,
                requested: lane_size,
            });
        }

        Ok(())
    }

    pub(crate) fn view(&self) -> HeaderView {
        HeaderView {
            magic: self.magic.load(Ordering::Acquire),
            layout_version: self.version.load(Ordering::Relaxed),
            header_size: self.header_size.load(Ordering::Relaxed),
            lane_size: self.lane_size.load(Ordering::Relaxed),
            num_entries: self.num_entries(),
            max_entries: self.max_entries(),
            var_end: self.var_end(),
            slot_end: self.slot_end(),
            free_head: Some(self.free_head()).filter(|&head| head != Entry::NIL),
            lane_cursor: self.lane_cursor.load(Ordering::Acquire),
        }
    }

    pub(crate) fn lane_cursor(&self) -> &AtomicU64 {
        &self.lane_cursor
    }

    pub(crate) fn num_entries(&self) -> u64 {
        self.num_entries.load(Ordering::Acquire)
    }

    pub(crate) fn set_num_entries(&self, n: u64) {
        self.num_entries.store(n, Ordering::Release);
    }

    pub(crate) fn max_entries(&self) -> u64 {
        self.max_entries.load(Ordering::Acquire)
    }

    /// Publish a grown table. The section must already be extended.
    pub(crate) fn set_max_entries(&self, n: u64) {
        self.max_entries.store(n, Ordering::Release);
    }

    pub(crate) fn var_end(&self) -> u64 {
        self.var_end.load(Ordering::Acquire)
    }

    pub(crate) fn set_var_end(&self, end: u64) {
        self.var_end.store(end, Ordering::Release);
    }

    pub(crate) fn slot_end(&self) -> u64 {
        self.slot_end.load(Ordering::Acquire)
    }

    pub(crate) fn set_slot_end(&self, end: u64) {
        self.slot_end.store(end, Ordering::Release);
    }

    pub(crate) fn free_head(&self) -> u64 {
        self.free_head.load(Ordering::Acquire)
    }

    pub(crate) fn set_free_head(&self, head: u64) {
        self.free_head.store(head, Ordering::Release);
    }
}

#[test]
fn header_fits_its_record() {
    assert_eq!(core::mem::size_of::<HeaderPage>(), HeaderPage::FIXED_SIZE);
}

#[test]
fn initialize_then_validate() {
    let words: Vec<AtomicU64> = (0..512).map(|_| AtomicU64::new(0)).collect();
    let page = HeaderPage::from_words(&words).unwrap();
    assert!(!page.is_initialized());

    page.initialize(4096, 8192, 16384);
    assert!(page.is_initialized());
    page.validate(4096, 8192).unwrap();

    let view = page.view();
    assert_eq!(view.magic, MAGIC);
    assert_eq!(view.max_entries, 16384);
    assert_eq!(view.free_head, None);

    assert!(matches!(
        page.validate(4096, 4096),
        Err(Error::SizeMismatch {
            section: "memory lane",
            stored: 8192,
            requested: 4096,
        })
    ));

    words[0].store(0xdead, Ordering::Relaxed);
    assert!(matches!(page.validate(4096, 8192), Err(Error::BadMagic { found: 0xdead })));
    assert_eq!(HeaderPage::extension(&words).len(), 512 - 32);
}
