use core::sync::atomic::{AtomicU64, Ordering};
use std::collections::hash_map::DefaultHasher;
use std::hash::Hasher;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use hmm_state::{Change, ChangeKind, Entry, Lane, LaneError};

use crate::header::{HeaderPage, HeaderView};
use crate::heap::{record_len, Heap};
use crate::index::HashIndex;
use crate::lock::StructuralLock;
use crate::metrics::{Metrics, NoMetrics};
use crate::segment::{self, round_section, Section, SectionKind};
use crate::table::{Table, CAPACITY_INCREMENT};
use crate::{Error, Result};

/// Selects a bucket in `0..buckets` for a key.
pub type HashFn = fn(&[u8], usize) -> usize;

/// Whether two keys are the same key.
pub type CompareFn = fn(&[u8], &[u8]) -> bool;

/// The caller supplied treatment of keys.
#[derive(Clone, Copy, Debug)]
pub struct KeyFns {
    pub hash: HashFn,
    pub compare: CompareFn,
}

/// Options of opening or creating a store.
///
/// Section sizes are rounded up to whole pages before they are compared with an existing store.
#[derive(Clone, Debug)]
pub struct StoreOptions {
    /// Buckets of the process-local index. May differ between processes.
    pub buckets: usize,
    pub header_size: usize,
    pub lane_size: usize,
    pub keys: KeyFns,
    /// `statfs` types the store refuses to live on.
    pub rejected_filesystems: Vec<i64>,
}

/// Stable name of an entry, its slot in the table.
///
/// Stays valid across table growth. After the entry is removed the slot may be reused by another
/// key.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct RecordHandle(u64);

/// A consistent copy of one entry.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Record {
    pub handle: RecordHandle,
    pub key: Vec<u8>,
    pub value: Vec<u8>,
    /// Microseconds since the epoch.
    pub update_time: u64,
    pub reference_time: u64,
    /// The even update counter this copy was taken at.
    pub counter: u64,
}

/// The result of polling the memory lane.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LanePoll {
    /// All changes from the requested position on, and the position to poll next.
    Changes { changes: Vec<Change>, next: u64 },
    /// The lane was overwritten past the requested position. Polling can resume at `resume`, but
    /// the `missed` changes are lost; rescan the store for a full picture.
    Gap { missed: u64, resume: u64 },
}

/// A handle onto one store.
///
/// Each handle owns its mappings and its private index. Several handles, in one process or many,
/// may work on the same directory at the same time.
pub struct Store {
    dir: Option<PathBuf>,
    keys: KeyFns,
    header: Section,
    lane: Section,
    table: Table,
    heap: Heap,
    index: HashIndex,
    lock: StructuralLock,
    /// The lane position up to which `index` reflects the table.
    lane_seen: u64,
    metrics: Box<dyn Metrics>,
}

/// The bucket of a key under the default `KeyFns`, SipHash with fixed keys.
pub fn default_hash(key: &[u8], buckets: usize) -> usize {
    let mut hasher = DefaultHasher::new();
    hasher.write(key);
    (hasher.finish() % buckets as u64) as usize
}

pub fn default_compare(a: &[u8], b: &[u8]) -> bool {
    a == b
}

impl KeyFns {
    fn bucket(&self, key: &[u8], buckets: usize) -> usize {
        // Do not trust the function with the range.
        (self.hash)(key, buckets) % buckets
    }
}

impl Default for KeyFns {
    fn default() -> Self {
        KeyFns {
            hash: default_hash,
            compare: default_compare,
        }
    }
}

impl Default for StoreOptions {
    fn default() -> Self {
        StoreOptions {
            buckets: 1024,
            header_size: 4096,
            lane_size: 4096,
            keys: KeyFns::default(),
            rejected_filesystems: segment::NETWORK_FILESYSTEMS.to_vec(),
        }
    }
}

impl RecordHandle {
    /// The handle of an arbitrary slot, for walking the table.
    pub fn new(slot: u64) -> Self {
        RecordHandle(slot)
    }

    pub fn slot(self) -> u64 {
        self.0
    }
}

impl Store {
    /// The files a store keeps in its directory.
    pub fn section_paths(dir: &Path) -> [PathBuf; 4] {
        SectionKind::ALL.map(|kind| dir.join(kind.file_name()))
    }

    /// Open the store in `dir`, creating it if needed, or create an anonymous store.
    ///
    /// An anonymous store is private to the handle and gone when it is dropped.
    pub fn create(dir: Option<&Path>, options: &StoreOptions) -> Result<Self> {
        if options.buckets == 0 {
            return Err(Error::InvalidOptions("bucket count must not be zero"));
        }

        let header_size = round_section(options.header_size.max(HeaderPage::FIXED_SIZE)) as u64;
        let lane_size = round_section(options.lane_size) as u64;

        if let Some(dir) = dir {
            segment::prepare_directory(dir, &options.rejected_filesystems)?;
        }

        let open = |kind| match dir {
            Some(dir) => Section::open(dir, kind, &options.rejected_filesystems),
            None => Section::anonymous(kind),
        };

        let mut header = open(SectionKind::Header)?;
        let mut lane = open(SectionKind::Lane)?;
        let mut entries = open(SectionKind::Entries)?;
        let mut keyval = open(SectionKind::KeyVal)?;

        let lock = StructuralLock::new(header.file())?;
        let mut metrics: Box<dyn Metrics> = Box::new(NoMetrics);
        let guard = lock.acquire(&mut *metrics)?;

        if header.file_len()? == 0 {
            header.reset_len(header_size)?;
        }

        let stored = header.file_len()?;
        if stored != header_size {
            return Err(Error::SizeMismatch {
                section: SectionKind::Header.name(),
                stored,
                requested: header_size,
            });
        }

        header.map(header_size)?;
        let page = HeaderPage::from_words(header.words())?;

        if page.is_initialized() {
            page.validate(header_size, lane_size)?;

            let stored = lane.file_len()?;
            if stored != lane_size {
                return Err(Error::SizeMismatch {
                    section: SectionKind::Lane.name(),
                    stored,
                    requested: lane_size,
                });
            }

            tracing::debug!(
                dir = ?dir,
                entries = page.num_entries(),
                capacity = page.max_entries(),
                "attaching to store"
            );
        } else {
            lane.reset_len(lane_size)?;
            entries.reset_len(CAPACITY_INCREMENT * hmm_state::ENTRY_SIZE as u64)?;
            keyval.reset_len(0)?;
            page.initialize(header_size, lane_size, CAPACITY_INCREMENT);
            tracing::debug!(dir = ?dir, header_size, lane_size, "initialized store");
        }

        let max_entries = page.max_entries();
        let var_end = page.var_end();

        lane.map(lane_size)?;
        let mut table = Table::new(entries);
        table.sync(max_entries)?;
        let mut heap = Heap::new(keyval);
        heap.sync(var_end)?;

        let mut store = Store {
            dir: dir.map(Path::to_owned),
            keys: options.keys,
            header,
            lane,
            table,
            heap,
            index: HashIndex::new(options.buckets),
            lock,
            lane_seen: 0,
            metrics,
        };

        store.rebuild(true)?;
        drop(guard);

        Ok(store)
    }

    /// Insert a key, or replace the value of an existing one.
    ///
    /// The structural lock is held for the whole call, from catching up with other handles over
    /// the lookup to the write. Two handles adding the same key thus never both insert it. The
    /// lock is released before returning.
    pub fn add(&mut self, key: &[u8], value: &[u8]) -> Result<RecordHandle> {
        let guard = self.lock.acquire(&mut *self.metrics)?;
        self.catch_up()?;

        let slot = match self.lookup_or_mend(key, true)? {
            Some((slot, entry)) => self.update(slot, entry, value)?,
            None => self.insert(key, value)?,
        };

        drop(guard);
        self.report(value.len());
        Ok(RecordHandle(slot))
    }

    /// Look up a key without waiting for any lock.
    ///
    /// Records the access in the entry's reference time.
    pub fn find(&mut self, key: &[u8]) -> Result<Option<Record>> {
        self.catch_up()?;

        let Some((slot, entry)) = self.lookup_or_mend(key, false)? else {
            return Ok(None);
        };

        // Heap bytes are never rewritten, the snapshot's value stays readable after any update.
        let value = self.heap.read(entry.val_offset, entry.val_size, slot)?;
        let cell = self.table.slot(slot)?;
        cell.touch(now_micros());

        Ok(Some(Record {
            handle: RecordHandle(slot),
            key: key.to_vec(),
            value,
            update_time: entry.update_time,
            reference_time: cell.reference_time(),
            counter: entry.counter,
        }))
    }

    /// Remove a key. Returns whether it was present.
    ///
    /// Like [`Store::add`], holds the structural lock for the whole call.
    pub fn remove(&mut self, key: &[u8]) -> Result<bool> {
        let guard = self.lock.acquire(&mut *self.metrics)?;
        self.catch_up()?;

        let Some((slot, _)) = self.lookup_or_mend(key, true)? else {
            return Ok(false);
        };

        let page = HeaderPage::from_words(self.header.words())?;
        let counter = self.table.release(page, slot)?;
        page.set_num_entries(page.num_entries().saturating_sub(1));
        self.index.unlink(slot);

        let now = now_micros();
        self.lane_seen = publish(&self.header, &self.lane, ChangeKind::Remove, slot, counter, now)?;
        tracing::trace!(slot, counter, "removed entry");

        drop(guard);
        self.report(0);
        Ok(true)
    }

    /// Read the entry behind a handle, `None` if the slot is vacant.
    pub fn get(&mut self, handle: RecordHandle) -> Result<Option<Record>> {
        self.sync_mappings()?;

        let slot = handle.0;
        if slot >= self.table.capacity() {
            return Ok(None);
        }

        let cell = self.table.slot(slot)?;
        let entry = cell.read().map_err(|_| Error::ReadConflict { slot })?;
        let reference_time = cell.reference_time();

        if entry.is_vacant() {
            return Ok(None);
        }

        let key = self.heap.read(entry.key_offset, entry.key_size, slot)?;
        let value = self.heap.read(entry.val_offset, entry.val_size, slot)?;

        Ok(Some(Record {
            handle,
            key,
            value,
            update_time: entry.update_time,
            reference_time,
            counter: entry.counter,
        }))
    }

    /// Live entries, as recorded in the header.
    pub fn len(&self) -> u64 {
        self.page().map_or(0, HeaderPage::num_entries)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn header(&self) -> Result<HeaderView> {
        Ok(self.page()?.view())
    }

    /// The words of the header section past the fixed header, free for user metadata.
    ///
    /// They are shared with every process attached to the store and persisted with it.
    pub fn header_extension(&self) -> &[AtomicU64] {
        HeaderPage::extension(self.header.words())
    }

    /// The directory of a file-backed store.
    pub fn path(&self) -> Option<&Path> {
        self.dir.as_deref()
    }

    /// The changes published from `position` on.
    pub fn changes_since(&self, position: u64) -> Result<LanePoll> {
        let lane = self.open_lane()?;
        let mut changes = Vec::new();

        match lane.collect_since(position, &mut changes) {
            Ok(next) => Ok(LanePoll::Changes { changes, next }),
            Err(LaneError::Gap { missed }) => Ok(LanePoll::Gap {
                missed,
                resume: lane.cursor().saturating_sub(lane.capacity()),
            }),
            Err(err) => Err(lane_error(err)),
        }
    }

    /// The next position of the memory lane.
    pub fn lane_cursor(&self) -> Result<u64> {
        Ok(self.open_lane()?.cursor())
    }

    /// Pick up changes of other processes into the private index.
    pub fn refresh(&mut self) -> Result<()> {
        self.catch_up()
    }

    /// Rebuild the private index from a full scan of the table.
    pub fn rescan(&mut self) -> Result<()> {
        self.sync_mappings()?;
        self.rebuild(false)
    }

    /// Write all sections back to their files.
    pub fn flush(&self) -> Result<()> {
        self.header.flush()?;
        self.lane.flush()?;
        self.table.section().flush()?;
        self.heap.section().flush()
    }

    /// Flush and close the handle. The store itself stays.
    pub fn destroy(self) -> Result<()> {
        self.flush()?;
        tracing::debug!(dir = ?self.dir, "closed store");
        Ok(())
    }

    pub fn set_metrics(&mut self, metrics: Box<dyn Metrics>) {
        self.metrics = metrics;
    }

    fn page(&self) -> Result<&HeaderPage> {
        HeaderPage::from_words(self.header.words())
    }

    fn open_lane(&self) -> Result<Lane<'_>> {
        let page = self.page()?;
        Lane::new(self.lane.words(), page.lane_cursor()).map_err(lane_error)
    }

    /// Follow growth of the table and heap by other processes.
    fn sync_mappings(&mut self) -> Result<()> {
        let page = HeaderPage::from_words(self.header.words())?;
        self.table.sync(page.max_entries())?;
        self.heap.sync(page.var_end())
    }

    /// Replay the lane into the index, or rescan when we fell too far behind.
    fn catch_up(&mut self) -> Result<()> {
        self.sync_mappings()?;
        self.replay()
    }

    /// The lane half of `catch_up`. Other handles may have grown the table since the mappings
    /// were synced.
    fn replay(&mut self) -> Result<()> {
        let mut changes = Vec::new();
        let collected = self.open_lane()?.collect_since(self.lane_seen, &mut changes);

        match collected {
            Ok(next) => {
                for change in changes {
                    self.apply(change)?;
                }

                self.lane_seen = next;
                Ok(())
            }
            Err(LaneError::Gap { missed }) => {
                tracing::debug!(missed, "lane overtook the index, rescanning");
                self.rebuild(false)
            }
            Err(err) => Err(lane_error(err)),
        }
    }

    /// Index the slot of a change as it is now, later changes of it are applied the same way.
    fn apply(&mut self, change: Change) -> Result<()> {
        let slot = change.slot;
        if slot >= self.table.capacity() {
            // The header announced the growth before the change was published.
            self.sync_mappings()?;
        }

        let entry = self
            .table
            .slot(slot)?
            .read()
            .map_err(|_| Error::ReadConflict { slot })?;

        self.index.unlink(slot);
        if entry.is_vacant() {
            return Ok(());
        }

        let key = self.heap.read(entry.key_offset, entry.key_size, slot)?;
        let bucket = self.keys.bucket(&key, self.index.buckets());
        self.index.insert(bucket, slot);
        Ok(())
    }

    /// Scan the whole table into a fresh index.
    ///
    /// With `repair`, which needs the structural lock, torn slots and allocator state left by a
    /// crashed writer are fixed on the way.
    fn rebuild(&mut self, repair: bool) -> Result<()> {
        let page = HeaderPage::from_words(self.header.words())?;
        // Changes after this point are replayed on the next catch up.
        let cursor = page.lane_cursor().load(Ordering::Acquire);
        let slot_end = page.slot_end();

        if slot_end > self.table.capacity() {
            // Grown by another handle, `max_entries` is raised before `slot_end`.
            self.table.sync(page.max_entries())?;
        }

        if slot_end > self.table.capacity() {
            return Err(Error::corrupt(format!(
                "{slot_end} slots in use exceed the capacity {}",
                self.table.capacity()
            )));
        }

        self.index.clear();
        let mut vacant = Vec::new();

        for slot in 0..slot_end {
            if repair && self.table.slot(slot)?.is_torn() {
                self.mend(slot)?;
            }

            let entry = self
                .table
                .slot(slot)?
                .read()
                .map_err(|_| Error::ReadConflict { slot })?;
            if entry.is_vacant() {
                vacant.push(slot);
                continue;
            }

            let key = self.heap.read(entry.key_offset, entry.key_size, slot)?;
            let bucket = self.keys.bucket(&key, self.index.buckets());
            self.index.insert(bucket, slot);
        }

        if repair {
            let consistent = self
                .table
                .free_list(page)
                .is_some_and(|list| list.len() == vacant.len());

            if !consistent {
                tracing::warn!(vacant = vacant.len(), "rebuilding free list");
                self.table.rebuild_free_list(page, &vacant)?;
            }

            let live = self.index.len() as u64;
            if page.num_entries() != live {
                tracing::warn!(recorded = page.num_entries(), live, "correcting entry count");
                page.set_num_entries(live);
            }
        }

        tracing::debug!(entries = self.index.len(), slot_end, "rebuilt index");
        self.lane_seen = cursor;
        Ok(())
    }

    /// Finish a slot left torn by a writer that died. Needs the structural lock.
    ///
    /// The entry is kept when both of its heap records still name the slot, otherwise it is
    /// vacated. The free list and the entry count are left to `rebuild`.
    fn mend(&self, slot: u64) -> Result<()> {
        let cell = self.table.slot(slot)?;
        let raw = cell.peek();
        let salvage = !raw.is_vacant()
            && raw.val_offset != Entry::NIL
            && self.heap.matches(raw.key_offset, slot, raw.key_size)
            && self.heap.matches(raw.val_offset, slot, raw.val_size);

        let (kind, entry) = if salvage {
            tracing::warn!(slot, counters = ?cell.counters(), "repaired torn entry");
            (ChangeKind::Update, raw)
        } else {
            tracing::warn!(slot, counters = ?cell.counters(), "vacated torn entry");
            (ChangeKind::Remove, Entry::vacant(Entry::NIL))
        };

        let counter = cell.write(&entry);
        publish(&self.header, &self.lane, kind, slot, counter, now_micros())?;
        Ok(())
    }

    /// `lookup`, mending the table when it runs into a slot torn by a dead writer.
    ///
    /// With `locked` the caller holds the structural lock. Otherwise the lock is only tried: while
    /// another handle holds it the conflict is its write in progress, and is returned as is.
    fn lookup_or_mend(&mut self, key: &[u8], locked: bool) -> Result<Option<(u64, Entry)>> {
        let slot = match self.lookup(key) {
            Err(Error::ReadConflict { slot }) => slot,
            found => return found,
        };

        let guard = if locked {
            None
        } else {
            match self.lock.try_acquire()? {
                Some(guard) => Some(guard),
                None => return Err(Error::ReadConflict { slot }),
            }
        };

        // No writer runs now. The slot is still torn only if its writer died.
        if self.table.slot(slot)?.is_torn() {
            self.rebuild(true)?;
        } else {
            self.catch_up()?;
        }

        let found = self.lookup(key);
        drop(guard);
        found
    }

    /// The slot holding `key`, with a consistent copy of its entry.
    fn lookup(&mut self, key: &[u8]) -> Result<Option<(u64, Entry)>> {
        let bucket = self.keys.bucket(key, self.index.buckets());
        let compare = self.keys.compare;
        let table = &self.table;
        let heap = &mut self.heap;
        let mut hit = None;

        let found = self.index.find(bucket, |slot| {
            let entry = table
                .slot(slot)?
                .read()
                .map_err(|_| Error::ReadConflict { slot })?;

            // Removed by another handle, we have not caught up yet.
            if entry.is_vacant() {
                return Ok(false);
            }

            let stored = heap.read(entry.key_offset, entry.key_size, slot)?;
            if compare(&stored, key) {
                hit = Some(entry);
                Ok(true)
            } else {
                Ok(false)
            }
        })?;

        Ok(found.zip(hit))
    }

    /// Point an existing entry at a new value. Needs the structural lock.
    fn update(&mut self, slot: u64, entry: Entry, value: &[u8]) -> Result<u64> {
        let page = HeaderPage::from_words(self.header.words())?;
        let at = page.var_end();
        let end = at + record_len(value.len());

        self.heap.reserve(end)?;
        let val_offset = self.heap.append(at, slot, value)?;
        page.set_var_end(end);

        let now = now_micros();
        let counter = self.table.slot(slot)?.write(&Entry {
            val_size: value.len() as u64,
            val_offset,
            update_time: now,
            ..entry
        });

        self.lane_seen = publish(&self.header, &self.lane, ChangeKind::Update, slot, counter, now)?;
        tracing::trace!(slot, counter, "updated entry");
        Ok(slot)
    }

    /// Store a new key. Needs the structural lock.
    fn insert(&mut self, key: &[u8], value: &[u8]) -> Result<u64> {
        let page = HeaderPage::from_words(self.header.words())?;

        let vacancy = match self.table.vacancy(page)? {
            Some(vacancy) => vacancy,
            None => {
                self.table.grow(page)?;
                self.table
                    .vacancy(page)?
                    .ok_or_else(|| Error::corrupt("no vacant slot after growing the table"))?
            }
        };

        let slot = vacancy.slot();
        let key_at = page.var_end();
        let val_at = key_at + record_len(key.len());
        let end = val_at + record_len(value.len());

        self.heap.reserve(end)?;
        let key_offset = self.heap.append(key_at, slot, key)?;
        let val_offset = self.heap.append(val_at, slot, value)?;
        page.set_var_end(end);

        self.table.claim(page, vacancy);
        let now = now_micros();
        let counter = self.table.slot(slot)?.write(&Entry {
            key_size: key.len() as u64,
            key_offset,
            val_size: value.len() as u64,
            val_offset,
            update_time: now,
            counter: 0,
        });
        page.set_num_entries(page.num_entries() + 1);

        let bucket = self.keys.bucket(key, self.index.buckets());
        self.index.insert(bucket, slot);

        self.lane_seen = publish(&self.header, &self.lane, ChangeKind::Insert, slot, counter, now)?;
        tracing::trace!(slot, counter, "inserted entry");
        Ok(slot)
    }

    fn report(&mut self, value_len: usize) {
        let Ok(view) = self.header() else {
            return;
        };

        self.metrics.gauge("entries", view.num_entries);
        self.metrics.gauge("heap_end", view.var_end);
        self.metrics.histogram("value_bytes", value_len as u64);
    }
}

/// Append a change to the lane, returning the position after it. Needs the structural lock.
fn publish(
    header: &Section,
    lane: &Section,
    kind: ChangeKind,
    slot: u64,
    counter: u64,
    time: u64,
) -> Result<u64> {
    let page = HeaderPage::from_words(header.words())?;
    let lane = Lane::new(lane.words(), page.lane_cursor()).map_err(lane_error)?;
    Ok(lane.push(kind, slot, counter, time) + 1)
}

fn lane_error(err: LaneError) -> Error {
    Error::corrupt(format!("memory lane: {err:?}"))
}

fn now_micros() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |since| since.as_micros() as u64)
}

#[cfg(test)]
fn filled_pair(dir: &Path) -> (Store, Store) {
    let options = StoreOptions::default();
    let mut a = Store::create(Some(dir), &options).unwrap();
    let mut b = Store::create(Some(dir), &options).unwrap();

    for i in 0..CAPACITY_INCREMENT {
        a.add(&i.to_le_bytes(), b"").unwrap();
    }

    b.refresh().unwrap();
    assert_eq!(b.table.capacity(), CAPACITY_INCREMENT);
    (a, b)
}

#[test]
fn replay_follows_growth_after_sync() {
    let dir = tempfile::tempdir().unwrap();
    let (mut a, mut b) = filled_pair(dir.path());

    // `b` looked at the header just before `a` grew the table.
    b.sync_mappings().unwrap();
    a.add(b"first of the second increment", b"x").unwrap();
    b.replay().unwrap();

    assert_eq!(b.table.capacity(), 2 * CAPACITY_INCREMENT);
    assert!(b.index.contains(CAPACITY_INCREMENT));
    let record = b.find(b"first of the second increment").unwrap().unwrap();
    assert_eq!(record.handle.slot(), CAPACITY_INCREMENT);
}

#[test]
fn rescan_follows_growth_after_sync() {
    let dir = tempfile::tempdir().unwrap();
    let (mut a, mut b) = filled_pair(dir.path());

    b.sync_mappings().unwrap();
    // More changes than the lane holds, `b` has to scan the table.
    for i in CAPACITY_INCREMENT..CAPACITY_INCREMENT + 200 {
        a.add(&i.to_le_bytes(), b"").unwrap();
    }
    b.replay().unwrap();

    assert_eq!(b.index.len() as u64, CAPACITY_INCREMENT + 200);
    assert_eq!(b.lane_seen, b.lane_cursor().unwrap());
}
