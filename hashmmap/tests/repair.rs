//! Damage left behind by writers that died while holding the structural lock.
use fs2::FileExt as _;
use hashmmap::{Error, HeaderView, Store, StoreOptions};
use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::Path;

const SLOT: u64 = 64;
const BEFORE: u64 = 0;
const KEY_OFFSET: u64 = 16;
const AFTER: u64 = 40;
const NUM_ENTRIES: u64 = 32;

fn poke(path: &Path, at: u64, value: u64) {
    let file = OpenOptions::new().write(true).open(path).unwrap();
    file.write_at(&value.to_ne_bytes(), at).unwrap();
}

fn populated(dir: &Path) -> HeaderView {
    let mut store = Store::create(Some(dir), &StoreOptions::default()).unwrap();
    store.add(b"a", b"1").unwrap();
    store.add(b"b", b"2").unwrap();
    store.add(b"c", b"3").unwrap();
    store.header().unwrap()
}

#[test]
fn torn_entry_with_intact_records_is_kept() {
    let dir = tempfile::tempdir().unwrap();
    populated(dir.path());
    let [_, _, entries, _] = Store::section_paths(dir.path());

    // Died after opening slot 1, all payload words are still the committed ones.
    poke(&entries, SLOT + BEFORE, 5);
    poke(&entries, SLOT + AFTER, 5);

    let mut store = Store::create(Some(dir.path()), &StoreOptions::default()).unwrap();
    assert_eq!(store.len(), 3);
    assert_eq!(store.find(b"b").unwrap().unwrap().value, b"2");
    assert_eq!(store.find(b"b").unwrap().unwrap().counter, 6);
}

#[test]
fn torn_entry_with_garbage_is_vacated() {
    let dir = tempfile::tempdir().unwrap();
    populated(dir.path());
    let [_, _, entries, _] = Store::section_paths(dir.path());

    poke(&entries, BEFORE, 3);
    poke(&entries, KEY_OFFSET, 0xffff_0000);
    poke(&entries, AFTER, 3);

    let mut store = Store::create(Some(dir.path()), &StoreOptions::default()).unwrap();
    assert_eq!(store.find(b"a").unwrap(), None);
    assert_eq!(store.len(), 2);

    let header = store.header().unwrap();
    assert_eq!(header.free_head, Some(0));
    assert_eq!(header.num_entries, 2);

    // The vacated slot is the next one handed out.
    let handle = store.add(b"d", b"4").unwrap();
    assert_eq!(handle.slot(), 0);
    assert_eq!(store.find(b"c").unwrap().unwrap().value, b"3");
}

#[test]
fn entry_count_is_recomputed() {
    let dir = tempfile::tempdir().unwrap();
    populated(dir.path());
    let [header, ..] = Store::section_paths(dir.path());

    poke(&header, NUM_ENTRIES, 17);

    let store = Store::create(Some(dir.path()), &StoreOptions::default()).unwrap();
    assert_eq!(store.len(), 3);
}

#[test]
fn broken_free_list_is_rebuilt() {
    let dir = tempfile::tempdir().unwrap();
    {
        let mut store = Store::create(Some(dir.path()), &StoreOptions::default()).unwrap();
        for key in [b"a", b"b", b"c", b"d"] {
            store.add(key, b"").unwrap();
        }
        store.remove(b"b").unwrap();
        store.remove(b"d").unwrap();
        assert_eq!(store.header().unwrap().free_head, Some(3));
    }

    // Lose the head of the free list, as if a release died before publishing it.
    let [header, ..] = Store::section_paths(dir.path());
    poke(&header, 64, u64::MAX);

    let mut store = Store::create(Some(dir.path()), &StoreOptions::default()).unwrap();
    let header = store.header().unwrap();
    assert_eq!(header.free_head, Some(1));

    let mut reused: Vec<_> = (0..2u8)
        .map(|i| store.add(&[i], b"").unwrap().slot())
        .collect();
    reused.sort();
    assert_eq!(reused, [1, 3]);
    assert_eq!(store.header().unwrap().slot_end, 4);
}

#[test]
fn open_handle_mends_torn_entry_on_write() {
    let dir = tempfile::tempdir().unwrap();
    let mut store = Store::create(Some(dir.path()), &StoreOptions::default()).unwrap();
    store.add(b"k", b"1").unwrap();
    let [_, _, entries, _] = Store::section_paths(dir.path());

    // Another handle died halfway through a write of slot 0.
    poke(&entries, BEFORE, 5);
    poke(&entries, AFTER, 5);

    let handle = store.add(b"k", b"2").unwrap();
    assert_eq!(handle.slot(), 0);
    assert_eq!(store.find(b"k").unwrap().unwrap().value, b"2");
    assert_eq!(store.len(), 1);
}

#[test]
fn open_handle_vacates_torn_garbage() {
    let dir = tempfile::tempdir().unwrap();
    let options = StoreOptions::default();
    let mut store = Store::create(Some(dir.path()), &options).unwrap();
    let mut other = Store::create(Some(dir.path()), &options).unwrap();
    store.add(b"k", b"1").unwrap();
    store.add(b"j", b"1").unwrap();
    assert_eq!(other.find(b"k").unwrap().unwrap().value, b"1");
    let [_, _, entries, _] = Store::section_paths(dir.path());

    poke(&entries, BEFORE, 3);
    poke(&entries, KEY_OFFSET, 0xffff_0000);
    poke(&entries, AFTER, 3);

    assert!(!store.remove(b"k").unwrap());
    let header = store.header().unwrap();
    assert_eq!(header.num_entries, 1);
    assert_eq!(header.free_head, Some(0));

    // The other handle learns of the vacated slot through the lane.
    assert_eq!(other.find(b"k").unwrap(), None);
    assert_eq!(other.add(b"k", b"2").unwrap().slot(), 0);
    assert_eq!(store.find(b"k").unwrap().unwrap().value, b"2");
    assert_eq!(store.find(b"j").unwrap().unwrap().value, b"1");
}

#[test]
fn lookup_mends_torn_entry_when_nobody_writes() {
    let dir = tempfile::tempdir().unwrap();
    populated(dir.path());
    let mut store = Store::create(Some(dir.path()), &StoreOptions::default()).unwrap();
    let [_, _, entries, _] = Store::section_paths(dir.path());

    poke(&entries, SLOT + BEFORE, 5);
    poke(&entries, SLOT + AFTER, 5);

    let record = store.find(b"b").unwrap().unwrap();
    assert_eq!(record.value, b"2");
    assert_eq!(record.counter, 6);
}

#[test]
fn read_conflict_clears_once_the_writer_is_done() {
    let dir = tempfile::tempdir().unwrap();
    populated(dir.path());
    let mut store = Store::create(Some(dir.path()), &StoreOptions::default()).unwrap();
    let [header, _, entries, _] = Store::section_paths(dir.path());

    // A live writer in the middle of updating slot 1.
    let writer = File::open(&header).unwrap();
    writer.lock_exclusive().unwrap();
    poke(&entries, SLOT + BEFORE, 3);
    poke(&entries, SLOT + AFTER, 3);

    let err = store.find(b"b").unwrap_err();
    assert!(matches!(err, Error::ReadConflict { slot: 1 }), "{err}");
    assert!(err.is_transient());

    poke(&entries, SLOT + AFTER, 4);
    poke(&entries, SLOT + BEFORE, 4);
    fs2::FileExt::unlock(&writer).unwrap();

    let record = store.find(b"b").unwrap().unwrap();
    assert_eq!(record.value, b"2");
    assert_eq!(record.counter, 4);
}
