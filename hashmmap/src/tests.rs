use crate::{
    filesystem_type, Error, KeyFns, LanePoll, Metrics, Store, StoreOptions, CAPACITY_INCREMENT,
};
use std::sync::{Arc, Mutex};

fn anonymous() -> Store {
    Store::create(None, &StoreOptions::default()).expect("to create an anonymous store")
}

fn value_of(store: &mut Store, key: &[u8]) -> Option<Vec<u8>> {
    store.find(key).unwrap().map(|record| record.value)
}

#[test]
fn add_then_find() {
    let options = StoreOptions {
        buckets: 128,
        ..StoreOptions::default()
    };

    let mut store = Store::create(None, &options).unwrap();
    assert!(store.is_empty());

    store.add(b"alice", b"30").unwrap();
    let record = store.find(b"alice").unwrap().expect("just added");
    assert_eq!(record.key, b"alice");
    assert_eq!(record.value, b"30");
    assert_eq!(record.counter % 2, 0);
    assert!(record.reference_time >= record.update_time);

    assert_eq!(store.find(b"bob").unwrap(), None);
    assert_eq!(store.len(), 1);
}

#[test]
fn re_add_updates_in_place() {
    let mut store = anonymous();
    let first = store.add(b"alice", b"30").unwrap();
    let second = store.add(b"alice", b"31").unwrap();

    assert_eq!(first, second);
    assert_eq!(store.len(), 1);
    assert_eq!(value_of(&mut store, b"alice").unwrap(), b"31");

    let header = store.header().unwrap();
    // key, first value, second value; each a record head and one padded word.
    assert_eq!(header.var_end, 3 * 24);
    assert_eq!(header.slot_end, 1);
}

#[test]
fn remove_frees_the_slot() {
    let mut store = anonymous();
    assert!(!store.remove(b"bob").unwrap());
    let before = store.header().unwrap();

    let bob = store.add(b"bob", b"1").unwrap();
    store.add(b"carol", b"2").unwrap();
    assert!(store.remove(b"bob").unwrap());
    assert_eq!(store.find(b"bob").unwrap(), None);
    assert_eq!(store.get(bob).unwrap(), None);
    assert_eq!(store.len(), 1);
    assert_eq!(store.header().unwrap().free_head, Some(bob.slot()));

    // The slot is reused before the table is extended.
    let dave = store.add(b"dave", b"3").unwrap();
    assert_eq!(dave, bob);
    assert_eq!(store.header().unwrap().slot_end, 2);
    assert_eq!(store.header().unwrap().free_head, None);
    assert_eq!(value_of(&mut store, b"carol").unwrap(), b"2");

    assert_eq!(before.num_entries, 0);
    assert_eq!(before.lane_cursor, 0);
}

#[test]
fn empty_keys_and_values() {
    let mut store = anonymous();
    store.add(b"", b"").unwrap();
    store.add(b"k", b"").unwrap();

    assert_eq!(value_of(&mut store, b"").unwrap(), b"");
    assert_eq!(value_of(&mut store, b"k").unwrap(), b"");
    assert_eq!(store.len(), 2);
}

fn constant_hash(_: &[u8], _: usize) -> usize {
    0
}

#[test]
fn collisions_are_told_apart_by_key() {
    let options = StoreOptions {
        buckets: 8,
        keys: KeyFns {
            hash: constant_hash,
            ..KeyFns::default()
        },
        ..StoreOptions::default()
    };

    let mut store = Store::create(None, &options).unwrap();
    for i in 0..32u32 {
        store.add(&i.to_le_bytes(), &(i * 2).to_le_bytes()).unwrap();
    }

    assert_eq!(store.len(), 32);
    for i in 0..32u32 {
        let value = value_of(&mut store, &i.to_le_bytes()).unwrap();
        assert_eq!(value, (i * 2).to_le_bytes());
    }

    store.add(&7u32.to_le_bytes(), b"seven").unwrap();
    assert_eq!(store.len(), 32);
    assert!(store.remove(&3u32.to_le_bytes()).unwrap());
    assert_eq!(value_of(&mut store, &7u32.to_le_bytes()).unwrap(), b"seven");
    assert_eq!(value_of(&mut store, &3u32.to_le_bytes()), None);
}

#[test]
fn table_growth_keeps_handles() {
    let mut store = anonymous();
    let first = store.add(b"first", b"value").unwrap();
    assert_eq!(store.header().unwrap().max_entries, CAPACITY_INCREMENT);

    for i in 0..CAPACITY_INCREMENT {
        store.add(&i.to_le_bytes(), &i.to_be_bytes()).unwrap();
    }

    let header = store.header().unwrap();
    assert_eq!(header.max_entries, 2 * CAPACITY_INCREMENT);
    assert_eq!(header.num_entries, CAPACITY_INCREMENT + 1);

    let record = store.get(first).unwrap().expect("still there");
    assert_eq!(record.key, b"first");
    assert_eq!(record.value, b"value");

    let last = CAPACITY_INCREMENT - 1;
    assert_eq!(
        value_of(&mut store, &last.to_le_bytes()).unwrap(),
        last.to_be_bytes()
    );
}

#[test]
fn zero_buckets_are_rejected() {
    let options = StoreOptions {
        buckets: 0,
        ..StoreOptions::default()
    };

    assert!(matches!(
        Store::create(None, &options),
        Err(Error::InvalidOptions(_))
    ));
}

#[derive(Clone, Default)]
struct Recorder(Arc<Mutex<Vec<(&'static str, u64)>>>);

impl Metrics for Recorder {
    fn gauge(&mut self, name: &'static str, value: u64) {
        self.0.lock().unwrap().push((name, value));
    }

    fn histogram(&mut self, name: &'static str, sample: u64) {
        self.0.lock().unwrap().push((name, sample));
    }
}

#[test]
fn mutations_report_metrics() {
    let recorder = Recorder::default();
    let mut store = anonymous();
    store.set_metrics(Box::new(recorder.clone()));

    store.add(b"key", b"twelve bytes").unwrap();
    let seen = recorder.0.lock().unwrap().clone();
    assert_eq!(
        seen,
        [("entries", 1), ("heap_end", 24 + 32), ("value_bytes", 12)]
    );

    recorder.0.lock().unwrap().clear();
    store.remove(b"key").unwrap();
    let seen = recorder.0.lock().unwrap().clone();
    assert_eq!(seen[0], ("entries", 0));
}

#[test]
fn lane_reports_changes_and_gaps() {
    let mut store = anonymous();
    store.add(b"a", b"1").unwrap();
    store.add(b"a", b"2").unwrap();
    store.remove(b"a").unwrap();

    let LanePoll::Changes { changes, next } = store.changes_since(0).unwrap() else {
        panic!("no gap expected");
    };
    assert_eq!(next, 3);

    use crate::ChangeKind::*;
    let kinds: Vec<_> = changes.iter().map(|c| c.kind).collect();
    assert_eq!(kinds, [Insert, Update, Remove]);
    assert!(changes.iter().all(|c| c.slot == 0));
    assert!(changes.windows(2).all(|w| w[0].counter < w[1].counter));

    // 4096 bytes hold 128 records.
    for i in 0..200u32 {
        store.add(&i.to_le_bytes(), b"").unwrap();
    }

    assert_eq!(store.lane_cursor().unwrap(), 203);
    assert_eq!(
        store.changes_since(0).unwrap(),
        LanePoll::Gap {
            missed: 75,
            resume: 75
        }
    );

    let LanePoll::Changes { changes, next } = store.changes_since(75).unwrap() else {
        panic!("no gap expected");
    };
    assert_eq!(changes.len(), 128);
    assert_eq!(next, 203);
}

#[test]
fn handles_follow_each_other() {
    let dir = tempfile::tempdir().unwrap();
    let options = StoreOptions::default();
    let mut a = Store::create(Some(dir.path()), &options).unwrap();
    let mut b = Store::create(Some(dir.path()), &options).unwrap();

    a.add(b"shared", b"from a").unwrap();
    assert_eq!(value_of(&mut b, b"shared").unwrap(), b"from a");

    // The second handle must update, not insert a duplicate.
    b.add(b"shared", b"from b").unwrap();
    assert_eq!(a.len(), 1);
    assert_eq!(value_of(&mut a, b"shared").unwrap(), b"from b");

    assert!(a.remove(b"shared").unwrap());
    assert_eq!(b.find(b"shared").unwrap(), None);
    assert!(!b.remove(b"shared").unwrap());

    a.header_extension()[0].store(42, std::sync::atomic::Ordering::Relaxed);
    assert_eq!(
        b.header_extension()[0].load(std::sync::atomic::Ordering::Relaxed),
        42
    );
}

#[test]
fn lagging_handle_rescans() {
    let dir = tempfile::tempdir().unwrap();
    let options = StoreOptions::default();
    let mut a = Store::create(Some(dir.path()), &options).unwrap();
    let mut b = Store::create(Some(dir.path()), &options).unwrap();

    // More than the lane holds, and enough to grow the heap a few times.
    for i in 0..1000u32 {
        a.add(&i.to_le_bytes(), &[i as u8; 100]).unwrap();
    }

    b.refresh().unwrap();
    for i in (0..1000u32).step_by(97) {
        assert_eq!(value_of(&mut b, &i.to_le_bytes()).unwrap(), [i as u8; 100]);
    }

    b.add(&5u32.to_le_bytes(), b"five").unwrap();
    assert_eq!(b.len(), 1000);
}

#[test]
fn missing_directory_is_created() {
    let dir = tempfile::tempdir().unwrap();
    let nested = dir.path().join("a/b");
    let mut store = Store::create(Some(nested.as_path()), &StoreOptions::default()).unwrap();
    store.add(b"x", b"1").unwrap();

    for path in Store::section_paths(&nested) {
        assert!(path.is_file(), "{path:?}");
    }
}

#[test]
fn uncreatable_directory() {
    let file = tempfile::NamedTempFile::new().unwrap();
    let below_file = file.path().join("store");

    assert!(matches!(
        Store::create(Some(below_file.as_path()), &StoreOptions::default()),
        Err(Error::CreateDirectory { .. })
    ));
}

#[test]
fn rejected_filesystem_creates_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let options = StoreOptions {
        rejected_filesystems: vec![filesystem_type(dir.path()).unwrap()],
        ..StoreOptions::default()
    };

    let err = Store::create(Some(dir.path()), &options).err().expect("rejected");
    assert!(matches!(err, Error::RemoteFilesystem { .. }), "{err}");

    for path in Store::section_paths(dir.path()) {
        assert!(!path.exists(), "{path:?}");
    }
}

#[test]
fn anonymous_stores_are_private() {
    let mut a = anonymous();
    let mut b = anonymous();
    a.add(b"key", b"a").unwrap();

    assert_eq!(b.find(b"key").unwrap(), None);
    assert!(a.path().is_none());
    a.flush().unwrap();
}
