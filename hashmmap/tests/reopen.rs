use hashmmap::{Error, Store, StoreOptions, MAGIC};
use std::fs::OpenOptions;
use std::os::unix::fs::FileExt;

#[test]
fn values_survive_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let options = StoreOptions {
        buckets: 128,
        ..StoreOptions::default()
    };

    let mut store = Store::create(Some(dir.path()), &options).unwrap();
    store.add(b"x", b"1").unwrap();
    store.add(b"y", b"2").unwrap();
    store.add(b"z", b"3").unwrap();
    store.destroy().unwrap();

    let mut store = Store::create(Some(dir.path()), &options).unwrap();
    assert_eq!(store.len(), 3);
    for (key, value) in [(b"x", b"1"), (b"y", b"2"), (b"z", b"3")] {
        let record = store.find(key).unwrap().expect("persisted");
        assert_eq!(record.value, value);
    }

    let header = store.header().unwrap();
    assert_eq!(header.magic, MAGIC);
    assert_eq!(header.slot_end, 3);
}

#[test]
fn bucket_count_may_change_between_opens() {
    let dir = tempfile::tempdir().unwrap();
    let mut store = Store::create(Some(dir.path()), &StoreOptions::default()).unwrap();
    for i in 0..100u32 {
        store.add(&i.to_le_bytes(), &i.to_be_bytes()).unwrap();
    }
    drop(store);

    let options = StoreOptions {
        buckets: 3,
        ..StoreOptions::default()
    };
    let mut store = Store::create(Some(dir.path()), &options).unwrap();
    for i in 0..100u32 {
        let record = store.find(&i.to_le_bytes()).unwrap().expect("persisted");
        assert_eq!(record.value, i.to_be_bytes());
    }
}

#[test]
fn size_mismatch_leaves_store_intact() {
    let dir = tempfile::tempdir().unwrap();
    let mut store = Store::create(Some(dir.path()), &StoreOptions::default()).unwrap();
    store.add(b"alice", b"30").unwrap();
    drop(store);

    let bigger_header = StoreOptions {
        header_size: 8192,
        ..StoreOptions::default()
    };
    let err = Store::create(Some(dir.path()), &bigger_header).err().expect("mismatch");
    assert!(
        matches!(
            err,
            Error::SizeMismatch {
                section: "header",
                stored: 4096,
                requested: 8192,
            }
        ),
        "{err}"
    );

    let bigger_lane = StoreOptions {
        lane_size: 5000,
        ..StoreOptions::default()
    };
    let err = Store::create(Some(dir.path()), &bigger_lane).err().expect("mismatch");
    assert!(
        matches!(
            err,
            Error::SizeMismatch {
                section: "memory lane",
                stored: 4096,
                requested: 8192,
            }
        ),
        "{err}"
    );

    // Sizes are compared after rounding.
    let rounded = StoreOptions {
        header_size: 100,
        lane_size: 4000,
        ..StoreOptions::default()
    };
    let mut store = Store::create(Some(dir.path()), &rounded).unwrap();
    assert_eq!(store.find(b"alice").unwrap().unwrap().value, b"30");
}

#[test]
fn foreign_header_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    drop(Store::create(Some(dir.path()), &StoreOptions::default()).unwrap());

    let [header, ..] = Store::section_paths(dir.path());
    let file = OpenOptions::new().write(true).open(header).unwrap();
    file.write_at(&0x1234_5678u64.to_ne_bytes(), 0).unwrap();

    let err = Store::create(Some(dir.path()), &StoreOptions::default())
        .err()
        .expect("foreign magic");
    assert!(matches!(err, Error::BadMagic { found: 0x1234_5678 }), "{err}");
}
