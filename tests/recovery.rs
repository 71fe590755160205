use lodestore::{Config, Store};
use tempfile::tempdir;

fn key(i: u32) -> Vec<u8> {
    format!("key-{:08}", i).into_bytes()
}

fn value(i: u32) -> Vec<u8> {
    format!("value-{:08}", i).into_bytes()
}

fn config(path: std::path::PathBuf) -> Config {
    Config {
        path,
        max_page_items: 64,
        min_page_items: 4,
        max_delta_chain_len: 16,
        max_page_segments: 4,
        flush_buffer_size: 256 * 1024,
        auto_cleaner: false,
        auto_swapper: false,
        ..Config::default()
    }
}

#[test]
fn write_sync_and_recover() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("db");

    {
        let store = Store::open(config(path.clone())).unwrap();
        let mut writer = store.new_writer();
        for i in 0..1000u32 {
            writer.insert(&key(i), &value(i)).unwrap();
        }
        store.sync(true);
        store.close().unwrap();
    }

    let store = Store::open(config(path)).unwrap();
    let mut writer = store.new_writer();
    for i in 0..1000u32 {
        assert_eq!(
            writer.lookup(&key(i)).unwrap().as_deref(),
            Some(&value(i)[..]),
            "key {} lost across recovery",
            i
        );
    }
    assert!(
        store.stats().num_pages >= 16,
        "1000 items over 64-item pages should recover many pages"
    );
    store.close().unwrap();
}

#[test]
fn recovery_replays_overwrites_and_deletes() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("db");

    {
        let store = Store::open(config(path.clone())).unwrap();
        let mut writer = store.new_writer();
        for i in 0..200u32 {
            writer.insert(&key(i), &value(i)).unwrap();
        }
        for i in 0..200u32 {
            if i % 2 == 0 {
                writer.insert(&key(i), b"rewritten").unwrap();
            }
        }
        for i in 0..200u32 {
            if i % 5 == 0 {
                writer.delete(&key(i)).unwrap();
            }
        }
        store.sync(true);
        store.close().unwrap();
    }

    let store = Store::open(config(path)).unwrap();
    let mut writer = store.new_writer();
    for i in 0..200u32 {
        let expected: Option<Vec<u8>> = if i % 5 == 0 {
            None
        } else if i % 2 == 0 {
            Some(b"rewritten".to_vec())
        } else {
            Some(value(i))
        };
        assert_eq!(
            writer.lookup(&key(i)).unwrap().as_deref(),
            expected.as_deref(),
            "key {} wrong after recovery",
            i
        );
    }
    store.close().unwrap();
}

#[test]
fn commit_boundary_bounds_the_damage() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("db");

    {
        let store = Store::open(config(path.clone())).unwrap();
        let mut writer = store.new_writer();
        writer.insert(b"a", b"1").unwrap();
        writer.insert(b"b", b"2").unwrap();
        store.sync(true);
        writer.insert(b"c", b"3").unwrap();
        // Crash: the store is dropped without close, discarding the
        // unflushed buffer and never committing.
        drop(writer);
        drop(store);
    }

    let store = Store::open(config(path)).unwrap();
    let mut writer = store.new_writer();
    assert_eq!(writer.lookup(b"a").unwrap().as_deref(), Some(&b"1"[..]));
    assert_eq!(writer.lookup(b"b").unwrap().as_deref(), Some(&b"2"[..]));
    // The uncommitted insert may or may not have reached the log; the
    // store must be consistent either way.
    let c = writer.lookup(b"c").unwrap();
    assert!(c.is_none() || c.as_deref() == Some(&b"3"[..]));
    writer.insert(b"d", b"4").unwrap();
    assert_eq!(writer.lookup(b"d").unwrap().as_deref(), Some(&b"4"[..]));
    store.close().unwrap();
}

#[test]
fn repeated_reopen_is_idempotent() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("db");

    {
        let store = Store::open(config(path.clone())).unwrap();
        let mut writer = store.new_writer();
        for i in 0..300u32 {
            writer.insert(&key(i), &value(i)).unwrap();
        }
        store.close().unwrap();
    }

    // Opening twice without writes replays the same log both times and
    // must land on the same state.
    let pages_first = {
        let store = Store::open(config(path.clone())).unwrap();
        let pages = store.stats().num_pages;
        store.close().unwrap();
        pages
    };

    let store = Store::open(config(path)).unwrap();
    assert_eq!(store.stats().num_pages, pages_first);
    let mut writer = store.new_writer();
    for i in 0..300u32 {
        assert_eq!(
            writer.lookup(&key(i)).unwrap().as_deref(),
            Some(&value(i)[..])
        );
    }
    store.close().unwrap();
}

#[test]
fn snapshot_watermark_survives_recovery() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("db");

    let rp = {
        let store = Store::open(config(path.clone())).unwrap();
        let mut writer = store.new_writer();
        writer.insert(b"k", b"v1").unwrap();
        let rp = store.create_recovery_point(b"marker").unwrap();
        writer.insert(b"k", b"v2").unwrap();
        store.close().unwrap();
        rp
    };

    let store = Store::open(config(path)).unwrap();
    let rps = store.recovery_points();
    assert_eq!(rps, vec![rp.clone()]);

    // Rolling back to the recovered point hides the later version.
    store.rollback(&rp).unwrap();
    let mut writer = store.new_writer();
    assert_eq!(writer.lookup(b"k").unwrap().as_deref(), Some(&b"v1"[..]));
    store.close().unwrap();
}

#[test]
fn merged_pages_stay_merged_after_recovery() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("db");

    let pages_before;
    {
        let store = Store::open(Config {
            max_page_items: 16,
            min_page_items: 4,
            ..config(path.clone())
        })
        .unwrap();
        let mut writer = store.new_writer();
        for i in 0..256u32 {
            writer.insert(&key(i), &value(i)).unwrap();
        }
        for i in 0..256u32 {
            if i % 32 != 0 {
                writer.delete(&key(i)).unwrap();
            }
        }
        writer.compact_all().unwrap();
        pages_before = store.stats().num_pages;
        store.close().unwrap();
    }

    let store = Store::open(Config {
        max_page_items: 16,
        min_page_items: 4,
        ..config(path)
    })
    .unwrap();
    assert!(
        store.stats().num_pages <= pages_before,
        "recovery resurrected removed pages"
    );
    let mut writer = store.new_writer();
    for i in 0..256u32 {
        let expected = if i % 32 == 0 { Some(value(i)) } else { None };
        assert_eq!(
            writer.lookup(&key(i)).unwrap().as_deref(),
            expected.as_deref()
        );
    }
    store.close().unwrap();
}
