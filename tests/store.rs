use std::sync::Arc;
use std::thread;

use lodestore::{Config, Store};
use tempfile::tempdir;

fn key(i: u32) -> Vec<u8> {
    format!("key-{:08}", i).into_bytes()
}

fn value(i: u32) -> Vec<u8> {
    format!("value-{:08}", i).into_bytes()
}

fn small_page_config(path: std::path::PathBuf) -> Config {
    Config {
        path,
        max_page_items: 64,
        min_page_items: 4,
        max_delta_chain_len: 16,
        flush_buffer_size: 256 * 1024,
        auto_cleaner: false,
        auto_swapper: false,
        ..Config::default()
    }
}

#[test]
fn insert_lookup_delete() {
    let dir = tempdir().unwrap();
    let store = Store::open(small_page_config(dir.path().join("db"))).unwrap();
    let mut writer = store.new_writer();

    writer.insert(b"alpha", b"1").unwrap();
    writer.insert(b"beta", b"2").unwrap();
    assert_eq!(writer.lookup(b"alpha").unwrap().as_deref(), Some(&b"1"[..]));
    assert_eq!(writer.lookup(b"beta").unwrap().as_deref(), Some(&b"2"[..]));
    assert_eq!(writer.lookup(b"gamma").unwrap(), None);

    writer.delete(b"alpha").unwrap();
    assert_eq!(writer.lookup(b"alpha").unwrap(), None);
    assert_eq!(writer.lookup(b"beta").unwrap().as_deref(), Some(&b"2"[..]));

    store.close().unwrap();
}

#[test]
fn overwrite_returns_newest_value() {
    let dir = tempdir().unwrap();
    let store = Store::open(small_page_config(dir.path().join("db"))).unwrap();
    let mut writer = store.new_writer();

    for round in 0..5u32 {
        writer.insert(b"counter", round.to_string().as_bytes()).unwrap();
    }
    assert_eq!(writer.lookup(b"counter").unwrap().as_deref(), Some(&b"4"[..]));
    store.close().unwrap();
}

#[test]
fn inserts_split_pages() {
    let dir = tempdir().unwrap();
    let store = Store::open(small_page_config(dir.path().join("db"))).unwrap();
    let mut writer = store.new_writer();

    for i in 0..1000u32 {
        writer.insert(&key(i), &value(i)).unwrap();
    }
    for i in 0..1000u32 {
        assert_eq!(
            writer.lookup(&key(i)).unwrap().as_deref(),
            Some(&value(i)[..]),
            "key {} lost",
            i
        );
    }

    let stats = store.stats();
    assert!(stats.splits > 0, "splits never triggered");
    // 1000 items with 64 per page needs at least 16 pages.
    assert!(
        stats.num_pages >= 16,
        "expected >= 16 pages, got {}",
        stats.num_pages
    );
    assert_eq!(store.items_count(), 1000);

    store.close().unwrap();
}

#[test]
fn split_under_concurrent_inserts() {
    let dir = tempdir().unwrap();
    let store = Store::open(Config {
        max_page_items: 8,
        min_page_items: 2,
        ..small_page_config(dir.path().join("db"))
    })
    .unwrap();

    let mut handles = Vec::new();
    for range in [0u32..100, 100..200] {
        let store = store.clone();
        handles.push(thread::spawn(move || {
            let mut writer = store.new_writer();
            for i in range {
                writer.insert(&key(i), &value(i)).unwrap();
            }
        }));
    }
    for handle in handles {
        handle.join().unwrap();
    }

    let mut writer = store.new_writer();
    for i in 0..200u32 {
        assert_eq!(
            writer.lookup(&key(i)).unwrap().as_deref(),
            Some(&value(i)[..]),
            "key {} lost",
            i
        );
    }

    let stats = store.stats();
    assert_eq!(stats.inserts, 200);
    assert!(
        stats.splits + stats.split_conflicts >= 10,
        "200 items over 8-item pages should split repeatedly, saw {} + {}",
        stats.splits,
        stats.split_conflicts
    );

    store.close().unwrap();
}

#[test]
fn deletions_merge_pages_away() {
    let dir = tempdir().unwrap();
    let store = Store::open(Config {
        max_page_items: 16,
        min_page_items: 4,
        ..small_page_config(dir.path().join("db"))
    })
    .unwrap();
    let mut writer = store.new_writer();

    for i in 0..256u32 {
        writer.insert(&key(i), &value(i)).unwrap();
    }
    let pages_before = store.stats().num_pages;
    assert!(pages_before > 4);

    // Empty out everything but one key per 64; pages shrink below the
    // merge threshold and disappear into their left siblings.
    for i in 0..256u32 {
        if i % 64 != 0 {
            writer.delete(&key(i)).unwrap();
        }
    }
    // A maintenance sweep publishes the pending structural changes.
    writer.compact_all().unwrap();
    for i in 0..256u32 {
        let expected = if i % 64 == 0 { Some(value(i)) } else { None };
        assert_eq!(
            writer.lookup(&key(i)).unwrap().as_deref(),
            expected.as_deref(),
            "key {} wrong after merge",
            i
        );
    }

    let stats = store.stats();
    assert!(stats.merges > 0, "merges never triggered");
    assert!(
        stats.num_pages < pages_before,
        "pages did not shrink: {} -> {}",
        pages_before,
        stats.num_pages
    );

    store.close().unwrap();
}

#[test]
fn long_chains_compact() {
    let dir = tempdir().unwrap();
    let store = Store::open(Config {
        max_delta_chain_len: 8,
        ..small_page_config(dir.path().join("db"))
    })
    .unwrap();
    let mut writer = store.new_writer();

    for round in 0..100u32 {
        writer.insert(b"hot", round.to_string().as_bytes()).unwrap();
    }
    assert!(store.stats().compacts > 0, "chain never compacted");
    assert_eq!(
        writer.lookup(b"hot").unwrap().as_deref(),
        Some(&b"99"[..])
    );
    store.close().unwrap();
}

#[test]
fn snapshot_reads_are_stable() {
    let dir = tempdir().unwrap();
    let store = Store::open(small_page_config(dir.path().join("db"))).unwrap();
    let mut writer = store.new_writer();

    writer.insert(b"k", b"old").unwrap();
    let snap = store.new_snapshot();

    writer.insert(b"k", b"new").unwrap();
    writer.insert(b"other", b"x").unwrap();

    let mut reader = store.new_reader();
    assert_eq!(
        reader.lookup(&snap, b"k").unwrap().as_deref(),
        Some(&b"old"[..])
    );
    assert_eq!(reader.lookup(&snap, b"other").unwrap(), None);

    let later = store.new_snapshot();
    assert_eq!(
        reader.lookup(&later, b"k").unwrap().as_deref(),
        Some(&b"new"[..])
    );

    // The live view always sees the newest version.
    assert_eq!(writer.lookup(b"k").unwrap().as_deref(), Some(&b"new"[..]));

    store.close().unwrap();
}

#[test]
fn snapshot_iterator_walks_key_order() {
    let dir = tempdir().unwrap();
    let store = Store::open(Config {
        max_page_items: 16,
        ..small_page_config(dir.path().join("db"))
    })
    .unwrap();
    let mut writer = store.new_writer();

    for i in (0..200u32).rev() {
        writer.insert(&key(i), &value(i)).unwrap();
    }
    writer.delete(&key(77)).unwrap();

    let snap = store.new_snapshot();
    let mut reader = store.new_reader();
    let items: Vec<_> = reader
        .iter(&snap)
        .collect::<Result<Vec<_>, _>>()
        .unwrap();

    assert_eq!(items.len(), 199);
    assert!(items.windows(2).all(|w| w[0].key() < w[1].key()));
    assert!(items.iter().all(|item| item.key() != &key(77)[..]));

    store.close().unwrap();
}

#[test]
fn rollback_hides_later_writes() {
    let dir = tempdir().unwrap();
    let store = Store::open(small_page_config(dir.path().join("db"))).unwrap();
    let mut writer = store.new_writer();

    writer.insert(b"kept", b"v1").unwrap();
    let rp = store.create_recovery_point(b"before-batch").unwrap();

    writer.insert(b"kept", b"v2").unwrap();
    writer.insert(b"rolled", b"x").unwrap();

    store.rollback(&rp).unwrap();

    assert_eq!(writer.lookup(b"kept").unwrap().as_deref(), Some(&b"v1"[..]));
    assert_eq!(writer.lookup(b"rolled").unwrap(), None);
    assert_eq!(store.recovery_points(), vec![rp]);

    store.close().unwrap();
}

#[test]
fn in_memory_mode_skips_the_log() {
    let dir = tempdir().unwrap();
    let store = Store::open(Config {
        in_memory: true,
        ..small_page_config(dir.path().join("db"))
    })
    .unwrap();
    let mut writer = store.new_writer();

    for i in 0..500u32 {
        writer.insert(&key(i), &value(i)).unwrap();
    }
    for i in 0..500u32 {
        assert!(writer.lookup(&key(i)).unwrap().is_some());
    }
    assert_eq!(store.stats().bytes_written, 0);
    assert!(!dir.path().join("db").exists());

    store.close().unwrap();
}

#[test]
fn closed_store_rejects_operations() {
    let dir = tempdir().unwrap();
    let store = Store::open(small_page_config(dir.path().join("db"))).unwrap();
    let mut writer = store.new_writer();
    writer.insert(b"a", b"1").unwrap();

    store.close().unwrap();
    assert!(matches!(
        writer.insert(b"b", b"2"),
        Err(lodestore::StoreError::Closed)
    ));
    assert!(store.close().is_err());
}

#[test]
fn mixed_workload_stays_consistent() {
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    use std::collections::BTreeMap;

    let dir = tempdir().unwrap();
    let store = Store::open(Config {
        max_page_items: 32,
        min_page_items: 4,
        max_delta_chain_len: 12,
        ..small_page_config(dir.path().join("db"))
    })
    .unwrap();
    let mut writer = store.new_writer();

    let mut model: BTreeMap<Vec<u8>, Vec<u8>> = BTreeMap::new();
    let mut rng = StdRng::seed_from_u64(7);
    for _ in 0..5000 {
        let k = key(rng.gen_range(0..400));
        match rng.gen_range(0..3) {
            0 | 1 => {
                let v = value(rng.gen());
                writer.insert(&k, &v).unwrap();
                model.insert(k, v);
            }
            _ => {
                writer.delete(&k).unwrap();
                model.remove(&k);
            }
        }
    }

    for i in 0..400u32 {
        let k = key(i);
        assert_eq!(
            writer.lookup(&k).unwrap().as_deref(),
            model.get(&k).map(|v| &v[..]),
            "key {} diverged from model",
            i
        );
    }

    store.close().unwrap();
}

#[test]
fn concurrent_writers_on_shared_keyspace() {
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    let dir = tempdir().unwrap();
    let store = Store::open(Config {
        max_page_items: 16,
        min_page_items: 2,
        max_delta_chain_len: 8,
        ..small_page_config(dir.path().join("db"))
    })
    .unwrap();

    let mut handles = Vec::new();
    for t in 0..4u64 {
        let store: Arc<Store> = store.clone();
        handles.push(thread::spawn(move || {
            let mut writer = store.new_writer();
            let mut rng = StdRng::seed_from_u64(t);
            for _ in 0..500 {
                let k = key(rng.gen_range(0..200));
                match rng.gen_range(0..4) {
                    0 => {
                        writer.delete(&k).unwrap();
                    }
                    _ => {
                        writer.insert(&k, b"payload").unwrap();
                    }
                }
            }
        }));
    }
    for handle in handles {
        handle.join().unwrap();
    }

    // Every surviving key must read back with the shared payload.
    let mut writer = store.new_writer();
    for i in 0..200u32 {
        if let Some(v) = writer.lookup(&key(i)).unwrap() {
            assert_eq!(&v[..], b"payload");
        }
    }

    store.close().unwrap();
}
