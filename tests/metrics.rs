//! Tests for the metrics layer.

use lodestore::{metrics_keys, Config, Store};
use metrics::Label;
use metrics_util::debugging::{DebugValue, DebuggingRecorder, Snapshotter};
use once_cell::sync::Lazy;
use tempfile::tempdir;

/// Sets up a `DebuggingRecorder` to capture metrics emitted during a
/// test. Wrapped in a `Lazy` so it is only installed once for the whole
/// test binary.
static SNAPSHOTTER: Lazy<Snapshotter> = Lazy::new(|| {
    let recorder = DebuggingRecorder::new();
    let snapshotter = recorder.snapshotter();
    recorder.install().expect("failed to install recorder");
    snapshotter
});

fn counter_value(snapshotter: &Snapshotter, name: &str, labels: &[(&str, &str)]) -> u64 {
    let labels: Vec<Label> = labels
        .iter()
        .map(|(k, v)| Label::new(k.to_string(), v.to_string()))
        .collect();
    snapshotter
        .snapshot()
        .into_vec()
        .into_iter()
        .find_map(|(composite_key, _, _, value)| {
            let (_, key) = composite_key.into_parts();
            let key_labels: Vec<Label> = key.labels().cloned().collect();
            eprintln!("DBG2 name={} key_labels={:?} labels={:?} nameeq={} labeq={} value={:?}", key.name(), key_labels, labels, key.name()==name, key_labels==labels, value);
            if key.name() == name && key_labels == labels {
                if let DebugValue::Counter(c) = value {
                    return Some(c);
                }
            }
            None
        })
        .unwrap_or(0)
}

#[test]
fn operation_counters_are_emitted() {
    let snapshotter = &*SNAPSHOTTER;
    let insert_labels = [(metrics_keys::LABEL_OPERATION_TYPE, "insert")];
    let lookup_labels = [(metrics_keys::LABEL_OPERATION_TYPE, "lookup")];
    let inserts_before =
        counter_value(snapshotter, metrics_keys::OPERATIONS_TOTAL, &insert_labels);
    let lookups_before =
        counter_value(snapshotter, metrics_keys::OPERATIONS_TOTAL, &lookup_labels);

    let dir = tempdir().unwrap();
    let store = Store::open(Config {
        path: dir.path().join("db"),
        auto_cleaner: false,
        auto_swapper: false,
        ..Config::default()
    })
    .unwrap();
    let mut writer = store.new_writer();

    for i in 0..25u32 {
        writer.insert(format!("k{}", i).as_bytes(), b"v").unwrap();
    }
    for i in 0..10u32 {
        writer.lookup(format!("k{}", i).as_bytes()).unwrap();
    }
    store.close().unwrap();

    let inserts = counter_value(snapshotter, metrics_keys::OPERATIONS_TOTAL, &insert_labels);
    let lookups = counter_value(snapshotter, metrics_keys::OPERATIONS_TOTAL, &lookup_labels);
    assert_eq!(inserts - inserts_before, 25);
    assert_eq!(lookups - lookups_before, 10);

    let written = counter_value(snapshotter, metrics_keys::LSS_BYTES_WRITTEN_TOTAL, &[]);
    assert!(written > 0, "log writes must be counted");
}

#[test]
fn smo_counters_track_splits() {
    let snapshotter = &*SNAPSHOTTER;
    let split_labels = [(metrics_keys::LABEL_SMO_KIND, "split")];
    let splits_before = counter_value(snapshotter, metrics_keys::SMO_TOTAL, &split_labels);

    let dir = tempdir().unwrap();
    let store = Store::open(Config {
        path: dir.path().join("db"),
        max_page_items: 8,
        min_page_items: 2,
        auto_cleaner: false,
        auto_swapper: false,
        ..Config::default()
    })
    .unwrap();
    let mut writer = store.new_writer();
    for i in 0..200u32 {
        writer
            .insert(format!("key-{:05}", i).as_bytes(), b"v")
            .unwrap();
    }
    store.close().unwrap();

    let splits = counter_value(snapshotter, metrics_keys::SMO_TOTAL, &split_labels);
    assert!(
        splits > splits_before,
        "200 inserts over 8-item pages must record splits"
    );
}
