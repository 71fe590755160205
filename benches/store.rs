use criterion::{black_box, criterion_group, criterion_main, BatchSize, Criterion};
use lodestore::{Config, Store};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tempfile::tempdir;

fn key(i: u32) -> Vec<u8> {
    format!("key-{:08}", i).into_bytes()
}

fn bench_config(path: std::path::PathBuf) -> Config {
    Config {
        path,
        flush_buffer_size: 4 * 1024 * 1024,
        auto_cleaner: false,
        auto_swapper: false,
        ..Config::default()
    }
}

fn insert_throughput(c: &mut Criterion) {
    c.bench_function("insert_sequential_10k", |b| {
        b.iter_batched(
            || {
                let dir = tempdir().unwrap();
                let store = Store::open(bench_config(dir.path().join("db"))).unwrap();
                (dir, store)
            },
            |(dir, store)| {
                let mut writer = store.new_writer();
                for i in 0..10_000u32 {
                    writer.insert(&key(i), b"benchmark-value").unwrap();
                }
                store.close().unwrap();
                drop(dir);
            },
            BatchSize::PerIteration,
        )
    });
}

fn lookup_throughput(c: &mut Criterion) {
    let dir = tempdir().unwrap();
    let store = Store::open(bench_config(dir.path().join("db"))).unwrap();
    let mut writer = store.new_writer();
    for i in 0..100_000u32 {
        writer.insert(&key(i), b"benchmark-value").unwrap();
    }

    let mut rng = StdRng::seed_from_u64(99);
    c.bench_function("lookup_random_hot", |b| {
        b.iter(|| {
            let i = rng.gen_range(0..100_000);
            black_box(writer.lookup(&key(i)).unwrap());
        })
    });

    store.close().unwrap();
}

criterion_group!(benches, insert_throughput, lookup_throughput);
criterion_main!(benches);
