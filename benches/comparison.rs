//! Benchmark comparison: NemoDB vs RocksDB vs Sled vs LevelDB
//!
//! Run with: cargo bench
//! Results will be in target/criterion/

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use nemodb_core::{NemoDB, Options};
use rand::Rng;
use tempfile::TempDir;

// ============================================================================
// Database Wrappers
// ============================================================================

trait KVStore {
    const NAME: &'static str;

    fn new() -> Self;
    fn put(&self, key: &[u8], value: &[u8]);
    fn get(&self, key: &[u8]) -> Option<Vec<u8>>;
    fn flush(&self);
}

// --- NemoDB ---
struct NemoWrapper {
    db: NemoDB,
    #[allow(dead_code)]
    dir: TempDir,
}

impl KVStore for NemoWrapper {
    const NAME: &'static str = "NemoDB";

    fn new() -> Self {
        let dir = TempDir::new().unwrap();
        let db = NemoDB::open(dir.path(), Options::default()).unwrap();
        Self { db, dir }
    }

    fn put(&self, key: &[u8], value: &[u8]) {
        self.db.put(key, value).unwrap();
    }

    fn get(&self, key: &[u8]) -> Option<Vec<u8>> {
        self.db.get(key).unwrap()
    }

    fn flush(&self) {
        self.db.flush().unwrap();
    }
}

// --- RocksDB ---
struct RocksDBWrapper {
    db: rocksdb::DB,
    #[allow(dead_code)]
    dir: TempDir,
}

impl KVStore for RocksDBWrapper {
    const NAME: &'static str = "RocksDB";

    fn new() -> Self {
        let dir = TempDir::new().unwrap();
        let db = rocksdb::DB::open_default(dir.path()).unwrap();
        Self { db, dir }
    }

    fn put(&self, key: &[u8], value: &[u8]) {
        self.db.put(key, value).unwrap();
    }

    fn get(&self, key: &[u8]) -> Option<Vec<u8>> {
        self.db.get(key).unwrap()
    }

    fn flush(&self) {
        self.db.flush().unwrap();
    }
}

// --- Sled ---
struct SledWrapper {
    db: sled::Db,
    #[allow(dead_code)]
    dir: TempDir,
}

impl KVStore for SledWrapper {
    const NAME: &'static str = "Sled";

    fn new() -> Self {
        let dir = TempDir::new().unwrap();
        let db = sled::open(dir.path()).unwrap();
        Self { db, dir }
    }

    fn put(&self, key: &[u8], value: &[u8]) {
        self.db.insert(key, value).unwrap();
    }

    fn get(&self, key: &[u8]) -> Option<Vec<u8>> {
        self.db.get(key).unwrap().map(|v| v.to_vec())
    }

    fn flush(&self) {
        self.db.flush().unwrap();
    }
}

// --- LevelDB (rusty-leveldb) ---
struct LevelDBWrapper {
    db: std::sync::Mutex<rusty_leveldb::DB>,
    #[allow(dead_code)]
    dir: TempDir,
}

impl KVStore for LevelDBWrapper {
    const NAME: &'static str = "LevelDB";

    fn new() -> Self {
        let dir = TempDir::new().unwrap();
        let db = rusty_leveldb::DB::open(dir.path(), rusty_leveldb::Options::default()).unwrap();
        Self {
            db: std::sync::Mutex::new(db),
            dir,
        }
    }

    fn put(&self, key: &[u8], value: &[u8]) {
        self.db.lock().unwrap().put(key, value).unwrap();
    }

    fn get(&self, key: &[u8]) -> Option<Vec<u8>> {
        self.db.lock().unwrap().get(key)
    }

    fn flush(&self) {
        self.db.lock().unwrap().flush().unwrap();
    }
}

// ============================================================================
// Benchmark Helpers
// ============================================================================

fn generate_key(i: u64) -> Vec<u8> {
    format!("key_{:016}", i).into_bytes()
}

fn generate_value(size: usize) -> Vec<u8> {
    let mut rng = rand::thread_rng();
    (0..size).map(|_| rng.r#gen::<u8>()).collect()
}

fn generate_random_key(max: u64) -> Vec<u8> {
    let mut rng = rand::thread_rng();
    generate_key(rng.gen_range(0..max))
}

fn populated<S: KVStore>(count: u64) -> S {
    let db = S::new();
    for i in 0..count {
        db.put(&generate_key(i), &generate_value(100));
    }
    db
}

// ============================================================================
// Benchmarks
// ============================================================================

fn sequential_write<S: KVStore>(c: &mut Criterion) {
    let mut group = c.benchmark_group("sequential_write");
    group.throughput(Throughput::Elements(1));
    for count in [1000u64, 10000] {
        group.bench_with_input(BenchmarkId::new(S::NAME, count), &count, |b, &count| {
            b.iter_with_setup(S::new, |db| {
                for i in 0..count {
                    db.put(&generate_key(i), &generate_value(100));
                }
            });
        });
    }
    group.finish();
}

fn random_read<S: KVStore>(c: &mut Criterion) {
    let count = 10000u64;
    let db = populated::<S>(count);
    db.flush();

    let mut group = c.benchmark_group("random_read");
    group.throughput(Throughput::Elements(1));
    group.bench_function(S::NAME, |b| {
        b.iter(|| black_box(db.get(&generate_random_key(count))));
    });
    group.finish();
}

/// 80% reads, 20% writes.
fn mixed_workload<S: KVStore>(c: &mut Criterion) {
    let mut group = c.benchmark_group("mixed_workload");
    group.throughput(Throughput::Elements(1));
    group.bench_function(S::NAME, |b| {
        b.iter_with_setup(
            || populated::<S>(1000),
            |db| {
                let mut rng = rand::thread_rng();
                for i in 0..1000u64 {
                    if rng.gen_range(0..100) < 80 {
                        black_box(db.get(&generate_random_key(1000)));
                    } else {
                        db.put(&generate_key(i), &generate_value(100));
                    }
                }
            },
        );
    });
    group.finish();
}

fn value_sizes<S: KVStore>(c: &mut Criterion) {
    let mut group = c.benchmark_group("value_sizes");
    for size in [100usize, 1000, 10000] {
        group.throughput(Throughput::Bytes(size as u64));
        group.bench_with_input(BenchmarkId::new(S::NAME, size), &size, |b, &size| {
            let db = S::new();
            let value = generate_value(size);
            let mut i = 0u64;
            b.iter(|| {
                db.put(&generate_key(i), &value);
                i += 1;
            });
        });
    }
    group.finish();
}

fn bench_all(c: &mut Criterion) {
    sequential_write::<NemoWrapper>(c);
    sequential_write::<RocksDBWrapper>(c);
    sequential_write::<SledWrapper>(c);
    sequential_write::<LevelDBWrapper>(c);

    random_read::<NemoWrapper>(c);
    random_read::<RocksDBWrapper>(c);
    random_read::<SledWrapper>(c);
    random_read::<LevelDBWrapper>(c);

    mixed_workload::<NemoWrapper>(c);
    mixed_workload::<RocksDBWrapper>(c);
    mixed_workload::<SledWrapper>(c);
    mixed_workload::<LevelDBWrapper>(c);

    value_sizes::<NemoWrapper>(c);
    value_sizes::<RocksDBWrapper>(c);
    value_sizes::<SledWrapper>(c);
    value_sizes::<LevelDBWrapper>(c);
}

// ============================================================================
// TTL layer
// ============================================================================

fn bench_ttl_layer(c: &mut Criterion) {
    let mut group = c.benchmark_group("ttl_layer");
    group.throughput(Throughput::Elements(1));

    group.bench_function("put_with_ttl", |b| {
        let db = NemoWrapper::new();
        let value = generate_value(100);
        let mut i = 0u64;
        b.iter(|| {
            db.db.put_with_ttl(&generate_key(i), &value, 60).unwrap();
            i += 1;
        });
    });

    group.bench_function("put_with_key_version", |b| {
        let db = NemoWrapper::new();
        let mut i = 0u64;
        b.iter(|| {
            let meta = format!("Hobj{}", i % 64);
            black_box(db.db.put_with_key_version(meta.as_bytes(), b"").unwrap());
            i += 1;
        });
    });

    group.bench_function("versioned_read", |b| {
        let db = NemoWrapper::new();
        db.db.put_with_key_version(b"Hobj", b"").unwrap();
        let keys: Vec<_> = (0..1000u64)
            .map(|i| db.db.data_key(b"obj", &i.to_be_bytes()).unwrap().unwrap())
            .collect();
        for key in &keys {
            db.db.put(key, &generate_value(100)).unwrap();
        }
        db.flush();
        let mut rng = rand::thread_rng();
        b.iter(|| black_box(db.db.get(&keys[rng.gen_range(0..keys.len())]).unwrap()));
    });

    group.finish();
}

criterion_group!(benches, bench_all, bench_ttl_layer);

criterion_main!(benches);
