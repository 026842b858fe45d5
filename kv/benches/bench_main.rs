use criterion::{black_box, criterion_group, criterion_main, Criterion};
use kv::mvcc::MVCCStore;
use kv::revision::{Revision, ZERO};
use kv::storage::memory::MemoryEngine;

fn revision_roundtrip(main: i64, sub: i64) -> Revision {
    let rev = Revision::new(main, sub);
    Revision::decode(&rev.encode()).unwrap()
}

fn mvcc_put_get(n: u64) -> usize {
    let mut store = MVCCStore::new(MemoryEngine::new());
    for i in 0..n {
        store.begin();
        let key = format!("key-{i}");
        store.put(key.as_bytes(), b"value".to_vec(), 0).unwrap();
    }
    let key = format!("key-{}", n / 2);
    store.get(key.as_bytes(), ZERO).unwrap().map(|kv| kv.value.len()).unwrap_or(0)
}

fn criterion_benchmark(c: &mut Criterion) {
    c.bench_function("revision encode/decode roundtrip", |b| {
        b.iter(|| revision_roundtrip(black_box(42), black_box(3)))
    });
    c.bench_function("mvcc put 1000 keys then get one", |b| b.iter(|| mvcc_put_get(black_box(1000))));
}

criterion_group!(benches, criterion_benchmark);
criterion_main!(benches);
