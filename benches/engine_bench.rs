use std::sync::Arc;

use criterion::{Criterion, black_box, criterion_group, criterion_main};
use e4s_index::{EngineOptions, Granularity, IndexEngine, kv::MemoryKvStore};
use rand::{Rng, SeedableRng, rngs::StdRng};

const INDEX: &str = "meter-data";
const DAY_SPAN: u32 = 20_000;

fn write_behind_engine() -> Arc<IndexEngine> {
    IndexEngine::new(
        Arc::new(MemoryKvStore::new()),
        None,
        EngineOptions {
            max_cache_size: 100_000,
            flush_interval_ms: 100,
            async_write: true,
        },
    )
}

fn bench_mark(c: &mut Criterion) {
    let engine = write_behind_engine();
    let mut rng = StdRng::seed_from_u64(7);
    c.bench_function("mark", |b| {
        b.iter(|| {
            let entity = rng.gen_range(0..512);
            let value = rng.gen_range(0..DAY_SPAN);
            engine
                .mark(INDEX, entity, Granularity::Day, black_box(value))
                .expect("mark");
        });
    });
}

fn bench_exists(c: &mut Criterion) {
    let engine = write_behind_engine();
    let mut rng = StdRng::seed_from_u64(7);
    for entity in 0..64i64 {
        let values: Vec<u32> = (0..2_000).map(|_| rng.gen_range(0..DAY_SPAN)).collect();
        engine
            .mark_batch(INDEX, entity, Granularity::Day, &values)
            .expect("seed");
    }
    c.bench_function("exists", |b| {
        b.iter(|| {
            let entity = rng.gen_range(0..64);
            let value = rng.gen_range(0..DAY_SPAN);
            black_box(
                engine
                    .exists(INDEX, entity, Granularity::Day, value)
                    .expect("exists"),
            );
        });
    });
}

fn bench_find_prev(c: &mut Criterion) {
    let engine = write_behind_engine();
    let mut rng = StdRng::seed_from_u64(7);
    let values: Vec<u32> = (0..5_000).map(|_| rng.gen_range(0..DAY_SPAN)).collect();
    engine
        .mark_batch(INDEX, 1, Granularity::Day, &values)
        .expect("seed");
    c.bench_function("find_prev", |b| {
        b.iter(|| {
            let value = rng.gen_range(0..DAY_SPAN);
            black_box(
                engine
                    .find_prev(INDEX, 1, Granularity::Day, value)
                    .expect("find_prev"),
            );
        });
    });
}

criterion_group!(benches, bench_mark, bench_exists, bench_find_prev);
criterion_main!(benches);
