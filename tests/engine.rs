use std::{sync::Arc, thread, time::Duration};

use e4s_index::{
    EngineOptions, Granularity, IndexEngine,
    bitset::TimeSet,
    kv::{KvStore, MemoryKvStore},
    partition,
    reindex::{ReindexService, ReindexState},
    repository::{IndexRepository, MemoryRepository},
};

const INDEX: &str = "meter-data";
const ENTITY: i64 = 12345;

fn sync_engine(kv: Arc<dyn KvStore>) -> Arc<IndexEngine> {
    IndexEngine::new(
        kv,
        None,
        EngineOptions {
            max_cache_size: 1024,
            flush_interval_ms: 0,
            async_write: false,
        },
    )
}

#[test]
fn marked_values_exist_and_unmarked_do_not() {
    let engine = sync_engine(Arc::new(MemoryKvStore::new()));
    let marked = [100u32, 150, 20_100, 20_175];
    engine
        .mark_batch(INDEX, ENTITY, Granularity::Day, &marked)
        .unwrap();

    for value in marked {
        assert!(engine.exists(INDEX, ENTITY, Granularity::Day, value).unwrap());
    }
    for value in [99u32, 101, 20_101, 40_000] {
        assert!(!engine.exists(INDEX, ENTITY, Granularity::Day, value).unwrap());
    }
}

#[test]
fn granularities_are_independent() {
    let engine = sync_engine(Arc::new(MemoryKvStore::new()));
    engine.mark(INDEX, ENTITY, Granularity::Day, 19723).unwrap();

    assert!(engine.exists(INDEX, ENTITY, Granularity::Day, 19723).unwrap());
    assert!(!engine.exists(INDEX, ENTITY, Granularity::Month, 648).unwrap());
    assert!(!engine.exists(INDEX, ENTITY, Granularity::Year, 54).unwrap());
}

#[test]
fn navigation_within_one_partition() {
    let engine = sync_engine(Arc::new(MemoryKvStore::new()));
    engine
        .mark_batch(INDEX, ENTITY, Granularity::Day, &[20_165, 20_170, 20_175])
        .unwrap();

    assert_eq!(
        engine.find_next(INDEX, ENTITY, Granularity::Day, 20_165).unwrap(),
        Some(20_170)
    );
    assert_eq!(
        engine.find_prev(INDEX, ENTITY, Granularity::Day, 20_175).unwrap(),
        Some(20_170)
    );
    // Strictness: a marked value is never its own neighbor.
    assert_eq!(
        engine.find_prev(INDEX, ENTITY, Granularity::Day, 20_165).unwrap(),
        None
    );
    assert_eq!(
        engine.find_next(INDEX, ENTITY, Granularity::Day, 20_175).unwrap(),
        None
    );
}

#[test]
fn find_prev_crosses_into_previous_partition() {
    let engine = sync_engine(Arc::new(MemoryKvStore::new()));
    // 20100 lands in partition 111, 20175 in partition 112.
    engine
        .mark_batch(INDEX, ENTITY, Granularity::Day, &[20_100, 20_175])
        .unwrap();

    assert_eq!(
        engine.find_prev(INDEX, ENTITY, Granularity::Day, 20_200).unwrap(),
        Some(20_175)
    );
    assert_eq!(
        engine.find_prev(INDEX, ENTITY, Granularity::Day, 20_175).unwrap(),
        Some(20_100)
    );
    // Partition 112 holds nothing below 20161, so the answer comes from
    // partition 111's greatest member.
    assert_eq!(
        engine.find_prev(INDEX, ENTITY, Granularity::Day, 20_161).unwrap(),
        Some(20_100)
    );
    assert_eq!(
        engine.find_prev(INDEX, ENTITY, Granularity::Day, 20_100).unwrap(),
        None
    );
}

#[test]
fn find_next_crosses_into_next_partition() {
    let engine = sync_engine(Arc::new(MemoryKvStore::new()));
    engine.mark(INDEX, ENTITY, Granularity::Day, 20_100).unwrap();

    assert_eq!(
        engine.find_next(INDEX, ENTITY, Granularity::Day, 20_100).unwrap(),
        None
    );

    engine.mark(INDEX, ENTITY, Granularity::Day, 20_200).unwrap();
    assert_eq!(
        engine.find_next(INDEX, ENTITY, Granularity::Day, 20_100).unwrap(),
        Some(20_200)
    );
}

#[test]
fn navigation_descends_at_most_one_partition() {
    let engine = sync_engine(Arc::new(MemoryKvStore::new()));
    // Two partitions apart: 19_000 is in partition 105, query from 112.
    engine.mark(INDEX, ENTITY, Granularity::Day, 19_000).unwrap();

    assert_eq!(
        engine.find_prev(INDEX, ENTITY, Granularity::Day, 20_200).unwrap(),
        None
    );
}

#[test]
fn registry_round_trip() {
    let engine = sync_engine(Arc::new(MemoryKvStore::new()));
    engine.create_index("a").unwrap();
    engine.create_index("b").unwrap();
    engine.create_index("a").unwrap();

    let mut names = engine.list_indexes().unwrap();
    names.sort();
    assert_eq!(names, vec!["a", "b"]);
    assert!(engine.index_exists("a").unwrap());

    engine.delete_index("a").unwrap();
    assert_eq!(engine.list_indexes().unwrap(), vec!["b"]);
    assert!(!engine.index_exists("a").unwrap());
}

#[test]
fn delete_index_removes_data_and_is_idempotent() {
    let kv: Arc<dyn KvStore> = Arc::new(MemoryKvStore::new());
    let repo = Arc::new(MemoryRepository::new());
    let engine = IndexEngine::new(
        Arc::clone(&kv),
        Some(Arc::clone(&repo) as Arc<dyn IndexRepository>),
        EngineOptions {
            max_cache_size: 1024,
            flush_interval_ms: 0,
            async_write: false,
        },
    );

    engine.create_index(INDEX).unwrap();
    engine
        .mark_batch(INDEX, ENTITY, Granularity::Day, &[1, 2, 20_000])
        .unwrap();
    engine.create_index("other").unwrap();
    engine.mark("other", 1, Granularity::Day, 1).unwrap();

    engine.delete_index(INDEX).unwrap();
    assert!(!engine.exists(INDEX, ENTITY, Granularity::Day, 1).unwrap());
    assert!(kv.scan_keys(&partition::index_prefix(INDEX)).unwrap().is_empty());
    assert_eq!(repo.count_by_index_name(INDEX).unwrap(), 0);

    // The other tenant is untouched.
    assert!(engine.exists("other", 1, Granularity::Day, 1).unwrap());

    engine.delete_index(INDEX).unwrap();
}

#[test]
fn concurrent_disjoint_marks_union() {
    let engine = IndexEngine::new(
        Arc::new(MemoryKvStore::new()),
        None,
        EngineOptions {
            max_cache_size: 1024,
            flush_interval_ms: 50,
            async_write: false,
        },
    );

    let threads: Vec<_> = (0..8)
        .map(|t| {
            let engine = Arc::clone(&engine);
            thread::spawn(move || {
                for i in 0..50u32 {
                    let value = t * 1000 + i;
                    engine.mark(INDEX, ENTITY, Granularity::Day, value).unwrap();
                }
            })
        })
        .collect();
    for handle in threads {
        handle.join().unwrap();
    }

    for t in 0..8u32 {
        for i in 0..50u32 {
            assert!(
                engine.exists(INDEX, ENTITY, Granularity::Day, t * 1000 + i).unwrap(),
                "missing value {}",
                t * 1000 + i
            );
        }
    }
}

#[test]
fn close_flushes_pending_writes() {
    let kv: Arc<dyn KvStore> = Arc::new(MemoryKvStore::new());
    let repo = Arc::new(MemoryRepository::new());

    {
        let engine = IndexEngine::new(
            Arc::clone(&kv),
            Some(Arc::clone(&repo) as Arc<dyn IndexRepository>),
            EngineOptions {
                max_cache_size: 1024,
                flush_interval_ms: 60_000,
                async_write: true,
            },
        );
        for i in 0..10u32 {
            engine.mark(INDEX, ENTITY, Granularity::Day, 20_000 + i).unwrap();
        }
        engine.close();
    }

    let fresh = sync_engine(Arc::clone(&kv));
    for i in 0..10u32 {
        assert!(fresh.exists(INDEX, ENTITY, Granularity::Day, 20_000 + i).unwrap());
    }
    let blob = repo
        .get_bitmap(INDEX, ENTITY, Granularity::Day, partition::partition_of(20_000, Granularity::Day))
        .unwrap()
        .expect("durable store flushed on close");
    assert_eq!(TimeSet::deserialize(&blob).unwrap().cardinality(), 10);
}

#[test]
fn write_behind_becomes_visible_within_an_interval() {
    let kv: Arc<dyn KvStore> = Arc::new(MemoryKvStore::new());
    let repo = Arc::new(MemoryRepository::new());
    let engine = IndexEngine::new(
        Arc::clone(&kv),
        Some(Arc::clone(&repo) as Arc<dyn IndexRepository>),
        EngineOptions {
            max_cache_size: 1024,
            flush_interval_ms: 25,
            async_write: true,
        },
    );

    engine.mark(INDEX, ENTITY, Granularity::Day, 19_723).unwrap();

    let deadline = std::time::Instant::now() + Duration::from_secs(5);
    loop {
        let fresh = sync_engine(Arc::clone(&kv));
        if fresh.exists(INDEX, ENTITY, Granularity::Day, 19_723).unwrap()
            && repo.count_by_index_name(INDEX).unwrap() > 0
        {
            break;
        }
        assert!(
            std::time::Instant::now() < deadline,
            "mark not flushed within the deadline"
        );
        thread::sleep(Duration::from_millis(10));
    }
}

#[test]
fn cache_capacity_is_bounded_and_evictions_flush() {
    let kv: Arc<dyn KvStore> = Arc::new(MemoryKvStore::new());
    let engine = IndexEngine::new(
        Arc::clone(&kv),
        None,
        EngineOptions {
            max_cache_size: 4,
            flush_interval_ms: 60_000,
            async_write: false,
        },
    );

    // 16 distinct partitions through a 4-entry cache.
    for p in 0..16u32 {
        engine
            .mark(INDEX, ENTITY, Granularity::Day, p * 180)
            .unwrap();
        assert!(engine.stats(INDEX).unwrap().cache_size <= 4);
    }

    // Every partition is intact: either still cached or flushed on
    // eviction.
    for p in 0..16u32 {
        assert!(engine.exists(INDEX, ENTITY, Granularity::Day, p * 180).unwrap());
    }
}

#[test]
fn durable_fallback_serves_reads_and_rebuilds_registry() {
    let repo = Arc::new(MemoryRepository::new());
    let seed: TimeSet = [19_723u32].into_iter().collect();
    repo.upsert_bitmap(INDEX, ENTITY, Granularity::Day, 109, &seed.serialize())
        .unwrap();

    // Fresh fast store: simulates cache loss in front of an intact
    // durable store.
    let kv: Arc<dyn KvStore> = Arc::new(MemoryKvStore::new());
    let engine = IndexEngine::new(
        Arc::clone(&kv),
        Some(Arc::clone(&repo) as Arc<dyn IndexRepository>),
        EngineOptions {
            max_cache_size: 1024,
            flush_interval_ms: 0,
            async_write: false,
        },
    );

    assert!(engine.index_exists(INDEX).unwrap());
    assert!(engine.exists(INDEX, ENTITY, Granularity::Day, 19_723).unwrap());
    assert!(engine.list_indexes().unwrap().contains(&INDEX.to_string()));
}

#[test]
fn reindex_recovers_from_fast_store_loss() {
    let repo = Arc::new(MemoryRepository::new());

    {
        let kv: Arc<dyn KvStore> = Arc::new(MemoryKvStore::new());
        let engine = IndexEngine::new(
            kv,
            Some(Arc::clone(&repo) as Arc<dyn IndexRepository>),
            EngineOptions {
                max_cache_size: 1024,
                flush_interval_ms: 0,
                async_write: false,
            },
        );
        engine.create_index(INDEX).unwrap();
        engine
            .mark_batch(INDEX, ENTITY, Granularity::Day, &[20_100, 20_175])
            .unwrap();
        engine.mark(INDEX, 67890, Granularity::Month, 648).unwrap();
        engine.close();
    }

    // The fast store is gone; rebuild it from the durable rows.
    let kv: Arc<dyn KvStore> = Arc::new(MemoryKvStore::new());
    let engine = IndexEngine::new(
        Arc::clone(&kv),
        Some(Arc::clone(&repo) as Arc<dyn IndexRepository>),
        EngineOptions {
            max_cache_size: 1024,
            flush_interval_ms: 0,
            async_write: false,
        },
    );
    let service = ReindexService::new(
        Arc::clone(&engine),
        Arc::clone(&repo) as Arc<dyn IndexRepository>,
        1000,
    );

    let status = service.reindex_full(INDEX);
    assert_eq!(status.status, ReindexState::Completed);

    assert!(engine.exists(INDEX, ENTITY, Granularity::Day, 20_100).unwrap());
    assert!(engine.exists(INDEX, 67890, Granularity::Month, 648).unwrap());
    assert_eq!(
        engine.find_prev(INDEX, ENTITY, Granularity::Day, 20_161).unwrap(),
        Some(20_100)
    );
    assert!(engine.list_indexes().unwrap().contains(&INDEX.to_string()));
}
