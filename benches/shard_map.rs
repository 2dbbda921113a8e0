use criterion::{criterion_group, criterion_main, Criterion};
use shardmap::ShardMap;
use std::sync::Arc;
use std::thread;
use std::time::Instant;

fn entry_cold(c: &mut Criterion) {
    c.bench_function("ShardMap: entry, cold", |b| {
        b.iter_custom(|iters| {
            let map: ShardMap<u64, u64> = ShardMap::default();
            let start = Instant::now();
            for i in 0..iters {
                *map.entry(i) = i;
            }
            start.elapsed()
        })
    });
}

fn entry_warmed_up(c: &mut Criterion) {
    c.bench_function("ShardMap: entry, warmed up", |b| {
        b.iter_custom(|iters| {
            let map: ShardMap<u64, u64> = ShardMap::default();
            for i in 0..iters {
                *map.entry(i) = i;
            }
            let start = Instant::now();
            for i in 0..iters {
                *map.entry(i) += 1;
            }
            start.elapsed()
        })
    });
}

fn read(c: &mut Criterion) {
    c.bench_function("ShardMap: read", |b| {
        b.iter_custom(|iters| {
            let map: ShardMap<u64, u64> = ShardMap::default();
            for i in 0..iters {
                *map.entry(i) = i;
            }
            let start = Instant::now();
            for i in 0..iters {
                assert_eq!(map.read(&i, |_, v| *v == i), Some(true));
            }
            start.elapsed()
        })
    });
}

fn contended_increments(c: &mut Criterion, name: &str, shards: usize) {
    let num_threads: u64 = 4;
    c.bench_function(name, move |b| {
        b.iter_custom(|iters| {
            let map: Arc<ShardMap<u64, u64>> = Arc::new(ShardMap::with_shards(shards).unwrap());
            let start = Instant::now();
            let threads: Vec<_> = (0..num_threads)
                .map(|thread_id| {
                    let map = map.clone();
                    thread::spawn(move || {
                        for i in 0..iters {
                            *map.entry(i * num_threads + thread_id) += 1;
                        }
                    })
                })
                .collect();
            for thread in threads {
                thread.join().unwrap();
            }
            start.elapsed()
        })
    });
}

// The striping payoff: the same workload over one global lock and over many
// independent locks.
fn contended_increments_single_shard(c: &mut Criterion) {
    contended_increments(c, "ShardMap: contended increments, 1 shard", 1);
}

fn contended_increments_many_shards(c: &mut Criterion) {
    contended_increments(c, "ShardMap: contended increments, 100 shards", 100);
}

criterion_group!(
    shard_map,
    entry_cold,
    entry_warmed_up,
    read,
    contended_increments_single_shard,
    contended_increments_many_shards
);
criterion_main!(shard_map);
