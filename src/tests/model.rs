use loom::model::Builder;
use loom::thread::spawn;

use std::sync::Arc;

use crate::ShardMap;

// Two threads incrementing the same key serialize on the shard lock.
#[test]
fn same_key_updates_serialize() {
    let mut builder = Builder::new();
    builder.max_threads = 2;
    builder.check(|| {
        let map: Arc<ShardMap<u64, usize>> = Arc::new(ShardMap::with_shards(2).unwrap());
        let map_clone = map.clone();
        let updater = spawn(move || {
            *map_clone.entry(8) += 1;
        });
        *map.entry(8) += 1;
        assert!(updater.join().is_ok());
        assert_eq!(map.read(&8, |_, v| *v), Some(2));
    });
}

// Threads touching different shards make progress independently, and the
// snapshot still observes both writes once they have completed.
#[test]
fn distinct_shards_do_not_interfere() {
    let mut builder = Builder::new();
    builder.max_threads = 2;
    builder.check(|| {
        let map: Arc<ShardMap<u64, usize>> = Arc::new(ShardMap::with_shards(2).unwrap());
        let map_clone = map.clone();
        let updater = spawn(move || {
            *map_clone.entry(0) = 10;
        });
        *map.entry(1) = 11;
        assert!(updater.join().is_ok());
        assert_eq!(
            map.snapshot().into_iter().collect::<Vec<_>>(),
            vec![(0, 10), (1, 11)]
        );
    });
}
