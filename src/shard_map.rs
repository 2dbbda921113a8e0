//! [`ShardMap`] is a concurrent ordered map built on striped locking.

#[cfg(feature = "loom")]
use loom::sync::{Mutex, MutexGuard};
#[cfg(not(feature = "loom"))]
use std::sync::{Mutex, MutexGuard};

use std::collections::BTreeMap;
use std::fmt::{self, Debug};
use std::mem::replace;
use std::ops::{Deref, DerefMut};
use std::ptr::NonNull;

use super::ShardKey;

/// The shard count used by [`ShardMap::new`] and [`ShardMap::default`].
const DEFAULT_SHARDS: usize = 16;

/// Striped-lock concurrent ordered map.
///
/// A [`ShardMap`] owns a fixed array of shards where a shard is a mutex-guarded
/// ordered map. A key belongs to exactly one shard, selected by reducing the key
/// to an unsigned 64-bit integer modulo the shard count; see [`ShardKey`]. Two
/// threads operating on keys in different shards proceed fully in parallel,
/// whereas operations on keys in the same shard serialize on that shard's lock,
/// even if the keys differ.
///
/// ## The key properties of [`ShardMap`]
///
/// * Fixed striping: the shard count is set at construction and never changes.
/// * Upsert-on-access: [`ShardMap::entry`] materializes an absent entry with the
///   default value, so obtaining a reference is never a fallible lookup.
/// * Scoped access: the reference handed out by [`ShardMap::entry`] lives inside
///   an [`OccupiedEntry`] guard that holds the shard lock, and cannot outlive it.
/// * Ordered export: [`ShardMap::snapshot`] merges every shard into one ordinary
///   [`BTreeMap`].
///
/// ## Locking behavior
///
/// Every method acquires at most one shard lock at a time. Methods that visit
/// all entries ([`ShardMap::snapshot`], [`ShardMap::scan`], [`ShardMap::retain`],
/// [`ShardMap::clear`], [`ShardMap::len`]) lock shards one after another in
/// index order, releasing each lock before taking the next; their results are
/// therefore consistent per shard, never across the whole map. Operations on a
/// single key block until the owning shard's lock is available; there are no
/// timeouts and no cancellation.
///
/// A shard whose lock was poisoned by a panicking holder remains usable: the
/// tree behind the lock is structurally intact, so the poison flag is ignored.
///
/// ## Failure model
///
/// Construction with a zero shard count fails with [`ZeroShards`]. Running out
/// of memory while inserting aborts the process, as it does for the standard
/// collections. No operation has partial-success semantics beyond the
/// upsert-on-access insertion performed by [`ShardMap::entry`].
///
/// ## Blocking methods in an asynchronous code block
///
/// All methods block the calling thread, so calling them from asynchronous code
/// can stall an executor thread; this container is intended for plain threads.
pub struct ShardMap<K, V> {
    shards: Box<[Shard<K, V>]>,
}

/// One lock stripe: a mutex and the entries it guards.
///
/// Aligned so that neighboring shard locks do not share a cache line.
#[repr(align(128))]
struct Shard<K, V> {
    tree: Mutex<BTreeMap<K, V>>,
}

/// [`OccupiedEntry`] is a view into a single entry of a [`ShardMap`].
///
/// The guard holds the owning shard's lock for its whole lifetime; dropping the
/// guard is the only way the lock is released. Since [`ShardMap::entry`] fills
/// vacant slots with the default value, an entry view is always occupied.
pub struct OccupiedEntry<'m, K, V> {
    key: K,
    value: NonNull<V>,
    guard: MutexGuard<'m, BTreeMap<K, V>>,
}

/// Error returned by [`ShardMap::with_shards`] when a shard count of zero is
/// given.
///
/// # Examples
///
/// ```
/// use shardmap::ShardMap;
/// use shardmap::shard_map::ZeroShards;
///
/// assert_eq!(ShardMap::<u64, u32>::with_shards(0).unwrap_err(), ZeroShards);
/// ```
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ZeroShards;

impl<K, V> ShardMap<K, V> {
    /// Creates an empty [`ShardMap`] with the default shard count.
    ///
    /// # Examples
    ///
    /// ```
    /// use shardmap::ShardMap;
    ///
    /// let map: ShardMap<u64, u32> = ShardMap::new();
    /// assert_eq!(map.shards(), 16);
    /// ```
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self {
            shards: Self::allocate(DEFAULT_SHARDS),
        }
    }

    /// Creates an empty [`ShardMap`] with the given shard count.
    ///
    /// The shard count is fixed for the lifetime of the map. More shards lower
    /// the chance of two threads contending on the same lock.
    ///
    /// # Errors
    ///
    /// Returns [`ZeroShards`] if `shards` is zero; a map without shards could
    /// not place any key.
    ///
    /// # Examples
    ///
    /// ```
    /// use shardmap::ShardMap;
    ///
    /// let map: ShardMap<u64, u32> = ShardMap::with_shards(64).unwrap();
    /// assert_eq!(map.shards(), 64);
    ///
    /// assert!(ShardMap::<u64, u32>::with_shards(0).is_err());
    /// ```
    #[inline]
    pub fn with_shards(shards: usize) -> Result<Self, ZeroShards> {
        if shards == 0 {
            return Err(ZeroShards);
        }
        Ok(Self {
            shards: Self::allocate(shards),
        })
    }

    /// Returns the number of shards.
    ///
    /// # Examples
    ///
    /// ```
    /// use shardmap::ShardMap;
    ///
    /// let map: ShardMap<u64, u32> = ShardMap::with_shards(3).unwrap();
    /// assert_eq!(map.shards(), 3);
    /// ```
    #[inline]
    #[must_use]
    pub fn shards(&self) -> usize {
        self.shards.len()
    }

    fn allocate(shards: usize) -> Box<[Shard<K, V>]> {
        (0..shards).map(|_| Shard::new()).collect()
    }
}

impl<K, V> ShardMap<K, V>
where
    K: ShardKey,
{
    /// Gets the entry associated with the given key for in-place manipulation.
    ///
    /// The owning shard is locked for the whole lifetime of the returned
    /// [`OccupiedEntry`], blocking the calling thread until the lock is
    /// available. If the key is absent it is inserted with the default value
    /// first, therefore even a pure read through this method can grow the map.
    ///
    /// # Examples
    ///
    /// ```
    /// use shardmap::ShardMap;
    ///
    /// let map: ShardMap<u8, u32> = ShardMap::default();
    ///
    /// for byte in "a short treatise on fungi".bytes() {
    ///     *map.entry(byte) += 1;
    /// }
    ///
    /// assert_eq!(map.read(&b's', |_, v| *v), Some(2));
    /// assert_eq!(map.read(&b't', |_, v| *v), Some(3));
    /// assert_eq!(map.read(&b'y', |_, v| *v), None);
    /// ```
    #[inline]
    pub fn entry(&self, key: K) -> OccupiedEntry<'_, K, V>
    where
        V: Default,
    {
        let mut tree = self.shard(&key).lock();
        let value = NonNull::from(tree.entry(key.clone()).or_default());
        OccupiedEntry {
            key,
            value,
            guard: tree,
        }
    }

    /// Upserts a key-value pair into the [`ShardMap`].
    ///
    /// Returns the old value if the [`ShardMap`] has this key present, or
    /// returns `None`.
    ///
    /// # Examples
    ///
    /// ```
    /// use shardmap::ShardMap;
    ///
    /// let map: ShardMap<u64, u32> = ShardMap::default();
    ///
    /// assert!(map.upsert(1, 0).is_none());
    /// assert_eq!(map.upsert(1, 1), Some(0));
    /// assert_eq!(map.read(&1, |_, v| *v), Some(1));
    /// ```
    #[inline]
    pub fn upsert(&self, key: K, val: V) -> Option<V> {
        self.shard(&key).lock().insert(key, val)
    }

    /// Removes a key-value pair if the key exists.
    ///
    /// Removing an absent key is a no-op, not an error.
    ///
    /// # Examples
    ///
    /// ```
    /// use shardmap::ShardMap;
    ///
    /// let map: ShardMap<u64, u32> = ShardMap::default();
    ///
    /// assert_eq!(map.remove(&1), None);
    /// map.upsert(1, 0);
    /// assert_eq!(map.remove(&1), Some(0));
    /// assert_eq!(map.remove(&1), None);
    /// ```
    #[inline]
    pub fn remove(&self, key: &K) -> Option<V> {
        self.shard(key).lock().remove(key)
    }

    /// Reads a key-value pair.
    ///
    /// Unlike [`ShardMap::entry`], an absent key is not inserted.
    ///
    /// # Examples
    ///
    /// ```
    /// use shardmap::ShardMap;
    ///
    /// let map: ShardMap<u64, u32> = ShardMap::default();
    ///
    /// assert_eq!(map.read(&1, |_, v| *v), None);
    /// map.upsert(1, 10);
    /// assert_eq!(map.read(&1, |_, v| *v), Some(10));
    /// ```
    #[inline]
    #[must_use]
    pub fn read<R, F: FnOnce(&K, &V) -> R>(&self, key: &K, reader: F) -> Option<R> {
        let tree = self.shard(key).lock();
        tree.get_key_value(key).map(|(k, v)| reader(k, v))
    }

    /// Updates an existing key-value pair in-place.
    ///
    /// Returns `None` without invoking the closure if the key does not exist;
    /// unlike [`ShardMap::entry`], an absent key is not inserted.
    ///
    /// # Examples
    ///
    /// ```
    /// use shardmap::ShardMap;
    ///
    /// let map: ShardMap<u64, u32> = ShardMap::default();
    ///
    /// assert!(map.update(&1, |_, v| { *v = 2; *v }).is_none());
    /// map.upsert(1, 0);
    /// assert_eq!(map.update(&1, |_, v| { *v = 2; *v }), Some(2));
    /// assert_eq!(map.read(&1, |_, v| *v), Some(2));
    /// ```
    #[inline]
    pub fn update<R, U: FnOnce(&K, &mut V) -> R>(&self, key: &K, updater: U) -> Option<R> {
        let mut tree = self.shard(key).lock();
        tree.range_mut(key..=key).next().map(|(k, v)| updater(k, v))
    }

    /// Returns `true` if the [`ShardMap`] contains the key.
    ///
    /// # Examples
    ///
    /// ```
    /// use shardmap::ShardMap;
    ///
    /// let map: ShardMap<u64, u32> = ShardMap::default();
    ///
    /// assert!(!map.contains(&1));
    /// map.upsert(1, 0);
    /// assert!(map.contains(&1));
    /// ```
    #[inline]
    #[must_use]
    pub fn contains(&self, key: &K) -> bool {
        self.shard(key).lock().contains_key(key)
    }

    /// Scans all the entries.
    ///
    /// Shards are visited in index order while holding one shard lock at a
    /// time, so under concurrent writers the scan is consistent per shard, not
    /// across the whole map.
    ///
    /// # Examples
    ///
    /// ```
    /// use shardmap::ShardMap;
    ///
    /// let map: ShardMap<u64, u64> = ShardMap::default();
    ///
    /// map.upsert(1, 0);
    /// map.upsert(2, 1);
    ///
    /// let mut sum = 0;
    /// map.scan(|k, v| { sum += *k + *v; });
    /// assert_eq!(sum, 4);
    /// ```
    #[inline]
    pub fn scan<F: FnMut(&K, &V)>(&self, mut scanner: F) {
        for shard in self.shards.iter() {
            let tree = shard.lock();
            for (k, v) in tree.iter() {
                scanner(k, v);
            }
        }
    }

    /// Retains the entries specified by the predicate.
    ///
    /// The predicate closure may modify the value field. The same per-shard
    /// consistency caveat as [`ShardMap::scan`] applies.
    ///
    /// # Examples
    ///
    /// ```
    /// use shardmap::ShardMap;
    ///
    /// let map: ShardMap<u64, u32> = ShardMap::default();
    ///
    /// map.upsert(1, 0);
    /// map.upsert(2, 1);
    /// map.upsert(3, 2);
    ///
    /// map.retain(|k, v| *k == 1 && *v == 0);
    ///
    /// assert!(map.contains(&1));
    /// assert!(!map.contains(&2));
    /// assert!(!map.contains(&3));
    /// ```
    #[inline]
    pub fn retain<F: FnMut(&K, &mut V) -> bool>(&self, mut pred: F) {
        for shard in self.shards.iter() {
            shard.lock().retain(|k, v| pred(k, v));
        }
    }

    /// Clears the [`ShardMap`] by removing all key-value pairs.
    ///
    /// # Examples
    ///
    /// ```
    /// use shardmap::ShardMap;
    ///
    /// let map: ShardMap<u64, u32> = ShardMap::default();
    ///
    /// map.upsert(1, 0);
    /// map.clear();
    ///
    /// assert!(!map.contains(&1));
    /// ```
    #[inline]
    pub fn clear(&self) {
        for shard in self.shards.iter() {
            shard.lock().clear();
        }
    }

    /// Returns the number of entries in the [`ShardMap`].
    ///
    /// Shard sizes are summed one lock at a time, so under concurrent writers
    /// the figure does not correspond to a single point in time.
    ///
    /// # Examples
    ///
    /// ```
    /// use shardmap::ShardMap;
    ///
    /// let map: ShardMap<u64, u32> = ShardMap::default();
    ///
    /// map.upsert(1, 0);
    /// assert_eq!(map.len(), 1);
    /// ```
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.shards.iter().map(|shard| shard.lock().len()).sum()
    }

    /// Returns `true` if the [`ShardMap`] is empty.
    ///
    /// # Examples
    ///
    /// ```
    /// use shardmap::ShardMap;
    ///
    /// let map: ShardMap<u64, u32> = ShardMap::default();
    ///
    /// assert!(map.is_empty());
    /// map.upsert(1, 0);
    /// assert!(!map.is_empty());
    /// ```
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.shards.iter().all(|shard| shard.lock().is_empty())
    }

    /// Exports every entry into one ordinary [`BTreeMap`].
    ///
    /// Shards are copied in index order while holding one shard lock at a
    /// time. The result is **not** an atomic point-in-time view of the whole
    /// map: a concurrent writer may mutate a not-yet-visited shard after the
    /// snapshot has begun, so the export mixes per-shard states taken at
    /// slightly different times. What is guaranteed is that each shard's
    /// contribution is a consistent view of that shard, and that no value is
    /// ever observed partially written.
    ///
    /// # Examples
    ///
    /// ```
    /// use shardmap::ShardMap;
    ///
    /// let map: ShardMap<i64, u32> = ShardMap::with_shards(3).unwrap();
    ///
    /// map.upsert(1, 10);
    /// map.upsert(-1, 30);
    ///
    /// let snapshot = map.snapshot();
    /// assert_eq!(
    ///     snapshot.into_iter().collect::<Vec<_>>(),
    ///     vec![(-1, 30), (1, 10)],
    /// );
    /// ```
    #[must_use]
    pub fn snapshot(&self) -> BTreeMap<K, V>
    where
        V: Clone,
    {
        let mut result = BTreeMap::new();
        for shard in self.shards.iter() {
            let tree = shard.lock();
            result.extend(tree.iter().map(|(k, v)| (k.clone(), v.clone())));
        }
        result
    }

    fn shard(&self, key: &K) -> &Shard<K, V> {
        let index = key.widen() % self.shards.len() as u64;
        &self.shards[index as usize]
    }
}

impl<K, V> Debug for ShardMap<K, V>
where
    K: Debug + ShardKey,
    V: Debug,
{
    /// An image of the [`ShardMap`] built one shard at a time; not an atomic
    /// view under concurrent writers.
    #[inline]
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut map = f.debug_map();
        self.scan(|k, v| {
            map.entry(k, v);
        });
        map.finish()
    }
}

impl<K, V> Default for ShardMap<K, V> {
    /// Creates an empty [`ShardMap`] with the default shard count.
    ///
    /// # Examples
    ///
    /// ```
    /// use shardmap::ShardMap;
    ///
    /// let map: ShardMap<u64, u32> = ShardMap::default();
    /// assert_eq!(map.shards(), 16);
    /// ```
    #[inline]
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V> PartialEq for ShardMap<K, V>
where
    K: ShardKey,
    V: PartialEq,
{
    /// Compares two [`ShardMap`] instances.
    ///
    /// The comparison locks one shard of each map at a time, so comparing maps
    /// that are concurrently mutated is inherently racy, and two threads
    /// comparing the same pair of maps in opposite order can deadlock.
    #[inline]
    fn eq(&self, other: &Self) -> bool {
        if std::ptr::eq(self, other) {
            return true;
        }
        let mut equal = true;
        self.scan(|k, v| {
            if equal && other.read(k, |_, ov| v == ov) != Some(true) {
                equal = false;
            }
        });
        if equal {
            other.scan(|k, _| {
                if equal && !self.contains(k) {
                    equal = false;
                }
            });
        }
        equal
    }
}

impl<K, V> Shard<K, V> {
    fn new() -> Self {
        Self {
            tree: Mutex::new(BTreeMap::new()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<K, V>> {
        // A poisoned shard only means another thread panicked while holding
        // the lock; the tree behind it is still structurally intact.
        self.tree
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl<'m, K, V> OccupiedEntry<'m, K, V>
where
    K: ShardKey,
{
    /// Gets a reference to the key in the entry.
    ///
    /// # Examples
    ///
    /// ```
    /// use shardmap::ShardMap;
    ///
    /// let map: ShardMap<u64, u32> = ShardMap::default();
    ///
    /// assert_eq!(map.entry(29).key(), &29);
    /// ```
    #[inline]
    #[must_use]
    pub fn key(&self) -> &K {
        &self.key
    }

    /// Gets a reference to the value in the entry.
    ///
    /// # Examples
    ///
    /// ```
    /// use shardmap::ShardMap;
    ///
    /// let map: ShardMap<u64, u32> = ShardMap::default();
    ///
    /// map.upsert(19, 11);
    /// assert_eq!(map.entry(19).get(), &11);
    /// ```
    #[inline]
    #[must_use]
    pub fn get(&self) -> &V {
        // SAFETY: the pointer was created from the entry in the tree guarded
        // by `self.guard`, and the lock has been held ever since.
        unsafe { self.value.as_ref() }
    }

    /// Gets a mutable reference to the value in the entry.
    ///
    /// # Examples
    ///
    /// ```
    /// use shardmap::ShardMap;
    ///
    /// let map: ShardMap<u64, u32> = ShardMap::default();
    ///
    /// map.upsert(37, 11);
    ///
    /// let mut entry = map.entry(37);
    /// *entry.get_mut() += 18;
    /// drop(entry);
    ///
    /// assert_eq!(map.read(&37, |_, v| *v), Some(29));
    /// ```
    #[inline]
    pub fn get_mut(&mut self) -> &mut V {
        // SAFETY: as in `get`, plus exclusive access through `&mut self`.
        unsafe { self.value.as_mut() }
    }

    /// Sets the value of the entry, and returns the old value.
    ///
    /// # Examples
    ///
    /// ```
    /// use shardmap::ShardMap;
    ///
    /// let map: ShardMap<u64, u32> = ShardMap::default();
    ///
    /// map.upsert(37, 11);
    /// assert_eq!(map.entry(37).insert(17), 11);
    /// assert_eq!(map.read(&37, |_, v| *v), Some(17));
    /// ```
    #[inline]
    pub fn insert(&mut self, val: V) -> V {
        replace(self.get_mut(), val)
    }

    /// Takes ownership of the key and value from the [`ShardMap`].
    ///
    /// # Examples
    ///
    /// ```
    /// use shardmap::ShardMap;
    ///
    /// let map: ShardMap<u64, u32> = ShardMap::default();
    ///
    /// map.upsert(11, 17);
    /// assert_eq!(map.entry(11).remove_entry(), (11, 17));
    /// assert!(map.is_empty());
    /// ```
    #[inline]
    #[must_use]
    pub fn remove_entry(self) -> (K, V) {
        let OccupiedEntry {
            key,
            value: _,
            mut guard,
        } = self;
        // The entry was materialized when the guard was created and the shard
        // lock has been held ever since.
        unsafe { guard.remove_entry(&key).unwrap_unchecked() }
    }

    /// Takes the value out of the entry, and returns it.
    ///
    /// # Examples
    ///
    /// ```
    /// use shardmap::ShardMap;
    ///
    /// let map: ShardMap<u64, u32> = ShardMap::default();
    ///
    /// map.upsert(11, 17);
    /// assert_eq!(map.entry(11).remove(), 17);
    /// ```
    #[inline]
    #[must_use]
    pub fn remove(self) -> V {
        self.remove_entry().1
    }
}

impl<K, V> Debug for OccupiedEntry<'_, K, V>
where
    K: Debug + ShardKey,
    V: Debug,
{
    #[inline]
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OccupiedEntry")
            .field("key", self.key())
            .field("value", self.get())
            .finish_non_exhaustive()
    }
}

impl<K, V> Deref for OccupiedEntry<'_, K, V>
where
    K: ShardKey,
{
    type Target = V;

    #[inline]
    fn deref(&self) -> &Self::Target {
        self.get()
    }
}

impl<K, V> DerefMut for OccupiedEntry<'_, K, V>
where
    K: ShardKey,
{
    #[inline]
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.get_mut()
    }
}

// SAFETY: a shared `OccupiedEntry` only hands out `&K` and `&V`. It stays
// `!Send`: the shard lock must be released on the thread that acquired it.
unsafe impl<K: Sync, V: Sync> Sync for OccupiedEntry<'_, K, V> {}

impl fmt::Display for ZeroShards {
    #[inline]
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("the shard count must be positive")
    }
}

impl std::error::Error for ZeroShards {}
