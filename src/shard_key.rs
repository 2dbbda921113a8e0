//! [`ShardKey`] is the key constraint of a [`ShardMap`](super::ShardMap).

/// Key types that deterministically reduce to an unsigned 64-bit shard
/// selector.
///
/// A [`ShardMap`](super::ShardMap) places a key by taking
/// [`widen`](Self::widen) modulo the shard count, so the reduction must be
/// deterministic and total over the whole key domain: the same key has to land
/// in the same shard on every call. The trait is implemented for every
/// primitive fixed-width integer. Signed keys widen by sign extension, the
/// same conversion as a cast to a 64-bit unsigned integer, which keeps
/// negative keys on a deterministic shard.
///
/// # Examples
///
/// ```
/// use shardmap::ShardKey;
///
/// assert_eq!(300_u64.widen(), 300);
/// assert_eq!((-1_i32).widen(), u64::MAX);
/// ```
pub trait ShardKey: Clone + Ord {
    /// Reduces the key to an unsigned 64-bit integer.
    fn widen(&self) -> u64;
}

macro_rules! impl_shard_key {
    ($($int:ty),*) => {$(
        impl ShardKey for $int {
            #[inline]
            fn widen(&self) -> u64 {
                *self as u64
            }
        }
    )*};
}

impl_shard_key!(u8, u16, u32, u64, u128, usize, i8, i16, i32, i64, i128, isize);
