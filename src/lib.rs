//! Striped-lock concurrent ordered map.
//!
//! # shardmap::ShardMap
//! A concurrent ordered map for multi-threaded workloads. Entries are spread
//! over a fixed array of independently locked shards, so threads working on
//! keys in different shards never contend with each other, while standard map
//! semantics are preserved within each shard.
//!
//! # shardmap::ShardKey
//! The constraint on key types: anything that deterministically reduces to an
//! unsigned 64-bit shard selector, implemented for the primitive integers.

pub mod shard_map;

mod shard_key;

#[cfg(feature = "serde")]
mod serde;


pub use shard_key::ShardKey;
pub use shard_map::ShardMap;
