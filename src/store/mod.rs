//! Store Module
//!
//! Lock-striped in-memory hash table holding the live keyspace.
//!
//! ## Responsibilities
//! - Partition keys across a power-of-two number of shards
//! - Shared lock for reads, exclusive lock for writes, one shard at a time
//! - Lock-free live key count, updated only inside a shard's write section
//! - Expose "caller already holds the lock" access through shard guards
//!
//! ## Layout
//! ```text
//!              fnv32(key) & (shards - 1)
//!                        │
//!   ┌────────┬────────┬──▼─────┬────────┬─────────┐
//!   │Shard 0 │Shard 1 │Shard 2 │  ...   │Shard N-1│
//!   │RwLock  │RwLock  │RwLock  │        │RwLock   │
//!   │HashMap │HashMap │HashMap │        │HashMap  │
//!   └────────┴────────┴────────┴────────┴─────────┘
//!                 count: AtomicUsize
//! ```

mod guard;
mod sharded;

pub use guard::{ShardReadGuard, ShardWriteGuard, StoreWriteGuard};
pub use sharded::ShardedStore;

/// Smallest shard count a store is ever built with
pub const MIN_SHARDS: usize = 16;

const OFFSET_BASIS32: u32 = 2_166_136_261;
const PRIME32: u32 = 16_777_619;

/// 32-bit FNV hash used to pick a key's shard.
///
/// Multiplies before folding in each byte.
pub fn fnv32(key: &[u8]) -> u32 {
    let mut hash = OFFSET_BASIS32;
    for &byte in key {
        hash = hash.wrapping_mul(PRIME32);
        hash ^= byte as u32;
    }
    hash
}

/// Smallest power of two that is >= max(requested, 16)
pub fn compute_capacity(requested: usize) -> usize {
    if requested <= MIN_SHARDS {
        return MIN_SHARDS;
    }
    requested
        .checked_next_power_of_two()
        .unwrap_or(1 << (usize::BITS - 1))
}
