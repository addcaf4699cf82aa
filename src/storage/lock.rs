//! # Partitioned File-Lock Manager
//!
//! A process-wide lock manager keyed by file id, offering shared and
//! exclusive modes. One tree operation takes exactly one acquire/release:
//! reads hold the shared mode, mutations hold the exclusive mode for the
//! whole atomic operation. There is no hand-over-hand latching inside a
//! tree; the entire operation is serialized on its file.
//!
//! ## Sharding
//!
//! A single global lock table would serialize unrelated indexes. Instead the
//! manager keeps a fixed array of `parking_lot::RwLock` shards and hashes
//! each file id onto one:
//!
//! ```text
//! FileLockManager
//! ├── Shard 0:  RwLock<()>
//! ├── Shard 1:  RwLock<()>
//! ├── ...
//! └── Shard 63: RwLock<()>
//! ```
//!
//! Two files may share a shard; that is a throughput concern, never a
//! correctness one, since sharing only makes the lock stricter.
//!
//! ## File Ids
//!
//! The manager is also the id authority: `register_file()` hands out unique
//! ids from an atomic counter, so every tree in a process locks a distinct
//! key (modulo shard collisions).

use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::config::LOCK_SHARD_COUNT;

#[derive(Debug)]
pub struct FileLockManager {
    shards: Vec<RwLock<()>>,
    next_file_id: AtomicU64,
}

impl FileLockManager {
    pub fn new() -> Self {
        let mut shards = Vec::with_capacity(LOCK_SHARD_COUNT);
        for _ in 0..LOCK_SHARD_COUNT {
            shards.push(RwLock::new(()));
        }

        Self {
            shards,
            next_file_id: AtomicU64::new(1),
        }
    }

    /// Allocates a fresh file id for a newly opened index.
    pub fn register_file(&self) -> u64 {
        self.next_file_id.fetch_add(1, Ordering::Relaxed)
    }

    fn shard(&self, file_id: u64) -> &RwLock<()> {
        let index = (file_id as usize).wrapping_mul(31) & (LOCK_SHARD_COUNT - 1);
        &self.shards[index]
    }

    pub fn shared(&self, file_id: u64) -> RwLockReadGuard<'_, ()> {
        self.shard(file_id).read()
    }

    pub fn exclusive(&self, file_id: u64) -> RwLockWriteGuard<'_, ()> {
        self.shard(file_id).write()
    }
}

impl Default for FileLockManager {
    fn default() -> Self {
        Self::new()
    }
}
