//! # Storage Module
//!
//! This module provides the foundational storage layer for Arbor: a
//! memory-mapped paged file, the partitioned file-lock manager, the WAL
//! record model and the atomic-operation machinery that ties bucket
//! mutations to rollback and recovery.
//!
//! ## Architecture Overview
//!
//! Index files are plain sequences of fixed-size pages accessed through
//! memory mapping. Instead of a pin/release page cache with runtime
//! bookkeeping, Arbor leans on the borrow checker:
//!
//! ```text
//! Storage::page(&self, page_no)      -> &[u8]      // shared load
//! Storage::page_mut(&mut self, ..)   -> &mut [u8]  // exclusive load
//! drop of the borrow                               // release
//! ```
//!
//! Acquiring a page for write is an exclusive borrow of the storage, so no
//! stale page reference can survive a `grow()` remap, and "every acquired
//! entry is released exactly once on every control-flow exit" holds by
//! construction rather than by audit.
//!
//! ## Page Size
//!
//! All storage uses 16KB (16384 byte) pages. The bonsai variant carves each
//! page into several fixed-size bucket regions; the standard variant uses
//! one bucket per page.
//!
//! ## Module Organization
//!
//! - `mmap`: memory-mapped paged file (`MmapStorage`)
//! - `lock`: process-wide partitioned file-lock manager
//! - `slotted`: byte-level slotted-region primitives shared by both bucket
//!   layouts, including the typed undo appliers
//! - `wal`: WAL record model (page operations, component operations) and the
//!   frame-oriented writer/reader
//! - `atomic`: atomic operations and their manager (commit, byte-exact
//!   rollback, recovery fence)
//!
//! ## Thread Safety
//!
//! `MmapStorage` is `Send` but not `Sync`. Trees wrap their storage in
//! `parking_lot::RwLock`; the blanket `Storage` impl for write guards lets a
//! guard be passed wherever plain storage is expected.

pub mod atomic;
pub mod lock;
mod mmap;
pub(crate) mod slotted;
pub mod wal;

pub use atomic::{AtomicOperation, AtomicOperationsManager};
pub use lock::FileLockManager;
pub use mmap::MmapStorage;
pub use wal::{BucketLayout, ComponentOp, PageOp, PageOpKind, PageTarget, WalReader, WalWriter};

use eyre::Result;

pub const PAGE_SIZE: usize = 16384;

pub trait Storage {
    fn page(&self, page_no: u32) -> Result<&[u8]>;
    fn page_mut(&mut self, page_no: u32) -> Result<&mut [u8]>;
    fn grow(&mut self, new_page_count: u32) -> Result<()>;
    fn page_count(&self) -> u32;
    fn sync(&self) -> Result<()>;

    /// Appends one zeroed page and returns its index.
    fn add_page(&mut self) -> Result<u32> {
        let page_no = self.page_count();
        self.grow(page_no + 1)?;
        Ok(page_no)
    }
}

impl Storage for MmapStorage {
    fn page(&self, page_no: u32) -> Result<&[u8]> {
        MmapStorage::page(self, page_no)
    }

    fn page_mut(&mut self, page_no: u32) -> Result<&mut [u8]> {
        MmapStorage::page_mut(self, page_no)
    }

    fn grow(&mut self, new_page_count: u32) -> Result<()> {
        MmapStorage::grow(self, new_page_count)
    }

    fn page_count(&self) -> u32 {
        MmapStorage::page_count(self)
    }

    fn sync(&self) -> Result<()> {
        MmapStorage::sync(self)
    }
}

impl<S: Storage> Storage for parking_lot::RwLockWriteGuard<'_, S> {
    fn page(&self, page_no: u32) -> Result<&[u8]> {
        (**self).page(page_no)
    }

    fn page_mut(&mut self, page_no: u32) -> Result<&mut [u8]> {
        (**self).page_mut(page_no)
    }

    fn grow(&mut self, new_page_count: u32) -> Result<()> {
        (**self).grow(new_page_count)
    }

    fn page_count(&self) -> u32 {
        (**self).page_count()
    }

    fn sync(&self) -> Result<()> {
        (**self).sync()
    }
}
