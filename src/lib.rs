//! # Arbor - Embeddable On-Disk B+-Tree Index Engine
//!
//! Arbor is the index engine of a paginated storage subsystem: two closely
//! related B+-tree variants over memory-mapped page files, coupled to a
//! write-ahead log through atomic operations with byte-exact rollback.
//!
//! - **Standard tree** ([`SbTree`]): one bucket per 16KB page. Handles
//!   variable-length values, external-value links and optional key
//!   encryption.
//! - **Bonsai tree** ([`BonsaiTree`]): many small fixed-size buckets packed
//!   into each page, carved out by a per-file sub-page allocator with a
//!   free list. Built for workloads that create thousands of tiny trees
//!   (RID bags, per-record indexes) where a page per bucket would waste
//!   most of the file.
//!
//! Both variants share one algorithmic core: the slotted bucket layout,
//! lower-bound binary search, midpoint splits with in-place root
//! conversion, sibling-linked leaves for ascending scans, and the
//! durability discipline where every bucket mutation logs a typed
//! before-image record.
//!
//! ## Quick Start
//!
//! ```ignore
//! use std::sync::Arc;
//! use arbor::{AtomicOperationsManager, BonsaiTree, FileLockManager};
//!
//! let locks = Arc::new(FileLockManager::new());
//! let atomics = Arc::new(AtomicOperationsManager::new());
//!
//! let tree = BonsaiTree::<i32, i64>::create(
//!     "./bag.arb", "bag", 8192, locks, atomics)?;
//!
//! tree.put(&1, &10)?;
//! assert_eq!(tree.get(&1)?, Some(10));
//! tree.load_entries_major(&0, true, true, |entry| {
//!     println!("{} -> {:?}", entry.key, entry.value);
//!     true
//! })?;
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────┐
//! │   Tree Engines (SbTree / BonsaiTree)        │
//! ├──────────────────────┬──────────────────────┤
//! │  Slotted Buckets     │  Sub-Page Allocator  │
//! ├──────────────────────┴──────────────────────┤
//! │  Atomic Operations (undo / commit / fence)  │
//! ├─────────────────────────────────────────────┤
//! │  WAL Records   │   Partitioned File Locks   │
//! ├─────────────────────────────────────────────┤
//! │     Memory-Mapped Paged Files (16KB)        │
//! └─────────────────────────────────────────────┘
//! ```
//!
//! ## Durability Model
//!
//! Every mutating entry point starts an atomic operation and takes its
//! file's exclusive lock. Bucket mutations append typed page operations
//! carrying the bytes they overwrote; the entry point appends one
//! replayable component operation (create/put/remove). Success commits the
//! records to the WAL in mutation order; failure undoes the page
//! operations in reverse, restoring every touched region to its exact
//! prior byte image, and re-raises the error.
//!
//! ## Module Overview
//!
//! - [`storage`]: mmap paged files, file locks, WAL records, atomic ops
//! - [`bonsai`]: bonsai bucket, system bucket + allocator, tree engine
//! - [`sbtree`]: standard bucket and tree engine
//! - [`encoding`]: key/value serializer traits and stock codecs
//! - [`encryption`]: optional key-encryption seam
//! - [`config`]: centralized size constants

pub mod bonsai;
pub mod config;
pub mod encoding;
pub mod encryption;
pub mod sbtree;
pub mod storage;

pub use bonsai::{BonsaiEntry, BonsaiPointer, BonsaiTree, BucketState, Change};
pub use encoding::{TreeKey, TreeValue};
pub use encryption::EncryptionCodec;
pub use sbtree::{SbEntry, SbTree, SbValue};
pub use storage::{AtomicOperationsManager, FileLockManager, MmapStorage};
