//! # Atomic Operations
//!
//! An atomic operation is the unit of durability: every tree-level mutation
//! starts one, every bucket mutation performed under it appends a typed
//! page-operation record, and the operation either commits (records go to
//! the WAL in mutation order) or rolls back (records are undone in reverse,
//! restoring the exact byte image of every touched region).
//!
//! ## Record Flow
//!
//! ```text
//! tree.put()
//!   ├── start(rollback_on_error = true)
//!   ├── bucket mutations ──> op.log_page_op(...)   // ordered
//!   ├── op.log_component_op(Put { ... })           // replayable summary
//!   └── commit(op)  ──> WAL frames + sync
//!        or
//!       rollback(op, storage) ──> undo records in reverse
//! ```
//!
//! ## Why Before-Images
//!
//! Each page operation carries the previous value(s) the mutation
//! overwrote. Undo therefore needs no knowledge of what the operation was
//! trying to do, only of the bucket layout it targeted; the appliers live
//! next to the layouts they decode (`bonsai::bucket`, `bonsai::sys`,
//! `sbtree::bucket`) and this module only dispatches.
//!
//! ## Recovery Fence
//!
//! Readers take the shared side of a fence lock for the duration of a read;
//! recovery takes the exclusive side while it replays the log, so a reader
//! never observes a tree mid-replay.

use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};

use eyre::{Result, WrapErr};
use parking_lot::{Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};

use super::wal::{BucketLayout, ComponentOp, PageOp, WalRecord, WalWriter};
use super::Storage;

/// One unit of durability. Accumulates page operations in mutation order
/// plus the component operations describing the logical change.
pub struct AtomicOperation {
    id: u64,
    rollback_on_error: bool,
    page_ops: Vec<PageOp>,
    component_ops: Vec<ComponentOp>,
}

impl AtomicOperation {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn rollback_on_error(&self) -> bool {
        self.rollback_on_error
    }

    pub fn log_page_op(&mut self, op: PageOp) {
        self.page_ops.push(op);
    }

    pub fn log_component_op(&mut self, op: ComponentOp) {
        self.component_ops.push(op);
    }

    pub fn page_ops(&self) -> &[PageOp] {
        &self.page_ops
    }

    pub fn component_ops(&self) -> &[ComponentOp] {
        &self.component_ops
    }
}

#[derive(Debug)]
pub struct AtomicOperationsManager {
    next_operation_id: AtomicU64,
    wal: Option<Mutex<WalWriter>>,
    recovery_fence: RwLock<()>,
}

impl AtomicOperationsManager {
    /// A manager that keeps operations in memory only. Rollback still works;
    /// nothing is persisted for replay.
    pub fn new() -> Self {
        Self {
            next_operation_id: AtomicU64::new(1),
            wal: None,
            recovery_fence: RwLock::new(()),
        }
    }

    /// A manager that appends every committed operation to a WAL file.
    pub fn with_wal<P: AsRef<Path>>(path: P) -> Result<Self> {
        let writer = WalWriter::create(path)?;
        Ok(Self {
            next_operation_id: AtomicU64::new(1),
            wal: Some(Mutex::new(writer)),
            recovery_fence: RwLock::new(()),
        })
    }

    /// Begins a new operation. `rollback_on_error` tags whether the caller
    /// intends to roll back if its work fails (put/remove/clear) or to
    /// propagate without undo (create/delete).
    pub fn start(&self, rollback_on_error: bool) -> AtomicOperation {
        AtomicOperation {
            id: self.next_operation_id.fetch_add(1, Ordering::Relaxed),
            rollback_on_error,
            page_ops: Vec::new(),
            component_ops: Vec::new(),
        }
    }

    /// Commits: appends the operation's records to the WAL (page operations
    /// first, in mutation order, then component operations) and syncs once.
    pub fn commit(&self, op: AtomicOperation) -> Result<()> {
        let Some(wal) = &self.wal else {
            return Ok(());
        };

        let mut writer = wal.lock();
        for page_op in &op.page_ops {
            writer
                .append(op.id, &WalRecord::Page(page_op.clone()))
                .wrap_err("failed to append page operation to WAL")?;
        }
        for component_op in &op.component_ops {
            writer
                .append(op.id, &WalRecord::Component(component_op.clone()))
                .wrap_err("failed to append component operation to WAL")?;
        }
        writer.sync()
    }

    /// Rolls back: applies each page operation's undo in reverse order.
    /// After this returns, every region the operation touched holds its
    /// pre-operation byte image. Nothing reaches the WAL.
    pub fn rollback<S: Storage>(&self, op: AtomicOperation, storage: &mut S) -> Result<()> {
        for page_op in op.page_ops.iter().rev() {
            let page = storage.page_mut(page_op.target.page_index)?;
            let offset = page_op.target.page_offset as usize;

            match page_op.target.layout {
                BucketLayout::Bonsai { bucket_size } => {
                    let region = &mut page[offset..offset + bucket_size as usize];
                    crate::bonsai::bucket::undo_page_op(region, &page_op.kind)?;
                }
                BucketLayout::BonsaiSystem { bucket_size } => {
                    let region = &mut page[offset..offset + bucket_size as usize];
                    crate::bonsai::sys::undo_sys_op(region, &page_op.kind)?;
                }
                BucketLayout::Standard => {
                    crate::sbtree::bucket::undo_page_op(page, &page_op.kind)?;
                }
            }
        }
        Ok(())
    }

    /// Shared side of the recovery fence; held around every read path.
    pub fn acquire_read_fence(&self) -> RwLockReadGuard<'_, ()> {
        self.recovery_fence.read()
    }

    /// Exclusive side of the recovery fence; held while replaying the WAL.
    pub fn acquire_recovery_fence(&self) -> RwLockWriteGuard<'_, ()> {
        self.recovery_fence.write()
    }
}

impl Default for AtomicOperationsManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::wal::{PageOpKind, PageTarget, WalReader};
    use tempfile::tempdir;

    #[test]
    fn operation_ids_are_unique_and_increasing() {
        let manager = AtomicOperationsManager::new();

        let a = manager.start(true);
        let b = manager.start(false);

        assert!(b.id() > a.id());
        assert!(a.rollback_on_error());
        assert!(!b.rollback_on_error());
    }

    #[test]
    fn commit_without_wal_is_a_no_op() {
        let manager = AtomicOperationsManager::new();
        let mut op = manager.start(true);
        op.log_component_op(ComponentOp::Remove {
            file_id: 1,
            raw_key: vec![0],
            raw_value: vec![0],
        });

        assert!(manager.commit(op).is_ok());
    }

    #[test]
    fn commit_writes_records_in_mutation_order() {
        let dir = tempdir().unwrap();
        let wal_path = dir.path().join("arbor.wal");
        let manager = AtomicOperationsManager::with_wal(&wal_path).unwrap();

        let target = PageTarget {
            file_id: 3,
            page_index: 0,
            page_offset: 0,
            layout: BucketLayout::Bonsai { bucket_size: 8192 },
        };

        let mut op = manager.start(true);
        op.log_page_op(PageOp {
            target,
            kind: PageOpKind::SetTreeSize { prev: 0 },
        });
        op.log_page_op(PageOp {
            target,
            kind: PageOpKind::SetDeleted { prev_flags: 1 },
        });
        op.log_component_op(ComponentOp::Put {
            file_id: 3,
            raw_key: vec![1, 0, 0, 0],
            raw_value: vec![0; 8],
            prev_raw_value: None,
        });
        let op_id = op.id();
        manager.commit(op).unwrap();

        let mut reader = WalReader::open(&wal_path).unwrap();
        let (id1, first) = reader.next_record().unwrap().unwrap();
        let (id2, second) = reader.next_record().unwrap().unwrap();
        let (id3, third) = reader.next_record().unwrap().unwrap();

        assert_eq!((id1, id2, id3), (op_id, op_id, op_id));
        assert!(matches!(
            first,
            WalRecord::Page(PageOp {
                kind: PageOpKind::SetTreeSize { prev: 0 },
                ..
            })
        ));
        assert!(matches!(
            second,
            WalRecord::Page(PageOp {
                kind: PageOpKind::SetDeleted { prev_flags: 1 },
                ..
            })
        ));
        assert!(matches!(third, WalRecord::Component(ComponentOp::Put { .. })));
        assert!(reader.next_record().unwrap().is_none());
    }

    #[test]
    fn read_fence_is_shared_until_recovery() {
        let manager = AtomicOperationsManager::new();

        let _reader_a = manager.acquire_read_fence();
        let _reader_b = manager.acquire_read_fence();

        assert!(manager.recovery_fence.try_write().is_none());
    }
}
