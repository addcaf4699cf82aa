//! # System Bucket and Sub-Page Allocator
//!
//! The first bucket region of every bonsai file (page 0, offset 0) is the
//! *system bucket*: per-file allocator state instead of tree data.
//!
//! ## Layout
//!
//! Offsets relative to the region start, little-endian:
//!
//! ```text
//! 0x00 magic              u8    0xA7 once initialized
//! 0x01 free_list_length   i32   buckets on the free list
//! 0x05 free_list_head     16B   first recycled bucket, NULL if none
//! 0x15 free_space_pointer 16B   next never-used region
//! ```
//!
//! ## Allocation Strategy
//!
//! 1. If the free list is non-empty, pop its head: the recycled bucket's
//!    `free_list_pointer` becomes the new head. The region's old bytes are
//!    reused in place; the caller formats it.
//! 2. Otherwise hand out the region at the free-space pointer and advance
//!    it by one bucket size.
//! 3. When the pointer would cross the page boundary, append a fresh page
//!    and start carving it from offset 0.
//!
//! ## Recycling
//!
//! Deleting a subtree walks it breadth-first, marks every bucket DELETED,
//! threads them into a chain through their `free_list_pointer` fields and
//! splices the chain onto the existing free list in one head swap. Each
//! bucket lands on the list exactly once and stays unreferenced by any
//! live parent (the recycling happens after the parent itself was cut
//! loose or recycled).
//!
//! The system bucket is a typed view over page 0 constructed per call;
//! there is no cached allocator state to drift from the file.

use eyre::{bail, ensure, Result};

use super::bucket::FREE_LIST_POINTER_OFFSET;
use super::pointer::BonsaiPointer;
use crate::storage::slotted::{read_i32, write_i32};
use crate::storage::wal::{BucketLayout, PageOp, PageOpKind, PageTarget};
use crate::storage::{AtomicOperation, MmapStorage, Storage, PAGE_SIZE};

const SYS_MAGIC: u8 = 0xA7;

const MAGIC_OFFSET: usize = 0x00;
const FREE_LIST_LENGTH_OFFSET: usize = 0x01;
const FREE_LIST_HEAD_OFFSET: usize = 0x05;
const FREE_SPACE_POINTER_OFFSET: usize = 0x15;

pub(crate) const SYS_HEADER_SIZE: usize = 0x25;

pub(crate) fn sys_target(file_id: u64, bucket_size: usize) -> PageTarget {
    PageTarget {
        file_id,
        page_index: 0,
        page_offset: 0,
        layout: BucketLayout::BonsaiSystem {
            bucket_size: bucket_size as u32,
        },
    }
}

pub(crate) struct SysBucket<'a> {
    region: &'a [u8],
}

impl<'a> SysBucket<'a> {
    pub fn open(region: &'a [u8]) -> Self {
        debug_assert!(region.len() >= SYS_HEADER_SIZE);
        Self { region }
    }

    pub fn is_initialized(&self) -> bool {
        self.region[MAGIC_OFFSET] == SYS_MAGIC
    }

    pub fn free_list_length(&self) -> i32 {
        read_i32(self.region, FREE_LIST_LENGTH_OFFSET)
    }

    pub fn free_list_head(&self) -> BonsaiPointer {
        BonsaiPointer::read_from(&self.region[FREE_LIST_HEAD_OFFSET..])
    }

    pub fn free_space_pointer(&self) -> BonsaiPointer {
        BonsaiPointer::read_from(&self.region[FREE_SPACE_POINTER_OFFSET..])
    }
}

pub(crate) struct SysBucketMut<'a> {
    region: &'a mut [u8],
    target: PageTarget,
    op: &'a mut AtomicOperation,
}

impl<'a> SysBucketMut<'a> {
    pub fn open(region: &'a mut [u8], target: PageTarget, op: &'a mut AtomicOperation) -> Self {
        debug_assert!(region.len() >= SYS_HEADER_SIZE);
        Self { region, target, op }
    }

    fn log(&mut self, kind: PageOpKind) {
        self.op.log_page_op(PageOp {
            target: self.target,
            kind,
        });
    }

    /// Initializes allocator state: empty free list, free space starting at
    /// the region right after this one.
    pub fn format(&mut self, bucket_size: usize) {
        let prev_header = self.region[..SYS_HEADER_SIZE].to_vec();

        self.region[MAGIC_OFFSET] = SYS_MAGIC;
        write_i32(self.region, FREE_LIST_LENGTH_OFFSET, 0);
        BonsaiPointer::NULL.write_to(&mut self.region[FREE_LIST_HEAD_OFFSET..]);
        BonsaiPointer::new(0, bucket_size as i32)
            .write_to(&mut self.region[FREE_SPACE_POINTER_OFFSET..]);

        self.log(PageOpKind::SysFormat { prev_header });
    }

    pub fn set_free_list_head(&mut self, pointer: BonsaiPointer) {
        let prev =
            self.region[FREE_LIST_HEAD_OFFSET..FREE_LIST_HEAD_OFFSET + BonsaiPointer::SIZE].to_vec();
        pointer.write_to(&mut self.region[FREE_LIST_HEAD_OFFSET..]);
        self.log(PageOpKind::SetFreeListHead { prev });
    }

    pub fn set_free_list_length(&mut self, length: i32) {
        let prev = read_i32(self.region, FREE_LIST_LENGTH_OFFSET);
        write_i32(self.region, FREE_LIST_LENGTH_OFFSET, length);
        self.log(PageOpKind::SetFreeListLength { prev });
    }

    pub fn set_free_space_pointer(&mut self, pointer: BonsaiPointer) {
        let prev = self.region
            [FREE_SPACE_POINTER_OFFSET..FREE_SPACE_POINTER_OFFSET + BonsaiPointer::SIZE]
            .to_vec();
        pointer.write_to(&mut self.region[FREE_SPACE_POINTER_OFFSET..]);
        self.log(PageOpKind::SetFreeSpacePointer { prev });
    }
}

/// Initializes the system bucket if this file has never seen one.
pub(crate) fn ensure_initialized(
    storage: &mut MmapStorage,
    op: &mut AtomicOperation,
    file_id: u64,
    bucket_size: usize,
) -> Result<()> {
    if storage.page_count() == 0 {
        storage.add_page()?;
    }

    let page = storage.page_mut(0)?;
    let region = &mut page[..bucket_size];
    if !SysBucket::open(region).is_initialized() {
        let mut sys = SysBucketMut::open(region, sys_target(file_id, bucket_size), op);
        sys.format(bucket_size);
    }
    Ok(())
}

/// Hands out one bucket region: free-list pop, free-space bump, or fresh
/// page, in that order.
pub(crate) fn allocate_bucket(
    storage: &mut MmapStorage,
    op: &mut AtomicOperation,
    file_id: u64,
    bucket_size: usize,
) -> Result<BonsaiPointer> {
    let (length, head, free_space) = {
        let page = storage.page(0)?;
        let sys = SysBucket::open(&page[..bucket_size]);
        (
            sys.free_list_length(),
            sys.free_list_head(),
            sys.free_space_pointer(),
        )
    };

    if length > 0 {
        ensure!(
            head.is_valid(),
            "free list of file {} reports {} buckets but a NULL head",
            file_id,
            length
        );

        let next = {
            let page = storage.page(head.page_index as u32)?;
            let offset = head.page_offset as usize;
            BonsaiPointer::read_from(&page[offset + FREE_LIST_POINTER_OFFSET..])
        };

        let page = storage.page_mut(0)?;
        let mut sys = SysBucketMut::open(
            &mut page[..bucket_size],
            sys_target(file_id, bucket_size),
            op,
        );
        sys.set_free_list_head(next);
        sys.set_free_list_length(length - 1);

        return Ok(head);
    }

    if free_space.page_offset as usize + bucket_size > PAGE_SIZE {
        let new_page = storage.add_page()?;

        let page = storage.page_mut(0)?;
        let mut sys = SysBucketMut::open(
            &mut page[..bucket_size],
            sys_target(file_id, bucket_size),
            op,
        );
        sys.set_free_space_pointer(BonsaiPointer::new(new_page as i64, bucket_size as i32));

        Ok(BonsaiPointer::new(new_page as i64, 0))
    } else {
        let page = storage.page_mut(0)?;
        let mut sys = SysBucketMut::open(
            &mut page[..bucket_size],
            sys_target(file_id, bucket_size),
            op,
        );
        sys.set_free_space_pointer(BonsaiPointer::new(
            free_space.page_index,
            free_space.page_offset + bucket_size as i32,
        ));

        Ok(free_space)
    }
}

/// Applies the inverse of one system-bucket mutation.
pub(crate) fn undo_sys_op(region: &mut [u8], kind: &PageOpKind) -> Result<()> {
    match kind {
        PageOpKind::SysFormat { prev_header } => {
            region[..prev_header.len()].copy_from_slice(prev_header);
            Ok(())
        }
        PageOpKind::SetFreeListHead { prev } => {
            region[FREE_LIST_HEAD_OFFSET..FREE_LIST_HEAD_OFFSET + prev.len()]
                .copy_from_slice(prev);
            Ok(())
        }
        PageOpKind::SetFreeListLength { prev } => {
            write_i32(region, FREE_LIST_LENGTH_OFFSET, *prev);
            Ok(())
        }
        PageOpKind::SetFreeSpacePointer { prev } => {
            region[FREE_SPACE_POINTER_OFFSET..FREE_SPACE_POINTER_OFFSET + prev.len()]
                .copy_from_slice(prev);
            Ok(())
        }
        other => bail!(
            "page operation {:?} does not target the system bucket",
            other
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::AtomicOperationsManager;
    use tempfile::tempdir;

    const BUCKET: usize = 8192;

    fn fresh_file() -> (tempfile::TempDir, MmapStorage) {
        let dir = tempdir().unwrap();
        let storage = MmapStorage::create(dir.path().join("t.arb"), 1).unwrap();
        (dir, storage)
    }

    #[test]
    fn fresh_page_is_uninitialized() {
        let (_dir, storage) = fresh_file();

        let page = storage.page(0).unwrap();
        assert!(!SysBucket::open(&page[..BUCKET]).is_initialized());
    }

    #[test]
    fn format_starts_free_space_after_the_sys_region() {
        let (_dir, mut storage) = fresh_file();
        let manager = AtomicOperationsManager::new();
        let mut op = manager.start(false);

        ensure_initialized(&mut storage, &mut op, 1, BUCKET).unwrap();

        let page = storage.page(0).unwrap();
        let sys = SysBucket::open(&page[..BUCKET]);
        assert!(sys.is_initialized());
        assert_eq!(sys.free_list_length(), 0);
        assert!(!sys.free_list_head().is_valid());
        assert_eq!(sys.free_space_pointer(), BonsaiPointer::new(0, BUCKET as i32));
    }

    #[test]
    fn allocation_advances_the_high_water_mark() {
        let (_dir, mut storage) = fresh_file();
        let manager = AtomicOperationsManager::new();
        let mut op = manager.start(false);
        ensure_initialized(&mut storage, &mut op, 1, BUCKET).unwrap();

        let first = allocate_bucket(&mut storage, &mut op, 1, BUCKET).unwrap();
        let second = allocate_bucket(&mut storage, &mut op, 1, BUCKET).unwrap();

        // 16KB page, 8KB regions: offset 8192 is the only free region of
        // page 0, then allocation rolls onto page 1
        assert_eq!(first, BonsaiPointer::new(0, BUCKET as i32));
        assert_eq!(second, BonsaiPointer::new(1, 0));
        assert_eq!(storage.page_count(), 2);
    }

    #[test]
    fn page_boundary_rolls_to_a_fresh_page() {
        let (_dir, mut storage) = fresh_file();
        let manager = AtomicOperationsManager::new();
        let mut op = manager.start(false);
        ensure_initialized(&mut storage, &mut op, 1, BUCKET).unwrap();

        allocate_bucket(&mut storage, &mut op, 1, BUCKET).unwrap();
        allocate_bucket(&mut storage, &mut op, 1, BUCKET).unwrap();
        let third = allocate_bucket(&mut storage, &mut op, 1, BUCKET).unwrap();

        assert_eq!(third, BonsaiPointer::new(1, BUCKET as i32));

        let page = storage.page(0).unwrap();
        let sys = SysBucket::open(&page[..BUCKET]);
        assert_eq!(sys.free_space_pointer(), BonsaiPointer::new(2, 0));
    }

    #[test]
    fn free_list_pop_takes_priority() {
        let (_dir, mut storage) = fresh_file();
        let manager = AtomicOperationsManager::new();
        let mut op = manager.start(false);
        ensure_initialized(&mut storage, &mut op, 1, BUCKET).unwrap();

        let recycled = allocate_bucket(&mut storage, &mut op, 1, BUCKET).unwrap();

        // thread the bucket onto the free list by hand
        {
            let page = storage
                .page_mut(recycled.page_index as u32)
                .unwrap();
            let offset = recycled.page_offset as usize;
            BonsaiPointer::NULL
                .write_to(&mut page[offset + FREE_LIST_POINTER_OFFSET..]);
        }
        {
            let page = storage.page_mut(0).unwrap();
            let mut sys =
                SysBucketMut::open(&mut page[..BUCKET], sys_target(1, BUCKET), &mut op);
            sys.set_free_list_head(recycled);
            sys.set_free_list_length(1);
        }

        let reused = allocate_bucket(&mut storage, &mut op, 1, BUCKET).unwrap();

        assert_eq!(reused, recycled);
        let page = storage.page(0).unwrap();
        let sys = SysBucket::open(&page[..BUCKET]);
        assert_eq!(sys.free_list_length(), 0);
        assert!(!sys.free_list_head().is_valid());
    }

    #[test]
    fn sys_mutations_are_undone_byte_exactly() {
        let (_dir, mut storage) = fresh_file();
        let manager = AtomicOperationsManager::new();
        let mut setup = manager.start(false);
        ensure_initialized(&mut storage, &mut setup, 1, BUCKET).unwrap();

        let snapshot = storage.page(0).unwrap()[..BUCKET].to_vec();

        let mut op = manager.start(true);
        allocate_bucket(&mut storage, &mut op, 1, BUCKET).unwrap();
        allocate_bucket(&mut storage, &mut op, 1, BUCKET).unwrap();

        let ops: Vec<_> = op.page_ops().iter().rev().cloned().collect();
        let page = storage.page_mut(0).unwrap();
        for page_op in ops {
            undo_sys_op(&mut page[..BUCKET], &page_op.kind).unwrap();
        }

        assert_eq!(&page[..BUCKET], &snapshot[..]);
    }
}
