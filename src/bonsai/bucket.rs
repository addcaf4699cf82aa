//! # Bonsai Slotted Bucket
//!
//! A bucket is one fixed-size region inside a page: a header, a slot
//! directory of i32 entry offsets growing up, and an entry area growing
//! down from the region end. This module is the byte-level view over one
//! such region, in two flavors:
//!
//! - `BonsaiBucket`: read-only, borrows `&[u8]`
//! - `BonsaiBucketMut`: mutating, borrows `&mut [u8]` plus the atomic
//!   operation that collects a typed page-operation record for every
//!   mutation
//!
//! ## Entry Encodings
//!
//! ```text
//! leaf:      [key bytes][value bytes]          value is fixed-length
//! internal:  [left child 12B][right child 12B][key bytes]
//! ```
//!
//! Child pointers in internal entries use the 12-byte form (page i64,
//! offset i32); the layout version is recovered from context.
//!
//! ## Search
//!
//! `find` is the canonical ascending lower-bound binary search with the
//! unsigned midpoint, returning the index on a hit and `-(insertion
//! point) - 1` on a miss.
//!
//! ## Mutation Logging
//!
//! Every mutation appends one page operation carrying the bytes it
//! overwrote, which is what makes rollback byte-exact: an insert records
//! the free-space bytes it clobbered, a neighbor-pointer patch records the
//! 12 bytes it replaced, a shrink records the entire rewritten span. See
//! `storage::slotted` for the shared mechanics and their inverses.
//!
//! ## Thread Safety
//!
//! Bucket views borrow page bytes and are confined to the thread holding
//! the file lock; the tree layer serializes access per file.

use std::marker::PhantomData;

use eyre::{bail, ensure, Result};

use super::pointer::BonsaiPointer;
use crate::config::MAX_ENTRY_SIZE;
use crate::encoding::{TreeKey, TreeValue};
use crate::storage::slotted::{self, FLAGS_OFFSET};
use crate::storage::wal::{PageOp, PageOpKind, PageTarget};
use crate::storage::AtomicOperation;

pub(crate) const FREE_LIST_POINTER_OFFSET: usize = 0x09;
pub(crate) const LEFT_SIBLING_OFFSET: usize = 0x19;
pub(crate) const RIGHT_SIBLING_OFFSET: usize = 0x29;
pub(crate) const TREE_SIZE_OFFSET: usize = 0x39;
pub(crate) const KEY_SERIALIZER_OFFSET: usize = 0x41;
pub(crate) const VALUE_SERIALIZER_OFFSET: usize = 0x42;
pub(crate) const POSITIONS_ARRAY_OFFSET: usize = 0x43;

const FLAG_LEAF: u8 = 0x1;
const FLAG_DELETED: u8 = 0x2;

/// Typed view of the flag byte. The bitset on disk stays a bitset; this
/// enum exists so code that cares about bucket kind never tests raw bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BucketState {
    Leaf,
    Internal,
    DeletedLeaf,
    DeletedInternal,
}

impl BucketState {
    pub fn from_flags(flags: u8) -> Result<Self> {
        match (flags & FLAG_LEAF != 0, flags & FLAG_DELETED != 0) {
            (true, false) => Ok(BucketState::Leaf),
            (false, false) => Ok(BucketState::Internal),
            (true, true) => Ok(BucketState::DeletedLeaf),
            (false, true) => Ok(BucketState::DeletedInternal),
        }
    }

    pub fn is_leaf(self) -> bool {
        matches!(self, BucketState::Leaf | BucketState::DeletedLeaf)
    }

    pub fn is_deleted(self) -> bool {
        matches!(self, BucketState::DeletedLeaf | BucketState::DeletedInternal)
    }
}

/// One decoded bucket entry. Leaf entries carry a value and NULL children;
/// internal entries carry children and no value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BonsaiEntry<K, V> {
    pub left_child: BonsaiPointer,
    pub right_child: BonsaiPointer,
    pub key: K,
    pub value: Option<V>,
}

pub(crate) struct BonsaiBucket<'a, K, V> {
    region: &'a [u8],
    _marker: PhantomData<fn() -> (K, V)>,
}

impl<'a, K: TreeKey, V: TreeValue> BonsaiBucket<'a, K, V> {
    pub fn open(region: &'a [u8]) -> Self {
        debug_assert!(region.len() > POSITIONS_ARRAY_OFFSET);
        Self {
            region,
            _marker: PhantomData,
        }
    }

    pub fn size(&self) -> usize {
        slotted::size(self.region)
    }

    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }

    fn flags(&self) -> u8 {
        self.region[FLAGS_OFFSET]
    }

    pub fn state(&self) -> Result<BucketState> {
        BucketState::from_flags(self.flags())
    }

    pub fn is_leaf(&self) -> bool {
        self.flags() & FLAG_LEAF != 0
    }

    pub fn is_deleted(&self) -> bool {
        self.flags() & FLAG_DELETED != 0
    }

    pub fn tree_size(&self) -> i64 {
        slotted::read_i64(self.region, TREE_SIZE_OFFSET)
    }

    pub fn left_sibling(&self) -> BonsaiPointer {
        BonsaiPointer::read_from(&self.region[LEFT_SIBLING_OFFSET..])
    }

    pub fn right_sibling(&self) -> BonsaiPointer {
        BonsaiPointer::read_from(&self.region[RIGHT_SIBLING_OFFSET..])
    }

    pub fn free_list_pointer(&self) -> BonsaiPointer {
        BonsaiPointer::read_from(&self.region[FREE_LIST_POINTER_OFFSET..])
    }

    pub fn key_serializer_id(&self) -> u8 {
        self.region[KEY_SERIALIZER_OFFSET]
    }

    pub fn value_serializer_id(&self) -> u8 {
        self.region[VALUE_SERIALIZER_OFFSET]
    }

    fn entry_position(&self, index: usize) -> Result<usize> {
        ensure!(
            index < self.size(),
            "entry index {} out of bounds (size={})",
            index,
            self.size()
        );
        let position = slotted::position(self.region, POSITIONS_ARRAY_OFFSET, index);
        ensure!(
            position < self.region.len(),
            "corrupt slot {}: position {} beyond region of {} bytes",
            index,
            position,
            self.region.len()
        );
        Ok(position)
    }

    pub fn key_at(&self, index: usize) -> Result<K> {
        let mut position = self.entry_position(index)?;
        if !self.is_leaf() {
            position += 2 * BonsaiPointer::CHILD_SIZE;
        }
        K::read_from(&self.region[position..])
    }

    /// Canonical lower-bound binary search. Returns the index on a hit and
    /// `-(insertion point) - 1` on a miss.
    pub fn find(&self, key: &K) -> Result<i32> {
        let mut low: i32 = 0;
        let mut high: i32 = self.size() as i32 - 1;

        while low <= high {
            let mid = ((low + high) as u32 >> 1) as i32;
            let mid_key = self.key_at(mid as usize)?;

            match mid_key.cmp(key) {
                std::cmp::Ordering::Less => low = mid + 1,
                std::cmp::Ordering::Greater => high = mid - 1,
                std::cmp::Ordering::Equal => return Ok(mid),
            }
        }
        Ok(-(low + 1))
    }

    pub fn entry_at(&self, index: usize) -> Result<BonsaiEntry<K, V>> {
        let position = self.entry_position(index)?;

        if self.is_leaf() {
            let key = K::read_from(&self.region[position..])?;
            let key_size = K::size_in_buffer(&self.region[position..])?;
            let value = V::read_from(&self.region[position + key_size..])?;

            Ok(BonsaiEntry {
                left_child: BonsaiPointer::NULL,
                right_child: BonsaiPointer::NULL,
                key,
                value: Some(value),
            })
        } else {
            let left_child = BonsaiPointer::read_child(&self.region[position..]);
            let right_child =
                BonsaiPointer::read_child(&self.region[position + BonsaiPointer::CHILD_SIZE..]);
            let key =
                K::read_from(&self.region[position + 2 * BonsaiPointer::CHILD_SIZE..])?;

            Ok(BonsaiEntry {
                left_child,
                right_child,
                key,
                value: None,
            })
        }
    }

    /// The stored bytes of one entry, exactly as laid out in the region.
    pub fn raw_entry_at(&self, index: usize) -> Result<Vec<u8>> {
        let position = self.entry_position(index)?;

        if self.is_leaf() {
            let key_size = K::size_in_buffer(&self.region[position..])?;
            let value_size = V::size_in_buffer(&self.region[position + key_size..])?;
            Ok(self.region[position..position + key_size + value_size].to_vec())
        } else {
            let children = 2 * BonsaiPointer::CHILD_SIZE;
            let key_size = K::size_in_buffer(&self.region[position + children..])?;
            Ok(self.region[position..position + children + key_size].to_vec())
        }
    }

    /// Raw key and value bytes of a leaf entry, separately.
    pub fn raw_leaf_entry_at(&self, index: usize) -> Result<(Vec<u8>, Vec<u8>)> {
        ensure!(self.is_leaf(), "raw leaf access on an internal bucket");
        let position = self.entry_position(index)?;

        let key_size = K::size_in_buffer(&self.region[position..])?;
        let value_size = V::size_in_buffer(&self.region[position + key_size..])?;

        let raw_key = self.region[position..position + key_size].to_vec();
        let raw_value =
            self.region[position + key_size..position + key_size + value_size].to_vec();
        Ok((raw_key, raw_value))
    }

    /// Raw value bytes of a leaf entry whose key length is already known.
    pub fn raw_value_at(&self, index: usize, key_size: usize) -> Result<Vec<u8>> {
        ensure!(self.is_leaf(), "raw value access on an internal bucket");
        let position = self.entry_position(index)?;

        let value_size = V::size_in_buffer(&self.region[position + key_size..])?;
        Ok(self.region[position + key_size..position + key_size + value_size].to_vec())
    }
}

pub(crate) struct BonsaiBucketMut<'a, K, V> {
    region: &'a mut [u8],
    target: PageTarget,
    op: &'a mut AtomicOperation,
    _marker: PhantomData<fn() -> (K, V)>,
}

impl<'a, K: TreeKey, V: TreeValue> BonsaiBucketMut<'a, K, V> {
    pub fn open(region: &'a mut [u8], target: PageTarget, op: &'a mut AtomicOperation) -> Self {
        debug_assert!(region.len() > POSITIONS_ARRAY_OFFSET);
        Self {
            region,
            target,
            op,
            _marker: PhantomData,
        }
    }

    pub fn as_read(&self) -> BonsaiBucket<'_, K, V> {
        BonsaiBucket {
            region: self.region,
            _marker: PhantomData,
        }
    }

    fn log(&mut self, kind: PageOpKind) {
        self.op.log_page_op(PageOp {
            target: self.target,
            kind,
        });
    }

    pub fn size(&self) -> usize {
        slotted::size(self.region)
    }

    pub fn is_leaf(&self) -> bool {
        self.region[FLAGS_OFFSET] & FLAG_LEAF != 0
    }

    /// (Re)initializes the region as an empty bucket, clearing a DELETED
    /// flag if present. Siblings and the free-list pointer become NULL.
    pub fn format(&mut self, leaf: bool) {
        let prev_header = self.region[..POSITIONS_ARRAY_OFFSET].to_vec();

        let region_end = self.region.len();
        slotted::set_free_pointer(self.region, region_end);
        slotted::set_size(self.region, 0);
        self.region[FLAGS_OFFSET] = if leaf { FLAG_LEAF } else { 0 };
        BonsaiPointer::NULL.write_to(&mut self.region[FREE_LIST_POINTER_OFFSET..]);
        BonsaiPointer::NULL.write_to(&mut self.region[LEFT_SIBLING_OFFSET..]);
        BonsaiPointer::NULL.write_to(&mut self.region[RIGHT_SIBLING_OFFSET..]);
        slotted::write_i64(self.region, TREE_SIZE_OFFSET, 0);
        self.region[KEY_SERIALIZER_OFFSET] = K::SERIALIZER_ID;
        self.region[VALUE_SERIALIZER_OFFSET] = V::SERIALIZER_ID;

        self.log(PageOpKind::Format { prev_header });
    }

    /// Inserts an already-serialized leaf entry at `index`. Returns
    /// `Ok(false)` when the region is too full (the split trigger) and an
    /// error when a single entry can never fit.
    pub fn add_leaf_entry(
        &mut self,
        index: usize,
        raw_key: &[u8],
        raw_value: &[u8],
    ) -> Result<bool> {
        ensure!(
            self.is_leaf(),
            "leaf insert into an internal bucket (file {})",
            self.target.file_id
        );

        let entry_size = raw_key.len() + raw_value.len();
        self.check_entry_size(entry_size)?;

        if !slotted::fits(self.region, POSITIONS_ARRAY_OFFSET, entry_size) {
            if self.size() > 1 {
                return Ok(false);
            }
            bail!(
                "entry of {} bytes does not fit a bucket of {} bytes; increase the bonsai \
                 bucket size or shrink the key/value (file {})",
                entry_size,
                self.region.len(),
                self.target.file_id
            );
        }

        let mut entry = Vec::with_capacity(entry_size);
        entry.extend_from_slice(raw_key);
        entry.extend_from_slice(raw_value);

        let capture = slotted::insert_raw(self.region, POSITIONS_ARRAY_OFFSET, index, &entry);
        self.log(PageOpKind::AddEntry {
            index: index as u32,
            entry_size: entry_size as u32,
            prev_free_bytes: capture.prev_free_bytes,
            prev_tail_slot: capture.prev_tail_slot,
        });

        Ok(true)
    }

    /// Inserts a decoded entry at `index`. For internal entries with
    /// `update_neighbors`, patches the adjacent entries' child pointers so
    /// consecutive entries keep agreeing at the boundary.
    pub fn add_entry(
        &mut self,
        index: usize,
        entry: &BonsaiEntry<K, V>,
        update_neighbors: bool,
    ) -> Result<bool> {
        if self.is_leaf() {
            let Some(value) = &entry.value else {
                bail!(
                    "leaf entry without a value (file {})",
                    self.target.file_id
                );
            };
            return self.add_leaf_entry(index, &entry.key.to_bytes(), &value.to_bytes());
        }

        let key_size = entry.key.serialized_size();
        let entry_size = 2 * BonsaiPointer::CHILD_SIZE + key_size;

        if !slotted::fits(self.region, POSITIONS_ARRAY_OFFSET, entry_size) {
            if self.size() > 1 {
                return Ok(false);
            }
            bail!(
                "separator entry of {} bytes does not fit a bucket of {} bytes (file {})",
                entry_size,
                self.region.len(),
                self.target.file_id
            );
        }

        let mut bytes = vec![0u8; entry_size];
        entry.left_child.write_child(&mut bytes[..]);
        entry
            .right_child
            .write_child(&mut bytes[BonsaiPointer::CHILD_SIZE..]);
        entry
            .key
            .write_to(&mut bytes[2 * BonsaiPointer::CHILD_SIZE..]);

        let capture = slotted::insert_raw(self.region, POSITIONS_ARRAY_OFFSET, index, &bytes);
        self.log(PageOpKind::AddEntry {
            index: index as u32,
            entry_size: entry_size as u32,
            prev_free_bytes: capture.prev_free_bytes,
            prev_tail_slot: capture.prev_tail_slot,
        });

        let size = self.size();
        if update_neighbors && size > 1 {
            if index < size - 1 {
                self.patch_child(index + 1, 0, entry.right_child);
            }
            if index > 0 {
                self.patch_child(index - 1, BonsaiPointer::CHILD_SIZE, entry.left_child);
            }
        }

        Ok(true)
    }

    fn patch_child(&mut self, index: usize, child_offset: usize, child: BonsaiPointer) {
        let position = slotted::position(self.region, POSITIONS_ARRAY_OFFSET, index);
        let field = position + child_offset;

        let prev = self.region[field..field + BonsaiPointer::CHILD_SIZE].to_vec();
        child.write_child(&mut self.region[field..]);

        self.log(PageOpKind::PatchChildPointer {
            index: index as u32,
            child_offset: child_offset as u32,
            prev,
        });
    }

    /// Removes the leaf entry at `index`. The caller supplies the raw bytes
    /// it already read; they go into the page-operation record.
    pub fn remove(&mut self, index: usize, raw_key: &[u8], raw_value: &[u8]) -> Result<()> {
        ensure!(
            self.is_leaf(),
            "remove applies to leaf buckets only (file {})",
            self.target.file_id
        );
        ensure!(
            index < self.size(),
            "remove index {} out of bounds (size={})",
            index,
            self.size()
        );

        let entry_size = raw_key.len() + raw_value.len();
        let entry_position =
            slotted::remove_raw(self.region, POSITIONS_ARRAY_OFFSET, index, entry_size);

        let mut raw_entry = Vec::with_capacity(entry_size);
        raw_entry.extend_from_slice(raw_key);
        raw_entry.extend_from_slice(raw_value);

        self.log(PageOpKind::Remove {
            index: index as u32,
            entry_position: entry_position as u32,
            raw_entry,
        });
        Ok(())
    }

    /// Overwrites the value bytes of the leaf entry at `index` in place.
    /// Fixed-length values make this a same-size write.
    pub fn update_value(
        &mut self,
        index: usize,
        key_size: usize,
        raw_value: &[u8],
        prev_raw_value: &[u8],
    ) -> Result<()> {
        ensure!(
            self.is_leaf(),
            "value update on an internal bucket (file {})",
            self.target.file_id
        );

        let position = slotted::position(self.region, POSITIONS_ARRAY_OFFSET, index);
        let value_start = position + key_size;
        ensure!(
            value_start + raw_value.len() <= self.region.len(),
            "value update beyond region: {}+{}",
            value_start,
            raw_value.len()
        );

        self.region[value_start..value_start + raw_value.len()].copy_from_slice(raw_value);

        self.log(PageOpKind::UpdateValue {
            index: index as u32,
            value_offset: key_size as u32,
            prev_value: prev_raw_value.to_vec(),
        });
        Ok(())
    }

    /// Keeps the first `new_size` entries and rewrites the region compactly.
    /// The removed raw entries are logged in order.
    pub fn shrink(&mut self, new_size: usize) -> Result<()> {
        let old_size = self.size();
        ensure!(
            new_size <= old_size,
            "shrink to {} on a bucket of {}",
            new_size,
            old_size
        );

        let read = self.as_read();
        let mut kept = Vec::with_capacity(new_size);
        for i in 0..new_size {
            kept.push(read.raw_entry_at(i)?);
        }
        let mut removed = Vec::with_capacity(old_size - new_size);
        for i in new_size..old_size {
            removed.push(read.raw_entry_at(i)?);
        }

        let region_end = self.region.len();
        let prev_free = slotted::free_pointer(self.region);
        let capture = slotted::capture_rewrite(
            self.region,
            POSITIONS_ARRAY_OFFSET,
            old_size,
            prev_free,
            region_end,
        );

        slotted::set_free_pointer(self.region, region_end);
        for (i, entry) in kept.iter().enumerate() {
            slotted::append_raw(self.region, POSITIONS_ARRAY_OFFSET, i, entry);
        }
        slotted::set_size(self.region, new_size);

        self.log(PageOpKind::Shrink {
            removed,
            prev_free_pointer: capture.prev_free_pointer,
            prev_size: capture.prev_size,
            prev_positions: capture.prev_positions,
            prev_entries: capture.prev_entries,
        });
        Ok(())
    }

    /// Bulk-appends raw entries into an empty region and sets the size.
    pub fn add_all(&mut self, entries: &[Vec<u8>]) -> Result<()> {
        ensure!(
            self.size() == 0,
            "bulk append into a non-empty bucket (size={})",
            self.size()
        );

        let total: usize = entries.iter().map(|e| e.len()).sum();
        let free = slotted::free_pointer(self.region);
        ensure!(
            free >= total && free - total >= POSITIONS_ARRAY_OFFSET + entries.len() * 4,
            "bulk append of {} bytes into a region with {} free",
            total,
            free
        );

        let capture = slotted::capture_rewrite(
            self.region,
            POSITIONS_ARRAY_OFFSET,
            entries.len(),
            free - total,
            free,
        );

        for (i, entry) in entries.iter().enumerate() {
            slotted::append_raw(self.region, POSITIONS_ARRAY_OFFSET, i, entry);
        }
        slotted::set_size(self.region, entries.len());

        self.log(PageOpKind::AddAll {
            count: entries.len() as u32,
            prev_free_pointer: capture.prev_free_pointer,
            prev_size: capture.prev_size,
            prev_positions: capture.prev_positions,
            prev_entries: capture.prev_entries,
        });
        Ok(())
    }

    fn set_pointer_field(&mut self, offset: usize, pointer: BonsaiPointer) -> [u8; 16] {
        let prev: [u8; 16] = self.region[offset..offset + BonsaiPointer::SIZE]
            .try_into()
            .unwrap();
        pointer.write_to(&mut self.region[offset..]);
        prev
    }

    pub fn set_left_sibling(&mut self, pointer: BonsaiPointer) {
        let prev = self.set_pointer_field(LEFT_SIBLING_OFFSET, pointer);
        self.log(PageOpKind::SetLeftSibling {
            prev: prev.to_vec(),
        });
    }

    pub fn set_right_sibling(&mut self, pointer: BonsaiPointer) {
        let prev = self.set_pointer_field(RIGHT_SIBLING_OFFSET, pointer);
        self.log(PageOpKind::SetRightSibling {
            prev: prev.to_vec(),
        });
    }

    pub fn set_free_list_pointer(&mut self, pointer: BonsaiPointer) {
        let prev = self.set_pointer_field(FREE_LIST_POINTER_OFFSET, pointer);
        self.log(PageOpKind::SetFreeListPointer {
            prev: prev.to_vec(),
        });
    }

    pub fn set_tree_size(&mut self, size: i64) {
        let prev = slotted::read_i64(self.region, TREE_SIZE_OFFSET);
        slotted::write_i64(self.region, TREE_SIZE_OFFSET, size);
        self.log(PageOpKind::SetTreeSize { prev });
    }

    pub fn set_deleted(&mut self) {
        let prev_flags = self.region[FLAGS_OFFSET];
        self.region[FLAGS_OFFSET] = prev_flags | FLAG_DELETED;
        self.log(PageOpKind::SetDeleted { prev_flags });
    }

    fn check_entry_size(&self, entry_size: usize) -> Result<()> {
        ensure!(
            entry_size <= MAX_ENTRY_SIZE,
            "serialized key/value pair of {} bytes exceeds the {} byte ceiling (file {})",
            entry_size,
            MAX_ENTRY_SIZE,
            self.target.file_id
        );
        Ok(())
    }
}

fn restore_field(region: &mut [u8], offset: usize, prev: &[u8]) -> Result<()> {
    ensure!(
        offset + prev.len() <= region.len(),
        "undo record field at {}+{} beyond region of {}",
        offset,
        prev.len(),
        region.len()
    );
    region[offset..offset + prev.len()].copy_from_slice(prev);
    Ok(())
}

/// Applies the inverse of one bucket mutation. Called by rollback with the
/// region in exactly the state the forward operation left it.
pub(crate) fn undo_page_op(region: &mut [u8], kind: &PageOpKind) -> Result<()> {
    match kind {
        PageOpKind::Format { prev_header } => restore_field(region, 0, prev_header),
        PageOpKind::AddEntry {
            index,
            entry_size,
            prev_free_bytes,
            prev_tail_slot,
        } => slotted::undo_insert(
            region,
            POSITIONS_ARRAY_OFFSET,
            *index as usize,
            *entry_size as usize,
            prev_free_bytes,
            *prev_tail_slot,
        ),
        PageOpKind::AddAll {
            prev_free_pointer,
            prev_size,
            prev_positions,
            prev_entries,
            ..
        } => slotted::undo_rewrite(
            region,
            POSITIONS_ARRAY_OFFSET,
            *prev_free_pointer,
            *prev_size,
            prev_positions,
            *prev_free_pointer as usize - prev_entries.len(),
            prev_entries,
        ),
        PageOpKind::Remove {
            index,
            entry_position,
            raw_entry,
        } => slotted::undo_remove(
            region,
            POSITIONS_ARRAY_OFFSET,
            *index as usize,
            *entry_position as usize,
            raw_entry,
        ),
        PageOpKind::Shrink {
            prev_free_pointer,
            prev_size,
            prev_positions,
            prev_entries,
            ..
        } => slotted::undo_rewrite(
            region,
            POSITIONS_ARRAY_OFFSET,
            *prev_free_pointer,
            *prev_size,
            prev_positions,
            *prev_free_pointer as usize,
            prev_entries,
        ),
        PageOpKind::UpdateValue {
            index,
            value_offset,
            prev_value,
        } => {
            let position = slotted::position(region, POSITIONS_ARRAY_OFFSET, *index as usize);
            restore_field(region, position + *value_offset as usize, prev_value)
        }
        PageOpKind::PatchChildPointer {
            index,
            child_offset,
            prev,
        } => {
            let position = slotted::position(region, POSITIONS_ARRAY_OFFSET, *index as usize);
            restore_field(region, position + *child_offset as usize, prev)
        }
        PageOpKind::SetLeftSibling { prev } => restore_field(region, LEFT_SIBLING_OFFSET, prev),
        PageOpKind::SetRightSibling { prev } => restore_field(region, RIGHT_SIBLING_OFFSET, prev),
        PageOpKind::SetFreeListPointer { prev } => {
            restore_field(region, FREE_LIST_POINTER_OFFSET, prev)
        }
        PageOpKind::SetTreeSize { prev } => {
            slotted::write_i64(region, TREE_SIZE_OFFSET, *prev);
            Ok(())
        }
        PageOpKind::SetDeleted { prev_flags } => {
            region[FLAGS_OFFSET] = *prev_flags;
            Ok(())
        }
        other => bail!("page operation {:?} does not target a bonsai bucket", other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::wal::BucketLayout;
    use crate::storage::AtomicOperationsManager;

    const BUCKET: usize = 2048;

    fn target() -> PageTarget {
        PageTarget {
            file_id: 1,
            page_index: 0,
            page_offset: 0,
            layout: BucketLayout::Bonsai {
                bucket_size: BUCKET as u32,
            },
        }
    }

    fn formatted_leaf(op: &mut AtomicOperation) -> Vec<u8> {
        let mut region = vec![0u8; BUCKET];
        let mut bucket = BonsaiBucketMut::<i32, i64>::open(&mut region, target(), op);
        bucket.format(true);
        region
    }

    fn leaf_entry(key: i32, value: i64) -> (Vec<u8>, Vec<u8>) {
        (TreeKey::to_bytes(&key), TreeValue::to_bytes(&value))
    }

    #[test]
    fn bucket_state_round_trips_flag_bits() {
        assert_eq!(BucketState::from_flags(0x1).unwrap(), BucketState::Leaf);
        assert_eq!(BucketState::from_flags(0x0).unwrap(), BucketState::Internal);
        assert_eq!(
            BucketState::from_flags(0x3).unwrap(),
            BucketState::DeletedLeaf
        );
        assert_eq!(
            BucketState::from_flags(0x2).unwrap(),
            BucketState::DeletedInternal
        );
        assert!(BucketState::DeletedLeaf.is_leaf());
        assert!(BucketState::DeletedInternal.is_deleted());
    }

    #[test]
    fn format_produces_an_empty_live_leaf() {
        let manager = AtomicOperationsManager::new();
        let mut op = manager.start(true);
        let region = formatted_leaf(&mut op);

        let bucket = BonsaiBucket::<i32, i64>::open(&region);
        assert_eq!(bucket.size(), 0);
        assert!(bucket.is_leaf());
        assert!(!bucket.is_deleted());
        assert!(!bucket.left_sibling().is_valid());
        assert!(!bucket.right_sibling().is_valid());
        assert_eq!(bucket.tree_size(), 0);
        assert_eq!(bucket.key_serializer_id(), <i32 as TreeKey>::SERIALIZER_ID);
    }

    #[test]
    fn insert_keeps_slot_directory_sorted() {
        let manager = AtomicOperationsManager::new();
        let mut op = manager.start(true);
        let mut region = formatted_leaf(&mut op);

        {
            let mut bucket = BonsaiBucketMut::<i32, i64>::open(&mut region, target(), &mut op);
            for (i, key) in [30, 10, 20].iter().enumerate() {
                let (rk, rv) = leaf_entry(*key, *key as i64 * 10);
                let read = bucket.as_read();
                let find = read.find(key).unwrap();
                assert!(find < 0, "key {} inserted twice", key);
                assert!(bucket
                    .add_leaf_entry((-find - 1) as usize, &rk, &rv)
                    .unwrap());
                assert_eq!(bucket.size(), i + 1);
            }
        }

        let bucket = BonsaiBucket::<i32, i64>::open(&region);
        assert_eq!(bucket.key_at(0).unwrap(), 10);
        assert_eq!(bucket.key_at(1).unwrap(), 20);
        assert_eq!(bucket.key_at(2).unwrap(), 30);
        assert_eq!(bucket.entry_at(1).unwrap().value, Some(200));
    }

    #[test]
    fn find_reports_lower_bound_insertion_points() {
        let manager = AtomicOperationsManager::new();
        let mut op = manager.start(true);
        let mut region = formatted_leaf(&mut op);

        let mut bucket = BonsaiBucketMut::<i32, i64>::open(&mut region, target(), &mut op);
        for (i, key) in [10, 20, 30].iter().enumerate() {
            let (rk, rv) = leaf_entry(*key, 0);
            bucket.add_leaf_entry(i, &rk, &rv).unwrap();
        }

        let read = bucket.as_read();
        assert_eq!(read.find(&10).unwrap(), 0);
        assert_eq!(read.find(&30).unwrap(), 2);
        assert_eq!(read.find(&5).unwrap(), -1);
        assert_eq!(read.find(&15).unwrap(), -2);
        assert_eq!(read.find(&35).unwrap(), -4);
    }

    #[test]
    fn remove_rejects_internal_buckets() {
        let manager = AtomicOperationsManager::new();
        let mut op = manager.start(true);
        let mut region = vec![0u8; BUCKET];

        let mut bucket = BonsaiBucketMut::<i32, i64>::open(&mut region, target(), &mut op);
        bucket.format(false);

        let result = bucket.remove(0, &[0; 4], &[0; 8]);
        assert!(result.is_err());
        assert!(result
            .unwrap_err()
            .to_string()
            .contains("leaf buckets only"));
    }

    #[test]
    fn full_bucket_returns_false_instead_of_growing() {
        let manager = AtomicOperationsManager::new();
        let mut op = manager.start(true);
        let mut region = formatted_leaf(&mut op);

        let mut bucket = BonsaiBucketMut::<i32, i64>::open(&mut region, target(), &mut op);
        let mut inserted = 0usize;
        loop {
            let (rk, rv) = leaf_entry(inserted as i32, 0);
            if !bucket.add_leaf_entry(inserted, &rk, &rv).unwrap() {
                break;
            }
            inserted += 1;
        }

        // 12 bytes per entry plus a 4-byte slot, under a 0x43-byte header
        let capacity = (BUCKET - POSITIONS_ARRAY_OFFSET) / 16;
        assert_eq!(inserted, capacity);
        assert_eq!(bucket.size(), inserted);
    }

    #[test]
    fn oversized_entry_in_empty_bucket_is_an_error() {
        let manager = AtomicOperationsManager::new();
        let mut op = manager.start(true);
        let mut region = vec![0u8; BUCKET];

        let mut bucket = BonsaiBucketMut::<String, String>::open(&mut region, target(), &mut op);
        bucket.format(true);

        let big = "x".repeat(BUCKET);
        let result = bucket.add_leaf_entry(
            0,
            &TreeKey::to_bytes(&big),
            &TreeValue::to_bytes(&String::new()),
        );

        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("does not fit"));
    }

    #[test]
    fn update_value_overwrites_in_place() {
        let manager = AtomicOperationsManager::new();
        let mut op = manager.start(true);
        let mut region = formatted_leaf(&mut op);

        let mut bucket = BonsaiBucketMut::<i32, i64>::open(&mut region, target(), &mut op);
        let (rk, rv) = leaf_entry(1, 100);
        bucket.add_leaf_entry(0, &rk, &rv).unwrap();

        let new_value = TreeValue::to_bytes(&777i64);
        bucket.update_value(0, rk.len(), &new_value, &rv).unwrap();

        assert_eq!(bucket.as_read().entry_at(0).unwrap().value, Some(777));
    }

    #[test]
    fn shrink_keeps_prefix_and_logs_removed() {
        let manager = AtomicOperationsManager::new();
        let mut op = manager.start(true);
        let mut region = formatted_leaf(&mut op);

        {
            let mut bucket = BonsaiBucketMut::<i32, i64>::open(&mut region, target(), &mut op);
            for i in 0..6 {
                let (rk, rv) = leaf_entry(i, i as i64);
                bucket.add_leaf_entry(i as usize, &rk, &rv).unwrap();
            }
            bucket.shrink(2).unwrap();
            assert_eq!(bucket.size(), 2);
        }

        let bucket = BonsaiBucket::<i32, i64>::open(&region);
        assert_eq!(bucket.key_at(0).unwrap(), 0);
        assert_eq!(bucket.key_at(1).unwrap(), 1);

        let shrink_op = op
            .page_ops()
            .iter()
            .find_map(|p| match &p.kind {
                PageOpKind::Shrink { removed, .. } => Some(removed.clone()),
                _ => None,
            })
            .unwrap();
        assert_eq!(shrink_op.len(), 4);
    }

    #[test]
    fn add_entry_patches_neighbor_children() {
        let manager = AtomicOperationsManager::new();
        let mut op = manager.start(true);
        let mut region = vec![0u8; BUCKET];

        let mut bucket = BonsaiBucketMut::<i32, i64>::open(&mut region, target(), &mut op);
        bucket.format(false);

        let internal = |left: i64, right: i64, key: i32| BonsaiEntry::<i32, i64> {
            left_child: BonsaiPointer::new(left, 0),
            right_child: BonsaiPointer::new(right, 0),
            key,
            value: None,
        };

        bucket.add_entry(0, &internal(1, 2, 10), true).unwrap();
        bucket.add_entry(1, &internal(2, 3, 30), true).unwrap();
        // middle insert rewires both neighbors
        bucket.add_entry(1, &internal(2, 9, 20), true).unwrap();

        let read = bucket.as_read();
        let first = read.entry_at(0).unwrap();
        let middle = read.entry_at(1).unwrap();
        let last = read.entry_at(2).unwrap();
        assert_eq!(first.right_child, middle.left_child);
        assert_eq!(middle.right_child, last.left_child);
    }

    #[test]
    fn every_mutation_is_undone_byte_exactly() {
        let manager = AtomicOperationsManager::new();
        let mut setup = manager.start(true);
        let mut region = formatted_leaf(&mut setup);
        {
            let mut bucket =
                BonsaiBucketMut::<i32, i64>::open(&mut region, target(), &mut setup);
            for i in 0..5 {
                let (rk, rv) = leaf_entry(i * 2, i as i64);
                bucket.add_leaf_entry(i as usize, &rk, &rv).unwrap();
            }
        }
        let snapshot = region.clone();

        let mut op = manager.start(true);
        {
            let mut bucket = BonsaiBucketMut::<i32, i64>::open(&mut region, target(), &mut op);
            let (rk, rv) = leaf_entry(5, 50);
            bucket.add_leaf_entry(3, &rk, &rv).unwrap();
            let (rk0, rv0) = bucket.as_read().raw_leaf_entry_at(0).unwrap();
            bucket.remove(0, &rk0, &rv0).unwrap();
            let prev = bucket.as_read().raw_value_at(0, 4).unwrap();
            bucket
                .update_value(0, 4, &TreeValue::to_bytes(&99i64), &prev)
                .unwrap();
            bucket.shrink(2).unwrap();
            bucket.set_tree_size(17);
            bucket.set_right_sibling(BonsaiPointer::new(5, 4096));
            bucket.set_deleted();
        }

        for page_op in op.page_ops().iter().rev().cloned().collect::<Vec<_>>() {
            undo_page_op(&mut region, &page_op.kind).unwrap();
        }

        assert_eq!(region, snapshot);
    }
}
