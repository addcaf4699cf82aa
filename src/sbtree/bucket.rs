//! # Standard Slotted Bucket
//!
//! One bucket per page. The slot mechanics are shared with the bonsai
//! variant through `storage::slotted`; this module contributes the
//! page-sized header layout, `i64` child pointers, link-or-inline leaf
//! values and optional key encryption.
//!
//! ## Entry Encodings
//!
//! ```text
//! leaf:      [key bytes][is_link: u8][value bytes]
//!            value bytes are an i64 link when is_link = 1,
//!            the serialized value otherwise
//! internal:  [left child: i64][right child: i64][key bytes]
//! ```
//!
//! With an encryption codec installed, every key is stored as
//! `[encrypted_len: i32][ciphertext]` and decrypted on read. The length
//! prefix keeps raw entry slicing possible without decryption.
//!
//! ## Mutation Logging
//!
//! Identical discipline to the bonsai bucket: every mutation appends one
//! typed page operation carrying the overwritten bytes, making rollback
//! byte-exact. The extra header field here, the external-value free list
//! head, logs its previous value at full i64 width.

use std::marker::PhantomData;

use eyre::{bail, ensure, Result};

use crate::config::MAX_ENTRY_SIZE;
use crate::encoding::{TreeKey, TreeValue};
use crate::encryption::EncryptionCodec;
use crate::storage::slotted::{self, FLAGS_OFFSET};
use crate::storage::wal::{PageOp, PageOpKind, PageTarget};
use crate::storage::AtomicOperation;

pub(crate) const LEFT_SIBLING_OFFSET: usize = 0x09;
pub(crate) const RIGHT_SIBLING_OFFSET: usize = 0x11;
pub(crate) const TREE_SIZE_OFFSET: usize = 0x19;
pub(crate) const KEY_SERIALIZER_OFFSET: usize = 0x21;
pub(crate) const VALUE_SERIALIZER_OFFSET: usize = 0x22;
pub(crate) const VALUES_FREE_LIST_OFFSET: usize = 0x23;
pub(crate) const POSITIONS_ARRAY_OFFSET: usize = 0x2B;

pub(crate) const NULL_PAGE: i64 = -1;

const FLAG_LEAF: u8 = 0x1;

const CHILD_SIZE: usize = 8;
const LINK_FLAG_SIZE: usize = 1;

/// A leaf value: either stored inline or an `i64` link into the external
/// value store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SbValue<V> {
    Inline(V),
    Link(i64),
}

/// One decoded bucket entry. Leaf entries carry a value and NULL children;
/// internal entries carry children and no value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SbEntry<K, V> {
    pub left_child: i64,
    pub right_child: i64,
    pub key: K,
    pub value: Option<SbValue<V>>,
}

pub(crate) struct SbBucket<'a, K, V> {
    region: &'a [u8],
    codec: Option<&'a dyn EncryptionCodec>,
    _marker: PhantomData<fn() -> (K, V)>,
}

impl<'a, K: TreeKey, V: TreeValue> SbBucket<'a, K, V> {
    pub fn open(region: &'a [u8], codec: Option<&'a dyn EncryptionCodec>) -> Self {
        debug_assert!(region.len() > POSITIONS_ARRAY_OFFSET);
        Self {
            region,
            codec,
            _marker: PhantomData,
        }
    }

    pub fn size(&self) -> usize {
        slotted::size(self.region)
    }

    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }

    pub fn is_leaf(&self) -> bool {
        self.region[FLAGS_OFFSET] & FLAG_LEAF != 0
    }

    pub fn tree_size(&self) -> i64 {
        slotted::read_i64(self.region, TREE_SIZE_OFFSET)
    }

    pub fn left_sibling(&self) -> i64 {
        slotted::read_i64(self.region, LEFT_SIBLING_OFFSET)
    }

    pub fn right_sibling(&self) -> i64 {
        slotted::read_i64(self.region, RIGHT_SIBLING_OFFSET)
    }

    pub fn values_free_list_first(&self) -> i64 {
        slotted::read_i64(self.region, VALUES_FREE_LIST_OFFSET)
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
            "corrupt slot {}: position {} beyond page",
            index,
            position
        );
        Ok(position)
    }

    /// Size in bytes of the stored key at `at`, without decoding it.
    fn stored_key_size(&self, at: usize) -> Result<usize> {
        match self.codec {
            None => K::size_in_buffer(&self.region[at..]),
            Some(_) => {
                let encrypted = slotted::read_i32(self.region, at);
                ensure!(encrypted >= 0, "negative encrypted key length {}", encrypted);
                Ok(4 + encrypted as usize)
            }
        }
    }

    fn read_key(&self, at: usize) -> Result<K> {
        match self.codec {
            None => K::read_from(&self.region[at..]),
            Some(codec) => {
                let encrypted = slotted::read_i32(self.region, at);
                ensure!(encrypted >= 0, "negative encrypted key length {}", encrypted);
                let cipher = &self.region[at + 4..at + 4 + encrypted as usize];
                let plain = codec.decrypt(cipher);
                K::read_from(&plain)
            }
        }
    }

    pub fn key_at(&self, index: usize) -> Result<K> {
        let mut position = self.entry_position(index)?;
        if !self.is_leaf() {
            position += 2 * CHILD_SIZE;
        }
        self.read_key(position)
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

    fn read_value(&self, at: usize) -> Result<SbValue<V>> {
        let is_link = self.region[at] != 0;
        if is_link {
            Ok(SbValue::Link(slotted::read_i64(
                self.region,
                at + LINK_FLAG_SIZE,
            )))
        } else {
            Ok(SbValue::Inline(V::read_from(
                &self.region[at + LINK_FLAG_SIZE..],
            )?))
        }
    }

    fn stored_value_size(&self, at: usize) -> Result<usize> {
        let is_link = self.region[at] != 0;
        if is_link {
            Ok(LINK_FLAG_SIZE + 8)
        } else {
            Ok(LINK_FLAG_SIZE + V::size_in_buffer(&self.region[at + LINK_FLAG_SIZE..])?)
        }
    }

    pub fn entry_at(&self, index: usize) -> Result<SbEntry<K, V>> {
        let position = self.entry_position(index)?;

        if self.is_leaf() {
            let key = self.read_key(position)?;
            let key_size = self.stored_key_size(position)?;
            let value = self.read_value(position + key_size)?;

            Ok(SbEntry {
                left_child: NULL_PAGE,
                right_child: NULL_PAGE,
                key,
                value: Some(value),
            })
        } else {
            let left_child = slotted::read_i64(self.region, position);
            let right_child = slotted::read_i64(self.region, position + CHILD_SIZE);
            let key = self.read_key(position + 2 * CHILD_SIZE)?;

            Ok(SbEntry {
                left_child,
                right_child,
                key,
                value: None,
            })
        }
    }

    pub fn value_at(&self, index: usize) -> Result<SbValue<V>> {
        ensure!(self.is_leaf(), "value access on an internal bucket");
        let position = self.entry_position(index)?;
        let key_size = self.stored_key_size(position)?;
        self.read_value(position + key_size)
    }

    /// The stored bytes of one entry, exactly as laid out in the page.
    pub fn raw_entry_at(&self, index: usize) -> Result<Vec<u8>> {
        let position = self.entry_position(index)?;

        if self.is_leaf() {
            let key_size = self.stored_key_size(position)?;
            let value_size = self.stored_value_size(position + key_size)?;
            Ok(self.region[position..position + key_size + value_size].to_vec())
        } else {
            let key_size = self.stored_key_size(position + 2 * CHILD_SIZE)?;
            Ok(self.region[position..position + 2 * CHILD_SIZE + key_size].to_vec())
        }
    }

    /// Raw stored key and value bytes of a leaf entry; the value includes
    /// its link flag byte.
    pub fn raw_leaf_entry_at(&self, index: usize) -> Result<(Vec<u8>, Vec<u8>)> {
        ensure!(self.is_leaf(), "raw leaf access on an internal bucket");
        let position = self.entry_position(index)?;

        let key_size = self.stored_key_size(position)?;
        let value_size = self.stored_value_size(position + key_size)?;

        let raw_key = self.region[position..position + key_size].to_vec();
        let raw_value =
            self.region[position + key_size..position + key_size + value_size].to_vec();
        Ok((raw_key, raw_value))
    }
}

pub(crate) struct SbBucketMut<'a, K, V> {
    region: &'a mut [u8],
    codec: Option<&'a dyn EncryptionCodec>,
    target: PageTarget,
    op: &'a mut AtomicOperation,
    _marker: PhantomData<fn() -> (K, V)>,
}

impl<'a, K: TreeKey, V: TreeValue> SbBucketMut<'a, K, V> {
    pub fn open(
        region: &'a mut [u8],
        codec: Option<&'a dyn EncryptionCodec>,
        target: PageTarget,
        op: &'a mut AtomicOperation,
    ) -> Self {
        debug_assert!(region.len() > POSITIONS_ARRAY_OFFSET);
        Self {
            region,
            codec,
            target,
            op,
            _marker: PhantomData,
        }
    }

    pub fn as_read(&self) -> SbBucket<'_, K, V> {
        SbBucket {
            region: self.region,
            codec: self.codec,
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

    /// (Re)initializes the page as an empty bucket.
    pub fn format(&mut self, leaf: bool) {
        let prev_header = self.region[..POSITIONS_ARRAY_OFFSET].to_vec();

        let region_end = self.region.len();
        slotted::set_free_pointer(self.region, region_end);
        slotted::set_size(self.region, 0);
        self.region[FLAGS_OFFSET] = if leaf { FLAG_LEAF } else { 0 };
        slotted::write_i64(self.region, LEFT_SIBLING_OFFSET, NULL_PAGE);
        slotted::write_i64(self.region, RIGHT_SIBLING_OFFSET, NULL_PAGE);
        slotted::write_i64(self.region, TREE_SIZE_OFFSET, 0);
        self.region[KEY_SERIALIZER_OFFSET] = K::SERIALIZER_ID;
        self.region[VALUE_SERIALIZER_OFFSET] = V::SERIALIZER_ID;
        slotted::write_i64(self.region, VALUES_FREE_LIST_OFFSET, NULL_PAGE);

        self.log(PageOpKind::Format { prev_header });
    }

    /// Inserts an already-encoded leaf entry. `raw_value` includes the link
    /// flag byte. Returns `Ok(false)` when the page is too full.
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
        ensure!(
            entry_size <= MAX_ENTRY_SIZE,
            "serialized key/value pair of {} bytes exceeds the {} byte ceiling (file {})",
            entry_size,
            MAX_ENTRY_SIZE,
            self.target.file_id
        );

        if !slotted::fits(self.region, POSITIONS_ARRAY_OFFSET, entry_size) {
            if self.size() > 1 {
                return Ok(false);
            }
            bail!(
                "entry of {} bytes does not fit a {} byte page (file {})",
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

    /// Inserts a decoded entry. For internal entries with
    /// `update_neighbors`, patches the adjacent entries' child pointers.
    pub fn add_entry(
        &mut self,
        index: usize,
        entry: &SbEntry<K, V>,
        update_neighbors: bool,
        encoded_key: &[u8],
    ) -> Result<bool> {
        if self.is_leaf() {
            let Some(value) = &entry.value else {
                bail!("leaf entry without a value (file {})", self.target.file_id);
            };
            let raw_value = encode_value::<V>(value);
            return self.add_leaf_entry(index, encoded_key, &raw_value);
        }

        let entry_size = 2 * CHILD_SIZE + encoded_key.len();

        if !slotted::fits(self.region, POSITIONS_ARRAY_OFFSET, entry_size) {
            if self.size() > 1 {
                return Ok(false);
            }
            bail!(
                "separator entry of {} bytes does not fit a {} byte page (file {})",
                entry_size,
                self.region.len(),
                self.target.file_id
            );
        }

        let mut bytes = Vec::with_capacity(entry_size);
        bytes.extend_from_slice(&entry.left_child.to_le_bytes());
        bytes.extend_from_slice(&entry.right_child.to_le_bytes());
        bytes.extend_from_slice(encoded_key);

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
                self.patch_child(index - 1, CHILD_SIZE, entry.left_child);
            }
        }
        Ok(true)
    }

    fn patch_child(&mut self, index: usize, child_offset: usize, child: i64) {
        let position = slotted::position(self.region, POSITIONS_ARRAY_OFFSET, index);
        let field = position + child_offset;

        let prev = self.region[field..field + CHILD_SIZE].to_vec();
        slotted::write_i64(self.region, field, child);

        self.log(PageOpKind::PatchChildPointer {
            index: index as u32,
            child_offset: child_offset as u32,
            prev,
        });
    }

    /// Removes the leaf entry at `index`.
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

    /// Overwrites the inline value of the leaf entry at `index` in place.
    /// `raw_value` and `prev_raw_value` exclude the link flag byte and must
    /// be the same length.
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
        ensure!(
            self.region[position + key_size] == 0,
            "in-place update of a link value (file {})",
            self.target.file_id
        );

        let value_start = position + key_size + LINK_FLAG_SIZE;
        ensure!(
            value_start + raw_value.len() <= self.region.len(),
            "value update beyond page: {}+{}",
            value_start,
            raw_value.len()
        );
        self.region[value_start..value_start + raw_value.len()].copy_from_slice(raw_value);

        self.log(PageOpKind::UpdateValue {
            index: index as u32,
            value_offset: (key_size + LINK_FLAG_SIZE) as u32,
            prev_value: prev_raw_value.to_vec(),
        });
        Ok(())
    }

    /// Keeps the first `new_size` entries and rewrites the page compactly.
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

    /// Bulk-appends raw entries into an empty page and sets the size.
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
            "bulk append of {} bytes into a page with {} free",
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

    pub fn set_left_sibling(&mut self, page_index: i64) {
        let prev = slotted::read_i64(self.region, LEFT_SIBLING_OFFSET);
        slotted::write_i64(self.region, LEFT_SIBLING_OFFSET, page_index);
        self.log(PageOpKind::SetLeftSibling {
            prev: prev.to_le_bytes().to_vec(),
        });
    }

    pub fn set_right_sibling(&mut self, page_index: i64) {
        // the old value must be read at full i64 width or the logged
        // before-image truncates on files past 2^31 pages
        let prev = slotted::read_i64(self.region, RIGHT_SIBLING_OFFSET);
        slotted::write_i64(self.region, RIGHT_SIBLING_OFFSET, page_index);
        self.log(PageOpKind::SetRightSibling {
            prev: prev.to_le_bytes().to_vec(),
        });
    }

    pub fn set_tree_size(&mut self, size: i64) {
        let prev = slotted::read_i64(self.region, TREE_SIZE_OFFSET);
        slotted::write_i64(self.region, TREE_SIZE_OFFSET, size);
        self.log(PageOpKind::SetTreeSize { prev });
    }

    pub fn set_values_free_list_first(&mut self, page_index: i64) {
        let prev = slotted::read_i64(self.region, VALUES_FREE_LIST_OFFSET);
        slotted::write_i64(self.region, VALUES_FREE_LIST_OFFSET, page_index);
        self.log(PageOpKind::SetValuesFreeListFirstIndex { prev });
    }
}

/// Decodes a leaf value from its stored form (link flag byte included).
pub(crate) fn decode_value<V: TreeValue>(bytes: &[u8]) -> Result<SbValue<V>> {
    ensure!(!bytes.is_empty(), "empty stored value");
    if bytes[0] != 0 {
        ensure!(bytes.len() >= 9, "truncated link value of {} bytes", bytes.len());
        Ok(SbValue::Link(i64::from_le_bytes(
            bytes[1..9].try_into().unwrap(),
        )))
    } else {
        Ok(SbValue::Inline(V::read_from(&bytes[1..])?))
    }
}

/// Encodes a leaf value with its link flag byte.
pub(crate) fn encode_value<V: TreeValue>(value: &SbValue<V>) -> Vec<u8> {
    match value {
        SbValue::Inline(v) => {
            let mut bytes = vec![0u8; LINK_FLAG_SIZE + v.serialized_size()];
            v.write_to(&mut bytes[LINK_FLAG_SIZE..]);
            bytes
        }
        SbValue::Link(link) => {
            let mut bytes = vec![1u8; 1];
            bytes.extend_from_slice(&link.to_le_bytes());
            bytes
        }
    }
}

fn restore_field(region: &mut [u8], offset: usize, prev: &[u8]) -> Result<()> {
    ensure!(
        offset + prev.len() <= region.len(),
        "undo record field at {}+{} beyond page of {}",
        offset,
        prev.len(),
        region.len()
    );
    region[offset..offset + prev.len()].copy_from_slice(prev);
    Ok(())
}

/// Applies the inverse of one standard-bucket mutation.
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
        PageOpKind::SetTreeSize { prev } => {
            slotted::write_i64(region, TREE_SIZE_OFFSET, *prev);
            Ok(())
        }
        PageOpKind::SetValuesFreeListFirstIndex { prev } => {
            slotted::write_i64(region, VALUES_FREE_LIST_OFFSET, *prev);
            Ok(())
        }
        other => bail!(
            "page operation {:?} does not target a standard bucket",
            other
        ),
    }
}
