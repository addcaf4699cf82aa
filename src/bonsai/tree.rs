//! # Bonsai Tree Engine
//!
//! The tree engine ties the slotted buckets, the sub-page allocator and the
//! durability layer into an ordered map: point lookups, inserts with
//! recursive splits, deletes, ascending range scans, first/last key and
//! whole-tree clear/delete with region recycling.
//!
//! ## Search
//!
//! Search walks from the root, running the bucket binary search at each
//! level. An exact hit descends through the matched entry's right child; a
//! miss descends through the left child at the insertion point (or the last
//! entry's right child when the insertion point is past the end). The
//! result carries the full root-to-leaf pointer path, which insert reuses
//! when it has to split.
//!
//! ## Split
//!
//! A full leaf splits at its midpoint. The upper half moves to a freshly
//! allocated bucket, the separation key is inserted into the parent
//! (recursively splitting parents as needed), and leaf siblings are
//! relinked so scans keep working. Splitting the root allocates two new
//! buckets for the halves and converts the root in place into an internal
//! bucket with a single separator, so the root pointer of a tree never
//! changes.
//!
//! ## Durability
//!
//! Every public mutation runs inside an atomic operation under the file's
//! exclusive lock: bucket mutations append page operations, the entry point
//! appends one component operation, and failure rolls everything back
//! byte-exactly before the error propagates. Reads hold the shared file
//! lock plus the recovery fence.
//!
//! ## Lock Ordering
//!
//! File lock first, then the storage lock. Every path follows this order,
//! which is what makes the pair deadlock-free.

use std::collections::VecDeque;
use std::io::Write;
use std::marker::PhantomData;
use std::path::Path as FsPath;
use std::sync::Arc;

use eyre::{ensure, eyre, Result, WrapErr};
use hashbrown::HashMap;
use parking_lot::RwLock;
use smallvec::SmallVec;

use super::bucket::{BonsaiBucket, BonsaiBucketMut, BonsaiEntry};
use super::pointer::BonsaiPointer;
use super::sys::{self, SysBucket, SysBucketMut};
use crate::encoding::{TreeKey, TreeValue};
use crate::storage::wal::{BucketLayout, ComponentOp, PageTarget};
use crate::storage::{
    AtomicOperation, AtomicOperationsManager, FileLockManager, MmapStorage, PAGE_SIZE,
};

type Path = SmallVec<[BonsaiPointer; 8]>;

struct SubtreeSummary<K> {
    min_key: Option<K>,
    max_key: Option<K>,
    entry_count: i64,
    leftmost_leaf: BonsaiPointer,
}

struct SearchResult {
    item_index: i32,
    path: Path,
}

impl SearchResult {
    fn last(&self) -> BonsaiPointer {
        *self.path.last().expect("search path is never empty")
    }
}

/// An additive modifier applied to a stored counter by
/// [`BonsaiTree::real_bag_size`]: either a delta on the stored value or an
/// absolute replacement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Change {
    Diff(i32),
    Absolute(i32),
}

impl Change {
    pub fn apply_to(self, base: i32) -> i32 {
        match self {
            Change::Diff(delta) => base + delta,
            Change::Absolute(value) => value,
        }
    }
}

#[derive(Debug)]
pub struct BonsaiTree<K, V> {
    name: String,
    file_id: u64,
    bucket_size: usize,
    root: BonsaiPointer,
    storage: Arc<RwLock<MmapStorage>>,
    locks: Arc<FileLockManager>,
    atomics: Arc<AtomicOperationsManager>,
    _marker: PhantomData<fn() -> (K, V)>,
}

impl<K: TreeKey, V: TreeValue> BonsaiTree<K, V> {
    /// Creates a new tree in a new file: system bucket, then the root
    /// allocated as the file's first data region.
    pub fn create<P: AsRef<FsPath>>(
        path: P,
        name: &str,
        bucket_size: usize,
        locks: Arc<FileLockManager>,
        atomics: Arc<AtomicOperationsManager>,
    ) -> Result<Self> {
        Self::check_parameters(name, bucket_size)?;

        let file_id = locks.register_file();
        let mut op = atomics.start(false);
        let lock_manager = locks.clone();
        let _lock = lock_manager.exclusive(file_id);

        let mut storage = MmapStorage::create(path.as_ref(), 1)
            .wrap_err_with(|| format!("failed to create bonsai tree '{}'", name))?;

        let created: Result<BonsaiPointer> = (|| {
            sys::ensure_initialized(&mut storage, &mut op, file_id, bucket_size)?;
            let root = sys::allocate_bucket(&mut storage, &mut op, file_id, bucket_size)?;

            let page = storage.page_mut(root.page_index as u32)?;
            let offset = root.page_offset as usize;
            let region = &mut page[offset..offset + bucket_size];
            let target = PageTarget {
                file_id,
                page_index: root.page_index as u32,
                page_offset: root.page_offset as u32,
                layout: BucketLayout::Bonsai {
                    bucket_size: bucket_size as u32,
                },
            };
            let mut bucket = BonsaiBucketMut::<K, V>::open(region, target, &mut op);
            bucket.format(true);
            bucket.set_tree_size(0);

            Ok(root)
        })();

        match created {
            Ok(root) => {
                op.log_component_op(ComponentOp::Create {
                    file_id,
                    name: name.to_owned(),
                    root_page: root.page_index,
                    root_offset: root.page_offset,
                });
                atomics.commit(op)?;

                Ok(Self {
                    name: name.to_owned(),
                    file_id,
                    bucket_size,
                    root,
                    storage: Arc::new(RwLock::new(storage)),
                    locks,
                    atomics,
                    _marker: PhantomData,
                })
            }
            Err(error) => {
                if let Err(rollback_error) = atomics.rollback(op, &mut storage) {
                    return Err(error.wrap_err(format!(
                        "rollback of '{}' creation failed: {}",
                        name, rollback_error
                    )));
                }
                Err(error)
            }
        }
    }

    /// Reopens a tree from its file and root pointer. The second return
    /// value reports whether the root bucket is live (not recycled).
    pub fn load<P: AsRef<FsPath>>(
        path: P,
        name: &str,
        bucket_size: usize,
        root: BonsaiPointer,
        locks: Arc<FileLockManager>,
        atomics: Arc<AtomicOperationsManager>,
    ) -> Result<(Self, bool)> {
        Self::check_parameters(name, bucket_size)?;
        ensure!(root.is_valid(), "cannot load tree '{}' from a NULL root", name);

        let file_id = locks.register_file();
        let lock_manager = locks.clone();
        let _lock = lock_manager.exclusive(file_id);

        let storage = MmapStorage::open(path.as_ref())
            .wrap_err_with(|| format!("failed to load bonsai tree '{}'", name))?;

        let live = {
            let page = storage.page(root.page_index as u32)?;
            let offset = root.page_offset as usize;
            ensure!(
                offset + bucket_size <= PAGE_SIZE,
                "root pointer of '{}' crosses a page boundary",
                name
            );
            let bucket = BonsaiBucket::<K, V>::open(&page[offset..offset + bucket_size]);
            // serializer ids are preserved on disk for compatibility; the
            // type parameters are authoritative, so they are not consulted
            let _ = (bucket.key_serializer_id(), bucket.value_serializer_id());
            !bucket.is_deleted()
        };

        Ok((
            Self {
                name: name.to_owned(),
                file_id,
                bucket_size,
                root,
                storage: Arc::new(RwLock::new(storage)),
                locks,
                atomics,
                _marker: PhantomData,
            },
            live,
        ))
    }

    fn check_parameters(name: &str, bucket_size: usize) -> Result<()> {
        ensure!(
            V::FIXED_LENGTH.is_some(),
            "bonsai tree '{}' requires a fixed-length value type",
            name
        );
        ensure!(
            bucket_size >= 256 && bucket_size <= PAGE_SIZE && PAGE_SIZE % bucket_size == 0,
            "bucket size {} must evenly divide the {} byte page",
            bucket_size,
            PAGE_SIZE
        );
        Ok(())
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn file_id(&self) -> u64 {
        self.file_id
    }

    pub fn root_pointer(&self) -> BonsaiPointer {
        self.root
    }

    // -----------------------------------------------------------------
    // bucket access helpers
    // -----------------------------------------------------------------

    fn target(&self, pointer: BonsaiPointer) -> PageTarget {
        PageTarget {
            file_id: self.file_id,
            page_index: pointer.page_index as u32,
            page_offset: pointer.page_offset as u32,
            layout: BucketLayout::Bonsai {
                bucket_size: self.bucket_size as u32,
            },
        }
    }

    fn bucket<'s>(
        &self,
        storage: &'s MmapStorage,
        pointer: BonsaiPointer,
    ) -> Result<BonsaiBucket<'s, K, V>> {
        ensure!(
            pointer.is_valid(),
            "NULL bucket pointer dereferenced in tree '{}'",
            self.name
        );
        let page = storage.page(pointer.page_index as u32)?;
        let offset = pointer.page_offset as usize;
        ensure!(
            offset + self.bucket_size <= PAGE_SIZE,
            "bucket pointer {}|{} crosses a page boundary in tree '{}'",
            pointer.page_index,
            pointer.page_offset,
            self.name
        );
        Ok(BonsaiBucket::open(&page[offset..offset + self.bucket_size]))
    }

    fn bucket_mut<'s>(
        &self,
        storage: &'s mut MmapStorage,
        op: &'s mut AtomicOperation,
        pointer: BonsaiPointer,
    ) -> Result<BonsaiBucketMut<'s, K, V>> {
        ensure!(
            pointer.is_valid(),
            "NULL bucket pointer dereferenced in tree '{}'",
            self.name
        );
        let target = self.target(pointer);
        let page = storage.page_mut(pointer.page_index as u32)?;
        let offset = pointer.page_offset as usize;
        ensure!(
            offset + self.bucket_size <= PAGE_SIZE,
            "bucket pointer {}|{} crosses a page boundary in tree '{}'",
            pointer.page_index,
            pointer.page_offset,
            self.name
        );
        Ok(BonsaiBucketMut::open(
            &mut page[offset..offset + self.bucket_size],
            target,
            op,
        ))
    }

    fn run_mutation<T>(
        &self,
        rollback_on_error: bool,
        work: impl FnOnce(&Self, &mut MmapStorage, &mut AtomicOperation) -> Result<T>,
    ) -> Result<T> {
        let mut op = self.atomics.start(rollback_on_error);
        let _lock = self.locks.exclusive(self.file_id);
        let mut storage = self.storage.write();

        match work(self, &mut storage, &mut op) {
            Ok(value) => {
                self.atomics.commit(op)?;
                Ok(value)
            }
            Err(error) => {
                if let Err(rollback_error) = self.atomics.rollback(op, &mut *storage) {
                    return Err(error.wrap_err(format!(
                        "rollback of tree '{}' failed: {}",
                        self.name, rollback_error
                    )));
                }
                Err(error)
            }
        }
    }

    // -----------------------------------------------------------------
    // search
    // -----------------------------------------------------------------

    fn find_bucket(&self, storage: &MmapStorage, key: &K) -> Result<SearchResult> {
        let mut pointer = self.root;
        let mut path: Path = SmallVec::new();

        loop {
            path.push(pointer);

            let (item_index, next) = {
                let bucket = self.bucket(storage, pointer)?;
                let index = bucket.find(key)?;

                if bucket.is_leaf() {
                    (index, None)
                } else {
                    let entry = if index >= 0 {
                        bucket.entry_at(index as usize)?
                    } else {
                        let insertion = (-index - 1) as usize;
                        if insertion >= bucket.size() {
                            bucket.entry_at(insertion - 1)?
                        } else {
                            bucket.entry_at(insertion)?
                        }
                    };

                    let child = if *key >= entry.key {
                        entry.right_child
                    } else {
                        entry.left_child
                    };
                    (index, Some(child))
                }
            };

            match next {
                None => return Ok(SearchResult { item_index, path }),
                Some(child) => pointer = child,
            }
        }
    }

    // -----------------------------------------------------------------
    // point operations
    // -----------------------------------------------------------------

    pub fn get(&self, key: &K) -> Result<Option<V>> {
        let _fence = self.atomics.acquire_read_fence();
        let _lock = self.locks.shared(self.file_id);
        let storage = self.storage.read();

        let search = self.find_bucket(&storage, key)?;
        if search.item_index < 0 {
            return Ok(None);
        }

        let bucket = self.bucket(&storage, search.last())?;
        let entry = bucket.entry_at(search.item_index as usize)?;
        Ok(entry.value)
    }

    pub fn contains_key(&self, key: &K) -> Result<bool> {
        Ok(self.get(key)?.is_some())
    }

    /// Total live key count, read from the root's `tree_size` field.
    pub fn size(&self) -> Result<i64> {
        let _fence = self.atomics.acquire_read_fence();
        let _lock = self.locks.shared(self.file_id);
        let storage = self.storage.read();

        Ok(self.bucket(&storage, self.root)?.tree_size())
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.size()? == 0)
    }

    /// Inserts or overwrites. Returns `true` when the key was new.
    pub fn put(&self, key: &K, value: &V) -> Result<bool> {
        self.run_mutation(true, |tree, storage, op| {
            let raw_key = TreeKey::to_bytes(key);
            let raw_value = TreeValue::to_bytes(value);

            let previous = tree.insert_or_update(storage, op, key, &raw_key, &raw_value)?;
            let inserted = previous.is_none();
            if inserted {
                tree.update_size(storage, op, 1)?;
            }

            op.log_component_op(ComponentOp::Put {
                file_id: tree.file_id,
                raw_key,
                raw_value,
                prev_raw_value: previous,
            });
            Ok(inserted)
        })
        .wrap_err_with(|| format!("put into bonsai tree '{}' failed", self.name))
    }

    fn insert_or_update(
        &self,
        storage: &mut MmapStorage,
        op: &mut AtomicOperation,
        key: &K,
        raw_key: &[u8],
        raw_value: &[u8],
    ) -> Result<Option<Vec<u8>>> {
        let mut search = self.find_bucket(storage, key)?;

        if search.item_index >= 0 {
            let index = search.item_index as usize;
            let mut bucket = self.bucket_mut(storage, op, search.last())?;
            let previous = bucket.as_read().raw_value_at(index, raw_key.len())?;
            bucket.update_value(index, raw_key.len(), raw_value, &previous)?;
            return Ok(Some(previous));
        }

        let mut insertion_index = -search.item_index - 1;
        loop {
            let inserted = {
                let mut bucket = self.bucket_mut(storage, op, search.last())?;
                bucket.add_leaf_entry(insertion_index as usize, raw_key, raw_value)?
            };
            if inserted {
                return Ok(None);
            }

            let path: Path = search.path.clone();
            search = self.split_bucket(storage, op, &path, insertion_index, key)?;
            insertion_index = search.item_index;
        }
    }

    pub fn remove(&self, key: &K) -> Result<Option<V>> {
        self.run_mutation(true, |tree, storage, op| {
            let search = tree.find_bucket(storage, key)?;
            if search.item_index < 0 {
                return Ok(None);
            }
            let index = search.item_index as usize;

            let (raw_key, raw_value) = {
                let mut bucket = tree.bucket_mut(storage, op, search.last())?;
                let (raw_key, raw_value) = bucket.as_read().raw_leaf_entry_at(index)?;
                bucket.remove(index, &raw_key, &raw_value)?;
                (raw_key, raw_value)
            };
            tree.update_size(storage, op, -1)?;

            let removed = V::read_from(&raw_value)?;
            op.log_component_op(ComponentOp::Remove {
                file_id: tree.file_id,
                raw_key,
                raw_value,
            });
            Ok(Some(removed))
        })
        .wrap_err_with(|| format!("remove from bonsai tree '{}' failed", self.name))
    }

    fn update_size(
        &self,
        storage: &mut MmapStorage,
        op: &mut AtomicOperation,
        diff: i64,
    ) -> Result<()> {
        let mut root = self.bucket_mut(storage, op, self.root)?;
        let current = root.as_read().tree_size();
        root.set_tree_size(current + diff);
        Ok(())
    }

    // -----------------------------------------------------------------
    // split
    // -----------------------------------------------------------------

    fn split_bucket(
        &self,
        storage: &mut MmapStorage,
        op: &mut AtomicOperation,
        path: &[BonsaiPointer],
        key_index: i32,
        key_to_insert: &K,
    ) -> Result<SearchResult> {
        let pointer = *path
            .last()
            .ok_or_else(|| eyre!("split of tree '{}' with an empty path", self.name))?;

        let (split_leaf, index_to_split, separation_key, right_entries) = {
            let bucket = self.bucket(&*storage, pointer)?;
            let split_leaf = bucket.is_leaf();
            let count = bucket.size();
            let index_to_split = count >> 1;
            let separation_key = bucket.key_at(index_to_split)?;

            let start = if split_leaf {
                index_to_split
            } else {
                index_to_split + 1
            };
            let mut right_entries = Vec::with_capacity(count - start);
            for i in start..count {
                right_entries.push(bucket.raw_entry_at(i)?);
            }
            (split_leaf, index_to_split, separation_key, right_entries)
        };

        if pointer != self.root {
            self.split_non_root(
                storage,
                op,
                path,
                pointer,
                split_leaf,
                index_to_split,
                separation_key,
                right_entries,
                key_index,
                key_to_insert,
            )
        } else {
            self.split_root(
                storage,
                op,
                split_leaf,
                index_to_split,
                separation_key,
                right_entries,
                key_index,
                key_to_insert,
            )
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn split_non_root(
        &self,
        storage: &mut MmapStorage,
        op: &mut AtomicOperation,
        path: &[BonsaiPointer],
        pointer: BonsaiPointer,
        split_leaf: bool,
        index_to_split: usize,
        separation_key: K,
        right_entries: Vec<Vec<u8>>,
        key_index: i32,
        key_to_insert: &K,
    ) -> Result<SearchResult> {
        let right_pointer =
            sys::allocate_bucket(storage, op, self.file_id, self.bucket_size)?;

        {
            let mut right = self.bucket_mut(storage, op, right_pointer)?;
            right.format(split_leaf);
            right.add_all(&right_entries)?;
        }
        {
            let mut bucket = self.bucket_mut(storage, op, pointer)?;
            bucket.shrink(index_to_split)?;
        }

        if split_leaf {
            let old_right_sibling = self.bucket(&*storage, pointer)?.right_sibling();

            {
                let mut right = self.bucket_mut(storage, op, right_pointer)?;
                right.set_right_sibling(old_right_sibling);
                right.set_left_sibling(pointer);
            }
            {
                let mut bucket = self.bucket_mut(storage, op, pointer)?;
                bucket.set_right_sibling(right_pointer);
            }
            if old_right_sibling.is_valid() {
                let mut sibling = self.bucket_mut(storage, op, old_right_sibling)?;
                sibling.set_left_sibling(right_pointer);
            }
        }

        let parent_sub = &path[..path.len() - 1];
        let mut parent_pointer = *parent_sub
            .last()
            .ok_or_else(|| eyre!("non-root bucket with a root-length path in '{}'", self.name))?;

        let parent_entry = BonsaiEntry::<K, V> {
            left_child: pointer,
            right_child: right_pointer,
            key: separation_key.clone(),
            value: None,
        };

        let mut insertion_index = {
            let parent = self.bucket(&*storage, parent_pointer)?;
            let found = parent.find(&separation_key)?;
            ensure!(
                found < 0,
                "separation key already present in parent (tree '{}')",
                self.name
            );
            -found - 1
        };

        loop {
            let added = {
                let mut parent = self.bucket_mut(storage, op, parent_pointer)?;
                parent.add_entry(insertion_index as usize, &parent_entry, true)?
            };
            if added {
                break;
            }

            let result =
                self.split_bucket(storage, op, parent_sub, insertion_index, &separation_key)?;
            parent_pointer = result.last();
            insertion_index = result.item_index;
        }

        let mut result_path: Path = SmallVec::from_slice(parent_sub);
        if key_to_insert < &separation_key {
            result_path.push(pointer);
            return Ok(SearchResult {
                item_index: key_index,
                path: result_path,
            });
        }

        result_path.push(right_pointer);
        let item_index = if split_leaf {
            key_index - index_to_split as i32
        } else {
            key_index - index_to_split as i32 - 1
        };
        Ok(SearchResult {
            item_index,
            path: result_path,
        })
    }

    #[allow(clippy::too_many_arguments)]
    fn split_root(
        &self,
        storage: &mut MmapStorage,
        op: &mut AtomicOperation,
        split_leaf: bool,
        index_to_split: usize,
        separation_key: K,
        right_entries: Vec<Vec<u8>>,
        key_index: i32,
        key_to_insert: &K,
    ) -> Result<SearchResult> {
        let (tree_size, left_entries) = {
            let bucket = self.bucket(&*storage, self.root)?;
            let mut left_entries = Vec::with_capacity(index_to_split);
            for i in 0..index_to_split {
                left_entries.push(bucket.raw_entry_at(i)?);
            }
            (bucket.tree_size(), left_entries)
        };

        let left_pointer = sys::allocate_bucket(storage, op, self.file_id, self.bucket_size)?;
        let right_pointer = sys::allocate_bucket(storage, op, self.file_id, self.bucket_size)?;

        {
            let mut left = self.bucket_mut(storage, op, left_pointer)?;
            left.format(split_leaf);
            left.add_all(&left_entries)?;
            if split_leaf {
                left.set_right_sibling(right_pointer);
            }
        }
        {
            let mut right = self.bucket_mut(storage, op, right_pointer)?;
            right.format(split_leaf);
            right.add_all(&right_entries)?;
            if split_leaf {
                right.set_left_sibling(left_pointer);
            }
        }
        {
            let mut root = self.bucket_mut(storage, op, self.root)?;
            root.format(false);
            root.set_tree_size(tree_size);
            let added = root.add_entry(
                0,
                &BonsaiEntry::<K, V> {
                    left_child: left_pointer,
                    right_child: right_pointer,
                    key: separation_key.clone(),
                    value: None,
                },
                true,
            )?;
            ensure!(
                added,
                "separation key does not fit a fresh root bucket (tree '{}')",
                self.name
            );
        }

        let mut result_path: Path = SmallVec::new();
        result_path.push(self.root);

        if key_to_insert < &separation_key {
            result_path.push(left_pointer);
            return Ok(SearchResult {
                item_index: key_index,
                path: result_path,
            });
        }

        result_path.push(right_pointer);
        let item_index = if split_leaf {
            key_index - index_to_split as i32
        } else {
            key_index - index_to_split as i32 - 1
        };
        Ok(SearchResult {
            item_index,
            path: result_path,
        })
    }

    // -----------------------------------------------------------------
    // range scans
    // -----------------------------------------------------------------

    /// Visits entries with keys `<= key` (or `< key` when not inclusive) in
    /// descending order until the visitor returns `false`.
    pub fn load_entries_minor(
        &self,
        key: &K,
        inclusive: bool,
        mut visitor: impl FnMut(BonsaiEntry<K, V>) -> bool,
    ) -> Result<()> {
        let _fence = self.atomics.acquire_read_fence();
        let _lock = self.locks.shared(self.file_id);
        let storage = self.storage.read();

        let search = self.find_bucket(&storage, key)?;
        let mut index = if search.item_index >= 0 {
            if inclusive {
                search.item_index
            } else {
                search.item_index - 1
            }
        } else {
            -search.item_index - 2
        };

        let mut pointer = search.last();
        let mut first_bucket = true;

        while pointer.is_valid() {
            let bucket = self.bucket(&storage, pointer)?;
            if !first_bucket {
                index = bucket.size() as i32 - 1;
            }

            let mut i = index;
            while i >= 0 {
                if !visitor(bucket.entry_at(i as usize)?) {
                    return Ok(());
                }
                i -= 1;
            }

            pointer = bucket.left_sibling();
            first_bucket = false;
        }
        Ok(())
    }

    /// Visits entries with keys `>= key` (or `> key` when not inclusive) in
    /// ascending order until the visitor returns `false`. Descending order
    /// is not supported.
    pub fn load_entries_major(
        &self,
        key: &K,
        inclusive: bool,
        ascending: bool,
        mut visitor: impl FnMut(BonsaiEntry<K, V>) -> bool,
    ) -> Result<()> {
        ensure!(
            ascending,
            "descending iteration over tree '{}' is not supported",
            self.name
        );

        let _fence = self.atomics.acquire_read_fence();
        let _lock = self.locks.shared(self.file_id);
        let storage = self.storage.read();

        let search = self.find_bucket(&storage, key)?;
        let mut index = if search.item_index >= 0 {
            if inclusive {
                search.item_index
            } else {
                search.item_index + 1
            }
        } else {
            -search.item_index - 1
        };

        let mut pointer = search.last();

        while pointer.is_valid() {
            let bucket = self.bucket(&storage, pointer)?;
            let count = bucket.size() as i32;

            let mut i = index;
            while i < count {
                if !visitor(bucket.entry_at(i as usize)?) {
                    return Ok(());
                }
                i += 1;
            }

            pointer = bucket.right_sibling();
            index = 0;
        }
        Ok(())
    }

    /// Visits entries in `[key_from, key_to]` (bounds included per the
    /// inclusive flags) in ascending order.
    pub fn load_entries_between(
        &self,
        key_from: &K,
        from_inclusive: bool,
        key_to: &K,
        to_inclusive: bool,
        mut visitor: impl FnMut(BonsaiEntry<K, V>) -> bool,
    ) -> Result<()> {
        let _fence = self.atomics.acquire_read_fence();
        let _lock = self.locks.shared(self.file_id);
        let storage = self.storage.read();

        let from = self.find_bucket(&storage, key_from)?;
        let mut start_index = if from.item_index >= 0 {
            if from_inclusive {
                from.item_index
            } else {
                from.item_index + 1
            }
        } else {
            -from.item_index - 1
        };

        let to = self.find_bucket(&storage, key_to)?;
        let end_pointer = to.last();
        let end_item = if to.item_index >= 0 {
            if to_inclusive {
                to.item_index
            } else {
                to.item_index - 1
            }
        } else {
            -to.item_index - 2
        };

        let mut pointer = from.last();
        loop {
            let bucket = self.bucket(&storage, pointer)?;
            let end_index = if pointer == end_pointer {
                end_item
            } else {
                bucket.size() as i32 - 1
            };

            let mut i = start_index;
            while i <= end_index {
                if !visitor(bucket.entry_at(i as usize)?) {
                    return Ok(());
                }
                i += 1;
            }

            if pointer == end_pointer {
                break;
            }
            pointer = bucket.right_sibling();
            if !pointer.is_valid() {
                break;
            }
            start_index = 0;
        }
        Ok(())
    }

    /// Collects up to `max_values` values with keys below (or at) `key`.
    /// A negative cap collects everything.
    pub fn values_minor(&self, key: &K, inclusive: bool, max_values: i32) -> Result<Vec<V>> {
        let mut values = Vec::new();
        self.load_entries_minor(key, inclusive, |entry| {
            if let Some(value) = entry.value {
                values.push(value);
            }
            !(max_values > -1 && values.len() as i32 >= max_values)
        })?;
        Ok(values)
    }

    /// Collects up to `max_values` values with keys above (or at) `key`.
    /// A negative cap collects everything.
    pub fn values_major(&self, key: &K, inclusive: bool, max_values: i32) -> Result<Vec<V>> {
        let mut values = Vec::new();
        self.load_entries_major(key, inclusive, true, |entry| {
            if let Some(value) = entry.value {
                values.push(value);
            }
            !(max_values > -1 && values.len() as i32 >= max_values)
        })?;
        Ok(values)
    }

    /// Collects up to `max_values` values in the given key range. A
    /// non-positive cap collects everything.
    pub fn values_between(
        &self,
        key_from: &K,
        from_inclusive: bool,
        key_to: &K,
        to_inclusive: bool,
        max_values: i32,
    ) -> Result<Vec<V>> {
        let mut values = Vec::new();
        self.load_entries_between(key_from, from_inclusive, key_to, to_inclusive, |entry| {
            if let Some(value) = entry.value {
                values.push(value);
            }
            !(max_values > 0 && values.len() as i32 >= max_values)
        })?;
        Ok(values)
    }

    // -----------------------------------------------------------------
    // first / last key
    // -----------------------------------------------------------------

    /// The smallest key, or `None` for an entirely empty tree. Descends
    /// leftmost-first and backtracks over empty leaves.
    pub fn first_key(&self) -> Result<Option<K>> {
        let _fence = self.atomics.acquire_read_fence();
        let _lock = self.locks.shared(self.file_id);
        let storage = self.storage.read();

        let mut stack: Vec<(BonsaiPointer, i32)> = Vec::new();
        let mut pointer = self.root;
        let mut item_index: i32 = 0;

        loop {
            let bucket = self.bucket(&storage, pointer)?;

            if bucket.is_leaf() {
                if !bucket.is_empty() {
                    return Ok(Some(bucket.key_at(0)?));
                }
                match stack.pop() {
                    Some((parent, index)) => {
                        pointer = parent;
                        item_index = index + 1;
                    }
                    None => return Ok(None),
                }
            } else if bucket.is_empty() || item_index > bucket.size() as i32 {
                match stack.pop() {
                    Some((parent, index)) => {
                        pointer = parent;
                        item_index = index + 1;
                    }
                    None => return Ok(None),
                }
            } else {
                stack.push((pointer, item_index));
                pointer = if item_index < bucket.size() as i32 {
                    bucket.entry_at(item_index as usize)?.left_child
                } else {
                    bucket.entry_at(item_index as usize - 1)?.right_child
                };
                item_index = 0;
            }
        }
    }

    /// The largest key, or `None` for an entirely empty tree.
    pub fn last_key(&self) -> Result<Option<K>> {
        let _fence = self.atomics.acquire_read_fence();
        let _lock = self.locks.shared(self.file_id);
        let storage = self.storage.read();

        let mut stack: Vec<(BonsaiPointer, i32)> = Vec::new();
        let mut pointer = self.root;
        let mut item_index: i32 = 0;
        // the index into a freshly entered bucket depends on that bucket's
        // size, so it stays pending until the bucket is loaded
        let mut pending_last = true;

        loop {
            let bucket = self.bucket(&storage, pointer)?;
            if pending_last {
                item_index = bucket.size() as i32 - 1;
                pending_last = false;
            }

            if bucket.is_leaf() {
                if !bucket.is_empty() {
                    return Ok(Some(bucket.key_at(bucket.size() - 1)?));
                }
                match stack.pop() {
                    Some((parent, index)) => {
                        pointer = parent;
                        item_index = index - 1;
                    }
                    None => return Ok(None),
                }
            } else if item_index < -1 {
                match stack.pop() {
                    Some((parent, index)) => {
                        pointer = parent;
                        item_index = index - 1;
                    }
                    None => return Ok(None),
                }
            } else {
                stack.push((pointer, item_index));
                pointer = if item_index > -1 {
                    bucket.entry_at(item_index as usize)?.right_child
                } else {
                    bucket.entry_at(0)?.left_child
                };
                pending_last = true;
            }
        }
    }

    // -----------------------------------------------------------------
    // clear / delete
    // -----------------------------------------------------------------

    /// Removes every entry, recycling all non-root buckets through the file
    /// free list. The root stays in place as an empty leaf.
    pub fn clear(&self) -> Result<()> {
        self.run_mutation(true, |tree, storage, op| {
            let mut queue = VecDeque::new();
            {
                let root = tree.bucket(&*storage, tree.root)?;
                tree.enqueue_children(&root, &mut queue)?;
            }
            {
                let mut root = tree.bucket_mut(storage, op, tree.root)?;
                root.shrink(0)?;
                root.format(true);
                root.set_tree_size(0);
            }
            tree.recycle_subtrees(storage, op, queue)
        })
        .wrap_err_with(|| format!("clear of bonsai tree '{}' failed", self.name))
    }

    /// Recycles the whole tree, root included, into the file free list.
    /// Afterwards `load` reports the tree as not live.
    pub fn delete(&self) -> Result<()> {
        self.run_mutation(false, |tree, storage, op| {
            let mut queue = VecDeque::new();
            queue.push_back(tree.root);
            tree.recycle_subtrees(storage, op, queue)
        })
        .wrap_err_with(|| format!("delete of bonsai tree '{}' failed", self.name))
    }

    fn enqueue_children(
        &self,
        bucket: &BonsaiBucket<'_, K, V>,
        queue: &mut VecDeque<BonsaiPointer>,
    ) -> Result<()> {
        if !bucket.is_leaf() {
            let count = bucket.size();
            if count > 0 {
                queue.push_back(bucket.entry_at(0)?.left_child);
            }
            for i in 0..count {
                queue.push_back(bucket.entry_at(i)?.right_child);
            }
        }
        Ok(())
    }

    /// Breadth-first recycling: marks every reachable bucket DELETED,
    /// threads them into a chain through their free-list pointers, then
    /// splices the chain onto the file free list with one head swap.
    fn recycle_subtrees(
        &self,
        storage: &mut MmapStorage,
        op: &mut AtomicOperation,
        mut queue: VecDeque<BonsaiPointer>,
    ) -> Result<()> {
        let mut head = BonsaiPointer::NULL;
        let tail = queue.front().copied();
        let mut recycled: i32 = 0;

        while let Some(pointer) = queue.pop_front() {
            {
                let bucket = self.bucket(&*storage, pointer)?;
                self.enqueue_children(&bucket, &mut queue)?;
            }
            {
                let mut bucket = self.bucket_mut(storage, op, pointer)?;
                bucket.set_free_list_pointer(head);
                bucket.set_deleted();
            }
            head = pointer;
            recycled += 1;
        }

        if head.is_valid() {
            let tail =
                tail.ok_or_else(|| eyre!("recycled chain without a tail in '{}'", self.name))?;

            let (old_head, old_length) = {
                let page = storage.page(0)?;
                let sys = SysBucket::open(&page[..self.bucket_size]);
                (sys.free_list_head(), sys.free_list_length())
            };
            {
                let mut tail_bucket = self.bucket_mut(storage, op, tail)?;
                tail_bucket.set_free_list_pointer(old_head);
            }
            {
                let page = storage.page_mut(0)?;
                let mut sys = SysBucketMut::open(
                    &mut page[..self.bucket_size],
                    sys::sys_target(self.file_id, self.bucket_size),
                    op,
                );
                sys.set_free_list_head(head);
                sys.set_free_list_length(old_length + recycled);
            }
        }
        Ok(())
    }

    // -----------------------------------------------------------------
    // recovery entry points
    // -----------------------------------------------------------------

    /// Re-applies a logged put under an existing atomic operation. Used
    /// during recovery; records no new component operation.
    pub fn rollback_put(
        &self,
        raw_key: &[u8],
        raw_value: &[u8],
        op: &mut AtomicOperation,
    ) -> Result<()> {
        let key = K::read_from(raw_key)?;
        let _lock = self.locks.exclusive(self.file_id);
        let mut storage = self.storage.write();

        let previous = self.insert_or_update(&mut storage, op, &key, raw_key, raw_value)?;
        if previous.is_none() {
            self.update_size(&mut storage, op, 1)?;
        }
        Ok(())
    }

    /// Re-applies a logged removal under an existing atomic operation.
    pub fn rollback_remove(&self, raw_key: &[u8], op: &mut AtomicOperation) -> Result<()> {
        let key = K::read_from(raw_key)?;
        let _lock = self.locks.exclusive(self.file_id);
        let mut storage = self.storage.write();

        let search = self.find_bucket(&storage, &key)?;
        ensure!(
            search.item_index >= 0,
            "recovery removal of an absent key in tree '{}'",
            self.name
        );
        let index = search.item_index as usize;

        {
            let mut bucket = self.bucket_mut(&mut storage, op, search.last())?;
            let (raw_key, raw_value) = bucket.as_read().raw_leaf_entry_at(index)?;
            bucket.remove(index, &raw_key, &raw_value)?;
        }
        self.update_size(&mut storage, op, -1)?;
        Ok(())
    }

    /// Re-applies a logged whole-tree deletion under an existing atomic
    /// operation.
    pub fn rollback_delete(&self, op: &mut AtomicOperation) -> Result<()> {
        let _lock = self.locks.exclusive(self.file_id);
        let mut storage = self.storage.write();

        let mut queue = VecDeque::new();
        queue.push_back(self.root);
        self.recycle_subtrees(&mut storage, op, queue)
    }

    // -----------------------------------------------------------------
    // diagnostics
    // -----------------------------------------------------------------

    /// Flushes the backing file to disk.
    pub fn flush(&self) -> Result<()> {
        let _fence = self.atomics.acquire_read_fence();
        let _lock = self.locks.shared(self.file_id);
        self.storage.read().sync()
    }

    /// Number of recycled buckets currently on the file free list.
    pub fn free_list_length(&self) -> Result<i32> {
        let _fence = self.atomics.acquire_read_fence();
        let _lock = self.locks.shared(self.file_id);
        let storage = self.storage.read();

        let page = storage.page(0)?;
        Ok(SysBucket::open(&page[..self.bucket_size]).free_list_length())
    }

    /// Number of pages in the backing file.
    pub fn page_count(&self) -> Result<u32> {
        let _fence = self.atomics.acquire_read_fence();
        let _lock = self.locks.shared(self.file_id);
        Ok(self.storage.read().page_count())
    }

    /// Walks the whole tree and the file free list, verifying structural
    /// invariants: strictly ascending keys, child-pointer agreement between
    /// consecutive internal entries, a symmetric leaf sibling chain,
    /// `tree_size` matching the reachable entry count, and a free list
    /// whose buckets are DELETED and appear exactly once.
    pub fn check_consistency(&self) -> Result<()> {
        let _fence = self.atomics.acquire_read_fence();
        let _lock = self.locks.shared(self.file_id);
        let storage = self.storage.read();

        let summary = self.verify_subtree(&storage, self.root)?;

        let root = self.bucket(&storage, self.root)?;
        ensure!(
            root.tree_size() == summary.entry_count,
            "tree_size {} does not match the {} reachable entries in '{}'",
            root.tree_size(),
            summary.entry_count,
            self.name
        );

        self.verify_leaf_chain(&storage, summary.leftmost_leaf)?;
        self.verify_free_list(&storage)?;
        Ok(())
    }

    fn verify_subtree(
        &self,
        storage: &MmapStorage,
        pointer: BonsaiPointer,
    ) -> Result<SubtreeSummary<K>> {
        let bucket = self.bucket(storage, pointer)?;
        ensure!(
            !bucket.is_deleted(),
            "live tree '{}' references DELETED bucket {}|{}",
            self.name,
            pointer.page_index,
            pointer.page_offset
        );

        let count = bucket.size();
        let mut previous: Option<K> = None;
        for i in 0..count {
            let key = bucket.key_at(i)?;
            if let Some(prev) = &previous {
                ensure!(
                    *prev < key,
                    "keys out of order at slot {} of bucket {}|{} in '{}'",
                    i,
                    pointer.page_index,
                    pointer.page_offset,
                    self.name
                );
            }
            previous = Some(key);
        }

        if bucket.is_leaf() {
            return Ok(SubtreeSummary {
                min_key: if count > 0 { Some(bucket.key_at(0)?) } else { None },
                max_key: previous,
                entry_count: count as i64,
                leftmost_leaf: pointer,
            });
        }

        ensure!(
            count > 0,
            "empty internal bucket {}|{} in '{}'",
            pointer.page_index,
            pointer.page_offset,
            self.name
        );

        let mut entry_count = 0i64;
        let mut leftmost_leaf = BonsaiPointer::NULL;

        for i in 0..count {
            let entry = bucket.entry_at(i)?;
            if i + 1 < count {
                let next = bucket.entry_at(i + 1)?;
                ensure!(
                    entry.right_child == next.left_child,
                    "adjacent entries {} and {} of bucket {}|{} disagree on their shared child",
                    i,
                    i + 1,
                    pointer.page_index,
                    pointer.page_offset
                );
            }

            if i == 0 {
                let left = self.verify_subtree(storage, entry.left_child)?;
                if let Some(max) = &left.max_key {
                    ensure!(
                        *max < entry.key,
                        "left subtree of separator {} overflows it in '{}'",
                        i,
                        self.name
                    );
                }
                entry_count += left.entry_count;
                leftmost_leaf = left.leftmost_leaf;
            }

            let right = self.verify_subtree(storage, entry.right_child)?;
            if let Some(min) = &right.min_key {
                ensure!(
                    entry.key <= *min,
                    "right subtree of separator {} underflows it in '{}'",
                    i,
                    self.name
                );
            }
            entry_count += right.entry_count;
        }

        Ok(SubtreeSummary {
            min_key: if count > 0 { Some(bucket.key_at(0)?) } else { None },
            max_key: previous,
            entry_count,
            leftmost_leaf,
        })
    }

    fn verify_leaf_chain(&self, storage: &MmapStorage, leftmost: BonsaiPointer) -> Result<()> {
        let mut pointer = leftmost;
        let mut previous = BonsaiPointer::NULL;
        let mut last_key: Option<K> = None;

        while pointer.is_valid() {
            let bucket = self.bucket(storage, pointer)?;
            ensure!(
                bucket.is_leaf(),
                "sibling chain of '{}' reached internal bucket {}|{}",
                self.name,
                pointer.page_index,
                pointer.page_offset
            );
            ensure!(
                bucket.left_sibling() == previous,
                "leaf {}|{} does not point back at its left sibling in '{}'",
                pointer.page_index,
                pointer.page_offset,
                self.name
            );

            if bucket.size() > 0 {
                let first = bucket.key_at(0)?;
                if let Some(last) = &last_key {
                    ensure!(
                        *last < first,
                        "keys across sibling leaves out of order in '{}'",
                        self.name
                    );
                }
                last_key = Some(bucket.key_at(bucket.size() - 1)?);
            }

            previous = pointer;
            pointer = bucket.right_sibling();
        }
        Ok(())
    }

    fn verify_free_list(&self, storage: &MmapStorage) -> Result<()> {
        let (mut pointer, expected) = {
            let page = storage.page(0)?;
            let sys = SysBucket::open(&page[..self.bucket_size]);
            (sys.free_list_head(), sys.free_list_length())
        };

        let mut seen = hashbrown::HashSet::new();
        let mut walked = 0i32;

        while pointer.is_valid() {
            ensure!(
                seen.insert(pointer),
                "bucket {}|{} appears twice on the free list of '{}'",
                pointer.page_index,
                pointer.page_offset,
                self.name
            );
            let bucket = self.bucket(storage, pointer)?;
            ensure!(
                bucket.is_deleted(),
                "free-listed bucket {}|{} is not DELETED in '{}'",
                pointer.page_index,
                pointer.page_offset,
                self.name
            );
            walked += 1;
            pointer = bucket.free_list_pointer();
        }

        ensure!(
            walked == expected,
            "free list of '{}' holds {} buckets but the system bucket says {}",
            self.name,
            walked,
            expected
        );
        Ok(())
    }

    /// Writes an indented structural dump of the tree, one line per bucket.
    pub fn dump(&self, out: &mut dyn Write) -> Result<()> {
        let _fence = self.atomics.acquire_read_fence();
        let _lock = self.locks.shared(self.file_id);
        let storage = self.storage.read();

        self.dump_bucket(&storage, self.root, 0, out)
    }

    fn dump_bucket(
        &self,
        storage: &MmapStorage,
        pointer: BonsaiPointer,
        depth: usize,
        out: &mut dyn Write,
    ) -> Result<()> {
        let (line, children) = {
            let bucket = self.bucket(storage, pointer)?;
            if bucket.is_leaf() {
                (
                    format!(
                        "{:indent$}leaf {}|{} size={} left={} right={}",
                        "",
                        pointer.page_index,
                        pointer.page_offset,
                        bucket.size(),
                        bucket.left_sibling().page_index,
                        bucket.right_sibling().page_index,
                        indent = depth * 2
                    ),
                    Vec::new(),
                )
            } else {
                let mut children = Vec::with_capacity(bucket.size() + 1);
                if !bucket.is_empty() {
                    children.push(bucket.entry_at(0)?.left_child);
                }
                for i in 0..bucket.size() {
                    children.push(bucket.entry_at(i)?.right_child);
                }
                (
                    format!(
                        "{:indent$}node {}|{} size={}",
                        "",
                        pointer.page_index,
                        pointer.page_offset,
                        bucket.size(),
                        indent = depth * 2
                    ),
                    children,
                )
            }
        };

        writeln!(out, "{}", line)?;
        for child in children {
            self.dump_bucket(storage, child, depth + 1, out)?;
        }
        Ok(())
    }
}

impl<K: TreeKey + std::hash::Hash + Eq> BonsaiTree<K, i32> {
    /// Effective size of a counter bag: every stored counter with its
    /// pending change applied, plus pending changes for keys not yet in
    /// the tree applied against zero.
    pub fn real_bag_size(&self, changes: &HashMap<K, Change>) -> Result<i32> {
        let mut remaining = changes.clone();
        let mut total: i32 = 0;

        if let Some(first) = self.first_key()? {
            self.load_entries_major(&first, true, true, |entry| {
                let stored = entry.value.unwrap_or(0);
                total += match remaining.remove(&entry.key) {
                    Some(change) => change.apply_to(stored),
                    None => stored,
                };
                true
            })?;
        }

        for change in remaining.values() {
            total += change.apply_to(0);
        }
        Ok(total)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn new_tree(dir: &tempfile::TempDir, bucket_size: usize) -> BonsaiTree<i32, i64> {
        BonsaiTree::create(
            dir.path().join("bag.arb"),
            "bag",
            bucket_size,
            Arc::new(FileLockManager::new()),
            Arc::new(AtomicOperationsManager::new()),
        )
        .unwrap()
    }

    #[test]
    fn create_rejects_variable_length_values() {
        let dir = tempdir().unwrap();
        let result = BonsaiTree::<i32, String>::create(
            dir.path().join("t.arb"),
            "t",
            8192,
            Arc::new(FileLockManager::new()),
            Arc::new(AtomicOperationsManager::new()),
        );

        assert!(result.is_err());
        assert!(result
            .unwrap_err()
            .to_string()
            .contains("fixed-length value type"));
    }

    #[test]
    fn create_rejects_bucket_sizes_that_do_not_divide_the_page() {
        let dir = tempdir().unwrap();
        let result = BonsaiTree::<i32, i64>::create(
            dir.path().join("t.arb"),
            "t",
            5000,
            Arc::new(FileLockManager::new()),
            Arc::new(AtomicOperationsManager::new()),
        );

        assert!(result.is_err());
    }

    #[test]
    fn fresh_tree_is_empty() {
        let dir = tempdir().unwrap();
        let tree = new_tree(&dir, 8192);

        assert_eq!(tree.size().unwrap(), 0);
        assert!(tree.is_empty().unwrap());
        assert!(tree.get(&5).unwrap().is_none());
        assert!(tree.first_key().unwrap().is_none());
        assert!(tree.last_key().unwrap().is_none());
    }

    #[test]
    fn put_get_remove_round_trip() {
        let dir = tempdir().unwrap();
        let tree = new_tree(&dir, 8192);

        assert!(tree.put(&1, &10).unwrap());
        assert!(tree.put(&3, &30).unwrap());
        assert!(tree.put(&2, &20).unwrap());

        assert_eq!(tree.get(&2).unwrap(), Some(20));
        assert_eq!(tree.size().unwrap(), 3);

        assert_eq!(tree.remove(&2).unwrap(), Some(20));
        assert!(tree.get(&2).unwrap().is_none());
        assert_eq!(tree.size().unwrap(), 2);
        assert!(tree.remove(&2).unwrap().is_none());
    }

    #[test]
    fn overwrite_keeps_size_and_returns_false() {
        let dir = tempdir().unwrap();
        let tree = new_tree(&dir, 8192);

        assert!(tree.put(&7, &70).unwrap());
        assert!(!tree.put(&7, &71).unwrap());

        assert_eq!(tree.get(&7).unwrap(), Some(71));
        assert_eq!(tree.size().unwrap(), 1);
    }

    #[test]
    fn first_and_last_key() {
        let dir = tempdir().unwrap();
        let tree = new_tree(&dir, 8192);

        for key in [5, 1, 9, 3] {
            tree.put(&key, &(key as i64)).unwrap();
        }

        assert_eq!(tree.first_key().unwrap(), Some(1));
        assert_eq!(tree.last_key().unwrap(), Some(9));
    }

    #[test]
    fn descending_major_scan_is_rejected() {
        let dir = tempdir().unwrap();
        let tree = new_tree(&dir, 8192);
        tree.put(&1, &1).unwrap();

        let result = tree.load_entries_major(&0, true, false, |_| true);

        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("not supported"));
    }

    fn new_bag_tree(dir: &tempfile::TempDir, bucket_size: usize) -> BonsaiTree<i32, i32> {
        BonsaiTree::create(
            dir.path().join("bag.arb"),
            "bag",
            bucket_size,
            Arc::new(FileLockManager::new()),
            Arc::new(AtomicOperationsManager::new()),
        )
        .unwrap()
    }

    #[test]
    fn real_bag_size_applies_changes() {
        let dir = tempdir().unwrap();
        let tree = new_bag_tree(&dir, 8192);
        tree.put(&1, &3).unwrap();
        tree.put(&2, &4).unwrap();

        let mut changes = HashMap::new();
        changes.insert(1, Change::Diff(2));
        changes.insert(9, Change::Diff(5));
        changes.insert(2, Change::Absolute(1));

        // (3+2) + 1 + (0+5)
        assert_eq!(tree.real_bag_size(&changes).unwrap(), 11);
    }

    #[test]
    fn real_bag_size_of_empty_tree_sums_changes_against_zero() {
        let dir = tempdir().unwrap();
        let tree = new_bag_tree(&dir, 8192);

        let mut changes = HashMap::new();
        changes.insert(4, Change::Diff(6));

        assert_eq!(tree.real_bag_size(&changes).unwrap(), 6);
    }

    #[test]
    fn load_reports_live_and_deleted_roots() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("bag.arb");
        let locks = Arc::new(FileLockManager::new());
        let atomics = Arc::new(AtomicOperationsManager::new());

        let root = {
            let tree = BonsaiTree::<i32, i64>::create(
                &path,
                "bag",
                8192,
                locks.clone(),
                atomics.clone(),
            )
            .unwrap();
            tree.put(&1, &2).unwrap();
            tree.root_pointer()
        };

        let (tree, live) = BonsaiTree::<i32, i64>::load(
            &path,
            "bag",
            8192,
            root,
            locks.clone(),
            atomics.clone(),
        )
        .unwrap();
        assert!(live);
        assert_eq!(tree.get(&1).unwrap(), Some(2));

        tree.delete().unwrap();

        let (_tree, live) =
            BonsaiTree::<i32, i64>::load(&path, "bag", 8192, root, locks, atomics).unwrap();
        assert!(!live);
    }
}
