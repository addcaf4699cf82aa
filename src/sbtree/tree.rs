//! # Standard Tree Engine
//!
//! The page-per-bucket tree. Algorithms are the shared core: root-down
//! search returning the full pointer path, leaf insert with recursive
//! midpoint splits, simple leaf delete, ascending scans over the sibling
//! chain, first/last key with backtracking. What differs from the bonsai
//! engine is the substrate:
//!
//! - Buckets are whole pages addressed by `i64` page index; the root is
//!   always page 0 and never moves.
//! - New buckets come from file growth; there is no free list. `clear`
//!   reinitializes the root and abandons the other pages.
//! - Values may be variable-length or external links, so an overwrite only
//!   happens in place when the new encoding has the old one's size;
//!   otherwise the entry is removed and reinserted under the same atomic
//!   operation.
//! - Keys pass through the optional encryption codec on their way into
//!   bucket bytes.
//!
//! Durability and locking follow the bonsai engine exactly: exclusive file
//! lock plus atomic operation around every mutation, shared lock plus
//! recovery fence around every read, byte-exact rollback on failure.

use std::io::ErrorKind;
use std::marker::PhantomData;
use std::path::{Path as FsPath, PathBuf};
use std::sync::Arc;

use eyre::{ensure, eyre, Result, WrapErr};
use parking_lot::RwLock;
use smallvec::SmallVec;

use super::bucket::{
    decode_value, encode_value, SbBucket, SbBucketMut, SbEntry, SbValue, NULL_PAGE,
};
use crate::encoding::{TreeKey, TreeValue};
use crate::encryption::EncryptionCodec;
use crate::storage::wal::{BucketLayout, ComponentOp, PageTarget};
use crate::storage::{
    AtomicOperation, AtomicOperationsManager, FileLockManager, MmapStorage, Storage,
};

const ROOT_PAGE: i64 = 0;

type Path = SmallVec<[i64; 8]>;

struct SubtreeSummary<K> {
    min_key: Option<K>,
    max_key: Option<K>,
    entry_count: i64,
    leftmost_leaf: i64,
}

struct SearchResult {
    item_index: i32,
    path: Path,
}

impl SearchResult {
    fn last(&self) -> i64 {
        *self.path.last().expect("search path is never empty")
    }
}

pub struct SbTree<K, V> {
    name: String,
    path: PathBuf,
    file_id: u64,
    codec: Option<Arc<dyn EncryptionCodec>>,
    storage: Arc<RwLock<MmapStorage>>,
    locks: Arc<FileLockManager>,
    atomics: Arc<AtomicOperationsManager>,
    _marker: PhantomData<fn() -> (K, V)>,
}

impl<K: TreeKey, V: TreeValue> SbTree<K, V> {
    /// Creates a new tree in a new file with the root leaf at page 0.
    pub fn create<P: AsRef<FsPath>>(
        path: P,
        name: &str,
        codec: Option<Arc<dyn EncryptionCodec>>,
        locks: Arc<FileLockManager>,
        atomics: Arc<AtomicOperationsManager>,
    ) -> Result<Self> {
        let file_id = locks.register_file();
        let mut op = atomics.start(false);
        let lock_manager = locks.clone();
        let _lock = lock_manager.exclusive(file_id);

        let mut storage = MmapStorage::create(path.as_ref(), 1)
            .wrap_err_with(|| format!("failed to create sbtree '{}'", name))?;

        let created: Result<()> = (|| {
            let page = storage.page_mut(0)?;
            let target = PageTarget {
                file_id,
                page_index: 0,
                page_offset: 0,
                layout: BucketLayout::Standard,
            };
            let mut root = SbBucketMut::<K, V>::open(page, codec.as_deref(), target, &mut op);
            root.format(true);
            root.set_tree_size(0);
            Ok(())
        })();

        match created {
            Ok(()) => {
                op.log_component_op(ComponentOp::Create {
                    file_id,
                    name: name.to_owned(),
                    root_page: ROOT_PAGE,
                    root_offset: 0,
                });
                atomics.commit(op)?;

                Ok(Self {
                    name: name.to_owned(),
                    path: path.as_ref().to_path_buf(),
                    file_id,
                    codec,
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

    /// Reopens a tree from its file.
    pub fn load<P: AsRef<FsPath>>(
        path: P,
        name: &str,
        codec: Option<Arc<dyn EncryptionCodec>>,
        locks: Arc<FileLockManager>,
        atomics: Arc<AtomicOperationsManager>,
    ) -> Result<Self> {
        let file_id = locks.register_file();
        let lock_manager = locks.clone();
        let _lock = lock_manager.exclusive(file_id);

        let storage = MmapStorage::open(path.as_ref())
            .wrap_err_with(|| format!("failed to load sbtree '{}'", name))?;

        {
            let page = storage.page(0)?;
            let root = SbBucket::<K, V>::open(page, codec.as_deref());
            // serializer ids are preserved on disk for compatibility; the
            // type parameters are authoritative, so they are not consulted
            let _ = (root.key_serializer_id(), root.value_serializer_id());
        }

        Ok(Self {
            name: name.to_owned(),
            path: path.as_ref().to_path_buf(),
            file_id,
            codec,
            storage: Arc::new(RwLock::new(storage)),
            locks,
            atomics,
            _marker: PhantomData,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn file_id(&self) -> u64 {
        self.file_id
    }

    // -----------------------------------------------------------------
    // bucket access helpers
    // -----------------------------------------------------------------

    fn target(&self, page_index: i64) -> PageTarget {
        PageTarget {
            file_id: self.file_id,
            page_index: page_index as u32,
            page_offset: 0,
            layout: BucketLayout::Standard,
        }
    }

    fn bucket<'s>(&'s self, storage: &'s MmapStorage, page_index: i64) -> Result<SbBucket<'s, K, V>> {
        ensure!(
            page_index >= 0,
            "NULL page index dereferenced in tree '{}'",
            self.name
        );
        let page = storage.page(page_index as u32)?;
        Ok(SbBucket::open(page, self.codec.as_deref()))
    }

    fn bucket_mut<'s>(
        &'s self,
        storage: &'s mut MmapStorage,
        op: &'s mut AtomicOperation,
        page_index: i64,
    ) -> Result<SbBucketMut<'s, K, V>> {
        ensure!(
            page_index >= 0,
            "NULL page index dereferenced in tree '{}'",
            self.name
        );
        let target = self.target(page_index);
        let page = storage.page_mut(page_index as u32)?;
        Ok(SbBucketMut::open(page, self.codec.as_deref(), target, op))
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

    /// Serializes (and with a codec installed, encrypts and frames) a key.
    fn encode_key(&self, key: &K) -> Vec<u8> {
        let plain = TreeKey::to_bytes(key);
        match &self.codec {
            None => plain,
            Some(codec) => {
                let cipher = codec.encrypt(&plain);
                let mut bytes = (cipher.len() as i32).to_le_bytes().to_vec();
                bytes.extend_from_slice(&cipher);
                bytes
            }
        }
    }

    // -----------------------------------------------------------------
    // search
    // -----------------------------------------------------------------

    fn find_bucket(&self, storage: &MmapStorage, key: &K) -> Result<SearchResult> {
        let mut page_index = ROOT_PAGE;
        let mut path: Path = SmallVec::new();

        loop {
            path.push(page_index);

            let (item_index, next) = {
                let bucket = self.bucket(storage, page_index)?;
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
                Some(child) => page_index = child,
            }
        }
    }

    // -----------------------------------------------------------------
    // point operations
    // -----------------------------------------------------------------

    pub fn get(&self, key: &K) -> Result<Option<SbValue<V>>> {
        let _fence = self.atomics.acquire_read_fence();
        let _lock = self.locks.shared(self.file_id);
        let storage = self.storage.read();

        let search = self.find_bucket(&storage, key)?;
        if search.item_index < 0 {
            return Ok(None);
        }

        let bucket = self.bucket(&storage, search.last())?;
        Ok(Some(bucket.value_at(search.item_index as usize)?))
    }

    pub fn contains_key(&self, key: &K) -> Result<bool> {
        Ok(self.get(key)?.is_some())
    }

    pub fn size(&self) -> Result<i64> {
        let _fence = self.atomics.acquire_read_fence();
        let _lock = self.locks.shared(self.file_id);
        let storage = self.storage.read();

        Ok(self.bucket(&storage, ROOT_PAGE)?.tree_size())
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.size()? == 0)
    }

    /// Inserts or overwrites an inline value. Returns `true` when the key
    /// was new.
    pub fn put(&self, key: &K, value: &V) -> Result<bool> {
        self.put_value(key, &SbValue::Inline(value.clone()))
    }

    /// Inserts or overwrites an external-value link.
    pub fn put_link(&self, key: &K, link: i64) -> Result<bool> {
        self.put_value(key, &SbValue::Link(link))
    }

    fn put_value(&self, key: &K, value: &SbValue<V>) -> Result<bool> {
        self.run_mutation(true, |tree, storage, op| {
            let raw_key = tree.encode_key(key);
            let raw_value = encode_value::<V>(value);

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
        .wrap_err_with(|| format!("put into sbtree '{}' failed", self.name))
    }

    /// Returns the previous raw value (link flag included) when the key
    /// existed, `None` on a fresh insert.
    fn insert_or_update(
        &self,
        storage: &mut MmapStorage,
        op: &mut AtomicOperation,
        key: &K,
        raw_key: &[u8],
        raw_value: &[u8],
    ) -> Result<Option<Vec<u8>>> {
        let search = self.find_bucket(storage, key)?;

        if search.item_index >= 0 {
            let index = search.item_index as usize;
            let page_index = search.last();

            // the stored key bytes are authoritative: with an encryption
            // codec installed a fresh encoding of the same key may differ
            let (stored_key, previous) = {
                let bucket = self.bucket(&*storage, page_index)?;
                bucket.raw_leaf_entry_at(index)?
            };

            // same-size inline values are overwritten in place; anything
            // else re-inserts the entry under the same operation
            if previous.len() == raw_value.len() && previous[0] == 0 && raw_value[0] == 0 {
                let mut bucket = self.bucket_mut(storage, op, page_index)?;
                bucket.update_value(index, stored_key.len(), &raw_value[1..], &previous[1..])?;
                return Ok(Some(previous));
            }

            {
                let mut bucket = self.bucket_mut(storage, op, page_index)?;
                bucket.remove(index, &stored_key, &previous)?;
            }
            self.insert_loop(storage, op, key, raw_key, raw_value, search, index as i32)?;
            return Ok(Some(previous));
        }

        let insertion_index = -search.item_index - 1;
        self.insert_loop(storage, op, key, raw_key, raw_value, search, insertion_index)?;
        Ok(None)
    }

    fn insert_loop(
        &self,
        storage: &mut MmapStorage,
        op: &mut AtomicOperation,
        key: &K,
        raw_key: &[u8],
        raw_value: &[u8],
        mut search: SearchResult,
        mut insertion_index: i32,
    ) -> Result<()> {
        loop {
            let inserted = {
                let mut bucket = self.bucket_mut(storage, op, search.last())?;
                bucket.add_leaf_entry(insertion_index as usize, raw_key, raw_value)?
            };
            if inserted {
                return Ok(());
            }

            let path: Path = search.path.clone();
            search = self.split_bucket(storage, op, &path, insertion_index, key)?;
            insertion_index = search.item_index;
        }
    }

    pub fn remove(&self, key: &K) -> Result<Option<SbValue<V>>> {
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

            let removed = decode_value::<V>(&raw_value)?;
            op.log_component_op(ComponentOp::Remove {
                file_id: tree.file_id,
                raw_key,
                raw_value,
            });
            Ok(Some(removed))
        })
        .wrap_err_with(|| format!("remove from sbtree '{}' failed", self.name))
    }

    fn update_size(
        &self,
        storage: &mut MmapStorage,
        op: &mut AtomicOperation,
        diff: i64,
    ) -> Result<()> {
        let mut root = self.bucket_mut(storage, op, ROOT_PAGE)?;
        let current = root.as_read().tree_size();
        root.set_tree_size(current + diff);
        Ok(())
    }

    // -----------------------------------------------------------------
    // external-value free list head
    // -----------------------------------------------------------------

    /// Head of the external-value free list, stored in the root bucket and
    /// managed by the external-value subsystem.
    pub fn values_free_list_first(&self) -> Result<i64> {
        let _fence = self.atomics.acquire_read_fence();
        let _lock = self.locks.shared(self.file_id);
        let storage = self.storage.read();

        Ok(self.bucket(&storage, ROOT_PAGE)?.values_free_list_first())
    }

    pub fn set_values_free_list_first(&self, page_index: i64) -> Result<()> {
        self.run_mutation(true, |tree, storage, op| {
            let mut root = tree.bucket_mut(storage, op, ROOT_PAGE)?;
            root.set_values_free_list_first(page_index);
            Ok(())
        })
    }

    // -----------------------------------------------------------------
    // split
    // -----------------------------------------------------------------

    fn split_bucket(
        &self,
        storage: &mut MmapStorage,
        op: &mut AtomicOperation,
        path: &[i64],
        key_index: i32,
        key_to_insert: &K,
    ) -> Result<SearchResult> {
        let page_index = *path
            .last()
            .ok_or_else(|| eyre!("split of tree '{}' with an empty path", self.name))?;

        let (split_leaf, index_to_split, separation_key, right_entries) = {
            let bucket = self.bucket(&*storage, page_index)?;
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

        if page_index != ROOT_PAGE {
            self.split_non_root(
                storage,
                op,
                path,
                page_index,
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
        path: &[i64],
        page_index: i64,
        split_leaf: bool,
        index_to_split: usize,
        separation_key: K,
        right_entries: Vec<Vec<u8>>,
        key_index: i32,
        key_to_insert: &K,
    ) -> Result<SearchResult> {
        let right_page = storage.add_page()? as i64;

        {
            let mut right = self.bucket_mut(storage, op, right_page)?;
            right.format(split_leaf);
            right.add_all(&right_entries)?;
        }
        {
            let mut bucket = self.bucket_mut(storage, op, page_index)?;
            bucket.shrink(index_to_split)?;
        }

        if split_leaf {
            let old_right_sibling = self.bucket(&*storage, page_index)?.right_sibling();

            {
                let mut right = self.bucket_mut(storage, op, right_page)?;
                right.set_right_sibling(old_right_sibling);
                right.set_left_sibling(page_index);
            }
            {
                let mut bucket = self.bucket_mut(storage, op, page_index)?;
                bucket.set_right_sibling(right_page);
            }
            if old_right_sibling >= 0 {
                let mut sibling = self.bucket_mut(storage, op, old_right_sibling)?;
                sibling.set_left_sibling(right_page);
            }
        }

        let parent_sub = &path[..path.len() - 1];
        let mut parent_page = *parent_sub
            .last()
            .ok_or_else(|| eyre!("non-root bucket with a root-length path in '{}'", self.name))?;

        let encoded_separation = self.encode_key(&separation_key);
        let parent_entry = SbEntry::<K, V> {
            left_child: page_index,
            right_child: right_page,
            key: separation_key.clone(),
            value: None,
        };

        let mut insertion_index = {
            let parent = self.bucket(&*storage, parent_page)?;
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
                let mut parent = self.bucket_mut(storage, op, parent_page)?;
                parent.add_entry(
                    insertion_index as usize,
                    &parent_entry,
                    true,
                    &encoded_separation,
                )?
            };
            if added {
                break;
            }

            let result =
                self.split_bucket(storage, op, parent_sub, insertion_index, &separation_key)?;
            parent_page = result.last();
            insertion_index = result.item_index;
        }

        let mut result_path: Path = SmallVec::from_slice(parent_sub);
        if key_to_insert < &separation_key {
            result_path.push(page_index);
            return Ok(SearchResult {
                item_index: key_index,
                path: result_path,
            });
        }

        result_path.push(right_page);
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
            let bucket = self.bucket(&*storage, ROOT_PAGE)?;
            let mut left_entries = Vec::with_capacity(index_to_split);
            for i in 0..index_to_split {
                left_entries.push(bucket.raw_entry_at(i)?);
            }
            (bucket.tree_size(), left_entries)
        };

        let left_page = storage.add_page()? as i64;
        let right_page = storage.add_page()? as i64;

        {
            let mut left = self.bucket_mut(storage, op, left_page)?;
            left.format(split_leaf);
            left.add_all(&left_entries)?;
            if split_leaf {
                left.set_right_sibling(right_page);
            }
        }
        {
            let mut right = self.bucket_mut(storage, op, right_page)?;
            right.format(split_leaf);
            right.add_all(&right_entries)?;
            if split_leaf {
                right.set_left_sibling(left_page);
            }
        }

        let encoded_separation = self.encode_key(&separation_key);
        {
            let mut root = self.bucket_mut(storage, op, ROOT_PAGE)?;
            root.format(false);
            root.set_tree_size(tree_size);
            let added = root.add_entry(
                0,
                &SbEntry::<K, V> {
                    left_child: left_page,
                    right_child: right_page,
                    key: separation_key.clone(),
                    value: None,
                },
                true,
                &encoded_separation,
            )?;
            ensure!(
                added,
                "separation key does not fit a fresh root bucket (tree '{}')",
                self.name
            );
        }

        let mut result_path: Path = SmallVec::new();
        result_path.push(ROOT_PAGE);

        if key_to_insert < &separation_key {
            result_path.push(left_page);
            return Ok(SearchResult {
                item_index: key_index,
                path: result_path,
            });
        }

        result_path.push(right_page);
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
        mut visitor: impl FnMut(SbEntry<K, V>) -> bool,
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

        let mut page_index = search.last();
        let mut first_bucket = true;

        while page_index >= 0 {
            let bucket = self.bucket(&storage, page_index)?;
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

            page_index = bucket.left_sibling();
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
        mut visitor: impl FnMut(SbEntry<K, V>) -> bool,
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

        let mut page_index = search.last();

        while page_index >= 0 {
            let bucket = self.bucket(&storage, page_index)?;
            let count = bucket.size() as i32;

            let mut i = index;
            while i < count {
                if !visitor(bucket.entry_at(i as usize)?) {
                    return Ok(());
                }
                i += 1;
            }

            page_index = bucket.right_sibling();
            index = 0;
        }
        Ok(())
    }

    /// Visits entries in `[key_from, key_to]` (bounds per the inclusive
    /// flags) in ascending order.
    pub fn load_entries_between(
        &self,
        key_from: &K,
        from_inclusive: bool,
        key_to: &K,
        to_inclusive: bool,
        mut visitor: impl FnMut(SbEntry<K, V>) -> bool,
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
        let end_page = to.last();
        let end_item = if to.item_index >= 0 {
            if to_inclusive {
                to.item_index
            } else {
                to.item_index - 1
            }
        } else {
            -to.item_index - 2
        };

        let mut page_index = from.last();
        loop {
            let bucket = self.bucket(&storage, page_index)?;
            let end_index = if page_index == end_page {
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

            if page_index == end_page {
                break;
            }
            page_index = bucket.right_sibling();
            if page_index < 0 {
                break;
            }
            start_index = 0;
        }
        Ok(())
    }

    /// Collects up to `max_values` values with keys below (or at) `key`.
    /// A negative cap collects everything.
    pub fn values_minor(
        &self,
        key: &K,
        inclusive: bool,
        max_values: i32,
    ) -> Result<Vec<SbValue<V>>> {
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
    pub fn values_major(
        &self,
        key: &K,
        inclusive: bool,
        max_values: i32,
    ) -> Result<Vec<SbValue<V>>> {
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
    ) -> Result<Vec<SbValue<V>>> {
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

    pub fn first_key(&self) -> Result<Option<K>> {
        let _fence = self.atomics.acquire_read_fence();
        let _lock = self.locks.shared(self.file_id);
        let storage = self.storage.read();

        let mut stack: Vec<(i64, i32)> = Vec::new();
        let mut page_index = ROOT_PAGE;
        let mut item_index: i32 = 0;

        loop {
            let bucket = self.bucket(&storage, page_index)?;

            if bucket.is_leaf() {
                if !bucket.is_empty() {
                    return Ok(Some(bucket.key_at(0)?));
                }
                match stack.pop() {
                    Some((parent, index)) => {
                        page_index = parent;
                        item_index = index + 1;
                    }
                    None => return Ok(None),
                }
            } else if bucket.is_empty() || item_index > bucket.size() as i32 {
                match stack.pop() {
                    Some((parent, index)) => {
                        page_index = parent;
                        item_index = index + 1;
                    }
                    None => return Ok(None),
                }
            } else {
                stack.push((page_index, item_index));
                page_index = if item_index < bucket.size() as i32 {
                    bucket.entry_at(item_index as usize)?.left_child
                } else {
                    bucket.entry_at(item_index as usize - 1)?.right_child
                };
                item_index = 0;
            }
        }
    }

    pub fn last_key(&self) -> Result<Option<K>> {
        let _fence = self.atomics.acquire_read_fence();
        let _lock = self.locks.shared(self.file_id);
        let storage = self.storage.read();

        let mut stack: Vec<(i64, i32)> = Vec::new();
        let mut page_index = ROOT_PAGE;
        let mut item_index: i32 = 0;
        let mut pending_last = true;

        loop {
            let bucket = self.bucket(&storage, page_index)?;
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
                        page_index = parent;
                        item_index = index - 1;
                    }
                    None => return Ok(None),
                }
            } else if item_index < -1 {
                match stack.pop() {
                    Some((parent, index)) => {
                        page_index = parent;
                        item_index = index - 1;
                    }
                    None => return Ok(None),
                }
            } else {
                stack.push((page_index, item_index));
                page_index = if item_index > -1 {
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

    /// Removes every entry by reinitializing the root as an empty leaf.
    /// Pages of the old tree stay in the file unused.
    pub fn clear(&self) -> Result<()> {
        self.run_mutation(true, |tree, storage, op| {
            let mut root = tree.bucket_mut(storage, op, ROOT_PAGE)?;
            root.shrink(0)?;
            root.format(true);
            root.set_tree_size(0);
            Ok(())
        })
        .wrap_err_with(|| format!("clear of sbtree '{}' failed", self.name))
    }

    /// Deletes the tree and its backing file. Consumes the tree; the file
    /// is gone when this returns.
    pub fn delete(self) -> Result<()> {
        let _lock = self.locks.exclusive(self.file_id);
        drop(self.storage);

        match std::fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => {
                Err(e).wrap_err_with(|| format!("failed to delete sbtree file of '{}'", self.name))
            }
        }
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

    /// Number of pages in the backing file.
    pub fn page_count(&self) -> Result<u32> {
        let _fence = self.atomics.acquire_read_fence();
        let _lock = self.locks.shared(self.file_id);
        Ok(self.storage.read().page_count())
    }

    /// Walks the whole tree, verifying structural invariants: strictly
    /// ascending keys, child-pointer agreement between consecutive internal
    /// entries, a symmetric leaf sibling chain and `tree_size` matching the
    /// reachable entry count.
    pub fn check_consistency(&self) -> Result<()> {
        let _fence = self.atomics.acquire_read_fence();
        let _lock = self.locks.shared(self.file_id);
        let storage = self.storage.read();

        let summary = self.verify_subtree(&storage, ROOT_PAGE)?;

        let root = self.bucket(&storage, ROOT_PAGE)?;
        ensure!(
            root.tree_size() == summary.entry_count,
            "tree_size {} does not match the {} reachable entries in '{}'",
            root.tree_size(),
            summary.entry_count,
            self.name
        );

        self.verify_leaf_chain(&storage, summary.leftmost_leaf)?;
        Ok(())
    }

    fn verify_subtree(&self, storage: &MmapStorage, page_index: i64) -> Result<SubtreeSummary<K>> {
        let bucket = self.bucket(storage, page_index)?;

        let count = bucket.size();
        let mut previous: Option<K> = None;
        for i in 0..count {
            let key = bucket.key_at(i)?;
            if let Some(prev) = &previous {
                ensure!(
                    *prev < key,
                    "keys out of order at slot {} of page {} in '{}'",
                    i,
                    page_index,
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
                leftmost_leaf: page_index,
            });
        }

        ensure!(
            count > 0,
            "empty internal bucket at page {} in '{}'",
            page_index,
            self.name
        );

        let mut entry_count = 0i64;
        let mut leftmost_leaf = NULL_PAGE;

        for i in 0..count {
            let entry = bucket.entry_at(i)?;
            if i + 1 < count {
                let next = bucket.entry_at(i + 1)?;
                ensure!(
                    entry.right_child == next.left_child,
                    "adjacent entries {} and {} of page {} disagree on their shared child",
                    i,
                    i + 1,
                    page_index
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

    fn verify_leaf_chain(&self, storage: &MmapStorage, leftmost: i64) -> Result<()> {
        let mut page_index = leftmost;
        let mut previous = NULL_PAGE;
        let mut last_key: Option<K> = None;

        while page_index >= 0 {
            let bucket = self.bucket(storage, page_index)?;
            ensure!(
                bucket.is_leaf(),
                "sibling chain of '{}' reached internal page {}",
                self.name,
                page_index
            );
            ensure!(
                bucket.left_sibling() == previous,
                "leaf page {} does not point back at its left sibling in '{}'",
                page_index,
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

            previous = page_index;
            page_index = bucket.right_sibling();
        }
        Ok(())
    }

    // -----------------------------------------------------------------
    // recovery entry points
    // -----------------------------------------------------------------

    /// Re-applies a logged put under an existing atomic operation. Records
    /// no new component operation.
    pub fn rollback_put(
        &self,
        raw_key: &[u8],
        raw_value: &[u8],
        op: &mut AtomicOperation,
    ) -> Result<()> {
        ensure!(
            self.codec.is_none(),
            "recovery of encrypted keys must decode through the codec owner"
        );
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
        ensure!(
            self.codec.is_none(),
            "recovery of encrypted keys must decode through the codec owner"
        );
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
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn new_tree(dir: &tempfile::TempDir) -> SbTree<i32, i64> {
        SbTree::create(
            dir.path().join("index.arb"),
            "index",
            None,
            Arc::new(FileLockManager::new()),
            Arc::new(AtomicOperationsManager::new()),
        )
        .unwrap()
    }

    #[test]
    fn fresh_tree_is_empty() {
        let dir = tempdir().unwrap();
        let tree = new_tree(&dir);

        assert_eq!(tree.size().unwrap(), 0);
        assert!(tree.get(&1).unwrap().is_none());
        assert!(tree.first_key().unwrap().is_none());
        assert!(tree.last_key().unwrap().is_none());
    }

    #[test]
    fn put_get_remove_round_trip() {
        let dir = tempdir().unwrap();
        let tree = new_tree(&dir);

        assert!(tree.put(&2, &20).unwrap());
        assert!(tree.put(&1, &10).unwrap());

        assert_eq!(tree.get(&1).unwrap(), Some(SbValue::Inline(10)));
        assert_eq!(tree.remove(&1).unwrap(), Some(SbValue::Inline(10)));
        assert!(tree.get(&1).unwrap().is_none());
        assert_eq!(tree.size().unwrap(), 1);
    }

    #[test]
    fn put_link_round_trips() {
        let dir = tempdir().unwrap();
        let tree = new_tree(&dir);

        tree.put(&1, &10).unwrap();
        assert!(!tree.put_link(&1, 555).unwrap());

        assert_eq!(tree.get(&1).unwrap(), Some(SbValue::Link(555)));
        assert_eq!(tree.size().unwrap(), 1);
    }

    #[test]
    fn values_free_list_head_is_persisted() {
        let dir = tempdir().unwrap();
        let tree = new_tree(&dir);

        assert_eq!(tree.values_free_list_first().unwrap(), NULL_PAGE);
        tree.set_values_free_list_first(17).unwrap();
        assert_eq!(tree.values_free_list_first().unwrap(), 17);
    }

    #[test]
    fn delete_removes_the_backing_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("index.arb");
        let tree = SbTree::<i32, i64>::create(
            &path,
            "index",
            None,
            Arc::new(FileLockManager::new()),
            Arc::new(AtomicOperationsManager::new()),
        )
        .unwrap();

        tree.put(&1, &1).unwrap();
        tree.delete().unwrap();

        assert!(!path.exists());
    }
}
