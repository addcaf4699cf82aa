//! # Memory-Mapped Paged File
//!
//! `MmapStorage` is the paged file underneath every Arbor index: a flat
//! sequence of 16KB pages, mapped into the address space in one piece.
//!
//! ## Why a Mapping Instead of a Buffer Pool
//!
//! A buffer pool copies pages out of the kernel and pins frames so a
//! caller's page cannot be evicted under it. Mapping the file removes the
//! copy, and the pin protocol collapses into ordinary borrows:
//!
//! - `page()` hands out `&[u8]` — any number of concurrent readers
//! - `page_mut()` hands out `&mut [u8]` — exclusive, like a write pin
//! - `grow()` needs `&mut self`, so the compiler proves no page slice
//!   survives the remap
//!
//! There is nothing to release and nothing to leak on an error path; the
//! borrow ends where the slice goes out of scope.
//!
//! ## File Format
//!
//! Pages are stored back to back, page 0 first. For the bonsai variant
//! page 0 opens with the system bucket; for the standard variant it is the
//! root bucket. The file length is always `page_count * PAGE_SIZE`; a file
//! that is not a whole number of pages was torn mid-extension and is
//! rejected at open.
//!
//! Growth appends zeroed pages (`set_len` extends with zeros), and both
//! bucket layouts depend on that: an all-zero region reads back as an
//! uninitialized bucket.
//!
//! ## Aliasing Contract
//!
//! Mapping a file mutably is only sound while this process is the file's
//! sole writer. Arbor guarantees that one level up: every index file is
//! owned by the tree that opened it, and the partitioned file-lock manager
//! serializes all access to it. `MmapStorage` itself only adds the bounds
//! checks that keep every page slice inside the mapped length.
//!
//! ## Durability
//!
//! `sync()` flushes the mapping to disk. Deciding *when* to flush belongs
//! to the atomic-operation layer; this type only knows how.

use std::fs::{File, OpenOptions};
use std::ops::Range;
use std::path::Path;

use eyre::{bail, ensure, Result, WrapErr};
use memmap2::MmapMut;

use super::PAGE_SIZE;

#[derive(Debug)]
pub struct MmapStorage {
    file: File,
    map: MmapMut,
    page_count: u32,
}

impl MmapStorage {
    /// Creates a fresh index file of `initial_page_count` zeroed pages.
    /// An existing file at the path is truncated.
    pub fn create<P: AsRef<Path>>(path: P, initial_page_count: u32) -> Result<Self> {
        let path = path.as_ref();
        ensure!(
            initial_page_count > 0,
            "an index file needs at least one page"
        );

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)
            .wrap_err_with(|| format!("cannot create index file '{}'", path.display()))?;

        file.set_len(initial_page_count as u64 * PAGE_SIZE as u64)
            .wrap_err_with(|| {
                format!(
                    "cannot reserve {} pages in '{}'",
                    initial_page_count,
                    path.display()
                )
            })?;

        Self::from_file(file, path, initial_page_count)
    }

    /// Opens an existing index file, deriving the page count from its
    /// length.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .wrap_err_with(|| format!("cannot open index file '{}'", path.display()))?;

        let length = file
            .metadata()
            .wrap_err_with(|| format!("cannot stat index file '{}'", path.display()))?
            .len();

        let page_count = Self::whole_pages(length, path)?;
        Self::from_file(file, path, page_count)
    }

    fn whole_pages(length: u64, path: &Path) -> Result<u32> {
        if length == 0 || length % PAGE_SIZE as u64 != 0 {
            bail!(
                "index file '{}' is torn: {} bytes is not a whole number of {} byte pages",
                path.display(),
                length,
                PAGE_SIZE
            );
        }
        Ok((length / PAGE_SIZE as u64) as u32)
    }

    fn from_file(file: File, path: &Path, page_count: u32) -> Result<Self> {
        // SAFETY: a mutable mapping is undefined behavior if something else
        // writes the file underneath it. The aliasing contract (module docs)
        // rules that out: the opening tree owns the file and the file-lock
        // manager serializes every access to it within this process. The
        // mapping never outlives `self`, and page()/page_mut() keep all
        // slices inside the mapped length via span().
        let map = unsafe {
            MmapMut::map_mut(&file)
                .wrap_err_with(|| format!("cannot map index file '{}'", path.display()))?
        };

        Ok(Self {
            file,
            map,
            page_count,
        })
    }

    fn span(&self, page_no: u32) -> Result<Range<usize>> {
        ensure!(
            page_no < self.page_count,
            "page {} is past the end of the index file ({} pages)",
            page_no,
            self.page_count
        );
        let start = page_no as usize * PAGE_SIZE;
        Ok(start..start + PAGE_SIZE)
    }

    pub fn page(&self, page_no: u32) -> Result<&[u8]> {
        let span = self.span(page_no)?;
        Ok(&self.map[span])
    }

    pub fn page_mut(&mut self, page_no: u32) -> Result<&mut [u8]> {
        let span = self.span(page_no)?;
        Ok(&mut self.map[span])
    }

    /// Extends the file to `new_page_count` pages and remaps. Shrinking is
    /// never requested, so a smaller count is a no-op.
    pub fn grow(&mut self, new_page_count: u32) -> Result<()> {
        if new_page_count <= self.page_count {
            return Ok(());
        }

        self.map
            .flush()
            .wrap_err("flush before remap failed")?;
        self.file
            .set_len(new_page_count as u64 * PAGE_SIZE as u64)
            .wrap_err_with(|| format!("cannot extend index file to {} pages", new_page_count))?;

        // SAFETY: same aliasing contract as from_file(). The old mapping is
        // replaced, not kept: `&mut self` means no page slice can still
        // point into it, and the file already has its new length.
        self.map = unsafe {
            MmapMut::map_mut(&self.file).wrap_err("cannot remap index file after growth")?
        };
        self.page_count = new_page_count;

        Ok(())
    }

    pub fn sync(&self) -> Result<()> {
        self.map.flush().wrap_err("index file sync failed")
    }

    pub fn page_count(&self) -> u32 {
        self.page_count
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::Storage;
    use tempfile::tempdir;

    #[test]
    fn create_reserves_the_requested_pages() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("t.arb");
        let storage = MmapStorage::create(&path, 3).unwrap();

        assert_eq!(storage.page_count(), 3);
        assert_eq!(
            std::fs::metadata(&path).unwrap().len(),
            3 * PAGE_SIZE as u64
        );
    }

    #[test]
    fn create_rejects_zero_pages() {
        let dir = tempdir().unwrap();
        let result = MmapStorage::create(dir.path().join("t.arb"), 0);

        assert!(result.is_err());
    }

    #[test]
    fn new_pages_are_zero_filled() {
        let dir = tempdir().unwrap();
        let mut storage = MmapStorage::create(dir.path().join("t.arb"), 1).unwrap();

        let page_no = storage.add_page().unwrap();

        assert_eq!(page_no, 1);
        assert!(storage.page(1).unwrap().iter().all(|&b| b == 0));
    }

    #[test]
    fn page_past_the_end_is_an_error() {
        let dir = tempdir().unwrap();
        let storage = MmapStorage::create(dir.path().join("t.arb"), 2).unwrap();

        let result = storage.page(2);

        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("past the end"));
    }

    #[test]
    fn writes_survive_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("t.arb");

        {
            let mut storage = MmapStorage::create(&path, 2).unwrap();
            storage.page_mut(1).unwrap()[100] = 0xAB;
            storage.sync().unwrap();
        }

        let storage = MmapStorage::open(&path).unwrap();
        assert_eq!(storage.page_count(), 2);
        assert_eq!(storage.page(1).unwrap()[100], 0xAB);
    }

    #[test]
    fn open_rejects_a_torn_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("t.arb");
        std::fs::write(&path, vec![0u8; PAGE_SIZE + 7]).unwrap();

        let result = MmapStorage::open(&path);

        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("torn"));
    }

    #[test]
    fn open_rejects_an_empty_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("t.arb");
        std::fs::write(&path, b"").unwrap();

        assert!(MmapStorage::open(&path).is_err());
    }

    #[test]
    fn grow_preserves_existing_data() {
        let dir = tempdir().unwrap();
        let mut storage = MmapStorage::create(dir.path().join("t.arb"), 1).unwrap();
        storage.page_mut(0).unwrap()[0] = 0x5A;

        storage.grow(4).unwrap();

        assert_eq!(storage.page_count(), 4);
        assert_eq!(storage.page(0).unwrap()[0], 0x5A);
    }

    #[test]
    fn grow_to_a_smaller_count_is_a_no_op() {
        let dir = tempdir().unwrap();
        let mut storage = MmapStorage::create(dir.path().join("t.arb"), 3).unwrap();

        storage.grow(1).unwrap();

        assert_eq!(storage.page_count(), 3);
    }
}
