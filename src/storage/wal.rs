//! # Write-Ahead Log Records
//!
//! Every bucket mutation in Arbor produces a typed *page operation* carrying
//! the previous value(s) the mutation overwrote, and every tree-level entry
//! point produces one *component operation* describing the logical change.
//! Atomic operations accumulate both; commit appends them to the log in
//! mutation order.
//!
//! The two record granularities serve different halves of recovery:
//!
//! - **Page operations** hold before-images. Undo walks them in reverse and
//!   restores the exact bytes each mutation clobbered — including bytes in
//!   the free area of a region, so a rolled-back page is bit-identical to
//!   its pre-operation image.
//! - **Component operations** (`Create`, `Put`, `Remove`) hold raw key and
//!   value bytes, enough to re-apply the logical change from scratch when
//!   replaying the log forward.
//!
//! ## Frame Format
//!
//! Each record is one frame: a fixed header followed by the record payload.
//!
//! ```text
//! +----------------------+----------------------+
//! | Frame Header (24B)   | Payload (variable)   |
//! +----------------------+----------------------+
//! ```
//!
//! The header carries the payload length, a record-kind byte, the owning
//! atomic-operation id and a CRC-64 checksum over kind, operation id and
//! payload. A frame with an invalid checksum marks the end of the usable
//! log (a torn final write, normal after a crash).
//!
//! ## Write Protocol
//!
//! 1. Serialize the record payload
//! 2. Compute the checksum
//! 3. Append header + payload with a single writer
//! 4. `sync()` once per atomic operation, after its last frame
//!
//! ## Thread Safety
//!
//! `WalWriter` is exclusive-access; the atomic-operations manager wraps it
//! in a `parking_lot::Mutex`.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

use crc::{Crc, CRC_64_ECMA_182};
use eyre::{bail, ensure, Result, WrapErr};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

pub const FRAME_HEADER_SIZE: usize = 24;

const CRC64: Crc<u64> = Crc::<u64>::new(&CRC_64_ECMA_182);

const RECORD_KIND_PAGE: u8 = 1;
const RECORD_KIND_COMPONENT: u8 = 2;

/// Which bucket layout a page operation targets. Undo needs this to find
/// the region inside the page and to interpret field offsets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BucketLayout {
    /// A bonsai tree bucket region of the given size.
    Bonsai { bucket_size: u32 },
    /// The bonsai system bucket at the head of the file.
    BonsaiSystem { bucket_size: u32 },
    /// A standard bucket occupying a whole page.
    Standard,
}

/// Identifies the bucket region a page operation mutated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageTarget {
    pub file_id: u64,
    pub page_index: u32,
    pub page_offset: u32,
    pub layout: BucketLayout,
}

/// One bucket mutation with the before-values needed to reverse it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PageOpKind {
    /// Bucket header (re)initialization; `prev_header` is the overwritten
    /// header prefix.
    Format { prev_header: Vec<u8> },
    AddEntry {
        index: u32,
        entry_size: u32,
        prev_free_bytes: Vec<u8>,
        prev_tail_slot: [u8; 4],
    },
    AddAll {
        count: u32,
        prev_free_pointer: i32,
        prev_size: i32,
        prev_positions: Vec<u8>,
        prev_entries: Vec<u8>,
    },
    Remove {
        index: u32,
        entry_position: u32,
        raw_entry: Vec<u8>,
    },
    Shrink {
        removed: Vec<Vec<u8>>,
        prev_free_pointer: i32,
        prev_size: i32,
        prev_positions: Vec<u8>,
        prev_entries: Vec<u8>,
    },
    UpdateValue {
        index: u32,
        /// Byte offset of the value inside the entry (key, and for the
        /// standard layout the link flag, precede it).
        value_offset: u32,
        prev_value: Vec<u8>,
    },
    /// Child-pointer rewrite inside an existing internal entry, emitted when
    /// an insert patches its neighbors to keep adjacent entries agreeing at
    /// the boundary.
    PatchChildPointer {
        index: u32,
        child_offset: u32,
        prev: Vec<u8>,
    },
    SetLeftSibling { prev: Vec<u8> },
    SetRightSibling { prev: Vec<u8> },
    SetTreeSize { prev: i64 },
    SetDeleted { prev_flags: u8 },
    SetFreeListPointer { prev: Vec<u8> },
    SetValuesFreeListFirstIndex { prev: i64 },
    SysFormat { prev_header: Vec<u8> },
    SetFreeListHead { prev: Vec<u8> },
    SetFreeListLength { prev: i32 },
    SetFreeSpacePointer { prev: Vec<u8> },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageOp {
    pub target: PageTarget,
    pub kind: PageOpKind,
}

/// A coarse, replayable tree-level operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ComponentOp {
    Create {
        file_id: u64,
        name: String,
        root_page: i64,
        root_offset: i32,
    },
    Put {
        file_id: u64,
        raw_key: Vec<u8>,
        raw_value: Vec<u8>,
        prev_raw_value: Option<Vec<u8>>,
    },
    Remove {
        file_id: u64,
        raw_key: Vec<u8>,
        raw_value: Vec<u8>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WalRecord {
    Page(PageOp),
    Component(ComponentOp),
}

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout)]
struct FrameHeader {
    payload_len: u32,
    kind: u8,
    _pad: [u8; 3],
    operation_id: u64,
    checksum: u64,
}

fn compute_checksum(kind: u8, operation_id: u64, payload: &[u8]) -> u64 {
    let mut digest = CRC64.digest();
    digest.update(&[kind]);
    digest.update(&operation_id.to_le_bytes());
    digest.update(payload);
    digest.finalize()
}

// ---------------------------------------------------------------------------
// payload codec
// ---------------------------------------------------------------------------

struct Enc(Vec<u8>);

impl Enc {
    fn new() -> Self {
        Self(Vec::new())
    }

    fn u8(&mut self, v: u8) {
        self.0.push(v);
    }

    fn u32(&mut self, v: u32) {
        self.0.extend_from_slice(&v.to_le_bytes());
    }

    fn i32(&mut self, v: i32) {
        self.0.extend_from_slice(&v.to_le_bytes());
    }

    fn u64(&mut self, v: u64) {
        self.0.extend_from_slice(&v.to_le_bytes());
    }

    fn i64(&mut self, v: i64) {
        self.0.extend_from_slice(&v.to_le_bytes());
    }

    fn bytes(&mut self, v: &[u8]) {
        self.u32(v.len() as u32);
        self.0.extend_from_slice(v);
    }

    fn byte_lists(&mut self, v: &[Vec<u8>]) {
        self.u32(v.len() as u32);
        for item in v {
            self.bytes(item);
        }
    }
}

struct Dec<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Dec<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        ensure!(
            self.pos + n <= self.buf.len(),
            "truncated WAL payload: need {} bytes at {}, have {}",
            n,
            self.pos,
            self.buf.len()
        );
        let slice = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    fn u32(&mut self) -> Result<u32> {
        Ok(u32::from_le_bytes(self.take(4)?.try_into().unwrap()))
    }

    fn i32(&mut self) -> Result<i32> {
        Ok(i32::from_le_bytes(self.take(4)?.try_into().unwrap()))
    }

    fn u64(&mut self) -> Result<u64> {
        Ok(u64::from_le_bytes(self.take(8)?.try_into().unwrap()))
    }

    fn i64(&mut self) -> Result<i64> {
        Ok(i64::from_le_bytes(self.take(8)?.try_into().unwrap()))
    }

    fn bytes(&mut self) -> Result<Vec<u8>> {
        let len = self.u32()? as usize;
        Ok(self.take(len)?.to_vec())
    }

    fn byte_lists(&mut self) -> Result<Vec<Vec<u8>>> {
        let count = self.u32()? as usize;
        let mut lists = Vec::with_capacity(count.min(1024));
        for _ in 0..count {
            lists.push(self.bytes()?);
        }
        Ok(lists)
    }

    fn finish(&self) -> Result<()> {
        ensure!(
            self.pos == self.buf.len(),
            "{} trailing bytes after WAL payload",
            self.buf.len() - self.pos
        );
        Ok(())
    }
}

const LAYOUT_BONSAI: u8 = 1;
const LAYOUT_BONSAI_SYSTEM: u8 = 2;
const LAYOUT_STANDARD: u8 = 3;

fn encode_target(enc: &mut Enc, target: &PageTarget) {
    enc.u64(target.file_id);
    enc.u32(target.page_index);
    enc.u32(target.page_offset);
    match target.layout {
        BucketLayout::Bonsai { bucket_size } => {
            enc.u8(LAYOUT_BONSAI);
            enc.u32(bucket_size);
        }
        BucketLayout::BonsaiSystem { bucket_size } => {
            enc.u8(LAYOUT_BONSAI_SYSTEM);
            enc.u32(bucket_size);
        }
        BucketLayout::Standard => enc.u8(LAYOUT_STANDARD),
    }
}

fn decode_target(dec: &mut Dec<'_>) -> Result<PageTarget> {
    let file_id = dec.u64()?;
    let page_index = dec.u32()?;
    let page_offset = dec.u32()?;
    let layout = match dec.u8()? {
        LAYOUT_BONSAI => BucketLayout::Bonsai {
            bucket_size: dec.u32()?,
        },
        LAYOUT_BONSAI_SYSTEM => BucketLayout::BonsaiSystem {
            bucket_size: dec.u32()?,
        },
        LAYOUT_STANDARD => BucketLayout::Standard,
        other => bail!("unknown bucket layout tag {} in WAL record", other),
    };
    Ok(PageTarget {
        file_id,
        page_index,
        page_offset,
        layout,
    })
}

const OP_FORMAT: u8 = 1;
const OP_ADD_ENTRY: u8 = 2;
const OP_ADD_ALL: u8 = 3;
const OP_REMOVE: u8 = 4;
const OP_SHRINK: u8 = 5;
const OP_UPDATE_VALUE: u8 = 6;
const OP_SET_LEFT_SIBLING: u8 = 7;
const OP_SET_RIGHT_SIBLING: u8 = 8;
const OP_SET_TREE_SIZE: u8 = 9;
const OP_SET_DELETED: u8 = 10;
const OP_SET_FREE_LIST_POINTER: u8 = 11;
const OP_SET_VALUES_FREE_LIST: u8 = 12;
const OP_SYS_FORMAT: u8 = 13;
const OP_SET_FREE_LIST_HEAD: u8 = 14;
const OP_SET_FREE_LIST_LENGTH: u8 = 15;
const OP_SET_FREE_SPACE_POINTER: u8 = 16;
const OP_PATCH_CHILD_POINTER: u8 = 17;

fn encode_page_op(op: &PageOp) -> Vec<u8> {
    let mut enc = Enc::new();
    encode_target(&mut enc, &op.target);

    match &op.kind {
        PageOpKind::Format { prev_header } => {
            enc.u8(OP_FORMAT);
            enc.bytes(prev_header);
        }
        PageOpKind::AddEntry {
            index,
            entry_size,
            prev_free_bytes,
            prev_tail_slot,
        } => {
            enc.u8(OP_ADD_ENTRY);
            enc.u32(*index);
            enc.u32(*entry_size);
            enc.bytes(prev_free_bytes);
            enc.0.extend_from_slice(prev_tail_slot);
        }
        PageOpKind::AddAll {
            count,
            prev_free_pointer,
            prev_size,
            prev_positions,
            prev_entries,
        } => {
            enc.u8(OP_ADD_ALL);
            enc.u32(*count);
            enc.i32(*prev_free_pointer);
            enc.i32(*prev_size);
            enc.bytes(prev_positions);
            enc.bytes(prev_entries);
        }
        PageOpKind::Remove {
            index,
            entry_position,
            raw_entry,
        } => {
            enc.u8(OP_REMOVE);
            enc.u32(*index);
            enc.u32(*entry_position);
            enc.bytes(raw_entry);
        }
        PageOpKind::Shrink {
            removed,
            prev_free_pointer,
            prev_size,
            prev_positions,
            prev_entries,
        } => {
            enc.u8(OP_SHRINK);
            enc.byte_lists(removed);
            enc.i32(*prev_free_pointer);
            enc.i32(*prev_size);
            enc.bytes(prev_positions);
            enc.bytes(prev_entries);
        }
        PageOpKind::UpdateValue {
            index,
            value_offset,
            prev_value,
        } => {
            enc.u8(OP_UPDATE_VALUE);
            enc.u32(*index);
            enc.u32(*value_offset);
            enc.bytes(prev_value);
        }
        PageOpKind::PatchChildPointer {
            index,
            child_offset,
            prev,
        } => {
            enc.u8(OP_PATCH_CHILD_POINTER);
            enc.u32(*index);
            enc.u32(*child_offset);
            enc.bytes(prev);
        }
        PageOpKind::SetLeftSibling { prev } => {
            enc.u8(OP_SET_LEFT_SIBLING);
            enc.bytes(prev);
        }
        PageOpKind::SetRightSibling { prev } => {
            enc.u8(OP_SET_RIGHT_SIBLING);
            enc.bytes(prev);
        }
        PageOpKind::SetTreeSize { prev } => {
            enc.u8(OP_SET_TREE_SIZE);
            enc.i64(*prev);
        }
        PageOpKind::SetDeleted { prev_flags } => {
            enc.u8(OP_SET_DELETED);
            enc.u8(*prev_flags);
        }
        PageOpKind::SetFreeListPointer { prev } => {
            enc.u8(OP_SET_FREE_LIST_POINTER);
            enc.bytes(prev);
        }
        PageOpKind::SetValuesFreeListFirstIndex { prev } => {
            enc.u8(OP_SET_VALUES_FREE_LIST);
            enc.i64(*prev);
        }
        PageOpKind::SysFormat { prev_header } => {
            enc.u8(OP_SYS_FORMAT);
            enc.bytes(prev_header);
        }
        PageOpKind::SetFreeListHead { prev } => {
            enc.u8(OP_SET_FREE_LIST_HEAD);
            enc.bytes(prev);
        }
        PageOpKind::SetFreeListLength { prev } => {
            enc.u8(OP_SET_FREE_LIST_LENGTH);
            enc.i32(*prev);
        }
        PageOpKind::SetFreeSpacePointer { prev } => {
            enc.u8(OP_SET_FREE_SPACE_POINTER);
            enc.bytes(prev);
        }
    }

    enc.0
}

fn decode_page_op(payload: &[u8]) -> Result<PageOp> {
    let mut dec = Dec::new(payload);
    let target = decode_target(&mut dec)?;

    let kind = match dec.u8()? {
        OP_FORMAT => PageOpKind::Format {
            prev_header: dec.bytes()?,
        },
        OP_ADD_ENTRY => {
            let index = dec.u32()?;
            let entry_size = dec.u32()?;
            let prev_free_bytes = dec.bytes()?;
            let prev_tail_slot: [u8; 4] = dec.take(4)?.try_into().unwrap();
            PageOpKind::AddEntry {
                index,
                entry_size,
                prev_free_bytes,
                prev_tail_slot,
            }
        }
        OP_ADD_ALL => PageOpKind::AddAll {
            count: dec.u32()?,
            prev_free_pointer: dec.i32()?,
            prev_size: dec.i32()?,
            prev_positions: dec.bytes()?,
            prev_entries: dec.bytes()?,
        },
        OP_REMOVE => PageOpKind::Remove {
            index: dec.u32()?,
            entry_position: dec.u32()?,
            raw_entry: dec.bytes()?,
        },
        OP_SHRINK => PageOpKind::Shrink {
            removed: dec.byte_lists()?,
            prev_free_pointer: dec.i32()?,
            prev_size: dec.i32()?,
            prev_positions: dec.bytes()?,
            prev_entries: dec.bytes()?,
        },
        OP_UPDATE_VALUE => PageOpKind::UpdateValue {
            index: dec.u32()?,
            value_offset: dec.u32()?,
            prev_value: dec.bytes()?,
        },
        OP_PATCH_CHILD_POINTER => PageOpKind::PatchChildPointer {
            index: dec.u32()?,
            child_offset: dec.u32()?,
            prev: dec.bytes()?,
        },
        OP_SET_LEFT_SIBLING => PageOpKind::SetLeftSibling { prev: dec.bytes()? },
        OP_SET_RIGHT_SIBLING => PageOpKind::SetRightSibling { prev: dec.bytes()? },
        OP_SET_TREE_SIZE => PageOpKind::SetTreeSize { prev: dec.i64()? },
        OP_SET_DELETED => PageOpKind::SetDeleted {
            prev_flags: dec.u8()?,
        },
        OP_SET_FREE_LIST_POINTER => PageOpKind::SetFreeListPointer { prev: dec.bytes()? },
        OP_SET_VALUES_FREE_LIST => PageOpKind::SetValuesFreeListFirstIndex { prev: dec.i64()? },
        OP_SYS_FORMAT => PageOpKind::SysFormat {
            prev_header: dec.bytes()?,
        },
        OP_SET_FREE_LIST_HEAD => PageOpKind::SetFreeListHead { prev: dec.bytes()? },
        OP_SET_FREE_LIST_LENGTH => PageOpKind::SetFreeListLength { prev: dec.i32()? },
        OP_SET_FREE_SPACE_POINTER => PageOpKind::SetFreeSpacePointer { prev: dec.bytes()? },
        other => bail!("unknown page operation tag {} in WAL record", other),
    };

    dec.finish()?;
    Ok(PageOp { target, kind })
}

const COMPONENT_CREATE: u8 = 1;
const COMPONENT_PUT: u8 = 2;
const COMPONENT_REMOVE: u8 = 3;

fn encode_component_op(op: &ComponentOp) -> Vec<u8> {
    let mut enc = Enc::new();
    match op {
        ComponentOp::Create {
            file_id,
            name,
            root_page,
            root_offset,
        } => {
            enc.u8(COMPONENT_CREATE);
            enc.u64(*file_id);
            enc.bytes(name.as_bytes());
            enc.i64(*root_page);
            enc.i32(*root_offset);
        }
        ComponentOp::Put {
            file_id,
            raw_key,
            raw_value,
            prev_raw_value,
        } => {
            enc.u8(COMPONENT_PUT);
            enc.u64(*file_id);
            enc.bytes(raw_key);
            enc.bytes(raw_value);
            match prev_raw_value {
                Some(prev) => {
                    enc.u8(1);
                    enc.bytes(prev);
                }
                None => enc.u8(0),
            }
        }
        ComponentOp::Remove {
            file_id,
            raw_key,
            raw_value,
        } => {
            enc.u8(COMPONENT_REMOVE);
            enc.u64(*file_id);
            enc.bytes(raw_key);
            enc.bytes(raw_value);
        }
    }
    enc.0
}

fn decode_component_op(payload: &[u8]) -> Result<ComponentOp> {
    let mut dec = Dec::new(payload);
    let op = match dec.u8()? {
        COMPONENT_CREATE => {
            let file_id = dec.u64()?;
            let name_bytes = dec.bytes()?;
            let name = String::from_utf8(name_bytes)
                .map_err(|e| eyre::eyre!("invalid utf-8 in component name: {}", e))?;
            ComponentOp::Create {
                file_id,
                name,
                root_page: dec.i64()?,
                root_offset: dec.i32()?,
            }
        }
        COMPONENT_PUT => {
            let file_id = dec.u64()?;
            let raw_key = dec.bytes()?;
            let raw_value = dec.bytes()?;
            let prev_raw_value = match dec.u8()? {
                0 => None,
                1 => Some(dec.bytes()?),
                other => bail!("invalid previous-value marker {} in Put record", other),
            };
            ComponentOp::Put {
                file_id,
                raw_key,
                raw_value,
                prev_raw_value,
            }
        }
        COMPONENT_REMOVE => ComponentOp::Remove {
            file_id: dec.u64()?,
            raw_key: dec.bytes()?,
            raw_value: dec.bytes()?,
        },
        other => bail!("unknown component operation tag {} in WAL record", other),
    };
    dec.finish()?;
    Ok(op)
}

// ---------------------------------------------------------------------------
// writer / reader
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub struct WalWriter {
    file: File,
    offset: u64,
}

impl WalWriter {
    pub fn create<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(path)
            .wrap_err_with(|| format!("failed to create WAL at '{}'", path.display()))?;

        Ok(Self { file, offset: 0 })
    }

    pub fn append(&mut self, operation_id: u64, record: &WalRecord) -> Result<()> {
        let (kind, payload) = match record {
            WalRecord::Page(op) => (RECORD_KIND_PAGE, encode_page_op(op)),
            WalRecord::Component(op) => (RECORD_KIND_COMPONENT, encode_component_op(op)),
        };

        let header = FrameHeader {
            payload_len: payload.len() as u32,
            kind,
            _pad: [0; 3],
            operation_id,
            checksum: compute_checksum(kind, operation_id, &payload),
        };

        self.file
            .write_all(header.as_bytes())
            .wrap_err("failed to write WAL frame header")?;
        self.file
            .write_all(&payload)
            .wrap_err("failed to write WAL frame payload")?;

        self.offset += (FRAME_HEADER_SIZE + payload.len()) as u64;
        Ok(())
    }

    pub fn sync(&mut self) -> Result<()> {
        self.file.sync_all().wrap_err("failed to sync WAL to disk")
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }
}

pub struct WalReader {
    file: File,
}

impl WalReader {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let mut file = File::open(path)
            .wrap_err_with(|| format!("failed to open WAL at '{}'", path.display()))?;
        file.seek(SeekFrom::Start(0))
            .wrap_err("failed to seek to start of WAL")?;

        Ok(Self { file })
    }

    /// Reads the next frame. Returns `None` at a clean end of log; a frame
    /// with a bad checksum also ends the log (torn final write).
    pub fn next_record(&mut self) -> Result<Option<(u64, WalRecord)>> {
        let mut header_bytes = [0u8; FRAME_HEADER_SIZE];
        match self.file.read_exact(&mut header_bytes) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(e).wrap_err("failed to read WAL frame header"),
        }

        let header = FrameHeader::read_from_bytes(&header_bytes)
            .map_err(|e| eyre::eyre!("invalid WAL frame header: {:?}", e))?;

        let mut payload = vec![0u8; header.payload_len as usize];
        match self.file.read_exact(&mut payload) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(e).wrap_err("failed to read WAL frame payload"),
        }

        if compute_checksum(header.kind, header.operation_id, &payload) != header.checksum {
            return Ok(None);
        }

        let record = match header.kind {
            RECORD_KIND_PAGE => WalRecord::Page(decode_page_op(&payload)?),
            RECORD_KIND_COMPONENT => WalRecord::Component(decode_component_op(&payload)?),
            other => bail!("unknown WAL record kind {}", other),
        };

        Ok(Some((header.operation_id, record)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn sample_target() -> PageTarget {
        PageTarget {
            file_id: 7,
            page_index: 3,
            page_offset: 8192,
            layout: BucketLayout::Bonsai { bucket_size: 8192 },
        }
    }

    #[test]
    fn frame_header_size_is_24_bytes() {
        assert_eq!(size_of::<FrameHeader>(), FRAME_HEADER_SIZE);
    }

    #[test]
    fn page_op_round_trip() {
        let op = PageOp {
            target: sample_target(),
            kind: PageOpKind::Remove {
                index: 4,
                entry_position: 8000,
                raw_entry: vec![1, 2, 3, 4, 5],
            },
        };

        let decoded = decode_page_op(&encode_page_op(&op)).unwrap();

        assert_eq!(decoded, op);
    }

    #[test]
    fn shrink_op_round_trip() {
        let op = PageOp {
            target: sample_target(),
            kind: PageOpKind::Shrink {
                removed: vec![vec![9; 16], vec![8; 16]],
                prev_free_pointer: 4096,
                prev_size: 12,
                prev_positions: vec![0; 48],
                prev_entries: vec![0xAA; 128],
            },
        };

        let decoded = decode_page_op(&encode_page_op(&op)).unwrap();

        assert_eq!(decoded, op);
    }

    #[test]
    fn component_put_round_trip() {
        let op = ComponentOp::Put {
            file_id: 1,
            raw_key: vec![1, 0, 0, 0],
            raw_value: vec![2; 8],
            prev_raw_value: Some(vec![3; 8]),
        };

        let decoded = decode_component_op(&encode_component_op(&op)).unwrap();

        assert_eq!(decoded, op);
    }

    #[test]
    fn decode_rejects_trailing_bytes() {
        let op = ComponentOp::Remove {
            file_id: 1,
            raw_key: vec![1],
            raw_value: vec![2],
        };
        let mut payload = encode_component_op(&op);
        payload.push(0);

        assert!(decode_component_op(&payload).is_err());
    }

    #[test]
    fn writer_reader_round_trip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("arbor.wal");

        let records = vec![
            WalRecord::Page(PageOp {
                target: sample_target(),
                kind: PageOpKind::SetTreeSize { prev: 41 },
            }),
            WalRecord::Component(ComponentOp::Create {
                file_id: 7,
                name: "ridbag".to_owned(),
                root_page: 0,
                root_offset: 8192,
            }),
        ];

        {
            let mut writer = WalWriter::create(&path).unwrap();
            for record in &records {
                writer.append(12, record).unwrap();
            }
            writer.sync().unwrap();
        }

        let mut reader = WalReader::open(&path).unwrap();
        for expected in &records {
            let (op_id, record) = reader.next_record().unwrap().unwrap();
            assert_eq!(op_id, 12);
            assert_eq!(&record, expected);
        }
        assert!(reader.next_record().unwrap().is_none());
    }

    #[test]
    fn torn_frame_ends_the_log() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("arbor.wal");

        {
            let mut writer = WalWriter::create(&path).unwrap();
            writer
                .append(
                    1,
                    &WalRecord::Component(ComponentOp::Remove {
                        file_id: 1,
                        raw_key: vec![5; 4],
                        raw_value: vec![6; 8],
                    }),
                )
                .unwrap();
            writer.sync().unwrap();
        }

        // corrupt the payload tail to simulate a torn write
        let mut bytes = std::fs::read(&path).unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xFF;
        std::fs::write(&path, bytes).unwrap();

        let mut reader = WalReader::open(&path).unwrap();
        assert!(reader.next_record().unwrap().is_none());
    }
}
