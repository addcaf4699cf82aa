//! # Slotted-Region Primitives
//!
//! Both bucket layouts — bonsai sub-page regions and standard full-page
//! buckets — share one byte-level representation:
//!
//! ```text
//! +--------------------------+ 0
//! | header (layout-specific) |
//! +--------------------------+ positions_offset
//! | slot directory           |  i32 entry offsets, grows up
//! | [pos 0][pos 1]...        |
//! +--------------------------+
//! | free space               |
//! +--------------------------+ free_pointer
//! | entry area               |  entry bytes, grows down from region end
//! +--------------------------+ region.len()
//! ```
//!
//! The first nine header bytes are common to every layout: `free_pointer`
//! (i32), `size` (i32) and the flag byte. Everything after that differs per
//! variant, so callers pass their own `positions_offset`.
//!
//! This module owns the mechanics that must stay byte-for-byte reversible:
//! slot shifts, entry insertion and removal with compaction, bulk appends
//! and the matching undo appliers used by atomic-operation rollback. Each
//! `undo_*` function is the exact inverse of its forward primitive — applied
//! to the post-state it reproduces the pre-state including stale bytes in
//! the free area, which is what lets rollback restore page images verbatim.
//!
//! All integers are little-endian. All byte moves go through `move_data`,
//! which is overlap-safe (`copy_within` is a memmove).

use eyre::{ensure, Result};

pub(crate) const FREE_POINTER_OFFSET: usize = 0x00;
pub(crate) const SIZE_OFFSET: usize = 0x04;
pub(crate) const FLAGS_OFFSET: usize = 0x08;

pub(crate) const INT_SIZE: usize = 4;

pub(crate) fn read_i32(region: &[u8], offset: usize) -> i32 {
    i32::from_le_bytes(region[offset..offset + 4].try_into().unwrap())
}

pub(crate) fn write_i32(region: &mut [u8], offset: usize, value: i32) {
    region[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
}

pub(crate) fn read_i64(region: &[u8], offset: usize) -> i64 {
    i64::from_le_bytes(region[offset..offset + 8].try_into().unwrap())
}

pub(crate) fn write_i64(region: &mut [u8], offset: usize, value: i64) {
    region[offset..offset + 8].copy_from_slice(&value.to_le_bytes());
}

pub(crate) fn free_pointer(region: &[u8]) -> usize {
    read_i32(region, FREE_POINTER_OFFSET) as usize
}

pub(crate) fn set_free_pointer(region: &mut [u8], value: usize) {
    write_i32(region, FREE_POINTER_OFFSET, value as i32);
}

pub(crate) fn size(region: &[u8]) -> usize {
    read_i32(region, SIZE_OFFSET) as usize
}

pub(crate) fn set_size(region: &mut [u8], value: usize) {
    write_i32(region, SIZE_OFFSET, value as i32);
}

pub(crate) fn position(region: &[u8], positions_offset: usize, index: usize) -> usize {
    read_i32(region, positions_offset + index * INT_SIZE) as usize
}

pub(crate) fn set_position(region: &mut [u8], positions_offset: usize, index: usize, value: usize) {
    write_i32(region, positions_offset + index * INT_SIZE, value as i32);
}

/// Overlap-safe in-region byte move.
pub(crate) fn move_data(region: &mut [u8], src: usize, dst: usize, len: usize) {
    region.copy_within(src..src + len, dst);
}

/// Reports whether an entry of `entry_size` bytes plus one new slot still
/// fits between the slot directory and the entry area.
pub(crate) fn fits(region: &[u8], positions_offset: usize, entry_size: usize) -> bool {
    let free = free_pointer(region);
    let slots_end = positions_offset + (size(region) + 1) * INT_SIZE;
    free >= entry_size && free - entry_size >= slots_end
}

/// Before-image captured by [`insert_raw`]; everything rollback needs to
/// reverse the insertion byte-exactly.
pub(crate) struct InsertCapture {
    pub prev_free_bytes: Vec<u8>,
    pub prev_tail_slot: [u8; 4],
}

/// Inserts `bytes` as the entry at `index`, shifting slots `[index..)` right.
/// The caller has already verified fit.
pub(crate) fn insert_raw(
    region: &mut [u8],
    positions_offset: usize,
    index: usize,
    bytes: &[u8],
) -> InsertCapture {
    let old_size = size(region);
    let free = free_pointer(region);
    let entry_size = bytes.len();

    let prev_tail_slot: [u8; 4] = region
        [positions_offset + old_size * INT_SIZE..positions_offset + (old_size + 1) * INT_SIZE]
        .try_into()
        .unwrap();
    let prev_free_bytes = region[free - entry_size..free].to_vec();

    if index < old_size {
        move_data(
            region,
            positions_offset + index * INT_SIZE,
            positions_offset + (index + 1) * INT_SIZE,
            (old_size - index) * INT_SIZE,
        );
    }

    let new_free = free - entry_size;
    set_free_pointer(region, new_free);
    set_position(region, positions_offset, index, new_free);
    set_size(region, old_size + 1);

    region[new_free..new_free + entry_size].copy_from_slice(bytes);

    InsertCapture {
        prev_free_bytes,
        prev_tail_slot,
    }
}

/// Exact inverse of [`insert_raw`].
pub(crate) fn undo_insert(
    region: &mut [u8],
    positions_offset: usize,
    index: usize,
    entry_size: usize,
    prev_free_bytes: &[u8],
    prev_tail_slot: [u8; 4],
) -> Result<()> {
    let post_size = size(region);
    ensure!(
        index < post_size && prev_free_bytes.len() == entry_size,
        "corrupt AddEntry undo record: index {} size {} entry {}",
        index,
        post_size,
        entry_size
    );

    let new_size = post_size - 1;
    move_data(
        region,
        positions_offset + (index + 1) * INT_SIZE,
        positions_offset + index * INT_SIZE,
        (new_size - index) * INT_SIZE,
    );
    region[positions_offset + new_size * INT_SIZE..positions_offset + (new_size + 1) * INT_SIZE]
        .copy_from_slice(&prev_tail_slot);

    let free = free_pointer(region);
    set_free_pointer(region, free + entry_size);
    set_size(region, new_size);

    region[free..free + entry_size].copy_from_slice(prev_free_bytes);

    Ok(())
}

/// Removes the entry at `index`: shifts slots left, compacts the entry area
/// upward by `entry_size`, and rewrites the offsets of every entry that sat
/// below the removed one. Returns the removed entry's byte position.
pub(crate) fn remove_raw(
    region: &mut [u8],
    positions_offset: usize,
    index: usize,
    entry_size: usize,
) -> usize {
    let entry_position = position(region, positions_offset, index);
    let mut live = size(region);

    if index < live - 1 {
        move_data(
            region,
            positions_offset + (index + 1) * INT_SIZE,
            positions_offset + index * INT_SIZE,
            (live - index - 1) * INT_SIZE,
        );
    }

    live -= 1;
    set_size(region, live);

    let free = free_pointer(region);
    if live > 0 && entry_position > free {
        move_data(region, free, free + entry_size, entry_position - free);
    }
    set_free_pointer(region, free + entry_size);

    for i in 0..live {
        let current = position(region, positions_offset, i);
        if current < entry_position {
            set_position(region, positions_offset, i, current + entry_size);
        }
    }

    entry_position
}

/// Exact inverse of [`remove_raw`].
pub(crate) fn undo_remove(
    region: &mut [u8],
    positions_offset: usize,
    index: usize,
    entry_position: usize,
    raw_entry: &[u8],
) -> Result<()> {
    let entry_size = raw_entry.len();
    let post_size = size(region);
    let post_free = free_pointer(region);
    ensure!(
        post_free >= entry_size && index <= post_size,
        "corrupt Remove undo record: index {} size {} free {}",
        index,
        post_size,
        post_free
    );
    let free = post_free - entry_size;

    for i in 0..post_size {
        let current = position(region, positions_offset, i);
        if current < entry_position + entry_size {
            set_position(region, positions_offset, i, current - entry_size);
        }
    }

    if post_size > 0 && entry_position > free {
        move_data(region, post_free, free, entry_position - free);
    }

    region[entry_position..entry_position + entry_size].copy_from_slice(raw_entry);
    set_free_pointer(region, free);
    set_size(region, post_size + 1);

    if index < post_size {
        move_data(
            region,
            positions_offset + index * INT_SIZE,
            positions_offset + (index + 1) * INT_SIZE,
            (post_size - index) * INT_SIZE,
        );
    }
    set_position(region, positions_offset, index, entry_position);

    Ok(())
}

/// Appends `bytes` at the free pointer and points slot `index` at it.
/// Neither shifts slots nor bumps `size`; bulk loaders set `size` once at
/// the end, mirroring the append-then-commit shape of `add_all`/`shrink`.
pub(crate) fn append_raw(region: &mut [u8], positions_offset: usize, index: usize, bytes: &[u8]) {
    let free = free_pointer(region) - bytes.len();

    set_free_pointer(region, free);
    set_position(region, positions_offset, index, free);
    region[free..free + bytes.len()].copy_from_slice(bytes);
}

/// Before-image captured ahead of a bulk rewrite (`add_all` or `shrink`).
pub(crate) struct RewriteCapture {
    pub prev_free_pointer: i32,
    pub prev_size: i32,
    pub prev_positions: Vec<u8>,
    pub prev_entries: Vec<u8>,
}

/// Captures everything a bulk rewrite of `touched_slots` slot entries and
/// `touched_bytes` entry-area bytes will overwrite. For `add_all` the
/// touched entry span is `[free - total, free)`; for `shrink` it is
/// `[free, region end)` rewritten in place.
pub(crate) fn capture_rewrite(
    region: &[u8],
    positions_offset: usize,
    touched_slots: usize,
    entry_span_start: usize,
    entry_span_end: usize,
) -> RewriteCapture {
    RewriteCapture {
        prev_free_pointer: read_i32(region, FREE_POINTER_OFFSET),
        prev_size: read_i32(region, SIZE_OFFSET),
        prev_positions: region
            [positions_offset..positions_offset + touched_slots * INT_SIZE]
            .to_vec(),
        prev_entries: region[entry_span_start..entry_span_end].to_vec(),
    }
}

/// Restores a [`RewriteCapture`]. `entry_span_start` must match the capture.
pub(crate) fn undo_rewrite(
    region: &mut [u8],
    positions_offset: usize,
    capture_free_pointer: i32,
    capture_size: i32,
    prev_positions: &[u8],
    entry_span_start: usize,
    prev_entries: &[u8],
) -> Result<()> {
    ensure!(
        entry_span_start + prev_entries.len() <= region.len()
            && positions_offset + prev_positions.len() <= region.len(),
        "corrupt rewrite undo record: span {}+{} in region of {}",
        entry_span_start,
        prev_entries.len(),
        region.len()
    );

    write_i32(region, FREE_POINTER_OFFSET, capture_free_pointer);
    write_i32(region, SIZE_OFFSET, capture_size);
    region[positions_offset..positions_offset + prev_positions.len()]
        .copy_from_slice(prev_positions);
    region[entry_span_start..entry_span_start + prev_entries.len()].copy_from_slice(prev_entries);

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const POS: usize = 16;
    const REGION: usize = 256;

    fn fresh_region() -> Vec<u8> {
        let mut region = vec![0u8; REGION];
        set_free_pointer(&mut region, REGION);
        set_size(&mut region, 0);
        region
    }

    #[test]
    fn insert_places_entry_below_free_pointer() {
        let mut region = fresh_region();

        insert_raw(&mut region, POS, 0, b"abcd");

        assert_eq!(size(&region), 1);
        assert_eq!(free_pointer(&region), REGION - 4);
        assert_eq!(position(&region, POS, 0), REGION - 4);
        assert_eq!(&region[REGION - 4..], b"abcd");
    }

    #[test]
    fn insert_in_middle_shifts_slots_right() {
        let mut region = fresh_region();
        insert_raw(&mut region, POS, 0, b"aa");
        insert_raw(&mut region, POS, 1, b"cc");

        insert_raw(&mut region, POS, 1, b"bb");

        assert_eq!(size(&region), 3);
        let p0 = position(&region, POS, 0);
        let p1 = position(&region, POS, 1);
        let p2 = position(&region, POS, 2);
        assert_eq!(&region[p0..p0 + 2], b"aa");
        assert_eq!(&region[p1..p1 + 2], b"bb");
        assert_eq!(&region[p2..p2 + 2], b"cc");
    }

    #[test]
    fn undo_insert_restores_exact_bytes() {
        let mut region = fresh_region();
        // pre-existing garbage in the free area must survive a round trip
        region[REGION - 3] = 0xEE;
        insert_raw(&mut region, POS, 0, b"aa");
        insert_raw(&mut region, POS, 1, b"cc");
        let snapshot = region.clone();

        let capture = insert_raw(&mut region, POS, 1, b"bb");
        undo_insert(
            &mut region,
            POS,
            1,
            2,
            &capture.prev_free_bytes,
            capture.prev_tail_slot,
        )
        .unwrap();

        assert_eq!(region, snapshot);
    }

    #[test]
    fn remove_compacts_entry_area() {
        let mut region = fresh_region();
        insert_raw(&mut region, POS, 0, b"aaaa");
        insert_raw(&mut region, POS, 1, b"bbbb");
        insert_raw(&mut region, POS, 2, b"cccc");

        remove_raw(&mut region, POS, 0, 4);

        assert_eq!(size(&region), 2);
        assert_eq!(free_pointer(&region), REGION - 8);
        let p0 = position(&region, POS, 0);
        let p1 = position(&region, POS, 1);
        assert_eq!(&region[p0..p0 + 4], b"bbbb");
        assert_eq!(&region[p1..p1 + 4], b"cccc");
    }

    #[test]
    fn undo_remove_restores_exact_bytes() {
        let mut region = fresh_region();
        insert_raw(&mut region, POS, 0, b"aaaa");
        insert_raw(&mut region, POS, 1, b"bbbb");
        insert_raw(&mut region, POS, 2, b"cccc");
        let snapshot = region.clone();

        let p = remove_raw(&mut region, POS, 1, 4);
        undo_remove(&mut region, POS, 1, p, b"bbbb").unwrap();

        assert_eq!(region, snapshot);
    }

    #[test]
    fn undo_remove_of_last_entry() {
        let mut region = fresh_region();
        insert_raw(&mut region, POS, 0, b"zz");
        let snapshot = region.clone();

        let p = remove_raw(&mut region, POS, 0, 2);
        assert_eq!(size(&region), 0);

        undo_remove(&mut region, POS, 0, p, b"zz").unwrap();
        assert_eq!(region, snapshot);
    }

    #[test]
    fn rewrite_capture_round_trips_add_all() {
        let mut region = fresh_region();
        region[200] = 0x7F;
        let snapshot = region.clone();

        let entries: [&[u8]; 2] = [b"aaa", b"bb"];
        let total = 5;
        let free = free_pointer(&region);
        let capture = capture_rewrite(&region, POS, entries.len(), free - total, free);

        for (i, entry) in entries.iter().enumerate() {
            append_raw(&mut region, POS, i, entry);
        }
        set_size(&mut region, entries.len());

        undo_rewrite(
            &mut region,
            POS,
            capture.prev_free_pointer,
            capture.prev_size,
            &capture.prev_positions,
            free - total,
            &capture.prev_entries,
        )
        .unwrap();

        assert_eq!(region, snapshot);
    }

    #[test]
    fn fits_accounts_for_new_slot() {
        let mut region = vec![0u8; 64];
        set_free_pointer(&mut region, 64);
        set_size(&mut region, 0);

        // positions at 16: one slot (4) + entry must fit in [20, 64)
        assert!(fits(&region, POS, 44));
        assert!(!fits(&region, POS, 45));
    }
}
