//! # Bonsai B+-Tree
//!
//! The bonsai variant packs many small buckets into each 16KB page. A
//! per-file sub-page allocator carves pages into fixed-size regions and
//! recycles regions through a free list when subtrees are deleted, so a
//! file can host thousands of tiny trees without burning a page per bucket.
//!
//! ## Why Sub-Page Buckets
//!
//! The workloads this variant serves (RID bags, small per-record indexes)
//! create huge numbers of trees that each hold a handful of entries. With
//! one bucket per page, a three-entry tree would occupy 16KB; with 8KB
//! bonsai regions, two such trees share a page and deleted trees donate
//! their regions back through the free list.
//!
//! ## Bucket Region Layout
//!
//! Offsets relative to the region start, little-endian:
//!
//! ```text
//! 0x00 free_pointer        i32     lowest occupied entry byte
//! 0x04 size                i32     live slot count
//! 0x08 flags               i8      LEAF (0x1), DELETED (0x2)
//! 0x09 free_list_ptr       16B     next bucket on the file free list
//! 0x19 left_sibling        16B
//! 0x29 right_sibling       16B
//! 0x39 tree_size           i64     whole-tree key count (root only)
//! 0x41 key_serializer_id   i8
//! 0x42 value_serializer_id i8
//! 0x43 slot directory      i32 × size, grows up
//!      ...
//!      entry area          grows down from the region end
//! ```
//!
//! ## Module Organization
//!
//! - `pointer`: the (page, offset, version) bucket pointer
//! - `bucket`: the slotted bucket view over one region
//! - `sys`: the system bucket (page 0) and the sub-page allocator
//! - `tree`: the tree engine (search, put with recursive split, remove,
//!   range scans, clear/delete with region recycling)
//!
//! ## Constraints
//!
//! Values must serialize to a fixed length; the tree refuses construction
//! otherwise. Range scans are ascending only.

pub mod bucket;
mod pointer;
pub mod sys;
mod tree;

pub use bucket::{BonsaiEntry, BucketState};
pub use pointer::{BonsaiPointer, BINARY_VERSION};
pub use tree::{BonsaiTree, Change};
