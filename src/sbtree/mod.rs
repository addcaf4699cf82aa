//! # Standard B+-Tree
//!
//! The standard variant gives every bucket a whole 16KB page. It shares the
//! bonsai variant's algorithmic core — the same slotted layout, the same
//! search and split shapes, the same durability coupling — but differs
//! where a full page changes the trade-offs:
//!
//! - Child and sibling pointers are plain `i64` page indexes (-1 is NULL).
//! - Leaf values may be variable-length, and a value may instead be an
//!   `i64` *link* to an externally stored value; a flag byte in front of
//!   the value bytes says which. The head of the external-value free list
//!   lives in the bucket header and is stored and logged here, managed by
//!   the external-value subsystem.
//! - Keys can optionally be encrypted at rest through an
//!   [`EncryptionCodec`](crate::encryption::EncryptionCodec); encrypted
//!   keys are framed as `[encrypted_len: i32][ciphertext]`.
//! - There is no sub-page allocator: new buckets are appended pages, and
//!   `clear` simply reinitializes the root.
//!
//! ## Bucket Layout
//!
//! Offsets relative to the page start, little-endian:
//!
//! ```text
//! 0x00 free_pointer         i32
//! 0x04 size                 i32
//! 0x08 is_leaf              i8
//! 0x09 left_sibling         i64
//! 0x11 right_sibling        i64
//! 0x19 tree_size            i64
//! 0x21 key_serializer_id    i8
//! 0x22 value_serializer_id  i8
//! 0x23 values_free_list     i64
//! 0x2B slot directory       i32 × size, grows up
//!      ...
//!      entry area           grows down from the page end
//! ```
//!
//! The serializer id bytes are written for compatibility with older files
//! and never consulted on read.

pub mod bucket;
mod tree;

pub use bucket::{SbEntry, SbValue};
pub use tree::SbTree;
