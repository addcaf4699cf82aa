//! # Encoding Module
//!
//! This module defines the binary serializer seam between tree keys/values
//! and the slotted bucket layouts.
//!
//! ## Design
//!
//! Rather than passing serializer objects around the way a dynamically typed
//! engine would, Arbor puts the contract on the key and value types
//! themselves:
//!
//! - [`TreeKey`]: ordered keys that know their own serialized form.
//! - [`TreeValue`]: values that additionally advertise whether their encoding
//!   is fixed-length. The bonsai tree only accepts fixed-length values; the
//!   standard tree accepts either.
//!
//! Both traits expose `size_in_buffer`, which reports how many bytes an
//! encoded object occupies *without* decoding it. The tree engines rely on
//! this to move raw entries during splits and WAL logging without paying for
//! deserialization.
//!
//! ## Serializer Ids
//!
//! Every implementation carries a stable one-byte id. The ids are written
//! into bucket headers for compatibility with older files and are never
//! consulted on read.
//!
//! ## Stock Implementations
//!
//! Fixed-width little-endian codecs for `i32`, `i64` and `u64`, and a
//! length-prefixed codec for `String` (`[len: i32][utf8 bytes]`). The
//! integer codecs are what the RID-bag and cluster-position callers use;
//! strings exercise the variable-length paths of the standard tree.

mod serializers;

pub use serializers::{TreeKey, TreeValue};
