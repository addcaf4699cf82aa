//! # Arbor Configuration Constants
//!
//! This module centralizes all configuration constants, grouping interdependent
//! values together and documenting their relationships. Constants that depend
//! on each other are co-located to prevent mismatch bugs.
//!
//! ## Dependency Graph
//!
//! The following diagram shows how constants relate to each other. When changing
//! any constant, check if dependent constants need adjustment.
//!
//! ```text
//! PAGE_SIZE (16384 bytes)
//!       │
//!       ├─> DEFAULT_BONSAI_BUCKET_SIZE (must divide PAGE_SIZE)
//!       │     The sub-page allocator carves pages into fixed-size bucket
//!       │     regions. A region may never straddle a page boundary, so the
//!       │     bucket size must divide the page size evenly.
//!       │
//!       └─> WAL frame payloads (records are much smaller than a page)
//!
//! DEFAULT_BONSAI_BUCKET_SIZE (8192 bytes)
//!       │
//!       └─> Bonsai bucket capacity: region minus the 0x43-byte bucket
//!           header, shared between the slot directory (4 bytes per entry,
//!           growing up) and the entry area (growing down).
//!
//! MAX_ENTRY_SIZE (24,576,000 bytes)
//!       │
//!       └─> Hard ceiling on one serialized key + value pair. Entries this
//!           large only occur through external-value links in the standard
//!           tree; the bonsai tree rejects them outright.
//!
//! LOCK_SHARD_COUNT (64)
//!       │
//!       └─> File-lock manager shard array size; file ids hash onto shards.
//! ```
//!
//! ## Critical Invariants
//!
//! These invariants are enforced by compile-time assertions:
//!
//! 1. `PAGE_SIZE % DEFAULT_BONSAI_BUCKET_SIZE == 0` (regions never straddle pages)
//! 2. `DEFAULT_BONSAI_BUCKET_SIZE` leaves room for the bucket header plus at
//!    least one slot and one minimal entry
//! 3. `LOCK_SHARD_COUNT` is a power of two (shard index by mask, not modulo)
//!
//! ## Modifying Constants
//!
//! Before changing any constant:
//! 1. Check the dependency graph above
//! 2. Run `cargo build` to verify compile-time assertions
//! 3. Run the full test suite — the split scenarios are sensitive to capacity

use crate::storage::PAGE_SIZE;

// ============================================================================
// BONSAI SUB-PAGE ALLOCATION
// These constants are tightly coupled - changing one may require changing others
// ============================================================================

/// Default size in bytes of one bonsai bucket region. Every bucket the
/// sub-page allocator hands out is exactly this large, so a page holds
/// `PAGE_SIZE / DEFAULT_BONSAI_BUCKET_SIZE` regions.
pub const DEFAULT_BONSAI_BUCKET_SIZE: usize = 8192;

const _: () = assert!(
    PAGE_SIZE % DEFAULT_BONSAI_BUCKET_SIZE == 0,
    "bonsai bucket regions must divide the page size evenly"
);

const _: () = assert!(
    DEFAULT_BONSAI_BUCKET_SIZE >= 256,
    "a bonsai bucket must fit its header plus at least one slot and entry"
);

// ============================================================================
// ENTRY LIMITS
// ============================================================================

/// Maximum size of a single serialized key + value pair in bytes.
/// Exceeding this is a hard error, never a split trigger.
pub const MAX_ENTRY_SIZE: usize = 24_576_000;

// ============================================================================
// LOCK SHARDING
// These control contention characteristics of the file-lock manager
// ============================================================================

/// Number of shards in the partitioned file-lock manager.
/// Higher values reduce contention but increase memory overhead.
pub const LOCK_SHARD_COUNT: usize = 64;

const _: () = assert!(
    LOCK_SHARD_COUNT.is_power_of_two(),
    "LOCK_SHARD_COUNT must be a power of two so shard selection can mask"
);
