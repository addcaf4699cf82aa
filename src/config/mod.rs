//! # Arbor Configuration Module
//!
//! This module centralizes all configuration constants for Arbor. Constants are
//! grouped by their functional area and interdependencies are documented and
//! enforced through compile-time assertions.
//!
//! ## Why Centralization?
//!
//! The bucket layouts, the sub-page allocator and the WAL all derive limits
//! from the same handful of sizes. Keeping those sizes in one module, with
//! `const` assertions tying them together, prevents the classic mismatch bug
//! where a bucket region no longer fits the page it is carved out of.
//!
//! ## Module Organization
//!
//! - [`constants`]: All numeric configuration values with dependency documentation

pub mod constants;
pub use constants::*;
