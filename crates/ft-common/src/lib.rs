//! Flake Triage common types, identity, and errors.
//!
//! This crate provides foundational types shared across ft-core modules:
//! - Branch identity types (source ref, ref hash, variant, branch key)
//! - Hour arithmetic for partition-time bucketing
//! - Common error types

pub mod error;
pub mod hour;
pub mod id;

pub use error::{Error, ErrorCategory, Result};
pub use id::{BranchKey, GitilesRef, RefHash, SourceRef, Variant};
