//! Shared types and protocols for lzmetrics
//!
//! This crate contains the result codes, descriptors and property types used by
//! the metrics engine and its command-line driver, together with the two binary
//! layouts that cross the API boundary: the packed multi-subdevice raw-data
//! header and the export-data envelope.

pub mod protocol;
pub mod types;
pub mod utils;

// Re-export commonly used types
pub use types::{desc::*, metric::*, result::*};
