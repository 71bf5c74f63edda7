//! Type definitions shared by the engine and its callers

pub mod desc;
pub mod metric;
pub mod result;
