//! Filesystem traversal and path safety.

pub mod paths;
pub mod walker;
