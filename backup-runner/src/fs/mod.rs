//! File system operations: source traversal, rotation, space checks and
//! artifact permissions.

pub mod metadata;
pub mod retention;
pub mod space;
pub mod walker;
