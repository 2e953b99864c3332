//! Filesystem helpers: staging-directory traversal, archiving and integrity.

pub mod archive;
pub mod integrity;
pub mod walker;
