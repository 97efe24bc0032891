//! Output storage: the sharded result tree, page writes and archives.

pub mod archive;
mod page_writer;
mod shard;

pub use page_writer::PageWriter;
pub use shard::ShardAllocator;

use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StorageCheckError {
    #[error("storage root {0:?} does not exist")]
    Missing(PathBuf),

    #[error("storage root {0:?} is not a directory")]
    NotADirectory(PathBuf),

    #[error("storage root {path:?} is not writable: {source}")]
    NotWritable {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Verifies the output root is a directory we can create files in.
pub fn check_storage_root(root: &Path) -> Result<(), StorageCheckError> {
    if !root.exists() {
        return Err(StorageCheckError::Missing(root.to_path_buf()));
    }
    if !root.is_dir() {
        return Err(StorageCheckError::NotADirectory(root.to_path_buf()));
    }
    tempfile::Builder::new()
        .prefix(".write-check")
        .tempfile_in(root)
        .map(drop)
        .map_err(|source| StorageCheckError::NotWritable {
            path: root.to_path_buf(),
            source,
        })
}

/// Directory holding all output of one search.
pub fn job_root(storage_root: &Path, search_id: i64) -> PathBuf {
    storage_root.join(search_id.to_string())
}
