//! Directory traversal for archiving.
//!
//! Walks a source tree in a stable order, reporting directories (so empty
//! ones survive a round trip), regular files and symlinks. Symlinks are never
//! followed. The walk checks a cancellation token before every entry.

use crate::utils::{EngineError, Result};
use std::path::{Path, PathBuf};
use tokio_util::sync::CancellationToken;
use walkdir::{DirEntry, WalkDir};

/// Information about an entry discovered during walking
#[derive(Debug, Clone)]
pub struct FileInfo {
    /// Full path to the entry
    pub path: PathBuf,

    /// Relative path from the root (empty for the root itself)
    pub relative_path: PathBuf,

    pub is_file: bool,
    pub is_dir: bool,
    pub is_symlink: bool,
}

impl FileInfo {
    fn from_entry(entry: &DirEntry, root: &Path) -> std::io::Result<Self> {
        // symlink_metadata: a link is reported as a link, never as its target
        let metadata = std::fs::symlink_metadata(entry.path())?;
        let path = entry.path().to_path_buf();
        let relative_path = path.strip_prefix(root).unwrap_or(&path).to_path_buf();
        let is_symlink = metadata.file_type().is_symlink();

        Ok(Self {
            path,
            relative_path,
            is_file: metadata.is_file(),
            is_dir: !is_symlink && metadata.is_dir(),
            is_symlink,
        })
    }
}

/// Walk a directory tree, root included, calling `callback` for each entry.
///
/// Directories are visited before their contents and siblings are sorted by
/// file name, so the same tree always produces the same sequence.
pub fn walk_directory<F>(root: &Path, cancel: &CancellationToken, mut callback: F) -> Result<()>
where
    F: FnMut(&FileInfo) -> Result<()>,
{
    for entry in WalkDir::new(root).follow_links(false).sort_by_file_name() {
        if cancel.is_cancelled() {
            return Err(EngineError::Cancelled);
        }

        let entry = entry.map_err(std::io::Error::from)?;
        let info = FileInfo::from_entry(&entry, root)?;
        callback(&info)?;
    }

    Ok(())
}
