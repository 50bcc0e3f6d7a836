//! Gzip-compressed tar archives.
//!
//! Three operations make up the on-disk backup format:
//! - [`create_archive`] packages a set of sources into one `.tar.gz`
//! - [`extract_archive`] unpacks an archive, refusing any entry that would
//!   land outside the destination directory
//! - [`list_archive`] reads headers only and reports every entry in order
//!
//! All three are blocking and check a [`CancellationToken`] between entries.
//! Async callers run them through `spawn_blocking`.

mod create;
mod extract;

pub use create::create_archive;
pub use extract::{extract_archive, extract_archive_stripped};

use crate::utils::{EngineError, Result};
use flate2::read::GzDecoder;
use serde::Serialize;
use std::fs::File;
use std::path::{Path, PathBuf};
use tokio_util::sync::CancellationToken;

/// Gzip level used when the caller does not ask for one.
pub const DEFAULT_COMPRESSION_LEVEL: u32 = 6;

/// A filesystem path to include in an archive.
///
/// Directories are included recursively under `dest_path` (or their base
/// name). A single file is stored as `dest_path` (or its base name).
#[derive(Debug, Clone)]
pub struct ArchiveSource {
    pub path: PathBuf,
    pub dest_path: Option<String>,
}

impl ArchiveSource {
    pub fn new(path: impl Into<PathBuf>, dest_path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            dest_path: Some(dest_path.into()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryKind {
    File,
    Directory,
    Symlink,
    Other,
}

impl From<tar::EntryType> for EntryKind {
    fn from(entry_type: tar::EntryType) -> Self {
        match entry_type {
            tar::EntryType::Regular | tar::EntryType::Continuous => EntryKind::File,
            tar::EntryType::Directory => EntryKind::Directory,
            tar::EntryType::Symlink => EntryKind::Symlink,
            _ => EntryKind::Other,
        }
    }
}

/// Header metadata for one archive entry, as reported by [`list_archive`].
#[derive(Debug, Clone, Serialize)]
pub struct ArchiveEntry {
    pub path: String,
    pub size: u64,
    pub mode: u32,
    pub kind: EntryKind,
}

/// List every entry of an archive in archive order without reading contents.
pub fn list_archive(archive_path: &Path, cancel: &CancellationToken) -> Result<Vec<ArchiveEntry>> {
    let file = File::open(archive_path)?;
    let mut archive = tar::Archive::new(GzDecoder::new(file));
    let mut entries = Vec::new();

    for entry in archive.entries()? {
        if cancel.is_cancelled() {
            return Err(EngineError::Cancelled);
        }
        let entry = entry?;
        let header = entry.header();
        let path = entry.path()?.to_string_lossy().trim_end_matches('/').to_string();

        entries.push(ArchiveEntry {
            path,
            size: header.size()?,
            mode: header.mode()?,
            kind: header.entry_type().into(),
        });
    }

    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use std::fs;
    use tempfile::TempDir;

    fn tree(root: &Path) -> BTreeMap<String, Option<u64>> {
        walkdir::WalkDir::new(root)
            .min_depth(1)
            .into_iter()
            .map(|e| {
                let e = e.unwrap();
                let rel = e.path().strip_prefix(root).unwrap().to_string_lossy().to_string();
                let meta = fs::symlink_metadata(e.path()).unwrap();
                let size = if meta.is_file() { Some(meta.len()) } else { None };
                (rel, size)
            })
            .collect()
    }

    #[test]
    fn test_round_trip_preserves_structure() -> Result<()> {
        let src = TempDir::new()?;
        fs::create_dir_all(src.path().join("data/nested/deeper"))?;
        fs::create_dir_all(src.path().join("data/empty"))?;
        fs::write(src.path().join("data/top.txt"), b"top level")?;
        fs::write(src.path().join("data/nested/deeper/file.bin"), vec![7u8; 4096])?;
        #[cfg(unix)]
        std::os::unix::fs::symlink("top.txt", src.path().join("data/link"))?;

        let out = TempDir::new()?;
        let archive = out.path().join("out.tar.gz");
        let cancel = CancellationToken::new();
        create_archive(
            &[ArchiveSource::new(src.path().join("data"), "data")],
            &archive,
            DEFAULT_COMPRESSION_LEVEL,
            &cancel,
        )?;

        let dest = TempDir::new()?;
        extract_archive(&archive, dest.path(), &cancel)?;

        assert_eq!(tree(src.path()), tree(dest.path()));
        #[cfg(unix)]
        assert_eq!(
            fs::read_link(dest.path().join("data/link"))?,
            PathBuf::from("top.txt")
        );
        assert_eq!(fs::read(dest.path().join("data/top.txt"))?, b"top level");

        Ok(())
    }

    #[test]
    fn test_list_in_archive_order() -> Result<()> {
        let src = TempDir::new()?;
        fs::write(src.path().join("container.json"), b"{}")?;
        fs::create_dir(src.path().join("volumes"))?;
        fs::write(src.path().join("volumes/app.tar.gz"), b"xx")?;

        let out = TempDir::new()?;
        let archive = out.path().join("b.tar.gz");
        let cancel = CancellationToken::new();
        create_archive(
            &[
                ArchiveSource::new(src.path().join("container.json"), "container.json"),
                ArchiveSource::new(src.path().join("volumes"), "volumes"),
            ],
            &archive,
            1,
            &cancel,
        )?;

        let entries = list_archive(&archive, &cancel)?;
        let paths: Vec<&str> = entries.iter().map(|e| e.path.as_str()).collect();
        assert_eq!(paths, vec!["container.json", "volumes", "volumes/app.tar.gz"]);
        assert_eq!(entries[0].kind, EntryKind::File);
        assert_eq!(entries[0].size, 2);
        assert_eq!(entries[1].kind, EntryKind::Directory);

        Ok(())
    }

    #[test]
    fn test_single_file_uses_base_name() -> Result<()> {
        let src = TempDir::new()?;
        fs::write(src.path().join("metadata.json"), b"{}")?;

        let out = TempDir::new()?;
        let archive = out.path().join("m.tar.gz");
        let cancel = CancellationToken::new();
        create_archive(
            &[ArchiveSource {
                path: src.path().join("metadata.json"),
                dest_path: None,
            }],
            &archive,
            DEFAULT_COMPRESSION_LEVEL,
            &cancel,
        )?;

        let entries = list_archive(&archive, &cancel)?;
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].path, "metadata.json");

        Ok(())
    }

    #[test]
    fn test_list_cancelled() -> Result<()> {
        let src = TempDir::new()?;
        fs::write(src.path().join("a"), b"a")?;
        let out = TempDir::new()?;
        let archive = out.path().join("c.tar.gz");
        create_archive(
            &[ArchiveSource::new(src.path().join("a"), "a")],
            &archive,
            DEFAULT_COMPRESSION_LEVEL,
            &CancellationToken::new(),
        )?;

        let cancel = CancellationToken::new();
        cancel.cancel();
        assert!(list_archive(&archive, &cancel).unwrap_err().is_cancelled());

        Ok(())
    }
}
