use crate::fs::paths::{ensure_within, secure_join, strip_pseudo_root};
use crate::utils::{EngineError, Result};
use flate2::read::GzDecoder;
use std::fs::{self, File};
use std::io;
use std::path::Path;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Unpack `archive_path` into `dest_dir`.
///
/// Every entry name is normalized and checked against `dest_dir` before
/// anything is written; one entry outside the boundary fails the whole
/// extraction with [`EngineError::PathTraversal`]. Entries that are neither
/// files, directories nor symlinks are skipped.
pub fn extract_archive(
    archive_path: &Path,
    dest_dir: &Path,
    cancel: &CancellationToken,
) -> Result<()> {
    extract_archive_stripped(archive_path, dest_dir, "", cancel)
}

/// Like [`extract_archive`], but drops a leading `pseudo_root` directory from
/// every entry name first. Used for per-mount data archives, whose contents
/// are stored under the volume name or bind basename.
pub fn extract_archive_stripped(
    archive_path: &Path,
    dest_dir: &Path,
    pseudo_root: &str,
    cancel: &CancellationToken,
) -> Result<()> {
    fs::create_dir_all(dest_dir)?;
    let root = dest_dir.canonicalize()?;

    let file = File::open(archive_path)?;
    let mut archive = tar::Archive::new(GzDecoder::new(file));
    let mut written = 0usize;

    for entry in archive.entries()? {
        if cancel.is_cancelled() {
            return Err(EngineError::Cancelled);
        }

        let mut entry = entry?;
        let name = entry.path()?.into_owned();
        let relative = strip_pseudo_root(&name, pseudo_root);
        let target = secure_join(&root, &relative).map_err(|_| EngineError::PathTraversal {
            entry: name.clone(),
        })?;

        match entry.header().entry_type() {
            tar::EntryType::Directory => {
                ensure_within(&root, &target)?;
                fs::create_dir_all(&target)?;
                if !target.canonicalize()?.starts_with(&root) {
                    return Err(EngineError::PathTraversal { entry: name });
                }
                set_mode(&target, entry.header().mode().ok())?;
            }
            tar::EntryType::Symlink => {
                let link = entry
                    .link_name()?
                    .ok_or_else(|| {
                        EngineError::Io(io::Error::new(
                            io::ErrorKind::InvalidData,
                            format!("symlink {} has no target", name.display()),
                        ))
                    })?
                    .into_owned();
                ensure_within(&root, &target)?;
                if let Some(parent) = target.parent() {
                    fs::create_dir_all(parent)?;
                }
                remove_existing(&target)?;
                make_symlink(&link, &target)?;
            }
            tar::EntryType::Regular | tar::EntryType::Continuous => {
                if let Some(parent) = target.parent() {
                    fs::create_dir_all(parent)?;
                }
                ensure_within(&root, &target)?;
                // Never write through a symlink left by an earlier entry
                if fs::symlink_metadata(&target)
                    .map(|m| m.file_type().is_symlink())
                    .unwrap_or(false)
                {
                    fs::remove_file(&target)?;
                }
                let mut out = File::create(&target)?;
                io::copy(&mut entry, &mut out)?;
                set_mode(&target, entry.header().mode().ok())?;
            }
            other => {
                debug!(entry = %name.display(), kind = ?other, "skipping unsupported entry");
                continue;
            }
        }
        written += 1;
    }

    debug!(archive = %archive_path.display(), entries = written, "archive extracted");
    Ok(())
}

fn remove_existing(target: &Path) -> Result<()> {
    match fs::symlink_metadata(target) {
        Ok(meta) if meta.is_dir() => fs::remove_dir_all(target)?,
        Ok(_) => fs::remove_file(target)?,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => return Err(e.into()),
    }
    Ok(())
}

#[cfg(unix)]
fn make_symlink(link: &Path, target: &Path) -> Result<()> {
    std::os::unix::fs::symlink(link, target)?;
    Ok(())
}

#[cfg(not(unix))]
fn make_symlink(link: &Path, target: &Path) -> Result<()> {
    debug!(link = %link.display(), target = %target.display(), "symlinks unsupported, skipping");
    Ok(())
}

#[cfg(unix)]
fn set_mode(path: &Path, mode: Option<u32>) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    if let Some(mode) = mode {
        fs::set_permissions(path, fs::Permissions::from_mode(mode & 0o7777))?;
    }
    Ok(())
}

#[cfg(not(unix))]
fn set_mode(_path: &Path, _mode: Option<u32>) -> Result<()> {
    Ok(())
}
