use super::ArchiveSource;
use crate::fs::paths::base_name;
use crate::fs::walker::walk_directory;
use crate::utils::{EngineError, Result};
use flate2::write::GzEncoder;
use flate2::Compression;
use std::io::Write;
use std::path::Path;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Package `sources` into a gzip-compressed tar archive at `dest`.
///
/// The archive is written to a temporary file next to `dest` and renamed into
/// place only after the last entry is flushed, so a failed or cancelled call
/// never leaves a partial archive at `dest`.
pub fn create_archive(
    sources: &[ArchiveSource],
    dest: &Path,
    compression_level: u32,
    cancel: &CancellationToken,
) -> Result<()> {
    if sources.is_empty() {
        return Err(EngineError::validation("sources", "must not be empty"));
    }

    let parent = match dest.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => std::env::current_dir()?,
    };
    std::fs::create_dir_all(&parent)?;

    let staging = tempfile::Builder::new()
        .prefix(".partial-")
        .suffix(".tar.gz")
        .tempfile_in(&parent)?;

    let encoder = GzEncoder::new(staging.as_file(), Compression::new(compression_level.min(9)));
    let mut builder = tar::Builder::new(encoder);
    builder.follow_symlinks(false);

    for source in sources {
        if cancel.is_cancelled() {
            return Err(EngineError::Cancelled);
        }
        append_source(&mut builder, source, cancel)?;
    }

    let mut encoder = builder.into_inner()?;
    encoder.flush()?;
    encoder.finish()?;

    staging.persist(dest).map_err(|e| EngineError::Io(e.error))?;
    debug!(archive = %dest.display(), "archive written");
    Ok(())
}

fn append_source<W: Write>(
    builder: &mut tar::Builder<W>,
    source: &ArchiveSource,
    cancel: &CancellationToken,
) -> Result<()> {
    let metadata = std::fs::symlink_metadata(&source.path)?;
    let root_name = match source.dest_path.as_deref() {
        Some(name) if !name.is_empty() => name.trim_end_matches('/').to_string(),
        _ => base_name(&source.path),
    };

    if !metadata.is_dir() {
        return append_entry(builder, &source.path, &root_name, metadata.is_file(), metadata.file_type().is_symlink());
    }

    walk_directory(&source.path, cancel, |info| {
        let name = if info.relative_path.as_os_str().is_empty() {
            root_name.clone()
        } else {
            format!(
                "{}/{}",
                root_name,
                info.relative_path.to_string_lossy().replace('\\', "/")
            )
        };

        if info.is_dir {
            builder.append_path_with_name(&info.path, &name)?;
            return Ok(());
        }
        append_entry(builder, &info.path, &name, info.is_file, info.is_symlink)
    })
}

fn append_entry<W: Write>(
    builder: &mut tar::Builder<W>,
    path: &Path,
    name: &str,
    is_file: bool,
    is_symlink: bool,
) -> Result<()> {
    if is_file || is_symlink {
        builder.append_path_with_name(path, name)?;
    } else {
        // Sockets, fifos and device nodes have no place in a data archive
        debug!(path = %path.display(), "skipping special file");
    }
    Ok(())
}
