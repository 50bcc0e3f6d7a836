//! Path helpers shared by the archive code and the engine.

use crate::utils::{EngineError, Result};
use std::path::{Component, Path, PathBuf};

/// Make a name safe to use as a single file name component.
///
/// Path separators, spaces, colons and tabs become `-`. An empty name becomes
/// `container`.
pub fn safe_name(name: &str) -> String {
    if name.is_empty() {
        return "container".to_string();
    }
    name.chars()
        .map(|c| match c {
            '/' | '\\' | ' ' | ':' | '\t' => '-',
            c => c,
        })
        .collect()
}

/// Join an archive entry name onto `base`, rejecting anything that would
/// resolve outside of it.
///
/// The name is normalized lexically: a leading `/` is dropped, `.` segments
/// are ignored and `..` pops a previously pushed segment. Popping past `base`
/// is a path-traversal error.
pub fn secure_join(base: &Path, name: &Path) -> Result<PathBuf> {
    let mut parts: Vec<&std::ffi::OsStr> = Vec::new();

    for component in name.components() {
        match component {
            Component::Normal(part) => parts.push(part),
            Component::CurDir | Component::RootDir => {}
            Component::ParentDir => {
                if parts.pop().is_none() {
                    return Err(EngineError::PathTraversal {
                        entry: name.to_path_buf(),
                    });
                }
            }
            Component::Prefix(_) => {
                return Err(EngineError::PathTraversal {
                    entry: name.to_path_buf(),
                })
            }
        }
    }

    let mut joined = base.to_path_buf();
    joined.extend(parts);
    Ok(joined)
}

/// Check that the deepest existing ancestor of `target` really lives inside
/// `root` once symlinks are resolved. `root` must already be canonical.
pub fn ensure_within(root: &Path, target: &Path) -> Result<()> {
    let mut probe = target.parent();
    while let Some(dir) = probe {
        if std::fs::symlink_metadata(dir).is_ok() {
            let resolved = dir.canonicalize()?;
            if !resolved.starts_with(root) {
                return Err(EngineError::PathTraversal {
                    entry: target.to_path_buf(),
                });
            }
            return Ok(());
        }
        probe = dir.parent();
    }
    Ok(())
}

/// Strip the pseudo-root directory from an entry name inside a per-mount
/// archive. Names outside the pseudo-root are returned unchanged.
pub fn strip_pseudo_root(name: &Path, pseudo_root: &str) -> PathBuf {
    if pseudo_root.is_empty() {
        return name.to_path_buf();
    }
    match name.strip_prefix(pseudo_root) {
        Ok(rest) => rest.to_path_buf(),
        Err(_) => name.to_path_buf(),
    }
}

/// Last path component as a string, or the whole path when there is none.
pub fn base_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| path.to_string_lossy().to_string())
}
