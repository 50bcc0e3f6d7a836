//! Backup, restore and validation of containers and compose projects.
//!
//! An [`Engine`] holds no state between calls. Each call owns a private
//! scratch directory that is removed when the call returns, whatever the
//! outcome. Runtime work goes through the [`RuntimeAdapter`]; archive work
//! runs on the blocking pool. Every wait observes the engine's
//! [`CancellationToken`].

mod backup;
pub mod metadata;
pub mod options;
pub mod plan;
pub mod policy;
mod project;
mod restore;

pub use backup::{BackupRequest, BackupResult};
pub use metadata::{BackupMetadata, ProjectMetadata};
pub use options::{BackupOptions, RestoreOptions};
pub use plan::{ImageSource, PlannedMount, RestorePlan};
pub use project::{
    MemberOutcome, ProjectBackupRequest, ProjectBackupResult, ProjectRestoreRequest,
    ProjectRestoreResult,
};
pub use restore::{RestoreRequest, RestoreResult};

use crate::archive::{list_archive, ArchiveEntry};
use crate::config::Config;
use crate::fs::paths::{base_name, safe_name};
use crate::runtime::{Mount, RuntimeAdapter};
use crate::utils::{EngineError, OperationContext, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

pub const CONTAINER_FILE: &str = "container.json";
pub const FILESYSTEM_FILE: &str = "filesystem.tar";
pub const METADATA_FILE: &str = "metadata.json";
pub const IMAGE_FILE: &str = "image.tar";
pub const VOLUMES_DIR: &str = "volumes";
pub const NETWORKS_DIR: &str = "networks";
pub const VOLUME_CONFIGS_FILE: &str = "volume_configs.json";
pub const NETWORK_CONFIGS_FILE: &str = "network_configs.json";

/// Top-level entries every single-container backup must have.
pub const REQUIRED_ENTRIES: [&str; 3] = [CONTAINER_FILE, FILESYSTEM_FILE, METADATA_FILE];

/// Outcome of [`Engine::validate`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ValidationResult {
    pub valid: bool,
    pub details: String,
    pub missing: Vec<String>,
}

/// File name and pseudo-root of the data archive kept for one mount.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountArchive {
    pub file_name: String,
    pub pseudo_root: String,
}

impl MountArchive {
    /// Named volumes are stored as `<name>.tar.gz` under the volume name,
    /// host paths as `bind_<basename>.tar.gz` under the basename. Other
    /// mounts (tmpfs, npipe) carry no data.
    pub fn for_mount(mount: &Mount) -> Option<Self> {
        if mount.is_named_volume() {
            return Some(MountArchive {
                file_name: format!("{}.tar.gz", safe_name(&mount.name)),
                pseudo_root: mount.name.clone(),
            });
        }
        if mount.is_host_path() {
            let base = base_name(Path::new(&mount.source));
            return Some(MountArchive {
                file_name: format!("bind_{}.tar.gz", safe_name(&base)),
                pseudo_root: base,
            });
        }
        None
    }
}

pub struct Engine {
    adapter: Arc<dyn RuntimeAdapter>,
    config: Config,
    cancel: CancellationToken,
}

impl Engine {
    /// Create an engine that can only be cancelled by dropping its futures.
    pub fn new(adapter: Arc<dyn RuntimeAdapter>, config: Config) -> Self {
        Self::with_cancel(adapter, config, CancellationToken::new())
    }

    /// Create an engine whose work stops when `cancel` fires.
    pub fn with_cancel(
        adapter: Arc<dyn RuntimeAdapter>,
        config: Config,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            adapter,
            config,
            cancel,
        }
    }

    pub fn adapter(&self) -> &dyn RuntimeAdapter {
        self.adapter.as_ref()
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// List every entry of an archive.
    pub async fn list(&self, archive: &Path) -> Result<Vec<ArchiveEntry>> {
        check_archive_path(archive)?;
        let archive = archive.to_path_buf();
        self.blocking("list archive", move |cancel| list_archive(&archive, &cancel))
            .await
    }

    /// Check that an archive has the entries a restore cannot do without.
    /// Optional artifacts (volumes, networks, image) are never required.
    pub async fn validate(&self, archive: &Path) -> Result<ValidationResult> {
        let entries = self.list(archive).await?;
        let names: Vec<&str> = entries
            .iter()
            .map(|e| e.path.trim_start_matches("./"))
            .collect();

        let missing: Vec<String> = REQUIRED_ENTRIES
            .iter()
            .filter(|required| !names.contains(*required))
            .map(|required| required.to_string())
            .collect();

        let details = if missing.is_empty() {
            "backup structure is valid".to_string()
        } else {
            format!("missing required entries: [{}]", missing.join(" "))
        };

        Ok(ValidationResult {
            valid: missing.is_empty(),
            details,
            missing,
        })
    }

    /// Await a runtime call, giving up as soon as the engine is cancelled.
    /// Errors are wrapped with `step`.
    async fn guarded<T, F>(&self, step: &str, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        tokio::select! {
            result = fut => result.op(step),
            _ = self.cancel.cancelled() => Err(EngineError::operation(step, EngineError::Cancelled)),
        }
    }

    /// Run archive or filesystem work on the blocking pool.
    async fn blocking<T, F>(&self, step: &str, work: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(CancellationToken) -> Result<T> + Send + 'static,
    {
        let cancel = self.cancel.clone();
        tokio::task::spawn_blocking(move || work(cancel))
            .await
            .map_err(join_error)
            .and_then(|result| result)
            .op(step)
    }

    /// Private scratch directory, removed when the returned guard drops.
    fn scratch_dir(&self, prefix: &str) -> Result<TempDir> {
        let mut builder = tempfile::Builder::new();
        builder.prefix(prefix);
        let dir = match &self.config.backup.scratch_dir {
            Some(parent) => {
                std::fs::create_dir_all(parent)?;
                builder.tempdir_in(parent)?
            }
            None => builder.tempdir()?,
        };
        Ok(dir)
    }

    fn check_cancelled(&self) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(EngineError::Cancelled);
        }
        Ok(())
    }
}

fn check_archive_path(archive: &Path) -> Result<()> {
    if archive.as_os_str().is_empty() {
        return Err(EngineError::validation("archive", "must not be empty"));
    }
    if !archive.is_file() {
        return Err(EngineError::NotFound {
            resource: "archive",
            name: archive.display().to_string(),
        });
    }
    Ok(())
}

pub(crate) fn join_error(e: tokio::task::JoinError) -> EngineError {
    EngineError::Io(std::io::Error::other(e))
}

async fn write_json<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<()> {
    let data = serde_json::to_vec_pretty(value)?;
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    tokio::fs::write(path, data).await?;
    Ok(())
}

/// Read a JSON file, treating an absent file as the default value.
async fn read_json_or_default<T: DeserializeOwned + Default>(path: &Path) -> Result<T> {
    match tokio::fs::read(path).await {
        Ok(data) => Ok(serde_json::from_slice(&data)?),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(T::default()),
        Err(e) => Err(e.into()),
    }
}

fn default_output(dir: &Path, name: &str, suffix: &str) -> PathBuf {
    dir.join(format!("{}_{}.tar.gz", safe_name(name), suffix))
}
