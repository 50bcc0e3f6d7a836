use super::metadata::BackupMetadata;
use super::options::BackupOptions;
use super::{
    default_output, join_error, write_json, Engine, MountArchive, CONTAINER_FILE,
    FILESYSTEM_FILE, IMAGE_FILE, METADATA_FILE, NETWORKS_DIR, NETWORK_CONFIGS_FILE, VOLUMES_DIR,
    VOLUME_CONFIGS_FILE,
};
use crate::archive::{create_archive, ArchiveSource};
use crate::runtime::{Mount, NetworkConfig, UnitInfo, VolumeConfig};
use crate::utils::{EngineError, OperationContext, Result};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
pub struct BackupRequest {
    /// Container id or name
    pub container: String,
    pub options: BackupOptions,
}

impl BackupRequest {
    pub fn new(container: impl Into<String>) -> Self {
        Self {
            container: container.into(),
            options: BackupOptions::default(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct BackupResult {
    pub archive_path: PathBuf,
    pub container_id: String,
    pub container_name: String,
    pub includes_volumes: bool,
    pub image_saved: bool,
    pub volume_configs: Vec<VolumeConfig>,
    pub network_configs: Vec<NetworkConfig>,
    pub metadata: BackupMetadata,
}

impl Engine {
    /// Capture one container into a single archive.
    ///
    /// Everything is staged in a scratch directory and packaged with one
    /// final archive call, so the output path only ever holds a complete
    /// backup.
    pub async fn backup(&self, request: BackupRequest) -> Result<BackupResult> {
        let container = request.container.trim();
        if container.is_empty() {
            return Err(EngineError::validation("container", "must not be empty"));
        }

        let level = request
            .options
            .compression_level
            .unwrap_or(self.config.backup.compression_level);
        if level > 9 {
            return Err(EngineError::validation("compression_level", "must be between 0 and 9"));
        }

        let raw = self
            .guarded("inspect container", self.adapter.inspect_unit(container))
            .await?;
        let info = UnitInfo::from_raw(raw).op("parse container config")?;

        let output = match request.options.output {
            Some(path) => path,
            None => default_output(&std::env::current_dir()?, &info.name, "backup"),
        };

        info!(container = %info.name, id = %info.id, output = %output.display(), "starting backup");

        let scratch = self.scratch_dir("backup-")?;
        let root = scratch.path();

        tokio::fs::write(root.join(CONTAINER_FILE), &info.raw)
            .await
            .op("write container config")?;

        self.guarded(
            "export filesystem",
            self.adapter
                .export_unit_filesystem(&info.id, &root.join(FILESYSTEM_FILE)),
        )
        .await?;

        let volumes_dir = root.join(VOLUMES_DIR);
        let includes_volumes = self.archive_mounts(&info.mounts, &volumes_dir, level).await?;

        let volume_configs = self.capture_volume_configs(&info.mounts).await?;
        if !volume_configs.is_empty() {
            write_json(&volumes_dir.join(VOLUME_CONFIGS_FILE), &volume_configs)
                .await
                .op("write volume configs")?;
        }

        let network_configs = self.capture_network_configs(&info).await?;
        if !network_configs.is_empty() {
            write_json(
                &root.join(NETWORKS_DIR).join(NETWORK_CONFIGS_FILE),
                &network_configs,
            )
            .await
            .op("write network configs")?;
        }

        let image_reference = self.save_image(&info, &root.join(IMAGE_FILE)).await?;
        let image_saved = image_reference.is_some();

        let metadata = BackupMetadata::new(&info, includes_volumes, image_reference);
        write_json(&root.join(METADATA_FILE), &metadata)
            .await
            .op("write metadata")?;

        let sources = package_sources(root);
        let dest = output.clone();
        self.blocking("create archive", move |cancel| {
            create_archive(&sources, &dest, level, &cancel)
        })
        .await?;

        info!(
            container = %info.name,
            archive = %output.display(),
            volumes = includes_volumes,
            image = image_saved,
            "backup complete"
        );

        Ok(BackupResult {
            archive_path: output,
            container_id: info.id,
            container_name: info.name,
            includes_volumes,
            image_saved,
            volume_configs,
            network_configs,
            metadata,
        })
    }

    /// Archive the data behind every volume and bind mount, up to
    /// `backup.archive_workers` at a time. Returns whether any mount was
    /// archived.
    async fn archive_mounts(&self, mounts: &[Mount], volumes_dir: &Path, level: u32) -> Result<bool> {
        let jobs: Vec<(PathBuf, MountArchive)> = mounts
            .iter()
            .filter_map(|m| MountArchive::for_mount(m).map(|a| (PathBuf::from(&m.source), a)))
            .collect();
        if jobs.is_empty() {
            return Ok(false);
        }
        tokio::fs::create_dir_all(volumes_dir).await?;

        let semaphore = Arc::new(Semaphore::new(self.config.backup.archive_workers.max(1)));
        let mut tasks = JoinSet::new();

        for (source, archive) in jobs {
            let sem = Arc::clone(&semaphore);
            let cancel = self.cancel.clone();
            let dest = volumes_dir.join(&archive.file_name);

            tasks.spawn(async move {
                let step = format!("archive mount {}", source.display());
                let _permit = tokio::select! {
                    permit = sem.acquire_owned() => permit.map_err(std::io::Error::other).op(&step)?,
                    _ = cancel.cancelled() => {
                        return Err(EngineError::operation(step, EngineError::Cancelled));
                    }
                };

                debug!(source = %source.display(), archive = %archive.file_name, "archiving mount");
                tokio::task::spawn_blocking(move || {
                    let sources = [ArchiveSource::new(source, archive.pseudo_root)];
                    create_archive(&sources, &dest, level, &cancel)
                })
                .await
                .map_err(join_error)
                .and_then(|result| result)
                .op(step)
            });
        }

        // Returning early drops the set, which aborts jobs still queued
        while let Some(joined) = tasks.join_next().await {
            joined.map_err(join_error)??;
        }
        Ok(true)
    }

    async fn capture_volume_configs(&self, mounts: &[Mount]) -> Result<Vec<VolumeConfig>> {
        let mut configs: Vec<VolumeConfig> = Vec::new();
        for mount in mounts.iter().filter(|m| m.is_named_volume()) {
            if configs.iter().any(|c| c.name == mount.name) {
                continue;
            }
            match self
                .guarded("inspect volume", self.adapter.inspect_volume(&mount.name))
                .await
            {
                Ok(config) => configs.push(config),
                Err(e) if e.is_cancelled() => return Err(e),
                Err(e) => warn!(volume = %mount.name, error = %e, "skipping volume config"),
            }
        }
        Ok(configs)
    }

    async fn capture_network_configs(&self, info: &UnitInfo) -> Result<Vec<NetworkConfig>> {
        let mut configs = Vec::new();
        for name in info.inspect.network_names() {
            match self
                .guarded("inspect network", self.adapter.inspect_network(&name))
                .await
            {
                Ok(config) => configs.push(config),
                Err(e) if e.is_cancelled() => return Err(e),
                Err(e) => warn!(network = %name, error = %e, "skipping network config"),
            }
        }
        Ok(configs)
    }

    /// Save the container's image next to the filesystem export and return
    /// the reference it was saved under. A failure only costs image fidelity,
    /// so it is logged and the partial file is removed.
    async fn save_image(&self, info: &UnitInfo, dest: &Path) -> Result<Option<String>> {
        let Some(reference) = info.inspect.image_reference() else {
            debug!(container = %info.name, "no image reference recorded");
            return Ok(None);
        };

        match self
            .guarded("save image", self.adapter.save_image(reference, dest))
            .await
        {
            Ok(()) => Ok(Some(reference.to_string())),
            Err(e) if e.is_cancelled() => Err(e),
            Err(e) => {
                warn!(image = %reference, error = %e, "image save failed, continuing without image.tar");
                if let Err(e) = tokio::fs::remove_file(dest).await {
                    if e.kind() != std::io::ErrorKind::NotFound {
                        warn!(path = %dest.display(), error = %e, "failed to remove partial image");
                    }
                }
                Ok(None)
            }
        }
    }
}

/// Scratch entries that make up the final archive, in archive order.
fn package_sources(root: &Path) -> Vec<ArchiveSource> {
    [
        CONTAINER_FILE,
        FILESYSTEM_FILE,
        VOLUMES_DIR,
        NETWORKS_DIR,
        METADATA_FILE,
        IMAGE_FILE,
    ]
    .iter()
    .map(|name| (root.join(name), *name))
    .filter(|(path, _)| path.exists())
    .map(|(path, name)| ArchiveSource::new(path, name))
    .collect()
}
