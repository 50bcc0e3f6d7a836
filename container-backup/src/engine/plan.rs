//! Dry-run: what a restore of an archive would do, without touching the
//! runtime.

use super::metadata::BackupMetadata;
use super::{
    read_json_or_default, Engine, MountArchive, CONTAINER_FILE, FILESYSTEM_FILE, IMAGE_FILE,
    METADATA_FILE, NETWORKS_DIR, NETWORK_CONFIGS_FILE, VOLUMES_DIR, VOLUME_CONFIGS_FILE,
};
use crate::archive::extract_archive;
use crate::runtime::{MountKind, NetworkConfig, UnitInfo, VolumeConfig};
use crate::utils::{OperationContext, Result};
use serde::Serialize;
use std::fmt;
use std::path::Path;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ImageSource {
    /// `image.tar` would be loaded
    SavedImage,
    /// `filesystem.tar` would be imported as a new image
    FilesystemImport,
    /// Neither artifact is present; a restore would fail
    Missing,
}

impl fmt::Display for ImageSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ImageSource::SavedImage => write!(f, "load {}", IMAGE_FILE),
            ImageSource::FilesystemImport => write!(f, "import {}", FILESYSTEM_FILE),
            ImageSource::Missing => write!(f, "missing"),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct PlannedMount {
    pub kind: MountKind,
    /// Volume name, or host path for binds
    pub source: String,
    pub destination: String,
    /// Data archive the mount is restored from, if one was kept
    pub archive: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RestorePlan {
    pub container_name: String,
    pub image_reference: Option<String>,
    pub image_source: ImageSource,
    pub entries: usize,
    pub env_count: usize,
    pub port_bindings: usize,
    pub mounts: Vec<PlannedMount>,
    pub networks: Vec<String>,
    pub network_configs: Vec<String>,
    pub volume_configs: Vec<String>,
    pub healthcheck: bool,
    pub metadata: Option<BackupMetadata>,
}

impl Engine {
    /// Inspect a backup and report what restoring it would involve.
    pub async fn dry_run(&self, archive: &Path) -> Result<RestorePlan> {
        let entries = self.list(archive).await?.len();

        let scratch = self.scratch_dir("dry-run-")?;
        let root = scratch.path().to_path_buf();
        let source = archive.to_path_buf();
        let dest = root.clone();
        self.blocking("extract backup", move |cancel| {
            extract_archive(&source, &dest, &cancel)
        })
        .await?;

        let raw = tokio::fs::read(root.join(CONTAINER_FILE))
            .await
            .op("read container config")?;
        let info = UnitInfo::from_raw(raw).op("parse container config")?;

        let image_source = if root.join(IMAGE_FILE).is_file() {
            ImageSource::SavedImage
        } else if root.join(FILESYSTEM_FILE).is_file() {
            ImageSource::FilesystemImport
        } else {
            ImageSource::Missing
        };

        let volumes_dir = root.join(VOLUMES_DIR);
        let mounts = info
            .mounts
            .iter()
            .map(|m| {
                let archive = MountArchive::for_mount(m)
                    .map(|a| a.file_name)
                    .filter(|name| volumes_dir.join(name).is_file());
                PlannedMount {
                    kind: m.kind,
                    source: if m.is_named_volume() { m.name.clone() } else { m.source.clone() },
                    destination: m.destination.clone(),
                    archive,
                }
            })
            .collect();

        let network_configs: Vec<NetworkConfig> =
            read_json_or_default(&root.join(NETWORKS_DIR).join(NETWORK_CONFIGS_FILE))
                .await
                .op("read network configs")?;
        let volume_configs: Vec<VolumeConfig> =
            read_json_or_default(&volumes_dir.join(VOLUME_CONFIGS_FILE))
                .await
                .op("read volume configs")?;
        let metadata: Option<BackupMetadata> = read_json_or_default(&root.join(METADATA_FILE))
            .await
            .op("read metadata")?;

        let inspect = &info.inspect;
        let env_count = inspect
            .config
            .as_ref()
            .and_then(|c| c.env.as_ref())
            .map_or(0, Vec::len);
        let port_bindings = inspect
            .host_config
            .as_ref()
            .and_then(|h| h.port_bindings.as_ref())
            .map_or(0, |ports| ports.values().flatten().map(Vec::len).sum());

        Ok(RestorePlan {
            container_name: info.name.clone(),
            image_reference: metadata
                .as_ref()
                .and_then(|m| m.image_reference.clone())
                .or_else(|| inspect.configured_image().map(str::to_string)),
            image_source,
            entries,
            env_count,
            port_bindings,
            mounts,
            networks: inspect.network_names(),
            network_configs: network_configs.into_iter().map(|n| n.name).collect(),
            volume_configs: volume_configs.into_iter().map(|v| v.name).collect(),
            healthcheck: inspect.declares_healthcheck(),
            metadata,
        })
    }
}

impl fmt::Display for RestorePlan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "container:      {}", self.container_name)?;
        writeln!(
            f,
            "image:          {} ({})",
            self.image_reference.as_deref().unwrap_or("-"),
            self.image_source
        )?;
        if let Some(metadata) = &self.metadata {
            writeln!(f, "created:        {}", metadata.created_at.to_rfc3339())?;
        }
        writeln!(f, "entries:        {}", self.entries)?;
        writeln!(f, "env vars:       {}", self.env_count)?;
        writeln!(f, "port bindings:  {}", self.port_bindings)?;
        writeln!(f, "health check:   {}", if self.healthcheck { "yes" } else { "no" })?;
        writeln!(f, "networks:       {}", join_or_dash(&self.networks))?;
        writeln!(f, "network defs:   {}", join_or_dash(&self.network_configs))?;
        writeln!(f, "volume defs:    {}", join_or_dash(&self.volume_configs))?;
        writeln!(f, "mounts:         {}", self.mounts.len())?;
        for mount in &self.mounts {
            writeln!(
                f,
                "  {:?} {} -> {} [{}]",
                mount.kind,
                mount.source,
                mount.destination,
                mount.archive.as_deref().unwrap_or("no data")
            )?;
        }
        Ok(())
    }
}

fn join_or_dash(items: &[String]) -> String {
    if items.is_empty() {
        "-".to_string()
    } else {
        items.join(", ")
    }
}
