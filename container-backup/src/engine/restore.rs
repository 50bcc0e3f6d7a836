use super::metadata::BackupMetadata;
use super::options::RestoreOptions;
use super::policy::{self, HostFacts, PreparedUnit, Relocation};
use super::{
    check_archive_path, read_json_or_default, Engine, MountArchive, CONTAINER_FILE,
    FILESYSTEM_FILE, IMAGE_FILE, METADATA_FILE, NETWORKS_DIR, NETWORK_CONFIGS_FILE, VOLUMES_DIR,
    VOLUME_CONFIGS_FILE,
};
use crate::archive::{extract_archive, extract_archive_stripped};
use crate::runtime::{host, Capability, Mount, NetworkConfig, UnitInfo, VolumeConfig};
use crate::utils::{EngineError, OperationContext, Result};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
pub struct RestoreRequest {
    pub archive: PathBuf,
    pub options: RestoreOptions,
}

impl RestoreRequest {
    pub fn new(archive: impl Into<PathBuf>) -> Self {
        Self {
            archive: archive.into(),
            options: RestoreOptions::default(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RestoreResult {
    pub container_id: String,
    pub container_name: String,
    /// Image the container was created from
    pub image: String,
    /// The runtime could not take a full spec; only image, name and mounts
    /// were applied
    pub simple_create: bool,
    pub started: bool,
    /// The recorded configuration declares a health check
    pub has_healthcheck: bool,
    /// `Some` when a health wait ran: whether the container became healthy
    pub healthy: Option<bool>,
    pub relocations: Vec<Relocation>,
}

/// The reference `image.tar` was saved under, from `metadata.json`. Older or
/// unreadable metadata yields `None`.
async fn saved_image_reference(root: &Path) -> Option<String> {
    let raw = tokio::fs::read(root.join(METADATA_FILE)).await.ok()?;
    match serde_json::from_slice::<BackupMetadata>(&raw) {
        Ok(metadata) => metadata.image_reference.filter(|r| !r.is_empty()),
        Err(e) => {
            debug!(error = %e, "metadata unreadable, no saved image reference");
            None
        }
    }
}

impl Engine {
    /// Recreate a container from a single-container backup.
    pub async fn restore(&self, request: RestoreRequest) -> Result<RestoreResult> {
        check_archive_path(&request.archive)?;

        let scratch = self.scratch_dir("restore-")?;
        let root = scratch.path().to_path_buf();
        let archive = request.archive.clone();

        info!(archive = %archive.display(), "starting restore");
        let dest = root.clone();
        self.blocking("extract backup", move |cancel| {
            extract_archive(&archive, &dest, &cancel)
        })
        .await?;

        self.restore_extracted(&root, &request.options).await
    }

    async fn restore_extracted(&self, root: &Path, options: &RestoreOptions) -> Result<RestoreResult> {
        let raw = tokio::fs::read(root.join(CONTAINER_FILE))
            .await
            .op("read container config")?;
        let info = UnitInfo::from_raw(raw).op("parse container config")?;

        let image = self.materialize_image(root, &info).await?;

        let volume_configs: Vec<VolumeConfig> =
            read_json_or_default(&root.join(VOLUMES_DIR).join(VOLUME_CONFIGS_FILE))
                .await
                .op("read volume configs")?;
        let network_configs: Vec<NetworkConfig> =
            read_json_or_default(&root.join(NETWORKS_DIR).join(NETWORK_CONFIGS_FILE))
                .await
                .op("read network configs")?;

        let mut inspect = info.inspect.clone();
        policy::remap_networks(&mut inspect, &options.network_map);

        self.ensure_networks(network_configs, options).await?;
        self.ensure_volumes(&volume_configs).await?;

        let bind_root = self.bind_restore_root(options);
        self.restore_mount_data(root, &info.mounts, bind_root.as_deref())
            .await?;

        let facts = self.host_facts(options).await?;
        let prepared = policy::prepare_unit(&inspect, &image, options, &facts, bind_root.as_deref())
            .op("prepare container spec")?;

        if options.replace_existing {
            match self
                .guarded("remove existing container", self.adapter.remove_unit(&prepared.spec.name))
                .await
            {
                Ok(()) => debug!(container = %prepared.spec.name, "removed existing container"),
                Err(e) if e.is_cancelled() => return Err(e),
                Err(e) => debug!(container = %prepared.spec.name, error = %e, "nothing to replace"),
            }
        }

        let (container_id, simple_create) = self.create(&prepared, &info.mounts).await?;
        info!(container = %prepared.spec.name, id = %container_id, image = %image, "container created");

        let mut result = RestoreResult {
            container_id,
            container_name: prepared.spec.name,
            image,
            simple_create,
            started: false,
            has_healthcheck: info.inspect.declares_healthcheck(),
            healthy: None,
            relocations: prepared.relocations,
        };

        if options.start {
            self.guarded("start container", self.adapter.start_unit(&result.container_id))
                .await?;
            result.started = true;
            info!(container = %result.container_name, "container started");

            if options.wait_healthy {
                if result.has_healthcheck {
                    let timeout = self.wait_timeout(options);
                    result.healthy = Some(self.wait_healthy(&result.container_id, timeout).await?);
                } else {
                    debug!(container = %result.container_name, "no health check declared, not waiting");
                }
            }
        }

        Ok(result)
    }

    /// Produce a runnable image reference. A saved image is preferred; the
    /// filesystem export is imported when there is none or it fails to load.
    async fn materialize_image(&self, root: &Path, info: &UnitInfo) -> Result<String> {
        let image_tar = root.join(IMAGE_FILE);
        let filesystem_tar = root.join(FILESYSTEM_FILE);
        let configured = info.inspect.configured_image();

        let mut image = None;
        if image_tar.is_file() {
            match self
                .guarded("load image", self.adapter.load_image(&image_tar))
                .await
            {
                Ok(()) => {
                    // The recorded image id may predate a later tag move
                    image = match saved_image_reference(root).await {
                        Some(saved) => Some(saved),
                        None => Some(info.inspect.image.as_str())
                            .filter(|i| !i.is_empty())
                            .or(configured)
                            .map(str::to_string),
                    };
                }
                Err(e) if e.is_cancelled() => return Err(e),
                Err(e) => warn!(error = %e, "image load failed, importing filesystem instead"),
            }
        }

        let image = match image {
            Some(image) => image,
            None if filesystem_tar.is_file() => {
                self.guarded(
                    "import filesystem",
                    self.adapter.import_image(&filesystem_tar, None),
                )
                .await?
            }
            None => {
                return Err(EngineError::operation(
                    "materialize image",
                    EngineError::NotFound {
                        resource: "image artifact",
                        name: format!("{} or {}", IMAGE_FILE, FILESYSTEM_FILE),
                    },
                ))
            }
        };

        let Some(target) = configured.filter(|c| *c != image) else {
            return Ok(image);
        };
        match self
            .guarded("tag image", self.adapter.tag_image(&image, target))
            .await
        {
            Ok(()) => Ok(target.to_string()),
            Err(e) if e.is_cancelled() => Err(e),
            Err(e) => {
                warn!(image = %image, target = %target, error = %e, "re-tag failed, using image id");
                Ok(image)
            }
        }
    }

    pub(super) async fn ensure_networks(&self, configs: Vec<NetworkConfig>, options: &RestoreOptions) -> Result<()> {
        for mut config in configs {
            policy::prepare_network(&mut config, options, host::interface_exists);
            match self
                .guarded("ensure network", self.adapter.ensure_network(&config))
                .await
            {
                Ok(()) => debug!(network = %config.name, "network ready"),
                Err(e) if e.is_cancelled() => return Err(e),
                Err(e) => warn!(network = %config.name, error = %e, "failed to ensure network"),
            }
        }
        Ok(())
    }

    pub(super) async fn ensure_volumes(&self, configs: &[VolumeConfig]) -> Result<()> {
        for config in configs {
            match self
                .guarded("ensure volume", self.adapter.ensure_volume(config))
                .await
            {
                Ok(()) => debug!(volume = %config.name, "volume ready"),
                Err(e) if e.is_cancelled() => return Err(e),
                Err(e) => warn!(volume = %config.name, error = %e, "failed to ensure volume"),
            }
        }
        Ok(())
    }

    /// Put mount data back. Named volumes are created and filled through the
    /// runtime; host paths are unpacked in place, or under the relocation
    /// root when the original path is gone. A mount without a data archive
    /// is left empty.
    async fn restore_mount_data(&self, root: &Path, mounts: &[Mount], bind_root: Option<&Path>) -> Result<()> {
        let volumes_dir = root.join(VOLUMES_DIR);

        for mount in mounts {
            self.check_cancelled()?;
            let Some(archive) = MountArchive::for_mount(mount) else {
                continue;
            };
            let data = volumes_dir.join(&archive.file_name);

            if mount.is_named_volume() {
                self.guarded(
                    &format!("create volume {}", mount.name),
                    self.adapter.create_volume(&mount.name),
                )
                .await?;
                if data.is_file() {
                    self.guarded(
                        &format!("restore volume {}", mount.name),
                        self.adapter
                            .extract_into_volume(&mount.name, &data, &archive.pseudo_root),
                    )
                    .await?;
                    info!(volume = %mount.name, "volume data restored");
                } else {
                    debug!(volume = %mount.name, "no data archive for volume");
                }
                continue;
            }

            let source = Path::new(&mount.source);
            let target = match bind_root {
                Some(relocation_root) if !source.exists() => {
                    policy::relocated_source(relocation_root, &mount.source)
                }
                _ => source.to_path_buf(),
            };
            if target.exists() && !target.is_dir() {
                warn!(target = %target.display(), "bind target is not a directory, skipping data");
                continue;
            }
            tokio::fs::create_dir_all(&target)
                .await
                .op(format!("create bind source {}", target.display()))?;

            if !data.is_file() {
                debug!(target = %target.display(), "no data archive for bind mount");
                continue;
            }

            let step = format!("restore bind {}", target.display());
            let pseudo_root = archive.pseudo_root.clone();
            let dest = target.clone();
            self.blocking(&step, move |cancel| {
                extract_archive_stripped(&data, &dest, &pseudo_root, &cancel)
            })
            .await?;
            info!(target = %target.display(), "bind data restored");
        }
        Ok(())
    }

    async fn host_facts(&self, options: &RestoreOptions) -> Result<HostFacts> {
        let addrs = self
            .guarded("list host addresses", self.adapter.host_ipv4_addrs())
            .await?;
        let networks = self
            .guarded("list host networks", self.adapter.host_ipv4_networks())
            .await?;

        let bind_ip = match (options.force_bind_ip, options.bind_interface.as_deref()) {
            (Some(ip), _) => Some(ip),
            (None, Some(interface)) => {
                let ip = self
                    .guarded("resolve bind interface", self.adapter.interface_ipv4(interface))
                    .await?;
                if ip.is_none() {
                    warn!(interface = %interface, "interface has no IPv4 address, keeping port bindings");
                }
                ip
            }
            (None, None) => None,
        };

        Ok(HostFacts {
            addrs,
            networks,
            bind_ip,
        })
    }

    /// Create the container from the full spec, or from image, name and
    /// mounts when the runtime cannot take a full spec.
    async fn create(&self, prepared: &PreparedUnit, mounts: &[Mount]) -> Result<(String, bool)> {
        let spec = &prepared.spec;
        match self
            .guarded("create container", self.adapter.create_unit_from_spec(spec))
            .await?
        {
            Capability::Supported(id) => Ok((id, false)),
            Capability::Unsupported => {
                warn!(container = %spec.name, "structured create unavailable, creating from image and mounts only");
                let mounts: Vec<Mount> = mounts
                    .iter()
                    .map(|m| {
                        let mut mount = m.clone();
                        if let Some(r) = prepared.relocations.iter().find(|r| r.from == m.source) {
                            mount.source = r.to.clone();
                        }
                        mount
                    })
                    .collect();
                let id = self
                    .guarded(
                        "create container",
                        self.adapter.create_unit(spec.image(), &spec.name, &mounts),
                    )
                    .await?;
                Ok((id, true))
            }
        }
    }

    /// Poll until the container is healthy, stops, or `timeout` passes.
    /// Returns whether it became healthy.
    pub(crate) async fn wait_healthy(&self, id: &str, timeout: Duration) -> Result<bool> {
        let interval = Duration::from_secs(self.config.restore.health_poll_interval_secs.max(1));
        let deadline = Instant::now() + timeout;
        info!(container = %id, timeout_secs = timeout.as_secs(), "waiting for container to become healthy");

        loop {
            let state = self
                .guarded("poll container health", self.adapter.unit_state(id))
                .await?;
            if state.is_healthy() {
                info!(container = %id, "container is healthy");
                return Ok(true);
            }
            if state.is_stopped() {
                warn!(container = %id, status = %state.status, "container stopped before becoming healthy");
                return Ok(false);
            }
            if Instant::now() >= deadline {
                warn!(container = %id, health = ?state.health, "timed out waiting for health");
                return Ok(false);
            }

            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                _ = self.cancel.cancelled() => {
                    return Err(EngineError::operation("wait for health", EngineError::Cancelled));
                }
            }
        }
    }

    pub(crate) fn wait_timeout(&self, options: &RestoreOptions) -> Duration {
        options
            .wait_timeout
            .unwrap_or_else(|| Duration::from_secs(self.config.restore.wait_timeout_secs))
    }

    fn bind_restore_root(&self, options: &RestoreOptions) -> Option<PathBuf> {
        options
            .bind_restore_root
            .clone()
            .or_else(|| self.config.restore.default_bind_restore_root.clone())
    }
}
