//! Container runtime capability interface.
//!
//! The engine never talks to a runtime directly. It drives a
//! [`RuntimeAdapter`], which comes in three flavors:
//! - [`cli::CliAdapter`] execs the `docker` binary
//! - [`api::ApiAdapter`] speaks the Docker Engine HTTP API
//! - [`composite::CompositeAdapter`] uses the CLI for most calls and the API
//!   for structured creation and resource ensure
//!
//! [`connect`] picks one at startup.

pub mod api;
pub mod cli;
pub mod composite;
pub mod host;
pub mod inspect;

use crate::archive::extract_archive_stripped;
use crate::config::RuntimeConfig;
use crate::utils::{EngineError, Result};
use async_trait::async_trait;
use inspect::{nullable, UnitInspect, UnitSpec};
use ipnetwork::Ipv4Network;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Label compose puts on every member container.
pub const PROJECT_LABEL: &str = "com.docker.compose.project";

/// Label compose uses to record a member's service name.
pub const SERVICE_LABEL: &str = "com.docker.compose.service";

/// Outcome of a call an adapter may only partially implement.
///
/// `Unsupported` means "take the fallback path". A call that was attempted
/// and failed is an `Err`, never `Unsupported`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Capability<T> {
    Supported(T),
    Unsupported,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MountKind {
    Volume,
    Bind,
    Other,
}

impl From<&str> for MountKind {
    fn from(kind: &str) -> Self {
        match kind {
            "volume" => MountKind::Volume,
            "bind" => MountKind::Bind,
            _ => MountKind::Other,
        }
    }
}

/// Storage attached to a container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Mount {
    /// Volume name, empty for binds and anonymous volumes
    pub name: String,
    pub source: String,
    pub destination: String,
    pub kind: MountKind,
    pub rw: bool,
}

impl Mount {
    /// A named volume. Anonymous volumes are archived like binds.
    pub fn is_named_volume(&self) -> bool {
        self.kind == MountKind::Volume && !self.name.is_empty()
    }

    /// A host path whose contents travel as a bind archive.
    pub fn is_host_path(&self) -> bool {
        !self.source.is_empty()
            && (self.kind == MountKind::Bind
                || (self.kind == MountKind::Volume && self.name.is_empty()))
    }
}

impl From<&inspect::MountPoint> for Mount {
    fn from(point: &inspect::MountPoint) -> Self {
        Mount {
            name: point.name.clone(),
            source: point.source.clone(),
            destination: point.destination.clone(),
            kind: MountKind::from(point.kind.as_str()),
            rw: point.rw,
        }
    }
}

/// Snapshot of one container.
#[derive(Debug, Clone)]
pub struct UnitInfo {
    pub id: String,
    /// Display name without the runtime's leading `/`
    pub name: String,
    pub mounts: Vec<Mount>,
    /// The inspect document exactly as the runtime returned it
    pub raw: Vec<u8>,
    pub inspect: UnitInspect,
}

impl UnitInfo {
    pub fn from_raw(raw: Vec<u8>) -> Result<Self> {
        let inspect = UnitInspect::parse(&raw)?;
        Ok(UnitInfo {
            id: inspect.id.clone(),
            name: inspect.name.clone(),
            mounts: inspect.mounts.iter().map(Mount::from).collect(),
            raw,
            inspect,
        })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeConfig {
    #[serde(rename = "Name", default, deserialize_with = "nullable")]
    pub name: String,

    #[serde(rename = "Driver", default, deserialize_with = "nullable")]
    pub driver: String,

    #[serde(rename = "Options", default, deserialize_with = "nullable")]
    pub options: BTreeMap<String, String>,

    #[serde(rename = "Labels", default, deserialize_with = "nullable")]
    pub labels: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkConfig {
    #[serde(rename = "Name", default, deserialize_with = "nullable")]
    pub name: String,

    #[serde(rename = "Driver", default, deserialize_with = "nullable")]
    pub driver: String,

    #[serde(rename = "Options", default, deserialize_with = "nullable")]
    pub options: BTreeMap<String, String>,

    #[serde(rename = "Internal", default)]
    pub internal: bool,

    #[serde(rename = "Attachable", default)]
    pub attachable: bool,

    #[serde(rename = "Ingress", default)]
    pub ingress: bool,

    #[serde(rename = "IPAM", default)]
    pub ipam: Ipam,

    #[serde(rename = "Labels", default, deserialize_with = "nullable")]
    pub labels: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ipam {
    #[serde(rename = "Driver", default, deserialize_with = "nullable")]
    pub driver: String,

    #[serde(rename = "Config", default, deserialize_with = "nullable")]
    pub config: Vec<IpamConfig>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IpamConfig {
    #[serde(rename = "Subnet", default, deserialize_with = "nullable")]
    pub subnet: String,

    #[serde(rename = "Gateway", default, deserialize_with = "nullable")]
    pub gateway: String,

    #[serde(rename = "IPRange", default, deserialize_with = "nullable")]
    pub ip_range: String,
}

/// A container that belongs to a compose project.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProjectContainerRef {
    pub service: String,
    pub id: String,
    pub container_name: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UnitState {
    pub status: String,
    /// Health status, `None` when the container has no health check
    pub health: Option<String>,
}

impl UnitState {
    /// The container is gone or no longer running.
    pub fn is_stopped(&self) -> bool {
        matches!(self.status.as_str(), "exited" | "dead" | "removing")
    }

    pub fn is_healthy(&self) -> bool {
        self.health.as_deref() == Some("healthy")
    }
}

/// Everything the engine needs from a container runtime.
#[async_trait]
pub trait RuntimeAdapter: Send + Sync {
    /// Short label for logs
    fn name(&self) -> &'static str;

    /// Raw inspect document for a container.
    async fn inspect_unit(&self, id: &str) -> Result<Vec<u8>>;

    /// Write the container's root filesystem as a tar file at `dest`.
    async fn export_unit_filesystem(&self, id: &str, dest: &Path) -> Result<()>;

    async fn list_volumes(&self) -> Result<Vec<String>>;

    async fn inspect_volume(&self, name: &str) -> Result<VolumeConfig>;

    async fn list_networks(&self) -> Result<Vec<String>>;

    async fn inspect_network(&self, name: &str) -> Result<NetworkConfig>;

    async fn save_image(&self, reference: &str, dest: &Path) -> Result<()>;

    async fn load_image(&self, archive: &Path) -> Result<()>;

    async fn tag_image(&self, source: &str, target: &str) -> Result<()>;

    /// Create the volume with its captured driver, options and labels unless
    /// one with that name already exists.
    async fn ensure_volume(&self, config: &VolumeConfig) -> Result<()>;

    /// Create the network from its captured definition unless one with that
    /// name already exists.
    async fn ensure_network(&self, config: &NetworkConfig) -> Result<()>;

    /// Import a filesystem tar as a new image and return its id.
    async fn import_image(&self, archive: &Path, reference: Option<&str>) -> Result<String>;

    async fn create_volume(&self, name: &str) -> Result<()>;

    /// Unpack a per-mount data archive into a volume, dropping `pseudo_root`.
    async fn extract_into_volume(&self, volume: &str, archive: &Path, pseudo_root: &str)
        -> Result<()>;

    /// Create a container from an image, a name and a mount list only.
    async fn create_unit(&self, image: &str, name: &str, mounts: &[Mount]) -> Result<String>;

    /// Create a container from a full specification.
    async fn create_unit_from_spec(&self, spec: &UnitSpec) -> Result<Capability<String>>;

    async fn start_unit(&self, id: &str) -> Result<()>;

    /// Force-remove a container by name or id.
    async fn remove_unit(&self, name: &str) -> Result<()>;

    async fn unit_state(&self, id: &str) -> Result<UnitState>;

    async fn host_ipv4_addrs(&self) -> Result<Vec<Ipv4Addr>> {
        host::ipv4_addrs()
    }

    async fn host_ipv4_networks(&self) -> Result<Vec<Ipv4Network>> {
        host::ipv4_networks()
    }

    async fn interface_ipv4(&self, interface: &str) -> Result<Option<Ipv4Addr>> {
        host::interface_ipv4(interface)
    }

    /// Members of a compose project found through the project label.
    async fn list_project_units_by_label(&self, project: &str) -> Result<Vec<ProjectContainerRef>>;

    /// Members of a compose project guessed from container names.
    async fn list_project_units_by_name(&self, project: &str) -> Result<Vec<ProjectContainerRef>>;
}

/// Recover a service name from a compose container name.
///
/// Compose names members `<project>_<service>_<n>` (or with `-` in newer
/// releases). Returns `None` when the name does not follow that shape for
/// `project`.
pub fn service_from_name(project: &str, container_name: &str) -> Option<String> {
    let name = container_name.trim_start_matches('/');
    let rest = name
        .strip_prefix(project)
        .and_then(|r| r.strip_prefix('_').or_else(|| r.strip_prefix('-')))?;

    let separator = if name.as_bytes().get(project.len()) == Some(&b'_') { '_' } else { '-' };
    let (service, index) = rest.rsplit_once(separator)?;
    if service.is_empty() || index.is_empty() || !index.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    Some(service.to_string())
}

/// Unpack a per-mount archive into a fresh temporary directory so a helper
/// container can copy it into a volume. The archive is checked for path
/// traversal before anything reaches the volume.
pub(crate) async fn stage_volume_data(archive: &Path, pseudo_root: &str) -> Result<TempDir> {
    let staging = tempfile::Builder::new().prefix("volume-data-").tempdir()?;
    let dest: PathBuf = staging.path().to_path_buf();
    let archive = archive.to_path_buf();
    let root = pseudo_root.to_string();

    tokio::task::spawn_blocking(move || {
        extract_archive_stripped(&archive, &dest, &root, &CancellationToken::new())
    })
    .await
    .map_err(|e| EngineError::Api(format!("volume staging task failed: {e}")))??;

    Ok(staging)
}

/// The HTTP endpoint to try for the engine API: the configured one, else a
/// `tcp://` `DOCKER_HOST`. Socket hosts stay with the CLI, which reaches
/// them on its own.
pub fn api_endpoint(configured: Option<&str>, docker_host: Option<&str>) -> Option<String> {
    if let Some(url) = configured.filter(|u| !u.is_empty()) {
        return Some(url.to_string());
    }
    let host = docker_host?.trim();
    if let Some(addr) = host.strip_prefix("tcp://") {
        return Some(format!("http://{}", addr));
    }
    (host.starts_with("http://") || host.starts_with("https://")).then(|| host.to_string())
}

/// Pick an adapter for `config`.
///
/// With an API endpoint configured and answering, the composite adapter is
/// used. Otherwise everything goes through the CLI, which creates from the
/// full spec as well.
pub async fn connect(config: &RuntimeConfig) -> Result<Arc<dyn RuntimeAdapter>> {
    let cli = cli::CliAdapter::new(&config.docker_bin, &config.helper_image);

    let docker_host = std::env::var("DOCKER_HOST").ok();
    let Some(url) = api_endpoint(config.api_url.as_deref(), docker_host.as_deref()) else {
        info!(program = %config.docker_bin, "using CLI runtime adapter");
        return Ok(Arc::new(cli));
    };

    let api = api::ApiAdapter::new(&url, &config.helper_image)?;
    match api.ping().await {
        Ok(()) => {
            info!(url = %url, "using composite runtime adapter");
            Ok(Arc::new(composite::CompositeAdapter::new(cli, api)))
        }
        Err(e) => {
            warn!(url = %url, error = %e, "runtime API unreachable, using CLI only");
            Ok(Arc::new(cli))
        }
    }
}
