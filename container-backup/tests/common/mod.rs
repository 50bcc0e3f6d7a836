//! In-memory runtime used to drive the engine end to end.

#![allow(dead_code)]

use async_trait::async_trait;
use container_backup::archive::extract_archive_stripped;
use container_backup::runtime::inspect::UnitSpec;
use container_backup::runtime::{
    Capability, Mount, NetworkConfig, ProjectContainerRef, RuntimeAdapter, UnitState,
    VolumeConfig,
};
use container_backup::{EngineError, Result};
use ipnetwork::Ipv4Network;
use serde_json::{json, Value};
use std::collections::{BTreeMap, BTreeSet};
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use tokio_util::sync::CancellationToken;

#[derive(Default)]
pub struct FakeState {
    /// Inspect documents keyed by id
    pub containers: BTreeMap<String, Value>,
    pub volumes: BTreeMap<String, VolumeConfig>,
    pub networks: BTreeMap<String, NetworkConfig>,
    pub volume_creates: usize,
    pub network_creates: usize,
    pub fail_save: bool,
    pub fail_create: BTreeSet<String>,
    pub structured_create: bool,
    pub loaded: usize,
    pub imported: usize,
    pub tagged: Vec<(String, String)>,
    pub specs: Vec<UnitSpec>,
    pub simple_creates: Vec<(String, String, Vec<Mount>)>,
    pub started: Vec<String>,
    pub removed: Vec<String>,
    pub health: Option<String>,
    pub label_members: Vec<ProjectContainerRef>,
    pub name_members: Vec<ProjectContainerRef>,
    pub host_addrs: Vec<Ipv4Addr>,
    pub host_networks: Vec<Ipv4Network>,
}

pub struct FakeRuntime {
    state: Mutex<FakeState>,
    /// Where volume contents land on extract
    pub volume_root: PathBuf,
}

impl FakeRuntime {
    pub fn new(volume_root: &Path) -> Self {
        let state = FakeState {
            structured_create: true,
            health: Some("healthy".to_string()),
            host_addrs: vec![Ipv4Addr::LOCALHOST, Ipv4Addr::new(192, 168, 1, 20)],
            host_networks: vec![
                "127.0.0.0/8".parse().unwrap(),
                "172.17.0.0/16".parse().unwrap(),
                "192.168.1.0/24".parse().unwrap(),
            ],
            ..Default::default()
        };
        Self {
            state: Mutex::new(state),
            volume_root: volume_root.to_path_buf(),
        }
    }

    pub fn state(&self) -> MutexGuard<'_, FakeState> {
        self.state.lock().unwrap()
    }

    pub fn add_container(&self, doc: Value) {
        let id = doc["Id"].as_str().unwrap().to_string();
        self.state().containers.insert(id, doc);
    }

    pub fn add_network(&self, config: NetworkConfig) {
        self.state().networks.insert(config.name.clone(), config);
    }

    pub fn add_volume(&self, name: &str) {
        self.state().volumes.insert(
            name.to_string(),
            VolumeConfig {
                name: name.to_string(),
                driver: "local".to_string(),
                ..Default::default()
            },
        );
    }
}

/// Inspect document in the shape `docker inspect` prints.
pub fn inspect_doc(id: &str, name: &str, mounts: Value, networks: Value) -> Value {
    json!({
        "Id": id,
        "Name": format!("/{}", name),
        "Image": "sha256:feed",
        "Mounts": mounts,
        "Config": {"Image": "nginx:1.25", "Env": ["A=1", "B=2"], "Hostname": id},
        "HostConfig": {
            "PortBindings": {"80/tcp": [{"HostIp": "", "HostPort": "8080"}]},
            "Binds": [],
            "RestartPolicy": {"Name": "unless-stopped"}
        },
        "NetworkSettings": {"Networks": networks},
        "State": {"Status": "running"}
    })
}

#[async_trait]
impl RuntimeAdapter for FakeRuntime {
    fn name(&self) -> &'static str {
        "fake"
    }

    async fn inspect_unit(&self, id: &str) -> Result<Vec<u8>> {
        let state = self.state();
        let doc = state
            .containers
            .get(id)
            .or_else(|| {
                state
                    .containers
                    .values()
                    .find(|d| d["Name"].as_str() == Some(format!("/{}", id).as_str()))
            })
            .ok_or_else(|| EngineError::NotFound {
                resource: "container",
                name: id.to_string(),
            })?;
        Ok(serde_json::to_vec(&json!([doc]))?)
    }

    async fn export_unit_filesystem(&self, _id: &str, dest: &Path) -> Result<()> {
        std::fs::write(dest, b"rootfs")?;
        Ok(())
    }

    async fn list_volumes(&self) -> Result<Vec<String>> {
        Ok(self.state().volumes.keys().cloned().collect())
    }

    async fn inspect_volume(&self, name: &str) -> Result<VolumeConfig> {
        self.state()
            .volumes
            .get(name)
            .cloned()
            .ok_or_else(|| EngineError::NotFound {
                resource: "volume",
                name: name.to_string(),
            })
    }

    async fn list_networks(&self) -> Result<Vec<String>> {
        Ok(self.state().networks.keys().cloned().collect())
    }

    async fn inspect_network(&self, name: &str) -> Result<NetworkConfig> {
        self.state()
            .networks
            .get(name)
            .cloned()
            .ok_or_else(|| EngineError::NotFound {
                resource: "network",
                name: name.to_string(),
            })
    }

    async fn save_image(&self, reference: &str, dest: &Path) -> Result<()> {
        if self.state().fail_save {
            std::fs::write(dest, b"partial")?;
            return Err(EngineError::Api(format!("no such image: {}", reference)));
        }
        std::fs::write(dest, b"image")?;
        Ok(())
    }

    async fn load_image(&self, _archive: &Path) -> Result<()> {
        self.state().loaded += 1;
        Ok(())
    }

    async fn tag_image(&self, source: &str, target: &str) -> Result<()> {
        self.state()
            .tagged
            .push((source.to_string(), target.to_string()));
        Ok(())
    }

    async fn ensure_volume(&self, config: &VolumeConfig) -> Result<()> {
        let mut state = self.state();
        if !state.volumes.contains_key(&config.name) {
            state.volume_creates += 1;
            state.volumes.insert(config.name.clone(), config.clone());
        }
        Ok(())
    }

    async fn ensure_network(&self, config: &NetworkConfig) -> Result<()> {
        let mut state = self.state();
        if !state.networks.contains_key(&config.name) {
            state.network_creates += 1;
            state.networks.insert(config.name.clone(), config.clone());
        }
        Ok(())
    }

    async fn import_image(&self, _archive: &Path, _reference: Option<&str>) -> Result<String> {
        self.state().imported += 1;
        Ok("sha256:imported".to_string())
    }

    async fn create_volume(&self, name: &str) -> Result<()> {
        let mut state = self.state();
        if !state.volumes.contains_key(name) {
            state.volume_creates += 1;
            state.volumes.insert(
                name.to_string(),
                VolumeConfig {
                    name: name.to_string(),
                    ..Default::default()
                },
            );
        }
        Ok(())
    }

    async fn extract_into_volume(&self, volume: &str, archive: &Path, pseudo_root: &str) -> Result<()> {
        extract_archive_stripped(
            archive,
            &self.volume_root.join(volume),
            pseudo_root,
            &CancellationToken::new(),
        )
    }

    async fn create_unit(&self, image: &str, name: &str, mounts: &[Mount]) -> Result<String> {
        let mut state = self.state();
        if state.fail_create.contains(name) {
            return Err(EngineError::Api(format!("cannot create {}", name)));
        }
        state
            .simple_creates
            .push((image.to_string(), name.to_string(), mounts.to_vec()));
        Ok(format!("id-{}", name))
    }

    async fn create_unit_from_spec(&self, spec: &UnitSpec) -> Result<Capability<String>> {
        let mut state = self.state();
        if !state.structured_create {
            return Ok(Capability::Unsupported);
        }
        if state.fail_create.contains(&spec.name) {
            return Err(EngineError::Api(format!("cannot create {}", spec.name)));
        }
        state.specs.push(spec.clone());
        Ok(Capability::Supported(format!("id-{}", spec.name)))
    }

    async fn start_unit(&self, id: &str) -> Result<()> {
        self.state().started.push(id.to_string());
        Ok(())
    }

    async fn remove_unit(&self, name: &str) -> Result<()> {
        self.state().removed.push(name.to_string());
        Ok(())
    }

    async fn unit_state(&self, _id: &str) -> Result<UnitState> {
        Ok(UnitState {
            status: "running".to_string(),
            health: self.state().health.clone(),
        })
    }

    async fn host_ipv4_addrs(&self) -> Result<Vec<Ipv4Addr>> {
        Ok(self.state().host_addrs.clone())
    }

    async fn host_ipv4_networks(&self) -> Result<Vec<Ipv4Network>> {
        Ok(self.state().host_networks.clone())
    }

    async fn interface_ipv4(&self, interface: &str) -> Result<Option<Ipv4Addr>> {
        Ok((interface == "eth0").then(|| Ipv4Addr::new(192, 168, 1, 20)))
    }

    async fn list_project_units_by_label(&self, _project: &str) -> Result<Vec<ProjectContainerRef>> {
        Ok(self.state().label_members.clone())
    }

    async fn list_project_units_by_name(&self, _project: &str) -> Result<Vec<ProjectContainerRef>> {
        Ok(self.state().name_members.clone())
    }
}
