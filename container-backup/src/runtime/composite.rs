//! Adapter that pairs the CLI with the HTTP API.
//!
//! The CLI handles everything except the calls that need structured input:
//! full-spec container creation and volume/network ensure go to the API.

use super::api::ApiAdapter;
use super::cli::CliAdapter;
use super::inspect::UnitSpec;
use super::{
    Capability, Mount, NetworkConfig, ProjectContainerRef, RuntimeAdapter, UnitState, VolumeConfig,
};
use crate::utils::Result;
use async_trait::async_trait;
use std::path::Path;

pub struct CompositeAdapter {
    cli: CliAdapter,
    api: ApiAdapter,
}

impl CompositeAdapter {
    pub fn new(cli: CliAdapter, api: ApiAdapter) -> Self {
        Self { cli, api }
    }
}

#[async_trait]
impl RuntimeAdapter for CompositeAdapter {
    fn name(&self) -> &'static str {
        "composite"
    }

    async fn inspect_unit(&self, id: &str) -> Result<Vec<u8>> {
        self.cli.inspect_unit(id).await
    }

    async fn export_unit_filesystem(&self, id: &str, dest: &Path) -> Result<()> {
        self.cli.export_unit_filesystem(id, dest).await
    }

    async fn list_volumes(&self) -> Result<Vec<String>> {
        self.cli.list_volumes().await
    }

    async fn inspect_volume(&self, name: &str) -> Result<VolumeConfig> {
        self.cli.inspect_volume(name).await
    }

    async fn list_networks(&self) -> Result<Vec<String>> {
        self.cli.list_networks().await
    }

    async fn inspect_network(&self, name: &str) -> Result<NetworkConfig> {
        self.cli.inspect_network(name).await
    }

    async fn save_image(&self, reference: &str, dest: &Path) -> Result<()> {
        self.cli.save_image(reference, dest).await
    }

    async fn load_image(&self, archive: &Path) -> Result<()> {
        self.cli.load_image(archive).await
    }

    async fn tag_image(&self, source: &str, target: &str) -> Result<()> {
        self.cli.tag_image(source, target).await
    }

    async fn ensure_volume(&self, config: &VolumeConfig) -> Result<()> {
        self.api.ensure_volume(config).await
    }

    async fn ensure_network(&self, config: &NetworkConfig) -> Result<()> {
        self.api.ensure_network(config).await
    }

    async fn import_image(&self, archive: &Path, reference: Option<&str>) -> Result<String> {
        self.cli.import_image(archive, reference).await
    }

    async fn create_volume(&self, name: &str) -> Result<()> {
        self.cli.create_volume(name).await
    }

    async fn extract_into_volume(&self, volume: &str, archive: &Path, pseudo_root: &str) -> Result<()> {
        self.cli.extract_into_volume(volume, archive, pseudo_root).await
    }

    async fn create_unit(&self, image: &str, name: &str, mounts: &[Mount]) -> Result<String> {
        self.cli.create_unit(image, name, mounts).await
    }

    async fn create_unit_from_spec(&self, spec: &UnitSpec) -> Result<Capability<String>> {
        self.api.create_unit_from_spec(spec).await
    }

    async fn start_unit(&self, id: &str) -> Result<()> {
        self.cli.start_unit(id).await
    }

    async fn remove_unit(&self, name: &str) -> Result<()> {
        self.cli.remove_unit(name).await
    }

    async fn unit_state(&self, id: &str) -> Result<UnitState> {
        self.cli.unit_state(id).await
    }

    async fn list_project_units_by_label(&self, project: &str) -> Result<Vec<ProjectContainerRef>> {
        self.cli.list_project_units_by_label(project).await
    }

    async fn list_project_units_by_name(&self, project: &str) -> Result<Vec<ProjectContainerRef>> {
        self.cli.list_project_units_by_name(project).await
    }
}
