//! Runtime adapter for the Docker Engine HTTP API.
//!
//! Talks to a TCP endpoint (`http://host:2375`). Large payloads (exports,
//! image tars) are streamed to and from disk rather than buffered.

use super::inspect::{UnitInspect, UnitSpec};
use super::{
    service_from_name, stage_volume_data, Capability, Mount, MountKind, NetworkConfig,
    ProjectContainerRef, RuntimeAdapter, UnitState, VolumeConfig, PROJECT_LABEL, SERVICE_LABEL,
};
use crate::utils::{EngineError, Result};
use async_trait::async_trait;
use futures_util::StreamExt;
use reqwest::{Body, Client, Response, StatusCode};
use serde::Deserialize;
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio_util::io::ReaderStream;
use tracing::debug;

pub struct ApiAdapter {
    client: Client,
    base_url: String,
    helper_image: String,
}

#[derive(Debug, Deserialize)]
struct ContainerSummary {
    #[serde(rename = "Id")]
    id: String,
    #[serde(rename = "Names", default)]
    names: Vec<String>,
    #[serde(rename = "Labels", default)]
    labels: Option<BTreeMap<String, String>>,
}

#[derive(Debug, Deserialize)]
struct NameOnly {
    #[serde(rename = "Name")]
    name: String,
}

#[derive(Debug, Deserialize)]
struct VolumeList {
    #[serde(rename = "Volumes", default)]
    volumes: Option<Vec<NameOnly>>,
}

#[derive(Debug, Deserialize)]
struct CreatedResponse {
    #[serde(rename = "Id")]
    id: String,
}

#[derive(Debug, Deserialize)]
struct WaitResponse {
    #[serde(rename = "StatusCode")]
    status_code: i64,
}

/// Split `repo[:tag]` into its parts. A `:` inside a registry host
/// (`registry:5000/app`) is not a tag separator.
fn split_reference(reference: &str) -> (&str, &str) {
    match reference.rsplit_once(':') {
        Some((repo, tag)) if !tag.contains('/') => (repo, tag),
        _ => (reference, "latest"),
    }
}

impl ApiAdapter {
    pub fn new(base_url: &str, helper_image: &str) -> Result<Self> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            helper_image: helper_image.to_string(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    pub async fn ping(&self) -> Result<()> {
        let resp = self
            .client
            .get(self.url("/_ping"))
            .timeout(Duration::from_secs(5))
            .send()
            .await?;
        check(resp, "ping").await?;
        Ok(())
    }

    async fn get_json<T: serde::de::DeserializeOwned>(&self, path: &str, what: &str) -> Result<T> {
        let resp = self.client.get(self.url(path)).send().await?;
        Ok(check(resp, what).await?.json().await?)
    }

    async fn exists(&self, path: &str) -> Result<bool> {
        let resp = self.client.get(self.url(path)).send().await?;
        match resp.status() {
            StatusCode::NOT_FOUND => Ok(false),
            s if s.is_success() => Ok(true),
            _ => Err(api_error(resp, "lookup").await),
        }
    }

    async fn post_json(&self, path: &str, query: &[(&str, &str)], body: &Value, what: &str) -> Result<Response> {
        let resp = self
            .client
            .post(self.url(path))
            .query(query)
            .json(body)
            .send()
            .await?;
        check(resp, what).await
    }

    async fn download(&self, path: &str, dest: &Path, what: &str) -> Result<()> {
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let resp = self.client.get(self.url(path)).send().await?;
        let resp = check(resp, what).await?;

        let mut file = tokio::fs::File::create(dest).await?;
        let mut stream = resp.bytes_stream();
        while let Some(chunk) = stream.next().await {
            file.write_all(&chunk?).await?;
        }
        file.flush().await?;
        Ok(())
    }

    async fn upload(&self, path: &str, query: &[(&str, &str)], archive: &Path, what: &str) -> Result<String> {
        let file = tokio::fs::File::open(archive).await?;
        let resp = self
            .client
            .post(self.url(path))
            .query(query)
            .header("Content-Type", "application/x-tar")
            .body(Body::wrap_stream(ReaderStream::new(file)))
            .send()
            .await?;
        Ok(check(resp, what).await?.text().await?)
    }

    async fn list_project(&self, filter_key: &str, filter_value: &str, project: &str) -> Result<Vec<ProjectContainerRef>> {
        let mut filters = Map::new();
        filters.insert(filter_key.to_string(), json!([filter_value]));
        let filters = Value::Object(filters).to_string();
        let resp = self
            .client
            .get(self.url("/containers/json"))
            .query(&[("all", "true"), ("filters", filters.as_str())])
            .send()
            .await?;
        let summaries: Vec<ContainerSummary> = check(resp, "list containers").await?.json().await?;

        let by_label = filter_key == "label";
        let mut refs = Vec::new();
        for summary in summaries {
            let name = summary
                .names
                .first()
                .map(|n| n.trim_start_matches('/').to_string())
                .unwrap_or_default();
            let label = summary
                .labels
                .as_ref()
                .and_then(|l| l.get(SERVICE_LABEL))
                .filter(|s| !s.is_empty())
                .cloned();

            let service = match (by_label, label) {
                (true, Some(service)) => service,
                _ => match service_from_name(project, &name) {
                    Some(service) => service,
                    None if by_label => name.clone(),
                    None => continue,
                },
            };
            refs.push(ProjectContainerRef {
                service,
                id: summary.id,
                container_name: name,
            });
        }
        Ok(refs)
    }
}

/// Return the response if it succeeded, else an API error carrying its body.
async fn check(resp: Response, what: &str) -> Result<Response> {
    if resp.status().is_success() {
        Ok(resp)
    } else {
        Err(api_error(resp, what).await)
    }
}

async fn api_error(resp: Response, what: &str) -> EngineError {
    let status = resp.status();
    let body = resp.text().await.unwrap_or_default();
    let message = serde_json::from_str::<Value>(&body)
        .ok()
        .and_then(|v| v.get("message").and_then(Value::as_str).map(str::to_string))
        .unwrap_or(body);
    EngineError::Api(format!("{}: {}: {}", what, status, message.trim()))
}

fn binds_for(mounts: &[Mount]) -> Vec<String> {
    mounts
        .iter()
        .filter_map(|m| {
            let source = match m.kind {
                MountKind::Volume if !m.name.is_empty() => &m.name,
                MountKind::Volume | MountKind::Bind => &m.source,
                MountKind::Other => return None,
            };
            if source.is_empty() {
                return None;
            }
            let mode = if m.rw { "rw" } else { "ro" };
            Some(format!("{}:{}:{}", source, m.destination, mode))
        })
        .collect()
}

#[async_trait]
impl RuntimeAdapter for ApiAdapter {
    fn name(&self) -> &'static str {
        "api"
    }

    async fn inspect_unit(&self, id: &str) -> Result<Vec<u8>> {
        let resp = self.client.get(self.url(&format!("/containers/{}/json", id))).send().await?;
        if resp.status() == StatusCode::NOT_FOUND {
            return Err(EngineError::NotFound {
                resource: "container",
                name: id.to_string(),
            });
        }
        Ok(check(resp, "inspect container").await?.bytes().await?.to_vec())
    }

    async fn export_unit_filesystem(&self, id: &str, dest: &Path) -> Result<()> {
        self.download(&format!("/containers/{}/export", id), dest, "export container").await
    }

    async fn list_volumes(&self) -> Result<Vec<String>> {
        let list: VolumeList = self.get_json("/volumes", "list volumes").await?;
        Ok(list.volumes.unwrap_or_default().into_iter().map(|v| v.name).collect())
    }

    async fn inspect_volume(&self, name: &str) -> Result<VolumeConfig> {
        self.get_json(&format!("/volumes/{}", name), "inspect volume").await
    }

    async fn list_networks(&self) -> Result<Vec<String>> {
        let list: Vec<NameOnly> = self.get_json("/networks", "list networks").await?;
        Ok(list.into_iter().map(|n| n.name).collect())
    }

    async fn inspect_network(&self, name: &str) -> Result<NetworkConfig> {
        self.get_json(&format!("/networks/{}", name), "inspect network").await
    }

    async fn save_image(&self, reference: &str, dest: &Path) -> Result<()> {
        self.download(&format!("/images/{}/get", reference), dest, "save image").await
    }

    async fn load_image(&self, archive: &Path) -> Result<()> {
        self.upload("/images/load", &[("quiet", "1")], archive, "load image").await?;
        Ok(())
    }

    async fn tag_image(&self, source: &str, target: &str) -> Result<()> {
        let (repo, tag) = split_reference(target);
        let resp = self
            .client
            .post(self.url(&format!("/images/{}/tag", source)))
            .query(&[("repo", repo), ("tag", tag)])
            .send()
            .await?;
        check(resp, "tag image").await?;
        Ok(())
    }

    async fn ensure_volume(&self, config: &VolumeConfig) -> Result<()> {
        if self.exists(&format!("/volumes/{}", config.name)).await? {
            debug!(volume = %config.name, "volume already present");
            return Ok(());
        }
        let mut body = json!({
            "Name": config.name,
            "DriverOpts": config.options,
            "Labels": config.labels,
        });
        if !config.driver.is_empty() {
            body["Driver"] = json!(config.driver);
        }
        self.post_json("/volumes/create", &[], &body, "create volume").await?;
        Ok(())
    }

    async fn ensure_network(&self, config: &NetworkConfig) -> Result<()> {
        if self.exists(&format!("/networks/{}", config.name)).await? {
            debug!(network = %config.name, "network already present");
            return Ok(());
        }

        let pools: Vec<Value> = config
            .ipam
            .config
            .iter()
            .filter(|p| !p.subnet.is_empty())
            .map(|p| {
                let mut pool = Map::new();
                pool.insert("Subnet".to_string(), json!(p.subnet));
                if !p.gateway.is_empty() {
                    pool.insert("Gateway".to_string(), json!(p.gateway));
                }
                if !p.ip_range.is_empty() {
                    pool.insert("IPRange".to_string(), json!(p.ip_range));
                }
                Value::Object(pool)
            })
            .collect();
        let ipam_driver = if config.ipam.driver.is_empty() { "default" } else { config.ipam.driver.as_str() };
        let body = json!({
            "Name": config.name,
            "Driver": if config.driver.is_empty() { "bridge" } else { config.driver.as_str() },
            "Internal": config.internal,
            "Attachable": config.attachable,
            "Ingress": config.ingress,
            "Options": config.options,
            "Labels": config.labels,
            "IPAM": { "Driver": ipam_driver, "Config": pools },
        });

        let resp = self
            .client
            .post(self.url("/networks/create"))
            .json(&body)
            .send()
            .await?;
        if resp.status() == StatusCode::CONFLICT {
            // Created concurrently by someone else
            return Ok(());
        }
        check(resp, "create network").await?;
        Ok(())
    }

    async fn import_image(&self, archive: &Path, reference: Option<&str>) -> Result<String> {
        let mut query = vec![("fromSrc", "-")];
        if let Some(reference) = reference {
            let (repo, tag) = split_reference(reference);
            query.push(("repo", repo));
            query.push(("tag", tag));
        }
        let progress = self.upload("/images/create", &query, archive, "import image").await?;

        // The reply is a stream of JSON progress lines; the last status is the image id
        let id = progress
            .lines()
            .filter_map(|line| serde_json::from_str::<Value>(line).ok())
            .filter_map(|v| v.get("status").and_then(Value::as_str).map(str::to_string))
            .last()
            .filter(|s| s.starts_with("sha256:"));
        match (id, reference) {
            (Some(id), _) => Ok(id),
            (None, Some(reference)) => Ok(reference.to_string()),
            (None, None) => Err(EngineError::Api(format!(
                "import image: no image id in response: {}",
                progress.trim()
            ))),
        }
    }

    async fn create_volume(&self, name: &str) -> Result<()> {
        self.post_json("/volumes/create", &[], &json!({ "Name": name }), "create volume")
            .await?;
        Ok(())
    }

    async fn extract_into_volume(&self, volume: &str, archive: &Path, pseudo_root: &str) -> Result<()> {
        let staging = stage_volume_data(archive, pseudo_root).await?;
        let body = json!({
            "Image": self.helper_image,
            "Cmd": ["sh", "-c", "cp -a /source/. /restore/"],
            "HostConfig": {
                "Binds": [
                    format!("{}:/restore", volume),
                    format!("{}:/source:ro", staging.path().display()),
                ],
            },
        });
        let created: CreatedResponse = self
            .post_json("/containers/create", &[], &body, "create helper container")
            .await?
            .json()
            .await?;

        let outcome = async {
            self.start_unit(&created.id).await?;
            let resp = self
                .client
                .post(self.url(&format!("/containers/{}/wait", created.id)))
                .send()
                .await?;
            let waited: WaitResponse = check(resp, "wait helper container").await?.json().await?;
            if waited.status_code != 0 {
                return Err(EngineError::Api(format!(
                    "copy into volume {} exited with {}",
                    volume, waited.status_code
                )));
            }
            Ok::<(), EngineError>(())
        }
        .await;

        if let Err(e) = self.remove_unit(&created.id).await {
            debug!(container = %created.id, error = %e, "helper container cleanup failed");
        }
        outcome
    }

    async fn create_unit(&self, image: &str, name: &str, mounts: &[Mount]) -> Result<String> {
        let body = json!({
            "Image": image,
            "HostConfig": { "Binds": binds_for(mounts) },
        });
        let query: Vec<(&str, &str)> = if name.is_empty() { vec![] } else { vec![("name", name)] };
        let created: CreatedResponse = self
            .post_json("/containers/create", &query, &body, "create container")
            .await?
            .json()
            .await?;
        Ok(created.id)
    }

    async fn create_unit_from_spec(&self, spec: &UnitSpec) -> Result<Capability<String>> {
        let body = spec.to_create_body()?;
        let query: Vec<(&str, &str)> =
            if spec.name.is_empty() { vec![] } else { vec![("name", spec.name.as_str())] };
        let created: CreatedResponse = self
            .post_json("/containers/create", &query, &body, "create container")
            .await?
            .json()
            .await?;
        Ok(Capability::Supported(created.id))
    }

    async fn start_unit(&self, id: &str) -> Result<()> {
        let resp = self
            .client
            .post(self.url(&format!("/containers/{}/start", id)))
            .send()
            .await?;
        // 304: already running
        if resp.status() == StatusCode::NOT_MODIFIED {
            return Ok(());
        }
        check(resp, "start container").await?;
        Ok(())
    }

    async fn remove_unit(&self, name: &str) -> Result<()> {
        let resp = self
            .client
            .delete(self.url(&format!("/containers/{}", name)))
            .query(&[("force", "true")])
            .send()
            .await?;
        if resp.status() == StatusCode::NOT_FOUND {
            return Ok(());
        }
        check(resp, "remove container").await?;
        Ok(())
    }

    async fn unit_state(&self, id: &str) -> Result<UnitState> {
        let raw = self.inspect_unit(id).await?;
        let state = UnitInspect::parse(&raw)?.state.unwrap_or_default();
        Ok(UnitState {
            status: state.status,
            health: state.health.map(|h| h.status).filter(|s| !s.is_empty()),
        })
    }

    async fn list_project_units_by_label(&self, project: &str) -> Result<Vec<ProjectContainerRef>> {
        let filter = format!("{}={}", PROJECT_LABEL, project);
        self.list_project("label", &filter, project).await
    }

    async fn list_project_units_by_name(&self, project: &str) -> Result<Vec<ProjectContainerRef>> {
        self.list_project("name", project, project).await
    }
}
