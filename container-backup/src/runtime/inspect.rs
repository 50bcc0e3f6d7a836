//! Typed view of a container inspect document.
//!
//! Only the fields backup and restore act on are typed. Everything else is
//! kept in `extra` maps so that re-serializing a parsed document for creation
//! carries the original configuration forward untouched.

use crate::utils::{EngineError, Result};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

/// Treat an explicit JSON `null` like an absent field.
pub(crate) fn nullable<'de, D, T>(deserializer: D) -> std::result::Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UnitInspect {
    #[serde(rename = "Id", default, deserialize_with = "nullable")]
    pub id: String,

    #[serde(rename = "Name", default, deserialize_with = "nullable")]
    pub name: String,

    /// Image id the container was created from
    #[serde(rename = "Image", default, deserialize_with = "nullable")]
    pub image: String,

    #[serde(rename = "Mounts", default, deserialize_with = "nullable")]
    pub mounts: Vec<MountPoint>,

    #[serde(rename = "Config", default, skip_serializing_if = "Option::is_none")]
    pub config: Option<UnitConfig>,

    #[serde(rename = "HostConfig", default, skip_serializing_if = "Option::is_none")]
    pub host_config: Option<HostConfig>,

    #[serde(rename = "NetworkSettings", default, skip_serializing_if = "Option::is_none")]
    pub network_settings: Option<NetworkSettings>,

    #[serde(rename = "State", default, skip_serializing_if = "Option::is_none")]
    pub state: Option<StateInspect>,

    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MountPoint {
    #[serde(rename = "Type", default, deserialize_with = "nullable")]
    pub kind: String,

    #[serde(rename = "Name", default, deserialize_with = "nullable")]
    pub name: String,

    #[serde(rename = "Source", default, deserialize_with = "nullable")]
    pub source: String,

    #[serde(rename = "Destination", default, deserialize_with = "nullable")]
    pub destination: String,

    #[serde(rename = "RW", default)]
    pub rw: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UnitConfig {
    #[serde(rename = "Image", default, deserialize_with = "nullable")]
    pub image: String,

    #[serde(rename = "Env", default, skip_serializing_if = "Option::is_none")]
    pub env: Option<Vec<String>>,

    #[serde(rename = "Healthcheck", default, skip_serializing_if = "Option::is_none")]
    pub healthcheck: Option<HealthcheckConfig>,

    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HealthcheckConfig {
    #[serde(rename = "Test", default, skip_serializing_if = "Option::is_none")]
    pub test: Option<Vec<String>>,

    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Port key (`80/tcp`) to its host bindings.
pub type PortMap = BTreeMap<String, Option<Vec<PortBinding>>>;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HostConfig {
    #[serde(rename = "PortBindings", default, skip_serializing_if = "Option::is_none")]
    pub port_bindings: Option<PortMap>,

    #[serde(rename = "Binds", default, skip_serializing_if = "Option::is_none")]
    pub binds: Option<Vec<String>>,

    #[serde(rename = "Mounts", default, skip_serializing_if = "Option::is_none")]
    pub mounts: Option<Vec<HostMount>>,

    #[serde(rename = "Devices", default, skip_serializing_if = "Option::is_none")]
    pub devices: Option<Vec<Value>>,

    #[serde(rename = "CapAdd", default, skip_serializing_if = "Option::is_none")]
    pub cap_add: Option<Vec<String>>,

    #[serde(rename = "CapDrop", default, skip_serializing_if = "Option::is_none")]
    pub cap_drop: Option<Vec<String>>,

    #[serde(rename = "SecurityOpt", default, skip_serializing_if = "Option::is_none")]
    pub security_opt: Option<Vec<String>>,

    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortBinding {
    #[serde(rename = "HostIp", default, deserialize_with = "nullable")]
    pub host_ip: String,

    #[serde(rename = "HostPort", default, deserialize_with = "nullable")]
    pub host_port: String,
}

/// A `HostConfig.Mounts` entry (mounts declared with `--mount`).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HostMount {
    #[serde(rename = "Type", default, deserialize_with = "nullable")]
    pub kind: String,

    #[serde(rename = "Source", default, deserialize_with = "nullable")]
    pub source: String,

    #[serde(rename = "Target", default, deserialize_with = "nullable")]
    pub target: String,

    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NetworkSettings {
    #[serde(rename = "Networks", default, skip_serializing_if = "Option::is_none")]
    pub networks: Option<BTreeMap<String, EndpointSettings>>,

    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EndpointSettings {
    #[serde(rename = "IPAMConfig", default, skip_serializing_if = "Option::is_none")]
    pub ipam_config: Option<EndpointIpamConfig>,

    #[serde(rename = "Aliases", default, skip_serializing_if = "Option::is_none")]
    pub aliases: Option<Vec<String>>,

    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EndpointIpamConfig {
    #[serde(rename = "IPv4Address", default, skip_serializing_if = "Option::is_none")]
    pub ipv4_address: Option<String>,

    #[serde(rename = "IPv6Address", default, skip_serializing_if = "Option::is_none")]
    pub ipv6_address: Option<String>,

    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StateInspect {
    #[serde(rename = "Status", default, deserialize_with = "nullable")]
    pub status: String,

    #[serde(rename = "Health", default, skip_serializing_if = "Option::is_none")]
    pub health: Option<HealthState>,

    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HealthState {
    #[serde(rename = "Status", default, deserialize_with = "nullable")]
    pub status: String,
}

impl UnitInspect {
    /// Parse an inspect document. Both a bare object and the one-element
    /// list printed by `docker inspect` are accepted. A leading `/` on the
    /// name is stripped.
    pub fn parse(raw: &[u8]) -> Result<Self> {
        let value: Value = serde_json::from_slice(raw)?;
        let object = match value {
            Value::Array(mut items) => {
                if items.is_empty() {
                    return Err(EngineError::Api("inspect returned an empty result".to_string()));
                }
                items.swap_remove(0)
            }
            other => other,
        };

        let mut inspect: UnitInspect = serde_json::from_value(object)?;
        inspect.name = inspect.name.trim_start_matches('/').to_string();
        Ok(inspect)
    }

    /// Names of attached networks, sorted.
    pub fn network_names(&self) -> Vec<String> {
        self.network_settings
            .as_ref()
            .and_then(|s| s.networks.as_ref())
            .map(|n| n.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Image reference recorded in the container config (`repo:tag`), if any.
    pub fn configured_image(&self) -> Option<&str> {
        self.config
            .as_ref()
            .map(|c| c.image.as_str())
            .filter(|i| !i.is_empty())
    }

    /// The reference to save at backup time: the configured `repo:tag` so
    /// that tags travel with the image, else the image id.
    pub fn image_reference(&self) -> Option<&str> {
        self.configured_image()
            .or_else(|| Some(self.image.as_str()).filter(|i| !i.is_empty()))
    }

    /// Whether the container declared a health check. Either a configured
    /// test other than `NONE`, or a recorded health state, counts.
    pub fn declares_healthcheck(&self) -> bool {
        let configured = self
            .config
            .as_ref()
            .and_then(|c| c.healthcheck.as_ref())
            .and_then(|h| h.test.as_ref())
            .map(|test| !test.is_empty() && test[0] != "NONE")
            .unwrap_or(false);
        let recorded = self
            .state
            .as_ref()
            .map(|s| s.health.is_some())
            .unwrap_or(false);
        configured || recorded
    }
}

/// Per-network settings passed at creation time.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct EndpointSpec {
    #[serde(rename = "Aliases", skip_serializing_if = "Option::is_none")]
    pub aliases: Option<Vec<String>>,

    #[serde(rename = "IPAMConfig", skip_serializing_if = "Option::is_none")]
    pub ipam_config: Option<EndpointIpamConfig>,
}

/// Everything needed to create a container with full host-config fidelity.
#[derive(Debug, Clone, Default)]
pub struct UnitSpec {
    pub name: String,
    pub config: UnitConfig,
    pub host_config: HostConfig,
    pub endpoints: BTreeMap<String, EndpointSpec>,
}

impl UnitSpec {
    pub fn image(&self) -> &str {
        &self.config.image
    }

    /// Request body for `POST /containers/create`.
    pub fn to_create_body(&self) -> Result<Value> {
        let mut networking = Map::new();
        networking.insert(
            "EndpointsConfig".to_string(),
            serde_json::to_value(&self.endpoints)?,
        );

        let mut body = serde_json::to_value(&self.config)?;
        if let Value::Object(map) = &mut body {
            map.insert("HostConfig".to_string(), serde_json::to_value(&self.host_config)?);
            map.insert("NetworkingConfig".to_string(), Value::Object(networking));
        }
        Ok(body)
    }
}
