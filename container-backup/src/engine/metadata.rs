//! `metadata.json` written at the top of every backup.

use crate::runtime::UnitInfo;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Layout version written by this release.
pub const METADATA_VERSION: u32 = 1;

/// Engine tag recorded in single-container metadata.
pub const ENGINE_TAG: &str = "default";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackupMetadata {
    pub version: u32,
    pub created_at: DateTime<Utc>,
    #[serde(rename = "containerID")]
    pub container_id: String,
    pub container_name: String,
    pub engine: String,
    pub includes_volumes: bool,
    #[serde(default)]
    pub backup_id: String,
    #[serde(default)]
    pub hostname: String,
    /// Reference `image.tar` was saved under, when one was saved
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_reference: Option<String>,
}

impl BackupMetadata {
    pub fn new(info: &UnitInfo, includes_volumes: bool, image_reference: Option<String>) -> Self {
        BackupMetadata {
            version: METADATA_VERSION,
            created_at: Utc::now(),
            container_id: info.id.clone(),
            container_name: info.name.clone(),
            engine: ENGINE_TAG.to_string(),
            includes_volumes,
            backup_id: uuid::Uuid::new_v4().to_string(),
            hostname: local_hostname(),
            image_reference,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectMetadata {
    pub version: u32,
    pub created_at: DateTime<Utc>,
    pub project_name: String,
    pub services: Vec<String>,
}

impl ProjectMetadata {
    pub fn new(project_name: &str, services: Vec<String>) -> Self {
        ProjectMetadata {
            version: METADATA_VERSION,
            created_at: Utc::now(),
            project_name: project_name.to_string(),
            services,
        }
    }
}

fn local_hostname() -> String {
    hostname::get()
        .map(|h| h.to_string_lossy().to_string())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_field_names() {
        let raw = br#"{"Id": "abc", "Name": "/web"}"#.to_vec();
        let info = UnitInfo::from_raw(raw).unwrap();
        let metadata = BackupMetadata::new(&info, true, Some("nginx:1.25".to_string()));

        let value = serde_json::to_value(&metadata).unwrap();
        assert_eq!(value["version"], 1);
        assert_eq!(value["containerID"], "abc");
        assert_eq!(value["containerName"], "web");
        assert_eq!(value["engine"], "default");
        assert_eq!(value["includesVolumes"], true);
        assert!(value["createdAt"].is_string());
        assert_eq!(value["imageReference"], "nginx:1.25");
        assert_eq!(metadata.backup_id.len(), 36);
    }

    #[test]
    fn test_reads_metadata_without_enrichment() {
        let raw = r#"{"version": 1, "createdAt": "2024-05-01T10:00:00Z", "containerID": "abc",
            "containerName": "web", "engine": "default", "includesVolumes": false}"#;
        let metadata: BackupMetadata = serde_json::from_str(raw).unwrap();
        assert_eq!(metadata.container_name, "web");
        assert!(metadata.backup_id.is_empty());
        assert_eq!(metadata.image_reference, None);
    }
}
