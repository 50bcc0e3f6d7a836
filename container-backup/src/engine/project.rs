use super::backup::BackupRequest;
use super::metadata::ProjectMetadata;
use super::options::{BackupOptions, RestoreOptions};
use super::restore::RestoreRequest;
use super::{
    check_archive_path, default_output, read_json_or_default, write_json, Engine, METADATA_FILE,
    NETWORKS_DIR, NETWORK_CONFIGS_FILE, VOLUMES_DIR, VOLUME_CONFIGS_FILE,
};
use crate::archive::{create_archive, extract_archive, ArchiveSource};
use crate::compose::{find_definition, resolve_project_name, ProjectFile, PROJECT_FILES};
use crate::fs::paths::safe_name;
use crate::runtime::{NetworkConfig, ProjectContainerRef, VolumeConfig};
use crate::utils::{EngineError, OperationContext, Result};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use tracing::{debug, error, info, warn};

const COMPOSE_DIR: &str = "compose-files";
const CONTAINERS_DIR: &str = "containers";
const MEMBER_ARCHIVE: &str = "container.tar.gz";

#[derive(Debug, Clone, Default)]
pub struct ProjectBackupRequest {
    /// Directory holding the project files. Defaults to the current directory.
    pub project_dir: PathBuf,
    pub project_name: Option<String>,
    /// Defaults to `<project_dir>/<name>_project_backup.tar.gz`
    pub output: Option<PathBuf>,
    pub compression_level: Option<u32>,
}

#[derive(Debug, Clone)]
pub struct ProjectBackupResult {
    pub archive_path: PathBuf,
    pub project_name: String,
    pub members: Vec<ProjectContainerRef>,
}

#[derive(Debug, Clone)]
pub struct ProjectRestoreRequest {
    pub archive: PathBuf,
    pub options: RestoreOptions,
}

/// What happened to one service during a project restore.
#[derive(Debug, Clone, Default, Serialize)]
pub struct MemberOutcome {
    pub service: String,
    pub container_id: Option<String>,
    pub container_name: Option<String>,
    pub started: bool,
    pub healthy: Option<bool>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ProjectRestoreResult {
    pub project_name: String,
    /// Services in the order they were restored
    pub order: Vec<String>,
    pub members: Vec<MemberOutcome>,
}

impl ProjectRestoreResult {
    pub fn failures(&self) -> impl Iterator<Item = &MemberOutcome> {
        self.members.iter().filter(|m| m.error.is_some())
    }

    pub fn is_complete(&self) -> bool {
        self.failures().next().is_none()
    }
}

impl Engine {
    /// Back up every container of a compose project into one archive.
    pub async fn backup_project(&self, request: ProjectBackupRequest) -> Result<ProjectBackupResult> {
        let project_dir = if request.project_dir.as_os_str().is_empty() {
            std::env::current_dir()?
        } else {
            request.project_dir.clone()
        };
        if !project_dir.is_dir() {
            return Err(EngineError::NotFound {
                resource: "project directory",
                name: project_dir.display().to_string(),
            });
        }

        let level = request
            .compression_level
            .unwrap_or(self.config.backup.compression_level);
        if level > 9 {
            return Err(EngineError::validation("compression_level", "must be between 0 and 9"));
        }

        let project = resolve_project_name(request.project_name.as_deref(), &project_dir);
        let members = self.discover_members(&project).await?;
        let output = request
            .output
            .unwrap_or_else(|| default_output(&project_dir, &project, "project_backup"));

        info!(project = %project, members = members.len(), output = %output.display(), "starting project backup");

        let scratch = self.scratch_dir("project-backup-")?;
        let root = scratch.path();

        copy_project_files(&project_dir, &root.join(COMPOSE_DIR))
            .await
            .op("copy project files")?;

        let mut networks: BTreeMap<String, NetworkConfig> = BTreeMap::new();
        let mut volumes: BTreeMap<String, VolumeConfig> = BTreeMap::new();

        for member in &members {
            self.check_cancelled()?;
            let dest = root
                .join(CONTAINERS_DIR)
                .join(safe_name(&member.service))
                .join(MEMBER_ARCHIVE);
            let request = BackupRequest {
                container: member.id.clone(),
                options: BackupOptions::default()
                    .with_output(dest)
                    .with_compression(level),
            };
            let result = self
                .backup(request)
                .await
                .op(format!("backup service {}", member.service))?;

            for config in result.network_configs {
                networks.entry(config.name.clone()).or_insert(config);
            }
            for config in result.volume_configs {
                volumes.entry(config.name.clone()).or_insert(config);
            }
        }

        let networks: Vec<NetworkConfig> = networks.into_values().collect();
        let volumes: Vec<VolumeConfig> = volumes.into_values().collect();
        write_json(&root.join(NETWORKS_DIR).join(NETWORK_CONFIGS_FILE), &networks)
            .await
            .op("write network configs")?;
        write_json(&root.join(VOLUMES_DIR).join(VOLUME_CONFIGS_FILE), &volumes)
            .await
            .op("write volume configs")?;

        let services = members.iter().map(|m| m.service.clone()).collect();
        write_json(&root.join(METADATA_FILE), &ProjectMetadata::new(&project, services))
            .await
            .op("write metadata")?;

        let sources: Vec<ArchiveSource> = [COMPOSE_DIR, CONTAINERS_DIR, NETWORKS_DIR, VOLUMES_DIR, METADATA_FILE]
            .iter()
            .map(|name| ArchiveSource::new(root.join(name), *name))
            .collect();
        let dest = output.clone();
        self.blocking("create archive", move |cancel| {
            create_archive(&sources, &dest, level, &cancel)
        })
        .await?;

        info!(project = %project, archive = %output.display(), "project backup complete");
        Ok(ProjectBackupResult {
            archive_path: output,
            project_name: project,
            members,
        })
    }

    /// Find the project's containers by label, falling back to container
    /// names. One container is kept per service.
    async fn discover_members(&self, project: &str) -> Result<Vec<ProjectContainerRef>> {
        let mut members = match self
            .guarded("list project containers", self.adapter.list_project_units_by_label(project))
            .await
        {
            Ok(members) => members,
            Err(e) if e.is_cancelled() => return Err(e),
            Err(e) => {
                warn!(project = %project, error = %e, "label lookup failed");
                Vec::new()
            }
        };

        if members.is_empty() {
            debug!(project = %project, "no labelled containers, matching by name");
            members = self
                .guarded(
                    "list project containers by name",
                    self.adapter.list_project_units_by_name(project),
                )
                .await?;
        }

        members.sort_by(|a, b| {
            a.service
                .cmp(&b.service)
                .then_with(|| a.container_name.cmp(&b.container_name))
        });
        let mut seen = BTreeSet::new();
        members.retain(|m| {
            if seen.insert(m.service.clone()) {
                true
            } else {
                warn!(service = %m.service, container = %m.container_name, "skipping extra replica");
                false
            }
        });

        if members.is_empty() {
            return Err(EngineError::NotFound {
                resource: "project containers",
                name: project.to_string(),
            });
        }
        Ok(members)
    }

    /// Restore every member of a project backup in dependency order.
    ///
    /// A member that fails is recorded and the rest carry on. When start is
    /// requested, members are started only after all of them exist, in the
    /// same order.
    pub async fn restore_project(&self, request: ProjectRestoreRequest) -> Result<ProjectRestoreResult> {
        check_archive_path(&request.archive)?;
        let options = &request.options;

        let scratch = self.scratch_dir("project-restore-")?;
        let root = scratch.path().to_path_buf();

        info!(archive = %request.archive.display(), "starting project restore");
        let archive = request.archive.clone();
        let dest = root.clone();
        self.blocking("extract backup", move |cancel| {
            extract_archive(&archive, &dest, &cancel)
        })
        .await?;

        let project_name = match read_json_or_default::<Option<ProjectMetadata>>(&root.join(METADATA_FILE)).await {
            Ok(metadata) => metadata.map(|m| m.project_name).unwrap_or_default(),
            Err(e) => {
                warn!(error = %e, "unreadable project metadata");
                String::new()
            }
        };

        let networks: Vec<NetworkConfig> =
            read_json_or_default(&root.join(NETWORKS_DIR).join(NETWORK_CONFIGS_FILE))
                .await
                .op("read network configs")?;
        let volumes: Vec<VolumeConfig> =
            read_json_or_default(&root.join(VOLUMES_DIR).join(VOLUME_CONFIGS_FILE))
                .await
                .op("read volume configs")?;
        self.ensure_networks(networks, options).await?;
        self.ensure_volumes(&volumes).await?;

        let order = member_order(&root).await.op("resolve service order")?;
        if order.is_empty() {
            return Err(EngineError::NotFound {
                resource: "project members",
                name: request.archive.display().to_string(),
            });
        }
        info!(project = %project_name, order = ?order, "restoring services");

        let member_options = options.for_member();
        let mut members = Vec::with_capacity(order.len());
        let mut health_checked = Vec::with_capacity(order.len());

        for service in &order {
            let archive = root
                .join(CONTAINERS_DIR)
                .join(safe_name(service))
                .join(MEMBER_ARCHIVE);
            let request = RestoreRequest {
                archive,
                options: member_options.clone(),
            };

            let mut outcome = MemberOutcome {
                service: service.clone(),
                ..Default::default()
            };
            match self.restore(request).await {
                Ok(result) => {
                    outcome.container_id = Some(result.container_id);
                    outcome.container_name = Some(result.container_name);
                    health_checked.push(result.has_healthcheck);
                }
                Err(e) if e.is_cancelled() => return Err(e),
                Err(e) => {
                    error!(service = %service, error = %e, "service restore failed");
                    outcome.error = Some(e.to_string());
                    health_checked.push(false);
                }
            }
            members.push(outcome);
        }

        if options.start {
            self.start_members(&mut members, &health_checked, options).await?;
        }

        let result = ProjectRestoreResult {
            project_name,
            order,
            members,
        };
        info!(
            project = %result.project_name,
            failed = result.failures().count(),
            "project restore complete"
        );
        Ok(result)
    }

    async fn start_members(
        &self,
        members: &mut [MemberOutcome],
        health_checked: &[bool],
        options: &RestoreOptions,
    ) -> Result<()> {
        for (member, &has_healthcheck) in members.iter_mut().zip(health_checked) {
            let Some(id) = member.container_id.clone() else {
                continue;
            };
            match self.guarded("start container", self.adapter.start_unit(&id)).await {
                Ok(()) => {
                    member.started = true;
                    info!(service = %member.service, "service started");
                }
                Err(e) if e.is_cancelled() => return Err(e),
                Err(e) => {
                    error!(service = %member.service, error = %e, "service failed to start");
                    member.error = Some(e.to_string());
                    continue;
                }
            }

            if options.wait_healthy && has_healthcheck {
                let timeout = self.wait_timeout(options);
                member.healthy = Some(self.wait_healthy(&id, timeout).await?);
            }
        }
        Ok(())
    }
}

/// Copy whichever project files exist into `dest`.
async fn copy_project_files(project_dir: &Path, dest: &Path) -> Result<()> {
    tokio::fs::create_dir_all(dest).await?;
    for name in PROJECT_FILES {
        let source = project_dir.join(name);
        if tokio::fs::metadata(&source).await.is_ok_and(|m| m.is_file()) {
            tokio::fs::copy(&source, dest.join(name)).await?;
            debug!(file = %name, "copied project file");
        }
    }
    Ok(())
}

/// Services to restore, in start order.
///
/// The service graph in the saved project file decides the order. Services
/// with a member archive but no place in the graph follow alphabetically.
/// Without a project file every member archive is restored alphabetically.
async fn member_order(root: &Path) -> Result<Vec<String>> {
    let mut available = BTreeSet::new();
    let containers_dir = root.join(CONTAINERS_DIR);
    if tokio::fs::metadata(&containers_dir).await.is_ok() {
        let mut entries = tokio::fs::read_dir(&containers_dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            if entry.path().join(MEMBER_ARCHIVE).is_file() {
                available.insert(entry.file_name().to_string_lossy().to_string());
            }
        }
    }

    let declared = match find_definition(&root.join(COMPOSE_DIR)) {
        Some(path) => {
            let data = tokio::fs::read(&path).await?;
            match ProjectFile::parse(&data) {
                Ok(file) => file.start_order(),
                Err(e) => {
                    warn!(file = %path.display(), error = %e, "unreadable project file, using member directories");
                    Vec::new()
                }
            }
        }
        None => Vec::new(),
    };

    let mut order = Vec::with_capacity(available.len());
    for service in declared {
        if available.remove(&safe_name(&service)) {
            order.push(service);
        } else {
            debug!(service = %service, "service has no member archive");
        }
    }
    order.extend(available);
    Ok(order)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn add_member(root: &Path, service: &str) {
        let dir = root.join(CONTAINERS_DIR).join(service);
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join(MEMBER_ARCHIVE), b"").unwrap();
    }

    #[tokio::test]
    async fn test_member_order_follows_project_file() {
        let dir = TempDir::new().unwrap();
        for service in ["web", "api", "db", "extra"] {
            add_member(dir.path(), service);
        }
        std::fs::create_dir_all(dir.path().join(CONTAINERS_DIR).join("no-archive")).unwrap();

        let compose = dir.path().join(COMPOSE_DIR);
        std::fs::create_dir_all(&compose).unwrap();
        std::fs::write(
            compose.join("docker-compose.yml"),
            "services:\n  web:\n    depends_on: [api]\n  api:\n    depends_on: [db]\n  db: {}\n  worker: {}\n",
        )
        .unwrap();

        let order = member_order(dir.path()).await.unwrap();
        assert_eq!(order, vec!["db", "api", "web", "extra"]);
    }

    #[tokio::test]
    async fn test_member_order_without_project_file() {
        let dir = TempDir::new().unwrap();
        for service in ["web", "cache", "db"] {
            add_member(dir.path(), service);
        }
        let order = member_order(dir.path()).await.unwrap();
        assert_eq!(order, vec!["cache", "db", "web"]);
    }

    #[test]
    fn test_restore_result_failures() {
        let result = ProjectRestoreResult {
            project_name: "shop".to_string(),
            order: vec!["db".to_string(), "web".to_string()],
            members: vec![
                MemberOutcome {
                    service: "db".to_string(),
                    container_id: Some("c1".to_string()),
                    ..Default::default()
                },
                MemberOutcome {
                    service: "web".to_string(),
                    error: Some("create container: boom".to_string()),
                    ..Default::default()
                },
            ],
        };
        assert!(!result.is_complete());
        let failed: Vec<&str> = result.failures().map(|m| m.service.as_str()).collect();
        assert_eq!(failed, vec!["web"]);
    }
}
