mod common;

use common::{inspect_doc, FakeRuntime};
use container_backup::archive::{create_archive, ArchiveSource};
use container_backup::engine::{
    BackupOptions, BackupRequest, ImageSource, RestoreOptions, RestoreRequest,
};
use container_backup::runtime::NetworkConfig;
use container_backup::{Config, Engine};
use serde_json::json;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

fn setup(dir: &TempDir) -> (Arc<FakeRuntime>, Engine) {
    let fake = Arc::new(FakeRuntime::new(&dir.path().join("volume-store")));
    let engine = Engine::new(fake.clone(), Config::default());
    (fake, engine)
}

async fn entry_names(engine: &Engine, archive: &Path) -> Vec<String> {
    engine
        .list(archive)
        .await
        .unwrap()
        .into_iter()
        .map(|e| e.path)
        .collect()
}

/// Write a hand-made backup holding only `files`.
fn handmade_backup(dir: &Path, files: &[(&str, &str)]) -> PathBuf {
    let staging = dir.join("handmade");
    fs::create_dir_all(&staging).unwrap();
    let sources: Vec<ArchiveSource> = files
        .iter()
        .map(|(name, data)| {
            fs::write(staging.join(name), data).unwrap();
            ArchiveSource::new(staging.join(name), *name)
        })
        .collect();
    let archive = dir.join("handmade.tar.gz");
    create_archive(&sources, &archive, 6, &CancellationToken::new()).unwrap();
    archive
}

struct MountedContainer {
    volume_source: PathBuf,
    bind_source: PathBuf,
}

fn add_mounted_container(fake: &FakeRuntime, dir: &Path) -> MountedContainer {
    let volume_source = dir.join("host/appdata/_data");
    let bind_source = dir.join("host/conf");
    fs::create_dir_all(volume_source.join("db")).unwrap();
    fs::create_dir_all(&bind_source).unwrap();
    fs::write(volume_source.join("db/app.sqlite"), b"rows").unwrap();
    fs::write(bind_source.join("app.toml"), b"port = 80").unwrap();

    let mounts = json!([
        {"Type": "volume", "Name": "appdata", "Source": volume_source, "Destination": "/data", "RW": true},
        {"Type": "bind", "Source": bind_source, "Destination": "/etc/app", "RW": false}
    ]);
    let networks = json!({"frontend": {"IPAMConfig": {"IPv4Address": "172.17.0.5"}, "Aliases": ["web"]}});
    let mut doc = inspect_doc("c-web", "web", mounts, networks);
    doc["HostConfig"]["Binds"] = json!([format!("{}:/etc/app:ro", bind_source.display())]);
    fake.add_container(doc);
    fake.add_volume("appdata");
    fake.add_network(NetworkConfig {
        name: "frontend".to_string(),
        driver: "bridge".to_string(),
        ..Default::default()
    });

    MountedContainer {
        volume_source,
        bind_source,
    }
}

#[tokio::test]
async fn test_backup_without_mounts_has_only_required_entries() {
    let dir = TempDir::new().unwrap();
    let (fake, engine) = setup(&dir);
    let mut doc = inspect_doc("c-plain", "plain", json!([]), json!({}));
    doc["Image"] = json!("");
    doc["Config"]["Image"] = json!("");
    fake.add_container(doc);

    let output = dir.path().join("plain.tar.gz");
    let request = BackupRequest {
        container: "plain".to_string(),
        options: BackupOptions::default().with_output(&output),
    };
    let result = engine.backup(request).await.unwrap();

    assert_eq!(result.container_name, "plain");
    assert!(!result.includes_volumes);
    assert!(!result.image_saved);
    assert_eq!(
        entry_names(&engine, &output).await,
        vec!["container.json", "filesystem.tar", "metadata.json"]
    );

    let validation = engine.validate(&output).await.unwrap();
    assert!(validation.valid);
    assert_eq!(validation.details, "backup structure is valid");
}

#[tokio::test]
async fn test_backup_rejects_empty_container() {
    let dir = TempDir::new().unwrap();
    let (_fake, engine) = setup(&dir);
    let err = engine.backup(BackupRequest::new("  ")).await.unwrap_err();
    assert!(matches!(
        err,
        container_backup::EngineError::Validation {
            field: Some("container"),
            ..
        }
    ));

    let err = engine.backup(BackupRequest::new("missing")).await.unwrap_err();
    assert_eq!(err.step(), Some("inspect container"));
}

#[tokio::test]
async fn test_failed_image_save_is_not_fatal() {
    let dir = TempDir::new().unwrap();
    let (fake, engine) = setup(&dir);
    fake.add_container(inspect_doc("c-web", "web", json!([]), json!({})));
    fake.state().fail_save = true;

    let output = dir.path().join("web.tar.gz");
    let result = engine
        .backup(BackupRequest {
            container: "c-web".to_string(),
            options: BackupOptions::default().with_output(&output),
        })
        .await
        .unwrap();

    assert!(!result.image_saved);
    assert!(!entry_names(&engine, &output).await.contains(&"image.tar".to_string()));
}

#[tokio::test]
async fn test_backup_and_restore_on_a_new_host() {
    let dir = TempDir::new().unwrap();
    let (fake, engine) = setup(&dir);
    let container = add_mounted_container(&fake, dir.path());

    let output = dir.path().join("web.tar.gz");
    let result = engine
        .backup(BackupRequest {
            container: "web".to_string(),
            options: BackupOptions::default().with_output(&output).with_compression(1),
        })
        .await
        .unwrap();
    assert!(result.includes_volumes);
    assert!(result.image_saved);
    assert_eq!(result.metadata.container_id, "c-web");
    assert_eq!(result.metadata.image_reference.as_deref(), Some("nginx:1.25"));

    let names = entry_names(&engine, &output).await;
    for expected in [
        "container.json",
        "filesystem.tar",
        "volumes/appdata.tar.gz",
        "volumes/bind_conf.tar.gz",
        "volumes/volume_configs.json",
        "networks/network_configs.json",
        "metadata.json",
        "image.tar",
    ] {
        assert!(names.contains(&expected.to_string()), "missing {}", expected);
    }

    // A fresh runtime, and the bind source no longer exists
    let target = TempDir::new().unwrap();
    let (fresh, engine) = setup(&target);
    fs::remove_dir_all(&container.bind_source).unwrap();
    let relocation_root = target.path().join("relocated");

    let options = RestoreOptions {
        auto_relax_ips: true,
        network_map: BTreeMap::from([("frontend".to_string(), "edge".to_string())]),
        bind_restore_root: Some(relocation_root.clone()),
        ..Default::default()
    };
    let restored = engine
        .restore(RestoreRequest {
            archive: output.clone(),
            options: options.clone(),
        })
        .await
        .unwrap();

    assert_eq!(restored.container_name, "web");
    assert_eq!(restored.container_id, "id-web");
    assert_eq!(restored.image, "nginx:1.25");
    assert!(!restored.simple_create);
    assert!(!restored.started);

    let relocated = relocation_root.join("conf");
    assert_eq!(fs::read(relocated.join("app.toml")).unwrap(), b"port = 80");
    assert_eq!(
        fs::read(fresh.volume_root.join("appdata/db/app.sqlite")).unwrap(),
        b"rows"
    );
    assert!(container.volume_source.exists());

    {
        let state = fresh.state();
        assert_eq!(state.loaded, 1);
        assert_eq!(state.imported, 0);
        // Created from the saved tag, never re-tagged from the recorded id
        assert!(state.tagged.is_empty());
        assert!(state.networks.contains_key("edge"));
        assert!(!state.networks.contains_key("frontend"));
        assert!(state.volumes.contains_key("appdata"));

        let spec = &state.specs[0];
        assert_eq!(spec.name, "web");
        assert_eq!(spec.config.image, "nginx:1.25");
        assert!(spec.endpoints["edge"].ipam_config.is_none());
        let binds = spec.host_config.binds.as_ref().unwrap();
        assert_eq!(binds[0], format!("{}:/etc/app:ro", relocated.display()));
        assert_eq!(
            spec.host_config.extra["RestartPolicy"]["Name"],
            json!("unless-stopped")
        );
    }

    // Restoring again leaves existing resources alone
    let (networks_before, volumes_before) = {
        let state = fresh.state();
        (state.network_creates, state.volume_creates)
    };
    engine
        .restore(RestoreRequest {
            archive: output,
            options: RestoreOptions {
                replace_existing: true,
                ..options
            },
        })
        .await
        .unwrap();
    let state = fresh.state();
    assert_eq!(state.network_creates, networks_before);
    assert_eq!(state.volume_creates, volumes_before);
    assert_eq!(state.removed, vec!["web"]);
}

#[tokio::test]
async fn test_restore_falls_back_to_simple_create() {
    let dir = TempDir::new().unwrap();
    let (fake, engine) = setup(&dir);
    add_mounted_container(&fake, dir.path());
    let output = dir.path().join("web.tar.gz");
    engine
        .backup(BackupRequest {
            container: "web".to_string(),
            options: BackupOptions::default().with_output(&output),
        })
        .await
        .unwrap();

    fake.state().structured_create = false;
    let restored = engine
        .restore(RestoreRequest {
            archive: output,
            options: RestoreOptions {
                name: Some("web-copy".to_string()),
                ..Default::default()
            },
        })
        .await
        .unwrap();

    assert!(restored.simple_create);
    let state = fake.state();
    assert!(state.specs.is_empty());
    let (image, name, mounts) = &state.simple_creates[0];
    assert_eq!(image, "nginx:1.25");
    assert_eq!(name, "web-copy");
    assert_eq!(mounts.len(), 2);
}

#[tokio::test]
async fn test_restore_drops_unknown_host_ip() {
    let dir = TempDir::new().unwrap();
    let (fake, engine) = setup(&dir);
    let mut doc = inspect_doc("c-web", "web", json!([]), json!({}));
    doc["HostConfig"]["PortBindings"] = json!({
        "80/tcp": [{"HostIp": "203.0.113.9", "HostPort": "8080"}],
        "443/tcp": [{"HostIp": "192.168.1.20", "HostPort": "8443"}]
    });
    fake.add_container(doc);
    let output = dir.path().join("web.tar.gz");
    engine
        .backup(BackupRequest {
            container: "web".to_string(),
            options: BackupOptions::default().with_output(&output),
        })
        .await
        .unwrap();

    engine
        .restore(RestoreRequest::new(&output))
        .await
        .unwrap();
    engine
        .restore(RestoreRequest {
            archive: output,
            options: RestoreOptions {
                drop_host_ips: true,
                ..Default::default()
            },
        })
        .await
        .unwrap();

    let state = fake.state();
    let dropped = state.specs[0].host_config.port_bindings.as_ref().unwrap();
    assert!(!dropped.contains_key("80/tcp"));
    assert_eq!(dropped["443/tcp"].as_ref().unwrap()[0].host_ip, "192.168.1.20");

    let cleared = state.specs[1].host_config.port_bindings.as_ref().unwrap();
    assert_eq!(cleared["80/tcp"].as_ref().unwrap()[0].host_ip, "");
    assert_eq!(cleared["80/tcp"].as_ref().unwrap()[0].host_port, "8080");
}

#[tokio::test]
async fn test_restore_prefers_saved_image_reference() {
    let dir = TempDir::new().unwrap();
    let (fake, engine) = setup(&dir);
    // The tag moved on since the container was created from sha256:feed
    let doc = inspect_doc("c-web", "web", json!([]), json!({})).to_string();
    let metadata = json!({
        "version": 1, "createdAt": "2024-05-01T10:00:00Z", "containerID": "c-web",
        "containerName": "web", "engine": "default", "includesVolumes": false,
        "imageReference": "nginx:1.25"
    })
    .to_string();
    let archive = handmade_backup(
        dir.path(),
        &[
            ("container.json", doc.as_str()),
            ("filesystem.tar", "rootfs"),
            ("image.tar", "image"),
            ("metadata.json", metadata.as_str()),
        ],
    );

    let restored = engine.restore(RestoreRequest::new(&archive)).await.unwrap();
    assert_eq!(restored.image, "nginx:1.25");
    let state = fake.state();
    assert_eq!(state.loaded, 1);
    assert!(state.tagged.is_empty());
    assert_eq!(state.specs[0].config.image, "nginx:1.25");
}

#[tokio::test]
async fn test_restore_without_saved_reference_tags_recorded_id() {
    let dir = TempDir::new().unwrap();
    let (fake, engine) = setup(&dir);
    let doc = inspect_doc("c-web", "web", json!([]), json!({})).to_string();
    let archive = handmade_backup(
        dir.path(),
        &[
            ("container.json", doc.as_str()),
            ("filesystem.tar", "rootfs"),
            ("image.tar", "image"),
            ("metadata.json", "{}"),
        ],
    );

    let restored = engine.restore(RestoreRequest::new(&archive)).await.unwrap();
    assert_eq!(restored.image, "nginx:1.25");
    assert_eq!(
        fake.state().tagged,
        vec![("sha256:feed".to_string(), "nginx:1.25".to_string())]
    );
}

#[tokio::test]
async fn test_restore_imports_filesystem_without_image() {
    let dir = TempDir::new().unwrap();
    let (fake, engine) = setup(&dir);
    let doc = inspect_doc("c-web", "web", json!([]), json!({})).to_string();
    let archive = handmade_backup(
        dir.path(),
        &[
            ("container.json", doc.as_str()),
            ("filesystem.tar", "rootfs"),
            ("metadata.json", "{}"),
        ],
    );

    let restored = engine.restore(RestoreRequest::new(&archive)).await.unwrap();
    assert_eq!(restored.image, "nginx:1.25");
    let state = fake.state();
    assert_eq!(state.imported, 1);
    assert_eq!(state.loaded, 0);
    assert_eq!(
        state.tagged,
        vec![("sha256:imported".to_string(), "nginx:1.25".to_string())]
    );
}

#[tokio::test]
async fn test_restore_without_image_artifacts_fails() {
    let dir = TempDir::new().unwrap();
    let (fake, engine) = setup(&dir);
    let doc = inspect_doc("c-web", "web", json!([]), json!({})).to_string();
    let archive = handmade_backup(
        dir.path(),
        &[("container.json", doc.as_str()), ("metadata.json", "{}")],
    );

    let err = engine
        .restore(RestoreRequest::new(&archive))
        .await
        .unwrap_err();
    assert_eq!(err.step(), Some("materialize image"));
    assert!(fake.state().specs.is_empty());
}

#[tokio::test]
async fn test_validate_reports_missing_metadata() {
    let dir = TempDir::new().unwrap();
    let (_fake, engine) = setup(&dir);
    let archive = handmade_backup(
        dir.path(),
        &[("container.json", ""), ("filesystem.tar", "")],
    );

    let validation = engine.validate(&archive).await.unwrap();
    assert!(!validation.valid);
    assert_eq!(validation.missing, vec!["metadata.json"]);
    assert!(validation.details.contains("metadata.json"));
}

#[tokio::test]
async fn test_validate_accepts_empty_required_files() {
    let dir = TempDir::new().unwrap();
    let (_fake, engine) = setup(&dir);
    let archive = handmade_backup(
        dir.path(),
        &[
            ("container.json", ""),
            ("filesystem.tar", ""),
            ("metadata.json", ""),
        ],
    );
    assert!(engine.validate(&archive).await.unwrap().valid);
}

#[tokio::test]
async fn test_wait_healthy_only_with_declared_healthcheck() {
    let dir = TempDir::new().unwrap();
    let (fake, engine) = setup(&dir);
    let mut doc = inspect_doc("c-api", "api", json!([]), json!({}));
    doc["Config"]["Healthcheck"] = json!({"Test": ["CMD", "curl", "-f", "http://localhost/"]});
    fake.add_container(doc);
    fake.add_container(inspect_doc("c-web", "web", json!([]), json!({})));

    let options = RestoreOptions {
        start: true,
        wait_healthy: true,
        wait_timeout: Some(Duration::from_secs(5)),
        ..Default::default()
    };

    for name in ["api", "web"] {
        let output = dir.path().join(format!("{}.tar.gz", name));
        engine
            .backup(BackupRequest {
                container: name.to_string(),
                options: BackupOptions::default().with_output(&output),
            })
            .await
            .unwrap();
        let restored = engine
            .restore(RestoreRequest {
                archive: output,
                options: options.clone(),
            })
            .await
            .unwrap();
        assert!(restored.started);
        if name == "api" {
            assert_eq!(restored.healthy, Some(true));
        } else {
            assert_eq!(restored.healthy, None);
        }
    }
    assert_eq!(fake.state().started, vec!["id-api", "id-web"]);
}

#[tokio::test]
async fn test_cancelled_backup_stops() {
    let dir = TempDir::new().unwrap();
    let fake = Arc::new(FakeRuntime::new(&dir.path().join("volume-store")));
    fake.add_container(inspect_doc("c-web", "web", json!([]), json!({})));
    let cancel = CancellationToken::new();
    cancel.cancel();
    let engine = Engine::with_cancel(fake, Config::default(), cancel);

    let output = dir.path().join("web.tar.gz");
    let err = engine
        .backup(BackupRequest {
            container: "web".to_string(),
            options: BackupOptions::default().with_output(&output),
        })
        .await
        .unwrap_err();
    assert!(err.is_cancelled());
    assert!(!output.exists());
}

#[tokio::test]
async fn test_dry_run_reports_without_creating() {
    let dir = TempDir::new().unwrap();
    let (fake, engine) = setup(&dir);
    add_mounted_container(&fake, dir.path());
    let output = dir.path().join("web.tar.gz");
    engine
        .backup(BackupRequest {
            container: "web".to_string(),
            options: BackupOptions::default().with_output(&output),
        })
        .await
        .unwrap();

    let plan = engine.dry_run(&output).await.unwrap();
    assert_eq!(plan.container_name, "web");
    assert_eq!(plan.image_reference.as_deref(), Some("nginx:1.25"));
    assert_eq!(plan.image_source, ImageSource::SavedImage);
    assert_eq!(plan.env_count, 2);
    assert_eq!(plan.port_bindings, 1);
    assert_eq!(plan.networks, vec!["frontend"]);
    assert_eq!(plan.network_configs, vec!["frontend"]);
    assert_eq!(plan.volume_configs, vec!["appdata"]);
    assert_eq!(plan.mounts[0].archive.as_deref(), Some("appdata.tar.gz"));
    assert_eq!(plan.mounts[1].archive.as_deref(), Some("bind_conf.tar.gz"));
    assert!(plan.metadata.is_some());
    assert!(plan.to_string().contains("load image.tar"));

    let state = fake.state();
    assert!(state.specs.is_empty());
    assert_eq!(state.loaded, 0);
}
