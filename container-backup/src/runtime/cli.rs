//! Runtime adapter that execs the `docker` binary.

use super::inspect::{EndpointSpec, HealthcheckConfig, HostMount, PortBinding, UnitInspect, UnitSpec};
use super::{
    service_from_name, stage_volume_data, Capability, Mount, MountKind, NetworkConfig,
    ProjectContainerRef, RuntimeAdapter, UnitState, VolumeConfig, PROJECT_LABEL, SERVICE_LABEL,
};
use crate::utils::{EngineError, Result};
use async_trait::async_trait;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::path::Path;
use std::process::Stdio;
use tokio::process::Command;
use tracing::{debug, warn};

pub struct CliAdapter {
    program: String,
    helper_image: String,
}

impl CliAdapter {
    pub fn new(program: impl Into<String>, helper_image: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            helper_image: helper_image.into(),
        }
    }

    fn command(&self, args: &[&str]) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(args).stdin(Stdio::null()).kill_on_drop(true);
        cmd
    }

    fn failure(&self, args: &[&str], status: std::process::ExitStatus, stderr: &[u8]) -> EngineError {
        let sub = args.iter().take(2).copied().collect::<Vec<_>>().join(" ");
        EngineError::Command {
            program: format!("{} {}", self.program, sub),
            status: status.to_string(),
            stderr: String::from_utf8_lossy(stderr).trim().to_string(),
        }
    }

    /// Run a command to completion and return its stdout.
    async fn run(&self, args: &[&str]) -> Result<Vec<u8>> {
        debug!(program = %self.program, ?args, "exec");
        let output = self.command(args).output().await?;
        if !output.status.success() {
            return Err(self.failure(args, output.status, &output.stderr));
        }
        Ok(output.stdout)
    }

    async fn run_text(&self, args: &[&str]) -> Result<String> {
        let stdout = self.run(args).await?;
        Ok(String::from_utf8_lossy(&stdout).trim().to_string())
    }

    async fn run_lines(&self, args: &[&str]) -> Result<Vec<String>> {
        Ok(self
            .run_text(args)
            .await?
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(str::to_string)
            .collect())
    }

    /// Parse the first element of a `docker ... inspect` array.
    async fn inspect_first<T: serde::de::DeserializeOwned>(&self, args: &[&str], what: &'static str, name: &str) -> Result<T> {
        let stdout = self.run(args).await?;
        let mut items: Vec<T> = serde_json::from_slice(&stdout)?;
        if items.is_empty() {
            return Err(EngineError::NotFound {
                resource: what,
                name: name.to_string(),
            });
        }
        Ok(items.swap_remove(0))
    }

    async fn list_project(&self, filter: &str, project: &str, by_label: bool) -> Result<Vec<ProjectContainerRef>> {
        let format = format!("{{{{.ID}}}}\t{{{{.Names}}}}\t{{{{.Label \"{}\"}}}}", SERVICE_LABEL);
        let lines = self
            .run_lines(&["ps", "-a", "--filter", filter, "--format", &format])
            .await?;

        let mut refs = Vec::new();
        for line in lines {
            let mut parts = line.splitn(3, '\t');
            let (Some(id), Some(name)) = (parts.next(), parts.next()) else {
                continue;
            };
            let label = parts.next().unwrap_or("").trim();

            let service = if by_label && !label.is_empty() {
                label.to_string()
            } else {
                match service_from_name(project, name) {
                    Some(service) => service,
                    None if by_label => name.to_string(),
                    None => continue,
                }
            };
            refs.push(ProjectContainerRef {
                service,
                id: id.to_string(),
                container_name: name.to_string(),
            });
        }
        Ok(refs)
    }
}

fn mount_flag(mount: &Mount) -> Option<String> {
    let mode = if mount.rw { "rw" } else { "ro" };
    let source = match mount.kind {
        MountKind::Bind => mount.source.as_str(),
        MountKind::Volume if !mount.name.is_empty() => mount.name.as_str(),
        MountKind::Volume => mount.source.as_str(),
        MountKind::Other => return None,
    };
    if source.is_empty() {
        return None;
    }
    Some(format!("{}:{}:{}", source, mount.destination, mode))
}

fn push_pairs(args: &mut Vec<String>, flag: &str, pairs: &BTreeMap<String, String>) {
    for (k, v) in pairs {
        args.push(flag.to_string());
        args.push(format!("{}={}", k, v));
    }
}

fn push_flag(args: &mut Vec<String>, flag: &str, value: impl Into<String>) {
    args.push(flag.to_string());
    args.push(value.into());
}

fn text<'a>(map: &'a Map<String, Value>, key: &str) -> Option<&'a str> {
    map.get(key).and_then(Value::as_str).filter(|s| !s.is_empty())
}

fn texts(map: &Map<String, Value>, key: &str) -> Vec<String> {
    map.get(key)
        .and_then(Value::as_array)
        .map(|items| items.iter().filter_map(Value::as_str).map(str::to_string).collect())
        .unwrap_or_default()
}

fn enabled(map: &Map<String, Value>, key: &str) -> bool {
    map.get(key).and_then(Value::as_bool).unwrap_or(false)
}

fn positive(map: &Map<String, Value>, key: &str) -> Option<i64> {
    map.get(key).and_then(Value::as_i64).filter(|n| *n > 0)
}

/// `docker create` arguments for a spec, and the `docker network connect`
/// calls (minus the trailing container id) for every further network.
#[derive(Debug, Default, PartialEq)]
struct CreatePlan {
    create: Vec<String>,
    connects: Vec<Vec<String>>,
}

/// Network modes that are not a network joined by name.
fn is_shared_mode(mode: &str) -> bool {
    matches!(mode, "host" | "none") || mode.starts_with("container:") || mode.starts_with("service:")
}

fn publish_spec(port: &str, binding: &PortBinding) -> String {
    let ip = match binding.host_ip.as_str() {
        ip if ip.contains(':') => format!("[{}]", ip),
        ip => ip.to_string(),
    };
    match (ip.is_empty(), binding.host_port.is_empty()) {
        (false, _) => format!("{}:{}:{}", ip, binding.host_port, port),
        (true, false) => format!("{}:{}", binding.host_port, port),
        (true, true) => port.to_string(),
    }
}

fn mount_spec(mount: &HostMount) -> String {
    let mut parts = vec![format!("type={}", mount.kind)];
    if !mount.source.is_empty() {
        parts.push(format!("source={}", mount.source));
    }
    parts.push(format!("target={}", mount.target));
    if enabled(&mount.extra, "ReadOnly") {
        parts.push("readonly".to_string());
    }
    parts.join(",")
}

fn device_spec(device: &Value) -> Option<String> {
    let device = device.as_object()?;
    let host = text(device, "PathOnHost")?;
    let container = text(device, "PathInContainer").unwrap_or(host);
    let perms = text(device, "CgroupPermissions").unwrap_or("rwm");
    Some(format!("{}:{}:{}", host, container, perms))
}

fn healthcheck_flags(args: &mut Vec<String>, healthcheck: &HealthcheckConfig) {
    match healthcheck.test.as_deref() {
        Some([kind, ..]) if kind.as_str() == "NONE" => {
            args.push("--no-healthcheck".to_string());
            return;
        }
        Some([kind, cmd]) if kind.as_str() == "CMD-SHELL" => push_flag(args, "--health-cmd", cmd.as_str()),
        Some([kind, cmd @ ..]) if kind.as_str() == "CMD" && !cmd.is_empty() => {
            push_flag(args, "--health-cmd", cmd.join(" "))
        }
        _ => {}
    }
    for (key, flag) in [
        ("Interval", "--health-interval"),
        ("Timeout", "--health-timeout"),
        ("StartPeriod", "--health-start-period"),
    ] {
        if let Some(nanos) = positive(&healthcheck.extra, key) {
            push_flag(args, flag, format!("{}ns", nanos));
        }
    }
    if let Some(retries) = positive(&healthcheck.extra, "Retries") {
        push_flag(args, "--health-retries", retries.to_string());
    }
}

/// Static addresses and aliases for one network. The default bridge takes
/// neither.
fn endpoint_flags(args: &mut Vec<String>, network: &str, endpoint: &EndpointSpec, alias_flag: &str) {
    if network == "bridge" {
        return;
    }
    if let Some(ipam) = &endpoint.ipam_config {
        if let Some(ip) = ipam.ipv4_address.as_deref().filter(|a| !a.is_empty()) {
            push_flag(args, "--ip", ip);
        }
        if let Some(ip) = ipam.ipv6_address.as_deref().filter(|a| !a.is_empty()) {
            push_flag(args, "--ip6", ip);
        }
    }
    for alias in endpoint.aliases.iter().flatten() {
        push_flag(args, alias_flag, alias.as_str());
    }
}

fn config_flags(args: &mut Vec<String>, spec: &UnitSpec) {
    let extra = &spec.config.extra;
    for (key, flag) in [
        ("Hostname", "--hostname"),
        ("Domainname", "--domainname"),
        ("User", "--user"),
        ("WorkingDir", "--workdir"),
        ("StopSignal", "--stop-signal"),
    ] {
        if let Some(value) = text(extra, key) {
            push_flag(args, flag, value);
        }
    }
    for env in spec.config.env.iter().flatten() {
        push_flag(args, "-e", env.as_str());
    }
    if let Some(Value::Object(labels)) = extra.get("Labels") {
        for (key, value) in labels {
            if let Some(value) = value.as_str() {
                push_flag(args, "--label", format!("{}={}", key, value));
            }
        }
    }
    if let Some(Value::Object(ports)) = extra.get("ExposedPorts") {
        for port in ports.keys() {
            push_flag(args, "--expose", port.as_str());
        }
    }
    if enabled(extra, "Tty") {
        args.push("--tty".to_string());
    }
    if enabled(extra, "OpenStdin") {
        args.push("--interactive".to_string());
    }
    if let Some(healthcheck) = &spec.config.healthcheck {
        healthcheck_flags(args, healthcheck);
    }
}

fn host_config_flags(args: &mut Vec<String>, spec: &UnitSpec) {
    let host = &spec.host_config;
    let extra = &host.extra;

    for bind in host.binds.iter().flatten() {
        push_flag(args, "-v", bind.as_str());
    }
    for mount in host.mounts.iter().flatten() {
        push_flag(args, "--mount", mount_spec(mount));
    }
    for (port, bindings) in host.port_bindings.iter().flatten() {
        for binding in bindings.iter().flatten() {
            push_flag(args, "-p", publish_spec(port, binding));
        }
    }
    for device in host.devices.iter().flatten().filter_map(device_spec) {
        push_flag(args, "--device", device);
    }
    for cap in host.cap_add.iter().flatten() {
        push_flag(args, "--cap-add", cap.as_str());
    }
    for cap in host.cap_drop.iter().flatten() {
        push_flag(args, "--cap-drop", cap.as_str());
    }
    for opt in host.security_opt.iter().flatten() {
        push_flag(args, "--security-opt", opt.as_str());
    }

    for (key, flag) in [
        ("Privileged", "--privileged"),
        ("ReadonlyRootfs", "--read-only"),
        ("Init", "--init"),
        ("AutoRemove", "--rm"),
        ("PublishAllPorts", "--publish-all"),
    ] {
        if enabled(extra, key) {
            args.push(flag.to_string());
        }
    }
    for (key, flag) in [
        ("PidMode", "--pid"),
        ("IpcMode", "--ipc"),
        ("UTSMode", "--uts"),
        ("UsernsMode", "--userns"),
        ("CgroupParent", "--cgroup-parent"),
        ("Runtime", "--runtime"),
    ] {
        if let Some(value) = text(extra, key) {
            push_flag(args, flag, value);
        }
    }
    for (key, flag) in [
        ("ExtraHosts", "--add-host"),
        ("Dns", "--dns"),
        ("DnsSearch", "--dns-search"),
        ("DnsOptions", "--dns-option"),
        ("GroupAdd", "--group-add"),
        ("VolumesFrom", "--volumes-from"),
    ] {
        for value in texts(extra, key) {
            push_flag(args, flag, value);
        }
    }
    for (key, flag) in [
        ("Memory", "--memory"),
        ("MemoryReservation", "--memory-reservation"),
        ("MemorySwap", "--memory-swap"),
        ("CpuShares", "--cpu-shares"),
        ("ShmSize", "--shm-size"),
        ("PidsLimit", "--pids-limit"),
    ] {
        if let Some(n) = positive(extra, key) {
            push_flag(args, flag, n.to_string());
        }
    }
    if let Some(nanos) = positive(extra, "NanoCpus") {
        push_flag(args, "--cpus", (nanos as f64 / 1e9).to_string());
    }

    if let Some(Value::Object(policy)) = extra.get("RestartPolicy") {
        match text(policy, "Name") {
            Some("no") | None => {}
            Some("on-failure") => match positive(policy, "MaximumRetryCount") {
                Some(n) => push_flag(args, "--restart", format!("on-failure:{}", n)),
                None => push_flag(args, "--restart", "on-failure"),
            },
            Some(name) => push_flag(args, "--restart", name),
        }
    }
    if let Some(Value::Object(log)) = extra.get("LogConfig") {
        if let Some(driver) = text(log, "Type") {
            push_flag(args, "--log-driver", driver);
        }
        if let Some(Value::Object(opts)) = log.get("Config") {
            for (key, value) in opts {
                if let Some(value) = value.as_str() {
                    push_flag(args, "--log-opt", format!("{}={}", key, value));
                }
            }
        }
    }
    if let Some(Value::Array(limits)) = extra.get("Ulimits") {
        for limit in limits.iter().filter_map(Value::as_object) {
            let (Some(name), Some(soft), Some(hard)) = (
                text(limit, "Name"),
                limit.get("Soft").and_then(Value::as_i64),
                limit.get("Hard").and_then(Value::as_i64),
            ) else {
                continue;
            };
            push_flag(args, "--ulimit", format!("{}={}:{}", name, soft, hard));
        }
    }
    for (key, flag) in [("Sysctls", "--sysctl"), ("Tmpfs", "--tmpfs")] {
        if let Some(Value::Object(pairs)) = extra.get(key) {
            for (k, v) in pairs {
                match v.as_str().filter(|v| !v.is_empty()) {
                    Some(v) if key == "Tmpfs" => push_flag(args, flag, format!("{}:{}", k, v)),
                    Some(v) => push_flag(args, flag, format!("{}={}", k, v)),
                    None if key == "Tmpfs" => push_flag(args, flag, k.as_str()),
                    None => {}
                }
            }
        }
    }
}

/// Translate a creation spec into CLI calls.
///
/// The container joins its network mode (or its first endpoint) at creation
/// with that endpoint's address and aliases. Every other endpoint is attached
/// afterwards with `docker network connect`.
fn create_plan(spec: &UnitSpec) -> CreatePlan {
    let mut args = vec!["create".to_string()];
    if !spec.name.is_empty() {
        push_flag(&mut args, "--name", spec.name.as_str());
    }
    config_flags(&mut args, spec);
    host_config_flags(&mut args, spec);

    let mode = text(&spec.host_config.extra, "NetworkMode").unwrap_or("default");
    let primary = if is_shared_mode(mode) {
        push_flag(&mut args, "--network", mode);
        None
    } else if spec.endpoints.contains_key(mode) {
        Some(mode.to_string())
    } else if mode == "default" {
        if spec.endpoints.contains_key("bridge") {
            Some("bridge".to_string())
        } else {
            spec.endpoints.keys().next().cloned()
        }
    } else {
        Some(mode.to_string())
    };

    let mut connects = Vec::new();
    if let Some(primary) = &primary {
        push_flag(&mut args, "--network", primary.as_str());
        if let Some(endpoint) = spec.endpoints.get(primary) {
            endpoint_flags(&mut args, primary, endpoint, "--network-alias");
        }
        for (network, endpoint) in spec.endpoints.iter().filter(|(n, _)| *n != primary) {
            let mut connect = vec!["network".to_string(), "connect".to_string()];
            endpoint_flags(&mut connect, network, endpoint, "--alias");
            connect.push(network.clone());
            connects.push(connect);
        }
    }

    // Entrypoint words beyond the first run ahead of the command
    let extra = &spec.config.extra;
    let mut trailing = Vec::new();
    if extra.get("Entrypoint").is_some_and(Value::is_array) {
        let entrypoint = texts(extra, "Entrypoint");
        match entrypoint.split_first() {
            Some((first, rest)) => {
                push_flag(&mut args, "--entrypoint", first.as_str());
                trailing.extend(rest.iter().cloned());
            }
            None => push_flag(&mut args, "--entrypoint", ""),
        }
    }
    trailing.extend(texts(extra, "Cmd"));

    args.push(spec.image().to_string());
    args.extend(trailing);
    CreatePlan { create: args, connects }
}

#[async_trait]
impl RuntimeAdapter for CliAdapter {
    fn name(&self) -> &'static str {
        "cli"
    }

    async fn inspect_unit(&self, id: &str) -> Result<Vec<u8>> {
        let stdout = self.run(&["inspect", "--type", "container", id]).await?;
        if stdout.iter().all(u8::is_ascii_whitespace) {
            return Err(EngineError::Api(format!("inspect of {} returned an empty result", id)));
        }
        Ok(stdout)
    }

    async fn export_unit_filesystem(&self, id: &str, dest: &Path) -> Result<()> {
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let dest = dest.to_string_lossy();
        self.run(&["export", "-o", &dest, id]).await?;
        Ok(())
    }

    async fn list_volumes(&self) -> Result<Vec<String>> {
        self.run_lines(&["volume", "ls", "--format", "{{.Name}}"]).await
    }

    async fn inspect_volume(&self, name: &str) -> Result<VolumeConfig> {
        self.inspect_first(&["volume", "inspect", name], "volume", name).await
    }

    async fn list_networks(&self) -> Result<Vec<String>> {
        self.run_lines(&["network", "ls", "--format", "{{.Name}}"]).await
    }

    async fn inspect_network(&self, name: &str) -> Result<NetworkConfig> {
        self.inspect_first(&["network", "inspect", name], "network", name).await
    }

    async fn save_image(&self, reference: &str, dest: &Path) -> Result<()> {
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let dest = dest.to_string_lossy();
        self.run(&["save", "-o", &dest, reference]).await?;
        Ok(())
    }

    async fn load_image(&self, archive: &Path) -> Result<()> {
        self.run(&["load", "-i", &archive.to_string_lossy()]).await?;
        Ok(())
    }

    async fn tag_image(&self, source: &str, target: &str) -> Result<()> {
        self.run(&["tag", source, target]).await?;
        Ok(())
    }

    async fn ensure_volume(&self, config: &VolumeConfig) -> Result<()> {
        if self.run(&["volume", "inspect", &config.name]).await.is_ok() {
            debug!(volume = %config.name, "volume already present");
            return Ok(());
        }

        let mut args = vec!["volume".to_string(), "create".to_string()];
        if !config.driver.is_empty() {
            args.extend(["--driver".to_string(), config.driver.clone()]);
        }
        push_pairs(&mut args, "--opt", &config.options);
        push_pairs(&mut args, "--label", &config.labels);
        args.push(config.name.clone());

        let args: Vec<&str> = args.iter().map(String::as_str).collect();
        self.run(&args).await?;
        Ok(())
    }

    async fn ensure_network(&self, config: &NetworkConfig) -> Result<()> {
        if self.run(&["network", "inspect", &config.name]).await.is_ok() {
            debug!(network = %config.name, "network already present");
            return Ok(());
        }

        let mut args = vec!["network".to_string(), "create".to_string()];
        if !config.driver.is_empty() {
            args.extend(["--driver".to_string(), config.driver.clone()]);
        }
        if config.internal {
            args.push("--internal".to_string());
        }
        if config.attachable {
            args.push("--attachable".to_string());
        }
        if config.ingress {
            args.push("--ingress".to_string());
        }
        if !config.ipam.driver.is_empty() {
            args.extend(["--ipam-driver".to_string(), config.ipam.driver.clone()]);
        }
        for pool in &config.ipam.config {
            if pool.subnet.is_empty() {
                continue;
            }
            args.extend(["--subnet".to_string(), pool.subnet.clone()]);
            if !pool.gateway.is_empty() {
                args.extend(["--gateway".to_string(), pool.gateway.clone()]);
            }
            if !pool.ip_range.is_empty() {
                args.extend(["--ip-range".to_string(), pool.ip_range.clone()]);
            }
        }
        push_pairs(&mut args, "--opt", &config.options);
        push_pairs(&mut args, "--label", &config.labels);
        args.push(config.name.clone());

        let args: Vec<&str> = args.iter().map(String::as_str).collect();
        match self.run(&args).await {
            Ok(_) => Ok(()),
            // Someone else may have created it in the meantime
            Err(e) => match self.run(&["network", "inspect", &config.name]).await {
                Ok(_) => Ok(()),
                Err(_) => Err(e),
            },
        }
    }

    async fn import_image(&self, archive: &Path, reference: Option<&str>) -> Result<String> {
        let archive = archive.to_string_lossy().into_owned();
        let mut args = vec!["import", archive.as_str()];
        if let Some(reference) = reference {
            args.push(reference);
        }
        self.run_text(&args).await
    }

    async fn create_volume(&self, name: &str) -> Result<()> {
        self.run(&["volume", "create", name]).await?;
        Ok(())
    }

    async fn extract_into_volume(&self, volume: &str, archive: &Path, pseudo_root: &str) -> Result<()> {
        let staging = stage_volume_data(archive, pseudo_root).await?;
        let target = format!("{}:/restore", volume);
        let source = format!("{}:/source:ro", staging.path().display());
        self.run(&[
            "run",
            "--rm",
            "-v",
            &target,
            "-v",
            &source,
            &self.helper_image,
            "sh",
            "-c",
            "cp -a /source/. /restore/",
        ])
        .await?;
        Ok(())
    }

    async fn create_unit(&self, image: &str, name: &str, mounts: &[Mount]) -> Result<String> {
        let mut args = vec!["create".to_string()];
        if !name.is_empty() {
            args.extend(["--name".to_string(), name.to_string()]);
        }
        for flag in mounts.iter().filter_map(mount_flag) {
            args.extend(["-v".to_string(), flag]);
        }
        args.push(image.to_string());

        let args: Vec<&str> = args.iter().map(String::as_str).collect();
        self.run_text(&args).await
    }

    async fn create_unit_from_spec(&self, spec: &UnitSpec) -> Result<Capability<String>> {
        let plan = create_plan(spec);
        let args: Vec<&str> = plan.create.iter().map(String::as_str).collect();
        let stdout = self.run_text(&args).await?;
        // Pull progress may precede the id
        let id = stdout.lines().last().unwrap_or_default().trim().to_string();

        for connect in &plan.connects {
            let mut args: Vec<&str> = connect.iter().map(String::as_str).collect();
            args.push(&id);
            if let Err(e) = self.run(&args).await {
                warn!(container = %id, error = %e, "network attach failed, removing container");
                if let Err(rm) = self.run(&["rm", "-f", &id]).await {
                    debug!(container = %id, error = %rm, "cleanup after failed attach");
                }
                return Err(e);
            }
        }
        Ok(Capability::Supported(id))
    }

    async fn start_unit(&self, id: &str) -> Result<()> {
        self.run(&["start", id]).await?;
        Ok(())
    }

    async fn remove_unit(&self, name: &str) -> Result<()> {
        self.run(&["rm", "-f", name]).await?;
        Ok(())
    }

    async fn unit_state(&self, id: &str) -> Result<UnitState> {
        let stdout = self.run(&["inspect", "--type", "container", id]).await?;
        let inspect = UnitInspect::parse(&stdout)?;
        let state = inspect.state.unwrap_or_default();
        Ok(UnitState {
            status: state.status,
            health: state.health.map(|h| h.status).filter(|s| !s.is_empty()),
        })
    }

    async fn list_project_units_by_label(&self, project: &str) -> Result<Vec<ProjectContainerRef>> {
        let filter = format!("label={}={}", PROJECT_LABEL, project);
        self.list_project(&filter, project, true).await
    }

    async fn list_project_units_by_name(&self, project: &str) -> Result<Vec<ProjectContainerRef>> {
        let filter = format!("name={}", project);
        self.list_project(&filter, project, false).await
    }
}
