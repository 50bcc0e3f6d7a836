//! Restore-time transforms of a recorded container configuration.
//!
//! [`prepare_unit`] turns a parsed inspect document into a creation spec by
//! applying, in order:
//! 1. port binding host IP validation
//! 2. forced or interface-derived bind IP
//! 3. static endpoint address relaxing
//! 4. safe-mode drops (devices, capabilities, seccomp, apparmor)
//! 5. relocation of missing bind sources
//! 6. final name resolution
//!
//! Network definitions captured at backup time go through [`prepare_network`]
//! before they are ensured.

use super::options::RestoreOptions;
use crate::fs::paths::{base_name, safe_name};
use crate::runtime::host::conflicts_with;
use crate::runtime::inspect::{EndpointSpec, HostConfig, UnitInspect, UnitSpec};
use crate::runtime::NetworkConfig;
use crate::utils::Result;
use ipnetwork::Ipv4Network;
use std::collections::BTreeMap;
use std::net::{IpAddr, Ipv4Addr};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Drivers that attach containers straight to a host interface.
const HOST_ADJACENT_DRIVERS: [&str; 2] = ["macvlan", "ipvlan"];

/// What the restoring host looks like.
#[derive(Debug, Clone, Default)]
pub struct HostFacts {
    pub addrs: Vec<Ipv4Addr>,
    pub networks: Vec<Ipv4Network>,
    /// IP every port binding is pinned to, if any
    pub bind_ip: Option<Ipv4Addr>,
}

/// A bind source moved under the restore root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Relocation {
    pub from: String,
    pub to: String,
}

/// Creation spec plus what the transforms changed on the way.
#[derive(Debug, Clone)]
pub struct PreparedUnit {
    pub spec: UnitSpec,
    pub relocations: Vec<Relocation>,
    pub ip_conflict: bool,
}

/// Rename attached networks through `network_map`, including a network
/// mode that names one of them.
pub fn remap_networks(inspect: &mut UnitInspect, network_map: &BTreeMap<String, String>) {
    if network_map.is_empty() {
        return;
    }

    if let Some(host_config) = inspect.host_config.as_mut() {
        let mode = host_config.extra.get("NetworkMode").and_then(|m| m.as_str());
        if let Some(new_mode) = mode.and_then(|m| network_map.get(m)) {
            info!(from = ?mode, to = %new_mode, "remapping network mode");
            host_config
                .extra
                .insert("NetworkMode".to_string(), new_mode.clone().into());
        }
    }

    let Some(networks) = inspect
        .network_settings
        .as_mut()
        .and_then(|s| s.networks.as_mut())
    else {
        return;
    };

    *networks = std::mem::take(networks)
        .into_iter()
        .map(|(name, endpoint)| match network_map.get(&name) {
            Some(new_name) => {
                info!(from = %name, to = %new_name, "remapping network attachment");
                (new_name.clone(), endpoint)
            }
            None => (name, endpoint),
        })
        .collect();
}

/// Rename a captured network, apply a parent interface override and, when
/// asked to, downgrade a macvlan/ipvlan network without a usable parent to a
/// bridge.
pub fn prepare_network(
    config: &mut NetworkConfig,
    options: &RestoreOptions,
    parent_exists: impl Fn(&str) -> bool,
) {
    let original = config.name.clone();
    if let Some(new_name) = options.network_map.get(&original) {
        config.name = new_name.clone();
    }

    let parent = options
        .parent_map
        .get(&config.name)
        .or_else(|| options.parent_map.get(&original));
    if let Some(parent) = parent {
        config.options.insert("parent".to_string(), parent.clone());
    }

    if options.fallback_bridge && HOST_ADJACENT_DRIVERS.contains(&config.driver.as_str()) {
        let usable = config
            .options
            .get("parent")
            .map(|p| !p.is_empty() && parent_exists(p))
            .unwrap_or(false);
        if !usable {
            warn!(network = %config.name, driver = %config.driver, "no usable parent interface, falling back to bridge");
            config.driver = "bridge".to_string();
            config.options.remove("parent");
        }
    }
}

/// Build the creation spec for a restored container.
pub fn prepare_unit(
    inspect: &UnitInspect,
    image: &str,
    options: &RestoreOptions,
    host: &HostFacts,
    bind_root: Option<&Path>,
) -> Result<PreparedUnit> {
    let mut config = inspect.config.clone().unwrap_or_default();
    config.image = image.to_string();
    let mut host_config = inspect.host_config.clone().unwrap_or_default();
    let mut endpoints = endpoint_specs(inspect);

    filter_port_bindings(&mut host_config, &host.addrs, options.drop_host_ips);
    if let Some(ip) = host.bind_ip {
        pin_port_bindings(&mut host_config, ip);
    }

    let ip_conflict = relax_static_ips(
        &mut endpoints,
        &host.networks,
        options.reassign_ips,
        options.auto_relax_ips,
    );

    apply_safe_mode(&mut host_config, options);

    let relocations = match bind_root {
        Some(root) => relocate_binds(&mut host_config, root)?,
        None => Vec::new(),
    };

    Ok(PreparedUnit {
        spec: UnitSpec {
            name: resolve_name(inspect, options.name.as_deref()),
            config,
            host_config,
            endpoints,
        },
        relocations,
        ip_conflict,
    })
}

/// Endpoint settings worth replaying: aliases and static addresses.
pub fn endpoint_specs(inspect: &UnitInspect) -> BTreeMap<String, EndpointSpec> {
    inspect
        .network_settings
        .as_ref()
        .and_then(|s| s.networks.as_ref())
        .map(|networks| {
            networks
                .iter()
                .map(|(name, endpoint)| {
                    let ipam_config = endpoint.ipam_config.clone().filter(|c| {
                        c.ipv4_address.as_deref().is_some_and(|a| !a.is_empty())
                            || c.ipv6_address.as_deref().is_some_and(|a| !a.is_empty())
                    });
                    let spec = EndpointSpec {
                        aliases: endpoint.aliases.clone(),
                        ipam_config,
                    };
                    (name.clone(), spec)
                })
                .collect()
        })
        .unwrap_or_default()
}

fn binds_all(host_ip: &str) -> bool {
    host_ip.is_empty()
        || host_ip
            .parse::<IpAddr>()
            .map(|ip| ip.is_unspecified())
            .unwrap_or(false)
}

/// Drop (or, with `drop_host_ips`, clear the IP of) every port binding whose
/// host IP is not an address of this host. Wildcard bindings are kept.
pub fn filter_port_bindings(host_config: &mut HostConfig, host_addrs: &[Ipv4Addr], drop_host_ips: bool) {
    let Some(ports) = host_config.port_bindings.as_mut() else {
        return;
    };

    ports.retain(|port, bindings| {
        let Some(list) = bindings.as_mut() else {
            return true;
        };
        if list.is_empty() {
            return true;
        }

        list.retain_mut(|binding| {
            let on_host = binding
                .host_ip
                .parse::<Ipv4Addr>()
                .map(|ip| host_addrs.contains(&ip))
                .unwrap_or(false);
            if binds_all(&binding.host_ip) || on_host {
                return true;
            }
            if drop_host_ips {
                info!(port = %port, host_ip = %binding.host_ip, "host IP not on this host, binding to all addresses");
                binding.host_ip.clear();
                true
            } else {
                warn!(port = %port, host_ip = %binding.host_ip, host_port = %binding.host_port, "host IP not on this host, dropping port binding");
                false
            }
        });
        !list.is_empty()
    });
}

/// Point every remaining port binding at `ip`.
pub fn pin_port_bindings(host_config: &mut HostConfig, ip: Ipv4Addr) {
    let bindings = host_config
        .port_bindings
        .iter_mut()
        .flat_map(|ports| ports.values_mut())
        .flatten()
        .flatten();
    for binding in bindings {
        binding.host_ip = ip.to_string();
    }
}

/// Flag static endpoint IPv4 addresses that fall inside a host subnet and drop
/// static addresses when `reassign`, or `auto_relax` with a conflict, is set.
/// Returns whether any conflict was seen.
pub fn relax_static_ips(
    endpoints: &mut BTreeMap<String, EndpointSpec>,
    host_networks: &[Ipv4Network],
    reassign: bool,
    auto_relax: bool,
) -> bool {
    let mut conflict = false;
    for (network, endpoint) in endpoints.iter() {
        let addr = endpoint
            .ipam_config
            .as_ref()
            .and_then(|c| c.ipv4_address.as_deref())
            .and_then(|a| a.parse::<Ipv4Addr>().ok());
        if let Some(addr) = addr {
            if conflicts_with(addr, host_networks) {
                warn!(network = %network, address = %addr, "static address overlaps a host subnet");
                conflict = true;
            }
        }
    }

    if reassign || (auto_relax && conflict) {
        for (network, endpoint) in endpoints.iter_mut() {
            if endpoint.ipam_config.take().is_some() {
                info!(network = %network, "dropping static address assignment");
            }
        }
    }
    conflict
}

fn is_security_opt(opt: &str, kind: &str) -> bool {
    opt.strip_prefix(kind)
        .is_some_and(|rest| rest.starts_with('=') || rest.starts_with(':'))
}

/// Strip host-specific privileges selected by the safe-mode flags.
pub fn apply_safe_mode(host_config: &mut HostConfig, options: &RestoreOptions) {
    if options.drop_devices && host_config.devices.take().is_some() {
        info!("dropping device passthrough");
    }
    if options.drop_caps {
        let added = host_config.cap_add.take().is_some();
        let dropped = host_config.cap_drop.take().is_some();
        if added || dropped {
            info!("dropping capability changes");
        }
    }
    if options.drop_seccomp || options.drop_apparmor {
        if let Some(security) = host_config.security_opt.as_mut() {
            security.retain(|opt| {
                let drop = (options.drop_seccomp && is_security_opt(opt, "seccomp"))
                    || (options.drop_apparmor && is_security_opt(opt, "apparmor"));
                if drop {
                    info!(option = %opt, "dropping security option");
                }
                !drop
            });
        }
    }
}

/// Where a missing bind source is recreated under `root`.
pub fn relocated_source(root: &Path, source: &str) -> PathBuf {
    root.join(safe_name(&base_name(Path::new(source))))
}

/// Move every bind whose host source is gone under `root`, creating the new
/// directory.
pub fn relocate_binds(host_config: &mut HostConfig, root: &Path) -> Result<Vec<Relocation>> {
    let mut relocations: Vec<Relocation> = Vec::new();
    let mut relocate = |source: &str| -> Result<Option<String>> {
        if !source.starts_with('/') || Path::new(source).exists() {
            return Ok(None);
        }
        let target = relocated_source(root, source);
        std::fs::create_dir_all(&target)?;
        let to = target.to_string_lossy().to_string();
        if !relocations.iter().any(|r| r.from == source) {
            info!(from = %source, to = %to, "relocating missing bind source");
            relocations.push(Relocation {
                from: source.to_string(),
                to: to.clone(),
            });
        }
        Ok(Some(to))
    };

    for mount in host_config.mounts.iter_mut().flatten() {
        if mount.kind == "bind" {
            if let Some(to) = relocate(&mount.source)? {
                mount.source = to;
            }
        }
    }

    for bind in host_config.binds.iter_mut().flatten() {
        let Some((source, rest)) = bind.split_once(':') else {
            continue;
        };
        if let Some(to) = relocate(source)? {
            *bind = format!("{}:{}", to, rest);
        }
    }

    Ok(relocations)
}

/// Final container name: the override, else the recorded name.
pub fn resolve_name(inspect: &UnitInspect, name_override: Option<&str>) -> String {
    match name_override.filter(|n| !n.is_empty()) {
        Some(name) => name.to_string(),
        None => inspect.name.trim_start_matches('/').to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const INSPECT: &str = r#"{
        "Id": "abc123",
        "Name": "/web",
        "Config": {"Image": "nginx:1.25", "Env": ["A=1"]},
        "HostConfig": {
            "PortBindings": {
                "80/tcp": [{"HostIp": "203.0.113.9", "HostPort": "8080"}],
                "443/tcp": [{"HostIp": "", "HostPort": "8443"}],
                "53/udp": [{"HostIp": "127.0.0.1", "HostPort": "5353"}, {"HostIp": "0.0.0.0", "HostPort": "5354"}]
            },
            "Devices": [{"PathOnHost": "/dev/ttyUSB0", "PathInContainer": "/dev/ttyUSB0"}],
            "CapAdd": ["NET_ADMIN"],
            "SecurityOpt": ["seccomp=unconfined", "apparmor=unconfined", "no-new-privileges"]
        },
        "NetworkSettings": {"Networks": {
            "frontend": {"IPAMConfig": {"IPv4Address": "172.17.0.5"}, "Aliases": ["web"]},
            "backend": {"IPAMConfig": {"IPv4Address": "10.99.0.7"}}
        }}
    }"#;

    fn inspect() -> UnitInspect {
        UnitInspect::parse(INSPECT.as_bytes()).unwrap()
    }

    fn host() -> HostFacts {
        HostFacts {
            addrs: vec![Ipv4Addr::LOCALHOST, Ipv4Addr::new(192, 168, 1, 20)],
            networks: vec![
                "127.0.0.0/8".parse().unwrap(),
                "172.17.0.0/16".parse().unwrap(),
                "192.168.1.0/24".parse().unwrap(),
            ],
            bind_ip: None,
        }
    }

    fn host_ips(spec: &UnitSpec, port: &str) -> Vec<String> {
        spec.host_config
            .port_bindings
            .as_ref()
            .and_then(|p| p.get(port))
            .cloned()
            .flatten()
            .unwrap_or_default()
            .into_iter()
            .map(|b| b.host_ip)
            .collect()
    }

    #[test]
    fn test_unknown_host_ip_binding_dropped() {
        let prepared = prepare_unit(&inspect(), "nginx:1.25", &RestoreOptions::default(), &host(), None).unwrap();
        let ports = prepared.spec.host_config.port_bindings.as_ref().unwrap();
        assert!(!ports.contains_key("80/tcp"));
        assert_eq!(host_ips(&prepared.spec, "443/tcp"), vec![""]);
        assert_eq!(host_ips(&prepared.spec, "53/udp"), vec!["127.0.0.1", "0.0.0.0"]);
    }

    #[test]
    fn test_unknown_host_ip_cleared_with_drop_host_ips() {
        let options = RestoreOptions {
            drop_host_ips: true,
            ..Default::default()
        };
        let prepared = prepare_unit(&inspect(), "nginx:1.25", &options, &host(), None).unwrap();
        assert_eq!(host_ips(&prepared.spec, "80/tcp"), vec![""]);
        let port = &prepared.spec.host_config.port_bindings.as_ref().unwrap()["80/tcp"];
        assert_eq!(port.as_ref().unwrap()[0].host_port, "8080");
    }

    #[test]
    fn test_bind_ip_pins_every_binding() {
        let facts = HostFacts {
            bind_ip: Some(Ipv4Addr::new(192, 168, 1, 20)),
            ..host()
        };
        let prepared = prepare_unit(&inspect(), "nginx:1.25", &RestoreOptions::default(), &facts, None).unwrap();
        assert_eq!(host_ips(&prepared.spec, "443/tcp"), vec!["192.168.1.20"]);
        assert_eq!(host_ips(&prepared.spec, "53/udp"), vec!["192.168.1.20", "192.168.1.20"]);
    }

    #[test]
    fn test_auto_relax_clears_conflicting_static_ip() {
        let options = RestoreOptions {
            auto_relax_ips: true,
            ..Default::default()
        };
        let prepared = prepare_unit(&inspect(), "nginx:1.25", &options, &host(), None).unwrap();
        assert!(prepared.ip_conflict);
        let frontend = &prepared.spec.endpoints["frontend"];
        assert!(frontend.ipam_config.is_none());
        assert_eq!(frontend.aliases.as_deref(), Some(&["web".to_string()][..]));

        let body = prepared.spec.to_create_body().unwrap();
        assert!(body["NetworkingConfig"]["EndpointsConfig"]["frontend"]
            .get("IPAMConfig")
            .is_none());
    }

    #[test]
    fn test_static_ip_kept_without_relax_flags() {
        let prepared = prepare_unit(&inspect(), "nginx:1.25", &RestoreOptions::default(), &host(), None).unwrap();
        assert!(prepared.ip_conflict);
        let frontend = &prepared.spec.endpoints["frontend"];
        assert_eq!(
            frontend.ipam_config.as_ref().unwrap().ipv4_address.as_deref(),
            Some("172.17.0.5")
        );
    }

    #[test]
    fn test_reassign_drops_every_static_ip() {
        let mut endpoints = endpoint_specs(&inspect());
        let conflict = relax_static_ips(&mut endpoints, &[], true, false);
        assert!(!conflict);
        assert!(endpoints.values().all(|e| e.ipam_config.is_none()));
    }

    #[test]
    fn test_safe_mode_drops() {
        let options = RestoreOptions {
            drop_devices: true,
            drop_caps: true,
            drop_seccomp: true,
            ..Default::default()
        };
        let prepared = prepare_unit(&inspect(), "nginx:1.25", &options, &host(), None).unwrap();
        let hc = &prepared.spec.host_config;
        assert!(hc.devices.is_none());
        assert!(hc.cap_add.is_none());
        assert_eq!(
            hc.security_opt.as_deref(),
            Some(&["apparmor=unconfined".to_string(), "no-new-privileges".to_string()][..])
        );
    }

    #[test]
    fn test_relocate_missing_bind_sources() {
        let root = TempDir::new().unwrap();
        let existing = TempDir::new().unwrap();
        let existing_src = existing.path().to_string_lossy().to_string();

        let mut host_config = HostConfig {
            binds: Some(vec![
                "/nonexistent/app-config:/etc/app:ro".to_string(),
                format!("{}:/data", existing_src),
                "named:/var/lib".to_string(),
            ]),
            ..Default::default()
        };

        let relocations = relocate_binds(&mut host_config, root.path()).unwrap();
        let target = root.path().join("app-config");
        assert!(target.is_dir());
        assert_eq!(
            relocations,
            vec![Relocation {
                from: "/nonexistent/app-config".to_string(),
                to: target.to_string_lossy().to_string(),
            }]
        );
        let binds = host_config.binds.unwrap();
        assert_eq!(binds[0], format!("{}:/etc/app:ro", target.display()));
        assert_eq!(binds[1], format!("{}:/data", existing_src));
        assert_eq!(binds[2], "named:/var/lib");
    }

    #[test]
    fn test_prepare_network() {
        let options = RestoreOptions {
            network_map: BTreeMap::from([("lan".to_string(), "lan2".to_string())]),
            parent_map: BTreeMap::from([("lan2".to_string(), "eth1".to_string())]),
            fallback_bridge: true,
            ..Default::default()
        };

        let mut mapped = NetworkConfig {
            name: "lan".to_string(),
            driver: "macvlan".to_string(),
            ..Default::default()
        };
        prepare_network(&mut mapped, &options, |p| p == "eth1");
        assert_eq!(mapped.name, "lan2");
        assert_eq!(mapped.driver, "macvlan");
        assert_eq!(mapped.options.get("parent").map(String::as_str), Some("eth1"));

        let mut orphan = NetworkConfig {
            name: "iot".to_string(),
            driver: "ipvlan".to_string(),
            options: BTreeMap::from([("parent".to_string(), "eth9".to_string())]),
            ..Default::default()
        };
        prepare_network(&mut orphan, &options, |p| p == "eth1");
        assert_eq!(orphan.driver, "bridge");
        assert!(!orphan.options.contains_key("parent"));
    }

    #[test]
    fn test_remap_and_name() {
        let mut inspect = inspect();
        remap_networks(
            &mut inspect,
            &BTreeMap::from([("frontend".to_string(), "edge".to_string())]),
        );
        assert_eq!(inspect.network_names(), vec!["backend", "edge"]);

        assert_eq!(resolve_name(&inspect, None), "web");
        assert_eq!(resolve_name(&inspect, Some("web-restored")), "web-restored");
        assert_eq!(resolve_name(&inspect, Some("")), "web");
    }

    #[test]
    fn test_remap_rewrites_network_mode() {
        let mut inspect = inspect();
        inspect
            .host_config
            .as_mut()
            .unwrap()
            .extra
            .insert("NetworkMode".to_string(), "frontend".into());
        let map = BTreeMap::from([("frontend".to_string(), "edge".to_string())]);
        remap_networks(&mut inspect, &map);

        let prepared = prepare_unit(&inspect, "nginx:1.25", &RestoreOptions::default(), &host(), None).unwrap();
        let body = prepared.spec.to_create_body().unwrap();
        assert_eq!(body["HostConfig"]["NetworkMode"], "edge");
        assert!(body["NetworkingConfig"]["EndpointsConfig"]["edge"].is_object());
        assert!(body["NetworkingConfig"]["EndpointsConfig"]["frontend"].is_null());

        let mut host_mode = self::inspect();
        host_mode
            .host_config
            .as_mut()
            .unwrap()
            .extra
            .insert("NetworkMode".to_string(), "host".into());
        remap_networks(&mut host_mode, &map);
        assert_eq!(host_mode.host_config.unwrap().extra["NetworkMode"], "host");
    }
}
