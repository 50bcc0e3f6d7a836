//! Caller-facing knobs for backup and restore.

use crate::utils::{EngineError, Result};
use std::collections::BTreeMap;
use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::time::Duration;

/// Output options for a single-container backup.
#[derive(Debug, Clone, Default)]
pub struct BackupOptions {
    /// Final archive path. Defaults to `<cwd>/<name>_backup.tar.gz`.
    pub output: Option<PathBuf>,
    /// Gzip level, 0-9. Defaults to `backup.compression_level`.
    pub compression_level: Option<u32>,
}

impl BackupOptions {
    pub fn with_output(mut self, output: impl Into<PathBuf>) -> Self {
        self.output = Some(output.into());
        self
    }

    pub fn with_compression(mut self, level: u32) -> Self {
        self.compression_level = Some(level);
        self
    }
}

/// Restore-time policy. Every flag is independent; the transforms they
/// enable always run in the same order.
#[derive(Debug, Clone, Default)]
pub struct RestoreOptions {
    /// Final container name instead of the recorded one
    pub name: Option<String>,
    pub start: bool,
    pub wait_healthy: bool,
    /// Health wait limit. Defaults to `restore.wait_timeout_secs`.
    pub wait_timeout: Option<Duration>,

    /// Old network name to new network name
    pub network_map: BTreeMap<String, String>,
    /// Network name to host parent interface for macvlan/ipvlan
    pub parent_map: BTreeMap<String, String>,

    /// Clear unknown host IPs on port bindings instead of dropping the binding
    pub drop_host_ips: bool,
    /// Always drop static endpoint addresses
    pub reassign_ips: bool,
    /// Drop static endpoint addresses when one collides with a host subnet
    pub auto_relax_ips: bool,
    /// Turn macvlan/ipvlan networks with no parent into bridges
    pub fallback_bridge: bool,

    pub force_bind_ip: Option<Ipv4Addr>,
    /// Bind ports to this interface's primary IPv4
    pub bind_interface: Option<String>,

    pub drop_devices: bool,
    pub drop_caps: bool,
    pub drop_seccomp: bool,
    pub drop_apparmor: bool,

    /// Where missing bind sources are recreated
    pub bind_restore_root: Option<PathBuf>,
    /// Force-remove a container with the same name before creating
    pub replace_existing: bool,
}

impl RestoreOptions {
    /// Options for one member of a project restore: the member keeps its own
    /// name and is started later, in project order.
    pub(crate) fn for_member(&self) -> Self {
        RestoreOptions {
            name: None,
            start: false,
            wait_healthy: false,
            ..self.clone()
        }
    }
}

/// Parse a `key=value` mapping such as `--network-map old=new`.
pub fn parse_mapping(raw: &str) -> Result<(String, String)> {
    match raw.split_once('=') {
        Some((key, value)) if !key.trim().is_empty() && !value.trim().is_empty() => {
            Ok((key.trim().to_string(), value.trim().to_string()))
        }
        _ => Err(EngineError::Validation {
            field: None,
            message: format!("expected KEY=VALUE, got '{}'", raw),
        }),
    }
}
