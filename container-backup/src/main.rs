//! container-backup - Main entry point
//!
//! Back up and restore containers and compose projects.

use anyhow::{bail, Result};
use clap::{Args as ClapArgs, Parser, Subcommand};
use container_backup::engine::options::parse_mapping;
use container_backup::engine::{
    BackupOptions, BackupRequest, ProjectBackupRequest, ProjectRestoreRequest, RestoreOptions,
    RestoreRequest,
};
use container_backup::shutdown::ShutdownCoordinator;
use container_backup::{archive::EntryKind, config::Config, runtime, utils, Engine};
use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(long, value_name = "FILE", global = true)]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Back up a single container
    Backup {
        /// Container id or name
        container: String,

        /// Output archive path
        #[arg(short, long, value_name = "FILE")]
        output: Option<PathBuf>,

        /// Gzip level (0-9)
        #[arg(short = 'c', long, value_parser = clap::value_parser!(u32).range(0..=9))]
        compression: Option<u32>,
    },

    /// Restore a single container from a backup archive
    Restore {
        archive: PathBuf,

        #[command(flatten)]
        restore: RestoreArgs,
    },

    /// Back up every container of a compose project
    BackupProject {
        /// Project directory
        #[arg(default_value = ".")]
        path: PathBuf,

        /// Output archive path
        #[arg(short, long, value_name = "FILE")]
        output: Option<PathBuf>,

        /// Project name (defaults to the project file's name or the directory name)
        #[arg(short = 'p', long)]
        project_name: Option<String>,

        /// Gzip level (0-9)
        #[arg(short = 'c', long, value_parser = clap::value_parser!(u32).range(0..=9))]
        compression: Option<u32>,
    },

    /// Restore a compose project backup in dependency order
    RestoreProject {
        archive: PathBuf,

        #[command(flatten)]
        restore: RestoreArgs,
    },

    /// List the entries of an archive
    List { archive: PathBuf },

    /// Check that a backup has every required entry
    Validate { archive: PathBuf },

    /// Show what restoring a backup would do
    DryRun { archive: PathBuf },
}

#[derive(ClapArgs, Debug)]
struct RestoreArgs {
    /// Name for the restored container
    #[arg(long)]
    name: Option<String>,

    /// Start the container after creating it
    #[arg(long)]
    start: bool,

    /// After starting, wait until a declared health check passes
    #[arg(long)]
    wait_healthy: bool,

    /// Health wait limit in seconds
    #[arg(long, value_name = "SECS")]
    wait_timeout: Option<u64>,

    /// Rename a network, OLD=NEW (repeatable)
    #[arg(long, value_name = "OLD=NEW", value_parser = parse_pair)]
    network_map: Vec<(String, String)>,

    /// Parent interface for a macvlan/ipvlan network, NET=IFACE (repeatable)
    #[arg(long, value_name = "NET=IFACE", value_parser = parse_pair)]
    parent_map: Vec<(String, String)>,

    /// Bind ports whose host IP is missing here to all addresses instead of dropping them
    #[arg(long)]
    drop_host_ips: bool,

    /// Drop every static container IP
    #[arg(long)]
    reassign_ips: bool,

    /// Drop static container IPs when one overlaps a host subnet
    #[arg(long)]
    auto_relax_ips: bool,

    /// Use a bridge for macvlan/ipvlan networks without a usable parent
    #[arg(long)]
    fallback_bridge: bool,

    /// Host IP for every port binding
    #[arg(long, value_name = "IP")]
    force_bind_ip: Option<Ipv4Addr>,

    /// Bind ports to this interface's IPv4 address
    #[arg(long, value_name = "IFACE")]
    bind_interface: Option<String>,

    /// Drop device passthrough
    #[arg(long)]
    drop_devices: bool,

    /// Drop added and dropped capabilities
    #[arg(long)]
    drop_caps: bool,

    /// Drop seccomp security options
    #[arg(long)]
    drop_seccomp: bool,

    /// Drop apparmor security options
    #[arg(long)]
    drop_apparmor: bool,

    /// Recreate missing bind sources under this directory
    #[arg(long, value_name = "DIR")]
    bind_restore_root: Option<PathBuf>,

    /// Remove an existing container with the same name first
    #[arg(long)]
    replace_existing: bool,
}

impl From<RestoreArgs> for RestoreOptions {
    fn from(args: RestoreArgs) -> Self {
        RestoreOptions {
            name: args.name,
            start: args.start,
            wait_healthy: args.wait_healthy,
            wait_timeout: args.wait_timeout.map(Duration::from_secs),
            network_map: args.network_map.into_iter().collect(),
            parent_map: args.parent_map.into_iter().collect(),
            drop_host_ips: args.drop_host_ips,
            reassign_ips: args.reassign_ips,
            auto_relax_ips: args.auto_relax_ips,
            fallback_bridge: args.fallback_bridge,
            force_bind_ip: args.force_bind_ip,
            bind_interface: args.bind_interface,
            drop_devices: args.drop_devices,
            drop_caps: args.drop_caps,
            drop_seccomp: args.drop_seccomp,
            drop_apparmor: args.drop_apparmor,
            bind_restore_root: args.bind_restore_root,
            replace_existing: args.replace_existing,
        }
    }
}

fn parse_pair(raw: &str) -> std::result::Result<(String, String), String> {
    parse_mapping(raw).map_err(|e| e.to_string())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Load configuration
    let config = Config::load(args.config.as_deref())?;

    // Initialize logging
    let log_level = args.log_level.as_deref().unwrap_or(&config.log.level);
    utils::logger::init(log_level)?;

    tracing::debug!("container-backup v{}", env!("CARGO_PKG_VERSION"));

    // Ctrl-C / SIGTERM cancel whatever is running
    let shutdown = ShutdownCoordinator::new();
    shutdown.listen();

    let adapter = runtime::connect(&config.runtime).await?;
    let engine = Engine::with_cancel(adapter, config, shutdown.token());

    match args.command {
        Command::Backup {
            container,
            output,
            compression,
        } => {
            let options = BackupOptions {
                output,
                compression_level: compression,
            };
            let result = engine.backup(BackupRequest { container, options }).await?;
            println!(
                "backed up {} ({}) to {}",
                result.container_name,
                short_id(&result.container_id),
                result.archive_path.display()
            );
        }

        Command::Restore { archive, restore } => {
            let result = engine
                .restore(RestoreRequest {
                    archive,
                    options: restore.into(),
                })
                .await?;
            println!(
                "restored {} ({}) from image {}",
                result.container_name,
                short_id(&result.container_id),
                result.image
            );
            if result.simple_create {
                tracing::warn!(
                    container = %result.container_name,
                    "created from image and mounts only, host settings were not applied"
                );
            }
            for relocation in &result.relocations {
                println!("bind source {} relocated to {}", relocation.from, relocation.to);
            }
            match result.healthy {
                Some(true) => println!("container is healthy"),
                Some(false) => println!("container did not become healthy"),
                None if result.started => println!("container started"),
                None => {}
            }
        }

        Command::BackupProject {
            path,
            output,
            project_name,
            compression,
        } => {
            let result = engine
                .backup_project(ProjectBackupRequest {
                    project_dir: path,
                    project_name,
                    output,
                    compression_level: compression,
                })
                .await?;
            println!(
                "backed up project {} ({} services) to {}",
                result.project_name,
                result.members.len(),
                result.archive_path.display()
            );
            for member in &result.members {
                println!("  {:<20} {}", member.service, member.container_name);
            }
        }

        Command::RestoreProject { archive, restore } => {
            let result = engine
                .restore_project(ProjectRestoreRequest {
                    archive,
                    options: restore.into(),
                })
                .await?;
            println!("project {}", result.project_name);
            for member in &result.members {
                match (&member.container_id, &member.error) {
                    (_, Some(error)) => println!("  {:<20} FAILED: {}", member.service, error),
                    (Some(id), None) => println!(
                        "  {:<20} {} {}{}",
                        member.service,
                        member.container_name.as_deref().unwrap_or("-"),
                        short_id(id),
                        if member.started { " (started)" } else { "" }
                    ),
                    (None, None) => println!("  {:<20} skipped", member.service),
                }
            }
            if !result.is_complete() {
                bail!("{} service(s) failed to restore", result.failures().count());
            }
        }

        Command::List { archive } => {
            for entry in engine.list(&archive).await? {
                let kind = match entry.kind {
                    EntryKind::Directory => 'd',
                    EntryKind::Symlink => 'l',
                    EntryKind::File => '-',
                    EntryKind::Other => '?',
                };
                println!("{}{:04o} {:>12} {}", kind, entry.mode & 0o7777, entry.size, entry.path);
            }
        }

        Command::Validate { archive } => {
            let result = engine.validate(&archive).await?;
            println!("{}", result.details);
            if !result.valid {
                bail!("invalid backup: {}", archive.display());
            }
        }

        Command::DryRun { archive } => {
            let plan = engine.dry_run(&archive).await?;
            print!("{}", plan);
        }
    }

    Ok(())
}

fn short_id(id: &str) -> &str {
    let id = id.strip_prefix("sha256:").unwrap_or(id);
    id.get(..12).unwrap_or(id)
}
