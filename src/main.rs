//! Smart LVM Manager
//!
//! Command-line entry point. One-shot subcommands run a single operation
//! against the host; `daemon` runs the usage monitor, the backup schedule
//! and the REST API until interrupted.

use anyhow::Context;
use clap::{Parser, Subcommand};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use smart_lvm_manager::domain::{format_bytes, parse_size};
use smart_lvm_manager::{
    ApiServer, ApiServerConfig, ApiState, AuditLog, AutoApprove, BackendConfig, BackendFactory,
    BackendKind, BackupManager, Confirmer, FsType, InventoryService, LifecycleOrchestrator,
    LvSpec, LvmConfig, ManagerConfig, ManagerMetrics, OperationGuard, OperationReport, Origin,
    SnapshotManager, StdinConfirmer, UsageMonitor, VolumeBackendRef,
};

// =============================================================================
// CLI Arguments
// =============================================================================

/// Smart LVM Manager - volume lifecycle, usage monitoring and metadata backups
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// YAML configuration file
    #[arg(long, short, global = true, env = "LVM_MANAGER_CONFIG")]
    config: Option<PathBuf>,

    /// Volume backend (lvm, memory)
    #[arg(long, global = true, env = "LVM_MANAGER_BACKEND")]
    backend: Option<String>,

    /// Validate and record operations without executing them
    #[arg(long, global = true)]
    dry_run: bool,

    /// Skip interactive confirmation
    #[arg(long, short, global = true)]
    yes: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, global = true, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Output logs as JSON
    #[arg(long, global = true, env = "LOG_JSON")]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the usage monitor, backup schedule and REST API
    Daemon {
        /// REST API bind address
        #[arg(long, env = "API_ADDR", default_value = "0.0.0.0:8090")]
        api_addr: String,
    },
    /// Show devices, volume groups and logical volumes
    Status {
        /// Print the full inventory as JSON
        #[arg(long)]
        json: bool,
    },
    /// Initialise block devices as physical volumes
    CreatePv {
        #[arg(required = true)]
        devices: Vec<String>,
    },
    /// Create a volume group from unassigned physical volumes
    CreateVg {
        name: String,
        #[arg(required = true)]
        devices: Vec<String>,
        /// Physical extent size
        #[arg(long, default_value = "4M")]
        extent_size: String,
    },
    /// Add physical volumes to a volume group
    ExtendVg {
        name: String,
        #[arg(required = true)]
        devices: Vec<String>,
    },
    /// Create a logical volume, optionally formatted and mounted
    CreateLv {
        vg: String,
        name: String,
        #[arg(long)]
        size: String,
        /// Filesystem to create (ext4, xfs, ...)
        #[arg(long)]
        fs: Option<String>,
        /// Mount point (requires --fs)
        #[arg(long)]
        mount: Option<String>,
    },
    /// Grow a logical volume and its filesystem
    ExtendLv {
        /// Volume as vg/lv
        lv: String,
        /// Amount to add
        #[arg(long)]
        by: String,
    },
    /// Create a snapshot of a logical volume
    Snapshot {
        /// Origin volume as vg/lv
        lv: String,
        name: String,
        /// Copy-on-write space
        #[arg(long)]
        size: String,
    },
    /// List snapshots of a logical volume
    Snapshots {
        /// Origin volume as vg/lv
        lv: String,
    },
    /// Write a metadata backup archive now
    Backup,
    /// List backup archives
    Backups,
    /// Delete archives older than the retention period
    Prune {
        /// Overrides the configured retention
        #[arg(long)]
        days: Option<u32>,
    },
    /// Run a single monitor tick and print the report
    MonitorOnce,
}

// =============================================================================
// Main
// =============================================================================

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    init_logging(&args)?;

    let mut config = match &args.config {
        Some(path) => ManagerConfig::from_yaml_file(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => ManagerConfig::default(),
    };
    if let Some(backend) = &args.backend {
        config.backend = backend.parse()?;
    }
    if args.dry_run {
        config.dry_run_default = true;
    }
    config.validate()?;

    let services = Services::build(config, args.yes)?;

    match args.command {
        Command::Daemon { api_addr } => run_daemon(services, &api_addr).await?,
        Command::Status { json } => {
            let inventory = services.inventory.refresh().await?;
            if json {
                print_json(&inventory)?;
            } else {
                print_status(&inventory);
            }
        }
        Command::CreatePv { devices } => {
            let inventory = services.inventory.refresh().await?;
            let context = services.lifecycle.operator_context(false);
            let report = services.lifecycle.create_pv(&inventory, &devices, context).await?;
            print_report(&report)?;
        }
        Command::CreateVg {
            name,
            devices,
            extent_size,
        } => {
            let extent = parse_size(&extent_size)?;
            let inventory = services.inventory.refresh().await?;
            let context = services.lifecycle.operator_context(false);
            let report = services
                .lifecycle
                .create_vg(&inventory, &name, extent, &devices, context)
                .await?;
            print_report(&report)?;
        }
        Command::ExtendVg { name, devices } => {
            let inventory = services.inventory.refresh().await?;
            let context = services.lifecycle.operator_context(false);
            let report = services
                .lifecycle
                .extend_vg(&inventory, &name, &devices, context)
                .await?;
            print_report(&report)?;
        }
        Command::CreateLv {
            vg,
            name,
            size,
            fs,
            mount,
        } => {
            let spec = LvSpec {
                name,
                vg_name: vg,
                size_bytes: parse_size(&size)?,
                fs_type: fs.as_deref().map(str::parse::<FsType>).transpose()?,
                mount_point: mount,
            };
            let inventory = services.inventory.refresh().await?;
            let context = services.lifecycle.operator_context(false);
            let report = services.lifecycle.create_lv(&inventory, &spec, context).await?;
            print_report(&report)?;
        }
        Command::ExtendLv { lv, by } => {
            let delta = parse_size(&by)?;
            let inventory = services.inventory.refresh().await?;
            let context = services.lifecycle.operator_context(false);
            let report = services
                .lifecycle
                .extend_lv(&inventory, &lv, delta, context)
                .await?;
            print_report(&report)?;
        }
        Command::Snapshot { lv, name, size } => {
            let size = parse_size(&size)?;
            let inventory = services.inventory.refresh().await?;
            let context = services.lifecycle.operator_context(false);
            let report = services
                .snapshots
                .create(&inventory, &lv, &name, size, context)
                .await?;
            print_report(&report)?;
        }
        Command::Snapshots { lv } => {
            let inventory = services.inventory.refresh().await?;
            print_json(&services.snapshots.list(&inventory, &lv)?)?;
        }
        Command::Backup => {
            let archive = services.backups.create(Origin::Operator).await?;
            info!("Backup written to {}", archive.path.display());
            print_json(&archive)?;
        }
        Command::Backups => print_json(&services.backups.list()?)?,
        Command::Prune { days } => {
            let days = days.unwrap_or(services.backups.config().retention_days);
            let report = services.backups.prune(days, Origin::Operator).await?;
            print_json(&report)?;
        }
        Command::MonitorOnce => {
            let report = services.monitor.tick().await;
            print_json(&report)?;
        }
    }

    Ok(())
}

// =============================================================================
// Service Wiring
// =============================================================================

struct Services {
    inventory: InventoryService,
    audit: Arc<AuditLog>,
    metrics: ManagerMetrics,
    lifecycle: Arc<LifecycleOrchestrator>,
    snapshots: SnapshotManager,
    monitor: Arc<UsageMonitor>,
    backups: Arc<BackupManager>,
}

impl Services {
    fn build(config: ManagerConfig, assume_yes: bool) -> anyhow::Result<Self> {
        let backend: VolumeBackendRef = BackendFactory::create(
            config.backend,
            BackendConfig {
                lvm: LvmConfig {
                    binary_dir: config.lvm_binary_dir.clone(),
                    ..Default::default()
                },
            },
        );
        if config.backend == BackendKind::Memory {
            warn!("Running against the in-memory backend, no host storage is touched");
        }

        let metrics = ManagerMetrics::new()?;
        let mut audit = AuditLog::new()
            .with_retention(config.audit_retained_records)
            .with_metrics(metrics.clone());
        if let Some(path) = &config.audit_log_path {
            audit = audit
                .with_sink(path)
                .with_context(|| format!("opening audit log {}", path.display()))?;
        }
        let audit = Arc::new(audit);

        let confirmer: Arc<dyn Confirmer> = if assume_yes {
            Arc::new(AutoApprove)
        } else {
            Arc::new(StdinConfirmer)
        };

        let inventory = InventoryService::new(backend.clone());
        let guard = Arc::new(OperationGuard::new(
            config.guard_config(),
            inventory.clone(),
            confirmer,
            audit.clone(),
        ));
        let lifecycle = Arc::new(LifecycleOrchestrator::new(
            config.lifecycle_config(),
            backend.clone(),
            guard.clone(),
        ));
        let snapshots = SnapshotManager::new(config.snapshot_config(), backend.clone(), guard);
        let monitor = Arc::new(
            UsageMonitor::new(
                config.monitor_config()?,
                inventory.clone(),
                lifecycle.clone(),
                audit.clone(),
            )
            .with_metrics(metrics.clone()),
        );
        let backups = Arc::new(
            BackupManager::new(config.backup_config(), inventory.clone(), backend, audit.clone())
                .with_metrics(metrics.clone()),
        );

        Ok(Self {
            inventory,
            audit,
            metrics,
            lifecycle,
            snapshots,
            monitor,
            backups,
        })
    }
}

// =============================================================================
// Daemon
// =============================================================================

async fn run_daemon(services: Services, api_addr: &str) -> anyhow::Result<()> {
    info!("Starting Smart LVM Manager daemon");
    info!("  Version: {}", smart_lvm_manager::VERSION);
    info!("  REST API: {}", api_addr);
    info!(
        "  Auto-extend: {}",
        if services.monitor.config().auto_extend_enabled { "enabled" } else { "disabled" }
    );
    info!(
        "  Backups: {}",
        if services.backups.config().enabled { "enabled" } else { "disabled" }
    );

    let api_config = ApiServerConfig {
        rest_addr: api_addr
            .parse()
            .with_context(|| format!("invalid REST API address {:?}", api_addr))?,
    };

    let cancel = CancellationToken::new();

    let monitor = tokio::spawn(services.monitor.clone().run(cancel.clone()));
    let backups = tokio::spawn(services.backups.clone().run(cancel.clone()));

    let state = ApiState {
        inventory: services.inventory.clone(),
        audit: services.audit.clone(),
        backups: services.backups.clone(),
        monitor: services.monitor.clone(),
        metrics: services.metrics.clone(),
    };
    let api = tokio::spawn(ApiServer::new(api_config, state).run(cancel.clone()));

    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            result.context("listening for shutdown signal")?;
            info!("Shutdown signal received");
        }
        _ = cancel.cancelled() => {}
    }
    cancel.cancel();

    if let Ok(Err(e)) = api.await {
        error!("REST server error: {}", e);
    }
    let (monitor, backups) = tokio::join!(monitor, backups);
    if let Err(e) = monitor {
        error!("Usage monitor task failed: {}", e);
    }
    if let Err(e) = backups {
        error!("Backup schedule task failed: {}", e);
    }

    info!("Daemon shutdown complete");
    Ok(())
}

// =============================================================================
// Output
// =============================================================================

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn print_report(report: &OperationReport) -> anyhow::Result<()> {
    if report.is_dry_run() {
        println!("dry run: nothing was changed");
    }
    print_json(&report.record)
}

fn print_status(inventory: &smart_lvm_manager::ResourceInventory) {
    println!("Volume groups:");
    for vg in inventory.vgs.values() {
        println!(
            "  {:<16} size {:>10}  free {:>10}  pvs {}",
            vg.name,
            format_bytes(vg.size_bytes),
            format_bytes(vg.free_bytes),
            vg.pv_devices.len()
        );
    }

    println!("Logical volumes:");
    for lv in inventory.lvs.values() {
        let usage = lv
            .usage_percent()
            .map(|u| format!("{:.1}%", u))
            .unwrap_or_else(|| "-".to_string());
        let kind = match &lv.origin {
            Some(origin) => format!("snapshot of {}", origin),
            None => lv.mount_point.clone().unwrap_or_default(),
        };
        println!(
            "  {:<24} size {:>10}  used {:>6}  {}",
            lv.path(),
            format_bytes(lv.size_bytes),
            usage,
            kind
        );
    }

    let free: Vec<_> = inventory
        .devices
        .values()
        .filter(|d| !d.is_mounted() && inventory.pv(&d.path).is_none())
        .collect();
    if !free.is_empty() {
        println!("Unused devices:");
        for device in free {
            println!("  {:<16} {:>10}", device.path, format_bytes(device.size_bytes));
        }
    }
}

// =============================================================================
// Logging Setup
// =============================================================================

fn init_logging(args: &Args) -> anyhow::Result<()> {
    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let filter = EnvFilter::from_default_env()
        .add_directive(level.into())
        .add_directive("hyper=warn".parse()?)
        .add_directive("tower=warn".parse()?)
        .add_directive("tower_http=info".parse()?)
        .add_directive("axum=info".parse()?);

    // Logs go to stderr so command output stays parseable
    if args.log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true).with_writer(std::io::stderr))
            .init();
    }

    Ok(())
}
