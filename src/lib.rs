//! Smart LVM Manager - Volume Lifecycle & Usage Monitoring
//!
//! Manages LVM physical volumes, volume groups, logical volumes and
//! snapshots on a single host, watches filesystem usage, extends volumes
//! that run out of room and keeps compressed metadata backups.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────────┐
//! │                         CLI / REST API / Daemon                              │
//! ├─────────────────────────────────────────────────────────────────────────────┤
//! │  ┌─────────────────┐  ┌─────────────────┐  ┌─────────────────────────────┐  │
//! │  │   Lifecycle     │  │     Usage       │  │      Backup &               │  │
//! │  │   Orchestrator  │◄─┤     Monitor     │  │      Retention              │  │
//! │  │   + Snapshots   │  │                 │  │                             │  │
//! │  └────────┬────────┘  └────────┬────────┘  └─────────────┬───────────────┘  │
//! │           │                    │                         │                   │
//! │  ┌────────┴────────┐           │                         │                   │
//! │  │ Operation Guard │  (one mutation at a time, confirm,  │                   │
//! │  │  + Audit Log    │   dry-run, operation records)       │                   │
//! │  └────────┬────────┘           │                         │                   │
//! │           └────────────────────┼─────────────────────────┘                   │
//! │                    ┌───────────┴───────────┐                                │
//! │                    │  Resource Inventory   │                                │
//! │                    └───────────┬───────────┘                                │
//! ├────────────────────────────────┼────────────────────────────────────────────┤
//! │                         Volume Backends                                      │
//! │  ┌─────────────────────────────┐  ┌─────────────────────────────────────┐   │
//! │  │   LVM2 command-line tools   │  │           In-memory model           │   │
//! │  └─────────────────────────────┘  └─────────────────────────────────────┘   │
//! └─────────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Modules
//!
//! - [`inventory`]: Typed snapshot of devices, PVs, VGs and LVs
//! - [`lifecycle`]: Validated create/extend operations
//! - [`guard`]: Mutual exclusion, confirmation and dry-run for mutations
//! - [`monitor`]: Periodic usage evaluation and auto-extension
//! - [`backup`]: Metadata archives and retention
//! - [`snapshot`]: Snapshot creation under quota
//! - [`backends`]: Volume backend adapters
//! - [`audit`]: Operation records
//! - [`api`]: REST surface for the daemon
//! - [`domain`]: Resource model and backend port
//! - [`error`]: Error types and handling

pub mod api;
pub mod audit;
pub mod backends;
pub mod backup;
pub mod config;
pub mod domain;
pub mod error;
pub mod guard;
pub mod inventory;
pub mod lifecycle;
pub mod metrics;
pub mod monitor;
pub mod snapshot;

// Re-export commonly used types
pub use api::{ApiServer, ApiServerConfig, ApiState, RestRouter};

pub use audit::{AuditLog, OperationKind, OperationRecord, Origin, Outcome};

pub use backends::{BackendConfig, BackendFactory, BackendKind, InMemoryBackend, LvmCliBackend, LvmConfig};

pub use backup::{BackupArchive, BackupConfig, BackupManager, PruneReport};

pub use config::ManagerConfig;

pub use domain::model::{
    BlockDevice, FsType, LogicalVolume, PhysicalVolume, Snapshot, VolumeGroup,
};
pub use domain::ports::{BackendOutput, VolumeBackend, VolumeBackendRef};

pub use error::{Error, ErrorAction, ErrorClass, Result};

pub use guard::{
    AutoApprove, Confirmer, DenyAll, GuardConfig, OperationContext, OperationGuard,
    OperationReport, StdinConfirmer,
};

pub use inventory::{InventoryService, ResourceInventory};

pub use lifecycle::{LifecycleConfig, LifecycleOrchestrator, LvSpec};

pub use metrics::ManagerMetrics;

pub use monitor::{Decision, MonitorConfig, TickReport, UsageMonitor};

pub use snapshot::{SnapshotConfig, SnapshotManager};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = env!("CARGO_PKG_NAME");
