//! Manager configuration
//!
//! One explicit configuration struct, loaded from YAML and overridden from
//! the command line. Components never read it globally: each constructor
//! receives the slice it needs (see the `*_config` accessors).

use crate::audit::DEFAULT_RETAINED_RECORDS;
use crate::backends::BackendKind;
use crate::backup::BackupConfig;
use crate::domain::units::parse_size;
use crate::error::{Error, Result};
use crate::guard::GuardConfig;
use crate::lifecycle::LifecycleConfig;
use crate::monitor::MonitorConfig;
use crate::snapshot::SnapshotConfig;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Top-level configuration for the LVM manager
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ManagerConfig {
    /// Warn when filesystem usage exceeds this percentage
    pub usage_threshold: u8,
    /// Auto-extend when filesystem usage exceeds this percentage
    pub auto_extend_threshold: u8,
    /// Whether the monitor may extend volumes on its own
    pub auto_extend_enabled: bool,
    /// Increment applied per auto-extension (size string)
    pub auto_extend_size: String,
    /// Seconds between monitor ticks
    pub monitor_interval_seconds: u64,
    pub backup_enabled: bool,
    /// Directory holding backup archives
    pub backup_location: PathBuf,
    pub backup_retention_days: u32,
    /// Seconds between scheduled backups
    pub backup_interval_seconds: u64,
    /// Ask the operator before mutating storage
    pub require_confirmation: bool,
    /// Start operator sessions in dry-run mode
    pub dry_run_default: bool,
    /// Percentage of each VG kept unallocated
    pub min_vg_free_space_percent: u8,
    pub max_snapshots_per_lv: u32,
    /// Upper bound for waiting on the operation lock
    pub operation_timeout_seconds: u64,
    /// Append operation records as JSON lines to this file
    pub audit_log_path: Option<PathBuf>,
    /// Operation records kept in memory for the API
    pub audit_retained_records: usize,
    pub backend: BackendKind,
    /// Directory containing the LVM binaries
    pub lvm_binary_dir: PathBuf,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            usage_threshold: 80,
            auto_extend_threshold: 90,
            auto_extend_enabled: false,
            auto_extend_size: "1G".to_string(),
            monitor_interval_seconds: 3600,
            backup_enabled: true,
            backup_location: PathBuf::from("/var/backups/lvm"),
            backup_retention_days: 30,
            backup_interval_seconds: 86400,
            require_confirmation: true,
            dry_run_default: false,
            min_vg_free_space_percent: 5,
            max_snapshots_per_lv: 5,
            operation_timeout_seconds: 300,
            audit_log_path: None,
            audit_retained_records: DEFAULT_RETAINED_RECORDS,
            backend: BackendKind::Lvm,
            lvm_binary_dir: PathBuf::from("/sbin"),
        }
    }
}

impl ManagerConfig {
    /// Parse configuration from YAML text; missing keys keep their defaults
    pub fn from_yaml_str(text: &str) -> Result<Self> {
        let config: ManagerConfig = serde_yaml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a YAML file
    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| {
            Error::Configuration(format!("cannot read {}: {}", path.display(), e))
        })?;
        Self::from_yaml_str(&text)
    }

    /// Check cross-field constraints
    pub fn validate(&self) -> Result<()> {
        if self.usage_threshold > 100 || self.auto_extend_threshold > 100 {
            return Err(Error::Configuration(
                "thresholds must be between 0 and 100".into(),
            ));
        }
        if self.auto_extend_threshold < self.usage_threshold {
            return Err(Error::Configuration(format!(
                "auto_extend_threshold ({}) must be >= usage_threshold ({})",
                self.auto_extend_threshold, self.usage_threshold
            )));
        }
        if self.min_vg_free_space_percent >= 100 {
            return Err(Error::Configuration(
                "min_vg_free_space_percent must be below 100".into(),
            ));
        }
        if self.monitor_interval_seconds == 0
            || self.backup_interval_seconds == 0
            || self.operation_timeout_seconds == 0
        {
            return Err(Error::Configuration(
                "intervals and timeouts must be greater than zero".into(),
            ));
        }
        if self.audit_retained_records == 0 {
            return Err(Error::Configuration(
                "audit_retained_records must be greater than zero".into(),
            ));
        }
        if self.auto_extend_bytes()? == 0 {
            return Err(Error::Configuration("auto_extend_size must be non-zero".into()));
        }
        Ok(())
    }

    /// Auto-extension increment in bytes
    pub fn auto_extend_bytes(&self) -> Result<u64> {
        parse_size(&self.auto_extend_size).map_err(|e| {
            Error::Configuration(format!("auto_extend_size {:?}: {}", self.auto_extend_size, e))
        })
    }

    pub fn operation_timeout(&self) -> Duration {
        Duration::from_secs(self.operation_timeout_seconds)
    }

    pub fn guard_config(&self) -> GuardConfig {
        GuardConfig {
            require_confirmation: self.require_confirmation,
            operation_timeout: self.operation_timeout(),
        }
    }

    pub fn lifecycle_config(&self) -> LifecycleConfig {
        LifecycleConfig {
            min_vg_free_space_percent: self.min_vg_free_space_percent,
            dry_run_default: self.dry_run_default,
        }
    }

    pub fn monitor_config(&self) -> Result<MonitorConfig> {
        Ok(MonitorConfig {
            usage_threshold: self.usage_threshold,
            auto_extend_threshold: self.auto_extend_threshold,
            auto_extend_enabled: self.auto_extend_enabled,
            auto_extend_bytes: self.auto_extend_bytes()?,
            interval: Duration::from_secs(self.monitor_interval_seconds),
            dry_run: self.dry_run_default,
        })
    }

    pub fn snapshot_config(&self) -> SnapshotConfig {
        SnapshotConfig {
            max_snapshots_per_lv: self.max_snapshots_per_lv,
            min_vg_free_space_percent: self.min_vg_free_space_percent,
        }
    }

    pub fn backup_config(&self) -> BackupConfig {
        BackupConfig {
            enabled: self.backup_enabled,
            location: self.backup_location.clone(),
            retention_days: self.backup_retention_days,
            interval: Duration::from_secs(self.backup_interval_seconds),
        }
    }
}
