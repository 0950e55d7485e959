//! Backup & Retention Manager
//!
//! Writes timestamped, zstd-compressed archives of the current inventory
//! plus the backend's own metadata export, and deletes archives older than
//! the retention window. Runs on its own schedule, never takes the
//! operation lock, but never prunes while an archive is being written.
//!
//! # Archive Layout
//!
//! ```text
//! <backup_location>/lvm-backup-20240301T120000123456Z.json.zst
//! ```
//!
//! The creation time is encoded in the file name; an archive becomes
//! eligible for deletion once `created_at + retention_days` has passed.

use crate::audit::{AuditLog, OperationKind, OperationRecord, Origin, Outcome};
use crate::domain::ports::VolumeBackendRef;
use crate::error::{Error, Result};
use crate::inventory::{InventoryService, ResourceInventory};
use crate::metrics::ManagerMetrics;
use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

const ARCHIVE_PREFIX: &str = "lvm-backup-";
const ARCHIVE_SUFFIX: &str = ".json.zst";
const TIMESTAMP_FORMAT: &str = "%Y%m%dT%H%M%S%6fZ";
const ARCHIVE_FORMAT_VERSION: u32 = 1;
const ZSTD_LEVEL: i32 = 3;

// =============================================================================
// Configuration & Types
// =============================================================================

/// Configuration for metadata backups
#[derive(Debug, Clone)]
pub struct BackupConfig {
    pub enabled: bool,
    /// Directory holding archives
    pub location: PathBuf,
    pub retention_days: u32,
    /// Time between scheduled backups
    pub interval: Duration,
}

impl Default for BackupConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            location: PathBuf::from("/var/backups/lvm"),
            retention_days: 30,
            interval: Duration::from_secs(86400),
        }
    }
}

/// A finished archive on disk
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackupArchive {
    pub name: String,
    pub path: PathBuf,
    pub created_at: DateTime<Utc>,
    pub size_bytes: u64,
    pub retention_deadline: DateTime<Utc>,
}

/// Archive content
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArchivePayload {
    pub format_version: u32,
    pub created_at: DateTime<Utc>,
    pub backend: String,
    pub inventory: ResourceInventory,
    /// Backend metadata export, verbatim
    pub backend_metadata: String,
}

/// Result of a pruning pass
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PruneReport {
    pub deleted: Vec<String>,
    /// Archive name and reason
    pub failed: Vec<(String, String)>,
    pub kept: usize,
}

/// Removes a temporary file unless committed
struct TempFile {
    path: PathBuf,
    committed: bool,
}

impl TempFile {
    fn new(path: PathBuf) -> Self {
        Self {
            path,
            committed: false,
        }
    }

    fn commit(mut self) {
        self.committed = true;
    }
}

impl Drop for TempFile {
    fn drop(&mut self) {
        if !self.committed {
            if let Err(e) = std::fs::remove_file(&self.path) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!("Failed to remove {}: {}", self.path.display(), e);
                }
            }
        }
    }
}

// =============================================================================
// Backup Manager
// =============================================================================

/// Creates, lists and prunes metadata archives
pub struct BackupManager {
    config: BackupConfig,
    inventory: InventoryService,
    backend: VolumeBackendRef,
    audit: Arc<AuditLog>,
    metrics: Option<ManagerMetrics>,
    /// Serializes create against prune
    op_lock: Mutex<()>,
}

impl BackupManager {
    pub fn new(
        config: BackupConfig,
        inventory: InventoryService,
        backend: VolumeBackendRef,
        audit: Arc<AuditLog>,
    ) -> Self {
        Self {
            config,
            inventory,
            backend,
            audit,
            metrics: None,
            op_lock: Mutex::new(()),
        }
    }

    pub fn with_metrics(mut self, metrics: ManagerMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn config(&self) -> &BackupConfig {
        &self.config
    }

    /// Write a new archive
    #[instrument(skip(self), fields(location = %self.config.location.display()))]
    pub async fn create(&self, origin: Origin) -> Result<BackupArchive> {
        let result = if self.config.enabled {
            let _serial = self.op_lock.lock().await;
            self.write_archive(Utc::now()).await
        } else {
            Err(Error::BackupDisabled)
        };

        let record = OperationRecord::new(OperationKind::Backup, origin, Outcome::Success)
            .with_target(self.config.location.display().to_string());
        match &result {
            Ok(archive) => {
                info!("Backup written: {} ({} bytes)", archive.name, archive.size_bytes);
                if let Some(metrics) = &self.metrics {
                    metrics.backups_total.inc();
                }
                self.audit.append(
                    record
                        .with_param("archive", archive.name.as_str())
                        .with_param("size_bytes", archive.size_bytes),
                );
            }
            Err(e) => {
                error!("Backup failed: {}", e);
                let mut record = record.with_error(e);
                record.outcome = Outcome::Failure;
                self.audit.append(record);
            }
        }

        result
    }

    async fn write_archive(&self, now: DateTime<Utc>) -> Result<BackupArchive> {
        let inventory = self.inventory.refresh().await?;
        let metadata = self.backend.export_metadata().await?;

        let payload = ArchivePayload {
            format_version: ARCHIVE_FORMAT_VERSION,
            created_at: now,
            backend: self.backend.backend_name().to_string(),
            inventory,
            backend_metadata: String::from_utf8_lossy(&metadata).to_string(),
        };
        let json = serde_json::to_vec(&payload)?;
        let compressed = zstd::encode_all(json.as_slice(), ZSTD_LEVEL)
            .map_err(|e| Error::Archive(format!("zstd compression failed: {}", e)))?;

        tokio::fs::create_dir_all(&self.config.location)
            .await
            .map_err(Error::archive_io(&self.config.location))?;
        let name = archive_name(now);
        let final_path = self.config.location.join(&name);
        let temp_path = self.config.location.join(format!(".{}.tmp", name));

        // The archive name only appears once the content is complete
        let temp = TempFile::new(temp_path.clone());
        let mut file = tokio::fs::File::create(&temp_path)
            .await
            .map_err(Error::archive_io(&temp_path))?;
        file.write_all(&compressed)
            .await
            .map_err(Error::archive_io(&temp_path))?;
        file.sync_all().await.map_err(Error::archive_io(&temp_path))?;
        drop(file);
        tokio::fs::rename(&temp_path, &final_path)
            .await
            .map_err(Error::archive_io(&final_path))?;
        temp.commit();

        Ok(BackupArchive {
            name,
            path: final_path,
            created_at: now,
            size_bytes: compressed.len() as u64,
            retention_deadline: now + retention(self.config.retention_days),
        })
    }

    /// Archives currently on disk, oldest first
    pub fn list(&self) -> Result<Vec<BackupArchive>> {
        let pattern = self
            .config
            .location
            .join(format!("{}*{}", ARCHIVE_PREFIX, ARCHIVE_SUFFIX));
        let pattern = pattern.to_string_lossy();

        let paths = glob::glob(&pattern)
            .map_err(|e| Error::Archive(format!("bad archive pattern {}: {}", pattern, e)))?;

        let mut archives = Vec::new();
        for entry in paths {
            let path = match entry {
                Ok(path) => path,
                Err(e) => {
                    warn!("Unreadable backup entry: {}", e);
                    continue;
                }
            };
            let Some(created_at) = path
                .file_name()
                .and_then(|n| n.to_str())
                .and_then(parse_archive_name)
            else {
                debug!("Ignoring {}", path.display());
                continue;
            };
            let size_bytes = std::fs::metadata(&path).map(|m| m.len()).unwrap_or(0);

            archives.push(BackupArchive {
                name: file_name(&path),
                path,
                created_at,
                size_bytes,
                retention_deadline: created_at + retention(self.config.retention_days),
            });
        }

        archives.sort_by_key(|a| a.created_at);
        Ok(archives)
    }

    /// Decode an archive
    pub async fn read(&self, archive: &BackupArchive) -> Result<ArchivePayload> {
        let compressed = tokio::fs::read(&archive.path)
            .await
            .map_err(Error::archive_io(&archive.path))?;
        let json = zstd::decode_all(compressed.as_slice())
            .map_err(|e| Error::Archive(format!("{}: {}", archive.name, e)))?;
        Ok(serde_json::from_slice(&json)?)
    }

    /// Delete archives older than `retention_days`
    pub async fn prune(&self, retention_days: u32, origin: Origin) -> Result<PruneReport> {
        self.prune_at(Utc::now(), retention_days, origin).await
    }

    /// [`Self::prune`] evaluated at `now`
    ///
    /// Individual deletion failures are logged and skipped.
    #[instrument(skip(self))]
    pub async fn prune_at(
        &self,
        now: DateTime<Utc>,
        retention_days: u32,
        origin: Origin,
    ) -> Result<PruneReport> {
        let _serial = self.op_lock.lock().await;
        let archives = self.list()?;
        let window = retention(retention_days);

        let mut report = PruneReport::default();
        for archive in archives {
            if archive.created_at + window >= now {
                report.kept += 1;
                continue;
            }
            match tokio::fs::remove_file(&archive.path).await {
                Ok(()) => {
                    debug!("Pruned {}", archive.name);
                    report.deleted.push(archive.name);
                }
                Err(e) => {
                    warn!("Could not prune {}: {}", archive.name, e);
                    report.failed.push((archive.name, e.to_string()));
                }
            }
        }

        if let Some(metrics) = &self.metrics {
            metrics
                .backup_archives_pruned_total
                .inc_by(report.deleted.len() as u64);
        }

        let outcome = if report.failed.is_empty() {
            Outcome::Success
        } else {
            Outcome::PartialSuccess
        };
        let mut record = OperationRecord::new(OperationKind::PruneBackups, origin, outcome)
            .with_target(self.config.location.display().to_string())
            .with_param("retention_days", retention_days)
            .with_param("deleted", report.deleted.len())
            .with_param("kept", report.kept);
        if !report.failed.is_empty() {
            record.failed_step = report.failed.first().map(|(name, _)| name.clone());
            record = record.with_detail(format!("{} archive(s) could not be deleted", report.failed.len()));
        }
        record.completed_steps = report.deleted.clone();
        self.audit.append(record);

        info!(
            "Pruned {} backup archive(s), kept {}, {} failed",
            report.deleted.len(),
            report.kept,
            report.failed.len()
        );
        Ok(report)
    }

    /// Back up and prune every `interval` until cancelled
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        let mut interval = tokio::time::interval(self.config.interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(
            "Backup schedule started (interval {:?}, retention {} days)",
            self.config.interval, self.config.retention_days
        );

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = interval.tick() => {
                    if self.config.enabled {
                        // Failures are recorded; the schedule keeps going
                        let _ = self.create(Origin::Scheduler).await;
                    }
                    if let Err(e) = self.prune(self.config.retention_days, Origin::Scheduler).await {
                        error!("Scheduled prune failed: {}", e);
                    }
                }
            }
        }

        info!("Backup schedule stopped");
    }
}

fn retention(days: u32) -> chrono::Duration {
    chrono::Duration::days(days as i64)
}

fn archive_name(at: DateTime<Utc>) -> String {
    format!("{}{}{}", ARCHIVE_PREFIX, at.format(TIMESTAMP_FORMAT), ARCHIVE_SUFFIX)
}

fn parse_archive_name(name: &str) -> Option<DateTime<Utc>> {
    let stamp = name.strip_prefix(ARCHIVE_PREFIX)?.strip_suffix(ARCHIVE_SUFFIX)?;
    NaiveDateTime::parse_from_str(stamp, TIMESTAMP_FORMAT)
        .ok()
        .map(|t| t.and_utc())
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default()
}
