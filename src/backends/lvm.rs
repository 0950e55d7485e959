//! LVM2 Command-Line Adapter
//!
//! Drives `pvs`/`vgs`/`lvs` (JSON report format) and the LVM mutation tools.
//! Text parsing stays inside this adapter; the core only sees typed reports.

use crate::domain::model::FsType;
use crate::domain::ports::{
    BackendOutput, BlockDeviceReport, LvReport, PvReport, VgReport, VolumeBackend,
};
use crate::domain::units::lvm_size_arg;
use crate::error::{Error, Result};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, warn};

// =============================================================================
// Configuration
// =============================================================================

/// Configuration for the LVM adapter
#[derive(Debug, Clone)]
pub struct LvmConfig {
    /// Directory containing pvs, vgs, lvcreate, ...
    pub binary_dir: PathBuf,
    /// Upper bound for read-only tool invocations; mutations run to completion
    pub command_timeout: Duration,
}

impl Default for LvmConfig {
    fn default() -> Self {
        Self {
            binary_dir: PathBuf::from("/sbin"),
            command_timeout: Duration::from_secs(120),
        }
    }
}

// =============================================================================
// Report Formats
// =============================================================================

#[derive(Debug, Deserialize)]
struct LvmReport<T> {
    report: Vec<T>,
}

#[derive(Debug, Deserialize)]
struct PvSection {
    #[serde(default)]
    pv: Vec<PvRow>,
}

#[derive(Debug, Deserialize)]
struct PvRow {
    pv_name: String,
    #[serde(default)]
    vg_name: String,
    pv_size: String,
    pv_free: String,
}

#[derive(Debug, Deserialize)]
struct VgSection {
    #[serde(default)]
    vg: Vec<VgRow>,
}

#[derive(Debug, Deserialize)]
struct VgRow {
    vg_name: String,
    vg_extent_size: String,
}

#[derive(Debug, Deserialize)]
struct LvSection {
    #[serde(default)]
    lv: Vec<LvRow>,
}

#[derive(Debug, Deserialize)]
struct LvRow {
    lv_name: String,
    vg_name: String,
    lv_size: String,
    #[serde(default)]
    origin: String,
    #[serde(default)]
    lv_time: String,
}

#[derive(Debug, Deserialize)]
struct LsblkReport {
    blockdevices: Vec<LsblkDevice>,
}

#[derive(Debug, Deserialize)]
struct LsblkDevice {
    path: String,
    #[serde(default)]
    size: serde_json::Value,
    #[serde(rename = "type", default)]
    kind: String,
    #[serde(default)]
    mountpoint: Option<String>,
    #[serde(default)]
    children: Vec<LsblkDevice>,
}

#[derive(Debug, Deserialize)]
struct FindmntReport {
    filesystems: Vec<FindmntEntry>,
}

#[derive(Debug, Deserialize)]
struct FindmntEntry {
    source: String,
    target: String,
    fstype: String,
    #[serde(default)]
    size: serde_json::Value,
    #[serde(default)]
    used: serde_json::Value,
}

/// Mounted filesystem figures keyed by source device
struct MountInfo {
    target: String,
    fstype: String,
    size: Option<u64>,
    used: Option<u64>,
}

// =============================================================================
// LVM Adapter
// =============================================================================

/// Adapter for the host's LVM2 tools
pub struct LvmCliBackend {
    config: LvmConfig,
}

impl LvmCliBackend {
    /// Create a new LVM adapter
    pub fn new(config: LvmConfig) -> Self {
        Self { config }
    }

    fn lvm_tool(&self, name: &str) -> PathBuf {
        self.config.binary_dir.join(name)
    }

    /// Run a command and return stdout; non-zero exit becomes a backend failure
    ///
    /// With a `deadline` the child is killed once it expires. Without one the
    /// call waits for the tool to exit and the child outlives a dropped future.
    async fn run(
        &self,
        program: impl Into<PathBuf>,
        args: &[String],
        deadline: Option<Duration>,
    ) -> Result<String> {
        let program = program.into();
        let cmdline = format!("{} {}", program.display(), args.join(" "));
        debug!("Running: {}", cmdline);

        let mut command = Command::new(&program);
        command.args(args).kill_on_drop(deadline.is_some());

        let output = match deadline {
            Some(limit) => tokio::time::timeout(limit, command.output())
                .await
                .map_err(|_| Error::BackendUnavailable {
                    reason: format!("{} timed out", cmdline),
                })?,
            None => command.output().await,
        }
        .map_err(|e| Error::BackendUnavailable {
            reason: format!("cannot run {}: {}", program.display(), e),
        })?;

        let stdout = String::from_utf8_lossy(&output.stdout).to_string();
        let stderr = String::from_utf8_lossy(&output.stderr).to_string();

        if !output.status.success() {
            return Err(Error::backend(cmdline, format!("{}{}", stderr, stdout)));
        }
        if !stderr.trim().is_empty() {
            debug!("{} stderr: {}", cmdline, stderr.trim());
        }

        Ok(stdout)
    }

    /// Read-only probe bounded by `command_timeout`
    async fn probe(&self, program: impl Into<PathBuf>, args: &[String]) -> Result<String> {
        self.run(program, args, Some(self.config.command_timeout))
            .await
    }

    /// Run a reporting command; any failure means the inventory is unknown
    async fn query(&self, program: impl Into<PathBuf>, args: &[String]) -> Result<String> {
        self.probe(program, args).await.map_err(|e| match e {
            Error::BackendOperationFailed {
                operation,
                diagnostics,
            } => Error::BackendUnavailable {
                reason: format!("{}: {}", operation, diagnostics.trim()),
            },
            other => other,
        })
    }

    /// Run a mutating command to completion and wrap its diagnostics
    ///
    /// Metadata writes are never interrupted, so no timeout applies.
    async fn mutate(&self, program: impl Into<PathBuf>, args: &[String]) -> Result<BackendOutput> {
        self.run(program, args, None).await.map(BackendOutput::new)
    }

    async fn report<T: serde::de::DeserializeOwned>(&self, tool: &str, fields: &str) -> Result<Vec<T>> {
        let args = strings(&[
            "--reportformat",
            "json",
            "--units",
            "b",
            "--nosuffix",
            "-o",
            fields,
        ]);
        let stdout = self.query(self.lvm_tool(tool), &args).await?;
        let report: LvmReport<T> = serde_json::from_str(&stdout).map_err(|e| {
            Error::BackendUnavailable {
                reason: format!("unreadable {} report: {}", tool, e),
            }
        })?;
        Ok(report.report)
    }

    async fn mounts(&self) -> Result<HashMap<String, MountInfo>> {
        let args = strings(&["-J", "-b", "-l", "-o", "SOURCE,TARGET,FSTYPE,SIZE,USED"]);
        let stdout = self.query("findmnt", &args).await?;
        let report: FindmntReport = serde_json::from_str(&stdout)?;

        Ok(report
            .filesystems
            .into_iter()
            .map(|fs| {
                (
                    fs.source,
                    MountInfo {
                        target: fs.target,
                        fstype: fs.fstype,
                        size: lenient_u64(&fs.size),
                        used: lenient_u64(&fs.used),
                    },
                )
            })
            .collect())
    }

    async fn probe_filesystem(&self, device: &str) -> Result<Option<String>> {
        let args = strings(&["-o", "value", "-s", "TYPE", device]);
        match self.probe("blkid", &args).await {
            Ok(out) if !out.trim().is_empty() => Ok(Some(out.trim().to_string())),
            Ok(_) => Ok(None),
            // blkid exits 2 when nothing is found
            Err(Error::BackendOperationFailed { .. }) => Ok(None),
            Err(e) => Err(e),
        }
    }
}

#[async_trait]
impl VolumeBackend for LvmCliBackend {
    fn backend_name(&self) -> &str {
        "lvm"
    }

    async fn health_check(&self) -> Result<bool> {
        Ok(self
            .query(self.lvm_tool("lvm"), &strings(&["version"]))
            .await
            .is_ok())
    }

    async fn list_block_devices(&self) -> Result<Vec<BlockDeviceReport>> {
        let args = strings(&["-J", "-b", "-o", "PATH,SIZE,TYPE,MOUNTPOINT"]);
        let stdout = self.query("lsblk", &args).await?;
        let report: LsblkReport = serde_json::from_str(&stdout)?;

        let mut devices = Vec::new();
        for device in &report.blockdevices {
            flatten_lsblk(device, &mut devices);
        }
        Ok(devices)
    }

    async fn list_physical_volumes(&self) -> Result<Vec<PvReport>> {
        let sections: Vec<PvSection> = self
            .report("pvs", "pv_name,vg_name,pv_size,pv_free")
            .await?;

        sections
            .into_iter()
            .flat_map(|s| s.pv)
            .map(|row| {
                Ok(PvReport {
                    vg_name: non_empty(row.vg_name),
                    size_bytes: parse_bytes(&row.pv_size)?,
                    free_bytes: parse_bytes(&row.pv_free)?,
                    device: row.pv_name,
                })
            })
            .collect()
    }

    async fn list_volume_groups(&self) -> Result<Vec<VgReport>> {
        let sections: Vec<VgSection> = self.report("vgs", "vg_name,vg_extent_size").await?;

        sections
            .into_iter()
            .flat_map(|s| s.vg)
            .map(|row| {
                Ok(VgReport {
                    extent_size_bytes: parse_bytes(&row.vg_extent_size)?,
                    name: row.vg_name,
                })
            })
            .collect()
    }

    async fn list_logical_volumes(&self) -> Result<Vec<LvReport>> {
        let sections: Vec<LvSection> = self
            .report("lvs", "lv_name,vg_name,lv_size,origin,lv_time")
            .await?;
        let mounts = self.mounts().await.unwrap_or_else(|e| {
            warn!("Filesystem usage unavailable: {}", e);
            HashMap::new()
        });

        sections
            .into_iter()
            .flat_map(|s| s.lv)
            .map(|row| {
                let mount = mounts
                    .get(&mapper_path(&row.vg_name, &row.lv_name))
                    .or_else(|| mounts.get(&format!("/dev/{}/{}", row.vg_name, row.lv_name)));
                Ok(LvReport {
                    size_bytes: parse_bytes(&row.lv_size)?,
                    origin: non_empty(row.origin),
                    created_at: parse_lv_time(&row.lv_time),
                    fs_type: mount.map(|m| m.fstype.clone()),
                    mount_point: mount.map(|m| m.target.clone()),
                    fs_size_bytes: mount.and_then(|m| m.size),
                    fs_used_bytes: mount.and_then(|m| m.used),
                    name: row.lv_name,
                    vg_name: row.vg_name,
                })
            })
            .collect()
    }

    async fn create_physical_volume(&self, device: &str) -> Result<BackendOutput> {
        self.mutate(self.lvm_tool("pvcreate"), &strings(&[device]))
            .await
    }

    async fn create_volume_group(
        &self,
        name: &str,
        extent_size_bytes: u64,
        devices: &[String],
    ) -> Result<BackendOutput> {
        let mut args = strings(&["-s", &lvm_size_arg(extent_size_bytes), name]);
        args.extend(devices.iter().cloned());
        self.mutate(self.lvm_tool("vgcreate"), &args).await
    }

    async fn extend_volume_group(&self, name: &str, devices: &[String]) -> Result<BackendOutput> {
        let mut args = strings(&[name]);
        args.extend(devices.iter().cloned());
        self.mutate(self.lvm_tool("vgextend"), &args).await
    }

    async fn create_logical_volume(
        &self,
        name: &str,
        vg_name: &str,
        size_bytes: u64,
    ) -> Result<BackendOutput> {
        let args = strings(&["-y", "-L", &lvm_size_arg(size_bytes), "-n", name, vg_name]);
        self.mutate(self.lvm_tool("lvcreate"), &args).await
    }

    async fn extend_logical_volume(
        &self,
        lv_path: &str,
        delta_bytes: u64,
    ) -> Result<BackendOutput> {
        let size = format!("+{}", lvm_size_arg(delta_bytes));
        self.mutate(self.lvm_tool("lvextend"), &strings(&["-L", &size, lv_path]))
            .await
    }

    async fn format_filesystem(&self, device: &str, fs_type: &FsType) -> Result<BackendOutput> {
        let (program, mut args) = match fs_type {
            FsType::Swap => ("mkswap".to_string(), Vec::new()),
            FsType::Xfs => ("mkfs.xfs".to_string(), strings(&["-f"])),
            other if other.is_ext_family() => (format!("mkfs.{}", other), strings(&["-F"])),
            other => (format!("mkfs.{}", other), Vec::new()),
        };
        args.push(device.to_string());
        self.mutate(program, &args).await
    }

    async fn mount_filesystem(&self, device: &str, mount_point: &str) -> Result<BackendOutput> {
        tokio::fs::create_dir_all(mount_point).await?;
        self.mutate("mount", &strings(&[device, mount_point])).await
    }

    async fn resize_filesystem(&self, device: &str) -> Result<BackendOutput> {
        let fs = self.probe_filesystem(device).await?;

        match fs.as_deref().map(str::parse::<FsType>) {
            Some(Ok(fs)) if fs.is_ext_family() => {
                self.mutate("resize2fs", &strings(&[device])).await
            }
            Some(Ok(FsType::Xfs)) => {
                // xfs_growfs operates on the mount point
                let target = self
                    .probe("findmnt", &strings(&["-n", "-o", "TARGET", device]))
                    .await
                    .map(|out| out.trim().to_string())
                    .unwrap_or_default();
                if target.is_empty() {
                    return Err(Error::NoResizeMethod {
                        device: device.to_string(),
                        filesystem: "xfs (not mounted)".to_string(),
                    });
                }
                self.mutate("xfs_growfs", &strings(&[&target])).await
            }
            _ => Err(Error::NoResizeMethod {
                device: device.to_string(),
                filesystem: fs.unwrap_or_else(|| "none".to_string()),
            }),
        }
    }

    async fn create_snapshot(
        &self,
        parent_path: &str,
        name: &str,
        size_bytes: u64,
    ) -> Result<BackendOutput> {
        let args = strings(&["-s", "-L", &lvm_size_arg(size_bytes), "-n", name, parent_path]);
        self.mutate(self.lvm_tool("lvcreate"), &args).await
    }

    async fn export_metadata(&self) -> Result<Bytes> {
        let dir = std::env::temp_dir().join(format!(
            "smart-lvm-metadata-{}-{}",
            std::process::id(),
            Utc::now().timestamp_nanos_opt().unwrap_or_default()
        ));
        tokio::fs::create_dir_all(&dir).await?;
        let _cleanup = TempDir(dir.clone());

        let template = dir.join("%s").to_string_lossy().to_string();
        self.query(self.lvm_tool("vgcfgbackup"), &strings(&["-f", &template]))
            .await?;

        let mut names = Vec::new();
        let mut entries = tokio::fs::read_dir(&dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            names.push(entry.path());
        }
        names.sort();

        let mut exported = Vec::new();
        for path in names {
            exported.extend(tokio::fs::read(&path).await?);
            exported.push(b'\n');
        }

        Ok(Bytes::from(exported))
    }
}

/// Removes a scratch directory on every exit path
struct TempDir(PathBuf);

impl Drop for TempDir {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_dir_all(&self.0) {
            warn!("Failed to remove {}: {}", self.0.display(), e);
        }
    }
}

// =============================================================================
// Parsing Helpers
// =============================================================================

fn strings(args: &[&str]) -> Vec<String> {
    args.iter().map(|s| s.to_string()).collect()
}

fn non_empty(s: String) -> Option<String> {
    let trimmed = s.trim();
    (!trimmed.is_empty()).then(|| trimmed.to_string())
}

fn parse_bytes(s: &str) -> Result<u64> {
    let trimmed = s.trim().trim_end_matches(['B', 'b']);
    if let Ok(exact) = trimmed.parse::<u64>() {
        return Ok(exact);
    }
    // Some LVM releases print fractional byte counts
    trimmed
        .parse::<f64>()
        .ok()
        .filter(|v| v.is_finite() && *v >= 0.0)
        .map(|v| v as u64)
        .ok_or_else(|| Error::BackendUnavailable {
            reason: format!("unparsable size in report: {:?}", s),
        })
}

/// findmnt/lsblk emit numbers or numeric strings depending on version
fn lenient_u64(value: &serde_json::Value) -> Option<u64> {
    match value {
        serde_json::Value::Number(n) => n.as_u64(),
        serde_json::Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// `/dev/mapper` name: dashes inside VG/LV names are doubled
fn mapper_path(vg: &str, lv: &str) -> String {
    format!(
        "/dev/mapper/{}-{}",
        vg.replace('-', "--"),
        lv.replace('-', "--")
    )
}

fn parse_lv_time(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_str(s.trim(), "%Y-%m-%d %H:%M:%S %z")
        .ok()
        .map(|t| t.with_timezone(&Utc))
}

/// A disk whose partition is mounted counts as mounted itself
fn flatten_lsblk(device: &LsblkDevice, out: &mut Vec<BlockDeviceReport>) -> Option<String> {
    let mut mount_point = device.mountpoint.clone();
    for child in &device.children {
        let child_mount = flatten_lsblk(child, out);
        if mount_point.is_none() {
            mount_point = child_mount;
        }
    }

    out.push(BlockDeviceReport {
        path: device.path.clone(),
        size_bytes: lenient_u64(&device.size).unwrap_or(0),
        kind: device.kind.clone(),
        mount_point: mount_point.clone(),
    });

    mount_point
}
