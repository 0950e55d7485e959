//! Domain Ports - the volume backend boundary
//!
//! The core never runs LVM tools itself. Everything it needs from the host
//! goes through [`VolumeBackend`], which reports point-in-time inventory and
//! executes mutating primitives. Adapters live in [`crate::backends`].

use crate::domain::model::FsType;
use crate::error::Result;
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

// =============================================================================
// Inventory Reports
// =============================================================================

/// Block device as reported by the backend
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockDeviceReport {
    pub path: String,
    pub size_bytes: u64,
    pub kind: String,
    pub mount_point: Option<String>,
}

/// Physical volume row
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PvReport {
    pub device: String,
    pub vg_name: Option<String>,
    pub size_bytes: u64,
    pub free_bytes: u64,
}

/// Volume group row; capacity is derived from member PVs
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VgReport {
    pub name: String,
    pub extent_size_bytes: u64,
}

/// Logical volume row with filesystem figures when mounted
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LvReport {
    pub name: String,
    pub vg_name: String,
    pub size_bytes: u64,
    pub origin: Option<String>,
    pub created_at: Option<DateTime<Utc>>,
    pub fs_type: Option<String>,
    pub mount_point: Option<String>,
    pub fs_size_bytes: Option<u64>,
    pub fs_used_bytes: Option<u64>,
}

/// Diagnostic text from a successful primitive, for logging only
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackendOutput {
    pub diagnostics: String,
}

impl BackendOutput {
    pub fn new(diagnostics: impl Into<String>) -> Self {
        Self {
            diagnostics: diagnostics.into(),
        }
    }
}

// =============================================================================
// Volume Backend Port
// =============================================================================

/// Port for volume-management primitives
///
/// Mutating calls return [`BackendOutput`] on success or
/// [`crate::Error::BackendOperationFailed`] carrying the raw diagnostics.
/// Listing calls fail with [`crate::Error::BackendUnavailable`] when the
/// backend cannot be queried.
#[async_trait]
pub trait VolumeBackend: Send + Sync {
    /// Get backend name
    fn backend_name(&self) -> &str;

    /// Check if backend is reachable
    async fn health_check(&self) -> Result<bool>;

    async fn list_block_devices(&self) -> Result<Vec<BlockDeviceReport>>;

    async fn list_physical_volumes(&self) -> Result<Vec<PvReport>>;

    async fn list_volume_groups(&self) -> Result<Vec<VgReport>>;

    async fn list_logical_volumes(&self) -> Result<Vec<LvReport>>;

    async fn create_physical_volume(&self, device: &str) -> Result<BackendOutput>;

    async fn create_volume_group(
        &self,
        name: &str,
        extent_size_bytes: u64,
        devices: &[String],
    ) -> Result<BackendOutput>;

    async fn extend_volume_group(&self, name: &str, devices: &[String]) -> Result<BackendOutput>;

    async fn create_logical_volume(
        &self,
        name: &str,
        vg_name: &str,
        size_bytes: u64,
    ) -> Result<BackendOutput>;

    /// Grow `vg/lv` by `delta_bytes`
    async fn extend_logical_volume(&self, lv_path: &str, delta_bytes: u64)
        -> Result<BackendOutput>;

    async fn format_filesystem(&self, device: &str, fs_type: &FsType) -> Result<BackendOutput>;

    async fn mount_filesystem(&self, device: &str, mount_point: &str) -> Result<BackendOutput>;

    /// Grow the filesystem on `device` to fill it
    ///
    /// The filesystem type is probed on the device itself. Fails with
    /// [`crate::Error::NoResizeMethod`] when no resize tool matches.
    async fn resize_filesystem(&self, device: &str) -> Result<BackendOutput>;

    async fn create_snapshot(
        &self,
        parent_path: &str,
        name: &str,
        size_bytes: u64,
    ) -> Result<BackendOutput>;

    /// Backend's own metadata export (e.g. `vgcfgbackup` text)
    async fn export_metadata(&self) -> Result<Bytes>;
}

pub type VolumeBackendRef = Arc<dyn VolumeBackend>;
