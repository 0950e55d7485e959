//! Storage resource model
//!
//! Strongly-typed physical volume, volume group, logical volume and snapshot
//! records. Instances are produced by the resource inventory from backend
//! reports and are never patched in place.

use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use indexmap::IndexSet;
use serde::{Deserialize, Serialize};
use std::str::FromStr;

// =============================================================================
// Filesystem Type
// =============================================================================

/// Filesystem type placed on a logical volume
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FsType {
    Ext2,
    Ext3,
    Ext4,
    Xfs,
    Btrfs,
    Swap,
    #[serde(untagged)]
    Other(String),
}

impl FsType {
    pub fn as_str(&self) -> &str {
        match self {
            FsType::Ext2 => "ext2",
            FsType::Ext3 => "ext3",
            FsType::Ext4 => "ext4",
            FsType::Xfs => "xfs",
            FsType::Btrfs => "btrfs",
            FsType::Swap => "swap",
            FsType::Other(name) => name,
        }
    }

    /// ext2/3/4 share one resize tool
    pub fn is_ext_family(&self) -> bool {
        matches!(self, FsType::Ext2 | FsType::Ext3 | FsType::Ext4)
    }
}

impl FromStr for FsType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim().to_lowercase();
        if s.is_empty() {
            return Err(Error::InvalidRequest("empty filesystem type".into()));
        }
        Ok(match s.as_str() {
            "ext2" => FsType::Ext2,
            "ext3" => FsType::Ext3,
            "ext4" => FsType::Ext4,
            "xfs" => FsType::Xfs,
            "btrfs" => FsType::Btrfs,
            "swap" => FsType::Swap,
            _ => FsType::Other(s),
        })
    }
}

impl std::fmt::Display for FsType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// =============================================================================
// Block Device
// =============================================================================

/// A block device visible to the host
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockDevice {
    /// Device path (e.g., /dev/sdb)
    pub path: String,
    /// Device size in bytes
    pub size_bytes: u64,
    /// Device kind as reported by the kernel (disk, part, loop, lvm, ...)
    pub kind: String,
    /// Where the device is mounted, if anywhere
    pub mount_point: Option<String>,
}

impl BlockDevice {
    pub fn is_mounted(&self) -> bool {
        self.mount_point.is_some()
    }
}

// =============================================================================
// Physical Volume
// =============================================================================

/// A block device initialised for volume-group pooling
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhysicalVolume {
    /// Device path, the PV identifier
    pub device: String,
    /// Owning volume group, `None` until assigned
    pub vg_name: Option<String>,
    /// Total capacity in bytes
    pub size_bytes: u64,
    /// Unallocated capacity in bytes
    pub free_bytes: u64,
}

impl PhysicalVolume {
    pub fn is_assigned(&self) -> bool {
        self.vg_name.is_some()
    }
}

// =============================================================================
// Volume Group
// =============================================================================

/// A pool of storage aggregated from one or more physical volumes
///
/// Capacity figures are derived from the member PVs by the inventory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeGroup {
    pub name: String,
    /// Member PV device paths
    pub pv_devices: IndexSet<String>,
    /// Allocation granularity in bytes
    pub extent_size_bytes: u64,
    /// Sum of member PV sizes
    pub size_bytes: u64,
    /// Sum of member PV free space
    pub free_bytes: u64,
}

impl VolumeGroup {
    pub fn used_bytes(&self) -> u64 {
        self.size_bytes.saturating_sub(self.free_bytes)
    }

    /// Space held back from allocation: `min_free_percent` of total capacity,
    /// rounded up
    pub fn reserve_bytes(&self, min_free_percent: u8) -> u64 {
        (self.size_bytes as u128 * min_free_percent as u128).div_ceil(100) as u64
    }

    /// Size the backend will actually allocate for `bytes`
    pub fn round_to_extent(&self, bytes: u64) -> u64 {
        if self.extent_size_bytes == 0 {
            return bytes;
        }
        bytes.div_ceil(self.extent_size_bytes) * self.extent_size_bytes
    }

    /// Space an LV or snapshot may still claim without eating into the reserve
    pub fn allocatable_bytes(&self, min_free_percent: u8) -> u64 {
        self.free_bytes
            .saturating_sub(self.reserve_bytes(min_free_percent))
    }

    pub fn utilization_percent(&self) -> f64 {
        if self.size_bytes == 0 {
            return 0.0;
        }
        self.used_bytes() as f64 * 100.0 / self.size_bytes as f64
    }
}

// =============================================================================
// Logical Volume
// =============================================================================

/// A resizable virtual block device carved out of a volume group
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogicalVolume {
    pub name: String,
    /// Owning volume group
    pub vg_name: String,
    /// Currently allocated size in bytes
    pub size_bytes: u64,
    /// Filesystem found on the device, if any
    pub fs_type: Option<FsType>,
    /// Where the filesystem is mounted, if anywhere
    pub mount_point: Option<String>,
    /// Filesystem size as reported by the mounted filesystem
    pub fs_size_bytes: Option<u64>,
    /// Filesystem bytes in use as reported by the mounted filesystem
    pub fs_used_bytes: Option<u64>,
    /// Origin LV name when this LV is a snapshot
    pub origin: Option<String>,
    /// Creation time as reported by the backend
    pub created_at: Option<DateTime<Utc>>,
}

impl LogicalVolume {
    /// Inventory key: `vg/lv`
    pub fn path(&self) -> String {
        format!("{}/{}", self.vg_name, self.name)
    }

    /// Device node: `/dev/vg/lv`
    pub fn device_path(&self) -> String {
        format!("/dev/{}/{}", self.vg_name, self.name)
    }

    pub fn is_snapshot(&self) -> bool {
        self.origin.is_some()
    }

    /// Filesystem-level usage in percent
    ///
    /// Raw block allocation is irrelevant here: a fully allocated LV can hold
    /// an almost empty filesystem. `None` when no mounted filesystem reports.
    pub fn usage_percent(&self) -> Option<f64> {
        match (self.fs_used_bytes, self.fs_size_bytes) {
            (Some(used), Some(size)) if size > 0 => Some(used as f64 * 100.0 / size as f64),
            _ => None,
        }
    }
}

// =============================================================================
// Snapshot
// =============================================================================

/// Copy-on-write snapshot of a logical volume
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub name: String,
    pub vg_name: String,
    /// Parent LV path (`vg/lv`), a lookup key rather than ownership
    pub parent: String,
    /// Allocated COW size in bytes
    pub size_bytes: u64,
    pub created_at: Option<DateTime<Utc>>,
}

impl Snapshot {
    pub fn path(&self) -> String {
        format!("{}/{}", self.vg_name, self.name)
    }
}

impl TryFrom<&LogicalVolume> for Snapshot {
    type Error = Error;

    fn try_from(lv: &LogicalVolume) -> Result<Self> {
        let origin = lv.origin.as_ref().ok_or_else(|| {
            Error::InvalidRequest(format!("{} is not a snapshot", lv.path()))
        })?;

        Ok(Snapshot {
            name: lv.name.clone(),
            vg_name: lv.vg_name.clone(),
            parent: format!("{}/{}", lv.vg_name, origin),
            size_bytes: lv.size_bytes,
            created_at: lv.created_at,
        })
    }
}

/// Split `vg/lv` or `/dev/vg/lv` into its volume group and volume names
pub fn split_lv_path(path: &str) -> Result<(String, String)> {
    let trimmed = path.trim().trim_start_matches("/dev/");
    let mut parts = trimmed.split('/');

    match (parts.next(), parts.next(), parts.next()) {
        (Some(vg), Some(lv), None) if !vg.is_empty() && !lv.is_empty() => {
            Ok((vg.to_string(), lv.to_string()))
        }
        _ => Err(Error::InvalidRequest(format!(
            "expected a vg/lv path, got {:?}",
            path
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::units::GIB;

    fn lv(used: Option<u64>, size: Option<u64>) -> LogicalVolume {
        LogicalVolume {
            name: "data".into(),
            vg_name: "vg0".into(),
            size_bytes: 10 * GIB,
            fs_type: Some(FsType::Ext4),
            mount_point: Some("/srv/data".into()),
            fs_size_bytes: size,
            fs_used_bytes: used,
            origin: None,
            created_at: None,
        }
    }

    #[test]
    fn test_usage_uses_filesystem_figures() {
        let volume = lv(Some(94 * GIB / 10), Some(10 * GIB));
        let usage = volume.usage_percent().unwrap();
        assert!((usage - 94.0).abs() < 0.001);

        assert_eq!(lv(None, Some(10 * GIB)).usage_percent(), None);
        assert_eq!(lv(Some(1), Some(0)).usage_percent(), None);
    }

    #[test]
    fn test_reserve_and_allocatable() {
        let vg = VolumeGroup {
            name: "data_vg".into(),
            pv_devices: IndexSet::from(["/dev/sdb".to_string()]),
            extent_size_bytes: 4 * 1024 * 1024,
            size_bytes: 1000 * GIB,
            free_bytes: 100 * GIB,
        };
        assert_eq!(vg.reserve_bytes(5), 50 * GIB);
        assert_eq!(vg.allocatable_bytes(5), 50 * GIB);
        assert_eq!(vg.used_bytes(), 900 * GIB);
        assert!((vg.utilization_percent() - 90.0).abs() < 0.001);
    }

    #[test]
    fn test_reserve_rounds_up_and_extents_round_up() {
        let vg = VolumeGroup {
            name: "small_vg".into(),
            pv_devices: IndexSet::from(["/dev/sdb".to_string()]),
            extent_size_bytes: 4 * 1024 * 1024,
            size_bytes: 101,
            free_bytes: 101,
        };
        assert_eq!(vg.reserve_bytes(5), 6);
        assert_eq!(vg.allocatable_bytes(5), 95);

        assert_eq!(vg.round_to_extent(1), 4 * 1024 * 1024);
        assert_eq!(vg.round_to_extent(8 * 1024 * 1024), 8 * 1024 * 1024);
        assert_eq!(vg.round_to_extent(0), 0);
    }

    #[test]
    fn test_split_lv_path() {
        assert_eq!(
            split_lv_path("/dev/vg0/data").unwrap(),
            ("vg0".to_string(), "data".to_string())
        );
        assert_eq!(
            split_lv_path("vg0/data").unwrap(),
            ("vg0".to_string(), "data".to_string())
        );
        assert!(split_lv_path("data").is_err());
        assert!(split_lv_path("a/b/c").is_err());
    }

    #[test]
    fn test_fs_type_parse_and_display() {
        assert_eq!("EXT4".parse::<FsType>().unwrap(), FsType::Ext4);
        assert_eq!("zfs".parse::<FsType>().unwrap(), FsType::Other("zfs".into()));
        assert!(FsType::Ext3.is_ext_family());
        assert!(!FsType::Xfs.is_ext_family());
        assert_eq!(FsType::Xfs.to_string(), "xfs");
    }

    #[test]
    fn test_snapshot_from_lv() {
        let mut volume = lv(None, None);
        volume.name = "data-snap".into();
        volume.origin = Some("data".into());
        let snap = Snapshot::try_from(&volume).unwrap();
        assert_eq!(snap.parent, "vg0/data");
        assert_eq!(snap.path(), "vg0/data-snap");

        assert!(Snapshot::try_from(&lv(None, None)).is_err());
    }
}
