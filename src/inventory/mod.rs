//! Resource Inventory
//!
//! Point-in-time view of block devices, PVs, VGs and LVs built from backend
//! reports. A refresh always produces a fully replaced snapshot; nothing is
//! patched incrementally, and a failed refresh yields no inventory at all.

use crate::domain::model::{
    BlockDevice, LogicalVolume, PhysicalVolume, Snapshot, VolumeGroup,
};
use crate::domain::ports::{BlockDeviceReport, LvReport, PvReport, VgReport, VolumeBackendRef};
use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use indexmap::IndexSet;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::{debug, warn};

// =============================================================================
// Inventory Snapshot
// =============================================================================

/// Immutable snapshot of storage resources
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceInventory {
    /// Block devices by path
    pub devices: BTreeMap<String, BlockDevice>,
    /// Physical volumes by device path
    pub pvs: BTreeMap<String, PhysicalVolume>,
    /// Volume groups by name
    pub vgs: BTreeMap<String, VolumeGroup>,
    /// Logical volumes (snapshots included) by `vg/lv`
    pub lvs: BTreeMap<String, LogicalVolume>,
    pub refreshed_at: DateTime<Utc>,
}

impl ResourceInventory {
    /// Assemble a snapshot from raw backend reports
    ///
    /// VG capacity is summed over member PVs. PVs claiming an unknown VG are
    /// kept but contribute to no group.
    pub fn from_reports(
        devices: Vec<BlockDeviceReport>,
        pvs: Vec<PvReport>,
        vgs: Vec<VgReport>,
        lvs: Vec<LvReport>,
    ) -> Self {
        let devices = devices
            .into_iter()
            .map(|d| {
                (
                    d.path.clone(),
                    BlockDevice {
                        path: d.path,
                        size_bytes: d.size_bytes,
                        kind: d.kind,
                        mount_point: d.mount_point,
                    },
                )
            })
            .collect();

        let pvs: BTreeMap<String, PhysicalVolume> = pvs
            .into_iter()
            .map(|p| {
                (
                    p.device.clone(),
                    PhysicalVolume {
                        device: p.device,
                        vg_name: p.vg_name,
                        size_bytes: p.size_bytes,
                        free_bytes: p.free_bytes,
                    },
                )
            })
            .collect();

        let vgs = vgs
            .into_iter()
            .map(|report| {
                let members: Vec<&PhysicalVolume> = pvs
                    .values()
                    .filter(|pv| pv.vg_name.as_deref() == Some(report.name.as_str()))
                    .collect();
                let vg = VolumeGroup {
                    pv_devices: members.iter().map(|pv| pv.device.clone()).collect::<IndexSet<_>>(),
                    extent_size_bytes: report.extent_size_bytes,
                    size_bytes: members.iter().map(|pv| pv.size_bytes).sum(),
                    free_bytes: members.iter().map(|pv| pv.free_bytes).sum(),
                    name: report.name,
                };
                (vg.name.clone(), vg)
            })
            .collect();

        let lvs = lvs
            .into_iter()
            .map(|report| {
                let lv = LogicalVolume {
                    fs_type: report.fs_type.as_deref().and_then(|fs| fs.parse().ok()),
                    name: report.name,
                    vg_name: report.vg_name,
                    size_bytes: report.size_bytes,
                    mount_point: report.mount_point,
                    fs_size_bytes: report.fs_size_bytes,
                    fs_used_bytes: report.fs_used_bytes,
                    origin: report.origin,
                    created_at: report.created_at,
                };
                (lv.path(), lv)
            })
            .collect();

        Self {
            devices,
            pvs,
            vgs,
            lvs,
            refreshed_at: Utc::now(),
        }
    }

    /// An inventory with nothing in it
    pub fn empty() -> Self {
        Self::from_reports(Vec::new(), Vec::new(), Vec::new(), Vec::new())
    }

    pub fn device(&self, path: &str) -> Option<&BlockDevice> {
        self.devices.get(path)
    }

    pub fn pv(&self, device: &str) -> Option<&PhysicalVolume> {
        self.pvs.get(device)
    }

    pub fn vg(&self, name: &str) -> Option<&VolumeGroup> {
        self.vgs.get(name)
    }

    /// Look up a logical volume by `vg/lv`
    pub fn lv(&self, path: &str) -> Option<&LogicalVolume> {
        self.lvs.get(path)
    }

    /// Regular (non-snapshot) logical volumes
    pub fn volumes(&self) -> impl Iterator<Item = &LogicalVolume> {
        self.lvs.values().filter(|lv| !lv.is_snapshot())
    }

    /// Live snapshots whose origin is `parent` (`vg/lv`)
    pub fn snapshots_of(&self, parent: &str) -> Vec<Snapshot> {
        self.lvs
            .values()
            .filter(|lv| {
                lv.origin
                    .as_ref()
                    .is_some_and(|origin| format!("{}/{}", lv.vg_name, origin) == parent)
            })
            .filter_map(|lv| Snapshot::try_from(lv).ok())
            .collect()
    }

    /// Bytes `vg_name` can still hand out without eating into the reserve
    pub fn allocatable(&self, vg_name: &str, min_free_percent: u8) -> Result<u64> {
        self.vg(vg_name)
            .map(|vg| vg.allocatable_bytes(min_free_percent))
            .ok_or_else(|| Error::VolumeGroupNotFound {
                name: vg_name.to_string(),
            })
    }

    pub fn age(&self) -> chrono::Duration {
        Utc::now() - self.refreshed_at
    }
}

// =============================================================================
// Inventory Service
// =============================================================================

/// Builds inventory snapshots from a volume backend
#[derive(Clone)]
pub struct InventoryService {
    backend: VolumeBackendRef,
}

impl InventoryService {
    pub fn new(backend: VolumeBackendRef) -> Self {
        Self { backend }
    }

    pub fn backend(&self) -> &VolumeBackendRef {
        &self.backend
    }

    /// Query the backend for a complete, fresh snapshot
    ///
    /// Any listing failure fails the whole refresh with
    /// [`Error::BackendUnavailable`]; callers treat that as unknown state.
    pub async fn refresh(&self) -> Result<ResourceInventory> {
        let result = tokio::try_join!(
            self.backend.list_block_devices(),
            self.backend.list_physical_volumes(),
            self.backend.list_volume_groups(),
            self.backend.list_logical_volumes(),
        );

        let (devices, pvs, vgs, lvs) = result.map_err(|e| {
            warn!("Inventory refresh failed: {}", e);
            match e {
                Error::BackendUnavailable { .. } => e,
                other => Error::BackendUnavailable {
                    reason: other.to_string(),
                },
            }
        })?;

        let inventory = ResourceInventory::from_reports(devices, pvs, vgs, lvs);
        debug!(
            devices = inventory.devices.len(),
            pvs = inventory.pvs.len(),
            vgs = inventory.vgs.len(),
            lvs = inventory.lvs.len(),
            "Inventory refreshed"
        );

        Ok(inventory)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::{InMemoryBackend, Primitive};
    use crate::domain::model::FsType;
    use crate::domain::ports::VolumeBackend;
    use crate::domain::units::{GIB, MIB};
    use assert_matches::assert_matches;
    use std::sync::Arc;

    fn seeded() -> Arc<InMemoryBackend> {
        let backend = Arc::new(InMemoryBackend::new());
        backend.seed_volume_group("data_vg", 4 * MIB, &[("/dev/sdb", 600 * GIB), ("/dev/sdc", 400 * GIB)]);
        backend.seed_logical_volume("data_vg", "test_lv", 900 * GIB, Some(FsType::Ext4), Some("/srv/test"));
        backend.add_device("/dev/sdd", 100 * GIB);
        backend
    }

    #[tokio::test]
    async fn test_refresh_derives_vg_capacity_from_pvs() {
        let backend = seeded();
        let inventory = InventoryService::new(backend).refresh().await.unwrap();

        let vg = inventory.vg("data_vg").unwrap();
        assert_eq!(vg.size_bytes, 1000 * GIB);
        assert_eq!(vg.free_bytes, 100 * GIB);
        assert_eq!(vg.pv_devices.len(), 2);
        assert_eq!(inventory.allocatable("data_vg", 5).unwrap(), 50 * GIB);

        // First PV is filled first
        assert_eq!(inventory.pv("/dev/sdb").unwrap().free_bytes, 0);
        assert_eq!(inventory.pv("/dev/sdc").unwrap().free_bytes, 100 * GIB);
        assert!(inventory.pv("/dev/sdd").is_none());
        assert!(inventory.device("/dev/sdd").is_some());

        let lv = inventory.lv("data_vg/test_lv").unwrap();
        assert_eq!(lv.fs_type, Some(FsType::Ext4));
        assert_eq!(lv.usage_percent(), Some(0.0));
    }

    #[tokio::test]
    async fn test_refresh_fails_when_backend_down() {
        let backend = seeded();
        backend.set_available(false);

        let result = InventoryService::new(backend).refresh().await;
        assert_matches!(result, Err(Error::BackendUnavailable { .. }));
    }

    #[tokio::test]
    async fn test_single_listing_failure_fails_refresh() {
        let backend = seeded();
        backend.fail_on(Primitive::ListLogicalVolumes, "lvs: locking failed");

        let result = InventoryService::new(backend).refresh().await;
        assert_matches!(result, Err(Error::BackendUnavailable { reason }) if reason.contains("locking"));
    }

    #[tokio::test]
    async fn test_snapshots_are_grouped_by_parent() {
        let backend = seeded();
        backend
            .create_snapshot("data_vg/test_lv", "snap1", GIB)
            .await
            .unwrap();
        let inventory = InventoryService::new(backend).refresh().await.unwrap();

        let snaps = inventory.snapshots_of("data_vg/test_lv");
        assert_eq!(snaps.len(), 1);
        assert_eq!(snaps[0].name, "snap1");
        assert_eq!(inventory.volumes().count(), 1);
        assert!(inventory.snapshots_of("data_vg/other").is_empty());
    }

    #[test]
    fn test_allocatable_unknown_vg() {
        let inventory = ResourceInventory::empty();
        assert_matches!(
            inventory.allocatable("missing", 5),
            Err(Error::VolumeGroupNotFound { .. })
        );
    }
}
