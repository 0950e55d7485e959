//! Snapshot Manager
//!
//! Copy-on-write snapshots of logical volumes, bounded per parent by
//! `max_snapshots_per_lv`. Snapshots never expire on their own; removing
//! them is left to the operator.

use crate::audit::OperationKind;
use crate::domain::model::{split_lv_path, Snapshot};
use crate::domain::ports::VolumeBackendRef;
use crate::domain::units::format_bytes;
use crate::error::{Error, Result};
use crate::guard::{Admission, OperationContext, OperationGuard, OperationReport, OperationRequest};
use crate::inventory::ResourceInventory;
use crate::lifecycle::validation;
use std::sync::Arc;
use tracing::info;

/// Configuration for snapshot creation
#[derive(Debug, Clone)]
pub struct SnapshotConfig {
    pub max_snapshots_per_lv: u32,
    /// Snapshots draw from the same VG reserve as regular LVs
    pub min_vg_free_space_percent: u8,
}

impl Default for SnapshotConfig {
    fn default() -> Self {
        Self {
            max_snapshots_per_lv: 5,
            min_vg_free_space_percent: 5,
        }
    }
}

/// Creates and lists LV snapshots
pub struct SnapshotManager {
    config: SnapshotConfig,
    backend: VolumeBackendRef,
    guard: Arc<OperationGuard>,
}

impl SnapshotManager {
    pub fn new(config: SnapshotConfig, backend: VolumeBackendRef, guard: Arc<OperationGuard>) -> Self {
        Self {
            config,
            backend,
            guard,
        }
    }

    /// Live snapshots of `parent` (`vg/lv` or `/dev/vg/lv`)
    pub fn list(&self, inventory: &ResourceInventory, parent: &str) -> Result<Vec<Snapshot>> {
        let (vg, lv) = split_lv_path(parent)?;
        Ok(inventory.snapshots_of(&format!("{}/{}", vg, lv)))
    }

    /// Snapshot `parent` as `name` with `size_bytes` of COW space
    pub async fn create(
        &self,
        inventory: &ResourceInventory,
        parent: &str,
        name: &str,
        size_bytes: u64,
        context: OperationContext,
    ) -> Result<OperationReport> {
        let (vg, lv) = split_lv_path(parent)?;
        let parent = format!("{}/{}", vg, lv);

        let request = OperationRequest::new(OperationKind::CreateSnapshot)
            .target(format!("{}/{}", vg, name))
            .param("parent", parent.as_str())
            .param("size_bytes", size_bytes)
            .param("max_snapshots_per_lv", self.config.max_snapshots_per_lv);

        let mut permit = match self
            .guard
            .admit(request, context, inventory, |inv| self.check(inv, &parent, name, size_bytes))
            .await?
        {
            Admission::Proceed(permit) => permit,
            Admission::DryRun(report) => return Ok(report),
        };

        match self.backend.create_snapshot(&parent, name, size_bytes).await {
            Ok(out) => {
                info!(
                    "Created snapshot {}/{} of {} ({}): {}",
                    vg,
                    name,
                    parent,
                    format_bytes(size_bytes),
                    out.diagnostics.trim()
                );
                permit.step_done("lvcreate-snapshot");
                Ok(permit.succeed())
            }
            Err(e) => Err(permit.fail(e)),
        }
    }

    fn check(&self, inventory: &ResourceInventory, parent: &str, name: &str, size_bytes: u64) -> Result<()> {
        validation::check_name("snapshot", name)?;
        if size_bytes == 0 {
            return Err(Error::InvalidRequest("snapshot size must be non-zero".into()));
        }

        let origin = inventory.lv(parent).ok_or_else(|| Error::ParentNotFound {
            parent: parent.to_string(),
        })?;
        if origin.is_snapshot() {
            return Err(Error::InvalidRequest(format!(
                "{} is itself a snapshot",
                parent
            )));
        }

        let path = format!("{}/{}", origin.vg_name, name);
        if inventory.lv(&path).is_some() {
            return Err(Error::AlreadyExists {
                kind: "logical-volume".into(),
                name: path,
            });
        }

        let current = inventory.snapshots_of(parent).len() as u32;
        if current >= self.config.max_snapshots_per_lv {
            return Err(Error::SnapshotQuotaExceeded {
                parent: parent.to_string(),
                current,
                limit: self.config.max_snapshots_per_lv,
            });
        }

        validation::check_capacity(
            inventory,
            &origin.vg_name,
            size_bytes,
            self.config.min_vg_free_space_percent,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::{AuditLog, Outcome};
    use crate::backends::{InMemoryBackend, Primitive};
    use crate::domain::model::FsType;
    use crate::domain::units::{GIB, MIB};
    use crate::guard::{AutoApprove, GuardConfig};
    use crate::inventory::InventoryService;
    use assert_matches::assert_matches;

    fn setup() -> (Arc<InMemoryBackend>, InventoryService, SnapshotManager) {
        let backend = Arc::new(InMemoryBackend::new());
        backend.seed_volume_group("vg0", 4 * MIB, &[("/dev/sdb", 100 * GIB)]);
        backend.seed_logical_volume("vg0", "db", 20 * GIB, Some(FsType::Ext4), Some("/var/lib/db"));

        let inventory = InventoryService::new(backend.clone());
        let guard = Arc::new(OperationGuard::new(
            GuardConfig::default(),
            inventory.clone(),
            Arc::new(AutoApprove),
            Arc::new(AuditLog::new()),
        ));
        let manager = SnapshotManager::new(SnapshotConfig::default(), backend.clone(), guard);
        (backend, inventory, manager)
    }

    fn live() -> OperationContext {
        OperationContext::operator(false)
    }

    #[tokio::test]
    async fn test_create_snapshot() {
        let (backend, inventory, manager) = setup();
        let inv = inventory.refresh().await.unwrap();

        let report = manager.create(&inv, "/dev/vg0/db", "db-snap1", GIB, live()).await.unwrap();
        assert_eq!(report.outcome(), Outcome::Success);
        assert_eq!(backend.call_count(Primitive::CreateSnapshot), 1);

        let inv = inventory.refresh().await.unwrap();
        let snaps = manager.list(&inv, "vg0/db").unwrap();
        assert_eq!(snaps.len(), 1);
        assert_eq!(snaps[0].parent, "vg0/db");
        assert_eq!(snaps[0].size_bytes, GIB);
        assert!(snaps[0].created_at.is_some());
    }

    #[tokio::test]
    async fn test_sixth_snapshot_exceeds_quota_without_backend_call() {
        let (backend, inventory, manager) = setup();
        for i in 1..=5 {
            let inv = inventory.refresh().await.unwrap();
            manager
                .create(&inv, "vg0/db", &format!("snap{}", i), GIB, live())
                .await
                .unwrap();
        }
        assert_eq!(backend.call_count(Primitive::CreateSnapshot), 5);

        let inv = inventory.refresh().await.unwrap();
        backend.reset_calls();
        let result = manager.create(&inv, "vg0/db", "snap6", GIB, live()).await;
        assert_matches!(
            result,
            Err(Error::SnapshotQuotaExceeded { current: 5, limit: 5, .. })
        );
        assert!(backend.calls().is_empty());
    }

    #[tokio::test]
    async fn test_missing_parent_and_duplicate_name() {
        let (_, inventory, manager) = setup();
        let inv = inventory.refresh().await.unwrap();

        assert_matches!(
            manager.create(&inv, "vg0/ghost", "s", GIB, live()).await,
            Err(Error::ParentNotFound { .. })
        );
        assert_matches!(
            manager.create(&inv, "vg0/db", "db", GIB, live()).await,
            Err(Error::AlreadyExists { .. })
        );
    }

    #[tokio::test]
    async fn test_snapshot_of_snapshot_rejected() {
        let (_, inventory, manager) = setup();
        let inv = inventory.refresh().await.unwrap();
        manager.create(&inv, "vg0/db", "s1", GIB, live()).await.unwrap();

        let inv = inventory.refresh().await.unwrap();
        assert_matches!(
            manager.create(&inv, "vg0/s1", "s2", GIB, live()).await,
            Err(Error::InvalidRequest(_))
        );
    }
}
