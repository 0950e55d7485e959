//! Lifecycle Orchestrator
//!
//! Create and extend operations for PVs, VGs and LVs. Each operation takes
//! the caller's inventory, goes through the [`OperationGuard`] and only then
//! reaches the backend. Multi-device operations are not rolled back: the
//! devices handled before a failure stay as they are and are reported.

pub mod validation;

use crate::audit::OperationKind;
use crate::domain::model::{split_lv_path, FsType};
use crate::domain::ports::VolumeBackendRef;
use crate::domain::units::format_bytes;
use crate::error::{Error, Result};
use crate::guard::{
    Admission, OperationContext, OperationGuard, OperationPermit, OperationReport, OperationRequest,
};
use crate::inventory::ResourceInventory;
use std::sync::Arc;
use tracing::{info, instrument, warn};

// =============================================================================
// Configuration
// =============================================================================

/// Configuration for lifecycle operations
#[derive(Debug, Clone)]
pub struct LifecycleConfig {
    /// Percentage of each VG that allocations may not touch
    pub min_vg_free_space_percent: u8,
    /// Operator calls default to dry-run
    pub dry_run_default: bool,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            min_vg_free_space_percent: 5,
            dry_run_default: false,
        }
    }
}

/// Parameters of a new logical volume
#[derive(Debug, Clone, PartialEq)]
pub struct LvSpec {
    pub name: String,
    pub vg_name: String,
    pub size_bytes: u64,
    pub fs_type: Option<FsType>,
    pub mount_point: Option<String>,
}

// =============================================================================
// Lifecycle Orchestrator
// =============================================================================

/// Validated create/extend operations on storage resources
pub struct LifecycleOrchestrator {
    config: LifecycleConfig,
    backend: VolumeBackendRef,
    guard: Arc<OperationGuard>,
}

impl LifecycleOrchestrator {
    pub fn new(config: LifecycleConfig, backend: VolumeBackendRef, guard: Arc<OperationGuard>) -> Self {
        Self {
            config,
            backend,
            guard,
        }
    }

    pub fn config(&self) -> &LifecycleConfig {
        &self.config
    }

    pub fn guard(&self) -> &Arc<OperationGuard> {
        &self.guard
    }

    /// Context for an operator call, honouring `dry_run_default`
    pub fn operator_context(&self, dry_run: bool) -> OperationContext {
        OperationContext::operator(dry_run || self.config.dry_run_default)
    }

    /// Initialise each device as a physical volume
    pub async fn create_pv(
        &self,
        inventory: &ResourceInventory,
        devices: &[String],
        context: OperationContext,
    ) -> Result<OperationReport> {
        let request = devices
            .iter()
            .fold(OperationRequest::new(OperationKind::CreatePv), |r, d| r.target(d.as_str()));

        let mut permit = match self
            .guard
            .admit(request, context, inventory, |inv| validation::create_pv(inv, devices))
            .await?
        {
            Admission::Proceed(permit) => permit,
            Admission::DryRun(report) => return Ok(report),
        };

        for device in devices {
            match self.backend.create_physical_volume(device).await {
                Ok(out) => {
                    info!("Created physical volume {}: {}", device, out.diagnostics.trim());
                    permit.step_done(device.as_str());
                }
                Err(e) => return Err(permit_failure(permit, "create-pv", device, e)),
            }
        }

        Ok(permit.succeed())
    }

    /// Create a volume group from existing, unassigned PVs
    pub async fn create_vg(
        &self,
        inventory: &ResourceInventory,
        name: &str,
        extent_size_bytes: u64,
        devices: &[String],
        context: OperationContext,
    ) -> Result<OperationReport> {
        let request = OperationRequest::new(OperationKind::CreateVg)
            .target(name)
            .param("extent_size_bytes", extent_size_bytes)
            .param("devices", devices.to_vec());

        let mut permit = match self
            .guard
            .admit(request, context, inventory, |inv| {
                validation::create_vg(inv, name, extent_size_bytes, devices)
            })
            .await?
        {
            Admission::Proceed(permit) => permit,
            Admission::DryRun(report) => return Ok(report),
        };

        match self
            .backend
            .create_volume_group(name, extent_size_bytes, devices)
            .await
        {
            Ok(out) => {
                info!("Created volume group {}: {}", name, out.diagnostics.trim());
                permit.step_done("vgcreate");
                Ok(permit.succeed())
            }
            Err(e) => Err(permit.fail(e)),
        }
    }

    /// Add unassigned PVs to an existing volume group, one device at a time
    pub async fn extend_vg(
        &self,
        inventory: &ResourceInventory,
        name: &str,
        devices: &[String],
        context: OperationContext,
    ) -> Result<OperationReport> {
        let request = OperationRequest::new(OperationKind::ExtendVg)
            .target(name)
            .param("devices", devices.to_vec());

        let mut permit = match self
            .guard
            .admit(request, context, inventory, |inv| validation::extend_vg(inv, name, devices))
            .await?
        {
            Admission::Proceed(permit) => permit,
            Admission::DryRun(report) => return Ok(report),
        };

        for device in devices {
            match self
                .backend
                .extend_volume_group(name, std::slice::from_ref(device))
                .await
            {
                Ok(out) => {
                    info!("Added {} to {}: {}", device, name, out.diagnostics.trim());
                    permit.step_done(device.as_str());
                }
                Err(e) => return Err(permit_failure(permit, "extend-vg", device, e)),
            }
        }

        Ok(permit.succeed())
    }

    /// Create a logical volume, then format and mount it if asked
    ///
    /// Format and mount failures leave the LV in place and downgrade the
    /// outcome to partial success.
    pub async fn create_lv(
        &self,
        inventory: &ResourceInventory,
        spec: &LvSpec,
        context: OperationContext,
    ) -> Result<OperationReport> {
        let lv_path = format!("{}/{}", spec.vg_name, spec.name);
        let mut request = OperationRequest::new(OperationKind::CreateLv)
            .target(lv_path.as_str())
            .param("size_bytes", spec.size_bytes);
        if let Some(fs) = &spec.fs_type {
            request = request.param("fs_type", fs.as_str());
        }
        if let Some(mount_point) = &spec.mount_point {
            request = request.param("mount_point", mount_point.as_str());
        }

        let reserve = self.config.min_vg_free_space_percent;
        let mut permit = match self
            .guard
            .admit(request, context, inventory, |inv| {
                check_mount_request(spec)?;
                validation::create_lv(inv, &spec.name, &spec.vg_name, spec.size_bytes, reserve)
            })
            .await?
        {
            Admission::Proceed(permit) => permit,
            Admission::DryRun(report) => return Ok(report),
        };

        match self
            .backend
            .create_logical_volume(&spec.name, &spec.vg_name, spec.size_bytes)
            .await
        {
            Ok(out) => {
                info!(
                    "Created logical volume {} ({}): {}",
                    lv_path,
                    format_bytes(spec.size_bytes),
                    out.diagnostics.trim()
                );
                permit.step_done("lvcreate");
            }
            Err(e) => return Err(permit.fail(e)),
        }

        let device = format!("/dev/{}", lv_path);
        if let Some(fs) = &spec.fs_type {
            if let Err(e) = self.backend.format_filesystem(&device, fs).await {
                return Ok(permit.partial("format", &e));
            }
            permit.step_done("format");
        }
        if let Some(mount_point) = &spec.mount_point {
            if let Err(e) = self.backend.mount_filesystem(&device, mount_point).await {
                return Ok(permit.partial("mount", &e));
            }
            permit.step_done("mount");
        }

        Ok(permit.succeed())
    }

    /// Grow `vg/lv` by `delta_bytes`, then grow its filesystem
    pub async fn extend_lv(
        &self,
        inventory: &ResourceInventory,
        lv_path: &str,
        delta_bytes: u64,
        context: OperationContext,
    ) -> Result<OperationReport> {
        self.extend_lv_with(inventory, lv_path, delta_bytes, context, Vec::new())
            .await
    }

    /// [`Self::extend_lv`] with extra decision inputs kept in the record
    #[instrument(skip(self, inventory, annotations), fields(origin = %context.origin))]
    pub async fn extend_lv_with(
        &self,
        inventory: &ResourceInventory,
        lv_path: &str,
        delta_bytes: u64,
        context: OperationContext,
        annotations: Vec<(&'static str, serde_json::Value)>,
    ) -> Result<OperationReport> {
        let (vg, lv) = split_lv_path(lv_path)?;
        let lv_path = format!("{}/{}", vg, lv);

        let request = annotations.into_iter().fold(
            OperationRequest::new(OperationKind::ExtendLv)
                .target(lv_path.as_str())
                .param("delta_bytes", delta_bytes),
            |r, (k, v)| r.param(k, v),
        );

        let reserve = self.config.min_vg_free_space_percent;
        let mut permit = match self
            .guard
            .admit(request, context, inventory, |inv| {
                validation::extend_lv(inv, &lv_path, delta_bytes, reserve)
            })
            .await?
        {
            Admission::Proceed(permit) => permit,
            Admission::DryRun(report) => return Ok(report),
        };

        match self.backend.extend_logical_volume(&lv_path, delta_bytes).await {
            Ok(out) => {
                info!("Extended {} by {}: {}", lv_path, format_bytes(delta_bytes), out.diagnostics.trim());
                permit.step_done("lvextend");
            }
            Err(e) => return Err(permit.fail(e)),
        }

        // Filesystem type is probed on the device, not taken from inventory
        let device = format!("/dev/{}", lv_path);
        match self.backend.resize_filesystem(&device).await {
            Ok(_) => {
                permit.step_done("resize-filesystem");
                Ok(permit.succeed())
            }
            Err(e) => {
                warn!("Filesystem on {} not resized: {}", device, e);
                Ok(permit.partial("resize-filesystem", &e))
            }
        }
    }
}

fn check_mount_request(spec: &LvSpec) -> Result<()> {
    match (&spec.fs_type, &spec.mount_point) {
        (None, Some(_)) => Err(Error::InvalidRequest(
            "a mount point needs a filesystem type".into(),
        )),
        (_, Some(mount_point)) if !mount_point.starts_with('/') => Err(Error::InvalidRequest(
            format!("mount point {} is not absolute", mount_point),
        )),
        _ => Ok(()),
    }
}

/// Failure of one device in a multi-device operation
fn permit_failure(
    permit: OperationPermit,
    operation: &str,
    device: &str,
    error: Error,
) -> Error {
    if permit.completed_steps().is_empty() {
        return permit.fail(error);
    }
    let partial = Error::PartialFailure {
        operation: operation.to_string(),
        completed: permit.completed_steps().to_vec(),
        failed: device.to_string(),
        reason: error.to_string(),
    };
    permit.fail(partial)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::{AuditLog, Outcome};
    use crate::backends::{InMemoryBackend, Primitive};
    use crate::domain::units::{GIB, MIB};
    use crate::guard::{AutoApprove, GuardConfig};
    use crate::inventory::InventoryService;
    use assert_matches::assert_matches;
    use std::time::Duration;

    struct Fixture {
        backend: Arc<InMemoryBackend>,
        inventory: InventoryService,
        lifecycle: LifecycleOrchestrator,
    }

    impl Fixture {
        fn new() -> Self {
            let backend = Arc::new(InMemoryBackend::new());
            let inventory = InventoryService::new(backend.clone());
            let guard = Arc::new(OperationGuard::new(
                GuardConfig {
                    require_confirmation: true,
                    operation_timeout: Duration::from_secs(5),
                },
                inventory.clone(),
                Arc::new(AutoApprove),
                Arc::new(AuditLog::new()),
            ));
            let lifecycle = LifecycleOrchestrator::new(
                LifecycleConfig::default(),
                backend.clone(),
                guard,
            );
            Self {
                backend,
                inventory,
                lifecycle,
            }
        }

        /// 1000 GiB VG with 900 GiB allocated to `test_lv`
        fn data_vg() -> Self {
            let fixture = Self::new();
            fixture.backend.seed_volume_group(
                "data_vg",
                4 * MIB,
                &[("/dev/sdb", 500 * GIB), ("/dev/sdc", 500 * GIB)],
            );
            fixture.backend.seed_logical_volume(
                "data_vg",
                "test_lv",
                900 * GIB,
                Some(FsType::Ext4),
                Some("/srv/test"),
            );
            fixture
        }

        async fn inv(&self) -> ResourceInventory {
            self.inventory.refresh().await.unwrap()
        }

        fn records(&self) -> Vec<crate::audit::OperationRecord> {
            self.lifecycle.guard().audit().records()
        }
    }

    fn lv(name: &str, size: u64) -> LvSpec {
        LvSpec {
            name: name.into(),
            vg_name: "data_vg".into(),
            size_bytes: size,
            fs_type: None,
            mount_point: None,
        }
    }

    fn live() -> OperationContext {
        OperationContext::operator(false)
    }

    #[tokio::test]
    async fn test_create_lv_over_reserve_fails() {
        let f = Fixture::data_vg();
        let inv = f.inv().await;

        let result = f.lifecycle.create_lv(&inv, &lv("test_lv2", 60 * GIB), live()).await;
        assert_matches!(
            result,
            Err(Error::InsufficientCapacity { requested, available })
                if requested == 60 * GIB && available == 50 * GIB
        );
        assert_eq!(f.backend.call_count(Primitive::CreateLogicalVolume), 0);
        assert_eq!(f.records()[0].outcome, Outcome::Failure);
    }

    #[tokio::test]
    async fn test_create_lv_boundary() {
        let f = Fixture::data_vg();
        let inv = f.inv().await;

        let over = f.lifecycle.create_lv(&inv, &lv("big", 50 * GIB + 1), live()).await;
        assert_matches!(over, Err(Error::InsufficientCapacity { .. }));

        let exact = f.lifecycle.create_lv(&inv, &lv("big", 50 * GIB), live()).await.unwrap();
        assert_eq!(exact.outcome(), Outcome::Success);
        assert!(f.inv().await.lv("data_vg/big").is_some());
    }

    #[tokio::test]
    async fn test_extent_rounding_never_eats_into_reserve() {
        // 300 MiB total, 15 MiB reserve: 285 MiB allocatable is not a whole
        // number of 4 MiB extents
        let f = Fixture::new();
        f.backend.seed_volume_group(
            "data_vg",
            4 * MIB,
            &[
                ("/dev/sdb", 100 * MIB),
                ("/dev/sdc", 100 * MIB),
                ("/dev/sdd", 100 * MIB),
            ],
        );
        let inv = f.inv().await;
        let allocatable = inv.allocatable("data_vg", 5).unwrap();
        assert_eq!(allocatable, 285 * MIB);

        let result = f.lifecycle.create_lv(&inv, &lv("fill", allocatable), live()).await;
        assert_matches!(
            result,
            Err(Error::InsufficientCapacity { requested, available })
                if requested == 288 * MIB && available == 285 * MIB
        );
        assert_eq!(f.backend.call_count(Primitive::CreateLogicalVolume), 0);

        f.lifecycle
            .create_lv(&inv, &lv("fill", 284 * MIB), live())
            .await
            .unwrap();
        let vg = f.inv().await.vg("data_vg").cloned().unwrap();
        assert!(vg.free_bytes >= vg.reserve_bytes(5));
    }

    #[tokio::test]
    async fn test_create_lv_with_filesystem_and_mount() {
        let f = Fixture::data_vg();
        let inv = f.inv().await;
        let spec = LvSpec {
            fs_type: Some(FsType::Xfs),
            mount_point: Some("/srv/app".into()),
            ..lv("app", 10 * GIB)
        };

        let report = f.lifecycle.create_lv(&inv, &spec, live()).await.unwrap();
        assert_eq!(report.outcome(), Outcome::Success);
        assert_eq!(report.record.completed_steps, vec!["lvcreate", "format", "mount"]);

        let app = f.inv().await.lv("data_vg/app").cloned().unwrap();
        assert_eq!(app.fs_type, Some(FsType::Xfs));
        assert_eq!(app.mount_point.as_deref(), Some("/srv/app"));
    }

    #[tokio::test]
    async fn test_format_failure_is_partial_success() {
        let f = Fixture::data_vg();
        f.backend.fail_on(Primitive::FormatFilesystem, "mkfs.ext4: device busy");
        let inv = f.inv().await;
        let spec = LvSpec {
            fs_type: Some(FsType::Ext4),
            mount_point: Some("/srv/app".into()),
            ..lv("app", GIB)
        };

        let report = f.lifecycle.create_lv(&inv, &spec, live()).await.unwrap();
        assert_eq!(report.outcome(), Outcome::PartialSuccess);
        assert_eq!(report.record.failed_step.as_deref(), Some("format"));
        assert_eq!(report.record.completed_steps, vec!["lvcreate"]);
        assert_eq!(f.backend.call_count(Primitive::MountFilesystem), 0);
        assert!(f.inv().await.lv("data_vg/app").is_some());
    }

    #[tokio::test]
    async fn test_mount_without_filesystem_rejected() {
        let f = Fixture::data_vg();
        let inv = f.inv().await;
        let spec = LvSpec {
            mount_point: Some("/srv/app".into()),
            ..lv("app", GIB)
        };
        assert_matches!(
            f.lifecycle.create_lv(&inv, &spec, live()).await,
            Err(Error::InvalidRequest(_))
        );
    }

    #[tokio::test]
    async fn test_create_pv_partial_failure_is_reported_not_rolled_back() {
        let f = Fixture::new();
        for dev in ["/dev/sdd", "/dev/sde", "/dev/sdf"] {
            f.backend.add_device(dev, 10 * GIB);
        }
        f.backend
            .fail_on_target(Primitive::CreatePhysicalVolume, "/dev/sde", "Can't open /dev/sde exclusively");
        let inv = f.inv().await;
        let devices: Vec<String> = vec!["/dev/sdd".into(), "/dev/sde".into(), "/dev/sdf".into()];

        let result = f.lifecycle.create_pv(&inv, &devices, live()).await;
        assert_matches!(
            result,
            Err(Error::PartialFailure { completed, failed, .. })
                if completed == vec!["/dev/sdd".to_string()] && failed == "/dev/sde"
        );

        let after = f.inv().await;
        assert!(after.pv("/dev/sdd").is_some());
        assert!(after.pv("/dev/sdf").is_none());

        let record = f.records().pop().unwrap();
        assert_eq!(record.outcome, Outcome::Failure);
        assert_eq!(record.completed_steps, vec!["/dev/sdd"]);
        assert_eq!(record.failed_step.as_deref(), Some("/dev/sde"));
    }

    #[tokio::test]
    async fn test_create_vg_then_refresh_round_trip() {
        let f = Fixture::new();
        f.backend.add_device("/dev/sdd", 10 * GIB);
        f.backend.add_device("/dev/sde", 20 * GIB);
        let devices: Vec<String> = vec!["/dev/sdd".into(), "/dev/sde".into()];

        let inv = f.inv().await;
        f.lifecycle.create_pv(&inv, &devices, live()).await.unwrap();
        let inv = f.inv().await;
        f.lifecycle
            .create_vg(&inv, "fast_vg", 8 * MIB, &devices, live())
            .await
            .unwrap();

        let inv = f.inv().await;
        let vg = inv.vg("fast_vg").unwrap();
        assert_eq!(vg.extent_size_bytes, 8 * MIB);
        assert_eq!(vg.pv_devices.iter().cloned().collect::<Vec<_>>(), devices);
        assert_eq!(vg.size_bytes, 30 * GIB);
    }

    #[tokio::test]
    async fn test_extend_vg_adds_devices() {
        let f = Fixture::data_vg();
        f.backend.add_device("/dev/sdd", 100 * GIB);
        let devices = vec!["/dev/sdd".to_string()];
        let inv = f.inv().await;

        assert_matches!(
            f.lifecycle.extend_vg(&inv, "data_vg", &devices, live()).await,
            Err(Error::NotAPhysicalVolume { .. })
        );

        f.lifecycle.create_pv(&inv, &devices, live()).await.unwrap();
        let inv = f.inv().await;
        f.lifecycle.extend_vg(&inv, "data_vg", &devices, live()).await.unwrap();
        assert_eq!(f.inv().await.vg("data_vg").unwrap().size_bytes, 1100 * GIB);
    }

    #[tokio::test]
    async fn test_extend_lv_grows_filesystem() {
        let f = Fixture::data_vg();
        let inv = f.inv().await;

        let report = f
            .lifecycle
            .extend_lv(&inv, "/dev/data_vg/test_lv", 10 * GIB, live())
            .await
            .unwrap();
        assert_eq!(report.outcome(), Outcome::Success);
        assert_eq!(report.record.targets, vec!["data_vg/test_lv"]);

        let lv = f.inv().await.lv("data_vg/test_lv").cloned().unwrap();
        assert_eq!(lv.size_bytes, 910 * GIB);
        assert_eq!(lv.fs_size_bytes, Some(910 * GIB));
    }

    #[tokio::test]
    async fn test_extend_lv_without_resize_method_is_partial() {
        let f = Fixture::data_vg();
        f.backend.seed_logical_volume("data_vg", "raw", GIB, None, None);
        let inv = f.inv().await;

        let report = f.lifecycle.extend_lv(&inv, "data_vg/raw", GIB, live()).await.unwrap();
        assert_eq!(report.outcome(), Outcome::PartialSuccess);
        assert_eq!(report.record.failed_step.as_deref(), Some("resize-filesystem"));
        assert_eq!(f.inv().await.lv("data_vg/raw").unwrap().size_bytes, 2 * GIB);
    }

    #[tokio::test]
    async fn test_extend_missing_lv() {
        let f = Fixture::data_vg();
        let inv = f.inv().await;
        assert_matches!(
            f.lifecycle.extend_lv(&inv, "data_vg/ghost", GIB, live()).await,
            Err(Error::NotFound { .. })
        );
    }

    #[tokio::test]
    async fn test_dry_run_never_reaches_backend() {
        let f = Fixture::data_vg();
        let inv = f.inv().await;

        let report = f
            .lifecycle
            .extend_lv(&inv, "data_vg/test_lv", GIB, OperationContext::operator(true))
            .await
            .unwrap();
        assert!(report.is_dry_run());
        assert_eq!(report.record.parameters["delta_bytes"], GIB);
        assert_eq!(f.backend.mutation_count(), 0);
        assert_eq!(f.inv().await.lv("data_vg/test_lv").unwrap().size_bytes, 900 * GIB);
    }

    #[tokio::test]
    async fn test_dry_run_default_applies_to_operator_context() {
        let f = Fixture::new();
        let lifecycle = LifecycleOrchestrator::new(
            LifecycleConfig {
                dry_run_default: true,
                ..LifecycleConfig::default()
            },
            f.backend.clone(),
            f.lifecycle.guard().clone(),
        );
        assert!(lifecycle.operator_context(false).dry_run);
        assert!(!f.lifecycle.operator_context(false).dry_run);
    }
}
