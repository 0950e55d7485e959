//! In-Memory Volume Backend
//!
//! A complete in-process model of devices, PVs, VGs and LVs. Tracks every
//! primitive call, supports fault injection per primitive (optionally per
//! target), artificial latency and an availability switch.

use crate::domain::model::FsType;
use crate::domain::ports::{
    BackendOutput, BlockDeviceReport, LvReport, PvReport, VgReport, VolumeBackend,
};
use crate::domain::units::format_bytes;
use crate::error::{Error, Result};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;
use tracing::debug;

// =============================================================================
// Call Tracking
// =============================================================================

/// Backend primitives, used for call accounting and fault injection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Primitive {
    ListBlockDevices,
    ListPhysicalVolumes,
    ListVolumeGroups,
    ListLogicalVolumes,
    CreatePhysicalVolume,
    CreateVolumeGroup,
    ExtendVolumeGroup,
    CreateLogicalVolume,
    ExtendLogicalVolume,
    FormatFilesystem,
    MountFilesystem,
    ResizeFilesystem,
    CreateSnapshot,
    ExportMetadata,
}

impl Primitive {
    pub fn is_mutating(&self) -> bool {
        !matches!(
            self,
            Primitive::ListBlockDevices
                | Primitive::ListPhysicalVolumes
                | Primitive::ListVolumeGroups
                | Primitive::ListLogicalVolumes
                | Primitive::ExportMetadata
        )
    }
}

/// One recorded primitive invocation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendCall {
    pub primitive: Primitive,
    pub target: String,
    pub bytes: Option<u64>,
}

// =============================================================================
// Model State
// =============================================================================

#[derive(Debug, Clone)]
struct DeviceState {
    size_bytes: u64,
    kind: String,
    mount_point: Option<String>,
    is_pv: bool,
    vg_name: Option<String>,
}

#[derive(Debug, Clone)]
struct VgState {
    extent_size_bytes: u64,
    devices: Vec<String>,
}

#[derive(Debug, Clone)]
struct LvState {
    name: String,
    vg_name: String,
    size_bytes: u64,
    origin: Option<String>,
    created_at: DateTime<Utc>,
    fs_type: Option<FsType>,
    mount_point: Option<String>,
    fs_size_bytes: u64,
    fs_used_bytes: u64,
}

#[derive(Debug, Default)]
struct MemoryState {
    devices: BTreeMap<String, DeviceState>,
    vgs: BTreeMap<String, VgState>,
    /// Keyed by `vg/lv`
    lvs: BTreeMap<String, LvState>,
}

impl MemoryState {
    fn vg_size(&self, vg_name: &str) -> u64 {
        self.vgs
            .get(vg_name)
            .map(|vg| {
                vg.devices
                    .iter()
                    .filter_map(|d| self.devices.get(d))
                    .map(|d| d.size_bytes)
                    .sum()
            })
            .unwrap_or(0)
    }

    fn vg_allocated(&self, vg_name: &str) -> u64 {
        self.lvs
            .values()
            .filter(|lv| lv.vg_name == vg_name)
            .map(|lv| lv.size_bytes)
            .sum()
    }

    fn vg_free(&self, vg_name: &str) -> u64 {
        self.vg_size(vg_name)
            .saturating_sub(self.vg_allocated(vg_name))
    }

    fn round_to_extent(&self, vg_name: &str, bytes: u64) -> u64 {
        let extent = self
            .vgs
            .get(vg_name)
            .map(|vg| vg.extent_size_bytes)
            .unwrap_or(1)
            .max(1);
        bytes.div_ceil(extent) * extent
    }

    fn lv_by_device(&self, device: &str) -> Option<&str> {
        let key = device.trim_start_matches("/dev/");
        self.lvs.get_key_value(key).map(|(k, _)| k.as_str())
    }
}

// =============================================================================
// In-Memory Backend
// =============================================================================

/// In-process volume backend
pub struct InMemoryBackend {
    state: RwLock<MemoryState>,
    available: AtomicBool,
    latency: Mutex<Duration>,
    /// (primitive, optional target) -> diagnostics
    faults: Mutex<HashMap<(Primitive, Option<String>), String>>,
    calls: Mutex<Vec<BackendCall>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl InMemoryBackend {
    pub fn new() -> Self {
        Self {
            state: RwLock::new(MemoryState::default()),
            available: AtomicBool::new(true),
            latency: Mutex::new(Duration::ZERO),
            faults: Mutex::new(HashMap::new()),
            calls: Mutex::new(Vec::new()),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        }
    }

    // -------------------------------------------------------------------------
    // Seeding
    // -------------------------------------------------------------------------

    /// Add a raw block device
    pub fn add_device(&self, path: &str, size_bytes: u64) {
        self.state.write().devices.insert(
            path.to_string(),
            DeviceState {
                size_bytes,
                kind: "disk".to_string(),
                mount_point: None,
                is_pv: false,
                vg_name: None,
            },
        );
    }

    /// Mark a raw device as mounted somewhere
    pub fn mount_device(&self, path: &str, mount_point: &str) {
        if let Some(device) = self.state.write().devices.get_mut(path) {
            device.mount_point = Some(mount_point.to_string());
        }
    }

    /// Create a VG (and its PVs) directly, bypassing call accounting
    pub fn seed_volume_group(&self, name: &str, extent_size_bytes: u64, devices: &[(&str, u64)]) {
        let mut state = self.state.write();
        for (path, size) in devices {
            state.devices.insert(
                path.to_string(),
                DeviceState {
                    size_bytes: *size,
                    kind: "disk".to_string(),
                    mount_point: None,
                    is_pv: true,
                    vg_name: Some(name.to_string()),
                },
            );
        }
        state.vgs.insert(
            name.to_string(),
            VgState {
                extent_size_bytes,
                devices: devices.iter().map(|(p, _)| p.to_string()).collect(),
            },
        );
    }

    /// Create a mounted LV directly, bypassing call accounting
    pub fn seed_logical_volume(
        &self,
        vg_name: &str,
        name: &str,
        size_bytes: u64,
        fs_type: Option<FsType>,
        mount_point: Option<&str>,
    ) {
        self.state.write().lvs.insert(
            format!("{}/{}", vg_name, name),
            LvState {
                name: name.to_string(),
                vg_name: vg_name.to_string(),
                size_bytes,
                origin: None,
                created_at: Utc::now(),
                fs_type,
                mount_point: mount_point.map(str::to_string),
                fs_size_bytes: size_bytes,
                fs_used_bytes: 0,
            },
        );
    }

    /// Drop `vg/lv` directly, as an out-of-band `lvremove` would
    pub fn remove_logical_volume(&self, lv_path: &str) {
        self.state.write().lvs.remove(lv_path);
    }

    /// Set filesystem usage of `vg/lv` as a percentage of its filesystem size
    pub fn set_usage_percent(&self, lv_path: &str, percent: f64) {
        if let Some(lv) = self.state.write().lvs.get_mut(lv_path) {
            lv.fs_used_bytes = (lv.fs_size_bytes as f64 * percent / 100.0) as u64;
        }
    }

    // -------------------------------------------------------------------------
    // Fault Injection
    // -------------------------------------------------------------------------

    /// Make every call of `primitive` fail
    pub fn fail_on(&self, primitive: Primitive, diagnostics: &str) {
        self.faults
            .lock()
            .insert((primitive, None), diagnostics.to_string());
    }

    /// Make calls of `primitive` against `target` fail
    pub fn fail_on_target(&self, primitive: Primitive, target: &str, diagnostics: &str) {
        self.faults.lock().insert(
            (primitive, Some(target.to_string())),
            diagnostics.to_string(),
        );
    }

    pub fn clear_faults(&self) {
        self.faults.lock().clear();
    }

    /// Set availability (for testing)
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Delay every primitive by `latency`
    pub fn set_latency(&self, latency: Duration) {
        *self.latency.lock() = latency;
    }

    // -------------------------------------------------------------------------
    // Call Accounting
    // -------------------------------------------------------------------------

    pub fn calls(&self) -> Vec<BackendCall> {
        self.calls.lock().clone()
    }

    pub fn calls_of(&self, primitive: Primitive) -> Vec<BackendCall> {
        self.calls
            .lock()
            .iter()
            .filter(|c| c.primitive == primitive)
            .cloned()
            .collect()
    }

    pub fn call_count(&self, primitive: Primitive) -> usize {
        self.calls_of(primitive).len()
    }

    /// Number of mutating calls issued so far
    pub fn mutation_count(&self) -> usize {
        self.calls
            .lock()
            .iter()
            .filter(|c| c.primitive.is_mutating())
            .count()
    }

    /// Highest number of mutating primitives observed in flight at once
    pub fn max_concurrent_mutations(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    pub fn reset_calls(&self) {
        self.calls.lock().clear();
        self.max_in_flight.store(0, Ordering::SeqCst);
    }

    /// Record the call, apply latency and injected faults
    async fn enter(&self, primitive: Primitive, target: &str, bytes: Option<u64>) -> Result<()> {
        self.calls.lock().push(BackendCall {
            primitive,
            target: target.to_string(),
            bytes,
        });

        if !self.available.load(Ordering::SeqCst) {
            return Err(Error::BackendUnavailable {
                reason: "in-memory backend switched off".into(),
            });
        }

        let mutating = primitive.is_mutating();
        if mutating {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        }

        let latency = *self.latency.lock();
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }

        if mutating {
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
        }

        let fault = {
            let faults = self.faults.lock();
            faults
                .get(&(primitive, Some(target.to_string())))
                .or_else(|| faults.get(&(primitive, None)))
                .cloned()
        };

        match fault {
            Some(diagnostics) if mutating => Err(Error::backend(
                format!("{:?}", primitive),
                diagnostics,
            )),
            Some(diagnostics) => Err(Error::BackendUnavailable {
                reason: diagnostics,
            }),
            None => Ok(()),
        }
    }
}

impl Default for InMemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl VolumeBackend for InMemoryBackend {
    fn backend_name(&self) -> &str {
        "memory"
    }

    async fn health_check(&self) -> Result<bool> {
        Ok(self.available.load(Ordering::SeqCst))
    }

    async fn list_block_devices(&self) -> Result<Vec<BlockDeviceReport>> {
        self.enter(Primitive::ListBlockDevices, "", None).await?;
        let state = self.state.read();

        Ok(state
            .devices
            .iter()
            .map(|(path, d)| BlockDeviceReport {
                path: path.clone(),
                size_bytes: d.size_bytes,
                kind: d.kind.clone(),
                mount_point: d.mount_point.clone(),
            })
            .collect())
    }

    async fn list_physical_volumes(&self) -> Result<Vec<PvReport>> {
        self.enter(Primitive::ListPhysicalVolumes, "", None).await?;
        let state = self.state.read();

        // Extents are handed out from the first member PV onwards
        let mut remaining: BTreeMap<&str, u64> = state
            .vgs
            .keys()
            .map(|name| (name.as_str(), state.vg_allocated(name)))
            .collect();
        let mut used_per_device: BTreeMap<&str, u64> = BTreeMap::new();
        for (name, vg) in &state.vgs {
            for device in &vg.devices {
                let size = state.devices.get(device).map(|d| d.size_bytes).unwrap_or(0);
                let left = remaining.entry(name.as_str()).or_insert(0);
                let used = (*left).min(size);
                *left -= used;
                used_per_device.insert(device.as_str(), used);
            }
        }

        Ok(state
            .devices
            .iter()
            .filter(|(_, d)| d.is_pv)
            .map(|(path, d)| PvReport {
                device: path.clone(),
                vg_name: d.vg_name.clone(),
                size_bytes: d.size_bytes,
                free_bytes: d
                    .size_bytes
                    .saturating_sub(used_per_device.get(path.as_str()).copied().unwrap_or(0)),
            })
            .collect())
    }

    async fn list_volume_groups(&self) -> Result<Vec<VgReport>> {
        self.enter(Primitive::ListVolumeGroups, "", None).await?;
        let state = self.state.read();

        Ok(state
            .vgs
            .iter()
            .map(|(name, vg)| VgReport {
                name: name.clone(),
                extent_size_bytes: vg.extent_size_bytes,
            })
            .collect())
    }

    async fn list_logical_volumes(&self) -> Result<Vec<LvReport>> {
        self.enter(Primitive::ListLogicalVolumes, "", None).await?;
        let state = self.state.read();

        Ok(state
            .lvs
            .values()
            .map(|lv| {
                let mounted = lv.fs_type.is_some() && lv.mount_point.is_some();
                LvReport {
                    name: lv.name.clone(),
                    vg_name: lv.vg_name.clone(),
                    size_bytes: lv.size_bytes,
                    origin: lv.origin.clone(),
                    created_at: Some(lv.created_at),
                    fs_type: lv.fs_type.as_ref().map(|f| f.to_string()),
                    mount_point: lv.mount_point.clone(),
                    fs_size_bytes: mounted.then_some(lv.fs_size_bytes),
                    fs_used_bytes: mounted.then_some(lv.fs_used_bytes),
                }
            })
            .collect())
    }

    async fn create_physical_volume(&self, device: &str) -> Result<BackendOutput> {
        self.enter(Primitive::CreatePhysicalVolume, device, None).await?;
        let mut state = self.state.write();

        let entry = state
            .devices
            .get_mut(device)
            .ok_or_else(|| Error::backend("pvcreate", format!("Device {} not found.", device)))?;
        if entry.is_pv {
            return Err(Error::backend(
                "pvcreate",
                format!("Physical volume '{}' is already in use.", device),
            ));
        }
        entry.is_pv = true;

        debug!("memory backend: created PV {}", device);
        Ok(BackendOutput::new(format!(
            "Physical volume \"{}\" successfully created.",
            device
        )))
    }

    async fn create_volume_group(
        &self,
        name: &str,
        extent_size_bytes: u64,
        devices: &[String],
    ) -> Result<BackendOutput> {
        self.enter(Primitive::CreateVolumeGroup, name, Some(extent_size_bytes))
            .await?;
        let mut state = self.state.write();

        if state.vgs.contains_key(name) {
            return Err(Error::backend(
                "vgcreate",
                format!("A volume group called {} already exists.", name),
            ));
        }
        for device in devices {
            match state.devices.get(device) {
                Some(d) if d.is_pv && d.vg_name.is_none() => {}
                _ => {
                    return Err(Error::backend(
                        "vgcreate",
                        format!("Physical volume {} not usable.", device),
                    ))
                }
            }
        }
        for device in devices {
            if let Some(d) = state.devices.get_mut(device) {
                d.vg_name = Some(name.to_string());
            }
        }
        state.vgs.insert(
            name.to_string(),
            VgState {
                extent_size_bytes,
                devices: devices.to_vec(),
            },
        );

        Ok(BackendOutput::new(format!(
            "Volume group \"{}\" successfully created",
            name
        )))
    }

    async fn extend_volume_group(&self, name: &str, devices: &[String]) -> Result<BackendOutput> {
        self.enter(Primitive::ExtendVolumeGroup, name, None).await?;
        let mut state = self.state.write();

        if !state.vgs.contains_key(name) {
            return Err(Error::backend(
                "vgextend",
                format!("Volume group \"{}\" not found", name),
            ));
        }
        for device in devices {
            match state.devices.get_mut(device) {
                Some(d) if d.is_pv && d.vg_name.is_none() => d.vg_name = Some(name.to_string()),
                _ => {
                    return Err(Error::backend(
                        "vgextend",
                        format!("Physical volume {} not usable.", device),
                    ))
                }
            }
        }
        if let Some(vg) = state.vgs.get_mut(name) {
            vg.devices.extend(devices.iter().cloned());
        }

        Ok(BackendOutput::new(format!(
            "Volume group \"{}\" successfully extended",
            name
        )))
    }

    async fn create_logical_volume(
        &self,
        name: &str,
        vg_name: &str,
        size_bytes: u64,
    ) -> Result<BackendOutput> {
        let key = format!("{}/{}", vg_name, name);
        self.enter(Primitive::CreateLogicalVolume, &key, Some(size_bytes))
            .await?;
        let mut state = self.state.write();

        if !state.vgs.contains_key(vg_name) {
            return Err(Error::backend(
                "lvcreate",
                format!("Volume group \"{}\" not found", vg_name),
            ));
        }
        if state.lvs.contains_key(&key) {
            return Err(Error::backend(
                "lvcreate",
                format!("Logical Volume \"{}\" already exists", name),
            ));
        }
        let size = state.round_to_extent(vg_name, size_bytes);
        if size > state.vg_free(vg_name) {
            return Err(Error::backend(
                "lvcreate",
                format!(
                    "Volume group \"{}\" has insufficient free space for {}",
                    vg_name,
                    format_bytes(size)
                ),
            ));
        }
        state.lvs.insert(
            key,
            LvState {
                name: name.to_string(),
                vg_name: vg_name.to_string(),
                size_bytes: size,
                origin: None,
                created_at: Utc::now(),
                fs_type: None,
                mount_point: None,
                fs_size_bytes: 0,
                fs_used_bytes: 0,
            },
        );

        Ok(BackendOutput::new(format!(
            "Logical volume \"{}\" created.",
            name
        )))
    }

    async fn extend_logical_volume(
        &self,
        lv_path: &str,
        delta_bytes: u64,
    ) -> Result<BackendOutput> {
        self.enter(Primitive::ExtendLogicalVolume, lv_path, Some(delta_bytes))
            .await?;
        let mut state = self.state.write();

        let vg_name = match state.lvs.get(lv_path) {
            Some(lv) => lv.vg_name.clone(),
            None => {
                return Err(Error::backend(
                    "lvextend",
                    format!("Logical volume {} not found", lv_path),
                ))
            }
        };
        let delta = state.round_to_extent(&vg_name, delta_bytes);
        if delta > state.vg_free(&vg_name) {
            return Err(Error::backend(
                "lvextend",
                format!("Insufficient free space in \"{}\"", vg_name),
            ));
        }
        let lv = state
            .lvs
            .get_mut(lv_path)
            .ok_or_else(|| Error::backend("lvextend", lv_path.to_string()))?;
        lv.size_bytes += delta;

        Ok(BackendOutput::new(format!(
            "Size of logical volume {} changed to {}.",
            lv_path,
            format_bytes(lv.size_bytes)
        )))
    }

    async fn format_filesystem(&self, device: &str, fs_type: &FsType) -> Result<BackendOutput> {
        self.enter(Primitive::FormatFilesystem, device, None).await?;
        let mut state = self.state.write();

        let key = state
            .lv_by_device(device)
            .map(str::to_string)
            .ok_or_else(|| Error::backend("mkfs", format!("{}: no such device", device)))?;
        if let Some(lv) = state.lvs.get_mut(&key) {
            lv.fs_type = Some(fs_type.clone());
            lv.fs_size_bytes = lv.size_bytes;
            lv.fs_used_bytes = 0;
        }

        Ok(BackendOutput::new(format!("mkfs.{} {} done", fs_type, device)))
    }

    async fn mount_filesystem(&self, device: &str, mount_point: &str) -> Result<BackendOutput> {
        self.enter(Primitive::MountFilesystem, device, None).await?;
        let mut state = self.state.write();

        let key = state
            .lv_by_device(device)
            .map(str::to_string)
            .ok_or_else(|| Error::backend("mount", format!("{}: no such device", device)))?;
        match state.lvs.get_mut(&key) {
            Some(lv) if lv.fs_type.is_some() => {
                lv.mount_point = Some(mount_point.to_string());
                Ok(BackendOutput::new(format!("mounted {} on {}", device, mount_point)))
            }
            _ => Err(Error::backend(
                "mount",
                format!("wrong fs type, bad option, bad superblock on {}", device),
            )),
        }
    }

    async fn resize_filesystem(&self, device: &str) -> Result<BackendOutput> {
        self.enter(Primitive::ResizeFilesystem, device, None).await?;
        let mut state = self.state.write();

        let key = state
            .lv_by_device(device)
            .map(str::to_string)
            .ok_or_else(|| Error::backend("resize", format!("{}: no such device", device)))?;
        let lv = state
            .lvs
            .get_mut(&key)
            .ok_or_else(|| Error::backend("resize", device.to_string()))?;

        match &lv.fs_type {
            Some(fs) if fs.is_ext_family() || *fs == FsType::Xfs => {
                lv.fs_size_bytes = lv.size_bytes;
                Ok(BackendOutput::new(format!(
                    "The filesystem on {} is now {} bytes long.",
                    device, lv.size_bytes
                )))
            }
            other => Err(Error::NoResizeMethod {
                device: device.to_string(),
                filesystem: other
                    .as_ref()
                    .map(|f| f.to_string())
                    .unwrap_or_else(|| "none".to_string()),
            }),
        }
    }

    async fn create_snapshot(
        &self,
        parent_path: &str,
        name: &str,
        size_bytes: u64,
    ) -> Result<BackendOutput> {
        self.enter(Primitive::CreateSnapshot, parent_path, Some(size_bytes))
            .await?;
        let mut state = self.state.write();

        let parent = state
            .lvs
            .get(parent_path)
            .cloned()
            .ok_or_else(|| {
                Error::backend("lvcreate", format!("Origin {} not found", parent_path))
            })?;
        let key = format!("{}/{}", parent.vg_name, name);
        if state.lvs.contains_key(&key) {
            return Err(Error::backend(
                "lvcreate",
                format!("Logical Volume \"{}\" already exists", name),
            ));
        }
        let size = state.round_to_extent(&parent.vg_name, size_bytes);
        if size > state.vg_free(&parent.vg_name) {
            return Err(Error::backend(
                "lvcreate",
                format!("Insufficient free space in \"{}\"", parent.vg_name),
            ));
        }
        state.lvs.insert(
            key,
            LvState {
                name: name.to_string(),
                vg_name: parent.vg_name.clone(),
                size_bytes: size,
                origin: Some(parent.name.clone()),
                created_at: Utc::now(),
                fs_type: parent.fs_type.clone(),
                mount_point: None,
                fs_size_bytes: parent.fs_size_bytes,
                fs_used_bytes: parent.fs_used_bytes,
            },
        );

        Ok(BackendOutput::new(format!(
            "Logical volume \"{}\" created.",
            name
        )))
    }

    async fn export_metadata(&self) -> Result<Bytes> {
        self.enter(Primitive::ExportMetadata, "", None).await?;
        let state = self.state.read();

        let mut text = String::from("# in-memory volume metadata\n");
        for (name, vg) in &state.vgs {
            text.push_str(&format!(
                "{} {{\n\textent_size = {}\n\tphysical_volumes = [{}]\n",
                name,
                vg.extent_size_bytes,
                vg.devices.join(", ")
            ));
            for lv in state.lvs.values().filter(|lv| &lv.vg_name == name) {
                text.push_str(&format!("\tlogical_volume {} = {}\n", lv.name, lv.size_bytes));
            }
            text.push_str("}\n");
        }

        Ok(Bytes::from(text))
    }
}
