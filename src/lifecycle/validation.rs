//! Preconditions for lifecycle operations
//!
//! Pure checks against an inventory snapshot. The guard runs each of them
//! twice: once on the caller's inventory and again on a fresh one taken
//! under the operation lock.

use crate::domain::model::{split_lv_path, LogicalVolume, VolumeGroup};
use crate::domain::units::KIB;
use crate::error::{Error, Result};
use crate::inventory::ResourceInventory;
use std::collections::HashSet;

/// LVM object names: `[A-Za-z0-9+_.-]`, no leading dash, not `.`/`..`
pub fn check_name(kind: &str, name: &str) -> Result<()> {
    let valid_chars = name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '+' | '_' | '.' | '-'));

    if name.is_empty() || !valid_chars || name.starts_with('-') || name == "." || name == ".." {
        return Err(Error::InvalidRequest(format!(
            "invalid {} name {:?}",
            kind, name
        )));
    }
    Ok(())
}

fn check_device_list(devices: &[String]) -> Result<()> {
    if devices.is_empty() {
        return Err(Error::InvalidRequest("no devices given".into()));
    }
    let mut seen = HashSet::new();
    for device in devices {
        if !seen.insert(device.as_str()) {
            return Err(Error::InvalidRequest(format!("device {} listed twice", device)));
        }
    }
    Ok(())
}

/// Devices must be known, unmounted block devices that are not PVs yet
pub fn create_pv(inventory: &ResourceInventory, devices: &[String]) -> Result<()> {
    check_device_list(devices)?;

    for device in devices {
        let block = inventory.device(device).ok_or_else(|| Error::InvalidDevice {
            device: device.clone(),
        })?;
        if let Some(mount_point) = &block.mount_point {
            return Err(Error::DeviceInUse {
                device: device.clone(),
                reason: format!("mounted at {}", mount_point),
            });
        }
        if inventory.pv(device).is_some() {
            return Err(Error::DeviceInUse {
                device: device.clone(),
                reason: "already a physical volume".into(),
            });
        }
    }
    Ok(())
}

/// Devices must be PVs not yet claimed by any VG
fn unassigned_pvs(inventory: &ResourceInventory, devices: &[String]) -> Result<()> {
    check_device_list(devices)?;

    for device in devices {
        let pv = inventory.pv(device).ok_or_else(|| Error::NotAPhysicalVolume {
            device: device.clone(),
        })?;
        if let Some(vg) = &pv.vg_name {
            return Err(Error::DeviceInUse {
                device: device.clone(),
                reason: format!("already in volume group {}", vg),
            });
        }
    }
    Ok(())
}

/// Extent sizes are powers of two, at least 1 KiB
pub fn check_extent_size(extent_size_bytes: u64) -> Result<()> {
    if extent_size_bytes < KIB || !extent_size_bytes.is_power_of_two() {
        return Err(Error::InvalidRequest(format!(
            "extent size {} is not a power of two >= 1KiB",
            extent_size_bytes
        )));
    }
    Ok(())
}

pub fn create_vg(
    inventory: &ResourceInventory,
    name: &str,
    extent_size_bytes: u64,
    devices: &[String],
) -> Result<()> {
    check_name("volume group", name)?;
    check_extent_size(extent_size_bytes)?;
    if inventory.vg(name).is_some() {
        return Err(Error::AlreadyExists {
            kind: "volume-group".into(),
            name: name.to_string(),
        });
    }
    unassigned_pvs(inventory, devices)
}

pub fn extend_vg(inventory: &ResourceInventory, name: &str, devices: &[String]) -> Result<()> {
    existing_vg(inventory, name)?;
    unassigned_pvs(inventory, devices)
}

pub fn existing_vg<'a>(inventory: &'a ResourceInventory, name: &str) -> Result<&'a VolumeGroup> {
    inventory.vg(name).ok_or_else(|| Error::VolumeGroupNotFound {
        name: name.to_string(),
    })
}

/// `size_bytes`, rounded up to whole extents, must fit into the VG's free
/// space minus the reserve
pub fn check_capacity(
    inventory: &ResourceInventory,
    vg_name: &str,
    size_bytes: u64,
    min_free_percent: u8,
) -> Result<()> {
    let vg = existing_vg(inventory, vg_name)?;
    let requested = vg.round_to_extent(size_bytes);
    let available = vg.allocatable_bytes(min_free_percent);
    if requested > available {
        return Err(Error::InsufficientCapacity {
            requested,
            available,
        });
    }
    Ok(())
}

pub fn create_lv(
    inventory: &ResourceInventory,
    name: &str,
    vg_name: &str,
    size_bytes: u64,
    min_free_percent: u8,
) -> Result<()> {
    check_name("logical volume", name)?;
    if size_bytes == 0 {
        return Err(Error::InvalidRequest("logical volume size must be non-zero".into()));
    }
    existing_vg(inventory, vg_name)?;
    if inventory.lv(&format!("{}/{}", vg_name, name)).is_some() {
        return Err(Error::AlreadyExists {
            kind: "logical-volume".into(),
            name: format!("{}/{}", vg_name, name),
        });
    }
    check_capacity(inventory, vg_name, size_bytes, min_free_percent)
}

pub fn existing_lv<'a>(inventory: &'a ResourceInventory, lv_path: &str) -> Result<&'a LogicalVolume> {
    let (vg, lv) = split_lv_path(lv_path)?;
    inventory
        .lv(&format!("{}/{}", vg, lv))
        .ok_or_else(|| Error::NotFound {
            kind: "logical-volume".into(),
            name: format!("{}/{}", vg, lv),
        })
}

pub fn extend_lv(
    inventory: &ResourceInventory,
    lv_path: &str,
    delta_bytes: u64,
    min_free_percent: u8,
) -> Result<()> {
    if delta_bytes == 0 {
        return Err(Error::InvalidRequest("extension size must be non-zero".into()));
    }
    let lv = existing_lv(inventory, lv_path)?;
    check_capacity(inventory, &lv.vg_name, delta_bytes, min_free_percent)
}
