//! Size parsing and formatting
//!
//! Size strings follow LVM conventions: binary multiples, case-insensitive
//! unit suffixes, and a bare number meaning MiB.

use crate::error::{Error, Result};

pub const KIB: u64 = 1024;
pub const MIB: u64 = KIB * 1024;
pub const GIB: u64 = MIB * 1024;
pub const TIB: u64 = GIB * 1024;
pub const PIB: u64 = TIB * 1024;

/// Parse a size string such as `1G`, `500MiB`, `2.5t` or `512` (MiB) into bytes
pub fn parse_size(s: &str) -> Result<u64> {
    let s = s.trim();
    if s.is_empty() {
        return Err(Error::SizeParse("empty size string".into()));
    }

    // Find where the number ends and unit begins
    let mut num_end = 0;
    for (i, c) in s.char_indices() {
        if !c.is_ascii_digit() && c != '.' {
            num_end = i;
            break;
        }
        num_end = i + 1;
    }

    let num_str = &s[..num_end];
    let unit_str = s[num_end..].trim();

    let num: f64 = num_str
        .parse()
        .map_err(|_| Error::SizeParse(format!("invalid number: {:?}", num_str)))?;

    let multiplier: u64 = match unit_str.to_uppercase().as_str() {
        "" | "M" | "MB" | "MI" | "MIB" => MIB,
        "B" => 1,
        "K" | "KB" | "KI" | "KIB" => KIB,
        "G" | "GB" | "GI" | "GIB" => GIB,
        "T" | "TB" | "TI" | "TIB" => TIB,
        "P" | "PB" | "PI" | "PIB" => PIB,
        _ => return Err(Error::SizeParse(format!("unknown unit: {}", unit_str))),
    };

    let bytes = num * multiplier as f64;
    if !bytes.is_finite() || bytes > u64::MAX as f64 {
        return Err(Error::SizeParse(format!("size out of range: {}", s)));
    }

    Ok(bytes as u64)
}

/// Format bytes as human-readable string
pub fn format_bytes(bytes: u64) -> String {
    if bytes >= PIB {
        format!("{:.2}PiB", bytes as f64 / PIB as f64)
    } else if bytes >= TIB {
        format!("{:.2}TiB", bytes as f64 / TIB as f64)
    } else if bytes >= GIB {
        format!("{:.2}GiB", bytes as f64 / GIB as f64)
    } else if bytes >= MIB {
        format!("{:.2}MiB", bytes as f64 / MIB as f64)
    } else if bytes >= KIB {
        format!("{:.2}KiB", bytes as f64 / KIB as f64)
    } else {
        format!("{}B", bytes)
    }
}

/// Render bytes as an exact LVM size argument (`-L 1073741824b`)
pub fn lvm_size_arg(bytes: u64) -> String {
    format!("{}b", bytes)
}
