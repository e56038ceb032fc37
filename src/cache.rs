//! On-disk copy of the last cloud inventory, so devices can be set up
//! for LAN control when the cloud is unreachable at startup.

use crate::device::XDevice;
use crate::error::Result;
use log::{debug, warn};
use std::path::Path;

pub fn save_devices(path: &Path, devices: &[XDevice]) -> Result<()> {
    if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
        std::fs::create_dir_all(dir)?;
    }
    let text = serde_json::to_string_pretty(devices)?;
    std::fs::write(path, text)?;
    debug!("Cached {} devices to {}", devices.len(), path.display());
    Ok(())
}

/// Loads the cached inventory. A missing or unreadable cache yields an empty list.
pub fn load_devices(path: &Path) -> Vec<XDevice> {
    let text = match std::fs::read_to_string(path) {
        Ok(text) => text,
        Err(_) => return Vec::new(),
    };
    match serde_json::from_str(&text) {
        Ok(devices) => devices,
        Err(e) => {
            warn!("Ignoring corrupt device cache {}: {}", path.display(), e);
            Vec::new()
        }
    }
}
