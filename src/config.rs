//! User configuration: credentials, transport mode, homes filter and
//! per-device overrides.

use crate::cloud::Region;
use crate::error::{EwelinkError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// Which transports the registry starts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    #[default]
    Auto,
    Cloud,
    Local,
}

impl Mode {
    pub fn use_cloud(self) -> bool {
        matches!(self, Mode::Auto | Mode::Cloud)
    }

    pub fn use_local(self) -> bool {
        matches!(self, Mode::Auto | Mode::Local)
    }
}

/// Per-device overrides merged into the device record at setup.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    pub name: Option<String>,
    /// Needed to decrypt LAN traffic of devices missing from the cloud inventory.
    pub devicekey: Option<String>,
    /// Fixed LAN address, for networks where mDNS does not pass.
    pub host: Option<String>,
    pub apikey: Option<String>,
    pub uiid: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Email, phone number, or the literal `token` for token reuse.
    pub username: Option<String>,
    /// Password, or `<region>:<token>` when `username` is `token`.
    pub password: Option<String>,
    pub mode: Mode,
    pub region: Region,
    pub country_code: String,
    /// Index into the built-in app credential pairs.
    pub app: usize,
    /// Family ids to load; empty loads the unscoped inventory.
    pub homes: Vec<String>,
    pub devices: HashMap<String, DeviceConfig>,
    /// Where the last cloud inventory is cached for offline startup.
    pub cache_path: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            username: None,
            password: None,
            mode: Mode::Auto,
            region: Region::Eu,
            country_code: "+86".to_string(),
            app: 0,
            homes: Vec::new(),
            devices: HashMap::new(),
            cache_path: None,
        }
    }
}

impl Config {
    pub fn from_json(s: &str) -> Result<Self> {
        serde_json::from_str(s).map_err(|e| EwelinkError::Config(e.to_string()))
    }

    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let text = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            EwelinkError::Config(format!("{}: {}", path.as_ref().display(), e))
        })?;
        Self::from_json(&text)
    }

    /// Returns username and password when both are set and non-empty.
    pub fn credentials(&self) -> Option<(&str, &str)> {
        match (self.username.as_deref(), self.password.as_deref()) {
            (Some(u), Some(p)) if !u.is_empty() && !p.is_empty() => Some((u, p)),
            _ => None,
        }
    }

    pub fn device(&self, deviceid: &str) -> Option<&DeviceConfig> {
        self.devices.get(deviceid)
    }

    pub fn devicekey(&self, deviceid: &str) -> Option<&str> {
        self.devices.get(deviceid)?.devicekey.as_deref()
    }
}
