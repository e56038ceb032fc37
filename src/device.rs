//! The device record shared by the registry and both transports.

use crate::config::DeviceConfig;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::time::{Duration, Instant};

/// How long a LAN contact keeps a device `local` before it is re-verified.
pub const LOCAL_TTL: Duration = Duration::from_secs(60);

/// DIY `type` announced over mDNS -> (uiid, brand, model).
const DIY_TYPES: &[(&str, u32, Option<&str>, &str)] = &[
    ("plug", 1, None, "Single Channel DIY"),
    ("strip", 4, None, "Multi Channel DIY"),
    ("diy_plug", 1, Some("SONOFF"), "MINI DIY"),
    ("enhanced_plug", 5, Some("SONOFF"), "POW DIY"),
    ("th_plug", 15, Some("SONOFF"), "TH DIY"),
    ("rf", 28, Some("SONOFF"), "RFBridge DIY"),
    ("fan_light", 34, Some("SONOFF"), "iFan DIY"),
    ("light", 44, Some("SONOFF"), "D1 DIY"),
    ("multifun_switch", 126, Some("SONOFF"), "DualR3 DIY"),
];

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeviceExtra {
    /// Device-type code that selects the parameter schema.
    #[serde(default)]
    pub uiid: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
}

/// One eWeLink device as known to the registry.
///
/// The serialized fields match the cloud inventory item (`itemData`); the
/// skipped ones are runtime state owned by the registry.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct XDevice {
    pub deviceid: String,
    #[serde(default)]
    pub name: String,
    /// Owner's apikey; differs from the user's own for shared devices.
    #[serde(default)]
    pub apikey: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub devicekey: Option<String>,
    #[serde(default, rename = "brandName", skip_serializing_if = "Option::is_none")]
    pub brand_name: Option<String>,
    #[serde(default, rename = "productModel", skip_serializing_if = "Option::is_none")]
    pub product_model: Option<String>,
    #[serde(default)]
    pub extra: DeviceExtra,
    #[serde(default)]
    pub params: Map<String, Value>,
    /// Cloud reachability. `None` for devices of another home.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub online: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub localtype: Option<String>,

    #[serde(skip)]
    pub local: bool,
    #[serde(skip)]
    pub local_ts: Option<Instant>,
    /// Hub deviceid for sub-devices.
    #[serde(skip)]
    pub parent: Option<String>,
    #[serde(skip)]
    pub params_bulk: Option<Map<String, Value>>,
    /// Last inbound sequence, for duplicate suppression.
    #[serde(skip)]
    pub seq: Option<String>,
}

impl XDevice {
    pub fn new(deviceid: impl Into<String>, uiid: u32) -> Self {
        Self {
            deviceid: deviceid.into(),
            extra: DeviceExtra { uiid, model: None },
            ..Default::default()
        }
    }

    /// Synthesize a record for a DIY device first seen on the LAN.
    pub fn from_diy(
        deviceid: &str,
        localtype: Option<&str>,
        params: Map<String, Value>,
        host: Option<String>,
    ) -> Self {
        let ltype = localtype.unwrap_or_default();
        let mut device = Self::new(deviceid, 0);
        match DIY_TYPES.iter().find(|(t, ..)| *t == ltype) {
            Some((_, uiid, brand, model)) => {
                // single channel firmware that reports a switches array
                device.extra.uiid = if ltype == "plug" && params.contains_key("switches") {
                    4
                } else {
                    *uiid
                };
                device.name = model.to_string();
                device.brand_name = brand.map(str::to_string);
                device.product_model = Some(model.to_string());
            }
            None => {
                device.name = "Unknown DIY".to_string();
                device.product_model = Some(ltype.to_string());
            }
        }
        device.params = params;
        device.online = Some(false);
        device.host = host;
        device.localtype = localtype.map(str::to_string);
        device
    }

    pub fn uiid(&self) -> u32 {
        self.extra.uiid
    }

    /// Hub reference advertised by sub-devices in their params.
    pub fn parentid(&self) -> Option<&str> {
        self.params
            .get("parentid")
            .and_then(Value::as_str)
            .filter(|id| !id.is_empty())
    }

    /// Merge user overrides into the record.
    pub fn apply_config(&mut self, config: &DeviceConfig) {
        if let Some(name) = &config.name {
            self.name = name.clone();
        }
        if let Some(devicekey) = &config.devicekey {
            self.devicekey = Some(devicekey.clone());
        }
        if let Some(host) = &config.host {
            self.host = Some(host.clone());
        }
        if let Some(apikey) = &config.apikey {
            self.apikey = apikey.clone();
        }
        if let Some(uiid) = config.uiid {
            self.extra.uiid = uiid;
        }
    }

    pub fn merge_params(&mut self, params: &Map<String, Value>) {
        for (k, v) in params {
            self.params.insert(k.clone(), v.clone());
        }
    }

    /// Records `seq` and reports whether it repeats the last one seen.
    pub fn check_duplicate(&mut self, seq: Option<&str>) -> bool {
        match seq {
            Some(s) if !s.is_empty() => {
                if self.seq.as_deref() == Some(s) {
                    return true;
                }
                self.seq = Some(s.to_string());
                false
            }
            _ => false,
        }
    }

    /// Marks a successful LAN contact.
    pub fn refresh_local(&mut self, now: Instant) {
        self.local = true;
        self.local_ts = Some(now + LOCAL_TTL);
    }

    pub fn local_expired(&self, now: Instant) -> bool {
        self.local_ts.is_some_and(|ts| now > ts)
    }

    /// Not heard from for a whole extra TTL after expiry.
    pub fn long_lost(&self, now: Instant) -> bool {
        self.local_ts.is_some_and(|ts| now > ts + LOCAL_TTL)
    }
}
