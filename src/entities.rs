//! Entity templates per device type.
//!
//! The registry does not build entities itself. For each device it asks
//! [`get_spec`] which entities the device exposes and hands the resulting
//! stubs to the entity layer through the `add_entities` signal.

use crate::device::XDevice;
use serde::Serialize;
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Switch,
    Light,
    Fan,
    Cover,
    Sensor,
    BinarySensor,
    Remote,
    Button,
}

/// Describes one entity the device exposes; the entity layer builds the concrete object.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EntityTemplate {
    pub kind: EntityKind,
    /// Outlet index for multi-channel devices.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub channel: Option<u8>,
    /// Device parameter the entity reads.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub param: Option<String>,
    /// Suffix that keeps entity ids unique within a device.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub uid: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub multiplier: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub round: Option<u32>,
    pub enabled: bool,
}

impl EntityTemplate {
    pub fn new(kind: EntityKind) -> Self {
        Self {
            kind,
            channel: None,
            param: None,
            uid: None,
            multiplier: None,
            round: None,
            enabled: true,
        }
    }

    /// A sensor reading `param`, identified by `uid`.
    pub fn sensor(param: &str, uid: &str) -> Self {
        Self::new(EntityKind::Sensor).param(param).uid(uid)
    }

    pub fn channel(mut self, channel: u8) -> Self {
        self.channel = Some(channel);
        self
    }

    pub fn param(mut self, param: &str) -> Self {
        self.param = Some(param.to_string());
        self
    }

    pub fn uid(mut self, uid: &str) -> Self {
        self.uid = Some(uid.to_string());
        self
    }

    pub fn multiplier(mut self, multiplier: f64) -> Self {
        self.multiplier = Some(multiplier);
        self
    }

    pub fn round(mut self, digits: u32) -> Self {
        self.round = Some(digits);
        self
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }
}

/// Templates chosen for one device.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeviceSpec {
    pub uiid: u32,
    pub templates: Vec<EntityTemplate>,
}

/// What the `add_entities` signal carries for each entity.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EntityStub {
    pub deviceid: String,
    pub uiid: u32,
    pub name: String,
    #[serde(flatten)]
    pub template: EntityTemplate,
}

fn switches(count: u8) -> Vec<EntityTemplate> {
    (0..count)
        .map(|ch| EntityTemplate::new(EntityKind::Switch).channel(ch).uid(&(ch + 1).to_string()))
        .collect()
}

fn meter(scale: Option<f64>) -> Vec<EntityTemplate> {
    ["power", "voltage", "current"]
        .iter()
        .map(|p| {
            let t = EntityTemplate::sensor(p, p);
            match scale {
                Some(m) => t.multiplier(m).round(2),
                None => t,
            }
        })
        .collect()
}

fn climate_sensors(temperature: &str, humidity: &str) -> Vec<EntityTemplate> {
    vec![
        EntityTemplate::sensor(temperature, "temperature").round(1),
        EntityTemplate::sensor(humidity, "humidity"),
    ]
}

/// Per-outlet meter readings of the multi-channel metering relays.
fn outlet_meter(outlets: u8) -> Vec<EntityTemplate> {
    let mut out = Vec::new();
    for ch in 0..outlets {
        for (param, uid) in [("current", "current"), ("voltage", "voltage"), ("actPow", "power")] {
            out.push(
                EntityTemplate::sensor(&format!("{}_{:02}", param, ch), &format!("{}_{}", uid, ch + 1))
                    .channel(ch)
                    .multiplier(0.01)
                    .round(2),
            );
        }
    }
    out
}

fn dual_r3(device: &XDevice) -> Vec<EntityTemplate> {
    // workMode 1 = relays, 2 = motor, 3 = meter only
    if device.params.get("workMode").and_then(Value::as_i64) == Some(2) {
        return vec![EntityTemplate::new(EntityKind::Cover)];
    }
    let mut out = switches(2);
    out.extend(outlet_meter(2));
    out
}

/// Returns the entity templates for a device, chosen by its uiid and,
/// for devices with switchable modes, by its current params.
pub fn get_spec(device: &XDevice) -> DeviceSpec {
    DeviceSpec {
        uiid: device.uiid(),
        templates: templates(device),
    }
}

fn templates(device: &XDevice) -> Vec<EntityTemplate> {
    match device.uiid() {
        1 | 6 | 14 | 24 | 27 | 112 | 113 | 114 | 138 | 160 | 1009 | 1256 => switches(1)
            .into_iter()
            .map(|t| EntityTemplate { channel: None, uid: None, ..t })
            .collect(),
        2 | 7 | 29 | 139 | 161 => switches(2),
        3 | 8 | 30 | 140 | 162 => switches(3),
        4 | 9 | 31 | 141 | 163 => switches(4),
        5 => {
            let mut out = vec![EntityTemplate::new(EntityKind::Switch)];
            out.push(EntityTemplate::sensor("power", "power"));
            out
        }
        11 | 67 => vec![EntityTemplate::new(EntityKind::Cover)],
        15 | 181 => {
            let mut out = vec![EntityTemplate::new(EntityKind::Switch)];
            out.extend(climate_sensors("currentTemperature", "currentHumidity"));
            out
        }
        18 => {
            let mut out = climate_sensors("temperature", "humidity");
            out.push(EntityTemplate::sensor("light", "light"));
            out.push(EntityTemplate::sensor("noise", "noise"));
            out.push(EntityTemplate::sensor("dusty", "dusty"));
            out
        }
        22 | 36 | 44 | 57 | 59 | 104 => vec![EntityTemplate::new(EntityKind::Light)],
        28 => vec![EntityTemplate::new(EntityKind::Remote)],
        32 | 182 => {
            let mut out = vec![EntityTemplate::new(EntityKind::Switch)];
            out.extend(meter(None));
            out
        }
        34 => vec![
            EntityTemplate::new(EntityKind::Fan),
            EntityTemplate::new(EntityKind::Light).channel(0),
        ],
        102 | 3026 => vec![
            EntityTemplate::new(EntityKind::BinarySensor).param("switch"),
            EntityTemplate::sensor("battery", "battery").disabled(),
        ],
        126 => dual_r3(device),
        130 => {
            let mut out = switches(4);
            out.extend(outlet_meter(4));
            out
        }
        190 | 226 => {
            let mut out = vec![EntityTemplate::new(EntityKind::Switch)];
            out.extend(meter(Some(0.01)));
            out
        }
        1000 => vec![
            EntityTemplate::new(EntityKind::Button).param("key"),
            EntityTemplate::sensor("battery", "battery").disabled(),
        ],
        1770 | 7014 => {
            let mut out = vec![
                EntityTemplate::sensor("temperature", "temperature")
                    .multiplier(0.01)
                    .round(1),
                EntityTemplate::sensor("humidity", "humidity").multiplier(0.01),
            ];
            out.push(EntityTemplate::sensor("battery", "battery").disabled());
            out
        }
        2026 => vec![
            EntityTemplate::new(EntityKind::BinarySensor).param("motion"),
            EntityTemplate::sensor("battery", "battery").disabled(),
        ],
        _ => fallback(device),
    }
}

/// Unknown uiid: guess from the params the device reports.
fn fallback(device: &XDevice) -> Vec<EntityTemplate> {
    if let Some(list) = device.params.get("switches").and_then(Value::as_array) {
        let count = list.len().clamp(1, 4) as u8;
        return switches(count);
    }
    if device.params.contains_key("switch") {
        return vec![EntityTemplate::new(EntityKind::Switch)];
    }
    Vec::new()
}

/// Stubs for the `add_entities` signal.
pub fn entity_stubs(device: &XDevice) -> Vec<EntityStub> {
    let spec = get_spec(device);
    spec.templates
        .into_iter()
        .map(|template| EntityStub {
            deviceid: device.deviceid.clone(),
            uiid: spec.uiid,
            name: device.name.clone(),
            template,
        })
        .collect()
}
