//! eWeLink wire conventions shared by the Cloud and LAN transports.
//! Signal names, protocol constants, normalized send outcomes and sequence numbers.

use serde::{Serialize, Serializer};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// A transport came up or went down.
pub const SIGNAL_CONNECTED: &str = "connected";
/// Raw inbound event from a transport.
pub const SIGNAL_UPDATE: &str = "update";
/// New entity stubs are ready for the entity layer.
pub const SIGNAL_ADD_ENTITIES: &str = "add_entities";

/// mDNS service type announced by devices in LAN mode.
pub const SERVICE_TYPE: &str = "_ewelink._tcp.local.";
pub const LAN_PORT: u16 = 8081;
/// Devices accept any value here, the field only has to be present.
pub const LAN_SELF_APIKEY: &str = "123";

pub const USER_AGENT: &str = "app";
pub const WS_PROTOCOL_VERSION: u32 = 8;

pub const ACTION_USER_ONLINE: &str = "userOnline";
pub const ACTION_UPDATE: &str = "update";
pub const ACTION_QUERY: &str = "query";
pub const ACTION_SYSMSG: &str = "sysmsg";
pub const ACTION_REPORT_SUB_DEVICE: &str = "reportSubDevice";

/// Harmless LAN command used as a liveness probe when nothing else is sent.
pub const CMD_PROBE: &str = "sledonline";
pub const CMD_GET_STATE: &str = "getState";
pub const CMD_STATISTICS: &str = "statistics";

pub const KEY_DEVICEID: &str = "deviceid";
pub const KEY_PARAMS: &str = "params";
pub const KEY_CONFIG: &str = "config";
pub const KEY_SEQUENCE: &str = "sequence";
pub const KEY_ERROR: &str = "error";
pub const KEY_ACTION: &str = "action";
pub const KEY_ONLINE: &str = "online";
pub const KEY_SUB_DEV_ID: &str = "subDevId";

/// Normalized result of a command sent over either transport.
///
/// Renders as the short strings used in logs and by callers:
/// `online`, `offline`, `timeout`, `E#<code>` and `unknown`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Outcome {
    /// The device acknowledged the command.
    Online,
    /// The cloud reports the device as unreachable.
    Offline,
    /// No reply within the allotted time.
    Timeout,
    /// Device error number, or a transport failure tag (`COS`, `???`).
    Error(String),
    /// Nothing to judge by, e.g. a fire-and-forget write.
    Unknown,
}

impl Outcome {
    /// Maps the `error` field of a cloud reply.
    pub fn from_cloud_error(code: Option<i64>) -> Self {
        match code {
            Some(0) => Outcome::Online,
            Some(503) => Outcome::Offline,
            Some(504) => Outcome::Timeout,
            Some(n) => Outcome::Error(n.to_string()),
            None => Outcome::Unknown,
        }
    }

    /// Maps the `error` field of a LAN reply.
    pub fn from_device_error(code: i64) -> Self {
        if code == 0 {
            Outcome::Online
        } else {
            Outcome::Error(code.to_string())
        }
    }

    /// Connection reset or refused before a reply.
    pub fn connection_reset() -> Self {
        Outcome::Error("COS".to_string())
    }

    /// Any other transport failure.
    pub fn failed() -> Self {
        Outcome::Error("???".to_string())
    }

    pub fn is_online(&self) -> bool {
        matches!(self, Outcome::Online)
    }

    /// True when the device itself answered, whether or not it accepted the command.
    pub fn is_reply(&self) -> bool {
        match self {
            Outcome::Online => true,
            Outcome::Error(code) => code.parse::<i64>().is_ok(),
            _ => false,
        }
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Outcome::Online => f.write_str("online"),
            Outcome::Offline => f.write_str("offline"),
            Outcome::Timeout => f.write_str("timeout"),
            Outcome::Error(code) => write!(f, "E#{}", code),
            Outcome::Unknown => f.write_str("unknown"),
        }
    }
}

impl Serialize for Outcome {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

static LAST_SEQUENCE: AtomicU64 = AtomicU64::new(0);

pub(crate) fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Returns the next command sequence: the current time in milliseconds,
/// bumped by one when the clock has not moved past the previous value.
pub fn sequence() -> String {
    let now = now_ms();
    let mut last = LAST_SEQUENCE.load(Ordering::SeqCst);
    loop {
        let next = if now <= last { last + 1 } else { now };
        match LAST_SEQUENCE.compare_exchange_weak(last, next, Ordering::SeqCst, Ordering::SeqCst) {
            Ok(_) => return next.to_string(),
            Err(actual) => last = actual,
        }
    }
}
