//! LAN transport.
//! Browses `_ewelink._tcp.local.` for device announcements and posts
//! commands to the device's zeroconf HTTP endpoint.

use crate::crypto::{self, DATA_FRAGMENTS};
use crate::device::XDevice;
use crate::dispatcher::Dispatcher;
use crate::error::{EwelinkError, Result};
use crate::protocol::{
    CMD_PROBE, KEY_DEVICEID, KEY_ONLINE, KEY_PARAMS, KEY_SEQUENCE, LAN_PORT, LAN_SELF_APIKEY,
    Outcome, SERVICE_TYPE, SIGNAL_CONNECTED, SIGNAL_UPDATE,
};
use log::{debug, info, warn};
use mdns_sd::{ServiceDaemon, ServiceEvent, ServiceInfo};
use parking_lot::{Mutex, RwLock};
use serde_json::{Map, Value, json};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::time::Duration;
use tokio_util::sync::CancellationToken;

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

/// Builds the `update` payload for one announcement from its TXT record.
///
/// Plaintext payloads carry `params`; encrypted ones carry `encrypt`, `iv`
/// and the joined `data` for the registry to decrypt. Returns `None` when
/// the record has no device id.
pub fn decode_txt(host: Option<String>, txt: &HashMap<String, String>) -> Option<Map<String, Value>> {
    let deviceid = txt.get("id").filter(|id| !id.is_empty())?;

    let mut msg = Map::new();
    msg.insert(KEY_DEVICEID.into(), json!(deviceid));
    if let Some(host) = host {
        msg.insert("host".into(), json!(host));
    }
    if let Some(localtype) = txt.get("type") {
        msg.insert("localtype".into(), json!(localtype));
    }
    if let Some(seq) = txt.get("seq") {
        msg.insert(KEY_SEQUENCE.into(), json!(seq));
    }

    let data: String = DATA_FRAGMENTS
        .iter()
        .filter_map(|key| txt.get(*key).map(String::as_str))
        .collect();

    if txt.get("encrypt").is_some_and(|v| v == "true") {
        msg.insert("encrypt".into(), json!(true));
        msg.insert("iv".into(), json!(txt.get("iv").cloned().unwrap_or_default()));
        msg.insert("data".into(), json!(data));
    } else {
        match serde_json::from_str::<Value>(&data) {
            Ok(params @ Value::Object(_)) => {
                msg.insert(KEY_PARAMS.into(), params);
            }
            _ => {
                warn!("{} <= Local3 | unreadable plaintext payload: {}", deviceid, data);
                return None;
            }
        }
    }
    Some(msg)
}

/// `eWeLink_1000abcdef._ewelink._tcp.local.` -> `1000abcdef`.
pub fn deviceid_from_fullname(fullname: &str) -> Option<&str> {
    let instance = fullname.split('.').next()?;
    let id = instance.strip_prefix("eWeLink_").unwrap_or(instance);
    (!id.is_empty()).then_some(id)
}

/// Adds the default port when `host` has none.
pub fn host_with_port(host: &str) -> String {
    if host.contains(':') {
        host.to_string()
    } else {
        format!("{}:{}", host, LAN_PORT)
    }
}

fn service_host(info: &ServiceInfo) -> Option<String> {
    let addresses = info.get_addresses();
    let ip = addresses
        .iter()
        .find(|ip| ip.is_ipv4())
        .or_else(|| addresses.iter().next())?;
    let port = info.get_port();
    Some(if port == LAN_PORT {
        ip.to_string()
    } else {
        format!("{}:{}", ip, port)
    })
}

/// Splits the command word out of `params`: an explicit command wins, then a
/// `cmd` key, then the first key. Empty params become the liveness probe.
pub fn resolve_command(
    params: Option<&Map<String, Value>>,
    command: Option<&str>,
) -> (String, Map<String, Value>) {
    let mut data = params.cloned().unwrap_or_default();
    let from_params = data
        .remove("cmd")
        .and_then(|cmd| cmd.as_str().map(str::to_string));
    if let Some(command) = command.map(str::to_string).or(from_params) {
        return (command, data);
    }
    match data.keys().next().cloned() {
        Some(first) => (first, data),
        None => {
            data.insert(CMD_PROBE.into(), json!("on"));
            (CMD_PROBE.to_string(), data)
        }
    }
}

/// LocalClient discovers devices on the LAN and sends them commands.
///
/// It publishes `connected` (`true` when browsing starts, `false` on stop)
/// and `update` (one announcement) on its own [`Dispatcher`].
#[derive(Clone)]
pub struct LocalClient {
    inner: Arc<LocalInner>,
}

struct LocalInner {
    dispatcher: Dispatcher,
    http: reqwest::Client,
    online: RwLock<bool>,
    daemon: Mutex<Option<ServiceDaemon>>,
    cancel_token: CancellationToken,
}

impl Default for LocalClient {
    fn default() -> Self {
        Self::new()
    }
}

impl LocalClient {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(LocalInner {
                dispatcher: Dispatcher::new(),
                http: reqwest::Client::new(),
                online: RwLock::new(false),
                daemon: Mutex::new(None),
                cancel_token: CancellationToken::new(),
            }),
        }
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.inner.dispatcher
    }

    /// True while the mDNS browser runs.
    pub fn online(&self) -> bool {
        *self.inner.online.read()
    }

    pub(crate) fn set_online(&self, online: bool) {
        let changed = {
            let mut guard = self.inner.online.write();
            let changed = *guard != online;
            *guard = online;
            changed
        };
        if changed {
            self.inner.dispatcher.send(SIGNAL_CONNECTED, &json!(online));
        }
    }

    /// Starts browsing for devices in a background task.
    pub fn start(&self) -> Result<()> {
        let daemon = ServiceDaemon::new()
            .map_err(|e| EwelinkError::Io(format!("mDNS daemon: {}", e)))?;
        let receiver = daemon
            .browse(SERVICE_TYPE)
            .map_err(|e| EwelinkError::Io(format!("mDNS browse: {}", e)))?;
        *self.inner.daemon.lock() = Some(daemon);
        info!("Browsing for {}", SERVICE_TYPE);
        self.set_online(true);

        let client = self.clone();
        let token = self.inner.cancel_token.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    event = receiver.recv_async() => match event {
                        Ok(event) => client.handle_event(event),
                        Err(_) => break,
                    },
                }
            }
            debug!("mDNS browser task exited");
        });
        Ok(())
    }

    pub fn stop(&self) {
        self.inner.cancel_token.cancel();
        if let Some(daemon) = self.inner.daemon.lock().take() {
            let _ = daemon.stop_browse(SERVICE_TYPE);
            let _ = daemon.shutdown();
        }
        self.set_online(false);
    }

    fn handle_event(&self, event: ServiceEvent) {
        match event {
            ServiceEvent::ServiceResolved(info) => {
                let txt: HashMap<String, String> = info
                    .get_properties()
                    .iter()
                    .map(|p| (p.key().to_string(), p.val_str().to_string()))
                    .collect();
                self.handle_announcement(service_host(&info), &txt);
            }
            ServiceEvent::ServiceRemoved(_, fullname) => self.handle_removed(&fullname),
            _ => {}
        }
    }

    pub(crate) fn handle_announcement(&self, host: Option<String>, txt: &HashMap<String, String>) {
        let Some(msg) = decode_txt(host, txt) else {
            return;
        };
        debug!(
            "{} <= Local3 | {} | {} | {}",
            msg.get(KEY_DEVICEID).and_then(Value::as_str).unwrap_or_default(),
            msg.get("host").and_then(Value::as_str).unwrap_or("-"),
            msg.get(KEY_PARAMS).map_or_else(|| "encrypted".to_string(), Value::to_string),
            msg.get(KEY_SEQUENCE).and_then(Value::as_str).unwrap_or("")
        );
        self.inner.dispatcher.send(SIGNAL_UPDATE, &Value::Object(msg));
    }

    pub(crate) fn handle_removed(&self, fullname: &str) {
        let Some(deviceid) = deviceid_from_fullname(fullname) else {
            return;
        };
        debug!("{} <= Local3 | removed", deviceid);
        let msg = json!({KEY_DEVICEID: deviceid, KEY_PARAMS: {KEY_ONLINE: null}});
        self.inner.dispatcher.send(SIGNAL_UPDATE, &msg);
    }

    /// Posts one command to the device's zeroconf endpoint.
    ///
    /// The command word comes from `command`, a `cmd` key in `params` or the
    /// first key of `params`. The payload is encrypted when the device has a
    /// devicekey.
    pub async fn send(
        &self,
        device: &XDevice,
        params: Option<&Map<String, Value>>,
        command: Option<&str>,
        sequence: String,
        timeout: Duration,
    ) -> Outcome {
        let Some(host) = device.host.as_deref() else {
            return Outcome::failed();
        };
        let (command, data) = resolve_command(params, command);
        debug!(
            "{} => Local4 | {} | {} {} | {}",
            device.deviceid,
            host,
            command,
            Value::Object(data.clone()),
            sequence
        );

        let mut payload = Map::new();
        payload.insert(KEY_SEQUENCE.into(), json!(sequence));
        payload.insert(KEY_DEVICEID.into(), json!(device.deviceid));
        payload.insert("selfApikey".into(), json!(LAN_SELF_APIKEY));
        payload.insert("data".into(), Value::Object(data));
        if let Some(devicekey) = device.devicekey.as_deref() {
            if let Err(e) = crypto::encrypt_payload(&mut payload, devicekey) {
                warn!("{} => Local4 | {}", device.deviceid, e);
                return Outcome::failed();
            }
        }

        let url = format!("http://{}/zeroconf/{}", host_with_port(host), command);
        let result = self
            .inner
            .http
            .post(&url)
            .header("Connection", "close")
            .json(&payload)
            .timeout(timeout)
            .send()
            .await;

        let outcome = match result {
            Ok(resp) => match resp.json::<Value>().await {
                // any answer to the probe proves the device is there
                _ if command == CMD_PROBE => Outcome::Online,
                Ok(reply) => match reply.get("error").and_then(Value::as_i64) {
                    Some(code) => Outcome::from_device_error(code),
                    None => Outcome::failed(),
                },
                Err(e) if e.is_timeout() => Outcome::Timeout,
                Err(_) => Outcome::failed(),
            },
            Err(e) if e.is_timeout() => Outcome::Timeout,
            Err(e) if e.is_connect() => Outcome::connection_reset(),
            Err(e) => {
                debug!("{} => Local4 | {}", device.deviceid, e);
                Outcome::failed()
            }
        };
        if !outcome.is_online() {
            debug!("{} <= Local4 | {} | {}", device.deviceid, host, outcome);
        }
        outcome
    }
}
