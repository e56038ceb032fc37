//! The device registry.
//!
//! Owns the device table, turns `update` events from both transports into
//! per-device signals, and implements the single write path [`Registry::send`]
//! that picks between LAN and Cloud.

use crate::cache;
use crate::cloud::{self, CloudClient};
use crate::config::Config;
use crate::crypto;
use crate::device::XDevice;
use crate::dispatcher::Dispatcher;
use crate::entities::{EntityStub, entity_stubs};
use crate::error::{EwelinkError, Result};
use crate::local::{self, LocalClient};
use crate::protocol::{
    self, CMD_GET_STATE, CMD_STATISTICS, KEY_DEVICEID, KEY_ONLINE, KEY_PARAMS, KEY_SEQUENCE,
    KEY_SUB_DEV_ID, Outcome, SIGNAL_ADD_ENTITIES, SIGNAL_CONNECTED, SIGNAL_UPDATE,
};
use log::{debug, info, warn};
use parking_lot::{Mutex, RwLock};
use serde_json::{Map, Value, json};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tokio::time::{Duration, Instant, sleep};
use tokio_util::sync::CancellationToken;

const MAINTENANCE_INTERVAL: Duration = Duration::from_secs(30);
/// Window in which `send_bulk` calls are merged into one write.
const BULK_WINDOW: Duration = Duration::from_millis(100);
const PROBE_SPACING: Duration = Duration::from_secs(5);
const PROBE_TIMEOUTS: [Duration; 3] = [
    Duration::from_secs(20),
    Duration::from_secs(40),
    Duration::from_secs(60),
];
const OUTLET_SPACING: Duration = Duration::from_secs(5);
pub const DEFAULT_TIMEOUT_LAN: Duration = Duration::from_secs(1);

/// Energy meters that only report while someone asks for `uiActive`.
const UI_ACTIVE_UIIDS: [u32; 6] = [5, 32, 182, 190, 181, 226];
const UIID_DUAL_R3: u32 = 126;
const UIID_SPM: u32 = 130;

/// Arguments of [`Registry::send`].
#[derive(Debug, Clone, PartialEq)]
pub struct SendRequest {
    /// Params for both transports. `None` or empty means a state query.
    pub params: Option<Map<String, Value>>,
    /// LAN-specific params, when the LAN API differs from the cloud one.
    pub params_lan: Option<Map<String, Value>>,
    /// Explicit zeroconf command.
    pub cmd_lan: Option<String>,
    /// Ask the cloud for fresh state after a successful write.
    pub query_cloud: bool,
    /// LAN timeout while the cloud is available as fallback.
    pub timeout_lan: Duration,
}

impl Default for SendRequest {
    fn default() -> Self {
        Self {
            params: None,
            params_lan: None,
            cmd_lan: None,
            query_cloud: true,
            timeout_lan: DEFAULT_TIMEOUT_LAN,
        }
    }
}

impl SendRequest {
    pub fn new(params: Map<String, Value>) -> Self {
        Self {
            params: Some(params),
            ..Default::default()
        }
    }

    pub fn query() -> Self {
        Self::default()
    }

    pub fn lan(mut self, params_lan: Map<String, Value>) -> Self {
        self.params_lan = Some(params_lan);
        self
    }

    pub fn cmd(mut self, cmd: impl Into<String>) -> Self {
        self.cmd_lan = Some(cmd.into());
        self
    }

    pub fn no_query(mut self) -> Self {
        self.query_cloud = false;
        self
    }

    pub fn timeout_lan(mut self, timeout: Duration) -> Self {
        self.timeout_lan = timeout;
        self
    }

    fn is_write(&self) -> bool {
        self.params.as_ref().is_some_and(|p| !p.is_empty())
    }
}

/// Registry is the handle the entity layer holds.
///
/// Subscribe to `add_entities`, `connected` and one signal per deviceid on
/// [`Registry::dispatcher`]; write with [`Registry::send`].
#[derive(Clone)]
pub struct Registry {
    inner: Arc<RegistryInner>,
}

struct RegistryInner {
    config: Config,
    dispatcher: Dispatcher,
    cloud: CloudClient,
    local: LocalClient,
    devices: RwLock<HashMap<String, XDevice>>,
    /// Raw messages of unknown devices that could not be decrypted.
    unknown: Mutex<HashMap<String, Map<String, Value>>>,
    /// Devices with an offline check in flight.
    checking: Mutex<HashSet<String>>,
    maintenance_started: AtomicBool,
    cancel_token: CancellationToken,
}

impl Registry {
    pub fn new(config: Config) -> Self {
        let cloud = CloudClient::new(config.region, &config.country_code);
        let inner = Arc::new(RegistryInner {
            config,
            dispatcher: Dispatcher::new(),
            cloud,
            local: LocalClient::new(),
            devices: RwLock::new(HashMap::new()),
            unknown: Mutex::new(HashMap::new()),
            checking: Mutex::new(HashSet::new()),
            maintenance_started: AtomicBool::new(false),
            cancel_token: CancellationToken::new(),
        });

        let weak = Arc::downgrade(&inner);
        inner
            .cloud
            .dispatcher()
            .connect_fn(SIGNAL_UPDATE, with_registry(&weak, Registry::cloud_update));
        inner
            .cloud
            .dispatcher()
            .connect_fn(SIGNAL_CONNECTED, with_registry(&weak, Registry::on_connected));
        inner
            .local
            .dispatcher()
            .connect_fn(SIGNAL_UPDATE, with_registry(&weak, Registry::local_update));
        inner
            .local
            .dispatcher()
            .connect_fn(SIGNAL_CONNECTED, with_registry(&weak, Registry::on_connected));

        Self { inner }
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.inner.dispatcher
    }

    pub fn cloud(&self) -> &CloudClient {
        &self.inner.cloud
    }

    pub fn local(&self) -> &LocalClient {
        &self.inner.local
    }

    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    /// Snapshot of one device record.
    pub fn device(&self, deviceid: &str) -> Option<XDevice> {
        self.inner.devices.read().get(deviceid).cloned()
    }

    pub fn devices(&self) -> Vec<XDevice> {
        self.inner.devices.read().values().cloned().collect()
    }

    fn with_device_mut<R>(&self, deviceid: &str, f: impl FnOnce(&mut XDevice) -> R) -> Option<R> {
        self.inner.devices.write().get_mut(deviceid).map(f)
    }

    /// LAN reachability; sub-devices follow their hub.
    pub fn is_local(&self, deviceid: &str) -> bool {
        let devices = self.inner.devices.read();
        let Some(device) = devices.get(deviceid) else {
            return false;
        };
        match device.parent.as_deref().and_then(|p| devices.get(p)) {
            Some(parent) => parent.local,
            None => device.local,
        }
    }

    /// Reachable through the cloud or, with a known host, through the LAN.
    /// Sub-devices use their hub's host and LAN state.
    pub fn is_available(&self, deviceid: &str) -> bool {
        let devices = self.inner.devices.read();
        let Some(device) = devices.get(deviceid) else {
            return false;
        };
        let main = device
            .parent
            .as_deref()
            .and_then(|p| devices.get(p))
            .unwrap_or(device);
        let cloud = self.inner.cloud.online() == Some(true) && device.online == Some(true);
        let lan = self.inner.local.online() && main.host.is_some() && main.local;
        cloud || lan
    }

    // -------------------------------------------------------------------------
    // Lifecycle
    // -------------------------------------------------------------------------

    /// Loads the inventory, announces its entities and starts the transports
    /// selected by the configured mode.
    pub async fn start(&self) -> Result<()> {
        let devices = self.load_inventory().await?;
        self.setup_devices(devices);

        let mode = self.inner.config.mode;
        if mode.use_cloud() && self.inner.cloud.is_auth() {
            self.inner.cloud.start();
        }
        if mode.use_local() {
            if let Err(e) = self.inner.local.start() {
                warn!("LAN discovery unavailable: {}", e);
            }
        }
        Ok(())
    }

    /// Cloud inventory when it can be fetched, otherwise the cached one.
    /// Only a rejected login is an error.
    async fn load_inventory(&self) -> Result<Vec<XDevice>> {
        let config = &self.inner.config;
        if config.mode.use_cloud() {
            if let Some((username, password)) = config.credentials() {
                match self.inner.cloud.login(username, password, config.app).await {
                    Ok(_) => match self.inner.cloud.get_devices(&config.homes).await {
                        Ok(devices) => {
                            if let Some(path) = config.cache_path.as_deref() {
                                if let Err(e) = cache::save_devices(path, &devices) {
                                    warn!("Can't write device cache: {}", e);
                                }
                            }
                            return Ok(devices);
                        }
                        Err(e) => warn!("Can't load devices from Cloud: {}", e),
                    },
                    Err(e @ EwelinkError::Auth(_)) => return Err(e),
                    Err(e) => warn!("Can't login to Cloud: {}", e),
                }
            }
        }

        let cached = config
            .cache_path
            .as_deref()
            .map(cache::load_devices)
            .unwrap_or_default();
        if !cached.is_empty() {
            info!("{} devices loaded from cache", cached.len());
        }
        Ok(cached)
    }

    /// Adds devices to the table and publishes their entity stubs.
    pub fn setup_devices(&self, devices: Vec<XDevice>) -> Vec<EntityStub> {
        let ids: Vec<String> = {
            let mut table = self.inner.devices.write();
            let mut ids = Vec::with_capacity(devices.len());
            for mut device in devices {
                if let Some(overrides) = self.inner.config.device(&device.deviceid) {
                    device.apply_config(overrides);
                }
                ids.push(device.deviceid.clone());
                table.insert(device.deviceid.clone(), device);
            }
            resolve_parents(&mut table);
            ids
        };

        let mut stubs = Vec::new();
        {
            let table = self.inner.devices.read();
            for id in &ids {
                let Some(device) = table.get(id) else { continue };
                info!(
                    "{} UIID {:04} | {} | {}",
                    id,
                    device.uiid(),
                    device.name,
                    device.product_model.as_deref().unwrap_or("-")
                );
                stubs.extend(entity_stubs(device));
            }
        }
        self.publish_entities(&stubs);
        stubs
    }

    fn publish_entities(&self, stubs: &[EntityStub]) {
        if stubs.is_empty() {
            return;
        }
        match serde_json::to_value(stubs) {
            Ok(payload) => {
                self.inner.dispatcher.send(SIGNAL_ADD_ENTITIES, &payload);
            }
            Err(e) => warn!("Can't serialize entity stubs: {}", e),
        }
    }

    /// Stops maintenance and both transports and forgets every device.
    pub async fn stop(&self) {
        self.inner.cancel_token.cancel();
        self.inner.cloud.stop().await;
        self.inner.local.stop();
        self.inner.devices.write().clear();
        self.inner.unknown.lock().clear();
        self.inner.checking.lock().clear();
        self.inner.dispatcher.clear();
    }

    fn on_connected(&self, _online: &Value) {
        let ids: Vec<String> = self.inner.devices.read().keys().cloned().collect();
        for id in ids {
            self.inner.dispatcher.send(&id, &json!({}));
        }
        if !self.inner.maintenance_started.swap(true, Ordering::SeqCst) {
            let registry = self.clone();
            tokio::spawn(async move { registry.run_maintenance().await });
        }
    }

    // -------------------------------------------------------------------------
    // Inbound
    // -------------------------------------------------------------------------

    /// Handles an `update` published by the cloud transport.
    fn cloud_update(&self, msg: &Value) {
        let Some(did) = msg.get(KEY_DEVICEID).and_then(Value::as_str) else {
            return;
        };
        let params = msg
            .get(KEY_PARAMS)
            .and_then(Value::as_object)
            .cloned()
            .unwrap_or_default();
        let seq = msg.get(KEY_SEQUENCE).and_then(Value::as_str);

        let check = {
            let mut devices = self.inner.devices.write();
            // devices of other homes have no online field
            let Some(device) = devices.get_mut(did).filter(|d| d.online.is_some()) else {
                return;
            };
            if device.check_duplicate(seq) {
                debug!("{} <= Cloud3 | duplicate {}", did, seq.unwrap_or_default());
                return;
            }
            let check = match params.get(KEY_ONLINE).and_then(Value::as_bool) {
                Some(online) => {
                    device.online = Some(online);
                    true
                }
                None => {
                    if device.online == Some(false) {
                        device.online = Some(true);
                    }
                    false
                }
            };
            device.merge_params(&params);
            check
        };

        if check {
            // the LAN side may still reach the device
            self.spawn_check_offline(did);
        }
        self.inner.dispatcher.send(did, &Value::Object(params));
    }

    /// Handles an `update` published by the LAN transport.
    fn local_update(&self, msg: &Value) {
        let Some(msg) = msg.as_object() else {
            return;
        };
        let Some(did) = msg.get(KEY_DEVICEID).and_then(Value::as_str) else {
            return;
        };
        let host = msg.get("host").and_then(Value::as_str);
        let localtype = msg.get("localtype").and_then(Value::as_str);
        let seq = msg.get(KEY_SEQUENCE).and_then(Value::as_str);
        let plain = msg.get(KEY_PARAMS).and_then(Value::as_object).cloned();

        if host.is_none() && plain.as_ref().is_some_and(|p| p.contains_key(KEY_ONLINE)) {
            // service removed; only a probe can tell whether the device is gone
            if self.device(did).is_some() {
                self.spawn_check_offline(did);
            }
            return;
        }

        let mut new_stubs = Vec::new();
        let (target, hub, params) = {
            let mut devices = self.inner.devices.write();

            let params = match devices.get_mut(did) {
                Some(device) => match plain {
                    Some(params) => {
                        if device.devicekey.take().is_some() {
                            info!("{} <= Local3 | plaintext payload, devicekey dropped", did);
                        }
                        params
                    }
                    None => {
                        let Some(devicekey) = device.devicekey.as_deref() else {
                            debug!("{} <= Local3 | encrypted payload without devicekey", did);
                            return;
                        };
                        match decrypt_params(msg, devicekey) {
                            Some(params) => params,
                            None => {
                                debug!("{} <= Local3 | can't decrypt payload", did);
                                return;
                            }
                        }
                    }
                },
                None => {
                    let encrypted = plain.is_none();
                    let params = match plain {
                        Some(params) => params,
                        None => match self.decrypt_unknown(did, msg) {
                            Some(params) => params,
                            None => return,
                        },
                    };
                    let mut device = XDevice::from_diy(
                        did,
                        localtype,
                        params.clone(),
                        host.map(str::to_string),
                    );
                    if let Some(overrides) = self.inner.config.device(did) {
                        device.apply_config(overrides);
                    }
                    if !encrypted {
                        device.devicekey = None;
                    }
                    info!(
                        "{} <= Local3 | new DIY device {} UIID {:04}",
                        did,
                        localtype.unwrap_or("?"),
                        device.uiid()
                    );
                    new_stubs = entity_stubs(&device);
                    devices.insert(did.to_string(), device);
                    params
                }
            };

            let sub = params
                .get(KEY_SUB_DEV_ID)
                .and_then(Value::as_str)
                .filter(|sid| *sid != did && devices.contains_key(*sid))
                .map(str::to_string);

            let Some(device) = devices.get_mut(did) else {
                return;
            };
            if device.check_duplicate(seq) {
                debug!("{} <= Local3 | duplicate {}", did, seq.unwrap_or_default());
                return;
            }
            if let Some(host) = host {
                if device.host.as_deref() != Some(host) {
                    info!("{} <= Local3 | host {}", did, host);
                    device.host = Some(host.to_string());
                }
            }
            if let Some(localtype) = localtype {
                if device.localtype.as_deref() != Some(localtype) {
                    device.localtype = Some(localtype.to_string());
                }
            }
            device.refresh_local(Instant::now());

            match sub {
                Some(sid) => {
                    let mut child_params = params;
                    child_params.remove(KEY_SUB_DEV_ID);
                    if let Some(child) = devices.get_mut(&sid) {
                        child.merge_params(&child_params);
                    }
                    (sid, Some(did.to_string()), child_params)
                }
                None => {
                    device.merge_params(&params);
                    (did.to_string(), None, params)
                }
            }
        };

        self.publish_entities(&new_stubs);
        self.inner.dispatcher.send(&target, &Value::Object(params));
        if let Some(hub) = hub {
            self.inner.dispatcher.send(&hub, &json!({}));
        }
    }

    /// Decrypts an announcement of a device missing from the table with the
    /// devicekey from the config. Failures are remembered and not retried.
    fn decrypt_unknown(&self, did: &str, msg: &Map<String, Value>) -> Option<Map<String, Value>> {
        if self.inner.unknown.lock().contains_key(did) {
            return None;
        }
        let params = self
            .inner
            .config
            .devicekey(did)
            .and_then(|devicekey| decrypt_params(msg, devicekey));
        if params.is_none() {
            info!("{} <= Local3 | unknown device, set its devicekey in the config", did);
            self.inner.unknown.lock().insert(did.to_string(), msg.clone());
        }
        params
    }

    // -------------------------------------------------------------------------
    // Outbound
    // -------------------------------------------------------------------------

    /// Sends a command, LAN first when possible with the cloud as fallback.
    ///
    /// Returns `None` when neither transport can reach the device.
    pub async fn send(&self, deviceid: &str, req: SendRequest) -> Option<Outcome> {
        let (device, main) = {
            let devices = self.inner.devices.read();
            let device = devices.get(deviceid)?.clone();
            let main = device
                .parent
                .as_deref()
                .and_then(|p| devices.get(p))
                .cloned()
                .unwrap_or_else(|| device.clone());
            (device, main)
        };

        let mut params_lan = req.params_lan.clone().or_else(|| req.params.clone());
        if device.parent.is_some() {
            if let Some(p) = params_lan.as_mut() {
                p.insert(KEY_SUB_DEV_ID.into(), json!(device.deviceid));
            }
        }

        let can_local = self.inner.local.online() && main.host.is_some() && main.local;
        let can_cloud = self.inner.cloud.online() == Some(true) && device.online == Some(true);

        if can_local && main.local_expired(Instant::now()) {
            self.spawn_check_offline(&main.deviceid);
        }

        let seq = protocol::sequence();
        if can_local && can_cloud {
            let outcome = self
                .inner
                .local
                .send(&main, params_lan.as_ref(), req.cmd_lan.as_deref(), seq, req.timeout_lan)
                .await;
            if outcome.is_online() {
                self.touch_local(&main.deviceid);
                return Some(outcome);
            }
            debug!("{} => Local4 | {} | falling back to Cloud", main.deviceid, outcome);

            let outcome = self.send_cloud(&device, &req).await;
            if !outcome.is_online() {
                self.spawn_check_offline(&main.deviceid);
            }
            Some(outcome)
        } else if can_local {
            let outcome = self
                .inner
                .local
                .send(
                    &main,
                    params_lan.as_ref(),
                    req.cmd_lan.as_deref(),
                    seq,
                    local::DEFAULT_TIMEOUT,
                )
                .await;
            if outcome.is_online() {
                self.touch_local(&main.deviceid);
            } else {
                self.spawn_check_offline(&main.deviceid);
            }
            Some(outcome)
        } else if can_cloud {
            Some(self.send_cloud(&device, &req).await)
        } else {
            debug!("{} !! can't send, device unreachable", deviceid);
            None
        }
    }

    /// Cloud write, followed by a fire-and-forget query so the device
    /// reports its new state.
    async fn send_cloud(&self, device: &XDevice, req: &SendRequest) -> Outcome {
        let outcome = self
            .inner
            .cloud
            .send(device, req.params.as_ref(), cloud::DEFAULT_TIMEOUT)
            .await;
        if outcome.is_online() && req.is_write() && req.query_cloud {
            let cloud = self.inner.cloud.clone();
            let device = device.clone();
            tokio::spawn(async move {
                cloud.send(&device, None, Duration::ZERO).await;
            });
        }
        outcome
    }

    fn touch_local(&self, deviceid: &str) {
        self.with_device_mut(deviceid, |d| d.refresh_local(Instant::now()));
    }

    /// Merges bursts of `switches` writes into a single send.
    ///
    /// The first call in a window waits briefly and sends the merged
    /// `switches`; calls that join its window return `None` right away.
    pub async fn send_bulk(&self, deviceid: &str, params: Map<String, Value>) -> Option<Outcome> {
        if !params.get("switches").is_some_and(Value::is_array) {
            return self.send(deviceid, SendRequest::new(params)).await;
        }

        let joined = self.with_device_mut(deviceid, |device| {
            if let Some(bulk) = device.params_bulk.as_mut() {
                merge_switches(bulk, &params);
                return true;
            }
            device.params_bulk = Some(params);
            false
        })?;
        if joined {
            return None;
        }

        sleep(BULK_WINDOW).await;
        let bulk = self.with_device_mut(deviceid, |d| d.params_bulk.take())??;
        self.send(deviceid, SendRequest::new(bulk)).await
    }

    // -------------------------------------------------------------------------
    // Liveness
    // -------------------------------------------------------------------------

    fn spawn_check_offline(&self, deviceid: &str) {
        let registry = self.clone();
        let deviceid = deviceid.to_string();
        tokio::spawn(async move { registry.check_offline(&deviceid).await });
    }

    /// Probes the device over the LAN with `getState`. Any reply marks it
    /// local again; when every probe fails it is marked not local.
    /// At most one check runs per device.
    pub async fn check_offline(&self, deviceid: &str) {
        if !self.inner.checking.lock().insert(deviceid.to_string()) {
            debug!("{} !! Local4 | check already running", deviceid);
            return;
        }
        self.verify_local(deviceid).await;
        self.inner.checking.lock().remove(deviceid);
    }

    async fn verify_local(&self, deviceid: &str) {
        let Some(device) = self.device(deviceid) else {
            return;
        };
        if device.host.is_none() || !self.inner.local.online() {
            return;
        }

        let probes = if device.long_lost(Instant::now()) { 1 } else { PROBE_TIMEOUTS.len() };
        for (i, probe_timeout) in PROBE_TIMEOUTS.iter().take(probes).enumerate() {
            if i > 0 {
                sleep(PROBE_SPACING).await;
            }
            let outcome = self
                .inner
                .local
                .send(&device, None, Some(CMD_GET_STATE), protocol::sequence(), *probe_timeout)
                .await;
            if outcome.is_reply() {
                debug!("{} <= Local4 | still reachable ({})", deviceid, outcome);
                self.touch_local(deviceid);
                return;
            }
        }

        info!("{} !! Local4 | device is offline", deviceid);
        self.with_device_mut(deviceid, |d| d.local = false);
        self.inner.dispatcher.send(deviceid, &json!({}));
    }

    async fn run_maintenance(self) {
        let token = self.inner.cancel_token.clone();
        debug!("Maintenance task started");
        loop {
            self.maintenance_tick().await;
            tokio::select! {
                _ = token.cancelled() => break,
                _ = sleep(MAINTENANCE_INTERVAL) => {}
            }
        }
        debug!("Maintenance task stopped");
    }

    /// Keeps energy telemetry flowing and re-verifies stale LAN devices.
    async fn maintenance_tick(&self) {
        let cloud_up = self.inner.cloud.online() == Some(true);
        let local_up = self.inner.local.online();
        let now = Instant::now();

        for device in self.devices() {
            let did = device.deviceid.as_str();
            let can_cloud = cloud_up && device.online == Some(true);
            let uiid = device.uiid();

            if UI_ACTIVE_UIIDS.contains(&uiid) {
                if can_cloud {
                    let params = as_map(json!({"uiActive": 60}));
                    self.inner.cloud.send(&device, Some(&params), Duration::ZERO).await;
                }
            } else if uiid == UIID_DUAL_R3 {
                if local_up && device.host.is_some() && device.local {
                    self.inner
                        .local
                        .send(
                            &device,
                            None,
                            Some(CMD_STATISTICS),
                            protocol::sequence(),
                            local::DEFAULT_TIMEOUT,
                        )
                        .await;
                } else if can_cloud {
                    let params = as_map(json!({"uiActive": {"all": 1, "time": 60}}));
                    self.inner.cloud.send(&device, Some(&params), Duration::ZERO).await;
                }
            } else if uiid == UIID_SPM && can_cloud {
                let cloud = self.inner.cloud.clone();
                let device = device.clone();
                tokio::spawn(async move {
                    for outlet in 0..4 {
                        if outlet > 0 {
                            sleep(OUTLET_SPACING).await;
                        }
                        let params = as_map(json!({"uiActive": {"outlet": outlet, "time": 60}}));
                        cloud.send(&device, Some(&params), Duration::ZERO).await;
                    }
                });
            }

            if local_up && device.local_expired(now) {
                debug!("{} !! Local4 | TTL expired, checking", did);
                self.spawn_check_offline(did);
            }
        }
    }
}

/// Adapts a registry method to a dispatcher handler without keeping the
/// registry alive.
fn with_registry(
    weak: &Weak<RegistryInner>,
    f: fn(&Registry, &Value),
) -> impl Fn(&Value) -> Result<()> + Send + Sync + 'static {
    let weak = weak.clone();
    move |payload: &Value| {
        if let Some(inner) = weak.upgrade() {
            f(&Registry { inner }, payload);
        }
        Ok(())
    }
}

/// Links sub-devices to their hub, refusing links that would form a cycle.
fn resolve_parents(table: &mut HashMap<String, XDevice>) {
    let links: Vec<(String, String)> = table
        .values()
        .filter_map(|d| {
            let parent = d.parentid()?;
            (parent != d.deviceid && table.contains_key(parent))
                .then(|| (d.deviceid.clone(), parent.to_string()))
        })
        .collect();

    for (child, parent) in links {
        // walk up from the would-be parent; reaching the child means a cycle
        let mut cursor = Some(parent.clone());
        let mut depth = 0;
        let mut cycle = false;
        while let Some(id) = cursor {
            if id == child || depth > table.len() {
                cycle = true;
                break;
            }
            cursor = table.get(&id).and_then(|d| d.parent.clone());
            depth += 1;
        }
        if cycle {
            warn!("{} ignoring parent {}: cycle", child, parent);
            continue;
        }
        if let Some(device) = table.get_mut(&child) {
            device.parent = Some(parent);
        }
    }
}

/// Merges `switches` entries by `outlet`, newer values winning.
fn merge_switches(bulk: &mut Map<String, Value>, params: &Map<String, Value>) {
    let Some(new) = params.get("switches").and_then(Value::as_array) else {
        return;
    };
    let Some(old) = bulk.get_mut("switches").and_then(Value::as_array_mut) else {
        bulk.insert("switches".into(), Value::Array(new.clone()));
        return;
    };
    for entry in new {
        let outlet = entry.get("outlet");
        match old.iter_mut().find(|o| o.get("outlet") == outlet) {
            Some(slot) => *slot = entry.clone(),
            None => old.push(entry.clone()),
        }
    }
}

fn decrypt_params(msg: &Map<String, Value>, devicekey: &str) -> Option<Map<String, Value>> {
    match crypto::decrypt_payload(msg, devicekey) {
        Ok(Value::Object(params)) => Some(params),
        _ => None,
    }
}

fn as_map(value: Value) -> Map<String, Value> {
    match value {
        Value::Object(map) => map,
        _ => Map::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cloud::{APP, Auth, Region};
    use crate::config::{DeviceConfig, Mode};
    use crate::testing::{FakeCloud, init_logger};
    use futures_util::StreamExt;
    use pretty_assertions::assert_eq;
    use tokio::time::timeout;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const DEVICEKEY: &str = "64271b79-89f6-4d18-8318-7d751faacd13";

    fn registry(mode: Mode) -> Registry {
        let registry = Registry::new(Config {
            mode,
            ..Default::default()
        });
        // tests drive maintenance by hand
        registry.inner.maintenance_started.store(true, Ordering::SeqCst);
        registry
    }

    fn record(deviceid: &str, uiid: u32, params: Value) -> XDevice {
        let mut device = XDevice::new(deviceid, uiid);
        device.apikey = "owner-apikey".into();
        device.online = Some(true);
        device.params = as_map(params);
        device
    }

    /// Collects every payload published on `signal`.
    fn capture(registry: &Registry, signal: &str) -> Arc<Mutex<Vec<Value>>> {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let s = seen.clone();
        registry.dispatcher().connect_fn(signal, move |v| {
            s.lock().push(v.clone());
            Ok(())
        });
        seen
    }

    fn announce(registry: &Registry, msg: Value) {
        registry.local().dispatcher().send(SIGNAL_UPDATE, &msg);
    }

    /// Brings the registry's cloud session up against a [`FakeCloud`] and
    /// consumes the handshake frame.
    async fn connect_cloud(registry: &Registry) -> (FakeCloud, MockServer) {
        let mut fake = FakeCloud::start(0).await;
        let api = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/dispatch/app"))
            .respond_with(ResponseTemplate::new(200).set_body_json(fake.dispatch_body()))
            .mount(&api)
            .await;

        let cloud = registry.cloud();
        cloud.set_auth(Auth {
            at: "token".into(),
            apikey: "user-apikey".into(),
            appid: APP[0].0.into(),
            region: Region::Eu,
        });
        cloud.set_endpoints(None, Some(api.uri()), false);
        let connected = cloud.dispatcher().stream(SIGNAL_CONNECTED);
        tokio::pin!(connected);
        cloud.start();
        assert_eq!(
            timeout(Duration::from_secs(5), connected.next()).await.unwrap(),
            Some(json!(true))
        );
        assert_eq!(fake.frames.recv().await.unwrap()["action"], "userOnline");
        (fake, api)
    }

    #[tokio::test]
    async fn setup_merges_overrides_links_hubs_and_publishes_entities() {
        let mut devices = HashMap::new();
        devices.insert(
            "1000abcdef".to_string(),
            DeviceConfig {
                name: Some("Hall".into()),
                ..Default::default()
            },
        );
        let registry = Registry::new(Config {
            devices,
            ..Default::default()
        });
        let entities = capture(&registry, SIGNAL_ADD_ENTITIES);

        let stubs = registry.setup_devices(vec![
            record("1000abcdef", 1, json!({"switch": "on"})),
            record("1000hub001", 66, json!({})),
            record("a480000001", 1770, json!({"parentid": "1000hub001"})),
            record("a480000002", 1770, json!({"parentid": "a480000002"})),
        ]);

        assert_eq!(registry.device("1000abcdef").unwrap().name, "Hall");
        assert_eq!(
            registry.device("a480000001").unwrap().parent.as_deref(),
            Some("1000hub001")
        );
        assert_eq!(registry.device("a480000002").unwrap().parent, None);

        assert_eq!(entities.lock().len(), 1);
        assert_eq!(entities.lock()[0].as_array().unwrap().len(), stubs.len());
        assert!(stubs.iter().any(|s| s.deviceid == "a480000001"));
    }

    #[test]
    fn parent_cycles_are_refused() {
        let mut table = HashMap::new();
        table.insert("a".to_string(), record("a", 1, json!({"parentid": "b"})));
        table.insert("b".to_string(), record("b", 1, json!({"parentid": "a"})));
        resolve_parents(&mut table);
        let linked = table.values().filter(|d| d.parent.is_some()).count();
        assert_eq!(linked, 1);
    }

    #[test]
    fn bulk_entries_merge_by_outlet() {
        let mut bulk = as_map(json!({"switches": [{"outlet": 0, "switch": "on"}, {"outlet": 1, "switch": "on"}]}));
        merge_switches(
            &mut bulk,
            &as_map(json!({"switches": [{"outlet": 1, "switch": "off"}, {"outlet": 3, "switch": "on"}]})),
        );
        assert_eq!(
            bulk["switches"],
            json!([
                {"outlet": 0, "switch": "on"},
                {"outlet": 1, "switch": "off"},
                {"outlet": 3, "switch": "on"}
            ])
        );
    }

    #[tokio::test]
    async fn encrypted_announcement_is_decrypted_with_stored_key() {
        let registry = registry(Mode::Auto);
        let mut device = record("1000abcdef", 1, json!({"switch": "off"}));
        device.devicekey = Some(DEVICEKEY.into());
        registry.setup_devices(vec![device]);
        let signals = capture(&registry, "1000abcdef");

        announce(
            &registry,
            json!({
                "deviceid": "1000abcdef",
                "host": "192.168.1.20",
                "localtype": "plug",
                "sequence": "12",
                "encrypt": true,
                "iv": "3PgYPjEuE4qCoZOTsPE2xg==",
                "data": "t9YKDAK3nnURqivGN0evtaS+Yj4M6b6NUV+ptJlMTOQ="
            }),
        );

        let device = registry.device("1000abcdef").unwrap();
        assert_eq!(device.params["switch"], "on");
        assert_eq!(device.host.as_deref(), Some("192.168.1.20"));
        assert!(device.local);
        assert!(!device.local_expired(Instant::now()));
        assert_eq!(device.devicekey.as_deref(), Some(DEVICEKEY));
        assert_eq!(*signals.lock(), vec![json!({"switch": "on"})]);
    }

    #[tokio::test]
    async fn undecryptable_announcement_is_dropped_quietly() {
        let registry = registry(Mode::Auto);
        let mut device = record("1000abcdef", 1, json!({}));
        device.devicekey = Some("00000000-0000-0000-0000-000000000000".into());
        registry.setup_devices(vec![device]);
        let signals = capture(&registry, "1000abcdef");

        announce(
            &registry,
            json!({
                "deviceid": "1000abcdef",
                "host": "192.168.1.20",
                "encrypt": true,
                "iv": "3PgYPjEuE4qCoZOTsPE2xg==",
                "data": "t9YKDAK3nnURqivGN0evtaS+Yj4M6b6NUV+ptJlMTOQ="
            }),
        );
        assert!(signals.lock().is_empty());
        assert!(!registry.device("1000abcdef").unwrap().local);
    }

    #[tokio::test]
    async fn plaintext_from_known_device_clears_devicekey() {
        let registry = registry(Mode::Auto);
        let mut device = record("1000abcdef", 1, json!({}));
        device.devicekey = Some(DEVICEKEY.into());
        registry.setup_devices(vec![device]);

        announce(
            &registry,
            json!({"deviceid": "1000abcdef", "host": "192.168.1.20", "params": {"switch": "on", "sledOnline": "off"}}),
        );
        let device = registry.device("1000abcdef").unwrap();
        assert_eq!(device.devicekey, None);
        assert_eq!(device.params["sledOnline"], "off");
    }

    #[tokio::test]
    async fn diy_device_is_adopted_on_first_announcement() {
        let registry = registry(Mode::Local);
        let entities = capture(&registry, SIGNAL_ADD_ENTITIES);
        let signals = capture(&registry, "1000000001");

        announce(
            &registry,
            json!({
                "deviceid": "1000000001",
                "host": "192.168.1.30",
                "localtype": "diy_plug",
                "sequence": "1",
                "params": {"switch": "on", "startup": "off"}
            }),
        );

        let device = registry.device("1000000001").unwrap();
        assert_eq!(device.uiid(), 1);
        assert_eq!(device.online, Some(false));
        assert!(device.local);
        assert_eq!(entities.lock().len(), 1);
        assert_eq!(entities.lock()[0][0]["kind"], "switch");
        assert_eq!(signals.lock().len(), 1);
    }

    #[tokio::test]
    async fn unknown_encrypted_device_needs_configured_key() {
        let encrypted = json!({
            "deviceid": "1000abcdef",
            "host": "192.168.1.20",
            "localtype": "plug",
            "encrypt": true,
            "iv": "3PgYPjEuE4qCoZOTsPE2xg==",
            "data": "t9YKDAK3nnURqivGN0evtaS+Yj4M6b6NUV+ptJlMTOQ="
        });

        let registry = registry(Mode::Local);
        announce(&registry, encrypted.clone());
        assert!(registry.device("1000abcdef").is_none());
        assert!(registry.inner.unknown.lock().contains_key("1000abcdef"));

        let mut devices = HashMap::new();
        devices.insert(
            "1000abcdef".to_string(),
            DeviceConfig {
                devicekey: Some(DEVICEKEY.into()),
                ..Default::default()
            },
        );
        let registry = Registry::new(Config {
            mode: Mode::Local,
            devices,
            ..Default::default()
        });
        announce(&registry, encrypted);
        let device = registry.device("1000abcdef").unwrap();
        assert_eq!(device.params["switch"], "on");
        assert_eq!(device.devicekey.as_deref(), Some(DEVICEKEY));
    }

    #[tokio::test]
    async fn duplicate_sequence_across_transports_is_dropped() {
        let registry = registry(Mode::Auto);
        registry.setup_devices(vec![record("1000abcdef", 1, json!({}))]);
        let signals = capture(&registry, "1000abcdef");

        announce(
            &registry,
            json!({"deviceid": "1000abcdef", "host": "192.168.1.20", "sequence": "1700000000000", "params": {"switch": "on"}}),
        );
        registry.cloud().dispatcher().send(
            SIGNAL_UPDATE,
            &json!({"action": "update", "deviceid": "1000abcdef", "sequence": "1700000000000", "params": {"switch": "on"}}),
        );
        assert_eq!(signals.lock().len(), 1);
    }

    #[tokio::test]
    async fn cloud_update_filters_and_tracks_online() {
        let registry = registry(Mode::Cloud);
        let mut foreign = record("1000foreig", 1, json!({}));
        foreign.online = None;
        let mut offline = record("1000abcdef", 1, json!({}));
        offline.online = Some(false);
        registry.setup_devices(vec![foreign, offline]);
        let foreign_signals = capture(&registry, "1000foreig");
        let signals = capture(&registry, "1000abcdef");

        let cloud = registry.cloud().dispatcher();
        cloud.send(SIGNAL_UPDATE, &json!({"deviceid": "1000foreig", "params": {"switch": "on"}}));
        cloud.send(SIGNAL_UPDATE, &json!({"deviceid": "1000nobody", "params": {"switch": "on"}}));
        assert!(foreign_signals.lock().is_empty());

        cloud.send(SIGNAL_UPDATE, &json!({"deviceid": "1000abcdef", "params": {"switch": "on"}}));
        assert_eq!(registry.device("1000abcdef").unwrap().online, Some(true));

        cloud.send(SIGNAL_UPDATE, &json!({"deviceid": "1000abcdef", "params": {"online": false}}));
        assert_eq!(registry.device("1000abcdef").unwrap().online, Some(false));
        assert_eq!(signals.lock().len(), 2);
    }

    #[tokio::test]
    async fn sub_device_events_route_to_child_then_hub() {
        let registry = registry(Mode::Local);
        registry.setup_devices(vec![
            record("1000hub001", 66, json!({})),
            record("a480000001", 1770, json!({"parentid": "1000hub001"})),
        ]);
        let hub = capture(&registry, "1000hub001");
        let child = capture(&registry, "a480000001");
        assert!(!registry.is_local("a480000001"));

        announce(
            &registry,
            json!({"deviceid": "1000hub001", "host": "192.168.1.40", "params": {"subDevId": "a480000001", "temperature": 2150}}),
        );

        assert_eq!(*child.lock(), vec![json!({"temperature": 2150})]);
        assert_eq!(*hub.lock(), vec![json!({})]);
        assert!(registry.is_local("a480000001"));
        assert_eq!(registry.device("a480000001").unwrap().params["temperature"], 2150);
    }

    #[tokio::test]
    async fn availability_follows_both_transports() {
        let registry = registry(Mode::Auto);
        registry.setup_devices(vec![record("1000abcdef", 1, json!({}))]);
        assert!(!registry.is_available("1000abcdef"));

        registry.cloud().set_online(Some(true));
        assert!(registry.is_available("1000abcdef"));
        registry.cloud().set_online(Some(false));

        announce(
            &registry,
            json!({"deviceid": "1000abcdef", "host": "192.168.1.20", "params": {}}),
        );
        assert!(!registry.is_available("1000abcdef"));
        registry.local().set_online(true);
        assert!(registry.is_available("1000abcdef"));
        assert!(!registry.is_available("1000nobody"));
    }

    #[tokio::test]
    async fn sub_device_behind_local_hub_is_available() {
        let registry = registry(Mode::Local);
        let mut hub = record("1000hub001", 66, json!({}));
        hub.online = Some(false);
        let mut child = record("a480000001", 1770, json!({"parentid": "1000hub001"}));
        child.online = Some(false);
        registry.setup_devices(vec![hub, child]);
        registry.local().set_online(true);
        assert!(!registry.is_available("a480000001"));

        announce(
            &registry,
            json!({"deviceid": "1000hub001", "host": "192.168.1.40", "params": {}}),
        );
        // the child never gets a host of its own
        assert!(registry.device("a480000001").unwrap().host.is_none());
        assert!(registry.is_available("a480000001"));

        registry.local().set_online(false);
        assert!(!registry.is_available("a480000001"));
    }

    #[tokio::test]
    async fn connected_fans_out_empty_events() {
        let registry = registry(Mode::Auto);
        registry.setup_devices(vec![record("1000abcdef", 1, json!({}))]);
        let signals = capture(&registry, "1000abcdef");
        registry.local().set_online(true);
        assert_eq!(*signals.lock(), vec![json!({})]);
    }

    #[tokio::test]
    async fn send_without_any_transport_returns_none() {
        let registry = registry(Mode::Auto);
        registry.setup_devices(vec![record("1000abcdef", 1, json!({}))]);
        let outcome = registry
            .send("1000abcdef", SendRequest::new(as_map(json!({"switch": "on"}))))
            .await;
        assert_eq!(outcome, None);
        assert_eq!(registry.send("1000nobody", SendRequest::query()).await, None);
    }

    #[tokio::test]
    async fn lan_first_with_cloud_fallback() {
        init_logger();
        let lan = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/zeroconf/switch"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({"error": 0}))
                    .set_delay(Duration::from_secs(2)),
            )
            .mount(&lan)
            .await;

        let registry = registry(Mode::Auto);
        registry.setup_devices(vec![record("1000abcdef", 1, json!({}))]);
        announce(
            &registry,
            json!({"deviceid": "1000abcdef", "host": lan.address().to_string(), "params": {"switch": "off"}}),
        );
        registry.local().set_online(true);
        let (mut fake, _api) = connect_cloud(&registry).await;

        let outcome = registry
            .send("1000abcdef", SendRequest::new(as_map(json!({"switch": "on"}))))
            .await;
        assert_eq!(outcome, Some(Outcome::Online));

        assert_eq!(lan.received_requests().await.unwrap().len(), 1);
        let update = fake.frames.recv().await.unwrap();
        assert_eq!(update["action"], "update");
        assert_eq!(update["params"], json!({"switch": "on"}));
        let query = timeout(Duration::from_secs(2), fake.frames.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(query["action"], "query");
        assert_eq!(query["params"], json!([]));

        registry.stop().await;
    }

    #[tokio::test]
    async fn dual_r3_cover_commands_go_over_lan() {
        let lan = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/zeroconf/motorTurn"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"error": 0})))
            .expect(1)
            .mount(&lan)
            .await;

        let registry = registry(Mode::Local);
        let mut device = record("1000abcdef", 126, json!({"workMode": 2}));
        device.online = Some(false);
        let stubs = registry.setup_devices(vec![device]);
        assert_eq!(stubs.len(), 1);

        announce(
            &registry,
            json!({"deviceid": "1000abcdef", "host": lan.address().to_string(), "params": {"workMode": 2}}),
        );
        registry.local().set_online(true);

        let outcome = registry
            .send("1000abcdef", SendRequest::new(as_map(json!({"motorTurn": 1}))))
            .await;
        assert_eq!(outcome, Some(Outcome::Online));
    }

    #[tokio::test]
    async fn sub_device_lan_params_carry_sub_dev_id() {
        let lan = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/zeroconf/switch"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"error": 0})))
            .mount(&lan)
            .await;

        let registry = registry(Mode::Local);
        registry.setup_devices(vec![
            record("1000hub001", 66, json!({})),
            record("a480000001", 1256, json!({"parentid": "1000hub001"})),
        ]);
        announce(
            &registry,
            json!({"deviceid": "1000hub001", "host": lan.address().to_string(), "params": {}}),
        );
        registry.local().set_online(true);

        let outcome = registry
            .send("a480000001", SendRequest::new(as_map(json!({"switch": "on"}))))
            .await;
        assert_eq!(outcome, Some(Outcome::Online));

        let requests = lan.received_requests().await.unwrap();
        let body: Value = serde_json::from_slice(&requests[0].body).unwrap();
        assert_eq!(body["deviceid"], "1000hub001");
        assert_eq!(body["data"], json!({"switch": "on", "subDevId": "a480000001"}));
    }

    #[tokio::test]
    async fn concurrent_bulk_writes_share_one_send() {
        let lan = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/zeroconf/switches"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"error": 0})))
            .expect(1)
            .mount(&lan)
            .await;

        let registry = registry(Mode::Local);
        registry.setup_devices(vec![record("1000abcdef", 4, json!({}))]);
        announce(
            &registry,
            json!({"deviceid": "1000abcdef", "host": lan.address().to_string(), "params": {}}),
        );
        registry.local().set_online(true);

        let write = |outlet: i64, state: &str| {
            as_map(json!({"switches": [{"outlet": outlet, "switch": state}]}))
        };
        let (a, b, c) = tokio::join!(
            registry.send_bulk("1000abcdef", write(0, "on")),
            registry.send_bulk("1000abcdef", write(1, "on")),
            registry.send_bulk("1000abcdef", write(0, "off")),
        );
        assert_eq!(a, Some(Outcome::Online));
        assert_eq!((b, c), (None, None));

        let requests = lan.received_requests().await.unwrap();
        assert_eq!(requests.len(), 1);
        let body: Value = serde_json::from_slice(&requests[0].body).unwrap();
        assert_eq!(
            body["data"]["switches"],
            json!([{"outlet": 0, "switch": "off"}, {"outlet": 1, "switch": "on"}])
        );
        assert!(registry.device("1000abcdef").unwrap().params_bulk.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn expired_device_is_probed_three_times_then_marked_offline() {
        let registry = registry(Mode::Local);
        registry.setup_devices(vec![record("1000abcdef", 1, json!({}))]);
        // an unusable host fails every probe without touching the network
        announce(
            &registry,
            json!({"deviceid": "1000abcdef", "host": "bad host", "params": {}}),
        );
        registry.local().set_online(true);
        let signals = capture(&registry, "1000abcdef");

        registry.with_device_mut("1000abcdef", |d| {
            d.local_ts = Some(Instant::now() - Duration::from_secs(1));
        });
        registry.maintenance_tick().await;

        let started = Instant::now();
        sleep(Duration::from_secs(9)).await;
        assert!(registry.device("1000abcdef").unwrap().local);
        sleep(Duration::from_secs(2)).await;
        assert!(started.elapsed() >= Duration::from_secs(10));
        assert!(!registry.device("1000abcdef").unwrap().local);
        assert_eq!(*signals.lock(), vec![json!({})]);
        assert!(!registry.is_available("1000abcdef"));

        // the next announcement brings it back
        announce(
            &registry,
            json!({"deviceid": "1000abcdef", "host": "192.168.1.20", "params": {"switch": "on"}}),
        );
        let device = registry.device("1000abcdef").unwrap();
        assert!(device.local);
        assert!(!device.local_expired(Instant::now()));
    }

    #[tokio::test(start_paused = true)]
    async fn overlapping_offline_checks_run_once() {
        let registry = registry(Mode::Local);
        registry.setup_devices(vec![record("1000abcdef", 1, json!({}))]);
        announce(
            &registry,
            json!({"deviceid": "1000abcdef", "host": "bad host", "params": {}}),
        );
        registry.local().set_online(true);
        let signals = capture(&registry, "1000abcdef");
        registry.with_device_mut("1000abcdef", |d| {
            d.local_ts = Some(Instant::now() - Duration::from_secs(1));
        });

        registry.maintenance_tick().await;
        registry.maintenance_tick().await;
        registry.spawn_check_offline("1000abcdef");

        sleep(Duration::from_secs(11)).await;
        assert!(!registry.device("1000abcdef").unwrap().local);
        assert_eq!(*signals.lock(), vec![json!({})]);
        assert!(registry.inner.checking.lock().is_empty());

        // a later check is allowed again
        registry.check_offline("1000abcdef").await;
        assert_eq!(signals.lock().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn long_lost_device_gets_a_single_probe() {
        let registry = registry(Mode::Local);
        registry.setup_devices(vec![record("1000abcdef", 1, json!({}))]);
        announce(
            &registry,
            json!({"deviceid": "1000abcdef", "host": "bad host", "params": {}}),
        );
        registry.local().set_online(true);
        registry.with_device_mut("1000abcdef", |d| {
            d.local_ts = Some(Instant::now() - Duration::from_secs(130));
        });

        let started = Instant::now();
        registry.check_offline("1000abcdef").await;
        assert!(started.elapsed() < PROBE_SPACING);
        assert!(!registry.device("1000abcdef").unwrap().local);
    }

    #[tokio::test]
    async fn maintenance_asks_meters_for_ui_active() {
        let registry = registry(Mode::Cloud);
        let mut offline = record("1000pow002", 32, json!({}));
        offline.online = Some(false);
        registry.setup_devices(vec![
            record("1000pow001", 5, json!({})),
            record("1000powr30", 190, json!({})),
            record("1000dualr3", 126, json!({"workMode": 1})),
            record("1000plain1", 1, json!({})),
            offline,
        ]);
        let (mut fake, _api) = connect_cloud(&registry).await;

        registry.maintenance_tick().await;

        let mut sent = HashMap::new();
        for _ in 0..3 {
            let frame = timeout(Duration::from_secs(5), fake.frames.recv())
                .await
                .unwrap()
                .unwrap();
            assert_eq!(frame["action"], "update");
            sent.insert(frame["deviceid"].as_str().unwrap().to_string(), frame["params"].clone());
        }
        assert_eq!(sent["1000pow001"], json!({"uiActive": 60}));
        assert_eq!(sent["1000powr30"], json!({"uiActive": 60}));
        // no LAN, so the cloud variant
        assert_eq!(sent["1000dualr3"], json!({"uiActive": {"all": 1, "time": 60}}));
        assert!(
            timeout(Duration::from_millis(500), fake.frames.recv())
                .await
                .is_err()
        );

        registry.stop().await;
    }

    #[tokio::test]
    async fn dual_r3_statistics_are_polled_over_lan() {
        let lan = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/zeroconf/statistics"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"error": 0})))
            .expect(1)
            .mount(&lan)
            .await;

        let registry = registry(Mode::Local);
        registry.setup_devices(vec![record("1000dualr3", 126, json!({"workMode": 1}))]);
        announce(
            &registry,
            json!({"deviceid": "1000dualr3", "host": lan.address().to_string(), "params": {}}),
        );
        registry.local().set_online(true);

        registry.maintenance_tick().await;

        let requests = lan.received_requests().await.unwrap();
        assert_eq!(requests.len(), 1);
        let body: Value = serde_json::from_slice(&requests[0].body).unwrap();
        assert_eq!(body["deviceid"], "1000dualr3");
    }

    #[tokio::test]
    async fn spm_outlets_are_polled_five_seconds_apart() {
        let registry = registry(Mode::Cloud);
        registry.setup_devices(vec![record("1000spm001", 130, json!({}))]);
        let (mut fake, _api) = connect_cloud(&registry).await;

        // the session is up, the outlet spacing can run on virtual time
        tokio::time::pause();
        let started = Instant::now();
        registry.maintenance_tick().await;

        for outlet in 0..4 {
            let frame = fake.frames.recv().await.unwrap();
            assert_eq!(frame["deviceid"], "1000spm001");
            assert_eq!(frame["params"], json!({"uiActive": {"outlet": outlet, "time": 60}}));
        }
        assert!(started.elapsed() >= OUTLET_SPACING * 3);

        registry.stop().await;
    }

    #[tokio::test]
    async fn removed_service_does_not_mark_device_local() {
        let registry = registry(Mode::Local);
        registry.setup_devices(vec![record("1000abcdef", 1, json!({}))]);
        let signals = capture(&registry, "1000abcdef");

        registry.local().handle_removed("eWeLink_1000abcdef._ewelink._tcp.local.");
        let device = registry.device("1000abcdef").unwrap();
        assert!(!device.local);
        assert!(device.host.is_none());
        assert!(signals.lock().is_empty());
    }

    #[tokio::test]
    async fn local_mode_starts_from_cache() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("devices.json");
        cache::save_devices(&path, &[record("1000abcdef", 1, json!({"switch": "on"}))]).unwrap();

        let registry = Registry::new(Config {
            mode: Mode::Local,
            cache_path: Some(path),
            ..Default::default()
        });
        let devices = registry.load_inventory().await.unwrap();
        assert_eq!(devices.len(), 1);
        assert_eq!(devices[0].params["switch"], "on");
    }

    #[tokio::test]
    async fn stop_forgets_devices() {
        let registry = registry(Mode::Auto);
        registry.setup_devices(vec![record("1000abcdef", 1, json!({}))]);
        capture(&registry, "1000abcdef");
        registry.stop().await;
        assert!(registry.devices().is_empty());
        assert!(!registry.dispatcher().has_handlers("1000abcdef"));
        assert!(!registry.is_available("1000abcdef"));
    }
}
