//! Cloud transport.
//! Signed REST login and inventory, the dispatch WebSocket with its
//! `userOnline` handshake, sequence-keyed response correlation and
//! reconnect backoff.

use crate::device::XDevice;
use crate::dispatcher::Dispatcher;
use crate::error::{ERR_AUTH, ERR_REGION, EwelinkError, Result, get_error_message};
use crate::protocol::{
    self, ACTION_QUERY, ACTION_REPORT_SUB_DEVICE, ACTION_SYSMSG, ACTION_UPDATE,
    ACTION_USER_ONLINE, KEY_ACTION, KEY_CONFIG, KEY_ERROR, KEY_PARAMS, KEY_SEQUENCE, Outcome,
    SIGNAL_CONNECTED, SIGNAL_UPDATE, USER_AGENT, WS_PROTOCOL_VERSION,
};
use base64::{Engine as _, engine::general_purpose};
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use hmac::{Hmac, Mac};
use log::{debug, info, warn};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use sha2::Sha256;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio::sync::oneshot;
use tokio::time::{Duration, Instant, sleep, timeout};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;

/// Built-in (appid, appsecret) pairs. The second one is required for token reuse.
pub const APP: [(&str, &str); 2] = [
    (
        "4s1FXKC9FaGfoqXhmXSJneb3qcm1gOak",
        "oKvCM06gvwkRbfetd6qWRrbC3rFrbIpV",
    ),
    (
        "R8Oq3y0eSZSYdKccHlrQzT1ACCOUT9Gv",
        "1ve5Qk9GXfUhKAn1svnKwpAlxXkMarru",
    ),
];

/// Reconnect delays in seconds, advanced per consecutive failure.
const BACKOFF: [u64; 5] = [15, 60, 300, 900, 3600];
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(90);
/// Minimum spacing between outbound frames; the cloud drops faster clients.
const RATE_LIMIT: Duration = Duration::from_millis(100);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsStream, Message>;
type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Region {
    Cn,
    As,
    Us,
    #[default]
    Eu,
}

impl Region {
    pub fn as_str(self) -> &'static str {
        match self {
            Region::Cn => "cn",
            Region::As => "as",
            Region::Us => "us",
            Region::Eu => "eu",
        }
    }

    /// REST API base URL.
    pub fn api_host(self) -> &'static str {
        match self {
            Region::Cn => "https://cn-apia.coolkit.cn",
            Region::As => "https://as-apia.coolkit.cc",
            Region::Us => "https://us-apia.coolkit.cc",
            Region::Eu => "https://eu-apia.coolkit.cc",
        }
    }

    /// Dispatcher base URL that hands out WebSocket servers.
    pub fn dispatch_host(self) -> &'static str {
        match self {
            Region::Cn => "https://cn-dispa.coolkit.cn",
            Region::As => "https://as-dispa.coolkit.cc",
            Region::Us => "https://us-dispa.coolkit.cc",
            Region::Eu => "https://eu-dispa.coolkit.cc",
        }
    }
}

impl FromStr for Region {
    type Err = EwelinkError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "cn" => Ok(Region::Cn),
            "as" => Ok(Region::As),
            "us" => Ok(Region::Us),
            "eu" => Ok(Region::Eu),
            _ => Err(EwelinkError::Config(format!("Unknown region '{}'", s))),
        }
    }
}

impl fmt::Display for Region {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Session obtained from a successful login.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Auth {
    /// Access token.
    pub at: String,
    /// The user's own apikey.
    pub apikey: String,
    pub appid: String,
    pub region: Region,
}

/// Signature for the login request: base64 HMAC-SHA256 of the exact body bytes.
pub fn sign(secret: &str, body: &[u8]) -> Result<String> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|_| EwelinkError::EncryptionFailed)?;
    mac.update(body);
    Ok(general_purpose::STANDARD.encode(mac.finalize().into_bytes()))
}

/// Delay before the next connect attempt after `failures` consecutive failures.
pub fn backoff_delay(failures: usize) -> Duration {
    Duration::from_secs(BACKOFF[failures.min(BACKOFF.len() - 1)])
}

/// Overrides for the regional hosts.
#[derive(Debug, Clone)]
struct Endpoints {
    api: Option<String>,
    dispatch: Option<String>,
    ws_scheme: &'static str,
}

impl Default for Endpoints {
    fn default() -> Self {
        Self {
            api: None,
            dispatch: None,
            ws_scheme: "wss",
        }
    }
}

struct Credentials {
    username: String,
    password: String,
    app: usize,
}

struct CloudState {
    region: Region,
    country_code: String,
    auth: Option<Auth>,
    credentials: Option<Credentials>,
    /// `None` until the first connect attempt settles.
    online: Option<bool>,
    endpoints: Endpoints,
    /// Reconnect delays, indexed by consecutive failures; the last repeats.
    backoff: Vec<Duration>,
}

#[derive(Default)]
struct Writer {
    sink: Option<WsSink>,
    last_send: Option<Instant>,
}

/// CloudClient talks to the eWeLink cloud on behalf of one user.
///
/// It publishes `connected` (payload: `true`, `false` or `null`) and
/// `update` (a device message with `deviceid` and `params`) on its own
/// [`Dispatcher`].
#[derive(Clone)]
pub struct CloudClient {
    inner: Arc<CloudInner>,
}

struct CloudInner {
    dispatcher: Dispatcher,
    http: reqwest::Client,
    state: RwLock<CloudState>,
    waiters: Mutex<HashMap<String, oneshot::Sender<Outcome>>>,
    writer: tokio::sync::Mutex<Writer>,
    cancel_token: CancellationToken,
}

impl Default for CloudClient {
    fn default() -> Self {
        Self::new(Region::default(), "+86")
    }
}

impl CloudClient {
    pub fn new(region: Region, country_code: &str) -> Self {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self {
            inner: Arc::new(CloudInner {
                dispatcher: Dispatcher::new(),
                http,
                state: RwLock::new(CloudState {
                    region,
                    country_code: country_code.to_string(),
                    auth: None,
                    credentials: None,
                    online: None,
                    endpoints: Endpoints::default(),
                    backoff: BACKOFF.iter().map(|s| Duration::from_secs(*s)).collect(),
                }),
                waiters: Mutex::new(HashMap::new()),
                writer: tokio::sync::Mutex::new(Writer::default()),
                cancel_token: CancellationToken::new(),
            }),
        }
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.inner.dispatcher
    }

    pub fn region(&self) -> Region {
        self.with_state(|s| s.region)
    }

    pub fn auth(&self) -> Option<Auth> {
        self.with_state(|s| s.auth.clone())
    }

    pub fn is_auth(&self) -> bool {
        self.with_state(|s| s.auth.is_some())
    }

    /// `Some(true)` while the WebSocket session is up.
    pub fn online(&self) -> Option<bool> {
        self.with_state(|s| s.online)
    }

    pub(crate) fn set_auth(&self, auth: Auth) {
        self.with_state_mut(|s| {
            s.region = auth.region;
            s.auth = Some(auth);
        });
    }

    /// Points the client at other hosts than the regional ones.
    pub(crate) fn set_endpoints(&self, api: Option<String>, dispatch: Option<String>, secure: bool) {
        self.with_state_mut(|s| {
            s.endpoints = Endpoints {
                api,
                dispatch,
                ws_scheme: if secure { "wss" } else { "ws" },
            }
        });
    }

    /// Replaces the reconnect delays.
    pub(crate) fn set_backoff(&self, schedule: Vec<Duration>) {
        self.with_state_mut(|s| s.backoff = schedule);
    }

    fn retry_delay(&self, failures: usize) -> Duration {
        self.with_state(|s| s.backoff.get(failures).or(s.backoff.last()).copied())
            .unwrap_or_else(|| backoff_delay(failures))
    }

    fn with_state<R>(&self, f: impl FnOnce(&CloudState) -> R) -> R {
        f(&self.inner.state.read())
    }

    fn with_state_mut<R>(&self, f: impl FnOnce(&mut CloudState) -> R) -> R {
        f(&mut self.inner.state.write())
    }

    fn api_base(&self) -> String {
        self.with_state(|s| {
            s.endpoints
                .api
                .clone()
                .unwrap_or_else(|| s.region.api_host().to_string())
        })
    }

    fn dispatch_base(&self) -> String {
        self.with_state(|s| {
            s.endpoints
                .dispatch
                .clone()
                .unwrap_or_else(|| s.region.dispatch_host().to_string())
        })
    }

    /// Publishes `connected` only when the value actually changes.
    pub(crate) fn set_online(&self, online: Option<bool>) {
        let changed = self.with_state_mut(|s| {
            if s.online == online {
                return false;
            }
            s.online = online;
            true
        });
        if changed {
            info!("Cloud connection {}", match online {
                Some(true) => "online",
                Some(false) => "offline",
                None => "reset",
            });
            self.inner
                .dispatcher
                .send(SIGNAL_CONNECTED, &json!(online));
        }
    }

    // -------------------------------------------------------------------------
    // REST
    // -------------------------------------------------------------------------

    /// Logs in with email or phone number and password, or reuses a token when
    /// `username` is `token` and `password` is `<region>:<token>`.
    pub async fn login(&self, username: &str, password: &str, app: usize) -> Result<Auth> {
        if username == "token" {
            return self.login_token(password).await;
        }

        let mut payload = Map::new();
        payload.insert("password".into(), json!(password));
        payload.insert("countryCode".into(), json!(self.with_state(|s| s.country_code.clone())));
        if username.contains('@') {
            payload.insert("email".into(), json!(username));
        } else if username.starts_with('+') {
            payload.insert("phoneNumber".into(), json!(username));
        } else {
            payload.insert("phoneNumber".into(), json!(format!("+{}", username)));
        }
        let body = serde_json::to_vec(&payload)?;
        let (appid, secret) = APP.get(app).copied().unwrap_or(APP[0]);
        let signature = sign(secret, &body)?;

        let mut redirected = false;
        loop {
            let url = format!("{}/v2/user/login", self.api_base());
            let resp: Value = self
                .inner
                .http
                .post(&url)
                .header("Authorization", format!("Sign {}", signature))
                .header("Content-Type", "application/json")
                .header("X-CK-Appid", appid)
                .body(body.clone())
                .send()
                .await?
                .json()
                .await?;

            let code = resp.get(KEY_ERROR).and_then(Value::as_i64).unwrap_or(0);
            if code == ERR_REGION && !redirected {
                let region: Region = resp["data"]["region"]
                    .as_str()
                    .unwrap_or_default()
                    .parse()?;
                info!("Login redirected to region {}", region);
                self.with_state_mut(|s| s.region = region);
                redirected = true;
                continue;
            }
            if code != 0 {
                let msg = resp
                    .get("msg")
                    .and_then(Value::as_str)
                    .unwrap_or(get_error_message(code));
                return Err(EwelinkError::Auth(msg.to_string()));
            }

            let data = &resp["data"];
            let auth = Auth {
                at: data["at"].as_str().unwrap_or_default().to_string(),
                apikey: data["user"]["apikey"].as_str().unwrap_or_default().to_string(),
                appid: appid.to_string(),
                region: self.region(),
            };
            if auth.at.is_empty() || auth.apikey.is_empty() {
                return Err(EwelinkError::Auth("Login reply without token".into()));
            }
            info!("Logged in to region {}", auth.region);
            self.with_state_mut(|s| {
                s.auth = Some(auth.clone());
                s.credentials = Some(Credentials {
                    username: username.to_string(),
                    password: password.to_string(),
                    app,
                });
            });
            return Ok(auth);
        }
    }

    async fn login_token(&self, value: &str) -> Result<Auth> {
        let (region, token) = value
            .split_once(':')
            .ok_or_else(|| EwelinkError::Auth("Token must be <region>:<token>".into()))?;
        let region: Region = region.parse()?;
        let (appid, _) = APP[1];
        self.set_auth(Auth {
            at: token.to_string(),
            apikey: String::new(),
            appid: appid.to_string(),
            region,
        });

        let data = match self.get("/v2/user/profile", &[]).await {
            Ok(data) => data,
            Err(e) => {
                self.with_state_mut(|s| s.auth = None);
                return Err(EwelinkError::Auth(e.to_string()));
            }
        };
        let apikey = data["user"]["apikey"].as_str().unwrap_or_default().to_string();
        let auth = Auth {
            at: token.to_string(),
            apikey,
            appid: appid.to_string(),
            region,
        };
        self.set_auth(auth.clone());
        Ok(auth)
    }

    /// Authenticated GET; returns the reply's `data` on `error == 0`.
    async fn get(&self, path: &str, query: &[(&str, String)]) -> Result<Value> {
        let auth = self
            .auth()
            .ok_or_else(|| EwelinkError::Auth("Not logged in".into()))?;
        let url = format!("{}{}", self.api_base(), path);
        let mut resp: Value = self
            .inner
            .http
            .get(&url)
            .query(query)
            .bearer_auth(&auth.at)
            .header("X-CK-Appid", &auth.appid)
            .send()
            .await?
            .json()
            .await?;

        let code = resp.get(KEY_ERROR).and_then(Value::as_i64).unwrap_or(0);
        if code != 0 {
            return Err(EwelinkError::cloud(
                code,
                resp.get("msg").and_then(Value::as_str),
            ));
        }
        Ok(resp.get_mut("data").map(Value::take).unwrap_or(Value::Null))
    }

    /// Family id -> family name.
    pub async fn homes(&self) -> Result<HashMap<String, String>> {
        let data = self.get("/v2/family", &[]).await?;
        let homes = data["familyList"]
            .as_array()
            .map(|list| {
                list.iter()
                    .filter_map(|home| {
                        let id = home["id"].as_str()?;
                        let name = home["name"].as_str().unwrap_or_default();
                        Some((id.to_string(), name.to_string()))
                    })
                    .collect()
            })
            .unwrap_or_default();
        Ok(homes)
    }

    /// Loads the device inventory of the given homes, or the unscoped one
    /// when `homes` is empty. Groups are skipped.
    pub async fn get_devices(&self, homes: &[String]) -> Result<Vec<XDevice>> {
        let scopes: Vec<Option<&String>> = if homes.is_empty() {
            vec![None]
        } else {
            homes.iter().map(Some).collect()
        };

        let mut seen = HashSet::new();
        let mut devices = Vec::new();
        for scope in scopes {
            let mut query = vec![("num", "0".to_string())];
            if let Some(home) = scope {
                query.push(("familyid", home.clone()));
            }
            let data = self.get("/v2/device/thing", &query).await?;
            let Some(things) = data["thingList"].as_array() else {
                continue;
            };
            for thing in things {
                // 1 own, 2 shared, 3 group, 5 shared by home
                if thing["itemType"].as_i64() == Some(3) {
                    continue;
                }
                match serde_json::from_value::<XDevice>(thing["itemData"].clone()) {
                    Ok(device) => {
                        if seen.insert(device.deviceid.clone()) {
                            devices.push(device);
                        }
                    }
                    Err(e) => warn!("Skipping malformed inventory item: {}", e),
                }
            }
        }
        info!("{} devices loaded from Cloud", devices.len());
        Ok(devices)
    }

    // -------------------------------------------------------------------------
    // WebSocket
    // -------------------------------------------------------------------------

    /// Spawns the background connection task.
    pub fn start(&self) {
        let client = self.clone();
        tokio::spawn(async move { client.run_forever().await });
    }

    /// Cancels the connection task and closes the WebSocket.
    pub async fn stop(&self) {
        self.inner.cancel_token.cancel();
        if let Some(mut sink) = self.inner.writer.lock().await.sink.take() {
            let _ = sink.close().await;
        }
        self.set_online(None);
    }

    async fn run_forever(self) {
        let mut failures = 0usize;
        let token = self.inner.cancel_token.clone();

        while !token.is_cancelled() {
            let ws = tokio::select! {
                _ = token.cancelled() => break,
                res = self.connect() => res,
            };
            match ws {
                Ok(ws) => {
                    failures = 0;
                    self.set_online(Some(true));
                    self.serve(ws).await;
                    if !token.is_cancelled() {
                        self.set_online(Some(false));
                    }
                }
                Err(e) => {
                    if e.code() == ERR_AUTH {
                        self.relogin().await;
                    }
                    self.set_online(Some(false));
                    let delay = self.retry_delay(failures);
                    failures = failures.saturating_add(1);
                    warn!(
                        "Cloud connection failed: {}; retrying in {:?}",
                        e, delay
                    );
                    tokio::select! {
                        _ = token.cancelled() => break,
                        _ = sleep(delay) => {}
                    }
                }
            }
        }
        debug!("Cloud connection task exited");
    }

    async fn relogin(&self) {
        let creds = self.with_state(|s| {
            s.credentials
                .as_ref()
                .map(|c| (c.username.clone(), c.password.clone(), c.app))
        });
        let Some((username, password, app)) = creds else {
            return;
        };
        info!("Cloud token expired, logging in again");
        if let Err(e) = self.login(&username, &password, app).await {
            warn!("Cloud re-login failed: {}", e);
        }
    }

    /// Resolves a WebSocket server, connects and performs the handshake.
    async fn connect(&self) -> Result<WsStream> {
        let auth = self
            .auth()
            .ok_or_else(|| EwelinkError::Auth("Not logged in".into()))?;

        let url = format!("{}/dispatch/app", self.dispatch_base());
        let resp: Value = self
            .inner
            .http
            .get(&url)
            .bearer_auth(&auth.at)
            .header("X-CK-Appid", &auth.appid)
            .send()
            .await?
            .json()
            .await?;
        let domain = resp["domain"]
            .as_str()
            .ok_or_else(|| EwelinkError::InvalidPayload("dispatch reply without domain".into()))?;
        let port = resp["port"].as_u64().unwrap_or(443);
        let scheme = self.with_state(|s| s.endpoints.ws_scheme);
        let ws_url = format!("{}://{}:{}/api/ws", scheme, domain, port);

        debug!("Connecting to {}", ws_url);
        let (mut ws, _) = tokio_tungstenite::connect_async(ws_url.as_str()).await?;

        let ts = protocol::now_ms() / 1000;
        let handshake = json!({
            KEY_ACTION: ACTION_USER_ONLINE,
            "at": auth.at,
            "apikey": auth.apikey,
            "appid": auth.appid,
            "nonce": (ts / 100).to_string(),
            "ts": ts,
            "userAgent": USER_AGENT,
            KEY_SEQUENCE: protocol::sequence(),
            "version": WS_PROTOCOL_VERSION,
        });
        ws.send(Message::text(handshake.to_string())).await?;

        let reply = timeout(HANDSHAKE_TIMEOUT, ws.next())
            .await
            .map_err(|_| EwelinkError::Timeout)?;
        let reply: Value = match reply {
            Some(Ok(Message::Text(text))) => serde_json::from_str(text.as_str())?,
            Some(Ok(other)) => {
                return Err(EwelinkError::InvalidPayload(format!(
                    "unexpected handshake reply: {:?}",
                    other
                )));
            }
            Some(Err(e)) => return Err(e.into()),
            None => return Err(EwelinkError::Offline),
        };
        let code = reply.get(KEY_ERROR).and_then(Value::as_i64).unwrap_or(0);
        if code != 0 {
            return Err(EwelinkError::cloud(code, None));
        }
        info!("Cloud WebSocket connected to {}", domain);
        Ok(ws)
    }

    /// Pumps one WebSocket session until it closes or the client stops.
    async fn serve(&self, ws: WsStream) {
        let (sink, mut stream) = ws.split();
        self.inner.writer.lock().await.sink = Some(sink);

        let mut heartbeat =
            tokio::time::interval_at(Instant::now() + HEARTBEAT_INTERVAL, HEARTBEAT_INTERVAL);
        heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let token = self.inner.cancel_token.clone();

        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = heartbeat.tick() => {
                    let mut writer = self.inner.writer.lock().await;
                    let ping = match writer.sink.as_mut() {
                        Some(sink) => sink.send(Message::Ping(Default::default())).await,
                        None => break,
                    };
                    if let Err(e) = ping {
                        debug!("Cloud heartbeat failed: {}", e);
                        break;
                    }
                }
                msg = stream.next() => match msg {
                    Some(Ok(Message::Text(text))) => {
                        // one task per message so a slow handler cannot stall the reader
                        let client = self.clone();
                        let text = text.as_str().to_string();
                        tokio::spawn(async move { client.process_message(&text) });
                    }
                    Some(Ok(Message::Close(frame))) => {
                        debug!("Cloud WebSocket closed: {:?}", frame);
                        break;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        warn!("Cloud WebSocket error: {}", e);
                        break;
                    }
                    None => break,
                },
            }
        }

        self.inner.writer.lock().await.sink = None;
    }

    /// Classifies one inbound frame: a reply to a command, a device-initiated
    /// change, or something to ignore.
    pub(crate) fn process_message(&self, text: &str) {
        let mut data: Map<String, Value> = match serde_json::from_str(text) {
            Ok(data) => data,
            Err(e) => {
                warn!("Cloud sent invalid JSON: {}", e);
                return;
            }
        };

        let action = data
            .get(KEY_ACTION)
            .and_then(Value::as_str)
            .map(str::to_string);
        match action.as_deref() {
            None => {
                if let Some(config) = data.remove(KEY_CONFIG) {
                    data.insert(KEY_PARAMS.into(), config);
                }
                if data.contains_key(KEY_PARAMS) {
                    self.publish_update(data.clone());
                }
                if let Some(seq) = data.get(KEY_SEQUENCE).and_then(Value::as_str) {
                    let outcome = Outcome::from_cloud_error(data.get(KEY_ERROR).and_then(Value::as_i64));
                    self.resolve(seq, outcome);
                }
            }
            Some(ACTION_UPDATE) | Some(ACTION_SYSMSG) => self.publish_update(data),
            Some(ACTION_REPORT_SUB_DEVICE) => {}
            Some(action) => warn!("Cloud sent unknown action '{}': {}", action, text),
        }
    }

    fn publish_update(&self, data: Map<String, Value>) {
        debug!(
            "{} <= Cloud3 | {} | {}",
            data.get("deviceid").and_then(Value::as_str).unwrap_or("?"),
            data.get(KEY_PARAMS).unwrap_or(&Value::Null),
            data.get(KEY_SEQUENCE).and_then(Value::as_str).unwrap_or("")
        );
        self.inner
            .dispatcher
            .send(SIGNAL_UPDATE, &Value::Object(data));
    }

    fn resolve(&self, seq: &str, outcome: Outcome) {
        // unknown sequences are replies nobody waits for any more
        if let Some(tx) = self.inner.waiters.lock().remove(seq) {
            let _ = tx.send(outcome);
        }
    }

    /// Sends `params` to a device, or a `query` when `params` is empty.
    ///
    /// With a zero `timeout` the write is fire-and-forget and the outcome is
    /// [`Outcome::Unknown`].
    pub async fn send(
        &self,
        device: &XDevice,
        params: Option<&Map<String, Value>>,
        timeout_dur: Duration,
    ) -> Outcome {
        let Some(auth) = self.auth() else {
            return Outcome::Offline;
        };
        let seq = protocol::sequence();
        let (action, params) = match params {
            Some(p) if !p.is_empty() => (ACTION_UPDATE, Value::Object(p.clone())),
            _ => (ACTION_QUERY, Value::Array(Vec::new())),
        };
        debug!("{} => Cloud4 | {} | {}", device.deviceid, params, seq);

        let payload = json!({
            KEY_ACTION: action,
            "apikey": device.apikey,
            "selfApikey": auth.apikey,
            "deviceid": device.deviceid,
            KEY_PARAMS: params,
            "userAgent": USER_AGENT,
            KEY_SEQUENCE: seq,
        });

        let rx = if timeout_dur.is_zero() {
            None
        } else {
            let (tx, rx) = oneshot::channel();
            self.inner.waiters.lock().insert(seq.clone(), tx);
            Some(rx)
        };

        if let Err(e) = self.write(payload.to_string()).await {
            debug!("{} => Cloud4 | write failed: {}", device.deviceid, e);
            self.inner.waiters.lock().remove(&seq);
            return Outcome::Offline;
        }

        let Some(rx) = rx else {
            return Outcome::Unknown;
        };
        let outcome = match timeout(timeout_dur, rx).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => Outcome::Offline,
            Err(_) => Outcome::Timeout,
        };
        self.inner.waiters.lock().remove(&seq);
        outcome
    }

    /// Writes one frame, keeping at least [`RATE_LIMIT`] between writes.
    async fn write(&self, text: String) -> Result<()> {
        let mut writer = self.inner.writer.lock().await;
        if writer.last_send.is_some_and(|last| last.elapsed() < RATE_LIMIT) {
            sleep(RATE_LIMIT).await;
        }
        writer.last_send = Some(Instant::now());
        let sink = writer.sink.as_mut().ok_or(EwelinkError::Offline)?;
        sink.send(Message::text(text)).await?;
        Ok(())
    }

    #[cfg(test)]
    fn pending(&self) -> usize {
        self.inner.waiters.lock().len()
    }
}
