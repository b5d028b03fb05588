//! Configuration management for the WebRTC transport
//!
//! `TransportConfig` is the serde-facing shape (TOML file or code), with
//! every default spelled out. `TransportConfig::resolve` is the one place
//! where deprecated aliases are folded and values are validated; the rest
//! of the crate only ever sees the resulting `TransportSettings`.

use crate::transport::TransportError;
use log::warn;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

/// STUN/TURN server entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct IceServerConfig {
    pub urls: Vec<String>,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub credential: Option<String>,
}

/// Where and how to POST offers and PATCH candidates
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct RequestParams {
    /// Offer endpoint URL
    pub endpoint: String,

    /// Extra HTTP headers sent with every request
    #[serde(default)]
    pub headers: BTreeMap<String, String>,

    /// Opaque payload forwarded to the endpoint alongside each offer
    #[serde(default, alias = "requestData")]
    pub request_data: Option<Value>,

    /// Per-request timeout
    #[serde(default, alias = "timeout", alias = "timeoutMs")]
    pub timeout_ms: Option<u64>,
}

impl RequestParams {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            ..Default::default()
        }
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_ms.map(Duration::from_millis)
    }
}

/// Transport configuration as written by users
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TransportConfig {
    /// Offer/answer endpoint
    #[serde(default)]
    pub webrtc_request: Option<RequestParams>,

    /// Deprecated: use `webrtc_request`
    #[serde(default)]
    pub webrtc_url: Option<String>,

    /// Deprecated: use `webrtc_request`
    #[serde(default)]
    pub connection_url: Option<String>,

    /// Bot start endpoint, used to derive the offer URL from a session id
    #[serde(default)]
    pub start_endpoint: Option<RequestParams>,

    #[serde(default)]
    pub ice_servers: Vec<IceServerConfig>,

    /// Wait for ICE gathering before sending the offer
    #[serde(default)]
    pub wait_for_ice_gathering: bool,

    #[serde(default = "default_ice_gathering_timeout_ms")]
    pub ice_gathering_timeout_ms: u64,

    /// Restrict the offered audio codec (e.g. "opus"); "default" keeps all
    #[serde(default)]
    pub audio_codec: Option<String>,

    /// Restrict the offered video codec (e.g. "VP8"); "default" keeps all
    #[serde(default)]
    pub video_codec: Option<String>,

    #[serde(default = "default_candidate_flush_delay_ms")]
    pub candidate_flush_delay_ms: u64,

    #[serde(default = "default_keepalive_interval_ms")]
    pub keepalive_interval_ms: u64,

    /// How long an ICE `disconnected` state may self-heal
    #[serde(default = "default_disconnected_grace_ms")]
    pub disconnected_grace_ms: u64,

    /// Delay before retrying after a failed negotiation
    #[serde(default = "default_reconnect_backoff_ms")]
    pub reconnect_backoff_ms: u64,

    #[serde(default = "default_max_reconnection_attempts")]
    pub max_reconnection_attempts: u32,

    #[serde(default = "default_enable_mic")]
    pub enable_mic: bool,

    #[serde(default)]
    pub enable_cam: bool,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            webrtc_request: None,
            webrtc_url: None,
            connection_url: None,
            start_endpoint: None,
            ice_servers: Vec::new(),
            wait_for_ice_gathering: false,
            ice_gathering_timeout_ms: default_ice_gathering_timeout_ms(),
            audio_codec: None,
            video_codec: None,
            candidate_flush_delay_ms: default_candidate_flush_delay_ms(),
            keepalive_interval_ms: default_keepalive_interval_ms(),
            disconnected_grace_ms: default_disconnected_grace_ms(),
            reconnect_backoff_ms: default_reconnect_backoff_ms(),
            max_reconnection_attempts: default_max_reconnection_attempts(),
            enable_mic: default_enable_mic(),
            enable_cam: false,
        }
    }
}

/// Validated transport settings with all defaults applied
#[derive(Debug, Clone, PartialEq)]
pub struct TransportSettings {
    pub request: Option<RequestParams>,
    pub start_endpoint: Option<RequestParams>,
    pub ice_servers: Vec<IceServerConfig>,
    pub wait_for_ice_gathering: bool,
    pub ice_gathering_timeout: Duration,
    pub audio_codec: Option<String>,
    pub video_codec: Option<String>,
    pub candidate_flush_delay: Duration,
    pub keepalive_interval: Duration,
    pub disconnected_grace: Duration,
    pub reconnect_backoff: Duration,
    pub max_reconnection_attempts: u32,
    pub enable_mic: bool,
    pub enable_cam: bool,
}

impl Default for TransportSettings {
    fn default() -> Self {
        Self {
            request: None,
            start_endpoint: None,
            ice_servers: Vec::new(),
            wait_for_ice_gathering: false,
            ice_gathering_timeout: Duration::from_millis(default_ice_gathering_timeout_ms()),
            audio_codec: None,
            video_codec: None,
            candidate_flush_delay: Duration::from_millis(default_candidate_flush_delay_ms()),
            keepalive_interval: Duration::from_millis(default_keepalive_interval_ms()),
            disconnected_grace: Duration::from_millis(default_disconnected_grace_ms()),
            reconnect_backoff: Duration::from_millis(default_reconnect_backoff_ms()),
            max_reconnection_attempts: default_max_reconnection_attempts(),
            enable_mic: default_enable_mic(),
            enable_cam: false,
        }
    }
}

impl TransportConfig {
    /// Fold deprecated keys, apply defaults and reject invalid values.
    pub fn resolve(self) -> Result<TransportSettings, TransportError> {
        let request = resolve_request(self.webrtc_url, self.connection_url, self.webrtc_request);
        if let Some(ref request) = request {
            validate_request("webrtc_request", request)?;
        }
        if let Some(ref start) = self.start_endpoint {
            validate_request("start_endpoint", start)?;
        }

        for server in &self.ice_servers {
            if server.urls.is_empty() {
                return Err(TransportError::InvalidConfig(
                    "ICE server entry must list at least one URL".to_string(),
                ));
            }
        }

        let timings = [
            ("ice_gathering_timeout_ms", self.ice_gathering_timeout_ms),
            ("candidate_flush_delay_ms", self.candidate_flush_delay_ms),
            ("keepalive_interval_ms", self.keepalive_interval_ms),
            ("disconnected_grace_ms", self.disconnected_grace_ms),
            ("reconnect_backoff_ms", self.reconnect_backoff_ms),
        ];
        for (name, value) in timings {
            if value == 0 {
                return Err(TransportError::InvalidConfig(format!("{} must be non-zero", name)));
            }
        }

        if self.max_reconnection_attempts == 0 {
            return Err(TransportError::InvalidConfig(
                "max_reconnection_attempts must be non-zero".to_string(),
            ));
        }

        Ok(TransportSettings {
            request,
            start_endpoint: self.start_endpoint,
            ice_servers: self.ice_servers,
            wait_for_ice_gathering: self.wait_for_ice_gathering,
            ice_gathering_timeout: Duration::from_millis(self.ice_gathering_timeout_ms),
            audio_codec: normalize_codec("audio_codec", self.audio_codec)?,
            video_codec: normalize_codec("video_codec", self.video_codec)?,
            candidate_flush_delay: Duration::from_millis(self.candidate_flush_delay_ms),
            keepalive_interval: Duration::from_millis(self.keepalive_interval_ms),
            disconnected_grace: Duration::from_millis(self.disconnected_grace_ms),
            reconnect_backoff: Duration::from_millis(self.reconnect_backoff_ms),
            max_reconnection_attempts: self.max_reconnection_attempts,
            enable_mic: self.enable_mic,
            enable_cam: self.enable_cam,
        })
    }
}

/// `None` and `"default"` both mean "offer every codec".
pub fn normalize_codec(name: &str, codec: Option<String>) -> Result<Option<String>, TransportError> {
    match codec {
        None => Ok(None),
        Some(codec) if codec == "default" => Ok(None),
        Some(codec) if codec.trim().is_empty() => Err(TransportError::InvalidConfig(format!(
            "{} must not be empty (use \"default\" to keep all codecs)",
            name
        ))),
        Some(codec) => Ok(Some(codec)),
    }
}

fn validate_request(name: &str, request: &RequestParams) -> Result<(), TransportError> {
    if request.endpoint.trim().is_empty() {
        return Err(TransportError::InvalidConfig(format!("{} endpoint must not be empty", name)));
    }
    if request.timeout_ms == Some(0) {
        return Err(TransportError::InvalidConfig(format!("{} timeout must be non-zero", name)));
    }
    Ok(())
}

/// Merge the deprecated URL keys with the request parameters.
/// Explicit request parameters always win.
fn resolve_request(
    webrtc_url: Option<String>,
    connection_url: Option<String>,
    request: Option<RequestParams>,
) -> Option<RequestParams> {
    let legacy = match (webrtc_url, connection_url) {
        (Some(url), _) => Some(("webrtc_url", url)),
        (None, Some(url)) => Some(("connection_url", url)),
        (None, None) => None,
    };

    match (legacy, request) {
        (Some((key, _)), Some(request)) => {
            warn!("{} is deprecated; both {} and webrtc_request given, using webrtc_request", key, key);
            Some(request)
        }
        (Some((key, url)), None) => {
            warn!("{} is deprecated, use webrtc_request instead", key);
            Some(RequestParams::new(url))
        }
        (None, request) => request,
    }
}

/// Parameters accepted by `connect()`
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConnectionParams {
    pub request: Option<RequestParams>,
    pub ice_servers: Option<Vec<IceServerConfig>>,
}

const SUPPORTED_CONNECTION_KEYS: [&str; 4] =
    ["webrtcUrl", "connectionUrl", "webrtcRequestParams", "iceServers"];

impl ConnectionParams {
    pub fn with_request(request: RequestParams) -> Self {
        Self {
            request: Some(request),
            ice_servers: None,
        }
    }

    /// Normalize loosely-typed connect parameters.
    ///
    /// Keys may be snake_case or camelCase. Any key outside the supported
    /// set is rejected. A lone `sessionId` is turned into an offer URL
    /// derived from `start_endpoint` when one is configured.
    pub fn from_value(
        value: &Value,
        start_endpoint: Option<&RequestParams>,
    ) -> Result<Self, TransportError> {
        let object = match value {
            Value::Null => return Ok(Self::default()),
            Value::Object(object) => object,
            _ => {
                return Err(TransportError::InvalidParams(
                    "connection parameters must be an object".to_string(),
                ))
            }
        };

        let params: Map<String, Value> = object
            .iter()
            .map(|(key, value)| (snake_to_camel(key), value.clone()))
            .collect();

        if let Some(start) = start_endpoint {
            let has_supported = SUPPORTED_CONNECTION_KEYS.iter().any(|k| params.contains_key(*k));
            if !has_supported {
                if let Some(session_id) = params.get("sessionId").and_then(Value::as_str) {
                    return Self::from_start_endpoint(start, session_id, &params);
                }
            }
        }

        if let Some(key) = params.keys().find(|k| !SUPPORTED_CONNECTION_KEYS.contains(&k.as_str())) {
            return Err(TransportError::InvalidParams(format!(
                "Unrecognized connection parameter: {}",
                key
            )));
        }

        let webrtc_url = string_param(&params, "webrtcUrl")?;
        let connection_url = string_param(&params, "connectionUrl")?;
        let request = params
            .get("webrtcRequestParams")
            .map(|v| parse_param::<RequestParams>("webrtcRequestParams", v))
            .transpose()?;
        let ice_servers = params
            .get("iceServers")
            .map(|v| parse_param::<Vec<IceServerConfig>>("iceServers", v))
            .transpose()?;

        Ok(Self {
            request: resolve_request(webrtc_url, connection_url, request),
            ice_servers,
        })
    }

    fn from_start_endpoint(
        start: &RequestParams,
        session_id: &str,
        params: &Map<String, Value>,
    ) -> Result<Self, TransportError> {
        let endpoint = start
            .endpoint
            .replace("/start", &format!("/sessions/{}/api/offer", session_id));
        let ice_servers = params
            .get("iceConfig")
            .and_then(|config| config.get("iceServers"))
            .map(|v| parse_param::<Vec<IceServerConfig>>("iceConfig.iceServers", v))
            .transpose()?;

        Ok(Self {
            request: Some(RequestParams {
                endpoint,
                headers: start.headers.clone(),
                request_data: None,
                timeout_ms: start.timeout_ms,
            }),
            ice_servers,
        })
    }
}

fn snake_to_camel(key: &str) -> String {
    let mut out = String::with_capacity(key.len());
    let mut upper = false;
    for c in key.chars() {
        if c == '_' {
            upper = true;
        } else if upper {
            out.extend(c.to_uppercase());
            upper = false;
        } else {
            out.push(c);
        }
    }
    out
}

fn string_param(params: &Map<String, Value>, key: &str) -> Result<Option<String>, TransportError> {
    match params.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => Ok(Some(s.clone())),
        Some(_) => Err(TransportError::InvalidParams(format!("{} must be a string", key))),
    }
}

fn parse_param<T: serde::de::DeserializeOwned>(key: &str, value: &Value) -> Result<T, TransportError> {
    serde_json::from_value(value.clone())
        .map_err(|e| TransportError::InvalidParams(format!("Invalid {}: {}", key, e)))
}

/// Log settings for the client binary
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LoggingConfig {
    /// Log level / env_logger filter string
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

/// Top-level configuration file
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default)]
    pub transport: TransportConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Config {
    /// Load configuration from TOML file
    pub fn load(path: &PathBuf) -> Result<Self, Box<dyn std::error::Error>> {
        if !path.exists() {
            return Ok(Config::default());
        }

        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), Box<dyn std::error::Error>> {
        if self.logging.level.trim().is_empty() {
            return Err("Logging level must not be empty".into());
        }
        self.transport.clone().resolve()?;
        Ok(())
    }
}

fn default_ice_gathering_timeout_ms() -> u64 {
    2000
}

fn default_candidate_flush_delay_ms() -> u64 {
    200
}

fn default_keepalive_interval_ms() -> u64 {
    1000
}

fn default_disconnected_grace_ms() -> u64 {
    5000
}

fn default_reconnect_backoff_ms() -> u64 {
    2000
}

fn default_max_reconnection_attempts() -> u32 {
    3
}

fn default_enable_mic() -> bool {
    true
}

fn default_log_level() -> String {
    "info".to_string()
}
