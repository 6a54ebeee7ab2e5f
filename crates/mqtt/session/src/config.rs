//! Configuration for a single MQTT client session.
//!
//! A [`Config`] describes one logical client: who it is (identity), where it
//! connects (host, port, transport), how each CONNECT is parameterized and how
//! the session recovers from connection loss. It deserializes from TOML or
//! JSON with `serde` and is checked with `validator` before a client is built,
//! so a bad value fails at creation time and never at connect time.
//!
//! From a validated config the session derives two values:
//! - [`ClientIdentity`]: immutable for the lifetime of the client,
//! - [`ConnectionOptions`]: passed fresh to every explicit connect.
//!
//! # Examples
//!
//! ```toml
//! client_id = "greenhouse-gw"
//! host = "broker.example.com"
//! port = 8884
//! enable_ssl_config = true
//!
//! [web_socket]
//! use_web_socket = true
//! uri = "/mqtt"
//! headers = { Authorization = "Bearer abc" }
//!
//! [reconnect]
//! auto_reconnect = true
//! retry_count = 10
//! backoff_time = 1000
//! max_backoff_time = 30000
//! jitter = 0.5
//! ```

use std::{collections::HashMap, fmt, time::Duration};

use serde::{Deserialize, Serialize};
use serde_repr::{Deserialize_repr, Serialize_repr};
use uuid::Uuid;
use validator::{Validate, ValidationError};

/// Default websocket path used by brokers that serve MQTT over websockets.
pub const DEFAULT_WEB_SOCKET_URI: &str = "/mqtt";

/// MQTT quality of service level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize_repr, Deserialize_repr)]
#[repr(u8)]
pub enum QoS {
    AtMostOnce = 0,
    AtLeastOnce = 1,
    ExactlyOnce = 2,
}

impl QoS {
    /// Maps a numeric level to a QoS, falling back to `AtMostOnce` for
    /// anything outside 0..=2.
    pub fn from_level(level: u8) -> Self {
        QoS::try_from(level).unwrap_or(QoS::AtMostOnce)
    }

    pub fn level(self) -> u8 {
        self as u8
    }
}

impl Default for QoS {
    fn default() -> Self {
        QoS::AtMostOnce
    }
}

impl TryFrom<u8> for QoS {
    type Error = u8;

    fn try_from(level: u8) -> Result<Self, Self::Error> {
        match level {
            0 => Ok(QoS::AtMostOnce),
            1 => Ok(QoS::AtLeastOnce),
            2 => Ok(QoS::ExactlyOnce),
            other => Err(other),
        }
    }
}

impl fmt::Display for QoS {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.level())
    }
}

/// Which socket carries the MQTT byte stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportKind {
    /// Native TCP stream.
    RawStream,
    /// Binary websocket frames emulating a byte stream.
    FramedWebSocket,
}

/// Identity of a client: fixed at construction, never mutated afterwards.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientIdentity {
    pub client_id: String,
    pub host: String,
    pub port: u16,
    pub transport: TransportKind,
    pub tls: bool,
    pub web_socket_uri: String,
    pub web_socket_headers: HashMap<String, String>,
}

impl ClientIdentity {
    /// Plain TCP identity, mostly useful for tests and tooling.
    pub fn raw(client_id: impl Into<String>, host: impl Into<String>, port: u16) -> Self {
        Self {
            client_id: client_id.into(),
            host: host.into(),
            port,
            transport: TransportKind::RawStream,
            tls: false,
            web_socket_uri: DEFAULT_WEB_SOCKET_URI.to_string(),
            web_socket_headers: HashMap::new(),
        }
    }

    /// Renders `ws://host:port/path`, or `wss://` when TLS is enabled.
    pub fn web_socket_url(&self) -> String {
        let scheme = if self.tls { "wss" } else { "ws" };
        format!("{scheme}://{}:{}{}", self.host, self.port, self.web_socket_uri)
    }
}

/// Parameters of a single CONNECT.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionOptions {
    pub keep_alive: Duration,
    pub clean_session: bool,
    pub username: Option<String>,
    pub password: Option<String>,
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        Self {
            keep_alive: Duration::from_secs(60),
            clean_session: true,
            username: None,
            password: None,
        }
    }
}

/// Websocket transport settings.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct WebSocketConfig {
    /// Carry MQTT over websocket frames instead of a raw TCP stream.
    pub use_web_socket: bool,

    /// Request path, must start with `/`.
    #[validate(custom(function = "validate_uri"))]
    pub uri: String,

    /// Extra handshake headers.
    pub headers: HashMap<String, String>,
}

impl Default for WebSocketConfig {
    fn default() -> Self {
        Self {
            use_web_socket: false,
            uri: DEFAULT_WEB_SOCKET_URI.to_string(),
            headers: HashMap::new(),
        }
    }
}

fn validate_uri(uri: &str) -> Result<(), ValidationError> {
    if uri.starts_with('/') && !uri.chars().any(char::is_whitespace) {
        return Ok(());
    }
    let mut err = ValidationError::new("invalid_web_socket_uri");
    err.message = Some(format!("Websocket uri must be an absolute path: {uri}").into());
    Err(err)
}

/// Reconnect policy.
///
/// The delay before reconnect attempt `n` (counting from zero) is
///
/// ```text
/// delay = min(max_backoff_time, min(max_backoff_time, backoff_time * 2^n) * (1 + U[0, jitter]))
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
#[validate(schema(function = "validate_backoff_window"))]
pub struct ReconnectConfig {
    /// Reconnect automatically after an unexpected connection loss.
    pub auto_reconnect: bool,

    /// Number of scheduled reconnects before giving up. `0` means unlimited.
    pub retry_count: u32,

    /// Base delay in milliseconds.
    #[validate(range(min = 1, message = "Backoff time must be at least 1 ms"))]
    pub backoff_time: u64,

    /// Delay cap in milliseconds.
    #[validate(range(min = 1, message = "Max backoff time must be at least 1 ms"))]
    pub max_backoff_time: u64,

    /// Upper bound of the random stretch applied to each delay.
    #[validate(range(min = 0.0, max = 1.0, message = "Jitter must be between 0.0 and 1.0"))]
    pub jitter: f64,
}

impl ReconnectConfig {
    pub fn base_delay(&self) -> Duration {
        Duration::from_millis(self.backoff_time)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_backoff_time)
    }

    /// Retry budget, `None` when unlimited.
    pub fn retry_limit(&self) -> Option<u32> {
        (self.retry_count > 0).then_some(self.retry_count)
    }
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            auto_reconnect: true,
            retry_count: 0,
            backoff_time: 1_000,
            max_backoff_time: 60_000,
            jitter: 0.5,
        }
    }
}

fn validate_backoff_window(config: &ReconnectConfig) -> Result<(), ValidationError> {
    if config.max_backoff_time >= config.backoff_time {
        return Ok(());
    }
    let mut err = ValidationError::new("invalid_backoff_window");
    err.message = Some(
        format!(
            "Max backoff time ({} ms) must not be lower than backoff time ({} ms)",
            config.max_backoff_time, config.backoff_time
        )
        .into(),
    );
    Err(err)
}

/// Client session configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct Config {
    /// Client identifier. Left empty, a random UUID is generated when the
    /// identity is derived.
    #[validate(length(max = 256, message = "Client id must not exceed 256 characters"))]
    pub client_id: String,

    /// Broker hostname or IP address.
    #[validate(length(
        min = 1,
        max = 255,
        message = "Host must be between 1 and 255 characters"
    ))]
    pub host: String,

    /// Broker port.
    #[validate(range(min = 1, max = 65535, message = "Port must be between 1 and 65535"))]
    pub port: u16,

    /// Use TLS (`mqtts` / `wss`).
    pub enable_ssl_config: bool,

    #[validate(nested)]
    pub web_socket: WebSocketConfig,

    /// Keep-alive interval in seconds.
    #[validate(range(
        min = 5,
        max = 65535,
        message = "Keep alive must be between 5 and 65535 seconds"
    ))]
    pub keep_alive: u64,

    pub clean_session: bool,

    #[validate(length(min = 1, message = "Username must not be empty"))]
    pub username: Option<String>,

    pub password: Option<String>,

    /// Transport connect timeout in seconds.
    #[validate(range(
        min = 1,
        max = 300,
        message = "Connection timeout must be between 1 and 300 seconds"
    ))]
    pub connection_timeout: u64,

    #[validate(nested)]
    pub reconnect: ReconnectConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            client_id: Uuid::new_v4().to_string(),
            host: "localhost".to_string(),
            port: 1883,
            enable_ssl_config: false,
            web_socket: WebSocketConfig::default(),
            keep_alive: 60,
            clean_session: true,
            username: None,
            password: None,
            connection_timeout: 30,
            reconnect: ReconnectConfig::default(),
        }
    }
}

impl Config {
    /// Derives the immutable identity of the client.
    pub fn identity(&self) -> ClientIdentity {
        let client_id = if self.client_id.trim().is_empty() {
            Uuid::new_v4().to_string()
        } else {
            self.client_id.clone()
        };
        let transport = if self.web_socket.use_web_socket {
            TransportKind::FramedWebSocket
        } else {
            TransportKind::RawStream
        };

        ClientIdentity {
            client_id,
            host: self.host.clone(),
            port: self.port,
            transport,
            tls: self.enable_ssl_config,
            web_socket_uri: self.web_socket.uri.clone(),
            web_socket_headers: self.web_socket.headers.clone(),
        }
    }

    /// Connection options for an explicit connect built from this config.
    pub fn connection_options(&self) -> ConnectionOptions {
        ConnectionOptions {
            keep_alive: Duration::from_secs(self.keep_alive),
            clean_session: self.clean_session,
            username: self.username.clone(),
            password: self.password.clone(),
        }
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connection_timeout)
    }
}
