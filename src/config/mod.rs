//! Server and client configuration.
//!
//! Both structs deserialize from JSON with every field optional; missing
//! fields take the defaults below. Durations are milliseconds on the wire.
//!
//! ```
//! use weblink::config::{Admission, ServerConfig};
//!
//! let config = ServerConfig::from_json(r#"{ "max_connections": 64, "admission": "reject" }"#).unwrap();
//! assert_eq!(config.max_connections, 64);
//! assert_eq!(config.admission, Admission::Reject);
//! assert_eq!(config.keep_alive_max_count, 5);
//! ```

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Default cap on simultaneously served connections.
pub const DEFAULT_MAX_CONNECTIONS: usize = 1024;

/// Default maximum request body size (8 MiB).
pub const DEFAULT_PAYLOAD_MAX_LENGTH: usize = 8 * 1024 * 1024;

/// What the listener does once `max_connections` connections are live.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Admission {
    /// Stop accepting until a connection finishes.
    #[default]
    Queue,
    /// Accept and turn the connection away immediately.
    Reject,
}

/// Tunables for [`Server`](crate::server::Server) and
/// [`WebSocketServer`](crate::ws::WebSocketServer).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Exchanges served on one connection before it is closed.
    pub keep_alive_max_count: usize,
    /// Idle wait for the next request on a kept-alive connection.
    pub keep_alive_timeout_ms: u64,
    /// Wait for the first request on a new connection.
    pub read_timeout_ms: u64,
    pub write_timeout_ms: u64,
    pub payload_max_length: usize,
    pub max_connections: usize,
    pub admission: Admission,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            keep_alive_max_count: 5,
            keep_alive_timeout_ms: 5_000,
            read_timeout_ms: 5_000,
            write_timeout_ms: 5_000,
            payload_max_length: DEFAULT_PAYLOAD_MAX_LENGTH,
            max_connections: DEFAULT_MAX_CONNECTIONS,
            admission: Admission::Queue,
        }
    }
}

impl ServerConfig {
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    pub fn keep_alive_timeout(&self) -> Duration {
        Duration::from_millis(self.keep_alive_timeout_ms)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.write_timeout_ms)
    }
}

/// Username and password for `Basic` authorization.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BasicAuth {
    pub username: String,
    pub password: String,
}

/// Forward proxy the client sends every request through.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxyConfig {
    pub host: String,
    pub port: u16,
    #[serde(default)]
    pub basic_auth: Option<BasicAuth>,
    #[serde(default)]
    pub bearer_token: Option<String>,
}

/// Tunables for [`Client`](crate::client::Client).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub connection_timeout_ms: u64,
    pub read_timeout_ms: u64,
    pub write_timeout_ms: u64,
    /// Reuse one connection across requests.
    pub keep_alive: bool,
    /// Follow 3xx responses that carry a `Location`.
    pub follow_location: bool,
    pub max_redirects: usize,
    pub basic_auth: Option<BasicAuth>,
    pub bearer_token: Option<String>,
    pub proxy: Option<ProxyConfig>,
    pub user_agent: String,
    /// Largest response body accepted.
    pub payload_max_length: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            connection_timeout_ms: 300_000,
            read_timeout_ms: 300_000,
            write_timeout_ms: 300_000,
            keep_alive: false,
            follow_location: false,
            max_redirects: 10,
            basic_auth: None,
            bearer_token: None,
            proxy: None,
            user_agent: concat!("weblink/", env!("CARGO_PKG_VERSION")).to_owned(),
            payload_max_length: DEFAULT_PAYLOAD_MAX_LENGTH,
        }
    }
}

impl ClientConfig {
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    pub fn connection_timeout(&self) -> Duration {
        Duration::from_millis(self.connection_timeout_ms)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.write_timeout_ms)
    }
}
