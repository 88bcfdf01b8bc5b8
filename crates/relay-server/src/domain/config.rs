//! Server configuration loaded from a TOML file.
//!
//! Every field has a serde default, so an empty file, a partial file or no
//! file at all yields a working server.  Example:
//!
//! ```toml
//! [server]
//! bind_address = "0.0.0.0"
//! port = 8080
//! max_connections = 1000
//!
//! [auth]
//! required = true
//! token = "change-me"
//!
//! [heartbeat]
//! enabled = true
//! interval_secs = 30
//!
//! [features]
//! pubsub = true
//! binary = false
//!
//! [ingestion.kinds.temperature]
//! required = ["deviceId", "value"]
//! numeric = ["value"]
//! ```
//!
//! `ServerConfig::validate` rejects values that would make the server
//! unusable (zero connection limit, zero heartbeat interval, zero payload
//! ceiling); it runs after CLI overrides have been applied.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use relay_core::protocol::messages::FeatureSet;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Error type for configuration loading and validation.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A file system I/O error occurred.
    #[error("I/O error accessing config at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The TOML content could not be parsed.
    #[error("failed to parse config TOML: {0}")]
    Parse(#[from] toml::de::Error),

    /// A value is syntactically valid but unusable.
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

// ── Config schema types ───────────────────────────────────────────────────────

/// Top-level server configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ServerConfig {
    pub server: ListenConfig,
    pub auth: AuthConfig,
    pub heartbeat: HeartbeatConfig,
    pub limits: LimitsConfig,
    pub features: FeaturesConfig,
    pub requests: RequestsConfig,
    pub clients: ClientsConfig,
    pub ingestion: IngestionConfig,
    pub storage: StorageConfig,
    pub logging: LoggingConfig,
}

/// Listener and connection-limit settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ListenConfig {
    /// IP address to bind to.  `"0.0.0.0"` binds all interfaces.
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Live connections beyond this are refused with close code 1013.
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    /// permessage-deflate.  Recognised and advertised, not negotiated.
    #[serde(default)]
    pub compression: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct AuthConfig {
    /// When `true`, gated message kinds need a successful `auth` first.
    #[serde(default)]
    pub required: bool,
    /// Shared secret.  Generated at startup when auth is required and this
    /// is absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HeartbeatConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Probe interval.  A connection silent for twice this is closed.
    #[serde(default = "default_heartbeat_interval_secs")]
    pub interval_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LimitsConfig {
    /// Largest accepted inbound frame in bytes.
    #[serde(default = "default_max_payload_bytes")]
    pub max_payload_bytes: usize,
}

/// Per-pattern enable flags.  Data ingestion and the lifecycle kinds are
/// always on.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FeaturesConfig {
    #[serde(default = "default_true")]
    pub request_response: bool,
    #[serde(default = "default_true")]
    pub pubsub: bool,
    #[serde(default = "default_true")]
    pub rpc: bool,
    #[serde(default = "default_true")]
    pub streaming: bool,
    /// Accept binary WebSocket frames carrying UTF-8 JSON.
    #[serde(default)]
    pub binary: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RequestsConfig {
    /// Timeout for server-initiated requests sent without an explicit one.
    #[serde(default = "default_request_timeout_ms")]
    pub default_timeout_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ClientsConfig {
    /// Client categories a handshake may claim.
    #[serde(default = "default_allowed_types")]
    pub allowed_types: Vec<String>,
}

/// Validation rules for `data` frames.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct IngestionConfig {
    /// Fields every object payload must carry, whatever its `dataType`.
    #[serde(default)]
    pub required_fields: Vec<String>,
    /// Extra rules keyed by `dataType`.
    #[serde(default)]
    pub kinds: BTreeMap<String, KindRules>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct KindRules {
    #[serde(default)]
    pub required: Vec<String>,
    /// Fields that, when present, must be JSON numbers.
    #[serde(default)]
    pub numeric: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct StorageConfig {
    /// Attach the bundled in-memory store in the binary.
    #[serde(default)]
    pub enabled: bool,
    /// Record fields passed through the field encryptor before storage.
    #[serde(default)]
    pub encrypted_fields: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LoggingConfig {
    /// `tracing` level used when `RUST_LOG` is not set.
    #[serde(default = "default_log_level")]
    pub level: String,
}

// ── Default helpers ───────────────────────────────────────────────────────────

fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}
fn default_port() -> u16 {
    8080
}
fn default_max_connections() -> usize {
    1000
}
fn default_true() -> bool {
    true
}
/// Longest accepted `heartbeat.interval_secs` (one day).
pub const MAX_HEARTBEAT_INTERVAL_SECS: u64 = 86_400;

fn default_heartbeat_interval_secs() -> u64 {
    30
}
fn default_max_payload_bytes() -> usize {
    1024 * 1024
}
fn default_request_timeout_ms() -> u64 {
    30_000
}
fn default_allowed_types() -> Vec<String> {
    vec![
        "device".to_string(),
        "application".to_string(),
        "service".to_string(),
    ]
}
fn default_log_level() -> String {
    "info".to_string()
}

impl Default for ListenConfig {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            port: default_port(),
            max_connections: default_max_connections(),
            compression: false,
        }
    }
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: default_heartbeat_interval_secs(),
        }
    }
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_payload_bytes: default_max_payload_bytes(),
        }
    }
}

impl Default for FeaturesConfig {
    fn default() -> Self {
        Self {
            request_response: true,
            pubsub: true,
            rpc: true,
            streaming: true,
            binary: false,
        }
    }
}

impl Default for RequestsConfig {
    fn default() -> Self {
        Self {
            default_timeout_ms: default_request_timeout_ms(),
        }
    }
}

impl Default for ClientsConfig {
    fn default() -> Self {
        Self {
            allowed_types: default_allowed_types(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

// ── Derived values ────────────────────────────────────────────────────────────

impl ServerConfig {
    /// Parses the listen address from `server.bind_address` and `server.port`.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] if the bind address is not an IP.
    pub fn listen_addr(&self) -> Result<SocketAddr, ConfigError> {
        format!("{}:{}", self.server.bind_address, self.server.port)
            .parse()
            .map_err(|e| {
                ConfigError::Invalid(format!(
                    "bind address {:?}: {e}",
                    self.server.bind_address
                ))
            })
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat.interval_secs)
    }

    pub fn default_request_timeout(&self) -> Duration {
        Duration::from_millis(self.requests.default_timeout_ms)
    }

    /// The feature flags advertised in `welcome` and `handshake_response`.
    pub fn feature_set(&self) -> FeatureSet {
        FeatureSet {
            request_response: self.features.request_response,
            pubsub: self.features.pubsub,
            rpc: self.features.rpc,
            streaming: self.features.streaming,
            binary: self.features.binary,
            compression: self.server.compression,
        }
    }

    /// Whether `client_type` is in the configured allow-list.
    pub fn is_allowed_client_type(&self, client_type: &str) -> bool {
        self.clients.allowed_types.iter().any(|t| t == client_type)
    }

    /// Rejects configurations the server cannot run with.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] naming the first offending key.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.server.max_connections == 0 {
            return Err(ConfigError::Invalid(
                "server.max_connections must be greater than zero".to_string(),
            ));
        }
        if self.heartbeat.enabled && self.heartbeat.interval_secs == 0 {
            return Err(ConfigError::Invalid(
                "heartbeat.interval_secs must be greater than zero".to_string(),
            ));
        }
        if self.heartbeat.interval_secs > MAX_HEARTBEAT_INTERVAL_SECS {
            return Err(ConfigError::Invalid(format!(
                "heartbeat.interval_secs must be at most {MAX_HEARTBEAT_INTERVAL_SECS}"
            )));
        }
        if self.limits.max_payload_bytes == 0 {
            return Err(ConfigError::Invalid(
                "limits.max_payload_bytes must be greater than zero".to_string(),
            ));
        }
        if self.requests.default_timeout_ms == 0 {
            return Err(ConfigError::Invalid(
                "requests.default_timeout_ms must be greater than zero".to_string(),
            ));
        }
        if let Some(token) = &self.auth.token {
            if token.is_empty() {
                return Err(ConfigError::Invalid(
                    "auth.token must not be empty".to_string(),
                ));
            }
        }
        self.listen_addr()?;
        Ok(())
    }
}

// ── Loading ───────────────────────────────────────────────────────────────────

/// Loads `ServerConfig` from `path`, returning `ServerConfig::default()` if
/// the file does not exist.
///
/// # Errors
///
/// Returns [`ConfigError::Io`] for file-system errors other than "not found",
/// and [`ConfigError::Parse`] if the TOML is malformed.
pub fn load_config(path: &Path) -> Result<ServerConfig, ConfigError> {
    match std::fs::read_to_string(path) {
        Ok(content) => Ok(toml::from_str(&content)?),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(ServerConfig::default()),
        Err(source) => Err(ConfigError::Io {
            path: path.to_path_buf(),
            source,
        }),
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
