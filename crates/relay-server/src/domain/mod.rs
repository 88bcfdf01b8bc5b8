//! Domain layer for relay-server.
//!
//! Pure configuration types with no I/O beyond reading the config file.
//! Wire messages and session snapshots live in `relay-core`.

pub mod config;

pub use config::{load_config, ConfigError, ServerConfig};
