//! mqttlink: MQTT session agent
//!
//! This crate hosts one or more MQTT client sessions from
//! `mqttlink-session`, configured from a TOML file, and reports every session
//! event as a named JSON payload.
//!
//! ## Modules
//!
//! * `config`: Configuration structures, loading, validation, and defaults.
//!   Supports TOML configuration files with validation via the `validator` crate.
//!
//! * `bridge`: Host side of the event bridge (`HostBridge`).
//!
//! * `logger`: Centralized logging initialization using `tracing`.
//!   Supports console output in multiple formats (compact, pretty, JSON).

pub mod bridge;
pub mod config;
pub mod logger;
