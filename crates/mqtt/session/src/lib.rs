//! # mqttlink-session: connection and session layer of an MQTT client
//!
//! Sits between a host application and an MQTT protocol engine and keeps one
//! logical session per client alive across network failures:
//!
//! - **Connection state machine** with a single owner per client
//! - **Automatic reconnection** with jittered exponential backoff and a retry budget
//! - **Subscription registry** replayed after every reconnect, shared topic filters
//! - **Event bridge** reporting every outcome as a named event with a JSON payload
//! - **Byte-stream sockets** over raw TCP or binary websocket frames
//!
//! # Quick Start
//!
//! ```ignore
//! use std::sync::Arc;
//! use mqttlink_session::{ClientManager, Config, QoS, RumqttcEngineFactory};
//!
//! #[tokio::main]
//! async fn main() -> mqttlink_session::Result<()> {
//!     let sink = Arc::new(|event: mqttlink_session::MqttEvent| {
//!         println!("{} {}", event.name(), event.payload());
//!     });
//!     let mut manager = ClientManager::new(Arc::new(RumqttcEngineFactory::default()), sink);
//!
//!     let config = Config { host: "broker.local".into(), ..Default::default() };
//!     let client = manager.create(&config)?;
//!     client.connect(config.connection_options())?;
//!     client.subscribe("dashboard", "home/+/temp", QoS::AtLeastOnce)?;
//!     Ok(())
//! }
//! ```
//!
//! # Reconnect backoff
//!
//! ```text
//! delay(n) = min(max_backoff, base * 2^n) * (1 + U[0, jitter]), capped at max_backoff
//! ```
//!
//! `retry_count = 0` retries forever; otherwise the budget is reported as spent
//! exactly once with an `mqtt_error` event.

pub mod backoff;
pub mod client;
pub mod config;
pub mod connection;
pub mod engine;
pub mod error;
pub mod events;
pub mod manager;
pub mod reconnect;
pub mod registry;
#[cfg(feature = "rumqttc-engine")]
pub mod rumqttc_engine;
pub mod socket;
pub mod state;
#[cfg(feature = "rumqttc-engine")]
pub mod stream_engine;
pub mod tcp;
pub mod websocket;

#[cfg(test)]
pub(crate) mod testing;

// Re-exports: Configuration
pub use config::{
    ClientIdentity, Config, ConnectionOptions, QoS, ReconnectConfig, TransportKind,
    WebSocketConfig,
};
// Re-exports: Sessions
pub use client::{MqttClient, SubscriptionHandle};
pub use connection::{ReconnectInterceptor, SessionSnapshot};
pub use manager::ClientManager;
pub use state::{ConnectionState, ConnectionStatus};
// Re-exports: Engine seam
pub use engine::{ConnAck, EngineEvent, EngineEvents, EngineFactory, MqttEngine, SubAck};
#[cfg(feature = "rumqttc-engine")]
pub use rumqttc_engine::{RumqttcEngine, RumqttcEngineFactory};
#[cfg(feature = "rumqttc-engine")]
pub use stream_engine::StreamEngine;
// Re-exports: Events
pub use events::{ChannelSink, ErrorType, EventBridge, EventSink, MqttEvent, ReasonCode};
// Re-exports: Sockets
pub use socket::{ByteStreamSocket, ServiceOrder, SocketEvent, SocketFactory};
pub use tcp::TcpSocket;
pub use websocket::{TungsteniteConnector, WebSocketAdapter};
// Re-exports: Errors
pub use error::{EngineError, SessionError, TransportError};

/// Result type of session operations.
pub type Result<T> = std::result::Result<T, SessionError>;
