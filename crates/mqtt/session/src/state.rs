//! Connection state of a logical MQTT session.
//!
//! The connection kernel is the only writer; everyone else observes the state
//! through a `watch` channel. Host applications usually only need the coarser
//! [`ConnectionStatus`].
//!
//! # Examples
//!
//! ```ignore
//! use mqttlink_session::ConnectionState;
//!
//! let state = ConnectionState::Disconnecting;
//! println!("Status: {}", state);            // "Disconnecting"
//! println!("Host view: {}", state.status()); // "disconnected"
//! ```

use std::fmt;

use serde::Serialize;

/// Lifecycle of one client identity.
///
/// ```text
/// Disconnected --connect--> Connecting --success--> Connected
///      ^                        |                       |
///      +-------failure----------+                       |
///      +-------------- transport dropped ---------------+
///
/// any state --disconnect--> Disconnecting --done--> Disconnected
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    /// Initial state; also reached after every failure or disconnect.
    #[default]
    Disconnected,

    /// A transport connect is in flight. At most one per identity.
    Connecting,

    /// CONNACK received; subscriptions are live.
    Connected,

    /// A manual disconnect was requested and is being carried out.
    Disconnecting,
}

impl ConnectionState {
    /// Returns a short string identifier for the current state.
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Disconnected => "Disconnected",
            ConnectionState::Connecting => "Connecting",
            ConnectionState::Connected => "Connected",
            ConnectionState::Disconnecting => "Disconnecting",
        }
    }

    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionState::Connected)
    }

    pub fn is_connecting(&self) -> bool {
        matches!(self, ConnectionState::Connecting)
    }

    /// Coarse status reported to host applications. `Disconnecting` is
    /// reported as disconnected.
    pub fn status(&self) -> ConnectionStatus {
        match self {
            ConnectionState::Connected => ConnectionStatus::Connected,
            ConnectionState::Connecting => ConnectionStatus::Connecting,
            ConnectionState::Disconnected | ConnectionState::Disconnecting => {
                ConnectionStatus::Disconnected
            }
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Answer to a connection-status query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionStatus {
    Connected,
    Connecting,
    Disconnected,
}

impl ConnectionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionStatus::Connected => "connected",
            ConnectionStatus::Connecting => "connecting",
            ConnectionStatus::Disconnected => "disconnected",
        }
    }
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_as_str() {
        assert_eq!(ConnectionState::Connecting.as_str(), "Connecting");
        assert_eq!(ConnectionState::Connected.as_str(), "Connected");
        assert_eq!(ConnectionState::Disconnected.as_str(), "Disconnected");
        assert_eq!(ConnectionState::Disconnecting.as_str(), "Disconnecting");
    }

    #[test]
    fn test_state_predicates() {
        assert!(ConnectionState::Connected.is_connected());
        assert!(!ConnectionState::Connecting.is_connected());
        assert!(ConnectionState::Connecting.is_connecting());
        assert!(!ConnectionState::Disconnecting.is_connecting());
    }

    #[test]
    fn test_default_is_disconnected() {
        assert_eq!(ConnectionState::default(), ConnectionState::Disconnected);
    }

    #[test]
    fn test_status_mapping() {
        assert_eq!(ConnectionState::Connected.status(), ConnectionStatus::Connected);
        assert_eq!(ConnectionState::Connecting.status(), ConnectionStatus::Connecting);
        assert_eq!(
            ConnectionState::Disconnecting.status(),
            ConnectionStatus::Disconnected
        );
        assert_eq!(
            ConnectionState::Disconnected.status(),
            ConnectionStatus::Disconnected
        );
    }

    #[test]
    fn test_status_serializes_lowercase() {
        let json = serde_json::to_string(&ConnectionStatus::Connecting).unwrap();
        assert_eq!(json, "\"connecting\"");
        assert_eq!(ConnectionStatus::Disconnected.to_string(), "disconnected");
    }
}
