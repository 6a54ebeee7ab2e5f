//! Error types shared across the session layer.
//!
//! Three layers report failures independently:
//! - [`TransportError`] for the byte-stream sockets,
//! - [`EngineError`] for outcomes reported by an MQTT protocol engine,
//! - [`SessionError`] for the public client and manager API.
//!
//! None of these are fatal to the process. The connection kernel converts
//! them into events at its boundary and always settles back into
//! `Disconnected`.

use std::time::Duration;

use thiserror::Error;

use crate::backoff::BackoffError;

/// Errors raised by the public session API.
#[derive(Debug, Error)]
pub enum SessionError {
    /// The supplied configuration did not pass validation.
    #[error("Config validation error: {0}")]
    InvalidConfig(#[from] validator::ValidationErrors),

    /// The protocol engine could not be constructed for this identity.
    #[error("Client initialization error: {0}")]
    Initialization(String),

    /// No client is registered under the given identifier.
    #[error("Client not found: {0}")]
    ClientNotFound(String),

    /// A client with the same identifier is already registered.
    #[error("Client already exists: {0}")]
    ClientExists(String),

    /// The client's kernel task has stopped; the handle is no longer usable.
    #[error("Session closed for client: {0}")]
    SessionClosed(String),

    /// Engine-level failure surfaced to the caller.
    #[error("Engine error: {0}")]
    Engine(#[from] EngineError),

    /// Socket-level failure surfaced to the caller.
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    /// Reconnect budget exhausted.
    #[error("Retries policy error: {0}")]
    RetriesPolicy(#[from] BackoffError),
}

/// Failures reported by an [`MqttEngine`](crate::engine::MqttEngine).
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum EngineError {
    /// The broker answered CONNECT with a non-zero return code.
    #[error("Connection refused by broker (code {code}): {message}")]
    Refused { code: u8, message: String },

    /// Disconnect requested on a session that was already down.
    #[error("Client is already disconnected")]
    AlreadyDisconnected,

    /// An operation that needs a live connection was issued without one.
    #[error("Client is not connected")]
    NotConnected,

    /// The broker rejected a subscription.
    #[error("Subscription rejected for topic '{topic}': {message}")]
    SubscriptionRejected { topic: String, message: String },

    /// Network-level failure below the protocol engine.
    #[error("Transport failure: {0}")]
    Transport(String),

    /// Protocol violation or internal engine state error.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// The engine's request queue is gone.
    #[error("Engine request channel closed")]
    Closed,
}

impl EngineError {
    /// Protocol reason code carried by this error, if any.
    pub fn reason_code(&self) -> Option<i32> {
        match self {
            EngineError::Refused { code, .. } => Some(i32::from(*code)),
            _ => None,
        }
    }

    /// Whether this error only reports that the session was already down.
    pub fn is_already_disconnected(&self) -> bool {
        matches!(self, EngineError::AlreadyDisconnected | EngineError::NotConnected)
    }
}

impl From<TransportError> for EngineError {
    fn from(err: TransportError) -> Self {
        EngineError::Transport(err.to_string())
    }
}

/// Errors raised by the byte-stream socket adapters.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The websocket URL could not be built from host, port and path.
    #[error("Invalid websocket URL: {0}")]
    InvalidUrl(String),

    /// A configured handshake header has an invalid name or value.
    #[error("Invalid handshake header '{0}'")]
    InvalidHeader(String),

    /// The transport did not come up within the connect timeout.
    #[error("Connect timed out after {0:?}")]
    Timeout(Duration),

    /// Raw stream TLS has no provider in this build.
    #[error("TLS over raw stream sockets is not available")]
    TlsUnavailable,

    /// Operation requires an open transport.
    #[error("Socket is not connected")]
    NotConnected,

    /// Websocket protocol or handshake failure.
    #[error("WebSocket error: {0}")]
    WebSocket(String),

    /// The peer or the local side closed the transport.
    #[error("Transport closed: {0}")]
    Closed(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<tokio_tungstenite::tungstenite::Error> for TransportError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        TransportError::WebSocket(err.to_string())
    }
}

/// Extracts the innermost error message from an error chain.
pub(crate) fn root_cause(e: &dyn std::error::Error) -> String {
    let mut current = e;
    while let Some(source) = current.source() {
        current = source;
    }
    current.to_string().trim_matches('"').to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_error_display() {
        let err = SessionError::ClientNotFound("sensor-7".into());
        assert_eq!(err.to_string(), "Client not found: sensor-7");

        let err = SessionError::Initialization("no engine".into());
        assert_eq!(err.to_string(), "Client initialization error: no engine");
    }

    #[test]
    fn test_backoff_error_conversion() {
        let err: SessionError = BackoffError::MaxAttemptLimitError(3).into();
        assert_eq!(
            err.to_string(),
            "Retries policy error: Maximum number of attempts exceeded: 3"
        );
    }

    #[test]
    fn test_engine_error_reason_code() {
        let refused = EngineError::Refused {
            code: 5,
            message: "not authorized".into(),
        };
        assert_eq!(refused.reason_code(), Some(5));
        assert_eq!(EngineError::Closed.reason_code(), None);
    }

    #[test]
    fn test_already_disconnected_detection() {
        assert!(EngineError::AlreadyDisconnected.is_already_disconnected());
        assert!(EngineError::NotConnected.is_already_disconnected());
        assert!(!EngineError::Transport("reset".into()).is_already_disconnected());
    }

    #[test]
    fn test_transport_error_into_engine_error() {
        let err: EngineError = TransportError::Timeout(Duration::from_secs(3)).into();
        assert_eq!(err, EngineError::Transport("Connect timed out after 3s".into()));
    }

    #[test]
    fn test_root_cause_walks_source_chain() {
        let io = std::io::Error::new(std::io::ErrorKind::ConnectionReset, "\"peer reset\"");
        let err = TransportError::Io(io);
        assert_eq!(root_cause(&err), "peer reset");
    }
}
