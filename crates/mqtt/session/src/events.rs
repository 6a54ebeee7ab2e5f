//! Event vocabulary delivered to the host application.
//!
//! Everything the session wants to tell its host goes through an
//! [`EventSink`] as one of a fixed set of named events with a camelCase JSON
//! payload:
//!
//! | name                 | payload                                                   |
//! |----------------------|-----------------------------------------------------------|
//! | `client_initialize`  | `clientId`, `clientInit`, `errorMessage?`                 |
//! | `connected`          | `clientId`, `reasonCode`                                  |
//! | `disconnected`       | `clientId`, `reasonCode`, `errorMessage?`                 |
//! | `subscribe_success`  | `eventId`, `topic`, `qos`, `message`                      |
//! | `subscribe_failed`   | `eventId`, `errorMessage`, `reasonCode`                   |
//! | `subscription_event` | `eventId`, `topic`, `qos`, `payload`                      |
//! | `mqtt_error`         | `clientId`, `errorType`, `errorMessage`, `reasonCode`, `topic?` |
//!
//! Negative reason codes are local failure categories, zero is success and
//! positive codes are broker reason codes passed through unchanged.

use std::{fmt, sync::Arc};

use bytes::Bytes;
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::config::QoS;

/// Reason code attached to lifecycle events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct ReasonCode(pub i32);

impl ReasonCode {
    pub const SUCCESS: ReasonCode = ReasonCode(0);
    pub const DEFAULT: ReasonCode = ReasonCode(-1);
    pub const CONNECTION: ReasonCode = ReasonCode(-2);
    pub const DISCONNECTION: ReasonCode = ReasonCode(-3);
    pub const SUBSCRIPTION: ReasonCode = ReasonCode(-4);
    pub const UNSUBSCRIPTION: ReasonCode = ReasonCode(-5);
    pub const INITIALIZATION: ReasonCode = ReasonCode(-6);
    pub const RX_CHAIN: ReasonCode = ReasonCode(-7);

    /// Broker-provided reason code, passed through unchanged.
    pub fn protocol(code: u8) -> Self {
        ReasonCode(i32::from(code))
    }

    pub fn value(self) -> i32 {
        self.0
    }

    pub fn is_success(self) -> bool {
        self.0 == 0
    }

    /// Whether this is one of the local failure categories.
    pub fn is_local_failure(self) -> bool {
        (-7..=-1).contains(&self.0)
    }
}

impl fmt::Display for ReasonCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Category of an `mqtt_error` event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorType {
    Initialization,
    Connection,
    Disconnection,
    Subscription,
    Unsubscription,
    RxChain,
}

impl ErrorType {
    /// Reason code reported with this category.
    pub fn reason_code(self) -> ReasonCode {
        match self {
            ErrorType::Initialization => ReasonCode::INITIALIZATION,
            ErrorType::Connection => ReasonCode::CONNECTION,
            ErrorType::Disconnection => ReasonCode::DISCONNECTION,
            ErrorType::Subscription => ReasonCode::SUBSCRIPTION,
            ErrorType::Unsubscription => ReasonCode::UNSUBSCRIPTION,
            ErrorType::RxChain => ReasonCode::RX_CHAIN,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientInitialize {
    pub client_id: String,
    pub client_init: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Connected {
    pub client_id: String,
    pub reason_code: ReasonCode,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Disconnected {
    pub client_id: String,
    pub reason_code: ReasonCode,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscribeSuccess {
    pub event_id: String,
    pub topic: String,
    pub qos: QoS,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscribeFailed {
    pub event_id: String,
    pub error_message: String,
    pub reason_code: ReasonCode,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscriptionEvent {
    pub event_id: String,
    pub topic: String,
    pub qos: QoS,
    pub payload: Bytes,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MqttError {
    pub client_id: String,
    pub error_type: ErrorType,
    pub error_message: String,
    pub reason_code: ReasonCode,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub topic: Option<String>,
}

/// One event for the host application.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MqttEvent {
    ClientInitialize(ClientInitialize),
    Connected(Connected),
    Disconnected(Disconnected),
    SubscribeSuccess(SubscribeSuccess),
    SubscribeFailed(SubscribeFailed),
    SubscriptionEvent(SubscriptionEvent),
    MqttError(MqttError),
}

impl MqttEvent {
    /// Wire name of the event.
    pub fn name(&self) -> &'static str {
        match self {
            MqttEvent::ClientInitialize(_) => "client_initialize",
            MqttEvent::Connected(_) => "connected",
            MqttEvent::Disconnected(_) => "disconnected",
            MqttEvent::SubscribeSuccess(_) => "subscribe_success",
            MqttEvent::SubscribeFailed(_) => "subscribe_failed",
            MqttEvent::SubscriptionEvent(_) => "subscription_event",
            MqttEvent::MqttError(_) => "mqtt_error",
        }
    }

    /// Payload as a JSON object.
    pub fn payload(&self) -> serde_json::Value {
        let value = match self {
            MqttEvent::ClientInitialize(e) => serde_json::to_value(e),
            MqttEvent::Connected(e) => serde_json::to_value(e),
            MqttEvent::Disconnected(e) => serde_json::to_value(e),
            MqttEvent::SubscribeSuccess(e) => serde_json::to_value(e),
            MqttEvent::SubscribeFailed(e) => serde_json::to_value(e),
            MqttEvent::SubscriptionEvent(e) => serde_json::to_value(e),
            MqttEvent::MqttError(e) => serde_json::to_value(e),
        };
        value.unwrap_or_else(|e| {
            warn!("Failed to serialize {} payload: {}", self.name(), e);
            serde_json::Value::Null
        })
    }

    /// Reason code carried by the event, if it has one.
    pub fn reason_code(&self) -> Option<ReasonCode> {
        match self {
            MqttEvent::Connected(e) => Some(e.reason_code),
            MqttEvent::Disconnected(e) => Some(e.reason_code),
            MqttEvent::SubscribeFailed(e) => Some(e.reason_code),
            MqttEvent::MqttError(e) => Some(e.reason_code),
            MqttEvent::ClientInitialize(_)
            | MqttEvent::SubscribeSuccess(_)
            | MqttEvent::SubscriptionEvent(_) => None,
        }
    }
}

/// Receiver of session events. Called from the client's kernel task, in the
/// order the events were generated; implementations must not block.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: MqttEvent);
}

impl<F> EventSink for F
where
    F: Fn(MqttEvent) + Send + Sync,
{
    fn emit(&self, event: MqttEvent) {
        self(event)
    }
}

/// Sink forwarding events into an unbounded channel.
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<MqttEvent>,
}

impl ChannelSink {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<MqttEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl EventSink for ChannelSink {
    fn emit(&self, event: MqttEvent) {
        if self.tx.send(event).is_err() {
            debug!("Event receiver dropped");
        }
    }
}

/// Per-client front of an [`EventSink`] that builds the event payloads.
#[derive(Clone)]
pub struct EventBridge {
    client_id: Arc<str>,
    sink: Arc<dyn EventSink>,
}

impl fmt::Debug for EventBridge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventBridge")
            .field("client_id", &self.client_id)
            .finish_non_exhaustive()
    }
}

impl EventBridge {
    pub fn new(client_id: impl Into<Arc<str>>, sink: Arc<dyn EventSink>) -> Self {
        Self {
            client_id: client_id.into(),
            sink,
        }
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    fn emit(&self, event: MqttEvent) {
        debug!("[{}] emitting {}", self.client_id, event.name());
        self.sink.emit(event);
    }

    pub fn client_initialized(&self) {
        self.emit(MqttEvent::ClientInitialize(ClientInitialize {
            client_id: self.client_id.to_string(),
            client_init: true,
            error_message: None,
        }));
    }

    pub fn initialization_failed(&self, message: impl Into<String>) {
        self.emit(MqttEvent::ClientInitialize(ClientInitialize {
            client_id: self.client_id.to_string(),
            client_init: false,
            error_message: Some(message.into()),
        }));
    }

    pub fn connected(&self, reason_code: ReasonCode) {
        self.emit(MqttEvent::Connected(Connected {
            client_id: self.client_id.to_string(),
            reason_code,
        }));
    }

    pub fn disconnected(&self, reason_code: ReasonCode, error_message: Option<String>) {
        self.emit(MqttEvent::Disconnected(Disconnected {
            client_id: self.client_id.to_string(),
            reason_code,
            error_message,
        }));
    }

    pub fn subscribe_success(&self, event_id: &str, topic: &str, qos: QoS, message: String) {
        self.emit(MqttEvent::SubscribeSuccess(SubscribeSuccess {
            event_id: event_id.to_string(),
            topic: topic.to_string(),
            qos,
            message,
        }));
    }

    pub fn subscribe_failed(&self, event_id: &str, error_message: String) {
        self.emit(MqttEvent::SubscribeFailed(SubscribeFailed {
            event_id: event_id.to_string(),
            error_message,
            reason_code: ReasonCode::SUBSCRIPTION,
        }));
    }

    pub fn message(&self, event_id: &str, topic: &str, qos: QoS, payload: Bytes) {
        self.emit(MqttEvent::SubscriptionEvent(SubscriptionEvent {
            event_id: event_id.to_string(),
            topic: topic.to_string(),
            qos,
            payload,
        }));
    }

    pub fn error(&self, error_type: ErrorType, error_message: String, topic: Option<String>) {
        self.emit(MqttEvent::MqttError(MqttError {
            client_id: self.client_id.to_string(),
            error_type,
            error_message,
            reason_code: error_type.reason_code(),
            topic,
        }));
    }
}
