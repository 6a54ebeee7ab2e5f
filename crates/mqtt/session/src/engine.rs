//! Seam between the session layer and an MQTT protocol engine.
//!
//! The session never encodes packets itself. It drives an [`MqttEngine`]
//! (connect, disconnect, subscribe, unsubscribe) and listens to the
//! asynchronous [`EngineEvents`] the engine reports: connection drops,
//! inbound publishes and receive-chain errors.
//!
//! Each connect attempt gets its own `EngineEvents`, tagged with the
//! attempt's epoch, so events from a superseded connection can be told apart
//! and dropped.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;
use tracing::trace;

use crate::{
    config::{ClientIdentity, ConnectionOptions, QoS},
    connection::Command,
    error::EngineError,
    socket::SocketFactory,
};

/// CONNACK details.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ConnAck {
    pub reason_code: u8,
    pub session_present: bool,
}

/// SUBACK details for one topic filter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubAck {
    pub granted_qos: QoS,
    pub message: String,
}

impl SubAck {
    pub fn granted(qos: QoS) -> Self {
        Self {
            granted_qos: qos,
            message: format!("Subscribed with QoS {qos}"),
        }
    }
}

/// Asynchronous notifications from an engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineEvent {
    /// The connection went away.
    Disconnected {
        reason_code: Option<u8>,
        message: Option<String>,
    },
    /// A message arrived on a subscribed topic.
    Publish {
        topic: String,
        qos: QoS,
        payload: Bytes,
    },
    /// The inbound message pipeline failed.
    ReceiveError(String),
}

/// Event channel handed to the engine for one connect attempt.
#[derive(Debug, Clone)]
pub struct EngineEvents {
    epoch: u64,
    tx: mpsc::UnboundedSender<Command>,
}

impl EngineEvents {
    pub(crate) fn new(epoch: u64, tx: mpsc::UnboundedSender<Command>) -> Self {
        Self { epoch, tx }
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    /// Reports an event. Returns `false` once the session is gone.
    pub fn send(&self, event: EngineEvent) -> bool {
        let delivered = self
            .tx
            .send(Command::Engine {
                epoch: self.epoch,
                event,
            })
            .is_ok();
        if !delivered {
            trace!("Session closed, engine event dropped");
        }
        delivered
    }

    pub fn disconnected(&self, reason_code: Option<u8>, message: Option<String>) -> bool {
        self.send(EngineEvent::Disconnected {
            reason_code,
            message,
        })
    }

    pub fn publish(&self, topic: impl Into<String>, qos: QoS, payload: Bytes) -> bool {
        self.send(EngineEvent::Publish {
            topic: topic.into(),
            qos,
            payload,
        })
    }

    pub fn receive_error(&self, message: impl Into<String>) -> bool {
        self.send(EngineEvent::ReceiveError(message.into()))
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// MQTT protocol engine driven by a client session.
///
/// Calls never overlap for `connect`; `subscribe` and `unsubscribe` may run
/// concurrently with each other.
#[async_trait]
pub trait MqttEngine: Send + Sync + 'static {
    /// Opens the transport and completes the CONNECT handshake.
    async fn connect(
        &self,
        options: &ConnectionOptions,
        events: EngineEvents,
    ) -> Result<ConnAck, EngineError>;

    /// Sends DISCONNECT and closes the transport.
    async fn disconnect(&self) -> Result<(), EngineError>;

    async fn subscribe(&self, topic: &str, qos: QoS) -> Result<SubAck, EngineError>;

    async fn unsubscribe(&self, topic: &str) -> Result<(), EngineError>;
}

/// Builds one engine per client identity.
pub trait EngineFactory: Send + Sync {
    /// `sockets` opens the transport matching the identity for engines that
    /// run MQTT over a [`ByteStreamSocket`](crate::socket::ByteStreamSocket).
    fn build(
        &self,
        identity: &ClientIdentity,
        sockets: SocketFactory,
    ) -> Result<Arc<dyn MqttEngine>, EngineError>;
}

impl<F> EngineFactory for F
where
    F: Fn(&ClientIdentity, SocketFactory) -> Result<Arc<dyn MqttEngine>, EngineError> + Send + Sync,
{
    fn build(
        &self,
        identity: &ClientIdentity,
        sockets: SocketFactory,
    ) -> Result<Arc<dyn MqttEngine>, EngineError> {
        self(identity, sockets)
    }
}
