//! Caller-facing handle of one client session.

use std::sync::Arc;

use tokio::sync::{oneshot, watch};
use tokio_util::sync::DropGuard;

use crate::{
    config::{ClientIdentity, ConnectionOptions, QoS},
    connection::{Command, ConnectionKernel, KernelHandle, ReconnectInterceptor, SessionSnapshot},
    engine::MqttEngine,
    error::SessionError,
    events::EventBridge,
    reconnect::ReconnectScheduler,
    state::{ConnectionState, ConnectionStatus},
};

/// Cloneable handle to a running session.
///
/// All calls return immediately; outcomes are reported through the client's
/// event sink. The session shuts down once the last clone is dropped.
#[derive(Clone)]
pub struct MqttClient {
    identity: Arc<ClientIdentity>,
    commands: tokio::sync::mpsc::UnboundedSender<Command>,
    state_rx: watch::Receiver<ConnectionState>,
    _guard: Arc<DropGuard>,
}

impl MqttClient {
    /// Starts a session on the current tokio runtime.
    pub fn spawn(
        identity: Arc<ClientIdentity>,
        engine: Arc<dyn MqttEngine>,
        bridge: EventBridge,
        scheduler: ReconnectScheduler,
    ) -> Self {
        let KernelHandle {
            commands,
            state_rx,
            cancel,
        } = ConnectionKernel::start(identity.clone(), engine, bridge, scheduler);

        Self {
            identity,
            commands,
            state_rx,
            _guard: Arc::new(cancel.drop_guard()),
        }
    }

    pub fn client_id(&self) -> &str {
        &self.identity.client_id
    }

    pub fn identity(&self) -> &ClientIdentity {
        &self.identity
    }

    /// Requests a connection. A no-op while a connect is already in flight.
    pub fn connect(&self, options: ConnectionOptions) -> Result<(), SessionError> {
        self.send(Command::Connect(options))
    }

    /// Requests a manual disconnect. Cancels any pending reconnect.
    pub fn disconnect(&self) -> Result<(), SessionError> {
        self.send(Command::Disconnect)
    }

    /// Registers `subscriber_id` on `topic`. The subscription is issued now
    /// when connected and replayed after every reconnect.
    pub fn subscribe(
        &self,
        subscriber_id: impl Into<String>,
        topic: impl Into<String>,
        qos: QoS,
    ) -> Result<SubscriptionHandle, SessionError> {
        let subscriber_id = subscriber_id.into();
        let topic = topic.into();
        self.send(Command::Subscribe {
            subscriber_id: subscriber_id.clone(),
            topic: topic.clone(),
            qos,
        })?;
        Ok(SubscriptionHandle {
            client_id: self.identity.client_id.clone(),
            commands: self.commands.clone(),
            subscriber_id,
            topic,
        })
    }

    pub fn unsubscribe(
        &self,
        subscriber_id: impl Into<String>,
        topic: impl Into<String>,
    ) -> Result<(), SessionError> {
        self.send(Command::Unsubscribe {
            subscriber_id: subscriber_id.into(),
            topic: topic.into(),
        })
    }

    pub fn state(&self) -> ConnectionState {
        *self.state_rx.borrow()
    }

    pub fn connection_status(&self) -> ConnectionStatus {
        self.state().status()
    }

    /// Receiver notified on every state transition.
    pub fn state_receiver(&self) -> watch::Receiver<ConnectionState> {
        self.state_rx.clone()
    }

    /// Installs a hook that rewrites the connection options before each
    /// automatic reconnect.
    pub fn set_reconnect_interceptor<F>(&self, interceptor: F) -> Result<(), SessionError>
    where
        F: Fn(&ConnectionOptions) -> ConnectionOptions + Send + Sync + 'static,
    {
        self.send(Command::SetReconnectInterceptor(Some(
            ReconnectInterceptor::new(interceptor),
        )))
    }

    pub fn clear_reconnect_interceptor(&self) -> Result<(), SessionError> {
        self.send(Command::SetReconnectInterceptor(None))
    }

    /// Reads the session state after every previously sent request has been
    /// applied.
    pub async fn snapshot(&self) -> Result<SessionSnapshot, SessionError> {
        let (tx, rx) = oneshot::channel();
        self.send(Command::Snapshot(tx))?;
        rx.await.map_err(|_| self.closed())
    }

    /// Disconnects if needed and stops the session.
    pub async fn shutdown(&self) -> Result<(), SessionError> {
        let (tx, rx) = oneshot::channel();
        self.send(Command::Shutdown(tx))?;
        rx.await.map_err(|_| self.closed())
    }

    pub fn is_closed(&self) -> bool {
        self.commands.is_closed()
    }

    fn send(&self, command: Command) -> Result<(), SessionError> {
        self.commands.send(command).map_err(|_| self.closed())
    }

    fn closed(&self) -> SessionError {
        SessionError::SessionClosed(self.identity.client_id.clone())
    }
}

impl std::fmt::Debug for MqttClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MqttClient")
            .field("client_id", &self.identity.client_id)
            .field("state", &self.state())
            .finish()
    }
}

/// Returned by [`MqttClient::subscribe`]; removes that one subscription.
///
/// Does not keep the session alive.
#[derive(Debug, Clone)]
pub struct SubscriptionHandle {
    client_id: String,
    commands: tokio::sync::mpsc::UnboundedSender<Command>,
    subscriber_id: String,
    topic: String,
}

impl SubscriptionHandle {
    pub fn subscriber_id(&self) -> &str {
        &self.subscriber_id
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn remove(self) -> Result<(), SessionError> {
        self.commands
            .send(Command::Unsubscribe {
                subscriber_id: self.subscriber_id,
                topic: self.topic,
            })
            .map_err(|_| SessionError::SessionClosed(self.client_id))
    }
}
