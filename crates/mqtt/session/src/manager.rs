//! Client Manager Module
//! Registry of client sessions keyed by client id.
//!
//! The `ClientManager` is the entry point for hosts. It:
//! 1. Validates the client configuration
//! 2. Builds the protocol engine through the configured [`EngineFactory`]
//! 3. Starts the session kernel and reports `client_initialize`
//! 4. Routes id-based requests to the right session
//!
//! # Typical Usage
//!
//! ```ignore
//! let mut manager = ClientManager::new(Arc::new(RumqttcEngineFactory::default()), sink);
//! let client = manager.create(&config)?;
//! client.connect(config.connection_options())?;
//! client.subscribe("dashboard", "home/+/temp", QoS::AtLeastOnce)?;
//! ```

use std::{collections::HashMap, sync::Arc};

use tracing::{error, info, warn};
use validator::Validate;

use crate::{
    client::{MqttClient, SubscriptionHandle},
    config::{Config, ConnectionOptions, QoS},
    engine::EngineFactory,
    error::SessionError,
    events::{EventBridge, EventSink},
    reconnect::ReconnectScheduler,
    socket::SocketFactory,
    state::ConnectionStatus,
};

/// Owns every client session of a host.
pub struct ClientManager {
    factory: Arc<dyn EngineFactory>,
    sink: Arc<dyn EventSink>,
    clients: HashMap<String, MqttClient>,
}

impl ClientManager {
    /// # Arguments
    /// - `factory`: builds the protocol engine of each new client
    /// - `sink`: receives the events of every client
    pub fn new(factory: Arc<dyn EngineFactory>, sink: Arc<dyn EventSink>) -> Self {
        Self {
            factory,
            sink,
            clients: HashMap::new(),
        }
    }

    /// Creates and starts a session. Does not connect.
    ///
    /// Emits `client_initialize` with the outcome whenever the client id is
    /// known, including validation and engine failures.
    ///
    /// # Returns
    /// - `Ok(MqttClient)`: session started
    /// - `Err(SessionError::InvalidConfig)`: the configuration is invalid
    /// - `Err(SessionError::ClientExists)`: a session with this id is registered
    /// - `Err(SessionError::Initialization)`: the engine could not be built
    pub fn create(&mut self, config: &Config) -> Result<MqttClient, SessionError> {
        let identity = config.identity();
        let client_id = identity.client_id.clone();
        let bridge = EventBridge::new(client_id.as_str(), self.sink.clone());

        if let Err(e) = config.validate() {
            error!("[{}] Invalid client configuration: {}", client_id, e);
            bridge.initialization_failed(e.to_string());
            return Err(e.into());
        }
        if self.clients.contains_key(&client_id) {
            warn!("[{}] Client already exists", client_id);
            return Err(SessionError::ClientExists(client_id));
        }

        let identity = Arc::new(identity);
        let sockets = SocketFactory::new(identity.clone(), config.connect_timeout());
        let engine = match self.factory.build(&identity, sockets) {
            Ok(engine) => engine,
            Err(e) => {
                error!("[{}] Failed to build engine: {}", client_id, e);
                bridge.initialization_failed(e.to_string());
                return Err(SessionError::Initialization(e.to_string()));
            }
        };

        let client = MqttClient::spawn(
            identity,
            engine,
            bridge.clone(),
            ReconnectScheduler::new(&config.reconnect),
        );
        info!(
            "[{}] Client initialized for {}:{}",
            client_id, config.host, config.port
        );
        bridge.client_initialized();

        self.clients.insert(client_id, client.clone());
        Ok(client)
    }

    pub fn get(&self, client_id: &str) -> Option<&MqttClient> {
        self.clients.get(client_id)
    }

    fn client(&self, client_id: &str) -> Result<&MqttClient, SessionError> {
        self.clients
            .get(client_id)
            .ok_or_else(|| SessionError::ClientNotFound(client_id.to_string()))
    }

    pub fn connect(&self, client_id: &str, options: ConnectionOptions) -> Result<(), SessionError> {
        self.client(client_id)?.connect(options)
    }

    pub fn disconnect(&self, client_id: &str) -> Result<(), SessionError> {
        self.client(client_id)?.disconnect()
    }

    pub fn subscribe(
        &self,
        client_id: &str,
        subscriber_id: &str,
        topic: &str,
        qos: QoS,
    ) -> Result<SubscriptionHandle, SessionError> {
        self.client(client_id)?.subscribe(subscriber_id, topic, qos)
    }

    pub fn unsubscribe(
        &self,
        client_id: &str,
        subscriber_id: &str,
        topic: &str,
    ) -> Result<(), SessionError> {
        self.client(client_id)?.unsubscribe(subscriber_id, topic)
    }

    pub fn connection_status(&self, client_id: &str) -> Result<ConnectionStatus, SessionError> {
        Ok(self.client(client_id)?.connection_status())
    }

    /// Stops a session and forgets it.
    pub async fn remove(&mut self, client_id: &str) -> Result<(), SessionError> {
        let client = self
            .clients
            .remove(client_id)
            .ok_or_else(|| SessionError::ClientNotFound(client_id.to_string()))?;
        info!("[{}] Removing client", client_id);
        match client.shutdown().await {
            Ok(()) | Err(SessionError::SessionClosed(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Stops every session.
    pub async fn shutdown(&mut self) {
        let ids: Vec<String> = self.clients.keys().cloned().collect();
        for id in ids {
            if let Err(e) = self.remove(&id).await {
                warn!("[{}] Error during shutdown: {}", id, e);
            }
        }
    }

    pub fn client_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.clients.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use tokio::sync::mpsc;

    use super::*;
    use crate::{
        error::EngineError,
        events::{ChannelSink, MqttEvent},
        testing::{next_event, MockEngine, MockFactory},
    };

    fn manager(fail: Option<EngineError>) -> (ClientManager, mpsc::UnboundedReceiver<MqttEvent>) {
        let (sink, events) = ChannelSink::new();
        let factory = MockFactory {
            engine: MockEngine::new(),
            fail,
        };
        (ClientManager::new(Arc::new(factory), Arc::new(sink)), events)
    }

    fn config(id: &str) -> Config {
        Config {
            client_id: id.to_string(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_create_emits_client_initialize() {
        let (mut manager, mut events) = manager(None);
        let client = manager.create(&config("c1")).unwrap();
        assert_eq!(client.client_id(), "c1");

        match next_event(&mut events).await {
            MqttEvent::ClientInitialize(e) => {
                assert_eq!(e.client_id, "c1");
                assert!(e.client_init);
            }
            other => panic!("unexpected event {other:?}"),
        }
        assert_eq!(
            manager.connection_status("c1").unwrap(),
            ConnectionStatus::Disconnected
        );
    }

    #[tokio::test]
    async fn test_duplicate_client_rejected() {
        let (mut manager, _events) = manager(None);
        manager.create(&config("c1")).unwrap();
        assert!(matches!(
            manager.create(&config("c1")),
            Err(SessionError::ClientExists(id)) if id == "c1"
        ));
        assert_eq!(manager.len(), 1);
    }

    #[tokio::test]
    async fn test_invalid_config_reports_failed_initialize() {
        let (mut manager, mut events) = manager(None);
        let mut invalid = config("c1");
        invalid.host.clear();

        assert!(matches!(
            manager.create(&invalid),
            Err(SessionError::InvalidConfig(_))
        ));
        match next_event(&mut events).await {
            MqttEvent::ClientInitialize(e) => {
                assert!(!e.client_init);
                assert!(e.error_message.is_some());
            }
            other => panic!("unexpected event {other:?}"),
        }
        assert!(manager.is_empty());
    }

    #[tokio::test]
    async fn test_engine_failure_reports_failed_initialize() {
        let (mut manager, mut events) = manager(Some(EngineError::Transport("no tls".into())));
        assert!(matches!(
            manager.create(&config("c1")),
            Err(SessionError::Initialization(_))
        ));
        match next_event(&mut events).await {
            MqttEvent::ClientInitialize(e) => {
                assert!(!e.client_init);
                assert_eq!(e.error_message.as_deref(), Some("Transport failure: no tls"));
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_unknown_client_errors() {
        let (manager, _events) = manager(None);
        assert!(matches!(
            manager.connect("nope", ConnectionOptions::default()),
            Err(SessionError::ClientNotFound(_))
        ));
        assert!(matches!(
            manager.subscribe("nope", "s", "t", QoS::AtMostOnce),
            Err(SessionError::ClientNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_connect_and_remove_by_id() {
        let (mut manager, mut events) = manager(None);
        manager.create(&config("c1")).unwrap();
        assert_eq!(next_event(&mut events).await.name(), "client_initialize");

        manager.connect("c1", ConnectionOptions::default()).unwrap();
        assert_eq!(next_event(&mut events).await.name(), "connected");
        assert_eq!(
            manager.connection_status("c1").unwrap(),
            ConnectionStatus::Connected
        );

        manager.remove("c1").await.unwrap();
        assert!(manager.get("c1").is_none());
        assert!(matches!(
            manager.remove("c1").await,
            Err(SessionError::ClientNotFound(_))
        ));
    }
}
