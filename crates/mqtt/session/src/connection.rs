//! Connection kernel: the state machine behind every client.
//!
//! Each client runs one kernel task. Everything that can change the session
//! (caller requests, engine results, engine events, reconnect timers) arrives
//! as a [`Command`] on one channel and is applied in order, so connection
//! state, the subscription registry and the reconnect scheduler are never
//! touched concurrently.
//!
//! # Architecture
//!
//! ```text
//! MqttClient (handle)          engine tasks / timers
//!        \                        /
//!         +---- Command channel -+
//!                    |
//!            ConnectionKernel ---- watch<ConnectionState>
//!            |       |       \
//!     registry  scheduler   EventBridge -> host
//!                    |
//!              MqttEngine (connect / subscribe / ...)
//! ```
//!
//! Engine calls run on spawned tasks and report back as outcome commands.
//! Every connect attempt and every disconnect bumps the kernel's epoch;
//! outcomes and engine events carrying an older epoch are stale and dropped.

use std::{fmt, sync::Arc, time::Duration};

use tokio::sync::{mpsc, oneshot, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::{
    config::{ClientIdentity, ConnectionOptions, QoS},
    engine::{ConnAck, EngineEvent, EngineEvents, MqttEngine, SubAck},
    error::EngineError,
    events::{ErrorType, EventBridge, ReasonCode},
    reconnect::{ReconnectScheduler, Schedule, TimerId},
    registry::{PendingSubscribe, Removal, SubscriptionRegistry},
    state::ConnectionState,
};

/// Rewrites the connection options before each scheduled reconnect, e.g. to
/// refresh an expiring password.
#[derive(Clone)]
pub struct ReconnectInterceptor(Arc<dyn Fn(&ConnectionOptions) -> ConnectionOptions + Send + Sync>);

impl ReconnectInterceptor {
    pub fn new<F>(f: F) -> Self
    where
        F: Fn(&ConnectionOptions) -> ConnectionOptions + Send + Sync + 'static,
    {
        Self(Arc::new(f))
    }

    pub fn apply(&self, options: &ConnectionOptions) -> ConnectionOptions {
        (self.0)(options)
    }
}

impl fmt::Debug for ReconnectInterceptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ReconnectInterceptor")
    }
}

/// Point-in-time view of a client session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSnapshot {
    pub state: ConnectionState,
    pub subscriptions: usize,
    pub topics: Vec<String>,
    pub reconnect_attempt: u32,
    pub last_reconnect_delay: Option<Duration>,
    pub reconnect_pending: bool,
    pub manual_disconnect: bool,
    pub retries_exhausted: bool,
}

/// Messages processed by the kernel.
#[derive(Debug)]
pub(crate) enum Command {
    Connect(ConnectionOptions),
    Disconnect,
    Subscribe {
        subscriber_id: String,
        topic: String,
        qos: QoS,
    },
    Unsubscribe {
        subscriber_id: String,
        topic: String,
    },
    SetReconnectInterceptor(Option<ReconnectInterceptor>),
    Snapshot(oneshot::Sender<SessionSnapshot>),
    Shutdown(oneshot::Sender<()>),
    ConnectOutcome {
        epoch: u64,
        result: Result<ConnAck, EngineError>,
    },
    DisconnectOutcome {
        epoch: u64,
        result: Result<(), EngineError>,
    },
    ReconnectDue(TimerId),
    SubscribeOutcome {
        subscriber_id: String,
        topic: String,
        generation: u64,
        result: Result<SubAck, EngineError>,
    },
    UnsubscribeOutcome {
        topic: String,
        result: Result<(), EngineError>,
    },
    Engine {
        epoch: u64,
        event: EngineEvent,
    },
}

/// Channels connecting a client handle to its running kernel.
pub(crate) struct KernelHandle {
    pub(crate) commands: mpsc::UnboundedSender<Command>,
    pub(crate) state_rx: watch::Receiver<ConnectionState>,
    pub(crate) cancel: CancellationToken,
}

pub(crate) struct ConnectionKernel {
    identity: Arc<ClientIdentity>,
    engine: Arc<dyn MqttEngine>,
    bridge: EventBridge,
    registry: SubscriptionRegistry,
    scheduler: ReconnectScheduler,
    state_tx: watch::Sender<ConnectionState>,
    commands_tx: mpsc::UnboundedSender<Command>,
    commands_rx: mpsc::UnboundedReceiver<Command>,
    cancel: CancellationToken,
    epoch: u64,
    attempt: Option<CancellationToken>,
    last_options: Option<ConnectionOptions>,
    interceptor: Option<ReconnectInterceptor>,
    dropped_early: Option<(Option<u8>, Option<String>)>,
}

impl ConnectionKernel {
    /// Spawns the kernel task. Must be called from within a tokio runtime.
    pub(crate) fn start(
        identity: Arc<ClientIdentity>,
        engine: Arc<dyn MqttEngine>,
        bridge: EventBridge,
        scheduler: ReconnectScheduler,
    ) -> KernelHandle {
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);
        let cancel = CancellationToken::new();

        let kernel = ConnectionKernel {
            identity,
            engine,
            bridge,
            registry: SubscriptionRegistry::new(),
            scheduler,
            state_tx,
            commands_tx: commands_tx.clone(),
            commands_rx,
            cancel: cancel.clone(),
            epoch: 0,
            attempt: None,
            last_options: None,
            interceptor: None,
            dropped_early: None,
        };
        tokio::spawn(kernel.run());

        KernelHandle {
            commands: commands_tx,
            state_rx,
            cancel,
        }
    }

    async fn run(mut self) {
        info!("[{}] Connection kernel started", self.identity.client_id);
        loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => {
                    self.shutdown().await;
                    break;
                }
                Some(command) = self.commands_rx.recv() => {
                    self.handle(command).await;
                    if self.cancel.is_cancelled() {
                        break;
                    }
                }
            }
        }
        info!("[{}] Connection kernel stopped", self.identity.client_id);
    }

    async fn handle(&mut self, command: Command) {
        match command {
            Command::Connect(options) => self.connect(options),
            Command::Disconnect => self.disconnect(),
            Command::Subscribe {
                subscriber_id,
                topic,
                qos,
            } => self.subscribe(subscriber_id, topic, qos),
            Command::Unsubscribe {
                subscriber_id,
                topic,
            } => self.unsubscribe(&subscriber_id, topic),
            Command::SetReconnectInterceptor(interceptor) => self.interceptor = interceptor,
            Command::Snapshot(reply) => {
                let _ = reply.send(self.snapshot());
            }
            Command::Shutdown(ack) => {
                self.shutdown().await;
                let _ = ack.send(());
            }
            Command::ConnectOutcome { epoch, result } => self.on_connect_outcome(epoch, result),
            Command::DisconnectOutcome { epoch, result } => {
                self.on_disconnect_outcome(epoch, result)
            }
            Command::ReconnectDue(timer) => self.on_reconnect_due(timer),
            Command::SubscribeOutcome {
                subscriber_id,
                topic,
                generation,
                result,
            } => self.on_subscribe_outcome(&subscriber_id, &topic, generation, result),
            Command::UnsubscribeOutcome { topic, result } => {
                self.on_unsubscribe_outcome(topic, result)
            }
            Command::Engine { epoch, event } => self.on_engine_event(epoch, event),
        }
    }

    fn state(&self) -> ConnectionState {
        *self.state_tx.borrow()
    }

    /// Publishes a new state. Only notifies watchers when the state changed.
    fn update_state(&self, state: ConnectionState) {
        let changed = self.state_tx.send_if_modified(|current| {
            if *current == state {
                false
            } else {
                *current = state;
                true
            }
        });
        if changed {
            info!(
                "[{}] Connection state changed to: {}",
                self.identity.client_id, state
            );
        }
    }

    fn connect(&mut self, options: ConnectionOptions) {
        match self.state() {
            ConnectionState::Connected => {
                debug!("[{}] Already connected", self.identity.client_id);
                self.bridge.connected(ReasonCode::SUCCESS);
            }
            ConnectionState::Connecting => {
                debug!("[{}] Connect already in progress", self.identity.client_id);
            }
            ConnectionState::Disconnected | ConnectionState::Disconnecting => {
                self.scheduler.set_manual_disconnect(false);
                self.scheduler.cancel();
                self.scheduler.restore_budget();
                self.last_options = Some(options.clone());
                self.begin_attempt(options);
            }
        }
    }

    fn begin_attempt(&mut self, options: ConnectionOptions) {
        self.cancel_attempt();
        self.epoch += 1;
        self.dropped_early = None;
        self.update_state(ConnectionState::Connecting);

        let epoch = self.epoch;
        let token = CancellationToken::new();
        self.attempt = Some(token.clone());

        let engine = self.engine.clone();
        let tx = self.commands_tx.clone();
        let events = EngineEvents::new(epoch, tx.clone());
        info!(
            "[{}] Connecting to {}:{} (attempt {})",
            self.identity.client_id, self.identity.host, self.identity.port, epoch
        );
        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => trace!("Connect attempt {} cancelled", epoch),
                result = engine.connect(&options, events) => {
                    let _ = tx.send(Command::ConnectOutcome { epoch, result });
                }
            }
        });
    }

    fn cancel_attempt(&mut self) -> bool {
        match self.attempt.take() {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    fn on_connect_outcome(&mut self, epoch: u64, result: Result<ConnAck, EngineError>) {
        if epoch != self.epoch || !self.state().is_connecting() {
            debug!(
                "[{}] Ignoring stale connect outcome (epoch {}, current {})",
                self.identity.client_id, epoch, self.epoch
            );
            return;
        }
        self.attempt = None;

        match result {
            Ok(ack) => {
                info!(
                    "[{}] Connection established (session present: {})",
                    self.identity.client_id, ack.session_present
                );
                self.update_state(ConnectionState::Connected);
                self.scheduler.on_connected();
                self.bridge.connected(ReasonCode::protocol(ack.reason_code));

                match self.dropped_early.take() {
                    Some((code, message)) => self.connection_lost(code, message),
                    None => self.replay_subscriptions(),
                }
            }
            Err(e) => {
                error!("[{}] Connection failed: {}", self.identity.client_id, e);
                self.update_state(ConnectionState::Disconnected);
                self.bridge.error(ErrorType::Connection, e.to_string(), None);
                self.schedule_reconnect();
            }
        }
    }

    fn schedule_reconnect(&mut self) {
        let tx = self.commands_tx.clone();
        let schedule = self.scheduler.schedule(move |timer| {
            let _ = tx.send(Command::ReconnectDue(timer));
        });
        if let Schedule::Exhausted(e) = schedule {
            error!("[{}] Giving up reconnecting: {}", self.identity.client_id, e);
            self.bridge.error(ErrorType::Connection, e.to_string(), None);
        }
    }

    fn on_reconnect_due(&mut self, timer: TimerId) {
        if !self.scheduler.fire(timer) {
            trace!("[{}] Stale reconnect timer {}", self.identity.client_id, timer);
            return;
        }
        if self.state() != ConnectionState::Disconnected {
            debug!(
                "[{}] Reconnect skipped in state {}",
                self.identity.client_id,
                self.state()
            );
            return;
        }
        let Some(options) = self.last_options.clone() else {
            warn!("[{}] No connection options to reconnect with", self.identity.client_id);
            return;
        };
        let options = match &self.interceptor {
            Some(interceptor) => interceptor.apply(&options),
            None => options,
        };

        info!(
            "[{}] Reconnecting (retry {})",
            self.identity.client_id,
            self.scheduler.attempt()
        );
        self.begin_attempt(options);
    }

    fn disconnect(&mut self) {
        self.scheduler.set_manual_disconnect(true);
        self.dropped_early = None;

        match self.state() {
            ConnectionState::Disconnected => {
                debug!("[{}] Already disconnected", self.identity.client_id);
            }
            ConnectionState::Disconnecting => {
                debug!("[{}] Disconnect already in progress", self.identity.client_id);
            }
            ConnectionState::Connecting | ConnectionState::Connected => {
                self.cancel_attempt();
                self.epoch += 1;
                self.registry.invalidate_all();
                self.update_state(ConnectionState::Disconnecting);

                let epoch = self.epoch;
                let engine = self.engine.clone();
                let tx = self.commands_tx.clone();
                tokio::spawn(async move {
                    let result = engine.disconnect().await;
                    let _ = tx.send(Command::DisconnectOutcome { epoch, result });
                });
            }
        }
    }

    fn on_disconnect_outcome(&mut self, epoch: u64, result: Result<(), EngineError>) {
        if epoch != self.epoch || self.state() != ConnectionState::Disconnecting {
            trace!("[{}] Ignoring stale disconnect outcome", self.identity.client_id);
            return;
        }

        self.update_state(ConnectionState::Disconnected);
        match result {
            Ok(()) => self.bridge.disconnected(ReasonCode::SUCCESS, None),
            Err(e) if e.is_already_disconnected() => {
                debug!("[{}] Disconnect: {}", self.identity.client_id, e);
                self.bridge.disconnected(ReasonCode::SUCCESS, None);
            }
            Err(e) => {
                warn!("[{}] Disconnect failed: {}", self.identity.client_id, e);
                self.bridge
                    .disconnected(ReasonCode::DISCONNECTION, Some(e.to_string()));
            }
        }
    }

    fn on_engine_event(&mut self, epoch: u64, event: EngineEvent) {
        if epoch != self.epoch {
            trace!(
                "[{}] Dropping event from superseded connection {}",
                self.identity.client_id,
                epoch
            );
            return;
        }

        match event {
            EngineEvent::Disconnected {
                reason_code,
                message,
            } => match self.state() {
                ConnectionState::Connected => self.connection_lost(reason_code, message),
                ConnectionState::Connecting => {
                    debug!(
                        "[{}] Connection dropped before its outcome arrived",
                        self.identity.client_id
                    );
                    self.dropped_early = Some((reason_code, message));
                }
                ConnectionState::Disconnected | ConnectionState::Disconnecting => {}
            },
            EngineEvent::Publish {
                topic,
                qos,
                payload,
            } => {
                if !self.state().is_connected() {
                    trace!("[{}] Publish on {} while not connected", self.identity.client_id, topic);
                    return;
                }
                let deliveries = self.registry.deliveries(&topic);
                if deliveries.is_empty() {
                    debug!("[{}] No subscriber for {}", self.identity.client_id, topic);
                }
                for (subscriber_id, _) in deliveries {
                    self.bridge.message(&subscriber_id, &topic, qos, payload.clone());
                }
            }
            EngineEvent::ReceiveError(message) => {
                error!("[{}] Receive chain error: {}", self.identity.client_id, message);
                self.bridge.error(ErrorType::RxChain, message, None);
            }
        }
    }

    fn connection_lost(&mut self, reason_code: Option<u8>, message: Option<String>) {
        let message = message.unwrap_or_else(|| "Connection lost".to_string());
        warn!("[{}] Connection lost: {}", self.identity.client_id, message);

        self.update_state(ConnectionState::Disconnected);
        self.registry.invalidate_all();
        let reason = reason_code
            .map(ReasonCode::protocol)
            .unwrap_or(ReasonCode::DISCONNECTION);
        self.bridge.disconnected(reason, Some(message));
        self.schedule_reconnect();
    }

    fn subscribe(&mut self, subscriber_id: String, topic: String, qos: QoS) {
        if self.registry.insert(&subscriber_id, &topic, qos) {
            debug!(
                "[{}] Subscriber {} re-registered on {}",
                self.identity.client_id, subscriber_id, topic
            );
        }
        if !self.state().is_connected() {
            debug!(
                "[{}] Subscription to {} deferred until connected",
                self.identity.client_id, topic
            );
            return;
        }
        if let Some(pending) = self.registry.attach(&subscriber_id, &topic) {
            self.spawn_subscribe(pending);
        }
    }

    fn replay_subscriptions(&mut self) {
        let pending = self.registry.replay();
        if pending.is_empty() {
            return;
        }
        info!(
            "[{}] Restoring {} subscriptions",
            self.identity.client_id,
            pending.len()
        );
        for subscription in pending {
            self.spawn_subscribe(subscription);
        }
    }

    fn spawn_subscribe(&self, pending: PendingSubscribe) {
        let engine = self.engine.clone();
        let tx = self.commands_tx.clone();
        tokio::spawn(async move {
            let PendingSubscribe {
                subscriber_id,
                topic,
                qos,
                generation,
                cancel,
            } = pending;
            tokio::select! {
                _ = cancel.cancelled() => {}
                result = engine.subscribe(&topic, qos) => {
                    let _ = tx.send(Command::SubscribeOutcome {
                        subscriber_id,
                        topic,
                        generation,
                        result,
                    });
                }
            }
        });
    }

    fn on_subscribe_outcome(
        &mut self,
        subscriber_id: &str,
        topic: &str,
        generation: u64,
        result: Result<SubAck, EngineError>,
    ) {
        if !self
            .registry
            .confirm(subscriber_id, topic, generation, result.is_ok())
        {
            trace!("[{}] Stale subscribe outcome for {}", self.identity.client_id, topic);
            return;
        }

        match result {
            Ok(ack) => {
                debug!("[{}] Subscribed to {}", self.identity.client_id, topic);
                self.bridge
                    .subscribe_success(subscriber_id, topic, ack.granted_qos, ack.message);
            }
            Err(e) if self.scheduler.is_manual_disconnect() => {
                debug!(
                    "[{}] Subscribe error during disconnect suppressed: {}",
                    self.identity.client_id, e
                );
            }
            Err(e) => {
                warn!("[{}] Subscribe to {} failed: {}", self.identity.client_id, topic, e);
                self.bridge.subscribe_failed(subscriber_id, e.to_string());
            }
        }
    }

    fn unsubscribe(&mut self, subscriber_id: &str, topic: String) {
        match self.registry.remove(subscriber_id, &topic) {
            Removal::Missing => {
                debug!(
                    "[{}] Nothing to unsubscribe for {} on {}",
                    self.identity.client_id, subscriber_id, topic
                );
            }
            Removal::Remaining(count) => {
                debug!(
                    "[{}] {} subscribers remain on {}",
                    self.identity.client_id, count, topic
                );
            }
            Removal::Last if self.state().is_connected() => {
                let engine = self.engine.clone();
                let tx = self.commands_tx.clone();
                tokio::spawn(async move {
                    let result = engine.unsubscribe(&topic).await;
                    let _ = tx.send(Command::UnsubscribeOutcome { topic, result });
                });
            }
            Removal::Last => {
                debug!(
                    "[{}] Last subscriber left {} while offline",
                    self.identity.client_id, topic
                );
            }
        }
    }

    fn on_unsubscribe_outcome(&mut self, topic: String, result: Result<(), EngineError>) {
        match result {
            Ok(()) => debug!("[{}] Unsubscribed from {}", self.identity.client_id, topic),
            Err(e) if self.scheduler.is_manual_disconnect() => {
                debug!(
                    "[{}] Unsubscribe error during disconnect suppressed: {}",
                    self.identity.client_id, e
                );
            }
            Err(e) => {
                warn!(
                    "[{}] Unsubscribe from {} failed: {}",
                    self.identity.client_id, topic, e
                );
                self.bridge
                    .error(ErrorType::Unsubscription, e.to_string(), Some(topic));
            }
        }
    }

    fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            state: self.state(),
            subscriptions: self.registry.len(),
            topics: self.registry.topics(),
            reconnect_attempt: self.scheduler.attempt(),
            last_reconnect_delay: self.scheduler.last_delay(),
            reconnect_pending: self.scheduler.is_pending(),
            manual_disconnect: self.scheduler.is_manual_disconnect(),
            retries_exhausted: self.scheduler.is_exhausted(),
        }
    }

    async fn shutdown(&mut self) {
        info!("[{}] Shutting down session", self.identity.client_id);
        self.cancel_attempt();
        self.scheduler.set_manual_disconnect(true);
        self.registry.invalidate_all();
        self.epoch += 1;

        if self.state() != ConnectionState::Disconnected {
            if let Err(e) = self.engine.disconnect().await {
                if !e.is_already_disconnected() {
                    warn!("[{}] Error during shutdown disconnect: {}", self.identity.client_id, e);
                }
            }
            self.update_state(ConnectionState::Disconnected);
        }
        self.cancel.cancel();
    }
}
