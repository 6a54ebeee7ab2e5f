//! [`MqttEngine`] backed by rumqttc.
//!
//! rumqttc speaks MQTT 3.1.1 over TCP, TLS and websockets on its own, so this
//! engine opens its transport from the client identity instead of going
//! through a [`SocketFactory`] socket. [`RumqttcEngineFactory`] uses it for
//! raw stream clients; framed websocket clients get a
//! [`StreamEngine`](crate::stream_engine::StreamEngine) over the socket
//! adapter.
//!
//! # Architecture
//!
//! ```text
//! RumqttcEngine::connect
//!     ↓ polls the EventLoop until CONNACK
//! driver task (one per connection)
//!     ↓ Publish / SUBACK / Disconnect / errors
//! EngineEvents + AckTracker
//! ```
//!
//! SUBACKs are matched to their `subscribe` call through the packet id
//! rumqttc reports when the SUBSCRIBE leaves the client. Requests leave in the
//! order they were queued, so a FIFO of waiting callers is enough.

use std::{
    collections::{HashMap, VecDeque},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, PoisonError,
    },
    time::Duration,
};

use async_trait::async_trait;
use futures::future;
use rumqttc::{
    AsyncClient, ConnectReturnCode, ConnectionError, Event, EventLoop, MqttOptions, Outgoing,
    Packet, SubscribeReasonCode, Transport,
};
use tokio::{sync::oneshot, task::JoinHandle};
use tokio_tungstenite::tungstenite::http::{
    header::SEC_WEBSOCKET_PROTOCOL, HeaderName, HeaderValue, Request,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::{
    config::{ClientIdentity, ConnectionOptions, QoS, TransportKind},
    engine::{ConnAck, EngineEvents, EngineFactory, MqttEngine, SubAck},
    error::{root_cause, EngineError},
    socket::SocketFactory,
    stream_engine::StreamEngine,
    websocket::MQTT_SUBPROTOCOL,
};

/// Default capacity of the rumqttc request channel.
pub const DEFAULT_REQUEST_CAPACITY: usize = 10;

/// Time allowed for a DISCONNECT to be flushed before the driver is stopped.
const DISCONNECT_GRACE: Duration = Duration::from_secs(5);

type SubscribeReply = oneshot::Sender<Result<SubAck, EngineError>>;

/// Callers waiting for a SUBACK.
#[derive(Default)]
struct AckTracker {
    queued: VecDeque<(String, SubscribeReply)>,
    inflight: HashMap<u16, (String, SubscribeReply)>,
    closing: bool,
}

impl AckTracker {
    fn queue(&mut self, topic: &str, reply: SubscribeReply) {
        self.queued.push_back((topic.to_string(), reply));
    }

    fn unqueue_last(&mut self) {
        self.queued.pop_back();
    }

    /// The next queued SUBSCRIBE left with `pkid`.
    fn sent(&mut self, pkid: u16) {
        if let Some(waiter) = self.queued.pop_front() {
            self.inflight.insert(pkid, waiter);
        }
    }

    fn acked(&mut self, ack: &rumqttc::SubAck) {
        let Some((topic, reply)) = self.inflight.remove(&ack.pkid) else {
            trace!("SUBACK for unknown packet {}", ack.pkid);
            return;
        };
        let result = match ack.return_codes.first() {
            Some(SubscribeReasonCode::Success(qos)) => Ok(SubAck::granted(qos_from_rumqttc(*qos))),
            Some(SubscribeReasonCode::Failure) | None => Err(EngineError::SubscriptionRejected {
                topic,
                message: "Broker returned failure".to_string(),
            }),
        };
        let _ = reply.send(result);
    }

    /// Resolves every waiter with `NotConnected`.
    fn fail_all(&mut self) {
        for (_, reply) in self.queued.drain(..) {
            let _ = reply.send(Err(EngineError::NotConnected));
        }
        for (_, (_, reply)) in self.inflight.drain() {
            let _ = reply.send(Err(EngineError::NotConnected));
        }
    }

    fn waiting(&self) -> usize {
        self.queued.len() + self.inflight.len()
    }
}

type SharedTracker = Arc<Mutex<AckTracker>>;

fn lock(tracker: &SharedTracker) -> std::sync::MutexGuard<'_, AckTracker> {
    tracker.lock().unwrap_or_else(PoisonError::into_inner)
}

struct ActiveSession {
    client: AsyncClient,
    tracker: SharedTracker,
    cancel: CancellationToken,
    driver: JoinHandle<()>,
}

/// rumqttc-backed protocol engine for one client.
pub struct RumqttcEngine {
    identity: Arc<ClientIdentity>,
    connect_timeout: Duration,
    capacity: usize,
    session: tokio::sync::Mutex<Option<ActiveSession>>,
    /// Bumped by every `disconnect`; a connect that saw another value at its
    /// start must not install its session.
    disconnects: AtomicU64,
}

impl RumqttcEngine {
    pub fn new(identity: Arc<ClientIdentity>, connect_timeout: Duration) -> Self {
        Self {
            identity,
            connect_timeout,
            capacity: DEFAULT_REQUEST_CAPACITY,
            session: tokio::sync::Mutex::new(None),
            disconnects: AtomicU64::new(0),
        }
    }

    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity.max(1);
        self
    }

    /// Translates the identity and per-connect options into rumqttc options.
    fn mqtt_options(&self, options: &ConnectionOptions) -> MqttOptions {
        let identity = &self.identity;
        let (broker, transport) = match (identity.transport, identity.tls) {
            (TransportKind::RawStream, false) => (identity.host.clone(), Transport::Tcp),
            (TransportKind::RawStream, true) => {
                (identity.host.clone(), Transport::tls_with_default_config())
            }
            (TransportKind::FramedWebSocket, false) => (identity.web_socket_url(), Transport::Ws),
            (TransportKind::FramedWebSocket, true) => {
                (identity.web_socket_url(), Transport::wss_with_default_config())
            }
        };

        let mut opts = MqttOptions::new(identity.client_id.clone(), broker, identity.port);
        opts.set_keep_alive(options.keep_alive.max(Duration::from_secs(1)));
        opts.set_clean_session(options.clean_session);
        if let Some(username) = &options.username {
            opts.set_credentials(username.clone(), options.password.clone().unwrap_or_default());
        }
        opts.set_transport(transport);
        if identity.transport == TransportKind::FramedWebSocket {
            let headers = handshake_headers(&identity.client_id, &identity.web_socket_headers);
            opts.set_request_modifier(move |mut request: Request<()>| {
                let fields = request.headers_mut();
                for (name, value) in &headers {
                    fields.insert(name.clone(), value.clone());
                }
                fields.insert(
                    SEC_WEBSOCKET_PROTOCOL,
                    HeaderValue::from_static(MQTT_SUBPROTOCOL),
                );
                future::ready(request)
            });
        }
        opts
    }

    async fn stop_session(&self) {
        if let Some(previous) = self.session.lock().await.take() {
            debug!("[{}] Stopping previous connection", self.identity.client_id);
            previous.cancel.cancel();
            lock(&previous.tracker).fail_all();
        }
    }
}

#[async_trait]
impl MqttEngine for RumqttcEngine {
    async fn connect(
        &self,
        options: &ConnectionOptions,
        events: EngineEvents,
    ) -> Result<ConnAck, EngineError> {
        let generation = self.disconnects.load(Ordering::SeqCst);
        self.stop_session().await;

        let (client, mut event_loop) = AsyncClient::new(self.mqtt_options(options), self.capacity);
        let ack = tokio::time::timeout(self.connect_timeout, wait_for_connack(&mut event_loop))
            .await
            .map_err(|_| {
                EngineError::Transport(format!("Connect timed out after {:?}", self.connect_timeout))
            })??;

        info!(
            "[{}] CONNACK received (session present: {})",
            self.identity.client_id, ack.session_present
        );

        // The driver is only spawned with the slot held, so a connect dropped
        // while waiting for it leaves no task behind.
        let mut slot = self.session.lock().await;
        if self.disconnects.load(Ordering::SeqCst) != generation {
            info!(
                "[{}] Disconnect requested while connecting, closing connection",
                self.identity.client_id
            );
            return Err(EngineError::NotConnected);
        }
        let tracker = SharedTracker::default();
        let cancel = CancellationToken::new();
        let driver = tokio::spawn(drive(
            self.identity.client_id.clone(),
            event_loop,
            events,
            tracker.clone(),
            cancel.clone(),
        ));
        *slot = Some(ActiveSession {
            client,
            tracker,
            cancel,
            driver,
        });
        Ok(ack)
    }

    async fn disconnect(&self) -> Result<(), EngineError> {
        self.disconnects.fetch_add(1, Ordering::SeqCst);
        let Some(mut session) = self.session.lock().await.take() else {
            return Err(EngineError::AlreadyDisconnected);
        };
        {
            let mut tracker = lock(&session.tracker);
            tracker.closing = true;
            tracker.fail_all();
        }

        if let Err(e) = session.client.disconnect().await {
            session.cancel.cancel();
            return Err(EngineError::Transport(e.to_string()));
        }
        if tokio::time::timeout(DISCONNECT_GRACE, &mut session.driver)
            .await
            .is_err()
        {
            warn!(
                "[{}] DISCONNECT not flushed within {:?}",
                self.identity.client_id, DISCONNECT_GRACE
            );
        }
        session.cancel.cancel();
        Ok(())
    }

    async fn subscribe(&self, topic: &str, qos: QoS) -> Result<SubAck, EngineError> {
        let reply = {
            let guard = self.session.lock().await;
            let session = guard.as_ref().ok_or(EngineError::NotConnected)?;
            let (tx, rx) = oneshot::channel();
            lock(&session.tracker).queue(topic, tx);
            if let Err(e) = session.client.subscribe(topic, qos_to_rumqttc(qos)).await {
                lock(&session.tracker).unqueue_last();
                return Err(EngineError::Transport(e.to_string()));
            }
            rx
        };
        reply.await.map_err(|_| EngineError::NotConnected)?
    }

    async fn unsubscribe(&self, topic: &str) -> Result<(), EngineError> {
        let guard = self.session.lock().await;
        let session = guard.as_ref().ok_or(EngineError::NotConnected)?;
        session
            .client
            .unsubscribe(topic)
            .await
            .map_err(|e| EngineError::Transport(e.to_string()))
    }
}

async fn wait_for_connack(event_loop: &mut EventLoop) -> Result<ConnAck, EngineError> {
    loop {
        match event_loop.poll().await {
            Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                let code = return_code(ack.code);
                return if ack.code == ConnectReturnCode::Success {
                    Ok(ConnAck {
                        reason_code: code,
                        session_present: ack.session_present,
                    })
                } else {
                    Err(refused(ack.code))
                };
            }
            Ok(event) => trace!("Event before CONNACK: {:?}", event),
            Err(ConnectionError::ConnectionRefused(code)) => return Err(refused(code)),
            Err(e) => return Err(EngineError::Transport(root_cause(&e))),
        }
    }
}

/// Pumps the event loop of one established connection.
async fn drive(
    client_id: String,
    mut event_loop: EventLoop,
    events: EngineEvents,
    tracker: SharedTracker,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            polled = event_loop.poll() => match polled {
                Ok(Event::Incoming(Packet::Publish(publish))) => {
                    events.publish(publish.topic, qos_from_rumqttc(publish.qos), publish.payload);
                }
                Ok(Event::Incoming(Packet::SubAck(ack))) => lock(&tracker).acked(&ack),
                Ok(Event::Incoming(Packet::Disconnect)) => {
                    warn!("[{}] Disconnected by broker", client_id);
                    lock(&tracker).fail_all();
                    events.disconnected(None, Some("Disconnected by broker".to_string()));
                    break;
                }
                Ok(Event::Outgoing(Outgoing::Subscribe(pkid))) => lock(&tracker).sent(pkid),
                Ok(Event::Outgoing(Outgoing::Disconnect)) => {
                    debug!("[{}] DISCONNECT sent", client_id);
                    break;
                }
                Ok(_) => {}
                Err(e) => {
                    let closing = {
                        let mut tracker = lock(&tracker);
                        tracker.fail_all();
                        tracker.closing
                    };
                    if closing {
                        debug!("[{}] Event loop closed: {}", client_id, e);
                        break;
                    }
                    let message = root_cause(&e);
                    error!("[{}] Connection error: {}", client_id, message);
                    if is_receive_failure(&e) {
                        events.receive_error(message.clone());
                    }
                    let code = match &e {
                        ConnectionError::ConnectionRefused(code) => Some(return_code(*code)),
                        _ => None,
                    };
                    events.disconnected(code, Some(message));
                    break;
                }
            }
        }
    }
    trace!("[{}] Event loop driver stopped", client_id);
}

/// Errors raised while decoding or tracking inbound packets, as opposed to
/// the network going away.
fn is_receive_failure(err: &ConnectionError) -> bool {
    matches!(err, ConnectionError::MqttState(_) | ConnectionError::NotConnAck(_))
}

/// Parses configured handshake headers, skipping the ones that are not valid
/// HTTP.
fn handshake_headers(
    client_id: &str,
    headers: &HashMap<String, String>,
) -> Vec<(HeaderName, HeaderValue)> {
    headers
        .iter()
        .filter_map(|(name, value)| {
            match (
                HeaderName::from_bytes(name.as_bytes()),
                HeaderValue::from_str(value),
            ) {
                (Ok(name), Ok(value)) => Some((name, value)),
                _ => {
                    warn!("[{}] Skipping invalid websocket header '{}'", client_id, name);
                    None
                }
            }
        })
        .collect()
}

pub(crate) fn refused(code: ConnectReturnCode) -> EngineError {
    EngineError::Refused {
        code: return_code(code),
        message: format!("{code:?}"),
    }
}

/// MQTT 3.1.1 CONNACK return code.
pub(crate) fn return_code(code: ConnectReturnCode) -> u8 {
    match code {
        ConnectReturnCode::Success => 0,
        ConnectReturnCode::RefusedProtocolVersion => 1,
        ConnectReturnCode::BadClientId => 2,
        ConnectReturnCode::ServiceUnavailable => 3,
        ConnectReturnCode::BadUserNamePassword => 4,
        ConnectReturnCode::NotAuthorized => 5,
    }
}

pub(crate) fn qos_to_rumqttc(qos: QoS) -> rumqttc::QoS {
    match qos {
        QoS::AtMostOnce => rumqttc::QoS::AtMostOnce,
        QoS::AtLeastOnce => rumqttc::QoS::AtLeastOnce,
        QoS::ExactlyOnce => rumqttc::QoS::ExactlyOnce,
    }
}

pub(crate) fn qos_from_rumqttc(qos: rumqttc::QoS) -> QoS {
    match qos {
        rumqttc::QoS::AtMostOnce => QoS::AtMostOnce,
        rumqttc::QoS::AtLeastOnce => QoS::AtLeastOnce,
        rumqttc::QoS::ExactlyOnce => QoS::ExactlyOnce,
    }
}

/// Builds the engine matching each client's transport: a [`StreamEngine`]
/// over the socket adapter for framed websocket clients, a
/// [`RumqttcEngine`] for raw stream clients.
#[derive(Debug, Clone)]
pub struct RumqttcEngineFactory {
    capacity: usize,
}

impl RumqttcEngineFactory {
    pub fn new(capacity: usize) -> Self {
        Self { capacity }
    }
}

impl Default for RumqttcEngineFactory {
    fn default() -> Self {
        Self::new(DEFAULT_REQUEST_CAPACITY)
    }
}

impl EngineFactory for RumqttcEngineFactory {
    fn build(
        &self,
        identity: &ClientIdentity,
        sockets: SocketFactory,
    ) -> Result<Arc<dyn MqttEngine>, EngineError> {
        let identity = Arc::new(identity.clone());
        match identity.transport {
            TransportKind::FramedWebSocket => Ok(Arc::new(StreamEngine::new(identity, sockets))),
            TransportKind::RawStream => {
                let engine = RumqttcEngine::new(identity, sockets.connect_timeout())
                    .with_capacity(self.capacity);
                Ok(Arc::new(engine))
            }
        }
    }
}
