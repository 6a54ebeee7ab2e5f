//! Scripted engine and helpers shared by the session tests.

use std::{
    collections::{HashSet, VecDeque},
    sync::{Arc, Mutex, MutexGuard},
    time::Duration,
};

use async_trait::async_trait;
use bytes::Bytes;
use futures::{channel::mpsc as frames, SinkExt};
use tokio::sync::{mpsc, oneshot};

use crate::{
    client::MqttClient,
    config::{ClientIdentity, ConnectionOptions, QoS, ReconnectConfig},
    engine::{ConnAck, EngineEvents, EngineFactory, MqttEngine, SubAck},
    error::{EngineError, TransportError},
    events::{ChannelSink, EventBridge, MqttEvent},
    reconnect::ReconnectScheduler,
    socket::SocketFactory,
    websocket::{Frame, FrameChannel, FrameConnector, HandshakeRequest},
};

pub(crate) const CLIENT_ID: &str = "test-client";

enum ConnectStep {
    Fail(EngineError),
    Hold(oneshot::Receiver<Result<ConnAck, EngineError>>),
}

#[derive(Default)]
struct MockState {
    connect_calls: usize,
    disconnect_calls: usize,
    subscribe_calls: Vec<(String, QoS)>,
    unsubscribe_calls: Vec<String>,
    connect_script: VecDeque<ConnectStep>,
    held_subscribes: VecDeque<oneshot::Receiver<Result<SubAck, EngineError>>>,
    failing_topics: HashSet<String>,
    unsubscribe_error: Option<EngineError>,
    disconnect_error: Option<EngineError>,
    last_options: Option<ConnectionOptions>,
    events: Option<EngineEvents>,
}

/// Engine that accepts everything unless told otherwise.
#[derive(Default)]
pub(crate) struct MockEngine {
    state: Mutex<MockState>,
}

impl MockEngine {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn lock(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap()
    }

    pub(crate) fn fail_next_connect(&self, error: EngineError) {
        self.lock().connect_script.push_back(ConnectStep::Fail(error));
    }

    /// Parks the next connect until the returned sender resolves it.
    pub(crate) fn hold_next_connect(&self) -> oneshot::Sender<Result<ConnAck, EngineError>> {
        let (tx, rx) = oneshot::channel();
        self.lock().connect_script.push_back(ConnectStep::Hold(rx));
        tx
    }

    pub(crate) fn hold_next_subscribe(&self) -> oneshot::Sender<Result<SubAck, EngineError>> {
        let (tx, rx) = oneshot::channel();
        self.lock().held_subscribes.push_back(rx);
        tx
    }

    pub(crate) fn fail_subscribe(&self, topic: &str) {
        self.lock().failing_topics.insert(topic.to_string());
    }

    pub(crate) fn fail_next_unsubscribe(&self, error: EngineError) {
        self.lock().unsubscribe_error = Some(error);
    }

    pub(crate) fn fail_next_disconnect(&self, error: EngineError) {
        self.lock().disconnect_error = Some(error);
    }

    pub(crate) fn connect_calls(&self) -> usize {
        self.lock().connect_calls
    }

    pub(crate) fn disconnect_calls(&self) -> usize {
        self.lock().disconnect_calls
    }

    pub(crate) fn subscribe_calls(&self) -> Vec<(String, QoS)> {
        self.lock().subscribe_calls.clone()
    }

    pub(crate) fn clear_subscribe_calls(&self) {
        self.lock().subscribe_calls.clear();
    }

    pub(crate) fn unsubscribe_calls(&self) -> Vec<String> {
        self.lock().unsubscribe_calls.clone()
    }

    pub(crate) fn last_options(&self) -> Option<ConnectionOptions> {
        self.lock().last_options.clone()
    }

    fn events(&self) -> Option<EngineEvents> {
        self.lock().events.clone()
    }

    /// Simulates the broker dropping the current connection.
    pub(crate) fn drop_connection(&self, reason_code: Option<u8>, message: Option<String>) -> bool {
        self.events()
            .is_some_and(|events| events.disconnected(reason_code, message))
    }

    pub(crate) fn publish(&self, topic: &str, qos: QoS, payload: Bytes) -> bool {
        self.events()
            .is_some_and(|events| events.publish(topic, qos, payload))
    }

    pub(crate) fn receive_error(&self, message: &str) -> bool {
        self.events()
            .is_some_and(|events| events.receive_error(message))
    }
}

#[async_trait]
impl MqttEngine for MockEngine {
    async fn connect(
        &self,
        options: &ConnectionOptions,
        events: EngineEvents,
    ) -> Result<ConnAck, EngineError> {
        let step = {
            let mut state = self.lock();
            state.connect_calls += 1;
            state.last_options = Some(options.clone());
            state.events = Some(events);
            state.connect_script.pop_front()
        };
        match step {
            None => Ok(ConnAck::default()),
            Some(ConnectStep::Fail(error)) => Err(error),
            Some(ConnectStep::Hold(rx)) => rx.await.unwrap_or(Err(EngineError::Closed)),
        }
    }

    async fn disconnect(&self) -> Result<(), EngineError> {
        let mut state = self.lock();
        state.disconnect_calls += 1;
        match state.disconnect_error.take() {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    async fn subscribe(&self, topic: &str, qos: QoS) -> Result<SubAck, EngineError> {
        let held = {
            let mut state = self.lock();
            state.subscribe_calls.push((topic.to_string(), qos));
            if state.failing_topics.contains(topic) {
                return Err(EngineError::SubscriptionRejected {
                    topic: topic.to_string(),
                    message: "not authorized".into(),
                });
            }
            state.held_subscribes.pop_front()
        };
        match held {
            Some(rx) => rx.await.unwrap_or(Err(EngineError::Closed)),
            None => Ok(SubAck::granted(qos)),
        }
    }

    async fn unsubscribe(&self, topic: &str) -> Result<(), EngineError> {
        let mut state = self.lock();
        state.unsubscribe_calls.push(topic.to_string());
        match state.unsubscribe_error.take() {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }
}

/// Factory handing out one shared [`MockEngine`].
pub(crate) struct MockFactory {
    pub(crate) engine: Arc<MockEngine>,
    pub(crate) fail: Option<EngineError>,
}

impl EngineFactory for MockFactory {
    fn build(
        &self,
        _identity: &ClientIdentity,
        _sockets: SocketFactory,
    ) -> Result<Arc<dyn MqttEngine>, EngineError> {
        match &self.fail {
            Some(error) => Err(error.clone()),
            None => Ok(self.engine.clone()),
        }
    }
}

pub(crate) struct Harness {
    pub(crate) client: MqttClient,
    pub(crate) engine: Arc<MockEngine>,
    pub(crate) events: mpsc::UnboundedReceiver<MqttEvent>,
}

/// Starts a session backed by a fresh [`MockEngine`].
pub(crate) fn harness(reconnect: ReconnectConfig) -> Harness {
    let engine = MockEngine::new();
    let (sink, events) = ChannelSink::new();
    let identity = Arc::new(ClientIdentity::raw(CLIENT_ID, "broker.local", 1883));
    let client = MqttClient::spawn(
        identity,
        engine.clone(),
        EventBridge::new(CLIENT_ID, Arc::new(sink)),
        ReconnectScheduler::new(&reconnect),
    );
    Harness {
        client,
        engine,
        events,
    }
}

pub(crate) async fn next_event(events: &mut mpsc::UnboundedReceiver<MqttEvent>) -> MqttEvent {
    tokio::time::timeout(Duration::from_secs(600), events.recv())
        .await
        .expect("timed out waiting for event")
        .expect("event channel closed")
}

/// Lets pending tasks run, then asserts nothing was emitted.
pub(crate) async fn expect_quiet(events: &mut mpsc::UnboundedReceiver<MqttEvent>) {
    for _ in 0..32 {
        tokio::task::yield_now().await;
    }
    if let Ok(event) = events.try_recv() {
        panic!("unexpected event {event:?}");
    }
}

/// Server side of an in-memory websocket.
pub(crate) struct Peer {
    pub(crate) request: HandshakeRequest,
    /// frames written by the client
    pub(crate) inbound: frames::UnboundedReceiver<Frame>,
    /// frames delivered to the client
    pub(crate) outbound: frames::UnboundedSender<Result<Frame, TransportError>>,
}

impl Peer {
    /// Delivers `data` to the client as one binary frame.
    pub(crate) fn send_binary(&self, data: impl Into<Bytes>) {
        self.outbound
            .unbounded_send(Ok(Frame::Binary(data.into())))
            .unwrap();
    }
}

/// [`FrameConnector`] handing the server side of every connection to the test.
pub(crate) struct MemoryConnector {
    peers: mpsc::UnboundedSender<Peer>,
}

impl MemoryConnector {
    pub(crate) fn new() -> (Self, mpsc::UnboundedReceiver<Peer>) {
        let (peers, rx) = mpsc::unbounded_channel();
        (Self { peers }, rx)
    }
}

#[async_trait]
impl FrameConnector for MemoryConnector {
    async fn connect(&self, request: HandshakeRequest) -> Result<FrameChannel, TransportError> {
        let (to_peer, inbound) = frames::unbounded();
        let (outbound, from_peer) = frames::unbounded();
        self.peers
            .send(Peer {
                request,
                inbound,
                outbound,
            })
            .map_err(|_| TransportError::Closed("test ended".into()))?;

        Ok(FrameChannel {
            sink: Box::pin(to_peer.sink_map_err(|e| TransportError::Closed(e.to_string()))),
            stream: Box::pin(from_peer),
        })
    }
}
