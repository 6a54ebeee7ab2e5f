//! [`MqttEngine`] speaking MQTT 3.1.1 over a [`ByteStreamSocket`].
//!
//! Packets are encoded and decoded with rumqttc's `mqttbytes` codec. The
//! socket comes from the client's [`SocketFactory`], so framed websocket
//! clients run through [`WebSocketAdapter`](crate::websocket::WebSocketAdapter)
//! and plain TCP clients through [`TcpSocket`](crate::tcp::TcpSocket).
//!
//! # Reading
//!
//! The reader never asks for more than the codec is missing: two bytes for
//! the fixed header, one per extra remaining-length byte, then the body.
//! Only one read is outstanding at a time.
//!
//! ```text
//! read(2)  -> 0x30 0x8a        PUBLISH, length continues
//! read(1)  -> 0x01             remaining length = 138
//! read(138)-> topic + payload
//! ```

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicI64, AtomicU64, Ordering},
        Arc, Mutex, MutexGuard, PoisonError,
    },
    time::Duration,
};

use async_trait::async_trait;
use bytes::BytesMut;
use rumqttc::{
    mqttbytes::{self, v4},
    ConnectReturnCode, SubscribeReasonCode,
};
use tokio::{
    sync::{mpsc, oneshot},
    time::{self, Instant, MissedTickBehavior},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::{
    config::{ClientIdentity, ConnectionOptions, QoS},
    engine::{ConnAck, EngineEvents, MqttEngine, SubAck},
    error::EngineError,
    rumqttc_engine::{qos_from_rumqttc, qos_to_rumqttc, refused},
    socket::{ByteStreamSocket, SocketEvent, SocketFactory, Tag},
};

/// Largest inbound packet accepted, matching rumqttc's default.
pub const MAX_PACKET_SIZE: usize = 10 * 1024;

/// Time allowed for a DISCONNECT to be written before the socket is closed.
const DISCONNECT_GRACE: Duration = Duration::from_secs(5);

type SubscribeReply = oneshot::Sender<Result<SubAck, EngineError>>;

/// Requests waiting on the broker, plus the packet id counter.
#[derive(Default)]
struct Inflight {
    last_pkid: u16,
    subscribes: HashMap<u16, (String, SubscribeReply)>,
    flush: Option<(Tag, oneshot::Sender<()>)>,
    closing: bool,
}

impl Inflight {
    fn next_pkid(&mut self) -> u16 {
        self.last_pkid = self.last_pkid.wrapping_add(1).max(1);
        self.last_pkid
    }

    fn acked(&mut self, ack: v4::SubAck) {
        let Some((topic, reply)) = self.subscribes.remove(&ack.pkid) else {
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

    fn written(&mut self, tag: Tag) {
        if self.flush.as_ref().is_some_and(|(pending, _)| *pending == tag) {
            if let Some((_, done)) = self.flush.take() {
                let _ = done.send(());
            }
        }
    }

    /// Resolves every waiter; pending subscribes fail with `NotConnected`.
    fn fail_all(&mut self) {
        for (_, (_, reply)) in self.subscribes.drain() {
            let _ = reply.send(Err(EngineError::NotConnected));
        }
        self.flush = None;
    }
}

type SharedInflight = Arc<Mutex<Inflight>>;

fn lock(inflight: &Mutex<Inflight>) -> MutexGuard<'_, Inflight> {
    inflight.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Write side of a connection.
struct Outbound {
    socket: Arc<dyn ByteStreamSocket>,
    next_tag: AtomicI64,
}

impl Outbound {
    fn new(socket: Arc<dyn ByteStreamSocket>) -> Self {
        Self {
            socket,
            next_tag: AtomicI64::new(1),
        }
    }

    /// Encodes one packet and queues it as a single write.
    fn send<F>(&self, encode: F) -> Result<Tag, EngineError>
    where
        F: FnOnce(&mut BytesMut) -> Result<usize, mqttbytes::Error>,
    {
        let mut buf = BytesMut::new();
        encode(&mut buf).map_err(|e| EngineError::Protocol(e.to_string()))?;
        let tag = self.next_tag.fetch_add(1, Ordering::Relaxed);
        self.socket.write(buf.freeze(), tag);
        Ok(tag)
    }
}

/// Read side of a connection: turns socket events back into packets.
struct PacketReader {
    socket: Arc<dyn ByteStreamSocket>,
    events: mpsc::UnboundedReceiver<SocketEvent>,
    inflight: SharedInflight,
    buffer: BytesMut,
    next_tag: Tag,
    outstanding: Option<Tag>,
}

impl PacketReader {
    fn new(
        socket: Arc<dyn ByteStreamSocket>,
        events: mpsc::UnboundedReceiver<SocketEvent>,
        inflight: SharedInflight,
    ) -> Self {
        Self {
            socket,
            events,
            inflight,
            buffer: BytesMut::new(),
            next_tag: 0,
            outstanding: None,
        }
    }

    /// Next complete packet. Cancel safe: progress lives in `self`.
    async fn next_packet(&mut self) -> Result<v4::Packet, EngineError> {
        loop {
            match v4::read(&mut self.buffer, MAX_PACKET_SIZE) {
                Ok(packet) => return Ok(packet),
                Err(mqttbytes::Error::InsufficientBytes(missing)) => {
                    if self.outstanding.is_none() {
                        self.next_tag += 1;
                        self.outstanding = Some(self.next_tag);
                        self.socket.read_data(missing, self.next_tag);
                    }
                    self.fill().await?;
                }
                Err(e) => return Err(EngineError::Protocol(e.to_string())),
            }
        }
    }

    async fn fill(&mut self) -> Result<(), EngineError> {
        loop {
            match self.events.recv().await {
                Some(SocketEvent::Read { tag, data }) => {
                    if self.outstanding == Some(tag) {
                        self.outstanding = None;
                    }
                    self.buffer.extend_from_slice(&data);
                    return Ok(());
                }
                Some(SocketEvent::Written { tag }) => lock(&self.inflight).written(tag),
                Some(SocketEvent::Connected) => {}
                Some(SocketEvent::Disconnected { error }) => {
                    return Err(EngineError::Transport(
                        error.unwrap_or_else(|| "Connection closed by peer".to_string()),
                    ));
                }
                None => return Err(EngineError::Transport("Socket closed".to_string())),
            }
        }
    }
}

/// Closes a socket that never made it into a [`Link`].
struct Unclaimed(Option<Arc<dyn ByteStreamSocket>>);

impl Unclaimed {
    fn claim(mut self) {
        self.0 = None;
    }
}

impl Drop for Unclaimed {
    fn drop(&mut self) {
        if let Some(socket) = self.0.take() {
            socket.disconnect();
        }
    }
}

/// One established connection.
struct Link {
    outbound: Arc<Outbound>,
    inflight: SharedInflight,
    cancel: CancellationToken,
}

impl Link {
    fn close(&self) {
        self.cancel.cancel();
        lock(&self.inflight).fail_all();
        self.outbound.socket.disconnect();
    }
}

/// Protocol engine running MQTT over a socket from a [`SocketFactory`].
pub struct StreamEngine {
    identity: Arc<ClientIdentity>,
    sockets: SocketFactory,
    link: tokio::sync::Mutex<Option<Link>>,
    /// Bumped by every `disconnect`; a connect that saw another value at its
    /// start must not install its link.
    disconnects: AtomicU64,
}

impl StreamEngine {
    pub fn new(identity: Arc<ClientIdentity>, sockets: SocketFactory) -> Self {
        Self {
            identity,
            sockets,
            link: tokio::sync::Mutex::new(None),
            disconnects: AtomicU64::new(0),
        }
    }

    async fn stop_link(&self) {
        if let Some(previous) = self.link.lock().await.take() {
            debug!("[{}] Closing previous connection", self.identity.client_id);
            previous.close();
        }
    }
}

#[async_trait]
impl MqttEngine for StreamEngine {
    async fn connect(
        &self,
        options: &ConnectionOptions,
        events: EngineEvents,
    ) -> Result<ConnAck, EngineError> {
        let generation = self.disconnects.load(Ordering::SeqCst);
        self.stop_link().await;

        let (socket, socket_events) = self.sockets.connect().await?;
        let socket: Arc<dyn ByteStreamSocket> = Arc::from(socket);
        let unclaimed = Unclaimed(Some(socket.clone()));

        let inflight = SharedInflight::default();
        let outbound = Arc::new(Outbound::new(socket.clone()));
        let mut reader = PacketReader::new(socket, socket_events, inflight.clone());

        let connect = connect_packet(&self.identity.client_id, options);
        outbound.send(|buf| connect.write(buf))?;
        let timeout = self.sockets.connect_timeout();
        let ack = time::timeout(timeout, wait_for_connack(&mut reader))
            .await
            .map_err(|_| EngineError::Transport(format!("No CONNACK within {timeout:?}")))??;
        info!(
            "[{}] CONNACK received (session present: {})",
            self.identity.client_id, ack.session_present
        );

        let mut slot = self.link.lock().await;
        if self.disconnects.load(Ordering::SeqCst) != generation {
            info!(
                "[{}] Disconnect requested while connecting, closing connection",
                self.identity.client_id
            );
            return Err(EngineError::NotConnected);
        }
        let cancel = CancellationToken::new();
        tokio::spawn(drive(
            self.identity.client_id.clone(),
            reader,
            outbound.clone(),
            events,
            options.keep_alive,
            cancel.clone(),
        ));
        unclaimed.claim();
        *slot = Some(Link {
            outbound,
            inflight,
            cancel,
        });
        Ok(ack)
    }

    async fn disconnect(&self) -> Result<(), EngineError> {
        self.disconnects.fetch_add(1, Ordering::SeqCst);
        let Some(link) = self.link.lock().await.take() else {
            return Err(EngineError::AlreadyDisconnected);
        };

        // registered under the lock so the driver cannot see `Written` first
        let sent = {
            let mut inflight = lock(&link.inflight);
            inflight.closing = true;
            inflight.fail_all();
            link.outbound.send(|buf| v4::Disconnect.write(buf)).map(|tag| {
                let (done, flushed) = oneshot::channel();
                inflight.flush = Some((tag, done));
                flushed
            })
        };
        let result = match sent {
            Ok(flushed) => {
                if time::timeout(DISCONNECT_GRACE, flushed).await.is_err() {
                    warn!(
                        "[{}] DISCONNECT not written within {:?}",
                        self.identity.client_id, DISCONNECT_GRACE
                    );
                }
                Ok(())
            }
            Err(e) => Err(e),
        };
        link.close();
        result
    }

    async fn subscribe(&self, topic: &str, qos: QoS) -> Result<SubAck, EngineError> {
        let reply = {
            let guard = self.link.lock().await;
            let link = guard.as_ref().ok_or(EngineError::NotConnected)?;
            let mut inflight = lock(&link.inflight);
            if inflight.closing {
                return Err(EngineError::NotConnected);
            }
            let mut packet = v4::Subscribe::new(topic, qos_to_rumqttc(qos));
            packet.pkid = inflight.next_pkid();
            link.outbound.send(|buf| packet.write(buf))?;
            let (tx, rx) = oneshot::channel();
            inflight.subscribes.insert(packet.pkid, (topic.to_string(), tx));
            rx
        };
        reply.await.map_err(|_| EngineError::NotConnected)?
    }

    async fn unsubscribe(&self, topic: &str) -> Result<(), EngineError> {
        let guard = self.link.lock().await;
        let link = guard.as_ref().ok_or(EngineError::NotConnected)?;
        let mut packet = v4::Unsubscribe::new(topic);
        packet.pkid = lock(&link.inflight).next_pkid();
        link.outbound.send(|buf| packet.write(buf))?;
        Ok(())
    }
}

fn connect_packet(client_id: &str, options: &ConnectionOptions) -> v4::Connect {
    let mut connect = v4::Connect::new(client_id);
    connect.keep_alive = u16::try_from(options.keep_alive.as_secs()).unwrap_or(u16::MAX);
    connect.clean_session = options.clean_session;
    if let Some(username) = &options.username {
        connect.set_login(username.clone(), options.password.clone().unwrap_or_default());
    }
    connect
}

async fn wait_for_connack(reader: &mut PacketReader) -> Result<ConnAck, EngineError> {
    loop {
        match reader.next_packet().await? {
            v4::Packet::ConnAck(ack) if ack.code == ConnectReturnCode::Success => {
                return Ok(ConnAck {
                    reason_code: 0,
                    session_present: ack.session_present,
                });
            }
            v4::Packet::ConnAck(ack) => return Err(refused(ack.code)),
            other => trace!("Packet before CONNACK: {:?}", other),
        }
    }
}

/// Reads packets of one established connection and keeps it alive.
async fn drive(
    client_id: String,
    mut reader: PacketReader,
    outbound: Arc<Outbound>,
    events: EngineEvents,
    keep_alive: Duration,
    cancel: CancellationToken,
) {
    let pings = !keep_alive.is_zero();
    let period = keep_alive.max(Duration::from_secs(1));
    let mut ping = time::interval_at(Instant::now() + period, period);
    ping.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut awaiting_pong = false;

    let failure = loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break None,
            _ = ping.tick(), if pings => {
                if awaiting_pong {
                    break Some(EngineError::Transport("No PINGRESP within keep alive".into()));
                }
                awaiting_pong = true;
                if let Err(e) = outbound.send(|buf| v4::PingReq.write(buf)) {
                    break Some(e);
                }
            }
            packet = reader.next_packet() => {
                let handled = match packet {
                    Ok(v4::Packet::PingResp) => {
                        awaiting_pong = false;
                        Ok(())
                    }
                    Ok(packet) => handle_packet(packet, &outbound, &reader.inflight, &events),
                    Err(e) => Err(e),
                };
                if let Err(e) = handled {
                    break Some(e);
                }
            }
        }
    };

    let closing = {
        let mut inflight = lock(&reader.inflight);
        inflight.fail_all();
        inflight.closing
    };
    if let Some(e) = failure {
        if closing {
            debug!("[{}] Connection closed: {}", client_id, e);
        } else {
            let message = match &e {
                EngineError::Transport(m) | EngineError::Protocol(m) => m.clone(),
                other => other.to_string(),
            };
            error!("[{}] Connection error: {}", client_id, message);
            if matches!(e, EngineError::Protocol(_)) {
                events.receive_error(message.clone());
            }
            events.disconnected(None, Some(message));
            outbound.socket.disconnect();
        }
    }
    trace!("[{}] Packet reader stopped", client_id);
}

fn handle_packet(
    packet: v4::Packet,
    outbound: &Outbound,
    inflight: &Mutex<Inflight>,
    events: &EngineEvents,
) -> Result<(), EngineError> {
    match packet {
        v4::Packet::Publish(publish) => {
            match publish.qos {
                rumqttc::QoS::AtMostOnce => {}
                rumqttc::QoS::AtLeastOnce => {
                    outbound.send(|buf| v4::PubAck::new(publish.pkid).write(buf))?;
                }
                rumqttc::QoS::ExactlyOnce => {
                    outbound.send(|buf| v4::PubRec::new(publish.pkid).write(buf))?;
                }
            }
            events.publish(publish.topic, qos_from_rumqttc(publish.qos), publish.payload);
        }
        v4::Packet::PubRel(rel) => {
            outbound.send(|buf| v4::PubComp::new(rel.pkid).write(buf))?;
        }
        v4::Packet::SubAck(ack) => lock(inflight).acked(ack),
        v4::Packet::UnsubAck(ack) => trace!("UNSUBACK {}", ack.pkid),
        v4::Packet::Disconnect => {
            return Err(EngineError::Transport("Disconnected by broker".to_string()));
        }
        other => trace!("Ignoring {:?}", other),
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use bytes::Bytes;
    use tokio::{
        io::{AsyncReadExt, AsyncWriteExt},
        net::TcpListener,
    };

    use super::*;
    use crate::{
        config::TransportKind,
        connection::Command,
        engine::EngineEvent,
        testing::{MemoryConnector, Peer},
        websocket::Frame,
    };

    fn ws_identity() -> Arc<ClientIdentity> {
        let mut identity = ClientIdentity::raw("stream-test", "broker.local", 8080);
        identity.transport = TransportKind::FramedWebSocket;
        identity.web_socket_headers =
            HashMap::from([("Authorization".to_string(), "Bearer x".to_string())]);
        Arc::new(identity)
    }

    fn ws_engine() -> (Arc<StreamEngine>, mpsc::UnboundedReceiver<Peer>) {
        let (connector, peers) = MemoryConnector::new();
        let sockets = SocketFactory::new(ws_identity(), Duration::from_secs(5))
            .with_connector(Arc::new(connector));
        (Arc::new(StreamEngine::new(ws_identity(), sockets)), peers)
    }

    fn events() -> (EngineEvents, mpsc::UnboundedReceiver<Command>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (EngineEvents::new(1, tx), rx)
    }

    fn encode<F>(write: F) -> Bytes
    where
        F: FnOnce(&mut BytesMut) -> Result<usize, mqttbytes::Error>,
    {
        let mut buf = BytesMut::new();
        write(&mut buf).unwrap();
        buf.freeze()
    }

    /// Next packet the client wrote, one binary frame per packet.
    async fn client_packet(peer: &mut Peer) -> v4::Packet {
        use futures::StreamExt;
        match peer.inbound.next().await {
            Some(Frame::Binary(data)) => {
                v4::read(&mut BytesMut::from(&data[..]), MAX_PACKET_SIZE).unwrap()
            }
            other => panic!("expected a binary frame, got {other:?}"),
        }
    }

    async fn connected() -> (
        Arc<StreamEngine>,
        Peer,
        mpsc::UnboundedReceiver<Command>,
    ) {
        let (engine, mut peers) = ws_engine();
        let (events, rx) = events();
        let connecting = {
            let engine = engine.clone();
            tokio::spawn(async move { engine.connect(&ConnectionOptions::default(), events).await })
        };

        let mut peer = peers.recv().await.unwrap();
        assert!(matches!(client_packet(&mut peer).await, v4::Packet::Connect(_)));
        let connack = encode(|buf| v4::ConnAck::new(ConnectReturnCode::Success, false).write(buf));
        peer.send_binary(connack);

        let ack = connecting.await.unwrap().unwrap();
        assert_eq!(ack.reason_code, 0);
        (engine, peer, rx)
    }

    #[tokio::test]
    async fn test_connect_through_websocket_adapter() {
        let (engine, mut peers) = ws_engine();
        let (events, _rx) = events();
        let options = ConnectionOptions {
            keep_alive: Duration::from_secs(30),
            username: Some("user".into()),
            password: Some("secret".into()),
            ..Default::default()
        };
        let connecting = {
            let engine = engine.clone();
            tokio::spawn(async move { engine.connect(&options, events).await })
        };

        let mut peer = peers.recv().await.unwrap();
        assert_eq!(peer.request.url, "ws://broker.local:8080/mqtt");
        assert!(peer
            .request
            .headers
            .contains(&("Authorization".to_string(), "Bearer x".to_string())));

        match client_packet(&mut peer).await {
            v4::Packet::Connect(connect) => {
                assert_eq!(connect.client_id, "stream-test");
                assert_eq!(connect.keep_alive, 30);
                assert_eq!(connect.login.unwrap().username, "user");
            }
            other => panic!("expected CONNECT, got {other:?}"),
        }

        // CONNACK split across frames
        let connack = encode(|buf| v4::ConnAck::new(ConnectReturnCode::Success, true).write(buf));
        peer.send_binary(connack.slice(..1));
        peer.send_binary(connack.slice(1..));

        let ack = connecting.await.unwrap().unwrap();
        assert!(ack.session_present);
    }

    #[tokio::test]
    async fn test_refused_connack() {
        let (engine, mut peers) = ws_engine();
        let (events, _rx) = events();
        let connecting = {
            let engine = engine.clone();
            tokio::spawn(async move { engine.connect(&ConnectionOptions::default(), events).await })
        };

        let mut peer = peers.recv().await.unwrap();
        client_packet(&mut peer).await;
        let connack =
            encode(|buf| v4::ConnAck::new(ConnectReturnCode::NotAuthorized, false).write(buf));
        peer.send_binary(connack);

        match connecting.await.unwrap() {
            Err(EngineError::Refused { code, .. }) => assert_eq!(code, 5),
            other => panic!("unexpected result {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_subscribe_matches_suback() {
        let (engine, mut peer, _rx) = connected().await;

        let subscribing = {
            let engine = engine.clone();
            tokio::spawn(async move { engine.subscribe("home/+/temp", QoS::AtLeastOnce).await })
        };
        let pkid = match client_packet(&mut peer).await {
            v4::Packet::Subscribe(subscribe) => {
                assert_eq!(subscribe.filters[0].path, "home/+/temp");
                subscribe.pkid
            }
            other => panic!("expected SUBSCRIBE, got {other:?}"),
        };
        let suback = encode(|buf| {
            v4::SubAck::new(
                pkid,
                vec![SubscribeReasonCode::Success(rumqttc::QoS::AtMostOnce)],
            )
            .write(buf)
        });
        peer.send_binary(suback);

        let ack = subscribing.await.unwrap().unwrap();
        assert_eq!(ack.granted_qos, QoS::AtMostOnce);
    }

    #[tokio::test]
    async fn test_inbound_publish_reported_and_acked() {
        let (_engine, mut peer, mut rx) = connected().await;

        let mut publish = v4::Publish::new("home/kitchen/temp", rumqttc::QoS::AtLeastOnce, "21.5");
        publish.pkid = 7;
        // body arrives in a separate frame from the fixed header
        let bytes = encode(|buf| publish.write(buf));
        peer.send_binary(bytes.slice(..2));
        peer.send_binary(bytes.slice(2..));

        match rx.recv().await {
            Some(Command::Engine {
                event: EngineEvent::Publish { topic, qos, payload },
                ..
            }) => {
                assert_eq!(topic, "home/kitchen/temp");
                assert_eq!(qos, QoS::AtLeastOnce);
                assert_eq!(&payload[..], b"21.5");
            }
            other => panic!("unexpected command {other:?}"),
        }
        match client_packet(&mut peer).await {
            v4::Packet::PubAck(ack) => assert_eq!(ack.pkid, 7),
            other => panic!("expected PUBACK, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_peer_close_reports_disconnect() {
        let (_engine, peer, mut rx) = connected().await;

        peer.outbound.unbounded_send(Ok(Frame::Close(None))).unwrap();
        match rx.recv().await {
            Some(Command::Engine {
                event: EngineEvent::Disconnected { message, .. },
                ..
            }) => assert_eq!(message.as_deref(), Some("Connection closed by peer")),
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_malformed_packet_reports_receive_error() {
        let (_engine, peer, mut rx) = connected().await;

        // reserved packet type 0
        peer.send_binary(Bytes::from_static(&[0x00, 0x00]));
        assert!(matches!(
            rx.recv().await,
            Some(Command::Engine {
                event: EngineEvent::ReceiveError(_),
                ..
            })
        ));
        assert!(matches!(
            rx.recv().await,
            Some(Command::Engine {
                event: EngineEvent::Disconnected { .. },
                ..
            })
        ));
    }

    #[tokio::test]
    async fn test_disconnect_sends_disconnect_and_closes() {
        let (engine, mut peer, mut rx) = connected().await;

        engine.disconnect().await.unwrap();
        assert!(matches!(client_packet(&mut peer).await, v4::Packet::Disconnect));
        {
            use futures::StreamExt;
            assert_eq!(peer.inbound.next().await, Some(Frame::Close(None)));
        }
        assert_eq!(engine.disconnect().await, Err(EngineError::AlreadyDisconnected));
        // a requested close is not reported as a connection loss
        tokio::task::yield_now().await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_disconnect_while_connecting_closes_socket() {
        let (engine, mut peers) = ws_engine();
        let (events, _rx) = events();
        let connecting = {
            let engine = engine.clone();
            tokio::spawn(async move { engine.connect(&ConnectionOptions::default(), events).await })
        };

        let mut peer = peers.recv().await.unwrap();
        client_packet(&mut peer).await;
        assert_eq!(engine.disconnect().await, Err(EngineError::AlreadyDisconnected));

        let connack = encode(|buf| v4::ConnAck::new(ConnectReturnCode::Success, false).write(buf));
        peer.send_binary(connack);
        assert_eq!(connecting.await.unwrap(), Err(EngineError::NotConnected));

        use futures::StreamExt;
        assert_eq!(peer.inbound.next().await, Some(Frame::Close(None)));
        assert_eq!(
            engine.subscribe("a", QoS::AtMostOnce).await,
            Err(EngineError::NotConnected)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_keep_alive_ping() {
        let (engine, mut peers) = ws_engine();
        let (events, mut rx) = events();
        let options = ConnectionOptions {
            keep_alive: Duration::from_secs(10),
            ..Default::default()
        };
        let connecting = {
            let engine = engine.clone();
            tokio::spawn(async move { engine.connect(&options, events).await })
        };
        let mut peer = peers.recv().await.unwrap();
        client_packet(&mut peer).await;
        peer.send_binary(encode(|buf| {
            v4::ConnAck::new(ConnectReturnCode::Success, false).write(buf)
        }));
        connecting.await.unwrap().unwrap();

        assert!(matches!(client_packet(&mut peer).await, v4::Packet::PingReq));
        peer.send_binary(encode(|buf| v4::PingResp.write(buf)));
        assert!(matches!(client_packet(&mut peer).await, v4::Packet::PingReq));

        // second ping unanswered: the connection is given up
        match rx.recv().await {
            Some(Command::Engine {
                event: EngineEvent::Disconnected { message, .. },
                ..
            }) => assert_eq!(message.as_deref(), Some("No PINGRESP within keep alive")),
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_connect_over_tcp_socket() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let identity = Arc::new(ClientIdentity::raw("tcp-test", "127.0.0.1", port));
        let sockets = SocketFactory::new(identity.clone(), Duration::from_secs(5));
        let engine = StreamEngine::new(identity, sockets);

        let broker = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 256];
            let n = stream.read(&mut buf).await.unwrap();
            assert_eq!(buf[0], 0x10, "expected CONNECT, got {:?}", &buf[..n]);
            stream.write_all(&[0x20, 0x02, 0x00, 0x00]).await.unwrap();
            // hold the connection until the client leaves
            let _ = stream.read(&mut buf).await;
        });

        let (events, _rx) = events();
        let ack = engine.connect(&ConnectionOptions::default(), events).await.unwrap();
        assert_eq!(ack.reason_code, 0);
        engine.disconnect().await.unwrap();
        broker.await.unwrap();
    }

    #[test]
    fn test_packet_ids_skip_zero() {
        let mut inflight = Inflight {
            last_pkid: u16::MAX,
            ..Default::default()
        };
        assert_eq!(inflight.next_pkid(), 1);
        assert_eq!(inflight.next_pkid(), 2);
    }
}
