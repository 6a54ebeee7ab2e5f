//! Byte-stream socket contract.
//!
//! MQTT engines expect a classic stream socket: write some bytes, ask for
//! exactly `n` bytes back. [`ByteStreamSocket`] is that contract. It is
//! implemented over a raw TCP stream ([`TcpSocket`](crate::tcp::TcpSocket))
//! and over binary websocket frames
//! ([`WebSocketAdapter`](crate::websocket::WebSocketAdapter)), where frame
//! boundaries have nothing to do with the reads the engine issues.
//!
//! Both implementations share [`SocketBuffer`]: received bytes wait there
//! until a read asks for them, and reads wait there until enough bytes
//! arrived. Results are reported as [`SocketEvent`]s on an unbounded channel.
//!
//! ```text
//!  frames:   [ 4 bytes ]          [ 6 bytes ]
//!  buffer:   ....                 ..........
//!  reads:    read(10) -> queued   -> delivered (10 bytes)
//! ```

use std::{
    collections::VecDeque,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::{
    config::{ClientIdentity, TransportKind},
    error::TransportError,
    tcp::TcpSocket,
    websocket::{FrameConnector, TungsteniteConnector, WebSocketAdapter},
};

/// Caller-chosen tag correlating a read or write with its notification.
pub type Tag = i64;

/// Notifications emitted by a socket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SocketEvent {
    /// The transport is open.
    Connected,
    /// A read request was satisfied.
    Read { tag: Tag, data: Bytes },
    /// A write was accepted by the transport.
    Written { tag: Tag },
    /// The transport closed. `error` is `None` for a clean close.
    Disconnected { error: Option<String> },
}

/// Stream-socket contract used by MQTT protocol engines.
#[async_trait]
pub trait ByteStreamSocket: Send + Sync {
    /// Opens the transport. Emits [`SocketEvent::Connected`] on success.
    async fn connect(&self, host: &str, port: u16, timeout: Duration) -> Result<(), TransportError>;

    /// Queues `data` for sending; [`SocketEvent::Written`] follows once the
    /// transport accepted it.
    fn write(&self, data: Bytes, tag: Tag);

    /// Asks for exactly `length` bytes. Served at once when buffered,
    /// otherwise when enough bytes arrive.
    fn read_data(&self, length: usize, tag: Tag);

    /// Closes the transport, emits [`SocketEvent::Disconnected`] and drops
    /// buffered bytes and pending reads.
    fn disconnect(&self);

    fn is_connected(&self) -> bool;
}

/// Order in which pending reads are served once bytes arrive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ServiceOrder {
    /// Strict FIFO: a read is only served after every earlier read.
    InOrder,
    /// Every pending read is checked on its own, front to back, so a large
    /// read at the head does not hold back smaller later ones. A new read is
    /// served from the buffer right away even while others wait.
    #[default]
    FirstFit,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct PendingRead {
    length: usize,
    tag: Tag,
}

/// Received-but-unconsumed bytes plus reads that cannot be served yet.
///
/// Bytes always leave from the front, in arrival order.
#[derive(Debug, Default)]
pub struct SocketBuffer {
    data: BytesMut,
    pending: VecDeque<PendingRead>,
    order: ServiceOrder,
}

impl SocketBuffer {
    pub fn new(order: ServiceOrder) -> Self {
        Self {
            data: BytesMut::new(),
            pending: VecDeque::new(),
            order,
        }
    }

    /// Requests `length` bytes. Returns them if they can be served right
    /// away, otherwise queues the request.
    pub fn request(&mut self, length: usize, tag: Tag) -> Option<Bytes> {
        let may_serve = match self.order {
            ServiceOrder::InOrder => self.pending.is_empty(),
            ServiceOrder::FirstFit => true,
        };
        if may_serve && self.data.len() >= length {
            return Some(self.data.split_to(length).freeze());
        }
        self.pending.push_back(PendingRead { length, tag });
        None
    }

    /// Appends received bytes and returns every read that became servable.
    pub fn append(&mut self, bytes: &[u8]) -> Vec<(Tag, Bytes)> {
        self.data.extend_from_slice(bytes);
        self.service()
    }

    fn service(&mut self) -> Vec<(Tag, Bytes)> {
        let mut served = Vec::new();
        match self.order {
            ServiceOrder::InOrder => {
                while let Some(read) = self.pending.front().copied() {
                    if self.data.len() < read.length {
                        break;
                    }
                    self.pending.pop_front();
                    served.push((read.tag, self.data.split_to(read.length).freeze()));
                }
            }
            ServiceOrder::FirstFit => {
                let mut index = 0;
                while index < self.pending.len() {
                    let read = self.pending[index];
                    if self.data.len() >= read.length {
                        self.pending.remove(index);
                        served.push((read.tag, self.data.split_to(read.length).freeze()));
                    } else {
                        index += 1;
                    }
                }
            }
        }
        served
    }

    /// Number of buffered bytes.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn pending_reads(&self) -> usize {
        self.pending.len()
    }

    pub fn clear(&mut self) {
        self.data.clear();
        self.pending.clear();
    }
}

/// State of one open transport.
#[derive(Debug)]
pub(crate) struct SocketSession {
    pub(crate) cancel: CancellationToken,
    pub(crate) outbound: mpsc::UnboundedSender<(Bytes, Tag)>,
}

/// Buffer and notification channel shared by a socket and its I/O tasks.
///
/// Notifications are sent while the buffer lock is held, so an inbound frame
/// and a concurrent `read_data` can never reorder deliveries.
#[derive(Debug)]
pub(crate) struct SocketShared {
    buffer: Mutex<SocketBuffer>,
    events: mpsc::UnboundedSender<SocketEvent>,
}

impl SocketShared {
    pub(crate) fn new(order: ServiceOrder, events: mpsc::UnboundedSender<SocketEvent>) -> Self {
        Self {
            buffer: Mutex::new(SocketBuffer::new(order)),
            events,
        }
    }

    pub(crate) fn events_sender(&self) -> mpsc::UnboundedSender<SocketEvent> {
        self.events.clone()
    }

    fn lock(&self) -> MutexGuard<'_, SocketBuffer> {
        self.buffer.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn send(&self, event: SocketEvent) {
        if self.events.send(event).is_err() {
            trace!("Socket event receiver dropped");
        }
    }

    pub(crate) fn notify(&self, event: SocketEvent) {
        let _guard = self.lock();
        self.send(event);
    }

    pub(crate) fn read_data(&self, length: usize, tag: Tag) {
        let mut buffer = self.lock();
        if let Some(data) = buffer.request(length, tag) {
            self.send(SocketEvent::Read { tag, data });
        } else {
            trace!(
                "Read {} queued for {} bytes ({} buffered)",
                tag,
                length,
                buffer.len()
            );
        }
    }

    /// Feeds received bytes unless the session was already closed.
    pub(crate) fn deliver(&self, cancel: &CancellationToken, bytes: &[u8]) {
        let mut buffer = self.lock();
        if cancel.is_cancelled() {
            return;
        }
        for (tag, data) in buffer.append(bytes) {
            self.send(SocketEvent::Read { tag, data });
        }
    }

    pub(crate) fn written(&self, cancel: &CancellationToken, tag: Tag) {
        let _guard = self.lock();
        if !cancel.is_cancelled() {
            self.send(SocketEvent::Written { tag });
        }
    }

    /// Closes the session exactly once: cancels its tasks, emits
    /// `Disconnected` and clears the buffer. Returns `false` when the session
    /// was already closed.
    pub(crate) fn close(&self, cancel: &CancellationToken, error: Option<String>) -> bool {
        let mut buffer = self.lock();
        if cancel.is_cancelled() {
            return false;
        }
        cancel.cancel();
        buffer.clear();
        match &error {
            Some(e) => warn!("Socket closed with error: {}", e),
            None => debug!("Socket closed"),
        }
        self.send(SocketEvent::Disconnected { error });
        true
    }

    pub(crate) fn reset(&self) {
        self.lock().clear();
    }
}

pub(crate) fn take_session(slot: &Mutex<Option<SocketSession>>) -> Option<SocketSession> {
    slot.lock().unwrap_or_else(PoisonError::into_inner).take()
}

pub(crate) fn store_session(slot: &Mutex<Option<SocketSession>>, session: SocketSession) {
    *slot.lock().unwrap_or_else(PoisonError::into_inner) = Some(session);
}

pub(crate) fn queue_write(slot: &Mutex<Option<SocketSession>>, data: Bytes, tag: Tag) {
    let guard = slot.lock().unwrap_or_else(PoisonError::into_inner);
    match guard.as_ref() {
        Some(session) if !session.cancel.is_cancelled() => {
            if session.outbound.send((data, tag)).is_err() {
                warn!("Write {} dropped: writer task stopped", tag);
            }
        }
        _ => warn!("Write {} dropped: socket is not connected", tag),
    }
}

pub(crate) fn session_open(slot: &Mutex<Option<SocketSession>>) -> bool {
    slot.lock()
        .unwrap_or_else(PoisonError::into_inner)
        .as_ref()
        .is_some_and(|session| !session.cancel.is_cancelled())
}

/// Builds the socket matching a client's transport kind.
///
/// Handed to [`EngineFactory`](crate::engine::EngineFactory) implementations
/// whose protocol engine speaks MQTT over a [`ByteStreamSocket`].
#[derive(Clone)]
pub struct SocketFactory {
    identity: Arc<ClientIdentity>,
    connect_timeout: Duration,
    order: ServiceOrder,
    connector: Arc<dyn FrameConnector>,
}

impl SocketFactory {
    pub fn new(identity: Arc<ClientIdentity>, connect_timeout: Duration) -> Self {
        Self {
            identity,
            connect_timeout,
            order: ServiceOrder::default(),
            connector: Arc::new(TungsteniteConnector),
        }
    }

    pub fn with_service_order(mut self, order: ServiceOrder) -> Self {
        self.order = order;
        self
    }

    /// Replaces the websocket library used for framed transports.
    pub fn with_connector(mut self, connector: Arc<dyn FrameConnector>) -> Self {
        self.connector = connector;
        self
    }

    pub fn identity(&self) -> &ClientIdentity {
        &self.identity
    }

    pub fn connect_timeout(&self) -> Duration {
        self.connect_timeout
    }

    /// Creates an unconnected socket and the receiver of its notifications.
    pub fn open(
        &self,
    ) -> Result<
        (
            Box<dyn ByteStreamSocket>,
            mpsc::UnboundedReceiver<SocketEvent>,
        ),
        TransportError,
    > {
        let (tx, rx) = mpsc::unbounded_channel();
        let socket: Box<dyn ByteStreamSocket> = match self.identity.transport {
            TransportKind::FramedWebSocket => Box::new(
                WebSocketAdapter::from_identity(self.connector.clone(), &self.identity, tx)
                    .with_service_order(self.order),
            ),
            TransportKind::RawStream if self.identity.tls => {
                return Err(TransportError::TlsUnavailable);
            }
            TransportKind::RawStream => Box::new(TcpSocket::new(tx).with_service_order(self.order)),
        };
        Ok((socket, rx))
    }

    /// Opens a socket and connects it to the identity's broker.
    pub async fn connect(
        &self,
    ) -> Result<
        (
            Box<dyn ByteStreamSocket>,
            mpsc::UnboundedReceiver<SocketEvent>,
        ),
        TransportError,
    > {
        let (socket, rx) = self.open()?;
        socket
            .connect(&self.identity.host, self.identity.port, self.connect_timeout)
            .await?;
        Ok((socket, rx))
    }
}

impl std::fmt::Debug for SocketFactory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SocketFactory")
            .field("identity", &self.identity)
            .field("connect_timeout", &self.connect_timeout)
            .field("order", &self.order)
            .finish_non_exhaustive()
    }
}
