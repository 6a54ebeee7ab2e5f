//! Stream socket emulation over binary websocket frames.
//!
//! Every [`write`](ByteStreamSocket::write) becomes exactly one binary frame.
//! Inbound binary frames are appended to the shared [`SocketBuffer`] and
//! handed out by length, regardless of where frame boundaries fall. Text
//! frames carry nothing for MQTT and are ignored; ping and pong are left to
//! the websocket library.
//!
//! The websocket library itself sits behind [`FrameConnector`], with
//! [`TungsteniteConnector`] as the production implementation.
//!
//! [`SocketBuffer`]: crate::socket::SocketBuffer

use std::{
    collections::HashMap,
    pin::Pin,
    sync::{Arc, Mutex},
    time::Duration,
};

use async_trait::async_trait;
use bytes::Bytes;
use futures::{future, Sink, SinkExt, Stream, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::{
    client::IntoClientRequest,
    http::{HeaderName, HeaderValue, Uri},
    protocol::{frame::coding::CloseCode, CloseFrame},
    Message,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace};

use crate::{
    config::ClientIdentity,
    error::TransportError,
    socket::{
        queue_write, session_open, store_session, take_session, ByteStreamSocket, ServiceOrder,
        SocketEvent, SocketSession, SocketShared, Tag,
    },
};

/// Subprotocol announced in every handshake.
pub const MQTT_SUBPROTOCOL: &str = "mqtt";

/// A websocket message as seen by the adapter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Binary(Bytes),
    Text(String),
    Ping(Bytes),
    Pong(Bytes),
    Close(Option<String>),
}

impl From<Frame> for Message {
    fn from(frame: Frame) -> Self {
        match frame {
            Frame::Binary(data) => Message::Binary(data.to_vec()),
            Frame::Text(text) => Message::Text(text),
            Frame::Ping(data) => Message::Ping(data.to_vec()),
            Frame::Pong(data) => Message::Pong(data.to_vec()),
            Frame::Close(reason) => Message::Close(reason.map(|reason| CloseFrame {
                code: CloseCode::Normal,
                reason: reason.into(),
            })),
        }
    }
}

impl From<Message> for Frame {
    fn from(message: Message) -> Self {
        match message {
            Message::Binary(data) => Frame::Binary(Bytes::from(data)),
            Message::Text(text) => Frame::Text(text),
            Message::Ping(data) => Frame::Ping(Bytes::from(data)),
            Message::Pong(data) => Frame::Pong(Bytes::from(data)),
            Message::Close(frame) => Frame::Close(frame.map(|f| f.reason.into_owned())),
            // raw frames are only produced when writing
            Message::Frame(_) => Frame::Pong(Bytes::new()),
        }
    }
}

pub type FrameSink = Pin<Box<dyn Sink<Frame, Error = TransportError> + Send>>;
pub type FrameStream = Pin<Box<dyn Stream<Item = Result<Frame, TransportError>> + Send>>;

/// Both halves of an open websocket.
pub struct FrameChannel {
    pub sink: FrameSink,
    pub stream: FrameStream,
}

/// Everything needed to perform the opening handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandshakeRequest {
    pub url: String,
    pub headers: Vec<(String, String)>,
}

/// Opens framed websocket connections.
#[async_trait]
pub trait FrameConnector: Send + Sync + 'static {
    async fn connect(&self, request: HandshakeRequest) -> Result<FrameChannel, TransportError>;
}

/// `tokio-tungstenite` backed connector; `wss` uses rustls with webpki roots.
#[derive(Debug, Clone, Copy, Default)]
pub struct TungsteniteConnector;

#[async_trait]
impl FrameConnector for TungsteniteConnector {
    async fn connect(&self, request: HandshakeRequest) -> Result<FrameChannel, TransportError> {
        let mut client_request = request.url.as_str().into_client_request()?;
        for (name, value) in &request.headers {
            let header = HeaderName::from_bytes(name.as_bytes())
                .map_err(|_| TransportError::InvalidHeader(name.clone()))?;
            let value = HeaderValue::from_str(value)
                .map_err(|_| TransportError::InvalidHeader(name.clone()))?;
            client_request.headers_mut().insert(header, value);
        }

        let (ws, response) = tokio_tungstenite::connect_async(client_request).await?;
        debug!("Websocket handshake completed: {}", response.status());

        let (sink, stream) = ws.split();
        let sink = sink.with(|frame: Frame| future::ready(Ok::<Message, TransportError>(frame.into())));
        let stream = stream.map(|message| message.map(Frame::from).map_err(TransportError::from));

        Ok(FrameChannel {
            sink: Box::pin(sink),
            stream: Box::pin(stream),
        })
    }
}

#[async_trait]
impl FrameConnector for Arc<dyn FrameConnector> {
    async fn connect(&self, request: HandshakeRequest) -> Result<FrameChannel, TransportError> {
        (**self).connect(request).await
    }
}

/// [`ByteStreamSocket`] over binary websocket frames.
pub struct WebSocketAdapter<C: FrameConnector = TungsteniteConnector> {
    connector: C,
    tls: bool,
    uri: String,
    headers: HashMap<String, String>,
    shared: Arc<SocketShared>,
    session: Mutex<Option<SocketSession>>,
}

impl<C: FrameConnector> WebSocketAdapter<C> {
    pub fn new(
        connector: C,
        tls: bool,
        uri: impl Into<String>,
        headers: HashMap<String, String>,
        events: mpsc::UnboundedSender<SocketEvent>,
    ) -> Self {
        Self {
            connector,
            tls,
            uri: uri.into(),
            headers,
            shared: Arc::new(SocketShared::new(ServiceOrder::default(), events)),
            session: Mutex::new(None),
        }
    }

    pub fn from_identity(
        connector: C,
        identity: &ClientIdentity,
        events: mpsc::UnboundedSender<SocketEvent>,
    ) -> Self {
        Self::new(
            connector,
            identity.tls,
            identity.web_socket_uri.clone(),
            identity.web_socket_headers.clone(),
            events,
        )
    }

    /// Replaces the read servicing order. Only meaningful before `connect`.
    pub fn with_service_order(mut self, order: ServiceOrder) -> Self {
        let events = self.shared.events_sender();
        self.shared = Arc::new(SocketShared::new(order, events));
        self
    }

    /// `ws(s)://host:port{uri}`, rejected when it does not parse as a URI.
    pub fn url(&self, host: &str, port: u16) -> Result<String, TransportError> {
        if host.is_empty() || host.contains(['/', ' ']) {
            return Err(TransportError::InvalidUrl(format!("invalid host '{host}'")));
        }
        let scheme = if self.tls { "wss" } else { "ws" };
        let url = format!("{scheme}://{host}:{port}{}", self.uri);
        url.parse::<Uri>()
            .map_err(|e| TransportError::InvalidUrl(format!("{url}: {e}")))?;
        Ok(url)
    }

    fn handshake(&self, url: String) -> HandshakeRequest {
        let mut headers: Vec<(String, String)> = self
            .headers
            .iter()
            .map(|(name, value)| (name.clone(), value.clone()))
            .collect();
        headers.sort();
        headers.push((
            "Sec-WebSocket-Protocol".to_string(),
            MQTT_SUBPROTOCOL.to_string(),
        ));
        HandshakeRequest { url, headers }
    }

    fn start(&self, channel: FrameChannel) {
        if let Some(previous) = take_session(&self.session) {
            self.shared.close(&previous.cancel, None);
        }
        self.shared.reset();

        let cancel = CancellationToken::new();
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        tokio::spawn(write_loop(
            channel.sink,
            outbound_rx,
            self.shared.clone(),
            cancel.clone(),
        ));
        tokio::spawn(read_loop(channel.stream, self.shared.clone(), cancel.clone()));

        store_session(
            &self.session,
            SocketSession {
                cancel,
                outbound: outbound_tx,
            },
        );
    }
}

#[async_trait]
impl<C: FrameConnector> ByteStreamSocket for WebSocketAdapter<C> {
    async fn connect(&self, host: &str, port: u16, timeout: Duration) -> Result<(), TransportError> {
        let url = self.url(host, port)?;
        info!("Opening websocket to {}", url);

        let request = self.handshake(url);
        let channel = tokio::time::timeout(timeout, self.connector.connect(request))
            .await
            .map_err(|_| TransportError::Timeout(timeout))??;

        self.start(channel);
        self.shared.notify(SocketEvent::Connected);
        Ok(())
    }

    fn write(&self, data: Bytes, tag: Tag) {
        queue_write(&self.session, data, tag);
    }

    fn read_data(&self, length: usize, tag: Tag) {
        self.shared.read_data(length, tag);
    }

    fn disconnect(&self) {
        match take_session(&self.session) {
            Some(session) => {
                self.shared.close(&session.cancel, None);
            }
            None => {
                self.shared.reset();
                self.shared.notify(SocketEvent::Disconnected { error: None });
            }
        }
    }

    fn is_connected(&self) -> bool {
        session_open(&self.session)
    }
}

async fn write_loop(
    mut sink: FrameSink,
    mut outbound: mpsc::UnboundedReceiver<(Bytes, Tag)>,
    shared: Arc<SocketShared>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                let _ = sink.send(Frame::Close(None)).await;
                let _ = sink.close().await;
                break;
            }
            next = outbound.recv() => {
                let Some((data, tag)) = next else { break };
                match sink.send(Frame::Binary(data)).await {
                    Ok(()) => shared.written(&cancel, tag),
                    Err(e) => {
                        shared.close(&cancel, Some(e.to_string()));
                        break;
                    }
                }
            }
        }
    }
    trace!("Websocket writer stopped");
}

async fn read_loop(mut stream: FrameStream, shared: Arc<SocketShared>, cancel: CancellationToken) {
    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            frame = stream.next() => match frame {
                Some(Ok(Frame::Binary(data))) => shared.deliver(&cancel, &data),
                Some(Ok(Frame::Text(text))) => {
                    debug!("Ignoring text frame of {} bytes", text.len());
                }
                Some(Ok(Frame::Ping(_) | Frame::Pong(_))) => {}
                Some(Ok(Frame::Close(reason))) => {
                    debug!("Peer closed websocket: {:?}", reason);
                    shared.close(&cancel, None);
                    break;
                }
                Some(Err(e)) => {
                    shared.close(&cancel, Some(e.to_string()));
                    break;
                }
                None => {
                    shared.close(&cancel, None);
                    break;
                }
            }
        }
    }
    trace!("Websocket reader stopped");
}
