//! Native TCP implementation of the stream-socket contract.

use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{
        tcp::{OwnedReadHalf, OwnedWriteHalf},
        TcpStream,
    },
    sync::mpsc,
};
use tokio_util::sync::CancellationToken;
use tracing::{info, trace};

use crate::{
    error::TransportError,
    socket::{
        queue_write, session_open, store_session, take_session, ByteStreamSocket, ServiceOrder,
        SocketEvent, SocketSession, SocketShared, Tag,
    },
};

const READ_CHUNK: usize = 8 * 1024;

/// [`ByteStreamSocket`] over a plain TCP connection.
pub struct TcpSocket {
    shared: Arc<SocketShared>,
    session: Mutex<Option<SocketSession>>,
}

impl TcpSocket {
    pub fn new(events: mpsc::UnboundedSender<SocketEvent>) -> Self {
        Self {
            shared: Arc::new(SocketShared::new(ServiceOrder::default(), events)),
            session: Mutex::new(None),
        }
    }

    pub fn with_service_order(mut self, order: ServiceOrder) -> Self {
        let events = self.shared.events_sender();
        self.shared = Arc::new(SocketShared::new(order, events));
        self
    }
}

#[async_trait]
impl ByteStreamSocket for TcpSocket {
    async fn connect(&self, host: &str, port: u16, timeout: Duration) -> Result<(), TransportError> {
        info!("Opening TCP connection to {}:{}", host, port);
        let stream = tokio::time::timeout(timeout, TcpStream::connect((host, port)))
            .await
            .map_err(|_| TransportError::Timeout(timeout))??;
        stream.set_nodelay(true)?;

        if let Some(previous) = take_session(&self.session) {
            self.shared.close(&previous.cancel, None);
        }
        self.shared.reset();

        let (reader, writer) = stream.into_split();
        let cancel = CancellationToken::new();
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        tokio::spawn(write_loop(
            writer,
            outbound_rx,
            self.shared.clone(),
            cancel.clone(),
        ));
        tokio::spawn(read_loop(reader, self.shared.clone(), cancel.clone()));
        store_session(
            &self.session,
            SocketSession {
                cancel,
                outbound: outbound_tx,
            },
        );

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
    mut writer: OwnedWriteHalf,
    mut outbound: mpsc::UnboundedReceiver<(Bytes, Tag)>,
    shared: Arc<SocketShared>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                let _ = writer.shutdown().await;
                break;
            }
            next = outbound.recv() => {
                let Some((data, tag)) = next else { break };
                match writer.write_all(&data).await {
                    Ok(()) => shared.written(&cancel, tag),
                    Err(e) => {
                        shared.close(&cancel, Some(e.to_string()));
                        break;
                    }
                }
            }
        }
    }
    trace!("TCP writer stopped");
}

async fn read_loop(mut reader: OwnedReadHalf, shared: Arc<SocketShared>, cancel: CancellationToken) {
    let mut chunk = BytesMut::with_capacity(READ_CHUNK);
    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            read = reader.read_buf(&mut chunk) => match read {
                Ok(0) => {
                    shared.close(&cancel, None);
                    break;
                }
                Ok(_) => {
                    shared.deliver(&cancel, &chunk);
                    chunk.clear();
                }
                Err(e) => {
                    shared.close(&cancel, Some(e.to_string()));
                    break;
                }
            }
        }
    }
    trace!("TCP reader stopped");
}

#[cfg(test)]
mod tests {
    use tokio::net::TcpListener;

    use super::*;

    async fn listener() -> (TcpListener, u16) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        (listener, port)
    }

    #[tokio::test]
    async fn test_round_trip_over_loopback() {
        let (listener, port) = listener().await;
        let (tx, mut events) = mpsc::unbounded_channel();
        let socket = TcpSocket::new(tx);

        socket
            .connect("127.0.0.1", port, Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(events.recv().await, Some(SocketEvent::Connected));
        let (mut server, _) = listener.accept().await.unwrap();

        socket.write(Bytes::from_static(b"\x10\x00"), 1);
        assert_eq!(events.recv().await, Some(SocketEvent::Written { tag: 1 }));
        let mut received = [0u8; 2];
        server.read_exact(&mut received).await.unwrap();
        assert_eq!(&received, b"\x10\x00");

        socket.read_data(4, 2);
        server.write_all(b"\x20\x02").await.unwrap();
        server.write_all(b"\x00\x00").await.unwrap();
        assert_eq!(
            events.recv().await,
            Some(SocketEvent::Read {
                tag: 2,
                data: Bytes::from_static(b"\x20\x02\x00\x00"),
            })
        );
    }

    #[tokio::test]
    async fn test_peer_close_reports_disconnect() {
        let (listener, port) = listener().await;
        let (tx, mut events) = mpsc::unbounded_channel();
        let socket = TcpSocket::new(tx);

        socket
            .connect("127.0.0.1", port, Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(events.recv().await, Some(SocketEvent::Connected));
        let (server, _) = listener.accept().await.unwrap();
        drop(server);

        assert_eq!(
            events.recv().await,
            Some(SocketEvent::Disconnected { error: None })
        );
        assert!(!socket.is_connected());
    }

    #[tokio::test]
    async fn test_manual_disconnect() {
        let (listener, port) = listener().await;
        let (tx, mut events) = mpsc::unbounded_channel();
        let socket = TcpSocket::new(tx);

        socket
            .connect("127.0.0.1", port, Duration::from_secs(5))
            .await
            .unwrap();
        let _server = listener.accept().await.unwrap();
        assert_eq!(events.recv().await, Some(SocketEvent::Connected));

        socket.disconnect();
        assert_eq!(
            events.recv().await,
            Some(SocketEvent::Disconnected { error: None })
        );
        assert!(!socket.is_connected());
    }

    #[tokio::test]
    async fn test_write_without_connection_is_dropped() {
        let (tx, mut events) = mpsc::unbounded_channel();
        let socket = TcpSocket::new(tx);
        socket.write(Bytes::from_static(b"x"), 1);
        assert!(events.try_recv().is_err());
    }
}
