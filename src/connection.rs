// SPDX-FileCopyrightText: 2025 The swarmlink Contributors
// SPDX-License-Identifier: GPL-3.0-or-later

use std::net::SocketAddr;
use std::sync::Mutex as StdMutex;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{oneshot, watch, Mutex};

use crate::error::ConnectionError;

pub trait AsyncStream: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> AsyncStream for T {}

enum Connector {
    Tcp(SocketAddr),
    Adopted(Box<dyn AsyncStream>),
    Deferred(oneshot::Receiver<Box<dyn AsyncStream>>),
}

/// One transport handle per remote endpoint.
///
/// Disposing the handle is the universal cancellation primitive: every
/// pending and future `connect`/`send`/`receive_exact` on a disposed handle
/// resolves with [`ConnectionError::Disposed`]. There is no preemption; the
/// failure surfaces at the operation's next suspension point.
pub struct Connection {
    uri: String,
    can_reconnect: bool,
    disposed: watch::Sender<bool>,
    connector: StdMutex<Option<Connector>>,
    reader: Mutex<Option<ReadHalf<Box<dyn AsyncStream>>>>,
    writer: Mutex<Option<WriteHalf<Box<dyn AsyncStream>>>>,
}

impl Connection {
    fn with_connector(uri: String, can_reconnect: bool, connector: Connector) -> Self {
        let (disposed, _) = watch::channel(false);
        Connection {
            uri,
            can_reconnect,
            disposed,
            connector: StdMutex::new(Some(connector)),
            reader: Mutex::new(None),
            writer: Mutex::new(None),
        }
    }

    /// Resolves a `host:port` URI to an outgoing TCP connection. Returns
    /// `None` when the URI cannot be resolved to a socket address.
    pub fn outgoing(uri: &str) -> Option<Connection> {
        let addr: SocketAddr = uri.parse().ok()?;
        Some(Self::with_connector(uri.to_string(), true, Connector::Tcp(addr)))
    }

    /// Wraps an already-established stream, e.g. a socket handed over by the
    /// listener layer. Adopted connections cannot be re-dialed.
    pub fn adopted(uri: impl Into<String>, stream: impl AsyncStream + 'static) -> Connection {
        Self::with_connector(uri.into(), false, Connector::Adopted(Box::new(stream)))
    }

    /// A connection whose stream is supplied later through the returned
    /// sender. `connect` stays pending until the stream arrives; dropping the
    /// sender fails the connect.
    pub fn deferred(uri: impl Into<String>) -> (Connection, oneshot::Sender<Box<dyn AsyncStream>>) {
        let (stream_tx, stream_rx) = oneshot::channel();
        let connection =
            Self::with_connector(uri.into(), true, Connector::Deferred(stream_rx));
        (connection, stream_tx)
    }

    pub fn uri(&self) -> &str {
        &self.uri
    }

    pub fn can_reconnect(&self) -> bool {
        self.can_reconnect
    }

    pub fn is_disposed(&self) -> bool {
        *self.disposed.borrow()
    }

    pub fn dispose(&self) {
        self.disposed.send_replace(true);
    }

    pub async fn connect(&self) -> Result<(), ConnectionError> {
        if self.is_disposed() {
            return Err(ConnectionError::Disposed);
        }
        let connector = self
            .connector
            .lock()
            .unwrap()
            .take()
            .ok_or(ConnectionError::AlreadyConnected)?;
        let mut disposed = self.disposed.subscribe();
        let stream = tokio::select! {
            result = open(connector) => result?,
            _ = disposed.wait_for(|flag| *flag) => return Err(ConnectionError::Disposed),
        };
        let (read_half, write_half) = tokio::io::split(stream);
        *self.reader.lock().await = Some(read_half);
        *self.writer.lock().await = Some(write_half);
        Ok(())
    }

    pub async fn send(&self, data: &[u8]) -> Result<(), ConnectionError> {
        let mut disposed = self.disposed.subscribe();
        if *disposed.borrow() {
            return Err(ConnectionError::Disposed);
        }
        let mut guard = self.writer.lock().await;
        let writer = guard.as_mut().ok_or(ConnectionError::NotConnected)?;
        tokio::select! {
            result = async {
                writer.write_all(data).await?;
                writer.flush().await
            } => Ok(result?),
            _ = disposed.wait_for(|flag| *flag) => Err(ConnectionError::Disposed),
        }
    }

    pub async fn receive_exact(&self, buffer: &mut [u8]) -> Result<(), ConnectionError> {
        let mut disposed = self.disposed.subscribe();
        if *disposed.borrow() {
            return Err(ConnectionError::Disposed);
        }
        let mut guard = self.reader.lock().await;
        let reader = guard.as_mut().ok_or(ConnectionError::NotConnected)?;
        tokio::select! {
            result = reader.read_exact(buffer) => {
                result?;
                Ok(())
            }
            _ = disposed.wait_for(|flag| *flag) => Err(ConnectionError::Disposed),
        }
    }
}

async fn open(connector: Connector) -> Result<Box<dyn AsyncStream>, ConnectionError> {
    match connector {
        Connector::Tcp(addr) => Ok(Box::new(TcpStream::connect(addr).await?)),
        Connector::Adopted(stream) => Ok(stream),
        Connector::Deferred(stream_rx) => match stream_rx.await {
            Ok(stream) => Ok(stream),
            Err(_) => Err(ConnectionError::Io(std::io::Error::new(
                std::io::ErrorKind::ConnectionRefused,
                "deferred stream abandoned",
            ))),
        },
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("uri", &self.uri)
            .field("disposed", &self.is_disposed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    #[tokio::test]
    async fn adopted_stream_round_trips() {
        let (near, far) = duplex(1024);
        let connection = Connection::adopted("test:1", near);
        connection.connect().await.expect("connect");

        let (mut far_read, mut far_write) = tokio::io::split(far);
        connection.send(b"ping").await.expect("send");

        let mut received = [0u8; 4];
        far_read.read_exact(&mut received).await.expect("peer read");
        assert_eq!(&received, b"ping");

        far_write.write_all(b"pong").await.expect("peer write");
        let mut reply = [0u8; 4];
        connection.receive_exact(&mut reply).await.expect("receive");
        assert_eq!(&reply, b"pong");
    }

    #[tokio::test]
    async fn dispose_fails_pending_connect() {
        let (connection, stream_tx) = Connection::deferred("test:2");
        let connection = std::sync::Arc::new(connection);

        let dialer = connection.clone();
        let pending = tokio::spawn(async move { dialer.connect().await });
        tokio::task::yield_now().await;
        assert!(!pending.is_finished());

        connection.dispose();
        let result = pending.await.expect("join");
        assert!(matches!(result, Err(ConnectionError::Disposed)));
        drop(stream_tx);
    }

    #[tokio::test]
    async fn abandoned_deferred_stream_fails_connect() {
        let (connection, stream_tx) = Connection::deferred("test:5");
        drop(stream_tx);
        assert!(matches!(connection.connect().await, Err(ConnectionError::Io(_))));
    }

    #[tokio::test]
    async fn dispose_fails_pending_read() {
        let (near, far) = duplex(64);
        let connection = std::sync::Arc::new(Connection::adopted("test:3", near));
        connection.connect().await.expect("connect");

        let reader = connection.clone();
        let pending = tokio::spawn(async move {
            let mut buffer = [0u8; 8];
            reader.receive_exact(&mut buffer).await
        });
        tokio::task::yield_now().await;
        connection.dispose();

        let result = pending.await.expect("join");
        assert!(matches!(result, Err(ConnectionError::Disposed)));
        drop(far);
    }

    #[tokio::test]
    async fn disposed_connection_rejects_future_io() {
        let (near, _far) = duplex(64);
        let connection = Connection::adopted("test:4", near);
        connection.connect().await.expect("connect");
        connection.dispose();

        assert!(matches!(connection.send(b"x").await, Err(ConnectionError::Disposed)));
        let mut buffer = [0u8; 1];
        assert!(matches!(
            connection.receive_exact(&mut buffer).await,
            Err(ConnectionError::Disposed)
        ));
    }

    #[test]
    fn unresolvable_uri_yields_no_connection() {
        assert!(Connection::outgoing("not a uri").is_none());
        assert!(Connection::outgoing("198.51.100.7:6881").is_some());
    }
}
