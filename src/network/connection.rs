//! TCP connection handling
//!
//! A `TcpConnection` owns one socket. Two tasks run on the I/O thread group
//! per connection:
//! - the reader reassembles frames and hands them to the message handler
//! - the writer drains the outbound queue in order
//!
//! Both tasks hold an `Arc` on the connection, so it stays alive while any of
//! its I/O is in flight.

use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::runtime::Handle;
use tokio::sync::{mpsc, oneshot, watch};

use super::{resolve_host, ConnectionRegistry, MessageHandler, SendOption};
use crate::archive::ArchiveError;
use crate::protocol::{BuildError, Endpoint, FrameDecoder, ProtocolError};

/// Default cap on queued async messages per connection
pub const DEFAULT_MAX_UNSENT_ASYNC_MESSAGES: usize = 1000;

/// Default initial capacity of a connection's read buffer (512 KiB)
pub const DEFAULT_RESERVED_BUFFER_SIZE: usize = 512 * 1024;

/// Connection errors
#[derive(Error, Debug)]
pub enum ConnectionError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Archive error: {0}")]
    Archive(#[from] ArchiveError),

    #[error("Connection is not connected")]
    NotConnected,

    #[error("Unknown connection: {0}")]
    UnknownConnection(Endpoint),

    #[error("Too many unsent async messages (limit: {limit})")]
    Backpressure { limit: usize },

    #[error("Connection closed")]
    Closed,

    #[error("Connection timeout")]
    Timeout,
}

impl From<BuildError> for ConnectionError {
    fn from(err: BuildError) -> Self {
        match err {
            BuildError::Protocol(e) => ConnectionError::Protocol(e),
            BuildError::Archive(e) => ConnectionError::Archive(e),
        }
    }
}

pub type ConnectionResult<T> = Result<T, ConnectionError>;

/// State of a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    /// Outbound connect in progress
    Connecting,
    Connected,
    /// `close` has been called; teardown in progress
    Closing,
}

/// Per-connection settings
#[derive(Debug, Clone)]
pub struct ConnectionOptions {
    pub send_option: SendOption,
    /// Async sends beyond this many queued frames fail with `Backpressure`
    pub max_unsent: usize,
    /// Initial capacity of the read buffer
    pub reserved_buffer_size: usize,
    pub decoder: FrameDecoder,
    pub connect_timeout: Duration,
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        Self {
            send_option: SendOption::default(),
            max_unsent: DEFAULT_MAX_UNSENT_ASYNC_MESSAGES,
            reserved_buffer_size: DEFAULT_RESERVED_BUFFER_SIZE,
            decoder: FrameDecoder::default(),
            connect_timeout: Duration::from_secs(5),
        }
    }
}

enum Outbound {
    Async(Bytes),
    Sync(Bytes, oneshot::Sender<io::Result<()>>),
}

/// One TCP socket and its I/O tasks
pub struct TcpConnection {
    peer: Endpoint,
    local: Endpoint,
    state: Mutex<ConnectionState>,
    outbound: mpsc::UnboundedSender<Outbound>,
    unsent: AtomicUsize,
    max_unsent: usize,
    shutdown: watch::Sender<bool>,
    registry: Weak<ConnectionRegistry>,
    handler: Arc<dyn MessageHandler>,
}

impl TcpConnection {
    /// Connect to `target` and start the connection's tasks on `handle`
    pub async fn connect(
        handle: &Handle,
        target: &Endpoint,
        options: &ConnectionOptions,
        handler: Arc<dyn MessageHandler>,
    ) -> ConnectionResult<Arc<Self>> {
        let addr = resolve_host(target).await?;
        tracing::debug!("Connecting to {} ({})", target, addr);

        let stream = tokio::time::timeout(options.connect_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| ConnectionError::Timeout)??;

        Self::start(handle, stream, options, handler, Weak::new())
    }

    /// Take ownership of an established stream and start reading and writing
    pub fn start(
        handle: &Handle,
        stream: TcpStream,
        options: &ConnectionOptions,
        handler: Arc<dyn MessageHandler>,
        registry: Weak<ConnectionRegistry>,
    ) -> ConnectionResult<Arc<Self>> {
        stream.set_nodelay(options.send_option == SendOption::NagleOff)?;
        let peer = Endpoint::from(stream.peer_addr()?);
        let local = Endpoint::from(stream.local_addr()?);
        let (reader, writer) = stream.into_split();

        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        let (shutdown, shutdown_rx) = watch::channel(false);

        let connection = Arc::new(Self {
            peer,
            local,
            state: Mutex::new(ConnectionState::Connected),
            outbound,
            unsent: AtomicUsize::new(0),
            max_unsent: options.max_unsent,
            shutdown,
            registry,
            handler,
        });

        if let Some(registry) = connection.registry.upgrade() {
            if let Err(e) = registry.add(connection.clone()) {
                // Dropping the halves closes the socket
                *connection.state.lock() = ConnectionState::Disconnected;
                tracing::debug!("Refusing connection from {}: {}", connection.peer, e);
                return Err(e);
            }
        }
        tracing::info!("Connection established: {} -> {}", connection.local, connection.peer);
        connection.handler.on_connected(&connection.peer);

        handle.spawn(connection.clone().read_loop(
            reader,
            options.decoder.clone(),
            options.reserved_buffer_size,
            shutdown_rx.clone(),
        ));
        handle.spawn(connection.clone().write_loop(writer, outbound_rx, shutdown_rx));

        Ok(connection)
    }

    /// Remote end of the socket; the connection's registry key
    pub fn peer(&self) -> &Endpoint {
        &self.peer
    }

    /// Local end of the socket
    pub fn local(&self) -> &Endpoint {
        &self.local
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.lock()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Number of async frames queued but not yet written
    pub fn unsent_async_messages(&self) -> usize {
        self.unsent.load(Ordering::SeqCst)
    }

    /// Queue a frame for writing without waiting
    pub fn send_async(&self, frame: Bytes) -> ConnectionResult<()> {
        if !self.is_connected() {
            return Err(ConnectionError::NotConnected);
        }

        let limit = self.max_unsent;
        self.unsent
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                (n < limit).then_some(n + 1)
            })
            .map_err(|_| ConnectionError::Backpressure { limit })?;

        if self.outbound.send(Outbound::Async(frame)).is_err() {
            self.unsent.fetch_sub(1, Ordering::SeqCst);
            return Err(ConnectionError::Closed);
        }
        Ok(())
    }

    /// Queue a frame and wait until it has been written
    pub async fn send_sync(&self, frame: Bytes) -> ConnectionResult<()> {
        if !self.is_connected() {
            return Err(ConnectionError::NotConnected);
        }

        let (ack, written) = oneshot::channel();
        self.outbound
            .send(Outbound::Sync(frame, ack))
            .map_err(|_| ConnectionError::Closed)?;

        written.await.map_err(|_| ConnectionError::Closed)??;
        Ok(())
    }

    /// Cancel pending I/O and tear the connection down
    ///
    /// Safe to call more than once.
    pub fn close(&self) {
        {
            let mut state = self.state.lock();
            if matches!(*state, ConnectionState::Disconnected | ConnectionState::Closing) {
                return;
            }
            *state = ConnectionState::Closing;
        }
        tracing::debug!("Closing connection to {}", self.peer);
        self.finish();
    }

    fn finish(&self) {
        let previous = std::mem::replace(&mut *self.state.lock(), ConnectionState::Disconnected);
        self.shutdown.send_replace(true);

        if previous == ConnectionState::Disconnected {
            return;
        }

        if let Some(registry) = self.registry.upgrade() {
            registry.remove_connection(self);
        }
        tracing::info!("Connection to {} closed", self.peer);
        self.handler.on_disconnected(&self.peer);
    }

    async fn read_loop(
        self: Arc<Self>,
        mut reader: OwnedReadHalf,
        decoder: FrameDecoder,
        reserved_buffer_size: usize,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut buf = BytesMut::with_capacity(reserved_buffer_size);

        loop {
            tokio::select! {
                result = reader.read_buf(&mut buf) => match result {
                    Ok(0) => {
                        tracing::debug!("Connection closed by peer {}", self.peer);
                        break;
                    }
                    Ok(_) => {
                        if let Err(e) = self.dispatch_frames(&decoder, &mut buf) {
                            tracing::warn!("Dropping connection to {}: {}", self.peer, e);
                            buf.clear();
                            self.handler.on_error(&e, &self.peer);
                            break;
                        }
                    }
                    Err(e) => {
                        tracing::warn!("Read error from {}: {}", self.peer, e);
                        self.handler.on_error(&ConnectionError::Io(e), &self.peer);
                        break;
                    }
                },
                _ = shutdown.wait_for(|stop| *stop) => break,
            }
        }

        self.finish();
    }

    fn dispatch_frames(&self, decoder: &FrameDecoder, buf: &mut BytesMut) -> ConnectionResult<()> {
        while let Some(message) = decoder.decode(buf)? {
            self.handler.on_message(message, &self.peer);
        }
        Ok(())
    }

    async fn write_loop(
        self: Arc<Self>,
        mut writer: OwnedWriteHalf,
        mut outbound: mpsc::UnboundedReceiver<Outbound>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        loop {
            let item = tokio::select! {
                item = outbound.recv() => item,
                _ = shutdown.wait_for(|stop| *stop) => None,
            };
            let Some(item) = item else { break };

            let (frame, ack) = match item {
                Outbound::Async(frame) => (frame, None),
                Outbound::Sync(frame, ack) => (frame, Some(ack)),
            };

            let result = tokio::select! {
                result = writer.write_all(&frame) => result,
                _ = shutdown.wait_for(|stop| *stop) => {
                    Err(io::Error::new(io::ErrorKind::ConnectionAborted, "connection closed"))
                }
            };

            match result {
                Ok(()) => match ack {
                    Some(ack) => {
                        let _ = ack.send(Ok(()));
                    }
                    None => {
                        self.unsent.fetch_sub(1, Ordering::SeqCst);
                    }
                },
                Err(e) => {
                    match ack {
                        Some(ack) => {
                            let _ = ack.send(Err(io::Error::new(e.kind(), e.to_string())));
                        }
                        None => {
                            self.unsent.fetch_sub(1, Ordering::SeqCst);
                        }
                    }
                    if !*shutdown.borrow() {
                        tracing::warn!("Write error to {}: {}", self.peer, e);
                        self.handler.on_error(&ConnectionError::Io(e), &self.peer);
                    }
                    break;
                }
            }
        }

        outbound.close();
        while let Ok(item) = outbound.try_recv() {
            if let Outbound::Async(_) = item {
                self.unsent.fetch_sub(1, Ordering::SeqCst);
            }
        }
        let _ = writer.shutdown().await;

        self.finish();
    }
}

impl std::fmt::Debug for TcpConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TcpConnection")
            .field("peer", &self.peer)
            .field("local", &self.local)
            .field("state", &self.state())
            .field("unsent", &self.unsent_async_messages())
            .finish()
    }
}
