//! TCP client
//!
//! Holds one outbound connection to a server and reconnects on demand when a
//! synchronous send finds it down.

use bytes::Bytes;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::runtime::Handle;

use super::{ConnectionError, ConnectionOptions, ConnectionState, MessageHandler, TcpConnection};
use crate::protocol::{BuildError, Endpoint};

/// Client errors
#[derive(Error, Debug)]
pub enum ClientError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Connection error: {0}")]
    Connection(#[from] ConnectionError),

    #[error("Failed to build message: {0}")]
    Build(#[from] BuildError),
}

pub type ClientResult<T> = Result<T, ClientError>;

/// TCP client
pub struct TcpClient {
    handle: Handle,
    server: Endpoint,
    options: ConnectionOptions,
    handler: Arc<dyn MessageHandler>,
    connection: Mutex<Option<Arc<TcpConnection>>>,
    connecting: AtomicBool,
    connect_lock: tokio::sync::Mutex<()>,
}

impl TcpClient {
    pub fn new(
        handle: Handle,
        server: Endpoint,
        options: ConnectionOptions,
        handler: Arc<dyn MessageHandler>,
    ) -> Self {
        Self {
            handle,
            server,
            options,
            handler,
            connection: Mutex::new(None),
            connecting: AtomicBool::new(false),
            connect_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn server(&self) -> &Endpoint {
        &self.server
    }

    /// Connect to the server unless already connected
    pub async fn connect(&self) -> ClientResult<()> {
        let _serialized = self.connect_lock.lock().await;
        if self.is_connected() {
            return Ok(());
        }

        self.connecting.store(true, Ordering::SeqCst);
        let result = TcpConnection::connect(
            &self.handle,
            &self.server,
            &self.options,
            self.handler.clone(),
        )
        .await;
        self.connecting.store(false, Ordering::SeqCst);

        match result {
            Ok(connection) => {
                tracing::info!("Connected to server {}", self.server);
                *self.connection.lock() = Some(connection);
                Ok(())
            }
            Err(e) => {
                tracing::error!("Failed to connect to {}: {}", self.server, e);
                self.handler.on_error(&e, &self.server);
                Err(e.into())
            }
        }
    }

    pub fn state(&self) -> ConnectionState {
        if self.connecting.load(Ordering::SeqCst) {
            return ConnectionState::Connecting;
        }
        self.connection
            .lock()
            .as_ref()
            .map(|c| c.state())
            .unwrap_or(ConnectionState::Disconnected)
    }

    pub fn is_connected(&self) -> bool {
        self.current().is_some_and(|c| c.is_connected())
    }

    /// Local end of the connection, as the server sees this client
    pub fn local_endpoint(&self) -> ClientResult<Endpoint> {
        self.live().map(|c| c.local().clone())
    }

    pub fn unsent_async_messages(&self) -> usize {
        self.current().map_or(0, |c| c.unsent_async_messages())
    }

    /// Queue a frame; fails if the client is not connected
    pub fn send_async(&self, frame: Bytes) -> ClientResult<()> {
        Ok(self.live()?.send_async(frame)?)
    }

    /// Send a frame and wait for the write, reconnecting first if needed
    pub async fn send_sync(&self, frame: Bytes) -> ClientResult<()> {
        if !self.is_connected() {
            self.connect().await?;
        }
        let connection = self.live()?;
        Ok(connection.send_sync(frame).await?)
    }

    /// Close the connection; a later `connect` or `send_sync` reopens it
    pub fn close(&self) {
        if let Some(connection) = self.connection.lock().take() {
            connection.close();
        }
    }

    fn current(&self) -> Option<Arc<TcpConnection>> {
        self.connection.lock().clone()
    }

    fn live(&self) -> ClientResult<Arc<TcpConnection>> {
        self.current()
            .filter(|c| c.is_connected())
            .ok_or(ClientError::Connection(ConnectionError::NotConnected))
    }
}

impl Drop for TcpClient {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::TcpServer;
    use crate::protocol::{ArchiveType, DefaultMessageBuilder, MessageBuilder, ReceivedMessage};
    use crate::threads::ConcurrentQueue;
    use std::time::Duration;

    fn queue() -> Arc<ConcurrentQueue<ReceivedMessage>> {
        Arc::new(ConcurrentQueue::new())
    }

    fn frame(id: i32) -> Bytes {
        DefaultMessageBuilder::default()
            .build(id, &Endpoint::null(), ArchiveType::Raw, b"body")
            .unwrap()
    }

    #[tokio::test]
    async fn test_send_before_connect_fails() {
        let client = TcpClient::new(
            Handle::current(),
            Endpoint::new("127.0.0.1", 1),
            ConnectionOptions::default(),
            queue(),
        );

        assert_eq!(client.state(), ConnectionState::Disconnected);
        assert!(matches!(
            client.send_async(frame(1)),
            Err(ClientError::Connection(ConnectionError::NotConnected))
        ));
        assert!(client.local_endpoint().is_err());
        assert_eq!(client.unsent_async_messages(), 0);
    }

    #[tokio::test]
    async fn test_send_sync_reconnects() {
        let received = queue();
        let server = TcpServer::new(
            Handle::current(),
            0,
            ConnectionOptions::default(),
            received.clone(),
        );
        let addr = server.start().unwrap();

        let client = TcpClient::new(
            Handle::current(),
            Endpoint::new("127.0.0.1", addr.port()),
            ConnectionOptions::default(),
            queue(),
        );

        client.send_sync(frame(1)).await.unwrap();
        assert!(client.is_connected());
        let local = client.local_endpoint().unwrap();
        assert_eq!(local.host, "127.0.0.1");

        client.close();
        assert!(!client.is_connected());
        client.send_sync(frame(2)).await.unwrap();

        let mut ids = Vec::new();
        for _ in 0..500 {
            if let Some(msg) = received.try_pop() {
                ids.push(msg.message_id());
                if ids.len() == 2 {
                    break;
                }
            } else {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        }
        ids.sort();
        assert_eq!(ids, vec![1, 2]);
    }
}
