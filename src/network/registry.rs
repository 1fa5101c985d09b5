//! Registry of live TCP connections, keyed by peer endpoint

use bytes::Bytes;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use super::{ConnectionError, ConnectionResult, TcpConnection};
use crate::protocol::Endpoint;

/// Thread-safe map of peer endpoint to connection
#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    connections: RwLock<HashMap<Endpoint, Arc<TcpConnection>>>,
    /// Set by `shutdown`; only read or written under the `connections` write lock
    shut_down: AtomicBool,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a connection and return its id
    ///
    /// Fails with `Closed` once the registry has been shut down.
    pub fn add(&self, connection: Arc<TcpConnection>) -> ConnectionResult<Endpoint> {
        let id = connection.peer().clone();
        let previous = {
            let mut connections = self.connections.write();
            if self.shut_down.load(Ordering::SeqCst) {
                return Err(ConnectionError::Closed);
            }
            connections.insert(id.clone(), connection)
        };
        if let Some(previous) = previous {
            tracing::warn!("Replacing stale connection for {}", id);
            previous.close();
        }
        Ok(id)
    }

    pub fn remove(&self, id: &Endpoint) -> Option<Arc<TcpConnection>> {
        self.connections.write().remove(id)
    }

    /// Remove `connection` only if it is the one registered under its peer
    pub(crate) fn remove_connection(&self, connection: &TcpConnection) {
        let mut connections = self.connections.write();
        let registered = connections
            .get(connection.peer())
            .is_some_and(|c| std::ptr::eq(Arc::as_ptr(c), connection));
        if registered {
            connections.remove(connection.peer());
        }
    }

    pub fn find(&self, id: &Endpoint) -> Option<Arc<TcpConnection>> {
        self.connections.read().get(id).cloned()
    }

    /// Like `find`, but an unknown id is an error
    pub fn get(&self, id: &Endpoint) -> ConnectionResult<Arc<TcpConnection>> {
        self.find(id)
            .ok_or_else(|| ConnectionError::UnknownConnection(id.clone()))
    }

    pub fn len(&self) -> usize {
        self.connections.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.read().is_empty()
    }

    pub fn endpoints(&self) -> Vec<Endpoint> {
        self.connections.read().keys().cloned().collect()
    }

    /// Close and forget every connection
    pub fn close_all(&self) {
        let drained: Vec<_> = self.connections.write().drain().map(|(_, c)| c).collect();
        for connection in drained {
            connection.close();
        }
    }

    /// Close every connection and refuse new ones until `reopen`
    pub fn shutdown(&self) {
        let drained: Vec<_> = {
            let mut connections = self.connections.write();
            self.shut_down.store(true, Ordering::SeqCst);
            connections.drain().map(|(_, c)| c).collect()
        };
        for connection in drained {
            connection.close();
        }
    }

    /// Accept connections again after `shutdown`
    pub fn reopen(&self) {
        let _connections = self.connections.write();
        self.shut_down.store(false, Ordering::SeqCst);
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::SeqCst)
    }

    pub fn send_async(&self, id: &Endpoint, frame: Bytes) -> ConnectionResult<()> {
        self.get(id)?.send_async(frame)
    }

    pub async fn send_sync(&self, id: &Endpoint, frame: Bytes) -> ConnectionResult<()> {
        let connection = self.get(id)?;
        connection.send_sync(frame).await
    }

    /// Queue `frame` on every connection; returns how many accepted it
    pub fn send_to_all(&self, frame: Bytes) -> usize {
        let connections: Vec<_> = self.connections.read().values().cloned().collect();
        connections
            .iter()
            .filter(|connection| match connection.send_async(frame.clone()) {
                Ok(()) => true,
                Err(e) => {
                    tracing::warn!("Failed to send to {}: {}", connection.peer(), e);
                    false
                }
            })
            .count()
    }

    /// Local end of the connection registered under `id`
    pub fn local_endpoint_for(&self, id: &Endpoint) -> ConnectionResult<Endpoint> {
        Ok(self.get(id)?.local().clone())
    }

    pub fn unsent_async_messages(&self, id: &Endpoint) -> ConnectionResult<usize> {
        Ok(self.get(id)?.unsent_async_messages())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::{ConnectionOptions, MessageHandler};
    use crate::protocol::ReceivedMessage;
    use std::time::Duration;
    use tokio::io::AsyncReadExt;
    use tokio::net::{TcpListener, TcpStream};
    use tokio::runtime::Handle;

    struct Ignore;

    impl MessageHandler for Ignore {
        fn on_message(&self, _message: ReceivedMessage, _from: &Endpoint) {}
    }

    async fn accepted(
        registry: &Arc<ConnectionRegistry>,
        listener: &TcpListener,
    ) -> (Arc<TcpConnection>, TcpStream) {
        let (client, server) = tokio::join!(
            TcpStream::connect(listener.local_addr().unwrap()),
            listener.accept()
        );
        let connection = TcpConnection::start(
            &Handle::current(),
            server.unwrap().0,
            &ConnectionOptions::default(),
            Arc::new(Ignore),
            Arc::downgrade(registry),
        )
        .unwrap();
        (connection, client.unwrap())
    }

    #[tokio::test]
    async fn test_add_find_remove() {
        let registry = Arc::new(ConnectionRegistry::new());
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();

        let (a, _client_a) = accepted(&registry, &listener).await;
        let (b, _client_b) = accepted(&registry, &listener).await;
        assert_eq!(registry.len(), 2);

        let found = registry.find(a.peer()).unwrap();
        assert!(Arc::ptr_eq(&found, &a));
        assert!(registry.remove(b.peer()).is_some());
        assert!(registry.find(b.peer()).is_none());

        let unknown = Endpoint::new("10.9.9.9", 1);
        assert!(matches!(
            registry.send_async(&unknown, Bytes::new()),
            Err(ConnectionError::UnknownConnection(ep)) if ep == unknown
        ));
    }

    #[tokio::test]
    async fn test_disconnect_removes_entry() {
        let registry = Arc::new(ConnectionRegistry::new());
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();

        let (a, client) = accepted(&registry, &listener).await;
        drop(client);

        for _ in 0..500 {
            if registry.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(registry.is_empty());
        assert!(!a.is_connected());
    }

    #[tokio::test]
    async fn test_close_all() {
        let registry = Arc::new(ConnectionRegistry::new());
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();

        let (a, _client_a) = accepted(&registry, &listener).await;
        let (b, _client_b) = accepted(&registry, &listener).await;

        registry.close_all();
        assert!(registry.is_empty());
        assert!(!a.is_connected());
        assert!(!b.is_connected());
        assert_eq!(registry.send_to_all(Bytes::from_static(b"x")), 0);

        // close_all does not stop later registrations
        let (c, _client_c) = accepted(&registry, &listener).await;
        assert!(registry.find(c.peer()).is_some());
    }

    #[tokio::test]
    async fn test_shutdown_refuses_late_connections() {
        let registry = Arc::new(ConnectionRegistry::new());
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let (a, _client_a) = accepted(&registry, &listener).await;

        registry.shutdown();
        assert!(registry.is_shut_down());
        assert!(registry.is_empty());
        assert!(!a.is_connected());

        // A connection accepted while the server was stopping
        let (client, server) = tokio::join!(
            TcpStream::connect(listener.local_addr().unwrap()),
            listener.accept()
        );
        let late = TcpConnection::start(
            &Handle::current(),
            server.unwrap().0,
            &ConnectionOptions::default(),
            Arc::new(Ignore),
            Arc::downgrade(&registry),
        );
        assert!(matches!(late, Err(ConnectionError::Closed)));
        assert!(registry.is_empty());

        // The refused socket is closed: the peer reads EOF
        let mut client = client.unwrap();
        let mut buf = [0u8; 1];
        let read = tokio::time::timeout(Duration::from_secs(5), client.read(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(read, 0);

        registry.reopen();
        let (b, _client_b) = accepted(&registry, &listener).await;
        assert!(registry.find(b.peer()).is_some());
    }
}
