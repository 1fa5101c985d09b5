//! TCP server
//!
//! Accepts connections, registers each one and feeds their frames to the
//! server's message handler.

use bytes::Bytes;
use parking_lot::Mutex;
use std::net::SocketAddr;
use std::sync::Arc;
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::{ConnectionError, ConnectionOptions, ConnectionRegistry, MessageHandler, TcpConnection};
use crate::protocol::{BuildError, Endpoint};

/// Server errors
#[derive(Error, Debug)]
pub enum ServerError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Connection error: {0}")]
    Connection(#[from] ConnectionError),

    #[error("Failed to build message: {0}")]
    Build(#[from] BuildError),

    #[error("Server already running")]
    AlreadyRunning,

    #[error("Server not running")]
    NotRunning,

    #[error("Bind failed: {0}")]
    BindFailed(String),
}

pub type ServerResult<T> = Result<T, ServerError>;

struct Acceptor {
    local_addr: SocketAddr,
    shutdown_tx: mpsc::Sender<()>,
    task: JoinHandle<()>,
}

/// TCP server
pub struct TcpServer {
    handle: Handle,
    listen_port: u16,
    options: ConnectionOptions,
    handler: Arc<dyn MessageHandler>,
    registry: Arc<ConnectionRegistry>,
    acceptor: Mutex<Option<Acceptor>>,
}

impl TcpServer {
    /// Create a server that will listen on `listen_port` on all interfaces
    ///
    /// Port 0 picks a free port at `start`.
    pub fn new(
        handle: Handle,
        listen_port: u16,
        options: ConnectionOptions,
        handler: Arc<dyn MessageHandler>,
    ) -> Self {
        Self {
            handle,
            listen_port,
            options,
            handler,
            registry: Arc::new(ConnectionRegistry::new()),
            acceptor: Mutex::new(None),
        }
    }

    /// Bind and start accepting connections
    pub fn start(&self) -> ServerResult<SocketAddr> {
        let mut acceptor = self.acceptor.lock();
        if acceptor.is_some() {
            return Err(ServerError::AlreadyRunning);
        }

        let bind_addr = SocketAddr::from(([0, 0, 0, 0], self.listen_port));
        let listener = std::net::TcpListener::bind(bind_addr).map_err(|e| {
            ServerError::BindFailed(format!("Failed to bind to {}: {}", bind_addr, e))
        })?;
        listener.set_nonblocking(true)?;

        let listener = {
            let _runtime = self.handle.enter();
            TcpListener::from_std(listener)?
        };
        let local_addr = listener.local_addr()?;
        self.registry.reopen();
        tracing::info!("Server listening on {}", local_addr);

        let (shutdown_tx, mut shutdown_rx) = mpsc::channel::<()>(1);

        let handle = self.handle.clone();
        let options = self.options.clone();
        let handler = self.handler.clone();
        let registry = self.registry.clone();

        let task = self.handle.spawn(async move {
            loop {
                tokio::select! {
                    result = listener.accept() => {
                        match result {
                            Ok((stream, addr)) => {
                                tracing::info!("New connection from {}", addr);
                                match TcpConnection::start(
                                    &handle,
                                    stream,
                                    &options,
                                    handler.clone(),
                                    Arc::downgrade(&registry),
                                ) {
                                    Ok(_) => {}
                                    Err(ConnectionError::Closed) => {
                                        tracing::debug!("Server stopping, dropped connection from {}", addr);
                                    }
                                    Err(e) => {
                                        tracing::error!("Failed to start connection from {}: {}", addr, e);
                                    }
                                }
                            }
                            Err(e) => {
                                tracing::error!("Accept error: {}", e);
                            }
                        }
                    }
                    _ = shutdown_rx.recv() => {
                        tracing::info!("Server shutdown requested");
                        break;
                    }
                }
            }
        });

        *acceptor = Some(Acceptor {
            local_addr,
            shutdown_tx,
            task,
        });

        Ok(local_addr)
    }

    /// Stop accepting and close every client connection
    ///
    /// A connection the accept loop is still starting is refused by the
    /// shut-down registry, so none outlives this call.
    pub fn stop(&self) -> ServerResult<()> {
        let acceptor = self.acceptor.lock().take().ok_or(ServerError::NotRunning)?;

        let _ = acceptor.shutdown_tx.try_send(());
        acceptor.task.abort();
        self.registry.shutdown();

        tracing::info!("Server on {} stopped", acceptor.local_addr);
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.acceptor.lock().is_some()
    }

    /// Bound port while running, otherwise the configured one
    pub fn listen_port(&self) -> u16 {
        self.acceptor
            .lock()
            .as_ref()
            .map(|a| a.local_addr.port())
            .unwrap_or(self.listen_port)
    }

    /// Address the server is reachable on from `client`'s point of view
    ///
    /// The NULL endpoint maps to `0.0.0.0:<listen port>`; any other client
    /// maps to the local end of its connection.
    pub fn server_details_for_client(&self, client: &Endpoint) -> ServerResult<Endpoint> {
        if client.is_null() {
            return Ok(Endpoint::new("0.0.0.0", self.listen_port()));
        }
        Ok(self.registry.local_endpoint_for(client)?)
    }

    pub fn number_of_clients(&self) -> usize {
        self.registry.len()
    }

    pub fn clients(&self) -> Vec<Endpoint> {
        self.registry.endpoints()
    }

    pub fn is_client_connected(&self, client: &Endpoint) -> bool {
        self.registry.find(client).is_some_and(|c| c.is_connected())
    }

    pub fn unsent_async_messages(&self, client: &Endpoint) -> ServerResult<usize> {
        Ok(self.registry.unsent_async_messages(client)?)
    }

    pub fn send_to_client_async(&self, client: &Endpoint, frame: Bytes) -> ServerResult<()> {
        self.ensure_running()?;
        Ok(self.registry.send_async(client, frame)?)
    }

    pub async fn send_to_client_sync(&self, client: &Endpoint, frame: Bytes) -> ServerResult<()> {
        self.ensure_running()?;
        Ok(self.registry.send_sync(client, frame).await?)
    }

    /// Queue `frame` on every client; returns how many accepted it
    pub fn send_to_all(&self, frame: Bytes) -> ServerResult<usize> {
        self.ensure_running()?;
        Ok(self.registry.send_to_all(frame))
    }

    pub fn close_client(&self, client: &Endpoint) -> ServerResult<()> {
        let connection = self.registry.get(client)?;
        connection.close();
        Ok(())
    }

    fn ensure_running(&self) -> ServerResult<()> {
        if self.is_running() {
            Ok(())
        } else {
            Err(ServerError::NotRunning)
        }
    }
}

impl Drop for TcpServer {
    fn drop(&mut self) {
        if self.is_running() {
            let _ = self.stop();
        }
    }
}
