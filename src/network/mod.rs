//! Network module - Framed messaging over TCP, UDP and multicast
//!
//! Provides:
//! - TCP server and client built on shared connections and a registry
//! - Typed variants that archive payloads and stamp headers
//! - UDP and multicast senders and receivers
//!
//! Incoming frames are handed to a [`MessageHandler`] on the I/O threads.

mod client;
mod connection;
mod multicast;
mod registry;
mod server;
mod typed;
mod udp;

pub use client::*;
pub use connection::*;
pub use multicast::*;
pub use registry::*;
pub use server::*;
pub use typed::*;
pub use udp::*;

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;

use crate::protocol::{Endpoint, ReceivedMessage};

/// Receives complete frames from any transport
///
/// Called from I/O worker threads; implementations must not block for long.
pub trait MessageHandler: Send + Sync {
    fn on_message(&self, message: ReceivedMessage, from: &Endpoint);

    /// A connection or socket hit an error and is about to close
    fn on_error(&self, _error: &ConnectionError, _from: &Endpoint) {}

    fn on_connected(&self, _peer: &Endpoint) {}

    fn on_disconnected(&self, _peer: &Endpoint) {}
}

impl<F> MessageHandler for F
where
    F: Fn(ReceivedMessage, &Endpoint) + Send + Sync,
{
    fn on_message(&self, message: ReceivedMessage, from: &Endpoint) {
        self(message, from)
    }
}

/// Nagle algorithm setting for TCP sockets
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SendOption {
    NagleOn,
    #[default]
    NagleOff,
}

/// Datagram addressing mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UdpOption {
    Broadcast,
    #[default]
    Unicast,
}

/// Resolve an endpoint to a socket address
pub async fn resolve_host(endpoint: &Endpoint) -> std::io::Result<SocketAddr> {
    use tokio::net::lookup_host;

    let mut addrs = lookup_host((endpoint.host.as_str(), endpoint.port)).await?;

    addrs.next().ok_or_else(|| {
        std::io::Error::new(
            std::io::ErrorKind::NotFound,
            format!("Could not resolve host: {}", endpoint.host),
        )
    })
}

/// Blocking variant of [`resolve_host`] for the datagram senders
pub fn resolve_host_blocking(endpoint: &Endpoint) -> std::io::Result<SocketAddr> {
    use std::net::ToSocketAddrs;

    (endpoint.host.as_str(), endpoint.port)
        .to_socket_addrs()?
        .next()
        .ok_or_else(|| {
            std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("Could not resolve host: {}", endpoint.host),
            )
        })
}
