//! UDP senders and receivers
//!
//! Every datagram carries exactly one frame. Senders are plain blocking
//! sockets; receivers run a receive loop on the I/O thread group.

use bytes::Bytes;
use serde::Serialize;
use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use thiserror::Error;
use tokio::runtime::Handle;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use super::{resolve_host_blocking, ConnectionError, MessageHandler, UdpOption};
use crate::protocol::{
    build_object, build_protobuf, ArchiveType, BuildError, Endpoint, FrameDecoder, MessageBuilder,
};

/// Largest payload a UDP datagram can carry over IPv4
pub const UDP_DATAGRAM_MAX_SIZE: usize = 65507;

/// Default socket send/receive buffer size
pub const DEFAULT_UDP_BUF_SIZE: usize = 8192;

/// UDP errors
#[derive(Error, Debug)]
pub enum UdpError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to build message: {0}")]
    Build(#[from] BuildError),

    #[error("Datagram of {size} bytes exceeds the maximum of {max}")]
    MessageTooLarge { size: usize, max: usize },

    #[error("Not an IPv4 multicast group: {0}")]
    NotMulticast(String),
}

pub type UdpResult<T> = Result<T, UdpError>;

/// Datagram socket settings
#[derive(Debug, Clone)]
pub struct UdpOptions {
    pub udp_option: UdpOption,
    pub max_datagram_size: usize,
    /// Kernel send/receive buffer size
    pub buffer_size: usize,
    pub decoder: FrameDecoder,
}

impl Default for UdpOptions {
    fn default() -> Self {
        Self {
            udp_option: UdpOption::default(),
            max_datagram_size: UDP_DATAGRAM_MAX_SIZE,
            buffer_size: DEFAULT_UDP_BUF_SIZE,
            decoder: FrameDecoder::default(),
        }
    }
}

fn unspecified_for(target: &SocketAddr) -> SocketAddr {
    match target {
        SocketAddr::V4(_) => SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0)),
        SocketAddr::V6(_) => SocketAddr::from((Ipv6Addr::UNSPECIFIED, 0)),
    }
}

pub(crate) fn datagram_socket(family: &SocketAddr) -> UdpResult<Socket> {
    Ok(Socket::new(
        Domain::for_address(*family),
        Type::DGRAM,
        Some(Protocol::UDP),
    )?)
}

pub(crate) fn check_datagram_size(size: usize, max: usize) -> UdpResult<()> {
    if size > max {
        return Err(UdpError::MessageTooLarge { size, max });
    }
    Ok(())
}

/// A running datagram receive loop
pub(crate) struct DatagramListener {
    local_addr: SocketAddr,
    shutdown: watch::Sender<bool>,
    task: Option<JoinHandle<()>>,
}

impl DatagramListener {
    /// Hand a bound socket to the I/O thread group and start receiving
    pub(crate) fn spawn(
        handle: &Handle,
        socket: Socket,
        max_datagram_size: usize,
        decoder: FrameDecoder,
        handler: Arc<dyn MessageHandler>,
    ) -> UdpResult<Self> {
        socket.set_nonblocking(true)?;
        let socket: std::net::UdpSocket = socket.into();
        let local_addr = socket.local_addr()?;

        let socket = {
            let _runtime = handle.enter();
            tokio::net::UdpSocket::from_std(socket)?
        };

        let (shutdown, mut shutdown_rx) = watch::channel(false);
        let task = handle.spawn(async move {
            let mut buf = vec![0u8; max_datagram_size.max(crate::protocol::HEADER_LEN)];
            loop {
                tokio::select! {
                    result = socket.recv_from(&mut buf) => match result {
                        Ok((len, from)) => {
                            let from = Endpoint::from(from);
                            match decoder.decode_frame(&buf[..len]) {
                                Ok(message) => handler.on_message(message, &from),
                                Err(e) => {
                                    tracing::warn!("Discarding datagram from {}: {}", from, e);
                                    handler.on_error(&ConnectionError::Protocol(e), &from);
                                }
                            }
                        }
                        Err(e) => {
                            tracing::warn!("UDP receive error on {}: {}", local_addr, e);
                        }
                    },
                    _ = shutdown_rx.wait_for(|stop| *stop) => break,
                }
            }
            tracing::debug!("UDP receiver on {} stopped", local_addr);
        });

        Ok(Self {
            local_addr,
            shutdown,
            task: Some(task),
        })
    }

    pub(crate) fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub(crate) fn close(&mut self) {
        if let Some(task) = self.task.take() {
            self.shutdown.send_replace(true);
            task.abort();
        }
    }

    pub(crate) fn is_running(&self) -> bool {
        self.task.is_some()
    }
}

impl Drop for DatagramListener {
    fn drop(&mut self) {
        self.close();
    }
}

/// Sends frames to one unicast or broadcast address
pub struct UdpSender {
    socket: std::net::UdpSocket,
    target: SocketAddr,
    max_datagram_size: usize,
}

impl UdpSender {
    pub fn new(target: &Endpoint, options: &UdpOptions) -> UdpResult<Self> {
        let target = resolve_host_blocking(target)?;
        let socket = datagram_socket(&target)?;

        if options.udp_option == UdpOption::Broadcast {
            socket.set_broadcast(true)?;
        }
        socket.set_send_buffer_size(options.buffer_size)?;
        socket.bind(&SockAddr::from(unspecified_for(&target)))?;

        tracing::debug!("UDP sender ready for {}", target);
        Ok(Self {
            socket: socket.into(),
            target,
            max_datagram_size: options.max_datagram_size,
        })
    }

    pub fn target(&self) -> SocketAddr {
        self.target
    }

    /// Send one pre-built frame
    pub fn send(&self, frame: &[u8]) -> UdpResult<()> {
        check_datagram_size(frame.len(), self.max_datagram_size)?;
        self.socket.send_to(frame, self.target)?;
        Ok(())
    }
}

/// Receives frames sent to a local UDP port
pub struct UdpReceiver {
    listener: DatagramListener,
}

impl UdpReceiver {
    /// Bind `port` on all interfaces and deliver frames to `handler`
    pub fn bind(
        handle: &Handle,
        port: u16,
        options: &UdpOptions,
        handler: Arc<dyn MessageHandler>,
    ) -> UdpResult<Self> {
        let addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, port));
        let socket = datagram_socket(&addr)?;
        socket.set_reuse_address(true)?;
        if options.udp_option == UdpOption::Broadcast {
            socket.set_broadcast(true)?;
        }
        socket.set_recv_buffer_size(options.buffer_size)?;
        socket.bind(&SockAddr::from(addr))?;

        let listener = DatagramListener::spawn(
            handle,
            socket,
            options.max_datagram_size,
            options.decoder.clone(),
            handler,
        )?;
        tracing::info!("UDP receiver listening on {}", listener.local_addr());

        Ok(Self { listener })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.listener.local_addr()
    }

    pub fn is_running(&self) -> bool {
        self.listener.is_running()
    }

    /// Stop receiving; safe to call more than once
    pub fn close(&mut self) {
        self.listener.close();
    }
}

/// UDP sender that builds its own frames
pub struct UdpTypedSender {
    sender: UdpSender,
    builder: Arc<dyn MessageBuilder>,
    archive: ArchiveType,
}

impl UdpTypedSender {
    pub fn new(
        target: &Endpoint,
        options: &UdpOptions,
        builder: Arc<dyn MessageBuilder>,
        archive: ArchiveType,
    ) -> UdpResult<Self> {
        Ok(Self {
            sender: UdpSender::new(target, options)?,
            builder,
            archive,
        })
    }

    pub fn sender(&self) -> &UdpSender {
        &self.sender
    }

    pub fn archive(&self) -> ArchiveType {
        self.archive
    }

    pub fn send_header(&self, message_id: i32, response: &Endpoint) -> UdpResult<()> {
        let frame = self
            .builder
            .build_header_only(message_id, response)
            .map_err(BuildError::from)?;
        self.sender.send(&frame)
    }

    pub fn send_raw(&self, message_id: i32, body: &[u8], response: &Endpoint) -> UdpResult<()> {
        let frame = self
            .builder
            .build(message_id, response, ArchiveType::Raw, body)
            .map_err(BuildError::from)?;
        self.sender.send(&frame)
    }

    pub fn send<T: Serialize + ?Sized>(
        &self,
        message_id: i32,
        value: &T,
        response: &Endpoint,
    ) -> UdpResult<()> {
        let frame: Bytes = build_object(
            self.builder.as_ref(),
            value,
            self.archive,
            message_id,
            response,
        )?;
        self.sender.send(&frame)
    }

    pub fn send_protobuf<M: prost::Message>(
        &self,
        message_id: i32,
        value: &M,
        response: &Endpoint,
    ) -> UdpResult<()> {
        let frame = build_protobuf(self.builder.as_ref(), value, message_id, response)?;
        self.sender.send(&frame)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{DefaultMessageBuilder, ReceivedMessage};
    use crate::threads::ConcurrentQueue;
    use std::time::Duration;

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_udp_round_trip() {
        let inbox: Arc<ConcurrentQueue<ReceivedMessage>> = Arc::new(ConcurrentQueue::new());
        let mut receiver =
            UdpReceiver::bind(&Handle::current(), 0, &UdpOptions::default(), inbox.clone()).unwrap();
        let port = receiver.local_addr().port();

        let sender = UdpTypedSender::new(
            &Endpoint::new("127.0.0.1", port),
            &UdpOptions::default(),
            Arc::new(DefaultMessageBuilder::default()),
            ArchiveType::Json,
        )
        .unwrap();
        sender
            .send(21, &vec![1u16, 2, 3], &Endpoint::new("127.0.0.1", 6000))
            .unwrap();

        let message = tokio::task::spawn_blocking(move || inbox.timed_pop(Duration::from_secs(5)))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(message.message_id(), 21);
        assert_eq!(message.decode_body::<Vec<u16>>().unwrap(), vec![1, 2, 3]);
        assert_eq!(message.response_address(), &Endpoint::new("127.0.0.1", 6000));

        receiver.close();
        receiver.close();
        assert!(!receiver.is_running());
    }

    #[test]
    fn test_oversized_datagram_rejected() {
        let options = UdpOptions {
            max_datagram_size: 64,
            ..Default::default()
        };
        let sender = UdpTypedSender::new(
            &Endpoint::new("127.0.0.1", 9),
            &options,
            Arc::new(DefaultMessageBuilder::default()),
            ArchiveType::Raw,
        )
        .unwrap();

        assert!(matches!(
            sender.send_raw(1, &[0u8; 100], &Endpoint::null()),
            Err(UdpError::MessageTooLarge { max: 64, .. })
        ));
    }
}
