//! UDP multicast senders and receivers

use serde::{Deserialize, Serialize};
use socket2::SockAddr;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::Arc;
use tokio::runtime::Handle;

use super::udp::{check_datagram_size, datagram_socket, DatagramListener};
use super::{resolve_host_blocking, MessageHandler, UdpError, UdpResult, DEFAULT_UDP_BUF_SIZE, UDP_DATAGRAM_MAX_SIZE};
use crate::protocol::{
    build_object, build_protobuf, ArchiveType, BuildError, Endpoint, FrameDecoder, MessageBuilder,
};

/// How far multicast datagrams may travel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MulticastTtl {
    SameHost,
    #[default]
    SameSubnet,
    SameSite,
    SameRegion,
    SameContinent,
    Unrestricted,
}

/// TTL value used for each scope
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MulticastTtlTable {
    #[serde(default = "default_same_host")]
    pub same_host: u32,
    #[serde(default = "default_same_subnet")]
    pub same_subnet: u32,
    #[serde(default = "default_same_site")]
    pub same_site: u32,
    #[serde(default = "default_same_region")]
    pub same_region: u32,
    #[serde(default = "default_same_continent")]
    pub same_continent: u32,
    #[serde(default = "default_unrestricted")]
    pub unrestricted: u32,
}

fn default_same_host() -> u32 {
    0
}

fn default_same_subnet() -> u32 {
    1
}

fn default_same_site() -> u32 {
    32
}

fn default_same_region() -> u32 {
    64
}

fn default_same_continent() -> u32 {
    128
}

fn default_unrestricted() -> u32 {
    255
}

impl Default for MulticastTtlTable {
    fn default() -> Self {
        Self {
            same_host: default_same_host(),
            same_subnet: default_same_subnet(),
            same_site: default_same_site(),
            same_region: default_same_region(),
            same_continent: default_same_continent(),
            unrestricted: default_unrestricted(),
        }
    }
}

impl MulticastTtlTable {
    pub fn ttl(&self, scope: MulticastTtl) -> u32 {
        match scope {
            MulticastTtl::SameHost => self.same_host,
            MulticastTtl::SameSubnet => self.same_subnet,
            MulticastTtl::SameSite => self.same_site,
            MulticastTtl::SameRegion => self.same_region,
            MulticastTtl::SameContinent => self.same_continent,
            MulticastTtl::Unrestricted => self.unrestricted,
        }
    }
}

/// Multicast socket settings
#[derive(Debug, Clone)]
pub struct MulticastOptions {
    pub ttl: MulticastTtl,
    pub ttl_table: MulticastTtlTable,
    /// Local interface to send from and join on; `0.0.0.0` lets the OS choose
    pub interface: Ipv4Addr,
    /// Deliver our own datagrams back to local receivers
    pub loopback: bool,
    pub max_datagram_size: usize,
    pub send_buffer_size: usize,
    pub recv_buffer_size: usize,
    pub decoder: FrameDecoder,
}

impl Default for MulticastOptions {
    fn default() -> Self {
        Self {
            ttl: MulticastTtl::default(),
            ttl_table: MulticastTtlTable::default(),
            interface: Ipv4Addr::UNSPECIFIED,
            loopback: true,
            max_datagram_size: UDP_DATAGRAM_MAX_SIZE,
            send_buffer_size: DEFAULT_UDP_BUF_SIZE,
            recv_buffer_size: DEFAULT_UDP_BUF_SIZE,
            decoder: FrameDecoder::default(),
        }
    }
}

fn multicast_group(group: &Endpoint) -> UdpResult<SocketAddrV4> {
    match resolve_host_blocking(group)? {
        SocketAddr::V4(addr) if addr.ip().is_multicast() => Ok(addr),
        _ => Err(UdpError::NotMulticast(group.to_string())),
    }
}

/// Sends frames to a multicast group
pub struct MulticastSender {
    socket: std::net::UdpSocket,
    group: SocketAddrV4,
    max_datagram_size: usize,
}

impl MulticastSender {
    pub fn new(group: &Endpoint, options: &MulticastOptions) -> UdpResult<Self> {
        let group = multicast_group(group)?;
        let bind = SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0));
        let socket = datagram_socket(&bind)?;

        let ttl = options.ttl_table.ttl(options.ttl);
        socket.set_multicast_ttl_v4(ttl)?;
        socket.set_multicast_loop_v4(options.loopback)?;
        socket.set_multicast_if_v4(&options.interface)?;
        socket.set_send_buffer_size(options.send_buffer_size)?;
        socket.bind(&SockAddr::from(bind))?;

        tracing::debug!("Multicast sender ready for {} (ttl {})", group, ttl);
        Ok(Self {
            socket: socket.into(),
            group,
            max_datagram_size: options.max_datagram_size,
        })
    }

    pub fn group(&self) -> SocketAddrV4 {
        self.group
    }

    /// Send one pre-built frame to the group
    pub fn send(&self, frame: &[u8]) -> UdpResult<()> {
        check_datagram_size(frame.len(), self.max_datagram_size)?;
        self.socket.send_to(frame, self.group)?;
        Ok(())
    }
}

/// Joins a multicast group and delivers its frames
pub struct MulticastReceiver {
    group: SocketAddrV4,
    listener: DatagramListener,
}

impl MulticastReceiver {
    pub fn bind(
        handle: &Handle,
        group: &Endpoint,
        options: &MulticastOptions,
        handler: Arc<dyn MessageHandler>,
    ) -> UdpResult<Self> {
        let group = multicast_group(group)?;
        let bind = SocketAddr::from((Ipv4Addr::UNSPECIFIED, group.port()));
        let socket = datagram_socket(&bind)?;

        socket.set_reuse_address(true)?;
        socket.set_recv_buffer_size(options.recv_buffer_size)?;
        socket.bind(&SockAddr::from(bind))?;
        socket.join_multicast_v4(group.ip(), &options.interface)?;
        socket.set_multicast_loop_v4(options.loopback)?;

        let listener = DatagramListener::spawn(
            handle,
            socket,
            options.max_datagram_size,
            options.decoder.clone(),
            handler,
        )?;
        tracing::info!("Joined multicast group {} on {}", group, options.interface);

        Ok(Self { group, listener })
    }

    pub fn group(&self) -> SocketAddrV4 {
        self.group
    }

    pub fn is_running(&self) -> bool {
        self.listener.is_running()
    }

    pub fn close(&mut self) {
        self.listener.close();
    }
}

/// Multicast sender that builds its own frames
pub struct MulticastTypedSender {
    sender: MulticastSender,
    builder: Arc<dyn MessageBuilder>,
    archive: ArchiveType,
}

impl MulticastTypedSender {
    pub fn new(
        group: &Endpoint,
        options: &MulticastOptions,
        builder: Arc<dyn MessageBuilder>,
        archive: ArchiveType,
    ) -> UdpResult<Self> {
        Ok(Self {
            sender: MulticastSender::new(group, options)?,
            builder,
            archive,
        })
    }

    pub fn sender(&self) -> &MulticastSender {
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
        let frame = build_object(
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
