//! Typed TCP server and client
//!
//! Wrap a `TcpServer` / `TcpClient` with a message builder and a default
//! archive, so callers send values instead of pre-built frames. A NULL
//! response address is replaced with this side's own details.

use bytes::Bytes;
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::runtime::Handle;

use super::{ClientResult, ConnectionOptions, MessageHandler, ServerResult, TcpClient, TcpServer};
use crate::protocol::{
    build_object, build_protobuf, ArchiveType, BuildError, Endpoint, MessageBuilder,
};

/// TCP server that builds its own frames
pub struct TcpTypedServer {
    server: TcpServer,
    builder: Arc<dyn MessageBuilder>,
    archive: ArchiveType,
}

impl TcpTypedServer {
    pub fn new(
        handle: Handle,
        listen_port: u16,
        options: ConnectionOptions,
        handler: Arc<dyn MessageHandler>,
        builder: Arc<dyn MessageBuilder>,
        archive: ArchiveType,
    ) -> Self {
        Self {
            server: TcpServer::new(handle, listen_port, options, handler),
            builder,
            archive,
        }
    }

    pub fn start(&self) -> ServerResult<SocketAddr> {
        self.server.start()
    }

    pub fn stop(&self) -> ServerResult<()> {
        self.server.stop()
    }

    /// The untyped server underneath
    pub fn server(&self) -> &TcpServer {
        &self.server
    }

    pub fn archive(&self) -> ArchiveType {
        self.archive
    }

    fn response_address(&self, client: &Endpoint, response: &Endpoint) -> ServerResult<Endpoint> {
        if response.is_null() {
            self.server.server_details_for_client(client)
        } else {
            Ok(response.clone())
        }
    }

    fn object_frame<T: Serialize + ?Sized>(
        &self,
        client: &Endpoint,
        message_id: i32,
        value: &T,
        response: &Endpoint,
    ) -> ServerResult<Bytes> {
        let response = self.response_address(client, response)?;
        Ok(build_object(
            self.builder.as_ref(),
            value,
            self.archive,
            message_id,
            &response,
        )?)
    }

    pub fn send_header_to_client_async(
        &self,
        client: &Endpoint,
        message_id: i32,
        response: &Endpoint,
    ) -> ServerResult<()> {
        let response = self.response_address(client, response)?;
        let frame = self.builder.build_header_only(message_id, &response).map_err(BuildError::from)?;
        self.server.send_to_client_async(client, frame)
    }

    /// Send caller-archived bytes tagged as `Raw`
    pub fn send_raw_to_client_async(
        &self,
        client: &Endpoint,
        message_id: i32,
        body: &[u8],
        response: &Endpoint,
    ) -> ServerResult<()> {
        let response = self.response_address(client, response)?;
        let frame = self
            .builder
            .build(message_id, &response, ArchiveType::Raw, body)
            .map_err(BuildError::from)?;
        self.server.send_to_client_async(client, frame)
    }

    pub fn send_to_client_async<T: Serialize + ?Sized>(
        &self,
        client: &Endpoint,
        message_id: i32,
        value: &T,
        response: &Endpoint,
    ) -> ServerResult<()> {
        let frame = self.object_frame(client, message_id, value, response)?;
        self.server.send_to_client_async(client, frame)
    }

    pub async fn send_to_client_sync<T: Serialize + ?Sized>(
        &self,
        client: &Endpoint,
        message_id: i32,
        value: &T,
        response: &Endpoint,
    ) -> ServerResult<()> {
        let frame = self.object_frame(client, message_id, value, response)?;
        self.server.send_to_client_sync(client, frame).await
    }

    pub fn send_protobuf_to_client_async<M: prost::Message>(
        &self,
        client: &Endpoint,
        message_id: i32,
        value: &M,
        response: &Endpoint,
    ) -> ServerResult<()> {
        let response = self.response_address(client, response)?;
        let frame = build_protobuf(self.builder.as_ref(), value, message_id, &response)?;
        self.server.send_to_client_async(client, frame)
    }

    /// Send a header-only frame to every client
    pub fn send_header_to_all(&self, message_id: i32, response: &Endpoint) -> ServerResult<usize> {
        let response = self.response_address(&Endpoint::null(), response)?;
        let frame = self.builder.build_header_only(message_id, &response).map_err(BuildError::from)?;
        self.server.send_to_all(frame)
    }

    /// Send one value to every client; returns how many accepted it
    pub fn send_to_all<T: Serialize + ?Sized>(
        &self,
        message_id: i32,
        value: &T,
        response: &Endpoint,
    ) -> ServerResult<usize> {
        let frame = self.object_frame(&Endpoint::null(), message_id, value, response)?;
        self.server.send_to_all(frame)
    }
}

/// TCP client that builds its own frames
pub struct TcpTypedClient {
    client: TcpClient,
    builder: Arc<dyn MessageBuilder>,
    archive: ArchiveType,
}

impl TcpTypedClient {
    pub fn new(
        handle: Handle,
        server: Endpoint,
        options: ConnectionOptions,
        handler: Arc<dyn MessageHandler>,
        builder: Arc<dyn MessageBuilder>,
        archive: ArchiveType,
    ) -> Self {
        Self {
            client: TcpClient::new(handle, server, options, handler),
            builder,
            archive,
        }
    }

    pub async fn connect(&self) -> ClientResult<()> {
        self.client.connect().await
    }

    pub fn close(&self) {
        self.client.close()
    }

    /// The untyped client underneath
    pub fn client(&self) -> &TcpClient {
        &self.client
    }

    pub fn archive(&self) -> ArchiveType {
        self.archive
    }

    fn response_address(&self, response: &Endpoint) -> ClientResult<Endpoint> {
        if response.is_null() {
            self.client.local_endpoint()
        } else {
            Ok(response.clone())
        }
    }

    fn object_frame<T: Serialize + ?Sized>(
        &self,
        message_id: i32,
        value: &T,
        response: &Endpoint,
    ) -> ClientResult<Bytes> {
        let response = self.response_address(response)?;
        Ok(build_object(
            self.builder.as_ref(),
            value,
            self.archive,
            message_id,
            &response,
        )?)
    }

    pub fn send_header_async(&self, message_id: i32, response: &Endpoint) -> ClientResult<()> {
        let response = self.response_address(response)?;
        let frame = self.builder.build_header_only(message_id, &response).map_err(BuildError::from)?;
        self.client.send_async(frame)
    }

    /// Send caller-archived bytes tagged as `Raw`
    pub fn send_raw_async(&self, message_id: i32, body: &[u8], response: &Endpoint) -> ClientResult<()> {
        let response = self.response_address(response)?;
        let frame = self
            .builder
            .build(message_id, &response, ArchiveType::Raw, body)
            .map_err(BuildError::from)?;
        self.client.send_async(frame)
    }

    pub fn send_async<T: Serialize + ?Sized>(
        &self,
        message_id: i32,
        value: &T,
        response: &Endpoint,
    ) -> ClientResult<()> {
        let frame = self.object_frame(message_id, value, response)?;
        self.client.send_async(frame)
    }

    pub async fn send_raw_sync(&self, message_id: i32, body: &[u8], response: &Endpoint) -> ClientResult<()> {
        if !self.client.is_connected() {
            self.client.connect().await?;
        }
        let response = self.response_address(response)?;
        let frame = self
            .builder
            .build(message_id, &response, ArchiveType::Raw, body)
            .map_err(BuildError::from)?;
        self.client.send_sync(frame).await
    }

    /// Send a value and wait for the write, connecting first if needed
    pub async fn send_sync<T: Serialize + ?Sized>(
        &self,
        message_id: i32,
        value: &T,
        response: &Endpoint,
    ) -> ClientResult<()> {
        if !self.client.is_connected() {
            self.client.connect().await?;
        }
        let frame = self.object_frame(message_id, value, response)?;
        self.client.send_sync(frame).await
    }

    pub fn send_protobuf_async<M: prost::Message>(
        &self,
        message_id: i32,
        value: &M,
        response: &Endpoint,
    ) -> ClientResult<()> {
        let response = self.response_address(response)?;
        let frame = build_protobuf(self.builder.as_ref(), value, message_id, &response)?;
        self.client.send_async(frame)
    }
}
