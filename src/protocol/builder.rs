//! Frame construction
//!
//! A message builder stamps the header (magic string, message id, response
//! address, archive type) in front of an already archived body.

use bytes::{BufMut, Bytes, BytesMut};
use serde::Serialize;
use thiserror::Error;

use super::{
    ArchiveType, Endpoint, MagicString, MessageHeader, ProtocolError, DEFAULT_MAX_MESSAGE_SIZE,
    HEADER_LEN,
};
use crate::archive::{self, ArchiveError};

/// Errors raised while turning a payload into a frame
#[derive(Error, Debug)]
pub enum BuildError {
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Archive error: {0}")]
    Archive(#[from] ArchiveError),
}

/// Builds complete frames
///
/// Typed servers, clients and senders hold one of these behind an `Arc`, so
/// an application can swap in its own header policy without touching the
/// transport code.
pub trait MessageBuilder: Send + Sync {
    /// Build a frame around an already archived body
    fn build(
        &self,
        message_id: i32,
        response_address: &Endpoint,
        archive_type: ArchiveType,
        body: &[u8],
    ) -> Result<Bytes, ProtocolError>;

    /// Build a frame carrying only a header
    fn build_header_only(
        &self,
        message_id: i32,
        response_address: &Endpoint,
    ) -> Result<Bytes, ProtocolError> {
        self.build(message_id, response_address, ArchiveType::Raw, &[])
    }
}

/// Builder stamping a configured magic string
#[derive(Debug, Clone)]
pub struct DefaultMessageBuilder {
    magic: MagicString,
    max_message_size: usize,
}

impl DefaultMessageBuilder {
    pub fn new(magic: MagicString, max_message_size: usize) -> Self {
        Self {
            magic,
            max_message_size,
        }
    }

    pub fn magic(&self) -> MagicString {
        self.magic
    }
}

impl Default for DefaultMessageBuilder {
    fn default() -> Self {
        Self::new(MagicString::default(), DEFAULT_MAX_MESSAGE_SIZE)
    }
}

impl MessageBuilder for DefaultMessageBuilder {
    fn build(
        &self,
        message_id: i32,
        response_address: &Endpoint,
        archive_type: ArchiveType,
        body: &[u8],
    ) -> Result<Bytes, ProtocolError> {
        let total = HEADER_LEN + body.len();
        let max = self.max_message_size.min(u32::MAX as usize);
        if total > max {
            return Err(ProtocolError::MessageLength {
                length: total,
                min: HEADER_LEN,
                max,
            });
        }

        let mut header = MessageHeader::new(
            self.magic,
            archive_type,
            message_id,
            response_address.clone(),
        );
        header.total_length = total as u32;

        let mut buf = BytesMut::with_capacity(total);
        header.encode(&mut buf)?;
        buf.put_slice(body);

        Ok(buf.freeze())
    }
}

/// Archive `value` and wrap it in a frame
pub fn build_object<T: Serialize + ?Sized>(
    builder: &dyn MessageBuilder,
    value: &T,
    archive_type: ArchiveType,
    message_id: i32,
    response_address: &Endpoint,
) -> Result<Bytes, BuildError> {
    let body = archive::serialize(value, archive_type)?;
    Ok(builder.build(message_id, response_address, archive_type, &body)?)
}

/// Encode a protobuf message and wrap it in a frame
pub fn build_protobuf<M: prost::Message>(
    builder: &dyn MessageBuilder,
    value: &M,
    message_id: i32,
    response_address: &Endpoint,
) -> Result<Bytes, BuildError> {
    let body = archive::serialize_protobuf(value);
    Ok(builder.build(message_id, response_address, ArchiveType::Protobuf, &body)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::FrameDecoder;
    use serde::Deserialize;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Position {
        x: i32,
        y: i32,
        label: String,
    }

    #[test]
    fn test_header_only_frame() {
        let builder = DefaultMessageBuilder::default();
        let frame = builder
            .build_header_only(11, &Endpoint::new("10.1.1.1", 7000))
            .unwrap();
        assert_eq!(frame.len(), HEADER_LEN);

        let msg = FrameDecoder::default().decode_frame(&frame).unwrap();
        assert_eq!(msg.message_id(), 11);
        assert_eq!(msg.archive_type(), ArchiveType::Raw);
        assert!(msg.body.is_empty());
    }

    #[test]
    fn test_object_frame_round_trip() {
        let builder = DefaultMessageBuilder::default();
        let position = Position {
            x: 4,
            y: -2,
            label: "origin".to_string(),
        };

        for archive_type in [
            ArchiveType::PortableBinary,
            ArchiveType::Binary,
            ArchiveType::Json,
            ArchiveType::Xml,
        ] {
            let frame = build_object(&builder, &position, archive_type, 5, &Endpoint::null()).unwrap();
            let msg = FrameDecoder::default().decode_frame(&frame).unwrap();
            assert_eq!(msg.archive_type(), archive_type);
            assert_eq!(msg.decode_body::<Position>().unwrap(), position);
        }
    }

    #[test]
    fn test_custom_magic_string() {
        let magic = MagicString::new("_CUSTOM_").unwrap();
        let builder = DefaultMessageBuilder::new(magic, 1024);
        let frame = builder.build(1, &Endpoint::null(), ArchiveType::Raw, b"abc").unwrap();

        assert!(FrameDecoder::new(magic, 1024).decode_frame(&frame).is_ok());
        assert_eq!(
            FrameDecoder::default().decode_frame(&frame),
            Err(ProtocolError::MagicString)
        );
    }

    #[test]
    fn test_build_rejects_oversized_body() {
        let builder = DefaultMessageBuilder::new(MagicString::default(), HEADER_LEN + 2);
        assert!(matches!(
            builder.build(1, &Endpoint::null(), ArchiveType::Raw, b"abc"),
            Err(ProtocolError::MessageLength { .. })
        ));
    }
}
