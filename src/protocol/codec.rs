//! Frame decoder for the wire protocol
//!
//! Finds frame boundaries in a byte stream and validates headers.

use bytes::{Buf, BytesMut};
use thiserror::Error;

use super::{MagicString, MessageHeader, ReceivedMessage, DEFAULT_MAX_MESSAGE_SIZE, HEADER_LEN, MAGIC_STRING_LEN};

/// Protocol errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("Incorrect magic string")]
    MagicString,

    #[error("Unknown archive type: {0}")]
    ArchiveType(u8),

    #[error("Incorrect message length: {length} bytes (min: {min}, max: {max})")]
    MessageLength { length: usize, min: usize, max: usize },

    #[error("Invalid magic string {0:?}: must be 1 to 15 bytes")]
    InvalidMagicString(String),

    #[error("Response address host too long: {0}")]
    ResponseAddress(String),
}

pub type ProtocolResult<T> = Result<T, ProtocolError>;

/// Validates headers and splits complete frames off a buffer
#[derive(Debug, Clone)]
pub struct FrameDecoder {
    magic: MagicString,
    max_message_size: usize,
}

impl FrameDecoder {
    pub fn new(magic: MagicString, max_message_size: usize) -> Self {
        Self {
            magic,
            max_message_size: max_message_size.max(HEADER_LEN),
        }
    }

    pub fn magic(&self) -> MagicString {
        self.magic
    }

    pub fn max_message_size(&self) -> usize {
        self.max_message_size
    }

    /// Validate the header at the start of `buf`
    ///
    /// `buf` must hold at least `HEADER_LEN` bytes.
    pub fn check_header(&self, buf: &[u8]) -> ProtocolResult<MessageHeader> {
        if buf.len() < HEADER_LEN {
            return Err(ProtocolError::MessageLength {
                length: buf.len(),
                min: HEADER_LEN,
                max: self.max_message_size,
            });
        }

        if buf[..MAGIC_STRING_LEN] != self.magic.as_bytes()[..] {
            return Err(ProtocolError::MagicString);
        }

        let header = MessageHeader::decode(buf)?;

        let total = header.total_length as usize;
        if total < HEADER_LEN || total > self.max_message_size {
            return Err(ProtocolError::MessageLength {
                length: total,
                min: HEADER_LEN,
                max: self.max_message_size,
            });
        }

        Ok(header)
    }

    /// How many more bytes are needed before the frame at the start of
    /// `buf` is complete. Zero means a whole frame is available.
    pub fn bytes_left_to_read(&self, buf: &[u8]) -> ProtocolResult<usize> {
        if buf.len() < HEADER_LEN {
            return Ok(HEADER_LEN - buf.len());
        }

        let header = self.check_header(buf)?;
        Ok((header.total_length as usize).saturating_sub(buf.len()))
    }

    /// Attempt to split one frame off the front of the buffer
    /// Returns Ok(None) if more data is needed
    pub fn decode(&self, buf: &mut BytesMut) -> ProtocolResult<Option<ReceivedMessage>> {
        if buf.len() < HEADER_LEN {
            return Ok(None);
        }

        let header = self.check_header(buf)?;
        let total = header.total_length as usize;

        if buf.len() < total {
            buf.reserve(total - buf.len());
            return Ok(None);
        }

        let mut frame = buf.split_to(total);
        frame.advance(HEADER_LEN);

        Ok(Some(ReceivedMessage {
            header,
            body: frame.freeze(),
        }))
    }

    /// Decode a buffer that must contain exactly one frame (one datagram)
    pub fn decode_frame(&self, frame: &[u8]) -> ProtocolResult<ReceivedMessage> {
        let header = self.check_header(frame)?;
        let total = header.total_length as usize;

        if frame.len() != total {
            return Err(ProtocolError::MessageLength {
                length: frame.len(),
                min: total,
                max: total,
            });
        }

        Ok(ReceivedMessage {
            header,
            body: bytes::Bytes::copy_from_slice(&frame[HEADER_LEN..]),
        })
    }
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new(MagicString::default(), DEFAULT_MAX_MESSAGE_SIZE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{ArchiveType, DefaultMessageBuilder, Endpoint, MessageBuilder};
    use proptest::prelude::*;

    fn frame(id: i32, body: &[u8]) -> bytes::Bytes {
        DefaultMessageBuilder::default()
            .build(id, &Endpoint::new("127.0.0.1", 5000), ArchiveType::Raw, body)
            .unwrap()
    }

    fn decode_all(decoder: &FrameDecoder, chunks: &[&[u8]]) -> Vec<ReceivedMessage> {
        let mut buf = BytesMut::new();
        let mut out = Vec::new();
        for chunk in chunks {
            buf.extend_from_slice(chunk);
            while let Some(msg) = decoder.decode(&mut buf).unwrap() {
                out.push(msg);
            }
        }
        out
    }

    #[test]
    fn test_decode_single_frame() {
        let decoder = FrameDecoder::default();
        let mut buf = BytesMut::from(&frame(3, b"hello")[..]);

        let msg = decoder.decode(&mut buf).unwrap().unwrap();
        assert_eq!(msg.message_id(), 3);
        assert_eq!(&msg.body[..], b"hello");
        assert_eq!(msg.response_address(), &Endpoint::new("127.0.0.1", 5000));
        assert!(buf.is_empty());
    }

    #[test]
    fn test_batched_frames() {
        let decoder = FrameDecoder::default();
        let mut stream = Vec::new();
        stream.extend_from_slice(&frame(1, b"a"));
        stream.extend_from_slice(&frame(2, b""));
        stream.extend_from_slice(&frame(3, b"ccc"));

        let messages = decode_all(&decoder, &[&stream]);
        let ids: Vec<i32> = messages.iter().map(|m| m.message_id()).collect();
        assert_eq!(ids, vec![1, 2, 3]);
        assert!(messages[1].body.is_empty());
    }

    #[test]
    fn test_bytes_left_to_read() {
        let decoder = FrameDecoder::default();
        let bytes = frame(9, &[7u8; 10]);

        assert_eq!(decoder.bytes_left_to_read(&[]).unwrap(), HEADER_LEN);
        assert_eq!(decoder.bytes_left_to_read(&bytes[..5]).unwrap(), HEADER_LEN - 5);
        assert_eq!(decoder.bytes_left_to_read(&bytes[..HEADER_LEN]).unwrap(), 10);
        assert_eq!(decoder.bytes_left_to_read(&bytes).unwrap(), 0);
    }

    #[test]
    fn test_wrong_magic_rejected() {
        let decoder = FrameDecoder::new(MagicString::new("_OTHER_").unwrap(), 1024);
        let mut buf = BytesMut::from(&frame(1, b"x")[..]);
        assert_eq!(decoder.decode(&mut buf), Err(ProtocolError::MagicString));
    }

    #[test]
    fn test_oversized_frame_rejected() {
        let decoder = FrameDecoder::new(MagicString::default(), HEADER_LEN + 4);
        let mut buf = BytesMut::from(&frame(1, b"too long")[..]);
        assert!(matches!(
            decoder.decode(&mut buf),
            Err(ProtocolError::MessageLength { length, .. }) if length == HEADER_LEN + 8
        ));
    }

    #[test]
    fn test_length_shorter_than_header_rejected() {
        let decoder = FrameDecoder::default();
        let mut bytes = frame(1, b"").to_vec();
        bytes[16..20].copy_from_slice(&3u32.to_be_bytes());
        assert!(matches!(
            decoder.bytes_left_to_read(&bytes),
            Err(ProtocolError::MessageLength { length: 3, .. })
        ));
    }

    #[test]
    fn test_decode_datagram_must_be_exact() {
        let decoder = FrameDecoder::default();
        let bytes = frame(4, b"payload");

        assert_eq!(decoder.decode_frame(&bytes).unwrap().message_id(), 4);
        assert!(decoder.decode_frame(&bytes[..bytes.len() - 1]).is_err());

        let mut padded = bytes.to_vec();
        padded.push(0);
        assert!(decoder.decode_frame(&padded).is_err());
    }

    proptest! {
        #[test]
        fn prop_chunk_boundaries_do_not_matter(
            bodies in proptest::collection::vec(proptest::collection::vec(any::<u8>(), 0..64), 1..6),
            chunk in 1usize..97,
        ) {
            let decoder = FrameDecoder::default();
            let mut stream = Vec::new();
            for (i, body) in bodies.iter().enumerate() {
                stream.extend_from_slice(&frame(i as i32, body));
            }

            let whole = decode_all(&decoder, &[&stream]);
            let chunks: Vec<&[u8]> = stream.chunks(chunk).collect();
            let pieces = decode_all(&decoder, &chunks);

            prop_assert_eq!(whole.len(), bodies.len());
            prop_assert_eq!(whole, pieces);
        }

        #[test]
        fn prop_magic_bit_flip_rejected(bit in 0usize..(MAGIC_STRING_LEN * 8), body in proptest::collection::vec(any::<u8>(), 0..32)) {
            let decoder = FrameDecoder::default();
            let mut bytes = frame(1, &body).to_vec();
            bytes[bit / 8] ^= 1 << (bit % 8);

            let mut buf = BytesMut::from(&bytes[..]);
            prop_assert_eq!(decoder.decode(&mut buf), Err(ProtocolError::MagicString));
            prop_assert_eq!(decoder.decode_frame(&bytes), Err(ProtocolError::MagicString));
        }
    }
}
