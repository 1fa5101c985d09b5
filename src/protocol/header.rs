//! Frame header, endpoint and received message definitions
//!
//! Defines the fixed-size header that precedes every frame on the wire.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::SocketAddr;

use super::{ProtocolError, DEFAULT_MAGIC_STRING, HEADER_LEN, MAGIC_STRING_LEN, RESPONSE_ADDRESS_LEN};
use crate::archive::{self, ArchiveResult};

/// Serialization format of a frame body
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum ArchiveType {
    /// Big-endian, fixed-width binary encoding
    #[default]
    PortableBinary = 0,
    /// Native little-endian binary encoding
    Binary = 1,
    Json = 2,
    Xml = 3,
    /// Caller-provided bytes, passed through untouched
    Raw = 4,
    Protobuf = 5,
}

impl ArchiveType {
    pub const ALL: [ArchiveType; 6] = [
        ArchiveType::PortableBinary,
        ArchiveType::Binary,
        ArchiveType::Json,
        ArchiveType::Xml,
        ArchiveType::Raw,
        ArchiveType::Protobuf,
    ];

    /// Get the identifier byte used on the wire
    pub fn to_byte(self) -> u8 {
        self as u8
    }

    /// Map an identifier byte back to an archive type
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0 => Some(ArchiveType::PortableBinary),
            1 => Some(ArchiveType::Binary),
            2 => Some(ArchiveType::Json),
            3 => Some(ArchiveType::Xml),
            4 => Some(ArchiveType::Raw),
            5 => Some(ArchiveType::Protobuf),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            ArchiveType::PortableBinary => "portable-binary",
            ArchiveType::Binary => "binary",
            ArchiveType::Json => "json",
            ArchiveType::Xml => "xml",
            ArchiveType::Raw => "raw",
            ArchiveType::Protobuf => "protobuf",
        }
    }
}

impl TryFrom<u8> for ArchiveType {
    type Error = ProtocolError;

    fn try_from(byte: u8) -> Result<Self, Self::Error> {
        Self::from_byte(byte).ok_or(ProtocolError::ArchiveType(byte))
    }
}

impl fmt::Display for ArchiveType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl std::str::FromStr for ArchiveType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.to_ascii_lowercase().replace('_', "-");
        Self::ALL
            .into_iter()
            .find(|archive| archive.name() == wanted)
            .ok_or_else(|| format!("unknown archive type: {}", s))
    }
}

/// A host and port pair identifying a peer or a reply address
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
}

impl Endpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// The "no address" endpoint, `0.0.0.0:0`
    pub fn null() -> Self {
        Self::new("0.0.0.0", 0)
    }

    pub fn is_null(&self) -> bool {
        self.port == 0 && self.host == "0.0.0.0"
    }
}

impl Default for Endpoint {
    fn default() -> Self {
        Self::null()
    }
}

impl From<SocketAddr> for Endpoint {
    fn from(addr: SocketAddr) -> Self {
        Self::new(addr.ip().to_string(), addr.port())
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

/// Fixed-length protocol identifier, NUL padded
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct MagicString([u8; MAGIC_STRING_LEN]);

impl MagicString {
    /// Build a magic string; at most 15 bytes so the field stays NUL terminated
    pub fn new(value: &str) -> Result<Self, ProtocolError> {
        let bytes = value.as_bytes();
        if bytes.is_empty() || bytes.len() >= MAGIC_STRING_LEN {
            return Err(ProtocolError::InvalidMagicString(value.to_string()));
        }

        let mut field = [0u8; MAGIC_STRING_LEN];
        field[..bytes.len()].copy_from_slice(bytes);
        Ok(Self(field))
    }

    /// Wrap the raw field read off the wire, without validation
    pub fn from_field(field: [u8; MAGIC_STRING_LEN]) -> Self {
        Self(field)
    }

    pub fn as_bytes(&self) -> &[u8; MAGIC_STRING_LEN] {
        &self.0
    }

    pub fn as_str(&self) -> String {
        let end = self.0.iter().position(|b| *b == 0).unwrap_or(MAGIC_STRING_LEN);
        String::from_utf8_lossy(&self.0[..end]).into_owned()
    }
}

impl Default for MagicString {
    fn default() -> Self {
        let mut field = [0u8; MAGIC_STRING_LEN];
        field[..DEFAULT_MAGIC_STRING.len()].copy_from_slice(DEFAULT_MAGIC_STRING.as_bytes());
        Self(field)
    }
}

impl fmt::Debug for MagicString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MagicString({:?})", self.as_str())
    }
}

/// Header preceding every frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageHeader {
    pub magic: MagicString,
    /// Header plus body length in bytes
    pub total_length: u32,
    pub message_id: i32,
    /// Where the receiver should send replies
    pub response_address: Endpoint,
    pub archive_type: ArchiveType,
}

impl MessageHeader {
    /// Create a header for a body-less frame
    pub fn new(
        magic: MagicString,
        archive_type: ArchiveType,
        message_id: i32,
        response_address: Endpoint,
    ) -> Self {
        Self {
            magic,
            total_length: HEADER_LEN as u32,
            message_id,
            response_address,
            archive_type,
        }
    }

    /// Length of the body announced by this header
    pub fn body_len(&self) -> usize {
        (self.total_length as usize).saturating_sub(HEADER_LEN)
    }

    /// Write the header into the buffer
    pub fn encode(&self, buf: &mut BytesMut) -> Result<(), ProtocolError> {
        let host = self.response_address.host.as_bytes();
        if host.len() > RESPONSE_ADDRESS_LEN {
            return Err(ProtocolError::ResponseAddress(self.response_address.host.clone()));
        }

        let mut host_field = [0u8; RESPONSE_ADDRESS_LEN];
        host_field[..host.len()].copy_from_slice(host);

        buf.reserve(HEADER_LEN);
        buf.put_slice(self.magic.as_bytes());
        buf.put_u32(self.total_length);
        buf.put_i32(self.message_id);
        buf.put_slice(&host_field);
        buf.put_u16(self.response_address.port);
        buf.put_u8(self.archive_type.to_byte());
        Ok(())
    }

    /// Parse a header from the first `HEADER_LEN` bytes of `buf`
    ///
    /// Only structural checks happen here; the magic string and length
    /// limits are checked by the decoder against its configuration.
    pub fn decode(buf: &[u8]) -> Result<Self, ProtocolError> {
        if buf.len() < HEADER_LEN {
            return Err(ProtocolError::MessageLength {
                length: buf.len(),
                min: HEADER_LEN,
                max: HEADER_LEN,
            });
        }

        let mut cursor = &buf[..HEADER_LEN];

        let mut magic = [0u8; MAGIC_STRING_LEN];
        cursor.copy_to_slice(&mut magic);
        let total_length = cursor.get_u32();
        let message_id = cursor.get_i32();

        let mut host_field = [0u8; RESPONSE_ADDRESS_LEN];
        cursor.copy_to_slice(&mut host_field);
        let port = cursor.get_u16();
        let archive_type = ArchiveType::try_from(cursor.get_u8())?;

        let host_end = host_field
            .iter()
            .position(|b| *b == 0)
            .unwrap_or(RESPONSE_ADDRESS_LEN);
        let host = String::from_utf8_lossy(&host_field[..host_end]).into_owned();

        Ok(Self {
            magic: MagicString::from_field(magic),
            total_length,
            message_id,
            response_address: Endpoint::new(host, port),
            archive_type,
        })
    }
}

/// A fully reassembled frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedMessage {
    pub header: MessageHeader,
    pub body: Bytes,
}

impl ReceivedMessage {
    pub fn message_id(&self) -> i32 {
        self.header.message_id
    }

    pub fn archive_type(&self) -> ArchiveType {
        self.header.archive_type
    }

    pub fn response_address(&self) -> &Endpoint {
        &self.header.response_address
    }

    /// Deserialize the body using the archive type announced in the header
    pub fn decode_body<T: DeserializeOwned>(&self) -> ArchiveResult<T> {
        archive::deserialize(&self.body, self.header.archive_type)
    }

    /// Decode a protobuf body
    pub fn decode_protobuf<M: prost::Message + Default>(&self) -> ArchiveResult<M> {
        archive::expect_archive(self.header.archive_type, ArchiveType::Protobuf)?;
        archive::deserialize_protobuf(&self.body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_layout() {
        let header = MessageHeader::new(
            MagicString::default(),
            ArchiveType::Json,
            -7,
            Endpoint::new("192.168.1.20", 8080),
        );
        let mut buf = BytesMut::new();
        header.encode(&mut buf).unwrap();

        assert_eq!(buf.len(), HEADER_LEN);
        assert_eq!(&buf[..15], DEFAULT_MAGIC_STRING.as_bytes());
        assert_eq!(buf[15], 0);
        assert_eq!(&buf[16..20], &(HEADER_LEN as u32).to_be_bytes());
        assert_eq!(&buf[20..24], &(-7i32).to_be_bytes());
        assert_eq!(&buf[24..36], b"192.168.1.20");
        assert_eq!(&buf[40..42], &8080u16.to_be_bytes());
        assert_eq!(buf[42], ArchiveType::Json.to_byte());

        let decoded = MessageHeader::decode(&buf).unwrap();
        assert_eq!(decoded, header);
    }

    #[test]
    fn test_response_host_too_long() {
        let header = MessageHeader::new(
            MagicString::default(),
            ArchiveType::Raw,
            1,
            Endpoint::new("a-very-long-host-name.example", 1),
        );
        let mut buf = BytesMut::new();
        assert!(matches!(
            header.encode(&mut buf),
            Err(ProtocolError::ResponseAddress(_))
        ));
    }

    #[test]
    fn test_unknown_archive_byte() {
        let header = MessageHeader::new(MagicString::default(), ArchiveType::Raw, 1, Endpoint::null());
        let mut buf = BytesMut::new();
        header.encode(&mut buf).unwrap();
        buf[HEADER_LEN - 1] = 42;

        assert!(matches!(
            MessageHeader::decode(&buf),
            Err(ProtocolError::ArchiveType(42))
        ));
    }

    #[test]
    fn test_magic_string_limits() {
        assert!(MagicString::new("").is_err());
        assert!(MagicString::new("0123456789abcdef").is_err());
        let magic = MagicString::new("_MY_PROTO_").unwrap();
        assert_eq!(magic.as_str(), "_MY_PROTO_");
        assert_eq!(MagicString::default().as_str(), DEFAULT_MAGIC_STRING);
    }

    #[test]
    fn test_archive_type_names() {
        for archive in ArchiveType::ALL {
            assert_eq!(archive.name().parse::<ArchiveType>(), Ok(archive));
            assert_eq!(ArchiveType::try_from(archive.to_byte()), Ok(archive));
        }
        assert_eq!("PORTABLE_BINARY".parse::<ArchiveType>(), Ok(ArchiveType::PortableBinary));
        assert!("yaml".parse::<ArchiveType>().is_err());
    }

    #[test]
    fn test_endpoint_display() {
        assert_eq!(Endpoint::new("10.0.0.1", 80).to_string(), "10.0.0.1:80");
        assert_eq!(Endpoint::new("::1", 80).to_string(), "[::1]:80");
        assert!(Endpoint::null().is_null());
        let addr: SocketAddr = "127.0.0.1:9000".parse().unwrap();
        assert_eq!(Endpoint::from(addr), Endpoint::new("127.0.0.1", 9000));
    }
}
