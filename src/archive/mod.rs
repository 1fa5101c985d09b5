//! Archive module - Turns payloads into frame bodies and back
//!
//! Each `ArchiveType` maps to one serializer:
//! - `PortableBinary`: bincode, big-endian with fixed-width integers
//! - `Binary`: bincode, little-endian with fixed-width integers
//! - `Json`: serde_json
//! - `Xml`: quick-xml, as `<message><value>...</value></message>`; `None` fields are omitted
//! - `Raw`: bytes passed through untouched
//! - `Protobuf`: prost
//!
//! The archive announced in a header is never second-guessed: bytes that do
//! not parse under it are a deserialization error.

use bincode::Options;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::protocol::ArchiveType;

/// Archive errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ArchiveError {
    #[error("Failed to serialize as {archive}: {reason}")]
    Serialize { archive: ArchiveType, reason: String },

    #[error("Failed to deserialize as {archive}: {reason}")]
    Deserialize { archive: ArchiveType, reason: String },

    #[error("Archive {0} does not carry serde objects")]
    Unsupported(ArchiveType),

    #[error("Archive mismatch: expected {expected}, got {actual}")]
    Mismatch {
        expected: ArchiveType,
        actual: ArchiveType,
    },
}

pub type ArchiveResult<T> = Result<T, ArchiveError>;

fn portable() -> impl Options {
    bincode::DefaultOptions::new()
        .with_big_endian()
        .with_fixint_encoding()
        .reject_trailing_bytes()
}

fn native() -> impl Options {
    bincode::DefaultOptions::new()
        .with_little_endian()
        .with_fixint_encoding()
        .reject_trailing_bytes()
}

fn serialize_error(archive: ArchiveType, err: impl std::fmt::Display) -> ArchiveError {
    ArchiveError::Serialize {
        archive,
        reason: err.to_string(),
    }
}

fn deserialize_error(archive: ArchiveType, err: impl std::fmt::Display) -> ArchiveError {
    ArchiveError::Deserialize {
        archive,
        reason: err.to_string(),
    }
}

/// Serialize a value with the given archive
///
/// `Raw` and `Protobuf` bodies bypass serde; use [`serialize_raw`] and
/// [`serialize_protobuf`] for those.
pub fn serialize<T: Serialize + ?Sized>(value: &T, archive: ArchiveType) -> ArchiveResult<Vec<u8>> {
    match archive {
        ArchiveType::PortableBinary => portable()
            .serialize(value)
            .map_err(|e| serialize_error(archive, e)),
        ArchiveType::Binary => native()
            .serialize(value)
            .map_err(|e| serialize_error(archive, e)),
        ArchiveType::Json => serde_json::to_vec(value).map_err(|e| serialize_error(archive, e)),
        ArchiveType::Xml => xml_serialize(value),
        ArchiveType::Raw | ArchiveType::Protobuf => Err(ArchiveError::Unsupported(archive)),
    }
}

/// Deserialize a value that was written with the given archive
pub fn deserialize<T: DeserializeOwned>(bytes: &[u8], archive: ArchiveType) -> ArchiveResult<T> {
    match archive {
        ArchiveType::PortableBinary => portable()
            .deserialize(bytes)
            .map_err(|e| deserialize_error(archive, e)),
        ArchiveType::Binary => native()
            .deserialize(bytes)
            .map_err(|e| deserialize_error(archive, e)),
        ArchiveType::Json => {
            serde_json::from_slice(bytes).map_err(|e| deserialize_error(archive, e))
        }
        ArchiveType::Xml => xml_deserialize(bytes),
        ArchiveType::Raw | ArchiveType::Protobuf => Err(ArchiveError::Unsupported(archive)),
    }
}

/// Root element of every XML body
const XML_ROOT: &str = "message";

/// `<message><value>...</value></message>`
#[derive(Serialize)]
struct XmlEnvelopeRef<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    value: Option<&'a serde_json::Value>,
}

#[derive(Deserialize)]
struct XmlEnvelope<T> {
    value: T,
}

/// A `<message/>` with nothing inside
#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct EmptyXmlEnvelope {}

/// XML has no spelling for null; absent elements read back as `None`
fn strip_nulls(value: &mut serde_json::Value) {
    match value {
        serde_json::Value::Object(map) => {
            map.retain(|_, v| !v.is_null());
            map.values_mut().for_each(strip_nulls);
        }
        serde_json::Value::Array(items) => items.iter_mut().for_each(strip_nulls),
        _ => {}
    }
}

fn xml_serialize<T: Serialize + ?Sized>(value: &T) -> ArchiveResult<Vec<u8>> {
    let archive = ArchiveType::Xml;
    let mut tree = serde_json::to_value(value).map_err(|e| serialize_error(archive, e))?;
    strip_nulls(&mut tree);

    let envelope = XmlEnvelopeRef {
        value: (!tree.is_null()).then_some(&tree),
    };
    quick_xml::se::to_string_with_root(XML_ROOT, &envelope)
        .map(String::into_bytes)
        .map_err(|e| serialize_error(archive, e))
}

fn xml_deserialize<T: DeserializeOwned>(bytes: &[u8]) -> ArchiveResult<T> {
    let archive = ArchiveType::Xml;
    let text = std::str::from_utf8(bytes).map_err(|e| deserialize_error(archive, e))?;

    match quick_xml::de::from_str::<XmlEnvelope<T>>(text) {
        Ok(envelope) => Ok(envelope.value),
        Err(e) => {
            if quick_xml::de::from_str::<EmptyXmlEnvelope>(text).is_err() {
                return Err(deserialize_error(archive, e));
            }
            // Nothing was written: a null or an empty sequence
            serde_json::from_value(serde_json::Value::Null)
                .or_else(|_| serde_json::from_value(serde_json::Value::Array(Vec::new())))
                .map_err(|_| deserialize_error(archive, e))
        }
    }
}

/// Raw bodies are copied as-is
pub fn serialize_raw(bytes: &[u8]) -> Vec<u8> {
    bytes.to_vec()
}

pub fn deserialize_raw(bytes: &[u8]) -> Vec<u8> {
    bytes.to_vec()
}

pub fn serialize_protobuf<M: prost::Message>(value: &M) -> Vec<u8> {
    value.encode_to_vec()
}

pub fn deserialize_protobuf<M: prost::Message + Default>(bytes: &[u8]) -> ArchiveResult<M> {
    M::decode(bytes).map_err(|e| deserialize_error(ArchiveType::Protobuf, e))
}

/// Fail unless the announced archive is the one the caller can decode
pub fn expect_archive(actual: ArchiveType, expected: ArchiveType) -> ArchiveResult<()> {
    if actual == expected {
        Ok(())
    } else {
        Err(ArchiveError::Mismatch { expected, actual })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Reading {
        sensor: String,
        value: i64,
        valid: bool,
    }

    #[derive(Clone, PartialEq, prost::Message)]
    struct Ping {
        #[prost(string, tag = "1")]
        name: String,
        #[prost(int32, tag = "2")]
        seq: i32,
    }

    fn reading() -> Reading {
        Reading {
            sensor: "temp-1".to_string(),
            value: -40,
            valid: true,
        }
    }

    #[test]
    fn test_serde_archives_round_trip() {
        for archive in SERDE_ARCHIVES {
            let bytes = serialize(&reading(), archive).unwrap();
            let back: Reading = deserialize(&bytes, archive).unwrap();
            assert_eq!(back, reading(), "archive {}", archive);
        }
    }

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Calibration {
        offset: Option<i32>,
        label: String,
        points: Vec<u16>,
    }

    const SERDE_ARCHIVES: [ArchiveType; 4] = [
        ArchiveType::PortableBinary,
        ArchiveType::Binary,
        ArchiveType::Json,
        ArchiveType::Xml,
    ];

    fn round_trip<T>(value: &T, archive: ArchiveType) -> T
    where
        T: Serialize + DeserializeOwned,
    {
        let bytes = serialize(value, archive).unwrap();
        deserialize(&bytes, archive).unwrap()
    }

    #[test]
    fn test_plain_values_round_trip() {
        for archive in SERDE_ARCHIVES {
            assert_eq!(round_trip(&"status".to_string(), archive), "status", "archive {}", archive);
            assert_eq!(round_trip(&42i32, archive), 42, "archive {}", archive);
            assert_eq!(round_trip(&-7i32, archive), -7, "archive {}", archive);
            assert_eq!(round_trip(&vec![1u16, 2, 3], archive), vec![1, 2, 3], "archive {}", archive);
            assert_eq!(round_trip(&Vec::<u16>::new(), archive), Vec::<u16>::new(), "archive {}", archive);
        }
    }

    #[test]
    fn test_missing_optional_field_round_trip() {
        let calibration = Calibration {
            offset: None,
            label: "probe-a".to_string(),
            points: vec![10, 20],
        };
        for archive in SERDE_ARCHIVES {
            assert_eq!(round_trip(&calibration, archive), calibration, "archive {}", archive);
        }

        let set = Calibration {
            offset: Some(-3),
            ..calibration
        };
        assert_eq!(round_trip(&set, ArchiveType::Xml), set);
    }

    #[test]
    fn test_xml_body_has_fixed_root() {
        let bytes = serialize("status", ArchiveType::Xml).unwrap();
        assert_eq!(
            std::str::from_utf8(&bytes).unwrap(),
            "<message><value>status</value></message>"
        );

        let none: Option<i32> = round_trip(&None::<i32>, ArchiveType::Xml);
        assert_eq!(none, None);
    }

    #[test]
    fn test_xml_garbage_rejected() {
        let result: ArchiveResult<i32> = deserialize(b"<other><x>1</x></other>", ArchiveType::Xml);
        assert!(matches!(result, Err(ArchiveError::Deserialize { .. })));
        let result: ArchiveResult<i32> = deserialize(b"<message><value>abc</value></message>", ArchiveType::Xml);
        assert!(matches!(result, Err(ArchiveError::Deserialize { .. })));
    }

    proptest! {
        #[test]
        fn prop_serde_archives_round_trip(
            label in "[a-z][a-z0-9]{0,11}",
            offset in proptest::option::of(any::<i32>()),
            points in proptest::collection::vec(any::<u16>(), 1..8),
            count in any::<i32>(),
        ) {
            let calibration = Calibration { offset, label: label.clone(), points: points.clone() };
            for archive in SERDE_ARCHIVES {
                prop_assert_eq!(&round_trip(&calibration, archive), &calibration);
                prop_assert_eq!(&round_trip(&label, archive), &label);
                prop_assert_eq!(round_trip(&count, archive), count);
                prop_assert_eq!(&round_trip(&points, archive), &points);
            }
        }
    }

    #[test]
    fn test_portable_binary_is_big_endian() {
        let bytes = serialize(&0x0102_0304u32, ArchiveType::PortableBinary).unwrap();
        assert_eq!(bytes, vec![1, 2, 3, 4]);
        let bytes = serialize(&0x0102_0304u32, ArchiveType::Binary).unwrap();
        assert_eq!(bytes, vec![4, 3, 2, 1]);
    }

    #[test]
    fn test_raw_pass_through() {
        let body = [0u8, 255, 7, 7];
        assert_eq!(deserialize_raw(&serialize_raw(&body)), body.to_vec());
        assert_eq!(
            serialize(&reading(), ArchiveType::Raw),
            Err(ArchiveError::Unsupported(ArchiveType::Raw))
        );
    }

    #[test]
    fn test_protobuf_round_trip() {
        let ping = Ping {
            name: "node-a".to_string(),
            seq: 17,
        };
        let bytes = serialize_protobuf(&ping);
        let back: Ping = deserialize_protobuf(&bytes).unwrap();
        assert_eq!(back, ping);
    }

    #[test]
    fn test_wrong_archive_is_an_error() {
        let json = serialize(&reading(), ArchiveType::Json).unwrap();
        let result: ArchiveResult<Reading> = deserialize(&json, ArchiveType::PortableBinary);
        assert!(matches!(result, Err(ArchiveError::Deserialize { .. })));

        let binary = serialize(&reading(), ArchiveType::Binary).unwrap();
        let result: ArchiveResult<Reading> = deserialize(&binary, ArchiveType::Json);
        assert!(matches!(result, Err(ArchiveError::Deserialize { .. })));
    }

    #[test]
    fn test_expect_archive() {
        assert!(expect_archive(ArchiveType::Json, ArchiveType::Json).is_ok());
        assert_eq!(
            expect_archive(ArchiveType::Xml, ArchiveType::Protobuf),
            Err(ArchiveError::Mismatch {
                expected: ArchiveType::Protobuf,
                actual: ArchiveType::Xml,
            })
        );
    }
}
