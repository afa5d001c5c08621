//! Codec trait and implementations for payload serialization.
//!
//! A codec is a strategy: the publisher and subscriber logic never look
//! at the bytes themselves, they only ask the codec to produce or consume
//! them. Swapping JSON for bincode is a type parameter change.

use serde::{Serialize, de::DeserializeOwned};

use crate::CodecError;

/// Encodes Rust values to bytes and decodes them back.
///
/// Codecs are stateless, so they are `Copy`-able unit structs in practice.
/// The `Send + Sync + 'static` bounds let a codec move into the background
/// task that runs a subscription's dispatch loop.
///
/// The round-trip law holds for every codec:
/// `decode(encode(v)) == v` for all representable `v`.
pub trait Codec: Send + Sync + 'static {
    /// The MIME type stamped on messages produced by this codec.
    fn content_type(&self) -> &'static str;

    /// Serializes a value into bytes.
    ///
    /// # Errors
    /// Returns an encode variant of [`CodecError`] if the value has no
    /// representation in this format (e.g. a map with non-string keys
    /// for JSON).
    fn encode<T: Serialize>(&self, value: &T) -> Result<Vec<u8>, CodecError>;

    /// Deserializes bytes back into a value.
    ///
    /// # Errors
    /// Returns a decode variant of [`CodecError`] if the bytes are
    /// malformed, truncated, or shaped like a different type.
    fn decode<T: DeserializeOwned>(&self, data: &[u8]) -> Result<T, CodecError>;

    /// Checks a message's content type before decoding.
    ///
    /// Messages without a content type are accepted; the decode itself
    /// is the final judge.
    fn accepts(&self, content_type: Option<&str>) -> Result<(), CodecError> {
        match content_type {
            Some(actual) if actual != self.content_type() => {
                Err(CodecError::ContentTypeMismatch {
                    expected: self.content_type(),
                    actual: actual.to_string(),
                })
            }
            _ => Ok(()),
        }
    }
}

// ---------------------------------------------------------------------------
// JsonCodec
// ---------------------------------------------------------------------------

/// A [`Codec`] that uses JSON (via `serde_json`).
///
/// Self-describing and readable in the broker's management UI, which is
/// why it carries the pause/resume control messages.
///
/// ## Example
///
/// ```rust
/// use peril_codec::{Codec, JsonCodec};
///
/// let codec = JsonCodec;
/// let bytes = codec.encode(&vec![1, 2, 3]).unwrap();
/// assert_eq!(bytes, b"[1,2,3]");
///
/// let decoded: Vec<u32> = codec.decode(&bytes).unwrap();
/// assert_eq!(decoded, vec![1, 2, 3]);
/// ```
#[cfg(feature = "json")]
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

#[cfg(feature = "json")]
impl JsonCodec {
    /// Content type for JSON payloads.
    pub const CONTENT_TYPE: &'static str = "application/json";
}

#[cfg(feature = "json")]
impl Codec for JsonCodec {
    fn content_type(&self) -> &'static str {
        Self::CONTENT_TYPE
    }

    fn encode<T: Serialize>(&self, value: &T) -> Result<Vec<u8>, CodecError> {
        serde_json::to_vec(value).map_err(CodecError::JsonEncode)
    }

    fn decode<T: DeserializeOwned>(
        &self,
        data: &[u8],
    ) -> Result<T, CodecError> {
        serde_json::from_slice(data).map_err(CodecError::JsonDecode)
    }
}

// ---------------------------------------------------------------------------
// BincodeCodec
// ---------------------------------------------------------------------------

/// A [`Codec`] that uses bincode's compact binary format.
///
/// The encoding is not self-describing: both sides must agree on the
/// exact shape of `T`. Adding, removing or reordering fields breaks
/// decoding of messages produced by older builds.
#[cfg(feature = "bincode")]
#[derive(Debug, Clone, Copy, Default)]
pub struct BincodeCodec;

#[cfg(feature = "bincode")]
impl BincodeCodec {
    /// Content type for bincode payloads.
    pub const CONTENT_TYPE: &'static str = "application/x-bincode";
}

#[cfg(feature = "bincode")]
impl Codec for BincodeCodec {
    fn content_type(&self) -> &'static str {
        Self::CONTENT_TYPE
    }

    fn encode<T: Serialize>(&self, value: &T) -> Result<Vec<u8>, CodecError> {
        bincode::serialize(value).map_err(CodecError::BincodeEncode)
    }

    fn decode<T: DeserializeOwned>(
        &self,
        data: &[u8],
    ) -> Result<T, CodecError> {
        bincode::deserialize(data).map_err(CodecError::BincodeDecode)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use serde::Deserialize;

    use super::*;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct GameLog {
        username: String,
        message: String,
        sequence: u64,
    }

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    enum Outcome {
        Draw,
        Won { winner: String, loser: String },
    }

    fn sample_log() -> GameLog {
        GameLog {
            username: "alice".into(),
            message: "alice won a war against bob".into(),
            sequence: 42,
        }
    }

    #[test]
    fn test_json_round_trip_struct() {
        let codec = JsonCodec;
        let bytes = codec.encode(&sample_log()).unwrap();
        let decoded: GameLog = codec.decode(&bytes).unwrap();
        assert_eq!(decoded, sample_log());
    }

    #[test]
    fn test_bincode_round_trip_struct_and_enum() {
        let codec = BincodeCodec;

        let bytes = codec.encode(&sample_log()).unwrap();
        let decoded: GameLog = codec.decode(&bytes).unwrap();
        assert_eq!(decoded, sample_log());

        let won = Outcome::Won {
            winner: "alice".into(),
            loser: "bob".into(),
        };
        let bytes = codec.encode(&won).unwrap();
        assert_eq!(codec.decode::<Outcome>(&bytes).unwrap(), won);
    }

    #[test]
    fn test_bincode_is_smaller_than_json() {
        let json = JsonCodec.encode(&sample_log()).unwrap();
        let binary = BincodeCodec.encode(&sample_log()).unwrap();
        assert!(binary.len() < json.len());
    }

    #[test]
    fn test_json_decode_malformed_bytes() {
        let err = JsonCodec.decode::<GameLog>(b"{not json").unwrap_err();
        assert!(matches!(err, CodecError::JsonDecode(_)));
        assert!(err.is_decode());
    }

    #[test]
    fn test_bincode_decode_truncated_bytes() {
        let bytes = BincodeCodec.encode(&sample_log()).unwrap();
        let err = BincodeCodec
            .decode::<GameLog>(&bytes[..bytes.len() / 2])
            .unwrap_err();
        assert!(matches!(err, CodecError::BincodeDecode(_)));
    }

    #[test]
    fn test_json_encode_non_string_map_keys_fails() {
        let mut map = BTreeMap::new();
        map.insert(vec![1u8], "x");
        let err = JsonCodec.encode(&map).unwrap_err();
        assert!(matches!(err, CodecError::JsonEncode(_)));
        assert!(!err.is_decode());
    }

    #[test]
    fn test_content_type_tags() {
        assert_eq!(JsonCodec.content_type(), "application/json");
        assert_eq!(BincodeCodec.content_type(), "application/x-bincode");
    }

    #[test]
    fn test_accepts_matching_or_missing_content_type() {
        assert!(JsonCodec.accepts(Some("application/json")).is_ok());
        assert!(JsonCodec.accepts(None).is_ok());

        let err = BincodeCodec
            .accepts(Some("application/json"))
            .unwrap_err();
        assert!(matches!(
            err,
            CodecError::ContentTypeMismatch {
                expected: "application/x-bincode",
                ..
            }
        ));
    }
}
