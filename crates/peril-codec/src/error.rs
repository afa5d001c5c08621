//! Error types for the codec layer.

/// Errors produced while turning payloads into bytes or back.
///
/// Encode failures are programmer errors (the value has no representation
/// in the chosen format). Decode failures are expected at runtime: a
/// subscriber may receive bytes that were never produced by its codec.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    /// JSON serialization failed.
    #[cfg(feature = "json")]
    #[error("json encode failed: {0}")]
    JsonEncode(#[source] serde_json::Error),

    /// The bytes are not valid JSON for the expected type.
    #[cfg(feature = "json")]
    #[error("json decode failed: {0}")]
    JsonDecode(#[source] serde_json::Error),

    /// Bincode serialization failed.
    #[cfg(feature = "bincode")]
    #[error("bincode encode failed: {0}")]
    BincodeEncode(#[source] bincode::Error),

    /// The bytes do not match the bincode layout of the expected type.
    #[cfg(feature = "bincode")]
    #[error("bincode decode failed: {0}")]
    BincodeDecode(#[source] bincode::Error),

    /// The message was tagged with a different content type than the
    /// codec that was asked to decode it.
    #[error("content type mismatch: expected {expected}, got {actual}")]
    ContentTypeMismatch {
        expected: &'static str,
        actual: String,
    },
}

impl CodecError {
    /// Returns `true` for errors raised on the decode path.
    pub fn is_decode(&self) -> bool {
        match self {
            #[cfg(feature = "json")]
            Self::JsonDecode(_) => true,
            #[cfg(feature = "bincode")]
            Self::BincodeDecode(_) => true,
            Self::ContentTypeMismatch { .. } => true,
            #[allow(unreachable_patterns)]
            _ => false,
        }
    }
}
