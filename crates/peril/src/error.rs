//! Unified error type for the Peril client.

use peril_broker::BrokerError;
use peril_codec::CodecError;
use peril_pubsub::PubSubError;

/// Top-level error that wraps all crate-specific errors.
///
/// When using the `peril` meta-crate, you deal with this single error
/// type instead of importing errors from each sub-crate. The `#[from]`
/// attribute on each variant lets `?` convert sub-crate errors.
#[derive(Debug, thiserror::Error)]
pub enum PerilError {
    /// A broker-level error (connect, channel, declaration).
    #[error(transparent)]
    Broker(#[from] BrokerError),

    /// A codec error (encode, decode, content type).
    #[error(transparent)]
    Codec(#[from] CodecError),

    /// A publish or subscribe error.
    #[error(transparent)]
    PubSub(#[from] PubSubError),
}
