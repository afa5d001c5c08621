//! Error types for the publish/subscribe layer.

use peril_broker::BrokerError;
use peril_codec::CodecError;

/// Errors surfaced by publish and subscribe setup.
///
/// Callers only ever see setup-time failures. [`Decode`](Self::Decode)
/// stays inside a running subscription: the dispatch loop logs it and
/// discards the delivery.
#[derive(Debug, thiserror::Error)]
pub enum PubSubError {
    /// A channel could not be opened on the connection.
    #[error("connection error: {0}")]
    Connection(#[source] BrokerError),

    /// The broker rejected the queue declaration or binding.
    #[error(
        "topology setup failed for queue '{queue}' on exchange \
         '{exchange}': {source}"
    )]
    Topology {
        queue: String,
        exchange: String,
        #[source]
        source: BrokerError,
    },

    /// The value could not be represented by the codec.
    #[error("encode failed: {0}")]
    Encode(#[source] CodecError),

    /// A message body could not be decoded.
    #[error("decode failed: {0}")]
    Decode(#[source] CodecError),

    /// The broker refused the publish or the channel was gone.
    #[error(
        "publish to '{exchange}' with key '{routing_key}' failed: {source}"
    )]
    Publish {
        exchange: String,
        routing_key: String,
        #[source]
        source: BrokerError,
    },

    /// Setting the prefetch limit or starting the consumer failed.
    #[error("consumer setup failed for queue '{queue}': {source}")]
    Consume {
        queue: String,
        #[source]
        source: BrokerError,
    },

    /// The dispatch task panicked or was aborted.
    #[error("dispatch task failed: {0}")]
    TaskFailed(#[from] tokio::task::JoinError),
}
