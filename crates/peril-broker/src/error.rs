/// Errors that can occur while talking to the broker.
#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    /// The connection could not be established or was lost.
    #[error("connection failed: {0}")]
    Connection(String),

    /// The channel was closed, by us or by the broker.
    #[error("channel closed")]
    ChannelClosed,

    /// An exchange or queue referenced by the operation does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// A redeclare did not match the existing entity's properties.
    #[error("precondition failed: {0}")]
    PreconditionFailed(String),

    /// An exclusive queue is owned by another connection.
    #[error("resource locked: {0}")]
    ResourceLocked(String),

    /// An error reported by the AMQP client library.
    #[cfg(feature = "amqp")]
    #[error("amqp error: {0}")]
    Amqp(#[from] lapin::Error),
}
