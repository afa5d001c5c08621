//! Queue topology: lifetime classes, descriptors, and declare-and-bind.

use std::fmt;

use peril_broker::{
    Channel, Connection, DeclaredQueue, QueueArguments, QueueOptions,
};

use crate::PubSubError;

/// Exchange that receives every message a queue rejects without requeue.
pub const DEFAULT_DEAD_LETTER_EXCHANGE: &str = "peril_dlx";

/// Lifetime class of a queue.
///
/// The AMQP flags are always derived as a matched pair, so a queue is
/// never durable and exclusive at the same time, nor transient and
/// shared.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SimpleQueueType {
    /// Survives broker restarts, shared between consumers, never
    /// auto-deleted.
    Durable,
    /// Exclusive to the declaring connection and deleted once unused.
    Transient,
}

impl SimpleQueueType {
    /// The AMQP declaration flags for this class.
    pub fn options(self) -> QueueOptions {
        match self {
            Self::Durable => QueueOptions {
                durable: true,
                exclusive: false,
                auto_delete: false,
            },
            Self::Transient => QueueOptions {
                durable: false,
                exclusive: true,
                auto_delete: true,
            },
        }
    }
}

impl fmt::Display for SimpleQueueType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Durable => write!(f, "durable"),
            Self::Transient => write!(f, "transient"),
        }
    }
}

/// Everything needed to declare a queue and bind it to an exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueDescriptor {
    /// Queue name. Empty asks the broker to generate one.
    pub name: String,
    pub queue_type: SimpleQueueType,
    /// Exchange the queue is bound to.
    pub exchange: String,
    /// Binding key; a dot-separated pattern for topic exchanges.
    pub routing_key: String,
    /// Attached to the queue as `x-dead-letter-exchange`.
    pub dead_letter_exchange: String,
}

impl QueueDescriptor {
    /// Creates a descriptor using [`DEFAULT_DEAD_LETTER_EXCHANGE`].
    pub fn new(
        exchange: impl Into<String>,
        name: impl Into<String>,
        routing_key: impl Into<String>,
        queue_type: SimpleQueueType,
    ) -> Self {
        Self {
            name: name.into(),
            queue_type,
            exchange: exchange.into(),
            routing_key: routing_key.into(),
            dead_letter_exchange: DEFAULT_DEAD_LETTER_EXCHANGE.to_string(),
        }
    }

    /// Overrides the dead-letter exchange.
    pub fn with_dead_letter_exchange(
        mut self,
        exchange: impl Into<String>,
    ) -> Self {
        self.dead_letter_exchange = exchange.into();
        self
    }

    /// Queue arguments sent with the declaration.
    pub fn arguments(&self) -> QueueArguments {
        QueueArguments::with_dead_letter_exchange(&self.dead_letter_exchange)
    }
}

/// Opens a fresh channel, declares the queue and binds it.
///
/// The returned channel belongs to the caller; it is the one the
/// subscription (or publish path) must use from then on.
///
/// # Errors
/// - [`PubSubError::Connection`] if no channel could be opened.
/// - [`PubSubError::Topology`] if the declaration or binding is rejected,
///   e.g. the exchange does not exist or the queue already exists with
///   different flags. No retry happens here.
pub async fn declare_and_bind<C: Connection>(
    conn: &C,
    descriptor: &QueueDescriptor,
) -> Result<(C::Channel, DeclaredQueue), PubSubError> {
    let channel = conn
        .create_channel()
        .await
        .map_err(PubSubError::Connection)?;

    let topology_error = |source| PubSubError::Topology {
        queue: descriptor.name.clone(),
        exchange: descriptor.exchange.clone(),
        source,
    };

    let queue = channel
        .queue_declare(
            &descriptor.name,
            descriptor.queue_type.options(),
            &descriptor.arguments(),
        )
        .await
        .map_err(topology_error)?;

    channel
        .queue_bind(&queue.name, &descriptor.exchange, &descriptor.routing_key)
        .await
        .map_err(topology_error)?;

    tracing::debug!(
        queue = %queue.name,
        exchange = %descriptor.exchange,
        routing_key = %descriptor.routing_key,
        queue_type = %descriptor.queue_type,
        "queue declared and bound"
    );

    Ok((channel, queue))
}
