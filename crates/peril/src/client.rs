//! `PerilClient`: one broker connection plus the settings every
//! subscription and publisher opened through it share.

use peril_broker::Connection;
#[cfg(feature = "amqp")]
use peril_broker::AmqpConnection;
use peril_codec::{BincodeCodec, Codec, JsonCodec};
use peril_pubsub::{
    Handler, Publisher, QueueDescriptor, SimpleQueueType, SubscribeOptions,
    Subscription,
};
use serde::de::DeserializeOwned;
use tokio_util::sync::CancellationToken;

use crate::{ClientConfig, PerilError};

/// A connected client.
///
/// Every subscription gets a child of the client's cancellation token,
/// so [`shutdown`](Self::shutdown) stops all of them at once.
///
/// # Example
///
/// ```rust,no_run
/// use peril::prelude::*;
///
/// # async fn run() -> Result<(), PerilError> {
/// let client = PerilClient::connect(ClientConfig::default()).await?;
/// let subscription = client
///     .subscribe_json(
///         EXCHANGE_PERIL_DIRECT,
///         &pause_queue("alice"),
///         PAUSE_KEY,
///         SimpleQueueType::Transient,
///         |state: PlayingState| async move {
///             println!("paused: {}", state.is_paused);
///             AckType::Ack
///         },
///     )
///     .await?;
/// # drop(subscription);
/// client.shutdown().await
/// # }
/// ```
#[derive(Debug)]
pub struct PerilClient<C: Connection> {
    connection: C,
    config: ClientConfig,
    token: CancellationToken,
}

#[cfg(feature = "amqp")]
impl PerilClient<AmqpConnection> {
    /// Connects to the broker at `config.uri`.
    pub async fn connect(config: ClientConfig) -> Result<Self, PerilError> {
        let config = config.validated();
        let connection = AmqpConnection::connect(&config.uri).await?;
        Ok(Self::from_connection(connection, config))
    }
}

impl<C: Connection> PerilClient<C> {
    /// Wraps an already open connection.
    pub fn from_connection(connection: C, config: ClientConfig) -> Self {
        Self {
            connection,
            config: config.validated(),
            token: CancellationToken::new(),
        }
    }

    /// The (validated) configuration in use.
    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// The underlying connection.
    pub fn connection(&self) -> &C {
        &self.connection
    }

    /// Returns `true` while the connection is usable.
    pub fn is_connected(&self) -> bool {
        self.connection.is_connected()
    }

    /// Opens a publisher on its own channel.
    pub async fn publisher<K: Codec>(
        &self,
        codec: K,
    ) -> Result<Publisher<C::Channel, K>, PerilError> {
        Ok(Publisher::open(&self.connection, codec).await?)
    }

    /// A queue descriptor carrying the configured dead-letter exchange.
    pub fn queue(
        &self,
        exchange: &str,
        queue_name: &str,
        routing_key: &str,
        queue_type: SimpleQueueType,
    ) -> QueueDescriptor {
        QueueDescriptor::new(exchange, queue_name, routing_key, queue_type)
            .with_dead_letter_exchange(&self.config.dead_letter_exchange)
    }

    /// Subscription options for `queue_name`: configured prefetch, a
    /// fresh consumer tag, and a child of the client's token.
    pub fn subscribe_options(&self, queue_name: &str) -> SubscribeOptions {
        SubscribeOptions {
            prefetch_count: self.config.prefetch_count,
            consumer_tag: consumer_tag(
                &self.config.consumer_tag_prefix,
                queue_name,
            ),
            cancel_token: self.token.child_token(),
        }
    }

    /// Subscribes `handler` to the queue described by `descriptor`.
    pub async fn subscribe<K, T, H>(
        &self,
        descriptor: &QueueDescriptor,
        codec: K,
        handler: H,
    ) -> Result<Subscription, PerilError>
    where
        K: Codec,
        T: DeserializeOwned + Send + 'static,
        H: Handler<T>,
    {
        let options = self.subscribe_options(&descriptor.name);
        Ok(peril_pubsub::subscribe_with_options(
            &self.connection,
            descriptor,
            options,
            codec,
            handler,
        )
        .await?)
    }

    /// Subscribes to JSON messages.
    pub async fn subscribe_json<T, H>(
        &self,
        exchange: &str,
        queue_name: &str,
        routing_key: &str,
        queue_type: SimpleQueueType,
        handler: H,
    ) -> Result<Subscription, PerilError>
    where
        T: DeserializeOwned + Send + 'static,
        H: Handler<T>,
    {
        let descriptor =
            self.queue(exchange, queue_name, routing_key, queue_type);
        self.subscribe(&descriptor, JsonCodec, handler).await
    }

    /// Subscribes to bincode messages.
    pub async fn subscribe_bincode<T, H>(
        &self,
        exchange: &str,
        queue_name: &str,
        routing_key: &str,
        queue_type: SimpleQueueType,
        handler: H,
    ) -> Result<Subscription, PerilError>
    where
        T: DeserializeOwned + Send + 'static,
        H: Handler<T>,
    {
        let descriptor =
            self.queue(exchange, queue_name, routing_key, queue_type);
        self.subscribe(&descriptor, BincodeCodec, handler).await
    }

    /// Subscribes a handler that always acknowledges what it decoded.
    pub async fn subscribe_auto_ack<K, T, F, Fut>(
        &self,
        descriptor: &QueueDescriptor,
        codec: K,
        handler: F,
    ) -> Result<Subscription, PerilError>
    where
        K: Codec,
        T: DeserializeOwned + Send + 'static,
        F: FnMut(T) -> Fut + Send + 'static,
        Fut: std::future::Future<Output = ()> + Send,
    {
        let options = self.subscribe_options(&descriptor.name);
        Ok(peril_pubsub::subscribe_auto_ack(
            &self.connection,
            descriptor,
            options,
            codec,
            handler,
        )
        .await?)
    }

    /// Cancels every subscription opened through this client and closes
    /// the connection. Deliveries still unacknowledged go back to their
    /// queues.
    pub async fn shutdown(self) -> Result<(), PerilError> {
        self.token.cancel();
        self.connection.close().await?;
        tracing::info!("peril client shut down");
        Ok(())
    }
}

/// `{prefix}-{queue}-{random hex}`; the suffix keeps tags unique when the
/// same queue is consumed twice.
fn consumer_tag(prefix: &str, queue_name: &str) -> String {
    let suffix: u32 = rand::random();
    if queue_name.is_empty() {
        format!("{prefix}-{suffix:08x}")
    } else {
        format!("{prefix}-{queue_name}-{suffix:08x}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_consumer_tag_shape() {
        let tag = consumer_tag("peril", "pause.alice");
        let suffix = tag.strip_prefix("peril-pause.alice-").unwrap();
        assert_eq!(suffix.len(), 8);
        assert!(suffix.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_consumer_tag_for_server_named_queue() {
        let tag = consumer_tag("peril", "");
        assert!(tag.starts_with("peril-"));
        assert_eq!(tag.len(), "peril-".len() + 8);
    }
}
