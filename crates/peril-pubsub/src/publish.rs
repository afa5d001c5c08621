//! Publishing typed values.

use peril_broker::{Channel, Connection, OutboundMessage};
use peril_codec::{BincodeCodec, Codec, JsonCodec};
use serde::Serialize;

use crate::PubSubError;

/// Encodes `value` with `codec` and publishes it to `exchange` under
/// `routing_key`.
///
/// The message carries the codec's content type and nothing else: no
/// headers, expiration or priority. It is published non-mandatory, so a
/// message no queue is bound for is silently dropped by the broker.
/// Returns once the broker has accepted the message; there is no retry.
///
/// # Errors
/// - [`PubSubError::Encode`] if the codec cannot represent the value.
/// - [`PubSubError::Publish`] if the channel or connection is gone.
pub async fn publish<Ch, K, T>(
    channel: &Ch,
    exchange: &str,
    routing_key: &str,
    value: &T,
    codec: &K,
) -> Result<(), PubSubError>
where
    Ch: Channel,
    K: Codec,
    T: Serialize + ?Sized,
{
    let body = codec.encode(&value).map_err(PubSubError::Encode)?;
    let message = OutboundMessage {
        content_type: codec.content_type().to_string(),
        body,
    };

    channel
        .basic_publish(exchange, routing_key, message)
        .await
        .map_err(|source| PubSubError::Publish {
            exchange: exchange.to_string(),
            routing_key: routing_key.to_string(),
            source,
        })?;

    tracing::debug!(
        exchange,
        routing_key,
        content_type = codec.content_type(),
        "message published"
    );
    Ok(())
}

/// [`publish`] with [`JsonCodec`].
pub async fn publish_json<Ch, T>(
    channel: &Ch,
    exchange: &str,
    routing_key: &str,
    value: &T,
) -> Result<(), PubSubError>
where
    Ch: Channel,
    T: Serialize + ?Sized,
{
    publish(channel, exchange, routing_key, value, &JsonCodec).await
}

/// [`publish`] with [`BincodeCodec`].
pub async fn publish_bincode<Ch, T>(
    channel: &Ch,
    exchange: &str,
    routing_key: &str,
    value: &T,
) -> Result<(), PubSubError>
where
    Ch: Channel,
    T: Serialize + ?Sized,
{
    publish(channel, exchange, routing_key, value, &BincodeCodec).await
}

/// A publish path: one dedicated channel plus the codec it encodes with.
///
/// Channels are not shared between concurrent tasks, so each task that
/// publishes opens its own `Publisher`.
pub struct Publisher<Ch, K> {
    channel: Ch,
    codec: K,
}

impl<Ch: Channel, K: Codec> Publisher<Ch, K> {
    /// Opens a new channel on `conn` for publishing with `codec`.
    pub async fn open<C>(conn: &C, codec: K) -> Result<Self, PubSubError>
    where
        C: Connection<Channel = Ch>,
    {
        let channel = conn
            .create_channel()
            .await
            .map_err(PubSubError::Connection)?;
        Ok(Self { channel, codec })
    }

    /// Wraps an already open channel.
    pub fn new(channel: Ch, codec: K) -> Self {
        Self { channel, codec }
    }

    /// Publishes `value` to `exchange` under `routing_key`.
    pub async fn publish<T: Serialize + ?Sized>(
        &self,
        exchange: &str,
        routing_key: &str,
        value: &T,
    ) -> Result<(), PubSubError> {
        publish(&self.channel, exchange, routing_key, value, &self.codec).await
    }

    /// The content type stamped on every message from this publisher.
    pub fn content_type(&self) -> &'static str {
        self.codec.content_type()
    }

    /// Closes the underlying channel.
    pub async fn close(self) -> Result<(), PubSubError> {
        self.channel.close().await.map_err(PubSubError::Connection)
    }
}
