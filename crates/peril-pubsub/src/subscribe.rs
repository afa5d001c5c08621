//! Subscriptions: topology setup plus a background dispatch loop.
//!
//! Subscribing runs every fallible setup step up front and reports its
//! errors to the caller. Only then is the dispatch loop spawned:
//!
//! ```text
//! declare + bind → basic.qos(prefetch) → basic.consume → spawn loop
//! ```
//!
//! The loop handles one delivery at a time: decode, call the handler,
//! resolve the handler's [`AckType`] with the broker, then wait for the
//! next one. At most `prefetch_count` deliveries sit unacknowledged on the
//! channel at once; that limit is the only backpressure there is.

use std::future::Future;
use std::marker::PhantomData;

use peril_broker::{
    Acknowledger, BrokerError, Channel, Connection, Consumer, Delivery,
};
use peril_codec::{BincodeCodec, Codec, JsonCodec};
use serde::de::DeserializeOwned;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::{
    AckType, DispatchStats, PubSubError, QueueDescriptor, SimpleQueueType,
    declare_and_bind,
};

/// Unacknowledged deliveries allowed per subscription by default.
pub const DEFAULT_PREFETCH_COUNT: u16 = 10;

/// Receives decoded messages and decides how each one is acknowledged.
///
/// Failures are expressed through the returned [`AckType`], never by
/// panicking: `NackRequeue` for something worth retrying, `NackDiscard`
/// for something that will never succeed.
///
/// Any `FnMut(T) -> impl Future<Output = AckType>` closure is a handler:
///
/// ```rust
/// use peril_pubsub::{AckType, Handler};
///
/// fn assert_handler<T, H: Handler<T>>(_: &H) {}
///
/// let handler = |paused: bool| async move {
///     if paused { AckType::Ack } else { AckType::NackDiscard }
/// };
/// assert_handler::<bool, _>(&handler);
/// ```
pub trait Handler<T>: Send + 'static {
    /// Handles one message.
    fn handle(&mut self, message: T) -> impl Future<Output = AckType> + Send;
}

impl<T, F, Fut> Handler<T> for F
where
    F: FnMut(T) -> Fut + Send + 'static,
    Fut: Future<Output = AckType> + Send,
{
    fn handle(&mut self, message: T) -> impl Future<Output = AckType> + Send {
        self(message)
    }
}

/// Per-subscription settings.
#[derive(Debug, Clone)]
pub struct SubscribeOptions {
    /// Maximum unacknowledged deliveries on the subscription's channel.
    pub prefetch_count: u16,
    /// Consumer tag; empty lets the broker choose.
    pub consumer_tag: String,
    /// Cancelling this token stops the dispatch loop.
    pub cancel_token: CancellationToken,
}

impl Default for SubscribeOptions {
    fn default() -> Self {
        Self {
            prefetch_count: DEFAULT_PREFETCH_COUNT,
            consumer_tag: String::new(),
            cancel_token: CancellationToken::new(),
        }
    }
}

/// Handle to a running subscription.
///
/// Dropping the handle does not stop the subscription: the dispatch loop
/// keeps running until its delivery stream closes. Use
/// [`cancel`](Self::cancel) or [`shutdown`](Self::shutdown) to stop it
/// explicitly.
#[derive(Debug)]
pub struct Subscription {
    queue: String,
    consumer_tag: String,
    token: CancellationToken,
    task: JoinHandle<DispatchStats>,
}

impl Subscription {
    /// Name of the consumed queue (useful for broker-named queues).
    pub fn queue(&self) -> &str {
        &self.queue
    }

    /// The consumer tag the broker knows this subscription by.
    pub fn consumer_tag(&self) -> &str {
        &self.consumer_tag
    }

    /// Signals the dispatch loop to stop after the delivery in progress.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    /// Returns `true` once the dispatch loop has exited.
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Cancels the subscription and waits for the loop to exit.
    ///
    /// The subscription's channel is closed on the way out, so deliveries
    /// that were prefetched but not handled go back to the queue.
    pub async fn shutdown(self) -> Result<DispatchStats, PubSubError> {
        self.token.cancel();
        self.join().await
    }

    /// Waits for the loop to exit on its own (stream closed).
    pub async fn join(self) -> Result<DispatchStats, PubSubError> {
        Ok(self.task.await?)
    }
}

/// Subscribes with [`SubscribeOptions::default`].
///
/// See [`subscribe_with_options`].
pub async fn subscribe<C, K, T, H>(
    conn: &C,
    descriptor: &QueueDescriptor,
    codec: K,
    handler: H,
) -> Result<Subscription, PubSubError>
where
    C: Connection,
    K: Codec,
    T: DeserializeOwned + Send + 'static,
    H: Handler<T>,
{
    subscribe_with_options(
        conn,
        descriptor,
        SubscribeOptions::default(),
        codec,
        handler,
    )
    .await
}

/// Declares and binds the queue, applies the prefetch limit, starts
/// consuming, and spawns the dispatch loop.
///
/// Every step that can fail does so before anything is spawned; once this
/// returns `Ok`, messages are processed in the background.
///
/// # Errors
/// - [`PubSubError::Connection`] / [`PubSubError::Topology`] from
///   [`declare_and_bind`].
/// - [`PubSubError::Consume`] if the prefetch limit or the consumer
///   cannot be set up.
pub async fn subscribe_with_options<C, K, T, H>(
    conn: &C,
    descriptor: &QueueDescriptor,
    options: SubscribeOptions,
    codec: K,
    handler: H,
) -> Result<Subscription, PubSubError>
where
    C: Connection,
    K: Codec,
    T: DeserializeOwned + Send + 'static,
    H: Handler<T>,
{
    let (channel, queue) = declare_and_bind(conn, descriptor).await?;

    let consume_error = |source| PubSubError::Consume {
        queue: queue.name.clone(),
        source,
    };
    channel
        .basic_qos(options.prefetch_count)
        .await
        .map_err(consume_error)?;
    let consumer = channel
        .basic_consume(&queue.name, &options.consumer_tag)
        .await
        .map_err(consume_error)?;

    let consumer_tag = consumer.tag().to_string();
    tracing::info!(
        queue = %queue.name,
        consumer_tag = %consumer_tag,
        prefetch = options.prefetch_count,
        content_type = codec.content_type(),
        "subscription started"
    );

    let dispatch = DispatchLoop {
        queue: queue.name.clone(),
        channel,
        consumer,
        codec,
        handler,
        token: options.cancel_token.clone(),
        stats: DispatchStats::default(),
        _message: PhantomData,
    };
    let task = tokio::spawn(dispatch.run());

    Ok(Subscription {
        queue: queue.name,
        consumer_tag,
        token: options.cancel_token,
        task,
    })
}

/// Subscribes with a handler that returns nothing.
///
/// Every message that decodes is acknowledged once the handler returns,
/// whatever the handler made of it. Undecodable messages are still
/// discarded.
pub async fn subscribe_auto_ack<C, K, T, F, Fut>(
    conn: &C,
    descriptor: &QueueDescriptor,
    options: SubscribeOptions,
    codec: K,
    mut handler: F,
) -> Result<Subscription, PubSubError>
where
    C: Connection,
    K: Codec,
    T: DeserializeOwned + Send + 'static,
    F: FnMut(T) -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send,
{
    let acking = move |message: T| {
        let handled = handler(message);
        async move {
            handled.await;
            AckType::Ack
        }
    };
    subscribe_with_options(conn, descriptor, options, codec, acking).await
}

/// Subscribes to JSON messages with default options.
pub async fn subscribe_json<C, T, H>(
    conn: &C,
    exchange: &str,
    queue_name: &str,
    routing_key: &str,
    queue_type: SimpleQueueType,
    handler: H,
) -> Result<Subscription, PubSubError>
where
    C: Connection,
    T: DeserializeOwned + Send + 'static,
    H: Handler<T>,
{
    let descriptor =
        QueueDescriptor::new(exchange, queue_name, routing_key, queue_type);
    subscribe(conn, &descriptor, JsonCodec, handler).await
}

/// Subscribes to bincode messages with default options.
pub async fn subscribe_bincode<C, T, H>(
    conn: &C,
    exchange: &str,
    queue_name: &str,
    routing_key: &str,
    queue_type: SimpleQueueType,
    handler: H,
) -> Result<Subscription, PubSubError>
where
    C: Connection,
    T: DeserializeOwned + Send + 'static,
    H: Handler<T>,
{
    let descriptor =
        QueueDescriptor::new(exchange, queue_name, routing_key, queue_type);
    subscribe(conn, &descriptor, BincodeCodec, handler).await
}

/// The background task behind a [`Subscription`]. Owns the channel and
/// the delivery stream; nothing else touches either.
struct DispatchLoop<Ch, Co, K, T, H> {
    queue: String,
    channel: Ch,
    consumer: Co,
    codec: K,
    handler: H,
    token: CancellationToken,
    stats: DispatchStats,
    _message: PhantomData<fn() -> T>,
}

impl<Ch, Co, K, T, H> DispatchLoop<Ch, Co, K, T, H>
where
    Ch: Channel,
    Co: Consumer,
    K: Codec,
    T: DeserializeOwned + Send + 'static,
    H: Handler<T>,
{
    /// Runs until the delivery stream ends or the token is cancelled.
    async fn run(mut self) -> DispatchStats {
        loop {
            let next = tokio::select! {
                biased;
                () = self.token.cancelled() => {
                    tracing::debug!(
                        queue = %self.queue,
                        "subscription cancelled"
                    );
                    break;
                }
                next = self.consumer.next_delivery() => next,
            };

            let delivery = match next {
                Some(Ok(delivery)) => delivery,
                Some(Err(e)) => {
                    tracing::error!(
                        queue = %self.queue,
                        error = %e,
                        "delivery stream failed"
                    );
                    break;
                }
                None => {
                    tracing::info!(
                        queue = %self.queue,
                        "delivery stream closed"
                    );
                    break;
                }
            };

            if let Err(e) = self.process(delivery).await {
                if !self.channel.is_open() {
                    tracing::debug!(
                        queue = %self.queue,
                        error = %e,
                        "channel closed, leaving delivery unresolved"
                    );
                    break;
                }
                tracing::warn!(
                    queue = %self.queue,
                    error = %e,
                    "failed to resolve delivery"
                );
            }
        }

        if self.token.is_cancelled() && self.channel.is_open() {
            if let Err(e) = self.channel.close().await {
                tracing::debug!(
                    queue = %self.queue,
                    error = %e,
                    "closing subscription channel failed"
                );
            }
        }

        tracing::info!(
            queue = %self.queue,
            acked = self.stats.acked,
            requeued = self.stats.requeued,
            discarded = self.stats.discarded,
            "subscription stopped"
        );
        self.stats
    }

    /// Decodes, hands off, and resolves a single delivery.
    ///
    /// Nothing is sent if the channel closed while the handler ran; the
    /// broker has already returned the delivery to its queue.
    async fn process(
        &mut self,
        delivery: Delivery<Co::Acker>,
    ) -> Result<(), BrokerError> {
        let (decision, decode_failed) =
            match decode::<K, T>(&self.codec, &delivery) {
                Ok(message) => (self.handler.handle(message).await, false),
                Err(e) => {
                    tracing::warn!(
                        queue = %self.queue,
                        delivery_tag = delivery.delivery_tag,
                        routing_key = %delivery.routing_key,
                        error = %e,
                        "undecodable delivery, discarding"
                    );
                    (AckType::NackDiscard, true)
                }
            };

        if !self.channel.is_open() {
            return Err(BrokerError::ChannelClosed);
        }

        decision.resolve(&delivery).await?;
        if decode_failed {
            self.stats.record_undecodable();
        } else {
            self.stats.record(decision);
        }
        tracing::debug!(
            queue = %self.queue,
            delivery_tag = delivery.delivery_tag,
            ?decision,
            "delivery resolved"
        );
        Ok(())
    }
}

/// Checks the content type, then decodes the body.
fn decode<K: Codec, T: DeserializeOwned>(
    codec: &K,
    delivery: &Delivery<impl Acknowledger>,
) -> Result<T, PubSubError> {
    codec
        .accepts(delivery.content_type.as_deref())
        .and_then(|()| codec.decode(&delivery.body))
        .map_err(PubSubError::Decode)
}
