//! Broker seam for Peril.
//!
//! Provides the [`Connection`], [`Channel`], [`Consumer`] and
//! [`Acknowledger`] traits that abstract over an AMQP 0-9-1 style broker:
//! queues are declared on a channel, bound to exchanges by routing key,
//! consumed with manual acknowledgment, and published to by exchange and
//! routing key.
//!
//! The publish/subscribe layer is written against these traits only, so
//! the same dispatch loop runs against a real broker or the in-process
//! test broker.
//!
//! # Feature Flags
//!
//! - `amqp` (default) — RabbitMQ-compatible implementation via `lapin`
//! - `memory` — in-process broker for tests and demos

mod error;
#[cfg(feature = "amqp")]
mod amqp;
#[cfg(feature = "memory")]
pub mod memory;

pub use error::BrokerError;
#[cfg(feature = "amqp")]
pub use amqp::{AmqpAcker, AmqpChannel, AmqpConnection, AmqpConsumer};

use std::future::Future;

/// Queue argument naming the exchange that receives rejected messages.
pub const DEAD_LETTER_EXCHANGE_ARG: &str = "x-dead-letter-exchange";

/// Lifetime flags for a declared queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct QueueOptions {
    /// Survives a broker restart.
    pub durable: bool,
    /// Usable only by the declaring connection; deleted when it closes.
    pub exclusive: bool,
    /// Deleted once its last consumer goes away.
    pub auto_delete: bool,
}

/// Optional queue arguments (the `x-*` table in AMQP terms).
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct QueueArguments {
    /// Where the broker routes messages rejected without requeue.
    pub dead_letter_exchange: Option<String>,
}

impl QueueArguments {
    /// Arguments carrying only a dead-letter exchange.
    pub fn with_dead_letter_exchange(exchange: impl Into<String>) -> Self {
        Self {
            dead_letter_exchange: Some(exchange.into()),
        }
    }
}

/// The broker's answer to a queue declaration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeclaredQueue {
    /// The queue name. Generated by the broker when an empty name was
    /// declared.
    pub name: String,
    /// Messages ready for delivery at declaration time.
    pub message_count: u32,
    /// Active consumers at declaration time.
    pub consumer_count: u32,
}

/// A message on its way to an exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundMessage {
    /// MIME type of `body`, stamped by the codec that produced it.
    pub content_type: String,
    /// Raw payload bytes.
    pub body: Vec<u8>,
}

/// One item of a consumer's delivery stream.
pub type DeliveryResult<A> = Result<Delivery<A>, BrokerError>;

/// One inbound message handed to a consumer.
///
/// The broker keeps ownership of the message until it is resolved through
/// [`ack`](Self::ack) or [`nack`](Self::nack).
#[derive(Debug)]
pub struct Delivery<A> {
    /// Channel-scoped handle the broker uses to identify this delivery.
    pub delivery_tag: u64,
    /// Exchange the message was originally published to.
    pub exchange: String,
    /// Routing key the message was originally published with.
    pub routing_key: String,
    /// `true` if this message has been delivered before and requeued.
    pub redelivered: bool,
    /// The content-type property, if the publisher set one.
    pub content_type: Option<String>,
    /// Raw payload bytes.
    pub body: Vec<u8>,
    acker: A,
}

impl<A: Acknowledger> Delivery<A> {
    pub(crate) fn new(
        delivery_tag: u64,
        exchange: String,
        routing_key: String,
        redelivered: bool,
        content_type: Option<String>,
        body: Vec<u8>,
        acker: A,
    ) -> Self {
        Self {
            delivery_tag,
            exchange,
            routing_key,
            redelivered,
            content_type,
            body,
            acker,
        }
    }

    /// Marks the delivery as processed; the broker removes it.
    pub async fn ack(&self) -> Result<(), BrokerError> {
        self.acker.ack().await
    }

    /// Rejects the delivery. With `requeue` the broker puts it back at
    /// the head of the queue, otherwise it is dropped or dead-lettered.
    pub async fn nack(&self, requeue: bool) -> Result<(), BrokerError> {
        self.acker.nack(requeue).await
    }
}

/// Resolves a single delivery on the channel it arrived on.
pub trait Acknowledger: Send + Sync + 'static {
    /// Positive acknowledgment.
    fn ack(&self) -> impl Future<Output = Result<(), BrokerError>> + Send;

    /// Negative acknowledgment, optionally requeueing the message.
    fn nack(
        &self,
        requeue: bool,
    ) -> impl Future<Output = Result<(), BrokerError>> + Send;
}

/// A stream of deliveries from one `basic.consume`.
pub trait Consumer: Send + 'static {
    /// The acknowledger attached to each delivery.
    type Acker: Acknowledger;

    /// The consumer tag the broker knows this stream by.
    fn tag(&self) -> &str;

    /// Waits for the next delivery.
    ///
    /// Returns `None` once the stream is closed (channel or connection
    /// closed, consumer cancelled).
    fn next_delivery(
        &mut self,
    ) -> impl Future<Output = Option<DeliveryResult<Self::Acker>>> + Send;
}

/// A lightweight session multiplexed over a [`Connection`].
///
/// Channels are not meant to be shared by concurrent tasks: each
/// subscription and each publish path opens its own.
pub trait Channel: Send + Sync + 'static {
    /// The delivery stream produced by [`basic_consume`](Self::basic_consume).
    type Consumer: Consumer;

    /// Declares a queue, or checks an existing one for equivalence.
    fn queue_declare(
        &self,
        name: &str,
        options: QueueOptions,
        arguments: &QueueArguments,
    ) -> impl Future<Output = Result<DeclaredQueue, BrokerError>> + Send;

    /// Binds a queue to an exchange under a routing key (or pattern).
    fn queue_bind(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> impl Future<Output = Result<(), BrokerError>> + Send;

    /// Limits how many unacknowledged deliveries the channel may hold.
    fn basic_qos(
        &self,
        prefetch_count: u16,
    ) -> impl Future<Output = Result<(), BrokerError>> + Send;

    /// Starts consuming a queue in manual-acknowledgment mode.
    ///
    /// An empty `consumer_tag` lets the broker pick one.
    fn basic_consume(
        &self,
        queue: &str,
        consumer_tag: &str,
    ) -> impl Future<Output = Result<Self::Consumer, BrokerError>> + Send;

    /// Publishes a message (non-mandatory, non-immediate).
    ///
    /// Resolves once the broker has accepted the message for routing.
    /// Unroutable messages are dropped by the broker without an error.
    fn basic_publish(
        &self,
        exchange: &str,
        routing_key: &str,
        message: OutboundMessage,
    ) -> impl Future<Output = Result<(), BrokerError>> + Send;

    /// Closes the channel. Unacknowledged deliveries return to their
    /// queues.
    fn close(&self) -> impl Future<Output = Result<(), BrokerError>> + Send;

    /// Returns `true` while the channel can be used.
    fn is_open(&self) -> bool;
}

/// A long-lived connection to the broker.
pub trait Connection: Send + Sync + 'static {
    /// The channel type opened on this connection.
    type Channel: Channel;

    /// Opens a fresh channel.
    fn create_channel(
        &self,
    ) -> impl Future<Output = Result<Self::Channel, BrokerError>> + Send;

    /// Closes the connection and every channel on it.
    fn close(&self) -> impl Future<Output = Result<(), BrokerError>> + Send;

    /// Returns `true` while the connection is usable.
    fn is_connected(&self) -> bool;
}
