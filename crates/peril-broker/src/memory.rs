//! In-process broker for tests and demos.
//!
//! [`MemoryBroker`] models the parts of AMQP 0-9-1 that the publish/
//! subscribe layer depends on: direct, topic and fanout exchanges;
//! durable, exclusive and auto-delete queues; dead-lettering; per-channel
//! prefetch; and requeue on nack or channel close. It keeps everything in
//! one mutex-guarded state struct and never persists anything.
//!
//! Exchanges are not declared through the [`Channel`] trait. The test
//! harness creates them up front with [`MemoryBroker::declare_exchange`],
//! the same way a real deployment provisions them outside the client.
//!
//! ```rust
//! use peril_broker::memory::{ExchangeKind, MemoryBroker};
//! use peril_broker::{Channel, Connection, QueueArguments, QueueOptions};
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> Result<(), peril_broker::BrokerError> {
//! let broker = MemoryBroker::new();
//! broker.declare_exchange("peril_topic", ExchangeKind::Topic)?;
//!
//! let conn = broker.connect();
//! let channel = conn.create_channel().await?;
//! let args = QueueArguments::default();
//! let queue = channel
//!     .queue_declare("game_logs", QueueOptions::default(), &args)
//!     .await?;
//! channel.queue_bind(&queue.name, "peril_topic", "game_logs.*").await?;
//! # Ok(())
//! # }
//! ```

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use tokio::sync::mpsc;

use crate::{
    Acknowledger, BrokerError, Channel, Connection, Consumer, DeclaredQueue,
    Delivery, OutboundMessage, QueueArguments, QueueOptions,
};

/// How an exchange matches routing keys against bindings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExchangeKind {
    /// Exact routing-key match.
    Direct,
    /// Dot-separated words; `*` matches one word, `#` zero or more.
    Topic,
    /// Every bound queue receives every message.
    Fanout,
}

/// A snapshot of a queue's broker-side state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueInfo {
    pub name: String,
    pub durable: bool,
    pub exclusive: bool,
    pub auto_delete: bool,
    pub dead_letter_exchange: Option<String>,
    /// Messages waiting to be delivered.
    pub ready: usize,
    /// Messages delivered but not yet acknowledged.
    pub unacked: usize,
    pub consumers: usize,
}

// ---------------------------------------------------------------------------
// Broker state
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
struct StoredMessage {
    exchange: String,
    routing_key: String,
    content_type: Option<String>,
    body: Vec<u8>,
    redelivered: bool,
}

struct ConsumerSlot {
    channel: u64,
    sender: mpsc::UnboundedSender<Delivery<MemoryAcker>>,
}

struct QueueState {
    options: QueueOptions,
    /// Owning connection for exclusive queues.
    owner: Option<u64>,
    dead_letter_exchange: Option<String>,
    /// (exchange, binding key)
    bindings: Vec<(String, String)>,
    messages: VecDeque<StoredMessage>,
    consumers: Vec<ConsumerSlot>,
    next_consumer: usize,
}

struct ChannelState {
    connection: u64,
    prefetch: u16,
    next_tag: u64,
    /// delivery tag → (queue, message)
    unacked: HashMap<u64, (String, StoredMessage)>,
}

impl ChannelState {
    fn has_capacity(&self) -> bool {
        self.prefetch == 0 || self.unacked.len() < usize::from(self.prefetch)
    }
}

#[derive(Default)]
struct BrokerState {
    /// Handed to every acker so deliveries can resolve themselves later.
    /// Weak, because buffered deliveries are owned by senders the state
    /// itself holds.
    this: Weak<Mutex<BrokerState>>,
    exchanges: HashMap<String, ExchangeKind>,
    queues: HashMap<String, QueueState>,
    channels: HashMap<u64, ChannelState>,
    connections: Vec<u64>,
    next_id: u64,
    /// Acks and nacks that arrived after their channel was closed.
    stale_resolutions: usize,
}

impl BrokerState {
    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn check_channel(&self, channel: u64) -> Result<(), BrokerError> {
        match self.channels.get(&channel) {
            Some(state) if self.connections.contains(&state.connection) => {
                Ok(())
            }
            Some(_) => {
                Err(BrokerError::Connection("connection closed".into()))
            }
            None => Err(BrokerError::ChannelClosed),
        }
    }

    fn check_owner(
        &self,
        queue: &str,
        connection: u64,
    ) -> Result<&QueueState, BrokerError> {
        let state = self
            .queues
            .get(queue)
            .ok_or_else(|| BrokerError::NotFound(format!("queue '{queue}'")))?;
        match state.owner {
            Some(owner) if owner != connection => {
                Err(BrokerError::ResourceLocked(format!(
                    "queue '{queue}' is exclusive to another connection"
                )))
            }
            _ => Ok(state),
        }
    }

    fn declare_queue(
        &mut self,
        connection: u64,
        name: &str,
        options: QueueOptions,
        arguments: &QueueArguments,
    ) -> Result<DeclaredQueue, BrokerError> {
        let name = if name.is_empty() {
            format!("amq.gen-{}", self.next_id())
        } else {
            name.to_string()
        };

        if self.queues.contains_key(&name) {
            let existing = self.check_owner(&name, connection)?;
            let equivalent = existing.options == options
                && existing.dead_letter_exchange
                    == arguments.dead_letter_exchange;
            if !equivalent {
                return Err(BrokerError::PreconditionFailed(format!(
                    "inequivalent arguments for queue '{name}'"
                )));
            }
            return Ok(DeclaredQueue {
                message_count: existing.messages.len() as u32,
                consumer_count: existing.consumers.len() as u32,
                name,
            });
        }

        self.queues.insert(
            name.clone(),
            QueueState {
                options,
                owner: options.exclusive.then_some(connection),
                dead_letter_exchange: arguments.dead_letter_exchange.clone(),
                bindings: Vec::new(),
                messages: VecDeque::new(),
                consumers: Vec::new(),
                next_consumer: 0,
            },
        );
        tracing::debug!(queue = %name, ?options, "queue declared");
        Ok(DeclaredQueue {
            name,
            message_count: 0,
            consumer_count: 0,
        })
    }

    fn bind_queue(
        &mut self,
        connection: u64,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), BrokerError> {
        if !self.exchanges.contains_key(exchange) {
            return Err(BrokerError::NotFound(format!("exchange '{exchange}'")));
        }
        self.check_owner(queue, connection)?;
        if let Some(state) = self.queues.get_mut(queue) {
            let binding = (exchange.to_string(), routing_key.to_string());
            if !state.bindings.contains(&binding) {
                state.bindings.push(binding);
            }
        }
        Ok(())
    }

    fn unacked_count(&self, queue: &str) -> usize {
        self.channels
            .values()
            .flat_map(|channel| channel.unacked.values())
            .filter(|(name, _)| name == queue)
            .count()
    }

    /// Routes a message through an exchange into every matching queue.
    fn route(&mut self, exchange: &str, message: StoredMessage) {
        let targets: Vec<String> = if exchange.is_empty() {
            // Default exchange: the routing key names the queue.
            self.queues
                .contains_key(&message.routing_key)
                .then(|| message.routing_key.clone())
                .into_iter()
                .collect()
        } else {
            let Some(kind) = self.exchanges.get(exchange).copied() else {
                return;
            };
            self.queues
                .iter()
                .filter(|(_, queue)| {
                    queue.bindings.iter().any(|(bound, pattern)| {
                        bound == exchange
                            && routing_matches(
                                kind,
                                pattern,
                                &message.routing_key,
                            )
                    })
                })
                .map(|(name, _)| name.clone())
                .collect()
        };

        if targets.is_empty() {
            tracing::trace!(
                exchange,
                routing_key = %message.routing_key,
                "message unroutable, dropped"
            );
        }

        for name in targets {
            if let Some(queue) = self.queues.get_mut(&name) {
                queue.messages.push_back(message.clone());
            }
            self.dispatch(&name);
        }
    }

    /// Sends a rejected message to its queue's dead-letter exchange, if
    /// the queue has one. Otherwise the message is dropped.
    fn dead_letter(&mut self, queue: &str, message: StoredMessage) {
        let target = self
            .queues
            .get(queue)
            .and_then(|state| state.dead_letter_exchange.clone());
        match target {
            Some(exchange) => {
                let message = StoredMessage {
                    redelivered: false,
                    ..message
                };
                self.route(&exchange, message);
            }
            None => {
                tracing::trace!(queue, "rejected message dropped");
            }
        }
    }

    /// Pushes ready messages to consumers whose channels have prefetch
    /// capacity left, round-robin.
    fn dispatch(&mut self, queue_name: &str) {
        loop {
            let Some(queue) = self.queues.get_mut(queue_name) else {
                return;
            };
            if queue.messages.is_empty() || queue.consumers.is_empty() {
                return;
            }

            let count = queue.consumers.len();
            let channels = &self.channels;
            let Some(index) = (0..count)
                .map(|offset| (queue.next_consumer + offset) % count)
                .find(|&i| {
                    channels
                        .get(&queue.consumers[i].channel)
                        .is_some_and(ChannelState::has_capacity)
                })
            else {
                return;
            };
            queue.next_consumer = (index + 1) % count;

            let channel_id = queue.consumers[index].channel;
            let (Some(channel), Some(message)) = (
                self.channels.get_mut(&channel_id),
                queue.messages.pop_front(),
            ) else {
                return;
            };
            channel.next_tag += 1;
            let tag = channel.next_tag;
            channel
                .unacked
                .insert(tag, (queue_name.to_string(), message.clone()));

            let delivery = Delivery::new(
                tag,
                message.exchange.clone(),
                message.routing_key.clone(),
                message.redelivered,
                message.content_type.clone(),
                message.body.clone(),
                MemoryAcker {
                    state: self.this.clone(),
                    channel: channel_id,
                    delivery_tag: tag,
                },
            );

            if queue.consumers[index].sender.send(delivery).is_err() {
                // The consumer stream was dropped: take the message back
                // and forget the consumer.
                channel.unacked.remove(&tag);
                queue.messages.push_front(message);
                queue.consumers.remove(index);
                queue.next_consumer = 0;
                self.delete_if_unused(queue_name);
            }
        }
    }

    fn ack(&mut self, channel: u64, tag: u64) -> Result<(), BrokerError> {
        let (queue, _) = self.take_unacked(channel, tag)?;
        self.dispatch(&queue);
        Ok(())
    }

    fn nack(
        &mut self,
        channel: u64,
        tag: u64,
        requeue: bool,
    ) -> Result<(), BrokerError> {
        let (queue, message) = self.take_unacked(channel, tag)?;
        if requeue {
            if let Some(state) = self.queues.get_mut(&queue) {
                state.messages.push_front(StoredMessage {
                    redelivered: true,
                    ..message
                });
            }
        } else {
            self.dead_letter(&queue, message);
        }
        self.dispatch(&queue);
        Ok(())
    }

    fn take_unacked(
        &mut self,
        channel: u64,
        tag: u64,
    ) -> Result<(String, StoredMessage), BrokerError> {
        self.check_channel(channel)?;
        self.channels
            .get_mut(&channel)
            .and_then(|state| state.unacked.remove(&tag))
            .ok_or_else(|| {
                BrokerError::PreconditionFailed(format!(
                    "unknown delivery tag {tag}"
                ))
            })
    }

    /// Closes a channel: its consumers go away and its unacknowledged
    /// deliveries return to the head of their queues, marked redelivered.
    fn close_channel(&mut self, channel: u64) {
        let Some(state) = self.channels.remove(&channel) else {
            return;
        };

        let mut unacked: Vec<_> = state.unacked.into_iter().collect();
        // Highest tag first, so push_front restores delivery order.
        unacked.sort_by(|a, b| b.0.cmp(&a.0));
        let mut touched = Vec::new();
        for (_, (queue, message)) in unacked {
            if let Some(state) = self.queues.get_mut(&queue) {
                state.messages.push_front(StoredMessage {
                    redelivered: true,
                    ..message
                });
            }
            touched.push(queue);
        }

        for (name, queue) in self.queues.iter_mut() {
            let before = queue.consumers.len();
            queue.consumers.retain(|slot| slot.channel != channel);
            if queue.consumers.len() != before {
                queue.next_consumer = 0;
                touched.push(name.clone());
            }
        }

        touched.sort();
        touched.dedup();
        for queue in touched {
            self.delete_if_unused(&queue);
            self.dispatch(&queue);
        }
    }

    fn close_connection(&mut self, connection: u64) {
        self.connections.retain(|&id| id != connection);
        let channels: Vec<u64> = self
            .channels
            .iter()
            .filter(|(_, state)| state.connection == connection)
            .map(|(&id, _)| id)
            .collect();
        for channel in channels {
            self.close_channel(channel);
        }
        self.queues.retain(|name, queue| {
            let keep = queue.owner != Some(connection);
            if !keep {
                tracing::debug!(queue = %name, "exclusive queue deleted");
            }
            keep
        });
    }

    /// Deletes an auto-delete queue once it has no consumers left.
    fn delete_if_unused(&mut self, queue: &str) {
        let unused = self.queues.get(queue).is_some_and(|state| {
            state.options.auto_delete && state.consumers.is_empty()
        });
        if unused {
            self.queues.remove(queue);
            tracing::debug!(queue, "auto-delete queue deleted");
        }
    }
}

/// Matches a routing key against a binding key for the exchange kind.
fn routing_matches(kind: ExchangeKind, pattern: &str, key: &str) -> bool {
    match kind {
        ExchangeKind::Direct => pattern == key,
        ExchangeKind::Fanout => true,
        ExchangeKind::Topic => {
            let pattern: Vec<&str> = pattern.split('.').collect();
            let key: Vec<&str> = key.split('.').collect();
            topic_words_match(&pattern, &key)
        }
    }
}

fn topic_words_match(pattern: &[&str], key: &[&str]) -> bool {
    match pattern.split_first() {
        None => key.is_empty(),
        Some((&"#", rest)) => {
            (0..=key.len()).any(|skip| topic_words_match(rest, &key[skip..]))
        }
        Some((&"*", rest)) => {
            !key.is_empty() && topic_words_match(rest, &key[1..])
        }
        Some((word, rest)) => {
            key.first() == Some(word) && topic_words_match(rest, &key[1..])
        }
    }
}

fn lock(state: &Mutex<BrokerState>) -> MutexGuard<'_, BrokerState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

// ---------------------------------------------------------------------------
// Public handles
// ---------------------------------------------------------------------------

/// An in-process broker. Cheap to clone; clones share state.
#[derive(Debug, Clone)]
pub struct MemoryBroker {
    state: Arc<Mutex<BrokerState>>,
}

impl MemoryBroker {
    /// Creates an empty broker with no exchanges.
    pub fn new() -> Self {
        let state = Arc::new_cyclic(|this| {
            Mutex::new(BrokerState {
                this: this.clone(),
                ..BrokerState::default()
            })
        });
        Self { state }
    }

    /// Declares an exchange. Redeclaring with the same kind is a no-op.
    pub fn declare_exchange(
        &self,
        name: &str,
        kind: ExchangeKind,
    ) -> Result<(), BrokerError> {
        let mut state = lock(&self.state);
        match state.exchanges.get(name) {
            Some(existing) if *existing != kind => {
                Err(BrokerError::PreconditionFailed(format!(
                    "exchange '{name}' already declared as {existing:?}"
                )))
            }
            Some(_) => Ok(()),
            None => {
                state.exchanges.insert(name.to_string(), kind);
                Ok(())
            }
        }
    }

    /// Opens a new client connection.
    pub fn connect(&self) -> MemoryConnection {
        let mut state = lock(&self.state);
        let id = state.next_id();
        state.connections.push(id);
        MemoryConnection {
            broker: self.clone(),
            id,
        }
    }

    /// Simulates a broker restart: every connection is dropped and only
    /// durable queues (with their bindings) survive. Messages are not
    /// persistent and are lost.
    pub fn restart(&self) {
        let mut state = lock(&self.state);
        let connections = state.connections.clone();
        for connection in connections {
            state.close_connection(connection);
        }
        state.queues.retain(|_, queue| queue.options.durable);
        for queue in state.queues.values_mut() {
            queue.messages.clear();
        }
        tracing::debug!(queues = state.queues.len(), "broker restarted");
    }

    /// Returns a snapshot of the named queue, if it exists.
    pub fn queue_info(&self, name: &str) -> Option<QueueInfo> {
        let state = lock(&self.state);
        let queue = state.queues.get(name)?;
        Some(QueueInfo {
            name: name.to_string(),
            durable: queue.options.durable,
            exclusive: queue.options.exclusive,
            auto_delete: queue.options.auto_delete,
            dead_letter_exchange: queue.dead_letter_exchange.clone(),
            ready: queue.messages.len(),
            unacked: state.unacked_count(name),
            consumers: queue.consumers.len(),
        })
    }

    /// Number of acks and nacks sent on a channel that was already
    /// closed. A well-behaved client keeps this at zero.
    pub fn stale_resolutions(&self) -> usize {
        lock(&self.state).stale_resolutions
    }

    /// Publishes straight into an exchange, bypassing any client.
    ///
    /// Useful for injecting hand-crafted (e.g. malformed) messages.
    pub fn inject(
        &self,
        exchange: &str,
        routing_key: &str,
        message: OutboundMessage,
    ) -> Result<(), BrokerError> {
        let mut state = lock(&self.state);
        if !exchange.is_empty() && !state.exchanges.contains_key(exchange) {
            return Err(BrokerError::NotFound(format!("exchange '{exchange}'")));
        }
        state.route(
            exchange,
            StoredMessage {
                exchange: exchange.to_string(),
                routing_key: routing_key.to_string(),
                content_type: Some(message.content_type),
                body: message.body,
                redelivered: false,
            },
        );
        Ok(())
    }
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

/// A client connection to a [`MemoryBroker`].
#[derive(Debug)]
pub struct MemoryConnection {
    broker: MemoryBroker,
    id: u64,
}

impl Connection for MemoryConnection {
    type Channel = MemoryChannel;

    async fn create_channel(&self) -> Result<MemoryChannel, BrokerError> {
        let mut state = lock(&self.broker.state);
        if !state.connections.contains(&self.id) {
            return Err(BrokerError::Connection("connection closed".into()));
        }
        let id = state.next_id();
        state.channels.insert(
            id,
            ChannelState {
                connection: self.id,
                prefetch: 0,
                next_tag: 0,
                unacked: HashMap::new(),
            },
        );
        Ok(MemoryChannel {
            broker: self.broker.clone(),
            connection: self.id,
            id,
        })
    }

    async fn close(&self) -> Result<(), BrokerError> {
        lock(&self.broker.state).close_connection(self.id);
        Ok(())
    }

    fn is_connected(&self) -> bool {
        lock(&self.broker.state).connections.contains(&self.id)
    }
}

impl Drop for MemoryConnection {
    fn drop(&mut self) {
        lock(&self.broker.state).close_connection(self.id);
    }
}

/// A channel on a [`MemoryConnection`].
#[derive(Debug)]
pub struct MemoryChannel {
    broker: MemoryBroker,
    connection: u64,
    id: u64,
}

impl Channel for MemoryChannel {
    type Consumer = MemoryConsumer;

    async fn queue_declare(
        &self,
        name: &str,
        options: QueueOptions,
        arguments: &QueueArguments,
    ) -> Result<DeclaredQueue, BrokerError> {
        let mut state = lock(&self.broker.state);
        state.check_channel(self.id)?;
        state.declare_queue(self.connection, name, options, arguments)
    }

    async fn queue_bind(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), BrokerError> {
        let mut state = lock(&self.broker.state);
        state.check_channel(self.id)?;
        state.bind_queue(self.connection, queue, exchange, routing_key)
    }

    async fn basic_qos(&self, prefetch_count: u16) -> Result<(), BrokerError> {
        let mut state = lock(&self.broker.state);
        state.check_channel(self.id)?;
        if let Some(channel) = state.channels.get_mut(&self.id) {
            channel.prefetch = prefetch_count;
        }
        Ok(())
    }

    async fn basic_consume(
        &self,
        queue: &str,
        consumer_tag: &str,
    ) -> Result<MemoryConsumer, BrokerError> {
        let mut state = lock(&self.broker.state);
        state.check_channel(self.id)?;
        state.check_owner(queue, self.connection)?;

        let tag = if consumer_tag.is_empty() {
            format!("amq.ctag-{}", state.next_id())
        } else {
            consumer_tag.to_string()
        };
        let (sender, receiver) = mpsc::unbounded_channel();
        if let Some(queue_state) = state.queues.get_mut(queue) {
            queue_state.consumers.push(ConsumerSlot {
                channel: self.id,
                sender,
            });
        }
        state.dispatch(queue);

        Ok(MemoryConsumer {
            broker: self.broker.clone(),
            channel: self.id,
            tag,
            receiver,
        })
    }

    async fn basic_publish(
        &self,
        exchange: &str,
        routing_key: &str,
        message: OutboundMessage,
    ) -> Result<(), BrokerError> {
        lock(&self.broker.state).check_channel(self.id)?;
        self.broker.inject(exchange, routing_key, message)
    }

    async fn close(&self) -> Result<(), BrokerError> {
        lock(&self.broker.state).close_channel(self.id);
        Ok(())
    }

    fn is_open(&self) -> bool {
        lock(&self.broker.state).check_channel(self.id).is_ok()
    }
}

impl Drop for MemoryChannel {
    fn drop(&mut self) {
        lock(&self.broker.state).close_channel(self.id);
    }
}

/// A delivery stream from a [`MemoryChannel`].
#[derive(Debug)]
pub struct MemoryConsumer {
    broker: MemoryBroker,
    channel: u64,
    tag: String,
    receiver: mpsc::UnboundedReceiver<Delivery<MemoryAcker>>,
}

impl Consumer for MemoryConsumer {
    type Acker = MemoryAcker;

    fn tag(&self) -> &str {
        &self.tag
    }

    async fn next_delivery(
        &mut self,
    ) -> Option<Result<Delivery<MemoryAcker>, BrokerError>> {
        let delivery = self.receiver.recv().await?;
        // Deliveries buffered before a close were already requeued.
        if lock(&self.broker.state).check_channel(self.channel).is_err() {
            return None;
        }
        Some(Ok(delivery))
    }
}

/// Resolves a delivery against the [`MemoryBroker`] that produced it.
#[derive(Debug)]
pub struct MemoryAcker {
    state: Weak<Mutex<BrokerState>>,
    channel: u64,
    delivery_tag: u64,
}

impl MemoryAcker {
    fn resolve(&self, requeue: Option<bool>) -> Result<(), BrokerError> {
        let state = self.state.upgrade().ok_or(BrokerError::ChannelClosed)?;
        let mut state = lock(&state);
        if state.check_channel(self.channel).is_err() {
            state.stale_resolutions += 1;
        }
        match requeue {
            None => state.ack(self.channel, self.delivery_tag),
            Some(requeue) => {
                state.nack(self.channel, self.delivery_tag, requeue)
            }
        }
    }
}

impl Acknowledger for MemoryAcker {
    async fn ack(&self) -> Result<(), BrokerError> {
        self.resolve(None)
    }

    async fn nack(&self, requeue: bool) -> Result<(), BrokerError> {
        self.resolve(Some(requeue))
    }
}

impl std::fmt::Debug for BrokerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BrokerState")
            .field("exchanges", &self.exchanges)
            .field("queues", &self.queues.len())
            .field("channels", &self.channels.len())
            .finish()
    }
}
