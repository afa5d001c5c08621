//! Typed publish/subscribe for Peril.
//!
//! Built on the broker seam from `peril-broker` and the codecs from
//! `peril-codec`. Publishers encode a value and hand it to an exchange;
//! subscribers declare and bind a queue, then run a background dispatch
//! loop that decodes each delivery, calls a handler, and acknowledges the
//! delivery according to the handler's [`AckType`].
//!
//! # Key types
//!
//! - [`SimpleQueueType`] — durable or transient queue lifetime
//! - [`QueueDescriptor`] — queue name, binding, and dead-letter exchange
//! - [`Publisher`] — a dedicated channel plus a codec
//! - [`Handler`] — message handler returning an [`AckType`]
//! - [`Subscription`] — handle to a running dispatch loop

mod ack;
mod error;
mod publish;
mod queue;
mod subscribe;

pub use ack::{AckType, DispatchStats};
pub use error::PubSubError;
pub use publish::{Publisher, publish, publish_bincode, publish_json};
pub use queue::{
    DEFAULT_DEAD_LETTER_EXCHANGE, QueueDescriptor, SimpleQueueType,
    declare_and_bind,
};
pub use subscribe::{
    DEFAULT_PREFETCH_COUNT, Handler, SubscribeOptions, Subscription, subscribe,
    subscribe_auto_ack, subscribe_bincode, subscribe_json,
    subscribe_with_options,
};
