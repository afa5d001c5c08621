//! # Peril
//!
//! Typed publish/subscribe over an AMQP 0-9-1 broker for the Peril game.
//!
//! Peril declares and binds queues, encodes values with a pluggable
//! [`Codec`](peril_codec::Codec), and runs one background dispatch loop
//! per subscription. Handlers return an [`AckType`](peril_pubsub::AckType)
//! that decides whether each message is acknowledged, requeued, or
//! discarded to the dead-letter exchange.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use peril::prelude::*;
//!
//! # async fn run() -> Result<(), PerilError> {
//! peril::init_tracing("info");
//! let client = PerilClient::connect(ClientConfig::default()).await?;
//!
//! let publisher = client.publisher(JsonCodec).await?;
//! let state = PlayingState { is_paused: true };
//! publisher.publish(EXCHANGE_PERIL_DIRECT, PAUSE_KEY, &state).await?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Crates
//!
//! - `peril-codec` — [`JsonCodec`](peril_codec::JsonCodec) and
//!   [`BincodeCodec`](peril_codec::BincodeCodec)
//! - `peril-broker` — the broker seam and its `lapin` implementation
//! - `peril-pubsub` — topology, publisher, subscriber

mod client;
mod config;
mod error;
mod logging;
pub mod routing;

pub use client::PerilClient;
pub use config::{ClientConfig, DEFAULT_CONSUMER_TAG_PREFIX, DEFAULT_URI};
pub use error::PerilError;
pub use logging::init_tracing;

pub use peril_broker as broker;
pub use peril_codec as codec;
pub use peril_pubsub as pubsub;

pub mod prelude {
    pub use crate::routing::*;
    pub use crate::{ClientConfig, PerilClient, PerilError, init_tracing};
    pub use peril_codec::{BincodeCodec, Codec, JsonCodec};
    pub use peril_pubsub::{
        AckType, DispatchStats, Handler, Publisher, QueueDescriptor,
        SimpleQueueType, SubscribeOptions, Subscription,
    };
}
