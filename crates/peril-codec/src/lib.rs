//! Payload codecs for Peril.
//!
//! A publisher and a subscriber only agree on two things: the Rust type
//! of the payload and the [`Codec`] that turns it into bytes. This crate
//! provides the trait plus the two encodings used on the wire:
//!
//! - [`JsonCodec`] (`application/json`) — human-readable, used for
//!   interactive and administrative messages.
//! - [`BincodeCodec`] (`application/x-bincode`) — compact binary, used
//!   for internal event streams.
//!
//! Every codec carries a content-type tag. The publisher stamps it on the
//! outgoing message and the subscriber can check it before decoding.
//!
//! # Feature Flags
//!
//! - `json` (default) — [`JsonCodec`] via `serde_json`
//! - `bincode` (default) — [`BincodeCodec`] via `bincode`

mod codec;
mod error;

pub use codec::Codec;
#[cfg(feature = "bincode")]
pub use codec::BincodeCodec;
#[cfg(feature = "json")]
pub use codec::JsonCodec;
pub use error::CodecError;
