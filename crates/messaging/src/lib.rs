//! Abstract interface for consuming messages from durable streaming brokers.
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

/// The narrow contract a wire-level broker client has to provide.
pub mod broker;

/// Messages handed to application code, with ack/nack signalling.
pub mod message;

/// Options understood by broker connections and subscriptions.
pub mod options;

/// Subscribers turn broker subscriptions into streams of messages.
pub mod subscriber;

/// Strategies for turning raw broker messages into messages.
pub mod unmarshaler;

pub use message::{Message, Metadata, Resolution};
pub use subscriber::{Handoff, Messages};
