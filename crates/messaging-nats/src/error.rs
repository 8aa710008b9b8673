use proven_messaging::broker::BrokerError;
use thiserror::Error;

/// Errors that can occur in the NATS broker.
#[derive(Debug, Error)]
pub enum Error {
    /// Ack error.
    #[error("failed to ack message: {0}")]
    Ack(async_nats::Error),

    /// A server URL could not be parsed.
    #[error("invalid server address `{url}`")]
    Address {
        /// The URL as given.
        url: String,

        /// Parse error.
        #[source]
        source: std::io::Error,
    },

    /// Connect error.
    #[error(transparent)]
    Connect(#[from] async_nats::ConnectError),

    /// The connection was already closed.
    #[error("connection is closed")]
    ConnectionClosed,

    /// Consumer create error.
    #[error("failed to create consumer: {0}")]
    Consumer(async_nats::jetstream::stream::ConsumerErrorKind),

    /// Flush error on close.
    #[error("failed to flush connection: {0}")]
    Flush(async_nats::client::FlushErrorKind),

    /// Consumer delivery subscription error.
    #[error("failed to subscribe to deliveries: {0}")]
    Messages(async_nats::jetstream::consumer::StreamErrorKind),

    /// Stream create error.
    #[error("failed to create stream: {0}")]
    Stream(async_nats::jetstream::context::CreateStreamErrorKind),
}

impl BrokerError for Error {}
