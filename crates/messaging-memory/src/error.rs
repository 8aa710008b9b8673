use proven_messaging::broker::BrokerError;
use thiserror::Error;

/// Errors that can occur in the in-memory broker.
#[derive(Clone, Debug, Error)]
pub enum Error {
    /// Ack rejected by fault injection.
    #[error("failed to ack message {0}")]
    Ack(u64),

    /// The broker was dropped.
    #[error("broker is gone")]
    BrokerGone,

    /// Connection close rejected by fault injection.
    #[error("failed to close connection")]
    Close,

    /// Connection refused by fault injection.
    #[error("connection refused")]
    ConnectionRefused,

    /// The connection was already closed.
    #[error("connection is closed")]
    ConnectionClosed,

    /// Another connection uses the same client id.
    #[error("client id `{0}` is already connected")]
    DuplicateClientId(String),

    /// Subscribe rejected by fault injection.
    #[error("failed to subscribe to `{0}`")]
    Subscribe(String),

    /// Ack after every member of the subscription left.
    #[error("subscription is closed")]
    SubscriptionClosed,

    /// Connect to a cluster id the broker does not serve.
    #[error("unknown cluster `{0}`")]
    UnknownCluster(String),
}

impl BrokerError for Error {}
