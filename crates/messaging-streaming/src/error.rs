use proven_messaging::subscriber::SubscriberError;
use thiserror::Error;

/// Boxed broker or unmarshaler error.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Errors that can occur in the streaming subscriber.
#[derive(Debug, Error)]
pub enum Error {
    /// Closing the broker connection failed.
    #[error("cannot close broker connection: {0}")]
    Close(#[source] BoxError),

    /// The subscriber was already closed.
    #[error("subscriber is closed")]
    Closed,

    /// Closing the subscription opened by `subscribe_initialize` failed.
    #[error("cannot close subscription after initializing `{topic}`")]
    CloseAfterInitialize {
        /// Topic that was initialized.
        topic: String,

        /// Broker error.
        #[source]
        source: BoxError,
    },

    /// Connecting to the broker failed.
    #[error("cannot connect to cluster `{cluster_id}`")]
    Connect {
        /// Cluster the subscriber tried to join.
        cluster_id: String,

        /// Broker error.
        #[source]
        source: BoxError,
    },

    /// No unmarshaler was configured.
    #[error("missing unmarshaler")]
    MissingUnmarshaler,

    /// More than one worker was configured without a queue group.
    #[error("queue group is required with {0} subscribers")]
    QueueGroupRequired(usize),

    /// A broker subscribe failed.
    #[error("cannot subscribe to `{topic}` (subscriber {subscriber_num})")]
    Subscribe {
        /// Topic of the failed subscription.
        topic: String,

        /// Index of the worker that failed to subscribe.
        subscriber_num: usize,

        /// Broker error.
        #[source]
        source: BoxError,
    },

    /// Opening the subscription for `subscribe_initialize` failed.
    #[error("cannot initialize subscription to `{topic}`")]
    SubscribeInitialize {
        /// Topic that was initialized.
        topic: String,

        /// Broker error.
        #[source]
        source: BoxError,
    },
}

impl Error {
    /// Whether the error comes from validating the configuration.
    #[must_use]
    pub const fn is_configuration(&self) -> bool {
        matches!(self, Self::MissingUnmarshaler | Self::QueueGroupRequired(_))
    }
}

impl SubscriberError for Error {}
