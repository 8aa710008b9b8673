use crate::error::Error;

use std::fmt::{self, Debug};
use std::sync::Arc;
use std::time::Duration;

use proven_messaging::broker::BrokerMessage;
use proven_messaging::options::{ConnectionOption, SubscriptionOption};
use proven_messaging::unmarshaler::Unmarshaler;

/// Default number of workers per `subscribe` call.
pub const DEFAULT_SUBSCRIBERS_COUNT: usize = 1;

/// Default bound on how long `close` waits for workers.
pub const DEFAULT_CLOSE_TIMEOUT: Duration = Duration::from_secs(30);

/// Default time a delivered message may stay unresolved.
pub const DEFAULT_ACK_WAIT_TIMEOUT: Duration = Duration::from_secs(30);

/// Configuration for the `StreamingSubscriber`.
pub struct StreamingSubscriberConfig<M>
where
    M: BrokerMessage,
{
    /// The broker cluster to join.
    pub cluster_id: String,

    /// Client id for the broker connection. Must be unique within the cluster.
    pub client_id: String,

    /// Queue group shared by all workers. Required with more than one worker.
    pub queue_group: Option<String>,

    /// Durable name, so the broker keeps the position across restarts.
    pub durable_name: Option<String>,

    /// Number of workers per `subscribe` call. Defaults to 1 if not set.
    pub subscribers_count: Option<usize>,

    /// Bound on how long `close` waits for workers. Defaults to 30 seconds if not set.
    pub close_timeout: Option<Duration>,

    /// How long a delivered message may stay unresolved before it is dropped
    /// for redelivery. Defaults to 30 seconds if not set.
    pub ack_wait_timeout: Option<Duration>,

    /// Options passed to the broker when connecting.
    pub connection_options: Vec<ConnectionOption>,

    /// Options passed to the broker on every subscribe.
    pub subscription_options: Vec<SubscriptionOption>,

    /// Turns broker deliveries into messages.
    pub unmarshaler: Option<Arc<dyn Unmarshaler<M>>>,
}

impl<M> StreamingSubscriberConfig<M>
where
    M: BrokerMessage,
{
    /// Fills unset (or zero) values with their defaults and appends the
    /// subscription options the subscriber relies on: manual ack mode, the
    /// ack wait and, if set, the durable name.
    pub fn set_defaults(&mut self) {
        let subscribers_count = self.subscribers_count();
        let close_timeout = self.close_timeout();
        let ack_wait_timeout = self.ack_wait_timeout();

        self.subscribers_count = Some(subscribers_count);
        self.close_timeout = Some(close_timeout);
        self.ack_wait_timeout = Some(ack_wait_timeout);

        self.subscription_options
            .push(SubscriptionOption::ManualAckMode);
        self.subscription_options
            .push(SubscriptionOption::AckWait(ack_wait_timeout));

        if let Some(durable_name) = &self.durable_name {
            self.subscription_options
                .push(SubscriptionOption::DurableName(durable_name.clone()));
        }
    }

    /// Checks the configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if no unmarshaler is set, or if more than one worker
    /// is configured without a queue group.
    pub fn validate(&self) -> Result<(), Error> {
        if self.unmarshaler.is_none() {
            return Err(Error::MissingUnmarshaler);
        }

        let subscribers_count = self.subscribers_count();
        if subscribers_count > 1 && self.queue_group.is_none() {
            return Err(Error::QueueGroupRequired(subscribers_count));
        }

        Ok(())
    }

    /// Number of workers per `subscribe` call.
    #[must_use]
    pub fn subscribers_count(&self) -> usize {
        self.subscribers_count
            .filter(|count| *count > 0)
            .unwrap_or(DEFAULT_SUBSCRIBERS_COUNT)
    }

    /// Bound on how long `close` waits for workers.
    #[must_use]
    pub fn close_timeout(&self) -> Duration {
        self.close_timeout
            .filter(|timeout| !timeout.is_zero())
            .unwrap_or(DEFAULT_CLOSE_TIMEOUT)
    }

    /// How long a delivered message may stay unresolved.
    #[must_use]
    pub fn ack_wait_timeout(&self) -> Duration {
        self.ack_wait_timeout
            .filter(|timeout| !timeout.is_zero())
            .unwrap_or(DEFAULT_ACK_WAIT_TIMEOUT)
    }
}

impl<M> Default for StreamingSubscriberConfig<M>
where
    M: BrokerMessage,
{
    fn default() -> Self {
        Self {
            cluster_id: String::new(),
            client_id: String::new(),
            queue_group: None,
            durable_name: None,
            subscribers_count: None,
            close_timeout: None,
            ack_wait_timeout: None,
            connection_options: Vec::new(),
            subscription_options: Vec::new(),
            unmarshaler: None,
        }
    }
}

impl<M> Clone for StreamingSubscriberConfig<M>
where
    M: BrokerMessage,
{
    fn clone(&self) -> Self {
        Self {
            cluster_id: self.cluster_id.clone(),
            client_id: self.client_id.clone(),
            queue_group: self.queue_group.clone(),
            durable_name: self.durable_name.clone(),
            subscribers_count: self.subscribers_count,
            close_timeout: self.close_timeout,
            ack_wait_timeout: self.ack_wait_timeout,
            connection_options: self.connection_options.clone(),
            subscription_options: self.subscription_options.clone(),
            unmarshaler: self.unmarshaler.clone(),
        }
    }
}

impl<M> Debug for StreamingSubscriberConfig<M>
where
    M: BrokerMessage,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamingSubscriberConfig")
            .field("cluster_id", &self.cluster_id)
            .field("client_id", &self.client_id)
            .field("queue_group", &self.queue_group)
            .field("durable_name", &self.durable_name)
            .field("subscribers_count", &self.subscribers_count)
            .field("close_timeout", &self.close_timeout)
            .field("ack_wait_timeout", &self.ack_wait_timeout)
            .field("connection_options", &self.connection_options)
            .field("subscription_options", &self.subscription_options)
            .field("unmarshaler", &self.unmarshaler.is_some())
            .finish()
    }
}
