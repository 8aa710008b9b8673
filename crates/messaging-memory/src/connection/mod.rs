use crate::MemoryBroker;
use crate::error::Error;
use crate::message::MemoryBrokerMessage;
use crate::subscription::MemorySubscription;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use proven_messaging::broker::{BrokerConnection, BrokerConnector, DeliveryHandler};
use proven_messaging::options::{ConnectionOption, SubscriptionOption, SubscriptionSettings};
use tracing::debug;

/// A client connection to the in-memory broker.
#[derive(Clone, Debug)]
pub struct MemoryConnection {
    broker: MemoryBroker,
    client_id: String,
    closed: Arc<AtomicBool>,
}

impl MemoryConnection {
    /// The client id this connection was opened with.
    #[must_use]
    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    fn open<H>(
        &self,
        topic: &str,
        queue_group: Option<&str>,
        handler: H,
        options: &[SubscriptionOption],
    ) -> Result<MemorySubscription, Error>
    where
        H: DeliveryHandler<MemoryBrokerMessage>,
    {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::ConnectionClosed);
        }

        let settings = SubscriptionSettings::from_options(options);
        let (opened, redeliveries) =
            self.broker
                .state
                .lock()
                .open(&self.client_id, topic, queue_group, settings)?;

        debug!(
            client_id = %self.client_id,
            topic,
            queue_group,
            subscription_id = opened.subscription_id,
            "opened subscription"
        );

        let subscription = MemorySubscription::start(&self.broker, opened, handler);
        self.broker.schedule_redeliveries(redeliveries);

        Ok(subscription)
    }
}

#[async_trait]
impl BrokerConnector for MemoryBroker {
    type Error = Error;
    type Connection = MemoryConnection;

    async fn connect(
        &self,
        cluster_id: &str,
        client_id: &str,
        _options: &[ConnectionOption],
    ) -> Result<Self::Connection, Self::Error> {
        self.state.lock().connect(cluster_id, client_id)?;

        debug!(cluster_id, client_id, "client connected");

        Ok(MemoryConnection {
            broker: self.clone(),
            client_id: client_id.to_string(),
            closed: Arc::new(AtomicBool::new(false)),
        })
    }
}

#[async_trait]
impl BrokerConnection for MemoryConnection {
    type Error = Error;
    type Message = MemoryBrokerMessage;
    type Subscription = MemorySubscription;

    async fn subscribe<H>(
        &self,
        topic: &str,
        handler: H,
        options: &[SubscriptionOption],
    ) -> Result<Self::Subscription, Self::Error>
    where
        H: DeliveryHandler<Self::Message>,
    {
        self.open(topic, None, handler, options)
    }

    async fn queue_subscribe<H>(
        &self,
        topic: &str,
        queue_group: &str,
        handler: H,
        options: &[SubscriptionOption],
    ) -> Result<Self::Subscription, Self::Error>
    where
        H: DeliveryHandler<Self::Message>,
    {
        self.open(topic, Some(queue_group), handler, options)
    }

    async fn close(&self) -> Result<(), Self::Error> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        debug!(client_id = %self.client_id, "closing connection");

        self.broker.state.lock().disconnect(&self.client_id)
    }
}
