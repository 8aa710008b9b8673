use crate::consumer::{consumer_config, stream_config};
use crate::error::Error;
use crate::message::NatsBrokerMessage;
use crate::subscription::NatsSubscription;

use async_nats::Client;
use async_nats::jetstream::Context as JetStreamContext;
use async_trait::async_trait;
use proven_messaging::broker::{BrokerConnection, DeliveryHandler};
use proven_messaging::options::{SubscriptionOption, SubscriptionSettings};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// A connection to a NATS server with `JetStream` enabled.
#[derive(Clone, Debug)]
pub struct NatsConnection {
    client: Client,
    jetstream_context: JetStreamContext,
    cluster_id: String,
    client_id: String,
    closed: CancellationToken,
}

impl NatsConnection {
    pub(crate) fn new(client: Client, cluster_id: &str, client_id: &str) -> Self {
        let jetstream_context = async_nats::jetstream::new(client.clone());

        Self {
            client,
            jetstream_context,
            cluster_id: cluster_id.to_string(),
            client_id: client_id.to_string(),
            closed: CancellationToken::new(),
        }
    }

    /// The underlying NATS client.
    #[must_use]
    pub const fn client(&self) -> &Client {
        &self.client
    }

    async fn open<H>(
        &self,
        topic: &str,
        queue_group: Option<&str>,
        handler: H,
        options: &[SubscriptionOption],
    ) -> Result<NatsSubscription, Error>
    where
        H: DeliveryHandler<NatsBrokerMessage>,
    {
        if self.closed.is_cancelled() {
            return Err(Error::ConnectionClosed);
        }

        let settings = SubscriptionSettings::from_options(options);

        let stream = self
            .jetstream_context
            .get_or_create_stream(stream_config(&self.cluster_id, topic))
            .await
            .map_err(|e| Error::Stream(e.kind()))?;

        let config = consumer_config(
            self.client.new_inbox(),
            &self.client_id,
            queue_group,
            &settings,
        );

        let consumer = match config.durable_name.clone() {
            Some(name) => stream.get_or_create_consumer(&name, config).await,
            None => stream.create_consumer(config).await,
        }
        .map_err(|e| Error::Consumer(e.kind()))?;

        let messages = consumer
            .messages()
            .await
            .map_err(|e| Error::Messages(e.kind()))?;

        debug!(
            client_id = %self.client_id,
            topic,
            queue_group,
            "opened subscription"
        );

        Ok(NatsSubscription::start(
            topic,
            messages,
            handler,
            settings.manual_ack,
            self.closed.child_token(),
        ))
    }
}

#[async_trait]
impl BrokerConnection for NatsConnection {
    type Error = Error;
    type Message = NatsBrokerMessage;
    type Subscription = NatsSubscription;

    async fn subscribe<H>(
        &self,
        topic: &str,
        handler: H,
        options: &[SubscriptionOption],
    ) -> Result<Self::Subscription, Self::Error>
    where
        H: DeliveryHandler<Self::Message>,
    {
        self.open(topic, None, handler, options).await
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
        self.open(topic, Some(queue_group), handler, options).await
    }

    /// Stops every subscription of the connection and flushes pending acks.
    async fn close(&self) -> Result<(), Self::Error> {
        if self.closed.is_cancelled() {
            return Ok(());
        }
        self.closed.cancel();

        self.client
            .flush()
            .await
            .map_err(|e| Error::Flush(e.kind()))?;

        info!(client_id = %self.client_id, "connection closed");

        Ok(())
    }
}
