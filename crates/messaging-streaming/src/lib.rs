//! Bridges a durable streaming broker to streams of messages with manual,
//! explicit acknowledgment and bounded-time shutdown.
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

mod config;
mod error;

/// Writing side of a subscription's output stream.
pub mod output;

/// Per-delivery state machine.
pub mod pipeline;

/// Subscription registry and bounded shutdown.
pub mod shutdown;

pub use config::{
    DEFAULT_ACK_WAIT_TIMEOUT, DEFAULT_CLOSE_TIMEOUT, DEFAULT_SUBSCRIBERS_COUNT,
    StreamingSubscriberConfig,
};
pub use error::{BoxError, Error};
pub use pipeline::Outcome;

use output::Output;
use pipeline::DeliveryPipeline;
use shutdown::ShutdownCoordinator;

use std::fmt::{self, Debug};
use std::sync::Arc;

use async_trait::async_trait;
use proven_messaging::Messages;
use proven_messaging::broker::{
    BrokerConnection, BrokerConnector, BrokerMessage, BrokerSubscription, DeliveryHandler,
};
use proven_messaging::subscriber::Subscriber;
use proven_messaging::unmarshaler::Unmarshaler;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Connection type opened by a connector.
pub type ConnectionOf<C> = <C as BrokerConnector>::Connection;

/// Raw delivery type of a connector's connections.
pub type DeliveryOf<C> = <ConnectionOf<C> as BrokerConnection>::Message;

/// Subscription type of a connector's connections.
pub type SubscriptionOf<C> = <ConnectionOf<C> as BrokerConnection>::Subscription;

/// A subscriber reading topics of a durable streaming broker.
///
/// Each `subscribe` call starts `subscribers_count` workers feeding one
/// stream. A message is acked to the broker only when the consumer acks it;
/// nacked, unresolved and abandoned messages are left for the broker to
/// redeliver.
pub struct StreamingSubscriber<C>
where
    C: BrokerConnector,
{
    config: StreamingSubscriberConfig<DeliveryOf<C>>,
    connection: ConnectionOf<C>,
    unmarshaler: Arc<dyn Unmarshaler<DeliveryOf<C>>>,
    shutdown: ShutdownCoordinator<SubscriptionOf<C>>,
}

impl<C> StreamingSubscriber<C>
where
    C: BrokerConnector,
{
    /// Applies defaults, validates the configuration and connects.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid (before any
    /// connection attempt) or the connection fails.
    pub async fn new(
        mut config: StreamingSubscriberConfig<DeliveryOf<C>>,
        connector: &C,
    ) -> Result<Self, Error> {
        config.set_defaults();
        config.validate()?;

        let unmarshaler = config
            .unmarshaler
            .clone()
            .ok_or(Error::MissingUnmarshaler)?;

        let connection = connector
            .connect(
                &config.cluster_id,
                &config.client_id,
                &config.connection_options,
            )
            .await
            .map_err(|error| Error::Connect {
                cluster_id: config.cluster_id.clone(),
                source: Box::new(error),
            })?;

        info!(
            cluster_id = %config.cluster_id,
            client_id = %config.client_id,
            queue_group = ?config.queue_group,
            subscribers_count = config.subscribers_count(),
            "connected to broker"
        );

        let shutdown = ShutdownCoordinator::new(config.close_timeout());

        Ok(Self {
            config,
            connection,
            unmarshaler,
            shutdown,
        })
    }

    /// The configuration in effect, defaults applied.
    #[must_use]
    pub const fn config(&self) -> &StreamingSubscriberConfig<DeliveryOf<C>> {
        &self.config
    }

    async fn open<H>(
        &self,
        topic: &str,
        handler: H,
    ) -> Result<SubscriptionOf<C>, <ConnectionOf<C> as BrokerConnection>::Error>
    where
        H: DeliveryHandler<DeliveryOf<C>>,
    {
        let options = &self.config.subscription_options;

        match &self.config.queue_group {
            Some(queue_group) => {
                self.connection
                    .queue_subscribe(topic, queue_group, handler, options)
                    .await
            }
            None => self.connection.subscribe(topic, handler, options).await,
        }
    }

    async fn start_workers(
        &self,
        scope: &CancellationToken,
        topic: &str,
        output: &Arc<Output>,
    ) -> Result<(), Error> {
        for subscriber_num in 0..self.config.subscribers_count() {
            let pipeline = DeliveryPipeline::new(
                topic.to_string(),
                subscriber_num,
                Arc::clone(&self.unmarshaler),
                Arc::clone(output),
                scope.clone(),
                self.shutdown.closing().clone(),
                self.config.ack_wait_timeout(),
            );

            let subscription =
                self.open(topic, pipeline)
                    .await
                    .map_err(|error| Error::Subscribe {
                        topic: topic.to_string(),
                        subscriber_num,
                        source: Box::new(error),
                    })?;

            match self.shutdown.register(subscription) {
                Ok(id) => {
                    self.shutdown.watch(
                        id,
                        scope.clone(),
                        Arc::clone(output),
                        topic.to_string(),
                        subscriber_num,
                    );
                }
                Err(subscription) => {
                    debug!(topic, subscriber_num, "closed while subscribing");
                    if let Err(error) = subscription.close().await {
                        debug!(topic, subscriber_num, %error, "cannot close subscription");
                    }
                    return Err(Error::Closed);
                }
            }

            debug!(topic, subscriber_num, "subscriber started");
        }

        Ok(())
    }
}

impl<C> Debug for StreamingSubscriber<C>
where
    C: BrokerConnector,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamingSubscriber")
            .field("config", &self.config)
            .field("closed", &self.shutdown.is_closed())
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl<C> Subscriber for StreamingSubscriber<C>
where
    C: BrokerConnector,
{
    type Error = Error;

    async fn subscribe(
        &self,
        scope: CancellationToken,
        topic: &str,
    ) -> Result<Messages, Self::Error> {
        if self.shutdown.is_closed() {
            return Err(Error::Closed);
        }

        info!(
            topic,
            subscribers_count = self.config.subscribers_count(),
            "subscribing"
        );

        let (output, messages) = Output::new();

        // Hold the output open until every worker of this call has its own
        // watcher attached.
        output.attach();
        let started = self.start_workers(&scope, topic, &output).await;
        output.detach();

        started.map(|()| messages)
    }

    async fn subscribe_initialize(&self, topic: &str) -> Result<(), Self::Error> {
        let subscription =
            self.open(topic, Discard)
                .await
                .map_err(|error| Error::SubscribeInitialize {
                    topic: topic.to_string(),
                    source: Box::new(error),
                })?;

        subscription
            .close()
            .await
            .map_err(|error| Error::CloseAfterInitialize {
                topic: topic.to_string(),
                source: Box::new(error),
            })?;

        debug!(topic, "initialized subscription");

        Ok(())
    }

    async fn close(&self) -> Result<(), Self::Error> {
        if !self.shutdown.close().await {
            return Ok(());
        }

        debug!("closing broker connection");

        self.connection
            .close()
            .await
            .map_err(|error| Error::Close(Box::new(error)))?;

        info!("subscriber closed");

        Ok(())
    }
}

/// Handler for `subscribe_initialize`, which never consumes anything.
struct Discard;

#[async_trait]
impl<M> DeliveryHandler<M> for Discard
where
    M: BrokerMessage,
{
    async fn handle(&self, _message: M) {}
}
