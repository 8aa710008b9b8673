use crate::error::Error;
use crate::message::NatsBrokerMessage;

use async_nats::jetstream::consumer::push::Messages;
use async_trait::async_trait;
use futures::StreamExt;
use proven_messaging::broker::{BrokerMessage, BrokerSubscription, DeliveryHandler};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// A subscription backed by a `JetStream` push consumer.
///
/// Deliveries are handed to the handler one at a time. Without manual ack
/// mode, each delivery is acked before it is handed over.
#[derive(Debug)]
pub struct NatsSubscription {
    topic: String,
    stop: CancellationToken,
}

impl NatsSubscription {
    pub(crate) fn start<H>(
        topic: &str,
        mut messages: Messages,
        handler: H,
        manual_ack: bool,
        stop: CancellationToken,
    ) -> Self
    where
        H: DeliveryHandler<NatsBrokerMessage>,
    {
        let loop_stop = stop.clone();
        let loop_topic = topic.to_string();

        tokio::spawn(async move {
            loop {
                let next = tokio::select! {
                    biased;
                    () = loop_stop.cancelled() => break,
                    next = messages.next() => next,
                };

                let message = match next {
                    Some(Ok(message)) => NatsBrokerMessage::new(message),
                    Some(Err(error)) => {
                        warn!(topic = %loop_topic, %error, "delivery error");
                        continue;
                    }
                    None => break,
                };

                if !manual_ack {
                    if let Err(error) = message.ack().await {
                        warn!(topic = %loop_topic, %error, "failed to auto ack delivery");
                    }
                }

                handler.handle(message).await;
            }

            debug!(topic = %loop_topic, "delivery loop stopped");
        });

        Self {
            topic: topic.to_string(),
            stop,
        }
    }
}

#[async_trait]
impl BrokerSubscription for NatsSubscription {
    type Error = Error;

    async fn close(self) -> Result<(), Self::Error> {
        self.stop.cancel();

        debug!(topic = %self.topic, "closed subscription");

        Ok(())
    }
}
