use crate::output::Output;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use proven_messaging::broker::{BrokerMessage, DeliveryHandler};
use proven_messaging::unmarshaler::Unmarshaler;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, trace};

/// How the pipeline finished with a delivery.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Outcome {
    /// The subscriber was already closed when the delivery arrived.
    Closed,

    /// The delivery could not be unmarshaled.
    Undecodable,

    /// The subscriber or the stream closed before the consumer took the
    /// message.
    Discarded,

    /// The consumer acked the message and the ack was sent to the broker.
    Acked,

    /// The consumer nacked the message.
    Nacked,

    /// The consumer did not resolve the message within the ack wait.
    TimedOut,

    /// The subscriber started closing while the message was unresolved.
    Abandoned,
}

/// Carries broker deliveries of one worker to the output stream and waits
/// for each to be resolved.
///
/// Only an ack reaches the broker; every other outcome leaves the delivery
/// to broker redelivery. `handle` returns once the message is resolved, so a
/// worker holds at most one message at a time.
pub struct DeliveryPipeline<M>
where
    M: BrokerMessage,
{
    topic: String,
    subscriber_num: usize,
    unmarshaler: Arc<dyn Unmarshaler<M>>,
    output: Arc<Output>,
    scope: CancellationToken,
    closing: CancellationToken,
    ack_wait: Duration,
}

impl<M> DeliveryPipeline<M>
where
    M: BrokerMessage,
{
    /// Creates a pipeline.
    ///
    /// Message contexts are children of `scope`. `closing` is the
    /// subscriber-wide closing signal.
    #[must_use]
    pub const fn new(
        topic: String,
        subscriber_num: usize,
        unmarshaler: Arc<dyn Unmarshaler<M>>,
        output: Arc<Output>,
        scope: CancellationToken,
        closing: CancellationToken,
        ack_wait: Duration,
    ) -> Self {
        Self {
            topic,
            subscriber_num,
            unmarshaler,
            output,
            scope,
            closing,
            ack_wait,
        }
    }

    /// Runs one delivery through the pipeline.
    pub async fn process(&self, delivery: M) -> Outcome {
        let topic = self.topic.as_str();
        let subscriber_num = self.subscriber_num;

        if self.closing.is_cancelled() {
            trace!(topic, subscriber_num, "subscriber closed, dropping delivery");
            return Outcome::Closed;
        }

        let mut message = match self.unmarshaler.unmarshal(&delivery) {
            Ok(message) => message,
            Err(error) => {
                error!(
                    topic,
                    subscriber_num,
                    sequence = delivery.sequence(),
                    %error,
                    "cannot unmarshal message"
                );
                return Outcome::Undecodable;
            }
        };

        let context = self.scope.child_token();
        let _cancel_context = context.clone().drop_guard();
        message.set_context(context);

        let message_uuid = message.uuid().to_string();
        trace!(
            topic,
            subscriber_num,
            %message_uuid,
            redelivered = delivery.redelivered(),
            "received message"
        );

        if !self.output.send(message.clone(), &self.closing).await {
            trace!(topic, subscriber_num, %message_uuid, "closing, message discarded");
            return Outcome::Discarded;
        }

        trace!(topic, subscriber_num, %message_uuid, "message taken by consumer");

        tokio::select! {
            biased;
            () = message.acked() => {
                if let Err(error) = delivery.ack().await {
                    error!(topic, subscriber_num, %message_uuid, %error, "cannot send ack");
                } else {
                    trace!(topic, subscriber_num, %message_uuid, "message acked");
                }
                Outcome::Acked
            }
            () = message.nacked() => {
                trace!(topic, subscriber_num, %message_uuid, "message nacked");
                Outcome::Nacked
            }
            () = tokio::time::sleep(self.ack_wait) => {
                debug!(
                    topic,
                    subscriber_num,
                    %message_uuid,
                    ack_wait = ?self.ack_wait,
                    "ack timeout"
                );
                Outcome::TimedOut
            }
            () = self.closing.cancelled() => {
                trace!(topic, subscriber_num, %message_uuid, "closing, message abandoned");
                Outcome::Abandoned
            }
        }
    }
}

#[async_trait]
impl<M> DeliveryHandler<M> for DeliveryPipeline<M>
where
    M: BrokerMessage,
{
    async fn handle(&self, delivery: M) {
        self.process(delivery).await;
    }
}
