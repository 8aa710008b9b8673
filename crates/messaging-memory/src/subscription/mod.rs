use crate::MemoryBroker;
use crate::error::Error;
use crate::message::MemoryBrokerMessage;
use crate::state::Opened;

use std::sync::Arc;

use async_trait::async_trait;
use proven_messaging::broker::{BrokerMessage, BrokerSubscription, DeliveryHandler};
use tokio_util::sync::CancellationToken;
use tracing::{trace, warn};

/// A subscription on the in-memory broker.
///
/// Deliveries are handed to the handler one at a time. Without manual ack
/// mode, each delivery is acked once the handler returns.
#[derive(Debug)]
pub struct MemorySubscription {
    broker: MemoryBroker,
    consumer_id: u64,
    subscription_id: u64,
    stop: CancellationToken,
}

impl MemorySubscription {
    pub(crate) fn start<H>(broker: &MemoryBroker, opened: Opened, handler: H) -> Self
    where
        H: DeliveryHandler<MemoryBrokerMessage>,
    {
        let Opened {
            consumer_id,
            subscription_id,
            mut receiver,
            stop,
            manual_ack,
        } = opened;

        let state = Arc::downgrade(&broker.state);
        let loop_stop = stop.clone();

        tokio::spawn(async move {
            loop {
                let delivery = tokio::select! {
                    biased;
                    () = loop_stop.cancelled() => break,
                    delivery = receiver.recv() => match delivery {
                        Some(delivery) => delivery,
                        None => break,
                    },
                };

                let Some(strong) = state.upgrade() else {
                    break;
                };
                strong.lock().record_delivery(subscription_id);
                drop(strong);

                let message = MemoryBrokerMessage::from_delivery(state.clone(), delivery);

                if manual_ack {
                    handler.handle(message).await;
                } else {
                    handler.handle(message.clone()).await;

                    if let Err(error) = message.ack().await {
                        warn!(subscription_id, %error, "failed to auto ack delivery");
                    }
                }
            }

            trace!(subscription_id, "delivery loop stopped");
        });

        Self {
            broker: broker.clone(),
            consumer_id,
            subscription_id,
            stop,
        }
    }

    /// Id of this subscription, as reported by
    /// [`MemoryBrokerMessage::subscription_id`].
    #[must_use]
    pub const fn id(&self) -> u64 {
        self.subscription_id
    }
}

#[async_trait]
impl BrokerSubscription for MemorySubscription {
    type Error = Error;

    async fn close(self) -> Result<(), Self::Error> {
        let delay = self.broker.state.lock().faults.subscription_close_delay;
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        self.stop.cancel();
        self.broker
            .state
            .lock()
            .close_member(self.consumer_id, self.subscription_id);

        trace!(subscription_id = self.subscription_id, "closed subscription");

        Ok(())
    }
}
