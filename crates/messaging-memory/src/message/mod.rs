use crate::error::Error;
use crate::state::{BrokerState, Delivery};

use std::collections::HashMap;
use std::sync::Weak;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use proven_messaging::broker::BrokerMessage;

/// A delivery from the in-memory broker.
#[derive(Clone, Debug)]
pub struct MemoryBrokerMessage {
    state: Weak<Mutex<BrokerState>>,
    consumer_id: u64,
    subscription_id: u64,
    sequence: u64,
    payload: Bytes,
    headers: HashMap<String, String>,
    redelivered: bool,
}

impl MemoryBrokerMessage {
    pub(crate) fn from_delivery(state: Weak<Mutex<BrokerState>>, delivery: Delivery) -> Self {
        Self {
            state,
            consumer_id: delivery.consumer_id,
            subscription_id: delivery.subscription_id,
            sequence: delivery.message.sequence,
            payload: delivery.message.payload,
            headers: delivery.message.headers,
            redelivered: delivery.redelivered,
        }
    }

    /// Id of the subscription the message was delivered to.
    #[must_use]
    pub const fn subscription_id(&self) -> u64 {
        self.subscription_id
    }
}

#[async_trait]
impl BrokerMessage for MemoryBrokerMessage {
    type Error = Error;

    fn payload(&self) -> &Bytes {
        &self.payload
    }

    fn headers(&self) -> Option<&HashMap<String, String>> {
        Some(&self.headers)
    }

    fn sequence(&self) -> u64 {
        self.sequence
    }

    fn redelivered(&self) -> bool {
        self.redelivered
    }

    async fn ack(&self) -> Result<(), Self::Error> {
        let state = self.state.upgrade().ok_or(Error::BrokerGone)?;
        state
            .lock()
            .ack(self.consumer_id, self.subscription_id, self.sequence)
    }
}
