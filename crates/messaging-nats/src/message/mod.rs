use crate::error::Error;

use std::collections::HashMap;

use async_nats::jetstream::Message as JetStreamMessage;
use async_trait::async_trait;
use bytes::Bytes;
use proven_messaging::broker::BrokerMessage;

/// A delivery from a `JetStream` push consumer.
#[derive(Debug)]
pub struct NatsBrokerMessage {
    message: JetStreamMessage,
    headers: Option<HashMap<String, String>>,
    sequence: u64,
    redelivered: bool,
}

impl NatsBrokerMessage {
    pub(crate) fn new(message: JetStreamMessage) -> Self {
        // Only the first value of a repeated header is kept.
        let headers = message.headers.as_ref().map(|headers| {
            headers
                .iter()
                .filter_map(|(name, values)| {
                    values
                        .first()
                        .map(|value| (name.to_string(), value.as_str().to_string()))
                })
                .collect()
        });

        let (sequence, redelivered) = message
            .info()
            .map_or((0, false), |info| (info.stream_sequence, info.delivered > 1));

        Self {
            message,
            headers,
            sequence,
            redelivered,
        }
    }

    /// The subject the message was published on.
    #[must_use]
    pub fn subject(&self) -> &str {
        self.message.subject.as_str()
    }
}

#[async_trait]
impl BrokerMessage for NatsBrokerMessage {
    type Error = Error;

    fn payload(&self) -> &Bytes {
        &self.message.payload
    }

    fn headers(&self) -> Option<&HashMap<String, String>> {
        self.headers.as_ref()
    }

    fn sequence(&self) -> u64 {
        self.sequence
    }

    fn redelivered(&self) -> bool {
        self.redelivered
    }

    async fn ack(&self) -> Result<(), Self::Error> {
        self.message.ack().await.map_err(Error::Ack)
    }
}
