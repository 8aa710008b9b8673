use crate::broker::BrokerMessage;
use crate::message::{Message, Metadata};

use std::collections::HashMap;
use std::error::Error;

use bytes::Bytes;
use thiserror::Error;

/// Header carrying the message uuid.
pub const UUID_HEADER: &str = "Message-Uuid";

/// Turns raw broker deliveries into messages.
pub trait Unmarshaler<M>
where
    Self: Send + Sync + 'static,
    M: BrokerMessage,
{
    /// Unmarshals a raw delivery.
    ///
    /// # Errors
    ///
    /// Returns an error if the delivery cannot be represented as a message.
    fn unmarshal(&self, message: &M) -> Result<Message, Box<dyn Error + Send + Sync>>;
}

/// Errors produced by [`HeaderUnmarshaler`].
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum UnmarshalError {
    /// The delivery has no headers at all.
    #[error("delivery has no headers")]
    MissingHeaders,

    /// The uuid header is missing or empty.
    #[error("delivery has no `Message-Uuid` header")]
    MissingUuid,
}

/// Reads the uuid from [`UUID_HEADER`], metadata from the remaining headers,
/// and takes the payload verbatim.
#[derive(Clone, Copy, Debug, Default)]
pub struct HeaderUnmarshaler;

impl<M> Unmarshaler<M> for HeaderUnmarshaler
where
    M: BrokerMessage,
{
    fn unmarshal(&self, message: &M) -> Result<Message, Box<dyn Error + Send + Sync>> {
        let headers = message.headers().ok_or(UnmarshalError::MissingHeaders)?;

        let uuid = headers
            .get(UUID_HEADER)
            .filter(|uuid| !uuid.is_empty())
            .ok_or(UnmarshalError::MissingUuid)?;

        let mut unmarshaled = Message::new(uuid.clone(), message.payload().clone());
        unmarshaled.metadata_mut().extend(
            headers
                .iter()
                .filter(|(key, _)| key.as_str() != UUID_HEADER)
                .map(|(key, value)| (key.clone(), value.clone())),
        );

        Ok(unmarshaled)
    }
}

/// Produces the header layout read by [`HeaderUnmarshaler`].
#[derive(Clone, Copy, Debug, Default)]
pub struct HeaderMarshaler;

impl HeaderMarshaler {
    /// Splits a message into payload and headers.
    #[must_use]
    pub fn marshal(message: &Message) -> (Bytes, HashMap<String, String>) {
        let mut headers: Metadata = message.metadata().clone();
        headers.insert(UUID_HEADER.to_string(), message.uuid().to_string());

        (message.payload().clone(), headers)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::broker::BrokerError;

    use assert_matches::assert_matches;
    use async_trait::async_trait;

    #[derive(Debug, Error)]
    #[error("test broker error")]
    struct TestError;

    impl BrokerError for TestError {}

    struct TestDelivery {
        headers: Option<HashMap<String, String>>,
        payload: Bytes,
    }

    #[async_trait]
    impl BrokerMessage for TestDelivery {
        type Error = TestError;

        fn payload(&self) -> &Bytes {
            &self.payload
        }

        fn headers(&self) -> Option<&HashMap<String, String>> {
            self.headers.as_ref()
        }

        fn sequence(&self) -> u64 {
            1
        }

        fn redelivered(&self) -> bool {
            false
        }

        async fn ack(&self) -> Result<(), Self::Error> {
            Ok(())
        }
    }

    #[test]
    fn test_marshal_then_unmarshal_keeps_uuid_and_metadata() {
        let message = Message::new("uuid-1", Bytes::from("hello")).with_metadata("source", "test");
        let (payload, headers) = HeaderMarshaler::marshal(&message);

        let delivery = TestDelivery {
            headers: Some(headers),
            payload,
        };
        let unmarshaled = HeaderUnmarshaler.unmarshal(&delivery).unwrap();

        assert_eq!(unmarshaled.uuid(), "uuid-1");
        assert_eq!(unmarshaled.payload(), &Bytes::from("hello"));
        assert_eq!(unmarshaled.metadata().len(), 1);
        assert_eq!(
            unmarshaled.metadata().get("source").map(String::as_str),
            Some("test")
        );
    }

    #[test]
    fn test_missing_uuid() {
        let delivery = TestDelivery {
            headers: Some(HashMap::from([(UUID_HEADER.to_string(), String::new())])),
            payload: Bytes::new(),
        };

        let error = HeaderUnmarshaler.unmarshal(&delivery).unwrap_err();

        assert_matches!(
            error.downcast_ref::<UnmarshalError>(),
            Some(UnmarshalError::MissingUuid)
        );
    }

    #[test]
    fn test_missing_headers() {
        let delivery = TestDelivery {
            headers: None,
            payload: Bytes::new(),
        };

        let error = HeaderUnmarshaler.unmarshal(&delivery).unwrap_err();

        assert_matches!(
            error.downcast_ref::<UnmarshalError>(),
            Some(UnmarshalError::MissingHeaders)
        );
    }
}
