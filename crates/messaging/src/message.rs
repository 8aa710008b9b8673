use std::collections::HashMap;
use std::future::pending;
use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Free-form string metadata carried alongside a payload.
pub type Metadata = HashMap<String, String>;

/// How (and whether) a message has been resolved by its consumer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Resolution {
    /// Neither acked nor nacked yet.
    Pending,

    /// The consumer processed the message successfully.
    Acked,

    /// The consumer rejected the message.
    Nacked,
}

/// A message delivered to application code.
///
/// Clones share the same resolution: acking any clone acks all of them. Use
/// [`Message::copy`] for an independent, unresolved message.
#[derive(Clone, Debug)]
pub struct Message {
    uuid: String,
    metadata: Metadata,
    payload: Bytes,
    resolution: Arc<watch::Sender<Resolution>>,
    context: CancellationToken,
}

impl Message {
    /// Creates a new, unresolved message.
    pub fn new<U>(uuid: U, payload: Bytes) -> Self
    where
        U: Into<String>,
    {
        let (resolution, _) = watch::channel(Resolution::Pending);

        Self {
            uuid: uuid.into(),
            metadata: Metadata::new(),
            payload,
            resolution: Arc::new(resolution),
            context: CancellationToken::new(),
        }
    }

    /// Creates a new message with a random v4 uuid.
    #[must_use]
    pub fn with_random_uuid(payload: Bytes) -> Self {
        Self::new(Uuid::new_v4().to_string(), payload)
    }

    /// The unique identifier of the message.
    #[must_use]
    pub fn uuid(&self) -> &str {
        &self.uuid
    }

    /// The payload of the message.
    #[must_use]
    pub const fn payload(&self) -> &Bytes {
        &self.payload
    }

    /// The metadata of the message.
    #[must_use]
    pub const fn metadata(&self) -> &Metadata {
        &self.metadata
    }

    /// Mutable access to the metadata of the message.
    pub const fn metadata_mut(&mut self) -> &mut Metadata {
        &mut self.metadata
    }

    /// Returns the message with `key` set to `value` in its metadata.
    #[must_use]
    pub fn with_metadata<K, V>(mut self, key: K, value: V) -> Self
    where
        K: Into<String>,
        V: Into<String>,
    {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// The execution scope attached to the message.
    ///
    /// Subscribers cancel it once the message has been resolved, timed out or
    /// abandoned.
    #[must_use]
    pub const fn context(&self) -> &CancellationToken {
        &self.context
    }

    /// Replaces the execution scope attached to the message.
    pub fn set_context(&mut self, context: CancellationToken) {
        self.context = context;
    }

    /// Acknowledges the message.
    ///
    /// Returns `false` if the message was already nacked, in which case the
    /// nack stands. Acking twice is harmless.
    pub fn ack(&self) -> bool {
        self.resolve(Resolution::Acked)
    }

    /// Negatively acknowledges the message.
    ///
    /// Returns `false` if the message was already acked, in which case the
    /// ack stands. Nacking twice is harmless.
    pub fn nack(&self) -> bool {
        self.resolve(Resolution::Nacked)
    }

    /// The current resolution of the message.
    #[must_use]
    pub fn resolution(&self) -> Resolution {
        *self.resolution.borrow()
    }

    /// Completes once the message has been acked.
    ///
    /// Never completes if the message is nacked instead.
    pub async fn acked(&self) {
        self.wait_for(Resolution::Acked).await;
    }

    /// Completes once the message has been nacked.
    ///
    /// Never completes if the message is acked instead.
    pub async fn nacked(&self) {
        self.wait_for(Resolution::Nacked).await;
    }

    /// Completes with the resolution once the message is acked or nacked.
    pub async fn resolved(&self) -> Resolution {
        let mut receiver = self.resolution.subscribe();

        match receiver
            .wait_for(|state| *state != Resolution::Pending)
            .await
        {
            Ok(state) => *state,
            Err(_) => pending().await,
        }
    }

    /// Returns an unresolved copy of the message with a fresh execution scope.
    #[must_use]
    pub fn copy(&self) -> Self {
        let mut message = Self::new(self.uuid.clone(), self.payload.clone());
        message.metadata.clone_from(&self.metadata);
        message
    }

    fn resolve(&self, target: Resolution) -> bool {
        let mut accepted = false;

        self.resolution.send_if_modified(|state| {
            if *state == Resolution::Pending {
                *state = target;
                accepted = true;
                true
            } else {
                accepted = *state == target;
                false
            }
        });

        accepted
    }

    async fn wait_for(&self, target: Resolution) {
        let mut receiver = self.resolution.subscribe();

        if receiver.wait_for(|state| *state == target).await.is_err() {
            pending::<()>().await;
        }
    }
}
