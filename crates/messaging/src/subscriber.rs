use crate::message::Message;

use std::error::Error;
use std::fmt::Debug;
use std::pin::Pin;
use std::task::{Context, Poll, ready};

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};
use tokio_stream::Stream;
use tokio_util::sync::CancellationToken;

/// A message on its way to a reader.
///
/// The receiver returned by [`Handoff::new`] completes once a reader takes
/// the message, and fails if the handoff is dropped unread.
#[derive(Debug)]
pub struct Handoff {
    message: Message,
    taken: oneshot::Sender<()>,
}

impl Handoff {
    /// Wraps a message for handing over.
    #[must_use]
    pub fn new(message: Message) -> (Self, oneshot::Receiver<()>) {
        let (taken, receiver) = oneshot::channel();

        (Self { message, taken }, receiver)
    }
}

/// A read-only stream of messages produced by one `subscribe` call.
///
/// A message counts as delivered only once the stream yields it. Handoffs
/// withdrawn by their sender in the meantime are skipped.
#[derive(Debug)]
pub struct Messages {
    receiver: mpsc::Receiver<Handoff>,
}

impl Messages {
    /// Creates a stream reading handoffs from `receiver`.
    #[must_use]
    pub const fn new(receiver: mpsc::Receiver<Handoff>) -> Self {
        Self { receiver }
    }
}

impl Stream for Messages {
    type Item = Message;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Message>> {
        loop {
            let Some(Handoff { message, taken }) = ready!(self.receiver.poll_recv(cx)) else {
                return Poll::Ready(None);
            };

            if taken.send(()).is_ok() {
                return Poll::Ready(Some(message));
            }
        }
    }
}

/// Marker trait for subscriber errors
pub trait SubscriberError: Debug + Error + Send + Sync + 'static {}

/// A trait representing a subscriber of broker topics.
#[async_trait]
pub trait Subscriber
where
    Self: Send + Sync + 'static,
{
    /// The error type for the subscriber.
    type Error: SubscriberError;

    /// Subscribes to a topic.
    ///
    /// The returned stream ends when `scope` is cancelled or the subscriber is
    /// closed.
    async fn subscribe(
        &self,
        scope: CancellationToken,
        topic: &str,
    ) -> Result<Messages, Self::Error>;

    /// Provisions broker-side state for a topic without consuming anything.
    async fn subscribe_initialize(&self, topic: &str) -> Result<(), Self::Error>;

    /// Closes the subscriber. Calling it again is a no-op.
    async fn close(&self) -> Result<(), Self::Error>;
}
