use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::RwLock;
use proven_messaging::{Handoff, Message, Messages};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

/// Handoffs buffered ahead of the reader. A buffered message is not
/// delivered until the reader takes it.
pub const OUTPUT_CAPACITY: usize = 1;

/// The writing side of one `subscribe` call's output stream.
///
/// Every worker of the call writes through the same `Output`. Each holder
/// attaches before use and detaches when done; the last detach closes the
/// stream. Once closed, no further message is sent.
#[derive(Debug)]
pub struct Output {
    sender: RwLock<Option<mpsc::Sender<Handoff>>>,
    closed: CancellationToken,
    holders: AtomicUsize,
}

impl Output {
    /// Creates an output with the default capacity and the stream it feeds.
    #[must_use]
    pub fn new() -> (Arc<Self>, Messages) {
        Self::with_capacity(OUTPUT_CAPACITY)
    }

    /// Creates an output with the given capacity and the stream it feeds.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> (Arc<Self>, Messages) {
        let (sender, receiver) = mpsc::channel(capacity);

        let output = Self {
            sender: RwLock::new(Some(sender)),
            closed: CancellationToken::new(),
            holders: AtomicUsize::new(0),
        };

        (Arc::new(output), Messages::new(receiver))
    }

    /// Registers a holder.
    pub fn attach(&self) {
        self.holders.fetch_add(1, Ordering::AcqRel);
    }

    /// Releases a holder. Closes the stream if it was the last one.
    pub fn detach(&self) {
        if self.holders.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.close();
        }
    }

    /// Closes the stream. Returns `false` if it was already closed.
    pub fn close(&self) -> bool {
        let sender = self.sender.write().take();
        self.closed.cancel();

        sender.is_some()
    }

    /// Whether the stream has been closed.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Hands a message to the reader and waits until the reader has taken it.
    ///
    /// Returns `false` if `closing` fires or the stream is closed first. If
    /// the reader went away, holds on until one of those happens.
    pub async fn send(&self, message: Message, closing: &CancellationToken) -> bool {
        let Some(sender) = self.sender.read().clone() else {
            return false;
        };

        let permit = tokio::select! {
            biased;
            () = closing.cancelled() => return false,
            () = self.closed.cancelled() => return false,
            permit = sender.reserve() => permit,
        };

        let Ok(permit) = permit else {
            return self.hold(closing).await;
        };

        let (handoff, mut taken) = Handoff::new(message);

        // Commit under the read lock: a close either happened first or waits
        // for the handoff to be in.
        {
            let guard = self.sender.read();
            if guard.is_none() {
                return false;
            }
            permit.send(handoff);
        }

        tokio::select! {
            biased;
            result = &mut taken => match result {
                Ok(()) => true,
                Err(_) => self.hold(closing).await,
            },
            () = closing.cancelled() => withdraw(&mut taken),
            () = self.closed.cancelled() => withdraw(&mut taken),
        }
    }

    async fn hold(&self, closing: &CancellationToken) -> bool {
        tokio::select! {
            () = closing.cancelled() => {}
            () = self.closed.cancelled() => {}
        }

        false
    }
}

/// Stops the reader from taking a handoff. Returns whether it was taken
/// before that.
fn withdraw(taken: &mut oneshot::Receiver<()>) -> bool {
    taken.close();
    taken.try_recv().is_ok()
}
