use crate::output::Output;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use proven_messaging::broker::BrokerSubscription;
use tokio::time::{Instant, timeout_at};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, warn};

#[derive(Debug)]
struct Registry<S> {
    closed: bool,
    next_id: u64,
    subscriptions: HashMap<u64, S>,
}

/// Owns every open worker subscription and tears them down on close.
///
/// The closed flag and the subscription table change under one lock, and
/// the closing signal fires under that same lock, exactly once.
#[derive(Debug)]
pub struct ShutdownCoordinator<S>
where
    S: BrokerSubscription,
{
    registry: Arc<Mutex<Registry<S>>>,
    closing: CancellationToken,
    watchers: TaskTracker,
    close_timeout: Duration,
}

impl<S> ShutdownCoordinator<S>
where
    S: BrokerSubscription,
{
    /// Creates a coordinator that waits up to `close_timeout` for watchers.
    #[must_use]
    pub fn new(close_timeout: Duration) -> Self {
        Self {
            registry: Arc::new(Mutex::new(Registry {
                closed: false,
                next_id: 0,
                subscriptions: HashMap::new(),
            })),
            closing: CancellationToken::new(),
            watchers: TaskTracker::new(),
            close_timeout,
        }
    }

    /// The closing signal.
    #[must_use]
    pub const fn closing(&self) -> &CancellationToken {
        &self.closing
    }

    /// Whether `close` has started.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.registry.lock().closed
    }

    /// Takes ownership of a worker subscription.
    ///
    /// # Errors
    ///
    /// Hands the subscription back if the coordinator is already closed.
    pub fn register(&self, subscription: S) -> Result<u64, S> {
        let mut registry = self.registry.lock();
        if registry.closed {
            return Err(subscription);
        }

        registry.next_id += 1;
        let id = registry.next_id;
        registry.subscriptions.insert(id, subscription);

        Ok(id)
    }

    /// Spawns the watcher of a registered subscription.
    ///
    /// The watcher holds `output` open until the closing signal fires or
    /// `scope` is cancelled, then closes the subscription and releases the
    /// output.
    pub fn watch(
        &self,
        id: u64,
        scope: CancellationToken,
        output: Arc<Output>,
        topic: String,
        subscriber_num: usize,
    ) {
        let registry = Arc::clone(&self.registry);
        let closing = self.closing.clone();

        output.attach();

        self.watchers.spawn(async move {
            tokio::select! {
                () = closing.cancelled() => {}
                () = scope.cancelled() => {}
            }

            let subscription = registry.lock().subscriptions.remove(&id);
            if let Some(subscription) = subscription {
                if let Err(error) = subscription.close().await {
                    error!(%topic, subscriber_num, %error, "cannot close subscription");
                }
            }

            output.detach();

            debug!(%topic, subscriber_num, "subscriber stopped");
        });
    }

    /// Fires the closing signal, then waits for every watcher and closes any
    /// subscription still registered, all within the close timeout.
    ///
    /// Closes still running at the deadline are left to finish in the
    /// background. Returns `false` without doing anything if close already
    /// started.
    pub async fn close(&self) -> bool {
        if !self.start_closing() {
            return false;
        }

        let deadline = Instant::now() + self.close_timeout;

        self.watchers.close();
        if timeout_at(deadline, self.watchers.wait()).await.is_err() {
            warn!(
                close_timeout = ?self.close_timeout,
                "subscribers did not stop within close timeout"
            );
        }

        let leftovers = self.drain();
        if leftovers.is_empty() {
            return true;
        }

        for (id, subscription) in leftovers {
            self.watchers.spawn(async move {
                if let Err(error) = subscription.close().await {
                    error!(subscription_id = id, %error, "cannot close leftover subscription");
                }
            });
        }

        if timeout_at(deadline, self.watchers.wait()).await.is_err() {
            warn!(
                close_timeout = ?self.close_timeout,
                "leftover subscriptions still closing after close timeout"
            );
        }

        true
    }

    fn start_closing(&self) -> bool {
        let mut registry = self.registry.lock();
        if registry.closed {
            return false;
        }

        registry.closed = true;
        self.closing.cancel();

        true
    }

    fn drain(&self) -> Vec<(u64, S)> {
        self.registry.lock().subscriptions.drain().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use proven_messaging::broker::BrokerError;
    use thiserror::Error;
    use tokio_stream::StreamExt;

    #[derive(Debug, Error)]
    #[error("close refused")]
    struct CloseRefused;

    impl BrokerError for CloseRefused {}

    #[derive(Debug)]
    struct TestSubscription {
        closes: Arc<AtomicUsize>,
        delay: Duration,
    }

    #[async_trait]
    impl BrokerSubscription for TestSubscription {
        type Error = CloseRefused;

        async fn close(self) -> Result<(), Self::Error> {
            tokio::time::sleep(self.delay).await;
            self.closes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn subscription(closes: &Arc<AtomicUsize>, delay: Duration) -> TestSubscription {
        TestSubscription {
            closes: Arc::clone(closes),
            delay,
        }
    }

    #[tokio::test]
    async fn test_close_runs_once() {
        let coordinator = ShutdownCoordinator::new(Duration::from_secs(1));
        let closes = Arc::new(AtomicUsize::new(0));
        let (output, mut messages) = Output::new();

        let id = coordinator
            .register(subscription(&closes, Duration::ZERO))
            .unwrap();
        coordinator.watch(id, CancellationToken::new(), output, "orders".to_string(), 0);

        assert!(coordinator.close().await);
        assert!(!coordinator.close().await);

        assert!(coordinator.closing().is_cancelled());
        assert_eq!(closes.load(Ordering::SeqCst), 1);
        assert!(messages.next().await.is_none());
    }

    #[tokio::test]
    async fn test_register_after_close_hands_back() {
        let coordinator = ShutdownCoordinator::new(Duration::from_secs(1));
        let closes = Arc::new(AtomicUsize::new(0));

        coordinator.close().await;

        assert!(coordinator.is_closed());
        assert!(
            coordinator
                .register(subscription(&closes, Duration::ZERO))
                .is_err()
        );
    }

    #[tokio::test]
    async fn test_scope_cancellation_stops_only_its_watchers() {
        let coordinator = ShutdownCoordinator::new(Duration::from_secs(1));
        let closes = Arc::new(AtomicUsize::new(0));

        let (first_output, mut first_messages) = Output::new();
        let first_scope = CancellationToken::new();
        let id = coordinator
            .register(subscription(&closes, Duration::ZERO))
            .unwrap();
        coordinator.watch(id, first_scope.clone(), first_output, "orders".to_string(), 0);

        let (second_output, _second_messages) = Output::new();
        let id = coordinator
            .register(subscription(&closes, Duration::ZERO))
            .unwrap();
        coordinator.watch(
            id,
            CancellationToken::new(),
            Arc::clone(&second_output),
            "orders".to_string(),
            0,
        );

        first_scope.cancel();

        assert!(first_messages.next().await.is_none());
        assert_eq!(closes.load(Ordering::SeqCst), 1);
        assert!(!second_output.is_closed());
        assert!(!coordinator.is_closed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_is_bounded_by_timeout() {
        let coordinator = ShutdownCoordinator::new(Duration::from_secs(1));
        let closes = Arc::new(AtomicUsize::new(0));
        let (output, _messages) = Output::new();

        let id = coordinator
            .register(subscription(&closes, Duration::from_secs(60)))
            .unwrap();
        coordinator.watch(id, CancellationToken::new(), output, "orders".to_string(), 0);

        let started = tokio::time::Instant::now();
        assert!(coordinator.close().await);

        assert!(started.elapsed() < Duration::from_secs(2));
        assert_eq!(closes.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_close_closes_unwatched_subscriptions() {
        let coordinator = ShutdownCoordinator::new(Duration::from_secs(1));
        let closes = Arc::new(AtomicUsize::new(0));

        coordinator
            .register(subscription(&closes, Duration::ZERO))
            .unwrap();

        assert!(coordinator.close().await);
        assert_eq!(closes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_unwatched_close_is_bounded() {
        let coordinator = ShutdownCoordinator::new(Duration::from_secs(1));
        let closes = Arc::new(AtomicUsize::new(0));

        coordinator
            .register(subscription(&closes, Duration::from_secs(60)))
            .unwrap();

        let started = tokio::time::Instant::now();
        assert!(coordinator.close().await);

        assert!(started.elapsed() <= Duration::from_secs(1));
        assert_eq!(closes.load(Ordering::SeqCst), 0);

        // The close keeps running in the background.
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(closes.load(Ordering::SeqCst), 1);
    }
}
