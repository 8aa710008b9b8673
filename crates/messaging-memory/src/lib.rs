//! In-memory implementation of the broker contract, for local development
//! and tests.
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

mod error;
mod state;

/// Connections to the in-memory broker.
pub mod connection;

/// Deliveries made by the in-memory broker.
pub mod message;

/// Subscriptions on the in-memory broker.
pub mod subscription;

pub use connection::MemoryConnection;
pub use error::Error;
pub use message::MemoryBrokerMessage;
pub use state::AckRecord;
pub use subscription::MemorySubscription;

use state::{BrokerState, Redelivery};

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use proven_messaging::Message;
use proven_messaging::unmarshaler::HeaderMarshaler;
use tracing::trace;

/// An in-memory streaming broker.
///
/// Plain subscriptions each receive every message published on their topic.
/// Members of a queue group share one position on the topic and receive its
/// messages round-robin. In manual ack mode, messages that are not acked
/// within the subscription's ack wait are redelivered.
///
/// Publishing and subscribing must happen within a Tokio runtime.
#[derive(Clone, Debug)]
pub struct MemoryBroker {
    state: Arc<Mutex<BrokerState>>,
}

impl MemoryBroker {
    /// Creates a new broker serving the given cluster id.
    #[must_use]
    pub fn new<C>(cluster_id: C) -> Self
    where
        C: Into<String>,
    {
        Self {
            state: Arc::new(Mutex::new(BrokerState::new(cluster_id.into()))),
        }
    }

    /// Publishes a payload to a topic and returns its sequence number.
    pub fn publish<T>(&self, topic: T, payload: Bytes, headers: HashMap<String, String>) -> u64
    where
        T: AsRef<str>,
    {
        let (sequence, redeliveries) = self
            .state
            .lock()
            .publish(topic.as_ref(), payload, headers);

        trace!(topic = topic.as_ref(), sequence, "published message");

        self.schedule_redeliveries(redeliveries);

        sequence
    }

    /// Publishes a message in the layout read by
    /// [`HeaderUnmarshaler`](proven_messaging::unmarshaler::HeaderUnmarshaler).
    pub fn publish_message<T>(&self, topic: T, message: &Message) -> u64
    where
        T: AsRef<str>,
    {
        let (payload, headers) = HeaderMarshaler::marshal(message);
        self.publish(topic, payload, headers)
    }

    /// Every ack received so far, in order.
    #[must_use]
    pub fn acks(&self) -> Vec<AckRecord> {
        self.state.lock().acks.clone()
    }

    /// Number of acks received so far.
    #[must_use]
    pub fn ack_count(&self) -> usize {
        self.state.lock().acks.len()
    }

    /// Number of deliveries (including redeliveries) handed to each
    /// subscription's handler, per subscription id.
    #[must_use]
    pub fn delivery_counts(&self) -> HashMap<u64, usize> {
        self.state.lock().deliveries.clone()
    }

    /// Number of open subscriptions on a topic.
    #[must_use]
    pub fn active_subscriptions<T>(&self, topic: T) -> usize
    where
        T: AsRef<str>,
    {
        self.state.lock().active_members(topic.as_ref())
    }

    /// Number of times a connection close was requested.
    #[must_use]
    pub fn connection_closes(&self) -> usize {
        self.state.lock().connection_closes
    }

    /// Makes every subsequent connect fail.
    pub fn refuse_connections(&self, refuse: bool) {
        self.state.lock().faults.refuse_connections = refuse;
    }

    /// Lets the next `successes` subscribes succeed and fails every one after
    /// that. `None` removes the limit.
    pub fn fail_subscribes_after(&self, successes: Option<usize>) {
        self.state.lock().faults.subscribe_budget = successes;
    }

    /// Makes every subsequent ack fail.
    pub fn fail_acks(&self, fail: bool) {
        self.state.lock().faults.fail_acks = fail;
    }

    /// Makes every subsequent connection close report a failure.
    pub fn fail_connection_close(&self, fail: bool) {
        self.state.lock().faults.fail_connection_close = fail;
    }

    /// Delays every subsequent subscription close by `delay`.
    pub fn set_subscription_close_delay(&self, delay: Duration) {
        self.state.lock().faults.subscription_close_delay = delay;
    }

    fn schedule_redeliveries(&self, redeliveries: Vec<Redelivery>) {
        for redelivery in redeliveries {
            tokio::spawn(redeliver(Arc::downgrade(&self.state), redelivery));
        }
    }
}

async fn redeliver(state: Weak<Mutex<BrokerState>>, redelivery: Redelivery) {
    loop {
        tokio::time::sleep(redelivery.ack_wait).await;

        let Some(strong) = state.upgrade() else {
            break;
        };

        if !strong
            .lock()
            .redeliver(redelivery.consumer_id, redelivery.sequence)
        {
            break;
        }

        trace!(
            sequence = redelivery.sequence,
            "redelivered unacked message"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::collections::HashSet;

    use assert_matches::assert_matches;
    use async_trait::async_trait;
    use proven_messaging::broker::{
        BrokerConnection, BrokerConnector, BrokerMessage, BrokerSubscription, DeliveryHandler,
    };
    use proven_messaging::options::SubscriptionOption;
    use tokio::sync::mpsc;
    use tokio::time::timeout;
    use tracing_test::traced_test;

    const CLUSTER: &str = "test-cluster";

    #[derive(Clone)]
    struct RecordingHandler {
        sender: mpsc::UnboundedSender<MemoryBrokerMessage>,
        ack: bool,
    }

    #[async_trait]
    impl DeliveryHandler<MemoryBrokerMessage> for RecordingHandler {
        async fn handle(&self, message: MemoryBrokerMessage) {
            if self.ack {
                message.ack().await.unwrap();
            }
            let _ = self.sender.send(message);
        }
    }

    fn recording_handler(ack: bool) -> (RecordingHandler, mpsc::UnboundedReceiver<MemoryBrokerMessage>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (RecordingHandler { sender, ack }, receiver)
    }

    async fn next(
        receiver: &mut mpsc::UnboundedReceiver<MemoryBrokerMessage>,
    ) -> MemoryBrokerMessage {
        timeout(Duration::from_secs(1), receiver.recv())
            .await
            .expect("timed out waiting for delivery")
            .expect("delivery channel closed")
    }

    fn manual_ack(ack_wait: Duration) -> Vec<SubscriptionOption> {
        vec![
            SubscriptionOption::ManualAckMode,
            SubscriptionOption::AckWait(ack_wait),
        ]
    }

    #[tokio::test]
    async fn test_plain_subscriptions_fan_out() {
        let broker = MemoryBroker::new(CLUSTER);
        let connection = broker.connect(CLUSTER, "client", &[]).await.unwrap();

        let (first, mut first_rx) = recording_handler(false);
        let (second, mut second_rx) = recording_handler(false);
        let _first = connection.subscribe("orders", first, &[]).await.unwrap();
        let _second = connection.subscribe("orders", second, &[]).await.unwrap();

        broker.publish("orders", Bytes::from("one"), HashMap::new());

        assert_eq!(next(&mut first_rx).await.payload(), &Bytes::from("one"));
        assert_eq!(next(&mut second_rx).await.payload(), &Bytes::from("one"));

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(broker.ack_count(), 2);
    }

    #[tokio::test]
    async fn test_queue_group_round_robin() {
        let broker = MemoryBroker::new(CLUSTER);
        let connection = broker.connect(CLUSTER, "client", &[]).await.unwrap();

        let (handler, mut receiver) = recording_handler(true);
        let mut subscriptions = Vec::new();
        for _ in 0..3 {
            subscriptions.push(
                connection
                    .queue_subscribe("orders", "workers", handler.clone(), &[])
                    .await
                    .unwrap(),
            );
        }

        for i in 0..6 {
            broker.publish("orders", Bytes::from(format!("{i}")), HashMap::new());
        }

        let mut sequences = HashSet::new();
        for _ in 0..6 {
            sequences.insert(next(&mut receiver).await.sequence());
        }

        assert_eq!(sequences.len(), 6);
        assert_eq!(broker.delivery_counts().len(), 3);
        assert!(broker.delivery_counts().values().all(|count| *count == 2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unacked_messages_are_redelivered() {
        let broker = MemoryBroker::new(CLUSTER);
        let connection = broker.connect(CLUSTER, "client", &[]).await.unwrap();

        let (handler, mut receiver) = recording_handler(false);
        let _subscription = connection
            .subscribe("orders", handler, &manual_ack(Duration::from_secs(5)))
            .await
            .unwrap();

        broker.publish("orders", Bytes::from("one"), HashMap::new());

        let first = next(&mut receiver).await;
        assert!(!first.redelivered());

        tokio::time::sleep(Duration::from_secs(6)).await;

        let second = timeout(Duration::from_secs(1), receiver.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(second.redelivered());
        assert_eq!(second.sequence(), first.sequence());

        second.ack().await.unwrap();
        tokio::time::sleep(Duration::from_secs(6)).await;

        assert!(receiver.try_recv().is_err());
        assert_eq!(broker.ack_count(), 1);
    }

    #[tokio::test]
    async fn test_auto_ack_without_manual_mode() {
        let broker = MemoryBroker::new(CLUSTER);
        let connection = broker.connect(CLUSTER, "client", &[]).await.unwrap();

        let (handler, mut receiver) = recording_handler(false);
        let _subscription = connection.subscribe("orders", handler, &[]).await.unwrap();

        broker.publish("orders", Bytes::from("one"), HashMap::new());
        next(&mut receiver).await;

        // The auto ack is sent after the handler returns.
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(broker.ack_count(), 1);
    }

    #[tokio::test]
    async fn test_deliver_all_available_replays_history() {
        let broker = MemoryBroker::new(CLUSTER);
        broker.publish("orders", Bytes::from("one"), HashMap::new());
        broker.publish("orders", Bytes::from("two"), HashMap::new());

        let connection = broker.connect(CLUSTER, "client", &[]).await.unwrap();
        let (handler, mut receiver) = recording_handler(true);
        let _subscription = connection
            .subscribe("orders", handler, &[SubscriptionOption::DeliverAllAvailable])
            .await
            .unwrap();

        assert_eq!(next(&mut receiver).await.sequence(), 1);
        assert_eq!(next(&mut receiver).await.sequence(), 2);
    }

    #[traced_test]
    #[tokio::test]
    async fn test_durable_subscription_resumes_after_close() {
        let broker = MemoryBroker::new(CLUSTER);
        let connection = broker.connect(CLUSTER, "client", &[]).await.unwrap();

        let mut options = manual_ack(Duration::from_secs(30));
        options.push(SubscriptionOption::DurableName("durable".to_string()));

        let (handler, mut receiver) = recording_handler(false);
        let subscription = connection
            .subscribe("orders", handler, &options)
            .await
            .unwrap();

        broker.publish("orders", Bytes::from("one"), HashMap::new());
        broker.publish("orders", Bytes::from("two"), HashMap::new());

        next(&mut receiver).await.ack().await.unwrap();
        next(&mut receiver).await;
        subscription.close().await.unwrap();

        broker.publish("orders", Bytes::from("three"), HashMap::new());

        let (handler, mut receiver) = recording_handler(true);
        let _subscription = connection
            .subscribe("orders", handler, &options)
            .await
            .unwrap();

        assert_eq!(next(&mut receiver).await.sequence(), 2);
        assert_eq!(next(&mut receiver).await.sequence(), 3);
    }

    #[tokio::test]
    async fn test_connect_errors() {
        let broker = MemoryBroker::new(CLUSTER);

        assert_matches!(
            broker.connect("other-cluster", "client", &[]).await,
            Err(Error::UnknownCluster(_))
        );

        let connection = broker.connect(CLUSTER, "client", &[]).await.unwrap();
        assert_matches!(
            broker.connect(CLUSTER, "client", &[]).await,
            Err(Error::DuplicateClientId(_))
        );

        connection.close().await.unwrap();
        assert!(broker.connect(CLUSTER, "client", &[]).await.is_ok());

        broker.refuse_connections(true);
        assert_matches!(
            broker.connect(CLUSTER, "another", &[]).await,
            Err(Error::ConnectionRefused)
        );
    }

    #[tokio::test]
    async fn test_subscribe_budget() {
        let broker = MemoryBroker::new(CLUSTER);
        let connection = broker.connect(CLUSTER, "client", &[]).await.unwrap();
        broker.fail_subscribes_after(Some(1));

        let (handler, _receiver) = recording_handler(true);
        assert!(
            connection
                .subscribe("orders", handler.clone(), &[])
                .await
                .is_ok()
        );
        assert_matches!(
            connection.subscribe("orders", handler, &[]).await,
            Err(Error::Subscribe(_))
        );
    }

    #[tokio::test]
    async fn test_connection_close_closes_subscriptions() {
        let broker = MemoryBroker::new(CLUSTER);
        let connection = broker.connect(CLUSTER, "client", &[]).await.unwrap();

        let (handler, _receiver) = recording_handler(true);
        let _subscription = connection.subscribe("orders", handler.clone(), &[]).await.unwrap();
        assert_eq!(broker.active_subscriptions("orders"), 1);

        connection.close().await.unwrap();

        assert_eq!(broker.active_subscriptions("orders"), 0);
        assert_eq!(broker.connection_closes(), 1);
        assert_matches!(
            connection.subscribe("orders", handler, &[]).await,
            Err(Error::ConnectionClosed)
        );
    }
}
