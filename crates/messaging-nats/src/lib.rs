//! NATS `JetStream` implementation of the broker contract.
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

mod consumer;
mod error;

/// Connections to a NATS server.
pub mod connection;

/// Deliveries from `JetStream` push consumers.
pub mod message;

/// Subscriptions backed by `JetStream` push consumers.
pub mod subscription;

pub use connection::NatsConnection;
pub use consumer::stream_name;
pub use error::Error;
pub use message::NatsBrokerMessage;
pub use subscription::NatsSubscription;

use async_nats::{ConnectOptions, ServerAddr};
use async_trait::async_trait;
use proven_messaging::broker::BrokerConnector;
use proven_messaging::options::ConnectionOption;
use tracing::info;

/// Server used when no `ConnectionOption::Url` is given.
pub const DEFAULT_URL: &str = "nats://localhost:4222";

/// Opens connections to NATS.
///
/// The cluster id names the `JetStream` streams provisioned for each topic,
/// so subscribers in different clusters never share state on one server.
#[derive(Clone, Debug)]
pub struct NatsConnector {
    default_url: String,
}

impl NatsConnector {
    /// Creates a connector falling back to `default_url` when no URL option
    /// is given.
    #[must_use]
    pub fn new<U>(default_url: U) -> Self
    where
        U: Into<String>,
    {
        Self {
            default_url: default_url.into(),
        }
    }

    fn server_addrs(&self, options: &[ConnectionOption]) -> Result<Vec<ServerAddr>, Error> {
        let mut urls: Vec<&str> = options
            .iter()
            .filter_map(|option| match option {
                ConnectionOption::Url(url) => Some(url.as_str()),
                _ => None,
            })
            .collect();

        if urls.is_empty() {
            urls.push(self.default_url.as_str());
        }

        urls.into_iter()
            .map(|url| {
                url.parse::<ServerAddr>().map_err(|source| Error::Address {
                    url: url.to_string(),
                    source,
                })
            })
            .collect()
    }
}

impl Default for NatsConnector {
    fn default() -> Self {
        Self::new(DEFAULT_URL)
    }
}

fn connect_options(client_id: &str, options: &[ConnectionOption]) -> ConnectOptions {
    options.iter().fold(
        ConnectOptions::new().name(client_id),
        |connect_options, option| match option {
            ConnectionOption::Url(_) => connect_options,
            ConnectionOption::Name(name) => connect_options.name(name),
            ConnectionOption::ConnectTimeout(timeout) => {
                connect_options.connection_timeout(*timeout)
            }
            ConnectionOption::PingInterval(interval) => connect_options.ping_interval(*interval),
            ConnectionOption::MaxReconnects(max) => connect_options.max_reconnects(*max),
            ConnectionOption::UserAndPassword(user, password) => {
                connect_options.user_and_password(user.clone(), password.clone())
            }
            ConnectionOption::Token(token) => connect_options.token(token.clone()),
        },
    )
}

#[async_trait]
impl BrokerConnector for NatsConnector {
    type Error = Error;
    type Connection = NatsConnection;

    async fn connect(
        &self,
        cluster_id: &str,
        client_id: &str,
        options: &[ConnectionOption],
    ) -> Result<Self::Connection, Self::Error> {
        let servers = self.server_addrs(options)?;

        let client = connect_options(client_id, options)
            .connect(servers.as_slice())
            .await?;

        info!(cluster_id, client_id, "connected to NATS");

        Ok(NatsConnection::new(client, cluster_id, client_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::time::Duration;

    use assert_matches::assert_matches;
    use bytes::Bytes;
    use proven_messaging::broker::{
        BrokerConnection, BrokerMessage, BrokerSubscription, DeliveryHandler,
    };
    use proven_messaging::options::SubscriptionOption;
    use tokio::sync::mpsc;
    use tokio::time::timeout;
    use uuid::Uuid;

    #[test]
    fn test_server_addrs_default() {
        let connector = NatsConnector::default();

        let servers = connector.server_addrs(&[]).unwrap();

        assert_eq!(servers.len(), 1);
        assert_eq!(servers[0].host(), "localhost");
        assert_eq!(servers[0].port(), 4222);
    }

    #[test]
    fn test_server_addrs_from_options() {
        let connector = NatsConnector::default();

        let servers = connector
            .server_addrs(&[
                ConnectionOption::Name("ignored".to_string()),
                ConnectionOption::Url("nats://one:4222".to_string()),
                ConnectionOption::Url("nats://two:5222".to_string()),
            ])
            .unwrap();

        assert_eq!(servers.len(), 2);
        assert_eq!(servers[1].host(), "two");
        assert_eq!(servers[1].port(), 5222);
    }

    #[test]
    fn test_invalid_server_addr() {
        let connector = NatsConnector::default();

        let result =
            connector.server_addrs(&[ConnectionOption::Url("nats://:not-a-port".to_string())]);

        assert_matches!(result, Err(Error::Address { .. }));
    }

    struct ForwardingHandler {
        sender: mpsc::UnboundedSender<NatsBrokerMessage>,
    }

    #[async_trait]
    impl DeliveryHandler<NatsBrokerMessage> for ForwardingHandler {
        async fn handle(&self, message: NatsBrokerMessage) {
            let _ = self.sender.send(message);
        }
    }

    fn nats_url() -> String {
        std::env::var("NATS_URL").unwrap_or_else(|_| DEFAULT_URL.to_string())
    }

    #[tokio::test]
    #[ignore = "requires a NATS server with JetStream"]
    async fn test_subscribe_receives_and_acks() {
        let cluster_id = format!("test_{}", Uuid::new_v4().simple());
        let topic = format!("test.{}", Uuid::new_v4().simple());

        let connection = NatsConnector::default()
            .connect(
                &cluster_id,
                "test-client",
                &[ConnectionOption::Url(nats_url())],
            )
            .await
            .expect("Failed to connect to NATS for tests");

        let (sender, mut receiver) = mpsc::unbounded_channel();
        let subscription = connection
            .subscribe(
                &topic,
                ForwardingHandler { sender },
                &[
                    SubscriptionOption::ManualAckMode,
                    SubscriptionOption::AckWait(Duration::from_secs(5)),
                ],
            )
            .await
            .unwrap();

        let mut headers = async_nats::HeaderMap::new();
        headers.insert("Message-Uuid", "uuid-1");
        async_nats::jetstream::new(connection.client().clone())
            .publish_with_headers(topic.clone(), headers, Bytes::from("hello"))
            .await
            .unwrap()
            .await
            .unwrap();

        let message = timeout(Duration::from_secs(5), receiver.recv())
            .await
            .unwrap()
            .unwrap();

        assert_eq!(message.payload(), &Bytes::from("hello"));
        assert_eq!(
            message
                .headers()
                .and_then(|headers| headers.get("Message-Uuid").cloned()),
            Some("uuid-1".to_string())
        );
        assert_eq!(message.sequence(), 1);
        assert!(!message.redelivered());
        message.ack().await.unwrap();

        subscription.close().await.unwrap();
        connection.close().await.unwrap();

        async_nats::jetstream::new(connection.client().clone())
            .delete_stream(stream_name(&cluster_id, &topic))
            .await
            .unwrap();
    }

    #[tokio::test]
    #[ignore = "requires a NATS server with JetStream"]
    async fn test_queue_group_members_share_deliveries() {
        let cluster_id = format!("test_{}", Uuid::new_v4().simple());
        let topic = format!("test.{}", Uuid::new_v4().simple());

        let connection = NatsConnector::default()
            .connect(
                &cluster_id,
                "test-client",
                &[ConnectionOption::Url(nats_url())],
            )
            .await
            .expect("Failed to connect to NATS for tests");

        let options = [SubscriptionOption::ManualAckMode];
        let (sender, mut receiver) = mpsc::unbounded_channel();
        let first = connection
            .queue_subscribe(
                &topic,
                "workers",
                ForwardingHandler {
                    sender: sender.clone(),
                },
                &options,
            )
            .await
            .unwrap();
        let second = connection
            .queue_subscribe(&topic, "workers", ForwardingHandler { sender }, &options)
            .await
            .unwrap();

        let jetstream = async_nats::jetstream::new(connection.client().clone());
        for i in 0..4 {
            jetstream
                .publish(topic.clone(), Bytes::from(format!("{i}")))
                .await
                .unwrap()
                .await
                .unwrap();
        }

        let mut sequences = Vec::new();
        for _ in 0..4 {
            let message = timeout(Duration::from_secs(5), receiver.recv())
                .await
                .unwrap()
                .unwrap();
            sequences.push(message.sequence());
            message.ack().await.unwrap();
        }
        sequences.sort_unstable();
        assert_eq!(sequences, vec![1, 2, 3, 4]);

        first.close().await.unwrap();
        second.close().await.unwrap();
        connection.close().await.unwrap();

        jetstream
            .delete_stream(stream_name(&cluster_id, &topic))
            .await
            .unwrap();
    }
}
