use crate::options::{ConnectionOption, SubscriptionOption};

use std::collections::HashMap;
use std::error::Error;
use std::fmt::Debug;

use async_trait::async_trait;
use bytes::Bytes;

/// Marker trait for broker errors
pub trait BrokerError: Debug + Error + Send + Sync + 'static {}

/// A single delivery from the broker.
#[async_trait]
pub trait BrokerMessage
where
    Self: Send + Sync + 'static,
{
    /// The error type for acks.
    type Error: BrokerError;

    /// The raw payload.
    fn payload(&self) -> &Bytes;

    /// The headers attached to the delivery, if any.
    fn headers(&self) -> Option<&HashMap<String, String>>;

    /// The broker-assigned sequence number on the topic.
    fn sequence(&self) -> u64;

    /// Whether the broker has delivered this message before.
    fn redelivered(&self) -> bool;

    /// Acknowledges the delivery to the broker.
    async fn ack(&self) -> Result<(), Self::Error>;
}

/// Handles deliveries for one broker subscription.
///
/// Brokers call `handle` for one delivery at a time per subscription and do
/// not deliver the next message until it returns.
#[async_trait]
pub trait DeliveryHandler<M>
where
    Self: Send + Sync + 'static,
    M: BrokerMessage,
{
    /// Handles a single delivery.
    async fn handle(&self, message: M);
}

/// An open subscription on a broker connection.
#[async_trait]
pub trait BrokerSubscription
where
    Self: Debug + Send + Sync + Sized + 'static,
{
    /// The error type for the subscription.
    type Error: BrokerError;

    /// Closes the subscription. Durable state is kept on the broker.
    async fn close(self) -> Result<(), Self::Error>;
}

/// An open connection to a broker.
#[async_trait]
pub trait BrokerConnection
where
    Self: Send + Sync + 'static,
{
    /// The error type for the connection.
    type Error: BrokerError;

    /// The message type delivered by this connection.
    type Message: BrokerMessage;

    /// The subscription type returned by this connection.
    type Subscription: BrokerSubscription;

    /// Subscribes to a topic. Every subscription receives every message.
    async fn subscribe<H>(
        &self,
        topic: &str,
        handler: H,
        options: &[SubscriptionOption],
    ) -> Result<Self::Subscription, Self::Error>
    where
        H: DeliveryHandler<Self::Message>;

    /// Subscribes to a topic as a member of a queue group. Each message is
    /// delivered to one member of the group.
    async fn queue_subscribe<H>(
        &self,
        topic: &str,
        queue_group: &str,
        handler: H,
        options: &[SubscriptionOption],
    ) -> Result<Self::Subscription, Self::Error>
    where
        H: DeliveryHandler<Self::Message>;

    /// Closes the connection.
    async fn close(&self) -> Result<(), Self::Error>;
}

/// Opens connections to a broker.
#[async_trait]
pub trait BrokerConnector
where
    Self: Send + Sync + 'static,
{
    /// The error type for connecting.
    type Error: BrokerError;

    /// The connection type.
    type Connection: BrokerConnection;

    /// Connects to the broker cluster as the given client.
    async fn connect(
        &self,
        cluster_id: &str,
        client_id: &str,
        options: &[ConnectionOption],
    ) -> Result<Self::Connection, Self::Error>;
}
