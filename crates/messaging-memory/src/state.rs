use crate::error::Error;

use std::collections::{BTreeSet, HashMap, HashSet};
use std::time::{Duration, SystemTime};

use bytes::Bytes;
use proven_messaging::options::{StartPosition, SubscriptionSettings};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// A record of one ack received by the broker.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AckRecord {
    /// Topic the acked message was published on.
    pub topic: String,

    /// Sequence of the acked message on its topic.
    pub sequence: u64,

    /// Subscription that sent the ack.
    pub subscription_id: u64,
}

#[derive(Clone, Debug)]
pub struct StoredMessage {
    pub sequence: u64,
    pub payload: Bytes,
    pub headers: HashMap<String, String>,
    pub timestamp: SystemTime,
}

#[derive(Clone, Debug)]
pub struct Delivery {
    pub consumer_id: u64,
    pub subscription_id: u64,
    pub message: StoredMessage,
    pub redelivered: bool,
}

/// A delivery that must be retried if it is not acked within `ack_wait`.
#[derive(Clone, Copy, Debug)]
pub struct Redelivery {
    pub consumer_id: u64,
    pub sequence: u64,
    pub ack_wait: Duration,
}

/// What a new member needs to run its delivery loop.
#[derive(Debug)]
pub struct Opened {
    pub consumer_id: u64,
    pub subscription_id: u64,
    pub receiver: mpsc::UnboundedReceiver<Delivery>,
    pub stop: CancellationToken,
    pub manual_ack: bool,
}

#[derive(Debug, Default)]
pub struct Faults {
    pub refuse_connections: bool,
    pub subscribe_budget: Option<usize>,
    pub fail_acks: bool,
    pub fail_connection_close: bool,
    pub subscription_close_delay: Duration,
}

#[derive(Debug, Default)]
struct Topic {
    messages: Vec<StoredMessage>,
    last_sequence: u64,
}

impl Topic {
    fn start_sequence(&self, position: StartPosition) -> u64 {
        let next = self.last_sequence + 1;

        match position {
            StartPosition::NewOnly => next,
            StartPosition::All => 1,
            StartPosition::LastReceived => self.last_sequence.max(1),
            StartPosition::Sequence(sequence) => sequence.max(1),
            StartPosition::Time(time) => self
                .messages
                .iter()
                .find(|message| message.timestamp >= time)
                .map_or(next, |message| message.sequence),
        }
    }

    fn get(&self, sequence: u64) -> Option<&StoredMessage> {
        let index = usize::try_from(sequence.checked_sub(1)?).ok()?;
        self.messages.get(index)
    }

    fn since(&self, sequence: u64) -> impl Iterator<Item = &StoredMessage> {
        self.messages
            .iter()
            .filter(move |message| message.sequence >= sequence)
    }
}

#[derive(Clone, Debug, Hash, PartialEq, Eq)]
struct DurableKey {
    client_id: Option<String>,
    topic: String,
    queue_group: Option<String>,
    durable_name: String,
}

#[derive(Debug)]
struct Member {
    client_id: String,
    subscription_id: u64,
    sender: mpsc::UnboundedSender<Delivery>,
    stop: CancellationToken,
}

/// Broker-side state shared by all members of one subscription (a single
/// plain subscriber, or every member of a queue group).
#[derive(Debug)]
struct Consumer {
    topic: String,
    queue_group: Option<String>,
    durable: Option<DurableKey>,
    settings: SubscriptionSettings,
    members: Vec<Member>,
    next_member: usize,
    next_sequence: u64,
    pending: BTreeSet<u64>,
}

impl Consumer {
    fn resume_sequence(&self) -> u64 {
        self.pending
            .first()
            .copied()
            .unwrap_or(self.next_sequence)
    }
}

#[derive(Debug, Default)]
pub struct BrokerState {
    pub cluster_id: String,
    pub clients: HashSet<String>,
    pub acks: Vec<AckRecord>,
    pub deliveries: HashMap<u64, usize>,
    pub connection_closes: usize,
    pub faults: Faults,
    topics: HashMap<String, Topic>,
    consumers: HashMap<u64, Consumer>,
    durables: HashMap<DurableKey, u64>,
    next_id: u64,
}

impl BrokerState {
    pub fn new(cluster_id: String) -> Self {
        Self {
            cluster_id,
            ..Self::default()
        }
    }

    const fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    pub fn connect(&mut self, cluster_id: &str, client_id: &str) -> Result<(), Error> {
        if self.faults.refuse_connections {
            return Err(Error::ConnectionRefused);
        }

        if self.cluster_id != cluster_id {
            return Err(Error::UnknownCluster(cluster_id.to_string()));
        }

        if !self.clients.insert(client_id.to_string()) {
            return Err(Error::DuplicateClientId(client_id.to_string()));
        }

        Ok(())
    }

    /// Closes every member the client holds and forgets the client. The
    /// client is disconnected even when a close failure is injected.
    pub fn disconnect(&mut self, client_id: &str) -> Result<(), Error> {
        self.connection_closes += 1;
        self.close_client(client_id);

        if self.faults.fail_connection_close {
            return Err(Error::Close);
        }

        Ok(())
    }

    pub fn publish(
        &mut self,
        topic: &str,
        payload: Bytes,
        headers: HashMap<String, String>,
    ) -> (u64, Vec<Redelivery>) {
        let log = self.topics.entry(topic.to_string()).or_default();
        log.last_sequence += 1;

        let message = StoredMessage {
            sequence: log.last_sequence,
            payload,
            headers,
            timestamp: SystemTime::now(),
        };
        log.messages.push(message.clone());

        let consumer_ids: Vec<u64> = self
            .consumers
            .iter()
            .filter(|(_, consumer)| consumer.topic == topic)
            .map(|(id, _)| *id)
            .collect();

        let redeliveries = consumer_ids
            .into_iter()
            .filter_map(|consumer_id| self.dispatch(consumer_id, &message, false))
            .collect();

        (message.sequence, redeliveries)
    }

    pub fn open(
        &mut self,
        client_id: &str,
        topic: &str,
        queue_group: Option<&str>,
        settings: SubscriptionSettings,
    ) -> Result<(Opened, Vec<Redelivery>), Error> {
        if let Some(budget) = self.faults.subscribe_budget.as_mut() {
            if *budget == 0 {
                return Err(Error::Subscribe(topic.to_string()));
            }
            *budget -= 1;
        }

        if !self.clients.contains(client_id) {
            return Err(Error::ConnectionClosed);
        }

        let subscription_id = self.next_id();
        let (sender, receiver) = mpsc::unbounded_channel();
        let stop = CancellationToken::new();
        let member = Member {
            client_id: client_id.to_string(),
            subscription_id,
            sender,
            stop: stop.clone(),
        };

        if let Some(group) = queue_group {
            let existing = self.consumers.iter_mut().find(|(_, consumer)| {
                consumer.topic == topic && consumer.queue_group.as_deref() == Some(group)
            });

            if let Some((consumer_id, consumer)) = existing {
                consumer.members.push(member);

                let opened = Opened {
                    consumer_id: *consumer_id,
                    subscription_id,
                    receiver,
                    stop,
                    manual_ack: consumer.settings.manual_ack,
                };

                return Ok((opened, Vec::new()));
            }
        }

        let consumer_id = self.next_id();
        let durable = settings.durable_name.clone().map(|durable_name| DurableKey {
            client_id: queue_group.is_none().then(|| client_id.to_string()),
            topic: topic.to_string(),
            queue_group: queue_group.map(str::to_string),
            durable_name,
        });

        let log = self.topics.entry(topic.to_string()).or_default();
        let start = durable
            .as_ref()
            .and_then(|key| self.durables.remove(key))
            .unwrap_or_else(|| log.start_sequence(settings.start_position));
        let replay: Vec<StoredMessage> = log.since(start).cloned().collect();

        let manual_ack = settings.manual_ack;
        self.consumers.insert(
            consumer_id,
            Consumer {
                topic: topic.to_string(),
                queue_group: queue_group.map(str::to_string),
                durable,
                settings,
                members: vec![member],
                next_member: 0,
                next_sequence: start,
                pending: BTreeSet::new(),
            },
        );

        let redeliveries = replay
            .iter()
            .filter_map(|message| self.dispatch(consumer_id, message, false))
            .collect();

        let opened = Opened {
            consumer_id,
            subscription_id,
            receiver,
            stop,
            manual_ack,
        };

        Ok((opened, redeliveries))
    }

    /// Hands a message to the next member of a consumer, round-robin.
    fn dispatch(
        &mut self,
        consumer_id: u64,
        message: &StoredMessage,
        redelivered: bool,
    ) -> Option<Redelivery> {
        let consumer = self.consumers.get_mut(&consumer_id)?;
        let count = consumer.members.len();

        let mut delivered = false;
        for _ in 0..count {
            let index = consumer.next_member % count;
            consumer.next_member = (index + 1) % count;

            let member = &consumer.members[index];
            let delivery = Delivery {
                consumer_id,
                subscription_id: member.subscription_id,
                message: message.clone(),
                redelivered,
            };

            if member.sender.send(delivery).is_ok() {
                delivered = true;
                break;
            }
        }

        if !delivered {
            return None;
        }

        consumer.next_sequence = consumer.next_sequence.max(message.sequence + 1);

        if !consumer.settings.manual_ack {
            return None;
        }

        consumer.pending.insert(message.sequence);

        Some(Redelivery {
            consumer_id,
            sequence: message.sequence,
            ack_wait: consumer.settings.ack_wait,
        })
    }

    /// Redelivers a message that is still unacked. Returns whether the
    /// message is still pending and should be checked again.
    pub fn redeliver(&mut self, consumer_id: u64, sequence: u64) -> bool {
        let Some(consumer) = self.consumers.get(&consumer_id) else {
            return false;
        };

        if !consumer.pending.contains(&sequence) {
            return false;
        }

        let Some(message) = self
            .topics
            .get(&consumer.topic)
            .and_then(|log| log.get(sequence))
            .cloned()
        else {
            return false;
        };

        self.dispatch(consumer_id, &message, true);

        true
    }

    pub fn ack(
        &mut self,
        consumer_id: u64,
        subscription_id: u64,
        sequence: u64,
    ) -> Result<(), Error> {
        if self.faults.fail_acks {
            return Err(Error::Ack(sequence));
        }

        let consumer = self
            .consumers
            .get_mut(&consumer_id)
            .ok_or(Error::SubscriptionClosed)?;

        consumer.pending.remove(&sequence);
        self.acks.push(AckRecord {
            topic: consumer.topic.clone(),
            sequence,
            subscription_id,
        });

        Ok(())
    }

    pub fn close_member(&mut self, consumer_id: u64, subscription_id: u64) {
        let Some(consumer) = self.consumers.get_mut(&consumer_id) else {
            return;
        };

        consumer.members.retain(|member| {
            if member.subscription_id == subscription_id {
                member.stop.cancel();
                false
            } else {
                true
            }
        });
        consumer.next_member = 0;

        if consumer.members.is_empty() {
            self.remove_consumer(consumer_id);
        }
    }

    fn close_client(&mut self, client_id: &str) {
        let mut emptied = Vec::new();

        for (consumer_id, consumer) in &mut self.consumers {
            consumer.members.retain(|member| {
                if member.client_id == client_id {
                    member.stop.cancel();
                    false
                } else {
                    true
                }
            });
            consumer.next_member = 0;

            if consumer.members.is_empty() {
                emptied.push(*consumer_id);
            }
        }

        for consumer_id in emptied {
            self.remove_consumer(consumer_id);
        }

        self.clients.remove(client_id);
    }

    pub fn record_delivery(&mut self, subscription_id: u64) {
        *self.deliveries.entry(subscription_id).or_default() += 1;
    }

    pub fn active_members(&self, topic: &str) -> usize {
        self.consumers
            .values()
            .filter(|consumer| consumer.topic == topic)
            .map(|consumer| consumer.members.len())
            .sum()
    }

    fn remove_consumer(&mut self, consumer_id: u64) {
        if let Some(consumer) = self.consumers.remove(&consumer_id) {
            if let Some(key) = consumer.durable.clone() {
                self.durables.insert(key, consumer.resume_sequence());
            }
        }
    }
}
