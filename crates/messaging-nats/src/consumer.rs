use async_nats::jetstream::consumer::push::Config as PushConfig;
use async_nats::jetstream::consumer::{AckPolicy, DeliverPolicy};
use async_nats::jetstream::stream::Config as StreamConfig;
use proven_messaging::options::{StartPosition, SubscriptionSettings};
use time::OffsetDateTime;

/// `JetStream` names may only hold alphanumerics, `-` and `_`.
fn sanitize(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

/// Name of the stream backing a topic within a cluster.
pub fn stream_name(cluster_id: &str, topic: &str) -> String {
    sanitize(&format!("{cluster_id}_{topic}"))
}

pub fn stream_config(cluster_id: &str, topic: &str) -> StreamConfig {
    StreamConfig {
        name: stream_name(cluster_id, topic),
        subjects: vec![topic.to_string()],
        ..Default::default()
    }
}

/// Name under which the broker tracks a consumer, if it is shared or kept
/// across restarts.
///
/// Queue group members share one consumer. Plain durables are scoped to the
/// client id.
pub fn durable_name(
    client_id: &str,
    queue_group: Option<&str>,
    durable_name: Option<&str>,
) -> Option<String> {
    match (queue_group, durable_name) {
        (Some(group), Some(durable)) => Some(sanitize(&format!("{group}_{durable}"))),
        (Some(group), None) => Some(sanitize(group)),
        (None, Some(durable)) => Some(sanitize(&format!("{client_id}_{durable}"))),
        (None, None) => None,
    }
}

pub fn deliver_policy(start_position: StartPosition) -> DeliverPolicy {
    match start_position {
        StartPosition::NewOnly => DeliverPolicy::New,
        StartPosition::All => DeliverPolicy::All,
        StartPosition::LastReceived => DeliverPolicy::Last,
        StartPosition::Sequence(start_sequence) => DeliverPolicy::ByStartSequence { start_sequence },
        StartPosition::Time(time) => DeliverPolicy::ByStartTime {
            start_time: OffsetDateTime::from(time),
        },
    }
}

pub fn consumer_config(
    deliver_subject: String,
    client_id: &str,
    queue_group: Option<&str>,
    settings: &SubscriptionSettings,
) -> PushConfig {
    PushConfig {
        deliver_subject,
        deliver_group: queue_group.map(str::to_string),
        durable_name: durable_name(client_id, queue_group, settings.durable_name.as_deref()),
        ack_policy: AckPolicy::Explicit,
        ack_wait: settings.ack_wait,
        max_ack_pending: i64::try_from(settings.max_inflight).unwrap_or(i64::MAX),
        deliver_policy: deliver_policy(settings.start_position),
        ..Default::default()
    }
}
