use std::time::{Duration, SystemTime};

/// Default time a broker waits for an ack before redelivering.
pub const DEFAULT_ACK_WAIT: Duration = Duration::from_secs(30);

/// Default number of unacknowledged messages a subscription may hold.
pub const DEFAULT_MAX_INFLIGHT: usize = 1024;

/// Options applied when connecting to a broker.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ConnectionOption {
    /// Server URL (may be given more than once).
    Url(String),

    /// Connection name reported to the server.
    Name(String),

    /// Timeout for establishing the connection.
    ConnectTimeout(Duration),

    /// Interval between pings to the server.
    PingInterval(Duration),

    /// Maximum number of reconnect attempts.
    MaxReconnects(usize),

    /// User/password authentication.
    UserAndPassword(String, String),

    /// Token authentication.
    Token(String),
}

/// Options applied when subscribing to a topic.
///
/// Options are applied in order, so later options override earlier ones.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SubscriptionOption {
    /// Messages must be acked explicitly by the client.
    ManualAckMode,

    /// How long the broker waits for an ack before redelivering.
    AckWait(Duration),

    /// Durable name so the broker tracks the subscription across restarts.
    DurableName(String),

    /// Maximum number of unacknowledged messages in flight.
    MaxInflight(usize),

    /// Start with all messages available on the topic.
    DeliverAllAvailable,

    /// Start with the last message stored on the topic.
    StartWithLastReceived,

    /// Start at the given sequence number.
    StartAtSequence(u64),

    /// Start with messages stored at or after the given time.
    StartAtTime(SystemTime),

    /// Start with messages stored within the given time before now.
    StartAtTimeDelta(Duration),
}

/// Where a new subscription starts reading a topic.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum StartPosition {
    /// Only messages published after subscribing.
    #[default]
    NewOnly,

    /// Every message available.
    All,

    /// The last stored message and everything after it.
    LastReceived,

    /// The given sequence and everything after it.
    Sequence(u64),

    /// Messages stored at or after the given time.
    Time(SystemTime),
}

/// Subscription options folded into concrete settings.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SubscriptionSettings {
    /// How long the broker waits for an ack before redelivering.
    pub ack_wait: Duration,

    /// Durable name, if any.
    pub durable_name: Option<String>,

    /// Whether acks are sent by the client instead of automatically.
    pub manual_ack: bool,

    /// Maximum number of unacknowledged messages in flight.
    pub max_inflight: usize,

    /// Where the subscription starts reading.
    pub start_position: StartPosition,
}

impl Default for SubscriptionSettings {
    fn default() -> Self {
        Self {
            ack_wait: DEFAULT_ACK_WAIT,
            durable_name: None,
            manual_ack: false,
            max_inflight: DEFAULT_MAX_INFLIGHT,
            start_position: StartPosition::NewOnly,
        }
    }
}

impl SubscriptionSettings {
    /// Folds options into settings, starting from the defaults.
    #[must_use]
    pub fn from_options(options: &[SubscriptionOption]) -> Self {
        let mut settings = Self::default();

        for option in options {
            match option {
                SubscriptionOption::ManualAckMode => settings.manual_ack = true,
                SubscriptionOption::AckWait(ack_wait) => settings.ack_wait = *ack_wait,
                SubscriptionOption::DurableName(name) => {
                    settings.durable_name = Some(name.clone());
                }
                SubscriptionOption::MaxInflight(max) => settings.max_inflight = *max,
                SubscriptionOption::DeliverAllAvailable => {
                    settings.start_position = StartPosition::All;
                }
                SubscriptionOption::StartWithLastReceived => {
                    settings.start_position = StartPosition::LastReceived;
                }
                SubscriptionOption::StartAtSequence(sequence) => {
                    settings.start_position = StartPosition::Sequence(*sequence);
                }
                SubscriptionOption::StartAtTime(time) => {
                    settings.start_position = StartPosition::Time(*time);
                }
                SubscriptionOption::StartAtTimeDelta(delta) => {
                    let time = SystemTime::now()
                        .checked_sub(*delta)
                        .unwrap_or(SystemTime::UNIX_EPOCH);
                    settings.start_position = StartPosition::Time(time);
                }
            }
        }

        settings
    }
}
