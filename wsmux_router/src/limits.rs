use wsmux_rpc::{
    domain::{ClientId, CorrelationId, TopicPolicy},
    error::CLOSE_TOO_LARGE,
};

/// Default inbound frame budget: 1 MiB.
pub const DEFAULT_MAX_PAYLOAD_BYTES: usize = 1_048_576;

/// What the router does when an inbound frame exceeds the payload
/// budget. The limit hook fires for every policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OnExceeded {
    /// Emit a `RESOURCE_EXHAUSTED` error frame; the handler never runs.
    #[default]
    Send,

    /// Close the connection with `close_code` and reason
    /// `RESOURCE_EXHAUSTED`.
    Close,

    /// Only the hook runs; no egress and no close.
    Custom,
}

/// Resource limits enforced by the router.
#[derive(Debug, Clone)]
pub struct Limits {
    /// Maximum inbound frame size in bytes, checked before decoding.
    pub max_payload_bytes: usize,

    /// Per-connection topic cap. `None` means unlimited.
    pub max_topics_per_connection: Option<usize>,

    /// Topic length and pattern policy.
    pub topic_policy: TopicPolicy,

    /// Action taken on payload-budget violations.
    pub on_exceeded: OnExceeded,

    /// Close code used by the `Close` action.
    pub close_code: u16,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            max_payload_bytes: DEFAULT_MAX_PAYLOAD_BYTES,
            max_topics_per_connection: None,
            topic_policy: TopicPolicy::default(),
            on_exceeded: OnExceeded::default(),
            close_code: CLOSE_TOO_LARGE,
        }
    }
}

/// Passed to the `on_limit_exceeded` hook when an inbound frame blows
/// the payload budget.
#[derive(Debug, Clone)]
pub struct LimitExceeded {
    pub client_id: ClientId,
    pub observed: usize,
    pub limit: usize,
    /// Correlation id sniffed from the rejected frame, if any.
    pub correlation_id: Option<CorrelationId>,
}

impl LimitExceeded {
    /// Structured details for the `RESOURCE_EXHAUSTED` error payload.
    pub fn details(&self) -> serde_json::Value {
        serde_json::json!({
            "observed": self.observed,
            "limit": self.limit,
        })
    }
}
