//! The pub/sub adapter seam and the publish envelope that flows
//! through it.
//!
//! Adapters never throw past this layer: `publish` always returns a
//! [`PublishResult`], and subscription-index failures are mapped to
//! `ADAPTER_ERROR` by the topics manager.

use {
    crate::error::{BoxError, PublishError},
    futures_util::stream::BoxStream,
    serde::Serialize,
    std::sync::Arc,
    tokio_util::sync::CancellationToken,
    wsmux_rpc::{
        domain::{ClientId, MessageType, Topic},
        envelope::Meta,
    },
};

pub mod memory;

/// How strong a publish receipt's subscriber count is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Capability {
    /// Local-only adapters returning true subscriber counts.
    Exact,

    /// Adapters able to count local subscribers but not global ones.
    Estimate,

    /// Distributed adapters without introspection.
    Unknown,
}

/// The internal envelope handed to pub/sub adapters. `exclude_client_id`
/// and `partition_key` are internal fields, stripped before any frame
/// is serialized for egress.
#[derive(Debug, Clone)]
pub struct PublishEnvelope {
    pub topic: Topic,
    pub message_type: MessageType,
    pub payload: Option<serde_json::Value>,
    pub meta: Meta,
    pub partition_key: Option<String>,
    pub exclude_client_id: Option<ClientId>,
}

/// Options accepted by `publish` on the router and on contexts.
#[derive(Clone, Default)]
pub struct PublishOptions {
    /// User meta merged onto the published envelope. Reserved keys are
    /// stripped before the merge.
    pub meta: Option<Meta>,

    /// Not supported at this layer; setting it returns an error result
    /// explaining so. Callers that need exclusion set
    /// `exclude_client_id` instead.
    pub exclude_self: bool,

    /// Internal filter: this client never receives the message. Always
    /// stripped before serializing for egress.
    pub exclude_client_id: Option<ClientId>,

    /// Sharding hint for distributed adapters.
    pub partition_key: Option<String>,

    /// Pre-commit abort.
    pub signal: Option<CancellationToken>,
}

/// Successful publish outcome.
#[derive(Debug, Clone)]
pub struct PublishReceipt {
    /// Number of local subscriber connections the message was handed
    /// to, when the adapter can count them.
    pub matched_local: Option<usize>,

    pub capability: Capability,
}

pub type PublishResult = Result<PublishReceipt, PublishError>;

/// Fans a broker-consumed (or locally published) envelope out to the
/// locally-subscribed connections, applying the `exclude_client_id`
/// filter. Returns the number of connections delivered to.
pub type LocalDelivery = Arc<dyn Fn(&PublishEnvelope) -> usize + Send + Sync>;

/// The pub/sub adapter contract.
#[async_trait::async_trait]
pub trait PubSubAdapter: Send + Sync + 'static {
    /// Delivers the envelope to local subscribers and, for distributed
    /// adapters, to the broker. Never panics past this boundary.
    async fn publish(&self, envelope: PublishEnvelope) -> PublishResult;

    /// Records a committed subscription in the adapter index.
    async fn subscribe(&self, client_id: &ClientId, topic: &Topic) -> Result<(), BoxError>;

    /// Removes a committed subscription from the adapter index.
    async fn unsubscribe(&self, client_id: &ClientId, topic: &Topic) -> Result<(), BoxError>;

    /// Lazy sequence of the topic's subscribers. Iteration may be
    /// partial for distributed adapters.
    fn subscribers(&self, topic: &Topic) -> BoxStream<'static, ClientId>;

    async fn list_topics(&self) -> Vec<Topic> {
        Vec::new()
    }

    async fn has_topic(&self, _topic: &Topic) -> bool {
        false
    }

    /// Called once during router init with the local delivery
    /// callback. Distributed adapters begin consuming from their
    /// broker here; local adapters just keep the callback.
    async fn start(&self, _deliver: LocalDelivery) -> Result<(), BoxError> {
        Ok(())
    }

    async fn close(&self) {}
}
