use wsmux_rpc::{
    domain::{MessageType, Topic, TopicViolation},
    error::ErrorCode,
    schema::{issues_to_details, Issue},
};

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Errors raised while registering handlers or merging routers.
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("A handler is already registered for message type {0}")]
    DuplicateType(MessageType),
}

/// Failures reported by a transport socket.
#[derive(Debug, thiserror::Error)]
pub enum SocketError {
    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Transport error: {0}")]
    Transport(BoxError),
}

/// Failures of a context emission (`send` / `reply` / `error` /
/// `progress`). Suppressed emissions (post-terminal, throttled,
/// aborted pre-commit) are not errors; they resolve as no-ops.
#[derive(Debug, thiserror::Error)]
pub enum EmitError {
    #[error("Serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Wait aborted by connection close")]
    Aborted,

    #[error("Acknowledgement waits are not supported by the core")]
    AckUnsupported,

    #[error("reply/progress are only available on RPC contexts")]
    NotRpc,

    #[error("Egress payload failed response-schema validation")]
    OutboundValidation(Vec<Issue>),
}

impl From<SocketError> for EmitError {
    fn from(err: SocketError) -> Self {
        match err {
            SocketError::ConnectionClosed => Self::ConnectionClosed,
            // Write failures surface as a closed connection from the
            // handler's point of view; the adapter logs the specifics.
            SocketError::Transport(err) => {
                tracing::debug!(error = %err, "transport write failed");
                Self::ConnectionClosed
            }
        }
    }
}

/// Failures of topic subscription operations.
#[derive(Debug, thiserror::Error)]
pub enum TopicError {
    #[error("Invalid topic: {0}")]
    Invalid(#[from] TopicViolation),

    #[error("Topic limit exceeded: {projected} > {limit}")]
    LimitExceeded { limit: usize, projected: usize },

    #[error("Operation aborted")]
    Aborted,

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Adapter call failed: {source}")]
    Adapter {
        source: BoxError,
        /// The topic whose adapter call failed, when known.
        topic: Option<Topic>,
        /// True when undoing already-applied calls also failed,
        /// leaving adapter and local state divergent.
        rollback_failed: bool,
        /// The topics whose rollback calls failed.
        rollback_failed_topics: Vec<Topic>,
    },
}

impl TopicError {
    /// The wire-level error code for this failure.
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::Invalid(_) => ErrorCode::InvalidTopic,
            Self::LimitExceeded { .. } => ErrorCode::TopicLimitExceeded,
            Self::Aborted => ErrorCode::Aborted,
            Self::ConnectionClosed => ErrorCode::ConnectionClosed,
            Self::Adapter { .. } => ErrorCode::AdapterError,
        }
    }

    /// Structured details for an error payload.
    pub fn details(&self) -> Option<serde_json::Value> {
        match self {
            Self::LimitExceeded { limit, projected } => Some(serde_json::json!({
                "limit": limit,
                "projected": projected,
            })),
            Self::Adapter {
                topic,
                rollback_failed,
                rollback_failed_topics,
                ..
            } => {
                let mut details = serde_json::json!({ "rollbackFailed": rollback_failed });
                if let Some(topic) = topic {
                    details["topic"] = topic.as_ref().into();
                }
                if !rollback_failed_topics.is_empty() {
                    details["rollbackFailedTopics"] = serde_json::json!(rollback_failed_topics
                        .iter()
                        .map(|t| t.as_ref())
                        .collect::<Vec<_>>());
                }
                Some(details)
            }
            _ => None,
        }
    }
}

/// Failures on the publish path. Always returned as values; the
/// pub/sub layer never panics or throws past this type.
#[derive(Debug, thiserror::Error)]
pub enum PublishError {
    #[error("Payload failed validation")]
    Validation(Vec<Issue>),

    #[error("No pub/sub adapter installed")]
    NoAdapter,

    #[error("excludeSelf is not supported; set excludeClientId on the envelope instead")]
    ExcludeSelfUnsupported,

    #[error("Pub/sub adapter error: {0}")]
    Adapter(BoxError),

    #[error("Serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Publish aborted before commit")]
    Aborted,
}

impl PublishError {
    pub fn details(&self) -> Option<serde_json::Value> {
        match self {
            Self::Validation(issues) => Some(issues_to_details(issues)),
            _ => None,
        }
    }
}
