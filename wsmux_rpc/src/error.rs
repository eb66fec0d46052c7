use serde::{Deserialize, Serialize};

/// Close code for a normal shutdown.
pub const CLOSE_NORMAL: u16 = 1000;

/// Close code for policy violations (stale or misbehaving peers).
pub const CLOSE_POLICY: u16 = 1008;

/// Default close code for oversized payloads.
pub const CLOSE_TOO_LARGE: u16 = 1009;

/// Close code for internal server errors.
pub const CLOSE_INTERNAL: u16 = 1011;

/// The closed set of error codes surfaced to clients. Codes are stable
/// string tags; messages are human-readable and may change.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
    strum::IntoStaticStr,
)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    /// Inbound payload failed schema validation.
    InvalidArgument,

    /// No handler registered for the message type.
    UnsupportedMessageType,

    /// Payload or rate limit exceeded.
    ResourceExhausted,

    /// Handler threw, middleware failed, or an adapter error surfaced.
    Internal,

    /// Topic failed the length or pattern policy.
    InvalidTopic,

    /// Per-connection topic cap reached.
    TopicLimitExceeded,

    /// The connection is no longer open.
    ConnectionClosed,

    /// A transport or pub/sub adapter call failed.
    AdapterError,

    /// The operation was aborted before it committed.
    Aborted,

    /// Egress payload failed response-schema validation.
    OutboundValidationError,

    /// User-raised via `ctx.error`.
    TimedOut,

    /// User-raised via `ctx.error`.
    NotFound,

    /// User-raised via `ctx.error`.
    Unauthenticated,

    /// User-raised via `ctx.error`.
    PermissionDenied,

    /// User-raised via `ctx.error`.
    FailedPrecondition,
}

/// The payload of an outbound `ERROR` / `RPC_ERROR` frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorPayload {
    /// Stable error code.
    pub code: ErrorCode,

    /// Human-readable message. Grep-friendly, never includes stack
    /// traces or adapter internals.
    pub message: String,

    /// Structured details, if any (per-field validation issues, limit
    /// observations).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl ErrorPayload {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            details: None,
        }
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }
}
