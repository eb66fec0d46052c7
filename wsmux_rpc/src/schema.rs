//! Message descriptors and the validator-adapter seam.
//!
//! A [`MessageSchema`] is identified by its type string and optionally
//! carries validator handles for its payload and user meta. The router
//! never interprets payloads itself; whatever implements
//! [`PayloadSchema`] owns parsing, strictness and coercion.

use {
    crate::domain::MessageType,
    serde::Serialize,
    serde_json::Value,
    std::{fmt, sync::Arc},
};

/// One field-level validation problem, reported back to the client in
/// error details.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Issue {
    /// Dotted path into the offending value (empty for the root).
    pub path: String,

    /// Human-readable description of the problem.
    pub message: String,
}

impl Issue {
    pub fn new(path: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            message: message.into(),
        }
    }
}

/// Converts validation issues into the `details` value of an error
/// payload.
pub fn issues_to_details(issues: &[Issue]) -> Value {
    serde_json::to_value(issues).unwrap_or(Value::Null)
}

/// The validator-adapter contract. Implementations wrap whatever schema
/// library the application uses; the router only ever calls
/// `safe_parse`.
pub trait PayloadSchema: Send + Sync + 'static {
    /// Validates `value`, returning the (possibly coerced) parsed value
    /// or the list of problems. Must not panic on any JSON input.
    fn safe_parse(&self, value: &Value) -> Result<Value, Vec<Issue>>;

    /// Optional schema metadata for tooling. Not used at runtime.
    fn describe(&self) -> Option<Value> {
        None
    }
}

/// Shared handle to a validator-adapter schema.
pub type SchemaRef = Arc<dyn PayloadSchema>;

/// Descriptor for one message type: the type string plus optional
/// payload and user-meta validators.
#[derive(Clone)]
pub struct MessageSchema {
    message_type: MessageType,
    payload: Option<SchemaRef>,
    meta: Option<SchemaRef>,
}

impl MessageSchema {
    /// Creates a descriptor for a message type with no payload.
    pub fn new(message_type: impl Into<MessageType>) -> Self {
        Self {
            message_type: message_type.into(),
            payload: None,
            meta: None,
        }
    }

    /// Attaches a payload validator. Messages of this type must then
    /// carry a payload that parses against it.
    pub fn with_payload(mut self, schema: SchemaRef) -> Self {
        self.payload = Some(schema);
        self
    }

    /// Attaches a validator for user-extensible meta keys.
    pub fn with_meta(mut self, schema: SchemaRef) -> Self {
        self.meta = Some(schema);
        self
    }

    pub fn message_type(&self) -> &MessageType {
        &self.message_type
    }

    pub fn payload(&self) -> Option<&SchemaRef> {
        self.payload.as_ref()
    }

    pub fn meta(&self) -> Option<&SchemaRef> {
        self.meta.as_ref()
    }
}

impl fmt::Debug for MessageSchema {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MessageSchema")
            .field("message_type", &self.message_type)
            .field("payload", &self.payload.is_some())
            .field("meta", &self.meta.is_some())
            .finish()
    }
}

/// Descriptor for an RPC: the request schema, the bound response type,
/// and an optional response schema used for egress validation.
#[derive(Clone)]
pub struct RpcSchema {
    request: MessageSchema,
    response_type: MessageType,
    response: Option<SchemaRef>,
}

impl RpcSchema {
    pub fn new(request: MessageSchema, response_type: impl Into<MessageType>) -> Self {
        Self {
            request,
            response_type: response_type.into(),
            response: None,
        }
    }

    /// Attaches a response-payload validator. Replies and progress
    /// frames are then validated before egress.
    pub fn with_response(mut self, schema: SchemaRef) -> Self {
        self.response = Some(schema);
        self
    }

    pub fn request(&self) -> &MessageSchema {
        &self.request
    }

    pub fn response_type(&self) -> &MessageType {
        &self.response_type
    }

    pub fn response(&self) -> Option<&SchemaRef> {
        self.response.as_ref()
    }
}

impl fmt::Debug for RpcSchema {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RpcSchema")
            .field("request", &self.request)
            .field("response_type", &self.response_type)
            .field("response", &self.response.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NonEmptyText;

    impl PayloadSchema for NonEmptyText {
        fn safe_parse(&self, value: &Value) -> Result<Value, Vec<Issue>> {
            match value.get("text").and_then(Value::as_str) {
                Some(text) if !text.is_empty() => Ok(value.clone()),
                Some(_) => Err(vec![Issue::new("text", "must not be empty")]),
                None => Err(vec![Issue::new("text", "required")]),
            }
        }
    }

    #[test]
    fn descriptor_carries_type_and_validators() {
        let schema = MessageSchema::new("PING").with_payload(Arc::new(NonEmptyText));

        assert_eq!(schema.message_type(), &"PING".into());
        assert!(schema.payload().is_some());
        assert!(schema.meta().is_none());
    }

    #[test]
    fn rpc_descriptor_binds_response_type() {
        let rpc = RpcSchema::new(MessageSchema::new("PING"), "PONG");

        assert_eq!(rpc.request().message_type(), &"PING".into());
        assert_eq!(rpc.response_type(), &"PONG".into());
        assert!(rpc.response().is_none());
    }

    #[test]
    fn issues_serialize_into_details() {
        let issues = vec![Issue::new("text", "required")];

        assert_eq!(
            issues_to_details(&issues),
            serde_json::json!([{ "path": "text", "message": "required" }])
        );
    }

    #[test]
    fn safe_parse_reports_issues() {
        let schema = NonEmptyText;

        assert!(schema.safe_parse(&serde_json::json!({ "text": "hi" })).is_ok());
        assert_eq!(
            schema.safe_parse(&serde_json::json!({})),
            Err(vec![Issue::new("text", "required")])
        );
    }
}
