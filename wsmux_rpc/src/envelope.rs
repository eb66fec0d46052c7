//! The message envelope carried by one WebSocket text frame:
//! `{ "type": string, "meta": object, "payload"?: any }`.
//!
//! The envelope root is strict: unknown top-level keys fail decoding.
//! `meta` is an open object, but a small set of keys is server-owned
//! and stripped from anything a client or handler supplies.

use {
    crate::{
        domain::{ClientId, CorrelationId, MessageType},
        error::ErrorPayload,
    },
    serde::{Deserialize, Serialize},
    serde_json::Value,
};


/// Outbound error frame type for messages without a correlation id.
pub const ERROR_TYPE: &str = "ERROR";

/// Outbound error frame type for messages carrying a correlation id.
pub const RPC_ERROR_TYPE: &str = "RPC_ERROR";

/// Server-stamped on ingress; never accepted from clients.
pub const META_CLIENT_ID: &str = "clientId";

/// Authoritative server receive time, unix milliseconds.
pub const META_RECEIVED_AT: &str = "receivedAt";

/// Request-side correlation id; read-only to the server, copied onto
/// every response-side frame.
pub const META_CORRELATION_ID: &str = "correlationId";

/// Server-stamped on egress. A client-supplied value survives ingress
/// but is untrusted; `receivedAt` is the authoritative time.
pub const META_TIMESTAMP: &str = "timestamp";

/// The protocol meta object. A thin wrapper over a JSON object with
/// typed accessors for the server-owned keys.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Meta(serde_json::Map<String, Value>);

impl Meta {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn insert(&mut self, key: impl Into<String>, value: Value) {
        self.0.insert(key.into(), value);
    }

    pub fn remove(&mut self, key: &str) -> Option<Value> {
        self.0.remove(key)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.0.iter()
    }

    /// The correlation id, if the meta carries one as a string.
    pub fn correlation_id(&self) -> Option<CorrelationId> {
        self.0
            .get(META_CORRELATION_ID)
            .and_then(Value::as_str)
            .map(CorrelationId::from)
    }

    pub fn set_correlation_id(&mut self, id: &CorrelationId) {
        self.0
            .insert(META_CORRELATION_ID.to_owned(), id.as_ref().into());
    }

    pub fn set_client_id(&mut self, id: &ClientId) {
        self.0.insert(META_CLIENT_ID.to_owned(), id.as_ref().into());
    }

    pub fn set_received_at(&mut self, millis: i64) {
        self.0.insert(META_RECEIVED_AT.to_owned(), millis.into());
    }

    pub fn set_timestamp(&mut self, millis: i64) {
        self.0.insert(META_TIMESTAMP.to_owned(), millis.into());
    }

    /// Strips server-owned keys from client input. The correlation id
    /// and the (untrusted) client timestamp survive; `clientId`,
    /// `receivedAt` and any key named after the type discriminant are
    /// removed so the server stamps can never be spoofed.
    pub fn sanitize_inbound(&mut self, message_type: &MessageType) {
        self.0.remove(META_CLIENT_ID);
        self.0.remove(META_RECEIVED_AT);
        self.0.remove(message_type.as_ref());
    }

    /// Strips every reserved key from handler-supplied meta before it
    /// is merged onto an egress frame. The server re-injects its own
    /// values afterwards.
    pub fn sanitize_user(&mut self, message_type: &MessageType) {
        self.0.remove(META_CLIENT_ID);
        self.0.remove(META_RECEIVED_AT);
        self.0.remove(META_CORRELATION_ID);
        self.0.remove(META_TIMESTAMP);
        self.0.remove(message_type.as_ref());
    }

    /// Merges `other` into `self`, overwriting existing keys.
    pub fn merge(&mut self, other: Meta) {
        for (key, value) in other.0 {
            self.0.insert(key, value);
        }
    }
}

impl FromIterator<(String, Value)> for Meta {
    fn from_iter<T: IntoIterator<Item = (String, Value)>>(iter: T) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// The JSON object carried by one WebSocket text frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Envelope {
    /// The message type discriminant.
    #[serde(rename = "type")]
    pub message_type: MessageType,

    /// Protocol meta fields. Defaults to an empty object on ingress.
    #[serde(default)]
    pub meta: Meta,

    /// The payload. Absent when the schema declares none.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
}

impl Envelope {
    pub fn new(message_type: MessageType, meta: Meta, payload: Option<Value>) -> Self {
        Self {
            message_type,
            meta,
            payload,
        }
    }

    /// Builds an outbound error frame. The frame type is `RPC_ERROR`
    /// when a correlation id is present and `ERROR` otherwise; this is
    /// the single place the correlation-presence rule is encoded.
    pub fn error(payload: ErrorPayload, correlation_id: Option<&CorrelationId>) -> Self {
        let mut meta = Meta::new();
        let message_type = match correlation_id {
            Some(id) => {
                meta.set_correlation_id(id);
                RPC_ERROR_TYPE.into()
            }
            None => ERROR_TYPE.into(),
        };

        Self {
            message_type,
            meta,
            payload: Some(serde_json::to_value(payload).unwrap_or(Value::Null)),
        }
    }

    pub fn decode(raw: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(raw)
    }

    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// Best-effort extraction of `meta.correlationId` from a raw frame that
/// will not be dispatched (oversized or undecodable as an [`Envelope`]).
/// Used only to pick between `ERROR` and `RPC_ERROR` for the rejection.
pub fn sniff_correlation_id(raw: &str) -> Option<CorrelationId> {
    let value: Value = serde_json::from_str(raw).ok()?;

    value
        .get("meta")?
        .get(META_CORRELATION_ID)?
        .as_str()
        .map(CorrelationId::from)
}
