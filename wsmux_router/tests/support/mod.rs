//! Shared harness for the router integration tests: an in-memory
//! socket that records frames and adapter calls, a strict test
//! validator, and schema builders.

#![allow(dead_code)]

use {
    parking_lot::Mutex,
    std::{collections::HashSet, sync::Arc, time::Duration},
    wsmux_router::{
        error::SocketError,
        platform::{ConnData, Connection, ReadyState, Socket},
        router::Router,
    },
    wsmux_rpc::{
        domain::Topic,
        schema::{Issue, MessageSchema, PayloadSchema, RpcSchema},
    },
};

/// Records everything the router pushes at the transport. Subscribe
/// calls can be told to fail per topic, and a small delay keeps
/// concurrent operations genuinely overlapping.
#[derive(Default)]
pub struct MockSocket {
    frames: Mutex<Vec<String>>,
    subscribed: Mutex<HashSet<Topic>>,
    calls: Mutex<Vec<(&'static str, Topic)>>,
    fail_subscribe: Mutex<HashSet<Topic>>,
    fail_unsubscribe: Mutex<HashSet<Topic>>,
    closed: Mutex<Option<(u16, String)>>,
}

impl MockSocket {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn frames(&self) -> Vec<String> {
        self.frames.lock().clone()
    }

    pub fn frame_values(&self) -> Vec<serde_json::Value> {
        self.frames()
            .iter()
            .map(|frame| serde_json::from_str(frame).expect("frame is not JSON"))
            .collect()
    }

    pub fn subscribed(&self) -> HashSet<Topic> {
        self.subscribed.lock().clone()
    }

    pub fn calls(&self) -> Vec<(&'static str, Topic)> {
        self.calls.lock().clone()
    }

    pub fn closed(&self) -> Option<(u16, String)> {
        self.closed.lock().clone()
    }

    pub fn fail_subscribe_on(&self, topic: impl Into<Topic>) {
        self.fail_subscribe.lock().insert(topic.into());
    }

    pub fn fail_unsubscribe_on(&self, topic: impl Into<Topic>) {
        self.fail_unsubscribe.lock().insert(topic.into());
    }
}

#[async_trait::async_trait]
impl Socket for MockSocket {
    fn send(&self, frame: String) -> Result<(), SocketError> {
        if self.closed.lock().is_some() {
            return Err(SocketError::ConnectionClosed);
        }

        self.frames.lock().push(frame);
        Ok(())
    }

    fn close(&self, code: u16, reason: &str) -> Result<(), SocketError> {
        *self.closed.lock() = Some((code, reason.to_owned()));
        Ok(())
    }

    fn ready_state(&self) -> ReadyState {
        if self.closed.lock().is_some() {
            ReadyState::Closed
        } else {
            ReadyState::Open
        }
    }

    async fn subscribe(&self, topic: &Topic) -> Result<(), SocketError> {
        tokio::time::sleep(Duration::from_millis(1)).await;
        self.calls.lock().push(("subscribe", topic.clone()));

        if self.fail_subscribe.lock().contains(topic) {
            return Err(SocketError::Transport("injected subscribe failure".into()));
        }

        self.subscribed.lock().insert(topic.clone());
        Ok(())
    }

    async fn unsubscribe(&self, topic: &Topic) -> Result<(), SocketError> {
        self.calls.lock().push(("unsubscribe", topic.clone()));

        if self.fail_unsubscribe.lock().contains(topic) {
            return Err(SocketError::Transport(
                "injected unsubscribe failure".into(),
            ));
        }

        self.subscribed.lock().remove(topic);
        Ok(())
    }

    async fn wait_drained(&self) -> Result<(), SocketError> {
        Ok(())
    }
}

/// Strict `{ "text": string }` object validator.
pub struct TextPayload;

impl PayloadSchema for TextPayload {
    fn safe_parse(&self, value: &serde_json::Value) -> Result<serde_json::Value, Vec<Issue>> {
        let Some(object) = value.as_object() else {
            return Err(vec![Issue::new("", "expected an object")]);
        };

        let mut issues = Vec::new();

        match object.get("text") {
            Some(serde_json::Value::String(_)) => {}
            Some(_) => issues.push(Issue::new("text", "expected a string")),
            None => issues.push(Issue::new("text", "required")),
        }

        for key in object.keys() {
            if key != "text" {
                issues.push(Issue::new(key.as_str(), "unknown key"));
            }
        }

        if issues.is_empty() {
            Ok(value.clone())
        } else {
            Err(issues)
        }
    }
}

pub fn text_schema(message_type: &str) -> MessageSchema {
    MessageSchema::new(message_type).with_payload(Arc::new(TextPayload))
}

pub fn ping_pong() -> RpcSchema {
    RpcSchema::new(text_schema("PING"), "PONG").with_response(Arc::new(TextPayload))
}

/// Builds a router, initializes it and opens one mock connection.
pub async fn harness(
    configure: impl FnOnce(Router) -> Router,
) -> (Arc<Router>, Connection, Arc<MockSocket>) {
    let router = Arc::new(configure(Router::new()));
    router.init().await.expect("router init failed");

    let socket = MockSocket::new();
    let connection = router.open_connection(socket.clone(), None, ConnData::new());

    (router, connection, socket)
}

/// Opens an extra connection on an existing router.
pub fn connect(router: &Arc<Router>) -> (Connection, Arc<MockSocket>) {
    let socket = MockSocket::new();
    let connection = router.open_connection(socket.clone(), None, ConnData::new());

    (connection, socket)
}
