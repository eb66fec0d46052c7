//! The platform (transport) adapter seam: the per-connection socket
//! contract, the connection record and registry, and the upgrade-time
//! authentication hook.

use {
    crate::{
        error::{BoxError, SocketError},
        topics::TopicsManager,
    },
    chrono::{DateTime, Utc},
    parking_lot::RwLock,
    std::{collections::HashMap, sync::Arc, time::Duration},
    tokio_util::sync::CancellationToken,
    wsmux_rpc::domain::{ClientId, Topic},
};

#[cfg(feature = "tokio-ws")]
pub mod tokio_ws;

/// User-augmentable connection data, merged from the upgrade-time
/// authenticate hook and mutated by `ctx.assign_data`.
pub type ConnData = serde_json::Map<String, serde_json::Value>;

/// Socket readiness, mirroring the WebSocket readyState values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ReadyState {
    Connecting = 0,
    Open = 1,
    Closing = 2,
    Closed = 3,
}

/// The opaque per-connection transport handle provided by a platform
/// adapter. `send` enqueues on the outbound buffer and must not block;
/// `subscribe`/`unsubscribe` map to native transport topics where the
/// platform has them and are no-ops otherwise.
#[async_trait::async_trait]
pub trait Socket: Send + Sync + 'static {
    fn send(&self, frame: String) -> Result<(), SocketError>;

    fn close(&self, code: u16, reason: &str) -> Result<(), SocketError>;

    fn ready_state(&self) -> ReadyState;

    async fn subscribe(&self, topic: &Topic) -> Result<(), SocketError>;

    async fn unsubscribe(&self, topic: &Topic) -> Result<(), SocketError>;

    /// Resolves once the outbound buffer has drained below the
    /// adapter's threshold.
    async fn wait_drained(&self) -> Result<(), SocketError>;
}

/// Outcome of the upgrade-time authenticate hook.
#[derive(Debug, Clone, thiserror::Error)]
#[error("Upgrade rejected ({status}): {reason}")]
pub struct AuthRejection {
    /// HTTP status returned before the upgrade completes.
    pub status: u16,

    pub reason: String,
}

impl AuthRejection {
    pub fn new(status: u16, reason: impl Into<String>) -> Self {
        Self {
            status,
            reason: reason.into(),
        }
    }
}

/// Upgrade-time authentication hook. Runs before the WebSocket
/// handshake completes; the returned map seeds the connection data.
pub type AuthenticateFn =
    Arc<dyn Fn(&http::Request<()>) -> Result<ConnData, AuthRejection> + Send + Sync>;

/// Heartbeat configuration consumed by platform adapters.
#[derive(Clone)]
pub struct Heartbeat {
    /// Ping interval.
    pub interval: Duration,

    /// How long after the last pong a connection counts as stale.
    pub timeout: Duration,

    /// Observation hook invoked before a stale connection is closed.
    pub on_stale: Option<Arc<dyn Fn(&ConnectionRecord) + Send + Sync>>,
}

impl std::fmt::Debug for Heartbeat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Heartbeat")
            .field("interval", &self.interval)
            .field("timeout", &self.timeout)
            .field("on_stale", &self.on_stale.is_some())
            .finish()
    }
}

/// Snapshot of a connection handed to lifecycle hooks.
#[derive(Debug, Clone)]
pub struct ConnectionRecord {
    pub client_id: ClientId,
    pub connected_at: DateTime<Utc>,
    pub protocol: Option<String>,
    pub ready_state: ReadyState,
    pub data: Arc<ConnData>,
}

struct ConnectionInner {
    client_id: ClientId,
    connected_at: DateTime<Utc>,
    protocol: Option<String>,
    socket: Arc<dyn Socket>,
    data: RwLock<Arc<ConnData>>,
    topics: TopicsManager,
    closed: CancellationToken,
}

/// A live connection consumed by the router from the first handled
/// message through the close callback. Cheap to clone.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<ConnectionInner>,
}

impl Connection {
    pub(crate) fn new(
        socket: Arc<dyn Socket>,
        protocol: Option<String>,
        data: ConnData,
        topics: TopicsManager,
    ) -> Self {
        Self {
            inner: Arc::new(ConnectionInner {
                client_id: topics.client_id().clone(),
                connected_at: Utc::now(),
                protocol,
                socket,
                data: RwLock::new(Arc::new(data)),
                topics,
                closed: CancellationToken::new(),
            }),
        }
    }

    pub fn client_id(&self) -> &ClientId {
        &self.inner.client_id
    }

    pub fn connected_at(&self) -> DateTime<Utc> {
        self.inner.connected_at
    }

    pub fn protocol(&self) -> Option<&str> {
        self.inner.protocol.as_deref()
    }

    pub fn socket(&self) -> &Arc<dyn Socket> {
        &self.inner.socket
    }

    pub fn topics(&self) -> &TopicsManager {
        &self.inner.topics
    }

    /// Fires when the connection closes; pending drain waits observe
    /// it and resolve with `ABORTED`.
    pub fn closed(&self) -> &CancellationToken {
        &self.inner.closed
    }

    /// Snapshot of the connection data.
    pub fn data(&self) -> Arc<ConnData> {
        self.inner.data.read().clone()
    }

    /// Shallow-merges `patch` into the connection data. Copy-on-write:
    /// concurrent readers keep the snapshot they already hold.
    pub fn assign_data(&self, patch: ConnData) {
        let mut guard = self.inner.data.write();
        let mut next = ConnData::clone(&guard);
        for (key, value) in patch {
            next.insert(key, value);
        }
        *guard = Arc::new(next);
    }

    pub fn record(&self) -> ConnectionRecord {
        ConnectionRecord {
            client_id: self.inner.client_id.clone(),
            connected_at: self.inner.connected_at,
            protocol: self.inner.protocol.clone(),
            ready_state: self.inner.socket.ready_state(),
            data: self.data(),
        }
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("client_id", &self.inner.client_id)
            .field("connected_at", &self.inner.connected_at)
            .field("protocol", &self.inner.protocol)
            .finish()
    }
}

/// Live connections keyed by client id. Shared between the router and
/// the pub/sub delivery path.
#[derive(Default)]
pub struct ConnectionRegistry {
    map: RwLock<HashMap<ClientId, Connection>>,
}

impl ConnectionRegistry {
    pub fn insert(&self, connection: Connection) {
        self.map
            .write()
            .insert(connection.client_id().clone(), connection);
    }

    pub fn remove(&self, client_id: &ClientId) -> Option<Connection> {
        self.map.write().remove(client_id)
    }

    pub fn get(&self, client_id: &ClientId) -> Option<Connection> {
        self.map.read().get(client_id).cloned()
    }

    pub fn len(&self) -> usize {
        self.map.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.read().is_empty()
    }

    /// Snapshot of all live connections.
    pub fn snapshot(&self) -> Vec<Connection> {
        self.map.read().values().cloned().collect()
    }
}

/// Convenience constructor for adapters that surface transport errors.
pub fn transport_error(err: impl Into<BoxError>) -> SocketError {
    SocketError::Transport(err.into())
}
