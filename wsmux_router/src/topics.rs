//! Per-connection topic subscription state.
//!
//! Every mutating operation is adapter-first: validate, serialize on
//! the topic, re-check state, call the adapter, and only then mutate
//! the local set. The local set therefore always reflects committed
//! adapter state — no ghost entries, no phantom entries.

use {
    crate::{
        error::{BoxError, SocketError, TopicError},
        platform::{ReadyState, Socket},
        pubsub::PubSubAdapter,
    },
    indexmap::IndexSet,
    parking_lot::Mutex,
    std::{collections::HashMap, sync::Arc},
    tokio_util::sync::CancellationToken,
    wsmux_rpc::domain::{ClientId, Topic, TopicPolicy},
};

/// Failures reported by a subscription sink.
#[derive(Debug, thiserror::Error)]
pub enum SinkError {
    #[error("Connection closed")]
    Closed,

    #[error("{0}")]
    Adapter(BoxError),
}

/// Where committed subscription changes go: the transport (native
/// topics where the platform has them) and the pub/sub adapter index.
#[async_trait::async_trait]
pub trait SubscriptionSink: Send + Sync + 'static {
    async fn subscribe(&self, client_id: &ClientId, topic: &Topic) -> Result<(), SinkError>;

    async fn unsubscribe(&self, client_id: &ClientId, topic: &Topic) -> Result<(), SinkError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Op {
    Subscribe,
    Unsubscribe,
}

/// Per-connection topic set with adapter-first atomicity.
pub struct TopicsManager {
    client_id: ClientId,
    policy: TopicPolicy,
    max_topics: Option<usize>,
    sink: Arc<dyn SubscriptionSink>,
    state: Mutex<IndexSet<Topic>>,
    in_flight: Mutex<HashMap<Topic, Arc<tokio::sync::Mutex<()>>>>,
}

impl TopicsManager {
    pub fn new(
        client_id: ClientId,
        policy: TopicPolicy,
        max_topics: Option<usize>,
        sink: Arc<dyn SubscriptionSink>,
    ) -> Self {
        Self {
            client_id,
            policy,
            max_topics,
            sink,
            state: Mutex::new(IndexSet::new()),
            in_flight: Mutex::new(HashMap::new()),
        }
    }

    pub fn client_id(&self) -> &ClientId {
        &self.client_id
    }

    pub fn contains(&self, topic: &Topic) -> bool {
        self.state.lock().contains(topic)
    }

    pub fn len(&self) -> usize {
        self.state.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.lock().is_empty()
    }

    /// Snapshot of the subscribed topics in insertion order. The
    /// internal set is never leaked.
    pub fn topics(&self) -> Vec<Topic> {
        self.state.lock().iter().cloned().collect()
    }

    /// Subscribes to a single topic. Idempotent: subscribing to an
    /// already-subscribed topic is a success without an adapter call,
    /// and concurrent subscribes to the same topic coalesce into one.
    pub async fn subscribe(
        &self,
        topic: &Topic,
        signal: Option<&CancellationToken>,
    ) -> Result<(), TopicError> {
        self.policy.validate(topic)?;
        if is_aborted(signal) {
            return Err(TopicError::Aborted);
        }

        let gate = self.acquire_gate(topic);
        let result = {
            let _guard = gate.lock().await;

            if self.contains(topic) {
                Ok(())
            } else {
                self.subscribe_serialized(topic, signal).await
            }
        };
        self.release_gate(topic, &gate);

        result
    }

    async fn subscribe_serialized(
        &self,
        topic: &Topic,
        signal: Option<&CancellationToken>,
    ) -> Result<(), TopicError> {
        if let Some(limit) = self.max_topics {
            let projected = self.len() + 1;
            if projected > limit {
                return Err(TopicError::LimitExceeded { limit, projected });
            }
        }

        // Still pre-commit: once the adapter call below is issued the
        // subscription commits regardless of the signal.
        if is_aborted(signal) {
            return Err(TopicError::Aborted);
        }

        self.sink
            .subscribe(&self.client_id, topic)
            .await
            .map_err(|err| single_op_error(err, topic))?;

        self.state.lock().insert(topic.clone());
        Ok(())
    }

    /// Unsubscribes from a single topic. Unsubscribing from a
    /// non-subscribed topic is a soft no-op.
    pub async fn unsubscribe(
        &self,
        topic: &Topic,
        signal: Option<&CancellationToken>,
    ) -> Result<(), TopicError> {
        self.policy.validate(topic)?;
        if is_aborted(signal) {
            return Err(TopicError::Aborted);
        }

        let gate = self.acquire_gate(topic);
        let result = {
            let _guard = gate.lock().await;

            if !self.contains(topic) {
                Ok(())
            } else {
                match self.sink.unsubscribe(&self.client_id, topic).await {
                    Ok(()) => {
                        self.state.lock().shift_remove(topic);
                        Ok(())
                    }
                    Err(err) => Err(single_op_error(err, topic)),
                }
            }
        };
        self.release_gate(topic, &gate);

        result
    }

    /// Subscribes to a set of topics atomically: either every new
    /// topic commits, or none do.
    pub async fn subscribe_many(
        &self,
        topics: &[Topic],
        signal: Option<&CancellationToken>,
    ) -> Result<(), TopicError> {
        let candidates = normalize(topics);
        for topic in &candidates {
            self.policy.validate(topic)?;
        }
        if is_aborted(signal) {
            return Err(TopicError::Aborted);
        }

        let delta: Vec<Topic> = {
            let state = self.state.lock();
            candidates
                .iter()
                .filter(|topic| !state.contains(*topic))
                .cloned()
                .collect()
        };
        if delta.is_empty() {
            return Ok(());
        }

        if let Some(limit) = self.max_topics {
            let projected = self.len() + delta.len();
            if projected > limit {
                return Err(TopicError::LimitExceeded { limit, projected });
            }
        }

        let ops: Vec<(Topic, Op)> = delta.into_iter().map(|t| (t, Op::Subscribe)).collect();
        let applied = self.apply_batch(&ops).await?;
        self.commit(&applied);
        Ok(())
    }

    /// Unsubscribes from a set of topics atomically.
    pub async fn unsubscribe_many(
        &self,
        topics: &[Topic],
        signal: Option<&CancellationToken>,
    ) -> Result<(), TopicError> {
        let candidates = normalize(topics);
        for topic in &candidates {
            self.policy.validate(topic)?;
        }
        if is_aborted(signal) {
            return Err(TopicError::Aborted);
        }

        let delta: Vec<Topic> = {
            let state = self.state.lock();
            candidates
                .iter()
                .filter(|topic| state.contains(*topic))
                .cloned()
                .collect()
        };
        if delta.is_empty() {
            return Ok(());
        }

        let ops: Vec<(Topic, Op)> = delta.into_iter().map(|t| (t, Op::Unsubscribe)).collect();
        let applied = self.apply_batch(&ops).await?;
        self.commit(&applied);
        Ok(())
    }

    /// Replaces the subscription set with `desired`. Removals are
    /// applied before additions so the transport never transiently
    /// exceeds the per-connection cap.
    pub async fn replace(
        &self,
        desired: &[Topic],
        signal: Option<&CancellationToken>,
    ) -> Result<(), TopicError> {
        let desired = normalize(desired);
        for topic in &desired {
            self.policy.validate(topic)?;
        }
        if is_aborted(signal) {
            return Err(TopicError::Aborted);
        }

        if let Some(limit) = self.max_topics {
            if desired.len() > limit {
                return Err(TopicError::LimitExceeded {
                    limit,
                    projected: desired.len(),
                });
            }
        }

        let (to_remove, to_add): (Vec<Topic>, Vec<Topic>) = {
            let state = self.state.lock();
            (
                state
                    .iter()
                    .filter(|topic| !desired.contains(*topic))
                    .cloned()
                    .collect(),
                desired
                    .iter()
                    .filter(|topic| !state.contains(*topic))
                    .cloned()
                    .collect(),
            )
        };

        let ops: Vec<(Topic, Op)> = to_remove
            .into_iter()
            .map(|t| (t, Op::Unsubscribe))
            .chain(to_add.into_iter().map(|t| (t, Op::Subscribe)))
            .collect();
        if ops.is_empty() {
            return Ok(());
        }

        let applied = self.apply_batch(&ops).await?;
        self.commit(&applied);
        Ok(())
    }

    /// Unsubscribes from everything.
    pub async fn clear(&self, signal: Option<&CancellationToken>) -> Result<(), TopicError> {
        let current = self.topics();
        self.unsubscribe_many(&current, signal).await
    }

    /// Best-effort teardown on connection close: the local set is
    /// cleared unconditionally and adapter failures are ignored.
    pub async fn teardown(&self) {
        let current: Vec<Topic> = {
            let mut state = self.state.lock();
            let topics = state.iter().cloned().collect();
            state.clear();
            topics
        };

        for topic in current {
            self.sink.unsubscribe(&self.client_id, &topic).await.ok();
        }
    }

    /// Applies adapter calls in order, taking each topic's in-flight
    /// gate around its call. On failure, already-applied calls are
    /// rolled back in reverse order and inverse direction.
    async fn apply_batch(&self, ops: &[(Topic, Op)]) -> Result<Vec<(Topic, Op)>, TopicError> {
        let mut applied: Vec<(Topic, Op)> = Vec::new();

        for (topic, op) in ops {
            let gate = self.acquire_gate(topic);
            let call = {
                let _guard = gate.lock().await;

                // A concurrent single op may have changed this topic
                // while the batch was in flight.
                match op {
                    Op::Subscribe if self.contains(topic) => Ok(false),
                    Op::Unsubscribe if !self.contains(topic) => Ok(false),
                    Op::Subscribe => self
                        .sink
                        .subscribe(&self.client_id, topic)
                        .await
                        .map(|()| true),
                    Op::Unsubscribe => self
                        .sink
                        .unsubscribe(&self.client_id, topic)
                        .await
                        .map(|()| true),
                }
            };
            self.release_gate(topic, &gate);

            match call {
                Ok(true) => applied.push((topic.clone(), *op)),
                Ok(false) => {}
                Err(SinkError::Closed) => {
                    // The connection teardown clears adapter state;
                    // rolling back over a dead transport cannot work.
                    return Err(TopicError::ConnectionClosed);
                }
                Err(SinkError::Adapter(source)) => {
                    let rollback_failed_topics = self.rollback(&applied).await;
                    return Err(TopicError::Adapter {
                        source,
                        topic: Some(topic.clone()),
                        rollback_failed: !rollback_failed_topics.is_empty(),
                        rollback_failed_topics,
                    });
                }
            }
        }

        Ok(applied)
    }

    async fn rollback(&self, applied: &[(Topic, Op)]) -> Vec<Topic> {
        let mut failed = Vec::new();

        for (topic, op) in applied.iter().rev() {
            let result = match op {
                Op::Subscribe => self.sink.unsubscribe(&self.client_id, topic).await,
                Op::Unsubscribe => self.sink.subscribe(&self.client_id, topic).await,
            };

            if result.is_err() {
                failed.push(topic.clone());
            }
        }

        failed
    }

    fn commit(&self, applied: &[(Topic, Op)]) {
        let mut state = self.state.lock();

        for (topic, op) in applied {
            match op {
                Op::Subscribe => {
                    state.insert(topic.clone());
                }
                Op::Unsubscribe => {
                    state.shift_remove(topic);
                }
            }
        }
    }

    fn acquire_gate(&self, topic: &Topic) -> Arc<tokio::sync::Mutex<()>> {
        self.in_flight
            .lock()
            .entry(topic.clone())
            .or_default()
            .clone()
    }

    fn release_gate(&self, topic: &Topic, gate: &Arc<tokio::sync::Mutex<()>>) {
        let mut in_flight = self.in_flight.lock();

        // The map entry plus our local clone: nobody else is waiting.
        if Arc::strong_count(gate) <= 2 {
            in_flight.remove(topic);
        }
    }
}

fn normalize(topics: &[Topic]) -> IndexSet<Topic> {
    topics.iter().cloned().collect()
}

fn is_aborted(signal: Option<&CancellationToken>) -> bool {
    signal.map_or(false, CancellationToken::is_cancelled)
}

fn single_op_error(err: SinkError, topic: &Topic) -> TopicError {
    match err {
        SinkError::Closed => TopicError::ConnectionClosed,
        SinkError::Adapter(source) => TopicError::Adapter {
            source,
            topic: Some(topic.clone()),
            rollback_failed: false,
            rollback_failed_topics: Vec::new(),
        },
    }
}

/// The sink used by router-owned connections: native transport topics
/// first, then the pub/sub adapter index. A pub/sub failure undoes the
/// transport call so neither side is left with a ghost entry.
pub(crate) struct TransportSink {
    socket: Arc<dyn Socket>,
    pubsub: Option<Arc<dyn PubSubAdapter>>,
}

impl TransportSink {
    pub(crate) fn new(socket: Arc<dyn Socket>, pubsub: Option<Arc<dyn PubSubAdapter>>) -> Self {
        Self { socket, pubsub }
    }
}

#[async_trait::async_trait]
impl SubscriptionSink for TransportSink {
    async fn subscribe(&self, client_id: &ClientId, topic: &Topic) -> Result<(), SinkError> {
        if self.socket.ready_state() == ReadyState::Closed {
            return Err(SinkError::Closed);
        }

        self.socket.subscribe(topic).await.map_err(socket_to_sink)?;

        if let Some(pubsub) = &self.pubsub {
            if let Err(err) = pubsub.subscribe(client_id, topic).await {
                self.socket.unsubscribe(topic).await.ok();
                return Err(SinkError::Adapter(err));
            }
        }

        Ok(())
    }

    async fn unsubscribe(&self, client_id: &ClientId, topic: &Topic) -> Result<(), SinkError> {
        if self.socket.ready_state() == ReadyState::Closed {
            return Err(SinkError::Closed);
        }

        self.socket
            .unsubscribe(topic)
            .await
            .map_err(socket_to_sink)?;

        if let Some(pubsub) = &self.pubsub {
            if let Err(err) = pubsub.unsubscribe(client_id, topic).await {
                self.socket.subscribe(topic).await.ok();
                return Err(SinkError::Adapter(err));
            }
        }

        Ok(())
    }
}

fn socket_to_sink(err: SocketError) -> SinkError {
    match err {
        SocketError::ConnectionClosed => SinkError::Closed,
        SocketError::Transport(err) => SinkError::Adapter(err),
    }
}
