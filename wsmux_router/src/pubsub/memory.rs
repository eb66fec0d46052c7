//! In-process pub/sub driver: a topic → subscriber index with exact
//! counts and no broker.

use {
    super::{Capability, LocalDelivery, PubSubAdapter, PublishEnvelope, PublishReceipt, PublishResult},
    crate::error::{BoxError, PublishError},
    futures_util::stream::{self, BoxStream, StreamExt},
    indexmap::IndexSet,
    parking_lot::Mutex,
    std::collections::HashMap,
    wsmux_rpc::domain::{ClientId, Topic},
};

/// Local-only adapter. Reports `Capability::Exact` because every
/// subscriber it knows about is local.
#[derive(Default)]
pub struct MemoryPubSub {
    index: Mutex<HashMap<Topic, IndexSet<ClientId>>>,
    delivery: Mutex<Option<LocalDelivery>>,
}

impl MemoryPubSub {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait::async_trait]
impl PubSubAdapter for MemoryPubSub {
    async fn publish(&self, envelope: PublishEnvelope) -> PublishResult {
        let deliver = self.delivery.lock().clone();

        let Some(deliver) = deliver else {
            return Err(PublishError::Adapter(
                "memory pub/sub adapter has not been started".into(),
            ));
        };

        let matched = deliver(&envelope);

        Ok(PublishReceipt {
            matched_local: Some(matched),
            capability: Capability::Exact,
        })
    }

    async fn subscribe(&self, client_id: &ClientId, topic: &Topic) -> Result<(), BoxError> {
        self.index
            .lock()
            .entry(topic.clone())
            .or_default()
            .insert(client_id.clone());
        Ok(())
    }

    async fn unsubscribe(&self, client_id: &ClientId, topic: &Topic) -> Result<(), BoxError> {
        let mut index = self.index.lock();

        if let Some(subscribers) = index.get_mut(topic) {
            subscribers.shift_remove(client_id);

            if subscribers.is_empty() {
                index.remove(topic);
            }
        }

        Ok(())
    }

    fn subscribers(&self, topic: &Topic) -> BoxStream<'static, ClientId> {
        let snapshot: Vec<ClientId> = self
            .index
            .lock()
            .get(topic)
            .map(|subscribers| subscribers.iter().cloned().collect())
            .unwrap_or_default();

        stream::iter(snapshot).boxed()
    }

    async fn list_topics(&self) -> Vec<Topic> {
        self.index.lock().keys().cloned().collect()
    }

    async fn has_topic(&self, topic: &Topic) -> bool {
        self.index.lock().contains_key(topic)
    }

    async fn start(&self, deliver: LocalDelivery) -> Result<(), BoxError> {
        *self.delivery.lock() = Some(deliver);
        Ok(())
    }

    async fn close(&self) {
        self.index.lock().clear();
        *self.delivery.lock() = None;
    }
}
