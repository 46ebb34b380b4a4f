//! In-process publisher keeping the full hash-chained history.

use async_trait::async_trait;
use tokio::sync::Mutex;

use tessera_core::{ChangeEvent, EventKind, ObjectId};

use crate::{EventHandle, EventPublisher, StreamError, StreamRecord};

#[derive(Default)]
pub struct MemoryStream {
    records: Mutex<Vec<StreamRecord>>,
}

impl MemoryStream {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.records.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.records.lock().await.is_empty()
    }

    pub async fn events(&self) -> Vec<ChangeEvent> {
        self.records
            .lock()
            .await
            .iter()
            .map(|r| r.event.clone())
            .collect()
    }

    /// Events about one element, in publication order.
    pub async fn events_for(&self, id: ObjectId) -> Vec<ChangeEvent> {
        self.records
            .lock()
            .await
            .iter()
            .filter(|r| r.event.subject.internal_id == id)
            .map(|r| r.event.clone())
            .collect()
    }

    pub async fn count(&self, kind: EventKind) -> usize {
        self.records
            .lock()
            .await
            .iter()
            .filter(|r| r.event.kind() == kind)
            .count()
    }

    pub async fn records(&self) -> Vec<StreamRecord> {
        self.records.lock().await.clone()
    }
}

#[async_trait]
impl EventPublisher for MemoryStream {
    async fn publish(&self, event: ChangeEvent) -> Result<EventHandle, StreamError> {
        let mut records = self.records.lock().await;
        let previous = records.last().map(|r| r.content_hash.clone());
        let record = StreamRecord::seal(records.len() as u64 + 1, previous, event)?;
        let handle = record.handle();
        tracing::debug!(
            sequence = handle.sequence,
            event_id = %handle.event_id,
            kind = %record.event.kind(),
            "Event published"
        );
        records.push(record);
        Ok(handle)
    }
}
