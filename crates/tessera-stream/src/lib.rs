//! Tessera Stream — change event publishing.
//!
//! Every committed mutation is published once as a [`ChangeEvent`]. Events
//! are sequenced and chained with BLAKE3 content hashes so any rewrite of
//! the published history is detectable.

pub mod hash;
pub mod journal;
pub mod memory;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use tessera_core::{ChangeEvent, EventId};

pub use journal::JournalStream;
pub use memory::MemoryStream;

/// Errors that can occur while publishing or reading events.
#[derive(Debug, thiserror::Error)]
pub enum StreamError {
    #[error("Integrity check failed at sequence {0}: stored hash does not match content")]
    IntegrityViolation(u64),

    #[error("Stream unavailable: {0}")]
    Unavailable(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Receipt for a published event.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct EventHandle {
    pub event_id: EventId,
    pub sequence: u64,
    pub content_hash: String,
}

/// A published event with its position in the hash chain.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StreamRecord {
    pub sequence: u64,
    pub previous_hash: Option<String>,
    pub content_hash: String,
    pub event: ChangeEvent,
}

impl StreamRecord {
    pub fn seal(
        sequence: u64,
        previous_hash: Option<String>,
        event: ChangeEvent,
    ) -> Result<Self, StreamError> {
        let content_hash = hash::chain_hash(previous_hash.as_deref(), &event)?;
        Ok(Self {
            sequence,
            previous_hash,
            content_hash,
            event,
        })
    }

    /// Verify that the stored hash matches a freshly computed one.
    pub fn verify_integrity(&self) -> bool {
        hash::chain_hash(self.previous_hash.as_deref(), &self.event)
            .map(|h| h == self.content_hash)
            .unwrap_or(false)
    }

    pub fn handle(&self) -> EventHandle {
        EventHandle {
            event_id: self.event.id.clone(),
            sequence: self.sequence,
            content_hash: self.content_hash.clone(),
        }
    }
}

/// Event publisher collaborator.
///
/// Events for the same element must be published in commit order; callers
/// publish while still holding the participant lock.
#[async_trait]
pub trait EventPublisher: Send + Sync {
    async fn publish(&self, event: ChangeEvent) -> Result<EventHandle, StreamError>;
}
