//! Change events published for every committed mutation.
//!
//! Consumers (rule engines, live subscriptions, audit) rely on events for
//! the same element arriving in commit order.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::types::{ConnectionUpdate, EditInput, Element, ObjectId};

/// Unique identifier for an event.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct EventId(pub Uuid);

impl EventId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for EventId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for EventId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Create,
    Update,
    Merge,
    Delete,
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Create => "create",
            Self::Update => "update",
            Self::Merge => "merge",
            Self::Delete => "delete",
        };
        f.write_str(s)
    }
}

/// The element an event is about.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EventSubject {
    pub internal_id: ObjectId,
    pub standard_id: String,
    pub entity_type: String,
}

impl From<&Element> for EventSubject {
    fn from(element: &Element) -> Self {
        Self {
            internal_id: element.internal_id,
            standard_id: element.standard_id.clone(),
            entity_type: element.entity_type.clone(),
        }
    }
}

/// An event emitted by the mutation engine.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChangeEvent {
    pub id: EventId,
    pub timestamp: DateTime<Utc>,
    pub subject: EventSubject,
    pub message: String,
    pub payload: EventPayload,
}

impl ChangeEvent {
    pub fn new(subject: &Element, message: impl Into<String>, payload: EventPayload) -> Self {
        Self {
            id: EventId::new(),
            timestamp: Utc::now(),
            subject: EventSubject::from(subject),
            message: message.into(),
            payload,
        }
    }

    pub fn kind(&self) -> EventKind {
        self.payload.kind()
    }
}

/// The event payload, tagged by type.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "event_type", rename_all = "snake_case")]
pub enum EventPayload {
    /// A new element was indexed.
    Created { element: Element },
    /// An element changed. Only directly requested changes are listed.
    Updated {
        changes: Vec<EditInput>,
        element: Element,
    },
    /// Sources were folded into a target.
    Merged {
        before: Element,
        after: Element,
        sources: Vec<Element>,
        redirections: Vec<ConnectionUpdate>,
    },
    /// An element was removed along with its dependent relationships.
    Deleted {
        element: Element,
        dependencies: Vec<ObjectId>,
    },
}

impl EventPayload {
    pub fn kind(&self) -> EventKind {
        match self {
            Self::Created { .. } => EventKind::Create,
            Self::Updated { .. } => EventKind::Update,
            Self::Merged { .. } => EventKind::Merge,
            Self::Deleted { .. } => EventKind::Delete,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn payload_is_tagged_by_event_type() {
        let element = Element::new_entity("Malware", vec![], "malware--x".into());
        let event = ChangeEvent::new(
            &element,
            "creates a Malware",
            EventPayload::Created {
                element: element.clone(),
            },
        );
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["payload"]["event_type"], "created");
        assert_eq!(event.kind(), EventKind::Create);
        assert_eq!(event.subject.internal_id, element.internal_id);
    }
}
