//! tessera-core: Shared element model, schema, events, and configuration for Tessera.
//!
//! This crate provides the foundational types used by every Tessera component:
//! - The element arena model (entities and relationships addressed by id)
//! - The schema registry (attribute kinds, identity contributors, relation rules)
//! - Change events published for every committed mutation
//! - Configuration management
//! - Common error types

pub mod config;
pub mod dates;
pub mod error;
pub mod events;
pub mod schema;
pub mod types;

pub use error::CoreError;
pub use events::{ChangeEvent, EventId, EventKind, EventPayload};
pub use schema::{AttributeKind, SchemaDefinition, SchemaRegistry};
pub use types::{
    Attributes, BaseType, Connection, ConnectionUpdate, DocumentPatch, EditInput, EditOperation,
    Element, EndpointSide, IndexFamily, ObjectId, RuleExplanation,
};
