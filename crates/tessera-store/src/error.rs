use tessera_core::{CoreError, ObjectId};

/// Errors from index operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Neo4j connection error: {0}")]
    Connection(String),

    #[error("Neo4j query error: {0}")]
    Query(#[from] neo4rs::Error),

    #[error("Document not found: {0}")]
    NotFound(ObjectId),

    #[error("Document {0} is not a relationship")]
    NotARelation(ObjectId),

    #[error("Failed to decode document: {0}")]
    Decode(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Invalid document patch: {0}")]
    Patch(#[from] CoreError),

    #[error("Index unavailable: {0}")]
    Unavailable(String),
}
