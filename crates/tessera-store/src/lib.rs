//! Tessera Store — document index collaborators.
//!
//! Every element lives in one id-indexed arena grouped into index families.
//! The engine reaches the arena only through [`IndexStore`]: bulk index,
//! partial update, delete, id lookup, paginated filtered queries, and
//! relationship endpoint rewrites.

pub mod client;
pub mod error;
pub mod index;
pub mod memory;
pub mod neo4j;
pub mod query;

pub use client::{GraphClient, GraphConfig};
pub use error::StoreError;
pub use index::{list_all, IndexStore};
pub use memory::MemoryIndex;
pub use neo4j::Neo4jIndex;
pub use query::{ConnectionFilter, DocumentQuery, Filter, FilterOperator, Page};
