//! tessera-engine: Graph mutation and deduplication engine.
//!
//! Every write to the knowledge graph goes through [`MutationEngine`]:
//! - Identity resolution (deterministic standard ids, alias ids)
//! - Reference resolution in one batched lookup
//! - Participant locking around every read-modify-write
//! - Upsert of inputs resolving to existing elements
//! - Merging of duplicates, with batched relationship redirection
//! - Rule explanations and their aggregated attributes
//! - One change event per committed mutation

pub mod attributes;
pub mod engine;
pub mod error;
pub mod identity;
pub mod locks;
pub mod merge;
pub mod references;
pub mod relations;
pub mod rules;
pub mod tombstones;

mod delete;
mod update;
mod upsert;

pub use engine::{
    CreateOutcome, DeleteOutcome, EngineBuilder, FullElement, MutationEngine, Transaction,
    TxState, UpdateResult,
};
pub use error::{EngineError, ErrorKind, Result};
pub use identity::IdentityResolver;
pub use locks::{LocalLockService, LockService};
pub use merge::MergeOptions;
pub use rules::RuleContribution;
pub use tombstones::{MemoryTombstones, TombstoneCache};
