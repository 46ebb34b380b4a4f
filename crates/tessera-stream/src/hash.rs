//! BLAKE3 content hashing for tamper evidence.
//!
//! Each record hash covers the previous record hash and the canonical JSON
//! of the event, so rewriting any event breaks every later link.

use tessera_core::ChangeEvent;

/// Hash of an event's canonical JSON.
pub fn compute_event_hash(event: &ChangeEvent) -> Result<String, serde_json::Error> {
    let json = serde_json::to_vec(event)?;
    Ok(blake3::hash(&json).to_hex().to_string())
}

/// Hash of an event chained to its predecessor.
pub fn chain_hash(previous: Option<&str>, event: &ChangeEvent) -> Result<String, serde_json::Error> {
    let json = serde_json::to_vec(event)?;
    let mut hasher = blake3::Hasher::new();
    if let Some(previous) = previous {
        hasher.update(previous.as_bytes());
    }
    hasher.update(&json);
    Ok(hasher.finalize().to_hex().to_string())
}
