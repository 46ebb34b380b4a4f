//! Short-lived record of recently deleted ids.
//!
//! Merges and deletions record the ids they removed so a concurrent creation
//! cannot resolve a reference to an element that is already gone before the
//! corresponding event has been observed.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::Mutex;

#[async_trait]
pub trait TombstoneCache: Send + Sync {
    async fn record(&self, ids: &[String]);

    async fn contains(&self, id: &str) -> bool;
}

/// In-process cache; entries expire after the configured TTL.
pub struct MemoryTombstones {
    ttl: Duration,
    entries: Mutex<HashMap<String, Instant>>,
}

impl MemoryTombstones {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub async fn len(&self) -> usize {
        let mut entries = self.entries.lock().await;
        let now = Instant::now();
        entries.retain(|_, expires| *expires > now);
        entries.len()
    }
}

impl Default for MemoryTombstones {
    fn default() -> Self {
        Self::new(Duration::from_secs(120))
    }
}

#[async_trait]
impl TombstoneCache for MemoryTombstones {
    async fn record(&self, ids: &[String]) {
        let expires = Instant::now() + self.ttl;
        let mut entries = self.entries.lock().await;
        for id in ids {
            entries.insert(id.to_lowercase(), expires);
        }
        tracing::debug!(recorded = ids.len(), "Tombstones recorded");
    }

    async fn contains(&self, id: &str) -> bool {
        let entries = self.entries.lock().await;
        entries
            .get(&id.to_lowercase())
            .is_some_and(|expires| *expires > Instant::now())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn records_case_insensitively() {
        let cache = MemoryTombstones::default();
        cache.record(&["Malware--ABC".to_string()]).await;
        assert!(cache.contains("malware--abc").await);
        assert!(!cache.contains("malware--def").await);
    }

    #[tokio::test]
    async fn entries_expire() {
        let cache = MemoryTombstones::new(Duration::from_millis(20));
        cache.record(&["a".to_string(), "b".to_string()]).await;
        assert_eq!(cache.len().await, 2);
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert!(!cache.contains("a").await);
        assert_eq!(cache.len().await, 0);
    }
}
