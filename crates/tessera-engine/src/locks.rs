//! Participant locking.
//!
//! A mutation locks every id it will read-modify-write before touching the
//! index. Two mutations with overlapping participants therefore never
//! interleave, and relationship creations on shared endpoints are
//! serialised by the lock rather than by the caller. Waits are bounded: a
//! contended lock surfaces as a retryable timeout.

use std::collections::{BTreeSet, HashMap};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::Notify;

use crate::error::{EngineError, Result};

#[derive(Debug, thiserror::Error)]
pub enum LockError {
    #[error("Timed out acquiring lock on {}", .0.join(", "))]
    Timeout(Vec<String>),

    #[error("Lock service unavailable: {0}")]
    Unavailable(String),
}

/// A lease on a set of ids. Releasing twice is harmless; dropping releases.
pub trait HeldLock: Send + Sync {
    fn ids(&self) -> &[String];

    fn release(&mut self);
}

/// Lock collaborator.
#[async_trait]
pub trait LockService: Send + Sync {
    /// Acquire every id atomically, waiting at most `wait`. The lease expires
    /// after `ttl` if never released.
    async fn acquire(
        &self,
        ids: &[String],
        ttl: Duration,
        wait: Duration,
    ) -> std::result::Result<Box<dyn HeldLock>, LockError>;
}

// ── Participant sets ─────────────────────────────────────────────

/// Sorted, de-duplicated ids a mutation touches.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParticipantSet {
    ids: BTreeSet<String>,
}

impl ParticipantSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, id: impl AsRef<str>) {
        let id = id.as_ref().trim().to_lowercase();
        if !id.is_empty() {
            self.ids.insert(id);
        }
    }

    pub fn extend<I, S>(&mut self, ids: I)
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        for id in ids {
            self.insert(id);
        }
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.ids.contains(&id.to_lowercase())
    }

    /// Ids not already held by the enclosing scope.
    pub fn excluding(&self, scope: &LockScope) -> ParticipantSet {
        Self {
            ids: self
                .ids
                .iter()
                .filter(|id| !scope.held.contains(*id))
                .cloned()
                .collect(),
        }
    }

    pub fn to_vec(&self) -> Vec<String> {
        self.ids.iter().cloned().collect()
    }
}

impl<S: AsRef<str>> FromIterator<S> for ParticipantSet {
    fn from_iter<I: IntoIterator<Item = S>>(iter: I) -> Self {
        let mut set = Self::new();
        set.extend(iter);
        set
    }
}

/// Ids held by the current transaction, passed down to nested mutations.
#[derive(Debug, Clone, Default)]
pub struct LockScope {
    held: BTreeSet<String>,
}

impl LockScope {
    pub fn contains(&self, id: &str) -> bool {
        self.held.contains(&id.to_lowercase())
    }

    fn with(&self, ids: &ParticipantSet) -> Self {
        let mut held = self.held.clone();
        held.extend(ids.ids.iter().cloned());
        Self { held }
    }
}

// ── Coordinator ──────────────────────────────────────────────────

/// Held participant lock. Releases on drop.
pub struct LockGuard {
    lock: Option<Box<dyn HeldLock>>,
    scope: LockScope,
}

impl LockGuard {
    pub fn scope(&self) -> &LockScope {
        &self.scope
    }

    pub fn release(mut self) {
        if let Some(mut lock) = self.lock.take() {
            lock.release();
        }
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if let Some(mut lock) = self.lock.take() {
            lock.release();
        }
    }
}

pub struct LockCoordinator {
    service: Arc<dyn LockService>,
    ttl: Duration,
    wait: Duration,
}

impl LockCoordinator {
    pub fn new(service: Arc<dyn LockService>, ttl: Duration, wait: Duration) -> Self {
        Self { service, ttl, wait }
    }

    /// Lock the participants not already held by `scope`.
    pub async fn acquire(&self, scope: &LockScope, participants: &ParticipantSet) -> Result<LockGuard> {
        let remaining = participants.excluding(scope);
        if remaining.is_empty() {
            return Ok(LockGuard {
                lock: None,
                scope: scope.clone(),
            });
        }
        let ids = remaining.to_vec();
        let started = Instant::now();
        let lock = self
            .service
            .acquire(&ids, self.ttl, self.wait)
            .await
            .map_err(|e| match e {
                LockError::Timeout(participant_ids) => {
                    tracing::warn!(participants = participant_ids.len(), "Lock acquisition timed out");
                    EngineError::LockTimeout { participant_ids }
                }
                other => EngineError::Lock(other),
            })?;
        tracing::debug!(
            participants = ids.len(),
            waited_ms = started.elapsed().as_millis() as u64,
            "Participants locked"
        );
        Ok(LockGuard {
            lock: Some(lock),
            scope: scope.with(&remaining),
        })
    }

    /// Run `f` while holding the participants, releasing on every exit path.
    pub async fn with_lock<T, F, Fut>(&self, participants: &ParticipantSet, f: F) -> Result<T>
    where
        F: FnOnce(LockScope) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let guard = self.acquire(&LockScope::default(), participants).await?;
        let result = f(guard.scope().clone()).await;
        guard.release();
        result
    }
}

// ── In-process lock service ──────────────────────────────────────

struct Lease {
    token: u64,
    expires: Instant,
}

#[derive(Default)]
struct LockTable {
    leases: Mutex<HashMap<String, Lease>>,
    released: Notify,
    tokens: AtomicU64,
}

impl LockTable {
    fn try_take(&self, ids: &[String], ttl: Duration) -> Option<u64> {
        let mut leases = self.leases.lock().unwrap_or_else(|e| e.into_inner());
        let now = Instant::now();
        let free = ids
            .iter()
            .all(|id| leases.get(id).map_or(true, |lease| lease.expires <= now));
        if !free {
            return None;
        }
        let token = self.tokens.fetch_add(1, Ordering::Relaxed) + 1;
        for id in ids {
            leases.insert(
                id.clone(),
                Lease {
                    token,
                    expires: now + ttl,
                },
            );
        }
        Some(token)
    }

    fn give_back(&self, ids: &[String], token: u64) {
        let mut leases = self.leases.lock().unwrap_or_else(|e| e.into_inner());
        for id in ids {
            if leases.get(id).is_some_and(|lease| lease.token == token) {
                leases.remove(id);
            }
        }
        drop(leases);
        self.released.notify_waiters();
    }
}

/// Lock service for a single process.
#[derive(Clone, Default)]
pub struct LocalLockService {
    table: Arc<LockTable>,
}

impl LocalLockService {
    pub fn new() -> Self {
        Self::default()
    }
}

struct LocalLock {
    table: Arc<LockTable>,
    ids: Vec<String>,
    token: u64,
    released: bool,
}

impl HeldLock for LocalLock {
    fn ids(&self) -> &[String] {
        &self.ids
    }

    fn release(&mut self) {
        if !self.released {
            self.released = true;
            self.table.give_back(&self.ids, self.token);
        }
    }
}

impl Drop for LocalLock {
    fn drop(&mut self) {
        self.release();
    }
}

#[async_trait]
impl LockService for LocalLockService {
    async fn acquire(
        &self,
        ids: &[String],
        ttl: Duration,
        wait: Duration,
    ) -> std::result::Result<Box<dyn HeldLock>, LockError> {
        let attempt = async {
            loop {
                // Register before checking so a release in between is not missed.
                let released = self.table.released.notified();
                if let Some(token) = self.table.try_take(ids, ttl) {
                    return token;
                }
                released.await;
            }
        };
        let token = tokio::time::timeout(wait, attempt)
            .await
            .map_err(|_| LockError::Timeout(ids.to_vec()))?;
        Ok(Box::new(LocalLock {
            table: Arc::clone(&self.table),
            ids: ids.to_vec(),
            token,
            released: false,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn coordinator(wait_ms: u64) -> LockCoordinator {
        LockCoordinator::new(
            Arc::new(LocalLockService::new()),
            Duration::from_secs(30),
            Duration::from_millis(wait_ms),
        )
    }

    fn participants(ids: &[&str]) -> ParticipantSet {
        ids.iter().collect()
    }

    #[test]
    fn participant_sets_are_sorted_and_deduplicated() {
        let set = participants(&["B", "a", "b", " "]);
        assert_eq!(set.to_vec(), vec!["a".to_string(), "b".to_string()]);
    }

    #[tokio::test]
    async fn overlapping_participants_time_out() {
        let locks = coordinator(50);
        let held = locks
            .acquire(&LockScope::default(), &participants(&["a", "b"]))
            .await
            .unwrap();

        let err = locks
            .acquire(&LockScope::default(), &participants(&["b", "c"]))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, EngineError::LockTimeout { .. }));
        assert!(err.is_retryable());

        held.release();
        assert!(locks
            .acquire(&LockScope::default(), &participants(&["b", "c"]))
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn waiter_wakes_on_release() {
        let locks = Arc::new(coordinator(2_000));
        let held = locks
            .acquire(&LockScope::default(), &participants(&["x"]))
            .await
            .unwrap();

        let waiter = {
            let locks = Arc::clone(&locks);
            tokio::spawn(async move {
                locks
                    .with_lock(&participants(&["x"]), |_| async { Ok(42) })
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        drop(held);
        assert_eq!(waiter.await.unwrap().unwrap(), 42);
    }

    #[tokio::test]
    async fn nested_scope_skips_held_ids() {
        let locks = coordinator(50);
        let outer = locks
            .acquire(&LockScope::default(), &participants(&["a"]))
            .await
            .unwrap();
        // Re-locking "a" inside the outer scope must not deadlock.
        let inner = locks
            .acquire(outer.scope(), &participants(&["a", "b"]))
            .await
            .unwrap();
        assert!(inner.scope().contains("a"));
        assert!(inner.scope().contains("b"));
        inner.release();
        outer.release();
    }

    #[tokio::test]
    async fn error_inside_with_lock_still_releases() {
        let locks = coordinator(50);
        let result: Result<()> = locks
            .with_lock(&participants(&["a"]), |_| async {
                Err(EngineError::Functional("boom".into()))
            })
            .await;
        assert!(result.is_err());
        assert!(locks
            .acquire(&LockScope::default(), &participants(&["a"]))
            .await
            .is_ok());
    }
}
