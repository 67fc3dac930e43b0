//! In-process admission state store.

use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Instant;
use tracing::debug;

use super::key::ClientKey;

/// Per-client admission state kept by [`MemoryStore`].
pub trait LimiterState: Send + 'static {
    /// Parameters every fresh state is built from.
    type Config: Clone + Send + Sync + std::fmt::Debug + 'static;

    /// A state with full allowance.
    fn new(config: &Self::Config, now: Instant) -> Self;

    /// Consume one unit of allowance if available.
    ///
    /// Returns `true` when a unit was consumed.
    fn try_acquire(&mut self, now: Instant) -> bool;

    /// Whole units of allowance left.
    fn remaining(&self, now: Instant) -> u64;

    /// Whether the state is indistinguishable from a freshly created one.
    fn is_idle(&self, now: Instant) -> bool;
}

/// A registry of per-client states.
///
/// The map only guards creation and lookup. Each entry carries its own mutex,
/// so read-modify-write on one key serializes callers for that key while
/// other keys proceed independently.
pub struct MemoryStore<S: LimiterState> {
    entries: DashMap<ClientKey, Arc<Mutex<S>>>,
    config: S::Config,
}

impl<S: LimiterState> MemoryStore<S> {
    pub fn new(config: S::Config) -> Self {
        Self {
            entries: DashMap::new(),
            config,
        }
    }

    /// Return the state for `key`, creating it with full allowance if absent.
    pub fn get_or_create(&self, key: &ClientKey, now: Instant) -> Arc<Mutex<S>> {
        if let Some(entry) = self.entries.get(key) {
            return entry.clone();
        }

        self.entries
            .entry(key.clone())
            .or_insert_with(|| {
                debug!(client = %key, "Creating admission state");
                Arc::new(Mutex::new(S::new(&self.config, now)))
            })
            .clone()
    }

    /// Read-modify-write the state for `key` under its lock.
    pub fn with_state<T>(
        &self,
        key: &ClientKey,
        now: Instant,
        f: impl FnOnce(&mut S) -> T,
    ) -> T {
        let state = self.get_or_create(key, now);
        let mut guard = state.lock();
        f(&mut guard)
    }

    /// Drop entries that are idle and not held by any in-flight request.
    ///
    /// Returns the number of evicted entries.
    pub fn evict_idle(&self, now: Instant) -> usize {
        let before = self.entries.len();
        // The shard write lock is held during retain, so a strong count of one
        // means no caller can be between lookup and lock on this entry.
        self.entries.retain(|_, state| {
            if Arc::strong_count(state) > 1 {
                return true;
            }
            match state.try_lock() {
                Some(guard) => !guard.is_idle(now),
                None => true,
            }
        });
        before.saturating_sub(self.entries.len())
    }

    /// Number of tracked clients.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
