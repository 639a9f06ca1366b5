//! Versioned state storage for rate limit and quota bookkeeping.
//!
//! Admission checks are read-modify-write sequences. Every write goes through
//! [`StateStore::compare_and_swap`] against the version that was read, so two
//! concurrent callers on the same key cannot both consume the last slot.
//! [`MemoryStore`] is the in-process backend; a shared key-value backend can
//! implement the same trait for multi-instance deployments.

use crate::error::StoreError;
use async_trait::async_trait;
use rootcause::prelude::Report;
use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

/// How many lost compare-and-swap rounds [`update`] tolerates.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 16;

/// A stored value together with its version.
#[derive(Debug, Clone, PartialEq)]
pub struct Versioned<V> {
    /// Monotonic per-key version, bumped by every successful write.
    pub version: u64,
    /// The stored value.
    pub value: V,
}

/// Storage backend for per-key runtime state.
#[async_trait]
pub trait StateStore<V>: Send + Sync
where
    V: Clone + Send + Sync + 'static,
{
    /// Reads the current value and its version.
    async fn get(&self, key: &str) -> Result<Option<Versioned<V>>, Report<StoreError>>;

    /// Writes `value` only if the key is still at `expected_version`.
    ///
    /// `None` means the key must not exist yet. Returns `false` when another
    /// writer got there first.
    async fn compare_and_swap(
        &self,
        key: &str,
        expected_version: Option<u64>,
        value: V,
    ) -> Result<bool, Report<StoreError>>;

    /// Removes a key. Returns true if it existed.
    async fn remove(&self, key: &str) -> Result<bool, Report<StoreError>>;

    /// Removes every key starting with `prefix`. Returns the number removed.
    async fn clear_prefix(&self, prefix: &str) -> Result<usize, Report<StoreError>>;
}

/// Atomically applies `f` to the value stored at `key`.
///
/// `f` receives the current value (if any) and returns the value to store
/// plus an output. It may run more than once when writers race, so it must
/// be free of side effects.
///
/// # Errors
///
/// Returns an error if the backend fails or the key stays contended for
/// `max_attempts` rounds.
pub async fn update<V, R, F>(
    store: &dyn StateStore<V>,
    key: &str,
    max_attempts: u32,
    f: F,
) -> Result<R, Report<StoreError>>
where
    V: Clone + Send + Sync + 'static,
    R: Send,
    F: Fn(Option<V>) -> (V, R) + Send + Sync,
{
    for _ in 0..max_attempts {
        let current = store.get(key).await?;
        let expected = current.as_ref().map(|c| c.version);
        let (next, output) = f(current.map(|c| c.value));
        if store.compare_and_swap(key, expected, next).await? {
            return Ok(output);
        }
        tracing::trace!(key, "compare-and-swap lost, retrying");
    }

    Err(StoreError::Contention {
        key: key.to_string(),
        attempts: max_attempts,
    }
    .into())
}

/// In-process [`StateStore`].
#[derive(Debug)]
pub struct MemoryStore<V> {
    entries: Mutex<HashMap<String, Versioned<V>>>,
}

impl<V> MemoryStore<V> {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Returns the number of stored keys.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Returns true if nothing is stored.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<V> Default for MemoryStore<V> {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl<V> StateStore<V> for MemoryStore<V>
where
    V: Clone + Send + Sync + 'static,
{
    async fn get(&self, key: &str) -> Result<Option<Versioned<V>>, Report<StoreError>> {
        let entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(entries.get(key).cloned())
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        expected_version: Option<u64>,
        value: V,
    ) -> Result<bool, Report<StoreError>> {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        let current = entries.get(key).map(|e| e.version);
        if current != expected_version {
            return Ok(false);
        }

        let version = current.map_or(1, |v| v + 1);
        entries.insert(key.to_string(), Versioned { version, value });
        Ok(true)
    }

    async fn remove(&self, key: &str) -> Result<bool, Report<StoreError>> {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(entries.remove(key).is_some())
    }

    async fn clear_prefix(&self, prefix: &str) -> Result<usize, Report<StoreError>> {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        let before = entries.len();
        entries.retain(|key, _| !key.starts_with(prefix));
        Ok(before - entries.len())
    }
}
