//! Atomic key/value storage abstraction.
//!
//! The governor persists exactly one signed 64-bit integer per tenant and
//! coordinates nodes solely through compare-and-swap on that key. Any
//! backend with linearizable single-key CAS can sit behind this trait:
//! Redis `WATCH`/`MULTI`, etcd transactions, DynamoDB conditional writes.

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use super::context::Context;
use crate::error::StorageError;

/// Trait for distributed storage backends.
///
/// Implementations own their locking discipline and must be safe to call
/// from any number of tasks at once. A missing key is equivalent to the
/// value `0` for the purposes of [`compare_and_swap`](Self::compare_and_swap).
#[async_trait]
pub trait AtomicStorage: Send + Sync {
    /// Read the value stored under `key`, or `None` if it was never written.
    async fn get(&self, ctx: &Context, key: &str) -> Result<Option<i64>, StorageError>;

    /// Store `new` under `key` only if the current value equals `old`.
    ///
    /// Returns `Ok(false)` when another writer got there first.
    async fn compare_and_swap(
        &self,
        ctx: &Context,
        key: &str,
        old: i64,
        new: i64,
    ) -> Result<bool, StorageError>;

    /// Add `delta` to the value under `key` and return the result.
    ///
    /// Reserved for auxiliary counters; the GCRA path never calls it.
    async fn atomic_increment(
        &self,
        ctx: &Context,
        key: &str,
        delta: i64,
    ) -> Result<i64, StorageError>;
}

/// In-process storage backed by a sharded concurrent map.
///
/// Suitable for single-node deployments and tests. CAS and increment hold
/// the shard lock for the key while they compare and write.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    values: DashMap<String, i64>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of keys currently stored.
    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Drop a key, returning its last value.
    pub fn remove(&self, key: &str) -> Option<i64> {
        self.values.remove(key).map(|(_, v)| v)
    }

    /// Clear all keys.
    ///
    /// This is primarily useful for testing.
    pub fn clear(&self) {
        self.values.clear();
    }
}

#[async_trait]
impl AtomicStorage for MemoryStorage {
    async fn get(&self, _ctx: &Context, key: &str) -> Result<Option<i64>, StorageError> {
        Ok(self.values.get(key).map(|v| *v))
    }

    async fn compare_and_swap(
        &self,
        _ctx: &Context,
        key: &str,
        old: i64,
        new: i64,
    ) -> Result<bool, StorageError> {
        let swapped = match self.values.entry(key.to_string()) {
            Entry::Occupied(mut entry) => {
                if *entry.get() == old {
                    entry.insert(new);
                    true
                } else {
                    false
                }
            }
            Entry::Vacant(entry) => {
                if old == 0 {
                    entry.insert(new);
                    true
                } else {
                    false
                }
            }
        };
        Ok(swapped)
    }

    async fn atomic_increment(
        &self,
        _ctx: &Context,
        key: &str,
        delta: i64,
    ) -> Result<i64, StorageError> {
        let mut value = self.values.entry(key.to_string()).or_insert(0);
        *value = value.saturating_add(delta);
        Ok(*value)
    }
}
