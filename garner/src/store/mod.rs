use async_trait::async_trait;
use fnv::FnvHashMap;
use serde::{Deserialize, Serialize};
use std::{collections::VecDeque, hash::Hash, sync::Arc, time::Duration};
use thiserror::Error;

/// Errors surfaced by a [`Store`] implementation.
#[derive(Debug, Clone, Eq, PartialEq, Deserialize, Serialize, Error)]
pub enum StoreError {
    #[error("version conflict: expected {expected:?}, actual {actual:?}")]
    VersionConflict {
        expected: Option<u64>,
        actual: Option<u64>,
    },

    #[error("store io: {0}")]
    Io(String),

    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// A stored value together with its optimistic-concurrency version.
#[derive(Debug, Clone, Eq, PartialEq, Deserialize, Serialize)]
pub struct Versioned<V> {
    pub value: V,
    pub version: u64,
}

/// Keyed repository consumed by the engines.
///
/// The core specifies this seam and ships an in-memory implementation; a persistence layer
/// provides durable implementations elsewhere. Writes are optimistic: `put` with
/// `expected: None` asserts the key is absent, `Some(version)` asserts the stored version
/// matches. Engines serialise writers per key, so a conflict indicates a foreign writer.
#[async_trait]
pub trait Store<K, V>: Send + Sync
where
    K: Send + Sync,
    V: Send + Sync,
{
    async fn get(&self, key: &K) -> Result<Option<Versioned<V>>, StoreError>;

    /// Write `value` under `key`, returning the new version.
    async fn put(&self, key: K, value: V, expected: Option<u64>) -> Result<u64, StoreError>;

    /// Write a batch without version assertions (load/replay paths).
    async fn put_many(&self, entries: Vec<(K, V)>) -> Result<(), StoreError>;

    /// Snapshot of all entries. Range filtering happens engine-side.
    async fn scan(&self) -> Result<Vec<(K, Versioned<V>)>, StoreError>;

    async fn remove(&self, key: &K) -> Result<(), StoreError>;
}

/// In-memory [`Store`] used in tests and default construction.
///
/// Supports fault injection: an artificial read delay and a bounded number of forced write
/// failures, for exercising deadline and rollback paths.
#[derive(Debug)]
pub struct InMemoryStore<K, V> {
    inner: Arc<parking_lot::RwLock<FnvHashMap<K, Versioned<V>>>>,
    read_delay: parking_lot::RwLock<Option<Duration>>,
    /// Outcome plan for upcoming writes: `true` fails the write. Empty means succeed.
    write_plan: parking_lot::Mutex<VecDeque<bool>>,
}

impl<K, V> Default for InMemoryStore<K, V> {
    fn default() -> Self {
        Self {
            inner: Arc::new(parking_lot::RwLock::new(FnvHashMap::default())),
            read_delay: parking_lot::RwLock::new(None),
            write_plan: parking_lot::Mutex::new(VecDeque::new()),
        }
    }
}

impl<K, V> InMemoryStore<K, V> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inject an artificial delay into every subsequent read.
    pub fn set_read_delay(&self, delay: Duration) {
        *self.read_delay.write() = Some(delay);
    }

    /// Force the next `count` writes to fail with an I/O error.
    pub fn fail_next_writes(&self, count: u32) {
        self.plan_writes((0..count).map(|_| true));
    }

    /// Script the outcome of upcoming writes: `true` entries fail, `false` succeed.
    pub fn plan_writes(&self, plan: impl IntoIterator<Item = bool>) {
        self.write_plan.lock().extend(plan);
    }

    fn take_write_failure(&self) -> bool {
        self.write_plan.lock().pop_front().unwrap_or(false)
    }

    async fn apply_read_delay(&self) {
        let delay = *self.read_delay.read();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
    }
}

#[async_trait]
impl<K, V> Store<K, V> for InMemoryStore<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    async fn get(&self, key: &K) -> Result<Option<Versioned<V>>, StoreError> {
        self.apply_read_delay().await;
        Ok(self.inner.read().get(key).cloned())
    }

    async fn put(&self, key: K, value: V, expected: Option<u64>) -> Result<u64, StoreError> {
        if self.take_write_failure() {
            return Err(StoreError::Io("injected write failure".into()));
        }

        let mut map = self.inner.write();
        let actual = map.get(&key).map(|versioned| versioned.version);
        if actual != expected {
            return Err(StoreError::VersionConflict { expected, actual });
        }

        let version = expected.unwrap_or(0) + 1;
        map.insert(key, Versioned { value, version });
        Ok(version)
    }

    async fn put_many(&self, entries: Vec<(K, V)>) -> Result<(), StoreError> {
        if self.take_write_failure() {
            return Err(StoreError::Io("injected write failure".into()));
        }

        let mut map = self.inner.write();
        for (key, value) in entries {
            let version = map.get(&key).map(|versioned| versioned.version + 1).unwrap_or(1);
            map.insert(key, Versioned { value, version });
        }
        Ok(())
    }

    async fn scan(&self) -> Result<Vec<(K, Versioned<V>)>, StoreError> {
        self.apply_read_delay().await;
        Ok(self
            .inner
            .read()
            .iter()
            .map(|(key, versioned)| (key.clone(), versioned.clone()))
            .collect())
    }

    async fn remove(&self, key: &K) -> Result<(), StoreError> {
        self.inner.write().remove(key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_optimistic_versioning() {
        let store = InMemoryStore::<&'static str, u32>::new();

        // Insert asserts absence
        assert_eq!(store.put("key", 1, None).await.unwrap(), 1);
        assert!(matches!(
            store.put("key", 2, None).await,
            Err(StoreError::VersionConflict { .. })
        ));

        // Update asserts the current version
        assert_eq!(store.put("key", 2, Some(1)).await.unwrap(), 2);
        assert!(matches!(
            store.put("key", 3, Some(1)).await,
            Err(StoreError::VersionConflict { .. })
        ));

        let current = store.get(&"key").await.unwrap().unwrap();
        assert_eq!(current.value, 2);
        assert_eq!(current.version, 2);
    }

    #[tokio::test]
    async fn test_injected_write_failures_are_bounded() {
        let store = InMemoryStore::<&'static str, u32>::new();
        store.fail_next_writes(1);

        assert!(matches!(
            store.put("key", 1, None).await,
            Err(StoreError::Io(_))
        ));
        assert!(store.put("key", 1, None).await.is_ok());
    }
}
