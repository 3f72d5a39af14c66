use crate::{
    error::{CoreError, TransientError},
    metrics::Metrics,
};
use fnv::{FnvBuildHasher, FnvHashMap};
use std::{
    hash::{BuildHasher, Hash},
    sync::Arc,
    time::{Duration, Instant},
};
use tokio::sync::watch;

const DEFAULT_SHARDS: usize = 16;

/// Keyed TTL cache with request coalescing.
///
/// Guarantees at-most-one concurrent recomputation per key: during a miss, concurrent readers
/// of the same key share the outcome of the single in-flight compute rather than issuing
/// their own. Entries expire `ttl` after being computed and can be explicitly invalidated
/// when an underlying position or contract changes.
#[derive(Debug)]
pub struct SingleFlightCache<K, V> {
    shards: Vec<parking_lot::Mutex<FnvHashMap<K, Entry<V>>>>,
    ttl: Duration,
    metrics: Option<Arc<Metrics>>,
}

#[derive(Debug)]
enum Entry<V> {
    Ready { value: V, expires_at: Instant },
    InFlight(watch::Receiver<Option<Result<V, CoreError>>>),
}

impl<K, V> SingleFlightCache<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    pub fn new(ttl: Duration) -> Self {
        Self {
            shards: (0..DEFAULT_SHARDS)
                .map(|_| parking_lot::Mutex::new(FnvHashMap::default()))
                .collect(),
            ttl,
            metrics: None,
        }
    }

    /// Record hits/misses into the provided registry.
    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    fn shard(&self, key: &K) -> &parking_lot::Mutex<FnvHashMap<K, Entry<V>>> {
        let hash = FnvBuildHasher::default().hash_one(key) as usize;
        &self.shards[hash % self.shards.len()]
    }

    fn record_hit(&self) {
        if let Some(metrics) = &self.metrics {
            metrics.cache_hits.increment();
        }
    }

    fn record_miss(&self) {
        if let Some(metrics) = &self.metrics {
            metrics.cache_misses.increment();
        }
    }

    /// Fetch the cached value for `key`, running `compute` on a miss.
    ///
    /// Concurrent callers during the miss await the in-flight compute and share its outcome.
    /// If the in-flight compute is cancelled before producing a value, waiters observe a
    /// `Transient` error and the entry is cleared for the next caller.
    pub async fn get_or_compute<F, Fut>(&self, key: K, compute: F) -> Result<V, CoreError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V, CoreError>>,
    {
        enum Action<V> {
            Hit(V),
            Wait(watch::Receiver<Option<Result<V, CoreError>>>),
            Compute(watch::Sender<Option<Result<V, CoreError>>>),
        }

        let action = {
            let mut shard = self.shard(&key).lock();
            match shard.get(&key) {
                Some(Entry::Ready { value, expires_at }) if *expires_at > Instant::now() => {
                    Action::Hit(value.clone())
                }
                Some(Entry::InFlight(rx)) => Action::Wait(rx.clone()),
                _ => {
                    // Miss or expired: this caller owns the compute
                    let (tx, rx) = watch::channel(None);
                    shard.insert(key.clone(), Entry::InFlight(rx));
                    Action::Compute(tx)
                }
            }
        };

        let tx = match action {
            Action::Hit(value) => {
                self.record_hit();
                return Ok(value);
            }
            Action::Wait(rx) => {
                self.record_hit();
                return self.await_in_flight(&key, rx).await;
            }
            Action::Compute(tx) => tx,
        };
        self.record_miss();

        let result = compute().await;

        let mut shard = self.shard(&key).lock();
        match &result {
            Ok(value) => {
                shard.insert(
                    key.clone(),
                    Entry::Ready {
                        value: value.clone(),
                        expires_at: Instant::now() + self.ttl,
                    },
                );
            }
            Err(_) => {
                shard.remove(&key);
            }
        }
        drop(shard);

        // Waiters may all have gone; a send failure is fine
        let _ = tx.send(Some(result.clone()));

        result
    }

    async fn await_in_flight(
        &self,
        key: &K,
        mut rx: watch::Receiver<Option<Result<V, CoreError>>>,
    ) -> Result<V, CoreError> {
        loop {
            if let Some(result) = rx.borrow().clone() {
                return result;
            }
            if rx.changed().await.is_err() {
                // Compute was cancelled before producing a value; clear the dangling entry
                let mut shard = self.shard(key).lock();
                if matches!(shard.get(key), Some(Entry::InFlight(_))) {
                    shard.remove(key);
                }
                return Err(CoreError::Transient(TransientError::Store(
                    "in-flight cache compute cancelled".into(),
                )));
            }
        }
    }

    /// Overwrite the cached value for `key` (write-through after an engine update).
    pub fn put(&self, key: K, value: V) {
        self.shard(&key).lock().insert(
            key,
            Entry::Ready {
                value,
                expires_at: Instant::now() + self.ttl,
            },
        );
    }

    /// Drop any ready value for `key`. An in-flight compute is left to complete.
    pub fn invalidate(&self, key: &K) {
        let mut shard = self.shard(key).lock();
        if matches!(shard.get(key), Some(Entry::Ready { .. })) {
            shard.remove(key);
        }
    }
}
