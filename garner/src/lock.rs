use fnv::FnvHashMap;
use std::{hash::Hash, sync::Arc};
use tokio::sync::{Mutex, OwnedMutexGuard};

/// Fine-grained exclusive lock per key.
///
/// Lock acquisition is a suspension point: workers await the keyed mutex rather than blocking
/// a thread. Guards are owned so they can be held across other suspension points (store
/// writes, publish enqueues) within a critical section.
///
/// Lock entries are created lazily and never removed - the key space (books × securities ×
/// dates in flight) is bounded in practice.
#[derive(Debug)]
pub struct KeyedLocks<K> {
    inner: parking_lot::Mutex<FnvHashMap<K, Arc<Mutex<()>>>>,
}

impl<K> Default for KeyedLocks<K> {
    fn default() -> Self {
        Self {
            inner: parking_lot::Mutex::new(FnvHashMap::default()),
        }
    }
}

impl<K> KeyedLocks<K>
where
    K: Eq + Hash + Clone,
{
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquire the exclusive lock for `key`, suspending until it is available.
    pub async fn acquire(&self, key: K) -> OwnedMutexGuard<()> {
        let lock = {
            let mut map = self.inner.lock();
            Arc::clone(map.entry(key).or_insert_with(|| Arc::new(Mutex::new(()))))
        };
        lock.lock_owned().await
    }

    /// Acquire locks for both keys in canonical order (smallest first) to prevent deadlocks
    /// between workers locking the same pair in opposite order.
    pub async fn acquire_pair(
        &self,
        first: K,
        second: K,
    ) -> (OwnedMutexGuard<()>, OwnedMutexGuard<()>)
    where
        K: Ord,
    {
        if first <= second {
            let a = self.acquire(first).await;
            let b = self.acquire(second).await;
            (a, b)
        } else {
            let b = self.acquire(second).await;
            let a = self.acquire(first).await;
            (a, b)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn test_acquire_serialises_same_key() {
        let locks = Arc::new(KeyedLocks::new());
        let counter = Arc::new(AtomicU32::new(0));
        let max_seen = Arc::new(AtomicU32::new(0));

        let tasks = (0..16)
            .map(|_| {
                let locks = Arc::clone(&locks);
                let counter = Arc::clone(&counter);
                let max_seen = Arc::clone(&max_seen);
                tokio::spawn(async move {
                    let _guard = locks.acquire("key").await;
                    let concurrent = counter.fetch_add(1, Ordering::SeqCst) + 1;
                    max_seen.fetch_max(concurrent, Ordering::SeqCst);
                    tokio::task::yield_now().await;
                    counter.fetch_sub(1, Ordering::SeqCst);
                })
            })
            .collect::<Vec<_>>();

        for task in tasks {
            task.await.unwrap();
        }

        assert_eq!(max_seen.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_acquire_pair_is_order_insensitive() {
        let locks = Arc::new(KeyedLocks::new());

        // Opposite acquisition orders on the same pair must not deadlock
        let forward = {
            let locks = Arc::clone(&locks);
            tokio::spawn(async move {
                for _ in 0..100 {
                    let _guards = locks.acquire_pair("a", "b").await;
                }
            })
        };
        let reverse = {
            let locks = Arc::clone(&locks);
            tokio::spawn(async move {
                for _ in 0..100 {
                    let _guards = locks.acquire_pair("b", "a").await;
                }
            })
        };

        forward.await.unwrap();
        reverse.await.unwrap();
    }
}
