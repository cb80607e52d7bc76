//! Per-key build cache.
//!
//! Each key owns one slot. The first caller for a key runs the build; callers
//! arriving while it is in flight wait for it instead of starting another,
//! and later callers get the stored value. A failed build leaves the slot
//! empty so the next caller retries.

use std::collections::HashMap;
use std::future::Future;
use std::hash::Hash;
use std::sync::{Arc, Mutex};

use tokio::sync::OnceCell;

pub struct KeyedCache<K, V> {
    slots: Mutex<HashMap<K, Arc<OnceCell<Arc<V>>>>>,
}

impl<K, V> Default for KeyedCache<K, V> {
    fn default() -> Self {
        Self {
            slots: Mutex::new(HashMap::new()),
        }
    }
}

impl<K: Eq + Hash + Clone, V> KeyedCache<K, V> {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get_or_build<F, Fut, E>(&self, key: K, build: F) -> Result<Arc<V>, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V, E>>,
    {
        let slot = {
            let mut slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
            Arc::clone(slots.entry(key).or_default())
        };
        slot.get_or_try_init(move || async move { build().await.map(Arc::new) })
            .await
            .cloned()
    }

    /// Number of keys holding a built value.
    pub fn len(&self) -> usize {
        self.slots
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .filter(|slot| slot.initialized())
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn test_concurrent_callers_share_one_build() {
        let cache: Arc<KeyedCache<&str, String>> = Arc::new(KeyedCache::new());
        let builds = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..2 {
            let cache = Arc::clone(&cache);
            let builds = Arc::clone(&builds);
            handles.push(tokio::spawn(async move {
                cache
                    .get_or_build("checker", || async {
                        builds.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        Ok::<_, ()>("built".to_string())
                    })
                    .await
            }));
        }
        let mut values = Vec::new();
        for handle in handles {
            values.push(handle.await.unwrap().unwrap());
        }
        assert!(Arc::ptr_eq(&values[0], &values[1]));

        let third = cache
            .get_or_build("checker", || async {
                builds.fetch_add(1, Ordering::SeqCst);
                Ok::<_, ()>("rebuilt".to_string())
            })
            .await
            .unwrap();
        assert_eq!(*third, "built");
        assert_eq!(builds.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_keys_are_independent() {
        let cache: KeyedCache<u32, u32> = KeyedCache::new();
        let a = cache.get_or_build(1, || async { Ok::<_, ()>(10) }).await.unwrap();
        let b = cache.get_or_build(2, || async { Ok::<_, ()>(20) }).await.unwrap();
        assert_eq!((*a, *b), (10, 20));
        assert_eq!(cache.len(), 2);
    }

    #[tokio::test]
    async fn test_failed_build_is_retried() {
        let cache: KeyedCache<u32, u32> = KeyedCache::new();
        let err = cache.get_or_build(1, || async { Err::<u32, _>("boom") }).await;
        assert_eq!(err.unwrap_err(), "boom");
        assert!(cache.is_empty());

        let value = cache.get_or_build(1, || async { Ok::<_, &str>(7) }).await.unwrap();
        assert_eq!(*value, 7);
    }
}
