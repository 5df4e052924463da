// SPDX-License-Identifier: MIT OR Apache-2.0

//! Async mutual exclusion keyed by user- or group id.
use std::collections::HashMap;
use std::hash::Hash;
use std::sync::{Arc, Mutex};

use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

/// Hands out one async mutex per key.
///
/// Used to serialize key generation per user, key fetches per peer and rotations per group while
/// leaving operations on other keys untouched.
#[derive(Debug)]
pub(crate) struct KeyedLocks<K> {
    locks: Mutex<HashMap<K, Arc<AsyncMutex<()>>>>,
}

impl<K> Default for KeyedLocks<K> {
    fn default() -> Self {
        Self {
            locks: Mutex::new(HashMap::new()),
        }
    }
}

impl<K> KeyedLocks<K>
where
    K: Clone + Eq + Hash,
{
    /// Waits until the lock for this key is acquired.
    pub(crate) async fn lock(&self, key: &K) -> OwnedMutexGuard<()> {
        let mutex = {
            // The map is only touched in this block and never held across an await point, a
            // poisoned lock still holds a consistent map.
            let mut locks = self
                .locks
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());

            // Drop entries nobody is waiting for anymore.
            locks.retain(|_, mutex| Arc::strong_count(mutex) > 1);

            locks
                .entry(key.clone())
                .or_insert_with(|| Arc::new(AsyncMutex::new(())))
                .clone()
        };
        mutex.lock_owned().await
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use futures_util::future::join_all;

    use super::KeyedLocks;

    #[tokio::test]
    async fn serializes_same_key() {
        let locks = KeyedLocks::<u8>::default();
        let inside = Arc::new(AtomicUsize::new(0));
        let max_inside = Arc::new(AtomicUsize::new(0));

        join_all((0..4).map(|_| {
            let inside = inside.clone();
            let max_inside = max_inside.clone();
            let locks = &locks;
            async move {
                let _guard = locks.lock(&1).await;
                let now = inside.fetch_add(1, Ordering::SeqCst) + 1;
                max_inside.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(5)).await;
                inside.fetch_sub(1, Ordering::SeqCst);
            }
        }))
        .await;

        assert_eq!(max_inside.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn different_keys_do_not_block() {
        let locks = KeyedLocks::<u8>::default();
        let _guard_1 = locks.lock(&1).await;

        // Would deadlock if both keys shared one mutex.
        let _guard_2 = locks.lock(&2).await;
    }
}
