// SPDX-License-Identifier: MIT OR Apache-2.0

//! Local lifecycle of every user's long-term key pairs.
//!
//! Key pairs are generated on first use, persisted through a [`KeyPairStore`] and afterwards
//! served from memory. They only change on explicit rotation and are destroyed on account
//! deletion.
use std::collections::HashMap;
use std::error::Error;
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::RwLock;
use tracing::debug;

use crate::crypto::{Rng, RngError};
use crate::identity::{PublicKeys, UserKeys};
use crate::locks::KeyedLocks;
use crate::traits::KeyPairStore;
use crate::types::UserId;

#[derive(Debug)]
pub struct KeyStore<S> {
    store: S,
    rng: Arc<Rng>,
    keys: RwLock<HashMap<UserId, Arc<UserKeys>>>,
    locks: KeyedLocks<UserId>,
}

impl<S> KeyStore<S>
where
    S: KeyPairStore,
{
    pub fn new(store: S, rng: Arc<Rng>) -> Self {
        Self {
            store,
            rng,
            keys: RwLock::new(HashMap::new()),
            locks: KeyedLocks::default(),
        }
    }

    /// Returns the key pairs of this user, generating and persisting them on first call.
    ///
    /// Concurrent first calls for the same user are serialized, all of them receive the same key
    /// pairs.
    pub async fn get_or_create_key_pairs(
        &self,
        user_id: &UserId,
    ) -> Result<Arc<UserKeys>, KeyStoreError> {
        if let Some(keys) = self.cached(user_id).await {
            return Ok(keys);
        }

        let _guard = self.locks.lock(user_id).await;

        // Another caller might have finished while we were waiting for the lock.
        if let Some(keys) = self.cached(user_id).await {
            return Ok(keys);
        }

        let keys = match self.store.load(user_id).await.map_err(store_error)? {
            Some(keys) => {
                debug!(%user_id, "loaded key pairs from store");
                keys
            }
            None => {
                let keys = UserKeys::generate(user_id.clone(), &self.rng)?;
                self.store.save(&keys).await.map_err(store_error)?;
                debug!(%user_id, "generated new key pairs");
                keys
            }
        };

        let keys = Arc::new(keys);
        self.keys
            .write()
            .await
            .insert(user_id.clone(), keys.clone());
        Ok(keys)
    }

    /// Public halves of a user's key pairs, for publishing them to the key directory.
    ///
    /// Does not generate anything, fails if the key pairs were not loaded or created before.
    pub async fn export_public_keys(&self, user_id: &UserId) -> Result<PublicKeys, KeyStoreError> {
        self.cached(user_id)
            .await
            .map(|keys| keys.public_keys())
            .ok_or_else(|| KeyStoreError::NoKeyPairs(user_id.clone()))
    }

    /// Replaces both key pairs of a user with freshly generated ones.
    ///
    /// Peers will only be able to verify and decrypt our messages again after the new public keys
    /// were published.
    pub async fn rotate_key_pairs(&self, user_id: &UserId) -> Result<Arc<UserKeys>, KeyStoreError> {
        let _guard = self.locks.lock(user_id).await;

        let keys = UserKeys::generate(user_id.clone(), &self.rng)?;
        self.store.save(&keys).await.map_err(store_error)?;
        debug!(%user_id, "rotated key pairs");

        let keys = Arc::new(keys);
        self.keys
            .write()
            .await
            .insert(user_id.clone(), keys.clone());
        Ok(keys)
    }

    /// Destroys the key pairs of a user, for example on account deletion.
    pub async fn delete_key_pairs(&self, user_id: &UserId) -> Result<(), KeyStoreError> {
        let _guard = self.locks.lock(user_id).await;

        self.store.delete(user_id).await.map_err(store_error)?;
        self.keys.write().await.remove(user_id);
        debug!(%user_id, "deleted key pairs");

        Ok(())
    }

    async fn cached(&self, user_id: &UserId) -> Option<Arc<UserKeys>> {
        self.keys.read().await.get(user_id).cloned()
    }
}

fn store_error(err: impl Error + Send + Sync + 'static) -> KeyStoreError {
    KeyStoreError::Store(Box::new(err))
}

#[derive(Debug, Error)]
pub enum KeyStoreError {
    #[error("could not generate key pairs: {0}")]
    KeyGeneration(#[from] RngError),

    #[error("key pair store failed: {0}")]
    Store(Box<dyn Error + Send + Sync>),

    #[error("no key pairs exist for user {0}")]
    NoKeyPairs(UserId),
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use assert_matches::assert_matches;
    use futures_util::future::join_all;

    use crate::crypto::Rng;
    use crate::test_utils::MemoryKeyPairStore;
    use crate::traits::KeyPairStore;
    use crate::types::UserId;

    use super::{KeyStore, KeyStoreError};

    fn key_store(store: MemoryKeyPairStore) -> KeyStore<MemoryKeyPairStore> {
        KeyStore::new(store, Arc::new(Rng::from_seed([1; 32])))
    }

    #[tokio::test]
    async fn returns_same_keys_on_subsequent_calls() {
        let store = MemoryKeyPairStore::new();
        let key_store = key_store(store.clone());
        let alice = UserId::from("alice");

        let keys_1 = key_store.get_or_create_key_pairs(&alice).await.unwrap();
        let keys_2 = key_store.get_or_create_key_pairs(&alice).await.unwrap();
        assert_eq!(keys_1, keys_2);

        // Key pairs got persisted.
        let stored = store.load(&alice).await.unwrap().unwrap();
        assert_eq!(&stored, keys_1.as_ref());
    }

    #[tokio::test]
    async fn loads_persisted_keys() {
        let store = MemoryKeyPairStore::new();
        let alice = UserId::from("alice");

        let keys_1 = key_store(store.clone())
            .get_or_create_key_pairs(&alice)
            .await
            .unwrap();

        // A fresh key store (for example after a restart) picks up the same keys.
        let keys_2 = key_store(store)
            .get_or_create_key_pairs(&alice)
            .await
            .unwrap();
        assert_eq!(keys_1, keys_2);
    }

    #[tokio::test]
    async fn concurrent_first_calls_agree() {
        let store = MemoryKeyPairStore::new();
        let key_store = key_store(store.clone());
        let alice = UserId::from("alice");

        let results = join_all((0..8).map(|_| key_store.get_or_create_key_pairs(&alice))).await;
        let first = results[0].as_ref().unwrap();
        for keys in &results {
            assert_eq!(keys.as_ref().unwrap(), first);
        }
        assert_eq!(store.saves(), 1);
    }

    #[tokio::test]
    async fn export_requires_existing_keys() {
        let key_store = key_store(MemoryKeyPairStore::new());
        let alice = UserId::from("alice");

        assert_matches!(
            key_store.export_public_keys(&alice).await,
            Err(KeyStoreError::NoKeyPairs(_))
        );

        let keys = key_store.get_or_create_key_pairs(&alice).await.unwrap();
        assert_eq!(
            key_store.export_public_keys(&alice).await.unwrap(),
            keys.public_keys()
        );
    }

    #[tokio::test]
    async fn rotate_and_delete() {
        let store = MemoryKeyPairStore::new();
        let key_store = key_store(store.clone());
        let alice = UserId::from("alice");

        let keys_1 = key_store.get_or_create_key_pairs(&alice).await.unwrap();
        let keys_2 = key_store.rotate_key_pairs(&alice).await.unwrap();
        assert_ne!(keys_1.public_keys(), keys_2.public_keys());
        assert_eq!(
            key_store.get_or_create_key_pairs(&alice).await.unwrap(),
            keys_2
        );

        key_store.delete_key_pairs(&alice).await.unwrap();
        assert!(store.load(&alice).await.unwrap().is_none());
        assert_matches!(
            key_store.export_public_keys(&alice).await,
            Err(KeyStoreError::NoKeyPairs(_))
        );
    }
}
