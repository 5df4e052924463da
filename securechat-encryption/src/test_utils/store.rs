// SPDX-License-Identifier: MIT OR Apache-2.0

use std::collections::HashMap;
use std::convert::Infallible;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use tokio::sync::RwLock;

use crate::identity::UserKeys;
use crate::traits::KeyPairStore;
use crate::types::UserId;

#[derive(Clone, Debug, Default)]
pub struct MemoryKeyPairStore {
    keys: Arc<RwLock<HashMap<UserId, UserKeys>>>,
    saves: Arc<AtomicUsize>,
}

impl MemoryKeyPairStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of times key pairs were written.
    pub fn saves(&self) -> usize {
        self.saves.load(Ordering::SeqCst)
    }
}

impl KeyPairStore for MemoryKeyPairStore {
    type Error = Infallible;

    async fn load(&self, user_id: &UserId) -> Result<Option<UserKeys>, Self::Error> {
        Ok(self.keys.read().await.get(user_id).cloned())
    }

    async fn save(&self, keys: &UserKeys) -> Result<(), Self::Error> {
        self.saves.fetch_add(1, Ordering::SeqCst);
        self.keys
            .write()
            .await
            .insert(keys.user_id().clone(), keys.clone());
        Ok(())
    }

    async fn delete(&self, user_id: &UserId) -> Result<(), Self::Error> {
        self.keys.write().await.remove(user_id);
        Ok(())
    }
}
