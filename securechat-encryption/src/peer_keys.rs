// SPDX-License-Identifier: MIT OR Apache-2.0

//! Cache of other users' public keys as published in the key directory.
use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, trace};

use crate::config::Config;
use crate::crypto::ed25519::VerifyingKey;
use crate::crypto::x25519::PublicKey;
use crate::identity::PublicKeys;
use crate::locks::KeyedLocks;
use crate::session::Session;
use crate::traits::{Transport, TransportError, with_timeout};
use crate::types::{Timestamp, UserId, now};

/// Public keys of a peer together with the time we fetched them.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerKeyRecord {
    pub user_id: UserId,
    pub public_key: PublicKey,
    pub signing_public_key: VerifyingKey,
    pub fetched_at: Timestamp,
}

impl PeerKeyRecord {
    fn new(user_id: UserId, public_keys: PublicKeys) -> Self {
        Self {
            user_id,
            public_key: public_keys.public_key,
            signing_public_key: public_keys.signing_public_key,
            fetched_at: now(),
        }
    }

    fn same_keys(&self, other: &PeerKeyRecord) -> bool {
        self.public_key == other.public_key && self.signing_public_key == other.signing_public_key
    }

    fn is_expired(&self, config: &Config) -> bool {
        now().saturating_sub(self.fetched_at) >= config.peer_key_ttl().as_secs()
    }
}

/// Resolves peer public keys through the transport and keeps them in memory.
///
/// Reads only take a shared lock on the cache. Concurrent misses for the same user are coalesced
/// into a single transport request.
#[derive(Debug)]
pub struct PeerKeyCache<T> {
    transport: Arc<T>,
    config: Config,
    records: RwLock<HashMap<UserId, PeerKeyRecord>>,
    fetches: KeyedLocks<UserId>,
}

impl<T> PeerKeyCache<T>
where
    T: Transport,
{
    pub fn new(transport: Arc<T>, config: Config) -> Self {
        Self {
            transport,
            config,
            records: RwLock::new(HashMap::new()),
            fetches: KeyedLocks::default(),
        }
    }

    /// Returns the cached record of this user or fetches it if it is missing or expired.
    pub async fn resolve(
        &self,
        session: &Session,
        user_id: &UserId,
    ) -> Result<PeerKeyRecord, KeyResolutionError> {
        if let Some(record) = self.fresh(user_id).await {
            trace!(%user_id, "peer keys served from cache");
            return Ok(record);
        }

        let _guard = self.fetches.lock(user_id).await;

        // Whoever held the lock before us might have fetched the keys already.
        if let Some(record) = self.fresh(user_id).await {
            return Ok(record);
        }

        let record = self.fetch(session, user_id).await?;
        self.records
            .write()
            .await
            .insert(user_id.clone(), record.clone());
        Ok(record)
    }

    /// Refetches the keys of a user, ignoring the cache.
    ///
    /// Used when a signature or decryption failed against a cached record. Returns the new record
    /// and whether the key material differs from what was cached before.
    pub async fn refresh(
        &self,
        session: &Session,
        user_id: &UserId,
    ) -> Result<(PeerKeyRecord, bool), KeyResolutionError> {
        let _guard = self.fetches.lock(user_id).await;

        let record = self.fetch(session, user_id).await?;
        let previous = self
            .records
            .write()
            .await
            .insert(user_id.clone(), record.clone());

        let changed = previous.is_some_and(|previous| !previous.same_keys(&record));
        if changed {
            debug!(%user_id, "peer changed their keys");
        }
        Ok((record, changed))
    }

    /// Returns the cached record without checking its age.
    pub async fn cached(&self, user_id: &UserId) -> Option<PeerKeyRecord> {
        self.records.read().await.get(user_id).cloned()
    }

    pub async fn invalidate(&self, user_id: &UserId) {
        self.records.write().await.remove(user_id);
    }

    async fn fresh(&self, user_id: &UserId) -> Option<PeerKeyRecord> {
        self.cached(user_id)
            .await
            .filter(|record| !record.is_expired(&self.config))
    }

    async fn fetch(
        &self,
        session: &Session,
        user_id: &UserId,
    ) -> Result<PeerKeyRecord, KeyResolutionError> {
        debug!(%user_id, "fetch peer keys");
        let public_keys = with_timeout(
            self.config.transport_timeout(),
            self.transport.fetch_public_keys(session, user_id),
        )
        .await
        .map_err(|err| KeyResolutionError {
            user_id: user_id.clone(),
            source: err,
        })?;
        Ok(PeerKeyRecord::new(user_id.clone(), public_keys))
    }
}

#[derive(Debug, Error)]
#[error("could not resolve public keys of {user_id}: {source}")]
pub struct KeyResolutionError {
    pub user_id: UserId,
    #[source]
    pub source: TransportError,
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use assert_matches::assert_matches;
    use futures_util::future::join_all;

    use crate::config::Config;
    use crate::crypto::Rng;
    use crate::identity::UserKeys;
    use crate::session::Session;
    use crate::test_utils::MemoryTransport;
    use crate::traits::TransportError;

    use super::{KeyResolutionError, PeerKeyCache};

    #[tokio::test]
    async fn coalesces_concurrent_fetches() {
        let rng = Rng::from_seed([1; 32]);
        let bob = UserKeys::generate("bob".into(), &rng).unwrap();

        let transport = Arc::new(MemoryTransport::new().with_latency(Duration::from_millis(10)));
        transport.publish_public_keys(&bob).await;

        let cache = PeerKeyCache::new(transport.clone(), Config::default());
        let session = Session::new("alice".into(), "token");

        let results = join_all((0..5).map(|_| cache.resolve(&session, bob.user_id()))).await;
        for record in results {
            assert_eq!(record.unwrap().public_key, bob.public_keys().public_key);
        }
        assert_eq!(transport.key_fetches(bob.user_id()).await, 1);
    }

    #[tokio::test]
    async fn expired_records_are_refetched() {
        let rng = Rng::from_seed([1; 32]);
        let bob = UserKeys::generate("bob".into(), &rng).unwrap();

        let transport = Arc::new(MemoryTransport::new());
        transport.publish_public_keys(&bob).await;

        let config = Config::default().with_peer_key_ttl(Duration::ZERO);
        let cache = PeerKeyCache::new(transport.clone(), config);
        let session = Session::new("alice".into(), "token");

        cache.resolve(&session, bob.user_id()).await.unwrap();
        cache.resolve(&session, bob.user_id()).await.unwrap();
        assert_eq!(transport.key_fetches(bob.user_id()).await, 2);
    }

    #[tokio::test]
    async fn refresh_detects_changed_keys() {
        let rng = Rng::from_seed([1; 32]);
        let bob = UserKeys::generate("bob".into(), &rng).unwrap();

        let transport = Arc::new(MemoryTransport::new());
        transport.publish_public_keys(&bob).await;

        let cache = PeerKeyCache::new(transport.clone(), Config::default());
        let session = Session::new("alice".into(), "token");
        cache.resolve(&session, bob.user_id()).await.unwrap();

        let (_, changed) = cache.refresh(&session, bob.user_id()).await.unwrap();
        assert!(!changed);

        let bob_rotated = UserKeys::generate("bob".into(), &rng).unwrap();
        transport.publish_public_keys(&bob_rotated).await;

        let (record, changed) = cache.refresh(&session, bob.user_id()).await.unwrap();
        assert!(changed);
        assert_eq!(record.public_key, bob_rotated.public_keys().public_key);
        assert_eq!(cache.cached(bob.user_id()).await, Some(record));
    }

    #[tokio::test]
    async fn unknown_and_unreachable_peers() {
        let transport = Arc::new(MemoryTransport::new());
        let cache = PeerKeyCache::new(transport.clone(), Config::default());
        let session = Session::new("alice".into(), "token");

        assert_matches!(
            cache.resolve(&session, &"nobody".into()).await,
            Err(KeyResolutionError {
                source: TransportError::NotFound,
                ..
            })
        );

        transport.set_offline(true).await;
        assert_matches!(
            cache.resolve(&session, &"nobody".into()).await,
            Err(KeyResolutionError {
                source: TransportError::Unavailable(_),
                ..
            })
        );
    }

    #[tokio::test(start_paused = true)]
    async fn slow_directory_times_out() {
        let rng = Rng::from_seed([1; 32]);
        let bob = UserKeys::generate("bob".into(), &rng).unwrap();

        let transport = Arc::new(MemoryTransport::new().with_latency(Duration::from_secs(60)));
        transport.publish_public_keys(&bob).await;

        let cache = PeerKeyCache::new(transport, Config::default());
        let session = Session::new("alice".into(), "token");

        assert_matches!(
            cache.resolve(&session, bob.user_id()).await,
            Err(KeyResolutionError {
                source: TransportError::Timeout,
                ..
            })
        );
    }
}
