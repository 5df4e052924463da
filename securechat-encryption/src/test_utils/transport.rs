// SPDX-License-Identifier: MIT OR Apache-2.0

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::RwLock;

use crate::group::SealedGroupKey;
use crate::identity::{PublicKeys, UserKeys};
use crate::message::EncryptedPayload;
use crate::session::Session;
use crate::traits::{PublishOutcome, Transport, TransportError};
use crate::types::{GroupId, KeyVersion, UserId};

#[derive(Debug, Default)]
struct MemoryTransportInner {
    directory: HashMap<UserId, PublicKeys>,
    key_fetches: HashMap<UserId, usize>,
    group_versions: HashMap<GroupId, KeyVersion>,
    sealed_keys: HashMap<(GroupId, UserId), Vec<SealedGroupKey>>,
    direct_messages: HashMap<UserId, Vec<EncryptedPayload>>,
    group_messages: HashMap<GroupId, Vec<EncryptedPayload>>,
    offline: bool,
}

/// Chat server living in memory: key directory, group key versions with compare-and-swap,
/// sealed key mailboxes and message inboxes.
///
/// Clones share the same state.
#[derive(Clone, Debug, Default)]
pub struct MemoryTransport {
    inner: Arc<RwLock<MemoryTransportInner>>,
    latency: Option<Duration>,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Delays every request by the given duration.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    /// Registers the public keys of a user in the key directory, replacing previous ones.
    pub async fn publish_public_keys(&self, keys: &UserKeys) {
        self.inner
            .write()
            .await
            .directory
            .insert(keys.user_id().clone(), keys.public_keys());
    }

    /// Makes every request fail as if the server was unreachable.
    pub async fn set_offline(&self, offline: bool) {
        self.inner.write().await.offline = offline;
    }

    /// Number of key directory requests made for this user.
    pub async fn key_fetches(&self, user_id: &UserId) -> usize {
        self.inner
            .read()
            .await
            .key_fetches
            .get(user_id)
            .copied()
            .unwrap_or_default()
    }

    pub async fn group_key_version(&self, group_id: &GroupId) -> Option<KeyVersion> {
        self.inner.read().await.group_versions.get(group_id).copied()
    }

    /// Sealed key copies the server holds for this member.
    pub async fn sealed_keys(&self, group_id: &GroupId, member_id: &UserId) -> Vec<SealedGroupKey> {
        self.inner
            .read()
            .await
            .sealed_keys
            .get(&(group_id.clone(), member_id.clone()))
            .cloned()
            .unwrap_or_default()
    }

    /// Puts a sealed key into a member's mailbox without any checks.
    pub async fn deliver_sealed_key(&self, sealed: SealedGroupKey) {
        self.inner
            .write()
            .await
            .sealed_keys
            .entry((sealed.group_id.clone(), sealed.member_id.clone()))
            .or_default()
            .push(sealed);
    }

    pub async fn direct_messages(&self, recipient_id: &UserId) -> Vec<EncryptedPayload> {
        self.inner
            .read()
            .await
            .direct_messages
            .get(recipient_id)
            .cloned()
            .unwrap_or_default()
    }

    pub async fn group_messages(&self, group_id: &GroupId) -> Vec<EncryptedPayload> {
        self.inner
            .read()
            .await
            .group_messages
            .get(group_id)
            .cloned()
            .unwrap_or_default()
    }

    async fn request(&self) -> Result<(), TransportError> {
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
        if self.inner.read().await.offline {
            return Err(TransportError::Unavailable("server is offline".into()));
        }
        Ok(())
    }
}

impl Transport for MemoryTransport {
    async fn fetch_public_keys(
        &self,
        _session: &Session,
        user_id: &UserId,
    ) -> Result<PublicKeys, TransportError> {
        {
            let mut inner = self.inner.write().await;
            *inner.key_fetches.entry(user_id.clone()).or_default() += 1;
        }
        self.request().await?;
        self.inner
            .read()
            .await
            .directory
            .get(user_id)
            .copied()
            .ok_or(TransportError::NotFound)
    }

    async fn fetch_group_key_version(
        &self,
        _session: &Session,
        group_id: &GroupId,
    ) -> Result<Option<KeyVersion>, TransportError> {
        self.request().await?;
        Ok(self.group_key_version(group_id).await)
    }

    async fn post_direct_message(
        &self,
        _session: &Session,
        recipient_id: &UserId,
        payload: &EncryptedPayload,
    ) -> Result<(), TransportError> {
        self.request().await?;
        self.inner
            .write()
            .await
            .direct_messages
            .entry(recipient_id.clone())
            .or_default()
            .push(payload.clone());
        Ok(())
    }

    async fn post_group_message(
        &self,
        _session: &Session,
        group_id: &GroupId,
        payload: &EncryptedPayload,
    ) -> Result<(), TransportError> {
        self.request().await?;
        let mut inner = self.inner.write().await;
        if payload.key_version() != inner.group_versions.get(group_id).copied() {
            return Err(TransportError::Rejected("outdated group key version".into()));
        }
        inner
            .group_messages
            .entry(group_id.clone())
            .or_default()
            .push(payload.clone());
        Ok(())
    }

    async fn publish_group_key(
        &self,
        _session: &Session,
        group_id: &GroupId,
        expected_previous: Option<KeyVersion>,
        version: KeyVersion,
        sealed_keys: Vec<SealedGroupKey>,
    ) -> Result<PublishOutcome, TransportError> {
        self.request().await?;
        let mut inner = self.inner.write().await;

        let current = inner.group_versions.get(group_id).copied();
        if current != expected_previous || version != expected_previous.map_or(1, |v| v + 1) {
            return Ok(PublishOutcome::Conflict { current });
        }

        inner.group_versions.insert(group_id.clone(), version);
        for sealed in sealed_keys {
            inner
                .sealed_keys
                .entry((group_id.clone(), sealed.member_id.clone()))
                .or_default()
                .push(sealed);
        }
        Ok(PublishOutcome::Accepted)
    }

    async fn fetch_sealed_group_keys(
        &self,
        session: &Session,
        group_id: &GroupId,
    ) -> Result<Vec<SealedGroupKey>, TransportError> {
        self.request().await?;
        Ok(self.sealed_keys(group_id, session.user_id()).await)
    }
}
