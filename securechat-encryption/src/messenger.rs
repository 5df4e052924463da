// SPDX-License-Identifier: MIT OR Apache-2.0

//! Single entry point for applications sending and receiving end-to-end encrypted messages.
use std::fmt;
use std::sync::Arc;

use thiserror::Error;
use tracing::debug;

use crate::config::Config;
use crate::crypto::Rng;
use crate::direct::DirectMessageCodec;
use crate::group::{GroupKey, GroupKeyError, GroupKeyManager, GroupMessageCodec};
use crate::identity::{PublicKeys, UserKeys};
use crate::key_store::{KeyStore, KeyStoreError};
use crate::message::{CodecError, EncryptedPayload, Opened, SentMessage};
use crate::peer_keys::PeerKeyCache;
use crate::security::{Flow, SecurityInfo, SecurityInfoReporter};
use crate::session::Session;
use crate::traits::{KeyPairStore, Transport};
use crate::types::{GroupId, KeyVersion, UserId};

/// Bundles key store, both codecs and the group key manager for one logged-in user.
#[derive(Debug)]
pub struct Messenger<T, S> {
    session: Session,
    key_store: Arc<KeyStore<S>>,
    peers: Arc<PeerKeyCache<T>>,
    group_keys: Arc<GroupKeyManager<T>>,
    direct: DirectMessageCodec<T>,
    group: GroupMessageCodec<T>,
}

impl<T, S> Messenger<T, S>
where
    T: Transport,
    S: KeyPairStore,
{
    pub fn new(
        session: Session,
        transport: Arc<T>,
        key_store: Arc<KeyStore<S>>,
        rng: Arc<Rng>,
        config: Config,
    ) -> Self {
        let peers = Arc::new(PeerKeyCache::new(transport.clone(), config.clone()));
        let group_keys = Arc::new(GroupKeyManager::new(
            transport.clone(),
            peers.clone(),
            rng.clone(),
            config.clone(),
        ));
        let direct =
            DirectMessageCodec::new(transport.clone(), peers.clone(), rng.clone(), config.clone());
        let group = GroupMessageCodec::new(transport, peers.clone(), group_keys.clone(), rng, config);

        Self {
            session,
            key_store,
            peers,
            group_keys,
            direct,
            group,
        }
    }

    pub fn user_id(&self) -> &UserId {
        self.session.user_id()
    }

    /// Our key pairs, created on first use.
    pub async fn keys(&self) -> Result<Arc<UserKeys>, MessengerError> {
        Ok(self
            .key_store
            .get_or_create_key_pairs(self.session.user_id())
            .await?)
    }

    /// Our public keys for registering them in the key directory.
    pub async fn public_keys(&self) -> Result<PublicKeys, MessengerError> {
        self.keys().await?;
        Ok(self
            .key_store
            .export_public_keys(self.session.user_id())
            .await?)
    }

    /// Replaces our key pairs. The new public keys need to be published to the key directory
    /// before peers can verify our messages again.
    pub async fn rotate_keys(&self) -> Result<Arc<UserKeys>, MessengerError> {
        Ok(self
            .key_store
            .rotate_key_pairs(self.session.user_id())
            .await?)
    }

    pub fn peers(&self) -> &PeerKeyCache<T> {
        &self.peers
    }

    pub fn group_keys(&self) -> &GroupKeyManager<T> {
        &self.group_keys
    }

    pub async fn send_direct(
        &self,
        recipient_id: &UserId,
        plaintext: &[u8],
    ) -> Result<SentMessage, MessengerError> {
        let keys = self.keys().await?;
        Ok(self
            .direct
            .send(&self.session, &keys, recipient_id, plaintext)
            .await?)
    }

    pub async fn send_group(
        &self,
        group_id: &GroupId,
        plaintext: &[u8],
    ) -> Result<SentMessage, MessengerError> {
        let keys = self.keys().await?;
        Ok(self
            .group
            .send(&self.session, &keys, group_id, plaintext)
            .await?)
    }

    /// Opens a received payload.
    ///
    /// Cryptographic failures never surface as errors, they are reported as
    /// [`Received::Failed`] without exposing any plaintext. Only a failing local key store is
    /// returned as an error.
    pub async fn receive(&self, payload: &EncryptedPayload) -> Result<Received, MessengerError> {
        let keys = self.keys().await?;

        let result = match payload.flow() {
            Flow::Direct => {
                self.direct
                    .decrypt_and_verify(&self.session, &keys, payload)
                    .await
            }
            Flow::Group => {
                self.group
                    .decrypt_and_verify(&self.session, &keys, payload)
                    .await
            }
        };

        let received = match result {
            Ok(Opened {
                plaintext,
                verified,
            }) => {
                let flow = payload.flow();
                let security_info = SecurityInfoReporter::report(
                    true,
                    verified,
                    flow.algorithm(),
                    payload.key_version(),
                    flow,
                );
                if verified {
                    Received::Verified {
                        plaintext,
                        security_info,
                    }
                } else {
                    Received::Unverified {
                        plaintext,
                        security_info,
                    }
                }
            }
            Err(err) => {
                debug!(sender = %payload.sender_id(), "could not open message: {err}");
                Received::Failed {
                    reason: FailureReason::from(&err),
                    security_info: SecurityInfoReporter::failed(payload),
                }
            }
        };
        Ok(received)
    }

    /// Creates the first key of a new group and distributes it to all members.
    pub async fn create_group(
        &self,
        group_id: &GroupId,
        member_ids: &[UserId],
    ) -> Result<GroupKey, MessengerError> {
        let keys = self.keys().await?;
        Ok(self
            .group_keys
            .initialize_group(&self.session, &keys, group_id, member_ids)
            .await?)
    }

    /// Rotates the group key after members were added or removed.
    pub async fn membership_changed(
        &self,
        group_id: &GroupId,
        new_member_ids: &[UserId],
    ) -> Result<GroupKey, MessengerError> {
        let keys = self.keys().await?;
        Ok(self
            .group_keys
            .rotate_key(&self.session, &keys, group_id, new_member_ids)
            .await?)
    }

    /// Fetches group keys which were distributed to us.
    pub async fn sync_group(&self, group_id: &GroupId) -> Result<Vec<KeyVersion>, MessengerError> {
        let keys = self.keys().await?;
        Ok(self
            .group_keys
            .sync(&self.session, &keys, group_id)
            .await?)
    }
}

/// Outcome of opening a received message.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Received {
    Verified {
        plaintext: Vec<u8>,
        security_info: SecurityInfo,
    },
    /// Decrypted, but the signature did not match the sender's known signing key.
    Unverified {
        plaintext: Vec<u8>,
        security_info: SecurityInfo,
    },
    Failed {
        reason: FailureReason,
        security_info: SecurityInfo,
    },
}

impl Received {
    pub fn plaintext(&self) -> Option<&[u8]> {
        match self {
            Received::Verified { plaintext, .. } | Received::Unverified { plaintext, .. } => {
                Some(plaintext)
            }
            Received::Failed { .. } => None,
        }
    }

    pub fn security_info(&self) -> &SecurityInfo {
        match self {
            Received::Verified { security_info, .. }
            | Received::Unverified { security_info, .. }
            | Received::Failed { security_info, .. } => security_info,
        }
    }
}

/// Why a received message could not be opened.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FailureReason {
    DecryptionFailed,
    /// Message uses a group key version we never received.
    UnknownKeyVersion,
    /// Sender's keys could not be fetched, worth trying again later.
    KeyResolutionFailed,
    /// Payload is not meant for us or can't be processed.
    Malformed,
}

impl FailureReason {
    pub fn is_retryable(&self) -> bool {
        matches!(self, FailureReason::KeyResolutionFailed)
    }
}

impl From<&CodecError> for FailureReason {
    fn from(err: &CodecError) -> Self {
        match err {
            CodecError::DecryptionFailed => FailureReason::DecryptionFailed,
            CodecError::GroupKey(GroupKeyError::UnknownKeyVersion { .. }) => {
                FailureReason::UnknownKeyVersion
            }
            CodecError::KeyResolution(_)
            | CodecError::Transport(_)
            | CodecError::GroupKey(GroupKeyError::KeyResolution(_))
            | CodecError::GroupKey(GroupKeyError::VersionResolution { .. }) => {
                FailureReason::KeyResolutionFailed
            }
            _ => FailureReason::Malformed,
        }
    }
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let reason = match self {
            FailureReason::DecryptionFailed => "decryption_failed",
            FailureReason::UnknownKeyVersion => "unknown_key_version",
            FailureReason::KeyResolutionFailed => "key_resolution_failed",
            FailureReason::Malformed => "malformed",
        };
        write!(f, "{reason}")
    }
}

#[derive(Debug, Error)]
pub enum MessengerError {
    #[error(transparent)]
    KeyStore(#[from] KeyStoreError),

    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error(transparent)]
    GroupKey(#[from] GroupKeyError),
}
