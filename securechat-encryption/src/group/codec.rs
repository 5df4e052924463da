// SPDX-License-Identifier: MIT OR Apache-2.0

use std::sync::Arc;

use tracing::{debug, warn};

use crate::config::Config;
use crate::crypto::Rng;
use crate::crypto::xchacha20::{x_aead_decrypt, x_aead_encrypt};
use crate::group::{GroupKey, GroupKeyError, GroupKeyManager};
use crate::identity::UserKeys;
use crate::message::{
    CodecError, EncryptedPayload, Opened, PayloadHeader, SentMessage, Target, signing_digest,
};
use crate::peer_keys::PeerKeyCache;
use crate::security::{Flow, SecurityInfoReporter};
use crate::session::Session;
use crate::traits::{Transport, with_timeout};
use crate::types::{GroupId, KeyVersion, now};

/// Algorithm identifier reported for group messages.
pub const GROUP_ALGORITHM: &str = "XChaCha20-Poly1305/Ed25519";

const SIGNATURE_DOMAIN: &[u8] = b"securechat-group-signature-v1";

/// Encrypts group messages under the current group key and opens them with the key of their
/// declared version.
#[derive(Debug)]
pub struct GroupMessageCodec<T> {
    transport: Arc<T>,
    peers: Arc<PeerKeyCache<T>>,
    keys: Arc<GroupKeyManager<T>>,
    rng: Arc<Rng>,
    config: Config,
}

impl<T> GroupMessageCodec<T>
where
    T: Transport,
{
    pub fn new(
        transport: Arc<T>,
        peers: Arc<PeerKeyCache<T>>,
        keys: Arc<GroupKeyManager<T>>,
        rng: Arc<Rng>,
        config: Config,
    ) -> Self {
        Self {
            transport,
            peers,
            keys,
            rng,
            config,
        }
    }

    /// Encrypts a message under the current group key and signs it.
    ///
    /// Fails with [`CodecError::OutdatedGroupKey`] if the server knows a newer key version which
    /// we could not obtain, for example because we were removed from the group.
    pub async fn encrypt_and_sign(
        &self,
        session: &Session,
        sender_keys: &UserKeys,
        group_id: &GroupId,
        plaintext: &[u8],
    ) -> Result<EncryptedPayload, CodecError> {
        let key = self.up_to_date_key(session, sender_keys, group_id).await?;

        let header = PayloadHeader {
            sender_id: sender_keys.user_id().clone(),
            target: Target::Group {
                group_id: group_id.clone(),
                key_version: key.version(),
            },
            sent_at: now(),
        };
        let aad = header.to_bytes()?;

        let nonce = self.rng.random_array()?;
        let ciphertext = x_aead_encrypt(key.as_bytes(), plaintext, nonce, Some(&aad))
            .map_err(CodecError::Encryption)?;

        let digest = signing_digest(SIGNATURE_DOMAIN, &aad, &nonce, &ciphertext);
        let signature = sender_keys.signing_key_pair().signing_key().sign(&digest);

        Ok(EncryptedPayload {
            header,
            ciphertext,
            nonce,
            signature,
        })
    }

    /// Encrypts and signs a group message and posts it to the server.
    pub async fn send(
        &self,
        session: &Session,
        sender_keys: &UserKeys,
        group_id: &GroupId,
        plaintext: &[u8],
    ) -> Result<SentMessage, CodecError> {
        let payload = self
            .encrypt_and_sign(session, sender_keys, group_id, plaintext)
            .await?;

        with_timeout(
            self.config.transport_timeout(),
            self.transport.post_group_message(session, group_id, &payload),
        )
        .await?;
        debug!(
            sender = %sender_keys.user_id(),
            %group_id,
            version = payload.key_version(),
            "sent group message"
        );

        Ok(SentMessage {
            security_features: SecurityInfoReporter::features(&payload),
            payload,
        })
    }

    /// Decrypts a group message with the key of its declared version and verifies the signature.
    ///
    /// Fails with [`GroupKeyError::UnknownKeyVersion`] when we never received that version, which
    /// is expected for messages sent before we joined or after we were removed.
    pub async fn decrypt_and_verify(
        &self,
        session: &Session,
        receiver_keys: &UserKeys,
        payload: &EncryptedPayload,
    ) -> Result<Opened, CodecError> {
        let Target::Group {
            group_id,
            key_version,
        } = &payload.header.target
        else {
            return Err(CodecError::UnexpectedFlow {
                expected: Flow::Group,
            });
        };

        let key = self
            .key_for_version(session, receiver_keys, group_id, *key_version)
            .await?;

        let aad = payload.header.to_bytes()?;
        let plaintext = x_aead_decrypt(key.as_bytes(), &payload.ciphertext, payload.nonce, Some(&aad))
            .map_err(|_| CodecError::DecryptionFailed)?;

        let digest = signing_digest(
            SIGNATURE_DOMAIN,
            &aad,
            &payload.nonce,
            &payload.ciphertext,
        );
        let sender_id = &payload.header.sender_id;
        let mut verified = if sender_id == receiver_keys.user_id() {
            receiver_keys
                .signing_key_pair()
                .verifying_key()
                .verify(&digest, &payload.signature)
                .is_ok()
        } else {
            let record = self.peers.resolve(session, sender_id).await?;
            if record.signing_public_key.verify(&digest, &payload.signature).is_ok() {
                true
            } else {
                // Cached signing key might be stale, only trust a key which actually changed.
                match self.peers.refresh(session, sender_id).await {
                    Ok((record, true)) => record
                        .signing_public_key
                        .verify(&digest, &payload.signature)
                        .is_ok(),
                    Ok((_, false)) => false,
                    Err(err) => {
                        warn!(%sender_id, "could not refresh peer keys: {err}");
                        false
                    }
                }
            }
        };

        // The key must have existed when the message was written.
        let latest_creation = payload
            .sent_at()
            .saturating_add(self.config.clock_skew().as_secs());
        if key.created_at() > latest_creation {
            warn!(
                %group_id,
                version = key_version,
                sent_at = payload.sent_at(),
                created_at = key.created_at(),
                "group message predates its key version"
            );
            verified = false;
        }

        if !verified {
            warn!(%sender_id, %group_id, "group message has an invalid signature");
        }

        Ok(Opened {
            plaintext,
            verified,
        })
    }

    /// Returns the current group key after making sure the server doesn't know a newer one.
    async fn up_to_date_key(
        &self,
        session: &Session,
        sender_keys: &UserKeys,
        group_id: &GroupId,
    ) -> Result<GroupKey, CodecError> {
        let remote = self.keys.remote_version(session, group_id).await?;

        let local = match self.keys.current_key(group_id).await {
            Ok(key) => Some(key),
            Err(GroupKeyError::NoGroupKey(_)) => None,
            Err(err) => return Err(err.into()),
        };

        if let Some(key) = local.filter(|key| remote.is_none_or(|remote| key.version() >= remote)) {
            return Ok(key);
        }

        self.keys.sync(session, sender_keys, group_id).await?;
        let key = self.keys.current_key(group_id).await?;
        match remote {
            Some(remote) if key.version() < remote => Err(CodecError::OutdatedGroupKey {
                local: key.version(),
                remote,
            }),
            _ => Ok(key),
        }
    }

    /// Looks up a key version, pulling new sealed keys from the server once if it is missing.
    async fn key_for_version(
        &self,
        session: &Session,
        receiver_keys: &UserKeys,
        group_id: &GroupId,
        version: KeyVersion,
    ) -> Result<GroupKey, CodecError> {
        match self.keys.key_for_version(group_id, version).await {
            Ok(key) => return Ok(key),
            Err(GroupKeyError::UnknownKeyVersion { .. }) => (),
            Err(err) => return Err(err.into()),
        }

        if let Err(err) = self.keys.sync(session, receiver_keys, group_id).await {
            warn!(%group_id, version, "could not sync group keys: {err}");
        }

        Ok(self.keys.key_for_version(group_id, version).await?)
    }
}
