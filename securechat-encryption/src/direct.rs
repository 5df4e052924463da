// SPDX-License-Identifier: MIT OR Apache-2.0

//! End-to-end encryption of one-to-one messages.
//!
//! Sender and recipient derive a shared key from an X25519 agreement between their encryption
//! key pairs (HKDF-SHA256), the message is encrypted with XChaCha20-Poly1305 under a random nonce
//! and signed with the sender's Ed25519 signing key.
//!
//! Both encryption public keys travel in the payload header. Since the agreement is symmetric the
//! sender can later decrypt their own sent messages, and a recipient can still open a message
//! after the sender rotated their keys.
use std::sync::Arc;

use tracing::{debug, warn};

use crate::config::Config;
use crate::crypto::Rng;
use crate::crypto::hkdf::hkdf;
use crate::crypto::x25519::{PublicKey, SecretKey};
use crate::crypto::xchacha20::{XAEAD_KEY_SIZE, x_aead_decrypt, x_aead_encrypt};
use crate::crypto::Secret;
use crate::identity::UserKeys;
use crate::message::{
    CodecError, EncryptedPayload, Opened, PayloadHeader, SentMessage, Target, signing_digest,
};
use crate::peer_keys::PeerKeyCache;
use crate::security::{Flow, SecurityInfoReporter};
use crate::session::Session;
use crate::traits::{Transport, with_timeout};
use crate::types::{UserId, now};

/// Algorithm identifier reported for direct messages.
pub const DIRECT_ALGORITHM: &str = "X25519-HKDF-SHA256/XChaCha20-Poly1305/Ed25519";

const KDF_INFO: &[u8] = b"securechat-direct-v1";

const SIGNATURE_DOMAIN: &[u8] = b"securechat-direct-signature-v1";

#[derive(Debug)]
pub struct DirectMessageCodec<T> {
    transport: Arc<T>,
    peers: Arc<PeerKeyCache<T>>,
    rng: Arc<Rng>,
    config: Config,
}

impl<T> DirectMessageCodec<T>
where
    T: Transport,
{
    pub fn new(
        transport: Arc<T>,
        peers: Arc<PeerKeyCache<T>>,
        rng: Arc<Rng>,
        config: Config,
    ) -> Self {
        Self {
            transport,
            peers,
            rng,
            config,
        }
    }

    /// Encrypts a message for the recipient and signs it.
    ///
    /// Fails if the recipient's keys can not be resolved, there is no fallback to plaintext.
    pub async fn encrypt_and_sign(
        &self,
        session: &Session,
        sender_keys: &UserKeys,
        recipient_id: &UserId,
        plaintext: &[u8],
    ) -> Result<EncryptedPayload, CodecError> {
        let recipient_key = if recipient_id == sender_keys.user_id() {
            *sender_keys.encryption_key_pair().public_key()
        } else {
            self.peers.resolve(session, recipient_id).await?.public_key
        };

        let sender_key = *sender_keys.encryption_key_pair().public_key();
        let header = PayloadHeader {
            sender_id: sender_keys.user_id().clone(),
            target: Target::Direct {
                recipient_id: recipient_id.clone(),
                sender_key,
                recipient_key,
            },
            sent_at: now(),
        };
        let aad = header.to_bytes()?;

        let key = derive_key(
            sender_keys.encryption_key_pair().secret_key(),
            &recipient_key,
            &sender_key,
            &recipient_key,
        )?;
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

    /// Encrypts and signs a message and posts it to the server.
    ///
    /// Nothing is posted if any step fails.
    pub async fn send(
        &self,
        session: &Session,
        sender_keys: &UserKeys,
        recipient_id: &UserId,
        plaintext: &[u8],
    ) -> Result<SentMessage, CodecError> {
        let payload = self
            .encrypt_and_sign(session, sender_keys, recipient_id, plaintext)
            .await?;

        with_timeout(
            self.config.transport_timeout(),
            self.transport
                .post_direct_message(session, recipient_id, &payload),
        )
        .await?;
        debug!(sender = %sender_keys.user_id(), %recipient_id, "sent direct message");

        Ok(SentMessage {
            security_features: SecurityInfoReporter::features(&payload),
            payload,
        })
    }

    /// Decrypts a direct message and verifies its signature.
    ///
    /// The message key is agreed on the encryption keys named in the header, decryption never
    /// depends on the key directory. The sender's published signing key only decides whether the
    /// message is `verified`, an invalid signature does not fail the operation.
    ///
    /// If the header names another encryption key of the sender than the cached one, the sender
    /// probably rotated their keys and the cached record is refetched once.
    pub async fn decrypt_and_verify(
        &self,
        session: &Session,
        receiver_keys: &UserKeys,
        payload: &EncryptedPayload,
    ) -> Result<Opened, CodecError> {
        let Target::Direct {
            recipient_id,
            sender_key,
            recipient_key,
        } = &payload.header.target
        else {
            return Err(CodecError::UnexpectedFlow {
                expected: Flow::Direct,
            });
        };

        let own_id = receiver_keys.user_id();
        let sender_id = &payload.header.sender_id;
        let their_key = if recipient_id == own_id {
            sender_key
        } else if sender_id == own_id {
            recipient_key
        } else {
            return Err(CodecError::NotAddressedToUs);
        };

        let aad = payload.header.to_bytes()?;
        let key = derive_key(
            receiver_keys.encryption_key_pair().secret_key(),
            their_key,
            sender_key,
            recipient_key,
        )?;
        let plaintext =
            x_aead_decrypt(key.as_bytes(), &payload.ciphertext, payload.nonce, Some(&aad))
                .map_err(|_| CodecError::DecryptionFailed)?;

        let digest = signing_digest(
            SIGNATURE_DOMAIN,
            &aad,
            &payload.nonce,
            &payload.ciphertext,
        );

        // Sent messages and notes to self never need the key directory.
        if sender_id == own_id {
            let verified = receiver_keys
                .signing_key_pair()
                .verifying_key()
                .verify(&digest, &payload.signature)
                .is_ok();
            return Ok(Opened {
                plaintext,
                verified,
            });
        }

        let record = self.peers.resolve(session, sender_id).await?;
        let mut verified = record
            .signing_public_key
            .verify(&digest, &payload.signature)
            .is_ok();

        if !verified && record.public_key != *sender_key {
            match self.peers.refresh(session, sender_id).await {
                Ok((record, true)) => {
                    debug!(%sender_id, "verify direct message again with refreshed keys");
                    verified = record
                        .signing_public_key
                        .verify(&digest, &payload.signature)
                        .is_ok();
                }
                Ok((_, false)) => (),
                Err(err) => warn!(%sender_id, "could not refresh peer keys: {err}"),
            }
        }

        if !verified {
            warn!(%sender_id, "direct message has an invalid signature");
        }

        Ok(Opened {
            plaintext,
            verified,
        })
    }
}

/// Derives the symmetric message key shared between sender and recipient.
fn derive_key(
    secret_key: &SecretKey,
    their_key: &PublicKey,
    sender_key: &PublicKey,
    recipient_key: &PublicKey,
) -> Result<Secret<XAEAD_KEY_SIZE>, CodecError> {
    let shared_secret = secret_key.calculate_agreement(their_key)?;
    let salt = [sender_key.as_bytes().as_slice(), recipient_key.as_bytes()].concat();
    let key = hkdf(&salt, shared_secret.as_bytes(), Some(KDF_INFO))?;
    Ok(Secret::from_bytes(key))
}
