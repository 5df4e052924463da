// SPDX-License-Identifier: MIT OR Apache-2.0

//! Long-term key material of a user.
//!
//! Every user holds two independent key pairs: an X25519 pair for confidentiality (direct message
//! key agreement and receiving sealed group keys) and an Ed25519 pair for authenticity (signing
//! every outgoing payload).
use serde::{Deserialize, Serialize};

use crate::crypto::ed25519::{SigningKey, VerifyingKey};
use crate::crypto::x25519::{PublicKey, SecretKey};
use crate::crypto::{Rng, RngError};
use crate::types::{Timestamp, UserId, now};

/// X25519 key pair used for encryption.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptionKeyPair {
    secret_key: SecretKey,
    public_key: PublicKey,
}

impl EncryptionKeyPair {
    pub(crate) fn generate(rng: &Rng) -> Result<Self, RngError> {
        let secret_key = SecretKey::from_bytes(rng.random_array()?);
        Ok(Self {
            public_key: secret_key.public_key(),
            secret_key,
        })
    }

    pub fn public_key(&self) -> &PublicKey {
        &self.public_key
    }

    pub(crate) fn secret_key(&self) -> &SecretKey {
        &self.secret_key
    }
}

/// Ed25519 key pair used for signing.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SigningKeyPair {
    signing_key: SigningKey,
    verifying_key: VerifyingKey,
}

impl SigningKeyPair {
    pub(crate) fn generate(rng: &Rng) -> Result<Self, RngError> {
        let signing_key = SigningKey::from_bytes(rng.random_array()?);
        Ok(Self {
            verifying_key: signing_key.verifying_key(),
            signing_key,
        })
    }

    pub fn verifying_key(&self) -> &VerifyingKey {
        &self.verifying_key
    }

    pub(crate) fn signing_key(&self) -> &SigningKey {
        &self.signing_key
    }
}

/// Both key pairs of one user.
///
/// Serializable for local persistence only, the secret halves are never sent over the wire.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserKeys {
    pub(crate) user_id: UserId,
    pub(crate) encryption: EncryptionKeyPair,
    pub(crate) signing: SigningKeyPair,
    pub(crate) created_at: Timestamp,
}

impl UserKeys {
    pub(crate) fn generate(user_id: UserId, rng: &Rng) -> Result<Self, RngError> {
        Ok(Self {
            user_id,
            encryption: EncryptionKeyPair::generate(rng)?,
            signing: SigningKeyPair::generate(rng)?,
            created_at: now(),
        })
    }

    pub fn user_id(&self) -> &UserId {
        &self.user_id
    }

    pub fn encryption_key_pair(&self) -> &EncryptionKeyPair {
        &self.encryption
    }

    pub fn signing_key_pair(&self) -> &SigningKeyPair {
        &self.signing
    }

    pub fn created_at(&self) -> Timestamp {
        self.created_at
    }

    /// Public halves of both key pairs, ready to be published to the key directory.
    pub fn public_keys(&self) -> PublicKeys {
        PublicKeys {
            public_key: self.encryption.public_key,
            signing_public_key: self.signing.verifying_key,
        }
    }
}

/// Public keys of a user as published in the key directory (`GET /users/{id}/key`).
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PublicKeys {
    pub public_key: PublicKey,
    pub signing_public_key: VerifyingKey,
}
