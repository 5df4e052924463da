// SPDX-License-Identifier: MIT OR Apache-2.0

//! Edwards-Curve Digital Signature Algorithm (EdDSA) related to Curve25519 using SHA-512.
use std::fmt;

use ed25519_dalek::{Signer, Verifier};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::crypto::Secret;

pub const SIGNING_KEY_SIZE: usize = 32;
pub const VERIFYING_KEY_SIZE: usize = 32;
pub const SIGNATURE_SIZE: usize = 64;

/// Secret Ed25519 key, kept separate from the encryption key.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SigningKey(Secret<SIGNING_KEY_SIZE>);

impl SigningKey {
    pub(crate) fn from_bytes(bytes: [u8; SIGNING_KEY_SIZE]) -> Self {
        SigningKey(Secret::from_bytes(bytes))
    }

    pub fn verifying_key(&self) -> VerifyingKey {
        let signing_key = ed25519_dalek::SigningKey::from_bytes(self.0.as_bytes());
        VerifyingKey(signing_key.verifying_key().to_bytes())
    }

    pub fn sign(&self, bytes: &[u8]) -> Signature {
        let signing_key = ed25519_dalek::SigningKey::from_bytes(self.0.as_bytes());
        Signature(signing_key.sign(bytes).to_bytes())
    }
}

/// Public Ed25519 key.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct VerifyingKey(#[serde(with = "serde_bytes")] [u8; VERIFYING_KEY_SIZE]);

impl VerifyingKey {
    pub fn from_bytes(bytes: [u8; VERIFYING_KEY_SIZE]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; VERIFYING_KEY_SIZE] {
        &self.0
    }

    pub fn to_bytes(self) -> [u8; VERIFYING_KEY_SIZE] {
        self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.as_bytes())
    }

    pub fn verify(&self, bytes: &[u8], signature: &Signature) -> Result<(), SignatureError> {
        let verifying_key = ed25519_dalek::VerifyingKey::from_bytes(&self.0)
            .map_err(|_| SignatureError::InvalidVerifyingKey)?;
        verifying_key
            .verify(bytes, &ed25519_dalek::Signature::from_bytes(&signature.0))
            .map_err(|_| SignatureError::VerificationFailed)
    }
}

impl fmt::Display for VerifyingKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

/// 512-bit Ed25519 signature.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Signature(#[serde(with = "serde_bytes")] [u8; SIGNATURE_SIZE]);

impl Signature {
    pub fn from_bytes(bytes: [u8; SIGNATURE_SIZE]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; SIGNATURE_SIZE] {
        &self.0
    }

    pub fn to_bytes(self) -> [u8; SIGNATURE_SIZE] {
        self.0
    }
}

#[derive(Debug, Error)]
pub enum SignatureError {
    #[error("signature does not match public key and payload")]
    VerificationFailed,

    #[error("bytes do not represent a valid ed25519 verifying key")]
    InvalidVerifyingKey,
}
