// SPDX-License-Identifier: MIT OR Apache-2.0

//! Encrypted payloads as they cross the wire and the errors of both message codecs.
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::cbor::{DecodeError, EncodeError, decode_cbor, encode_cbor};
use crate::crypto::RngError;
use crate::crypto::ed25519::Signature;
use crate::crypto::hkdf::HkdfError;
use crate::crypto::sha2::{SHA256_DIGEST_SIZE, sha2_256};
use crate::crypto::x25519::{PublicKey, X25519Error};
use crate::crypto::xchacha20::{XAeadError, XAeadNonce};
use crate::group::GroupKeyError;
use crate::peer_keys::KeyResolutionError;
use crate::security::{Flow, SecurityFeatures};
use crate::traits::TransportError;
use crate::types::{GroupId, KeyVersion, Timestamp, UserId};

/// Addressee of a payload.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Target {
    /// Direct messages name the encryption keys the message key was agreed on, both sides can
    /// open it without asking the key directory.
    Direct {
        recipient_id: UserId,
        sender_key: PublicKey,
        recipient_key: PublicKey,
    },
    Group {
        group_id: GroupId,
        key_version: KeyVersion,
    },
}

/// Unencrypted metadata of a payload.
///
/// The header is authenticated as additional data of the AEAD and covered by the signature,
/// changing any field makes decryption and verification fail.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PayloadHeader {
    pub sender_id: UserId,
    pub target: Target,
    pub sent_at: Timestamp,
}

impl PayloadHeader {
    pub(crate) fn to_bytes(&self) -> Result<Vec<u8>, EncodeError> {
        encode_cbor(self)
    }
}

/// Encrypted and signed message. Immutable once produced.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptedPayload {
    pub(crate) header: PayloadHeader,
    #[serde(with = "serde_bytes")]
    pub(crate) ciphertext: Vec<u8>,
    #[serde(with = "serde_bytes")]
    pub(crate) nonce: XAeadNonce,
    pub(crate) signature: Signature,
}

impl EncryptedPayload {
    pub fn header(&self) -> &PayloadHeader {
        &self.header
    }

    pub fn sender_id(&self) -> &UserId {
        &self.header.sender_id
    }

    pub fn sent_at(&self) -> Timestamp {
        self.header.sent_at
    }

    pub fn flow(&self) -> Flow {
        match self.header.target {
            Target::Direct { .. } => Flow::Direct,
            Target::Group { .. } => Flow::Group,
        }
    }

    /// Group id for group messages.
    pub fn group_id(&self) -> Option<&GroupId> {
        match &self.header.target {
            Target::Direct { .. } => None,
            Target::Group { group_id, .. } => Some(group_id),
        }
    }

    /// Declared group key version for group messages.
    pub fn key_version(&self) -> Option<KeyVersion> {
        match self.header.target {
            Target::Direct { .. } => None,
            Target::Group { key_version, .. } => Some(key_version),
        }
    }

    pub fn ciphertext(&self) -> &[u8] {
        &self.ciphertext
    }

    pub fn nonce(&self) -> &XAeadNonce {
        &self.nonce
    }

    pub fn signature(&self) -> &Signature {
        &self.signature
    }

    /// Encode payload in CBOR format.
    pub fn to_bytes(&self) -> Result<Vec<u8>, EncodeError> {
        encode_cbor(self)
    }

    /// Decode payload from CBOR format.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, DecodeError> {
        decode_cbor(bytes)
    }
}

/// Digest which gets signed by the sender.
///
/// The domain separates direct from group signatures so one can't be replayed as the other.
pub(crate) fn signing_digest(
    domain: &[u8],
    header: &[u8],
    nonce: &XAeadNonce,
    ciphertext: &[u8],
) -> [u8; SHA256_DIGEST_SIZE] {
    sha2_256(&[domain, header, nonce, ciphertext])
}

/// Decrypted message.
///
/// `verified` is false when the signature did not match the sender's known signing key, the
/// plaintext is still returned so the application can display it with a warning.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Opened {
    pub plaintext: Vec<u8>,
    pub verified: bool,
}

/// Payload which was posted to the server with the metadata describing its protection.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SentMessage {
    pub payload: EncryptedPayload,
    pub security_features: SecurityFeatures,
}

#[derive(Debug, Error)]
pub enum CodecError {
    #[error(transparent)]
    KeyResolution(#[from] KeyResolutionError),

    #[error(transparent)]
    GroupKey(#[from] GroupKeyError),

    #[error("could not generate nonce: {0}")]
    Randomness(#[from] RngError),

    #[error("key agreement failed: {0}")]
    Agreement(#[from] X25519Error),

    #[error("key derivation failed: {0}")]
    Kdf(#[from] HkdfError),

    #[error("encryption failed: {0}")]
    Encryption(XAeadError),

    #[error("decryption failed")]
    DecryptionFailed,

    #[error("could not encode payload header: {0}")]
    Encode(#[from] EncodeError),

    #[error("expected {expected} message")]
    UnexpectedFlow { expected: Flow },

    #[error("message is not addressed to us")]
    NotAddressedToUs,

    #[error("local group key version {local} is behind server version {remote}")]
    OutdatedGroupKey {
        local: KeyVersion,
        remote: KeyVersion,
    },

    #[error("could not deliver message: {0}")]
    Transport(#[from] TransportError),
}

impl CodecError {
    /// Returns true if the operation might succeed when tried again later.
    pub fn is_retryable(&self) -> bool {
        match self {
            CodecError::KeyResolution(_) | CodecError::Transport(_) => true,
            CodecError::GroupKey(err) => err.is_retryable(),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::crypto::ed25519::Signature;
    use crate::crypto::x25519::PublicKey;
    use crate::security::Flow;

    use super::{EncryptedPayload, PayloadHeader, Target};

    fn payload(target: Target) -> EncryptedPayload {
        EncryptedPayload {
            header: PayloadHeader {
                sender_id: "alice".into(),
                target,
                sent_at: 1_700_000_000,
            },
            ciphertext: vec![1, 2, 3],
            nonce: [7; 24],
            signature: Signature::from_bytes([9; 64]),
        }
    }

    #[test]
    fn accessors() {
        let direct = payload(Target::Direct {
            recipient_id: "bob".into(),
            sender_key: PublicKey::from_bytes([1; 32]),
            recipient_key: PublicKey::from_bytes([2; 32]),
        });
        assert_eq!(direct.flow(), Flow::Direct);
        assert_eq!(direct.key_version(), None);
        assert_eq!(direct.group_id(), None);

        let group = payload(Target::Group {
            group_id: "friends".into(),
            key_version: 3,
        });
        assert_eq!(group.flow(), Flow::Group);
        assert_eq!(group.key_version(), Some(3));
        assert_eq!(group.group_id(), Some(&"friends".into()));
        assert_eq!(group.sender_id().as_str(), "alice");
    }

    #[test]
    fn wire_encoding() {
        let payload = payload(Target::Group {
            group_id: "friends".into(),
            key_version: 3,
        });
        let bytes = payload.to_bytes().unwrap();
        assert_eq!(EncryptedPayload::from_bytes(&bytes).unwrap(), payload);

        // Garbage does not decode.
        assert!(EncryptedPayload::from_bytes(&bytes[..bytes.len() / 2]).is_err());
    }
}
