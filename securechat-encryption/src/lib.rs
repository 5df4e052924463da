// SPDX-License-Identifier: MIT OR Apache-2.0

//! `securechat-encryption` is the end-to-end encryption core of a client-server chat application.
//!
//! The server only ever sees ciphertext. It stores public keys in a key directory, relays
//! encrypted payloads and keeps track of the current key version of every group, everything else
//! happens on the clients.
//!
//! ## Keys
//!
//! Every user holds two long-term key pairs: an X25519 pair for encryption and a separate Ed25519
//! pair for signing. They are generated on first use by the [`KeyStore`] and persisted through a
//! [`KeyPairStore`](traits::KeyPairStore) implementation. Public keys of other users are fetched
//! from the key directory and cached in a [`PeerKeyCache`].
//!
//! ## Direct messages
//!
//! The [`DirectMessageCodec`] derives a symmetric key from an X25519 agreement between sender and
//! recipient (HKDF-SHA256) and encrypts the message with XChaCha20-Poly1305. The header names
//! both encryption public keys, the ciphertext and its header are signed with the sender's Ed25519
//! key. A message whose signature doesn't match the sender's published key is still opened and
//! flagged as unverified.
//!
//! ## Group messages
//!
//! Groups share a symmetric key which is versioned per membership epoch. The
//! [`GroupKeyManager`] creates version 1 when a group is initialized and a new version on every
//! membership change, sealing each member's copy with HPKE towards their encryption key. Removed
//! members never receive a version created after their removal. The [`GroupMessageCodec`] stamps
//! the key version into every message so receivers can pick the matching key, messages from
//! versions they never received are reported as undecryptable rather than as an error.
//!
//! ## Security info
//!
//! Receivers never trust the sender's claims about a message's protection. The
//! [`SecurityInfoReporter`] derives the `security_info` shown next to a message from what actually
//! happened during decryption and verification. A message with an invalid signature is still
//! shown, flagged as unverified. There is no fallback to plaintext under any failure.
//!
//! ## Usage
//!
//! Applications usually only interact with the [`Messenger`] which bundles all of the above for
//! one logged-in user and talks to the server through a [`Transport`](traits::Transport)
//! implementation.
mod cbor;
mod config;
pub mod crypto;
mod direct;
pub mod group;
mod identity;
mod key_store;
mod locks;
mod message;
mod messenger;
mod peer_keys;
mod security;
mod session;
#[cfg(any(test, feature = "test_utils"))]
pub mod test_utils;
pub mod traits;
mod types;

pub use cbor::{DecodeError, EncodeError};
pub use config::Config;
pub use direct::{DIRECT_ALGORITHM, DirectMessageCodec};
pub use group::{
    GROUP_ALGORITHM, GroupKey, GroupKeyError, GroupKeyManager, GroupMessageCodec, SealedGroupKey,
};
pub use identity::{EncryptionKeyPair, PublicKeys, SigningKeyPair, UserKeys};
pub use key_store::{KeyStore, KeyStoreError};
pub use message::{
    CodecError, EncryptedPayload, Opened, PayloadHeader, SentMessage, Target,
};
pub use messenger::{FailureReason, Messenger, MessengerError, Received};
pub use peer_keys::{KeyResolutionError, PeerKeyCache, PeerKeyRecord};
pub use security::{Flow, SecurityFeatures, SecurityInfo, SecurityInfoReporter};
pub use session::Session;
pub use types::{GroupId, KeyVersion, Timestamp, UserId};
