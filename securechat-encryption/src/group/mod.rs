// SPDX-License-Identifier: MIT OR Apache-2.0

//! Group messaging under a versioned symmetric key.
//!
//! Every membership change produces a new key version which is sealed individually to each
//! member of the new member set. Members keep older versions around to read the history, members
//! who were removed never learn about newer versions.
mod codec;
mod key;
mod manager;

pub use codec::{GROUP_ALGORITHM, GroupMessageCodec};
pub use key::{GROUP_KEY_SIZE, GroupKey, GroupKeyHistory, INITIAL_KEY_VERSION, SealedGroupKey};
pub use manager::GroupKeyManager;

use thiserror::Error;

use crate::cbor::EncodeError;
use crate::crypto::RngError;
use crate::crypto::hpke::HpkeError;
use crate::peer_keys::KeyResolutionError;
use crate::traits::TransportError;
use crate::types::{GroupId, KeyVersion, UserId};

#[derive(Debug, Error)]
pub enum GroupKeyError {
    #[error("group {0} was never initialized")]
    NoGroupKey(GroupId),

    #[error("key version {version} of group {group_id} is not available")]
    UnknownKeyVersion {
        group_id: GroupId,
        version: KeyVersion,
    },

    #[error("group {0} is already initialized")]
    AlreadyInitialized(GroupId),

    #[error("group {0} needs at least one member")]
    EmptyMembership(GroupId),

    #[error("received different key material for version {version} of group {group_id}")]
    ConflictingKey {
        group_id: GroupId,
        version: KeyVersion,
    },

    #[error("could not rotate key of group {group_id} after {attempts} attempts")]
    RotationConflict { group_id: GroupId, attempts: usize },

    #[error("invalid signature of {distributor_id} on key version {version} of group {group_id}")]
    InvalidSignature {
        group_id: GroupId,
        version: KeyVersion,
        distributor_id: UserId,
    },

    #[error("sealed key version {version} of group {group_id} is addressed to someone else")]
    WrongRecipient {
        group_id: GroupId,
        version: KeyVersion,
    },

    #[error("sealed key version {version} of group {group_id} has invalid size")]
    InvalidKeyMaterial {
        group_id: GroupId,
        version: KeyVersion,
    },

    #[error(transparent)]
    KeyResolution(#[from] KeyResolutionError),

    #[error("could not resolve current key version of group {group_id}: {source}")]
    VersionResolution {
        group_id: GroupId,
        #[source]
        source: TransportError,
    },

    #[error("group key server request failed: {0}")]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Rng(#[from] RngError),

    #[error(transparent)]
    Hpke(#[from] HpkeError),

    #[error(transparent)]
    Encode(#[from] EncodeError),
}

impl GroupKeyError {
    /// Returns true if the operation might succeed when tried again later.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            GroupKeyError::KeyResolution(_)
                | GroupKeyError::VersionResolution { .. }
                | GroupKeyError::Transport(_)
                | GroupKeyError::RotationConflict { .. }
        )
    }
}
