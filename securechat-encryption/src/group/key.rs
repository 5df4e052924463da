// SPDX-License-Identifier: MIT OR Apache-2.0

//! Versioned symmetric group keys and their sealed per-member copies.
use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::cbor::encode_cbor;
use crate::crypto::ed25519::{Signature, VerifyingKey};
use crate::crypto::hpke::{HpkeCiphertext, hpke_open, hpke_seal};
use crate::crypto::sha2::sha2_256;
use crate::crypto::x25519::PublicKey;
use crate::crypto::{Rng, Secret};
use crate::group::GroupKeyError;
use crate::identity::UserKeys;
use crate::types::{GroupId, KeyVersion, Timestamp, UserId, now};

/// 256-bit symmetric group key.
pub const GROUP_KEY_SIZE: usize = 32;

/// Version of the first key of every group.
pub const INITIAL_KEY_VERSION: KeyVersion = 1;

const HPKE_INFO: &[u8] = b"securechat-group-key-v1";

const SIGNATURE_DOMAIN: &[u8] = b"securechat-group-key-signature-v1";

/// Symmetric key shared by all members of a group during one membership epoch.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GroupKey {
    group_id: GroupId,
    version: KeyVersion,
    key_material: Secret<GROUP_KEY_SIZE>,
    created_at: Timestamp,
}

impl GroupKey {
    /// Generate fresh key material for the given version.
    pub(crate) fn from_rng(
        group_id: GroupId,
        version: KeyVersion,
        rng: &Rng,
    ) -> Result<Self, GroupKeyError> {
        Ok(Self {
            group_id,
            version,
            key_material: Secret::from_bytes(rng.random_array()?),
            created_at: now(),
        })
    }

    #[cfg(test)]
    pub(crate) fn new(
        group_id: GroupId,
        version: KeyVersion,
        bytes: [u8; GROUP_KEY_SIZE],
        created_at: Timestamp,
    ) -> Self {
        Self {
            group_id,
            version,
            key_material: Secret::from_bytes(bytes),
            created_at,
        }
    }

    pub fn group_id(&self) -> &GroupId {
        &self.group_id
    }

    pub fn version(&self) -> KeyVersion {
        self.version
    }

    /// UNIX timestamp in seconds of when the distributor generated this key.
    pub fn created_at(&self) -> Timestamp {
        self.created_at
    }

    pub(crate) fn as_bytes(&self) -> &[u8; GROUP_KEY_SIZE] {
        self.key_material.as_bytes()
    }
}

/// All key versions of one group we know about, together with the members each version was
/// distributed to.
///
/// Versions are only ever appended. The highest version is the current one.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct GroupKeyHistory {
    keys: BTreeMap<KeyVersion, GroupKey>,
    members: BTreeMap<KeyVersion, BTreeSet<UserId>>,
    /// Versions below this were pruned and are not accepted again.
    pruned_below: KeyVersion,
}

impl GroupKeyHistory {
    pub fn current(&self) -> Option<&GroupKey> {
        self.keys.last_key_value().map(|(_, key)| key)
    }

    pub fn get(&self, version: KeyVersion) -> Option<&GroupKey> {
        self.keys.get(&version)
    }

    pub fn contains(&self, version: KeyVersion) -> bool {
        self.keys.contains_key(&version)
    }

    /// Returns true if the version is either present or was pruned before.
    pub fn is_settled(&self, version: KeyVersion) -> bool {
        version < self.pruned_below || self.contains(version)
    }

    pub fn versions(&self) -> Vec<KeyVersion> {
        self.keys.keys().copied().collect()
    }

    pub fn members(&self, version: KeyVersion) -> Option<&BTreeSet<UserId>> {
        self.members.get(&version)
    }

    /// Adds a key version.
    ///
    /// Inserting the same key twice or a pruned version is a no-op, a different key for an
    /// existing version is rejected.
    pub(crate) fn insert(
        &mut self,
        key: GroupKey,
        members: BTreeSet<UserId>,
    ) -> Result<(), GroupKeyError> {
        if key.version < self.pruned_below {
            return Ok(());
        }

        if let Some(existing) = self.keys.get(&key.version) {
            if existing.key_material != key.key_material {
                return Err(GroupKeyError::ConflictingKey {
                    group_id: key.group_id.clone(),
                    version: key.version,
                });
            }
            return Ok(());
        }

        self.members.insert(key.version, members);
        self.keys.insert(key.version, key);
        Ok(())
    }

    /// Removes all versions older than `oldest_needed`. The current version is always kept.
    ///
    /// Returns the number of removed versions.
    pub(crate) fn prune(&mut self, oldest_needed: KeyVersion) -> usize {
        let Some(current) = self.current().map(GroupKey::version) else {
            return 0;
        };
        let keep_from = oldest_needed.min(current);
        self.pruned_below = self.pruned_below.max(keep_from);

        let before = self.keys.len();
        self.keys.retain(|version, _| *version >= keep_from);
        self.members.retain(|version, _| *version >= keep_from);
        before - self.keys.len()
    }
}

/// Fields of a sealed group key which are covered by the distributor's signature.
#[derive(Serialize)]
struct SealedGroupKeyContext<'a> {
    group_id: &'a GroupId,
    version: KeyVersion,
    member_id: &'a UserId,
    distributor_id: &'a UserId,
    members: &'a [UserId],
    created_at: Timestamp,
}

/// Copy of a group key encrypted towards one member and signed by the distributor.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SealedGroupKey {
    pub group_id: GroupId,
    pub version: KeyVersion,
    pub member_id: UserId,
    pub distributor_id: UserId,
    /// Everyone this version was distributed to.
    pub members: Vec<UserId>,
    pub created_at: Timestamp,
    pub sealed: HpkeCiphertext,
    pub signature: Signature,
}

impl SealedGroupKey {
    /// Encrypts the group key to the member's public key with HPKE and signs the result.
    pub(crate) fn seal(
        key: &GroupKey,
        members: &[UserId],
        member_id: &UserId,
        member_key: &PublicKey,
        distributor_keys: &UserKeys,
    ) -> Result<Self, GroupKeyError> {
        let context = SealedGroupKeyContext {
            group_id: &key.group_id,
            version: key.version,
            member_id,
            distributor_id: distributor_keys.user_id(),
            members,
            created_at: key.created_at,
        };
        let aad = hpke_aad(&key.group_id, key.version, member_id)?;
        let sealed = hpke_seal(member_key, Some(HPKE_INFO), Some(&aad), key.as_bytes())?;

        let digest = signing_digest(&context, &sealed)?;
        let signature = distributor_keys.signing_key_pair().signing_key().sign(&digest);

        Ok(Self {
            group_id: key.group_id.clone(),
            version: key.version,
            member_id: member_id.clone(),
            distributor_id: distributor_keys.user_id().clone(),
            members: members.to_vec(),
            created_at: key.created_at,
            sealed,
            signature,
        })
    }

    /// Verifies the distributor's signature and decrypts the group key.
    pub(crate) fn open(
        &self,
        receiver_keys: &UserKeys,
        distributor_key: &VerifyingKey,
    ) -> Result<GroupKey, GroupKeyError> {
        if &self.member_id != receiver_keys.user_id() {
            return Err(GroupKeyError::WrongRecipient {
                group_id: self.group_id.clone(),
                version: self.version,
            });
        }

        let digest = signing_digest(&self.context(), &self.sealed)?;
        distributor_key
            .verify(&digest, &self.signature)
            .map_err(|_| GroupKeyError::InvalidSignature {
                group_id: self.group_id.clone(),
                version: self.version,
                distributor_id: self.distributor_id.clone(),
            })?;

        let aad = hpke_aad(&self.group_id, self.version, &self.member_id)?;
        let plaintext = hpke_open(
            &self.sealed,
            receiver_keys.encryption_key_pair().secret_key(),
            Some(HPKE_INFO),
            Some(&aad),
        )?;
        let bytes: [u8; GROUP_KEY_SIZE] =
            plaintext
                .try_into()
                .map_err(|_| GroupKeyError::InvalidKeyMaterial {
                    group_id: self.group_id.clone(),
                    version: self.version,
                })?;

        Ok(GroupKey {
            group_id: self.group_id.clone(),
            version: self.version,
            key_material: Secret::from_bytes(bytes),
            created_at: self.created_at,
        })
    }

    fn context(&self) -> SealedGroupKeyContext<'_> {
        SealedGroupKeyContext {
            group_id: &self.group_id,
            version: self.version,
            member_id: &self.member_id,
            distributor_id: &self.distributor_id,
            members: &self.members,
            created_at: self.created_at,
        }
    }
}

fn hpke_aad(
    group_id: &GroupId,
    version: KeyVersion,
    member_id: &UserId,
) -> Result<Vec<u8>, GroupKeyError> {
    Ok(encode_cbor(&(group_id, version, member_id))?)
}

fn signing_digest(
    context: &SealedGroupKeyContext<'_>,
    sealed: &HpkeCiphertext,
) -> Result<[u8; 32], GroupKeyError> {
    let context = encode_cbor(context)?;
    Ok(sha2_256(&[
        SIGNATURE_DOMAIN,
        &context,
        &sealed.kem_output,
        &sealed.ciphertext,
    ]))
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use assert_matches::assert_matches;

    use crate::crypto::Rng;
    use crate::group::GroupKeyError;
    use crate::identity::UserKeys;
    use crate::types::UserId;

    use super::{GroupKey, GroupKeyHistory, SealedGroupKey};

    fn members(ids: &[&str]) -> BTreeSet<UserId> {
        ids.iter().map(|id| UserId::from(*id)).collect()
    }

    #[test]
    fn history_is_append_only() {
        let mut history = GroupKeyHistory::default();
        assert!(history.current().is_none());

        history
            .insert(GroupKey::new("g".into(), 1, [1; 32], 0), members(&["a", "b"]))
            .unwrap();
        history
            .insert(GroupKey::new("g".into(), 2, [2; 32], 0), members(&["a"]))
            .unwrap();
        assert_eq!(history.current().unwrap().version(), 2);
        assert_eq!(history.versions(), vec![1, 2]);
        assert_eq!(history.members(1), Some(&members(&["a", "b"])));

        // Same key again is fine.
        history
            .insert(GroupKey::new("g".into(), 1, [1; 32], 0), members(&["a", "b"]))
            .unwrap();

        // Different key for an existing version is not.
        assert_matches!(
            history.insert(GroupKey::new("g".into(), 1, [9; 32], 0), members(&["a"])),
            Err(GroupKeyError::ConflictingKey { version: 1, .. })
        );
        assert_eq!(history.get(1).unwrap().as_bytes(), &[1; 32]);

        // Learning an older version later does not move the current pointer back.
        let mut history = GroupKeyHistory::default();
        history
            .insert(GroupKey::new("g".into(), 3, [3; 32], 0), members(&["a"]))
            .unwrap();
        history
            .insert(GroupKey::new("g".into(), 2, [2; 32], 0), members(&["a"]))
            .unwrap();
        assert_eq!(history.current().unwrap().version(), 3);
    }

    #[test]
    fn prune_keeps_needed_and_current() {
        let mut history = GroupKeyHistory::default();
        for version in 1..=4 {
            history
                .insert(
                    GroupKey::new("g".into(), version, [version as u8; 32], 0),
                    members(&["a"]),
                )
                .unwrap();
        }

        assert_eq!(history.prune(3), 2);
        assert_eq!(history.versions(), vec![3, 4]);
        assert!(history.members(1).is_none());

        // Pruned versions don't come back.
        assert!(history.is_settled(1));
        history
            .insert(GroupKey::new("g".into(), 1, [1; 32], 0), members(&["a"]))
            .unwrap();
        assert!(history.get(1).is_none());

        // Never removes the current version.
        assert_eq!(history.prune(10), 1);
        assert_eq!(history.versions(), vec![4]);
    }

    #[test]
    fn seal_and_open() {
        let rng = Rng::from_seed([1; 32]);
        let alice = UserKeys::generate("alice".into(), &rng).unwrap();
        let bob = UserKeys::generate("bob".into(), &rng).unwrap();
        let charlie = UserKeys::generate("charlie".into(), &rng).unwrap();

        let key = GroupKey::from_rng("g".into(), 1, &rng).unwrap();
        let members = vec![alice.user_id().clone(), bob.user_id().clone()];
        let sealed = SealedGroupKey::seal(
            &key,
            &members,
            bob.user_id(),
            bob.encryption_key_pair().public_key(),
            &alice,
        )
        .unwrap();

        let opened = sealed
            .open(&bob, alice.signing_key_pair().verifying_key())
            .unwrap();
        assert_eq!(opened, key);

        // Wrong distributor key.
        assert_matches!(
            sealed.open(&bob, charlie.signing_key_pair().verifying_key()),
            Err(GroupKeyError::InvalidSignature { .. })
        );

        // Addressed to someone else.
        assert_matches!(
            sealed.open(&charlie, alice.signing_key_pair().verifying_key()),
            Err(GroupKeyError::WrongRecipient { .. })
        );

        // Tampered version is detected.
        let mut tampered = sealed.clone();
        tampered.version = 2;
        assert_matches!(
            tampered.open(&bob, alice.signing_key_pair().verifying_key()),
            Err(GroupKeyError::InvalidSignature { .. })
        );
    }
}
