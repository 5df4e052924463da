// SPDX-License-Identifier: MIT OR Apache-2.0

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::config::Config;
use crate::crypto::Rng;
use crate::crypto::ed25519::VerifyingKey;
use crate::crypto::x25519::PublicKey;
use crate::group::{GroupKey, GroupKeyError, GroupKeyHistory, INITIAL_KEY_VERSION, SealedGroupKey};
use crate::identity::UserKeys;
use crate::locks::KeyedLocks;
use crate::peer_keys::PeerKeyCache;
use crate::session::Session;
use crate::traits::{PublishOutcome, Transport, with_timeout};
use crate::types::{GroupId, KeyVersion, UserId};

/// Maintains the group keys known to the local user.
///
/// Initializations and rotations of the same group are serialized locally. Across devices the
/// server's compare-and-swap on the key version makes sure only one key exists per version, a
/// rotation losing the race is retried on top of the winning version.
#[derive(Debug)]
pub struct GroupKeyManager<T> {
    transport: Arc<T>,
    peers: Arc<PeerKeyCache<T>>,
    rng: Arc<Rng>,
    config: Config,
    groups: RwLock<HashMap<GroupId, GroupKeyHistory>>,
    rotations: KeyedLocks<GroupId>,
}

impl<T> GroupKeyManager<T>
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
            groups: RwLock::new(HashMap::new()),
            rotations: KeyedLocks::default(),
        }
    }

    /// Returns the highest known key version of the group.
    pub async fn current_key(&self, group_id: &GroupId) -> Result<GroupKey, GroupKeyError> {
        self.groups
            .read()
            .await
            .get(group_id)
            .and_then(GroupKeyHistory::current)
            .cloned()
            .ok_or_else(|| GroupKeyError::NoGroupKey(group_id.clone()))
    }

    /// Returns a specific key version, for example to decrypt older messages.
    pub async fn key_for_version(
        &self,
        group_id: &GroupId,
        version: KeyVersion,
    ) -> Result<GroupKey, GroupKeyError> {
        self.groups
            .read()
            .await
            .get(group_id)
            .and_then(|history| history.get(version))
            .cloned()
            .ok_or_else(|| GroupKeyError::UnknownKeyVersion {
                group_id: group_id.clone(),
                version,
            })
    }

    /// All retained key versions of the group, in ascending order.
    pub async fn versions(&self, group_id: &GroupId) -> Vec<KeyVersion> {
        self.groups
            .read()
            .await
            .get(group_id)
            .map(GroupKeyHistory::versions)
            .unwrap_or_default()
    }

    /// Members a key version was distributed to.
    pub async fn members(
        &self,
        group_id: &GroupId,
        version: KeyVersion,
    ) -> Result<Vec<UserId>, GroupKeyError> {
        self.groups
            .read()
            .await
            .get(group_id)
            .and_then(|history| history.members(version))
            .map(|members| members.iter().cloned().collect())
            .ok_or_else(|| GroupKeyError::UnknownKeyVersion {
                group_id: group_id.clone(),
                version,
            })
    }

    /// Creates version 1 of a group key and distributes it to all initial members.
    pub async fn initialize_group(
        &self,
        session: &Session,
        distributor_keys: &UserKeys,
        group_id: &GroupId,
        member_ids: &[UserId],
    ) -> Result<GroupKey, GroupKeyError> {
        let _guard = self.rotations.lock(group_id).await;

        if self.groups.read().await.contains_key(group_id) {
            return Err(GroupKeyError::AlreadyInitialized(group_id.clone()));
        }

        let members = dedup_members(group_id, member_ids)?;
        let key = GroupKey::from_rng(group_id.clone(), INITIAL_KEY_VERSION, &self.rng)?;
        match self
            .distribute(session, distributor_keys, &key, &members, None)
            .await?
        {
            PublishOutcome::Accepted => (),
            PublishOutcome::Conflict { .. } => {
                return Err(GroupKeyError::AlreadyInitialized(group_id.clone()));
            }
        }

        self.insert_distributed(distributor_keys, &key, members)
            .await?;
        debug!(%group_id, "initialized group key");
        Ok(key)
    }

    /// Generates the next key version and distributes it only to the new member set.
    ///
    /// Has to be called on every membership change. Members which are not part of
    /// `new_member_ids` never receive this or any later version.
    pub async fn rotate_key(
        &self,
        session: &Session,
        distributor_keys: &UserKeys,
        group_id: &GroupId,
        new_member_ids: &[UserId],
    ) -> Result<GroupKey, GroupKeyError> {
        let _guard = self.rotations.lock(group_id).await;

        let members = dedup_members(group_id, new_member_ids)?;
        let mut previous = self
            .remote_version(session, group_id)
            .await?
            .ok_or_else(|| GroupKeyError::NoGroupKey(group_id.clone()))?;

        for attempt in 1..=self.config.max_rotation_attempts() {
            let key = GroupKey::from_rng(group_id.clone(), previous + 1, &self.rng)?;
            match self
                .distribute(session, distributor_keys, &key, &members, Some(previous))
                .await?
            {
                PublishOutcome::Accepted => {
                    self.insert_distributed(distributor_keys, &key, members)
                        .await?;
                    debug!(%group_id, version = key.version(), "rotated group key");
                    return Ok(key);
                }
                PublishOutcome::Conflict { current } => {
                    debug!(
                        %group_id,
                        attempt,
                        expected = previous,
                        ?current,
                        "concurrent rotation won, retry"
                    );
                    previous = current.ok_or_else(|| GroupKeyError::NoGroupKey(group_id.clone()))?;
                }
            }
        }

        Err(GroupKeyError::RotationConflict {
            group_id: group_id.clone(),
            attempts: self.config.max_rotation_attempts(),
        })
    }

    /// Verifies and decrypts a sealed key copy addressed to us and adds it to the history.
    pub async fn accept_sealed_key(
        &self,
        session: &Session,
        receiver_keys: &UserKeys,
        sealed: &SealedGroupKey,
    ) -> Result<KeyVersion, GroupKeyError> {
        let distributor_key = self
            .signing_key(session, receiver_keys, &sealed.distributor_id)
            .await?;
        let key = match sealed.open(receiver_keys, &distributor_key) {
            Err(GroupKeyError::InvalidSignature { .. })
                if &sealed.distributor_id != receiver_keys.user_id() =>
            {
                // Our cached keys of the distributor might be outdated.
                let (record, _) = self
                    .peers
                    .refresh(session, &sealed.distributor_id)
                    .await?;
                sealed.open(receiver_keys, &record.signing_public_key)?
            }
            result => result?,
        };

        let version = key.version();
        let members = sealed.members.iter().cloned().collect();
        self.groups
            .write()
            .await
            .entry(sealed.group_id.clone())
            .or_default()
            .insert(key, members)?;
        debug!(group_id = %sealed.group_id, version, "accepted group key");
        Ok(version)
    }

    /// Pulls all sealed key copies addressed to us from the server and accepts the unknown ones.
    ///
    /// Copies which fail to verify are skipped. Returns the newly learned versions.
    pub async fn sync(
        &self,
        session: &Session,
        receiver_keys: &UserKeys,
        group_id: &GroupId,
    ) -> Result<Vec<KeyVersion>, GroupKeyError> {
        let sealed_keys = with_timeout(
            self.config.transport_timeout(),
            self.transport.fetch_sealed_group_keys(session, group_id),
        )
        .await?;

        let mut learned = Vec::new();
        for sealed in sealed_keys {
            if &sealed.group_id != group_id || self.knows(group_id, sealed.version).await {
                continue;
            }
            match self.accept_sealed_key(session, receiver_keys, &sealed).await {
                Ok(version) => learned.push(version),
                Err(err) => warn!(
                    %group_id,
                    version = sealed.version,
                    distributor = %sealed.distributor_id,
                    "ignore sealed group key: {err}"
                ),
            }
        }

        Ok(learned)
    }

    /// Drops key versions older than `oldest_needed`.
    ///
    /// Callers pass the oldest version still referenced by their retained message history. The
    /// current version is never removed.
    pub async fn prune(
        &self,
        group_id: &GroupId,
        oldest_needed: KeyVersion,
    ) -> Result<usize, GroupKeyError> {
        let mut groups = self.groups.write().await;
        let history = groups
            .get_mut(group_id)
            .ok_or_else(|| GroupKeyError::NoGroupKey(group_id.clone()))?;
        let removed = history.prune(oldest_needed);
        debug!(%group_id, oldest_needed, removed, "pruned group keys");
        Ok(removed)
    }

    /// Current key version of the group according to the server.
    pub async fn remote_version(
        &self,
        session: &Session,
        group_id: &GroupId,
    ) -> Result<Option<KeyVersion>, GroupKeyError> {
        with_timeout(
            self.config.transport_timeout(),
            self.transport.fetch_group_key_version(session, group_id),
        )
        .await
        .map_err(|err| GroupKeyError::VersionResolution {
            group_id: group_id.clone(),
            source: err,
        })
    }

    async fn knows(&self, group_id: &GroupId, version: KeyVersion) -> bool {
        self.groups
            .read()
            .await
            .get(group_id)
            .is_some_and(|history| history.is_settled(version))
    }

    /// Seals the key to every member and publishes it with a compare-and-swap on the version.
    async fn distribute(
        &self,
        session: &Session,
        distributor_keys: &UserKeys,
        key: &GroupKey,
        members: &BTreeSet<UserId>,
        expected_previous: Option<KeyVersion>,
    ) -> Result<PublishOutcome, GroupKeyError> {
        let member_list: Vec<UserId> = members.iter().cloned().collect();

        let mut sealed_keys = Vec::with_capacity(member_list.len());
        for member_id in &member_list {
            let member_key = self
                .encryption_key(session, distributor_keys, member_id)
                .await?;
            sealed_keys.push(SealedGroupKey::seal(
                key,
                &member_list,
                member_id,
                &member_key,
                distributor_keys,
            )?);
        }

        let outcome = with_timeout(
            self.config.transport_timeout(),
            self.transport.publish_group_key(
                session,
                key.group_id(),
                expected_previous,
                key.version(),
                sealed_keys,
            ),
        )
        .await?;
        Ok(outcome)
    }

    /// Keeps the distributed key locally when we are part of the member set ourselves.
    async fn insert_distributed(
        &self,
        distributor_keys: &UserKeys,
        key: &GroupKey,
        members: BTreeSet<UserId>,
    ) -> Result<(), GroupKeyError> {
        if !members.contains(distributor_keys.user_id()) {
            return Ok(());
        }
        self.groups
            .write()
            .await
            .entry(key.group_id().clone())
            .or_default()
            .insert(key.clone(), members)
    }

    async fn encryption_key(
        &self,
        session: &Session,
        own_keys: &UserKeys,
        user_id: &UserId,
    ) -> Result<PublicKey, GroupKeyError> {
        if user_id == own_keys.user_id() {
            return Ok(*own_keys.encryption_key_pair().public_key());
        }
        Ok(self.peers.resolve(session, user_id).await?.public_key)
    }

    async fn signing_key(
        &self,
        session: &Session,
        own_keys: &UserKeys,
        user_id: &UserId,
    ) -> Result<VerifyingKey, GroupKeyError> {
        if user_id == own_keys.user_id() {
            return Ok(*own_keys.signing_key_pair().verifying_key());
        }
        Ok(self.peers.resolve(session, user_id).await?.signing_public_key)
    }
}

fn dedup_members(
    group_id: &GroupId,
    member_ids: &[UserId],
) -> Result<BTreeSet<UserId>, GroupKeyError> {
    let members: BTreeSet<UserId> = member_ids.iter().cloned().collect();
    if members.is_empty() {
        return Err(GroupKeyError::EmptyMembership(group_id.clone()));
    }
    Ok(members)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use assert_matches::assert_matches;

    use crate::config::Config;
    use crate::crypto::Rng;
    use crate::group::{GroupKey, GroupKeyError, SealedGroupKey};
    use crate::identity::UserKeys;
    use crate::peer_keys::PeerKeyCache;
    use crate::session::Session;
    use crate::test_utils::MemoryTransport;
    use crate::types::{GroupId, now};

    use super::GroupKeyManager;

    struct Member {
        keys: UserKeys,
        session: Session,
        manager: GroupKeyManager<MemoryTransport>,
    }

    async fn member(name: &str, transport: &Arc<MemoryTransport>, rng: &Arc<Rng>) -> Member {
        let keys = UserKeys::generate(name.into(), rng).unwrap();
        transport.publish_public_keys(&keys).await;
        let peers = Arc::new(PeerKeyCache::new(transport.clone(), Config::default()));
        Member {
            keys,
            session: Session::new(name.into(), format!("{name}-token")),
            manager: GroupKeyManager::new(transport.clone(), peers, rng.clone(), Config::default()),
        }
    }

    #[tokio::test]
    async fn distribute_and_sync() {
        let rng = Arc::new(Rng::from_seed([1; 32]));
        let transport = Arc::new(MemoryTransport::new());
        let alice = member("alice", &transport, &rng).await;
        let bob = member("bob", &transport, &rng).await;
        let group = GroupId::from("friends");

        // Duplicate members receive a single copy.
        let members = [
            alice.keys.user_id().clone(),
            bob.keys.user_id().clone(),
            bob.keys.user_id().clone(),
        ];
        let key = alice
            .manager
            .initialize_group(&alice.session, &alice.keys, &group, &members)
            .await
            .unwrap();
        assert_eq!(transport.sealed_keys(&group, bob.keys.user_id()).await.len(), 1);
        assert_eq!(
            alice.manager.members(&group, 1).await.unwrap(),
            vec![alice.keys.user_id().clone(), bob.keys.user_id().clone()]
        );

        let learned = bob
            .manager
            .sync(&bob.session, &bob.keys, &group)
            .await
            .unwrap();
        assert_eq!(learned, vec![1]);
        assert_eq!(bob.manager.current_key(&group).await.unwrap(), key);
        assert_eq!(
            bob.manager.members(&group, 1).await.unwrap(),
            alice.manager.members(&group, 1).await.unwrap()
        );

        // Nothing new on the second sync.
        assert!(
            bob.manager
                .sync(&bob.session, &bob.keys, &group)
                .await
                .unwrap()
                .is_empty()
        );
        assert_matches!(
            bob.manager.key_for_version(&group, 2).await,
            Err(GroupKeyError::UnknownKeyVersion { version: 2, .. })
        );
    }

    #[tokio::test]
    async fn distributor_outside_of_group() {
        let rng = Arc::new(Rng::from_seed([1; 32]));
        let transport = Arc::new(MemoryTransport::new());
        let admin = member("admin", &transport, &rng).await;
        let bob = member("bob", &transport, &rng).await;
        let group = GroupId::from("friends");

        admin
            .manager
            .initialize_group(
                &admin.session,
                &admin.keys,
                &group,
                &[bob.keys.user_id().clone()],
            )
            .await
            .unwrap();

        // The admin didn't distribute the key to themselves.
        assert!(admin.manager.versions(&group).await.is_empty());
        assert_eq!(transport.group_key_version(&group).await, Some(1));

        let key = admin
            .manager
            .rotate_key(
                &admin.session,
                &admin.keys,
                &group,
                &[bob.keys.user_id().clone()],
            )
            .await
            .unwrap();
        assert_eq!(key.version(), 2);

        bob.manager
            .sync(&bob.session, &bob.keys, &group)
            .await
            .unwrap();
        assert_eq!(bob.manager.versions(&group).await, vec![1, 2]);
    }

    #[tokio::test]
    async fn conflicting_key_material_is_rejected() {
        let rng = Arc::new(Rng::from_seed([1; 32]));
        let transport = Arc::new(MemoryTransport::new());
        let alice = member("alice", &transport, &rng).await;
        let bob = member("bob", &transport, &rng).await;
        let group = GroupId::from("friends");
        let members = [alice.keys.user_id().clone(), bob.keys.user_id().clone()];

        alice
            .manager
            .initialize_group(&alice.session, &alice.keys, &group, &members)
            .await
            .unwrap();
        bob.manager
            .sync(&bob.session, &bob.keys, &group)
            .await
            .unwrap();

        // Alice signs a second, different version 1.
        let other = GroupKey::new(group.clone(), 1, [3; 32], now());
        let sealed = SealedGroupKey::seal(
            &other,
            &members,
            bob.keys.user_id(),
            bob.keys.encryption_key_pair().public_key(),
            &alice.keys,
        )
        .unwrap();
        assert_matches!(
            bob.manager
                .accept_sealed_key(&bob.session, &bob.keys, &sealed)
                .await,
            Err(GroupKeyError::ConflictingKey { version: 1, .. })
        );
        assert_eq!(
            bob.manager.current_key(&group).await.unwrap(),
            alice.manager.current_key(&group).await.unwrap()
        );
    }

    #[tokio::test]
    async fn unreachable_server() {
        let rng = Arc::new(Rng::from_seed([1; 32]));
        let transport = Arc::new(MemoryTransport::new());
        let alice = member("alice", &transport, &rng).await;
        let group = GroupId::from("friends");

        transport.set_offline(true).await;
        let result = alice
            .manager
            .initialize_group(
                &alice.session,
                &alice.keys,
                &group,
                &[alice.keys.user_id().clone()],
            )
            .await;
        assert_matches!(result, Err(GroupKeyError::Transport(_)));
        assert!(result.unwrap_err().is_retryable());
        assert!(alice.manager.versions(&group).await.is_empty());
    }
}
