// SPDX-License-Identifier: MIT OR Apache-2.0

use std::time::Duration;

use thiserror::Error;

use crate::group::SealedGroupKey;
use crate::identity::PublicKeys;
use crate::message::EncryptedPayload;
use crate::session::Session;
use crate::types::{GroupId, KeyVersion, UserId};

/// Interface to the chat server.
///
/// Every method receives the session of the local user explicitly, implementations use it to
/// authenticate their requests.
pub trait Transport {
    /// Public keys of a user from the key directory (`GET /users/{id}/key`).
    fn fetch_public_keys(
        &self,
        session: &Session,
        user_id: &UserId,
    ) -> impl Future<Output = Result<PublicKeys, TransportError>>;

    /// Current key version of a group as known to the server (`GET /groups/{id}/key-version`).
    ///
    /// Returns `None` if no key was ever published for this group.
    fn fetch_group_key_version(
        &self,
        session: &Session,
        group_id: &GroupId,
    ) -> impl Future<Output = Result<Option<KeyVersion>, TransportError>>;

    /// Deliver a direct message (`POST /messages/{recipientId}`).
    fn post_direct_message(
        &self,
        session: &Session,
        recipient_id: &UserId,
        payload: &EncryptedPayload,
    ) -> impl Future<Output = Result<(), TransportError>>;

    /// Deliver a group message (`POST /groups/{id}/messages`).
    fn post_group_message(
        &self,
        session: &Session,
        group_id: &GroupId,
        payload: &EncryptedPayload,
    ) -> impl Future<Output = Result<(), TransportError>>;

    /// Publish a new group key version together with one sealed copy per member.
    ///
    /// The server accepts the new version only if its current version still equals
    /// `expected_previous`, otherwise it reports the version which won.
    fn publish_group_key(
        &self,
        session: &Session,
        group_id: &GroupId,
        expected_previous: Option<KeyVersion>,
        version: KeyVersion,
        sealed_keys: Vec<SealedGroupKey>,
    ) -> impl Future<Output = Result<PublishOutcome, TransportError>>;

    /// All sealed group key copies addressed to the session's user.
    fn fetch_sealed_group_keys(
        &self,
        session: &Session,
        group_id: &GroupId,
    ) -> impl Future<Output = Result<Vec<SealedGroupKey>, TransportError>>;
}

/// Result of a compare-and-swap on the server's group key version.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PublishOutcome {
    Accepted,
    Conflict { current: Option<KeyVersion> },
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("resource not found on server")]
    NotFound,

    #[error("server unavailable: {0}")]
    Unavailable(String),

    #[error("server rejected request: {0}")]
    Rejected(String),

    #[error("request timed out")]
    Timeout,
}

/// Bounds a transport call by the configured timeout.
pub(crate) async fn with_timeout<T>(
    timeout: Duration,
    request: impl Future<Output = Result<T, TransportError>>,
) -> Result<T, TransportError> {
    tokio::time::timeout(timeout, request)
        .await
        .map_err(|_| TransportError::Timeout)?
}
