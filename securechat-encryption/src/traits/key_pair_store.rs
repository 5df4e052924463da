// SPDX-License-Identifier: MIT OR Apache-2.0

use std::error::Error;

use crate::identity::UserKeys;
use crate::types::UserId;

/// Interface for persisting the long-term key pairs of local users.
///
/// Implementations should keep the data in secure storage, it contains secret keys.
pub trait KeyPairStore {
    type Error: Error + Send + Sync + 'static;

    fn load(&self, user_id: &UserId) -> impl Future<Output = Result<Option<UserKeys>, Self::Error>>;

    fn save(&self, keys: &UserKeys) -> impl Future<Output = Result<(), Self::Error>>;

    fn delete(&self, user_id: &UserId) -> impl Future<Output = Result<(), Self::Error>>;
}
