// SPDX-License-Identifier: MIT OR Apache-2.0

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::types::UserId;

/// Authenticated session of the local user, passed explicitly into every transport call.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    user_id: UserId,
    access_token: String,
}

impl Session {
    pub fn new(user_id: UserId, access_token: impl Into<String>) -> Self {
        Self {
            user_id,
            access_token: access_token.into(),
        }
    }

    pub fn user_id(&self) -> &UserId {
        &self.user_id
    }

    /// Bearer token to authorize requests against the chat server.
    pub fn access_token(&self) -> &str {
        &self.access_token
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("user_id", &self.user_id)
            .field("access_token", &"***")
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::Session;

    #[test]
    fn token_is_not_printed() {
        let session = Session::new("alice".into(), "secret-token");
        let debug = format!("{session:?}");
        assert!(debug.contains("alice"));
        assert!(!debug.contains("secret-token"));
    }
}
