// SPDX-License-Identifier: MIT OR Apache-2.0

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Configuration for the encryption core.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Config {
    /// Upper bound for every single transport call. Elapsed calls surface as key resolution or
    /// unknown key version failures, depending on what was requested.
    pub(crate) transport_timeout: Duration,

    /// Cached public keys of other users older than this are fetched again.
    pub(crate) peer_key_ttl: Duration,

    /// How often a group key rotation is retried after losing against a concurrent rotation on
    /// the server.
    pub(crate) max_rotation_attempts: usize,

    /// Tolerated difference between the clocks of sender and group key creator.
    pub(crate) clock_skew: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            transport_timeout: Duration::from_secs(10),
            peer_key_ttl: Duration::from_secs(60 * 60), // 1 hour
            max_rotation_attempts: 5,
            clock_skew: Duration::from_secs(60 * 5), // 5 minutes
        }
    }
}

impl Config {
    pub fn with_transport_timeout(mut self, timeout: Duration) -> Self {
        self.transport_timeout = timeout;
        self
    }

    pub fn with_peer_key_ttl(mut self, ttl: Duration) -> Self {
        self.peer_key_ttl = ttl;
        self
    }

    pub fn with_max_rotation_attempts(mut self, attempts: usize) -> Self {
        self.max_rotation_attempts = attempts.max(1);
        self
    }

    pub fn with_clock_skew(mut self, skew: Duration) -> Self {
        self.clock_skew = skew;
        self
    }

    pub fn transport_timeout(&self) -> Duration {
        self.transport_timeout
    }

    pub fn peer_key_ttl(&self) -> Duration {
        self.peer_key_ttl
    }

    pub fn max_rotation_attempts(&self) -> usize {
        self.max_rotation_attempts
    }

    pub fn clock_skew(&self) -> Duration {
        self.clock_skew
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::Config;

    #[test]
    fn builder() {
        let config = Config::default()
            .with_transport_timeout(Duration::from_secs(2))
            .with_max_rotation_attempts(0);
        assert_eq!(config.transport_timeout(), Duration::from_secs(2));
        assert_eq!(config.peer_key_ttl(), Duration::from_secs(3600));

        // At least one attempt is always made.
        assert_eq!(config.max_rotation_attempts(), 1);
    }
}
