// SPDX-License-Identifier: MIT OR Apache-2.0

//! In-memory implementations of the transport and key pair store for tests.
mod store;
mod transport;

use std::sync::Arc;

use crate::config::Config;
use crate::crypto::Rng;
use crate::key_store::KeyStore;
use crate::messenger::Messenger;
use crate::session::Session;

pub use store::MemoryKeyPairStore;
pub use transport::MemoryTransport;

pub type TestMessenger = Messenger<MemoryTransport, MemoryKeyPairStore>;

/// Creates a messenger for the given user on a shared in-memory server and publishes the user's
/// public keys to its key directory.
pub async fn test_messenger(
    user_id: &str,
    transport: &Arc<MemoryTransport>,
    rng: &Arc<Rng>,
    config: Config,
) -> TestMessenger {
    let key_store = Arc::new(KeyStore::new(MemoryKeyPairStore::new(), rng.clone()));
    let session = Session::new(user_id.into(), format!("{user_id}-token"));
    let messenger = Messenger::new(session, transport.clone(), key_store, rng.clone(), config);

    let keys = messenger.keys().await.expect("key generation");
    transport.publish_public_keys(&keys).await;
    messenger
}

pub fn setup_logging() {
    if std::env::var("RUST_LOG").is_ok() {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .try_init();
    }
}
