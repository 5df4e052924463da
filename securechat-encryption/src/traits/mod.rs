// SPDX-License-Identifier: MIT OR Apache-2.0

//! Interfaces to the outside world: the remote chat server and local secret storage.
mod key_pair_store;
mod transport;

pub use key_pair_store::KeyPairStore;
pub(crate) use transport::with_timeout;
pub use transport::{PublishOutcome, Transport, TransportError};
