// SPDX-License-Identifier: MIT OR Apache-2.0

//! Cryptographic primitives used by the direct and group message codecs.
pub mod ed25519;
pub mod hkdf;
pub mod hpke;
mod rng;
mod secret;
pub mod sha2;
pub mod x25519;
pub mod xchacha20;

pub use rng::{Rng, RngError};
pub use secret::Secret;
