// SPDX-License-Identifier: MIT OR Apache-2.0

//! Metadata describing how a message was protected.
//!
//! Receivers derive [`SecurityInfo`] from the actual outcome of decryption and verification,
//! nothing in it is taken from the sender.
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::direct::DIRECT_ALGORITHM;
use crate::group::GROUP_ALGORITHM;
use crate::message::EncryptedPayload;
use crate::types::KeyVersion;

/// How a message was delivered.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Flow {
    Direct,
    Group,
}

impl Flow {
    /// Algorithm identifier of this flow.
    pub fn algorithm(&self) -> &'static str {
        match self {
            Flow::Direct => DIRECT_ALGORITHM,
            Flow::Group => GROUP_ALGORITHM,
        }
    }
}

impl fmt::Display for Flow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Flow::Direct => write!(f, "direct"),
            Flow::Group => write!(f, "group"),
        }
    }
}

/// Security state of a received message (`security_info`).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecurityInfo {
    pub is_signed: bool,
    pub signature_valid: bool,
    pub encrypted: bool,
    pub algorithm: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key_version: Option<KeyVersion>,
    pub flow: Flow,
}

impl SecurityInfo {
    /// Content should be shown with a warning.
    pub fn is_warning(&self) -> bool {
        !self.encrypted || !self.signature_valid
    }
}

/// Protection applied to an outgoing message (`security_features`).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecurityFeatures {
    pub encrypted: bool,
    pub signed: bool,
    pub algorithm: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key_version: Option<KeyVersion>,
    pub flow: Flow,
}

#[derive(Debug)]
pub struct SecurityInfoReporter;

impl SecurityInfoReporter {
    /// Describes the outcome of opening a message.
    pub fn report(
        encrypted: bool,
        verified: bool,
        algorithm: &str,
        version: Option<KeyVersion>,
        flow: Flow,
    ) -> SecurityInfo {
        SecurityInfo {
            // Every payload carries a signature, whether it was valid is a separate question.
            is_signed: true,
            signature_valid: verified,
            encrypted,
            algorithm: algorithm.to_string(),
            key_version: version,
            flow,
        }
    }

    /// Describes a payload we produced ourselves.
    pub fn features(payload: &EncryptedPayload) -> SecurityFeatures {
        let flow = payload.flow();
        SecurityFeatures {
            encrypted: true,
            signed: true,
            algorithm: flow.algorithm().to_string(),
            key_version: payload.key_version(),
            flow,
        }
    }

    /// Describes a received payload which could not be decrypted.
    pub fn failed(payload: &EncryptedPayload) -> SecurityInfo {
        let flow = payload.flow();
        Self::report(true, false, flow.algorithm(), payload.key_version(), flow)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::{Flow, SecurityInfoReporter};

    #[test]
    fn report_reflects_outcome() {
        let info = SecurityInfoReporter::report(true, true, "algo", Some(2), Flow::Group);
        assert!(info.is_signed);
        assert!(info.signature_valid);
        assert!(info.encrypted);
        assert_eq!(info.key_version, Some(2));
        assert!(!info.is_warning());

        let info = SecurityInfoReporter::report(true, false, "algo", None, Flow::Direct);
        assert!(!info.signature_valid);
        assert!(info.is_warning());
    }

    #[test]
    fn serialized_shape() {
        let info = SecurityInfoReporter::report(
            true,
            true,
            Flow::Direct.algorithm(),
            None,
            Flow::Direct,
        );
        assert_eq!(
            serde_json::to_value(&info).unwrap(),
            json!({
                "is_signed": true,
                "signature_valid": true,
                "encrypted": true,
                "algorithm": "X25519-HKDF-SHA256/XChaCha20-Poly1305/Ed25519",
                "flow": "direct",
            })
        );

        let info = SecurityInfoReporter::report(
            true,
            false,
            Flow::Group.algorithm(),
            Some(3),
            Flow::Group,
        );
        assert_eq!(
            serde_json::to_value(&info).unwrap(),
            json!({
                "is_signed": true,
                "signature_valid": false,
                "encrypted": true,
                "algorithm": "XChaCha20-Poly1305/Ed25519",
                "key_version": 3,
                "flow": "group",
            })
        );
    }
}
