//! Key pair generation for newly issued certificates.

use rcgen::{KeyPair, SignatureAlgorithm};
use serde::{Serialize, Deserialize};

use crate::errors::{CryptoError, Result as GroupCaResult};

/// Supported key algorithms
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum KeyAlgorithm {
    #[serde(rename = "ecdsa-p256")]
    EcdsaP256,
    #[serde(rename = "ecdsa-p384")]
    EcdsaP384,
    #[serde(rename = "ed25519")]
    Ed25519,
}

impl KeyAlgorithm {
    pub fn signature_algorithm(&self) -> &'static SignatureAlgorithm {
        match self {
            KeyAlgorithm::EcdsaP256 => &rcgen::PKCS_ECDSA_P256_SHA256,
            KeyAlgorithm::EcdsaP384 => &rcgen::PKCS_ECDSA_P384_SHA384,
            KeyAlgorithm::Ed25519 => &rcgen::PKCS_ED25519,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            KeyAlgorithm::EcdsaP256 => "ecdsa-p256",
            KeyAlgorithm::EcdsaP384 => "ecdsa-p384",
            KeyAlgorithm::Ed25519 => "ed25519",
        }
    }
}

/// Source of fresh asymmetric key pairs
pub trait KeyPairGenerator: Send + Sync {
    fn generate(&self) -> GroupCaResult<KeyPair>;

    fn algorithm(&self) -> KeyAlgorithm;
}

/// Software key generation backed by rcgen
#[derive(Clone, Debug)]
pub struct RcgenKeyPairGenerator {
    algorithm: KeyAlgorithm,
}

impl RcgenKeyPairGenerator {
    pub fn new(algorithm: KeyAlgorithm) -> Self {
        Self { algorithm }
    }
}

impl Default for RcgenKeyPairGenerator {
    fn default() -> Self {
        Self::new(KeyAlgorithm::EcdsaP256)
    }
}

impl KeyPairGenerator for RcgenKeyPairGenerator {
    fn generate(&self) -> GroupCaResult<KeyPair> {
        KeyPair::generate_for(self.algorithm.signature_algorithm()).map_err(|e| {
            CryptoError::KeyGeneration {
                algorithm: self.algorithm.name().to_string(),
                reason: e.to_string(),
            }
            .into()
        })
    }

    fn algorithm(&self) -> KeyAlgorithm {
        self.algorithm
    }
}
