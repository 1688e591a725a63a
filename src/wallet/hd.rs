//! Key derivation seam
//!
//! The kit never derives keys itself; it asks a `KeyDeriver`. Wallet
//! applications plug in their HD implementation. `SeedKeyDeriver` is a
//! deterministic stand-in that hashes a seed with the key position. It is
//! not BIP32 and its keys are not compatible with other wallets.

use crate::core::PublicKey;
use crate::crypto::{public_key_for, sha256};
use secp256k1::SecretKey;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum KeyDerivationError {
    #[error("Seed must be at least 16 bytes")]
    InvalidSeed,
    #[error("Derivation failed for {0}")]
    DerivationFailed(String),
}

/// Source of wallet keys, addressed by account, chain and index
pub trait KeyDeriver: Send + Sync {
    fn public_key(&self, account: u32, index: u32, external: bool) -> Result<PublicKey, KeyDerivationError>;

    fn private_key(&self, account: u32, index: u32, external: bool) -> Result<SecretKey, KeyDerivationError>;

    /// Keys `indices` of one chain
    fn public_keys(
        &self,
        account: u32,
        indices: std::ops::Range<u32>,
        external: bool,
    ) -> Result<Vec<PublicKey>, KeyDerivationError> {
        indices
            .map(|index| self.public_key(account, index, external))
            .collect()
    }

    fn private_key_for(&self, public_key: &PublicKey) -> Result<SecretKey, KeyDerivationError> {
        self.private_key(public_key.account, public_key.index, public_key.external)
    }
}

/// Deterministic keys from a seed
pub struct SeedKeyDeriver {
    seed: Vec<u8>,
}

impl SeedKeyDeriver {
    pub fn new(seed: &[u8]) -> Result<Self, KeyDerivationError> {
        if seed.len() < 16 {
            return Err(KeyDerivationError::InvalidSeed);
        }
        Ok(Self {
            seed: seed.to_vec(),
        })
    }
}

impl KeyDeriver for SeedKeyDeriver {
    fn public_key(&self, account: u32, index: u32, external: bool) -> Result<PublicKey, KeyDerivationError> {
        let secret = self.private_key(account, index, external)?;
        Ok(PublicKey::new(account, index, external, public_key_for(&secret)))
    }

    fn private_key(&self, account: u32, index: u32, external: bool) -> Result<SecretKey, KeyDerivationError> {
        let mut material = Vec::with_capacity(self.seed.len() + 13);
        material.extend_from_slice(&self.seed);
        material.extend_from_slice(&account.to_be_bytes());
        material.push(u8::from(!external));
        material.extend_from_slice(&index.to_be_bytes());

        // out-of-range digests are astronomically rare; rehash until valid
        for counter in 0u32..16 {
            material.extend_from_slice(&counter.to_be_bytes());
            if let Ok(secret) = SecretKey::from_slice(&sha256(&material)) {
                return Ok(secret);
            }
        }
        Err(KeyDerivationError::DerivationFailed(PublicKey::make_path(
            account, external, index,
        )))
    }
}
