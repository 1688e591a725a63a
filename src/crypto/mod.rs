//! Cryptographic utilities
//!
//! This module provides:
//! - SHA-256 / double SHA-256 / HASH160 digests
//! - ECDSA key management (secp256k1)
//! - Merkle root calculation
//! - MurmurHash3 for bloom filters

pub mod hash;
pub mod keys;
pub mod merkle;
pub mod murmur;

pub use hash::{
    compact_to_target, double_sha256, double_sha256_hex, hash160, meets_target, sha256,
    sha256_hex, target_to_compact, Hash256,
};
pub use keys::{public_key_for, sign_der, verify_der, KeyError, KeyPair};
pub use merkle::{calculate_merkle_root, merkle_parent};
pub use murmur::murmur3_32;
