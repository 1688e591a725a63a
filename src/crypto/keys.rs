//! ECDSA key management
//!
//! Provides key pair handling, DER signing, and verification using
//! the secp256k1 elliptic curve.

use rand::rngs::OsRng;
use secp256k1::{ecdsa::Signature, Message, PublicKey, Secp256k1, SecretKey};
use thiserror::Error;

use super::hash::hash160;

/// Errors that can occur during key operations
#[derive(Error, Debug)]
pub enum KeyError {
    #[error("Invalid private key")]
    InvalidPrivateKey,
    #[error("Invalid public key")]
    InvalidPublicKey,
    #[error("Invalid signature")]
    InvalidSignature,
    #[error("Secp256k1 error: {0}")]
    Secp256k1Error(#[from] secp256k1::Error),
}

/// A key pair consisting of a private key and its corresponding public key
#[derive(Clone)]
pub struct KeyPair {
    pub secret_key: SecretKey,
    pub public_key: PublicKey,
}

impl KeyPair {
    /// Generate a new random key pair
    pub fn generate() -> Self {
        let secp = Secp256k1::new();
        let (secret_key, public_key) = secp.generate_keypair(&mut OsRng);
        Self {
            secret_key,
            public_key,
        }
    }

    /// Create a key pair from an existing secret key
    pub fn from_secret_key(secret_key: SecretKey) -> Self {
        let secp = Secp256k1::new();
        let public_key = PublicKey::from_secret_key(&secp, &secret_key);
        Self {
            secret_key,
            public_key,
        }
    }

    /// Create a key pair from a hex-encoded private key
    pub fn from_private_key_hex(hex_key: &str) -> Result<Self, KeyError> {
        let bytes = hex::decode(hex_key).map_err(|_| KeyError::InvalidPrivateKey)?;
        let secret_key =
            SecretKey::from_slice(&bytes).map_err(|_| KeyError::InvalidPrivateKey)?;
        Ok(Self::from_secret_key(secret_key))
    }

    /// Compressed SEC1 public key (33 bytes)
    pub fn public_key_bytes(&self) -> Vec<u8> {
        self.public_key.serialize().to_vec()
    }

    /// HASH160 of the compressed public key
    pub fn key_hash(&self) -> [u8; 20] {
        hash160(&self.public_key.serialize())
    }

    /// Sign a 32-byte digest, returning a DER-encoded signature
    pub fn sign_der(&self, digest: &[u8; 32]) -> Result<Vec<u8>, KeyError> {
        sign_der(&self.secret_key, digest)
    }
}

/// Sign a 32-byte digest with a secret key, returning the DER encoding.
/// libsecp256k1 always produces low-S signatures.
pub fn sign_der(secret_key: &SecretKey, digest: &[u8; 32]) -> Result<Vec<u8>, KeyError> {
    let secp = Secp256k1::signing_only();
    let message = Message::from_digest_slice(digest)?;
    let signature = secp.sign_ecdsa(&message, secret_key);
    Ok(signature.serialize_der().to_vec())
}

/// Verify a DER signature over a 32-byte digest
pub fn verify_der(public_key: &[u8], digest: &[u8; 32], signature: &[u8]) -> Result<bool, KeyError> {
    let secp = Secp256k1::verification_only();
    let public_key = PublicKey::from_slice(public_key).map_err(|_| KeyError::InvalidPublicKey)?;
    let signature = Signature::from_der(signature).map_err(|_| KeyError::InvalidSignature)?;
    let message = Message::from_digest_slice(digest)?;

    Ok(secp.verify_ecdsa(&message, &signature, &public_key).is_ok())
}

/// Derive the compressed public key for a secret key
pub fn public_key_for(secret_key: &SecretKey) -> Vec<u8> {
    let secp = Secp256k1::signing_only();
    PublicKey::from_secret_key(&secp, secret_key)
        .serialize()
        .to_vec()
}
