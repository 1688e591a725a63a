//! Cryptographic hashing utilities
//!
//! Provides the SHA-256 based digests used across the protocol:
//! transaction ids, block header hashes, address checksums and key hashes.

use ripemd::Ripemd160;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;

/// Computes SHA-256 hash of the input data
pub fn sha256(data: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hasher.finalize().into()
}

/// Computes double SHA-256 hash (SHA-256 of SHA-256)
/// Used for transaction ids, block hashes and message checksums
pub fn double_sha256(data: &[u8]) -> [u8; 32] {
    sha256(&sha256(data))
}

/// RIPEMD160(SHA256(data)), the 20-byte hash behind P2PKH/P2SH/P2WPKH
pub fn hash160(data: &[u8]) -> [u8; 20] {
    let mut ripemd = Ripemd160::new();
    ripemd.update(sha256(data));
    ripemd.finalize().into()
}

/// Computes SHA-256 hash and returns it as a hex string
pub fn sha256_hex(data: &[u8]) -> String {
    hex::encode(sha256(data))
}

/// Computes double SHA-256 hash and returns it as a hex string
pub fn double_sha256_hex(data: &[u8]) -> String {
    hex::encode(double_sha256(data))
}

/// A 32-byte double-SHA256 digest in internal (little-endian) byte order.
///
/// `Display` and `FromStr` use the conventional reversed hex form, the one
/// block explorers show for txids and block hashes.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct Hash256(pub [u8; 32]);

impl Hash256 {
    pub const ZERO: Hash256 = Hash256([0u8; 32]);

    /// Hash arbitrary bytes with double SHA-256
    pub fn digest(data: &[u8]) -> Self {
        Hash256(double_sha256(data))
    }

    /// Build from internal-order bytes; `None` unless exactly 32 bytes
    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        let array: [u8; 32] = bytes.try_into().ok()?;
        Some(Hash256(array))
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn is_zero(&self) -> bool {
        self.0 == [0u8; 32]
    }

    /// Big-endian hex form (reversed bytes)
    pub fn to_hex(&self) -> String {
        let mut reversed = self.0;
        reversed.reverse();
        hex::encode(reversed)
    }

    /// Parse the big-endian hex form
    pub fn from_hex(s: &str) -> Result<Self, hex::FromHexError> {
        let mut bytes = [0u8; 32];
        hex::decode_to_slice(s, &mut bytes)?;
        bytes.reverse();
        Ok(Hash256(bytes))
    }
}

impl fmt::Display for Hash256 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for Hash256 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Hash256({})", self.to_hex())
    }
}

impl FromStr for Hash256 {
    type Err = hex::FromHexError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Hash256::from_hex(s)
    }
}

impl Serialize for Hash256 {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for Hash256 {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Hash256::from_hex(&s).map_err(serde::de::Error::custom)
    }
}

/// Checks that a header hash (internal order) is at or below the target
/// encoded by compact `bits`.
pub fn meets_target(hash: &Hash256, bits: u32) -> bool {
    let target = compact_to_target(bits);
    // compare as big-endian 256-bit numbers
    let mut value = hash.0;
    value.reverse();
    value <= target
}

/// Expand compact difficulty `bits` into a big-endian 256-bit target.
pub fn compact_to_target(bits: u32) -> [u8; 32] {
    let exponent = (bits >> 24) as usize;
    let mantissa = bits & 0x007f_ffff;
    let mut target = [0u8; 32];
    if bits & 0x0080_0000 != 0 || mantissa == 0 {
        return target;
    }

    let mantissa_bytes = [(mantissa >> 16) as u8, (mantissa >> 8) as u8, mantissa as u8];
    for (i, byte) in mantissa_bytes.iter().enumerate() {
        // byte i sits at position exponent - 1 - i counted from the least significant end
        let Some(pos_from_lsb) = exponent.checked_sub(1 + i) else {
            continue;
        };
        if pos_from_lsb < 32 {
            target[31 - pos_from_lsb] = *byte;
        }
    }
    target
}

/// Compress a big-endian 256-bit target into `bits` form
pub fn target_to_compact(target: &[u8; 32]) -> u32 {
    let Some(first) = target.iter().position(|b| *b != 0) else {
        return 0;
    };
    let mut size = (32 - first) as u32;
    let byte_at = |i: usize| target.get(i).copied().unwrap_or(0) as u32;
    let mut mantissa = (byte_at(first) << 16) | (byte_at(first + 1) << 8) | byte_at(first + 2);

    // the sign bit must stay clear
    if mantissa & 0x0080_0000 != 0 {
        mantissa >>= 8;
        size += 1;
    }
    (size << 24) | mantissa
}
