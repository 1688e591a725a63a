//! BIP37 bloom filter

use crate::core::{write_var_bytes, ByteReader, EncodingError};
use crate::crypto::murmur3_32;
use serde::{Deserialize, Serialize};

// =============================================================================
// Constants
// =============================================================================

/// Largest filter peers accept, in bytes
pub const MAX_BLOOM_FILTER_SIZE: usize = 36_000;

/// Most hash functions peers accept
pub const MAX_HASH_FUNCS: u32 = 50;

/// Target false positive rate for wallet filters
pub const DEFAULT_FALSE_POSITIVE_RATE: f64 = 0.00005;

/// Bloom filter update flags
pub const BLOOM_UPDATE_NONE: u8 = 0;
pub const BLOOM_UPDATE_ALL: u8 = 1;
pub const BLOOM_UPDATE_P2PUBKEY_ONLY: u8 = 2;

const SEED_MULTIPLIER: u32 = 0xFBA4_C795;

// =============================================================================
// Bloom Filter
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BloomFilter {
    /// Filter bit array
    data: Vec<u8>,
    hash_funcs: u32,
    /// Hash randomization
    tweak: u32,
    flags: u8,
}

impl BloomFilter {
    pub fn new(size_bytes: usize, hash_funcs: u32, tweak: u32) -> Self {
        Self {
            data: vec![0u8; size_bytes.clamp(1, MAX_BLOOM_FILTER_SIZE)],
            hash_funcs: hash_funcs.clamp(1, MAX_HASH_FUNCS),
            tweak,
            flags: BLOOM_UPDATE_NONE,
        }
    }

    /// Filter sized for `n_elements` at `fp_rate`, with a random tweak
    pub fn for_elements(n_elements: usize, fp_rate: f64) -> Self {
        Self::for_elements_with_tweak(n_elements, fp_rate, rand::random())
    }

    pub fn for_elements_with_tweak(n_elements: usize, fp_rate: f64, tweak: u32) -> Self {
        let n = n_elements.max(1) as f64;
        let ln2_squared = std::f64::consts::LN_2 * std::f64::consts::LN_2;
        let size_bits = (-1.0 / ln2_squared) * n * fp_rate.ln();
        let size_bytes = ((size_bits / 8.0) as usize).clamp(1, MAX_BLOOM_FILTER_SIZE);

        let hash_funcs = ((size_bytes * 8) as f64 / n * std::f64::consts::LN_2) as u32;
        Self::new(size_bytes, hash_funcs, tweak)
    }

    /// Filter holding every element
    pub fn with_elements(elements: &[Vec<u8>]) -> Self {
        let mut filter = Self::for_elements(elements.len(), DEFAULT_FALSE_POSITIVE_RATE);
        for element in elements {
            filter.insert(element);
        }
        filter
    }

    fn bit_index(&self, data: &[u8], n: u32) -> usize {
        let seed = n.wrapping_mul(SEED_MULTIPLIER).wrapping_add(self.tweak);
        murmur3_32(data, seed) as usize % (self.data.len() * 8)
    }

    pub fn insert(&mut self, data: &[u8]) {
        for n in 0..self.hash_funcs {
            let index = self.bit_index(data, n);
            self.data[index >> 3] |= 1 << (index & 7);
        }
    }

    /// Possibly contains `data`; never false for inserted data
    pub fn contains(&self, data: &[u8]) -> bool {
        (0..self.hash_funcs).all(|n| {
            let index = self.bit_index(data, n);
            self.data[index >> 3] & (1 << (index & 7)) != 0
        })
    }

    pub fn size(&self) -> usize {
        self.data.len()
    }

    pub fn hash_funcs(&self) -> u32 {
        self.hash_funcs
    }

    pub fn tweak(&self) -> u32 {
        self.tweak
    }

    pub fn flags(&self) -> u8 {
        self.flags
    }

    /// `filterload` payload
    pub fn serialize(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.data.len() + 12);
        write_var_bytes(&mut buf, &self.data);
        buf.extend_from_slice(&self.hash_funcs.to_le_bytes());
        buf.extend_from_slice(&self.tweak.to_le_bytes());
        buf.push(self.flags);
        buf
    }

    pub fn deserialize(reader: &mut ByteReader<'_>) -> Result<Self, EncodingError> {
        let data = reader.read_var_bytes()?;
        let hash_funcs = reader.read_u32_le()?;
        let tweak = reader.read_u32_le()?;
        let flags = reader.read_u8()?;
        if data.is_empty() || data.len() > MAX_BLOOM_FILTER_SIZE || hash_funcs > MAX_HASH_FUNCS {
            return Err(EncodingError::InvalidData(format!(
                "bloom filter of {} bytes with {} hash functions",
                data.len(),
                hash_funcs
            )));
        }
        Ok(Self {
            data,
            hash_funcs,
            tweak,
            flags,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_inserted_elements_match() {
        let elements: Vec<Vec<u8>> = (0u8..40).map(|i| vec![i; 20]).collect();
        let filter = BloomFilter::with_elements(&elements);
        assert!(elements.iter().all(|e| filter.contains(e)));
        assert!(!filter.contains(b"definitely not inserted"));
    }

    #[test]
    fn test_bip37_vector() {
        // Reference filter from the Bitcoin Core test suite
        let mut filter = BloomFilter::for_elements_with_tweak(3, 0.01, 0);
        filter.insert(&hex::decode("99108ad8ed9bb6274d3980bab5a85c048f0950c8").unwrap());
        assert!(filter.contains(&hex::decode("99108ad8ed9bb6274d3980bab5a85c048f0950c8").unwrap()));
        assert!(!filter.contains(&hex::decode("19108ad8ed9bb6274d3980bab5a85c048f0950c8").unwrap()));
        filter.insert(&hex::decode("b5a2c786d9ef4658287ced5914b37a1b4aa32eee").unwrap());
        filter.insert(&hex::decode("b9300670b4c5366e95b2699e8b18bc75e5f729c5").unwrap());

        assert_eq!(hex::encode(filter.serialize()), "03614e9b050000000000000000");
    }

    #[test]
    fn test_sizing_is_capped() {
        let filter = BloomFilter::for_elements(10_000_000, DEFAULT_FALSE_POSITIVE_RATE);
        assert_eq!(filter.size(), MAX_BLOOM_FILTER_SIZE);
        assert!(filter.hash_funcs() >= 1 && filter.hash_funcs() <= MAX_HASH_FUNCS);
    }

    #[test]
    fn test_wire_round_trip() {
        let filter = BloomFilter::with_elements(&[b"abc".to_vec()]);
        let bytes = filter.serialize();
        let decoded = BloomFilter::deserialize(&mut ByteReader::new(&bytes)).unwrap();
        assert_eq!(decoded, filter);
    }
}
