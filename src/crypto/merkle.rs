//! Merkle tree calculations
//!
//! Bitcoin merkle roots over double-SHA256 transaction ids. An odd
//! level duplicates its last hash.

use super::hash::Hash256;

/// Hash two child nodes into their parent
pub fn merkle_parent(left: &Hash256, right: &Hash256) -> Hash256 {
    let mut data = [0u8; 64];
    data[..32].copy_from_slice(&left.0);
    data[32..].copy_from_slice(&right.0);
    Hash256::digest(&data)
}

/// Calculate the merkle root from a list of transaction hashes
pub fn calculate_merkle_root(hashes: &[Hash256]) -> Option<Hash256> {
    if hashes.is_empty() {
        return None;
    }

    let mut current_level: Vec<Hash256> = hashes.to_vec();

    while current_level.len() > 1 {
        let next_level = current_level
            .chunks(2)
            .map(|chunk| {
                let right = chunk.get(1).unwrap_or(&chunk[0]);
                merkle_parent(&chunk[0], right)
            })
            .collect();

        current_level = next_level;
    }

    current_level.into_iter().next()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_merkle_root_single() {
        let hashes = vec![Hash256::digest(b"tx1")];
        assert_eq!(calculate_merkle_root(&hashes), Some(hashes[0]));
    }

    #[test]
    fn test_merkle_root_two() {
        let hash1 = Hash256::digest(b"tx1");
        let hash2 = Hash256::digest(b"tx2");

        let root = calculate_merkle_root(&[hash1, hash2]).unwrap();
        assert_eq!(root, merkle_parent(&hash1, &hash2));
    }

    #[test]
    fn test_merkle_root_odd_duplicates_last() {
        let h1 = Hash256::digest(b"tx1");
        let h2 = Hash256::digest(b"tx2");
        let h3 = Hash256::digest(b"tx3");

        let root = calculate_merkle_root(&[h1, h2, h3]).unwrap();
        let expected = merkle_parent(&merkle_parent(&h1, &h2), &merkle_parent(&h3, &h3));
        assert_eq!(root, expected);
    }

    #[test]
    fn test_empty_merkle_root() {
        assert!(calculate_merkle_root(&[]).is_none());
    }
}
