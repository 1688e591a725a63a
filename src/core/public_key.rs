//! Wallet public keys

use crate::core::script::p2wpkh_redeem_script;
use crate::crypto::hash160;
use serde::{Deserialize, Serialize};

/// Chain index of receive keys in a derivation path
pub const EXTERNAL_CHAIN: u32 = 0;
/// Chain index of change keys in a derivation path
pub const INTERNAL_CHAIN: u32 = 1;

/// A derived wallet key with the hashes outputs may commit to
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PublicKey {
    pub account: u32,
    pub index: u32,
    /// Receive chain when true, change chain otherwise
    pub external: bool,
    pub raw: Vec<u8>,
    pub key_hash: Vec<u8>,
    /// HASH160 of the P2WPKH-in-P2SH redeem script
    pub script_hash_for_p2wpkh: Vec<u8>,
    /// `account/chain/index`
    pub path: String,
}

impl PublicKey {
    pub fn new(account: u32, index: u32, external: bool, raw: Vec<u8>) -> Self {
        let key_hash = hash160(&raw).to_vec();
        let script_hash_for_p2wpkh = hash160(&p2wpkh_redeem_script(&key_hash)).to_vec();
        Self {
            account,
            index,
            external,
            path: Self::make_path(account, external, index),
            raw,
            key_hash,
            script_hash_for_p2wpkh,
        }
    }

    pub fn make_path(account: u32, external: bool, index: u32) -> String {
        let chain = if external { EXTERNAL_CHAIN } else { INTERNAL_CHAIN };
        format!("{account}/{chain}/{index}")
    }

    /// Does `hash` identify this key in any supported output form
    pub fn matches(&self, hash: &[u8]) -> bool {
        self.key_hash == hash || self.script_hash_for_p2wpkh == hash || self.raw == hash
    }
}
