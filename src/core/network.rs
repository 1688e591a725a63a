//! Chain parameters
//!
//! Everything that differs between mainnet, testnet and regtest: wire
//! magic, ports, address prefixes, dust policy and which header checks
//! apply.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

// =============================================================================
// Constants
// =============================================================================

/// Protocol version advertised in `version`
pub const PROTOCOL_VERSION: i32 = 70015;

/// Lowest peer protocol version that supports bloom filtering
pub const MIN_BLOOM_PROTOCOL_VERSION: i32 = 70011;

/// Blocks between difficulty adjustments
pub const RETARGET_INTERVAL: u32 = 2016;

/// Two weeks, the target duration of one retarget window
pub const TARGET_TIMESPAN: u32 = 14 * 24 * 60 * 60;

/// Policy dust relay fee (sat/kB) used by Bitcoin Core
pub const DEFAULT_DUST_RELAY_FEE: u64 = 3000;

/// The blockchain a kit instance operates on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Network {
    #[default]
    Mainnet,
    Testnet,
    Regtest,
}

impl Network {
    /// Four magic bytes starting every wire message
    pub fn magic(&self) -> [u8; 4] {
        match self {
            Network::Mainnet => [0xf9, 0xbe, 0xb4, 0xd9],
            Network::Testnet => [0x0b, 0x11, 0x09, 0x07],
            Network::Regtest => [0xfa, 0xbf, 0xb5, 0xda],
        }
    }

    pub fn default_port(&self) -> u16 {
        match self {
            Network::Mainnet => 8333,
            Network::Testnet => 18333,
            Network::Regtest => 18444,
        }
    }

    /// Base58Check version byte for P2PKH addresses
    pub fn pubkey_hash_prefix(&self) -> u8 {
        match self {
            Network::Mainnet => 0x00,
            Network::Testnet | Network::Regtest => 0x6f,
        }
    }

    /// Base58Check version byte for P2SH addresses
    pub fn script_hash_prefix(&self) -> u8 {
        match self {
            Network::Mainnet => 0x05,
            Network::Testnet | Network::Regtest => 0xc4,
        }
    }

    /// Human-readable part of bech32 addresses
    pub fn bech32_hrp(&self) -> &'static str {
        match self {
            Network::Mainnet => "bc",
            Network::Testnet => "tb",
            Network::Regtest => "bcrt",
        }
    }

    /// BIP44 coin type
    pub fn coin_type(&self) -> u32 {
        match self {
            Network::Mainnet => 0,
            Network::Testnet | Network::Regtest => 1,
        }
    }

    pub fn dust_relay_fee(&self) -> u64 {
        DEFAULT_DUST_RELAY_FEE
    }

    /// Lowest allowed difficulty, in compact form
    pub fn max_target_bits(&self) -> u32 {
        match self {
            Network::Mainnet | Network::Testnet => 0x1d00_ffff,
            Network::Regtest => 0x207f_ffff,
        }
    }

    /// Headers must carry a hash meeting their `bits`
    pub fn checks_proof_of_work(&self) -> bool {
        !matches!(self, Network::Regtest)
    }

    /// `bits` must follow the 2016-block retarget rule. Testnet is excluded
    /// because its 20-minute minimum-difficulty exception breaks it.
    pub fn checks_difficulty_transitions(&self) -> bool {
        matches!(self, Network::Mainnet)
    }
}

impl fmt::Display for Network {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Network::Mainnet => "mainnet",
            Network::Testnet => "testnet",
            Network::Regtest => "regtest",
        };
        f.write_str(name)
    }
}

impl FromStr for Network {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "mainnet" | "main" | "bitcoin" => Ok(Network::Mainnet),
            "testnet" | "test" => Ok(Network::Testnet),
            "regtest" => Ok(Network::Regtest),
            other => Err(format!("unknown network: {other}")),
        }
    }
}
