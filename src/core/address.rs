//! Address encoding
//!
//! Base58Check addresses for P2PKH/P2SH and BIP173 bech32 addresses for
//! segwit v0 programs, the latter through the `bech32` crate. Converters are tried in order by
//! `AddressConverterChain`; the first one that accepts an input wins.

use crate::core::network::Network;
use crate::core::public_key::PublicKey;
use crate::core::script::{lock_script, ScriptType};
use crate::crypto::double_sha256;
use bech32::{segwit, Fe32, Hrp};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

// =============================================================================
// Address Errors
// =============================================================================

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AddressError {
    #[error("Invalid checksum")]
    InvalidChecksum,
    #[error("Invalid length: {0}")]
    InvalidLength(usize),
    #[error("Unknown address prefix: {0:#04x}")]
    WrongPrefix(u8),
    #[error("Wrong human-readable part: expected {expected}, got {got}")]
    WrongHrp { expected: String, got: String },
    #[error("Invalid character: {0:?}")]
    InvalidCharacter(char),
    #[error("Mixed-case bech32 string")]
    MixedCase,
    #[error("Invalid bech32 address: {0}")]
    Bech32(String),
    #[error("Unsupported witness version: {0}")]
    InvalidWitnessVersion(u8),
    #[error("Unknown address type")]
    UnknownType,
    #[error("No address form for script type {0}")]
    UnsupportedScriptType(ScriptType),
}

// =============================================================================
// Address
// =============================================================================

/// A decoded address together with the locking script it pays to
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Address {
    pub string_value: String,
    pub script_type: ScriptType,
    pub key_hash: Vec<u8>,
    pub lock_script: Vec<u8>,
}

impl Address {
    fn new(string_value: String, script_type: ScriptType, key_hash: &[u8]) -> Result<Self, AddressError> {
        let lock_script = lock_script(script_type, key_hash)
            .map_err(|_| AddressError::InvalidLength(key_hash.len()))?;
        Ok(Self {
            string_value,
            script_type,
            key_hash: key_hash.to_vec(),
            lock_script,
        })
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.string_value)
    }
}

/// Converts between address strings and key hashes
pub trait AddressConverter: Send + Sync {
    fn convert_string(&self, address: &str) -> Result<Address, AddressError>;

    fn convert_key_hash(&self, key_hash: &[u8], script_type: ScriptType) -> Result<Address, AddressError>;
}

// =============================================================================
// Base58Check
// =============================================================================

/// Legacy version-byte-prefixed addresses
#[derive(Debug, Clone)]
pub struct Base58AddressConverter {
    pubkey_hash_prefix: u8,
    script_hash_prefix: u8,
}

impl Base58AddressConverter {
    pub fn new(network: Network) -> Self {
        Self {
            pubkey_hash_prefix: network.pubkey_hash_prefix(),
            script_hash_prefix: network.script_hash_prefix(),
        }
    }
}

/// Base58 encoding of `payload` followed by its 4-byte double-SHA256 checksum
pub fn base58check_encode(payload: &[u8]) -> String {
    let mut data = payload.to_vec();
    data.extend_from_slice(&double_sha256(payload)[..4]);
    bs58::encode(data).into_string()
}

pub fn base58check_decode(s: &str) -> Result<Vec<u8>, AddressError> {
    let data = bs58::decode(s).into_vec().map_err(|e| match e {
        bs58::decode::Error::InvalidCharacter { character, .. } => {
            AddressError::InvalidCharacter(character)
        }
        _ => AddressError::UnknownType,
    })?;

    if data.len() < 4 {
        return Err(AddressError::InvalidLength(data.len()));
    }
    let (payload, checksum) = data.split_at(data.len() - 4);
    if double_sha256(payload)[..4] != *checksum {
        return Err(AddressError::InvalidChecksum);
    }
    Ok(payload.to_vec())
}

impl AddressConverter for Base58AddressConverter {
    fn convert_string(&self, address: &str) -> Result<Address, AddressError> {
        let payload = base58check_decode(address)?;
        if payload.len() != 21 {
            return Err(AddressError::InvalidLength(payload.len()));
        }

        let script_type = match payload[0] {
            p if p == self.pubkey_hash_prefix => ScriptType::P2pkh,
            p if p == self.script_hash_prefix => ScriptType::P2sh,
            p => return Err(AddressError::WrongPrefix(p)),
        };
        Address::new(address.to_string(), script_type, &payload[1..])
    }

    fn convert_key_hash(&self, key_hash: &[u8], script_type: ScriptType) -> Result<Address, AddressError> {
        let prefix = match script_type {
            ScriptType::P2pkh | ScriptType::P2pk => self.pubkey_hash_prefix,
            ScriptType::P2sh | ScriptType::P2wpkhSh => self.script_hash_prefix,
            other => return Err(AddressError::UnsupportedScriptType(other)),
        };
        if key_hash.len() != 20 {
            return Err(AddressError::InvalidLength(key_hash.len()));
        }

        let mut payload = Vec::with_capacity(21);
        payload.push(prefix);
        payload.extend_from_slice(key_hash);

        let script_type = match script_type {
            ScriptType::P2pk => ScriptType::P2pkh,
            ScriptType::P2wpkhSh => ScriptType::P2sh,
            other => other,
        };
        Address::new(base58check_encode(&payload), script_type, key_hash)
    }
}

// =============================================================================
// Bech32 (BIP173 / BIP350)
// =============================================================================

fn witness_version(version: u8) -> Result<Fe32, AddressError> {
    if version > 16 {
        return Err(AddressError::InvalidWitnessVersion(version));
    }
    Fe32::try_from(version).map_err(|_| AddressError::InvalidWitnessVersion(version))
}

/// Encode a segwit program as a bech32 address
pub fn encode_segwit_address(hrp: &str, version: u8, program: &[u8]) -> Result<String, AddressError> {
    let hrp = Hrp::parse(hrp).map_err(|e| AddressError::Bech32(e.to_string()))?;
    segwit::encode(hrp, witness_version(version)?, program).map_err(|e| AddressError::Bech32(e.to_string()))
}

/// Decode a bech32 segwit address into (version, program)
pub fn decode_segwit_address(expected_hrp: &str, address: &str) -> Result<(u8, Vec<u8>), AddressError> {
    let has_lower = address.chars().any(|c| c.is_ascii_lowercase());
    let has_upper = address.chars().any(|c| c.is_ascii_uppercase());
    if has_lower && has_upper {
        return Err(AddressError::MixedCase);
    }

    let (hrp, version, program) = segwit::decode(address).map_err(|e| AddressError::Bech32(e.to_string()))?;
    let hrp = hrp.as_str().to_ascii_lowercase();
    if hrp != expected_hrp {
        return Err(AddressError::WrongHrp {
            expected: expected_hrp.to_string(),
            got: hrp,
        });
    }
    Ok((version.to_u8(), program))
}

/// Native segwit v0 addresses
#[derive(Debug, Clone)]
pub struct SegwitAddressConverter {
    hrp: &'static str,
}

impl SegwitAddressConverter {
    pub fn new(network: Network) -> Self {
        Self {
            hrp: network.bech32_hrp(),
        }
    }
}

impl AddressConverter for SegwitAddressConverter {
    fn convert_string(&self, address: &str) -> Result<Address, AddressError> {
        let (version, program) = decode_segwit_address(self.hrp, address)?;
        if version != 0 {
            return Err(AddressError::InvalidWitnessVersion(version));
        }
        let script_type = match program.len() {
            20 => ScriptType::P2wpkh,
            _ => ScriptType::P2wsh,
        };
        Address::new(address.to_ascii_lowercase(), script_type, &program)
    }

    fn convert_key_hash(&self, key_hash: &[u8], script_type: ScriptType) -> Result<Address, AddressError> {
        let expected_len = match script_type {
            ScriptType::P2wpkh => 20,
            ScriptType::P2wsh => 32,
            other => return Err(AddressError::UnsupportedScriptType(other)),
        };
        if key_hash.len() != expected_len {
            return Err(AddressError::InvalidLength(key_hash.len()));
        }
        let string_value = encode_segwit_address(self.hrp, 0, key_hash)?;
        Address::new(string_value, script_type, key_hash)
    }
}

// =============================================================================
// Converter Chain
// =============================================================================

/// Tries each converter in registration order
pub struct AddressConverterChain {
    converters: Vec<Box<dyn AddressConverter>>,
}

impl AddressConverterChain {
    pub fn new() -> Self {
        Self {
            converters: Vec::new(),
        }
    }

    /// Base58 and bech32 converters for `network`
    pub fn for_network(network: Network) -> Self {
        let mut chain = Self::new();
        chain.append(Box::new(SegwitAddressConverter::new(network)));
        chain.append(Box::new(Base58AddressConverter::new(network)));
        chain
    }

    pub fn append(&mut self, converter: Box<dyn AddressConverter>) {
        self.converters.push(converter);
    }

    /// Insert ahead of the existing converters
    pub fn prepend(&mut self, converter: Box<dyn AddressConverter>) {
        self.converters.insert(0, converter);
    }

    /// Address of a wallet key for the given output type
    pub fn convert_public_key(&self, public_key: &PublicKey, script_type: ScriptType) -> Result<Address, AddressError> {
        match script_type {
            ScriptType::P2wpkhSh => {
                self.convert_key_hash(&public_key.script_hash_for_p2wpkh, ScriptType::P2wpkhSh)
            }
            other => self.convert_key_hash(&public_key.key_hash, other),
        }
    }
}

impl Default for AddressConverterChain {
    fn default() -> Self {
        Self::new()
    }
}

impl AddressConverter for AddressConverterChain {
    fn convert_string(&self, address: &str) -> Result<Address, AddressError> {
        let mut last_error = AddressError::UnknownType;
        for converter in &self.converters {
            match converter.convert_string(address) {
                Ok(address) => return Ok(address),
                Err(e) => last_error = e,
            }
        }
        Err(last_error)
    }

    fn convert_key_hash(&self, key_hash: &[u8], script_type: ScriptType) -> Result<Address, AddressError> {
        let mut last_error = AddressError::UnsupportedScriptType(script_type);
        for converter in &self.converters {
            match converter.convert_key_hash(key_hash, script_type) {
                Ok(address) => return Ok(address),
                Err(e) => last_error = e,
            }
        }
        Err(last_error)
    }
}
