//! Script classification and construction
//!
//! Only the standard templates a wallet needs are understood: there is no
//! script interpreter. Locking scripts are classified into a `ScriptType`
//! with the hash (or raw key, for P2PK) they commit to; unlocking scripts
//! and witnesses are inspected to recover the spender's key hash.

use crate::crypto::hash160;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

// =============================================================================
// Opcodes
// =============================================================================

pub const OP_0: u8 = 0x00;
pub const OP_PUSHDATA1: u8 = 0x4c;
pub const OP_PUSHDATA2: u8 = 0x4d;
pub const OP_PUSHDATA4: u8 = 0x4e;
pub const OP_1NEGATE: u8 = 0x4f;
pub const OP_1: u8 = 0x51;
pub const OP_16: u8 = 0x60;
pub const OP_RETURN: u8 = 0x6a;
pub const OP_DUP: u8 = 0x76;
pub const OP_EQUAL: u8 = 0x87;
pub const OP_EQUALVERIFY: u8 = 0x88;
pub const OP_HASH160: u8 = 0xa9;
pub const OP_CHECKSIG: u8 = 0xac;
pub const OP_CHECKMULTISIG: u8 = 0xae;

/// SIGHASH_ALL, the only signature hash type produced by the signer
pub const SIGHASH_ALL: u8 = 0x01;

/// Maximum size of a standard script
pub const MAX_SCRIPT_SIZE: usize = 10_000;

// =============================================================================
// Script Errors
// =============================================================================

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ScriptError {
    #[error("Truncated push at offset {0}")]
    TruncatedPush(usize),
    #[error("Script too large: {0} bytes")]
    ScriptTooLarge(usize),
    #[error("Wrong hash length {len} for {script_type}")]
    WrongHashLength { script_type: ScriptType, len: usize },
    #[error("Cannot build a locking script for {0}")]
    UnsupportedType(ScriptType),
}

// =============================================================================
// Script Types
// =============================================================================

/// Standard output templates
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ScriptType {
    #[default]
    Unknown,
    P2pkh,
    P2pk,
    P2sh,
    P2wpkh,
    P2wsh,
    /// P2WPKH nested in P2SH; on-chain it looks like P2SH
    P2wpkhSh,
    NullData,
}

impl ScriptType {
    /// Spending this type places the signature in the witness
    pub fn is_witness(&self) -> bool {
        matches!(self, ScriptType::P2wpkh | ScriptType::P2wsh | ScriptType::P2wpkhSh)
    }

    /// Types whose key hash matches a wallet public key directly
    pub fn is_key_hash(&self) -> bool {
        matches!(self, ScriptType::P2pkh | ScriptType::P2wpkh)
    }

    /// Spends of these carry no key push a bloom filter can match, so
    /// their outpoints are tracked individually
    pub fn is_irregular(&self) -> bool {
        matches!(self, ScriptType::P2pk | ScriptType::P2wpkh | ScriptType::P2wpkhSh)
    }
}

impl fmt::Display for ScriptType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ScriptType::Unknown => "unknown",
            ScriptType::P2pkh => "p2pkh",
            ScriptType::P2pk => "p2pk",
            ScriptType::P2sh => "p2sh",
            ScriptType::P2wpkh => "p2wpkh",
            ScriptType::P2wsh => "p2wsh",
            ScriptType::P2wpkhSh => "p2wpkh_sh",
            ScriptType::NullData => "null_data",
        };
        f.write_str(name)
    }
}

// =============================================================================
// Chunks
// =============================================================================

/// One parsed script element: an opcode, with data when it is a push
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    pub opcode: u8,
    pub data: Option<Vec<u8>>,
}

impl Chunk {
    pub fn is_push(&self) -> bool {
        self.data.is_some()
    }
}

/// Split a script into opcodes and pushes
pub fn parse_chunks(script: &[u8]) -> Result<Vec<Chunk>, ScriptError> {
    if script.len() > MAX_SCRIPT_SIZE {
        return Err(ScriptError::ScriptTooLarge(script.len()));
    }

    let mut chunks = Vec::new();
    let mut i = 0;

    while i < script.len() {
        let opcode = script[i];
        let start = i;
        i += 1;

        let len = match opcode {
            OP_0 => 0,
            0x01..=0x4b => opcode as usize,
            OP_PUSHDATA1 => {
                let len = *script.get(i).ok_or(ScriptError::TruncatedPush(start))? as usize;
                i += 1;
                len
            }
            OP_PUSHDATA2 => {
                let bytes = script.get(i..i + 2).ok_or(ScriptError::TruncatedPush(start))?;
                i += 2;
                u16::from_le_bytes([bytes[0], bytes[1]]) as usize
            }
            OP_PUSHDATA4 => {
                let bytes = script.get(i..i + 4).ok_or(ScriptError::TruncatedPush(start))?;
                i += 4;
                u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as usize
            }
            _ => {
                chunks.push(Chunk { opcode, data: None });
                continue;
            }
        };

        let data = script.get(i..i + len).ok_or(ScriptError::TruncatedPush(start))?;
        i += len;
        chunks.push(Chunk {
            opcode,
            data: Some(data.to_vec()),
        });
    }

    Ok(chunks)
}

/// Append a minimal push of `data`
pub fn push_data(script: &mut Vec<u8>, data: &[u8]) {
    match data.len() {
        0 => script.push(OP_0),
        len @ 1..=0x4b => script.push(len as u8),
        len @ 0x4c..=0xff => {
            script.push(OP_PUSHDATA1);
            script.push(len as u8);
        }
        len @ 0x100..=0xffff => {
            script.push(OP_PUSHDATA2);
            script.extend_from_slice(&(len as u16).to_le_bytes());
        }
        len => {
            script.push(OP_PUSHDATA4);
            script.extend_from_slice(&(len as u32).to_le_bytes());
        }
    }
    script.extend_from_slice(data);
}

// =============================================================================
// Output Classification
// =============================================================================

/// Result of classifying a locking script
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputScript {
    pub script_type: ScriptType,
    /// Key hash or script hash the script commits to; the raw key for P2PK
    pub key_hash: Option<Vec<u8>>,
}

/// Classify a locking script
pub fn classify_output(script: &[u8]) -> OutputScript {
    let (script_type, key_hash) = match script {
        [OP_DUP, OP_HASH160, 0x14, hash @ .., OP_EQUALVERIFY, OP_CHECKSIG] if hash.len() == 20 => {
            (ScriptType::P2pkh, Some(hash.to_vec()))
        }
        [OP_HASH160, 0x14, hash @ .., OP_EQUAL] if hash.len() == 20 => {
            (ScriptType::P2sh, Some(hash.to_vec()))
        }
        [OP_0, 0x14, hash @ ..] if hash.len() == 20 => (ScriptType::P2wpkh, Some(hash.to_vec())),
        [OP_0, 0x20, hash @ ..] if hash.len() == 32 => (ScriptType::P2wsh, Some(hash.to_vec())),
        [len, key @ .., OP_CHECKSIG] if (*len == 33 || *len == 65) && key.len() == *len as usize => {
            (ScriptType::P2pk, Some(key.to_vec()))
        }
        [OP_RETURN, ..] => (ScriptType::NullData, None),
        _ => (ScriptType::Unknown, None),
    };

    OutputScript {
        script_type,
        key_hash,
    }
}

/// Build the locking script for a hash (or raw key for P2PK)
pub fn lock_script(script_type: ScriptType, hash: &[u8]) -> Result<Vec<u8>, ScriptError> {
    let expect_len = |len: usize| {
        if hash.len() == len {
            Ok(())
        } else {
            Err(ScriptError::WrongHashLength {
                script_type,
                len: hash.len(),
            })
        }
    };

    let mut script = Vec::with_capacity(hash.len() + 5);
    match script_type {
        ScriptType::P2pkh => {
            expect_len(20)?;
            script.extend_from_slice(&[OP_DUP, OP_HASH160, 0x14]);
            script.extend_from_slice(hash);
            script.extend_from_slice(&[OP_EQUALVERIFY, OP_CHECKSIG]);
        }
        ScriptType::P2sh | ScriptType::P2wpkhSh => {
            expect_len(20)?;
            script.extend_from_slice(&[OP_HASH160, 0x14]);
            script.extend_from_slice(hash);
            script.push(OP_EQUAL);
        }
        ScriptType::P2wpkh => {
            expect_len(20)?;
            script.extend_from_slice(&[OP_0, 0x14]);
            script.extend_from_slice(hash);
        }
        ScriptType::P2wsh => {
            expect_len(32)?;
            script.extend_from_slice(&[OP_0, 0x20]);
            script.extend_from_slice(hash);
        }
        ScriptType::P2pk => {
            if hash.len() != 33 && hash.len() != 65 {
                return Err(ScriptError::WrongHashLength {
                    script_type,
                    len: hash.len(),
                });
            }
            push_data(&mut script, hash);
            script.push(OP_CHECKSIG);
        }
        ScriptType::NullData => {
            script.push(OP_RETURN);
            push_data(&mut script, hash);
        }
        ScriptType::Unknown => return Err(ScriptError::UnsupportedType(script_type)),
    }

    Ok(script)
}

/// Redeem script of a P2WPKH-in-P2SH output: `OP_0 <20-byte key hash>`
pub fn p2wpkh_redeem_script(key_hash: &[u8]) -> Vec<u8> {
    let mut script = Vec::with_capacity(22);
    script.extend_from_slice(&[OP_0, 0x14]);
    script.extend_from_slice(key_hash);
    script
}

// =============================================================================
// Input Classification
// =============================================================================

/// What can be learned about a spender from its unlocking data
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InputScript {
    pub script_type: ScriptType,
    pub key_hash: Option<Vec<u8>>,
    pub redeem_script: Option<Vec<u8>>,
}

fn is_public_key(data: &[u8]) -> bool {
    match data.len() {
        33 => data[0] == 0x02 || data[0] == 0x03,
        65 => data[0] == 0x04,
        _ => false,
    }
}

fn is_signature(data: &[u8]) -> bool {
    // DER sequence tag plus a trailing sighash byte
    (9..=73).contains(&data.len()) && data[0] == 0x30
}

/// Inspect a signature script and witness to find the spender's type
pub fn classify_input(signature_script: &[u8], witness: &[Vec<u8>]) -> InputScript {
    let unknown = InputScript {
        script_type: ScriptType::Unknown,
        key_hash: None,
        redeem_script: None,
    };

    let chunks = match parse_chunks(signature_script) {
        Ok(chunks) => chunks,
        Err(_) => return unknown,
    };

    // Native segwit
    if chunks.is_empty() {
        return match witness {
            [sig, key] if is_signature(sig) && is_public_key(key) => InputScript {
                script_type: ScriptType::P2wpkh,
                key_hash: Some(hash160(key).to_vec()),
                redeem_script: None,
            },
            _ => unknown,
        };
    }

    let pushes: Vec<&[u8]> = chunks.iter().filter_map(|c| c.data.as_deref()).collect();
    if pushes.len() != chunks.len() {
        return unknown;
    }

    match pushes.as_slice() {
        [sig, key] if is_signature(sig) && is_public_key(key) => InputScript {
            script_type: ScriptType::P2pkh,
            key_hash: Some(hash160(key).to_vec()),
            redeem_script: None,
        },
        [redeem] if redeem.len() == 22 && redeem[0] == OP_0 && redeem[1] == 0x14 => InputScript {
            script_type: ScriptType::P2wpkhSh,
            key_hash: Some(hash160(redeem).to_vec()),
            redeem_script: Some(redeem.to_vec()),
        },
        [sig] if is_signature(sig) => InputScript {
            script_type: ScriptType::P2pk,
            key_hash: None,
            redeem_script: None,
        },
        [.., last] if pushes.len() >= 2 && parse_chunks(last).map_or(false, |c| !c.is_empty()) => {
            InputScript {
                script_type: ScriptType::P2sh,
                key_hash: Some(hash160(last).to_vec()),
                redeem_script: Some(last.to_vec()),
            }
        }
        _ => unknown,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fake_sig() -> Vec<u8> {
        let mut sig = vec![0x30; 71];
        sig.push(SIGHASH_ALL);
        sig
    }

    fn fake_key() -> Vec<u8> {
        let mut key = vec![0x02];
        key.extend_from_slice(&[0x11; 32]);
        key
    }

    #[test]
    fn test_classify_standard_outputs() {
        let hash = [0xab; 20];

        for script_type in [ScriptType::P2pkh, ScriptType::P2sh, ScriptType::P2wpkh] {
            let script = lock_script(script_type, &hash).unwrap();
            let classified = classify_output(&script);
            assert_eq!(classified.script_type, script_type);
            assert_eq!(classified.key_hash, Some(hash.to_vec()));
        }

        let wsh = lock_script(ScriptType::P2wsh, &[0xcd; 32]).unwrap();
        assert_eq!(classify_output(&wsh).script_type, ScriptType::P2wsh);

        let p2pk = lock_script(ScriptType::P2pk, &fake_key()).unwrap();
        let classified = classify_output(&p2pk);
        assert_eq!(classified.script_type, ScriptType::P2pk);
        assert_eq!(classified.key_hash, Some(fake_key()));
    }

    #[test]
    fn test_nested_segwit_locks_as_p2sh() {
        let script = lock_script(ScriptType::P2wpkhSh, &[1; 20]).unwrap();
        assert_eq!(classify_output(&script).script_type, ScriptType::P2sh);
    }

    #[test]
    fn test_null_data_and_unknown() {
        let script = lock_script(ScriptType::NullData, b"hello").unwrap();
        assert_eq!(classify_output(&script).script_type, ScriptType::NullData);
        assert_eq!(classify_output(&[0x51, 0x52]).script_type, ScriptType::Unknown);
        assert!(lock_script(ScriptType::Unknown, &[]).is_err());
    }

    #[test]
    fn test_wrong_hash_length() {
        assert!(matches!(
            lock_script(ScriptType::P2pkh, &[0; 19]),
            Err(ScriptError::WrongHashLength { len: 19, .. })
        ));
    }

    #[test]
    fn test_parse_chunks_pushdata() {
        let mut script = Vec::new();
        push_data(&mut script, &[7; 80]);
        script.push(OP_CHECKSIG);

        let chunks = parse_chunks(&script).unwrap();
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].opcode, OP_PUSHDATA1);
        assert_eq!(chunks[0].data.as_ref().unwrap().len(), 80);
        assert!(!chunks[1].is_push());

        assert_eq!(parse_chunks(&[0x05, 0x01]), Err(ScriptError::TruncatedPush(0)));
    }

    #[test]
    fn test_classify_inputs() {
        let mut p2pkh = Vec::new();
        push_data(&mut p2pkh, &fake_sig());
        push_data(&mut p2pkh, &fake_key());
        let input = classify_input(&p2pkh, &[]);
        assert_eq!(input.script_type, ScriptType::P2pkh);
        assert_eq!(input.key_hash, Some(hash160(&fake_key()).to_vec()));

        let input = classify_input(&[], &[fake_sig(), fake_key()]);
        assert_eq!(input.script_type, ScriptType::P2wpkh);

        let redeem = p2wpkh_redeem_script(&hash160(&fake_key()));
        let mut nested = Vec::new();
        push_data(&mut nested, &redeem);
        let input = classify_input(&nested, &[fake_sig(), fake_key()]);
        assert_eq!(input.script_type, ScriptType::P2wpkhSh);
        assert_eq!(input.key_hash, Some(hash160(&redeem).to_vec()));

        let mut p2pk = Vec::new();
        push_data(&mut p2pk, &fake_sig());
        assert_eq!(classify_input(&p2pk, &[]).script_type, ScriptType::P2pk);
    }

    #[test]
    fn test_classify_p2sh_multisig_input() {
        let mut redeem = vec![OP_1];
        push_data(&mut redeem, &fake_key());
        redeem.extend_from_slice(&[OP_1, OP_CHECKMULTISIG]);

        let mut script = vec![OP_0];
        push_data(&mut script, &fake_sig());
        push_data(&mut script, &redeem);

        let input = classify_input(&script, &[]);
        assert_eq!(input.script_type, ScriptType::P2sh);
        assert_eq!(input.redeem_script, Some(redeem.clone()));
        assert_eq!(input.key_hash, Some(hash160(&redeem).to_vec()));
    }
}
