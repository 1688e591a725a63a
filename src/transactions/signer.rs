//! Input signing
//!
//! Signature hashes are computed over the unsigned transaction; legacy
//! sighashes blank every other input's script and BIP143 ones ignore
//! scripts entirely, so all inputs can be hashed before any is filled in.

use crate::core::script::{lock_script, p2wpkh_redeem_script, push_data, ScriptError, SIGHASH_ALL};
use crate::core::{EncodingError, ScriptType};
use crate::crypto::{sign_der, KeyError};
use crate::transactions::mutable::MutableTransaction;
use crate::wallet::{KeyDerivationError, KeyDeriver};
use std::sync::Arc;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SignError {
    #[error("No private key for {0}")]
    NoPrivateKey(String),
    #[error("Cannot sign an input spending {0}")]
    UnsupportedScriptType(ScriptType),
    #[error("Key error: {0}")]
    Key(#[from] KeyError),
    #[error("Script error: {0}")]
    Script(#[from] ScriptError),
    #[error("Encoding error: {0}")]
    Encoding(#[from] EncodingError),
}

pub struct TransactionSigner {
    deriver: Arc<dyn KeyDeriver>,
}

/// Unlocking data of one input
struct Unlock {
    signature_script: Vec<u8>,
    witness: Vec<Vec<u8>>,
}

impl TransactionSigner {
    pub fn new(deriver: Arc<dyn KeyDeriver>) -> Self {
        Self { deriver }
    }

    pub fn sign(&self, mutable: &mut MutableTransaction) -> Result<(), SignError> {
        let unsigned = mutable.to_transaction();
        let mut unlocks = Vec::with_capacity(mutable.inputs_to_sign.len());

        for (index, to_sign) in mutable.inputs_to_sign.iter().enumerate() {
            let key = &to_sign.previous_output_public_key;
            let secret = self
                .deriver
                .private_key_for(key)
                .map_err(|e: KeyDerivationError| {
                    log::warn!("Cannot derive private key {}: {}", key.path, e);
                    SignError::NoPrivateKey(key.path.clone())
                })?;

            let previous = &to_sign.previous_output;
            let sighash = match previous.script_type {
                ScriptType::P2pkh | ScriptType::P2pk => {
                    unsigned.legacy_sighash(index, &previous.lock_script, SIGHASH_ALL)
                }
                ScriptType::P2wpkh | ScriptType::P2wpkhSh => {
                    let script_code = lock_script(ScriptType::P2pkh, &key.key_hash)?;
                    unsigned.witness_v0_sighash(index, &script_code, previous.value, SIGHASH_ALL)?
                }
                other => return Err(SignError::UnsupportedScriptType(other)),
            };

            let mut signature = sign_der(&secret, &sighash)?;
            signature.push(SIGHASH_ALL);

            let unlock = match previous.script_type {
                ScriptType::P2pkh => {
                    let mut script = Vec::with_capacity(signature.len() + key.raw.len() + 2);
                    push_data(&mut script, &signature);
                    push_data(&mut script, &key.raw);
                    Unlock {
                        signature_script: script,
                        witness: Vec::new(),
                    }
                }
                ScriptType::P2pk => {
                    let mut script = Vec::with_capacity(signature.len() + 1);
                    push_data(&mut script, &signature);
                    Unlock {
                        signature_script: script,
                        witness: Vec::new(),
                    }
                }
                ScriptType::P2wpkh => Unlock {
                    signature_script: Vec::new(),
                    witness: vec![signature, key.raw.clone()],
                },
                _ => {
                    let mut script = Vec::with_capacity(23);
                    push_data(&mut script, &p2wpkh_redeem_script(&key.key_hash));
                    Unlock {
                        signature_script: script,
                        witness: vec![signature, key.raw.clone()],
                    }
                }
            };
            unlocks.push(unlock);
        }

        for (to_sign, unlock) in mutable.inputs_to_sign.iter_mut().zip(unlocks) {
            to_sign.input.signature_script = unlock.signature_script;
            to_sign.input.witness = unlock.witness;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::script::{classify_input, parse_chunks};
    use crate::core::{Input, OutPoint, Output, PublicKey, SEQUENCE_LOCKTIME};
    use crate::crypto::{verify_der, Hash256};
    use crate::test_utils::{p2pkh_output_to, test_deriver, wallet_key};
    use crate::transactions::mutable::InputToSign;

    fn spend_of(output: Output, key: PublicKey) -> MutableTransaction {
        let mut mutable = MutableTransaction::new();
        mutable.add_input(InputToSign {
            input: Input::new(OutPoint::new(Hash256::digest(b"funding"), 0), Vec::new(), SEQUENCE_LOCKTIME),
            previous_output: output,
            previous_output_public_key: key,
        });
        mutable.outputs = vec![Output::new(
            9_000,
            0,
            lock_script(ScriptType::P2pkh, &[3u8; 20]).unwrap(),
        )];
        mutable
    }

    #[test]
    fn test_sign_p2pkh() {
        let key = wallet_key(0, true);
        let previous = p2pkh_output_to(&key, 10_000, 0);
        let mut mutable = spend_of(previous.clone(), key.clone());

        TransactionSigner::new(test_deriver()).sign(&mut mutable).unwrap();
        let tx = mutable.to_transaction();

        let chunks = parse_chunks(&tx.inputs[0].signature_script).unwrap();
        let signature = chunks[0].data.clone().unwrap();
        assert_eq!(chunks[1].data.as_deref(), Some(key.raw.as_slice()));
        assert_eq!(*signature.last().unwrap(), SIGHASH_ALL);

        let sighash = tx.legacy_sighash(0, &previous.lock_script, SIGHASH_ALL);
        assert!(verify_der(&key.raw, &sighash, &signature[..signature.len() - 1]).unwrap());
        assert_eq!(
            classify_input(&tx.inputs[0].signature_script, &[]).key_hash,
            Some(key.key_hash.clone())
        );
    }

    #[test]
    fn test_sign_p2wpkh_and_nested() {
        let key = wallet_key(1, false);
        let script = lock_script(ScriptType::P2wpkh, &key.key_hash).unwrap();
        let previous = Output::with_type(20_000, 0, script, ScriptType::P2wpkh, Some(key.key_hash.clone()));
        let mut mutable = spend_of(previous, key.clone());

        TransactionSigner::new(test_deriver()).sign(&mut mutable).unwrap();
        let tx = mutable.to_transaction();
        assert!(tx.header.segwit);
        assert!(tx.inputs[0].signature_script.is_empty());
        assert_eq!(tx.inputs[0].witness.len(), 2);

        let script_code = lock_script(ScriptType::P2pkh, &key.key_hash).unwrap();
        let sighash = tx.witness_v0_sighash(0, &script_code, 20_000, SIGHASH_ALL).unwrap();
        let signature = &tx.inputs[0].witness[0];
        assert!(verify_der(&key.raw, &sighash, &signature[..signature.len() - 1]).unwrap());

        let script = lock_script(ScriptType::P2wpkhSh, &key.script_hash_for_p2wpkh).unwrap();
        let previous = Output::with_type(20_000, 0, script, ScriptType::P2wpkhSh, None);
        let mut mutable = spend_of(previous, key.clone());
        TransactionSigner::new(test_deriver()).sign(&mut mutable).unwrap();
        let input = &mutable.inputs_to_sign[0].input;
        let classified = classify_input(&input.signature_script, &input.witness);
        assert_eq!(classified.script_type, ScriptType::P2wpkhSh);
        assert_eq!(classified.key_hash, Some(key.script_hash_for_p2wpkh.clone()));
    }

    #[test]
    fn test_unsupported_type() {
        let key = wallet_key(0, true);
        let previous = Output::with_type(1_000, 0, vec![0x51], ScriptType::P2wsh, None);
        let mut mutable = spend_of(previous, key);
        assert!(matches!(
            TransactionSigner::new(test_deriver()).sign(&mut mutable),
            Err(SignError::UnsupportedScriptType(ScriptType::P2wsh))
        ));
    }
}
