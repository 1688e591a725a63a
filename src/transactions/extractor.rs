//! Transaction extraction
//!
//! Classifies every output and input, ties outputs to wallet keys and
//! computes what the transaction means for the wallet.

use crate::core::script::p2wpkh_redeem_script;
use crate::core::{
    classify_input, classify_output, AddressConverter, AddressConverterChain, FullTransaction,
    Output, ScriptType, TransactionType,
};
use crate::crypto::hash160;
use crate::storage::{Storage, StorageResult};
use std::sync::Arc;

pub struct TransactionExtractor {
    storage: Arc<dyn Storage>,
    address_converter: Arc<AddressConverterChain>,
}

impl TransactionExtractor {
    pub fn new(storage: Arc<dyn Storage>, address_converter: Arc<AddressConverterChain>) -> Self {
        Self {
            storage,
            address_converter,
        }
    }

    pub fn extract(&self, tx: &mut FullTransaction) -> StorageResult<()> {
        self.extract_outputs(tx)?;
        self.extract_inputs(tx);
        self.extract_metadata(tx)?;
        self.extract_output_addresses(tx);
        Ok(())
    }

    /// Script types and wallet ownership of outputs
    fn extract_outputs(&self, tx: &mut FullTransaction) -> StorageResult<()> {
        for output in &mut tx.outputs {
            let classified = classify_output(&output.lock_script);
            output.script_type = classified.script_type;
            output.key_hash = classified.key_hash;

            let Some(hash) = output.key_hash.as_deref() else {
                continue;
            };
            let Some(key) = self.storage.public_key_by_hash(hash)? else {
                continue;
            };

            let owned = match output.script_type {
                ScriptType::P2pkh | ScriptType::P2wpkh => key.key_hash == hash,
                ScriptType::P2pk => key.raw == hash,
                ScriptType::P2sh if key.script_hash_for_p2wpkh == hash => {
                    output.script_type = ScriptType::P2wpkhSh;
                    output.redeem_script = Some(p2wpkh_redeem_script(&key.key_hash));
                    true
                }
                _ => false,
            };
            if owned {
                output.public_key_path = Some(key.path.clone());
                output.change_output = !key.external;
            }
        }
        Ok(())
    }

    /// Spender key hashes and addresses from unlocking data
    fn extract_inputs(&self, tx: &mut FullTransaction) {
        for input in &mut tx.inputs {
            let classified = classify_input(&input.signature_script, &input.witness);
            input.address = classified.key_hash.as_deref().and_then(|hash| {
                self.address_converter
                    .convert_key_hash(hash, classified.script_type)
                    .ok()
                    .map(|a| a.string_value)
            });
            input.key_hash = classified.key_hash;
        }
    }

    fn extract_metadata(&self, tx: &mut FullTransaction) -> StorageResult<()> {
        let mut previous_outputs: Vec<Option<Output>> = Vec::with_capacity(tx.inputs.len());
        for input in &tx.inputs {
            previous_outputs.push(self.storage.output(&input.previous_output)?);
        }

        let mine_inputs: Vec<&Output> = previous_outputs
            .iter()
            .flatten()
            .filter(|o| o.is_mine())
            .collect();
        let mine_input_value: u64 = mine_inputs.iter().map(|o| o.value).sum();
        let mine_output_value: u64 = tx.outputs.iter().filter(|o| o.is_mine()).map(|o| o.value).sum();

        let is_outgoing = !mine_inputs.is_empty();
        tx.header.is_outgoing = is_outgoing;
        tx.header.is_mine = is_outgoing || tx.outputs.iter().any(|o| o.is_mine());

        tx.metadata.fee = if is_outgoing && mine_inputs.len() == tx.inputs.len() {
            Some(mine_input_value.saturating_sub(tx.total_output()))
        } else {
            None
        };
        tx.metadata.amount = mine_output_value as i64 - mine_input_value as i64;
        tx.metadata.transaction_type = if !is_outgoing {
            TransactionType::Incoming
        } else if tx
            .outputs
            .iter()
            .all(|o| o.is_mine() || o.script_type == ScriptType::NullData)
        {
            TransactionType::SentToSelf
        } else {
            TransactionType::Outgoing
        };
        Ok(())
    }

    /// Display addresses of outputs
    fn extract_output_addresses(&self, tx: &mut FullTransaction) {
        for output in tx.outputs.iter_mut().filter(|o| o.address.is_none()) {
            let Some(hash) = output.key_hash.as_deref() else {
                continue;
            };
            let converted = match output.script_type {
                ScriptType::P2pk => self
                    .address_converter
                    .convert_key_hash(&hash160(hash), ScriptType::P2pkh),
                other => self.address_converter.convert_key_hash(hash, other),
            };
            output.address = converted.ok().map(|a| a.string_value);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::script::lock_script;
    use crate::core::{Input, Network, OutPoint, Transaction, SEQUENCE_FINAL};
    use crate::crypto::Hash256;
    use crate::storage::MemoryStorage;
    use crate::test_utils::{incoming_transaction, spending_transaction, storage_with_keys};

    fn extractor(storage: Arc<MemoryStorage>) -> TransactionExtractor {
        TransactionExtractor::new(storage, Arc::new(AddressConverterChain::for_network(Network::Mainnet)))
    }

    fn raw(tx: &FullTransaction) -> FullTransaction {
        FullTransaction::deserialize(&tx.serialize()).unwrap()
    }

    #[test]
    fn test_outputs_of_every_owned_type() {
        let storage = storage_with_keys(2);
        let key = storage.public_key("0/0/1").unwrap().unwrap();
        let change = storage.public_key("0/1/0").unwrap().unwrap();

        let outputs = vec![
            Output::new(1_000, 0, lock_script(ScriptType::P2pkh, &key.key_hash).unwrap()),
            Output::new(2_000, 1, lock_script(ScriptType::P2wpkh, &change.key_hash).unwrap()),
            Output::new(3_000, 2, lock_script(ScriptType::P2sh, &key.script_hash_for_p2wpkh).unwrap()),
            Output::new(4_000, 3, lock_script(ScriptType::P2pk, &key.raw).unwrap()),
            Output::new(5_000, 4, lock_script(ScriptType::P2pkh, &[1u8; 20]).unwrap()),
        ];
        let input = Input::new(OutPoint::new(Hash256::digest(b"x"), 0), vec![0x51], SEQUENCE_FINAL);
        let mut tx = FullTransaction::new(Transaction::default(), vec![input], outputs);

        extractor(storage).extract(&mut tx).unwrap();

        let types: Vec<_> = tx.outputs.iter().map(|o| o.script_type).collect();
        assert_eq!(
            types,
            vec![
                ScriptType::P2pkh,
                ScriptType::P2wpkh,
                ScriptType::P2wpkhSh,
                ScriptType::P2pk,
                ScriptType::P2pkh
            ]
        );
        let mine: Vec<_> = tx.outputs.iter().map(|o| o.is_mine()).collect();
        assert_eq!(mine, vec![true, true, true, true, false]);
        assert!(tx.outputs[1].change_output);
        assert!(!tx.outputs[0].change_output);
        assert!(tx.outputs[2].redeem_script.is_some());
        assert!(tx.outputs[1].address.as_deref().unwrap().starts_with("bc1q"));
        assert!(tx.outputs[2].address.as_deref().unwrap().starts_with('3'));

        assert!(tx.header.is_mine);
        assert!(!tx.header.is_outgoing);
        assert_eq!(tx.metadata.amount, 10_000);
        assert_eq!(tx.metadata.fee, None);
        assert_eq!(tx.metadata.transaction_type, TransactionType::Incoming);
    }

    #[test]
    fn test_outgoing_metadata() {
        let storage = storage_with_keys(2);
        let key = storage.public_key("0/0/0").unwrap().unwrap();
        let funding = incoming_transaction(&key, &[10_000, 6_000]);
        let outpoints: Vec<_> = funding.outputs.iter().map(|o| o.outpoint()).collect();
        storage.add_transaction(funding).unwrap();

        let mut tx = raw(&spending_transaction(&outpoints, 15_000));
        extractor(storage.clone()).extract(&mut tx).unwrap();
        assert!(tx.header.is_outgoing);
        assert_eq!(tx.metadata.fee, Some(1_000));
        assert_eq!(tx.metadata.amount, -16_000);
        assert_eq!(tx.metadata.transaction_type, TransactionType::Outgoing);

        // one foreign input: fee unknown
        let mut tx = raw(&spending_transaction(
            &[outpoints[0], OutPoint::new(Hash256::digest(b"foreign"), 3)],
            15_000,
        ));
        extractor(storage).extract(&mut tx).unwrap();
        assert!(tx.header.is_outgoing);
        assert_eq!(tx.metadata.fee, None);
        assert_eq!(tx.metadata.amount, -10_000);
    }

    #[test]
    fn test_sent_to_self() {
        let storage = storage_with_keys(2);
        let key = storage.public_key("0/0/0").unwrap().unwrap();
        let change = storage.public_key("0/1/1").unwrap().unwrap();
        let funding = incoming_transaction(&key, &[10_000]);
        let outpoint = funding.outputs[0].outpoint();
        storage.add_transaction(funding).unwrap();

        let output = Output::new(9_500, 0, lock_script(ScriptType::P2pkh, &change.key_hash).unwrap());
        let input = Input::new(outpoint, vec![0x51], SEQUENCE_FINAL);
        let mut tx = FullTransaction::new(Transaction::default(), vec![input], vec![output]);
        extractor(storage).extract(&mut tx).unwrap();

        assert_eq!(tx.metadata.transaction_type, TransactionType::SentToSelf);
        assert_eq!(tx.metadata.amount, -500);
        assert_eq!(tx.metadata.fee, Some(500));
    }

    #[test]
    fn test_foreign_transaction_is_not_mine() {
        let storage = storage_with_keys(1);
        let mut tx = raw(&spending_transaction(&[OutPoint::new(Hash256::digest(b"a"), 0)], 500));
        extractor(storage).extract(&mut tx).unwrap();
        assert!(!tx.header.is_mine);
        assert_eq!(tx.outputs[0].script_type, ScriptType::P2pkh);
        assert!(tx.outputs[0].address.is_some());
    }
}
