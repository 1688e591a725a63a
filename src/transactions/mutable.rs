//! Transaction under construction

use crate::core::script::lock_script;
use crate::core::{
    Address, FullTransaction, Input, Output, PublicKey, ScriptType, Transaction, TransactionStatus,
    TransactionType, TX_VERSION,
};

/// An input together with what is needed to sign it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InputToSign {
    pub input: Input,
    pub previous_output: Output,
    pub previous_output_public_key: PublicKey,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MutableTransaction {
    pub version: i32,
    pub lock_time: u32,
    pub recipient_address: Option<Address>,
    pub recipient_value: u64,
    pub change_address: Option<Address>,
    pub change_public_key: Option<PublicKey>,
    pub change_value: u64,
    /// Payload of an extra null-data output
    pub plugin_data: Option<Vec<u8>>,
    pub inputs_to_sign: Vec<InputToSign>,
    pub outputs: Vec<Output>,
}

impl MutableTransaction {
    pub fn new() -> Self {
        Self {
            version: TX_VERSION,
            lock_time: 0,
            recipient_address: None,
            recipient_value: 0,
            change_address: None,
            change_public_key: None,
            change_value: 0,
            plugin_data: None,
            inputs_to_sign: Vec::new(),
            outputs: Vec::new(),
        }
    }

    pub fn add_input(&mut self, input: InputToSign) {
        self.inputs_to_sign.push(input);
    }

    /// Locking script of the null-data output, when there is one
    pub fn plugin_data_script(&self) -> Option<Vec<u8>> {
        self.plugin_data
            .as_ref()
            .and_then(|data| lock_script(ScriptType::NullData, data).ok())
    }

    pub fn plugin_data_output_size(&self) -> usize {
        self.plugin_data_script().map_or(0, |s| s.len())
    }

    pub fn inputs_total(&self) -> u64 {
        self.inputs_to_sign.iter().map(|i| i.previous_output.value).sum()
    }

    /// Current state as a transaction; input scripts are whatever the
    /// signer has filled in so far
    pub fn to_transaction(&self) -> FullTransaction {
        let mut header = Transaction::new(self.version, self.lock_time);
        header.is_mine = true;
        header.is_outgoing = true;
        header.status = TransactionStatus::New;

        let inputs = self.inputs_to_sign.iter().map(|i| i.input.clone()).collect();
        let mut tx = FullTransaction::new(header, inputs, self.outputs.clone());

        let outputs_total = tx.total_output();
        let mine_outputs: u64 = tx.outputs.iter().filter(|o| o.is_mine()).map(|o| o.value).sum();
        tx.metadata.fee = Some(self.inputs_total().saturating_sub(outputs_total));
        tx.metadata.amount = mine_outputs as i64 - self.inputs_total() as i64;
        tx.metadata.transaction_type = if tx.outputs.iter().all(|o| o.is_mine() || o.value == 0) {
            TransactionType::SentToSelf
        } else {
            TransactionType::Outgoing
        };
        tx
    }
}

impl Default for MutableTransaction {
    fn default() -> Self {
        Self::new()
    }
}
