//! Transaction builder
//!
//! Runs the setters and the signer in order. Building never touches
//! storage state: persisting and broadcasting the result is the creator's
//! job.

use crate::core::{AddressConverter, AddressConverterChain, AddressError, DustCalculator, FullTransaction, ScriptError, ScriptType};
use crate::storage::{StorageError, UnspentOutput};
use crate::transactions::mutable::MutableTransaction;
use crate::transactions::selector::SendValueError;
use crate::transactions::setters::{InputSetter, LockTimeSetter, OutputSetter, RecipientSetter};
use crate::transactions::signer::{SignError, TransactionSigner};
use crate::transactions::sorter::TransactionDataSortType;
use crate::wallet::{PublicKeyManager, PublicKeyManagerError, UnspentOutputProvider};
use std::sync::Arc;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum BuildError {
    #[error("Recipient is not set")]
    NoRecipient,
    #[error(transparent)]
    SendValue(#[from] SendValueError),
    #[error("Address error: {0}")]
    Address(#[from] AddressError),
    #[error("Script error: {0}")]
    Script(#[from] ScriptError),
    #[error("Signing failed: {0}")]
    Sign(#[from] SignError),
    #[error("Public key error: {0}")]
    PublicKey(#[from] PublicKeyManagerError),
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
}

pub struct TransactionBuilder {
    recipient_setter: RecipientSetter,
    input_setter: InputSetter,
    lock_time_setter: LockTimeSetter,
    output_setter: OutputSetter,
    signer: TransactionSigner,
}

impl TransactionBuilder {
    pub fn new(
        recipient_setter: RecipientSetter,
        input_setter: InputSetter,
        lock_time_setter: LockTimeSetter,
        output_setter: OutputSetter,
        signer: TransactionSigner,
    ) -> Self {
        Self {
            recipient_setter,
            input_setter,
            lock_time_setter,
            output_setter,
            signer,
        }
    }

    /// Signed payment of `value` to `to_address`. Lock time is the best
    /// height unless `zero_lock_time` is set.
    #[allow(clippy::too_many_arguments)]
    pub fn build_transaction(
        &self,
        to_address: &str,
        value: u64,
        fee_rate: u64,
        sender_pay: bool,
        sort_type: TransactionDataSortType,
        plugin_data: Option<Vec<u8>>,
        zero_lock_time: bool,
    ) -> Result<FullTransaction, BuildError> {
        let mut mutable = MutableTransaction::new();
        self.recipient_setter
            .set_recipient(&mut mutable, to_address, value, plugin_data)?;
        self.input_setter
            .set_inputs(&mut mutable, fee_rate, sender_pay, sort_type)?;
        self.lock_time_setter.set_lock_time(&mut mutable, zero_lock_time)?;
        self.output_setter.set_outputs(&mut mutable, sort_type)?;
        self.signer.sign(&mut mutable)?;

        let tx = mutable.to_transaction();
        log::info!(
            "Built transaction {} paying {} to {}",
            tx.hash(),
            mutable.recipient_value,
            to_address
        );
        Ok(tx)
    }

    /// Signed transaction sending all of `unspent` (less the fee) to
    /// `to_address`
    pub fn build_transaction_from_unspent(
        &self,
        unspent: UnspentOutput,
        to_address: &str,
        fee_rate: u64,
        sort_type: TransactionDataSortType,
    ) -> Result<FullTransaction, BuildError> {
        let mut mutable = MutableTransaction::new();
        self.recipient_setter.set_recipient(&mut mutable, to_address, 0, None)?;
        self.input_setter
            .set_inputs_from_unspent(&mut mutable, unspent, fee_rate)?;
        self.lock_time_setter.set_lock_time(&mut mutable, false)?;
        self.output_setter.set_outputs(&mut mutable, sort_type)?;
        self.signer.sign(&mut mutable)?;
        Ok(mutable.to_transaction())
    }
}

// =============================================================================
// Fee Calculator
// =============================================================================

/// Dry runs of input selection, without signing
pub struct TransactionFeeCalculator {
    recipient_setter: RecipientSetter,
    input_setter: InputSetter,
    unspent_provider: Arc<UnspentOutputProvider>,
    public_key_manager: Arc<PublicKeyManager>,
    address_converter: Arc<AddressConverterChain>,
    dust_calculator: DustCalculator,
}

impl TransactionFeeCalculator {
    pub fn new(
        recipient_setter: RecipientSetter,
        input_setter: InputSetter,
        unspent_provider: Arc<UnspentOutputProvider>,
        public_key_manager: Arc<PublicKeyManager>,
        address_converter: Arc<AddressConverterChain>,
        dust_calculator: DustCalculator,
    ) -> Self {
        Self {
            recipient_setter,
            input_setter,
            unspent_provider,
            public_key_manager,
            address_converter,
            dust_calculator,
        }
    }

    /// Without a recipient, one of our own P2PKH addresses stands in
    fn recipient_or_sample(&self, to_address: Option<&str>) -> Result<String, BuildError> {
        match to_address {
            Some(address) => Ok(address.to_string()),
            None => {
                let key = self.public_key_manager.receive_public_key()?;
                Ok(self
                    .address_converter
                    .convert_public_key(&key, ScriptType::P2pkh)?
                    .string_value)
            }
        }
    }

    pub fn fee(
        &self,
        value: u64,
        fee_rate: u64,
        sender_pay: bool,
        to_address: Option<&str>,
        plugin_data: Option<Vec<u8>>,
    ) -> Result<u64, BuildError> {
        let address = self.recipient_or_sample(to_address)?;
        let mut mutable = MutableTransaction::new();
        self.recipient_setter
            .set_recipient(&mut mutable, &address, value, plugin_data)?;
        self.input_setter
            .set_inputs(&mut mutable, fee_rate, sender_pay, TransactionDataSortType::None)?;

        let outputs_total = mutable.recipient_value + mutable.change_value;
        Ok(mutable.inputs_total() - outputs_total)
    }

    /// Largest value sendable with the receiver paying the fee
    pub fn max_spendable_value(
        &self,
        to_address: Option<&str>,
        fee_rate: u64,
        plugin_data: Option<Vec<u8>>,
    ) -> Result<u64, BuildError> {
        let send_all: u64 = self
            .unspent_provider
            .spendable_outputs()?
            .iter()
            .map(|u| u.output.value)
            .sum();
        if send_all == 0 {
            return Ok(0);
        }
        let fee = self.fee(send_all, fee_rate, false, to_address, plugin_data)?;
        Ok(send_all.saturating_sub(fee))
    }

    /// Smallest value that is not dust for the recipient's script type
    pub fn min_spendable_value(&self, to_address: Option<&str>) -> Result<u64, BuildError> {
        let script_type = match to_address {
            Some(address) => self.address_converter.convert_string(address)?.script_type,
            None => ScriptType::P2pkh,
        };
        Ok(self.dust_calculator.dust(script_type))
    }
}
