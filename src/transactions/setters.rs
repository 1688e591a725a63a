//! Steps that fill in a `MutableTransaction`

use crate::core::{
    AddressConverter, AddressConverterChain, DustCalculator, Input, Output, ScriptType,
    TransactionSizeCalculator, SEQUENCE_LOCKTIME,
};
use crate::storage::{Storage, StorageError, UnspentOutput};
use crate::transactions::builder::BuildError;
use crate::transactions::mutable::{InputToSign, MutableTransaction};
use crate::transactions::selector::{SelectionParams, SendValueError, UnspentOutputSelector};
use crate::transactions::sorter::TransactionDataSortType;
use crate::wallet::{PublicKeyManager, UnspentOutputProvider};
use std::sync::Arc;

// =============================================================================
// Recipient
// =============================================================================

pub struct RecipientSetter {
    address_converter: Arc<AddressConverterChain>,
}

impl RecipientSetter {
    pub fn new(address_converter: Arc<AddressConverterChain>) -> Self {
        Self { address_converter }
    }

    pub fn set_recipient(
        &self,
        mutable: &mut MutableTransaction,
        to_address: &str,
        value: u64,
        plugin_data: Option<Vec<u8>>,
    ) -> Result<(), BuildError> {
        mutable.recipient_address = Some(self.address_converter.convert_string(to_address)?);
        mutable.recipient_value = value;
        mutable.plugin_data = plugin_data;
        Ok(())
    }
}

// =============================================================================
// Inputs
// =============================================================================

pub struct InputSetter {
    unspent_provider: Arc<UnspentOutputProvider>,
    selector: Arc<dyn UnspentOutputSelector>,
    public_key_manager: Arc<PublicKeyManager>,
    address_converter: Arc<AddressConverterChain>,
    size_calculator: Arc<dyn TransactionSizeCalculator>,
    dust_calculator: DustCalculator,
    change_type: ScriptType,
}

impl InputSetter {
    pub fn new(
        unspent_provider: Arc<UnspentOutputProvider>,
        selector: Arc<dyn UnspentOutputSelector>,
        public_key_manager: Arc<PublicKeyManager>,
        address_converter: Arc<AddressConverterChain>,
        size_calculator: Arc<dyn TransactionSizeCalculator>,
        dust_calculator: DustCalculator,
        change_type: ScriptType,
    ) -> Self {
        Self {
            unspent_provider,
            selector,
            public_key_manager,
            address_converter,
            size_calculator,
            dust_calculator,
            change_type,
        }
    }

    fn input_to_sign(unspent: UnspentOutput) -> InputToSign {
        InputToSign {
            input: Input::new(unspent.output.outpoint(), Vec::new(), SEQUENCE_LOCKTIME),
            previous_output: unspent.output,
            previous_output_public_key: unspent.public_key,
        }
    }

    /// Select outputs for the recipient value and add change if any
    pub fn set_inputs(
        &self,
        mutable: &mut MutableTransaction,
        fee_rate: u64,
        sender_pay: bool,
        sort_type: TransactionDataSortType,
    ) -> Result<(), BuildError> {
        let recipient = mutable.recipient_address.as_ref().ok_or(BuildError::NoRecipient)?;
        let params = SelectionParams {
            value: mutable.recipient_value,
            fee_rate,
            output_script_type: recipient.script_type,
            change_type: self.change_type,
            sender_pay,
            plugin_data_output_size: mutable.plugin_data_output_size(),
        };

        let spendable = self.unspent_provider.spendable_outputs()?;
        let selected = self.selector.select(&params, spendable)?;

        for unspent in selected.outputs {
            mutable.add_input(Self::input_to_sign(unspent));
        }
        sort_type.sort_inputs(&mut mutable.inputs_to_sign);
        mutable.recipient_value = selected.recipient_value;

        if let Some(change_value) = selected.change_value {
            let change_key = self.public_key_manager.change_public_key()?;
            let change_address = self
                .address_converter
                .convert_public_key(&change_key, self.change_type)?;
            mutable.change_address = Some(change_address);
            mutable.change_public_key = Some(change_key);
            mutable.change_value = change_value;
        }
        Ok(())
    }

    /// Spend exactly one output, sending all of it minus the fee
    pub fn set_inputs_from_unspent(
        &self,
        mutable: &mut MutableTransaction,
        unspent: UnspentOutput,
        fee_rate: u64,
    ) -> Result<(), BuildError> {
        let recipient = mutable.recipient_address.as_ref().ok_or(BuildError::NoRecipient)?;
        let fee = self.size_calculator.transaction_size(
            std::slice::from_ref(&unspent.output),
            &[recipient.script_type],
            mutable.plugin_data_output_size(),
        ) as u64
            * fee_rate;

        let value = unspent.output.value;
        if value < fee {
            return Err(SendValueError::NotEnough.into());
        }
        if value - fee < self.dust_calculator.dust(recipient.script_type) {
            return Err(SendValueError::Dust.into());
        }

        mutable.recipient_value = value - fee;
        mutable.add_input(Self::input_to_sign(unspent));
        Ok(())
    }
}

// =============================================================================
// Lock time
// =============================================================================

pub struct LockTimeSetter {
    storage: Arc<dyn Storage>,
}

impl LockTimeSetter {
    pub fn new(storage: Arc<dyn Storage>) -> Self {
        Self { storage }
    }

    /// Lock to the current best height so the transaction cannot be mined
    /// into an earlier block, or to zero when `zero_lock_time` asks for it
    pub fn set_lock_time(&self, mutable: &mut MutableTransaction, zero_lock_time: bool) -> Result<(), StorageError> {
        mutable.lock_time = if zero_lock_time {
            0
        } else {
            self.storage.last_block()?.map_or(0, |b| b.height)
        };
        Ok(())
    }
}

// =============================================================================
// Outputs
// =============================================================================

#[derive(Debug, Default)]
pub struct OutputSetter;

impl OutputSetter {
    pub fn new() -> Self {
        Self
    }

    pub fn set_outputs(
        &self,
        mutable: &mut MutableTransaction,
        sort_type: TransactionDataSortType,
    ) -> Result<(), BuildError> {
        let recipient = mutable.recipient_address.as_ref().ok_or(BuildError::NoRecipient)?;
        let mut outputs = Vec::with_capacity(3);

        let mut output = Output::with_type(
            mutable.recipient_value,
            0,
            recipient.lock_script.clone(),
            recipient.script_type,
            Some(recipient.key_hash.clone()),
        );
        output.address = Some(recipient.string_value.clone());
        outputs.push(output);

        if let (Some(address), Some(key)) = (&mutable.change_address, &mutable.change_public_key) {
            if mutable.change_value > 0 {
                let mut change = Output::with_type(
                    mutable.change_value,
                    0,
                    address.lock_script.clone(),
                    address.script_type,
                    Some(address.key_hash.clone()),
                );
                change.address = Some(address.string_value.clone());
                change.public_key_path = Some(key.path.clone());
                change.change_output = true;
                outputs.push(change);
            }
        }

        sort_type.sort_outputs(&mut outputs);

        // the data output always goes last
        if let Some(script) = mutable.plugin_data_script() {
            let index = outputs.len() as u32;
            outputs.push(Output::with_type(0, index, script, ScriptType::NullData, None));
        }

        mutable.outputs = outputs;
        Ok(())
    }
}
