//! Transaction size and dust calculation
//!
//! Sizes are estimated before signing, from the script types of the
//! spent outputs and of the outputs to create. Witness data is counted
//! at a quarter weight:
//! - base parts are multiplied by 4
//! - witness bytes count once
//! - the weight is rounded up to virtual bytes

use crate::core::script::ScriptType;
use crate::core::transaction::Output;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

// =============================================================================
// Constants
// =============================================================================

/// Version, input count, output count and lock time, as weight units / 4
pub const LEGACY_TX_WEIGHT: usize = 16 + 4 + 4 + 16;

/// Legacy overhead plus segwit marker and flag
pub const WITNESS_TX_WEIGHT: usize = LEGACY_TX_WEIGHT + 1 + 1;

/// Empty witness of a non-witness input in a segwit transaction
pub const LEGACY_WITNESS_DATA: usize = 1;

/// DER signature with sighash byte, plus its push opcode
pub const SIGNATURE_LENGTH: usize = 72 + 1;

/// Compressed public key plus its push opcode
pub const PUBLIC_KEY_LENGTH: usize = 33 + 1;

/// Pushed P2WPKH redeem script in a P2WPKH-in-P2SH signature script
pub const P2WPKH_SH_LENGTH: usize = 22 + 1;

/// Default minimum fee rate (sat/byte)
pub const MIN_FEE_RATE: u64 = 1;

// =============================================================================
// Fee Rate
// =============================================================================

/// Fee rate in satoshis per virtual byte
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FeeRate(pub u64);

impl FeeRate {
    pub fn from_sat_per_byte(rate: u64) -> Self {
        Self(rate)
    }

    pub fn fee_for_size(&self, size_bytes: usize) -> u64 {
        self.0 * size_bytes as u64
    }

    pub fn as_sat_per_byte(&self) -> u64 {
        self.0
    }
}

impl Default for FeeRate {
    fn default() -> Self {
        Self(MIN_FEE_RATE)
    }
}

// =============================================================================
// Size Calculator
// =============================================================================

/// Estimates virtual sizes of unsigned transactions
pub trait TransactionSizeCalculator: Send + Sync {
    /// Virtual size of a transaction spending `previous_outputs` into
    /// outputs of the given types, plus an optional data output
    fn transaction_size(
        &self,
        previous_outputs: &[Output],
        output_script_types: &[ScriptType],
        plugin_data_output_size: usize,
    ) -> usize;

    /// Serialized output size: value, script length, script
    fn output_size(&self, script_type: ScriptType) -> usize;

    /// Serialized input size, excluding witness
    fn input_size(&self, script_type: ScriptType) -> usize;

    /// Witness bytes for spending an output of `script_type`
    fn witness_size(&self, script_type: ScriptType) -> usize;
}

/// Standard script sizes of locking scripts
pub fn lock_script_size(script_type: ScriptType) -> usize {
    match script_type {
        ScriptType::P2pkh => 25,
        ScriptType::P2pk => 35,
        ScriptType::P2sh | ScriptType::P2wpkhSh => 23,
        ScriptType::P2wsh => 34,
        ScriptType::P2wpkh => 22,
        ScriptType::NullData | ScriptType::Unknown => 0,
    }
}

#[derive(Debug, Clone, Default)]
pub struct BitcoinSizeCalculator;

impl BitcoinSizeCalculator {
    pub fn new() -> Self {
        Self
    }

    fn output_size_for_script_len(script_len: usize) -> usize {
        8 + 1 + script_len
    }

    fn previous_output_input_size(&self, output: &Output) -> usize {
        match (&output.redeem_script, output.script_type) {
            (Some(redeem), ScriptType::P2sh) => {
                let push_overhead = if redeem.len() > 0x4b { 2 } else { 1 };
                32 + 4 + 1 + SIGNATURE_LENGTH + push_overhead + redeem.len() + 4
            }
            _ => self.input_size(output.script_type),
        }
    }

    fn to_bytes(weight: usize) -> usize {
        weight / 4 + usize::from(weight % 4 != 0)
    }
}

impl TransactionSizeCalculator for BitcoinSizeCalculator {
    fn transaction_size(
        &self,
        previous_outputs: &[Output],
        output_script_types: &[ScriptType],
        plugin_data_output_size: usize,
    ) -> usize {
        let is_witness = previous_outputs.iter().any(|o| o.script_type.is_witness());
        let tx_weight = if is_witness {
            WITNESS_TX_WEIGHT
        } else {
            LEGACY_TX_WEIGHT
        };

        let input_weight: usize = previous_outputs
            .iter()
            .map(|o| self.previous_output_input_size(o) * 4)
            .sum();

        let mut output_weight: usize = output_script_types
            .iter()
            .map(|t| self.output_size(*t))
            .sum::<usize>()
            * 4;
        if plugin_data_output_size > 0 {
            output_weight += Self::output_size_for_script_len(plugin_data_output_size) * 4;
        }

        let witness_weight: usize = if is_witness {
            previous_outputs
                .iter()
                .map(|o| self.witness_size(o.script_type))
                .sum()
        } else {
            0
        };

        Self::to_bytes(tx_weight + input_weight + output_weight + witness_weight)
    }

    fn output_size(&self, script_type: ScriptType) -> usize {
        Self::output_size_for_script_len(lock_script_size(script_type))
    }

    fn input_size(&self, script_type: ScriptType) -> usize {
        let signature_script_length = match script_type {
            ScriptType::P2pkh => SIGNATURE_LENGTH + PUBLIC_KEY_LENGTH,
            ScriptType::P2pk => SIGNATURE_LENGTH,
            ScriptType::P2wpkhSh => P2WPKH_SH_LENGTH,
            _ => 0,
        };
        // previous hash, index, script length, script, sequence
        32 + 4 + 1 + signature_script_length + 4
    }

    fn witness_size(&self, script_type: ScriptType) -> usize {
        if script_type.is_witness() {
            // item count, signature, public key
            1 + SIGNATURE_LENGTH + PUBLIC_KEY_LENGTH
        } else {
            LEGACY_WITNESS_DATA
        }
    }
}

// =============================================================================
// Dust
// =============================================================================

/// Smallest output value worth creating, as relay policy defines it: the
/// output must be worth more than the fee of creating and spending it at
/// the dust relay fee
#[derive(Clone)]
pub struct DustCalculator {
    dust_relay_fee: u64,
    size_calculator: Arc<dyn TransactionSizeCalculator>,
}

impl DustCalculator {
    /// `dust_relay_fee` in satoshis per kilobyte
    pub fn new(dust_relay_fee: u64, size_calculator: Arc<dyn TransactionSizeCalculator>) -> Self {
        Self {
            dust_relay_fee,
            size_calculator,
        }
    }

    pub fn dust(&self, script_type: ScriptType) -> u64 {
        let calc = &self.size_calculator;
        let mut size = calc.output_size(script_type);
        if script_type.is_witness() {
            size += calc.input_size(ScriptType::P2wpkh) + calc.witness_size(ScriptType::P2wpkh) / 4;
        } else {
            size += calc.input_size(ScriptType::P2pkh);
        }
        size as u64 * self.dust_relay_fee / 1000
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn output(script_type: ScriptType) -> Output {
        Output::with_type(10_000, 0, Vec::new(), script_type, None)
    }

    #[test]
    fn test_p2pkh_transaction_size() {
        let calc = BitcoinSizeCalculator::new();
        // 10 + 148 + 34 + 34 = 226
        let size = calc.transaction_size(
            &[output(ScriptType::P2pkh)],
            &[ScriptType::P2pkh, ScriptType::P2pkh],
            0,
        );
        assert_eq!(size, 226);
    }

    #[test]
    fn test_size_never_decreases_when_adding_inputs() {
        let calc = BitcoinSizeCalculator::new();
        let outputs = [ScriptType::P2pkh];

        for script_type in [ScriptType::P2pkh, ScriptType::P2wpkh, ScriptType::P2wpkhSh, ScriptType::P2pk] {
            let mut previous = Vec::new();
            let mut last = calc.transaction_size(&previous, &outputs, 0);
            for _ in 0..5 {
                previous.push(output(script_type));
                let size = calc.transaction_size(&previous, &outputs, 0);
                assert!(size > last, "{script_type} size did not grow");
                last = size;
            }
        }
    }

    #[test]
    fn test_witness_inputs_are_cheaper() {
        let calc = BitcoinSizeCalculator::new();
        for count in 1..4 {
            let legacy = calc.transaction_size(&vec![output(ScriptType::P2pkh); count], &[ScriptType::P2pkh], 0);
            let witness = calc.transaction_size(&vec![output(ScriptType::P2wpkh); count], &[ScriptType::P2pkh], 0);
            assert!(witness < legacy);
        }
    }

    #[test]
    fn test_plugin_data_output_counts() {
        let calc = BitcoinSizeCalculator::new();
        let without = calc.transaction_size(&[output(ScriptType::P2pkh)], &[ScriptType::P2pkh], 0);
        let with = calc.transaction_size(&[output(ScriptType::P2pkh)], &[ScriptType::P2pkh], 40);
        assert_eq!(with - without, 8 + 1 + 40);
    }

    #[test]
    fn test_dust_thresholds() {
        let dust = DustCalculator::new(3000, Arc::new(BitcoinSizeCalculator::new()));
        assert_eq!(dust.dust(ScriptType::P2pkh), 546);
        assert_eq!(dust.dust(ScriptType::P2wpkh), 297);
        assert!(dust.dust(ScriptType::P2wpkh) < dust.dust(ScriptType::P2pkh));
    }

    #[test]
    fn test_fee_rate() {
        assert_eq!(FeeRate::from_sat_per_byte(3).fee_for_size(226), 678);
        assert_eq!(FeeRate::default().as_sat_per_byte(), 1);
    }
}
