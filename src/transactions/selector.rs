//! Coin selection
//!
//! Selectors pick spendable outputs covering a value plus its fee. The fee
//! depends on the selected set, so it is recomputed as each output is added.

use crate::core::{DustCalculator, ScriptType, TransactionSizeCalculator};
use crate::storage::UnspentOutput;
use std::sync::Arc;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SendValueError {
    #[error("Value is below the dust threshold")]
    Dust,
    #[error("No spendable outputs")]
    EmptyOutputs,
    #[error("Not enough funds")]
    NotEnough,
    #[error("No single output matches the value without change")]
    SingleNoChangeOutputNotFound,
}

/// What a selector is asked for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SelectionParams {
    pub value: u64,
    /// Satoshis per byte
    pub fee_rate: u64,
    pub output_script_type: ScriptType,
    pub change_type: ScriptType,
    /// Fee is added on top of `value` instead of taken from it
    pub sender_pay: bool,
    pub plugin_data_output_size: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SelectedUnspentOutputInfo {
    pub outputs: Vec<UnspentOutput>,
    pub recipient_value: u64,
    pub change_value: Option<u64>,
}

impl SelectedUnspentOutputInfo {
    pub fn total_value(&self) -> u64 {
        self.outputs.iter().map(|u| u.output.value).sum()
    }

    /// Whatever is neither received nor returned as change
    pub fn fee(&self) -> u64 {
        self.total_value() - self.recipient_value - self.change_value.unwrap_or(0)
    }
}

pub trait UnspentOutputSelector: Send + Sync {
    fn select(
        &self,
        params: &SelectionParams,
        outputs: Vec<UnspentOutput>,
    ) -> Result<SelectedUnspentOutputInfo, SendValueError>;
}

/// Outputs whose last spend failed come first, then ascending value
fn sort_for_selection(outputs: &mut [UnspentOutput]) {
    outputs.sort_by(|a, b| {
        b.output
            .failed_to_spend
            .cmp(&a.output.failed_to_spend)
            .then(a.output.value.cmp(&b.output.value))
    });
}

/// Recipient and sent values for a fee. Values past `i64::MAX` can never
/// be covered.
fn split_value(params: &SelectionParams, fee: u64) -> Result<(i64, u64), SendValueError> {
    let value = i64::try_from(params.value).map_err(|_| SendValueError::NotEnough)?;
    let fee_signed = i64::try_from(fee).map_err(|_| SendValueError::NotEnough)?;
    if params.sender_pay {
        let sent = params.value.checked_add(fee).ok_or(SendValueError::NotEnough)?;
        Ok((value, sent))
    } else {
        Ok((value - fee_signed, params.value))
    }
}

/// Over the outputs limit the smallest output goes, keeping outputs whose
/// last spend failed so they get another try
fn drop_position(selected: &[UnspentOutput]) -> usize {
    let smallest = |failed: bool| {
        selected
            .iter()
            .enumerate()
            .filter(|(_, u)| failed || !u.output.failed_to_spend)
            .min_by_key(|(_, u)| u.output.value)
            .map(|(i, _)| i)
    };
    smallest(false).or_else(|| smallest(true)).unwrap_or(0)
}

// =============================================================================
// Accumulate
// =============================================================================

/// Adds outputs until the value and fee are covered, returning change
/// when the remainder is worth an output
pub struct AccumulateSelector {
    size_calculator: Arc<dyn TransactionSizeCalculator>,
    dust_calculator: DustCalculator,
    outputs_limit: Option<usize>,
}

impl AccumulateSelector {
    pub fn new(
        size_calculator: Arc<dyn TransactionSizeCalculator>,
        dust_calculator: DustCalculator,
        outputs_limit: Option<usize>,
    ) -> Self {
        Self {
            size_calculator,
            dust_calculator,
            outputs_limit,
        }
    }

    fn fee(&self, selected: &[UnspentOutput], params: &SelectionParams, types: &[ScriptType]) -> u64 {
        let previous: Vec<_> = selected.iter().map(|u| u.output.clone()).collect();
        (self
            .size_calculator
            .transaction_size(&previous, types, params.plugin_data_output_size) as u64)
            .saturating_mul(params.fee_rate)
    }
}

impl UnspentOutputSelector for AccumulateSelector {
    fn select(
        &self,
        params: &SelectionParams,
        mut outputs: Vec<UnspentOutput>,
    ) -> Result<SelectedUnspentOutputInfo, SendValueError> {
        let recipient_dust = self.dust_calculator.dust(params.output_script_type);
        if params.value < recipient_dust {
            return Err(SendValueError::Dust);
        }
        if outputs.is_empty() {
            return Err(SendValueError::EmptyOutputs);
        }
        sort_for_selection(&mut outputs);

        let mut selected: Vec<UnspentOutput> = Vec::new();
        let mut total: u64 = 0;
        let mut recipient_value: i64 = 0;
        let mut sent_value: u64 = u64::MAX;

        for unspent in outputs {
            total = total.saturating_add(unspent.output.value);
            selected.push(unspent);

            if let Some(limit) = self.outputs_limit {
                if selected.len() > limit {
                    let dropped = selected.remove(drop_position(&selected));
                    total -= dropped.output.value;
                }
            }

            let fee = self.fee(&selected, params, &[params.output_script_type]);
            (recipient_value, sent_value) = split_value(params, fee)?;

            if sent_value <= total {
                // more inputs only raise the fee, the recipient would stay dust
                if recipient_value < recipient_dust as i64 {
                    return Err(SendValueError::Dust);
                }
                break;
            }
        }

        if total < sent_value {
            return Err(SendValueError::NotEnough);
        }

        let recipient_value = recipient_value as u64;
        let fee_with_change = self.fee(
            &selected,
            params,
            &[params.output_script_type, params.change_type],
        );
        let change_dust = self.dust_calculator.dust(params.change_type);
        let change_value = total
            .checked_sub(recipient_value)
            .and_then(|r| r.checked_sub(fee_with_change))
            .filter(|remainder| *remainder >= change_dust);

        log::debug!(
            "Selected {} outputs: total {}, recipient {}, change {:?}",
            selected.len(),
            total,
            recipient_value,
            change_value
        );

        Ok(SelectedUnspentOutputInfo {
            outputs: selected,
            recipient_value,
            change_value,
        })
    }
}

// =============================================================================
// Single output, no change
// =============================================================================

/// Looks for one output covering the value with a remainder below dust
pub struct SingleNoChangeSelector {
    size_calculator: Arc<dyn TransactionSizeCalculator>,
    dust_calculator: DustCalculator,
}

impl SingleNoChangeSelector {
    pub fn new(size_calculator: Arc<dyn TransactionSizeCalculator>, dust_calculator: DustCalculator) -> Self {
        Self {
            size_calculator,
            dust_calculator,
        }
    }
}

impl UnspentOutputSelector for SingleNoChangeSelector {
    fn select(
        &self,
        params: &SelectionParams,
        mut outputs: Vec<UnspentOutput>,
    ) -> Result<SelectedUnspentOutputInfo, SendValueError> {
        let recipient_dust = self.dust_calculator.dust(params.output_script_type);
        if params.value < recipient_dust {
            return Err(SendValueError::Dust);
        }
        if outputs.is_empty() {
            return Err(SendValueError::EmptyOutputs);
        }
        sort_for_selection(&mut outputs);

        let change_dust = self.dust_calculator.dust(params.change_type);
        for unspent in outputs {
            let fee = (self.size_calculator.transaction_size(
                std::slice::from_ref(&unspent.output),
                &[params.output_script_type],
                params.plugin_data_output_size,
            ) as u64)
                .saturating_mul(params.fee_rate);
            let (recipient_value, sent_value) = split_value(params, fee)?;
            let value = unspent.output.value;

            if sent_value <= value && value < sent_value.saturating_add(change_dust) {
                if recipient_value < recipient_dust as i64 {
                    return Err(SendValueError::Dust);
                }
                return Ok(SelectedUnspentOutputInfo {
                    outputs: vec![unspent],
                    recipient_value: recipient_value as u64,
                    change_value: None,
                });
            }
        }

        Err(SendValueError::SingleNoChangeOutputNotFound)
    }
}

// =============================================================================
// Chain
// =============================================================================

/// Tries selectors in order; the first success wins
#[derive(Default)]
pub struct UnspentOutputSelectorChain {
    selectors: Vec<Box<dyn UnspentOutputSelector>>,
}

impl UnspentOutputSelectorChain {
    pub fn new() -> Self {
        Self::default()
    }

    /// Single-output selection first, accumulation as fallback
    pub fn standard(
        size_calculator: Arc<dyn TransactionSizeCalculator>,
        dust_calculator: DustCalculator,
        outputs_limit: Option<usize>,
    ) -> Self {
        let mut chain = Self::new();
        chain.append(Box::new(AccumulateSelector::new(
            size_calculator.clone(),
            dust_calculator.clone(),
            outputs_limit,
        )));
        chain.prepend(Box::new(SingleNoChangeSelector::new(size_calculator, dust_calculator)));
        chain
    }

    pub fn append(&mut self, selector: Box<dyn UnspentOutputSelector>) {
        self.selectors.push(selector);
    }

    pub fn prepend(&mut self, selector: Box<dyn UnspentOutputSelector>) {
        self.selectors.insert(0, selector);
    }
}

impl UnspentOutputSelector for UnspentOutputSelectorChain {
    fn select(
        &self,
        params: &SelectionParams,
        outputs: Vec<UnspentOutput>,
    ) -> Result<SelectedUnspentOutputInfo, SendValueError> {
        let mut last_error = SendValueError::EmptyOutputs;
        for selector in &self.selectors {
            match selector.select(params, outputs.clone()) {
                Ok(info) => return Ok(info),
                Err(e) => last_error = e,
            }
        }
        Err(last_error)
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::BitcoinSizeCalculator;
    use crate::test_utils::{unspent, MockSizeCalculator};

    fn mock_calculators() -> (Arc<dyn TransactionSizeCalculator>, DustCalculator) {
        let calc: Arc<dyn TransactionSizeCalculator> = Arc::new(MockSizeCalculator);
        // (10 + 10) * 3000 / 1000
        let dust = DustCalculator::new(3_000, calc.clone());
        (calc, dust)
    }

    fn params(value: u64, sender_pay: bool) -> SelectionParams {
        SelectionParams {
            value,
            fee_rate: 1,
            output_script_type: ScriptType::P2pkh,
            change_type: ScriptType::P2pkh,
            sender_pay,
            plugin_data_output_size: 0,
        }
    }

    fn outputs() -> Vec<UnspentOutput> {
        [16_000, 1_000, 8_000, 3_000, 2_000]
            .iter()
            .map(|v| unspent(*v))
            .collect()
    }

    fn values(info: &SelectedUnspentOutputInfo) -> Vec<u64> {
        info.outputs.iter().map(|u| u.output.value).collect()
    }

    #[test]
    fn test_exact_value_selects_first_two_without_change() {
        let (calc, dust) = mock_calculators();
        let selector = AccumulateSelector::new(calc, dust, None);

        let info = selector.select(&params(3_000 - 100, true), outputs()).unwrap();
        assert_eq!(values(&info), vec![1_000, 2_000]);
        assert_eq!(info.recipient_value, 2_900);
        assert_eq!(info.change_value, None);
        assert_eq!(info.fee(), 100);
    }

    #[test]
    fn test_change_only_when_remainder_reaches_dust() {
        let (calc, dust) = mock_calculators();
        let selector = AccumulateSelector::new(calc, dust, None);

        // 6000 selected, 6000 - 5000 - 110 = 890 change
        let info = selector.select(&params(5_000, true), outputs()).unwrap();
        assert_eq!(values(&info), vec![1_000, 2_000, 3_000]);
        assert_eq!(info.change_value, Some(890));
        assert_eq!(info.total_value(), info.recipient_value + info.fee() + 890);

        // 6000 - 5850 - 110 = 40, below the dust of 60
        let info = selector.select(&params(5_850, true), outputs()).unwrap();
        assert_eq!(info.change_value, None);
        assert_eq!(info.fee(), 150);
    }

    #[test]
    fn test_receiver_pays_fee() {
        let (calc, dust) = mock_calculators();
        let selector = AccumulateSelector::new(calc, dust, None);

        let info = selector.select(&params(3_000, false), outputs()).unwrap();
        assert_eq!(values(&info), vec![1_000, 2_000]);
        assert_eq!(info.recipient_value, 2_900);
        assert_eq!(info.fee(), 100);
    }

    #[test]
    fn test_selection_errors() {
        let (calc, dust) = mock_calculators();
        let selector = AccumulateSelector::new(calc, dust, None);

        assert_eq!(selector.select(&params(50, true), outputs()), Err(SendValueError::Dust));
        assert_eq!(selector.select(&params(1_000, true), vec![]), Err(SendValueError::EmptyOutputs));
        assert_eq!(
            selector.select(&params(30_000, true), outputs()),
            Err(SendValueError::NotEnough)
        );
        // the fee would leave the recipient with dust
        assert_eq!(
            selector.select(&params(150, false), outputs()),
            Err(SendValueError::Dust)
        );
    }

    #[test]
    fn test_failed_to_spend_outputs_are_tried_first() {
        let (calc, dust) = mock_calculators();
        let selector = AccumulateSelector::new(calc, dust, None);

        let mut list = outputs();
        list[0].output.failed_to_spend = true;
        let info = selector.select(&params(900, true), list).unwrap();
        assert_eq!(values(&info), vec![16_000]);
    }

    #[test]
    fn test_outputs_limit_drops_smallest() {
        let (calc, dust) = mock_calculators();
        let selector = AccumulateSelector::new(calc, dust, Some(2));

        let info = selector.select(&params(10_000, true), outputs()).unwrap();
        assert_eq!(values(&info), vec![3_000, 8_000]);
        assert_eq!(info.change_value, Some(890));
    }

    #[test]
    fn test_outputs_limit_keeps_failed_to_spend() {
        let (calc, dust) = mock_calculators();
        let selector = AccumulateSelector::new(calc, dust, Some(2));

        let mut list = outputs();
        list[3].output.failed_to_spend = true;
        let info = selector.select(&params(10_000, true), list).unwrap();
        assert_eq!(values(&info), vec![3_000, 8_000]);
        assert!(info.outputs[0].output.failed_to_spend);
        assert_eq!(info.change_value, Some(890));
    }

    #[test]
    fn test_huge_values_are_not_enough() {
        let (calc, dust) = mock_calculators();
        let chain = UnspentOutputSelectorChain::standard(calc, dust, None);

        assert_eq!(
            chain.select(&params(u64::MAX - 10, true), outputs()),
            Err(SendValueError::NotEnough)
        );
        assert_eq!(
            chain.select(&params(u64::MAX - 10, false), outputs()),
            Err(SendValueError::NotEnough)
        );
        let greedy = SelectionParams {
            fee_rate: u64::MAX,
            ..params(5_000, true)
        };
        assert_eq!(chain.select(&greedy, outputs()), Err(SendValueError::NotEnough));
    }

    #[test]
    fn test_single_no_change() {
        let (calc, dust) = mock_calculators();
        let selector = SingleNoChangeSelector::new(calc, dust);

        // 7_900 + 100 fee fits the 8_000 output exactly
        let info = selector.select(&params(7_900, true), outputs()).unwrap();
        assert_eq!(values(&info), vec![8_000]);
        assert_eq!(info.change_value, None);

        // remainder 8_000 - 7_850 - 100 = 50 is below dust and absorbed
        let info = selector.select(&params(7_850, true), outputs()).unwrap();
        assert_eq!(info.fee(), 150);

        assert_eq!(
            selector.select(&params(5_000, true), outputs()),
            Err(SendValueError::SingleNoChangeOutputNotFound)
        );
    }

    #[test]
    fn test_chain_falls_back_to_accumulate() {
        let (calc, dust) = mock_calculators();
        let chain = UnspentOutputSelectorChain::standard(calc, dust, None);

        let info = chain.select(&params(7_900, true), outputs()).unwrap();
        assert_eq!(values(&info), vec![8_000]);

        let info = chain.select(&params(5_000, true), outputs()).unwrap();
        assert_eq!(values(&info), vec![1_000, 2_000, 3_000]);

        assert_eq!(
            chain.select(&params(30_000, true), outputs()),
            Err(SendValueError::NotEnough)
        );
    }

    #[test]
    fn test_value_is_conserved_with_real_sizes() {
        let calc: Arc<dyn TransactionSizeCalculator> = Arc::new(BitcoinSizeCalculator::new());
        let dust = DustCalculator::new(3_000, calc.clone());
        let selector = AccumulateSelector::new(calc, dust, None);

        for (value, sender_pay) in [(2_500, true), (2_500, false), (12_000, true), (20_000, false)] {
            let p = SelectionParams {
                fee_rate: 5,
                ..params(value, sender_pay)
            };
            let info = selector.select(&p, outputs()).unwrap();
            assert_eq!(
                info.total_value(),
                info.recipient_value + info.fee() + info.change_value.unwrap_or(0)
            );
            if sender_pay {
                assert_eq!(info.recipient_value, value);
            } else {
                assert!(info.recipient_value < value);
            }
        }
    }
}
