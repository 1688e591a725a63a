//! Input and output ordering strategies

use crate::core::Output;
use crate::transactions::mutable::InputToSign;
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TransactionDataSortType {
    /// Insertion order
    None,
    #[default]
    Shuffle,
    /// BIP69 lexicographic ordering
    Bip69,
}

impl TransactionDataSortType {
    /// Sort outputs and renumber them by position
    pub fn sort_outputs(&self, outputs: &mut [Output]) {
        match self {
            Self::None => {}
            Self::Shuffle => outputs.shuffle(&mut rand::thread_rng()),
            Self::Bip69 => outputs.sort_by(bip69_output_order),
        }
        for (index, output) in outputs.iter_mut().enumerate() {
            output.index = index as u32;
        }
    }

    pub fn sort_inputs(&self, inputs: &mut [InputToSign]) {
        match self {
            Self::None => {}
            Self::Shuffle => inputs.shuffle(&mut rand::thread_rng()),
            Self::Bip69 => inputs.sort_by(|a, b| {
                bip69_input_order(
                    a.input.previous_output.hash.as_bytes(),
                    a.input.previous_output.index,
                    b.input.previous_output.hash.as_bytes(),
                    b.input.previous_output.index,
                )
            }),
        }
    }
}

fn bip69_output_order(a: &Output, b: &Output) -> Ordering {
    a.value.cmp(&b.value).then_with(|| a.lock_script.cmp(&b.lock_script))
}

/// Txids compare in their displayed (byte-reversed) form
fn bip69_input_order(a_hash: &[u8; 32], a_index: u32, b_hash: &[u8; 32], b_index: u32) -> Ordering {
    a_hash
        .iter()
        .rev()
        .cmp(b_hash.iter().rev())
        .then(a_index.cmp(&b_index))
}
