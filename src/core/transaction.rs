//! Transactions as the wallet stores them
//!
//! Wire (de)serialization including BIP144 witness data, transaction ids,
//! and the two signature hash algorithms a P2PKH/P2WPKH wallet needs:
//! - legacy SIGHASH_ALL
//! - BIP143 for version 0 witness programs

use crate::core::encoding::{write_var_bytes, write_var_int, ByteReader, EncodingError};
use crate::core::script::ScriptType;
use crate::crypto::{double_sha256, Hash256};
use crate::utils::{new_uid, unix_time};
use bytes::BufMut;
use serde::{Deserialize, Serialize};

// =============================================================================
// Constants
// =============================================================================

/// Version of transactions the builder creates
pub const TX_VERSION: i32 = 1;

/// Final sequence number; disables lock time when set on every input
pub const SEQUENCE_FINAL: u32 = 0xffff_ffff;

/// Sequence used by the builder: lock time enforced, no replace-by-fee
pub const SEQUENCE_LOCKTIME: u32 = 0xffff_fffe;

/// Largest transaction the parser accepts
pub const MAX_TX_SIZE: usize = 4_000_000;

const SEGWIT_MARKER: u8 = 0x00;
const SEGWIT_FLAG: u8 = 0x01;

// =============================================================================
// Status and Type
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TransactionStatus {
    /// Created locally, not yet seen from the network
    #[default]
    New,
    /// Seen from the network or confirmed
    Relayed,
    /// Lost a double-spend or was abandoned
    Invalid,
}

/// Direction of a transaction relative to the wallet
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TransactionType {
    #[default]
    Incoming,
    Outgoing,
    SentToSelf,
}

/// Reference to a transaction output
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct OutPoint {
    pub hash: Hash256,
    pub index: u32,
}

impl OutPoint {
    pub fn new(hash: Hash256, index: u32) -> Self {
        Self { hash, index }
    }

    /// 36-byte wire form, also used as a bloom filter element
    pub fn serialize(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(36);
        buf.put_slice(self.hash.as_bytes());
        buf.put_u32_le(self.index);
        buf
    }
}

// =============================================================================
// Output
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Output {
    pub value: u64,
    pub index: u32,
    pub lock_script: Vec<u8>,
    pub script_type: ScriptType,
    pub address: Option<String>,
    pub key_hash: Option<Vec<u8>>,
    /// Set when the output pays a wallet key
    pub public_key_path: Option<String>,
    pub redeem_script: Option<Vec<u8>>,
    pub plugin_id: Option<u8>,
    pub plugin_data: Option<String>,
    pub change_output: bool,
    /// A spend of this output was abandoned; it is selected first next time
    pub failed_to_spend: bool,
    pub transaction_hash: Hash256,
}

impl Output {
    /// An unclassified output, as parsed from the wire
    pub fn new(value: u64, index: u32, lock_script: Vec<u8>) -> Self {
        Self {
            value,
            index,
            lock_script,
            script_type: ScriptType::Unknown,
            address: None,
            key_hash: None,
            public_key_path: None,
            redeem_script: None,
            plugin_id: None,
            plugin_data: None,
            change_output: false,
            failed_to_spend: false,
            transaction_hash: Hash256::ZERO,
        }
    }

    pub fn with_type(value: u64, index: u32, lock_script: Vec<u8>, script_type: ScriptType, key_hash: Option<Vec<u8>>) -> Self {
        Self {
            script_type,
            key_hash,
            ..Self::new(value, index, lock_script)
        }
    }

    pub fn is_mine(&self) -> bool {
        self.public_key_path.is_some()
    }

    pub fn outpoint(&self) -> OutPoint {
        OutPoint::new(self.transaction_hash, self.index)
    }

    fn write(&self, buf: &mut Vec<u8>) {
        buf.put_u64_le(self.value);
        write_var_bytes(buf, &self.lock_script);
    }
}

// =============================================================================
// Input
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Input {
    pub previous_output: OutPoint,
    pub signature_script: Vec<u8>,
    pub sequence: u32,
    pub witness: Vec<Vec<u8>>,
    pub address: Option<String>,
    pub key_hash: Option<Vec<u8>>,
    pub transaction_hash: Hash256,
}

impl Input {
    pub fn new(previous_output: OutPoint, signature_script: Vec<u8>, sequence: u32) -> Self {
        Self {
            previous_output,
            signature_script,
            sequence,
            witness: Vec::new(),
            address: None,
            key_hash: None,
            transaction_hash: Hash256::ZERO,
        }
    }

    fn write(&self, buf: &mut Vec<u8>) {
        buf.put_slice(&self.previous_output.serialize());
        write_var_bytes(buf, &self.signature_script);
        buf.put_u32_le(self.sequence);
    }
}

// =============================================================================
// Transaction Header
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    /// Stable identifier, independent of the data hash
    pub uid: String,
    pub data_hash: Hash256,
    pub version: i32,
    pub lock_time: u32,
    pub timestamp: i64,
    /// Position within its block, or arrival order while pending
    pub order: u32,
    pub block_hash: Option<Hash256>,
    pub is_mine: bool,
    pub is_outgoing: bool,
    pub status: TransactionStatus,
    pub segwit: bool,
    pub conflicting_tx_hash: Option<Hash256>,
}

impl Transaction {
    pub fn new(version: i32, lock_time: u32) -> Self {
        Self {
            uid: new_uid(),
            data_hash: Hash256::ZERO,
            version,
            lock_time,
            timestamp: unix_time(),
            order: 0,
            block_hash: None,
            is_mine: false,
            is_outgoing: false,
            status: TransactionStatus::New,
            segwit: false,
            conflicting_tx_hash: None,
        }
    }

    pub fn is_pending(&self) -> bool {
        self.block_hash.is_none() && self.status != TransactionStatus::Invalid
    }
}

impl Default for Transaction {
    fn default() -> Self {
        Self::new(TX_VERSION, 0)
    }
}

/// Net effect of a transaction on the wallet
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct TransactionMetadata {
    pub amount: i64,
    pub transaction_type: TransactionType,
    /// Known only when every input spends a wallet output
    pub fee: Option<u64>,
}

// =============================================================================
// Full Transaction
// =============================================================================

/// Header plus ordered inputs and outputs
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FullTransaction {
    pub header: Transaction,
    pub inputs: Vec<Input>,
    pub outputs: Vec<Output>,
    pub metadata: TransactionMetadata,
}

impl FullTransaction {
    /// Assemble a transaction and stamp its hash on every part
    pub fn new(header: Transaction, inputs: Vec<Input>, outputs: Vec<Output>) -> Self {
        let mut tx = Self {
            header,
            inputs,
            outputs,
            metadata: TransactionMetadata::default(),
        };
        tx.set_hash();
        tx
    }

    pub fn hash(&self) -> Hash256 {
        self.header.data_hash
    }

    /// Recompute the txid and propagate it to inputs and outputs
    pub fn set_hash(&mut self) {
        let hash = self.calculate_hash();
        self.header.data_hash = hash;
        self.header.segwit = self.inputs.iter().any(|i| !i.witness.is_empty());
        for input in &mut self.inputs {
            input.transaction_hash = hash;
        }
        for output in &mut self.outputs {
            output.transaction_hash = hash;
        }
    }

    /// Txid: double-SHA256 of the serialization without witness data
    pub fn calculate_hash(&self) -> Hash256 {
        Hash256::digest(&self.serialize_without_witness())
    }

    pub fn has_witness(&self) -> bool {
        self.inputs.iter().any(|i| !i.witness.is_empty())
    }

    pub fn serialize_without_witness(&self) -> Vec<u8> {
        self.serialize_inner(false)
    }

    /// Wire serialization, in BIP144 form when any input carries a witness
    pub fn serialize(&self) -> Vec<u8> {
        self.serialize_inner(self.has_witness())
    }

    fn serialize_inner(&self, with_witness: bool) -> Vec<u8> {
        let mut buf = Vec::with_capacity(256);
        buf.put_i32_le(self.header.version);
        if with_witness {
            buf.put_u8(SEGWIT_MARKER);
            buf.put_u8(SEGWIT_FLAG);
        }

        write_var_int(&mut buf, self.inputs.len() as u64);
        for input in &self.inputs {
            input.write(&mut buf);
        }

        write_var_int(&mut buf, self.outputs.len() as u64);
        for output in &self.outputs {
            output.write(&mut buf);
        }

        if with_witness {
            for input in &self.inputs {
                write_var_int(&mut buf, input.witness.len() as u64);
                for item in &input.witness {
                    write_var_bytes(&mut buf, item);
                }
            }
        }

        buf.put_u32_le(self.header.lock_time);
        buf
    }

    pub fn deserialize(data: &[u8]) -> Result<Self, EncodingError> {
        let mut reader = ByteReader::new(data);
        let tx = Self::read(&mut reader)?;
        reader.finish()?;
        Ok(tx)
    }

    /// Read one transaction from a stream
    pub fn read(reader: &mut ByteReader<'_>) -> Result<Self, EncodingError> {
        let version = reader.read_i32_le()?;

        let mut segwit = false;
        if reader.peek_u8() == Some(SEGWIT_MARKER) {
            let mut probe = reader.clone();
            probe.read_u8()?;
            if probe.read_u8()? == SEGWIT_FLAG {
                *reader = probe;
                segwit = true;
            }
        }

        let input_count = reader.read_length()?;
        let mut inputs = Vec::with_capacity(input_count.min(1024));
        for _ in 0..input_count {
            let previous_output = OutPoint::new(reader.read_hash()?, reader.read_u32_le()?);
            let signature_script = reader.read_var_bytes()?;
            let sequence = reader.read_u32_le()?;
            inputs.push(Input::new(previous_output, signature_script, sequence));
        }

        let output_count = reader.read_length()?;
        let mut outputs = Vec::with_capacity(output_count.min(1024));
        for index in 0..output_count {
            let value = reader.read_u64_le()?;
            let lock_script = reader.read_var_bytes()?;
            outputs.push(Output::new(value, index as u32, lock_script));
        }

        if segwit {
            for input in &mut inputs {
                let items = reader.read_length()?;
                for _ in 0..items {
                    input.witness.push(reader.read_var_bytes()?);
                }
            }
        }

        let lock_time = reader.read_u32_le()?;
        Ok(Self::new(Transaction::new(version, lock_time), inputs, outputs))
    }

    pub fn total_output(&self) -> u64 {
        self.outputs.iter().map(|o| o.value).sum()
    }

    // =========================================================================
    // Signature Hashes
    // =========================================================================

    /// Legacy signature hash of input `index` with the given script code
    pub fn legacy_sighash(&self, index: usize, script_code: &[u8], sighash_type: u8) -> [u8; 32] {
        let mut copy = self.clone();
        for (i, input) in copy.inputs.iter_mut().enumerate() {
            input.witness.clear();
            input.signature_script = if i == index {
                script_code.to_vec()
            } else {
                Vec::new()
            };
        }

        let mut preimage = copy.serialize_without_witness();
        preimage.put_u32_le(sighash_type as u32);
        double_sha256(&preimage)
    }

    /// BIP143 signature hash of input `index` spending `value` satoshis
    pub fn witness_v0_sighash(&self, index: usize, script_code: &[u8], value: u64, sighash_type: u8) -> Result<[u8; 32], EncodingError> {
        let input = self.inputs.get(index).ok_or_else(|| {
            EncodingError::InvalidData(format!("no input at index {index}"))
        })?;

        let mut prevouts = Vec::with_capacity(self.inputs.len() * 36);
        let mut sequences = Vec::with_capacity(self.inputs.len() * 4);
        for i in &self.inputs {
            prevouts.put_slice(&i.previous_output.serialize());
            sequences.put_u32_le(i.sequence);
        }

        let mut outputs = Vec::new();
        for output in &self.outputs {
            output.write(&mut outputs);
        }

        let mut preimage = Vec::with_capacity(200);
        preimage.put_i32_le(self.header.version);
        preimage.put_slice(&double_sha256(&prevouts));
        preimage.put_slice(&double_sha256(&sequences));
        preimage.put_slice(&input.previous_output.serialize());
        write_var_bytes(&mut preimage, script_code);
        preimage.put_u64_le(value);
        preimage.put_u32_le(input.sequence);
        preimage.put_slice(&double_sha256(&outputs));
        preimage.put_u32_le(self.header.lock_time);
        preimage.put_u32_le(sighash_type as u32);

        Ok(double_sha256(&preimage))
    }
}

// =============================================================================
// Tests
// =============================================================================
