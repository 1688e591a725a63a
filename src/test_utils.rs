//! Shared test fixtures

use crate::bloom::BloomFilterManager;
use crate::core::script::lock_script;
use crate::core::{
    AddressConverterChain, BitcoinSizeCalculator, Block, BlockHeader, Checkpoint, DustCalculator,
    FullTransaction, Input, Network, OutPoint, Output, PublicKey, ScriptType, Transaction,
    TransactionSizeCalculator, SEQUENCE_FINAL,
};
use crate::crypto::Hash256;
use crate::events::EventDispatcher;
use crate::storage::{MemoryStorage, Storage, UnspentOutput};
use crate::sync::{BlockSyncer, BlockValidatorChain, Blockchain};
use crate::transactions::selector::UnspentOutputSelectorChain;
use crate::transactions::setters::{InputSetter, LockTimeSetter, OutputSetter, RecipientSetter};
use crate::transactions::signer::TransactionSigner;
use crate::transactions::{
    BlockTransactionProcessor, PendingTransactionProcessor, TransactionBuilder, TransactionExtractor,
    TransactionInfoConverter, TransactionInvalidator, WatchedTransactionManager,
};
use crate::wallet::{KeyDeriver, PublicKeyManager, SeedKeyDeriver, UnspentOutputProvider};
use std::sync::Arc;

pub const TEST_SEED: [u8; 32] = [42u8; 32];

pub fn test_deriver() -> Arc<dyn KeyDeriver> {
    Arc::new(SeedKeyDeriver::new(&TEST_SEED).unwrap())
}

pub fn wallet_key(index: u32, external: bool) -> PublicKey {
    test_deriver().public_key(0, index, external).unwrap()
}

/// Regtest-difficulty header; the nonce keeps hashes distinct per height
pub fn block_at(height: u32, previous_block_hash: Hash256) -> Block {
    let header = BlockHeader {
        version: 1,
        previous_block_hash,
        merkle_root: Hash256::digest(&height.to_le_bytes()),
        timestamp: 1_600_000_000 + height * 600,
        bits: 0x207f_ffff,
        nonce: height,
    };
    Block::new(header, height)
}

/// Linked chain of `count` blocks on top of `parent`
pub fn chain_from(parent: &Block, count: u32) -> Vec<Block> {
    let mut blocks = Vec::new();
    let mut previous = parent.clone();
    for _ in 0..count {
        let block = block_at(previous.height + 1, previous.header_hash);
        previous = block.clone();
        blocks.push(block);
    }
    blocks
}

fn random_outpoint() -> OutPoint {
    OutPoint::new(Hash256::digest(&rand::random::<[u8; 32]>()), 0)
}

pub fn p2pkh_output_to(key: &PublicKey, value: u64, index: u32) -> Output {
    let script = lock_script(ScriptType::P2pkh, &key.key_hash).unwrap();
    let mut output = Output::with_type(value, index, script, ScriptType::P2pkh, Some(key.key_hash.clone()));
    output.public_key_path = Some(key.path.clone());
    output
}

/// Payment to `key` funded from an unknown outpoint
pub fn incoming_transaction(key: &PublicKey, values: &[u64]) -> FullTransaction {
    let outputs = values
        .iter()
        .enumerate()
        .map(|(i, value)| p2pkh_output_to(key, *value, i as u32))
        .collect();
    let mut header = Transaction::default();
    header.is_mine = true;
    FullTransaction::new(header, vec![Input::new(random_outpoint(), vec![0x51], SEQUENCE_FINAL)], outputs)
}

/// Spends `outpoints` into one foreign P2PKH output
pub fn spending_transaction(outpoints: &[OutPoint], value: u64) -> FullTransaction {
    let inputs = outpoints
        .iter()
        .map(|outpoint| Input::new(*outpoint, vec![0x51], SEQUENCE_FINAL))
        .collect();
    let script = lock_script(ScriptType::P2pkh, &[9u8; 20]).unwrap();
    let output = Output::new(value, 0, script);
    FullTransaction::new(Transaction::default(), inputs, vec![output])
}

/// Unsigned foreign transaction with `count` outputs, spending `parents`
pub fn foreign_transaction(parents: &[OutPoint], count: u32) -> FullTransaction {
    let inputs = if parents.is_empty() {
        vec![Input::new(random_outpoint(), vec![0x51], SEQUENCE_FINAL)]
    } else {
        parents
            .iter()
            .map(|outpoint| Input::new(*outpoint, vec![0x51], SEQUENCE_FINAL))
            .collect()
    };
    let outputs = (0..count)
        .map(|i| Output::new(1_000, i, lock_script(ScriptType::P2pkh, &[7u8; 20]).unwrap()))
        .collect();
    FullTransaction::new(Transaction::default(), inputs, outputs)
}

/// Storage seeded with `count` keys on each chain
pub fn storage_with_keys(count: u32) -> Arc<MemoryStorage> {
    let storage = Arc::new(MemoryStorage::new());
    let deriver = test_deriver();
    let mut keys = deriver.public_keys(0, 0..count, true).unwrap();
    keys.extend(deriver.public_keys(0, 0..count, false).unwrap());
    storage.add_public_keys(keys).unwrap();
    storage
}

pub fn unspent(value: u64) -> UnspentOutput {
    let key = wallet_key(0, true);
    let tx = incoming_transaction(&key, &[value]);
    UnspentOutput {
        output: tx.outputs[0].clone(),
        public_key: key,
        transaction: tx.header,
        block_height: Some(1),
    }
}

/// Size calculator with fixed figures: 100 bytes for one output, 110 for two
pub struct MockSizeCalculator;

impl TransactionSizeCalculator for MockSizeCalculator {
    fn transaction_size(&self, _: &[Output], output_script_types: &[ScriptType], _: usize) -> usize {
        if output_script_types.len() > 1 {
            110
        } else {
            100
        }
    }

    fn output_size(&self, _: ScriptType) -> usize {
        10
    }

    fn input_size(&self, _: ScriptType) -> usize {
        10
    }

    fn witness_size(&self, _: ScriptType) -> usize {
        0
    }
}

/// Block syncer over `storage` anchored on a regtest-style root block,
/// with the public key manager as its only filter provider
pub fn block_syncer(storage: Arc<MemoryStorage>, gap_limit: u32) -> (Arc<BlockSyncer>, Block) {
    let root = block_at(0, Hash256::ZERO);
    let checkpoint = Checkpoint::new(0, root.header.clone());
    let events = Arc::new(EventDispatcher::new());
    let converter = Arc::new(TransactionInfoConverter::new(storage.clone()));
    let extractor = Arc::new(TransactionExtractor::new(
        storage.clone(),
        Arc::new(AddressConverterChain::for_network(Network::Regtest)),
    ));
    let public_key_manager = Arc::new(PublicKeyManager::new(storage.clone(), test_deriver(), gap_limit));
    let invalidator = Arc::new(TransactionInvalidator::new(
        storage.clone(),
        converter.clone(),
        events.clone(),
    ));
    let processor = Arc::new(BlockTransactionProcessor::new(
        storage.clone(),
        extractor,
        public_key_manager.clone(),
        converter.clone(),
        Arc::new(WatchedTransactionManager::new(events.clone())),
        invalidator,
        events.clone(),
    ));
    let blockchain = Arc::new(Blockchain::new(
        storage.clone(),
        BlockValidatorChain::for_network(Network::Regtest, storage.clone()),
        converter,
        events,
    ));
    let bloom = Arc::new(BloomFilterManager::new());
    bloom.add_provider(public_key_manager);
    let syncer = BlockSyncer::new(storage, checkpoint, blockchain, processor, bloom, 100).unwrap();
    (Arc::new(syncer), root)
}

/// Relayed-transaction pipeline over `storage` with a key-backed filter
pub struct PendingPipeline {
    pub processor: Arc<PendingTransactionProcessor>,
    pub invalidator: Arc<TransactionInvalidator>,
    pub public_key_manager: Arc<PublicKeyManager>,
    pub bloom: Arc<BloomFilterManager>,
    pub events: Arc<EventDispatcher>,
}

pub fn pending_pipeline(storage: Arc<MemoryStorage>, gap_limit: u32) -> PendingPipeline {
    let events = Arc::new(EventDispatcher::new());
    let converter = Arc::new(TransactionInfoConverter::new(storage.clone()));
    let extractor = Arc::new(TransactionExtractor::new(
        storage.clone(),
        Arc::new(AddressConverterChain::for_network(Network::Regtest)),
    ));
    let public_key_manager = Arc::new(PublicKeyManager::new(storage.clone(), test_deriver(), gap_limit));
    let invalidator = Arc::new(TransactionInvalidator::new(
        storage.clone(),
        converter.clone(),
        events.clone(),
    ));
    let processor = Arc::new(PendingTransactionProcessor::new(
        storage,
        extractor,
        public_key_manager.clone(),
        converter,
        Arc::new(WatchedTransactionManager::new(events.clone())),
        events.clone(),
    ));
    let bloom = Arc::new(BloomFilterManager::new());
    bloom.add_provider(public_key_manager.clone());
    PendingPipeline {
        processor,
        invalidator,
        public_key_manager,
        bloom,
        events,
    }
}

/// Mainnet P2PKH address outside the test wallet
pub const RECIPIENT: &str = "1BgGZ9tcN4rm9KBzDn7KprQz87SZ26SAMH";

/// Three keys per chain and one confirmed payment of `values` to "0/0/0"
pub fn funded_storage(values: &[u64]) -> Arc<MemoryStorage> {
    let storage = storage_with_keys(3);
    let key = wallet_key(0, true);
    let block = block_at(1, Hash256::ZERO);
    let mut funding = incoming_transaction(&key, values);
    funding.header.block_hash = Some(block.header_hash);
    storage.add_block(block).unwrap();
    storage.add_transaction(funding).unwrap();
    storage
}

/// Mainnet builder signing with the test seed
pub fn transaction_builder(storage: Arc<MemoryStorage>) -> TransactionBuilder {
    let converter = Arc::new(AddressConverterChain::for_network(Network::Mainnet));
    let calculator: Arc<dyn TransactionSizeCalculator> = Arc::new(BitcoinSizeCalculator::new());
    let dust = DustCalculator::new(Network::Mainnet.dust_relay_fee(), calculator.clone());
    let selector = Arc::new(UnspentOutputSelectorChain::standard(calculator.clone(), dust.clone(), None));
    let input_setter = InputSetter::new(
        Arc::new(UnspentOutputProvider::new(storage.clone(), 1)),
        selector,
        Arc::new(PublicKeyManager::new(storage.clone(), test_deriver(), 3)),
        converter.clone(),
        calculator,
        dust,
        ScriptType::P2pkh,
    );
    TransactionBuilder::new(
        RecipientSetter::new(converter),
        input_setter,
        LockTimeSetter::new(storage),
        OutputSetter::new(),
        TransactionSigner::new(test_deriver()),
    )
}
