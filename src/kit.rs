//! The SPV kit
//!
//! `SpvKit` owns every component of a wallet node and exposes the
//! operations an application needs: balance, history, sending and
//! receiving, and the event bus. Components are wired once in `new`;
//! `start` spawns the peer group and the background tasks.

use crate::bloom::{BloomFilterManager, IrregularOutputsProvider, PendingOutpointsProvider};
use crate::config::{ConfigError, CoreConfig, SyncMode};
use crate::core::{
    Address, AddressConverter, AddressConverterChain, BitcoinSizeCalculator, BlockInfo, DustCalculator,
    PublicKey, ScriptType, TransactionSizeCalculator, PROTOCOL_VERSION,
};
use crate::crypto::Hash256;
use crate::error::{Error, Result};
use crate::events::{BalanceWatcher, EventDispatcher, Subscription, SubscriptionId};
use crate::network::{
    NetworkMessageParser, PeerConnector, PeerGroup, PeerGroupConfig, PeerGroupHandle, PeerGroupStatus,
    TcpConnector,
};
use crate::storage::{Storage, UnspentOutput};
use crate::sync::{
    ApiSyncer, BlockHashFetcher, BlockSyncer, BlockValidatorChain, Blockchain, InitialBlockDownload,
    KitState, KitStateManager, MerkleBlockValidator,
};
use crate::transactions::{
    BlockTransactionProcessor, InputSetter, LockTimeSetter, OutputSetter, PendingTransactionProcessor,
    RecipientSetter, RetryPolicy, TransactionBuilder, TransactionCreator, TransactionExtractor,
    TransactionFeeCalculator, TransactionFilterType, TransactionInfo, TransactionInfoConverter,
    TransactionInvalidator, TransactionSendError, TransactionSender, TransactionSigner, TransactionSyncer,
    UnspentOutputSelectorChain, WatchedFilter, WatchedTransactionManager,
};
use crate::utils::lock;
use crate::wallet::{BalanceInfo, KeyDeriver, PublicKeyManager, SeedKeyDeriver, UnspentOutputProvider};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;

/// How often unconfirmed outgoing transactions are checked for resending
const PENDING_CHECK_INTERVAL: Duration = Duration::from_secs(10);

pub struct SpvKit {
    config: CoreConfig,
    storage: Arc<dyn Storage>,
    events: Arc<EventDispatcher>,
    kit_state: Arc<KitStateManager>,
    address_converter: Arc<AddressConverterChain>,
    public_key_manager: Arc<PublicKeyManager>,
    unspent_provider: Arc<UnspentOutputProvider>,
    info_converter: Arc<TransactionInfoConverter>,
    watched: Arc<WatchedTransactionManager>,
    bloom_filter_manager: Arc<BloomFilterManager>,
    block_syncer: Arc<BlockSyncer>,
    api_syncer: Option<ApiSyncer>,
    fee_calculator: TransactionFeeCalculator,
    creator: TransactionCreator,
    sender: Arc<TransactionSender>,
    peer_group_handle: PeerGroupHandle,
    /// Taken by `start`
    peer_group: Mutex<Option<PeerGroup>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl SpvKit {
    /// Wire a kit over `storage`. API sync mode needs a `fetcher`.
    pub fn new(
        config: CoreConfig,
        deriver: Arc<dyn KeyDeriver>,
        storage: Arc<dyn Storage>,
        connector: Arc<dyn PeerConnector>,
        fetcher: Option<Arc<dyn BlockHashFetcher>>,
    ) -> Result<Self> {
        config.validate()?;
        if config.sync_mode == SyncMode::Api && fetcher.is_none() {
            return Err(ConfigError::InvalidValue {
                field: "sync_mode",
                reason: "api sync needs a block hash fetcher".to_string(),
            }
            .into());
        }
        let network = config.network;
        log::info!("Creating kit for {} ({:?} sync)", network, config.sync_mode);

        let events = Arc::new(EventDispatcher::new());
        let kit_state = Arc::new(KitStateManager::new(events.clone()));
        let address_converter = Arc::new(AddressConverterChain::for_network(network));
        let public_key_manager = Arc::new(PublicKeyManager::new(
            storage.clone(),
            deriver.clone(),
            config.gap_limit,
        ));
        let unspent_provider = Arc::new(UnspentOutputProvider::new(
            storage.clone(),
            config.confirmations_threshold,
        ));
        let info_converter = Arc::new(TransactionInfoConverter::new(storage.clone()));
        let watched = Arc::new(WatchedTransactionManager::new(events.clone()));

        // transaction processing
        let extractor = Arc::new(TransactionExtractor::new(storage.clone(), address_converter.clone()));
        let invalidator = Arc::new(TransactionInvalidator::new(
            storage.clone(),
            info_converter.clone(),
            events.clone(),
        ));
        let block_processor = Arc::new(BlockTransactionProcessor::new(
            storage.clone(),
            extractor.clone(),
            public_key_manager.clone(),
            info_converter.clone(),
            watched.clone(),
            invalidator.clone(),
            events.clone(),
        ));
        let pending_processor = Arc::new(PendingTransactionProcessor::new(
            storage.clone(),
            extractor,
            public_key_manager.clone(),
            info_converter.clone(),
            watched.clone(),
            events.clone(),
        ));

        // bloom filter
        let bloom_filter_manager = Arc::new(BloomFilterManager::new());
        bloom_filter_manager.add_provider(public_key_manager.clone());
        bloom_filter_manager.add_provider(Arc::new(PendingOutpointsProvider::new(storage.clone())));
        bloom_filter_manager.add_provider(Arc::new(IrregularOutputsProvider::new(storage.clone())));
        bloom_filter_manager.add_provider(watched.clone());

        // chain
        let blockchain = Arc::new(Blockchain::new(
            storage.clone(),
            BlockValidatorChain::for_network(network, storage.clone()),
            info_converter.clone(),
            events.clone(),
        ));
        let block_syncer = Arc::new(BlockSyncer::new(
            storage.clone(),
            config.checkpoint(),
            blockchain,
            block_processor,
            bloom_filter_manager.clone(),
            config.stale_block_retention,
        )?);
        let api_syncer = fetcher.map(|fetcher| {
            ApiSyncer::new(
                storage.clone(),
                public_key_manager.clone(),
                address_converter.clone(),
                fetcher,
                kit_state.clone(),
            )
        });

        // network
        let transaction_syncer = Arc::new(TransactionSyncer::new(
            storage.clone(),
            pending_processor.clone(),
            invalidator,
            bloom_filter_manager.clone(),
        ));
        let ibd = InitialBlockDownload::new(
            block_syncer.clone(),
            kit_state.clone(),
            MerkleBlockValidator::default(),
            PROTOCOL_VERSION,
        );
        let (peer_group, peer_group_handle) = PeerGroup::new(
            PeerGroupConfig {
                peer_size: config.peer_size,
                seed_peers: config.seed_peers.clone(),
                protocol_version: PROTOCOL_VERSION,
                task_timeout: config.task_timeout(),
                ping_interval: config.ping_interval(),
                peer_timeout: config.peer_timeout(),
            },
            storage.clone(),
            connector,
            block_syncer.clone(),
            transaction_syncer.clone(),
            bloom_filter_manager.clone(),
            ibd,
        );
        bloom_filter_manager.set_listener(Arc::new(peer_group_handle.clone()));

        // sending
        let size_calculator: Arc<dyn TransactionSizeCalculator> = Arc::new(BitcoinSizeCalculator::new());
        let dust_calculator = DustCalculator::new(config.dust_relay_fee(), size_calculator.clone());
        let selector = Arc::new(UnspentOutputSelectorChain::standard(
            size_calculator.clone(),
            dust_calculator.clone(),
            config.outputs_limit,
        ));
        let input_setter = || {
            InputSetter::new(
                unspent_provider.clone(),
                selector.clone(),
                public_key_manager.clone(),
                address_converter.clone(),
                size_calculator.clone(),
                dust_calculator.clone(),
                config.change_script_type,
            )
        };
        let builder = Arc::new(TransactionBuilder::new(
            RecipientSetter::new(address_converter.clone()),
            input_setter(),
            LockTimeSetter::new(storage.clone()),
            OutputSetter::new(),
            TransactionSigner::new(deriver),
        ));
        let fee_calculator = TransactionFeeCalculator::new(
            RecipientSetter::new(address_converter.clone()),
            input_setter(),
            unspent_provider.clone(),
            public_key_manager.clone(),
            address_converter.clone(),
            dust_calculator,
        );
        let sender = Arc::new(TransactionSender::new(
            transaction_syncer,
            storage.clone(),
            peer_group_handle.clone(),
            RetryPolicy {
                max_retries: config.max_retries,
                retries_period: config.retries_period_secs as i64,
                total_retries_period: config.total_retries_period_secs as i64,
            },
        ));
        let creator = TransactionCreator::new(
            builder,
            pending_processor,
            sender.clone(),
            bloom_filter_manager.clone(),
        );

        Ok(Self {
            config,
            storage,
            events,
            kit_state,
            address_converter,
            public_key_manager,
            unspent_provider,
            info_converter,
            watched,
            bloom_filter_manager,
            block_syncer,
            api_syncer,
            fee_calculator,
            creator,
            sender,
            peer_group_handle,
            peer_group: Mutex::new(Some(peer_group)),
            tasks: Mutex::new(Vec::new()),
        })
    }

    /// Kit connecting over TCP with keys derived from `seed`
    pub fn from_seed(config: CoreConfig, seed: &[u8], storage: Arc<dyn Storage>) -> Result<Self> {
        let deriver = Arc::new(SeedKeyDeriver::new(seed)?);
        let connector = Arc::new(TcpConnector::new(
            config.network,
            Arc::new(NetworkMessageParser::new()),
            config.peer_timeout(),
        ));
        Self::new(config, deriver, storage, connector, None)
    }

    pub fn config(&self) -> &CoreConfig {
        &self.config
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Fill the key gap, run the API restore when due, then connect to
    /// peers. A kit starts once.
    pub async fn start(&self) -> Result<()> {
        let group = lock(&self.peer_group).take().ok_or(Error::AlreadyStarted)?;
        log::info!("Starting kit");

        if let Err(e) = self.prepare().await {
            self.kit_state.set_not_synced(e.to_string());
            *lock(&self.peer_group) = Some(group);
            return Err(e);
        }

        let mut tasks = lock(&self.tasks);
        tasks.push(tokio::spawn(group.run()));
        tasks.push(
            BalanceWatcher::new(
                self.events.clone(),
                self.unspent_provider.clone(),
                self.config.balance_debounce(),
            )
            .spawn(),
        );
        tasks.push(self.spawn_resender());
        Ok(())
    }

    async fn prepare(&self) -> Result<()> {
        self.public_key_manager.fill_gap()?;
        if let Some(api_syncer) = &self.api_syncer {
            if self.is_fresh_wallet()? {
                let queued = api_syncer.sync().await?;
                log::info!("API restore queued {} blocks", queued);
            }
        }
        self.bloom_filter_manager.regenerate_bloom_filter()?;
        Ok(())
    }

    /// Nothing downloaded or queued past the checkpoint yet
    fn is_fresh_wallet(&self) -> Result<bool> {
        let height = self.storage.last_block()?.map_or(0, |b| b.height);
        Ok(height <= self.block_syncer.checkpoint().height && self.storage.block_hashes_count()? == 0)
    }

    fn spawn_resender(&self) -> JoinHandle<()> {
        let sender = self.sender.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(PENDING_CHECK_INTERVAL);
            loop {
                interval.tick().await;
                match sender.send_pending() {
                    Ok(0) => {}
                    Ok(sent) => log::debug!("Resent {} pending transactions", sent),
                    Err(e) => log::warn!("Failed to resend pending transactions: {}", e),
                }
            }
        })
    }

    pub fn stop(&self) {
        log::info!("Stopping kit");
        self.peer_group_handle.stop();
        for task in lock(&self.tasks).drain(..) {
            task.abort();
        }
    }

    pub fn is_running(&self) -> bool {
        !lock(&self.tasks).is_empty()
    }

    // =========================================================================
    // Queries
    // =========================================================================

    pub fn kit_state(&self) -> KitState {
        self.kit_state.state()
    }

    pub fn balance(&self) -> Result<BalanceInfo> {
        Ok(self.unspent_provider.balance()?)
    }

    pub fn last_block_info(&self) -> Result<Option<BlockInfo>> {
        Ok(self.storage.last_block()?.as_ref().map(BlockInfo::from))
    }

    pub fn peer_status(&self) -> PeerGroupStatus {
        self.peer_group_handle.status()
    }

    /// History page, newest first, starting after `from_uid`
    pub fn transactions(
        &self,
        from_uid: Option<&str>,
        filter: Option<TransactionFilterType>,
        limit: Option<usize>,
    ) -> Result<Vec<TransactionInfo>> {
        Ok(self.info_converter.transactions(from_uid, filter, limit)?)
    }

    pub fn transaction(&self, hash: &str) -> Result<Option<TransactionInfo>> {
        let hash = parse_hash(hash)?;
        match self.storage.full_transaction(&hash)? {
            Some(tx) => Ok(Some(self.info_converter.transaction_info(&tx)?)),
            None => Ok(None),
        }
    }

    /// Serialized transaction as hex
    pub fn raw_transaction(&self, hash: &str) -> Result<Option<String>> {
        let hash = parse_hash(hash)?;
        Ok(self
            .storage
            .full_transaction(&hash)?
            .map(|tx| hex::encode(tx.serialize())))
    }

    pub fn unspent_outputs(&self) -> Result<Vec<UnspentOutput>> {
        Ok(self.unspent_provider.spendable_outputs()?)
    }

    // =========================================================================
    // Receiving
    // =========================================================================

    pub fn receive_public_key(&self) -> Result<PublicKey> {
        Ok(self.public_key_manager.receive_public_key()?)
    }

    pub fn receive_address(&self, script_type: ScriptType) -> Result<String> {
        let key = self.public_key_manager.receive_public_key()?;
        Ok(self
            .address_converter
            .convert_public_key(&key, script_type)?
            .string_value)
    }

    pub fn validate_address(&self, address: &str) -> Result<Address> {
        Ok(self.address_converter.convert_string(address)?)
    }

    // =========================================================================
    // Sending
    // =========================================================================

    fn verify_connected(&self) -> Result<()> {
        if self.peer_group_handle.status().connected_peers().len() < self.config.min_connected_peers {
            return Err(TransactionSendError::NoConnectedPeers.into());
        }
        Ok(())
    }

    /// Build, store and broadcast a payment. The lock time is the best
    /// height unless `zero_lock_time` is set.
    pub fn send(
        &self,
        to_address: &str,
        value: u64,
        fee_rate: u64,
        sender_pay: bool,
        plugin_data: Option<Vec<u8>>,
        zero_lock_time: bool,
    ) -> Result<TransactionInfo> {
        self.verify_connected()?;
        let tx = self.creator.create(
            to_address,
            value,
            fee_rate,
            sender_pay,
            self.config.sort_type,
            plugin_data,
            zero_lock_time,
        )?;
        Ok(self.info_converter.transaction_info(&tx)?)
    }

    /// Spend one output entirely, the fee taken from it
    pub fn send_unspent(&self, unspent: UnspentOutput, to_address: &str, fee_rate: u64) -> Result<TransactionInfo> {
        self.verify_connected()?;
        let tx = self
            .creator
            .create_from_unspent(unspent, to_address, fee_rate, self.config.sort_type)?;
        Ok(self.info_converter.transaction_info(&tx)?)
    }

    pub fn fee(
        &self,
        value: u64,
        fee_rate: u64,
        sender_pay: bool,
        to_address: Option<&str>,
        plugin_data: Option<Vec<u8>>,
    ) -> Result<u64> {
        Ok(self
            .fee_calculator
            .fee(value, fee_rate, sender_pay, to_address, plugin_data)?)
    }

    pub fn max_spendable(
        &self,
        to_address: Option<&str>,
        fee_rate: u64,
        plugin_data: Option<Vec<u8>>,
    ) -> Result<u64> {
        Ok(self
            .fee_calculator
            .max_spendable_value(to_address, fee_rate, plugin_data)?)
    }

    pub fn min_spendable(&self, to_address: Option<&str>) -> Result<u64> {
        Ok(self.fee_calculator.min_spendable_value(to_address)?)
    }

    // =========================================================================
    // Watching & events
    // =========================================================================

    /// Returns false when the filter was already watched
    pub fn watch(&self, filter: WatchedFilter) -> Result<bool> {
        if !self.watched.add(filter) {
            return Ok(false);
        }
        self.bloom_filter_manager.regenerate_bloom_filter()?;
        Ok(true)
    }

    pub fn unwatch(&self, filter: &WatchedFilter) -> Result<()> {
        self.watched.remove(filter);
        self.bloom_filter_manager.regenerate_bloom_filter()?;
        Ok(())
    }

    pub fn subscribe(&self) -> Subscription {
        self.events.subscribe()
    }

    pub fn unsubscribe(&self, id: SubscriptionId) {
        self.events.unsubscribe(id);
    }

    /// Forget transactions and downloaded blocks; keys and peers stay
    pub fn clear(&self) -> Result<()> {
        log::info!("Clearing wallet data");
        self.storage.clear(self.block_syncer.checkpoint().height)?;
        self.bloom_filter_manager.regenerate_bloom_filter()?;
        Ok(())
    }
}

impl Drop for SpvKit {
    fn drop(&mut self) {
        for task in lock(&self.tasks).drain(..) {
            task.abort();
        }
    }
}

fn parse_hash(hash: &str) -> Result<Hash256> {
    Hash256::from_hex(hash).map_err(|_| Error::InvalidHash(hash.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{Network, OutPoint};
    use crate::network::{PeerConnection, PeerError};
    use crate::storage::MemoryStorage;
    use crate::sync::{ApiBlockHash, ApiSyncError};
    use crate::test_utils::{funded_storage, storage_with_keys, test_deriver, RECIPIENT};
    use crate::transactions::TransactionCreationError;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Offline;

    #[async_trait]
    impl PeerConnector for Offline {
        async fn connect(&self, address: &str) -> std::result::Result<PeerConnection, PeerError> {
            Err(PeerError::ConnectionFailed(format!("{} is unreachable", address)))
        }
    }

    #[derive(Default)]
    struct EmptyExplorer {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl BlockHashFetcher for EmptyExplorer {
        async fn block_hashes(&self, _: &[String]) -> std::result::Result<Vec<ApiBlockHash>, ApiSyncError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(Vec::new())
        }
    }

    fn config() -> CoreConfig {
        CoreConfig {
            gap_limit: 3,
            confirmations_threshold: 1,
            ..CoreConfig::for_network(Network::Mainnet)
        }
    }

    fn kit(storage: Arc<MemoryStorage>) -> SpvKit {
        SpvKit::new(config(), test_deriver(), storage, Arc::new(Offline), None).unwrap()
    }

    #[test]
    fn test_wallet_queries() {
        let storage = funded_storage(&[10_000, 20_000, 50_000]);
        let kit = kit(storage.clone());

        assert_eq!(kit.balance().unwrap().spendable, 80_000);
        assert_eq!(kit.last_block_info().unwrap().unwrap().height, 1);
        assert_eq!(kit.kit_state(), KitState::Idle);

        let history = kit.transactions(None, None, None).unwrap();
        assert_eq!(history.len(), 1);
        let hash = &history[0].transaction_hash;
        assert!(kit.transaction(hash).unwrap().is_some());
        let funding = storage.full_transactions().unwrap().remove(0);
        assert_eq!(
            kit.raw_transaction(hash).unwrap(),
            Some(hex::encode(funding.serialize()))
        );
        assert!(matches!(kit.raw_transaction("zz"), Err(Error::InvalidHash(_))));

        let address = kit.receive_address(ScriptType::P2pkh).unwrap();
        assert!(address.starts_with('1'));
        assert_eq!(kit.validate_address(&address).unwrap().script_type, ScriptType::P2pkh);
        assert!(kit.validate_address("not-an-address").is_err());
    }

    #[test]
    fn test_fee_estimates() {
        let kit = kit(funded_storage(&[10_000, 20_000, 50_000]));

        let fee = kit.fee(25_000, 2, true, Some(RECIPIENT), None).unwrap();
        assert!(fee > 0);
        let max = kit.max_spendable(Some(RECIPIENT), 2, None).unwrap();
        assert!(max > 0 && max < 80_000);
        assert_eq!(
            kit.min_spendable(None).unwrap(),
            DustCalculator::new(
                Network::Mainnet.dust_relay_fee(),
                Arc::new(BitcoinSizeCalculator::new())
            )
            .dust(ScriptType::P2pkh)
        );
    }

    #[test]
    fn test_send_needs_peers() {
        let storage = funded_storage(&[10_000, 20_000, 50_000]);
        let kit = kit(storage.clone());

        let result = kit.send(RECIPIENT, 25_000, 2, true, None, false);
        assert!(matches!(
            result,
            Err(Error::Send(TransactionSendError::NoConnectedPeers))
        ));

        let relaxed = SpvKit::new(
            CoreConfig {
                min_connected_peers: 0,
                ..config()
            },
            test_deriver(),
            storage.clone(),
            Arc::new(Offline),
            None,
        )
        .unwrap();
        assert!(matches!(
            relaxed.send(RECIPIENT, 25_000, 2, true, None, false),
            Err(Error::Creation(TransactionCreationError::Send(
                TransactionSendError::NoConnectedPeers
            )))
        ));
        assert_eq!(storage.full_transactions().unwrap().len(), 1);
    }

    #[test]
    fn test_watch_and_clear() {
        let storage = funded_storage(&[10_000]);
        let kit = kit(storage.clone());

        let filter = WatchedFilter::Outpoint {
            outpoint: OutPoint::new(Hash256::digest(b"watched"), 0),
        };
        assert!(kit.watch(filter.clone()).unwrap());
        assert!(!kit.watch(filter.clone()).unwrap());
        kit.unwatch(&filter).unwrap();

        kit.clear().unwrap();
        assert!(kit.transactions(None, None, None).unwrap().is_empty());
        assert_eq!(kit.balance().unwrap(), BalanceInfo::default());
        assert!(storage.public_key("0/0/0").unwrap().is_some());
    }

    #[tokio::test]
    async fn test_start_and_stop() {
        let kit = kit(storage_with_keys(3));
        kit.start().await.unwrap();
        assert!(kit.is_running());
        assert!(matches!(kit.start().await, Err(Error::AlreadyStarted)));
        // the gap is filled and announced in the filter
        assert!(kit.bloom_filter_manager.bloom_filter().is_some());

        kit.stop();
        assert!(!kit.is_running());
    }

    #[tokio::test]
    async fn test_api_restore_on_fresh_wallet() {
        let explorer = Arc::new(EmptyExplorer::default());
        let kit = SpvKit::new(
            CoreConfig {
                sync_mode: SyncMode::Api,
                ..config()
            },
            test_deriver(),
            storage_with_keys(3),
            Arc::new(Offline),
            Some(explorer.clone() as Arc<dyn BlockHashFetcher>),
        )
        .unwrap();

        kit.start().await.unwrap();
        // one empty batch per chain ends the walk
        assert_eq!(explorer.calls.load(Ordering::SeqCst), 2);
        kit.stop();
    }

    #[test]
    fn test_api_mode_needs_fetcher() {
        let result = SpvKit::new(
            CoreConfig {
                sync_mode: SyncMode::Api,
                ..config()
            },
            test_deriver(),
            Arc::new(MemoryStorage::new()),
            Arc::new(Offline),
            None,
        );
        assert!(matches!(result, Err(Error::Config(_))));
    }
}
