//! Kit configuration
//!
//! Every field has a default, so a JSON document only needs the values it
//! changes. A configuration is validated once, before anything is built
//! from it.

use crate::core::{Checkpoint, CheckpointManager, CheckpointResult, Network, ScriptType};
use crate::crypto::compact_to_target;
use crate::transactions::TransactionDataSortType;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Invalid value for {field}: {reason}")]
    InvalidValue { field: &'static str, reason: String },
    #[error("Invalid peer address: {0}")]
    InvalidPeerAddress(String),
    #[error("Checkpoint at height {0} does not belong to {1}")]
    ForeignCheckpoint(u32, Network),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Parse error: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Where the first sync of a wallet starts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SyncMode {
    /// Scan every block from the restore checkpoint
    #[default]
    Full,
    /// Ask a block explorer which blocks touch the wallet first
    Api,
    /// Nothing can predate the newest checkpoint
    NewWallet,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoreConfig {
    pub network: Network,
    pub sync_mode: SyncMode,
    pub gap_limit: u32,
    /// Confirmations before received outputs are spendable
    pub confirmations_threshold: u32,
    pub peer_size: usize,
    /// Peers that must be connected for the kit to report sending possible
    pub min_connected_peers: usize,
    pub change_script_type: ScriptType,
    pub sort_type: TransactionDataSortType,
    pub max_retries: u32,
    pub retries_period_secs: u64,
    pub total_retries_period_secs: u64,
    /// Blocks kept below the best height before unused ones are deleted
    pub stale_block_retention: u32,
    pub balance_debounce_ms: u64,
    pub peer_timeout_secs: u64,
    pub ping_interval_secs: u64,
    pub task_timeout_secs: u64,
    /// `host:port` entries
    pub seed_peers: Vec<String>,
    pub checkpoint: Option<Checkpoint>,
    /// Largest number of outputs the selector may spend at once
    pub outputs_limit: Option<usize>,
    pub dust_relay_fee: Option<u64>,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            network: Network::Mainnet,
            sync_mode: SyncMode::Full,
            gap_limit: 20,
            confirmations_threshold: 6,
            peer_size: 10,
            min_connected_peers: 2,
            change_script_type: ScriptType::P2pkh,
            sort_type: TransactionDataSortType::Shuffle,
            max_retries: 3,
            retries_period_secs: 60,
            total_retries_period_secs: 3_600,
            stale_block_retention: 2_016,
            balance_debounce_ms: 500,
            peer_timeout_secs: 60,
            ping_interval_secs: 30,
            task_timeout_secs: 30,
            seed_peers: Vec::new(),
            checkpoint: None,
            outputs_limit: None,
            dust_relay_fee: None,
        }
    }
}

impl CoreConfig {
    pub fn for_network(network: Network) -> Self {
        Self {
            network,
            ..Self::default()
        }
    }

    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        Self::from_json(&std::fs::read_to_string(path)?)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        positive("gap_limit", self.gap_limit as u64)?;
        positive("peer_size", self.peer_size as u64)?;
        positive("retries_period_secs", self.retries_period_secs)?;
        positive("task_timeout_secs", self.task_timeout_secs)?;
        positive("peer_timeout_secs", self.peer_timeout_secs)?;
        positive("ping_interval_secs", self.ping_interval_secs)?;
        if self.min_connected_peers > self.peer_size {
            return Err(ConfigError::InvalidValue {
                field: "min_connected_peers",
                reason: format!("{} exceeds peer_size {}", self.min_connected_peers, self.peer_size),
            });
        }
        if self.total_retries_period_secs < self.retries_period_secs {
            return Err(ConfigError::InvalidValue {
                field: "total_retries_period_secs",
                reason: "shorter than retries_period_secs".to_string(),
            });
        }
        if self.outputs_limit == Some(0) {
            return Err(ConfigError::InvalidValue {
                field: "outputs_limit",
                reason: "must allow at least one output".to_string(),
            });
        }
        if matches!(self.change_script_type, ScriptType::Unknown | ScriptType::NullData) {
            return Err(ConfigError::InvalidValue {
                field: "change_script_type",
                reason: format!("{:?} cannot receive change", self.change_script_type),
            });
        }

        for peer in &self.seed_peers {
            if peer.parse::<SocketAddr>().is_err() {
                return Err(ConfigError::InvalidPeerAddress(peer.clone()));
            }
        }

        if let Some(checkpoint) = &self.checkpoint {
            let known = CheckpointManager::new(self.network);
            let foreign = matches!(
                known.verify_checkpoint(checkpoint.height, &checkpoint.hash()),
                CheckpointResult::Mismatch { .. }
            ) || compact_to_target(checkpoint.header.bits)
                > compact_to_target(self.network.max_target_bits());
            if foreign {
                return Err(ConfigError::ForeignCheckpoint(checkpoint.height, self.network));
            }
        }
        Ok(())
    }

    /// Checkpoint the chain is anchored on
    pub fn checkpoint(&self) -> Checkpoint {
        if let Some(checkpoint) = &self.checkpoint {
            return checkpoint.clone();
        }
        let known = CheckpointManager::new(self.network);
        let anchor = match self.sync_mode {
            SyncMode::NewWallet => known.last_checkpoint(),
            SyncMode::Full | SyncMode::Api => known.restore_checkpoint(),
        };
        anchor.cloned().unwrap_or_else(|| Checkpoint::genesis(self.network))
    }

    pub fn dust_relay_fee(&self) -> u64 {
        self.dust_relay_fee.unwrap_or_else(|| self.network.dust_relay_fee())
    }

    pub fn peer_timeout(&self) -> Duration {
        Duration::from_secs(self.peer_timeout_secs)
    }

    pub fn ping_interval(&self) -> Duration {
        Duration::from_secs(self.ping_interval_secs)
    }

    pub fn task_timeout(&self) -> Duration {
        Duration::from_secs(self.task_timeout_secs)
    }

    pub fn balance_debounce(&self) -> Duration {
        Duration::from_millis(self.balance_debounce_ms)
    }
}

fn positive(field: &'static str, value: u64) -> Result<(), ConfigError> {
    if value == 0 {
        return Err(ConfigError::InvalidValue {
            field,
            reason: "must be greater than zero".to_string(),
        });
    }
    Ok(())
}
