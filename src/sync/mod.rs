//! Chain synchronization
//!
//! Merkle block validation, the local header chain, and the download
//! state machine that drives peers through it.

pub mod api_sync;
pub mod block_syncer;
pub mod blockchain;
pub mod initial_block_download;
pub mod kit_state;
pub mod merkle_block;
pub mod validator;

pub use api_sync::{ApiBlockHash, ApiSyncError, ApiSyncer, BlockHashFetcher};
pub use block_syncer::{BlockSyncer, BlockSyncerError};
pub use blockchain::Blockchain;
pub use initial_block_download::{InitialBlockDownload, SyncAction, MERKLE_BLOCKS_PER_REQUEST};
pub use kit_state::{KitState, KitStateManager};
pub use merkle_block::{MerkleBlock, MerkleBlockValidationError, MerkleBlockValidator};
pub use validator::{
    BlockValidationError, BlockValidator, BlockValidatorChain, DifficultyTransitionValidator,
    HeaderLinkValidator, ProofOfWorkValidator,
};
