//! Wallet bloom filter (BIP37)
//!
//! Providers contribute elements, the manager rebuilds the filter when
//! they change and hands it to the peer group.

pub mod filter;
pub mod manager;
pub mod providers;

pub use filter::BloomFilter;
pub use manager::{BloomFilterError, BloomFilterListener, BloomFilterManager};
pub use providers::{BloomFilterProvider, IrregularOutputsProvider, PendingOutpointsProvider};
