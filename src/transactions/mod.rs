//! Wallet transactions
//!
//! Building and signing outgoing payments, and the pipeline that turns
//! relayed or confirmed transactions into stored wallet history.

pub mod builder;
pub mod conflicts;
pub mod creator;
pub mod extractor;
pub mod info;
pub mod mutable;
pub mod processor;
pub mod selector;
pub mod sender;
pub mod setters;
pub mod signer;
pub mod sorter;
pub mod syncer;
pub mod watched;

pub use builder::{BuildError, TransactionBuilder, TransactionFeeCalculator};
pub use conflicts::{TransactionConflictsResolver, TransactionInvalidator};
pub use creator::{TransactionCreationError, TransactionCreator};
pub use extractor::TransactionExtractor;
pub use info::{TransactionFilterType, TransactionInfo, TransactionInfoConverter};
pub use mutable::{InputToSign, MutableTransaction};
pub use processor::{topological_order, BlockTransactionProcessor, PendingTransactionProcessor, ProcessError};
pub use selector::{
    AccumulateSelector, SelectedUnspentOutputInfo, SelectionParams, SendValueError, SingleNoChangeSelector,
    UnspentOutputSelector, UnspentOutputSelectorChain,
};
pub use sender::{RetryDecision, RetryPolicy, TransactionSendError, TransactionSender};
pub use setters::{InputSetter, LockTimeSetter, OutputSetter, RecipientSetter};
pub use signer::{SignError, TransactionSigner};
pub use sorter::TransactionDataSortType;
pub use syncer::TransactionSyncer;
pub use watched::{WatchedFilter, WatchedTransactionManager};
