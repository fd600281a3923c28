//! # chainvault-store
//! Block and transaction persistence with fork handling and output indexing.
//!
//! - [`chain::ChainStore`]: block ingestion, head tracking, orphan re-attachment
//! - [`selector::ChainSelector`]: pluggable MAIN/SIDE/ORPHAN placement
//! - [`view`]: rebuilt blocks, transactions, inputs and outputs
//! - [`backend::RecordBackend`]: the record store boundary, with in-memory
//!   and RocksDB implementations
//! - [`config::StoreConfig`]: layered configuration

pub mod backend;
pub mod chain;
pub mod config;
mod indexer;
pub mod records;
pub mod rocks;
pub mod selector;
pub mod unit;
pub mod view;

pub use backend::{MemoryBackend, RecordBackend};
pub use chain::{ChainStore, ChainStoreBuilder};
pub use config::{StorageMode, StoreConfig};
pub use rocks::RocksBackend;
pub use selector::{ChainSelector, LongestChainSelector, Placement};
pub use view::{StoredBlock, StoredTransaction, StoredTxIn, StoredTxOut};
