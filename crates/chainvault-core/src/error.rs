//! Error types for the chainvault ledger store.
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("validation requested but no validator is configured")] NoValidator,
    #[error("transaction {txid} rejected: {reason}")] Rejected { txid: String, reason: String },
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum IntegrityError {
    #[error("block hash mismatch: stored {stored}, recomputed {recomputed}")] BlockHashMismatch { stored: String, recomputed: String },
    #[error("transaction hash mismatch: stored {stored}, recomputed {recomputed}")] TxHashMismatch { stored: String, recomputed: String },
    #[error("corrupt record in {table}: {reason}")] CorruptRecord { table: &'static str, reason: String },
    #[error("dangling reference in {table} to id {id}")] DanglingReference { table: &'static str, id: u64 },
}

#[derive(Error, Debug)]
pub enum LedgerError {
    #[error(transparent)] Validation(#[from] ValidationError),
    #[error(transparent)] Integrity(#[from] IntegrityError),
    #[error("failed to store transaction {tx_hash} in block {block_hash}: {source}")]
    BlockPersist { block_hash: String, tx_hash: String, source: Box<LedgerError> },
    #[error("storage: {0}")] Storage(String),
    #[error("config: {0}")] Config(String),
}
