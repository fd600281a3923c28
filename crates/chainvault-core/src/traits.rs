//! Collaborator interfaces consumed by the store.

use crate::error::ValidationError;
use crate::types::Transaction;

/// Injectable transaction validation.
///
/// Consulted by the store only when a caller asks for validation; the store
/// itself never judges consensus rules.
pub trait TransactionValidator: Send + Sync {
    /// Accept or reject a transaction before anything is written.
    fn validate(&self, tx: &Transaction) -> Result<(), ValidationError>;
}
