//! Transaction indexer.
//!
//! Persists a transaction with its inputs and outputs, builds the address
//! index from each output's script classification, and in pruned mode
//! deletes previous transactions once every one of their outputs is spent.

use tracing::{debug, warn};

use chainvault_core::error::{LedgerError, ValidationError};
use chainvault_core::script;
use chainvault_core::traits::TransactionValidator;
use chainvault_core::types::{Hash256, Transaction};

use crate::config::StorageMode;
use crate::records::*;
use crate::unit::WriteUnit;

/// Stores transactions into a [`WriteUnit`].
pub(crate) struct Indexer<'a> {
    pub mode: StorageMode,
    pub validator: Option<&'a dyn TransactionValidator>,
}

impl Indexer<'_> {
    /// Store `tx`, returning its id. Storing a known hash returns the
    /// existing id and writes nothing.
    pub fn store(
        &self,
        unit: &mut WriteUnit<'_>,
        tx: &Transaction,
        validate: bool,
    ) -> Result<u64, LedgerError> {
        let payload = tx.payload();
        let hash = tx.txid();
        debug!(txid = %hash, bytes = payload.len(), "storing transaction");

        if validate {
            let validator = self.validator.ok_or(ValidationError::NoValidator)?;
            validator.validate(tx)?;
        }

        if let Some(id) = unit.tx_id_by_hash(&hash)? {
            return Ok(id);
        }

        let tx_id = unit.next_id(CF_TXS)?;
        unit.insert_tx(&TxRecord {
            id: tx_id,
            hash,
            version: tx.version,
            lock_time: tx.lock_time,
            coinbase: tx.is_coinbase(),
            size: payload.len() as u32,
        })?;

        for (idx, input) in tx.inputs.iter().enumerate() {
            let txin_id = unit.next_id(CF_TXINS)?;
            unit.insert_txin(&TxInRecord {
                id: txin_id,
                tx_id,
                tx_idx: idx as u32,
                script_sig: input.script_sig.clone(),
                prev_out: input.previous_output.clone(),
                sequence: input.sequence,
            })?;

            if self.mode == StorageMode::Pruned && !input.previous_output.is_null() {
                self.prune_if_spent(unit, &input.previous_output.txid);
            }
        }

        for (idx, output) in tx.outputs.iter().enumerate() {
            let class = script::classify(&output.script_pubkey);
            let txout_id = unit.next_id(CF_TXOUTS)?;
            unit.insert_txout(&TxOutRecord {
                id: txout_id,
                tx_id,
                tx_idx: idx as u32,
                script_pubkey: output.script_pubkey.clone(),
                value: output.value,
                script_type: class.script_type,
            })?;
            for hash160 in &class.addresses {
                let address_id = unit.ensure_address(hash160)?;
                unit.link_address(address_id, txout_id);
            }
        }

        Ok(tx_id)
    }

    /// Delete `prev_txid` once every one of its outputs has been spent.
    ///
    /// Best effort: a failure while gathering the deletion leaves the
    /// transaction in place.
    fn prune_if_spent(&self, unit: &mut WriteUnit<'_>, prev_txid: &Hash256) {
        let plan = (|| -> Result<Option<Vec<(&'static str, Vec<u8>)>>, LedgerError> {
            let Some(prev_id) = unit.tx_id_by_hash(prev_txid)? else {
                return Ok(None);
            };
            let outputs = unit.txouts_of(prev_id)?;
            let spent = unit.spent_positions(prev_txid)?;
            if !outputs.iter().all(|out| spent.contains(&out.tx_idx)) {
                return Ok(None);
            }
            unit.tx_deletion_keys(prev_id).map(Some)
        })();

        match plan {
            Ok(Some(keys)) => {
                debug!(txid = %prev_txid, "deleting tx since all its outputs are spent");
                unit.delete_keys(keys);
            }
            Ok(None) => {}
            Err(e) => warn!(txid = %prev_txid, error = %e, "skipping prune of spent transaction"),
        }
    }
}
