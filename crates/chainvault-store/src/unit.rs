//! Atomic write unit.
//!
//! A [`WriteUnit`] stages puts and deletes over a backend, serves reads
//! (point and prefix) through the staged overlay, and commits everything as
//! a single backend batch. Dropping a unit without committing discards it.

use std::collections::{BTreeMap, HashMap};

use chainvault_core::error::LedgerError;
use chainvault_core::types::{Chain, Hash160};

use crate::backend::{BatchOp, RecordBackend};
use crate::records::*;

type Overlay = BTreeMap<Vec<u8>, Option<Vec<u8>>>;

/// Staged mutations over a [`RecordBackend`].
pub struct WriteUnit<'a> {
    backend: &'a dyn RecordBackend,
    staged: HashMap<&'static str, Overlay>,
}

impl<'a> WriteUnit<'a> {
    pub fn new(backend: &'a dyn RecordBackend) -> Self {
        Self {
            backend,
            staged: HashMap::new(),
        }
    }

    /// Whether nothing has been staged.
    pub fn is_empty(&self) -> bool {
        self.staged.values().all(BTreeMap::is_empty)
    }

    pub fn put_raw(&mut self, cf: &'static str, key: &[u8], value: Vec<u8>) {
        self.staged.entry(cf).or_default().insert(key.to_vec(), Some(value));
    }

    pub fn delete_raw(&mut self, cf: &'static str, key: &[u8]) {
        self.staged.entry(cf).or_default().insert(key.to_vec(), None);
    }

    fn put_record<T: bincode::Encode>(
        &mut self,
        cf: &'static str,
        id: u64,
        record: &T,
    ) -> Result<(), LedgerError> {
        let bytes = encode(record)?;
        self.put_raw(cf, &id_key(id), bytes);
        Ok(())
    }

    fn put_marker(&mut self, cf: &'static str, key: &[u8]) {
        self.put_raw(cf, key, Vec::new());
    }

    /// Write every staged change in one atomic batch.
    pub fn commit(self) -> Result<(), LedgerError> {
        let ops: Vec<BatchOp> = self
            .staged
            .into_iter()
            .flat_map(|(cf, overlay)| {
                overlay.into_iter().map(move |(key, value)| match value {
                    Some(value) => BatchOp::Put { cf, key, value },
                    None => BatchOp::Delete { cf, key },
                })
            })
            .collect();
        if ops.is_empty() {
            return Ok(());
        }
        self.backend.write(ops)
    }

    // --- Id sequences ---

    /// Allocate the next id for `table`. Ids start at 1.
    pub fn next_id(&mut self, table: &'static str) -> Result<u64, LedgerError> {
        let key = format!("seq/{table}");
        let last = match self.get_raw(CF_META, key.as_bytes())? {
            Some(bytes) => read_u64(CF_META, &bytes, 0)?,
            None => 0,
        };
        let next = last + 1;
        self.put_raw(CF_META, key.as_bytes(), next.to_be_bytes().to_vec());
        Ok(next)
    }

    // --- Blocks ---

    /// Write a block record and keep its indexes in step with any earlier
    /// version of the same record.
    pub fn put_block(&mut self, record: &BlockRecord) -> Result<(), LedgerError> {
        if let Some(old) = self.block(record.id)? {
            self.delete_raw(CF_BLOCK_BY_DEPTH, &block_depth_key(old.chain, old.depth, old.id));
            self.delete_raw(CF_BLOCK_BY_PREV, &block_prev_key(&old.prev_hash, old.chain, old.id));
        }
        self.put_record(CF_BLOCKS, record.id, record)?;
        self.put_raw(CF_BLOCK_BY_HASH, record.hash.as_bytes(), id_key(record.id).to_vec());
        self.put_marker(
            CF_BLOCK_BY_DEPTH,
            &block_depth_key(record.chain, record.depth, record.id),
        );
        self.put_marker(
            CF_BLOCK_BY_PREV,
            &block_prev_key(&record.prev_hash, record.chain, record.id),
        );
        Ok(())
    }

    /// Move a stored block to another chain and depth.
    pub fn place_block(
        &mut self,
        mut record: BlockRecord,
        chain: Chain,
        depth: i64,
    ) -> Result<BlockRecord, LedgerError> {
        record.chain = chain;
        record.depth = depth;
        self.put_block(&record)?;
        Ok(record)
    }

    pub fn link_block_tx(&mut self, block_id: u64, tx_id: u64, idx: u32) {
        self.put_raw(CF_BLOCK_TXS, &position_key(block_id, idx), id_key(tx_id).to_vec());
        self.put_raw(CF_TX_BLOCKS, &pair_key(tx_id, block_id), idx.to_be_bytes().to_vec());
    }

    // --- Transactions ---

    pub fn insert_tx(&mut self, record: &TxRecord) -> Result<(), LedgerError> {
        self.put_record(CF_TXS, record.id, record)?;
        self.put_raw(CF_TX_BY_HASH, record.hash.as_bytes(), id_key(record.id).to_vec());
        Ok(())
    }

    pub fn insert_txin(&mut self, record: &TxInRecord) -> Result<(), LedgerError> {
        self.put_record(CF_TXINS, record.id, record)?;
        self.put_raw(
            CF_TXINS_BY_TX,
            &position_key(record.tx_id, record.tx_idx),
            id_key(record.id).to_vec(),
        );
        if !record.prev_out.is_null() {
            let prev = &record.prev_out;
            self.put_marker(CF_TXINS_BY_PREVOUT, &prevout_key(prev, record.id));
            self.put_marker(CF_SPENT_OUTPOINTS, &prevout_prefix(&prev.txid, prev.index));
        }
        Ok(())
    }

    pub fn insert_txout(&mut self, record: &TxOutRecord) -> Result<(), LedgerError> {
        self.put_record(CF_TXOUTS, record.id, record)?;
        self.put_raw(
            CF_TXOUTS_BY_TX,
            &position_key(record.tx_id, record.tx_idx),
            id_key(record.id).to_vec(),
        );
        self.put_marker(CF_TXOUTS_BY_SCRIPT, &script_key(&record.script_pubkey, record.id));
        Ok(())
    }

    // --- Addresses ---

    /// Look up an address, creating it on first use.
    pub fn ensure_address(&mut self, hash160: &Hash160) -> Result<u64, LedgerError> {
        if let Some(id) = self.address_id(hash160)? {
            return Ok(id);
        }
        let id = self.next_id(CF_ADDRESSES)?;
        self.put_record(
            CF_ADDRESSES,
            id,
            &AddressRecord {
                id,
                hash160: *hash160,
            },
        )?;
        self.put_raw(CF_ADDRESS_BY_HASH160, hash160.as_bytes(), id_key(id).to_vec());
        Ok(id)
    }

    pub fn link_address(&mut self, address_id: u64, txout_id: u64) {
        self.put_marker(CF_ADDRESS_TXOUTS, &pair_key(address_id, txout_id));
        self.put_marker(CF_TXOUT_ADDRESSES, &pair_key(txout_id, address_id));
    }

    // --- Deletion ---

    /// Every key that removing a transaction touches: the transaction, its
    /// inputs and outputs with their indexes, output↔address links and
    /// block links, plus the spent markers on its own outputs. Address
    /// records and the markers its inputs left on earlier outputs are not
    /// included.
    pub fn tx_deletion_keys(
        &self,
        tx_id: u64,
    ) -> Result<Vec<(&'static str, Vec<u8>)>, LedgerError> {
        let Some(tx) = self.tx(tx_id)? else {
            return Ok(Vec::new());
        };
        let mut keys: Vec<(&'static str, Vec<u8>)> = vec![
            (CF_TXS, id_key(tx.id).to_vec()),
            (CF_TX_BY_HASH, tx.hash.as_bytes().to_vec()),
        ];

        for txin in self.txins_of(tx.id)? {
            keys.push((CF_TXINS, id_key(txin.id).to_vec()));
            keys.push((CF_TXINS_BY_TX, position_key(tx.id, txin.tx_idx).to_vec()));
            if !txin.prev_out.is_null() {
                keys.push((CF_TXINS_BY_PREVOUT, prevout_key(&txin.prev_out, txin.id).to_vec()));
            }
        }

        for txout in self.txouts_of(tx.id)? {
            keys.push((CF_TXOUTS, id_key(txout.id).to_vec()));
            keys.push((CF_TXOUTS_BY_TX, position_key(tx.id, txout.tx_idx).to_vec()));
            keys.push((CF_TXOUTS_BY_SCRIPT, script_key(&txout.script_pubkey, txout.id).to_vec()));
            for address_id in self.txout_address_ids(txout.id)? {
                keys.push((CF_ADDRESS_TXOUTS, pair_key(address_id, txout.id).to_vec()));
                keys.push((CF_TXOUT_ADDRESSES, pair_key(txout.id, address_id).to_vec()));
            }
        }

        for (key, _) in self.scan_raw(CF_SPENT_OUTPOINTS, tx.hash.as_bytes())? {
            keys.push((CF_SPENT_OUTPOINTS, key));
        }

        for (key, value) in self.scan_raw(CF_TX_BLOCKS, &id_key(tx.id))? {
            let block_id = read_u64(CF_TX_BLOCKS, &key, 8)?;
            let idx = read_u32(CF_TX_BLOCKS, &value, 0)?;
            keys.push((CF_BLOCK_TXS, position_key(block_id, idx).to_vec()));
            keys.push((CF_TX_BLOCKS, key));
        }

        Ok(keys)
    }

    pub fn delete_keys(&mut self, keys: Vec<(&'static str, Vec<u8>)>) {
        for (cf, key) in keys {
            self.delete_raw(cf, &key);
        }
    }
}

impl RecordRead for WriteUnit<'_> {
    fn get_raw(&self, cf: &'static str, key: &[u8]) -> Result<Option<Vec<u8>>, LedgerError> {
        if let Some(staged) = self.staged.get(cf).and_then(|overlay| overlay.get(key)) {
            return Ok(staged.clone());
        }
        self.backend.get(cf, key)
    }

    fn scan_raw(
        &self,
        cf: &'static str,
        prefix: &[u8],
    ) -> Result<Vec<(Vec<u8>, Vec<u8>)>, LedgerError> {
        let base = self.backend.scan_prefix(cf, prefix)?;
        let Some(overlay) = self.staged.get(cf) else {
            return Ok(base);
        };

        let mut merged: BTreeMap<Vec<u8>, Vec<u8>> = base.into_iter().collect();
        for (key, value) in overlay
            .range(prefix.to_vec()..)
            .take_while(|(key, _)| key.starts_with(prefix))
        {
            match value {
                Some(value) => {
                    merged.insert(key.clone(), value.clone());
                }
                None => {
                    merged.remove(key);
                }
            }
        }
        Ok(merged.into_iter().collect())
    }
}
