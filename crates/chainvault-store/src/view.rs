//! Read-side views.
//!
//! Rebuilds blocks, transactions, inputs and outputs from stored records.
//! Block and transaction hashes are always recomputed from the rebuilt
//! structure and compared with the stored hash; a mismatch is an
//! [`IntegrityError`], never silently trusted.

use chainvault_core::error::{IntegrityError, LedgerError};
use chainvault_core::script::ScriptType;
use chainvault_core::types::{
    Block, Chain, Hash160, Hash256, Transaction, TxInput, TxOutput,
};

use crate::chain::ChainStore;
use crate::records::*;

/// A block as stored, with its placement.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StoredBlock {
    pub id: u64,
    pub hash: Hash256,
    pub depth: i64,
    pub chain: Chain,
    /// Serialized size recorded at ingestion.
    pub size: u32,
    pub block: Block,
}

/// A stored transaction and the block it resolves to, if any.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StoredTransaction {
    pub id: u64,
    pub hash: Hash256,
    /// Owning block, preferring MAIN. `None` while unconfirmed.
    pub block_id: Option<u64>,
    pub size: u32,
    pub tx: Transaction,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StoredTxIn {
    pub id: u64,
    pub tx_id: u64,
    pub tx_idx: u32,
    pub input: TxInput,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StoredTxOut {
    pub id: u64,
    pub tx_id: u64,
    pub tx_idx: u32,
    pub output: TxOutput,
    pub script_type: ScriptType,
    /// Addresses the output pays, in script order.
    pub addresses: Vec<Hash160>,
}

// --- Reconstruction ---

pub(crate) fn load_block<R: Records + ?Sized>(
    reader: &R,
    record: BlockRecord,
) -> Result<StoredBlock, LedgerError> {
    let header = record.header();
    let recomputed = header.hash();
    if recomputed != record.hash {
        return Err(IntegrityError::BlockHashMismatch {
            stored: record.hash.to_string(),
            recomputed: recomputed.to_string(),
        }
        .into());
    }

    let transactions = reader
        .block_tx_ids(record.id)?
        .into_iter()
        .map(|tx_id| {
            let tx: TxRecord = reader.referenced(CF_TXS, tx_id)?;
            rebuild_tx(reader, &tx)
        })
        .collect::<Result<Vec<_>, _>>()?;

    Ok(StoredBlock {
        id: record.id,
        hash: record.hash,
        depth: record.depth,
        chain: record.chain,
        size: record.size,
        block: Block {
            header,
            transactions,
        },
    })
}

fn rebuild_tx<R: Records + ?Sized>(
    reader: &R,
    record: &TxRecord,
) -> Result<Transaction, LedgerError> {
    let inputs = reader
        .txins_of(record.id)?
        .into_iter()
        .map(|txin| TxInput {
            previous_output: txin.prev_out,
            script_sig: txin.script_sig,
            sequence: txin.sequence,
        })
        .collect();
    let outputs = reader
        .txouts_of(record.id)?
        .into_iter()
        .map(|txout| TxOutput {
            value: txout.value,
            script_pubkey: txout.script_pubkey,
        })
        .collect();

    let tx = Transaction {
        version: record.version,
        inputs,
        outputs,
        lock_time: record.lock_time,
    };
    let recomputed = tx.txid();
    if recomputed != record.hash {
        return Err(IntegrityError::TxHashMismatch {
            stored: record.hash.to_string(),
            recomputed: recomputed.to_string(),
        }
        .into());
    }
    Ok(tx)
}

pub(crate) fn load_tx<R: Records + ?Sized>(
    reader: &R,
    record: TxRecord,
) -> Result<StoredTransaction, LedgerError> {
    let tx = rebuild_tx(reader, &record)?;
    let block_id = owning_block(reader, record.id)?.map(|block| block.id);
    Ok(StoredTransaction {
        id: record.id,
        hash: record.hash,
        block_id,
        size: record.size,
        tx,
    })
}

fn load_txin(record: TxInRecord) -> StoredTxIn {
    StoredTxIn {
        id: record.id,
        tx_id: record.tx_id,
        tx_idx: record.tx_idx,
        input: TxInput {
            previous_output: record.prev_out,
            script_sig: record.script_sig,
            sequence: record.sequence,
        },
    }
}

fn load_txout<R: Records + ?Sized>(
    reader: &R,
    record: TxOutRecord,
) -> Result<StoredTxOut, LedgerError> {
    let addresses = reader.addresses_of(record.id)?;
    Ok(StoredTxOut {
        id: record.id,
        tx_id: record.tx_id,
        tx_idx: record.tx_idx,
        output: TxOutput {
            value: record.value,
            script_pubkey: record.script_pubkey,
        },
        script_type: record.script_type,
        addresses,
    })
}

/// The block a transaction belongs to: a MAIN block if one links it,
/// otherwise the first linked block.
pub(crate) fn owning_block<R: Records + ?Sized>(
    reader: &R,
    tx_id: u64,
) -> Result<Option<BlockRecord>, LedgerError> {
    let mut first = None;
    for block_id in reader.tx_block_ids(tx_id)? {
        let block: BlockRecord = reader.referenced(CF_BLOCKS, block_id)?;
        if block.chain == Chain::Main {
            return Ok(Some(block));
        }
        first.get_or_insert(block);
    }
    Ok(first)
}

// --- Queries ---
//
// Each query reads through one snapshot so a concurrent prune cannot remove
// records between an index lookup and the records it points at.

impl ChainStore {
    pub fn get_tx(&self, hash: &Hash256) -> Result<Option<StoredTransaction>, LedgerError> {
        let snap = self.snapshot();
        let reader = &*snap;
        let Some(id) = reader.tx_id_by_hash(hash)? else {
            return Ok(None);
        };
        reader.tx(id)?.map(|record| load_tx(reader, record)).transpose()
    }

    pub fn get_tx_by_id(&self, id: u64) -> Result<Option<StoredTransaction>, LedgerError> {
        let snap = self.snapshot();
        let reader = &*snap;
        reader.tx(id)?.map(|record| load_tx(reader, record)).transpose()
    }

    /// Stored transactions that no block links, in insertion order.
    pub fn get_unconfirmed_txs(&self) -> Result<Vec<StoredTransaction>, LedgerError> {
        let snap = self.snapshot();
        let reader = &*snap;
        let mut txs = Vec::new();
        for id in reader.tx_ids()? {
            if !reader.tx_block_ids(id)?.is_empty() {
                continue;
            }
            let record: TxRecord = reader.referenced(CF_TXS, id)?;
            txs.push(load_tx(reader, record)?);
        }
        Ok(txs)
    }

    /// The stored input spending output `index` of `tx_hash`.
    pub fn get_txin_for_txout(
        &self,
        tx_hash: &Hash256,
        index: u32,
    ) -> Result<Option<StoredTxIn>, LedgerError> {
        Ok(self
            .snapshot()
            .spenders_of(tx_hash, index)?
            .into_iter()
            .next()
            .map(load_txin))
    }

    /// The stored output funded by `input`.
    pub fn get_txout_for_txin(&self, input: &TxInput) -> Result<Option<StoredTxOut>, LedgerError> {
        let snap = self.snapshot();
        let reader = &*snap;
        let prev = &input.previous_output;
        let Some(tx_id) = reader.tx_id_by_hash(&prev.txid)? else {
            return Ok(None);
        };
        reader
            .txout_at(tx_id, prev.index)?
            .map(|record| load_txout(reader, record))
            .transpose()
    }

    /// Outputs locked by exactly `script`, in insertion order.
    pub fn get_txouts_for_pk_script(&self, script: &[u8]) -> Result<Vec<StoredTxOut>, LedgerError> {
        let snap = self.snapshot();
        let reader = &*snap;
        reader
            .txouts_by_script(script)?
            .into_iter()
            .map(|record| load_txout(reader, record))
            .collect()
    }

    /// Outputs paying `hash160`.
    ///
    /// Without `unconfirmed`, only outputs whose owning block is on MAIN are
    /// returned. An output with no resolvable block counts as unconfirmed.
    pub fn get_txouts_for_hash160(
        &self,
        hash160: &Hash160,
        unconfirmed: bool,
    ) -> Result<Vec<StoredTxOut>, LedgerError> {
        let snap = self.snapshot();
        let reader = &*snap;
        let Some(address_id) = reader.address_id(hash160)? else {
            return Ok(Vec::new());
        };

        let mut outs = Vec::new();
        for txout_id in reader.address_txout_ids(address_id)? {
            let record: TxOutRecord = reader.referenced(CF_TXOUTS, txout_id)?;
            if !unconfirmed {
                let confirmed = owning_block(reader, record.tx_id)?
                    .is_some_and(|block| block.chain == Chain::Main);
                if !confirmed {
                    continue;
                }
            }
            outs.push(load_txout(reader, record)?);
        }
        Ok(outs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{BatchOp, RecordBackend};
    use crate::config::StoreConfig;
    use chainvault_core::merkle::merkle_root;
    use chainvault_core::script::p2pkh_script;
    use chainvault_core::types::{BlockHeader, OutPoint};

    fn pkh(seed: u8) -> Hash160 {
        Hash160([seed; 20])
    }

    fn make_coinbase_unique(tag: u32, to: Hash160, value: u64) -> Transaction {
        Transaction {
            version: 1,
            inputs: vec![TxInput {
                previous_output: OutPoint::null(),
                script_sig: tag.to_le_bytes().to_vec(),
                sequence: u32::MAX,
            }],
            outputs: vec![TxOutput {
                value,
                script_pubkey: p2pkh_script(&to),
            }],
            lock_time: 0,
        }
    }

    fn make_spend(prev: &Transaction, index: u32, to: Hash160) -> Transaction {
        Transaction {
            version: 2,
            inputs: vec![TxInput {
                previous_output: OutPoint { txid: prev.txid(), index },
                script_sig: vec![0x30; 8],
                sequence: 0xffff_fffe,
            }],
            outputs: vec![TxOutput {
                value: 1_000,
                script_pubkey: p2pkh_script(&to),
            }],
            lock_time: 7,
        }
    }

    fn make_block(prev_hash: Hash256, nonce: u32, txs: Vec<Transaction>) -> Block {
        let txids: Vec<Hash256> = txs.iter().map(|tx| tx.txid()).collect();
        Block {
            header: BlockHeader {
                version: 1,
                prev_hash,
                merkle_root: merkle_root(&txids),
                timestamp: 1_700_000_000 + nonce,
                bits: 0x1d00_ffff,
                nonce,
            },
            transactions: txs,
        }
    }

    fn store() -> ChainStore {
        ChainStore::in_memory(StoreConfig::default())
    }

    // ------------------------------------------------------------------
    // Round trips
    // ------------------------------------------------------------------

    #[test]
    fn block_round_trip_recomputes_hash() {
        let store = store();
        let cb = make_coinbase_unique(0, pkh(1), 50);
        let spend = make_spend(&cb, 0, pkh(2));
        let block = make_block(Hash256::ZERO, 0, vec![cb, spend]);
        store.persist_block(&block, Chain::Main, 0).unwrap();

        let stored = store.get_block_by_hash(&block.hash()).unwrap().unwrap();
        assert_eq!(stored.block.hash(), block.hash());
        assert_eq!(stored.block, block);
        assert_eq!(stored.size as usize, block.size());
    }

    #[test]
    fn transaction_round_trip_and_owner() {
        let store = store();
        let cb = make_coinbase_unique(0, pkh(1), 50);
        let block = make_block(Hash256::ZERO, 0, vec![cb.clone()]);
        store.persist_block(&block, Chain::Main, 0).unwrap();

        let stored = store.get_tx(&cb.txid()).unwrap().unwrap();
        assert_eq!(stored.tx, cb);
        assert_eq!(stored.hash, cb.txid());
        assert_eq!(stored.block_id, Some(1));
        assert_eq!(store.get_tx_by_id(stored.id).unwrap().unwrap(), stored);
    }

    #[test]
    fn loose_transaction_has_no_block() {
        let store = store();
        let cb = make_coinbase_unique(0, pkh(1), 50);
        store.store_transaction(&cb, false).unwrap();
        assert_eq!(store.get_tx(&cb.txid()).unwrap().unwrap().block_id, None);
        assert!(store.get_block_by_transaction_hash(&cb.txid()).unwrap().is_none());
    }

    #[test]
    fn unconfirmed_lists_only_unlinked_transactions() {
        let store = store();
        let mined = make_coinbase_unique(0, pkh(1), 50);
        let block = make_block(Hash256::ZERO, 0, vec![mined.clone()]);
        store.persist_block(&block, Chain::Main, 0).unwrap();
        assert!(store.get_unconfirmed_txs().unwrap().is_empty());

        let loose = make_spend(&mined, 0, pkh(2));
        store.store_transaction(&loose, false).unwrap();
        let pending = store.get_unconfirmed_txs().unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].tx, loose);
        assert_eq!(pending[0].block_id, None);

        // Mining it takes it off the list.
        let next = make_block(block.hash(), 1, vec![loose.clone()]);
        store.persist_block(&next, Chain::Main, 1).unwrap();
        assert!(store.get_unconfirmed_txs().unwrap().is_empty());
    }

    #[test]
    fn missing_lookups_are_none() {
        let store = store();
        assert!(store.get_tx(&Hash256([1; 32])).unwrap().is_none());
        assert!(store.get_tx_by_id(42).unwrap().is_none());
        assert!(store.get_block_by_id(42).unwrap().is_none());
        assert!(store.get_txin_for_txout(&Hash256([1; 32]), 0).unwrap().is_none());
        assert!(store.get_txouts_for_hash160(&pkh(1), true).unwrap().is_empty());
    }

    // ------------------------------------------------------------------
    // Integrity
    // ------------------------------------------------------------------

    #[test]
    fn tampered_block_header_is_detected() {
        let backend = std::sync::Arc::new(crate::backend::MemoryBackend::new());
        let store = ChainStore::new(backend.clone(), StoreConfig::default());
        let block = make_block(Hash256::ZERO, 0, vec![]);
        store.persist_block(&block, Chain::Main, 0).unwrap();

        let reader: &dyn RecordBackend = &*backend;
        let mut record = reader.block(1).unwrap().unwrap();
        record.nonce += 1;
        backend
            .write(vec![BatchOp::Put {
                cf: CF_BLOCKS,
                key: id_key(1).to_vec(),
                value: encode(&record).unwrap(),
            }])
            .unwrap();

        let err = store.get_block_by_hash(&block.hash()).unwrap_err();
        assert!(matches!(
            err,
            LedgerError::Integrity(IntegrityError::BlockHashMismatch { .. })
        ));
    }

    #[test]
    fn tampered_output_is_detected() {
        let backend = std::sync::Arc::new(crate::backend::MemoryBackend::new());
        let store = ChainStore::new(backend.clone(), StoreConfig::default());
        let cb = make_coinbase_unique(0, pkh(1), 50);
        store.store_transaction(&cb, false).unwrap();

        let reader: &dyn RecordBackend = &*backend;
        let mut out = reader.txout(1).unwrap().unwrap();
        out.value += 1;
        backend
            .write(vec![BatchOp::Put {
                cf: CF_TXOUTS,
                key: id_key(1).to_vec(),
                value: encode(&out).unwrap(),
            }])
            .unwrap();

        let err = store.get_tx(&cb.txid()).unwrap_err();
        assert!(matches!(
            err,
            LedgerError::Integrity(IntegrityError::TxHashMismatch { .. })
        ));
    }

    // ------------------------------------------------------------------
    // Spend lookups
    // ------------------------------------------------------------------

    #[test]
    fn input_and_output_resolve_each_other() {
        let store = store();
        let cb = make_coinbase_unique(0, pkh(1), 50);
        let spend = make_spend(&cb, 0, pkh(2));
        let block = make_block(Hash256::ZERO, 0, vec![cb.clone(), spend.clone()]);
        store.persist_block(&block, Chain::Main, 0).unwrap();

        let txin = store.get_txin_for_txout(&cb.txid(), 0).unwrap().unwrap();
        assert_eq!(txin.input, spend.inputs[0]);
        assert_eq!(txin.tx_idx, 0);

        let txout = store.get_txout_for_txin(&txin.input).unwrap().unwrap();
        assert_eq!(txout.output, cb.outputs[0]);
        assert_eq!(txout.addresses, vec![pkh(1)]);
        assert_eq!(txout.script_type, ScriptType::Hash160);

        assert!(store.get_txin_for_txout(&spend.txid(), 0).unwrap().is_none());
    }

    #[test]
    fn outputs_by_script_in_insertion_order() {
        let store = store();
        let a = make_coinbase_unique(0, pkh(1), 10);
        let b = make_coinbase_unique(1, pkh(1), 20);
        let c = make_coinbase_unique(2, pkh(2), 30);
        for tx in [&a, &b, &c] {
            store.store_transaction(tx, false).unwrap();
        }

        let outs = store.get_txouts_for_pk_script(&p2pkh_script(&pkh(1))).unwrap();
        let values: Vec<u64> = outs.iter().map(|o| o.output.value).collect();
        assert_eq!(values, vec![10, 20]);
        assert!(store.get_txouts_for_pk_script(&[0x51]).unwrap().is_empty());
    }

    // ------------------------------------------------------------------
    // Address lookups
    // ------------------------------------------------------------------

    #[test]
    fn unconfirmed_outputs_need_opt_in() {
        let store = store();
        let genesis = make_block(Hash256::ZERO, 0, vec![]);
        store.persist_block(&genesis, Chain::Main, 0).unwrap();

        let loose = make_coinbase_unique(1, pkh(5), 10);
        store.store_transaction(&loose, false).unwrap();
        let side = make_block(genesis.hash(), 1, vec![make_coinbase_unique(2, pkh(5), 20)]);
        store.persist_block(&side, Chain::Side, 1).unwrap();
        let main = make_block(genesis.hash(), 2, vec![make_coinbase_unique(3, pkh(5), 30)]);
        store.persist_block(&main, Chain::Main, 1).unwrap();

        let confirmed: Vec<u64> = store
            .get_txouts_for_hash160(&pkh(5), false)
            .unwrap()
            .iter()
            .map(|o| o.output.value)
            .collect();
        assert_eq!(confirmed, vec![30]);

        let all = store.get_txouts_for_hash160(&pkh(5), true).unwrap();
        assert_eq!(all.len(), 3);
    }

    #[test]
    fn transaction_in_side_and_main_resolves_to_main() {
        let store = store();
        let genesis = make_block(Hash256::ZERO, 0, vec![]);
        store.persist_block(&genesis, Chain::Main, 0).unwrap();

        let shared = make_coinbase_unique(9, pkh(9), 9);
        let side = make_block(genesis.hash(), 1, vec![shared.clone()]);
        let main = make_block(genesis.hash(), 2, vec![shared.clone()]);
        store.persist_block(&side, Chain::Side, 1).unwrap();
        store.persist_block(&main, Chain::Main, 1).unwrap();

        let owner = store.get_block_by_transaction_hash(&shared.txid()).unwrap().unwrap();
        assert_eq!(owner.hash, main.hash());
        assert_eq!(store.get_txouts_for_hash160(&pkh(9), false).unwrap().len(), 1);
    }
}
