//! Shared test helpers for integration tests.

use std::sync::Once;

use chainvault_core::merkle;
use chainvault_core::script::p2pkh_script;
use chainvault_core::types::*;
use chainvault_store::{ChainStore, StoreConfig};

/// Simple address hash from a seed byte.
pub fn pkh(seed: u8) -> Hash160 {
    Hash160([seed; 20])
}

/// Create a coinbase transaction paying `value` to `to`.
///
/// `height` goes into the unlocking script so each coinbase has a distinct
/// txid.
pub fn make_coinbase(value: u64, to: Hash160, height: u64) -> Transaction {
    Transaction {
        version: 1,
        inputs: vec![TxInput {
            previous_output: OutPoint::null(),
            script_sig: height.to_le_bytes().to_vec(),
            sequence: u32::MAX,
        }],
        outputs: vec![TxOutput {
            value,
            script_pubkey: p2pkh_script(&to),
        }],
        lock_time: 0,
    }
}

/// Create a simple spending transaction (unsigned).
pub fn make_tx(inputs: Vec<OutPoint>, outputs: Vec<(u64, Hash160)>) -> Transaction {
    Transaction {
        version: 1,
        inputs: inputs
            .into_iter()
            .map(|op| TxInput {
                previous_output: op,
                script_sig: vec![0; 72],
                sequence: u32::MAX,
            })
            .collect(),
        outputs: outputs
            .into_iter()
            .map(|(value, to)| TxOutput {
                value,
                script_pubkey: p2pkh_script(&to),
            })
            .collect(),
        lock_time: 0,
    }
}

/// Create a block with correct merkle root.
pub fn make_block(prev_hash: Hash256, nonce: u32, txs: Vec<Transaction>) -> Block {
    let txids: Vec<Hash256> = txs.iter().map(|tx| tx.txid()).collect();
    Block {
        header: BlockHeader {
            version: 1,
            prev_hash,
            merkle_root: merkle::merkle_root(&txids),
            timestamp: 1_700_000_000 + nonce,
            bits: 0x1d00_ffff,
            nonce,
        },
        transactions: txs,
    }
}

/// A linear chain of `len` blocks from genesis, each with one coinbase.
pub fn make_chain(len: usize) -> Vec<Block> {
    let mut blocks = Vec::with_capacity(len);
    let mut prev = Hash256::ZERO;
    for height in 0..len {
        let coinbase = make_coinbase(50, pkh((height & 0xff) as u8), height as u64);
        let block = make_block(prev, height as u32, vec![coinbase]);
        prev = block.hash();
        blocks.push(block);
    }
    blocks
}

/// In-memory store with default configuration.
pub fn memory_store() -> ChainStore {
    ChainStore::in_memory(StoreConfig::default())
}

/// RocksDB store backed by a temp directory.
pub fn rocks_store(config: StoreConfig) -> (ChainStore, tempfile::TempDir) {
    let dir = tempfile::tempdir().expect("temp dir");
    let config = StoreConfig {
        data_dir: dir.path().to_path_buf(),
        ..config
    };
    let store = ChainStore::open(config).expect("open store");
    (store, dir)
}

/// Route `tracing` output to the test harness. Honors `RUST_LOG`.
pub fn init_tracing() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}
