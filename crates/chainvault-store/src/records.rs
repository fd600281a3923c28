//! Typed records and their key layouts.
//!
//! Every entity is stored under a numeric id in its own column family, with
//! secondary indexes in separate column families. Index keys are fixed-width
//! big-endian concatenations so that lexicographic order equals numeric
//! order and prefix scans answer the range queries.
//!
//! | Table                | Key                          | Value        |
//! |----------------------|------------------------------|--------------|
//! | `blocks`             | id                           | BlockRecord  |
//! | `block_by_hash`      | hash                         | id           |
//! | `block_by_depth`     | chain ‖ depth ‖ id           | -            |
//! | `block_by_prev`      | prev_hash ‖ chain ‖ id       | -            |
//! | `block_txs`          | block id ‖ position          | tx id        |
//! | `tx_blocks`          | tx id ‖ block id             | position     |
//! | `txs`                | id                           | TxRecord     |
//! | `tx_by_hash`         | hash                         | id           |
//! | `txins`              | id                           | TxInRecord   |
//! | `txins_by_tx`        | tx id ‖ position             | txin id      |
//! | `txins_by_prevout`   | prev hash ‖ prev index ‖ id  | -            |
//! | `spent_outpoints`    | prev hash ‖ prev index       | -            |
//! | `txouts`             | id                           | TxOutRecord  |
//! | `txouts_by_tx`       | tx id ‖ position             | txout id     |
//! | `txouts_by_script`   | sha256(script) ‖ id          | -            |
//! | `addresses`          | id                           | AddressRecord|
//! | `address_by_hash160` | hash160                      | id           |
//! | `address_txouts`     | address id ‖ txout id        | -            |
//! | `txout_addresses`    | txout id ‖ address id        | -            |
//! | `meta`               | sequence name                | last id      |

use sha2::{Digest, Sha256};

use chainvault_core::error::{IntegrityError, LedgerError};
use chainvault_core::script::ScriptType;
use chainvault_core::types::{BlockHeader, Chain, Hash160, Hash256, OutPoint};

use crate::backend::RecordBackend;

// --- Column family names ---

pub const CF_BLOCKS: &str = "blocks";
pub const CF_BLOCK_BY_HASH: &str = "block_by_hash";
pub const CF_BLOCK_BY_DEPTH: &str = "block_by_depth";
pub const CF_BLOCK_BY_PREV: &str = "block_by_prev";
pub const CF_BLOCK_TXS: &str = "block_txs";
pub const CF_TX_BLOCKS: &str = "tx_blocks";
pub const CF_TXS: &str = "txs";
pub const CF_TX_BY_HASH: &str = "tx_by_hash";
pub const CF_TXINS: &str = "txins";
pub const CF_TXINS_BY_TX: &str = "txins_by_tx";
pub const CF_TXINS_BY_PREVOUT: &str = "txins_by_prevout";
/// Outpoints some stored input has spent. Outlives the spending input, so
/// pruning the spender does not make its funding output look unspent.
pub const CF_SPENT_OUTPOINTS: &str = "spent_outpoints";
pub const CF_TXOUTS: &str = "txouts";
pub const CF_TXOUTS_BY_TX: &str = "txouts_by_tx";
pub const CF_TXOUTS_BY_SCRIPT: &str = "txouts_by_script";
pub const CF_ADDRESSES: &str = "addresses";
pub const CF_ADDRESS_BY_HASH160: &str = "address_by_hash160";
pub const CF_ADDRESS_TXOUTS: &str = "address_txouts";
pub const CF_TXOUT_ADDRESSES: &str = "txout_addresses";
pub const CF_META: &str = "meta";

/// All column family names.
pub const ALL_CFS: &[&str] = &[
    CF_BLOCKS,
    CF_BLOCK_BY_HASH,
    CF_BLOCK_BY_DEPTH,
    CF_BLOCK_BY_PREV,
    CF_BLOCK_TXS,
    CF_TX_BLOCKS,
    CF_TXS,
    CF_TX_BY_HASH,
    CF_TXINS,
    CF_TXINS_BY_TX,
    CF_TXINS_BY_PREVOUT,
    CF_SPENT_OUTPOINTS,
    CF_TXOUTS,
    CF_TXOUTS_BY_TX,
    CF_TXOUTS_BY_SCRIPT,
    CF_ADDRESSES,
    CF_ADDRESS_BY_HASH160,
    CF_ADDRESS_TXOUTS,
    CF_TXOUT_ADDRESSES,
    CF_META,
];

// --- Records ---

/// Stored block header plus placement.
#[derive(Clone, Debug, PartialEq, Eq, bincode::Encode, bincode::Decode)]
pub struct BlockRecord {
    pub id: u64,
    pub hash: Hash256,
    /// Position in its chain; `-1` while the block has no chain.
    pub depth: i64,
    pub chain: Chain,
    pub version: u32,
    pub prev_hash: Hash256,
    pub merkle_root: Hash256,
    pub timestamp: u32,
    pub bits: u32,
    pub nonce: u32,
    /// Serialized size of the whole block in bytes.
    pub size: u32,
}

impl BlockRecord {
    /// Rebuild the header from the stored fields.
    pub fn header(&self) -> BlockHeader {
        BlockHeader {
            version: self.version,
            prev_hash: self.prev_hash,
            merkle_root: self.merkle_root,
            timestamp: self.timestamp,
            bits: self.bits,
            nonce: self.nonce,
        }
    }

    /// Copy header fields in, leaving id and placement untouched.
    pub fn set_header(&mut self, header: &BlockHeader) {
        self.version = header.version;
        self.prev_hash = header.prev_hash;
        self.merkle_root = header.merkle_root;
        self.timestamp = header.timestamp;
        self.bits = header.bits;
        self.nonce = header.nonce;
    }
}

#[derive(Clone, Debug, PartialEq, Eq, bincode::Encode, bincode::Decode)]
pub struct TxRecord {
    pub id: u64,
    pub hash: Hash256,
    pub version: u32,
    pub lock_time: u32,
    pub coinbase: bool,
    pub size: u32,
}

#[derive(Clone, Debug, PartialEq, Eq, bincode::Encode, bincode::Decode)]
pub struct TxInRecord {
    pub id: u64,
    pub tx_id: u64,
    pub tx_idx: u32,
    pub script_sig: Vec<u8>,
    pub prev_out: OutPoint,
    pub sequence: u32,
}

#[derive(Clone, Debug, PartialEq, Eq, bincode::Encode, bincode::Decode)]
pub struct TxOutRecord {
    pub id: u64,
    pub tx_id: u64,
    pub tx_idx: u32,
    pub script_pubkey: Vec<u8>,
    pub value: u64,
    pub script_type: ScriptType,
}

#[derive(Clone, Debug, PartialEq, Eq, bincode::Encode, bincode::Decode)]
pub struct AddressRecord {
    pub id: u64,
    pub hash160: Hash160,
}

// --- Encoding ---

pub(crate) fn encode<T: bincode::Encode>(value: &T) -> Result<Vec<u8>, LedgerError> {
    bincode::encode_to_vec(value, bincode::config::standard())
        .map_err(|e| LedgerError::Storage(e.to_string()))
}

pub(crate) fn decode<T: bincode::Decode<()>>(
    table: &'static str,
    bytes: &[u8],
) -> Result<T, LedgerError> {
    let (value, _) = bincode::decode_from_slice(bytes, bincode::config::standard()).map_err(
        |e| IntegrityError::CorruptRecord {
            table,
            reason: e.to_string(),
        },
    )?;
    Ok(value)
}

fn corrupt(table: &'static str, reason: &str) -> LedgerError {
    IntegrityError::CorruptRecord {
        table,
        reason: reason.to_string(),
    }
    .into()
}

/// Read a big-endian u64 at `offset`.
pub(crate) fn read_u64(table: &'static str, bytes: &[u8], offset: usize) -> Result<u64, LedgerError> {
    bytes
        .get(offset..offset + 8)
        .and_then(|slice| slice.try_into().ok())
        .map(u64::from_be_bytes)
        .ok_or_else(|| corrupt(table, "truncated u64"))
}

/// Read a big-endian u32 at `offset`.
pub(crate) fn read_u32(table: &'static str, bytes: &[u8], offset: usize) -> Result<u32, LedgerError> {
    bytes
        .get(offset..offset + 4)
        .and_then(|slice| slice.try_into().ok())
        .map(u32::from_be_bytes)
        .ok_or_else(|| corrupt(table, "truncated u32"))
}

// --- Keys ---

pub(crate) fn id_key(id: u64) -> [u8; 8] {
    id.to_be_bytes()
}

/// Order-preserving encoding of a signed depth.
pub(crate) fn depth_key(depth: i64) -> [u8; 8] {
    ((depth as u64) ^ (1 << 63)).to_be_bytes()
}

pub(crate) fn pair_key(a: u64, b: u64) -> [u8; 16] {
    let mut key = [0u8; 16];
    key[..8].copy_from_slice(&a.to_be_bytes());
    key[8..].copy_from_slice(&b.to_be_bytes());
    key
}

pub(crate) fn position_key(owner: u64, idx: u32) -> [u8; 12] {
    let mut key = [0u8; 12];
    key[..8].copy_from_slice(&owner.to_be_bytes());
    key[8..].copy_from_slice(&idx.to_be_bytes());
    key
}

/// `chain ‖ depth ‖ id`
pub(crate) fn block_depth_key(chain: Chain, depth: i64, id: u64) -> [u8; 17] {
    let mut key = [0u8; 17];
    key[0] = chain.tag();
    key[1..9].copy_from_slice(&depth_key(depth));
    key[9..].copy_from_slice(&id.to_be_bytes());
    key
}

/// `prev_hash ‖ chain ‖ id`
pub(crate) fn block_prev_key(prev_hash: &Hash256, chain: Chain, id: u64) -> [u8; 41] {
    let mut key = [0u8; 41];
    key[..32].copy_from_slice(prev_hash.as_bytes());
    key[32] = chain.tag();
    key[33..].copy_from_slice(&id.to_be_bytes());
    key
}

fn block_prev_prefix(prev_hash: &Hash256, chain: Chain) -> [u8; 33] {
    let mut key = [0u8; 33];
    key[..32].copy_from_slice(prev_hash.as_bytes());
    key[32] = chain.tag();
    key
}

/// `prev hash ‖ prev index ‖ txin id`
pub(crate) fn prevout_key(prev_out: &OutPoint, txin_id: u64) -> [u8; 44] {
    let mut key = [0u8; 44];
    key[..32].copy_from_slice(prev_out.txid.as_bytes());
    key[32..36].copy_from_slice(&prev_out.index.to_be_bytes());
    key[36..].copy_from_slice(&txin_id.to_be_bytes());
    key
}

/// `prev hash ‖ prev index`
pub(crate) fn prevout_prefix(txid: &Hash256, index: u32) -> [u8; 36] {
    let mut key = [0u8; 36];
    key[..32].copy_from_slice(txid.as_bytes());
    key[32..].copy_from_slice(&index.to_be_bytes());
    key
}

pub(crate) fn script_digest(script: &[u8]) -> [u8; 32] {
    Sha256::digest(script).into()
}

/// `sha256(script) ‖ txout id`
pub(crate) fn script_key(script: &[u8], txout_id: u64) -> [u8; 40] {
    let mut key = [0u8; 40];
    key[..32].copy_from_slice(&script_digest(script));
    key[32..].copy_from_slice(&txout_id.to_be_bytes());
    key
}

// --- Reads ---

/// Raw read access shared by the backend and the write unit.
pub trait RecordRead {
    fn get_raw(&self, cf: &'static str, key: &[u8]) -> Result<Option<Vec<u8>>, LedgerError>;

    fn scan_raw(
        &self,
        cf: &'static str,
        prefix: &[u8],
    ) -> Result<Vec<(Vec<u8>, Vec<u8>)>, LedgerError>;

    fn last_raw(
        &self,
        cf: &'static str,
        prefix: &[u8],
    ) -> Result<Option<(Vec<u8>, Vec<u8>)>, LedgerError> {
        Ok(self.scan_raw(cf, prefix)?.pop())
    }
}

impl RecordRead for dyn RecordBackend + '_ {
    fn get_raw(&self, cf: &'static str, key: &[u8]) -> Result<Option<Vec<u8>>, LedgerError> {
        self.get(cf, key)
    }

    fn scan_raw(
        &self,
        cf: &'static str,
        prefix: &[u8],
    ) -> Result<Vec<(Vec<u8>, Vec<u8>)>, LedgerError> {
        self.scan_prefix(cf, prefix)
    }

    fn last_raw(
        &self,
        cf: &'static str,
        prefix: &[u8],
    ) -> Result<Option<(Vec<u8>, Vec<u8>)>, LedgerError> {
        self.last_with_prefix(cf, prefix)
    }
}

/// Typed lookups over any [`RecordRead`].
///
/// Missing records are `Ok(None)` or an empty `Vec`. An index entry pointing
/// at a missing record is an [`IntegrityError::DanglingReference`].
pub trait Records: RecordRead {
    fn record<T: bincode::Decode<()>>(
        &self,
        cf: &'static str,
        id: u64,
    ) -> Result<Option<T>, LedgerError> {
        self.get_raw(cf, &id_key(id))?
            .map(|bytes| decode(cf, &bytes))
            .transpose()
    }

    /// Like [`record`](Self::record) but an absent record is a dangling reference.
    fn referenced<T: bincode::Decode<()>>(
        &self,
        cf: &'static str,
        id: u64,
    ) -> Result<T, LedgerError> {
        self.record(cf, id)?
            .ok_or_else(|| IntegrityError::DanglingReference { table: cf, id }.into())
    }

    fn id_by(&self, cf: &'static str, key: &[u8]) -> Result<Option<u64>, LedgerError> {
        self.get_raw(cf, key)?
            .map(|bytes| read_u64(cf, &bytes, 0))
            .transpose()
    }

    /// Ids stored as values under a prefix, in key order.
    fn value_ids(&self, cf: &'static str, prefix: &[u8]) -> Result<Vec<u64>, LedgerError> {
        self.scan_raw(cf, prefix)?
            .iter()
            .map(|(_, value)| read_u64(cf, value, 0))
            .collect()
    }

    /// Ids stored as the key suffix at `offset`, in key order.
    fn key_ids(
        &self,
        cf: &'static str,
        prefix: &[u8],
        offset: usize,
    ) -> Result<Vec<u64>, LedgerError> {
        self.scan_raw(cf, prefix)?
            .iter()
            .map(|(key, _)| read_u64(cf, key, offset))
            .collect()
    }

    // --- Blocks ---

    fn block(&self, id: u64) -> Result<Option<BlockRecord>, LedgerError> {
        self.record(CF_BLOCKS, id)
    }

    fn block_id_by_hash(&self, hash: &Hash256) -> Result<Option<u64>, LedgerError> {
        self.id_by(CF_BLOCK_BY_HASH, hash.as_bytes())
    }

    fn block_by_hash(&self, hash: &Hash256) -> Result<Option<BlockRecord>, LedgerError> {
        match self.block_id_by_hash(hash)? {
            Some(id) => self.referenced(CF_BLOCKS, id).map(Some),
            None => Ok(None),
        }
    }

    /// The MAIN block at `depth`.
    fn main_block_at(&self, depth: i64) -> Result<Option<BlockRecord>, LedgerError> {
        let mut prefix = [0u8; 9];
        prefix[0] = Chain::Main.tag();
        prefix[1..].copy_from_slice(&depth_key(depth));
        match self.key_ids(CF_BLOCK_BY_DEPTH, &prefix, 9)?.first() {
            Some(&id) => self.referenced(CF_BLOCKS, id).map(Some),
            None => Ok(None),
        }
    }

    /// The highest-depth MAIN block.
    fn head_record(&self) -> Result<Option<BlockRecord>, LedgerError> {
        match self.last_raw(CF_BLOCK_BY_DEPTH, &[Chain::Main.tag()])? {
            Some((key, _)) => {
                let id = read_u64(CF_BLOCK_BY_DEPTH, &key, 9)?;
                self.referenced(CF_BLOCKS, id).map(Some)
            }
            None => Ok(None),
        }
    }

    /// Blocks in `chain` whose parent is `prev_hash`, in insertion order.
    fn children_of(
        &self,
        prev_hash: &Hash256,
        chain: Chain,
    ) -> Result<Vec<BlockRecord>, LedgerError> {
        self.key_ids(CF_BLOCK_BY_PREV, &block_prev_prefix(prev_hash, chain), 33)?
            .into_iter()
            .map(|id| self.referenced(CF_BLOCKS, id))
            .collect()
    }

    fn block_tx_ids(&self, block_id: u64) -> Result<Vec<u64>, LedgerError> {
        self.value_ids(CF_BLOCK_TXS, &id_key(block_id))
    }

    /// Ids of every block linking the transaction.
    fn tx_block_ids(&self, tx_id: u64) -> Result<Vec<u64>, LedgerError> {
        self.key_ids(CF_TX_BLOCKS, &id_key(tx_id), 8)
    }

    // --- Transactions ---

    fn tx(&self, id: u64) -> Result<Option<TxRecord>, LedgerError> {
        self.record(CF_TXS, id)
    }

    fn tx_id_by_hash(&self, hash: &Hash256) -> Result<Option<u64>, LedgerError> {
        self.id_by(CF_TX_BY_HASH, hash.as_bytes())
    }

    /// Ids of every stored transaction, ascending.
    fn tx_ids(&self) -> Result<Vec<u64>, LedgerError> {
        self.key_ids(CF_TXS, &[], 0)
    }

    fn txin(&self, id: u64) -> Result<Option<TxInRecord>, LedgerError> {
        self.record(CF_TXINS, id)
    }

    /// Inputs of a transaction in position order.
    fn txins_of(&self, tx_id: u64) -> Result<Vec<TxInRecord>, LedgerError> {
        self.value_ids(CF_TXINS_BY_TX, &id_key(tx_id))?
            .into_iter()
            .map(|id| self.referenced(CF_TXINS, id))
            .collect()
    }

    fn txout(&self, id: u64) -> Result<Option<TxOutRecord>, LedgerError> {
        self.record(CF_TXOUTS, id)
    }

    /// Outputs of a transaction in position order.
    fn txouts_of(&self, tx_id: u64) -> Result<Vec<TxOutRecord>, LedgerError> {
        self.value_ids(CF_TXOUTS_BY_TX, &id_key(tx_id))?
            .into_iter()
            .map(|id| self.referenced(CF_TXOUTS, id))
            .collect()
    }

    fn txout_at(&self, tx_id: u64, idx: u32) -> Result<Option<TxOutRecord>, LedgerError> {
        match self.id_by(CF_TXOUTS_BY_TX, &position_key(tx_id, idx))? {
            Some(id) => self.referenced(CF_TXOUTS, id).map(Some),
            None => Ok(None),
        }
    }

    /// Stored inputs spending `txid:index`, in insertion order.
    fn spenders_of(&self, txid: &Hash256, index: u32) -> Result<Vec<TxInRecord>, LedgerError> {
        self.key_ids(CF_TXINS_BY_PREVOUT, &prevout_prefix(txid, index), 36)?
            .into_iter()
            .map(|id| self.referenced(CF_TXINS, id))
            .collect()
    }

    /// Output positions of `txid` that a stored input spends or spent.
    fn spent_positions(&self, txid: &Hash256) -> Result<Vec<u32>, LedgerError> {
        self.scan_raw(CF_SPENT_OUTPOINTS, txid.as_bytes())?
            .iter()
            .map(|(key, _)| read_u32(CF_SPENT_OUTPOINTS, key, 32))
            .collect()
    }

    /// Outputs with exactly this locking script, in insertion order.
    fn txouts_by_script(&self, script: &[u8]) -> Result<Vec<TxOutRecord>, LedgerError> {
        let mut out = Vec::new();
        for id in self.key_ids(CF_TXOUTS_BY_SCRIPT, &script_digest(script), 32)? {
            let record: TxOutRecord = self.referenced(CF_TXOUTS, id)?;
            if record.script_pubkey == script {
                out.push(record);
            }
        }
        Ok(out)
    }

    // --- Addresses ---

    fn address_id(&self, hash160: &Hash160) -> Result<Option<u64>, LedgerError> {
        self.id_by(CF_ADDRESS_BY_HASH160, hash160.as_bytes())
    }

    fn address_txout_ids(&self, address_id: u64) -> Result<Vec<u64>, LedgerError> {
        self.key_ids(CF_ADDRESS_TXOUTS, &id_key(address_id), 8)
    }

    fn txout_address_ids(&self, txout_id: u64) -> Result<Vec<u64>, LedgerError> {
        self.key_ids(CF_TXOUT_ADDRESSES, &id_key(txout_id), 8)
    }

    /// Addresses linked to an output.
    fn addresses_of(&self, txout_id: u64) -> Result<Vec<Hash160>, LedgerError> {
        self.txout_address_ids(txout_id)?
            .into_iter()
            .map(|id| {
                self.referenced::<AddressRecord>(CF_ADDRESSES, id)
                    .map(|address| address.hash160)
            })
            .collect()
    }
}

impl<T: RecordRead + ?Sized> Records for T {}
