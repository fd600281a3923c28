//! Chain store.
//!
//! [`ChainStore`] persists blocks with the chain tag and depth it is given,
//! keeps a process-wide cache of the MAIN head, and re-attaches ORPHAN
//! blocks once their parent commits. Re-attachment runs from an explicit
//! queue. After `max_inline_reattach` blocks the remaining queue moves to a
//! Tokio blocking task when a runtime is available.
//!
//! Writers are serialized by one mutex; every write is a single
//! [`WriteUnit`] commit. Each public read runs against one backend snapshot,
//! so it only observes pre- or post-commit state.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tracing::{debug, error, info};

use chainvault_core::error::{IntegrityError, LedgerError};
use chainvault_core::traits::TransactionValidator;
use chainvault_core::types::{Block, Chain, Hash256, Transaction};

use crate::backend::{MemoryBackend, RecordBackend};
use crate::config::StoreConfig;
use crate::indexer::Indexer;
use crate::records::{BlockRecord, RecordRead, Records, CF_BLOCKS};
use crate::rocks::RocksBackend;
use crate::selector::{ChainSelector, LongestChainSelector, Placement};
use crate::unit::WriteUnit;
use crate::view::{self, StoredBlock};

/// Cached MAIN head. `head == None` means "not loaded".
#[derive(Default)]
struct HeadCache {
    /// Bumped on every invalidation so a slow refill cannot overwrite a
    /// newer invalidation.
    epoch: u64,
    head: Option<Option<BlockRecord>>,
}

struct Inner {
    backend: Arc<dyn RecordBackend>,
    config: StoreConfig,
    selector: Arc<dyn ChainSelector>,
    validator: Option<Arc<dyn TransactionValidator>>,
    writer: Mutex<()>,
    head: RwLock<HeadCache>,
    deferred: AtomicUsize,
}

/// Block and transaction store with fork handling.
///
/// Cheap to clone; clones share the backend, head cache and writer lock.
#[derive(Clone)]
pub struct ChainStore {
    inner: Arc<Inner>,
}

/// Builder for [`ChainStore`].
pub struct ChainStoreBuilder {
    backend: Arc<dyn RecordBackend>,
    config: StoreConfig,
    selector: Arc<dyn ChainSelector>,
    validator: Option<Arc<dyn TransactionValidator>>,
}

impl ChainStoreBuilder {
    pub fn config(mut self, config: StoreConfig) -> Self {
        self.config = config;
        self
    }

    pub fn selector(mut self, selector: Arc<dyn ChainSelector>) -> Self {
        self.selector = selector;
        self
    }

    pub fn validator(mut self, validator: Arc<dyn TransactionValidator>) -> Self {
        self.validator = Some(validator);
        self
    }

    pub fn build(self) -> ChainStore {
        ChainStore {
            inner: Arc::new(Inner {
                backend: self.backend,
                config: self.config,
                selector: self.selector,
                validator: self.validator,
                writer: Mutex::new(()),
                head: RwLock::new(HeadCache::default()),
                deferred: AtomicUsize::new(0),
            }),
        }
    }
}

impl ChainStore {
    pub fn builder(backend: Arc<dyn RecordBackend>) -> ChainStoreBuilder {
        ChainStoreBuilder {
            backend,
            config: StoreConfig::default(),
            selector: Arc::new(LongestChainSelector),
            validator: None,
        }
    }

    /// Store over `backend` with the default selector and no validator.
    pub fn new(backend: Arc<dyn RecordBackend>, config: StoreConfig) -> Self {
        Self::builder(backend).config(config).build()
    }

    /// Non-persistent store for tests and tooling.
    pub fn in_memory(config: StoreConfig) -> Self {
        Self::new(Arc::new(MemoryBackend::new()), config)
    }

    /// Open or create a RocksDB store at `config.db_path()`.
    pub fn open(config: StoreConfig) -> Result<Self, LedgerError> {
        let backend = RocksBackend::open(config.db_path())?;
        info!(path = %config.db_path().display(), mode = ?config.mode, "opened chain store");
        Ok(Self::new(Arc::new(backend), config))
    }

    pub fn config(&self) -> &StoreConfig {
        &self.inner.config
    }

    pub(crate) fn reader(&self) -> &dyn RecordBackend {
        self.inner.backend.as_ref()
    }

    /// Point-in-time view for one query. Must not outlive the query: the
    /// in-memory backend holds off writers while it exists.
    pub(crate) fn snapshot(&self) -> Box<dyn RecordRead + '_> {
        self.inner.backend.snapshot()
    }

    fn indexer(&self) -> Indexer<'_> {
        Indexer {
            mode: self.inner.config.mode,
            validator: self.inner.validator.as_deref(),
        }
    }

    // --- Writes ---

    /// Persist `block` on `chain` at `depth`, then re-attach any ORPHAN
    /// children. Returns the block's final depth and chain.
    ///
    /// A block already on record has its header and placement refreshed;
    /// its transactions are not re-linked.
    pub fn persist_block(
        &self,
        block: &Block,
        chain: Chain,
        depth: i64,
    ) -> Result<(i64, Chain), LedgerError> {
        self.commit_block(block, |_| Ok(Placement::new(chain, depth)))
    }

    /// Place `block` with the configured [`ChainSelector`] and persist it.
    ///
    /// A block already on MAIN or SIDE keeps its placement; storing it again
    /// only re-runs orphan re-attachment below it.
    pub fn store_block(&self, block: &Block) -> Result<(i64, Chain), LedgerError> {
        let hash = block.hash();
        let selector = Arc::clone(&self.inner.selector);
        self.commit_block(block, |unit| match unit.block_by_hash(&hash)? {
            Some(existing) if existing.chain != Chain::Orphan => {
                Ok(Placement::new(existing.chain, existing.depth))
            }
            _ => selector.place(unit, &block.header),
        })
    }

    fn commit_block<F>(&self, block: &Block, place: F) -> Result<(i64, Chain), LedgerError>
    where
        F: FnOnce(&WriteUnit<'_>) -> Result<Placement, LedgerError>,
    {
        let hash = block.hash();
        {
            let _writer = self.inner.writer.lock();
            let mut unit = WriteUnit::new(self.reader());
            let placement = place(&unit)?;
            let touched_main = self.write_block(&mut unit, block, &placement)?;
            unit.commit()?;
            if touched_main {
                self.invalidate_head();
            }
            info!(
                block = %hash,
                depth = placement.depth,
                chain = %placement.chain,
                txs = block.transactions.len(),
                "stored block"
            );
        }

        // The block is durable at this point; a failed re-attachment leaves
        // the remaining orphans in place for the next store of a parent.
        if let Err(e) = self.reattach_orphans(hash) {
            error!(block = %hash, error = %e, "orphan re-attachment failed");
        }

        let record = self
            .snapshot()
            .block_by_hash(&hash)?
            .ok_or_else(|| IntegrityError::CorruptRecord {
                table: CF_BLOCKS,
                reason: format!("block {hash} missing after commit"),
            })?;
        Ok((record.depth, record.chain))
    }

    /// Stage `block` with `placement`. Returns whether a MAIN block was
    /// touched.
    fn write_block(
        &self,
        unit: &mut WriteUnit<'_>,
        block: &Block,
        placement: &Placement,
    ) -> Result<bool, LedgerError> {
        let hash = block.hash();
        let mut touched_main = placement.chain == Chain::Main;
        touched_main |= apply_reassign(unit, &placement.reassign)?;

        if let Some(mut existing) = unit.block_by_hash(&hash)? {
            touched_main |= existing.chain == Chain::Main;
            existing.set_header(&block.header);
            unit.place_block(existing, placement.chain, placement.depth)?;
            return Ok(touched_main);
        }

        let id = unit.next_id(CF_BLOCKS)?;
        let mut record = BlockRecord {
            id,
            hash,
            depth: placement.depth,
            chain: placement.chain,
            version: 0,
            prev_hash: Hash256::ZERO,
            merkle_root: Hash256::ZERO,
            timestamp: 0,
            bits: 0,
            nonce: 0,
            size: block.size() as u32,
        };
        record.set_header(&block.header);
        unit.put_block(&record)?;

        let indexer = self.indexer();
        for (idx, tx) in block.transactions.iter().enumerate() {
            let tx_id = indexer
                .store(unit, tx, false)
                .map_err(|e| LedgerError::BlockPersist {
                    block_hash: hash.to_string(),
                    tx_hash: tx.txid().to_string(),
                    source: Box::new(e),
                })?;
            unit.link_block_tx(id, tx_id, idx as u32);
        }
        Ok(touched_main)
    }

    /// Store a loose transaction in its own atomic unit.
    ///
    /// With `validate` set, the configured validator must accept the
    /// transaction before anything is written.
    pub fn store_transaction(&self, tx: &Transaction, validate: bool) -> Result<u64, LedgerError> {
        let _writer = self.inner.writer.lock();
        let mut unit = WriteUnit::new(self.reader());
        let id = self.indexer().store(&mut unit, tx, validate)?;
        unit.commit()?;
        Ok(id)
    }

    /// Move the listed blocks to another chain in one atomic unit. Unknown
    /// hashes are skipped.
    pub fn update_blocks(&self, updates: &[(Hash256, Chain)]) -> Result<(), LedgerError> {
        let _writer = self.inner.writer.lock();
        let mut unit = WriteUnit::new(self.reader());
        for (hash, chain) in updates {
            if let Some(record) = unit.block_by_hash(hash)? {
                let depth = if *chain == Chain::Orphan { -1 } else { record.depth };
                unit.place_block(record, *chain, depth)?;
            }
        }
        unit.commit()?;
        self.invalidate_head();
        Ok(())
    }

    /// Delete all data.
    pub fn reset(&self) -> Result<(), LedgerError> {
        let _writer = self.inner.writer.lock();
        self.inner.backend.clear()?;
        self.invalidate_head();
        info!("chain store reset");
        Ok(())
    }

    // --- Orphan re-attachment ---

    fn reattach_orphans(&self, parent: Hash256) -> Result<(), LedgerError> {
        let budget = self.inner.config.max_inline_reattach;
        if let Some(rest) = self.drain(VecDeque::from([parent]), Some(budget))? {
            self.defer(rest)?;
        }
        Ok(())
    }

    /// Re-attach orphans below each queued parent, queueing every block that
    /// leaves ORPHAN. Returns the unprocessed queue once `budget` blocks
    /// have been re-attached.
    fn drain(
        &self,
        mut queue: VecDeque<Hash256>,
        budget: Option<usize>,
    ) -> Result<Option<VecDeque<Hash256>>, LedgerError> {
        let mut reattached = 0usize;
        while let Some(parent) = queue.pop_front() {
            if budget.is_some_and(|limit| reattached >= limit) {
                queue.push_front(parent);
                return Ok(Some(queue));
            }
            let orphans = self.snapshot().children_of(&parent, Chain::Orphan)?;
            for orphan in orphans {
                if self.reattach(&orphan.hash)? {
                    reattached += 1;
                    queue.push_back(orphan.hash);
                }
            }
        }
        Ok(None)
    }

    /// Re-place one ORPHAN block. Returns whether it left ORPHAN.
    fn reattach(&self, hash: &Hash256) -> Result<bool, LedgerError> {
        let _writer = self.inner.writer.lock();
        let mut unit = WriteUnit::new(self.reader());
        let Some(record) = unit.block_by_hash(hash)? else {
            return Ok(false);
        };
        if record.chain != Chain::Orphan {
            return Ok(false);
        }

        let placement = self.inner.selector.place(&unit, &record.header())?;
        if placement.chain == Chain::Orphan {
            return Ok(false);
        }

        let mut touched_main = placement.chain == Chain::Main;
        touched_main |= apply_reassign(&mut unit, &placement.reassign)?;
        unit.place_block(record, placement.chain, placement.depth)?;
        unit.commit()?;
        if touched_main {
            self.invalidate_head();
        }
        debug!(block = %hash, depth = placement.depth, chain = %placement.chain, "re-attached orphan");
        Ok(true)
    }

    fn defer(&self, pending: VecDeque<Hash256>) -> Result<(), LedgerError> {
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            debug!(pending = pending.len(), "no runtime, re-attaching remaining orphans inline");
            return self.drain(pending, None).map(|_| ());
        };

        debug!(pending = pending.len(), "deferring orphan re-attachment");
        self.inner.deferred.fetch_add(1, Ordering::SeqCst);
        let store = self.clone();
        handle.spawn_blocking(move || {
            if let Err(e) = store.drain(pending, None) {
                error!(error = %e, "deferred orphan re-attachment failed");
            }
            store.inner.deferred.fetch_sub(1, Ordering::SeqCst);
        });
        Ok(())
    }

    /// Number of background re-attachment tasks still running.
    pub fn deferred_reattachments(&self) -> usize {
        self.inner.deferred.load(Ordering::SeqCst)
    }

    // --- Head ---

    fn invalidate_head(&self) {
        let mut cache = self.inner.head.write();
        cache.epoch += 1;
        cache.head = None;
    }

    fn head_record(&self) -> Result<Option<BlockRecord>, LedgerError> {
        let epoch = {
            let cache = self.inner.head.read();
            if let Some(head) = &cache.head {
                return Ok(head.clone());
            }
            cache.epoch
        };

        let head = self.snapshot().head_record()?;
        let mut cache = self.inner.head.write();
        if cache.epoch == epoch {
            cache.head = Some(head.clone());
        }
        Ok(head)
    }

    /// Highest-depth MAIN block.
    pub fn get_head(&self) -> Result<Option<StoredBlock>, LedgerError> {
        let Some(record) = self.head_record()? else {
            return Ok(None);
        };
        view::load_block(&*self.snapshot(), record).map(Some)
    }

    /// Depth of the head, or `-1` with no MAIN block.
    pub fn get_depth(&self) -> Result<i64, LedgerError> {
        Ok(self.head_record()?.map_or(-1, |head| head.depth))
    }

    // --- Block reads ---

    pub fn has_block(&self, hash: &Hash256) -> Result<bool, LedgerError> {
        Ok(self.snapshot().block_id_by_hash(hash)?.is_some())
    }

    pub fn has_transaction(&self, hash: &Hash256) -> Result<bool, LedgerError> {
        Ok(self.snapshot().tx_id_by_hash(hash)?.is_some())
    }

    pub fn get_block_by_hash(&self, hash: &Hash256) -> Result<Option<StoredBlock>, LedgerError> {
        let snap = self.snapshot();
        load(&*snap, snap.block_by_hash(hash)?)
    }

    /// MAIN block at `depth`.
    pub fn get_block_by_depth(&self, depth: i64) -> Result<Option<StoredBlock>, LedgerError> {
        let snap = self.snapshot();
        load(&*snap, snap.main_block_at(depth)?)
    }

    /// MAIN block whose parent is `prev_hash`.
    pub fn get_block_by_prev_hash(
        &self,
        prev_hash: &Hash256,
    ) -> Result<Option<StoredBlock>, LedgerError> {
        let snap = self.snapshot();
        let child = snap.children_of(prev_hash, Chain::Main)?.into_iter().next();
        load(&*snap, child)
    }

    /// Block containing the transaction, preferring a MAIN block.
    pub fn get_block_by_transaction_hash(
        &self,
        tx_hash: &Hash256,
    ) -> Result<Option<StoredBlock>, LedgerError> {
        let snap = self.snapshot();
        let Some(tx_id) = snap.tx_id_by_hash(tx_hash)? else {
            return Ok(None);
        };
        load(&*snap, view::owning_block(&*snap, tx_id)?)
    }

    pub fn get_block_by_id(&self, id: u64) -> Result<Option<StoredBlock>, LedgerError> {
        let snap = self.snapshot();
        load(&*snap, snap.block(id)?)
    }
}

fn load(
    reader: &dyn RecordRead,
    record: Option<BlockRecord>,
) -> Result<Option<StoredBlock>, LedgerError> {
    record
        .map(|record| view::load_block(reader, record))
        .transpose()
}

/// Re-tag stored blocks. Returns whether a MAIN block was involved.
fn apply_reassign(
    unit: &mut WriteUnit<'_>,
    reassign: &[(Hash256, Chain)],
) -> Result<bool, LedgerError> {
    let mut touched_main = false;
    for (hash, chain) in reassign {
        let Some(record) = unit.block_by_hash(hash)? else {
            continue;
        };
        if record.chain == *chain {
            continue;
        }
        touched_main |= record.chain == Chain::Main || *chain == Chain::Main;
        debug!(block = %hash, from = %record.chain, to = %chain, "re-tagging block");
        let depth = record.depth;
        unit.place_block(record, *chain, depth)?;
    }
    Ok(touched_main)
}
