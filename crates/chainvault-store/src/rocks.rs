//! RocksDB-backed record store.
//!
//! Implements [`RecordBackend`] with one column family per table (see
//! [`crate::records`]). Every batch is applied through a single
//! [`WriteBatch`] for crash safety. Snapshots are RocksDB snapshots.

use std::path::Path;

use rocksdb::{
    ColumnFamilyDescriptor, Direction, IteratorMode, Options, Snapshot, WriteBatch, DB,
};

use chainvault_core::error::LedgerError;

use crate::backend::{BatchOp, RecordBackend};
use crate::records::{RecordRead, ALL_CFS};

type Entry = (Vec<u8>, Vec<u8>);
type RawItem = Result<(Box<[u8]>, Box<[u8]>), rocksdb::Error>;

/// RocksDB-backed record store.
pub struct RocksBackend {
    db: DB,
}

impl RocksBackend {
    /// Open or create a RocksDB database at the given path.
    ///
    /// Creates all column families if they don't exist.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, LedgerError> {
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);

        let cf_descriptors: Vec<ColumnFamilyDescriptor> = ALL_CFS
            .iter()
            .map(|name| ColumnFamilyDescriptor::new(*name, Options::default()))
            .collect();

        let db = DB::open_cf_descriptors(&db_opts, path.as_ref(), cf_descriptors)
            .map_err(|e| LedgerError::Storage(e.to_string()))?;

        Ok(Self { db })
    }

    /// Flush memtables to disk.
    pub fn flush(&self) -> Result<(), LedgerError> {
        for cf_name in ALL_CFS {
            let cf = self.cf_handle(cf_name)?;
            self.db
                .flush_cf(&cf)
                .map_err(|e| LedgerError::Storage(e.to_string()))?;
        }
        Ok(())
    }

    /// Get a column family handle.
    fn cf_handle(&self, name: &str) -> Result<&rocksdb::ColumnFamily, LedgerError> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| LedgerError::Storage(format!("missing column family: {name}")))
    }
}

/// Smallest key greater than every key starting with `prefix`, if any.
fn prefix_successor(prefix: &[u8]) -> Option<Vec<u8>> {
    let mut succ = prefix.to_vec();
    while let Some(last) = succ.pop() {
        if last < u8::MAX {
            succ.push(last + 1);
            return Some(succ);
        }
    }
    None
}

/// Forward iteration start for a prefix scan.
fn forward_from(prefix: &[u8]) -> IteratorMode<'_> {
    IteratorMode::From(prefix, Direction::Forward)
}

/// Reverse iteration start for a last-key lookup.
fn reverse_from(succ: Option<&[u8]>) -> IteratorMode<'_> {
    match succ {
        Some(succ) => IteratorMode::From(succ, Direction::Reverse),
        None => IteratorMode::End,
    }
}

fn collect_prefix(
    iter: impl Iterator<Item = RawItem>,
    prefix: &[u8],
) -> Result<Vec<Entry>, LedgerError> {
    let mut out = Vec::new();
    for item in iter {
        let (key, value) = item.map_err(|e| LedgerError::Storage(e.to_string()))?;
        if !key.starts_with(prefix) {
            break;
        }
        out.push((key.to_vec(), value.to_vec()));
    }
    Ok(out)
}

fn find_last(
    iter: impl Iterator<Item = RawItem>,
    prefix: &[u8],
) -> Result<Option<Entry>, LedgerError> {
    for item in iter {
        let (key, value) = item.map_err(|e| LedgerError::Storage(e.to_string()))?;
        if key.starts_with(prefix) {
            return Ok(Some((key.to_vec(), value.to_vec())));
        }
        // Reverse seek may land on the successor itself; anything below
        // the prefix means there is no match.
        if &key[..] < prefix {
            break;
        }
    }
    Ok(None)
}

impl RecordBackend for RocksBackend {
    fn get(&self, cf: &'static str, key: &[u8]) -> Result<Option<Vec<u8>>, LedgerError> {
        let cf = self.cf_handle(cf)?;
        self.db
            .get_cf(&cf, key)
            .map_err(|e| LedgerError::Storage(e.to_string()))
    }

    fn scan_prefix(
        &self,
        cf: &'static str,
        prefix: &[u8],
    ) -> Result<Vec<(Vec<u8>, Vec<u8>)>, LedgerError> {
        let cf = self.cf_handle(cf)?;
        collect_prefix(self.db.iterator_cf(&cf, forward_from(prefix)), prefix)
    }

    fn last_with_prefix(
        &self,
        cf: &'static str,
        prefix: &[u8],
    ) -> Result<Option<(Vec<u8>, Vec<u8>)>, LedgerError> {
        let cf = self.cf_handle(cf)?;
        let succ = prefix_successor(prefix);
        find_last(self.db.iterator_cf(&cf, reverse_from(succ.as_deref())), prefix)
    }

    fn write(&self, ops: Vec<BatchOp>) -> Result<(), LedgerError> {
        let mut batch = WriteBatch::default();
        for op in ops {
            match op {
                BatchOp::Put { cf, key, value } => {
                    let cf = self.cf_handle(cf)?;
                    batch.put_cf(&cf, key, value);
                }
                BatchOp::Delete { cf, key } => {
                    let cf = self.cf_handle(cf)?;
                    batch.delete_cf(&cf, key);
                }
            }
        }
        self.db
            .write(batch)
            .map_err(|e| LedgerError::Storage(e.to_string()))
    }

    fn clear(&self) -> Result<(), LedgerError> {
        let mut batch = WriteBatch::default();
        for cf_name in ALL_CFS {
            let cf = self.cf_handle(cf_name)?;
            for item in self.db.iterator_cf(&cf, IteratorMode::Start) {
                let (key, _) = item.map_err(|e| LedgerError::Storage(e.to_string()))?;
                batch.delete_cf(&cf, key);
            }
        }
        self.db
            .write(batch)
            .map_err(|e| LedgerError::Storage(e.to_string()))
    }

    fn snapshot(&self) -> Box<dyn RecordRead + '_> {
        Box::new(RocksSnapshot {
            backend: self,
            snapshot: self.db.snapshot(),
        })
    }
}

/// Read view over a RocksDB snapshot.
struct RocksSnapshot<'a> {
    backend: &'a RocksBackend,
    snapshot: Snapshot<'a>,
}

impl RecordRead for RocksSnapshot<'_> {
    fn get_raw(&self, cf: &'static str, key: &[u8]) -> Result<Option<Vec<u8>>, LedgerError> {
        let cf = self.backend.cf_handle(cf)?;
        self.snapshot
            .get_cf(&cf, key)
            .map_err(|e| LedgerError::Storage(e.to_string()))
    }

    fn scan_raw(
        &self,
        cf: &'static str,
        prefix: &[u8],
    ) -> Result<Vec<(Vec<u8>, Vec<u8>)>, LedgerError> {
        let cf = self.backend.cf_handle(cf)?;
        collect_prefix(self.snapshot.iterator_cf(&cf, forward_from(prefix)), prefix)
    }

    fn last_raw(
        &self,
        cf: &'static str,
        prefix: &[u8],
    ) -> Result<Option<(Vec<u8>, Vec<u8>)>, LedgerError> {
        let cf = self.backend.cf_handle(cf)?;
        let succ = prefix_successor(prefix);
        find_last(self.snapshot.iterator_cf(&cf, reverse_from(succ.as_deref())), prefix)
    }
}
