//! Record store boundary.
//!
//! A [`RecordBackend`] is a set of named tables of ordered byte keys with
//! point lookup, prefix scans, atomic multi-record writes and point-in-time
//! snapshots. Everything above this trait speaks typed records (see
//! [`crate::records`]).
//! [`MemoryBackend`] serves tests and ephemeral use; the RocksDB backend lives
//! in [`crate::rocks`].

use std::collections::{BTreeMap, HashMap};

use parking_lot::{RwLock, RwLockReadGuard};

use chainvault_core::error::LedgerError;

use crate::records::{RecordRead, ALL_CFS};

/// One mutation inside an atomic batch.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum BatchOp {
    Put {
        cf: &'static str,
        key: Vec<u8>,
        value: Vec<u8>,
    },
    Delete {
        cf: &'static str,
        key: Vec<u8>,
    },
}

/// Durable ordered key-value substrate.
///
/// Implementations must make [`write`](Self::write) all-or-nothing and
/// must never expose a partially applied batch to readers.
pub trait RecordBackend: Send + Sync {
    /// Point lookup.
    fn get(&self, cf: &'static str, key: &[u8]) -> Result<Option<Vec<u8>>, LedgerError>;

    /// All entries whose key starts with `prefix`, in ascending key order.
    fn scan_prefix(
        &self,
        cf: &'static str,
        prefix: &[u8],
    ) -> Result<Vec<(Vec<u8>, Vec<u8>)>, LedgerError>;

    /// The entry with the greatest key starting with `prefix`.
    ///
    /// Default implementation scans the whole prefix.
    fn last_with_prefix(
        &self,
        cf: &'static str,
        prefix: &[u8],
    ) -> Result<Option<(Vec<u8>, Vec<u8>)>, LedgerError> {
        Ok(self.scan_prefix(cf, prefix)?.pop())
    }

    /// Apply all operations atomically.
    fn write(&self, ops: Vec<BatchOp>) -> Result<(), LedgerError>;

    /// Delete every record in every table.
    fn clear(&self) -> Result<(), LedgerError>;

    /// A read view pinned to the current state. Batches written after this
    /// call are not visible through it.
    fn snapshot(&self) -> Box<dyn RecordRead + '_>;
}

type Table = BTreeMap<Vec<u8>, Vec<u8>>;
type Tables = HashMap<&'static str, Table>;

fn table_get(tables: &Tables, cf: &'static str, key: &[u8]) -> Option<Vec<u8>> {
    tables.get(cf).and_then(|table| table.get(key).cloned())
}

fn table_scan(tables: &Tables, cf: &'static str, prefix: &[u8]) -> Vec<(Vec<u8>, Vec<u8>)> {
    let Some(table) = tables.get(cf) else {
        return Vec::new();
    };
    table
        .range(prefix.to_vec()..)
        .take_while(|(key, _)| key.starts_with(prefix))
        .map(|(key, value)| (key.clone(), value.clone()))
        .collect()
}

/// In-memory record backend.
///
/// No persistence. A single `RwLock` makes each batch atomic with respect to
/// readers; a snapshot holds the read lock until it is dropped.
#[derive(Default)]
pub struct MemoryBackend {
    tables: RwLock<Tables>,
}

impl MemoryBackend {
    /// Create an empty backend.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of records in one table.
    pub fn len(&self, cf: &'static str) -> usize {
        self.tables.read().get(cf).map_or(0, BTreeMap::len)
    }

    /// Whether every table is empty.
    pub fn is_empty(&self) -> bool {
        self.tables.read().values().all(BTreeMap::is_empty)
    }

    fn check_cf(cf: &str) -> Result<(), LedgerError> {
        if ALL_CFS.iter().any(|name| *name == cf) {
            Ok(())
        } else {
            Err(LedgerError::Storage(format!("missing column family: {cf}")))
        }
    }
}

impl RecordBackend for MemoryBackend {
    fn get(&self, cf: &'static str, key: &[u8]) -> Result<Option<Vec<u8>>, LedgerError> {
        Self::check_cf(cf)?;
        Ok(table_get(&self.tables.read(), cf, key))
    }

    fn scan_prefix(
        &self,
        cf: &'static str,
        prefix: &[u8],
    ) -> Result<Vec<(Vec<u8>, Vec<u8>)>, LedgerError> {
        Self::check_cf(cf)?;
        Ok(table_scan(&self.tables.read(), cf, prefix))
    }

    fn write(&self, ops: Vec<BatchOp>) -> Result<(), LedgerError> {
        for op in &ops {
            match op {
                BatchOp::Put { cf, .. } | BatchOp::Delete { cf, .. } => Self::check_cf(cf)?,
            }
        }

        let mut tables = self.tables.write();
        for op in ops {
            match op {
                BatchOp::Put { cf, key, value } => {
                    tables.entry(cf).or_default().insert(key, value);
                }
                BatchOp::Delete { cf, key } => {
                    if let Some(table) = tables.get_mut(cf) {
                        table.remove(&key);
                    }
                }
            }
        }
        Ok(())
    }

    fn clear(&self) -> Result<(), LedgerError> {
        self.tables.write().clear();
        Ok(())
    }

    fn snapshot(&self) -> Box<dyn RecordRead + '_> {
        Box::new(MemorySnapshot {
            tables: self.tables.read(),
        })
    }
}

/// Read view over a [`MemoryBackend`]. Writers block while one is alive.
struct MemorySnapshot<'a> {
    tables: RwLockReadGuard<'a, Tables>,
}

impl RecordRead for MemorySnapshot<'_> {
    fn get_raw(&self, cf: &'static str, key: &[u8]) -> Result<Option<Vec<u8>>, LedgerError> {
        MemoryBackend::check_cf(cf)?;
        Ok(table_get(&self.tables, cf, key))
    }

    fn scan_raw(
        &self,
        cf: &'static str,
        prefix: &[u8],
    ) -> Result<Vec<(Vec<u8>, Vec<u8>)>, LedgerError> {
        MemoryBackend::check_cf(cf)?;
        Ok(table_scan(&self.tables, cf, prefix))
    }
}
