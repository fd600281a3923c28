//! Integration test suite for chainvault.
//!
//! Exercises the store end to end: block ingestion, orphan re-attachment,
//! reorganization, pruning, address lookups and RocksDB persistence.

pub mod helpers;
