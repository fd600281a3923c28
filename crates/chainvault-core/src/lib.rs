//! # chainvault-core
//! Ledger types, script classification, and errors shared by the store.

pub mod error;
pub mod merkle;
pub mod script;
pub mod traits;
pub mod types;
