//! Store configuration.
//!
//! Provides [`StoreConfig`] with defaults for the data directory, storage
//! mode and the inline re-attachment budget. Values are layered: built-in
//! defaults, then an optional TOML file, then `CHAINVAULT_*` environment
//! variables.

use std::path::{Path, PathBuf};

use serde::Deserialize;

use chainvault_core::error::LedgerError;

/// Orphans re-attached synchronously before the rest is deferred.
pub const DEFAULT_MAX_INLINE_REATTACH: usize = 64;

const ENV_PREFIX: &str = "CHAINVAULT";

/// Whether fully spent transactions are kept.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageMode {
    /// Keep every transaction.
    #[default]
    Full,
    /// Delete a transaction once all of its outputs are spent.
    Pruned,
}

/// Configuration for a chain store instance.
#[derive(Debug, Clone, Deserialize)]
pub struct StoreConfig {
    /// Root directory for all persistent data.
    pub data_dir: PathBuf,
    pub mode: StorageMode,
    /// Orphan re-attachments processed inside `persist_block` before the
    /// remainder is handed to a background task.
    pub max_inline_reattach: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        let data_dir = dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("chainvault");

        Self {
            data_dir,
            mode: StorageMode::Full,
            max_inline_reattach: DEFAULT_MAX_INLINE_REATTACH,
        }
    }
}

impl StoreConfig {
    /// Path to the RocksDB chain data directory.
    pub fn db_path(&self) -> PathBuf {
        self.data_dir.join("chaindata")
    }

    /// Defaults for a pruned store.
    pub fn pruned() -> Self {
        Self {
            mode: StorageMode::Pruned,
            ..Self::default()
        }
    }

    /// Load defaults, then `file` if given, then `CHAINVAULT_*` variables.
    pub fn load(file: Option<&Path>) -> Result<Self, LedgerError> {
        Self::builder(file)?
            .add_source(config::Environment::with_prefix(ENV_PREFIX).try_parsing(true))
            .build()
            .and_then(|layered| layered.try_deserialize())
            .map_err(|e| LedgerError::Config(e.to_string()))
    }

    fn builder(
        file: Option<&Path>,
    ) -> Result<config::ConfigBuilder<config::builder::DefaultState>, LedgerError> {
        let defaults = Self::default();
        let mut builder = config::Config::builder()
            .set_default("data_dir", defaults.data_dir.to_string_lossy().into_owned())
            .and_then(|b| b.set_default("mode", "full"))
            .and_then(|b| b.set_default("max_inline_reattach", defaults.max_inline_reattach as i64))
            .map_err(|e| LedgerError::Config(e.to_string()))?;

        if let Some(path) = file {
            builder = builder.add_source(
                config::File::from(path)
                    .format(config::FileFormat::Toml)
                    .required(true),
            );
        }
        Ok(builder)
    }
}
