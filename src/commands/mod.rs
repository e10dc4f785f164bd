//! Command Handlers Module
//!
//! This module contains handlers for all CLI subcommands.

pub mod check;
pub mod format;
pub mod space;

use rust_vtl::config::LibraryConfig;
use rust_vtl::error::{Result, RustVtlError};
use rust_vtl::library::Library;
use std::path::{Path, PathBuf};
use tracing::debug;

/// `--config` if given, the per-user default otherwise
pub fn config_path(config: Option<PathBuf>) -> Result<PathBuf> {
    match config {
        Some(path) => Ok(path),
        None => LibraryConfig::default_path().ok_or_else(|| {
            RustVtlError::config("cannot determine the configuration directory; pass --config")
        }),
    }
}

/// Load the configuration and open every disk it lists. Blocking.
pub fn open_library(path: &Path) -> Result<Library> {
    debug!("Opening library from {:?}", path);
    let config = LibraryConfig::load(path)?;
    Library::from_config(&config)
}

/// Run blocking disk work off the async runtime
pub async fn blocking<T, F>(work: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(work)
        .await
        .map_err(|e| RustVtlError::Generic(anyhow::anyhow!("blocking task failed: {}", e)))?
}
