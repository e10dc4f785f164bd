//! RustVTL Library
//!
//! Disk side of a virtual tape library: per-disk allocation bitmaps for the
//! block interfaces backing virtual cartridges, the tape segment maps that
//! reference those blocks, and a consistency checker that rebuilds the
//! bitmaps from what live cartridges actually use.

pub mod bdev;
pub mod check;
pub mod cli;
pub mod config;
pub mod device;
pub mod error;
pub mod library;
pub mod logger;
pub mod tape;
pub mod utils;

#[cfg(test)]
mod tests;

// Re-export key types for easier use
pub use bdev::{BintRegistry, BlockAddress, BlockInterface, FileBlockStore, MemoryBlockStore};
pub use check::{CheckError, CheckMode, CheckOutcome, CheckReport, DiskCheck};
pub use config::LibraryConfig;
pub use error::{Result, RustVtlError};
pub use library::Library;
pub use tape::{CartridgeId, FormatVersion, SegmentKind, TapeCartridge, TapePartition};
