//! Block I/O Primitives
//!
//! The bitmap engine and the tape layout only ever read and write whole
//! 4 KiB LBAs. `BlockStore` is the seam to whatever actually holds the
//! bytes: a disk image file in production, a sparse in-memory map in tests.

use super::LBA_SIZE;
use crate::error::{Result, RustVtlError};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tracing::debug;

/// Synchronous LBA-granular storage backing one block interface
pub trait BlockStore: Send + Sync {
    /// Read one LBA into `buf` (exactly `LBA_SIZE` bytes)
    fn read_block(&self, lba: u64, buf: &mut [u8]) -> Result<()>;

    /// Write one LBA; when `sync` is set the data is durable on return
    fn write_block(&self, lba: u64, data: &[u8], sync: bool) -> Result<()>;

    /// Human readable identification for logs
    fn describe(&self) -> String;
}

fn check_len(len: usize) -> Result<()> {
    if len != LBA_SIZE {
        return Err(RustVtlError::parameter_validation(format!(
            "block I/O must be exactly {} bytes, got {}",
            LBA_SIZE, len
        )));
    }
    Ok(())
}

/// Disk image file store
pub struct FileBlockStore {
    file: Mutex<File>,
    path: PathBuf,
}

impl FileBlockStore {
    /// Create (or truncate) an image file of `size` bytes; the file is sparse
    pub fn create<P: AsRef<Path>>(path: P, size: u64) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)?;
        file.set_len(size)?;

        debug!("Created disk image {:?} ({} bytes)", path.as_ref(), size);
        Ok(Self {
            file: Mutex::new(file),
            path: path.as_ref().to_path_buf(),
        })
    }

    /// Open an existing image file
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = OpenOptions::new().read(true).write(true).open(&path)?;

        Ok(Self {
            file: Mutex::new(file),
            path: path.as_ref().to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl BlockStore for FileBlockStore {
    fn read_block(&self, lba: u64, buf: &mut [u8]) -> Result<()> {
        check_len(buf.len())?;
        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(lba * LBA_SIZE as u64))?;
        file.read_exact(buf)?;
        Ok(())
    }

    fn write_block(&self, lba: u64, data: &[u8], sync: bool) -> Result<()> {
        check_len(data.len())?;
        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(lba * LBA_SIZE as u64))?;
        file.write_all(data)?;
        if sync {
            file.sync_data()?;
        }
        Ok(())
    }

    fn describe(&self) -> String {
        self.path.display().to_string()
    }
}

/// Sparse in-memory store. Blocks never written read back as missing,
/// and writes to selected LBAs can be made to fail.
#[derive(Default)]
pub struct MemoryBlockStore {
    blocks: Mutex<HashMap<u64, Vec<u8>>>,
    failing: Mutex<HashSet<u64>>,
    writes: Mutex<u64>,
}

impl MemoryBlockStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Forget a block, so that later reads of it fail
    pub fn discard(&self, lba: u64) {
        self.blocks.lock().remove(&lba);
    }

    /// Make every later write to `lba` fail with an I/O error
    pub fn fail_writes_at(&self, lba: u64) {
        self.failing.lock().insert(lba);
    }

    pub fn clear_failures(&self) {
        self.failing.lock().clear();
    }

    /// Number of successful writes so far
    pub fn write_count(&self) -> u64 {
        *self.writes.lock()
    }

    pub fn contains(&self, lba: u64) -> bool {
        self.blocks.lock().contains_key(&lba)
    }

    /// Overwrite raw bytes without going through any checksum logic
    pub fn poke(&self, lba: u64, data: Vec<u8>) {
        self.blocks.lock().insert(lba, data);
    }
}

impl BlockStore for MemoryBlockStore {
    fn read_block(&self, lba: u64, buf: &mut [u8]) -> Result<()> {
        check_len(buf.len())?;
        let blocks = self.blocks.lock();
        let data = blocks.get(&lba).ok_or_else(|| {
            std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("lba {} was never written", lba),
            )
        })?;
        buf.copy_from_slice(data);
        Ok(())
    }

    fn write_block(&self, lba: u64, data: &[u8], _sync: bool) -> Result<()> {
        check_len(data.len())?;
        if self.failing.lock().contains(&lba) {
            return Err(std::io::Error::new(
                std::io::ErrorKind::Other,
                format!("injected write failure at lba {}", lba),
            )
            .into());
        }
        self.blocks.lock().insert(lba, data.to_vec());
        *self.writes.lock() += 1;
        Ok(())
    }

    fn describe(&self) -> String {
        "memory".to_string()
    }
}
