//! Durable storage for committed blocks.
//!
//! The genesis block is never stored; it is rebuilt from configuration. A
//! store holds blocks `1..=height` in order and is replayed through the
//! validator on startup.

use crate::core::block::Block;
use crate::types::encoding::{Decode, Encode};
use crate::warn;
use fs2::FileExt;
use powchain_derive::Error;
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

/// Name of the block log inside the data directory.
pub const BLOCK_LOG_FILE: &str = "blocks.db";
/// Name of the advisory lock file inside the data directory.
pub const LOCK_FILE: &str = ".lock";

/// Frames larger than this are treated as a corrupt tail.
const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("storage I/O failed: {0}")]
    Io(String),

    #[error("data directory {0} is in use by another process")]
    Locked(String),
}

impl From<io::Error> for StorageError {
    fn from(err: io::Error) -> Self {
        StorageError::Io(err.to_string())
    }
}

/// Ordered block persistence. Implementations must be thread-safe; the node
/// only calls them while holding its write lock.
///
/// Every write either lands completely or leaves the store as it was.
pub trait BlockStore: Send + Sync {
    /// All stored blocks in order.
    fn load(&self) -> Result<Vec<Block>, StorageError>;

    /// Appends the next block.
    fn append(&self, block: &Block) -> Result<(), StorageError>;

    /// Keeps blocks `1..=ancestor` and puts `blocks` after them, in one step.
    fn replace_from(&self, ancestor: u64, blocks: &[Arc<Block>]) -> Result<(), StorageError>;

    /// Keeps blocks `1..=height` and drops the rest.
    fn truncate(&self, height: u64) -> Result<(), StorageError> {
        self.replace_from(height, &[])
    }
}

/// Volatile store for tests and throwaway nodes.
#[derive(Default)]
pub struct MemoryBlockStore {
    blocks: Mutex<Vec<Block>>,
}

impl MemoryBlockStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl BlockStore for MemoryBlockStore {
    fn load(&self) -> Result<Vec<Block>, StorageError> {
        Ok(self.blocks.lock().unwrap_or_else(|e| e.into_inner()).clone())
    }

    fn append(&self, block: &Block) -> Result<(), StorageError> {
        self.blocks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(block.clone());
        Ok(())
    }

    fn replace_from(&self, ancestor: u64, blocks: &[Arc<Block>]) -> Result<(), StorageError> {
        let mut stored = self.blocks.lock().unwrap_or_else(|e| e.into_inner());
        stored.truncate(ancestor as usize);
        stored.extend(blocks.iter().map(|b| (**b).clone()));
        Ok(())
    }
}

/// Append-only block log: each block is a little-endian `u32` length followed
/// by its binary encoding.
///
/// Holds an exclusive lock on the data directory for its whole lifetime.
pub struct FileBlockStore {
    path: PathBuf,
    log: Mutex<File>,
    _lock: File,
}

impl FileBlockStore {
    /// Opens (creating if needed) the block log under `dir`.
    pub fn open(dir: &Path) -> Result<Self, StorageError> {
        fs::create_dir_all(dir)?;

        let lock = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(dir.join(LOCK_FILE))?;
        lock.try_lock_exclusive()
            .map_err(|_| StorageError::Locked(dir.display().to_string()))?;

        let path = dir.join(BLOCK_LOG_FILE);
        let log = Self::open_log(&path)?;
        Ok(Self {
            path,
            log: Mutex::new(log),
            _lock: lock,
        })
    }

    fn open_log(path: &Path) -> io::Result<File> {
        OpenOptions::new()
            .create(true)
            .append(true)
            .read(true)
            .open(path)
    }

    fn write_frame(out: &mut impl Write, block: &Block) -> io::Result<()> {
        let bytes = block.encode_to_vec();
        let len = u32::try_from(bytes.len())
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "block too large"))?;
        out.write_all(&len.to_le_bytes())?;
        out.write_all(&bytes)
    }

    /// Parses frames until the end of `raw` or the first damaged frame.
    fn parse(raw: &[u8]) -> Vec<Block> {
        let mut blocks = Vec::new();
        let mut rest = raw;
        while !rest.is_empty() {
            if rest.len() < 4 {
                warn!(
                    "Block log has a truncated frame header, ignoring {} trailing bytes",
                    rest.len()
                );
                break;
            }
            let len = u32::from_le_bytes([rest[0], rest[1], rest[2], rest[3]]) as usize;
            if len > MAX_FRAME_LEN || rest.len() - 4 < len {
                warn!("Block log frame {} is damaged, ignoring the tail", blocks.len() + 1);
                break;
            }
            match Block::from_bytes(&rest[4..4 + len]) {
                Ok(block) => blocks.push(block),
                Err(err) => {
                    warn!(
                        "Block log frame {} does not decode ({err}), ignoring the tail",
                        blocks.len() + 1
                    );
                    break;
                }
            }
            rest = &rest[4 + len..];
        }
        blocks
    }
}

impl BlockStore for FileBlockStore {
    fn load(&self) -> Result<Vec<Block>, StorageError> {
        let mut raw = Vec::new();
        File::open(&self.path)?.read_to_end(&mut raw)?;
        Ok(Self::parse(&raw))
    }

    fn append(&self, block: &Block) -> Result<(), StorageError> {
        let mut log = self.log.lock().unwrap_or_else(|e| e.into_inner());
        let committed = log.metadata()?.len();
        let written = Self::write_frame(&mut *log, block).and_then(|_| log.sync_data());
        if let Err(err) = written {
            // Drop the partial frame so later appends stay readable.
            if let Err(undo) = log.set_len(committed) {
                warn!("Could not roll back a failed block append: {undo}");
            }
            return Err(err.into());
        }
        Ok(())
    }

    fn replace_from(&self, ancestor: u64, blocks: &[Arc<Block>]) -> Result<(), StorageError> {
        let mut log = self.log.lock().unwrap_or_else(|e| e.into_inner());
        let kept: Vec<Block> = self.load()?.into_iter().take(ancestor as usize).collect();

        let tmp = self.path.with_extension("db.tmp");
        {
            let file = File::create(&tmp)?;
            let mut out = BufWriter::new(&file);
            for block in kept.iter().chain(blocks.iter().map(|b| &**b)) {
                Self::write_frame(&mut out, block)?;
            }
            out.flush()?;
            drop(out);
            file.sync_all()?;
        }
        fs::rename(&tmp, &self.path)?;
        *log = Self::open_log(&self.path)?;
        Ok(())
    }
}
