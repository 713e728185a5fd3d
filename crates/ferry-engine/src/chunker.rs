//! Chunk sources — where the sender reads file bytes from.
//!
//! Slices are read on demand by (offset, length): adaptive sizing means
//! chunk boundaries are not known up front, and retransmission re-reads a
//! recorded slice rather than holding the whole file in memory.

use std::fs;
use std::io::{Read, Seek, SeekFrom};
use std::path::Path;
use std::sync::Mutex;

use bytes::Bytes;

/// A readable byte range the sender chunks and ships.
pub trait ByteSource: Send {
    /// Total length in bytes.
    fn len(&self) -> u64;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Read exactly `len` bytes starting at `offset`.
    fn read_slice(&self, offset: u64, len: usize) -> std::io::Result<Bytes>;
}

/// A file on disk.
pub struct FileSource {
    file: Mutex<fs::File>,
    len: u64,
}

impl FileSource {
    pub fn open(path: impl AsRef<Path>) -> std::io::Result<Self> {
        let file = fs::File::open(path)?;
        let len = file.metadata()?.len();
        Ok(Self {
            file: Mutex::new(file),
            len,
        })
    }
}

impl ByteSource for FileSource {
    fn len(&self) -> u64 {
        self.len
    }

    fn read_slice(&self, offset: u64, len: usize) -> std::io::Result<Bytes> {
        let mut file = self.file.lock().expect("file source lock poisoned");
        file.seek(SeekFrom::Start(offset))?;
        let mut buf = vec![0u8; len];
        file.read_exact(&mut buf)?;
        Ok(Bytes::from(buf))
    }
}

/// An in-memory source, used by tests and clipboard-sized payloads.
pub struct MemorySource(Bytes);

impl MemorySource {
    pub fn new(bytes: impl Into<Bytes>) -> Self {
        Self(bytes.into())
    }
}

impl ByteSource for MemorySource {
    fn len(&self) -> u64 {
        self.0.len() as u64
    }

    fn read_slice(&self, offset: u64, len: usize) -> std::io::Result<Bytes> {
        let start = offset as usize;
        let end = start + len;
        if end > self.0.len() {
            return Err(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                format!("slice {start}..{end} beyond source of {}", self.0.len()),
            ));
        }
        Ok(self.0.slice(start..end))
    }
}
