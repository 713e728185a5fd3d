//! Durable chunk store — receiver-side persistence for resumable transfers.
//!
//! Chunks are stored one file per sequence number under a directory derived
//! from the transfer id:
//!
//!   {root}/{transfer_fs_key}/chunks/{seq:08x}
//!   {root}/{transfer_fs_key}/meta.json
//!
//! Files are written atomically (temp file, then rename) and puts are
//! idempotent — if the seq exists, the bytes are identical by protocol
//! invariant and the put is a no-op. The metadata sidecar is rewritten
//! after each successful put; together they let a restarted receiver
//! recover `next_expected` and the persisted seq set.

use std::fs;
use std::io::Write;
use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use memmap2::Mmap;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use ferry_core::{FileDescriptor, TransferId};

/// Per-chunk header inside each stored file: u32 BE offset + flags byte.
const RECORD_HEADER_LEN: usize = 5;
const RECORD_FLAG_LAST: u8 = 0b0000_0001;

/// Sidecar state persisted next to the chunks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoreMeta {
    /// Next sequence number the receiver expects (length of the persisted
    /// contiguous prefix).
    pub next_expected: u32,
    /// Total payload bytes persisted.
    pub received_bytes: u64,
    /// Seq of the chunk flagged last, once seen.
    pub last_seq: Option<u32>,
    /// The file being transferred.
    pub descriptor: FileDescriptor,
    /// Unix seconds of the latest update.
    pub updated_at: u64,
}

/// A chunk read back from the store.
#[derive(Debug, Clone)]
pub struct ChunkRecord {
    pub seq: u32,
    pub offset: u32,
    pub is_last: bool,
    pub payload: Bytes,
}

/// Filesystem-backed chunk store for one transfer.
#[derive(Debug, Clone)]
pub struct ChunkStore {
    dir: PathBuf,
}

impl ChunkStore {
    /// Open (creating if needed) the store for a transfer.
    pub fn open(root: impl Into<PathBuf>, id: &TransferId) -> Result<Self, StoreError> {
        let dir = root.into().join(id.fs_key());
        let chunks = dir.join("chunks");
        fs::create_dir_all(&chunks).map_err(|e| StoreError::Io {
            path: chunks,
            source: e,
        })?;
        Ok(Self { dir })
    }

    /// Persist one chunk. Idempotent on seq.
    pub fn put(
        &self,
        seq: u32,
        offset: u32,
        is_last: bool,
        payload: &[u8],
    ) -> Result<(), StoreError> {
        let path = self.chunk_path(seq);
        if path.exists() {
            // Same (transfer, seq) always carries the same bytes.
            return Ok(());
        }

        let mut flags = 0u8;
        if is_last {
            flags |= RECORD_FLAG_LAST;
        }

        // Atomic write: tmp file → rename.
        let tmp = path.with_extension("tmp");
        {
            let mut file = fs::File::create(&tmp).map_err(|e| StoreError::Io {
                path: tmp.clone(),
                source: e,
            })?;
            file.write_all(&offset.to_be_bytes())
                .and_then(|_| file.write_all(&[flags]))
                .and_then(|_| file.write_all(payload))
                .and_then(|_| file.sync_all())
                .map_err(|e| StoreError::Io {
                    path: tmp.clone(),
                    source: e,
                })?;
        }
        fs::rename(&tmp, &path).map_err(|e| StoreError::Io {
            path: path.clone(),
            source: e,
        })?;

        tracing::trace!(seq, offset, len = payload.len(), "chunk persisted");
        Ok(())
    }

    /// Read one chunk back. Reads are mmap-backed.
    pub fn get(&self, seq: u32) -> Result<Option<ChunkRecord>, StoreError> {
        let path = self.chunk_path(seq);
        if !path.exists() {
            return Ok(None);
        }

        let file = fs::File::open(&path).map_err(|e| StoreError::Io {
            path: path.clone(),
            source: e,
        })?;
        // Safety: the file is opened read-only and never mutated while mapped.
        let mmap = unsafe {
            Mmap::map(&file).map_err(|e| StoreError::Io {
                path: path.clone(),
                source: e,
            })?
        };

        if mmap.len() < RECORD_HEADER_LEN {
            return Err(StoreError::Corrupt {
                path,
                reason: format!("record shorter than header: {} bytes", mmap.len()),
            });
        }

        let offset = u32::from_be_bytes(mmap[0..4].try_into().unwrap());
        let flags = mmap[4];
        Ok(Some(ChunkRecord {
            seq,
            offset,
            is_last: flags & RECORD_FLAG_LAST != 0,
            payload: Bytes::copy_from_slice(&mmap[RECORD_HEADER_LEN..]),
        }))
    }

    pub fn contains(&self, seq: u32) -> bool {
        self.chunk_path(seq).exists()
    }

    /// All persisted seqs, sorted ascending. Used for resume announcements
    /// and gap detection at assembly.
    pub fn sequences(&self) -> Result<Vec<u32>, StoreError> {
        let chunks = self.dir.join("chunks");
        let mut seqs = Vec::new();
        let entries = fs::read_dir(&chunks).map_err(|e| StoreError::Io {
            path: chunks,
            source: e,
        })?;
        for entry in entries.flatten() {
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if name.ends_with(".tmp") {
                continue; // interrupted write, never renamed
            }
            if let Ok(seq) = u32::from_str_radix(name, 16) {
                seqs.push(seq);
            }
        }
        seqs.sort_unstable();
        Ok(seqs)
    }

    /// All persisted chunks ordered by seq.
    pub fn get_all(&self) -> Result<Vec<ChunkRecord>, StoreError> {
        let mut records = Vec::new();
        for seq in self.sequences()? {
            if let Some(record) = self.get(seq)? {
                records.push(record);
            }
        }
        Ok(records)
    }

    /// Persist the metadata sidecar. Atomic like chunk writes.
    pub fn save_meta(&self, meta: &StoreMeta) -> Result<(), StoreError> {
        let path = self.meta_path();
        let tmp = path.with_extension("tmp");
        let text = serde_json::to_vec(meta).map_err(|e| StoreError::MetaEncode(e.to_string()))?;
        fs::write(&tmp, &text).map_err(|e| StoreError::Io {
            path: tmp.clone(),
            source: e,
        })?;
        fs::rename(&tmp, &path).map_err(|e| StoreError::Io {
            path,
            source: e,
        })?;
        Ok(())
    }

    /// Load the sidecar, if a prior run left one.
    pub fn load_meta(&self) -> Result<Option<StoreMeta>, StoreError> {
        let path = self.meta_path();
        if !path.exists() {
            return Ok(None);
        }
        let text = fs::read(&path).map_err(|e| StoreError::Io {
            path: path.clone(),
            source: e,
        })?;
        let meta = serde_json::from_slice(&text).map_err(|e| StoreError::Corrupt {
            path,
            reason: e.to_string(),
        })?;
        Ok(Some(meta))
    }

    /// Remove every chunk and the sidecar for this transfer.
    pub fn delete_all(&self) -> Result<(), StoreError> {
        if self.dir.exists() {
            fs::remove_dir_all(&self.dir).map_err(|e| StoreError::Io {
                path: self.dir.clone(),
                source: e,
            })?;
        }
        Ok(())
    }

    fn chunk_path(&self, seq: u32) -> PathBuf {
        self.dir.join("chunks").join(format!("{seq:08x}"))
    }

    fn meta_path(&self) -> PathBuf {
        self.dir.join("meta.json")
    }
}

/// Current time as unix seconds, for `StoreMeta::updated_at`.
pub fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store I/O failed at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("corrupt store record at {path}: {reason}")]
    Corrupt { path: PathBuf, reason: String },

    #[error("failed to encode store metadata: {0}")]
    MetaEncode(String),
}

// ── Tests ─────────────────────────────────────────────────────────────────────
