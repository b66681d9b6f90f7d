//! Write-ahead log
//!
//! Every mutation appends one record here before it lands in the in-memory
//! index, so a crash between index snapshots loses nothing that was fully
//! flushed. The log is replayed over the snapshot at open and removed once
//! the merged index has been persisted.
//!
//! A record that stops short of its declared length is a torn tail from a
//! crash mid-write: replay ends there silently and the bytes after it are
//! ignored.

use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use hashbrown::HashMap;
use tracing::warn;

use crate::error::{BlobError, BlobResult};
use crate::format::{self, IndexEntry, Parse, WalRecord};
use crate::platform_fs;

/// Append handle for the WAL file.
pub struct WalWriter {
    file: File,
    path: PathBuf,
    durable: bool,
}

impl WalWriter {
    /// Open or create the WAL file for appending.
    pub fn open(path: &Path, durable: bool) -> BlobResult<Self> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(|e| BlobError::io_at(path, e, "failed to open WAL file"))?;
        Ok(Self { file, path: path.to_path_buf(), durable })
    }

    /// Log that `key` now maps to `entry`.
    pub fn append_upsert(&mut self, key: &str, entry: &IndexEntry) -> BlobResult<()> {
        self.append(&format::encode_wal_upsert(key, entry))
    }

    /// Log that `key` was removed.
    pub fn append_delete(&mut self, key: &str) -> BlobResult<()> {
        self.append(&format::encode_wal_delete(key))
    }

    fn append(&mut self, record: &[u8]) -> BlobResult<()> {
        self.file
            .write_all(record)
            .map_err(|e| BlobError::io_at(&self.path, e, "WAL write failed"))?;
        if self.durable {
            platform_fs::durable_sync(&self.file)
                .map_err(|e| BlobError::io_at(&self.path, e, "WAL sync failed"))?;
        }
        Ok(())
    }
}

/// Counts from one replay pass, for the open-time log line.
#[derive(Debug, Default, Clone, Copy)]
pub struct ReplayStats {
    pub upserts: usize,
    pub deletes: usize,
    pub expired_skipped: usize,
}

/// Replay the WAL at `path` over `index`, in file order.
///
/// Upserts install their entry unless already expired at `now`; deletes
/// remove the key if present. A torn or malformed tail ends the replay
/// without error — everything before it has already been applied.
pub fn replay(path: &Path, index: &mut HashMap<String, IndexEntry>, now: u32) -> BlobResult<ReplayStats> {
    let mut file = File::open(path)
        .map_err(|e| BlobError::io_at(path, e, "failed to open WAL file for replay"))?;
    let mut buf = Vec::new();
    file.read_to_end(&mut buf)
        .map_err(|e| BlobError::io_at(path, e, "failed to read WAL file"))?;

    let mut stats = ReplayStats::default();
    let mut offset = 0usize;

    while offset < buf.len() {
        match format::parse_wal_record(&buf[offset..]) {
            Parse::Record { record, consumed } => {
                match record {
                    WalRecord::Upsert { key, entry } => {
                        if entry.expires != 0 && entry.expires <= now {
                            stats.expired_skipped += 1;
                        } else {
                            index.insert(key, entry);
                            stats.upserts += 1;
                        }
                    }
                    WalRecord::Delete { key } => {
                        index.remove(&key);
                        stats.deletes += 1;
                    }
                }
                offset += consumed;
            }
            Parse::Incomplete => {
                warn!(
                    path = %path.display(),
                    offset,
                    trailing = buf.len() - offset,
                    "torn WAL tail, dropping partial record"
                );
                break;
            }
            Parse::Malformed { reason } => {
                warn!(
                    path = %path.display(),
                    offset,
                    reason = %reason,
                    "malformed WAL record, stopping replay"
                );
                break;
            }
        }
    }

    Ok(stats)
}
