//! Cache engine — the public face of blobcache.
//!
//! `BlobCache` ties the pieces together: values are compressed and appended
//! to the blob file, their locations live in an in-memory index, and every
//! index mutation is logged to the WAL before it takes effect in memory.
//!
//! **Write path**: encode → compress → append frame → WAL record → index.
//! If the WAL append fails, the index is never modified; the orphaned frame
//! is dead bytes that vacuum reclaims.
//! **Read path**: index lookup → expiry check → seek → read frame →
//! decompress → decode.
//! **Open**: lock blob, ensure header, load snapshot, replay WAL, persist
//! merged snapshot, drop WAL, start a fresh one.
//!
//! The engine is single-threaded by design: mutations take `&mut self` and
//! the only lock anywhere is the advisory file lock that keeps a second
//! *process* out.

use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use hashbrown::HashMap;
use tracing::debug;

use crate::blobfile::{BlobReader, BlobWriter};
use crate::compress;
use crate::config::Config;
use crate::error::{BlobError, BlobResult};
use crate::format::{IndexEntry, BLOB_HEADER, BLOB_HEADER_LEN, FLAG_BYTES, FLAG_STRUCTURED};
use crate::index;
use crate::platform_fs;
use crate::value::{self, Value};
use crate::wal::{self, WalWriter};

/// Accumulated operation counters plus point-in-time measurements.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Stats {
    pub hits: u64,
    pub misses: u64,
    pub sets: u64,
    pub deletes: u64,
    pub refreshes: u64,
    pub fragmentation_ratio: f64,
    pub total_keys: usize,
    pub data_file_size_bytes: u64,
}

/// The three live descriptors. `None` on the engine means closed.
struct Handles {
    blob: BlobWriter,
    reader: BlobReader,
    wal: WalWriter,
}

/// Embedded persistent key-value cache over one blob file, an index file,
/// and a WAL, named `<base>.data.bin`, `<base>.index.bin`, `<base>.wal.bin`.
pub struct BlobCache {
    blob_path: PathBuf,
    index_path: PathBuf,
    wal_path: PathBuf,
    config: Config,
    handles: Option<Handles>,
    idx: HashMap<String, IndexEntry>,
    stats: Stats,
}

impl BlobCache {
    /// Open or create a cache at the given base path.
    ///
    /// Acquires the writer lock (failing fast with `Locked`), ensures the
    /// blob header, loads the index snapshot, replays and retires any WAL
    /// left by a crash, and opens a fresh WAL for this session.
    pub fn open<P: AsRef<Path>>(base: P, config: Config) -> BlobResult<Self> {
        config.validate().map_err(|reason| BlobError::BadValue { reason })?;

        let base = base.as_ref();
        if let Some(parent) = base.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| BlobError::io_at(parent, e, "failed to create cache directory"))?;
            }
        }

        let blob_path = derive_path(base, ".data.bin");
        let index_path = derive_path(base, ".index.bin");
        let wal_path = derive_path(base, ".wal.bin");

        let blob = BlobWriter::open(&blob_path, config.durable_writes)?;
        let mut reader = BlobReader::open(&blob_path)?;
        reader.verify_header()?;

        let now = wall_clock();
        let mut idx = index::load(&index_path, now)?;

        if wal_path.exists() {
            let replayed = wal::replay(&wal_path, &mut idx, now)?;
            debug!(
                upserts = replayed.upserts,
                deletes = replayed.deletes,
                expired_skipped = replayed.expired_skipped,
                "WAL replayed"
            );
            // The merged index must be on disk before the log goes away,
            // or a crash right here would lose everything just replayed.
            index::save(&index_path, &idx, config.durable_writes)?;
            std::fs::remove_file(&wal_path)
                .map_err(|e| BlobError::io_at(&wal_path, e, "failed to remove replayed WAL"))?;
        }

        let wal = WalWriter::open(&wal_path, config.durable_writes)?;

        debug!(
            base = %base.display(),
            keys = idx.len(),
            blob_bytes = blob.size(),
            "cache opened"
        );

        Ok(Self {
            blob_path,
            index_path,
            wal_path,
            config,
            handles: Some(Handles { blob, reader, wal }),
            idx,
            stats: Stats::default(),
        })
    }

    /// Store `value` under `key`, optionally expiring `ttl` seconds from now.
    ///
    /// Byte and string values are persisted verbatim (strings as their UTF-8
    /// bytes, so set/get is byte-lossless); everything else goes through the
    /// structured encoder. `ttl` of `None` or `Some(0)` means no expiry.
    pub fn set(&mut self, key: &str, value: impl Into<Value>, ttl: Option<u32>) -> BlobResult<()> {
        self.ensure_open()?;
        validate_key(key)?;
        let value = value.into();
        self.store(key, &value, ttl)
    }

    /// Store `value` under `key` only when the key is absent or expired.
    pub fn set_on_miss(&mut self, key: &str, value: impl Into<Value>, ttl: Option<u32>) -> BlobResult<()> {
        self.ensure_open()?;
        validate_key(key)?;
        if self.live_entry(key).is_none() {
            let value = value.into();
            self.store(key, &value, ttl)?;
        }
        Ok(())
    }

    /// Fetch the value stored under `key`.
    ///
    /// Fails with `NotFound` when the key is absent or expired; use
    /// [`get_or_refresh`](Self::get_or_refresh) to repopulate on miss instead.
    pub fn get(&mut self, key: &str) -> BlobResult<Value> {
        self.ensure_open()?;
        match self.live_entry(key) {
            Some(entry) => {
                self.stats.hits += 1;
                self.read_value(entry)
            }
            None => {
                self.stats.misses += 1;
                Err(BlobError::NotFound { key: key.to_string() })
            }
        }
    }

    /// Fetch `key`, or on a miss call `refresh`, store its result with
    /// `new_ttl`, and return it.
    pub fn get_or_refresh<F>(&mut self, key: &str, refresh: F, new_ttl: Option<u32>) -> BlobResult<Value>
    where
        F: FnOnce(&str) -> Value,
    {
        self.ensure_open()?;
        if let Some(entry) = self.live_entry(key) {
            self.stats.hits += 1;
            return self.read_value(entry);
        }

        self.stats.misses += 1;
        self.stats.refreshes += 1;
        validate_key(key)?;
        let fresh = refresh(key);
        self.store(key, &fresh, new_ttl)?;
        Ok(fresh)
    }

    /// Whether `key` exists and has not expired.
    ///
    /// The boundary is strict: an entry observed exactly at its expiry
    /// second is still live; it expires once `now > expires`.
    pub fn has(&self, key: &str) -> BlobResult<bool> {
        self.ensure_open()?;
        Ok(self.live_entry(key).is_some())
    }

    /// Remove `key`. Removing an absent key is a no-op.
    pub fn delete(&mut self, key: &str) -> BlobResult<()> {
        self.ensure_open()?;
        if self.idx.contains_key(key) {
            let handles = self.handles.as_mut().ok_or(BlobError::Closed)?;
            handles.wal.append_delete(key)?;
            self.idx.remove(key);
            self.stats.deletes += 1;
        }
        Ok(())
    }

    /// Synonym for [`delete`](Self::delete).
    pub fn del(&mut self, key: &str) -> BlobResult<()> {
        self.delete(key)
    }

    /// Remove every key that starts with `prefix`.
    pub fn delete_starts_with(&mut self, prefix: &str) -> BlobResult<()> {
        self.ensure_open()?;
        let doomed: Vec<String> = self
            .idx
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect();
        for key in &doomed {
            self.delete(key)?;
        }
        Ok(())
    }

    /// A snapshot of the currently live keys, in no particular order.
    ///
    /// Entries may expire between this call and any later use of the list;
    /// [`has`](Self::has) stays the authoritative check.
    pub fn keys(&self) -> BlobResult<Vec<String>> {
        self.ensure_open()?;
        let now = wall_clock();
        Ok(self
            .idx
            .iter()
            .filter(|(_, entry)| entry_is_live(entry, now))
            .map(|(key, _)| key.clone())
            .collect())
    }

    /// When `key` expires: the absolute timestamp in seconds, or the
    /// remaining seconds when `relative`. A never-expiring entry reports 0
    /// absolute (and `-now` relative). Fails with `NotFound` for absent keys.
    pub fn when_expired(&self, key: &str, relative: bool) -> BlobResult<i64> {
        self.ensure_open()?;
        match self.idx.get(key) {
            Some(entry) => {
                let expires = entry.expires as i64;
                Ok(if relative { expires - wall_clock() as i64 } else { expires })
            }
            None => Err(BlobError::NotFound { key: key.to_string() }),
        }
    }

    /// The fraction of the blob (header excluded) not covered by live
    /// frames: 0 is perfectly packed, 1 is empty or fully dead.
    pub fn fragmentation_ratio(&self) -> BlobResult<f64> {
        self.ensure_open()?;
        let handles = self.handles.as_ref().ok_or(BlobError::Closed)?;
        Ok(fragmentation(handles.blob.size(), &self.idx))
    }

    /// Operation counters plus current fragmentation, key count, and blob size.
    pub fn get_stats(&self) -> BlobResult<Stats> {
        self.ensure_open()?;
        let handles = self.handles.as_ref().ok_or(BlobError::Closed)?;
        let mut stats = self.stats.clone();
        stats.fragmentation_ratio = fragmentation(handles.blob.size(), &self.idx);
        stats.total_keys = self.idx.len();
        stats.data_file_size_bytes = handles.blob.size();
        Ok(stats)
    }

    /// Rebuild the blob file to contain only live frames.
    ///
    /// Live frames are copied raw into `<blob>.tmp` behind a fresh header,
    /// the temp file is renamed over the blob, and both blob descriptors are
    /// reopened against the new file (the lock moves to the new inode before
    /// the old one is released). Ends by persisting an index snapshot and
    /// starting a fresh WAL.
    pub fn vacuum(&mut self) -> BlobResult<()> {
        self.ensure_open()?;
        let handles = self.handles.as_mut().ok_or(BlobError::Closed)?;

        debug!(
            keys = self.idx.len(),
            blob_bytes = handles.blob.size(),
            "vacuuming blob file"
        );

        let tmp_path = index::temp_path(&self.blob_path);
        let mut new_index: HashMap<String, IndexEntry> = HashMap::with_capacity(self.idx.len());

        {
            let mut tmp = File::create(&tmp_path)
                .map_err(|e| BlobError::io_at(&tmp_path, e, "failed to create vacuum temp file"))?;
            tmp.write_all(BLOB_HEADER)
                .map_err(|e| BlobError::io_at(&tmp_path, e, "failed to write vacuum header"))?;

            let mut cursor = BLOB_HEADER_LEN;
            for (key, entry) in &self.idx {
                let frame = handles.reader.read_raw(entry.start, entry.length)?;
                tmp.write_all(&frame)
                    .map_err(|e| BlobError::io_at(&tmp_path, e, "failed to copy frame"))?;
                new_index.insert(
                    key.clone(),
                    IndexEntry { start: cursor, length: entry.length, expires: entry.expires },
                );
                cursor += entry.length as u64;
            }

            if self.config.durable_writes {
                platform_fs::durable_sync(&tmp)
                    .map_err(|e| BlobError::io_at(&tmp_path, e, "failed to sync vacuum file"))?;
            }
        }

        std::fs::rename(&tmp_path, &self.blob_path)
            .map_err(|e| BlobError::io_at(&self.blob_path, e, "failed to rename vacuumed blob"))?;

        // Lock the new inode before the old descriptor (and its lock) drops.
        handles.blob = BlobWriter::open(&self.blob_path, self.config.durable_writes)?;
        handles.reader = BlobReader::open(&self.blob_path)?;
        self.idx = new_index;

        index::save(&self.index_path, &self.idx, self.config.durable_writes)?;
        remove_if_exists(&self.wal_path)?;
        handles.wal = WalWriter::open(&self.wal_path, self.config.durable_writes)?;

        debug!(blob_bytes = handles.blob.size(), "vacuum complete");
        Ok(())
    }

    /// Close the cache: maybe auto-vacuum, release every descriptor and the
    /// lock, persist the final index snapshot, and remove the WAL.
    ///
    /// Fails with `Closed` if already closed. Descriptors and the lock are
    /// released on every path through this function, even when a later step
    /// fails; the first error encountered is reported.
    pub fn close(&mut self) -> BlobResult<()> {
        self.ensure_open()?;
        let stats = self.get_stats()?;
        debug!(
            hits = stats.hits,
            misses = stats.misses,
            sets = stats.sets,
            deletes = stats.deletes,
            refreshes = stats.refreshes,
            total_keys = stats.total_keys,
            fragmentation = stats.fragmentation_ratio,
            blob_bytes = stats.data_file_size_bytes,
            "closing cache"
        );

        let mut first_err: Option<BlobError> = None;

        if stats.fragmentation_ratio > self.config.auto_vacuum_threshold {
            debug!(
                threshold = self.config.auto_vacuum_threshold,
                ratio = stats.fragmentation_ratio,
                "auto-vacuum on close"
            );
            if let Err(e) = self.vacuum() {
                first_err = Some(e);
            }
        }

        // Past this point the engine is closed no matter what fails below.
        let handles = match self.handles.take() {
            Some(handles) => handles,
            None => return Err(BlobError::Closed),
        };
        drop(handles.reader);
        drop(handles.wal);
        if let Err(e) = handles.blob.unlock() {
            first_err.get_or_insert(e);
        }
        drop(handles.blob);

        if let Err(e) = index::save(&self.index_path, &self.idx, self.config.durable_writes) {
            first_err.get_or_insert(e);
        }
        if let Err(e) = remove_if_exists(&self.wal_path) {
            first_err.get_or_insert(e);
        }

        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    // -------------------------------------------------------------------
    // Internals
    // -------------------------------------------------------------------

    fn ensure_open(&self) -> BlobResult<()> {
        if self.handles.is_some() {
            Ok(())
        } else {
            Err(BlobError::Closed)
        }
    }

    /// The index entry for `key` if present and not expired.
    fn live_entry(&self, key: &str) -> Option<IndexEntry> {
        let entry = self.idx.get(key)?;
        entry_is_live(entry, wall_clock()).then_some(*entry)
    }

    /// Shared tail of set/set_on_miss/get_or_refresh: encode, compress,
    /// append the frame, log to the WAL, and only then touch the index.
    fn store(&mut self, key: &str, value: &Value, ttl: Option<u32>) -> BlobResult<()> {
        let flag;
        let encoded;
        let plain: &[u8] = match value {
            Value::Bytes(b) => {
                flag = FLAG_BYTES;
                b
            }
            Value::String(s) => {
                flag = FLAG_BYTES;
                s.as_bytes()
            }
            other => {
                flag = FLAG_STRUCTURED;
                encoded = value::encode_structured(other)?;
                &encoded
            }
        };

        let expires = match ttl {
            Some(ttl) if ttl > 0 => wall_clock().saturating_add(ttl),
            _ => 0,
        };

        let payload = compress::compress(plain)
            .map_err(|e| BlobError::Codec { message: format!("compression failed: {}", e) })?;

        let handles = self.handles.as_mut().ok_or(BlobError::Closed)?;
        let (start, length) = handles.blob.append_frame(flag, &payload)?;
        let entry = IndexEntry { start, length, expires };
        handles.wal.append_upsert(key, &entry)?;
        self.idx.insert(key.to_string(), entry);
        self.stats.sets += 1;
        Ok(())
    }

    /// Read, decompress, and decode the frame an index entry points at.
    fn read_value(&mut self, entry: IndexEntry) -> BlobResult<Value> {
        let handles = self.handles.as_mut().ok_or(BlobError::Closed)?;
        let (flag, payload) = handles.reader.read_frame(entry.start, entry.length)?;

        let plain = compress::decompress(&payload).map_err(|e| BlobError::Corrupt {
            path: self.blob_path.clone(),
            offset: entry.start,
            reason: format!("frame payload failed to decompress: {}", e),
        })?;

        if flag == FLAG_BYTES {
            Ok(Value::Bytes(plain))
        } else {
            value::decode_structured(&plain)
        }
    }
}

fn derive_path(base: &Path, suffix: &str) -> PathBuf {
    let mut name = base.as_os_str().to_os_string();
    name.push(suffix);
    PathBuf::from(name)
}

/// Seconds since the Unix epoch, saturating at the u32 horizon.
fn wall_clock() -> u32 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs().min(u32::MAX as u64) as u32)
        .unwrap_or(0)
}

/// Expired iff a deadline is set and strictly in the past.
fn entry_is_live(entry: &IndexEntry, now: u32) -> bool {
    entry.expires == 0 || now <= entry.expires
}

fn fragmentation(blob_size: u64, idx: &HashMap<String, IndexEntry>) -> f64 {
    let payload_bytes = blob_size.saturating_sub(BLOB_HEADER_LEN);
    if payload_bytes == 0 {
        return 1.0;
    }
    let live: u64 = idx.values().map(|entry| entry.length as u64).sum();
    1.0 - (live as f64 / payload_bytes as f64)
}

fn validate_key(key: &str) -> BlobResult<()> {
    if key.is_empty() {
        return Err(BlobError::BadKey { reason: "key must not be empty".to_string() });
    }
    if key.len() > u32::MAX as usize {
        return Err(BlobError::BadKey {
            reason: format!("key of {} bytes exceeds the on-disk format", key.len()),
        });
    }
    Ok(())
}

fn remove_if_exists(path: &Path) -> BlobResult<()> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(BlobError::io_at(path, e, "failed to remove file")),
    }
}
