//! Index snapshot persistence
//!
//! The index file is a full dump of the in-memory index, rewritten on clean
//! close, after vacuum, and after a WAL replay at open. It is always written
//! to a sibling `.tmp` file first and renamed into place, so readers of the
//! snapshot see either the old complete file or the new complete one —
//! which is why a short read here is corruption rather than a torn tail.

use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use hashbrown::HashMap;
use tracing::debug;

use crate::error::{BlobError, BlobResult};
use crate::format::{self, IndexEntry, Parse};
use crate::platform_fs;

/// Sibling temp path used for atomic rename-over.
pub fn temp_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(".tmp");
    PathBuf::from(name)
}

/// Write a full snapshot of `index` to `path` atomically.
pub fn save(path: &Path, index: &HashMap<String, IndexEntry>, durable: bool) -> BlobResult<()> {
    let tmp = temp_path(path);

    let mut buf = Vec::new();
    for (key, entry) in index {
        buf.extend_from_slice(&format::encode_index_entry(key, entry));
    }

    {
        let mut file = File::create(&tmp)
            .map_err(|e| BlobError::io_at(&tmp, e, "failed to create index temp file"))?;
        file.write_all(&buf)
            .map_err(|e| BlobError::io_at(&tmp, e, "failed to write index snapshot"))?;
        if durable {
            platform_fs::durable_sync(&file)
                .map_err(|e| BlobError::io_at(&tmp, e, "failed to sync index snapshot"))?;
        }
    }

    fs::rename(&tmp, path)
        .map_err(|e| BlobError::io_at(path, e, "failed to rename index snapshot into place"))?;

    debug!(path = %path.display(), keys = index.len(), "index snapshot saved");
    Ok(())
}

/// Load the snapshot at `path`, skipping entries already expired at `now`.
/// A missing file is an empty index; a truncated one is corruption.
pub fn load(path: &Path, now: u32) -> BlobResult<HashMap<String, IndexEntry>> {
    let mut file = match File::open(path) {
        Ok(file) => file,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(HashMap::new()),
        Err(e) => return Err(BlobError::io_at(path, e, "failed to open index file")),
    };

    let mut buf = Vec::new();
    file.read_to_end(&mut buf)
        .map_err(|e| BlobError::io_at(path, e, "failed to read index file"))?;

    let mut index = HashMap::new();
    let mut offset = 0usize;
    let mut expired_skipped = 0usize;

    while offset < buf.len() {
        match format::parse_index_entry(&buf[offset..]) {
            Parse::Record { record: (key, entry), consumed } => {
                if entry.expires != 0 && entry.expires <= now {
                    expired_skipped += 1;
                } else {
                    index.insert(key, entry);
                }
                offset += consumed;
            }
            Parse::Incomplete => {
                return Err(BlobError::Corrupt {
                    path: path.to_path_buf(),
                    offset: offset as u64,
                    reason: "truncated index entry".to_string(),
                });
            }
            Parse::Malformed { reason } => {
                return Err(BlobError::Corrupt {
                    path: path.to_path_buf(),
                    offset: offset as u64,
                    reason,
                });
            }
        }
    }

    debug!(
        path = %path.display(),
        keys = index.len(),
        expired_skipped,
        "index snapshot loaded"
    );
    Ok(index)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn index_path(dir: &TempDir) -> PathBuf {
        dir.path().join("cache.index.bin")
    }

    fn entry(start: u64, expires: u32) -> IndexEntry {
        IndexEntry { start, length: 42, expires }
    }

    #[test]
    fn test_save_load_roundtrip() {
        let dir = TempDir::new().unwrap();
        let path = index_path(&dir);

        let mut index = HashMap::new();
        index.insert("alpha".to_string(), entry(18, 0));
        index.insert("beta".to_string(), entry(60, 9_999_999));
        save(&path, &index, false).unwrap();

        let loaded = load(&path, 1000).unwrap();
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded["alpha"], entry(18, 0));
        assert_eq!(loaded["beta"], entry(60, 9_999_999));
    }

    #[test]
    fn test_missing_file_loads_empty() {
        let dir = TempDir::new().unwrap();
        let loaded = load(&index_path(&dir), 1000).unwrap();
        assert!(loaded.is_empty());
    }

    #[test]
    fn test_load_skips_expired() {
        let dir = TempDir::new().unwrap();
        let path = index_path(&dir);

        let mut index = HashMap::new();
        index.insert("dead".to_string(), entry(18, 500));
        index.insert("live".to_string(), entry(60, 2000));
        index.insert("forever".to_string(), entry(102, 0));
        save(&path, &index, false).unwrap();

        let loaded = load(&path, 1000).unwrap();
        assert_eq!(loaded.len(), 2);
        assert!(loaded.contains_key("live"));
        assert!(loaded.contains_key("forever"));
    }

    #[test]
    fn test_save_replaces_previous_snapshot() {
        let dir = TempDir::new().unwrap();
        let path = index_path(&dir);

        let mut index = HashMap::new();
        index.insert("old".to_string(), entry(18, 0));
        save(&path, &index, false).unwrap();

        index.clear();
        index.insert("new".to_string(), entry(60, 0));
        save(&path, &index, false).unwrap();

        let loaded = load(&path, 1000).unwrap();
        assert_eq!(loaded.len(), 1);
        assert!(loaded.contains_key("new"));
    }

    #[test]
    fn test_no_temp_file_left_behind() {
        let dir = TempDir::new().unwrap();
        let path = index_path(&dir);

        let mut index = HashMap::new();
        index.insert("k".to_string(), entry(18, 0));
        save(&path, &index, false).unwrap();

        assert!(!temp_path(&path).exists());
    }

    #[test]
    fn test_truncated_snapshot_is_corrupt() {
        let dir = TempDir::new().unwrap();
        let path = index_path(&dir);

        let mut index = HashMap::new();
        index.insert("victim".to_string(), entry(18, 0));
        save(&path, &index, false).unwrap();

        let bytes = std::fs::read(&path).unwrap();
        std::fs::write(&path, &bytes[..bytes.len() - 3]).unwrap();

        assert!(matches!(load(&path, 1000), Err(BlobError::Corrupt { .. })));
    }

    #[test]
    fn test_empty_index_saves_empty_file() {
        let dir = TempDir::new().unwrap();
        let path = index_path(&dir);

        save(&path, &HashMap::new(), false).unwrap();
        assert_eq!(std::fs::metadata(&path).unwrap().len(), 0);
        assert!(load(&path, 1000).unwrap().is_empty());
    }
}
