//! Integration tests: the full cache lifecycle through the public API.
//!
//! These exercise the open -> mutate -> crash/close -> reopen pipeline on
//! real files, including the mixed-type workload, TTL expiry over wall-clock
//! time, refresh-on-miss, fragmentation and vacuum, and WAL crash recovery.

use std::collections::BTreeMap;
use std::time::Duration;

use tempfile::TempDir;

use blobcache_core::{BlobCache, BlobError, Config, Value};

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn test_cache() -> (BlobCache, TempDir) {
    let dir = TempDir::new().unwrap();
    let cache = BlobCache::open(dir.path().join("cache"), Config::default()).unwrap();
    (cache, dir)
}

fn base_path(dir: &TempDir) -> std::path::PathBuf {
    dir.path().join("cache")
}

// ---------------------------------------------------------------------------
// Mixed-type workload
// ---------------------------------------------------------------------------

#[test]
fn test_all_value_types_roundtrip() {
    let (mut cache, _dir) = test_cache();

    let one_megabyte_a = "a".repeat(1_048_576);
    let binary: Vec<u8> = (0u8..=255).collect();
    let mut dict = BTreeMap::new();
    dict.insert("a".to_string(), Value::Int(1));
    dict.insert("b".to_string(), Value::Int(2));

    let fixtures: Vec<(&str, Value)> = vec![
        ("string", Value::from("value1")),
        ("int", Value::Int(1)),
        ("float", Value::Float(1.1)),
        ("dict", Value::Map(dict)),
        ("list", Value::List(vec![Value::Int(1), Value::Int(2), Value::Int(3)])),
        ("bytes", Value::Bytes(b"value1".to_vec())),
        ("bool", Value::Bool(true)),
        ("string_1M", Value::from(one_megabyte_a.clone())),
        ("binary", Value::Bytes(binary.clone())),
        ("mb_string1", Value::from("漢字はユニコード")),
        ("mb_string2", Value::from("X生")),
    ];

    for (key, value) in &fixtures {
        cache.set(key, value.clone(), None).unwrap();
    }
    for (key, value) in &fixtures {
        assert_eq!(&cache.get(key).unwrap(), value, "mismatch for key `{}`", key);
    }

    // and again from disk, with nothing cached in memory but the index
    cache.close().unwrap();
}

#[test]
fn test_types_survive_reopen() {
    let dir = TempDir::new().unwrap();
    let base = base_path(&dir);

    {
        let mut cache = BlobCache::open(&base, Config::default()).unwrap();
        cache.set("int", 42i64, None).unwrap();
        cache.set("text", "persisted", None).unwrap();
        cache.set("raw", vec![0u8, 159, 146, 150], None).unwrap();
        cache.close().unwrap();
    }

    let mut cache = BlobCache::open(&base, Config::default()).unwrap();
    assert_eq!(cache.get("int").unwrap(), Value::Int(42));
    assert_eq!(cache.get("text").unwrap(), Value::String("persisted".to_string()));
    assert_eq!(cache.get("raw").unwrap(), Value::Bytes(vec![0u8, 159, 146, 150]));
}

#[test]
fn test_empty_value_roundtrips() {
    let (mut cache, _dir) = test_cache();

    cache.set("empty_string", "", None).unwrap();
    cache.set("empty_bytes", Vec::<u8>::new(), None).unwrap();

    assert_eq!(cache.get("empty_string").unwrap(), Value::Bytes(Vec::new()));
    assert_eq!(cache.get("empty_bytes").unwrap(), Value::Bytes(Vec::new()));
}

#[test]
fn test_every_single_byte_value_roundtrips() {
    let (mut cache, _dir) = test_cache();

    for byte in 0u8..=255 {
        cache.set(&format!("b{}", byte), vec![byte], None).unwrap();
    }
    for byte in 0u8..=255 {
        assert_eq!(
            cache.get(&format!("b{}", byte)).unwrap(),
            Value::Bytes(vec![byte]),
            "byte 0x{:02x}",
            byte
        );
    }
}

#[test]
fn test_overwrite_never_returns_preimage() {
    let (mut cache, _dir) = test_cache();

    cache.set("k", b"version_one".as_slice(), None).unwrap();
    cache.set("k", b"version_two".as_slice(), None).unwrap();

    for _ in 0..3 {
        assert_eq!(cache.get("k").unwrap(), Value::Bytes(b"version_two".to_vec()));
    }
}

// ---------------------------------------------------------------------------
// TTL
// ---------------------------------------------------------------------------

#[test]
fn test_ttl_transitions_at_boundary() {
    let (mut cache, _dir) = test_cache();
    cache.set("k", "v", Some(2)).unwrap();

    // well before the boundary
    assert!(cache.has("k").unwrap());
    std::thread::sleep(Duration::from_millis(1000));
    assert!(cache.has("k").unwrap());

    // well after the boundary (strictly past expires)
    std::thread::sleep(Duration::from_millis(2200));
    assert!(!cache.has("k").unwrap());
    assert!(matches!(cache.get("k"), Err(BlobError::NotFound { .. })));
}

#[test]
fn test_refresh_on_miss() {
    let (mut cache, _dir) = test_cache();

    for _ in 0..3 {
        let got = cache
            .get_or_refresh("r", |_| Value::from("value_new_20"), Some(20))
            .unwrap();
        assert_eq!(got, Value::String("value_new_20".to_string()));
    }

    let remaining = cache.when_expired("r", true).unwrap();
    assert!(remaining > 0 && remaining <= 20, "remaining = {}", remaining);
}

#[test]
fn test_expired_key_refreshes() {
    let (mut cache, _dir) = test_cache();
    cache.set("k", "stale", Some(1)).unwrap();

    std::thread::sleep(Duration::from_millis(2100));
    assert!(!cache.has("k").unwrap());

    let got = cache.get_or_refresh("k", |_| Value::from("fresh"), None).unwrap();
    assert_eq!(got.as_bytes().unwrap(), b"fresh");
    assert!(cache.has("k").unwrap());
}

// ---------------------------------------------------------------------------
// Delete
// ---------------------------------------------------------------------------

#[test]
fn test_set_has_delete_has() {
    let (mut cache, _dir) = test_cache();

    cache.set("d", "x", None).unwrap();
    assert!(cache.has("d").unwrap());
    cache.delete("d").unwrap();
    assert!(!cache.has("d").unwrap());
}

#[test]
fn test_prefix_delete_removes_exactly_the_prefixed_subset() {
    let (mut cache, _dir) = test_cache();

    let prefixed = ["p:1", "p:2", "p:33", "p:"];
    let untouched = ["q:1", "other", "P:upper", "p"];
    for key in prefixed.iter().chain(&untouched) {
        cache.set(key, b"v".as_slice(), None).unwrap();
    }

    cache.delete_starts_with("p:").unwrap();

    for key in &prefixed {
        assert!(!cache.has(key).unwrap(), "`{}` should be gone", key);
    }
    for key in &untouched {
        assert!(cache.has(key).unwrap(), "`{}` should remain", key);
    }
}

// ---------------------------------------------------------------------------
// Fragmentation and vacuum
// ---------------------------------------------------------------------------

#[test]
fn test_churn_then_vacuum_packs_file() {
    let dir = TempDir::new().unwrap();
    let mut cache = BlobCache::open(base_path(&dir), Config::no_auto_vacuum()).unwrap();

    // 100 overwrites of one key with distinct 10 KiB values
    let mut last = Vec::new();
    for i in 0..100u32 {
        last = format!("{:08}", i).into_bytes().repeat(1280);
        cache.set("k", last.clone(), None).unwrap();
    }

    let ratio = cache.fragmentation_ratio().unwrap();
    assert!(ratio > 0.98, "ratio = {}", ratio);

    cache.vacuum().unwrap();

    assert_eq!(cache.fragmentation_ratio().unwrap(), 0.0);
    assert_eq!(cache.get("k").unwrap(), Value::Bytes(last));
}

#[test]
fn test_post_vacuum_identity() {
    let dir = TempDir::new().unwrap();
    let mut cache = BlobCache::open(base_path(&dir), Config::no_auto_vacuum()).unwrap();

    cache.set("a", "alpha", None).unwrap();
    cache.set("b", 17i64, Some(3600)).unwrap();
    cache.set("c", Value::List(vec![Value::Bool(false)]), None).unwrap();
    cache.set("doomed", "bytes to reclaim", None).unwrap();
    cache.delete("doomed").unwrap();

    let before: Vec<(String, Value)> = {
        let mut keys = cache.keys().unwrap();
        keys.sort();
        keys.into_iter()
            .map(|k| {
                let v = cache.get(&k).unwrap();
                (k, v)
            })
            .collect()
    };

    cache.vacuum().unwrap();

    for (key, value) in &before {
        assert_eq!(&cache.get(key).unwrap(), value, "`{}` changed across vacuum", key);
    }
    // TTL metadata survives too
    assert!(cache.when_expired("b", true).unwrap() > 0);
}

#[test]
fn test_fragmentation_stays_in_bounds() {
    let (mut cache, _dir) = test_cache();

    assert_eq!(cache.fragmentation_ratio().unwrap(), 1.0);
    for i in 0..50 {
        cache.set(&format!("k{}", i % 7), format!("value {}", i), None).unwrap();
        let ratio = cache.fragmentation_ratio().unwrap();
        assert!((0.0..=1.0).contains(&ratio), "ratio = {}", ratio);
    }
}

// ---------------------------------------------------------------------------
// Crash recovery
// ---------------------------------------------------------------------------

#[test]
fn test_crash_recovery_restores_wal_state() {
    let dir = TempDir::new().unwrap();
    let base = base_path(&dir);

    {
        let mut cache = BlobCache::open(&base, Config::default()).unwrap();
        cache.set("a", 1i64, None).unwrap();
        cache.set("b", 2i64, None).unwrap();
        cache.delete("a").unwrap();
        // crash: drop without close
    }

    let mut cache = BlobCache::open(&base, Config::default()).unwrap();
    assert!(!cache.has("a").unwrap());
    assert_eq!(cache.get("b").unwrap(), Value::Int(2));
}

#[test]
fn test_torn_wal_tail_preserves_previous_state() {
    let dir = TempDir::new().unwrap();
    let base = base_path(&dir);

    {
        let mut cache = BlobCache::open(&base, Config::default()).unwrap();
        cache.set("safe", "committed", None).unwrap();
        // crash without close
    }

    // Simulate a record torn mid-key by the crash: declares a 64-byte key
    // but the file ends after 3 bytes of it.
    let wal_path = {
        let mut name = base.as_os_str().to_os_string();
        name.push(".wal.bin");
        std::path::PathBuf::from(name)
    };
    let mut bytes = std::fs::read(&wal_path).unwrap();
    bytes.extend_from_slice(&64u32.to_le_bytes());
    bytes.extend_from_slice(b"tor");
    std::fs::write(&wal_path, bytes).unwrap();

    let mut cache = BlobCache::open(&base, Config::default()).unwrap();
    assert_eq!(cache.get("safe").unwrap().as_bytes().unwrap(), b"committed");
    assert_eq!(cache.keys().unwrap().len(), 1);
}

#[test]
fn test_uncommitted_frames_are_reclaimed_by_vacuum() {
    let dir = TempDir::new().unwrap();
    let base = base_path(&dir);

    {
        let mut cache = BlobCache::open(&base, Config::default()).unwrap();
        cache.set("kept", "value", None).unwrap();
        cache.set("lost", "value", None).unwrap();
        // crash without close
    }

    // Tear the second WAL record: its frame stays in the blob, but the
    // entry must never become visible. Both keys are 4 bytes, so each
    // upsert record is 4 (key_len) + 4 (key) + 1 (op) + 16 (entry) bytes.
    let wal_path = {
        let mut name = base.as_os_str().to_os_string();
        name.push(".wal.bin");
        std::path::PathBuf::from(name)
    };
    let bytes = std::fs::read(&wal_path).unwrap();
    assert_eq!(bytes.len(), 50);
    std::fs::write(&wal_path, &bytes[..30]).unwrap();

    let mut cache = BlobCache::open(&base, Config::no_auto_vacuum()).unwrap();
    assert!(cache.has("kept").unwrap());
    assert!(!cache.has("lost").unwrap());

    // the orphaned frame is dead bytes until vacuum rewrites the blob
    let before = cache.get_stats().unwrap().data_file_size_bytes;
    cache.vacuum().unwrap();
    let after = cache.get_stats().unwrap().data_file_size_bytes;
    assert!(after < before);
    assert_eq!(cache.get("kept").unwrap().as_bytes().unwrap(), b"value");
}

// ---------------------------------------------------------------------------
// Locking
// ---------------------------------------------------------------------------

#[cfg(unix)]
#[test]
fn test_single_writer_exclusion() {
    let dir = TempDir::new().unwrap();
    let base = base_path(&dir);

    let mut first = BlobCache::open(&base, Config::default()).unwrap();
    assert!(matches!(
        BlobCache::open(&base, Config::default()),
        Err(BlobError::Locked { .. })
    ));

    // the lock is released by close, after which a new opener succeeds
    first.close().unwrap();
    let _second = BlobCache::open(&base, Config::default()).unwrap();
}

// ---------------------------------------------------------------------------
// Stats
// ---------------------------------------------------------------------------

#[test]
fn test_stats_count_operations() {
    let (mut cache, _dir) = test_cache();

    cache.set("a", "1", None).unwrap();
    cache.set("b", "2", None).unwrap();
    cache.get("a").unwrap();
    cache.get("a").unwrap();
    let _ = cache.get("missing");
    cache.delete("b").unwrap();
    cache.get_or_refresh("c", |_| Value::from("v"), None).unwrap();

    let stats = cache.get_stats().unwrap();
    assert_eq!(stats.sets, 3); // a, b, and the refresh-store of c
    assert_eq!(stats.hits, 2);
    assert_eq!(stats.misses, 2); // "missing" and the first touch of c
    assert_eq!(stats.deletes, 1);
    assert_eq!(stats.refreshes, 1);
    assert_eq!(stats.total_keys, 2);
    assert!(stats.data_file_size_bytes > 0);
}
