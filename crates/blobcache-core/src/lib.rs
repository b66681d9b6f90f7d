//! blobcache-core — Embedded Persistent Key-Value Cache
//!
//! A single-process cache that keeps every value in one append-only blob
//! file, the key index in memory (mirrored by a compact snapshot file), and
//! a write-ahead log that makes index updates crash-safe between snapshots.
//!
//! # Architecture
//!
//! - **Write path**: encode → compress (zlib) → append frame to the blob →
//!   WAL record → in-memory index
//! - **Read path**: index lookup → expiry check → seek → decompress → decode
//! - **Recovery**: on open, the index snapshot is overlaid with the WAL in
//!   file order; torn WAL tails from a crash are dropped silently
//! - **Vacuum**: rewrites the blob with only live frames to reclaim the dead
//!   bytes that appends and overwrites leave behind
//!
//! # Single Writer
//!
//! An advisory whole-file lock on the blob file keeps the cache
//! single-writer across processes: a second open fails fast with
//! [`BlobError::Locked`]. Within a process the engine is a plain value —
//! mutations take `&mut self` and there are no internal locks.
//!
//! # Example
//!
//! ```no_run
//! use blobcache_core::{BlobCache, Config, Value};
//!
//! # fn main() -> blobcache_core::BlobResult<()> {
//! let mut cache = BlobCache::open("./app_cache", Config::default())?;
//!
//! cache.set("greeting", "hello", None)?;
//! cache.set("attempts", 3i64, Some(60))?;
//!
//! assert_eq!(cache.get("attempts")?, Value::Int(3));
//!
//! cache.close()?;
//! # Ok(())
//! # }
//! ```

pub mod blobfile;
pub mod compress;
pub mod config;
pub mod engine;
pub mod error;
pub mod format;
pub mod index;
pub mod platform_fs;
pub mod value;
pub mod wal;

// Re-export key types for convenience
pub use config::Config;
pub use engine::{BlobCache, Stats};
pub use error::{BlobError, BlobResult};
pub use format::IndexEntry;
pub use value::Value;
