//! Payload compression
//!
//! Every frame payload is a zlib-wrapped deflate stream at level 6, matching
//! the format the cache shares with its non-Rust consumers. Decompression
//! accepts any valid zlib stream regardless of the level it was produced at.

use std::io::{self, Read, Write};

use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;

/// Wire-format compression level. Fixed by the blob format, not configurable.
const LEVEL: u32 = 6;

/// Compress `data` into a zlib stream.
pub fn compress(data: &[u8]) -> io::Result<Vec<u8>> {
    let mut encoder = ZlibEncoder::new(Vec::with_capacity(data.len() / 2 + 16), Compression::new(LEVEL));
    encoder.write_all(data)?;
    encoder.finish()
}

/// Decompress a zlib stream back into the original bytes.
pub fn decompress(data: &[u8]) -> io::Result<Vec<u8>> {
    let mut decoder = ZlibDecoder::new(data);
    let mut out = Vec::with_capacity(data.len().saturating_mul(2));
    decoder.read_to_end(&mut out)?;
    Ok(out)
}
