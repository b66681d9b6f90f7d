//! Blob file I/O
//!
//! The blob file is the append-only home of every value ever written:
//! an 18-byte ASCII header followed by frames of
//! `flag + payload_length + compressed payload`. Frames are never rewritten
//! in place; stale ones become dead bytes until vacuum rebuilds the file.
//!
//! `BlobWriter` owns the append descriptor and the advisory lock that makes
//! this cache single-writer across processes. `BlobReader` is an independent
//! read-only descriptor on the same file, so reads never disturb the append
//! position.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use crate::error::{BlobError, BlobResult};
use crate::format::{
    FrameHeader, BLOB_HEADER, BLOB_HEADER_LEN, FLAG_BYTES, FLAG_STRUCTURED, FRAME_HEADER_LEN,
};
use crate::platform_fs;

/// Append handle for the blob file. Holds the writer lock for its lifetime.
pub struct BlobWriter {
    file: File,
    path: PathBuf,
    /// Current file size in bytes (tracked to avoid stat calls)
    size: u64,
    durable: bool,
}

impl BlobWriter {
    /// Open or create the blob file for appending and take the exclusive
    /// advisory lock. Fails with `Locked` when another process holds it.
    /// A freshly created (zero-length) file gets the header written.
    pub fn open(path: &Path, durable: bool) -> BlobResult<Self> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(|e| BlobError::io_at(path, e, "failed to open blob file"))?;

        match platform_fs::try_lock_exclusive(&file) {
            Ok(true) => {}
            Ok(false) => return Err(BlobError::Locked { path: path.to_path_buf() }),
            Err(e) => return Err(BlobError::io_at(path, e, "failed to lock blob file")),
        }

        let size = file
            .metadata()
            .map_err(|e| BlobError::io_at(path, e, "failed to stat blob file"))?
            .len();

        let mut writer = Self { file, path: path.to_path_buf(), size, durable };
        if writer.size == 0 {
            writer.write_header()?;
        }
        Ok(writer)
    }

    fn write_header(&mut self) -> BlobResult<()> {
        self.file
            .write_all(BLOB_HEADER)
            .map_err(|e| BlobError::io_at(&self.path, e, "failed to write blob header"))?;
        self.size = BLOB_HEADER_LEN;
        Ok(())
    }

    /// Append one frame. Returns `(start, total_length)` where `start` is
    /// the offset of the flag byte and `total_length` covers the whole frame.
    pub fn append_frame(&mut self, flag: u8, payload: &[u8]) -> BlobResult<(u64, u32)> {
        if payload.len() > (u32::MAX as usize) - FRAME_HEADER_LEN {
            return Err(BlobError::BadValue {
                reason: format!("compressed payload of {} bytes exceeds the frame format", payload.len()),
            });
        }

        let start = self.size;
        let header = FrameHeader { flag, payload_len: payload.len() as u32 };

        self.file
            .write_all(&header.to_bytes())
            .map_err(|e| BlobError::io_at(&self.path, e, "failed to write frame header"))?;
        self.file
            .write_all(payload)
            .map_err(|e| BlobError::io_at(&self.path, e, "failed to write frame payload"))?;

        if self.durable {
            platform_fs::durable_sync(&self.file)
                .map_err(|e| BlobError::io_at(&self.path, e, "failed to sync blob file"))?;
        }

        let total = FRAME_HEADER_LEN as u32 + payload.len() as u32;
        self.size += total as u64;
        Ok((start, total))
    }

    /// Current blob size in bytes, header included.
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Release the advisory lock. The descriptor itself drops with `self`.
    pub fn unlock(&self) -> BlobResult<()> {
        platform_fs::unlock(&self.file)
            .map_err(|e| BlobError::io_at(&self.path, e, "failed to unlock blob file"))
    }
}

/// Read-only handle for the blob file.
pub struct BlobReader {
    file: File,
    path: PathBuf,
}

impl BlobReader {
    /// Open a read-only descriptor on the blob file.
    pub fn open(path: &Path) -> BlobResult<Self> {
        let file = File::open(path)
            .map_err(|e| BlobError::io_at(path, e, "failed to open blob file for reading"))?;
        Ok(Self { file, path: path.to_path_buf() })
    }

    /// Check that the file opens with the expected header sentinel.
    pub fn verify_header(&mut self) -> BlobResult<()> {
        let mut sentinel = [0u8; BLOB_HEADER_LEN as usize];
        self.file.seek(SeekFrom::Start(0)).map_err(BlobError::from)?;
        self.read_exact_at(&mut sentinel, 0)?;
        if sentinel != *BLOB_HEADER {
            return Err(BlobError::Corrupt {
                path: self.path.clone(),
                offset: 0,
                reason: "blob header sentinel mismatch".to_string(),
            });
        }
        Ok(())
    }

    /// Read and open the frame recorded at `(start, length)`.
    ///
    /// Returns the flag byte and the still-compressed payload. The header's
    /// implied frame size must agree with the index entry's `length`.
    pub fn read_frame(&mut self, start: u64, length: u32) -> BlobResult<(u8, Vec<u8>)> {
        self.file.seek(SeekFrom::Start(start)).map_err(BlobError::from)?;

        let mut header_buf = [0u8; FRAME_HEADER_LEN];
        self.read_exact_at(&mut header_buf, start)?;
        let header = FrameHeader::from_bytes(&header_buf);

        if header.flag != FLAG_BYTES && header.flag != FLAG_STRUCTURED {
            return Err(BlobError::Corrupt {
                path: self.path.clone(),
                offset: start,
                reason: format!("invalid frame flag {}", header.flag),
            });
        }
        if header.frame_len() != length as u64 {
            return Err(BlobError::Corrupt {
                path: self.path.clone(),
                offset: start,
                reason: format!(
                    "frame length mismatch: header implies {}, index records {}",
                    header.frame_len(),
                    length
                ),
            });
        }

        let mut payload = vec![0u8; header.payload_len as usize];
        self.read_exact_at(&mut payload, start + FRAME_HEADER_LEN as u64)?;
        Ok((header.flag, payload))
    }

    /// Read `length` raw bytes at `start` without interpreting them.
    /// Vacuum uses this to copy whole frames untouched.
    pub fn read_raw(&mut self, start: u64, length: u32) -> BlobResult<Vec<u8>> {
        self.file.seek(SeekFrom::Start(start)).map_err(BlobError::from)?;
        let mut buf = vec![0u8; length as usize];
        self.read_exact_at(&mut buf, start)?;
        Ok(buf)
    }

    /// read_exact with short reads reported as corruption at `offset`.
    fn read_exact_at(&mut self, buf: &mut [u8], offset: u64) -> BlobResult<()> {
        self.file.read_exact(buf).map_err(|e| {
            if e.kind() == std::io::ErrorKind::UnexpectedEof {
                BlobError::Corrupt {
                    path: self.path.clone(),
                    offset,
                    reason: format!("short read: wanted {} bytes", buf.len()),
                }
            } else {
                BlobError::io_at(&self.path, e, "failed to read blob file")
            }
        })
    }
}
