//! Binary format helpers for assignment files.
//!
//! Every persisted file is a single checksummed record:
//!
//! ```text
//! [checksum: u64][length: i32][payload: length bytes]
//! ```
//!
//! The checksum is a CRC32 of the payload, widened to 64 bits. All
//! multi-byte integers are big-endian.

use std::io::{self, Read, Write};

use crc32fast::Hasher;
use thiserror::Error;

/// Maximum payload length we'll allocate when reading a record.
/// Assignment tables for a realistic cluster are a few hundred KB at most;
/// a corrupt length prefix must not trigger a multi-gigabyte allocation.
pub const MAX_PAYLOAD_LEN: usize = 64 * 1024 * 1024;

/// Errors that can occur when reading or writing assignment files.
#[derive(Debug, Error)]
pub enum FormatError {
    #[error("unexpected end of file")]
    UnexpectedEof,

    #[error("checksum mismatch (expected {expected:#018x}, got {actual:#018x})")]
    ChecksumMismatch { expected: u64, actual: u64 },

    #[error("invalid data: {0}")]
    InvalidData(String),

    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

/// Computes the record checksum over a byte slice.
pub fn checksum(data: &[u8]) -> u64 {
    let mut h = Hasher::new();
    h.update(data);
    u64::from(h.finalize())
}

/// Writes a `u64` in big-endian.
pub fn write_u64(w: &mut impl Write, val: u64) -> io::Result<()> {
    w.write_all(&val.to_be_bytes())
}

/// Writes an `i32` in big-endian.
pub fn write_i32(w: &mut impl Write, val: i32) -> io::Result<()> {
    w.write_all(&val.to_be_bytes())
}

/// Reads a `u64` in big-endian.
pub fn read_u64(r: &mut impl Read) -> Result<u64, FormatError> {
    let mut buf = [0u8; 8];
    read_exact(r, &mut buf)?;
    Ok(u64::from_be_bytes(buf))
}

/// Reads an `i32` in big-endian.
pub fn read_i32(r: &mut impl Read) -> Result<i32, FormatError> {
    let mut buf = [0u8; 4];
    read_exact(r, &mut buf)?;
    Ok(i32::from_be_bytes(buf))
}

/// Writes one complete record: checksum, length and payload.
pub fn write_record(w: &mut impl Write, payload: &[u8]) -> io::Result<()> {
    let len = i32::try_from(payload.len()).map_err(|_| {
        io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("payload length {} exceeds i32::MAX", payload.len()),
        )
    })?;
    write_u64(w, checksum(payload))?;
    write_i32(w, len)?;
    w.write_all(payload)
}

/// Reads one record and verifies its checksum, returning the payload.
pub fn read_record(r: &mut impl Read) -> Result<Vec<u8>, FormatError> {
    let stored = read_u64(r)?;
    let len = read_i32(r)?;
    let len = usize::try_from(len)
        .map_err(|_| FormatError::InvalidData(format!("negative payload length {len}")))?;
    if len > MAX_PAYLOAD_LEN {
        return Err(FormatError::InvalidData(format!(
            "payload length {len} exceeds maximum of {MAX_PAYLOAD_LEN}"
        )));
    }
    let mut payload = vec![0u8; len];
    read_exact(r, &mut payload)?;
    verify_checksum(&payload, stored)?;
    Ok(payload)
}

/// Verifies that `data` matches the stored checksum.
pub fn verify_checksum(data: &[u8], stored: u64) -> Result<(), FormatError> {
    let actual = checksum(data);
    if actual != stored {
        return Err(FormatError::ChecksumMismatch {
            expected: stored,
            actual,
        });
    }
    Ok(())
}

/// Reads exactly `buf.len()` bytes, returning `UnexpectedEof` on short read.
fn read_exact(r: &mut impl Read, buf: &mut [u8]) -> Result<(), FormatError> {
    r.read_exact(buf).map_err(|e| {
        if e.kind() == io::ErrorKind::UnexpectedEof {
            FormatError::UnexpectedEof
        } else {
            FormatError::Io(e)
        }
    })
}
