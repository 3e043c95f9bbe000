//! Sign-magnitude integer encoding used by bsdiff control triples
//!
//! Values are stored as 8 little-endian bytes holding the magnitude in the
//! low 63 bits, with bit 63 (the top bit of byte 7) set for negative values.
//! This is not two's complement; `-0` decodes to `0`.

use crate::error::DeltaError;
use crate::Result;
use std::io::{Read, Write};

/// Width of one encoded integer
pub const OFFT_LEN: usize = 8;

/// Encode an integer into its 8-byte wire form
pub fn encode(value: i64) -> [u8; OFFT_LEN] {
    let mut buf = value.unsigned_abs().to_le_bytes();
    if value < 0 {
        buf[7] |= 0x80;
    }
    buf
}

/// Decode an integer from its 8-byte wire form
pub fn decode(buf: [u8; OFFT_LEN]) -> i64 {
    let negative = buf[7] & 0x80 != 0;
    let mut magnitude = buf;
    magnitude[7] &= 0x7f;
    let value = u64::from_le_bytes(magnitude) as i64;
    if negative {
        -value
    } else {
        value
    }
}

/// Write one encoded integer
pub fn write_offt<W: Write + ?Sized>(writer: &mut W, value: i64) -> Result<()> {
    writer.write_all(&encode(value))?;
    Ok(())
}

/// Read one encoded integer, failing with `TruncatedStream` on a short read
pub fn read_offt<R: Read + ?Sized>(reader: &mut R) -> Result<i64> {
    let mut buf = [0u8; OFFT_LEN];
    read_full(reader, &mut buf)?;
    Ok(decode(buf))
}

/// Fill `buf` completely or report how many bytes were actually available
pub(crate) fn read_full<R: Read + ?Sized>(reader: &mut R, buf: &mut [u8]) -> Result<()> {
    let mut filled = 0usize;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => {
                return Err(DeltaError::TruncatedStream {
                    expected: buf.len() as u64,
                    actual: filled as u64,
                })
            }
            Ok(n) => filled += n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(DeltaError::from_read(e, buf.len() as u64, filled as u64)),
        }
    }
    Ok(())
}
