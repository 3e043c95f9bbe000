//! Binary delta stream: header, compression envelope and diff/patch
//!
//! Stream layout:
//!
//! ```text
//! [new_len: u64 big-endian][mode: u8][compressed control-block body]
//! ```
//!
//! The body is the classic bsdiff interleaving of control triples
//! `(add_len, insert_len, old_seek)` each followed by `add_len` add bytes and
//! `insert_len` insert bytes.

use crate::block::{decode_blocks, encode_blocks, DiffBlock};
use crate::compression::CompressionMode;
use crate::error::DeltaError;
use crate::Result;
use tracing::debug;

/// Size of the fixed stream header
pub const HEADER_LEN: usize = 9;

/// Fixed header at the front of every delta stream
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeltaHeader {
    /// Length of the sequence the delta reconstructs
    pub new_len: u64,
    pub mode: CompressionMode,
}

impl DeltaHeader {
    pub fn to_bytes(&self) -> [u8; HEADER_LEN] {
        let mut buf = [0u8; HEADER_LEN];
        buf[..8].copy_from_slice(&self.new_len.to_be_bytes());
        buf[8] = self.mode.as_u8();
        buf
    }

    /// Split a stream into its header and compressed body
    pub fn parse(stream: &[u8]) -> Result<(Self, &[u8])> {
        if stream.len() < HEADER_LEN {
            return Err(DeltaError::Format(format!(
                "delta header needs {} bytes, stream has {}",
                HEADER_LEN,
                stream.len()
            )));
        }
        let mut len_bytes = [0u8; 8];
        len_bytes.copy_from_slice(&stream[..8]);
        let header = DeltaHeader {
            new_len: u64::from_be_bytes(len_bytes),
            mode: CompressionMode::from_u8(stream[8])?,
        };
        Ok((header, &stream[HEADER_LEN..]))
    }
}

/// A fully decoded delta stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeltaStream {
    pub header: DeltaHeader,
    pub blocks: Vec<DiffBlock>,
}

impl DeltaStream {
    /// Decode header, envelope and control blocks
    pub fn decode(stream: &[u8]) -> Result<Self> {
        let (header, compressed) = DeltaHeader::parse(stream)?;
        let body = header.mode.decompress(compressed)?;
        let blocks = decode_blocks(header.new_len, &body)?;
        Ok(Self { header, blocks })
    }

    /// Encode back into a complete stream
    pub fn encode(&self) -> Result<Vec<u8>> {
        let body = encode_blocks(&self.blocks)?;
        let compressed = self.header.mode.compress(&body)?;
        let mut out = Vec::with_capacity(HEADER_LEN + compressed.len());
        out.extend_from_slice(&self.header.to_bytes());
        out.extend_from_slice(&compressed);
        Ok(out)
    }

    /// Rebuild the new sequence from `old`
    pub fn apply(&self, old: &[u8]) -> Vec<u8> {
        let mut out = vec![0u8; self.header.new_len as usize];
        for block in &self.blocks {
            let start = block.new_pos as usize;
            let bytes = block.apply(old);
            out[start..start + bytes.len()].copy_from_slice(&bytes);
        }
        out
    }
}

/// Produce a delta stream that turns `old` into `new`
pub fn diff(old: &[u8], new: &[u8], mode: CompressionMode) -> Result<Vec<u8>> {
    let mut body = Vec::new();
    bsdiff::diff(old, new, &mut body)?;
    let compressed = mode.compress(&body)?;

    let header = DeltaHeader {
        new_len: new.len() as u64,
        mode,
    };
    let mut out = Vec::with_capacity(HEADER_LEN + compressed.len());
    out.extend_from_slice(&header.to_bytes());
    out.extend_from_slice(&compressed);

    debug!(
        "diff old={} new={} body={} stream={} mode={}",
        old.len(),
        new.len(),
        body.len(),
        out.len(),
        mode
    );
    Ok(out)
}

/// Apply a delta stream to `old`
pub fn patch(old: &[u8], stream: &[u8]) -> Result<Vec<u8>> {
    let decoded = DeltaStream::decode(stream)?;
    Ok(decoded.apply(old))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    #[test]
    fn test_hello_world_to_hello_earth() {
        let old = b"hello world";
        let new = b"hello earth";
        let stream = diff(old, new, CompressionMode::Zstd).unwrap();
        assert_eq!(patch(old, &stream).unwrap(), new);

        let decoded = DeltaStream::decode(&stream).unwrap();
        assert_eq!(decoded.header.new_len, 11);
        let first = &decoded.blocks[0];
        assert_eq!(first.new_pos, 0);
        assert_eq!(first.old_pos, 0);
        assert!(first.add_bytes.len() >= 6);
        // The shared prefix sums against zero deltas
        assert!(first.add_bytes[..6].iter().all(|&b| b == 0));
    }

    #[test]
    fn test_round_trip_random() {
        let mut rng = StdRng::seed_from_u64(7);
        for mode in [CompressionMode::Zstd, CompressionMode::Bzip2] {
            let old: Vec<u8> = (0..4096).map(|_| rng.gen()).collect();
            let mut new = old.clone();
            for _ in 0..40 {
                let at = rng.gen_range(0..new.len());
                new[at] = rng.gen();
            }
            new.splice(100..100, (0..300).map(|_| rng.gen::<u8>()));
            new.truncate(3900);

            let stream = diff(&old, &new, mode).unwrap();
            assert_eq!(patch(&old, &stream).unwrap(), new);
        }
    }

    #[test]
    fn test_empty_sides() {
        let stream = diff(b"", b"fresh", CompressionMode::Zstd).unwrap();
        assert_eq!(patch(b"", &stream).unwrap(), b"fresh");

        let stream = diff(b"gone", b"", CompressionMode::Zstd).unwrap();
        assert_eq!(patch(b"gone", &stream).unwrap(), b"");
    }

    #[test]
    fn test_header_is_big_endian() {
        let header = DeltaHeader {
            new_len: 0x0102,
            mode: CompressionMode::Bzip2,
        };
        assert_eq!(header.to_bytes(), [0, 0, 0, 0, 0, 0, 1, 2, 1]);
    }

    #[test]
    fn test_short_header_is_format_error() {
        assert!(matches!(patch(b"", &[0, 0, 1]), Err(DeltaError::Format(_))));
    }

    #[test]
    fn test_unknown_mode_is_rejected() {
        let mut stream = diff(b"abc", b"abd", CompressionMode::Zstd).unwrap();
        stream[8] = 7;
        assert!(matches!(
            patch(b"abc", &stream),
            Err(DeltaError::InvalidCompressionMode(7))
        ));
    }

    #[test]
    fn test_declared_length_longer_than_body() {
        let mut stream = diff(b"abc", b"abd", CompressionMode::Zstd).unwrap();
        stream[..8].copy_from_slice(&100u64.to_be_bytes());
        assert!(matches!(
            patch(b"abc", &stream),
            Err(DeltaError::TruncatedStream { .. })
        ));
    }
}
