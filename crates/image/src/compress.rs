//! Body and header compression helpers

use crate::Result;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use std::io::{Read, Write};

/// zstd level for file bodies and headers
pub const ZSTD_LEVEL: i32 = 3;

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

pub fn zstd_compress(data: &[u8]) -> Result<Vec<u8>> {
    Ok(zstd::stream::encode_all(data, ZSTD_LEVEL)?)
}

pub fn zstd_decompress(data: &[u8]) -> Result<Vec<u8>> {
    Ok(zstd::stream::decode_all(data)?)
}

/// Whether `data` starts with the gzip magic
pub fn is_gzip(data: &[u8]) -> bool {
    data.starts_with(&GZIP_MAGIC)
}

pub fn gunzip(data: &[u8]) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    GzDecoder::new(data).read_to_end(&mut out)?;
    Ok(out)
}

pub fn gzip(data: &[u8]) -> Result<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::new(), flate2::Compression::default());
    encoder.write_all(data)?;
    Ok(encoder.finish()?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zstd_restores_input() {
        let data = b"abcabcabc".repeat(100);
        assert_eq!(zstd_decompress(&zstd_compress(&data).unwrap()).unwrap(), data);
    }

    #[test]
    fn test_gzip_detection() {
        let packed = gzip(b"payload").unwrap();
        assert!(is_gzip(&packed));
        assert!(!is_gzip(b"payload"));
        assert_eq!(gunzip(&packed).unwrap(), b"payload");
    }
}
