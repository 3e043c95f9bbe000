//! Compression envelope for delta bodies

use crate::error::DeltaError;
use crate::Result;
use std::fmt;
use std::io::{Read, Write};
use std::str::FromStr;

/// zstd level used for delta bodies
const ZSTD_LEVEL: i32 = 3;

/// Compression applied to the control-block body of a delta stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(u8)]
pub enum CompressionMode {
    Bzip2 = 1,
    #[default]
    Zstd = 2,
}

impl CompressionMode {
    /// Wire byte for this mode
    pub fn as_u8(self) -> u8 {
        self as u8
    }

    /// Parse the wire byte
    pub fn from_u8(value: u8) -> Result<Self> {
        match value {
            1 => Ok(CompressionMode::Bzip2),
            2 => Ok(CompressionMode::Zstd),
            other => Err(DeltaError::InvalidCompressionMode(other)),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            CompressionMode::Bzip2 => "bzip2",
            CompressionMode::Zstd => "zstd",
        }
    }

    /// Compress a complete body
    pub fn compress(self, data: &[u8]) -> Result<Vec<u8>> {
        match self {
            CompressionMode::Bzip2 => {
                let mut encoder =
                    bzip2::write::BzEncoder::new(Vec::new(), bzip2::Compression::best());
                encoder.write_all(data)?;
                Ok(encoder.finish()?)
            }
            CompressionMode::Zstd => Ok(zstd::stream::encode_all(data, ZSTD_LEVEL)?),
        }
    }

    /// Decompress a complete body
    pub fn decompress(self, data: &[u8]) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        match self {
            CompressionMode::Bzip2 => {
                bzip2::read::BzDecoder::new(data).read_to_end(&mut out)?;
            }
            CompressionMode::Zstd => {
                zstd::stream::read::Decoder::new(data)?.read_to_end(&mut out)?;
            }
        }
        Ok(out)
    }
}

impl fmt::Display for CompressionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CompressionMode {
    type Err = DeltaError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "bzip2" => Ok(CompressionMode::Bzip2),
            "zstd" => Ok(CompressionMode::Zstd),
            other => Err(DeltaError::Format(format!(
                "unknown compression mode {:?}",
                other
            ))),
        }
    }
}
