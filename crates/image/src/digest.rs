//! SHA-256 content digests in OCI `sha256:<hex>` form

use crate::error::ImageError;
use crate::Result;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest as _, Sha256};
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;

/// Algorithm prefix used in the textual form
pub const ALGORITHM: &str = "sha256";

/// A SHA-256 digest (32 bytes)
#[derive(Copy, Clone, Hash, Eq, PartialEq, Ord, PartialOrd)]
pub struct Digest([u8; 32]);

impl Digest {
    /// Create a digest from raw bytes
    pub const fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Lowercase hex without the algorithm prefix
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Parse bare hex (64 characters)
    pub fn from_hex(s: &str) -> Result<Self> {
        if s.len() != 64 {
            return Err(ImageError::Format(format!(
                "invalid digest length: expected 64 hex characters, got {}",
                s.len()
            )));
        }
        let mut bytes = [0u8; 32];
        hex::decode_to_slice(s, &mut bytes)
            .map_err(|e| ImageError::Format(format!("invalid digest {:?}: {}", s, e)))?;
        Ok(Self(bytes))
    }

    /// Parse the `sha256:<hex>` form
    pub fn parse(s: &str) -> Result<Self> {
        match s.split_once(':') {
            Some((ALGORITHM, hex)) => Self::from_hex(hex),
            _ => Err(ImageError::Format(format!(
                "unsupported digest {:?}: expected {}:<hex>",
                s, ALGORITHM
            ))),
        }
    }
}

impl std::fmt::Debug for Digest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Digest({}:{})", ALGORITHM, self.to_hex())
    }
}

impl std::fmt::Display for Digest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", ALGORITHM, self.to_hex())
    }
}

impl std::str::FromStr for Digest {
    type Err = ImageError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl Serialize for Digest {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Digest {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Self::parse(&s).map_err(serde::de::Error::custom)
    }
}

/// Digest a byte slice
pub fn digest_bytes(data: &[u8]) -> Digest {
    Digest::from_bytes(Sha256::digest(data).into())
}

/// Digest a file by streaming it
pub fn digest_file(path: &Path) -> Result<Digest> {
    let file = File::open(path)?;
    let mut reader = BufReader::new(file);
    let mut hasher = DigestWriter::new();

    let mut buffer = [0u8; 8192];
    loop {
        let bytes_read = reader.read(&mut buffer)?;
        if bytes_read == 0 {
            break;
        }
        hasher.update(&buffer[..bytes_read]);
    }

    Ok(hasher.finalize())
}

/// Incremental digest across multiple chunks
pub struct DigestWriter {
    inner: Sha256,
    len: u64,
}

impl DigestWriter {
    pub fn new() -> Self {
        Self {
            inner: Sha256::new(),
            len: 0,
        }
    }

    pub fn update(&mut self, data: &[u8]) {
        self.inner.update(data);
        self.len += data.len() as u64;
    }

    /// Number of bytes fed so far
    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn finalize(self) -> Digest {
        Digest::from_bytes(self.inner.finalize().into())
    }
}

impl Default for DigestWriter {
    fn default() -> Self {
        Self::new()
    }
}

impl std::io::Write for DigestWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.update(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_known_value() {
        assert_eq!(
            digest_bytes(b"").to_string(),
            "sha256:e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[test]
    fn test_text_form_roundtrip() {
        let d = digest_bytes(b"hello world");
        let parsed: Digest = d.to_string().parse().unwrap();
        assert_eq!(parsed, d);
    }

    #[test]
    fn test_rejects_other_forms() {
        let hex = digest_bytes(b"x").to_hex();
        assert!(Digest::parse(&hex).is_err());
        assert!(Digest::parse(&format!("sha512:{}", hex)).is_err());
        assert!(Digest::parse("sha256:abc").is_err());
        assert!(Digest::from_hex(&"g".repeat(64)).is_err());
    }

    #[test]
    fn test_serde_uses_text_form() {
        let d = digest_bytes(b"abc");
        let json = serde_json::to_string(&d).unwrap();
        assert_eq!(json, format!("\"{}\"", d));
        let back: Digest = serde_json::from_str(&json).unwrap();
        assert_eq!(back, d);
    }

    #[test]
    fn test_incremental_matches_direct() {
        let mut w = DigestWriter::new();
        w.update(b"hello ");
        w.update(b"world");
        assert_eq!(w.len(), 11);
        assert_eq!(w.finalize(), digest_bytes(b"hello world"));
    }

    #[test]
    fn test_digest_file() -> Result<()> {
        let temp_dir = tempfile::tempdir()?;
        let file_path = temp_dir.path().join("test.txt");
        std::fs::write(&file_path, b"test file content")?;
        assert_eq!(digest_file(&file_path)?, digest_bytes(b"test file content"));
        Ok(())
    }
}
