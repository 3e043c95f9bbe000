//! Shared helpers for commands

use anyhow::{Context, Result};
use bsdiffx::CompressionMode;
use image::{open_image, DimgFile, Digest};
use std::path::Path;

pub fn parse_compression(s: &str) -> Result<CompressionMode> {
    s.parse::<CompressionMode>()
        .with_context(|| format!("Unknown compression mode '{}' (expected zstd or bzip2)", s))
}

/// Open a dimg or cdimg with a readable error
pub fn open(path: &Path) -> Result<DimgFile> {
    open_image(path).with_context(|| format!("Failed to open image {}", path.display()))
}

/// First 12 hex characters of a digest
pub fn short(digest: &Digest) -> String {
    digest.to_hex()[..12].to_string()
}

pub fn format_bytes(bytes: u64) -> String {
    if bytes == 0 {
        return "0 B".to_string();
    }

    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB"];
    let mut value = bytes as f64;
    let mut unit_idx = 0;

    while value >= 1024.0 && unit_idx < UNITS.len() - 1 {
        value /= 1024.0;
        unit_idx += 1;
    }

    if unit_idx == 0 {
        format!("{} {}", bytes, UNITS[unit_idx])
    } else {
        format!("{:.2} {}", value, UNITS[unit_idx])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(0), "0 B");
        assert_eq!(format_bytes(512), "512 B");
        assert_eq!(format_bytes(1536), "1.50 KB");
        assert_eq!(format_bytes(3 * 1024 * 1024), "3.00 MB");
    }

    #[test]
    fn test_short_digest() {
        let d = image::digest_bytes(b"abc");
        assert_eq!(short(&d).len(), 12);
        assert!(d.to_hex().starts_with(&short(&d)));
    }
}
