//! Cdimg container: a dimg wrapped with OCI image metadata
//!
//! Layout (little-endian):
//! ```text
//! [u32 head length]
//! [zstd-compressed JSON CdimgHead]
//! [configSize bytes: zstd-compressed OCI image config JSON]
//! [dimgSize bytes: a complete dimg]
//! ```

use crate::compress::{zstd_compress, zstd_decompress};
use crate::digest::{digest_bytes, Digest};
use crate::dimg::{map_file, read_prefixed, tmp_path, DimgFile, DimgHeader};
use crate::error::ImageError;
use crate::Result;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::fs::{self, File};
use std::io::Write;
use std::path::Path;
use tracing::debug;

pub const MEDIA_TYPE_MANIFEST: &str = "application/vnd.oci.image.manifest.v1+json";
pub const MEDIA_TYPE_CONFIG: &str = "application/vnd.oci.image.config.v1+json";
pub const MEDIA_TYPE_DIMG: &str = "application/vnd.d4c.dimg.v1";

/// Fixed-size summary in front of the config and dimg
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CdimgHead {
    /// Compressed config length
    pub config_size: u64,
    pub dimg_size: u64,
    /// Digest of the embedded dimg bytes
    pub dimg_digest: Digest,
}

/// OCI content descriptor
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Descriptor {
    pub media_type: String,
    pub digest: Digest,
    pub size: u64,
}

/// OCI image manifest with one dimg layer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Manifest {
    pub schema_version: u32,
    pub media_type: String,
    pub config: Descriptor,
    pub layers: Vec<Descriptor>,
}

/// Point the config's rootfs at a single dimg snapshot
fn bind_config(mut config: Value, dimg: &DimgHeader) -> Result<Value> {
    let obj = config
        .as_object_mut()
        .ok_or_else(|| ImageError::Format("image config is not a JSON object".to_string()))?;
    obj.insert(
        "rootfs".to_string(),
        json!({ "type": "layers", "diff_ids": [dimg.id.to_string()] }),
    );
    Ok(config)
}

/// Serialize a cdimg from an OCI config and complete dimg bytes
pub fn write_cdimg<W: Write + ?Sized>(config: &Value, dimg: &[u8], out: &mut W) -> Result<u64> {
    let (dimg_header, _) = DimgHeader::decode(dimg)?;
    let config = bind_config(config.clone(), &dimg_header)?;
    let config_compressed = zstd_compress(&serde_json::to_vec(&config)?)?;

    let head = CdimgHead {
        config_size: config_compressed.len() as u64,
        dimg_size: dimg.len() as u64,
        dimg_digest: digest_bytes(dimg),
    };
    let head_compressed = zstd_compress(&serde_json::to_vec(&head)?)?;
    let head_len = u32::try_from(head_compressed.len())
        .map_err(|_| ImageError::Format("cdimg head too large".to_string()))?;
    debug!(
        "writing cdimg (config={} bytes, dimg={} bytes)",
        head.config_size, head.dimg_size
    );

    out.write_all(&head_len.to_le_bytes())?;
    out.write_all(&head_compressed)?;
    out.write_all(&config_compressed)?;
    out.write_all(dimg)?;
    Ok(4 + head_compressed.len() as u64 + head.config_size + head.dimg_size)
}

/// Wrap the dimg at `dimg_path` with the config at `config_path`
pub fn pack_cdimg(config_path: &Path, dimg_path: &Path, out_path: &Path) -> Result<u64> {
    let config: Value = serde_json::from_slice(&fs::read(config_path)?)?;
    let dimg = fs::read(dimg_path)?;
    write_cdimg_file(out_path, &config, &dimg)
}

/// Write a cdimg to `path` through a temporary file
pub fn write_cdimg_file(path: &Path, config: &Value, dimg: &[u8]) -> Result<u64> {
    let tmp = tmp_path(path);
    let written = (|| -> Result<u64> {
        let mut file = File::create(&tmp)?;
        let n = write_cdimg(config, dimg, &mut file)?;
        file.sync_all()?;
        Ok(n)
    })();
    match written {
        Ok(n) => {
            fs::rename(&tmp, path)?;
            Ok(n)
        }
        Err(e) => {
            let _ = fs::remove_file(&tmp);
            Err(e)
        }
    }
}

/// An open cdimg
#[derive(Debug)]
pub struct CdimgFile {
    pub head: CdimgHead,
    pub config: Value,
    config_bytes: Vec<u8>,
    dimg: DimgFile,
}

impl CdimgFile {
    /// Open a cdimg and check the embedded dimg against the head
    pub fn open(path: &Path) -> Result<Self> {
        let data = map_file(path)?;
        let (head_bytes, mut offset) = read_prefixed(&data, "cdimg head")?;
        let head: CdimgHead = serde_json::from_slice(&zstd_decompress(head_bytes)?)?;

        let too_big = || {
            ImageError::Format(format!(
                "cdimg config of {} bytes exceeds file of {} bytes",
                head.config_size,
                data.len()
            ))
        };
        let config_end = usize::try_from(head.config_size)
            .ok()
            .and_then(|size| offset.checked_add(size))
            .ok_or_else(too_big)?;
        let config_compressed = data.get(offset..config_end).ok_or_else(too_big)?;
        let config_bytes = zstd_decompress(config_compressed)?;
        let config: Value = serde_json::from_slice(&config_bytes)?;
        offset = config_end;

        let actual = (data.len() - offset) as u64;
        if actual != head.dimg_size {
            return Err(ImageError::SizeMismatch {
                what: format!("dimg in {}", path.display()),
                expected: head.dimg_size,
                actual,
            });
        }
        let digest = digest_bytes(&data[offset..]);
        if digest != head.dimg_digest {
            return Err(ImageError::DigestMismatch {
                what: format!("dimg in {}", path.display()),
                expected: head.dimg_digest.to_string(),
                actual: digest.to_string(),
            });
        }

        let dimg = DimgFile::at(data, offset)?.with_path(path);
        Ok(Self {
            head,
            config,
            config_bytes,
            dimg,
        })
    }

    pub fn dimg(&self) -> &DimgFile {
        &self.dimg
    }

    pub fn into_dimg(self) -> DimgFile {
        self.dimg
    }

    /// Uncompressed config JSON exactly as stored
    pub fn config_bytes(&self) -> &[u8] {
        &self.config_bytes
    }

    /// OCI manifest describing this image for a registry
    pub fn manifest(&self) -> Manifest {
        Manifest {
            schema_version: 2,
            media_type: MEDIA_TYPE_MANIFEST.to_string(),
            config: Descriptor {
                media_type: MEDIA_TYPE_CONFIG.to_string(),
                digest: digest_bytes(&self.config_bytes),
                size: self.config_bytes.len() as u64,
            },
            layers: vec![Descriptor {
                media_type: MEDIA_TYPE_DIMG.to_string(),
                digest: self.head.dimg_digest,
                size: self.head.dimg_size,
            }],
        }
    }
}

/// Open a dimg, unwrapping it first when `path` ends in `.cdimg`
pub fn open_image(path: &Path) -> Result<DimgFile> {
    if path.extension().is_some_and(|e| e == "cdimg") {
        Ok(CdimgFile::open(path)?.into_dimg())
    } else {
        DimgFile::open(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dimg::write_dimg;
    use crate::entry::{EntryType, FileEntry};
    use bsdiffx::CompressionMode;

    fn dimg_bytes() -> Vec<u8> {
        let mut root = FileEntry::root();
        let mut f = FileEntry::new("f", EntryType::FileNew);
        f.size = 1;
        f.compressed_size = 2;
        f.digest = Some(f.generate_digest(b"x").unwrap());
        root.childs.insert("f".into(), f);
        root.refresh_dir_digests().unwrap();
        let header = DimgHeader::new(root, None, CompressionMode::Zstd).unwrap();
        let mut out = Vec::new();
        write_dimg(&header, b"ab", &mut out).unwrap();
        out
    }

    #[test]
    fn test_cdimg_roundtrip() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let dimg = dimg_bytes();
        let config = json!({ "architecture": "amd64", "os": "linux" });
        let path = dir.path().join("img.cdimg");
        write_cdimg_file(&path, &config, &dimg)?;

        let cdimg = CdimgFile::open(&path)?;
        assert_eq!(cdimg.head.dimg_size, dimg.len() as u64);
        assert_eq!(cdimg.dimg().bytes(), dimg.as_slice());
        assert_eq!(cdimg.config["os"], "linux");
        assert_eq!(
            cdimg.config["rootfs"]["diff_ids"][0],
            cdimg.dimg().id().to_string()
        );

        let manifest = cdimg.manifest();
        assert_eq!(manifest.schema_version, 2);
        assert_eq!(manifest.layers[0].digest, digest_bytes(&dimg));

        let opened = open_image(&path)?;
        assert_eq!(opened.body(), b"ab");
        Ok(())
    }

    #[test]
    fn test_cdimg_detects_corruption() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("img.cdimg");
        write_cdimg_file(&path, &json!({}), &dimg_bytes())?;

        let mut bytes = fs::read(&path)?;
        let last = bytes.len() - 1;
        bytes[last] ^= 0xff;
        fs::write(&path, &bytes)?;
        assert!(matches!(
            CdimgFile::open(&path),
            Err(ImageError::DigestMismatch { .. })
        ));

        bytes.push(0);
        fs::write(&path, &bytes)?;
        assert!(matches!(
            CdimgFile::open(&path),
            Err(ImageError::SizeMismatch { .. })
        ));
        Ok(())
    }

    #[test]
    fn test_oversized_config_is_format_error() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("bad.cdimg");
        let head = CdimgHead {
            config_size: u64::MAX,
            dimg_size: 0,
            dimg_digest: digest_bytes(b""),
        };
        let head_compressed = zstd_compress(&serde_json::to_vec(&head)?)?;
        let mut bytes = (head_compressed.len() as u32).to_le_bytes().to_vec();
        bytes.extend_from_slice(&head_compressed);
        bytes.extend_from_slice(b"trailing");
        fs::write(&path, &bytes)?;

        assert!(matches!(CdimgFile::open(&path), Err(ImageError::Format(_))));
        Ok(())
    }

    #[test]
    fn test_config_must_be_object() {
        assert!(write_cdimg(&json!([1, 2]), &dimg_bytes(), &mut Vec::new()).is_err());
    }
}
