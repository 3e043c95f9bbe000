//! Dimg container
//!
//! Layout (little-endian):
//! ```text
//! [u32 compressed header length]
//! [zstd-compressed JSON DimgHeader]
//! [content blob: file bodies at their declared offsets]
//! ```

use crate::compress::{zstd_compress, zstd_decompress};
use crate::digest::{digest_bytes, Digest};
use crate::entry::FileEntry;
use crate::error::ImageError;
use crate::Result;
use bsdiffx::CompressionMode;
use memmap2::Mmap;
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::Write;
use std::ops::Deref;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Size of the header length prefix
pub const LEN_PREFIX: usize = 4;

mod mode_serde {
    use bsdiffx::CompressionMode;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(
        mode: &CompressionMode,
        serializer: S,
    ) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(mode.as_str())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> std::result::Result<CompressionMode, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Identity and tree of a dimg
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DimgHeader {
    /// Content digest of the snapshot (root entry digest)
    pub id: Digest,
    /// Id of the snapshot this image is a delta against
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<Digest>,
    /// Compression used inside newly produced file deltas
    #[serde(default, with = "mode_serde")]
    pub compression_mode: CompressionMode,
    pub file_entry: FileEntry,
}

impl DimgHeader {
    /// Build a header whose id is the root entry's digest
    pub fn new(
        file_entry: FileEntry,
        parent_id: Option<Digest>,
        compression_mode: CompressionMode,
    ) -> Result<Self> {
        let id = file_entry
            .digest
            .ok_or_else(|| ImageError::Format("root entry has no digest".to_string()))?;
        Ok(Self {
            id,
            parent_id,
            compression_mode,
            file_entry,
        })
    }

    /// Whether this image needs no parent
    pub fn is_base(&self) -> bool {
        self.parent_id.is_none()
    }

    /// Reject parentless images that still reference a parent's files
    pub fn validate_base(&self) -> Result<()> {
        if !self.is_base() {
            return Ok(());
        }
        self.file_entry.walk(|path, entry| {
            if entry.is_base_required() {
                return Err(ImageError::InvalidBaseImage {
                    path: path.to_string(),
                    kind: entry.entry_type.to_string(),
                });
            }
            Ok(())
        })
    }

    /// Length prefix plus compressed JSON
    pub fn encode(&self) -> Result<Vec<u8>> {
        let json = serde_json::to_vec(self)?;
        let compressed = zstd_compress(&json)?;
        let len = u32::try_from(compressed.len()).map_err(|_| {
            ImageError::Format(format!("header too large: {} bytes", compressed.len()))
        })?;
        let mut out = Vec::with_capacity(LEN_PREFIX + compressed.len());
        out.extend_from_slice(&len.to_le_bytes());
        out.extend_from_slice(&compressed);
        Ok(out)
    }

    /// Parse a header from the start of `bytes`
    ///
    /// Returns the header and the offset of the content blob.
    pub fn decode(bytes: &[u8]) -> Result<(Self, usize)> {
        let (header_bytes, body_start) = read_prefixed(bytes, "dimg header")?;
        let json = zstd_decompress(header_bytes)?;
        let header: DimgHeader = serde_json::from_slice(&json)?;
        header.file_entry.check_paths()?;
        Ok((header, body_start))
    }
}

/// Split a `[u32 len][len bytes]` frame off the start of `bytes`
pub(crate) fn read_prefixed<'a>(bytes: &'a [u8], what: &str) -> Result<(&'a [u8], usize)> {
    let Some(prefix) = bytes.get(..LEN_PREFIX) else {
        return Err(ImageError::Format(format!(
            "{}: missing length prefix ({} bytes available)",
            what,
            bytes.len()
        )));
    };
    let mut len = [0u8; LEN_PREFIX];
    len.copy_from_slice(prefix);
    let len = u32::from_le_bytes(len) as usize;
    let end = LEN_PREFIX + len;
    let frame = bytes.get(LEN_PREFIX..end).ok_or_else(|| {
        ImageError::Format(format!(
            "{}: declares {} bytes but only {} follow",
            what,
            len,
            bytes.len() - LEN_PREFIX
        ))
    })?;
    Ok((frame, end))
}

/// Serialize a header and blob into `out`
pub fn write_dimg<W: Write + ?Sized>(header: &DimgHeader, body: &[u8], out: &mut W) -> Result<u64> {
    header.validate_base()?;
    let head = header.encode()?;
    out.write_all(&head)?;
    out.write_all(body)?;
    Ok((head.len() + body.len()) as u64)
}

/// Write a dimg to `path` through a temporary file
///
/// The final path only appears once the whole image has been written.
pub fn write_dimg_file(path: &Path, header: &DimgHeader, body: &[u8]) -> Result<u64> {
    let tmp = tmp_path(path);
    let written = (|| -> Result<u64> {
        let mut file = File::create(&tmp)?;
        let n = write_dimg(header, body, &mut file)?;
        file.sync_all()?;
        Ok(n)
    })();
    match written {
        Ok(n) => {
            fs::rename(&tmp, path)?;
            debug!("wrote dimg {} ({} bytes)", path.display(), n);
            Ok(n)
        }
        Err(e) => {
            let _ = fs::remove_file(&tmp);
            Err(e)
        }
    }
}

/// Sibling temporary path for an atomic write
pub(crate) fn tmp_path(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    path.with_file_name(format!(".{}.{}.tmp", name, ulid::Ulid::new()))
}

/// Bytes backing an open image
pub(crate) enum Backing {
    Mapped(Mmap),
    Owned(Vec<u8>),
}

impl Deref for Backing {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        match self {
            Backing::Mapped(m) => m,
            Backing::Owned(v) => v,
        }
    }
}

pub(crate) fn map_file(path: &Path) -> Result<Backing> {
    let file = File::open(path)?;
    if file.metadata()?.len() == 0 {
        return Ok(Backing::Owned(Vec::new()));
    }
    // SAFETY: image files are written once and never modified in place
    let mmap = unsafe { Mmap::map(&file)? };
    Ok(Backing::Mapped(mmap))
}

/// An open dimg, either on its own or embedded in a cdimg
pub struct DimgFile {
    path: Option<PathBuf>,
    data: Backing,
    /// Start of the dimg inside `data`
    start: usize,
    /// Start of the content blob inside `data`
    body_start: usize,
    header: DimgHeader,
}

impl std::fmt::Debug for DimgFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DimgFile")
            .field("path", &self.path)
            .field("id", &self.header.id)
            .field("parent_id", &self.header.parent_id)
            .field("body_len", &self.body().len())
            .finish()
    }
}

impl DimgFile {
    /// Open and memory-map a dimg file
    pub fn open(path: &Path) -> Result<Self> {
        let data = map_file(path)?;
        let mut dimg = Self::at(data, 0)?;
        dimg.path = Some(path.to_path_buf());
        Ok(dimg)
    }

    /// Wrap an in-memory dimg
    pub fn from_vec(bytes: Vec<u8>) -> Result<Self> {
        Self::at(Backing::Owned(bytes), 0)
    }

    /// Parse a dimg starting at `start` inside `data`
    pub(crate) fn at(data: Backing, start: usize) -> Result<Self> {
        let slice = data
            .get(start..)
            .ok_or_else(|| ImageError::Format(format!("dimg offset {} out of range", start)))?;
        let (header, body_offset) = DimgHeader::decode(slice)?;
        header.validate_base()?;
        Ok(Self {
            path: None,
            data,
            start,
            body_start: start + body_offset,
            header,
        })
    }

    pub(crate) fn with_path(mut self, path: &Path) -> Self {
        self.path = Some(path.to_path_buf());
        self
    }

    pub fn header(&self) -> &DimgHeader {
        &self.header
    }

    pub fn root(&self) -> &FileEntry {
        &self.header.file_entry
    }

    pub fn id(&self) -> Digest {
        self.header.id
    }

    pub fn parent_id(&self) -> Option<Digest> {
        self.header.parent_id
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Content blob
    pub fn body(&self) -> &[u8] {
        &self.data[self.body_start..]
    }

    /// All bytes of this dimg (header and blob)
    pub fn bytes(&self) -> &[u8] {
        &self.data[self.start..]
    }

    /// Digest of the whole dimg byte stream
    pub fn file_digest(&self) -> Digest {
        digest_bytes(self.bytes())
    }

    /// Stored bytes of an entry
    pub fn read_body(&self, entry: &FileEntry) -> Result<&[u8]> {
        body_of(self.body(), entry)
    }
}

/// Slice an entry's stored bytes out of a blob
pub fn body_of<'a>(blob: &'a [u8], entry: &FileEntry) -> Result<&'a [u8]> {
    if !entry.has_body() {
        return Ok(&[]);
    }
    let range = entry.body_range()?;
    blob.get(range.clone()).ok_or_else(|| {
        ImageError::Format(format!(
            "body of {:?} at {}..{} exceeds blob of {} bytes",
            entry.name,
            range.start,
            range.end,
            blob.len()
        ))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entry::EntryType;

    fn tree() -> FileEntry {
        let mut root = FileEntry::root();
        let mut f = FileEntry::new("a.txt", EntryType::FileNew);
        f.size = 5;
        f.compressed_size = 3;
        f.digest = Some(f.generate_digest(b"hello").unwrap());
        root.childs.insert("a.txt".into(), f);
        root.refresh_dir_digests().unwrap();
        root
    }

    #[test]
    fn test_header_roundtrip() -> Result<()> {
        let header = DimgHeader::new(tree(), None, CompressionMode::Bzip2)?;
        let mut out = Vec::new();
        write_dimg(&header, b"xyz", &mut out)?;

        let dimg = DimgFile::from_vec(out)?;
        assert_eq!(dimg.header(), &header);
        assert_eq!(dimg.body(), b"xyz");
        let entry = dimg.root().lookup("a.txt")?;
        assert_eq!(dimg.read_body(entry)?, b"xyz");
        Ok(())
    }

    #[test]
    fn test_header_json_names() -> Result<()> {
        let header = DimgHeader::new(tree(), Some(digest_bytes(b"p")), CompressionMode::Zstd)?;
        let v = serde_json::to_value(&header)?;
        assert_eq!(v["compressionMode"], "zstd");
        assert!(v["parentId"].as_str().unwrap().starts_with("sha256:"));
        assert!(v.get("fileEntry").is_some());
        Ok(())
    }

    #[test]
    fn test_base_image_rejects_same() {
        let mut root = tree();
        root.childs.get_mut("a.txt").unwrap().entry_type = EntryType::FileSame;
        let header = DimgHeader::new(root, None, CompressionMode::Zstd).unwrap();
        assert!(matches!(
            header.validate_base(),
            Err(ImageError::InvalidBaseImage { path, .. }) if path == "a.txt"
        ));
        assert!(write_dimg(&header, &[], &mut Vec::new()).is_err());
    }

    #[test]
    fn test_truncated_header() {
        assert!(DimgHeader::decode(&[1, 0]).is_err());
        assert!(DimgHeader::decode(&[10, 0, 0, 0, 1, 2]).is_err());
    }

    #[test]
    fn test_body_out_of_range() -> Result<()> {
        let header = DimgHeader::new(tree(), None, CompressionMode::Zstd)?;
        let mut out = Vec::new();
        write_dimg(&header, b"x", &mut out)?;
        let dimg = DimgFile::from_vec(out)?;
        assert!(dimg.read_body(dimg.root().lookup("a.txt")?).is_err());

        let mut wrapped = FileEntry::new("w", EntryType::FileNew);
        wrapped.offset = u64::MAX;
        wrapped.compressed_size = 2;
        assert!(matches!(body_of(b"abc", &wrapped), Err(ImageError::Format(_))));
        Ok(())
    }

    #[test]
    fn test_write_file_is_atomic() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("img.dimg");
        let header = DimgHeader::new(tree(), None, CompressionMode::Zstd)?;
        write_dimg_file(&path, &header, b"xyz")?;

        let dimg = DimgFile::open(&path)?;
        assert_eq!(dimg.path(), Some(path.as_path()));
        assert_eq!(dimg.file_digest(), digest_bytes(&fs::read(&path)?));

        // A failing write leaves nothing behind
        let mut bad = tree();
        bad.childs.get_mut("a.txt").unwrap().entry_type = EntryType::FileDiff;
        let bad = DimgHeader::new(bad, None, CompressionMode::Zstd)?;
        let bad_path = dir.path().join("bad.dimg");
        assert!(write_dimg_file(&bad_path, &bad, b"").is_err());
        assert_eq!(fs::read_dir(dir.path())?.count(), 1);
        Ok(())
    }
}
