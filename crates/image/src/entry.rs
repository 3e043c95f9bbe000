//! File-entry tree model
//!
//! A dimg describes a complete filesystem snapshot as a tree of
//! [`FileEntry`] nodes. Every node records its metadata and a type telling
//! how its content is obtained: stored whole in this image (`file_new`),
//! identical to the parent image (`file_same`), or stored as a binary delta
//! against the parent image (`file_diff`).
//!
//! Children are kept in a `BTreeMap`, so iteration is always name-sorted and
//! cloning produces a fully independent tree.

use crate::digest::{digest_bytes, Digest};
use crate::error::ImageError;
use crate::Result;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::ops::Range;

/// Directory marker that hides everything below it in lower layers
pub const OPAQUE_MARKER: &str = ".wh..wh..opq";

/// Prefix of per-file whiteout markers
pub const WHITEOUT_PREFIX: &str = ".wh.";

/// How an entry's content is obtained
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryType {
    /// Body stored whole (zstd) in this image
    #[default]
    FileNew,
    /// Body identical to the parent image's file
    FileSame,
    /// Body stored as a delta against the parent image's file
    FileDiff,
    /// Directory with at least one descendant depending on the parent image
    Dir,
    /// Directory whose whole subtree is self-contained
    DirNew,
    Symlink,
    /// Whiteout marker hiding a lower-layer file
    Opaque,
    /// Additional name for a file elsewhere in the tree (`real_path`)
    Hardlink,
}

impl EntryType {
    pub fn as_str(self) -> &'static str {
        match self {
            EntryType::FileNew => "file_new",
            EntryType::FileSame => "file_same",
            EntryType::FileDiff => "file_diff",
            EntryType::Dir => "dir",
            EntryType::DirNew => "dir_new",
            EntryType::Symlink => "symlink",
            EntryType::Opaque => "opaque",
            EntryType::Hardlink => "hardlink",
        }
    }
}

impl fmt::Display for EntryType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

fn is_zero(v: &u64) -> bool {
    *v == 0
}

fn is_false(v: &bool) -> bool {
    !*v
}

/// One node of an image tree
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileEntry {
    pub name: String,
    /// Uncompressed content size
    pub size: u64,
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    /// Symlink target, or tree path of the first link for hardlinks
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub real_path: String,
    #[serde(default)]
    pub childs: BTreeMap<String, FileEntry>,

    #[serde(rename = "type")]
    pub entry_type: EntryType,
    /// Stored body length inside the image blob
    #[serde(default, skip_serializing_if = "is_zero")]
    pub compressed_size: u64,
    /// Stored body offset inside the image blob
    #[serde(default, skip_serializing_if = "is_zero")]
    pub offset: u64,
    /// Content digest of the snapshot this entry describes
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub digest: Option<Digest>,
    /// Markers to recreate inside this directory
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub opaque_files: Vec<String>,
    /// Delta was computed on gunzipped content; re-gzip after patching
    #[serde(default, skip_serializing_if = "is_false")]
    pub uncompressed_gz: bool,
    /// Delta implementation that produced a `file_diff` body (empty = default)
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub plugin: String,
}

/// The subset of an entry that its digest covers
#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct DigestForm<'a> {
    name: &'a str,
    size: u64,
    mode: u32,
    uid: u32,
    gid: u32,
    #[serde(skip_serializing_if = "str::is_empty")]
    real_path: &'a str,
    childs: Vec<Digest>,
}

/// Split a `/`-separated path into non-empty segments
pub(crate) fn segments(path: &str) -> impl Iterator<Item = &str> {
    path.split('/').filter(|s| !s.is_empty() && *s != ".")
}

/// Whether `name` is usable as a single path component
fn is_plain_name(name: &str) -> bool {
    !name.is_empty() && name != "." && name != ".." && !name.contains('/') && !name.contains('\0')
}

/// Join a parent tree path and a child name
pub(crate) fn join(parent: &str, name: &str) -> String {
    if parent.is_empty() {
        name.to_string()
    } else {
        format!("{}/{}", parent, name)
    }
}

impl FileEntry {
    /// Create an entry with the given name and type
    pub fn new(name: impl Into<String>, entry_type: EntryType) -> Self {
        Self {
            name: name.into(),
            entry_type,
            ..Default::default()
        }
    }

    /// Root directory of an image
    pub fn root() -> Self {
        Self::new("/", EntryType::DirNew)
    }

    pub fn is_dir(&self) -> bool {
        matches!(self.entry_type, EntryType::Dir | EntryType::DirNew)
    }

    /// Whether this entry needs nothing from a parent image
    pub fn is_new(&self) -> bool {
        matches!(
            self.entry_type,
            EntryType::FileNew
                | EntryType::DirNew
                | EntryType::Symlink
                | EntryType::Hardlink
                | EntryType::Opaque
        )
    }

    pub fn is_same(&self) -> bool {
        self.entry_type == EntryType::FileSame
    }

    pub fn is_diff(&self) -> bool {
        self.entry_type == EntryType::FileDiff
    }

    pub fn is_symlink(&self) -> bool {
        self.entry_type == EntryType::Symlink
    }

    pub fn is_hardlink(&self) -> bool {
        self.entry_type == EntryType::Hardlink
    }

    pub fn is_opaque(&self) -> bool {
        self.entry_type == EntryType::Opaque
    }

    /// Regular file in any of its three storage forms
    pub fn is_file(&self) -> bool {
        matches!(
            self.entry_type,
            EntryType::FileNew | EntryType::FileSame | EntryType::FileDiff
        )
    }

    pub fn is_base_required(&self) -> bool {
        matches!(self.entry_type, EntryType::FileSame | EntryType::FileDiff)
    }

    /// Whether bytes for this entry are stored in the image blob
    pub fn has_body(&self) -> bool {
        matches!(self.entry_type, EntryType::FileNew | EntryType::FileDiff)
    }

    /// Byte range of the stored body inside the image blob
    pub fn body_range(&self) -> Result<Range<usize>> {
        let bad = || {
            ImageError::Format(format!(
                "body of {:?} at offset {} with {} bytes is out of range",
                self.name, self.offset, self.compressed_size
            ))
        };
        let end = self.offset.checked_add(self.compressed_size).ok_or_else(bad)?;
        let start = usize::try_from(self.offset).map_err(|_| bad())?;
        let end = usize::try_from(end).map_err(|_| bad())?;
        Ok(start..end)
    }

    /// Copy of this entry without children
    pub fn shallow(&self) -> Self {
        Self {
            childs: BTreeMap::new(),
            ..self.clone()
        }
    }

    /// Find the entry at a `/`-separated path relative to this one
    pub fn lookup(&self, path: &str) -> Result<&FileEntry> {
        let mut cur = self;
        for seg in segments(path) {
            cur = cur
                .childs
                .get(seg)
                .ok_or_else(|| ImageError::NotFound(path.to_string()))?;
        }
        Ok(cur)
    }

    pub fn lookup_mut(&mut self, path: &str) -> Result<&mut FileEntry> {
        let mut cur = self;
        for seg in segments(path) {
            cur = cur
                .childs
                .get_mut(seg)
                .ok_or_else(|| ImageError::NotFound(path.to_string()))?;
        }
        Ok(cur)
    }

    /// Insert `entry` at `path`, replacing whatever was there
    ///
    /// The parent must already exist and be a directory. The entry's name
    /// is set to the last path segment.
    pub fn insert_at(&mut self, path: &str, mut entry: FileEntry) -> Result<()> {
        let (parent, name) = match path.trim_end_matches('/').rsplit_once('/') {
            Some((parent, name)) => (parent, name),
            None => ("", path.trim_end_matches('/')),
        };
        if name.is_empty() {
            return Err(ImageError::Format(format!("cannot insert at {:?}", path)));
        }
        let dir = self.lookup_mut(parent)?;
        if !dir.is_dir() {
            return Err(ImageError::Format(format!(
                "cannot insert {:?}: parent is {}",
                path, dir.entry_type
            )));
        }
        entry.name = name.to_string();
        dir.childs.insert(name.to_string(), entry);
        Ok(())
    }

    /// Visit every entry depth-first in name order
    ///
    /// The callback receives the path relative to this entry (empty for the
    /// entry itself).
    pub fn walk<F>(&self, mut f: F) -> Result<()>
    where
        F: FnMut(&str, &FileEntry) -> Result<()>,
    {
        self.walk_impl("", &mut f)
    }

    fn walk_impl<F>(&self, path: &str, f: &mut F) -> Result<()>
    where
        F: FnMut(&str, &FileEntry) -> Result<()>,
    {
        f(path, self)?;
        for (name, child) in &self.childs {
            child.walk_impl(&join(path, name), f)?;
        }
        Ok(())
    }

    /// Compute the content digest of this entry
    ///
    /// Directories need every child digest already set. `body` is the
    /// uncompressed file content and is ignored for non-files.
    pub fn generate_digest(&self, body: &[u8]) -> Result<Digest> {
        let mut childs = Vec::new();
        if self.is_dir() {
            for (name, child) in &self.childs {
                let d = child.digest.ok_or_else(|| {
                    ImageError::Format(format!(
                        "child {:?} of {:?} has no digest",
                        name, self.name
                    ))
                })?;
                childs.push(d);
            }
        }
        let form = DigestForm {
            name: &self.name,
            size: self.size,
            mode: self.mode,
            uid: self.uid,
            gid: self.gid,
            real_path: &self.real_path,
            childs,
        };
        let mut bytes = serde_json::to_vec(&form)?;
        if self.is_file() {
            bytes.extend_from_slice(body);
        }
        Ok(digest_bytes(&bytes))
    }

    /// Check `body` against the recorded digest
    pub fn verify(&self, body: &[u8]) -> Result<()> {
        let expected = self
            .digest
            .ok_or_else(|| ImageError::Format(format!("{:?} has no digest", self.name)))?;
        let actual = self.generate_digest(body)?;
        if actual != expected {
            return Err(ImageError::DigestMismatch {
                what: self.name.clone(),
                expected: expected.to_string(),
                actual: actual.to_string(),
            });
        }
        Ok(())
    }

    /// Reject child names, markers and hardlink targets that would leave
    /// the tree when joined onto a directory
    pub fn check_paths(&self) -> Result<()> {
        self.walk(|path, entry| {
            for name in entry.childs.keys().chain(&entry.opaque_files) {
                if !is_plain_name(name) {
                    return Err(ImageError::Format(format!(
                        "invalid name {:?} under {:?}",
                        name, path
                    )));
                }
            }
            if entry.is_hardlink()
                && (entry.real_path.starts_with('/')
                    || entry.real_path.split('/').any(|seg| seg == ".."))
            {
                return Err(ImageError::Format(format!(
                    "hardlink {:?} points outside the tree: {:?}",
                    path, entry.real_path
                )));
            }
            Ok(())
        })
    }

    /// Recompute digests of every directory below and including this one
    ///
    /// Non-directory digests are left as they are.
    pub fn refresh_dir_digests(&mut self) -> Result<()> {
        if !self.is_dir() {
            return Ok(());
        }
        for child in self.childs.values_mut() {
            child.refresh_dir_digests()?;
        }
        self.digest = Some(self.generate_digest(&[])?);
        Ok(())
    }

    /// Set every directory's type from its subtree
    ///
    /// A directory is `dir_new` iff nothing below it depends on a parent
    /// image. Returns whether this entry is self-contained.
    pub fn update_dir_types(&mut self) -> bool {
        if !self.is_dir() {
            return self.is_new();
        }
        let mut all_new = true;
        for child in self.childs.values_mut() {
            // Visit every child even after the answer is known
            all_new &= child.update_dir_types();
        }
        self.entry_type = if all_new {
            EntryType::DirNew
        } else {
            EntryType::Dir
        };
        all_new
    }

    /// Summed stored body size of this subtree
    pub fn total_compressed_size(&self) -> u64 {
        self.compressed_size
            + self
                .childs
                .values()
                .map(FileEntry::total_compressed_size)
                .sum::<u64>()
    }

    /// Render the tree as indented text
    pub fn print_tree(&self) -> String {
        let mut out = String::new();
        self.print_impl("", true, true, &mut out);
        out
    }

    fn print_impl(&self, prefix: &str, is_last: bool, is_root: bool, out: &mut String) {
        let (branch, next) = if is_root {
            ("", String::new())
        } else if is_last {
            ("└── ", format!("{}    ", prefix))
        } else {
            ("├── ", format!("{}│   ", prefix))
        };
        out.push_str(&format!(
            "{}{}{} ({}, size={}, stored={})\n",
            prefix, branch, self.name, self.entry_type, self.size, self.compressed_size
        ));
        let count = self.childs.len();
        for (i, child) in self.childs.values().enumerate() {
            child.print_impl(&next, i + 1 == count, false, out);
        }
    }
}
