//! Structural comparison of two trees describing the same snapshot
//!
//! Used to see how two encodings of one snapshot (say a chain of diffs
//! merged two different ways) store each file.

use crate::entry::{join, EntryType, FileEntry};
use crate::error::ImageError;
use crate::Result;
use serde::Serialize;

/// How one leaf is stored on each side
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CompareRecord {
    pub path: String,
    pub file_size: u64,
    pub a_type: EntryType,
    pub a_compressed_size: u64,
    pub b_type: EntryType,
    pub b_compressed_size: u64,
}

fn mismatch(
    path: &str,
    what: &str,
    a: impl std::fmt::Display,
    b: impl std::fmt::Display,
) -> ImageError {
    ImageError::inconsistent(path, format!("{} differs (a={}, b={})", what, a, b))
}

fn compare_at(
    path: &str,
    a: &FileEntry,
    b: &FileEntry,
    out: &mut Vec<CompareRecord>,
) -> Result<()> {
    if a.name != b.name {
        return Err(mismatch(path, "name", &a.name, &b.name));
    }
    if a.childs.len() != b.childs.len() {
        return Err(mismatch(path, "child count", a.childs.len(), b.childs.len()));
    }
    if a.size != b.size {
        return Err(mismatch(path, "size", a.size, b.size));
    }
    if a.has_body() != b.has_body() {
        return Err(mismatch(path, "body presence", a.has_body(), b.has_body()));
    }
    if !a.childs.is_empty() && a.has_body() {
        return Err(ImageError::inconsistent(path, "entry has both children and a body"));
    }

    if a.childs.is_empty() {
        out.push(CompareRecord {
            path: path.to_string(),
            file_size: a.size,
            a_type: a.entry_type,
            a_compressed_size: a.compressed_size,
            b_type: b.entry_type,
            b_compressed_size: b.compressed_size,
        });
        return Ok(());
    }
    for (name, a_child) in &a.childs {
        let child_path = join(path, name);
        let b_child = b
            .childs
            .get(name)
            .ok_or_else(|| ImageError::NotFound(format!("b:{}", child_path)))?;
        compare_at(&child_path, a_child, b_child, out)?;
    }
    Ok(())
}

/// Pair up every leaf of `a` with the same path in `b`
///
/// Fails on the first name, size, child-count or body mismatch. Records
/// come out in path order.
pub fn compare_entries(a: &FileEntry, b: &FileEntry) -> Result<Vec<CompareRecord>> {
    let mut out = Vec::new();
    compare_at("", a, b, &mut out)?;
    Ok(out)
}
