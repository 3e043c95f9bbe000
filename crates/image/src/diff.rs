//! Tree differ
//!
//! Walks an old and a new self-contained tree in lockstep and classifies
//! every file of the new tree as unchanged (`file_same`), stored as a delta
//! against the old file (`file_diff`), or stored whole (`file_new`). The
//! per-file work runs on the worker pool; offsets into the output blob are
//! assigned by the single writer.

use crate::compress::{gunzip, is_gzip, zstd_decompress};
use crate::config::DiffConfig;
use crate::dimg::{body_of, write_dimg_file, DimgFile, DimgHeader};
use crate::entry::{join, EntryType, FileEntry};
use crate::error::ImageError;
use crate::pool::{self, BlobWriter, FileOutput};
use crate::Result;
use std::path::Path;
use tracing::{debug, info};

/// Per-file work for the diff pipeline
enum DiffTask<'a> {
    /// No usable old counterpart; store the new body as is
    Copy { path: String, new: &'a FileEntry },
    /// Both sides are files; compare and possibly delta-encode
    Compare {
        path: String,
        old: &'a FileEntry,
        new: &'a FileEntry,
    },
}

/// Fail on entries that need a parent image
fn ensure_self_contained(tree: &FileEntry, side: &str) -> Result<()> {
    tree.walk(|path, entry| {
        if entry.is_base_required() {
            return Err(ImageError::InvalidBaseImage {
                path: format!("{}:{}", side, path),
                kind: entry.entry_type.to_string(),
            });
        }
        Ok(())
    })
}

/// Queue every body-carrying file below `new` for a verbatim copy
fn collect_new<'a>(path: &str, new: &'a FileEntry, tasks: &mut Vec<DiffTask<'a>>) {
    if new.has_body() {
        tasks.push(DiffTask::Copy {
            path: path.to_string(),
            new,
        });
    }
    for (name, child) in &new.childs {
        collect_new(&join(path, name), child, tasks);
    }
}

/// Pair up `new`'s children with `old`'s and queue file tasks
fn collect<'a>(path: &str, old: &'a FileEntry, new: &'a FileEntry, tasks: &mut Vec<DiffTask<'a>>) {
    for (name, new_child) in &new.childs {
        let child_path = join(path, name);
        match old.childs.get(name) {
            Some(old_child) if old_child.is_dir() && new_child.is_dir() => {
                collect(&child_path, old_child, new_child, tasks);
            }
            Some(old_child) if old_child.is_file() && new_child.is_file() => {
                tasks.push(DiffTask::Compare {
                    path: child_path,
                    old: old_child,
                    new: new_child,
                });
            }
            _ => collect_new(&child_path, new_child, tasks),
        }
    }
}

/// Compute the stored form of one changed or unchanged file
fn diff_file(
    path: String,
    old: &FileEntry,
    new: &FileEntry,
    old_blob: &[u8],
    new_blob: &[u8],
    config: &DiffConfig,
) -> Result<FileOutput> {
    let new_stored = body_of(new_blob, new)?;
    let old_raw = zstd_decompress(body_of(old_blob, old)?)?;
    let new_raw = zstd_decompress(new_stored)?;

    let plugin = config.plugins.select(&new.name, new.size);
    if plugin.compare(&old_raw, &new_raw) {
        debug!("same: {}", path);
        return Ok(FileOutput::new(path, EntryType::FileSame, Vec::new()));
    }
    if !config.binary_diff || old_raw.is_empty() || new_raw.is_empty() {
        debug!("new: {}", path);
        return Ok(FileOutput::new(path, EntryType::FileNew, new_stored.to_vec()));
    }

    let gz = config.gzip_aware && is_gzip(&old_raw) && is_gzip(&new_raw);
    let delta = if gz {
        plugin.diff(&gunzip(&old_raw)?, &gunzip(&new_raw)?, config.compression_mode)
    } else {
        plugin.diff(&old_raw, &new_raw, config.compression_mode)
    }
    .map_err(|e| ImageError::delta_at(&path, e))?;
    debug!(
        "diff: {} ({} -> {} bytes, plugin={})",
        path,
        new_raw.len(),
        delta.len(),
        plugin.name()
    );

    let mut out = FileOutput::new(path, EntryType::FileDiff, delta);
    out.uncompressed_gz = gz;
    if plugin.name() != bsdiffx::DEFAULT_PLUGIN {
        out.plugin = plugin.name().to_string();
    }
    Ok(out)
}

/// Diff two self-contained trees
///
/// Returns the diff tree (a copy of `new` with every body re-homed into the
/// returned blob) and the blob.
pub fn diff_trees(
    old: &FileEntry,
    new: &FileEntry,
    old_blob: &[u8],
    new_blob: &[u8],
    config: &DiffConfig,
) -> Result<(FileEntry, Vec<u8>)> {
    ensure_self_contained(old, "old")?;
    ensure_self_contained(new, "new")?;

    let mut tasks = Vec::new();
    if old.is_dir() && new.is_dir() {
        collect("", old, new, &mut tasks);
    } else {
        collect_new("", new, &mut tasks);
    }
    info!("diffing trees ({} files to process)", tasks.len());

    let mut tree = new.clone();
    let mut writer = BlobWriter::new();
    pool::run(
        "diff",
        config.workers(),
        tasks,
        |task| match task {
            DiffTask::Copy { path, new } => {
                let body = body_of(new_blob, new)?.to_vec();
                Ok(FileOutput::new(path, EntryType::FileNew, body))
            }
            DiffTask::Compare { path, old, new } => {
                diff_file(path, old, new, old_blob, new_blob, config)
            }
        },
        |out| writer.write(&mut tree, out),
    )?;

    tree.update_dir_types();
    info!("diff done ({} bytes stored)", writer.len());
    Ok((tree, writer.into_inner()))
}

/// Diff two dimgs and write the result to `out`
///
/// The output's parent is `old`'s snapshot id.
pub fn diff_dimg_files(
    old: &DimgFile,
    new: &DimgFile,
    out: &Path,
    config: &DiffConfig,
) -> Result<DimgHeader> {
    let (tree, blob) = diff_trees(old.root(), new.root(), old.body(), new.body(), config)?;
    let header = DimgHeader::new(tree, Some(old.id()), config.compression_mode)?;
    write_dimg_file(out, &header, &blob)?;
    info!(
        "wrote diff {} (id={}, parent={})",
        out.display(),
        header.id,
        old.id()
    );
    Ok(header)
}
