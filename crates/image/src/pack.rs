//! Directory packer
//!
//! Scans a directory tree into a self-contained image: every regular file
//! is stored whole (zstd), directories are `dir_new`, symlinks keep their
//! target. Compression runs on the worker pool; the walk itself is
//! sequential and name-sorted.

use crate::compress::zstd_compress;
use crate::config::DiffConfig;
use crate::diff::diff_trees;
use crate::dimg::{write_dimg_file, DimgHeader};
use crate::entry::{segments, EntryType, FileEntry, OPAQUE_MARKER, WHITEOUT_PREFIX};
use crate::error::ImageError;
use crate::pool::{self, BlobWriter, FileOutput};
use crate::Result;
use bsdiffx::CompressionMode;
use std::collections::HashMap;
use std::fs::{self, Metadata};
use std::os::unix::fs::{FileTypeExt, MetadataExt};
use std::path::{Path, PathBuf};
use tracing::{debug, info};
use walkdir::WalkDir;

/// One regular file to read and compress
struct PackTask {
    path: String,
    source: PathBuf,
    entry: FileEntry,
}

fn entry_from_metadata(name: &str, meta: &Metadata, entry_type: EntryType) -> FileEntry {
    let mut entry = FileEntry::new(name, entry_type);
    entry.mode = meta.mode();
    entry.uid = meta.uid();
    entry.gid = meta.gid();
    entry.size = if meta.is_dir() { 0 } else { meta.len() };
    entry
}

/// Tree path of `path` below `root`, `/`-separated
fn tree_path(root: &Path, path: &Path) -> Result<String> {
    let rel = path.strip_prefix(root).map_err(|_| {
        ImageError::Format(format!(
            "{} is outside {}",
            path.display(),
            root.display()
        ))
    })?;
    let rel = rel.to_string_lossy();
    Ok(segments(&rel).collect::<Vec<_>>().join("/"))
}

/// Pack `root` into a base tree and blob
pub fn pack_dir(root: &Path, threads: usize) -> Result<(FileEntry, Vec<u8>)> {
    info!("packing {}", root.display());
    let root_meta = fs::metadata(root)?;
    if !root_meta.is_dir() {
        return Err(ImageError::Format(format!("{} is not a directory", root.display())));
    }
    let mut tree = entry_from_metadata("/", &root_meta, EntryType::DirNew);
    let mut tasks = Vec::new();
    // (dev, inode) of multiply-linked files -> first tree path
    let mut links: HashMap<(u64, u64), String> = HashMap::new();

    let walker = WalkDir::new(root)
        .min_depth(1)
        .follow_links(false)
        .sort_by_file_name();
    for item in walker {
        let item = item.map_err(|e| ImageError::Io(e.into()))?;
        let path = tree_path(root, item.path())?;
        let name = item.file_name().to_string_lossy().into_owned();
        let meta = item.metadata().map_err(|e| ImageError::Io(e.into()))?;
        let ft = meta.file_type();

        if ft.is_char_device() || ft.is_block_device() || ft.is_fifo() || ft.is_socket() {
            info!("skipping special file {}", item.path().display());
            continue;
        }
        if name == OPAQUE_MARKER {
            let parent = path.rsplit_once('/').map(|(p, _)| p).unwrap_or("");
            tree.lookup_mut(parent)?.opaque_files.push(name);
            continue;
        }

        let entry = if ft.is_dir() {
            entry_from_metadata(&name, &meta, EntryType::DirNew)
        } else if ft.is_symlink() {
            let mut entry = entry_from_metadata(&name, &meta, EntryType::Symlink);
            entry.real_path = fs::read_link(item.path())?.to_string_lossy().into_owned();
            entry.digest = Some(entry.generate_digest(&[])?);
            entry
        } else if name.starts_with(WHITEOUT_PREFIX) {
            let mut entry = entry_from_metadata(&name, &meta, EntryType::Opaque);
            entry.size = 0;
            entry.digest = Some(entry.generate_digest(&[])?);
            entry
        } else if let Some(first) = links.get(&(meta.dev(), meta.ino())) {
            let mut entry = entry_from_metadata(&name, &meta, EntryType::Hardlink);
            entry.real_path = first.clone();
            entry.digest = Some(entry.generate_digest(&[])?);
            debug!("hardlink {} -> {}", path, entry.real_path);
            entry
        } else {
            if meta.nlink() > 1 {
                links.insert((meta.dev(), meta.ino()), path.clone());
            }
            let entry = entry_from_metadata(&name, &meta, EntryType::FileNew);
            tasks.push(PackTask {
                path: path.clone(),
                source: item.path().to_path_buf(),
                entry: entry.clone(),
            });
            entry
        };
        tree.insert_at(&path, entry)?;
    }

    let mut writer = BlobWriter::new();
    let files = pool::run(
        "pack",
        threads,
        tasks,
        |task| {
            let raw = fs::read(&task.source)?;
            if raw.len() as u64 != task.entry.size {
                return Err(ImageError::SizeMismatch {
                    what: task.path,
                    expected: task.entry.size,
                    actual: raw.len() as u64,
                });
            }
            let mut out = FileOutput::new(task.path, EntryType::FileNew, zstd_compress(&raw)?);
            out.digest = Some(task.entry.generate_digest(&raw)?);
            Ok(out)
        },
        |out| writer.write(&mut tree, out),
    )?;

    tree.refresh_dir_digests()?;
    let blob = writer.into_inner();
    info!(
        "packed {} files from {} ({} bytes stored)",
        files,
        root.display(),
        blob.len()
    );
    Ok((tree, blob))
}

/// Pack `root` and write it as a base dimg
pub fn pack_dir_to_dimg(root: &Path, out: &Path, threads: usize) -> Result<DimgHeader> {
    let (tree, blob) = pack_dir(root, threads)?;
    let header = DimgHeader::new(tree, None, CompressionMode::default())?;
    write_dimg_file(out, &header, &blob)?;
    Ok(header)
}

/// Pack two directories and diff them
///
/// The result's parent is the packed `base` snapshot.
pub fn pack_diff_dirs(
    base: &Path,
    new: &Path,
    config: &DiffConfig,
) -> Result<(DimgHeader, Vec<u8>)> {
    let (base_tree, base_blob) = pack_dir(base, config.workers())?;
    let (new_tree, new_blob) = pack_dir(new, config.workers())?;
    let (tree, blob) = diff_trees(&base_tree, &new_tree, &base_blob, &new_blob, config)?;
    let header = DimgHeader::new(tree, base_tree.digest, config.compression_mode)?;
    Ok((header, blob))
}
