//! Tree merger
//!
//! Combines a lower image (A -> B) and an upper image (B -> C) into one
//! image (A -> C). The merged tree is built fresh from the upper tree; per
//! file the upper entry's type decides what happens:
//!
//! | upper        | lower         | result                                   |
//! |--------------|---------------|------------------------------------------|
//! | new / link   | (ignored)     | copy upper body                          |
//! | dir          | dir           | recurse                                  |
//! | same         | new or diff   | copy lower body                          |
//! | same         | same          | stays same, nothing stored               |
//! | diff         | same          | copy upper delta                         |
//! | diff         | new           | patch lower content, store whole         |
//! | diff         | diff          | merge the two deltas                     |
//!
//! Every other combination is an inconsistent pair of trees and aborts.

use crate::cdimg::{open_image, write_cdimg_file, CdimgFile};
use crate::compress::{gunzip, gzip, zstd_compress, zstd_decompress};
use crate::config::{plugin_by_name, MergeConfig};
use crate::dimg::{body_of, tmp_path, write_dimg, write_dimg_file, DimgFile, DimgHeader};
use crate::entry::{join, EntryType, FileEntry};
use crate::error::ImageError;
use crate::pool::{self, BlobWriter, FileOutput};
use crate::Result;
use parking_lot::Mutex;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};
use ulid::Ulid;

/// Per-file work for the merge pipeline
enum MergeTask<'a> {
    CopyUpper {
        path: String,
        upper: &'a FileEntry,
    },
    CopyLower {
        path: String,
        lower: &'a FileEntry,
    },
    Merge {
        path: String,
        lower: &'a FileEntry,
        upper: &'a FileEntry,
    },
}

/// Build the merged node for `upper` and queue its file work
fn plan<'a>(
    path: &str,
    lower: Option<&'a FileEntry>,
    upper: &'a FileEntry,
    tasks: &mut Vec<MergeTask<'a>>,
) -> Result<FileEntry> {
    let mut merged = upper.shallow();
    for (name, up) in &upper.childs {
        let child_path = join(path, name);
        let child = match up.entry_type {
            EntryType::FileNew
            | EntryType::DirNew
            | EntryType::Symlink
            | EntryType::Hardlink
            | EntryType::Opaque => {
                if up.is_dir() {
                    plan(&child_path, None, up, tasks)?
                } else {
                    if up.has_body() {
                        tasks.push(MergeTask::CopyUpper {
                            path: child_path,
                            upper: up,
                        });
                    }
                    up.clone()
                }
            }
            EntryType::Dir | EntryType::FileSame | EntryType::FileDiff => {
                let lo = lower.and_then(|l| l.childs.get(name)).ok_or_else(|| {
                    ImageError::inconsistent(
                        &child_path,
                        format!("upper is {} but lower has no entry", up.entry_type),
                    )
                })?;
                if lo.is_symlink() {
                    return Err(ImageError::inconsistent(
                        &child_path,
                        format!("upper is {} but lower is a symlink", up.entry_type),
                    ));
                }
                plan_based(child_path, lo, up, tasks)?
            }
        };
        merged.childs.insert(name.clone(), child);
    }
    Ok(merged)
}

/// Entries whose upper form depends on the lower image
fn plan_based<'a>(
    path: String,
    lo: &'a FileEntry,
    up: &'a FileEntry,
    tasks: &mut Vec<MergeTask<'a>>,
) -> Result<FileEntry> {
    match up.entry_type {
        EntryType::Dir if lo.is_dir() => plan(&path, Some(lo), up, tasks),
        EntryType::FileSame if lo.has_body() => {
            // Body and its stored form come from the lower image; the writer
            // stamps type, plugin and gzip flag from the task output
            tasks.push(MergeTask::CopyLower { path, lower: lo });
            Ok(up.clone())
        }
        EntryType::FileSame if lo.is_same() => Ok(up.clone()),
        EntryType::FileDiff if lo.is_same() => {
            tasks.push(MergeTask::CopyUpper { path, upper: up });
            Ok(up.clone())
        }
        EntryType::FileDiff if lo.has_body() => {
            tasks.push(MergeTask::Merge {
                path,
                lower: lo,
                upper: up,
            });
            Ok(up.clone())
        }
        _ => Err(ImageError::inconsistent(
            &path,
            format!("upper is {} but lower is {}", up.entry_type, lo.entry_type),
        )),
    }
}

/// Verbatim copy of a stored body with its storage attributes
fn copy_body(path: String, entry: &FileEntry, blob: &[u8]) -> Result<FileOutput> {
    let mut out = FileOutput::new(path, entry.entry_type, body_of(blob, entry)?.to_vec());
    out.uncompressed_gz = entry.uncompressed_gz;
    out.plugin = entry.plugin.clone();
    Ok(out)
}

/// Combine a lower body with an upper delta
fn merge_file(
    path: String,
    lo: &FileEntry,
    up: &FileEntry,
    lower_blob: &[u8],
    upper_blob: &[u8],
    config: &MergeConfig,
) -> Result<FileOutput> {
    let lower_body = body_of(lower_blob, lo)?;
    let upper_body = body_of(upper_blob, up)?;
    let plugin = plugin_by_name(&config.plugins, &up.plugin)?;

    match lo.entry_type {
        EntryType::FileNew => {
            let raw = zstd_decompress(lower_body)?;
            let content = if up.uncompressed_gz {
                let patched = plugin
                    .patch(&gunzip(&raw)?, upper_body)
                    .map_err(|e| ImageError::delta_at(&path, e))?;
                gzip(&patched)?
            } else {
                plugin
                    .patch(&raw, upper_body)
                    .map_err(|e| ImageError::delta_at(&path, e))?
            };
            debug!("merge: {} (apply, {} bytes)", path, content.len());
            Ok(FileOutput::new(path, EntryType::FileNew, zstd_compress(&content)?))
        }
        EntryType::FileDiff => {
            if lo.uncompressed_gz != up.uncompressed_gz {
                return Err(ImageError::inconsistent(
                    &path,
                    "lower and upper deltas disagree on gzip content",
                ));
            }
            if lo.plugin != up.plugin {
                return Err(ImageError::inconsistent(
                    &path,
                    format!(
                        "lower delta by {:?} cannot merge with upper delta by {:?}",
                        lo.plugin, up.plugin
                    ),
                ));
            }
            let merged = if config.verify && up.plugin.is_empty() {
                bsdiffx::merge_patches_verified(lower_body, upper_body, None)
            } else {
                plugin.merge(lower_body, upper_body)
            }
            .map_err(|e| ImageError::delta_at(&path, e))?;
            debug!(
                "merge: {} (delta merge, {} + {} -> {} bytes)",
                path,
                lower_body.len(),
                upper_body.len(),
                merged.len()
            );
            let mut out = FileOutput::new(path, EntryType::FileDiff, merged);
            out.uncompressed_gz = up.uncompressed_gz;
            out.plugin = up.plugin.clone();
            Ok(out)
        }
        other => Err(ImageError::inconsistent(
            &path,
            format!("cannot merge a delta onto {}", other),
        )),
    }
}

/// Merge a lower and an upper tree
///
/// Neither input is modified; the merged tree carries offsets into the
/// returned blob only.
pub fn merge_trees(
    lower: &FileEntry,
    upper: &FileEntry,
    lower_blob: &[u8],
    upper_blob: &[u8],
    config: &MergeConfig,
) -> Result<(FileEntry, Vec<u8>)> {
    let mut tasks = Vec::new();
    let lower_root = (!upper.is_new()).then_some(lower);
    let mut tree = plan("", lower_root, upper, &mut tasks)?;
    info!("merging trees ({} files to process)", tasks.len());

    let mut writer = BlobWriter::new();
    pool::run(
        "merge",
        config.workers(),
        tasks,
        |task| match task {
            MergeTask::CopyUpper { path, upper } => {
                debug!("merge: {} (copy upper)", path);
                copy_body(path, upper, upper_blob)
            }
            MergeTask::CopyLower { path, lower } => {
                debug!("merge: {} (copy lower)", path);
                copy_body(path, lower, lower_blob)
            }
            MergeTask::Merge { path, lower, upper } => {
                merge_file(path, lower, upper, lower_blob, upper_blob, config)
            }
        },
        |out| writer.write(&mut tree, out),
    )?;

    tree.update_dir_types();
    let blob = writer.into_inner();
    info!("merge done ({} bytes stored)", blob.len());
    Ok((tree, blob))
}

/// Check that `upper` was diffed against `lower`'s snapshot
fn check_stacked(lower: &DimgFile, upper: &DimgFile) -> Result<()> {
    if upper.parent_id() == Some(lower.id()) {
        return Ok(());
    }
    let parent = upper
        .parent_id()
        .map(|d| d.to_string())
        .unwrap_or_else(|| "(none)".to_string());
    Err(ImageError::inconsistent(
        "/",
        format!("upper image parent {} is not lower image {}", parent, lower.id()),
    ))
}

/// Merge two open dimgs into an in-memory header and blob
///
/// The result has the upper image's id and the lower image's parent.
pub fn merge_dimgs(
    lower: &DimgFile,
    upper: &DimgFile,
    config: &MergeConfig,
) -> Result<(DimgHeader, Vec<u8>)> {
    check_stacked(lower, upper)?;
    let (tree, blob) = merge_trees(lower.root(), upper.root(), lower.body(), upper.body(), config)?;
    let header = DimgHeader {
        id: upper.id(),
        parent_id: lower.parent_id(),
        compression_mode: upper.header().compression_mode,
        file_entry: tree,
    };
    header.validate_base()?;
    Ok((header, blob))
}

/// Merge two images into the dimg file `out`
///
/// Either input may be a cdimg; its config is dropped.
pub fn merge_dimg_files(
    lower: &Path,
    upper: &Path,
    out: &Path,
    config: &MergeConfig,
) -> Result<DimgHeader> {
    let lower_img = open_image(lower)?;
    let upper_img = open_image(upper)?;
    let (header, blob) = merge_dimgs(&lower_img, &upper_img, config)?;
    write_dimg_file(out, &header, &blob)?;
    info!(
        "merged {} and {} into {}",
        lower.display(),
        upper.display(),
        out.display()
    );
    Ok(header)
}

/// Merge two cdimg files into `out`, keeping the upper image's config
pub fn merge_cdimg(
    lower: &Path,
    upper: &Path,
    out: &Path,
    config: &MergeConfig,
) -> Result<DimgHeader> {
    let lower_img = CdimgFile::open(lower)?;
    let upper_img = CdimgFile::open(upper)?;
    let (header, blob) = merge_dimgs(lower_img.dimg(), upper_img.dimg(), config)?;
    let mut dimg = Vec::new();
    write_dimg(&header, &blob, &mut dimg)?;
    write_cdimg_file(out, &upper_img.config, &dimg)?;
    info!(
        "merged {} and {} into {}",
        lower.display(),
        upper.display(),
        out.display()
    );
    Ok(header)
}

fn is_cdimg(path: &Path) -> bool {
    path.extension().is_some_and(|e| e == "cdimg")
}

/// Merge two image files; the output kind follows `out`'s extension
fn merge_pair(lower: &Path, upper: &Path, out: &Path, config: &MergeConfig) -> Result<DimgHeader> {
    if is_cdimg(out) {
        merge_cdimg(lower, upper, out, config)
    } else {
        merge_dimg_files(lower, upper, out, config)
    }
}

/// Intermediate files of a chain merge, removed on drop
struct Scratch {
    dir: PathBuf,
    ext: &'static str,
    files: Mutex<Vec<PathBuf>>,
}

impl Scratch {
    fn new(dir: &Path, chain: &[PathBuf]) -> Self {
        let ext = if chain.iter().all(|p| is_cdimg(p)) {
            "cdimg"
        } else {
            "dimg"
        };
        Self {
            dir: dir.to_path_buf(),
            ext,
            files: Mutex::new(Vec::new()),
        }
    }

    fn next(&self) -> PathBuf {
        let path = self.dir.join(format!("merge-{}.{}", Ulid::new(), self.ext));
        self.files.lock().push(path.clone());
        path
    }
}

impl Drop for Scratch {
    fn drop(&mut self) {
        for path in self.files.get_mut().drain(..) {
            if let Err(e) = fs::remove_file(&path) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!("failed to remove {}: {}", path.display(), e);
                }
            }
        }
    }
}

/// Copy a single image to `out` through a temporary file
fn copy_single(src: &Path, out: &Path) -> Result<DimgHeader> {
    let tmp = tmp_path(out);
    fs::copy(src, &tmp)?;
    fs::rename(&tmp, out)?;
    let header = if is_cdimg(src) {
        CdimgFile::open(out)?.dimg().header().clone()
    } else {
        DimgFile::open(out)?.header().clone()
    };
    Ok(header)
}

/// Merge a newest-first chain by folding pairwise from the bottom
///
/// `chain[0]` is the newest image and `chain[len - 1]` the oldest.
pub fn merge_chain_linear(
    chain: &[PathBuf],
    out: &Path,
    tmp_dir: &Path,
    config: &MergeConfig,
) -> Result<DimgHeader> {
    let Some((bottom, rest)) = chain.split_last() else {
        return Err(ImageError::Format("empty merge chain".to_string()));
    };
    if rest.is_empty() {
        return copy_single(bottom, out);
    }
    info!("linear merge of {} images", chain.len());

    let scratch = Scratch::new(tmp_dir, chain);
    let mut lower = bottom.clone();
    let mut header = None;
    for (idx, upper) in rest.iter().enumerate().rev() {
        let target = if idx == 0 { out.to_path_buf() } else { scratch.next() };
        header = Some(merge_pair(&lower, upper, &target, config)?);
        lower = target;
    }
    header.ok_or_else(|| ImageError::Format("empty merge chain".to_string()))
}

/// Merge a newest-first chain by merging its halves recursively
///
/// With `concurrent_merges` the halves run in parallel.
pub fn merge_chain_bisect(
    chain: &[PathBuf],
    out: &Path,
    tmp_dir: &Path,
    config: &MergeConfig,
) -> Result<DimgHeader> {
    match chain.len() {
        0 => Err(ImageError::Format("empty merge chain".to_string())),
        1 => copy_single(&chain[0], out),
        n => {
            info!("bisect merge of {} images", n);
            let scratch = Scratch::new(tmp_dir, chain);
            let (upper, lower) = chain.split_at(n / 2);
            let (upper, lower) = join_halves(
                config,
                || reduce(upper, &scratch, config),
                || reduce(lower, &scratch, config),
            );
            merge_pair(&lower?, &upper?, out, config)
        }
    }
}

/// Merge `chain` into a single image file and return its path
fn reduce(chain: &[PathBuf], scratch: &Scratch, config: &MergeConfig) -> Result<PathBuf> {
    match chain.len() {
        0 => Err(ImageError::Format("empty merge chain".to_string())),
        1 => Ok(chain[0].clone()),
        n => {
            let (upper, lower) = chain.split_at(n / 2);
            let (upper, lower) = join_halves(
                config,
                || reduce(upper, scratch, config),
                || reduce(lower, scratch, config),
            );
            let target = scratch.next();
            merge_pair(&lower?, &upper?, &target, config)?;
            Ok(target)
        }
    }
}

fn join_halves<A, B, RA, RB>(config: &MergeConfig, a: A, b: B) -> (RA, RB)
where
    A: FnOnce() -> RA + Send,
    B: FnOnce() -> RB + Send,
    RA: Send,
    RB: Send,
{
    if config.concurrent_merges {
        rayon::join(a, b)
    } else {
        (a(), b())
    }
}
