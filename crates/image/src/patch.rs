//! Materialize an image onto disk
//!
//! Files a dimg shares with its parent are read from an already
//! materialized parent directory; everything else comes from the image.

use crate::compress::{gunzip, gzip, zstd_decompress};
use crate::config::plugin_by_name;
use crate::dimg::DimgFile;
use crate::entry::{join, EntryType, FileEntry};
use crate::error::ImageError;
use crate::Result;
use bsdiffx::PluginRegistry;
use std::fs::{self, File};
use std::os::unix::fs::{symlink, PermissionsExt};
use std::path::Path;
use tracing::{debug, info};

/// Mode given to recreated opaque markers
const OPAQUE_MODE: u32 = 0o755;

/// Settings for [`apply_patch`]
#[derive(Debug, Clone, Default)]
pub struct PatchOptions {
    /// Check every written file against its recorded digest
    pub verify: bool,
    pub plugins: PluginRegistry,
}

struct Patcher<'a> {
    base_dir: Option<&'a Path>,
    out_dir: &'a Path,
    dimg: &'a DimgFile,
    options: &'a PatchOptions,
    files: usize,
}

fn set_mode(path: &Path, mode: u32) -> Result<()> {
    if mode != 0 {
        fs::set_permissions(path, fs::Permissions::from_mode(mode & 0o7777))?;
    }
    Ok(())
}

impl Patcher<'_> {
    fn base_file(&self, path: &str) -> Result<Vec<u8>> {
        let base = self.base_dir.ok_or_else(|| {
            ImageError::Format(format!("{} needs a parent directory to patch", path))
        })?;
        Ok(fs::read(base.join(path))?)
    }

    fn file_content(&self, path: &str, entry: &FileEntry) -> Result<Vec<u8>> {
        match entry.entry_type {
            EntryType::FileNew => zstd_decompress(self.dimg.read_body(entry)?),
            EntryType::FileSame => self.base_file(path),
            EntryType::FileDiff => {
                let base = self.base_file(path)?;
                let delta = self.dimg.read_body(entry)?;
                let plugin = plugin_by_name(&self.options.plugins, &entry.plugin)?;
                if entry.uncompressed_gz {
                    let patched = plugin
                        .patch(&gunzip(&base)?, delta)
                        .map_err(|e| ImageError::delta_at(path, e))?;
                    gzip(&patched)
                } else {
                    plugin
                        .patch(&base, delta)
                        .map_err(|e| ImageError::delta_at(path, e))
                }
            }
            other => Err(ImageError::Format(format!("{} is {}, not a file", path, other))),
        }
    }

    fn apply(&mut self, path: &str, entry: &FileEntry) -> Result<()> {
        if self.dimg.header().is_base() && entry.is_base_required() {
            return Err(ImageError::InvalidBaseImage {
                path: path.to_string(),
                kind: entry.entry_type.to_string(),
            });
        }
        let target = self.out_dir.join(path);

        match entry.entry_type {
            EntryType::Dir | EntryType::DirNew => {
                if path.is_empty() {
                    fs::create_dir_all(&target)?;
                } else {
                    fs::create_dir(&target)?;
                }
                for (name, child) in &entry.childs {
                    self.apply(&join(path, name), child)?;
                }
                for marker in &entry.opaque_files {
                    let marker_path = target.join(marker);
                    File::create(&marker_path)?;
                    set_mode(&marker_path, OPAQUE_MODE)?;
                }
                set_mode(&target, entry.mode)?;
            }
            EntryType::Symlink => {
                symlink(&entry.real_path, &target)?;
            }
            EntryType::Hardlink => {
                let linked = self.dimg.root().lookup(&entry.real_path)?;
                if !linked.is_file() {
                    return Err(ImageError::Format(format!(
                        "hardlink {} points at {} {}",
                        path, linked.entry_type, entry.real_path
                    )));
                }
                fs::hard_link(self.out_dir.join(&entry.real_path), &target)?;
            }
            EntryType::Opaque => {
                File::create(&target)?;
                set_mode(&target, entry.mode)?;
            }
            EntryType::FileNew | EntryType::FileSame | EntryType::FileDiff => {
                let content = self.file_content(path, entry)?;
                if self.options.verify && !entry.uncompressed_gz {
                    entry.verify(&content)?;
                }
                debug!("write {} ({}, {} bytes)", path, entry.entry_type, content.len());
                fs::write(&target, &content)?;
                set_mode(&target, entry.mode)?;
                self.files += 1;
            }
        }
        Ok(())
    }
}

/// Write the snapshot described by `dimg` into `out_dir`
///
/// `base_dir` holds the materialized parent snapshot and is required when
/// the image has a parent.
pub fn apply_patch(
    base_dir: Option<&Path>,
    out_dir: &Path,
    dimg: &DimgFile,
    options: &PatchOptions,
) -> Result<usize> {
    if !dimg.header().is_base() && base_dir.is_none() {
        return Err(ImageError::Format(format!(
            "image {} has parent {}; a base directory is required",
            dimg.id(),
            dimg.parent_id().map(|d| d.to_string()).unwrap_or_default()
        )));
    }
    info!("applying image {} to {}", dimg.id(), out_dir.display());
    let mut patcher = Patcher {
        base_dir,
        out_dir,
        dimg,
        options,
        files: 0,
    };
    patcher.apply("", dimg.root())?;
    info!("wrote {} files to {}", patcher.files, out_dir.display());
    Ok(patcher.files)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DiffConfig;
    use crate::diff::diff_trees;
    use crate::diff::tests::image;
    use crate::dimg::{write_dimg, DimgHeader};
    use bsdiffx::CompressionMode;

    fn dimg(tree: FileEntry, parent: Option<crate::Digest>, blob: &[u8]) -> DimgFile {
        let header = DimgHeader::new(tree, parent, CompressionMode::Zstd).unwrap();
        let mut bytes = Vec::new();
        write_dimg(&header, blob, &mut bytes).unwrap();
        DimgFile::from_vec(bytes).unwrap()
    }

    #[test]
    fn test_apply_base_then_diff() -> Result<()> {
        let (g1, b1) = image(&[
            ("etc/os-release", "ID=one\n".as_bytes()),
            ("bin/tool", "binary payload v1 with padding".as_bytes()),
        ]);
        let (g2, b2) = image(&[
            ("etc/os-release", "ID=one\n".as_bytes()),
            ("bin/tool", "binary payload v2 with padding".as_bytes()),
            ("new.txt", "fresh".as_bytes()),
        ]);
        let (d, db) = diff_trees(&g1, &g2, &b1, &b2, &DiffConfig::default())?;
        let base = dimg(g1.clone(), None, &b1);
        let diff = dimg(d, g1.digest, &db);

        let dir = tempfile::tempdir()?;
        let v1 = dir.path().join("v1");
        let v2 = dir.path().join("v2");
        let options = PatchOptions {
            verify: true,
            ..Default::default()
        };
        assert_eq!(apply_patch(None, &v1, &base, &options)?, 2);
        apply_patch(Some(&v1), &v2, &diff, &options)?;

        assert_eq!(fs::read(v2.join("etc/os-release"))?, b"ID=one\n");
        assert_eq!(fs::read(v2.join("bin/tool"))?, b"binary payload v2 with padding");
        assert_eq!(fs::read(v2.join("new.txt"))?, b"fresh");
        Ok(())
    }

    #[test]
    fn test_links_and_markers() -> Result<()> {
        let (mut tree, blob) = image(&[("data/file", "content".as_bytes())]);
        let mut link = FileEntry::new("", EntryType::Symlink);
        link.real_path = "data/file".into();
        tree.insert_at("link", link)?;
        let mut hard = FileEntry::new("", EntryType::Hardlink);
        hard.real_path = "data/file".into();
        tree.insert_at("zz-hard", hard)?;
        tree.lookup_mut("data")?.opaque_files.push(".wh..wh..opq".into());
        for name in ["link", "zz-hard"] {
            let e = tree.lookup_mut(name)?;
            e.digest = Some(e.generate_digest(&[])?);
        }
        tree.refresh_dir_digests()?;

        let dir = tempfile::tempdir()?;
        let out = dir.path().join("out");
        apply_patch(None, &out, &dimg(tree, None, &blob), &PatchOptions::default())?;

        assert_eq!(fs::read_link(out.join("link"))?, Path::new("data/file"));
        assert_eq!(fs::read(out.join("zz-hard"))?, b"content");
        let marker = fs::metadata(out.join("data/.wh..wh..opq"))?;
        assert_eq!(marker.permissions().mode() & 0o777, OPAQUE_MODE);
        Ok(())
    }

    #[test]
    fn test_names_cannot_leave_output_dir() -> Result<()> {
        let (mut tree, blob) = image(&[("f", "content".as_bytes())]);
        let f = tree.childs.remove("f").unwrap();
        tree.childs.insert("../escape.txt".into(), f);
        tree.refresh_dir_digests()?;
        let header = DimgHeader::new(tree, None, CompressionMode::Zstd)?;
        let mut bytes = Vec::new();
        write_dimg(&header, &blob, &mut bytes)?;
        assert!(matches!(DimgFile::from_vec(bytes), Err(ImageError::Format(_))));
        Ok(())
    }

    #[test]
    fn test_hardlink_through_symlink_rejected() -> Result<()> {
        let (mut tree, blob) = image(&[("f", "content".as_bytes())]);
        let mut link = FileEntry::new("", EntryType::Symlink);
        link.real_path = "/etc".into();
        tree.insert_at("etc", link)?;
        let mut hard = FileEntry::new("", EntryType::Hardlink);
        hard.real_path = "etc/passwd".into();
        tree.insert_at("pw", hard)?;
        for name in ["etc", "pw"] {
            let e = tree.lookup_mut(name)?;
            e.digest = Some(e.generate_digest(&[])?);
        }
        tree.refresh_dir_digests()?;

        let dir = tempfile::tempdir()?;
        let out = dir.path().join("out");
        let img = dimg(tree, None, &blob);
        assert!(apply_patch(None, &out, &img, &PatchOptions::default()).is_err());
        assert!(!out.join("pw").exists());
        Ok(())
    }

    #[test]
    fn test_diff_needs_base_dir() -> Result<()> {
        let (g1, b1) = image(&[("f", "aaaa".as_bytes())]);
        let (g2, b2) = image(&[("f", "aaab".as_bytes())]);
        let (d, db) = diff_trees(&g1, &g2, &b1, &b2, &DiffConfig::default())?;
        let diff = dimg(d, g1.digest, &db);
        let dir = tempfile::tempdir()?;
        assert!(apply_patch(None, &dir.path().join("o"), &diff, &PatchOptions::default()).is_err());
        Ok(())
    }
}
