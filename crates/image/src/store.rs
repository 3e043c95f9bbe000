//! Directory-backed image store
//!
//! Every dimg lives at `<file digest>.dimg` inside the store directory. The
//! in-memory index is keyed by file digest, so several dimgs may share a
//! snapshot id (a plain diff and a merged one, for example). Chains are
//! found by a breadth-first search over parent links, which prefers merged
//! images because they skip intermediate layers.

use crate::dimg::DimgFile;
use crate::digest::Digest;
use crate::error::ImageError;
use crate::Result;
use dashmap::DashMap;
use std::collections::{HashMap, HashSet, VecDeque};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Index record for one stored dimg
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreEntry {
    pub path: PathBuf,
    pub id: Digest,
    pub parent_id: Option<Digest>,
    /// sha256 of the whole dimg file
    pub file_digest: Digest,
}

impl StoreEntry {
    fn from_dimg(dimg: &DimgFile, path: PathBuf) -> Self {
        Self {
            path,
            id: dimg.id(),
            parent_id: dimg.parent_id(),
            file_digest: dimg.file_digest(),
        }
    }
}

#[derive(Debug)]
pub struct DimgStore {
    dir: PathBuf,
    entries: DashMap<Digest, StoreEntry>,
}

impl DimgStore {
    /// Open (creating if needed) a store directory and index its dimgs
    pub fn open(dir: &Path) -> Result<Self> {
        fs::create_dir_all(dir)?;
        let store = Self {
            dir: dir.to_path_buf(),
            entries: DashMap::new(),
        };
        store.rescan()?;
        Ok(store)
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Rebuild the index from the directory contents
    ///
    /// Anything that is not a readable dimg is skipped.
    pub fn rescan(&self) -> Result<usize> {
        self.entries.clear();
        for item in fs::read_dir(&self.dir)? {
            let item = item?;
            let path = item.path();
            if !item.file_type()?.is_file() {
                info!("{} is not a regular file, ignored", path.display());
                continue;
            }
            let dimg = match DimgFile::open(&path) {
                Ok(dimg) => dimg,
                Err(e) => {
                    info!("{} is not a valid dimg, ignored: {}", path.display(), e);
                    continue;
                }
            };
            let entry = StoreEntry::from_dimg(&dimg, path);
            self.entries.insert(entry.file_digest, entry);
        }
        info!("indexed {} dimgs in {}", self.entries.len(), self.dir.display());
        Ok(self.entries.len())
    }

    /// Move a dimg file into the store
    pub fn add_dimg(&self, src: &Path) -> Result<StoreEntry> {
        let dimg = DimgFile::open(src)?;
        let dest = self.dir.join(format!("{}.dimg", dimg.file_digest().to_hex()));
        drop(dimg);
        fs::rename(src, &dest)?;

        let dimg = DimgFile::open(&dest)?;
        let entry = StoreEntry::from_dimg(&dimg, dest);
        debug!(
            "stored {} (id={}, parent={:?})",
            entry.path.display(),
            entry.id,
            entry.parent_id
        );
        self.entries.insert(entry.file_digest, entry.clone());
        Ok(entry)
    }

    /// Look up a dimg by file digest
    pub fn get(&self, file_digest: &Digest) -> Option<StoreEntry> {
        self.entries.get(file_digest).map(|e| e.value().clone())
    }

    /// All entries sorted by path
    pub fn list(&self) -> Vec<StoreEntry> {
        let mut all: Vec<StoreEntry> = self.entries.iter().map(|e| e.value().clone()).collect();
        all.sort_by(|a, b| a.path.cmp(&b.path));
        all
    }

    /// Shortest newest-first chain from snapshot `id` down to a base image
    pub fn chain_to_base(&self, id: &Digest) -> Result<Vec<StoreEntry>> {
        self.chain_to_any(id, &[None])
    }

    /// Shortest newest-first chain from snapshot `id` to any of `goals`
    ///
    /// A goal of `None` means "down to a base image"; `Some(g)` stops on a
    /// layer whose parent is `g`.
    pub fn chain_to_any(&self, id: &Digest, goals: &[Option<Digest>]) -> Result<Vec<StoreEntry>> {
        // snapshot id -> dimgs leaving it, sorted for a stable choice
        let mut edges: HashMap<Digest, Vec<StoreEntry>> = HashMap::new();
        for e in self.entries.iter() {
            edges.entry(e.id).or_default().push(e.value().clone());
        }
        for out in edges.values_mut() {
            out.sort_by(|a, b| a.path.cmp(&b.path));
        }

        let start = Some(*id);
        let mut prev: HashMap<Option<Digest>, (Option<Digest>, StoreEntry)> = HashMap::new();
        let mut seen: HashSet<Option<Digest>> = HashSet::from([start]);
        let mut queue = VecDeque::from([start]);

        while let Some(node) = queue.pop_front() {
            if node != start && goals.contains(&node) {
                let mut chain = Vec::new();
                let mut cur = node;
                while cur != start {
                    let (from, entry) = prev
                        .get(&cur)
                        .cloned()
                        .ok_or_else(|| ImageError::Format("broken store path".into()))?;
                    chain.push(entry);
                    cur = from;
                }
                chain.reverse();
                return Ok(chain);
            }
            let Some(node_id) = node else { continue };
            for entry in edges.get(&node_id).into_iter().flatten() {
                let next = entry.parent_id;
                if seen.insert(next) {
                    prev.insert(next, (node, entry.clone()));
                    queue.push_back(next);
                }
            }
        }
        Err(ImageError::NotFound(format!("no chain from {} in {}", id, self.dir.display())))
    }

    /// Chain from `id` to a base image, opened and ready for reading
    pub fn open_chain(&self, id: &Digest) -> Result<Vec<DimgFile>> {
        self.chain_to_base(id)?
            .iter()
            .map(|e| DimgFile::open(&e.path))
            .collect()
    }
}
