//! Layered filesystem images built from binary deltas
//!
//! This crate provides:
//! - The file-entry tree that describes a snapshot and how each file is stored
//! - The dimg container (header + body blob) and the cdimg wrapper carrying an OCI config
//! - A directory packer, a tree differ and a tree merger running on a worker pool
//! - Patch-apply onto disk and a read-only view over a chain of layers
//! - A directory-backed store that finds the shortest chain to a base image

pub mod cdimg;
pub mod chain;
pub mod compare;
pub mod compress;
pub mod config;
pub mod diff;
pub mod digest;
pub mod dimg;
pub mod entry;
pub mod error;
pub mod merge;
pub mod pack;
pub mod patch;
pub(crate) mod pool;
pub mod store;

// Re-exports
pub use cdimg::{open_image, pack_cdimg, CdimgFile, CdimgHead, Manifest};
pub use chain::{Attr, ImageChain};
pub use compare::{compare_entries, CompareRecord};
pub use config::{DiffConfig, MergeConfig};
pub use diff::{diff_dimg_files, diff_trees};
pub use digest::{digest_bytes, digest_file, Digest};
pub use dimg::{write_dimg, write_dimg_file, DimgFile, DimgHeader};
pub use entry::{EntryType, FileEntry};
pub use error::ImageError;
pub use merge::{
    merge_cdimg, merge_chain_bisect, merge_chain_linear, merge_dimg_files, merge_dimgs,
    merge_trees,
};
pub use pack::{pack_diff_dirs, pack_dir, pack_dir_to_dimg};
pub use patch::{apply_patch, PatchOptions};
pub use store::{DimgStore, StoreEntry};

/// Result type for image operations
pub type Result<T> = std::result::Result<T, ImageError>;
