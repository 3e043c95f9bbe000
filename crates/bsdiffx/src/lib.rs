//! Binary delta codec and delta merging
//!
//! This crate provides:
//! - The bsdiffx stream container (length header + compression envelope)
//! - bsdiff-based diff and a bounds-checked patch decoder
//! - Merging of two consecutive deltas into one without the original files
//! - A registry of delta implementations keyed by extension, name or size

pub mod block;
pub mod codec;
pub mod compression;
pub mod error;
pub mod merge;
pub mod offt;
pub mod plugin;

// Re-exports
pub use block::DiffBlock;
pub use codec::{diff, patch, DeltaHeader, DeltaStream};
pub use compression::CompressionMode;
pub use error::DeltaError;
pub use merge::{merge_blocks, merge_patches, merge_patches_verified, Verifier};
pub use plugin::{Bsdiffx, DeltaPlugin, PluginRegistry, DEFAULT_PLUGIN};

/// Result type for delta operations
pub type Result<T> = std::result::Result<T, DeltaError>;
