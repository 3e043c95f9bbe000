//! Pipeline settings for diffing and merging

use crate::error::ImageError;
use crate::Result;
use bsdiffx::{CompressionMode, DeltaPlugin, PluginRegistry};
use std::sync::Arc;
use std::thread;

/// Number of workers used when none is configured
pub fn default_threads() -> usize {
    thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

/// Find the implementation recorded on an entry (empty name = default)
pub fn plugin_by_name<'a>(
    registry: &'a PluginRegistry,
    name: &str,
) -> Result<&'a Arc<dyn DeltaPlugin>> {
    registry
        .by_name(name)
        .ok_or_else(|| ImageError::Format(format!("unknown delta plugin {:?}", name)))
}

/// Settings for the tree differ
#[derive(Debug, Clone)]
pub struct DiffConfig {
    /// Worker count
    pub threads: usize,
    /// Compression of newly produced delta bodies
    pub compression_mode: CompressionMode,
    /// Store changed files as deltas; when off they are stored whole
    pub binary_diff: bool,
    /// Diff gzip files on their decompressed content
    pub gzip_aware: bool,
    pub plugins: PluginRegistry,
}

impl Default for DiffConfig {
    fn default() -> Self {
        Self {
            threads: default_threads(),
            compression_mode: CompressionMode::default(),
            binary_diff: true,
            gzip_aware: false,
            plugins: PluginRegistry::default(),
        }
    }
}

impl DiffConfig {
    /// Worker count, never zero
    pub fn workers(&self) -> usize {
        self.threads.max(1)
    }
}

/// Settings for the tree merger
#[derive(Debug, Clone)]
pub struct MergeConfig {
    /// Worker count
    pub threads: usize,
    /// Re-decode merged deltas and compare them with the merged blocks
    pub verify: bool,
    /// Merge the two halves of a chain in parallel
    pub concurrent_merges: bool,
    pub plugins: PluginRegistry,
}

impl Default for MergeConfig {
    fn default() -> Self {
        Self {
            threads: default_threads(),
            verify: false,
            concurrent_merges: true,
            plugins: PluginRegistry::default(),
        }
    }
}

impl MergeConfig {
    pub fn workers(&self) -> usize {
        self.threads.max(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let diff = DiffConfig::default();
        assert!(diff.threads >= 1);
        assert!(diff.binary_diff);
        assert_eq!(diff.compression_mode, CompressionMode::Zstd);

        let merge = MergeConfig {
            threads: 0,
            ..Default::default()
        };
        assert_eq!(merge.workers(), 1);
    }

    #[test]
    fn test_plugin_by_name() {
        let registry = PluginRegistry::default();
        assert_eq!(plugin_by_name(&registry, "").unwrap().name(), "bsdiffx");
        assert_eq!(plugin_by_name(&registry, "bsdiffx").unwrap().name(), "bsdiffx");
        assert!(plugin_by_name(&registry, "xdelta3").is_err());
    }
}
