//! Delta capability registry
//!
//! Files can be routed to different delta implementations by extension or
//! by size. Implementations are compiled in and registered by name; the
//! name is what gets recorded next to a stored delta so the same
//! implementation can be found again to patch or merge it.

use crate::codec;
use crate::compression::CompressionMode;
use crate::merge;
use crate::Result;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

/// Name of the compiled-in default implementation
pub const DEFAULT_PLUGIN: &str = "bsdiffx";

/// A delta implementation
pub trait DeltaPlugin: Send + Sync {
    /// Registry name, recorded alongside every delta this plugin produces
    fn name(&self) -> &str;

    /// Human readable description
    fn info(&self) -> &str {
        ""
    }

    fn diff(&self, old: &[u8], new: &[u8], mode: CompressionMode) -> Result<Vec<u8>>;

    fn patch(&self, old: &[u8], delta: &[u8]) -> Result<Vec<u8>>;

    /// Combine a lower (A -> B) and upper (B -> C) delta into A -> C
    fn merge(&self, lower: &[u8], upper: &[u8]) -> Result<Vec<u8>>;

    /// Whether two file bodies count as identical
    fn compare(&self, a: &[u8], b: &[u8]) -> bool {
        a == b
    }
}

/// bsdiff with the bsdiffx container and block merging
#[derive(Debug, Default, Clone, Copy)]
pub struct Bsdiffx;

impl DeltaPlugin for Bsdiffx {
    fn name(&self) -> &str {
        DEFAULT_PLUGIN
    }

    fn info(&self) -> &str {
        "Default plugin with bsdiffx"
    }

    fn diff(&self, old: &[u8], new: &[u8], mode: CompressionMode) -> Result<Vec<u8>> {
        codec::diff(old, new, mode)
    }

    fn patch(&self, old: &[u8], delta: &[u8]) -> Result<Vec<u8>> {
        codec::patch(old, delta)
    }

    fn merge(&self, lower: &[u8], upper: &[u8]) -> Result<Vec<u8>> {
        merge::merge_patches(lower, upper)
    }
}

/// Size threshold route: files strictly larger than `min_size` use `plugin`
#[derive(Clone)]
struct SizeRoute {
    min_size: u64,
    plugin: Arc<dyn DeltaPlugin>,
}

/// Lookup table from extension, name or size to a delta implementation
#[derive(Clone)]
pub struct PluginRegistry {
    default: Arc<dyn DeltaPlugin>,
    by_name: HashMap<String, Arc<dyn DeltaPlugin>>,
    by_ext: HashMap<String, Arc<dyn DeltaPlugin>>,
    by_size: Vec<SizeRoute>,
}

impl Default for PluginRegistry {
    fn default() -> Self {
        Self::new(Arc::new(Bsdiffx))
    }
}

impl std::fmt::Debug for PluginRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut names: Vec<&String> = self.by_name.keys().collect();
        names.sort();
        f.debug_struct("PluginRegistry")
            .field("default", &self.default.name())
            .field("plugins", &names)
            .finish()
    }
}

impl PluginRegistry {
    /// Create a registry with the given default implementation
    pub fn new(default: Arc<dyn DeltaPlugin>) -> Self {
        let mut by_name = HashMap::new();
        by_name.insert(default.name().to_string(), default.clone());
        Self {
            default,
            by_name,
            by_ext: HashMap::new(),
            by_size: Vec::new(),
        }
    }

    /// Register an implementation under its own name
    pub fn register(&mut self, plugin: Arc<dyn DeltaPlugin>) {
        debug!("registered delta plugin {}", plugin.name());
        self.by_name.insert(plugin.name().to_string(), plugin);
    }

    /// Route files with extension `ext` (without the dot) to `plugin`
    pub fn register_ext(&mut self, ext: &str, plugin: Arc<dyn DeltaPlugin>) {
        self.by_ext
            .insert(ext.trim_start_matches('.').to_string(), plugin.clone());
        self.register(plugin);
    }

    /// Route files larger than `min_size` bytes to `plugin`
    pub fn register_size(&mut self, min_size: u64, plugin: Arc<dyn DeltaPlugin>) {
        self.by_size.push(SizeRoute {
            min_size,
            plugin: plugin.clone(),
        });
        self.by_size.sort_by(|a, b| b.min_size.cmp(&a.min_size));
        self.register(plugin);
    }

    pub fn default_plugin(&self) -> &Arc<dyn DeltaPlugin> {
        &self.default
    }

    /// Look up by registry name; an empty name means the default
    pub fn by_name(&self, name: &str) -> Option<&Arc<dyn DeltaPlugin>> {
        if name.is_empty() {
            return Some(&self.default);
        }
        self.by_name.get(name)
    }

    /// Look up by extension, falling back to the default
    pub fn by_ext(&self, ext: &str) -> &Arc<dyn DeltaPlugin> {
        self.by_ext
            .get(ext.trim_start_matches('.'))
            .unwrap_or(&self.default)
    }

    /// Look up by size, falling back to the default
    pub fn by_size(&self, size: u64) -> &Arc<dyn DeltaPlugin> {
        self.by_size
            .iter()
            .find(|route| size > route.min_size)
            .map(|route| &route.plugin)
            .unwrap_or(&self.default)
    }

    /// Choose the implementation for a file: extension first, then size
    pub fn select(&self, file_name: &str, size: u64) -> &Arc<dyn DeltaPlugin> {
        if let Some(plugin) = file_name
            .rsplit_once('.')
            .and_then(|(_, ext)| self.by_ext.get(ext))
        {
            return plugin;
        }
        self.by_size(size)
    }
}
