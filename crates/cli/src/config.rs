//! User configuration
//!
//! Read from `$XDG_CONFIG_HOME/d4c/config.toml` (or `--config`). Every key
//! is optional; unset keys keep the library defaults and command-line flags
//! win over the file.

use anyhow::{Context, Result};
use bsdiffx::CompressionMode;
use image::{DiffConfig, MergeConfig};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub diff: DiffSection,
    pub merge: MergeSection,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DiffSection {
    pub threads: Option<usize>,
    /// `"zstd"` or `"bzip2"`
    pub compression: Option<String>,
    pub binary_diff: Option<bool>,
    pub gzip_aware: Option<bool>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct MergeSection {
    pub threads: Option<usize>,
    pub verify: Option<bool>,
    pub concurrent_merges: Option<bool>,
}

/// Default config location
pub fn config_file_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("d4c").join("config.toml"))
}

/// Load `path`, or the default location when `None`
///
/// An explicitly given file must exist; a missing default file yields the
/// defaults.
pub fn load(path: Option<&Path>) -> Result<Config> {
    let path = match path {
        Some(p) => p.to_path_buf(),
        None => match config_file_path() {
            Some(p) if p.exists() => p,
            _ => return Ok(Config::default()),
        },
    };
    let text = fs::read_to_string(&path)
        .with_context(|| format!("Failed to read config {}", path.display()))?;
    parse(&text).with_context(|| format!("Invalid config {}", path.display()))
}

pub fn parse(text: &str) -> Result<Config> {
    Ok(toml::from_str(text)?)
}

impl Config {
    pub fn diff_config(&self) -> Result<DiffConfig> {
        let mut config = DiffConfig::default();
        if let Some(threads) = self.diff.threads {
            config.threads = threads;
        }
        if let Some(mode) = &self.diff.compression {
            config.compression_mode = mode
                .parse::<CompressionMode>()
                .with_context(|| format!("Unknown compression mode '{}'", mode))?;
        }
        if let Some(v) = self.diff.binary_diff {
            config.binary_diff = v;
        }
        if let Some(v) = self.diff.gzip_aware {
            config.gzip_aware = v;
        }
        Ok(config)
    }

    pub fn merge_config(&self) -> MergeConfig {
        let mut config = MergeConfig::default();
        if let Some(threads) = self.merge.threads {
            config.threads = threads;
        }
        if let Some(v) = self.merge.verify {
            config.verify = v;
        }
        if let Some(v) = self.merge.concurrent_merges {
            config.concurrent_merges = v;
        }
        config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_sections() -> Result<()> {
        let config = parse(
            r#"
            [diff]
            threads = 3
            compression = "bzip2"
            gzip_aware = true

            [merge]
            verify = true
            "#,
        )?;
        let diff = config.diff_config()?;
        assert_eq!(diff.threads, 3);
        assert_eq!(diff.compression_mode, CompressionMode::Bzip2);
        assert!(diff.gzip_aware);
        assert!(diff.binary_diff);

        let merge = config.merge_config();
        assert!(merge.verify);
        assert!(merge.concurrent_merges);
        Ok(())
    }

    #[test]
    fn test_rejects_bad_values() {
        assert!(parse("[diff]\nthreads = \"many\"").is_err());
        assert!(parse("[daemon]\nx = 1").is_err());
        let config = parse("[diff]\ncompression = \"lzma\"").unwrap();
        assert!(config.diff_config().is_err());
    }

    #[test]
    fn test_missing_explicit_file() -> Result<()> {
        let dir = tempfile::tempdir()?;
        assert!(load(Some(&dir.path().join("nope.toml"))).is_err());
        let path = dir.path().join("c.toml");
        fs::write(&path, "[merge]\nthreads = 2\n")?;
        assert_eq!(load(Some(&path))?.merge_config().threads, 2);
        Ok(())
    }
}
