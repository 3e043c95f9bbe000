//! Wrap a dimg with an OCI config

use crate::util;
use anyhow::{Context, Result};
use image::{pack_cdimg, CdimgFile};
use owo_colors::OwoColorize;
use std::fs;
use std::path::Path;

pub fn run(config: &Path, dimg: &Path, output: &Path, manifest: Option<&Path>) -> Result<()> {
    let size = pack_cdimg(config, dimg, output)
        .with_context(|| format!("Failed to build {}", output.display()))?;
    let cdimg = CdimgFile::open(output)
        .with_context(|| format!("Failed to reopen {}", output.display()))?;

    println!("{} {}", "cdimg".green().bold(), output.display());
    println!("{} {}", "Id:        ".dimmed(), cdimg.dimg().id().to_string().cyan());
    println!("{} {}", "Size:      ".dimmed(), util::format_bytes(size));

    if let Some(path) = manifest {
        let bytes = serde_json::to_vec_pretty(&cdimg.manifest())?;
        fs::write(path, bytes)
            .with_context(|| format!("Failed to write manifest {}", path.display()))?;
        println!("{} {}", "Manifest:  ".dimmed(), path.display());
    }
    Ok(())
}
