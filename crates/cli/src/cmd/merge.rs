//! Merge a chain of images

use crate::MergeMode;
use anyhow::{Context, Result};
use image::{merge_chain_bisect, merge_chain_linear, MergeConfig};
use owo_colors::OwoColorize;
use std::path::{Path, PathBuf};
use std::time::Instant;

pub fn run(
    images: &[PathBuf],
    output: &Path,
    mode: MergeMode,
    tmp_dir: Option<&Path>,
    config: &MergeConfig,
) -> Result<()> {
    let tmp_dir = match tmp_dir {
        Some(dir) => dir.to_path_buf(),
        None => output
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from(".")),
    };

    let start = Instant::now();
    let header = match mode {
        MergeMode::Linear => merge_chain_linear(images, output, &tmp_dir, config),
        MergeMode::Bisect => merge_chain_bisect(images, output, &tmp_dir, config),
    }
    .with_context(|| format!("Failed to merge {} images", images.len()))?;

    println!(
        "{} {} images into {} ({:.2}s)",
        "merged".green().bold(),
        images.len(),
        output.display(),
        start.elapsed().as_secs_f64()
    );
    println!("{} {}", "Id:        ".dimmed(), header.id.to_string().cyan());
    match header.parent_id {
        Some(parent) => println!("{} {}", "Parent:    ".dimmed(), parent.to_string().cyan()),
        None => println!("{} {}", "Parent:    ".dimmed(), "(none - base image)".dimmed()),
    }
    Ok(())
}
