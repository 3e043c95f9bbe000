//! Pack a directory into a base image

use crate::util;
use anyhow::{Context, Result};
use image::config::default_threads;
use image::pack_dir_to_dimg;
use owo_colors::OwoColorize;
use std::fs;
use std::path::Path;

pub fn run(dir: &Path, output: &Path, threads: Option<usize>) -> Result<()> {
    let threads = threads.unwrap_or_else(default_threads);
    let header = pack_dir_to_dimg(dir, output, threads)
        .with_context(|| format!("Failed to pack {}", dir.display()))?;
    let size = fs::metadata(output)?.len();

    println!("{} {}", "packed".green().bold(), output.display());
    println!("{} {}", "Id:        ".dimmed(), header.id.to_string().cyan());
    println!("{} {}", "Size:      ".dimmed(), util::format_bytes(size));
    Ok(())
}
