//! Materialize an image into a directory

use crate::util;
use anyhow::{Context, Result};
use image::{apply_patch, PatchOptions};
use owo_colors::OwoColorize;
use std::path::Path;

pub fn run(image: &Path, output: &Path, base: Option<&Path>, verify: bool) -> Result<()> {
    if output.exists() {
        anyhow::bail!("Output {} already exists", output.display());
    }
    let dimg = util::open(image)?;
    let options = PatchOptions {
        verify,
        ..Default::default()
    };
    let files = apply_patch(base, output, &dimg, &options)
        .with_context(|| format!("Failed to apply {}", image.display()))?;

    println!(
        "{} {} files into {}",
        "wrote".green().bold(),
        files,
        output.display()
    );
    Ok(())
}
