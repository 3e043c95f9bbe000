//! Create a diff image

use crate::util;
use anyhow::{Context, Result};
use image::{diff_dimg_files, pack_diff_dirs, write_dimg_file, DiffConfig, DimgHeader};
use owo_colors::OwoColorize;
use std::fs;
use std::path::Path;

pub fn run(old: &Path, new: &Path, output: &Path, config: &DiffConfig) -> Result<()> {
    let header = if old.is_dir() && new.is_dir() {
        let (header, blob) = pack_diff_dirs(old, new, config)
            .with_context(|| format!("Failed to diff {} and {}", old.display(), new.display()))?;
        write_dimg_file(output, &header, &blob)
            .with_context(|| format!("Failed to write {}", output.display()))?;
        header
    } else {
        let old_img = util::open(old)?;
        let new_img = util::open(new)?;
        diff_dimg_files(&old_img, &new_img, output, config)
            .with_context(|| format!("Failed to diff {} and {}", old.display(), new.display()))?
    };
    print_summary(output, &header)
}

fn print_summary(output: &Path, header: &DimgHeader) -> Result<()> {
    let size = fs::metadata(output)?.len();
    let mut counts = [0usize; 3];
    header.file_entry.walk(|_, entry| {
        match entry.entry_type {
            image::EntryType::FileNew => counts[0] += 1,
            image::EntryType::FileSame => counts[1] += 1,
            image::EntryType::FileDiff => counts[2] += 1,
            _ => {}
        }
        Ok(())
    })?;

    println!("{} {}", "diff".green().bold(), output.display());
    println!("{} {}", "Id:        ".dimmed(), header.id.to_string().cyan());
    if let Some(parent) = header.parent_id {
        println!("{} {}", "Parent:    ".dimmed(), parent.to_string().cyan());
    }
    println!(
        "{} {} new, {} same, {} diff",
        "Files:     ".dimmed(),
        counts[0],
        counts[1],
        counts[2]
    );
    println!("{} {}", "Size:      ".dimmed(), util::format_bytes(size));
    Ok(())
}
