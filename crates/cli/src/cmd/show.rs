//! Show an image's header and tree

use crate::util;
use anyhow::Result;
use image::{DimgFile, EntryType};
use owo_colors::OwoColorize;
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

pub fn run(path: &Path, show_tree: bool) -> Result<()> {
    let dimg = util::open(path)?;
    let header = dimg.header();

    println!("{} {}", "image".yellow().bold(), header.id.to_string().cyan());
    match header.parent_id {
        Some(parent) => println!("{} {}", "Parent:    ".dimmed(), parent.to_string().cyan()),
        None => println!("{} {}", "Parent:    ".dimmed(), "(none - base image)".dimmed()),
    }
    println!("{} {}", "Delta:     ".dimmed(), header.compression_mode);
    println!(
        "{} {} ({} in bodies)",
        "Size:      ".dimmed(),
        util::format_bytes(fs::metadata(path)?.len()),
        util::format_bytes(header.file_entry.total_compressed_size())
    );
    println!("{} {}", "Digest:    ".dimmed(), util::short(&dimg.file_digest()));

    print_counts(&dimg)?;

    if show_tree {
        println!("\n{}", "Tree:".bold());
        print!("{}", header.file_entry.print_tree());
    }
    Ok(())
}

fn print_counts(dimg: &DimgFile) -> Result<()> {
    let mut counts: BTreeMap<&'static str, (usize, u64)> = BTreeMap::new();
    dimg.root().walk(|_, entry| {
        let slot = counts.entry(entry.entry_type.as_str()).or_default();
        slot.0 += 1;
        if matches!(entry.entry_type, EntryType::FileNew | EntryType::FileDiff) {
            slot.1 += entry.compressed_size;
        }
        Ok(())
    })?;

    println!("\n{}", "Entries:".bold());
    for (kind, (count, stored)) in counts {
        if stored > 0 {
            println!("  {:<10} {:>6}  {}", kind.cyan(), count, util::format_bytes(stored).dimmed());
        } else {
            println!("  {:<10} {:>6}", kind.cyan(), count);
        }
    }
    Ok(())
}
