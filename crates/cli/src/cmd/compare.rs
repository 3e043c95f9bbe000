//! Compare two images of the same snapshot

use crate::util;
use anyhow::{Context, Result};
use image::compare_entries;
use owo_colors::OwoColorize;
use std::path::Path;

pub fn run(a: &Path, b: &Path, json: bool) -> Result<()> {
    let img_a = util::open(a)?;
    let img_b = util::open(b)?;
    let records = compare_entries(img_a.root(), img_b.root()).with_context(|| {
        format!(
            "{} and {} do not describe the same tree",
            a.display(),
            b.display()
        )
    })?;

    if json {
        println!("{}", serde_json::to_string_pretty(&records)?);
        return Ok(());
    }

    let (mut total_a, mut total_b) = (0u64, 0u64);
    for r in &records {
        total_a += r.a_compressed_size;
        total_b += r.b_compressed_size;
        let line = format!(
            "{:<48} {:>10}  {:<9} {:>10}  {:<9} {:>10}",
            r.path,
            r.file_size,
            r.a_type.as_str(),
            r.a_compressed_size,
            r.b_type.as_str(),
            r.b_compressed_size
        );
        if r.a_type != r.b_type {
            println!("{}", line.yellow());
        } else {
            println!("{}", line);
        }
    }
    println!(
        "\n{} {} files, a={} b={}",
        "Total:".bold(),
        records.len(),
        util::format_bytes(total_a),
        util::format_bytes(total_b)
    );
    Ok(())
}
