//! d4c - delta container image tool

use anyhow::Result;
use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

mod cmd;
mod config;
mod util;

/// d4c - Build, diff, merge and apply delta container images
#[derive(Parser)]
#[command(name = "d4c")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Config file (default: $XDG_CONFIG_HOME/d4c/config.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Worker threads (overrides the config file)
    #[arg(long, global = true)]
    threads: Option<usize>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, ValueEnum)]
pub enum MergeMode {
    /// Fold the chain pairwise from the bottom
    Linear,
    /// Merge halves recursively
    Bisect,
}

#[derive(Subcommand)]
enum Commands {
    /// Pack a directory into a base image
    Pack {
        /// Root directory to pack
        dir: PathBuf,
        /// Output dimg
        #[arg(short, long)]
        output: PathBuf,
    },
    /// Create a diff image between two images or two directories
    Diff {
        /// Old image (dimg, cdimg or directory)
        old: PathBuf,
        /// New image (dimg, cdimg or directory)
        new: PathBuf,
        /// Output dimg
        #[arg(short, long)]
        output: PathBuf,
        /// Delta compression (zstd or bzip2)
        #[arg(long)]
        compression: Option<String>,
        /// Store changed files whole instead of as deltas
        #[arg(long)]
        no_binary_diff: bool,
        /// Diff gzip files on their decompressed content
        #[arg(long)]
        gzip_aware: bool,
    },
    /// Merge consecutive images into one
    Merge {
        /// Images newest first; each must sit on the next one
        #[arg(required = true, num_args = 2..)]
        images: Vec<PathBuf>,
        /// Output image (.cdimg keeps the newest config)
        #[arg(short, long)]
        output: PathBuf,
        /// Chain reduction strategy
        #[arg(long, value_enum, default_value = "bisect")]
        mode: MergeMode,
        /// Check merged deltas block by block
        #[arg(long)]
        verify: bool,
        /// Directory for intermediate images (default: next to the output)
        #[arg(long)]
        tmp_dir: Option<PathBuf>,
    },
    /// Materialize an image into a directory
    Patch {
        /// Image to apply
        image: PathBuf,
        /// Output directory (must not exist)
        output: PathBuf,
        /// Materialized parent snapshot (required for diff images)
        #[arg(short, long)]
        base: Option<PathBuf>,
        /// Verify file digests while writing
        #[arg(long)]
        verify: bool,
    },
    /// Show an image's header and tree
    Show {
        image: PathBuf,
        /// Print the full file tree
        #[arg(long)]
        tree: bool,
    },
    /// Compare how two images of the same snapshot store each file
    Compare {
        a: PathBuf,
        b: PathBuf,
        /// Print records as JSON
        #[arg(long)]
        json: bool,
    },
    /// Wrap a dimg and an OCI config into a cdimg
    Cdimg {
        /// OCI image config (JSON)
        #[arg(value_name = "CONFIG")]
        oci_config: PathBuf,
        /// Image to wrap
        dimg: PathBuf,
        #[arg(short, long)]
        output: PathBuf,
        /// Also write the OCI manifest to this path
        #[arg(long)]
        manifest: Option<PathBuf>,
    },
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let config = config::load(cli.config.as_deref())?;
    tracing::debug!("loaded config: {:?}", config);
    let threads = cli.threads;

    match cli.command {
        Commands::Pack { dir, output } => {
            let threads = threads.or(config.diff.threads);
            cmd::pack::run(&dir, &output, threads)
        }
        Commands::Diff {
            old,
            new,
            output,
            compression,
            no_binary_diff,
            gzip_aware,
        } => {
            let mut diff = config.diff_config()?;
            if let Some(t) = threads {
                diff.threads = t;
            }
            if let Some(mode) = compression {
                diff.compression_mode = util::parse_compression(&mode)?;
            }
            if no_binary_diff {
                diff.binary_diff = false;
            }
            if gzip_aware {
                diff.gzip_aware = true;
            }
            cmd::diff::run(&old, &new, &output, &diff)
        }
        Commands::Merge {
            images,
            output,
            mode,
            verify,
            tmp_dir,
        } => {
            let mut merge = config.merge_config();
            if let Some(t) = threads {
                merge.threads = t;
            }
            if verify {
                merge.verify = true;
            }
            cmd::merge::run(&images, &output, mode, tmp_dir.as_deref(), &merge)
        }
        Commands::Patch {
            image,
            output,
            base,
            verify,
        } => cmd::patch::run(&image, &output, base.as_deref(), verify),
        Commands::Show { image, tree } => cmd::show::run(&image, tree),
        Commands::Compare { a, b, json } => cmd::compare::run(&a, &b, json),
        Commands::Cdimg {
            oci_config,
            dimg,
            output,
            manifest,
        } => cmd::cdimg::run(&oci_config, &dimg, &output, manifest.as_deref()),
    }
}
