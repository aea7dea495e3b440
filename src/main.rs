//! modarc - Bethesda archive codec and mod archive extraction

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use std::collections::{BTreeMap, HashSet};
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

use modarc::archive::{btar, signature};
use modarc::bsa::{self, BsaArchive};
use modarc::hash::{compute_file_hash, hash_bytes, hash_reader, ContentHash};
use modarc::{CancellationToken, ExtractorConfig, FileExtractor, NativeFileStreamFactory, Progress, StreamFactory};

#[derive(Parser)]
#[command(name = "modarc")]
#[command(version)]
#[command(about = "Read, rebuild and extract Bethesda and mod archives")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config file (defaults to ~/.config/modarc/config.json)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose logging (use RUST_LOG=debug for more detail)
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the detected container format
    Sniff {
        file: PathBuf,
    },

    /// List every entry with its size and hash
    List {
        archive: PathBuf,
    },

    /// Extract an archive to a directory
    Extract {
        archive: PathBuf,

        /// Output directory
        #[arg(short, long)]
        output: PathBuf,

        /// Only extract these archive paths
        #[arg(long = "only")]
        only: Vec<String>,
    },

    /// Rebuild a BSA/BA2 from its own state and verify the result
    Rebuild {
        archive: PathBuf,

        /// Output archive path
        #[arg(short, long)]
        output: PathBuf,
    },

    /// Pack a directory tree into a BTAR stream
    PackBtar {
        /// Output .btar file
        output: PathBuf,
        /// Directory to pack
        dir: PathBuf,
    },
}

fn load_config(path: Option<&Path>) -> Result<ExtractorConfig> {
    let config = match path {
        Some(path) => ExtractorConfig::load(path)?,
        None => ExtractorConfig::load_default()?,
    };
    config.validate().context("Invalid configuration")?;
    Ok(config)
}

/// Spinner fed from a shared byte counter until `done` is set.
fn spawn_progress(progress: Arc<Progress>, done: Arc<AtomicBool>, message: String) -> std::thread::JoinHandle<()> {
    std::thread::spawn(move || {
        let pb = ProgressBar::new_spinner();
        pb.set_style(
            ProgressStyle::default_spinner()
                .template("{spinner:.green} [{elapsed_precise}] {bytes} ({bytes_per_sec}) | {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_spinner()),
        );
        pb.set_message(message);
        pb.enable_steady_tick(Duration::from_millis(100));
        while !done.load(Ordering::Relaxed) {
            pb.set_position(progress.done());
            std::thread::sleep(Duration::from_millis(100));
        }
        pb.finish_and_clear();
    })
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Only initialize logging if verbose or RUST_LOG is set
    if cli.verbose || std::env::var("RUST_LOG").is_ok() {
        tracing_subscriber::fmt()
            .with_env_filter(
                EnvFilter::from_default_env()
                    .add_directive(if cli.verbose { "modarc=debug".parse()? } else { "modarc=warn".parse()? }),
            )
            .init();
    }

    match cli.command {
        Commands::Sniff { file } => {
            let mut stream = File::open(&file)
                .with_context(|| format!("Failed to open {}", file.display()))?;
            match signature::sniff(&mut stream)? {
                Some(file_type) => println!("{}", file_type),
                None => println!("unknown"),
            }
        }

        Commands::List { archive } => {
            let extractor = FileExtractor::new(load_config(cli.config.as_deref())?);
            let source: Arc<dyn StreamFactory> = Arc::new(NativeFileStreamFactory::new(&archive));
            let token = CancellationToken::new();

            let results = extractor
                .gathering_extract(
                    source,
                    |_| true,
                    |_, entry| Ok(hash_reader(&mut entry.open()?)?),
                    None,
                    &token,
                    None,
                )
                .with_context(|| format!("Failed to list {}", archive.display()))?;

            let sorted: BTreeMap<_, _> = results.into_iter().collect();
            for (path, ContentHash { hash, size }) in &sorted {
                println!("{}  {:>12}  {}", hash, size, path);
            }
            eprintln!("\nTotal: {} files", sorted.len());
        }

        Commands::Extract { archive, output, only } => {
            let extractor = FileExtractor::new(load_config(cli.config.as_deref())?);
            let only: Option<HashSet<String>> = (!only.is_empty()).then(|| only.into_iter().collect());
            let token = CancellationToken::new();
            let progress = Arc::new(Progress::new());
            let done = Arc::new(AtomicBool::new(false));

            let name = archive
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            let spinner = spawn_progress(progress.clone(), done.clone(), name);
            let result = extractor.extract_all(&archive, &output, only.as_ref(), &token, Some(&progress));
            done.store(true, Ordering::Relaxed);
            let _ = spinner.join();

            let count = result.with_context(|| format!("Failed to extract {}", archive.display()))?;
            println!("Extracted {} files to {}", count, output.display());
        }

        Commands::Rebuild { archive, output } => {
            let source: Arc<dyn StreamFactory> = Arc::new(NativeFileStreamFactory::new(&archive));
            let original = BsaArchive::open_detect(source)
                .with_context(|| format!("Failed to open {}", archive.display()))?;
            if cli.verbose {
                println!("{}", serde_json::to_string_pretty(&original.state())?);
            }

            let file = File::create(&output)
                .with_context(|| format!("Failed to create {}", output.display()))?;
            let mut writer = BufWriter::new(file);
            let count = bsa::rebuild(&original, &mut writer)?;
            writer.flush()?;
            drop(writer);

            let rebuilt = BsaArchive::open_detect(Arc::new(NativeFileStreamFactory::new(&output)))
                .with_context(|| format!("Failed to reopen {}", output.display()))?;
            verify_rebuild(&original, &rebuilt)?;
            println!(
                "Rebuilt {} files into {} ({})",
                count,
                output.display(),
                compute_file_hash(&output)?
            );
        }

        Commands::PackBtar { output, dir } => {
            let count = btar::pack_directory(&dir, &output)?;
            println!("Packed {} files into {}", count, output.display());
        }
    }

    Ok(())
}

/// Compare paths and content hashes of two archives.
fn verify_rebuild(original: &BsaArchive, rebuilt: &BsaArchive) -> Result<()> {
    let digest = |archive: &BsaArchive| -> Result<BTreeMap<String, String>> {
        let mut out = BTreeMap::new();
        for file in archive.files()? {
            let mut data = Vec::new();
            file.copy_data_to(&mut data)?;
            out.insert(file.path().to_string(), hash_bytes(&data));
        }
        Ok(out)
    };

    let before = digest(original)?;
    let after = digest(rebuilt)?;
    if before.len() != after.len() {
        bail!("Rebuilt archive has {} files, expected {}", after.len(), before.len());
    }
    for (path, hash) in &before {
        match after.get(path) {
            Some(other) if other == hash => {}
            Some(_) => bail!("Content mismatch for {}", path),
            None => bail!("Missing {} after rebuild", path),
        }
    }
    Ok(())
}
