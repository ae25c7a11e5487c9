#![deny(unsafe_code)]

use afseq_lib::config::RunConfig;
use afseq_lib::pipeline::{self, RunOptions};
use afseq_lib::report;
use anyhow::{Context, Result, bail};
use clap::Parser;
use clap::builder::styling::{AnsiColor, Effects, Styles};
use env_logger::Env;
use log::info;
use std::path::PathBuf;
use std::time::Instant;

/// Custom styles for CLI help output
const STYLES: Styles = Styles::styled()
    .header(AnsiColor::Green.on_default().effects(Effects::BOLD))
    .usage(AnsiColor::Green.on_default().effects(Effects::BOLD))
    .literal(AnsiColor::Cyan.on_default().effects(Effects::BOLD))
    .placeholder(AnsiColor::Cyan.on_default());

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

/// Count allele frequencies per sample barcode from raw FASTQ reads.
///
/// Reads are assigned to a sample by their leading barcode tag and to one of
/// the configured allele sequences at a genomic locus, tolerating sequencing
/// errors. Results are written as CSV files under the configured output
/// prefix.
#[derive(Parser, Debug)]
#[command(name = "afseq", version, styles = STYLES)]
struct Args {
    /// Analysis configuration JSON file
    #[arg(short = 'c', long = "config", value_name = "JSON")]
    config: PathBuf,

    /// FASTQ files to analyze (optionally gzipped)
    #[arg(value_name = "FASTQ")]
    fastq: Vec<PathBuf>,

    /// Also search this directory for .fastq/.fq files
    #[arg(short = 'd', long, value_name = "DIR")]
    directory: Option<PathBuf>,

    /// Worker threads; 0 uses all available cores
    #[arg(short = 't', long, default_value_t = 0)]
    threads: usize,

    /// Override the configured output file name prefix
    #[arg(short = 'o', long, value_name = "PREFIX")]
    output_prefix: Option<String>,

    /// Show debug-level output
    #[arg(short = 'v', long)]
    verbose: bool,
}

/// Whether a directory entry looks like a FASTQ file (`.fastq`/`.fq`,
/// optionally `.gz`-compressed).
fn is_fastq(path: &std::path::Path) -> bool {
    let name = path.file_name().map(|n| n.to_string_lossy().to_lowercase()).unwrap_or_default();
    let stem = name.strip_suffix(".gz").unwrap_or(&name);
    stem.ends_with(".fastq") || stem.ends_with(".fq")
}

fn gather_inputs(args: &Args) -> Result<Vec<PathBuf>> {
    let mut inputs = Vec::new();
    for path in &args.fastq {
        if !path.is_file() {
            bail!("FASTQ file {} cannot be found", path.display());
        }
        inputs.push(path.clone());
    }
    if let Some(dir) = &args.directory {
        let entries = std::fs::read_dir(dir)
            .with_context(|| format!("Cannot search directory {}", dir.display()))?;
        let mut found = Vec::new();
        for entry in entries {
            let path = entry?.path();
            if path.is_file() && is_fastq(&path) {
                found.push(path);
            }
        }
        if found.is_empty() {
            bail!("No FASTQ files found in directory {}", dir.display());
        }
        found.sort();
        inputs.extend(found);
    }
    if inputs.is_empty() {
        bail!("No FASTQ files specified for analysis");
    }
    Ok(inputs)
}

fn main() -> Result<()> {
    let args = Args::parse();
    let default_level = if args.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(Env::default().default_filter_or(default_level)).init();

    let mut config = RunConfig::from_json_file(&args.config)
        .with_context(|| format!("Cannot load configuration {}", args.config.display()))?;
    if let Some(prefix) = &args.output_prefix {
        config.output_prefix.clone_from(prefix);
    }
    let inputs = gather_inputs(&args)?;

    let started = Instant::now();
    info!("Analysis of {} file(s) started", inputs.len());

    let options = RunOptions { threads: args.threads, ..RunOptions::default() };
    let output = pipeline::run(&config, &inputs, &options)
        .context("Analysis failed; no report was written")?;

    let paths = report::write_report(&config.output_prefix, &output)?;
    for path in &paths {
        info!("Wrote {}", path.display());
    }
    info!("Finished successfully in {:.1} minutes", started.elapsed().as_secs_f64() / 60.0);
    Ok(())
}
