//! The concurrent counting pipeline.
//!
//! One reader thread splits the input files into whole-record chunks and
//! feeds them through a bounded channel to a pool of workers. Each worker
//! owns a private classifier pair built from the shared frozen structures
//! plus a private tally table, processes whole chunks end to end (decode,
//! gates, barcode, allele, tally), and finally submits its table to the
//! single synchronized merge. Memory stays bounded by the channel capacity
//! times the chunk size, and the merged counts are identical regardless of
//! how many workers ran. Any failure aborts the whole run; there are no
//! retries and no partial results.

use crate::allele::{AlleleClassifier, AlleleIndex};
use crate::barcode::{BarcodeClassifier, BarcodeSet, hamming_distance};
use crate::chunk::{ChunkReader, DEFAULT_CHUNK_BYTES, open_fastq};
use crate::config::RunConfig;
use crate::errors::{AfseqError, Result};
use crate::fastq::{FastqRead, RecordIter};
use crate::progress::ProgressTracker;
use crate::tally::{RunTally, WorkerTally};
use crossbeam_channel::bounded;
use log::info;
use parking_lot::Mutex;
use std::io::BufRead;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;

/// Chunks allowed in flight per worker before the reader blocks.
const CHUNKS_IN_FLIGHT_PER_WORKER: usize = 2;

/// Tunables that are not part of the declarative run configuration.
#[derive(Debug, Clone, Copy)]
pub struct RunOptions {
    /// Worker count; zero selects the available parallelism
    pub threads: usize,
    /// Target chunk size in bytes
    pub chunk_bytes: usize,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self { threads: 0, chunk_bytes: DEFAULT_CHUNK_BYTES }
    }
}

/// The outcome of one counting run: the merged tally plus the frozen
/// structures needed to name its rows.
#[derive(Debug)]
pub struct RunOutput {
    /// Merged (barcode, allele) counters
    pub tally: RunTally,
    /// The frozen barcode set
    pub barcodes: Arc<BarcodeSet>,
    /// The frozen allele index
    pub index: Arc<AlleleIndex>,
}

/// Everything frozen before the first read is processed, shared read-only
/// across workers.
struct FrozenRun {
    barcode_set: Arc<BarcodeSet>,
    index: Arc<AlleleIndex>,
    leader: Vec<u8>,
    genotype_offset: usize,
    min_read_length: usize,
    require_leader: bool,
    leader_max_distance: usize,
    min_avg_quality: f64,
    max_fraction_n: f64,
    assign_inexact_alleles: bool,
}

/// Runs the counting pipeline over `inputs` and returns the merged tally.
pub fn run(config: &RunConfig, inputs: &[PathBuf], options: &RunOptions) -> Result<RunOutput> {
    config.validate()?;
    if inputs.is_empty() {
        return Err(AfseqError::Configuration {
            reason: "no input files specified".to_string(),
        });
    }

    let barcode_set = Arc::new(BarcodeSet::new(&config.barcodes, config.allow_inexact_barcodes)?);
    let index = Arc::new(AlleleIndex::build(&config.loci, config.scoring)?);
    let min_avg_quality = resolve_quality_threshold(config, &inputs[0])?;

    let leader = config.leader_sequence.clone().into_bytes();
    let frozen = FrozenRun {
        genotype_offset: barcode_set.barcode_len() + leader.len(),
        barcode_set,
        index,
        leader,
        min_read_length: config.thresholds.min_read_length,
        require_leader: config.thresholds.require_leader,
        leader_max_distance: config.thresholds.leader_max_distance,
        min_avg_quality,
        max_fraction_n: config.thresholds.max_fraction_n,
        assign_inexact_alleles: config.assign_inexact_alleles,
    };

    let workers = if options.threads == 0 {
        thread::available_parallelism().map_or(1, |n| n.get())
    } else {
        options.threads
    };
    info!("Counting with {workers} worker(s)");

    let global = Mutex::new(RunTally::new(frozen.barcode_set.len(), frozen.index.n_alleles()));
    let progress = ProgressTracker::new("Processed reads");
    let (tx, rx) = bounded::<(Arc<PathBuf>, Vec<u8>)>(workers * CHUNKS_IN_FLIGHT_PER_WORKER);

    thread::scope(|scope| -> Result<()> {
        let reader = scope.spawn(move || -> Result<()> {
            for path in inputs {
                info!("Parsing {}", path.display());
                let path_tag = Arc::new(path.clone());
                let source = open_fastq(path).map_err(|e| with_file(e, path))?;
                for chunk in ChunkReader::new(source, options.chunk_bytes)
                    .map_err(|e| with_file(e, path))?
                {
                    let chunk = chunk.map_err(|e| with_file(e, path))?;
                    if tx.send((Arc::clone(&path_tag), chunk)).is_err() {
                        // All workers are gone; their error aborts the run.
                        return Ok(());
                    }
                }
            }
            Ok(())
        });

        let mut worker_handles = Vec::with_capacity(workers);
        for _ in 0..workers {
            let rx = rx.clone();
            let frozen = &frozen;
            let global = &global;
            let progress = &progress;
            worker_handles.push(scope.spawn(move || -> Result<()> {
                let barcode_classifier = BarcodeClassifier::new(Arc::clone(&frozen.barcode_set));
                let mut allele_classifier = AlleleClassifier::new(
                    Arc::clone(&frozen.index),
                    frozen.assign_inexact_alleles,
                    frozen.min_avg_quality,
                    frozen.max_fraction_n,
                );
                let mut tally =
                    WorkerTally::new(frozen.barcode_set.len(), frozen.index.n_alleles());

                for (path, chunk) in rx.iter() {
                    let before = tally.counters.total_reads;
                    process_chunk(
                        &chunk,
                        frozen,
                        &barcode_classifier,
                        &mut allele_classifier,
                        &mut tally,
                    )
                    .map_err(|e| with_file(e, &path))?;
                    progress.add(tally.counters.total_reads - before);
                }

                // The one submission of this worker's private table.
                global.lock().merge(tally)
            }));
        }
        drop(rx);

        let mut first_error = None;
        for outcome in std::iter::once(join(reader)).chain(worker_handles.into_iter().map(join)) {
            if let Err(e) = outcome {
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    })?;

    progress.log_final();
    let tally = global.into_inner();
    let counters = tally.counters();
    info!(
        "Processed {} reads: {} too short, {} missing the leader, {} unassigned to a barcode, {} unassigned to an allele",
        counters.total_reads,
        counters.too_short,
        counters.leader_missing,
        counters.barcode_unassigned,
        counters.allele_unassigned
    );
    Ok(RunOutput { tally, barcodes: frozen.barcode_set, index: frozen.index })
}

fn join<T>(handle: thread::ScopedJoinHandle<'_, Result<T>>) -> Result<T> {
    handle.join().map_err(|_| AfseqError::InvariantViolation {
        reason: "a pipeline thread panicked".to_string(),
    })?
}

fn with_file(error: AfseqError, path: &Path) -> AfseqError {
    match error {
        AfseqError::Format { reason, record } => AfseqError::Format {
            reason: format!("{}: {reason}", path.display()),
            record,
        },
        AfseqError::Io(e) => AfseqError::Format {
            reason: format!("{}: {e}", path.display()),
            record: String::new(),
        },
        other => other,
    }
}

/// Classifies every record of one chunk into the worker's private tally.
fn process_chunk(
    chunk: &[u8],
    frozen: &FrozenRun,
    barcode_classifier: &BarcodeClassifier,
    allele_classifier: &mut AlleleClassifier,
    tally: &mut WorkerTally,
) -> Result<()> {
    for record in RecordIter::new(chunk) {
        let read = record?;
        tally.counters.total_reads += 1;

        if read.len() < frozen.min_read_length {
            tally.counters.too_short += 1;
            continue;
        }
        if read.len() < frozen.genotype_offset {
            return Err(AfseqError::Format {
                reason: format!(
                    "read of length {} is shorter than the declared barcode plus leader layout ({} bases)",
                    read.len(),
                    frozen.genotype_offset
                ),
                record: read.to_record_text(),
            });
        }

        if frozen.require_leader && !leader_present(&read, frozen) {
            tally.counters.leader_missing += 1;
            continue;
        }

        let barcode = barcode_classifier.classify(&read);
        let Some(barcode_id) = barcode.id() else {
            tally.counters.barcode_unassigned += 1;
            continue;
        };

        let region = &read.seq()[frozen.genotype_offset..];
        let allele = allele_classifier.classify(region, read.avg_quality(), read.fraction_n())?;
        if allele.id().is_none() {
            tally.counters.allele_unassigned += 1;
        }
        tally.record(barcode_id, allele, read.avg_quality());
    }
    Ok(())
}

/// Whether the constant leader follows the barcode, within the configured
/// Hamming tolerance.
fn leader_present(read: &FastqRead, frozen: &FrozenRun) -> bool {
    let start = frozen.barcode_set.barcode_len();
    let observed = &read.seq()[start..frozen.genotype_offset];
    hamming_distance(&frozen.leader, observed) <= frozen.leader_max_distance
}

/// Resolves the minimum-average-quality gate, deriving it from a pre-scan of
/// the first input when the configuration gives a quantile instead of an
/// absolute value. The pre-scan statistics are logged either way.
fn resolve_quality_threshold(config: &RunConfig, first_input: &Path) -> Result<f64> {
    if config.prescan_reads == 0 {
        if let Some(absolute) = config.thresholds.min_avg_quality {
            return Ok(absolute);
        }
        return Err(AfseqError::Configuration {
            reason: "a quality quantile requires a nonzero pre-scan read count".to_string(),
        });
    }

    info!(
        "Pre-parsing up to {} reads from {} for initial quality statistics",
        config.prescan_reads,
        first_input.display()
    );
    let mut source = open_fastq(first_input).map_err(|e| with_file(e, first_input))?;
    let mut avg_qualities = Vec::new();
    let mut n_fraction_sum = 0.0f64;
    while avg_qualities.len() < config.prescan_reads {
        let Some(read) = read_record(&mut source).map_err(|e| with_file(e, first_input))? else {
            break;
        };
        avg_qualities.push(read.avg_quality());
        n_fraction_sum += read.fraction_n();
    }
    if avg_qualities.is_empty() {
        return Err(with_file(
            AfseqError::format("input contains no records"),
            first_input,
        ));
    }

    let sampled = avg_qualities.len();
    let mean_quality: f64 = avg_qualities.iter().sum::<f64>() / sampled as f64;
    info!("Mean average quality over {sampled} sampled reads is {mean_quality:.2}");
    info!(
        "Mean ambiguous-base fraction over sampled reads is {:.4}",
        n_fraction_sum / sampled as f64
    );

    let threshold = match config.thresholds.min_avg_quality {
        Some(absolute) => absolute,
        None => {
            avg_qualities.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
            let rank = ((config.thresholds.quality_quantile * sampled as f64) as usize)
                .min(sampled - 1);
            avg_qualities[rank]
        }
    };
    info!(
        "Requiring an average read quality of {threshold:.2} before attempting inexact assignment"
    );
    Ok(threshold)
}

/// Reads one 4-line record group, or `None` at end of input.
fn read_record(source: &mut impl BufRead) -> Result<Option<FastqRead>> {
    let mut lines: [Vec<u8>; 4] = [Vec::new(), Vec::new(), Vec::new(), Vec::new()];
    for (i, line) in lines.iter_mut().enumerate() {
        if source.read_until(b'\n', line)? == 0 {
            if i == 0 {
                return Ok(None);
            }
            return Err(AfseqError::format("incomplete record group at end of input"));
        }
        if line.last() == Some(&b'\n') {
            line.pop();
        }
    }
    FastqRead::from_lines(&lines[0], &lines[1], &lines[2], &lines[3]).map(Some)
}
