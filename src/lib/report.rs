//! CSV report rows and writing.
//!
//! A run produces three files under one output prefix: run-level counters
//! (`<prefix>.summary.csv`), per-barcode totals and quality means
//! (`<prefix>.barcodes.csv`), and the full barcode-by-allele count table
//! with per-locus frequencies (`<prefix>.alleles.csv`). Every value is
//! derived from the merged tally counters alone.

use crate::pipeline::RunOutput;
use anyhow::{Context, Result};
use fgoxide::io::DelimFile;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// One run-level metric.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SummaryRow {
    /// Metric name
    pub metric: String,
    /// Rendered value
    pub value: String,
}

/// Totals and quality means for one barcode.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BarcodeRow {
    /// The barcode sequence
    pub barcode: String,
    /// Reads assigned to this barcode, including allele-unassigned ones
    pub total_assigned: u64,
    /// Reads assigned to an allele with zero edits
    pub exact: u64,
    /// Reads assigned to an allele approximately
    pub inexact: u64,
    /// Reads assigned to this barcode but to no allele
    pub allele_unassigned: u64,
    /// Allele-unassigned fraction of this barcode's reads
    pub fraction_unassigned: f64,
    /// Mean average quality over all of this barcode's reads
    pub mean_quality: f64,
    /// Mean average quality over exact allele assignments
    pub mean_exact_quality: f64,
    /// Mean average quality over inexact allele assignments
    pub mean_inexact_quality: f64,
    /// Mean average quality over allele-unassigned reads
    pub mean_unassigned_quality: f64,
}

/// Counters for one (barcode, allele) cell.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AlleleRow {
    /// The barcode sequence
    pub barcode: String,
    /// Locus display name
    pub locus: String,
    /// The allele sequence
    pub allele: String,
    /// Zero-edit assignments
    pub exact: u64,
    /// Approximate assignments
    pub inexact: u64,
    /// Total assignments
    pub total: u64,
    /// Summed per-read average quality over exact assignments
    pub exact_quality_sum: f64,
    /// Summed per-read average quality over inexact assignments
    pub inexact_quality_sum: f64,
    /// This allele's share of the locus total for this barcode
    pub frequency: f64,
}

fn ratio(numerator: f64, denominator: f64) -> f64 {
    if denominator > 0.0 { numerator / denominator } else { 0.0 }
}

/// Builds the run-level summary rows.
#[must_use]
pub fn summary_rows(output: &RunOutput) -> Vec<SummaryRow> {
    let counters = output.tally.counters();
    let total = counters.total_reads as f64;
    let row = |metric: &str, value: String| SummaryRow { metric: metric.to_string(), value };
    vec![
        row("total_reads", counters.total_reads.to_string()),
        row("reads_too_short", counters.too_short.to_string()),
        row("reads_missing_leader", counters.leader_missing.to_string()),
        row("reads_unassigned_to_barcode", counters.barcode_unassigned.to_string()),
        row(
            "fraction_unassigned_to_barcode",
            format!("{:.6}", ratio(counters.barcode_unassigned as f64, total)),
        ),
        row("reads_unassigned_to_allele", counters.allele_unassigned.to_string()),
        row(
            "fraction_unassigned_overall",
            format!(
                "{:.6}",
                ratio(
                    (counters.barcode_unassigned + counters.allele_unassigned) as f64,
                    total
                )
            ),
        ),
    ]
}

/// Builds one row per barcode.
#[must_use]
pub fn barcode_rows(output: &RunOutput) -> Vec<BarcodeRow> {
    let tally = &output.tally;
    (0..tally.n_barcodes())
        .map(|b| {
            let mut exact = 0u64;
            let mut inexact = 0u64;
            let mut exact_quality = 0.0f64;
            let mut inexact_quality = 0.0f64;
            for a in 0..tally.n_alleles() {
                let cell = tally.cell(b, a);
                exact += cell.exact;
                inexact += cell.inexact;
                exact_quality += cell.exact_quality_sum;
                inexact_quality += cell.inexact_quality_sum;
            }
            let unassigned = tally.unassigned_cell(b);
            let total = tally.barcode_total(b);
            let all_quality =
                exact_quality + inexact_quality + unassigned.inexact_quality_sum;
            BarcodeRow {
                barcode: output.barcodes.name(b).to_string(),
                total_assigned: total,
                exact,
                inexact,
                allele_unassigned: unassigned.total(),
                fraction_unassigned: ratio(unassigned.total() as f64, total as f64),
                mean_quality: ratio(all_quality, total as f64),
                mean_exact_quality: ratio(exact_quality, exact as f64),
                mean_inexact_quality: ratio(inexact_quality, inexact as f64),
                mean_unassigned_quality: ratio(
                    unassigned.inexact_quality_sum,
                    unassigned.inexact as f64,
                ),
            }
        })
        .collect()
}

/// Builds the barcode-by-allele count table with per-locus frequencies.
#[must_use]
pub fn allele_rows(output: &RunOutput) -> Vec<AlleleRow> {
    let tally = &output.tally;
    let mut rows = Vec::with_capacity(tally.n_barcodes() * tally.n_alleles());
    for b in 0..tally.n_barcodes() {
        for locus in output.index.loci() {
            let locus_total: u64 =
                locus.allele_ids().iter().map(|&a| tally.cell(b, a).total()).sum();
            for &a in locus.allele_ids() {
                let cell = tally.cell(b, a);
                rows.push(AlleleRow {
                    barcode: output.barcodes.name(b).to_string(),
                    locus: locus.name().to_string(),
                    allele: output.index.allele(a).seq().to_string(),
                    exact: cell.exact,
                    inexact: cell.inexact,
                    total: cell.total(),
                    exact_quality_sum: cell.exact_quality_sum,
                    inexact_quality_sum: cell.inexact_quality_sum,
                    frequency: ratio(cell.total() as f64, locus_total as f64),
                });
            }
        }
    }
    rows
}

/// Writes the three report files under `prefix`.
pub fn write_report(prefix: &str, output: &RunOutput) -> Result<Vec<PathBuf>> {
    let delim = DelimFile::default();
    let paths = [
        PathBuf::from(format!("{prefix}.summary.csv")),
        PathBuf::from(format!("{prefix}.barcodes.csv")),
        PathBuf::from(format!("{prefix}.alleles.csv")),
    ];
    let summary = summary_rows(output);
    let barcodes = barcode_rows(output);
    let alleles = allele_rows(output);
    delim
        .write_csv(&paths[0], &summary)
        .with_context(|| format!("Failed to write run summary: {}", paths[0].display()))?;
    delim
        .write_csv(&paths[1], &barcodes)
        .with_context(|| format!("Failed to write barcode report: {}", paths[1].display()))?;
    delim
        .write_csv(&paths[2], &alleles)
        .with_context(|| format!("Failed to write allele report: {}", paths[2].display()))?;
    Ok(paths.into())
}
