//! Assignment outcomes and count aggregation.
//!
//! Workers tally classifications into private [`WorkerTally`] tables; at the
//! end of a run each private table is folded into the shared [`RunTally`]
//! exactly once. The merge consumes the worker table by value, so submitting
//! the same table twice is unrepresentable rather than checked at runtime.
//! Counters only ever increase, and merged totals are identical regardless
//! of how the input chunks were distributed across workers.

use crate::errors::{AfseqError, Result};

/// The transient outcome of classifying one read against one target set
/// (barcodes or alleles), carrying the declaration index of the match.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Assignment {
    /// Matched with zero edits
    Exact(usize),
    /// Matched approximately under the scoring rules
    Inexact(usize),
    /// No acceptable match
    Unknown,
}

impl Assignment {
    /// The matched declaration index, if any.
    #[must_use]
    pub fn id(&self) -> Option<usize> {
        match self {
            Assignment::Exact(id) | Assignment::Inexact(id) => Some(*id),
            Assignment::Unknown => None,
        }
    }

    /// Whether this is a zero-edit match.
    #[must_use]
    pub fn is_exact(&self) -> bool {
        matches!(self, Assignment::Exact(_))
    }
}

/// Counters for one (barcode, allele) cell.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct AssignmentCounts {
    /// Reads assigned with zero edits
    pub exact: u64,
    /// Reads assigned approximately
    pub inexact: u64,
    /// Sum of per-read average qualities over exact assignments
    pub exact_quality_sum: f64,
    /// Sum of per-read average qualities over inexact assignments
    pub inexact_quality_sum: f64,
}

impl AssignmentCounts {
    /// Records one assignment with the read's average quality.
    pub fn record(&mut self, exact: bool, avg_quality: f64) {
        if exact {
            self.exact += 1;
            self.exact_quality_sum += avg_quality;
        } else {
            self.inexact += 1;
            self.inexact_quality_sum += avg_quality;
        }
    }

    /// Adds another cell's counters into this one.
    pub fn add(&mut self, other: &AssignmentCounts) {
        self.exact += other.exact;
        self.inexact += other.inexact;
        self.exact_quality_sum += other.exact_quality_sum;
        self.inexact_quality_sum += other.inexact_quality_sum;
    }

    /// Total assignments, exact plus inexact.
    #[must_use]
    pub fn total(&self) -> u64 {
        self.exact + self.inexact
    }
}

/// Run-level counters for reads that never reach an allele tally.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunCounters {
    /// Reads seen
    pub total_reads: u64,
    /// Reads below the configured minimum length
    pub too_short: u64,
    /// Reads whose constant leader subsequence was absent
    pub leader_missing: u64,
    /// Reads whose leading tag matched no barcode
    pub barcode_unassigned: u64,
    /// Reads whose genotype region matched no allele
    pub allele_unassigned: u64,
}

impl RunCounters {
    fn add(&mut self, other: &RunCounters) {
        self.total_reads += other.total_reads;
        self.too_short += other.too_short;
        self.leader_missing += other.leader_missing;
        self.barcode_unassigned += other.barcode_unassigned;
        self.allele_unassigned += other.allele_unassigned;
    }
}

/// A worker-private tally of (barcode, allele) assignments.
///
/// The table has one row per barcode and one column per allele plus a
/// trailing column for reads assigned to a barcode but to no allele, so the
/// per-barcode unassigned quality statistics survive the merge.
#[derive(Debug)]
pub struct WorkerTally {
    n_alleles: usize,
    /// Row-major: `cells[barcode * (n_alleles + 1) + allele]`
    cells: Vec<AssignmentCounts>,
    /// Per-chunk counters accumulated by this worker
    pub counters: RunCounters,
}

impl WorkerTally {
    /// Creates an empty tally shaped for the frozen barcode and allele sets.
    #[must_use]
    pub fn new(n_barcodes: usize, n_alleles: usize) -> Self {
        Self {
            n_alleles,
            cells: vec![AssignmentCounts::default(); n_barcodes * (n_alleles + 1)],
            counters: RunCounters::default(),
        }
    }

    /// Records an allele assignment for a read already assigned to `barcode`.
    ///
    /// An [`Assignment::Unknown`] allele lands in the barcode's unassigned
    /// column as an inexact non-match, mirroring how the run-level counter
    /// treats it.
    pub fn record(&mut self, barcode: usize, allele: Assignment, avg_quality: f64) {
        let column = allele.id().unwrap_or(self.n_alleles);
        let index = barcode * (self.n_alleles + 1) + column;
        self.cells[index].record(allele.is_exact(), avg_quality);
    }
}

/// The merged, run-wide tally.
///
/// Created empty before workers start; each worker's table is merged in
/// exactly once. All derived statistics (ratios, averages) are computed from
/// these counters alone, never recomputed from raw reads.
#[derive(Debug)]
pub struct RunTally {
    n_barcodes: usize,
    n_alleles: usize,
    cells: Vec<AssignmentCounts>,
    counters: RunCounters,
    workers_merged: usize,
}

impl RunTally {
    /// Creates an empty run tally shaped like the worker tables it will
    /// absorb.
    #[must_use]
    pub fn new(n_barcodes: usize, n_alleles: usize) -> Self {
        Self {
            n_barcodes,
            n_alleles,
            cells: vec![AssignmentCounts::default(); n_barcodes * (n_alleles + 1)],
            counters: RunCounters::default(),
            workers_merged: 0,
        }
    }

    /// Additively merges one worker's private table. Consumes the table, so
    /// it cannot be submitted again.
    pub fn merge(&mut self, worker: WorkerTally) -> Result<()> {
        if worker.n_alleles != self.n_alleles
            || worker.cells.len() != self.cells.len()
        {
            return Err(AfseqError::InvariantViolation {
                reason: "worker tally shape does not match the run tally".to_string(),
            });
        }
        for (cell, other) in self.cells.iter_mut().zip(worker.cells.iter()) {
            cell.add(other);
        }
        self.counters.add(&worker.counters);
        self.workers_merged += 1;
        Ok(())
    }

    /// Counters for one (barcode, allele) cell.
    #[must_use]
    pub fn cell(&self, barcode: usize, allele: usize) -> &AssignmentCounts {
        &self.cells[barcode * (self.n_alleles + 1) + allele]
    }

    /// Counters for reads assigned to `barcode` but to no allele.
    #[must_use]
    pub fn unassigned_cell(&self, barcode: usize) -> &AssignmentCounts {
        self.cell(barcode, self.n_alleles)
    }

    /// Run-level counters.
    #[must_use]
    pub fn counters(&self) -> &RunCounters {
        &self.counters
    }

    /// Number of barcode rows.
    #[must_use]
    pub fn n_barcodes(&self) -> usize {
        self.n_barcodes
    }

    /// Number of allele columns (excluding the unassigned column).
    #[must_use]
    pub fn n_alleles(&self) -> usize {
        self.n_alleles
    }

    /// How many worker tables have been merged.
    #[must_use]
    pub fn workers_merged(&self) -> usize {
        self.workers_merged
    }

    /// Total reads assigned to a barcode, across all of its allele cells.
    #[must_use]
    pub fn barcode_total(&self, barcode: usize) -> u64 {
        (0..=self.n_alleles).map(|a| self.cell(barcode, a).total()).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_assignment_accessors() {
        assert_eq!(Assignment::Exact(3).id(), Some(3));
        assert_eq!(Assignment::Inexact(1).id(), Some(1));
        assert_eq!(Assignment::Unknown.id(), None);
        assert!(Assignment::Exact(0).is_exact());
        assert!(!Assignment::Inexact(0).is_exact());
        assert!(!Assignment::Unknown.is_exact());
    }

    #[test]
    fn test_record_exact_and_inexact() {
        let mut tally = WorkerTally::new(2, 2);
        tally.record(0, Assignment::Exact(0), 30.0);
        tally.record(0, Assignment::Exact(0), 34.0);
        tally.record(0, Assignment::Inexact(1), 20.0);
        tally.record(1, Assignment::Unknown, 10.0);

        let mut run = RunTally::new(2, 2);
        run.merge(tally).unwrap();

        assert_eq!(run.cell(0, 0).exact, 2);
        assert!((run.cell(0, 0).exact_quality_sum - 64.0).abs() < f64::EPSILON);
        assert_eq!(run.cell(0, 1).inexact, 1);
        assert_eq!(run.unassigned_cell(1).inexact, 1);
        assert_eq!(run.barcode_total(0), 3);
        assert_eq!(run.barcode_total(1), 1);
    }

    #[test]
    fn test_merge_is_additive_across_workers() {
        let mut first = WorkerTally::new(1, 1);
        first.record(0, Assignment::Exact(0), 30.0);
        first.counters.total_reads = 10;
        first.counters.too_short = 2;

        let mut second = WorkerTally::new(1, 1);
        second.record(0, Assignment::Exact(0), 32.0);
        second.record(0, Assignment::Inexact(0), 28.0);
        second.counters.total_reads = 5;
        second.counters.allele_unassigned = 1;

        let mut run = RunTally::new(1, 1);
        run.merge(first).unwrap();
        run.merge(second).unwrap();

        assert_eq!(run.workers_merged(), 2);
        assert_eq!(run.cell(0, 0).exact, 2);
        assert_eq!(run.cell(0, 0).inexact, 1);
        assert!((run.cell(0, 0).exact_quality_sum - 62.0).abs() < f64::EPSILON);
        assert_eq!(run.counters().total_reads, 15);
        assert_eq!(run.counters().too_short, 2);
        assert_eq!(run.counters().allele_unassigned, 1);
    }

    #[test]
    fn test_merge_rejects_mismatched_shape() {
        let worker = WorkerTally::new(2, 3);
        let mut run = RunTally::new(2, 2);
        assert!(matches!(
            run.merge(worker),
            Err(AfseqError::InvariantViolation { .. })
        ));
    }
}
