//! Sample barcode matching.
//!
//! Every read begins with a fixed-length sample tag. [`BarcodeSet`] holds
//! the declared tags and decides, once at freeze time, whether inexact
//! matching is safe for the whole run: single-substitution tolerance is only
//! unambiguous when every pair of declared barcodes is at Hamming distance
//! two or more. [`BarcodeClassifier`] then assigns each read's leading
//! prefix to a sample or to [`Assignment::Unknown`].

use crate::config::validate_acgt;
use crate::errors::{AfseqError, Result};
use crate::fastq::FastqRead;
use crate::tally::Assignment;
use ahash::AHashMap;
use log::info;
use std::sync::Arc;

/// Index of a barcode in declaration order.
pub type BarcodeId = usize;

/// Number of positions at which two equal-length sequences differ.
#[must_use]
pub fn hamming_distance(a: &[u8], b: &[u8]) -> usize {
    debug_assert_eq!(a.len(), b.len(), "hamming distance requires equal lengths");
    a.iter().zip(b.iter()).filter(|(x, y)| x != y).count()
}

/// The frozen set of declared sample barcodes.
///
/// Invariants, checked at construction: at least one barcode, all of equal
/// length, A/C/G/T alphabet, no duplicates.
#[derive(Debug)]
pub struct BarcodeSet {
    /// Barcodes in declaration order
    barcodes: Vec<String>,
    /// Exact-match lookup from tag bytes to declaration index
    lookup: AHashMap<Vec<u8>, BarcodeId>,
    barcode_len: usize,
    /// Minimum pairwise Hamming distance; `None` with fewer than two barcodes
    min_pairwise_distance: Option<usize>,
    inexact_allowed: bool,
}

impl BarcodeSet {
    /// Builds and freezes the barcode set.
    ///
    /// `allow_inexact` is the configured master switch; even when set,
    /// distance-1 matching is disabled for the whole run if any pair of
    /// barcodes is already within Hamming distance one, since a corrupted
    /// tag could then be attributed to the wrong sample.
    pub fn new(declared: &[String], allow_inexact: bool) -> Result<Self> {
        if declared.is_empty() {
            return Err(AfseqError::Configuration { reason: "no barcodes declared".to_string() });
        }
        let barcode_len = declared[0].len();
        let mut lookup = AHashMap::with_capacity(declared.len());
        for (id, barcode) in declared.iter().enumerate() {
            if barcode.len() != barcode_len {
                return Err(AfseqError::Configuration {
                    reason: format!(
                        "barcode {barcode} has length {}, expected {barcode_len}",
                        barcode.len()
                    ),
                });
            }
            validate_acgt(barcode, "barcode")?;
            if lookup.insert(barcode.as_bytes().to_vec(), id).is_some() {
                return Err(AfseqError::Configuration {
                    reason: format!("barcode {barcode} declared more than once"),
                });
            }
        }

        let min_pairwise_distance = (0..declared.len())
            .flat_map(|i| {
                (i + 1..declared.len())
                    .map(move |j| hamming_distance(declared[i].as_bytes(), declared[j].as_bytes()))
            })
            .min();

        let safe = min_pairwise_distance.is_none_or(|d| d >= 2);
        let inexact_allowed = allow_inexact && safe;
        if let Some(d) = min_pairwise_distance {
            info!(
                "Minimum Hamming distance between barcodes is {d}: {}",
                if inexact_allowed {
                    "assigning tags within a Hamming distance of 1"
                } else {
                    "accepting exact tag matches only"
                }
            );
        }

        Ok(Self {
            barcodes: declared.to_vec(),
            lookup,
            barcode_len,
            min_pairwise_distance,
            inexact_allowed,
        })
    }

    /// Number of declared barcodes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.barcodes.len()
    }

    /// Whether the set is empty (never true after construction).
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.barcodes.is_empty()
    }

    /// The common barcode length.
    #[must_use]
    pub fn barcode_len(&self) -> usize {
        self.barcode_len
    }

    /// The barcode sequence for a declaration index.
    #[must_use]
    pub fn name(&self, id: BarcodeId) -> &str {
        &self.barcodes[id]
    }

    /// Whether distance-1 matching is enabled for this run.
    #[must_use]
    pub fn inexact_allowed(&self) -> bool {
        self.inexact_allowed
    }

    /// Minimum pairwise Hamming distance across declared barcodes.
    #[must_use]
    pub fn min_pairwise_distance(&self) -> Option<usize> {
        self.min_pairwise_distance
    }
}

/// Per-worker classifier assigning reads to barcodes.
#[derive(Debug, Clone)]
pub struct BarcodeClassifier {
    set: Arc<BarcodeSet>,
}

impl BarcodeClassifier {
    /// Creates a classifier over the frozen barcode set.
    #[must_use]
    pub fn new(set: Arc<BarcodeSet>) -> Self {
        Self { set }
    }

    /// Assigns the read's leading prefix to a barcode.
    ///
    /// Exact matches win; otherwise, when inexact matching is enabled, the
    /// first declared barcode at Hamming distance exactly one is chosen.
    /// Reads shorter than the barcode length are unknown.
    #[must_use]
    pub fn classify(&self, read: &FastqRead) -> Assignment {
        let Some(tag) = read.seq().get(..self.set.barcode_len) else {
            return Assignment::Unknown;
        };
        if let Some(&id) = self.set.lookup.get(tag) {
            return Assignment::Exact(id);
        }
        if self.set.inexact_allowed {
            for (id, barcode) in self.set.barcodes.iter().enumerate() {
                if hamming_distance(barcode.as_bytes(), tag) == 1 {
                    return Assignment::Inexact(id);
                }
            }
        }
        Assignment::Unknown
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn read_with_seq(seq: &str) -> FastqRead {
        let quals = vec![b'I'; seq.len()];
        FastqRead::from_lines(b"@r", seq.as_bytes(), b"+", &quals).unwrap()
    }

    fn strings(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| (*s).to_string()).collect()
    }

    #[test]
    fn test_exact_match() {
        let set = Arc::new(BarcodeSet::new(&strings(&["AAAAAA", "TTTTTT"]), true).unwrap());
        let classifier = BarcodeClassifier::new(set);
        assert_eq!(classifier.classify(&read_with_seq("AAAAAAGGGG")), Assignment::Exact(0));
        assert_eq!(classifier.classify(&read_with_seq("TTTTTTGGGG")), Assignment::Exact(1));
    }

    #[test]
    fn test_single_substitution_is_assigned_inexactly() {
        // Minimum pairwise distance is 6, so distance-1 matching is safe.
        let set = Arc::new(
            BarcodeSet::new(&strings(&["AAAAAA", "TTTTTT", "GGGGGG"]), true).unwrap(),
        );
        assert!(set.inexact_allowed());
        let classifier = BarcodeClassifier::new(set);
        assert_eq!(classifier.classify(&read_with_seq("AAATAAGGGG")), Assignment::Inexact(0));
        assert_eq!(classifier.classify(&read_with_seq("TTTTTCGGGG")), Assignment::Inexact(1));
    }

    #[test]
    fn test_close_pair_disables_inexact_matching() {
        // AAAAAA and AAAAAT are at distance 1: the whole run is exact-only.
        let set = Arc::new(
            BarcodeSet::new(&strings(&["AAAAAA", "AAAAAT", "GGGGGG"]), true).unwrap(),
        );
        assert!(!set.inexact_allowed());
        let classifier = BarcodeClassifier::new(set);
        assert_eq!(classifier.classify(&read_with_seq("AAAAAAGGGG")), Assignment::Exact(0));
        assert_eq!(classifier.classify(&read_with_seq("AAATAAGGGG")), Assignment::Unknown);
    }

    #[test]
    fn test_master_switch_disables_inexact_matching() {
        let set = Arc::new(BarcodeSet::new(&strings(&["AAAAAA", "TTTTTT"]), false).unwrap());
        assert!(!set.inexact_allowed());
        let classifier = BarcodeClassifier::new(set);
        assert_eq!(classifier.classify(&read_with_seq("AAATAAGGGG")), Assignment::Unknown);
    }

    #[test]
    fn test_first_declared_barcode_wins_ties() {
        // AATA is at distance 1 from both AAAA and AATT (themselves at
        // distance 2); declaration order decides.
        let set = Arc::new(BarcodeSet::new(&strings(&["AAAA", "AATT"]), true).unwrap());
        assert!(set.inexact_allowed());
        let classifier = BarcodeClassifier::new(set);
        assert_eq!(classifier.classify(&read_with_seq("AATAGGGG")), Assignment::Inexact(0));
    }

    #[test]
    fn test_read_shorter_than_barcode_is_unknown() {
        let set = Arc::new(BarcodeSet::new(&strings(&["AAAAAA"]), true).unwrap());
        let classifier = BarcodeClassifier::new(set);
        assert_eq!(classifier.classify(&read_with_seq("AAA")), Assignment::Unknown);
    }

    #[test]
    fn test_duplicate_barcode_rejected() {
        let err = BarcodeSet::new(&strings(&["ACGT", "ACGT"]), true).unwrap_err();
        assert!(matches!(err, AfseqError::Configuration { .. }));
    }

    #[test]
    fn test_unequal_lengths_rejected() {
        let err = BarcodeSet::new(&strings(&["ACGT", "ACGTA"]), true).unwrap_err();
        assert!(matches!(err, AfseqError::Configuration { .. }));
    }

    #[test]
    fn test_non_acgt_rejected() {
        let err = BarcodeSet::new(&strings(&["ACGN"]), true).unwrap_err();
        assert!(matches!(err, AfseqError::Configuration { .. }));
    }

    #[test]
    fn test_empty_set_rejected() {
        let err = BarcodeSet::new(&[], true).unwrap_err();
        assert!(matches!(err, AfseqError::Configuration { .. }));
    }

    #[test]
    fn test_hamming_distance() {
        assert_eq!(hamming_distance(b"ACGT", b"ACGT"), 0);
        assert_eq!(hamming_distance(b"ACGT", b"ACGA"), 1);
        assert_eq!(hamming_distance(b"AAAA", b"TTTT"), 4);
    }
}
