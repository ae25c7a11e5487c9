//! Allele panels, the frozen k-mer index, and the allele classifier.
//!
//! Each locus declares a small panel of equal-length allele sequences. After
//! validation the panels are frozen into an [`AlleleIndex`]: every allele's
//! overlapping 9-base k-mers, 2-bit packed, map to the candidate alleles
//! containing them, and every allele carries its precomputed minimum
//! acceptance score. Workers then hold their own [`AlleleClassifier`] over
//! the shared index; the classifier owns only scratch buffers, so the index
//! is read concurrently without locking.

use crate::alignment::{ScoringModel, local_alignment_score, ungapped_score};
use crate::config::{LocusConfig, validate_acgt};
use crate::errors::{AfseqError, Result};
use crate::tally::Assignment;
use ahash::AHashMap;
use std::sync::Arc;

/// Fixed k-mer width used to narrow alignment candidates.
pub const KMER_SIZE: usize = 9;

/// Fraction of a perfect score an alignment must reach for acceptance.
pub const MIN_SCORE_FRACTION: f32 = 0.75;

/// Candidates below this fraction of the top candidate's k-mer hits are
/// dropped before any alignment is attempted.
pub const CANDIDATE_HIT_FRACTION: f64 = 0.25;

/// Index of an allele in global declaration order.
pub type AlleleId = usize;

/// Index of a locus in declaration order.
pub type LocusId = usize;

/// One frozen allele sequence.
#[derive(Debug)]
pub struct Allele {
    seq: String,
    locus: LocusId,
    /// Minimum alignment score for an inexact assignment to this allele
    min_score: f32,
}

impl Allele {
    /// The allele sequence.
    #[must_use]
    pub fn seq(&self) -> &str {
        &self.seq
    }

    /// The locus this allele belongs to.
    #[must_use]
    pub fn locus(&self) -> LocusId {
        self.locus
    }

    /// Minimum acceptance score, scaled to this allele's length.
    #[must_use]
    pub fn min_score(&self) -> f32 {
        self.min_score
    }
}

/// One frozen locus: its name, member alleles, and SNP tag.
#[derive(Debug)]
pub struct Locus {
    name: String,
    allele_ids: Vec<AlleleId>,
    /// Exactly two alleles differing at exactly one position
    is_snp: bool,
}

impl Locus {
    /// Display name of the locus.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Member alleles in declaration order.
    #[must_use]
    pub fn allele_ids(&self) -> &[AlleleId] {
        &self.allele_ids
    }

    /// Whether this is a two-allele single-position locus.
    #[must_use]
    pub fn is_snp(&self) -> bool {
        self.is_snp
    }
}

/// Packs a k-mer window into 2 bits per base. `None` when the window holds
/// anything outside A/C/G/T (such as an `N` call).
fn pack_kmer(window: &[u8]) -> Option<u32> {
    debug_assert!(window.len() == KMER_SIZE);
    let mut packed = 0u32;
    for &base in window {
        let code = match base {
            b'A' => 0,
            b'C' => 1,
            b'G' => 2,
            b'T' => 3,
            _ => return None,
        };
        packed = (packed << 2) | code;
    }
    Some(packed)
}

/// The read-only k-mer index over all declared alleles.
///
/// Built once after every locus is known, then frozen; workers share it
/// through an [`Arc`] and never mutate it.
#[derive(Debug)]
pub struct AlleleIndex {
    alleles: Vec<Allele>,
    loci: Vec<Locus>,
    kmers: AHashMap<u32, Vec<AlleleId>>,
    model: ScoringModel,
}

impl AlleleIndex {
    /// Validates the locus declarations and freezes the index.
    ///
    /// Checked invariants: at least one locus; at least two alleles per
    /// locus, all of equal length, A/C/G/T, long enough to decompose into
    /// k-mers, no duplicates within a locus; and no allele is a prefix of an
    /// allele in a different locus (which also guarantees exact matches are
    /// unambiguous).
    pub fn build(loci: &[LocusConfig], model: ScoringModel) -> Result<Self> {
        if loci.is_empty() {
            return Err(AfseqError::Configuration { reason: "no loci declared".to_string() });
        }

        let mut alleles: Vec<Allele> = Vec::new();
        let mut frozen_loci = Vec::with_capacity(loci.len());

        for (locus_id, locus) in loci.iter().enumerate() {
            let display = if locus.name.is_empty() {
                format!("locus_{}", locus_id + 1)
            } else {
                locus.name.clone()
            };
            if locus.alleles.len() < 2 {
                return Err(AfseqError::Configuration {
                    reason: format!(
                        "locus {display} declares {} allele(s), at least two are required",
                        locus.alleles.len()
                    ),
                });
            }
            let allele_len = locus.alleles[0].len();
            let mut allele_ids = Vec::with_capacity(locus.alleles.len());

            for seq in &locus.alleles {
                if seq.len() != allele_len {
                    return Err(AfseqError::Configuration {
                        reason: format!(
                            "locus {display} mixes allele lengths {} and {allele_len}",
                            seq.len()
                        ),
                    });
                }
                if seq.len() < KMER_SIZE {
                    return Err(AfseqError::Configuration {
                        reason: format!(
                            "allele {seq} is shorter than the k-mer size {KMER_SIZE}"
                        ),
                    });
                }
                validate_acgt(seq, "allele")?;
                for existing in &alleles {
                    let clash = if existing.locus == locus_id {
                        existing.seq == *seq
                    } else {
                        existing.seq.starts_with(seq) || seq.starts_with(&existing.seq)
                    };
                    if clash {
                        return Err(AfseqError::Configuration {
                            reason: format!(
                                "allele {seq} overlaps allele {} declared elsewhere",
                                existing.seq
                            ),
                        });
                    }
                }

                let min_score = MIN_SCORE_FRACTION * model.match_score * seq.len() as f32;
                allele_ids.push(alleles.len());
                alleles.push(Allele { seq: seq.clone(), locus: locus_id, min_score });
            }

            let is_snp = allele_ids.len() == 2
                && crate::barcode::hamming_distance(
                    alleles[allele_ids[0]].seq.as_bytes(),
                    alleles[allele_ids[1]].seq.as_bytes(),
                ) == 1;
            frozen_loci.push(Locus { name: display, allele_ids, is_snp });
        }

        let mut kmers: AHashMap<u32, Vec<AlleleId>> = AHashMap::new();
        for (id, allele) in alleles.iter().enumerate() {
            for window in allele.seq.as_bytes().windows(KMER_SIZE) {
                let packed = pack_kmer(window).expect("alleles are validated as A/C/G/T");
                let entry = kmers.entry(packed).or_default();
                // An allele repeating a k-mer internally still counts once
                // per read k-mer; entries per allele stay unique.
                if entry.last() != Some(&id) {
                    entry.push(id);
                }
            }
        }

        Ok(Self { alleles, loci: frozen_loci, kmers, model })
    }

    /// Number of declared alleles across all loci.
    #[must_use]
    pub fn n_alleles(&self) -> usize {
        self.alleles.len()
    }

    /// An allele by global declaration index.
    #[must_use]
    pub fn allele(&self, id: AlleleId) -> &Allele {
        &self.alleles[id]
    }

    /// The frozen loci in declaration order.
    #[must_use]
    pub fn loci(&self) -> &[Locus] {
        &self.loci
    }

    /// The scoring model frozen with the index.
    #[must_use]
    pub fn model(&self) -> &ScoringModel {
        &self.model
    }
}

/// Per-worker classifier assigning read regions to alleles.
///
/// Holds the shared frozen index plus private scratch state; construct one
/// per worker rather than sharing.
#[derive(Debug)]
pub struct AlleleClassifier {
    index: Arc<AlleleIndex>,
    inexact_enabled: bool,
    min_avg_quality: f64,
    max_fraction_n: f64,
    /// Scratch: k-mer hits per allele, cleared between reads
    hit_counts: Vec<u32>,
    /// Scratch: alleles with a nonzero hit count, in first-touch order
    touched: Vec<AlleleId>,
}

impl AlleleClassifier {
    /// Creates a classifier over the frozen index.
    ///
    /// Inexact matching is only attempted when `inexact_enabled` is set and
    /// a read's average quality meets `min_avg_quality` while its `N`
    /// fraction stays within `max_fraction_n`.
    #[must_use]
    pub fn new(
        index: Arc<AlleleIndex>,
        inexact_enabled: bool,
        min_avg_quality: f64,
        max_fraction_n: f64,
    ) -> Self {
        let n_alleles = index.n_alleles();
        Self {
            index,
            inexact_enabled,
            min_avg_quality,
            max_fraction_n,
            hit_counts: vec![0; n_alleles],
            touched: Vec::with_capacity(n_alleles),
        }
    }

    /// Assigns a read's genotype region to an allele.
    ///
    /// Tries an exact prefix match first, then the k-mer candidate search
    /// with alignment scoring, resolving the one-candidate, SNP-pair, and
    /// many-candidate outcomes separately. Every gate failure yields
    /// [`Assignment::Unknown`].
    pub fn classify(
        &mut self,
        region: &[u8],
        avg_quality: f64,
        fraction_n: f64,
    ) -> Result<Assignment> {
        for (id, allele) in self.index.alleles.iter().enumerate() {
            if region.starts_with(allele.seq.as_bytes()) {
                return Ok(Assignment::Exact(id));
            }
        }

        if !self.inexact_enabled
            || avg_quality < self.min_avg_quality
            || fraction_n > self.max_fraction_n
        {
            return Ok(Assignment::Unknown);
        }

        if region.len() < KMER_SIZE {
            return Err(AfseqError::format(format!(
                "sequence of length {} cannot be decomposed into {KMER_SIZE}-base k-mers",
                region.len()
            )));
        }

        self.count_kmer_hits(region);
        if self.touched.is_empty() {
            return Ok(Assignment::Unknown);
        }

        let top_id = self.top_candidate();
        let cutoff = f64::from(self.hit_counts[top_id]) * CANDIDATE_HIT_FRACTION;
        let survivors: Vec<AlleleId> = self
            .touched
            .iter()
            .copied()
            .filter(|&id| f64::from(self.hit_counts[id]) >= cutoff)
            .collect();

        if !survivors.contains(&top_id) {
            return Err(AfseqError::InvariantViolation {
                reason: format!(
                    "top k-mer candidate {} failed its own survival filter",
                    self.index.alleles[top_id].seq
                ),
            });
        }

        let assignment = match survivors.as_slice() {
            &[only] => self.accept_single(only, region),
            &[a, b] if self.snp_pair(a, b) => self.accept_snp_pair(a, b, region),
            _ => self.accept_ranked(&survivors, region),
        };
        Ok(assignment)
    }

    fn count_kmer_hits(&mut self, region: &[u8]) {
        for &id in &self.touched {
            self.hit_counts[id] = 0;
        }
        self.touched.clear();

        for window in region.windows(KMER_SIZE) {
            let Some(packed) = pack_kmer(window) else { continue };
            let Some(candidates) = self.index.kmers.get(&packed) else { continue };
            for &id in candidates {
                if self.hit_counts[id] == 0 {
                    self.touched.push(id);
                }
                self.hit_counts[id] += 1;
            }
        }
    }

    /// The candidate with the most k-mer hits; first touched wins ties,
    /// which follows k-mer position order and is deterministic per read.
    fn top_candidate(&self) -> AlleleId {
        let mut best = self.touched[0];
        for &id in &self.touched[1..] {
            if self.hit_counts[id] > self.hit_counts[best] {
                best = id;
            }
        }
        best
    }

    fn snp_pair(&self, a: AlleleId, b: AlleleId) -> bool {
        let locus = self.index.alleles[a].locus;
        locus == self.index.alleles[b].locus && self.index.loci[locus].is_snp
    }

    /// Fast-path acceptance: the cheap ungapped score or the full alignment
    /// score must reach the allele's minimum.
    fn passes_minimum(&self, id: AlleleId, region: &[u8]) -> (bool, f32) {
        let allele = &self.index.alleles[id];
        let model = &self.index.model;
        let ungapped = ungapped_score(allele.seq.as_bytes(), region, model);
        let aligned = local_alignment_score(allele.seq.as_bytes(), region, model);
        (ungapped >= allele.min_score || aligned >= allele.min_score, aligned)
    }

    fn accept_single(&self, id: AlleleId, region: &[u8]) -> Assignment {
        let (passes, _) = self.passes_minimum(id, region);
        if passes { Assignment::Inexact(id) } else { Assignment::Unknown }
    }

    /// Two survivors from the same SNP locus: no third option exists, so no
    /// margin is required; the passing allele wins, the better alignment
    /// deciding if both pass.
    fn accept_snp_pair(&self, a: AlleleId, b: AlleleId, region: &[u8]) -> Assignment {
        let (a_passes, a_score) = self.passes_minimum(a, region);
        let (b_passes, b_score) = self.passes_minimum(b, region);
        match (a_passes, b_passes) {
            (true, false) => Assignment::Inexact(a),
            (false, true) => Assignment::Inexact(b),
            (true, true) if a_score > b_score => Assignment::Inexact(a),
            (true, true) if b_score > a_score => Assignment::Inexact(b),
            _ => Assignment::Unknown,
        }
    }

    /// Three or more survivors, or two that are not a SNP pair: rank by the
    /// full alignment score and require a one-substitution margin over the
    /// runner-up.
    fn accept_ranked(&self, survivors: &[AlleleId], region: &[u8]) -> Assignment {
        let model = &self.index.model;
        let mut scored: Vec<(f32, AlleleId)> = survivors
            .iter()
            .map(|&id| {
                let allele = &self.index.alleles[id];
                (local_alignment_score(allele.seq.as_bytes(), region, model), id)
            })
            .collect();
        scored.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal)
            .then(a.1.cmp(&b.1)));

        let (top_score, top_id) = scored[0];
        let (runner_score, _) = scored[1];
        if top_score >= self.index.alleles[top_id].min_score
            && top_score - runner_score >= model.substitution_margin()
        {
            Assignment::Inexact(top_id)
        } else {
            Assignment::Unknown
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SNP_A: &str = "ACGTACGTACGT";
    const SNP_B: &str = "ACGTACGTACGA";

    fn snp_locus() -> LocusConfig {
        LocusConfig {
            name: "snp1".to_string(),
            alleles: vec![SNP_A.to_string(), SNP_B.to_string()],
        }
    }

    fn multi_locus() -> LocusConfig {
        // Two alleles differing at two positions: not a SNP locus.
        LocusConfig {
            name: "msat1".to_string(),
            alleles: vec!["TTTTGGGGCCCCAAAA".to_string(), "TTTTGGGGCCCCTTAA".to_string()],
        }
    }

    fn index(loci: &[LocusConfig]) -> Arc<AlleleIndex> {
        Arc::new(AlleleIndex::build(loci, ScoringModel::default()).unwrap())
    }

    fn classifier(index: Arc<AlleleIndex>) -> AlleleClassifier {
        AlleleClassifier::new(index, true, 20.0, 0.2)
    }

    #[test]
    fn test_exact_prefix_match_in_declaration_order() {
        let mut c = classifier(index(&[snp_locus()]));
        assert_eq!(c.classify(b"ACGTACGTACGTGGGG", 30.0, 0.0).unwrap(), Assignment::Exact(0));
        assert_eq!(c.classify(b"ACGTACGTACGAGGGG", 30.0, 0.0).unwrap(), Assignment::Exact(1));
    }

    #[test]
    fn test_low_quality_read_is_never_matched_inexactly() {
        let mut c = classifier(index(&[snp_locus()]));
        // One substitution at the start; quality below the 20.0 gate.
        assert_eq!(c.classify(b"TCGTACGTACGT", 10.0, 0.0).unwrap(), Assignment::Unknown);
        // Same read at the gate boundary is assigned.
        assert_eq!(c.classify(b"TCGTACGTACGT", 20.0, 0.0).unwrap(), Assignment::Inexact(0));
    }

    #[test]
    fn test_ambiguous_read_is_never_matched_inexactly() {
        let mut c = classifier(index(&[snp_locus()]));
        assert_eq!(c.classify(b"TCGTACGTACGT", 30.0, 0.5).unwrap(), Assignment::Unknown);
    }

    #[test]
    fn test_inexact_matching_disabled_entirely() {
        let mut c = AlleleClassifier::new(index(&[snp_locus()]), false, 0.0, 1.0);
        assert_eq!(c.classify(b"TCGTACGTACGT", 40.0, 0.0).unwrap(), Assignment::Unknown);
    }

    #[test]
    fn test_snp_pair_resolved_to_the_better_allele() {
        let mut c = classifier(index(&[snp_locus()]));
        // Substitution away from the SNP position: both alleles survive the
        // k-mer filter, the better alignment decides.
        assert_eq!(c.classify(b"TCGTACGTACGT", 30.0, 0.0).unwrap(), Assignment::Inexact(0));
        assert_eq!(c.classify(b"TCGTACGTACGA", 30.0, 0.0).unwrap(), Assignment::Inexact(1));
    }

    #[test]
    fn test_no_candidates_is_unknown() {
        let mut c = classifier(index(&[snp_locus()]));
        assert_eq!(c.classify(b"GGGGGGGGGGGG", 30.0, 0.0).unwrap(), Assignment::Unknown);
    }

    #[test]
    fn test_region_too_short_for_kmers_is_a_format_error() {
        let mut c = classifier(index(&[snp_locus()]));
        let err = c.classify(b"TCGTACG", 30.0, 0.0).unwrap_err();
        assert!(matches!(err, AfseqError::Format { .. }));
    }

    #[test]
    fn test_ranked_candidates_accept_with_margin() {
        let mut c = classifier(index(&[snp_locus(), multi_locus()]));
        // One substitution at the start of the first multi-locus allele:
        // both of its alleles survive, the locus is not a SNP, and the top
        // score (15) beats the runner-up (11) by more than one substitution.
        let region = b"ATTTGGGGCCCCAAAA";
        assert_eq!(c.classify(region, 30.0, 0.0).unwrap(), Assignment::Inexact(2));
    }

    #[test]
    fn test_ranked_candidates_rejected_without_margin() {
        let mut c = classifier(index(&[snp_locus(), multi_locus()]));
        // Shared prefix with a tail matching neither allele: equal scores,
        // no margin, unknown.
        let region = b"TTTTGGGGCCCCGGGG";
        assert_eq!(c.classify(region, 30.0, 0.0).unwrap(), Assignment::Unknown);
    }

    #[test]
    fn test_snp_flag_detection() {
        let idx = index(&[snp_locus(), multi_locus()]);
        assert!(idx.loci()[0].is_snp());
        assert!(!idx.loci()[1].is_snp());
        assert_eq!(idx.loci()[0].allele_ids(), &[0, 1]);
        assert_eq!(idx.loci()[1].allele_ids(), &[2, 3]);
    }

    #[test]
    fn test_min_score_is_fraction_of_perfect() {
        let idx = index(&[snp_locus()]);
        assert!((idx.allele(0).min_score() - 9.0).abs() < f32::EPSILON);
    }

    #[test]
    fn test_locus_with_one_allele_rejected() {
        let locus = LocusConfig { name: String::new(), alleles: vec![SNP_A.to_string()] };
        let err = AlleleIndex::build(&[locus], ScoringModel::default()).unwrap_err();
        assert!(matches!(err, AfseqError::Configuration { .. }));
    }

    #[test]
    fn test_unequal_allele_lengths_rejected() {
        let locus = LocusConfig {
            name: String::new(),
            alleles: vec![SNP_A.to_string(), "ACGTACGTA".to_string()],
        };
        let err = AlleleIndex::build(&[locus], ScoringModel::default()).unwrap_err();
        assert!(matches!(err, AfseqError::Configuration { .. }));
    }

    #[test]
    fn test_duplicate_allele_rejected() {
        let locus = LocusConfig {
            name: String::new(),
            alleles: vec![SNP_A.to_string(), SNP_A.to_string()],
        };
        let err = AlleleIndex::build(&[locus], ScoringModel::default()).unwrap_err();
        assert!(matches!(err, AfseqError::Configuration { .. }));
    }

    #[test]
    fn test_cross_locus_prefix_rejected() {
        let other = LocusConfig {
            name: String::new(),
            alleles: vec![format!("{SNP_A}TTTT"), format!("{SNP_B}GGGG")],
        };
        let err = AlleleIndex::build(&[snp_locus(), other], ScoringModel::default()).unwrap_err();
        assert!(matches!(err, AfseqError::Configuration { .. }));
    }

    #[test]
    fn test_allele_shorter_than_kmer_rejected() {
        let locus = LocusConfig {
            name: String::new(),
            alleles: vec!["ACGTACGT".to_string(), "ACGTACGA".to_string()],
        };
        let err = AlleleIndex::build(&[locus], ScoringModel::default()).unwrap_err();
        assert!(matches!(err, AfseqError::Configuration { .. }));
    }

    #[test]
    fn test_unnamed_locus_gets_positional_name() {
        let locus = LocusConfig {
            name: String::new(),
            alleles: vec![SNP_A.to_string(), SNP_B.to_string()],
        };
        let idx = AlleleIndex::build(&[locus], ScoringModel::default()).unwrap();
        assert_eq!(idx.loci()[0].name(), "locus_1");
    }

    #[test]
    fn test_kmers_with_ambiguous_bases_are_skipped() {
        let mut c = classifier(index(&[snp_locus()]));
        // Ns scattered so that no window is N-free: no candidates, unknown.
        assert_eq!(c.classify(b"ACGTNCGTANGTNCGT", 30.0, 0.0).unwrap(), Assignment::Unknown);
    }
}
