//! Score-only local affine-gap alignment.
//!
//! The classifier only needs to know *how well* a read region matches an
//! allele, never the alignment path itself, so the scorer implements the
//! Gotoh recurrence without traceback. Gap state is kept in rolling vectors
//! rather than full matrices, and scores are clamped at the local-alignment
//! floor of zero. The functions here are pure and hold no mutable state, so
//! workers call them concurrently without synchronization.

use serde::Deserialize;

/// Extra query bases allowed beyond the reference length before truncation.
///
/// Bounds the worst case to roughly O(reference_length^2) when a read region
/// is far longer than the allele being scored.
pub const QUERY_SLACK: usize = 10;

/// Immutable substitution and gap scoring parameters.
///
/// Penalties are expressed as negative values and added into the running
/// score, matching how they are declared in the run configuration.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ScoringModel {
    /// Score added when two bases are equal (positive)
    pub match_score: f32,
    /// Score added when two bases differ (non-positive)
    pub mismatch_penalty: f32,
    /// Score added when a gap is opened (non-positive)
    pub gap_open: f32,
    /// Score added when a gap is extended (non-positive)
    pub gap_extend: f32,
}

impl Default for ScoringModel {
    fn default() -> Self {
        Self { match_score: 1.0, mismatch_penalty: -2.0, gap_open: -2.0, gap_extend: -1.0 }
    }
}

impl ScoringModel {
    /// The match/mismatch value for a pair of bases. Base equality only; an
    /// `N` never equals anything but itself.
    #[inline]
    #[must_use]
    pub fn substitution(&self, a: u8, b: u8) -> f32 {
        if a == b { self.match_score } else { self.mismatch_penalty }
    }

    /// The score margin worth one substitution, used to separate the top two
    /// alignment candidates.
    #[must_use]
    pub fn substitution_margin(&self) -> f32 {
        self.match_score - self.mismatch_penalty
    }
}

/// Best local alignment score of `query` against `reference` under the
/// affine-gap recurrence, without traceback.
///
/// The recurrence keeps one rolling score row plus per-axis gap vectors: at
/// each cell the gap term is the better of opening a new gap from the main
/// score or extending the running gap. Queries longer than the reference
/// plus [`QUERY_SLACK`] are truncated before scoring.
#[must_use]
pub fn local_alignment_score(reference: &[u8], query: &[u8], model: &ScoringModel) -> f32 {
    let cutoff = reference.len() + QUERY_SLACK;
    let query = if query.len() > cutoff { &query[..cutoff] } else { query };
    if reference.is_empty() || query.is_empty() {
        return 0.0;
    }

    let cols = reference.len();
    // score_row[j] holds H[i-1][j] until column j is visited, then H[i][j].
    let mut score_row = vec![0.0f32; cols + 1];
    // gap_ref[j]: best score ending in a gap that skips reference column j.
    let mut gap_ref = vec![f32::NEG_INFINITY; cols + 1];
    let mut best = 0.0f32;

    for &q in query {
        let mut diag = score_row[0];
        // Best score ending in a gap that skips query bases, within this row.
        let mut gap_query = f32::NEG_INFINITY;
        for j in 1..=cols {
            gap_ref[j] = (score_row[j] + model.gap_open).max(gap_ref[j] + model.gap_extend);
            gap_query = (score_row[j - 1] + model.gap_open).max(gap_query + model.gap_extend);
            let along_diagonal = diag + model.substitution(reference[j - 1], q);
            let cell = along_diagonal.max(gap_ref[j]).max(gap_query).max(0.0);
            diag = score_row[j];
            score_row[j] = cell;
            if cell > best {
                best = cell;
            }
        }
    }
    best
}

/// Ungapped positional score of `query` against `reference`.
///
/// Compares position-by-position over the reference's length; query bases
/// beyond the reference are ignored and missing query positions count as
/// mismatches, so the result is on the same scale as a full-length alignment
/// against that reference.
#[must_use]
pub fn ungapped_score(reference: &[u8], query: &[u8], model: &ScoringModel) -> f32 {
    let mut score = 0.0f32;
    for (i, &base) in reference.iter().enumerate() {
        score += match query.get(i) {
            Some(&q) => model.substitution(base, q),
            None => model.mismatch_penalty,
        };
    }
    score
}

#[cfg(test)]
mod tests {
    use super::*;

    fn model() -> ScoringModel {
        ScoringModel::default()
    }

    #[test]
    fn test_identical_sequences_score_full_length() {
        let score = local_alignment_score(b"ACGTACGT", b"ACGTACGT", &model());
        assert!((score - 8.0).abs() < f32::EPSILON);
    }

    #[test]
    fn test_empty_sequences_score_zero() {
        assert!((local_alignment_score(b"", b"ACGT", &model())).abs() < f32::EPSILON);
        assert!((local_alignment_score(b"ACGT", b"", &model())).abs() < f32::EPSILON);
    }

    #[test]
    fn test_single_substitution() {
        // Full-length alignment with one mismatch (8 - 2 = 6) beats either
        // exact four-base run.
        let score = local_alignment_score(b"AAAAAAAAA", b"AAAATAAAA", &model());
        assert!((score - 6.0).abs() < f32::EPSILON);
    }

    #[test]
    fn test_single_base_deletion_uses_gap_open() {
        // Query is the reference with one base deleted: 11 matches plus one
        // opened gap (11 - 2 = 9) beats the best exact run of 7.
        let score = local_alignment_score(b"ACGTACGTACGT", b"ACGTACGACGT", &model());
        assert!((score - 9.0).abs() < f32::EPSILON);
    }

    #[test]
    fn test_two_base_deletion_extends_gap() {
        // One open plus one extend (10 - 2 - 1 = 7) beats two separate gaps
        // (10 - 4 = 6).
        let score = local_alignment_score(b"ACGTACGTACGT", b"ACGTACACGT", &model());
        assert!((score - 7.0).abs() < f32::EPSILON);
    }

    #[test]
    fn test_local_floor_never_negative() {
        let score = local_alignment_score(b"AAAA", b"CCCC", &model());
        assert!(score.abs() < f32::EPSILON);
    }

    #[test]
    fn test_long_query_is_truncated() {
        // The matching suffix sits beyond reference length + slack, so it is
        // never seen by the scorer.
        let query = [&[b'C'; 14][..], b"AAAA"].concat();
        let score = local_alignment_score(b"AAAA", &query, &model());
        assert!(score.abs() < f32::EPSILON);
    }

    #[test]
    fn test_ungapped_score_counts_each_position() {
        let m = model();
        assert!((ungapped_score(b"ACGT", b"ACGT", &m) - 4.0).abs() < f32::EPSILON);
        assert!((ungapped_score(b"ACGT", b"ACGA", &m) - 1.0).abs() < f32::EPSILON);
        // Query bases past the reference are ignored.
        assert!((ungapped_score(b"ACGT", b"ACGTGGGG", &m) - 4.0).abs() < f32::EPSILON);
        // Missing query positions count as mismatches.
        assert!((ungapped_score(b"ACGT", b"AC", &m) - (2.0 - 4.0)).abs() < f32::EPSILON);
    }

    #[test]
    fn test_substitution_margin() {
        assert!((model().substitution_margin() - 3.0).abs() < f32::EPSILON);
    }
}
