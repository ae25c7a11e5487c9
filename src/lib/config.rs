//! Declarative run configuration.
//!
//! A run is described by an immutable JSON document: the barcode list, the
//! loci with their allele panels, scoring parameters, and the thresholds
//! gating inexact matching. Everything is validated once at load time,
//! before any read is processed; the frozen classifier structures are then
//! built from it and never mutated.

use crate::alignment::ScoringModel;
use crate::errors::{AfseqError, Result};
use serde::Deserialize;
use std::fs;
use std::path::Path;

/// The M13 forward primer, the constant leader expected after the barcode
/// in the default library layout.
pub const DEFAULT_LEADER_SEQUENCE: &str = "GTAAAACGACGGCCAGT";

/// Ensures a declared sequence uses only the A/C/G/T alphabet.
pub(crate) fn validate_acgt(seq: &str, what: &str) -> Result<()> {
    if seq.bytes().all(|b| matches!(b, b'A' | b'C' | b'G' | b'T')) {
        Ok(())
    } else {
        Err(AfseqError::Configuration {
            reason: format!("{what} {seq} contains a character other than A, C, G, or T"),
        })
    }
}

/// One genotyped locus: a name and its panel of allele sequences.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LocusConfig {
    /// Display name; an empty name is rendered as `locus_<n>` in reports
    #[serde(default)]
    pub name: String,
    /// Allele sequences, all of equal length, at least two
    pub alleles: Vec<String>,
}

/// Quality and length gates applied per read.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Thresholds {
    /// Absolute minimum average quality for attempting inexact allele
    /// matching. When absent it is derived from `quality_quantile` over a
    /// pre-scan of the first input file.
    pub min_avg_quality: Option<f64>,
    /// Quantile of the pre-scanned average-quality distribution used when
    /// `min_avg_quality` is not given
    pub quality_quantile: f64,
    /// Maximum fraction of `N` bases for attempting inexact allele matching
    pub max_fraction_n: f64,
    /// Reads shorter than this are counted and skipped
    pub min_read_length: usize,
    /// Whether the constant leader subsequence must be present
    pub require_leader: bool,
    /// Hamming distance tolerated when checking the leader
    pub leader_max_distance: usize,
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            min_avg_quality: None,
            quality_quantile: 0.02,
            max_fraction_n: 0.2,
            min_read_length: 75,
            require_leader: true,
            leader_max_distance: 1,
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_leader_sequence() -> String {
    DEFAULT_LEADER_SEQUENCE.to_string()
}

fn default_output_prefix() -> String {
    "Results".to_string()
}

fn default_prescan_reads() -> usize {
    5_000
}

/// The immutable description of one counting run.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RunConfig {
    /// Sample barcodes in declaration order
    pub barcodes: Vec<String>,
    /// Genotyped loci with their allele panels
    pub loci: Vec<LocusConfig>,
    /// Substitution and gap scoring parameters
    #[serde(default)]
    pub scoring: ScoringModel,
    /// Per-read gates
    #[serde(default)]
    pub thresholds: Thresholds,
    /// Constant subsequence expected immediately after the barcode
    #[serde(default = "default_leader_sequence")]
    pub leader_sequence: String,
    /// Master switch for inexact allele matching
    #[serde(default = "default_true")]
    pub assign_inexact_alleles: bool,
    /// Master switch for distance-1 barcode matching (still subject to the
    /// pairwise-distance safety check at freeze time)
    #[serde(default = "default_true")]
    pub allow_inexact_barcodes: bool,
    /// Output file name prefix
    #[serde(default = "default_output_prefix")]
    pub output_prefix: String,
    /// Number of leading reads sampled for pre-scan statistics
    #[serde(default = "default_prescan_reads")]
    pub prescan_reads: usize,
}

impl RunConfig {
    /// Loads and validates a configuration from a JSON file.
    pub fn from_json_file(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path).map_err(|e| AfseqError::Configuration {
            reason: format!("cannot read config file {}: {e}", path.display()),
        })?;
        let config: RunConfig =
            serde_json::from_str(&text).map_err(|e| AfseqError::Configuration {
                reason: format!("cannot parse config file {}: {e}", path.display()),
            })?;
        config.validate()?;
        Ok(config)
    }

    /// Validates scoring parameters, thresholds, and the leader declaration.
    ///
    /// Barcode and locus declarations are validated by the structures built
    /// from them at freeze time.
    pub fn validate(&self) -> Result<()> {
        let s = &self.scoring;
        if s.match_score <= 0.0 {
            return Err(AfseqError::Configuration {
                reason: format!("match score must be positive, got {}", s.match_score),
            });
        }
        for (value, name) in [
            (s.mismatch_penalty, "mismatch penalty"),
            (s.gap_open, "gap open penalty"),
            (s.gap_extend, "gap extend penalty"),
        ] {
            if value > 0.0 {
                return Err(AfseqError::Configuration {
                    reason: format!("{name} must not be positive, got {value}"),
                });
            }
        }

        let t = &self.thresholds;
        if !(0.0..1.0).contains(&t.quality_quantile) {
            return Err(AfseqError::Configuration {
                reason: format!("quality quantile must be in [0, 1), got {}", t.quality_quantile),
            });
        }
        if !(0.0..=1.0).contains(&t.max_fraction_n) {
            return Err(AfseqError::Configuration {
                reason: format!("max N fraction must be in [0, 1], got {}", t.max_fraction_n),
            });
        }

        if t.require_leader && self.leader_sequence.is_empty() {
            return Err(AfseqError::Configuration {
                reason: "a leader sequence is required but none is declared".to_string(),
            });
        }
        if !self.leader_sequence.is_empty() {
            validate_acgt(&self.leader_sequence, "leader sequence")?;
        }
        if t.leader_max_distance > self.leader_sequence.len() {
            return Err(AfseqError::Configuration {
                reason: format!(
                    "leader tolerance {} exceeds the leader length {}",
                    t.leader_max_distance,
                    self.leader_sequence.len()
                ),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn minimal_json() -> String {
        r#"{
            "barcodes": ["AAAAAA", "TTTTTT"],
            "loci": [{"name": "mal1", "alleles": ["ACGTACGTACGT", "ACGTACGTACGA"]}]
        }"#
        .to_string()
    }

    fn parse(json: &str) -> Result<RunConfig> {
        let config: RunConfig = serde_json::from_str(json).map_err(|e| {
            AfseqError::Configuration { reason: e.to_string() }
        })?;
        config.validate()?;
        Ok(config)
    }

    #[test]
    fn test_defaults_match_the_documented_run_options() {
        let config = parse(&minimal_json()).unwrap();
        assert_eq!(config.leader_sequence, DEFAULT_LEADER_SEQUENCE);
        assert!(config.assign_inexact_alleles);
        assert!(config.allow_inexact_barcodes);
        assert_eq!(config.output_prefix, "Results");
        assert_eq!(config.prescan_reads, 5_000);
        assert!(config.thresholds.min_avg_quality.is_none());
        assert!((config.thresholds.quality_quantile - 0.02).abs() < f64::EPSILON);
        assert!((config.thresholds.max_fraction_n - 0.2).abs() < f64::EPSILON);
        assert_eq!(config.thresholds.min_read_length, 75);
        assert!(config.thresholds.require_leader);
        assert_eq!(config.thresholds.leader_max_distance, 1);
        assert!((config.scoring.match_score - 1.0).abs() < f32::EPSILON);
        assert!((config.scoring.mismatch_penalty + 2.0).abs() < f32::EPSILON);
    }

    #[test]
    fn test_unknown_field_is_rejected() {
        let json = minimal_json().replace("\"barcodes\"", "\"barcoddes\"");
        assert!(parse(&json).is_err());
    }

    #[test]
    fn test_positive_gap_penalty_rejected() {
        let json = r#"{
            "barcodes": ["AAAAAA"],
            "loci": [{"alleles": ["ACGTACGTACGT", "ACGTACGTACGA"]}],
            "scoring": {"match_score": 1.0, "mismatch_penalty": -2.0, "gap_open": 2.0, "gap_extend": -1.0}
        }"#;
        let err = parse(json).unwrap_err();
        assert!(matches!(err, AfseqError::Configuration { .. }));
    }

    #[test]
    fn test_quantile_out_of_range_rejected() {
        let json = minimal_json()
            .trim_end_matches('}')
            .to_string()
            + r#", "thresholds": {"quality_quantile": 1.5}}"#;
        assert!(parse(&json).is_err());
    }

    #[test]
    fn test_leader_with_invalid_base_rejected() {
        let json = minimal_json().trim_end_matches('}').to_string()
            + r#", "leader_sequence": "GTAAXACGA"}"#;
        assert!(parse(&json).is_err());
    }

    #[test]
    fn test_leader_tolerance_beyond_length_rejected() {
        let json = minimal_json().trim_end_matches('}').to_string()
            + r#", "leader_sequence": "GT", "thresholds": {"leader_max_distance": 3}}"#;
        assert!(parse(&json).is_err());
    }

    #[test]
    fn test_required_leader_cannot_be_empty() {
        let json = minimal_json().trim_end_matches('}').to_string()
            + r#", "leader_sequence": ""}"#;
        assert!(parse(&json).is_err());
    }

    #[test]
    fn test_from_json_file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run.json");
        let mut file = std::fs::File::create(&path).unwrap();
        file.write_all(minimal_json().as_bytes()).unwrap();

        let config = RunConfig::from_json_file(&path).unwrap();
        assert_eq!(config.barcodes, vec!["AAAAAA".to_string(), "TTTTTT".to_string()]);
        assert_eq!(config.loci.len(), 1);
        assert_eq!(config.loci[0].name, "mal1");
    }

    #[test]
    fn test_missing_file_is_a_configuration_error() {
        let err = RunConfig::from_json_file(Path::new("/no/such/config.json")).unwrap_err();
        assert!(matches!(err, AfseqError::Configuration { .. }));
    }
}
