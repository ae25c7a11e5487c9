//! FASTQ record decoding.
//!
//! Input files use the 4-line-per-record convention: an identifier line
//! starting with `@`, the sequence line, a separator line starting with `+`,
//! and a quality line of the same length as the sequence. [`FastqRead`]
//! decodes one such group, validating the markers and lengths, and derives
//! the read's average quality and ambiguous-base fraction once at
//! construction. Reads are immutable afterwards.

use crate::errors::{AfseqError, Result};

/// First byte of a record identifier line
pub const RECORD_MARKER: u8 = b'@';

/// First byte of the separator line between sequence and quality
pub const SEPARATOR_MARKER: u8 = b'+';

/// Fixed offset subtracted from each quality character (Phred+33)
pub const QUALITY_OFFSET: u8 = 33;

/// The ambiguous base call
pub const AMBIGUOUS_BASE: u8 = b'N';

/// One decoded sequencing read.
///
/// Holds the identifier (without the leading `@`), the raw sequence bytes,
/// and the decoded per-base quality scores, along with quality statistics
/// derived eagerly at construction.
#[derive(Debug, Clone, PartialEq)]
pub struct FastqRead {
    header: String,
    seq: Vec<u8>,
    quals: Vec<u8>,
    avg_quality: f64,
    fraction_n: f64,
}

impl FastqRead {
    /// Decodes one complete 4-line record group.
    ///
    /// Validates that line 1 begins with `@`, line 3 begins with `+`, and
    /// that the quality line length equals the sequence line length. Returns
    /// a [`AfseqError::Format`] carrying the offending record text on any
    /// violation.
    pub fn from_lines(line1: &[u8], line2: &[u8], line3: &[u8], line4: &[u8]) -> Result<Self> {
        if line1.first() != Some(&RECORD_MARKER) || line3.first() != Some(&SEPARATOR_MARKER) {
            return Err(AfseqError::Format {
                reason: "missing @ or + marker in the expected position".to_string(),
                record: record_text(line1, line2, line3, line4),
            });
        }
        if line2.len() != line4.len() {
            return Err(AfseqError::Format {
                reason: format!(
                    "quality line length ({}) does not equal sequence line length ({})",
                    line4.len(),
                    line2.len()
                ),
                record: record_text(line1, line2, line3, line4),
            });
        }
        let header = String::from_utf8(line1[1..].to_vec()).map_err(|_| AfseqError::Format {
            reason: "identifier line is not valid UTF-8".to_string(),
            record: record_text(line1, line2, line3, line4),
        })?;

        let mut quals = Vec::with_capacity(line4.len());
        let mut quality_sum = 0u64;
        for &c in line4 {
            let Some(score) = c.checked_sub(QUALITY_OFFSET) else {
                return Err(AfseqError::Format {
                    reason: format!("quality character {:?} below encoding offset", c as char),
                    record: record_text(line1, line2, line3, line4),
                });
            };
            quality_sum += u64::from(score);
            quals.push(score);
        }

        let seq = line2.to_vec();
        let (avg_quality, fraction_n) = if seq.is_empty() {
            (0.0, 0.0)
        } else {
            let n_count = seq.iter().filter(|&&b| b == AMBIGUOUS_BASE).count();
            (quality_sum as f64 / seq.len() as f64, n_count as f64 / seq.len() as f64)
        };

        Ok(Self { header, seq, quals, avg_quality, fraction_n })
    }

    /// The identifier line text, without the leading `@`.
    #[must_use]
    pub fn header(&self) -> &str {
        &self.header
    }

    /// The sequence bases.
    #[must_use]
    pub fn seq(&self) -> &[u8] {
        &self.seq
    }

    /// Decoded per-base quality scores.
    #[must_use]
    pub fn quals(&self) -> &[u8] {
        &self.quals
    }

    /// Sequence length in bases.
    #[must_use]
    pub fn len(&self) -> usize {
        self.seq.len()
    }

    /// Whether the sequence is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.seq.is_empty()
    }

    /// Mean decoded quality score across the read.
    #[must_use]
    pub fn avg_quality(&self) -> f64 {
        self.avg_quality
    }

    /// Fraction of bases called as `N`.
    #[must_use]
    pub fn fraction_n(&self) -> f64 {
        self.fraction_n
    }

    /// Reconstructs the identifier and sequence lines exactly as they
    /// appeared in the input.
    #[must_use]
    pub fn to_record_text(&self) -> String {
        format!("@{}\n{}", self.header, String::from_utf8_lossy(&self.seq))
    }
}

fn record_text(line1: &[u8], line2: &[u8], line3: &[u8], line4: &[u8]) -> String {
    [line1, line2, line3, line4]
        .map(|line| String::from_utf8_lossy(line).into_owned())
        .join("\n")
}

/// Iterator decoding the records of one chunk.
///
/// Chunks produced by the splitter contain a whole number of records, so a
/// group with fewer than four lines is reported as a format error rather
/// than silently dropped.
pub struct RecordIter<'a> {
    rest: &'a [u8],
}

impl<'a> RecordIter<'a> {
    /// Creates an iterator over the record groups in `chunk`.
    #[must_use]
    pub fn new(chunk: &'a [u8]) -> Self {
        Self { rest: chunk }
    }

    fn next_line(&mut self) -> Option<&'a [u8]> {
        if self.rest.is_empty() {
            return None;
        }
        match self.rest.iter().position(|&b| b == b'\n') {
            Some(pos) => {
                let line = &self.rest[..pos];
                self.rest = &self.rest[pos + 1..];
                Some(line)
            }
            None => {
                let line = self.rest;
                self.rest = &self.rest[self.rest.len()..];
                Some(line)
            }
        }
    }
}

impl Iterator for RecordIter<'_> {
    type Item = Result<FastqRead>;

    fn next(&mut self) -> Option<Self::Item> {
        let line1 = self.next_line()?;
        let (Some(line2), Some(line3), Some(line4)) =
            (self.next_line(), self.next_line(), self.next_line())
        else {
            return Some(Err(AfseqError::Format {
                reason: "incomplete record group at end of data".to_string(),
                record: String::from_utf8_lossy(line1).into_owned(),
            }));
        };
        Some(FastqRead::from_lines(line1, line2, line3, line4))
    }
}
