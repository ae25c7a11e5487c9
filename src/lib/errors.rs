//! Custom error types for afseq operations.

use thiserror::Error;

/// Result type alias for afseq operations
pub type Result<T> = std::result::Result<T, AfseqError>;

/// Error type for afseq operations
#[derive(Error, Debug)]
pub enum AfseqError {
    /// Malformed or contradictory barcode/locus/scoring declarations.
    /// Detected at load/freeze time, before any read is processed.
    #[error("Invalid configuration: {reason}")]
    Configuration {
        /// Explanation of what is wrong with the declarations
        reason: String,
    },

    /// Malformed input record or an unsplittable input stream. Fatal for the
    /// run: the splitter's correctness depends on well-formed records.
    #[error("Malformed record data: {reason}\n{record}")]
    Format {
        /// Explanation of the problem
        reason: String,
        /// The offending record text (may be empty when not applicable)
        record: String,
    },

    /// An internal contradiction that signals a logic defect. Always fatal,
    /// never silently absorbed.
    #[error("Internal invariant violated: {reason}")]
    InvariantViolation {
        /// Description of the violated invariant
        reason: String,
    },

    /// Underlying I/O failure while reading input
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl AfseqError {
    /// Shorthand for a [`AfseqError::Format`] error without record text.
    #[must_use]
    pub fn format(reason: impl Into<String>) -> Self {
        AfseqError::Format { reason: reason.into(), record: String::new() }
    }
}
