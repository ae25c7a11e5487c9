//! Chunked splitting of FASTQ byte streams.
//!
//! [`ChunkReader`] turns one input stream into a lazy, finite sequence of
//! byte chunks, each holding a whole number of complete 4-line records, so
//! that downstream workers can decode chunks independently. A chunk boundary
//! never falls inside a record.
//!
//! Quality-line characters may coincide with the record and separator
//! markers, so the raw byte boundary cannot be trusted: after filling a
//! chunk to its target size the reader scans forward through a bounded
//! lookahead for a line starting with `@` whose second-following line starts
//! with `+`, which uniquely identifies the next record start (sequence lines
//! never begin with either marker). Lines before that boundary extend the
//! current chunk; the boundary lines are carried into the next one.

use crate::errors::{AfseqError, Result};
use crate::fastq::{RECORD_MARKER, SEPARATOR_MARKER};
use flate2::read::MultiGzDecoder;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

/// Lines scanned past the raw chunk boundary for the next record start.
/// A 4-line record period guarantees a boundary within half of this.
pub const LOOKAHEAD_LINES: usize = 8;

/// Chunks are raised to comfortably exceed this many records, avoiding
/// degenerate tiny chunks that would make per-chunk overhead dominate.
pub const MIN_CHUNK_RECORDS: usize = 200;

/// Default target chunk size in bytes.
pub const DEFAULT_CHUNK_BYTES: usize = 1 << 20;

/// Buffer size for file readers.
const READER_CAPACITY: usize = 1 << 16;

/// Opens a FASTQ file for buffered reading, transparently decompressing
/// files with a `.gz` extension.
pub fn open_fastq(path: &Path) -> Result<Box<dyn BufRead + Send>> {
    let file = File::open(path)?;
    if path.extension().is_some_and(|ext| ext.eq_ignore_ascii_case("gz")) {
        let decoder = MultiGzDecoder::new(BufReader::with_capacity(READER_CAPACITY, file));
        Ok(Box::new(BufReader::with_capacity(READER_CAPACITY, decoder)))
    } else {
        Ok(Box::new(BufReader::with_capacity(READER_CAPACITY, file)))
    }
}

/// Splits a record stream into whole-record byte chunks.
///
/// The sequence of chunks is lazy, finite, and non-restartable; concatenating
/// all yielded chunks reproduces the input exactly. Failing to locate a
/// record boundary within the lookahead is a fatal format error, never a
/// guess.
pub struct ChunkReader<R: BufRead> {
    source: R,
    target_bytes: usize,
    /// Bytes already read from the source that belong to the next chunk.
    carry: Vec<u8>,
    finished: bool,
}

impl<R: BufRead> ChunkReader<R> {
    /// Creates a splitter producing chunks of roughly `target_bytes` bytes.
    ///
    /// The first record group is read immediately to estimate the per-record
    /// byte length; the target is raised, if necessary, so that every chunk
    /// comfortably exceeds [`MIN_CHUNK_RECORDS`] records.
    pub fn new(source: R, target_bytes: usize) -> Result<Self> {
        let mut reader = Self::with_exact_target(source, target_bytes)?;
        let estimated_record_bytes = reader.carry.len().max(1);
        let floor = estimated_record_bytes * 2 * MIN_CHUNK_RECORDS;
        reader.target_bytes = reader.target_bytes.max(floor);
        Ok(reader)
    }

    /// Creates a splitter that honors `target_bytes` exactly, without the
    /// minimum-size raise. Exposed for boundary tests.
    pub(crate) fn with_exact_target(mut source: R, target_bytes: usize) -> Result<Self> {
        let mut carry = Vec::new();
        for _ in 0..4 {
            if source.read_until(b'\n', &mut carry)? == 0 {
                break;
            }
        }
        Ok(Self { source, target_bytes, carry, finished: false })
    }

    fn next_chunk(&mut self) -> Result<Option<Vec<u8>>> {
        let mut chunk = std::mem::take(&mut self.carry);
        if self.finished {
            return Ok(if chunk.is_empty() { None } else { Some(chunk) });
        }

        while chunk.len() < self.target_bytes {
            if self.source.read_until(b'\n', &mut chunk)? == 0 {
                self.finished = true;
                return Ok(if chunk.is_empty() { None } else { Some(chunk) });
            }
        }

        let mut lookahead: Vec<Vec<u8>> = Vec::with_capacity(LOOKAHEAD_LINES);
        let mut at_eof = false;
        for _ in 0..LOOKAHEAD_LINES {
            let mut line = Vec::new();
            if self.source.read_until(b'\n', &mut line)? == 0 {
                at_eof = true;
                break;
            }
            lookahead.push(line);
        }

        let boundary = (0..lookahead.len()).find(|&i| {
            lookahead[i].first() == Some(&RECORD_MARKER)
                && i + 2 < lookahead.len()
                && lookahead[i + 2].first() == Some(&SEPARATOR_MARKER)
        });

        match boundary {
            Some(i) => {
                for line in &lookahead[..i] {
                    chunk.extend_from_slice(line);
                }
                for line in &lookahead[i..] {
                    self.carry.extend_from_slice(line);
                }
                Ok(Some(chunk))
            }
            None if at_eof => {
                // The remaining lines complete the current record group (or
                // expose a truncated file to the decoder). Final chunk.
                self.finished = true;
                for line in &lookahead {
                    chunk.extend_from_slice(line);
                }
                Ok(Some(chunk))
            }
            None => Err(AfseqError::format(format!(
                "no record boundary found within {LOOKAHEAD_LINES} lines past the chunk target"
            ))),
        }
    }
}

impl<R: BufRead> Iterator for ChunkReader<R> {
    type Item = Result<Vec<u8>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.finished && self.carry.is_empty() {
            return None;
        }
        match self.next_chunk() {
            Ok(Some(chunk)) => Some(Ok(chunk)),
            Ok(None) => None,
            Err(e) => {
                self.finished = true;
                self.carry.clear();
                Some(Err(e))
            }
        }
    }
}
