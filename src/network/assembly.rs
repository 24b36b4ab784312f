//! Reassembly of wrapped commands from wrapper chunks.
//!
//! Each in-flight assembly is keyed by the transient wrapped-command id. Chunks may arrive in
//! any order, be duplicated or overlap; an assembly completes as soon as the byte range
//! `[0, total_data_length)` is covered, regardless of how many chunks the sender announced, and
//! its state is dropped in the same call.
//!
//! # Example
//!
//! ```
//! use fortress_lockstep::{split_into_chunks, AssemblyProgress, WrapperAssembler};
//!
//! let payload = b"wrapped command bytes".to_vec();
//! let mut chunks = split_into_chunks(9, &payload, 8).unwrap();
//! chunks.reverse();
//!
//! let mut assembler = WrapperAssembler::default();
//! let mut result = None;
//! for chunk in &chunks {
//!     if let AssemblyProgress::Complete(bytes) = assembler.add_chunk(chunk).unwrap() {
//!         result = Some(bytes);
//!     }
//! }
//! assert_eq!(result, Some(payload));
//! assert_eq!(assembler.pending_len(), 0);
//! ```

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use tracing::{debug, trace};

use crate::network::messages::WrapperChunk;
use crate::report_violation_to;
use crate::telemetry::{ViolationKind, ViolationObserver, ViolationSeverity};
use crate::{AssemblyConfig, Frame};

/// Why a chunk was rejected. A rejected chunk never changes assembler state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum AssemblyError {
    /// The chunk's byte range reaches past the announced total length.
    OutOfBounds {
        /// Offset of the chunk data.
        offset: u32,
        /// Length of the chunk data.
        length: u32,
        /// Announced total length.
        total: u32,
    },
    /// `data_length` disagrees with the number of data bytes carried.
    LengthMismatch {
        /// The declared data length.
        declared: u32,
        /// The actual number of bytes.
        actual: usize,
    },
    /// The chunk announces a different total length than earlier chunks of the same id.
    TotalLengthConflict {
        /// Total length of the pending assembly.
        expected: u32,
        /// Total length announced by this chunk.
        announced: u32,
    },
    /// The announced total length exceeds the configured maximum.
    TooLarge {
        /// Announced total length.
        total: u32,
        /// Configured maximum.
        max: u32,
    },
    /// Starting another assembly would exceed the configured number of pending assemblies.
    TooManyPending {
        /// Configured maximum.
        max: usize,
    },
}

impl fmt::Display for AssemblyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::OutOfBounds {
                offset,
                length,
                total,
            } => write!(
                f,
                "chunk range {offset}..{} lies outside payload of {total} bytes",
                u64::from(*offset) + u64::from(*length)
            ),
            Self::LengthMismatch { declared, actual } => write!(
                f,
                "chunk declares {declared} data bytes but carries {actual}"
            ),
            Self::TotalLengthConflict {
                expected,
                announced,
            } => write!(
                f,
                "chunk announces total length {announced}, assembly expects {expected}"
            ),
            Self::TooLarge { total, max } => {
                write!(f, "wrapped payload of {total} bytes exceeds limit of {max}")
            },
            Self::TooManyPending { max } => {
                write!(f, "more than {max} wrapped commands pending")
            },
        }
    }
}

impl std::error::Error for AssemblyError {}

/// Outcome of feeding a chunk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AssemblyProgress {
    /// Not all bytes have arrived yet.
    Incomplete {
        /// Bytes covered so far.
        received: u32,
        /// Announced total length.
        total: u32,
    },
    /// Every byte is covered. The assembly has been discarded.
    Complete(Vec<u8>),
}

/// Covered byte ranges, kept disjoint and non-adjacent (`start -> end`, end exclusive).
#[derive(Debug, Default, Clone)]
struct Coverage {
    ranges: BTreeMap<u32, u32>,
}

impl Coverage {
    fn insert(&mut self, start: u32, end: u32) {
        if start >= end {
            return;
        }
        let mut start = start;
        let mut end = end;
        // Merge with a range that begins before `start` and reaches it.
        if let Some((&s, &e)) = self.ranges.range(..=start).next_back() {
            if e >= start {
                start = s;
                end = end.max(e);
                self.ranges.remove(&s);
            }
        }
        // Merge with every range that begins inside [start, end].
        let absorbed: Vec<(u32, u32)> = self
            .ranges
            .range(start..=end)
            .map(|(&s, &e)| (s, e))
            .collect();
        for (s, e) in absorbed {
            end = end.max(e);
            self.ranges.remove(&s);
        }
        self.ranges.insert(start, end);
    }

    fn covered(&self) -> u32 {
        self.ranges.iter().map(|(s, e)| e - s).sum()
    }

    fn covers(&self, total: u32) -> bool {
        total == 0 || self.ranges.get(&0) == Some(&total)
    }
}

#[derive(Debug)]
struct PendingAssembly {
    total: u32,
    buffer: Vec<u8>,
    coverage: Coverage,
}

/// Reassembles wrapper chunks into complete payloads.
pub struct WrapperAssembler {
    config: AssemblyConfig,
    pending: BTreeMap<u16, PendingAssembly>,
    violation_observer: Option<Arc<dyn ViolationObserver>>,
}

impl fmt::Debug for WrapperAssembler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WrapperAssembler")
            .field("config", &self.config)
            .field("pending", &self.pending.keys().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

impl Default for WrapperAssembler {
    fn default() -> Self {
        Self::new(AssemblyConfig::default())
    }
}

impl WrapperAssembler {
    /// Creates an assembler with the given limits.
    #[must_use]
    pub fn new(config: AssemblyConfig) -> Self {
        Self {
            config,
            pending: BTreeMap::new(),
            violation_observer: None,
        }
    }

    /// Routes rejected-chunk reports to `observer` instead of the tracing fallback.
    #[must_use]
    pub fn with_observer(mut self, observer: Arc<dyn ViolationObserver>) -> Self {
        self.violation_observer = Some(observer);
        self
    }

    /// Number of assemblies in flight.
    #[must_use]
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// True if chunks for `wrapped_command_id` have arrived but the payload is not complete.
    #[must_use]
    pub fn is_pending(&self, wrapped_command_id: u16) -> bool {
        self.pending.contains_key(&wrapped_command_id)
    }

    /// Drops a pending assembly. Returns `true` if there was one.
    pub fn discard(&mut self, wrapped_command_id: u16) -> bool {
        self.pending.remove(&wrapped_command_id).is_some()
    }

    /// Drops every pending assembly.
    pub fn clear(&mut self) {
        self.pending.clear();
    }

    /// Feeds one chunk.
    ///
    /// Overlapping and duplicate chunks are merged by offset; the bytes of the latest chunk win
    /// where ranges overlap. A rejected chunk leaves every assembly untouched.
    pub fn add_chunk(&mut self, chunk: &WrapperChunk) -> Result<AssemblyProgress, AssemblyError> {
        let result = self.try_add_chunk(chunk);
        if let Err(err) = &result {
            report_violation_to!(
                self.violation_observer,
                ViolationSeverity::Warning,
                ViolationKind::WireFormat,
                Frame::NULL,
                "rejected chunk {} of wrapped command {}: {}",
                chunk.chunk_number,
                chunk.wrapped_command_id,
                err
            );
        }
        result
    }

    fn try_add_chunk(&mut self, chunk: &WrapperChunk) -> Result<AssemblyProgress, AssemblyError> {
        let id = chunk.wrapped_command_id;
        let total = chunk.total_data_length;

        if chunk.data_length as usize != chunk.data.len() {
            return Err(AssemblyError::LengthMismatch {
                declared: chunk.data_length,
                actual: chunk.data.len(),
            });
        }
        if total > self.config.max_total_length {
            return Err(AssemblyError::TooLarge {
                total,
                max: self.config.max_total_length,
            });
        }
        let end = chunk
            .data_offset
            .checked_add(chunk.data_length)
            .filter(|end| *end <= total)
            .ok_or(AssemblyError::OutOfBounds {
                offset: chunk.data_offset,
                length: chunk.data_length,
                total,
            })?;

        match self.pending.get(&id) {
            Some(existing) if existing.total != total => {
                return Err(AssemblyError::TotalLengthConflict {
                    expected: existing.total,
                    announced: total,
                });
            },
            None if self.pending.len() >= self.config.max_pending => {
                return Err(AssemblyError::TooManyPending {
                    max: self.config.max_pending,
                });
            },
            _ => {},
        }

        let assembly = self.pending.entry(id).or_insert_with(|| PendingAssembly {
            total,
            buffer: vec![0; total as usize],
            coverage: Coverage::default(),
        });
        let start = chunk.data_offset as usize;
        assembly.buffer[start..end as usize].copy_from_slice(&chunk.data);
        assembly.coverage.insert(chunk.data_offset, end);

        if assembly.coverage.covers(total) {
            debug!(
                "Wrapped command {} complete ({} bytes, last chunk {} of {})",
                id, total, chunk.chunk_number, chunk.num_chunks
            );
            let done = self.pending.remove(&id).map(|a| a.buffer).unwrap_or_default();
            return Ok(AssemblyProgress::Complete(done));
        }

        let received = assembly.coverage.covered();
        trace!(
            "Wrapped command {}: chunk {} added, {}/{} bytes",
            id,
            chunk.chunk_number,
            received,
            total
        );
        Ok(AssemblyProgress::Incomplete { received, total })
    }
}

#[cfg(test)]
#[allow(
    clippy::panic,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing
)]
mod tests {
    use super::*;
    use crate::network::codec::split_into_chunks;
    use crate::telemetry::CollectingObserver;

    fn chunk(id: u16, total: u32, offset: u32, data: &[u8]) -> WrapperChunk {
        WrapperChunk {
            wrapped_command_id: id,
            chunk_number: 0,
            num_chunks: 0,
            total_data_length: total,
            data_length: data.len() as u32,
            data_offset: offset,
            data: data.to_vec(),
        }
    }

    #[test]
    fn partial_coverage_is_incomplete() {
        let mut assembler = WrapperAssembler::default();
        let progress = assembler.add_chunk(&chunk(1, 6, 0, b"abc")).unwrap();
        assert_eq!(
            progress,
            AssemblyProgress::Incomplete {
                received: 3,
                total: 6
            }
        );
        assert!(assembler.is_pending(1));
    }

    #[test]
    fn overlapping_and_duplicate_chunks_merge() {
        let mut assembler = WrapperAssembler::default();
        assembler.add_chunk(&chunk(1, 6, 0, b"abcd")).unwrap();
        assembler.add_chunk(&chunk(1, 6, 0, b"abcd")).unwrap();
        let progress = assembler.add_chunk(&chunk(1, 6, 2, b"cd")).unwrap();
        assert_eq!(
            progress,
            AssemblyProgress::Incomplete {
                received: 4,
                total: 6
            }
        );
        let progress = assembler.add_chunk(&chunk(1, 6, 3, b"def")).unwrap();
        assert_eq!(progress, AssemblyProgress::Complete(b"abcdef".to_vec()));
        assert!(!assembler.is_pending(1));
    }

    #[test]
    fn completes_without_the_announced_number_of_chunks() {
        let mut assembler = WrapperAssembler::default();
        let mut first = chunk(3, 4, 0, b"wxyz");
        first.num_chunks = 10;
        assert_eq!(
            assembler.add_chunk(&first).unwrap(),
            AssemblyProgress::Complete(b"wxyz".to_vec())
        );
    }

    #[test]
    fn empty_payload_completes_immediately() {
        let mut assembler = WrapperAssembler::default();
        let chunks = split_into_chunks(4, &[], 16).unwrap();
        assert_eq!(
            assembler.add_chunk(&chunks[0]).unwrap(),
            AssemblyProgress::Complete(Vec::new())
        );
        assert_eq!(assembler.pending_len(), 0);
    }

    #[test]
    fn out_of_bounds_chunk_does_not_corrupt_state() {
        let observer = Arc::new(CollectingObserver::new());
        let mut assembler = WrapperAssembler::default().with_observer(observer.clone());
        assembler.add_chunk(&chunk(1, 4, 0, b"ab")).unwrap();

        let err = assembler.add_chunk(&chunk(1, 4, 3, b"zz")).unwrap_err();
        assert!(matches!(err, AssemblyError::OutOfBounds { .. }));
        assert!(observer.has_violation(ViolationKind::WireFormat));

        let overflow = chunk(1, 4, u32::MAX, b"z");
        assert!(assembler.add_chunk(&overflow).is_err());

        assert_eq!(
            assembler.add_chunk(&chunk(1, 4, 2, b"cd")).unwrap(),
            AssemblyProgress::Complete(b"abcd".to_vec())
        );
    }

    #[test]
    fn conflicting_total_is_rejected() {
        let mut assembler = WrapperAssembler::default();
        assembler.add_chunk(&chunk(1, 4, 0, b"ab")).unwrap();
        assert_eq!(
            assembler.add_chunk(&chunk(1, 5, 2, b"cd")),
            Err(AssemblyError::TotalLengthConflict {
                expected: 4,
                announced: 5
            })
        );
    }

    #[test]
    fn length_field_must_match_data() {
        let mut assembler = WrapperAssembler::default();
        let mut bad = chunk(1, 4, 0, b"ab");
        bad.data_length = 3;
        assert!(matches!(
            assembler.add_chunk(&bad),
            Err(AssemblyError::LengthMismatch { .. })
        ));
        assert_eq!(assembler.pending_len(), 0);
    }

    #[test]
    fn limits_are_enforced() {
        let mut assembler = WrapperAssembler::new(AssemblyConfig {
            max_total_length: 8,
            max_pending: 1,
        });
        assert!(matches!(
            assembler.add_chunk(&chunk(1, 9, 0, b"a")),
            Err(AssemblyError::TooLarge { total: 9, max: 8 })
        ));
        assembler.add_chunk(&chunk(1, 4, 0, b"a")).unwrap();
        assert_eq!(
            assembler.add_chunk(&chunk(2, 4, 0, b"a")),
            Err(AssemblyError::TooManyPending { max: 1 })
        );
        // further chunks for the pending id are still accepted
        assert!(assembler.add_chunk(&chunk(1, 4, 1, b"b")).is_ok());
    }

    #[test]
    fn coverage_merges_adjacent_ranges() {
        let mut coverage = Coverage::default();
        coverage.insert(4, 6);
        coverage.insert(0, 2);
        coverage.insert(2, 4);
        assert!(coverage.covers(6));
        assert_eq!(coverage.ranges.len(), 1);

        let mut gaps = Coverage::default();
        gaps.insert(0, 2);
        gaps.insert(3, 5);
        assert_eq!(gaps.covered(), 4);
        assert!(!gaps.covers(5));
    }
}
