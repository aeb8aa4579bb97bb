//! Buffer position metadata: origins, sequence numbers and chunks.

use rkyv::{Archive, Deserialize as RkyvDeserialize, Serialize as RkyvSerialize};

use super::{Timestamp, Watermark};

/// Sequence number of a logical buffer within its origin. Starts at 1.
pub type SequenceNumber = u64;

/// Chunk number of a physical buffer within its logical buffer. Starts at 1.
pub type ChunkNumber = u64;

/// Identifies one upstream producer or partition.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Archive,
    RkyvSerialize,
    RkyvDeserialize,
    serde::Serialize,
    serde::Deserialize,
)]
pub struct OriginId(pub u64);

impl OriginId {
    /// Creates a new origin ID.
    #[inline]
    #[must_use]
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    /// Returns the raw ID.
    #[inline]
    #[must_use]
    pub const fn as_u64(&self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for OriginId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "origin-{}", self.0)
    }
}

/// A buffer's position within its origin's stream.
///
/// A logical buffer may be split into several physical chunks. Chunks of one
/// sequence number are numbered from 1 and the final one sets `last_chunk`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SequenceData {
    /// Sequence number of the logical buffer (starts at 1)
    pub sequence_number: SequenceNumber,
    /// Chunk number within the logical buffer (starts at 1)
    pub chunk_number: ChunkNumber,
    /// Whether this is the final chunk of the logical buffer
    pub last_chunk: bool,
}

impl SequenceData {
    /// The chunk number of an unchunked buffer.
    pub const INITIAL_CHUNK_NUMBER: ChunkNumber = 1;

    /// Creates sequence data for a specific chunk.
    #[must_use]
    pub const fn new(
        sequence_number: SequenceNumber,
        chunk_number: ChunkNumber,
        last_chunk: bool,
    ) -> Self {
        Self {
            sequence_number,
            chunk_number,
            last_chunk,
        }
    }

    /// Creates sequence data for an unchunked buffer.
    #[must_use]
    pub const fn single(sequence_number: SequenceNumber) -> Self {
        Self::new(sequence_number, Self::INITIAL_CHUNK_NUMBER, true)
    }

    /// Creates the sequence data stamped on an emitted window result.
    ///
    /// Emitted results are never chunked and carry chunk number 0, which
    /// watermark tracking reads the same as [`Self::INITIAL_CHUNK_NUMBER`].
    #[must_use]
    pub const fn emitted(sequence_number: SequenceNumber) -> Self {
        Self::new(sequence_number, 0, true)
    }
}

/// Metadata carried by every buffer at build and probe time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BufferMetaData {
    /// Watermark timestamp the producer attached to the buffer
    pub watermark_ts: Timestamp,
    /// Position of the buffer within its origin
    pub sequence: SequenceData,
    /// The producing origin
    pub origin: OriginId,
}

impl BufferMetaData {
    /// Creates buffer metadata.
    #[must_use]
    pub const fn new(watermark_ts: Timestamp, sequence: SequenceData, origin: OriginId) -> Self {
        Self {
            watermark_ts,
            sequence,
            origin,
        }
    }

    /// Shorthand for an unchunked buffer.
    #[must_use]
    pub const fn single(
        origin: OriginId,
        sequence_number: SequenceNumber,
        watermark_ts: Timestamp,
    ) -> Self {
        Self::new(watermark_ts, SequenceData::single(sequence_number), origin)
    }

    /// Returns the attached watermark.
    #[must_use]
    pub const fn watermark(&self) -> Watermark {
        Watermark::new(self.watermark_ts)
    }
}
