//! # Time Module
//!
//! Event time, buffer sequencing and watermark tracking.
//!
//! ## Concepts
//!
//! - **Event Time**: Timestamp carried by a record, monotonic within an origin
//!   but not across origins
//! - **Watermark**: Assertion that no records with timestamp < watermark will arrive
//! - **Origin**: An upstream producer whose buffers carry their own sequence numbers
//! - **Chunk**: A physical part of one logical buffer, reassembled by counting
//!   chunks until the last one arrives
//!
//! ## Multi-Origin Watermark Tracking
//!
//! Every buffer carries [`BufferMetaData`]. The [`MultiOriginWatermarkProcessor`]
//! only lets an origin's watermark advance over contiguously delivered
//! sequence numbers, and the global watermark is the minimum over all origins:
//!
//! ```rust
//! use strata_core::time::{BufferMetaData, MultiOriginWatermarkProcessor, OriginId, Watermark};
//!
//! let a = OriginId::new(1);
//! let b = OriginId::new(2);
//! let processor = MultiOriginWatermarkProcessor::new(&[a, b], 64).unwrap();
//!
//! processor.update_watermark(&BufferMetaData::single(a, 1, 100)).unwrap();
//! // Origin b has not reported yet, so the global watermark stalls
//! assert_eq!(processor.current_watermark(), Watermark::MIN);
//!
//! processor.update_watermark(&BufferMetaData::single(b, 1, 40)).unwrap();
//! assert_eq!(processor.current_watermark(), Watermark::new(40));
//! ```

mod multi_origin;
mod origin;
mod sequence;

pub use multi_origin::{
    Admission, MultiOriginWatermarkProcessor, OriginWatermarkSnapshot, WatermarkError, WatermarkMetrics,
    WatermarkMetricsSnapshot, WatermarkSnapshot,
};
pub use origin::{OriginProgress, PendingSequence, UpdateOutcome};
pub use sequence::{BufferMetaData, ChunkNumber, OriginId, SequenceData, SequenceNumber};

use rkyv::{Archive, Deserialize as RkyvDeserialize, Serialize as RkyvSerialize};

/// Event time in the unit chosen by the caller (milliseconds in practice).
pub type Timestamp = u64;

/// A watermark indicating event time progress.
///
/// Watermarks are monotonically increasing assertions that no records with
/// timestamps earlier than the watermark will arrive. They are used to:
///
/// - Trigger windows whose end is covered
/// - Detect late records
/// - Decide which slices can be reclaimed
///
/// # Example
///
/// ```rust
/// use strata_core::time::Watermark;
///
/// let watermark = Watermark::new(1000);
///
/// assert!(watermark.is_late(999));
/// assert!(!watermark.is_late(1000));
/// assert!(!watermark.is_late(1001));
/// ```
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Default,
    Archive,
    RkyvSerialize,
    RkyvDeserialize,
    serde::Serialize,
    serde::Deserialize,
)]
pub struct Watermark(pub Timestamp);

impl Watermark {
    /// The initial watermark of an origin that has not reported yet.
    pub const MIN: Self = Self(0);

    /// Creates a new watermark with the given timestamp.
    #[inline]
    #[must_use]
    pub const fn new(timestamp: Timestamp) -> Self {
        Self(timestamp)
    }

    /// Returns the watermark timestamp.
    #[inline]
    #[must_use]
    pub const fn timestamp(&self) -> Timestamp {
        self.0
    }

    /// Checks if a record is late relative to this watermark.
    ///
    /// A record is late if its timestamp is strictly less than the watermark.
    #[inline]
    #[must_use]
    pub const fn is_late(&self, event_time: Timestamp) -> bool {
        event_time < self.0
    }

    /// Returns the watermark moved back by `lateness`, saturating at zero.
    #[inline]
    #[must_use]
    pub const fn minus(self, lateness: Timestamp) -> Self {
        Self(self.0.saturating_sub(lateness))
    }

    /// Returns the minimum (earlier) of two watermarks.
    #[must_use]
    pub fn min(self, other: Self) -> Self {
        Self(self.0.min(other.0))
    }

    /// Returns the maximum (later) of two watermarks.
    #[must_use]
    pub fn max(self, other: Self) -> Self {
        Self(self.0.max(other.0))
    }
}

impl From<Timestamp> for Watermark {
    fn from(timestamp: Timestamp) -> Self {
        Self(timestamp)
    }
}

impl From<Watermark> for Timestamp {
    fn from(watermark: Watermark) -> Self {
        watermark.0
    }
}

impl std::fmt::Display for Watermark {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_watermark_late_detection() {
        let wm = Watermark::new(10);
        assert!(wm.is_late(9));
        assert!(!wm.is_late(10));
    }

    #[test]
    fn test_watermark_minus_saturates() {
        assert_eq!(Watermark::new(25).minus(5), Watermark::new(20));
        assert_eq!(Watermark::new(3).minus(5), Watermark::MIN);
    }

    #[test]
    fn test_watermark_min_max() {
        let a = Watermark::new(4);
        let b = Watermark::new(9);
        assert_eq!(a.min(b), a);
        assert_eq!(a.max(b), b);
        assert_eq!(Watermark::default(), Watermark::MIN);
    }
}
