//! Maps event time to slice boundaries and slices to the windows containing them.

use smallvec::SmallVec;

use super::{SliceError, WindowInfo};
use crate::time::Timestamp;

/// Collection type for the windows a slice belongs to.
///
/// Size 4 covers `size / slide <= 4` without a heap allocation.
pub type WindowInfoVec = SmallVec<[WindowInfo; 4]>;

/// Computes the greatest common divisor of two non-zero values.
fn gcd(mut a: u64, mut b: u64) -> u64 {
    while b != 0 {
        let t = a % b;
        a = b;
        b = t;
    }
    a
}

/// Assigns timestamps to epoch-aligned slices.
///
/// Windows of `size` start at every multiple of `slide`. Slices are the
/// coarsest intervals that never straddle a window boundary: for tumbling
/// windows a slice is the window itself, for sliding windows the slice length
/// is `gcd(size, slide)`.
///
/// Timestamps up to [`max_timestamp`](Self::max_timestamp) are supported, so
/// that every window containing one ends at or before `u64::MAX`. The
/// boundary methods assume their argument is in range; callers check with
/// [`check_timestamp`](Self::check_timestamp) first.
///
/// # Example
///
/// ```rust
/// use strata_core::slice::SliceAssigner;
///
/// let assigner = SliceAssigner::new(10, 5).unwrap();
/// assert_eq!(assigner.slice_len(), 5);
/// assert_eq!(assigner.slice_start_of(7), 5);
/// assert_eq!(assigner.slice_end_of(7), 10);
///
/// // Slice [5,10) is part of windows [0,10) and [5,15)
/// let windows = assigner.windows_containing(5, 10);
/// assert_eq!(windows.len(), 2);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SliceAssigner {
    size: u64,
    slide: u64,
    slice_len: u64,
}

impl SliceAssigner {
    /// Creates an assigner for windows of `size` advancing by `slide`.
    ///
    /// # Errors
    ///
    /// Returns [`SliceError::InvalidWindow`] if either value is zero or
    /// `slide > size`.
    pub fn new(size: u64, slide: u64) -> Result<Self, SliceError> {
        if size == 0 {
            return Err(SliceError::InvalidWindow(
                "window size must be > 0".to_string(),
            ));
        }
        if slide == 0 {
            return Err(SliceError::InvalidWindow(
                "window slide must be > 0".to_string(),
            ));
        }
        if slide > size {
            return Err(SliceError::InvalidWindow(format!(
                "window slide {slide} must not exceed window size {size}"
            )));
        }
        let slice_len = if size == slide { size } else { gcd(size, slide) };
        Ok(Self {
            size,
            slide,
            slice_len,
        })
    }

    /// Creates an assigner for tumbling windows.
    ///
    /// # Errors
    ///
    /// Returns [`SliceError::InvalidWindow`] if `size` is zero.
    pub fn tumbling(size: u64) -> Result<Self, SliceError> {
        Self::new(size, size)
    }

    /// Returns the window size.
    #[must_use]
    pub fn window_size(&self) -> u64 {
        self.size
    }

    /// Returns the window slide.
    #[must_use]
    pub fn window_slide(&self) -> u64 {
        self.slide
    }

    /// Returns the length of every slice.
    #[must_use]
    pub fn slice_len(&self) -> u64 {
        self.slice_len
    }

    /// Returns true for tumbling windows.
    #[must_use]
    pub fn is_tumbling(&self) -> bool {
        self.size == self.slide
    }

    /// Returns the largest supported timestamp.
    #[must_use]
    pub fn max_timestamp(&self) -> Timestamp {
        Timestamp::MAX - self.size
    }

    /// Returns `ts` if it is at most [`Self::max_timestamp`].
    ///
    /// # Errors
    ///
    /// Returns [`SliceError::TimestampOutOfRange`] otherwise.
    pub fn check_timestamp(&self, ts: Timestamp) -> Result<Timestamp, SliceError> {
        let max = self.max_timestamp();
        if ts > max {
            return Err(SliceError::TimestampOutOfRange { ts, max });
        }
        Ok(ts)
    }

    /// Returns the start of the slice owning `ts`.
    #[inline]
    #[must_use]
    pub fn slice_start_of(&self, ts: Timestamp) -> Timestamp {
        ts - ts % self.slice_len
    }

    /// Returns the end (exclusive) of the slice owning `ts`.
    #[inline]
    #[must_use]
    pub fn slice_end_of(&self, ts: Timestamp) -> Timestamp {
        // In range: start + slice_len <= ts + size <= u64::MAX
        self.slice_start_of(ts) + self.slice_len
    }

    /// Returns every window containing the slice `[start, end)`, ordered by end.
    #[must_use]
    pub fn windows_containing(&self, start: Timestamp, end: Timestamp) -> WindowInfoVec {
        let mut windows = WindowInfoVec::new();
        // Window starts are multiples of slide in [end - size, start]
        let lowest = end.saturating_sub(self.size);
        let mut window_start = lowest.div_ceil(self.slide) * self.slide;
        while window_start <= start {
            let Some(window_end) = window_start.checked_add(self.size) else {
                break;
            };
            windows.push(WindowInfo::new(window_start, window_end));
            match window_start.checked_add(self.slide) {
                Some(next) => window_start = next,
                None => break,
            }
        }
        windows
    }

    /// Returns the end of the earliest window containing `ts`.
    ///
    /// A record is late once this window has been triggered.
    #[must_use]
    pub fn first_window_end_containing(&self, ts: Timestamp) -> Timestamp {
        let lowest = self.slice_end_of(ts).saturating_sub(self.size);
        (lowest.div_ceil(self.slide) * self.slide).saturating_add(self.size)
    }
}
