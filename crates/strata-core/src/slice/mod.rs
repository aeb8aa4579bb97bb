//! # Slice Store
//!
//! Time-based slices and the windows composed from them.
//!
//! ## Concepts
//!
//! - **Slice**: The smallest unit of buffered per-interval state. A tumbling
//!   window is exactly one slice; a sliding window is composed of
//!   `size / gcd(size, slide)` consecutive slices.
//! - **Window**: A logical `[start, end)` interval whose result is the
//!   combination of its slices.
//!
//! ## Components
//!
//! - [`SliceAssigner`]: maps a timestamp to its slice and a slice to its windows
//! - [`Slice`]: one interval's partial state, sharded per worker until merged
//! - [`SliceMergeStaging`]: fan-in barrier that merges the worker shards once
//! - [`PerWorkerSliceBuffer`]: a worker's private view of the slices it fills
//! - [`WindowSliceStore`]: the shared map from windows to slices that owns
//!   creation, triggering and garbage collection
//!
//! ## Slice Lifecycle
//!
//! ```text
//! created ──► building (worker shards) ──► sealed ──► merged ──► reclaimed
//!   │              │                         │           │
//!   get_slices_    insert by owning       trigger or   GC once no
//!   or_create      worker only            last flush   window needs it
//! ```

mod assigner;
mod staging;
mod store;
mod worker;

pub use assigner::{SliceAssigner, WindowInfoVec};
pub use staging::{Contribution, InsertOutcome, MergeStatus, SliceMergeStaging};
pub use store::{
    GcSummary, SliceCheckpoint, SliceLookup, StoreCheckpoint, StoreMetrics, StoreMetricsSnapshot,
    TriggeredWindows, WindowCheckpoint, WindowSliceStore,
};
pub use worker::{FlushSummary, PerWorkerSliceBuffer};

use std::cmp::Ordering;
use std::sync::Arc;

use parking_lot::Mutex;
use rkyv::{Archive, Deserialize as RkyvDeserialize, Serialize as RkyvSerialize};

use crate::memory::{AllocError, BufferHandle};
use crate::payload::{Payload, PayloadError};
use crate::time::Timestamp;

/// Index of a worker thread within the pipeline's fixed pool.
pub type WorkerId = usize;

/// Start of a slice's interval (inclusive).
pub type SliceStart = Timestamp;

/// End of a slice's interval (exclusive); also identifies the slice.
pub type SliceEnd = Timestamp;

/// Shared reference to a slice.
pub type SliceRef<P> = Arc<Slice<P>>;

/// Errors that can occur in slice store operations.
#[derive(Debug, Clone, thiserror::Error)]
pub enum SliceError {
    /// Invalid window parameters
    #[error("Invalid window: {0}")]
    InvalidWindow(String),

    /// Timestamp too close to `u64::MAX` for its windows to be represented
    #[error("Timestamp {ts} out of range (max: {max})")]
    TimestampOutOfRange {
        /// Offending timestamp
        ts: Timestamp,
        /// Largest timestamp the assigner supports
        max: Timestamp,
    },

    /// The store was torn down by `delete_state`
    #[error("Slice store already deleted")]
    StoreDeleted,

    /// A window was asked to trigger twice
    #[error("Window {0} already triggered")]
    AlreadyTriggered(WindowInfo),

    /// Worker index outside the configured pool
    #[error("Unknown worker {worker} (pool has {workers})")]
    UnknownWorker {
        /// Offending worker index
        worker: WorkerId,
        /// Configured number of workers
        workers: usize,
    },

    /// The caller's payload operation failed
    #[error("Payload error: {0}")]
    Payload(#[from] PayloadError),

    /// The buffer provider refused storage for a new slice
    #[error("Allocation error: {0}")]
    Alloc(#[from] AllocError),
}

/// Identifies a logical window.
///
/// Windows order by end, then start, so iteration visits them in trigger order.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Archive,
    RkyvSerialize,
    RkyvDeserialize,
    serde::Serialize,
)]
pub struct WindowInfo {
    /// Window start (inclusive)
    pub window_start: Timestamp,
    /// Window end (exclusive)
    pub window_end: Timestamp,
}

impl WindowInfo {
    /// Creates a window identifier.
    #[must_use]
    pub const fn new(window_start: Timestamp, window_end: Timestamp) -> Self {
        Self {
            window_start,
            window_end,
        }
    }

    /// Returns true if the slice `[start, end)` lies inside this window.
    #[must_use]
    pub fn contains_slice(&self, start: SliceStart, end: SliceEnd) -> bool {
        self.window_start <= start && end <= self.window_end
    }
}

impl Ord for WindowInfo {
    fn cmp(&self, other: &Self) -> Ordering {
        self.window_end
            .cmp(&other.window_end)
            .then(self.window_start.cmp(&other.window_start))
    }
}

impl PartialOrd for WindowInfo {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl std::fmt::Display for WindowInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}, {})", self.window_start, self.window_end)
    }
}

/// Trigger state of a window. Moves `Building -> Triggered` exactly once.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Archive, RkyvSerialize, RkyvDeserialize)]
pub enum WindowInfoState {
    /// Slices may still receive records
    Building,
    /// The window was emitted; its slices are immutable
    Triggered,
}

/// The slices composing a window plus its trigger state.
#[derive(Debug)]
pub struct SlicesAndState<P: Payload> {
    /// Slices in ascending end order
    pub slices: Vec<SliceRef<P>>,
    /// Trigger state
    pub state: WindowInfoState,
}

impl<P: Payload> SlicesAndState<P> {
    fn new() -> Self {
        Self {
            slices: Vec::new(),
            state: WindowInfoState::Building,
        }
    }

    /// Flips the window to `Triggered`.
    fn trigger(&mut self, info: WindowInfo) -> Result<(), SliceError> {
        if self.state == WindowInfoState::Triggered {
            return Err(SliceError::AlreadyTriggered(info));
        }
        self.state = WindowInfoState::Triggered;
        Ok(())
    }
}

/// A triggered window together with its assigned sequence number.
///
/// Orders by sequence number, which follows window end order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize)]
pub struct WindowInfoAndSequenceNumber {
    /// The window
    pub window: WindowInfo,
    /// Sequence number assigned at trigger time (starts at 1)
    pub sequence: u64,
}

impl Ord for WindowInfoAndSequenceNumber {
    fn cmp(&self, other: &Self) -> Ordering {
        self.sequence
            .cmp(&other.sequence)
            .then(self.window.cmp(&other.window))
    }
}

impl PartialOrd for WindowInfoAndSequenceNumber {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// One interval's partial state.
///
/// Until the slice is merged, every worker fills its own shard, so workers
/// never contend on the same lock. Merging seals the slice, combines the
/// shards exactly once and publishes the canonical payload.
#[derive(Debug)]
pub struct Slice<P: Payload> {
    start: SliceStart,
    end: SliceEnd,
    buffer: Mutex<Option<BufferHandle>>,
    staging: SliceMergeStaging<P>,
}

impl<P: Payload> Slice<P> {
    /// Creates an empty slice with one shard per worker.
    #[must_use]
    pub fn new(
        start: SliceStart,
        end: SliceEnd,
        workers: usize,
        buffer: Option<BufferHandle>,
    ) -> Self {
        debug_assert!(start < end);
        Self {
            start,
            end,
            buffer: Mutex::new(buffer),
            staging: SliceMergeStaging::new(workers),
        }
    }

    /// Creates a slice whose merged payload is already known.
    #[must_use]
    pub fn with_merged(
        start: SliceStart,
        end: SliceEnd,
        workers: usize,
        buffer: Option<BufferHandle>,
        payload: P,
    ) -> Self {
        Self {
            start,
            end,
            buffer: Mutex::new(buffer),
            staging: SliceMergeStaging::published(workers, payload),
        }
    }

    /// Creates a slice whose first shard already holds `payload` and which
    /// still accepts records.
    #[must_use]
    pub fn with_partial(
        start: SliceStart,
        end: SliceEnd,
        workers: usize,
        buffer: Option<BufferHandle>,
        payload: P,
    ) -> Self {
        Self {
            start,
            end,
            buffer: Mutex::new(buffer),
            staging: SliceMergeStaging::prefilled(workers, payload),
        }
    }

    /// Bytes requested from the buffer provider for one slice.
    ///
    /// This is the footprint of an empty payload; what a payload grows to
    /// while records arrive stays on the heap and is not reserved.
    #[must_use]
    pub fn storage_size() -> usize {
        P::default().size_hint().max(1)
    }

    /// Returns the slice start.
    #[must_use]
    pub fn start(&self) -> SliceStart {
        self.start
    }

    /// Returns the slice end, which is also its identifier.
    #[must_use]
    pub fn end(&self) -> SliceEnd {
        self.end
    }

    /// Returns true if `ts` falls into this slice.
    #[must_use]
    pub fn contains(&self, ts: Timestamp) -> bool {
        self.start <= ts && ts < self.end
    }

    /// Returns the merge staging area.
    #[must_use]
    pub fn staging(&self) -> &SliceMergeStaging<P> {
        &self.staging
    }

    /// Inserts a record into `worker`'s shard.
    ///
    /// # Errors
    ///
    /// Returns [`SliceError::UnknownWorker`] for a worker outside the pool or
    /// [`SliceError::Payload`] if the payload rejects the record.
    pub fn insert(
        &self,
        worker: WorkerId,
        record: P::Record,
    ) -> Result<InsertOutcome<P::Record>, SliceError> {
        self.staging.insert(worker, record)
    }

    /// Hands `worker`'s shard to the merge stage.
    ///
    /// # Errors
    ///
    /// See [`SliceMergeStaging::contribute`].
    pub fn contribute(&self, worker: WorkerId) -> Result<Contribution, SliceError> {
        self.staging.contribute(worker)
    }

    /// Returns the merged payload, merging all shards now if needed.
    ///
    /// # Errors
    ///
    /// Returns [`SliceError::Payload`] if combining the shards fails.
    pub fn ensure_merged(&self) -> Result<Arc<P>, SliceError> {
        self.staging.ensure_merged()
    }

    /// Returns the merged payload if it was already published.
    #[must_use]
    pub fn merged(&self) -> Option<Arc<P>> {
        self.staging.merged()
    }

    /// Returns true once the slice stopped accepting records.
    #[must_use]
    pub fn is_sealed(&self) -> bool {
        self.staging.is_sealed()
    }

    /// Stops accepting records. Called when a window containing it triggers.
    pub fn seal(&self) {
        self.staging.seal();
    }

    /// Returns the combined payload without sealing the slice.
    ///
    /// # Errors
    ///
    /// Returns [`SliceError::Payload`] if combining fails.
    pub fn peek(&self) -> Result<P, SliceError> {
        self.staging.peek()
    }

    /// Removes the storage handle so it can be released.
    pub(crate) fn take_buffer(&self) -> Option<BufferHandle> {
        self.buffer.lock().take()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::payload::CountPayload;
    #[test]
    fn test_window_info_orders_by_end() {
        let a = WindowInfo::new(5, 15);
        let b = WindowInfo::new(0, 10);
        let c = WindowInfo::new(10, 20);
        let mut windows = vec![c, a, b];
        windows.sort();
        assert_eq!(windows, vec![b, a, c]);
        assert_eq!(b.to_string(), "[0, 10)");
    }

    #[test]
    fn test_window_contains_slice() {
        let w = WindowInfo::new(0, 10);
        assert!(w.contains_slice(5, 10));
        assert!(!w.contains_slice(5, 15));
    }

    #[test]
    fn test_sequence_order() {
        let first = WindowInfoAndSequenceNumber {
            window: WindowInfo::new(10, 20),
            sequence: 1,
        };
        let second = WindowInfoAndSequenceNumber {
            window: WindowInfo::new(0, 10),
            sequence: 2,
        };
        assert!(first < second);
    }

    #[test]
    fn test_trigger_once() {
        let info = WindowInfo::new(0, 10);
        let mut s = SlicesAndState::<CountPayload>::new();
        s.trigger(info).unwrap();
        assert!(matches!(
            s.trigger(info),
            Err(SliceError::AlreadyTriggered(w)) if w == info
        ));
    }

    #[test]
    fn test_slice_insert_and_merge() {
        let slice = Slice::<CountPayload>::new(0, 10, 2, None);
        assert!(slice.contains(9));
        assert!(!slice.contains(10));
        slice.insert(0, ()).unwrap();
        slice.insert(1, ()).unwrap();
        slice.insert(1, ()).unwrap();
        assert_eq!(slice.peek().unwrap().emit(), 3);
        assert!(slice.merged().is_none());
        assert_eq!(slice.ensure_merged().unwrap().emit(), 3);
        assert!(slice.merged().is_some());
    }

    #[test]
    fn test_take_buffer_once() {
        let slice = Slice::<CountPayload>::new(0, 10, 1, Some(BufferHandle::new(1, 64)));
        assert!(slice.take_buffer().is_some());
        assert!(slice.take_buffer().is_none());
    }
}
