//! Global watermark over many independently progressing origins.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use fxhash::FxHashMap;
use parking_lot::{Mutex, RwLock};
use rkyv::{
    rancor::Error as RkyvError, util::AlignedVec, Archive, Deserialize as RkyvDeserialize,
    Serialize as RkyvSerialize,
};

use super::origin::{OriginProgress, PendingSequence, UpdateOutcome};
use super::{BufferMetaData, OriginId, SequenceNumber, Watermark};

/// Errors that can occur while tracking origin watermarks.
#[derive(Debug, Clone, thiserror::Error)]
pub enum WatermarkError {
    /// Origin not registered
    #[error("Unknown origin: {0}")]
    UnknownOrigin(OriginId),

    /// Too many out-of-order sequence numbers parked for one origin
    #[error("Reorder capacity exceeded for {origin} (limit: {limit})")]
    ReorderCapacityExceeded {
        /// Origin whose pending map is full
        origin: OriginId,
        /// Configured maximum of parked sequence numbers
        limit: usize,
    },

    /// Sequence numbers start at 1
    #[error("Invalid sequence number 0 from {origin}")]
    InvalidSequence {
        /// Offending origin
        origin: OriginId,
    },

    /// Chunk inconsistent with the chunks already seen for its sequence number
    #[error("Invalid chunk {chunk} for sequence {sequence} from {origin}")]
    InvalidChunk {
        /// Offending origin
        origin: OriginId,
        /// Sequence number the chunk belongs to
        sequence: SequenceNumber,
        /// Offending chunk number
        chunk: u64,
    },

    /// Invalid processor configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Snapshot could not be encoded or decoded
    #[error("Snapshot serialization failed: {0}")]
    Serialization(String),
}

/// Metrics for multi-origin watermark tracking.
#[derive(Debug, Default)]
pub struct WatermarkMetrics {
    updates: AtomicU64,
    duplicates_ignored: AtomicU64,
    held_out_of_order: AtomicU64,
    global_advances: AtomicU64,
}

impl WatermarkMetrics {
    /// Returns total buffers fed into the processor.
    #[must_use]
    pub fn updates(&self) -> u64 {
        self.updates.load(Ordering::Relaxed)
    }

    /// Returns buffers ignored as already delivered.
    #[must_use]
    pub fn duplicates_ignored(&self) -> u64 {
        self.duplicates_ignored.load(Ordering::Relaxed)
    }

    /// Returns buffers parked behind a gap or an incomplete chunk set.
    #[must_use]
    pub fn held_out_of_order(&self) -> u64 {
        self.held_out_of_order.load(Ordering::Relaxed)
    }

    /// Returns how many times the global watermark moved forward.
    #[must_use]
    pub fn global_advances(&self) -> u64 {
        self.global_advances.load(Ordering::Relaxed)
    }

    /// Returns a snapshot of all metrics.
    #[must_use]
    pub fn snapshot(&self) -> WatermarkMetricsSnapshot {
        WatermarkMetricsSnapshot {
            updates: self.updates(),
            duplicates_ignored: self.duplicates_ignored(),
            held_out_of_order: self.held_out_of_order(),
            global_advances: self.global_advances(),
        }
    }
}

/// Snapshot of watermark metrics for reporting.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct WatermarkMetricsSnapshot {
    /// Total buffers fed into the processor.
    pub updates: u64,
    /// Buffers ignored as already delivered.
    pub duplicates_ignored: u64,
    /// Buffers parked behind a gap.
    pub held_out_of_order: u64,
    /// Global watermark advances.
    pub global_advances: u64,
}

/// Captured progress of one origin.
#[derive(Debug, Clone, PartialEq, Eq, Archive, RkyvSerialize, RkyvDeserialize)]
pub struct OriginWatermarkSnapshot {
    /// The origin
    pub origin: OriginId,
    /// Highest contiguously delivered sequence number
    pub contiguous_sequence: SequenceNumber,
    /// Watermark of the contiguous prefix
    pub watermark: Watermark,
    /// Parked out-of-order sequence numbers
    pub pending: Vec<PendingSequence>,
}

/// Captured state of a [`MultiOriginWatermarkProcessor`], used for migration
/// and checkpoints.
#[derive(Debug, Clone, PartialEq, Eq, Archive, RkyvSerialize, RkyvDeserialize)]
pub struct WatermarkSnapshot {
    /// Per-origin progress, sorted by origin
    pub origins: Vec<OriginWatermarkSnapshot>,
    /// Global watermark at capture time
    pub global: Watermark,
    /// Reorder bound per origin
    pub max_pending: u64,
}

impl WatermarkSnapshot {
    /// Serializes the snapshot with rkyv.
    ///
    /// # Errors
    ///
    /// Returns [`WatermarkError::Serialization`] if encoding fails.
    pub fn to_bytes(&self) -> Result<Vec<u8>, WatermarkError> {
        rkyv::to_bytes::<RkyvError>(self)
            .map(|v| v.to_vec())
            .map_err(|e| WatermarkError::Serialization(e.to_string()))
    }

    /// Deserializes a snapshot produced by [`Self::to_bytes`].
    ///
    /// # Errors
    ///
    /// Returns [`WatermarkError::Serialization`] if the bytes are not a valid snapshot.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, WatermarkError> {
        let mut aligned = AlignedVec::<16>::with_capacity(bytes.len());
        aligned.extend_from_slice(bytes);
        let archived = rkyv::access::<rkyv::Archived<Self>, RkyvError>(&aligned)
            .map_err(|e| WatermarkError::Serialization(e.to_string()))?;
        rkyv::deserialize::<Self, RkyvError>(archived)
            .map_err(|e| WatermarkError::Serialization(e.to_string()))
    }
}

/// One registered origin: its reassembly state plus the published watermark.
#[derive(Debug)]
struct OriginTracker {
    progress: Mutex<OriginProgress>,
    watermark: AtomicU64,
}

impl OriginTracker {
    fn new(progress: OriginProgress) -> Self {
        let watermark = AtomicU64::new(progress.watermark().timestamp());
        Self {
            progress: Mutex::new(progress),
            watermark,
        }
    }

    fn watermark(&self) -> Watermark {
        Watermark::new(self.watermark.load(Ordering::Acquire))
    }
}

/// A buffer admitted by [`MultiOriginWatermarkProcessor::admit`].
///
/// Dropping it without [`commit`](Self::commit) gives the reorder slot back
/// and the buffer can be delivered again.
#[derive(Debug)]
#[must_use = "an admission is released when dropped"]
pub struct Admission<'a> {
    processor: &'a MultiOriginWatermarkProcessor,
    tracker: Arc<OriginTracker>,
    meta: BufferMetaData,
    committed: bool,
}

impl Admission<'_> {
    /// Records the admitted buffer and returns what it did to its origin.
    ///
    /// # Errors
    ///
    /// See [`MultiOriginWatermarkProcessor::record`].
    pub fn commit(mut self) -> Result<UpdateOutcome, WatermarkError> {
        self.committed = true;
        self.processor
            .apply(&self.tracker, &self.meta, OriginProgress::commit)
    }
}

impl Drop for Admission<'_> {
    fn drop(&mut self) {
        if !self.committed {
            self.tracker.progress.lock().release(&self.meta);
        }
    }
}

/// Computes a safe global watermark from many origins.
///
/// Each origin is tracked independently behind its own lock, so updates for
/// different origins never contend. An origin's watermark only advances over
/// contiguously delivered sequence numbers (see [`OriginProgress`]). The
/// global watermark is the minimum over all registered origins and never
/// decreases, even when origins are added or removed.
///
/// # Thread Safety
///
/// All methods take `&self`. Registration takes a short write lock on the
/// origin table; updates take its read lock plus the origin's own lock.
///
/// # Example
///
/// ```rust
/// use strata_core::time::{BufferMetaData, MultiOriginWatermarkProcessor, OriginId, Watermark};
///
/// let origin = OriginId::new(0);
/// let processor = MultiOriginWatermarkProcessor::new(&[origin], 16).unwrap();
///
/// // Sequence 2 arrives first and is held back
/// processor.update_watermark(&BufferMetaData::single(origin, 2, 20)).unwrap();
/// assert_eq!(processor.current_watermark(), Watermark::MIN);
///
/// processor.update_watermark(&BufferMetaData::single(origin, 1, 10)).unwrap();
/// assert_eq!(processor.current_watermark(), Watermark::new(20));
/// ```
#[derive(Debug)]
pub struct MultiOriginWatermarkProcessor {
    origins: RwLock<FxHashMap<OriginId, Arc<OriginTracker>>>,
    global: AtomicU64,
    max_pending: usize,
    metrics: WatermarkMetrics,
}

impl MultiOriginWatermarkProcessor {
    /// Creates a processor tracking the given origins.
    ///
    /// `max_pending` bounds how many out-of-order sequence numbers are parked
    /// per origin.
    ///
    /// # Errors
    ///
    /// Returns [`WatermarkError::InvalidConfig`] if `max_pending` is zero.
    pub fn new(origins: &[OriginId], max_pending: usize) -> Result<Self, WatermarkError> {
        if max_pending == 0 {
            return Err(WatermarkError::InvalidConfig(
                "max_pending must be > 0".to_string(),
            ));
        }
        let table = origins
            .iter()
            .map(|&origin| {
                (
                    origin,
                    Arc::new(OriginTracker::new(OriginProgress::new(origin, max_pending))),
                )
            })
            .collect();
        Ok(Self {
            origins: RwLock::new(table),
            global: AtomicU64::new(Watermark::MIN.timestamp()),
            max_pending,
            metrics: WatermarkMetrics::default(),
        })
    }

    /// Registers an origin. Returns `false` if it was already registered.
    ///
    /// A new origin starts at the minimum watermark and holds the global
    /// watermark where it is until it catches up.
    pub fn add_origin(&self, origin: OriginId) -> bool {
        let mut origins = self.origins.write();
        if origins.contains_key(&origin) {
            return false;
        }
        origins.insert(
            origin,
            Arc::new(OriginTracker::new(OriginProgress::new(
                origin,
                self.max_pending,
            ))),
        );
        tracing::debug!(%origin, "origin registered");
        true
    }

    /// Removes an origin. Returns `false` if it was not registered.
    ///
    /// Removing a lagging origin may advance the global watermark.
    pub fn remove_origin(&self, origin: OriginId) -> bool {
        let removed = self.origins.write().remove(&origin).is_some();
        if removed {
            tracing::debug!(%origin, "origin removed");
            self.recompute_global();
        }
        removed
    }

    /// Records a buffer for its origin and returns the global watermark after
    /// the update.
    ///
    /// Replaying an already delivered buffer changes nothing.
    ///
    /// # Errors
    ///
    /// Returns [`WatermarkError::UnknownOrigin`] if the buffer's origin is not
    /// registered, or any error of [`OriginProgress::update`].
    pub fn update_watermark(&self, meta: &BufferMetaData) -> Result<Watermark, WatermarkError> {
        self.record(meta)?;
        Ok(self.current_watermark())
    }

    /// Records a buffer for its origin and reports what it did to the
    /// origin's progress.
    ///
    /// Callers that must not apply a replayed buffer's records twice check
    /// for [`UpdateOutcome::Duplicate`].
    ///
    /// # Errors
    ///
    /// See [`Self::update_watermark`].
    pub fn record(&self, meta: &BufferMetaData) -> Result<UpdateOutcome, WatermarkError> {
        let tracker = self.tracker(meta.origin)?;
        self.apply(&tracker, meta, OriginProgress::update)
    }

    /// Admits a buffer whose records are applied before it is recorded.
    ///
    /// Returns `None` for a replay: the buffer was already recorded or
    /// another worker is applying it right now. Otherwise every check of
    /// [`Self::record`] has passed and the returned [`Admission`] holds the
    /// buffer's reorder slot until it is committed or dropped.
    ///
    /// # Errors
    ///
    /// See [`Self::update_watermark`]. Nothing changes on error.
    pub fn admit(&self, meta: &BufferMetaData) -> Result<Option<Admission<'_>>, WatermarkError> {
        let tracker = self.tracker(meta.origin)?;
        let admitted = tracker.progress.lock().admit(meta)?;
        if !admitted {
            self.metrics
                .duplicates_ignored
                .fetch_add(1, Ordering::Relaxed);
            return Ok(None);
        }
        Ok(Some(Admission {
            processor: self,
            tracker,
            meta: *meta,
            committed: false,
        }))
    }

    fn tracker(&self, origin: OriginId) -> Result<Arc<OriginTracker>, WatermarkError> {
        self.origins
            .read()
            .get(&origin)
            .cloned()
            .ok_or(WatermarkError::UnknownOrigin(origin))
    }

    fn apply(
        &self,
        tracker: &OriginTracker,
        meta: &BufferMetaData,
        op: impl FnOnce(&mut OriginProgress, &BufferMetaData) -> Result<UpdateOutcome, WatermarkError>,
    ) -> Result<UpdateOutcome, WatermarkError> {
        self.metrics.updates.fetch_add(1, Ordering::Relaxed);
        let outcome = {
            let mut progress = tracker.progress.lock();
            let outcome = op(&mut progress, meta)?;
            if let UpdateOutcome::Advanced(wm) = outcome {
                tracker.watermark.fetch_max(wm.timestamp(), Ordering::AcqRel);
            }
            outcome
        };

        match outcome {
            UpdateOutcome::Advanced(wm) => {
                tracing::trace!(origin = %meta.origin, watermark = %wm, "origin watermark advanced");
                self.recompute_global();
            }
            UpdateOutcome::Held => {
                self.metrics.held_out_of_order.fetch_add(1, Ordering::Relaxed);
            }
            UpdateOutcome::Duplicate => {
                self.metrics
                    .duplicates_ignored
                    .fetch_add(1, Ordering::Relaxed);
            }
        }
        Ok(outcome)
    }

    /// Returns true if the buffer was already recorded for its origin.
    ///
    /// # Errors
    ///
    /// Returns [`WatermarkError::UnknownOrigin`] if the origin is not registered.
    pub fn is_duplicate(&self, meta: &BufferMetaData) -> Result<bool, WatermarkError> {
        let origins = self.origins.read();
        let tracker = origins
            .get(&meta.origin)
            .ok_or(WatermarkError::UnknownOrigin(meta.origin))?;
        let seen = tracker.progress.lock().has_seen(&meta.sequence);
        Ok(seen)
    }

    /// Returns the global watermark: the minimum over all origins.
    #[must_use]
    pub fn current_watermark(&self) -> Watermark {
        Watermark::new(self.global.load(Ordering::Acquire))
    }

    /// Returns the contiguous watermark of one origin.
    #[must_use]
    pub fn origin_watermark(&self, origin: OriginId) -> Option<Watermark> {
        self.origins.read().get(&origin).map(|t| t.watermark())
    }

    /// Returns the registered origins, sorted.
    #[must_use]
    pub fn origins(&self) -> Vec<OriginId> {
        let mut origins: Vec<_> = self.origins.read().keys().copied().collect();
        origins.sort_unstable();
        origins
    }

    /// Returns the processor metrics.
    #[must_use]
    pub fn metrics(&self) -> &WatermarkMetrics {
        &self.metrics
    }

    fn recompute_global(&self) {
        let min = {
            let origins = self.origins.read();
            origins.values().map(|t| t.watermark()).min()
        };
        let Some(min) = min else {
            return;
        };
        let previous = self.global.fetch_max(min.timestamp(), Ordering::AcqRel);
        if previous < min.timestamp() {
            self.metrics.global_advances.fetch_add(1, Ordering::Relaxed);
            tracing::trace!(watermark = %min, "global watermark advanced");
        }
    }

    /// Captures the state of every origin.
    #[must_use]
    pub fn snapshot(&self) -> WatermarkSnapshot {
        let origins = self.origins.read();
        let mut captured: Vec<_> = origins
            .iter()
            .map(|(&origin, tracker)| {
                let progress = tracker.progress.lock();
                OriginWatermarkSnapshot {
                    origin,
                    contiguous_sequence: progress.contiguous_sequence(),
                    watermark: progress.watermark(),
                    pending: progress.pending_snapshot(),
                }
            })
            .collect();
        captured.sort_unstable_by_key(|o| o.origin);
        WatermarkSnapshot {
            origins: captured,
            global: self.current_watermark(),
            max_pending: self.max_pending as u64,
        }
    }

    /// Rebuilds a processor from a snapshot.
    ///
    /// # Errors
    ///
    /// Returns [`WatermarkError::InvalidConfig`] if the snapshot's reorder
    /// bound is zero or does not fit the platform.
    pub fn restore(snapshot: WatermarkSnapshot) -> Result<Self, WatermarkError> {
        let max_pending = usize::try_from(snapshot.max_pending)
            .ok()
            .filter(|&m| m > 0)
            .ok_or_else(|| {
                WatermarkError::InvalidConfig(format!(
                    "invalid max_pending in snapshot: {}",
                    snapshot.max_pending
                ))
            })?;
        let table = snapshot
            .origins
            .into_iter()
            .map(|o| {
                let progress = OriginProgress::from_parts(
                    o.origin,
                    max_pending,
                    o.contiguous_sequence,
                    o.watermark,
                    o.pending,
                );
                (o.origin, Arc::new(OriginTracker::new(progress)))
            })
            .collect();
        Ok(Self {
            origins: RwLock::new(table),
            global: AtomicU64::new(snapshot.global.timestamp()),
            max_pending,
            metrics: WatermarkMetrics::default(),
        })
    }
}
