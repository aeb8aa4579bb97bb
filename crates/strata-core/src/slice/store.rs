//! The shared map from windows to slices.
//!
//! ## Locking
//!
//! One reader/writer lock protects the `slices` map, the `windows` map, the
//! sequence counter and the active-origin count. Lookups of existing slices
//! take the read lock, so workers building different slices proceed in
//! parallel. Creation, triggering, garbage collection and deletion take the
//! write lock. Sequence numbers are assigned under the same write lock as the
//! `Building -> Triggered` transition, so they are gap-free and totally
//! ordered across threads.
//!
//! Buffer handles of reclaimed slices are returned to the provider after the
//! lock is released.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use fxhash::FxHashSet;
use parking_lot::RwLock;
use rkyv::{Archive, Deserialize as RkyvDeserialize, Serialize as RkyvSerialize};

use super::{
    Slice, SliceAssigner, SliceEnd, SliceError, SliceRef, SliceStart, SlicesAndState,
    WindowInfo, WindowInfoAndSequenceNumber, WindowInfoState,
};
use crate::memory::BufferProvider;
use crate::payload::{Payload, PayloadCodec};
use crate::time::{Timestamp, Watermark};

/// Windows returned by a trigger pass, in sequence order.
pub type TriggeredWindows<P> = BTreeMap<WindowInfoAndSequenceNumber, Vec<SliceRef<P>>>;

/// Result of [`WindowSliceStore::get_slices_or_create`].
#[derive(Debug)]
pub struct SliceLookup<P: Payload> {
    /// Slices covering the timestamp
    pub slices: Vec<SliceRef<P>>,
    /// True if the earliest window containing the timestamp already triggered.
    /// The slice is returned anyway; what to do with the record is the
    /// caller's decision.
    pub late: bool,
    /// True if this call created the slices
    pub created: bool,
}

/// Counts from one garbage collection pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GcSummary {
    /// Slices removed
    pub slices: usize,
    /// Windows removed
    pub windows: usize,
}

/// Metrics for the slice store.
#[derive(Debug, Default)]
pub struct StoreMetrics {
    slices_created: AtomicU64,
    slices_reclaimed: AtomicU64,
    windows_triggered: AtomicU64,
    windows_reclaimed: AtomicU64,
    late_lookups: AtomicU64,
}

impl StoreMetrics {
    /// Returns total slices created.
    #[must_use]
    pub fn slices_created(&self) -> u64 {
        self.slices_created.load(Ordering::Relaxed)
    }

    /// Returns total slices reclaimed.
    #[must_use]
    pub fn slices_reclaimed(&self) -> u64 {
        self.slices_reclaimed.load(Ordering::Relaxed)
    }

    /// Returns total windows triggered.
    #[must_use]
    pub fn windows_triggered(&self) -> u64 {
        self.windows_triggered.load(Ordering::Relaxed)
    }

    /// Returns total windows reclaimed.
    #[must_use]
    pub fn windows_reclaimed(&self) -> u64 {
        self.windows_reclaimed.load(Ordering::Relaxed)
    }

    /// Returns total lookups flagged late.
    #[must_use]
    pub fn late_lookups(&self) -> u64 {
        self.late_lookups.load(Ordering::Relaxed)
    }

    /// Returns a snapshot of all metrics.
    #[must_use]
    pub fn snapshot(&self) -> StoreMetricsSnapshot {
        StoreMetricsSnapshot {
            slices_created: self.slices_created(),
            slices_reclaimed: self.slices_reclaimed(),
            windows_triggered: self.windows_triggered(),
            windows_reclaimed: self.windows_reclaimed(),
            late_lookups: self.late_lookups(),
        }
    }
}

/// Snapshot of store metrics for reporting.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct StoreMetricsSnapshot {
    /// Slices created.
    pub slices_created: u64,
    /// Slices reclaimed.
    pub slices_reclaimed: u64,
    /// Windows triggered.
    pub windows_triggered: u64,
    /// Windows reclaimed.
    pub windows_reclaimed: u64,
    /// Lookups flagged late.
    pub late_lookups: u64,
}

impl StoreMetricsSnapshot {
    /// Returns slices currently alive (created - reclaimed).
    #[must_use]
    pub fn live_slices(&self) -> u64 {
        self.slices_created.saturating_sub(self.slices_reclaimed)
    }
}

/// One slice as written to a checkpoint.
#[derive(Debug, Clone, PartialEq, Eq, Archive, RkyvSerialize, RkyvDeserialize)]
pub struct SliceCheckpoint {
    /// Slice start
    pub start: SliceStart,
    /// Slice end
    pub end: SliceEnd,
    /// Whether the slice stopped accepting records
    pub sealed: bool,
    /// Encoded payload
    pub payload: Vec<u8>,
}

/// One window as written to a checkpoint.
#[derive(Debug, Clone, PartialEq, Eq, Archive, RkyvSerialize, RkyvDeserialize)]
pub struct WindowCheckpoint {
    /// The window
    pub window: WindowInfo,
    /// Its trigger state
    pub state: WindowInfoState,
}

/// Captured store state.
#[derive(Debug, Clone, PartialEq, Eq, Archive, RkyvSerialize, RkyvDeserialize)]
pub struct StoreCheckpoint {
    /// Next sequence number to assign
    pub next_sequence: u64,
    /// Highest watermark (minus lateness) windows were triggered at
    pub trigger_frontier: Watermark,
    /// Origins that have not signalled completion
    pub active_origins: u64,
    /// Whether the termination flush already ran
    pub flushed: bool,
    /// Live windows in end order
    pub windows: Vec<WindowCheckpoint>,
    /// Live slices in end order
    pub slices: Vec<SliceCheckpoint>,
}

#[derive(Debug)]
struct StoreInner<P: Payload> {
    slices: BTreeMap<SliceEnd, SliceRef<P>>,
    windows: BTreeMap<WindowInfo, SlicesAndState<P>>,
    next_sequence: u64,
    trigger_frontier: Watermark,
    active_origins: usize,
    flushed: bool,
    deleted: bool,
}

impl<P: Payload> StoreInner<P> {
    fn new(active_origins: usize) -> Self {
        Self {
            slices: BTreeMap::new(),
            windows: BTreeMap::new(),
            next_sequence: 1,
            trigger_frontier: Watermark::MIN,
            active_origins,
            flushed: false,
            deleted: false,
        }
    }

    fn find(&self, ts: Timestamp) -> Option<&SliceRef<P>> {
        self.slices
            .range(ts.saturating_add(1)..)
            .next()
            .map(|(_, slice)| slice)
            .filter(|slice| slice.contains(ts))
    }

    /// Adds a slice to the slice map and to every window containing it.
    ///
    /// Windows at or behind the trigger frontier are created already
    /// `Triggered`, so a late slice never causes a window to be emitted twice.
    fn register(&mut self, assigner: &SliceAssigner, slice: SliceRef<P>) {
        let frontier = self.trigger_frontier.timestamp();
        let flushed = self.flushed;
        for info in assigner.windows_containing(slice.start(), slice.end()) {
            let entry = self.windows.entry(info).or_insert_with(|| {
                let mut sas = SlicesAndState::new();
                if flushed || info.window_end <= frontier {
                    sas.state = WindowInfoState::Triggered;
                }
                sas
            });
            let pos = entry.slices.partition_point(|s| s.end() < slice.end());
            if entry.slices.get(pos).map_or(true, |s| s.end() != slice.end()) {
                entry.slices.insert(pos, SliceRef::clone(&slice));
            }
        }
        self.slices.insert(slice.end(), slice);
    }

    /// Triggers every `Building` window accepted by `eligible`, in end order.
    fn trigger_where(
        &mut self,
        mut eligible: impl FnMut(&WindowInfo) -> bool,
    ) -> Result<TriggeredWindows<P>, SliceError> {
        let Self {
            windows,
            next_sequence,
            ..
        } = self;
        let mut triggered = TriggeredWindows::new();
        for (info, sas) in windows.iter_mut() {
            if !eligible(info) {
                break;
            }
            if sas.state != WindowInfoState::Building {
                continue;
            }
            sas.trigger(*info)?;
            for slice in &sas.slices {
                slice.seal();
            }
            let key = WindowInfoAndSequenceNumber {
                window: *info,
                sequence: *next_sequence,
            };
            *next_sequence += 1;
            triggered.insert(key, sas.slices.clone());
        }
        Ok(triggered)
    }
}

/// Single source of truth for which slices exist and which windows are ready.
///
/// # Example
///
/// ```rust
/// use strata_core::payload::{CountPayload, Payload};
/// use strata_core::slice::{Slice, SliceAssigner, WindowSliceStore};
/// use strata_core::time::Watermark;
///
/// let assigner = SliceAssigner::tumbling(10).unwrap();
/// let store = WindowSliceStore::<CountPayload>::new(assigner, 0, 1, 1, None);
/// let lookup = store
///     .get_slices_or_create(3, |start, end| Ok(vec![Slice::new(start, end, 1, None)]))
///     .unwrap();
/// lookup.slices[0].insert(0, ()).unwrap();
///
/// let triggered = store.get_triggerable_window_slices(Watermark::new(10)).unwrap();
/// let (window, slices) = triggered.iter().next().unwrap();
/// assert_eq!(window.sequence, 1);
/// assert_eq!(slices[0].ensure_merged().unwrap().emit(), 1);
/// ```
pub struct WindowSliceStore<P: Payload> {
    assigner: SliceAssigner,
    allowed_lateness: u64,
    number_of_input_origins: usize,
    workers: usize,
    provider: Option<Arc<dyn BufferProvider>>,
    inner: RwLock<StoreInner<P>>,
    metrics: StoreMetrics,
}

impl<P: Payload> std::fmt::Debug for WindowSliceStore<P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.read();
        f.debug_struct("WindowSliceStore")
            .field("assigner", &self.assigner)
            .field("allowed_lateness", &self.allowed_lateness)
            .field("slices", &inner.slices.len())
            .field("windows", &inner.windows.len())
            .field("next_sequence", &inner.next_sequence)
            .finish_non_exhaustive()
    }
}

impl<P: Payload> WindowSliceStore<P> {
    /// Creates an empty store.
    ///
    /// `provider` receives the buffer handles of reclaimed slices.
    #[must_use]
    pub fn new(
        assigner: SliceAssigner,
        allowed_lateness: u64,
        number_of_input_origins: usize,
        workers: usize,
        provider: Option<Arc<dyn BufferProvider>>,
    ) -> Self {
        Self {
            assigner,
            allowed_lateness,
            number_of_input_origins,
            workers,
            provider,
            inner: RwLock::new(StoreInner::new(number_of_input_origins)),
            metrics: StoreMetrics::default(),
        }
    }

    /// Returns the slice assigner.
    #[must_use]
    pub fn assigner(&self) -> &SliceAssigner {
        &self.assigner
    }

    /// Returns the allowed lateness.
    #[must_use]
    pub fn allowed_lateness(&self) -> u64 {
        self.allowed_lateness
    }

    /// Returns the number of input origins the termination flush waits for.
    #[must_use]
    pub fn number_of_input_origins(&self) -> usize {
        self.number_of_input_origins
    }

    /// Returns the number of workers that contribute to every slice.
    #[must_use]
    pub fn workers(&self) -> usize {
        self.workers
    }

    /// Returns the store metrics.
    #[must_use]
    pub fn metrics(&self) -> &StoreMetrics {
        &self.metrics
    }

    /// Returns all slices covering `ts`, creating them with `create` if missing.
    ///
    /// Concurrent callers for the same interval never create duplicates: the
    /// first caller to take the write lock runs `create`, the others observe
    /// its slices. Timestamps behind the trigger frontier still get a slice;
    /// the returned `late` flag tells the caller.
    ///
    /// # Errors
    ///
    /// Returns [`SliceError::TimestampOutOfRange`] past the assigner's
    /// [`max_timestamp`](SliceAssigner::max_timestamp),
    /// [`SliceError::StoreDeleted`] after [`Self::delete_state`], or the
    /// error returned by `create`.
    pub fn get_slices_or_create<F>(&self, ts: Timestamp, create: F) -> Result<SliceLookup<P>, SliceError>
    where
        F: FnOnce(SliceStart, SliceEnd) -> Result<Vec<Slice<P>>, SliceError>,
    {
        self.assigner.check_timestamp(ts)?;
        {
            let inner = self.inner.read();
            if inner.deleted {
                return Err(SliceError::StoreDeleted);
            }
            if let Some(slice) = inner.find(ts) {
                return Ok(self.lookup(&inner, ts, vec![SliceRef::clone(slice)], false));
            }
        }

        let mut inner = self.inner.write();
        if inner.deleted {
            return Err(SliceError::StoreDeleted);
        }
        if let Some(slice) = inner.find(ts) {
            let slices = vec![SliceRef::clone(slice)];
            return Ok(self.lookup(&inner, ts, slices, false));
        }

        let start = self.assigner.slice_start_of(ts);
        let end = self.assigner.slice_end_of(ts);
        let created = create(start, end)?;
        let mut covering = Vec::with_capacity(1);
        for slice in created {
            let slice = Arc::new(slice);
            if slice.contains(ts) {
                covering.push(SliceRef::clone(&slice));
            }
            inner.register(&self.assigner, slice);
            self.metrics.slices_created.fetch_add(1, Ordering::Relaxed);
        }
        tracing::debug!(start, end, "slice created");
        Ok(self.lookup(&inner, ts, covering, true))
    }

    fn lookup(
        &self,
        inner: &StoreInner<P>,
        ts: Timestamp,
        slices: Vec<SliceRef<P>>,
        created: bool,
    ) -> SliceLookup<P> {
        let late = inner.flushed
            || self.assigner.first_window_end_containing(ts) <= inner.trigger_frontier.timestamp();
        if late {
            self.metrics.late_lookups.fetch_add(1, Ordering::Relaxed);
        }
        SliceLookup {
            slices,
            late,
            created,
        }
    }

    /// Returns the slice identified by `end`.
    #[must_use]
    pub fn get_slice_by_slice_end(&self, end: SliceEnd) -> Option<SliceRef<P>> {
        self.inner.read().slices.get(&end).cloned()
    }

    /// Returns the trigger state of a window.
    #[must_use]
    pub fn window_state(&self, window: &WindowInfo) -> Option<WindowInfoState> {
        self.inner.read().windows.get(window).map(|sas| sas.state)
    }

    /// Returns the number of live slices.
    #[must_use]
    pub fn slice_count(&self) -> usize {
        self.inner.read().slices.len()
    }

    /// Returns the number of live windows.
    #[must_use]
    pub fn window_count(&self) -> usize {
        self.inner.read().windows.len()
    }

    /// Returns the next sequence number to be assigned.
    #[must_use]
    pub fn next_sequence_number(&self) -> u64 {
        self.inner.read().next_sequence
    }

    /// Returns the highest watermark (minus lateness) windows were triggered at.
    #[must_use]
    pub fn trigger_frontier(&self) -> Watermark {
        self.inner.read().trigger_frontier
    }

    /// Returns the origins that have not signalled completion.
    #[must_use]
    pub fn active_origins(&self) -> usize {
        self.inner.read().active_origins
    }

    /// Returns true once [`Self::delete_state`] ran.
    #[must_use]
    pub fn is_deleted(&self) -> bool {
        self.inner.read().deleted
    }

    /// Triggers every `Building` window with
    /// `window_end <= global_watermark - allowed_lateness`.
    ///
    /// Windows are visited in end order and each gets the next sequence
    /// number. A window is returned by exactly one call over its lifetime.
    /// The slices of a triggered window are sealed.
    ///
    /// # Errors
    ///
    /// Returns [`SliceError::AlreadyTriggered`] if the window map was
    /// corrupted into re-triggering a window.
    pub fn get_triggerable_window_slices(
        &self,
        global_watermark: Watermark,
    ) -> Result<TriggeredWindows<P>, SliceError> {
        let frontier = global_watermark.minus(self.allowed_lateness);
        let mut inner = self.inner.write();
        if inner.deleted {
            return Ok(TriggeredWindows::new());
        }
        inner.trigger_frontier = inner.trigger_frontier.max(frontier);
        let triggered = inner.trigger_where(|info| info.window_end <= frontier.timestamp())?;
        drop(inner);

        self.record_triggered(&triggered, "window triggered");
        Ok(triggered)
    }

    /// Signals that one input origin finished and flushes all remaining
    /// windows once every origin has.
    ///
    /// Until the last origin reports, this returns an empty map. The flush
    /// itself happens exactly once.
    ///
    /// # Errors
    ///
    /// See [`Self::get_triggerable_window_slices`].
    pub fn get_all_non_triggered_slices(&self) -> Result<TriggeredWindows<P>, SliceError> {
        let mut inner = self.inner.write();
        if inner.deleted {
            return Ok(TriggeredWindows::new());
        }
        inner.active_origins = inner.active_origins.saturating_sub(1);
        if inner.active_origins > 0 || inner.flushed {
            tracing::debug!(active_origins = inner.active_origins, "origin finished");
            return Ok(TriggeredWindows::new());
        }
        self.flush_locked(&mut inner)
    }

    /// Flushes all remaining windows regardless of how many origins are
    /// still active. Used by a graceful stop.
    ///
    /// # Errors
    ///
    /// See [`Self::get_triggerable_window_slices`].
    pub fn flush_all_non_triggered_slices(&self) -> Result<TriggeredWindows<P>, SliceError> {
        let mut inner = self.inner.write();
        if inner.deleted || inner.flushed {
            return Ok(TriggeredWindows::new());
        }
        inner.active_origins = 0;
        self.flush_locked(&mut inner)
    }

    fn flush_locked(&self, inner: &mut StoreInner<P>) -> Result<TriggeredWindows<P>, SliceError> {
        inner.flushed = true;
        let triggered = inner.trigger_where(|_| true)?;
        self.record_triggered(&triggered, "window flushed");
        Ok(triggered)
    }

    fn record_triggered(&self, triggered: &TriggeredWindows<P>, message: &'static str) {
        if triggered.is_empty() {
            return;
        }
        self.metrics
            .windows_triggered
            .fetch_add(triggered.len() as u64, Ordering::Relaxed);
        for (key, slices) in triggered {
            tracing::debug!(
                window = %key.window,
                sequence = key.sequence,
                slices = slices.len(),
                "{message}"
            );
        }
    }

    /// Removes every `Triggered` window with `window_end < watermark` and every
    /// slice ending before `watermark` that no remaining window references.
    ///
    /// Slices of `Building` windows are never removed.
    pub fn garbage_collect_slices_and_windows(&self, watermark: Watermark) -> GcSummary {
        let wm = watermark.timestamp();
        let reclaimed: Vec<SliceRef<P>>;
        let windows_removed;
        {
            let mut inner = self.inner.write();
            if inner.deleted {
                return GcSummary::default();
            }

            let expired: Vec<WindowInfo> = inner
                .windows
                .iter()
                .take_while(|(info, _)| info.window_end < wm)
                .filter(|(_, sas)| sas.state == WindowInfoState::Triggered)
                .map(|(info, _)| *info)
                .collect();
            for info in &expired {
                inner.windows.remove(info);
            }
            windows_removed = expired.len();

            let referenced: FxHashSet<SliceEnd> = inner
                .windows
                .iter()
                .filter(|(info, _)| info.window_start < wm)
                .flat_map(|(_, sas)| sas.slices.iter().map(|s| s.end()))
                .collect();
            let candidates: Vec<SliceEnd> = inner
                .slices
                .range(..wm)
                .map(|(end, _)| *end)
                .filter(|end| !referenced.contains(end))
                .collect();
            reclaimed = candidates
                .iter()
                .filter_map(|end| inner.slices.remove(end))
                .collect();
        }

        self.release(&reclaimed);
        if windows_removed > 0 || !reclaimed.is_empty() {
            self.metrics
                .windows_reclaimed
                .fetch_add(windows_removed as u64, Ordering::Relaxed);
            tracing::debug!(
                watermark = wm,
                windows = windows_removed,
                slices = reclaimed.len(),
                "garbage collected"
            );
        }
        GcSummary {
            slices: reclaimed.len(),
            windows: windows_removed,
        }
    }

    /// Drops every slice and window unconditionally.
    ///
    /// The exclusive lock is held for the whole teardown, so concurrent
    /// callers observe either the full state or none of it. Later calls to
    /// [`Self::get_slices_or_create`] fail with [`SliceError::StoreDeleted`].
    pub fn delete_state(&self) {
        let reclaimed: Vec<SliceRef<P>> = {
            let mut inner = self.inner.write();
            inner.deleted = true;
            inner.windows.clear();
            std::mem::take(&mut inner.slices).into_values().collect()
        };
        self.release(&reclaimed);
        tracing::debug!(slices = reclaimed.len(), "slice store deleted");
    }

    fn release(&self, slices: &[SliceRef<P>]) {
        self.metrics
            .slices_reclaimed
            .fetch_add(slices.len() as u64, Ordering::Relaxed);
        let Some(provider) = &self.provider else {
            return;
        };
        for slice in slices {
            if let Some(handle) = slice.take_buffer() {
                provider.release(handle);
            }
        }
    }
}

impl<P: PayloadCodec> WindowSliceStore<P> {
    /// Captures every live slice and window.
    ///
    /// Slices still being built are combined without sealing them.
    ///
    /// # Errors
    ///
    /// Returns [`SliceError::Payload`] if a payload cannot be combined or encoded.
    pub fn checkpoint(&self) -> Result<StoreCheckpoint, SliceError> {
        let inner = self.inner.read();
        let windows = inner
            .windows
            .iter()
            .map(|(info, sas)| WindowCheckpoint {
                window: *info,
                state: sas.state,
            })
            .collect();
        let slices = inner
            .slices
            .values()
            .map(|slice| {
                let payload = slice.peek()?.encode()?;
                Ok::<_, SliceError>(SliceCheckpoint {
                    start: slice.start(),
                    end: slice.end(),
                    sealed: slice.is_sealed(),
                    payload,
                })
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(StoreCheckpoint {
            next_sequence: inner.next_sequence,
            trigger_frontier: inner.trigger_frontier,
            active_origins: inner.active_origins as u64,
            flushed: inner.flushed,
            windows,
            slices,
        })
    }

    /// Rebuilds a store from a checkpoint.
    ///
    /// Storage for every restored slice is allocated from `provider`.
    ///
    /// # Errors
    ///
    /// Returns [`SliceError::Payload`] for undecodable payloads or
    /// [`SliceError::Alloc`] if the provider cannot supply storage.
    pub fn restore(
        assigner: SliceAssigner,
        allowed_lateness: u64,
        number_of_input_origins: usize,
        workers: usize,
        provider: Option<Arc<dyn BufferProvider>>,
        checkpoint: StoreCheckpoint,
    ) -> Result<Self, SliceError> {
        let store = Self::new(
            assigner,
            allowed_lateness,
            number_of_input_origins,
            workers,
            provider,
        );
        {
            let mut inner = store.inner.write();
            inner.next_sequence = checkpoint.next_sequence;
            inner.trigger_frontier = checkpoint.trigger_frontier;
            inner.active_origins = usize::try_from(checkpoint.active_origins)
                .unwrap_or(number_of_input_origins);
            inner.flushed = checkpoint.flushed;

            for w in &checkpoint.windows {
                let mut sas = SlicesAndState::new();
                sas.state = w.state;
                inner.windows.insert(w.window, sas);
            }
            for s in checkpoint.slices {
                let payload = P::decode(&s.payload)?;
                let buffer = match &store.provider {
                    Some(provider) => Some(provider.allocate(Slice::<P>::storage_size())?),
                    None => None,
                };
                let slice = if s.sealed {
                    Slice::with_merged(s.start, s.end, store.workers, buffer, payload)
                } else {
                    Slice::with_partial(s.start, s.end, store.workers, buffer, payload)
                };
                let slice = Arc::new(slice);
                for (info, sas) in inner.windows.iter_mut() {
                    if info.contains_slice(slice.start(), slice.end()) {
                        sas.slices.push(SliceRef::clone(&slice));
                    }
                }
                inner.slices.insert(slice.end(), slice);
                store.metrics.slices_created.fetch_add(1, Ordering::Relaxed);
            }
        }
        Ok(store)
    }
}
