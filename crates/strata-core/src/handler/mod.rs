//! # Window-Based Operator Handler
//!
//! Drives one windowed aggregation or join through its lifecycle.
//!
//! ## Lifecycle
//!
//! ```text
//! Initialized ──start──► Running ──stop──► Stopping ──► Stopped
//! ```
//!
//! ## Data Flow
//!
//! Each worker thread claims a [`WorkerHandle`] and feeds it buffers:
//!
//! 1. [`WorkerHandle::build`] admits the buffer on the build-side watermark
//!    processor, locates (or creates) the slice of every record and inserts
//!    it into the worker's own shard, then records the buffer. Late records
//!    are dropped or routed to the side output, according to
//!    [`LateDataConfig`]. A buffer rejected by admission leaves no trace and
//!    can be delivered again.
//! 2. [`WorkerHandle::close_buffer`] records the buffer on the probe-side
//!    watermark processor, contributes the worker's finished shards, triggers
//!    every window the probe watermark covers, emits one result per window
//!    and reclaims what is no longer needed.
//!
//! Build and probe progress are tracked separately because the build phase
//! of a buffer can run ahead of its trigger phase.
//!
//! ## Output
//!
//! Every emitted window carries the configured output origin, the sequence
//! number assigned at trigger time and `watermark_ts == window_end`. Sequence
//! numbers are gap-free; results of concurrent workers may be delivered out
//! of order and are put back in order downstream by sequence number.
//!
//! ## Failures
//!
//! Payload failures and slice store contract violations are fatal: the
//! handler moves to `Stopped` and the error is returned. Allocation failures
//! are returned as-is and may be retried by the caller.

mod config;

pub use config::{LateDataConfig, WindowConfig, WindowConfigBuilder, DEFAULT_MAX_PENDING_SEQUENCES};

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};

use fxhash::FxHashSet;
use parking_lot::{Mutex, RwLock};
use rkyv::{
    rancor::Error as RkyvError, util::AlignedVec, Archive, Deserialize as RkyvDeserialize,
    Serialize as RkyvSerialize,
};

use crate::memory::BufferProvider;
use crate::payload::{Payload, PayloadCodec};
use crate::slice::{
    InsertOutcome, MergeStatus, PerWorkerSliceBuffer, Slice, SliceAssigner, SliceError,
    SliceRef, StoreCheckpoint, TriggeredWindows, WindowInfo, WindowSliceStore, WorkerId,
};
use crate::time::{
    BufferMetaData, MultiOriginWatermarkProcessor, OriginId, SequenceData, Timestamp, Watermark,
    WatermarkError, WatermarkSnapshot,
};
use crate::{Error, Result};

/// Errors raised by the operator handler itself.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HandlerError {
    /// Operation not allowed in the current lifecycle state
    #[error("Cannot {operation} while {state}")]
    InvalidState {
        /// The rejected operation
        operation: &'static str,
        /// State at the time of the call
        state: HandlerState,
    },

    /// Configuration rejected by validation
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Checkpoint could not be written or read
    #[error("Checkpoint error: {0}")]
    Checkpoint(String),

    /// Worker index outside the configured pool
    #[error("Unknown worker {worker} (pool has {workers})")]
    UnknownWorker {
        /// Offending worker index
        worker: WorkerId,
        /// Configured number of workers
        workers: usize,
    },

    /// The worker index is already claimed by a live handle
    #[error("Worker {0} already in use")]
    WorkerInUse(WorkerId),
}

/// Lifecycle state of a handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HandlerState {
    /// Constructed, not started
    Initialized,
    /// Accepting buffers
    Running,
    /// Flushing remaining windows
    Stopping,
    /// State released; every call fails
    Stopped,
}

impl std::fmt::Display for HandlerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Initialized => "initialized",
            Self::Running => "running",
            Self::Stopping => "stopping",
            Self::Stopped => "stopped",
        };
        f.write_str(name)
    }
}

/// How [`WindowBasedOperatorHandler::stop`] ends the operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TerminationType {
    /// Emit every remaining window, then release state
    Graceful,
    /// Release state immediately (query cancellation)
    Forceful,
}

/// A record whose window already triggered, routed to the side output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LateRecord<R> {
    /// Side output name
    pub side_output: String,
    /// Origin of the buffer that carried the record
    pub origin: OriginId,
    /// Event timestamp
    pub timestamp: Timestamp,
    /// The record
    pub record: R,
}

/// Result of one window, ready to be shipped downstream.
#[derive(Debug, Clone, PartialEq)]
pub struct EmittedWindow<O> {
    /// The window
    pub window: WindowInfo,
    /// Output metadata: output origin, window sequence number, window end
    pub meta: BufferMetaData,
    /// The payload's result
    pub output: O,
}

impl<O> EmittedWindow<O> {
    /// Returns the sequence number assigned to the window.
    #[must_use]
    pub fn sequence_number(&self) -> u64 {
        self.meta.sequence.sequence_number
    }
}

/// What [`WorkerHandle::build`] did with one buffer.
#[derive(Debug)]
pub struct BuildSummary<R> {
    /// Records inserted into slices
    pub inserted: usize,
    /// Late records dropped
    pub dropped: usize,
    /// Late records handed to the side output
    pub late: Vec<LateRecord<R>>,
    /// True if the buffer was a replay and its records were skipped
    pub duplicate: bool,
    /// Build-side global watermark after the buffer
    pub watermark: Watermark,
}

impl<R> BuildSummary<R> {
    fn new(watermark: Watermark) -> Self {
        Self {
            inserted: 0,
            dropped: 0,
            late: Vec::new(),
            duplicate: false,
            watermark,
        }
    }
}

/// Output of [`WorkerHandle::process`].
#[derive(Debug)]
pub struct ProcessOutput<P: Payload> {
    /// Build phase summary
    pub build: BuildSummary<P::Record>,
    /// Windows triggered by the buffer's watermark
    pub emitted: Vec<EmittedWindow<P::Output>>,
}

/// Handler metrics.
#[derive(Debug, Default)]
pub struct HandlerMetrics {
    records_inserted: AtomicU64,
    late_records_dropped: AtomicU64,
    late_records_side_output: AtomicU64,
    windows_emitted: AtomicU64,
    merges_performed: AtomicU64,
}

impl HandlerMetrics {
    /// Returns total records inserted.
    #[must_use]
    pub fn records_inserted(&self) -> u64 {
        self.records_inserted.load(Ordering::Relaxed)
    }

    /// Returns total late records dropped.
    #[must_use]
    pub fn late_records_dropped(&self) -> u64 {
        self.late_records_dropped.load(Ordering::Relaxed)
    }

    /// Returns total late records routed to the side output.
    #[must_use]
    pub fn late_records_side_output(&self) -> u64 {
        self.late_records_side_output.load(Ordering::Relaxed)
    }

    /// Returns total windows emitted.
    #[must_use]
    pub fn windows_emitted(&self) -> u64 {
        self.windows_emitted.load(Ordering::Relaxed)
    }

    /// Returns total slice merges performed.
    #[must_use]
    pub fn merges_performed(&self) -> u64 {
        self.merges_performed.load(Ordering::Relaxed)
    }

    /// Returns a snapshot of all metrics.
    #[must_use]
    pub fn snapshot(&self) -> HandlerMetricsSnapshot {
        HandlerMetricsSnapshot {
            records_inserted: self.records_inserted(),
            late_records_dropped: self.late_records_dropped(),
            late_records_side_output: self.late_records_side_output(),
            windows_emitted: self.windows_emitted(),
            merges_performed: self.merges_performed(),
        }
    }
}

/// Snapshot of handler metrics for reporting.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct HandlerMetricsSnapshot {
    /// Records inserted.
    pub records_inserted: u64,
    /// Late records dropped.
    pub late_records_dropped: u64,
    /// Late records routed to the side output.
    pub late_records_side_output: u64,
    /// Windows emitted.
    pub windows_emitted: u64,
    /// Slice merges performed.
    pub merges_performed: u64,
}

/// Captured handler state.
#[derive(Debug, Clone, PartialEq, Eq, Archive, RkyvSerialize, RkyvDeserialize)]
pub struct HandlerCheckpoint {
    /// Build-side watermark progress
    pub build: WatermarkSnapshot,
    /// Probe-side watermark progress
    pub probe: WatermarkSnapshot,
    /// Origins that signalled completion
    pub finished_origins: Vec<OriginId>,
    /// Slices and windows
    pub store: StoreCheckpoint,
}

impl HandlerCheckpoint {
    /// Serializes the checkpoint with rkyv.
    ///
    /// # Errors
    ///
    /// Returns [`HandlerError::Checkpoint`] if encoding fails.
    pub fn to_bytes(&self) -> std::result::Result<Vec<u8>, HandlerError> {
        rkyv::to_bytes::<RkyvError>(self)
            .map(|v| v.to_vec())
            .map_err(|e| HandlerError::Checkpoint(e.to_string()))
    }

    /// Deserializes a checkpoint produced by [`Self::to_bytes`].
    ///
    /// # Errors
    ///
    /// Returns [`HandlerError::Checkpoint`] if the bytes are not a valid checkpoint.
    pub fn from_bytes(bytes: &[u8]) -> std::result::Result<Self, HandlerError> {
        let mut aligned = AlignedVec::<16>::with_capacity(bytes.len());
        aligned.extend_from_slice(bytes);
        let archived = rkyv::access::<rkyv::Archived<Self>, RkyvError>(&aligned)
            .map_err(|e| HandlerError::Checkpoint(e.to_string()))?;
        rkyv::deserialize::<Self, RkyvError>(archived)
            .map_err(|e| HandlerError::Checkpoint(e.to_string()))
    }
}

/// One window-based operator instance.
///
/// # Example
///
/// ```rust
/// use std::sync::Arc;
/// use strata_core::handler::{WindowBasedOperatorHandler, WindowConfig};
/// use strata_core::memory::PooledBufferProvider;
/// use strata_core::payload::SumPayload;
/// use strata_core::time::{BufferMetaData, OriginId};
///
/// let origin = OriginId::new(0);
/// let config = WindowConfig::builder()
///     .tumbling(10)
///     .input_origins([origin])
///     .build()
///     .unwrap();
/// let handler = WindowBasedOperatorHandler::<SumPayload>::new(config).unwrap();
/// handler.start(Arc::new(PooledBufferProvider::new(1024, 64))).unwrap();
///
/// let mut worker = handler.worker(0).unwrap();
/// worker.process(&BufferMetaData::single(origin, 1, 5), [(2, 3), (4, 4)]).unwrap();
/// let out = worker.process(&BufferMetaData::single(origin, 2, 12), [(11, 1)]).unwrap();
///
/// assert_eq!(out.emitted.len(), 1);
/// assert_eq!(out.emitted[0].output, 7);
/// assert_eq!(out.emitted[0].sequence_number(), 1);
/// ```
pub struct WindowBasedOperatorHandler<P: Payload> {
    config: WindowConfig,
    assigner: SliceAssigner,
    state: RwLock<HandlerState>,
    build_watermarks: MultiOriginWatermarkProcessor,
    probe_watermarks: MultiOriginWatermarkProcessor,
    provider: OnceLock<Arc<dyn BufferProvider>>,
    store: OnceLock<WindowSliceStore<P>>,
    finished_origins: Mutex<FxHashSet<OriginId>>,
    claimed: Box<[AtomicBool]>,
    metrics: HandlerMetrics,
}

impl<P: Payload> std::fmt::Debug for WindowBasedOperatorHandler<P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WindowBasedOperatorHandler")
            .field("config", &self.config)
            .field("state", &*self.state.read())
            .field("store", &self.store.get())
            .finish_non_exhaustive()
    }
}

impl<P: Payload> WindowBasedOperatorHandler<P> {
    /// Creates a handler in the `Initialized` state.
    ///
    /// # Errors
    ///
    /// Returns [`HandlerError::InvalidConfig`] if the configuration is invalid.
    pub fn new(config: WindowConfig) -> Result<Self> {
        config.validate()?;
        let build_watermarks =
            MultiOriginWatermarkProcessor::new(&config.input_origins, config.max_pending_sequences)?;
        let probe_watermarks =
            MultiOriginWatermarkProcessor::new(&config.input_origins, config.max_pending_sequences)?;
        Ok(Self::assemble(
            config,
            build_watermarks,
            probe_watermarks,
            HandlerState::Initialized,
        )?)
    }

    fn assemble(
        config: WindowConfig,
        build_watermarks: MultiOriginWatermarkProcessor,
        probe_watermarks: MultiOriginWatermarkProcessor,
        state: HandlerState,
    ) -> std::result::Result<Self, HandlerError> {
        let assigner = config.assigner()?;
        let claimed = (0..config.number_of_worker_threads)
            .map(|_| AtomicBool::new(false))
            .collect();
        Ok(Self {
            config,
            assigner,
            state: RwLock::new(state),
            build_watermarks,
            probe_watermarks,
            provider: OnceLock::new(),
            store: OnceLock::new(),
            finished_origins: Mutex::new(FxHashSet::default()),
            claimed,
            metrics: HandlerMetrics::default(),
        })
    }

    /// Returns the configuration.
    #[must_use]
    pub fn config(&self) -> &WindowConfig {
        &self.config
    }

    /// Returns the current lifecycle state.
    #[must_use]
    pub fn state(&self) -> HandlerState {
        *self.state.read()
    }

    /// Returns the handler metrics.
    #[must_use]
    pub fn metrics(&self) -> &HandlerMetrics {
        &self.metrics
    }

    /// Returns the build-side watermark processor.
    #[must_use]
    pub fn build_watermarks(&self) -> &MultiOriginWatermarkProcessor {
        &self.build_watermarks
    }

    /// Returns the probe-side watermark processor.
    #[must_use]
    pub fn probe_watermarks(&self) -> &MultiOriginWatermarkProcessor {
        &self.probe_watermarks
    }

    /// Returns the slice store once the handler was started.
    #[must_use]
    pub fn slice_store(&self) -> Option<&WindowSliceStore<P>> {
        self.store.get()
    }

    /// Registers the buffer provider and moves to `Running`.
    ///
    /// # Errors
    ///
    /// Returns [`HandlerError::InvalidState`] unless the handler is `Initialized`.
    pub fn start(&self, provider: Arc<dyn BufferProvider>) -> Result<()> {
        let mut state = self.state.write();
        if *state != HandlerState::Initialized {
            return Err(HandlerError::InvalidState {
                operation: "start",
                state: *state,
            }
            .into());
        }
        let store = WindowSliceStore::new(
            self.assigner,
            self.config.allowed_lateness,
            self.config.number_of_input_origins(),
            self.config.number_of_worker_threads,
            Some(Arc::clone(&provider)),
        );
        // Both cells are only ever filled under the state write lock
        let _ = self.provider.set(provider);
        let _ = self.store.set(store);
        *state = HandlerState::Running;
        tracing::info!(
            window_size = self.config.window_size,
            window_slide = self.config.window_slide,
            workers = self.config.number_of_worker_threads,
            origins = self.config.number_of_input_origins(),
            "window operator running"
        );
        Ok(())
    }

    /// Claims the per-worker view for `worker`.
    ///
    /// A worker index can be held by one handle at a time; dropping the
    /// handle releases it.
    ///
    /// # Errors
    ///
    /// Returns [`HandlerError::UnknownWorker`] or [`HandlerError::WorkerInUse`].
    pub fn worker(&self, worker: WorkerId) -> Result<WorkerHandle<'_, P>> {
        let claim = self.claimed.get(worker).ok_or(HandlerError::UnknownWorker {
            worker,
            workers: self.claimed.len(),
        })?;
        if claim.swap(true, Ordering::AcqRel) {
            return Err(HandlerError::WorkerInUse(worker).into());
        }
        Ok(WorkerHandle {
            handler: self,
            buffer: PerWorkerSliceBuffer::new(worker),
        })
    }

    /// Signals that `origin` produced its final buffer.
    ///
    /// Once every input origin has finished, all remaining windows are
    /// flushed and emitted. Repeated signals for the same origin are ignored.
    ///
    /// # Errors
    ///
    /// Returns [`WatermarkError::UnknownOrigin`] for an origin outside the
    /// configuration, [`HandlerError::InvalidState`] unless `Running`, or a
    /// fatal merge error.
    pub fn origin_finished(&self, origin: OriginId) -> Result<Vec<EmittedWindow<P::Output>>> {
        self.ensure_running("finish origin")?;
        if !self.config.input_origins.contains(&origin) {
            return Err(WatermarkError::UnknownOrigin(origin).into());
        }
        if !self.finished_origins.lock().insert(origin) {
            return Ok(Vec::new());
        }
        tracing::debug!(%origin, "origin finished");
        let store = self.running_store("finish origin")?;
        let triggered = store
            .get_all_non_triggered_slices()
            .map_err(|e| self.slice_failure(e))?;
        if triggered.is_empty() {
            return Ok(Vec::new());
        }
        let emitted = self.emit(triggered)?;
        store.garbage_collect_slices_and_windows(Watermark::new(Timestamp::MAX));
        Ok(emitted)
    }

    /// Stops the operator.
    ///
    /// A graceful stop emits every window that has not triggered yet before
    /// releasing state; a forceful stop releases state immediately.
    ///
    /// # Errors
    ///
    /// Returns [`HandlerError::InvalidState`] if the handler is already
    /// stopping or stopped, or a fatal merge error raised by the flush.
    pub fn stop(&self, termination: TerminationType) -> Result<Vec<EmittedWindow<P::Output>>> {
        {
            let mut state = self.state.write();
            match *state {
                HandlerState::Initialized => {
                    *state = HandlerState::Stopped;
                    tracing::info!("window operator stopped before start");
                    return Ok(Vec::new());
                }
                HandlerState::Running => *state = HandlerState::Stopping,
                HandlerState::Stopping | HandlerState::Stopped => {
                    return Err(HandlerError::InvalidState {
                        operation: "stop",
                        state: *state,
                    }
                    .into());
                }
            }
        }
        tracing::info!(?termination, "window operator stopping");

        let mut emitted = Vec::new();
        if let Some(store) = self.store.get() {
            if termination == TerminationType::Graceful {
                let triggered = store
                    .flush_all_non_triggered_slices()
                    .map_err(|e| self.slice_failure(e))?;
                emitted = self.emit(triggered)?;
            }
            store.delete_state();
        }

        *self.state.write() = HandlerState::Stopped;
        tracing::info!(emitted = emitted.len(), "window operator stopped");
        Ok(emitted)
    }

    fn ensure_running(&self, operation: &'static str) -> Result<()> {
        let state = self.state();
        if state == HandlerState::Running {
            Ok(())
        } else {
            Err(HandlerError::InvalidState { operation, state }.into())
        }
    }

    fn running_store(&self, operation: &'static str) -> Result<&WindowSliceStore<P>> {
        self.store.get().ok_or_else(|| {
            HandlerError::InvalidState {
                operation,
                state: self.state(),
            }
            .into()
        })
    }

    /// Moves to `Stopped` and returns the error.
    fn fail(&self, error: Error) -> Error {
        tracing::error!(%error, "window operator failed");
        *self.state.write() = HandlerState::Stopped;
        error
    }

    /// Maps a slice store error, failing the operator unless the error is a
    /// transient allocation failure or a bad record timestamp.
    fn slice_failure(&self, error: SliceError) -> Error {
        match error {
            SliceError::Alloc(e) => Error::Alloc(e),
            e @ SliceError::TimestampOutOfRange { .. } => Error::Slice(e),
            SliceError::Payload(e) => self.fail(Error::Payload(e)),
            other => self.fail(Error::Slice(other)),
        }
    }

    fn create_slices(
        &self,
        start: Timestamp,
        end: Timestamp,
    ) -> std::result::Result<Vec<Slice<P>>, SliceError> {
        let buffer = match self.provider.get() {
            Some(provider) => Some(provider.allocate(Slice::<P>::storage_size())?),
            None => None,
        };
        Ok(vec![Slice::new(
            start,
            end,
            self.config.number_of_worker_threads,
            buffer,
        )])
    }

    fn late_record(
        &self,
        summary: &mut BuildSummary<P::Record>,
        origin: OriginId,
        timestamp: Timestamp,
        record: P::Record,
    ) {
        match self.config.late_data.side_output() {
            Some(name) => {
                self.metrics
                    .late_records_side_output
                    .fetch_add(1, Ordering::Relaxed);
                summary.late.push(LateRecord {
                    side_output: name.to_string(),
                    origin,
                    timestamp,
                    record,
                });
            }
            None => {
                self.metrics
                    .late_records_dropped
                    .fetch_add(1, Ordering::Relaxed);
                summary.dropped += 1;
            }
        }
    }

    /// Merges the slices of every triggered window and produces its result.
    fn emit(&self, triggered: TriggeredWindows<P>) -> Result<Vec<EmittedWindow<P::Output>>> {
        let mut emitted = Vec::with_capacity(triggered.len());
        for (key, slices) in triggered {
            let output = self.window_output(&slices)?;
            let meta = BufferMetaData::new(
                key.window.window_end,
                SequenceData::emitted(key.sequence),
                self.config.output_origin,
            );
            tracing::debug!(
                window = %key.window,
                sequence = key.sequence,
                "window emitted"
            );
            emitted.push(EmittedWindow {
                window: key.window,
                meta,
                output,
            });
        }
        self.metrics
            .windows_emitted
            .fetch_add(emitted.len() as u64, Ordering::Relaxed);
        Ok(emitted)
    }

    fn window_output(&self, slices: &[SliceRef<P>]) -> Result<P::Output> {
        let mut merged = Vec::with_capacity(slices.len());
        for slice in slices {
            if slice.staging().status() != MergeStatus::Published {
                self.metrics.merges_performed.fetch_add(1, Ordering::Relaxed);
            }
            merged.push(slice.ensure_merged().map_err(|e| self.slice_failure(e))?);
        }
        match merged.as_slice() {
            [single] => Ok(single.emit()),
            parts => {
                let mut combined = P::default();
                for part in parts {
                    combined
                        .combine(part)
                        .map_err(|e| self.fail(Error::Payload(e)))?;
                }
                Ok(combined.emit())
            }
        }
    }
}

impl<P: PayloadCodec> WindowBasedOperatorHandler<P> {
    /// Captures watermark progress, windows and slice payloads.
    ///
    /// Take checkpoints while no buffers are in flight; state captured from
    /// concurrently running workers is not a consistent cut.
    ///
    /// # Errors
    ///
    /// Returns [`HandlerError::InvalidState`] unless `Running`, or a payload
    /// encoding error.
    pub fn checkpoint(&self) -> Result<HandlerCheckpoint> {
        self.ensure_running("checkpoint")?;
        let store = self.running_store("checkpoint")?.checkpoint()?;
        let mut finished_origins: Vec<_> = self.finished_origins.lock().iter().copied().collect();
        finished_origins.sort_unstable();
        Ok(HandlerCheckpoint {
            build: self.build_watermarks.snapshot(),
            probe: self.probe_watermarks.snapshot(),
            finished_origins,
            store,
        })
    }

    /// Rebuilds a running handler from a checkpoint.
    ///
    /// # Errors
    ///
    /// Returns a configuration, watermark, payload or allocation error if the
    /// checkpoint cannot be applied.
    pub fn restore_from_checkpoint(
        config: WindowConfig,
        provider: Arc<dyn BufferProvider>,
        checkpoint: HandlerCheckpoint,
    ) -> Result<Self> {
        config.validate()?;
        let build_watermarks = MultiOriginWatermarkProcessor::restore(checkpoint.build)?;
        let probe_watermarks = MultiOriginWatermarkProcessor::restore(checkpoint.probe)?;
        let handler = Self::assemble(
            config,
            build_watermarks,
            probe_watermarks,
            HandlerState::Running,
        )?;
        let store = WindowSliceStore::restore(
            handler.assigner,
            handler.config.allowed_lateness,
            handler.config.number_of_input_origins(),
            handler.config.number_of_worker_threads,
            Some(Arc::clone(&provider)),
            checkpoint.store,
        )?;
        let _ = handler.provider.set(provider);
        let _ = handler.store.set(store);
        handler
            .finished_origins
            .lock()
            .extend(checkpoint.finished_origins);
        tracing::info!(
            slices = handler.store.get().map_or(0, WindowSliceStore::slice_count),
            "window operator restored"
        );
        Ok(handler)
    }
}

/// A worker thread's access to the handler.
///
/// Owns the worker's [`PerWorkerSliceBuffer`], so the hot path finds its
/// slices without touching the shared store.
pub struct WorkerHandle<'a, P: Payload> {
    handler: &'a WindowBasedOperatorHandler<P>,
    buffer: PerWorkerSliceBuffer<P>,
}

impl<P: Payload> std::fmt::Debug for WorkerHandle<'_, P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerHandle")
            .field("worker", &self.buffer.worker())
            .field("slices", &self.buffer.len())
            .finish()
    }
}

impl<P: Payload> WorkerHandle<'_, P> {
    /// Returns the worker index.
    #[must_use]
    pub fn worker(&self) -> WorkerId {
        self.buffer.worker()
    }

    /// Returns the worker's slice buffer.
    #[must_use]
    pub fn slice_buffer(&self) -> &PerWorkerSliceBuffer<P> {
        &self.buffer
    }

    /// Build phase: inserts the buffer's `(timestamp, record)` pairs.
    ///
    /// A replayed buffer is recognized by its sequence data and its records
    /// are skipped, including a replay another worker is applying at the
    /// same moment.
    ///
    /// # Errors
    ///
    /// Returns [`HandlerError::InvalidState`] unless `Running`, a
    /// [`WatermarkError`] for malformed metadata, an allocation error, or a
    /// fatal payload error.
    pub fn build<I>(&mut self, meta: &BufferMetaData, records: I) -> Result<BuildSummary<P::Record>>
    where
        I: IntoIterator<Item = (Timestamp, P::Record)>,
    {
        let handler = self.handler;
        handler.ensure_running("build")?;
        let mut summary = BuildSummary::new(handler.build_watermarks.current_watermark());
        // Malformed metadata and a full reorder window are rejected here,
        // before any record is applied
        let Some(admission) = handler.build_watermarks.admit(meta)? else {
            tracing::trace!(
                origin = %meta.origin,
                sequence = meta.sequence.sequence_number,
                "replayed buffer skipped"
            );
            summary.duplicate = true;
            return Ok(summary);
        };
        let store = handler.running_store("build")?;

        // Slices are resolved before anything is inserted, so an allocation
        // failure leaves the buffer untouched and it can be retried whole
        let mut resolved = Vec::new();
        for (ts, record) in records {
            let slice = if let Some(slice) = self.buffer.lookup(ts) {
                Some(SliceRef::clone(slice))
            } else {
                let lookup = store
                    .get_slices_or_create(ts, |start, end| handler.create_slices(start, end))
                    .map_err(|e| handler.slice_failure(e))?;
                let covering = if lookup.late {
                    None
                } else {
                    lookup.slices.into_iter().next()
                };
                if let Some(slice) = &covering {
                    self.buffer.track(SliceRef::clone(slice));
                }
                covering
            };
            resolved.push((ts, record, slice));
        }

        for (ts, record, slice) in resolved {
            let Some(slice) = slice else {
                handler.late_record(&mut summary, meta.origin, ts, record);
                continue;
            };
            match self
                .buffer
                .insert(&slice, record)
                .map_err(|e| handler.slice_failure(e))?
            {
                InsertOutcome::Inserted => summary.inserted += 1,
                InsertOutcome::Sealed(record) => {
                    handler.late_record(&mut summary, meta.origin, ts, record);
                }
            }
        }

        handler
            .metrics
            .records_inserted
            .fetch_add(summary.inserted as u64, Ordering::Relaxed);
        admission.commit()?;
        summary.watermark = handler.build_watermarks.current_watermark();
        let late = summary.dropped + summary.late.len();
        if late > 0 {
            tracing::warn!(
                origin = %meta.origin,
                dropped = summary.dropped,
                side_output = summary.late.len(),
                "late records"
            );
        }
        Ok(summary)
    }

    /// Probe phase: advances the probe watermark with the buffer's metadata
    /// and emits every window it covers.
    ///
    /// # Errors
    ///
    /// Returns [`HandlerError::InvalidState`] unless `Running`, a
    /// [`WatermarkError`] for malformed metadata, or a fatal merge error.
    pub fn close_buffer(&mut self, meta: &BufferMetaData) -> Result<Vec<EmittedWindow<P::Output>>> {
        let handler = self.handler;
        handler.ensure_running("close buffer")?;
        handler.probe_watermarks.record(meta)?;
        let watermark = handler.probe_watermarks.current_watermark();
        let store = handler.running_store("close buffer")?;

        let frontier = watermark.minus(handler.config.allowed_lateness);
        let flushed = self
            .buffer
            .flush(&handler.assigner, frontier)
            .map_err(|e| handler.slice_failure(e))?;
        handler
            .metrics
            .merges_performed
            .fetch_add(flushed.merged as u64, Ordering::Relaxed);

        let triggered = store
            .get_triggerable_window_slices(watermark)
            .map_err(|e| handler.slice_failure(e))?;
        let emitted = handler.emit(triggered)?;
        store.garbage_collect_slices_and_windows(watermark);
        Ok(emitted)
    }

    /// Runs [`Self::build`] and [`Self::close_buffer`] for one buffer.
    ///
    /// # Errors
    ///
    /// See [`Self::build`] and [`Self::close_buffer`].
    pub fn process<I>(&mut self, meta: &BufferMetaData, records: I) -> Result<ProcessOutput<P>>
    where
        I: IntoIterator<Item = (Timestamp, P::Record)>,
    {
        let build = self.build(meta, records)?;
        let emitted = self.close_buffer(meta)?;
        Ok(ProcessOutput { build, emitted })
    }
}

impl<P: Payload> Drop for WorkerHandle<'_, P> {
    fn drop(&mut self) {
        self.buffer.clear();
        if let Some(claim) = self.handler.claimed.get(self.buffer.worker()) {
            claim.store(false, Ordering::Release);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::PooledBufferProvider;
    use crate::payload::{CountPayload, KeyedPayload, SumPayload};
    fn origin(id: u64) -> OriginId {
        OriginId::new(id)
    }

    fn provider() -> Arc<PooledBufferProvider> {
        Arc::new(PooledBufferProvider::new(1024, 256))
    }

    fn running<P: Payload>(config: WindowConfig) -> WindowBasedOperatorHandler<P> {
        let handler = WindowBasedOperatorHandler::new(config).unwrap();
        handler.start(provider()).unwrap();
        handler
    }

    fn tumbling(size: u64, origins: u64) -> WindowConfig {
        WindowConfig::builder()
            .tumbling(size)
            .input_origins((0..origins).map(OriginId::new))
            .output_origin(origin(99))
            .build()
            .unwrap()
    }

    #[test]
    fn test_lifecycle() {
        let handler = WindowBasedOperatorHandler::<SumPayload>::new(tumbling(10, 1)).unwrap();
        assert_eq!(handler.state(), HandlerState::Initialized);
        assert!(handler.slice_store().is_none());

        let mut worker = handler.worker(0).unwrap();
        assert!(matches!(
            worker.build(&BufferMetaData::single(origin(0), 1, 1), [(1, 1)]),
            Err(Error::Handler(HandlerError::InvalidState { .. }))
        ));
        drop(worker);

        handler.start(provider()).unwrap();
        assert_eq!(handler.state(), HandlerState::Running);
        assert!(handler.start(provider()).is_err());

        handler.stop(TerminationType::Forceful).unwrap();
        assert_eq!(handler.state(), HandlerState::Stopped);
        assert!(matches!(
            handler.stop(TerminationType::Graceful),
            Err(Error::Handler(HandlerError::InvalidState {
                state: HandlerState::Stopped,
                ..
            }))
        ));
        assert!(handler.origin_finished(origin(0)).is_err());
    }

    #[test]
    fn test_worker_claims() {
        let handler = running::<SumPayload>(tumbling(10, 1));
        let w0 = handler.worker(0).unwrap();
        assert!(matches!(
            handler.worker(0),
            Err(Error::Handler(HandlerError::WorkerInUse(0)))
        ));
        assert!(matches!(
            handler.worker(5),
            Err(Error::Handler(HandlerError::UnknownWorker { worker: 5, .. }))
        ));
        drop(w0);
        assert!(handler.worker(0).is_ok());
    }

    #[test]
    fn test_emit_metadata() {
        let handler = running::<SumPayload>(tumbling(10, 1));
        let mut w = handler.worker(0).unwrap();
        w.process(&BufferMetaData::single(origin(0), 1, 3), [(1, 2), (3, 5)])
            .unwrap();
        let out = w
            .process(&BufferMetaData::single(origin(0), 2, 10), [(10, 1)])
            .unwrap();

        assert_eq!(out.emitted.len(), 1);
        let window = &out.emitted[0];
        assert_eq!(window.window, WindowInfo::new(0, 10));
        assert_eq!(window.output, 7);
        assert_eq!(window.meta.origin, origin(99));
        assert_eq!(window.meta.watermark_ts, 10);
        assert_eq!(window.meta.sequence, SequenceData::emitted(1));
        assert!(window.meta.sequence.last_chunk);
        assert_eq!(window.meta.sequence.chunk_number, 0);
    }

    #[test]
    fn test_replayed_buffer_is_skipped() {
        let handler = running::<SumPayload>(tumbling(10, 1));
        let mut w = handler.worker(0).unwrap();
        let meta = BufferMetaData::single(origin(0), 1, 3);
        w.process(&meta, [(1, 2)]).unwrap();
        let replay = w.process(&meta, [(1, 2)]).unwrap();
        assert!(replay.build.duplicate);
        assert_eq!(replay.build.inserted, 0);

        let out = w
            .process(&BufferMetaData::single(origin(0), 2, 10), std::iter::empty())
            .unwrap();
        assert_eq!(out.emitted[0].output, 2);
    }

    #[test]
    fn test_late_records_dropped() {
        let handler = running::<SumPayload>(tumbling(10, 1));
        let mut w = handler.worker(0).unwrap();
        w.process(&BufferMetaData::single(origin(0), 1, 15), [(2, 1), (12, 1)])
            .unwrap();
        let out = w
            .process(&BufferMetaData::single(origin(0), 2, 16), [(4, 1), (13, 1)])
            .unwrap();
        assert_eq!(out.build.inserted, 1);
        assert_eq!(out.build.dropped, 1);
        assert!(out.build.late.is_empty());
        assert_eq!(handler.metrics().late_records_dropped(), 1);
    }

    #[test]
    fn test_late_records_side_output() {
        let config = WindowConfig::builder()
            .tumbling(10)
            .late_data(LateDataConfig::with_side_output("late".to_string()))
            .build()
            .unwrap();
        let handler = running::<SumPayload>(config);
        let mut w = handler.worker(0).unwrap();
        w.process(&BufferMetaData::single(origin(0), 1, 20), [(5, 1)])
            .unwrap();
        let out = w
            .process(&BufferMetaData::single(origin(0), 2, 20), [(7, 9)])
            .unwrap();
        assert_eq!(
            out.build.late,
            vec![LateRecord {
                side_output: "late".to_string(),
                origin: origin(0),
                timestamp: 7,
                record: 9,
            }]
        );
        assert_eq!(handler.metrics().late_records_side_output(), 1);
    }

    #[test]
    fn test_allowed_lateness_accepts_stragglers() {
        let config = WindowConfig::builder()
            .tumbling(10)
            .allowed_lateness(5)
            .build()
            .unwrap();
        let handler = running::<SumPayload>(config);
        let mut w = handler.worker(0).unwrap();
        let first = w
            .process(&BufferMetaData::single(origin(0), 1, 12), [(3, 1)])
            .unwrap();
        assert!(first.emitted.is_empty());

        // Behind the watermark but inside the grace period
        let second = w
            .process(&BufferMetaData::single(origin(0), 2, 15), [(8, 1)])
            .unwrap();
        assert_eq!(second.build.inserted, 1);
        assert_eq!(second.emitted.len(), 1);
        assert_eq!(second.emitted[0].output, 2);
    }

    #[test]
    fn test_graceful_stop_flushes() {
        let handler = running::<CountPayload>(tumbling(10, 1));
        {
            let mut w = handler.worker(0).unwrap();
            w.process(&BufferMetaData::single(origin(0), 1, 0), [(3, ()), (14, ())])
                .unwrap();
        }
        let emitted = handler.stop(TerminationType::Graceful).unwrap();
        let got: Vec<_> = emitted
            .iter()
            .map(|e| (e.window, e.sequence_number(), e.output))
            .collect();
        assert_eq!(
            got,
            vec![(WindowInfo::new(0, 10), 1, 1), (WindowInfo::new(10, 20), 2, 1)]
        );
        assert_eq!(handler.slice_store().map(WindowSliceStore::slice_count), Some(0));
    }

    #[test]
    fn test_forceful_stop_releases_buffers() {
        let pool = provider();
        let handler = WindowBasedOperatorHandler::<SumPayload>::new(tumbling(10, 1)).unwrap();
        handler.start(pool.clone()).unwrap();
        {
            let mut w = handler.worker(0).unwrap();
            w.build(&BufferMetaData::single(origin(0), 1, 0), [(3, 1), (14, 1)])
                .unwrap();
        }
        assert_eq!(pool.in_use(), 2);
        assert!(handler.stop(TerminationType::Forceful).unwrap().is_empty());
        assert_eq!(pool.in_use(), 0);
    }

    #[test]
    fn test_origin_finished_waits_for_all() {
        let handler = running::<SumPayload>(tumbling(10, 2));
        {
            let mut w = handler.worker(0).unwrap();
            w.build(&BufferMetaData::single(origin(0), 1, 0), [(3, 1)])
                .unwrap();
        }
        assert!(handler.origin_finished(origin(0)).unwrap().is_empty());
        assert!(handler.origin_finished(origin(0)).unwrap().is_empty());
        assert!(matches!(
            handler.origin_finished(origin(7)),
            Err(Error::Watermark(WatermarkError::UnknownOrigin(_)))
        ));
        let flushed = handler.origin_finished(origin(1)).unwrap();
        assert_eq!(flushed.len(), 1);
        assert_eq!(flushed[0].output, 1);
    }

    #[test]
    fn test_allocation_failure_is_not_fatal() {
        let handler = WindowBasedOperatorHandler::<SumPayload>::new(tumbling(10, 1)).unwrap();
        handler
            .start(Arc::new(PooledBufferProvider::new(1024, 1)))
            .unwrap();
        let mut w = handler.worker(0).unwrap();
        w.build(&BufferMetaData::single(origin(0), 1, 0), [(3, 1)])
            .unwrap();
        let err = w
            .build(&BufferMetaData::single(origin(0), 2, 0), [(13, 1)])
            .unwrap_err();
        assert!(matches!(err, Error::Alloc(_)));
        assert_eq!(handler.state(), HandlerState::Running);

        // Nothing of the failed buffer was applied, so it can be retried
        assert_eq!(handler.metrics().records_inserted(), 1);
        assert!(!handler
            .build_watermarks()
            .is_duplicate(&BufferMetaData::single(origin(0), 2, 0))
            .unwrap());
    }

    #[test]
    fn test_rejected_buffer_is_retried_once() {
        let config = WindowConfig::builder()
            .tumbling(10)
            .input_origins([origin(0)])
            .max_pending_sequences(1)
            .build()
            .unwrap();
        let handler = running::<CountPayload>(config);
        let mut w = handler.worker(0).unwrap();
        let meta = |seq, wm| BufferMetaData::single(origin(0), seq, wm);

        // Sequence 2 takes the only reorder slot, so 3 is turned away
        w.build(&meta(2, 0), [(1, ())]).unwrap();
        let err = w.build(&meta(3, 20), [(2, ()), (3, ())]).unwrap_err();
        assert!(matches!(
            err,
            Error::Watermark(WatermarkError::ReorderCapacityExceeded { limit: 1, .. })
        ));
        assert_eq!(handler.metrics().records_inserted(), 1);

        w.build(&meta(1, 0), [(4, ())]).unwrap();
        let retry = w.build(&meta(3, 20), [(2, ()), (3, ())]).unwrap();
        assert_eq!(retry.inserted, 2);
        assert_eq!(handler.metrics().records_inserted(), 4);

        let mut emitted = Vec::new();
        for (seq, wm) in [(1, 0), (2, 0), (3, 20)] {
            emitted.extend(w.close_buffer(&meta(seq, wm)).unwrap());
        }
        let got: Vec<_> = emitted.iter().map(|e| (e.window, e.output)).collect();
        assert_eq!(got, vec![(WindowInfo::new(0, 10), 4)]);
    }

    fn sliding_uneven(workers: usize) -> (Vec<(WindowInfo, u64)>, usize) {
        let config = WindowConfig::builder()
            .sliding(10, 4)
            .workers(workers)
            .input_origins([origin(0)])
            .build()
            .unwrap();
        let handler = running::<CountPayload>(config);
        let mut handles: Vec<_> = (0..workers).map(|w| handler.worker(w).unwrap()).collect();

        let mut emitted = Vec::new();
        let mut dropped = 0;
        let buffers = [(1, 5, Some(3)), (2, 6, Some(3)), (3, 10, None)];
        for (i, (seq, wm, ts)) in buffers.into_iter().enumerate() {
            let out = handles[i % workers]
                .process(
                    &BufferMetaData::single(origin(0), seq, wm),
                    ts.map(|ts| (ts, ())),
                )
                .unwrap();
            dropped += out.build.dropped;
            emitted.extend(out.emitted.into_iter().map(|e| (e.window, e.output)));
        }
        (emitted, dropped)
    }

    #[test]
    fn test_sliding_result_independent_of_workers() {
        // Slice [2,4) outlives the watermark 5 and 6 because [0,10) is still open
        let expected = (vec![(WindowInfo::new(0, 10), 2)], 0);
        assert_eq!(sliding_uneven(1), expected);
        assert_eq!(sliding_uneven(2), expected);
    }

    #[test]
    fn test_out_of_range_timestamp_rejects_buffer() {
        let handler = running::<SumPayload>(tumbling(10, 1));
        let mut w = handler.worker(0).unwrap();
        let meta = BufferMetaData::single(origin(0), 1, 0);
        let err = w.build(&meta, [(3, 1), (u64::MAX, 1)]).unwrap_err();
        assert!(matches!(
            err,
            Error::Slice(SliceError::TimestampOutOfRange { ts: u64::MAX, .. })
        ));
        assert_eq!(handler.state(), HandlerState::Running);
        assert_eq!(handler.metrics().records_inserted(), 0);

        let retry = w.build(&meta, [(3, 1)]).unwrap();
        assert_eq!(retry.inserted, 1);
        assert!(!retry.duplicate);
    }

    #[test]
    fn test_keyed_payload() {
        type Keyed = KeyedPayload<u32, SumPayload>;
        let handler = running::<Keyed>(tumbling(10, 1));
        let mut w = handler.worker(0).unwrap();
        w.process(
            &BufferMetaData::single(origin(0), 1, 0),
            [(1, (2, 5)), (2, (1, 1)), (3, (2, 5))],
        )
        .unwrap();
        let out = w
            .process(&BufferMetaData::single(origin(0), 2, 10), std::iter::empty())
            .unwrap();
        assert_eq!(out.emitted[0].output, vec![(1, 1), (2, 10)]);
    }

    #[test]
    fn test_checkpoint_roundtrip() {
        let config = tumbling(10, 1);
        let handler = running::<SumPayload>(config.clone());
        {
            let mut w = handler.worker(0).unwrap();
            w.process(&BufferMetaData::single(origin(0), 1, 10), [(3, 4), (12, 6)])
                .unwrap();
        }
        let bytes = handler.checkpoint().unwrap().to_bytes().unwrap();

        let restored = WindowBasedOperatorHandler::<SumPayload>::restore_from_checkpoint(
            config,
            provider(),
            HandlerCheckpoint::from_bytes(&bytes).unwrap(),
        )
        .unwrap();
        assert_eq!(restored.state(), HandlerState::Running);
        assert_eq!(
            restored.probe_watermarks().current_watermark(),
            Watermark::new(10)
        );

        let mut w = restored.worker(0).unwrap();
        let out = w
            .process(&BufferMetaData::single(origin(0), 2, 20), [(15, 1)])
            .unwrap();
        assert_eq!(out.emitted.len(), 1);
        assert_eq!(out.emitted[0].window, WindowInfo::new(10, 20));
        assert_eq!(out.emitted[0].sequence_number(), 2);
        assert_eq!(out.emitted[0].output, 7);
    }
}
