//! Per-origin contiguous watermark tracking.
//!
//! An origin's watermark only advances over sequence numbers that have been
//! delivered without gaps. Buffers that arrive ahead of a gap are parked in a
//! bounded pending map until the gap closes. Chunked buffers count as
//! delivered once every chunk up to the one flagged `last_chunk` was seen.
//!
//! A buffer whose records are applied before it is recorded goes through
//! [`OriginProgress::admit`] first. Admission runs every check `update` would
//! run and keeps the buffer in flight, holding its reorder slot, until
//! [`OriginProgress::commit`] records it or [`OriginProgress::release`]
//! gives it back.

use std::collections::BTreeMap;

use rkyv::{Archive, Deserialize as RkyvDeserialize, Serialize as RkyvSerialize};
use smallvec::SmallVec;

use super::multi_origin::WatermarkError;
use super::{BufferMetaData, ChunkNumber, OriginId, SequenceData, SequenceNumber, Watermark};

/// Chunks seen for one sequence number. Most buffers are a single chunk.
type ChunkVec = SmallVec<[ChunkNumber; 4]>;

/// Result of feeding one buffer into an origin's progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateOutcome {
    /// The contiguous prefix grew; carries the origin's watermark afterwards.
    Advanced(Watermark),
    /// The buffer was recorded but sits behind a gap or an incomplete chunk set.
    Held,
    /// The buffer (or chunk) was already delivered and was ignored.
    Duplicate,
}

/// Reassembly state of one parked sequence number, as captured in snapshots.
#[derive(Debug, Clone, Default, PartialEq, Eq, Archive, RkyvSerialize, RkyvDeserialize)]
pub struct PendingSequence {
    /// The parked sequence number
    pub sequence: SequenceNumber,
    /// Distinct chunk numbers seen, kept sorted
    pub chunks: Vec<ChunkNumber>,
    /// Chunk number of the chunk flagged as last, once seen
    pub last_chunk: Option<ChunkNumber>,
    /// Highest watermark carried by any chunk
    pub watermark: Watermark,
}

/// Working form of [`PendingSequence`] with inline chunk storage.
#[derive(Debug, Default)]
struct Reassembly {
    chunks: ChunkVec,
    last_chunk: Option<ChunkNumber>,
    watermark: Watermark,
}

impl Reassembly {
    fn is_complete(&self) -> bool {
        self.last_chunk
            .is_some_and(|last| self.chunks.len() as u64 == last)
    }
}

/// A buffer admitted but not yet recorded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct InFlight {
    sequence: SequenceNumber,
    chunk: ChunkNumber,
    last_chunk: bool,
}

impl InFlight {
    fn of(meta: &BufferMetaData) -> Self {
        Self {
            sequence: meta.sequence.sequence_number,
            chunk: meta
                .sequence
                .chunk_number
                .max(SequenceData::INITIAL_CHUNK_NUMBER),
            last_chunk: meta.sequence.last_chunk,
        }
    }
}

/// Contiguous delivery progress of a single origin.
#[derive(Debug)]
pub struct OriginProgress {
    origin: OriginId,
    /// Next sequence number needed to extend the contiguous prefix
    next_sequence: SequenceNumber,
    /// Max watermark over the contiguous prefix
    watermark: Watermark,
    /// Sequences at or after `next_sequence` that are not complete or not contiguous
    pending: BTreeMap<SequenceNumber, Reassembly>,
    /// Admitted buffers whose records are being applied
    in_flight: Vec<InFlight>,
    max_pending: usize,
}

impl OriginProgress {
    /// Creates progress for an origin that has not delivered anything.
    #[must_use]
    pub fn new(origin: OriginId, max_pending: usize) -> Self {
        Self {
            origin,
            next_sequence: 1,
            watermark: Watermark::MIN,
            pending: BTreeMap::new(),
            in_flight: Vec::new(),
            max_pending,
        }
    }

    /// Returns the watermark of the contiguous prefix.
    #[must_use]
    pub fn watermark(&self) -> Watermark {
        self.watermark
    }

    /// Returns the highest sequence number of the contiguous prefix (0 if none).
    #[must_use]
    pub fn contiguous_sequence(&self) -> SequenceNumber {
        self.next_sequence - 1
    }

    /// Returns how many sequence numbers are parked waiting for a gap or chunks.
    #[must_use]
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Returns true if the buffer (or chunk) described by `sequence` was
    /// already recorded.
    #[must_use]
    pub fn has_seen(&self, sequence: &SequenceData) -> bool {
        if sequence.sequence_number < self.next_sequence {
            return true;
        }
        let chunk = sequence
            .chunk_number
            .max(SequenceData::INITIAL_CHUNK_NUMBER);
        self.pending
            .get(&sequence.sequence_number)
            .is_some_and(|entry| entry.chunks.binary_search(&chunk).is_ok())
    }

    /// Records one buffer and extends the contiguous prefix when possible.
    ///
    /// # Errors
    ///
    /// Returns [`WatermarkError::InvalidSequence`] for sequence number 0,
    /// [`WatermarkError::InvalidChunk`] for chunks past the announced last
    /// chunk, and [`WatermarkError::ReorderCapacityExceeded`] when too many
    /// sequence numbers are already parked.
    pub fn update(&mut self, meta: &BufferMetaData) -> Result<UpdateOutcome, WatermarkError> {
        if !self.check(meta)? {
            return Ok(UpdateOutcome::Duplicate);
        }
        let InFlight {
            sequence,
            chunk,
            last_chunk,
        } = InFlight::of(meta);

        let entry = self.pending.entry(sequence).or_default();
        if let Err(pos) = entry.chunks.binary_search(&chunk) {
            entry.chunks.insert(pos, chunk);
        }
        if last_chunk {
            entry.last_chunk = Some(chunk);
        }
        entry.watermark = entry.watermark.max(meta.watermark());

        Ok(self.advance())
    }

    /// Admits a buffer whose records are about to be applied.
    ///
    /// Returns `false` if the buffer was already recorded or is in flight
    /// right now; its records must be skipped. On `true` the buffer holds
    /// its reorder slot until [`Self::commit`] or [`Self::release`].
    ///
    /// # Errors
    ///
    /// The same errors as [`Self::update`], raised before anything changes.
    pub fn admit(&mut self, meta: &BufferMetaData) -> Result<bool, WatermarkError> {
        if !self.check(meta)? {
            return Ok(false);
        }
        self.in_flight.push(InFlight::of(meta));
        Ok(true)
    }

    /// Records a buffer previously admitted with [`Self::admit`].
    ///
    /// # Errors
    ///
    /// See [`Self::update`]. The checks already passed at admission, and
    /// every later admission was checked against this buffer.
    pub fn commit(&mut self, meta: &BufferMetaData) -> Result<UpdateOutcome, WatermarkError> {
        self.release(meta);
        self.update(meta)
    }

    /// Gives back an admitted buffer without recording it. It can be
    /// delivered again.
    pub fn release(&mut self, meta: &BufferMetaData) {
        let key = InFlight::of(meta);
        if let Some(pos) = self.in_flight.iter().position(|f| *f == key) {
            self.in_flight.swap_remove(pos);
        }
    }

    /// Validates a buffer against recorded and in-flight state.
    ///
    /// Returns `Ok(false)` for a buffer that was already recorded or is in
    /// flight.
    fn check(&self, meta: &BufferMetaData) -> Result<bool, WatermarkError> {
        let InFlight {
            sequence,
            chunk,
            last_chunk,
        } = InFlight::of(meta);

        if sequence == 0 {
            return Err(WatermarkError::InvalidSequence {
                origin: self.origin,
            });
        }
        if sequence < self.next_sequence {
            return Ok(false);
        }

        let entry = self.pending.get(&sequence);
        let flying = || self.in_flight_of(sequence);
        if entry.is_some_and(|e| e.chunks.binary_search(&chunk).is_ok())
            || flying().any(|f| f.chunk == chunk)
        {
            return Ok(false);
        }

        let known_last = entry
            .and_then(|e| e.last_chunk)
            .or_else(|| flying().find(|f| f.last_chunk).map(|f| f.chunk));
        let highest = entry
            .and_then(|e| e.chunks.last().copied())
            .max(flying().map(|f| f.chunk).max());
        let past_last = known_last.is_some_and(|last| chunk > last);
        let before_seen = last_chunk && highest.is_some_and(|max| max > chunk);
        if past_last || before_seen || (last_chunk && known_last.is_some()) {
            return Err(WatermarkError::InvalidChunk {
                origin: self.origin,
                sequence,
                chunk,
            });
        }

        // The buffer that closes the gap is always accepted
        let has_slot = entry.is_some() || flying().next().is_some();
        if sequence != self.next_sequence && !has_slot && self.occupied() >= self.max_pending {
            return Err(WatermarkError::ReorderCapacityExceeded {
                origin: self.origin,
                limit: self.max_pending,
            });
        }
        Ok(true)
    }

    fn in_flight_of(&self, sequence: SequenceNumber) -> impl Iterator<Item = &InFlight> + '_ {
        self.in_flight
            .iter()
            .filter(move |f| f.sequence == sequence)
    }

    /// Reorder slots taken by parked sequences and by in-flight sequences
    /// that are not parked yet.
    fn occupied(&self) -> usize {
        let flying = self
            .in_flight
            .iter()
            .enumerate()
            .filter(|&(i, f)| {
                !self.pending.contains_key(&f.sequence)
                    && !self.in_flight[..i].iter().any(|g| g.sequence == f.sequence)
            })
            .count();
        self.pending.len() + flying
    }

    fn advance(&mut self) -> UpdateOutcome {
        let before = self.next_sequence;
        while let Some(entry) = self.pending.first_entry() {
            if *entry.key() != self.next_sequence || !entry.get().is_complete() {
                break;
            }
            let done = entry.remove();
            self.watermark = self.watermark.max(done.watermark);
            self.next_sequence += 1;
        }

        if self.next_sequence == before {
            UpdateOutcome::Held
        } else {
            UpdateOutcome::Advanced(self.watermark)
        }
    }

    pub(crate) fn pending_snapshot(&self) -> Vec<PendingSequence> {
        self.pending
            .iter()
            .map(|(&sequence, r)| PendingSequence {
                sequence,
                chunks: r.chunks.to_vec(),
                last_chunk: r.last_chunk,
                watermark: r.watermark,
            })
            .collect()
    }

    pub(crate) fn from_parts(
        origin: OriginId,
        max_pending: usize,
        contiguous_sequence: SequenceNumber,
        watermark: Watermark,
        pending: Vec<PendingSequence>,
    ) -> Self {
        let pending = pending
            .into_iter()
            .map(|p| {
                (
                    p.sequence,
                    Reassembly {
                        chunks: ChunkVec::from_vec(p.chunks),
                        last_chunk: p.last_chunk,
                        watermark: p.watermark,
                    },
                )
            })
            .collect();
        Self {
            origin,
            next_sequence: contiguous_sequence + 1,
            watermark,
            pending,
            in_flight: Vec::new(),
            max_pending,
        }
    }
}
