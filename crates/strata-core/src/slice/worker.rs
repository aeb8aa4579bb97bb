//! A worker thread's private view of the slices it is filling.

use std::collections::BTreeMap;

use super::{
    Contribution, InsertOutcome, SliceAssigner, SliceEnd, SliceError, SliceRef, WorkerId,
};
use crate::payload::Payload;
use crate::time::{Timestamp, Watermark};

/// Counts from one [`PerWorkerSliceBuffer::flush`] pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlushSummary {
    /// Slices whose shard was handed to the merge stage
    pub contributed: usize,
    /// Slices this worker merged as the last contributor
    pub merged: usize,
}

/// Slices a single worker is currently filling.
///
/// The buffer is owned by exactly one worker thread and needs no internal
/// synchronization: it is a cache keyed by slice end that lets the hot path
/// find its slice without touching the shared store. Records go into the
/// worker's own shard of the slice. Once the earliest window containing a
/// slice is due, [`flush`](Self::flush) hands the shard to the merge stage
/// and forgets the slice.
#[derive(Debug)]
pub struct PerWorkerSliceBuffer<P: Payload> {
    worker: WorkerId,
    slices: BTreeMap<SliceEnd, SliceRef<P>>,
}

impl<P: Payload> PerWorkerSliceBuffer<P> {
    /// Creates an empty buffer for `worker`.
    #[must_use]
    pub fn new(worker: WorkerId) -> Self {
        Self {
            worker,
            slices: BTreeMap::new(),
        }
    }

    /// Returns the owning worker.
    #[must_use]
    pub fn worker(&self) -> WorkerId {
        self.worker
    }

    /// Returns the number of slices being filled.
    #[must_use]
    pub fn len(&self) -> usize {
        self.slices.len()
    }

    /// Returns true if no slice is being filled.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.slices.is_empty()
    }

    /// Returns the cached slice containing `ts`, if any.
    #[must_use]
    pub fn lookup(&self, ts: Timestamp) -> Option<&SliceRef<P>> {
        self.slices
            .range(ts.saturating_add(1)..)
            .next()
            .map(|(_, slice)| slice)
            .filter(|slice| slice.contains(ts))
    }

    /// Adds a slice to the working set.
    pub fn track(&mut self, slice: SliceRef<P>) {
        self.slices.entry(slice.end()).or_insert(slice);
    }

    /// Inserts a record into this worker's shard of `slice`.
    ///
    /// # Errors
    ///
    /// Returns the slice's insert error.
    pub fn insert(
        &mut self,
        slice: &SliceRef<P>,
        record: P::Record,
    ) -> Result<InsertOutcome<P::Record>, SliceError> {
        let outcome = slice.insert(self.worker, record)?;
        if matches!(outcome, InsertOutcome::Inserted) {
            self.track(SliceRef::clone(slice));
        }
        Ok(outcome)
    }

    /// Contributes every slice whose earliest window ends at or before
    /// `frontier` and evicts it.
    ///
    /// A slice stays cached while any window containing it can still
    /// trigger later: with sliding windows the earliest window can end well
    /// after the slice itself, and contributing early would seal the slice
    /// against records that are not late yet.
    ///
    /// # Errors
    ///
    /// Returns a combine error if this worker ends up performing a merge that
    /// fails. Slices flushed before the failure stay evicted.
    pub fn flush(
        &mut self,
        assigner: &SliceAssigner,
        frontier: Watermark,
    ) -> Result<FlushSummary, SliceError> {
        let mut summary = FlushSummary::default();
        // Earliest window end grows with slice end, so finished slices form a prefix
        while let Some(entry) = self.slices.first_entry() {
            if assigner.first_window_end_containing(entry.get().start()) > frontier.timestamp() {
                break;
            }
            let slice = entry.remove();
            match slice.contribute(self.worker)? {
                Contribution::Merged => {
                    summary.contributed += 1;
                    summary.merged += 1;
                }
                Contribution::Pending => summary.contributed += 1,
                Contribution::AlreadyDone => {}
            }
        }
        Ok(summary)
    }

    /// Forgets every slice without contributing.
    pub fn clear(&mut self) {
        self.slices.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::payload::CountPayload;
    use crate::slice::Slice;
    use std::sync::Arc;
    fn slice(start: u64, end: u64, workers: usize) -> SliceRef<CountPayload> {
        Arc::new(Slice::new(start, end, workers, None))
    }

    #[test]
    fn test_lookup_by_timestamp() {
        let mut buf = PerWorkerSliceBuffer::<CountPayload>::new(0);
        buf.track(slice(0, 10, 1));
        buf.track(slice(20, 30, 1));

        assert_eq!(buf.lookup(0).map(|s| s.end()), Some(10));
        assert_eq!(buf.lookup(9).map(|s| s.end()), Some(10));
        assert!(buf.lookup(10).is_none());
        assert!(buf.lookup(15).is_none());
        assert_eq!(buf.lookup(29).map(|s| s.end()), Some(30));
        assert!(buf.lookup(30).is_none());
    }

    #[test]
    fn test_flush_contributes_finished_slices() {
        let a = slice(0, 10, 2);
        let b = slice(10, 20, 2);
        let mut w0 = PerWorkerSliceBuffer::new(0);
        let mut w1 = PerWorkerSliceBuffer::new(1);

        w0.insert(&a, ()).unwrap();
        w0.insert(&b, ()).unwrap();
        w1.insert(&a, ()).unwrap();

        let tumbling = SliceAssigner::tumbling(10).unwrap();
        let summary = w0.flush(&tumbling, Watermark::new(10)).unwrap();
        assert_eq!(summary, FlushSummary { contributed: 1, merged: 0 });
        assert_eq!(w0.len(), 1);

        let summary = w1.flush(&tumbling, Watermark::new(12)).unwrap();
        assert_eq!(summary, FlushSummary { contributed: 1, merged: 1 });
        assert!(w1.is_empty());
        assert_eq!(a.merged().unwrap().emit(), 2);
        assert!(b.merged().is_none());
    }

    #[test]
    fn test_flush_waits_for_earliest_window() {
        // slice_len = 2; slice [2,4) is first contained in window [0,10)
        let sliding = SliceAssigner::new(10, 4).unwrap();
        let early = slice(2, 4, 1);
        let later = slice(8, 10, 1);
        let mut w = PerWorkerSliceBuffer::new(0);
        w.insert(&early, ()).unwrap();
        w.insert(&later, ()).unwrap();

        let summary = w.flush(&sliding, Watermark::new(6)).unwrap();
        assert_eq!(summary, FlushSummary::default());
        assert_eq!(w.len(), 2);
        assert!(!early.is_sealed());

        let summary = w.flush(&sliding, Watermark::new(10)).unwrap();
        assert_eq!(summary, FlushSummary { contributed: 2, merged: 2 });
        assert!(w.is_empty());
        assert!(early.is_sealed());
    }

    #[test]
    fn test_sealed_slice_not_tracked() {
        let a = slice(0, 10, 1);
        a.ensure_merged().unwrap();
        let mut w = PerWorkerSliceBuffer::new(0);
        assert_eq!(w.insert(&a, ()).unwrap(), InsertOutcome::Sealed(()));
        assert!(w.is_empty());
    }
}
