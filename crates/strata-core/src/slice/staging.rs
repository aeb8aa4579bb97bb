//! Fan-in barrier that merges per-worker shards of one slice exactly once.
//!
//! ## Protocol
//!
//! Every worker fills its own shard. A worker that is done with the slice
//! contributes its shard, decrementing the `remaining` counter; the worker
//! that takes it to zero performs the merge. The trigger path may also force
//! the merge through [`SliceMergeStaging::ensure_merged`] when some workers
//! never touched the slice.
//!
//! Both paths go through one critical section guarded by the state lock:
//!
//! ```text
//! Staging ──► Merging ──► Published(Arc<P>)
//!                  └────► Failed(PayloadError)
//! ```
//!
//! The first thread to enter it seals the slice, drains every shard and
//! publishes. Later callers observe `Published` and return the shared result.
//! A record inserted after sealing is handed back as [`InsertOutcome::Sealed`].

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use super::{SliceError, WorkerId};
use crate::payload::{Payload, PayloadError};

/// Pads a value to its own cache line so neighbouring shards don't false-share.
#[repr(C, align(64))]
#[derive(Debug, Default)]
struct CachePadded<T> {
    value: T,
}

impl<T> std::ops::Deref for CachePadded<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.value
    }
}

/// One worker's partial state.
#[derive(Debug)]
struct Shard<P> {
    payload: Mutex<Option<P>>,
    contributed: AtomicBool,
}

impl<P> Default for Shard<P> {
    fn default() -> Self {
        Self {
            payload: Mutex::new(None),
            contributed: AtomicBool::new(false),
        }
    }
}

/// Result of inserting a record into a shard.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InsertOutcome<R> {
    /// The record was applied
    Inserted,
    /// The slice was already sealed for merging; the record is handed back
    Sealed(R),
}

/// Result of a worker contributing its shard.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Contribution {
    /// Other workers have not contributed yet
    Pending,
    /// This worker was the last contributor; the merged payload is published
    Merged,
    /// The worker had already contributed, or the slice is already merged
    AlreadyDone,
}

/// Observable merge state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeStatus {
    /// Workers may still insert
    Staging,
    /// A thread is combining the shards
    Merging,
    /// The canonical payload is available
    Published,
    /// Combining failed; the slice is unusable
    Failed,
}

#[derive(Debug)]
enum MergeState<P> {
    Staging,
    Merging,
    Published(Arc<P>),
    Failed(PayloadError),
}

/// Per-slice staging area for worker shards.
#[derive(Debug)]
pub struct SliceMergeStaging<P: Payload> {
    shards: Box<[CachePadded<Shard<P>>]>,
    remaining: AtomicUsize,
    sealed: AtomicBool,
    state: Mutex<MergeState<P>>,
}

impl<P: Payload> SliceMergeStaging<P> {
    /// Creates staging for `workers` contributors.
    #[must_use]
    pub fn new(workers: usize) -> Self {
        let shards = (0..workers).map(|_| CachePadded::default()).collect();
        Self {
            shards,
            remaining: AtomicUsize::new(workers),
            sealed: AtomicBool::new(false),
            state: Mutex::new(MergeState::Staging),
        }
    }

    /// Creates staging whose payload is already published.
    #[must_use]
    pub fn published(workers: usize, payload: P) -> Self {
        let staging = Self::new(workers);
        staging.sealed.store(true, Ordering::Release);
        staging.remaining.store(0, Ordering::Release);
        *staging.state.lock() = MergeState::Published(Arc::new(payload));
        staging
    }

    /// Creates staging whose first shard already holds `payload`.
    ///
    /// Used when restoring a slice that was still being built.
    #[must_use]
    pub fn prefilled(workers: usize, payload: P) -> Self {
        let staging = Self::new(workers.max(1));
        *staging.shards[0].payload.lock() = Some(payload);
        staging
    }

    /// Returns the number of worker shards.
    #[must_use]
    pub fn workers(&self) -> usize {
        self.shards.len()
    }

    /// Returns how many workers have not contributed yet.
    #[must_use]
    pub fn remaining(&self) -> usize {
        self.remaining.load(Ordering::Acquire)
    }

    /// Returns true once no further records are accepted.
    #[must_use]
    pub fn is_sealed(&self) -> bool {
        self.sealed.load(Ordering::Acquire)
    }

    /// Stops accepting records without merging yet.
    ///
    /// Inserts already holding a shard lock complete; later ones see the seal.
    pub fn seal(&self) {
        self.sealed.store(true, Ordering::Release);
    }

    /// Returns the current merge state.
    #[must_use]
    pub fn status(&self) -> MergeStatus {
        match &*self.state.lock() {
            MergeState::Staging => MergeStatus::Staging,
            MergeState::Merging => MergeStatus::Merging,
            MergeState::Published(_) => MergeStatus::Published,
            MergeState::Failed(_) => MergeStatus::Failed,
        }
    }

    fn shard(&self, worker: WorkerId) -> Result<&Shard<P>, SliceError> {
        self.shards
            .get(worker)
            .map(|s| &**s)
            .ok_or(SliceError::UnknownWorker {
                worker,
                workers: self.shards.len(),
            })
    }

    /// Applies a record to `worker`'s shard.
    ///
    /// # Errors
    ///
    /// Returns [`SliceError::UnknownWorker`] or the payload's insert error.
    pub fn insert(
        &self,
        worker: WorkerId,
        record: P::Record,
    ) -> Result<InsertOutcome<P::Record>, SliceError> {
        let shard = self.shard(worker)?;
        let mut payload = shard.payload.lock();
        // Checked under the shard lock: the merge seals before draining shards
        if self.is_sealed() {
            return Ok(InsertOutcome::Sealed(record));
        }
        payload.get_or_insert_with(P::default).insert(record)?;
        Ok(InsertOutcome::Inserted)
    }

    /// Marks `worker`'s shard as complete. The last contributor merges.
    ///
    /// # Errors
    ///
    /// Returns [`SliceError::UnknownWorker`] or a combine error raised while
    /// merging.
    pub fn contribute(&self, worker: WorkerId) -> Result<Contribution, SliceError> {
        let shard = self.shard(worker)?;
        if shard.contributed.swap(true, Ordering::AcqRel) {
            return Ok(Contribution::AlreadyDone);
        }
        let previous =
            self.remaining
                .fetch_update(Ordering::AcqRel, Ordering::Acquire, |r| r.checked_sub(1));
        match previous {
            Ok(1) => {
                self.merge_and_publish()?;
                Ok(Contribution::Merged)
            }
            Ok(_) => Ok(Contribution::Pending),
            // Published slices start with nothing remaining
            Err(_) => Ok(Contribution::AlreadyDone),
        }
    }

    /// Returns the merged payload, merging now if no contributor has yet.
    ///
    /// # Errors
    ///
    /// Returns [`SliceError::Payload`] if combining fails, now or earlier.
    pub fn ensure_merged(&self) -> Result<Arc<P>, SliceError> {
        self.merge_and_publish()
    }

    /// Returns the merged payload if it was already published.
    #[must_use]
    pub fn merged(&self) -> Option<Arc<P>> {
        match &*self.state.lock() {
            MergeState::Published(p) => Some(Arc::clone(p)),
            _ => None,
        }
    }

    /// Combines the current state of every shard into a fresh payload without
    /// sealing or draining anything.
    ///
    /// # Errors
    ///
    /// Returns [`SliceError::Payload`] if combining fails.
    pub fn peek(&self) -> Result<P, SliceError> {
        if let Some(published) = self.merged() {
            let mut copy = P::default();
            copy.combine(&published)?;
            return Ok(copy);
        }
        let mut combined = P::default();
        for shard in &*self.shards {
            if let Some(part) = shard.payload.lock().as_ref() {
                combined.combine(part)?;
            }
        }
        Ok(combined)
    }

    fn merge_and_publish(&self) -> Result<Arc<P>, SliceError> {
        let mut state = self.state.lock();
        match &*state {
            MergeState::Published(p) => return Ok(Arc::clone(p)),
            MergeState::Failed(e) => return Err(SliceError::Payload(e.clone())),
            MergeState::Staging | MergeState::Merging => {}
        }
        *state = MergeState::Merging;
        self.sealed.store(true, Ordering::Release);

        let mut parts: Vec<P> = self
            .shards
            .iter()
            .filter_map(|shard| shard.payload.lock().take())
            .collect();

        let merged = match parts.len() {
            0 => P::default(),
            1 => parts.swap_remove(0),
            _ => {
                let mut merged = parts.swap_remove(0);
                for part in &parts {
                    if let Err(e) = merged.combine(part) {
                        *state = MergeState::Failed(e.clone());
                        return Err(SliceError::Payload(e));
                    }
                }
                merged
            }
        };

        let merged = Arc::new(merged);
        *state = MergeState::Published(Arc::clone(&merged));
        Ok(merged)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::payload::SumPayload;
    /// Payload whose combine always fails.
    #[derive(Debug, Default)]
    struct Brittle(u32);

    impl Payload for Brittle {
        type Record = u32;
        type Output = u32;

        fn insert(&mut self, record: u32) -> Result<(), PayloadError> {
            self.0 += record;
            Ok(())
        }

        fn combine(&mut self, _other: &Self) -> Result<(), PayloadError> {
            Err(PayloadError::Combine("incompatible".to_string()))
        }

        fn emit(&self) -> u32 {
            self.0
        }

        fn is_empty(&self) -> bool {
            self.0 == 0
        }
    }

    #[test]
    fn test_last_contributor_merges() {
        let staging = SliceMergeStaging::<SumPayload>::new(3);
        staging.insert(0, 1).unwrap();
        staging.insert(1, 2).unwrap();
        staging.insert(2, 3).unwrap();

        assert_eq!(staging.contribute(0).unwrap(), Contribution::Pending);
        assert_eq!(staging.contribute(0).unwrap(), Contribution::AlreadyDone);
        assert_eq!(staging.contribute(2).unwrap(), Contribution::Pending);
        assert_eq!(staging.status(), MergeStatus::Staging);
        assert_eq!(staging.contribute(1).unwrap(), Contribution::Merged);
        assert_eq!(staging.status(), MergeStatus::Published);
        assert_eq!(staging.merged().unwrap().emit(), 6);
    }

    #[test]
    fn test_forced_merge_seals() {
        let staging = SliceMergeStaging::<SumPayload>::new(2);
        staging.insert(0, 5).unwrap();
        assert_eq!(staging.ensure_merged().unwrap().emit(), 5);
        assert!(staging.is_sealed());
        assert_eq!(staging.insert(1, 7).unwrap(), InsertOutcome::Sealed(7));

        // A late contribution after a forced merge is a no-op
        staging.contribute(0).unwrap();
        assert_eq!(staging.contribute(1).unwrap(), Contribution::Merged);
        assert_eq!(staging.merged().unwrap().emit(), 5);
    }

    #[test]
    fn test_unknown_worker() {
        let staging = SliceMergeStaging::<SumPayload>::new(1);
        assert!(matches!(
            staging.insert(3, 1),
            Err(SliceError::UnknownWorker { worker: 3, workers: 1 })
        ));
    }

    #[test]
    fn test_peek_does_not_seal() {
        let staging = SliceMergeStaging::<SumPayload>::new(2);
        staging.insert(0, 2).unwrap();
        staging.insert(1, 3).unwrap();
        assert_eq!(staging.peek().unwrap().emit(), 5);
        assert!(!staging.is_sealed());
        assert_eq!(staging.insert(0, 1).unwrap(), InsertOutcome::Inserted);
    }

    #[test]
    fn test_published_staging() {
        let mut payload = SumPayload::default();
        payload.insert(9).unwrap();
        let staging = SliceMergeStaging::published(2, payload);
        assert_eq!(staging.remaining(), 0);
        assert_eq!(staging.contribute(0).unwrap(), Contribution::AlreadyDone);
        assert_eq!(staging.ensure_merged().unwrap().emit(), 9);
    }

    #[test]
    fn test_combine_failure_is_sticky() {
        let staging = SliceMergeStaging::<Brittle>::new(2);
        staging.insert(0, 1).unwrap();
        staging.insert(1, 1).unwrap();
        assert!(matches!(
            staging.ensure_merged(),
            Err(SliceError::Payload(PayloadError::Combine(_)))
        ));
        assert_eq!(staging.status(), MergeStatus::Failed);
        assert!(staging.ensure_merged().is_err());
    }

    #[test]
    fn test_concurrent_contributors_merge_once() {
        const WORKERS: usize = 8;
        let staging = SliceMergeStaging::<SumPayload>::new(WORKERS);
        let merges = AtomicUsize::new(0);
        std::thread::scope(|s| {
            for w in 0..WORKERS {
                let staging = &staging;
                let merges = &merges;
                s.spawn(move || {
                    for _ in 0..100 {
                        staging.insert(w, 1).unwrap();
                    }
                    if staging.contribute(w).unwrap() == Contribution::Merged {
                        merges.fetch_add(1, Ordering::Relaxed);
                    }
                });
            }
        });
        assert_eq!(merges.load(Ordering::Relaxed), 1);
        assert_eq!(staging.merged().unwrap().emit(), 800);
    }
}
