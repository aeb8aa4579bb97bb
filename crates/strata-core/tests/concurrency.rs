//! Properties that must hold under concurrent callers.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier, Mutex};
use std::thread;

use strata_core::handler::{EmittedWindow, TerminationType, WindowBasedOperatorHandler, WindowConfig};
use strata_core::memory::PooledBufferProvider;
use strata_core::payload::CountPayload;
use strata_core::slice::{
    Slice, SliceAssigner, WindowInfo, WindowInfoAndSequenceNumber, WindowInfoState,
    WindowSliceStore,
};
use strata_core::time::{BufferMetaData, MultiOriginWatermarkProcessor, OriginId, Watermark};
fn store(size: u64, slide: u64) -> WindowSliceStore<CountPayload> {
    let assigner = SliceAssigner::new(size, slide).unwrap();
    WindowSliceStore::new(assigner, 0, 1, 1, None)
}

fn create(store: &WindowSliceStore<CountPayload>, ts: u64) {
    store
        .get_slices_or_create(ts, |start, end| Ok(vec![Slice::new(start, end, 1, None)]))
        .unwrap();
}

#[test]
fn test_concurrent_lookups_create_one_slice() {
    const THREADS: usize = 16;
    let store = store(100, 100);
    let calls = AtomicUsize::new(0);
    let barrier = Barrier::new(THREADS);

    let slices: Vec<_> = thread::scope(|s| {
        let handles: Vec<_> = (0..THREADS)
            .map(|i| {
                let (store, calls, barrier) = (&store, &calls, &barrier);
                s.spawn(move || {
                    barrier.wait();
                    let lookup = store
                        .get_slices_or_create(10 + i as u64, |start, end| {
                            calls.fetch_add(1, Ordering::SeqCst);
                            Ok(vec![Slice::new(start, end, 1, None)])
                        })
                        .unwrap();
                    Arc::clone(&lookup.slices[0])
                })
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(store.slice_count(), 1);
    assert!(slices.iter().all(|s| Arc::ptr_eq(s, &slices[0])));
    assert_eq!(store.metrics().slices_created(), 1);
}

#[test]
fn test_concurrent_triggers_fire_each_window_once() {
    const THREADS: u64 = 8;
    let store = store(10, 5);
    for ts in (0..500).step_by(5) {
        create(&store, ts);
    }

    let fired: Mutex<Vec<WindowInfoAndSequenceNumber>> = Mutex::new(Vec::new());
    thread::scope(|s| {
        for t in 0..THREADS {
            let (store, fired) = (&store, &fired);
            s.spawn(move || {
                for step in 0..60 {
                    let wm = Watermark::new(step * 10 + t);
                    let triggered = store.get_triggerable_window_slices(wm).unwrap();
                    fired.lock().unwrap().extend(triggered.into_keys());
                }
            });
        }
    });

    let mut fired = fired.into_inner().unwrap();
    fired.sort_by_key(|w| w.sequence);
    let sequences: Vec<u64> = fired.iter().map(|w| w.sequence).collect();
    assert_eq!(sequences, (1..=fired.len() as u64).collect::<Vec<_>>());

    // Sequence order follows window end order
    assert!(fired
        .windows(2)
        .all(|pair| pair[0].window.window_end < pair[1].window.window_end));
    // Windows start at 0 and the last slice [495, 500) ends [495, 505)
    assert_eq!(fired.len(), 100);
    assert_eq!(fired[0].window, WindowInfo::new(0, 10));
    assert_eq!(fired.last().unwrap().window, WindowInfo::new(495, 505));
    assert_eq!(store.metrics().windows_triggered(), fired.len() as u64);
}

#[test]
fn test_gc_keeps_slices_of_building_windows() {
    let store = store(30, 10);
    for ts in (0..200).step_by(10) {
        create(&store, ts);
    }

    for wm in (0..=200).step_by(7) {
        let wm = Watermark::new(wm);
        store.get_triggerable_window_slices(wm).unwrap();
        store.garbage_collect_slices_and_windows(wm);

        for end in (10..=200).step_by(10) {
            let windows = store.assigner().windows_containing(end - 10, end);
            let needed = windows
                .iter()
                .any(|w| store.window_state(w) == Some(WindowInfoState::Building));
            if needed {
                assert!(
                    store.get_slice_by_slice_end(end).is_some(),
                    "slice ending at {end} reclaimed at watermark {}",
                    wm.timestamp()
                );
            }
        }
    }
}

#[test]
fn test_replayed_updates_are_idempotent() {
    let origins = [OriginId::new(0), OriginId::new(1)];
    let processor = MultiOriginWatermarkProcessor::new(&origins, 8).unwrap();
    let a1 = BufferMetaData::single(origins[0], 1, 40);
    let b1 = BufferMetaData::single(origins[1], 1, 25);

    processor.update_watermark(&a1).unwrap();
    processor.update_watermark(&b1).unwrap();
    let watermark = processor.current_watermark();
    assert_eq!(watermark, Watermark::new(25));

    thread::scope(|s| {
        for _ in 0..4 {
            let processor = &processor;
            s.spawn(move || {
                for _ in 0..100 {
                    processor.update_watermark(&a1).unwrap();
                    processor.update_watermark(&b1).unwrap();
                }
            });
        }
    });
    assert_eq!(processor.current_watermark(), watermark);
    assert_eq!(processor.metrics().duplicates_ignored(), 800);
}

/// Delivers `1..=n` in blocks of four, each block in reverse order.
fn scrambled(n: u64) -> Vec<u64> {
    let mut order: Vec<u64> = (1..=n).collect();
    for block in order.chunks_mut(4) {
        block.reverse();
    }
    order
}

#[test]
fn test_global_watermark_is_monotonic() {
    const ORIGINS: u64 = 10;
    const BUFFERS: u64 = 400;
    let origins: Vec<OriginId> = (0..ORIGINS).map(OriginId::new).collect();
    let processor = MultiOriginWatermarkProcessor::new(&origins, 8).unwrap();
    let done = AtomicUsize::new(0);
    let writers = origins.len();

    thread::scope(|s| {
        for &origin in &origins {
            let (processor, done) = (&processor, &done);
            s.spawn(move || {
                for seq in scrambled(BUFFERS) {
                    let meta = BufferMetaData::single(origin, seq, seq * 10 + origin.as_u64());
                    processor.update_watermark(&meta).unwrap();
                }
                done.fetch_add(1, Ordering::SeqCst);
            });
        }

        let (processor, done) = (&processor, &done);
        s.spawn(move || {
            let mut last = Watermark::MIN;
            while done.load(Ordering::SeqCst) < writers {
                let current = processor.current_watermark();
                assert!(current >= last, "watermark went back from {last:?} to {current:?}");
                last = current;
            }
        });
    });

    // The slowest origin is origin 0
    assert_eq!(processor.current_watermark(), Watermark::new(BUFFERS * 10));
}

#[test]
fn test_parallel_workers_emit_every_record_once() {
    const WORKERS: usize = 4;
    const BUFFERS: u64 = 50;
    const RECORDS: u64 = 10;
    let origins: Vec<OriginId> = (0..WORKERS as u64).map(OriginId::new).collect();
    let handler = WindowBasedOperatorHandler::<CountPayload>::new(
        WindowConfig::builder()
            .sliding(40, 20)
            .workers(WORKERS)
            .input_origins(origins.clone())
            .build()
            .unwrap(),
    )
    .unwrap();
    handler
        .start(Arc::new(PooledBufferProvider::new(64, 4096)))
        .unwrap();

    let emitted: Mutex<Vec<EmittedWindow<u64>>> = Mutex::new(Vec::new());
    thread::scope(|s| {
        for (w, &origin) in origins.iter().enumerate() {
            let (handler, emitted) = (&handler, &emitted);
            s.spawn(move || {
                let mut worker = handler.worker(w).unwrap();
                for seq in 1..=BUFFERS {
                    // Buffer `seq` covers [10 * (seq - 1), 10 * seq) and every
                    // record is at or after its watermark
                    let base = 10 * (seq - 1);
                    let records = (0..RECORDS).map(|i| (base + i, ()));
                    let out = worker
                        .process(&BufferMetaData::single(origin, seq, base), records)
                        .unwrap();
                    assert_eq!(out.build.inserted as u64, RECORDS);
                    emitted.lock().unwrap().extend(out.emitted);
                }
            });
        }
    });
    let rest = handler.stop(TerminationType::Graceful).unwrap();
    let mut emitted = emitted.into_inner().unwrap();
    emitted.extend(rest);

    emitted.sort_by_key(EmittedWindow::sequence_number);
    let sequences: Vec<u64> = emitted.iter().map(EmittedWindow::sequence_number).collect();
    assert_eq!(sequences, (1..=emitted.len() as u64).collect::<Vec<_>>());

    // Every record lands in two windows, except the first slice [0, 20)
    // which only [0, 40) contains
    let workers = WORKERS as u64;
    let total: u64 = emitted.iter().map(|w| w.output).sum();
    assert_eq!(total, 2 * workers * BUFFERS * RECORDS - workers * 2 * RECORDS);
    assert!(emitted
        .iter()
        .all(|w| w.meta.watermark_ts == w.window.window_end));
    assert_eq!(handler.metrics().late_records_dropped(), 0);
}
