//! Slice store benchmarks
//!
//! Measures:
//! - Slice assignment
//! - Lookup of an existing slice (read-lock fast path)
//! - Lookup that creates a slice
//! - Trigger + GC of a window range
//! - One full build/close cycle through the operator handler
//!
//! Run with: cargo bench --bench slice_store_bench

use std::sync::Arc;

use criterion::{
    black_box, criterion_group, criterion_main, BatchSize, BenchmarkId, Criterion, Throughput,
};
use strata_core::handler::{TerminationType, WindowBasedOperatorHandler, WindowConfig};
use strata_core::memory::PooledBufferProvider;
use strata_core::payload::CountPayload;
use strata_core::slice::{Slice, SliceAssigner, WindowSliceStore};
use strata_core::time::{BufferMetaData, OriginId, Watermark};
fn populated_store(size: u64, slide: u64, slices: u64) -> WindowSliceStore<CountPayload> {
    let assigner = SliceAssigner::new(size, slide).unwrap();
    let store = WindowSliceStore::new(assigner, 0, 1, 1, None);
    let len = assigner.slice_len();
    for i in 0..slices {
        store
            .get_slices_or_create(i * len, |start, end| Ok(vec![Slice::new(start, end, 1, None)]))
            .unwrap();
    }
    store
}

fn bench_assign(c: &mut Criterion) {
    let mut group = c.benchmark_group("slice_assign");
    group.throughput(Throughput::Elements(1));

    for (size, slide) in [(1000u64, 1000u64), (1000, 250), (1000, 300)] {
        let assigner = SliceAssigner::new(size, slide).unwrap();
        group.bench_with_input(
            BenchmarkId::new("windows_containing", format!("{size}/{slide}")),
            &assigner,
            |b, assigner| {
                let mut ts = 0u64;
                b.iter(|| {
                    let start = assigner.slice_start_of(black_box(ts));
                    let end = assigner.slice_end_of(ts);
                    ts += 7;
                    black_box(assigner.windows_containing(start, end))
                })
            },
        );
    }

    group.finish();
}

fn bench_lookup(c: &mut Criterion) {
    let mut group = c.benchmark_group("slice_lookup");
    group.throughput(Throughput::Elements(1));

    for slices in [16u64, 1024] {
        let store = populated_store(100, 100, slices);
        group.bench_with_input(BenchmarkId::new("existing", slices), &store, |b, store| {
            let mut ts = 0u64;
            b.iter(|| {
                let lookup = store
                    .get_slices_or_create(black_box(ts), |_, _| unreachable!())
                    .unwrap();
                ts = (ts + 37) % (slices * 100);
                black_box(lookup)
            })
        });
    }

    group.bench_function("create", |b| {
        b.iter_batched(
            || populated_store(100, 100, 0),
            |store| {
                for i in 0..100u64 {
                    store
                        .get_slices_or_create(i * 100, |start, end| {
                            Ok(vec![Slice::new(start, end, 1, None)])
                        })
                        .unwrap();
                }
                black_box(store)
            },
            BatchSize::SmallInput,
        )
    });

    group.finish();
}

fn bench_trigger(c: &mut Criterion) {
    let mut group = c.benchmark_group("slice_trigger");

    for (size, slide) in [(100u64, 100u64), (100, 25)] {
        let store_slices = 400;
        group.throughput(Throughput::Elements(store_slices));
        group.bench_function(BenchmarkId::new("trigger_and_gc", format!("{size}/{slide}")), |b| {
            b.iter_batched(
                || populated_store(size, slide, store_slices),
                |store| {
                    let wm = Watermark::new(u64::MAX / 2);
                    let triggered = store.get_triggerable_window_slices(wm).unwrap();
                    let gc = store.garbage_collect_slices_and_windows(wm);
                    black_box((triggered, gc))
                },
                BatchSize::SmallInput,
            )
        });
    }

    group.finish();
}

fn bench_handler_cycle(c: &mut Criterion) {
    let mut group = c.benchmark_group("handler_cycle");
    const RECORDS: u64 = 1000;
    group.throughput(Throughput::Elements(RECORDS));

    group.bench_function("build_close_1000", |b| {
        b.iter_batched(
            || {
                let origin = OriginId::new(0);
                let config = WindowConfig::builder()
                    .sliding(100, 50)
                    .input_origins([origin])
                    .build()
                    .unwrap();
                let handler = WindowBasedOperatorHandler::<CountPayload>::new(config).unwrap();
                handler
                    .start(Arc::new(PooledBufferProvider::new(64, 1024)))
                    .unwrap();
                handler
            },
            |handler| {
                let origin = OriginId::new(0);
                {
                    let mut worker = handler.worker(0).unwrap();
                    let records = (0..RECORDS).map(|ts| (ts, ()));
                    worker
                        .process(&BufferMetaData::single(origin, 1, 0), records)
                        .unwrap();
                    let out = worker
                        .close_buffer(&BufferMetaData::single(origin, 2, RECORDS))
                        .unwrap();
                    black_box(out);
                }
                black_box(handler.stop(TerminationType::Graceful).unwrap())
            },
            BatchSize::SmallInput,
        )
    });

    group.finish();
}

criterion_group!(
    benches,
    bench_assign,
    bench_lookup,
    bench_trigger,
    bench_handler_cycle,
);
criterion_main!(benches);
