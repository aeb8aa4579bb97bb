//! Strata workload simulator
//!
//! Replays a synthetic multi-origin stream through a window operator on a
//! fixed pool of worker threads and reports what was emitted.

mod workload;

use std::sync::Arc;
use std::thread;
use std::time::Instant;

use anyhow::{bail, Context, Result};
use clap::{Parser, ValueEnum};
use serde::Serialize;
use strata_core::handler::{
    HandlerMetricsSnapshot, TerminationType, WindowBasedOperatorHandler, WindowConfig,
};
use strata_core::memory::PooledBufferProvider;
use strata_core::payload::CountPayload;
use strata_core::slice::StoreMetricsSnapshot;
use strata_core::time::{OriginId, WatermarkMetricsSnapshot};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::workload::{origin_stream, WorkloadSpec};
/// How the run ends.
#[derive(Debug, Clone, Copy, ValueEnum)]
enum Termination {
    /// Finish every origin and emit the remaining windows
    Graceful,
    /// Stop without emitting pending windows
    Forceful,
}

impl From<Termination> for TerminationType {
    fn from(t: Termination) -> Self {
        match t {
            Termination::Graceful => TerminationType::Graceful,
            Termination::Forceful => TerminationType::Forceful,
        }
    }
}

/// Strata - windowed aggregation over multi-origin streams
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Window length
    #[arg(long, default_value_t = 1000)]
    window_size: u64,

    /// Window slide (defaults to the window length)
    #[arg(long)]
    window_slide: Option<u64>,

    /// Grace period after a window's end
    #[arg(long, default_value_t = 0)]
    allowed_lateness: u64,

    /// Worker threads (defaults to the number of CPUs)
    #[arg(long, env = "STRATA_WORKERS")]
    workers: Option<usize>,

    /// Number of input origins
    #[arg(long, default_value_t = 4)]
    origins: u64,

    /// Events generated per origin
    #[arg(long, default_value_t = 100_000)]
    events_per_origin: u64,

    /// Events per buffer
    #[arg(long, default_value_t = 100)]
    events_per_buffer: u64,

    /// Event time distance between consecutive events
    #[arg(long, default_value_t = 10)]
    event_interval: u64,

    /// Largest backwards jitter of an event and the watermark bound
    #[arg(long, default_value_t = 0)]
    max_out_of_orderness: u64,

    /// Buffers of one origin shuffled together before delivery
    #[arg(long, default_value_t = 1)]
    reorder_depth: usize,

    /// Seed for jitter and shuffling
    #[arg(long, default_value_t = 42)]
    seed: u64,

    /// Slice storage handles in the pool
    #[arg(long, default_value_t = 65_536)]
    pool_capacity: usize,

    /// How the run ends
    #[arg(long, value_enum, default_value_t = Termination::Graceful)]
    termination: Termination,

    /// Log level
    #[arg(long, default_value = "info")]
    log_level: String,
}

/// Per-thread tallies.
#[derive(Debug, Default, Clone, Copy)]
struct Tally {
    windows: u64,
    results: u64,
    late: u64,
}

impl std::ops::AddAssign for Tally {
    fn add_assign(&mut self, other: Self) {
        self.windows += other.windows;
        self.results += other.results;
        self.late += other.late;
    }
}

/// Summary printed as JSON at the end of a run.
#[derive(Debug, Serialize)]
struct Report {
    workers: usize,
    origins: u64,
    elapsed_ms: u128,
    windows_emitted: u64,
    counted_records: u64,
    late_records: u64,
    handler: HandlerMetricsSnapshot,
    store: StoreMetricsSnapshot,
    build_watermarks: WatermarkMetricsSnapshot,
    probe_watermarks: WatermarkMetricsSnapshot,
}

fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("strata_core={0},strata_sim={0}", args.log_level).into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting strata simulator");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let report = run(&args)?;
    let json = serde_json::to_string_pretty(&report).context("failed to encode report")?;
    println!("{json}");
    Ok(())
}

fn run(args: &Args) -> Result<Report> {
    if args.origins == 0 {
        bail!("at least one origin is required");
    }
    let workers = args.workers.unwrap_or_else(num_cpus::get).max(1);
    let origins: Vec<OriginId> = (0..args.origins).map(OriginId::new).collect();
    let config = WindowConfig::builder()
        .sliding(args.window_size, args.window_slide.unwrap_or(args.window_size))
        .allowed_lateness(args.allowed_lateness)
        .workers(workers)
        .input_origins(origins.clone())
        .max_pending_sequences(args.reorder_depth.max(1))
        .build()
        .context("invalid window configuration")?;

    let spec = WorkloadSpec {
        events_per_origin: args.events_per_origin,
        events_per_buffer: args.events_per_buffer,
        event_interval: args.event_interval,
        max_out_of_orderness: args.max_out_of_orderness,
        reorder_depth: args.reorder_depth,
    };

    let handler = WindowBasedOperatorHandler::<CountPayload>::new(config)
        .context("failed to create window operator")?;
    handler
        .start(Arc::new(PooledBufferProvider::new(64, args.pool_capacity)))
        .context("failed to start window operator")?;
    info!(workers, origins = args.origins, "operator running");

    let graceful = matches!(args.termination, Termination::Graceful);
    let started = Instant::now();
    let mut tally = thread::scope(|s| -> Result<Tally> {
        let handles: Vec<_> = (0..workers)
            .map(|w| {
                let owned: Vec<OriginId> = origins
                    .iter()
                    .copied()
                    .filter(|o| o.as_u64() as usize % workers == w)
                    .collect();
                let (handler, spec) = (&handler, &spec);
                s.spawn(move || drive_worker(handler, w, &owned, spec, args.seed, graceful))
            })
            .collect();

        let mut total = Tally::default();
        for handle in handles {
            match handle.join() {
                Ok(result) => total += result?,
                Err(_) => bail!("worker thread panicked"),
            }
        }
        Ok(total)
    })?;

    let rest = handler
        .stop(args.termination.into())
        .context("failed to stop window operator")?;
    tally += count(&rest);
    let elapsed = started.elapsed();
    info!(
        windows = tally.windows,
        elapsed_ms = elapsed.as_millis(),
        "run complete"
    );

    let store = handler
        .slice_store()
        .map(|store| store.metrics().snapshot())
        .unwrap_or_default();
    Ok(Report {
        workers,
        origins: args.origins,
        elapsed_ms: elapsed.as_millis(),
        windows_emitted: tally.windows,
        counted_records: tally.results,
        late_records: tally.late,
        handler: handler.metrics().snapshot(),
        store,
        build_watermarks: handler.build_watermarks().metrics().snapshot(),
        probe_watermarks: handler.probe_watermarks().metrics().snapshot(),
    })
}

/// Feeds the streams of `owned` through worker `w`, interleaving origins
/// buffer by buffer.
fn drive_worker(
    handler: &WindowBasedOperatorHandler<CountPayload>,
    w: usize,
    owned: &[OriginId],
    spec: &WorkloadSpec,
    seed: u64,
    finish: bool,
) -> Result<Tally> {
    let mut worker = handler
        .worker(w)
        .with_context(|| format!("failed to claim worker {w}"))?;
    let streams: Vec<_> = owned
        .iter()
        .map(|&origin| origin_stream(origin, spec, seed))
        .collect();
    let longest = streams.iter().map(Vec::len).max().unwrap_or(0);

    let mut tally = Tally::default();
    for i in 0..longest {
        for buffer in streams.iter().filter_map(|stream| stream.get(i)) {
            let records = buffer.events.iter().map(|&ts| (ts, ()));
            let out = worker
                .process(&buffer.meta, records)
                .with_context(|| format!("worker {w} failed on {:?}", buffer.meta))?;
            tally.late += (out.build.dropped + out.build.late.len()) as u64;
            tally += count(&out.emitted);
        }
    }
    drop(worker);

    if finish {
        for &origin in owned {
            let flushed = handler
                .origin_finished(origin)
                .with_context(|| format!("failed to finish origin {origin}"))?;
            tally += count(&flushed);
        }
    }
    Ok(tally)
}

fn count(windows: &[strata_core::handler::EmittedWindow<u64>]) -> Tally {
    Tally {
        windows: windows.len() as u64,
        results: windows.iter().map(|w| w.output).sum(),
        late: 0,
    }
}
