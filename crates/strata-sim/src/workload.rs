//! Synthetic per-origin buffer streams.

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use strata_core::time::{BufferMetaData, OriginId, Timestamp};

/// Shape of the generated stream.
#[derive(Debug, Clone, Copy)]
pub struct WorkloadSpec {
    /// Events generated per origin
    pub events_per_origin: u64,
    /// Events carried by one buffer
    pub events_per_buffer: u64,
    /// Event time distance between consecutive events
    pub event_interval: u64,
    /// Largest distance an event may trail the newest event seen
    pub max_out_of_orderness: u64,
    /// Buffers shuffled together before delivery (1 = in order)
    pub reorder_depth: usize,
}

/// One buffer as delivered to a worker.
#[derive(Debug, Clone)]
pub struct SimBuffer {
    pub meta: BufferMetaData,
    pub events: Vec<Timestamp>,
}

/// Generates the buffers of one origin in delivery order.
///
/// Event times jitter backwards by up to `max_out_of_orderness`. Each buffer
/// carries a bounded out-of-orderness watermark: the newest event time seen
/// so far minus the bound.
pub fn origin_stream(origin: OriginId, spec: &WorkloadSpec, seed: u64) -> Vec<SimBuffer> {
    let mut rng = StdRng::seed_from_u64(seed ^ origin.as_u64().rotate_left(32));
    let per_buffer = spec.events_per_buffer.max(1);

    let mut buffers = Vec::new();
    let mut newest = 0;
    let mut sequence = 0;
    let mut generated = 0;
    while generated < spec.events_per_origin {
        let count = per_buffer.min(spec.events_per_origin - generated);
        let events: Vec<Timestamp> = (generated..generated + count)
            .map(|i| {
                let ts = i * spec.event_interval;
                ts.saturating_sub(rng.gen_range(0..=spec.max_out_of_orderness))
            })
            .collect();
        generated += count;

        newest = events.iter().copied().fold(newest, Timestamp::max);
        sequence += 1;
        let watermark = newest.saturating_sub(spec.max_out_of_orderness);
        buffers.push(SimBuffer {
            meta: BufferMetaData::single(origin, sequence, watermark),
            events,
        });
    }

    if spec.reorder_depth > 1 {
        for block in buffers.chunks_mut(spec.reorder_depth) {
            block.shuffle(&mut rng);
        }
    }
    buffers
}
