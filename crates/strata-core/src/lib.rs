//! # Strata Core
//!
//! Time-based slice store and multi-origin watermark trigger engine for
//! windowed stream operators.
//!
//! This crate provides:
//! - **Time**: Buffer sequencing and the multi-origin watermark processor
//! - **Slices**: Per-interval partial state, per-worker shards, the merge
//!   barrier and the shared window/slice store
//! - **Payloads**: The `insert`/`combine`/`emit` capability plus bundled
//!   aggregation and join payloads
//! - **Handler**: The lifecycle of one window-based operator instance
//!
//! ## Design Principles
//!
//! 1. **Workers never share a hot lock** - each worker fills its own shard of a slice
//! 2. **Merge exactly once** - the last contributor (or the trigger) merges a slice
//! 3. **Gap-free output** - every triggered window gets the next sequence number
//! 4. **Correctness over liveness** - a stalled origin stalls the watermark
//!
//! ## Example
//!
//! ```rust
//! use std::sync::Arc;
//! use strata_core::handler::{TerminationType, WindowBasedOperatorHandler, WindowConfig};
//! use strata_core::memory::PooledBufferProvider;
//! use strata_core::payload::CountPayload;
//! use strata_core::time::{BufferMetaData, OriginId};
//!
//! # fn main() -> strata_core::Result<()> {
//! let origin = OriginId::new(0);
//! let config = WindowConfig::builder()
//!     .sliding(10, 5)
//!     .input_origins([origin])
//!     .build()?;
//! let handler = WindowBasedOperatorHandler::<CountPayload>::new(config)?;
//! handler.start(Arc::new(PooledBufferProvider::new(256, 64)))?;
//!
//! let mut worker = handler.worker(0)?;
//! worker.process(&BufferMetaData::single(origin, 1, 7), [(7, ())])?;
//! let out = worker.process(&BufferMetaData::single(origin, 2, 15), std::iter::empty())?;
//! drop(worker);
//!
//! // The record at 7 lands in slice [5, 10), shared by [0, 10) and [5, 15)
//! assert_eq!(out.emitted.len(), 2);
//! assert!(out.emitted.iter().all(|w| w.output == 1));
//!
//! handler.stop(TerminationType::Graceful)?;
//! # Ok(())
//! # }
//! ```

#![deny(missing_docs)]
#![deny(unsafe_code)]
#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod handler;
pub mod memory;
pub mod payload;
pub mod slice;
pub mod time;

// Re-export key types
pub use handler::{TerminationType, WindowBasedOperatorHandler, WindowConfig};
pub use slice::{SliceAssigner, WindowSliceStore};
pub use time::{MultiOriginWatermarkProcessor, Watermark};

/// Result type for strata-core operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for strata-core
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Slice store errors
    #[error("Slice error: {0}")]
    Slice(#[from] slice::SliceError),

    /// Watermark tracking errors
    #[error("Watermark error: {0}")]
    Watermark(#[from] time::WatermarkError),

    /// Payload operation errors
    #[error("Payload error: {0}")]
    Payload(#[from] payload::PayloadError),

    /// Buffer provider errors
    #[error("Allocation error: {0}")]
    Alloc(#[from] memory::AllocError),

    /// Operator lifecycle errors
    #[error("Handler error: {0}")]
    Handler(#[from] handler::HandlerError),
}
