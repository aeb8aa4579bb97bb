//! # Slice Payloads
//!
//! A slice owns one interval's partial state. What that state is depends on
//! the operator: a running aggregate, per-key aggregates, or buffered join
//! build tuples. The slice store treats it as opaque and only uses the
//! capability set defined by [`Payload`]:
//!
//! - `insert`: fold one record into a worker's partial state
//! - `combine`: merge another partial state of the same interval (or of an
//!   adjacent slice of the same window) into this one
//! - `emit`: produce the result record of a window
//!
//! Payloads are generic parameters of the store, so every call is statically
//! dispatched.
//!
//! ## Bundled payloads
//!
//! - [`CountPayload`], [`SumPayload`], [`MinPayload`], [`MaxPayload`] and
//!   [`AvgPayload`]: non-keyed aggregates
//! - [`KeyedPayload`]: any payload, one partial state per key
//! - [`JoinBuildPayload`]: both sides of an equi-join, emitted as matched pairs

pub mod aggregate;
pub mod join;

pub use aggregate::{AvgPayload, CountPayload, KeyedPayload, MaxPayload, MinPayload, SumPayload};
pub use join::{JoinBuildPayload, JoinRecord};

use rkyv::{
    api::high::{HighDeserializer, HighSerializer, HighValidator},
    bytecheck::CheckBytes,
    rancor::Error as RkyvError,
    ser::allocator::ArenaHandle,
    util::AlignedVec,
    Archive, Deserialize as RkyvDeserialize, Serialize as RkyvSerialize,
};

/// Errors raised by payload operations.
///
/// A payload failure leaves the slice in an unknown state, so the owning
/// pipeline treats it as fatal.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PayloadError {
    /// A record was rejected by `insert`
    #[error("Insert failed: {0}")]
    Insert(String),

    /// Two partial states could not be combined
    #[error("Combine failed: {0}")]
    Combine(String),

    /// Payload bytes could not be encoded or decoded
    #[error("Payload serialization failed: {0}")]
    Serialization(String),
}

/// Partial state of one slice.
///
/// `Default` is the empty state every worker starts from.
pub trait Payload: Default + Send + Sync + 'static {
    /// Record type folded in by `insert`.
    type Record: Send;
    /// Result type produced by `emit`.
    type Output: Send;

    /// Folds one record into this partial state.
    ///
    /// # Errors
    ///
    /// Returns [`PayloadError::Insert`] if the record cannot be applied.
    fn insert(&mut self, record: Self::Record) -> Result<(), PayloadError>;

    /// Merges `other` into this partial state.
    ///
    /// # Errors
    ///
    /// Returns [`PayloadError::Combine`] if the states are incompatible.
    fn combine(&mut self, other: &Self) -> Result<(), PayloadError>;

    /// Produces the window result from this state.
    fn emit(&self) -> Self::Output;

    /// Returns true if nothing was inserted.
    fn is_empty(&self) -> bool;

    /// Approximate number of bytes of storage this payload needs.
    fn size_hint(&self) -> usize {
        std::mem::size_of::<Self>()
    }
}

/// Optional capability for payloads that can be written to checkpoints.
pub trait PayloadCodec: Payload + Sized {
    /// Encodes the payload.
    ///
    /// # Errors
    ///
    /// Returns [`PayloadError::Serialization`] on failure.
    fn encode(&self) -> Result<Vec<u8>, PayloadError>;

    /// Decodes bytes produced by [`PayloadCodec::encode`].
    ///
    /// # Errors
    ///
    /// Returns [`PayloadError::Serialization`] if the bytes are invalid.
    fn decode(bytes: &[u8]) -> Result<Self, PayloadError>;
}

/// Serializes a value with rkyv.
pub(crate) fn encode_rkyv<T>(value: &T) -> Result<Vec<u8>, PayloadError>
where
    T: for<'a> RkyvSerialize<HighSerializer<AlignedVec, ArenaHandle<'a>, RkyvError>>,
{
    rkyv::to_bytes::<RkyvError>(value)
        .map(|v| v.to_vec())
        .map_err(|e| PayloadError::Serialization(e.to_string()))
}

/// Deserializes a value written by [`encode_rkyv`].
pub(crate) fn decode_rkyv<T>(bytes: &[u8]) -> Result<T, PayloadError>
where
    T: Archive,
    T::Archived: for<'a> CheckBytes<HighValidator<'a, RkyvError>>
        + RkyvDeserialize<T, HighDeserializer<RkyvError>>,
{
    let mut aligned = AlignedVec::<16>::with_capacity(bytes.len());
    aligned.extend_from_slice(bytes);
    let archived = rkyv::access::<T::Archived, RkyvError>(&aligned)
        .map_err(|e| PayloadError::Serialization(e.to_string()))?;
    rkyv::deserialize::<T, RkyvError>(archived)
        .map_err(|e| PayloadError::Serialization(e.to_string()))
}
