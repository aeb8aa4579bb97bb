//! Aggregation payloads.
//!
//! Each built-in aggregate is a [`Payload`] of its own: a worker folds
//! records into its shard with `insert`, the merge stage folds shards and
//! the slices of a window together with `combine`. [`KeyedPayload`] lifts any
//! payload to one partial state per key.

use std::hash::Hash;

use fxhash::FxHashMap;
use rkyv::{
    api::high::{HighDeserializer, HighSerializer, HighValidator},
    bytecheck::CheckBytes,
    rancor::Error as RkyvError,
    ser::allocator::ArenaHandle,
    util::AlignedVec,
    Archive, Deserialize as RkyvDeserialize, Serialize as RkyvSerialize,
};

use super::{decode_rkyv, encode_rkyv, Payload, PayloadCodec, PayloadError};

/// Number of records in the slice.
///
/// # Example
///
/// ```rust
/// use strata_core::payload::{CountPayload, Payload};
///
/// let mut left = CountPayload::default();
/// left.insert(()).unwrap();
/// let mut right = CountPayload::default();
/// right.insert(()).unwrap();
/// right.insert(()).unwrap();
///
/// left.combine(&right).unwrap();
/// assert_eq!(left.emit(), 3);
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Archive, RkyvSerialize, RkyvDeserialize)]
pub struct CountPayload {
    count: u64,
}

impl Payload for CountPayload {
    type Record = ();
    type Output = u64;

    fn insert(&mut self, (): ()) -> Result<(), PayloadError> {
        self.count += 1;
        Ok(())
    }

    fn combine(&mut self, other: &Self) -> Result<(), PayloadError> {
        self.count += other.count;
        Ok(())
    }

    fn emit(&self) -> u64 {
        self.count
    }

    fn is_empty(&self) -> bool {
        self.count == 0
    }
}

/// Saturating sum of `i64` records.
#[derive(Debug, Clone, Default, PartialEq, Eq, Archive, RkyvSerialize, RkyvDeserialize)]
pub struct SumPayload {
    sum: i64,
    records: u64,
}

impl Payload for SumPayload {
    type Record = i64;
    type Output = i64;

    fn insert(&mut self, value: i64) -> Result<(), PayloadError> {
        self.sum = self.sum.saturating_add(value);
        self.records += 1;
        Ok(())
    }

    fn combine(&mut self, other: &Self) -> Result<(), PayloadError> {
        self.sum = self.sum.saturating_add(other.sum);
        self.records += other.records;
        Ok(())
    }

    fn emit(&self) -> i64 {
        self.sum
    }

    fn is_empty(&self) -> bool {
        self.records == 0
    }
}

/// Smallest `i64` record; `None` for an empty window.
#[derive(Debug, Clone, Default, PartialEq, Eq, Archive, RkyvSerialize, RkyvDeserialize)]
pub struct MinPayload(Option<i64>);

impl Payload for MinPayload {
    type Record = i64;
    type Output = Option<i64>;

    fn insert(&mut self, value: i64) -> Result<(), PayloadError> {
        self.0 = Some(self.0.map_or(value, |m| m.min(value)));
        Ok(())
    }

    fn combine(&mut self, other: &Self) -> Result<(), PayloadError> {
        self.0 = match (self.0, other.0) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        };
        Ok(())
    }

    fn emit(&self) -> Option<i64> {
        self.0
    }

    fn is_empty(&self) -> bool {
        self.0.is_none()
    }
}

/// Largest `i64` record; `None` for an empty window.
#[derive(Debug, Clone, Default, PartialEq, Eq, Archive, RkyvSerialize, RkyvDeserialize)]
pub struct MaxPayload(Option<i64>);

impl Payload for MaxPayload {
    type Record = i64;
    type Output = Option<i64>;

    fn insert(&mut self, value: i64) -> Result<(), PayloadError> {
        self.0 = Some(self.0.map_or(value, |m| m.max(value)));
        Ok(())
    }

    fn combine(&mut self, other: &Self) -> Result<(), PayloadError> {
        self.0 = match (self.0, other.0) {
            (Some(a), Some(b)) => Some(a.max(b)),
            (a, b) => a.or(b),
        };
        Ok(())
    }

    fn emit(&self) -> Option<i64> {
        self.0
    }

    fn is_empty(&self) -> bool {
        self.0.is_none()
    }
}

/// Mean of `i64` records, kept as a running sum and count so that partial
/// states combine exactly.
#[derive(Debug, Clone, Default, PartialEq, Eq, Archive, RkyvSerialize, RkyvDeserialize)]
pub struct AvgPayload {
    sum: i64,
    records: u64,
}

impl Payload for AvgPayload {
    type Record = i64;
    type Output = Option<f64>;

    fn insert(&mut self, value: i64) -> Result<(), PayloadError> {
        self.sum = self.sum.saturating_add(value);
        self.records += 1;
        Ok(())
    }

    fn combine(&mut self, other: &Self) -> Result<(), PayloadError> {
        self.sum = self.sum.saturating_add(other.sum);
        self.records += other.records;
        Ok(())
    }

    #[allow(clippy::cast_precision_loss)]
    fn emit(&self) -> Option<f64> {
        (self.records > 0).then(|| self.sum as f64 / self.records as f64)
    }

    fn is_empty(&self) -> bool {
        self.records == 0
    }
}

/// Checkpoints the whole payload struct as one rkyv archive.
macro_rules! rkyv_codec {
    ($($payload:ty),+ $(,)?) => {
        $(
            impl PayloadCodec for $payload {
                fn encode(&self) -> Result<Vec<u8>, PayloadError> {
                    encode_rkyv(self)
                }

                fn decode(bytes: &[u8]) -> Result<Self, PayloadError> {
                    decode_rkyv::<Self>(bytes)
                }
            }
        )+
    };
}

rkyv_codec!(CountPayload, SumPayload, MinPayload, MaxPayload, AvgPayload);

/// One partial state of `P` per key.
///
/// Records are `(key, record)` pairs. `emit` returns the per-key results
/// sorted by key.
///
/// # Example
///
/// ```rust
/// use strata_core::payload::{KeyedPayload, Payload, SumPayload};
///
/// let mut shard = KeyedPayload::<&str, SumPayload>::default();
/// shard.insert(("b", 2)).unwrap();
/// shard.insert(("a", 1)).unwrap();
/// shard.insert(("b", 5)).unwrap();
/// assert_eq!(shard.emit(), vec![("a", 1), ("b", 7)]);
/// ```
#[derive(Debug, Clone)]
pub struct KeyedPayload<K, P> {
    groups: FxHashMap<K, P>,
}

impl<K, P> Default for KeyedPayload<K, P> {
    fn default() -> Self {
        Self {
            groups: FxHashMap::default(),
        }
    }
}

impl<K: Eq + Hash, P> KeyedPayload<K, P> {
    /// Returns the number of distinct keys.
    #[must_use]
    pub fn key_count(&self) -> usize {
        self.groups.len()
    }

    /// Returns the partial state of one key.
    #[must_use]
    pub fn get(&self, key: &K) -> Option<&P> {
        self.groups.get(key)
    }
}

impl<K, P> Payload for KeyedPayload<K, P>
where
    K: Eq + Hash + Ord + Clone + Send + Sync + 'static,
    P: Payload + Clone,
{
    type Record = (K, P::Record);
    type Output = Vec<(K, P::Output)>;

    fn insert(&mut self, (key, record): (K, P::Record)) -> Result<(), PayloadError> {
        self.groups.entry(key).or_default().insert(record)
    }

    fn combine(&mut self, other: &Self) -> Result<(), PayloadError> {
        for (key, state) in &other.groups {
            match self.groups.get_mut(key) {
                Some(existing) => existing.combine(state)?,
                None => {
                    self.groups.insert(key.clone(), state.clone());
                }
            }
        }
        Ok(())
    }

    fn emit(&self) -> Vec<(K, P::Output)> {
        let mut results: Vec<_> = self
            .groups
            .iter()
            .map(|(k, state)| (k.clone(), state.emit()))
            .collect();
        results.sort_unstable_by(|a, b| a.0.cmp(&b.0));
        results
    }

    fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }

    fn size_hint(&self) -> usize {
        self.groups
            .values()
            .map(|state| std::mem::size_of::<K>() + state.size_hint())
            .sum()
    }
}

/// Keys are archived next to each key's own encoded state, so any
/// checkpointable payload can be keyed.
impl<K, P> PayloadCodec for KeyedPayload<K, P>
where
    K: Eq + Hash + Ord + Clone + Send + Sync + 'static,
    P: PayloadCodec + Clone,
    Vec<(K, Vec<u8>)>: for<'a> RkyvSerialize<HighSerializer<AlignedVec, ArenaHandle<'a>, RkyvError>>,
    <Vec<(K, Vec<u8>)> as Archive>::Archived: for<'a> CheckBytes<HighValidator<'a, RkyvError>>
        + RkyvDeserialize<Vec<(K, Vec<u8>)>, HighDeserializer<RkyvError>>,
{
    fn encode(&self) -> Result<Vec<u8>, PayloadError> {
        let mut entries = self
            .groups
            .iter()
            .map(|(k, state)| Ok((k.clone(), state.encode()?)))
            .collect::<Result<Vec<_>, PayloadError>>()?;
        entries.sort_unstable_by(|a, b| a.0.cmp(&b.0));
        encode_rkyv(&entries)
    }

    fn decode(bytes: &[u8]) -> Result<Self, PayloadError> {
        let groups = decode_rkyv::<Vec<(K, Vec<u8>)>>(bytes)?
            .into_iter()
            .map(|(k, state)| Ok((k, P::decode(&state)?)))
            .collect::<Result<_, PayloadError>>()?;
        Ok(Self { groups })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fold<P: Payload>(records: impl IntoIterator<Item = P::Record>) -> P {
        let mut payload = P::default();
        for record in records {
            payload.insert(record).unwrap();
        }
        payload
    }

    #[test]
    fn test_count_combines_shards() {
        let mut a: CountPayload = fold([(), ()]);
        assert!(!a.is_empty());
        a.combine(&fold([()])).unwrap();
        assert_eq!(a.emit(), 3);
        assert!(CountPayload::default().is_empty());
    }

    #[test]
    fn test_sum_min_max_avg() {
        let values = [4, -2, 10];
        assert_eq!(fold::<SumPayload>(values).emit(), 12);
        assert_eq!(fold::<MinPayload>(values).emit(), Some(-2));
        assert_eq!(fold::<MaxPayload>(values).emit(), Some(10));
        assert_eq!(fold::<AvgPayload>(values).emit(), Some(4.0));
        assert_eq!(AvgPayload::default().emit(), None);
    }

    #[test]
    fn test_sum_of_zeroes_is_not_empty() {
        let sum: SumPayload = fold([0]);
        assert!(!sum.is_empty());
        assert_eq!(sum.emit(), 0);
    }

    #[test]
    fn test_min_max_combine_with_empty() {
        let mut min: MinPayload = fold([3]);
        min.combine(&MinPayload::default()).unwrap();
        assert_eq!(min.emit(), Some(3));

        let mut max = MaxPayload::default();
        max.combine(&fold([-7, -9])).unwrap();
        assert_eq!(max.emit(), Some(-7));
    }

    #[test]
    fn test_avg_combines_exactly() {
        let mut a: AvgPayload = fold([1, 2]);
        a.combine(&fold([6])).unwrap();
        assert_eq!(a.emit(), Some(3.0));
    }

    #[test]
    fn test_codec() {
        let max: MaxPayload = fold([9, 3]);
        assert_eq!(MaxPayload::decode(&max.encode().unwrap()).unwrap(), max);
        let avg: AvgPayload = fold([1, 4]);
        assert_eq!(AvgPayload::decode(&avg.encode().unwrap()).unwrap(), avg);
    }

    #[test]
    fn test_keyed_groups_and_sorts() {
        let mut a: KeyedPayload<u32, CountPayload> = fold([(2, ()), (1, ()), (2, ())]);
        let b: KeyedPayload<u32, CountPayload> = fold([(3, ()), (1, ())]);

        a.combine(&b).unwrap();
        assert_eq!(a.key_count(), 3);
        assert_eq!(a.get(&2).map(Payload::emit), Some(2));
        assert_eq!(a.emit(), vec![(1, 2), (2, 2), (3, 1)]);
    }

    #[test]
    fn test_keyed_codec_nests_inner_codec() {
        let keyed: KeyedPayload<u64, MinPayload> = fold([(7, 10), (8, -1), (7, 4)]);
        let decoded = KeyedPayload::<u64, MinPayload>::decode(&keyed.encode().unwrap()).unwrap();
        assert_eq!(decoded.emit(), vec![(7, Some(4)), (8, Some(-1))]);
    }

    #[test]
    fn test_decode_garbage_fails() {
        assert!(matches!(
            CountPayload::decode(&[0xff]),
            Err(PayloadError::Serialization(_))
        ));
    }
}
