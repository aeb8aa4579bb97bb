//! Join build payload: buffered tuples of both join sides.

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

/// One build-side tuple of a two-sided equi-join.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JoinRecord<K, L, R> {
    /// Tuple of the left input
    Left(K, L),
    /// Tuple of the right input
    Right(K, R),
}

/// Buffered join build state of one slice.
///
/// Both sides are kept per key. Emitting a window produces every
/// `(key, left, right)` combination whose keys match, ordered by key and then
/// by insertion order within a side.
///
/// # Example
///
/// ```rust
/// use strata_core::payload::{JoinBuildPayload, JoinRecord, Payload};
///
/// let mut build = JoinBuildPayload::<u32, &str, i64>::default();
/// build.insert(JoinRecord::Left(1, "a")).unwrap();
/// build.insert(JoinRecord::Right(1, 10)).unwrap();
/// build.insert(JoinRecord::Right(2, 20)).unwrap();
///
/// assert_eq!(build.emit(), vec![(1, "a", 10)]);
/// ```
#[derive(Debug, Clone)]
pub struct JoinBuildPayload<K, L, R> {
    left: FxHashMap<K, Vec<L>>,
    right: FxHashMap<K, Vec<R>>,
    tuples: usize,
}

impl<K, L, R> Default for JoinBuildPayload<K, L, R> {
    fn default() -> Self {
        Self {
            left: FxHashMap::default(),
            right: FxHashMap::default(),
            tuples: 0,
        }
    }
}

impl<K, L, R> JoinBuildPayload<K, L, R> {
    /// Returns the number of buffered tuples over both sides.
    #[must_use]
    pub fn tuple_count(&self) -> usize {
        self.tuples
    }
}

/// Appends `other`'s per-key tuples after the existing ones.
fn append_side<K, V>(into: &mut FxHashMap<K, Vec<V>>, other: &FxHashMap<K, Vec<V>>)
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    for (key, values) in other {
        into.entry(key.clone())
            .or_default()
            .extend(values.iter().cloned());
    }
}

impl<K, L, R> Payload for JoinBuildPayload<K, L, R>
where
    K: Eq + Hash + Ord + Clone + Send + Sync + 'static,
    L: Clone + Send + Sync + 'static,
    R: Clone + Send + Sync + 'static,
{
    type Record = JoinRecord<K, L, R>;
    type Output = Vec<(K, L, R)>;

    fn insert(&mut self, record: JoinRecord<K, L, R>) -> Result<(), PayloadError> {
        match record {
            JoinRecord::Left(key, value) => self.left.entry(key).or_default().push(value),
            JoinRecord::Right(key, value) => self.right.entry(key).or_default().push(value),
        }
        self.tuples += 1;
        Ok(())
    }

    fn combine(&mut self, other: &Self) -> Result<(), PayloadError> {
        append_side(&mut self.left, &other.left);
        append_side(&mut self.right, &other.right);
        self.tuples += other.tuples;
        Ok(())
    }

    fn emit(&self) -> Vec<(K, L, R)> {
        let mut keys: Vec<&K> = self
            .left
            .keys()
            .filter(|k| self.right.contains_key(*k))
            .collect();
        keys.sort_unstable();

        let mut joined = Vec::new();
        for key in keys {
            let (Some(lefts), Some(rights)) = (self.left.get(key), self.right.get(key)) else {
                continue;
            };
            for l in lefts {
                for r in rights {
                    joined.push((key.clone(), l.clone(), r.clone()));
                }
            }
        }
        joined
    }

    fn is_empty(&self) -> bool {
        self.tuples == 0
    }

    fn size_hint(&self) -> usize {
        self.tuples * (std::mem::size_of::<K>() + std::mem::size_of::<L>().max(std::mem::size_of::<R>()))
    }
}

/// Flattened form of [`JoinBuildPayload`] written to checkpoints.
type JoinSides<K, L, R> = (Vec<(K, Vec<L>)>, Vec<(K, Vec<R>)>);

impl<K, L, R> PayloadCodec for JoinBuildPayload<K, L, R>
where
    K: Eq + Hash + Ord + Clone + Send + Sync + 'static,
    L: Clone + Send + Sync + 'static,
    R: Clone + Send + Sync + 'static,
    JoinSides<K, L, R>:
        for<'a> RkyvSerialize<HighSerializer<AlignedVec, ArenaHandle<'a>, RkyvError>>,
    <JoinSides<K, L, R> as Archive>::Archived: for<'a> CheckBytes<HighValidator<'a, RkyvError>>
        + RkyvDeserialize<JoinSides<K, L, R>, HighDeserializer<RkyvError>>,
{
    fn encode(&self) -> Result<Vec<u8>, PayloadError> {
        let mut left: Vec<_> = self
            .left
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        left.sort_unstable_by(|a, b| a.0.cmp(&b.0));
        let mut right: Vec<_> = self
            .right
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        right.sort_unstable_by(|a, b| a.0.cmp(&b.0));
        encode_rkyv(&(left, right))
    }

    fn decode(bytes: &[u8]) -> Result<Self, PayloadError> {
        let (left, right) = decode_rkyv::<JoinSides<K, L, R>>(bytes)?;
        let tuples = left.iter().map(|(_, v)| v.len()).sum::<usize>()
            + right.iter().map(|(_, v)| v.len()).sum::<usize>();
        Ok(Self {
            left: left.into_iter().collect(),
            right: right.into_iter().collect(),
            tuples,
        })
    }
}
