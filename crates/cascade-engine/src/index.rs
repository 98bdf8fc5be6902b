//! Ordered indexes over triples and n-ary atoms.
//!
//! A [`TripleIndex`] stores every triple permuted into its own column order,
//! so a bound prefix in that order is one contiguous `BTreeSet` range.
//! Permuted keys compare lexicographically, which is a total order; no
//! separate tie-break is needed.

use std::collections::{BTreeMap, BTreeSet};
use std::ops::Bound;

use cascade_wire::{ConstId, Triple, UNBOUND};

/// Column order of a triple index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Order {
    /// subject, predicate, object
    Spo,
    /// predicate, object, subject
    Pos,
    /// object, subject, predicate
    Osp,
}

impl Order {
    /// Triple column stored at each key position.
    pub const fn columns(self) -> [usize; 3] {
        match self {
            Order::Spo => [0, 1, 2],
            Order::Pos => [1, 2, 0],
            Order::Osp => [2, 0, 1],
        }
    }

    fn permute(self, triple: &Triple) -> Triple {
        let [a, b, c] = self.columns();
        [triple[a], triple[b], triple[c]]
    }

    fn unpermute(self, key: &Triple) -> Triple {
        let mut triple = [UNBOUND; 3];
        for (pos, col) in self.columns().into_iter().enumerate() {
            triple[col] = key[pos];
        }
        triple
    }

    /// The index whose sort prefix covers the bound columns of `pattern`
    /// (zero marks a free column).
    pub fn for_pattern(pattern: &Triple) -> Self {
        match pattern.map(|c| c != UNBOUND) {
            [false, true, _] => Order::Pos,
            [_, false, true] => Order::Osp,
            _ => Order::Spo,
        }
    }
}

/// One column-permuted ordered set of triples.
#[derive(Debug, Clone)]
pub struct TripleIndex {
    order: Order,
    keys: BTreeSet<Triple>,
}

impl TripleIndex {
    pub fn new(order: Order) -> Self {
        Self {
            order,
            keys: BTreeSet::new(),
        }
    }

    pub fn order(&self) -> Order {
        self.order
    }

    pub fn insert(&mut self, triple: &Triple) -> bool {
        self.keys.insert(self.order.permute(triple))
    }

    pub fn remove(&mut self, triple: &Triple) -> bool {
        self.keys.remove(&self.order.permute(triple))
    }

    pub fn contains(&self, triple: &Triple) -> bool {
        self.keys.contains(&self.order.permute(triple))
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    /// Triples in index order.
    pub fn iter(&self) -> impl Iterator<Item = Triple> + '_ {
        self.keys.iter().map(|key| self.order.unpermute(key))
    }

    /// Triples matching `pattern`, scanning only the range of its bound
    /// prefix in this index's order and filtering any remaining columns.
    pub fn scan(&self, pattern: Triple) -> impl Iterator<Item = Triple> + '_ {
        let key = self.order.permute(&pattern);
        let prefix = key.iter().take_while(|c| **c != UNBOUND).count();

        let mut low = [ConstId::MIN; 3];
        let mut high = [ConstId::MAX; 3];
        low[..prefix].copy_from_slice(&key[..prefix]);
        high[..prefix].copy_from_slice(&key[..prefix]);

        self.keys
            .range((Bound::Included(low), Bound::Included(high)))
            .filter(move |k| {
                key.iter()
                    .zip(k.iter())
                    .skip(prefix)
                    .all(|(want, have)| *want == UNBOUND || want == have)
            })
            .map(|k| self.order.unpermute(k))
    }
}

/// Argument tuple of an atom.
pub type Args = Box<[ConstId]>;

/// Non-triple facts, bucketed by predicate.
#[derive(Debug, Clone, Default)]
pub struct AtomIndex {
    buckets: BTreeMap<ConstId, BTreeSet<Args>>,
}

impl AtomIndex {
    pub fn insert(&mut self, predicate: ConstId, args: Args) -> bool {
        self.buckets.entry(predicate).or_default().insert(args)
    }

    pub fn remove(&mut self, predicate: ConstId, args: &[ConstId]) -> bool {
        let Some(bucket) = self.buckets.get_mut(&predicate) else {
            return false;
        };
        let removed = bucket.remove(args);
        if bucket.is_empty() {
            self.buckets.remove(&predicate);
        }
        removed
    }

    pub fn contains(&self, predicate: ConstId, args: &[ConstId]) -> bool {
        self.buckets
            .get(&predicate)
            .is_some_and(|bucket| bucket.contains(args))
    }

    /// Every stored argument tuple for `predicate`.
    pub fn bucket(&self, predicate: ConstId) -> impl Iterator<Item = &[ConstId]> + '_ {
        self.buckets
            .get(&predicate)
            .into_iter()
            .flat_map(|bucket| bucket.iter().map(|args| &args[..]))
    }

    pub fn count(&self, predicate: ConstId) -> usize {
        self.buckets.get(&predicate).map_or(0, BTreeSet::len)
    }

    /// Per-predicate counts, in predicate order.
    pub fn counts(&self) -> impl Iterator<Item = (ConstId, usize)> + '_ {
        self.buckets.iter().map(|(p, bucket)| (*p, bucket.len()))
    }

    pub fn len(&self) -> usize {
        self.buckets.values().map(BTreeSet::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (ConstId, &[ConstId])> + '_ {
        self.buckets
            .iter()
            .flat_map(|(p, bucket)| bucket.iter().map(move |args| (*p, &args[..])))
    }
}
