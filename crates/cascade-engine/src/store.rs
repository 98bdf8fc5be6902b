//! The fact store: one rank's shard of triples and atoms.

use std::collections::BTreeMap;

use cascade_wire::{ConstId, Triple};

use crate::index::{Args, AtomIndex, Order, TripleIndex};

/// Cardinalities compared between rounds to detect change.
///
/// Counts alone miss a round that removes and adds the same number of
/// facts for a predicate; callers that need exact change tracking use the
/// insert/erase results instead.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Signature {
    pub triples: usize,
    pub atoms: BTreeMap<ConstId, usize>,
}

/// Triples under three orders plus the atom table.
#[derive(Debug, Clone)]
pub struct FactStore {
    spo: TripleIndex,
    pos: TripleIndex,
    osp: TripleIndex,
    atoms: AtomIndex,
}

impl Default for FactStore {
    fn default() -> Self {
        Self::new()
    }
}

impl FactStore {
    pub fn new() -> Self {
        Self {
            spo: TripleIndex::new(Order::Spo),
            pos: TripleIndex::new(Order::Pos),
            osp: TripleIndex::new(Order::Osp),
            atoms: AtomIndex::default(),
        }
    }

    pub fn from_triples(triples: impl IntoIterator<Item = Triple>) -> Self {
        let mut store = Self::new();
        for triple in triples {
            store.insert(&triple);
        }
        store
    }

    /// Insert into all three indexes. Returns whether the store changed.
    pub fn insert(&mut self, triple: &Triple) -> bool {
        if !self.spo.insert(triple) {
            return false;
        }
        self.pos.insert(triple);
        self.osp.insert(triple);
        true
    }

    /// Erase from all three indexes. Returns whether the store changed.
    pub fn erase(&mut self, triple: &Triple) -> bool {
        if !self.spo.remove(triple) {
            return false;
        }
        self.pos.remove(triple);
        self.osp.remove(triple);
        true
    }

    pub fn contains(&self, triple: &Triple) -> bool {
        self.spo.contains(triple)
    }

    fn index(&self, order: Order) -> &TripleIndex {
        match order {
            Order::Spo => &self.spo,
            Order::Pos => &self.pos,
            Order::Osp => &self.osp,
        }
    }

    /// Triples matching `pattern`; zero columns are wildcards.
    pub fn scan(&self, pattern: Triple) -> impl Iterator<Item = Triple> + '_ {
        self.index(Order::for_pattern(&pattern)).scan(pattern)
    }

    /// All triples in subject-major order.
    pub fn triples(&self) -> impl Iterator<Item = Triple> + '_ {
        self.spo.iter()
    }

    pub fn len(&self) -> usize {
        self.spo.len()
    }

    pub fn is_empty(&self) -> bool {
        self.spo.is_empty() && self.atoms.is_empty()
    }

    pub fn insert_atom(&mut self, predicate: ConstId, args: Args) -> bool {
        self.atoms.insert(predicate, args)
    }

    pub fn erase_atom(&mut self, predicate: ConstId, args: &[ConstId]) -> bool {
        self.atoms.remove(predicate, args)
    }

    pub fn atoms(&self) -> &AtomIndex {
        &self.atoms
    }

    pub fn signature(&self) -> Signature {
        Signature {
            triples: self.spo.len(),
            atoms: self.atoms.counts().collect(),
        }
    }

    /// Whether the three triple indexes hold the same set.
    pub fn indexes_agree(&self) -> bool {
        self.spo.len() == self.pos.len()
            && self.spo.len() == self.osp.len()
            && self
                .spo
                .iter()
                .all(|t| self.pos.contains(&t) && self.osp.contains(&t))
    }

    /// Remove every fact, returning the triples and atoms that were held.
    pub fn drain(&mut self) -> (Vec<Triple>, AtomIndex) {
        let triples = self.spo.iter().collect();
        let atoms = std::mem::take(&mut self.atoms);
        *self = Self::new();
        (triples, atoms)
    }
}
