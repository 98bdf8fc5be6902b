//! Binding tuples, relations and the unification join.
//!
//! A tuple has one column per rule variable; `0` marks a column that is not
//! bound in that row. Joins unify rows instead of comparing them: an
//! unbound column matches anything and takes the other side's value.

use std::collections::{BTreeSet, HashMap};

use cascade_wire::{ConstId, UNBOUND, VarId};

/// One binding assignment.
pub type Tuple = Box<[ConstId]>;

/// A bag of tuples plus the variables its producer binds.
///
/// `bound` is structural: it depends only on the rule, never on data, so it
/// is identical on every rank. A bound column may still hold `0` in rows
/// that came from a union branch which does not bind it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Relation {
    width: usize,
    bound: BTreeSet<VarId>,
    rows: Vec<Tuple>,
    replicated: bool,
}

impl Relation {
    /// No rows, nothing bound.
    pub fn empty(width: usize) -> Self {
        Self {
            width,
            bound: BTreeSet::new(),
            rows: Vec::new(),
            replicated: false,
        }
    }

    /// The identity for joins: a single all-unbound row.
    ///
    /// Every rank starts from the same unit row, so it is marked replicated.
    pub fn unit(width: usize) -> Self {
        Self {
            width,
            bound: BTreeSet::new(),
            rows: vec![vec![UNBOUND; width].into_boxed_slice()],
            replicated: true,
        }
    }

    pub fn new(width: usize, bound: BTreeSet<VarId>, rows: Vec<Tuple>) -> Self {
        Self {
            width,
            bound,
            rows,
            replicated: false,
        }
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn bound(&self) -> &BTreeSet<VarId> {
        &self.bound
    }

    pub fn is_bound(&self, var: VarId) -> bool {
        self.bound.contains(&var)
    }

    pub fn bind(&mut self, var: VarId) {
        self.bound.insert(var);
    }

    pub fn rows(&self) -> &[Tuple] {
        &self.rows
    }

    pub fn into_rows(self) -> Vec<Tuple> {
        self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Whether every rank holds an identical copy of this relation.
    pub fn is_replicated(&self) -> bool {
        self.replicated
    }

    pub fn set_replicated(&mut self, replicated: bool) {
        self.replicated = replicated;
    }

    pub fn push(&mut self, row: Tuple) {
        debug_assert_eq!(row.len(), self.width);
        self.rows.push(row);
    }

    pub fn retain(&mut self, keep: impl FnMut(&mut Tuple) -> bool) {
        self.rows.retain_mut(keep);
    }

    /// Append `other`'s rows and bound variables.
    pub fn extend(&mut self, other: Relation) {
        self.bound.extend(other.bound);
        self.rows.extend(other.rows);
        self.replicated &= other.replicated;
    }

    /// Variables bound on both sides, ascending.
    pub fn shared_with(&self, other: &Relation) -> Vec<VarId> {
        self.bound.intersection(&other.bound).copied().collect()
    }

    /// Rows sorted, for order-insensitive comparison.
    pub fn sorted_rows(&self) -> Vec<Tuple> {
        let mut rows = self.rows.clone();
        rows.sort();
        rows
    }
}

/// Merge two rows, or `None` if some column holds different bound values.
pub fn unify(left: &[ConstId], right: &[ConstId]) -> Option<Tuple> {
    left.iter()
        .zip(right)
        .map(|(&l, &r)| match (l, r) {
            (UNBOUND, v) | (v, UNBOUND) => Some(v),
            (l, r) if l == r => Some(l),
            _ => None,
        })
        .collect()
}

fn project(row: &[ConstId], columns: &[VarId]) -> Option<Vec<ConstId>> {
    columns
        .iter()
        .map(|&c| row[c as usize])
        .map(|v| (v != UNBOUND).then_some(v))
        .collect()
}

/// Hash index over the right side of a join.
///
/// Rows whose key is fully bound are hashed by it; rows with an unbound key
/// column can match any key and are kept aside.
struct RightIndex<'a> {
    keyed: HashMap<Vec<ConstId>, Vec<usize>>,
    wild: Vec<usize>,
    rows: &'a [Tuple],
}

impl<'a> RightIndex<'a> {
    fn build(rows: &'a [Tuple], shared: &[VarId]) -> Self {
        let mut keyed: HashMap<Vec<ConstId>, Vec<usize>> = HashMap::new();
        let mut wild = Vec::new();
        for (i, row) in rows.iter().enumerate() {
            match project(row, shared) {
                Some(key) => keyed.entry(key).or_default().push(i),
                None => wild.push(i),
            }
        }
        Self { keyed, wild, rows }
    }

    /// Candidate right rows for `left`, ascending by position.
    fn candidates(&self, left: &[ConstId], shared: &[VarId]) -> Vec<usize> {
        match project(left, shared) {
            None => (0..self.rows.len()).collect(),
            Some(key) => {
                let hits = self.keyed.get(&key).map_or(&[][..], Vec::as_slice);
                merge_sorted(hits, &self.wild)
            }
        }
    }
}

fn merge_sorted(a: &[usize], b: &[usize]) -> Vec<usize> {
    let mut out = Vec::with_capacity(a.len() + b.len());
    let (mut i, mut j) = (0, 0);
    while i < a.len() && j < b.len() {
        if a[i] <= b[j] {
            out.push(a[i]);
            i += 1;
        } else {
            out.push(b[j]);
            j += 1;
        }
    }
    out.extend_from_slice(&a[i..]);
    out.extend_from_slice(&b[j..]);
    out
}

/// Unification join on the variables both sides bind.
///
/// Output rows follow left order, then right order, so equal inputs always
/// give the same output.
pub fn join(left: &Relation, right: &Relation) -> Relation {
    let shared = left.shared_with(right);
    join_on(left, right, &shared)
}

/// Unification join probing on `shared`. Every column is still checked, so
/// `shared` only decides which right rows are considered.
pub fn join_on(left: &Relation, right: &Relation, shared: &[VarId]) -> Relation {
    let mut out = Relation {
        width: left.width.max(right.width),
        bound: left.bound.union(&right.bound).copied().collect(),
        rows: Vec::new(),
        replicated: left.replicated && right.replicated,
    };
    let index = RightIndex::build(&right.rows, shared);
    for row in &left.rows {
        for i in index.candidates(row, shared) {
            if let Some(merged) = unify(row, &index.rows[i]) {
                out.rows.push(merged);
            }
        }
    }
    out
}

/// Rows of `left` that unify with no row of `right`.
pub fn anti_join(left: Relation, right: &Relation) -> Relation {
    let shared = left.shared_with(right);
    let index = RightIndex::build(&right.rows, &shared);
    let Relation {
        width,
        bound,
        rows,
        replicated,
    } = left;
    let rows = rows
        .into_iter()
        .filter(|row| {
            !index
                .candidates(row, &shared)
                .into_iter()
                .any(|i| unify(row, &index.rows[i]).is_some())
        })
        .collect();
    Relation {
        width,
        bound,
        rows,
        replicated,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;

    fn rel(bound: &[VarId], rows: &[&[ConstId]]) -> Relation {
        Relation::new(
            rows.first().map_or(3, |r| r.len()),
            bound.iter().copied().collect(),
            rows.iter().map(|r| r.to_vec().into_boxed_slice()).collect(),
        )
    }

    #[test]
    fn test_join_on_shared_variable() {
        let a = rel(&[0, 1], &[&[1, 2, 0], &[3, 4, 0]]);
        let b = rel(&[1, 2], &[&[0, 2, 9], &[0, 5, 8]]);
        let joined = join(&a, &b);
        assert_eq!(joined.rows(), &[vec![1, 2, 9].into_boxed_slice()]);
        assert_eq!(joined.bound().iter().copied().collect::<Vec<_>>(), vec![0, 1, 2]);
    }

    #[test]
    fn test_unbound_column_is_a_wildcard() {
        let a = rel(&[0, 1], &[&[1, 0, 0]]);
        let b = rel(&[1, 2], &[&[0, 2, 9], &[0, 5, 8]]);
        assert_eq!(join(&a, &b).len(), 2);
    }

    #[test]
    fn test_conflict_rejects_pair() {
        let a = rel(&[0], &[&[1, 0]]);
        let b = rel(&[0], &[&[2, 0]]);
        assert!(join(&a, &b).is_empty());
    }

    #[test]
    fn test_unit_is_identity() {
        let b = rel(&[0, 2], &[&[1, 0, 3], &[4, 0, 5]]);
        let joined = join(&Relation::unit(3), &b);
        assert_eq!(joined.rows(), b.rows());
        assert!(!joined.is_replicated());
    }

    #[test]
    fn test_cross_product_without_shared_variables() {
        let a = rel(&[0], &[&[1, 0], &[2, 0]]);
        let b = rel(&[1], &[&[0, 7], &[0, 8]]);
        assert_eq!(join(&a, &b).len(), 4);
    }

    #[test]
    fn test_anti_join_removes_matches() {
        let a = rel(&[0, 1], &[&[1, 2], &[3, 4]]);
        let n = rel(&[0], &[&[3, 0]]);
        let kept = anti_join(a, &n);
        assert_eq!(kept.rows(), &[vec![1, 2].into_boxed_slice()]);
    }

    #[test]
    fn test_anti_join_with_empty_right_keeps_everything() {
        let a = rel(&[0], &[&[1, 0], &[2, 0]]);
        let n = Relation::empty(2);
        assert_eq!(anti_join(a.clone(), &n), a);
    }

    fn relation(bound: Vec<VarId>) -> impl Strategy<Value = Relation> {
        let width = 4usize;
        let cols = bound.clone();
        prop::collection::vec(prop::collection::vec(0u64..4, width), 0..12).prop_map(move |rows| {
            let rows = rows
                .into_iter()
                .map(|r| {
                    (0..width)
                        .map(|c| if cols.contains(&(c as VarId)) { r[c] } else { 0 })
                        .collect::<Tuple>()
                })
                .collect();
            Relation::new(width, cols.iter().copied().collect(), rows)
        })
    }

    fn brute_force(a: &Relation, b: &Relation) -> Vec<Tuple> {
        let mut out: Vec<Tuple> = a
            .rows()
            .iter()
            .flat_map(|l| b.rows().iter().filter_map(move |r| unify(l, r)))
            .collect();
        out.sort();
        out
    }

    proptest! {
        #[test]
        fn join_is_commutative(a in relation(vec![0, 1]), b in relation(vec![1, 2, 3])) {
            prop_assert_eq!(join(&a, &b).sorted_rows(), join(&b, &a).sorted_rows());
        }

        #[test]
        fn join_equals_pairwise_unification(a in relation(vec![0, 1]), b in relation(vec![1, 2])) {
            prop_assert_eq!(join(&a, &b).sorted_rows(), brute_force(&a, &b));
        }

        #[test]
        fn join_is_deterministic(a in relation(vec![0, 2]), b in relation(vec![2, 3])) {
            let first = join(&a, &b);
            let second = join(&a, &b);
            prop_assert_eq!(first.rows(), second.rows());
        }
    }
}
