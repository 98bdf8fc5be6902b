//! Condition evaluation.
//!
//! Every control-flow decision here depends only on the rule and the
//! configuration, never on the data a rank holds. That keeps the collective
//! exchanges behind distributed joins lined up across the cluster, and
//! makes every error the evaluator raises a rank-independent one.

use cascade_wire::{Atomic, Condition, ConstId, Term, UNBOUND, VarId};
use tracing::trace;

use crate::config::{EngineConfig, JoinStrategy};
use crate::error::EngineError;
use crate::filters::Special;
use crate::shuffle::Cluster;
use crate::store::FactStore;
use crate::tuple::{self, Relation, Tuple};

/// Evaluates rule bodies against one rank's store.
pub struct Evaluator<'a, 't> {
    store: &'a FactStore,
    cluster: &'a mut Cluster<'t>,
    config: &'a EngineConfig,
    width: usize,
}

impl<'a, 't> Evaluator<'a, 't> {
    pub fn new(
        store: &'a FactStore,
        cluster: &'a mut Cluster<'t>,
        config: &'a EngineConfig,
        width: usize,
    ) -> Self {
        Self {
            store,
            cluster,
            config,
            width,
        }
    }

    fn local_only(&self) -> bool {
        self.config.join_strategy == JoinStrategy::Local || self.cluster.size() == 1
    }

    /// Satisfying bindings for `condition`.
    pub fn evaluate(&mut self, condition: &Condition) -> Result<Relation, EngineError> {
        match condition {
            Condition::Atomic(atomic) => self.atomic(atomic),
            Condition::Conjunction(items) => self.conjunction(items),
            Condition::Existential(items) => self.existential(items),
            Condition::Disjunction(_) => Err(EngineError::Unsupported("Or".to_string())),
            Condition::Negation(inner) => Err(EngineError::Unsupported(format!(
                "negation outside a conjunction: Not({inner})"
            ))),
        }
    }

    fn conjunction(&mut self, items: &[Condition]) -> Result<Relation, EngineError> {
        let vocabulary = &self.config.vocabulary;
        let mut acc = Relation::unit(self.width);
        let mut deferred = Vec::new();

        for item in items {
            match item {
                Condition::Atomic(atomic) => match Special::classify(atomic, vocabulary) {
                    Some(filter) => filter.apply(&mut acc, true)?,
                    None => {
                        let rhs = self.atomic(atomic)?;
                        acc = self.join(acc, rhs)?;
                    }
                },
                Condition::Negation(inner) => {
                    let special = match inner.as_ref() {
                        Condition::Atomic(atomic) => Special::classify(atomic, vocabulary),
                        _ => None,
                    };
                    match special {
                        Some(filter) => filter.apply(&mut acc, false)?,
                        None => deferred.push(inner.as_ref()),
                    }
                }
                other => {
                    let rhs = self.evaluate(other)?;
                    acc = self.join(acc, rhs)?;
                }
            }
        }

        for negated in deferred {
            let rhs = self.evaluate(negated)?;
            acc = self.subtract(acc, rhs)?;
        }
        Ok(acc)
    }

    fn existential(&mut self, items: &[Condition]) -> Result<Relation, EngineError> {
        let mut parts = Vec::new();
        let mut deferred = Vec::new();
        for item in items {
            match item {
                Condition::Negation(inner) => deferred.push(inner.as_ref()),
                other => parts.push(self.evaluate(other)?),
            }
        }

        // A union of replicated and partitioned parts is partitioned; the
        // replicated parts then survive on rank 0 only.
        let all_replicated = parts.iter().all(Relation::is_replicated);
        let mut acc = Relation::empty(self.width);
        acc.set_replicated(all_replicated);
        for mut part in parts {
            if !all_replicated && part.is_replicated() {
                if self.cluster.rank() != 0 {
                    part.retain(|_| false);
                }
                part.set_replicated(false);
            }
            acc.extend(part);
        }

        for negated in deferred {
            let rhs = self.evaluate(negated)?;
            acc = self.subtract(acc, rhs)?;
        }
        Ok(acc)
    }

    fn atomic(&mut self, atomic: &Atomic) -> Result<Relation, EngineError> {
        let vocabulary = self.config.vocabulary;
        if let Some(filter) = Special::classify(atomic, &vocabulary) {
            let mut unit = Relation::unit(self.width);
            filter.apply(&mut unit, true)?;
            return Ok(unit);
        }
        match atomic {
            Atomic::Frame { object, slots } => self.frame(object, slots),
            Atomic::Membership(o, c) => self.scan([o, &Term::Constant(vocabulary.rdf_type), c]),
            Atomic::Subclass(a, b) => self.scan([a, &Term::Constant(vocabulary.subclass_of), b]),
            Atomic::Atom { predicate, args } => self.atom(*predicate, args),
            Atomic::Builtin { predicate, .. } => Err(EngineError::Unsupported(format!(
                "builtin #{predicate}"
            ))),
            Atomic::Equality(..) => Err(EngineError::Unsupported(atomic.to_string())),
        }
    }

    fn frame(&mut self, object: &Term, slots: &[(Term, Term)]) -> Result<Relation, EngineError> {
        if slots.is_empty() {
            return self.subjects(object);
        }
        let mut acc: Option<Relation> = None;
        for (attr, value) in slots {
            let slot = self.scan([object, attr, value])?;
            acc = Some(match acc {
                None => slot,
                Some(acc) => self.join(acc, slot)?,
            });
        }
        Ok(acc.unwrap_or_else(|| Relation::empty(self.width)))
    }

    /// `o[]`: every locally stored subject.
    fn subjects(&self, object: &Term) -> Result<Relation, EngineError> {
        let mut out = Relation::empty(self.width);
        match column(object)? {
            Column::Const(c) => {
                if self.store.scan([c, UNBOUND, UNBOUND]).next().is_some() {
                    out.push(vec![UNBOUND; self.width].into());
                }
            }
            Column::Var(v) => {
                out.bind(v);
                let mut last = UNBOUND;
                for [s, _, _] in self.store.triples() {
                    if s != last {
                        let mut row = vec![UNBOUND; self.width];
                        row[v as usize] = s;
                        out.push(row.into());
                        last = s;
                    }
                }
            }
        }
        Ok(out)
    }

    /// One triple pattern against the local store.
    fn scan(&self, terms: [&Term; 3]) -> Result<Relation, EngineError> {
        let mut pattern = [UNBOUND; 3];
        let mut vars: [Option<VarId>; 3] = [None; 3];
        for (i, term) in terms.iter().enumerate() {
            match column(term)? {
                Column::Const(c) => pattern[i] = c,
                Column::Var(v) => vars[i] = Some(v),
            }
        }

        let mut out = Relation::empty(self.width);
        for v in vars.iter().flatten() {
            out.bind(*v);
        }
        'triples: for triple in self.store.scan(pattern) {
            let mut row = vec![UNBOUND; self.width];
            for (i, var) in vars.iter().enumerate() {
                if let Some(v) = var {
                    let slot = &mut row[*v as usize];
                    if *slot != UNBOUND && *slot != triple[i] {
                        continue 'triples;
                    }
                    *slot = triple[i];
                }
            }
            out.push(row.into());
        }
        trace!(?pattern, rows = out.len(), "scanned triples");
        Ok(out)
    }

    fn atom(&self, predicate: ConstId, args: &[Term]) -> Result<Relation, EngineError> {
        let columns: Vec<Column> = args.iter().map(column).collect::<Result<_, _>>()?;
        let mut out = Relation::empty(self.width);
        for c in &columns {
            if let Column::Var(v) = c {
                out.bind(*v);
            }
        }
        'atoms: for stored in self.store.atoms().bucket(predicate) {
            if stored.len() != columns.len() {
                continue;
            }
            let mut row = vec![UNBOUND; self.width];
            for (c, value) in columns.iter().zip(stored) {
                match *c {
                    Column::Const(k) if k != *value => continue 'atoms,
                    Column::Const(_) => {}
                    Column::Var(v) => {
                        let slot = &mut row[v as usize];
                        if *slot != UNBOUND && slot != value {
                            continue 'atoms;
                        }
                        *slot = *value;
                    }
                }
            }
            out.push(row.into());
        }
        Ok(out)
    }

    /// Join two relations that may be partitioned across the cluster.
    fn join(&mut self, left: Relation, right: Relation) -> Result<Relation, EngineError> {
        if self.local_only() || left.is_replicated() || right.is_replicated() {
            return Ok(tuple::join(&left, &right));
        }
        let shared = left.shared_with(&right);
        if shared.is_empty() {
            let right = self.cluster.broadcast(right)?;
            return Ok(tuple::join(&left, &right));
        }

        let (left_hashed, left_wild) = self.cluster.co_locate(left, &shared)?;
        let (right_hashed, right_wild) = self.cluster.co_locate(right, &shared)?;

        let mut out = tuple::join_on(&left_hashed, &right_hashed, &shared);
        out.extend(tuple::join_on(&left_hashed, &right_wild, &shared));
        out.extend(tuple::join_on(&left_wild, &right_hashed, &shared));
        // Wild rows are on every rank; pair them up once.
        if self.cluster.rank() == 0 {
            out.extend(tuple::join_on(&left_wild, &right_wild, &shared));
        }
        out.set_replicated(false);
        trace!(shared = ?shared, rows = out.len(), "distributed join");
        Ok(out)
    }

    /// Rows of `left` matching nothing in `right`, cluster-wide.
    fn subtract(&mut self, left: Relation, right: Relation) -> Result<Relation, EngineError> {
        let right = if self.local_only() {
            right
        } else {
            self.cluster.broadcast(right)?
        };
        Ok(tuple::anti_join(left, &right))
    }
}

enum Column {
    Const(ConstId),
    Var(VarId),
}

fn column(term: &Term) -> Result<Column, EngineError> {
    match term {
        Term::Constant(c) => Ok(Column::Const(*c)),
        Term::Variable(v) => Ok(Column::Var(*v)),
        Term::List(_) | Term::Function(..) => Err(EngineError::Unsupported(format!(
            "structured term {term} in a pattern"
        ))),
    }
}

/// Rows of `relation` projected onto `vars`, for tests and diagnostics.
pub fn project(relation: &Relation, vars: &[VarId]) -> Vec<Tuple> {
    let mut rows: Vec<Tuple> = relation
        .rows()
        .iter()
        .map(|row| vars.iter().map(|v| row[*v as usize]).collect())
        .collect();
    rows.sort();
    rows
}

#[cfg(test)]
mod tests {
    use super::*;
    use cascade_dist::Loopback;
    use pretty_assertions::assert_eq;

    fn v(id: VarId) -> Term {
        Term::Variable(id)
    }

    fn c(id: ConstId) -> Term {
        Term::Constant(id)
    }

    fn frame(s: Term, p: Term, o: Term) -> Condition {
        Condition::Atomic(Atomic::Frame {
            object: s,
            slots: vec![(p, o)],
        })
    }

    fn store() -> FactStore {
        let mut store = FactStore::from_triples([
            [10, 20, 30],
            [10, 20, 31],
            [11, 20, 30],
            [11, 21, 11],
            [30, 3, 40],
            [40, 4, 50],
        ]);
        store.insert_atom(60, vec![10, 11].into());
        store.insert_atom(60, vec![12, 12].into());
        store
    }

    fn eval(condition: &Condition, width: usize) -> Result<Relation, EngineError> {
        let store = store();
        let config = EngineConfig::default();
        let mut transport = Loopback::default();
        let mut cluster = Cluster::new(&mut transport, config.dist.clone());
        Evaluator::new(&store, &mut cluster, &config, width).evaluate(condition)
    }

    fn rows(relation: &Relation, vars: &[VarId]) -> Vec<Vec<ConstId>> {
        project(relation, vars).into_iter().map(|r| r.to_vec()).collect()
    }

    #[test]
    fn test_single_frame() {
        let r = eval(&frame(v(0), c(20), v(1)), 2).unwrap();
        assert_eq!(rows(&r, &[0, 1]), vec![vec![10, 30], vec![10, 31], vec![11, 30]]);
    }

    #[test]
    fn test_repeated_variable_in_one_pattern() {
        let r = eval(&frame(v(0), v(1), v(0)), 2).unwrap();
        assert_eq!(rows(&r, &[0, 1]), vec![vec![11, 21]]);
    }

    #[test]
    fn test_conjunction_joins_on_shared_variable() {
        let body = Condition::Conjunction(vec![
            frame(v(0), c(20), v(1)),
            frame(v(1), c(3), v(2)),
        ]);
        let r = eval(&body, 3).unwrap();
        assert_eq!(rows(&r, &[0, 1, 2]), vec![vec![10, 30, 40], vec![11, 30, 40]]);
    }

    #[test]
    fn test_multi_slot_frame() {
        let body = Condition::Atomic(Atomic::Frame {
            object: v(0),
            slots: vec![(c(20), c(30)), (c(21), v(1))],
        });
        let r = eval(&body, 2).unwrap();
        assert_eq!(rows(&r, &[0, 1]), vec![vec![11, 11]]);
    }

    #[test]
    fn test_membership_and_subclass() {
        let r = eval(&Condition::Atomic(Atomic::Membership(v(0), v(1))), 2).unwrap();
        assert_eq!(rows(&r, &[0, 1]), vec![vec![30, 40]]);
        let r = eval(&Condition::Atomic(Atomic::Subclass(v(0), c(50))), 1).unwrap();
        assert_eq!(rows(&r, &[0]), vec![vec![40]]);
    }

    #[test]
    fn test_atom_scan() {
        let atom = |args| {
            Condition::Atomic(Atomic::Atom {
                predicate: 60,
                args,
            })
        };
        let r = eval(&atom(vec![v(0), v(1)]), 2).unwrap();
        assert_eq!(r.len(), 2);
        let r = eval(&atom(vec![v(0), v(0)]), 1).unwrap();
        assert_eq!(rows(&r, &[0]), vec![vec![12]]);
        let r = eval(&atom(vec![c(10), v(0)]), 1).unwrap();
        assert_eq!(rows(&r, &[0]), vec![vec![11]]);
    }

    #[test]
    fn test_negation_is_subtracted_last() {
        let body = Condition::Conjunction(vec![
            Condition::Negation(Box::new(frame(v(1), c(3), v(2)))),
            frame(v(0), c(20), v(1)),
        ]);
        let r = eval(&body, 3).unwrap();
        assert_eq!(rows(&r, &[0, 1]), vec![vec![10, 31]]);
    }

    #[test]
    fn test_inequality_in_conjunction() {
        let body = Condition::Conjunction(vec![
            frame(v(0), c(20), v(2)),
            frame(v(1), c(20), v(2)),
            Condition::Negation(Box::new(Condition::Atomic(Atomic::Equality(v(0), v(1))))),
        ]);
        let r = eval(&body, 3).unwrap();
        assert_eq!(rows(&r, &[0, 1]), vec![vec![10, 11], vec![11, 10]]);
    }

    #[test]
    fn test_filter_before_binding_atom_is_reported() {
        let body = Condition::Conjunction(vec![
            Condition::Negation(Box::new(Condition::Atomic(Atomic::Equality(v(0), v(1))))),
            frame(v(0), c(20), v(1)),
        ]);
        assert!(matches!(eval(&body, 2), Err(EngineError::UnboundFilter(_))));
    }

    #[test]
    fn test_existential_unions_branches() {
        let body = Condition::Existential(vec![
            frame(v(0), c(3), v(1)),
            frame(v(0), c(4), v(1)),
        ]);
        let r = eval(&body, 2).unwrap();
        assert_eq!(rows(&r, &[0, 1]), vec![vec![30, 40], vec![40, 50]]);
    }

    #[test]
    fn test_unsupported_shapes() {
        let or = Condition::Disjunction(vec![frame(v(0), v(1), v(2))]);
        assert!(matches!(eval(&or, 3), Err(EngineError::Unsupported(_))));
        let list = frame(Term::List(vec![c(1)]), v(0), v(1));
        assert!(matches!(eval(&list, 2), Err(EngineError::Unsupported(_))));
        let not = Condition::Negation(Box::new(frame(v(0), v(1), v(2))));
        assert!(matches!(eval(&not, 3), Err(EngineError::Unsupported(_))));
    }

    #[test]
    fn test_empty_frame_lists_subjects() {
        let body = Condition::Atomic(Atomic::Frame {
            object: v(0),
            slots: vec![],
        });
        let r = eval(&body, 1).unwrap();
        assert_eq!(rows(&r, &[0]), vec![vec![10], vec![11], vec![30], vec![40]]);
    }
}
