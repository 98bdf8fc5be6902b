//! Turning satisfying bindings into assertions and retractions.
//!
//! Nothing here touches the store. The fixpoint driver applies a [`Delta`]
//! once the whole round (or rule) has been evaluated.

use std::collections::BTreeSet;

use cascade_wire::{Action, ActionBlock, Atomic, ConstId, Term, Triple, UNBOUND, VarId};
use tracing::warn;

use crate::config::Vocabulary;
use crate::error::EngineError;
use crate::index::Args;
use crate::tuple::Relation;

/// Pending changes to the store.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Delta {
    pub assert_triples: BTreeSet<Triple>,
    pub retract_triples: BTreeSet<Triple>,
    pub assert_atoms: BTreeSet<(ConstId, Args)>,
    pub retract_atoms: BTreeSet<(ConstId, Args)>,
}

impl Delta {
    pub fn is_empty(&self) -> bool {
        self.assert_triples.is_empty()
            && self.retract_triples.is_empty()
            && self.assert_atoms.is_empty()
            && self.retract_atoms.is_empty()
    }

    pub fn merge(&mut self, other: Delta) {
        self.assert_triples.extend(other.assert_triples);
        self.retract_triples.extend(other.retract_triples);
        self.assert_atoms.extend(other.assert_atoms);
        self.retract_atoms.extend(other.retract_atoms);
    }

    /// Drop assertions that are also retracted. Retraction wins.
    pub fn settle(&mut self) {
        let retract_triples = &self.retract_triples;
        self.assert_triples.retain(|t| !retract_triples.contains(t));
        let retract_atoms = &self.retract_atoms;
        self.assert_atoms.retain(|a| !retract_atoms.contains(a));
    }
}

#[derive(Debug, Clone, Copy)]
enum Slot {
    Const(ConstId),
    Var(VarId),
}

impl Slot {
    fn value(self, row: &[ConstId]) -> Option<ConstId> {
        match self {
            Slot::Const(c) => Some(c),
            Slot::Var(v) => Some(row[v as usize]).filter(|value| *value != UNBOUND),
        }
    }
}

/// One fact shape a head instantiates per row.
#[derive(Debug)]
enum Template {
    Triple([Slot; 3]),
    Atom(ConstId, Vec<Slot>),
}

impl Template {
    fn instantiate(&self, row: &[ConstId]) -> Option<Fact> {
        match self {
            Template::Triple([s, p, o]) => Some(Fact::Triple([s.value(row)?, p.value(row)?, o.value(row)?])),
            Template::Atom(predicate, slots) => {
                let args = slots.iter().map(|s| s.value(row)).collect::<Option<Args>>()?;
                Some(Fact::Atom(*predicate, args))
            }
        }
    }
}

enum Fact {
    Triple(Triple),
    Atom(ConstId, Args),
}

fn slot(term: &Term, relation: &Relation) -> Result<Slot, EngineError> {
    match term {
        Term::Constant(c) => Ok(Slot::Const(*c)),
        Term::Variable(v) if relation.is_bound(*v) => Ok(Slot::Var(*v)),
        Term::Variable(v) => Err(EngineError::Unsupported(format!(
            "head variable ?{v} is not bound by the body"
        ))),
        other => Err(EngineError::Unsupported(format!("structured term {other} in a head"))),
    }
}

fn templates(
    target: &Atomic,
    relation: &Relation,
    vocabulary: &Vocabulary,
) -> Result<Vec<Template>, EngineError> {
    let triple = |s: &Term, p: &Term, o: &Term| -> Result<Template, EngineError> {
        Ok(Template::Triple([slot(s, relation)?, slot(p, relation)?, slot(o, relation)?]))
    };
    match target {
        Atomic::Frame { object, slots } => slots
            .iter()
            .map(|(attr, value)| triple(object, attr, value))
            .collect(),
        Atomic::Membership(o, c) => Ok(vec![triple(o, &Term::Constant(vocabulary.rdf_type), c)?]),
        Atomic::Subclass(a, b) => Ok(vec![triple(a, &Term::Constant(vocabulary.subclass_of), b)?]),
        Atomic::Atom { predicate, args } => {
            let slots = args
                .iter()
                .map(|a| slot(a, relation))
                .collect::<Result<_, _>>()?;
            Ok(vec![Template::Atom(*predicate, slots)])
        }
        Atomic::Builtin { .. } | Atomic::Equality(..) => {
            Err(EngineError::Unsupported(format!("{target} as an action target")))
        }
    }
}

/// Add the facts `block` derives from `relation` to `delta`.
///
/// Either every action of the block contributes or, on error, none does.
/// Rows with an unbound head variable derive nothing.
pub fn execute(
    block: &ActionBlock,
    relation: &Relation,
    vocabulary: &Vocabulary,
    delta: &mut Delta,
) -> Result<(), EngineError> {
    if !block.bindings.is_empty() {
        return Err(EngineError::Unsupported(format!(
            "{} action variable binding(s)",
            block.bindings.len()
        )));
    }

    let mut plan = Vec::new();
    for action in &block.actions {
        match action {
            Action::AssertFact(target) => plan.push((true, templates(target, relation, vocabulary)?)),
            Action::RetractFact(target) => plan.push((false, templates(target, relation, vocabulary)?)),
            other => warn!(action = %other, "skipping unsupported action"),
        }
    }

    for row in relation.rows() {
        for (assert, templates) in &plan {
            for fact in templates.iter().filter_map(|t| t.instantiate(row)) {
                match (fact, *assert) {
                    (Fact::Triple(t), true) => delta.assert_triples.insert(t),
                    (Fact::Triple(t), false) => delta.retract_triples.insert(t),
                    (Fact::Atom(p, args), true) => delta.assert_atoms.insert((p, args)),
                    (Fact::Atom(p, args), false) => delta.retract_atoms.insert((p, args)),
                };
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn v(id: VarId) -> Term {
        Term::Variable(id)
    }

    fn c(id: ConstId) -> Term {
        Term::Constant(id)
    }

    fn frame(s: Term, p: Term, o: Term) -> Atomic {
        Atomic::Frame {
            object: s,
            slots: vec![(p, o)],
        }
    }

    fn bindings() -> Relation {
        Relation::new(
            2,
            [0, 1].into_iter().collect(),
            vec![vec![1, 2].into(), vec![3, 0].into()],
        )
    }

    fn block(actions: Vec<Action>) -> ActionBlock {
        ActionBlock {
            bindings: Vec::new(),
            actions,
        }
    }

    #[test]
    fn test_assert_substitutes_variables() {
        let mut delta = Delta::default();
        let head = block(vec![Action::AssertFact(frame(v(0), c(9), v(1)))]);
        execute(&head, &bindings(), &Vocabulary::default(), &mut delta).unwrap();
        // The second row leaves ?1 unbound and derives nothing.
        assert_eq!(delta.assert_triples.into_iter().collect::<Vec<_>>(), vec![[1, 9, 2]]);
    }

    #[test]
    fn test_membership_and_atom_targets() {
        let mut delta = Delta::default();
        let head = block(vec![
            Action::AssertFact(Atomic::Membership(v(0), c(7))),
            Action::RetractFact(Atomic::Atom {
                predicate: 5,
                args: vec![v(0)],
            }),
        ]);
        execute(&head, &bindings(), &Vocabulary::default(), &mut delta).unwrap();
        assert!(delta.assert_triples.contains(&[1, 3, 7]));
        assert!(delta.assert_triples.contains(&[3, 3, 7]));
        assert!(delta.retract_atoms.contains(&(5, vec![3].into())));
    }

    #[test]
    fn test_unbound_head_variable_is_rejected() {
        let mut delta = Delta::default();
        let head = block(vec![
            Action::AssertFact(frame(v(0), c(9), v(0))),
            Action::AssertFact(frame(v(0), c(9), v(4))),
        ]);
        let err = execute(&head, &bindings(), &Vocabulary::default(), &mut delta).unwrap_err();
        assert!(matches!(err, EngineError::Unsupported(_)));
        assert!(delta.is_empty());
    }

    #[test]
    fn test_action_bindings_are_rejected() {
        let mut head = block(vec![]);
        head.bindings.push((0, frame(v(0), c(1), c(2))));
        let mut delta = Delta::default();
        assert!(execute(&head, &bindings(), &Vocabulary::default(), &mut delta).is_err());
    }

    #[test]
    fn test_unsupported_actions_are_skipped() {
        let mut delta = Delta::default();
        let head = block(vec![
            Action::RetractObject(v(0)),
            Action::AssertFact(frame(v(0), c(9), c(9))),
        ]);
        execute(&head, &bindings(), &Vocabulary::default(), &mut delta).unwrap();
        assert_eq!(delta.assert_triples.len(), 2);
    }

    #[test]
    fn test_retraction_wins() {
        let mut delta = Delta::default();
        delta.assert_triples.insert([1, 2, 3]);
        delta.assert_triples.insert([4, 5, 6]);
        delta.retract_triples.insert([1, 2, 3]);
        delta.settle();
        assert_eq!(delta.assert_triples.into_iter().collect::<Vec<_>>(), vec![[4, 5, 6]]);
    }
}
