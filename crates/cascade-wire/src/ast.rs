//! Rule abstract syntax.
//!
//! These trees arrive already decoded from the binary rule format and are
//! never mutated afterwards. Rules are shared between workers behind an
//! `Arc`, so every type here is plain owned data.

use std::collections::BTreeSet;
use std::fmt;

/// Interned constant identifier.
///
/// `0` is reserved: inside partially built tuples it means "not yet bound".
pub type ConstId = u64;

/// Variable identifier, dense per rule. A variable's id is also its column
/// in the rule's binding tuples.
pub type VarId = u32;

/// The reserved "unbound" constant.
pub const UNBOUND: ConstId = 0;

/// A term.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Term {
    /// `?n`
    Variable(VarId),
    /// An interned constant.
    Constant(ConstId),
    /// A literal list of terms.
    List(Vec<Term>),
    /// An uninterpreted function application.
    Function(ConstId, Vec<Term>),
}

impl Term {
    /// The constant this term denotes, if it is a constant.
    pub fn as_constant(&self) -> Option<ConstId> {
        match self {
            Term::Constant(c) => Some(*c),
            _ => None,
        }
    }

    /// The variable this term denotes, if it is a variable.
    pub fn as_variable(&self) -> Option<VarId> {
        match self {
            Term::Variable(v) => Some(*v),
            _ => None,
        }
    }

    /// Whether the term contains no variables.
    pub fn is_ground(&self) -> bool {
        match self {
            Term::Variable(_) => false,
            Term::Constant(_) => true,
            Term::List(items) | Term::Function(_, items) => items.iter().all(Term::is_ground),
        }
    }

    fn collect_variables(&self, out: &mut BTreeSet<VarId>) {
        match self {
            Term::Variable(v) => {
                out.insert(*v);
            }
            Term::Constant(_) => {}
            Term::List(items) | Term::Function(_, items) => {
                for item in items {
                    item.collect_variables(out);
                }
            }
        }
    }
}

/// An atomic formula.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Atomic {
    /// `pred(args...)`, an n-ary fact pattern.
    Atom { predicate: ConstId, args: Vec<Term> },
    /// `External(pred(args...))`, evaluated by the builtin path.
    Builtin { predicate: ConstId, args: Vec<Term> },
    /// `left = right`
    Equality(Term, Term),
    /// `object # class`
    Membership(Term, Term),
    /// `sub ## super`
    Subclass(Term, Term),
    /// `object[attr -> value, ...]`, the triple-shaped pattern.
    Frame { object: Term, slots: Vec<(Term, Term)> },
}

impl Atomic {
    fn collect_variables(&self, out: &mut BTreeSet<VarId>) {
        match self {
            Atomic::Atom { args, .. } | Atomic::Builtin { args, .. } => {
                for arg in args {
                    arg.collect_variables(out);
                }
            }
            Atomic::Equality(a, b) | Atomic::Membership(a, b) | Atomic::Subclass(a, b) => {
                a.collect_variables(out);
                b.collect_variables(out);
            }
            Atomic::Frame { object, slots } => {
                object.collect_variables(out);
                for (attr, value) in slots {
                    attr.collect_variables(out);
                    value.collect_variables(out);
                }
            }
        }
    }
}

/// A rule body.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Condition {
    Atomic(Atomic),
    Conjunction(Vec<Condition>),
    /// Decoded for completeness; the evaluator rejects it.
    Disjunction(Vec<Condition>),
    Negation(Box<Condition>),
    Existential(Vec<Condition>),
}

impl Condition {
    /// All variables mentioned anywhere in the condition.
    pub fn variables(&self) -> BTreeSet<VarId> {
        let mut out = BTreeSet::new();
        self.collect_variables(&mut out);
        out
    }

    fn collect_variables(&self, out: &mut BTreeSet<VarId>) {
        match self {
            Condition::Atomic(atomic) => atomic.collect_variables(out),
            Condition::Conjunction(items)
            | Condition::Disjunction(items)
            | Condition::Existential(items) => {
                for item in items {
                    item.collect_variables(out);
                }
            }
            Condition::Negation(inner) => inner.collect_variables(out),
        }
    }
}

/// A single rule-head action.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Action {
    AssertFact(Atomic),
    RetractFact(Atomic),
    RetractSlots(Atomic),
    RetractObject(Term),
    Execute(Atomic),
    Modify(Atomic),
}

impl Action {
    /// Short name used in diagnostics.
    pub fn kind(&self) -> &'static str {
        match self {
            Action::AssertFact(_) => "Assert",
            Action::RetractFact(_) => "Retract",
            Action::RetractSlots(_) => "RetractSlots",
            Action::RetractObject(_) => "RetractObject",
            Action::Execute(_) => "Execute",
            Action::Modify(_) => "Modify",
        }
    }

    fn collect_variables(&self, out: &mut BTreeSet<VarId>) {
        match self {
            Action::AssertFact(a)
            | Action::RetractFact(a)
            | Action::RetractSlots(a)
            | Action::Execute(a)
            | Action::Modify(a) => a.collect_variables(out),
            Action::RetractObject(t) => t.collect_variables(out),
        }
    }
}

/// `Do((?v frame)... actions...)`
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct ActionBlock {
    /// Action-variable bindings. The evaluator does not support them.
    pub bindings: Vec<(VarId, Atomic)>,
    pub actions: Vec<Action>,
}

/// `If condition Then actions`
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Rule {
    pub condition: Condition,
    pub actions: ActionBlock,
}

impl Rule {
    pub fn new(condition: Condition, actions: Vec<Action>) -> Self {
        Self {
            condition,
            actions: ActionBlock {
                bindings: Vec::new(),
                actions,
            },
        }
    }

    /// Number of columns a binding tuple for this rule needs: one past the
    /// highest variable id used anywhere in the rule.
    pub fn width(&self) -> usize {
        let mut vars = self.condition.variables();
        for (var, atomic) in &self.actions.bindings {
            vars.insert(*var);
            atomic.collect_variables(&mut vars);
        }
        for action in &self.actions.actions {
            action.collect_variables(&mut vars);
        }
        vars.last().map_or(0, |v| *v as usize + 1)
    }
}

impl fmt::Display for Term {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Term::Variable(v) => write!(f, "?{v}"),
            Term::Constant(c) => write!(f, "#{c}"),
            Term::List(items) => {
                write!(f, "List(")?;
                write_joined(f, items, " ")?;
                write!(f, ")")
            }
            Term::Function(name, args) => {
                write!(f, "#{name}(")?;
                write_joined(f, args, " ")?;
                write!(f, ")")
            }
        }
    }
}

impl fmt::Display for Atomic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Atomic::Atom { predicate, args } => {
                write!(f, "#{predicate}(")?;
                write_joined(f, args, " ")?;
                write!(f, ")")
            }
            Atomic::Builtin { predicate, args } => {
                write!(f, "External(#{predicate}(")?;
                write_joined(f, args, " ")?;
                write!(f, "))")
            }
            Atomic::Equality(a, b) => write!(f, "{a} = {b}"),
            Atomic::Membership(a, b) => write!(f, "{a} # {b}"),
            Atomic::Subclass(a, b) => write!(f, "{a} ## {b}"),
            Atomic::Frame { object, slots } => {
                write!(f, "{object}[")?;
                for (i, (attr, value)) in slots.iter().enumerate() {
                    if i > 0 {
                        write!(f, " ")?;
                    }
                    write!(f, "{attr}->{value}")?;
                }
                write!(f, "]")
            }
        }
    }
}

impl fmt::Display for Condition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Condition::Atomic(a) => write!(f, "{a}"),
            Condition::Conjunction(items) => {
                write!(f, "And(")?;
                write_joined(f, items, " ")?;
                write!(f, ")")
            }
            Condition::Disjunction(items) => {
                write!(f, "Or(")?;
                write_joined(f, items, " ")?;
                write!(f, ")")
            }
            Condition::Negation(inner) => write!(f, "Not({inner})"),
            Condition::Existential(items) => {
                write!(f, "Exists(")?;
                write_joined(f, items, " ")?;
                write!(f, ")")
            }
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Action::AssertFact(a)
            | Action::RetractFact(a)
            | Action::RetractSlots(a)
            | Action::Execute(a)
            | Action::Modify(a) => write!(f, "{}({a})", self.kind()),
            Action::RetractObject(t) => write!(f, "{}({t})", self.kind()),
        }
    }
}

impl fmt::Display for Rule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "If {} Then Do(", self.condition)?;
        write_joined(f, &self.actions.actions, " ")?;
        write!(f, ")")
    }
}

fn write_joined<T: fmt::Display>(f: &mut fmt::Formatter<'_>, items: &[T], sep: &str) -> fmt::Result {
    for (i, item) in items.iter().enumerate() {
        if i > 0 {
            f.write_str(sep)?;
        }
        write!(f, "{item}")?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(s: Term, p: Term, o: Term) -> Atomic {
        Atomic::Frame {
            object: s,
            slots: vec![(p, o)],
        }
    }

    #[test]
    fn test_rule_width_covers_condition_and_actions() {
        let rule = Rule::new(
            Condition::Atomic(frame(Term::Variable(0), Term::Variable(1), Term::Variable(2))),
            vec![Action::AssertFact(frame(
                Term::Variable(0),
                Term::Variable(1),
                Term::Variable(5),
            ))],
        );
        assert_eq!(rule.width(), 6);
    }

    #[test]
    fn test_ground_rule_has_zero_width() {
        let rule = Rule::new(
            Condition::Atomic(Atomic::Equality(Term::Constant(1), Term::Constant(1))),
            vec![],
        );
        assert_eq!(rule.width(), 0);
    }

    #[test]
    fn test_is_ground() {
        assert!(Term::List(vec![Term::Constant(1), Term::Constant(2)]).is_ground());
        assert!(!Term::Function(7, vec![Term::Variable(0)]).is_ground());
    }

    #[test]
    fn test_display() {
        let rule = Rule::new(
            Condition::Atomic(frame(Term::Variable(0), Term::Variable(1), Term::Variable(2))),
            vec![Action::AssertFact(frame(
                Term::Variable(0),
                Term::Variable(1),
                Term::Constant(9),
            ))],
        );
        assert_eq!(rule.to_string(), "If ?0[?1->?2] Then Do(Assert(?0[?1->#9]))");
    }
}
