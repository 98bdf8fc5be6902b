//! Row filters applied in place to an intermediate relation.
//!
//! Equality and `list_contains` never scan the store. They narrow (and
//! sometimes extend the bindings of) the relation built so far, so they must
//! come after the atoms that bind their variables.

use cascade_wire::{Atomic, ConstId, Term, UNBOUND, VarId};

use crate::config::Vocabulary;
use crate::error::EngineError;
use crate::tuple::{Relation, Tuple};

/// An atomic formula the conjunction evaluator treats as a filter.
#[derive(Debug, Clone, Copy)]
pub enum Special<'a> {
    Equality(&'a Term, &'a Term),
    ListContains(&'a [Term]),
}

impl<'a> Special<'a> {
    pub fn classify(atomic: &'a Atomic, vocabulary: &Vocabulary) -> Option<Self> {
        match atomic {
            Atomic::Equality(a, b) => Some(Special::Equality(a, b)),
            Atomic::Builtin { predicate, args } if *predicate == vocabulary.list_contains => {
                Some(Special::ListContains(args))
            }
            _ => None,
        }
    }

    /// Filter `relation`, keeping rows that satisfy (or, when `positive` is
    /// false, violate) the filter.
    pub fn apply(self, relation: &mut Relation, positive: bool) -> Result<(), EngineError> {
        match (self, positive) {
            (Special::Equality(a, b), true) => equality(relation, a, b),
            (Special::Equality(a, b), false) => inequality(relation, a, b),
            (Special::ListContains(args), positive) => list_contains(relation, args, positive),
        }
    }
}

enum Side {
    Const(ConstId),
    Var(VarId),
}

fn side(term: &Term) -> Result<Side, EngineError> {
    match term {
        Term::Constant(c) => Ok(Side::Const(*c)),
        Term::Variable(v) => Ok(Side::Var(*v)),
        other => Err(EngineError::Unsupported(format!(
            "comparison against {other}"
        ))),
    }
}

fn keep_all_if(relation: &mut Relation, keep: bool) {
    if !keep {
        relation.retain(|_| false);
    }
}

fn equality(relation: &mut Relation, a: &Term, b: &Term) -> Result<(), EngineError> {
    match (side(a)?, side(b)?) {
        (Side::Const(x), Side::Const(y)) => keep_all_if(relation, x == y),
        (Side::Var(v), Side::Const(c)) | (Side::Const(c), Side::Var(v)) => {
            let col = v as usize;
            relation.retain(|row| match row[col] {
                UNBOUND => {
                    row[col] = c;
                    true
                }
                value => value == c,
            });
            relation.bind(v);
        }
        (Side::Var(x), Side::Var(y)) if x == y => {}
        (Side::Var(x), Side::Var(y)) => {
            if !relation.is_bound(x) && !relation.is_bound(y) {
                return Err(EngineError::UnboundFilter(format!("?{x} = ?{y}")));
            }
            let (cx, cy) = (x as usize, y as usize);
            relation.retain(|row| match (row[cx], row[cy]) {
                (UNBOUND, UNBOUND) => false,
                (UNBOUND, value) => {
                    row[cx] = value;
                    true
                }
                (value, UNBOUND) => {
                    row[cy] = value;
                    true
                }
                (l, r) => l == r,
            });
            relation.bind(x);
            relation.bind(y);
        }
    }
    Ok(())
}

fn require_bound(relation: &Relation, var: VarId, filter: &str) -> Result<(), EngineError> {
    if relation.is_bound(var) {
        Ok(())
    } else {
        Err(EngineError::UnboundFilter(format!("?{var} in {filter}")))
    }
}

fn inequality(relation: &mut Relation, a: &Term, b: &Term) -> Result<(), EngineError> {
    let filter = format!("{a} != {b}");
    match (side(a)?, side(b)?) {
        (Side::Const(x), Side::Const(y)) => keep_all_if(relation, x != y),
        (Side::Var(v), Side::Const(c)) | (Side::Const(c), Side::Var(v)) => {
            require_bound(relation, v, &filter)?;
            let col = v as usize;
            relation.retain(|row| row[col] != UNBOUND && row[col] != c);
        }
        (Side::Var(x), Side::Var(y)) => {
            require_bound(relation, x, &filter)?;
            require_bound(relation, y, &filter)?;
            let (cx, cy) = (x as usize, y as usize);
            relation.retain(|row| row[cx] != UNBOUND && row[cy] != UNBOUND && row[cx] != row[cy]);
        }
    }
    Ok(())
}

fn list_contains(relation: &mut Relation, args: &[Term], positive: bool) -> Result<(), EngineError> {
    let [Term::List(items), needle] = args else {
        return Err(EngineError::Unsupported(format!(
            "list_contains with {} arguments",
            args.len()
        )));
    };
    let list: Vec<ConstId> = items
        .iter()
        .map(|item| {
            item.as_constant().ok_or_else(|| {
                EngineError::Unsupported(format!("list_contains over non-constant {item}"))
            })
        })
        .collect::<Result<_, _>>()?;

    match needle {
        Term::Constant(c) => keep_all_if(relation, list.contains(c) == positive),
        Term::Variable(v) => {
            require_bound(relation, *v, "list_contains")?;
            let col = *v as usize;
            if positive {
                // Rows where the variable is still open take each list member.
                let width = relation.width();
                let rows = std::mem::replace(relation, Relation::empty(width));
                let mut out = Relation::new(rows.width(), rows.bound().clone(), Vec::new());
                out.set_replicated(rows.is_replicated());
                for row in rows.into_rows() {
                    match row[col] {
                        UNBOUND => {
                            for member in &list {
                                let mut bound: Tuple = row.clone();
                                bound[col] = *member;
                                out.push(bound);
                            }
                        }
                        value if list.contains(&value) => out.push(row),
                        _ => {}
                    }
                }
                *relation = out;
            } else {
                relation.retain(|row| row[col] != UNBOUND && !list.contains(&row[col]));
            }
        }
        other => {
            return Err(EngineError::Unsupported(format!(
                "list_contains on {other}"
            )));
        }
    }
    Ok(())
}
