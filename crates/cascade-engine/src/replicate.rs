//! Fact placement: random scattering, pattern replication, and the
//! replicate-until-complete loop.

use cascade_wire::{Atomic, Condition, Term, Triple, UNBOUND};
use rand::Rng;
use serde::Serialize;
use tracing::{debug, info, instrument};

use crate::config::Vocabulary;
use crate::error::EngineError;
use crate::fixpoint::{Fixpoint, FixpointReport};
use crate::shuffle::{Cluster, Parcel, Record, Route};
use crate::store::FactStore;

/// Facts to copy to every rank, as a triple pattern with `0` wildcards.
///
/// Variables become wildcards, so a pattern that repeats a variable
/// replicates a superset of what it names.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReplicationPattern {
    pattern: Triple,
}

impl ReplicationPattern {
    pub fn new(pattern: Triple) -> Self {
        Self { pattern }
    }

    /// Read a pattern from a single-slot frame, or a membership or subclass
    /// condition.
    pub fn from_condition(condition: &Condition, vocabulary: &Vocabulary) -> Result<Self, EngineError> {
        let rdf_type = Term::Constant(vocabulary.rdf_type);
        let subclass_of = Term::Constant(vocabulary.subclass_of);
        let terms = match condition {
            Condition::Atomic(Atomic::Frame { object, slots }) if slots.len() == 1 => {
                [object, &slots[0].0, &slots[0].1]
            }
            Condition::Atomic(Atomic::Membership(o, c)) => [o, &rdf_type, c],
            Condition::Atomic(Atomic::Subclass(a, b)) => [a, &subclass_of, b],
            other => {
                return Err(EngineError::Unsupported(format!(
                    "replication pattern {other}"
                )));
            }
        };

        let mut pattern = [UNBOUND; 3];
        for (column, term) in pattern.iter_mut().zip(terms) {
            *column = match term {
                Term::Constant(c) => *c,
                Term::Variable(_) => UNBOUND,
                other => {
                    return Err(EngineError::Unsupported(format!(
                        "structured term {other} in a replication pattern"
                    )));
                }
            };
        }
        Ok(Self { pattern })
    }

    pub fn pattern(&self) -> Triple {
        self.pattern
    }

    pub fn matches(&self, triple: &Triple) -> bool {
        self.pattern
            .iter()
            .zip(triple)
            .all(|(want, have)| *want == UNBOUND || want == have)
    }
}

/// Copy every local triple matching a pattern to every other rank. Returns
/// how many received triples were new to this rank.
#[instrument(skip_all, fields(rank = cluster.rank(), patterns = patterns.len()))]
pub fn replicate(
    store: &mut FactStore,
    cluster: &mut Cluster<'_>,
    patterns: &[ReplicationPattern],
) -> Result<usize, EngineError> {
    let mut matching: Vec<Triple> = patterns
        .iter()
        .flat_map(|p| store.scan(p.pattern))
        .collect();
    matching.sort_unstable();
    matching.dedup();

    let parcels = matching
        .into_iter()
        .map(|t| Parcel::new(Route::Others, Record::triple(t)))
        .collect();
    let mut inserted = 0;
    for record in cluster.route(parcels)? {
        if let Some(triple) = record.as_triple() {
            inserted += usize::from(store.insert(&triple));
        }
    }
    debug!(inserted, "replicated triples");
    Ok(inserted)
}

/// Send every local triple to a uniformly random rank.
#[instrument(skip_all, fields(rank = cluster.rank()))]
pub fn randomize(store: &mut FactStore, cluster: &mut Cluster<'_>) -> Result<(), EngineError> {
    let size = cluster.size();
    if size == 1 {
        return Ok(());
    }
    let (triples, atoms) = store.drain();
    let mut rng = rand::thread_rng();
    let parcels = triples
        .into_iter()
        .map(|t| Parcel::new(Route::To(rng.gen_range(0..size)), Record::triple(t)))
        .collect();

    for record in cluster.route(parcels)? {
        if let Some(triple) = record.as_triple() {
            store.insert(&triple);
        }
    }
    for (predicate, args) in atoms.iter() {
        store.insert_atom(predicate, args.into());
    }
    debug!(triples = store.len(), "randomized placement");
    Ok(())
}

/// Outcome of [`complete`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CompletionReport {
    pub passes: usize,
    pub replicated: usize,
    pub fixpoint: FixpointReport,
}

/// Alternate fixpoints and replication until a replication pass brings no
/// rank anything new.
pub fn complete(
    fixpoint: &Fixpoint<'_>,
    store: &mut FactStore,
    cluster: &mut Cluster<'_>,
    patterns: &[ReplicationPattern],
) -> Result<CompletionReport, EngineError> {
    let mut report = CompletionReport::default();
    loop {
        let pass = fixpoint.run(store, cluster)?;
        report.fixpoint.rounds += pass.rounds;
        report.fixpoint.inserted += pass.inserted;
        report.fixpoint.erased += pass.erased;
        report.fixpoint.skipped += pass.skipped;
        report.fixpoint.converged = pass.converged;
        report.passes += 1;

        let inserted = replicate(store, cluster, patterns)?;
        report.replicated += inserted;
        if !cluster.all_or(inserted > 0)? {
            info!(passes = report.passes, replicated = report.replicated, "placement complete");
            return Ok(report);
        }
    }
}
