//! The round loop that drives the rule set to a cluster-wide fixpoint.

use cascade_wire::Rule;
use serde::Serialize;
use tracing::{debug, error, info, instrument, warn};

use crate::action::{Delta, execute};
use crate::config::{EngineConfig, Granularity, Vocabulary};
use crate::error::EngineError;
use crate::query::Evaluator;
use crate::shuffle::{Cluster, MAX_COLUMNS, Record, check_fits};
use crate::store::FactStore;

/// What one round did on this rank.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RoundReport {
    pub round: usize,
    /// Facts that were not in the store before.
    pub inserted: usize,
    /// Facts that were in the store before.
    pub erased: usize,
    /// Rules skipped because of a rule-level error.
    pub skipped: usize,
    /// Whether any rank's store changed.
    pub changed: bool,
}

/// Totals over a whole run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct FixpointReport {
    pub rounds: usize,
    pub inserted: usize,
    pub erased: usize,
    pub skipped: usize,
    /// False when `max_rounds` stopped the loop first.
    pub converged: bool,
}

impl FixpointReport {
    fn absorb(&mut self, round: &RoundReport) {
        self.rounds += 1;
        self.inserted += round.inserted;
        self.erased += round.erased;
        self.skipped += round.skipped;
    }
}

/// A rule set bound to its configuration.
pub struct Fixpoint<'r> {
    rules: &'r [Rule],
    config: &'r EngineConfig,
}

impl<'r> Fixpoint<'r> {
    pub fn new(rules: &'r [Rule], config: &'r EngineConfig) -> Self {
        Self { rules, config }
    }

    /// Evaluate rounds until no rank changes, or `max_rounds` is reached.
    #[instrument(skip_all, fields(rank = cluster.rank(), rules = self.rules.len()))]
    pub fn run(
        &self,
        store: &mut FactStore,
        cluster: &mut Cluster<'_>,
    ) -> Result<FixpointReport, EngineError> {
        let mut report = FixpointReport::default();
        loop {
            if let Some(max) = self.config.max_rounds
                && report.rounds >= max
            {
                warn!(rounds = report.rounds, "stopping before fixpoint: round limit reached");
                return Ok(report);
            }

            let round = self.round(store, cluster, report.rounds + 1)?;
            report.absorb(&round);
            info!(
                round = round.round,
                inserted = round.inserted,
                erased = round.erased,
                skipped = round.skipped,
                facts = store.len(),
                "round complete"
            );
            if !round.changed {
                report.converged = true;
                return Ok(report);
            }
        }
    }

    /// One pass over every rule, followed by one OR-reduction.
    pub fn round(
        &self,
        store: &mut FactStore,
        cluster: &mut Cluster<'_>,
        number: usize,
    ) -> Result<RoundReport, EngineError> {
        let before = store.signature();
        let mut report = RoundReport {
            round: number,
            ..Default::default()
        };
        let mut pending = Delta::default();

        for (index, rule) in self.rules.iter().enumerate() {
            match self.derive(rule, store, cluster) {
                Ok(delta) => pending.merge(delta),
                Err(e) if e.is_recoverable() => {
                    error!(rule = index, error = %e, "skipping rule");
                    report.skipped += 1;
                }
                Err(e) => return Err(e),
            }
            if self.config.granularity == Granularity::Rule {
                apply(std::mem::take(&mut pending), store, cluster, &mut report)?;
            }
        }
        if self.config.granularity == Granularity::Round {
            apply(pending, store, cluster, &mut report)?;
        }

        let changed = report.inserted > 0 || report.erased > 0 || store.signature() != before;
        report.changed = cluster.all_or(changed)?;
        Ok(report)
    }

    /// Evaluate one rule against the current store, without applying it.
    pub fn derive(
        &self,
        rule: &Rule,
        store: &FactStore,
        cluster: &mut Cluster<'_>,
    ) -> Result<Delta, EngineError> {
        let width = rule.width();
        if width > MAX_COLUMNS {
            return Err(EngineError::Unsupported(format!(
                "variable ids up to ?{}; rules may use ?0 to ?{}",
                width - 1,
                MAX_COLUMNS - 1
            )));
        }
        if cluster.size() > 1 {
            check_fits(width, cluster.config().packet_size)?;
        }
        let mut relation = Evaluator::new(store, cluster, self.config, width).evaluate(&rule.condition)?;
        if relation.is_replicated() && cluster.rank() != 0 {
            relation.retain(|_| false);
        }
        debug!(%rule, rows = relation.len(), "rule matched");

        let mut delta = Delta::default();
        execute(&rule.actions, &relation, &self.config.vocabulary, &mut delta)?;
        Ok(delta)
    }
}

/// Apply `delta` to `store`. Retractions are first shared with every rank.
fn apply(
    mut delta: Delta,
    store: &mut FactStore,
    cluster: &mut Cluster<'_>,
    report: &mut RoundReport,
) -> Result<(), EngineError> {
    if cluster.size() > 1 {
        share_retractions(&mut delta, cluster)?;
    }
    delta.settle();

    for triple in &delta.assert_triples {
        report.inserted += usize::from(store.insert(triple));
    }
    for (predicate, args) in delta.assert_atoms {
        report.inserted += usize::from(store.insert_atom(predicate, args));
    }
    for triple in &delta.retract_triples {
        report.erased += usize::from(store.erase(triple));
    }
    for (predicate, args) in &delta.retract_atoms {
        report.erased += usize::from(store.erase_atom(*predicate, args));
    }
    Ok(())
}

fn share_retractions(delta: &mut Delta, cluster: &mut Cluster<'_>) -> Result<(), EngineError> {
    let packet_size = cluster.config().packet_size;
    let mut records: Vec<Record> = delta.retract_triples.iter().map(|t| Record::triple(*t)).collect();
    for (predicate, args) in &delta.retract_atoms {
        if check_fits(args.len() + 1, packet_size).is_ok() {
            records.push(Record::atom(*predicate, args));
        } else {
            warn!(predicate, arity = args.len(), "atom retraction too wide to share; applied locally");
        }
    }

    for record in cluster.gather(records)? {
        if let Some(triple) = record.as_triple() {
            delta.retract_triples.insert(triple);
        } else if let Some((predicate, args)) = record.as_atom() {
            delta.retract_atoms.insert((predicate, args.into()));
        }
    }
    Ok(())
}

/// Whether any rank holds a contradiction atom.
pub fn inconsistent(
    store: &FactStore,
    cluster: &mut Cluster<'_>,
    vocabulary: &Vocabulary,
) -> Result<bool, EngineError> {
    cluster.all_or(store.atoms().count(vocabulary.error) > 0)
}
