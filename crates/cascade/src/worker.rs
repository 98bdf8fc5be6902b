//! One rank's run: load, place, evaluate, deduplicate, write.

use std::path::PathBuf;
use std::sync::Arc;
use std::thread;

use cascade_dist::{LocalCluster, Loopback, Transport};
use cascade_engine::{
    Cluster, EngineConfig, EngineError, FactStore, Fixpoint, FixpointReport, ReplicationPattern, complete,
    inconsistent, randomize, replicate, uniq,
};
use cascade_wire::{Rule, Shard, Triple, output_path, read_triples, write_triples};
use miette::{Result, miette};
use serde::Serialize;
use tracing::{info, info_span};

/// Everything a rank needs to run. Shared read-only between ranks.
#[derive(Debug)]
pub struct Job {
    pub rules: Vec<Rule>,
    pub patterns: Vec<ReplicationPattern>,
    pub data: PathBuf,
    pub output: PathBuf,
    pub page_size: usize,
    pub uniq: bool,
    pub randomize: bool,
    pub complete: bool,
    pub config: EngineConfig,
}

/// What one rank did.
#[derive(Debug, Clone, Serialize)]
pub struct Outcome {
    pub rank: usize,
    pub loaded: usize,
    pub written: usize,
    pub fixpoint: FixpointReport,
    pub replication_passes: usize,
    pub inconsistent: bool,
}

/// Run `job` as one rank of the cluster `transport` belongs to.
pub fn run(job: &Job, transport: &mut dyn Transport) -> Result<Outcome, EngineError> {
    let rank = transport.rank();
    let size = transport.size();
    let _span = info_span!("worker", rank).entered();

    let shard = Shard::resolve(&job.data, rank, size);
    let triples = read_triples(&shard, job.page_size)?;
    let loaded = triples.len();
    let mut store = FactStore::from_triples(triples);
    info!(loaded, facts = store.len(), "loaded shard");

    let mut cluster = Cluster::new(transport, job.config.dist.clone());
    if job.randomize {
        randomize(&mut store, &mut cluster)?;
    }

    let fixpoint = Fixpoint::new(&job.rules, &job.config);
    let (report, replication_passes) = if job.complete {
        let report = complete(&fixpoint, &mut store, &mut cluster, &job.patterns)?;
        (report.fixpoint, report.passes)
    } else {
        if !job.patterns.is_empty() {
            replicate(&mut store, &mut cluster, &job.patterns)?;
        }
        (fixpoint.run(&mut store, &mut cluster)?, 0)
    };

    if job.uniq {
        uniq(&mut store, &mut cluster)?;
    }
    let inconsistent = inconsistent(&store, &mut cluster, &job.config.vocabulary)?;

    let path = output_path(&job.output, rank, size);
    let triples: Vec<Triple> = store.triples().collect();
    let written = write_triples(&path, job.page_size, &triples)?;
    info!(written, path = %path.display(), "wrote output");

    Ok(Outcome {
        rank,
        loaded,
        written,
        fixpoint: report,
        replication_passes,
        inconsistent,
    })
}

/// Run `job` on `workers` ranks inside this process.
pub fn run_local(job: Arc<Job>, workers: usize) -> Result<Vec<Outcome>> {
    if workers <= 1 {
        let mut transport = Loopback::default();
        let outcome = run(&job, &mut transport).map_err(|e| miette!("{}", e))?;
        return Ok(vec![outcome]);
    }

    let capacity = job.config.dist.num_requests;
    let handles = LocalCluster::new(workers, capacity)
        .into_iter()
        .enumerate()
        .map(|(rank, mut transport)| {
            let job = Arc::clone(&job);
            thread::Builder::new()
                .name(format!("rank-{rank}"))
                .spawn(move || run(&job, &mut transport))
                .map_err(|e| miette!("failed to spawn rank {}: {}", rank, e))
        })
        .collect::<Result<Vec<_>>>()?;

    let mut outcomes = Vec::with_capacity(workers);
    let mut first_error = None;
    for (rank, handle) in handles.into_iter().enumerate() {
        match handle.join() {
            Ok(Ok(outcome)) => outcomes.push(outcome),
            Ok(Err(e)) => {
                first_error.get_or_insert_with(|| miette!("rank {} failed: {}", rank, e));
            }
            Err(_) => {
                first_error.get_or_insert_with(|| miette!("rank {} panicked", rank));
            }
        }
    }
    match first_error {
        Some(e) => Err(e),
        None => Ok(outcomes),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cascade_wire::{Action, Atomic, Condition, Term};
    use pretty_assertions::assert_eq;
    use std::collections::BTreeSet;
    use std::path::Path;

    fn chain_rule() -> Rule {
        let frame = |s, o| Atomic::Frame {
            object: s,
            slots: vec![(Term::Constant(5), o)],
        };
        Rule::new(
            Condition::Conjunction(vec![
                Condition::Atomic(frame(Term::Variable(0), Term::Variable(1))),
                Condition::Atomic(frame(Term::Variable(1), Term::Variable(2))),
            ]),
            vec![Action::AssertFact(frame(Term::Variable(0), Term::Variable(2)))],
        )
    }

    fn job(dir: &Path, uniq: bool) -> Job {
        let data = dir.join("chain.nt");
        let triples: Vec<Triple> = (1..8).map(|i| [i, 5, i + 1]).collect();
        write_triples(&data, 4096, &triples).unwrap();
        Job {
            rules: vec![chain_rule()],
            patterns: Vec::new(),
            data,
            output: dir.join("out#.nt"),
            page_size: 4096,
            uniq,
            randomize: false,
            complete: false,
            config: EngineConfig::default(),
        }
    }

    fn written(dir: &Path, ranks: usize) -> Vec<Triple> {
        let mut all = Vec::new();
        for rank in 0..ranks {
            let shard = Shard::Own(dir.join(format!("out{rank}.nt")));
            all.extend(read_triples(&shard, 4096).unwrap());
        }
        all
    }

    #[test]
    fn test_single_rank_run_writes_closure() {
        let dir = tempfile::tempdir().unwrap();
        let outcomes = run_local(Arc::new(job(dir.path(), false)), 1).unwrap();
        assert_eq!(outcomes.len(), 1);
        assert_eq!(outcomes[0].written, 28);
        assert!(outcomes[0].fixpoint.converged);
        assert!(!outcomes[0].inconsistent);
        assert_eq!(written(dir.path(), 1).len(), 28);
    }

    #[test]
    fn test_cluster_run_with_uniq_writes_each_fact_once() {
        let dir = tempfile::tempdir().unwrap();
        let outcomes = run_local(Arc::new(job(dir.path(), true)), 3).unwrap();
        assert_eq!(outcomes.iter().map(|o| o.loaded).sum::<usize>(), 7);
        let all = written(dir.path(), 3);
        let distinct: BTreeSet<_> = all.iter().copied().collect();
        assert_eq!(all.len(), 28);
        assert_eq!(distinct.len(), 28);
    }

    #[test]
    fn test_missing_data_file_fails() {
        let dir = tempfile::tempdir().unwrap();
        let mut job = job(dir.path(), false);
        job.data = dir.path().join("missing.nt");
        assert!(run_local(Arc::new(job), 2).is_err());
    }
}
