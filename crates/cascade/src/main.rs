//! cascade: distributed forward-chaining over triple stores.
//!
//! Runs either as an in-process cluster (`--workers N`) or as one member of
//! a TCP cluster (`--rank R --peers a,b,c`), where every member is started
//! with the same arguments apart from `--rank`.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use cascade_dist::{DistConfig, TcpTransport};
use cascade_engine::{EngineConfig, Granularity, JoinStrategy, ReplicationPattern, Vocabulary};
use cascade_wire::{ConstId, Rule, decode_conditions, decode_rules};
use clap::{Parser, ValueEnum};
use miette::{IntoDiagnostic, Result, WrapErr, miette};
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod worker;

use worker::{Job, Outcome};

/// Line printed last when any rank derived a contradiction.
const INCONSISTENT: &str = "INCONSISTENT";

/// Exit status for `--fail-on-inconsistent`.
const EXIT_INCONSISTENT: i32 = 2;

#[derive(Parser)]
#[command(name = "cascade")]
#[command(about = "Distributed forward-chaining rule engine", long_about = None)]
struct Cli {
    /// Encoded rule file
    rules: PathBuf,

    /// Triple data file; `#` is replaced by the rank
    data: PathBuf,

    /// Output file; `#` is replaced by the rank
    output: PathBuf,

    /// Encoded replication patterns
    replication: Option<PathBuf>,

    /// Bytes per packet
    #[arg(long, env = "CASCADE_PACKET_SIZE", default_value = "256")]
    packet_size: usize,

    /// Send and receive slots per rank
    #[arg(long, env = "CASCADE_NUM_REQUESTS", default_value = "64")]
    num_requests: usize,

    /// Run the quiescence collective every N checks
    #[arg(long, env = "CASCADE_CHECK_EVERY", default_value = "16")]
    check_every: usize,

    /// I/O buffer size in bytes
    #[arg(long, env = "CASCADE_PAGE_SIZE", default_value = "65536")]
    page_size: usize,

    /// Deduplicate facts across ranks after the fixpoint
    #[arg(short, long, env = "CASCADE_UNIQ")]
    uniq: bool,

    /// Scatter loaded triples to random ranks before evaluating
    #[arg(long, env = "CASCADE_RANDOMIZE")]
    randomize: bool,

    /// Alternate evaluation and replication until replication adds nothing
    #[arg(long, env = "CASCADE_COMPLETE")]
    complete: bool,

    /// Ranks to run inside this process
    #[arg(long, env = "CASCADE_WORKERS", default_value = "1", conflicts_with = "rank")]
    workers: usize,

    /// This process's rank in a TCP cluster
    #[arg(long, env = "CASCADE_RANK", requires = "peers")]
    rank: Option<usize>,

    /// Addresses of every TCP cluster member, in rank order
    #[arg(long, env = "CASCADE_PEERS", value_delimiter = ',', requires = "rank")]
    peers: Vec<SocketAddr>,

    /// How joins between partitioned relations are answered
    #[arg(long, env = "CASCADE_JOIN_STRATEGY", value_enum, default_value = "redistribute")]
    join_strategy: JoinStrategyArg,

    /// When derived facts are applied
    #[arg(long, env = "CASCADE_GRANULARITY", value_enum, default_value = "round")]
    granularity: GranularityArg,

    /// Stop after this many rounds
    #[arg(long, env = "CASCADE_MAX_ROUNDS")]
    max_rounds: Option<usize>,

    /// Constant id of the contradiction predicate
    #[arg(long, env = "CASCADE_ERROR_PREDICATE", default_value = "1")]
    error_predicate: ConstId,

    /// Constant id of the `list_contains` builtin
    #[arg(long, env = "CASCADE_LIST_CONTAINS", default_value = "2")]
    list_contains: ConstId,

    /// Constant id of the type predicate behind `o # c`
    #[arg(long, env = "CASCADE_RDF_TYPE", default_value = "3")]
    rdf_type: ConstId,

    /// Constant id of the subclass predicate behind `a ## b`
    #[arg(long, env = "CASCADE_SUBCLASS_OF", default_value = "4")]
    subclass_of: ConstId,

    /// Exit with status 2 when the run is inconsistent
    #[arg(long, env = "CASCADE_FAIL_ON_INCONSISTENT")]
    fail_on_inconsistent: bool,

    /// Write a JSON summary of every local rank's run
    #[arg(long)]
    report: Option<PathBuf>,
}

#[derive(Clone, Copy, ValueEnum)]
enum JoinStrategyArg {
    Redistribute,
    Local,
}

#[derive(Clone, Copy, ValueEnum)]
enum GranularityArg {
    Round,
    Rule,
}

impl Cli {
    fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            join_strategy: match self.join_strategy {
                JoinStrategyArg::Redistribute => JoinStrategy::Redistribute,
                JoinStrategyArg::Local => JoinStrategy::Local,
            },
            granularity: match self.granularity {
                GranularityArg::Round => Granularity::Round,
                GranularityArg::Rule => Granularity::Rule,
            },
            max_rounds: self.max_rounds,
            vocabulary: Vocabulary {
                error: self.error_predicate,
                list_contains: self.list_contains,
                rdf_type: self.rdf_type,
                subclass_of: self.subclass_of,
            },
            dist: DistConfig {
                packet_size: self.packet_size,
                num_requests: self.num_requests,
                check_every: self.check_every,
                ..Default::default()
            },
        }
    }
}

fn main() -> Result<()> {
    // Diagnostics go to stderr; stdout stays free for the caller.
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "cascade=info".to_string()),
        ))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();
    let config = cli.engine_config();
    config.validate().map_err(|e| miette!("{}", e))?;

    let rules = load_rules(&cli.rules)?;
    let patterns = match &cli.replication {
        Some(path) => load_patterns(path, &config.vocabulary)?,
        None => Vec::new(),
    };
    info!(
        rules = rules.len(),
        patterns = patterns.len(),
        config = %serde_json::to_string(&config).into_diagnostic()?,
        "starting"
    );

    let job = Arc::new(Job {
        rules,
        patterns,
        data: cli.data.clone(),
        output: cli.output.clone(),
        page_size: cli.page_size,
        uniq: cli.uniq,
        randomize: cli.randomize,
        complete: cli.complete,
        config,
    });

    let (outcomes, reporting) = match cli.rank {
        Some(rank) => (vec![run_tcp(&job, rank, &cli.peers)?], rank == 0),
        None => (worker::run_local(Arc::clone(&job), cli.workers)?, true),
    };

    if let Some(path) = &cli.report {
        let json = serde_json::to_string_pretty(&outcomes).into_diagnostic()?;
        std::fs::write(path, json)
            .into_diagnostic()
            .wrap_err_with(|| format!("failed to write report to {}", path.display()))?;
    }

    let facts: usize = outcomes.iter().map(|o| o.written).sum();
    info!(ranks = outcomes.len(), facts, "finished");

    // Every rank sees the same reduced flag; one of them reports it.
    if reporting && outcomes.iter().any(|o| o.inconsistent) {
        eprintln!("{INCONSISTENT}");
        if cli.fail_on_inconsistent {
            std::process::exit(EXIT_INCONSISTENT);
        }
    }
    Ok(())
}

fn run_tcp(job: &Job, rank: usize, peers: &[SocketAddr]) -> Result<Outcome> {
    if rank >= peers.len() {
        return Err(miette!(
            "rank {} is out of range for {} peers",
            rank,
            peers.len()
        ));
    }
    let mut transport = TcpTransport::connect(rank, peers, &job.config.dist)
        .map_err(|e| miette!("failed to join cluster: {}", e))?;
    worker::run(job, &mut transport).map_err(|e| {
        error!(rank, error = %e, "worker failed");
        miette!("rank {} failed: {}", rank, e)
    })
}

fn load_rules(path: &Path) -> Result<Vec<Rule>> {
    let bytes = std::fs::read(path)
        .into_diagnostic()
        .wrap_err_with(|| format!("failed to read rules from {}", path.display()))?;
    let (rules, fatal) = decode_rules(&bytes);
    if let Some(e) = fatal {
        error!(path = %path.display(), error = %e, decoded = rules.len(), "rule stream ended early");
    }
    Ok(rules)
}

fn load_patterns(path: &Path, vocabulary: &Vocabulary) -> Result<Vec<ReplicationPattern>> {
    let bytes = std::fs::read(path)
        .into_diagnostic()
        .wrap_err_with(|| format!("failed to read replication patterns from {}", path.display()))?;
    let (conditions, fatal) = decode_conditions(&bytes);
    if let Some(e) = fatal {
        error!(path = %path.display(), error = %e, decoded = conditions.len(), "pattern stream ended early");
    }
    let patterns: Vec<ReplicationPattern> = conditions
        .iter()
        .enumerate()
        .filter_map(|(index, condition)| {
            ReplicationPattern::from_condition(condition, vocabulary)
                .map_err(|e| error!(pattern = index, error = %e, "skipping replication pattern"))
                .ok()
        })
        .collect();
    if patterns.len() < conditions.len() {
        warn!(
            kept = patterns.len(),
            skipped = conditions.len() - patterns.len(),
            "some replication patterns were skipped"
        );
    }
    Ok(patterns)
}

#[cfg(test)]
mod tests {
    use super::*;
    use cascade_wire::{Atomic, Condition, Encode, Term};
    use pretty_assertions::assert_eq;

    #[test]
    fn test_cli_defaults() {
        let cli = Cli::try_parse_from(["cascade", "rules.bin", "data#.nt", "out#.nt"]).unwrap();
        let config = cli.engine_config();
        assert_eq!(config.dist, DistConfig::default());
        assert_eq!(config.vocabulary, Vocabulary::default());
        assert_eq!(config.join_strategy, JoinStrategy::Redistribute);
        assert_eq!(cli.workers, 1);
        assert!(cli.replication.is_none());
    }

    #[test]
    fn test_cluster_flags() {
        let cli = Cli::try_parse_from([
            "cascade",
            "-u",
            "--rank",
            "1",
            "--peers",
            "127.0.0.1:7000,127.0.0.1:7001",
            "--join-strategy",
            "local",
            "--granularity",
            "rule",
            "rules.bin",
            "data.nt",
            "out.nt",
            "patterns.bin",
        ])
        .unwrap();
        assert!(cli.uniq);
        assert_eq!(cli.rank, Some(1));
        assert_eq!(cli.peers.len(), 2);
        let config = cli.engine_config();
        assert_eq!(config.join_strategy, JoinStrategy::Local);
        assert_eq!(config.granularity, Granularity::Rule);
    }

    #[test]
    fn test_unsupported_patterns_are_skipped() {
        let frame = |p| {
            Condition::Atomic(Atomic::Frame {
                object: Term::Variable(0),
                slots: vec![(Term::Constant(p), Term::Variable(1))],
            })
        };
        let mut file = Vec::new();
        file.extend_from_slice(&frame(7).to_bytes());
        file.extend_from_slice(&Condition::Conjunction(vec![frame(8), frame(9)]).to_bytes());
        let membership = Condition::Atomic(Atomic::Membership(Term::Variable(0), Term::Constant(11)));
        file.extend_from_slice(&membership.to_bytes());

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("patterns.bin");
        std::fs::write(&path, &file).unwrap();

        let patterns = load_patterns(&path, &Vocabulary::default()).unwrap();
        let shapes: Vec<_> = patterns.iter().map(ReplicationPattern::pattern).collect();
        assert_eq!(shapes, vec![[0, 7, 0], [0, 3, 11]]);
    }

    #[test]
    fn test_rank_requires_peers() {
        assert!(Cli::try_parse_from(["cascade", "--rank", "0", "r", "d", "o"]).is_err());
    }
}
