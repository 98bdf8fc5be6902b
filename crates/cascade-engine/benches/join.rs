use std::hint::black_box;

use cascade_dist::Loopback;
use cascade_engine::{Cluster, EngineConfig, FactStore, Fixpoint, Relation, tuple};
use cascade_wire::{Action, Atomic, Condition, Rule, Term};
use criterion::{BenchmarkId, Criterion, criterion_group, criterion_main};

fn relation(rows: u64, key_space: u64, bound: [u32; 2]) -> Relation {
    let data = (0..rows)
        .map(|i| {
            let mut row = vec![0; 3];
            row[bound[0] as usize] = i + 1;
            row[bound[1] as usize] = i % key_space + 1;
            row.into_boxed_slice()
        })
        .collect();
    Relation::new(3, bound.into_iter().collect(), data)
}

fn bench_join(c: &mut Criterion) {
    let mut group = c.benchmark_group("join");
    for rows in [1_000u64, 10_000] {
        let left = relation(rows, 100, [0, 1]);
        let right = relation(rows, 100, [2, 1]);
        group.bench_with_input(BenchmarkId::from_parameter(rows), &rows, |b, _| {
            b.iter(|| black_box(tuple::join(&left, &right)))
        });
    }
    group.finish();
}

fn bench_closure(c: &mut Criterion) {
    let frame = |s, p, o| Atomic::Frame {
        object: s,
        slots: vec![(p, o)],
    };
    let rules = [Rule::new(
        Condition::Conjunction(vec![
            Condition::Atomic(frame(Term::Variable(0), Term::Constant(5), Term::Variable(1))),
            Condition::Atomic(frame(Term::Variable(1), Term::Constant(5), Term::Variable(2))),
        ]),
        vec![Action::AssertFact(frame(
            Term::Variable(0),
            Term::Constant(5),
            Term::Variable(2),
        ))],
    )];
    let config = EngineConfig::default();

    c.bench_function("transitive closure of a 60-node chain", |b| {
        b.iter(|| {
            let mut store = FactStore::from_triples((1..60).map(|i| [i, 5, i + 1]));
            let mut transport = Loopback::default();
            let mut cluster = Cluster::new(&mut transport, config.dist.clone());
            let report = Fixpoint::new(&rules, &config).run(&mut store, &mut cluster);
            black_box(report.map(|r| r.inserted).unwrap_or_default())
        })
    });
}

criterion_group!(benches, bench_join, bench_closure);
criterion_main!(benches);
