//! Multi-rank exchange tests over the in-process and TCP clusters.

use std::net::{SocketAddr, TcpListener};
use std::thread;

use pretty_assertions::assert_eq;
use proptest::prelude::*;
use rand::{Rng, SeedableRng, rngs::StdRng};

use cascade_dist::{
    DistConfig, DistError, Exchange, LocalCluster, Pickup, TcpTransport, Transport, run_exchange,
};

/// Sends a fixed list of (dest, payload) packets, optionally idling first.
struct Scripted {
    outgoing: Vec<(usize, u64)>,
    next: usize,
    idle_passes: usize,
    received: Vec<u64>,
}

impl Exchange for Scripted {
    type Error = DistError;

    fn pickup(&mut self, packet: &mut [u8]) -> Result<Pickup, DistError> {
        if self.idle_passes > 0 {
            self.idle_passes -= 1;
            return Ok(Pickup::Wait);
        }
        let Some(&(dest, payload)) = self.outgoing.get(self.next) else {
            return Ok(Pickup::Exhausted);
        };
        self.next += 1;
        packet[..8].copy_from_slice(&payload.to_be_bytes());
        Ok(Pickup::Packet(dest))
    }

    fn dropoff(&mut self, packet: &[u8]) -> Result<(), DistError> {
        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(&packet[..8]);
        self.received.push(u64::from_be_bytes(bytes));
        Ok(())
    }
}

fn config(check_every: usize, num_requests: usize) -> DistConfig {
    DistConfig {
        packet_size: 16,
        num_requests,
        check_every,
        ..Default::default()
    }
}

/// Run one exchange per rank on its own thread; returns (sent, received) per rank.
fn run_cluster(
    scripts: Vec<Scripted>,
    config: DistConfig,
) -> Vec<(u64, Vec<u64>)> {
    let cluster = LocalCluster::new(scripts.len(), config.num_requests);
    let handles: Vec<_> = cluster
        .into_iter()
        .zip(scripts)
        .map(|(mut transport, mut script)| {
            let config = config.clone();
            thread::spawn(move || {
                let stats = run_exchange(&mut transport, &config, &mut script).unwrap();
                assert_eq!(stats.received as usize, script.received.len());
                (stats.sent, script.received)
            })
        })
        .collect();
    handles.into_iter().map(|h| h.join().unwrap()).collect()
}

fn free_addrs(n: usize) -> Vec<SocketAddr> {
    let listeners: Vec<_> = (0..n)
        .map(|_| TcpListener::bind("127.0.0.1:0").unwrap())
        .collect();
    listeners.iter().map(|l| l.local_addr().unwrap()).collect()
}

/// Like [`run_cluster`], but each rank joins a loopback TCP cluster and runs
/// `exchanges` scripts back to back on the same connection.
fn run_tcp_cluster(scripts: Vec<Vec<Scripted>>, config: DistConfig) -> Vec<Vec<(u64, Vec<u64>)>> {
    let addrs = free_addrs(scripts.len());
    let handles: Vec<_> = scripts
        .into_iter()
        .enumerate()
        .map(|(rank, scripts)| {
            let addrs = addrs.clone();
            let config = config.clone();
            thread::spawn(move || {
                let mut transport = TcpTransport::connect(rank, &addrs, &config).unwrap();
                scripts
                    .into_iter()
                    .map(|mut script| {
                        let stats = run_exchange(&mut transport, &config, &mut script).unwrap();
                        assert_eq!(stats.received as usize, script.received.len());
                        (stats.sent, script.received)
                    })
                    .collect()
            })
        })
        .collect();
    handles.into_iter().map(|h| h.join().unwrap()).collect()
}

fn random_scripts(size: usize, per_rank: usize, seed: u64) -> Vec<Scripted> {
    let mut rng = StdRng::seed_from_u64(seed);
    (0..size)
        .map(|rank| Scripted {
            outgoing: (0..per_rank)
                .map(|i| (rng.gen_range(0..size), (rank * 1_000_000 + i) as u64))
                .collect(),
            next: 0,
            idle_passes: 0,
            received: Vec::new(),
        })
        .collect()
}

#[test]
fn test_every_packet_is_received_exactly_once() {
    let scripts = random_scripts(4, 500, 7);
    let mut expected: Vec<u64> = scripts
        .iter()
        .flat_map(|s| s.outgoing.iter().map(|&(_, p)| p))
        .collect();
    expected.sort_unstable();

    let results = run_cluster(scripts, config(4, 8));
    let total_sent: u64 = results.iter().map(|(sent, _)| sent).sum();
    let mut received: Vec<u64> = results.into_iter().flat_map(|(_, r)| r).collect();
    received.sort_unstable();

    assert_eq!(total_sent as usize, expected.len());
    assert_eq!(received, expected);
}

#[test]
fn test_packets_reach_their_destination() {
    let scripts = random_scripts(3, 200, 11);
    let routes: Vec<(usize, u64)> = scripts.iter().flat_map(|s| s.outgoing.clone()).collect();
    let results = run_cluster(scripts, config(2, 4));

    for (dest, payload) in routes {
        assert!(results[dest].1.contains(&payload), "{payload} missing on rank {dest}");
    }
}

#[test]
fn test_slow_producer_is_not_cut_off() {
    // Rank 0 has nothing to send and checks for quiescence every pass;
    // rank 1 idles for a long time before sending everything to rank 0.
    let eager = Scripted {
        outgoing: Vec::new(),
        next: 0,
        idle_passes: 0,
        received: Vec::new(),
    };
    let slow = Scripted {
        outgoing: (0..100).map(|i| (0, i)).collect(),
        next: 0,
        idle_passes: 2_000,
        received: Vec::new(),
    };

    let results = run_cluster(vec![eager, slow], config(1, 2));
    assert_eq!(results[0].1.len(), 100);
    assert!(results[1].1.is_empty());
}

#[test]
fn test_empty_exchange_terminates() {
    let scripts = (0..3)
        .map(|_| Scripted {
            outgoing: Vec::new(),
            next: 0,
            idle_passes: 0,
            received: Vec::new(),
        })
        .collect();
    let results = run_cluster(scripts, config(1, 1));
    assert!(results.iter().all(|(sent, received)| *sent == 0 && received.is_empty()));
}

#[test]
fn test_back_to_back_exchanges_share_a_transport() {
    let handles: Vec<_> = LocalCluster::new(2, 2)
        .into_iter()
        .map(|mut transport| {
            thread::spawn(move || {
                let config = config(3, 2);
                let rank = transport.rank();
                let mut totals = Vec::new();
                for round in 0..3u64 {
                    let mut script = Scripted {
                        outgoing: (0..20).map(|i| (1 - rank, round * 100 + i)).collect(),
                        next: 0,
                        idle_passes: 0,
                        received: Vec::new(),
                    };
                    run_exchange(&mut transport, &config, &mut script).unwrap();
                    totals.push(script.received.len());
                }
                totals
            })
        })
        .collect();

    for handle in handles {
        assert_eq!(handle.join().unwrap(), vec![20, 20, 20]);
    }
}

#[test]
fn test_tcp_packets_reach_their_destination_once() {
    let scripts = random_scripts(3, 300, 23);
    let routes: Vec<(usize, u64)> = scripts.iter().flat_map(|s| s.outgoing.clone()).collect();
    let results = run_tcp_cluster(scripts.into_iter().map(|s| vec![s]).collect(), config(2, 2));

    let total_sent: u64 = results.iter().map(|rank| rank[0].0).sum();
    assert_eq!(total_sent as usize, routes.len());
    for (dest, payload) in &routes {
        let copies = results[*dest][0].1.iter().filter(|p| *p == payload).count();
        assert_eq!(copies, 1, "{payload} on rank {dest}");
    }
    let received: usize = results.iter().map(|rank| rank[0].1.len()).sum();
    assert_eq!(received, routes.len());
}

#[test]
fn test_tcp_back_to_back_exchanges() {
    let scripts = (0..3)
        .map(|rank: usize| {
            (0..3u64)
                .map(|round| Scripted {
                    outgoing: (0..40).map(|i| ((rank + 1) % 3, round * 1_000 + i)).collect(),
                    next: 0,
                    idle_passes: if rank == 0 { 500 } else { 0 },
                    received: Vec::new(),
                })
                .collect()
        })
        .collect();
    let results = run_tcp_cluster(scripts, config(3, 1));

    for rank in results {
        let counts: Vec<usize> = rank.iter().map(|(_, received)| received.len()).collect();
        assert_eq!(counts, vec![40, 40, 40]);
    }
}

proptest! {
    #![proptest_config(ProptestConfig { cases: 16, ..ProptestConfig::default() })]

    #[test]
    fn conservation_holds_for_any_traffic(
        size in 1usize..5,
        per_rank in 0usize..120,
        check_every in 1usize..8,
        num_requests in 1usize..6,
        seed in any::<u64>(),
    ) {
        let scripts = random_scripts(size, per_rank, seed);
        let results = run_cluster(scripts, config(check_every, num_requests));
        let sent: u64 = results.iter().map(|(s, _)| s).sum();
        let received: usize = results.iter().map(|(_, r)| r.len()).sum();
        prop_assert_eq!(sent as usize, size * per_rank);
        prop_assert_eq!(received, size * per_rank);
    }
}
