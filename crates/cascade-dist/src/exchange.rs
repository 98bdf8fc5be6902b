//! The driving loop every distribution consumer plugs into.

use tracing::{debug, error};

use crate::config::DistConfig;
use crate::distributor::{DistStats, Distributor};
use crate::error::DistError;
use crate::transport::Transport;

/// What the producer side had to offer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pickup {
    /// A packet was written into the buffer, bound for this rank.
    Packet(usize),
    /// Nothing right now, but more may come.
    Wait,
    /// The producer will never offer another packet.
    Exhausted,
}

/// A distribution-consuming algorithm.
///
/// The loop asks `pickup` for outgoing packets and hands every received
/// packet to `dropoff`, until the cluster is quiescent.
pub trait Exchange {
    type Error: From<DistError> + std::fmt::Display;

    /// Called once before any packet moves.
    fn start(&mut self, _rank: usize, _size: usize) -> Result<(), Self::Error> {
        Ok(())
    }

    /// Fill `packet` (zeroed, packet-sized) with the next outgoing packet.
    fn pickup(&mut self, packet: &mut [u8]) -> Result<Pickup, Self::Error>;

    /// Consume one received packet.
    fn dropoff(&mut self, packet: &[u8]) -> Result<(), Self::Error>;

    /// Called once after quiescence.
    fn finish(&mut self) -> Result<(), Self::Error> {
        Ok(())
    }

    /// Called instead of `finish` when the loop fails.
    fn fail(&mut self, _error: &Self::Error) {}
}

/// Run `exchange` over `transport` until the whole cluster is quiescent.
///
/// `no_more_sends` is declared only once the producer is exhausted and its
/// last packet has been accepted, so no rank can contribute a zero counter
/// while it still has packets to send. `done()` is polled on every pass,
/// producing or not, so a rank blocked on a full peer still joins the
/// collectives that peer is waiting in.
#[tracing::instrument(skip_all, fields(rank = transport.rank()))]
pub fn run_exchange<T, E>(
    transport: &mut T,
    config: &DistConfig,
    exchange: &mut E,
) -> Result<DistStats, E::Error>
where
    T: Transport + ?Sized,
    E: Exchange + ?Sized,
{
    let rank = transport.rank();
    let size = transport.size();
    let receive_batch = config.num_requests.max(1);

    let result = (|| -> Result<DistStats, E::Error> {
        exchange.start(rank, size)?;
        let mut dist = Distributor::new(transport, config);
        let mut buffer = vec![0u8; dist.packet_size()];
        let mut pending: Option<usize> = None;
        let mut producing = true;

        loop {
            if producing && pending.is_none() {
                buffer.fill(0);
                match exchange.pickup(&mut buffer)? {
                    Pickup::Packet(dest) => pending = Some(dest),
                    Pickup::Wait => {}
                    Pickup::Exhausted => {
                        producing = false;
                        dist.no_more_sends()?;
                    }
                }
            }
            if let Some(dest) = pending
                && dist.send(dest, &buffer)?
            {
                pending = None;
            }

            for _ in 0..receive_batch {
                match dist.receive()? {
                    Some(packet) => exchange.dropoff(&packet)?,
                    None => break,
                }
            }

            if dist.done()? {
                break;
            }
        }

        let stats = dist.stats();
        exchange.finish()?;
        Ok(stats)
    })();

    match result {
        Ok(stats) => {
            debug!(
                sent = stats.sent,
                received = stats.received,
                reductions = stats.reductions,
                "exchange complete"
            );
            Ok(stats)
        }
        Err(e) => {
            error!(error = %e, "exchange failed");
            exchange.fail(&e);
            Err(e)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loopback::Loopback;

    /// Sends `count` numbered packets to itself and records what arrives.
    struct Counter {
        count: u8,
        next: u8,
        seen: Vec<u8>,
        finished: bool,
    }

    impl Exchange for Counter {
        type Error = DistError;

        fn pickup(&mut self, packet: &mut [u8]) -> Result<Pickup, DistError> {
            if self.next == self.count {
                return Ok(Pickup::Exhausted);
            }
            packet[0] = self.next;
            self.next += 1;
            Ok(Pickup::Packet(0))
        }

        fn dropoff(&mut self, packet: &[u8]) -> Result<(), DistError> {
            self.seen.push(packet[0]);
            Ok(())
        }

        fn finish(&mut self) -> Result<(), DistError> {
            self.finished = true;
            Ok(())
        }
    }

    #[test]
    fn test_loopback_exchange_delivers_everything() {
        let mut transport = Loopback::new(4);
        let config = DistConfig {
            packet_size: 16,
            num_requests: 2,
            check_every: 3,
            ..Default::default()
        };
        let mut counter = Counter {
            count: 50,
            next: 0,
            seen: Vec::new(),
            finished: false,
        };

        let stats = run_exchange(&mut transport, &config, &mut counter).unwrap();
        assert_eq!(stats.sent, 50);
        assert_eq!(stats.received, 50);
        assert!(counter.finished);
        counter.seen.sort_unstable();
        assert_eq!(counter.seen, (0..50).collect::<Vec<_>>());
    }

    struct Failing {
        failed: bool,
    }

    impl Exchange for Failing {
        type Error = DistError;

        fn pickup(&mut self, _packet: &mut [u8]) -> Result<Pickup, DistError> {
            Err(DistError::Protocol("boom".to_string()))
        }

        fn dropoff(&mut self, _packet: &[u8]) -> Result<(), DistError> {
            Ok(())
        }

        fn fail(&mut self, _error: &DistError) {
            self.failed = true;
        }
    }

    #[test]
    fn test_failure_reaches_fail_hook() {
        let mut transport = Loopback::default();
        let mut failing = Failing { failed: false };
        let config = DistConfig::default();
        assert!(run_exchange(&mut transport, &config, &mut failing).is_err());
        assert!(failing.failed);
    }
}
