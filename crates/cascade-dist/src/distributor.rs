//! Credit-limited packet distribution with cluster-wide termination detection.
//!
//! Every rank starts with one unit of outstanding work. An accepted send adds
//! one, a received packet removes one, and `no_more_sends` removes the
//! initial unit. The cluster is quiescent exactly when the sum over all ranks
//! is zero: every rank has declared it is done sending and every sent packet
//! has been received. `done()` checks that sum with a collective reduction.

use tracing::{debug, trace, warn};

use crate::config::DistConfig;
use crate::error::DistError;
use crate::transport::{SendOutcome, SendRequest, Transport};

/// Counters for one exchange.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DistStats {
    pub sent: u64,
    pub received: u64,
    pub reductions: u64,
}

/// Distributor state for one exchange over a borrowed transport.
pub struct Distributor<'t, T: Transport + ?Sized> {
    transport: &'t mut T,
    packet_size: usize,
    check_every: usize,
    drain_spin_limit: usize,
    slots: Vec<Option<SendRequest>>,
    net_outstanding: i64,
    no_more_sends: bool,
    done_calls: usize,
    finished: bool,
    stats: DistStats,
}

impl<'t, T: Transport + ?Sized> Distributor<'t, T> {
    /// Set up the send-slot pool. Receive slots are the transport's inbox.
    pub fn new(transport: &'t mut T, config: &DistConfig) -> Self {
        Self {
            transport,
            packet_size: config.packet_size,
            check_every: config.check_every.max(1),
            drain_spin_limit: config.drain_spin_limit.max(1),
            slots: vec![None; config.num_requests.max(1)],
            net_outstanding: 1,
            no_more_sends: false,
            done_calls: 0,
            finished: false,
            stats: DistStats::default(),
        }
    }

    pub fn rank(&self) -> usize {
        self.transport.rank()
    }

    pub fn size(&self) -> usize {
        self.transport.size()
    }

    pub fn packet_size(&self) -> usize {
        self.packet_size
    }

    pub fn stats(&self) -> DistStats {
        self.stats
    }

    /// This rank's outstanding-work counter.
    pub fn net_outstanding(&self) -> i64 {
        self.net_outstanding
    }

    fn free_slot(&mut self) -> Option<usize> {
        self.slots
            .iter()
            .position(|slot| slot.as_ref().is_none_or(SendRequest::is_complete))
    }

    /// Try to send one packet. `Ok(false)` means no send slot or no room at
    /// the destination; retry after receiving.
    pub fn send(&mut self, dest: usize, packet: &[u8]) -> Result<bool, DistError> {
        if self.no_more_sends {
            return Err(DistError::SendAfterNoMoreSends);
        }
        if packet.len() != self.packet_size {
            return Err(DistError::PacketSize {
                expected: self.packet_size,
                got: packet.len(),
            });
        }
        let Some(slot) = self.free_slot() else {
            return Ok(false);
        };
        match self.transport.try_send(dest, packet.to_vec())? {
            SendOutcome::Posted(request) => {
                self.slots[slot] = Some(request);
                self.net_outstanding += 1;
                self.stats.sent += 1;
                Ok(true)
            }
            SendOutcome::Busy(_) => Ok(false),
        }
    }

    /// Poll for one received packet.
    pub fn receive(&mut self) -> Result<Option<Vec<u8>>, DistError> {
        let Some(packet) = self.transport.try_receive()? else {
            return Ok(None);
        };
        if packet.len() != self.packet_size {
            return Err(DistError::PacketSize {
                expected: self.packet_size,
                got: packet.len(),
            });
        }
        self.net_outstanding -= 1;
        self.stats.received += 1;
        Ok(Some(packet))
    }

    /// Declare that this rank will not send again.
    pub fn no_more_sends(&mut self) -> Result<(), DistError> {
        if self.no_more_sends {
            return Err(DistError::NoMoreSendsTwice);
        }
        self.no_more_sends = true;
        self.net_outstanding -= 1;
        trace!(rank = self.rank(), net = self.net_outstanding, "no more sends");
        Ok(())
    }

    /// Throttled global quiescence test.
    ///
    /// Every `check_every`th call runs a sum reduction of the outstanding
    /// counters. Every rank must keep calling `done()` until it returns true,
    /// since the reductions are collective.
    pub fn done(&mut self) -> Result<bool, DistError> {
        if self.finished {
            return Ok(true);
        }
        self.done_calls += 1;
        if self.done_calls % self.check_every != 0 {
            return Ok(false);
        }

        self.stats.reductions += 1;
        let total = self.transport.all_reduce_sum(self.net_outstanding)?;
        trace!(rank = self.rank(), local = self.net_outstanding, total, "quiescence check");

        if total < 0 {
            return Err(DistError::Protocol(format!(
                "cluster outstanding count went negative ({total})"
            )));
        }
        if total != 0 {
            return Ok(false);
        }

        self.drain_sends()?;
        let stray = self.transport.cancel_receives()?;
        if stray > 0 {
            warn!(rank = self.rank(), stray, "discarded packets after quiescence");
        }
        // No rank may start its next exchange until every rank has drained
        // this one, or the drain above could swallow the next exchange's packets.
        self.transport.all_reduce_sum(0)?;
        self.stats.reductions += 1;
        self.finished = true;
        debug!(
            rank = self.rank(),
            sent = self.stats.sent,
            received = self.stats.received,
            reductions = self.stats.reductions,
            "distribution quiescent"
        );
        Ok(true)
    }

    fn drain_sends(&mut self) -> Result<(), DistError> {
        for spin in 0..self.drain_spin_limit {
            let pending = self
                .slots
                .iter()
                .filter(|slot| slot.as_ref().is_some_and(|r| !r.is_complete()))
                .count();
            if pending == 0 {
                self.slots.iter_mut().for_each(|slot| *slot = None);
                return Ok(());
            }
            if spin % 64 == 63 {
                std::thread::yield_now();
            } else {
                std::hint::spin_loop();
            }
        }
        let pending = self
            .slots
            .iter()
            .filter(|slot| slot.as_ref().is_some_and(|r| !r.is_complete()))
            .count();
        Err(DistError::DrainTimeout { pending })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loopback::Loopback;

    fn config() -> DistConfig {
        DistConfig {
            packet_size: 16,
            num_requests: 2,
            check_every: 1,
            ..Default::default()
        }
    }

    #[test]
    fn test_counter_follows_sends_and_receives() {
        let mut transport = Loopback::new(8);
        let config = config();
        let mut dist = Distributor::new(&mut transport, &config);

        assert_eq!(dist.net_outstanding(), 1);
        assert!(dist.send(0, &[0; 16]).unwrap());
        assert_eq!(dist.net_outstanding(), 2);
        assert!(dist.receive().unwrap().is_some());
        assert_eq!(dist.net_outstanding(), 1);
        dist.no_more_sends().unwrap();
        assert_eq!(dist.net_outstanding(), 0);
        assert!(dist.done().unwrap());
    }

    #[test]
    fn test_not_done_before_no_more_sends() {
        let mut transport = Loopback::new(8);
        let config = config();
        let mut dist = Distributor::new(&mut transport, &config);
        assert!(!dist.done().unwrap());
    }

    #[test]
    fn test_not_done_with_undelivered_packet() {
        let mut transport = Loopback::new(8);
        let config = config();
        let mut dist = Distributor::new(&mut transport, &config);
        assert!(dist.send(0, &[1; 16]).unwrap());
        dist.no_more_sends().unwrap();
        assert!(!dist.done().unwrap());
        assert!(dist.receive().unwrap().is_some());
        assert!(dist.done().unwrap());
    }

    #[test]
    fn test_slot_pool_limits_in_flight_sends() {
        let mut transport = Loopback::new(8);
        let config = config();
        let mut dist = Distributor::new(&mut transport, &config);
        assert!(dist.send(0, &[0; 16]).unwrap());
        assert!(dist.send(0, &[0; 16]).unwrap());
        assert!(!dist.send(0, &[0; 16]).unwrap());
        dist.receive().unwrap();
        assert!(dist.send(0, &[0; 16]).unwrap());
    }

    #[test]
    fn test_no_more_sends_twice_is_an_error() {
        let mut transport = Loopback::default();
        let config = config();
        let mut dist = Distributor::new(&mut transport, &config);
        dist.no_more_sends().unwrap();
        assert!(matches!(dist.no_more_sends(), Err(DistError::NoMoreSendsTwice)));
        assert!(matches!(
            dist.send(0, &[0; 16]),
            Err(DistError::SendAfterNoMoreSends)
        ));
    }

    #[test]
    fn test_wrong_packet_size_rejected() {
        let mut transport = Loopback::default();
        let config = config();
        let mut dist = Distributor::new(&mut transport, &config);
        assert!(matches!(
            dist.send(0, &[0; 3]),
            Err(DistError::PacketSize { expected: 16, got: 3 })
        ));
    }

    #[test]
    fn test_done_is_throttled() {
        let mut transport = Loopback::default();
        let config = DistConfig {
            packet_size: 16,
            check_every: 3,
            ..Default::default()
        };
        let mut dist = Distributor::new(&mut transport, &config);
        dist.no_more_sends().unwrap();
        assert!(!dist.done().unwrap());
        assert!(!dist.done().unwrap());
        assert!(dist.done().unwrap());
        assert_eq!(dist.stats().reductions, 2);
    }
}
