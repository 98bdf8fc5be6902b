//! In-process cluster: one transport per thread.
//!
//! Each rank owns a bounded crossbeam inbox whose capacity plays the role of
//! its pre-posted receive slots. Collectives meet at a shared reducer.

use std::sync::Arc;

use crossbeam::channel::{self, Receiver, Sender, TryRecvError, TrySendError};
use parking_lot::{Condvar, Mutex};
use tracing::debug;

use crate::error::DistError;
use crate::transport::{SendOutcome, SendRequest, Transport, check_rank};

struct Envelope {
    packet: Vec<u8>,
    request: SendRequest,
}

#[derive(Default)]
struct ReduceState {
    generation: u64,
    arrived: usize,
    accumulator: i64,
    result: i64,
    abandoned: bool,
}

/// Generation-counted barrier that sums one value per rank.
struct Reducer {
    size: usize,
    state: Mutex<ReduceState>,
    arrived: Condvar,
}

impl Reducer {
    fn sum(&self, rank: usize, value: i64) -> Result<i64, DistError> {
        let mut state = self.state.lock();
        if state.abandoned {
            return Err(DistError::Disconnected { peer: rank });
        }
        let generation = state.generation;
        state.accumulator += value;
        state.arrived += 1;

        if state.arrived == self.size {
            state.result = state.accumulator;
            state.accumulator = 0;
            state.arrived = 0;
            state.generation += 1;
            self.arrived.notify_all();
            return Ok(state.result);
        }

        while state.generation == generation {
            if state.abandoned {
                return Err(DistError::Disconnected { peer: rank });
            }
            self.arrived.wait(&mut state);
        }
        Ok(state.result)
    }

    fn abandon(&self) {
        let mut state = self.state.lock();
        state.abandoned = true;
        self.arrived.notify_all();
    }
}

/// Builder for an in-process cluster.
pub struct LocalCluster;

impl LocalCluster {
    /// Create `size` connected transports, one per rank, in rank order.
    ///
    /// `capacity` bounds each rank's inbox.
    pub fn new(size: usize, capacity: usize) -> Vec<LocalTransport> {
        let size = size.max(1);
        let (senders, receivers): (Vec<_>, Vec<_>) =
            (0..size).map(|_| channel::bounded(capacity.max(1))).unzip();
        let reducer = Arc::new(Reducer {
            size,
            state: Mutex::new(ReduceState::default()),
            arrived: Condvar::new(),
        });

        debug!(size, capacity, "created local cluster");

        receivers
            .into_iter()
            .enumerate()
            .map(|(rank, inbox)| LocalTransport {
                rank,
                inbox,
                peers: senders.clone(),
                reducer: Arc::clone(&reducer),
            })
            .collect()
    }
}

/// One rank of a [`LocalCluster`].
pub struct LocalTransport {
    rank: usize,
    inbox: Receiver<Envelope>,
    peers: Vec<Sender<Envelope>>,
    reducer: Arc<Reducer>,
}

impl Transport for LocalTransport {
    fn rank(&self) -> usize {
        self.rank
    }

    fn size(&self) -> usize {
        self.peers.len()
    }

    fn try_send(&mut self, dest: usize, packet: Vec<u8>) -> Result<SendOutcome, DistError> {
        check_rank(dest, self.peers.len())?;
        let request = SendRequest::new();
        let envelope = Envelope {
            packet,
            request: request.clone(),
        };
        match self.peers[dest].try_send(envelope) {
            Ok(()) => Ok(SendOutcome::Posted(request)),
            Err(TrySendError::Full(envelope)) => Ok(SendOutcome::Busy(envelope.packet)),
            Err(TrySendError::Disconnected(_)) => Err(DistError::Disconnected { peer: dest }),
        }
    }

    fn try_receive(&mut self) -> Result<Option<Vec<u8>>, DistError> {
        match self.inbox.try_recv() {
            Ok(envelope) => {
                envelope.request.complete();
                Ok(Some(envelope.packet))
            }
            Err(TryRecvError::Empty) => Ok(None),
            Err(TryRecvError::Disconnected) => Err(DistError::Disconnected { peer: self.rank }),
        }
    }

    fn all_reduce_sum(&mut self, value: i64) -> Result<i64, DistError> {
        self.reducer.sum(self.rank, value)
    }

    fn cancel_receives(&mut self) -> Result<usize, DistError> {
        let mut stray = 0;
        while let Ok(envelope) = self.inbox.try_recv() {
            envelope.request.complete();
            stray += 1;
        }
        Ok(stray)
    }
}

impl Drop for LocalTransport {
    fn drop(&mut self) {
        // Wake any rank still waiting on a collective this rank will never join.
        self.reducer.abandon();
    }
}
