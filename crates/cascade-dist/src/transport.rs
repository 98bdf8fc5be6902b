//! The message transport seam.
//!
//! A transport moves opaque packets between ranks and runs integer
//! collectives. It knows nothing about packet contents or termination;
//! the [`Distributor`](crate::Distributor) layers that on top.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::error::DistError;

/// Completion handle for one posted send.
///
/// The transport completes it once the packet has left the sender's hands
/// (delivered to the receiver's queue, or written to the socket).
#[derive(Debug, Clone, Default)]
pub struct SendRequest {
    complete: Arc<AtomicBool>,
}

impl SendRequest {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn complete(&self) {
        self.complete.store(true, Ordering::Release);
    }

    pub fn is_complete(&self) -> bool {
        self.complete.load(Ordering::Acquire)
    }
}

/// Result of offering a packet to a transport.
#[derive(Debug)]
pub enum SendOutcome {
    /// The transport took the packet.
    Posted(SendRequest),
    /// No room right now; the packet is handed back.
    Busy(Vec<u8>),
}

/// Point-to-point packets plus collectives.
pub trait Transport: Send {
    /// This worker's rank.
    fn rank(&self) -> usize;

    /// Number of workers in the cluster.
    fn size(&self) -> usize;

    /// Offer a packet to `dest` without blocking.
    fn try_send(&mut self, dest: usize, packet: Vec<u8>) -> Result<SendOutcome, DistError>;

    /// Take one delivered packet, if any, without blocking.
    fn try_receive(&mut self) -> Result<Option<Vec<u8>>, DistError>;

    /// Sum `value` across every rank. Blocks until all ranks contribute.
    fn all_reduce_sum(&mut self, value: i64) -> Result<i64, DistError>;

    /// Logical OR across every rank.
    fn all_reduce_or(&mut self, flag: bool) -> Result<bool, DistError> {
        Ok(self.all_reduce_sum(i64::from(flag))? != 0)
    }

    /// Discard any packets still queued for this rank, returning how many.
    fn cancel_receives(&mut self) -> Result<usize, DistError>;
}

impl<T: Transport + ?Sized> Transport for Box<T> {
    fn rank(&self) -> usize {
        (**self).rank()
    }

    fn size(&self) -> usize {
        (**self).size()
    }

    fn try_send(&mut self, dest: usize, packet: Vec<u8>) -> Result<SendOutcome, DistError> {
        (**self).try_send(dest, packet)
    }

    fn try_receive(&mut self) -> Result<Option<Vec<u8>>, DistError> {
        (**self).try_receive()
    }

    fn all_reduce_sum(&mut self, value: i64) -> Result<i64, DistError> {
        (**self).all_reduce_sum(value)
    }

    fn all_reduce_or(&mut self, flag: bool) -> Result<bool, DistError> {
        (**self).all_reduce_or(flag)
    }

    fn cancel_receives(&mut self) -> Result<usize, DistError> {
        (**self).cancel_receives()
    }
}

pub(crate) fn check_rank(rank: usize, size: usize) -> Result<(), DistError> {
    if rank >= size {
        return Err(DistError::InvalidRank { rank, size });
    }
    Ok(())
}
