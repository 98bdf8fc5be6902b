//! TCP cluster transport.
//!
//! One process per rank, fully meshed. Each connection carries framed
//! messages (`[kind u8][len u32 BE][body]`) in both directions. A writer
//! task per peer drains a bounded queue, so a full queue is what makes
//! `try_send` report busy. Reader tasks forward data frames into an
//! unbounded inbox: a rank blocked in a collective must never stall the
//! sockets of the ranks it is waiting for. Rank 0 coordinates collectives.

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::runtime::Runtime;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use crate::config::DistConfig;
use crate::error::DistError;
use crate::transport::{SendOutcome, SendRequest, Transport, check_rank};

const FRAME_DATA: u8 = 0;
const FRAME_REDUCE: u8 = 1;
const FRAME_REDUCE_RESULT: u8 = 2;

/// Body of a collective frame: one `i64`.
const CONTROL_LEN: usize = 8;

const CONNECT_ATTEMPTS: u32 = 300;
const CONNECT_BACKOFF: Duration = Duration::from_millis(100);
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

struct Outbound {
    kind: u8,
    body: Vec<u8>,
    request: Option<SendRequest>,
}

#[derive(Debug)]
enum Control {
    Reduce { from: usize, value: i64 },
    Result(i64),
}

/// One rank of a TCP cluster.
pub struct TcpTransport {
    rank: usize,
    size: usize,
    runtime: Runtime,
    writers: Vec<Option<mpsc::Sender<Outbound>>>,
    writer_tasks: Vec<JoinHandle<()>>,
    inbound: mpsc::UnboundedReceiver<Vec<u8>>,
    control: mpsc::UnboundedReceiver<Control>,
    local: VecDeque<(Vec<u8>, SendRequest)>,
    capacity: usize,
}

impl TcpTransport {
    /// Join the cluster whose members listen on `peers`, in rank order.
    ///
    /// Binds `peers[rank]`, dials every lower rank (retrying while they
    /// start up) and accepts every higher rank. `config.num_requests` bounds
    /// each peer's send queue; frames longer than `config.packet_size` are
    /// refused.
    #[tracing::instrument(skip(peers, config), fields(size = peers.len()))]
    pub fn connect(rank: usize, peers: &[SocketAddr], config: &DistConfig) -> Result<Self, DistError> {
        let size = peers.len();
        check_rank(rank, size)?;
        let capacity = config.num_requests;
        let max_frame = config.packet_size.max(CONTROL_LEN);

        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .thread_name("cascade-net")
            .enable_all()
            .build()?;

        let streams = runtime.block_on(establish(rank, peers))?;

        let (inbound_tx, inbound) = mpsc::unbounded_channel();
        let (control_tx, control) = mpsc::unbounded_channel();
        let mut writers = Vec::with_capacity(size);
        let mut writer_tasks = Vec::with_capacity(size.saturating_sub(1));

        for (peer, stream) in streams.into_iter().enumerate() {
            let Some(stream) = stream else {
                writers.push(None);
                continue;
            };
            stream.set_nodelay(true)?;
            let (read_half, write_half) = stream.into_split();
            let (tx, rx) = mpsc::channel(capacity.max(1));
            writer_tasks.push(runtime.spawn(write_loop(peer, write_half, rx)));
            runtime.spawn(read_loop(
                peer,
                read_half,
                max_frame,
                inbound_tx.clone(),
                control_tx.clone(),
            ));
            writers.push(Some(tx));
        }

        info!(rank, size, "joined tcp cluster");

        Ok(Self {
            rank,
            size,
            runtime,
            writers,
            writer_tasks,
            inbound,
            control,
            local: VecDeque::with_capacity(capacity),
            capacity: capacity.max(1),
        })
    }

    fn writer(&self, peer: usize) -> Result<&mpsc::Sender<Outbound>, DistError> {
        self.writers
            .get(peer)
            .and_then(Option::as_ref)
            .ok_or(DistError::Disconnected { peer })
    }

    fn send_control(&self, peer: usize, kind: u8, value: i64) -> Result<(), DistError> {
        let writer = self.writer(peer)?;
        let frame = Outbound {
            kind,
            body: value.to_be_bytes().to_vec(),
            request: None,
        };
        self.runtime
            .block_on(writer.send(frame))
            .map_err(|_| DistError::Disconnected { peer })
    }

    fn next_control(&mut self) -> Result<Control, DistError> {
        self.runtime
            .block_on(self.control.recv())
            .ok_or(DistError::Disconnected { peer: 0 })
    }
}

async fn connect_with_retry(addr: SocketAddr) -> Result<TcpStream, DistError> {
    let mut last_error = None;
    for attempt in 0..CONNECT_ATTEMPTS {
        match TcpStream::connect(addr).await {
            Ok(stream) => return Ok(stream),
            Err(e) => {
                trace!(%addr, attempt, error = %e, "peer not up yet");
                last_error = Some(e);
                tokio::time::sleep(CONNECT_BACKOFF).await;
            }
        }
    }
    Err(DistError::Handshake(format!(
        "could not reach {addr}: {}",
        last_error.map_or_else(|| "no attempts".to_string(), |e| e.to_string())
    )))
}

async fn establish(rank: usize, peers: &[SocketAddr]) -> Result<Vec<Option<TcpStream>>, DistError> {
    let listener = TcpListener::bind(peers[rank]).await?;
    let mut streams: Vec<Option<TcpStream>> = (0..peers.len()).map(|_| None).collect();

    for (peer, addr) in peers.iter().enumerate().take(rank) {
        let mut stream = connect_with_retry(*addr).await?;
        stream.write_u32(rank as u32).await?;
        debug!(peer, %addr, "connected to lower rank");
        streams[peer] = Some(stream);
    }

    for _ in rank + 1..peers.len() {
        let (mut stream, addr) = listener.accept().await?;
        let peer = stream.read_u32().await? as usize;
        if peer <= rank || peer >= peers.len() || streams[peer].is_some() {
            return Err(DistError::Handshake(format!(
                "unexpected rank {peer} from {addr}"
            )));
        }
        debug!(peer, %addr, "accepted higher rank");
        streams[peer] = Some(stream);
    }

    Ok(streams)
}

async fn write_loop(peer: usize, mut half: OwnedWriteHalf, mut queue: mpsc::Receiver<Outbound>) {
    while let Some(frame) = queue.recv().await {
        let mut header = [0u8; 5];
        header[0] = frame.kind;
        header[1..].copy_from_slice(&(frame.body.len() as u32).to_be_bytes());
        let written = async {
            half.write_all(&header).await?;
            half.write_all(&frame.body).await
        }
        .await;
        if let Err(e) = written {
            warn!(peer, error = %e, "write to peer failed");
            return;
        }
        if let Some(request) = frame.request {
            request.complete();
        }
    }
    if let Err(e) = half.shutdown().await {
        debug!(peer, error = %e, "shutdown of write half failed");
    }
}

async fn read_loop(
    peer: usize,
    mut half: OwnedReadHalf,
    max_frame: usize,
    inbound: mpsc::UnboundedSender<Vec<u8>>,
    control: mpsc::UnboundedSender<Control>,
) {
    match read_frames(peer, &mut half, max_frame, &inbound, &control).await {
        Ok(()) => debug!(peer, "peer closed connection"),
        Err(e) => warn!(peer, error = %e, "read from peer failed"),
    }
}

async fn read_frames(
    peer: usize,
    half: &mut OwnedReadHalf,
    max_frame: usize,
    inbound: &mpsc::UnboundedSender<Vec<u8>>,
    control: &mpsc::UnboundedSender<Control>,
) -> std::io::Result<()> {
    loop {
        let kind = match half.read_u8().await {
            Ok(kind) => kind,
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(()),
            Err(e) => return Err(e),
        };
        let len = half.read_u32().await? as usize;
        if len > max_frame {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("{len}-byte frame exceeds the {max_frame}-byte limit"),
            ));
        }
        let mut body = vec![0u8; len];
        half.read_exact(&mut body).await?;

        let forwarded = match kind {
            FRAME_DATA => inbound.send(body).is_ok(),
            FRAME_REDUCE | FRAME_REDUCE_RESULT => {
                let Ok(bytes) = <[u8; 8]>::try_from(body.as_slice()) else {
                    return Err(std::io::Error::new(
                        std::io::ErrorKind::InvalidData,
                        format!("collective frame of {len} bytes"),
                    ));
                };
                let value = i64::from_be_bytes(bytes);
                let message = if kind == FRAME_REDUCE {
                    Control::Reduce { from: peer, value }
                } else {
                    Control::Result(value)
                };
                control.send(message).is_ok()
            }
            other => {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::InvalidData,
                    format!("unknown frame kind {other}"),
                ));
            }
        };
        if !forwarded {
            return Ok(());
        }
    }
}

impl Transport for TcpTransport {
    fn rank(&self) -> usize {
        self.rank
    }

    fn size(&self) -> usize {
        self.size
    }

    fn try_send(&mut self, dest: usize, packet: Vec<u8>) -> Result<SendOutcome, DistError> {
        check_rank(dest, self.size)?;
        let request = SendRequest::new();

        if dest == self.rank {
            if self.local.len() >= self.capacity {
                return Ok(SendOutcome::Busy(packet));
            }
            self.local.push_back((packet, request.clone()));
            return Ok(SendOutcome::Posted(request));
        }

        let frame = Outbound {
            kind: FRAME_DATA,
            body: packet,
            request: Some(request.clone()),
        };
        match self.writer(dest)?.try_send(frame) {
            Ok(()) => Ok(SendOutcome::Posted(request)),
            Err(mpsc::error::TrySendError::Full(frame)) => Ok(SendOutcome::Busy(frame.body)),
            Err(mpsc::error::TrySendError::Closed(_)) => Err(DistError::Disconnected { peer: dest }),
        }
    }

    fn try_receive(&mut self) -> Result<Option<Vec<u8>>, DistError> {
        if let Some((packet, request)) = self.local.pop_front() {
            request.complete();
            return Ok(Some(packet));
        }
        match self.inbound.try_recv() {
            Ok(packet) => Ok(Some(packet)),
            Err(mpsc::error::TryRecvError::Empty | mpsc::error::TryRecvError::Disconnected) => {
                Ok(None)
            }
        }
    }

    fn all_reduce_sum(&mut self, value: i64) -> Result<i64, DistError> {
        if self.size == 1 {
            return Ok(value);
        }

        if self.rank == 0 {
            let mut total = value;
            for _ in 1..self.size {
                match self.next_control()? {
                    Control::Reduce { from, value } => {
                        trace!(from, value, "collective contribution");
                        total += value;
                    }
                    Control::Result(_) => {
                        return Err(DistError::Protocol(
                            "collective result sent to the coordinator".to_string(),
                        ));
                    }
                }
            }
            for peer in 1..self.size {
                self.send_control(peer, FRAME_REDUCE_RESULT, total)?;
            }
            Ok(total)
        } else {
            self.send_control(0, FRAME_REDUCE, value)?;
            match self.next_control()? {
                Control::Result(total) => Ok(total),
                Control::Reduce { from, .. } => Err(DistError::Protocol(format!(
                    "collective contribution from rank {from} at a non-coordinator"
                ))),
            }
        }
    }

    fn cancel_receives(&mut self) -> Result<usize, DistError> {
        let mut stray = 0;
        for (_, request) in self.local.drain(..) {
            request.complete();
            stray += 1;
        }
        while self.inbound.try_recv().is_ok() {
            stray += 1;
        }
        Ok(stray)
    }
}

impl Drop for TcpTransport {
    fn drop(&mut self) {
        // Closing the queues lets each writer flush what is left and shut
        // its half of the connection.
        self.writers.clear();
        let tasks = std::mem::take(&mut self.writer_tasks);
        let flushed = self.runtime.block_on(async {
            tokio::time::timeout(SHUTDOWN_TIMEOUT, async {
                for task in tasks {
                    let _ = task.await;
                }
            })
            .await
        });
        if flushed.is_err() {
            warn!(rank = self.rank, "timed out flushing connections");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener as StdListener;
    use std::thread;

    fn free_addrs(n: usize) -> Vec<SocketAddr> {
        let listeners: Vec<_> = (0..n)
            .map(|_| StdListener::bind("127.0.0.1:0").unwrap())
            .collect();
        listeners.iter().map(|l| l.local_addr().unwrap()).collect()
    }

    #[test]
    fn test_two_rank_cluster_exchanges_packets_and_reduces() {
        let addrs = free_addrs(2);
        let handles: Vec<_> = (0..2)
            .map(|rank| {
                let addrs = addrs.clone();
                thread::spawn(move || {
                    let config = DistConfig {
                        num_requests: 8,
                        ..Default::default()
                    };
                    let mut transport = TcpTransport::connect(rank, &addrs, &config).unwrap();
                    let peer = 1 - rank;
                    loop {
                        match transport.try_send(peer, vec![rank as u8; 16]).unwrap() {
                            SendOutcome::Posted(_) => break,
                            SendOutcome::Busy(_) => thread::yield_now(),
                        }
                    }
                    let packet = loop {
                        if let Some(p) = transport.try_receive().unwrap() {
                            break p;
                        }
                        thread::yield_now();
                    };
                    let total = transport.all_reduce_sum(rank as i64 + 1).unwrap();
                    let any = transport.all_reduce_or(rank == 1).unwrap();
                    (packet, total, any)
                })
            })
            .collect();

        for (rank, handle) in handles.into_iter().enumerate() {
            let (packet, total, any) = handle.join().unwrap();
            assert_eq!(packet, vec![(1 - rank) as u8; 16]);
            assert_eq!(total, 3);
            assert!(any);
        }
    }

    #[test]
    fn test_oversized_frame_is_refused() {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        let err = runtime.block_on(async {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            let addr = listener.local_addr().unwrap();
            let mut client = TcpStream::connect(addr).await.unwrap();
            let (server, _) = listener.accept().await.unwrap();
            client.write_u8(FRAME_DATA).await.unwrap();
            client.write_u32(u32::MAX).await.unwrap();

            let (mut read_half, _write_half) = server.into_split();
            let (inbound, _inbound_rx) = mpsc::unbounded_channel();
            let (control, _control_rx) = mpsc::unbounded_channel();
            read_frames(1, &mut read_half, 64, &inbound, &control)
                .await
                .unwrap_err()
        });
        assert_eq!(err.kind(), std::io::ErrorKind::InvalidData);
    }
}
