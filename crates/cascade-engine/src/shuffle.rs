//! Moving rows, triples and atoms between ranks.
//!
//! Every record travels as one fixed-size packet:
//! `[kind u8][ncols u8][ncols × u64 BE][zero padding]`. Routing is a plain
//! [`Exchange`] over the distribution substrate, so a call to
//! [`Cluster::route`] is a collective: every rank must make it, in the same
//! order, even when it has nothing to send.

use std::collections::VecDeque;
use std::hash::{BuildHasher, BuildHasherDefault, Hasher};

use cascade_dist::{DistConfig, Exchange, Pickup, Transport, run_exchange};
use cascade_wire::{ConstId, Triple, UNBOUND, VarId};
use seahash::SeaHasher;
use tracing::{debug, trace};

use crate::error::EngineError;
use crate::tuple::{Relation, Tuple};

type PlacementHasher = BuildHasherDefault<SeaHasher>;

const HEADER_LEN: usize = 2;
/// Widest record a packet header can describe.
pub(crate) const MAX_COLUMNS: usize = u8::MAX as usize;

/// Rank that owns `columns` under hash placement.
pub fn placement(columns: &[ConstId], size: usize) -> usize {
    let mut hasher = PlacementHasher::default().build_hasher();
    for c in columns {
        hasher.write(&c.to_be_bytes());
    }
    (hasher.finish() % size as u64) as usize
}

/// Bytes a record of `columns` values needs on the wire.
pub const fn packet_len(columns: usize) -> usize {
    HEADER_LEN + columns * 8
}

/// Fail unless a record of `columns` values fits one packet.
pub fn check_fits(columns: usize, packet_size: usize) -> Result<(), EngineError> {
    if columns > MAX_COLUMNS || packet_len(columns) > packet_size {
        return Err(EngineError::PacketTooSmall {
            columns,
            packet_size,
        });
    }
    Ok(())
}

/// What a packet carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum Kind {
    Row = 1,
    Triple = 2,
    /// Predicate first, then the arguments.
    Atom = 3,
}

impl Kind {
    fn from_u8(tag: u8) -> Option<Self> {
        match tag {
            1 => Some(Kind::Row),
            2 => Some(Kind::Triple),
            3 => Some(Kind::Atom),
            _ => None,
        }
    }
}

/// A record in transit.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct Record {
    pub kind: Kind,
    pub columns: Box<[ConstId]>,
}

impl Record {
    pub fn row(row: Tuple) -> Self {
        Self {
            kind: Kind::Row,
            columns: row,
        }
    }

    pub fn triple(triple: Triple) -> Self {
        Self {
            kind: Kind::Triple,
            columns: Box::new(triple),
        }
    }

    pub fn atom(predicate: ConstId, args: &[ConstId]) -> Self {
        let mut columns = Vec::with_capacity(args.len() + 1);
        columns.push(predicate);
        columns.extend_from_slice(args);
        Self {
            kind: Kind::Atom,
            columns: columns.into(),
        }
    }

    /// The triple this record carries, if it is one.
    pub fn as_triple(&self) -> Option<Triple> {
        match (self.kind, &self.columns[..]) {
            (Kind::Triple, &[s, p, o]) => Some([s, p, o]),
            _ => None,
        }
    }

    /// Predicate and arguments, if this is an atom.
    pub fn as_atom(&self) -> Option<(ConstId, &[ConstId])> {
        match (self.kind, self.columns.split_first()) {
            (Kind::Atom, Some((p, args))) => Some((*p, args)),
            _ => None,
        }
    }

    /// Write into a zeroed, packet-sized buffer.
    pub fn encode(&self, packet: &mut [u8]) -> Result<(), EngineError> {
        let n = self.columns.len();
        check_fits(n, packet.len())?;
        packet[0] = self.kind as u8;
        packet[1] = n as u8;
        for (chunk, c) in packet[HEADER_LEN..packet_len(n)]
            .chunks_exact_mut(8)
            .zip(self.columns.iter())
        {
            chunk.copy_from_slice(&c.to_be_bytes());
        }
        Ok(())
    }

    pub fn decode(packet: &[u8]) -> Result<Self, EngineError> {
        if packet.len() < HEADER_LEN {
            return Err(EngineError::CorruptPacket(format!(
                "{} bytes is shorter than the header",
                packet.len()
            )));
        }
        let kind = Kind::from_u8(packet[0])
            .ok_or_else(|| EngineError::CorruptPacket(format!("unknown kind {}", packet[0])))?;
        let n = packet[1] as usize;
        let end = packet_len(n);
        if end > packet.len() {
            return Err(EngineError::CorruptPacket(format!(
                "{n} columns overrun a {}-byte packet",
                packet.len()
            )));
        }
        let columns = packet[HEADER_LEN..end]
            .chunks_exact(8)
            .map(|chunk| {
                let mut bytes = [0u8; 8];
                bytes.copy_from_slice(chunk);
                ConstId::from_be_bytes(bytes)
            })
            .collect();
        let record = Self { kind, columns };
        if record.kind == Kind::Triple && record.columns.len() != 3 {
            return Err(EngineError::CorruptPacket(format!(
                "triple with {n} columns"
            )));
        }
        if record.kind == Kind::Atom && record.columns.is_empty() {
            return Err(EngineError::CorruptPacket("atom without predicate".into()));
        }
        Ok(record)
    }
}

/// Where a record should end up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    To(usize),
    /// Every rank, this one included.
    All,
    /// Every rank except this one.
    Others,
}

impl Route {
    fn includes(self, dest: usize, rank: usize) -> bool {
        match self {
            Route::To(r) => r == dest,
            Route::All => true,
            Route::Others => dest != rank,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Parcel {
    pub route: Route,
    pub record: Record,
}

impl Parcel {
    pub fn new(route: Route, record: Record) -> Self {
        Self { route, record }
    }
}

/// Sends queued parcels and collects what arrives.
struct RecordExchange {
    rank: usize,
    size: usize,
    parcels: std::vec::IntoIter<Parcel>,
    current: Option<(Record, VecDeque<usize>)>,
    received: Vec<Record>,
}

impl RecordExchange {
    /// Next remote destination and its record, skipping this rank.
    fn next_remote(&mut self) -> Option<(usize, &Record)> {
        loop {
            if self.current.as_ref().is_some_and(|(_, dests)| dests.is_empty()) {
                self.current = None;
            }
            if self.current.is_none() {
                let parcel = self.parcels.next()?;
                let dests = (0..self.size)
                    .filter(|&d| d != self.rank && parcel.route.includes(d, self.rank))
                    .collect();
                self.current = Some((parcel.record, dests));
                continue;
            }
            let (record, dests) = self.current.as_mut()?;
            let dest = dests.pop_front()?;
            return Some((dest, record));
        }
    }
}

impl Exchange for RecordExchange {
    type Error = EngineError;

    fn pickup(&mut self, packet: &mut [u8]) -> Result<Pickup, EngineError> {
        match self.next_remote() {
            Some((dest, record)) => {
                record.encode(packet)?;
                Ok(Pickup::Packet(dest))
            }
            None => Ok(Pickup::Exhausted),
        }
    }

    fn dropoff(&mut self, packet: &[u8]) -> Result<(), EngineError> {
        self.received.push(Record::decode(packet)?);
        Ok(())
    }
}

/// One rank's handle on the cluster for the duration of an evaluation.
pub struct Cluster<'t> {
    transport: &'t mut dyn Transport,
    config: DistConfig,
}

impl<'t> Cluster<'t> {
    pub fn new(transport: &'t mut dyn Transport, config: DistConfig) -> Self {
        Self { transport, config }
    }

    pub fn rank(&self) -> usize {
        self.transport.rank()
    }

    pub fn size(&self) -> usize {
        self.transport.size()
    }

    pub fn config(&self) -> &DistConfig {
        &self.config
    }

    pub fn all_or(&mut self, flag: bool) -> Result<bool, EngineError> {
        Ok(self.transport.all_reduce_or(flag)?)
    }

    pub fn all_sum(&mut self, value: i64) -> Result<i64, EngineError> {
        Ok(self.transport.all_reduce_sum(value)?)
    }

    /// Deliver every parcel to its destinations and return what this rank
    /// receives, its own parcels included.
    pub fn route(&mut self, parcels: Vec<Parcel>) -> Result<Vec<Record>, EngineError> {
        let rank = self.rank();
        let size = self.size();

        let mut local = Vec::new();
        let mut remote = Vec::new();
        for parcel in parcels {
            if parcel.route.includes(rank, rank) {
                local.push(parcel.record.clone());
            }
            if size > 1 && (0..size).any(|d| d != rank && parcel.route.includes(d, rank)) {
                remote.push(parcel);
            }
        }
        if size == 1 {
            return Ok(local);
        }

        let mut exchange = RecordExchange {
            rank,
            size,
            parcels: remote.into_iter(),
            current: None,
            received: local,
        };
        let stats = run_exchange(&mut *self.transport, &self.config, &mut exchange)?;
        trace!(sent = stats.sent, received = stats.received, "records routed");
        Ok(exchange.received)
    }

    /// Copy `relation` to every rank. The result is replicated.
    pub fn broadcast(&mut self, relation: Relation) -> Result<Relation, EngineError> {
        if relation.is_replicated() || self.size() == 1 {
            return Ok(relation);
        }
        let width = relation.width();
        let bound = relation.bound().clone();
        let parcels = relation
            .into_rows()
            .into_iter()
            .map(|row| Parcel::new(Route::All, Record::row(row)))
            .collect();
        let mut rows: Vec<Tuple> = self
            .route(parcels)?
            .into_iter()
            .map(|r| r.columns)
            .collect();
        rows.sort();
        let mut out = Relation::new(width, bound, rows);
        out.set_replicated(true);
        Ok(out)
    }

    /// Partition `relation` by the hash of its `key` columns.
    ///
    /// Returns `(hashed, wild)`: rows whose key is fully bound, now held by
    /// their owner rank, and rows with an unbound key column, now held by
    /// every rank.
    pub fn co_locate(
        &mut self,
        relation: Relation,
        key: &[VarId],
    ) -> Result<(Relation, Relation), EngineError> {
        let size = self.size();
        let width = relation.width();
        let bound = relation.bound().clone();

        let parcels = relation
            .into_rows()
            .into_iter()
            .map(|row| {
                let values: Vec<ConstId> = key.iter().map(|&c| row[c as usize]).collect();
                let route = if values.contains(&UNBOUND) {
                    Route::All
                } else {
                    Route::To(placement(&values, size))
                };
                Parcel::new(route, Record::row(row))
            })
            .collect();

        let (wild, hashed): (Vec<Tuple>, Vec<Tuple>) = self
            .route(parcels)?
            .into_iter()
            .map(|r| r.columns)
            .partition(|row| key.iter().any(|&c| row[c as usize] == UNBOUND));

        debug!(
            hashed = hashed.len(),
            wild = wild.len(),
            "co-located relation"
        );
        let mut wild_rows = wild;
        wild_rows.sort();
        let mut wild = Relation::new(width, bound.clone(), wild_rows);
        wild.set_replicated(true);
        Ok((Relation::new(width, bound, hashed), wild))
    }

    /// Gather every rank's records on every rank, sorted and deduplicated.
    pub fn gather(&mut self, records: Vec<Record>) -> Result<Vec<Record>, EngineError> {
        let parcels = records
            .into_iter()
            .map(|record| Parcel::new(Route::All, record))
            .collect();
        let mut all = self.route(parcels)?;
        all.sort();
        all.dedup();
        Ok(all)
    }
}
