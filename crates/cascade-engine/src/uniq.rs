//! Cluster-wide deduplication.
//!
//! Every fact moves to the rank its whole-record hash names, so copies held
//! by several ranks meet on one rank and collapse in its store.

use tracing::{info, instrument};

use crate::error::EngineError;
use crate::shuffle::{Cluster, Parcel, Record, Route, check_fits, placement};
use crate::store::FactStore;

/// Rehome every fact by hash. Returns the number of facts this rank holds
/// afterwards.
#[instrument(skip_all, fields(rank = cluster.rank()))]
pub fn uniq(store: &mut FactStore, cluster: &mut Cluster<'_>) -> Result<usize, EngineError> {
    let size = cluster.size();
    if size == 1 {
        return Ok(store.len() + store.atoms().len());
    }

    let packet_size = cluster.config().packet_size;
    let widest = store.atoms().iter().map(|(_, args)| args.len() + 1).max().unwrap_or(0);
    let too_wide = check_fits(widest, packet_size).is_err();
    if cluster.all_or(too_wide)? {
        return Err(EngineError::PacketTooSmall {
            columns: widest,
            packet_size,
        });
    }

    let (triples, atoms) = store.drain();
    let before = triples.len() + atoms.len();
    let parcels: Vec<Parcel> = triples
        .into_iter()
        .map(Record::triple)
        .chain(atoms.iter().map(|(p, args)| Record::atom(p, args)))
        .map(|record| Parcel::new(Route::To(placement(&record.columns, size)), record))
        .collect();

    for record in cluster.route(parcels)? {
        if let Some(triple) = record.as_triple() {
            store.insert(&triple);
        } else if let Some((predicate, args)) = record.as_atom() {
            store.insert_atom(predicate, args.into());
        }
    }

    let after = store.len() + store.atoms().len();
    info!(before, after, "deduplicated facts");
    Ok(after)
}
