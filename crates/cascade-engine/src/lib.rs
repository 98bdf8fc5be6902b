//! Distributed forward-chaining evaluation for cascade.
//!
//! This crate provides:
//! - The fact store with its three triple orders and atom buckets
//! - The unification join and condition evaluator
//! - The fixpoint driver and rule-head execution
//! - Redistribution over the cluster: joins, dedup, replication

mod action;
mod config;
mod error;
mod filters;
mod fixpoint;
pub mod index;
mod query;
mod replicate;
mod shuffle;
mod store;
pub mod tuple;
mod uniq;

pub use action::{Delta, execute};
pub use config::{EngineConfig, Granularity, JoinStrategy, Vocabulary};
pub use error::EngineError;
pub use fixpoint::{Fixpoint, FixpointReport, RoundReport, inconsistent};
pub use query::{Evaluator, project};
pub use replicate::{CompletionReport, ReplicationPattern, complete, randomize, replicate};
pub use shuffle::{Cluster, Kind, Parcel, Record, Route, placement};
pub use store::{FactStore, Signature};
pub use tuple::Relation;
pub use uniq::uniq;
