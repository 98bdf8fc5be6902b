//! Wire formats for cascade.
//!
//! This crate provides:
//! - The rule abstract syntax (terms, atomics, conditions, actions, rules)
//! - The binary rule encoding, with strict length checking
//! - Triple data files and per-rank file naming

pub mod ast;
pub mod codec;
pub mod data;
mod error;

pub use ast::{Action, ActionBlock, Atomic, Condition, ConstId, Rule, Term, UNBOUND, VarId};
pub use codec::{BlockStream, Decode, Encode, decode, decode_conditions, decode_rules};
pub use data::{Shard, Triple, output_path, read_triples, write_triples};
pub use error::WireError;
