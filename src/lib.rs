//! Gossip-about-gossip hashgraph consensus with an account-balance ledger.
//!
//! The hashgraph engine ([`algorithm`]) is the core: a DAG of signed
//! [`algorithm::event::Event`]s, round/witness assignment, virtual voting
//! fame decisions, and the total order they produce. [`ledger`] folds that
//! total order into account balances, stakes and published names. [`network`]
//! implements the push gossip protocol that replicates events between peers.

pub mod common;
pub mod config;
pub mod crypto;
pub mod ledger;
pub mod member;
pub mod network;
pub mod node;
pub mod persistence;
pub mod registry;
pub mod transactions;

pub mod algorithm;

/// A member is identified by the raw bytes of its Ed25519 verifying key.
pub type PeerId = crypto::VerifyingKeyBytes;

/// Milliseconds since the Unix epoch, chosen by the event's author.
pub type Timestamp = i64;

pub use algorithm::datastructure::{Graph as Hashgraph, PushError, PushKind, RoundNum};
