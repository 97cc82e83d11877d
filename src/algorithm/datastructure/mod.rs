//! The hashgraph engine: event graph, round/witness assignment, virtual
//! voting, total ordering and the ledger projection.
//!
//! Split out from [`graph`] because several of these types (`PushError`,
//! `PushKind`, `PeerIndexEntry`, `RoundNum`) are referenced by
//! [`sync`]'s diff computation as well.

pub mod graph;
pub mod sync;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::algorithm::event::Hash;
use crate::PeerId;

pub use graph::{EventRecord, Graph};

/// A round number. Genesis events sit in round 1.
pub type RoundNum = u64;

/// Fame of a witness: undecided until virtual voting converges.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WitnessFamousness {
    Undecided,
    Yes,
    No,
}

/// Error returned when a fame/round query is made against a non-witness.
#[derive(Debug, PartialEq, Eq)]
pub struct NotWitness;

/// Per-author bookkeeping: which event was this author's genesis, and which
/// is currently the tip of their lane.
#[derive(Clone, Debug)]
pub struct PeerIndexEntry {
    pub genesis: Hash,
    pub latest_event: Hash,
}

impl PeerIndexEntry {
    pub fn new(genesis: Hash) -> Self {
        PeerIndexEntry {
            latest_event: genesis.clone(),
            genesis,
        }
    }

    /// Advances the author's lane tip. Forks are rejected earlier, at the
    /// point where a self-parent is found to already have a self-child, so
    /// this is infallible.
    pub fn advance(&mut self, new_latest: Hash) {
        self.latest_event = new_latest;
    }
}

/// Which shape of event to construct when pushing into the graph: a
/// genesis event carries no parents, a regular one names the peer it last
/// gossiped with as its other-parent.
#[derive(Debug, Clone)]
pub enum PushKind {
    Genesis,
    Regular(Hash),
}

#[derive(Debug, Error)]
pub enum PushError {
    #[error("peer {0} is not a known member")]
    PeerNotFound(PeerId),
    #[error("event {0:?} is already present in the graph")]
    NodeAlreadyExists(Hash),
    #[error("author already has a genesis event")]
    GenesisAlreadyExists,
    #[error("parent {0:?} is not known to the graph")]
    NoParent(Hash),
    #[error("self-parent is authored by {0}, not the pushing author {1}")]
    IncorrectAuthor(PeerId, PeerId),
    #[error("other-parent {0:?} is authored by the event's own author; other-parent must come from a different author")]
    SameAuthorParents(Hash),
    #[error("self-parent {0:?} already has a self-child; this would create a fork")]
    SelfChildAlreadyExists(Hash),
    #[error("event {0:?} has a height that doesn't follow its self-parent")]
    HeightMismatch(Hash),
    #[error(transparent)]
    Serialization(#[from] bincode::Error),
    #[error(transparent)]
    Signature(#[from] crate::algorithm::event::WithSignatureCreationError),
}
