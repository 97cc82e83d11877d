//! The transaction payload events carry.

use serde::{Deserialize, Serialize};

use crate::PeerId;

/// A single user-level operation. An event's payload is an ordered sequence
/// of these (possibly empty).
#[derive(Serialize, Deserialize, Eq, PartialEq, Hash, Clone, Debug)]
pub enum Transaction {
    Transfer {
        sender: PeerId,
        receiver: PeerId,
        amount: u64,
        comment: Option<String>,
    },
    PublishName {
        member: PeerId,
        name: String,
    },
}
