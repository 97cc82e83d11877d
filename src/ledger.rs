//! Ledger projection: a deterministic fold over the total order producing
//! per-member balances and display names.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::transactions::Transaction;
use crate::PeerId;

/// State accumulated by applying `ordered_events` in order. Never mutated
/// except by [`Ledger::apply`], so re-deriving it from scratch always
/// reproduces the same values and total stake is conserved.
#[derive(Default, Serialize, Deserialize, Clone, Debug)]
pub struct Ledger {
    balances: HashMap<PeerId, u64>,
    names: HashMap<PeerId, String>,
}

impl Ledger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn balance_of(&self, member: &PeerId) -> u64 {
        self.balances.get(member).copied().unwrap_or(0)
    }

    pub fn name_of(&self, member: &PeerId) -> Option<&str> {
        self.names.get(member).map(String::as_str)
    }

    /// Applies one event's payload to the ledger, in payload order. A
    /// transfer that would underflow the sender's balance is skipped rather
    /// than rejected: the engine has already accepted the event into the
    /// total order, so the projection must stay total too.
    pub fn apply(&mut self, payload: &[Transaction]) {
        for tx in payload {
            match tx {
                Transaction::Transfer {
                    sender,
                    receiver,
                    amount,
                    ..
                } => {
                    let sender_balance = self.balances.entry(*sender).or_insert(0);
                    if *sender_balance < *amount {
                        continue;
                    }
                    *sender_balance -= amount;
                    *self.balances.entry(*receiver).or_insert(0) += amount;
                }
                Transaction::PublishName { member, name } => {
                    self.names.insert(*member, name.clone());
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer(b: u8) -> PeerId {
        PeerId([b; 32])
    }

    #[test]
    fn transfer_moves_balance() {
        let mut ledger = Ledger::new();
        ledger.apply(&[Transaction::Transfer {
            sender: peer(1),
            receiver: peer(1),
            amount: 0,
            comment: None,
        }]);
        // seed sender with a balance via a self-transfer of 0, then a real mint
        // is out of scope; instead verify underflow protection directly.
        ledger.apply(&[Transaction::Transfer {
            sender: peer(1),
            receiver: peer(2),
            amount: 5,
            comment: None,
        }]);
        assert_eq!(ledger.balance_of(&peer(1)), 0);
        assert_eq!(ledger.balance_of(&peer(2)), 0);
    }

    /// The same sequence of transfers folded into two independently
    /// seeded ledgers produces identical final balances, and total stake
    /// is conserved across the fold.
    #[test]
    fn transfer_sequence_is_deterministic_across_independent_ledgers() {
        let (a, b, c) = (peer(1), peer(2), peer(3));
        let seed = || Ledger {
            balances: HashMap::from([(a, 100), (b, 100), (c, 100)]),
            names: HashMap::new(),
        };
        let transfers = [
            Transaction::Transfer {
                sender: a,
                receiver: b,
                amount: 10,
                comment: None,
            },
            Transaction::Transfer {
                sender: b,
                receiver: c,
                amount: 5,
                comment: None,
            },
            Transaction::Transfer {
                sender: c,
                receiver: a,
                amount: 3,
                comment: None,
            },
        ];

        let mut first = seed();
        let mut second = seed();
        for tx in &transfers {
            first.apply(std::slice::from_ref(tx));
        }
        second.apply(&transfers);

        assert_eq!(first.balance_of(&a), 93);
        assert_eq!(first.balance_of(&b), 105);
        assert_eq!(first.balance_of(&c), 102);
        assert_eq!(first.balance_of(&a), second.balance_of(&a));
        assert_eq!(first.balance_of(&b), second.balance_of(&b));
        assert_eq!(first.balance_of(&c), second.balance_of(&c));
        let total: u64 = [a, b, c].iter().map(|m| first.balance_of(m)).sum();
        assert_eq!(total, 300);
    }

    #[test]
    fn publish_name_overwrites() {
        let mut ledger = Ledger::new();
        ledger.apply(&[Transaction::PublishName {
            member: peer(1),
            name: "alice".into(),
        }]);
        ledger.apply(&[Transaction::PublishName {
            member: peer(1),
            name: "alice2".into(),
        }]);
        assert_eq!(ledger.name_of(&peer(1)), Some("alice2"));
    }
}
