//! The member registry: the local view of every known participant, keyed by
//! verifying key.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::crypto::SigningIdentity;
use crate::PeerId;

/// A known participant. `signing_key` is only ever populated for the local
/// identity; it is never serialized into a snapshot read by a remote peer.
pub struct Member {
    pub verifying_key: PeerId,
    pub head: Option<crate::algorithm::event::Hash>,
    pub stake: u64,
    pub name: Option<String>,
    pub address: Option<(String, u16)>,
}

/// On-disk shape of a [`Member`], with the signing key split out so callers
/// can choose whether to persist it (only ever true for the local identity).
#[derive(Serialize, Deserialize, Clone)]
pub struct MemberRecord {
    pub verifying_key: PeerId,
    pub signing_key: Option<[u8; 32]>,
    pub head: Option<crate::algorithm::event::Hash>,
    pub stake: u64,
    pub host: Option<String>,
    pub port: Option<u16>,
    pub name: Option<String>,
}

/// Local view of all known participants. Stake is fixed at genesis and never
/// mutated thereafter.
#[derive(Default)]
pub struct MemberRegistry {
    members: HashMap<PeerId, Member>,
}

impl MemberRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a member with the configured default stake. Re-registering
    /// an already-known member is a no-op (stake must never change).
    pub fn register(&mut self, id: PeerId, default_stake: u64) {
        self.members.entry(id).or_insert_with(|| Member {
            verifying_key: id,
            head: None,
            stake: default_stake,
            name: None,
            address: None,
        });
    }

    pub fn register_with_stake(&mut self, id: PeerId, stake: u64) {
        self.members.entry(id).or_insert_with(|| Member {
            verifying_key: id,
            head: None,
            stake,
            name: None,
            address: None,
        });
    }

    pub fn contains(&self, id: &PeerId) -> bool {
        self.members.contains_key(id)
    }

    pub fn get(&self, id: &PeerId) -> Option<&Member> {
        self.members.get(id)
    }

    pub fn set_head(&mut self, id: &PeerId, head: crate::algorithm::event::Hash) {
        if let Some(m) = self.members.get_mut(id) {
            m.head = Some(head);
        }
    }

    pub fn set_name(&mut self, id: &PeerId, name: String) {
        if let Some(m) = self.members.get_mut(id) {
            m.name = Some(name);
        }
    }

    pub fn set_address(&mut self, id: &PeerId, host: String, port: u16) {
        if let Some(m) = self.members.get_mut(id) {
            m.address = Some((host, port));
        }
    }

    pub fn stake_of(&self, id: &PeerId) -> u64 {
        self.members.get(id).map(|m| m.stake).unwrap_or(0)
    }

    pub fn total_stake(&self) -> u64 {
        self.members.values().map(|m| m.stake).sum()
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    pub fn ids(&self) -> impl Iterator<Item = &PeerId> {
        self.members.keys()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&PeerId, &Member)> {
        self.members.iter()
    }

    pub fn to_records(&self, local_signing: Option<&SigningIdentity>) -> Vec<MemberRecord> {
        self.members
            .values()
            .map(|m| MemberRecord {
                verifying_key: m.verifying_key,
                signing_key: local_signing
                    .filter(|s| s.verifying_key() == m.verifying_key)
                    .map(|s| s.to_bytes()),
                head: m.head.clone(),
                stake: m.stake,
                host: m.address.as_ref().map(|(h, _)| h.clone()),
                port: m.address.as_ref().map(|(_, p)| *p),
                name: m.name.clone(),
            })
            .collect()
    }

    pub fn from_records(records: Vec<MemberRecord>) -> (Self, Option<SigningIdentity>) {
        let mut registry = Self::new();
        let mut local_signing = None;
        for record in records {
            if let Some(bytes) = record.signing_key {
                local_signing = Some(SigningIdentity::from_bytes(&bytes));
            }
            registry.members.insert(
                record.verifying_key,
                Member {
                    verifying_key: record.verifying_key,
                    head: record.head,
                    stake: record.stake,
                    name: record.name,
                    address: record.host.zip(record.port),
                },
            );
        }
        (registry, local_signing)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stake_fixed_at_registration() {
        let mut registry = MemberRegistry::new();
        let id = PeerId([1u8; 32]);
        registry.register(id, 1);
        registry.register(id, 99); // second call must not change stake
        assert_eq!(registry.stake_of(&id), 1);
    }

    #[test]
    fn total_stake_sums_members() {
        let mut registry = MemberRegistry::new();
        registry.register(PeerId([1u8; 32]), 1);
        registry.register(PeerId([2u8; 32]), 1);
        registry.register(PeerId([3u8; 32]), 1);
        assert_eq!(registry.total_stake(), 3);
    }
}
