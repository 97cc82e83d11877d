//! Registry interface: an external address-book service the core only
//! consumes to bootstrap, never to decide consensus. The core ships a trait
//! plus the in-memory stand-in tests use, and nothing that talks to a real
//! directory service.

use thiserror::Error;

use crate::PeerId;

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("registry lookup failed: {0}")]
    Lookup(String),
}

/// One entry `query_members` hands back: who, where, and their published
/// display name if any.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistryEntry {
    pub member: PeerId,
    pub host: String,
    pub port: u16,
    pub name: Option<String>,
}

/// The two operations the core's bootstrap path consumes. A real
/// implementation talks to whatever directory service the deployment uses;
/// the core never relies on it for consensus correctness.
pub trait Registry {
    fn register(&self, member: PeerId, host: &str, port: u16) -> Result<(), RegistryError>;
    fn query_members(&self) -> Result<Vec<RegistryEntry>, RegistryError>;
}

/// An in-memory registry that never returns any peers. Useful in tests and
/// single-node setups where no bootstrap directory is configured.
#[derive(Default)]
pub struct NullRegistry;

impl Registry for NullRegistry {
    fn register(&self, _member: PeerId, _host: &str, _port: u16) -> Result<(), RegistryError> {
        Ok(())
    }

    fn query_members(&self) -> Result<Vec<RegistryEntry>, RegistryError> {
        Ok(Vec::new())
    }
}
