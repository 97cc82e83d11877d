//! Cryptographic primitives: Ed25519 signatures, X25519 key agreement,
//! ChaCha20-Poly1305 AEAD framing and the stable Blake2b hash used to
//! content-address events.
//!
//! Kept deliberately thin: the hashgraph engine only ever sees the types in
//! this module (`VerifyingKeyBytes`, `Signature`, `Hash`), never a specific
//! crate's key type, so the engine's generic bounds stay in
//! [`algorithm::event`](crate::algorithm::event).

mod aead;
mod sign;

pub use aead::{EphemeralKeyAgreement, SessionError, SessionKeys, SessionReceiver, SessionSender};
pub use sign::{verify, SignError, SignatureBytes, SigningIdentity, VerifyingKeyBytes};

use blake2::{Blake2b512, Digest};

/// Output of [`hash`]: the 64-byte Blake2b-512 digest used to content-address
/// an event. A thin newtype rather than a bare array so id-comparisons and
/// hex formatting live in one place.
pub fn hash(bytes: &[u8]) -> [u8; 64] {
    let mut hasher = Blake2b512::new();
    hasher.update(bytes);
    let digest = hasher.finalize();
    let mut out = [0u8; 64];
    out.copy_from_slice(&digest);
    out
}
