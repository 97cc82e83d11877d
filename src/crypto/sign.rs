//! Ed25519 signing and verification, the one concrete backend this crate
//! ships: `ed25519-dalek`.

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Raw Ed25519 verifying key bytes; this is also a member's canonical id
/// (hex-encoded via its `Display` impl).
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct VerifyingKeyBytes(pub [u8; 32]);

impl VerifyingKeyBytes {
    pub fn from_key(key: &VerifyingKey) -> Self {
        Self(key.to_bytes())
    }

    pub fn to_key(&self) -> Result<VerifyingKey, SignError> {
        VerifyingKey::from_bytes(&self.0).map_err(|_| SignError::InvalidKey)
    }
}

impl std::fmt::Display for VerifyingKeyBytes {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for b in self.0 {
            write!(f, "{:02x}", b)?;
        }
        Ok(())
    }
}

impl std::fmt::Debug for VerifyingKeyBytes {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "VerifyingKeyBytes({self})")
    }
}

/// Raw Ed25519 signature bytes.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize, Debug)]
pub struct SignatureBytes(#[serde(with = "serde_big_array::BigArray")] pub [u8; 64]);

impl std::ops::BitXor for &SignatureBytes {
    type Output = SignatureBytes;

    fn bitxor(self, rhs: Self) -> Self::Output {
        let mut out = [0u8; 64];
        for (i, (a, b)) in self.0.iter().zip(rhs.0.iter()).enumerate() {
            out[i] = a ^ b;
        }
        SignatureBytes(out)
    }
}

impl SignatureBytes {
    /// The deterministic pseudo-random coin bit used for coin-round voting:
    /// the middle bit of the signature.
    pub fn middle_bit(&self) -> bool {
        let middle_bit_index = self.0.len() * 8 / 2;
        let middle_byte_index = middle_bit_index / 8;
        let middle_byte = self.0[middle_byte_index];
        let bit_in_byte = middle_bit_index % 8;
        (middle_byte >> bit_in_byte) & 1 != 0
    }
}

#[derive(Debug, Error)]
pub enum SignError {
    #[error("verifying key bytes do not form a valid point")]
    InvalidKey,
    #[error("signature bytes are malformed")]
    InvalidSignature,
    #[error("signature does not verify under the author's key")]
    BadSignature,
}

/// The local author's keypair. Never leaves the engine worker that owns it.
pub struct SigningIdentity {
    key: SigningKey,
}

impl SigningIdentity {
    pub fn generate<R: rand_core::CryptoRngCore>(rng: &mut R) -> Self {
        Self {
            key: SigningKey::generate(rng),
        }
    }

    pub fn from_bytes(bytes: &[u8; 32]) -> Self {
        Self {
            key: SigningKey::from_bytes(bytes),
        }
    }

    pub fn to_bytes(&self) -> [u8; 32] {
        self.key.to_bytes()
    }

    pub fn verifying_key(&self) -> VerifyingKeyBytes {
        VerifyingKeyBytes::from_key(&self.key.verifying_key())
    }

    pub fn sign(&self, message: &[u8]) -> SignatureBytes {
        SignatureBytes(self.key.sign(message).to_bytes())
    }
}

/// Verify `signature` over `message` under `author`. This is the one place
/// `BAD_SIGNATURE`/`ID_MISMATCH`-adjacent checks bottom out.
pub fn verify(
    author: &VerifyingKeyBytes,
    message: &[u8],
    signature: &SignatureBytes,
) -> Result<(), SignError> {
    let key = author.to_key()?;
    let sig = Signature::from_bytes(&signature.0);
    key.verify(message, &sig).map_err(|_| SignError::BadSignature)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sign_and_verify_roundtrip() {
        let mut rng = rand::thread_rng();
        let identity = SigningIdentity::generate(&mut rng);
        let msg = b"hello hashgraph";
        let sig = identity.sign(msg);
        verify(&identity.verifying_key(), msg, &sig).unwrap();
    }

    #[test]
    fn tampered_message_fails() {
        let mut rng = rand::thread_rng();
        let identity = SigningIdentity::generate(&mut rng);
        let sig = identity.sign(b"hello hashgraph");
        assert!(verify(&identity.verifying_key(), b"goodbye hashgraph", &sig).is_err());
    }

    #[test]
    fn middle_bit_is_deterministic() {
        let sig = SignatureBytes([0xAAu8; 64]);
        assert_eq!(sig.middle_bit(), sig.middle_bit());
    }
}
