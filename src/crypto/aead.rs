//! Transport session crypto: X25519 key agreement, HKDF key derivation, and
//! ChaCha20-Poly1305 framing with independent per-direction nonce counters.

use chacha20poly1305::aead::{Aead, KeyInit, Payload};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use hkdf::Hkdf;
use sha2::Sha256;
use thiserror::Error;
use x25519_dalek::{EphemeralSecret, PublicKey};

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("failed to decrypt frame")]
    DecryptFailed,
    #[error("nonce counter exhausted")]
    NonceExhausted,
}

/// An ephemeral X25519 keypair generated fresh for one handshake.
pub struct EphemeralKeyAgreement {
    secret: EphemeralSecret,
    public: PublicKey,
}

impl EphemeralKeyAgreement {
    pub fn generate<R: rand_core::CryptoRngCore>(rng: &mut R) -> Self {
        let secret = EphemeralSecret::random_from_rng(rng);
        let public = PublicKey::from(&secret);
        Self { secret, public }
    }

    pub fn public_bytes(&self) -> [u8; 32] {
        self.public.to_bytes()
    }

    /// Consume the ephemeral secret to derive both directional session keys.
    /// `we_are_initiator` picks which HKDF "info" labels the send/receive
    /// roles, so both peers land on the same two keys from the same shared
    /// secret without needing to exchange anything further.
    pub fn derive_session(self, peer_public: [u8; 32], we_are_initiator: bool) -> SessionKeys {
        let shared = self.secret.diffie_hellman(&PublicKey::from(peer_public));
        let hk = Hkdf::<Sha256>::new(None, shared.as_bytes());

        let mut initiator_to_responder = [0u8; 32];
        hk.expand(b"hashweave-push-i2r", &mut initiator_to_responder)
            .expect("32 bytes is a valid HKDF output length");
        let mut responder_to_initiator = [0u8; 32];
        hk.expand(b"hashweave-push-r2i", &mut responder_to_initiator)
            .expect("32 bytes is a valid HKDF output length");

        let (send_key, recv_key) = if we_are_initiator {
            (initiator_to_responder, responder_to_initiator)
        } else {
            (responder_to_initiator, initiator_to_responder)
        };

        SessionKeys {
            sender: SessionSender::new(send_key),
            receiver: SessionReceiver::new(recv_key),
        }
    }
}

/// The two directional ciphers a peer ends up with after a handshake.
pub struct SessionKeys {
    pub sender: SessionSender,
    pub receiver: SessionReceiver,
}

fn nonce_from_counter(counter: u64) -> Nonce {
    let mut bytes = [0u8; 12];
    bytes[4..].copy_from_slice(&counter.to_be_bytes());
    *Nonce::from_slice(&bytes)
}

/// Encrypts outbound frames with a strictly increasing nonce counter.
pub struct SessionSender {
    cipher: ChaCha20Poly1305,
    counter: u64,
}

impl SessionSender {
    fn new(key_bytes: [u8; 32]) -> Self {
        Self {
            cipher: ChaCha20Poly1305::new(Key::from_slice(&key_bytes)),
            counter: 0,
        }
    }

    pub fn seal(&mut self, plaintext: &[u8]) -> Result<Vec<u8>, SessionError> {
        let nonce = nonce_from_counter(self.counter);
        let ciphertext = self
            .cipher
            .encrypt(
                &nonce,
                Payload {
                    msg: plaintext,
                    aad: &[],
                },
            )
            .map_err(|_| SessionError::DecryptFailed)?;
        self.counter = self.counter.checked_add(1).ok_or(SessionError::NonceExhausted)?;
        Ok(ciphertext)
    }
}

/// Decrypts inbound frames, rejecting anything out of the expected sequence.
pub struct SessionReceiver {
    cipher: ChaCha20Poly1305,
    counter: u64,
}

impl SessionReceiver {
    fn new(key_bytes: [u8; 32]) -> Self {
        Self {
            cipher: ChaCha20Poly1305::new(Key::from_slice(&key_bytes)),
            counter: 0,
        }
    }

    pub fn open(&mut self, ciphertext: &[u8]) -> Result<Vec<u8>, SessionError> {
        let nonce = nonce_from_counter(self.counter);
        let plaintext = self
            .cipher
            .decrypt(
                &nonce,
                Payload {
                    msg: ciphertext,
                    aad: &[],
                },
            )
            .map_err(|_| SessionError::DecryptFailed)?;
        self.counter = self.counter.checked_add(1).ok_or(SessionError::NonceExhausted)?;
        Ok(plaintext)
    }
}
