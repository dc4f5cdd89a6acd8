use spake2::{Ed25519Group, Identity as PakeIdentity, Password, Spake2};
use sha2::Sha256;
use hkdf::Hkdf;
use chacha20poly1305::{
    aead::{Aead, KeyInit},
    ChaCha20Poly1305, Nonce,
};
use zeroize::{Zeroize, ZeroizeOnDrop};
pub use chacha20poly1305::aead::Error as EncryptionError;

use crate::error::{AuthenticationError, HandshakeError};
use crate::{ENCRYPTION_OVERHEAD, KEY_SIZE, NONCE_SIZE};

pub const SESSION_ID_SIZE: usize = 16;
pub const SALT_NONCE_SIZE: usize = 32;
const SEQUENCE_SIZE: usize = 8;

const PAKE_IDENTITY: &[u8] = b"localshare pairing v1";

/// Which end of the handshake a key belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Initiator,
    Responder,
}

impl Role {
    fn confirmation_nonce(self) -> [u8; NONCE_SIZE] {
        let mut nonce = [0u8; NONCE_SIZE];
        nonce[0] = match self {
            Role::Initiator => 1,
            Role::Responder => 2,
        };
        nonce
    }
}

/// Key material for one session, derived fresh per handshake.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct SessionKeys {
    pub initiator_to_responder: [u8; KEY_SIZE],
    pub responder_to_initiator: [u8; KEY_SIZE],
    pub confirmation: [u8; KEY_SIZE],
    pub session_id: [u8; SESSION_ID_SIZE],
}

impl SessionKeys {
    /// Split into (sending, opening) halves for the given role.
    pub fn directional(&self, role: Role) -> (SealingKey, OpeningKey) {
        match role {
            Role::Initiator => (
                SealingKey::new(&self.initiator_to_responder),
                OpeningKey::new(&self.responder_to_initiator),
            ),
            Role::Responder => (
                SealingKey::new(&self.responder_to_initiator),
                OpeningKey::new(&self.initiator_to_responder),
            ),
        }
    }

    /// Tag proving this side derived the same keys.
    pub fn confirmation_tag(&self, role: Role) -> Result<Vec<u8>, EncryptionError> {
        let cipher = ChaCha20Poly1305::new((&self.confirmation).into());
        let nonce = role.confirmation_nonce();
        cipher.encrypt(Nonce::from_slice(&nonce), &b""[..])
    }

    pub fn verify_confirmation(&self, role: Role, tag: &[u8]) -> Result<(), HandshakeError> {
        let cipher = ChaCha20Poly1305::new((&self.confirmation).into());
        let nonce = role.confirmation_nonce();
        cipher
            .decrypt(Nonce::from_slice(&nonce), tag)
            .map(|_| ())
            .map_err(|_| HandshakeError::KeyConfirmation)
    }
}

/// Derive directional keys from the key-agreement secret, salted with both
/// handshake nonces. `pake_secret` is appended when a passphrase is in use.
pub fn derive_session_keys(
    shared_secret: &[u8],
    pake_secret: Option<&[u8]>,
    initiator_nonce: &[u8; SALT_NONCE_SIZE],
    responder_nonce: &[u8; SALT_NONCE_SIZE],
) -> SessionKeys {
    let mut salt = [0u8; SALT_NONCE_SIZE * 2];
    salt[..SALT_NONCE_SIZE].copy_from_slice(initiator_nonce);
    salt[SALT_NONCE_SIZE..].copy_from_slice(responder_nonce);

    let mut ikm = shared_secret.to_vec();
    if let Some(pake) = pake_secret {
        ikm.extend_from_slice(pake);
    }

    let hkdf = Hkdf::<Sha256>::new(Some(&salt), &ikm);
    ikm.zeroize();

    let mut keys = SessionKeys {
        initiator_to_responder: [0u8; KEY_SIZE],
        responder_to_initiator: [0u8; KEY_SIZE],
        confirmation: [0u8; KEY_SIZE],
        session_id: [0u8; SESSION_ID_SIZE],
    };
    // Output lengths are far below the HKDF-SHA256 limit of 255 * 32 bytes.
    let _ = hkdf.expand(b"localshare i2r", &mut keys.initiator_to_responder);
    let _ = hkdf.expand(b"localshare r2i", &mut keys.responder_to_initiator);
    let _ = hkdf.expand(b"localshare confirm", &mut keys.confirmation);
    let _ = hkdf.expand(b"localshare session id", &mut keys.session_id);
    keys
}

pub fn start_pake(passphrase: &str) -> (Spake2<Ed25519Group>, Vec<u8>) {
    let pw = Password::new(passphrase.as_bytes());
    Spake2::<Ed25519Group>::start_symmetric(&pw, &PakeIdentity::new(PAKE_IDENTITY))
}

pub fn finish_pake(spake: Spake2<Ed25519Group>, inbound_message: &[u8]) -> Result<Vec<u8>, HandshakeError> {
    spake.finish(inbound_message).map_err(|_| HandshakeError::KeyConfirmation)
}

/// The nonce for a sequence number: counter in the first eight bytes.
pub fn nonce_for(sequence: u64) -> [u8; NONCE_SIZE] {
    let mut nonce_bytes = [0u8; NONCE_SIZE];
    nonce_bytes[..SEQUENCE_SIZE].copy_from_slice(&sequence.to_le_bytes());
    nonce_bytes
}

/// Sending half of a session: seals frames under strictly increasing
/// sequence numbers.
pub struct SealingKey {
    cipher: ChaCha20Poly1305,
    next: u64,
}

impl SealingKey {
    fn new(key: &[u8; KEY_SIZE]) -> Self {
        Self {
            cipher: ChaCha20Poly1305::new(key.into()),
            next: 0,
        }
    }

    pub fn next_sequence(&self) -> u64 {
        self.next
    }

    /// Seal `plaintext` as `sequence || ciphertext || tag` and advance the
    /// counter. The returned bytes are what gets retransmitted, so a
    /// sequence number never covers two different plaintexts.
    pub fn seal(&mut self, plaintext: &[u8]) -> Result<(u64, Vec<u8>), EncryptionError> {
        let sequence = self.next;
        let nonce = nonce_for(sequence);
        let ciphertext = self.cipher.encrypt(Nonce::from_slice(&nonce), plaintext)?;

        let mut frame = Vec::with_capacity(SEQUENCE_SIZE + ciphertext.len());
        frame.extend_from_slice(&sequence.to_be_bytes());
        frame.extend_from_slice(&ciphertext);

        self.next += 1;
        Ok((sequence, frame))
    }
}

/// Receiving half of a session: accepts only the next expected sequence.
pub struct OpeningKey {
    cipher: ChaCha20Poly1305,
    expected: u64,
}

impl OpeningKey {
    fn new(key: &[u8; KEY_SIZE]) -> Self {
        Self {
            cipher: ChaCha20Poly1305::new(key.into()),
            expected: 0,
        }
    }

    pub fn expected_sequence(&self) -> u64 {
        self.expected
    }

    /// Verify and decrypt a sealed frame. The counter only advances on
    /// success, so a rejected frame can be retransmitted and accepted later.
    pub fn open(&mut self, frame: &[u8]) -> Result<(u64, Vec<u8>), AuthenticationError> {
        if frame.len() < SEQUENCE_SIZE + ENCRYPTION_OVERHEAD {
            return Err(AuthenticationError::Truncated(frame.len()));
        }
        let mut sequence_bytes = [0u8; SEQUENCE_SIZE];
        sequence_bytes.copy_from_slice(&frame[..SEQUENCE_SIZE]);
        let sequence = u64::from_be_bytes(sequence_bytes);

        if sequence != self.expected {
            return Err(AuthenticationError::UnexpectedSequence {
                expected: self.expected,
                got: sequence,
            });
        }

        let nonce = nonce_for(sequence);
        let plaintext = self
            .cipher
            .decrypt(Nonce::from_slice(&nonce), &frame[SEQUENCE_SIZE..])
            .map_err(|_| AuthenticationError::BadTag(sequence))?;

        self.expected += 1;
        Ok((sequence, plaintext))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn keys() -> SessionKeys {
        derive_session_keys(&[7u8; 32], None, &[1u8; 32], &[2u8; 32])
    }

    #[test]
    fn test_derivation_is_salted_by_nonces() {
        let a = derive_session_keys(&[7u8; 32], None, &[1u8; 32], &[2u8; 32]);
        let b = derive_session_keys(&[7u8; 32], None, &[1u8; 32], &[3u8; 32]);
        assert_ne!(a.initiator_to_responder, b.initiator_to_responder);
        assert_ne!(a.session_id, b.session_id);
        assert_ne!(a.initiator_to_responder, a.responder_to_initiator);
    }

    #[test]
    fn test_pake_secret_changes_keys() {
        let plain = derive_session_keys(&[7u8; 32], None, &[1u8; 32], &[2u8; 32]);
        let paked = derive_session_keys(&[7u8; 32], Some(b"pake"), &[1u8; 32], &[2u8; 32]);
        assert_ne!(plain.initiator_to_responder, paked.initiator_to_responder);
    }

    #[test]
    fn test_symmetric_pake_agrees_on_same_passphrase() {
        let (a, a_msg) = start_pake("correct horse");
        let (b, b_msg) = start_pake("correct horse");
        assert_eq!(finish_pake(a, &b_msg).unwrap(), finish_pake(b, &a_msg).unwrap());

        let (a, a_msg) = start_pake("correct horse");
        let (b, b_msg) = start_pake("battery staple");
        assert_ne!(finish_pake(a, &b_msg).unwrap(), finish_pake(b, &a_msg).unwrap());
    }

    #[test]
    fn test_seal_open_in_sequence() {
        let keys = keys();
        let (mut seal, _) = keys.directional(Role::Initiator);
        let (_, mut open) = keys.directional(Role::Responder);

        for i in 0..5u64 {
            let msg = format!("message {i}");
            let (seq, frame) = seal.seal(msg.as_bytes()).unwrap();
            assert_eq!(seq, i);
            let (opened_seq, plaintext) = open.open(&frame).unwrap();
            assert_eq!(opened_seq, i);
            assert_eq!(plaintext, msg.as_bytes());
        }
        assert_eq!(seal.next_sequence(), 5);
        assert_eq!(open.expected_sequence(), 5);
    }

    #[test]
    fn test_open_rejects_replay_and_reorder() {
        let keys = keys();
        let (mut seal, _) = keys.directional(Role::Initiator);
        let (_, mut open) = keys.directional(Role::Responder);

        let (_, first) = seal.seal(b"first").unwrap();
        let (_, second) = seal.seal(b"second").unwrap();

        assert_eq!(
            open.open(&second),
            Err(AuthenticationError::UnexpectedSequence { expected: 0, got: 1 })
        );
        assert!(open.open(&first).is_ok());
        assert_eq!(
            open.open(&first),
            Err(AuthenticationError::UnexpectedSequence { expected: 1, got: 0 })
        );
        assert!(open.open(&second).is_ok());
    }

    #[test]
    fn test_every_single_bit_flip_is_rejected() {
        let keys = keys();
        let (mut seal, _) = keys.directional(Role::Responder);
        let (_, frame) = seal.seal(b"tamper me").unwrap();

        // Skip the sequence prefix: flips there are caught as reordering.
        for byte in SEQUENCE_SIZE..frame.len() {
            for bit in 0..8 {
                let (_, mut open) = keys.directional(Role::Initiator);
                let mut tampered = frame.clone();
                tampered[byte] ^= 1 << bit;
                assert_eq!(open.open(&tampered), Err(AuthenticationError::BadTag(0)));
                // The untouched frame still opens afterwards.
                assert!(open.open(&frame).is_ok());
            }
        }
    }

    #[test]
    fn test_directions_use_distinct_keys() {
        let keys = keys();
        let (mut initiator_seal, _) = keys.directional(Role::Initiator);
        let (_, mut initiator_open) = keys.directional(Role::Initiator);
        let (_, frame) = initiator_seal.seal(b"to responder").unwrap();
        // An initiator cannot open its own outbound traffic.
        assert_eq!(initiator_open.open(&frame), Err(AuthenticationError::BadTag(0)));
    }

    #[test]
    fn test_truncated_frame() {
        let keys = keys();
        let (_, mut open) = keys.directional(Role::Responder);
        assert_eq!(open.open(&[0u8; 10]), Err(AuthenticationError::Truncated(10)));
    }

    #[test]
    fn test_confirmation_tags() {
        let keys = keys();
        let tag = keys.confirmation_tag(Role::Initiator).unwrap();
        assert_eq!(tag.len(), ENCRYPTION_OVERHEAD);
        assert!(keys.verify_confirmation(Role::Initiator, &tag).is_ok());
        assert!(keys.verify_confirmation(Role::Responder, &tag).is_err());

        let other = derive_session_keys(&[8u8; 32], None, &[1u8; 32], &[2u8; 32]);
        assert!(other.verify_confirmation(Role::Initiator, &tag).is_err());
    }
}
