//! Node identity: an Ed25519 keypair, generated once and kept in the state
//! directory so a peer keeps its fingerprint across restarts.
//!
//! Peers are named by the SHA-256 fingerprint of their public key. Discovery
//! carries the fingerprint; the handshake proves possession of the matching
//! private key.

use std::fmt;
use std::fs;
use std::io::{self, ErrorKind};
use std::path::Path;
use std::str::FromStr;

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::HandshakeError;

pub const FINGERPRINT_SIZE: usize = 32;
pub const SIGNATURE_SIZE: usize = 64;

/// Fingerprint of a peer's identity key.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PeerId(pub [u8; FINGERPRINT_SIZE]);

impl PeerId {
    pub fn from_public_key(public_key: &[u8; 32]) -> Self {
        let digest = Sha256::digest(public_key);
        let mut id = [0u8; FINGERPRINT_SIZE];
        id.copy_from_slice(&digest);
        PeerId(id)
    }

    pub fn as_bytes(&self) -> &[u8; FINGERPRINT_SIZE] {
        &self.0
    }

    /// First eight hex characters, enough to tell LAN peers apart.
    pub fn short(&self) -> String {
        hex::encode(&self.0[..4])
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PeerId({})", self.short())
    }
}

impl FromStr for PeerId {
    type Err = hex::FromHexError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut id = [0u8; FINGERPRINT_SIZE];
        hex::decode_to_slice(s, &mut id)?;
        Ok(PeerId(id))
    }
}

pub struct Identity {
    signing_key: SigningKey,
}

impl Identity {
    pub fn generate() -> Self {
        let secret: [u8; 32] = rand::random();
        Self {
            signing_key: SigningKey::from_bytes(&secret),
        }
    }

    /// Read the hex-encoded secret key at `path`, or create one there.
    pub fn load_or_create(path: &Path) -> io::Result<Self> {
        match fs::read_to_string(path) {
            Ok(content) => {
                let mut secret = zeroize::Zeroizing::new([0u8; 32]);
                hex::decode_to_slice(content.trim(), &mut secret[..])
                    .map_err(|e| io::Error::new(ErrorKind::InvalidData, format!("identity key: {e}")))?;
                Ok(Self {
                    signing_key: SigningKey::from_bytes(&secret),
                })
            }
            Err(e) if e.kind() == ErrorKind::NotFound => {
                let identity = Self::generate();
                if let Some(parent) = path.parent() {
                    fs::create_dir_all(parent)?;
                }
                let encoded = zeroize::Zeroizing::new(hex::encode(identity.signing_key.to_bytes()));
                fs::write(path, encoded.as_bytes())?;

                #[cfg(unix)]
                {
                    use std::os::unix::fs::PermissionsExt;
                    fs::set_permissions(path, fs::Permissions::from_mode(0o600))?;
                }
                Ok(identity)
            }
            Err(e) => Err(e),
        }
    }

    pub fn public_key(&self) -> [u8; 32] {
        self.signing_key.verifying_key().to_bytes()
    }

    pub fn peer_id(&self) -> PeerId {
        PeerId::from_public_key(&self.public_key())
    }

    pub fn sign(&self, message: &[u8]) -> [u8; SIGNATURE_SIZE] {
        self.signing_key.sign(message).to_bytes()
    }
}

impl fmt::Debug for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Identity")
            .field("peer_id", &self.peer_id())
            .field("signing_key", &"[REDACTED]")
            .finish()
    }
}

/// Verify `signature` over `message` under an Ed25519 public key.
pub fn verify(public_key: &[u8; 32], message: &[u8], signature: &[u8]) -> Result<(), HandshakeError> {
    let key = VerifyingKey::from_bytes(public_key).map_err(|_| HandshakeError::InvalidKey)?;
    let bytes: [u8; SIGNATURE_SIZE] = signature
        .try_into()
        .map_err(|_| HandshakeError::BadSignature)?;
    key.verify(message, &Signature::from_bytes(&bytes))
        .map_err(|_| HandshakeError::BadSignature)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_peer_id_is_fingerprint_of_public_key() {
        let identity = Identity::generate();
        assert_eq!(identity.peer_id(), PeerId::from_public_key(&identity.public_key()));
        assert_ne!(identity.peer_id(), Identity::generate().peer_id());
    }

    #[test]
    fn test_peer_id_hex_roundtrip() {
        let id = Identity::generate().peer_id();
        let parsed: PeerId = id.to_string().parse().unwrap();
        assert_eq!(parsed, id);
        assert_eq!(id.short().len(), 8);
        assert!(id.to_string().starts_with(&id.short()));
    }

    #[test]
    fn test_sign_and_verify() {
        let identity = Identity::generate();
        let signature = identity.sign(b"transcript");
        assert!(verify(&identity.public_key(), b"transcript", &signature).is_ok());
        assert!(verify(&identity.public_key(), b"other", &signature).is_err());

        let other = Identity::generate();
        assert!(verify(&other.public_key(), b"transcript", &signature).is_err());
        assert!(verify(&identity.public_key(), b"transcript", &signature[..10]).is_err());
    }

    #[test]
    fn test_identity_persists_across_loads() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state").join("identity.key");
        let first = Identity::load_or_create(&path).unwrap();
        let second = Identity::load_or_create(&path).unwrap();
        assert_eq!(first.peer_id(), second.peer_id());

        fs::write(&path, "not hex").unwrap();
        assert!(Identity::load_or_create(&path).is_err());
    }
}
