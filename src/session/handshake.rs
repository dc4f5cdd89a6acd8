//! Three-message handshake: ephemeral X25519 key agreement, Ed25519
//! signatures over the transcript, optional SPAKE2 passphrase, and explicit
//! key confirmation in both directions.
//!
//! ```text
//! initiator                                   responder
//!   Hello { identity, ephemeral, nonce, pake } ->
//!        <- HelloReply { identity, ephemeral, nonce, pake, signature, confirm }
//!   Finish { signature, confirm }             ->
//! ```

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::io::{AsyncRead, AsyncWrite};
use x25519_dalek::{PublicKey, StaticSecret};
use zeroize::Zeroizing;

use crate::config::Config;
use crate::cryptography::{
    derive_session_keys, finish_pake, start_pake, Role, SessionKeys, SALT_NONCE_SIZE,
};
use crate::error::{HandshakeError, TransportError};
use crate::identity::{self, Identity, PeerId};
use crate::networking::{read_message, write_message};
use crate::PROTOCOL_VERSION;

const TRANSCRIPT_LABEL: &[u8] = b"localshare handshake v1";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct Hello {
    pub version: u8,
    pub identity_key: [u8; 32],
    pub ephemeral_key: [u8; 32],
    pub nonce: [u8; SALT_NONCE_SIZE],
    pub pake: Option<Vec<u8>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct HelloReply {
    pub identity_key: [u8; 32],
    pub ephemeral_key: [u8; 32],
    pub nonce: [u8; SALT_NONCE_SIZE],
    pub pake: Option<Vec<u8>>,
    pub signature: Vec<u8>,
    pub confirm: Vec<u8>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct Finish {
    pub signature: Vec<u8>,
    pub confirm: Vec<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) enum AbortReason {
    UnsupportedVersion,
    PassphraseMismatch,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) enum HandshakeMessage {
    Hello(Hello),
    HelloReply(HelloReply),
    Finish(Finish),
    Abort(AbortReason),
}

/// Result of a successful handshake.
pub(crate) struct Established {
    pub keys: SessionKeys,
    pub remote: PeerId,
}

/// Hash of every negotiated field except signatures and confirmation tags.
fn transcript(
    hello: &Hello,
    reply_identity: &[u8; 32],
    reply_ephemeral: &[u8; 32],
    reply_nonce: &[u8; SALT_NONCE_SIZE],
    reply_pake: &Option<Vec<u8>>,
) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(TRANSCRIPT_LABEL);
    hasher.update([hello.version]);
    hasher.update(hello.identity_key);
    hasher.update(hello.ephemeral_key);
    hasher.update(hello.nonce);
    update_optional(&mut hasher, &hello.pake);
    hasher.update(reply_identity);
    hasher.update(reply_ephemeral);
    hasher.update(reply_nonce);
    update_optional(&mut hasher, reply_pake);
    hasher.finalize().into()
}

fn update_optional(hasher: &mut Sha256, field: &Option<Vec<u8>>) {
    match field {
        Some(bytes) => {
            hasher.update([1u8]);
            hasher.update((bytes.len() as u32).to_be_bytes());
            hasher.update(bytes);
        }
        None => hasher.update([0u8]),
    }
}

fn signed_message(role: Role, transcript: &[u8; 32]) -> Vec<u8> {
    let label: &[u8] = match role {
        Role::Initiator => b"initiator",
        Role::Responder => b"responder",
    };
    [label, &transcript[..]].concat()
}

fn agree(secret: &StaticSecret, remote_ephemeral: &[u8; 32]) -> Result<[u8; 32], HandshakeError> {
    let shared = secret.diffie_hellman(&PublicKey::from(*remote_ephemeral));
    if !shared.was_contributory() {
        return Err(HandshakeError::WeakKeyAgreement);
    }
    Ok(*shared.as_bytes())
}

fn ephemeral() -> (StaticSecret, [u8; 32]) {
    let secret = StaticSecret::from(rand::random::<[u8; 32]>());
    let public = PublicKey::from(&secret).to_bytes();
    (secret, public)
}

async fn receive<S>(stream: &mut S) -> Result<HandshakeMessage, HandshakeError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    match read_message(stream).await {
        Ok(message) => Ok(message),
        Err(TransportError::Closed) => Err(HandshakeError::Aborted),
        Err(e) => Err(e.into()),
    }
}

/// Initiator side. `expected` pins the responder's fingerprint when dialing
/// a peer learned from discovery.
pub(crate) async fn initiate<S>(
    stream: &mut S,
    identity: &Identity,
    config: &Config,
    expected: Option<PeerId>,
) -> Result<Established, HandshakeError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (secret, ephemeral_key) = ephemeral();
    let pake = config.passphrase.as_deref().map(start_pake);

    let hello = Hello {
        version: PROTOCOL_VERSION,
        identity_key: identity.public_key(),
        ephemeral_key,
        nonce: rand::random(),
        pake: pake.as_ref().map(|(_, message)| message.clone()),
    };
    write_message(stream, &HandshakeMessage::Hello(hello.clone())).await?;

    let reply = match receive(stream).await? {
        HandshakeMessage::HelloReply(reply) => reply,
        HandshakeMessage::Abort(AbortReason::PassphraseMismatch) => {
            return Err(HandshakeError::PassphraseMismatch)
        }
        HandshakeMessage::Abort(AbortReason::UnsupportedVersion) => {
            return Err(HandshakeError::UnsupportedVersion(PROTOCOL_VERSION))
        }
        _ => return Err(HandshakeError::UnexpectedMessage("expected HelloReply")),
    };

    let remote = PeerId::from_public_key(&reply.identity_key);
    if let Some(expected) = expected {
        if expected != remote {
            return Err(HandshakeError::IdentityMismatch {
                expected,
                actual: remote,
            });
        }
    }

    let pake_secret = match (pake, &reply.pake) {
        (Some((state, _)), Some(message)) => Some(finish_pake(state, message)?),
        (None, None) => None,
        _ => return Err(HandshakeError::PassphraseMismatch),
    };

    let transcript = transcript(
        &hello,
        &reply.identity_key,
        &reply.ephemeral_key,
        &reply.nonce,
        &reply.pake,
    );
    identity::verify(
        &reply.identity_key,
        &signed_message(Role::Responder, &transcript),
        &reply.signature,
    )?;

    let shared = Zeroizing::new(agree(&secret, &reply.ephemeral_key)?);
    let keys = derive_session_keys(&shared[..], pake_secret.as_deref(), &hello.nonce, &reply.nonce);
    keys.verify_confirmation(Role::Responder, &reply.confirm)?;

    let finish = Finish {
        signature: identity.sign(&signed_message(Role::Initiator, &transcript)).to_vec(),
        confirm: keys
            .confirmation_tag(Role::Initiator)
            .map_err(|_| HandshakeError::KeyConfirmation)?,
    };
    write_message(stream, &HandshakeMessage::Finish(finish)).await?;

    Ok(Established { keys, remote })
}

/// Responder side.
pub(crate) async fn respond<S>(
    stream: &mut S,
    identity: &Identity,
    config: &Config,
) -> Result<Established, HandshakeError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let hello = match receive(stream).await? {
        HandshakeMessage::Hello(hello) => hello,
        _ => return Err(HandshakeError::UnexpectedMessage("expected Hello")),
    };

    if hello.version != PROTOCOL_VERSION {
        let _ = write_message(stream, &HandshakeMessage::Abort(AbortReason::UnsupportedVersion)).await;
        return Err(HandshakeError::UnsupportedVersion(hello.version));
    }

    let pake = config.passphrase.as_deref().map(start_pake);
    if pake.is_some() != hello.pake.is_some() {
        let _ = write_message(stream, &HandshakeMessage::Abort(AbortReason::PassphraseMismatch)).await;
        return Err(HandshakeError::PassphraseMismatch);
    }

    let (secret, ephemeral_key) = ephemeral();
    let shared = Zeroizing::new(agree(&secret, &hello.ephemeral_key)?);
    let nonce: [u8; SALT_NONCE_SIZE] = rand::random();
    let identity_key = identity.public_key();

    let (pake_secret, pake_message) = match (pake, &hello.pake) {
        (Some((state, message)), Some(inbound)) => (Some(finish_pake(state, inbound)?), Some(message)),
        _ => (None, None),
    };

    let transcript = transcript(&hello, &identity_key, &ephemeral_key, &nonce, &pake_message);
    let keys = derive_session_keys(&shared[..], pake_secret.as_deref(), &hello.nonce, &nonce);

    let reply = HelloReply {
        identity_key,
        ephemeral_key,
        nonce,
        pake: pake_message,
        signature: identity.sign(&signed_message(Role::Responder, &transcript)).to_vec(),
        confirm: keys
            .confirmation_tag(Role::Responder)
            .map_err(|_| HandshakeError::KeyConfirmation)?,
    };
    write_message(stream, &HandshakeMessage::HelloReply(reply)).await?;

    let finish = match receive(stream).await? {
        HandshakeMessage::Finish(finish) => finish,
        _ => return Err(HandshakeError::UnexpectedMessage("expected Finish")),
    };
    identity::verify(
        &hello.identity_key,
        &signed_message(Role::Initiator, &transcript),
        &finish.signature,
    )?;
    keys.verify_confirmation(Role::Initiator, &finish.confirm)?;

    Ok(Established {
        keys,
        remote: PeerId::from_public_key(&hello.identity_key),
    })
}
