//! # Sessions
//!
//! An authenticated, encrypted connection between two peers for one
//! transfer. [`connect`] and [`accept`] run the handshake under
//! `handshake_timeout` and only ever return an ESTABLISHED session.
//!
//! After the handshake every message is sealed: [`SessionWriter`] owns the
//! sending counter and [`SessionReader`] the receiving one, so each
//! direction has exactly one mutator.
//!
//! A whole [`Session`] also keeps its most recent sealed frames, so a peer
//! that failed to open one can ask for it again with [`Session::replay`].

mod handshake;

use std::collections::VecDeque;
use std::net::SocketAddr;

use log::debug;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::{split, AsyncRead, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::net::TcpStream;

use crate::config::Config;
use crate::cryptography::{OpeningKey, Role, SealingKey, SESSION_ID_SIZE};
use crate::error::{AuthenticationError, HandshakeError, TransportError};
use crate::identity::{Identity, PeerId};
use crate::networking::{self, read_frame, write_frame};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Handshaking,
    Established,
    Closed,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionInfo {
    pub id: [u8; SESSION_ID_SIZE],
    pub local: PeerId,
    pub remote: PeerId,
    pub role: Role,
}

impl SessionInfo {
    pub fn short_id(&self) -> String {
        hex::encode(&self.id[..4])
    }
}

pub struct Session<S> {
    info: SessionInfo,
    state: SessionState,
    reader: SessionReader<ReadHalf<S>>,
    writer: SessionWriter<WriteHalf<S>>,
    sent: VecDeque<(u64, Vec<u8>)>,
    keep: usize,
}

/// Sealed frames a session keeps for replay unless told otherwise.
pub const DEFAULT_REPLAY_FRAMES: usize = 64;

impl<S> Session<S>
where
    S: AsyncRead + AsyncWrite,
{
    pub fn info(&self) -> &SessionInfo {
        &self.info
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn remote(&self) -> PeerId {
        self.info.remote
    }

    /// Sequence number the next accepted inbound frame must carry.
    pub fn expected_sequence(&self) -> u64 {
        self.reader.expected_sequence()
    }

    /// Keep up to `limit` sent frames for [`Session::replay`].
    pub fn keep_sent(&mut self, limit: usize) {
        self.keep = limit.max(1);
        while self.sent.len() > self.keep {
            self.sent.pop_front();
        }
    }

    pub async fn send<T: Serialize>(&mut self, message: &T) -> Result<u64, TransportError> {
        let (sequence, frame) = self.writer.seal(message)?;
        if let Err(e) = self.writer.write_sealed(&frame).await {
            self.state = SessionState::Failed;
            return Err(e);
        }
        if self.sent.len() == self.keep {
            self.sent.pop_front();
        }
        self.sent.push_back((sequence, frame));
        Ok(sequence)
    }

    /// Write every kept frame from `from_seq` on again, byte for byte.
    /// Fails once the frame at `from_seq` has been forgotten.
    pub async fn replay(&mut self, from_seq: u64) -> Result<u64, TransportError> {
        if let Some((oldest, _)) = self.sent.front() {
            if from_seq < *oldest {
                return Err(TransportError::Codec(format!("sequence {from_seq} can no longer be replayed")));
            }
        }
        let mut count = 0;
        for (_, frame) in self.sent.iter().filter(|(sequence, _)| *sequence >= from_seq) {
            if let Err(e) = self.writer.write_sealed(frame).await {
                self.state = SessionState::Failed;
                return Err(e);
            }
            count += 1;
        }
        Ok(count)
    }

    pub async fn recv<T: DeserializeOwned>(&mut self) -> Result<Inbound<T>, TransportError> {
        let received = self.reader.recv().await;
        match &received {
            Ok(Inbound::Closed) => self.state = SessionState::Closed,
            Err(_) => self.state = SessionState::Failed,
            _ => {}
        }
        received
    }

    /// Hand the two directions to separate tasks.
    pub fn into_split(self) -> (SessionInfo, SessionReader<ReadHalf<S>>, SessionWriter<WriteHalf<S>>) {
        (self.info, self.reader, self.writer)
    }

    pub async fn close(mut self) {
        self.writer.shutdown().await;
        self.state = SessionState::Closed;
        debug!("Session {} closed", self.info.short_id());
    }
}

/// What arrived on the receiving direction.
#[derive(Debug)]
pub enum Inbound<T> {
    Message { sequence: u64, message: T },
    /// A frame failed authentication or arrived out of sequence. It was
    /// discarded and the receive counter did not move.
    Rejected(AuthenticationError),
    /// The peer closed the connection between frames.
    Closed,
}

pub struct SessionWriter<W> {
    inner: W,
    key: SealingKey,
}

impl<W> SessionWriter<W>
where
    W: AsyncWrite + Unpin,
{
    /// Encode and seal without writing. The sealed bytes are what a
    /// retransmission sends again.
    pub fn seal<T: Serialize>(&mut self, message: &T) -> Result<(u64, Vec<u8>), TransportError> {
        let plaintext = bincode::serialize(message)?;
        self.key
            .seal(&plaintext)
            .map_err(|_| TransportError::Codec("encryption failed".into()))
    }

    pub async fn write_sealed(&mut self, frame: &[u8]) -> Result<(), TransportError> {
        write_frame(&mut self.inner, frame).await
    }

    pub async fn send<T: Serialize>(&mut self, message: &T) -> Result<u64, TransportError> {
        let (sequence, frame) = self.seal(message)?;
        self.write_sealed(&frame).await?;
        Ok(sequence)
    }

    pub fn next_sequence(&self) -> u64 {
        self.key.next_sequence()
    }

    pub async fn shutdown(&mut self) {
        let _ = self.inner.shutdown().await;
    }
}

pub struct SessionReader<R> {
    inner: R,
    key: OpeningKey,
}

impl<R> SessionReader<R>
where
    R: AsyncRead + Unpin,
{
    pub async fn recv<T: DeserializeOwned>(&mut self) -> Result<Inbound<T>, TransportError> {
        let Some(frame) = read_frame(&mut self.inner).await? else {
            return Ok(Inbound::Closed);
        };
        match self.key.open(&frame) {
            Ok((sequence, plaintext)) => Ok(Inbound::Message {
                sequence,
                message: bincode::deserialize(&plaintext)?,
            }),
            Err(e) => Ok(Inbound::Rejected(e)),
        }
    }

    pub fn expected_sequence(&self) -> u64 {
        self.key.expected_sequence()
    }
}

fn establish<S>(stream: S, local: PeerId, role: Role, established: handshake::Established) -> Session<S>
where
    S: AsyncRead + AsyncWrite,
{
    let (sealing, opening) = established.keys.directional(role);
    let info = SessionInfo {
        id: established.keys.session_id,
        local,
        remote: established.remote,
        role,
    };
    let (read_half, write_half) = split(stream);
    debug!(
        "Session {} established with {} as {:?}",
        info.short_id(),
        info.remote.short(),
        role
    );
    Session {
        info,
        state: SessionState::Established,
        reader: SessionReader {
            inner: read_half,
            key: opening,
        },
        writer: SessionWriter {
            inner: write_half,
            key: sealing,
        },
        sent: VecDeque::new(),
        keep: DEFAULT_REPLAY_FRAMES,
    }
}

/// Run the initiator handshake over an already open stream.
pub async fn initiate<S>(
    mut stream: S,
    identity: &Identity,
    config: &Config,
    expected: Option<PeerId>,
) -> Result<Session<S>, HandshakeError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let established = tokio::time::timeout(
        config.handshake_timeout,
        handshake::initiate(&mut stream, identity, config, expected),
    )
    .await
    .map_err(|_| HandshakeError::Timeout(config.handshake_timeout))??;
    Ok(establish(stream, identity.peer_id(), Role::Initiator, established))
}

/// Dial `address` and authenticate the peer behind it.
pub async fn connect(
    address: SocketAddr,
    identity: &Identity,
    config: &Config,
    expected: Option<PeerId>,
) -> Result<Session<TcpStream>, HandshakeError> {
    let stream = networking::connect(address, config.handshake_timeout).await?;
    initiate(stream, identity, config, expected).await
}

/// Responder counterpart of [`initiate`].
pub async fn accept<S>(mut stream: S, identity: &Identity, config: &Config) -> Result<Session<S>, HandshakeError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let established = tokio::time::timeout(
        config.handshake_timeout,
        handshake::respond(&mut stream, identity, config),
    )
    .await
    .map_err(|_| HandshakeError::Timeout(config.handshake_timeout))??;
    Ok(establish(stream, identity.peer_id(), Role::Responder, established))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::networking::{read_message, write_message};
    use handshake::HandshakeMessage;
    use tokio::io::DuplexStream;

    fn config(passphrase: Option<&str>) -> Config {
        let mut config = Config::for_testing("/tmp/localshare-session-tests");
        config.passphrase = passphrase.map(str::to_string);
        config
    }

    async fn pair(
        initiator_config: Config,
        responder_config: Config,
        expected: impl FnOnce(&Identity) -> Option<PeerId>,
    ) -> (
        Result<Session<DuplexStream>, HandshakeError>,
        Result<Session<DuplexStream>, HandshakeError>,
    ) {
        let (a, b) = tokio::io::duplex(64 * 1024);
        let initiator = Identity::generate();
        let responder = Identity::generate();
        let expected = expected(&responder);

        let accept_task = tokio::spawn(async move { accept(b, &responder, &responder_config).await });
        let connected = initiate(a, &initiator, &initiator_config, expected).await;
        let accepted = accept_task.await.unwrap();
        (connected, accepted)
    }

    #[tokio::test]
    async fn test_honest_peers_derive_identical_keys() {
        let (connected, accepted) = pair(config(None), config(None), |r| Some(r.peer_id())).await;
        let mut initiator = connected.unwrap();
        let mut responder = accepted.unwrap();

        assert_eq!(initiator.state(), SessionState::Established);
        assert_eq!(responder.state(), SessionState::Established);
        assert_eq!(initiator.info().id, responder.info().id);
        assert_eq!(initiator.remote(), responder.info().local);
        assert_eq!(responder.remote(), initiator.info().local);

        initiator.send(&"ping".to_string()).await.unwrap();
        match responder.recv::<String>().await.unwrap() {
            Inbound::Message { sequence, message } => {
                assert_eq!(sequence, 0);
                assert_eq!(message, "ping");
            }
            other => panic!("unexpected {:?}", other),
        }

        responder.send(&"pong".to_string()).await.unwrap();
        assert!(matches!(
            initiator.recv::<String>().await.unwrap(),
            Inbound::Message { message, .. } if message == "pong"
        ));
    }

    #[tokio::test]
    async fn test_same_passphrase_establishes() {
        let (connected, accepted) = pair(config(Some("tulip")), config(Some("tulip")), |_| None).await;
        assert!(connected.is_ok());
        assert!(accepted.is_ok());
    }

    #[tokio::test]
    async fn test_different_passphrases_fail_confirmation() {
        let (connected, accepted) = pair(config(Some("tulip")), config(Some("daisy")), |_| None).await;
        assert!(matches!(connected, Err(HandshakeError::KeyConfirmation)));
        assert!(accepted.is_err());
    }

    #[tokio::test]
    async fn test_one_sided_passphrase_fails_both_ends() {
        let (connected, accepted) = pair(config(None), config(Some("tulip")), |_| None).await;
        assert!(matches!(connected, Err(HandshakeError::PassphraseMismatch)));
        assert!(matches!(accepted, Err(HandshakeError::PassphraseMismatch)));
    }

    #[tokio::test]
    async fn test_unexpected_responder_identity_rejected() {
        let impostor = Identity::generate().peer_id();
        let (connected, accepted) = pair(config(None), config(None), move |_| Some(impostor)).await;
        assert!(matches!(connected, Err(HandshakeError::IdentityMismatch { .. })));
        assert!(matches!(accepted, Err(HandshakeError::Aborted)));
    }

    #[tokio::test]
    async fn test_tampered_signature_never_establishes() {
        let (a, relay_a) = tokio::io::duplex(64 * 1024);
        let (relay_b, b) = tokio::io::duplex(64 * 1024);
        let initiator = Identity::generate();
        let responder = Identity::generate();
        let config = config(None);

        let responder_config = config.clone();
        let accept_task = tokio::spawn(async move { accept(b, &responder, &responder_config).await });

        // Forward Hello untouched, corrupt the responder's signature.
        let relay = tokio::spawn(async move {
            let (mut from_initiator, mut to_responder) = (relay_a, relay_b);
            let hello: HandshakeMessage = read_message(&mut from_initiator).await.unwrap();
            write_message(&mut to_responder, &hello).await.unwrap();
            let mut reply: HandshakeMessage = read_message(&mut to_responder).await.unwrap();
            if let HandshakeMessage::HelloReply(reply) = &mut reply {
                reply.signature[0] ^= 0x01;
            }
            write_message(&mut from_initiator, &reply).await.unwrap();
            (from_initiator, to_responder)
        });

        let connected = initiate(a, &initiator, &config, None).await;
        assert!(matches!(connected, Err(HandshakeError::BadSignature)));
        drop(relay.await.unwrap());
        assert!(accept_task.await.unwrap().is_err());
    }

    #[tokio::test]
    async fn test_silent_responder_times_out() {
        let (a, _b) = tokio::io::duplex(1024);
        let mut config = config(None);
        config.handshake_timeout = std::time::Duration::from_millis(100);
        let result = initiate(a, &Identity::generate(), &config, None).await;
        assert!(matches!(result, Err(HandshakeError::Timeout(_))));
    }

    #[tokio::test]
    async fn test_tampered_frame_rejected_then_original_accepted() {
        let (connected, accepted) = pair(config(None), config(None), |_| None).await;
        let (_, _, mut writer) = connected.unwrap().into_split();
        let (_, mut reader, _) = accepted.unwrap().into_split();

        let (_, frame) = writer.seal(&42u32).unwrap();
        let mut tampered = frame.clone();
        let last = tampered.len() - 1;
        tampered[last] ^= 0x80;

        writer.write_sealed(&tampered).await.unwrap();
        assert!(matches!(
            reader.recv::<u32>().await.unwrap(),
            Inbound::Rejected(AuthenticationError::BadTag(0))
        ));
        writer.write_sealed(&frame).await.unwrap();
        assert!(matches!(
            reader.recv::<u32>().await.unwrap(),
            Inbound::Message { sequence: 0, message: 42 }
        ));
    }

    #[tokio::test]
    async fn test_replay_resends_kept_frames_in_order() {
        let (connected, accepted) = pair(config(None), config(None), |_| None).await;
        let mut sender = connected.unwrap();
        let (_, mut reader, _) = accepted.unwrap().into_split();
        sender.keep_sent(2);

        for n in 0..3u32 {
            sender.send(&n).await.unwrap();
        }
        for n in 0..3u32 {
            assert!(matches!(reader.recv::<u32>().await.unwrap(), Inbound::Message { message, .. } if message == n));
        }

        // Only the last two frames are kept.
        assert!(matches!(sender.replay(0).await, Err(TransportError::Codec(_))));
        assert_eq!(sender.replay(1).await.unwrap(), 2);
        assert!(matches!(
            reader.recv::<u32>().await.unwrap(),
            Inbound::Rejected(AuthenticationError::UnexpectedSequence { expected: 3, got: 1 })
        ));
        assert!(matches!(
            reader.recv::<u32>().await.unwrap(),
            Inbound::Rejected(AuthenticationError::UnexpectedSequence { expected: 3, got: 2 })
        ));
    }
}
