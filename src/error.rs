//! Error taxonomy for discovery, session establishment and transfers.
//!
//! Each failure class has its own enum so callers can match on exactly the
//! layer that failed; [`Error`] wraps them for the public API.

use std::io;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::identity::PeerId;
use crate::transfer::job::JobId;

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// A discovery packet was rejected. Logged and dropped, never fatal.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DiscoveryError {
    #[error("packet too short: {0} bytes")]
    TooShort(usize),
    #[error("packet too large: {0} bytes")]
    Oversized(usize),
    #[error("bad magic tag")]
    BadMagic,
    #[error("unsupported protocol version {0}")]
    UnsupportedVersion(u8),
    #[error("display name too long: {0} bytes")]
    NameTooLong(usize),
    #[error("declared length does not match packet length")]
    LengthMismatch,
    #[error("display name is not valid UTF-8")]
    InvalidName,
    #[error("announced port is zero")]
    InvalidPort,
}

/// Key agreement or mutual authentication failed. No session is created.
#[derive(Debug, Error)]
pub enum HandshakeError {
    #[error("peer closed the connection during the handshake")]
    Aborted,
    #[error("unexpected handshake message: {0}")]
    UnexpectedMessage(&'static str),
    #[error("unsupported protocol version {0}")]
    UnsupportedVersion(u8),
    #[error("invalid public key")]
    InvalidKey,
    #[error("signature verification failed")]
    BadSignature,
    #[error("key agreement produced a non-contributory secret")]
    WeakKeyAgreement,
    #[error("passphrase configured on only one side")]
    PassphraseMismatch,
    #[error("key confirmation failed")]
    KeyConfirmation,
    #[error("remote identity {actual} does not match expected peer {expected}")]
    IdentityMismatch { expected: PeerId, actual: PeerId },
    #[error("handshake timed out after {0:?}")]
    Timeout(Duration),
    #[error("handshake transport failure: {0}")]
    Transport(#[from] TransportError),
}

/// A sealed unit failed its integrity check or arrived out of sequence.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AuthenticationError {
    #[error("authentication tag did not verify for sequence {0}")]
    BadTag(u64),
    #[error("sequence {got} rejected, expected {expected}")]
    UnexpectedSequence { expected: u64, got: u64 },
    #[error("sealed frame too short: {0} bytes")]
    Truncated(usize),
}

/// The reassembled content did not match the declared hash.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("content hash mismatch: expected {expected}, computed {actual}")]
pub struct IntegrityError {
    pub expected: String,
    pub actual: String,
}

/// An explicit wait elapsed.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TimeoutError {
    #[error("handshake did not complete within {0:?}")]
    Handshake(Duration),
    #[error("no acknowledgment for chunk {index} after {attempts} attempts")]
    Acknowledgment { index: u32, attempts: u32 },
    #[error("peer did not answer the offer within {0:?}")]
    Offer(Duration),
    #[error("peer sent nothing for {0:?}")]
    Idle(Duration),
}

/// The connection dropped or carried something undecodable.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("connection closed by peer")]
    Closed,
    #[error("frame of {0} bytes exceeds the limit")]
    FrameTooLarge(usize),
    #[error("malformed message: {0}")]
    Codec(String),
    #[error("peer is still running an earlier session of this job")]
    Busy,
    #[error(transparent)]
    Io(#[from] io::Error),
}

impl From<bincode::Error> for TransportError {
    fn from(e: bincode::Error) -> Self {
        TransportError::Codec(e.to_string())
    }
}

/// Stable classification carried in job snapshots.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorKind {
    Discovery,
    Handshake,
    Authentication,
    Integrity,
    Timeout,
    Transport,
    Rejected,
    Cancelled,
    Io,
    Usage,
}

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Discovery(#[from] DiscoveryError),
    #[error(transparent)]
    Handshake(#[from] HandshakeError),
    #[error(transparent)]
    Authentication(#[from] AuthenticationError),
    #[error(transparent)]
    Integrity(#[from] IntegrityError),
    #[error(transparent)]
    Timeout(#[from] TimeoutError),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("unknown peer {0}")]
    UnknownPeer(String),
    #[error("unknown job {0}")]
    UnknownJob(JobId),
    #[error("invalid destination: {0}")]
    InvalidDestination(String),
    #[error("destination {0:?} is already claimed by another transfer")]
    DestinationBusy(PathBuf),
    #[error("job {0} is not in a state that allows this operation")]
    InvalidState(JobId),
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error("transfer rejected by peer: {0}")]
    Rejected(String),
    #[error("transfer cancelled")]
    Cancelled,
    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Discovery(_) => ErrorKind::Discovery,
            Error::Handshake(HandshakeError::Timeout(_)) => ErrorKind::Timeout,
            Error::Handshake(HandshakeError::Transport(_)) => ErrorKind::Transport,
            Error::Handshake(_) => ErrorKind::Handshake,
            Error::Authentication(_) => ErrorKind::Authentication,
            Error::Integrity(_) => ErrorKind::Integrity,
            Error::Timeout(_) => ErrorKind::Timeout,
            Error::Transport(_) => ErrorKind::Transport,
            Error::Rejected(_) => ErrorKind::Rejected,
            Error::Cancelled => ErrorKind::Cancelled,
            Error::Io(_) => ErrorKind::Io,
            Error::UnknownPeer(_)
            | Error::UnknownJob(_)
            | Error::InvalidDestination(_)
            | Error::DestinationBusy(_)
            | Error::InvalidState(_)
            | Error::Config(_) => ErrorKind::Usage,
        }
    }

    /// Failures that leave a started job resumable on a new session. A
    /// silent peer is treated like a dropped connection.
    pub fn is_resumable(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::Transport | ErrorKind::Authentication | ErrorKind::Handshake
        ) || matches!(self, Error::Timeout(TimeoutError::Idle(_)))
    }

    /// Timeouts and dropped connections may succeed on another attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(self.kind(), ErrorKind::Timeout | ErrorKind::Transport)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kind_classification() {
        let err = Error::from(HandshakeError::BadSignature);
        assert_eq!(err.kind(), ErrorKind::Handshake);
        assert!(!err.is_retryable());

        let err = Error::from(HandshakeError::Timeout(Duration::from_secs(1)));
        assert_eq!(err.kind(), ErrorKind::Timeout);
        assert!(err.is_retryable());

        let err = Error::from(TransportError::Closed);
        assert_eq!(err.kind(), ErrorKind::Transport);
        assert!(err.is_retryable());

        let err = Error::from(IntegrityError {
            expected: "aa".into(),
            actual: "bb".into(),
        });
        assert_eq!(err.kind(), ErrorKind::Integrity);
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_resumable_failures() {
        assert!(Error::from(TransportError::Busy).is_resumable());
        assert!(Error::from(AuthenticationError::BadTag(4)).is_resumable());
        assert!(Error::from(TimeoutError::Idle(Duration::from_secs(2))).is_resumable());
        assert!(!Error::from(TimeoutError::Acknowledgment { index: 1, attempts: 3 }).is_resumable());
        assert!(!Error::Cancelled.is_resumable());
    }

    #[test]
    fn test_error_display() {
        let err = AuthenticationError::UnexpectedSequence { expected: 3, got: 5 };
        assert_eq!(err.to_string(), "sequence 5 rejected, expected 3");

        let err = TimeoutError::Acknowledgment { index: 7, attempts: 5 };
        assert_eq!(err.to_string(), "no acknowledgment for chunk 7 after 5 attempts");

        let err = DiscoveryError::NameTooLong(80);
        assert_eq!(err.to_string(), "display name too long: 80 bytes");
    }
}
