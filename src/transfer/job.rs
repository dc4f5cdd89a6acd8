//! Transfer jobs: identity, lifecycle state, chunk bookkeeping and the
//! bounded retry state the engine consults between acknowledgments.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use super::messages::TransferHeader;
use crate::error::{Error, ErrorKind};
use crate::identity::PeerId;

pub const JOB_ID_SIZE: usize = 16;

#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct JobId(pub [u8; JOB_ID_SIZE]);

impl JobId {
    pub fn generate() -> Self {
        JobId(rand::random())
    }

    pub fn short(&self) -> String {
        hex::encode(&self.0[..4])
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "JobId({})", self.short())
    }
}

impl FromStr for JobId {
    type Err = hex::FromHexError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut id = [0u8; JOB_ID_SIZE];
        hex::decode_to_slice(s, &mut id)?;
        Ok(JobId(id))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PayloadKind {
    Text,
    File,
}

impl fmt::Display for PayloadKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PayloadKind::Text => f.write_str("text"),
            PayloadKind::File => f.write_str("file"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Direction {
    Send,
    Receive,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobState {
    Pending,
    InProgress,
    Paused,
    Completed,
    Failed,
}

impl JobState {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobState::Completed | JobState::Failed)
    }

    /// PENDING -> IN_PROGRESS -> {COMPLETED | FAILED | PAUSED}, and
    /// PAUSED -> IN_PROGRESS on resume. Any live job may fail.
    pub fn can_transition_to(self, next: JobState) -> bool {
        use JobState::*;
        matches!(
            (self, next),
            (Pending, InProgress)
                | (Pending, Failed)
                | (InProgress, Completed)
                | (InProgress, Failed)
                | (InProgress, Paused)
                | (Paused, InProgress)
                | (Paused, Failed)
        )
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            JobState::Pending => "PENDING",
            JobState::InProgress => "IN_PROGRESS",
            JobState::Paused => "PAUSED",
            JobState::Completed => "COMPLETED",
            JobState::Failed => "FAILED",
        };
        f.write_str(name)
    }
}

/// Set of chunk indices that have been written (receiver) or acknowledged
/// (sender). Indices at or beyond `len` are never members.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkBitmap {
    len: u32,
    bits: Vec<u8>,
}

impl ChunkBitmap {
    pub fn new(len: u32) -> Self {
        Self {
            len,
            bits: vec![0u8; (len as usize).div_ceil(8)],
        }
    }

    pub fn len(&self) -> u32 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn contains(&self, index: u32) -> bool {
        index < self.len && self.bits[(index / 8) as usize] & (1 << (index % 8)) != 0
    }

    /// Returns true if the index was newly added.
    pub fn insert(&mut self, index: u32) -> bool {
        if index >= self.len || self.contains(index) {
            return false;
        }
        self.bits[(index / 8) as usize] |= 1 << (index % 8);
        true
    }

    pub fn count(&self) -> u32 {
        self.bits.iter().map(|b| b.count_ones()).sum()
    }

    pub fn is_complete(&self) -> bool {
        self.count() == self.len
    }

    pub fn first_missing(&self) -> Option<u32> {
        (0..self.len).find(|&i| !self.contains(i))
    }

    pub fn missing(&self) -> impl Iterator<Item = u32> + '_ {
        (0..self.len).filter(move |&i| !self.contains(i))
    }

    pub fn clear(&mut self) {
        self.bits.iter_mut().for_each(|b| *b = 0);
    }

    pub fn to_hex(&self) -> String {
        hex::encode(&self.bits)
    }

    /// Rebuild from persisted hex. Stray bits past `len` are dropped.
    pub fn from_hex(len: u32, encoded: &str) -> Option<Self> {
        let bits = hex::decode(encoded).ok()?;
        let mut bitmap = Self::new(len);
        if bits.len() != bitmap.bits.len() {
            return None;
        }
        for index in 0..len {
            if bits[(index / 8) as usize] & (1 << (index % 8)) != 0 {
                bitmap.insert(index);
            }
        }
        Some(bitmap)
    }

    /// Whether `other` describes the same range. Used to reject a peer's
    /// bitmap that does not fit the offer.
    pub fn same_shape(&self, other: &ChunkBitmap) -> bool {
        self.len == other.len && self.bits.len() == other.bits.len()
    }
}

/// Bounded retry bookkeeping: attempts since the last progress and the
/// deadline for the next retransmission.
#[derive(Debug, Clone)]
pub struct RetryState {
    pub attempts: u32,
    pub max_attempts: u32,
    pub timeout: Duration,
    pub deadline: Option<Instant>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    Retry { attempt: u32 },
    Exhausted { attempts: u32 },
}

impl RetryState {
    pub fn new(timeout: Duration, max_attempts: u32) -> Self {
        Self {
            attempts: 0,
            max_attempts,
            timeout,
            deadline: None,
        }
    }

    /// Start or restart the clock after the peer made progress.
    pub fn progress(&mut self, now: Instant) {
        self.attempts = 0;
        self.deadline = Some(now + self.timeout);
    }

    /// Start the clock if nothing is outstanding yet.
    pub fn arm(&mut self, now: Instant) {
        if self.deadline.is_none() {
            self.deadline = Some(now + self.timeout);
        }
    }

    pub fn disarm(&mut self) {
        self.deadline = None;
    }

    pub fn is_due(&self, now: Instant) -> bool {
        self.deadline.is_some_and(|deadline| now >= deadline)
    }

    /// The deadline passed: either schedule another attempt or give up.
    pub fn expire(&mut self, now: Instant) -> RetryDecision {
        self.attempts += 1;
        if self.attempts > self.max_attempts {
            self.deadline = None;
            return RetryDecision::Exhausted {
                attempts: self.attempts - 1,
            };
        }
        self.deadline = Some(now + self.timeout);
        RetryDecision::Retry {
            attempt: self.attempts,
        }
    }
}

/// One send or receive of a full payload.
///
/// Owned by exactly one engine task while running; everyone else observes it
/// through [`JobSnapshot`]s.
#[derive(Debug, Clone)]
pub struct TransferJob {
    pub header: TransferHeader,
    pub direction: Direction,
    pub peer: PeerId,
    pub completed: ChunkBitmap,
    pub state: JobState,
    pub retry: RetryState,
    pub destination: Option<PathBuf>,
    pub last_error: Option<(ErrorKind, String)>,
    /// First transmissions of chunks, across every session of this job.
    pub chunks_sent: u64,
    pub retransmissions: u64,
    /// Received TEXT content, set once the hash verified.
    pub text: Option<String>,
}

impl TransferJob {
    pub fn new(header: TransferHeader, direction: Direction, peer: PeerId, retry: RetryState) -> Self {
        let completed = ChunkBitmap::new(header.total_chunks());
        Self {
            header,
            direction,
            peer,
            completed,
            state: JobState::Pending,
            retry,
            destination: None,
            last_error: None,
            chunks_sent: 0,
            retransmissions: 0,
            text: None,
        }
    }

    pub fn id(&self) -> JobId {
        self.header.job_id
    }

    pub fn transition(&mut self, next: JobState) -> Result<(), Error> {
        if !self.state.can_transition_to(next) {
            return Err(Error::InvalidState(self.id()));
        }
        self.state = next;
        Ok(())
    }

    /// Record a terminal or pausing failure. Connection-level failures of
    /// an accepted job pause it; everything else fails it.
    pub fn record_failure(&mut self, error: &Error) {
        self.last_error = Some((error.kind(), error.to_string()));
        let resumable =
            error.is_resumable() && matches!(self.state, JobState::InProgress | JobState::Paused);

        self.state = if resumable {
            JobState::Paused
        } else {
            JobState::Failed
        };
    }

    pub fn bytes_done(&self) -> u64 {
        self.completed
            .missing()
            .fold(self.header.total_size, |done, index| {
                done - self.header.chunk_len(index) as u64
            })
    }

    pub fn snapshot(&self) -> JobSnapshot {
        JobSnapshot {
            job_id: self.id(),
            direction: self.direction,
            peer: self.peer,
            kind: self.header.kind,
            name: self.header.name.clone(),
            total_size: self.header.total_size,
            content_hash: hex::encode(self.header.content_hash),
            chunk_size: self.header.chunk_size,
            total_chunks: self.completed.len(),
            completed_chunks: self.completed.count(),
            next_expected: self.completed.first_missing(),
            bytes_done: self.bytes_done(),
            state: self.state,
            destination: self.destination.clone(),
            last_error: self.last_error.as_ref().map(|(kind, _)| *kind),
            error_message: self.last_error.as_ref().map(|(_, message)| message.clone()),
            retry_attempts: self.retry.attempts,
            chunks_sent: self.chunks_sent,
            retransmissions: self.retransmissions,
            text: self.text.clone(),
        }
    }
}

/// Read-only view of a job, safe to hand to any caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobSnapshot {
    pub job_id: JobId,
    pub direction: Direction,
    pub peer: PeerId,
    pub kind: PayloadKind,
    pub name: String,
    pub total_size: u64,
    pub content_hash: String,
    pub chunk_size: u32,
    pub total_chunks: u32,
    pub completed_chunks: u32,
    /// Lowest chunk index not yet done.
    pub next_expected: Option<u32>,
    pub bytes_done: u64,
    pub state: JobState,
    pub destination: Option<PathBuf>,
    pub last_error: Option<ErrorKind>,
    pub error_message: Option<String>,
    pub retry_attempts: u32,
    pub chunks_sent: u64,
    pub retransmissions: u64,
    /// Received TEXT content, once COMPLETED.
    pub text: Option<String>,
}
