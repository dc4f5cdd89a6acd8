//! Messages exchanged inside an established session. Every one of them
//! travels sealed; see [`crate::session::SessionWriter`].

use serde::{Deserialize, Serialize};

use super::job::{ChunkBitmap, JobId, PayloadKind};
use crate::error::Error;
use crate::MAX_CHUNK_SIZE;

/// Largest TEXT payload a receiver will buffer in memory.
pub const MAX_TEXT_SIZE: u64 = 64 * 1024 * 1024;
/// File names are limited to what common filesystems accept.
pub const MAX_NAME_LEN: usize = 255;

/// Describes the payload before any chunk is sent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferHeader {
    pub job_id: JobId,
    pub kind: PayloadKind,
    pub total_size: u64,
    /// SHA-256 of the complete payload.
    pub content_hash: [u8; 32],
    pub chunk_size: u32,
    /// Base name for FILE payloads, empty for TEXT.
    pub name: String,
}

impl TransferHeader {
    pub fn total_chunks(&self) -> u32 {
        if self.chunk_size == 0 {
            return 0;
        }
        self.total_size.div_ceil(self.chunk_size as u64) as u32
    }

    pub fn offset(&self, index: u32) -> u64 {
        index as u64 * self.chunk_size as u64
    }

    /// Length of chunk `index`; only the last chunk may be short.
    pub fn chunk_len(&self, index: u32) -> usize {
        let offset = self.offset(index);
        if offset >= self.total_size {
            return 0;
        }
        (self.total_size - offset).min(self.chunk_size as u64) as usize
    }

    /// Reject headers a receiver should not act on.
    pub fn validate(&self) -> Result<(), Error> {
        if self.chunk_size == 0 || self.chunk_size as usize > MAX_CHUNK_SIZE {
            return Err(Error::Rejected(format!("unsupported chunk size {}", self.chunk_size)));
        }
        if self.total_size.div_ceil(self.chunk_size as u64) > u32::MAX as u64 {
            return Err(Error::Rejected("payload has too many chunks".into()));
        }
        if self.name.len() > MAX_NAME_LEN {
            return Err(Error::Rejected("name too long".into()));
        }
        if self.kind == PayloadKind::Text && self.total_size > MAX_TEXT_SIZE {
            return Err(Error::Rejected(format!("text of {} bytes is too large", self.total_size)));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransferMessage {
    /// Sender -> receiver, always the first message of a session.
    Offer(TransferHeader),
    /// Receiver -> sender. `completed` lists chunks already held from an
    /// earlier session of the same job.
    Accept { completed: ChunkBitmap },
    Reject { reason: String },
    /// Receiver -> sender: an earlier session of this job is still running
    /// here. Unlike `Reject`, the job may be offered again later.
    Busy,
    Chunk { index: u32, data: Vec<u8> },
    /// Receiver -> sender: every sealed frame up to `seq` has been applied.
    Ack { seq: u64, index: u32 },
    /// Either direction: resend everything from `from_seq` on.
    Retransmit { from_seq: u64 },
    /// Sender -> receiver: all chunks acknowledged.
    Complete,
    /// Receiver -> sender: still recomputing the content hash.
    Hashing,
    /// Receiver -> sender: the content hash matched.
    Verified,
    Failed { reason: String },
    Cancel,
}

impl TransferMessage {
    pub fn name(&self) -> &'static str {
        match self {
            TransferMessage::Offer(_) => "Offer",
            TransferMessage::Accept { .. } => "Accept",
            TransferMessage::Reject { .. } => "Reject",
            TransferMessage::Busy => "Busy",
            TransferMessage::Chunk { .. } => "Chunk",
            TransferMessage::Ack { .. } => "Ack",
            TransferMessage::Retransmit { .. } => "Retransmit",
            TransferMessage::Complete => "Complete",
            TransferMessage::Hashing => "Hashing",
            TransferMessage::Verified => "Verified",
            TransferMessage::Failed { .. } => "Failed",
            TransferMessage::Cancel => "Cancel",
        }
    }
}
