//! # Transfers
//!
//! A transfer job moves one TEXT or FILE payload to one peer:
//!
//! - [`messages`]: the control and data messages carried in sealed frames
//! - [`job`]: job identity, state machine and chunk bookkeeping
//! - [`payload`]: reading sources and writing destinations
//! - [`store`]: resumable state kept across restarts
//! - [`engine`]: the sender and receiver loops

pub mod engine;
pub mod job;
pub mod messages;
pub mod payload;
pub mod store;

pub use engine::{Checkpoint, TransferContext, TransferSettings};
pub use job::{ChunkBitmap, Direction, JobId, JobSnapshot, JobState, PayloadKind, TransferJob};
pub use messages::{TransferHeader, TransferMessage};
pub use payload::{Destination, Payload, Sink};
pub use store::{JobStore, PersistedJob};
