//! # localshare
//!
//! Peer discovery and secure transfer engine for sharing text and files
//! between machines on the same LAN.
//!
//! - [`discovery`]: UDP announcements and the live peer registry
//! - [`session`]: authenticated key agreement over a TCP connection
//! - [`cryptography`]: per-frame authenticated encryption and key derivation
//! - [`transfer`]: chunked, windowed, resumable payload transfer
//! - [`node`]: the entry points a CLI or UI calls

pub mod config;
pub mod cryptography;
pub mod discovery;
pub mod error;
pub mod identity;
pub mod networking;
pub mod node;
pub mod session;
pub mod transfer;

pub use config::Config;
pub use error::{Error, ErrorKind, Result};
pub use identity::{Identity, PeerId};
pub use node::{IncomingOffer, Node, Offers};
pub use transfer::job::{JobId, JobSnapshot, JobState, PayloadKind};
pub use transfer::payload::Destination;

pub const PROTOCOL_VERSION: u8 = 1;

pub const KEY_SIZE: usize = 32;
pub const NONCE_SIZE: usize = 12;
pub const ENCRYPTION_OVERHEAD: usize = 16;

pub const DEFAULT_CHUNK_SIZE: u32 = 64 * 1024;
pub const MAX_CHUNK_SIZE: usize = 4 * 1024 * 1024;
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;
pub const DEFAULT_WINDOW: usize = 8;

pub const DEFAULT_TRANSFER_PORT: u16 = 8080;
pub const DEFAULT_DISCOVERY_PORT: u16 = 8081;
