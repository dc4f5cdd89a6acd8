//! Announcement wire format
//!
//! ```text
//! offset  size  field
//! 0       4     magic "LSHR"
//! 4       1     protocol version
//! 5       32    sender fingerprint
//! 37      2     listening TCP port (big-endian)
//! 39      1     display-name length N
//! 40      N     display name (UTF-8)
//! ```

use crate::error::DiscoveryError;
use crate::identity::{PeerId, FINGERPRINT_SIZE};
use crate::PROTOCOL_VERSION;

pub const MAGIC: [u8; 4] = *b"LSHR";
pub const MAX_NAME_LEN: usize = 64;
pub const HEADER_LEN: usize = 4 + 1 + FINGERPRINT_SIZE + 2 + 1;
pub const MAX_PACKET_LEN: usize = HEADER_LEN + MAX_NAME_LEN;

const VERSION_OFFSET: usize = 4;
const ID_OFFSET: usize = 5;
const PORT_OFFSET: usize = ID_OFFSET + FINGERPRINT_SIZE;
const NAME_LEN_OFFSET: usize = PORT_OFFSET + 2;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Announcement {
    pub peer_id: PeerId,
    pub display_name: String,
    pub port: u16,
}

impl Announcement {
    /// Names longer than the wire limit are cut at a character boundary.
    pub fn new(peer_id: PeerId, display_name: &str, port: u16) -> Self {
        let mut end = display_name.len().min(MAX_NAME_LEN);
        while !display_name.is_char_boundary(end) {
            end -= 1;
        }
        Self {
            peer_id,
            display_name: display_name[..end].to_string(),
            port,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let name = self.display_name.as_bytes();
        let mut packet = Vec::with_capacity(HEADER_LEN + name.len());
        packet.extend_from_slice(&MAGIC);
        packet.push(PROTOCOL_VERSION);
        packet.extend_from_slice(self.peer_id.as_bytes());
        packet.extend_from_slice(&self.port.to_be_bytes());
        packet.push(name.len() as u8);
        packet.extend_from_slice(name);
        packet
    }

    pub fn decode(packet: &[u8]) -> Result<Self, DiscoveryError> {
        if packet.len() > MAX_PACKET_LEN {
            return Err(DiscoveryError::Oversized(packet.len()));
        }
        if packet.len() < HEADER_LEN {
            return Err(DiscoveryError::TooShort(packet.len()));
        }
        if packet[..VERSION_OFFSET] != MAGIC {
            return Err(DiscoveryError::BadMagic);
        }
        let version = packet[VERSION_OFFSET];
        if version != PROTOCOL_VERSION {
            return Err(DiscoveryError::UnsupportedVersion(version));
        }

        let mut id = [0u8; FINGERPRINT_SIZE];
        id.copy_from_slice(&packet[ID_OFFSET..PORT_OFFSET]);

        let port = u16::from_be_bytes([packet[PORT_OFFSET], packet[PORT_OFFSET + 1]]);
        if port == 0 {
            return Err(DiscoveryError::InvalidPort);
        }

        let name_len = packet[NAME_LEN_OFFSET] as usize;
        if name_len > MAX_NAME_LEN {
            return Err(DiscoveryError::NameTooLong(name_len));
        }
        if packet.len() != HEADER_LEN + name_len {
            return Err(DiscoveryError::LengthMismatch);
        }
        let display_name = std::str::from_utf8(&packet[HEADER_LEN..])
            .map_err(|_| DiscoveryError::InvalidName)?
            .to_string();

        Ok(Self {
            peer_id: PeerId(id),
            display_name,
            port,
        })
    }
}
