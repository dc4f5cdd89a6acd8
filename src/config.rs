//! Node configuration

use std::env;
use std::fmt;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::path::PathBuf;
use std::time::Duration;

use crate::error::{Error, Result};
use crate::{DEFAULT_CHUNK_SIZE, DEFAULT_DISCOVERY_PORT, DEFAULT_TRANSFER_PORT, DEFAULT_WINDOW};

/// Tunables for discovery, sessions and transfers.
#[derive(Clone)]
pub struct Config {
    /// Name shown to other peers. Default: "localshare"
    pub display_name: String,

    /// TCP address sessions are accepted on.
    /// Default: 0.0.0.0:8080
    pub transfer_addr: SocketAddr,

    /// UDP address the discovery listener binds.
    /// Default: 0.0.0.0:8081
    pub discovery_bind: SocketAddr,

    /// Where announcements are sent.
    /// Default: 255.255.255.255:8081
    pub announce_target: SocketAddr,

    /// Default: 2s
    pub announce_interval: Duration,

    /// Silence after which a peer is STALE and hidden from snapshots.
    /// Default: 3 x announce_interval
    pub stale_after: Duration,

    /// Silence after which a peer is removed from the registry.
    /// Default: 2 x stale_after
    pub evict_after: Duration,

    /// Default: 10s
    pub handshake_timeout: Duration,

    /// Wait for an acknowledgment before retransmitting the window.
    /// Default: 5s
    pub chunk_timeout: Duration,

    /// How long a sender waits for the receiver to accept an offer.
    /// Default: 120s
    pub offer_timeout: Duration,

    /// Bounded retries for handshakes and acknowledgments.
    /// Default: 5
    pub max_retries: u32,

    /// Delay before the first reconnect; doubles on each attempt.
    /// Default: 1s
    pub retry_backoff: Duration,

    /// Default: 64 KiB
    pub chunk_size: u32,

    /// Maximum unacknowledged chunks in flight.
    /// Default: 8
    pub window: usize,

    /// Where resumable job state is kept.
    /// Default: .localshare
    pub state_dir: PathBuf,

    /// Default parent directory for received files.
    /// Default: uploads
    pub download_dir: PathBuf,

    /// Optional pairing passphrase mixed into key derivation.
    pub passphrase: Option<String>,
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("display_name", &self.display_name)
            .field("transfer_addr", &self.transfer_addr)
            .field("discovery_bind", &self.discovery_bind)
            .field("announce_target", &self.announce_target)
            .field("announce_interval", &self.announce_interval)
            .field("stale_after", &self.stale_after)
            .field("evict_after", &self.evict_after)
            .field("handshake_timeout", &self.handshake_timeout)
            .field("chunk_timeout", &self.chunk_timeout)
            .field("offer_timeout", &self.offer_timeout)
            .field("max_retries", &self.max_retries)
            .field("retry_backoff", &self.retry_backoff)
            .field("chunk_size", &self.chunk_size)
            .field("window", &self.window)
            .field("state_dir", &self.state_dir)
            .field("download_dir", &self.download_dir)
            .field("passphrase", &self.passphrase.as_ref().map(|_| "[REDACTED]"))
            .finish()
    }
}

impl Default for Config {
    fn default() -> Self {
        let announce_interval = Duration::from_secs(2);
        let stale_after = announce_interval * 3;
        Self {
            display_name: "localshare".to_string(),
            transfer_addr: SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, DEFAULT_TRANSFER_PORT)),
            discovery_bind: SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, DEFAULT_DISCOVERY_PORT)),
            announce_target: SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::BROADCAST, DEFAULT_DISCOVERY_PORT)),
            announce_interval,
            stale_after,
            evict_after: stale_after * 2,
            handshake_timeout: Duration::from_secs(10),
            chunk_timeout: Duration::from_secs(5),
            offer_timeout: Duration::from_secs(120),
            max_retries: 5,
            retry_backoff: Duration::from_secs(1),
            chunk_size: DEFAULT_CHUNK_SIZE,
            window: DEFAULT_WINDOW,
            state_dir: PathBuf::from(".localshare"),
            download_dir: PathBuf::from("uploads"),
            passphrase: None,
        }
    }
}

impl Config {
    /// Loopback-only configuration with ephemeral ports and short timers.
    ///
    /// Announcements go to the loopback discard port; tests point
    /// `announce_target` at another node's discovery socket explicitly.
    pub fn for_testing(state_dir: impl Into<PathBuf>) -> Self {
        let state_dir = state_dir.into();
        let loopback = |port| SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::LOCALHOST, port));
        let announce_interval = Duration::from_millis(100);
        Self {
            display_name: "test-node".to_string(),
            transfer_addr: loopback(0),
            discovery_bind: loopback(0),
            announce_target: loopback(9),
            announce_interval,
            stale_after: announce_interval * 3,
            evict_after: announce_interval * 6,
            handshake_timeout: Duration::from_secs(2),
            chunk_timeout: Duration::from_millis(500),
            offer_timeout: Duration::from_secs(5),
            max_retries: 3,
            retry_backoff: Duration::from_millis(50),
            chunk_size: 1024,
            window: 4,
            download_dir: state_dir.join("downloads"),
            state_dir,
            passphrase: None,
        }
    }

    /// Defaults overridden by `LOCALSHARE_*` environment variables.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        if let Ok(key) = env::var("LOCALSHARE_KEY") {
            if !key.is_empty() {
                config.passphrase = Some(key);
            }
        }
        if let Ok(name) = env::var("LOCALSHARE_NAME") {
            config.display_name = name;
        }
        if let Ok(dir) = env::var("LOCALSHARE_STATE_DIR") {
            config.state_dir = PathBuf::from(dir);
        }
        if let Ok(port) = env::var("LOCALSHARE_PORT") {
            let port = parse_port("LOCALSHARE_PORT", &port)?;
            config.transfer_addr.set_port(port);
        }
        if let Ok(port) = env::var("LOCALSHARE_DISCOVERY_PORT") {
            let port = parse_port("LOCALSHARE_DISCOVERY_PORT", &port)?;
            config.discovery_bind.set_port(port);
            config.announce_target.set_port(port);
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.chunk_size == 0 {
            return Err(Error::Config("chunk_size must be greater than zero".into()));
        }
        if self.chunk_size as usize > crate::MAX_CHUNK_SIZE {
            return Err(Error::Config(format!(
                "chunk_size must not exceed {} bytes",
                crate::MAX_CHUNK_SIZE
            )));
        }
        if self.window == 0 {
            return Err(Error::Config("window must be greater than zero".into()));
        }
        if self.evict_after <= self.stale_after {
            return Err(Error::Config("evict_after must be longer than stale_after".into()));
        }
        if self.display_name.len() > crate::discovery::packet::MAX_NAME_LEN {
            return Err(Error::Config("display_name is too long".into()));
        }
        Ok(())
    }
}

fn parse_port(var: &str, value: &str) -> Result<u16> {
    value
        .trim()
        .parse()
        .map_err(|_| Error::Config(format!("{var} is not a valid port: {value}")))
}
