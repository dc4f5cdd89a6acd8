//! # Discovery
//!
//! Three tasks run for the life of a node:
//! - **announce**: sends this node's [`Announcement`] every
//!   `announce_interval`, and immediately when [`Discovery::announce`] is called
//! - **listen**: validates incoming packets and upserts senders into the
//!   [`PeerRegistry`]; malformed input is logged and dropped
//! - **sweep**: ages silent peers to STALE and evicts them later
//!
//! Discovery is unauthenticated. A peer id learned here is only trusted once
//! a session handshake proves possession of the matching key.

pub mod packet;
pub mod registry;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use log::{debug, warn};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

pub use packet::Announcement;
pub use registry::{Observation, Peer, PeerRegistry, PeerStatus, SweepReport};

use crate::config::Config;
use crate::error::Result;
use crate::identity::PeerId;
use crate::networking::{announce_socket, bind_discovery};

pub struct Discovery {
    registry: Arc<PeerRegistry>,
    announcement: Announcement,
    local_addr: SocketAddr,
    trigger: mpsc::Sender<()>,
    cancel: CancellationToken,
}

impl Discovery {
    /// Bind the discovery sockets and spawn the announce, listen and sweep
    /// tasks. They stop when `parent` is cancelled or this value is dropped.
    pub async fn start(
        config: &Config,
        local_id: PeerId,
        transfer_port: u16,
        parent: &CancellationToken,
    ) -> Result<Self> {
        let registry = Arc::new(PeerRegistry::new(local_id, config.stale_after, config.evict_after));
        let announcement = Announcement::new(local_id, &config.display_name, transfer_port);

        let listen = bind_discovery(config.discovery_bind).await?;
        let local_addr = listen.local_addr()?;
        let sender = announce_socket(config.announce_target).await?;

        let cancel = parent.child_token();
        let (trigger, trigger_rx) = mpsc::channel(1);

        tokio::spawn(announce_loop(
            sender,
            config.announce_target,
            announcement.encode(),
            config.announce_interval,
            trigger_rx,
            cancel.clone(),
        ));
        tokio::spawn(listen_loop(listen, registry.clone(), cancel.clone()));
        tokio::spawn(sweep_loop(registry.clone(), config.announce_interval, cancel.clone()));

        debug!(
            "Discovery listening on {}, announcing to {}",
            local_addr, config.announce_target
        );

        Ok(Self {
            registry,
            announcement,
            local_addr,
            trigger,
            cancel,
        })
    }

    /// Queue an announcement now. Never blocks; a pending trigger absorbs
    /// repeated calls.
    pub fn announce(&self) {
        let _ = self.trigger.try_send(());
    }

    pub fn snapshot(&self) -> Vec<Peer> {
        self.registry.snapshot()
    }

    pub fn registry(&self) -> &Arc<PeerRegistry> {
        &self.registry
    }

    pub fn announcement(&self) -> &Announcement {
        &self.announcement
    }

    /// Address the listen socket is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn shutdown(&self) {
        self.cancel.cancel();
    }
}

impl Drop for Discovery {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn announce_loop(
    socket: UdpSocket,
    target: SocketAddr,
    packet: Vec<u8>,
    interval: Duration,
    mut trigger: mpsc::Receiver<()>,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
            Some(()) = trigger.recv() => {}
        }
        if let Err(e) = socket.send_to(&packet, target).await {
            warn!("Failed to send announcement to {}: {}", target, e);
        }
    }
    debug!("Announce loop stopped");
}

async fn listen_loop(socket: UdpSocket, registry: Arc<PeerRegistry>, cancel: CancellationToken) {
    // One spare byte so an oversized datagram is detectable.
    let mut buf = [0u8; packet::MAX_PACKET_LEN + 1];
    loop {
        let (len, source) = tokio::select! {
            _ = cancel.cancelled() => break,
            received = socket.recv_from(&mut buf) => match received {
                Ok(received) => received,
                Err(e) => {
                    debug!("Discovery receive error: {}", e);
                    continue;
                }
            },
        };

        match Announcement::decode(&buf[..len]) {
            Ok(announcement) => {
                registry.observe(&announcement, source);
            }
            Err(e) => debug!("Dropped discovery packet from {}: {}", source, e),
        }
    }
    debug!("Listen loop stopped");
}

async fn sweep_loop(registry: Arc<PeerRegistry>, period: Duration, cancel: CancellationToken) {
    let mut ticker = tokio::time::interval(period);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                let report = registry.sweep();
                if report.evicted > 0 || report.staled > 0 {
                    debug!("Sweep: {} stale, {} evicted", report.staled, report.evicted);
                }
            }
        }
    }
}
