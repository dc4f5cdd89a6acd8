//! Live peer registry
//!
//! Writers (the listen loop and the sweep) mutate a private map under a
//! mutex and then publish an immutable snapshot. Readers only clone the
//! published `Arc`, so `snapshot()` never waits on packet processing.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use log::{debug, info};

use super::packet::Announcement;
use crate::identity::PeerId;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerStatus {
    Active,
    Stale,
}

#[derive(Debug, Clone)]
pub struct Peer {
    pub id: PeerId,
    pub display_name: String,
    pub address: SocketAddr,
    pub last_seen: Instant,
    pub status: PeerStatus,
}

/// What an announcement did to the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Observation {
    New,
    Refreshed,
    /// The announcement came from this node.
    Ignored,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepReport {
    pub staled: usize,
    pub evicted: usize,
}

pub struct PeerRegistry {
    local_id: PeerId,
    stale_after: Duration,
    evict_after: Duration,
    peers: Mutex<HashMap<PeerId, Peer>>,
    published: RwLock<Arc<Vec<Peer>>>,
}

impl PeerRegistry {
    pub fn new(local_id: PeerId, stale_after: Duration, evict_after: Duration) -> Self {
        Self {
            local_id,
            stale_after,
            evict_after,
            peers: Mutex::new(HashMap::new()),
            published: RwLock::new(Arc::new(Vec::new())),
        }
    }

    pub fn observe(&self, announcement: &Announcement, source: SocketAddr) -> Observation {
        self.observe_at(announcement, source, Instant::now())
    }

    /// Upsert the sender. Its address is the packet source IP plus the
    /// announced listening port.
    pub fn observe_at(&self, announcement: &Announcement, source: SocketAddr, now: Instant) -> Observation {
        if announcement.peer_id == self.local_id {
            return Observation::Ignored;
        }
        let address = SocketAddr::new(source.ip(), announcement.port);

        let mut peers = self.peers.lock().unwrap_or_else(|e| e.into_inner());
        let observation = match peers.get_mut(&announcement.peer_id) {
            Some(peer) => {
                if peer.status == PeerStatus::Stale {
                    debug!("Peer {} is active again", peer.id.short());
                }
                peer.display_name = announcement.display_name.clone();
                peer.address = address;
                peer.last_seen = now;
                peer.status = PeerStatus::Active;
                Observation::Refreshed
            }
            None => {
                info!(
                    "Discovered peer {} ({}) at {}",
                    announcement.display_name,
                    announcement.peer_id.short(),
                    address
                );
                peers.insert(
                    announcement.peer_id,
                    Peer {
                        id: announcement.peer_id,
                        display_name: announcement.display_name.clone(),
                        address,
                        last_seen: now,
                        status: PeerStatus::Active,
                    },
                );
                Observation::New
            }
        };
        self.publish(&peers);
        observation
    }

    pub fn sweep(&self) -> SweepReport {
        self.sweep_at(Instant::now())
    }

    /// Mark peers silent for longer than `stale_after` as STALE and drop
    /// those silent for longer than `evict_after`.
    pub fn sweep_at(&self, now: Instant) -> SweepReport {
        let mut report = SweepReport::default();
        let mut peers = self.peers.lock().unwrap_or_else(|e| e.into_inner());

        peers.retain(|_, peer| {
            let silence = now.saturating_duration_since(peer.last_seen);
            if silence > self.evict_after {
                debug!("Evicting peer {} after {:?} of silence", peer.id.short(), silence);
                report.evicted += 1;
                return false;
            }
            if silence > self.stale_after && peer.status == PeerStatus::Active {
                debug!("Peer {} is stale", peer.id.short());
                peer.status = PeerStatus::Stale;
                report.staled += 1;
            }
            true
        });

        if report != SweepReport::default() {
            self.publish(&peers);
        }
        report
    }

    fn publish(&self, peers: &HashMap<PeerId, Peer>) {
        let mut snapshot: Vec<Peer> = peers.values().cloned().collect();
        snapshot.sort_by(|a, b| a.display_name.cmp(&b.display_name).then(a.id.cmp(&b.id)));
        *self.published.write().unwrap_or_else(|e| e.into_inner()) = Arc::new(snapshot);
    }

    fn published(&self) -> Arc<Vec<Peer>> {
        self.published.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// ACTIVE peers, as an owned copy.
    pub fn snapshot(&self) -> Vec<Peer> {
        self.published()
            .iter()
            .filter(|peer| peer.status == PeerStatus::Active)
            .cloned()
            .collect()
    }

    /// Any known peer, including STALE ones.
    pub fn get(&self, id: &PeerId) -> Option<Peer> {
        self.published().iter().find(|peer| &peer.id == id).cloned()
    }

    /// ACTIVE peers whose id starts with `query` (hex) or whose display
    /// name equals it.
    pub fn resolve(&self, query: &str) -> Vec<Peer> {
        let needle = query.to_ascii_lowercase();
        self.snapshot()
            .into_iter()
            .filter(|peer| peer.id.to_string().starts_with(&needle) || peer.display_name == query)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.published().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::FINGERPRINT_SIZE;

    const STALE: Duration = Duration::from_secs(6);
    const EVICT: Duration = Duration::from_secs(12);

    fn registry() -> PeerRegistry {
        PeerRegistry::new(PeerId([0; FINGERPRINT_SIZE]), STALE, EVICT)
    }

    fn announcement(byte: u8, name: &str) -> Announcement {
        Announcement::new(PeerId([byte; FINGERPRINT_SIZE]), name, 9000)
    }

    fn source() -> SocketAddr {
        "192.168.1.20:40000".parse().unwrap()
    }

    #[test]
    fn test_first_announcement_creates_active_peer() {
        let registry = registry();
        let now = Instant::now();
        assert_eq!(registry.observe_at(&announcement(1, "desk"), source(), now), Observation::New);

        let peers = registry.snapshot();
        assert_eq!(peers.len(), 1);
        assert_eq!(peers[0].display_name, "desk");
        assert_eq!(peers[0].address, "192.168.1.20:9000".parse().unwrap());
        assert_eq!(peers[0].status, PeerStatus::Active);
    }

    #[test]
    fn test_repeat_announcement_refreshes() {
        let registry = registry();
        let now = Instant::now();
        registry.observe_at(&announcement(1, "desk"), source(), now);
        let later = now + Duration::from_secs(2);
        assert_eq!(
            registry.observe_at(&announcement(1, "renamed"), source(), later),
            Observation::Refreshed
        );
        let peers = registry.snapshot();
        assert_eq!(peers.len(), 1);
        assert_eq!(peers[0].display_name, "renamed");
        assert_eq!(peers[0].last_seen, later);
    }

    #[test]
    fn test_own_announcement_ignored() {
        let registry = registry();
        assert_eq!(registry.observe(&announcement(0, "me"), source()), Observation::Ignored);
        assert!(registry.is_empty());
    }

    #[test]
    fn test_stale_peer_hidden_then_evicted() {
        let registry = registry();
        let now = Instant::now();
        registry.observe_at(&announcement(1, "desk"), source(), now);

        let report = registry.sweep_at(now + Duration::from_secs(5));
        assert_eq!(report, SweepReport::default());
        assert_eq!(registry.snapshot().len(), 1);

        let report = registry.sweep_at(now + Duration::from_secs(7));
        assert_eq!(report.staled, 1);
        assert!(registry.snapshot().is_empty());
        assert_eq!(registry.len(), 1, "stale peers stay until the grace period ends");

        let report = registry.sweep_at(now + Duration::from_secs(13));
        assert_eq!(report.evicted, 1);
        assert!(registry.is_empty());
    }

    #[test]
    fn test_stale_peer_recovers_on_announcement() {
        let registry = registry();
        let now = Instant::now();
        registry.observe_at(&announcement(1, "desk"), source(), now);
        registry.sweep_at(now + Duration::from_secs(7));
        assert!(registry.snapshot().is_empty());

        let later = now + Duration::from_secs(8);
        assert_eq!(
            registry.observe_at(&announcement(1, "desk"), source(), later),
            Observation::Refreshed
        );
        assert_eq!(registry.snapshot().len(), 1);
    }

    #[test]
    fn test_evicted_peer_recreated_fresh() {
        let registry = registry();
        let now = Instant::now();
        registry.observe_at(&announcement(1, "desk"), source(), now);
        registry.sweep_at(now + Duration::from_secs(20));
        assert!(registry.is_empty());

        let later = now + Duration::from_secs(21);
        assert_eq!(registry.observe_at(&announcement(1, "desk"), source(), later), Observation::New);
        let peers = registry.snapshot();
        assert_eq!(peers.len(), 1);
        assert_eq!(peers[0].status, PeerStatus::Active);
        assert_eq!(peers[0].last_seen, later);
    }

    #[test]
    fn test_snapshot_is_a_copy() {
        let registry = registry();
        registry.observe(&announcement(1, "desk"), source());
        let mut copy = registry.snapshot();
        copy.clear();
        assert_eq!(registry.snapshot().len(), 1);
    }

    #[test]
    fn test_resolve_by_prefix_and_name() {
        let registry = registry();
        registry.observe(&announcement(0xAB, "desk"), source());
        registry.observe(&announcement(0xCD, "laptop"), source());

        assert_eq!(registry.resolve("abab").len(), 1);
        assert_eq!(registry.resolve("laptop")[0].id, PeerId([0xCD; FINGERPRINT_SIZE]));
        assert!(registry.resolve("nobody").is_empty());
    }
}
