use crate::peer::{now_millis, peer_id, Peer};
use crate::protocol::Announcement;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

/// What this instance knows about itself, used to drop our own announcements
/// and to remap loopback sources.
#[derive(Debug, Clone, Default)]
pub struct LocalIdentity {
    pub display_name: String,
    pub api_port: u16,
    pub static_ip: Option<Ipv4Addr>,
    /// Primary LAN address, if one could be determined at startup.
    pub lan_ip: Option<IpAddr>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum PeerChange {
    Added(Peer),
    Updated(Peer),
}

impl PeerChange {
    pub fn peer(&self) -> &Peer {
        match self {
            PeerChange::Added(p) | PeerChange::Updated(p) => p,
        }
    }
}

/// Table of known peers, shared between the discovery listener, the sweeper,
/// the liveness poller and the admin operations.
///
/// Writers serialize on the lock; readers clone a snapshot. The lock is never
/// held across an await point.
#[derive(Clone, Default)]
pub struct PeerRegistry {
    peers: Arc<RwLock<HashMap<String, Peer>>>,
    identity: Arc<RwLock<LocalIdentity>>,
}

impl PeerRegistry {
    pub fn new(identity: LocalIdentity) -> Self {
        Self {
            peers: Arc::new(RwLock::new(HashMap::new())),
            identity: Arc::new(RwLock::new(identity)),
        }
    }

    pub fn identity(&self) -> LocalIdentity {
        self.identity.read().clone()
    }

    pub fn upsert_from_announcement(
        &self,
        announcement: &Announcement,
        source: SocketAddr,
    ) -> Option<PeerChange> {
        self.upsert_from_announcement_at(announcement, source, now_millis())
    }

    pub fn upsert_from_announcement_at(
        &self,
        announcement: &Announcement,
        source: SocketAddr,
        now: u64,
    ) -> Option<PeerChange> {
        let identity = self.identity.read().clone();
        if announcement.id == identity.display_name {
            return None;
        }

        let ip = effective_ip(source.ip(), &identity)?;
        if source.ip().is_loopback() && ip != source.ip() && announcement.port == identity.api_port
        {
            // Our own echo that came back over loopback under a different name.
            return None;
        }

        let id = peer_id(ip, announcement.port);
        let mut peers = self.peers.write();
        if let Some(peer) = peers.get_mut(&id) {
            peer.name = announcement.name.clone();
            peer.port = announcement.port;
            peer.online = true;
            peer.last_seen = Some(now);
            return Some(PeerChange::Updated(peer.clone()));
        }

        let peer = Peer::discovered(ip, announcement.port, announcement.name.clone(), now);
        peers.insert(id, peer.clone());
        Some(PeerChange::Added(peer))
    }

    /// Upsert-or-replace a user-entered peer. Manual peers are never swept.
    ///
    /// A discovered entry with the same id becomes manual. Removing it later
    /// drops the peer until the next announcement rediscovers it.
    pub fn add_manual(&self, ip: IpAddr, name: &str, port: u16) -> Peer {
        let peer = Peer::manual(ip, port, name.to_string());
        self.peers.write().insert(peer.id.clone(), peer.clone());
        peer
    }

    /// Re-insert peers loaded from the persisted config.
    pub fn restore_manual(&self, peers: impl IntoIterator<Item = Peer>) {
        let mut table = self.peers.write();
        for mut peer in peers {
            peer.manual = true;
            peer.online = false;
            peer.id = peer_id(peer.ip, peer.port);
            table.insert(peer.id.clone(), peer);
        }
    }

    pub fn remove(&self, id: &str) -> Option<Peer> {
        self.peers.write().remove(id)
    }

    pub fn get(&self, id: &str) -> Option<Peer> {
        self.peers.read().get(id).cloned()
    }

    pub fn list(&self) -> Vec<Peer> {
        self.peers.read().values().cloned().collect()
    }

    pub fn manual_peers(&self) -> Vec<Peer> {
        let mut manual: Vec<Peer> = self
            .peers
            .read()
            .values()
            .filter(|p| p.manual)
            .cloned()
            .collect();
        manual.sort_by(|a, b| a.id.cmp(&b.id));
        manual
    }

    pub fn len(&self) -> usize {
        self.peers.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.read().is_empty()
    }

    /// Evict discovered peers that have not announced within `max_age`.
    pub fn sweep_stale(&self, max_age: Duration) -> Vec<Peer> {
        self.sweep_stale_at(max_age, now_millis())
    }

    pub fn sweep_stale_at(&self, max_age: Duration, now: u64) -> Vec<Peer> {
        let max_age = max_age.as_millis() as u64;
        let mut evicted = Vec::new();
        self.peers.write().retain(|_, peer| {
            if peer.manual {
                return true;
            }
            let fresh = peer
                .last_seen
                .is_some_and(|seen| now.saturating_sub(seen) <= max_age);
            if !fresh {
                evicted.push(peer.clone());
            }
            fresh
        });
        evicted
    }

    /// Record the outcome of a reachability probe. Returns the updated peer,
    /// or `None` if it was removed in the meantime.
    pub fn record_liveness(&self, id: &str, online: bool, reported_name: Option<&str>) -> Option<Peer> {
        let mut peers = self.peers.write();
        let peer = peers.get_mut(id)?;
        peer.online = online;
        peer.last_checked = Some(now_millis());
        if let Some(name) = reported_name.filter(|n| !n.is_empty()) {
            peer.name = name.to_string();
        }
        Some(peer.clone())
    }
}

/// Loopback sources are other instances on this host. Map them to the address
/// the rest of the network sees, so the same player is not listed twice.
///
/// This is a heuristic: with more than two instances on one host and
/// overlapping ports it can still attribute an announcement to the wrong peer.
fn effective_ip(source: IpAddr, identity: &LocalIdentity) -> Option<IpAddr> {
    if source.is_unspecified() {
        return None;
    }
    if !source.is_loopback() {
        return Some(source);
    }
    if let Some(static_ip) = identity.static_ip {
        return Some(IpAddr::V4(static_ip));
    }
    Some(identity.lan_ip.unwrap_or(source))
}
