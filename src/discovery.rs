use crate::config::DiscoveryConfig;
use crate::error::CoreError;
use crate::events::{CoreEvent, EventBus};
use crate::protocol::{Announcement, DiscoveryMessage};
use crate::registry::{PeerChange, PeerRegistry};
use ipnetwork::Ipv4Network;
use rand::Rng;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

const MAX_DATAGRAM: usize = 2048;

/// How much of discovery came up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiscoveryMode {
    Full,
    /// The discovery port could not be bound. Manual peers still work and the
    /// sweep keeps running; `announcing` tells whether we still broadcast.
    Degraded { reason: String, announcing: bool },
}

/// UDP broadcast announcer and listener.
///
/// `Stopped -> Listening -> Stopped`. Announce, receive and sweep run as
/// independent tasks; a socket failure in one never stops the others.
pub struct DiscoveryService {
    config: DiscoveryConfig,
    registry: PeerRegistry,
    events: EventBus,
    running: Option<Running>,
}

struct Running {
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
    local_addr: Option<SocketAddr>,
}

impl DiscoveryService {
    pub fn new(config: DiscoveryConfig, registry: PeerRegistry, events: EventBus) -> Self {
        Self {
            config,
            registry,
            events,
            running: None,
        }
    }

    pub fn is_listening(&self) -> bool {
        self.running.is_some()
    }

    /// Address the listener is bound to, if the bind succeeded.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.running.as_ref().and_then(|r| r.local_addr)
    }

    pub async fn start(&mut self) -> DiscoveryMode {
        if self.running.is_some() {
            tracing::debug!("Discovery already running");
            return DiscoveryMode::Full;
        }

        let cancel = CancellationToken::new();
        let mut tasks = Vec::new();
        let port = self.config.port;

        let (socket, mode) = match bind_broadcast(SocketAddr::from(([0, 0, 0, 0], port))).await {
            Ok(socket) => {
                let socket = Arc::new(socket);
                tasks.push(tokio::spawn(receive_loop(
                    socket.clone(),
                    self.registry.clone(),
                    self.events.clone(),
                    cancel.clone(),
                )));
                (Some(socket), DiscoveryMode::Full)
            }
            Err(source) => {
                let bind = CoreError::Bind { port, source };
                tracing::error!(error = %bind, "Discovery port unavailable, falling back to announce-only");
                // Keep announcing from an ephemeral port so others can still find us.
                let fallback = bind_broadcast(SocketAddr::from(([0, 0, 0, 0], 0))).await;
                let announcing = fallback.is_ok();
                if let Err(e) = &fallback {
                    tracing::error!(error = %e, "Could not open an announce socket either");
                }
                (
                    fallback.ok().map(Arc::new),
                    DiscoveryMode::Degraded {
                        reason: bind.to_string(),
                        announcing,
                    },
                )
            }
        };

        let local_addr = match (&mode, &socket) {
            (DiscoveryMode::Full, Some(s)) => s.local_addr().ok(),
            _ => None,
        };

        if let Some(socket) = socket {
            tasks.push(tokio::spawn(announce_loop(
                socket,
                self.registry.clone(),
                self.config.clone(),
                cancel.clone(),
            )));
        }
        tasks.push(tokio::spawn(sweep_loop(
            self.registry.clone(),
            self.events.clone(),
            self.config.clone(),
            cancel.clone(),
        )));

        tracing::info!(port, ?mode, "Discovery started");
        self.running = Some(Running {
            cancel,
            tasks,
            local_addr,
        });
        mode
    }

    pub async fn stop(&mut self) {
        let Some(running) = self.running.take() else {
            return;
        };
        running.cancel.cancel();
        for task in running.tasks {
            let _ = task.await;
        }
        tracing::info!("Discovery stopped");
    }
}

impl Drop for DiscoveryService {
    fn drop(&mut self) {
        if let Some(running) = &self.running {
            running.cancel.cancel();
        }
    }
}

async fn bind_broadcast(addr: SocketAddr) -> std::io::Result<UdpSocket> {
    let socket = UdpSocket::bind(addr).await?;
    socket.set_broadcast(true)?;
    Ok(socket)
}

async fn receive_loop(
    socket: Arc<UdpSocket>,
    registry: PeerRegistry,
    events: EventBus,
    cancel: CancellationToken,
) {
    let mut buf = [0u8; MAX_DATAGRAM];
    loop {
        let received = tokio::select! {
            _ = cancel.cancelled() => break,
            r = socket.recv_from(&mut buf) => r,
        };

        let (len, from) = match received {
            Ok(r) => r,
            Err(e) => {
                // e.g. ICMP port unreachable surfacing as ConnectionReset on Windows
                tracing::warn!(error = %e, "Discovery receive error");
                tokio::time::sleep(Duration::from_millis(100)).await;
                continue;
            }
        };

        match DiscoveryMessage::decode(&buf[..len]) {
            Some(DiscoveryMessage::Announce(announcement)) => {
                handle_announcement(&registry, &events, &announcement, from);
            }
            Some(DiscoveryMessage::Unknown) => {
                tracing::trace!(%from, "Ignoring unknown discovery message");
            }
            None => {
                tracing::trace!(%from, len, "Dropping malformed datagram");
            }
        }
    }
}

fn handle_announcement(
    registry: &PeerRegistry,
    events: &EventBus,
    announcement: &Announcement,
    from: SocketAddr,
) {
    match registry.upsert_from_announcement(announcement, from) {
        Some(PeerChange::Added(peer)) => {
            tracing::info!(peer = %peer.id, name = %peer.name, "Discovered new peer");
            events.emit(CoreEvent::PeerUpdated(peer));
        }
        Some(PeerChange::Updated(peer)) => {
            tracing::trace!(peer = %peer.id, "Peer announced");
            events.emit(CoreEvent::PeerUpdated(peer));
        }
        None => {}
    }
}

async fn announce_loop(
    socket: Arc<UdpSocket>,
    registry: PeerRegistry,
    config: DiscoveryConfig,
    cancel: CancellationToken,
) {
    let period = config.announce_interval;
    let jitter = rand::thread_rng().gen_range(0..period.as_millis().max(1) as u64);
    tokio::select! {
        _ = cancel.cancelled() => return,
        _ = tokio::time::sleep(Duration::from_millis(jitter)) => {}
    }

    let mut interval = tokio::time::interval(period);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = interval.tick() => {}
        }

        let identity = registry.identity();
        let msg = DiscoveryMessage::Announce(Announcement::new(
            &identity.display_name,
            identity.api_port,
        ));
        let bytes = match msg.encode() {
            Ok(b) => b,
            Err(e) => {
                tracing::error!(error = %e, "Failed to encode announcement");
                continue;
            }
        };

        for target in announce_targets(config.port, identity.static_ip) {
            if let Err(e) = socket.send_to(&bytes, target).await {
                tracing::debug!(%target, error = %e, "Announcement send failed");
            }
        }
    }
}

/// Network broadcast, loopback (other instances on this host) and, with a
/// static IP, that address's /24 broadcast for hosts whose default route is
/// on another interface.
pub fn announce_targets(port: u16, static_ip: Option<Ipv4Addr>) -> Vec<SocketAddr> {
    let mut targets = vec![
        SocketAddr::from((Ipv4Addr::BROADCAST, port)),
        SocketAddr::from((Ipv4Addr::LOCALHOST, port)),
    ];
    if let Some(ip) = static_ip {
        if let Ok(net) = Ipv4Network::new(ip, 24) {
            targets.push(SocketAddr::from((net.broadcast(), port)));
        }
    }
    targets
}

async fn sweep_loop(
    registry: PeerRegistry,
    events: EventBus,
    config: DiscoveryConfig,
    cancel: CancellationToken,
) {
    let mut interval = tokio::time::interval(config.sweep_interval);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = interval.tick() => {}
        }
        for peer in registry.sweep_stale(config.staleness_window) {
            tracing::info!(peer = %peer.id, name = %peer.name, "Evicting stale peer");
            events.emit(CoreEvent::PeerRemoved(peer.id));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_targets_without_static_ip() {
        let targets = announce_targets(3002, None);
        assert_eq!(
            targets,
            vec![
                "255.255.255.255:3002".parse().unwrap(),
                "127.0.0.1:3002".parse().unwrap()
            ]
        );
    }

    #[test]
    fn test_targets_include_static_subnet() {
        let targets = announce_targets(3002, Some(Ipv4Addr::new(10, 1, 2, 33)));
        assert_eq!(targets.len(), 3);
        assert_eq!(targets[2], "10.1.2.255:3002".parse::<SocketAddr>().unwrap());
    }
}
