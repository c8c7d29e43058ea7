use crate::events::{CoreEvent, EventBus};
use crate::peer::Peer;
use crate::registry::PeerRegistry;
use crate::transport::PeerClient;
use futures::future::join_all;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Reachability check against a peer's admin API.
#[derive(Clone)]
pub struct LivenessProbe {
    client: PeerClient,
    timeout: Duration,
}

impl LivenessProbe {
    pub fn new(client: PeerClient, timeout: Duration) -> Self {
        Self { client, timeout }
    }

    /// Probe `peer` once and record the outcome in the registry.
    ///
    /// Never fails: any error, timeout or non-2xx answer means offline.
    pub async fn check(&self, registry: &PeerRegistry, peer: &Peer) -> bool {
        let (online, reported_name) = match self.client.probe(&peer.base_url(), self.timeout).await {
            Ok(name) => (true, name),
            Err(e) => {
                tracing::debug!(peer = %peer.id, error = %e, "Liveness probe failed");
                (false, None)
            }
        };

        if peer.online != online {
            tracing::info!(peer = %peer.id, online, "Peer liveness changed");
        }
        registry.record_liveness(&peer.id, online, reported_name.as_deref());
        online
    }
}

/// Probe every known peer, all at once, every `interval`.
pub fn spawn_liveness_poller(
    registry: PeerRegistry,
    liveness: LivenessProbe,
    interval: Duration,
    events: EventBus,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }

            let peers = registry.list();
            let (liveness, registry_ref) = (&liveness, &registry);
            let checks = peers.iter().map(|peer| async move {
                let online = liveness.check(registry_ref, peer).await;
                (peer, online)
            });
            for (before, online) in join_all(checks).await {
                if before.online == online {
                    continue;
                }
                if let Some(updated) = registry.get(&before.id) {
                    events.emit(CoreEvent::PeerUpdated(updated));
                }
            }
        }
        tracing::debug!("Liveness poller stopped");
    })
}
