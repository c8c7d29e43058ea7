//! Entry point for the admin layer: one object owning discovery, the peer
//! table, fan-out and the addon runtime.

use crate::addon::{AddonLoader, AddonRegistry, AddonSummary, Asset};
use crate::config::{AddonConfig, CoreSettings, HostConfig};
use crate::discovery::{DiscoveryMode, DiscoveryService};
use crate::error::{CoreError, Result};
use crate::events::{CoreEvent, EventBus};
use crate::fanout::{FanoutDispatcher, FanoutOperation, FanoutResult};
use crate::health::{spawn_liveness_poller, LivenessProbe};
use crate::lifecycle::AddonLifecycleManager;
use crate::local::{LocalDevice, LocalTarget};
use crate::peer::Peer;
use crate::registry::{LocalIdentity, PeerRegistry};
use crate::script::ScriptLoader;
use crate::storage::{ConfigStore, SharedConfig};
use crate::transport::PeerClient;
use std::collections::{BTreeMap, BTreeSet};
use std::net::IpAddr;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

pub struct Coordinator {
    settings: CoreSettings,
    config: Arc<SharedConfig>,
    peers: PeerRegistry,
    discovery: tokio::sync::Mutex<DiscoveryService>,
    probe: LivenessProbe,
    fanout: FanoutDispatcher,
    addons: AddonLifecycleManager,
    events: EventBus,
    cancel: CancellationToken,
    poller: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

impl Coordinator {
    /// Build with Lua addon backends and the on-disk layout from `settings`.
    pub fn new(settings: CoreSettings, store: Arc<dyn ConfigStore>) -> Result<Self> {
        let events = EventBus::default();
        let loader = Arc::new(ScriptLoader::new(settings.paths.fonts.clone(), events.clone()));
        Self::with_loader(settings, store, loader, events)
    }

    pub fn with_loader(
        mut settings: CoreSettings,
        store: Arc<dyn ConfigStore>,
        loader: Arc<dyn AddonLoader>,
        events: EventBus,
    ) -> Result<Self> {
        let config = Arc::new(SharedConfig::load(store)?);
        let snapshot = config.snapshot();
        settings.discovery.port = snapshot.discovery_port;
        settings.validate()?;

        let lan_ip = match local_ip_address::local_ip() {
            Ok(ip) => Some(ip),
            Err(e) => {
                tracing::warn!(error = %e, "Could not determine LAN address");
                None
            }
        };
        let peers = PeerRegistry::new(LocalIdentity {
            display_name: snapshot.display_name.clone(),
            api_port: snapshot.port,
            static_ip: snapshot.static_ipv4(),
            lan_ip,
        });
        peers.restore_manual(snapshot.peers.clone());

        let client = PeerClient::new().map_err(|e| CoreError::Config(e.to_string()))?;
        let local: Arc<dyn LocalTarget> = Arc::new(LocalDevice::new(
            config.clone(),
            settings.paths.media.clone(),
            settings.paths.updates.clone(),
            events.clone(),
        ));
        let fanout = FanoutDispatcher::new(peers.clone(), client.clone(), local);
        let probe = LivenessProbe::new(client, settings.probe_timeout);

        let registry = Arc::new(AddonRegistry::new(
            settings.paths.addons.clone(),
            loader,
            config.clone(),
        ));
        let addons = AddonLifecycleManager::new(registry, events.clone());
        let discovery = DiscoveryService::new(settings.discovery.clone(), peers.clone(), events.clone());

        Ok(Self {
            settings,
            config,
            peers,
            discovery: tokio::sync::Mutex::new(discovery),
            probe,
            fanout,
            addons,
            events,
            cancel: CancellationToken::new(),
            poller: parking_lot::Mutex::new(None),
        })
    }

    /// Load addons, then bring up discovery and the liveness poller.
    ///
    /// Addon load problems are logged, not returned; the player must still
    /// come up. The discovery mode tells whether the UDP port was bound.
    pub async fn start(&self) -> Result<DiscoveryMode> {
        match self.addons.reload_all().await {
            Ok(count) => tracing::info!(count, "Addons loaded"),
            Err(e) => tracing::error!(error = %e, "Failed to load addons"),
        }

        let mode = self.discovery.lock().await.start().await;

        let mut poller = self.poller.lock();
        if poller.is_none() {
            *poller = Some(spawn_liveness_poller(
                self.peers.clone(),
                self.probe.clone(),
                self.settings.liveness_interval,
                self.events.clone(),
                self.cancel.child_token(),
            ));
        }
        Ok(mode)
    }

    pub async fn shutdown(&self) {
        tracing::info!("Shutting down");
        self.cancel.cancel();
        let poller = self.poller.lock().take();
        if let Some(poller) = poller {
            let _ = poller.await;
        }
        self.discovery.lock().await.stop().await;
        for failure in self.addons.stop_all().await {
            tracing::error!(error = %failure, "Addon did not stop cleanly");
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CoreEvent> {
        self.events.subscribe()
    }

    pub fn current_config(&self) -> HostConfig {
        self.config.snapshot()
    }

    pub fn list_peers(&self) -> Vec<Peer> {
        let mut peers = self.peers.list();
        peers.sort_by(|a, b| a.name.cmp(&b.name).then_with(|| a.id.cmp(&b.id)));
        peers
    }

    pub async fn add_manual_peer(&self, ip: &str, name: &str, port: u16) -> Result<Peer> {
        let addr: IpAddr = ip
            .trim()
            .parse()
            .map_err(|_| CoreError::Config(format!("invalid IP address '{ip}'")))?;
        if port == 0 {
            return Err(CoreError::Config("port must be non-zero".into()));
        }
        let name = if name.trim().is_empty() {
            format!("Manual ({addr})")
        } else {
            name.trim().to_string()
        };

        let peer = self.peers.add_manual(addr, &name, port);
        self.persist_manual_peers().await?;
        tracing::info!(peer = %peer.id, name = %peer.name, "Added manual peer");
        self.events.emit(CoreEvent::PeerUpdated(peer.clone()));
        Ok(peer)
    }

    pub async fn remove_peer(&self, id: &str) -> Result<Peer> {
        let peer = self
            .peers
            .remove(id)
            .ok_or_else(|| CoreError::not_found("peer", id))?;
        if peer.manual {
            self.persist_manual_peers().await?;
        }
        tracing::info!(peer = %peer.id, "Removed peer");
        self.events.emit(CoreEvent::PeerRemoved(peer.id.clone()));
        Ok(peer)
    }

    /// Probe one peer now. Returns whether it answered.
    pub async fn check_peer(&self, id: &str) -> Result<bool> {
        let peer = self
            .peers
            .get(id)
            .ok_or_else(|| CoreError::not_found("peer", id))?;
        let online = self.probe.check(&self.peers, &peer).await;
        if let Some(updated) = self.peers.get(id) {
            self.events.emit(CoreEvent::PeerUpdated(updated));
        }
        Ok(online)
    }

    pub async fn fanout(&self, target_ids: &BTreeSet<String>, operation: &FanoutOperation) -> Result<FanoutResult> {
        self.fanout
            .dispatch(target_ids, operation, self.settings.fanout_timeout)
            .await
    }

    pub async fn list_addons(&self) -> BTreeMap<String, AddonSummary> {
        self.addons.registry().summaries().await
    }

    pub async fn update_addon_config(&self, id: &str, partial: &AddonConfig) -> Result<AddonSummary> {
        self.addons.update_config(id, partial).await
    }

    pub async fn reload_addons(&self) -> Result<usize> {
        self.addons.reload_all().await
    }

    pub async fn addon_frontend_script(&self, id: &str) -> Result<String> {
        self.addons.frontend_script(id).await
    }

    pub async fn addon_asset(&self, id: &str, name: &str) -> Result<Asset> {
        self.addons.export_asset(id, name).await
    }

    pub async fn call_addon_function(&self, id: &str, function: &str) -> Result<serde_json::Value> {
        self.addons.call_function(id, function).await
    }

    async fn persist_manual_peers(&self) -> Result<()> {
        let manual = self.peers.manual_peers();
        self.config.update(|cfg| cfg.peers = manual).await?;
        Ok(())
    }
}

impl Drop for Coordinator {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
