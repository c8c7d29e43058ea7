//! Persisted host configuration, on-disk layout and runtime tunables.

use crate::error::{CoreError, Result};
use crate::peer::Peer;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_API_PORT: u16 = 3006;
pub const DEFAULT_DISCOVERY_PORT: u16 = 3002;

/// Keys that must never be written into addon config or pushed to peers.
pub const CREDENTIAL_KEYS: &[&str] = &["password", "secret", "token"];

/// Keys that identify a single device and are not fanned out.
pub const IDENTITY_KEYS: &[&str] = &["displayName", "port", "discoveryPort", "staticIp"];

/// Keys owned by one device's admin state: its peer table and addon settings.
pub const LOCAL_STATE_KEYS: &[&str] = &["peers", "addons"];

pub type AddonConfig = Map<String, Value>;

/// The config blob shared with the admin layer and the display loop.
///
/// Only the fields below are interpreted here. Everything else in the blob
/// (image duration, rotation, scaling, ...) is carried through untouched in
/// `extra`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HostConfig {
    pub display_name: String,
    pub port: u16,
    pub discovery_port: u16,
    #[serde(default)]
    pub static_ip: String,
    /// Manual peers only; discovered peers are not persisted.
    #[serde(default)]
    pub peers: Vec<Peer>,
    #[serde(default)]
    pub addons: HashMap<String, AddonConfig>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            display_name: hostname::get()
                .ok()
                .and_then(|h| h.into_string().ok())
                .unwrap_or_else(|| "Digital Signage".to_string()),
            port: DEFAULT_API_PORT,
            discovery_port: DEFAULT_DISCOVERY_PORT,
            static_ip: String::new(),
            peers: Vec::new(),
            addons: HashMap::new(),
            extra: Map::new(),
        }
    }
}

impl HostConfig {
    pub fn static_ipv4(&self) -> Option<Ipv4Addr> {
        let trimmed = self.static_ip.trim();
        if trimmed.is_empty() {
            return None;
        }
        match trimmed.parse() {
            Ok(ip) => Some(ip),
            Err(_) => {
                tracing::warn!(static_ip = %trimmed, "Ignoring unparsable static IP");
                None
            }
        }
    }

    /// Merge a fanned-out config update. Identity and credential keys are
    /// skipped. Returns the keys that were applied.
    pub fn apply_shared(&mut self, updates: &Map<String, Value>) -> Vec<String> {
        let mut applied = Vec::new();
        for (key, value) in shareable(updates) {
            self.extra.insert(key.clone(), value);
            applied.push(key);
        }
        applied
    }
}

/// Strip identity, credential and per-device state keys from a config
/// update. Local and remote targets receive the same result.
pub fn shareable(updates: &Map<String, Value>) -> Map<String, Value> {
    updates
        .iter()
        .filter(|(k, _)| !IDENTITY_KEYS.contains(&k.as_str()))
        .filter(|(k, _)| !CREDENTIAL_KEYS.contains(&k.as_str()))
        .filter(|(k, _)| !LOCAL_STATE_KEYS.contains(&k.as_str()))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect()
}

/// Directory layout of a player install.
#[derive(Debug, Clone)]
pub struct AppPaths {
    pub base: PathBuf,
    pub addons: PathBuf,
    pub media: PathBuf,
    pub fonts: PathBuf,
    pub updates: PathBuf,
    pub config_file: PathBuf,
}

impl AppPaths {
    pub fn from_base(base: impl AsRef<Path>) -> Self {
        let base = base.as_ref().to_path_buf();
        Self {
            addons: base.join("Addons"),
            media: base.join("Media"),
            fonts: base.join("Fonts"),
            updates: base.join("Updates"),
            config_file: base.join("config.json"),
            base,
        }
    }

    /// Directory holding the executable, so an install can be moved around.
    pub fn beside_executable() -> Result<Self> {
        let exe = std::env::current_exe()?;
        let dir = exe
            .parent()
            .ok_or_else(|| CoreError::Config("executable has no parent directory".into()))?;
        Ok(Self::from_base(dir))
    }
}

#[derive(Debug, Clone)]
pub struct DiscoveryConfig {
    pub port: u16,
    pub announce_interval: Duration,
    pub sweep_interval: Duration,
    pub staleness_window: Duration,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_DISCOVERY_PORT,
            announce_interval: Duration::from_secs(5),
            sweep_interval: Duration::from_secs(10),
            staleness_window: Duration::from_secs(30),
        }
    }
}

impl DiscoveryConfig {
    /// A couple of dropped broadcasts must not evict a live peer.
    pub fn validate(&self) -> Result<()> {
        if self.announce_interval.is_zero() || self.sweep_interval.is_zero() {
            return Err(CoreError::Config(
                "discovery intervals must be non-zero".into(),
            ));
        }
        if self.staleness_window < self.announce_interval * 5 {
            return Err(CoreError::Config(format!(
                "staleness window {:?} must be at least 5x the announce interval {:?}",
                self.staleness_window, self.announce_interval
            )));
        }
        Ok(())
    }
}

/// Runtime tunables that are not part of the persisted blob.
#[derive(Debug, Clone)]
pub struct CoreSettings {
    pub paths: AppPaths,
    pub discovery: DiscoveryConfig,
    pub liveness_interval: Duration,
    pub probe_timeout: Duration,
    pub fanout_timeout: Duration,
}

impl CoreSettings {
    pub fn new(paths: AppPaths) -> Self {
        Self {
            paths,
            discovery: DiscoveryConfig::default(),
            liveness_interval: Duration::from_secs(10),
            probe_timeout: Duration::from_secs(2),
            fanout_timeout: Duration::from_secs(30),
        }
    }

    pub fn validate(&self) -> Result<()> {
        self.discovery.validate()?;
        if self.probe_timeout.is_zero() || self.fanout_timeout.is_zero() {
            return Err(CoreError::Config("timeouts must be non-zero".into()));
        }
        Ok(())
    }
}
