//! Addon discovery and per-addon state.
//!
//! An addon is a directory under `Addons/` holding an `addon.toml`, an
//! optional `backend.lua` and an optional `frontend.js`. The registry owns the
//! current set; the lifecycle manager drives state transitions on it.

use crate::config::{AddonConfig, CREDENTIAL_KEYS};
use crate::error::{is_transient_io, CoreError, Result};
use crate::manifest::{AddonInfo, AddonManifest, SettingSpec, MANIFEST_FILE};
use crate::storage::SharedConfig;
use base64::Engine;
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

pub const FRONTEND_FILE: &str = "frontend.js";

/// Errors raised by addon code or while reaching it.
#[derive(Error, Debug)]
pub enum AddonError {
    #[error("script error: {0}")]
    Script(#[from] mlua::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("hook panicked: {0}")]
    Panicked(String),

    #[error("module not loaded")]
    NotLoaded,

    #[error("asset rejected: {0}")]
    Asset(String),
}

impl AddonError {
    /// Split off the underlying I/O error if this is a broken pipe or the
    /// like, usually from writing to a console or socket that is already gone.
    pub fn into_transient_io(self) -> std::result::Result<std::io::Error, AddonError> {
        match self {
            AddonError::Io(e) if is_transient_io(&e) => Ok(e),
            AddonError::Script(e) => match script_io(&e).filter(|io| is_transient_io(io)) {
                Some(io) => Ok(std::io::Error::new(io.kind(), io.to_string())),
                None => Err(AddonError::Script(e)),
            },
            other => Err(other),
        }
    }
}

fn script_io(err: &mlua::Error) -> Option<&std::io::Error> {
    match err {
        mlua::Error::ExternalError(inner) => inner.downcast_ref::<std::io::Error>(),
        mlua::Error::CallbackError { cause, .. } => script_io(cause),
        _ => None,
    }
}

/// A repeating callback requested by an addon's `init`.
#[derive(Debug, Clone, PartialEq)]
pub struct TimerRequest {
    pub name: String,
    pub every: Duration,
}

/// A file served to the display layer on behalf of an addon.
#[derive(Debug, Clone, PartialEq)]
pub struct Asset {
    pub name: String,
    pub mime: &'static str,
    pub bytes: Vec<u8>,
}

impl Asset {
    pub fn data_uri(&self) -> String {
        let encoded = base64::engine::general_purpose::STANDARD.encode(&self.bytes);
        format!("data:{};base64,{}", self.mime, encoded)
    }
}

/// Loaded addon code. All hooks are synchronous and run on the blocking pool.
pub trait AddonModule: Send {
    fn has_backend(&self) -> bool;

    /// Refine the settings schema at load time, e.g. to fill option lists.
    fn adjust_settings(&mut self, settings: Vec<SettingSpec>) -> std::result::Result<Vec<SettingSpec>, AddonError> {
        Ok(settings)
    }

    /// Start with `config`. Returns the timers to run while started.
    fn init(&mut self, config: &AddonConfig) -> std::result::Result<Vec<TimerRequest>, AddonError>;

    fn has_stop(&self) -> bool;

    fn stop(&mut self) -> std::result::Result<(), AddonError>;

    fn on_timer(&mut self, timer: &str, config: &AddonConfig) -> std::result::Result<(), AddonError>;

    /// Script injected into the display layer, if the addon has one.
    fn frontend_script(&mut self, config: &AddonConfig) -> std::result::Result<Option<String>, AddonError>;

    fn export_asset(&mut self, name: &str) -> std::result::Result<Asset, AddonError>;

    /// Invoke a named backend function with the current config. `None` when
    /// the module has no such function.
    fn call(&mut self, _function: &str, _config: &AddonConfig) -> std::result::Result<Option<Value>, AddonError> {
        Ok(None)
    }
}

/// Turns an addon directory into a fresh module.
pub trait AddonLoader: Send + Sync {
    fn load(&self, id: &str, dir: &Path) -> std::result::Result<Box<dyn AddonModule>, AddonError>;
}

/// What was found on disk. Immutable until the next reload.
#[derive(Debug, Clone)]
pub struct Addon {
    pub id: String,
    pub dir: PathBuf,
    pub manifest: AddonManifest,
    pub has_backend: bool,
    pub has_frontend: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AddonState {
    Stopped,
    Running,
}

pub struct AddonInstance {
    pub addon: Addon,
    pub config: AddonConfig,
    pub enabled: bool,
    pub state: AddonState,
    /// `None` after a hook panicked; reloaded from disk on the next start.
    pub(crate) module: Option<Box<dyn AddonModule>>,
    pub(crate) timers: Option<CancellationToken>,
}

impl AddonInstance {
    pub fn id(&self) -> &str {
        &self.addon.id
    }

    pub fn summary(&self) -> AddonSummary {
        AddonSummary {
            id: self.addon.id.clone(),
            info: self.addon.manifest.info.clone(),
            enabled: self.enabled,
            config: self.config.clone(),
            settings: self.addon.manifest.settings.clone(),
            has_backend: self.addon.has_backend,
            has_frontend: self.addon.has_frontend,
            state: self.state,
        }
    }
}

/// Admin view of one addon.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AddonSummary {
    pub id: String,
    pub info: AddonInfo,
    pub enabled: bool,
    pub config: AddonConfig,
    pub settings: Vec<SettingSpec>,
    pub has_backend: bool,
    pub has_frontend: bool,
    pub state: AddonState,
}

pub type Slot = Arc<tokio::sync::Mutex<AddonInstance>>;

/// Effective config: persisted values over manifest defaults. Returns the
/// config and the `enabled` flag.
pub fn merge_config(addon: &str, manifest: &AddonManifest, persisted: Option<&AddonConfig>) -> (AddonConfig, bool) {
    let mut config = manifest.defaults();
    let Some(persisted) = persisted else {
        return (config, true);
    };

    for setting in &manifest.settings {
        let Some(value) = persisted.get(&setting.id) else {
            continue;
        };
        match setting.check(value) {
            Ok(()) => {
                config.insert(setting.id.clone(), value.clone());
            }
            Err(e) => {
                tracing::warn!(addon, error = %e, "Persisted value invalid, using default");
            }
        }
    }
    let enabled = persisted.get("enabled") != Some(&Value::Bool(false));
    (config, enabled)
}

pub struct AddonRegistry {
    addons_dir: PathBuf,
    loader: Arc<dyn AddonLoader>,
    config: Arc<SharedConfig>,
    slots: parking_lot::RwLock<BTreeMap<String, Slot>>,
    gate: tokio::sync::RwLock<()>,
}

impl AddonRegistry {
    pub fn new(addons_dir: PathBuf, loader: Arc<dyn AddonLoader>, config: Arc<SharedConfig>) -> Self {
        Self {
            addons_dir,
            loader,
            config,
            slots: parking_lot::RwLock::new(BTreeMap::new()),
            gate: tokio::sync::RwLock::new(()),
        }
    }

    pub fn addons_dir(&self) -> &Path {
        &self.addons_dir
    }

    /// Held shared by single-addon operations, exclusively by reload and
    /// shutdown.
    pub(crate) fn gate(&self) -> &tokio::sync::RwLock<()> {
        &self.gate
    }

    pub fn ids(&self) -> Vec<String> {
        self.slots.read().keys().cloned().collect()
    }

    pub fn slot(&self, id: &str) -> Result<Slot> {
        self.slots
            .read()
            .get(id)
            .cloned()
            .ok_or_else(|| CoreError::not_found("addon", id))
    }

    pub(crate) fn all_slots(&self) -> Vec<Slot> {
        self.slots.read().values().cloned().collect()
    }

    /// Replace the current set. Callers stop the old set first.
    pub(crate) fn swap(&self, instances: Vec<AddonInstance>) -> Vec<Slot> {
        let next: BTreeMap<String, Slot> = instances
            .into_iter()
            .map(|i| (i.addon.id.clone(), Arc::new(tokio::sync::Mutex::new(i))))
            .collect();
        let slots = next.values().cloned().collect();
        *self.slots.write() = next;
        slots
    }

    pub async fn summaries(&self) -> BTreeMap<String, AddonSummary> {
        let _gate = self.gate.read().await;
        let mut out = BTreeMap::new();
        for slot in self.all_slots() {
            let instance = slot.lock().await;
            out.insert(instance.addon.id.clone(), instance.summary());
        }
        out
    }

    /// Read every addon directory. Broken addons are logged and skipped; only
    /// a failure to read `Addons/` itself is an error.
    pub async fn scan(&self) -> Result<Vec<AddonInstance>> {
        if !tokio::fs::try_exists(&self.addons_dir).await? {
            tokio::fs::create_dir_all(&self.addons_dir).await?;
            tracing::info!(dir = %self.addons_dir.display(), "Created addons directory");
            return Ok(Vec::new());
        }

        let persisted = self.config.snapshot().addons;
        let mut entries = tokio::fs::read_dir(&self.addons_dir).await?;
        let mut found = Vec::new();

        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await?.is_dir() {
                continue;
            }
            let dir = entry.path();
            let Some(id) = dir.file_name().and_then(|n| n.to_str()).map(str::to_string) else {
                continue;
            };
            if !dir.join(MANIFEST_FILE).is_file() {
                tracing::debug!(addon = %id, "Skipping directory without {}", MANIFEST_FILE);
                continue;
            }

            match self.load_addon(&id, dir, persisted.get(&id)).await {
                Ok(instance) => found.push(instance),
                Err(e) => tracing::warn!(addon = %id, error = %e, "Skipping addon"),
            }
        }

        found.sort_by(|a, b| a.addon.id.cmp(&b.addon.id));
        tracing::info!(count = found.len(), "Scanned addons");
        Ok(found)
    }

    async fn load_addon(&self, id: &str, dir: PathBuf, persisted: Option<&AddonConfig>) -> Result<AddonInstance> {
        let content = tokio::fs::read_to_string(dir.join(MANIFEST_FILE)).await?;
        let manifest = AddonManifest::parse(id, &content)?;

        let loader = self.loader.clone();
        let (owned_id, owned_dir) = (id.to_string(), dir.clone());
        let invalid = |reason: String| CoreError::Validation {
            addon: id.to_string(),
            reason,
        };

        let loaded = tokio::task::spawn_blocking(move || {
            let mut module = loader.load(&owned_id, &owned_dir)?;
            let settings = module.adjust_settings(manifest.settings)?;
            let manifest = AddonManifest {
                info: manifest.info,
                settings,
            };
            Ok::<_, AddonError>((module, manifest))
        })
        .await
        .map_err(|e| invalid(format!("loader panicked: {e}")))?;
        let (module, manifest) = loaded.map_err(|e| invalid(e.to_string()))?;
        manifest.validate(id)?;

        let (config, enabled) = merge_config(id, &manifest, persisted);
        Ok(AddonInstance {
            addon: Addon {
                id: id.to_string(),
                has_backend: module.has_backend(),
                has_frontend: dir.join(FRONTEND_FILE).is_file(),
                dir,
                manifest,
            },
            config,
            enabled,
            state: AddonState::Stopped,
            module: Some(module),
            timers: None,
        })
    }

    /// Load a fresh module for an instance whose module was discarded.
    pub(crate) async fn reload_module(&self, instance: &mut AddonInstance) -> std::result::Result<(), AddonError> {
        let loader = self.loader.clone();
        let id = instance.addon.id.clone();
        let dir = instance.addon.dir.clone();
        let module = tokio::task::spawn_blocking(move || loader.load(&id, &dir))
            .await
            .map_err(|e| AddonError::Panicked(e.to_string()))??;
        tracing::info!(addon = %instance.addon.id, "Reloaded addon module");
        instance.module = Some(module);
        Ok(())
    }

    /// Validate `partial`, persist it and recompute the instance's effective
    /// config. Credential keys are dropped. Nothing changes on error.
    pub(crate) async fn apply_update(&self, instance: &mut AddonInstance, partial: &AddonConfig) -> Result<()> {
        let mut accepted = AddonConfig::new();
        for (key, value) in partial {
            if CREDENTIAL_KEYS.contains(&key.as_str()) {
                tracing::warn!(addon = %instance.id(), key = %key, "Dropping credential field");
                continue;
            }
            if key == "enabled" {
                if !value.is_boolean() {
                    return Err(CoreError::InvalidSetting {
                        setting: key.clone(),
                        reason: format!("expected a boolean, got {value}"),
                    });
                }
            } else if let Some(setting) = instance.addon.manifest.setting(key) {
                setting.check(value)?;
            }
            accepted.insert(key.clone(), value.clone());
        }

        let id = instance.addon.id.clone();
        let (persisted, _) = self.config.update(|cfg| {
            let entry = cfg.addons.entry(id).or_default();
            entry.extend(accepted);
            entry.clone()
        })
        .await?;

        let (config, enabled) = merge_config(instance.id(), &instance.addon.manifest, Some(&persisted));
        instance.config = config;
        instance.enabled = enabled;
        Ok(())
    }
}
