use crate::config::HostConfig;
use crate::error::StoreError;
use parking_lot::{Mutex, RwLock};
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

/// Where the host config blob lives. The core reads it at startup and writes
/// it back on manual-peer and addon-config changes.
pub trait ConfigStore: Send + Sync {
    fn load(&self) -> Result<HostConfig, StoreError>;
    fn save(&self, config: &HostConfig) -> Result<(), StoreError>;
}

/// `config.json` next to the install.
pub struct JsonFileStore {
    path: PathBuf,
}

impl JsonFileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    fn io_err(&self, source: std::io::Error) -> StoreError {
        StoreError::Io {
            path: self.path.display().to_string(),
            source,
        }
    }
}

impl ConfigStore for JsonFileStore {
    fn load(&self) -> Result<HostConfig, StoreError> {
        if !self.path.exists() {
            let defaults = HostConfig::default();
            self.save(&defaults)?;
            tracing::info!(path = %self.path.display(), "Wrote default config");
            return Ok(defaults);
        }

        let content = fs::read_to_string(&self.path).map_err(|e| self.io_err(e))?;
        let config: HostConfig = serde_json::from_str(&content)?;
        tracing::debug!(path = %self.path.display(), "Loaded config");
        Ok(config)
    }

    fn save(&self, config: &HostConfig) -> Result<(), StoreError> {
        // Ensure directory exists
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(|e| self.io_err(e))?;
        }

        let json = serde_json::to_string_pretty(config)?;
        fs::write(&self.path, json).map_err(|e| self.io_err(e))?;
        tracing::debug!(path = %self.path.display(), "Saved config");
        Ok(())
    }
}

/// Keeps the blob in memory. Used when the host embeds the core with its own
/// persistence, and in tests.
#[derive(Default)]
pub struct MemoryStore {
    config: Mutex<HostConfig>,
    saves: Mutex<usize>,
}

impl MemoryStore {
    pub fn new(config: HostConfig) -> Self {
        Self {
            config: Mutex::new(config),
            saves: Mutex::new(0),
        }
    }

    pub fn save_count(&self) -> usize {
        *self.saves.lock()
    }
}

impl ConfigStore for MemoryStore {
    fn load(&self) -> Result<HostConfig, StoreError> {
        Ok(self.config.lock().clone())
    }

    fn save(&self, config: &HostConfig) -> Result<(), StoreError> {
        *self.config.lock() = config.clone();
        *self.saves.lock() += 1;
        Ok(())
    }
}

/// The live config blob plus its backing store.
///
/// Readers get cheap snapshots. Writers go through [`SharedConfig::update`],
/// which serializes the read-modify-write and persists before returning.
/// Saving runs on the blocking pool.
pub struct SharedConfig {
    current: RwLock<HostConfig>,
    store: Arc<dyn ConfigStore>,
    write: tokio::sync::Mutex<()>,
}

impl SharedConfig {
    pub fn load(store: Arc<dyn ConfigStore>) -> Result<Self, StoreError> {
        let current = store.load()?;
        Ok(Self {
            current: RwLock::new(current),
            store,
            write: tokio::sync::Mutex::new(()),
        })
    }

    pub fn snapshot(&self) -> HostConfig {
        self.current.read().clone()
    }

    /// Apply `change` to a copy, save it, then publish it. On a store error
    /// the in-memory blob is left as it was.
    pub async fn update<R>(&self, change: impl FnOnce(&mut HostConfig) -> R) -> Result<(R, HostConfig), StoreError> {
        let _write = self.write.lock().await;
        let mut next = self.current.read().clone();
        let out = change(&mut next);

        let (store, saved) = (self.store.clone(), next.clone());
        tokio::task::spawn_blocking(move || store.save(&saved)).await??;
        *self.current.write() = next.clone();
        Ok((out, next))
    }
}
