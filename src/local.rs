use crate::error::{CoreError, Result};
use crate::events::{CoreEvent, EventBus};
use crate::fanout::FanoutOperation;
use crate::storage::SharedConfig;
use futures::future::BoxFuture;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// In-process counterpart of a peer's admin API, used when a fan-out targets
/// this device.
pub trait LocalTarget: Send + Sync {
    fn apply<'a>(&'a self, operation: &'a FanoutOperation) -> BoxFuture<'a, Result<()>>;
}

/// Applies fan-out operations to this player: merges config into the shared
/// blob, copies media into the media dir, stages update packages for the
/// installer.
pub struct LocalDevice {
    config: Arc<SharedConfig>,
    media_dir: PathBuf,
    update_dir: PathBuf,
    events: EventBus,
}

impl LocalDevice {
    pub fn new(
        config: Arc<SharedConfig>,
        media_dir: PathBuf,
        update_dir: PathBuf,
        events: EventBus,
    ) -> Self {
        Self {
            config,
            media_dir,
            update_dir,
            events,
        }
    }

    async fn apply_config(&self, updates: &serde_json::Map<String, serde_json::Value>) -> Result<()> {
        let (applied, snapshot) = self.config.update(|cfg| cfg.apply_shared(updates)).await?;
        tracing::info!(keys = ?applied, "Applied config locally");
        self.events.emit(CoreEvent::ConfigUpdated(Box::new(snapshot)));
        Ok(())
    }

    async fn save_media(&self, files: &[PathBuf]) -> Result<()> {
        tokio::fs::create_dir_all(&self.media_dir).await?;
        let mut saved = Vec::with_capacity(files.len());
        for file in files {
            let name = safe_file_name(file)?;
            tokio::fs::copy(file, self.media_dir.join(&name)).await?;
            tracing::info!(file = %name, "Saved media");
            saved.push(name);
        }
        self.events.emit(CoreEvent::MediaUpdated { files: saved });
        Ok(())
    }

    async fn stage_update(&self, package: &Path) -> Result<()> {
        tokio::fs::create_dir_all(&self.update_dir).await?;
        let staged = self.update_dir.join(safe_file_name(package)?);
        tokio::fs::copy(package, &staged).await?;
        tracing::info!(path = %staged.display(), "Staged update package");
        self.events.emit(CoreEvent::UpdateStaged(staged));
        Ok(())
    }
}

impl LocalTarget for LocalDevice {
    fn apply<'a>(&'a self, operation: &'a FanoutOperation) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            match operation {
                FanoutOperation::ApplyConfig(updates) => self.apply_config(updates).await,
                FanoutOperation::UploadMedia(files) => self.save_media(files).await,
                FanoutOperation::PushUpdate(package) => self.stage_update(package).await,
            }
        })
    }
}

/// Bare file name of `path`, refusing anything that could escape the target dir.
fn safe_file_name(path: &Path) -> Result<String> {
    let name = path
        .file_name()
        .and_then(|n| n.to_str())
        .filter(|n| !n.is_empty() && *n != "." && *n != "..")
        .ok_or_else(|| CoreError::Config(format!("invalid file name: {}", path.display())))?;
    Ok(name.to_string())
}
