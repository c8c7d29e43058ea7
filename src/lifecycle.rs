use crate::addon::{AddonError, AddonInstance, AddonRegistry, AddonState, AddonSummary, Asset, Slot, TimerRequest};
use crate::config::AddonConfig;
use crate::error::{CoreError, Result};
use crate::events::{CoreEvent, EventBus};
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Drives addon instances through `Stopped <-> Running`.
///
/// Every operation on one addon holds that addon's slot lock for its whole
/// transition, and the registry gate shared. `reload_all` and `stop_all` take
/// the gate exclusively, so they never interleave with a reconfigure.
pub struct AddonLifecycleManager {
    registry: Arc<AddonRegistry>,
    events: EventBus,
    shutting_down: AtomicBool,
}

impl AddonLifecycleManager {
    pub fn new(registry: Arc<AddonRegistry>, events: EventBus) -> Self {
        Self {
            registry,
            events,
            shutting_down: AtomicBool::new(false),
        }
    }

    pub fn registry(&self) -> &Arc<AddonRegistry> {
        &self.registry
    }

    pub async fn load_and_start(&self, id: &str) -> Result<AddonState> {
        let _gate = self.registry.gate().read().await;
        let slot = self.registry.slot(id)?;
        let mut instance = slot.lock().await;
        self.start_locked(&mut instance, &slot).await;
        Ok(instance.state)
    }

    /// Validate and persist `partial`, then restart the addon with the new
    /// config. Invalid input changes nothing.
    pub async fn update_config(&self, id: &str, partial: &AddonConfig) -> Result<AddonSummary> {
        let _gate = self.registry.gate().read().await;
        let slot = self.registry.slot(id)?;
        let mut instance = slot.lock().await;

        self.registry.apply_update(&mut instance, partial).await?;
        tracing::info!(addon = %id, enabled = instance.enabled, "Addon config updated");

        if let Err(e) = self.stop_locked(&mut instance).await {
            log_stop_error(&e, "reconfigure");
        }
        if instance.enabled {
            self.start_locked(&mut instance, &slot).await;
        }

        let summary = instance.summary();
        drop(instance);
        self.events.emit(CoreEvent::AddonsUpdated);
        Ok(summary)
    }

    /// Rescan `Addons/` and swap the result in. If the scan fails the current
    /// set keeps running. Returns the number of addons loaded.
    pub async fn reload_all(&self) -> Result<usize> {
        let _gate = self.registry.gate().write().await;
        let fresh = self.registry.scan().await?;

        let mut failures = 0;
        for slot in self.registry.all_slots() {
            let mut instance = slot.lock().await;
            match self.stop_locked(&mut instance).await {
                Ok(()) | Err(CoreError::TransientIo(_)) => {}
                Err(e) => {
                    log_stop_error(&e, "reload");
                    failures += 1;
                }
            }
        }
        if failures > 0 {
            tracing::warn!(failures, "Some addons did not stop cleanly");
        }

        let slots = self.registry.swap(fresh);
        let count = slots.len();
        if !self.shutting_down.load(Ordering::SeqCst) {
            for slot in &slots {
                let mut instance = slot.lock().await;
                self.start_locked(&mut instance, slot).await;
            }
        }

        tracing::info!(count, "Addons reloaded");
        self.events.emit(CoreEvent::AddonsUpdated);
        Ok(count)
    }

    /// Stop everything for shutdown. Nothing starts afterwards.
    ///
    /// Returns the stop failures worth reporting. Transient I/O errors are
    /// logged and left out.
    pub async fn stop_all(&self) -> Vec<CoreError> {
        self.shutting_down.store(true, Ordering::SeqCst);
        let _gate = self.registry.gate().write().await;
        let mut failures = Vec::new();
        for slot in self.registry.all_slots() {
            let mut instance = slot.lock().await;
            match self.stop_locked(&mut instance).await {
                Ok(()) | Err(CoreError::TransientIo(_)) => {}
                Err(e) => {
                    log_stop_error(&e, "shutdown");
                    failures.push(e);
                }
            }
        }
        tracing::info!(failures = failures.len(), "All addons stopped");
        failures
    }

    /// Call a backend function by name with the addon's current config.
    pub async fn call_function(&self, id: &str, function: &str) -> Result<Value> {
        let _gate = self.registry.gate().read().await;
        let slot = self.registry.slot(id)?;
        let mut instance = slot.lock().await;
        self.ensure_module(&mut instance).await?;

        let owned = function.to_string();
        let out = run_hook(&mut instance, "call", move |module, config| module.call(&owned, config))
            .await
            .map_err(|e| hook_error(id, "call", e))?;
        tracing::debug!(addon = %id, function, found = out.is_some(), "Addon function called");
        out.ok_or_else(|| CoreError::not_found("addon function", function))
    }

    pub async fn frontend_script(&self, id: &str) -> Result<String> {
        let _gate = self.registry.gate().read().await;
        let slot = self.registry.slot(id)?;
        let mut instance = slot.lock().await;
        self.ensure_module(&mut instance).await?;

        let script = run_hook(&mut instance, "frontend", |module, config| module.frontend_script(config))
            .await
            .map_err(|e| hook_error(id, "frontend", e))?;
        script.ok_or_else(|| CoreError::not_found("frontend script", id))
    }

    pub async fn export_asset(&self, id: &str, name: &str) -> Result<Asset> {
        let _gate = self.registry.gate().read().await;
        let slot = self.registry.slot(id)?;
        let mut instance = slot.lock().await;
        self.ensure_module(&mut instance).await?;

        let owned = name.to_string();
        run_hook(&mut instance, "exportAsset", move |module, _| module.export_asset(&owned))
            .await
            .map_err(|e| match e {
                AddonError::Io(io) if io.kind() == std::io::ErrorKind::NotFound => {
                    CoreError::not_found("asset", name)
                }
                AddonError::Asset(reason) => CoreError::InvalidSetting {
                    setting: "asset".into(),
                    reason,
                },
                other => hook_error(id, "exportAsset", other),
            })
    }

    async fn ensure_module(&self, instance: &mut AddonInstance) -> Result<()> {
        if instance.module.is_some() {
            return Ok(());
        }
        self.registry
            .reload_module(instance)
            .await
            .map_err(|e| hook_error(instance.id(), "load", e))
    }

    /// Start an enabled, stopped instance. Failures are logged and leave it
    /// stopped.
    async fn start_locked(&self, instance: &mut AddonInstance, slot: &Slot) {
        if !instance.enabled || instance.state == AddonState::Running {
            return;
        }
        if self.shutting_down.load(Ordering::SeqCst) {
            tracing::debug!(addon = %instance.id(), "Not starting addon during shutdown");
            return;
        }
        if let Err(e) = self.ensure_module(instance).await {
            tracing::error!(error = %e, "Addon could not be loaded");
            return;
        }

        match run_hook(instance, "init", |module, config| module.init(config)).await {
            Ok(timers) => {
                let token = CancellationToken::new();
                for timer in timers {
                    tokio::spawn(run_timer(slot.clone(), timer, token.clone()));
                }
                instance.timers = Some(token);
                instance.state = AddonState::Running;
                tracing::info!(addon = %instance.id(), "Addon started");
            }
            Err(e) => {
                let err = hook_error(instance.id(), "init", e);
                tracing::error!(error = %err, "Addon failed to start");
                instance.state = AddonState::Stopped;
            }
        }
    }

    /// Cancel timers and run `stop` if the instance is running.
    async fn stop_locked(&self, instance: &mut AddonInstance) -> Result<()> {
        if let Some(timers) = instance.timers.take() {
            timers.cancel();
        }
        if instance.state != AddonState::Running {
            return Ok(());
        }
        instance.state = AddonState::Stopped;

        let has_stop = instance.module.as_ref().is_some_and(|m| m.has_stop());
        if has_stop {
            if let Err(e) = run_hook(instance, "stop", |module, _| module.stop()).await {
                return Err(match e.into_transient_io() {
                    Ok(io) => {
                        tracing::debug!(addon = %instance.id(), error = %io, "Transient I/O error in stop");
                        CoreError::TransientIo(io)
                    }
                    Err(e) => hook_error(instance.id(), "stop", e),
                });
            }
        }
        tracing::info!(addon = %instance.id(), "Addon stopped");
        Ok(())
    }
}

fn log_stop_error(err: &CoreError, during: &'static str) {
    match err {
        CoreError::TransientIo(e) => tracing::debug!(error = %e, during, "Transient I/O error in stop"),
        other => tracing::warn!(error = %other, during, "Addon stop failed"),
    }
}

fn hook_error(addon: &str, hook: &'static str, err: AddonError) -> CoreError {
    CoreError::Lifecycle {
        addon: addon.to_string(),
        hook,
        message: err.to_string(),
    }
}

/// Run one hook on the blocking pool. A panic drops the module and stops the
/// instance; the module is reloaded from disk on the next start.
async fn run_hook<T, F>(instance: &mut AddonInstance, hook: &'static str, f: F) -> std::result::Result<T, AddonError>
where
    T: Send + 'static,
    F: FnOnce(&mut dyn crate::addon::AddonModule, &AddonConfig) -> std::result::Result<T, AddonError> + Send + 'static,
{
    let mut module = instance.module.take().ok_or(AddonError::NotLoaded)?;
    let config = instance.config.clone();
    let joined = tokio::task::spawn_blocking(move || {
        let out = f(module.as_mut(), &config);
        (module, out)
    })
    .await;

    match joined {
        Ok((module, out)) => {
            instance.module = Some(module);
            out
        }
        Err(e) => {
            let message = panic_message(e);
            tracing::error!(addon = %instance.id(), hook, %message, "Addon hook panicked, discarding module");
            if let Some(timers) = instance.timers.take() {
                timers.cancel();
            }
            instance.state = AddonState::Stopped;
            Err(AddonError::Panicked(message))
        }
    }
}

fn panic_message(err: tokio::task::JoinError) -> String {
    match err.try_into_panic() {
        Ok(payload) => payload
            .downcast_ref::<&str>()
            .map(|s| s.to_string())
            .or_else(|| payload.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "unknown panic".to_string()),
        Err(err) => err.to_string(),
    }
}

async fn run_timer(slot: Slot, timer: TimerRequest, token: CancellationToken) {
    let mut ticker = tokio::time::interval(timer.every.max(Duration::from_millis(1)));
    // The first tick completes immediately.
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let mut instance = slot.lock().await;
        if token.is_cancelled() {
            break;
        }
        let name = timer.name.clone();
        if let Err(e) = run_hook(&mut instance, "timer", move |module, config| module.on_timer(&name, config)).await {
            tracing::warn!(addon = %instance.id(), timer = %timer.name, error = %e, "Addon timer failed");
        }
    }
    tracing::trace!(timer = %timer.name, "Addon timer exited");
}
