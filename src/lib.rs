pub mod addon;
pub mod cli;
pub mod config;
pub mod coordinator;
pub mod discovery;
pub mod error;
pub mod events;
pub mod fanout;
pub mod health;
pub mod lifecycle;
pub mod local;
pub mod logging;
pub mod manifest;
pub mod peer;
pub mod protocol;
pub mod registry;
pub mod script;
pub mod storage;
pub mod transport;

use clap::Parser;
use cli::{Args, Command};
use config::{AppPaths, CoreSettings};
use coordinator::Coordinator;
use discovery::DiscoveryMode;
use error::{CoreError, Result};
use std::sync::Arc;
use std::time::Duration;
use storage::JsonFileStore;
use tokio::sync::broadcast::error::RecvError;

pub fn run() {
    let args = Args::parse();
    let _log_guard = logging::init(&args.log_level, args.log_dir.as_deref());

    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(rt) => rt,
        Err(e) => {
            tracing::error!(error = %e, "Failed to start async runtime");
            std::process::exit(1);
        }
    };

    if let Err(e) = runtime.block_on(execute(args)) {
        tracing::error!(error = %e, "Exiting");
        std::process::exit(1);
    }
}

async fn execute(args: Args) -> Result<()> {
    let paths = match &args.base_dir {
        Some(dir) => AppPaths::from_base(dir),
        None => AppPaths::beside_executable()?,
    };
    tracing::info!(base = %paths.base.display(), "Using install directory");

    let store = Arc::new(JsonFileStore::new(&paths.config_file));
    let coordinator = Coordinator::new(CoreSettings::new(paths), store)?;

    match args.command.unwrap_or(Command::Serve) {
        Command::Serve => serve(&coordinator).await,
        Command::Addons => {
            coordinator.reload_addons().await?;
            print_json(&coordinator.list_addons().await)?;
            coordinator.shutdown().await;
            Ok(())
        }
        Command::Peers { wait } => {
            coordinator.start().await?;
            tokio::time::sleep(Duration::from_secs(wait)).await;
            print_json(&coordinator.list_peers())?;
            coordinator.shutdown().await;
            Ok(())
        }
        Command::Call { addon, function } => {
            coordinator.reload_addons().await?;
            let result = coordinator.call_addon_function(&addon, &function).await;
            coordinator.shutdown().await;
            print_json(&result?)
        }
    }
}

async fn serve(coordinator: &Coordinator) -> Result<()> {
    let mut events = coordinator.subscribe();
    if let DiscoveryMode::Degraded { reason, announcing } = coordinator.start().await? {
        tracing::warn!(%reason, announcing, "Discovery running degraded, manual peers only");
    }

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            event = events.recv() => match event {
                Ok(event) => {
                    let data = serde_json::to_string(&event).unwrap_or_default();
                    tracing::info!(event = event.name(), %data, "Event");
                }
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "Event log fell behind");
                }
                Err(RecvError::Closed) => break,
            },
        }
    }

    coordinator.shutdown().await;
    Ok(())
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    let json = serde_json::to_string_pretty(value).map_err(|e| CoreError::Config(e.to_string()))?;
    println!("{json}");
    Ok(())
}
