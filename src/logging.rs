use std::path::Path;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

const LOG_FILE_PREFIX: &str = "signage-sync.log";

/// Install the global subscriber. `RUST_LOG` wins over `level`.
///
/// With a log dir, output also goes to a daily rolling file; keep the
/// returned guard alive or buffered lines are lost on exit.
pub fn init(level: &str, log_dir: Option<&Path>) -> Option<WorkerGuard> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let registry = tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer());

    match log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, LOG_FILE_PREFIX);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let file_layer = tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(writer);
            if registry.with(file_layer).try_init().is_err() {
                tracing::debug!("Subscriber already installed");
            }
            Some(guard)
        }
        None => {
            if registry.try_init().is_err() {
                tracing::debug!("Subscriber already installed");
            }
            None
        }
    }
}
