use anyhow::{anyhow, Result};
use tracing::Level;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

/// Installs the global stderr subscriber. `RUST_LOG` takes precedence over
/// the `verbose` default.
pub fn init_logging(verbose: bool) -> Result<()> {
    let default_level = if verbose { Level::DEBUG } else { Level::INFO };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_level.as_str()));

    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(verbose)
        .with_thread_ids(verbose)
        .compact()
        .finish();

    tracing::subscriber::set_global_default(subscriber)
        .map_err(|e| anyhow!("Failed to initialize logging: {e}"))
}
