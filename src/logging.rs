use tracing::debug;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

/// Installs a stderr `tracing` subscriber.
///
/// `RUST_LOG` wins over `default_level` when it is set.
pub fn init_logging(default_level: &str) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let filter =
        EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new(default_level))?;

    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .finish();

    tracing::subscriber::set_global_default(subscriber)?;
    debug!("logging initialized");
    Ok(())
}
