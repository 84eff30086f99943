// Log subscriber setup
use tracing::info;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Install a formatted tracing subscriber filtered by `RUST_LOG`.
///
/// `default_filter` applies when `RUST_LOG` is unset or invalid, e.g.
/// `"info,busline::transport=debug"`. Fails if a global subscriber was
/// already installed.
///
/// # Examples
///
/// ```no_run
/// busline_core::telemetry::init_tracing("info").expect("tracing");
/// ```
pub fn init_tracing(
    default_filter: &str,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_filter));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer().with_target(true))
        .try_init()?;

    info!(target: "telemetry", version = env!("CARGO_PKG_VERSION"), "Tracing initialized");
    Ok(())
}
