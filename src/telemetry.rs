use tracing_subscriber::EnvFilter;

pub const DEFAULT_LOG_FILTER: &str = "info,market_sync_lib=debug";

/// Installs the global fmt subscriber. `RUST_LOG` overrides `default_filter`.
/// Logs go to stderr so stdout stays free for the console view.
pub fn init_tracing(default_filter: &str) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .compact()
        .init();
}
