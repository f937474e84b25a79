use tracing_subscriber::{EnvFilter, fmt, prelude::*};

/// Installs the global tracing subscriber: `RUST_LOG`-style filtering,
/// `info` by default. Safe to call more than once; later calls are no-ops.
pub fn init() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let subscriber = tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt::layer().with_target(false));

    let _ = subscriber.try_init();
}
