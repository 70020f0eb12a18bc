use tracing_subscriber::EnvFilter;

/// Diagnostics go to stderr; stdout is reserved for IPC responses.
/// `RUST_LOG` overrides the default `info` filter.
pub fn init() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .compact()
        .with_ansi(false)
        .with_writer(std::io::stderr)
        .try_init();
}
