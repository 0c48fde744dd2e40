use tracing_subscriber::EnvFilter;

/// Installs the fmt subscriber at `info`, or whatever `RUST_LOG` says.
pub fn init() {
    init_with("info");
}

/// Like [`init`] with a different fallback level. Returns `false` if a global
/// subscriber was already installed.
pub fn init_with(default_level: &str) -> bool {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .try_init()
        .is_ok()
}
