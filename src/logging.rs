/// Initializes the global `tracing` subscriber from `RUST_LOG`, defaulting to
/// `info` when unset.
pub fn init() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .try_init()
        .expect("setting default subscriber failed");
}
