//! Helpers related to tracing, used by main entrypoints

/// Initialize tracing with the default configuration.
///
/// Output goes to stderr; the level defaults to `warn` and can be
/// overridden via `RUST_LOG`.
pub fn initialize_tracing() {
    use tracing_subscriber::prelude::*;

    // Don't include timestamps and such because they're not really useful and
    // too verbose, and plus several log targets such as journald will already
    // include timestamps.
    let format = tracing_subscriber::fmt::format()
        .without_time()
        .with_target(false)
        .compact();
    let filter = tracing_subscriber::EnvFilter::builder()
        .with_default_directive(tracing::Level::WARN.into())
        .from_env_lossy();
    let fmt_layer = tracing_subscriber::fmt::layer()
        .event_format(format)
        .with_writer(std::io::stderr);
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt_layer)
        .init();
}
