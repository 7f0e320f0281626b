use tracing_subscriber::EnvFilter;

/// Initialize the tracing subscriber: plain format on stderr, level from
/// RUST_LOG with an info default.
pub fn setup_logging() {
	tracing_subscriber::fmt()
		.with_env_filter(EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()))
		.with_writer(std::io::stderr)
		.with_ansi(false)
		.init();
}
