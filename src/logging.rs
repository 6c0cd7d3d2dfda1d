use tracing_subscriber::EnvFilter;

#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Default, clap::ValueEnum, strum_macros::Display,
)]
#[strum(serialize_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

/// Install a global subscriber writing to stderr. `RUST_LOG` overrides `default_level` when set.
///
/// Does nothing if a subscriber is already installed, so tests may call it repeatedly.
pub fn init_logging(default_level: &str, format: LogFormat) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    let _ = match format {
        LogFormat::Pretty => builder.with_target(false).try_init(),
        LogFormat::Json => builder.json().try_init(),
    };
}
