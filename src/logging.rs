use std::fs::OpenOptions;
use std::sync::Mutex;

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter, Layer};

use crate::config::LogConfig;
use crate::error::{Error, Result};

/// Filter from `RUST_LOG` when set, otherwise the configured level.
/// The crate's own modules follow the level; dependencies stay at `warn`.
pub fn build_filter(level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!("warn,{}={}", env!("CARGO_CRATE_NAME"), level))
    })
}

/// Install the global subscriber: stderr, plus a plain-text file when configured.
/// Calling it twice is an error.
pub fn init_tracing(config: &LogConfig) -> Result<()> {
    let stderr = fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_filter(build_filter(&config.level));

    let file = match &config.file {
        Some(path) => {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let handle = OpenOptions::new().create(true).append(true).open(path)?;
            Some(
                fmt::layer()
                    .with_writer(Mutex::new(handle))
                    .with_ansi(false)
                    .with_filter(build_filter(&config.level)),
            )
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(stderr)
        .with(file)
        .try_init()
        .map_err(|e| Error::Config(format!("failed to initialise logging: {e}")))
}
