//! Process-wide `tracing` subscriber setup.
//!
//! Logs go to stderr so command output on stdout stays machine-readable.
//! With `[logging] directory` set, a daily-rolling plain-text file is written
//! as well.

use anyhow::{Context, Result};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::{Layered, SubscriberExt};
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer, Registry};

use crate::config::{LogFormat, LoggingSection};

/// File name prefix of rolled log files
pub const LOG_FILE_PREFIX: &str = "checkgate.log";

type FilteredRegistry = Layered<EnvFilter, Registry>;
type BoxedLayer = Box<dyn Layer<FilteredRegistry> + Send + Sync>;

/// Filter directive used when `RUST_LOG` is not set.
pub fn filter_directive(config: &LoggingSection, verbose: bool) -> String {
    if verbose {
        "debug".to_string()
    } else {
        config.filter.clone()
    }
}

/// `RUST_LOG` wins over the configured directive.
pub fn build_filter(config: &LoggingSection, verbose: bool) -> Result<EnvFilter> {
    if let Ok(filter) = EnvFilter::try_from_default_env() {
        return Ok(filter);
    }
    let directive = filter_directive(config, verbose);
    EnvFilter::try_new(&directive).with_context(|| format!("Invalid log filter '{}'", directive))
}

/// Install the global subscriber.
///
/// Keep the returned guard alive for the life of the process; dropping it
/// flushes and stops the file writer.
pub fn init(config: &LoggingSection, verbose: bool) -> Result<Option<WorkerGuard>> {
    let filter = build_filter(config, verbose)?;
    let mut layers: Vec<BoxedLayer> = Vec::new();

    let console = tracing_subscriber::fmt::layer().with_writer(std::io::stderr);
    layers.push(match config.format {
        LogFormat::Text => console.boxed(),
        LogFormat::Json => console.json().boxed(),
    });

    let guard = match &config.directory {
        Some(dir) => {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create log directory: {}", dir.display()))?;
            let appender = tracing_appender::rolling::daily(dir, LOG_FILE_PREFIX);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let file = tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(writer);
            layers.push(match config.format {
                LogFormat::Text => file.boxed(),
                LogFormat::Json => file.json().boxed(),
            });
            Some(guard)
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(layers)
        .try_init()
        .context("Failed to install tracing subscriber")?;

    Ok(guard)
}
