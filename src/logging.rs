//! Tracing setup for ledger processes
//!
//! The filter is assembled from the configured base level, a quiet default
//! for `sqlx`, and per-target overrides such as
//! `transfer_ledger::store: debug` to trace row locking alone. `RUST_LOG`
//! replaces all of it when set.

use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::RollingFileAppender;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

use crate::config::LoggingConfig;

/// Targets quieted unless overridden; sqlx logs every statement at info.
const DEFAULT_DIRECTIVES: &[(&str, &str)] = &[("sqlx", "warn")];

/// Build the `EnvFilter` directive string for `config`
pub fn filter_directives(config: &LoggingConfig) -> String {
    let mut directives = vec![config.level.clone()];
    for (target, level) in DEFAULT_DIRECTIVES {
        if !config.targets.contains_key(*target) {
            directives.push(format!("{target}={level}"));
        }
    }
    directives.extend(
        config
            .targets
            .iter()
            .map(|(target, level)| format!("{target}={level}")),
    );
    directives.join(",")
}

fn appender(config: &LoggingConfig) -> RollingFileAppender {
    match config.rotation.as_str() {
        "hourly" => tracing_appender::rolling::hourly(&config.dir, &config.file),
        "daily" => tracing_appender::rolling::daily(&config.dir, &config.file),
        _ => tracing_appender::rolling::never(&config.dir, &config.file),
    }
}

/// Install the global subscriber. Keep the returned guard alive for the
/// lifetime of the process or buffered file output is lost.
pub fn init_logging(config: &LoggingConfig) -> WorkerGuard {
    let (file_writer, guard) = tracing_appender::non_blocking(appender(config));

    let directives = filter_directives(config);
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&directives))
        .unwrap_or_else(|e| {
            eprintln!("invalid log filter '{directives}': {e}; using 'info'");
            EnvFilter::new("info")
        });

    let registry = tracing_subscriber::registry().with(filter);

    // Targets are kept in the output so per-target filters can be matched
    // against what is printed.
    if config.json {
        let file_layer = fmt::layer()
            .json()
            .with_current_span(false)
            .with_writer(file_writer)
            .with_ansi(false);
        registry.with(file_layer).init();
    } else {
        let file_layer = fmt::layer().with_writer(file_writer).with_ansi(false);
        let stdout_layer = fmt::layer().compact().with_ansi(true);
        registry.with(file_layer).with(stdout_layer).init();
    }

    guard
}
