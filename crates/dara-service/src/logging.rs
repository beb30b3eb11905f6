use std::env;

use sentry::integrations::tracing::EventFilter;
use tracing::Metadata;
use tracing::level_filters::LevelFilter;
use tracing_subscriber::{EnvFilter, Layer};
use tracing_subscriber::fmt::time::UtcTime;
use tracing_subscriber::prelude::*;
use tracing_subscriber::registry::LookupSpan;

use crate::config::{Config, LogFormat};

/// Crates logging at the configured level, everything else logs at `INFO` at most.
const DARA_CRATES: &[&str] = &["dara_service", "dara_worker", "dara"];

/// The default `RUST_LOG` directives for `level`.
fn default_directives(level: LevelFilter) -> String {
    let level = match level {
        LevelFilter::OFF => return String::new(),
        LevelFilter::ERROR => return "ERROR".into(),
        LevelFilter::WARN => return "WARN".into(),
        LevelFilter::INFO => return "INFO".into(),
        LevelFilter::DEBUG => "DEBUG",
        LevelFilter::TRACE => "TRACE",
    };

    let mut directives = String::from("INFO");
    for krate in DARA_CRATES {
        directives.push_str(&format!(",{krate}={level}"));
    }
    directives
}

/// Creates the layer formatting events to `stderr`.
fn fmt_layer<S>(format: LogFormat) -> Box<dyn Layer<S> + Send + Sync>
where
    S: tracing::Subscriber + for<'a> LookupSpan<'a>,
{
    let layer = tracing_subscriber::fmt::layer()
        .with_timer(UtcTime::rfc_3339())
        .with_target(true)
        .with_writer(std::io::stderr);

    match (format, console::user_attended_stderr()) {
        (LogFormat::Auto, true) | (LogFormat::Pretty, _) => layer.pretty().boxed(),
        (LogFormat::Auto, false) | (LogFormat::Simplified, _) => {
            layer.compact().with_ansi(false).boxed()
        }
        (LogFormat::Json, _) => layer
            .json()
            .flatten_event(true)
            .with_current_span(true)
            .with_span_list(true)
            .with_file(true)
            .with_line_number(true)
            .boxed(),
    }
}

/// Sends errors to sentry as events, and everything at or above `INFO` as breadcrumbs.
fn sentry_event_filter(metadata: &Metadata<'_>) -> EventFilter {
    match *metadata.level() {
        tracing::Level::ERROR => EventFilter::Event,
        tracing::Level::WARN | tracing::Level::INFO => EventFilter::Breadcrumb,
        tracing::Level::DEBUG | tracing::Level::TRACE => EventFilter::Ignore,
    }
}

/// Initializes logging for a Dara process.
///
/// This considers the `RUST_LOG` environment variable and defaults it to the level specified in
/// the configuration. Additionally, this toggles `RUST_BACKTRACE` based on the
/// [`enable_backtraces`](crate::config::Logging::enable_backtraces) config value. Worker
/// processes inherit both variables, so they log like the process owning the pool.
///
/// All output goes to `stderr`, as the `stdout` of worker processes carries their protocol.
///
/// # Safety
/// This function uses [`std::env::set_var`] to modify the environment. That function is only safe
/// to call in single-threaded contexts to prevent unsynchronized concurrent access to the
/// environment.
pub unsafe fn init_logging(config: &Config) {
    if config.logging.enable_backtraces {
        // SAFETY: As documented, this function may only be called in a single-threaded context.
        unsafe { env::set_var("RUST_BACKTRACE", "1") };
    }

    let directives = match env::var("RUST_LOG") {
        Ok(directives) => directives,
        Err(_) => {
            let directives = default_directives(config.logging.level);
            // SAFETY: As above.
            unsafe { env::set_var("RUST_LOG", &directives) };
            directives
        }
    };

    let sentry_layer =
        sentry::integrations::tracing::layer().event_filter(sentry_event_filter);

    tracing_subscriber::registry()
        .with(fmt_layer(config.logging.format).with_filter(EnvFilter::new(directives)))
        .with(sentry_layer)
        .init();
}

/// Logs an error to the configured logger or `stderr` if not yet configured.
pub fn ensure_log_error(error: &anyhow::Error) {
    if tracing::Level::ERROR <= tracing::level_filters::STATIC_MAX_LEVEL
        && tracing::Level::ERROR <= LevelFilter::current()
    {
        tracing::error!("{:?}", error);
    } else {
        eprintln!("{error:?}");
    }
}
