use std::io::IsTerminal;

use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::fmt;
use tracing_subscriber::fmt::time::UtcTime;

use crate::config::{LogFormat, Logging};

/// Initializes the global tracing subscriber from the logging config.
///
/// `RUST_LOG` overrides the configured level when set.
pub fn init(config: &Logging) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.level.to_string()));

    let format = match config.format {
        LogFormat::Auto if std::io::stderr().is_terminal() => LogFormat::Pretty,
        LogFormat::Auto => LogFormat::Simplified,
        other => other,
    };

    let builder = fmt()
        .with_timer(UtcTime::rfc_3339())
        .with_target(true)
        .with_env_filter(filter)
        .with_writer(std::io::stderr);

    match format {
        LogFormat::Pretty => builder.pretty().init(),
        LogFormat::Simplified => builder.with_ansi(false).init(),
        LogFormat::Json => builder
            .json()
            .flatten_event(true)
            .with_current_span(true)
            .with_span_list(true)
            .init(),
        LogFormat::Auto => unreachable!("resolved above"),
    }
}
