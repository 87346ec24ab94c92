//! Tracing subscriber setup.

use tracing_subscriber::{EnvFilter, fmt, prelude::*};

use crate::bugsniper_config::{LogFormat, LoggingSection};

/// Filter directive used when neither `RUST_LOG` nor `[logging] filter` is set.
pub fn default_directive(verbose: bool) -> &'static str {
    if verbose {
        "bugsniper=debug"
    } else {
        "bugsniper=info"
    }
}

/// Pick the filter: `RUST_LOG`, then the configured filter, then the default.
pub fn build_filter(rust_log: Option<&str>, configured: Option<&str>, verbose: bool) -> EnvFilter {
    rust_log
        .into_iter()
        .chain(configured)
        .find_map(|directive| EnvFilter::try_new(directive).ok())
        .unwrap_or_else(|| EnvFilter::new(default_directive(verbose)))
}

/// Install the global subscriber. Logs go to stderr so `--json` output on
/// stdout stays machine-readable. A second call is a no-op.
pub fn init_logging(verbose: bool, section: &LoggingSection) {
    let rust_log = std::env::var("RUST_LOG").ok();
    let filter = build_filter(rust_log.as_deref(), section.filter.as_deref(), verbose);

    let result = match section.format {
        LogFormat::Text => tracing_subscriber::registry()
            .with(fmt::layer().with_target(false).with_writer(std::io::stderr))
            .with(filter)
            .try_init(),
        LogFormat::Json => tracing_subscriber::registry()
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .with(filter)
            .try_init(),
    };
    if result.is_err() {
        tracing::debug!("tracing subscriber already installed");
    }
}
