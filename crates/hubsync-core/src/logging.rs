//! Tracing bootstrap for binaries.

use tracing_subscriber::EnvFilter;

use crate::config::env_vars;

/// Whether JSON log output was requested through the environment.
pub fn json_logging_requested() -> bool {
    std::env::var(env_vars::LOG_JSON)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(false)
}

/// Build the filter: `RUST_LOG` wins, otherwise `hubsync` at info (debug when verbose).
pub fn env_filter(verbose: bool) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        if verbose {
            EnvFilter::new("hubsync=debug")
        } else {
            EnvFilter::new("hubsync=info").add_directive(tracing::Level::WARN.into())
        }
    })
}

/// Install the global subscriber. Calling it twice is harmless.
pub fn init_tracing(verbose: bool) {
    let filter = env_filter(verbose);

    let result = if json_logging_requested() {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_target(true)
            .try_init()
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .with_thread_ids(false)
            .with_file(false)
            .with_line_number(false)
            .compact()
            .try_init()
    };

    if result.is_err() {
        tracing::debug!(category = "config", "Tracing subscriber already installed");
    }
}
