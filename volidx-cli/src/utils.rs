//! Common utility functions shared across CLI commands.

use std::ffi::OsString;
use std::path::Path;

use anyhow::{Context, Result};
use tracing::debug;
use tracing_subscriber::{fmt, EnvFilter};
use volidx_core::{parse_index_specification, IndexSpecification};

/// Environment variable holding a tracing filter directive.
pub const LOG_ENV: &str = "VOLIDX_LOG";

/// Rewrite single-dash long flags (`-mode`) into the `--mode` form clap parses.
///
/// Short flags (`-q`), GNU-style flags, negative numbers, and plain values
/// pass through unchanged.
pub fn normalize_args<I>(args: I) -> Vec<OsString>
where
    I: IntoIterator<Item = OsString>,
{
    args.into_iter()
        .map(|arg| match arg.to_str() {
            Some(s) if is_single_dash_long_flag(s) => OsString::from(format!("-{s}")),
            _ => arg,
        })
        .collect()
}

fn is_single_dash_long_flag(arg: &str) -> bool {
    let mut chars = arg.chars();
    chars.next() == Some('-')
        && chars.next().is_some_and(|c| c.is_ascii_alphabetic())
        && arg.len() > 2
}

/// Install the stderr log subscriber.
///
/// `VOLIDX_LOG` wins when set; otherwise `debug` turns on debug output and the
/// default shows warnings only.
pub fn init_tracing(debug: bool) {
    let filter = EnvFilter::try_from_env(LOG_ENV)
        .unwrap_or_else(|_| EnvFilter::new(if debug { "debug" } else { "warn" }));

    // Stdout carries search results, so logs go to stderr.
    let _ = fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(debug)
        .try_init();
}

/// Parse the index specification, attaching the path to any failure.
pub fn load_index_specification(path: &Path) -> Result<IndexSpecification> {
    let spec = parse_index_specification(path)
        .with_context(|| format!("Failed to parse index specification {}", path.display()))?;
    debug!(path = %path.display(), space = %spec.space, "Parsed index specification");
    Ok(spec)
}
