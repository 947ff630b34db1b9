//! Logging configuration for the command-line front-end.

use std::str::FromStr;

use clap_verbosity_flag::{InfoLevel, Verbosity};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::filter::Directive;

/// Initializes the tracing subscriber. The default level follows the
/// `-v`/`-q` flags; a `RUST_LOG` environment filter overrides it.
pub fn init_logging(verbosity: &Verbosity<InfoLevel>) {
    let default = format!("delocate={}", verbosity.log_level_filter());
    let env_filter = EnvFilter::builder()
        .with_default_directive(
            Directive::from_str(&default).expect("level filters are valid directives"),
        )
        .from_env_lossy();

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .without_time()
        .init();
}
