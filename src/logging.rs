//! Structured logging setup.
//!
//! Installs a `tracing` subscriber with:
//! - `RUST_LOG` environment filter support (default `motion_bridge=info`)
//! - JSON output when `RUST_LOG_FORMAT=json`
//! - Human-readable output on stderr otherwise

use tracing_subscriber::EnvFilter;

const DEFAULT_FILTER: &str = "motion_bridge=info";

/// Initialize the global tracing subscriber.
///
/// Safe to call multiple times; later calls are no-ops.
pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));

    let is_json = std::env::var("RUST_LOG_FORMAT")
        .map(|v| v.eq_ignore_ascii_case("json"))
        .unwrap_or(false);

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(true)
        .with_thread_names(true)
        .with_file(false)
        .with_line_number(false);

    if is_json {
        let _ = subscriber.json().try_init();
    } else {
        let _ = subscriber.try_init();
    }
}
