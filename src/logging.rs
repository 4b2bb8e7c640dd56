//! Process-wide logger setup.
//!
//! The library itself only emits through the `log` facade. Binaries and tests
//! call [`init_logging`] once to get `env_logger` output on stderr.

use std::sync::Once;

use env_logger::{Builder, Env};
use log::LevelFilter;

/// Crate-specific level variable, consulted before `RUST_LOG`.
pub const LOG_ENV: &str = "PC80B_LOG";

static INSTALL: Once = Once::new();

/// Parse a level name, case-insensitive. `None` when absent or unrecognised.
pub fn parse_level(input: Option<&str>) -> Option<LevelFilter> {
    input?.trim().parse().ok()
}

/// Level to pin the logger to, or `None` when `RUST_LOG` directives apply.
///
/// Precedence: explicit level, `PC80B_LOG`, `RUST_LOG`, then `info`.
fn resolve_level(
    explicit: Option<&str>,
    lookup: impl Fn(&str) -> Option<String>,
) -> Option<LevelFilter> {
    if let Some(level) = parse_level(explicit).or_else(|| parse_level(lookup(LOG_ENV).as_deref())) {
        return Some(level);
    }
    match lookup("RUST_LOG") {
        Some(directives) if !directives.trim().is_empty() => None,
        _ => Some(LevelFilter::Info),
    }
}

/// Install stderr logging with the level from `PC80B_LOG`, then `RUST_LOG`,
/// defaulting to `info`.
pub fn init_logging() {
    init_logging_with(None);
}

/// Like [`init_logging`], with `level` taking precedence over the environment.
///
/// Only the first call installs anything. A logger the host application
/// installed earlier is left in place.
pub fn init_logging_with(level: Option<&str>) {
    let level = resolve_level(level, |key| std::env::var(key).ok());
    INSTALL.call_once(|| {
        let mut builder = match level {
            Some(level) => {
                let mut builder = Builder::new();
                builder.filter_level(level);
                builder
            }
            None => Builder::from_env(Env::default()),
        };
        let _ = builder
            .format_timestamp_millis()
            .format_module_path(true)
            .format_target(false)
            .try_init();
    });
}
