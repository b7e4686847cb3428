//! Log output for the daemon.
//!
//! Logging starts at `info` before the configuration is read, then switches to
//! `logging.level` once it is. `RUST_LOG`, when set, pins the filter for the
//! whole run.
use std::sync::OnceLock;
use tracing_subscriber::{EnvFilter, fmt, prelude::*, reload};

type FilterHandle = reload::Handle<EnvFilter, tracing_subscriber::Registry>;

static FILTER: OnceLock<FilterHandle> = OnceLock::new();

const BOOT_LEVEL: &str = "info";

fn operator_override() -> Option<EnvFilter> {
    std::env::var_os("RUST_LOG")?;
    EnvFilter::try_from_default_env().ok()
}

/// Parse a configured level, falling back to the boot level when it is not a valid directive.
fn configured_filter(level: &str) -> EnvFilter {
    EnvFilter::try_new(level).unwrap_or_else(|e| {
        eprintln!("Invalid logging.level '{level}' ({e}), keeping '{BOOT_LEVEL}'");
        EnvFilter::new(BOOT_LEVEL)
    })
}

/// Install the global subscriber. Later calls are no-ops.
pub fn init_tracing() {
    let filter = operator_override().unwrap_or_else(|| EnvFilter::new(BOOT_LEVEL));
    let (filter_layer, handle) = reload::Layer::new(filter);
    if FILTER.set(handle).is_err() {
        return;
    }

    let _ = tracing_subscriber::registry()
        .with(filter_layer)
        .with(fmt::layer().with_target(true))
        .try_init();
}

/// Switch to the level from the configuration file.
///
/// Returns `false` when `RUST_LOG` is set or logging was never initialized.
pub fn apply_logging_level(level: &str) -> bool {
    if std::env::var_os("RUST_LOG").is_some() {
        return false;
    }
    let Some(handle) = FILTER.get() else {
        return false;
    };
    let filter = configured_filter(level);
    handle.modify(|current| *current = filter).is_ok()
}
