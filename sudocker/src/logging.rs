//! `tracing`-based structured logging setup.
//!
//! A single idempotent install of a global subscriber, driven by an
//! explicit call from `main` rather than a lazy global.

use std::sync::OnceLock;

use tracing_subscriber::{fmt, EnvFilter};

static INSTALLED: OnceLock<()> = OnceLock::new();

/// Installs the global `tracing` subscriber.
///
/// `level` is the base filter (`trace|debug|info|warn|error`); `debug`
/// additionally raises the `sudocker` target to `trace` regardless of
/// `level`, matching `--debug`'s documented behavior of widening the
/// crate's own verbosity while leaving dependency crates alone.
///
/// Safe to call more than once: the second and subsequent calls are no-ops,
/// since tests in multiple modules within one process binary would
/// otherwise panic on `set_global_default`.
pub fn init(level: &str, debug: bool) {
    if INSTALLED.get().is_some() {
        return;
    }

    let mut filter = EnvFilter::new(level);
    if debug {
        filter = filter.add_directive("sudocker=trace".parse().expect("valid directive"));
    }

    let subscriber = fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_ansi(true)
        .finish();

    // Ignore the error: another part of the process (e.g. a test harness)
    // may have already installed a subscriber before we got here.
    let _ = tracing::subscriber::set_global_default(subscriber);
    let _ = INSTALLED.set(());
}
