//! Process-wide configuration: the on-disk layout root and a small JSON
//! user-preferences file.
//!
//! Resolution is explicit and one-shot: callers initialize once at
//! program start (`main()`), and every subsequent read reuses the
//! resolved value. No core operation resolves `SUDOCKER_CONFIG` on its
//! own.

use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use serde::{Deserialize, Serialize};
use sudocker_shared::{SudockerError, SudockerResult};

static CONFIG_DIR: OnceLock<PathBuf> = OnceLock::new();
static DATA_ROOT: OnceLock<PathBuf> = OnceLock::new();

/// User-facing preferences, persisted at `<config dir>/config.json`.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct UserConfig {
    #[serde(default)]
    pub log_level: Option<String>,
    #[serde(default)]
    pub default_network: Option<String>,
    #[serde(default)]
    pub stop_timeout_secs: Option<u64>,
}

/// Resolves the config directory once for the process and stores it.
///
/// Precedence: `explicit` (the `--config` flag) > `$SUDOCKER_CONFIG` >
/// `~/.sudocker`. Calling this more than once is an internal bug (the CLI
/// calls it exactly once from `main`); a second call returns
/// [`SudockerError::Internal`] rather than silently keeping the first
/// value, so a misuse is visible in tests.
pub fn init(explicit: Option<PathBuf>) -> SudockerResult<()> {
    let dir = explicit
        .or_else(|| std::env::var_os("SUDOCKER_CONFIG").map(PathBuf::from))
        .or_else(|| dirs::home_dir().map(|h| h.join(".sudocker")))
        .ok_or_else(|| {
            SudockerError::Internal("could not determine a home directory for config".into())
        })?;

    std::fs::create_dir_all(&dir)?;

    CONFIG_DIR.set(dir).map_err(|_| {
        SudockerError::Internal("config already initialized; init() called twice".into())
    })
}

/// Returns the resolved config directory.
///
/// Panics if [`init`] has not been called yet — every entrypoint (`main`,
/// `init` re-exec, tests) must call `init` before touching any core
/// operation, so this is a programming error, not a recoverable one.
pub fn dir() -> &'static Path {
    CONFIG_DIR
        .get()
        .expect("sudocker::config::init() must be called before first use")
        .as_path()
}

/// Convenience accessor used by tests that want a resolved dir without
/// going through the global, e.g. to point persistence at a tempdir.
#[cfg(test)]
pub fn init_for_test(dir: PathBuf) {
    let _ = CONFIG_DIR.set(dir);
}

/// Resolves the data root once for the process: the directory holding
/// overlay storage, registry state, container logs, and cgroup/network
/// bookkeeping.
///
/// Precedence: `explicit` (the `--data-root` flag) > `$SUDOCKER_DATA_ROOT`
/// > `/var/lib/sudocker`. Same double-init protection as [`init`].
pub fn init_data_root(explicit: Option<PathBuf>) -> SudockerResult<()> {
    let dir = explicit
        .or_else(|| std::env::var_os("SUDOCKER_DATA_ROOT").map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from("/var/lib/sudocker"));

    std::fs::create_dir_all(&dir)?;

    DATA_ROOT.set(dir).map_err(|_| {
        SudockerError::Internal("data root already initialized; init_data_root() called twice".into())
    })
}

/// Returns the resolved data root.
///
/// Panics if [`init_data_root`] has not been called yet, for the same
/// reason [`dir`] panics: every entrypoint calls it once at startup.
pub fn data_root() -> &'static Path {
    DATA_ROOT
        .get()
        .expect("sudocker::config::init_data_root() must be called before first use")
        .as_path()
}

#[cfg(test)]
pub fn init_data_root_for_test(dir: PathBuf) {
    let _ = DATA_ROOT.set(dir);
}

pub fn load_user_config() -> SudockerResult<UserConfig> {
    let path = dir().join("config.json");
    if !path.exists() {
        return Ok(UserConfig::default());
    }
    let bytes = std::fs::read(&path)?;
    Ok(serde_json::from_slice(&bytes)?)
}

pub fn save_user_config(cfg: &UserConfig) -> SudockerResult<()> {
    crate::util::atomic_write(&dir().join("config.json"), serde_json::to_vec_pretty(cfg)?.as_slice())
}
