//! Explicit configuration values for the pool and reservation sessions

use std::path::PathBuf;

use serde::Deserialize;
use serde::Serialize;

/// Per-session options threaded through reservation calls.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SessionOptions {
    /// Reboot each acquired device before use.
    pub reboot_before_use: bool,

    /// Re-run the enabled validators after a requested reboot, so login
    /// state is verified before the device is handed to the caller.
    pub verify_login_after_reboot: bool,
}

/// Pool-wide options supplied at construction.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PoolOptions {
    /// Directory handed to device factories for per-device artifact caches.
    pub cache_dir: PathBuf,
}

impl Default for PoolOptions {
    fn default() -> Self {
        Self {
            cache_dir: std::env::temp_dir().join("fleet-device-cache"),
        }
    }
}
