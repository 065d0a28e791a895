//! Persistent configuration for simbroker.
//!
//! Stores broker defaults in `~/.simbroker/config.json`. Every value can be
//! overridden per invocation from the command line; the file only changes the
//! defaults used when a flag is absent.
//!
//! The state directory itself can be relocated with the `SIMBROKER_HOME`
//! environment variable, which is also how tests isolate themselves.
//!
//! # Example
//!
//! ```no_run
//! use simbroker_core::config::BrokerConfig;
//!
//! // Load (returns defaults if file doesn't exist)
//! let config = BrokerConfig::load();
//! println!("companion: {}", config.companion_path.display());
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

const CONFIG_FILENAME: &str = "config.json";

/// Environment variable that relocates the simbroker state directory.
pub const HOME_ENV: &str = "SIMBROKER_HOME";

/// Returns the simbroker state directory, creating it if needed.
///
/// Resolves to `$SIMBROKER_HOME` when set, `~/.simbroker` otherwise, and
/// falls back to a directory under the system temp dir when no home
/// directory can be determined.
pub fn simbroker_dir() -> PathBuf {
    let dir = std::env::var_os(HOME_ENV)
        .map(PathBuf::from)
        .or_else(|| dirs::home_dir().map(|home| home.join(".simbroker")))
        .unwrap_or_else(|| std::env::temp_dir().join("simbroker"));
    std::fs::create_dir_all(&dir).ok();
    dir
}

/// Directory holding supervisor logs.
pub fn logs_dir() -> PathBuf {
    let dir = simbroker_dir().join("logs");
    std::fs::create_dir_all(&dir).ok();
    dir
}

/// Directory holding companion control files, diagnostics and sockets.
///
/// Created on the first companion launch.
pub fn companions_dir() -> PathBuf {
    simbroker_dir().join("companions")
}

fn default_device_set_path() -> PathBuf {
    dirs::home_dir()
        .map(|home| home.join("Library/Developer/SimBroker/DeviceSet"))
        .unwrap_or_else(|| simbroker_dir().join("DeviceSet"))
}

/// Persistent broker configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    /// The `idb_companion` executable.
    pub companion_path: PathBuf,

    /// The `xcrun` executable used for `simctl` calls.
    pub xcrun_path: PathBuf,

    /// Device set that holds every simulator the broker manages.
    pub device_set_path: PathBuf,

    /// Fixed `"<device type>,<runtime>"` spec for new simulators. When unset
    /// the newest installed iOS runtime is used.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub simulator_spec: Option<String>,

    /// How long a companion may take to report its listening address.
    pub startup_timeout_secs: u64,

    /// How long a companion gets to exit after SIGTERM before SIGKILL.
    pub termination_grace_secs: u64,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            companion_path: PathBuf::from("idb_companion"),
            xcrun_path: PathBuf::from("xcrun"),
            device_set_path: default_device_set_path(),
            simulator_spec: None,
            startup_timeout_secs: 60,
            termination_grace_secs: 5,
        }
    }
}

impl BrokerConfig {
    /// Load config from `~/.simbroker/config.json`.
    ///
    /// Returns [`Default`] if the file does not exist or cannot be parsed.
    pub fn load() -> Self {
        Self::load_from(&simbroker_dir().join(CONFIG_FILENAME))
    }

    /// Load config from an explicit path, with the same fallback as [`load`](Self::load).
    pub fn load_from(path: &Path) -> Self {
        std::fs::read_to_string(path)
            .ok()
            .and_then(|s| serde_json::from_str(&s).ok())
            .unwrap_or_default()
    }

    pub fn startup_timeout(&self) -> Duration {
        Duration::from_secs(self.startup_timeout_secs)
    }

    pub fn termination_grace(&self) -> Duration {
        Duration::from_secs(self.termination_grace_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_values() {
        let config = BrokerConfig::default();
        assert_eq!(config.companion_path, PathBuf::from("idb_companion"));
        assert_eq!(config.xcrun_path, PathBuf::from("xcrun"));
        assert!(config.simulator_spec.is_none());
        assert_eq!(config.startup_timeout(), Duration::from_secs(60));
        assert_eq!(config.termination_grace(), Duration::from_secs(5));
    }

    #[test]
    fn roundtrip_serialization() {
        let config = BrokerConfig {
            companion_path: PathBuf::from("/opt/idb/bin/idb_companion"),
            simulator_spec: Some("iPhone 15,iOS 17.0".to_string()),
            startup_timeout_secs: 12,
            ..Default::default()
        };
        let json = serde_json::to_string(&config).unwrap();
        let loaded: BrokerConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn partial_json_keeps_defaults() {
        let loaded: BrokerConfig =
            serde_json::from_str(r#"{"startup_timeout_secs": 5}"#).unwrap();
        assert_eq!(loaded.startup_timeout_secs, 5);
        assert_eq!(loaded.companion_path, PathBuf::from("idb_companion"));
        assert_eq!(loaded.termination_grace_secs, 5);
    }

    #[test]
    fn load_from_missing_file_returns_default() {
        let dir = tempfile::tempdir().unwrap();
        let config = BrokerConfig::load_from(&dir.path().join("nope.json"));
        assert_eq!(config, BrokerConfig::default());
    }

    #[test]
    fn load_from_garbage_returns_default() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(CONFIG_FILENAME);
        std::fs::write(&path, "not json").unwrap();
        assert_eq!(BrokerConfig::load_from(&path), BrokerConfig::default());
    }
}
