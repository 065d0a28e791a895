//! Interface to Apple's `xcrun simctl` command-line tool.
//!
//! This module wraps the handful of `simctl` subcommands the broker needs:
//! listing the devices of a device set, listing installed runtimes, creating
//! a simulator and booting it. Every device command is scoped to an explicit
//! device set with `--set`, so the broker never touches the user's default
//! simulators.
//!
//! # Requirements
//!
//! Xcode must be installed for `xcrun simctl` to be available.
//!
//! # Example
//!
//! ```no_run
//! use std::path::Path;
//! use simbroker_core::simctl::Simctl;
//!
//! # async fn example() -> Result<(), simbroker_core::simctl::SimctlError> {
//! let simctl = Simctl::new("xcrun");
//! let set = Path::new("/tmp/device-set");
//! for device in simctl.list_devices(set).await? {
//!     println!("{}: {} ({:?})", device.name, device.udid, device.state);
//! }
//! # Ok(())
//! # }
//! ```

use std::ffi::OsStr;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::process::Command;
use tracing::debug;

/// Errors that can occur when interacting with simctl.
#[derive(Error, Debug)]
pub enum SimctlError {
    /// A simctl command failed to execute successfully.
    #[error("Command execution failed: {0}")]
    CommandFailed(String),

    /// Failed to parse JSON output from simctl.
    #[error("JSON parse error: {0}")]
    JsonParse(#[from] serde_json::Error),

    /// An I/O error occurred while executing the command.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Lifecycle state of a simulator as reported by simctl or a simulator manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SimulatorState {
    #[serde(alias = "booted")]
    Booted,
    #[serde(alias = "shutdown")]
    Shutdown,
    /// Transitional or unknown states ("Booting", "Shutting Down", ...).
    #[serde(other)]
    Other,
}

/// Represents an iOS Simulator device.
///
/// Matches the device objects of `xcrun simctl list devices -j` and the
/// entries a simulator manager prints for `list`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimulatorDevice {
    /// The unique device identifier (UDID) for this simulator.
    pub udid: String,

    /// The human-readable name of the device (e.g., "iPhone 15 Pro").
    pub name: String,

    /// The current state of the device.
    pub state: SimulatorState,

    /// The device type identifier (e.g., "com.apple.CoreSimulator.SimDeviceType.iPhone-15-Pro").
    #[serde(rename = "deviceTypeIdentifier", default)]
    pub device_type: Option<String>,

    /// OS version, reported by simulator managers.
    #[serde(default)]
    pub os_version: Option<String>,
}

impl SimulatorDevice {
    pub fn is_booted(&self) -> bool {
        self.state == SimulatorState::Booted
    }

    pub fn is_shutdown(&self) -> bool {
        self.state == SimulatorState::Shutdown
    }
}

#[derive(Debug, Deserialize)]
struct DeviceList {
    devices: std::collections::HashMap<String, Vec<SimulatorDevice>>,
}

/// A device type a runtime can host.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SupportedDeviceType {
    pub identifier: String,
    pub name: String,
    #[serde(rename = "productFamily", default)]
    pub product_family: Option<String>,
}

/// An installed simulator runtime from `xcrun simctl list runtimes -j`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimulatorRuntime {
    pub identifier: String,
    pub version: String,
    pub name: String,
    #[serde(rename = "isAvailable", default = "available_by_default")]
    pub is_available: bool,
    #[serde(default)]
    pub platform: Option<String>,
    #[serde(rename = "supportedDeviceTypes", default)]
    pub supported_device_types: Vec<SupportedDeviceType>,
}

fn available_by_default() -> bool {
    true
}

impl SimulatorRuntime {
    fn is_ios(&self) -> bool {
        match &self.platform {
            Some(platform) => platform == "iOS",
            None => self.name.starts_with("iOS"),
        }
    }

    fn version_key(&self) -> Vec<u32> {
        self.version
            .split('.')
            .map(|part| part.parse().unwrap_or(0))
            .collect()
    }
}

#[derive(Debug, Deserialize)]
struct RuntimeList {
    runtimes: Vec<SimulatorRuntime>,
}

/// A device type + runtime pair new simulators are created from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SimulatorSpec {
    pub device_type_name: String,
    pub device_type_identifier: String,
    pub runtime_name: String,
    pub runtime_identifier: String,
}

impl SimulatorSpec {
    /// The `"<device type>,<runtime>"` form simulator managers accept.
    pub fn configuration(&self) -> String {
        format!("{},{}", self.device_type_name, self.runtime_name)
    }
}

/// Wrapper for `xcrun simctl` commands.
#[derive(Debug, Clone)]
pub struct Simctl {
    program: PathBuf,
}

impl Simctl {
    /// Creates a wrapper that runs `<program> simctl ...`.
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }

    async fn run<I, S>(&self, args: I) -> Result<Vec<u8>, SimctlError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        let mut command = Command::new(&self.program);
        command.arg("simctl").args(args);
        debug!(command = ?command, "Running simctl");

        let output = command.output().await?;
        if !output.status.success() {
            return Err(SimctlError::CommandFailed(
                String::from_utf8_lossy(&output.stderr).to_string(),
            ));
        }
        Ok(output.stdout)
    }

    /// Lists the devices of a device set.
    ///
    /// Queries `xcrun simctl --set <set> list devices -j` and flattens the
    /// per-runtime groups into one list.
    ///
    /// # Errors
    ///
    /// - [`SimctlError::Io`] if the command fails to execute
    /// - [`SimctlError::CommandFailed`] if simctl returns a non-zero exit code
    /// - [`SimctlError::JsonParse`] if the output cannot be parsed as JSON
    pub async fn list_devices(&self, device_set: &Path) -> Result<Vec<SimulatorDevice>, SimctlError> {
        let stdout = self
            .run([
                OsStr::new("--set"),
                device_set.as_os_str(),
                OsStr::new("list"),
                OsStr::new("devices"),
                OsStr::new("-j"),
            ])
            .await?;
        Self::parse_device_list(&stdout)
    }

    /// Lists installed simulator runtimes.
    pub async fn list_runtimes(&self) -> Result<Vec<SimulatorRuntime>, SimctlError> {
        let stdout = self.run(["list", "runtimes", "-j"]).await?;
        Self::parse_runtime_list(&stdout)
    }

    /// Creates a simulator in the device set and returns its UDID.
    pub async fn create(
        &self,
        device_set: &Path,
        name: &str,
        device_type: &str,
        runtime: &str,
    ) -> Result<String, SimctlError> {
        let stdout = self
            .run([
                OsStr::new("--set"),
                device_set.as_os_str(),
                OsStr::new("create"),
                OsStr::new(name),
                OsStr::new(device_type),
                OsStr::new(runtime),
            ])
            .await?;
        Ok(String::from_utf8_lossy(&stdout).trim().to_string())
    }

    /// Boots a simulator device.
    ///
    /// If the simulator is already booted, this method returns successfully
    /// (the "already booted" state is not treated as an error).
    ///
    /// # Errors
    ///
    /// - [`SimctlError::Io`] if the command fails to execute
    /// - [`SimctlError::CommandFailed`] if simctl returns an error (except for "already booted")
    pub async fn boot(&self, device_set: &Path, udid: &str) -> Result<(), SimctlError> {
        let result = self
            .run([
                OsStr::new("--set"),
                device_set.as_os_str(),
                OsStr::new("boot"),
                OsStr::new(udid),
            ])
            .await;

        match result {
            Ok(_) => Ok(()),
            // Already booted is not an error
            Err(SimctlError::CommandFailed(stderr)) if stderr.contains("current state: Booted") => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Parses device list JSON into a flat vector of devices.
    ///
    /// # Errors
    ///
    /// - [`SimctlError::JsonParse`] if the JSON is invalid or has unexpected structure
    pub fn parse_device_list(json: &[u8]) -> Result<Vec<SimulatorDevice>, SimctlError> {
        let device_list: DeviceList = serde_json::from_slice(json)?;
        let devices: Vec<SimulatorDevice> = device_list.devices.into_values().flatten().collect();
        Ok(devices)
    }

    /// Parses `simctl list runtimes -j` output.
    pub fn parse_runtime_list(json: &[u8]) -> Result<Vec<SimulatorRuntime>, SimctlError> {
        let runtime_list: RuntimeList = serde_json::from_slice(json)?;
        Ok(runtime_list.runtimes)
    }

    /// Picks the spec for new simulators: the newest available iOS runtime
    /// that supports an iPhone, paired with the newest such iPhone.
    pub fn select_spec(runtimes: &[SimulatorRuntime]) -> Option<SimulatorSpec> {
        let mut candidates: Vec<&SimulatorRuntime> = runtimes
            .iter()
            .filter(|r| r.is_available && r.is_ios())
            .collect();
        candidates.sort_by_key(|r| std::cmp::Reverse(r.version_key()));

        candidates.into_iter().find_map(|runtime| {
            runtime
                .supported_device_types
                .iter()
                .filter(|t| t.product_family.as_deref() == Some("iPhone"))
                .last()
                .map(|device_type| SimulatorSpec {
                    device_type_name: device_type.name.clone(),
                    device_type_identifier: device_type.identifier.clone(),
                    runtime_name: runtime.name.clone(),
                    runtime_identifier: runtime.identifier.clone(),
                })
        })
    }

    /// Finds the first booted device in a list.
    pub fn find_booted_device(devices: &[SimulatorDevice]) -> Option<&SimulatorDevice> {
        devices.iter().find(|d| d.is_booted())
    }
}
