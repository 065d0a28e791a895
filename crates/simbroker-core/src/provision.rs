//! Simulator provisioning.
//!
//! A [`SimulatorBackend`] knows how to list, create and boot simulators in a
//! single device set. Two backends exist:
//!
//! - [`ManagerBackend`] drives an external simulator manager executable,
//!   which is required whenever companions are requested.
//! - [`SimctlBackend`] talks to `xcrun simctl` directly and is used for
//!   plain simulator requests without a manager.
//!
//! [`Provisioner`] layers the selection policies on top of a backend: which
//! simulator to hand out for a [`ResourceType`], when to create a new one and
//! when to boot.

use std::ffi::OsStr;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use thiserror::Error;
use tokio::process::Command;
use tracing::{debug, info};

use crate::resource::{ResourceType, SimulatorHandle};
use crate::simctl::{Simctl, SimctlError, SimulatorDevice, SimulatorSpec};

/// Errors raised while provisioning simulators.
#[derive(Error, Debug)]
pub enum ProvisionError {
    /// A `simctl` call failed.
    #[error("simctl error: {0}")]
    Simctl(#[from] SimctlError),

    /// The simulator manager exited unsuccessfully.
    #[error("simulator manager `{command}` failed: {stderr}")]
    ManagerFailed { command: String, stderr: String },

    /// The simulator manager printed something that is not a device list.
    #[error("malformed simulator manager output: {0}")]
    MalformedOutput(#[from] serde_json::Error),

    /// No installed runtime can host an iPhone simulator.
    #[error(
        "no simctl compatible iOS runtime and iPhone device type available; \
         select an Xcode with `xcode-select -s` and install its simulator runtimes"
    )]
    NoCompatibleRuntime,

    /// A configured simulator spec is not `"<device type>,<runtime>"`.
    #[error("invalid simulator spec `{0}`, expected \"<device type>,<runtime>\"")]
    InvalidSpec(String),

    /// The device set stayed empty after creating a simulator.
    #[error("device set {0} is still empty after creating a simulator")]
    EmptyDeviceSet(PathBuf),

    /// The simulator picked for booting did not come up as booted.
    #[error("simulator {0} did not reach the booted state")]
    NotBooted(String),

    /// An I/O error occurred while running an external tool.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Access to the simulators of one device set.
#[async_trait]
pub trait SimulatorBackend: Send + Sync {
    /// The device set every simulator of this backend lives in.
    fn device_set_path(&self) -> &Path;

    /// Lists every simulator in the device set.
    async fn list(&self) -> Result<Vec<SimulatorDevice>, ProvisionError>;

    /// Creates one new simulator in the device set.
    async fn create(&self) -> Result<(), ProvisionError>;

    /// Boots the given simulator. Booting a booted simulator succeeds.
    async fn boot(&self, udid: &str) -> Result<(), ProvisionError>;
}

/// Where the spec of newly created simulators comes from.
#[derive(Debug, Clone)]
struct SpecSource {
    configured: Option<String>,
    simctl: Simctl,
}

impl SpecSource {
    async fn resolve(&self) -> Result<SimulatorSpec, ProvisionError> {
        if let Some(spec) = &self.configured {
            let (device_type, runtime) = spec
                .split_once(',')
                .ok_or_else(|| ProvisionError::InvalidSpec(spec.clone()))?;
            return Ok(SimulatorSpec {
                device_type_name: device_type.trim().to_string(),
                device_type_identifier: device_type.trim().to_string(),
                runtime_name: runtime.trim().to_string(),
                runtime_identifier: runtime.trim().to_string(),
            });
        }

        let runtimes = self.simctl.list_runtimes().await?;
        Simctl::select_spec(&runtimes).ok_or(ProvisionError::NoCompatibleRuntime)
    }
}

// ---------------------------------------------------------------------------
// Simulator manager backend
// ---------------------------------------------------------------------------

/// Drives an external simulator manager executable.
///
/// The manager understands three commands, each scoped with
/// `--device-set-path <set>`:
///
/// - `list --only simulator` prints a JSON array of devices
/// - `create --configuration "<device type>,<runtime>"`
/// - `boot <udid>`
#[derive(Debug, Clone)]
pub struct ManagerBackend {
    program: PathBuf,
    device_set_path: PathBuf,
    spec: SpecSource,
}

impl ManagerBackend {
    pub fn new(
        program: impl Into<PathBuf>,
        device_set_path: impl Into<PathBuf>,
        simctl: Simctl,
        configured_spec: Option<String>,
    ) -> Self {
        Self {
            program: program.into(),
            device_set_path: device_set_path.into(),
            spec: SpecSource {
                configured: configured_spec,
                simctl,
            },
        }
    }

    async fn run(&self, subcommand: &str, extra: &[&OsStr]) -> Result<Vec<u8>, ProvisionError> {
        let mut command = Command::new(&self.program);
        command
            .arg(subcommand)
            .arg("--device-set-path")
            .arg(&self.device_set_path)
            .args(extra);
        debug!(command = ?command, "Running simulator manager");

        let output = command.output().await?;
        if !output.status.success() {
            return Err(ProvisionError::ManagerFailed {
                command: format!("{} {}", self.program.display(), subcommand),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(output.stdout)
    }

    /// Parses the JSON array printed by `list`.
    pub fn parse_managed_simulators(json: &[u8]) -> Result<Vec<SimulatorDevice>, ProvisionError> {
        Ok(serde_json::from_slice(json)?)
    }
}

#[async_trait]
impl SimulatorBackend for ManagerBackend {
    fn device_set_path(&self) -> &Path {
        &self.device_set_path
    }

    async fn list(&self) -> Result<Vec<SimulatorDevice>, ProvisionError> {
        let stdout = self
            .run("list", &[OsStr::new("--only"), OsStr::new("simulator")])
            .await?;
        Self::parse_managed_simulators(&stdout)
    }

    async fn create(&self) -> Result<(), ProvisionError> {
        let spec = self.spec.resolve().await?;
        let configuration = spec.configuration();
        info!(configuration = %configuration, "Creating managed simulator");
        self.run(
            "create",
            &[OsStr::new("--configuration"), OsStr::new(&configuration)],
        )
        .await?;
        Ok(())
    }

    async fn boot(&self, udid: &str) -> Result<(), ProvisionError> {
        info!(udid, "Booting managed simulator");
        self.run("boot", &[OsStr::new(udid)]).await?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// simctl backend
// ---------------------------------------------------------------------------

/// Manages simulators with `xcrun simctl --set <device set>`.
#[derive(Debug, Clone)]
pub struct SimctlBackend {
    simctl: Simctl,
    device_set_path: PathBuf,
    spec: SpecSource,
}

impl SimctlBackend {
    pub fn new(simctl: Simctl, device_set_path: impl Into<PathBuf>, configured_spec: Option<String>) -> Self {
        Self {
            spec: SpecSource {
                configured: configured_spec,
                simctl: simctl.clone(),
            },
            simctl,
            device_set_path: device_set_path.into(),
        }
    }
}

#[async_trait]
impl SimulatorBackend for SimctlBackend {
    fn device_set_path(&self) -> &Path {
        &self.device_set_path
    }

    async fn list(&self) -> Result<Vec<SimulatorDevice>, ProvisionError> {
        std::fs::create_dir_all(&self.device_set_path)?;
        Ok(self.simctl.list_devices(&self.device_set_path).await?)
    }

    async fn create(&self) -> Result<(), ProvisionError> {
        let spec = self.spec.resolve().await?;
        let udid = self
            .simctl
            .create(
                &self.device_set_path,
                &spec.device_type_name,
                &spec.device_type_identifier,
                &spec.runtime_identifier,
            )
            .await?;
        info!(udid = %udid, configuration = %spec.configuration(), "Created simulator");
        Ok(())
    }

    async fn boot(&self, udid: &str) -> Result<(), ProvisionError> {
        info!(udid, "Booting simulator");
        Ok(self.simctl.boot(&self.device_set_path, udid).await?)
    }
}

// ---------------------------------------------------------------------------
// Provisioning policies
// ---------------------------------------------------------------------------

/// Applies the selection policy for each [`ResourceType`] to a backend.
pub struct Provisioner {
    backend: Box<dyn SimulatorBackend>,
}

impl Provisioner {
    pub fn new(backend: Box<dyn SimulatorBackend>) -> Self {
        Self { backend }
    }

    fn handle(&self, device: &SimulatorDevice) -> SimulatorHandle {
        SimulatorHandle {
            udid: device.udid.clone(),
            device_set_path: self.backend.device_set_path().to_path_buf(),
        }
    }

    /// Lists the managed simulators, creating one first if the set is empty.
    pub async fn managed_simulators(&self) -> Result<Vec<SimulatorDevice>, ProvisionError> {
        let simulators = self.backend.list().await?;
        if !simulators.is_empty() {
            return Ok(simulators);
        }

        self.backend.create().await?;
        let simulators = self.backend.list().await?;
        if simulators.is_empty() {
            return Err(ProvisionError::EmptyDeviceSet(
                self.backend.device_set_path().to_path_buf(),
            ));
        }
        Ok(simulators)
    }

    async fn boot_and_confirm(&self, udid: &str) -> Result<SimulatorDevice, ProvisionError> {
        self.backend.boot(udid).await?;
        self.backend
            .list()
            .await?
            .into_iter()
            .find(|d| d.udid == udid && d.is_booted())
            .ok_or_else(|| ProvisionError::NotBooted(udid.to_string()))
    }

    async fn create_shutdown(&self) -> Result<SimulatorDevice, ProvisionError> {
        let before: Vec<String> = self.backend.list().await?.into_iter().map(|d| d.udid).collect();
        self.backend.create().await?;
        self.backend
            .list()
            .await?
            .into_iter()
            .find(|d| !before.contains(&d.udid) && d.is_shutdown())
            .ok_or_else(|| ProvisionError::EmptyDeviceSet(self.backend.device_set_path().to_path_buf()))
    }

    /// Provides exactly one simulator in the state `resource_type` asks for.
    ///
    /// - Unbooted: the first shut down simulator, creating one if none is.
    /// - Booted: the first booted simulator, else the first shut down one
    ///   after booting it, else a newly created and booted one.
    pub async fn prepare_simulator(&self, resource_type: ResourceType) -> Result<SimulatorHandle, ProvisionError> {
        let simulators = self.managed_simulators().await?;

        let device = match resource_type {
            ResourceType::UnbootedSimulator => match simulators.iter().find(|d| d.is_shutdown()) {
                Some(device) => device.clone(),
                None => self.create_shutdown().await?,
            },
            ResourceType::BootedSimulator => {
                if let Some(device) = Simctl::find_booted_device(&simulators) {
                    device.clone()
                } else {
                    let candidate = match simulators.iter().find(|d| d.is_shutdown()) {
                        Some(device) => device.clone(),
                        None => self.create_shutdown().await?,
                    };
                    self.boot_and_confirm(&candidate.udid).await?
                }
            }
        };

        info!(udid = %device.udid, resource_type = %resource_type, "Prepared simulator");
        Ok(self.handle(&device))
    }

    /// Every booted managed simulator; boots one when none is running.
    pub async fn booted_simulators(&self) -> Result<Vec<SimulatorHandle>, ProvisionError> {
        let simulators = self.managed_simulators().await?;
        let booted: Vec<SimulatorHandle> = simulators
            .iter()
            .filter(|d| d.is_booted())
            .map(|d| self.handle(d))
            .collect();

        if !booted.is_empty() {
            return Ok(booted);
        }
        Ok(vec![self.prepare_simulator(ResourceType::BootedSimulator).await?])
    }

    /// Simulators a companion should be launched for, per resource type.
    pub async fn simulators_for_companions(
        &self,
        resource_type: ResourceType,
    ) -> Result<Vec<SimulatorHandle>, ProvisionError> {
        match resource_type {
            ResourceType::BootedSimulator => self.booted_simulators().await,
            ResourceType::UnbootedSimulator => {
                Ok(vec![self.prepare_simulator(ResourceType::UnbootedSimulator).await?])
            }
        }
    }
}
