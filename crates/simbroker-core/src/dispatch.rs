//! Resource dispatch: from a request to an allocation.
//!
//! [`Broker::allocate`] chooses one of three paths:
//!
//! 1. no companion: provision exactly one simulator and return it
//! 2. companion + booted simulator: provision booted simulators, launch a
//!    companion for each
//! 3. companion + unbooted simulator: provision an unbooted simulator,
//!    launch a companion for it
//!
//! Companion paths need a simulator manager; without one the request fails
//! with [`BrokerError::Configuration`] before any process is started.

use std::path::PathBuf;

use futures::future::join_all;
use thiserror::Error;
use tracing::{error, info};

use crate::allocation::AllocationContext;
use crate::companion::{CompanionLauncher, CompanionLauncherConfig, LaunchError};
use crate::config::{companions_dir, BrokerConfig};
use crate::provision::{ManagerBackend, ProvisionError, Provisioner, SimctlBackend, SimulatorBackend};
use crate::resource::{ResourceType, SimulatorHandle};
use crate::simctl::Simctl;
use crate::supervisor::SupervisorError;

/// Errors that end a broker invocation.
#[derive(Error, Debug)]
pub enum BrokerError {
    /// A required tool was not configured.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Simulators could not be provisioned.
    #[error("provisioning error: {0}")]
    Provisioning(#[from] ProvisionError),

    /// A companion could not be launched.
    #[error("launch error: {0}")]
    Launch(#[from] LaunchError),

    /// The supervisor could not be started.
    #[error("supervisor error: {0}")]
    Supervisor(#[from] SupervisorError),

    /// An I/O error occurred.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// What the orchestrator asked for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceRequest {
    pub resource_type: ResourceType,
    /// Whether a companion should be started per simulator.
    pub companion: bool,
    /// The simulator manager executable, required with companions.
    pub simulator_manager: Option<PathBuf>,
}

/// The outcome of a successful dispatch.
#[derive(Debug)]
pub enum Allocation {
    /// A bare simulator; nothing needs supervising.
    Simulator(SimulatorHandle),
    /// Running companions awaiting a supervisor.
    Companions(AllocationContext),
}

/// Allocates resources according to a [`BrokerConfig`].
pub struct Broker {
    config: BrokerConfig,
}

impl Broker {
    pub fn new(config: BrokerConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &BrokerConfig {
        &self.config
    }

    /// Picks the simulator backend for a request.
    ///
    /// # Errors
    ///
    /// [`BrokerError::Configuration`] if companions are requested without a
    /// simulator manager.
    pub fn backend_for(&self, request: &ResourceRequest) -> Result<Box<dyn SimulatorBackend>, BrokerError> {
        let simctl = Simctl::new(&self.config.xcrun_path);
        let spec = self.config.simulator_spec.clone();
        let device_set = self.config.device_set_path.clone();

        match (&request.simulator_manager, request.companion) {
            (Some(manager), _) => Ok(Box::new(ManagerBackend::new(manager, device_set, simctl, spec))),
            (None, false) => Ok(Box::new(SimctlBackend::new(simctl, device_set, spec))),
            (None, true) => Err(BrokerError::Configuration(
                "simulator manager not specified".to_string(),
            )),
        }
    }

    pub fn launcher(&self) -> CompanionLauncher {
        CompanionLauncher::new(CompanionLauncherConfig {
            program: self.config.companion_path.clone(),
            work_dir: companions_dir(),
            startup_timeout: self.config.startup_timeout(),
            termination_grace: self.config.termination_grace(),
        })
    }

    /// Provisions what `request` asks for.
    pub async fn allocate(&self, request: &ResourceRequest) -> Result<Allocation, BrokerError> {
        let backend = self.backend_for(request)?;
        info!(
            resource_type = %request.resource_type,
            companion = request.companion,
            "Allocating resources"
        );
        allocate_with(
            request.resource_type,
            request.companion,
            &Provisioner::new(backend),
            &self.launcher(),
        )
        .await
    }
}

/// Dispatches on the resource type with explicit collaborators.
pub async fn allocate_with(
    resource_type: ResourceType,
    companion: bool,
    provisioner: &Provisioner,
    launcher: &CompanionLauncher,
) -> Result<Allocation, BrokerError> {
    if !companion {
        let simulator = provisioner.prepare_simulator(resource_type).await?;
        return Ok(Allocation::Simulator(simulator));
    }

    let simulators = provisioner.simulators_for_companions(resource_type).await?;
    let ctx = launch_companions(&simulators, launcher).await?;
    Ok(Allocation::Companions(ctx))
}

/// Launches one companion per simulator, concurrently.
///
/// If any launch fails, every companion that did start is terminated and
/// the first error is returned.
pub async fn launch_companions(
    simulators: &[SimulatorHandle],
    launcher: &CompanionLauncher,
) -> Result<AllocationContext, LaunchError> {
    let mut ctx = AllocationContext::new(launcher.config().termination_grace);
    let mut first_error = None;

    let results = join_all(simulators.iter().map(|simulator| launcher.launch(simulator))).await;
    for result in results {
        match result {
            Ok(companion) => ctx.register(companion),
            Err(e) => {
                error!(error = %e, "Companion launch failed");
                first_error.get_or_insert(e);
            }
        }
    }

    match first_error {
        Some(e) => {
            ctx.abort();
            Err(e)
        }
        None => Ok(ctx),
    }
}
