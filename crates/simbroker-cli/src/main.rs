//! Allocates iOS simulators and idb companions for a test orchestrator.
//!
//! Prints exactly one JSON object on stdout describing what was allocated.
//! Diagnostics go to stderr (`RUST_LOG`, default `warn`).
//!
//! # Usage
//!
//! ```bash
//! # A shut down simulator, nothing else
//! simbroker --type ios_unbooted_simulator --no-companion
//! # => {"resources":[{"udid":"...","device_set_path":"..."}]}
//!
//! # A companion for every booted managed simulator
//! simbroker --type ios_booted_simulator --simulator-manager ./simctl-manager
//! # => {"pid":4242,"resources":[{"socket_address":"..."}]}
//!
//! # Release the companions again
//! kill -TERM 4242
//! ```

use std::io::Write;
use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, ValueEnum};
use simbroker_core::config::BrokerConfig;
use simbroker_core::dispatch::{Allocation, Broker, BrokerError, ResourceRequest};
use simbroker_core::resource::ResourceType;
use simbroker_core::result::BrokerResult;
use simbroker_core::supervisor::spawn_supervisor;
use tracing::{debug, warn};
use tracing_subscriber::EnvFilter;

/// Allocates iOS simulators and idb companions.
#[derive(Parser)]
#[command(name = "simbroker")]
#[command(about = "Allocate iOS simulators and idb companions, report them as JSON")]
#[command(version)]
struct Cli {
    /// Kind of resource to allocate
    #[arg(long = "type", value_enum)]
    resource_type: ResourceTypeArg,

    /// Simulator manager executable (required unless --no-companion)
    #[arg(long, env = "SIMBROKER_SIMULATOR_MANAGER")]
    simulator_manager: Option<PathBuf>,

    /// Return the simulator itself instead of starting companions
    #[arg(long)]
    no_companion: bool,

    /// idb_companion executable
    #[arg(long, env = "SIMBROKER_COMPANION")]
    companion_path: Option<PathBuf>,

    /// xcrun executable used for simctl
    #[arg(long, env = "SIMBROKER_XCRUN")]
    xcrun_path: Option<PathBuf>,

    /// Device set holding the managed simulators
    #[arg(long, env = "SIMBROKER_DEVICE_SET")]
    device_set_path: Option<PathBuf>,

    /// Seconds a companion may take to report its address
    #[arg(long, env = "SIMBROKER_STARTUP_TIMEOUT")]
    startup_timeout: Option<u64>,

    /// Seconds a companion gets between SIGTERM and SIGKILL
    #[arg(long, env = "SIMBROKER_TERMINATION_GRACE")]
    termination_grace: Option<u64>,
}

#[derive(Clone, Copy, PartialEq, Eq, ValueEnum)]
enum ResourceTypeArg {
    #[value(name = "ios_unbooted_simulator")]
    IosUnbootedSimulator,
    #[value(name = "ios_booted_simulator")]
    IosBootedSimulator,
}

impl From<ResourceTypeArg> for ResourceType {
    fn from(arg: ResourceTypeArg) -> Self {
        match arg {
            ResourceTypeArg::IosUnbootedSimulator => ResourceType::UnbootedSimulator,
            ResourceTypeArg::IosBootedSimulator => ResourceType::BootedSimulator,
        }
    }
}

impl Cli {
    /// The persisted configuration with flags and env applied on top.
    fn config(&self) -> BrokerConfig {
        let mut config = BrokerConfig::load();
        if let Some(path) = &self.companion_path {
            config.companion_path = path.clone();
        }
        if let Some(path) = &self.xcrun_path {
            config.xcrun_path = path.clone();
        }
        if let Some(path) = &self.device_set_path {
            config.device_set_path = path.clone();
        }
        if let Some(secs) = self.startup_timeout {
            config.startup_timeout_secs = secs;
        }
        if let Some(secs) = self.termination_grace {
            config.termination_grace_secs = secs;
        }
        config
    }

    fn request(&self) -> ResourceRequest {
        ResourceRequest {
            resource_type: self.resource_type.into(),
            companion: !self.no_companion,
            simulator_manager: self.simulator_manager.clone(),
        }
    }
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {}", e);
            exit_code(&e)
        }
    }
}

fn exit_code(error: &BrokerError) -> ExitCode {
    match error {
        BrokerError::Configuration(_) => ExitCode::from(2),
        BrokerError::Provisioning(_) => ExitCode::from(3),
        BrokerError::Launch(_) => ExitCode::from(4),
        BrokerError::Supervisor(_) | BrokerError::Io(_) => ExitCode::from(1),
    }
}

fn run(cli: Cli) -> Result<(), BrokerError> {
    let broker = Broker::new(cli.config());
    let request = cli.request();
    debug!(?request, config = ?broker.config(), "Parsed invocation");

    // The runtime must be gone before the supervisor is forked.
    let allocation = {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;
        runtime.block_on(broker.allocate(&request))?
    };

    match allocation {
        Allocation::Simulator(handle) => Ok(emit(BrokerResult::simulator(&handle))?),
        Allocation::Companions(companions) => {
            let supervisor = spawn_supervisor(companions)?;
            if let Err(e) = emit(BrokerResult::companions(&supervisor)) {
                // Without the result nobody can release the companions.
                warn!(pid = supervisor.pid, "Result not delivered, stopping supervisor");
                if let Err(stop) = supervisor.shutdown() {
                    warn!(pid = supervisor.pid, error = %stop, "Could not stop supervisor");
                }
                return Err(e.into());
            }
            Ok(())
        }
    }
}

fn emit(result: BrokerResult) -> std::io::Result<()> {
    let mut stdout = std::io::stdout().lock();
    result.emit(&mut stdout)?;
    writeln!(stdout)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn type_values_match_resource_names() {
        for arg in ResourceTypeArg::value_variants() {
            let value = arg.to_possible_value().unwrap();
            assert_eq!(value.get_name(), ResourceType::from(*arg).as_str());
        }
    }
}
