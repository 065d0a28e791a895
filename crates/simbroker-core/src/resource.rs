//! Resource types requested by the orchestrator and the simulator handles
//! produced for them.

use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// The category of simulator an invocation asks for.
///
/// Selects the provisioning policy and whether the simulator must be booted
/// before its companion is started.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ResourceType {
    #[serde(rename = "ios_unbooted_simulator")]
    UnbootedSimulator,
    #[serde(rename = "ios_booted_simulator")]
    BootedSimulator,
}

impl ResourceType {
    /// The name used on the command line and in logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceType::UnbootedSimulator => "ios_unbooted_simulator",
            ResourceType::BootedSimulator => "ios_booted_simulator",
        }
    }
}

impl fmt::Display for ResourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One provisioned simulator instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SimulatorHandle {
    /// The simulator UDID.
    pub udid: String,
    /// The device set the simulator lives in.
    pub device_set_path: PathBuf,
}
