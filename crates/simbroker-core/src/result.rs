//! The single JSON object a broker invocation writes to stdout.

use std::io::Write;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::resource::SimulatorHandle;
use crate::supervisor::SupervisorHandle;

/// How to reach one allocated resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ResourceDescriptor {
    /// A companion listening for the simulator it controls.
    Companion { socket_address: String },
    /// A bare simulator, when no companion was requested.
    Simulator { udid: String, device_set_path: PathBuf },
}

/// What an invocation allocated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BrokerResult {
    /// The supervisor owning the companions; absent without companions.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pid: Option<i32>,
    pub resources: Vec<ResourceDescriptor>,
}

impl BrokerResult {
    /// Result for a bare simulator.
    pub fn simulator(handle: &SimulatorHandle) -> Self {
        Self {
            pid: None,
            resources: vec![ResourceDescriptor::Simulator {
                udid: handle.udid.clone(),
                device_set_path: handle.device_set_path.clone(),
            }],
        }
    }

    /// Result for the companions a running supervisor owns.
    pub fn companions(supervisor: &SupervisorHandle) -> Self {
        Self {
            pid: Some(supervisor.pid),
            resources: supervisor
                .socket_addresses
                .iter()
                .map(|address| ResourceDescriptor::Companion {
                    socket_address: address.clone(),
                })
                .collect(),
        }
    }

    /// Writes the result as one JSON document and flushes.
    ///
    /// The document is serialized up front so the writer sees a single
    /// complete write or nothing.
    pub fn emit<W: Write>(self, mut writer: W) -> std::io::Result<()> {
        let json = serde_json::to_vec(&self)?;
        writer.write_all(&json)?;
        writer.flush()
    }
}
