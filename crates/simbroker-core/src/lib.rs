//! # simbroker-core
//!
//! Core library for allocating iOS simulators and their `idb_companion`
//! processes on behalf of a build/test orchestrator.
//!
//! A broker invocation provisions one or more simulators, optionally launches
//! a companion per simulator, hands the companions to a detached supervisor
//! process and reports how to reach everything as a single JSON object.
//!
//! ## Modules
//!
//! - [`config`] - Persistent broker configuration and state directories
//! - [`resource`] - Resource types and simulator handles
//! - [`simctl`] - Wrapper around Apple's `xcrun simctl` CLI
//! - [`provision`] - Simulator backends and the provisioning policies
//! - [`companion`] - Launching and terminating companion processes
//! - [`allocation`] - The set of companions owned by one invocation
//! - [`dispatch`] - Resource dispatch from a request to an allocation
//! - [`supervisor`] - Detached supervisor and termination signal handling
//! - [`result`] - The JSON result written to the orchestrator
//!
//! ## External Dependencies
//!
//! - **Xcode** (for `xcrun simctl`) - used when no simulator manager is given
//! - **idb_companion** - exposes simulator control over a domain socket
//!
//! ## Example
//!
//! ```no_run
//! use simbroker_core::config::BrokerConfig;
//! use simbroker_core::dispatch::{Allocation, Broker, ResourceRequest};
//! use simbroker_core::resource::ResourceType;
//! use simbroker_core::result::BrokerResult;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let broker = Broker::new(BrokerConfig::load());
//! let request = ResourceRequest {
//!     resource_type: ResourceType::UnbootedSimulator,
//!     companion: false,
//!     simulator_manager: None,
//! };
//!
//! if let Allocation::Simulator(handle) = broker.allocate(&request).await? {
//!     BrokerResult::simulator(&handle).emit(std::io::stdout().lock())?;
//! }
//! # Ok(())
//! # }
//! ```

pub mod allocation;
pub mod companion;
pub mod config;
pub mod dispatch;
pub mod provision;
pub mod resource;
pub mod result;
pub mod simctl;
pub mod supervisor;
