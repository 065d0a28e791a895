//! Lifecycle management for `idb_companion` processes.
//!
//! A companion exposes control of one simulator over a gRPC domain socket.
//! [`CompanionLauncher`] starts one per simulator and waits for it to report
//! where it listens; [`CompanionProcess`] owns the running process until it
//! is terminated.
//!
//! # Startup sequence
//!
//! 1. **Spawn** `idb_companion --device-set-path <set> --udid <udid> --only
//!    simulator --grpc-domain-sock <sock>` with stdout redirected to a control
//!    file and stderr to a diagnostics log
//! 2. **Wait for ready** by polling the control file for the JSON line the
//!    companion prints once it listens
//! 3. **Give up** after [`CompanionLauncherConfig::startup_timeout`], or as
//!    soon as the process exits, terminating it before returning the error
//!
//! # Limitations
//!
//! Companions outlive the process that spawned them, so the supervisor
//! that terminates them is usually not their parent and cannot reserve
//! their PIDs. A companion that died on its own long before shutdown may
//! have its PID reused by an unrelated process, which would then receive
//! the SIGTERM. Socket paths are kept short (`<work dir>/<8 hex>.sock`) but
//! still have to fit the platform's `sun_path` limit (104 bytes on macOS),
//! which bounds how deep the work directory may be.
//!
//! # Example
//!
//! ```no_run
//! use std::path::PathBuf;
//! use simbroker_core::companion::{CompanionLauncher, CompanionLauncherConfig};
//! use simbroker_core::resource::SimulatorHandle;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let launcher = CompanionLauncher::new(CompanionLauncherConfig::default());
//! let simulator = SimulatorHandle {
//!     udid: "DEVICE-UDID".into(),
//!     device_set_path: PathBuf::from("/tmp/device-set"),
//! };
//! let mut companion = launcher.launch(&simulator).await?;
//! println!("companion listening on {}", companion.socket_address());
//! companion.terminate(std::time::Duration::from_secs(5))?;
//! # Ok(())
//! # }
//! ```

use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::time::{Duration, Instant};

use nix::errno::Errno;
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::companions_dir;
use crate::resource::SimulatorHandle;

/// How often the control file and process state are checked during startup.
const STARTUP_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// How often a terminating companion is checked for exit.
const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(50);

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Configuration for launching companions.
#[derive(Debug, Clone)]
pub struct CompanionLauncherConfig {
    /// The companion executable.
    pub program: PathBuf,
    /// Directory for control files, diagnostics logs and domain sockets.
    pub work_dir: PathBuf,
    /// Maximum time to wait for the companion to report its address.
    pub startup_timeout: Duration,
    /// Grace period between SIGTERM and SIGKILL when a launch is abandoned.
    pub termination_grace: Duration,
}

impl Default for CompanionLauncherConfig {
    fn default() -> Self {
        Self {
            program: PathBuf::from("idb_companion"),
            work_dir: companions_dir(),
            startup_timeout: Duration::from_secs(60),
            termination_grace: Duration::from_secs(5),
        }
    }
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Errors raised while launching a companion.
#[derive(Error, Debug)]
pub enum LaunchError {
    /// The companion executable could not be started.
    #[error("failed to spawn companion `{program}`: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    /// The companion did not report a listening address in time.
    #[error("companion for {udid} did not report a listening address within {timeout:?}")]
    StartupTimeout { udid: String, timeout: Duration },

    /// The companion exited before reporting a listening address.
    #[error("companion for {udid} exited ({status}) before reporting an address: {diagnostics}")]
    Exited {
        udid: String,
        status: ExitStatus,
        diagnostics: String,
    },

    /// An I/O error occurred while preparing or watching the companion.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// A companion could not be signalled during cleanup.
#[derive(Error, Debug)]
#[error("failed to signal companion {pid}: {source}")]
pub struct CleanupError {
    pub pid: u32,
    #[source]
    pub source: Errno,
}

// ---------------------------------------------------------------------------
// Address report
// ---------------------------------------------------------------------------

/// The line a companion prints once it is listening.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum CompanionReport {
    DomainSocket { grpc_path: String },
    Tcp { grpc_port: u16 },
}

impl CompanionReport {
    fn socket_address(self) -> String {
        match self {
            CompanionReport::DomainSocket { grpc_path } => grpc_path,
            CompanionReport::Tcp { grpc_port } => format!("localhost:{grpc_port}"),
        }
    }
}

/// Extracts the listening address from companion stdout.
///
/// Returns the address of the first complete line that parses as a report,
/// or `None` while the companion has not printed one yet.
pub fn parse_listening_address(output: &str) -> Option<String> {
    output
        .lines()
        .filter_map(|line| serde_json::from_str::<CompanionReport>(line.trim()).ok())
        .map(CompanionReport::socket_address)
        .next()
}

// ---------------------------------------------------------------------------
// CompanionProcess
// ---------------------------------------------------------------------------

/// A running companion and everything it holds on disk.
///
/// Dropping a `CompanionProcess` does not kill the process; ownership is
/// expected to end in [`terminate`](Self::terminate) or, for the process that
/// handed its companions to the supervisor, in [`release`](Self::release).
#[derive(Debug)]
pub struct CompanionProcess {
    udid: String,
    process: Child,
    socket_address: String,
    error_stream: Option<File>,
    control_file: PathBuf,
    socket_path: PathBuf,
    sigterm_sent: bool,
    terminated: bool,
}

impl CompanionProcess {
    pub fn udid(&self) -> &str {
        &self.udid
    }

    pub fn pid(&self) -> u32 {
        self.process.id()
    }

    /// The address other tools use to reach this companion.
    pub fn socket_address(&self) -> &str {
        &self.socket_address
    }

    /// Readable handle on the companion's diagnostics, until released.
    pub fn error_stream(&mut self) -> Option<&mut File> {
        self.error_stream.as_mut()
    }

    /// Whether the process still exists.
    ///
    /// Processes spawned by this process are reaped; for inherited ones
    /// (the supervisor is not their parent) existence is checked with signal 0.
    pub fn is_running(&mut self) -> bool {
        match self.process.try_wait() {
            Ok(Some(_)) => false,
            Ok(None) => true,
            Err(_) => signal::kill(self.raw_pid(), None).is_ok(),
        }
    }

    fn raw_pid(&self) -> Pid {
        Pid::from_raw(self.process.id() as i32)
    }

    /// Last non-empty line of the diagnostics written so far.
    fn last_diagnostic_line(&mut self) -> String {
        let mut buf = String::new();
        if let Some(stream) = self.error_stream.as_mut() {
            let _ = stream.read_to_string(&mut buf);
        }
        buf.lines()
            .rev()
            .map(str::trim)
            .find(|line| !line.is_empty())
            .unwrap_or("")
            .to_string()
    }

    /// Closes the diagnostics handle without touching the process.
    ///
    /// Used by the originating process after hand-off so that only the
    /// supervisor keeps descriptors to the companion.
    pub fn release(mut self) {
        self.error_stream.take();
    }

    /// Terminates the companion and releases its socket and control file.
    ///
    /// Sends SIGTERM, waits up to `grace` for the process to exit and then
    /// sends SIGKILL. Calling this again after it returned is a no-op. A
    /// process that is already gone yields a [`CleanupError`], but its files
    /// are released all the same.
    pub fn terminate(&mut self, grace: Duration) -> Result<(), CleanupError> {
        let signalled = self.request_termination();
        let finished = self.finish_termination(Instant::now() + grace);
        signalled.and(finished)
    }

    /// Sends SIGTERM unless the process already exited or was signalled.
    pub(crate) fn request_termination(&mut self) -> Result<(), CleanupError> {
        if self.terminated || self.sigterm_sent {
            return Ok(());
        }
        if let Ok(Some(status)) = self.process.try_wait() {
            debug!(udid = %self.udid, pid = self.pid(), %status, "Companion already exited");
            return Ok(());
        }

        signal::kill(self.raw_pid(), Signal::SIGTERM).map_err(|source| CleanupError {
            pid: self.pid(),
            source,
        })?;
        self.sigterm_sent = true;
        Ok(())
    }

    /// Waits until `deadline` for a signalled companion to exit, kills it
    /// if it is still running and releases its files.
    pub(crate) fn finish_termination(&mut self, deadline: Instant) -> Result<(), CleanupError> {
        if self.terminated {
            return Ok(());
        }
        self.terminated = true;

        let result = if self.sigterm_sent {
            self.wait_or_kill(deadline)
        } else {
            Ok(())
        };

        self.error_stream.take();
        let _ = std::fs::remove_file(&self.socket_path);
        let _ = std::fs::remove_file(&self.control_file);
        result
    }

    fn wait_or_kill(&mut self, deadline: Instant) -> Result<(), CleanupError> {
        loop {
            if !self.is_running() {
                info!(udid = %self.udid, pid = self.pid(), "Companion terminated");
                return Ok(());
            }
            if Instant::now() >= deadline {
                break;
            }
            std::thread::sleep(EXIT_POLL_INTERVAL);
        }

        warn!(udid = %self.udid, pid = self.pid(), "Companion ignored SIGTERM, killing");
        match signal::kill(self.raw_pid(), Signal::SIGKILL) {
            Ok(()) | Err(Errno::ESRCH) => {}
            Err(source) => {
                return Err(CleanupError {
                    pid: self.pid(),
                    source,
                })
            }
        }
        // Reaps when this process is the parent, fails fast with ECHILD otherwise.
        let _ = self.process.wait();
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// CompanionLauncher
// ---------------------------------------------------------------------------

/// Starts companions for provisioned simulators.
pub struct CompanionLauncher {
    config: CompanionLauncherConfig,
}

impl CompanionLauncher {
    pub fn new(config: CompanionLauncherConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &CompanionLauncherConfig {
        &self.config
    }

    /// Builds the companion command line for a simulator.
    pub fn command(&self, simulator: &SimulatorHandle, socket_path: &Path) -> Command {
        let mut command = Command::new(&self.config.program);
        command
            .arg("--device-set-path")
            .arg(&simulator.device_set_path)
            .arg("--udid")
            .arg(&simulator.udid)
            .arg("--only")
            .arg("simulator")
            .arg("--grpc-domain-sock")
            .arg(socket_path);
        command
    }

    /// Starts a companion for `simulator` and waits until it listens.
    ///
    /// # Errors
    ///
    /// - [`LaunchError::Spawn`] if the companion executable cannot be started
    /// - [`LaunchError::Exited`] if it exits before reporting an address
    /// - [`LaunchError::StartupTimeout`] if no address appears in time
    /// - [`LaunchError::Io`] if the control files cannot be created
    ///
    /// On every error after the spawn the companion has been terminated.
    pub async fn launch(&self, simulator: &SimulatorHandle) -> Result<CompanionProcess, LaunchError> {
        std::fs::create_dir_all(&self.config.work_dir)?;

        let tag = uuid::Uuid::new_v4().simple().to_string()[..8].to_string();
        let socket_path = self.config.work_dir.join(format!("{tag}.sock"));
        let control_file = self.config.work_dir.join(format!("{}-{tag}.out", simulator.udid));
        let diagnostics = self.config.work_dir.join(format!("{}-{tag}.err", simulator.udid));

        let stdout = File::create(&control_file)?;
        let stderr = File::create(&diagnostics)?;
        let error_stream = File::open(&diagnostics)?;

        let process = self
            .command(simulator, &socket_path)
            .stdin(Stdio::null())
            .stdout(stdout)
            .stderr(stderr)
            .spawn()
            .map_err(|source| LaunchError::Spawn {
                program: self.config.program.display().to_string(),
                source,
            })?;
        info!(udid = %simulator.udid, pid = process.id(), "Spawned companion");

        let mut companion = CompanionProcess {
            udid: simulator.udid.clone(),
            process,
            socket_address: String::new(),
            error_stream: Some(error_stream),
            control_file,
            socket_path,
            sigterm_sent: false,
            terminated: false,
        };

        match self.wait_for_address(&mut companion).await {
            Ok(address) => {
                info!(udid = %companion.udid, pid = companion.pid(), address = %address, "Companion ready");
                companion.socket_address = address;
                Ok(companion)
            }
            Err(e) => {
                if let Err(cleanup) = companion.terminate(self.config.termination_grace) {
                    debug!(error = %cleanup, "Abandoned companion was already gone");
                }
                Err(e)
            }
        }
    }

    /// Polls the control file until the companion reports its address.
    async fn wait_for_address(&self, companion: &mut CompanionProcess) -> Result<String, LaunchError> {
        let deadline = tokio::time::Instant::now() + self.config.startup_timeout;

        loop {
            let output = std::fs::read(&companion.control_file)?;
            if let Some(address) = parse_listening_address(&String::from_utf8_lossy(&output)) {
                return Ok(address);
            }

            if let Some(status) = companion.process.try_wait()? {
                return Err(LaunchError::Exited {
                    udid: companion.udid.clone(),
                    status,
                    diagnostics: companion.last_diagnostic_line(),
                });
            }

            if tokio::time::Instant::now() >= deadline {
                return Err(LaunchError::StartupTimeout {
                    udid: companion.udid.clone(),
                    timeout: self.config.startup_timeout,
                });
            }

            tokio::time::sleep(STARTUP_POLL_INTERVAL).await;
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
pub(crate) mod testing {
    use std::os::unix::fs::PermissionsExt;
    use std::path::{Path, PathBuf};
    use std::time::Duration;

    use super::CompanionLauncherConfig;
    use crate::resource::SimulatorHandle;

    /// A companion that reports its socket, records its pid and idles.
    ///
    /// Simulators whose UDID starts with `BAD` make it fail on startup, ones
    /// starting with `SILENT` make it idle without reporting, `NOISY` ones
    /// print a non-UTF-8 banner first and `STUBBORN` ones ignore SIGTERM.
    pub const FAKE_COMPANION: &str = r#"#!/bin/sh
udid=""
sock=""
while [ $# -gt 0 ]; do
  case "$1" in
    --udid) udid="$2"; shift ;;
    --grpc-domain-sock) sock="$2"; shift ;;
  esac
  shift
done
dir=$(dirname "$sock")
echo $$ > "$dir/$udid.pid"
case "$udid" in
  BAD*) echo "simulator $udid is not available" >&2; exit 3 ;;
  SILENT*) exec sleep 300 ;;
  NOISY*) printf 'banner \377\376\n' ;;
  STUBBORN*) trap '' TERM ;;
esac
echo "starting companion for $udid" >&2
echo "{\"grpc_path\":\"$sock\"}"
exec sleep 300
"#;

    pub fn write_script(dir: &Path, name: &str, body: &str) -> PathBuf {
        let path = dir.join(name);
        std::fs::write(&path, body).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    pub fn launcher_config(dir: &Path) -> CompanionLauncherConfig {
        CompanionLauncherConfig {
            program: write_script(dir, "fake_companion.sh", FAKE_COMPANION),
            work_dir: dir.join("companions"),
            startup_timeout: Duration::from_secs(10),
            termination_grace: Duration::from_secs(2),
        }
    }

    pub fn simulator(udid: &str) -> SimulatorHandle {
        SimulatorHandle {
            udid: udid.to_string(),
            device_set_path: PathBuf::from("/tmp/fake-device-set"),
        }
    }

    pub fn recorded_pid(config: &CompanionLauncherConfig, udid: &str) -> i32 {
        std::fs::read_to_string(config.work_dir.join(format!("{udid}.pid")))
            .unwrap()
            .trim()
            .parse()
            .unwrap()
    }

    pub fn pid_exists(pid: i32) -> bool {
        nix::sys::signal::kill(nix::unistd::Pid::from_raw(pid), None).is_ok()
    }
}
