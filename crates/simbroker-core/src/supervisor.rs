//! The detached supervisor that owns companions after the broker exits.
//!
//! [`spawn_supervisor`] forks a process that starts a new session, detaches
//! from the caller's stdio, logs to `~/.simbroker/logs/supervisor-<pid>.log`
//! and takes over the [`AllocationContext`]. The supervisor does nothing but
//! wait; on SIGINT or SIGTERM it terminates every companion and exits 0.
//!
//! ```text
//! Spawning ──▶ Running ──(SIGINT/SIGTERM)──▶ CleaningUp ──▶ Terminated
//! ```
//!
//! Signals never touch the companions directly: [`TerminationSignals`]
//! cancels a [`CancellationToken`] and [`Supervisor::run`], which owns the
//! companions exclusively, performs the cleanup.

use std::fmt;
use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::os::fd::AsRawFd;
use std::path::Path;

use nix::sys::signal;
use nix::unistd::{dup2, fork, pipe, setsid, ForkResult, Pid};
use thiserror::Error;
use tokio::signal::unix::{signal as unix_signal, Signal, SignalKind};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};
use tracing_subscriber::EnvFilter;

use crate::allocation::AllocationContext;
use crate::config::logs_dir;

/// Errors raised while spawning the supervisor.
#[derive(Error, Debug)]
pub enum SupervisorError {
    /// The readiness pipe could not be created.
    #[error("failed to create readiness pipe: {0}")]
    Pipe(#[source] nix::Error),

    /// `fork` failed.
    #[error("failed to fork supervisor: {0}")]
    Fork(#[source] nix::Error),

    /// The supervisor died before confirming that it supervises.
    #[error("supervisor {pid} exited before becoming ready")]
    NotReady { pid: i32 },

    /// The supervisor could not be signalled.
    #[error("failed to signal supervisor: {0}")]
    Signal(#[source] nix::Error),

    /// An I/O error occurred.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Lifecycle state of a [`Supervisor`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorState {
    Spawning,
    Running,
    CleaningUp,
    Terminated,
}

impl fmt::Display for SupervisorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SupervisorState::Spawning => "spawning",
            SupervisorState::Running => "running",
            SupervisorState::CleaningUp => "cleaning up",
            SupervisorState::Terminated => "terminated",
        };
        f.write_str(name)
    }
}

/// A live supervisor as seen from the process that spawned it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SupervisorHandle {
    pub pid: i32,
    /// Addresses of exactly the companions the supervisor owns.
    pub socket_addresses: Vec<String>,
}

impl SupervisorHandle {
    /// Sends SIGTERM, making the supervisor release its companions and exit.
    pub fn shutdown(&self) -> Result<(), SupervisorError> {
        signal::kill(Pid::from_raw(self.pid), signal::Signal::SIGTERM).map_err(SupervisorError::Signal)
    }
}

// ---------------------------------------------------------------------------
// Supervisor
// ---------------------------------------------------------------------------

/// Sole owner of the companions once the broker has handed them off.
pub struct Supervisor {
    state: SupervisorState,
    companions: AllocationContext,
}

impl Supervisor {
    pub fn new(companions: AllocationContext) -> Self {
        Self {
            state: SupervisorState::Spawning,
            companions,
        }
    }

    pub fn state(&self) -> SupervisorState {
        self.state
    }

    fn transition(&mut self, next: SupervisorState) {
        debug!(from = %self.state, to = %next, "Supervisor state change");
        self.state = next;
    }

    /// Holds the companions until `shutdown` is cancelled, then cleans up.
    ///
    /// Returns the final state, which is always [`SupervisorState::Terminated`].
    pub async fn run(mut self, shutdown: CancellationToken) -> SupervisorState {
        self.transition(SupervisorState::Running);
        info!(
            companions = self.companions.len(),
            pids = ?self.companions.pids(),
            "Supervising companions"
        );

        shutdown.cancelled().await;

        self.cleanup();
        self.transition(SupervisorState::Terminated);
        info!("Supervisor finished");
        self.state
    }

    /// Terminates every owned companion. Safe to call more than once.
    pub fn cleanup(&mut self) {
        if self.state == SupervisorState::Terminated {
            return;
        }
        self.transition(SupervisorState::CleaningUp);
        self.companions.terminate_all();
    }
}

// ---------------------------------------------------------------------------
// Signals
// ---------------------------------------------------------------------------

/// SIGINT/SIGTERM listeners that request shutdown.
pub struct TerminationSignals {
    interrupt: Signal,
    terminate: Signal,
}

impl TerminationSignals {
    /// Installs the handlers. From here on neither signal kills the process.
    pub fn install() -> std::io::Result<Self> {
        Ok(Self {
            interrupt: unix_signal(SignalKind::interrupt())?,
            terminate: unix_signal(SignalKind::terminate())?,
        })
    }

    /// Cancels `shutdown` on every signal until both streams close.
    ///
    /// Signals arriving after the first one only log; cleanup is already
    /// underway.
    pub async fn forward(mut self, shutdown: CancellationToken) {
        loop {
            tokio::select! {
                Some(()) = self.interrupt.recv() => info!("Received SIGINT"),
                Some(()) = self.terminate.recv() => info!("Received SIGTERM"),
                else => break,
            }

            if shutdown.is_cancelled() {
                debug!("Shutdown already requested");
            }
            shutdown.cancel();
        }
    }
}

// ---------------------------------------------------------------------------
// Daemonizing
// ---------------------------------------------------------------------------

/// Forks the supervisor and hands it the companions.
///
/// Returns once the supervisor has installed its signal handlers. The calling
/// process keeps running with the companions' descriptors released; the
/// companions themselves stay alive under the supervisor.
///
/// Must be called while the process is single-threaded (no tokio runtime
/// alive), since only the calling thread survives the fork. On error every
/// companion has been terminated.
pub fn spawn_supervisor(companions: AllocationContext) -> Result<SupervisorHandle, SupervisorError> {
    let (ready_rx, ready_tx) = match pipe() {
        Ok(fds) => fds,
        Err(e) => {
            companions.abort();
            return Err(SupervisorError::Pipe(e));
        }
    };

    // SAFETY: the caller guarantees no other thread exists, so the child
    // cannot inherit a lock held by a thread that no longer runs.
    match unsafe { fork() } {
        Ok(ForkResult::Child) => {
            drop(ready_rx);
            let code = match run_detached(companions, File::from(ready_tx)) {
                Ok(()) => 0,
                Err(_) => 1,
            };
            std::process::exit(code);
        }
        Ok(ForkResult::Parent { child }) => {
            drop(ready_tx);
            let mut ready = File::from(ready_rx);
            let mut byte = [0u8; 1];
            let confirmed = matches!(ready.read(&mut byte), Ok(1));

            if !confirmed || signal::kill(child, None).is_err() {
                companions.abort();
                return Err(SupervisorError::NotReady { pid: child.as_raw() });
            }

            info!(pid = child.as_raw(), companions = companions.len(), "Supervisor running");
            let handle = SupervisorHandle {
                pid: child.as_raw(),
                socket_addresses: companions.socket_addresses(),
            };
            companions.release();
            Ok(handle)
        }
        Err(e) => {
            companions.abort();
            Err(SupervisorError::Fork(e))
        }
    }
}

/// Body of the forked supervisor process.
///
/// Everything, including a failure to start, is logged to
/// `supervisor-<pid>.log`; the supervisor has no other output.
fn run_detached(companions: AllocationContext, ready: File) -> Result<(), SupervisorError> {
    let _guard = tracing::subscriber::set_default(file_subscriber(&logs_dir(), std::process::id()));
    report_failure(supervise(companions, ready))
}

/// The subscriber writing to `<dir>/supervisor-<pid>.log`.
fn file_subscriber(dir: &Path, pid: u32) -> impl tracing::Subscriber + Send + Sync {
    tracing_subscriber::fmt()
        .with_writer(tracing_appender::rolling::never(dir, format!("supervisor-{pid}.log")))
        .with_ansi(false)
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .finish()
}

/// Logs a failed run through the current subscriber and passes it on.
fn report_failure(result: Result<(), SupervisorError>) -> Result<(), SupervisorError> {
    if let Err(e) = &result {
        error!(error = %e, "Supervisor failed");
    }
    result
}

fn supervise(companions: AllocationContext, mut ready: File) -> Result<(), SupervisorError> {
    setsid().map_err(std::io::Error::from)?;
    detach_stdio()?;

    info!(pid = %Pid::this(), companions = companions.len(), "Supervisor starting");

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;

    runtime.block_on(async move {
        let signals = TerminationSignals::install()?;
        let shutdown = CancellationToken::new();
        tokio::spawn(signals.forward(shutdown.clone()));

        ready.write_all(&[1])?;
        drop(ready);

        Supervisor::new(companions).run(shutdown).await;
        Ok::<(), SupervisorError>(())
    })
}

/// Points stdin, stdout and stderr at `/dev/null`.
///
/// The caller reads the broker's stdout to EOF; the supervisor must not keep
/// it open.
fn detach_stdio() -> std::io::Result<()> {
    let null = OpenOptions::new().read(true).write(true).open("/dev/null")?;
    for fd in 0..=2 {
        dup2(null.as_raw_fd(), fd).map_err(std::io::Error::from)?;
    }
    Ok(())
}
