//! The companions allocated by one broker invocation.
//!
//! An [`AllocationContext`] is filled while companions launch and then moved
//! as a whole: into the supervisor, which terminates the companions on
//! shutdown, or into [`abort`](AllocationContext::abort) when the invocation
//! fails halfway.

use std::time::{Duration, Instant};

use tracing::{info, warn};

use crate::companion::CompanionProcess;

/// Companions owned by the current invocation, in launch order.
#[derive(Debug)]
pub struct AllocationContext {
    companions: Vec<CompanionProcess>,
    termination_grace: Duration,
}

impl AllocationContext {
    pub fn new(termination_grace: Duration) -> Self {
        Self {
            companions: Vec::new(),
            termination_grace,
        }
    }

    pub fn register(&mut self, companion: CompanionProcess) {
        self.companions.push(companion);
    }

    pub fn len(&self) -> usize {
        self.companions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.companions.is_empty()
    }

    pub fn companions(&self) -> &[CompanionProcess] {
        &self.companions
    }

    /// Socket addresses of every owned companion, in launch order.
    pub fn socket_addresses(&self) -> Vec<String> {
        self.companions
            .iter()
            .map(|c| c.socket_address().to_string())
            .collect()
    }

    pub fn pids(&self) -> Vec<u32> {
        self.companions.iter().map(|c| c.pid()).collect()
    }

    /// Terminates every companion. Failures are logged and skipped.
    ///
    /// All companions get SIGTERM up front and share one grace period, so
    /// shutdown takes at most one grace period however many there are.
    pub fn terminate_all(&mut self) {
        for companion in &mut self.companions {
            if let Err(e) = companion.request_termination() {
                warn!(udid = %companion.udid(), error = %e, "Companion cleanup failed");
            }
        }

        let deadline = Instant::now() + self.termination_grace;
        for companion in &mut self.companions {
            if let Err(e) = companion.finish_termination(deadline) {
                warn!(udid = %companion.udid(), error = %e, "Companion cleanup failed");
            }
        }
    }

    /// Unwinds a failed invocation by terminating everything launched so far.
    pub fn abort(mut self) {
        if !self.is_empty() {
            info!(companions = self.len(), "Aborting allocation");
        }
        self.terminate_all();
    }

    /// Drops this process' handles without touching the processes.
    ///
    /// Called by the originating process once the supervisor owns the
    /// companions.
    pub fn release(self) {
        for companion in self.companions {
            companion.release();
        }
    }
}
