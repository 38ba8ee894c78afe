//! Connectivity epochs.
//!
//! Every transition from "no network" to "network" opens a new epoch. The
//! scheduler runs one sync per epoch; repeated signals within the same epoch
//! are no-ops until that sync fails. The monitor outlives scheduler restarts
//! so a restart while already connected does not sync again.

use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use tokio::net::TcpStream;

#[derive(Debug, Default)]
struct EpochState {
    available: bool,
    epoch: u64,
    satisfied: Option<u64>,
}

#[derive(Debug, Default)]
pub struct ConnectivityMonitor {
    state: Mutex<EpochState>,
}

impl ConnectivityMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, EpochState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Record the current connectivity. Returns true on an
    /// unavailable-to-available transition.
    pub fn update(&self, available: bool) -> bool {
        let mut state = self.state();
        let transition = available && !state.available;
        if transition {
            state.epoch += 1;
            tracing::debug!("Connectivity epoch {} started", state.epoch);
        }
        state.available = available;
        transition
    }

    pub fn is_available(&self) -> bool {
        self.state().available
    }

    /// The current epoch when connected and not yet synced.
    pub fn pending_epoch(&self) -> Option<u64> {
        let state = self.state();
        (state.available && state.satisfied != Some(state.epoch)).then_some(state.epoch)
    }

    /// Called after a successful connectivity-triggered sync.
    pub fn mark_satisfied(&self, epoch: u64) {
        let mut state = self.state();
        if state.satisfied.is_none_or(|s| s < epoch) {
            state.satisfied = Some(epoch);
        }
    }
}

/// Reachability check: can a TCP connection to the server be opened?
pub async fn is_reachable(host: &str, port: u16, timeout: Duration) -> bool {
    match tokio::time::timeout(timeout, TcpStream::connect((host, port))).await {
        Ok(Ok(_)) => true,
        Ok(Err(e)) => {
            tracing::debug!("Reachability check of {}:{} failed: {}", host, port, e);
            false
        }
        Err(_) => {
            tracing::debug!("Reachability check of {}:{} timed out", host, port);
            false
        }
    }
}
