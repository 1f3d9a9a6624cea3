use crate::hal::Restart;
use heapless::Vec;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::error;

const MAX_RESTART_HISTORY: usize = 16;

/// Unrecoverable conditions. Every variant ends the current run with a full
/// device reset; there is no partial recovery path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Error)]
pub enum FatalFault {
    #[error("network link lost")]
    LinkDown,
    #[error("address lease renew failed")]
    RenewFailed,
    #[error("address lease rebind failed")]
    RebindFailed,
    #[error("no address acquired at boot")]
    AddressAcquisitionFailed,
    #[error("watchdog expired while waiting on a client")]
    WatchdogExpired,
    #[error("no request served for {timeout_ms} ms")]
    LivenessStarved { timeout_ms: u64 },
}

impl FatalFault {
    /// Liveness starvation is not reset explicitly: the loop stops feeding
    /// the watchdog and lets it fire.
    pub fn awaits_watchdog(&self) -> bool {
        matches!(self, FatalFault::LivenessStarved { .. })
    }
}

/// Simulated reset that only records what would have been reset.
#[derive(Debug, Default)]
pub struct RestartRecorder {
    history: Vec<FatalFault, MAX_RESTART_HISTORY>,
}

impl RestartRecorder {
    pub fn new() -> Self {
        Self { history: Vec::new() }
    }

    pub fn restart_count(&self) -> usize {
        self.history.len()
    }

    pub fn history(&self) -> &[FatalFault] {
        &self.history
    }

    pub fn last(&self) -> Option<&FatalFault> {
        self.history.last()
    }
}

impl Restart for RestartRecorder {
    fn restart(&mut self, cause: &FatalFault) {
        if self.history.is_full() {
            self.history.remove(0);
        }
        let _ = self.history.push(*cause);
    }
}

/// Host stand-in for the hard reset: terminate the process and let the
/// supervisor (systemd, a shell loop) start it again.
#[derive(Debug, Clone, Copy)]
pub struct ProcessExit {
    pub exit_code: i32,
}

impl Default for ProcessExit {
    fn default() -> Self {
        Self { exit_code: 1 }
    }
}

impl Restart for ProcessExit {
    fn restart(&mut self, cause: &FatalFault) {
        error!("Restarting: {}", cause);
        std::process::exit(self.exit_code);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recorder_keeps_order() {
        let mut recorder = RestartRecorder::new();
        recorder.restart(&FatalFault::RenewFailed);
        recorder.restart(&FatalFault::LinkDown);

        assert_eq!(recorder.restart_count(), 2);
        assert_eq!(recorder.history(), &[FatalFault::RenewFailed, FatalFault::LinkDown]);
        assert_eq!(recorder.last(), Some(&FatalFault::LinkDown));
    }

    #[test]
    fn test_recorder_drops_oldest_when_full() {
        let mut recorder = RestartRecorder::new();
        recorder.restart(&FatalFault::RebindFailed);
        for _ in 0..MAX_RESTART_HISTORY {
            recorder.restart(&FatalFault::LinkDown);
        }

        assert_eq!(recorder.restart_count(), MAX_RESTART_HISTORY);
        assert!(!recorder.history().contains(&FatalFault::RebindFailed));
    }

    #[test]
    fn test_only_liveness_waits_for_watchdog() {
        assert!(FatalFault::LivenessStarved { timeout_ms: 10 }.awaits_watchdog());
        assert!(!FatalFault::RenewFailed.awaits_watchdog());
        assert!(!FatalFault::LinkDown.awaits_watchdog());
        // Already expired, nothing left to wait for.
        assert!(!FatalFault::WatchdogExpired.awaits_watchdog());
    }

    #[test]
    fn test_fault_messages() {
        let fault = FatalFault::LivenessStarved { timeout_ms: 900_000 };
        assert_eq!(fault.to_string(), "no request served for 900000 ms");
        assert_eq!(FatalFault::RenewFailed.to_string(), "address lease renew failed");
    }
}
