use crate::fault::FatalFault;
use crate::hal::{Millis, Watchdog};
use serde::{Deserialize, Serialize};
use tracing::{error, warn};

/// Maximum gap between served requests before the device counts as wedged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LivenessMonitor {
    reboot_timeout_ms: Option<Millis>,
    last_successful_request_at: Millis,
}

impl LivenessMonitor {
    pub fn new(reboot_timeout_ms: Option<Millis>, now: Millis) -> Self {
        if let Some(timeout) = reboot_timeout_ms {
            warn!("Device resets if no request is served for {} ms", timeout);
        }
        Self {
            reboot_timeout_ms,
            last_successful_request_at: now,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.reboot_timeout_ms.is_some()
    }

    /// Reset on a served request, otherwise check the timeout.
    pub fn record(&mut self, now: Millis, served: bool) -> Result<(), FatalFault> {
        let Some(timeout_ms) = self.reboot_timeout_ms else {
            return Ok(());
        };

        if served {
            self.last_successful_request_at = now;
        } else if now.saturating_sub(self.last_successful_request_at) > timeout_ms {
            error!("No request served for {} ms", timeout_ms);
            return Err(FatalFault::LivenessStarved { timeout_ms });
        }
        Ok(())
    }

    pub fn last_successful_request_at(&self) -> Millis {
        self.last_successful_request_at
    }
}

const WATCHDOG_TIMEOUT_MS: Millis = 8 * 1000;

/// Watchdog emulated in software for hosts and tests.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SoftwareWatchdog {
    timeout_ms: Millis,
    last_feed_at: Millis,
    feed_count: u64,
}

impl SoftwareWatchdog {
    pub fn new(timeout_ms: Millis) -> Self {
        Self {
            timeout_ms,
            last_feed_at: 0,
            feed_count: 0,
        }
    }

    pub fn feed_count(&self) -> u64 {
        self.feed_count
    }

    pub fn last_feed_at(&self) -> Millis {
        self.last_feed_at
    }
}

impl Default for SoftwareWatchdog {
    fn default() -> Self {
        Self::new(WATCHDOG_TIMEOUT_MS)
    }
}

impl Watchdog for SoftwareWatchdog {
    fn feed(&mut self, now: Millis) {
        self.last_feed_at = now;
        self.feed_count += 1;
    }

    fn has_fired(&self, now: Millis) -> bool {
        now.saturating_sub(self.last_feed_at) > self.timeout_ms
    }
}
