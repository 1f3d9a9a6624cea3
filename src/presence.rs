use crate::hal::{Millis, PresenceInput};
use tracing::debug;

/// Debounced PIR presence: set on any activity, cleared only after the
/// input has stayed inactive for the hold time.
#[derive(Debug)]
pub struct PresenceDetector<I: PresenceInput> {
    input: I,
    hold_ms: Millis,
    present: bool,
    last_active_at: Millis,
}

impl<I: PresenceInput> PresenceDetector<I> {
    pub fn new(input: I, hold_ms: Millis) -> Self {
        Self {
            input,
            hold_ms,
            present: false,
            last_active_at: 0,
        }
    }

    /// Sample the input once. Called every loop iteration.
    pub fn update(&mut self, now: Millis) -> bool {
        if self.input.is_active() {
            if !self.present {
                debug!("Presence detected");
            }
            self.present = true;
            self.last_active_at = now;
        } else if self.present && now.saturating_sub(self.last_active_at) > self.hold_ms {
            debug!("Presence cleared");
            self.present = false;
        }
        self.present
    }

    pub fn is_present(&self) -> bool {
        self.present
    }

    pub fn input_mut(&mut self) -> &mut I {
        &mut self.input
    }
}
