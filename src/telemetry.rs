//! Device telemetry adapter state.
//!
//! The per-device telemetry sampler is an external collaborator; the
//! lifecycle controller only drives its coarse state so that it samples
//! while the runtime channels are live and stops before unload.

use std::sync::atomic::{AtomicU8, Ordering};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TelemetryState {
    Inactive = 0,
    Active = 1,
    Finalized = 2,
}

static STATE: AtomicU8 = AtomicU8::new(TelemetryState::Inactive as u8);

pub fn set_state(state: TelemetryState) {
    STATE.store(state as u8, Ordering::Release);
}

pub fn state() -> TelemetryState {
    match STATE.load(Ordering::Acquire) {
        1 => TelemetryState::Active,
        2 => TelemetryState::Finalized,
        _ => TelemetryState::Inactive,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transitions_are_observable() {
        set_state(TelemetryState::Active);
        assert_eq!(state(), TelemetryState::Active);
        set_state(TelemetryState::Finalized);
        assert_eq!(state(), TelemetryState::Finalized);
        set_state(TelemetryState::Inactive);
    }
}
