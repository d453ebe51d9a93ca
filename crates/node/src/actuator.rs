//! Irrigation actuator: owns the pump relay and bounds every run.
//!
//! ```text
//!        turn_on                       turn_off / check_timeout
//! Idle ───────────▶ Running{since} ──────────────────────────────▶ Idle
//!  ▲ turn_off (no-op)   │ turn_on (no-op, timer kept)
//!  └──┘                 └──┘
//! ```
//!
//! The relay is written only inside the two transitions, so its output is
//! always energized exactly while the state is `Running`.  The timeout is
//! checked against local time only and never depends on the broker.

use std::fmt;
use std::time::Duration;

use tokio::time::Instant;
use tracing::info;

use crate::relay::Relay;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActuatorState {
    Idle,
    Running { since: Instant },
}

/// Why a transition was requested; only used for logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cause {
    Demand,
    Command,
    Timeout,
    Shutdown,
}

impl fmt::Display for Cause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Demand => write!(f, "demand"),
            Self::Command => write!(f, "command"),
            Self::Timeout => write!(f, "timeout"),
            Self::Shutdown => write!(f, "shutdown"),
        }
    }
}

pub struct Actuator<R> {
    relay: R,
    state: ActuatorState,
    max_duration: Duration,
}

impl<R: Relay> Actuator<R> {
    /// Take ownership of `relay` and force it released.
    pub fn new(mut relay: R, max_duration: Duration) -> Self {
        relay.set(false);
        Self {
            relay,
            state: ActuatorState::Idle,
            max_duration,
        }
    }

    #[cfg(test)]
    pub(crate) fn state(&self) -> ActuatorState {
        self.state
    }

    pub fn is_running(&self) -> bool {
        matches!(self.state, ActuatorState::Running { .. })
    }

    /// Start the pump.  Returns `false` (and leaves the start time alone) if
    /// it is already running.
    pub fn turn_on(&mut self, now: Instant, cause: Cause) -> bool {
        if self.is_running() {
            return false;
        }
        self.relay.set(true);
        self.state = ActuatorState::Running { since: now };
        info!(
            %cause,
            max_sec = self.max_duration.as_secs_f32(),
            "pump turned ON"
        );
        true
    }

    /// Stop the pump.  Returns `false` if it was already idle.
    pub fn turn_off(&mut self, now: Instant, cause: Cause) -> bool {
        let ActuatorState::Running { since } = self.state else {
            return false;
        };
        self.relay.set(false);
        self.state = ActuatorState::Idle;
        info!(
            %cause,
            ran_sec = now.saturating_duration_since(since).as_secs_f32(),
            "pump turned OFF"
        );
        true
    }

    /// Force the pump off once it has run for `max_duration`.  Call on every
    /// tick.
    pub fn check_timeout(&mut self, now: Instant) -> bool {
        debug_assert_eq!(self.relay.is_energized(), self.is_running());
        match self.state {
            ActuatorState::Running { since }
                if now.saturating_duration_since(since) >= self.max_duration =>
            {
                self.turn_off(now, Cause::Timeout)
            }
            _ => false,
        }
    }

    #[cfg(test)]
    pub(crate) fn relay(&self) -> &R {
        &self.relay
    }
}

// ===========================================================================
// Tests
// ===========================================================================
