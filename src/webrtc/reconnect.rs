//! Bounded reconnection policy
//!
//! Pure bookkeeping; the session driver owns the timers and performs the
//! actual replacement or renegotiation.

use super::peer_connection::{IceConnectionState, IceGatheringState};

pub const DEFAULT_MAX_RECONNECTION_ATTEMPTS: u32 = 3;

/// How a reconnection attempt reuses the current peer connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconnectionMode {
    /// Repeat offer/answer on the current connection
    InPlace,
    /// Build and negotiate a new connection, then swap
    Replace,
}

/// Outcome of asking for a new attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptDecision {
    /// Go ahead; carries the 1-based attempt number
    Attempt(u32),
    AlreadyInProgress,
    /// Limit reached, the session must be torn down
    Exhausted,
}

/// What to do about an ICE state change
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IceAction {
    None,
    ReplaceNow,
    /// Re-check after the grace period and replace if still disconnected
    CheckAfterGrace,
}

pub fn ice_connection_action(state: IceConnectionState) -> IceAction {
    match state {
        IceConnectionState::Failed => IceAction::ReplaceNow,
        IceConnectionState::Disconnected => IceAction::CheckAfterGrace,
        _ => IceAction::None,
    }
}

/// Gathering finished while connectivity checks still run: the answer is
/// fine, the remote just needs fresher candidates.
pub fn needs_in_place_renegotiation(
    gathering: IceGatheringState,
    connection: IceConnectionState,
) -> bool {
    gathering == IceGatheringState::Complete && connection == IceConnectionState::Checking
}

#[derive(Debug, Clone)]
pub struct ReconnectionState {
    attempts: u32,
    max_attempts: u32,
    in_progress: bool,
}

impl ReconnectionState {
    pub fn new(max_attempts: u32) -> Self {
        Self {
            attempts: 0,
            max_attempts,
            in_progress: false,
        }
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub fn in_progress(&self) -> bool {
        self.in_progress
    }

    /// Claim the in-flight guard and count one attempt.
    pub fn begin(&mut self) -> AttemptDecision {
        if self.in_progress {
            return AttemptDecision::AlreadyInProgress;
        }
        if self.attempts >= self.max_attempts {
            return AttemptDecision::Exhausted;
        }
        self.attempts += 1;
        self.in_progress = true;
        AttemptDecision::Attempt(self.attempts)
    }

    /// The attempt in flight failed; the guard is released so the next
    /// attempt can begin after backoff.
    pub fn attempt_failed(&mut self) {
        self.in_progress = false;
    }

    /// Signalling is stable again: forget all previous attempts.
    pub fn stabilized(&mut self) {
        self.attempts = 0;
        self.in_progress = false;
    }
}

impl Default for ReconnectionState {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_RECONNECTION_ATTEMPTS)
    }
}
