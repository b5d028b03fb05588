//! Trickle ICE candidate batching
//!
//! Local candidates are queued and sent to the offer endpoint in one PATCH
//! per flush window. Nothing leaves the queue until the first answer of the
//! current peer connection has been applied, since the endpoint can only
//! attach candidates to a session id it has already handed out.

use super::endpoint::{CandidateBatch, CandidatePayload};
use super::peer_connection::IceCandidate;
use std::time::Duration;

pub const DEFAULT_FLUSH_DELAY: Duration = Duration::from_millis(200);

#[derive(Debug)]
pub struct CandidateBatcher {
    queue: Vec<IceCandidate>,
    session_id: Option<String>,
    flush_scheduled: bool,
    delay: Duration,
}

impl CandidateBatcher {
    pub fn new(delay: Duration) -> Self {
        Self {
            queue: Vec::new(),
            session_id: None,
            flush_scheduled: false,
            delay,
        }
    }

    pub fn delay(&self) -> Duration {
        self.delay
    }

    /// Queue a candidate. Returns `true` when the caller must schedule a
    /// flush after `delay()`; `false` if one is already pending.
    pub fn enqueue(&mut self, candidate: IceCandidate) -> bool {
        self.queue.push(candidate);
        if self.flush_scheduled {
            return false;
        }
        self.flush_scheduled = true;
        true
    }

    /// Allow transmission, tagging future batches with `session_id`.
    pub fn authorize(&mut self, session_id: String) {
        self.session_id = Some(session_id);
    }

    /// Stop transmitting until the next `authorize`. Queued candidates stay.
    pub fn revoke(&mut self) {
        self.session_id = None;
    }

    pub fn is_authorized(&self) -> bool {
        self.session_id.is_some()
    }

    pub fn pending(&self) -> usize {
        self.queue.len()
    }

    /// Drain the whole queue into one batch. `None` when the queue is empty
    /// or transmission is not yet authorized; the queue is left intact then.
    pub fn flush(&mut self) -> Option<CandidateBatch> {
        self.flush_scheduled = false;
        let session_id = self.session_id.clone()?;
        if self.queue.is_empty() {
            return None;
        }

        let candidates = self
            .queue
            .drain(..)
            .map(CandidatePayload::from)
            .collect();
        Some(CandidateBatch { session_id, candidates })
    }

    /// Session teardown: forget queue and authorization.
    pub fn clear(&mut self) {
        self.queue.clear();
        self.session_id = None;
        self.flush_scheduled = false;
    }
}

impl Default for CandidateBatcher {
    fn default() -> Self {
        Self::new(DEFAULT_FLUSH_DELAY)
    }
}
