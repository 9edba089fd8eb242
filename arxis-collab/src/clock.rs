//! Local sequence assignment and acknowledgment tracking.
//!
//! Two watermarks per session:
//! - `last_assigned` — highest local sequence handed out. Strictly
//!   increasing for the lifetime of one session id; an overflow is a fatal
//!   condition, never a silent wrap.
//! - `last_ack` — highest local sequence the server has confirmed.
//!   Max-merged, so acks arriving out of order never move it backward.
//!
//! The sequencer owns the session identity: the only way to restart the
//! counters is [`Sequencer::rotate`], which issues a fresh session id first.
//!
//! Reference: Kleppmann — DDIA, Chapter 5 (leader-assigned sequence order).

use crate::error::SyncError;
use crate::protocol::SessionId;

#[derive(Debug)]
pub struct Sequencer {
    session: SessionId,
    last_assigned: u64,
    last_ack: u64,
}

impl Sequencer {
    pub fn new() -> Self {
        Self::with_session(SessionId::generate())
    }

    pub fn with_session(session: SessionId) -> Self {
        Self {
            session,
            last_assigned: 0,
            last_ack: 0,
        }
    }

    pub fn session(&self) -> SessionId {
        self.session
    }

    /// Hand out the next local sequence number (first call returns 1).
    pub fn next_local_seq(&mut self) -> Result<u64, SyncError> {
        match self.last_assigned.checked_add(1) {
            Some(seq) => {
                self.last_assigned = seq;
                Ok(seq)
            }
            None => {
                log::error!(
                    "session {}: local sequence counter overflow",
                    self.session
                );
                Err(SyncError::FatalConfig(
                    "local sequence counter overflow".into(),
                ))
            }
        }
    }

    /// Highest local sequence assigned so far (0 before the first).
    pub fn last_assigned(&self) -> u64 {
        self.last_assigned
    }

    /// Merge a server acknowledgment. Returns true when the watermark
    /// advanced (acks are max-merged and may arrive out of order).
    pub fn on_ack(&mut self, seq: u64) -> bool {
        if seq > self.last_assigned {
            log::debug!(
                "session {}: ack {} ahead of last assigned {}",
                self.session,
                seq,
                self.last_assigned
            );
        }
        if seq > self.last_ack {
            self.last_ack = seq;
            true
        } else {
            false
        }
    }

    pub fn last_ack(&self) -> u64 {
        self.last_ack
    }

    /// Number of assigned-but-unacknowledged sequences.
    pub fn unacked(&self) -> u64 {
        self.last_assigned.saturating_sub(self.last_ack)
    }

    /// Begin a new logical session: fresh id, counters back to zero.
    /// Required before sequence numbers may restart.
    pub fn rotate(&mut self) -> SessionId {
        self.session = SessionId::generate();
        self.last_assigned = 0;
        self.last_ack = 0;
        self.session
    }
}

impl Default for Sequencer {
    fn default() -> Self {
        Self::new()
    }
}
