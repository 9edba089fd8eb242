//! Error taxonomy for the synchronization engine.
//!
//! Four failure classes with distinct recovery policies:
//!
//! | Class         | Recovery                                        |
//! |---------------|-------------------------------------------------|
//! | `Transport`   | reconnection coordinator retries with backoff   |
//! | `Protocol`    | offending message dropped and logged            |
//! | `SequenceGap` | full resync (discard state, re-request snapshot)|
//! | `FatalConfig` | surfaced to the caller, never retried           |
//!
//! Everything else is an API-level rejection returned to the calling panel
//! (`NotConnected`, `QueueFull`, ...). Network and protocol failures never
//! cross the session boundary; callers only observe connection-state changes
//! and fatal errors.

use thiserror::Error;

use crate::protocol::CollectionId;

#[derive(Error, Debug, Clone)]
pub enum SyncError {
    /// Connection refused, timeout, or abrupt close. Always recovered by
    /// the reconnection coordinator while the retry budget lasts.
    #[error("transport failure: {0}")]
    Transport(String),

    /// Malformed or unparseable message. The message is dropped; the
    /// session survives.
    #[error("protocol violation: {0}")]
    Protocol(String),

    /// A mutation referenced a collection that was never registered.
    #[error("unknown collection \"{0}\"")]
    UnknownCollection(CollectionId),

    /// The mutation does not fit the collection's declared shape.
    #[error("schema violation on \"{collection}\": {detail}")]
    SchemaViolation {
        collection: CollectionId,
        detail: String,
    },

    /// The server cannot serve deltas back to our watermark (history lost
    /// or compacted). Forces a full snapshot resync for the collection.
    #[error("sequence gap on \"{collection}\": watermark {watermark} predates retained server history")]
    SequenceGap {
        collection: CollectionId,
        watermark: u64,
    },

    /// Non-recoverable configuration problem: invalid reconnect policy,
    /// bad URL scheme, sequence counter overflow.
    #[error("fatal configuration error: {0}")]
    FatalConfig(String),

    /// Send attempted outside the `Connected` state.
    #[error("session is not connected")]
    NotConnected,

    /// The bounded outbound queue is at capacity.
    #[error("outbound queue is full ({0} pending mutations)")]
    QueueFull(usize),

    /// Voice membership requested while the VoIP flag is disabled.
    #[error("voice chat is disabled by configuration")]
    VoiceDisabled,

    /// The session owner task has shut down.
    #[error("session is closed")]
    Closed,
}

impl SyncError {
    /// True for errors that must stop the session and reach the caller.
    pub fn is_fatal(&self) -> bool {
        matches!(self, SyncError::FatalConfig(_))
    }

    /// True for errors the engine absorbs internally (retry, drop-and-log,
    /// or full resync) without any caller action.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            SyncError::Transport(_)
                | SyncError::Protocol(_)
                | SyncError::UnknownCollection(_)
                | SyncError::SequenceGap { .. }
        )
    }
}
