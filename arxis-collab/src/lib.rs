//! # arxis-collab — Real-time session synchronization for Arxis
//!
//! Keeps every participant in a shared building-model review converged on
//! the same collaborative state: chat, annotations, issues, selection
//! sets, presence, and voice membership. Geometry never flows through
//! here; this layer syncs the conversation *around* the model.
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────┐      WebSocket       ┌───────────────┐
//! │ CollabSession │ ◄──────────────────► │  SyncServer   │
//! │  (per user)   │   bincode envelopes  │  (authority)  │
//! └───────┬───────┘                      └───────┬───────┘
//!         │ optimistic apply                     │ stamps server_seq
//!         ▼                                      ▼
//! ┌───────────────┐                      ┌───────────────┐
//! │ Synchronizer  │                      │ CollectionLog │
//! │ + OutboundQ   │                      │ (per project) │
//! └───────────────┘                      └───────┬───────┘
//!                                                │
//!                                        ┌───────┴───────┐
//!                                        │  PeerFanout   │
//!                                        │ (per project) │
//!                                        └───────────────┘
//! ```
//!
//! The server is the sole ordering authority: clients apply their own
//! edits optimistically with pending status, ship them in batches, and
//! confirm them when the stamped copy fans back. Convergence is
//! whole-record last-writer-wins by `server_seq`; reconnects catch up via
//! watermark-driven resync with a forced reset when history has been
//! pruned past a client's watermark.
//!
//! ## Modules
//!
//! - [`protocol`] — Envelope wire format and core ids (bincode)
//! - [`collections`] — Typed collection registry, optimistic apply, LWW
//! - [`clock`] — Local sequence assignment and ack watermarks
//! - [`scheduler`] — Outbound batching queue with coalescing
//! - [`presence`] — Heartbeat-driven roster with status decay
//! - [`reconnect`] — Jittered exponential backoff budget
//! - [`transport`] — WebSocket link (reader/writer tasks)
//! - [`session`] — Client owner task and public handle
//! - [`broadcast`] — Per-project fan-out with origin filtering
//! - [`server`] — Stamping authority and resync service
//!
//! ## Performance Targets
//!
//! | Metric | Target |
//! |--------|--------|
//! | Envelope encode (single mutation) | <2µs |
//! | Remote apply, keyed collection | <1µs |
//! | Fan-out 1 KiB × 50 sessions | <1ms |
//! | Queue coalescing at 10k capacity | <2µs |

pub mod broadcast;
pub mod clock;
pub mod collections;
pub mod config;
pub mod error;
pub mod presence;
pub mod protocol;
pub mod reconnect;
pub mod scheduler;
pub mod server;
pub mod session;
pub mod transport;

pub use broadcast::{BroadcastFrame, FanoutStats, PeerFanout};
pub use clock::Sequencer;
pub use collections::{
    standard_collections, ApplyOutcome, ChangeEvent, ChangeSource, CollectionKind, EntityRecord,
    Synchronizer,
};
pub use config::{ReconnectPolicy, SyncConfig};
pub use error::SyncError;
pub use presence::{
    HeartbeatBody, PresenceBody, PresenceEntry, PresenceEvent, PresenceStatus, PresenceTracker,
};
pub use protocol::{
    AckBody, CollectionCatchUp, CollectionId, CollectionWatermark, EntityId, Envelope, MessageKind,
    Mutation, OpKind, ProjectId, ResyncRequest, ResyncResponse, SessionId, UserId, UserInfo,
};
pub use reconnect::Backoff;
pub use scheduler::{FlushMonitor, FlushSignal, OutboundQueue};
pub use server::{ServerConfig, ServerStats, SyncServer};
pub use session::{CollabSession, SessionEvent, SessionStats};
pub use transport::{ConnectionState, TransportLink};
