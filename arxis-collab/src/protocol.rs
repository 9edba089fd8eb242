//! Binary wire protocol for session synchronization.
//!
//! Every frame on the socket is one bincode-encoded [`Envelope`]:
//! ```text
//! ┌──────┬───────────┬───────────┬──────────┐
//! │ kind │ project   │ session   │ payload  │
//! │ 1 B  │ 16 bytes  │ 16 bytes  │ variable │
//! └──────┴───────────┴───────────┴──────────┘
//! ```
//! The payload is a typed body selected by `kind`: a mutation batch, an ack
//! watermark, a resync request/response, or a presence/heartbeat body (those
//! two are defined next to the presence tracker). Bodies are serde types, so
//! a JSON rendering of the whole envelope stays available for debugging.
//!
//! Performance target: encode < 1µs for a typical single-mutation batch.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::SyncError;

// ─────────────────────────────────────────────────────────────────────────────
// Identifiers
// ─────────────────────────────────────────────────────────────────────────────

/// One collaborative project space (one building model under review).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ProjectId(pub Uuid);

impl ProjectId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }
}

impl std::fmt::Display for ProjectId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// One client connection lifetime. Sequence numbers are scoped to this id;
/// a fresh id means counters may restart from zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionId(pub Uuid);

impl SessionId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// One human collaborator. Stable across reconnects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct UserId(pub Uuid);

impl UserId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }
}

impl std::fmt::Display for UserId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// Name of one shared collection ("chat", "annotations", ...).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CollectionId(String);

impl CollectionId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for CollectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for CollectionId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Key of one record inside a collection. Chosen by the producing panel
/// (message ids, annotation ids, ...).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EntityId(String);

impl EntityId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl std::fmt::Display for EntityId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for EntityId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Collaborator identity
// ─────────────────────────────────────────────────────────────────────────────

/// Collaborator identity with display metadata.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct UserInfo {
    pub id: UserId,
    pub name: String,
    /// RGB display color for cursors and roster badges.
    pub color: [u8; 3],
}

impl UserInfo {
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_id(UserId::generate(), name)
    }

    /// Create with an explicit id (stable across reconnects, and for tests).
    pub fn with_id(id: UserId, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            color: color_for(id),
        }
    }

    /// CSS hex rendering of the display color.
    pub fn color_hex(&self) -> String {
        format!("#{:02x}{:02x}{:02x}", self.color[0], self.color[1], self.color[2])
    }
}

/// Stable color from the user id hash.
fn color_for(id: UserId) -> [u8; 3] {
    let hash = id.0.as_u128();
    [(hash & 0xFF) as u8, ((hash >> 8) & 0xFF) as u8, ((hash >> 16) & 0xFF) as u8]
}

// ─────────────────────────────────────────────────────────────────────────────
// Mutations
// ─────────────────────────────────────────────────────────────────────────────

/// What a mutation does to its entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OpKind {
    Insert,
    Update,
    Delete,
    Upsert,
}

impl OpKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            OpKind::Insert => "insert",
            OpKind::Update => "update",
            OpKind::Delete => "delete",
            OpKind::Upsert => "upsert",
        }
    }

    /// Delete carries no payload; everything else replaces the whole record.
    pub fn is_delete(&self) -> bool {
        matches!(self, OpKind::Delete)
    }
}

/// An atomic change to one entity of one shared collection.
///
/// Immutable once created. `server_seq` is `None` until the server stamps
/// the mutation with its authoritative per-collection ordering key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Mutation {
    pub collection: CollectionId,
    pub op: OpKind,
    pub entity: EntityId,
    /// Opaque record encoding owned by the producing panel. Empty for deletes.
    pub payload: Vec<u8>,
    /// Client-assigned provisional ordering key.
    pub local_seq: u64,
    pub origin: SessionId,
    /// Server-assigned authoritative ordering key within the collection.
    pub server_seq: Option<u64>,
}

impl Mutation {
    pub fn is_stamped(&self) -> bool {
        self.server_seq.is_some()
    }

    /// Server-side: return a copy carrying the authoritative sequence.
    pub fn stamped(&self, server_seq: u64) -> Self {
        let mut m = self.clone();
        m.server_seq = Some(server_seq);
        m
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Resync bodies
// ─────────────────────────────────────────────────────────────────────────────

/// Per-collection client watermark sent with a resync request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CollectionWatermark {
    pub collection: CollectionId,
    /// Highest `server_seq` the client has applied for this collection.
    pub last_applied: u64,
}

/// Catch-up request issued after every (re)connect.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResyncRequest {
    pub watermarks: Vec<CollectionWatermark>,
    /// Highest `local_seq` this session has seen acknowledged. The server
    /// answers with its own processed watermark so acks lost in flight are
    /// reconciled.
    pub last_ack_seq: u64,
    /// Collections for which the client wants a full snapshot regardless of
    /// watermark (set after a detected sequence gap).
    pub full: Vec<CollectionId>,
}

/// One collection's slice of a resync response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CollectionCatchUp {
    pub collection: CollectionId,
    /// True when the client must discard its local state before applying:
    /// either a full snapshot was requested, or the server's retained
    /// history no longer reaches back to the client's watermark.
    pub reset: bool,
    /// Stamped mutations in ascending `server_seq` order.
    pub mutations: Vec<Mutation>,
}

/// Catch-up response. Mutations per collection, plus the server's record of
/// how far it has processed this session's local sequence numbers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResyncResponse {
    pub collections: Vec<CollectionCatchUp>,
    pub acked_local_seq: u64,
}

/// Ack body: highest contiguous `local_seq` the server has processed for
/// the receiving session.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AckBody {
    pub local_seq: u64,
}

// ─────────────────────────────────────────────────────────────────────────────
// Envelope
// ─────────────────────────────────────────────────────────────────────────────

/// Message kinds multiplexed over the single socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum MessageKind {
    /// Batch of mutations (client → server unstamped, server → clients stamped)
    Mutation = 1,
    /// Server → origin processed-watermark acknowledgment
    Ack = 2,
    /// Roster change: join, leave, status, voice membership
    Presence = 3,
    /// Periodic liveness ping with view location
    Heartbeat = 4,
    /// Client → server catch-up request after (re)connect
    ResyncRequest = 5,
    /// Server → client catch-up data
    ResyncResponse = 6,
}

/// Top-level wire frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub kind: MessageKind,
    pub project: ProjectId,
    pub session: SessionId,
    /// Body encoding varies by `kind`.
    pub payload: Vec<u8>,
}

impl Envelope {
    /// Create a mutation-batch envelope.
    pub fn mutations(project: ProjectId, session: SessionId, batch: &[Mutation]) -> Self {
        Self {
            kind: MessageKind::Mutation,
            project,
            session,
            payload: encode_body(&batch.to_vec()),
        }
    }

    /// Create an ack envelope.
    pub fn ack(project: ProjectId, session: SessionId, local_seq: u64) -> Self {
        Self {
            kind: MessageKind::Ack,
            project,
            session,
            payload: encode_body(&AckBody { local_seq }),
        }
    }

    /// Create a presence envelope from a pre-encoded body
    /// (see `presence::PresenceBody`).
    pub fn presence(project: ProjectId, session: SessionId, body: Vec<u8>) -> Self {
        Self {
            kind: MessageKind::Presence,
            project,
            session,
            payload: body,
        }
    }

    /// Create a heartbeat envelope from a pre-encoded body
    /// (see `presence::HeartbeatBody`).
    pub fn heartbeat(project: ProjectId, session: SessionId, body: Vec<u8>) -> Self {
        Self {
            kind: MessageKind::Heartbeat,
            project,
            session,
            payload: body,
        }
    }

    /// Create a resync request envelope.
    pub fn resync_request(project: ProjectId, session: SessionId, req: &ResyncRequest) -> Self {
        Self {
            kind: MessageKind::ResyncRequest,
            project,
            session,
            payload: encode_body(req),
        }
    }

    /// Create a resync response envelope.
    pub fn resync_response(project: ProjectId, session: SessionId, resp: &ResyncResponse) -> Self {
        Self {
            kind: MessageKind::ResyncResponse,
            project,
            session,
            payload: encode_body(resp),
        }
    }

    /// Serialize to the binary wire format.
    pub fn encode(&self) -> Result<Vec<u8>, SyncError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| SyncError::Protocol(format!("envelope encode: {e}")))
    }

    /// Deserialize from the binary wire format.
    pub fn decode(bytes: &[u8]) -> Result<Self, SyncError> {
        let (env, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| SyncError::Protocol(format!("envelope decode: {e}")))?;
        Ok(env)
    }

    /// Parse a mutation-batch payload.
    pub fn mutation_batch(&self) -> Result<Vec<Mutation>, SyncError> {
        self.expect_kind(MessageKind::Mutation)?;
        decode_body(&self.payload)
    }

    /// Parse an ack payload.
    pub fn ack_body(&self) -> Result<AckBody, SyncError> {
        self.expect_kind(MessageKind::Ack)?;
        decode_body(&self.payload)
    }

    /// Parse a resync request payload.
    pub fn resync_request_body(&self) -> Result<ResyncRequest, SyncError> {
        self.expect_kind(MessageKind::ResyncRequest)?;
        decode_body(&self.payload)
    }

    /// Parse a resync response payload.
    pub fn resync_response_body(&self) -> Result<ResyncResponse, SyncError> {
        self.expect_kind(MessageKind::ResyncResponse)?;
        decode_body(&self.payload)
    }

    fn expect_kind(&self, want: MessageKind) -> Result<(), SyncError> {
        if self.kind != want {
            return Err(SyncError::Protocol(format!(
                "expected {:?} envelope, got {:?}",
                want, self.kind
            )));
        }
        Ok(())
    }
}

/// Encode a body struct. Plain serde structs cannot fail to encode; an
/// empty payload on the impossible path decodes into a protocol error on
/// the receiving side rather than a panic here.
pub(crate) fn encode_body<T: Serialize>(body: &T) -> Vec<u8> {
    bincode::serde::encode_to_vec(body, bincode::config::standard()).unwrap_or_default()
}

/// Decode a body struct, mapping failures into the protocol error class.
pub(crate) fn decode_body<T: for<'de> Deserialize<'de>>(bytes: &[u8]) -> Result<T, SyncError> {
    let (body, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
        .map_err(|e| SyncError::Protocol(format!("body decode: {e}")))?;
    Ok(body)
}
