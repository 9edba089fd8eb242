//! Reference sync server with project-based routing.
//!
//! Architecture:
//! ```text
//! Session A ──┐
//!              ├── ProjectSpace (project_id)
//! Session B ──┘        │
//!                      ├── CollectionLog per collection
//!                      │     ├── server_seq counter (dense, per collection)
//!                      │     ├── stamped history (optionally bounded)
//!                      │     └── live entity map (full snapshots)
//!                      ├── roster (presence replay on resync)
//!                      ├── session_progress (local_seq dedup watermarks)
//!                      └── PeerFanout
//!                            │
//!                 ┌──────────┼──────────┐
//!                 ▼          ▼          ▼
//!             Session A  Session B  Session C
//! ```
//!
//! The server is the single stamping authority: it assigns each accepted
//! mutation a dense per-collection `server_seq` and fans the stamped copy
//! out to every project member, origin included, so the origin learns its
//! stamp from the same frame everyone else converges on. Batches are
//! answered with an ack carrying the session's processed-`local_seq`
//! watermark, which also makes client retransmits harmless.
//!
//! State is in memory only. A project space is dropped when its last
//! session leaves; a client that held a higher watermark than a fresh
//! space is told to reset via the resync path.
//!
//! Reference: Kleppmann — Designing Data-Intensive Applications, Chapter 5

use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::RwLock;
use tokio_tungstenite::tungstenite::Message;

use crate::broadcast::{BroadcastFrame, PeerFanout};
use crate::collections::{standard_collections, CollectionKind};
use crate::error::SyncError;
use crate::presence::{now_ms, HeartbeatBody, PresenceBody, PresenceStatus};
use crate::protocol::{
    CollectionCatchUp, CollectionId, Envelope, EntityId, MessageKind, Mutation, ProjectId,
    ResyncRequest, ResyncResponse, SessionId, UserInfo,
};

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to.
    pub bind_addr: String,
    /// Maximum sessions per project space.
    pub max_sessions_per_project: usize,
    /// Fan-out channel capacity per project.
    pub broadcast_capacity: usize,
    /// Stamped mutations retained per collection for delta resync.
    /// `None` keeps everything for the server's lifetime.
    pub history_limit: Option<usize>,
    /// Collections every project space starts with.
    pub collections: Vec<(CollectionId, CollectionKind)>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:3000".to_string(),
            max_sessions_per_project: 100,
            broadcast_capacity: 256,
            history_limit: None,
            collections: standard_collections(),
        }
    }
}

impl ServerConfig {
    /// Defaults overlaid with `ARXIS_*` environment variables.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(v) = std::env::var("ARXIS_BIND_ADDR") {
            config.bind_addr = v;
        }
        if let Ok(v) = std::env::var("ARXIS_HISTORY_LIMIT") {
            config.history_limit = v.parse().ok();
        }
        if let Ok(v) = std::env::var("ARXIS_MAX_SESSIONS_PER_PROJECT") {
            config.max_sessions_per_project = v.parse().unwrap_or(config.max_sessions_per_project);
        }
        config
    }
}

/// Server statistics snapshot.
#[derive(Debug, Clone, Default)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub total_messages: u64,
    pub total_bytes: u64,
    pub mutations_stamped: u64,
    pub resyncs_served: u64,
    pub active_projects: usize,
}

/// Counters on the message path are atomics; no lock is taken to count.
struct AtomicServerStats {
    total_connections: AtomicU64,
    active_connections: AtomicU64,
    total_messages: AtomicU64,
    total_bytes: AtomicU64,
    mutations_stamped: AtomicU64,
    resyncs_served: AtomicU64,
}

impl AtomicServerStats {
    fn new() -> Self {
        Self {
            total_connections: AtomicU64::new(0),
            active_connections: AtomicU64::new(0),
            total_messages: AtomicU64::new(0),
            total_bytes: AtomicU64::new(0),
            mutations_stamped: AtomicU64::new(0),
            resyncs_served: AtomicU64::new(0),
        }
    }

    fn snapshot(&self, active_projects: usize) -> ServerStats {
        ServerStats {
            total_connections: self.total_connections.load(Ordering::Relaxed),
            active_connections: self.active_connections.load(Ordering::Relaxed),
            total_messages: self.total_messages.load(Ordering::Relaxed),
            total_bytes: self.total_bytes.load(Ordering::Relaxed),
            mutations_stamped: self.mutations_stamped.load(Ordering::Relaxed),
            resyncs_served: self.resyncs_served.load(Ordering::Relaxed),
            active_projects,
        }
    }
}

// ───────────────────────────────────────────────────────────────────
// Collection log
// ───────────────────────────────────────────────────────────────────

/// One collection's authoritative server-side state.
struct CollectionLog {
    kind: CollectionKind,
    last_seq: u64,
    /// Stamped mutations in ascending `server_seq`, trimmed to
    /// `history_limit` from the front.
    history: VecDeque<Mutation>,
    /// Latest stamped record per live entity; deletes remove entries.
    live: HashMap<EntityId, Mutation>,
    history_limit: Option<usize>,
}

impl CollectionLog {
    fn new(kind: CollectionKind, history_limit: Option<usize>) -> Self {
        Self {
            kind,
            last_seq: 0,
            history: VecDeque::new(),
            live: HashMap::new(),
            history_limit,
        }
    }

    /// Shape check mirroring the client's, for traffic that bypassed it.
    fn validate(&self, mutation: &Mutation) -> Result<(), SyncError> {
        if mutation.entity.is_empty() {
            return Err(SyncError::SchemaViolation {
                collection: mutation.collection.clone(),
                detail: "empty entity id".into(),
            });
        }
        if !self.kind.permits(mutation.op) {
            return Err(SyncError::SchemaViolation {
                collection: mutation.collection.clone(),
                detail: format!("{} not permitted on append-only collection", mutation.op.as_str()),
            });
        }
        if mutation.op.is_delete() {
            if !mutation.payload.is_empty() {
                return Err(SyncError::SchemaViolation {
                    collection: mutation.collection.clone(),
                    detail: "delete carries no payload".into(),
                });
            }
        } else if mutation.payload.is_empty() {
            return Err(SyncError::SchemaViolation {
                collection: mutation.collection.clone(),
                detail: "empty payload".into(),
            });
        }
        Ok(())
    }

    /// Assign the next dense stamp and fold the mutation into history and
    /// the live map.
    fn stamp(&mut self, mutation: &Mutation) -> Mutation {
        self.last_seq += 1;
        let stamped = mutation.stamped(self.last_seq);

        self.history.push_back(stamped.clone());
        if let Some(limit) = self.history_limit {
            while self.history.len() > limit {
                self.history.pop_front();
            }
        }

        if stamped.op.is_delete() {
            self.live.remove(&stamped.entity);
        } else {
            self.live.insert(stamped.entity.clone(), stamped.clone());
        }
        stamped
    }

    /// Everything after `watermark` from retained history, or `None` when
    /// the delta cannot be served: either history was trimmed past the
    /// requested range, or the client claims a watermark this log has never
    /// issued (state lost with a dropped project space). Both cases mean
    /// the client must reset from a full snapshot.
    fn since(&self, watermark: u64) -> Option<Vec<Mutation>> {
        if watermark > self.last_seq {
            return None;
        }
        if watermark == self.last_seq {
            return Some(Vec::new());
        }
        let oldest = self.history.front().and_then(|m| m.server_seq)?;
        if watermark + 1 < oldest {
            return None;
        }
        Some(
            self.history
                .iter()
                .filter(|m| m.server_seq.unwrap_or(0) > watermark)
                .cloned()
                .collect(),
        )
    }

    /// Full live snapshot in ascending stamp order, for reset catch-ups.
    fn snapshot(&self) -> Vec<Mutation> {
        let mut records: Vec<Mutation> = self.live.values().cloned().collect();
        records.sort_by_key(|m| m.server_seq);
        records
    }
}

// ───────────────────────────────────────────────────────────────────
// Project space
// ───────────────────────────────────────────────────────────────────

/// What the server remembers about one member for roster replay.
struct RosterState {
    user: UserInfo,
    status: PresenceStatus,
    location: String,
    at_ms: u64,
    in_voice: bool,
}

/// All shared state for one project.
struct ProjectSpace {
    logs: HashMap<CollectionId, CollectionLog>,
    fanout: Arc<PeerFanout>,
    roster: HashMap<SessionId, RosterState>,
    /// Highest processed `local_seq` per session; retransmits at or below
    /// it are skipped.
    session_progress: HashMap<SessionId, u64>,
}

impl ProjectSpace {
    fn new(config: &ServerConfig) -> Self {
        let logs = config
            .collections
            .iter()
            .map(|(id, kind)| (id.clone(), CollectionLog::new(*kind, config.history_limit)))
            .collect();
        Self {
            logs,
            fanout: Arc::new(PeerFanout::new(config.broadcast_capacity)),
            roster: HashMap::new(),
            session_progress: HashMap::new(),
        }
    }
}

// ───────────────────────────────────────────────────────────────────
// Server
// ───────────────────────────────────────────────────────────────────

/// The sync server.
pub struct SyncServer {
    config: ServerConfig,
    projects: Arc<RwLock<HashMap<ProjectId, ProjectSpace>>>,
    stats: Arc<AtomicServerStats>,
}

impl SyncServer {
    pub fn new(config: ServerConfig) -> Self {
        Self {
            config,
            projects: Arc::new(RwLock::new(HashMap::new())),
            stats: Arc::new(AtomicServerStats::new()),
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(ServerConfig::default())
    }

    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }

    pub async fn stats(&self) -> ServerStats {
        let projects = self.projects.read().await;
        self.stats.snapshot(projects.len())
    }

    /// Accept loop. Runs until the task is aborted or the listener fails.
    pub async fn run(&self) -> Result<(), Box<dyn std::error::Error>> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        log::info!("sync server listening on {}", self.config.bind_addr);

        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("new tcp connection from {addr}");

            let projects = self.projects.clone();
            let stats = self.stats.clone();
            let config = self.config.clone();
            tokio::spawn(async move {
                if let Err(e) = Self::handle_connection(stream, addr, projects, stats, config).await
                {
                    log::error!("connection error from {addr}: {e}");
                }
            });
        }
    }

    /// One task per connection: demultiplex inbound envelopes, forward the
    /// project fan-out, clean up membership on exit.
    async fn handle_connection(
        stream: TcpStream,
        addr: SocketAddr,
        projects: Arc<RwLock<HashMap<ProjectId, ProjectSpace>>>,
        stats: Arc<AtomicServerStats>,
        config: ServerConfig,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let ws_stream = tokio_tungstenite::accept_async(stream).await?;
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();

        log::info!("websocket connection established from {addr}");
        stats.total_connections.fetch_add(1, Ordering::Relaxed);
        stats.active_connections.fetch_add(1, Ordering::Relaxed);

        // Bound on the first envelope; all routing uses these, not the
        // per-envelope fields, so a session cannot wander across projects.
        let mut bound: Option<(ProjectId, SessionId)> = None;
        let mut fanout_rx: Option<tokio::sync::broadcast::Receiver<BroadcastFrame>> = None;
        let mut fanout: Option<Arc<PeerFanout>> = None;

        // Every exit from the serve loop, clean close or failed write,
        // falls through to the membership teardown below. A client whose
        // socket dies mid-send must still leave the roster it joined.
        let served: Result<(), Box<dyn std::error::Error + Send + Sync>> = async {
            loop {
                tokio::select! {
                    msg = ws_receiver.next() => {
                        match msg {
                            Some(Ok(Message::Binary(data))) => {
                                let bytes: Vec<u8> = data.into();
                                stats.total_messages.fetch_add(1, Ordering::Relaxed);
                                stats.total_bytes.fetch_add(bytes.len() as u64, Ordering::Relaxed);

                                let envelope = match Envelope::decode(&bytes) {
                                    Ok(envelope) => envelope,
                                    Err(e) => {
                                        log::warn!("dropping undecodable frame from {addr}: {e}");
                                        continue;
                                    }
                                };

                                if bound.is_none() {
                                    let user = first_envelope_user(&envelope);
                                    let mut projects_w = projects.write().await;
                                    let space = projects_w
                                        .entry(envelope.project)
                                        .or_insert_with(|| ProjectSpace::new(&config));
                                    if space.fanout.occupancy().await >= config.max_sessions_per_project {
                                        log::warn!(
                                            "project {} full, refusing session {}",
                                            envelope.project, envelope.session
                                        );
                                        break;
                                    }
                                    fanout_rx = Some(space.fanout.join(envelope.session, user).await);
                                    fanout = Some(space.fanout.clone());
                                    bound = Some((envelope.project, envelope.session));
                                    log::info!(
                                        "session {} bound to project {}",
                                        envelope.session, envelope.project
                                    );
                                }
                                let (project, session) = match bound {
                                    Some(b) => b,
                                    None => break,
                                };

                                match envelope.kind {
                                    MessageKind::Mutation => {
                                        let batch = match envelope.mutation_batch() {
                                            Ok(batch) => batch,
                                            Err(e) => {
                                                log::warn!("dropping malformed batch from {session}: {e}");
                                                continue;
                                            }
                                        };

                                        let (stamped, watermark) = {
                                            let mut projects_w = projects.write().await;
                                            match projects_w.get_mut(&project) {
                                                Some(space) => stamp_batch(space, session, batch),
                                                None => continue,
                                            }
                                        };

                                        if !stamped.is_empty() {
                                            stats
                                                .mutations_stamped
                                                .fetch_add(stamped.len() as u64, Ordering::Relaxed);
                                            let frame = Envelope::mutations(project, session, &stamped)
                                                .encode()?;
                                            if let Some(ref fanout) = fanout {
                                                fanout.publish(
                                                    MessageKind::Mutation,
                                                    session,
                                                    Arc::new(frame),
                                                );
                                            }
                                        }

                                        let ack = Envelope::ack(project, session, watermark).encode()?;
                                        ws_sender.send(Message::Binary(ack.into())).await?;
                                    }

                                    MessageKind::Presence => {
                                        let body = match PresenceBody::decode(&envelope.payload) {
                                            Ok(body) => body,
                                            Err(e) => {
                                                log::warn!("dropping malformed presence from {session}: {e}");
                                                continue;
                                            }
                                        };
                                        {
                                            let mut projects_w = projects.write().await;
                                            if let Some(space) = projects_w.get_mut(&project) {
                                                note_presence(space, session, &body);
                                            }
                                        }
                                        if let Some(ref fanout) = fanout {
                                            fanout.publish(MessageKind::Presence, session, Arc::new(bytes));
                                        }
                                    }

                                    MessageKind::Heartbeat => {
                                        if let Ok(hb) = HeartbeatBody::decode(&envelope.payload) {
                                            let mut projects_w = projects.write().await;
                                            if let Some(space) = projects_w.get_mut(&project) {
                                                if let Some(entry) = space.roster.get_mut(&session) {
                                                    if hb.sent_at_ms > entry.at_ms {
                                                        entry.at_ms = hb.sent_at_ms;
                                                        entry.location = hb.location.clone();
                                                    }
                                                }
                                            }
                                        }
                                        if let Some(ref fanout) = fanout {
                                            fanout.publish(MessageKind::Heartbeat, session, Arc::new(bytes));
                                        }
                                    }

                                    MessageKind::ResyncRequest => {
                                        let request = match envelope.resync_request_body() {
                                            Ok(request) => request,
                                            Err(e) => {
                                                log::warn!("dropping malformed resync request from {session}: {e}");
                                                continue;
                                            }
                                        };

                                        let frames = {
                                            let projects_r = projects.read().await;
                                            match projects_r.get(&project) {
                                                Some(space) => {
                                                    build_resync_reply(space, project, session, &request)?
                                                }
                                                None => continue,
                                            }
                                        };
                                        stats.resyncs_served.fetch_add(1, Ordering::Relaxed);
                                        for frame in frames {
                                            ws_sender.send(Message::Binary(frame.into())).await?;
                                        }
                                    }

                                    MessageKind::Ack | MessageKind::ResyncResponse => {
                                        log::debug!("ignoring server-bound {:?} from {session}", envelope.kind);
                                    }
                                }
                            }

                            Some(Ok(Message::Close(_))) | None => {
                                log::info!("connection closed from {addr}");
                                break;
                            }

                            Some(Ok(Message::Ping(data))) => {
                                ws_sender.send(Message::Pong(data)).await?;
                            }

                            Some(Err(e)) => {
                                log::warn!("websocket error from {addr}: {e}");
                                break;
                            }

                            _ => {}
                        }
                    }

                    frame = recv_fanout(&mut fanout_rx) => {
                        match frame {
                            Ok(frame) => {
                                if let Some((_, session)) = bound {
                                    if frame.skips_origin() && frame.origin == session {
                                        continue;
                                    }
                                }
                                ws_sender.send(Message::Binary(frame.bytes.to_vec().into())).await?;
                            }
                            Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                                if let Some(ref fanout) = fanout {
                                    fanout.note_lagged(n);
                                }
                                log::warn!("session {bound:?} lagged by {n} frames");
                            }
                            Err(_) => break,
                        }
                    }
                }
            }
            Ok(())
        }
        .await;

        if let Some((project, session)) = bound {
            let mut projects_w = projects.write().await;
            if let Some(space) = projects_w.get_mut(&project) {
                space.fanout.leave(&session).await;
                if let Some(state) = space.roster.remove(&session) {
                    let leave = PresenceBody::Leave {
                        user_id: state.user.id,
                        at_ms: now_ms(),
                    };
                    match Envelope::presence(project, session, leave.encode()).encode() {
                        Ok(frame) => {
                            space.fanout.publish(MessageKind::Presence, session, Arc::new(frame));
                        }
                        Err(e) => log::error!("leave announcement for {session} failed: {e}"),
                    }
                }

                if space.fanout.occupancy().await == 0 {
                    projects_w.remove(&project);
                    log::info!("project {project} removed (empty)");
                }
            }
        }
        stats.active_connections.fetch_sub(1, Ordering::Relaxed);

        served
    }
}

/// Await the project fan-out, or park forever until the session is bound.
async fn recv_fanout(
    rx: &mut Option<tokio::sync::broadcast::Receiver<BroadcastFrame>>,
) -> Result<BroadcastFrame, tokio::sync::broadcast::error::RecvError> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

/// Identity for the fan-out membership at bind time. The usual first
/// envelope is a presence join carrying the real identity; anything else
/// gets a placeholder until the join arrives.
fn first_envelope_user(envelope: &Envelope) -> UserInfo {
    if envelope.kind == MessageKind::Presence {
        if let Ok(PresenceBody::Join { user, .. }) = PresenceBody::decode(&envelope.payload) {
            return user;
        }
    }
    UserInfo::new(format!("session-{}", &envelope.session.0.to_string()[..8]))
}

/// Stamp one inbound batch: skip replays at or below the session's
/// progress watermark, drop schema violations, stamp and fold the rest.
/// Returns the stamped mutations and the session's new watermark.
fn stamp_batch(
    space: &mut ProjectSpace,
    session: SessionId,
    batch: Vec<Mutation>,
) -> (Vec<Mutation>, u64) {
    let progress = space.session_progress.entry(session).or_insert(0);
    let mut stamped = Vec::new();

    for mutation in batch {
        if mutation.local_seq <= *progress {
            log::trace!(
                "skipping replayed local_seq {} from {session}",
                mutation.local_seq
            );
            continue;
        }
        // Considered means processed: the watermark advances even for
        // rejects, otherwise the client would retransmit them forever.
        *progress = mutation.local_seq;

        let log = match space.logs.get_mut(&mutation.collection) {
            Some(log) => log,
            None => {
                log::warn!("dropping mutation for unknown collection '{}'", mutation.collection);
                continue;
            }
        };
        if let Err(e) = log.validate(&mutation) {
            log::warn!("dropping invalid mutation from {session}: {e}");
            continue;
        }
        stamped.push(log.stamp(&mutation));
    }

    (stamped, *progress)
}

/// Fold a presence body into the server-side roster.
fn note_presence(space: &mut ProjectSpace, session: SessionId, body: &PresenceBody) {
    match body {
        PresenceBody::Join {
            user,
            status,
            location,
            at_ms,
        } => {
            space.roster.insert(
                session,
                RosterState {
                    user: user.clone(),
                    status: *status,
                    location: location.clone(),
                    at_ms: *at_ms,
                    in_voice: false,
                },
            );
        }
        PresenceBody::Leave { .. } => {
            space.roster.remove(&session);
        }
        PresenceBody::Status { status, at_ms, .. } => {
            if let Some(entry) = space.roster.get_mut(&session) {
                entry.status = *status;
                entry.at_ms = (*at_ms).max(entry.at_ms);
            }
        }
        PresenceBody::VoiceJoined { .. } => {
            if let Some(entry) = space.roster.get_mut(&session) {
                entry.in_voice = true;
            }
        }
        PresenceBody::VoiceLeft { .. } => {
            if let Some(entry) = space.roster.get_mut(&session) {
                entry.in_voice = false;
            }
        }
    }
}

/// Assemble the frames answering one resync request: roster replay first,
/// then per-collection catch-up blocks plus the session's ack watermark.
fn build_resync_reply(
    space: &ProjectSpace,
    project: ProjectId,
    session: SessionId,
    request: &ResyncRequest,
) -> Result<Vec<Vec<u8>>, SyncError> {
    let mut frames = Vec::new();

    for (other, state) in space.roster.iter() {
        if *other == session {
            continue;
        }
        let join = PresenceBody::Join {
            user: state.user.clone(),
            status: state.status,
            location: state.location.clone(),
            at_ms: state.at_ms,
        };
        frames.push(Envelope::presence(project, *other, join.encode()).encode()?);
        if state.in_voice {
            let voice = PresenceBody::VoiceJoined {
                user_id: state.user.id,
                at_ms: state.at_ms,
            };
            frames.push(Envelope::presence(project, *other, voice.encode()).encode()?);
        }
    }

    let mut blocks = Vec::new();
    for watermark in &request.watermarks {
        let log = match space.logs.get(&watermark.collection) {
            Some(log) => log,
            None => {
                log::warn!("resync request names unknown collection '{}'", watermark.collection);
                continue;
            }
        };
        let forced_full = request.full.contains(&watermark.collection);
        let block = if forced_full {
            CollectionCatchUp {
                collection: watermark.collection.clone(),
                reset: true,
                mutations: log.snapshot(),
            }
        } else {
            match log.since(watermark.last_applied) {
                Some(delta) => CollectionCatchUp {
                    collection: watermark.collection.clone(),
                    reset: false,
                    mutations: delta,
                },
                None => {
                    log::info!(
                        "collection '{}': watermark {} unserviceable, sending reset snapshot",
                        watermark.collection,
                        watermark.last_applied
                    );
                    CollectionCatchUp {
                        collection: watermark.collection.clone(),
                        reset: true,
                        mutations: log.snapshot(),
                    }
                }
            }
        };
        blocks.push(block);
    }

    let response = ResyncResponse {
        collections: blocks,
        acked_local_seq: space.session_progress.get(&session).copied().unwrap_or(0),
    };
    frames.push(Envelope::resync_response(project, session, &response).encode()?);
    Ok(frames)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::OpKind;

    fn mutation(entity: &str, op: OpKind, local_seq: u64) -> Mutation {
        Mutation {
            collection: CollectionId::new("annotations"),
            op,
            entity: EntityId::new(entity),
            payload: if op.is_delete() { Vec::new() } else { vec![7; 4] },
            local_seq,
            origin: SessionId::generate(),
            server_seq: None,
        }
    }

    #[test]
    fn test_server_config_default() {
        let config = ServerConfig::default();
        assert_eq!(config.bind_addr, "127.0.0.1:3000");
        assert_eq!(config.max_sessions_per_project, 100);
        assert_eq!(config.broadcast_capacity, 256);
        assert!(config.history_limit.is_none());
        assert_eq!(config.collections.len(), standard_collections().len());
    }

    #[test]
    fn test_server_creation() {
        let server = SyncServer::with_defaults();
        assert_eq!(server.bind_addr(), "127.0.0.1:3000");
    }

    #[tokio::test]
    async fn test_server_stats_initial() {
        let server = SyncServer::with_defaults();
        let stats = server.stats().await;
        assert_eq!(stats.total_connections, 0);
        assert_eq!(stats.active_connections, 0);
        assert_eq!(stats.total_messages, 0);
        assert_eq!(stats.mutations_stamped, 0);
        assert_eq!(stats.resyncs_served, 0);
        assert_eq!(stats.active_projects, 0);
    }

    #[test]
    fn test_log_stamps_densely() {
        let mut log = CollectionLog::new(CollectionKind::KeyedRecords, None);
        let a = log.stamp(&mutation("a", OpKind::Insert, 1));
        let b = log.stamp(&mutation("b", OpKind::Insert, 2));
        assert_eq!(a.server_seq, Some(1));
        assert_eq!(b.server_seq, Some(2));
        assert_eq!(log.last_seq, 2);
    }

    #[test]
    fn test_log_since_serves_delta() {
        let mut log = CollectionLog::new(CollectionKind::KeyedRecords, None);
        for seq in 1..=5 {
            log.stamp(&mutation(&format!("e{seq}"), OpKind::Insert, seq));
        }

        let delta = log.since(3).unwrap();
        assert_eq!(delta.len(), 2);
        assert_eq!(delta[0].server_seq, Some(4));

        assert!(log.since(5).unwrap().is_empty());
    }

    #[test]
    fn test_log_since_detects_trimmed_history() {
        let mut log = CollectionLog::new(CollectionKind::KeyedRecords, Some(2));
        for seq in 1..=5 {
            log.stamp(&mutation(&format!("e{seq}"), OpKind::Insert, seq));
        }

        // Only stamps 4 and 5 are retained; a watermark of 1 needs 2.
        assert!(log.since(1).is_none());
        assert_eq!(log.since(3).unwrap().len(), 2);
    }

    #[test]
    fn test_log_since_detects_future_watermark() {
        let mut log = CollectionLog::new(CollectionKind::KeyedRecords, None);
        log.stamp(&mutation("a", OpKind::Insert, 1));
        // A client claiming more history than this log has issued must be
        // reset; this is the dropped-project-space case.
        assert!(log.since(9).is_none());
    }

    #[test]
    fn test_log_snapshot_is_live_entities_in_stamp_order() {
        let mut log = CollectionLog::new(CollectionKind::KeyedRecords, Some(1));
        log.stamp(&mutation("a", OpKind::Insert, 1));
        log.stamp(&mutation("b", OpKind::Insert, 2));
        log.stamp(&mutation("a", OpKind::Delete, 3));
        log.stamp(&mutation("c", OpKind::Insert, 4));

        let snapshot = log.snapshot();
        let ids: Vec<&str> = snapshot.iter().map(|m| m.entity.as_str()).collect();
        assert_eq!(ids, vec!["b", "c"]);
        // Snapshot survives history trimming; it reads the live map.
        assert_eq!(snapshot[1].server_seq, Some(4));
    }

    #[test]
    fn test_stamp_batch_skips_replays_and_rejects() {
        let config = ServerConfig::default();
        let mut space = ProjectSpace::new(&config);
        let session = SessionId::generate();

        let (stamped, watermark) = stamp_batch(
            &mut space,
            session,
            vec![
                mutation("a", OpKind::Insert, 1),
                mutation("", OpKind::Insert, 2),
                mutation("b", OpKind::Insert, 3),
            ],
        );
        assert_eq!(stamped.len(), 2);
        // The schema reject still advanced the watermark.
        assert_eq!(watermark, 3);

        // A straight retransmit stamps nothing but reports the watermark.
        let (stamped, watermark) = stamp_batch(
            &mut space,
            session,
            vec![mutation("a", OpKind::Insert, 1), mutation("b", OpKind::Insert, 3)],
        );
        assert!(stamped.is_empty());
        assert_eq!(watermark, 3);
    }

    #[test]
    fn test_note_presence_tracks_roster() {
        let config = ServerConfig::default();
        let mut space = ProjectSpace::new(&config);
        let session = SessionId::generate();
        let user = UserInfo::new("Ada");

        note_presence(
            &mut space,
            session,
            &PresenceBody::Join {
                user: user.clone(),
                status: PresenceStatus::Online,
                location: "Level 1".into(),
                at_ms: 10,
            },
        );
        note_presence(&mut space, session, &PresenceBody::VoiceJoined { user_id: user.id, at_ms: 11 });
        assert!(space.roster.get(&session).unwrap().in_voice);

        note_presence(&mut space, session, &PresenceBody::Leave { user_id: user.id, at_ms: 12 });
        assert!(space.roster.is_empty());
    }

    #[test]
    fn test_resync_reply_contains_roster_and_response() {
        let config = ServerConfig::default();
        let mut space = ProjectSpace::new(&config);
        let project = ProjectId::generate();
        let me = SessionId::generate();
        let other = SessionId::generate();

        note_presence(
            &mut space,
            other,
            &PresenceBody::Join {
                user: UserInfo::new("Grace"),
                status: PresenceStatus::Busy,
                location: "Roof".into(),
                at_ms: 44,
            },
        );
        space.session_progress.insert(me, 7);

        let request = ResyncRequest {
            watermarks: vec![crate::protocol::CollectionWatermark {
                collection: CollectionId::new("annotations"),
                last_applied: 0,
            }],
            last_ack_seq: 5,
            full: Vec::new(),
        };
        let frames = build_resync_reply(&space, project, me, &request).unwrap();
        // One roster join plus the response itself.
        assert_eq!(frames.len(), 2);

        let first = Envelope::decode(&frames[0]).unwrap();
        assert_eq!(first.kind, MessageKind::Presence);
        let last = Envelope::decode(frames.last().unwrap()).unwrap();
        let response = last.resync_response_body().unwrap();
        assert_eq!(response.acked_local_seq, 7);
        assert_eq!(response.collections.len(), 1);
        assert!(!response.collections[0].reset);
    }

    #[test]
    fn test_resync_reply_resets_unserviceable_watermark() {
        let config = ServerConfig {
            history_limit: Some(1),
            ..ServerConfig::default()
        };
        let mut space = ProjectSpace::new(&config);
        let project = ProjectId::generate();
        let session = SessionId::generate();

        {
            let log = space.logs.get_mut(&CollectionId::new("annotations")).unwrap();
            for seq in 1..=4 {
                log.stamp(&mutation(&format!("e{seq}"), OpKind::Insert, seq));
            }
        }

        let request = ResyncRequest {
            watermarks: vec![crate::protocol::CollectionWatermark {
                collection: CollectionId::new("annotations"),
                last_applied: 1,
            }],
            last_ack_seq: 0,
            full: Vec::new(),
        };
        let frames = build_resync_reply(&space, project, session, &request).unwrap();
        let last = Envelope::decode(frames.last().unwrap()).unwrap();
        let response = last.resync_response_body().unwrap();
        assert!(response.collections[0].reset);
        // The reset block carries the live snapshot, all four entities.
        assert_eq!(response.collections[0].mutations.len(), 4);
    }

    #[test]
    fn test_resync_reply_honors_full_snapshot_request() {
        let config = ServerConfig::default();
        let mut space = ProjectSpace::new(&config);
        let project = ProjectId::generate();
        let session = SessionId::generate();

        {
            let log = space.logs.get_mut(&CollectionId::new("annotations")).unwrap();
            for seq in 1..=3 {
                log.stamp(&mutation(&format!("e{seq}"), OpKind::Insert, seq));
            }
        }

        // The watermark is current; only the explicit request forces the
        // reset snapshot.
        let request = ResyncRequest {
            watermarks: vec![crate::protocol::CollectionWatermark {
                collection: CollectionId::new("annotations"),
                last_applied: 3,
            }],
            last_ack_seq: 0,
            full: vec![CollectionId::new("annotations")],
        };
        let frames = build_resync_reply(&space, project, session, &request).unwrap();
        let last = Envelope::decode(frames.last().unwrap()).unwrap();
        let response = last.resync_response_body().unwrap();
        assert!(response.collections[0].reset);
        assert_eq!(response.collections[0].mutations.len(), 3);

        // The same watermark without the full request is an empty delta.
        let request = ResyncRequest {
            watermarks: vec![crate::protocol::CollectionWatermark {
                collection: CollectionId::new("annotations"),
                last_applied: 3,
            }],
            last_ack_seq: 0,
            full: Vec::new(),
        };
        let frames = build_resync_reply(&space, project, session, &request).unwrap();
        let last = Envelope::decode(frames.last().unwrap()).unwrap();
        let response = last.resync_response_body().unwrap();
        assert!(!response.collections[0].reset);
        assert!(response.collections[0].mutations.is_empty());
    }
}
