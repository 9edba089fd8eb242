//! The collaborative session: one owner task per project connection.
//!
//! ```text
//!        CollabSession (cloneable-ish handle, oneshot replies)
//!              │ mpsc commands                ▲ broadcast SessionEvents
//!              ▼                              │
//!        ┌─────────────────────────────────────────────┐
//!        │            session owner task               │
//!        │  select! over:                              │
//!        │   • command channel                         │
//!        │   • transport inbound frames                │
//!        │   • flush tick        (1000 / sync_rate ms) │
//!        │   • heartbeat tick    (send + sweep)        │
//!        │   • single retry timer                      │
//!        │   • resync deadline                         │
//!        └─────────────────────────────────────────────┘
//!              │ owns: Sequencer, Synchronizer, OutboundQueue,
//!              │       FlushMonitor, Backoff, PresenceTracker, link
//!              ▼
//!        TransportLink (WebSocket reader/writer tasks)
//! ```
//!
//! Every mutation application, presence update, and state transition is
//! serialized through this task; the public API crosses in via message
//! passing, never shared locks. Local mutate and query commands complete
//! against in-memory state without touching the network.
//!
//! Reconnection keeps the session identity: the server deduplicates
//! retransmits by `local_seq` watermark, so the queue survives a drop
//! untouched. Only a user-triggered connect from terminal disconnect
//! rotates the session id, renumbering pending mutations in order.
//!
//! Reference: Kleppmann — DDIA, Chapter 8 (the trouble with distributed
//! systems); the design leans on acknowledgment watermarks end to end.

use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{interval, Instant, MissedTickBehavior};

use crate::clock::Sequencer;
use crate::collections::{ChangeEvent, ChangeSource, CollectionKind, EntityRecord, Synchronizer};
use crate::config::SyncConfig;
use crate::error::SyncError;
use crate::presence::{
    now_ms, HeartbeatBody, PresenceBody, PresenceEntry, PresenceEvent, PresenceStatus,
    PresenceTracker,
};
use crate::protocol::{
    CollectionId, EntityId, Envelope, MessageKind, Mutation, OpKind, ProjectId, ResyncRequest,
    SessionId, UserInfo,
};
use crate::reconnect::Backoff;
use crate::scheduler::{FlushMonitor, FlushSignal, OutboundQueue};
use crate::transport::{ConnectionState, TransportLink};

/// Commands buffered between API callers and the owner task.
const COMMAND_BUFFER: usize = 64;
/// Event fan-out capacity; lagging panels re-read snapshots.
const EVENT_CHANNEL_CAPACITY: usize = 256;

// ───────────────────────────────────────────────────────────────────
// Events and stats
// ───────────────────────────────────────────────────────────────────

/// Session-level notifications for UI-facing collaborators.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    /// Connection lifecycle. `attempt` is the reconnect attempt count,
    /// zero outside of reconnection.
    ConnectionChanged { state: ConnectionState, attempt: u32 },
    /// The outbound queue stayed non-empty past the configured tick count.
    SyncDegraded { pending: usize },
    SyncRecovered,
    Presence(PresenceEvent),
    /// A resync completed and local state is caught up.
    Resynced {
        collections: usize,
        reset_collections: usize,
    },
}

/// Point-in-time session counters.
#[derive(Debug, Clone)]
pub struct SessionStats {
    pub state: ConnectionState,
    pub session: SessionId,
    pub pending_mutations: usize,
    pub pending_bytes: usize,
    pub last_local_seq: u64,
    pub last_ack_seq: u64,
    pub reconnect_attempt: u32,
    pub sync_degraded: bool,
    pub roster_size: usize,
}

// ───────────────────────────────────────────────────────────────────
// Commands
// ───────────────────────────────────────────────────────────────────

enum SessionCommand {
    Connect {
        reply: oneshot::Sender<Result<(), SyncError>>,
    },
    Disconnect {
        reply: oneshot::Sender<()>,
    },
    MutateLocal {
        collection: CollectionId,
        op: OpKind,
        entity: EntityId,
        payload: Vec<u8>,
        reply: oneshot::Sender<Result<u64, SyncError>>,
    },
    Snapshot {
        collection: CollectionId,
        reply: oneshot::Sender<Result<Vec<(EntityId, EntityRecord)>, SyncError>>,
    },
    Subscribe {
        collection: CollectionId,
        reply: oneshot::Sender<Result<broadcast::Receiver<ChangeEvent>, SyncError>>,
    },
    Refresh {
        collections: Vec<CollectionId>,
        reply: oneshot::Sender<Result<(), SyncError>>,
    },
    RegisterCollection {
        id: CollectionId,
        kind: CollectionKind,
        reply: oneshot::Sender<()>,
    },
    ListPresence {
        reply: oneshot::Sender<Vec<PresenceEntry>>,
    },
    GetState {
        reply: oneshot::Sender<ConnectionState>,
    },
    SetStatus {
        status: PresenceStatus,
        reply: oneshot::Sender<()>,
    },
    SetViewLocation {
        location: String,
        reply: oneshot::Sender<()>,
    },
    JoinVoice {
        reply: oneshot::Sender<Result<(), SyncError>>,
    },
    LeaveVoice {
        reply: oneshot::Sender<Result<(), SyncError>>,
    },
    Stats {
        reply: oneshot::Sender<SessionStats>,
    },
    Shutdown,
}

// ───────────────────────────────────────────────────────────────────
// Public handle
// ───────────────────────────────────────────────────────────────────

/// Handle to a running session task.
///
/// Dropping the handle closes the command channel, which stops the owner
/// task and tears down any live connection.
pub struct CollabSession {
    commands: mpsc::Sender<SessionCommand>,
    events: broadcast::Sender<SessionEvent>,
    task: JoinHandle<()>,
}

impl CollabSession {
    /// Validate the configuration and spawn the owner task. The session
    /// starts in `Disconnected`; call [`CollabSession::connect`] to go live.
    pub fn spawn(
        config: SyncConfig,
        project: ProjectId,
        user: UserInfo,
    ) -> Result<Self, SyncError> {
        config.validate()?;
        let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_BUFFER);
        let (event_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let task = SessionTask::new(config, project, user, cmd_rx, event_tx.clone());
        let handle = tokio::spawn(task.run());
        Ok(Self {
            commands: cmd_tx,
            events: event_tx,
            task: handle,
        })
    }

    /// Session event stream; each call gets an independent receiver.
    pub fn events(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    /// Dial the server. Resolves once the first attempt settles: `Ok` when
    /// connected, `Err` with the dial failure otherwise (with
    /// auto-reconnect enabled the session keeps retrying in the
    /// background). From terminal disconnect this starts a fresh session
    /// id and renumbers any pending mutations.
    pub async fn connect(&self) -> Result<(), SyncError> {
        self.request(|reply| SessionCommand::Connect { reply }).await?
    }

    /// Drop the connection, cancel any pending retry, and settle in
    /// terminal `Disconnected`. Queued mutations are kept for a later
    /// connect.
    pub async fn disconnect(&self) -> Result<(), SyncError> {
        self.request(|reply| SessionCommand::Disconnect { reply }).await
    }

    /// Validate, stamp with the next `local_seq`, apply optimistically,
    /// and enqueue for the next flush tick. Returns the assigned
    /// `local_seq`.
    pub async fn mutate_local(
        &self,
        collection: CollectionId,
        op: OpKind,
        entity: EntityId,
        payload: Vec<u8>,
    ) -> Result<u64, SyncError> {
        self.request(|reply| SessionCommand::MutateLocal {
            collection,
            op,
            entity,
            payload,
            reply,
        })
        .await?
    }

    /// Render-ready snapshot: stamped records in stamp order, pending
    /// local records last.
    pub async fn snapshot(
        &self,
        collection: CollectionId,
    ) -> Result<Vec<(EntityId, EntityRecord)>, SyncError> {
        self.request(|reply| SessionCommand::Snapshot { collection, reply }).await?
    }

    /// Per-collection change feed; dropping the receiver unsubscribes.
    pub async fn subscribe(
        &self,
        collection: CollectionId,
    ) -> Result<broadcast::Receiver<ChangeEvent>, SyncError> {
        self.request(|reply| SessionCommand::Subscribe { collection, reply }).await?
    }

    /// Discard the local copies of the named collections and re-fetch
    /// them whole from the server, regardless of watermark. Completion
    /// is signalled by the next [`SessionEvent::Resynced`]; queued local
    /// mutations flush again after it.
    pub async fn refresh(&self, collections: Vec<CollectionId>) -> Result<(), SyncError> {
        self.request(|reply| SessionCommand::Refresh { collections, reply }).await?
    }

    /// Add a collection beyond the standard registry.
    pub async fn register_collection(
        &self,
        id: CollectionId,
        kind: CollectionKind,
    ) -> Result<(), SyncError> {
        self.request(|reply| SessionCommand::RegisterCollection { id, kind, reply }).await
    }

    /// Roster sorted by status priority then user id, with staleness
    /// derived at call time.
    pub async fn list_active_presence(&self) -> Result<Vec<PresenceEntry>, SyncError> {
        self.request(|reply| SessionCommand::ListPresence { reply }).await
    }

    pub async fn connection_state(&self) -> Result<ConnectionState, SyncError> {
        self.request(|reply| SessionCommand::GetState { reply }).await
    }

    /// Set our own presence status; `Busy` survives heartbeats until
    /// changed back.
    pub async fn set_status(&self, status: PresenceStatus) -> Result<(), SyncError> {
        self.request(|reply| SessionCommand::SetStatus { status, reply }).await
    }

    /// Update the free-form view location shown to other collaborators.
    pub async fn set_view_location(&self, location: impl Into<String>) -> Result<(), SyncError> {
        let location = location.into();
        self.request(|reply| SessionCommand::SetViewLocation { location, reply }).await
    }

    /// Announce voice membership. Requires the VoIP flag and a live
    /// connection; no media flows through this crate.
    pub async fn join_voice(&self) -> Result<(), SyncError> {
        self.request(|reply| SessionCommand::JoinVoice { reply }).await?
    }

    pub async fn leave_voice(&self) -> Result<(), SyncError> {
        self.request(|reply| SessionCommand::LeaveVoice { reply }).await?
    }

    pub async fn stats(&self) -> Result<SessionStats, SyncError> {
        self.request(|reply| SessionCommand::Stats { reply }).await
    }

    /// Graceful shutdown: stops the owner task and waits for it.
    pub async fn close(self) {
        let _ = self.commands.send(SessionCommand::Shutdown).await;
        let _ = self.task.await;
    }

    async fn request<R>(
        &self,
        build: impl FnOnce(oneshot::Sender<R>) -> SessionCommand,
    ) -> Result<R, SyncError> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(build(tx))
            .await
            .map_err(|_| SyncError::Closed)?;
        rx.await.map_err(|_| SyncError::Closed)
    }
}

// ───────────────────────────────────────────────────────────────────
// Owner task
// ───────────────────────────────────────────────────────────────────

struct SessionTask {
    config: SyncConfig,
    project: ProjectId,
    user: UserInfo,
    view_location: String,

    state: ConnectionState,
    link: Option<TransportLink>,
    sequencer: Sequencer,
    synchronizer: Synchronizer,
    queue: OutboundQueue,
    monitor: FlushMonitor,
    backoff: Backoff,
    presence: PresenceTracker,

    dial_task: Option<JoinHandle<Result<TransportLink, SyncError>>>,
    connect_waiters: Vec<oneshot::Sender<Result<(), SyncError>>>,

    retry_at: Option<Instant>,
    resync_deadline: Option<Instant>,
    awaiting_resync: bool,
    /// Collections whose next reset block was asked for via `refresh`,
    /// as opposed to forced by an unserviceable watermark.
    pending_full: Vec<CollectionId>,

    commands: mpsc::Receiver<SessionCommand>,
    events: broadcast::Sender<SessionEvent>,
}

impl SessionTask {
    fn new(
        config: SyncConfig,
        project: ProjectId,
        user: UserInfo,
        commands: mpsc::Receiver<SessionCommand>,
        events: broadcast::Sender<SessionEvent>,
    ) -> Self {
        let mut presence = PresenceTracker::new(
            config.stale_after(),
            config.offline_after(),
            config.evict_after(),
        );
        // Our own entry is part of the roster from the start.
        presence.apply(&PresenceBody::Join {
            user: user.clone(),
            status: PresenceStatus::Online,
            location: String::new(),
            at_ms: now_ms(),
        });

        Self {
            backoff: Backoff::new(config.reconnect.clone()),
            queue: OutboundQueue::new(config.max_queue),
            monitor: FlushMonitor::new(config.degraded_after_ticks),
            config,
            project,
            user,
            view_location: String::new(),
            state: ConnectionState::Disconnected,
            link: None,
            sequencer: Sequencer::new(),
            synchronizer: Synchronizer::with_standard(),
            presence,
            dial_task: None,
            connect_waiters: Vec::new(),
            retry_at: None,
            resync_deadline: None,
            pending_full: Vec::new(),
            awaiting_resync: false,
            commands,
            events,
        }
    }

    async fn run(mut self) {
        let mut flush = interval(self.config.sync_interval());
        let mut heartbeat = interval(self.config.heartbeat_interval);
        flush.set_missed_tick_behavior(MissedTickBehavior::Skip);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                cmd = self.commands.recv() => match cmd {
                    Some(SessionCommand::Shutdown) | None => break,
                    Some(cmd) => self.handle_command(cmd).await,
                },
                frame = recv_link(&mut self.link) => match frame {
                    Some(bytes) => self.on_frame(&bytes).await,
                    None => self.on_link_lost("connection closed by peer").await,
                },
                outcome = join_dial(&mut self.dial_task) => self.on_dial_complete(outcome).await,
                _ = flush.tick() => self.on_flush_tick().await,
                _ = heartbeat.tick() => self.on_heartbeat_tick().await,
                _ = sleep_until_opt(self.retry_at) => self.on_retry_timer(),
                _ = sleep_until_opt(self.resync_deadline) => self.on_resync_timeout().await,
            }
        }

        if let Some(dial) = self.dial_task.take() {
            dial.abort();
        }
        log::debug!("session task {} stopped", self.sequencer.session());
    }

    // ── command handling ───────────────────────────────────────────

    async fn handle_command(&mut self, cmd: SessionCommand) {
        match cmd {
            SessionCommand::Connect { reply } => self.user_connect(reply),
            SessionCommand::Disconnect { reply } => {
                if self.state.is_connected() {
                    let leave = PresenceBody::Leave {
                        user_id: self.user.id,
                        at_ms: now_ms(),
                    };
                    let envelope =
                        Envelope::presence(self.project, self.sequencer.session(), leave.encode());
                    self.send_envelope(envelope).await;
                }
                self.enter_terminal("disconnected by user").await;
                let _ = reply.send(());
            }
            SessionCommand::MutateLocal {
                collection,
                op,
                entity,
                payload,
                reply,
            } => {
                let _ = reply.send(self.mutate_local(collection, op, entity, payload));
            }
            SessionCommand::Snapshot { collection, reply } => {
                let _ = reply.send(self.synchronizer.snapshot(&collection));
            }
            SessionCommand::Subscribe { collection, reply } => {
                let _ = reply.send(self.synchronizer.subscribe(&collection));
            }
            SessionCommand::Refresh { collections, reply } => {
                let _ = reply.send(self.request_refresh(collections).await);
            }
            SessionCommand::RegisterCollection { id, kind, reply } => {
                self.synchronizer.register(id, kind);
                let _ = reply.send(());
            }
            SessionCommand::ListPresence { reply } => {
                let _ = reply.send(self.presence.list_active(now_ms()));
            }
            SessionCommand::GetState { reply } => {
                let _ = reply.send(self.state);
            }
            SessionCommand::SetStatus { status, reply } => {
                let body = PresenceBody::Status {
                    user_id: self.user.id,
                    status,
                    at_ms: now_ms(),
                };
                if let Some(event) = self.presence.apply(&body) {
                    self.emit(SessionEvent::Presence(event));
                }
                if self.state.is_connected() {
                    let envelope =
                        Envelope::presence(self.project, self.sequencer.session(), body.encode());
                    self.send_envelope(envelope).await;
                }
                let _ = reply.send(());
            }
            SessionCommand::SetViewLocation { location, reply } => {
                self.view_location = location;
                let at = now_ms();
                if let Some(event) =
                    self.presence.on_heartbeat(self.user.id, &self.view_location, at)
                {
                    self.emit(SessionEvent::Presence(event));
                }
                if self.state.is_connected() {
                    let body = HeartbeatBody {
                        user_id: self.user.id,
                        location: self.view_location.clone(),
                        sent_at_ms: at,
                    };
                    let envelope =
                        Envelope::heartbeat(self.project, self.sequencer.session(), body.encode());
                    self.send_envelope(envelope).await;
                }
                let _ = reply.send(());
            }
            SessionCommand::JoinVoice { reply } => {
                let _ = reply.send(self.set_voice(true).await);
            }
            SessionCommand::LeaveVoice { reply } => {
                let _ = reply.send(self.set_voice(false).await);
            }
            SessionCommand::Stats { reply } => {
                let _ = reply.send(SessionStats {
                    state: self.state,
                    session: self.sequencer.session(),
                    pending_mutations: self.queue.len(),
                    pending_bytes: self.queue.payload_bytes(),
                    last_local_seq: self.sequencer.last_assigned(),
                    last_ack_seq: self.sequencer.last_ack(),
                    reconnect_attempt: self.backoff.attempt(),
                    sync_degraded: self.monitor.is_degraded(),
                    roster_size: self.presence.len(),
                });
            }
            SessionCommand::Shutdown => {}
        }
    }

    fn mutate_local(
        &mut self,
        collection: CollectionId,
        op: OpKind,
        entity: EntityId,
        payload: Vec<u8>,
    ) -> Result<u64, SyncError> {
        self.synchronizer.validate(&collection, op, &entity, &payload)?;
        if self.queue.is_full() {
            return Err(SyncError::QueueFull(self.queue.capacity()));
        }
        let local_seq = self.sequencer.next_local_seq()?;
        let mutation = self.synchronizer.mutate_local(
            &collection,
            op,
            entity,
            payload,
            local_seq,
            self.sequencer.session(),
        )?;
        self.queue.push(mutation);
        Ok(local_seq)
    }

    async fn set_voice(&mut self, join: bool) -> Result<(), SyncError> {
        if !self.config.voip_enabled {
            return Err(SyncError::VoiceDisabled);
        }
        if !self.state.is_connected() {
            return Err(SyncError::NotConnected);
        }
        let at_ms = now_ms();
        let body = if join {
            PresenceBody::VoiceJoined {
                user_id: self.user.id,
                at_ms,
            }
        } else {
            PresenceBody::VoiceLeft {
                user_id: self.user.id,
                at_ms,
            }
        };
        if let Some(event) = self.presence.apply(&body) {
            self.emit(SessionEvent::Presence(event));
        }
        let envelope = Envelope::presence(self.project, self.sequencer.session(), body.encode());
        self.send_envelope(envelope).await;
        Ok(())
    }

    /// Ask the server to serve the named collections as full snapshots,
    /// bypassing the watermark delta. Local copies are rebuilt when the
    /// response lands; flush stays paused until then.
    async fn request_refresh(&mut self, collections: Vec<CollectionId>) -> Result<(), SyncError> {
        for collection in &collections {
            if !self.synchronizer.contains(collection) {
                return Err(SyncError::UnknownCollection(collection.clone()));
            }
        }
        if !self.state.is_connected() {
            return Err(SyncError::NotConnected);
        }
        let request = ResyncRequest {
            watermarks: self.synchronizer.watermarks(),
            last_ack_seq: self.sequencer.last_ack(),
            full: collections.clone(),
        };
        let envelope = Envelope::resync_request(self.project, self.sequencer.session(), &request);
        self.send_envelope(envelope).await;
        if self.link.is_none() {
            // The write failed; the loss path owns recovery now.
            return Err(SyncError::NotConnected);
        }
        self.pending_full = collections;
        self.awaiting_resync = true;
        self.resync_deadline = Some(Instant::now() + self.config.resync_timeout);
        Ok(())
    }

    // ── connection lifecycle ───────────────────────────────────────

    /// The dial runs on a spawned task so the command loop stays live
    /// while the socket opens; every caller waiting on `Connect` is
    /// settled from `on_dial_complete`.
    fn user_connect(&mut self, reply: oneshot::Sender<Result<(), SyncError>>) {
        match self.state {
            ConnectionState::Connected => {
                let _ = reply.send(Ok(()));
            }
            ConnectionState::Connecting => {
                self.connect_waiters.push(reply);
            }
            ConnectionState::Reconnecting => {
                // Retry now with a fresh budget instead of waiting out the
                // timer.
                self.retry_at = None;
                self.backoff.reset();
                self.connect_waiters.push(reply);
                if self.dial_task.is_none() {
                    self.start_dial();
                }
            }
            ConnectionState::Disconnected => {
                if self.sequencer.last_assigned() > 0 || !self.queue.is_empty() {
                    if let Err(e) = self.rotate_session() {
                        let _ = reply.send(Err(e));
                        return;
                    }
                }
                self.set_state(ConnectionState::Connecting, 0);
                self.connect_waiters.push(reply);
                self.start_dial();
            }
        }
    }

    /// Fresh session identity for a user-triggered connect from terminal
    /// disconnect. Pending mutations are renumbered in their original
    /// order under the new id.
    fn rotate_session(&mut self) -> Result<(), SyncError> {
        let session = self.sequencer.rotate();
        let pending = self.queue.drain();
        let parked = pending.len();
        for mutation in pending {
            let local_seq = self.sequencer.next_local_seq()?;
            self.queue.push(Mutation {
                local_seq,
                origin: session,
                ..mutation
            });
        }
        log::info!("new session {session}, {parked} pending mutations renumbered");
        Ok(())
    }

    /// Spawn the connect attempt. Its outcome re-enters the select loop
    /// through `join_dial` and lands in `on_dial_complete`.
    fn start_dial(&mut self) {
        let url = self.config.server_url.clone();
        let connect_timeout = self.config.connect_timeout;
        self.dial_task = Some(tokio::spawn(async move {
            TransportLink::open(&url, connect_timeout).await
        }));
    }

    async fn on_dial_complete(&mut self, result: Result<TransportLink, SyncError>) {
        self.dial_task = None;
        match result {
            Ok(link) => {
                self.link = Some(link);
                self.on_link_established().await;
                let outcome = if self.state.is_connected() {
                    Ok(())
                } else {
                    Err(SyncError::Transport("link dropped during hello".into()))
                };
                self.settle_connect_waiters(outcome);
            }
            Err(e) => {
                log::warn!("connect failed: {e}");
                self.settle_connect_waiters(Err(e));
                match self.state {
                    ConnectionState::Connecting => {
                        if self.config.auto_reconnect {
                            self.schedule_retry().await;
                        } else {
                            self.enter_terminal("connect failed with auto-reconnect off").await;
                        }
                    }
                    ConnectionState::Reconnecting => self.schedule_retry().await,
                    ConnectionState::Connected | ConnectionState::Disconnected => {}
                }
            }
        }
    }

    fn settle_connect_waiters(&mut self, result: Result<(), SyncError>) {
        for waiter in self.connect_waiters.drain(..) {
            let _ = waiter.send(result.clone());
        }
    }

    /// Announce ourselves and request catch-up. Flush stays paused until
    /// the resync response lands.
    async fn on_link_established(&mut self) {
        self.backoff.reset();
        self.retry_at = None;
        self.set_state(ConnectionState::Connected, 0);
        log::info!("connected to {}", self.config.server_url);

        let status = self
            .presence
            .entry(&self.user.id)
            .map(|e| e.status)
            .unwrap_or(PresenceStatus::Online);
        let join = PresenceBody::Join {
            user: self.user.clone(),
            status,
            location: self.view_location.clone(),
            at_ms: now_ms(),
        };
        let envelope = Envelope::presence(self.project, self.sequencer.session(), join.encode());
        self.send_envelope(envelope).await;
        if self.link.is_none() {
            // The join write already failed; the loss path has taken over.
            return;
        }

        let request = ResyncRequest {
            watermarks: self.synchronizer.watermarks(),
            last_ack_seq: self.sequencer.last_ack(),
            full: Vec::new(),
        };
        let envelope =
            Envelope::resync_request(self.project, self.sequencer.session(), &request);
        self.send_envelope(envelope).await;
        self.pending_full.clear();
        self.awaiting_resync = true;
        self.resync_deadline = Some(Instant::now() + self.config.resync_timeout);
    }

    /// Transport failure entry point. Keeps exactly one retry timer alive
    /// regardless of how many failure signals race in.
    async fn on_link_lost(&mut self, reason: &str) {
        self.link = None;
        self.awaiting_resync = false;
        self.resync_deadline = None;

        if self.state == ConnectionState::Disconnected {
            return;
        }
        if self.state == ConnectionState::Reconnecting && self.retry_at.is_some() {
            return;
        }

        log::warn!("link lost: {reason}");
        if !self.config.auto_reconnect {
            self.enter_terminal("auto-reconnect disabled").await;
            return;
        }
        self.schedule_retry().await;
    }

    async fn schedule_retry(&mut self) {
        if self.backoff.exhausted() {
            self.enter_terminal("reconnect attempts exhausted").await;
            return;
        }
        let delay = self.backoff.next_delay();
        let attempt = self.backoff.attempt();
        self.retry_at = Some(Instant::now() + delay);
        self.set_state(ConnectionState::Reconnecting, attempt);
        log::info!(
            "reconnect attempt {attempt}/{} in {delay:?}",
            self.config.reconnect.max_attempts
        );
    }

    fn on_retry_timer(&mut self) {
        self.retry_at = None;
        if self.state != ConnectionState::Reconnecting {
            return;
        }
        if self.dial_task.is_none() {
            self.start_dial();
        }
    }

    async fn on_resync_timeout(&mut self) {
        self.resync_deadline = None;
        if !self.awaiting_resync {
            return;
        }
        log::warn!("resync did not complete within {:?}", self.config.resync_timeout);
        self.on_link_lost("resync timeout").await;
    }

    async fn enter_terminal(&mut self, reason: &str) {
        log::info!("session settling disconnected: {reason}");
        if let Some(dial) = self.dial_task.take() {
            dial.abort();
        }
        self.settle_connect_waiters(Err(SyncError::Transport("connect abandoned".into())));
        self.link = None;
        self.retry_at = None;
        self.resync_deadline = None;
        self.awaiting_resync = false;
        if self.state != ConnectionState::Disconnected {
            let attempt = self.backoff.attempt();
            self.set_state(ConnectionState::Disconnected, attempt);
        }
    }

    fn set_state(&mut self, state: ConnectionState, attempt: u32) {
        self.state = state;
        self.emit(SessionEvent::ConnectionChanged { state, attempt });
    }

    // ── inbound demultiplexing ─────────────────────────────────────

    async fn on_frame(&mut self, bytes: &[u8]) {
        let envelope = match Envelope::decode(bytes) {
            Ok(envelope) => envelope,
            Err(e) => {
                log::warn!("dropping undecodable frame: {e}");
                return;
            }
        };

        match envelope.kind {
            MessageKind::Mutation => match envelope.mutation_batch() {
                Ok(batch) => {
                    for mutation in &batch {
                        if let Err(e) =
                            self.synchronizer.apply_remote(mutation, ChangeSource::Remote)
                        {
                            log::warn!("dropping inbound mutation: {e}");
                        }
                    }
                }
                Err(e) => log::warn!("dropping malformed mutation batch: {e}"),
            },
            MessageKind::Ack => match envelope.ack_body() {
                Ok(ack) => self.on_ack(ack.local_seq),
                Err(e) => log::warn!("dropping malformed ack: {e}"),
            },
            MessageKind::Presence => match PresenceBody::decode(&envelope.payload) {
                Ok(body) => {
                    if let Some(event) = self.presence.apply(&body) {
                        self.emit(SessionEvent::Presence(event));
                    }
                }
                Err(e) => log::warn!("dropping malformed presence body: {e}"),
            },
            MessageKind::Heartbeat => match HeartbeatBody::decode(&envelope.payload) {
                Ok(hb) => {
                    if let Some(event) =
                        self.presence.on_heartbeat(hb.user_id, &hb.location, hb.sent_at_ms)
                    {
                        self.emit(SessionEvent::Presence(event));
                    }
                }
                Err(e) => log::warn!("dropping malformed heartbeat: {e}"),
            },
            MessageKind::ResyncResponse => self.on_resync_response(&envelope),
            MessageKind::ResyncRequest => {
                log::debug!("ignoring client-bound resync request");
            }
        }
    }

    fn on_ack(&mut self, watermark: u64) {
        if self.sequencer.on_ack(watermark) {
            let pruned = self.queue.prune_acked(self.sequencer.last_ack());
            log::trace!("ack {watermark}: {pruned} mutations confirmed");
        }
    }

    fn on_resync_response(&mut self, envelope: &Envelope) {
        let response = match envelope.resync_response_body() {
            Ok(response) => response,
            Err(e) => {
                log::warn!("dropping malformed resync response: {e}");
                return;
            }
        };

        let mut applied = 0;
        let mut resets = 0;
        for block in &response.collections {
            if block.reset {
                resets += 1;
                if self.pending_full.contains(&block.collection) {
                    log::info!("collection '{}' rebuilt from requested snapshot", block.collection);
                } else {
                    let gap = SyncError::SequenceGap {
                        collection: block.collection.clone(),
                        watermark: self
                            .synchronizer
                            .last_applied(&block.collection)
                            .unwrap_or(0),
                    };
                    log::warn!("resync: {gap}");
                }
            }
            match self.synchronizer.apply_catch_up(block) {
                Ok(n) => applied += n,
                Err(e) => log::warn!("catch-up for '{}' failed: {e}", block.collection),
            }
        }
        self.pending_full.clear();
        self.on_ack(response.acked_local_seq);
        self.awaiting_resync = false;
        self.resync_deadline = None;

        log::info!(
            "resync complete: {applied} mutations across {} collections ({resets} reset)",
            response.collections.len()
        );
        self.emit(SessionEvent::Resynced {
            collections: response.collections.len(),
            reset_collections: resets,
        });
    }

    // ── periodic work ──────────────────────────────────────────────

    async fn on_flush_tick(&mut self) {
        if let Some(signal) = self.monitor.on_tick(self.queue.len()) {
            match signal {
                FlushSignal::Degraded { pending } => {
                    log::warn!("sync degraded: {pending} mutations pending");
                    self.emit(SessionEvent::SyncDegraded { pending });
                }
                FlushSignal::Recovered => {
                    log::info!("sync recovered");
                    self.emit(SessionEvent::SyncRecovered);
                }
            }
        }

        if !self.state.is_connected() || self.awaiting_resync || self.queue.is_empty() {
            return;
        }
        let batch = self.queue.peek_batch(self.config.max_batch);
        let envelope = Envelope::mutations(self.project, self.sequencer.session(), &batch);
        self.send_envelope(envelope).await;
    }

    async fn on_heartbeat_tick(&mut self) {
        let at = now_ms();
        // Local echo first: our own entry never goes stale while we run.
        if let Some(event) = self.presence.on_heartbeat(self.user.id, &self.view_location, at) {
            self.emit(SessionEvent::Presence(event));
        }

        if self.state.is_connected() {
            let body = HeartbeatBody {
                user_id: self.user.id,
                location: self.view_location.clone(),
                sent_at_ms: at,
            };
            let envelope =
                Envelope::heartbeat(self.project, self.sequencer.session(), body.encode());
            self.send_envelope(envelope).await;
        }

        for event in self.presence.sweep(at) {
            self.emit(SessionEvent::Presence(event));
        }
    }

    // ── plumbing ───────────────────────────────────────────────────

    async fn send_envelope(&mut self, envelope: Envelope) {
        let frame = match envelope.encode() {
            Ok(frame) => frame,
            Err(e) => {
                log::error!("envelope encode failed: {e}");
                return;
            }
        };
        let failed = match &self.link {
            Some(link) => link.send(frame).await.is_err(),
            None => return,
        };
        if failed {
            self.on_link_lost("write path closed").await;
        }
    }

    fn emit(&self, event: SessionEvent) {
        let _ = self.events.send(event);
    }
}

/// Await the link's inbound frames, or park until a link exists.
async fn recv_link(link: &mut Option<TransportLink>) -> Option<Vec<u8>> {
    match link {
        Some(link) => link.recv().await,
        None => std::future::pending().await,
    }
}

/// Await the in-flight connect attempt, or park until one starts.
async fn join_dial(
    task: &mut Option<JoinHandle<Result<TransportLink, SyncError>>>,
) -> Result<TransportLink, SyncError> {
    match task {
        Some(handle) => match handle.await {
            Ok(outcome) => outcome,
            Err(e) => Err(SyncError::Transport(format!("connect task failed: {e}"))),
        },
        None => std::future::pending().await,
    }
}

/// Sleep until the instant, or park when no deadline is set.
async fn sleep_until_opt(at: Option<Instant>) {
    match at {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn test_config() -> SyncConfig {
        SyncConfig {
            server_url: "ws://127.0.0.1:1".into(),
            connect_timeout: Duration::from_millis(300),
            ..SyncConfig::default()
        }
    }

    fn spawn_session(config: SyncConfig) -> CollabSession {
        CollabSession::spawn(config, ProjectId::generate(), UserInfo::new("Test User")).unwrap()
    }

    #[tokio::test]
    async fn test_spawn_rejects_invalid_config() {
        let config = SyncConfig {
            server_url: "http://not-a-socket".into(),
            ..SyncConfig::default()
        };
        let result = CollabSession::spawn(config, ProjectId::generate(), UserInfo::new("X"));
        assert!(matches!(result, Err(SyncError::FatalConfig(_))));
    }

    #[tokio::test]
    async fn test_starts_disconnected() {
        let session = spawn_session(test_config());
        assert_eq!(
            session.connection_state().await.unwrap(),
            ConnectionState::Disconnected
        );
        session.close().await;
    }

    #[tokio::test]
    async fn test_mutate_local_is_optimistic_while_offline() {
        let session = spawn_session(test_config());
        let chat = CollectionId::new("chat");

        let seq = session
            .mutate_local(chat.clone(), OpKind::Insert, EntityId::new("m1"), b"hello".to_vec())
            .await
            .unwrap();
        assert_eq!(seq, 1);

        let snapshot = session.snapshot(chat).await.unwrap();
        assert_eq!(snapshot.len(), 1);
        assert!(snapshot[0].1.is_pending());

        let stats = session.stats().await.unwrap();
        assert_eq!(stats.pending_mutations, 1);
        assert_eq!(stats.last_local_seq, 1);
        session.close().await;
    }

    #[tokio::test]
    async fn test_mutate_unknown_collection_fails() {
        let session = spawn_session(test_config());
        let result = session
            .mutate_local(
                CollectionId::new("missing"),
                OpKind::Insert,
                EntityId::new("e"),
                b"x".to_vec(),
            )
            .await;
        assert!(matches!(result, Err(SyncError::UnknownCollection(_))));
        session.close().await;
    }

    #[tokio::test]
    async fn test_registered_collection_accepts_mutations() {
        let session = spawn_session(test_config());
        let custom = CollectionId::new("measurements");
        session
            .register_collection(custom.clone(), CollectionKind::KeyedRecords)
            .await
            .unwrap();
        session
            .mutate_local(custom, OpKind::Upsert, EntityId::new("m"), b"1.5m".to_vec())
            .await
            .unwrap();
        session.close().await;
    }

    #[tokio::test]
    async fn test_queue_full_fails_fast() {
        let config = SyncConfig {
            max_batch: 2,
            max_queue: 2,
            ..test_config()
        };
        let session = spawn_session(config);
        let chat = CollectionId::new("chat");

        for i in 0..2 {
            session
                .mutate_local(
                    chat.clone(),
                    OpKind::Insert,
                    EntityId::new(format!("m{i}")),
                    b"x".to_vec(),
                )
                .await
                .unwrap();
        }
        let result = session
            .mutate_local(chat.clone(), OpKind::Insert, EntityId::new("m9"), b"x".to_vec())
            .await;
        assert!(matches!(result, Err(SyncError::QueueFull(2))));

        // The rejected mutation was never applied optimistically.
        let snapshot = session.snapshot(chat).await.unwrap();
        assert_eq!(snapshot.len(), 2);
        session.close().await;
    }

    #[tokio::test]
    async fn test_own_presence_listed() {
        let session = spawn_session(test_config());
        let listed = session.list_active_presence().await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].user.name, "Test User");
        assert_eq!(listed[0].status, PresenceStatus::Online);

        session.set_status(PresenceStatus::Busy).await.unwrap();
        let listed = session.list_active_presence().await.unwrap();
        assert_eq!(listed[0].status, PresenceStatus::Busy);
        session.close().await;
    }

    #[tokio::test]
    async fn test_voice_requires_flag_then_connection() {
        let session = spawn_session(test_config());
        assert!(matches!(session.join_voice().await, Err(SyncError::VoiceDisabled)));
        session.close().await;

        let config = SyncConfig {
            voip_enabled: true,
            ..test_config()
        };
        let session = spawn_session(config);
        assert!(matches!(session.join_voice().await, Err(SyncError::NotConnected)));
        session.close().await;
    }

    #[tokio::test]
    async fn test_degraded_signal_while_offline() {
        let config = SyncConfig {
            sync_rate_hz: 500,
            degraded_after_ticks: 3,
            ..test_config()
        };
        let session = spawn_session(config);
        let mut events = session.events();

        session
            .mutate_local(
                CollectionId::new("chat"),
                OpKind::Insert,
                EntityId::new("m1"),
                b"stuck".to_vec(),
            )
            .await
            .unwrap();

        let degraded = tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                match events.recv().await {
                    Ok(SessionEvent::SyncDegraded { pending }) => break pending,
                    Ok(_) => continue,
                    Err(_) => panic!("event stream closed"),
                }
            }
        })
        .await
        .unwrap();
        assert!(degraded >= 1);

        let stats = session.stats().await.unwrap();
        assert!(stats.sync_degraded);
        session.close().await;
    }

    #[tokio::test]
    async fn test_connect_failure_without_auto_reconnect_is_terminal() {
        let config = SyncConfig {
            auto_reconnect: false,
            ..test_config()
        };
        let session = spawn_session(config);

        let result = session.connect().await;
        assert!(matches!(result, Err(SyncError::Transport(_))));
        assert_eq!(
            session.connection_state().await.unwrap(),
            ConnectionState::Disconnected
        );
        session.close().await;
    }

    #[tokio::test]
    async fn test_connect_failure_schedules_retry_and_disconnect_cancels() {
        let mut reconnect = crate::config::ReconnectPolicy::default();
        reconnect.base_delay_ms = 5_000;
        let config = SyncConfig {
            reconnect,
            ..test_config()
        };
        let session = spawn_session(config);

        assert!(session.connect().await.is_err());
        assert_eq!(
            session.connection_state().await.unwrap(),
            ConnectionState::Reconnecting
        );

        session.disconnect().await.unwrap();
        assert_eq!(
            session.connection_state().await.unwrap(),
            ConnectionState::Disconnected
        );
        session.close().await;
    }

    #[tokio::test]
    async fn test_commands_stay_responsive_while_dialing() {
        // A listener that accepts sockets but never answers the upgrade;
        // the dial hangs in flight until the connect timeout fires.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let mut parked = Vec::new();
            while let Ok((socket, _)) = listener.accept().await {
                parked.push(socket);
            }
        });

        let config = SyncConfig {
            server_url: format!("ws://127.0.0.1:{port}"),
            connect_timeout: Duration::from_secs(3),
            ..SyncConfig::default()
        };
        let session = spawn_session(config);

        let (connected, elapsed) = tokio::join!(session.connect(), async {
            // Edit mid-dial; the owner loop must serve it immediately.
            tokio::time::sleep(Duration::from_millis(300)).await;
            let started = std::time::Instant::now();
            session
                .mutate_local(
                    CollectionId::new("chat"),
                    OpKind::Insert,
                    EntityId::new("m1"),
                    b"typed during the dial".to_vec(),
                )
                .await
                .unwrap();
            started.elapsed()
        });

        assert!(connected.is_err(), "the held-open socket never completes the upgrade");
        assert!(
            elapsed < Duration::from_secs(1),
            "local edit stalled behind the dial: {elapsed:?}"
        );
        session.close().await;
    }

    #[tokio::test]
    async fn test_refresh_requires_known_collection_and_connection() {
        let session = spawn_session(test_config());

        let unknown = session.refresh(vec![CollectionId::new("missing")]).await;
        assert!(matches!(unknown, Err(SyncError::UnknownCollection(_))));

        let offline = session.refresh(vec![CollectionId::new("chat")]).await;
        assert!(matches!(offline, Err(SyncError::NotConnected)));
        session.close().await;
    }
}
