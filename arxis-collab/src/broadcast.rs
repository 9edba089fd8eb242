//! Per-project fan-out to N sessions over one tokio broadcast channel.
//!
//! Frames are published once as `Arc<Vec<u8>>` and every member receiver
//! clones the `Arc`, not the bytes. Each frame carries its envelope kind and
//! origin session so connection tasks can filter (a session never receives
//! its own presence back) without re-decoding the payload per receiver.
//!
//! Performance target: one 1 KiB mutation frame to 50 sessions in <1ms.
//! Reference: Kleppmann — DDIA, Chapter 11 (fan-out delivery).

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::{broadcast, RwLock};

use crate::protocol::{MessageKind, SessionId, UserInfo};

/// One pre-encoded envelope on its way to every project member.
#[derive(Debug, Clone)]
pub struct BroadcastFrame {
    pub kind: MessageKind,
    pub origin: SessionId,
    pub bytes: Arc<Vec<u8>>,
}

impl BroadcastFrame {
    /// Presence-flavored frames are relayed to everyone except the origin;
    /// mutation frames go to the origin too (that is how it learns the
    /// server stamp).
    pub fn skips_origin(&self) -> bool {
        matches!(self.kind, MessageKind::Presence | MessageKind::Heartbeat)
    }
}

/// Snapshot of fan-out health for one project.
#[derive(Debug, Clone, Default)]
pub struct FanoutStats {
    pub frames_sent: u64,
    pub lagged_drops: u64,
    pub active_sessions: usize,
}

/// Counters updated without a lock so publish stays on the fast path.
struct AtomicFanoutStats {
    frames_sent: AtomicU64,
    lagged_drops: AtomicU64,
}

impl AtomicFanoutStats {
    fn new() -> Self {
        Self {
            frames_sent: AtomicU64::new(0),
            lagged_drops: AtomicU64::new(0),
        }
    }
}

/// Fan-out group for a single project space.
///
/// Membership is keyed by session id; the same user may hold several
/// sessions (two browser tabs) and each gets its own receiver.
pub struct PeerFanout {
    sender: broadcast::Sender<BroadcastFrame>,
    members: Arc<RwLock<HashMap<SessionId, UserInfo>>>,
    capacity: usize,
    stats: Arc<AtomicFanoutStats>,
}

impl PeerFanout {
    /// `capacity` bounds the frames buffered per lagging receiver before it
    /// starts losing them and must resync.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender,
            members: Arc::new(RwLock::new(HashMap::new())),
            capacity,
            stats: Arc::new(AtomicFanoutStats::new()),
        }
    }

    /// Register a session and hand back its frame receiver.
    pub async fn join(&self, session: SessionId, user: UserInfo) -> broadcast::Receiver<BroadcastFrame> {
        let mut members = self.members.write().await;
        members.insert(session, user);
        self.sender.subscribe()
    }

    pub async fn leave(&self, session: &SessionId) -> Option<UserInfo> {
        let mut members = self.members.write().await;
        members.remove(session)
    }

    /// Publish one pre-encoded frame to every current receiver. Lock-free;
    /// returns the receiver count at send time. Origin filtering is the
    /// consumer's job via [`BroadcastFrame::skips_origin`].
    pub fn publish(&self, kind: MessageKind, origin: SessionId, bytes: Arc<Vec<u8>>) -> usize {
        let count = self
            .sender
            .send(BroadcastFrame { kind, origin, bytes })
            .unwrap_or(0);
        self.stats.frames_sent.fetch_add(1, Ordering::Relaxed);
        count
    }

    /// Record frames a lagging receiver lost, reported by its connection
    /// task on `RecvError::Lagged`.
    pub fn note_lagged(&self, n: u64) {
        self.stats.lagged_drops.fetch_add(n, Ordering::Relaxed);
    }

    pub async fn occupancy(&self) -> usize {
        self.members.read().await.len()
    }

    pub async fn has_session(&self, session: &SessionId) -> bool {
        self.members.read().await.contains_key(session)
    }

    pub async fn member(&self, session: &SessionId) -> Option<UserInfo> {
        self.members.read().await.get(session).cloned()
    }

    /// Current members sorted by user id, session id tie-breaking, so
    /// roster replays are deterministic.
    pub async fn roster(&self) -> Vec<(SessionId, UserInfo)> {
        let members = self.members.read().await;
        let mut roster: Vec<(SessionId, UserInfo)> =
            members.iter().map(|(s, u)| (*s, u.clone())).collect();
        roster.sort_by(|(sa, ua), (sb, ub)| ua.id.cmp(&ub.id).then_with(|| sa.0.cmp(&sb.0)));
        roster
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub async fn stats(&self) -> FanoutStats {
        let members = self.members.read().await;
        FanoutStats {
            frames_sent: self.stats.frames_sent.load(Ordering::Relaxed),
            lagged_drops: self.stats.lagged_drops.load(Ordering::Relaxed),
            active_sessions: members.len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame_bytes() -> Arc<Vec<u8>> {
        Arc::new(vec![1, 2, 3, 4])
    }

    #[tokio::test]
    async fn test_join_and_leave() {
        let fanout = PeerFanout::new(16);
        let session = SessionId::generate();
        let user = UserInfo::new("Alice");

        let _rx = fanout.join(session, user.clone()).await;
        assert_eq!(fanout.occupancy().await, 1);
        assert!(fanout.has_session(&session).await);

        let left = fanout.leave(&session).await;
        assert_eq!(left.map(|u| u.name), Some("Alice".to_string()));
        assert_eq!(fanout.occupancy().await, 0);
    }

    #[tokio::test]
    async fn test_publish_reaches_every_receiver() {
        let fanout = PeerFanout::new(16);
        let origin = SessionId::generate();

        let mut rx1 = fanout.join(SessionId::generate(), UserInfo::new("A")).await;
        let mut rx2 = fanout.join(SessionId::generate(), UserInfo::new("B")).await;
        let mut rx3 = fanout.join(origin, UserInfo::new("C")).await;

        let count = fanout.publish(MessageKind::Mutation, origin, frame_bytes());
        assert_eq!(count, 3);

        for rx in [&mut rx1, &mut rx2, &mut rx3] {
            let frame = rx.recv().await.unwrap();
            assert_eq!(frame.kind, MessageKind::Mutation);
            assert_eq!(frame.origin, origin);
            assert_eq!(*frame.bytes, vec![1, 2, 3, 4]);
        }
    }

    #[tokio::test]
    async fn test_origin_filtering_is_kind_dependent() {
        let mutation = BroadcastFrame {
            kind: MessageKind::Mutation,
            origin: SessionId::generate(),
            bytes: frame_bytes(),
        };
        let heartbeat = BroadcastFrame {
            kind: MessageKind::Heartbeat,
            origin: SessionId::generate(),
            bytes: frame_bytes(),
        };
        let presence = BroadcastFrame {
            kind: MessageKind::Presence,
            origin: SessionId::generate(),
            bytes: frame_bytes(),
        };

        assert!(!mutation.skips_origin());
        assert!(heartbeat.skips_origin());
        assert!(presence.skips_origin());
    }

    #[tokio::test]
    async fn test_stats_track_publishes_and_lag() {
        let fanout = PeerFanout::new(16);
        let session = SessionId::generate();
        let _rx = fanout.join(session, UserInfo::new("A")).await;

        fanout.publish(MessageKind::Presence, session, frame_bytes());
        fanout.publish(MessageKind::Presence, session, frame_bytes());
        fanout.note_lagged(7);

        let stats = fanout.stats().await;
        assert_eq!(stats.frames_sent, 2);
        assert_eq!(stats.lagged_drops, 7);
        assert_eq!(stats.active_sessions, 1);
    }

    #[tokio::test]
    async fn test_roster_is_sorted_by_user() {
        let fanout = PeerFanout::new(16);
        let a = UserInfo::new("A");
        let b = UserInfo::new("B");
        let _rx1 = fanout.join(SessionId::generate(), a.clone()).await;
        let _rx2 = fanout.join(SessionId::generate(), b.clone()).await;

        let roster = fanout.roster().await;
        assert_eq!(roster.len(), 2);
        let mut expected = vec![a.id, b.id];
        expected.sort();
        let got: Vec<_> = roster.iter().map(|(_, u)| u.id).collect();
        assert_eq!(got, expected);
    }

    #[tokio::test]
    async fn test_publish_without_receivers_is_quiet() {
        let fanout = PeerFanout::new(16);
        let count = fanout.publish(MessageKind::Mutation, SessionId::generate(), frame_bytes());
        assert_eq!(count, 0);
        assert_eq!(fanout.stats().await.frames_sent, 1);
    }

    #[tokio::test]
    async fn test_capacity_reported() {
        let fanout = PeerFanout::new(64);
        assert_eq!(fanout.capacity(), 64);
    }
}
