//! Presence tracking: who is in the project, how alive they are, and where
//! they are looking.
//!
//! ```text
//! heartbeat / presence envelope
//!        │
//!        ▼
//! PresenceTracker::on_heartbeat / apply()   (timestamp tie-break)
//!        │
//!        ▼
//! roster: UserId → PresenceEntry
//!        │                      ▲
//!        ▼                      │ once per heartbeat interval
//! list_active() snapshot   sweep(now): away / offline / evict
//! ```
//!
//! Liveness decays in three steps driven by the sender-side heartbeat
//! timestamp: `stale` (reads as away), `offline`, and `evict` (dropped from
//! the roster, removal event fired). Out-of-order heartbeats resolve by
//! greater-timestamp-wins; an equal timestamp keeps the existing entry
//! unchanged, so replays are idempotent.
//!
//! Reference: Kleppmann — DDIA, Chapter 8 (timeouts and unbounded delay).

use std::collections::HashMap;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::error::SyncError;
use crate::protocol::{decode_body, encode_body, UserId, UserInfo};

/// Milliseconds since the Unix epoch; the timestamp domain of heartbeats.
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

// ───────────────────────────────────────────────────────────────────
// Status
// ───────────────────────────────────────────────────────────────────

/// Collaborator liveness, ordered by display priority.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PresenceStatus {
    Online,
    Busy,
    Away,
    Offline,
}

impl PresenceStatus {
    /// Sort key for roster panels: online, busy, away, offline.
    pub fn priority(&self) -> u8 {
        match self {
            PresenceStatus::Online => 0,
            PresenceStatus::Busy => 1,
            PresenceStatus::Away => 2,
            PresenceStatus::Offline => 3,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            PresenceStatus::Online => "online",
            PresenceStatus::Busy => "busy",
            PresenceStatus::Away => "away",
            PresenceStatus::Offline => "offline",
        }
    }
}

// ───────────────────────────────────────────────────────────────────
// Wire bodies
// ───────────────────────────────────────────────────────────────────

/// Periodic liveness ping. Sent inside `MessageKind::Heartbeat` envelopes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HeartbeatBody {
    pub user_id: UserId,
    /// Free-form view location ("Level 3 / HVAC", a sheet name, ...).
    pub location: String,
    /// Sender clock, milliseconds since epoch. The tie-break key.
    pub sent_at_ms: u64,
}

impl HeartbeatBody {
    pub fn encode(&self) -> Vec<u8> {
        encode_body(self)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, SyncError> {
        decode_body(bytes)
    }
}

/// Roster change events. Sent inside `MessageKind::Presence` envelopes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum PresenceBody {
    /// Announce a collaborator with full identity.
    Join {
        user: UserInfo,
        status: PresenceStatus,
        location: String,
        at_ms: u64,
    },
    /// Clean departure.
    Leave { user_id: UserId, at_ms: u64 },
    /// Explicit status change (busy during a call, back to online, ...).
    Status {
        user_id: UserId,
        status: PresenceStatus,
        at_ms: u64,
    },
    /// Voice session membership. Metadata only; no media is carried here.
    VoiceJoined { user_id: UserId, at_ms: u64 },
    VoiceLeft { user_id: UserId, at_ms: u64 },
}

impl PresenceBody {
    pub fn encode(&self) -> Vec<u8> {
        encode_body(self)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, SyncError> {
        decode_body(bytes)
    }

    pub fn user_id(&self) -> UserId {
        match self {
            PresenceBody::Join { user, .. } => user.id,
            PresenceBody::Leave { user_id, .. } => *user_id,
            PresenceBody::Status { user_id, .. } => *user_id,
            PresenceBody::VoiceJoined { user_id, .. } => *user_id,
            PresenceBody::VoiceLeft { user_id, .. } => *user_id,
        }
    }

    pub fn at_ms(&self) -> u64 {
        match self {
            PresenceBody::Join { at_ms, .. }
            | PresenceBody::Leave { at_ms, .. }
            | PresenceBody::Status { at_ms, .. }
            | PresenceBody::VoiceJoined { at_ms, .. }
            | PresenceBody::VoiceLeft { at_ms, .. } => *at_ms,
        }
    }
}

// ───────────────────────────────────────────────────────────────────
// Roster entries and events
// ───────────────────────────────────────────────────────────────────

/// One collaborator's live state as tracked locally.
#[derive(Debug, Clone, PartialEq)]
pub struct PresenceEntry {
    pub user: UserInfo,
    pub status: PresenceStatus,
    /// Free-form view location shown by activity panels.
    pub location: String,
    /// Greatest heartbeat timestamp seen for this user (sender clock, ms).
    pub last_heartbeat_ms: u64,
    pub in_voice: bool,
}

/// Roster change notification delivered to subscribed panels.
#[derive(Debug, Clone, PartialEq)]
pub enum PresenceEvent {
    Joined { user: UserInfo },
    Left { user_id: UserId },
    StatusChanged { user_id: UserId, status: PresenceStatus },
    /// Idle past the evict threshold; removed without a clean leave.
    Evicted { user_id: UserId },
    VoiceChanged { user_id: UserId, in_voice: bool },
}

// ───────────────────────────────────────────────────────────────────
// Tracker
// ───────────────────────────────────────────────────────────────────

/// Roster of one project's collaborators, local user included.
///
/// All timestamps are sender-clock milliseconds. The sweep and
/// [`PresenceTracker::list_active`] share one staleness derivation, so a
/// stale entry reads as away even between sweeps.
pub struct PresenceTracker {
    roster: HashMap<UserId, PresenceEntry>,
    stale_ms: u64,
    offline_ms: u64,
    evict_ms: u64,
}

impl PresenceTracker {
    pub fn new(stale_after: Duration, offline_after: Duration, evict_after: Duration) -> Self {
        Self {
            roster: HashMap::new(),
            stale_ms: stale_after.as_millis() as u64,
            offline_ms: offline_after.as_millis() as u64,
            evict_ms: evict_after.as_millis() as u64,
        }
    }

    /// Apply a liveness ping. Upserts the entry, refreshes the heartbeat
    /// timestamp and location, and promotes `away`/`offline` back to
    /// `online` (an explicit `busy` survives heartbeats).
    pub fn on_heartbeat(
        &mut self,
        user_id: UserId,
        location: &str,
        at_ms: u64,
    ) -> Option<PresenceEvent> {
        match self.roster.get_mut(&user_id) {
            Some(entry) => {
                if at_ms <= entry.last_heartbeat_ms {
                    // Greater timestamp wins; equal keeps the entry unchanged.
                    return None;
                }
                entry.last_heartbeat_ms = at_ms;
                entry.location = location.to_string();
                if matches!(entry.status, PresenceStatus::Away | PresenceStatus::Offline) {
                    entry.status = PresenceStatus::Online;
                    return Some(PresenceEvent::StatusChanged {
                        user_id,
                        status: PresenceStatus::Online,
                    });
                }
                None
            }
            None => {
                // Heartbeat before a join was seen: placeholder identity
                // that a later join fills in.
                let user = placeholder_user(user_id);
                self.roster.insert(
                    user_id,
                    PresenceEntry {
                        user: user.clone(),
                        status: PresenceStatus::Online,
                        location: location.to_string(),
                        last_heartbeat_ms: at_ms,
                        in_voice: false,
                    },
                );
                Some(PresenceEvent::Joined { user })
            }
        }
    }

    /// Apply a roster change body. Stale bodies (timestamp not newer than
    /// the entry's heartbeat) are dropped, so reconnect replays are safe.
    pub fn apply(&mut self, body: &PresenceBody) -> Option<PresenceEvent> {
        match body {
            PresenceBody::Join {
                user,
                status,
                location,
                at_ms,
            } => match self.roster.get_mut(&user.id) {
                Some(entry) => {
                    // Always adopt the real identity over a placeholder.
                    entry.user = user.clone();
                    if *at_ms > entry.last_heartbeat_ms {
                        entry.last_heartbeat_ms = *at_ms;
                        entry.location = location.clone();
                        entry.status = *status;
                    }
                    None
                }
                None => {
                    self.roster.insert(
                        user.id,
                        PresenceEntry {
                            user: user.clone(),
                            status: *status,
                            location: location.clone(),
                            last_heartbeat_ms: *at_ms,
                            in_voice: false,
                        },
                    );
                    Some(PresenceEvent::Joined { user: user.clone() })
                }
            },
            PresenceBody::Leave { user_id, at_ms } => {
                if let Some(entry) = self.roster.get(user_id) {
                    if *at_ms < entry.last_heartbeat_ms {
                        // The user was seen alive after this leave was sent.
                        return None;
                    }
                    self.roster.remove(user_id);
                    return Some(PresenceEvent::Left { user_id: *user_id });
                }
                None
            }
            PresenceBody::Status {
                user_id,
                status,
                at_ms,
            } => {
                let entry = self.entry_or_placeholder(*user_id, *at_ms);
                if *at_ms < entry.last_heartbeat_ms {
                    return None;
                }
                entry.last_heartbeat_ms = *at_ms;
                if entry.status == *status {
                    return None;
                }
                entry.status = *status;
                Some(PresenceEvent::StatusChanged {
                    user_id: *user_id,
                    status: *status,
                })
            }
            PresenceBody::VoiceJoined { user_id, at_ms } => self.set_voice(*user_id, *at_ms, true),
            PresenceBody::VoiceLeft { user_id, at_ms } => self.set_voice(*user_id, *at_ms, false),
        }
    }

    fn set_voice(&mut self, user_id: UserId, at_ms: u64, in_voice: bool) -> Option<PresenceEvent> {
        let entry = self.entry_or_placeholder(user_id, at_ms);
        if entry.in_voice == in_voice {
            return None;
        }
        entry.in_voice = in_voice;
        Some(PresenceEvent::VoiceChanged { user_id, in_voice })
    }

    fn entry_or_placeholder(&mut self, user_id: UserId, at_ms: u64) -> &mut PresenceEntry {
        self.roster.entry(user_id).or_insert_with(|| PresenceEntry {
            user: placeholder_user(user_id),
            status: PresenceStatus::Online,
            location: String::new(),
            last_heartbeat_ms: at_ms,
            in_voice: false,
        })
    }

    /// Decay liveness. Run once per heartbeat interval, not per message.
    ///
    /// Entries idle past `stale` read as away, past `offline` as offline,
    /// and past `evict` they are removed entirely with a removal event.
    /// The sweep only ever moves status toward staler, never fresher.
    pub fn sweep(&mut self, now_ms: u64) -> Vec<PresenceEvent> {
        let mut events = Vec::new();

        let evicted: Vec<UserId> = self
            .roster
            .iter()
            .filter(|(_, e)| now_ms.saturating_sub(e.last_heartbeat_ms) > self.evict_ms)
            .map(|(id, _)| *id)
            .collect();
        for user_id in evicted {
            self.roster.remove(&user_id);
            events.push(PresenceEvent::Evicted { user_id });
        }

        for (user_id, entry) in self.roster.iter_mut() {
            let idle = now_ms.saturating_sub(entry.last_heartbeat_ms);
            let derived = derive_status(entry.status, idle, self.stale_ms, self.offline_ms);
            if derived != entry.status {
                entry.status = derived;
                events.push(PresenceEvent::StatusChanged {
                    user_id: *user_id,
                    status: derived,
                });
            }
        }

        events
    }

    /// Deterministic roster snapshot: status priority (online, busy, away,
    /// offline), then user id. Staleness is derived at query time with the
    /// sweep's thresholds; entries past eviction are omitted.
    pub fn list_active(&self, now_ms: u64) -> Vec<PresenceEntry> {
        let mut entries: Vec<PresenceEntry> = self
            .roster
            .values()
            .filter(|e| now_ms.saturating_sub(e.last_heartbeat_ms) <= self.evict_ms)
            .map(|e| {
                let idle = now_ms.saturating_sub(e.last_heartbeat_ms);
                let mut snapshot = e.clone();
                snapshot.status = derive_status(e.status, idle, self.stale_ms, self.offline_ms);
                snapshot
            })
            .collect();
        entries.sort_by(|a, b| {
            a.status
                .priority()
                .cmp(&b.status.priority())
                .then_with(|| a.user.id.cmp(&b.user.id))
        });
        entries
    }

    pub fn entry(&self, user_id: &UserId) -> Option<&PresenceEntry> {
        self.roster.get(user_id)
    }

    pub fn len(&self) -> usize {
        self.roster.len()
    }

    pub fn is_empty(&self) -> bool {
        self.roster.is_empty()
    }
}

/// Staler of the current and idle-derived status.
fn derive_status(current: PresenceStatus, idle_ms: u64, stale_ms: u64, offline_ms: u64) -> PresenceStatus {
    let derived = if idle_ms > offline_ms {
        PresenceStatus::Offline
    } else if idle_ms > stale_ms {
        PresenceStatus::Away
    } else {
        return current;
    };
    if derived.priority() > current.priority() {
        derived
    } else {
        current
    }
}

fn placeholder_user(user_id: UserId) -> UserInfo {
    UserInfo::with_id(user_id, format!("Collaborator-{}", &user_id.0.to_string()[..8]))
}
