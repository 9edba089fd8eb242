//! Shared collection state: optimistic local application, last-write-wins
//! convergence by server sequence, and catch-up after reconnects.
//!
//! ```text
//! mutate_local()                      apply_remote()
//!      │ validate, apply pending           │ server_seq watermark check
//!      ▼                                   ▼
//! CollectionState ◄──────────────── stamped Mutation
//!  entities: EntityId → EntityRecord       │
//!  tombstones: EntityId → delete seq       ▼
//!  last_applied_server_seq          ChangeEvent broadcast
//! ```
//!
//! Convergence is whole-record last-write-wins ordered by `server_seq`; no
//! per-field merging is attempted. A record applied optimistically carries
//! `server_seq: None` until its stamped copy comes back from the server, at
//! which point the stamped copy overwrites it on the same apply path as any
//! other remote mutation.
//!
//! Reference: Kleppmann — DDIA, Chapter 5 (leader-based replication, LWW).

use std::collections::HashMap;

use tokio::sync::broadcast;

use crate::error::SyncError;
use crate::protocol::{
    CollectionCatchUp, CollectionId, CollectionWatermark, EntityId, Mutation, OpKind, SessionId,
};

/// Capacity of each collection's change feed. A panel that lags behind this
/// many events receives `RecvError::Lagged` and should re-read the snapshot.
const CHANGE_CHANNEL_CAPACITY: usize = 256;

// ───────────────────────────────────────────────────────────────────
// Collection registry
// ───────────────────────────────────────────────────────────────────

/// Declared shape of a collection, checked at `mutate_local` time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CollectionKind {
    /// Insert-only event streams (chat, activity feed).
    AppendLog,
    /// Keyed documents with full CRUD (annotations, issues).
    KeyedRecords,
}

impl CollectionKind {
    pub fn permits(&self, op: OpKind) -> bool {
        match self {
            CollectionKind::AppendLog => matches!(op, OpKind::Insert),
            CollectionKind::KeyedRecords => true,
        }
    }
}

/// The product's built-in collections. Tests and plugins may register more.
pub fn standard_collections() -> Vec<(CollectionId, CollectionKind)> {
    vec![
        (CollectionId::new("chat"), CollectionKind::AppendLog),
        (CollectionId::new("activity"), CollectionKind::AppendLog),
        (CollectionId::new("annotations"), CollectionKind::KeyedRecords),
        (CollectionId::new("issues"), CollectionKind::KeyedRecords),
        (CollectionId::new("selection_sets"), CollectionKind::KeyedRecords),
    ]
}

// ───────────────────────────────────────────────────────────────────
// Records and change notifications
// ───────────────────────────────────────────────────────────────────

/// One entity's current value. `server_seq` is `None` while the record is a
/// local optimistic write awaiting its stamped copy.
#[derive(Debug, Clone, PartialEq)]
pub struct EntityRecord {
    pub payload: Vec<u8>,
    pub server_seq: Option<u64>,
}

impl EntityRecord {
    pub fn is_pending(&self) -> bool {
        self.server_seq.is_none()
    }
}

/// Where a change came from, for panels that render confirmation state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeSource {
    Local,
    Remote,
    Resync,
}

/// Emitted on every visible collection change.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeEvent {
    pub collection: CollectionId,
    pub entity: EntityId,
    pub op: OpKind,
    pub source: ChangeSource,
    pub server_seq: Option<u64>,
}

/// Result of applying a stamped mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    Applied,
    /// At or below the collection watermark; idempotently discarded.
    Duplicate,
}

// ───────────────────────────────────────────────────────────────────
// Per-collection state
// ───────────────────────────────────────────────────────────────────

struct CollectionState {
    kind: CollectionKind,
    last_applied_server_seq: u64,
    entities: HashMap<EntityId, EntityRecord>,
    /// Deleted entities and the server sequence that deleted them. A
    /// later-sequenced insert removes the tombstone (resurrection).
    tombstones: HashMap<EntityId, u64>,
    changes: broadcast::Sender<ChangeEvent>,
}

impl CollectionState {
    fn new(kind: CollectionKind) -> Self {
        let (changes, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);
        Self {
            kind,
            last_applied_server_seq: 0,
            entities: HashMap::new(),
            tombstones: HashMap::new(),
            changes,
        }
    }

    fn clear(&mut self) {
        self.entities.clear();
        self.tombstones.clear();
        self.last_applied_server_seq = 0;
    }
}

// ───────────────────────────────────────────────────────────────────
// Synchronizer
// ───────────────────────────────────────────────────────────────────

/// One `CollectionState` per registered collection, one uniform merge
/// algorithm across all of them.
pub struct Synchronizer {
    collections: HashMap<CollectionId, CollectionState>,
}

impl Synchronizer {
    pub fn new() -> Self {
        Self {
            collections: HashMap::new(),
        }
    }

    /// Registry preloaded with [`standard_collections`].
    pub fn with_standard() -> Self {
        let mut sync = Self::new();
        for (id, kind) in standard_collections() {
            sync.register(id, kind);
        }
        sync
    }

    pub fn register(&mut self, id: CollectionId, kind: CollectionKind) {
        self.collections.entry(id).or_insert_with(|| CollectionState::new(kind));
    }

    pub fn contains(&self, id: &CollectionId) -> bool {
        self.collections.contains_key(id)
    }

    /// Shape validation: known collection, operation permitted by its kind,
    /// non-empty entity id, payload present exactly when the operation
    /// carries one.
    pub fn validate(
        &self,
        collection: &CollectionId,
        op: OpKind,
        entity: &EntityId,
        payload: &[u8],
    ) -> Result<(), SyncError> {
        let state = self
            .collections
            .get(collection)
            .ok_or_else(|| SyncError::UnknownCollection(collection.clone()))?;
        if entity.is_empty() {
            return Err(SyncError::SchemaViolation {
                collection: collection.clone(),
                detail: "empty entity id".into(),
            });
        }
        if !state.kind.permits(op) {
            return Err(SyncError::SchemaViolation {
                collection: collection.clone(),
                detail: format!("{} not permitted on append-only collection", op.as_str()),
            });
        }
        if op.is_delete() {
            if !payload.is_empty() {
                return Err(SyncError::SchemaViolation {
                    collection: collection.clone(),
                    detail: "delete carries no payload".into(),
                });
            }
        } else if payload.is_empty() {
            return Err(SyncError::SchemaViolation {
                collection: collection.clone(),
                detail: "empty payload".into(),
            });
        }
        Ok(())
    }

    /// Validate and optimistically apply a local edit, returning the pending
    /// mutation ready for the outbound queue. The caller assigns `local_seq`
    /// beforehand so the send order matches assignment order.
    pub fn mutate_local(
        &mut self,
        collection: &CollectionId,
        op: OpKind,
        entity: EntityId,
        payload: Vec<u8>,
        local_seq: u64,
        origin: SessionId,
    ) -> Result<Mutation, SyncError> {
        self.validate(collection, op, &entity, &payload)?;
        let mutation = Mutation {
            collection: collection.clone(),
            op,
            entity: entity.clone(),
            payload: payload.clone(),
            local_seq,
            origin,
            server_seq: None,
        };

        let state = match self.collections.get_mut(collection) {
            Some(state) => state,
            None => return Err(SyncError::UnknownCollection(collection.clone())),
        };
        if op.is_delete() {
            state.entities.remove(&entity);
        } else {
            state.entities.insert(
                entity.clone(),
                EntityRecord {
                    payload,
                    server_seq: None,
                },
            );
        }
        let _ = state.changes.send(ChangeEvent {
            collection: collection.clone(),
            entity,
            op,
            source: ChangeSource::Local,
            server_seq: None,
        });
        Ok(mutation)
    }

    /// Apply a stamped mutation from the server. Mutations at or below the
    /// collection watermark are discarded, which makes redelivery and the
    /// origin's own echoed writes idempotent. Arrival order is irrelevant;
    /// only `server_seq` decides.
    pub fn apply_remote(
        &mut self,
        mutation: &Mutation,
        source: ChangeSource,
    ) -> Result<ApplyOutcome, SyncError> {
        let seq = mutation.server_seq.ok_or_else(|| {
            SyncError::Protocol(format!(
                "unstamped mutation for '{}' on the inbound path",
                mutation.collection
            ))
        })?;
        let state = self
            .collections
            .get_mut(&mutation.collection)
            .ok_or_else(|| SyncError::UnknownCollection(mutation.collection.clone()))?;

        if seq <= state.last_applied_server_seq {
            return Ok(ApplyOutcome::Duplicate);
        }

        if mutation.op.is_delete() {
            state.entities.remove(&mutation.entity);
            state.tombstones.insert(mutation.entity.clone(), seq);
        } else {
            // Higher server_seq always wins, including over a pending local
            // record awaiting its stamp.
            state.entities.insert(
                mutation.entity.clone(),
                EntityRecord {
                    payload: mutation.payload.clone(),
                    server_seq: Some(seq),
                },
            );
            state.tombstones.remove(&mutation.entity);
        }
        state.last_applied_server_seq = seq;

        let _ = state.changes.send(ChangeEvent {
            collection: mutation.collection.clone(),
            entity: mutation.entity.clone(),
            op: mutation.op,
            source,
            server_seq: Some(seq),
        });
        Ok(ApplyOutcome::Applied)
    }

    /// Apply one collection's catch-up block from a resync response.
    ///
    /// `reset` means the server's retained history no longer reaches our
    /// watermark: local state for the collection is discarded wholesale,
    /// pending optimistic records included, and the server snapshot is
    /// applied from zero. Returns the number of mutations applied.
    pub fn apply_catch_up(&mut self, catch_up: &CollectionCatchUp) -> Result<usize, SyncError> {
        let state = self
            .collections
            .get_mut(&catch_up.collection)
            .ok_or_else(|| SyncError::UnknownCollection(catch_up.collection.clone()))?;
        if catch_up.reset {
            log::warn!(
                "collection '{}': server history gap, discarding local state for full snapshot",
                catch_up.collection
            );
            state.clear();
        }

        let mut ordered: Vec<&Mutation> = catch_up.mutations.iter().collect();
        ordered.sort_by_key(|m| m.server_seq);

        let mut applied = 0;
        for mutation in ordered {
            if self.apply_remote(mutation, ChangeSource::Resync)? == ApplyOutcome::Applied {
                applied += 1;
            }
        }
        Ok(applied)
    }

    /// Deterministic render order: stamped records by `(server_seq,
    /// entity)`, pending local records last. For append logs this is
    /// exactly server arrival order with unconfirmed entries at the tail.
    pub fn snapshot(
        &self,
        collection: &CollectionId,
    ) -> Result<Vec<(EntityId, EntityRecord)>, SyncError> {
        let state = self
            .collections
            .get(collection)
            .ok_or_else(|| SyncError::UnknownCollection(collection.clone()))?;
        let mut records: Vec<(EntityId, EntityRecord)> = state
            .entities
            .iter()
            .map(|(id, record)| (id.clone(), record.clone()))
            .collect();
        records.sort_by(|(a_id, a), (b_id, b)| {
            let a_key = (a.server_seq.is_none(), a.server_seq.unwrap_or(0));
            let b_key = (b.server_seq.is_none(), b.server_seq.unwrap_or(0));
            a_key.cmp(&b_key).then_with(|| a_id.cmp(b_id))
        });
        Ok(records)
    }

    /// Change feed for one collection; dropping the receiver unsubscribes.
    pub fn subscribe(
        &self,
        collection: &CollectionId,
    ) -> Result<broadcast::Receiver<ChangeEvent>, SyncError> {
        self.collections
            .get(collection)
            .map(|state| state.changes.subscribe())
            .ok_or_else(|| SyncError::UnknownCollection(collection.clone()))
    }

    /// Per-collection applied watermarks, sorted by collection id. This is
    /// the body of a resync request.
    pub fn watermarks(&self) -> Vec<CollectionWatermark> {
        let mut marks: Vec<CollectionWatermark> = self
            .collections
            .iter()
            .map(|(id, state)| CollectionWatermark {
                collection: id.clone(),
                last_applied: state.last_applied_server_seq,
            })
            .collect();
        marks.sort_by(|a, b| a.collection.cmp(&b.collection));
        marks
    }

    pub fn last_applied(&self, collection: &CollectionId) -> Option<u64> {
        self.collections
            .get(collection)
            .map(|s| s.last_applied_server_seq)
    }

    pub fn is_deleted(&self, collection: &CollectionId, entity: &EntityId) -> bool {
        self.collections
            .get(collection)
            .map(|s| s.tombstones.contains_key(entity))
            .unwrap_or(false)
    }
}

impl Default for Synchronizer {
    fn default() -> Self {
        Self::with_standard()
    }
}
