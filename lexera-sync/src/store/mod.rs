//! Entity store: the read model of boards and cards.
//!
//! Holds the optimistic projection: the last confirmed remote state with
//! every still-queued local mutation applied on top. Only this type writes
//! its records:
//! - `apply_local` for user mutations (optimistic write + queue draft)
//! - `apply_remote` for realtime and resync data (consults the queue)
//! - `remap` when the remote store confirms a temporary identity
//!
//! Card counts are derived on every read and never stored.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};
use tokio::sync::broadcast;

use crate::events::StoreEvent;
use crate::queue::{EntryDraft, MutationQueue, Operation, QueueEntry};
use crate::remote::Scope;
use crate::types::*;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Board not found: {0}")]
    BoardNotFound(EntityId),

    #[error("Card not found: {0}")]
    CardNotFound(EntityId),

    #[error("Invalid mutation: {0}")]
    Invalid(String),
}

/// Which records `list` returns.
#[derive(Debug, Clone, PartialEq)]
pub enum ListFilter {
    All,
    /// Boards of one owner.
    Owner(String),
    /// Cards of one board.
    Board(EntityId),
    Column { board_id: EntityId, column_id: String },
}

/// Result of merging a remote snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteApply {
    Applied,
    /// No local record existed for a pending entity: the snapshot was stored
    /// and the queued mutations replayed over it.
    Seeded,
    /// A local mutation is pending; the local value stays.
    Suppressed,
    Removed,
    /// A card whose board is not in the store.
    Orphaned,
}

#[derive(Debug)]
enum Undo {
    Remove(EntityKind, EntityId),
    Restore(Vec<Entity>),
}

/// An optimistic write that still has to be queued.
#[derive(Debug)]
pub struct LocalWrite {
    pub id: EntityId,
    pub draft: EntryDraft,
    undo: Undo,
}

struct Record<T> {
    value: T,
    version: u64,
}

#[derive(Default)]
struct Records {
    boards: HashMap<EntityId, Record<Board>>,
    cards: HashMap<EntityId, Record<Card>>,
}

impl Records {
    fn get(&self, kind: EntityKind, id: &EntityId) -> Option<Entity> {
        match kind {
            EntityKind::Board => self.boards.get(id).map(|r| Entity::Board(self.counted(&r.value))),
            EntityKind::Card => self.cards.get(id).map(|r| Entity::Card(r.value.clone())),
        }
    }

    fn contains(&self, kind: EntityKind, id: &EntityId) -> bool {
        match kind {
            EntityKind::Board => self.boards.contains_key(id),
            EntityKind::Card => self.cards.contains_key(id),
        }
    }

    fn put(&mut self, entity: Entity, version: u64) {
        match entity {
            Entity::Board(mut board) => {
                board.card_count = 0;
                self.boards.insert(board.id.clone(), Record { value: board, version });
            }
            Entity::Card(card) => {
                self.cards.insert(card.id.clone(), Record { value: card, version });
            }
        }
    }

    /// Remove a record; a board takes its cards along. Returns what was removed.
    fn remove(&mut self, kind: EntityKind, id: &EntityId) -> Vec<Entity> {
        let mut removed = Vec::new();
        match kind {
            EntityKind::Board => {
                if let Some(record) = self.boards.remove(id) {
                    removed.push(Entity::Board(record.value));
                    let card_ids: Vec<EntityId> = self
                        .cards
                        .values()
                        .filter(|r| &r.value.board_id == id)
                        .map(|r| r.value.id.clone())
                        .collect();
                    for card_id in card_ids {
                        if let Some(card) = self.cards.remove(&card_id) {
                            removed.push(Entity::Card(card.value));
                        }
                    }
                }
            }
            EntityKind::Card => {
                if let Some(record) = self.cards.remove(id) {
                    removed.push(Entity::Card(record.value));
                }
            }
        }
        removed
    }

    fn counted(&self, board: &Board) -> Board {
        let mut board = board.clone();
        board.card_count = self
            .cards
            .values()
            .filter(|r| r.value.board_id == board.id)
            .count();
        board
    }

    fn owner_of(&self, board_id: &EntityId) -> Option<String> {
        self.boards.get(board_id).map(|r| r.value.owner_id.clone())
    }

    fn next_position(&self, board_id: &EntityId, column_id: &str) -> f64 {
        self.cards
            .values()
            .filter(|r| &r.value.board_id == board_id && r.value.column_id == column_id)
            .map(|r| r.value.position)
            .fold(None, |max: Option<f64>, p| Some(max.map_or(p, |m| m.max(p))))
            .map_or(0.0, |m| m + 1.0)
    }

    /// Apply one queued mutation over the records and return what it touched.
    /// Idempotent: patches assign fields, inserts only fill a gap, deletes of
    /// absent records are no-ops.
    fn project(&mut self, entry: &QueueEntry, version: u64) -> Vec<Entity> {
        match &entry.operation {
            Operation::Insert { snapshot } => {
                if self.contains(entry.kind, &entry.target) {
                    return Vec::new();
                }
                if let Entity::Card(card) = snapshot {
                    if !self.boards.contains_key(&card.board_id) {
                        return Vec::new();
                    }
                }
                self.put(snapshot.clone(), version);
                vec![snapshot.clone()]
            }
            Operation::Update { changes } => {
                let Some(mut entity) = self.get(entry.kind, &entry.target) else {
                    return Vec::new();
                };
                changes.apply_to(&mut entity, entry.enqueued_at);
                self.put(entity.clone(), version);
                vec![entity]
            }
            Operation::Delete => self.remove(entry.kind, &entry.target),
        }
    }
}

pub struct EntityStore {
    records: RwLock<Records>,
    queue: Arc<MutationQueue>,
    events: broadcast::Sender<StoreEvent>,
    /// Global version counter (monotonic, shared across all records)
    next_version: AtomicU64,
}

impl EntityStore {
    pub fn new(queue: Arc<MutationQueue>, event_capacity: usize) -> Self {
        let (events, _) = broadcast::channel(event_capacity.max(1));
        Self {
            records: RwLock::new(Records::default()),
            queue,
            events,
            next_version: AtomicU64::new(1),
        }
    }

    fn next_version(&self) -> u64 {
        self.next_version.fetch_add(1, Ordering::Relaxed)
    }

    /// Highest version handed out so far. Records written later compare greater.
    pub fn version(&self) -> u64 {
        self.next_version.load(Ordering::Relaxed).saturating_sub(1)
    }

    /// Subscribe to invalidation events. Dropping the receiver unsubscribes.
    pub fn subscribe(&self) -> broadcast::Receiver<StoreEvent> {
        self.events.subscribe()
    }

    fn publish(&self, events: Vec<StoreEvent>) {
        let mut seen = Vec::with_capacity(events.len());
        for event in events {
            if !seen.contains(&event) {
                seen.push(event.clone());
                let _ = self.events.send(event);
            }
        }
    }

    /// Invalidation events for a set of touched records.
    fn events_for(records: &Records, touched: &[Entity]) -> Vec<StoreEvent> {
        let mut events = Vec::new();
        for entity in touched {
            match entity {
                Entity::Board(board) => {
                    events.push(StoreEvent::BoardsChanged {
                        owner_id: board.owner_id.clone(),
                    });
                    events.push(StoreEvent::BoardChanged {
                        board_id: board.id.clone(),
                    });
                }
                Entity::Card(card) => {
                    events.push(StoreEvent::CardsChanged {
                        board_id: card.board_id.clone(),
                    });
                    if let Some(owner_id) = records.owner_of(&card.board_id) {
                        events.push(StoreEvent::BoardsChanged { owner_id });
                    }
                }
            }
        }
        events
    }

    /// Optimistic write of a user mutation. Inserts get a temporary identity.
    /// The returned draft must be queued; if that fails, hand the write back
    /// to [`EntityStore::undo`].
    pub fn apply_local(&self, mutation: Mutation) -> Result<LocalWrite, StoreError> {
        let now = Utc::now();
        let version = self.next_version();
        let mut records = self.records.write().unwrap();

        let (write, touched) = match mutation {
            Mutation::CreateBoard(new) => {
                if new.name.trim().is_empty() {
                    return Err(StoreError::Invalid("board name is required".to_string()));
                }
                let id = EntityId::temporary();
                let board = Entity::Board(Board {
                    id: id.clone(),
                    owner_id: new.owner_id,
                    name: new.name,
                    description: new.description,
                    created_at: now,
                    card_count: 0,
                });
                records.put(board.clone(), version);
                let write = LocalWrite {
                    id: id.clone(),
                    draft: EntryDraft {
                        kind: EntityKind::Board,
                        target: id.clone(),
                        parent: None,
                        operation: Operation::Insert {
                            snapshot: board.clone(),
                        },
                    },
                    undo: Undo::Remove(EntityKind::Board, id),
                };
                (write, vec![board])
            }
            Mutation::UpdateBoard { id, patch } => {
                if patch.is_empty() {
                    return Err(StoreError::Invalid("empty board update".to_string()));
                }
                if patch.name.as_deref().is_some_and(|n| n.trim().is_empty()) {
                    return Err(StoreError::Invalid("board name is required".to_string()));
                }
                let previous = records
                    .get(EntityKind::Board, &id)
                    .ok_or_else(|| StoreError::BoardNotFound(id.clone()))?;
                let mut updated = previous.clone();
                let changes = Changes::Board(patch);
                changes.apply_to(&mut updated, now);
                records.put(updated.clone(), version);
                let write = LocalWrite {
                    id: id.clone(),
                    draft: EntryDraft {
                        kind: EntityKind::Board,
                        target: id,
                        parent: None,
                        operation: Operation::Update { changes },
                    },
                    undo: Undo::Restore(vec![previous]),
                };
                (write, vec![updated])
            }
            Mutation::DeleteBoard { id } => {
                let removed = records.remove(EntityKind::Board, &id);
                if removed.is_empty() {
                    return Err(StoreError::BoardNotFound(id));
                }
                let write = LocalWrite {
                    id: id.clone(),
                    draft: EntryDraft {
                        kind: EntityKind::Board,
                        target: id,
                        parent: None,
                        operation: Operation::Delete,
                    },
                    undo: Undo::Restore(removed.clone()),
                };
                (write, removed)
            }
            Mutation::CreateCard(new) => {
                if new.title.trim().is_empty() {
                    return Err(StoreError::Invalid("card title is required".to_string()));
                }
                if new.column_id.trim().is_empty() {
                    return Err(StoreError::Invalid("card column is required".to_string()));
                }
                if new.position.is_some_and(|p| !p.is_finite()) {
                    return Err(StoreError::Invalid("card position must be finite".to_string()));
                }
                if !records.boards.contains_key(&new.board_id) {
                    return Err(StoreError::BoardNotFound(new.board_id));
                }
                let id = EntityId::temporary();
                let position = new
                    .position
                    .unwrap_or_else(|| records.next_position(&new.board_id, &new.column_id));
                let card = Entity::Card(Card {
                    id: id.clone(),
                    board_id: new.board_id.clone(),
                    column_id: new.column_id,
                    title: new.title,
                    description: new.description,
                    priority: new.priority,
                    due_date: new.due_date,
                    position,
                    created_at: now,
                    updated_at: now,
                });
                records.put(card.clone(), version);
                let write = LocalWrite {
                    id: id.clone(),
                    draft: EntryDraft {
                        kind: EntityKind::Card,
                        target: id.clone(),
                        parent: Some(new.board_id),
                        operation: Operation::Insert {
                            snapshot: card.clone(),
                        },
                    },
                    undo: Undo::Remove(EntityKind::Card, id),
                };
                (write, vec![card])
            }
            Mutation::UpdateCard { id, patch } => {
                if patch.is_empty() {
                    return Err(StoreError::Invalid("empty card update".to_string()));
                }
                if patch.title.as_deref().is_some_and(|t| t.trim().is_empty()) {
                    return Err(StoreError::Invalid("card title is required".to_string()));
                }
                if patch.column_id.as_deref().is_some_and(|c| c.trim().is_empty()) {
                    return Err(StoreError::Invalid("card column is required".to_string()));
                }
                if patch.position.is_some_and(|p| !p.is_finite()) {
                    return Err(StoreError::Invalid("card position must be finite".to_string()));
                }
                let previous = records
                    .get(EntityKind::Card, &id)
                    .ok_or_else(|| StoreError::CardNotFound(id.clone()))?;
                let parent = previous.parent().cloned();
                let mut updated = previous.clone();
                let changes = Changes::Card(patch);
                changes.apply_to(&mut updated, now);
                records.put(updated.clone(), version);
                let write = LocalWrite {
                    id: id.clone(),
                    draft: EntryDraft {
                        kind: EntityKind::Card,
                        target: id,
                        parent,
                        operation: Operation::Update { changes },
                    },
                    undo: Undo::Restore(vec![previous]),
                };
                (write, vec![updated])
            }
            Mutation::DeleteCard { id } => {
                let removed = records.remove(EntityKind::Card, &id);
                let Some(parent) = removed.first().and_then(|e| e.parent().cloned()) else {
                    return Err(StoreError::CardNotFound(id));
                };
                let write = LocalWrite {
                    id: id.clone(),
                    draft: EntryDraft {
                        kind: EntityKind::Card,
                        target: id,
                        parent: Some(parent),
                        operation: Operation::Delete,
                    },
                    undo: Undo::Restore(removed.clone()),
                };
                (write, removed)
            }
        };

        let events = Self::events_for(&records, &touched);
        drop(records);
        self.publish(events);
        Ok(write)
    }

    /// Revert an optimistic write whose queue entry could not be persisted.
    pub fn undo(&self, write: LocalWrite) {
        let mut records = self.records.write().unwrap();
        let touched = match write.undo {
            Undo::Remove(kind, id) => records.remove(kind, &id),
            Undo::Restore(entities) => {
                for entity in &entities {
                    records.put(entity.clone(), self.next_version());
                }
                entities
            }
        };
        let events = Self::events_for(&records, &touched);
        drop(records);
        self.publish(events);
    }

    /// Merge a remote snapshot. Deletes always apply. Anything else is held
    /// back while the entity has a pending local mutation.
    pub fn apply_remote(&self, entity: Entity, is_delete: bool) -> RemoteApply {
        let kind = entity.kind();
        let id = entity.id().clone();
        let mut records = self.records.write().unwrap();

        if is_delete {
            let removed = records.remove(kind, &id);
            let mut events = Self::events_for(&records, &removed);
            if let Entity::Card(card) = &entity {
                // The board may be gone already; still signal its card list.
                events.push(StoreEvent::CardsChanged {
                    board_id: card.board_id.clone(),
                });
            }
            drop(records);
            if !removed.is_empty() {
                self.publish(events);
            }
            return RemoteApply::Removed;
        }

        if let Entity::Card(card) = &entity {
            if !records.boards.contains_key(&card.board_id) {
                log::debug!(
                    "[lexera.sync.store] Dropping card {} of unknown board {}",
                    card.id,
                    card.board_id
                );
                return RemoteApply::Orphaned;
            }
        }

        let pending = self.queue.entries_for(&id);
        let outcome = if pending.is_empty() {
            records.put(entity.clone(), self.next_version());
            RemoteApply::Applied
        } else if records.contains(kind, &id) {
            return RemoteApply::Suppressed;
        } else {
            records.put(entity.clone(), self.next_version());
            for entry in &pending {
                records.project(entry, self.next_version());
            }
            RemoteApply::Seeded
        };

        let touched: Vec<Entity> = records.get(kind, &id).into_iter().collect();
        let events = Self::events_for(&records, &touched);
        drop(records);
        self.publish(events);
        outcome
    }

    /// Replace `old` with `new` everywhere: the record itself and every card
    /// pointing at a remapped board. A record that already arrived under the
    /// canonical identity is replaced, never duplicated.
    pub fn remap(&self, kind: EntityKind, old: &EntityId, new: &EntityId) -> bool {
        let version = self.next_version();
        let mut records = self.records.write().unwrap();
        let mut found = false;

        match kind {
            EntityKind::Board => {
                if let Some(mut record) = records.boards.remove(old) {
                    record.value.id = new.clone();
                    record.version = version;
                    records.boards.insert(new.clone(), record);
                    found = true;
                }
                for record in records.cards.values_mut() {
                    if &record.value.board_id == old {
                        record.value.board_id = new.clone();
                        record.version = version;
                    }
                }
            }
            EntityKind::Card => {
                if let Some(mut record) = records.cards.remove(old) {
                    record.value.id = new.clone();
                    record.version = version;
                    records.cards.insert(new.clone(), record);
                    found = true;
                }
            }
        }

        let mut events = vec![StoreEvent::IdentityRemapped {
            kind,
            from: old.clone(),
            to: new.clone(),
        }];
        let touched: Vec<Entity> = records.get(kind, new).into_iter().collect();
        events.extend(Self::events_for(&records, &touched));
        drop(records);
        self.publish(events);
        found
    }

    /// Re-project every queued mutation over the current records. Safe to
    /// call repeatedly; used after a restart and after each resync.
    pub fn replay_pending(&self) -> usize {
        let entries = self.queue.all();
        if entries.is_empty() {
            return 0;
        }
        let mut records = self.records.write().unwrap();
        let mut touched = Vec::new();
        let mut applied = 0;
        for entry in &entries {
            let changed = records.project(entry, self.next_version());
            if !changed.is_empty() {
                applied += 1;
                touched.extend(changed);
            }
        }
        let events = Self::events_for(&records, &touched);
        drop(records);
        self.publish(events);
        applied
    }

    pub fn read(&self, kind: EntityKind, id: &EntityId) -> Option<Entity> {
        self.records.read().unwrap().get(kind, id)
    }

    pub fn board(&self, id: &EntityId) -> Option<Board> {
        let records = self.records.read().unwrap();
        records.boards.get(id).map(|r| records.counted(&r.value))
    }

    pub fn card(&self, id: &EntityId) -> Option<Card> {
        self.records.read().unwrap().cards.get(id).map(|r| r.value.clone())
    }

    pub fn list(&self, kind: EntityKind, filter: &ListFilter) -> Vec<Entity> {
        match kind {
            EntityKind::Board => self.list_boards(filter).into_iter().map(Entity::Board).collect(),
            EntityKind::Card => self.list_cards(filter).into_iter().map(Entity::Card).collect(),
        }
    }

    /// Boards matching `filter`, newest first, with derived card counts.
    fn list_boards(&self, filter: &ListFilter) -> Vec<Board> {
        let records = self.records.read().unwrap();
        let mut boards: Vec<Board> = records
            .boards
            .values()
            .filter(|r| match filter {
                ListFilter::All => true,
                ListFilter::Owner(owner_id) => &r.value.owner_id == owner_id,
                ListFilter::Board(board_id) => &r.value.id == board_id,
                ListFilter::Column { .. } => false,
            })
            .map(|r| records.counted(&r.value))
            .collect();
        boards.sort_by(|a, b| b.created_at.cmp(&a.created_at).then_with(|| a.id.cmp(&b.id)));
        boards
    }

    /// Cards matching `filter`, by column then position.
    fn list_cards(&self, filter: &ListFilter) -> Vec<Card> {
        let records = self.records.read().unwrap();
        let owned: HashSet<&EntityId> = match filter {
            ListFilter::Owner(owner_id) => records
                .boards
                .values()
                .filter(|r| &r.value.owner_id == owner_id)
                .map(|r| &r.value.id)
                .collect(),
            _ => HashSet::new(),
        };
        let mut cards: Vec<Card> = records
            .cards
            .values()
            .filter(|r| match filter {
                ListFilter::All => true,
                ListFilter::Owner(_) => owned.contains(&r.value.board_id),
                ListFilter::Board(board_id) => &r.value.board_id == board_id,
                ListFilter::Column {
                    board_id,
                    column_id,
                } => &r.value.board_id == board_id && &r.value.column_id == column_id,
            })
            .map(|r| r.value.clone())
            .collect();
        cards.sort_by(|a, b| {
            a.column_id
                .cmp(&b.column_id)
                .then_with(|| a.position.total_cmp(&b.position))
                .then_with(|| a.created_at.cmp(&b.created_at))
        });
        cards
    }

    pub fn boards_for(&self, owner_id: &str) -> Vec<Board> {
        self.list_boards(&ListFilter::Owner(owner_id.to_string()))
    }

    pub fn cards_on(&self, board_id: &EntityId) -> Vec<Card> {
        self.list_cards(&ListFilter::Board(board_id.clone()))
    }

    /// Identities and record versions of everything a scope covers.
    pub fn scope_records(&self, scope: &Scope) -> Vec<(EntityId, u64)> {
        let records = self.records.read().unwrap();
        match scope {
            Scope::Boards { owner_id } => records
                .boards
                .values()
                .filter(|r| &r.value.owner_id == owner_id)
                .map(|r| (r.value.id.clone(), r.version))
                .collect(),
            Scope::Cards { board_id } => records
                .cards
                .values()
                .filter(|r| &r.value.board_id == board_id)
                .map(|r| (r.value.id.clone(), r.version))
                .collect(),
        }
    }

    /// Local edit time of a card, for last-writer-wins decisions.
    pub fn updated_at(&self, kind: EntityKind, id: &EntityId) -> Option<DateTime<Utc>> {
        self.read(kind, id).and_then(|e| e.updated_at())
    }
}
