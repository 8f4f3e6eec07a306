//! In-process remote store.
//!
//! Behaves like the hosted backend as far as the engine can tell:
//! server-assigned `srv-<n>` identities, idempotent creates keyed by the
//! client identity, cascade delete of a board's cards and a realtime echo
//! of every change to matching subscriptions. Faults and feed outages can
//! be injected.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::mpsc;

use super::{ChangeKind, FeedMessage, RemoteClient, RemoteError, RemoteEvent, Scope};
use crate::types::{Board, Card, Changes, Entity, EntityId, EntityKind};

const DEFAULT_FEED_CAPACITY: usize = 256;

/// A write the store accepted, in the order it was applied.
#[derive(Debug, Clone, PartialEq)]
pub enum RemoteCall {
    Create {
        kind: EntityKind,
        client_id: EntityId,
        id: EntityId,
    },
    Update {
        kind: EntityKind,
        id: EntityId,
        changes: Changes,
    },
    Delete {
        kind: EntityKind,
        id: EntityId,
    },
}

struct Feed {
    scope: Scope,
    tx: mpsc::Sender<FeedMessage>,
    connected: bool,
    /// A change could not be delivered; the subscriber owes a resync.
    lagged: bool,
}

#[derive(Default)]
struct Inner {
    boards: HashMap<EntityId, Board>,
    cards: HashMap<EntityId, Card>,
    /// client identity -> canonical identity
    created: HashMap<EntityId, EntityId>,
    /// Cards that went away with their board.
    orphaned: HashSet<EntityId>,
    next_id: u64,
    offline: bool,
    faults: VecDeque<RemoteError>,
    calls: Vec<RemoteCall>,
    feeds: Vec<Feed>,
}

impl Inner {
    fn check_available(&mut self) -> Result<(), RemoteError> {
        if self.offline {
            return Err(RemoteError::transient("remote store unreachable"));
        }
        match self.faults.pop_front() {
            Some(fault) => Err(fault),
            None => Ok(()),
        }
    }

    fn next_canonical(&mut self) -> EntityId {
        self.next_id += 1;
        EntityId::new(format!("srv-{}", self.next_id))
    }

    fn with_count(&self, board: &Board) -> Board {
        let mut board = board.clone();
        board.card_count = self.cards.values().filter(|c| c.board_id == board.id).count();
        board
    }

    fn emit(&mut self, change: ChangeKind, entity: Entity) {
        self.feeds.retain(|f| !f.tx.is_closed());
        for feed in self.feeds.iter_mut() {
            if !feed.connected || !feed.scope.contains(&entity) {
                continue;
            }
            if feed.lagged {
                if feed.tx.try_send(FeedMessage::Reconnected).is_err() {
                    continue;
                }
                feed.lagged = false;
            }
            let message = FeedMessage::Change(RemoteEvent {
                change,
                entity: entity.clone(),
            });
            if feed.tx.try_send(message).is_err() {
                log::warn!("[lexera.sync.remote] Feed for {} lagged, dropping change", feed.scope);
                feed.lagged = true;
            }
        }
    }
}

pub struct InMemoryRemote {
    inner: Mutex<Inner>,
    feed_capacity: usize,
}

impl Default for InMemoryRemote {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryRemote {
    pub fn new() -> Self {
        Self::with_feed_capacity(DEFAULT_FEED_CAPACITY)
    }

    pub fn with_feed_capacity(feed_capacity: usize) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            feed_capacity: feed_capacity.max(1),
        }
    }

    /// While offline every call fails with a transient error.
    pub fn set_offline(&self, offline: bool) {
        self.inner.lock().unwrap().offline = offline;
    }

    /// Fail the next remote call with `error`. Faults queue up in order.
    pub fn fail_next(&self, error: RemoteError) {
        self.inner.lock().unwrap().faults.push_back(error);
    }

    /// Put a confirmed board in place without emitting events.
    pub fn seed_board(&self, board: Board) {
        let mut inner = self.inner.lock().unwrap();
        inner.boards.insert(board.id.clone(), board);
    }

    /// Put a confirmed card in place without emitting events.
    pub fn seed_card(&self, card: Card) {
        let mut inner = self.inner.lock().unwrap();
        inner.cards.insert(card.id.clone(), card);
    }

    pub fn board(&self, id: &EntityId) -> Option<Board> {
        let inner = self.inner.lock().unwrap();
        inner.boards.get(id).map(|b| inner.with_count(b))
    }

    pub fn card(&self, id: &EntityId) -> Option<Card> {
        self.inner.lock().unwrap().cards.get(id).cloned()
    }

    pub fn board_count(&self) -> usize {
        self.inner.lock().unwrap().boards.len()
    }

    pub fn card_count(&self) -> usize {
        self.inner.lock().unwrap().cards.len()
    }

    /// Accepted writes, oldest first.
    pub fn calls(&self) -> Vec<RemoteCall> {
        self.inner.lock().unwrap().calls.clone()
    }

    /// Signal a feed outage to every subscriber. Changes made while
    /// disconnected are not delivered.
    pub fn disconnect_feeds(&self) {
        let mut inner = self.inner.lock().unwrap();
        for feed in inner.feeds.iter_mut() {
            feed.connected = false;
            let _ = feed.tx.try_send(FeedMessage::Disconnected);
        }
    }

    pub fn reconnect_feeds(&self) {
        let mut inner = self.inner.lock().unwrap();
        for feed in inner.feeds.iter_mut() {
            feed.connected = true;
            feed.lagged = feed.tx.try_send(FeedMessage::Reconnected).is_err();
        }
    }
}

#[async_trait]
impl RemoteClient for InMemoryRemote {
    async fn create_entity(
        &self,
        kind: EntityKind,
        client_id: &EntityId,
        snapshot: &Entity,
    ) -> Result<EntityId, RemoteError> {
        let mut inner = self.inner.lock().unwrap();
        inner.check_available()?;

        if let Some(existing) = inner.created.get(client_id) {
            return Ok(existing.clone());
        }
        if snapshot.kind() != kind {
            return Err(RemoteError::rejected(format!(
                "snapshot is not a {}",
                kind
            )));
        }

        let id = inner.next_canonical();
        let created = match snapshot {
            Entity::Board(board) => {
                if board.name.trim().is_empty() {
                    return Err(RemoteError::rejected("board name is required"));
                }
                let mut board = board.clone();
                board.id = id.clone();
                board.card_count = 0;
                inner.boards.insert(id.clone(), board.clone());
                Entity::Board(board)
            }
            Entity::Card(card) => {
                if !inner.boards.contains_key(&card.board_id) {
                    return Err(RemoteError::parent_missing(format!(
                        "board {} does not exist",
                        card.board_id
                    )));
                }
                if card.title.trim().is_empty() {
                    return Err(RemoteError::rejected("card title is required"));
                }
                let mut card = card.clone();
                card.id = id.clone();
                card.updated_at = Utc::now();
                inner.cards.insert(id.clone(), card.clone());
                Entity::Card(card)
            }
        };

        inner.created.insert(client_id.clone(), id.clone());
        inner.calls.push(RemoteCall::Create {
            kind,
            client_id: client_id.clone(),
            id: id.clone(),
        });
        inner.emit(ChangeKind::Insert, created);
        Ok(id)
    }

    async fn update_entity(
        &self,
        kind: EntityKind,
        id: &EntityId,
        changes: &Changes,
    ) -> Result<(), RemoteError> {
        let mut inner = self.inner.lock().unwrap();
        inner.check_available()?;

        let updated = match changes {
            Changes::Board(patch) if kind == EntityKind::Board => {
                let board = inner
                    .boards
                    .get_mut(id)
                    .ok_or_else(|| RemoteError::rejected(format!("board {} does not exist", id)))?;
                patch.apply(board);
                let board = board.clone();
                Entity::Board(inner.with_count(&board))
            }
            Changes::Card(patch) if kind == EntityKind::Card => {
                if inner.orphaned.contains(id) {
                    return Err(RemoteError::parent_missing(format!(
                        "board of card {} was deleted",
                        id
                    )));
                }
                let card = inner
                    .cards
                    .get_mut(id)
                    .ok_or_else(|| RemoteError::rejected(format!("card {} does not exist", id)))?;
                patch.apply(card);
                card.updated_at = Utc::now();
                Entity::Card(card.clone())
            }
            _ => return Err(RemoteError::rejected("changes do not match entity kind")),
        };

        inner.calls.push(RemoteCall::Update {
            kind,
            id: id.clone(),
            changes: changes.clone(),
        });
        inner.emit(ChangeKind::Update, updated);
        Ok(())
    }

    async fn delete_entity(&self, kind: EntityKind, id: &EntityId) -> Result<(), RemoteError> {
        let mut inner = self.inner.lock().unwrap();
        inner.check_available()?;

        let mut removed = Vec::new();
        match kind {
            EntityKind::Board => {
                if let Some(board) = inner.boards.remove(id) {
                    let card_ids: Vec<EntityId> = inner
                        .cards
                        .values()
                        .filter(|c| &c.board_id == id)
                        .map(|c| c.id.clone())
                        .collect();
                    for card_id in card_ids {
                        if let Some(card) = inner.cards.remove(&card_id) {
                            inner.orphaned.insert(card_id);
                            removed.push(Entity::Card(card));
                        }
                    }
                    removed.push(Entity::Board(board));
                }
            }
            EntityKind::Card => {
                if let Some(card) = inner.cards.remove(id) {
                    removed.push(Entity::Card(card));
                }
            }
        }

        inner.calls.push(RemoteCall::Delete {
            kind,
            id: id.clone(),
        });
        for entity in removed {
            inner.emit(ChangeKind::Delete, entity);
        }
        Ok(())
    }

    async fn subscribe(&self, scope: &Scope) -> Result<mpsc::Receiver<FeedMessage>, RemoteError> {
        let mut inner = self.inner.lock().unwrap();
        if inner.offline {
            return Err(RemoteError::transient("remote store unreachable"));
        }
        let (tx, rx) = mpsc::channel(self.feed_capacity);
        inner.feeds.push(Feed {
            scope: scope.clone(),
            tx,
            connected: true,
            lagged: false,
        });
        Ok(rx)
    }

    async fn fetch_all(&self, scope: &Scope) -> Result<Vec<Entity>, RemoteError> {
        let inner = self.inner.lock().unwrap();
        if inner.offline {
            return Err(RemoteError::transient("remote store unreachable"));
        }
        let entities = match scope {
            Scope::Boards { owner_id } => {
                let mut boards: Vec<Board> = inner
                    .boards
                    .values()
                    .filter(|b| &b.owner_id == owner_id)
                    .map(|b| inner.with_count(b))
                    .collect();
                boards.sort_by(|a, b| b.created_at.cmp(&a.created_at));
                boards.into_iter().map(Entity::Board).collect()
            }
            Scope::Cards { board_id } => {
                let mut cards: Vec<Card> = inner
                    .cards
                    .values()
                    .filter(|c| &c.board_id == board_id)
                    .cloned()
                    .collect();
                cards.sort_by(|a, b| a.position.total_cmp(&b.position));
                cards.into_iter().map(Entity::Card).collect()
            }
        };
        Ok(entities)
    }
}
