//! Realtime reconciler: merges pushed remote changes into the entity store.
//!
//! Upserts for an entity with a pending local mutation are suppressed and
//! the snapshot is held as the last known remote value until the queue for
//! that entity drains. Remote deletes always win. After a feed gap every
//! watched scope is refetched in full; a newer resync for a scope cancels
//! the older one.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::coordinator::Trigger;
use crate::error::SyncError;
use crate::locks::EntityLocks;
use crate::queue::{MutationQueue, QueueError};
use crate::remote::{ChangeKind, FeedMessage, RemoteClient, RemoteError, RemoteEvent, Scope};
use crate::store::{EntityStore, RemoteApply};
use crate::types::{Board, Changes, Entity, EntityId, EntityKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventOutcome {
    Applied,
    /// Held back behind a pending local mutation.
    Suppressed,
    /// Entity removed; `discarded` queued mutations dropped with it.
    Removed { discarded: usize },
    /// Nothing to apply it to (card of an unknown board).
    Ignored,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResyncReport {
    pub fetched: usize,
    pub removed: usize,
    /// A newer resync for the scope finished first; nothing was applied.
    pub superseded: bool,
}

struct ResyncSlot {
    generation: u64,
    handle: Option<JoinHandle<()>>,
}

pub struct Reconciler {
    store: Arc<EntityStore>,
    queue: Arc<MutationQueue>,
    locks: Arc<EntityLocks>,
    remote: Arc<dyn RemoteClient>,
    triggers: mpsc::UnboundedSender<Trigger>,
    request_timeout: Duration,
    /// Last known remote value of entities whose update was suppressed.
    held: Mutex<HashMap<EntityId, Entity>>,
    listeners: Mutex<HashMap<Scope, JoinHandle<()>>>,
    resyncs: Mutex<HashMap<Scope, ResyncSlot>>,
    generation: AtomicU64,
}

impl Reconciler {
    pub fn new(
        store: Arc<EntityStore>,
        queue: Arc<MutationQueue>,
        locks: Arc<EntityLocks>,
        remote: Arc<dyn RemoteClient>,
        triggers: mpsc::UnboundedSender<Trigger>,
        request_timeout: Duration,
    ) -> Self {
        Self {
            store,
            queue,
            locks,
            remote,
            triggers,
            request_timeout,
            held: Mutex::new(HashMap::new()),
            listeners: Mutex::new(HashMap::new()),
            resyncs: Mutex::new(HashMap::new()),
            generation: AtomicU64::new(0),
        }
    }

    /// Apply one pushed change. Runs under the entity lock (board first for
    /// cards); never suspends.
    pub fn on_remote_event(&self, event: RemoteEvent) -> Result<EventOutcome, QueueError> {
        let id = event.entity.id().clone();
        let mut lock_ids = Vec::with_capacity(2);
        if let Some(board_id) = event.entity.parent() {
            lock_ids.push(board_id.clone());
        }
        lock_ids.push(id.clone());
        let lock_refs: Vec<&EntityId> = lock_ids.iter().collect();

        let mut gone = Vec::new();
        let outcome = self.locks.with(&lock_refs, || {
            if event.change == ChangeKind::Delete {
                return self.remove(event.entity, &mut gone);
            }
            let snapshot = event.entity.clone();
            let outcome = match self.store.apply_remote(event.entity, false) {
                RemoteApply::Suppressed => {
                    log::debug!(
                        "[lexera.sync.reconciler] Holding remote {} {} behind pending mutation",
                        snapshot.kind(),
                        id
                    );
                    self.held.lock().unwrap().insert(id, snapshot);
                    EventOutcome::Suppressed
                }
                RemoteApply::Applied | RemoteApply::Seeded => {
                    self.held.lock().unwrap().remove(&id);
                    EventOutcome::Applied
                }
                RemoteApply::Removed | RemoteApply::Orphaned => EventOutcome::Ignored,
            };
            Ok(outcome)
        })?;

        for id in &gone {
            self.locks.forget(id);
        }
        Ok(outcome)
    }

    /// Drop a remotely deleted entity. Every identity that ceased to exist
    /// is pushed onto `gone`.
    fn remove(&self, entity: Entity, gone: &mut Vec<EntityId>) -> Result<EventOutcome, QueueError> {
        let id = entity.id().clone();
        let is_board = entity.kind() == EntityKind::Board;
        if is_board {
            gone.extend(self.store.cards_on(&id).into_iter().map(|c| c.id));
        }
        gone.push(id.clone());
        self.store.apply_remote(entity, true);
        let discarded = self.queue.discard_for(&id)?.len();

        let mut held = self.held.lock().unwrap();
        held.remove(&id);
        if is_board {
            held.retain(|_, e| e.parent() != Some(&id));
        }
        if discarded > 0 {
            log::info!(
                "[lexera.sync.reconciler] {} deleted remotely, dropped {} queued mutations",
                id,
                discarded
            );
        }
        Ok(EventOutcome::Removed { discarded })
    }

    /// Apply the held remote value of an entity whose last pending write was
    /// just confirmed. The caller holds the entity lock. Cards use
    /// last-writer-wins on `updated_at`. A held board predates the confirmed
    /// write, so that write's `changes` are laid over it.
    pub fn settle(&self, kind: EntityKind, id: &EntityId, changes: Option<&Changes>) -> bool {
        let Some(mut held) = self.take_held(kind, id) else {
            return false;
        };
        match &mut held {
            Entity::Card(card) => {
                if let Some(local_at) = self.store.updated_at(kind, id) {
                    if card.updated_at < local_at {
                        log::debug!(
                            "[lexera.sync.reconciler] Dropping stale remote value of {} ({} < {})",
                            id,
                            card.updated_at,
                            local_at
                        );
                        return false;
                    }
                }
            }
            Entity::Board(board) => {
                if let Some(Changes::Board(patch)) = changes {
                    patch.apply(board);
                }
                if self.store.board(id).is_some_and(|local| same_board(&local, board)) {
                    return false;
                }
            }
        }
        self.store.apply_remote(held, false) == RemoteApply::Applied
    }

    /// Restore the held remote value after the remote store refused the
    /// entity's last pending write.
    pub fn release(&self, kind: EntityKind, id: &EntityId) -> bool {
        match self.take_held(kind, id) {
            Some(held) => self.store.apply_remote(held, false) == RemoteApply::Applied,
            None => false,
        }
    }

    fn take_held(&self, kind: EntityKind, id: &EntityId) -> Option<Entity> {
        if self.queue.pending_for(id) {
            return None;
        }
        let held = self.held.lock().unwrap().remove(id)?;
        // Deleted locally and confirmed: the held value must not revive it.
        self.store.read(kind, id).map(|_| held)
    }

    pub fn held(&self, id: &EntityId) -> Option<Entity> {
        self.held.lock().unwrap().get(id).cloned()
    }

    /// Start receiving changes for `scope`. The scope is fetched in full
    /// before the listener starts draining its channel.
    pub async fn subscribe(self: &Arc<Self>, scope: Scope) -> Result<ResyncReport, SyncError> {
        if let Some(id) = scope.temporary_id() {
            return Err(SyncError::TemporaryScope(id.clone()));
        }

        let mut feed = tokio::time::timeout(self.request_timeout, self.remote.subscribe(&scope))
            .await
            .map_err(|_| RemoteError::transient(format!("subscribe to {} timed out", scope)))??;
        let report = self.resync_now(&scope).await?;

        let this = Arc::clone(self);
        let listen_scope = scope.clone();
        let handle = tokio::spawn(async move {
            while let Some(message) = feed.recv().await {
                this.on_feed_message(&listen_scope, message);
            }
            log::debug!("[lexera.sync.reconciler] Feed for {} closed", listen_scope);
        });

        log::info!("[lexera.sync.reconciler] Watching {}", scope);
        if let Some(previous) = self.listeners.lock().unwrap().insert(scope, handle) {
            previous.abort();
        }
        Ok(report)
    }

    pub fn unsubscribe(&self, scope: &Scope) {
        if let Some(handle) = self.listeners.lock().unwrap().remove(scope) {
            handle.abort();
        }
        if let Some(slot) = self.resyncs.lock().unwrap().remove(scope) {
            if let Some(handle) = slot.handle {
                handle.abort();
            }
        }
    }

    pub fn unsubscribe_all(&self) {
        for scope in self.watched() {
            self.unsubscribe(&scope);
        }
    }

    pub fn watched(&self) -> Vec<Scope> {
        self.listeners.lock().unwrap().keys().cloned().collect()
    }

    fn on_feed_message(self: &Arc<Self>, scope: &Scope, message: FeedMessage) {
        match message {
            FeedMessage::Change(event) => {
                if let Err(e) = self.on_remote_event(event) {
                    log::error!("[lexera.sync.reconciler] Failed to apply change for {}: {}", scope, e);
                }
            }
            FeedMessage::Disconnected => {
                log::warn!("[lexera.sync.reconciler] Feed for {} disconnected", scope);
                let _ = self.triggers.send(Trigger::ConnectivityLost);
            }
            FeedMessage::Reconnected => {
                log::info!("[lexera.sync.reconciler] Feed for {} reconnected, resyncing", scope);
                let _ = self.triggers.send(Trigger::ConnectivityRestored);
                self.resync(scope.clone());
            }
        }
    }

    /// Refetch `scope` in the background, cancelling any resync still
    /// running for it.
    pub fn resync(self: &Arc<Self>, scope: Scope) {
        let generation = self.generation.fetch_add(1, Ordering::Relaxed) + 1;
        {
            let mut resyncs = self.resyncs.lock().unwrap();
            let previous = resyncs.insert(
                scope.clone(),
                ResyncSlot {
                    generation,
                    handle: None,
                },
            );
            if let Some(handle) = previous.and_then(|slot| slot.handle) {
                handle.abort();
            }
        }

        let this = Arc::clone(self);
        let task_scope = scope.clone();
        let handle = tokio::spawn(async move {
            match this.run_resync(&task_scope, Some(generation)).await {
                Ok(report) if report.superseded => {
                    log::debug!("[lexera.sync.reconciler] Resync of {} superseded", task_scope);
                }
                Ok(report) => {
                    log::info!(
                        "[lexera.sync.reconciler] Resynced {}: {} fetched, {} removed",
                        task_scope,
                        report.fetched,
                        report.removed
                    );
                }
                Err(e) => {
                    log::warn!("[lexera.sync.reconciler] Resync of {} failed: {}", task_scope, e);
                }
            }
        });

        let mut resyncs = self.resyncs.lock().unwrap();
        match resyncs.get_mut(&scope) {
            Some(slot) if slot.generation == generation => slot.handle = Some(handle),
            _ => handle.abort(),
        }
    }

    /// Refetch `scope` inline.
    pub async fn resync_now(&self, scope: &Scope) -> Result<ResyncReport, SyncError> {
        self.run_resync(scope, None).await
    }

    fn is_current(&self, scope: &Scope, generation: u64) -> bool {
        self.resyncs
            .lock()
            .unwrap()
            .get(scope)
            .is_some_and(|slot| slot.generation == generation)
    }

    async fn run_resync(
        &self,
        scope: &Scope,
        generation: Option<u64>,
    ) -> Result<ResyncReport, SyncError> {
        let since = self.store.version();
        let entities = tokio::time::timeout(self.request_timeout, self.remote.fetch_all(scope))
            .await
            .map_err(|_| RemoteError::transient(format!("fetch of {} timed out", scope)))??;

        if let Some(generation) = generation {
            if !self.is_current(scope, generation) {
                return Ok(ResyncReport {
                    superseded: true,
                    ..Default::default()
                });
            }
        }

        let mut report = ResyncReport {
            fetched: entities.len(),
            ..Default::default()
        };
        let fetched: HashSet<EntityId> = entities.iter().map(|e| e.id().clone()).collect();
        for entity in entities {
            self.on_remote_event(RemoteEvent {
                change: ChangeKind::Update,
                entity,
            })?;
        }

        // Records the fetch did not return: canonical ones untouched since
        // the fetch started were deleted remotely during the gap, temporary
        // ones without a queued insert can never be confirmed.
        let kind = match scope {
            Scope::Boards { .. } => EntityKind::Board,
            Scope::Cards { .. } => EntityKind::Card,
        };
        for (id, version) in self.store.scope_records(scope) {
            if fetched.contains(&id) {
                continue;
            }
            let stale = if id.is_temporary() {
                !self.queue.pending_for(&id)
            } else {
                version <= since
            };
            if !stale {
                continue;
            }
            if let Some(entity) = self.store.read(kind, &id) {
                self.on_remote_event(RemoteEvent {
                    change: ChangeKind::Delete,
                    entity,
                })?;
                report.removed += 1;
            }
        }

        self.store.replay_pending();
        Ok(report)
    }
}

fn same_board(a: &Board, b: &Board) -> bool {
    a.name == b.name && a.description == b.description && a.owner_id == b.owner_id
}
