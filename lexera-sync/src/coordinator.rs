//! Sync coordinator: delivers queued mutations to the remote store.
//!
//! One entity's entries go out strictly in sequence order and never two at
//! a time; different entities are drained concurrently up to the configured
//! worker bound. Transient failures back off and retry within a per-pass
//! budget, permanent ones drop the entry and raise a notice.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use futures_util::stream::{self, StreamExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::config::SyncConfig;
use crate::events::{Notifier, SyncNotice};
use crate::locks::EntityLocks;
use crate::queue::{EntryDraft, MutationQueue, Operation, QueueEntry, QueueError};
use crate::reconciler::Reconciler;
use crate::remote::{RemoteClient, RemoteError};
use crate::store::EntityStore;
use crate::types::{EntityId, EntityKind};

/// Wakes the continuous sync loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    ConnectivityRestored,
    ConnectivityLost,
    MutationEnqueued,
    Shutdown,
}

#[derive(Debug, Clone, PartialEq)]
pub enum EntryStatus {
    /// Applied remotely. Inserts carry their canonical identity.
    Confirmed { canonical: Option<EntityId> },
    /// Permanently refused and dropped from the queue.
    Discarded { error: RemoteError },
    /// Still queued after the retry budget ran out.
    RetryExhausted { attempts: u32, error: RemoteError },
    /// Waits for the insert of a temporary identity.
    Deferred { waiting_on: EntityId },
    /// Left the queue while in flight (remote delete, local cancel).
    Vanished,
    /// Another drain owns this entity.
    Busy,
}

#[derive(Debug, Clone, PartialEq)]
pub struct EntryOutcome {
    pub seq: u64,
    pub kind: EntityKind,
    pub target: EntityId,
    pub status: EntryStatus,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct DrainReport {
    pub outcomes: Vec<EntryOutcome>,
}

impl DrainReport {
    pub fn confirmed(&self) -> usize {
        self.count(|s| matches!(s, EntryStatus::Confirmed { .. }))
    }

    pub fn failed(&self) -> usize {
        self.count(|s| {
            matches!(
                s,
                EntryStatus::Discarded { .. } | EntryStatus::RetryExhausted { .. }
            )
        })
    }

    pub fn is_empty(&self) -> bool {
        self.outcomes.is_empty()
    }

    fn count(&self, pred: impl Fn(&EntryStatus) -> bool) -> usize {
        self.outcomes.iter().filter(|o| pred(&o.status)).count()
    }

    fn made_progress(&self) -> bool {
        self.outcomes.iter().any(|o| {
            matches!(
                o.status,
                EntryStatus::Confirmed { .. } | EntryStatus::Discarded { .. } | EntryStatus::Vanished
            )
        })
    }

    fn push(&mut self, entry: &QueueEntry, status: EntryStatus) {
        self.outcomes.push(EntryOutcome {
            seq: entry.seq,
            kind: entry.kind,
            target: entry.target.clone(),
            status,
        });
    }
}

/// Marks an entity as being drained; released on drop, including when the
/// drain future is cancelled.
struct InFlight<'a> {
    set: &'a Mutex<HashSet<EntityId>>,
    id: EntityId,
}

impl<'a> InFlight<'a> {
    fn acquire(set: &'a Mutex<HashSet<EntityId>>, id: &EntityId) -> Option<Self> {
        if !set.lock().unwrap().insert(id.clone()) {
            return None;
        }
        Some(Self {
            set,
            id: id.clone(),
        })
    }

    /// Follow the entity to its canonical identity.
    fn rename(&mut self, to: &EntityId) {
        let mut set = self.set.lock().unwrap();
        set.remove(&self.id);
        set.insert(to.clone());
        self.id = to.clone();
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.set.lock().unwrap().remove(&self.id);
    }
}

pub struct SyncCoordinator {
    config: SyncConfig,
    store: Arc<EntityStore>,
    queue: Arc<MutationQueue>,
    locks: Arc<EntityLocks>,
    remote: Arc<dyn RemoteClient>,
    reconciler: Arc<Reconciler>,
    notifier: Notifier,
    in_flight: Mutex<HashSet<EntityId>>,
    online: AtomicBool,
}

impl SyncCoordinator {
    pub fn new(
        config: SyncConfig,
        store: Arc<EntityStore>,
        queue: Arc<MutationQueue>,
        locks: Arc<EntityLocks>,
        remote: Arc<dyn RemoteClient>,
        reconciler: Arc<Reconciler>,
        notifier: Notifier,
    ) -> Self {
        Self {
            config,
            store,
            queue,
            locks,
            remote,
            reconciler,
            notifier,
            in_flight: Mutex::new(HashSet::new()),
            online: AtomicBool::new(true),
        }
    }

    pub fn is_online(&self) -> bool {
        self.online.load(Ordering::Relaxed)
    }

    pub fn set_online(&self, online: bool) {
        let was = self.online.swap(online, Ordering::Relaxed);
        if was != online {
            log::info!(
                "[lexera.sync.coordinator] {}",
                if online { "Online" } else { "Offline" }
            );
        }
    }

    /// Deliver queued mutations for one entity, or for all of them.
    pub async fn drain(&self, target: Option<&EntityId>) -> DrainReport {
        let report = match target {
            Some(id) => self.drain_entity(id.clone()).await,
            None => self.drain_all().await,
        };
        if report.confirmed() > 0 {
            self.notifier.notify(SyncNotice::Synced {
                confirmed: report.confirmed(),
                failed: report.failed(),
            });
        }
        report
    }

    async fn drain_all(&self) -> DrainReport {
        let mut report = DrainReport::default();
        let mut stalled: HashSet<EntityId> = HashSet::new();

        loop {
            let targets: Vec<EntityId> = self
                .queue
                .pending_targets()
                .into_iter()
                .filter(|id| !stalled.contains(id))
                .collect();
            if targets.is_empty() {
                break;
            }

            let passes: Vec<DrainReport> = stream::iter(targets)
                .map(|id| self.drain_entity(id))
                .buffer_unordered(self.config.workers.max(1))
                .collect()
                .await;

            let progressed = passes.iter().any(DrainReport::made_progress);
            for pass in passes {
                for outcome in &pass.outcomes {
                    if matches!(
                        outcome.status,
                        EntryStatus::RetryExhausted { .. } | EntryStatus::Busy
                    ) {
                        stalled.insert(outcome.target.clone());
                    }
                }
                report.outcomes.extend(pass.outcomes);
            }
            if !progressed || !self.is_online() {
                break;
            }
        }

        log::debug!(
            "[lexera.sync.coordinator] Drain finished: {} confirmed, {} failed, {} still queued",
            report.confirmed(),
            report.failed(),
            self.queue.len()
        );
        report
    }

    async fn drain_entity(&self, id: EntityId) -> DrainReport {
        let mut report = DrainReport::default();
        let Some(first) = self.queue.peek_next(&id) else {
            return report;
        };
        let Some(mut in_flight) = InFlight::acquire(&self.in_flight, &id) else {
            report.push(&first, EntryStatus::Busy);
            return report;
        };

        let mut current = id;
        while let Some(entry) = self.queue.peek_next(&current) {
            if let Some(waiting_on) = entry.waiting_on() {
                let waiting_on = waiting_on.clone();
                report.push(&entry, EntryStatus::Deferred { waiting_on });
                break;
            }

            let status = match self.deliver(&entry).await {
                Ok(status) => status,
                Err(e) => {
                    log::error!(
                        "[lexera.sync.coordinator] Queue update for {} failed: {}",
                        entry.target,
                        e
                    );
                    break;
                }
            };

            let stop = matches!(status, EntryStatus::RetryExhausted { .. });
            if let EntryStatus::Confirmed {
                canonical: Some(canonical),
            } = &status
            {
                in_flight.rename(canonical);
                current = canonical.clone();
            }
            report.push(&entry, status);
            if stop {
                break;
            }
        }
        report
    }

    /// Send one entry, retrying transient failures with backoff.
    async fn deliver(&self, entry: &QueueEntry) -> Result<EntryStatus, QueueError> {
        let budget = self.config.retry_budget.max(1);
        let mut tries = 0;

        loop {
            match self.call(entry).await {
                Ok(canonical) => return self.confirm(entry, canonical),
                Err(error) if error.is_transient() => {
                    let Some(attempts) = self.queue.record_attempt(entry.seq)? else {
                        return Ok(EntryStatus::Vanished);
                    };
                    tries += 1;
                    if tries >= budget || !self.is_online() {
                        log::warn!(
                            "[lexera.sync.coordinator] Giving up on {} {} after {} attempts: {}",
                            entry.operation.label(),
                            entry.target,
                            attempts,
                            error
                        );
                        self.notifier.notify(SyncNotice::RetryBudgetExhausted {
                            target: entry.target.clone(),
                            attempts,
                            error: error.clone(),
                        });
                        return Ok(EntryStatus::RetryExhausted { attempts, error });
                    }
                    let delay = self.config.backoff_for(attempts);
                    log::debug!(
                        "[lexera.sync.coordinator] {} {} failed ({}), retry in {:?}",
                        entry.operation.label(),
                        entry.target,
                        error,
                        delay
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(error) => return self.reject(entry, error),
            }
        }
    }

    async fn call(&self, entry: &QueueEntry) -> Result<Option<EntityId>, RemoteError> {
        let request = async {
            match &entry.operation {
                Operation::Insert { snapshot } => self
                    .remote
                    .create_entity(entry.kind, &entry.target, snapshot)
                    .await
                    .map(Some),
                Operation::Update { changes } => self
                    .remote
                    .update_entity(entry.kind, &entry.target, changes)
                    .await
                    .map(|_| None),
                Operation::Delete => self
                    .remote
                    .delete_entity(entry.kind, &entry.target)
                    .await
                    .map(|_| None),
            }
        };
        match tokio::time::timeout(self.config.request_timeout(), request).await {
            Ok(result) => result,
            Err(_) => Err(RemoteError::transient(format!(
                "{} {} timed out",
                entry.operation.label(),
                entry.target
            ))),
        }
    }

    fn lock_ids(entry: &QueueEntry) -> Vec<EntityId> {
        let mut ids = Vec::with_capacity(2);
        if let Some(parent) = &entry.parent {
            ids.push(parent.clone());
        }
        ids.push(entry.target.clone());
        ids
    }

    fn confirm(
        &self,
        entry: &QueueEntry,
        canonical: Option<EntityId>,
    ) -> Result<EntryStatus, QueueError> {
        let ids = Self::lock_ids(entry);
        let refs: Vec<&EntityId> = ids.iter().collect();

        let status = self.locks.with(&refs, || -> Result<EntryStatus, QueueError> {
            let Some(canonical) = canonical else {
                if !self.queue.dequeue(entry)? {
                    return Ok(EntryStatus::Vanished);
                }
                let changes = match &entry.operation {
                    Operation::Update { changes } => Some(changes),
                    _ => None,
                };
                self.reconciler.settle(entry.kind, &entry.target, changes);
                return Ok(EntryStatus::Confirmed { canonical: None });
            };

            if !self.queue.confirm_insert(entry, &canonical)? {
                // Cancelled locally while the create was in flight: the
                // remote entity exists now and has to go again.
                log::info!(
                    "[lexera.sync.coordinator] {} was deleted before {} confirmed, deleting remotely",
                    entry.target,
                    canonical
                );
                if let Some(echo) = self.store.read(entry.kind, &canonical) {
                    self.store.apply_remote(echo, true);
                }
                self.queue.enqueue(EntryDraft {
                    kind: entry.kind,
                    target: canonical,
                    parent: entry.parent.clone(),
                    operation: Operation::Delete,
                })?;
                return Ok(EntryStatus::Vanished);
            }

            self.store.remap(entry.kind, &entry.target, &canonical);
            log::info!(
                "[lexera.sync.coordinator] {} {} confirmed as {}",
                entry.kind,
                entry.target,
                canonical
            );
            self.reconciler.settle(entry.kind, &canonical, None);
            Ok(EntryStatus::Confirmed {
                canonical: Some(canonical),
            })
        })?;

        // The temporary identity is gone after an insert, the entity itself
        // after a delete.
        if matches!(entry.operation, Operation::Insert { .. } | Operation::Delete) {
            self.locks.forget(&entry.target);
        }
        Ok(status)
    }

    fn reject(&self, entry: &QueueEntry, error: RemoteError) -> Result<EntryStatus, QueueError> {
        let ids = Self::lock_ids(entry);
        let refs: Vec<&EntityId> = ids.iter().collect();

        let discarded = self.locks.with(&refs, || -> Result<usize, QueueError> {
            if !self.queue.dequeue(entry)? {
                return Ok(0);
            }
            let mut discarded = 1;
            if entry.operation.is_insert() {
                // Nothing else addressed to this identity can be delivered.
                discarded += self.queue.discard_for(&entry.target)?.len();
            }
            if self.reconciler.release(entry.kind, &entry.target) {
                log::info!(
                    "[lexera.sync.coordinator] Restored remote value of {}",
                    entry.target
                );
            }
            Ok(discarded)
        })?;

        if discarded == 0 {
            return Ok(EntryStatus::Vanished);
        }
        log::warn!(
            "[lexera.sync.coordinator] {} {} refused: {} ({} queued mutations dropped)",
            entry.operation.label(),
            entry.target,
            error,
            discarded
        );
        self.notifier.notify(SyncNotice::PermanentFailure {
            kind: entry.kind,
            target: entry.target.clone(),
            error: error.clone(),
            discarded,
        });
        Ok(EntryStatus::Discarded { error })
    }

    /// Drain on every trigger until `Shutdown` or until all senders are gone.
    /// Triggers arriving while a drain runs are coalesced into one.
    pub async fn run_continuously(self: Arc<Self>, mut triggers: mpsc::UnboundedReceiver<Trigger>) {
        log::info!("[lexera.sync.coordinator] Sync loop started");
        while let Some(first) = triggers.recv().await {
            let mut wanted = false;
            let mut stop = false;
            let mut next = Some(first);
            while let Some(trigger) = next {
                match trigger {
                    Trigger::ConnectivityRestored => {
                        self.set_online(true);
                        wanted = true;
                    }
                    Trigger::ConnectivityLost => self.set_online(false),
                    Trigger::MutationEnqueued => wanted = true,
                    Trigger::Shutdown => stop = true,
                }
                next = triggers.try_recv().ok();
            }
            if stop {
                break;
            }
            if wanted && self.is_online() && !self.queue.is_empty() {
                self.drain(None).await;
            }
        }
        log::info!("[lexera.sync.coordinator] Sync loop stopped");
    }

    pub fn spawn(self: &Arc<Self>, triggers: mpsc::UnboundedReceiver<Trigger>) -> JoinHandle<()> {
        tokio::spawn(Arc::clone(self).run_continuously(triggers))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reconciler::EventOutcome;
    use crate::remote::memory::RemoteCall;
    use crate::remote::{ChangeKind, InMemoryRemote, RemoteEvent, Scope};
    use crate::types::{Board, BoardPatch, Card, CardPatch, Changes, Entity, Mutation, NewBoard};
    use async_trait::async_trait;
    use chrono::{Duration as ChronoDuration, Utc};
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    struct Fixture {
        store: Arc<EntityStore>,
        queue: Arc<MutationQueue>,
        locks: Arc<EntityLocks>,
        remote: Arc<InMemoryRemote>,
        reconciler: Arc<Reconciler>,
        coordinator: Arc<SyncCoordinator>,
        notices: tokio::sync::broadcast::Receiver<SyncNotice>,
    }

    fn test_config() -> SyncConfig {
        SyncConfig {
            backoff_base_ms: 1,
            backoff_max_ms: 4,
            retry_budget: 3,
            ..Default::default()
        }
    }

    fn fixture() -> Fixture {
        let remote = Arc::new(InMemoryRemote::new());
        build(test_config(), remote.clone(), remote)
    }

    /// `remote` is the backing store the assertions look at, `client` is
    /// what the coordinator talks to.
    fn build(config: SyncConfig, remote: Arc<InMemoryRemote>, client: Arc<dyn RemoteClient>) -> Fixture {
        let _ = env_logger::builder().is_test(true).try_init();
        let queue = Arc::new(MutationQueue::in_memory());
        let store = Arc::new(EntityStore::new(queue.clone(), 64));
        let locks = Arc::new(EntityLocks::new());
        let (tx, _rx) = mpsc::unbounded_channel();
        let reconciler = Arc::new(Reconciler::new(
            store.clone(),
            queue.clone(),
            locks.clone(),
            client.clone(),
            tx,
            config.request_timeout(),
        ));
        let notifier = Notifier::new(16);
        let notices = notifier.subscribe();
        let coordinator = Arc::new(SyncCoordinator::new(
            config,
            store.clone(),
            queue.clone(),
            locks.clone(),
            client,
            reconciler.clone(),
            notifier,
        ));
        Fixture {
            store,
            queue,
            locks,
            remote,
            reconciler,
            coordinator,
            notices,
        }
    }

    /// Forwards to an in-memory remote. Every write takes `pace`; the first
    /// `stalls` writes never answer. Records the peak number of writes in
    /// flight at once.
    struct PacedRemote {
        inner: Arc<InMemoryRemote>,
        pace: Duration,
        stalls: AtomicUsize,
        active: AtomicUsize,
        peak: AtomicUsize,
    }

    struct Active<'a>(&'a AtomicUsize);

    impl Drop for Active<'_> {
        fn drop(&mut self) {
            self.0.fetch_sub(1, Ordering::SeqCst);
        }
    }

    impl PacedRemote {
        fn new(inner: Arc<InMemoryRemote>, pace: Duration, stalls: usize) -> Arc<Self> {
            Arc::new(Self {
                inner,
                pace,
                stalls: AtomicUsize::new(stalls),
                active: AtomicUsize::new(0),
                peak: AtomicUsize::new(0),
            })
        }

        async fn write(&self) {
            let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            let _active = Active(&self.active);
            self.peak.fetch_max(now, Ordering::SeqCst);
            let stalled = self
                .stalls
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if stalled {
                tokio::time::sleep(Duration::from_secs(3600)).await;
            }
            tokio::time::sleep(self.pace).await;
        }
    }

    #[async_trait]
    impl RemoteClient for PacedRemote {
        async fn create_entity(
            &self,
            kind: EntityKind,
            client_id: &EntityId,
            snapshot: &Entity,
        ) -> Result<EntityId, RemoteError> {
            self.write().await;
            self.inner.create_entity(kind, client_id, snapshot).await
        }

        async fn update_entity(
            &self,
            kind: EntityKind,
            id: &EntityId,
            changes: &Changes,
        ) -> Result<(), RemoteError> {
            self.write().await;
            self.inner.update_entity(kind, id, changes).await
        }

        async fn delete_entity(&self, kind: EntityKind, id: &EntityId) -> Result<(), RemoteError> {
            self.write().await;
            self.inner.delete_entity(kind, id).await
        }

        async fn subscribe(
            &self,
            scope: &Scope,
        ) -> Result<mpsc::Receiver<crate::remote::FeedMessage>, RemoteError> {
            self.inner.subscribe(scope).await
        }

        async fn fetch_all(&self, scope: &Scope) -> Result<Vec<Entity>, RemoteError> {
            self.inner.fetch_all(scope).await
        }
    }

    fn board(id: &str, name: &str) -> Board {
        Board {
            id: EntityId::from(id),
            owner_id: "user-1".to_string(),
            name: name.to_string(),
            description: None,
            created_at: Utc::now(),
            card_count: 0,
        }
    }

    /// A confirmed board known to both sides.
    fn seeded(f: &Fixture, id: &str, name: &str) -> EntityId {
        f.remote.seed_board(board(id, name));
        f.store.apply_remote(Entity::Board(board(id, name)), false);
        EntityId::from(id)
    }

    fn submit(f: &Fixture, mutation: Mutation) -> EntityId {
        let write = f.store.apply_local(mutation).unwrap();
        f.queue.enqueue(write.draft.clone()).unwrap();
        write.id
    }

    fn new_board(name: &str) -> Mutation {
        Mutation::CreateBoard(NewBoard {
            owner_id: "user-1".to_string(),
            name: name.to_string(),
            description: None,
        })
    }

    fn rename(id: &EntityId, name: &str) -> Mutation {
        Mutation::UpdateBoard {
            id: id.clone(),
            patch: BoardPatch {
                name: Some(name.to_string()),
                ..Default::default()
            },
        }
    }

    #[tokio::test]
    async fn test_entries_reach_remote_in_order() {
        let f = fixture();
        let board = submit(&f, new_board("A"));
        submit(&f, rename(&board, "B"));
        submit(&f, rename(&board, "C"));

        let report = f.coordinator.drain(None).await;
        assert_eq!(report.confirmed(), 3);
        assert!(f.queue.is_empty());

        let calls = f.remote.calls();
        let canonical = match &calls[0] {
            RemoteCall::Create { id, .. } => id.clone(),
            other => panic!("expected create first, got {:?}", other),
        };
        let names: Vec<String> = calls[1..]
            .iter()
            .filter_map(|c| match c {
                RemoteCall::Update {
                    changes: Changes::Board(p),
                    ..
                } => p.name.clone(),
                _ => None,
            })
            .collect();
        assert_eq!(names, vec!["B", "C"]);
        assert_eq!(f.remote.board(&canonical).unwrap().name, "C");
        assert_eq!(f.store.board(&canonical).unwrap().name, "C");
    }

    #[tokio::test]
    async fn test_transient_failure_retries_then_confirms() {
        let mut f = fixture();
        let board = submit(&f, new_board("A"));
        f.remote.fail_next(RemoteError::transient("503"));
        f.remote.fail_next(RemoteError::transient("timeout"));

        let report = f.coordinator.drain(Some(&board)).await;
        assert_eq!(report.confirmed(), 1);
        assert_eq!(f.remote.board_count(), 1);
        assert!(matches!(
            f.notices.try_recv().unwrap(),
            SyncNotice::Synced { confirmed: 1, failed: 0 }
        ));
    }

    #[tokio::test]
    async fn test_exhausted_budget_keeps_entry_and_stops_entity() {
        let mut f = fixture();
        let board = submit(&f, new_board("A"));
        submit(&f, rename(&board, "B"));
        f.remote.set_offline(true);

        let report = f.coordinator.drain(None).await;
        assert_eq!(report.outcomes.len(), 1);
        assert!(matches!(
            report.outcomes[0].status,
            EntryStatus::RetryExhausted { attempts: 3, .. }
        ));
        assert_eq!(f.queue.len(), 2);
        assert_eq!(f.queue.all()[0].attempts, 3);
        assert!(matches!(
            f.notices.try_recv().unwrap(),
            SyncNotice::RetryBudgetExhausted { attempts: 3, .. }
        ));

        f.remote.set_offline(false);
        let report = f.coordinator.drain(None).await;
        assert_eq!(report.confirmed(), 2);
    }

    #[tokio::test]
    async fn test_rejected_insert_discards_followups() {
        let mut f = fixture();
        let board = submit(&f, new_board("A"));
        submit(&f, rename(&board, "B"));
        f.remote.fail_next(RemoteError::rejected("not allowed"));

        let report = f.coordinator.drain(None).await;
        assert_eq!(report.failed(), 1);
        assert!(f.queue.is_empty());
        assert_eq!(f.remote.board_count(), 0);
        match f.notices.try_recv().unwrap() {
            SyncNotice::PermanentFailure { target, discarded, .. } => {
                assert_eq!(target, board);
                assert_eq!(discarded, 2);
            }
            other => panic!("unexpected notice {:?}", other),
        }
        // The optimistic record stays until the next resync.
        assert!(f.store.board(&board).is_some());
    }

    #[tokio::test]
    async fn test_redelivered_insert_is_not_duplicated() {
        let f = fixture();
        let board = submit(&f, new_board("A"));
        let entry = f.queue.peek_next(&board).unwrap();

        // First delivery landed but the process died before the dequeue.
        let snapshot = match &entry.operation {
            Operation::Insert { snapshot } => snapshot.clone(),
            _ => unreachable!(),
        };
        let first = f
            .remote
            .create_entity(EntityKind::Board, &board, &snapshot)
            .await
            .unwrap();

        let report = f.coordinator.drain(None).await;
        assert_eq!(
            report.outcomes[0].status,
            EntryStatus::Confirmed {
                canonical: Some(first.clone())
            }
        );
        assert_eq!(f.remote.board_count(), 1);
        assert_eq!(f.store.boards_for("user-1").len(), 1);
    }

    #[tokio::test]
    async fn test_second_drain_of_same_entity_is_busy() {
        let f = fixture();
        let id = seeded(&f, "srv-100", "A");
        submit(&f, rename(&id, "B"));

        let guard = InFlight::acquire(&f.coordinator.in_flight, &id).unwrap();
        let report = f.coordinator.drain(Some(&id)).await;
        assert_eq!(report.outcomes[0].status, EntryStatus::Busy);
        drop(guard);

        let report = f.coordinator.drain(Some(&id)).await;
        assert_eq!(report.confirmed(), 1);
    }

    #[tokio::test]
    async fn test_loop_drains_on_trigger_and_stops() {
        let f = fixture();
        let board = submit(&f, new_board("A"));
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = f.coordinator.spawn(rx);

        tx.send(Trigger::MutationEnqueued).unwrap();
        for _ in 0..50 {
            if f.queue.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(f.queue.is_empty());
        assert!(f.store.board(&board).is_none());

        tx.send(Trigger::Shutdown).unwrap();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_timed_out_call_is_retried_as_transient() {
        let remote = Arc::new(InMemoryRemote::new());
        let client = PacedRemote::new(remote.clone(), Duration::ZERO, 3);
        let config = SyncConfig {
            request_timeout_ms: 20,
            ..test_config()
        };
        let f = build(config, remote, client);
        let board = submit(&f, new_board("A"));

        let report = f.coordinator.drain(Some(&board)).await;
        match &report.outcomes[0].status {
            EntryStatus::RetryExhausted { attempts, error } => {
                assert_eq!(*attempts, 3);
                assert!(error.is_transient());
                assert!(error.message.contains("timed out"));
            }
            other => panic!("expected retry exhaustion, got {:?}", other),
        }
        assert_eq!(f.queue.len(), 1);
        assert_eq!(f.remote.board_count(), 0);

        let report = f.coordinator.drain(None).await;
        assert_eq!(report.confirmed(), 1);
        assert_eq!(f.remote.board_count(), 1);
    }

    #[tokio::test]
    async fn test_drain_keeps_at_most_workers_entities_in_flight() {
        let remote = Arc::new(InMemoryRemote::new());
        let client = PacedRemote::new(remote.clone(), Duration::from_millis(20), 0);
        let config = SyncConfig {
            workers: 2,
            ..test_config()
        };
        let f = build(config, remote, client.clone());
        for n in 0..5 {
            let id = seeded(&f, &format!("srv-{}", 100 + n), "A");
            submit(&f, rename(&id, "B"));
        }

        let report = f.coordinator.drain(None).await;
        assert_eq!(report.confirmed(), 5);
        assert_eq!(client.peak.load(Ordering::SeqCst), 2);
        assert_eq!(client.active.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_rejected_update_restores_held_remote_value() {
        let f = fixture();
        seeded(&f, "srv-100", "Work");
        let now = Utc::now() - ChronoDuration::minutes(1);
        let remote_card = Card {
            id: EntityId::from("srv-101"),
            board_id: EntityId::from("srv-100"),
            column_id: "todo".to_string(),
            title: "Original".to_string(),
            description: None,
            priority: None,
            due_date: None,
            position: 0.0,
            created_at: now,
            updated_at: now,
        };
        f.remote.seed_card(remote_card.clone());
        f.store.apply_remote(Entity::Card(remote_card.clone()), false);
        let id = EntityId::from("srv-101");
        submit(
            &f,
            Mutation::UpdateCard {
                id: id.clone(),
                patch: CardPatch {
                    title: Some("Local".to_string()),
                    ..Default::default()
                },
            },
        );

        let mut concurrent = remote_card;
        concurrent.title = "Remote".to_string();
        let outcome = f
            .reconciler
            .on_remote_event(RemoteEvent {
                change: ChangeKind::Update,
                entity: Entity::Card(concurrent),
            })
            .unwrap();
        assert_eq!(outcome, EventOutcome::Suppressed);

        f.remote.fail_next(RemoteError::rejected("card is locked"));
        let report = f.coordinator.drain(Some(&id)).await;
        assert!(matches!(report.outcomes[0].status, EntryStatus::Discarded { .. }));
        assert!(f.reconciler.held(&id).is_none());
        // The refused write never took effect, so the remote value wins
        // even though it is older.
        assert_eq!(f.store.card(&id).unwrap().title, "Remote");
    }

    #[tokio::test]
    async fn test_held_board_echo_does_not_undo_later_rename() {
        let f = fixture();
        let id = seeded(&f, "srv-100", "A");
        submit(&f, rename(&id, "B"));
        submit(&f, rename(&id, "C"));

        // Echo of the first rename, carrying a description set elsewhere.
        let mut echo = board("srv-100", "B");
        echo.description = Some("From phone".to_string());
        let outcome = f
            .reconciler
            .on_remote_event(RemoteEvent {
                change: ChangeKind::Update,
                entity: Entity::Board(echo),
            })
            .unwrap();
        assert_eq!(outcome, EventOutcome::Suppressed);

        let report = f.coordinator.drain(Some(&id)).await;
        assert_eq!(report.confirmed(), 2);
        let local = f.store.board(&id).unwrap();
        assert_eq!(local.name, "C");
        assert_eq!(local.description.as_deref(), Some("From phone"));
        assert!(f.reconciler.held(&id).is_none());
    }

    #[tokio::test]
    async fn test_confirmed_insert_and_delete_release_locks() {
        let f = fixture();
        submit(&f, new_board("A"));
        f.coordinator.drain(None).await;
        let canonical = f.store.boards_for("user-1")[0].id.clone();
        assert!(!canonical.is_temporary());
        assert!(f.locks.is_empty());

        submit(&f, Mutation::DeleteBoard { id: canonical });
        let report = f.coordinator.drain(None).await;
        assert_eq!(report.confirmed(), 1);
        assert_eq!(f.remote.board_count(), 0);
        assert!(f.locks.is_empty());
    }
}
