//! The sync engine: one injected service object that owns the entity store,
//! the offline queue, the reconciler and the coordinator.
//!
//! Views read from [`SyncEngine::store`] and listen on
//! [`SyncEngine::subscribe`]; every user change goes through
//! [`SyncEngine::submit`].

use std::sync::{Arc, Mutex};

use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;

use crate::config::{default_config_path, load_config, SyncConfig};
use crate::coordinator::{DrainReport, SyncCoordinator, Trigger};
use crate::error::SyncError;
use crate::events::{Notifier, StoreEvent, SyncNotice};
use crate::locks::EntityLocks;
use crate::queue::{FileJournal, MutationQueue, Operation, QueueJournal};
use crate::reconciler::{Reconciler, ResyncReport};
use crate::remote::{RemoteClient, Scope};
use crate::store::EntityStore;
use crate::types::{CardSuggestion, EntityId, EntityKind, Mutation};

pub struct SyncEngine {
    config: SyncConfig,
    store: Arc<EntityStore>,
    queue: Arc<MutationQueue>,
    locks: Arc<EntityLocks>,
    reconciler: Arc<Reconciler>,
    coordinator: Arc<SyncCoordinator>,
    notifier: Notifier,
    triggers: mpsc::UnboundedSender<Trigger>,
    idle_triggers: Mutex<Option<mpsc::UnboundedReceiver<Trigger>>>,
    runner: Mutex<Option<JoinHandle<()>>>,
    queue_reset: Option<String>,
}

impl SyncEngine {
    /// Open the engine over a queue journal. An unreadable journal is set
    /// aside and the engine starts with an empty queue; see
    /// [`SyncEngine::queue_reset`].
    pub fn open(
        config: SyncConfig,
        journal: Box<dyn QueueJournal>,
        remote: Arc<dyn RemoteClient>,
    ) -> Result<Self, SyncError> {
        let notifier = Notifier::new(config.event_capacity);
        let (queue, queue_reset) = MutationQueue::open_or_reset(journal)?;
        if let Some(reason) = &queue_reset {
            notifier.notify(SyncNotice::QueueReset {
                reason: reason.clone(),
            });
        }
        let queue = Arc::new(queue);

        let store = Arc::new(EntityStore::new(queue.clone(), config.event_capacity));
        let replayed = store.replay_pending();
        if replayed > 0 {
            log::info!("[lexera.sync.engine] Replayed {} queued mutations", replayed);
        }

        let locks = Arc::new(EntityLocks::new());
        let (triggers, idle_triggers) = mpsc::unbounded_channel();
        let reconciler = Arc::new(Reconciler::new(
            store.clone(),
            queue.clone(),
            locks.clone(),
            remote.clone(),
            triggers.clone(),
            config.request_timeout(),
        ));
        let coordinator = Arc::new(SyncCoordinator::new(
            config.clone(),
            store.clone(),
            queue.clone(),
            locks.clone(),
            remote,
            reconciler.clone(),
            notifier.clone(),
        ));

        Ok(Self {
            config,
            store,
            queue,
            locks,
            reconciler,
            coordinator,
            notifier,
            triggers,
            idle_triggers: Mutex::new(Some(idle_triggers)),
            runner: Mutex::new(None),
            queue_reset,
        })
    }

    /// Open with the queue file from `config` (or the default data dir).
    pub fn open_file(config: SyncConfig, remote: Arc<dyn RemoteClient>) -> Result<Self, SyncError> {
        let path = config.queue_path();
        log::info!("[lexera.sync.engine] Offline queue at {}", path.display());
        Self::open(config, Box::new(FileJournal::new(path)), remote)
    }

    /// Open with the config at [`default_config_path`] and its queue file.
    pub fn open_default(remote: Arc<dyn RemoteClient>) -> Result<Self, SyncError> {
        let path = default_config_path();
        Self::open_file(load_config(&path), remote)
    }

    fn lock_ids(&self, mutation: &Mutation) -> Vec<EntityId> {
        let Some(target) = mutation.target() else {
            return match mutation {
                Mutation::CreateCard(new) => vec![new.board_id.clone()],
                _ => Vec::new(),
            };
        };
        let mut ids = Vec::with_capacity(2);
        if mutation.kind() == EntityKind::Card {
            if let Some(card) = self.store.card(target) {
                ids.push(card.board_id);
            }
        }
        ids.push(target.clone());
        ids
    }

    /// Apply a user change optimistically and queue it for delivery.
    /// Returns the identity of the affected entity; inserts get a
    /// temporary identity.
    pub fn submit(&self, mutation: Mutation) -> Result<EntityId, SyncError> {
        let kind = mutation.kind();
        let ids = self.lock_ids(&mutation);
        let refs: Vec<&EntityId> = ids.iter().collect();

        let mut cancelled = false;
        let id = self.locks.with(&refs, || -> Result<EntityId, SyncError> {
            let write = self.store.apply_local(mutation)?;
            let id = write.id.clone();
            let is_delete = matches!(write.draft.operation, Operation::Delete);

            if is_delete && id.is_temporary() {
                // Never reached the remote store: cancel instead of deleting.
                return match self.queue.discard_for(&id) {
                    Ok(dropped) => {
                        log::debug!(
                            "[lexera.sync.engine] Cancelled {} queued mutations of {}",
                            dropped.len(),
                            id
                        );
                        cancelled = true;
                        Ok(id)
                    }
                    Err(e) => {
                        self.store.undo(write);
                        Err(e.into())
                    }
                };
            }

            if let Err(e) = self.queue.enqueue(write.draft.clone()) {
                log::error!("[lexera.sync.engine] Failed to queue change to {}: {}", id, e);
                self.store.undo(write);
                return Err(e.into());
            }
            if is_delete && kind == EntityKind::Board {
                // The remote delete cascades; queued card work is moot.
                self.queue.discard_children(&id)?;
            }
            Ok(id)
        })?;

        if cancelled {
            self.locks.forget(&id);
            return Ok(id);
        }
        let _ = self.triggers.send(Trigger::MutationEnqueued);
        Ok(id)
    }

    /// Turn a confirmed suggestion into a card on `board_id`.
    pub fn accept_suggestion(
        &self,
        board_id: EntityId,
        column_id: &str,
        suggestion: CardSuggestion,
    ) -> Result<EntityId, SyncError> {
        self.submit(Mutation::CreateCard(
            suggestion.into_new_card(board_id, column_id),
        ))
    }

    pub async fn watch(&self, scope: Scope) -> Result<ResyncReport, SyncError> {
        self.reconciler.subscribe(scope).await
    }

    pub fn unwatch(&self, scope: &Scope) {
        self.reconciler.unsubscribe(scope);
    }

    pub async fn drain(&self, target: Option<&EntityId>) -> Result<DrainReport, SyncError> {
        if !self.coordinator.is_online() {
            return Err(SyncError::Offline);
        }
        Ok(self.coordinator.drain(target).await)
    }

    pub fn set_online(&self, online: bool) {
        self.coordinator.set_online(online);
        let trigger = if online {
            Trigger::ConnectivityRestored
        } else {
            Trigger::ConnectivityLost
        };
        let _ = self.triggers.send(trigger);
    }

    pub fn is_online(&self) -> bool {
        self.coordinator.is_online()
    }

    /// Start the background sync loop. Returns false if it already runs.
    pub fn start(&self) -> bool {
        let Some(triggers) = self.idle_triggers.lock().unwrap().take() else {
            return false;
        };
        let handle = self.coordinator.spawn(triggers);
        *self.runner.lock().unwrap() = Some(handle);
        if !self.queue.is_empty() {
            let _ = self.triggers.send(Trigger::MutationEnqueued);
        }
        true
    }

    /// Stop the sync loop and every realtime listener. Queued mutations stay
    /// on disk for the next run.
    pub async fn shutdown(&self) {
        self.reconciler.unsubscribe_all();
        let _ = self.triggers.send(Trigger::Shutdown);
        let handle = self.runner.lock().unwrap().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                log::warn!("[lexera.sync.engine] Sync loop ended abnormally: {}", e);
            }
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StoreEvent> {
        self.store.subscribe()
    }

    pub fn notices(&self) -> broadcast::Receiver<SyncNotice> {
        self.notifier.subscribe()
    }

    pub fn store(&self) -> &EntityStore {
        &self.store
    }

    pub fn queue(&self) -> &MutationQueue {
        &self.queue
    }

    pub fn reconciler(&self) -> &Arc<Reconciler> {
        &self.reconciler
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// Why the persisted queue was discarded at open, if it was.
    pub fn queue_reset(&self) -> Option<&str> {
        self.queue_reset.as_deref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordinator::EntryStatus;
    use crate::queue::{MemoryJournal, QueueError, QueueSnapshot};
    use crate::remote::{InMemoryRemote, RemoteErrorKind};
    use crate::store::StoreError;
    use crate::types::{Board, Card, CardPatch, BoardPatch, NewBoard, NewCard, Priority};
    use chrono::Utc;
    use std::time::Duration;

    fn config() -> SyncConfig {
        SyncConfig {
            backoff_base_ms: 1,
            backoff_max_ms: 4,
            retry_budget: 2,
            ..Default::default()
        }
    }

    fn engine_on(remote: Arc<InMemoryRemote>) -> SyncEngine {
        let _ = env_logger::builder().is_test(true).try_init();
        SyncEngine::open(config(), Box::new(MemoryJournal::new()), remote).unwrap()
    }

    fn new_board(name: &str) -> Mutation {
        Mutation::CreateBoard(NewBoard {
            owner_id: "user-1".to_string(),
            name: name.to_string(),
            description: None,
        })
    }

    fn retitle(id: &str, title: &str) -> Mutation {
        Mutation::UpdateCard {
            id: EntityId::from(id),
            patch: CardPatch {
                title: Some(title.to_string()),
                ..Default::default()
            },
        }
    }

    /// Remote with board `srv-100` holding card `srv-101`.
    fn seeded_remote() -> Arc<InMemoryRemote> {
        let remote = Arc::new(InMemoryRemote::new());
        let now = Utc::now();
        remote.seed_board(Board {
            id: EntityId::from("srv-100"),
            owner_id: "user-1".to_string(),
            name: "Work".to_string(),
            description: None,
            created_at: now,
            card_count: 0,
        });
        remote.seed_card(Card {
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
        });
        remote
    }

    async fn load(engine: &SyncEngine) {
        let reconciler = engine.reconciler();
        reconciler.resync_now(&Scope::boards("user-1")).await.unwrap();
        reconciler
            .resync_now(&Scope::cards(EntityId::from("srv-100")))
            .await
            .unwrap();
    }

    async fn eventually(mut check: impl FnMut() -> bool) -> bool {
        for _ in 0..100 {
            if check() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        check()
    }

    #[tokio::test]
    async fn test_offline_board_and_card_resolve_to_canonical_ids() {
        let remote = Arc::new(InMemoryRemote::new());
        let engine = engine_on(remote.clone());
        engine.set_online(false);

        let board = engine.submit(new_board("Home")).unwrap();
        let card = engine
            .submit(Mutation::CreateCard(NewCard::new(board.clone(), "todo", "Buy milk")))
            .unwrap();
        assert!(board.is_temporary());
        assert_eq!(engine.store().card(&card).unwrap().board_id, board);
        assert!(matches!(engine.drain(None).await, Err(SyncError::Offline)));
        assert_eq!(engine.queue().len(), 2);

        engine.set_online(true);
        let report = engine.drain(None).await.unwrap();
        assert_eq!(report.confirmed(), 2);
        assert!(engine.queue().is_empty());

        let canonical = EntityId::from("srv-1");
        assert!(engine.store().board(&board).is_none());
        assert_eq!(engine.store().board(&canonical).unwrap().card_count, 1);
        let cards = engine.store().cards_on(&canonical);
        assert_eq!(cards.len(), 1);
        assert!(!cards[0].id.is_temporary());
        assert_eq!(remote.card(&cards[0].id).unwrap().board_id, canonical);
    }

    #[tokio::test]
    async fn test_remote_edit_from_other_device_shows_up() {
        let remote = seeded_remote();
        let device_a = engine_on(remote.clone());
        let device_b = engine_on(remote.clone());
        for engine in [&device_a, &device_b] {
            engine.watch(Scope::boards("user-1")).await.unwrap();
            engine
                .watch(Scope::cards(EntityId::from("srv-100")))
                .await
                .unwrap();
        }

        device_a.submit(retitle("srv-101", "From A")).unwrap();
        let report = device_a.drain(None).await.unwrap();
        assert_eq!(report.confirmed(), 1);

        let card = EntityId::from("srv-101");
        assert!(
            eventually(|| device_b.store().card(&card).map(|c| c.title) == Some("From A".to_string()))
                .await
        );
        assert!(device_b.queue().is_empty());
        assert_eq!(device_a.store().card(&card).unwrap().title, "From A");

        device_a.shutdown().await;
        device_b.shutdown().await;
    }

    #[tokio::test]
    async fn test_update_on_remotely_deleted_board_is_discarded() {
        let remote = seeded_remote();
        let engine = engine_on(remote.clone());
        load(&engine).await;
        let mut notices = engine.notices();

        engine.submit(retitle("srv-101", "Too late")).unwrap();
        remote
            .delete_entity(EntityKind::Board, &EntityId::from("srv-100"))
            .await
            .unwrap();

        let report = engine.drain(None).await.unwrap();
        match &report.outcomes[0].status {
            EntryStatus::Discarded { error } => assert_eq!(error.kind, RemoteErrorKind::ParentMissing),
            other => panic!("expected discard, got {:?}", other),
        }
        assert!(engine.queue().is_empty());
        match notices.try_recv().unwrap() {
            SyncNotice::PermanentFailure { target, error, .. } => {
                assert_eq!(target, EntityId::from("srv-101"));
                assert_eq!(error.kind, RemoteErrorKind::ParentMissing);
            }
            other => panic!("unexpected notice {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_remote_delete_dominates_pending_update() {
        let remote = seeded_remote();
        let engine = engine_on(remote.clone());
        engine.set_online(false);
        engine.watch(Scope::boards("user-1")).await.unwrap();
        engine
            .watch(Scope::cards(EntityId::from("srv-100")))
            .await
            .unwrap();

        engine.submit(retitle("srv-101", "Mine")).unwrap();
        assert!(engine.queue().pending_for(&EntityId::from("srv-101")));

        remote
            .delete_entity(EntityKind::Card, &EntityId::from("srv-101"))
            .await
            .unwrap();

        let card = EntityId::from("srv-101");
        assert!(eventually(|| engine.store().card(&card).is_none()).await);
        assert!(engine.queue().is_empty());
        engine.shutdown().await;
    }

    #[tokio::test]
    async fn test_suppressed_remote_update_waits_for_local_write() {
        let remote = seeded_remote();
        let engine = engine_on(remote.clone());
        engine.watch(Scope::boards("user-1")).await.unwrap();
        engine
            .watch(Scope::cards(EntityId::from("srv-100")))
            .await
            .unwrap();
        engine.set_online(false);

        engine.submit(retitle("srv-101", "Local")).unwrap();
        // Another session edits the same card afterwards.
        remote
            .update_entity(
                EntityKind::Card,
                &EntityId::from("srv-101"),
                &crate::types::Changes::Card(CardPatch {
                    priority: Some(Some(Priority::High)),
                    ..Default::default()
                }),
            )
            .await
            .unwrap();

        let card = EntityId::from("srv-101");
        assert!(eventually(|| engine.reconciler().held(&card).is_some()).await);
        let local = engine.store().card(&card).unwrap();
        assert_eq!(local.title, "Local");
        assert_eq!(local.priority, None);

        engine.set_online(true);
        engine.drain(None).await.unwrap();
        assert!(
            eventually(|| {
                let card = engine.store().card(&card).unwrap();
                card.title == "Local" && card.priority == Some(Priority::High)
            })
            .await
        );
        engine.shutdown().await;
    }

    #[tokio::test]
    async fn test_deleting_unconfirmed_card_cancels_its_insert() {
        let remote = Arc::new(InMemoryRemote::new());
        let engine = engine_on(remote.clone());
        engine.set_online(false);

        let board = engine.submit(new_board("Home")).unwrap();
        let card = engine
            .submit(Mutation::CreateCard(NewCard::new(board.clone(), "todo", "Oops")))
            .unwrap();
        engine.submit(Mutation::DeleteCard { id: card.clone() }).unwrap();
        assert_eq!(engine.queue().len(), 1);
        assert!(engine.store().card(&card).is_none());
        // Only the board's temporary identity still has a lock.
        assert_eq!(engine.locks.len(), 1);

        engine.set_online(true);
        engine.drain(None).await.unwrap();
        assert_eq!(remote.board_count(), 1);
        assert_eq!(remote.card_count(), 0);
        assert!(engine.locks.is_empty());
    }

    #[tokio::test]
    async fn test_deleting_board_drops_queued_card_work() {
        let remote = seeded_remote();
        let engine = engine_on(remote.clone());
        load(&engine).await;
        engine.set_online(false);

        engine.submit(retitle("srv-101", "Edited")).unwrap();
        engine
            .submit(Mutation::DeleteBoard {
                id: EntityId::from("srv-100"),
            })
            .unwrap();
        assert_eq!(engine.queue().len(), 1);
        assert!(engine.store().card(&EntityId::from("srv-101")).is_none());

        engine.set_online(true);
        let report = engine.drain(None).await.unwrap();
        assert_eq!(report.confirmed(), 1);
        assert_eq!(remote.board_count(), 0);
        assert_eq!(remote.card_count(), 0);
    }

    #[tokio::test]
    async fn test_non_finite_position_never_reaches_the_journal() {
        let dir = tempfile::tempdir().unwrap();
        let config = SyncConfig {
            queue_path: Some(dir.path().join("offline-queue.json")),
            ..config()
        };
        let remote = Arc::new(InMemoryRemote::new());

        {
            let engine = SyncEngine::open_file(config.clone(), remote.clone()).unwrap();
            engine.set_online(false);
            let board = engine.submit(new_board("Home")).unwrap();
            let mut card = NewCard::new(board, "todo", "Broken");
            card.position = Some(f64::NAN);
            let err = engine.submit(Mutation::CreateCard(card)).unwrap_err();
            assert!(matches!(err, SyncError::Store(StoreError::Invalid(_))));
        }

        let engine = SyncEngine::open_file(config, remote).unwrap();
        assert_eq!(engine.queue_reset(), None);
        assert_eq!(engine.queue().len(), 1);
    }

    #[tokio::test]
    async fn test_queue_survives_restart() {
        let dir = tempfile::tempdir().unwrap();
        let config = SyncConfig {
            queue_path: Some(dir.path().join("offline-queue.json")),
            ..config()
        };
        let remote = Arc::new(InMemoryRemote::new());

        let board = {
            let engine = SyncEngine::open_file(config.clone(), remote.clone()).unwrap();
            engine.set_online(false);
            let board = engine.submit(new_board("Draft")).unwrap();
            engine
                .submit(Mutation::UpdateBoard {
                    id: board.clone(),
                    patch: BoardPatch {
                        name: Some("Final".to_string()),
                        ..Default::default()
                    },
                })
                .unwrap();
            board
        };

        let engine = SyncEngine::open_file(config, remote.clone()).unwrap();
        assert_eq!(engine.queue().len(), 2);
        assert_eq!(engine.store().board(&board).unwrap().name, "Final");

        let report = engine.drain(None).await.unwrap();
        assert_eq!(report.confirmed(), 2);
        assert_eq!(remote.board_count(), 1);
        assert_eq!(remote.board(&EntityId::from("srv-1")).unwrap().name, "Final");
    }

    #[tokio::test]
    async fn test_corrupt_queue_resets_and_notifies() {
        let journal = MemoryJournal::new();
        journal.set_raw("{ definitely not a queue");
        let engine = SyncEngine::open(
            config(),
            Box::new(journal.clone()),
            Arc::new(InMemoryRemote::new()),
        )
        .unwrap();

        assert!(engine.queue_reset().is_some());
        assert!(engine.queue().is_empty());
        engine.submit(new_board("Fresh")).unwrap();
        assert!(journal.raw().unwrap().contains("Fresh"));
    }

    struct FullDisk;

    impl QueueJournal for FullDisk {
        fn load(&self) -> Result<Option<QueueSnapshot>, QueueError> {
            Ok(None)
        }

        fn store(&self, _snapshot: &QueueSnapshot) -> Result<(), QueueError> {
            Err(QueueError::Io(std::io::Error::new(
                std::io::ErrorKind::Other,
                "no space left on device",
            )))
        }

        fn quarantine(&self) -> Result<(), QueueError> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_failed_enqueue_reverts_optimistic_write() {
        let engine =
            SyncEngine::open(config(), Box::new(FullDisk), Arc::new(InMemoryRemote::new())).unwrap();
        let err = engine.submit(new_board("Lost")).unwrap_err();
        assert!(matches!(err, SyncError::Queue(_)));
        assert!(engine.store().boards_for("user-1").is_empty());
    }

    #[tokio::test]
    async fn test_accepted_suggestion_becomes_card() {
        let remote = seeded_remote();
        let engine = engine_on(remote.clone());
        load(&engine).await;

        let card = engine
            .accept_suggestion(
                EntityId::from("srv-100"),
                "todo",
                CardSuggestion {
                    card_text: "Call the plumber".to_string(),
                    project: Some("House".to_string()),
                    priority: Some(Priority::High),
                    due_date: None,
                },
            )
            .unwrap();

        let stored = engine.store().card(&card).unwrap();
        assert_eq!(stored.description.as_deref(), Some("Project: House"));
        assert_eq!(stored.position, 1.0);
        assert_eq!(engine.store().board(&EntityId::from("srv-100")).unwrap().card_count, 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_background_loop_syncs_submissions() {
        let remote = Arc::new(InMemoryRemote::new());
        let engine = engine_on(remote.clone());
        assert!(engine.start());
        assert!(!engine.start());

        engine.submit(new_board("Background")).unwrap();
        assert!(eventually(|| engine.queue().is_empty()).await);
        assert_eq!(remote.board_count(), 1);

        engine.shutdown().await;
    }

    #[tokio::test]
    async fn test_watching_unconfirmed_board_is_refused() {
        let engine = engine_on(Arc::new(InMemoryRemote::new()));
        engine.set_online(false);
        let board = engine.submit(new_board("Draft")).unwrap();
        assert!(matches!(
            engine.watch(Scope::cards(board)).await,
            Err(SyncError::TemporaryScope(_))
        ));
    }
}
