//! Invalidation events for read paths and user-facing sync notices.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::remote::RemoteError;
use crate::types::{EntityId, EntityKind};

/// Emitted whenever the entity store changes, so board and card lists can
/// refresh their derived projections (card counts, ordering).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum StoreEvent {
    BoardsChanged {
        owner_id: String,
    },
    BoardChanged {
        board_id: EntityId,
    },
    CardsChanged {
        board_id: EntityId,
    },
    IdentityRemapped {
        kind: EntityKind,
        from: EntityId,
        to: EntityId,
    },
}

/// Non-blocking notifications meant for the user.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncNotice {
    /// The remote store refused a mutation; it was dropped from the queue.
    PermanentFailure {
        kind: EntityKind,
        target: EntityId,
        error: RemoteError,
        discarded: usize,
    },
    /// Delivery kept failing; the mutation stays queued for the next
    /// connectivity window.
    RetryBudgetExhausted {
        target: EntityId,
        attempts: u32,
        error: RemoteError,
    },
    Synced {
        confirmed: usize,
        failed: usize,
    },
    /// The persisted queue could not be read and was set aside. Pending
    /// offline work is lost; a full resync is required.
    QueueReset {
        reason: String,
    },
}

/// Broadcast hub for [`SyncNotice`].
#[derive(Clone)]
pub struct Notifier {
    tx: broadcast::Sender<SyncNotice>,
}

impl Notifier {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn notify(&self, notice: SyncNotice) {
        log::debug!("[lexera.sync.notice] {:?}", notice);
        // No subscriber is fine; notices are fire and forget.
        let _ = self.tx.send(notice);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SyncNotice> {
        self.tx.subscribe()
    }
}
