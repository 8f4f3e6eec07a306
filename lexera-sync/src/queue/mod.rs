//! Offline mutation queue.
//!
//! Ordered log of local mutations the remote store has not confirmed yet.
//! Every change is persisted through the [`QueueJournal`] before the
//! in-memory state moves, so the queue on disk never lags what callers
//! observed. The queue mutex is the serialization point for all readers.

pub mod journal;

use std::collections::HashSet;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{Changes, Entity, EntityId, EntityKind};
pub use journal::{FileJournal, MemoryJournal, QueueJournal};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Operation {
    /// Full snapshot of the new entity.
    Insert { snapshot: Entity },
    /// Changed fields only.
    Update { changes: Changes },
    Delete,
}

impl Operation {
    pub fn label(&self) -> &'static str {
        match self {
            Operation::Insert { .. } => "insert",
            Operation::Update { .. } => "update",
            Operation::Delete => "delete",
        }
    }

    pub fn is_insert(&self) -> bool {
        matches!(self, Operation::Insert { .. })
    }
}

/// A mutation about to be queued; the queue assigns its sequence number.
#[derive(Debug, Clone, PartialEq)]
pub struct EntryDraft {
    pub kind: EntityKind,
    pub target: EntityId,
    pub parent: Option<EntityId>,
    pub operation: Operation,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueEntry {
    /// Monotonic across the queue, hence also per entity.
    pub seq: u64,
    pub kind: EntityKind,
    pub target: EntityId,
    /// Board of a card entry.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<EntityId>,
    pub operation: Operation,
    #[serde(default)]
    pub attempts: u32,
    pub enqueued_at: DateTime<Utc>,
}

impl QueueEntry {
    /// Whether the entry targets `id` or is a card entry under board `id`.
    pub fn references(&self, id: &EntityId) -> bool {
        &self.target == id || self.parent.as_ref() == Some(id)
    }

    /// The temporary identity this entry still depends on, if any: its own
    /// target for non-inserts, or the board of a card.
    pub fn waiting_on(&self) -> Option<&EntityId> {
        if self.target.is_temporary() && !self.operation.is_insert() {
            return Some(&self.target);
        }
        self.parent.as_ref().filter(|p| p.is_temporary())
    }

    fn rewrite_identity(&mut self, from: &EntityId, to: &EntityId) -> bool {
        let mut changed = false;
        if &self.target == from {
            self.target = to.clone();
            changed = true;
        }
        if self.parent.as_ref() == Some(from) {
            self.parent = Some(to.clone());
            changed = true;
        }
        if let Operation::Insert { snapshot } = &mut self.operation {
            if snapshot.id() == from || snapshot.parent() == Some(from) {
                snapshot.rewrite_identity(from, to);
                changed = true;
            }
        }
        changed
    }
}

/// Persisted form of the queue.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueueSnapshot {
    pub next_seq: u64,
    /// Sorted by `seq`.
    pub entries: Vec<QueueEntry>,
}

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to encode queue: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("Queue journal is corrupt: {0}")]
    Corrupt(String),
}

pub struct MutationQueue {
    state: Mutex<QueueSnapshot>,
    journal: Box<dyn QueueJournal>,
}

impl MutationQueue {
    /// Load the queue from its journal.
    pub fn open(journal: Box<dyn QueueJournal>) -> Result<Self, QueueError> {
        let mut snapshot = journal.load()?.unwrap_or_default();
        snapshot.entries.sort_by_key(|e| e.seq);
        let floor = snapshot.entries.last().map_or(0, |e| e.seq + 1);
        snapshot.next_seq = snapshot.next_seq.max(floor).max(1);

        if !snapshot.entries.is_empty() {
            log::info!(
                "[lexera.sync.queue] Restored {} pending mutations",
                snapshot.entries.len()
            );
        }

        Ok(Self {
            state: Mutex::new(snapshot),
            journal,
        })
    }

    /// Like [`MutationQueue::open`], but an unreadable journal is quarantined
    /// and an empty queue starts in its place. Returns the reason when the
    /// queue was reset; the caller owes a full resync.
    pub fn open_or_reset(
        journal: Box<dyn QueueJournal>,
    ) -> Result<(Self, Option<String>), QueueError> {
        let reset = match journal.load() {
            Err(QueueError::Corrupt(reason)) => {
                log::error!(
                    "[lexera.sync.queue] Queue journal unreadable ({}), starting empty",
                    reason
                );
                journal.quarantine()?;
                Some(reason)
            }
            Err(e) => return Err(e),
            Ok(_) => None,
        };
        Ok((Self::open(journal)?, reset))
    }

    /// Empty queue over a fresh [`MemoryJournal`].
    pub fn in_memory() -> Self {
        Self {
            state: Mutex::new(QueueSnapshot {
                next_seq: 1,
                entries: Vec::new(),
            }),
            journal: Box::new(MemoryJournal::new()),
        }
    }

    /// Apply `f` to a copy of the state, persist it if `f` reports a change,
    /// then publish it.
    fn commit<R>(
        &self,
        f: impl FnOnce(&mut QueueSnapshot) -> (R, bool),
    ) -> Result<R, QueueError> {
        let mut state = self.state.lock().unwrap();
        let mut next = state.clone();
        let (result, changed) = f(&mut next);
        if changed {
            self.journal.store(&next)?;
            *state = next;
        }
        Ok(result)
    }

    /// Append a mutation. Durable when this returns.
    pub fn enqueue(&self, draft: EntryDraft) -> Result<QueueEntry, QueueError> {
        let entry = self.commit(|q| {
            let entry = QueueEntry {
                seq: q.next_seq,
                kind: draft.kind,
                target: draft.target,
                parent: draft.parent,
                operation: draft.operation,
                attempts: 0,
                enqueued_at: Utc::now(),
            };
            q.next_seq += 1;
            q.entries.push(entry.clone());
            (entry, true)
        })?;
        log::debug!(
            "[lexera.sync.queue] Enqueued #{} {} {} {}",
            entry.seq,
            entry.operation.label(),
            entry.kind,
            entry.target
        );
        Ok(entry)
    }

    /// Oldest entry targeting `id`.
    pub fn peek_next(&self, id: &EntityId) -> Option<QueueEntry> {
        let state = self.state.lock().unwrap();
        state.entries.iter().find(|e| &e.target == id).cloned()
    }

    /// Remove an entry. Returns false if it was already gone.
    pub fn dequeue(&self, entry: &QueueEntry) -> Result<bool, QueueError> {
        self.commit(|q| {
            let before = q.entries.len();
            q.entries.retain(|e| e.seq != entry.seq);
            let removed = q.entries.len() != before;
            (removed, removed)
        })
    }

    /// Rewrite every reference to `old` (targets, card parents, insert
    /// snapshots) in one persisted pass. Returns the number of entries touched.
    pub fn remap_identity(&self, old: &EntityId, new: &EntityId) -> Result<usize, QueueError> {
        self.commit(|q| {
            let touched = q
                .entries
                .iter_mut()
                .map(|e| e.rewrite_identity(old, new))
                .filter(|changed| *changed)
                .count();
            (touched, touched > 0)
        })
    }

    /// Dequeue a confirmed insert and remap its temporary identity to the
    /// canonical one, atomically. Returns false if the insert had been
    /// cancelled meanwhile (the remap still happens).
    pub fn confirm_insert(
        &self,
        entry: &QueueEntry,
        canonical: &EntityId,
    ) -> Result<bool, QueueError> {
        let old = entry.target.clone();
        self.commit(|q| {
            let before = q.entries.len();
            q.entries.retain(|e| e.seq != entry.seq);
            let removed = q.entries.len() != before;
            let touched = q
                .entries
                .iter_mut()
                .map(|e| e.rewrite_identity(&old, canonical))
                .filter(|changed| *changed)
                .count();
            (removed, removed || touched > 0)
        })
    }

    /// Bump the attempt counter of an entry; `None` if it is gone.
    pub fn record_attempt(&self, seq: u64) -> Result<Option<u32>, QueueError> {
        self.commit(|q| match q.entries.iter_mut().find(|e| e.seq == seq) {
            Some(entry) => {
                entry.attempts += 1;
                (Some(entry.attempts), true)
            }
            None => (None, false),
        })
    }

    /// Drop every entry targeting `id` and every card entry under board `id`.
    pub fn discard_for(&self, id: &EntityId) -> Result<Vec<QueueEntry>, QueueError> {
        self.discard_where(|e| e.references(id))
    }

    /// Drop card entries under board `id`, keeping the board's own entries.
    pub fn discard_children(&self, id: &EntityId) -> Result<Vec<QueueEntry>, QueueError> {
        self.discard_where(|e| e.parent.as_ref() == Some(id))
    }

    fn discard_where(
        &self,
        pred: impl Fn(&QueueEntry) -> bool,
    ) -> Result<Vec<QueueEntry>, QueueError> {
        let discarded = self.commit(|q| {
            let (dropped, kept): (Vec<QueueEntry>, Vec<QueueEntry>) =
                q.entries.drain(..).partition(|e| pred(e));
            q.entries = kept;
            let changed = !dropped.is_empty();
            (dropped, changed)
        })?;
        if !discarded.is_empty() {
            log::debug!("[lexera.sync.queue] Discarded {} entries", discarded.len());
        }
        Ok(discarded)
    }

    pub fn all(&self) -> Vec<QueueEntry> {
        self.state.lock().unwrap().entries.clone()
    }

    pub fn pending_for(&self, id: &EntityId) -> bool {
        self.state.lock().unwrap().entries.iter().any(|e| &e.target == id)
    }

    /// Entries targeting `id`, in sequence order.
    pub fn entries_for(&self, id: &EntityId) -> Vec<QueueEntry> {
        self.state
            .lock()
            .unwrap()
            .entries
            .iter()
            .filter(|e| &e.target == id)
            .cloned()
            .collect()
    }

    /// Distinct targets in order of their oldest entry.
    pub fn pending_targets(&self) -> Vec<EntityId> {
        let state = self.state.lock().unwrap();
        let mut seen = HashSet::new();
        state
            .entries
            .iter()
            .filter(|e| seen.insert(e.target.clone()))
            .map(|e| e.target.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.state.lock().unwrap().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
