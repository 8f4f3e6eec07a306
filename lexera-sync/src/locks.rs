//! Entity-scoped critical sections.
//!
//! Every compound change to the store and the queue for one entity runs
//! while holding that entity's mutex. Card work takes the board lock first,
//! then the card lock; nothing ever locks a card before its board.
//! The guards are plain std mutexes and must never be held across an await.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use crate::types::EntityId;

#[derive(Default)]
pub struct EntityLocks {
    locks: Mutex<HashMap<EntityId, Arc<Mutex<()>>>>,
}

impl EntityLocks {
    pub fn new() -> Self {
        Self::default()
    }

    fn get(&self, id: &EntityId) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().unwrap();
        locks
            .entry(id.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Run `f` while holding the locks of `ids`, acquired in the given order.
    /// Duplicate ids are locked once.
    pub fn with<R>(&self, ids: &[&EntityId], f: impl FnOnce() -> R) -> R {
        let mut ordered: Vec<&EntityId> = Vec::with_capacity(ids.len());
        for &id in ids {
            if !ordered.contains(&id) {
                ordered.push(id);
            }
        }
        let locks: Vec<Arc<Mutex<()>>> = ordered.iter().map(|id| self.get(id)).collect();
        let _guards: Vec<MutexGuard<'_, ()>> = locks.iter().map(|l| l.lock().unwrap()).collect();
        f()
    }

    /// Drop the mutex of an identity that no longer exists (deleted or
    /// remapped). A holder keeps its own `Arc` alive until it is done.
    pub fn forget(&self, id: &EntityId) {
        self.locks.lock().unwrap().remove(id);
    }

    pub fn len(&self) -> usize {
        self.locks.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
