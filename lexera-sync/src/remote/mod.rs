//! Contract with the remote store: CRUD calls plus a push-based change feed.

pub mod memory;

use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::types::{Changes, Entity, EntityId, EntityKind};
pub use memory::InMemoryRemote;

/// What a realtime subscription covers.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Scope {
    /// All boards of one owner.
    Boards { owner_id: String },
    /// All cards of one board.
    Cards { board_id: EntityId },
}

impl Scope {
    pub fn boards(owner_id: impl Into<String>) -> Self {
        Scope::Boards {
            owner_id: owner_id.into(),
        }
    }

    pub fn cards(board_id: EntityId) -> Self {
        Scope::Cards { board_id }
    }

    pub fn contains(&self, entity: &Entity) -> bool {
        match (self, entity) {
            (Scope::Boards { owner_id }, Entity::Board(b)) => &b.owner_id == owner_id,
            (Scope::Cards { board_id }, Entity::Card(c)) => &c.board_id == board_id,
            _ => false,
        }
    }

    /// A temporary board can not be subscribed to: the remote store has
    /// never heard of it.
    pub fn temporary_id(&self) -> Option<&EntityId> {
        match self {
            Scope::Cards { board_id } if board_id.is_temporary() => Some(board_id),
            _ => None,
        }
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Scope::Boards { owner_id } => write!(f, "boards of {}", owner_id),
            Scope::Cards { board_id } => write!(f, "cards of {}", board_id),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    Insert,
    Update,
    Delete,
}

/// One change pushed by the remote store. Deletes carry the last known
/// snapshot of the removed record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteEvent {
    pub change: ChangeKind,
    pub entity: Entity,
}

/// Messages delivered on a subscription channel, in feed order.
#[derive(Debug, Clone, PartialEq)]
pub enum FeedMessage {
    Change(RemoteEvent),
    /// The feed dropped; events may be missed until `Reconnected`.
    Disconnected,
    /// The feed is back. Nothing received before implies completeness.
    Reconnected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RemoteErrorKind {
    /// Network failure, timeout, server unavailable. Retry-eligible.
    Transient,
    /// Validation or authorization rejection.
    Rejected,
    /// The board (or column) the write refers to no longer exists.
    ParentMissing,
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("{kind:?}: {message}")]
pub struct RemoteError {
    pub kind: RemoteErrorKind,
    pub message: String,
}

impl RemoteError {
    pub fn transient(message: impl Into<String>) -> Self {
        Self {
            kind: RemoteErrorKind::Transient,
            message: message.into(),
        }
    }

    pub fn rejected(message: impl Into<String>) -> Self {
        Self {
            kind: RemoteErrorKind::Rejected,
            message: message.into(),
        }
    }

    pub fn parent_missing(message: impl Into<String>) -> Self {
        Self {
            kind: RemoteErrorKind::ParentMissing,
            message: message.into(),
        }
    }

    pub fn is_transient(&self) -> bool {
        self.kind == RemoteErrorKind::Transient
    }
}

/// The remote store as seen by the engine.
///
/// Every failure must be classified: the coordinator retries `Transient`
/// errors and discards the mutation on anything else.
#[async_trait]
pub trait RemoteClient: Send + Sync {
    /// Create an entity. `client_id` is the temporary identity and doubles as
    /// an idempotency key: creating the same `client_id` twice returns the
    /// first canonical identity without creating anything.
    async fn create_entity(
        &self,
        kind: EntityKind,
        client_id: &EntityId,
        snapshot: &Entity,
    ) -> Result<EntityId, RemoteError>;

    async fn update_entity(
        &self,
        kind: EntityKind,
        id: &EntityId,
        changes: &Changes,
    ) -> Result<(), RemoteError>;

    /// Deleting an entity that is already gone is an acknowledgement.
    async fn delete_entity(&self, kind: EntityKind, id: &EntityId) -> Result<(), RemoteError>;

    async fn subscribe(&self, scope: &Scope) -> Result<mpsc::Receiver<FeedMessage>, RemoteError>;

    async fn fetch_all(&self, scope: &Scope) -> Result<Vec<Entity>, RemoteError>;
}
