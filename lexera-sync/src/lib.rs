//! Offline-first synchronization of Lexera boards and cards.
//!
//! Local changes are applied to the [`store::EntityStore`] immediately and
//! recorded in a durable [`queue::MutationQueue`]; the
//! [`coordinator::SyncCoordinator`] delivers them when the remote store is
//! reachable while the [`reconciler::Reconciler`] merges realtime changes
//! from other sessions. [`engine::SyncEngine`] wires it all together.

pub mod config;
pub mod coordinator;
pub mod engine;
pub mod error;
pub mod events;
pub mod locks;
pub mod queue;
pub mod reconciler;
pub mod remote;
pub mod store;
pub mod types;

pub use config::{load_config, SyncConfig};
pub use coordinator::{DrainReport, EntryStatus, Trigger};
pub use engine::SyncEngine;
pub use error::SyncError;
pub use events::{StoreEvent, SyncNotice};
pub use queue::{FileJournal, MemoryJournal, QueueJournal};
pub use remote::{InMemoryRemote, RemoteClient, RemoteError, RemoteErrorKind, Scope};
pub use types::{Entity, EntityId, EntityKind, Mutation};
