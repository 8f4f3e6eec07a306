use crate::queue::QueueError;
use crate::remote::RemoteError;
use crate::store::StoreError;
use crate::types::EntityId;

#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("Remote error: {0}")]
    Remote(#[from] RemoteError),

    #[error("Board {0} is not confirmed yet and can not be subscribed to")]
    TemporaryScope(EntityId),

    #[error("Sync is offline")]
    Offline,
}
