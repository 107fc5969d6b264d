/// Synchronization engine for multi-user page editing: live presence,
/// a typed realtime event channel, optimistic saves with rollback, and
/// tree position management with concurrent-move arbitration.
use thiserror::Error;

mod conflict;
pub use conflict::*;

mod events;
pub use events::*;

mod presence;
pub use presence::*;

mod positions;
pub use positions::*;

mod remote;
pub use remote::*;

mod session;
pub use session::*;

#[derive(Debug, Error)]
pub enum CollaborationError {
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("validation failed: {0}")]
    Validation(String),

    #[error("invalid move: {0}")]
    InvalidMove(String),

    #[error("conflict not found: {0}")]
    ConflictNotFound(ConflictId),

    #[error("network error: {0}")]
    Network(String),

    #[error("remote error: status {status}: {message}")]
    Remote { status: u16, message: String },

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error(transparent)]
    Page(#[from] page::PageError),
}

pub type Result<T> = std::result::Result<T, CollaborationError>;
