//! Postgres implementations of the core store traits.

mod chats;
mod checkpoints;
mod moderation;
mod recovery;

use std::sync::Arc;

use chatguard_core::error::ChatGuardError;
use chatguard_core::store::Stores;
use sqlx::PgPool;

pub use chats::PgChatStore;
pub use checkpoints::PgCheckpointStore;
pub use moderation::PgModerationStore;
pub use recovery::PgRecoveryStore;

pub(crate) fn db_err(err: sqlx::Error) -> ChatGuardError {
    ChatGuardError::storage(err)
}

/// A stored value the domain types cannot represent.
pub(crate) fn corrupt_row(message: String) -> ChatGuardError {
    ChatGuardError::storage(std::io::Error::new(
        std::io::ErrorKind::InvalidData,
        message,
    ))
}

pub fn postgres(pool: PgPool) -> Stores {
    Stores {
        chats: Arc::new(PgChatStore::new(pool.clone())),
        checkpoints: Arc::new(PgCheckpointStore::new(pool.clone())),
        recovery: Arc::new(PgRecoveryStore::new(pool.clone())),
        moderation: Arc::new(PgModerationStore::new(pool)),
    }
}
