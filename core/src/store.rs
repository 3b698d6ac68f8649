//! Persistence seams. The API crate implements these over Postgres;
//! [`crate::memory`] backs tests and single-process use.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use uuid::Uuid;

use crate::chat::{Chat, ConversationState, Message};
use crate::checkpoint::Checkpoint;
use crate::error::ChatGuardError;
use crate::moderation::ModerationLogEntry;
use crate::recovery::{RecoveryContext, RecoveryOutcome};
use crate::stats::{ChatIntegrityStats, OffenderRow, RecoveryTally, ViolationSummaryRow};

/// State written together with a message commit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StateUpdate {
    pub state: ConversationState,
    /// Set when the committed sequence is known to be stable
    pub stable_at: Option<DateTime<Utc>>,
}

impl StateUpdate {
    pub fn stable(at: DateTime<Utc>) -> Self {
        Self {
            state: ConversationState::Stable,
            stable_at: Some(at),
        }
    }

    pub fn needs_cleanup() -> Self {
        Self {
            state: ConversationState::NeedsCleanup,
            stable_at: None,
        }
    }
}

#[async_trait]
pub trait ChatStore: Send + Sync {
    async fn get(&self, chat_id: Uuid) -> Result<Option<Chat>, ChatGuardError>;

    /// Insert a chat together with its messages.
    async fn create(&self, chat: &Chat) -> Result<(), ChatGuardError>;

    /// Replace the whole message sequence if the chat is still at
    /// `expected_version`. Returns the new version.
    async fn replace_messages(
        &self,
        chat_id: Uuid,
        expected_version: i64,
        messages: &[Message],
        update: StateUpdate,
    ) -> Result<i64, ChatGuardError>;

    /// Append all of `messages` or none of them, under the same version check.
    async fn append_messages(
        &self,
        chat_id: Uuid,
        expected_version: i64,
        messages: &[Message],
        update: StateUpdate,
    ) -> Result<i64, ChatGuardError>;

    /// Update state without touching messages. No-op on archived chats;
    /// returns whether a row changed.
    async fn set_state(&self, chat_id: Uuid, update: StateUpdate) -> Result<bool, ChatGuardError>;

    /// Move a chat to `error`, recording the reason and the replacement chat.
    async fn mark_forked(
        &self,
        chat_id: Uuid,
        forked_into: Option<Uuid>,
        reason: &str,
    ) -> Result<bool, ChatGuardError>;

    /// Archive unless already archived. Returns whether this call archived it.
    async fn archive(&self, chat_id: Uuid, reason: &str) -> Result<bool, ChatGuardError>;

    /// Ids of open chats after `after`, ordered by id.
    async fn list_open(&self, after: Option<Uuid>, limit: u32) -> Result<Vec<Uuid>, ChatGuardError>;

    async fn integrity_stats(&self) -> Result<ChatIntegrityStats, ChatGuardError>;
}

#[async_trait]
pub trait CheckpointStore: Send + Sync {
    async fn save(&self, checkpoint: &Checkpoint) -> Result<(), ChatGuardError>;

    async fn latest(&self, chat_id: Uuid) -> Result<Option<Checkpoint>, ChatGuardError>;

    /// Delete checkpoints created before `cutoff`. Returns the number removed.
    async fn purge_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64, ChatGuardError>;
}

#[async_trait]
pub trait RecoveryContextStore: Send + Sync {
    /// Open a context for `chat_id`, closing an expired one first.
    /// Fails with `AlreadyRecovering` while another is live.
    async fn open(
        &self,
        chat_id: Uuid,
        now: DateTime<Utc>,
        ttl: Duration,
    ) -> Result<RecoveryContext, ChatGuardError>;

    /// Bump `attempt_count`, returning the new value.
    async fn record_attempt(&self, context_id: Uuid) -> Result<i32, ChatGuardError>;

    async fn close(
        &self,
        context_id: Uuid,
        outcome: RecoveryOutcome,
        now: DateTime<Utc>,
    ) -> Result<(), ChatGuardError>;

    /// Close every context past its TTL as `expired`. Returns how many.
    async fn expire_stale(&self, now: DateTime<Utc>) -> Result<u64, ChatGuardError>;

    async fn tally_since(&self, since: DateTime<Utc>) -> Result<RecoveryTally, ChatGuardError>;
}

#[async_trait]
pub trait ModerationStore: Send + Sync {
    async fn append(&self, entry: &ModerationLogEntry) -> Result<(), ChatGuardError>;

    async fn count_blocked(
        &self,
        chat_id: Uuid,
        organization_id: Uuid,
        since: DateTime<Utc>,
    ) -> Result<i64, ChatGuardError>;

    async fn violation_summary(
        &self,
        organization_id: Uuid,
        since: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> Result<Vec<ViolationSummaryRow>, ChatGuardError>;

    /// Users with at least `min_blocked` blocked entries since `since`.
    async fn repeat_offenders(
        &self,
        organization_id: Option<Uuid>,
        since: DateTime<Utc>,
        min_blocked: i64,
    ) -> Result<Vec<OffenderRow>, ChatGuardError>;
}

/// Handles to every store, shared by the healer, ledger, sweep and turn processor.
#[derive(Clone)]
pub struct Stores {
    pub chats: Arc<dyn ChatStore>,
    pub checkpoints: Arc<dyn CheckpointStore>,
    pub recovery: Arc<dyn RecoveryContextStore>,
    pub moderation: Arc<dyn ModerationStore>,
}
