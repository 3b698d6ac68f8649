//! Append-only moderation log and the auto-archive policy it drives.
//!
//! Classification happens upstream; this module only consumes outcomes.
//! Archiving here never forks a chat.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;

use crate::error::ChatGuardError;
use crate::stats::{OffenderRow, ViolationSummaryRow};
use crate::store::{ChatStore, ModerationStore};

pub const AUTO_ARCHIVE_REASON: &str = "moderation_auto_archive";
pub const AUTO_ARCHIVE_VIOLATION: &str = "repeated_violations";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum ModerationAction {
    Logged,
    Warned,
    Blocked,
    Archived,
}

impl ModerationAction {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Logged => "logged",
            Self::Warned => "warned",
            Self::Blocked => "blocked",
            Self::Archived => "archived",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "logged" => Some(Self::Logged),
            "warned" => Some(Self::Warned),
            "blocked" => Some(Self::Blocked),
            "archived" => Some(Self::Archived),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, ToSchema)]
pub struct ModerationLogEntry {
    pub id: Uuid,
    pub chat_id: Uuid,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message_id: Option<Uuid>,
    pub user_id: Uuid,
    pub organization_id: Uuid,
    pub violation_type: String,
    pub action_taken: ModerationAction,
    pub detected_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

/// Outcome of an upstream classification, as handed to the ledger.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, ToSchema)]
pub struct ModerationEvent {
    pub chat_id: Uuid,
    #[serde(default)]
    pub message_id: Option<Uuid>,
    pub user_id: Uuid,
    pub organization_id: Uuid,
    pub violation_type: String,
    pub action_taken: ModerationAction,
    /// Defaults to now
    #[serde(default)]
    pub detected_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, ToSchema)]
pub struct AutoArchiveDecision {
    pub blocked_in_window: i64,
    pub threshold: i64,
    /// True only for the call that archived the chat
    pub archived: bool,
}

pub struct ModerationLedger {
    chats: Arc<dyn ChatStore>,
    log: Arc<dyn ModerationStore>,
    threshold: i64,
    window: Duration,
}

impl ModerationLedger {
    pub fn new(
        chats: Arc<dyn ChatStore>,
        log: Arc<dyn ModerationStore>,
        threshold: u32,
        window: Duration,
    ) -> Self {
        Self {
            chats,
            log,
            threshold: i64::from(threshold),
            window,
        }
    }

    pub async fn record(&self, event: ModerationEvent) -> Result<ModerationLogEntry, ChatGuardError> {
        let now = Utc::now();
        let entry = ModerationLogEntry {
            id: Uuid::now_v7(),
            chat_id: event.chat_id,
            message_id: event.message_id,
            user_id: event.user_id,
            organization_id: event.organization_id,
            violation_type: event.violation_type,
            action_taken: event.action_taken,
            detected_at: event.detected_at.unwrap_or(now),
            created_at: now,
        };
        self.log.append(&entry).await?;
        tracing::info!(
            chat_id = %entry.chat_id,
            organization_id = %entry.organization_id,
            violation_type = %entry.violation_type,
            action = entry.action_taken.as_str(),
            "moderation event recorded"
        );
        Ok(entry)
    }

    /// Archive the chat once blocked entries in the trailing window reach the
    /// threshold. Only the call that actually archives writes the closing entry.
    pub async fn check_auto_archive(
        &self,
        chat_id: Uuid,
        organization_id: Uuid,
    ) -> Result<AutoArchiveDecision, ChatGuardError> {
        let now = Utc::now();
        let blocked = self
            .log
            .count_blocked(chat_id, organization_id, now - self.window)
            .await?;
        let mut decision = AutoArchiveDecision {
            blocked_in_window: blocked,
            threshold: self.threshold,
            archived: false,
        };
        if blocked < self.threshold {
            return Ok(decision);
        }

        let chat = self
            .chats
            .get(chat_id)
            .await?
            .ok_or(ChatGuardError::ChatNotFound(chat_id))?;
        if !self.chats.archive(chat_id, AUTO_ARCHIVE_REASON).await? {
            return Ok(decision);
        }

        self.log
            .append(&ModerationLogEntry {
                id: Uuid::now_v7(),
                chat_id,
                message_id: None,
                user_id: chat.owner_id,
                organization_id,
                violation_type: AUTO_ARCHIVE_VIOLATION.to_string(),
                action_taken: ModerationAction::Archived,
                detected_at: now,
                created_at: now,
            })
            .await?;
        tracing::warn!(
            chat_id = %chat_id,
            organization_id = %organization_id,
            blocked,
            threshold = self.threshold,
            "chat auto-archived after repeated moderation blocks"
        );
        decision.archived = true;
        Ok(decision)
    }

    /// Record an event and, when it is a block, apply the archive policy.
    pub async fn record_and_enforce(
        &self,
        event: ModerationEvent,
    ) -> Result<(ModerationLogEntry, Option<AutoArchiveDecision>), ChatGuardError> {
        let entry = self.record(event).await?;
        let decision = if entry.action_taken == ModerationAction::Blocked {
            Some(
                self.check_auto_archive(entry.chat_id, entry.organization_id)
                    .await?,
            )
        } else {
            None
        };
        Ok((entry, decision))
    }

    pub async fn violation_summary(
        &self,
        organization_id: Uuid,
        since: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> Result<Vec<ViolationSummaryRow>, ChatGuardError> {
        self.log
            .violation_summary(organization_id, since, until)
            .await
    }

    pub async fn repeat_offenders(
        &self,
        organization_id: Option<Uuid>,
        since: DateTime<Utc>,
        min_blocked: i64,
    ) -> Result<Vec<OffenderRow>, ChatGuardError> {
        self.log
            .repeat_offenders(organization_id, since, min_blocked)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chat::{Chat, ConversationState};
    use crate::memory::{InMemoryChatStore, InMemoryModerationStore};

    async fn setup(threshold: u32) -> (ModerationLedger, Arc<InMemoryChatStore>, Arc<InMemoryModerationStore>, Chat) {
        let chats = Arc::new(InMemoryChatStore::default());
        let log = Arc::new(InMemoryModerationStore::default());
        let chat = Chat::new(Uuid::now_v7(), Uuid::now_v7());
        chats.create(&chat).await.expect("create chat");
        let ledger = ModerationLedger::new(chats.clone(), log.clone(), threshold, Duration::days(7));
        (ledger, chats, log, chat)
    }

    fn blocked(chat: &Chat) -> ModerationEvent {
        ModerationEvent {
            chat_id: chat.id,
            message_id: None,
            user_id: chat.owner_id,
            organization_id: chat.organization_id,
            violation_type: "harassment".to_string(),
            action_taken: ModerationAction::Blocked,
            detected_at: None,
        }
    }

    #[tokio::test]
    async fn archives_exactly_once_at_threshold() {
        let (ledger, chats, log, chat) = setup(5).await;
        for i in 0..4 {
            let (_, decision) = ledger.record_and_enforce(blocked(&chat)).await.expect("record");
            assert_eq!(decision.map(|d| d.archived), Some(false), "block {i}");
        }
        let (_, decision) = ledger.record_and_enforce(blocked(&chat)).await.expect("record");
        assert!(decision.expect("blocked event").archived);

        let stored = chats.get(chat.id).await.expect("get").expect("exists");
        assert_eq!(stored.conversation_state, ConversationState::Archived);
        assert_eq!(stored.state_reason.as_deref(), Some(AUTO_ARCHIVE_REASON));

        let again = ledger
            .check_auto_archive(chat.id, chat.organization_id)
            .await
            .expect("re-run");
        assert!(!again.archived);

        let closing = log
            .entries()
            .await
            .into_iter()
            .filter(|e| e.action_taken == ModerationAction::Archived)
            .count();
        assert_eq!(closing, 1);
    }

    #[tokio::test]
    async fn forked_chat_is_still_auto_archived() {
        let (ledger, chats, log, chat) = setup(1).await;
        chats
            .set_state(chat.id, crate::store::StateUpdate::needs_cleanup())
            .await
            .expect("needs cleanup");
        chats
            .mark_forked(chat.id, Some(Uuid::now_v7()), "test")
            .await
            .expect("fork");

        let (_, decision) = ledger.record_and_enforce(blocked(&chat)).await.expect("record");
        assert!(decision.expect("blocked event").archived);
        let stored = chats.get(chat.id).await.expect("get").expect("exists");
        assert_eq!(stored.conversation_state, ConversationState::Archived);
        assert_eq!(
            log.entries()
                .await
                .iter()
                .filter(|e| e.action_taken == ModerationAction::Archived)
                .count(),
            1
        );
    }

    #[tokio::test]
    async fn old_blocks_fall_outside_the_window() {
        let (ledger, chats, _log, chat) = setup(2).await;
        let mut stale = blocked(&chat);
        stale.detected_at = Some(Utc::now() - Duration::days(8));
        ledger.record_and_enforce(stale).await.expect("record");
        let (_, decision) = ledger.record_and_enforce(blocked(&chat)).await.expect("record");
        let decision = decision.expect("blocked event");
        assert_eq!(decision.blocked_in_window, 1);
        assert!(!decision.archived);
        let stored = chats.get(chat.id).await.expect("get").expect("exists");
        assert_eq!(stored.conversation_state, ConversationState::Stable);
    }

    #[tokio::test]
    async fn warnings_never_archive() {
        let (ledger, _chats, _log, chat) = setup(1).await;
        let mut warned = blocked(&chat);
        warned.action_taken = ModerationAction::Warned;
        let (entry, decision) = ledger.record_and_enforce(warned).await.expect("record");
        assert_eq!(entry.action_taken, ModerationAction::Warned);
        assert!(decision.is_none());
    }

    #[tokio::test]
    async fn summary_and_offenders_aggregate_per_org() {
        let (ledger, _chats, _log, chat) = setup(100).await;
        for _ in 0..3 {
            ledger.record(blocked(&chat)).await.expect("record");
        }
        let mut other_type = blocked(&chat);
        other_type.violation_type = "spam".to_string();
        other_type.action_taken = ModerationAction::Logged;
        ledger.record(other_type).await.expect("record");

        let now = Utc::now();
        let summary = ledger
            .violation_summary(chat.organization_id, now - Duration::days(1), now + Duration::seconds(1))
            .await
            .expect("summary");
        let harassment = summary
            .iter()
            .find(|row| row.violation_type == "harassment")
            .expect("harassment row");
        assert_eq!(harassment.count, 3);
        assert_eq!(harassment.distinct_users, 1);
        assert_eq!(summary.len(), 2);

        let offenders = ledger
            .repeat_offenders(Some(chat.organization_id), now - Duration::days(1), 3)
            .await
            .expect("offenders");
        assert_eq!(offenders.len(), 1);
        assert_eq!(offenders[0].user_id, chat.owner_id);
        assert_eq!(offenders[0].blocked_count, 3);
        assert_eq!(offenders[0].total_count, 4);

        let none = ledger
            .repeat_offenders(Some(Uuid::now_v7()), now - Duration::days(1), 1)
            .await
            .expect("offenders");
        assert!(none.is_empty());
    }
}
