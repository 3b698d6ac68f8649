//! In-process store implementations, used by tests and single-node setups.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::chat::{Chat, ConversationState, Message};
use crate::checkpoint::Checkpoint;
use crate::error::ChatGuardError;
use crate::moderation::{ModerationAction, ModerationLogEntry};
use crate::recovery::{RecoveryContext, RecoveryOutcome};
use crate::stats::{ChatIntegrityStats, OffenderRow, RecoveryTally, ViolationSummaryRow};
use crate::store::{
    ChatStore, CheckpointStore, ModerationStore, RecoveryContextStore, StateUpdate, Stores,
};
use crate::validator::orphaned_tool_messages;

#[derive(Default)]
pub struct InMemoryChatStore {
    chats: RwLock<BTreeMap<Uuid, Chat>>,
}

impl InMemoryChatStore {
    fn apply(chat: &mut Chat, update: StateUpdate) -> Result<(), ChatGuardError> {
        chat.transition(update.state)?;
        if let Some(at) = update.stable_at {
            chat.last_stable_at = Some(at);
        }
        Ok(())
    }

    fn check_version(
        chat: &Chat,
        expected_version: i64,
        next: ConversationState,
    ) -> Result<(), ChatGuardError> {
        if chat.version != expected_version {
            return Err(ChatGuardError::ConcurrentModification {
                chat_id: chat.id,
                expected_version,
            });
        }
        if !chat.is_open() || !chat.conversation_state.can_transition_to(next) {
            return Err(ChatGuardError::ChatClosed {
                chat_id: chat.id,
                state: chat.conversation_state,
                forked_into: chat.forked_into,
            });
        }
        Ok(())
    }
}

#[async_trait]
impl ChatStore for InMemoryChatStore {
    async fn get(&self, chat_id: Uuid) -> Result<Option<Chat>, ChatGuardError> {
        Ok(self.chats.read().await.get(&chat_id).cloned())
    }

    async fn create(&self, chat: &Chat) -> Result<(), ChatGuardError> {
        self.chats.write().await.insert(chat.id, chat.clone());
        Ok(())
    }

    async fn replace_messages(
        &self,
        chat_id: Uuid,
        expected_version: i64,
        messages: &[Message],
        update: StateUpdate,
    ) -> Result<i64, ChatGuardError> {
        let mut chats = self.chats.write().await;
        let chat = chats
            .get_mut(&chat_id)
            .ok_or(ChatGuardError::ChatNotFound(chat_id))?;
        Self::check_version(chat, expected_version, update.state)?;
        chat.messages = messages.to_vec();
        chat.version += 1;
        Self::apply(chat, update)?;
        Ok(chat.version)
    }

    async fn append_messages(
        &self,
        chat_id: Uuid,
        expected_version: i64,
        messages: &[Message],
        update: StateUpdate,
    ) -> Result<i64, ChatGuardError> {
        let mut chats = self.chats.write().await;
        let chat = chats
            .get_mut(&chat_id)
            .ok_or(ChatGuardError::ChatNotFound(chat_id))?;
        Self::check_version(chat, expected_version, update.state)?;
        chat.messages.extend_from_slice(messages);
        chat.version += 1;
        Self::apply(chat, update)?;
        Ok(chat.version)
    }

    async fn set_state(&self, chat_id: Uuid, update: StateUpdate) -> Result<bool, ChatGuardError> {
        let mut chats = self.chats.write().await;
        let chat = chats
            .get_mut(&chat_id)
            .ok_or(ChatGuardError::ChatNotFound(chat_id))?;
        if !chat.is_open() || !chat.conversation_state.can_transition_to(update.state) {
            return Ok(false);
        }
        Self::apply(chat, update)?;
        Ok(true)
    }

    async fn mark_forked(
        &self,
        chat_id: Uuid,
        forked_into: Option<Uuid>,
        reason: &str,
    ) -> Result<bool, ChatGuardError> {
        let mut chats = self.chats.write().await;
        let chat = chats
            .get_mut(&chat_id)
            .ok_or(ChatGuardError::ChatNotFound(chat_id))?;
        if chat.conversation_state == ConversationState::Error
            || !chat.conversation_state.can_transition_to(ConversationState::Error)
        {
            return Ok(false);
        }
        chat.transition(ConversationState::Error)?;
        chat.state_reason = Some(reason.to_string());
        chat.forked_into = forked_into;
        Ok(true)
    }

    async fn archive(&self, chat_id: Uuid, reason: &str) -> Result<bool, ChatGuardError> {
        let mut chats = self.chats.write().await;
        let chat = chats
            .get_mut(&chat_id)
            .ok_or(ChatGuardError::ChatNotFound(chat_id))?;
        if !chat.conversation_state.can_transition_to(ConversationState::Archived) {
            return Ok(false);
        }
        chat.transition(ConversationState::Archived)?;
        chat.state_reason = Some(reason.to_string());
        Ok(true)
    }

    async fn list_open(&self, after: Option<Uuid>, limit: u32) -> Result<Vec<Uuid>, ChatGuardError> {
        let chats = self.chats.read().await;
        Ok(chats
            .values()
            .filter(|c| c.is_open())
            .filter(|c| after.is_none_or(|after| c.id > after))
            .take(limit as usize)
            .map(|c| c.id)
            .collect())
    }

    async fn integrity_stats(&self) -> Result<ChatIntegrityStats, ChatGuardError> {
        let chats = self.chats.read().await;
        let mut stats = ChatIntegrityStats::default();
        for chat in chats.values() {
            stats.total += 1;
            match chat.conversation_state {
                ConversationState::Stable => stats.stable += 1,
                ConversationState::NeedsCleanup => stats.needs_cleanup += 1,
                ConversationState::Error => stats.error += 1,
                ConversationState::Archived => stats.archived += 1,
            }
            if chat.is_open() {
                stats.orphaned_tool_messages += orphaned_tool_messages(&chat.messages) as i64;
            }
        }
        stats.active = stats.stable + stats.needs_cleanup;
        Ok(stats)
    }
}

#[derive(Default)]
pub struct InMemoryCheckpointStore {
    checkpoints: RwLock<Vec<Checkpoint>>,
}

#[async_trait]
impl CheckpointStore for InMemoryCheckpointStore {
    async fn save(&self, checkpoint: &Checkpoint) -> Result<(), ChatGuardError> {
        self.checkpoints.write().await.push(checkpoint.clone());
        Ok(())
    }

    async fn latest(&self, chat_id: Uuid) -> Result<Option<Checkpoint>, ChatGuardError> {
        Ok(self
            .checkpoints
            .read()
            .await
            .iter()
            .filter(|c| c.chat_id == chat_id)
            .max_by_key(|c| (c.created_at, c.id))
            .cloned())
    }

    async fn purge_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64, ChatGuardError> {
        let mut checkpoints = self.checkpoints.write().await;
        let before = checkpoints.len();
        checkpoints.retain(|c| c.created_at >= cutoff);
        Ok((before - checkpoints.len()) as u64)
    }
}

#[derive(Default)]
pub struct InMemoryRecoveryStore {
    contexts: RwLock<HashMap<Uuid, RecoveryContext>>,
}

impl InMemoryRecoveryStore {
    pub async fn contexts_for(&self, chat_id: Uuid) -> Vec<RecoveryContext> {
        let mut found: Vec<_> = self
            .contexts
            .read()
            .await
            .values()
            .filter(|c| c.chat_id == chat_id)
            .cloned()
            .collect();
        found.sort_by_key(|c| c.opened_at);
        found
    }
}

#[async_trait]
impl RecoveryContextStore for InMemoryRecoveryStore {
    async fn open(
        &self,
        chat_id: Uuid,
        now: DateTime<Utc>,
        ttl: Duration,
    ) -> Result<RecoveryContext, ChatGuardError> {
        let mut contexts = self.contexts.write().await;
        for ctx in contexts.values_mut().filter(|c| c.chat_id == chat_id) {
            if ctx.is_active(now) {
                return Err(ChatGuardError::AlreadyRecovering { chat_id });
            }
            if ctx.is_expired(now) {
                ctx.outcome = Some(RecoveryOutcome::Expired);
                ctx.closed_at = Some(now);
            }
        }
        let ctx = RecoveryContext::open(chat_id, now, ttl);
        contexts.insert(ctx.id, ctx.clone());
        Ok(ctx)
    }

    async fn record_attempt(&self, context_id: Uuid) -> Result<i32, ChatGuardError> {
        let mut contexts = self.contexts.write().await;
        let ctx = contexts.get_mut(&context_id).ok_or_else(|| {
            ChatGuardError::storage(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("recovery context {context_id} not found"),
            ))
        })?;
        ctx.attempt_count += 1;
        Ok(ctx.attempt_count)
    }

    async fn close(
        &self,
        context_id: Uuid,
        outcome: RecoveryOutcome,
        now: DateTime<Utc>,
    ) -> Result<(), ChatGuardError> {
        if let Some(ctx) = self.contexts.write().await.get_mut(&context_id)
            && ctx.outcome.is_none()
        {
            ctx.outcome = Some(outcome);
            ctx.closed_at = Some(now);
        }
        Ok(())
    }

    async fn expire_stale(&self, now: DateTime<Utc>) -> Result<u64, ChatGuardError> {
        let mut expired = 0;
        for ctx in self.contexts.write().await.values_mut() {
            if ctx.is_expired(now) {
                ctx.outcome = Some(RecoveryOutcome::Expired);
                ctx.closed_at = Some(now);
                expired += 1;
            }
        }
        Ok(expired)
    }

    async fn tally_since(&self, since: DateTime<Utc>) -> Result<RecoveryTally, ChatGuardError> {
        let mut tally = RecoveryTally::default();
        for ctx in self.contexts.read().await.values() {
            if ctx.opened_at < since {
                continue;
            }
            match ctx.outcome {
                Some(RecoveryOutcome::Healed) => tally.healed += 1,
                Some(RecoveryOutcome::Forked) => tally.forked += 1,
                Some(RecoveryOutcome::Failed) => tally.failed += 1,
                Some(RecoveryOutcome::Expired) => tally.expired += 1,
                None => tally.active += 1,
            }
        }
        Ok(tally)
    }
}

#[derive(Default)]
pub struct InMemoryModerationStore {
    entries: RwLock<Vec<ModerationLogEntry>>,
}

impl InMemoryModerationStore {
    pub async fn entries(&self) -> Vec<ModerationLogEntry> {
        self.entries.read().await.clone()
    }
}

#[async_trait]
impl ModerationStore for InMemoryModerationStore {
    async fn append(&self, entry: &ModerationLogEntry) -> Result<(), ChatGuardError> {
        self.entries.write().await.push(entry.clone());
        Ok(())
    }

    async fn count_blocked(
        &self,
        chat_id: Uuid,
        organization_id: Uuid,
        since: DateTime<Utc>,
    ) -> Result<i64, ChatGuardError> {
        Ok(self
            .entries
            .read()
            .await
            .iter()
            .filter(|e| {
                e.chat_id == chat_id
                    && e.organization_id == organization_id
                    && e.action_taken == ModerationAction::Blocked
                    && e.detected_at >= since
            })
            .count() as i64)
    }

    async fn violation_summary(
        &self,
        organization_id: Uuid,
        since: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> Result<Vec<ViolationSummaryRow>, ChatGuardError> {
        let entries = self.entries.read().await;
        let mut groups: BTreeMap<(String, &'static str), (ModerationAction, i64, HashSet<Uuid>)> =
            BTreeMap::new();
        for e in entries.iter().filter(|e| {
            e.organization_id == organization_id && e.created_at >= since && e.created_at < until
        }) {
            let group = groups
                .entry((e.violation_type.clone(), e.action_taken.as_str()))
                .or_insert_with(|| (e.action_taken, 0, HashSet::new()));
            group.1 += 1;
            group.2.insert(e.user_id);
        }
        let mut rows: Vec<ViolationSummaryRow> = groups
            .into_iter()
            .map(|((violation_type, _), (action_taken, count, users))| ViolationSummaryRow {
                violation_type,
                action_taken,
                count,
                distinct_users: users.len() as i64,
            })
            .collect();
        rows.sort_by(|a, b| b.count.cmp(&a.count).then(a.violation_type.cmp(&b.violation_type)));
        Ok(rows)
    }

    async fn repeat_offenders(
        &self,
        organization_id: Option<Uuid>,
        since: DateTime<Utc>,
        min_blocked: i64,
    ) -> Result<Vec<OffenderRow>, ChatGuardError> {
        let entries = self.entries.read().await;
        let mut per_user: HashMap<Uuid, OffenderRow> = HashMap::new();
        for e in entries.iter().filter(|e| {
            e.created_at >= since && organization_id.is_none_or(|org| e.organization_id == org)
        }) {
            let row = per_user.entry(e.user_id).or_insert(OffenderRow {
                user_id: e.user_id,
                blocked_count: 0,
                total_count: 0,
                last_detected_at: e.detected_at,
            });
            row.total_count += 1;
            if e.action_taken == ModerationAction::Blocked {
                row.blocked_count += 1;
            }
            row.last_detected_at = row.last_detected_at.max(e.detected_at);
        }
        let mut rows: Vec<OffenderRow> = per_user
            .into_values()
            .filter(|row| row.blocked_count >= min_blocked)
            .collect();
        rows.sort_by(|a, b| {
            b.blocked_count
                .cmp(&a.blocked_count)
                .then(b.last_detected_at.cmp(&a.last_detected_at))
        });
        Ok(rows)
    }
}

impl Stores {
    pub fn in_memory() -> Self {
        Self {
            chats: Arc::new(InMemoryChatStore::default()),
            checkpoints: Arc::new(InMemoryCheckpointStore::default()),
            recovery: Arc::new(InMemoryRecoveryStore::default()),
            moderation: Arc::new(InMemoryModerationStore::default()),
        }
    }
}
