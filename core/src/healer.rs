//! Drives a chat back to a stable state: validate, repair in place under a
//! recovery lock, or fork into a fresh chat when in-place repair cannot work.

use chrono::Utc;
use serde::Serialize;
use utoipa::ToSchema;
use uuid::Uuid;

use crate::chat::{Chat, ConversationState, INTEGRITY_FAILURE_REASON, PARTIAL_FORK_REASON};
use crate::checkpoint::Checkpoint;
use crate::config::GuardConfig;
use crate::error::ChatGuardError;
use crate::recovery::{RecoveryContext, RecoveryOutcome};
use crate::repair::{RepairAction, RepairChain};
use crate::store::{StateUpdate, Stores};
use crate::validator::{Verdict, stable_prefix_len, validate, validate_messages};

/// Result of [`ConversationHealer::ensure_conversation_integrity`] when the
/// chat can be used as-is, or after repair, or not at all.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IntegrityOutcome {
    Stable,
    Healed { actions: Vec<RepairAction> },
    Archived,
    /// Chat is in `error`; continue in `recovery_chat_id` when there is one.
    Moved { recovery_chat_id: Option<Uuid> },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum HealStatus {
    Stable,
    Healed,
    Forked,
    Archived,
    Moved,
    /// Another repair holds the lock for this chat.
    Skipped,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, ToSchema)]
pub struct HealReport {
    pub status: HealStatus,
    pub actions_taken: Vec<RepairAction>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub recovery_chat: Option<Uuid>,
}

impl HealReport {
    fn status(status: HealStatus) -> Self {
        Self {
            status,
            actions_taken: Vec::new(),
            recovery_chat: None,
        }
    }
}

enum Repaired {
    Stable,
    Healed(Vec<RepairAction>),
    Forked(Uuid),
    Closed(IntegrityOutcome),
}

pub struct ConversationHealer {
    stores: Stores,
    chain: RepairChain,
    config: GuardConfig,
}

impl ConversationHealer {
    pub fn new(stores: Stores, config: GuardConfig) -> Self {
        Self::with_chain(stores, config, RepairChain::default())
    }

    pub fn with_chain(stores: Stores, config: GuardConfig, chain: RepairChain) -> Self {
        Self {
            stores,
            chain,
            config,
        }
    }

    pub fn stores(&self) -> &Stores {
        &self.stores
    }

    async fn load(&self, chat_id: Uuid) -> Result<Chat, ChatGuardError> {
        self.stores
            .chats
            .get(chat_id)
            .await?
            .ok_or(ChatGuardError::ChatNotFound(chat_id))
    }

    fn closed_outcome(chat: &Chat) -> Option<IntegrityOutcome> {
        match chat.conversation_state {
            ConversationState::Archived => Some(IntegrityOutcome::Archived),
            ConversationState::Error => Some(IntegrityOutcome::Moved {
                recovery_chat_id: chat.forked_into,
            }),
            _ => None,
        }
    }

    /// Make sure the chat is usable for the next turn.
    ///
    /// A fork surfaces as `UnrecoverableCorruption` carrying the new chat id.
    pub async fn ensure_conversation_integrity(
        &self,
        chat_id: Uuid,
    ) -> Result<IntegrityOutcome, ChatGuardError> {
        let chat = self.load(chat_id).await?;
        if let Some(outcome) = Self::closed_outcome(&chat) {
            return Ok(outcome);
        }
        if validate(&chat).is_stable() {
            self.stores
                .chats
                .set_state(chat_id, StateUpdate::stable(Utc::now()))
                .await?;
            return Ok(IntegrityOutcome::Stable);
        }

        match self.repair_locked(chat_id).await? {
            Repaired::Stable => Ok(IntegrityOutcome::Stable),
            Repaired::Healed(actions) => Ok(IntegrityOutcome::Healed { actions }),
            Repaired::Closed(outcome) => Ok(outcome),
            Repaired::Forked(recovery_chat_id) => Err(ChatGuardError::UnrecoverableCorruption {
                chat_id,
                recovery_chat_id,
            }),
        }
    }

    /// Caller-facing variant that folds every non-fatal outcome into a report.
    /// A concurrent repair is reported as `skipped`.
    pub async fn validate_and_heal_state(&self, chat_id: Uuid) -> Result<HealReport, ChatGuardError> {
        match self.ensure_conversation_integrity(chat_id).await {
            Ok(outcome) => Ok(Self::report(outcome)),
            Err(ChatGuardError::UnrecoverableCorruption {
                recovery_chat_id, ..
            }) => Ok(HealReport {
                status: HealStatus::Forked,
                actions_taken: vec![RepairAction::Forked { recovery_chat_id }],
                recovery_chat: Some(recovery_chat_id),
            }),
            Err(ChatGuardError::AlreadyRecovering { .. }) => {
                tracing::debug!(chat_id = %chat_id, "repair already in progress, skipping");
                Ok(HealReport::status(HealStatus::Skipped))
            }
            Err(err) => Err(err),
        }
    }

    /// Operator path: always takes the recovery lock, even for a chat that
    /// currently validates, and surfaces lock contention as an error.
    pub async fn repair_conversation(&self, chat_id: Uuid) -> Result<HealReport, ChatGuardError> {
        let chat = self.load(chat_id).await?;
        if let Some(outcome) = Self::closed_outcome(&chat) {
            return Ok(Self::report(outcome));
        }
        Ok(match self.repair_locked(chat_id).await? {
            Repaired::Stable => HealReport::status(HealStatus::Stable),
            Repaired::Healed(actions) => HealReport {
                status: HealStatus::Healed,
                actions_taken: actions,
                recovery_chat: None,
            },
            Repaired::Forked(recovery_chat_id) => HealReport {
                status: HealStatus::Forked,
                actions_taken: vec![RepairAction::Forked { recovery_chat_id }],
                recovery_chat: Some(recovery_chat_id),
            },
            Repaired::Closed(outcome) => Self::report(outcome),
        })
    }

    fn report(outcome: IntegrityOutcome) -> HealReport {
        match outcome {
            IntegrityOutcome::Stable => HealReport::status(HealStatus::Stable),
            IntegrityOutcome::Healed { actions } => HealReport {
                status: HealStatus::Healed,
                actions_taken: actions,
                recovery_chat: None,
            },
            IntegrityOutcome::Archived => HealReport::status(HealStatus::Archived),
            IntegrityOutcome::Moved { recovery_chat_id } => HealReport {
                status: HealStatus::Moved,
                actions_taken: Vec::new(),
                recovery_chat: recovery_chat_id,
            },
        }
    }

    async fn repair_locked(&self, chat_id: Uuid) -> Result<Repaired, ChatGuardError> {
        let ctx = self
            .stores
            .recovery
            .open(chat_id, Utc::now(), self.config.recovery_context_ttl())
            .await?;

        let result = self.repair_with_retries(&ctx).await;
        let outcome = match &result {
            Ok(Repaired::Forked(_)) => RecoveryOutcome::Forked,
            Ok(_) => RecoveryOutcome::Healed,
            Err(_) => RecoveryOutcome::Failed,
        };
        if let Err(err) = self.stores.recovery.close(ctx.id, outcome, Utc::now()).await {
            tracing::error!(chat_id = %chat_id, error = %err, "failed to close recovery context");
        }
        result
    }

    async fn repair_with_retries(&self, ctx: &RecoveryContext) -> Result<Repaired, ChatGuardError> {
        let chat_id = ctx.chat_id;
        loop {
            let attempt = self.stores.recovery.record_attempt(ctx.id).await?;
            if attempt as u32 > self.config.max_recovery_attempts {
                tracing::error!(chat_id = %chat_id, attempts = attempt - 1, "recovery attempts exhausted");
                return Err(ChatGuardError::RecoveryAttemptsExhausted {
                    chat_id,
                    attempts: (attempt - 1) as u32,
                });
            }

            let chat = self.load(chat_id).await?;
            if let Some(outcome) = Self::closed_outcome(&chat) {
                return Ok(Repaired::Closed(outcome));
            }
            let violations = match validate(&chat) {
                Verdict::Stable => {
                    self.stores
                        .chats
                        .set_state(chat_id, StateUpdate::stable(Utc::now()))
                        .await?;
                    return Ok(Repaired::Stable);
                }
                Verdict::Invalid { violations } => violations,
            };

            tracing::info!(
                chat_id = %chat_id,
                violations = violations.len(),
                attempt,
                "repairing conversation"
            );
            if chat.conversation_state == ConversationState::Stable {
                self.stores
                    .chats
                    .set_state(chat_id, StateUpdate::needs_cleanup())
                    .await?;
            }

            let result = self.chain.run(chat_id, &chat.messages, violations);
            if !result.is_stable() {
                return self.fork(&chat).await.map(Repaired::Forked);
            }

            let now = Utc::now();
            match self
                .stores
                .chats
                .replace_messages(chat_id, chat.version, &result.messages, StateUpdate::stable(now))
                .await
            {
                Ok(_) => {
                    tracing::info!(
                        chat_id = %chat_id,
                        actions = result.actions.len(),
                        "conversation repaired in place"
                    );
                    let mut healed = chat;
                    healed.messages = result.messages;
                    self.save_checkpoint(&healed).await;
                    return Ok(Repaired::Healed(result.actions));
                }
                Err(ChatGuardError::ConcurrentModification { .. }) => {
                    tracing::debug!(chat_id = %chat_id, attempt, "chat changed during repair, retrying");
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Start a new chat for the same owner from the last good state and retire
    /// the original.
    async fn fork(&self, original: &Chat) -> Result<Uuid, ChatGuardError> {
        let seed = match self.stores.checkpoints.latest(original.id).await? {
            Some(checkpoint) => match checkpoint.messages() {
                Some(messages) => messages,
                None => {
                    tracing::warn!(chat_id = %original.id, "latest checkpoint is unreadable, using stable prefix");
                    original.messages[..stable_prefix_len(&original.messages)].to_vec()
                }
            },
            None => original.messages[..stable_prefix_len(&original.messages)].to_vec(),
        };

        let mut fork = Chat::new(original.owner_id, original.organization_id);
        fork.title = original.title.clone();
        fork.forked_from = Some(original.id);
        fork.messages = seed.iter().map(|m| m.rehome(fork.id)).collect();

        if let Verdict::Invalid { violations } = validate_messages(&fork.messages) {
            fork.conversation_state = ConversationState::Error;
            fork.last_stable_at = None;
            fork.state_reason = Some(PARTIAL_FORK_REASON.to_string());
            if let Err(err) = self.stores.chats.create(&fork).await {
                tracing::error!(
                    chat_id = %original.id,
                    partial_chat_id = %fork.id,
                    error = %err,
                    "failed to persist partial fork"
                );
            }
            self.stores
                .chats
                .mark_forked(original.id, None, INTEGRITY_FAILURE_REASON)
                .await?;
            tracing::error!(
                chat_id = %original.id,
                partial_chat_id = %fork.id,
                seeded_messages = fork.messages.len(),
                violations = violations.len(),
                "forked conversation failed validation; partial kept for follow-up"
            );
            return Err(ChatGuardError::ConversationRecovery {
                original_chat_id: original.id,
                partial: Box::new(fork),
                violations,
            });
        }

        self.stores.chats.create(&fork).await?;
        if !self
            .stores
            .chats
            .mark_forked(original.id, Some(fork.id), INTEGRITY_FAILURE_REASON)
            .await?
        {
            tracing::warn!(
                chat_id = %original.id,
                recovery_chat_id = %fork.id,
                "original left its repairable state before it could be retired"
            );
        }
        tracing::warn!(
            chat_id = %original.id,
            recovery_chat_id = %fork.id,
            seeded_messages = fork.messages.len(),
            "conversation forked after failed in-place repair"
        );
        self.save_checkpoint(&fork).await;
        Ok(fork.id)
    }

    async fn save_checkpoint(&self, chat: &Chat) {
        let Some(checkpoint) = Checkpoint::capture(chat) else {
            return;
        };
        if let Err(err) = self.stores.checkpoints.save(&checkpoint).await {
            tracing::warn!(chat_id = %chat.id, error = %err, "checkpoint save failed");
        }
    }

    /// Fire-and-forget checkpoint every `checkpoint_every_turns` turns.
    pub fn maybe_checkpoint(&self, chat: &Chat) {
        let every = self.config.checkpoint_every_turns as usize;
        let turns = chat.turn_count();
        if every == 0 || turns == 0 || turns % every != 0 {
            return;
        }
        let Some(checkpoint) = Checkpoint::capture(chat) else {
            return;
        };
        let store = self.stores.checkpoints.clone();
        tokio::spawn(async move {
            if let Err(err) = store.save(&checkpoint).await {
                tracing::warn!(chat_id = %checkpoint.chat_id, error = %err, "periodic checkpoint failed");
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::chat::{Message, SYNTHETIC_TOOL_RESPONSE, ToolCall};
    use crate::memory::{
        InMemoryChatStore, InMemoryCheckpointStore, InMemoryModerationStore, InMemoryRecoveryStore,
    };
    use crate::store::{ChatStore, CheckpointStore, RecoveryContextStore};

    struct Harness {
        healer: ConversationHealer,
        chats: Arc<InMemoryChatStore>,
        recovery: Arc<InMemoryRecoveryStore>,
        checkpoints: Arc<InMemoryCheckpointStore>,
    }

    fn harness() -> Harness {
        let chats = Arc::new(InMemoryChatStore::default());
        let recovery = Arc::new(InMemoryRecoveryStore::default());
        let checkpoints = Arc::new(InMemoryCheckpointStore::default());
        let stores = Stores {
            chats: chats.clone(),
            checkpoints: checkpoints.clone(),
            recovery: recovery.clone(),
            moderation: Arc::new(InMemoryModerationStore::default()),
        };
        Harness {
            healer: ConversationHealer::new(stores, GuardConfig::default()),
            chats,
            recovery,
            checkpoints,
        }
    }

    async fn seed(h: &Harness, build: impl FnOnce(Uuid) -> Vec<Message>) -> Chat {
        let mut chat = Chat::new(Uuid::now_v7(), Uuid::now_v7());
        chat.messages = build(chat.id);
        h.chats.create(&chat).await.expect("create chat");
        chat
    }

    async fn reload(h: &Harness, chat_id: Uuid) -> Chat {
        h.chats.get(chat_id).await.expect("get").expect("chat exists")
    }

    #[tokio::test]
    async fn book_a_flight_never_mind_is_healed() {
        let h = harness();
        let chat = seed(&h, |id| {
            vec![
                Message::user(id, "book a flight"),
                Message::assistant(id, "", vec![ToolCall::new("call_1", "book_flight")]),
                Message::user(id, "never mind"),
            ]
        })
        .await;

        let report = h
            .healer
            .validate_and_heal_state(chat.id)
            .await
            .expect("heal");
        assert_eq!(report.status, HealStatus::Healed);
        assert_eq!(report.actions_taken.len(), 1);
        assert!(report.recovery_chat.is_none());

        let healed = reload(&h, chat.id).await;
        assert_eq!(healed.conversation_state, ConversationState::Stable);
        assert!(healed.last_stable_at >= chat.last_stable_at);
        assert_eq!(healed.messages.len(), 4);
        assert_eq!(healed.messages[2].content, SYNTHETIC_TOOL_RESPONSE);
        assert_eq!(healed.messages[2].tool_call_id.as_deref(), Some("call_1"));
        assert!(validate(&healed).is_stable());

        let checkpoint = h
            .checkpoints
            .latest(chat.id)
            .await
            .expect("latest")
            .expect("checkpoint saved after repair");
        assert_eq!(checkpoint.message_count, 4);

        let contexts = h.recovery.contexts_for(chat.id).await;
        assert_eq!(contexts.len(), 1);
        assert_eq!(contexts[0].outcome, Some(RecoveryOutcome::Healed));
        assert_eq!(contexts[0].attempt_count, 1);
    }

    #[tokio::test]
    async fn stable_chat_only_refreshes_last_stable_at() {
        let h = harness();
        let chat = seed(&h, |id| {
            vec![Message::user(id, "hi"), Message::assistant(id, "hello", vec![])]
        })
        .await;
        let outcome = h
            .healer
            .ensure_conversation_integrity(chat.id)
            .await
            .expect("ensure");
        assert_eq!(outcome, IntegrityOutcome::Stable);
        let stored = reload(&h, chat.id).await;
        assert_eq!(stored.messages, chat.messages);
        assert_eq!(stored.version, chat.version);
        assert!(h.recovery.contexts_for(chat.id).await.is_empty());
    }

    #[tokio::test]
    async fn duplicate_responses_fork_from_the_stable_prefix() {
        let h = harness();
        let chat = seed(&h, |id| {
            vec![
                Message::user(id, "hi"),
                Message::assistant(id, "hello", vec![]),
                Message::user(id, "search"),
                Message::assistant(id, "", vec![ToolCall::new("c1", "search")]),
                Message::tool(id, "c1", "first"),
                Message::tool(id, "c1", "second"),
            ]
        })
        .await;

        let err = h
            .healer
            .ensure_conversation_integrity(chat.id)
            .await
            .expect_err("fork surfaces as unrecoverable corruption");
        let ChatGuardError::UnrecoverableCorruption {
            recovery_chat_id, ..
        } = err
        else {
            panic!("unexpected error: {err}");
        };

        let original = reload(&h, chat.id).await;
        assert_eq!(original.conversation_state, ConversationState::Error);
        assert_eq!(original.state_reason.as_deref(), Some(INTEGRITY_FAILURE_REASON));
        assert_eq!(original.forked_into, Some(recovery_chat_id));

        let fork = reload(&h, recovery_chat_id).await;
        assert_eq!(fork.owner_id, chat.owner_id);
        assert_eq!(fork.forked_from, Some(chat.id));
        assert_eq!(fork.conversation_state, ConversationState::Stable);
        assert!(validate(&fork).is_stable());
        assert_eq!(fork.messages.len(), 5);
        assert_eq!(fork.messages[4].content, "first");
        assert!(fork.messages.iter().all(|m| m.chat_id == fork.id));

        let contexts = h.recovery.contexts_for(chat.id).await;
        assert_eq!(contexts[0].outcome, Some(RecoveryOutcome::Forked));

        let again = h
            .healer
            .validate_and_heal_state(chat.id)
            .await
            .expect("report");
        assert_eq!(again.status, HealStatus::Moved);
        assert_eq!(again.recovery_chat, Some(recovery_chat_id));
    }

    #[tokio::test]
    async fn fork_prefers_the_latest_checkpoint() {
        let h = harness();
        let chat = seed(&h, |id| {
            vec![
                Message::user(id, "one"),
                Message::assistant(id, "a", vec![]),
                Message::user(id, "two"),
                Message::assistant(id, "", vec![ToolCall::new("c1", "f")]),
                Message::tool(id, "c1", "x"),
                Message::assistant(id, "", vec![ToolCall::new("c1", "f")]),
            ]
        })
        .await;
        let checkpoint =
            Checkpoint::from_messages(chat.id, &chat.messages[..2]).expect("serializable");
        h.checkpoints.save(&checkpoint).await.expect("save");

        let report = h
            .healer
            .validate_and_heal_state(chat.id)
            .await
            .expect("report");
        assert_eq!(report.status, HealStatus::Forked);
        let fork = reload(&h, report.recovery_chat.expect("fork id")).await;
        assert_eq!(fork.messages.len(), 2);
        assert_eq!(fork.messages[0].content, "one");
        assert_ne!(fork.messages[0].id, chat.messages[0].id);
    }

    #[tokio::test]
    async fn corrupt_checkpoint_fork_is_kept_as_partial() {
        let h = harness();
        let chat = seed(&h, |id| {
            vec![
                Message::user(id, "go"),
                Message::assistant(id, "", vec![ToolCall::new("c1", "f")]),
                Message::tool(id, "c1", "a"),
                Message::tool(id, "c1", "b"),
            ]
        })
        .await;
        let bad_seed = vec![Message::user(chat.id, "go"), Message::tool(chat.id, "ghost", "?")];
        let checkpoint = Checkpoint::from_messages(chat.id, &bad_seed).expect("serializable");
        h.checkpoints.save(&checkpoint).await.expect("save");

        let err = h
            .healer
            .ensure_conversation_integrity(chat.id)
            .await
            .expect_err("fork seed is invalid");
        let ChatGuardError::ConversationRecovery {
            original_chat_id,
            partial,
            violations,
        } = err
        else {
            panic!("unexpected error: {err}");
        };
        assert_eq!(original_chat_id, chat.id);
        assert!(!violations.is_empty());

        let original = reload(&h, chat.id).await;
        assert_eq!(original.conversation_state, ConversationState::Error);
        assert_eq!(original.forked_into, None);

        let kept = reload(&h, partial.id).await;
        assert_eq!(kept.conversation_state, ConversationState::Error);
        assert_eq!(kept.forked_from, Some(chat.id));
        assert_eq!(kept.state_reason.as_deref(), Some(PARTIAL_FORK_REASON));
        assert_eq!(kept.messages.len(), 2);

        let contexts = h.recovery.contexts_for(chat.id).await;
        assert_eq!(contexts[0].outcome, Some(RecoveryOutcome::Failed));
    }

    #[tokio::test]
    async fn concurrent_repair_is_rejected_then_skipped() {
        let h = harness();
        let chat = seed(&h, |id| {
            vec![Message::user(id, "go"), Message::tool(id, "ghost", "?")]
        })
        .await;
        let held = h
            .recovery
            .open(chat.id, Utc::now(), chrono::Duration::seconds(120))
            .await
            .expect("hold the lock");

        let err = h
            .healer
            .repair_conversation(chat.id)
            .await
            .expect_err("lock held");
        assert!(matches!(err, ChatGuardError::AlreadyRecovering { .. }));

        let report = h
            .healer
            .validate_and_heal_state(chat.id)
            .await
            .expect("skip");
        assert_eq!(report.status, HealStatus::Skipped);

        h.recovery
            .close(held.id, RecoveryOutcome::Failed, Utc::now())
            .await
            .expect("release");
        let report = h
            .healer
            .validate_and_heal_state(chat.id)
            .await
            .expect("heal");
        assert_eq!(report.status, HealStatus::Healed);
        assert_eq!(reload(&h, chat.id).await.messages.len(), 1);
    }

    #[tokio::test]
    async fn archived_chat_is_left_alone() {
        let h = harness();
        let chat = seed(&h, |id| vec![Message::tool(id, "ghost", "?")]).await;
        h.chats.archive(chat.id, "test").await.expect("archive");
        let outcome = h
            .healer
            .ensure_conversation_integrity(chat.id)
            .await
            .expect("ensure");
        assert_eq!(outcome, IntegrityOutcome::Archived);
        assert_eq!(reload(&h, chat.id).await.messages.len(), 1);
    }

    #[tokio::test]
    async fn unknown_chat_is_not_found() {
        let h = harness();
        let err = h
            .healer
            .ensure_conversation_integrity(Uuid::now_v7())
            .await
            .expect_err("missing");
        assert!(matches!(err, ChatGuardError::ChatNotFound(_)));
    }

    #[tokio::test]
    async fn periodic_checkpoint_fires_on_turn_multiples() {
        let h = harness();
        let mut config = GuardConfig::default();
        config.checkpoint_every_turns = 2;
        let healer = ConversationHealer::new(h.healer.stores().clone(), config);
        let chat = seed(&h, |id| {
            vec![
                Message::user(id, "one"),
                Message::assistant(id, "a", vec![]),
                Message::user(id, "two"),
                Message::assistant(id, "b", vec![]),
            ]
        })
        .await;
        healer.maybe_checkpoint(&chat);
        for _ in 0..50 {
            if h.checkpoints.latest(chat.id).await.expect("latest").is_some() {
                return;
            }
            tokio::task::yield_now().await;
        }
        panic!("checkpoint was not written");
    }
}
