//! One user turn end to end: moderation outcome, integrity check, provider
//! call through the breaker, atomic append, re-validation.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;

use crate::chat::{Chat, ConversationState, Message, MessageRole, MessageView};
use crate::error::ChatGuardError;
use crate::healer::{ConversationHealer, HealStatus, IntegrityOutcome};
use crate::moderation::{ModerationAction, ModerationEvent, ModerationLedger};
use crate::provider::{CompletionRequest, ProviderErrorKind};
use crate::repair::{RepairStrategy, StrategyOutcome, SynthesizeMissingResponses};
use crate::resilience::ResilientProvider;
use crate::store::{ChatStore, StateUpdate};
use crate::validator::{Violation, validate_messages};

pub const REFUSAL_MESSAGE: &str = "This message was blocked by the content policy.";

/// Classification of the user's message, produced upstream.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, ToSchema)]
pub struct ModerationVerdict {
    pub violation_type: String,
    pub action: ModerationAction,
}

#[derive(Debug, Clone)]
pub struct TurnInput {
    pub chat_id: Uuid,
    pub user_id: Uuid,
    pub content: String,
    pub moderation: Option<ModerationVerdict>,
}

/// What the caller shows the user.
#[derive(Debug, Clone, PartialEq, Serialize, ToSchema)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum TurnReply {
    Reply {
        message: MessageView,
        /// The chat was repaired before this turn ran
        healed: bool,
    },
    Refused {
        message: String,
        chat_archived: bool,
    },
    RetryLater {
        message: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        retry_after_secs: Option<u64>,
    },
    /// Continue in another chat.
    Moved {
        #[serde(skip_serializing_if = "Option::is_none")]
        recovery_chat_id: Option<Uuid>,
    },
    Archived,
}

impl TurnReply {
    fn closed(chat: &Chat) -> Option<Self> {
        match chat.conversation_state {
            ConversationState::Archived => Some(Self::Archived),
            ConversationState::Error => Some(Self::Moved {
                recovery_chat_id: chat.forked_into,
            }),
            _ => None,
        }
    }

    fn busy() -> Self {
        Self::RetryLater {
            message: "This conversation is being repaired. Please try again in a moment.".to_string(),
            retry_after_secs: Some(1),
        }
    }
}

pub struct TurnProcessor {
    chats: Arc<dyn ChatStore>,
    healer: Arc<ConversationHealer>,
    provider: Arc<ResilientProvider>,
    ledger: Arc<ModerationLedger>,
    max_commit_attempts: u32,
    max_tokens: Option<u32>,
}

impl TurnProcessor {
    pub fn new(
        healer: Arc<ConversationHealer>,
        provider: Arc<ResilientProvider>,
        ledger: Arc<ModerationLedger>,
        max_commit_attempts: u32,
    ) -> Self {
        Self {
            chats: healer.stores().chats.clone(),
            healer,
            provider,
            ledger,
            max_commit_attempts: max_commit_attempts.max(1),
            max_tokens: None,
        }
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }

    async fn load(&self, chat_id: Uuid) -> Result<Chat, ChatGuardError> {
        self.chats
            .get(chat_id)
            .await?
            .ok_or(ChatGuardError::ChatNotFound(chat_id))
    }

    pub async fn process_turn(&self, input: TurnInput) -> Result<TurnReply, ChatGuardError> {
        let chat = self.load(input.chat_id).await?;
        if let Some(reply) = TurnReply::closed(&chat) {
            return Ok(reply);
        }

        if let Some(verdict) = input.moderation {
            let (entry, decision) = self
                .ledger
                .record_and_enforce(ModerationEvent {
                    chat_id: chat.id,
                    message_id: None,
                    user_id: input.user_id,
                    organization_id: chat.organization_id,
                    violation_type: verdict.violation_type,
                    action_taken: verdict.action,
                    detected_at: None,
                })
                .await?;
            if matches!(
                entry.action_taken,
                ModerationAction::Blocked | ModerationAction::Archived
            ) {
                return Ok(TurnReply::Refused {
                    message: REFUSAL_MESSAGE.to_string(),
                    chat_archived: decision.is_some_and(|d| d.archived),
                });
            }
        }

        let healed = match self.healer.ensure_conversation_integrity(chat.id).await {
            Ok(IntegrityOutcome::Stable) => false,
            Ok(IntegrityOutcome::Healed { .. }) => true,
            Ok(IntegrityOutcome::Archived) => return Ok(TurnReply::Archived),
            Ok(IntegrityOutcome::Moved { recovery_chat_id }) => {
                return Ok(TurnReply::Moved { recovery_chat_id });
            }
            Err(ChatGuardError::UnrecoverableCorruption {
                recovery_chat_id, ..
            }) => {
                return Ok(TurnReply::Moved {
                    recovery_chat_id: Some(recovery_chat_id),
                });
            }
            Err(ChatGuardError::AlreadyRecovering { .. }) => return Ok(TurnReply::busy()),
            Err(ChatGuardError::ConversationRecovery { .. }) => {
                return Ok(TurnReply::Moved {
                    recovery_chat_id: None,
                });
            }
            Err(err) => return Err(err),
        };

        let chat = self.load(chat.id).await?;
        let opening = close_open_turn(chat.id, &chat.messages, Message::user(chat.id, input.content));
        let healed = healed || opening.len() > 1;
        let mut history = chat.messages.clone();
        history.extend(opening.iter().cloned());
        if !validate_messages(&history).is_stable() {
            tracing::warn!(chat_id = %chat.id, "chat changed before the provider call, re-checking integrity");
            if let Err(err) = self.healer.validate_and_heal_state(chat.id).await {
                tracing::error!(chat_id = %chat.id, error = %err, "pre-call integrity check failed");
            }
            return Ok(TurnReply::busy());
        }
        let request = CompletionRequest {
            messages: history,
            max_tokens: self.max_tokens,
        };

        let response = match self.provider.call(&request).await {
            Ok(response) => response,
            Err(err) => {
                tracing::warn!(chat_id = %chat.id, kind = %err.kind, "turn failed at provider");
                if err.kind == ProviderErrorKind::InvalidResponse
                    && let Err(heal_err) = self.healer.validate_and_heal_state(chat.id).await
                {
                    tracing::error!(chat_id = %chat.id, error = %heal_err, "post-failure integrity check failed");
                }
                return Ok(TurnReply::RetryLater {
                    message: err.user_message().to_string(),
                    retry_after_secs: err.retry_after_secs,
                });
            }
        };

        let assistant = Message::assistant(chat.id, response.content, response.tool_calls);
        let mut new = opening;
        new.push(assistant.clone());
        let chat = match self.commit(chat, new).await {
            Ok(chat) => chat,
            Err(ChatGuardError::ChatClosed {
                state, forked_into, ..
            }) => {
                return Ok(match state {
                    ConversationState::Archived => TurnReply::Archived,
                    _ => TurnReply::Moved {
                        recovery_chat_id: forked_into,
                    },
                });
            }
            Err(err) => return Err(err),
        };

        if chat.conversation_state == ConversationState::NeedsCleanup {
            let report = self.healer.validate_and_heal_state(chat.id).await?;
            match report.status {
                HealStatus::Forked | HealStatus::Moved => {
                    return Ok(TurnReply::Moved {
                        recovery_chat_id: report.recovery_chat,
                    });
                }
                HealStatus::Archived => return Ok(TurnReply::Archived),
                _ => {}
            }
        } else {
            self.healer.maybe_checkpoint(&chat);
        }

        Ok(TurnReply::Reply {
            message: MessageView::from(&assistant),
            healed,
        })
    }

    /// Record the result of a tool the model asked for.
    ///
    /// Responses that would break the chat (unknown, duplicate, or arriving
    /// after their turn closed) are rejected without writing anything.
    pub async fn append_tool_response(
        &self,
        chat_id: Uuid,
        tool_call_id: &str,
        content: String,
    ) -> Result<Message, ChatGuardError> {
        let chat = self.load(chat_id).await?;
        if !chat.is_open() {
            return Err(ChatGuardError::ChatClosed {
                chat_id,
                state: chat.conversation_state,
                forked_into: chat.forked_into,
            });
        }

        let message = Message::tool(chat_id, tool_call_id, content);
        let late = validate_messages(&chat.messages)
            .into_violations()
            .into_iter()
            .filter(|v| {
                matches!(v, Violation::UnansweredToolCall { tool_call_id: id, .. } if id == tool_call_id)
            });
        let mut combined = chat.messages.clone();
        combined.push(message.clone());
        let offending: Vec<Violation> = validate_messages(&combined)
            .into_violations()
            .into_iter()
            .filter(|v| v.message_id() == message.id)
            .chain(late)
            .collect();
        if !offending.is_empty() {
            tracing::info!(chat_id = %chat_id, violations = offending.len(), "tool response rejected");
            return Err(ChatGuardError::StructuralViolation {
                chat_id,
                violations: offending,
            });
        }

        self.commit(chat, vec![message.clone()]).await?;
        Ok(message)
    }

    /// Append `new` under the version check, reloading on conflicts.
    async fn commit(&self, mut chat: Chat, new: Vec<Message>) -> Result<Chat, ChatGuardError> {
        let chat_id = chat.id;
        for attempt in 1..=self.max_commit_attempts {
            let mut combined = chat.messages.clone();
            combined.extend(new.iter().cloned());
            let update = if validate_messages(&combined).is_stable() {
                StateUpdate::stable(Utc::now())
            } else {
                StateUpdate::needs_cleanup()
            };

            match self
                .chats
                .append_messages(chat_id, chat.version, &new, update)
                .await
            {
                Ok(version) => {
                    chat.messages = combined;
                    chat.version = version;
                    chat.conversation_state = update.state;
                    return Ok(chat);
                }
                Err(ChatGuardError::ConcurrentModification { .. }) => {
                    tracing::debug!(chat_id = %chat_id, attempt, "append raced another writer, reloading");
                    chat = self.load(chat_id).await?;
                    if !chat.is_open() {
                        return Err(ChatGuardError::ChatClosed {
                            chat_id,
                            state: chat.conversation_state,
                            forked_into: chat.forked_into,
                        });
                    }
                }
                Err(err) => return Err(err),
            }
        }
        Err(ChatGuardError::ConcurrentModification {
            chat_id,
            expected_version: chat.version,
        })
    }
}

/// Messages that open a new turn with `user_message`. Calls left unanswered in
/// the turn it closes get the cancellation sentinel first, so the history sent
/// to the provider never carries a dangling call.
fn close_open_turn(chat_id: Uuid, stored: &[Message], user_message: Message) -> Vec<Message> {
    let turn_start = stored
        .iter()
        .rposition(|m| m.role == MessageRole::User)
        .map_or(0, |idx| idx + 1);
    let open_turn: HashSet<Uuid> = stored[turn_start..].iter().map(|m| m.id).collect();

    let mut history = stored.to_vec();
    history.push(user_message.clone());
    let pending: Vec<Violation> = validate_messages(&history)
        .into_violations()
        .into_iter()
        .filter(|v| {
            matches!(v, Violation::UnansweredToolCall { message_id, .. } if open_turn.contains(message_id))
        })
        .collect();
    if pending.is_empty() {
        return vec![user_message];
    }

    match SynthesizeMissingResponses.apply(chat_id, &history, &pending) {
        StrategyOutcome::Healed { mut messages, actions } => {
            tracing::info!(chat_id = %chat_id, synthesized = actions.len(), "closed open turn with cancelled tool responses");
            messages.split_off(stored.len())
        }
        StrategyOutcome::Unchanged => vec![user_message],
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use chrono::Duration as ChronoDuration;

    use super::*;
    use crate::breaker::{BreakerSettings, CircuitBreaker};
    use crate::chat::{SYNTHETIC_TOOL_RESPONSE, ToolCall};
    use crate::config::GuardConfig;
    use crate::provider::CompletionResponse;
    use crate::provider::testing::ScriptedProvider;
    use crate::store::Stores;

    struct Harness {
        stores: Stores,
        processor: TurnProcessor,
        provider: Arc<ScriptedProvider>,
    }

    fn harness(script: Vec<Result<CompletionResponse, crate::provider::ProviderError>>) -> Harness {
        let stores = Stores::in_memory();
        let config = GuardConfig::default();
        let provider = Arc::new(ScriptedProvider::new(script));
        let breaker = Arc::new(CircuitBreaker::new("scripted", BreakerSettings::default()));
        let resilient = Arc::new(
            ResilientProvider::new(provider.clone(), breaker, Duration::from_millis(200), 0),
        );
        let healer = Arc::new(ConversationHealer::new(stores.clone(), config.clone()));
        let ledger = Arc::new(ModerationLedger::new(
            stores.chats.clone(),
            stores.moderation.clone(),
            2,
            ChronoDuration::days(7),
        ));
        Harness {
            processor: TurnProcessor::new(healer, resilient, ledger, config.max_recovery_attempts),
            stores,
            provider,
        }
    }

    async fn new_chat(h: &Harness, messages: impl FnOnce(Uuid) -> Vec<Message>) -> Chat {
        let mut chat = Chat::new(Uuid::now_v7(), Uuid::now_v7());
        chat.messages = messages(chat.id);
        h.stores.chats.create(&chat).await.expect("create");
        chat
    }

    fn turn(chat: &Chat, content: &str) -> TurnInput {
        TurnInput {
            chat_id: chat.id,
            user_id: chat.owner_id,
            content: content.to_string(),
            moderation: None,
        }
    }

    async fn reload(h: &Harness, chat_id: Uuid) -> Chat {
        h.stores.chats.get(chat_id).await.expect("get").expect("exists")
    }

    #[tokio::test]
    async fn plain_turn_appends_user_and_assistant_atomically() {
        let h = harness(vec![ScriptedProvider::reply("hello there")]);
        let chat = new_chat(&h, |_| Vec::new()).await;
        let reply = h.processor.process_turn(turn(&chat, "hi")).await.expect("turn");
        let TurnReply::Reply { message, healed } = reply else {
            panic!("expected a reply, got {reply:?}");
        };
        assert_eq!(message.content, "hello there");
        assert!(!healed);

        let stored = reload(&h, chat.id).await;
        assert_eq!(stored.messages.len(), 2);
        assert_eq!(stored.version, 1);
        assert_eq!(stored.conversation_state, ConversationState::Stable);
    }

    #[tokio::test]
    async fn tool_call_round_trip_stays_stable() {
        let h = harness(vec![Ok(CompletionResponse {
            content: String::new(),
            tool_calls: vec![ToolCall::new("call_1", "book_flight")],
        })]);
        let chat = new_chat(&h, |_| Vec::new()).await;
        h.processor
            .process_turn(turn(&chat, "book a flight"))
            .await
            .expect("turn");
        assert_eq!(
            reload(&h, chat.id).await.conversation_state,
            ConversationState::Stable
        );

        h.processor
            .append_tool_response(chat.id, "call_1", "booked".to_string())
            .await
            .expect("tool response");
        let err = h
            .processor
            .append_tool_response(chat.id, "call_1", "again".to_string())
            .await
            .expect_err("duplicate");
        assert!(matches!(err, ChatGuardError::StructuralViolation { .. }));
        assert_eq!(reload(&h, chat.id).await.messages.len(), 3);
    }

    #[tokio::test]
    async fn unknown_and_late_tool_responses_are_rejected() {
        let h = harness(vec![]);
        let chat = new_chat(&h, |id| {
            vec![
                Message::user(id, "book a flight"),
                Message::assistant(id, "", vec![ToolCall::new("call_1", "book_flight")]),
                Message::user(id, "never mind"),
            ]
        })
        .await;
        let err = h
            .processor
            .append_tool_response(chat.id, "nope", "x".to_string())
            .await
            .expect_err("unknown");
        assert!(matches!(err, ChatGuardError::StructuralViolation { .. }));

        let err = h
            .processor
            .append_tool_response(chat.id, "call_1", "late".to_string())
            .await
            .expect_err("late");
        assert!(matches!(err, ChatGuardError::StructuralViolation { .. }));
        assert_eq!(reload(&h, chat.id).await.version, chat.version);
    }

    #[tokio::test]
    async fn broken_chat_is_healed_before_the_provider_sees_it() {
        let h = harness(vec![ScriptedProvider::reply("ok")]);
        let chat = new_chat(&h, |id| {
            vec![
                Message::user(id, "book a flight"),
                Message::assistant(id, "", vec![ToolCall::new("call_1", "book_flight")]),
                Message::user(id, "never mind"),
            ]
        })
        .await;
        let reply = h
            .processor
            .process_turn(turn(&chat, "what about trains?"))
            .await
            .expect("turn");
        assert!(matches!(reply, TurnReply::Reply { healed: true, .. }));

        let stored = reload(&h, chat.id).await;
        assert_eq!(stored.messages.len(), 6);
        assert_eq!(stored.messages[2].content, SYNTHETIC_TOOL_RESPONSE);
        assert_eq!(stored.conversation_state, ConversationState::Stable);
    }

    #[tokio::test]
    async fn abandoned_tool_call_is_cancelled_before_the_provider_call() {
        let h = harness(vec![ScriptedProvider::reply("no problem")]);
        let chat = new_chat(&h, |id| {
            vec![
                Message::user(id, "book a flight"),
                Message::assistant(id, "", vec![ToolCall::new("c1", "book_flight")]),
            ]
        })
        .await;
        let reply = h
            .processor
            .process_turn(turn(&chat, "never mind"))
            .await
            .expect("turn");
        assert!(matches!(reply, TurnReply::Reply { healed: true, .. }));

        let requests = h.provider.requests();
        assert_eq!(requests.len(), 1);
        let sent = &requests[0].messages;
        assert!(validate_messages(sent).is_stable());
        assert_eq!(sent.len(), 4);
        assert_eq!(sent[2].content, SYNTHETIC_TOOL_RESPONSE);
        assert_eq!(sent[2].tool_call_id.as_deref(), Some("c1"));
        assert_eq!(sent[3].content, "never mind");

        let stored = reload(&h, chat.id).await;
        assert_eq!(stored.messages.len(), 5);
        assert_eq!(stored.messages[2].content, SYNTHETIC_TOOL_RESPONSE);
        assert_eq!(stored.conversation_state, ConversationState::Stable);
        assert_eq!(stored.version, 1);
    }

    #[tokio::test]
    async fn answered_tool_calls_pass_through_unchanged() {
        let h = harness(vec![ScriptedProvider::reply("enjoy")]);
        let chat = new_chat(&h, |id| {
            vec![
                Message::user(id, "book a flight"),
                Message::assistant(id, "", vec![ToolCall::new("c1", "book_flight")]),
                Message::tool(id, "c1", "booked"),
            ]
        })
        .await;
        let reply = h.processor.process_turn(turn(&chat, "thanks")).await.expect("turn");
        assert!(matches!(reply, TurnReply::Reply { healed: false, .. }));
        assert_eq!(h.provider.requests()[0].messages.len(), 4);
        assert_eq!(reload(&h, chat.id).await.messages.len(), 5);
    }

    #[tokio::test]
    async fn provider_failure_leaves_chat_untouched() {
        let h = harness(vec![ScriptedProvider::fail(ProviderErrorKind::Network)]);
        let chat = new_chat(&h, |_| Vec::new()).await;
        let reply = h.processor.process_turn(turn(&chat, "hi")).await.expect("turn");
        assert!(matches!(reply, TurnReply::RetryLater { .. }));
        let stored = reload(&h, chat.id).await;
        assert!(stored.messages.is_empty());
        assert_eq!(h.provider.calls(), 1);
    }

    #[tokio::test]
    async fn blocked_messages_are_refused_and_archive_at_threshold() {
        let h = harness(vec![]);
        let chat = new_chat(&h, |_| Vec::new()).await;
        let blocked = |chat: &Chat| TurnInput {
            moderation: Some(ModerationVerdict {
                violation_type: "abuse".to_string(),
                action: ModerationAction::Blocked,
            }),
            ..turn(chat, "bad words")
        };

        let first = h.processor.process_turn(blocked(&chat)).await.expect("turn");
        assert_eq!(
            first,
            TurnReply::Refused {
                message: REFUSAL_MESSAGE.to_string(),
                chat_archived: false,
            }
        );
        let second = h.processor.process_turn(blocked(&chat)).await.expect("turn");
        assert!(matches!(second, TurnReply::Refused { chat_archived: true, .. }));
        assert_eq!(h.provider.calls(), 0);

        let after = h.processor.process_turn(turn(&chat, "hello?")).await.expect("turn");
        assert_eq!(after, TurnReply::Archived);
    }

    #[tokio::test]
    async fn unrecoverable_chat_redirects_to_its_fork() {
        let h = harness(vec![]);
        let chat = new_chat(&h, |id| {
            vec![
                Message::user(id, "go"),
                Message::assistant(id, "", vec![ToolCall::new("c1", "f")]),
                Message::tool(id, "c1", "a"),
                Message::tool(id, "c1", "b"),
            ]
        })
        .await;
        let reply = h.processor.process_turn(turn(&chat, "next")).await.expect("turn");
        let TurnReply::Moved {
            recovery_chat_id: Some(fork_id),
        } = reply
        else {
            panic!("expected redirect, got {reply:?}");
        };
        assert_eq!(h.provider.calls(), 0);
        assert_eq!(reload(&h, chat.id).await.forked_into, Some(fork_id));

        let again = h.processor.process_turn(turn(&chat, "next")).await.expect("turn");
        assert_eq!(
            again,
            TurnReply::Moved {
                recovery_chat_id: Some(fork_id)
            }
        );
    }

    #[tokio::test]
    async fn failed_recovery_closes_the_chat_without_a_destination() {
        use crate::checkpoint::Checkpoint;
        use crate::store::CheckpointStore;

        let h = harness(vec![]);
        let chat = new_chat(&h, |id| {
            vec![
                Message::user(id, "go"),
                Message::assistant(id, "", vec![ToolCall::new("c1", "f")]),
                Message::tool(id, "c1", "a"),
                Message::tool(id, "c1", "b"),
            ]
        })
        .await;
        let bad_seed = vec![Message::tool(chat.id, "ghost", "?")];
        let checkpoint = Checkpoint::from_messages(chat.id, &bad_seed).expect("serializable");
        h.stores.checkpoints.save(&checkpoint).await.expect("save");

        let reply = h.processor.process_turn(turn(&chat, "next")).await.expect("turn");
        assert_eq!(
            reply,
            TurnReply::Moved {
                recovery_chat_id: None
            }
        );
        assert_eq!(h.provider.calls(), 0);
        assert_eq!(
            reload(&h, chat.id).await.conversation_state,
            ConversationState::Error
        );
    }
}
