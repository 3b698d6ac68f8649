use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;

use crate::error::ChatGuardError;

/// Content written into synthetic tool responses inserted by repair.
pub const SYNTHETIC_TOOL_RESPONSE: &str = "cancelled";

/// Reason recorded on a chat abandoned in favour of a fork.
pub const INTEGRITY_FAILURE_REASON: &str = "conversation_integrity_failure";

/// Reason recorded on a fork that itself failed validation and was kept only
/// for operator follow-up.
pub const PARTIAL_FORK_REASON: &str = "partial_fork_failed_validation";

/// Lifecycle of a chat with respect to structural integrity.
///
/// `Stable` and `NeedsCleanup` oscillate as turns introduce and heal violations.
/// `Error` means the chat was forked away from; `Archived` is terminal.
#[derive(Debug, Serialize, Deserialize, ToSchema, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ConversationState {
    Stable,
    NeedsCleanup,
    Error,
    Archived,
}

impl ConversationState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Stable => "stable",
            Self::NeedsCleanup => "needs_cleanup",
            Self::Error => "error",
            Self::Archived => "archived",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "stable" => Some(Self::Stable),
            "needs_cleanup" => Some(Self::NeedsCleanup),
            "error" => Some(Self::Error),
            "archived" => Some(Self::Archived),
            _ => None,
        }
    }

    /// Whether `self -> next` is a legal edge. Self-loops are allowed except out of
    /// `Archived`, which accepts nothing.
    pub fn can_transition_to(self, next: Self) -> bool {
        use ConversationState::*;
        match (self, next) {
            (Archived, _) => false,
            (_, Archived) => true,
            (Stable, Stable | NeedsCleanup) => true,
            (NeedsCleanup, Stable | NeedsCleanup | Error) => true,
            (Error, Error) => true,
            _ => false,
        }
    }

    pub const ALL: [Self; 4] = [Self::Stable, Self::NeedsCleanup, Self::Error, Self::Archived];

    /// States a chat may be in for a write that leaves it in `next`.
    pub fn sources_of(next: Self) -> Vec<Self> {
        Self::ALL
            .into_iter()
            .filter(|from| from.can_transition_to(next))
            .collect()
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Archived)
    }
}

impl std::fmt::Display for ConversationState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Serialize, Deserialize, ToSchema, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum MessageRole {
    User,
    Assistant,
    Tool,
}

impl MessageRole {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Assistant => "assistant",
            Self::Tool => "tool",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "user" => Some(Self::User),
            "assistant" => Some(Self::Assistant),
            "tool" => Some(Self::Tool),
            _ => None,
        }
    }
}

/// A function invocation requested by the model inside an assistant message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct ToolCall {
    pub id: Uuid,
    /// Provider-issued correlation id, unique within a chat
    pub tool_call_id: String,
    /// Function name as requested by the model
    pub name: String,
    pub arguments: serde_json::Value,
}

impl ToolCall {
    pub fn new(tool_call_id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: Uuid::now_v7(),
            tool_call_id: tool_call_id.into(),
            name: name.into(),
            arguments: serde_json::Value::Object(Default::default()),
        }
    }

    pub fn with_arguments(mut self, arguments: serde_json::Value) -> Self {
        self.arguments = arguments;
        self
    }
}

/// One entry of a chat. Position in `Chat::messages` is the creation order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct Message {
    pub id: Uuid,
    pub chat_id: Uuid,
    pub role: MessageRole,
    pub content: String,
    /// Correlation id of the answered tool call. Only tool messages carry one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    /// Tool calls issued by an assistant message (empty for other roles)
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,
    /// True for sentinel responses inserted by repair
    #[serde(default)]
    pub synthetic: bool,
    pub created_at: DateTime<Utc>,
}

impl Message {
    fn base(chat_id: Uuid, role: MessageRole, content: impl Into<String>) -> Self {
        Self {
            id: Uuid::now_v7(),
            chat_id,
            role,
            content: content.into(),
            tool_call_id: None,
            tool_calls: Vec::new(),
            synthetic: false,
            created_at: Utc::now(),
        }
    }

    pub fn user(chat_id: Uuid, content: impl Into<String>) -> Self {
        Self::base(chat_id, MessageRole::User, content)
    }

    pub fn assistant(chat_id: Uuid, content: impl Into<String>, tool_calls: Vec<ToolCall>) -> Self {
        let mut message = Self::base(chat_id, MessageRole::Assistant, content);
        message.tool_calls = tool_calls;
        message
    }

    pub fn tool(chat_id: Uuid, tool_call_id: impl Into<String>, content: impl Into<String>) -> Self {
        let mut message = Self::base(chat_id, MessageRole::Tool, content);
        message.tool_call_id = Some(tool_call_id.into());
        message
    }

    /// Sentinel response standing in for a tool result that never arrived.
    pub fn synthetic_tool_response(chat_id: Uuid, tool_call_id: &str, at: DateTime<Utc>) -> Self {
        let mut message = Self::tool(chat_id, tool_call_id, SYNTHETIC_TOOL_RESPONSE);
        message.synthetic = true;
        message.created_at = at;
        message
    }

    /// Copy of this message re-homed into another chat with fresh ids.
    pub fn rehome(&self, chat_id: Uuid) -> Self {
        let mut copy = self.clone();
        copy.id = Uuid::now_v7();
        copy.chat_id = chat_id;
        for call in &mut copy.tool_calls {
            call.id = Uuid::now_v7();
        }
        copy
    }
}

/// A persisted exchange between a user and the agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct Chat {
    pub id: Uuid,
    pub owner_id: Uuid,
    pub organization_id: Uuid,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    pub messages: Vec<Message>,
    pub conversation_state: ConversationState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_stable_at: Option<DateTime<Utc>>,
    /// Why the chat left the active states (integrity failure, moderation)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state_reason: Option<String>,
    /// Chat this one was forked from during recovery
    #[serde(skip_serializing_if = "Option::is_none")]
    pub forked_from: Option<Uuid>,
    /// Replacement chat created when this one could not be repaired
    #[serde(skip_serializing_if = "Option::is_none")]
    pub forked_into: Option<Uuid>,
    /// Bumped by every message write; used for compare-and-set commits
    pub version: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Chat {
    pub fn new(owner_id: Uuid, organization_id: Uuid) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::now_v7(),
            owner_id,
            organization_id,
            title: None,
            messages: Vec::new(),
            conversation_state: ConversationState::Stable,
            last_stable_at: Some(now),
            state_reason: None,
            forked_from: None,
            forked_into: None,
            version: 0,
            created_at: now,
            updated_at: now,
        }
    }

    /// Move to `next`, rejecting edges the lifecycle does not allow.
    pub fn transition(&mut self, next: ConversationState) -> Result<(), ChatGuardError> {
        if !self.conversation_state.can_transition_to(next) {
            return Err(ChatGuardError::InvalidTransition {
                chat_id: self.id,
                from: self.conversation_state,
                to: next,
            });
        }
        self.conversation_state = next;
        self.updated_at = Utc::now();
        Ok(())
    }

    pub fn is_open(&self) -> bool {
        matches!(
            self.conversation_state,
            ConversationState::Stable | ConversationState::NeedsCleanup
        )
    }

    /// Number of turns, i.e. user messages.
    pub fn turn_count(&self) -> usize {
        self.messages
            .iter()
            .filter(|m| m.role == MessageRole::User)
            .count()
    }
}

/// Caller-facing tool call. The provider correlation id stays internal; `id`
/// is what a tool executor quotes back as `call_id`.
#[derive(Debug, Clone, PartialEq, Serialize, ToSchema)]
pub struct ToolCallView {
    pub id: Uuid,
    pub name: String,
    pub arguments: serde_json::Value,
}

impl From<&ToolCall> for ToolCallView {
    fn from(call: &ToolCall) -> Self {
        Self {
            id: call.id,
            name: call.name.clone(),
            arguments: call.arguments.clone(),
        }
    }
}

/// Caller-facing message, without correlation ids.
#[derive(Debug, Clone, PartialEq, Serialize, ToSchema)]
pub struct MessageView {
    pub id: Uuid,
    pub role: MessageRole,
    pub content: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCallView>,
    /// For tool messages: `id` of the tool call this answers
    #[serde(skip_serializing_if = "Option::is_none")]
    pub answers_call: Option<Uuid>,
    pub created_at: DateTime<Utc>,
}

impl From<&Message> for MessageView {
    fn from(message: &Message) -> Self {
        Self {
            id: message.id,
            role: message.role,
            content: message.content.clone(),
            tool_calls: message.tool_calls.iter().map(ToolCallView::from).collect(),
            answers_call: None,
            created_at: message.created_at,
        }
    }
}

/// Caller-facing chat.
#[derive(Debug, Clone, PartialEq, Serialize, ToSchema)]
pub struct ChatView {
    pub id: Uuid,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    pub conversation_state: ConversationState,
    pub messages: Vec<MessageView>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_stable_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub forked_from: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub forked_into: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<&Chat> for ChatView {
    fn from(chat: &Chat) -> Self {
        let calls: std::collections::HashMap<&str, Uuid> = chat
            .messages
            .iter()
            .flat_map(|m| &m.tool_calls)
            .map(|call| (call.tool_call_id.as_str(), call.id))
            .collect();
        let messages = chat
            .messages
            .iter()
            .map(|m| {
                let mut view = MessageView::from(m);
                view.answers_call = m
                    .tool_call_id
                    .as_deref()
                    .and_then(|id| calls.get(id).copied());
                view
            })
            .collect();
        Self {
            id: chat.id,
            title: chat.title.clone(),
            conversation_state: chat.conversation_state,
            messages,
            last_stable_at: chat.last_stable_at,
            forked_from: chat.forked_from,
            forked_into: chat.forked_into,
            created_at: chat.created_at,
            updated_at: chat.updated_at,
        }
    }
}
